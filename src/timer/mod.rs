//! Tick sources for the comms stack.
//!
//! The stack needs two clocks: a fast sample tick every
//! [`SAMPLE_PERIOD_US`] that advances the physical layer, and the system
//! tick every [`SYSTEM_TICK_MS`] that runs the periodic task table. Either
//! drive them from timer interrupts through a global stack (`timer-isr`
//! feature), or from a blocking loop over a delay provider (`delay-loop`
//! feature).
//!
//! - `compute_reload_value`: runtime reload calculator
//! - `const_reload_value`: compile-time reload calculator
//! - `global_sample_tick` and `global_system_tick`: interrupt hand-off
//!   (feature `timer-isr`)
//! - `run_tick_loop`: blocking driver loop for `DelayNs` (feature `delay-loop`)
//!
//! Common settings for a 100 µs sample period:
//!
//! | CLOCK  | PRESCALER | TIMER_COUNTS |
//! |--------|-----------|--------------|
//! | 16 MHz |         8 |          200 |
//! | 16 MHz |        64 |           25 |
//! | 48 MHz |         1 |         4800 |
//! | 48 MHz |        48 |          100 |

use libm::round;

use crate::consts::OVERSAMPLES;

#[cfg(feature = "delay-loop")]
mod delay;
#[cfg_attr(feature = "delay-loop", allow(unused_imports))]
#[cfg(feature = "delay-loop")]
pub use delay::*;

#[cfg(feature = "timer-isr")]
mod isr;
#[cfg_attr(feature = "timer-isr", allow(unused_imports))]
#[cfg(feature = "timer-isr")]
pub use isr::*;

/// Line bit rate.
pub const BITS_PER_SECOND: u32 = 1_000;
/// Sample tick rate, [`OVERSAMPLES`] per bit.
pub const SAMPLES_PER_SECOND: u32 = BITS_PER_SECOND * OVERSAMPLES as u32;
/// 10 kHz == 100 µs / sample
pub const SAMPLE_PERIOD_US: u32 = 1_000_000 / SAMPLES_PER_SECOND;
/// Period of the system tick that runs the task table.
pub const SYSTEM_TICK_MS: u32 = 10;
/// 10 ms / 100 µs
pub const SAMPLES_PER_SYSTEM_TICK: u32 = SYSTEM_TICK_MS * 1_000 / SAMPLE_PERIOD_US;

const NANOSECONDS_PER_SECOND: u64 = 1_000_000_000;

/// Computes the reload (compare) value of a timer counting at
/// `f_clk / prescaler`.
///
/// # Arguments
/// - `f_clk`: timer input clock in Hz
/// - `prescaler`: timer prescaler (e.g. 8, 64, 256)
/// - `tick_us`: desired interrupt interval in microseconds
///
/// # Returns
/// - Reload value, rounded to the nearest count and saturated to `u16`
pub fn compute_reload_value(f_clk: u32, prescaler: u32, tick_us: f32) -> u16 {
    if prescaler == 0 {
        return u16::MAX;
    }
    let counts_per_second = f64::from(f_clk) / f64::from(prescaler);
    let counts = counts_per_second * f64::from(tick_us) / 1_000_000.0;
    // Float to int casts saturate.
    round(counts) as u16
}

/// Compile-time reload value calculator
///
/// Same as [`compute_reload_value`], with the interval given in nanoseconds
/// so that it stays in integer arithmetic.
pub const fn const_reload_value(f_clk: u32, prescaler: u32, tick_ns: u32) -> u16 {
    if prescaler == 0 {
        return u16::MAX;
    }
    let den = prescaler as u64 * NANOSECONDS_PER_SECOND;
    let counts = (f_clk as u64 * tick_ns as u64 + den / 2) / den;
    if counts > u16::MAX as u64 {
        u16::MAX
    } else {
        counts as u16
    }
}

/// Sample ticks in `ms` milliseconds.
pub const fn sample_ticks(ms: u32) -> u32 {
    ms * 1_000 / SAMPLE_PERIOD_US
}

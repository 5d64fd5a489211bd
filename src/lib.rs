//! # case-comms
//!
//! A portable, no_std Rust implementation of the charger case side of a
//! case to earbud comms link, where the case talks to both earbuds over
//! their charging contacts.
//!
//! The stack is layered:
//! - [`driver`]: a software modem that modulates the charger regulator to
//!   send frames and demodulates the earbuds' replies from their current
//!   draw, with the line code in [`encoding`] and the receivers in [`demod`]
//! - [`wire`]: framing, CRC8 trailers ([`crc`]), per earbud stop-and-wait
//!   acknowledgement with retransmission, and repeated broadcasts
//! - [`ccp`]: the case comms protocol messages of [`message`], and polling
//!   earbuds that answer later
//! - [`stack`] and [`sched`]: the layered context and the periodic task
//!   table that runs it
//!
//! ## Crate features
//! | Feature               | Description |
//! |-----------------------|-------------|
//! | `std`                 | Disables `#![no_std]` |
//! | `delay-loop`          | Blocking tick loop over `embedded_hal::delay::DelayNs` |
//! | `timer-isr` (default) | Interrupt hand-off through `critical_section::with` |
//! | `emulator`            | Software earbuds for running the stack without hardware |
//! | `defmt-0-3`           | Uses `defmt` logging |
//! | `log`                 | Uses `log` logging |
//!
//! ## Usage
//!
//! ```rust
//! # #[cfg(feature = "emulator")]
//! # {
//! use case_comms::Earbud;
//! use case_comms::ccp::CcpEvents;
//! use case_comms::emulator::EmulatedPhy;
//! use case_comms::message::{Battery, EarbudStatus};
//! use case_comms::stack::CommsStack;
//!
//! #[derive(Default)]
//! struct Case {
//!     level: Option<u8>,
//! }
//!
//! impl CcpEvents for Case {
//!     fn earbud_status(&mut self, _: Earbud, status: EarbudStatus) {
//!         self.level = Some(status.battery.level);
//!     }
//!     fn ack(&mut self, _: Earbud) {}
//!     fn give_up(&mut self, _: Earbud) {}
//!     fn abort(&mut self, _: Earbud) {}
//!     fn broadcast_finished(&mut self) {}
//! }
//!
//! let mut phy = EmulatedPhy::new();
//! phy.earbud_mut(Earbud::Left).set_battery(Battery::new(80, false));
//! let mut stack = CommsStack::new(phy, Case::default());
//! let mut sched = CommsStack::default_schedule();
//!
//! stack.ccp_mut().send_status_request(Earbud::Left).unwrap();
//! for _ in 0..400 {
//!     sched.run_once(&mut stack);
//! }
//! assert_eq!(stack.ccp().user().level, Some(80));
//! # }
//! ```
//!
//! On hardware, replace the emulator with a [`driver::CommsDriver`] and call
//! [`stack::CommsStack::tick`] every 100 µs, see [`timer`].
//!
//! ## Integration Notes
//!
//! - The line runs at 1 kbit/s, sampled ten times per bit
//! - The task table runs every 10 ms
//! - Only one stack instance should be active at a time in interrupt-driven mode

#![deny(
    bad_style,
    dead_code,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    unused,
    while_true,
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results
)]
#![cfg_attr(not(feature = "std"), no_std)]

#[macro_use]
mod fmt;

pub use critical_section;
pub use heapless;

pub mod ccp;
pub mod consts;
pub mod crc;
pub mod demod;
pub mod driver;
#[cfg(feature = "emulator")]
pub mod emulator;
pub mod encoding;
pub mod error;
pub mod message;
pub mod sched;
pub mod stack;
pub mod timer;
pub mod wire;

pub use error::{CcpError, DecodeError, PhyError, TxError};

/// Number of earbuds served by the case.
pub const NO_OF_EARBUDS: usize = 2;

/// One of the two earbuds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum Earbud {
    /// Left earbud.
    Left = 0,
    /// Right earbud.
    Right = 1,
}

impl Earbud {
    /// Both earbuds, left first.
    pub const ALL: [Earbud; NO_OF_EARBUDS] = [Earbud::Left, Earbud::Right];

    /// Index into per earbud arrays.
    pub const fn index(self) -> usize {
        self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_earbud_index() {
        assert_eq!(Earbud::Left.index(), 0);
        assert_eq!(Earbud::Right.index(), 1);
        for (i, earbud) in Earbud::ALL.iter().enumerate() {
            assert_eq!(earbud.index(), i);
        }
    }
}

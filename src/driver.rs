//! Charger comms physical layer.
//!
//! This module provides [`CommsDriver`], a software modem that sends octets to
//! the earbuds by switching the charger regulator between its normal, low and
//! reset levels, and listens to their replies by sampling the current drawn on
//! each earbud branch.
//!
//! The driver is independent of the actual hardware: the regulator is driven
//! through [`VregControl`] and the current senses are read through
//! [`CurrentSense`]. [`tick()`](CommsDriver::tick) must be called once per
//! sample period (see [`crate::timer`]); the line itself only changes level
//! every [`OVERSAMPLES`] ticks.
//!
//! ## Example
//!
//! ```rust
//! # use embedded_hal_mock::eh1::digital::{Mock as Pin, State as PinState, Transaction as PinTransaction};
//! use case_comms::driver::{CommsConfig, CommsDriver, PinVreg, Phy};
//! use case_comms::driver::{AdcSamples, SampleLatch};
//!
//! static SAMPLES: AdcSamples = AdcSamples::new();
//!
//! # let vreg_mod = Pin::new(&[PinTransaction::set(PinState::Low), PinTransaction::set(PinState::Low)]);
//! # let vreg_wake = Pin::new(&[PinTransaction::set(PinState::Low), PinTransaction::set(PinState::Low)]);
//! let vreg = PinVreg::new(vreg_mod, vreg_wake);
//! let mut driver = CommsDriver::new(vreg, SampleLatch::new(&SAMPLES), CommsConfig::default());
//!
//! driver.transmit(&[0x22, 0x03, 0x0f], true).unwrap();
//! assert!(driver.is_active());
//! # let (vreg, _) = driver.release();
//! # let (mut vreg_mod, mut vreg_wake) = vreg.release();
//! # vreg_mod.done();
//! # vreg_wake.done();
//! ```
//!
//! For the line code, see [`crate::encoding`]. For reply demodulation, see
//! [`crate::demod::EarbudChannel`].

use core::cell::Cell;

use critical_section::Mutex;
use embedded_hal::digital::OutputPin;
use heapless::Vec;

use crate::consts::{
    BITS_PER_OCTET, CALIBRATION_START_BIT, CHARGER_COMMS_MAX_MSG_LEN, OVERSAMPLES, VCHG_HIGH_IDX,
    VCHG_LOW_IDX, VCHG_OFF_IDX, VCHG_WAKE_IDX,
};
use crate::demod::EarbudChannel;
use crate::encoding::data_bit;
use crate::error::PhyError;
use crate::{Earbud, NO_OF_EARBUDS};

/// A frame as handed between the physical layer and the wire layer.
pub type Frame = Vec<u8, CHARGER_COMMS_MAX_MSG_LEN>;

/// Frames received in the last reply window, indexed by [`Earbud::index`].
pub type RxFrames = [Option<Frame>; NO_OF_EARBUDS];

/// The seam between the wire layer and whatever moves its frames.
pub trait Phy {
    /// Starts sending `frame`. If `expect_reply` is set the receivers are
    /// armed once the frame is out.
    fn transmit(&mut self, frame: &[u8], expect_reply: bool) -> Result<(), PhyError>;

    /// `true` while a transmission or reply window is in progress.
    fn is_active(&self) -> bool;

    /// Main-loop housekeeping between sample ticks.
    fn service(&mut self) {}

    /// Takes the frames of a completed reply window, if one completed since
    /// the last call.
    fn take_rx(&mut self) -> Option<RxFrames>;
}

/// Runtime tuning of the physical layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct CommsConfig {
    /// How long a channel may stay silent after transmission before it is
    /// considered absent.
    pub packet_reply_timeout_ms: u16,
    /// Margin added to the calibrated idle current to form the threshold.
    pub adc_threshold: u16,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            packet_reply_timeout_ms: 20,
            adc_threshold: 110,
        }
    }
}

impl CommsConfig {
    /// Reply timeout in sample ticks.
    pub fn reply_timeout_ticks(&self) -> u16 {
        self.packet_reply_timeout_ms.saturating_mul(OVERSAMPLES)
    }
}

/// State machine of the [`CommsDriver`].
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum CommsMode {
    /// Nothing in progress.
    #[default]
    Idle,
    /// Waking the earbuds and sending the sync pulse.
    StartSequence,
    /// Sending the frame, one bit per bit period.
    Transmitting,
    /// Listening to the current senses for a reply.
    Reading,
}

/// Level the regulator is being driven to.
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum VregLevel {
    /// Modulated low.
    Low,
    /// Normal output.
    #[default]
    High,
    /// Reset level, used to wake the earbuds.
    Wake,
}

/// Drives the charger regulator.
pub trait VregControl {
    /// Normal output level (a `1` on the line).
    fn vreg_high(&mut self);
    /// Modulated low level (a `0` on the line).
    fn vreg_low(&mut self);
    /// Reset level.
    fn vreg_reset(&mut self);
}

/// [`VregControl`] over two output pins.
///
/// `MOD` pulls the regulator output down while high. `WAKE` forces the
/// regulator into its reset level while high.
#[derive(Debug)]
pub struct PinVreg<MOD, WAKE>
where
    MOD: OutputPin,
    WAKE: OutputPin,
{
    modulate: MOD,
    wake: WAKE,
}

impl<MOD, WAKE> PinVreg<MOD, WAKE>
where
    MOD: OutputPin,
    WAKE: OutputPin,
{
    /// Takes both pins and drives the regulator to its normal level.
    pub fn new(modulate: MOD, wake: WAKE) -> Self {
        let mut vreg = Self { modulate, wake };
        let _ = vreg.wake.set_low();
        let _ = vreg.modulate.set_low();
        vreg
    }

    /// Gives the pins back.
    pub fn release(self) -> (MOD, WAKE) {
        (self.modulate, self.wake)
    }
}

impl<MOD, WAKE> VregControl for PinVreg<MOD, WAKE>
where
    MOD: OutputPin,
    WAKE: OutputPin,
{
    fn vreg_high(&mut self) {
        let _ = self.wake.set_low();
        let _ = self.modulate.set_low();
    }

    fn vreg_low(&mut self) {
        let _ = self.wake.set_low();
        let _ = self.modulate.set_high();
    }

    fn vreg_reset(&mut self) {
        let _ = self.wake.set_high();
    }
}

/// Source of current-sense readings.
pub trait CurrentSense {
    /// Called once per processed tick, before any reading is taken.
    fn latch(&mut self) {}
    /// Latest reading for `earbud`.
    fn current_sample(&mut self, earbud: Earbud) -> u16;
}

/// Current-sense readings published by the ADC interrupt.
///
/// Intended to live in a `static`; the interrupt calls
/// [`publish()`](AdcSamples::publish) and a [`SampleLatch`] copies both
/// channels out in one critical section.
pub struct AdcSamples {
    samples: Mutex<Cell<[u16; NO_OF_EARBUDS]>>,
}

impl core::fmt::Debug for AdcSamples {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AdcSamples").finish_non_exhaustive()
    }
}

impl Default for AdcSamples {
    fn default() -> Self {
        Self::new()
    }
}

impl AdcSamples {
    /// Both channels read zero.
    pub const fn new() -> Self {
        Self {
            samples: Mutex::new(Cell::new([0; NO_OF_EARBUDS])),
        }
    }

    /// Stores a new reading for one channel.
    pub fn publish(&self, earbud: Earbud, value: u16) {
        critical_section::with(|cs| {
            let cell = self.samples.borrow(cs);
            let mut samples = cell.get();
            samples[earbud.index()] = value;
            cell.set(samples);
        });
    }

    /// Stores new readings for both channels at once.
    pub fn publish_all(&self, left: u16, right: u16) {
        critical_section::with(|cs| {
            let mut samples = [0; NO_OF_EARBUDS];
            samples[Earbud::Left.index()] = left;
            samples[Earbud::Right.index()] = right;
            self.samples.borrow(cs).set(samples);
        });
    }

    fn snapshot(&self) -> [u16; NO_OF_EARBUDS] {
        critical_section::with(|cs| self.samples.borrow(cs).get())
    }
}

/// Consumer side of [`AdcSamples`]: a copy taken once per tick, so both
/// channels of a tick come from the same conversion.
#[derive(Debug, Clone)]
pub struct SampleLatch<'a> {
    source: &'a AdcSamples,
    latched: [u16; NO_OF_EARBUDS],
}

impl<'a> SampleLatch<'a> {
    /// Creates a latch reading from `source`.
    pub fn new(source: &'a AdcSamples) -> Self {
        Self {
            source,
            latched: [0; NO_OF_EARBUDS],
        }
    }
}

impl CurrentSense for SampleLatch<'_> {
    fn latch(&mut self) {
        self.latched = self.source.snapshot();
    }

    fn current_sample(&mut self, earbud: Earbud) -> u16 {
        self.latched[earbud.index()]
    }
}

/// Software modem for the charger comms link.
///
/// ## Transmission
///
/// A transmission starts with a wake pulse at reset level, then holds the
/// line high for 5 bit periods and low for 4 as a sync signal. Every octet is
/// then sent as a forced transition followed by its 8 data bits, LSB first. A
/// `1` is the normal level, a `0` the modulated low level.
///
/// While the frame goes out, the current drawn by each earbud is averaged to
/// calibrate its receive threshold.
///
/// ## Reception
///
/// If a reply is expected, every tick after the frame feeds both current
/// senses into their [`EarbudChannel`]. The reply window closes once both
/// channels finished or timed out, which raises the completion flag read
/// through [`Phy::take_rx`].
///
/// ## Notes
///
/// - [`read_headers()`](CommsDriver::read_headers) must be called from the
///   main loop while a reply is coming in, so that the window can close as
///   soon as the announced length was received.
/// - Only one transmission is handled at a time.
#[derive(Debug)]
pub struct CommsDriver<V, S>
where
    V: VregControl,
    S: CurrentSense,
{
    mode: CommsMode,
    vreg: V,
    vreg_level: VregLevel,
    sense: S,
    config: CommsConfig,
    channels: [EarbudChannel; NO_OF_EARBUDS],
    tx_buf: [u8; CHARGER_COMMS_MAX_MSG_LEN],
    num_tx_bits: u16,
    expect_reply: bool,
    start_idx: u16,
    bit_idx: u16,
    write_idx: u16,
    timer_idx: u32,
    complete: bool,
    /// Frames sent since start-up.
    pub tx_good: u16,
    /// Reply windows in which at least one channel received something.
    pub rx_good: u16,
}

impl<V, S> CommsDriver<V, S>
where
    V: VregControl,
    S: CurrentSense,
{
    /// Creates an idle driver and drives the regulator to its normal level.
    pub fn new(vreg: V, sense: S, config: CommsConfig) -> Self {
        let mut driver = Self {
            mode: CommsMode::Idle,
            vreg,
            vreg_level: VregLevel::High,
            sense,
            config,
            channels: [EarbudChannel::new(), EarbudChannel::new()],
            tx_buf: [0; CHARGER_COMMS_MAX_MSG_LEN],
            num_tx_bits: 0,
            expect_reply: false,
            start_idx: 0,
            bit_idx: 0,
            write_idx: 0,
            timer_idx: 0,
            complete: false,
            tx_good: 0,
            rx_good: 0,
        };
        driver.vreg.vreg_high();
        driver
    }

    /// Gives back the regulator control and the current sense.
    pub fn release(self) -> (V, S) {
        (self.vreg, self.sense)
    }

    /// Current mode.
    pub fn mode(&self) -> CommsMode {
        self.mode
    }

    /// Level the regulator was last driven to.
    pub fn vreg_level(&self) -> VregLevel {
        self.vreg_level
    }

    /// Demodulation state of `earbud`.
    pub fn channel(&self, earbud: Earbud) -> &EarbudChannel {
        &self.channels[earbud.index()]
    }

    /// Mutable access to the current sense, mainly for tests.
    pub fn sense_mut(&mut self) -> &mut S {
        &mut self.sense
    }

    /// Mutable access to the regulator control.
    pub fn vreg_mut(&mut self) -> &mut V {
        &mut self.vreg
    }

    fn vreg_high(&mut self) {
        self.vreg_level = VregLevel::High;
        self.vreg.vreg_high();
    }

    fn vreg_low(&mut self) {
        self.vreg_level = VregLevel::Low;
        self.vreg.vreg_low();
    }

    fn vreg_reset(&mut self) {
        self.vreg_level = VregLevel::Wake;
        self.vreg.vreg_reset();
    }

    fn drive(&mut self, high: bool) {
        if high {
            self.vreg_high();
        } else {
            self.vreg_low();
        }
    }

    fn finish(&mut self) {
        self.mode = CommsMode::Idle;
        self.complete = true;
    }

    /// Advances the state machine by one sample.
    ///
    /// Outside a reply window only every [`OVERSAMPLES`]-th call does
    /// anything.
    pub fn tick(&mut self) {
        self.timer_idx = self.timer_idx.wrapping_add(1);

        if self.mode != CommsMode::Reading && self.timer_idx % u32::from(OVERSAMPLES) != 0 {
            return;
        }

        match self.mode {
            CommsMode::Idle => {}
            CommsMode::StartSequence => {
                match self.start_idx {
                    VCHG_WAKE_IDX => self.vreg_reset(),
                    VCHG_OFF_IDX => self.vreg_high(),
                    VCHG_HIGH_IDX => self.vreg_low(),
                    VCHG_LOW_IDX => self.mode = CommsMode::Transmitting,
                    _ => {}
                }
                self.start_idx += 1;
            }
            CommsMode::Transmitting => self.transmit_bit(),
            CommsMode::Reading => self.read_sample(),
        }
    }

    fn transmit_bit(&mut self) {
        if self.bit_idx >= CALIBRATION_START_BIT {
            self.sense.latch();
            for earbud in Earbud::ALL {
                let sample = self.sense.current_sample(earbud);
                self.channels[earbud.index()].calibrate(sample);
            }
        }

        if self.write_idx == self.num_tx_bits {
            let margin = self.config.adc_threshold;
            for channel in &mut self.channels {
                channel.finish_calibration(margin);
            }
            self.vreg_high();
            self.write_idx += 1;
            self.tx_good = self.tx_good.wrapping_add(1);

            if self.expect_reply {
                self.mode = CommsMode::Reading;
            } else {
                self.finish();
            }
            return;
        }

        if self.bit_idx % BITS_PER_OCTET == 0 {
            // Start bit: always a transition.
            let high = self.vreg_level != VregLevel::High;
            self.drive(high);
        } else {
            // write_idx < num_tx_bits keeps this inside tx_buf.
            let bit = data_bit(&self.tx_buf, self.write_idx).unwrap_or_default();
            self.drive(bit);
            self.write_idx += 1;
        }
        self.bit_idx += 1;
    }

    fn read_sample(&mut self) {
        self.sense.latch();
        let mut active = [false; NO_OF_EARBUDS];
        for earbud in Earbud::ALL {
            let sample = self.sense.current_sample(earbud);
            active[earbud.index()] = self.channels[earbud.index()].process(sample);
        }

        let timeout = self.config.reply_timeout_ticks();
        let [left, right] = &self.channels;
        let [left_active, right_active] = active;
        let left_gone = left.wait() > timeout;
        let right_gone = right.wait() > timeout;

        if (!left_active && !right_active)
            || (left_gone && right_gone)
            || (left_gone && !right_active)
            || (!left_active && right_gone)
        {
            for channel in &mut self.channels {
                channel.complete();
            }
            if self.channels.iter().any(EarbudChannel::data_valid) {
                self.rx_good = self.rx_good.wrapping_add(1);
            }
            self.finish();
        }
    }

    /// `true` if a reply header is complete on any channel.
    pub fn should_read_header(&self) -> bool {
        self.channels.iter().any(EarbudChannel::reading_header)
    }

    /// Decodes every pending reply header so the reply window can shrink to
    /// the announced length.
    pub fn read_headers(&mut self) {
        for earbud in Earbud::ALL {
            let channel = &mut self.channels[earbud.index()];
            if channel.reading_header() {
                let header = channel.read_header();
                trace!("{:?} header {}", earbud, header);
            }
        }
    }

    /// Demodulates whatever `earbud` sent in the last reply window.
    ///
    /// Returns `None` if the channel captured nothing. The frame is cut to the
    /// length announced in its header.
    pub fn fetch_rx_data(&self, earbud: Earbud) -> Option<Frame> {
        let channel = &self.channels[earbud.index()];
        if !channel.data_valid() {
            return None;
        }
        let (buf, report) = channel.fetch_rx_data();
        if let Some(fault) = report.fault() {
            debug!("{:?} demodulation stopped: {}", earbud, fault);
        }
        let len = usize::from(channel.num_rx_octets()).min(CHARGER_COMMS_MAX_MSG_LEN);
        Vec::from_slice(&buf[..len]).ok()
    }

    /// Logs a snapshot of the driver state.
    pub fn log_state(&self) {
        debug!(
            "state:{:?} start_idx:{} write_idx:{} bit_idx:{} time:{}",
            self.mode,
            self.start_idx,
            self.write_idx,
            self.bit_idx,
            self.timer_idx
        );
        for earbud in Earbud::ALL {
            let ch = &self.channels[earbud.index()];
            debug!(
                "{:?} all_idx:{} edges:{} valid:{} wait:{} adc_thres:{}",
                earbud,
                ch.all_idx(),
                ch.edges().len(),
                ch.data_valid(),
                ch.wait(),
                ch.threshold()
            );
        }
    }
}

impl<V, S> Phy for CommsDriver<V, S>
where
    V: VregControl,
    S: CurrentSense,
{
    fn transmit(&mut self, frame: &[u8], expect_reply: bool) -> Result<(), PhyError> {
        if frame.len() > CHARGER_COMMS_MAX_MSG_LEN {
            return Err(PhyError::FrameTooLong { len: frame.len() });
        }
        if self.mode != CommsMode::Idle {
            return Err(PhyError::Busy);
        }

        debug!("WIRE->COMMS {:?}", frame);
        self.tx_buf[..frame.len()].copy_from_slice(frame);
        self.num_tx_bits = (frame.len() * 8) as u16;
        self.expect_reply = expect_reply;
        self.write_idx = 0;
        self.bit_idx = 0;
        self.timer_idx = 0;
        self.start_idx = 0;
        self.complete = false;
        for channel in &mut self.channels {
            channel.reset();
        }
        self.mode = CommsMode::StartSequence;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.mode != CommsMode::Idle
    }

    fn service(&mut self) {
        if self.should_read_header() {
            self.read_headers();
        }
    }

    fn take_rx(&mut self) -> Option<RxFrames> {
        if !core::mem::take(&mut self.complete) {
            return None;
        }
        let frames = [
            self.fetch_rx_data(Earbud::Left),
            self.fetch_rx_data(Earbud::Right),
        ];
        if frames.iter().all(Option::is_none) {
            return None;
        }
        Some(frames)
    }
}

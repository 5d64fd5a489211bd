//! Per-earbud demodulator for current-sense replies.
//!
//! While the case is listening, every sample tick feeds the instantaneous
//! current reading of each earbud branch into its [`EarbudChannel`]. The
//! channel does not keep samples, only the sample index of every crossing of
//! its adaptive threshold. Octets are rebuilt from those timestamps later, in
//! the main loop, by [`crate::encoding::demodulate`].

use heapless::Vec;

use crate::consts::{
    BITS_PER_OCTET, CHARGER_COMMS_MAX_MSG_LEN, DEFAULT_ADC_THRESHOLD, EDGE_BUF_LEN,
    HEADER_READ_IDX, MAX_REPLY_END_IDX, OVERSAMPLES, REPLY_GUARD_BITS, WIRE_HDR_MASK_LENGTH,
};
use crate::encoding::{Demodulated, demodulate};

/// Demodulation state for one earbud branch.
#[derive(Debug, Clone)]
pub struct EarbudChannel {
    all_idx: u16,
    end_idx: u16,
    started: bool,
    data_valid: bool,
    previous: u16,
    edges: Vec<u16, EDGE_BUF_LEN>,
    wait: u16,
    reading_header: bool,
    num_rx_octets: u8,
    adc_thres: u16,
    adc_cal_cnt: u16,
    adc_calibrate: u32,
}

impl Default for EarbudChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl EarbudChannel {
    /// Creates an idle channel using the uncalibrated threshold.
    pub const fn new() -> Self {
        Self {
            all_idx: 0,
            end_idx: 0,
            started: false,
            data_valid: false,
            previous: 0,
            edges: Vec::new(),
            wait: 0,
            reading_header: false,
            num_rx_octets: 0,
            adc_thres: DEFAULT_ADC_THRESHOLD,
            adc_cal_cnt: 0,
            adc_calibrate: 0,
        }
    }

    /// Clears all state ahead of a new transmission.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Accumulates a calibration reading taken while the case transmits.
    ///
    /// Zero readings mean no earbud is drawing current and are ignored.
    pub fn calibrate(&mut self, sample: u16) {
        if sample != 0 {
            self.adc_calibrate += u32::from(sample);
            self.adc_cal_cnt = self.adc_cal_cnt.saturating_add(1);
        }
    }

    /// Sets the threshold to the calibration mean plus `margin` and arms the
    /// channel for the longest possible reply.
    pub fn finish_calibration(&mut self, margin: u16) {
        if self.adc_cal_cnt != 0 {
            let mean = self.adc_calibrate / u32::from(self.adc_cal_cnt);
            self.adc_thres = (mean as u16).saturating_add(margin);
        }
        self.end_idx = MAX_REPLY_END_IDX;
    }

    /// Feeds one sample, returning `false` once the channel stopped listening.
    pub fn process(&mut self, this: u16) -> bool {
        if self.all_idx >= self.end_idx {
            return false;
        }

        if self.all_idx == HEADER_READ_IDX {
            self.reading_header = true;
        }

        if !self.started {
            if this > self.adc_thres {
                self.started = true;
                self.edges.clear();
                self.previous = 0;
            }
            self.wait = self.wait.saturating_add(1);
            return true;
        }

        let thres = self.adc_thres;
        let rising = this > thres && self.previous <= thres;
        let falling = this < thres && self.previous >= thres;
        if (rising || falling) && self.edges.push(self.all_idx).is_err() {
            trace!("Edge buffer full");
        }
        self.previous = this;
        self.all_idx += 1;
        true
    }

    /// Decodes the header octet and shortens the listening window to the
    /// length it announces.
    pub fn read_header(&mut self) -> u8 {
        let (buf, _) = demodulate(&self.edges);
        let octets = (buf[0] & WIRE_HDR_MASK_LENGTH) + 1;
        self.num_rx_octets = octets;
        self.end_idx = (u16::from(octets) * BITS_PER_OCTET + REPLY_GUARD_BITS) * OVERSAMPLES;
        self.reading_header = false;
        buf[0]
    }

    /// Demodulates everything captured so far.
    pub fn fetch_rx_data(&self) -> ([u8; CHARGER_COMMS_MAX_MSG_LEN], Demodulated) {
        demodulate(&self.edges)
    }

    /// Latches whether anything was received. Called when the reply window closes.
    pub fn complete(&mut self) {
        self.data_valid = !self.edges.is_empty();
    }

    /// `true` until the listening window has elapsed.
    pub fn is_active(&self) -> bool {
        self.all_idx < self.end_idx
    }

    /// `true` if the header octet is complete and waiting to be decoded.
    pub fn reading_header(&self) -> bool {
        self.reading_header
    }

    /// `true` if the last reply window captured at least one edge.
    pub fn data_valid(&self) -> bool {
        self.data_valid
    }

    /// Sample ticks spent waiting for the reply to start.
    pub fn wait(&self) -> u16 {
        self.wait
    }

    /// Octet count announced by the header, or zero before it was read.
    pub fn num_rx_octets(&self) -> u8 {
        self.num_rx_octets
    }

    /// Current detection threshold.
    pub fn threshold(&self) -> u16 {
        self.adc_thres
    }

    /// Captured edge timestamps.
    pub fn edges(&self) -> &[u16] {
        &self.edges
    }

    /// Sample index relative to the first high sample.
    pub fn all_idx(&self) -> u16 {
        self.all_idx
    }

    /// Sample index at which the channel stops listening.
    pub fn end_idx(&self) -> u16 {
        self.end_idx
    }
}

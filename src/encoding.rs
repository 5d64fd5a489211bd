//! Line coding for charger comms.
//!
//! Octets travel LSB first using NRZ-L (a `1` bit is the high level, a `0`
//! bit the low level). Each octet is preceded by a start bit which is always a
//! transition, so a receiver sees at least one edge every
//! [`BITS_PER_OCTET`] bit periods even when the data is a long run of
//! identical bits.
//!
//! ## Functions
//!
//! - [`data_bit`]: the level of a data bit of a frame, for the transmitter
//! - [`process_bits`]: rebuilds octets from a list of edge timestamps
//! - [`demodulate`]: [`process_bits`] with the framing used by earbud replies
//! - [`reply_edges`]: the edge timestamps a receiver records for a reply
//!
//! ## Edge timestamps
//!
//! The receiver does not keep samples, only the sample index of every
//! threshold crossing. In a reply the first edge (index 0) is the rise out of
//! idle, the second (index 1) is the start bit of the header octet. Gaps
//! between edges are rounded to the nearest bit period, which tolerates up to
//! a little under half a bit period of accumulated jitter per gap.

use heapless::Vec;

use crate::consts::{BITS_PER_OCTET, CHARGER_COMMS_MAX_BITS, CHARGER_COMMS_MAX_MSG_LEN, OVERSAMPLES};
use crate::error::DecodeError;

/// Maximum number of anomalies kept in a [`Demodulated`] report.
pub const MAX_DECODE_ERRORS: usize = 4;

/// Outcome of a [`process_bits`] run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Demodulated {
    /// Number of bits written into the output buffer, padding included.
    pub bits: u16,
    /// Anomalies seen while decoding, oldest first.
    pub errors: Vec<DecodeError, MAX_DECODE_ERRORS>,
}

impl Demodulated {
    /// `true` if no anomaly at all was seen.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// The anomaly that stopped decoding, if any.
    pub fn fault(&self) -> Option<DecodeError> {
        self.errors.iter().copied().find(|e| !e.is_recoverable())
    }

    fn note(&mut self, err: DecodeError) {
        // Keep the first few; a fault is always the last one pushed.
        if self.errors.is_full() && !err.is_recoverable() {
            let _ = self.errors.pop();
        }
        let _ = self.errors.push(err);
    }
}

/// Returns the level of data bit `bit` of `frame` (LSB of octet 0 first), or
/// `None` past the end of `frame`.
pub fn data_bit(frame: &[u8], bit: u16) -> Option<bool> {
    frame
        .get(usize::from(bit / 8))
        .map(|octet| (octet >> (bit % 8)) & 0x1 != 0)
}

/// Number of whole bit periods between two sample indexes, rounded to nearest.
fn bit_periods(a: u16, b: u16) -> u16 {
    (a.abs_diff(b) + OVERSAMPLES / 2) / OVERSAMPLES
}

fn push_bit(buf: &mut [u8; CHARGER_COMMS_MAX_MSG_LEN], pos: u16, level: bool) {
    let octet = &mut buf[(pos / 8) as usize];
    *octet = (*octet >> 1) | if level { 0x80 } else { 0x00 };
}

/// Reconstructs bits from the edge timestamps `edges` into `buf`.
///
/// # Arguments
/// - `edges`: sample indexes of successive level changes
/// - `start_idx`: first edge whose gap to its predecessor carries data
/// - `stop_start_time`: sample index of the current start bit
/// - `ignore_idx`: the edge whose gap contains a start bit to discard
/// - `buf`: receives the bits, LSB first within each octet
///
/// The level before edge `start_idx` is taken to be low and alternates on
/// every edge. Every edge 9 bit periods after the current start bit becomes
/// the next start bit, and one bit is removed from the gap that follows it.
/// After the last edge the buffer is filled up with the final level.
pub fn process_bits(
    edges: &[u16],
    start_idx: usize,
    mut stop_start_time: u16,
    mut ignore_idx: usize,
    buf: &mut [u8; CHARGER_COMMS_MAX_MSG_LEN],
) -> Demodulated {
    let mut report = Demodulated::default();
    let mut level = true;
    let mut ignore_bits = false;
    let mut bit_pos: u16 = 0;

    for i in start_idx.max(1)..edges.len() {
        // Nine bit periods since the last start bit: this edge is the next one.
        if bit_periods(edges[i], stop_start_time) == BITS_PER_OCTET {
            stop_start_time = edges[i];
            ignore_bits = i == ignore_idx;
            ignore_idx = i + 1;
        }

        let mut conseq_bits = bit_periods(edges[i], edges[i - 1]);
        level = !level;

        if conseq_bits == 0 {
            trace!("Zero bit");
            report.note(DecodeError::ZeroWidthGap { edge: i as u16 });
            continue;
        }

        if i == ignore_idx || ignore_bits {
            conseq_bits -= 1;
            ignore_bits = false;
        }

        if conseq_bits > 8 {
            debug!("Missing start bit");
            report.note(DecodeError::MissingStartBit { edge: i as u16 });
            report.bits = bit_pos;
            return report;
        }

        for _ in 0..conseq_bits {
            if bit_pos == CHARGER_COMMS_MAX_BITS {
                debug!("Unexpected number of bits");
                report.note(DecodeError::BitOverflow);
                report.bits = bit_pos;
                return report;
            }
            push_bit(buf, bit_pos, level);
            bit_pos += 1;
        }
    }

    level = !level;
    while bit_pos < CHARGER_COMMS_MAX_BITS {
        push_bit(buf, bit_pos, level);
        bit_pos += 1;
    }
    report.bits = bit_pos;
    report
}

/// Demodulates an earbud reply from its edge timestamps.
///
/// Returns the decoded octets (zero filled before decoding) and the report.
pub fn demodulate(edges: &[u16]) -> ([u8; CHARGER_COMMS_MAX_MSG_LEN], Demodulated) {
    let mut buf = [0u8; CHARGER_COMMS_MAX_MSG_LEN];
    let first_start = edges.get(1).copied().unwrap_or(0);
    let report = process_bits(edges, 2, first_start, 2, &mut buf);
    (buf, report)
}

/// Produces the edge timestamps of `frame` as recorded by a receiver whose
/// first edge is at sample index `t0`.
///
/// The line rises at `t0`, stays high for one bit period and falls into the
/// start bit of the first octet. Returns `None` if `frame` is longer than a
/// frame can be, if the last edge would not fit in a `u16` sample index, or
/// if `out` runs out of room.
pub fn reply_edges<const N: usize>(frame: &[u8], t0: u16, out: &mut Vec<u16, N>) -> Option<()> {
    out.clear();
    if frame.len() > CHARGER_COMMS_MAX_MSG_LEN {
        return None;
    }
    let octet_period = BITS_PER_OCTET * OVERSAMPLES;
    let first_start = t0.checked_add(OVERSAMPLES)?;
    // Fits: at most 16 octets.
    let span = octet_period * frame.len() as u16;
    let _ = first_start.checked_add(span)?;

    out.push(t0).ok()?;
    out.push(first_start).ok()?;
    let mut level = false;

    for (k, &octet) in frame.iter().enumerate() {
        let start = first_start + octet_period * k as u16;
        if k > 0 {
            level = !level;
            out.push(start).ok()?;
        }
        for j in 0..8u16 {
            let bit = (octet >> j) & 0x1 != 0;
            if bit != level {
                out.push(start + OVERSAMPLES * (j + 1)).ok()?;
                level = bit;
            }
        }
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::EDGE_BUF_LEN;
    use proptest::prelude::*;

    fn edges_of(frame: &[u8]) -> Vec<u16, EDGE_BUF_LEN> {
        let mut edges = Vec::new();
        reply_edges(frame, 0, &mut edges).unwrap();
        edges
    }

    #[test]
    fn test_data_bit_is_lsb_first() {
        let frame = [0x01, 0x80];
        assert_eq!(data_bit(&frame, 0), Some(true));
        assert_eq!(data_bit(&frame, 1), Some(false));
        assert_eq!(data_bit(&frame, 8), Some(false));
        assert_eq!(data_bit(&frame, 15), Some(true));
        assert_eq!(data_bit(&frame, 16), None);
        assert_eq!(data_bit(&[], 0), None);
    }

    #[test]
    fn test_reply_edges_for_status_request() {
        let edges = edges_of(&[0x22, 0x03, 0x0f]);
        assert_eq!(edges.as_slice(), &[0, 10, 30, 40, 70, 80, 100, 130, 190, 240]);
    }

    #[test]
    fn test_reply_edges_out_of_range() {
        let mut edges: Vec<u16, EDGE_BUF_LEN> = Vec::new();
        assert_eq!(reply_edges(&[0u8; 17], 0, &mut edges), None);
        assert_eq!(reply_edges(&[0x22], u16::MAX - 5, &mut edges), None);
        assert_eq!(reply_edges(&[0x22, 0x03], u16::MAX - 100, &mut edges), None);
        assert!(edges.is_empty());

        // Two octets end 190 samples after t0.
        assert_eq!(reply_edges(&[0x22, 0x03], u16::MAX - 200, &mut edges), Some(()));
        assert_eq!(edges[0], u16::MAX - 200);
    }

    #[test]
    fn test_process_bits_three_byte_frame() {
        let (buf, report) = demodulate(&[0, 10, 30, 40, 70, 80, 100, 130, 190, 240]);
        assert_eq!(&buf[..3], &[0x22, 0x03, 0x0f]);
        assert!(report.is_clean());
        assert_eq!(report.bits, CHARGER_COMMS_MAX_BITS);
    }

    #[test]
    fn test_process_bits_tolerates_jitter() {
        let mut edges = edges_of(&[0x84, 0x01, 0x00]);
        for (n, e) in edges.iter_mut().enumerate().skip(1) {
            *e = if n % 2 == 0 { *e + 2 } else { *e - 2 };
        }
        let (buf, report) = demodulate(&edges);
        assert_eq!(&buf[..3], &[0x84, 0x01, 0x00]);
        assert!(report.is_clean());
    }

    #[test]
    fn test_process_bits_runs_of_identical_octets() {
        let (buf, _) = demodulate(&edges_of(&[0x00, 0x00, 0xff]));
        assert_eq!(&buf[..3], &[0x00, 0x00, 0xff]);
    }

    #[test]
    fn test_zero_width_gap_is_skipped() {
        // A glitch two samples after an edge toggles the level twice.
        let mut edges: Vec<u16, 16> = Vec::new();
        edges.extend_from_slice(&[0, 10, 30, 31, 40]).unwrap();
        let mut buf = [0u8; CHARGER_COMMS_MAX_MSG_LEN];
        let report = process_bits(&edges, 2, 10, 2, &mut buf);
        assert_eq!(report.errors.as_slice(), &[DecodeError::ZeroWidthGap { edge: 3 }]);
        assert!(report.fault().is_none());
        assert_eq!(report.bits, CHARGER_COMMS_MAX_BITS);
    }

    #[test]
    fn test_missing_start_bit_stops_decoding() {
        // 12 bit periods without a single edge.
        let (_, report) = demodulate(&[0, 10, 140]);
        assert_eq!(report.fault(), Some(DecodeError::MissingStartBit { edge: 2 }));
        assert_eq!(report.bits, 0);
    }

    #[test]
    fn test_empty_edge_list_pads_low() {
        let (buf, report) = demodulate(&[]);
        assert_eq!(buf, [0u8; CHARGER_COMMS_MAX_MSG_LEN]);
        assert!(report.is_clean());
    }

    proptest! {
        #[test]
        fn prop_reply_edges_demodulate_back(frame in proptest::collection::vec(any::<u8>(), 1..=16)) {
            let (buf, report) = demodulate(&edges_of(&frame));
            prop_assert!(report.is_clean());
            prop_assert_eq!(&buf[..frame.len()], frame.as_slice());
        }
    }
}

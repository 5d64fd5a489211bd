//! Constants used across the charger comms protocol stack.
//!
//! This module defines the timing, framing and retry constants shared by the
//! physical layer ([`crate::driver`]), the wire layer ([`crate::wire`]) and the
//! case comms protocol ([`crate::ccp`]).
//!
//! ## Key Concepts
//!
//! - **Oversampling**: the current senses are sampled [`OVERSAMPLES`] times per
//!   bit period, while the control line only changes level once per bit period.
//! - **Framing**: every octet on the line is preceded by a forced transition
//!   (the start bit), so one octet occupies [`BITS_PER_OCTET`] bit periods.
//! - **Frame size**: a frame is a one-octet header, up to
//!   [`WIRE_MAX_PAYLOAD_LEN`] payload octets and a CRC8 trailer, at most
//!   [`CHARGER_COMMS_MAX_MSG_LEN`] octets in total.
//! - **Ticks**: wire and CCP timeouts count system ticks (calls to their
//!   `periodic` functions), the physical layer counts sample ticks.

/// Number of ADC samples taken per bit period to detect edges.
pub const OVERSAMPLES: u16 = 10;

/// Bit periods used to carry one octet: a start transition and 8 data bits.
pub const BITS_PER_OCTET: u16 = 9;

/// The maximum length of a charger comms message (including header and CRC) in octets.
pub const CHARGER_COMMS_MAX_MSG_LEN: usize = 16;

/// The maximum length of a charger comms payload in octets.
pub const CHARGER_COMMS_MAX_PAYLOAD_LEN: usize = CHARGER_COMMS_MAX_MSG_LEN - 1;

/// Number of bits the demodulator can reconstruct in one frame.
pub const CHARGER_COMMS_MAX_BITS: u16 = (CHARGER_COMMS_MAX_MSG_LEN * 8) as u16;

/// Capacity of a channel's edge timestamp buffer.
pub const EDGE_BUF_LEN: usize = 512;

/// Start sequence index at which the regulator is driven to its reset level.
pub const VCHG_WAKE_IDX: u16 = 0;
/// Start sequence index at which the regulator is released to its normal (high) level.
pub const VCHG_OFF_IDX: u16 = 10;
/// Bit periods the line stays high during the start sequence.
pub const VCHG_HIGH_TIME: u16 = 5;
/// Bit periods the line stays low (sync) before the first octet.
pub const VCHG_LOW_TIME: u16 = 4;
/// Start sequence index at which the line is driven low.
pub const VCHG_HIGH_IDX: u16 = VCHG_OFF_IDX + VCHG_HIGH_TIME;
/// Start sequence index at which data transmission begins.
pub const VCHG_LOW_IDX: u16 = VCHG_HIGH_IDX + VCHG_LOW_TIME;

/// Bit period from which ADC readings feed the threshold calibration.
pub const CALIBRATION_START_BIT: u16 = 5;

/// Threshold used before a channel has been calibrated.
pub const DEFAULT_ADC_THRESHOLD: u16 = 400;

/// Sample index (relative to the first edge) after which the header octet is complete.
pub const HEADER_READ_IDX: u16 = 10 * OVERSAMPLES;

/// Extra bit periods allowed on top of the octets of a reply before a channel stops listening.
pub const REPLY_GUARD_BITS: u16 = 15;

/// Worst-case sample index at which a maximum length reply ends.
pub const MAX_REPLY_END_IDX: u16 =
    (CHARGER_COMMS_MAX_MSG_LEN as u16 * BITS_PER_OCTET + REPLY_GUARD_BITS) * OVERSAMPLES;

/// Number of octets in a frame that belong to the wire layer (header and CRC).
pub const WIRE_NO_OF_BYTES: usize = 2;

/// The maximum payload of a single wire frame.
pub const WIRE_MAX_PAYLOAD_LEN: usize = CHARGER_COMMS_MAX_MSG_LEN - WIRE_NO_OF_BYTES;

/// Time in ticks for which we wait for a response.
pub const WIRE_NO_RESPONSE_TIMEOUT: u8 = 200;

/// Number of retries made before giving up.
pub const WIRE_MAX_RETRIES: u8 = 2;

/// Number of times each broadcast message is sent.
pub const WIRE_BROADCAST_SENDS: u8 = 3;

/// Time in ticks between successive broadcast transmissions.
pub const WIRE_BROADCAST_TIMEOUT: u8 = 10;

/// Wire header: sequence number bit.
pub const WIRE_HDR_MASK_SN: u8 = 0x80;
/// Wire header: next expected sequence number bit.
pub const WIRE_HDR_MASK_NESN: u8 = 0x40;
/// Wire header: destination field.
pub const WIRE_HDR_MASK_DEST: u8 = 0x30;
/// Shift of the destination field.
pub const WIRE_HDR_BIT_DEST: u8 = 4;
/// Wire header: length field (`payload length + 1`).
pub const WIRE_HDR_MASK_LENGTH: u8 = 0x0F;

/// Time in ticks between CCP polls.
pub const CCP_POLL_TIMEOUT: u8 = 50;

/// Maximum number of CCP polls before giving up.
pub const CCP_MAX_POLLS: u8 = 5;

/// Largest CCP message (header plus data) accepted for sending.
pub const CCP_MAX_MSG_SIZE: usize = 20;

/// CCP header: channel field.
pub const CCP_HDR_MASK_CHAN_ID: u8 = 0x70;
/// Shift of the CCP channel field.
pub const CCP_HDR_BIT_CHAN_ID: u8 = 4;
/// CCP header: message id field.
pub const CCP_HDR_MASK_MSG_ID: u8 = 0x0F;

/// Status byte: lid open.
pub const CCP_STATUS_1_MASK_L: u8 = 0x01;
/// Status byte: charger connected.
pub const CCP_STATUS_1_MASK_CC: u8 = 0x02;

/// Battery byte: charging flag.
pub const CCP_BATTERY_MASK_C: u8 = 0x80;
/// Battery byte: level in percent.
pub const CCP_BATTERY_MASK_LEVEL: u8 = 0x7F;

/// Reset message: factory reset flag.
pub const CCP_RESET_MASK_R: u8 = 0x01;

/// Earbud status: primary/peer flag.
pub const CCP_EARBUD_STATUS_MASK_PP: u8 = 0x01;

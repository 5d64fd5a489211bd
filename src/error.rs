//! Error types returned by the layers of the stack.
//!
//! None of these are fatal: a rejected request leaves all state untouched and
//! may simply be retried on a later tick.

use crate::Earbud;

/// Errors raised by the physical layer when a transmission is requested.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum PhyError {
    /// The frame does not fit the hardware envelope.
    #[error("frame of {len} octets exceeds the charger comms maximum")]
    FrameTooLong {
        /// Requested frame length in octets.
        len: usize,
    },
    /// A charger comms transaction is still in progress.
    #[error("charger comms is busy")]
    Busy,
}

/// Errors returned when the wire or CCP layer refuses to send.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum TxError {
    /// The payload does not fit in a single frame.
    #[error("payload of {len} octets does not fit in a frame")]
    TooLong {
        /// Requested payload length in octets.
        len: usize,
    },
    /// The physical layer is transmitting or waiting for a reply.
    #[error("medium busy")]
    MediumBusy,
    /// A broadcast is still being repeated.
    #[error("broadcast in progress")]
    BroadcastPending,
    /// The earbud already has an unacknowledged frame outstanding.
    #[error("{0:?} has a frame outstanding")]
    PeerBusy(Earbud),
    /// The earbud is still expected to answer an earlier CCP request.
    #[error("{0:?} has not answered yet")]
    AwaitingAnswer(Earbud),
    /// Frames cannot be addressed to the case itself.
    #[error("invalid destination")]
    InvalidDestination,
    /// The physical layer rejected the frame.
    #[error("phy: {0}")]
    Phy(#[from] PhyError),
}

/// Errors raised while decoding a received CCP message.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum CcpError {
    /// No CCP header present.
    #[error("empty message")]
    Empty,
    /// The message is shorter than its type requires.
    #[error("message truncated at {len} octets")]
    Truncated {
        /// Received length including the CCP header.
        len: usize,
    },
    /// The channel id is not one the case understands.
    #[error("unknown channel {0}")]
    UnknownChannel(u8),
    /// The message id is not valid on its channel.
    #[error("unknown message {0}")]
    UnknownMessage(u8),
}

/// Anomalies detected while reconstructing bits from edge timestamps.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum DecodeError {
    /// Two edges closer than half a bit period. The edge is skipped and
    /// decoding continues.
    #[error("zero bit gap at edge {edge}")]
    ZeroWidthGap {
        /// Index of the offending edge.
        edge: u16,
    },
    /// More than 8 identical bits between two edges, so a start transition
    /// was lost. Decoding stops.
    #[error("missing start bit at edge {edge}")]
    MissingStartBit {
        /// Index of the offending edge.
        edge: u16,
    },
    /// More bits than fit in a maximum length frame. Decoding stops.
    #[error("unexpected number of bits")]
    BitOverflow,
}

impl DecodeError {
    /// Whether decoding carries on after this anomaly.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DecodeError::ZeroWidthGap { .. })
    }
}

//! CCP message vocabulary.
//!
//! A message is a one octet header followed by a message specific body:
//!
//! | bits | field |
//! |------|-------|
//! | 7    | reserved |
//! | 6..4 | [`Channel`] |
//! | 3..0 | [`MessageId`] |

use heapless::Vec;

use crate::consts::{
    CCP_BATTERY_MASK_C, CCP_BATTERY_MASK_LEVEL, CCP_EARBUD_STATUS_MASK_PP, CCP_HDR_BIT_CHAN_ID,
    CCP_HDR_MASK_CHAN_ID, CCP_HDR_MASK_MSG_ID, CCP_MAX_MSG_SIZE, CCP_RESET_MASK_R,
    CCP_STATUS_1_MASK_CC, CCP_STATUS_1_MASK_L,
};
use crate::error::CcpError;

/// Logical channel of a CCP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
#[repr(u8)]
pub enum Channel {
    /// Case and earbud status.
    CaseInfo = 0,
    /// Device test service.
    Dts = 1,
}

impl TryFrom<u8> for Channel {
    type Error = CcpError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            0 => Ok(Channel::CaseInfo),
            1 => Ok(Channel::Dts),
            _ => Err(CcpError::UnknownChannel(id)),
        }
    }
}

/// Message id within [`Channel::CaseInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
#[repr(u8)]
pub enum MessageId {
    /// Case status, short or full.
    Status = 0,
    /// Earbud status, sent by an earbud.
    EarbudStatus = 1,
    /// Reset an earbud.
    Reset = 2,
    /// Ask an earbud for its status.
    StatusReq = 3,
}

impl TryFrom<u8> for MessageId {
    type Error = CcpError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            0 => Ok(MessageId::Status),
            1 => Ok(MessageId::EarbudStatus),
            2 => Ok(MessageId::Reset),
            3 => Ok(MessageId::StatusReq),
            _ => Err(CcpError::UnknownMessage(id)),
        }
    }
}

/// Battery level in percent and charging flag, packed into one octet.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct Battery {
    /// Level, only the low 7 bits are sent.
    pub level: u8,
    /// Whether the battery is charging.
    pub charging: bool,
}

impl Battery {
    /// Creates a battery reading.
    pub const fn new(level: u8, charging: bool) -> Self {
        Self { level, charging }
    }

    /// Wire representation.
    pub fn to_octet(self) -> u8 {
        let mut octet = self.level & CCP_BATTERY_MASK_LEVEL;
        if self.charging {
            octet |= CCP_BATTERY_MASK_C;
        }
        octet
    }

    /// Parses the wire representation.
    pub fn from_octet(octet: u8) -> Self {
        Self {
            level: octet & CCP_BATTERY_MASK_LEVEL,
            charging: octet & CCP_BATTERY_MASK_C != 0,
        }
    }
}

/// Everything carried by a full case status broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct CaseStatus {
    /// Lid open.
    pub lid: bool,
    /// Charger plugged into the case.
    pub charger_connected: bool,
    /// Case battery.
    pub case: Battery,
    /// Left earbud battery as last known by the case.
    pub left: Battery,
    /// Right earbud battery as last known by the case.
    pub right: Battery,
}

/// Status reported by an earbud.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct EarbudStatus {
    /// Peer pairing flag.
    pub peer_pairing: bool,
    /// Earbud battery.
    pub battery: Battery,
}

/// A decoded CCP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum CcpMessage {
    /// Lid and charger state only.
    ShortStatus {
        /// Lid open.
        lid: bool,
        /// Charger plugged in.
        charger_connected: bool,
    },
    /// Full case status.
    Status(CaseStatus),
    /// Status of the sending earbud.
    EarbudStatus(EarbudStatus),
    /// Reset request.
    Reset {
        /// Factory reset rather than a plain reboot.
        factory: bool,
    },
    /// Request for an [`CcpMessage::EarbudStatus`] answer.
    StatusRequest,
}

fn status_octet(lid: bool, charger_connected: bool) -> u8 {
    let mut octet = 0;
    if lid {
        octet |= CCP_STATUS_1_MASK_L;
    }
    if charger_connected {
        octet |= CCP_STATUS_1_MASK_CC;
    }
    octet
}

/// Builds a CCP header octet.
pub fn header(channel: Channel, id: MessageId) -> u8 {
    (((channel as u8) << CCP_HDR_BIT_CHAN_ID) & CCP_HDR_MASK_CHAN_ID)
        | ((id as u8) & CCP_HDR_MASK_MSG_ID)
}

impl CcpMessage {
    /// Message id of this message.
    pub fn id(&self) -> MessageId {
        match self {
            CcpMessage::ShortStatus { .. } | CcpMessage::Status(_) => MessageId::Status,
            CcpMessage::EarbudStatus(_) => MessageId::EarbudStatus,
            CcpMessage::Reset { .. } => MessageId::Reset,
            CcpMessage::StatusRequest => MessageId::StatusReq,
        }
    }

    /// Channel this message travels on.
    pub fn channel(&self) -> Channel {
        Channel::CaseInfo
    }

    /// Encodes header and body.
    pub fn encode(&self) -> Vec<u8, CCP_MAX_MSG_SIZE> {
        let mut body = [0u8; 4];
        let len = match *self {
            CcpMessage::ShortStatus {
                lid,
                charger_connected,
            } => {
                body[0] = status_octet(lid, charger_connected);
                1
            }
            CcpMessage::Status(s) => {
                body = [
                    status_octet(s.lid, s.charger_connected),
                    s.case.to_octet(),
                    s.left.to_octet(),
                    s.right.to_octet(),
                ];
                4
            }
            CcpMessage::EarbudStatus(s) => {
                body[0] = u8::from(s.peer_pairing) & CCP_EARBUD_STATUS_MASK_PP;
                body[1] = s.battery.to_octet();
                2
            }
            CcpMessage::Reset { factory } => {
                body[0] = u8::from(factory) & CCP_RESET_MASK_R;
                1
            }
            CcpMessage::StatusRequest => 0,
        };

        let mut out = Vec::new();
        // Five octets at most, well within capacity.
        let _ = out.push(header(self.channel(), self.id()));
        let _ = out.extend_from_slice(&body[..len]);
        out
    }

    /// Decodes a message, header included.
    pub fn decode(data: &[u8]) -> Result<Self, CcpError> {
        let (&hdr, body) = data.split_first().ok_or(CcpError::Empty)?;
        let channel = Channel::try_from((hdr & CCP_HDR_MASK_CHAN_ID) >> CCP_HDR_BIT_CHAN_ID)?;
        let id = hdr & CCP_HDR_MASK_MSG_ID;
        let truncated = CcpError::Truncated { len: data.len() };

        if channel == Channel::Dts {
            return Err(CcpError::UnknownMessage(id));
        }

        match MessageId::try_from(id)? {
            MessageId::Status => match *body {
                [s, case, left, right, ..] => Ok(CcpMessage::Status(CaseStatus {
                    lid: s & CCP_STATUS_1_MASK_L != 0,
                    charger_connected: s & CCP_STATUS_1_MASK_CC != 0,
                    case: Battery::from_octet(case),
                    left: Battery::from_octet(left),
                    right: Battery::from_octet(right),
                })),
                [s] => Ok(CcpMessage::ShortStatus {
                    lid: s & CCP_STATUS_1_MASK_L != 0,
                    charger_connected: s & CCP_STATUS_1_MASK_CC != 0,
                }),
                _ => Err(truncated),
            },
            MessageId::EarbudStatus => match *body {
                [pp, battery, ..] => Ok(CcpMessage::EarbudStatus(EarbudStatus {
                    peer_pairing: pp & CCP_EARBUD_STATUS_MASK_PP != 0,
                    battery: Battery::from_octet(battery),
                })),
                _ => Err(truncated),
            },
            MessageId::Reset => body
                .first()
                .map(|&r| CcpMessage::Reset {
                    factory: r & CCP_RESET_MASK_R != 0,
                })
                .ok_or(truncated),
            MessageId::StatusReq => Ok(CcpMessage::StatusRequest),
        }
    }
}

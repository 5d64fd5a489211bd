//! Software earbuds for running the stack without hardware.
//!
//! [`EmulatedPhy`] stands in for the physical layer. Every unicast frame it
//! is asked to send is answered on the spot by a [`FakeEarbud`] which follows
//! the earbud side of the wire protocol. A status request is acknowledged
//! first and answered a few polls later, the way real earbuds defer their
//! answer.
//!
//! Each earbud has two 16 bit fault patterns, indexed by a counter that
//! advances with every frame it receives: a set bit in the NACK pattern makes
//! it refuse that frame, a set bit in the corrupt pattern makes it mangle its
//! reply so the checksum fails.

use heapless::Vec;

use crate::consts::{
    CCP_HDR_MASK_MSG_ID, CHARGER_COMMS_MAX_MSG_LEN, WIRE_HDR_MASK_NESN, WIRE_HDR_MASK_SN,
};
use crate::crc::crc8;
use crate::driver::{Frame, Phy, RxFrames};
use crate::error::PhyError;
use crate::message::{Battery, CcpMessage, EarbudStatus, MessageId};
use crate::wire::{WireDest, header};
use crate::{Earbud, NO_OF_EARBUDS};

/// Polls a fake earbud lets pass before it answers a status request.
pub const STATUS_DELAY_POLLS: u8 = 3;

/// Earbud side of one wire link.
#[derive(Debug, Default, Clone)]
pub struct FakeEarbud {
    sn: bool,
    nesn: bool,
    nack_pattern: u16,
    corrupt_pattern: u16,
    pattern_ctr: u8,
    rsp_later: u8,
    battery: Battery,
    received: u32,
}

impl FakeEarbud {
    /// Sets the frames to refuse, bit `n` standing for the `n`th of every 16.
    pub fn set_nack_pattern(&mut self, pattern: u16) {
        self.nack_pattern = pattern;
    }

    /// Sets the replies to corrupt, bit `n` standing for the `n`th of every 16.
    pub fn set_corrupt_pattern(&mut self, pattern: u16) {
        self.corrupt_pattern = pattern;
    }

    /// Sets the battery reported in status answers.
    pub fn set_battery(&mut self, battery: Battery) {
        self.battery = battery;
    }

    /// Frames received, broadcasts excluded.
    pub fn received(&self) -> u32 {
        self.received
    }

    fn resync(&mut self) {
        self.sn = false;
        self.nesn = false;
    }

    fn pattern_bit(&self, pattern: u16) -> bool {
        (pattern >> self.pattern_ctr) & 0x1 != 0
    }

    /// Handles a frame addressed to this earbud and builds the reply.
    fn respond(&mut self, frame: &[u8]) -> Frame {
        let pkt_sn = frame[0] & WIRE_HDR_MASK_SN != 0;
        let pkt_nesn = frame[0] & WIRE_HDR_MASK_NESN != 0;
        let mut payload: Vec<u8, CHARGER_COMMS_MAX_MSG_LEN> = Vec::new();
        self.received = self.received.wrapping_add(1);

        if self.pattern_bit(self.nack_pattern) {
            // NESN left alone.
            debug!("NACK response");
        } else {
            if pkt_sn == self.nesn {
                self.nesn = !self.nesn;
            }
            if pkt_nesn != self.sn {
                self.sn = !self.sn;
            }

            if frame.len() < 3 {
                // Poll or ACK.
                if self.rsp_later > 0 {
                    self.rsp_later -= 1;
                    if self.rsp_later == 0 {
                        let status = CcpMessage::EarbudStatus(EarbudStatus {
                            peer_pairing: false,
                            battery: self.battery,
                        });
                        payload = Vec::from_slice(&status.encode()).unwrap_or_default();
                    }
                }
            } else if frame[1] & CCP_HDR_MASK_MSG_ID == MessageId::StatusReq as u8 {
                self.rsp_later = STATUS_DELAY_POLLS;
            }
        }

        let mut reply = Frame::new();
        // At most a header, a status answer and the checksum.
        let _ = reply.push(header(self.sn, self.nesn, WireDest::Case, payload.len()));
        let _ = reply.extend_from_slice(&payload);
        let _ = reply.push(crc8(&reply));

        if self.pattern_bit(self.corrupt_pattern) {
            debug!("Corrupt response");
            reply[0] ^= 0xff;
        }

        self.pattern_ctr = (self.pattern_ctr + 1) & 0xf;
        reply
    }
}

/// A physical layer whose far end is a pair of [`FakeEarbud`]s.
#[derive(Debug, Default)]
pub struct EmulatedPhy {
    earbuds: [FakeEarbud; NO_OF_EARBUDS],
    rx: RxFrames,
    transmissions: u32,
}

impl EmulatedPhy {
    /// Two earbuds without any fault injected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Emulation state of `earbud`.
    pub fn earbud(&self, earbud: Earbud) -> &FakeEarbud {
        &self.earbuds[earbud.index()]
    }

    /// Mutable emulation state of `earbud`, to set patterns and battery.
    pub fn earbud_mut(&mut self, earbud: Earbud) -> &mut FakeEarbud {
        &mut self.earbuds[earbud.index()]
    }

    /// Frames sent since creation, broadcasts included.
    pub fn transmissions(&self) -> u32 {
        self.transmissions
    }
}

impl Phy for EmulatedPhy {
    fn transmit(&mut self, frame: &[u8], expect_reply: bool) -> Result<(), PhyError> {
        if frame.len() > CHARGER_COMMS_MAX_MSG_LEN {
            return Err(PhyError::FrameTooLong { len: frame.len() });
        }
        let Some(&hdr) = frame.first() else {
            return Ok(());
        };

        debug!("WIRE->COMMS {:?}", frame);
        self.transmissions = self.transmissions.wrapping_add(1);
        match WireDest::from_header(hdr) {
            WireDest::Broadcast => self.earbuds.iter_mut().for_each(FakeEarbud::resync),
            dest => {
                if let Some(earbud) = dest.earbud() {
                    let reply = self.earbuds[earbud.index()].respond(frame);
                    if expect_reply {
                        self.rx[earbud.index()] = Some(reply);
                    }
                }
            }
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        false
    }

    fn take_rx(&mut self) -> Option<RxFrames> {
        if self.rx.iter().all(Option::is_none) {
            return None;
        }
        Some(core::mem::take(&mut self.rx))
    }
}

//! Case comms protocol (CCP) layer.
//!
//! Sits on top of [`Wire`] and speaks [`CcpMessage`]s. Requests that need an
//! answer keep the earbud busy: once the wire layer reports a bare ACK the
//! layer polls the earbud every [`CCP_POLL_TIMEOUT`] ticks, up to
//! [`CCP_MAX_POLLS`] times, until the answer arrives.

use crate::consts::{CCP_MAX_MSG_SIZE, CCP_MAX_POLLS, CCP_POLL_TIMEOUT};
use crate::driver::Phy;
use crate::error::TxError;
use crate::message::{CaseStatus, CcpMessage, EarbudStatus};
use crate::wire::{Wire, WireDest, WireEvents};
use crate::{Earbud, NO_OF_EARBUDS};

/// Notifications the CCP layer raises towards the case application.
pub trait CcpEvents {
    /// An earbud reported its status.
    fn earbud_status(&mut self, earbud: Earbud, status: EarbudStatus);
    /// A message that needs no answer was acknowledged.
    fn ack(&mut self, earbud: Earbud);
    /// A message could not be delivered or was never answered.
    fn give_up(&mut self, earbud: Earbud);
    /// A message was dropped in favour of a broadcast.
    fn abort(&mut self, earbud: Earbud);
    /// A broadcast finished.
    fn broadcast_finished(&mut self);
}

#[derive(Debug, Default, Clone, Copy)]
struct CcpTransaction {
    busy: bool,
    poll_timeout: u8,
    poll_count: u8,
}

/// CCP state that receives the wire layer's events.
#[derive(Debug)]
pub struct CcpState<U> {
    user: U,
    transactions: [CcpTransaction; NO_OF_EARBUDS],
}

impl<U: CcpEvents> WireEvents for CcpState<U> {
    fn rx(&mut self, earbud: Earbud, data: &[u8]) {
        debug!("WIRE->CCP {:?}", data);
        match CcpMessage::decode(data) {
            Ok(CcpMessage::EarbudStatus(status)) => self.user.earbud_status(earbud, status),
            Ok(msg) => debug!("{:?} unexpected {:?}", earbud, msg),
            Err(e) => warn!("{:?} dropped: {}", earbud, e),
        }
        self.transactions[earbud.index()].busy = false;
    }

    fn ack(&mut self, earbud: Earbud) {
        let ct = &mut self.transactions[earbud.index()];
        if ct.busy {
            // Only acknowledged so far, poll for the answer.
            ct.poll_timeout = CCP_POLL_TIMEOUT;
        } else {
            self.user.ack(earbud);
        }
    }

    fn give_up(&mut self, earbud: Earbud) {
        self.user.give_up(earbud);
        self.transactions[earbud.index()].busy = false;
    }

    fn abort(&mut self, earbud: Earbud) {
        self.user.abort(earbud);
        self.transactions[earbud.index()].busy = false;
    }

    fn broadcast_finished(&mut self) {
        self.user.broadcast_finished();
    }
}

/// The CCP layer, owning the wire layer and the application's event sink.
#[derive(Debug)]
pub struct Ccp<P: Phy, U: CcpEvents> {
    wire: Wire<P>,
    state: CcpState<U>,
}

impl<P: Phy, U: CcpEvents> Ccp<P, U> {
    /// Creates the layer on top of `phy`, reporting to `user`.
    pub fn new(phy: P, user: U) -> Self {
        Self {
            wire: Wire::new(phy),
            state: CcpState {
                user,
                transactions: Default::default(),
            },
        }
    }

    /// The wire layer.
    pub fn wire(&self) -> &Wire<P> {
        &self.wire
    }

    /// Mutable access to the wire layer, used to feed received frames.
    pub fn wire_mut(&mut self) -> &mut Wire<P> {
        &mut self.wire
    }

    /// The application's event sink.
    pub fn user(&self) -> &U {
        &self.state.user
    }

    /// Mutable access to the application's event sink.
    pub fn user_mut(&mut self) -> &mut U {
        &mut self.state.user
    }

    /// `true` while `earbud` still owes an answer.
    pub fn is_busy(&self, earbud: Earbud) -> bool {
        self.state.transactions[earbud.index()].busy
    }

    /// Sends `msg` to `dest`.
    ///
    /// With `need_answer` the earbud stays busy until it answers, the layer
    /// gives up or a broadcast aborts the exchange.
    pub fn send(
        &mut self,
        dest: WireDest,
        msg: &CcpMessage,
        need_answer: bool,
    ) -> Result<(), TxError> {
        let buf = msg.encode();
        if buf.len() + 1 > CCP_MAX_MSG_SIZE {
            return Err(TxError::TooLong { len: buf.len() });
        }

        if dest == WireDest::Broadcast {
            return self.wire.tx(dest, &buf, &mut self.state);
        }

        let earbud = dest.earbud().ok_or(TxError::InvalidDestination)?;
        if self.is_busy(earbud) {
            return Err(TxError::AwaitingAnswer(earbud));
        }
        self.wire.tx(dest, &buf, &mut self.state)?;
        if need_answer {
            self.state.transactions[earbud.index()] = CcpTransaction {
                busy: true,
                poll_timeout: 0,
                poll_count: 0,
            };
        }
        Ok(())
    }

    /// Broadcasts the lid and charger state.
    pub fn send_short_status(
        &mut self,
        lid: bool,
        charger_connected: bool,
    ) -> Result<(), TxError> {
        let msg = CcpMessage::ShortStatus {
            lid,
            charger_connected,
        };
        self.send(WireDest::Broadcast, &msg, false)
    }

    /// Broadcasts the full case status.
    pub fn send_full_status(&mut self, status: CaseStatus) -> Result<(), TxError> {
        self.send(WireDest::Broadcast, &CcpMessage::Status(status), false)
    }

    /// Asks `earbud` for its status.
    pub fn send_status_request(&mut self, earbud: Earbud) -> Result<(), TxError> {
        self.send(earbud.into(), &CcpMessage::StatusRequest, true)
    }

    /// Asks `earbud` to reset.
    pub fn send_reset(&mut self, earbud: Earbud, factory: bool) -> Result<(), TxError> {
        self.send(earbud.into(), &CcpMessage::Reset { factory }, false)
    }

    fn manage_transaction(&mut self, earbud: Earbud) {
        let ct = &mut self.state.transactions[earbud.index()];
        if !ct.busy || ct.poll_timeout == 0 {
            return;
        }

        ct.poll_timeout -= 1;
        if ct.poll_timeout != 0 {
            return;
        }

        if ct.poll_count < CCP_MAX_POLLS {
            let polled = self.wire.tx(earbud.into(), &[], &mut self.state);
            let ct = &mut self.state.transactions[earbud.index()];
            match polled {
                Ok(()) => {
                    ct.poll_timeout = CCP_POLL_TIMEOUT;
                    ct.poll_count += 1;
                }
                Err(e) => {
                    // Wire or phy busy: try again on the next tick.
                    trace!("{:?} poll deferred: {}", earbud, e);
                    ct.poll_timeout = 1;
                }
            }
        } else {
            info!("{:?} never answered", earbud);
            self.state.give_up(earbud);
        }
    }

    /// Runs the poll timers for one system tick.
    pub fn periodic(&mut self) {
        for earbud in Earbud::ALL {
            self.manage_transaction(earbud);
        }
    }

    /// Runs the wire layer for one system tick.
    pub fn wire_periodic(&mut self) {
        self.wire.periodic(&mut self.state);
    }
}

//! Wire layer: framing and stop-and-wait delivery.
//!
//! Every frame is `[header][payload...][crc8]`. The header carries a 1-bit
//! sequence number (`SN`), the next sequence number expected from the peer
//! (`NESN`), the destination and the payload length plus one. Each earbud has
//! at most one unacknowledged frame outstanding.
//!
//! A peer acknowledges a frame by toggling its `NESN` in the next frame it
//! sends. Leaving it unchanged is a NACK. A frame with a bad checksum, or no
//! answer at all, leads to a retransmission of the stored frame up to
//! [`WIRE_MAX_RETRIES`] times. Persistent NACKs mean both ends lost sequence
//! sync, so the layer resets everything with an empty broadcast and tries
//! once more before giving up.
//!
//! Broadcasts are never acknowledged. They are repeated
//! [`WIRE_BROADCAST_SENDS`] times and abort any unicast exchange in progress.

use crate::consts::{
    CHARGER_COMMS_MAX_MSG_LEN, WIRE_BROADCAST_SENDS, WIRE_BROADCAST_TIMEOUT, WIRE_HDR_BIT_DEST,
    WIRE_HDR_MASK_DEST, WIRE_HDR_MASK_LENGTH, WIRE_HDR_MASK_NESN, WIRE_HDR_MASK_SN,
    WIRE_MAX_PAYLOAD_LEN, WIRE_MAX_RETRIES, WIRE_NO_OF_BYTES, WIRE_NO_RESPONSE_TIMEOUT,
};
use crate::crc::{crc8, verify8};
use crate::driver::{Frame, Phy};
use crate::error::{PhyError, TxError};
use crate::{Earbud, NO_OF_EARBUDS};

/// Destination field of a wire header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
#[repr(u8)]
pub enum WireDest {
    /// The case (used by earbud replies).
    Case = 0,
    /// Right earbud.
    Right = 1,
    /// Left earbud.
    Left = 2,
    /// Both earbuds, unacknowledged.
    Broadcast = 3,
}

impl From<Earbud> for WireDest {
    fn from(earbud: Earbud) -> Self {
        match earbud {
            Earbud::Left => WireDest::Left,
            Earbud::Right => WireDest::Right,
        }
    }
}

impl WireDest {
    /// Decodes the destination field of `header`.
    pub fn from_header(header: u8) -> Self {
        match (header & WIRE_HDR_MASK_DEST) >> WIRE_HDR_BIT_DEST {
            0 => WireDest::Case,
            1 => WireDest::Right,
            2 => WireDest::Left,
            _ => WireDest::Broadcast,
        }
    }

    /// The earbud addressed, if this is a unicast destination.
    pub fn earbud(self) -> Option<Earbud> {
        match self {
            WireDest::Left => Some(Earbud::Left),
            WireDest::Right => Some(Earbud::Right),
            WireDest::Case | WireDest::Broadcast => None,
        }
    }
}

/// Builds a wire header.
pub fn header(sn: bool, nesn: bool, dest: WireDest, payload_len: usize) -> u8 {
    let mut hdr = ((dest as u8) << WIRE_HDR_BIT_DEST) & WIRE_HDR_MASK_DEST;
    hdr |= ((payload_len + 1) as u8) & WIRE_HDR_MASK_LENGTH;
    if sn {
        hdr |= WIRE_HDR_MASK_SN;
    }
    if nesn {
        hdr |= WIRE_HDR_MASK_NESN;
    }
    hdr
}

/// Notifications the wire layer raises towards its user.
pub trait WireEvents {
    /// A frame with a payload arrived from `earbud`.
    fn rx(&mut self, earbud: Earbud, data: &[u8]);
    /// The outstanding frame to `earbud` was acknowledged without a payload.
    fn ack(&mut self, earbud: Earbud);
    /// The outstanding frame to `earbud` could not be delivered.
    fn give_up(&mut self, earbud: Earbud);
    /// The outstanding frame to `earbud` was dropped in favour of a broadcast.
    fn abort(&mut self, earbud: Earbud);
    /// All repetitions of the last broadcast were sent.
    fn broadcast_finished(&mut self);
}

/// Link state for one earbud.
#[derive(Debug, Clone, Default)]
pub struct WireTransaction {
    tx_data: [u8; CHARGER_COMMS_MAX_MSG_LEN],
    tx_len: usize,
    rx_data: Frame,
    retry: bool,
    no_response_timeout: u8,
    retry_count: u8,
    nack_count: u8,
    sn: bool,
    nesn: bool,
    escalated: bool,
}

impl WireTransaction {
    /// `true` while a frame is waiting to be acknowledged.
    pub fn is_pending(&self) -> bool {
        self.tx_len != 0
    }

    /// Current sequence number.
    pub fn sn(&self) -> bool {
        self.sn
    }

    /// Next sequence number expected from the earbud.
    pub fn nesn(&self) -> bool {
        self.nesn
    }

    /// NACKs seen for the outstanding frame.
    pub fn nack_count(&self) -> u8 {
        self.nack_count
    }

    /// Retransmissions made of the outstanding frame.
    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    fn reset_link(&mut self) {
        self.sn = false;
        self.nesn = false;
        self.retry_count = 0;
        self.retry = true;
        self.nack_count = 0;
    }

    fn clear(&mut self) {
        self.tx_len = 0;
        self.escalated = false;
    }
}

#[derive(Debug, Clone, Default)]
struct Broadcast {
    data: [u8; CHARGER_COMMS_MAX_MSG_LEN],
    len: usize,
    timeout: u8,
    count: u8,
}

/// The wire layer, owning the physical layer underneath it.
#[derive(Debug)]
pub struct Wire<P: Phy> {
    phy: P,
    transactions: [WireTransaction; NO_OF_EARBUDS],
    broadcast: Broadcast,
}

impl<P: Phy> Wire<P> {
    /// Creates an idle wire layer on top of `phy`.
    pub fn new(phy: P) -> Self {
        Self {
            phy,
            transactions: Default::default(),
            broadcast: Broadcast::default(),
        }
    }

    /// The physical layer.
    pub fn phy(&self) -> &P {
        &self.phy
    }

    /// Mutable access to the physical layer.
    pub fn phy_mut(&mut self) -> &mut P {
        &mut self.phy
    }

    /// Link state of `earbud`.
    pub fn transaction(&self, earbud: Earbud) -> &WireTransaction {
        &self.transactions[earbud.index()]
    }

    /// `true` while a broadcast is being repeated.
    pub fn is_broadcasting(&self) -> bool {
        self.broadcast.len != 0
    }

    /// Sends `data` to `dest`.
    ///
    /// An empty payload to an earbud is a poll. A broadcast aborts every
    /// unicast exchange in progress and resets the sequence numbers of both
    /// links.
    pub fn tx<E: WireEvents>(
        &mut self,
        dest: WireDest,
        data: &[u8],
        events: &mut E,
    ) -> Result<(), TxError> {
        if data.len() > WIRE_MAX_PAYLOAD_LEN {
            return Err(TxError::TooLong { len: data.len() });
        }
        if self.is_broadcasting() {
            return Err(TxError::BroadcastPending);
        }
        if self.phy.is_active() {
            return Err(TxError::MediumBusy);
        }

        match dest {
            WireDest::Case => Err(TxError::InvalidDestination),
            WireDest::Broadcast => {
                for earbud in Earbud::ALL {
                    if self.transactions[earbud.index()].is_pending() {
                        events.abort(earbud);
                    }
                }
                debug!("CCP->WIRE {:?}", data);
                self.transactions = Default::default();
                self.setup_broadcast(data, WIRE_BROADCAST_TIMEOUT);
                self.send_broadcast();
                Ok(())
            }
            WireDest::Left | WireDest::Right => {
                let earbud = dest.earbud().ok_or(TxError::InvalidDestination)?;
                let wt = &mut self.transactions[earbud.index()];
                if wt.is_pending() {
                    return Err(TxError::PeerBusy(earbud));
                }
                if !data.is_empty() {
                    debug!("CCP->WIRE {:?}", data);
                }
                wt.tx_data[1..=data.len()].copy_from_slice(data);
                wt.tx_len = data.len() + WIRE_NO_OF_BYTES;
                if let Err(e) = self.tx_stored_message(earbud) {
                    self.transactions[earbud.index()].tx_len = 0;
                    return Err(e.into());
                }
                let wt = &mut self.transactions[earbud.index()];
                wt.no_response_timeout = WIRE_NO_RESPONSE_TIMEOUT;
                wt.retry_count = 0;
                wt.nack_count = 0;
                wt.retry = false;
                wt.escalated = false;
                Ok(())
            }
        }
    }

    /// Builds the header and checksum of the stored frame and sends it.
    fn tx_stored_message(&mut self, earbud: Earbud) -> Result<(), PhyError> {
        let wt = &mut self.transactions[earbud.index()];
        let len = wt.tx_len;
        wt.tx_data[0] = header(wt.sn, wt.nesn, earbud.into(), len - WIRE_NO_OF_BYTES);
        wt.tx_data[len - 1] = crc8(&wt.tx_data[..len - 1]);
        self.phy.transmit(&wt.tx_data[..len], true)
    }

    fn setup_broadcast(&mut self, data: &[u8], timeout: u8) {
        let b = &mut self.broadcast;
        let len = data.len();
        b.len = len + WIRE_NO_OF_BYTES;
        b.data[0] = header(false, false, WireDest::Broadcast, len);
        b.data[1..=len].copy_from_slice(data);
        b.data[len + 1] = crc8(&b.data[..=len]);
        b.timeout = timeout;
        b.count = 0;
    }

    fn send_broadcast(&mut self) {
        let b = &mut self.broadcast;
        match self.phy.transmit(&b.data[..b.len], false) {
            Ok(()) => b.count += 1,
            Err(e) => warn!("broadcast not sent: {}", e),
        }
    }

    /// Hands a frame received from `earbud` to the wire layer.
    ///
    /// Valid frames are buffered and processed on the next
    /// [`periodic()`](Wire::periodic) call. A checksum failure schedules a
    /// retransmission of the outstanding frame.
    pub fn rx(&mut self, earbud: Earbud, frame: &[u8]) {
        debug!("COMMS->WIRE {:?}", frame);
        if frame.len() < WIRE_NO_OF_BYTES || frame.len() > CHARGER_COMMS_MAX_MSG_LEN {
            return;
        }

        let wt = &mut self.transactions[earbud.index()];
        if verify8(frame) {
            wt.rx_data.clear();
            // Length checked above.
            let _ = wt.rx_data.extend_from_slice(frame);
        } else {
            warn!("Invalid checksum");
            wt.retry = true;
        }
    }

    fn process_rx<E: WireEvents>(&mut self, earbud: Earbud, events: &mut E) {
        let wt = &mut self.transactions[earbud.index()];
        if wt.rx_data.is_empty() {
            return;
        }

        let hdr = wt.rx_data[0];
        let pkt_sn = hdr & WIRE_HDR_MASK_SN != 0;
        let pkt_nesn = hdr & WIRE_HDR_MASK_NESN != 0;
        trace!(
            "{:?} pkt sn={} nesn={} local sn={} nesn={}",
            earbud, pkt_sn, pkt_nesn, wt.sn, wt.nesn
        );

        if pkt_sn == wt.nesn {
            wt.nesn = !wt.nesn;
        }

        if pkt_nesn == wt.sn {
            debug!("NACK!");
            wt.retry = true;
            wt.nack_count = wt.nack_count.saturating_add(1);
        } else {
            wt.sn = !wt.sn;
            let len = wt.rx_data.len();
            if len > WIRE_NO_OF_BYTES {
                events.rx(earbud, &wt.rx_data[1..len - 1]);
                // Zero-payload ACK, built when it is sent.
                wt.tx_len = WIRE_NO_OF_BYTES;
                wt.retry_count = 0;
                wt.retry = true;
            } else {
                wt.clear();
                events.ack(earbud);
            }
        }

        self.transactions[earbud.index()].rx_data.clear();
    }

    fn manage_transaction<E: WireEvents>(&mut self, earbud: Earbud, events: &mut E) {
        self.process_rx(earbud, events);

        let wt = &mut self.transactions[earbud.index()];
        if !wt.is_pending() {
            return;
        }

        if wt.retry {
            if wt.retry_count < WIRE_MAX_RETRIES {
                if !self.phy.is_active() {
                    match self.tx_stored_message(earbud) {
                        Ok(()) => {
                            let wt = &mut self.transactions[earbud.index()];
                            wt.no_response_timeout = WIRE_NO_RESPONSE_TIMEOUT;
                            wt.retry_count += 1;
                            wt.retry = false;
                        }
                        Err(e) => warn!("retry not sent: {}", e),
                    }
                }
            } else if wt.nack_count != 0 && !wt.escalated {
                // Persistent NACKs: reset both links with an empty broadcast.
                info!("{:?} out of sync, resetting links", earbud);
                wt.escalated = true;
                for t in &mut self.transactions {
                    t.reset_link();
                }
                self.setup_broadcast(&[], 0);
            } else {
                wt.clear();
                events.give_up(earbud);
            }
        } else if wt.no_response_timeout == 0 {
            wt.clear();
            events.give_up(earbud);
        } else {
            wt.no_response_timeout -= 1;
        }
    }

    /// Runs the layer for one system tick.
    pub fn periodic<E: WireEvents>(&mut self, events: &mut E) {
        if self.is_broadcasting() {
            if self.broadcast.timeout == 0 {
                if !self.phy.is_active() {
                    self.send_broadcast();
                    if self.broadcast.count < WIRE_BROADCAST_SENDS {
                        self.broadcast.timeout = WIRE_BROADCAST_TIMEOUT;
                    } else {
                        self.broadcast.len = 0;
                        events.broadcast_finished();
                    }
                }
            } else {
                self.broadcast.timeout -= 1;
            }
        } else {
            for earbud in Earbud::ALL {
                // An escalation suspends the other link until the reset is out.
                if self.is_broadcasting() {
                    break;
                }
                self.manage_transaction(earbud, events);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::driver::RxFrames;
    use std::vec::Vec;

    /// A physical layer that records what it is asked to send.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingPhy {
        pub(crate) sent: Vec<(Vec<u8>, bool)>,
        pub(crate) active: bool,
    }

    impl RecordingPhy {
        pub(crate) fn take(&mut self) -> Vec<(Vec<u8>, bool)> {
            core::mem::take(&mut self.sent)
        }
    }

    impl Phy for RecordingPhy {
        fn transmit(&mut self, frame: &[u8], expect_reply: bool) -> Result<(), PhyError> {
            self.sent.push((frame.to_vec(), expect_reply));
            Ok(())
        }

        fn is_active(&self) -> bool {
            self.active
        }

        fn take_rx(&mut self) -> Option<RxFrames> {
            None
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Event {
        Rx(Earbud, Vec<u8>),
        Ack(Earbud),
        GiveUp(Earbud),
        Abort(Earbud),
        BroadcastFinished,
    }

    #[derive(Debug, Default)]
    pub(crate) struct Recorder {
        pub(crate) events: Vec<Event>,
    }

    impl Recorder {
        fn count(&self, f: impl Fn(&Event) -> bool) -> usize {
            self.events.iter().filter(|e| f(e)).count()
        }
    }

    impl WireEvents for Recorder {
        fn rx(&mut self, earbud: Earbud, data: &[u8]) {
            self.events.push(Event::Rx(earbud, data.to_vec()));
        }
        fn ack(&mut self, earbud: Earbud) {
            self.events.push(Event::Ack(earbud));
        }
        fn give_up(&mut self, earbud: Earbud) {
            self.events.push(Event::GiveUp(earbud));
        }
        fn abort(&mut self, earbud: Earbud) {
            self.events.push(Event::Abort(earbud));
        }
        fn broadcast_finished(&mut self) {
            self.events.push(Event::BroadcastFinished);
        }
    }

    fn setup() -> (Wire<RecordingPhy>, Recorder) {
        (Wire::new(RecordingPhy::default()), Recorder::default())
    }

    fn sent(wire: &mut Wire<RecordingPhy>) -> Vec<(Vec<u8>, bool)> {
        wire.phy_mut().take()
    }

    fn unicast(frame: &[u8]) -> Vec<(Vec<u8>, bool)> {
        vec![(frame.to_vec(), true)]
    }

    fn broadcast(frame: &[u8]) -> Vec<(Vec<u8>, bool)> {
        vec![(frame.to_vec(), false)]
    }

    fn idle(wire: &mut Wire<RecordingPhy>, rec: &mut Recorder, ticks: usize) {
        for _ in 0..ticks {
            wire.periodic(rec);
        }
    }

    /// Runs the remaining repetitions of a broadcast started by `tx`.
    fn finish_broadcast(wire: &mut Wire<RecordingPhy>, rec: &mut Recorder, frame: &[u8]) {
        for _ in 1..WIRE_BROADCAST_SENDS {
            idle(wire, rec, usize::from(WIRE_BROADCAST_TIMEOUT));
            assert!(sent(wire).is_empty());
            wire.periodic(rec);
            assert_eq!(sent(wire), broadcast(frame));
        }
    }

    #[test]
    fn test_header_fields() {
        assert_eq!(header(false, false, WireDest::Left, 1), 0x22);
        assert_eq!(header(true, true, WireDest::Left, 0), 0xe1);
        assert_eq!(header(false, false, WireDest::Broadcast, 14), 0x3f);
        assert_eq!(WireDest::from_header(0x84), WireDest::Case);
        assert_eq!(WireDest::from_header(0x12), WireDest::Right);
    }

    #[test]
    fn test_wire_broadcast() {
        let (mut wire, mut rec) = setup();
        wire.periodic(&mut rec);
        assert!(sent(&mut wire).is_empty());

        wire.tx(WireDest::Broadcast, &[0x00, 0x01], &mut rec).unwrap();
        assert_eq!(sent(&mut wire), broadcast(&[0x33, 0x00, 0x01, 0x3d]));

        idle(&mut wire, &mut rec, usize::from(WIRE_BROADCAST_TIMEOUT));
        wire.periodic(&mut rec);
        assert_eq!(sent(&mut wire), broadcast(&[0x33, 0x00, 0x01, 0x3d]));

        idle(&mut wire, &mut rec, usize::from(WIRE_BROADCAST_TIMEOUT));
        assert!(rec.events.is_empty());

        // Medium busy: the last repetition waits.
        wire.phy_mut().active = true;
        wire.periodic(&mut rec);
        assert!(sent(&mut wire).is_empty());
        wire.phy_mut().active = false;
        wire.periodic(&mut rec);
        assert_eq!(sent(&mut wire), broadcast(&[0x33, 0x00, 0x01, 0x3d]));

        assert_eq!(rec.events, [Event::BroadcastFinished]);
        assert!(!wire.is_broadcasting());

        idle(&mut wire, &mut rec, 100);
        assert!(sent(&mut wire).is_empty());
    }

    #[test]
    fn test_wire_status_request() {
        let (mut wire, mut rec) = setup();

        wire.tx(WireDest::Left, &[0x03], &mut rec).unwrap();
        assert_eq!(sent(&mut wire), unicast(&[0x22, 0x03, 0x0f]));
        wire.periodic(&mut rec);

        wire.rx(Earbud::Left, &[0x41, 0xbb]);
        wire.periodic(&mut rec);
        assert_eq!(rec.events, [Event::Ack(Earbud::Left)]);
        wire.periodic(&mut rec);

        // Poll.
        wire.tx(WireDest::Left, &[], &mut rec).unwrap();
        assert_eq!(sent(&mut wire), unicast(&[0xe1, 0xe1]));

        wire.rx(Earbud::Left, &[0x84, 0x01, 0x00, 0x21, 0x94]);
        wire.periodic(&mut rec);
        assert_eq!(sent(&mut wire), unicast(&[0x21, 0x8d]));
        assert_eq!(rec.events[1], Event::Rx(Earbud::Left, vec![0x01, 0x00, 0x21]));
        wire.periodic(&mut rec);

        // The ACK is still outstanding and gets aborted.
        let status = [0x00, 0x00, 0xe4, 0x21, 0x7f];
        let frame = [0x36, 0x00, 0x00, 0xe4, 0x21, 0x7f, 0x0d];
        wire.tx(WireDest::Broadcast, &status, &mut rec).unwrap();
        assert_eq!(sent(&mut wire), broadcast(&frame));
        assert_eq!(rec.events[2], Event::Abort(Earbud::Left));
        finish_broadcast(&mut wire, &mut rec, &frame);
        assert_eq!(rec.events[3], Event::BroadcastFinished);

        wire.tx(WireDest::Right, &[0x03], &mut rec).unwrap();
        assert_eq!(sent(&mut wire), unicast(&[0x12, 0x03, 0x18]));
        wire.periodic(&mut rec);
        wire.rx(Earbud::Right, &[0x41, 0xbb]);
        wire.periodic(&mut rec);
        assert_eq!(rec.events[4], Event::Ack(Earbud::Right));
        wire.periodic(&mut rec);

        // Left link was reset by the broadcast.
        wire.tx(WireDest::Left, &[], &mut rec).unwrap();
        assert_eq!(sent(&mut wire), unicast(&[0x21, 0x8d]));

        wire.rx(Earbud::Right, &[0x84, 0x01, 0x00, 0x2b, 0xcb]);
        wire.periodic(&mut rec);
        assert_eq!(sent(&mut wire), unicast(&[0x11, 0x96]));
        assert_eq!(rec.events[5], Event::Rx(Earbud::Right, vec![0x01, 0x00, 0x2b]));
    }

    #[test]
    fn test_wire_no_response() {
        let (mut wire, mut rec) = setup();
        wire.tx(WireDest::Left, &[0x03], &mut rec).unwrap();

        idle(&mut wire, &mut rec, usize::from(WIRE_NO_RESPONSE_TIMEOUT));
        assert!(rec.events.is_empty());

        wire.periodic(&mut rec);
        assert_eq!(rec.events, [Event::GiveUp(Earbud::Left)]);
        assert!(!wire.transaction(Earbud::Left).is_pending());
        // No retransmission without a NACK or corrupt reply.
        assert_eq!(sent(&mut wire).len(), 1);
    }

    #[test]
    fn test_wire_tx_too_big() {
        let (mut wire, mut rec) = setup();
        let mut data = [0u8; 15];
        data[..5].copy_from_slice(&[0x00, 0x00, 0xe4, 0x21, 0x7f]);
        for (i, b) in data[5..].iter_mut().enumerate() {
            *b = 0x66 + 0x11 * i as u8;
        }

        assert_eq!(
            wire.tx(WireDest::Broadcast, &data, &mut rec),
            Err(TxError::TooLong { len: 15 })
        );
        wire.periodic(&mut rec);
        assert!(sent(&mut wire).is_empty());

        wire.tx(WireDest::Broadcast, &data[..14], &mut rec).unwrap();
        let mut frame = std::vec![0x3f];
        frame.extend_from_slice(&data[..14]);
        frame.push(0x5d);
        assert_eq!(sent(&mut wire), broadcast(&frame));
    }

    #[test]
    fn test_wire_rejections() {
        let (mut wire, mut rec) = setup();
        assert_eq!(
            wire.tx(WireDest::Case, &[0x03], &mut rec),
            Err(TxError::InvalidDestination)
        );

        wire.phy_mut().active = true;
        assert_eq!(
            wire.tx(WireDest::Left, &[0x03], &mut rec),
            Err(TxError::MediumBusy)
        );
        wire.phy_mut().active = false;

        wire.tx(WireDest::Left, &[0x03], &mut rec).unwrap();
        assert_eq!(
            wire.tx(WireDest::Left, &[0x03], &mut rec),
            Err(TxError::PeerBusy(Earbud::Left))
        );
        // The other earbud is independent.
        wire.tx(WireDest::Right, &[0x03], &mut rec).unwrap();
        assert_eq!(sent(&mut wire).len(), 2);
    }

    #[test]
    fn test_wire_ignores_bad_lengths() {
        let (mut wire, mut rec) = setup();
        wire.tx(WireDest::Left, &[0x03], &mut rec).unwrap();
        wire.rx(Earbud::Left, &[0x41]);
        wire.rx(Earbud::Left, &[0u8; 17]);
        wire.periodic(&mut rec);
        assert!(rec.events.is_empty());
        assert_eq!(sent(&mut wire).len(), 1);
    }

    #[test]
    fn test_wire_receive_corrupt_message() {
        let (mut wire, mut rec) = setup();
        wire.tx(WireDest::Left, &[0x03], &mut rec).unwrap();
        assert_eq!(sent(&mut wire), unicast(&[0x22, 0x03, 0x0f]));
        wire.periodic(&mut rec);

        wire.rx(Earbud::Left, &[0x41, 0xba]);
        assert!(rec.events.is_empty());

        wire.periodic(&mut rec);
        assert_eq!(sent(&mut wire), unicast(&[0x22, 0x03, 0x0f]));
        wire.periodic(&mut rec);

        wire.rx(Earbud::Left, &[0x41, 0xbb]);
        wire.periodic(&mut rec);
        assert_eq!(rec.events, [Event::Ack(Earbud::Left)]);
    }

    #[test]
    fn test_wire_keep_receiving_corrupt_messages() {
        let (mut wire, mut rec) = setup();
        wire.tx(WireDest::Left, &[0x03], &mut rec).unwrap();
        assert_eq!(sent(&mut wire), unicast(&[0x22, 0x03, 0x0f]));
        wire.periodic(&mut rec);

        wire.rx(Earbud::Left, &[0x40, 0xbb]);
        wire.periodic(&mut rec);
        assert_eq!(sent(&mut wire), unicast(&[0x22, 0x03, 0x0f]));

        wire.rx(Earbud::Left, &[0x41, 0xfb]);
        wire.phy_mut().active = true;
        wire.periodic(&mut rec);
        assert!(sent(&mut wire).is_empty());
        wire.phy_mut().active = false;
        wire.periodic(&mut rec);
        assert_eq!(sent(&mut wire), unicast(&[0x22, 0x03, 0x0f]));

        wire.rx(Earbud::Left, &[0x61, 0xbb]);
        assert!(rec.events.is_empty());

        wire.periodic(&mut rec);
        assert_eq!(rec.events, [Event::GiveUp(Earbud::Left)]);
        assert!(!wire.is_broadcasting());
    }

    #[test]
    fn test_wire_receive_nack() {
        let (mut wire, mut rec) = setup();
        wire.tx(WireDest::Left, &[0x03], &mut rec).unwrap();
        assert_eq!(sent(&mut wire), unicast(&[0x22, 0x03, 0x0f]));
        wire.periodic(&mut rec);

        wire.rx(Earbud::Left, &[0x01, 0x0e]);
        wire.periodic(&mut rec);
        assert_eq!(sent(&mut wire), unicast(&[0x62, 0x03, 0x3b]));
        assert!(rec.events.is_empty());
        wire.periodic(&mut rec);

        wire.rx(Earbud::Left, &[0x41, 0xbb]);
        wire.periodic(&mut rec);
        assert_eq!(rec.events, [Event::Ack(Earbud::Left)]);
    }

    #[test]
    fn test_wire_repeated_nack_resets_links() {
        let (mut wire, mut rec) = setup();
        wire.tx(WireDest::Left, &[0x03], &mut rec).unwrap();
        assert_eq!(sent(&mut wire), unicast(&[0x22, 0x03, 0x0f]));
        wire.periodic(&mut rec);

        for n in 1..=2 {
            wire.rx(Earbud::Left, &[0x01, 0x0e]);
            wire.periodic(&mut rec);
            assert_eq!(sent(&mut wire), unicast(&[0x62, 0x03, 0x3b]));
            assert_eq!(wire.transaction(Earbud::Left).nack_count(), n);
        }

        // Third NACK: schedule the bus reset, sent on the next tick.
        wire.rx(Earbud::Left, &[0x01, 0x0e]);
        wire.periodic(&mut rec);
        assert!(wire.is_broadcasting());
        assert!(sent(&mut wire).is_empty());

        wire.periodic(&mut rec);
        assert_eq!(sent(&mut wire), broadcast(&[0x31, 0x15]));
        finish_broadcast(&mut wire, &mut rec, &[0x31, 0x15]);
        assert_eq!(rec.events, [Event::BroadcastFinished]);

        // The stored frame goes out again with fresh sequence numbers.
        wire.periodic(&mut rec);
        assert_eq!(sent(&mut wire), unicast(&[0x22, 0x03, 0x0f]));

        wire.rx(Earbud::Left, &[0x41, 0xbb]);
        wire.periodic(&mut rec);
        assert_eq!(rec.events[1], Event::Ack(Earbud::Left));

        wire.tx(WireDest::Left, &[], &mut rec).unwrap();
        assert_eq!(sent(&mut wire), unicast(&[0xe1, 0xe1]));
        wire.rx(Earbud::Left, &[0x84, 0x01, 0x00, 0x21, 0x94]);
        wire.periodic(&mut rec);
        assert_eq!(sent(&mut wire), unicast(&[0x21, 0x8d]));
        assert_eq!(rec.events[2], Event::Rx(Earbud::Left, vec![0x01, 0x00, 0x21]));
    }

    #[test]
    fn test_wire_link_reset_holds_other_peer() {
        let (mut wire, mut rec) = setup();
        wire.tx(WireDest::Left, &[0x03], &mut rec).unwrap();
        wire.tx(WireDest::Right, &[0x03], &mut rec).unwrap();
        let _ = sent(&mut wire);
        wire.periodic(&mut rec);

        for _ in 0..2 {
            wire.rx(Earbud::Left, &[0x01, 0x0e]);
            wire.periodic(&mut rec);
            assert_eq!(sent(&mut wire), unicast(&[0x62, 0x03, 0x3b]));
        }

        // Left escalates; right must not go out ahead of the reset.
        wire.rx(Earbud::Left, &[0x01, 0x0e]);
        wire.periodic(&mut rec);
        assert!(wire.is_broadcasting());
        assert!(sent(&mut wire).is_empty());
        assert_eq!(wire.transaction(Earbud::Right).retry_count(), 0);

        wire.periodic(&mut rec);
        assert_eq!(sent(&mut wire), broadcast(&[0x31, 0x15]));
        finish_broadcast(&mut wire, &mut rec, &[0x31, 0x15]);
        assert_eq!(rec.events, [Event::BroadcastFinished]);

        // Both stored frames go out with fresh sequence numbers.
        wire.periodic(&mut rec);
        assert_eq!(
            sent(&mut wire),
            [
                (vec![0x22, 0x03, 0x0f], true),
                (vec![0x12, 0x03, 0x18], true)
            ]
        );
        assert_eq!(wire.transaction(Earbud::Right).retry_count(), 1);
    }

    #[test]
    fn test_wire_gives_up_after_second_nack_cycle() {
        let (mut wire, mut rec) = setup();
        wire.tx(WireDest::Left, &[0x03], &mut rec).unwrap();
        let _ = sent(&mut wire);

        let mut broadcasts = 0;
        let mut transmissions = 1;
        let mut ticks = 0;
        while !rec.events.contains(&Event::GiveUp(Earbud::Left)) {
            if !wire.is_broadcasting() {
                wire.rx(Earbud::Left, &[0x01, 0x0e]);
            }
            wire.periodic(&mut rec);
            for (frame, reply) in sent(&mut wire) {
                if reply {
                    transmissions += 1;
                } else {
                    assert_eq!(frame, [0x31, 0x15]);
                    broadcasts += 1;
                }
            }
            ticks += 1;
            assert!(ticks < 1000);
        }

        // A single bus reset, sent three times.
        assert_eq!(broadcasts, usize::from(WIRE_BROADCAST_SENDS));
        // First send, two retries, then after the reset another two sends.
        assert_eq!(transmissions, 1 + 2 + 2);
        assert_eq!(
            rec.events,
            [Event::BroadcastFinished, Event::GiveUp(Earbud::Left)]
        );
        assert!(!wire.transaction(Earbud::Left).is_pending());
    }

    #[test]
    fn test_wire_duplicate_not_delivered_twice() {
        let (mut wire, mut rec) = setup();
        wire.tx(WireDest::Left, &[], &mut rec).unwrap();
        assert_eq!(sent(&mut wire), unicast(&[0x21, 0x8d]));

        let reply = [0x44, 0x01, 0x00, 0x21, 0xc4];
        wire.rx(Earbud::Left, &reply);
        wire.periodic(&mut rec);
        assert_eq!(sent(&mut wire), unicast(&[0xe1, 0xe1]));

        // The ACK was lost, the earbud sends the same frame again.
        wire.rx(Earbud::Left, &reply);
        wire.periodic(&mut rec);
        assert_eq!(rec.count(|e| matches!(e, Event::Rx(..))), 1);
        // Its NESN does not acknowledge anything new, so it is a NACK.
        assert_eq!(wire.transaction(Earbud::Left).nack_count(), 1);
        assert_eq!(sent(&mut wire), unicast(&[0xe1, 0xe1]));
    }

    #[test]
    fn test_wire_broadcast_interrupting() {
        let (mut wire, mut rec) = setup();
        wire.tx(WireDest::Left, &[0x03], &mut rec).unwrap();
        let _ = sent(&mut wire);
        wire.periodic(&mut rec);

        wire.rx(Earbud::Left, &[0x41, 0xbb]);
        assert!(rec.events.is_empty());

        wire.tx(WireDest::Broadcast, &[0x00, 0x02], &mut rec).unwrap();
        assert_eq!(rec.events, [Event::Abort(Earbud::Left)]);
        assert_eq!(sent(&mut wire), broadcast(&[0x33, 0x00, 0x02, 0xfe]));
        // The buffered ACK was discarded with the link state.
        assert!(!wire.transaction(Earbud::Left).is_pending());

        idle(&mut wire, &mut rec, usize::from(WIRE_BROADCAST_TIMEOUT));
        assert_eq!(
            wire.tx(WireDest::Left, &[0x03], &mut rec),
            Err(TxError::BroadcastPending)
        );
        wire.periodic(&mut rec);
        assert_eq!(sent(&mut wire), broadcast(&[0x33, 0x00, 0x02, 0xfe]));
        idle(&mut wire, &mut rec, usize::from(WIRE_BROADCAST_TIMEOUT));
        wire.periodic(&mut rec);
        assert_eq!(sent(&mut wire), broadcast(&[0x33, 0x00, 0x02, 0xfe]));
        assert_eq!(rec.count(|e| *e == Event::BroadcastFinished), 1);
        assert_eq!(rec.count(|e| matches!(e, Event::Abort(_))), 1);

        idle(&mut wire, &mut rec, 100);
        assert!(sent(&mut wire).is_empty());
    }
}

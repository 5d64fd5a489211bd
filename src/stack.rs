//! The layered comms stack and its periodic functions.
//!
//! [`CommsStack`] owns the CCP layer, which owns the wire layer, which owns
//! the physical layer. Three periodic functions drive it, meant to run once
//! per system tick in this order:
//!
//! 1. [`ccp_periodic`](CommsStack::ccp_periodic): CCP poll timers
//! 2. [`wire_periodic`](CommsStack::wire_periodic): retransmissions and broadcasts
//! 3. [`comms_periodic`](CommsStack::comms_periodic): moves received frames
//!    from the physical layer into the wire layer
//!
//! [`default_schedule`](CommsStack::default_schedule) builds that table.

use crate::Earbud;
use crate::ccp::{Ccp, CcpEvents};
use crate::driver::{CommsDriver, CurrentSense, Phy, VregControl};
use crate::sched::{Scheduler, Task};

/// Number of tasks in [`CommsStack::default_schedule`].
pub const DEFAULT_TASKS: usize = 3;

/// The complete case side comms stack.
#[derive(Debug)]
pub struct CommsStack<P: Phy, U: CcpEvents> {
    ccp: Ccp<P, U>,
}

impl<P: Phy, U: CcpEvents> CommsStack<P, U> {
    /// Builds the stack on top of `phy`, reporting to `user`.
    pub fn new(phy: P, user: U) -> Self {
        Self {
            ccp: Ccp::new(phy, user),
        }
    }

    /// The CCP layer, through which messages are sent.
    pub fn ccp(&self) -> &Ccp<P, U> {
        &self.ccp
    }

    /// Mutable access to the CCP layer.
    pub fn ccp_mut(&mut self) -> &mut Ccp<P, U> {
        &mut self.ccp
    }

    /// The physical layer.
    pub fn phy(&self) -> &P {
        self.ccp.wire().phy()
    }

    /// Mutable access to the physical layer.
    pub fn phy_mut(&mut self) -> &mut P {
        self.ccp.wire_mut().phy_mut()
    }

    /// CCP periodic function.
    pub fn ccp_periodic(&mut self) {
        self.ccp.periodic();
    }

    /// Wire periodic function.
    pub fn wire_periodic(&mut self) {
        self.ccp.wire_periodic();
    }

    /// Charger comms periodic function.
    ///
    /// Hands whatever the last reply window captured to the wire layer, then
    /// lets the physical layer do its deferred work.
    pub fn comms_periodic(&mut self) {
        let wire = self.ccp.wire_mut();
        if let Some(frames) = wire.phy_mut().take_rx() {
            for earbud in Earbud::ALL {
                if let Some(frame) = &frames[earbud.index()] {
                    wire.rx(earbud, frame);
                }
            }
        }
        wire.phy_mut().service();
    }

    /// Runs all three periodic functions in order.
    pub fn periodic(&mut self) {
        self.ccp_periodic();
        self.wire_periodic();
        self.comms_periodic();
    }

    /// The periodic task table for this stack.
    pub fn default_schedule() -> Scheduler<Self, DEFAULT_TASKS> {
        let mut sched = Scheduler::new();
        let tasks: [Task<Self>; DEFAULT_TASKS] = [
            Task::new("ccp", Self::ccp_periodic),
            Task::new("wire", Self::wire_periodic),
            Task::new("c_comms", Self::comms_periodic),
        ];
        for task in tasks {
            // The table is sized for exactly these.
            let _ = sched.add(task);
        }
        sched
    }
}

impl<V, S, U> CommsStack<CommsDriver<V, S>, U>
where
    V: VregControl,
    S: CurrentSense,
    U: CcpEvents,
{
    /// Advances the physical layer by one sample period.
    pub fn tick(&mut self) {
        self.phy_mut().tick();
    }
}

use embedded_hal::delay::DelayNs;

use super::{SAMPLE_PERIOD_US, SAMPLES_PER_SYSTEM_TICK};
use crate::ccp::CcpEvents;
use crate::driver::{CommsDriver, CurrentSense, VregControl};
use crate::sched::Scheduler;
use crate::stack::CommsStack;

/// One system tick worth of sample ticks, followed by one pass over `sched`.
///
/// The time spent in [`CommsStack::tick`] and in the tasks adds to the
/// delays, so the effective rates run slightly slow.
pub fn run_system_tick<D, V, S, U, const N: usize>(
    stack: &mut CommsStack<CommsDriver<V, S>, U>,
    sched: &mut Scheduler<CommsStack<CommsDriver<V, S>, U>, N>,
    delay: &mut D,
) where
    D: DelayNs,
    V: VregControl,
    S: CurrentSense,
    U: CcpEvents,
{
    for _ in 0..SAMPLES_PER_SYSTEM_TICK {
        stack.tick();
        delay.delay_us(SAMPLE_PERIOD_US);
    }
    sched.run_once(stack);
}

/// Runs a blocking loop that drives both the sample tick and the system
/// tick of `stack` from `delay`.
///
/// This is a simple timing loop for use in environments where interrupts
/// are unavailable or undesired.
///
/// # Example
/// ```rust,ignore
/// use case_comms::stack::CommsStack;
/// use case_comms::timer::run_tick_loop;
///
/// let mut stack = CommsStack::new(driver, Case::default());
/// let mut sched = CommsStack::default_schedule();
/// run_tick_loop(&mut stack, &mut sched, &mut delay);
/// ```
///
/// # Notes
/// - This loop never returns; messages have to be queued from one of the
///   tasks in `sched`.
pub fn run_tick_loop<D, V, S, U, const N: usize>(
    stack: &mut CommsStack<CommsDriver<V, S>, U>,
    sched: &mut Scheduler<CommsStack<CommsDriver<V, S>, U>, N>,
    delay: &mut D,
) -> !
where
    D: DelayNs,
    V: VregControl,
    S: CurrentSense,
    U: CcpEvents,
{
    loop {
        run_system_tick(stack, sched, delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Earbud;
    use crate::driver::{CommsConfig, Phy};
    use crate::message::EarbudStatus;
    use crate::sched::Task;
    use embedded_hal_mock::eh1::delay::NoopDelay;

    #[derive(Debug, Default)]
    struct Levels(u32);

    impl VregControl for Levels {
        fn vreg_high(&mut self) {
            self.0 += 1;
        }
        fn vreg_low(&mut self) {
            self.0 += 1;
        }
        fn vreg_reset(&mut self) {
            self.0 += 1;
        }
    }

    #[derive(Debug, Default)]
    struct FlatSense;

    impl CurrentSense for FlatSense {
        fn current_sample(&mut self, _: Earbud) -> u16 {
            300
        }
    }

    #[derive(Debug, Default)]
    struct Quiet {
        broadcasts: u32,
    }

    impl CcpEvents for Quiet {
        fn earbud_status(&mut self, _: Earbud, _: EarbudStatus) {}
        fn ack(&mut self, _: Earbud) {}
        fn give_up(&mut self, _: Earbud) {}
        fn abort(&mut self, _: Earbud) {}
        fn broadcast_finished(&mut self) {
            self.broadcasts += 1;
        }
    }

    /// Sums up the requested delays.
    #[derive(Debug, Default)]
    struct Elapsed {
        ns: u64,
    }

    impl DelayNs for Elapsed {
        fn delay_ns(&mut self, ns: u32) {
            self.ns += u64::from(ns);
        }
    }

    fn stack() -> CommsStack<CommsDriver<Levels, FlatSense>, Quiet> {
        let driver = CommsDriver::new(Levels::default(), FlatSense, CommsConfig::default());
        CommsStack::new(driver, Quiet::default())
    }

    #[test]
    fn test_system_tick_timing() {
        let mut stack = stack();
        let mut sched = CommsStack::default_schedule();
        let mut delay = Elapsed::default();

        run_system_tick(&mut stack, &mut sched, &mut delay);
        assert_eq!(delay.ns, 10_000_000);
        assert!(sched.tasks().iter().map(Task::runs).all(|runs| runs == 1));
    }

    #[test]
    fn test_broadcast_completes() {
        let mut stack = stack();
        let mut sched = CommsStack::default_schedule();
        let mut delay = NoopDelay::new();

        stack.ccp_mut().send_short_status(false, true).unwrap();
        // Three sends, ten system ticks apart.
        for _ in 0..40 {
            run_system_tick(&mut stack, &mut sched, &mut delay);
        }
        assert!(!stack.phy().is_active());
        assert_eq!(stack.phy().tx_good, 3);
        assert_eq!(stack.ccp().user().broadcasts, 1);
        assert!(!stack.ccp().wire().is_broadcasting());
    }
}

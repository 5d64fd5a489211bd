use core::cell::RefCell;

use critical_section::Mutex;

use crate::ccp::CcpEvents;
use crate::driver::{CommsDriver, CurrentSense, Phy, VregControl};
use crate::sched::Scheduler;
use crate::stack::CommsStack;

/// A comms stack shared between the main loop and the timer interrupts.
pub type GlobalStack<P, U> = Mutex<RefCell<Option<CommsStack<P, U>>>>;

/// Used to initialize the global static stack for use with
/// `critical_section`.
///
/// # Returns
/// * An empty mutable ref-cell
///
/// # Example
/// ```rust,ignore
/// use case_comms::driver::{CommsDriver, PinVreg, SampleLatch};
/// use case_comms::timer::{GlobalStack, global_stack_init};
///
/// static STACK: GlobalStack<CommsDriver<PinVreg<PA1, PA2>, SampleLatch<'static>>, Case> =
///     global_stack_init();
/// ```
pub const fn global_stack_init<P: Phy, U: CcpEvents>() -> GlobalStack<P, U> {
    Mutex::new(RefCell::new(None))
}

/// Installs `stack` in the global slot, dropping whatever was there.
///
/// # Example
/// ```rust,ignore
/// fn main() {
///     let driver = CommsDriver::new(vreg, SampleLatch::new(&SAMPLES), CommsConfig::default());
///     global_stack_setup(&STACK, CommsStack::new(driver, Case::default()));
/// }
/// ```
pub fn global_stack_setup<P: Phy, U: CcpEvents>(
    global_stack: &'static GlobalStack<P, U>,
    stack: CommsStack<P, U>,
) {
    critical_section::with(|cs| {
        let _ = global_stack.borrow(cs).replace(Some(stack));
    });
}

/// Runs `f` on the global stack inside a critical section.
///
/// Returns `None` if no stack was installed yet.
pub fn with_global_stack<P: Phy, U: CcpEvents, R>(
    global_stack: &'static GlobalStack<P, U>,
    f: impl FnOnce(&mut CommsStack<P, U>) -> R,
) -> Option<R> {
    critical_section::with(|cs| global_stack.borrow(cs).borrow_mut().as_mut().map(f))
}

/// Advances the physical layer; call from the sample timer interrupt.
///
/// # Example
/// ```rust,ignore
/// #[interrupt]
/// fn TIM16() {
///     global_sample_tick(&STACK);
/// }
/// ```
pub fn global_sample_tick<V, S, U>(global_stack: &'static GlobalStack<CommsDriver<V, S>, U>)
where
    V: VregControl,
    S: CurrentSense,
    U: CcpEvents,
{
    critical_section::with(|cs| {
        if let Some(stack) = global_stack.borrow(cs).borrow_mut().as_mut() {
            stack.tick();
        }
    });
}

/// Runs every due task of `sched` on the global stack; call once per system
/// tick.
///
/// # Example
/// ```rust,ignore
/// let mut sched = CommsStack::default_schedule();
/// loop {
///     wait_for_system_tick();
///     global_system_tick(&STACK, &mut sched);
/// }
/// ```
pub fn global_system_tick<P: Phy, U: CcpEvents, const N: usize>(
    global_stack: &'static GlobalStack<P, U>,
    sched: &mut Scheduler<CommsStack<P, U>, N>,
) {
    critical_section::with(|cs| {
        if let Some(stack) = global_stack.borrow(cs).borrow_mut().as_mut() {
            sched.run_once(stack);
        }
    });
}

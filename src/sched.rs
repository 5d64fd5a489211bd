//! Cooperative periodic scheduler.
//!
//! A [`Scheduler`] is a fixed table of named [`Task`]s, each a plain function
//! taking the shared context. [`run_once`](Scheduler::run_once) is called once
//! per system tick and runs every task that is due, in table order. Tasks can
//! be stopped and restarted by name, and keep a count of how often they ran.
//!
//! ```rust
//! use case_comms::sched::{Scheduler, Task};
//!
//! #[derive(Default)]
//! struct Counters {
//!     fast: u32,
//!     slow: u32,
//! }
//!
//! let mut sched: Scheduler<Counters, 2> = Scheduler::new();
//! sched.add(Task::new("fast", |c: &mut Counters| c.fast += 1)).ok();
//! sched.add(Task::new("slow", |c: &mut Counters| c.slow += 1).with_period(5)).ok();
//!
//! let mut counters = Counters::default();
//! for _ in 0..10 {
//!     sched.run_once(&mut counters);
//! }
//! assert_eq!((counters.fast, counters.slow), (10, 2));
//! ```

use core::fmt;

use heapless::Vec;

/// One entry of a [`Scheduler`] table.
pub struct Task<C> {
    name: &'static str,
    run: fn(&mut C),
    period: u16,
    countdown: u16,
    running: bool,
    runs: u32,
}

impl<C> fmt::Debug for Task<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("period", &self.period)
            .field("running", &self.running)
            .field("runs", &self.runs)
            .finish()
    }
}

impl<C> Task<C> {
    /// A task that runs on every system tick.
    pub const fn new(name: &'static str, run: fn(&mut C)) -> Self {
        Self {
            name,
            run,
            period: 1,
            countdown: 1,
            running: true,
            runs: 0,
        }
    }

    /// Runs the task every `period` system ticks instead, starting with the
    /// first. A period of zero is treated as one.
    pub const fn with_period(mut self, period: u16) -> Self {
        self.period = if period == 0 { 1 } else { period };
        self
    }

    /// Name used by [`Scheduler::set_runnable`].
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Period in system ticks.
    pub fn period(&self) -> u16 {
        self.period
    }

    /// `false` once stopped.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Number of times the task ran.
    pub fn runs(&self) -> u32 {
        self.runs
    }
}

/// A table of up to `N` periodic tasks sharing the context `C`.
pub struct Scheduler<C, const N: usize> {
    tasks: Vec<Task<C>, N>,
}

impl<C, const N: usize> fmt::Debug for Scheduler<C, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tasks.iter()).finish()
    }
}

impl<C, const N: usize> Default for Scheduler<C, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C, const N: usize> Scheduler<C, N> {
    /// An empty table.
    pub const fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Appends `task`, handing it back if the table is full.
    pub fn add(&mut self, task: Task<C>) -> Result<(), Task<C>> {
        self.tasks.push(task)
    }

    /// Starts or stops the task called `name`. Returns `false` if there is no
    /// such task.
    pub fn set_runnable(&mut self, name: &str, running: bool) -> bool {
        match self.tasks.iter_mut().find(|t| t.name == name) {
            Some(task) => {
                debug!("{} running={}", task.name, running);
                task.running = running;
                true
            }
            None => false,
        }
    }

    /// Looks a task up by name.
    pub fn task(&self, name: &str) -> Option<&Task<C>> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// All tasks, in run order.
    pub fn tasks(&self) -> &[Task<C>] {
        &self.tasks
    }

    /// Runs every due task once, in table order.
    pub fn run_once(&mut self, ctx: &mut C) {
        for task in self.tasks.iter_mut().filter(|t| t.running) {
            if task.countdown > 1 {
                task.countdown -= 1;
                continue;
            }
            (task.run)(ctx);
            task.countdown = task.period;
            task.runs = task.runs.wrapping_add(1);
        }
    }
}

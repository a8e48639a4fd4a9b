//! Cooperative background tasks.
//!
//! A background task is CPU or I/O intensive work split into small chunks
//! so it never blocks the event loop for long. Work is expressed as a
//! vector of steps; the scheduler grants each activation a number of
//! abstract ticks derived from a running estimate of how expensive one
//! tick is, and measures the wall time actually spent to keep that
//! estimate honest. Daemons are tasks with a work queue: they sleep while
//! it is empty and wake when items arrive.
//!
//! Steps return `Ok(StepOutcome)` to report progress, or `Err(TaskExit)`
//! to unwind straight back to the scheduler, which is the cooperative
//! analogue of a non-local exit.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::mem;

use tracing::{debug, warn};

use crate::clock::wall_micros;

/// Wall-clock budget for one `timer()` invocation, in microseconds.
const MAX_SLICE_US: i64 = 150_000;

/// Minimum slice granted to a task per activation, in microseconds.
const MIN_SLICE_US: i64 = 40_000;

/// Granted ticks may move at most this factor away from the previous run.
const DELTA_FACTOR: i64 = 4;

const SIG_SLOTS: usize = 5;

/// Opaque handle to a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

/// What a step reports back to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Processing is complete (for daemons: done with the current item).
    Done,
    /// This step is complete, move on to the next one.
    Next,
    /// More work remains in this step.
    More,
    /// Processing failed; the task terminates with an error status.
    Error,
}

/// Non-local exit from inside a step or signal handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskExit {
    pub code: i32,
}

impl TaskExit {
    pub fn new(code: i32) -> Self {
        Self { code }
    }
}

pub type StepResult = Result<StepOutcome, TaskExit>;
pub type StepFn = Box<dyn FnMut(&mut TaskControl<'_>, u32) -> StepResult + Send>;
pub type SigHandler = Box<dyn FnMut(&mut TaskControl<'_>, BgSignal) -> Result<(), TaskExit> + Send>;
pub type DoneFn = Box<dyn FnOnce(BgStatus) + Send>;
pub type WorkItem = Box<dyn Any + Send>;
pub type ItemHook = Box<dyn FnMut(&mut TaskControl<'_>, &mut WorkItem) + Send>;
pub type NotifyFn = Box<dyn FnMut(bool) + Send>;

/// Task signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BgSignal {
    /// No-op signal.
    Zero,
    /// Uncatchable, synchronous termination.
    Kill,
    /// Polite termination request; a handler may clean up and exit.
    Term,
    Usr1,
    Usr2,
}

impl BgSignal {
    fn slot(self) -> usize {
        match self {
            BgSignal::Zero => 0,
            BgSignal::Kill => 1,
            BgSignal::Term => 2,
            BgSignal::Usr1 => 3,
            BgSignal::Usr2 => 4,
        }
    }
}

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BgStatus {
    Ok,
    Killed,
    Error(i32),
}

/// Callbacks around a daemon's work items.
pub struct DaemonHooks {
    /// Invoked before the first step runs on a fresh item.
    pub start: ItemHook,
    /// Invoked when the steps are done with an item, before it is dropped.
    pub end: ItemHook,
    /// Invoked with `true` when the daemon wakes, `false` when it sleeps.
    pub notify: Option<NotifyFn>,
}

/// Scheduler counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BgStats {
    pub runnable: usize,
    pub sleeping: usize,
    pub zombies: usize,
    pub created: u64,
    pub completed: u64,
}

struct Task {
    name: String,
    daemon: bool,

    runnable: bool,
    running: bool,
    sleeping: bool,
    exited: bool,
    zombie: bool,
    notick: bool,
    signaled: bool,

    steps: Vec<StepFn>,
    step: usize,
    seqno: u32,

    exit_code: i32,
    status: Option<BgStatus>,
    last_signal: BgSignal,
    pending_signals: VecDeque<BgSignal>,
    handlers: [Option<SigHandler>; SIG_SLOTS],
    done: Option<DoneFn>,

    wtime_ms: u64,
    start_us: i64,
    ticks: u32,
    ticks_used: u32,
    prev_ticks: u32,
    elapsed_us: i64,
    tick_cost: f64,

    hooks: Option<DaemonHooks>,
    queue: VecDeque<WorkItem>,
}

impl Task {
    fn new(name: String, steps: Vec<StepFn>, daemon: bool, done: Option<DoneFn>) -> Self {
        Self {
            name,
            daemon,
            runnable: false,
            running: false,
            sleeping: false,
            exited: false,
            zombie: false,
            notick: false,
            signaled: false,
            steps,
            step: 0,
            seqno: 0,
            exit_code: 0,
            status: None,
            last_signal: BgSignal::Zero,
            pending_signals: VecDeque::new(),
            handlers: Default::default(),
            done,
            wtime_ms: 0,
            start_us: 0,
            ticks: 0,
            ticks_used: 0,
            prev_ticks: 0,
            elapsed_us: 0,
            tick_cost: 0.0,
            hooks: None,
            queue: VecDeque::new(),
        }
    }
}

/// The view of its own task a step or signal handler works through.
pub struct TaskControl<'a> {
    task: &'a mut Task,
}

impl TaskControl<'_> {
    pub fn name(&self) -> &str {
        &self.task.name
    }

    pub fn step_index(&self) -> usize {
        self.task.step
    }

    /// Number of calls made at the current step so far.
    pub fn seqno(&self) -> u32 {
        self.task.seqno
    }

    pub fn granted_ticks(&self) -> u32 {
        self.task.ticks
    }

    pub fn last_signal(&self) -> BgSignal {
        self.task.last_signal
    }

    /// Report that the step consumed fewer ticks than granted, so the cost
    /// estimate stays accurate. Zero means the sample is unusable and the
    /// estimate is left untouched.
    pub fn declare_ticks_used(&mut self, used: u32) {
        let used = used.min(self.task.ticks);
        self.task.ticks_used = used;
        if used == 0 {
            self.task.notick = true;
        }
    }

    /// Convenience for `return Err(ctl.exit(code))`.
    pub fn exit(&self, code: i32) -> TaskExit {
        TaskExit::new(code)
    }

    /// The daemon's current work item.
    pub fn item_mut(&mut self) -> Option<&mut WorkItem> {
        self.task.queue.front_mut()
    }

    pub fn queued_items(&self) -> usize {
        self.task.queue.len()
    }

    /// Install or remove a signal handler, returning the previous one.
    pub fn install_signal(
        &mut self,
        sig: BgSignal,
        handler: Option<SigHandler>,
    ) -> Option<SigHandler> {
        mem::replace(&mut self.task.handlers[sig.slot()], handler)
    }
}

pub struct BgScheduler {
    tasks: HashMap<u64, Task>,
    runq: VecDeque<u64>,
    sleepq: Vec<u64>,
    dead: Vec<Task>,
    runcount: usize,
    current: Option<u64>,
    next_id: u64,
    created: u64,
    completed: u64,
}

impl BgScheduler {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            runq: VecDeque::new(),
            sleepq: Vec::new(),
            dead: Vec::new(),
            runcount: 0,
            current: None,
            next_id: 1,
            created: 0,
            completed: 0,
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Create a task and make it runnable.
    ///
    /// Steps run in sequence; the optional `done` callback fires once with
    /// the final status. Without it, an abnormal status is retained until
    /// read through [`exit_status`](Self::exit_status).
    pub fn task_create(
        &mut self,
        name: impl Into<String>,
        steps: Vec<StepFn>,
        done: Option<DoneFn>,
    ) -> TaskHandle {
        assert!(!steps.is_empty(), "a task needs at least one step");
        let id = self.alloc_id();
        let mut task = Task::new(name.into(), steps, false, done);
        task.runnable = true;
        self.tasks.insert(id, task);
        self.runq.push_back(id);
        self.runcount += 1;
        self.created += 1;
        TaskHandle(id)
    }

    /// Create a daemon: a task cycling over a work queue, asleep while the
    /// queue is empty. The steps describe the processing of one item.
    pub fn daemon_create(
        &mut self,
        name: impl Into<String>,
        steps: Vec<StepFn>,
        hooks: DaemonHooks,
    ) -> TaskHandle {
        assert!(!steps.is_empty(), "a daemon needs at least one step");
        let id = self.alloc_id();
        let mut task = Task::new(name.into(), steps, true, None);
        task.hooks = Some(hooks);
        task.sleeping = true;
        self.tasks.insert(id, task);
        self.sleepq.push(id);
        self.created += 1;
        TaskHandle(id)
    }

    /// Append a work item; wakes the daemon if it was sleeping.
    pub fn daemon_enqueue(&mut self, handle: TaskHandle, item: WorkItem) -> bool {
        let id = handle.0;
        let Some(task) = self.tasks.get_mut(&id) else {
            return false;
        };
        if !task.daemon || task.exited {
            return false;
        }
        task.queue.push_back(item);
        if task.sleeping {
            debug!(task = %task.name, "waking daemon");
            task.sleeping = false;
            task.runnable = true;
            self.sleepq.retain(|x| *x != id);
            self.runq.push_back(id);
            self.runcount += 1;
            if let Some(hooks) = task.hooks.as_mut() {
                if let Some(notify) = hooks.notify.as_mut() {
                    notify(true);
                }
            }
        }
        true
    }

    /// Install or remove a signal handler from outside the task, returning
    /// the previous one.
    pub fn install_signal(
        &mut self,
        handle: TaskHandle,
        sig: BgSignal,
        handler: Option<SigHandler>,
    ) -> Option<SigHandler> {
        let task = self.tasks.get_mut(&handle.0)?;
        mem::replace(&mut task.handlers[sig.slot()], handler)
    }

    /// Send a signal. `Kill` terminates synchronously; other signals queue
    /// for delivery before the task's next step and are dropped when no
    /// handler is installed.
    pub fn send_signal(&mut self, handle: TaskHandle, sig: BgSignal) -> bool {
        let id = handle.0;
        {
            let Some(task) = self.tasks.get_mut(&id) else {
                return false;
            };
            if task.exited {
                return false;
            }
            match sig {
                BgSignal::Zero => return true,
                BgSignal::Kill => {
                    task.signaled = true;
                    task.last_signal = BgSignal::Kill;
                }
                other => {
                    if task.handlers[other.slot()].is_none() {
                        return true;
                    }
                    task.pending_signals.push_back(other);
                    return true;
                }
            }
        }
        self.terminate_id(id);
        true
    }

    /// Cancel a task: deliver `Term` if a handler is installed (switching
    /// to the task to run it), then `Kill` unless the handler already
    /// exited the task.
    pub fn cancel(&mut self, handle: TaskHandle) {
        let id = handle.0;
        match self.tasks.get(&id) {
            Some(task) if !task.exited => {}
            _ => return,
        }

        let has_term = self
            .tasks
            .get(&id)
            .map(|t| t.handlers[BgSignal::Term.slot()].is_some())
            .unwrap_or(false);
        if has_term && self.deliver_term_switched(id) {
            return;
        }

        let should_kill = match self.tasks.get_mut(&id) {
            Some(task) if !task.exited => {
                task.signaled = true;
                task.last_signal = BgSignal::Kill;
                true
            }
            _ => false,
        };
        if should_kill {
            self.terminate_id(id);
        }
    }

    /// Final status of an exited task. The first read releases a task that
    /// was retained for it.
    pub fn exit_status(&mut self, handle: TaskHandle) -> Option<BgStatus> {
        let id = handle.0;
        let (status, was_zombie) = {
            let task = self.tasks.get(&id)?;
            if !task.exited {
                return None;
            }
            (task.status, task.zombie)
        };
        if was_zombie {
            if let Some(mut task) = self.tasks.remove(&id) {
                task.zombie = false;
                self.dead.push(task);
            }
        }
        status
    }

    pub fn stats(&self) -> BgStats {
        BgStats {
            runnable: self.runq.len(),
            sleeping: self.sleepq.len(),
            zombies: self.tasks.values().filter(|t| t.zombie).count(),
            created: self.created,
            completed: self.completed,
        }
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Run one scheduling pass; the event loop calls this once per second.
    ///
    /// Each runnable task gets at most one activation per pass, as long as
    /// the overall wall-clock budget lasts. Tasks that terminated since the
    /// previous pass are reclaimed at the end.
    pub fn timer(&mut self) {
        debug_assert!(self.current.is_none());
        let mut remain = MAX_SLICE_US;
        let mut rounds = self.runq.len();

        while rounds > 0 && remain > 0 {
            rounds -= 1;
            let Some(id) = self.runq.pop_front() else {
                break;
            };
            let Some(mut task) = self.tasks.remove(&id) else {
                continue;
            };
            task.runnable = false;

            let target = (MAX_SLICE_US / self.runcount.max(1) as i64).max(MIN_SLICE_US);
            task.notick = false;
            let ticks = Self::grant_ticks(&task, target);
            task.ticks = ticks;
            task.ticks_used = ticks;

            task.running = true;
            self.current = Some(id);
            task.start_us = wall_micros();

            // Queued signals are delivered first; one of them may finish
            // the task before the step gets a chance to run.
            if Self::deliver_pending(&mut task) {
                task.notick = true;
                Self::account(&mut task);
                task.running = false;
                self.current = None;
                remain -= task.elapsed_us;
                self.finish_termination(id, task);
                continue;
            }

            if task.daemon && task.step == 0 && task.seqno == 0 {
                debug_assert!(!task.queue.is_empty(), "runnable daemon without work");
                Self::run_start_hook(&mut task);
            }

            let ret = Self::run_step(&mut task, ticks);

            task.running = false;
            self.current = None;
            if ret.is_err() {
                task.notick = true;
            }
            Self::account(&mut task);
            remain -= task.elapsed_us;

            match ret {
                Ok(StepOutcome::Done) => self.task_ended(id, task),
                Ok(StepOutcome::Next) => {
                    if task.step + 1 == task.steps.len() {
                        self.task_ended(id, task);
                    } else {
                        task.step += 1;
                        task.seqno = 0;
                        task.tick_cost = 0.0;
                        self.resched(id, task);
                    }
                }
                Ok(StepOutcome::More) => {
                    task.seqno += 1;
                    self.resched(id, task);
                }
                Ok(StepOutcome::Error) => {
                    task.exit_code = -1;
                    self.finish_termination(id, task);
                }
                Err(TaskExit { code }) => {
                    task.exit_code = code;
                    self.finish_termination(id, task);
                }
            }
        }

        self.reclaim_dead();
    }

    /// Terminate everything still alive. Called at shutdown.
    pub fn close(&mut self) {
        let running: Vec<u64> = self.runq.iter().copied().collect();
        if !running.is_empty() {
            warn!(count = running.len(), "terminating running tasks at close");
        }
        for id in running {
            self.terminate_id(id);
        }

        let sleeping: Vec<u64> = self.sleepq.iter().copied().collect();
        if !sleeping.is_empty() {
            warn!(count = sleeping.len(), "terminating daemon tasks at close");
        }
        for id in sleeping {
            self.terminate_id(id);
        }

        // Whatever remains in the table are zombies awaiting a status read.
        let leftovers: Vec<u64> = self.tasks.keys().copied().collect();
        for id in leftovers {
            if let Some(task) = self.tasks.remove(&id) {
                self.dead.push(task);
            }
        }
        self.reclaim_dead();
    }

    fn resched(&mut self, id: u64, mut task: Task) {
        task.runnable = true;
        self.runq.push_back(id);
        self.tasks.insert(id, task);
    }

    fn grant_ticks(task: &Task, target: i64) -> u32 {
        if task.tick_cost <= 0.0 {
            return 1;
        }
        let mut ticks = 1 + (target as f64 / task.tick_cost) as i64;
        if task.prev_ticks > 0 {
            let prev = task.prev_ticks as i64;
            if ticks > prev * DELTA_FACTOR {
                ticks = prev * DELTA_FACTOR;
            } else if ticks * DELTA_FACTOR < prev {
                ticks = (prev / DELTA_FACTOR).max(1);
            }
        }
        ticks.max(1) as u32
    }

    /// Charge the task for the wall time of its last run and refresh the
    /// per-tick cost estimate (a slow EMA, to smooth variations).
    fn account(task: &mut Task) {
        let end = wall_micros();
        let mut elapsed = end - task.start_us;
        if elapsed < 0 {
            // The wall clock was adjusted backwards while the task ran;
            // reuse the previous measurement, scaled by the tick ratio.
            elapsed = task.elapsed_us;
            if task.prev_ticks != 0 {
                elapsed = elapsed * task.ticks_used as i64 / task.prev_ticks as i64;
            }
        }
        task.elapsed_us = elapsed;
        task.wtime_ms += ((elapsed + 500) / 1000) as u64;
        task.prev_ticks = task.ticks_used;

        if !task.notick && task.ticks_used > 0 {
            task.tick_cost =
                (4.0 * task.tick_cost + elapsed as f64 / task.ticks_used as f64) / 5.0;
        }
    }

    fn run_step(task: &mut Task, ticks: u32) -> StepResult {
        debug_assert!(task.step < task.steps.len());
        let index = task.step;
        let mut steps = mem::take(&mut task.steps);
        let result = (steps[index])(&mut TaskControl { task: &mut *task }, ticks);
        task.steps = steps;
        result
    }

    fn run_start_hook(task: &mut Task) {
        let Some(mut hooks) = task.hooks.take() else {
            return;
        };
        if let Some(mut item) = task.queue.pop_front() {
            (hooks.start)(&mut TaskControl { task: &mut *task }, &mut item);
            task.queue.push_front(item);
        }
        task.hooks = Some(hooks);
    }

    /// Deliver queued signals; returns whether the task must terminate.
    fn deliver_pending(task: &mut Task) -> bool {
        while let Some(sig) = task.pending_signals.pop_front() {
            if Self::dispatch_signal(task, sig) {
                return true;
            }
        }
        false
    }

    /// Run one signal against the task; returns whether it must terminate.
    fn dispatch_signal(task: &mut Task, sig: BgSignal) -> bool {
        match sig {
            BgSignal::Zero => false,
            BgSignal::Kill => {
                task.signaled = true;
                task.last_signal = BgSignal::Kill;
                true
            }
            other => {
                let slot = other.slot();
                let Some(mut handler) = task.handlers[slot].take() else {
                    return false;
                };
                task.signaled = true;
                task.last_signal = other;
                let result = handler(&mut TaskControl { task: &mut *task }, other);
                // Unless the handler installed a replacement, keep it.
                if task.handlers[slot].is_none() {
                    task.handlers[slot] = Some(handler);
                }
                match result {
                    Ok(()) => {
                        task.signaled = false;
                        task.last_signal = BgSignal::Zero;
                        false
                    }
                    Err(TaskExit { code }) => {
                        task.exit_code = code;
                        true
                    }
                }
            }
        }
    }

    /// Switch to the task, deliver `Term` through its handler, and switch
    /// back. Returns whether the handler exited the task.
    fn deliver_term_switched(&mut self, id: u64) -> bool {
        let Some(mut task) = self.tasks.remove(&id) else {
            return false;
        };
        if task.runnable {
            task.runnable = false;
            self.runq.retain(|x| *x != id);
        }
        if task.sleeping {
            task.sleeping = false;
            self.sleepq.retain(|x| *x != id);
            self.runcount += 1;
        }

        task.running = true;
        let prev = self.current.replace(id);
        debug_assert!(prev.is_none());
        task.start_us = wall_micros();
        // The handler's run must not skew the tick cost estimate.
        task.notick = true;

        let terminated = Self::dispatch_signal(&mut task, BgSignal::Term);

        Self::account(&mut task);
        task.running = false;
        self.current = None;

        if terminated {
            self.finish_termination(id, task);
            true
        } else {
            task.runnable = true;
            self.runq.push_back(id);
            self.tasks.insert(id, task);
            false
        }
    }

    fn terminate_id(&mut self, id: u64) {
        let Some(mut task) = self.tasks.remove(&id) else {
            return;
        };
        if task.exited {
            self.tasks.insert(id, task);
            return;
        }
        if task.runnable {
            task.runnable = false;
            self.runq.retain(|x| *x != id);
        }
        if task.sleeping {
            self.sleepq.retain(|x| *x != id);
        }
        self.finish_termination(id, task);
    }

    /// The task is out of every queue; compute its status, notify, and
    /// either retain it for a status read or put it on the dead list to be
    /// reclaimed at the next scheduling pass.
    fn finish_termination(&mut self, id: u64, mut task: Task) {
        debug_assert!(!task.exited);
        debug_assert!(!task.running);
        if task.sleeping {
            task.sleeping = false;
            self.runcount += 1;
        }
        task.exited = true;
        self.runcount = self.runcount.saturating_sub(1);
        self.completed += 1;

        let status = if task.signaled {
            BgStatus::Killed
        } else if task.exit_code != 0 {
            BgStatus::Error(task.exit_code)
        } else {
            BgStatus::Ok
        };
        task.status = Some(status);

        debug!(
            task = %task.name,
            ?status,
            wtime_ms = task.wtime_ms,
            daemon = task.daemon,
            "task terminated"
        );

        if let Some(done) = task.done.take() {
            done(status);
            self.dead.push(task);
        } else if status != BgStatus::Ok {
            task.zombie = true;
            self.tasks.insert(id, task);
        } else {
            self.dead.push(task);
        }
    }

    /// A task finished its processing: terminate it, or for a daemon,
    /// retire the current item and look for more work.
    fn task_ended(&mut self, id: u64, mut task: Task) {
        if !task.daemon {
            self.finish_termination(id, task);
            return;
        }

        debug_assert!(!task.queue.is_empty());
        if let Some(mut hooks) = task.hooks.take() {
            if let Some(mut item) = task.queue.pop_front() {
                (hooks.end)(&mut TaskControl { task: &mut task }, &mut item);
            }
            task.hooks = Some(hooks);
        } else {
            let _ = task.queue.pop_front();
        }

        // A fresh item starts from a clean slate.
        task.tick_cost = 0.0;
        task.seqno = 0;
        task.step = 0;

        if task.queue.is_empty() {
            debug!(task = %task.name, "daemon going back to sleep");
            task.sleeping = true;
            self.runcount = self.runcount.saturating_sub(1);
            self.sleepq.push(id);
            if let Some(hooks) = task.hooks.as_mut() {
                if let Some(notify) = hooks.notify.as_mut() {
                    notify(false);
                }
            }
            self.tasks.insert(id, task);
        } else {
            self.resched(id, task);
        }
    }

    fn reclaim_dead(&mut self) {
        for task in self.dead.drain(..) {
            if !task.queue.is_empty() {
                warn!(
                    task = %task.name,
                    pending = task.queue.len(),
                    "dropping daemon with pending work items"
                );
            }
        }
    }
}

impl Default for BgScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn counting_step(counter: Arc<AtomicU32>, outcomes: Vec<StepResult>) -> StepFn {
        let mut remaining = outcomes.into_iter();
        Box::new(move |_ctl, _ticks| {
            counter.fetch_add(1, Ordering::SeqCst);
            remaining.next().unwrap_or(Ok(StepOutcome::Done))
        })
    }

    fn forever_step(counter: Arc<AtomicU32>) -> StepFn {
        Box::new(move |_ctl, _ticks| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(StepOutcome::More)
        })
    }

    fn capture_done(slot: Arc<Mutex<Option<BgStatus>>>) -> DoneFn {
        Box::new(move |status| {
            *slot.lock().expect("done slot") = Some(status);
        })
    }

    #[test]
    fn multi_step_task_runs_to_completion() {
        let mut sched = BgScheduler::new();
        let calls = Arc::new(AtomicU32::new(0));
        let done = Arc::new(Mutex::new(None));

        let s0 = counting_step(
            calls.clone(),
            vec![Ok(StepOutcome::More), Ok(StepOutcome::Next)],
        );
        let s1 = counting_step(calls.clone(), vec![Ok(StepOutcome::Next)]);
        let s2 = counting_step(calls.clone(), vec![Ok(StepOutcome::Done)]);

        let handle = sched.task_create(
            "three-step",
            vec![s0, s1, s2],
            Some(capture_done(done.clone())),
        );

        // One activation per pass: More, Next, Next, Done.
        for expected in [1u32, 2, 3] {
            sched.timer();
            assert_eq!(calls.load(Ordering::SeqCst), expected);
            assert!(done.lock().unwrap().is_none());
        }
        sched.timer();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(*done.lock().unwrap(), Some(BgStatus::Ok));
        assert_eq!(sched.stats().completed, 1);

        // With a done callback there is no retained status.
        sched.timer();
        assert_eq!(sched.exit_status(handle), None);
        assert_eq!(sched.stats().runnable, 0);
    }

    #[test]
    fn seqno_counts_calls_within_a_step() {
        let mut sched = BgScheduler::new();
        let seqnos = Arc::new(Mutex::new(Vec::new()));
        let log = seqnos.clone();
        let step: StepFn = Box::new(move |ctl, _ticks| {
            log.lock().unwrap().push((ctl.step_index(), ctl.seqno()));
            if ctl.seqno() < 2 {
                Ok(StepOutcome::More)
            } else {
                Ok(StepOutcome::Next)
            }
        });
        let tail: StepFn = Box::new(|ctl, _ticks| {
            assert_eq!(ctl.seqno(), 0);
            Ok(StepOutcome::Done)
        });

        sched.task_create("seqno", vec![step, tail], None);
        for _ in 0..4 {
            sched.timer();
        }
        assert_eq!(*seqnos.lock().unwrap(), vec![(0, 0), (0, 1), (0, 2)]);
    }

    #[test]
    fn error_outcome_terminates_with_error_status() {
        let mut sched = BgScheduler::new();
        let done = Arc::new(Mutex::new(None));
        let step: StepFn = Box::new(|_ctl, _ticks| Ok(StepOutcome::Error));
        sched.task_create("fails", vec![step], Some(capture_done(done.clone())));

        sched.timer();
        assert_eq!(*done.lock().unwrap(), Some(BgStatus::Error(-1)));
    }

    #[test]
    fn task_exit_unwinds_and_retains_status() {
        let mut sched = BgScheduler::new();
        let step: StepFn = Box::new(|ctl, _ticks| Err(ctl.exit(3)));
        let handle = sched.task_create("exits", vec![step], None);

        sched.timer();
        // No done callback: the status is retained until read once.
        assert_eq!(sched.stats().zombies, 1);
        assert_eq!(sched.exit_status(handle), Some(BgStatus::Error(3)));
        sched.timer();
        assert_eq!(sched.exit_status(handle), None);
        assert_eq!(sched.stats().zombies, 0);
    }

    #[test]
    fn task_exit_zero_counts_as_ok() {
        let mut sched = BgScheduler::new();
        let done = Arc::new(Mutex::new(None));
        let step: StepFn = Box::new(|ctl, _ticks| Err(ctl.exit(0)));
        sched.task_create("clean-exit", vec![step], Some(capture_done(done.clone())));

        sched.timer();
        assert_eq!(*done.lock().unwrap(), Some(BgStatus::Ok));
    }

    #[test]
    fn kill_is_synchronous_and_uncatchable() {
        let mut sched = BgScheduler::new();
        let calls = Arc::new(AtomicU32::new(0));
        let handle = sched.task_create("victim", vec![forever_step(calls.clone())], None);

        sched.timer();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(sched.send_signal(handle, BgSignal::Kill));
        assert_eq!(sched.exit_status(handle), Some(BgStatus::Killed));

        // Dead: no further activations, later signals bounce.
        sched.timer();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!sched.send_signal(handle, BgSignal::Kill));
    }

    #[test]
    fn queued_signal_is_delivered_before_the_next_step() {
        let mut sched = BgScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let step_log = order.clone();
        let step: StepFn = Box::new(move |_ctl, _ticks| {
            step_log.lock().unwrap().push("step");
            Ok(StepOutcome::More)
        });
        let handle = sched.task_create("signalled", vec![step], None);

        let sig_log = order.clone();
        let previous = sched.install_signal(
            handle,
            BgSignal::Usr1,
            Some(Box::new(move |_ctl, sig| {
                assert_eq!(sig, BgSignal::Usr1);
                sig_log.lock().unwrap().push("signal");
                Ok(())
            })),
        );
        assert!(previous.is_none());

        sched.timer();
        assert!(sched.send_signal(handle, BgSignal::Usr1));
        sched.timer();

        assert_eq!(*order.lock().unwrap(), vec!["step", "signal", "step"]);
    }

    #[test]
    fn install_signal_replaces_and_returns_previous() {
        let mut sched = BgScheduler::new();
        let calls = Arc::new(AtomicU32::new(0));
        let handle = sched.task_create("replaced", vec![forever_step(calls.clone())], None);

        let first_hits = Arc::new(AtomicU32::new(0));
        let second_hits = Arc::new(AtomicU32::new(0));

        let hits = first_hits.clone();
        let prev = sched.install_signal(
            handle,
            BgSignal::Usr2,
            Some(Box::new(move |_ctl, _sig| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        );
        assert!(prev.is_none());

        let hits = second_hits.clone();
        let prev = sched.install_signal(
            handle,
            BgSignal::Usr2,
            Some(Box::new(move |_ctl, _sig| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        );
        assert!(prev.is_some());

        sched.send_signal(handle, BgSignal::Usr2);
        sched.timer();

        assert_eq!(first_hits.load(Ordering::SeqCst), 0);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unhandled_signals_are_ignored() {
        let mut sched = BgScheduler::new();
        let calls = Arc::new(AtomicU32::new(0));
        let handle = sched.task_create("ignores", vec![forever_step(calls.clone())], None);

        assert!(sched.send_signal(handle, BgSignal::Usr1));
        assert!(sched.send_signal(handle, BgSignal::Zero));
        sched.timer();
        sched.timer();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancel_without_term_handler_kills() {
        let mut sched = BgScheduler::new();
        let calls = Arc::new(AtomicU32::new(0));
        let handle = sched.task_create("cancelled", vec![forever_step(calls.clone())], None);

        sched.cancel(handle);
        assert_eq!(sched.exit_status(handle), Some(BgStatus::Killed));
        sched.timer();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_runs_term_handler_first() {
        let mut sched = BgScheduler::new();
        let calls = Arc::new(AtomicU32::new(0));
        let handle = sched.task_create("graceful", vec![forever_step(calls.clone())], None);

        let cleanup = Arc::new(AtomicU32::new(0));
        let seen = cleanup.clone();
        sched.install_signal(
            handle,
            BgSignal::Term,
            Some(Box::new(move |ctl, _sig| {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(ctl.exit(2))
            })),
        );

        sched.cancel(handle);
        assert_eq!(cleanup.load(Ordering::SeqCst), 1);
        // Exiting from a signal handler counts as a kill.
        assert_eq!(sched.exit_status(handle), Some(BgStatus::Killed));
    }

    #[test]
    fn cancel_kills_when_term_handler_declines() {
        let mut sched = BgScheduler::new();
        let calls = Arc::new(AtomicU32::new(0));
        let handle = sched.task_create("stubborn", vec![forever_step(calls.clone())], None);

        let cleanup = Arc::new(AtomicU32::new(0));
        let seen = cleanup.clone();
        sched.install_signal(
            handle,
            BgSignal::Term,
            Some(Box::new(move |_ctl, _sig| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        );

        sched.cancel(handle);
        assert_eq!(cleanup.load(Ordering::SeqCst), 1);
        assert_eq!(sched.exit_status(handle), Some(BgStatus::Killed));
    }

    #[test]
    fn daemon_cycles_items_and_sleeps() {
        let mut sched = BgScheduler::new();
        let started = Arc::new(AtomicI32::new(0));
        let ended = Arc::new(AtomicI32::new(0));
        let notifications = Arc::new(Mutex::new(Vec::new()));
        let processed = Arc::new(Mutex::new(Vec::new()));

        let started_hook = started.clone();
        let ended_hook = ended.clone();
        let notify_log = notifications.clone();
        let hooks = DaemonHooks {
            start: Box::new(move |_ctl, item| {
                let value = item.downcast_ref::<i32>().copied().unwrap_or(-1);
                started_hook.store(value, Ordering::SeqCst);
            }),
            end: Box::new(move |_ctl, item| {
                let value = item.downcast_ref::<i32>().copied().unwrap_or(-1);
                ended_hook.store(value, Ordering::SeqCst);
            }),
            notify: Some(Box::new(move |awake| {
                notify_log.lock().unwrap().push(awake);
            })),
        };

        let seen = processed.clone();
        let step: StepFn = Box::new(move |ctl, _ticks| {
            let value = ctl
                .item_mut()
                .and_then(|i| i.downcast_ref::<i32>().copied())
                .unwrap_or(-1);
            seen.lock().unwrap().push(value);
            Ok(StepOutcome::Done)
        });

        let handle = sched.daemon_create("worker", vec![step], hooks);
        assert_eq!(sched.stats().sleeping, 1);

        // Sleeping daemon: a pass does nothing.
        sched.timer();
        assert!(processed.lock().unwrap().is_empty());

        assert!(sched.daemon_enqueue(handle, Box::new(7i32)));
        assert!(sched.daemon_enqueue(handle, Box::new(9i32)));
        assert_eq!(*notifications.lock().unwrap(), vec![true]);
        assert_eq!(sched.stats().runnable, 1);

        sched.timer();
        assert_eq!(*processed.lock().unwrap(), vec![7]);
        assert_eq!(started.load(Ordering::SeqCst), 7);
        assert_eq!(ended.load(Ordering::SeqCst), 7);

        sched.timer();
        assert_eq!(*processed.lock().unwrap(), vec![7, 9]);
        assert_eq!(*notifications.lock().unwrap(), vec![true, false]);
        assert_eq!(sched.stats().sleeping, 1);

        // Waking again works.
        assert!(sched.daemon_enqueue(handle, Box::new(11i32)));
        sched.timer();
        assert_eq!(*processed.lock().unwrap(), vec![7, 9, 11]);
    }

    #[test]
    fn daemon_enqueue_rejects_bad_targets() {
        let mut sched = BgScheduler::new();
        let calls = Arc::new(AtomicU32::new(0));
        let plain = sched.task_create("plain", vec![forever_step(calls)], None);
        assert!(!sched.daemon_enqueue(plain, Box::new(1i32)));
        assert!(!sched.daemon_enqueue(TaskHandle(9999), Box::new(1i32)));
    }

    #[test]
    fn each_runnable_task_gets_one_activation_per_pass() {
        let mut sched = BgScheduler::new();
        let a = Arc::new(AtomicU32::new(0));
        let b = Arc::new(AtomicU32::new(0));
        sched.task_create("a", vec![forever_step(a.clone())], None);
        sched.task_create("b", vec![forever_step(b.clone())], None);

        for round in 1..=3u32 {
            sched.timer();
            assert_eq!(a.load(Ordering::SeqCst), round);
            assert_eq!(b.load(Ordering::SeqCst), round);
        }
    }

    #[test]
    fn declared_tick_usage_feeds_the_cost_estimate() {
        let mut task = Task::new("probe".into(), Vec::new(), false, None);
        task.ticks = 100;
        task.ticks_used = 100;
        task.start_us = wall_micros() - 1_000;

        BgScheduler::account(&mut task);
        assert!(task.elapsed_us >= 1_000);
        assert!(task.tick_cost > 0.0);
        let first_cost = task.tick_cost;

        // Declaring zero usage flags the sample as unusable.
        task.notick = true;
        task.ticks_used = 0;
        task.start_us = wall_micros() - 50_000;
        BgScheduler::account(&mut task);
        assert_eq!(task.tick_cost, first_cost);
    }

    #[test]
    fn backwards_clock_reuses_scaled_previous_sample() {
        let mut task = Task::new("probe".into(), Vec::new(), false, None);
        task.elapsed_us = 10_000;
        task.prev_ticks = 10;
        task.ticks = 20;
        task.ticks_used = 20;
        task.notick = false;
        // A start far in the future mimics a backwards clock adjustment.
        task.start_us = wall_micros() + 60_000_000;

        BgScheduler::account(&mut task);
        // Previous sample scaled by ticks ratio: 10_000 * 20 / 10.
        assert_eq!(task.elapsed_us, 20_000);
        assert_eq!(task.prev_ticks, 20);
    }

    #[test]
    fn granted_ticks_are_clamped_against_previous_run() {
        let mut task = Task::new("probe".into(), Vec::new(), false, None);

        // No cost estimate yet: a single tick.
        assert_eq!(BgScheduler::grant_ticks(&task, 150_000), 1);

        // Cheap ticks, but bounded to 4x the previous grant.
        task.tick_cost = 10.0;
        task.prev_ticks = 2;
        assert_eq!(BgScheduler::grant_ticks(&task, 150_000), 8);

        // Expensive ticks: shrink, but never below a quarter.
        task.tick_cost = 1_000_000.0;
        task.prev_ticks = 100;
        assert_eq!(BgScheduler::grant_ticks(&task, 150_000), 25);
    }

    #[test]
    fn close_terminates_everything() {
        let mut sched = BgScheduler::new();
        let calls = Arc::new(AtomicU32::new(0));
        sched.task_create("runner", vec![forever_step(calls.clone())], None);

        let hooks = DaemonHooks {
            start: Box::new(|_ctl, _item| {}),
            end: Box::new(|_ctl, _item| {}),
            notify: None,
        };
        let step: StepFn = Box::new(|_ctl, _ticks| Ok(StepOutcome::Done));
        let daemon = sched.daemon_create("sleeper", vec![step], hooks);
        sched.daemon_enqueue(daemon, Box::new(1i32));

        sched.close();
        let stats = sched.stats();
        assert_eq!(stats.runnable, 0);
        assert_eq!(stats.sleeping, 0);
        assert_eq!(stats.completed, 2);

        sched.timer();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

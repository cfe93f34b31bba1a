//! §4.13 Durable cancellation source: a token that signals at most once,
//! either from an explicit `cancel()` or from a scheduled `cancel_after(delay)`
//! that survives a restart. One of the three structures the spec calls out as
//! having non-trivial replay-order constraints (the other two are the tree
//! and the time-window buffer).
//!
//! Persistence here is batch-on-`AppendEntries`, like [`crate::single_object`],
//! but with a second wrinkle: the in-memory timer that fires a scheduled
//! cancellation also has to get itself durably committed before the token is
//! allowed to signal, and has to roll back cleanly if that commit fails
//! without clobbering a *different*, still-pending schedule set concurrently.

use std::io::Write;
use std::sync::{Arc, Mutex, RwLock};

use durables_base::{invalid_argument, Result};

use crate::clock::Clock;
use crate::entry::{read_header, write_header};
use crate::lifecycle::{LogWriter, StateMachine};
use crate::varint::{read_u8, read_vari64, write_u8, write_vari64};

const TAG_STATE: u32 = 0;

const UNSCHEDULED: Schedule = Schedule {
    request_ticks: -1,
    delay_ticks: -1,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Schedule {
    request_ticks: i64,
    delay_ticks: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct State {
    canceled: bool,
    schedule: Schedule,
}

impl Default for State {
    fn default() -> Self {
        State {
            canceled: false,
            schedule: UNSCHEDULED,
        }
    }
}

impl State {
    fn is_scheduled(&self) -> bool {
        self.schedule != UNSCHEDULED
    }

    fn expiration_ticks(&self) -> Option<i64> {
        self.is_scheduled()
            .then(|| self.schedule.request_ticks + self.schedule.delay_ticks)
    }

    fn is_pending(&self, now_ticks: i64) -> bool {
        self.canceled || self.expiration_ticks().is_some_and(|e| e <= now_ticks)
    }
}

/// An observable, at-most-once-signaling handle. Cloning shares the same
/// underlying signal: every clone observes the same, single transition from
/// unsignaled to signaled.
#[derive(Clone)]
pub struct CancellationToken(Arc<TokenInner>);

struct TokenInner {
    signaled: std::sync::atomic::AtomicBool,
    callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl CancellationToken {
    fn new() -> Self {
        CancellationToken(Arc::new(TokenInner {
            signaled: std::sync::atomic::AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
        }))
    }

    pub fn is_signaled(&self) -> bool {
        self.0.signaled.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Runs `callback` once, either immediately (if already signaled) or the
    /// first time this token signals. Never runs more than once.
    pub fn on_signaled(&self, callback: impl FnOnce() + Send + 'static) {
        if self.is_signaled() {
            callback();
            return;
        }
        let mut callbacks = self.0.callbacks.lock().expect("cancellation token lock");
        if self.is_signaled() {
            drop(callbacks);
            callback();
            return;
        }
        callbacks.push(Box::new(callback));
    }

    fn signal(&self) {
        if self.0.signaled.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let pending = std::mem::take(&mut *self.0.callbacks.lock().expect("cancellation token lock"));
        for callback in pending {
            callback();
        }
    }
}

/// A pending, cancelable delayed call. Best-effort: a timer already in
/// flight when `cancel` is called may still fire, but its body checks the
/// cancellation flag before doing anything observable.
pub struct TimerHandle {
    canceled: Arc<std::sync::atomic::AtomicBool>,
}

impl TimerHandle {
    /// Wraps a shared cancel flag into a handle. For custom [`Scheduler`]
    /// implementations: the flag should be checked immediately before the
    /// scheduled callback runs, and set here whenever `cancel` is called.
    pub fn new(canceled: Arc<std::sync::atomic::AtomicBool>) -> Self {
        TimerHandle { canceled }
    }

    pub fn cancel(&self) {
        self.canceled.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Host-provided delayed-callback facility, injected the same way
/// [`crate::clock::Clock`] and [`crate::codec::ValueCodec`] are.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay_ticks: i64, callback: Box<dyn FnOnce() + Send>) -> TimerHandle;
}

/// Real-time scheduler: sleeps on a detached thread. Adequate for a single
/// armed timer per cancellation source, which is all this structure ever
/// needs concurrently.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay_ticks: i64, callback: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let canceled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let canceled_for_thread = canceled.clone();
        let delay_ms = delay_ticks.max(0) as u64;
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(delay_ms));
            if !canceled_for_thread.load(std::sync::atomic::Ordering::SeqCst) {
                callback();
            }
        });
        TimerHandle { canceled }
    }
}

pub fn thread_scheduler() -> Arc<dyn Scheduler> {
    Arc::new(ThreadScheduler)
}

/// The host hook this structure uses to ask for its own durable write,
/// typically a closure over [`crate::lifecycle::StateMachineManager::write_state`]
/// bound to this structure's key.
pub trait WriteStateRequester: Send + Sync {
    fn request_write(&self) -> Result<()>;
}

pub struct CancellationSource {
    state: Arc<RwLock<State>>,
    token: Mutex<CancellationToken>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    write_state: Arc<dyn WriteStateRequester>,
    timer: Mutex<Option<TimerHandle>>,
}

impl CancellationSource {
    pub fn new(
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
        write_state: Arc<dyn WriteStateRequester>,
    ) -> Self {
        CancellationSource {
            state: Arc::new(RwLock::new(State::default())),
            token: Mutex::new(CancellationToken::new()),
            clock,
            scheduler,
            write_state,
            timer: Mutex::new(None),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.lock().expect("cancellation token lock").clone()
    }

    pub fn is_cancellation_pending(&self) -> bool {
        let state = self.state.read().expect("cancellation state lock");
        state.is_pending(self.clock.now_ticks())
    }

    /// Cancels immediately. `is_cancellation_pending()` observes this right
    /// away, but the token itself only signals once the host next persists
    /// this structure (`on_write_completed`) — same two-phase rule as a
    /// fired `cancel_after` schedule, just without the in-memory timer.
    pub fn cancel(&self) {
        {
            let mut state = self.state.write().expect("cancellation state lock");
            if state.canceled {
                return;
            }
            state.canceled = true;
        }
        if let Some(timer) = self.timer.lock().expect("cancellation timer lock").take() {
            timer.cancel();
        }
    }

    /// Schedules cancellation `delay_ticks` from now, unless an
    /// already-scheduled cancellation would expire no later. Re-arms the
    /// in-memory timer when this call actually moves the expiration earlier.
    pub fn cancel_after(&self, delay_ticks: i64) -> Result<()> {
        if delay_ticks < 0 {
            return Err(invalid_argument("cancel_after delay must be >= 0"));
        }
        let now = self.clock.now_ticks();
        let new_expiration = now + delay_ticks;

        let should_arm = {
            let mut state = self.state.write().expect("cancellation state lock");
            if state.canceled {
                return Ok(());
            }
            let replace = match state.expiration_ticks() {
                Some(existing) => new_expiration < existing,
                None => true,
            };
            if replace {
                state.schedule = Schedule {
                    request_ticks: now,
                    delay_ticks,
                };
            }
            replace
        };

        if should_arm {
            self.arm_timer(delay_ticks.max(0));
        }
        Ok(())
    }

    fn arm_timer(&self, delay_ticks: i64) {
        let mut slot = self.timer.lock().expect("cancellation timer lock");
        if let Some(old) = slot.take() {
            old.cancel();
        }
        let state = self.state.clone();
        let write_state = self.write_state.clone();
        let token = self.token();
        *slot = Some(self.scheduler.schedule(
            delay_ticks,
            Box::new(move || Self::on_timer_fired(state, write_state, token)),
        ));
    }

    /// Commits a fired schedule: snapshots the pre-flip state, flips
    /// `canceled`/clears `schedule` in memory, asks the host to durably
    /// persist, and only signals the token once that succeeds. On failure,
    /// rolls back to the pre-flip snapshot, not to `State::default()`, so an
    /// armed schedule that merely failed to persist stays armed for the next
    /// write instead of vanishing. The rollback only applies if state still
    /// exactly matches what this call set, since a concurrent `cancel_after`
    /// with an earlier deadline may have raced in first, and that one must
    /// win.
    fn on_timer_fired(state: Arc<RwLock<State>>, write_state: Arc<dyn WriteStateRequester>, token: CancellationToken) {
        let (pre_flip, committed) = {
            let mut guard = state.write().expect("cancellation state lock");
            if guard.canceled {
                return;
            }
            let pre_flip = *guard;
            guard.canceled = true;
            guard.schedule = UNSCHEDULED;
            (pre_flip, *guard)
        };

        if write_state.request_write().is_err() {
            let mut guard = state.write().expect("cancellation state lock");
            if *guard == committed {
                *guard = pre_flip;
            }
            return;
        }

        token.signal();
    }

    fn encode_state(state: &State, writer: &mut dyn Write) -> Result<()> {
        write_header(writer, TAG_STATE)?;
        write_u8(writer, state.canceled as u8)?;
        write_u8(writer, state.is_scheduled() as u8)?;
        if state.is_scheduled() {
            write_vari64(writer, state.schedule.request_ticks)?;
            write_vari64(writer, state.schedule.delay_ticks)?;
        }
        Ok(())
    }
}

impl StateMachine for CancellationSource {
    fn reset(&mut self, _log_writer: Arc<dyn LogWriter>) {
        if let Some(timer) = self.timer.lock().expect("cancellation timer lock").take() {
            timer.cancel();
        }
        *self.state.write().expect("cancellation state lock") = State::default();
        *self.token.lock().expect("cancellation token lock") = CancellationToken::new();
    }

    fn apply(&mut self, entry: &[u8]) -> Result<()> {
        let mut cur = std::io::Cursor::new(entry);
        let tag = read_header(&mut cur)?;
        if tag != TAG_STATE {
            return Err(durables_base::unsupported_command(format!("tag {tag}")));
        }
        let canceled = read_u8(&mut cur)? != 0;
        let scheduled = read_u8(&mut cur)? != 0;
        let schedule = if scheduled {
            let request_ticks = read_vari64(&mut cur)?;
            let delay_ticks = read_vari64(&mut cur)?;
            Schedule {
                request_ticks,
                delay_ticks,
            }
        } else {
            UNSCHEDULED
        };
        *self.state.write().expect("cancellation state lock") = State { canceled, schedule };
        Ok(())
    }

    /// Only on recovery does this structure arm its timer or signal its
    /// token; replay itself just reconstructs `State`.
    fn on_recovery_completed(&mut self) {
        let state = *self.state.read().expect("cancellation state lock");
        let now = self.clock.now_ticks();
        if state.is_pending(now) {
            self.token().signal();
            return;
        }
        if let Some(expiration) = state.expiration_ticks() {
            self.arm_timer((expiration - now).max(0));
        }
    }

    fn append_entries(&mut self, writer: &mut dyn Write) -> Result<()> {
        let state = *self.state.read().expect("cancellation state lock");
        if state == State::default() {
            return Ok(());
        }
        Self::encode_state(&state, writer)
    }

    fn append_snapshot(&mut self, writer: &mut dyn Write) -> Result<()> {
        let state = *self.state.read().expect("cancellation state lock");
        Self::encode_state(&state, writer)
    }

    fn on_write_completed(&mut self) {
        let state = *self.state.read().expect("cancellation state lock");
        if state.is_pending(self.clock.now_ticks()) {
            self.token().signal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    struct ManualClock(AtomicI64);
    impl Clock for ManualClock {
        fn now_seconds(&self) -> i64 {
            self.0.load(Ordering::SeqCst) / 1000
        }
        fn now_ticks(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }
    impl ManualClock {
        fn set(&self, t: i64) {
            self.0.store(t, Ordering::SeqCst);
        }
    }

    /// Never actually fires; tests that need schedule/replay behavior drive
    /// `on_recovery_completed`/`on_timer_fired` logic directly rather than
    /// waiting on a real timer.
    struct NoopScheduler;
    impl Scheduler for NoopScheduler {
        fn schedule(&self, _delay_ticks: i64, _callback: Box<dyn FnOnce() + Send>) -> TimerHandle {
            TimerHandle {
                canceled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            }
        }
    }

    struct CountingWriteState(AtomicUsize);
    impl WriteStateRequester for CountingWriteState {
        fn request_write(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn source(clock: Arc<ManualClock>) -> CancellationSource {
        CancellationSource::new(clock, Arc::new(NoopScheduler), Arc::new(CountingWriteState(AtomicUsize::new(0))))
    }

    #[test]
    fn cancel_is_immediately_pending_but_token_waits_for_write_completed() {
        let clock = Arc::new(ManualClock(AtomicI64::new(0)));
        let mut src = source(clock);
        let token = src.token();
        assert!(!src.is_cancellation_pending());
        src.cancel();
        assert!(src.is_cancellation_pending());
        assert!(!token.is_signaled(), "token must not fire before a host write-state");
        src.on_write_completed();
        assert!(token.is_signaled());
    }

    #[test]
    fn cancel_after_is_pending_once_delay_elapses() {
        let clock = Arc::new(ManualClock(AtomicI64::new(0)));
        let src = source(clock.clone());
        src.cancel_after(100).unwrap();
        assert!(!src.is_cancellation_pending());
        clock.set(99);
        assert!(!src.is_cancellation_pending());
        clock.set(100);
        assert!(src.is_cancellation_pending());
    }

    #[test]
    fn cancel_after_only_moves_deadline_earlier() {
        let clock = Arc::new(ManualClock(AtomicI64::new(0)));
        let src = source(clock.clone());
        src.cancel_after(100).unwrap();
        src.cancel_after(500).unwrap();
        clock.set(100);
        assert!(src.is_cancellation_pending(), "earlier deadline must still win");
    }

    #[test]
    fn cancel_after_replaces_when_new_deadline_is_earlier() {
        let clock = Arc::new(ManualClock(AtomicI64::new(0)));
        let src = source(clock.clone());
        src.cancel_after(500).unwrap();
        src.cancel_after(50).unwrap();
        clock.set(50);
        assert!(src.is_cancellation_pending());
    }

    #[test]
    fn rejects_negative_delay() {
        let clock = Arc::new(ManualClock(AtomicI64::new(0)));
        let src = source(clock);
        assert!(src.cancel_after(-1).is_err());
    }

    struct FailingWriteState;
    impl WriteStateRequester for FailingWriteState {
        fn request_write(&self) -> Result<()> {
            Err(durables_base::storage_failure("write rejected"))
        }
    }

    #[test]
    fn timer_fired_rollback_restores_pre_flip_schedule_not_default() {
        let armed = Schedule {
            request_ticks: 0,
            delay_ticks: 100,
        };
        let state = Arc::new(RwLock::new(State {
            canceled: false,
            schedule: armed,
        }));
        let token = CancellationToken::new();

        CancellationSource::on_timer_fired(state.clone(), Arc::new(FailingWriteState), token.clone());

        let restored = *state.read().unwrap();
        assert!(!restored.canceled, "a failed write must not leave canceled=true");
        assert_eq!(restored.schedule, armed, "rollback must restore the pre-flip schedule, not clear it");
        assert!(!token.is_signaled());
    }

    #[test]
    fn append_entries_is_noop_for_default_state() {
        let clock = Arc::new(ManualClock(AtomicI64::new(0)));
        let mut src = source(clock);
        let mut buf = Vec::new();
        src.append_entries(&mut buf).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn snapshot_roundtrip_preserves_schedule() {
        let clock = Arc::new(ManualClock(AtomicI64::new(10)));
        let mut src = source(clock.clone());
        src.cancel_after(90).unwrap();

        let mut buf = Vec::new();
        src.append_snapshot(&mut buf).unwrap();

        let mut fresh = source(clock.clone());
        fresh.apply(&buf).unwrap();
        assert!(!fresh.is_cancellation_pending());
        clock.set(100);
        assert!(fresh.is_cancellation_pending());
    }

    #[test]
    fn on_recovery_completed_signals_immediately_when_already_pending() {
        let clock = Arc::new(ManualClock(AtomicI64::new(200)));
        let mut src = source(clock.clone());
        // request at t=10, delay 90 -> expiration 100, now 200: already due.
        let mut buf = Vec::new();
        {
            let mut state = src.state.write().unwrap();
            state.schedule = Schedule {
                request_ticks: 10,
                delay_ticks: 90,
            };
        }
        CancellationSource::encode_state(&*src.state.read().unwrap(), &mut buf).unwrap();
        let _ = buf;
        let token = src.token();
        src.on_recovery_completed();
        assert!(token.is_signaled());
    }

    struct NullLogWriter;
    impl LogWriter for NullLogWriter {
        fn append(&self, _write_command: &mut dyn FnMut(&mut dyn Write) -> Result<()>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn reset_discards_signaled_token_and_state() {
        let clock = Arc::new(ManualClock(AtomicI64::new(0)));
        let mut src = source(clock);
        src.cancel();
        src.on_write_completed();
        let old_token = src.token();
        assert!(old_token.is_signaled());
        src.reset(Arc::new(NullLogWriter));
        assert!(!src.is_cancellation_pending());
        let new_token = src.token();
        assert!(!new_token.is_signaled());
    }
}

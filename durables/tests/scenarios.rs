//! The six literal end-to-end restart scenarios: push/enqueue against a
//! live instance, simulate a restart through the in-memory harness, then
//! assert the reactivated instance is observationally identical.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use durables::testing::InMemoryLog;
use durables::{
    CancellationSource, Clock, OrderedSetLookup, PriorityQueue, RingBuffer, RmpValueCodec, Scheduler, Stack, StateMachine,
    StateMachineManager, TimerHandle, Tree, WriteStateRequester,
};

fn as_machine<T: StateMachine + 'static>(v: &Arc<Mutex<T>>) -> Arc<Mutex<dyn StateMachine>> {
    v.clone()
}

#[test]
fn s1_stack_persistence() {
    let mut log = InMemoryLog::new();
    let stack = Arc::new(Mutex::new(Stack::<String>::new(Arc::new(RmpValueCodec))));
    log.register("stack".into(), as_machine(&stack));

    stack.lock().unwrap().push("one".into()).unwrap();
    stack.lock().unwrap().push("two".into()).unwrap();
    stack.lock().unwrap().push("three".into()).unwrap();

    let fresh = Arc::new(Mutex::new(Stack::<String>::new(Arc::new(RmpValueCodec))));
    log.reactivate("stack", as_machine(&fresh)).unwrap();

    let mut restored = fresh.lock().unwrap();
    assert_eq!(restored.count(), 3);
    assert_eq!(restored.try_peek(), Some(&"three".to_string()));
    assert_eq!(restored.pop().unwrap(), "three");
    assert_eq!(restored.count(), 2);
}

#[test]
fn s2_priority_queue_restore() {
    let mut log = InMemoryLog::new();
    let queue = Arc::new(Mutex::new(PriorityQueue::<String, i64>::new(
        Arc::new(RmpValueCodec),
        Arc::new(RmpValueCodec),
    )));
    log.register("pq".into(), as_machine(&queue));

    for priority in (1..=100).rev() {
        queue.lock().unwrap().enqueue(format!("item{priority}"), priority).unwrap();
    }
    log.compact("pq").unwrap();

    let fresh = Arc::new(Mutex::new(PriorityQueue::<String, i64>::new(
        Arc::new(RmpValueCodec),
        Arc::new(RmpValueCodec),
    )));
    log.reactivate("pq", as_machine(&fresh)).unwrap();

    let mut restored = fresh.lock().unwrap();
    for expected in 1..=100 {
        let (_, priority) = restored.try_dequeue().unwrap();
        assert_eq!(priority, expected);
    }
    assert!(restored.is_empty());
}

#[test]
fn s3_ordered_set_lookup_order() {
    let mut log = InMemoryLog::new();
    let lookup = Arc::new(Mutex::new(OrderedSetLookup::<String, String>::new(
        Arc::new(RmpValueCodec),
        Arc::new(RmpValueCodec),
    )));
    log.register("lookup".into(), as_machine(&lookup));

    let user = "user-1".to_string();
    lookup.lock().unwrap().add(user.clone(), "product-123".into()).unwrap();
    lookup.lock().unwrap().add(user.clone(), "product-456".into()).unwrap();
    lookup.lock().unwrap().add(user.clone(), "product-123".into()).unwrap();

    let fresh = Arc::new(Mutex::new(OrderedSetLookup::<String, String>::new(
        Arc::new(RmpValueCodec),
        Arc::new(RmpValueCodec),
    )));
    log.reactivate("lookup", as_machine(&fresh)).unwrap();

    assert_eq!(
        fresh.lock().unwrap().get(&user),
        &["product-123".to_string(), "product-456".to_string()]
    );
}

#[test]
fn s4_tree_restore_100_nodes() {
    let mut log = InMemoryLog::new();
    let tree = Arc::new(Mutex::new(Tree::<String>::new(Arc::new(RmpValueCodec))));
    log.register("tree".into(), as_machine(&tree));

    {
        let mut t = tree.lock().unwrap();
        t.set_root("N0".into()).unwrap();
        for i in 1..=99 {
            let parent = format!("N{}", (i - 1) / 3);
            t.add(parent, format!("N{i}")).unwrap();
        }
    }

    let fresh = Arc::new(Mutex::new(Tree::<String>::new(Arc::new(RmpValueCodec))));
    log.reactivate("tree", as_machine(&fresh)).unwrap();

    let restored = fresh.lock().unwrap();
    assert_eq!(restored.count(), 100);
    assert_eq!(restored.root(), Some(&"N0".to_string()));
    for i in 1..=99 {
        let expected_parent = format!("N{}", (i - 1) / 3);
        assert_eq!(restored.try_get_parent(&format!("N{i}")), Some(&expected_parent));
    }
}

#[test]
fn s5_ring_buffer_capacity_change_replay() {
    let mut log = InMemoryLog::new();
    let ring = Arc::new(Mutex::new(RingBuffer::<i64>::new(100, Arc::new(RmpValueCodec)).unwrap()));
    log.register("ring".into(), as_machine(&ring));

    for v in 1..=100 {
        ring.lock().unwrap().enqueue(v).unwrap();
    }
    log.compact("ring").unwrap();

    let reactivated_1 = Arc::new(Mutex::new(RingBuffer::<i64>::new(1, Arc::new(RmpValueCodec)).unwrap()));
    log.reactivate("ring", as_machine(&reactivated_1)).unwrap();
    reactivated_1.lock().unwrap().set_capacity(50).unwrap();
    assert_eq!(
        reactivated_1.lock().unwrap().iter().copied().collect::<Vec<_>>(),
        (51..=100).collect::<Vec<_>>()
    );

    let reactivated_2 = Arc::new(Mutex::new(RingBuffer::<i64>::new(1, Arc::new(RmpValueCodec)).unwrap()));
    log.reactivate("ring", as_machine(&reactivated_2)).unwrap();
    {
        let mut r = reactivated_2.lock().unwrap();
        assert_eq!(r.capacity(), 50);
        assert_eq!(r.iter().copied().collect::<Vec<_>>(), (51..=100).collect::<Vec<_>>());
        r.set_capacity(150).unwrap();
    }

    let reactivated_3 = Arc::new(Mutex::new(RingBuffer::<i64>::new(1, Arc::new(RmpValueCodec)).unwrap()));
    log.reactivate("ring", as_machine(&reactivated_3)).unwrap();
    let restored = reactivated_3.lock().unwrap();
    assert_eq!(restored.capacity(), 150);
    assert_eq!(restored.count(), 50);
    assert_eq!(restored.iter().copied().collect::<Vec<_>>(), (51..=100).collect::<Vec<_>>());
}

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
    fn set(&self, ticks: i64) {
        self.0.store(ticks, Ordering::SeqCst);
    }
}

/// A scheduler driven entirely by explicit `fire_due` calls, so a test can
/// advance a [`ManualClock`] and deterministically trigger whatever timers
/// are now due, with no real sleeping involved.
#[derive(Default)]
struct ManualScheduler {
    pending: Mutex<Vec<(i64, Arc<AtomicBool>, Box<dyn FnOnce() + Send>)>>,
}

impl ManualScheduler {
    fn fire_due(&self, now_ticks: i64) {
        let mut pending = self.pending.lock().unwrap();
        let mut i = 0;
        let mut due = Vec::new();
        while i < pending.len() {
            if pending[i].0 <= now_ticks {
                due.push(pending.remove(i));
            } else {
                i += 1;
            }
        }
        drop(pending);
        for (_, canceled, callback) in due {
            if !canceled.load(Ordering::SeqCst) {
                callback();
            }
        }
    }
}

struct ManualSchedulerHandle {
    clock: Arc<ManualClock>,
    scheduler: Arc<ManualScheduler>,
}

impl Scheduler for ManualSchedulerHandle {
    fn schedule(&self, delay_ticks: i64, callback: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let canceled = Arc::new(AtomicBool::new(false));
        let due = self.clock.now_ticks() + delay_ticks;
        self.scheduler.pending.lock().unwrap().push((due, canceled.clone(), callback));
        TimerHandle::new(canceled)
    }
}

/// Routes the in-memory timer's auto-persist back through the same host
/// the structure is registered against, the way a real host's
/// `write_state(key)` would be wired to a `WriteStateRequester` closure.
struct HostWriteState {
    log: Arc<Mutex<InMemoryLog>>,
    key: String,
}

impl WriteStateRequester for HostWriteState {
    fn request_write(&self) -> durables_base::Result<()> {
        self.log.lock().unwrap().write_state(&self.key)
    }
}

#[test]
fn s6_durable_cancellation_recovery() {
    let clock = Arc::new(ManualClock(AtomicI64::new(0)));
    let scheduler = Arc::new(ManualScheduler::default());
    let log = Arc::new(Mutex::new(InMemoryLog::new()));

    let scheduler_handle = || {
        Arc::new(ManualSchedulerHandle {
            clock: clock.clone(),
            scheduler: scheduler.clone(),
        }) as Arc<dyn Scheduler>
    };
    let write_state_for = |key: &str| {
        Arc::new(HostWriteState {
            log: log.clone(),
            key: key.to_string(),
        }) as Arc<dyn WriteStateRequester>
    };

    let source = Arc::new(Mutex::new(CancellationSource::new(
        clock.clone() as Arc<dyn Clock>,
        scheduler_handle(),
        write_state_for("cancel"),
    )));
    log.lock().unwrap().register("cancel".into(), as_machine(&source));

    source.lock().unwrap().cancel_after(4000).unwrap();
    log.lock().unwrap().write_state("cancel").unwrap();

    clock.set(1000);
    let reactivated_1 = Arc::new(Mutex::new(CancellationSource::new(
        clock.clone() as Arc<dyn Clock>,
        scheduler_handle(),
        write_state_for("cancel"),
    )));
    log.lock().unwrap().reactivate("cancel", as_machine(&reactivated_1)).unwrap();
    assert!(!reactivated_1.lock().unwrap().is_cancellation_pending());

    clock.set(4500);
    scheduler.fire_due(4500);
    assert!(reactivated_1.lock().unwrap().is_cancellation_pending());
    assert!(reactivated_1.lock().unwrap().token().is_signaled());

    let reactivated_2 = Arc::new(Mutex::new(CancellationSource::new(
        clock.clone() as Arc<dyn Clock>,
        scheduler_handle(),
        write_state_for("cancel"),
    )));
    log.lock().unwrap().reactivate("cancel", as_machine(&reactivated_2)).unwrap();
    assert!(reactivated_2.lock().unwrap().is_cancellation_pending());
}

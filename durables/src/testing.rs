//! An in-memory host harness: a [`StateMachineManager`] + per-key
//! [`LogWriter`] pair that needs neither a real log file nor an actor
//! runtime, so the rest of this crate's tests can exercise the full
//! replay/recovery lifecycle directly. Entries are held as plain `Vec<u8>`
//! buffers rather than anything backed by a file, the same standalone-memory
//! role `submerge-coldb`'s `MemReader`/`MemWriter` play for its own log.
//!
//! Gated behind the `testing` feature (on by default) since a real host
//! supplies its own [`StateMachineManager`]/[`LogWriter`] backed by an actual
//! durable log.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use durables_base::{invalid_argument, Result};

use crate::lifecycle::{LogWriter, StateMachine, StateMachineManager};

struct Shared {
    entries: Mutex<HashMap<String, Vec<Vec<u8>>>>,
}

struct KeyedLogWriter {
    shared: Arc<Shared>,
    key: String,
}

impl LogWriter for KeyedLogWriter {
    fn append(&self, write_command: &mut dyn FnMut(&mut dyn Write) -> Result<()>) -> Result<()> {
        let mut buf = Vec::new();
        write_command(&mut buf)?;
        self.shared
            .entries
            .lock()
            .expect("in-memory log lock")
            .entry(self.key.clone())
            .or_default()
            .push(buf);
        Ok(())
    }
}

/// An in-memory append-only log shared by every structure registered
/// against it, plus enough bookkeeping to simulate a process restart.
pub struct InMemoryLog {
    shared: Arc<Shared>,
    machines: HashMap<String, Arc<Mutex<dyn StateMachine>>>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        InMemoryLog {
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
            }),
            machines: HashMap::new(),
        }
    }

    fn writer_for(&self, key: &str) -> Arc<dyn LogWriter> {
        Arc::new(KeyedLogWriter {
            shared: self.shared.clone(),
            key: key.to_string(),
        })
    }

    /// Number of entries recorded for `key`, snapshot included if compacted.
    pub fn entry_count(&self, key: &str) -> usize {
        self.shared
            .entries
            .lock()
            .expect("in-memory log lock")
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Replaces every recorded entry for `key` with a single snapshot entry,
    /// the same compaction a real host performs periodically.
    pub fn compact(&mut self, key: &str) -> Result<()> {
        let machine = self
            .machines
            .get(key)
            .ok_or_else(|| invalid_argument(format!("unknown key {key}")))?;
        let mut buf = Vec::new();
        machine.lock().expect("state machine lock").append_snapshot(&mut buf)?;
        self.shared
            .entries
            .lock()
            .expect("in-memory log lock")
            .insert(key.to_string(), vec![buf]);
        Ok(())
    }

    /// Simulates a restart for `key`: runs `reset` + `apply`* +
    /// `on_recovery_completed` on `fresh` against every entry recorded so
    /// far, then adopts it as the live instance for that key.
    pub fn reactivate(&mut self, key: &str, fresh: Arc<Mutex<dyn StateMachine>>) -> Result<()> {
        let writer = self.writer_for(key);
        let entries = self
            .shared
            .entries
            .lock()
            .expect("in-memory log lock")
            .get(key)
            .cloned()
            .unwrap_or_default();
        {
            let mut machine = fresh.lock().expect("state machine lock");
            machine.reset(writer);
            for entry in &entries {
                machine.apply(entry)?;
            }
            machine.on_recovery_completed();
        }
        self.machines.insert(key.to_string(), fresh);
        Ok(())
    }
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachineManager for InMemoryLog {
    fn register(&mut self, key: String, machine: Arc<Mutex<dyn StateMachine>>) {
        let writer = self.writer_for(&key);
        machine.lock().expect("state machine lock").reset(writer);
        self.shared
            .entries
            .lock()
            .expect("in-memory log lock")
            .entry(key.clone())
            .or_default();
        self.machines.insert(key, machine);
    }

    fn write_state(&mut self, key: &str) -> Result<()> {
        let machine = self
            .machines
            .get(key)
            .ok_or_else(|| invalid_argument(format!("unknown key {key}")))?;
        let mut buf = Vec::new();
        machine.lock().expect("state machine lock").append_entries(&mut buf)?;
        if !buf.is_empty() {
            self.shared
                .entries
                .lock()
                .expect("in-memory log lock")
                .entry(key.to_string())
                .or_default()
                .push(buf);
        }
        machine.lock().expect("state machine lock").on_write_completed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RmpValueCodec;
    use crate::stack::Stack;

    #[test]
    fn write_state_is_noop_for_push_style_structures() {
        let mut log = InMemoryLog::new();
        let stack = Arc::new(Mutex::new(Stack::<String>::new(Arc::new(RmpValueCodec))));
        let as_machine: Arc<Mutex<dyn StateMachine>> = stack.clone();
        log.register("s".into(), as_machine);

        stack.lock().unwrap().push("a".into()).unwrap();
        assert_eq!(log.entry_count("s"), 1);

        log.write_state("s").unwrap();
        assert_eq!(log.entry_count("s"), 1, "push-style write_state appends nothing new");
    }

    #[test]
    fn reactivate_replays_recorded_entries() {
        let mut log = InMemoryLog::new();
        let stack = Arc::new(Mutex::new(Stack::<String>::new(Arc::new(RmpValueCodec))));
        let as_machine: Arc<Mutex<dyn StateMachine>> = stack.clone();
        log.register("s".into(), as_machine);
        stack.lock().unwrap().push("a".into()).unwrap();
        stack.lock().unwrap().push("b".into()).unwrap();

        let fresh = Arc::new(Mutex::new(Stack::<String>::new(Arc::new(RmpValueCodec))));
        let fresh_as_machine: Arc<Mutex<dyn StateMachine>> = fresh.clone();
        log.reactivate("s", fresh_as_machine).unwrap();

        assert_eq!(fresh.lock().unwrap().count(), 2);
        assert_eq!(fresh.lock().unwrap().try_peek(), Some(&"b".to_string()));
    }

    #[test]
    fn compact_replaces_entries_with_a_single_snapshot() {
        let mut log = InMemoryLog::new();
        let stack = Arc::new(Mutex::new(Stack::<String>::new(Arc::new(RmpValueCodec))));
        let as_machine: Arc<Mutex<dyn StateMachine>> = stack.clone();
        log.register("s".into(), as_machine);
        stack.lock().unwrap().push("a".into()).unwrap();
        stack.lock().unwrap().push("b".into()).unwrap();
        assert_eq!(log.entry_count("s"), 2);

        log.compact("s").unwrap();
        assert_eq!(log.entry_count("s"), 1);

        let fresh = Arc::new(Mutex::new(Stack::<String>::new(Arc::new(RmpValueCodec))));
        let fresh_as_machine: Arc<Mutex<dyn StateMachine>> = fresh.clone();
        log.reactivate("s", fresh_as_machine).unwrap();
        assert_eq!(fresh.lock().unwrap().count(), 2);
    }
}

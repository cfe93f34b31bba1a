//! The host ↔ structure contract (spec §6). Every structure in this crate
//! implements [`StateMachine`]; the host (an actor/grain runtime, out of
//! scope here) holds these behind a uniform registry — no inheritance is
//! needed, tagged trait objects suffice, matching the "polymorphism over
//! many structures sharing a lifecycle" design note.

use std::io::Write;
use std::sync::Arc;

use durables_base::Result;

/// A weak back-reference to the host's log, remembered by a structure from
/// `reset` onward and used by push/log-on-mutate structures (every
/// collection except the cancellation source and the single-object
/// container) to append one command entry per successful mutation.
///
/// The closure writes `version`, the command tag, and the command's payload
/// into the buffer the host provides; the host is responsible for framing
/// that buffer into one logical log entry.
pub trait LogWriter: Send + Sync {
    fn append(&self, write_command: &mut dyn FnMut(&mut dyn Write) -> Result<()>) -> Result<()>;
}

/// The lifecycle every durable structure implements. Hooks fire in the order
/// given by the table in spec §6; `on_recovery_completed` and
/// `on_write_completed` default to no-ops since most structures don't need
/// them (only single-object and the cancellation source override both).
pub trait StateMachine: Send {
    /// Clears the structure to empty/default and remembers `log_writer` for
    /// future appends. Called once, before replay begins.
    fn reset(&mut self, log_writer: Arc<dyn LogWriter>);

    /// Decodes and applies one log entry. Called once per entry, in the
    /// order the entries were originally appended (snapshot, if any, first).
    fn apply(&mut self, entry: &[u8]) -> Result<()>;

    /// Optional finalization once the last `apply` of recovery has run.
    fn on_recovery_completed(&mut self) {}

    /// Called on a host write-state. Push-style structures (the default) are
    /// a no-op here, since each mutation already appended its own entry via
    /// `LogWriter`. Batch-style structures (single-object, cancellation
    /// source) write their full pending state into `writer` here, and only
    /// if that state differs from default.
    fn append_entries(&mut self, writer: &mut dyn Write) -> Result<()>;

    /// Emits a self-contained reconstruction of current state into `writer`,
    /// to be stored as a single snapshot entry that replaces any prior log
    /// prefix on compaction.
    fn append_snapshot(&mut self, writer: &mut dyn Write) -> Result<()>;

    /// Called after a durable write succeeds. Most structures ignore this;
    /// single-object latches `record_exists`, and the cancellation source
    /// signals its token if cancellation is pending.
    fn on_write_completed(&mut self) {}
}

/// What a structure is constructed against: registration and an explicit
/// request to persist pending state (used by batch-style structures and by
/// any structure's snapshot path).
pub trait StateMachineManager {
    fn register(&mut self, key: String, machine: Arc<std::sync::Mutex<dyn StateMachine>>);
    fn write_state(&mut self, key: &str) -> Result<()>;
}

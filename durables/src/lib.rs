//! Durable, journaled in-memory state machines.
//!
//! Each structure in this crate owns an in-memory representation and a
//! lifecycle (spec §6: `reset` → `apply`* → `on_recovery_completed` → live
//! mutation → `on_write_completed`) that lets a host replay it from an
//! append-only log of commands. Most structures append one log entry per
//! successful mutation (push/log-on-mutate); the single-object container and
//! the cancellation source instead serialize their whole pending state only
//! when the host asks them to (batch-on-`AppendEntries`).
//!
//! Every public mutator follows the same no-op-invariance rule: if it
//! returns `false`, `None`, or an error, it did not touch state and did not
//! append a log entry.

mod clock;
mod codec;
mod entry;
mod lifecycle;
mod varint;

pub mod cancellation;
pub mod graph;
pub mod lookup;
pub mod ordered_set;
pub mod priority_queue;
pub mod ring_buffer;
pub mod ring_buffer_collection;
pub mod single_object;
pub mod stack;
pub mod time_window_buffer;
pub mod time_window_buffer_collection;
pub mod tree;

#[cfg(feature = "testing")]
pub mod testing;

pub use clock::{system_clock, Clock, SystemClock};
pub use codec::{RmpValueCodec, ValueCodec};
pub use lifecycle::{LogWriter, StateMachine, StateMachineManager};

pub use cancellation::{
    thread_scheduler, CancellationSource, CancellationToken, Scheduler, ThreadScheduler, TimerHandle, WriteStateRequester,
};
pub use graph::Graph;
pub use lookup::{ListLookup, OrderedSetLookup, SetLookup};
pub use ordered_set::OrderedSet;
pub use priority_queue::PriorityQueue;
pub use ring_buffer::RingBuffer;
pub use ring_buffer_collection::RingBufferCollection;
pub use single_object::SingleObject;
pub use stack::Stack;
pub use time_window_buffer::TimeWindowBuffer;
pub use time_window_buffer_collection::TimeWindowBufferCollection;
pub use tree::{Descendants, Tree};

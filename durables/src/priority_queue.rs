//! §4.3 Priority queue: min-heap by priority, lowest priority value wins.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::io::Write;
use std::sync::Arc;

use durables_base::{invalid_operation, Result};

use crate::codec::ValueCodec;
use crate::entry::{read_header, write_header};
use crate::lifecycle::{LogWriter, StateMachine};

const TAG_CLEAR: u32 = 0;
const TAG_SNAPSHOT: u32 = 1;
const TAG_ENQUEUE: u32 = 2;
const TAG_DEQUEUE: u32 = 3;

struct HeapEntry<T, P> {
    priority: P,
    // Tie-break in insertion order so replay, which re-enqueues in the same
    // order, reproduces the exact same pop sequence.
    seq: u64,
    value: T,
}

impl<T, P: Eq> PartialEq for HeapEntry<T, P> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl<T, P: Eq> Eq for HeapEntry<T, P> {}
impl<T, P: Ord> PartialOrd for HeapEntry<T, P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T, P: Ord> Ord for HeapEntry<T, P> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

pub struct PriorityQueue<T, P: Ord> {
    heap: BinaryHeap<Reverse<HeapEntry<T, P>>>,
    next_seq: u64,
    value_codec: Arc<dyn ValueCodec<T>>,
    priority_codec: Arc<dyn ValueCodec<P>>,
    log_writer: Option<Arc<dyn LogWriter>>,
}

impl<T, P: Ord + Clone> PriorityQueue<T, P> {
    pub fn new(value_codec: Arc<dyn ValueCodec<T>>, priority_codec: Arc<dyn ValueCodec<P>>) -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
            value_codec,
            priority_codec,
            log_writer: None,
        }
    }

    pub fn count(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn peek(&self) -> Result<&T> {
        self.heap
            .peek()
            .map(|Reverse(e)| &e.value)
            .ok_or_else(|| invalid_operation("peek on empty priority queue"))
    }

    pub fn try_peek(&self) -> Option<(&T, &P)> {
        self.heap.peek().map(|Reverse(e)| (&e.value, &e.priority))
    }

    pub fn clear(&mut self) -> Result<()> {
        self.heap.clear();
        self.append(TAG_CLEAR, |_| Ok(()))
    }

    pub fn enqueue(&mut self, value: T, priority: P) -> Result<()> {
        let mut payload = Vec::new();
        self.priority_codec.encode(&priority, &mut payload)?;
        self.value_codec.encode(&value, &mut payload)?;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(HeapEntry {
            priority,
            seq,
            value,
        }));
        self.append(TAG_ENQUEUE, move |w| {
            w.write_all(&payload)?;
            Ok(())
        })
    }

    pub fn try_dequeue(&mut self) -> Option<(T, P)> {
        let Reverse(entry) = self.heap.pop()?;
        let _ = self.append(TAG_DEQUEUE, |_| Ok(()));
        Some((entry.value, entry.priority))
    }

    pub fn dequeue(&mut self) -> Result<T> {
        self.try_dequeue()
            .map(|(value, _)| value)
            .ok_or_else(|| invalid_operation("dequeue on empty priority queue"))
    }

    fn append(
        &self,
        tag: u32,
        write_payload: impl FnOnce(&mut dyn Write) -> Result<()> + 'static,
    ) -> Result<()> {
        let Some(log_writer) = self.log_writer.as_ref() else {
            return Ok(());
        };
        let mut write_payload = Some(write_payload);
        log_writer.append(&mut move |w| {
            write_header(w, tag)?;
            (write_payload.take().expect("append invoked once"))(w)
        })
    }
}

impl<T, P> StateMachine for PriorityQueue<T, P>
where
    T: Send + 'static,
    P: Ord + Clone + Send + 'static,
{
    fn reset(&mut self, log_writer: Arc<dyn LogWriter>) {
        self.heap.clear();
        self.next_seq = 0;
        self.log_writer = Some(log_writer);
    }

    fn apply(&mut self, entry: &[u8]) -> Result<()> {
        let mut cur = std::io::Cursor::new(entry);
        let tag = read_header(&mut cur)?;
        match tag {
            TAG_CLEAR => {
                self.heap.clear();
            }
            TAG_SNAPSHOT => {
                self.heap.clear();
                let count = crate::varint::read_varu64(&mut cur)? as usize;
                for _ in 0..count {
                    let priority = self.priority_codec.decode(&mut cur)?;
                    let value = self.value_codec.decode(&mut cur)?;
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    self.heap.push(Reverse(HeapEntry {
                        priority,
                        seq,
                        value,
                    }));
                }
            }
            TAG_ENQUEUE => {
                let priority = self.priority_codec.decode(&mut cur)?;
                let value = self.value_codec.decode(&mut cur)?;
                let seq = self.next_seq;
                self.next_seq += 1;
                self.heap.push(Reverse(HeapEntry {
                    priority,
                    seq,
                    value,
                }));
            }
            TAG_DEQUEUE => {
                self.heap.pop();
            }
            other => return Err(durables_base::unsupported_command(format!("tag {other}"))),
        }
        Ok(())
    }

    fn append_entries(&mut self, _writer: &mut dyn Write) -> Result<()> {
        Ok(())
    }

    fn append_snapshot(&mut self, writer: &mut dyn Write) -> Result<()> {
        write_header(writer, TAG_SNAPSHOT)?;
        crate::varint::write_varu64(writer, self.heap.len() as u64)?;
        for Reverse(entry) in self.heap.iter() {
            self.priority_codec.encode(&entry.priority, writer)?;
            self.value_codec.encode(&entry.value, writer)?;
        }
        Ok(())
    }
}

//! §4.6 Ring buffer: fixed-capacity FIFO, oldest→newest iteration. Enqueue
//! onto a full buffer evicts the oldest item; `set_capacity` on shrink keeps
//! the newest items, on grow preserves everything (spec's head/tail
//! relocation is an implementation detail of an array-backed ring — a
//! `VecDeque` gives the same observable oldest→newest ordering without it).

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;

use durables_base::{invalid_argument, Result};

use crate::codec::ValueCodec;
use crate::entry::{read_header, write_header};
use crate::lifecycle::{LogWriter, StateMachine};
use crate::varint::{read_varu64, write_varu64};

const TAG_CLEAR: u32 = 0;
const TAG_SNAPSHOT: u32 = 1;
const TAG_SET_CAPACITY: u32 = 2;
const TAG_ENQUEUE: u32 = 3;
const TAG_DEQUEUE: u32 = 4;

pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    codec: Arc<dyn ValueCodec<T>>,
    log_writer: Option<Arc<dyn LogWriter>>,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize, codec: Arc<dyn ValueCodec<T>>) -> Result<Self> {
        if capacity == 0 {
            return Err(invalid_argument("ring buffer capacity must be >= 1"));
        }
        Ok(Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            codec,
            log_writer: None,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    /// Oldest→newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    pub fn contains(&self, value: &T) -> bool
    where
        T: PartialEq,
    {
        self.items.contains(value)
    }

    pub fn copy_to(&self, dst: &mut Vec<T>, offset: usize)
    where
        T: Clone,
    {
        dst.extend(self.items.iter().skip(offset).cloned());
    }

    pub fn drain_to(&mut self, dst: &mut Vec<T>) -> Result<()>
    where
        T: Clone,
    {
        dst.extend(self.items.iter().cloned());
        self.clear()
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.items.is_empty() {
            return Ok(());
        }
        self.items.clear();
        self.append(TAG_CLEAR, |_| Ok(()))
    }

    /// Returns `false` (no log entry) when `capacity` is unchanged.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<bool> {
        if capacity == 0 {
            return Err(invalid_argument("ring buffer capacity must be >= 1"));
        }
        if capacity == self.capacity {
            return Ok(false);
        }
        Self::apply_capacity(&mut self.items, &mut self.capacity, capacity);
        self.append(TAG_SET_CAPACITY, move |w| write_varu64(w, capacity as u64))?;
        Ok(true)
    }

    fn apply_capacity(items: &mut VecDeque<T>, capacity: &mut usize, new_capacity: usize) {
        *capacity = new_capacity;
        while items.len() > new_capacity {
            items.pop_front();
        }
    }

    pub fn enqueue(&mut self, value: T) -> Result<()> {
        let mut payload = Vec::new();
        self.codec.encode(&value, &mut payload)?;
        Self::push_evicting(&mut self.items, self.capacity, value);
        self.append(TAG_ENQUEUE, move |w| {
            w.write_all(&payload)?;
            Ok(())
        })
    }

    fn push_evicting(items: &mut VecDeque<T>, capacity: usize, value: T) {
        if items.len() == capacity {
            items.pop_front();
        }
        items.push_back(value);
    }

    pub fn try_dequeue(&mut self) -> Option<T> {
        let value = self.items.pop_front()?;
        let _ = self.append(TAG_DEQUEUE, |_| Ok(()));
        Some(value)
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

impl<T> StateMachine for RingBuffer<T>
where
    T: Send + 'static,
{
    fn reset(&mut self, log_writer: Arc<dyn LogWriter>) {
        self.items.clear();
        self.log_writer = Some(log_writer);
    }

    fn apply(&mut self, entry: &[u8]) -> Result<()> {
        let mut cur = std::io::Cursor::new(entry);
        let tag = read_header(&mut cur)?;
        match tag {
            TAG_CLEAR => {
                self.items.clear();
            }
            TAG_SNAPSHOT => {
                self.items.clear();
                let count = read_varu64(&mut cur)? as usize;
                let capacity = read_varu64(&mut cur)? as usize;
                self.capacity = capacity.max(1);
                for _ in 0..count {
                    self.items.push_back(self.codec.decode(&mut cur)?);
                }
            }
            TAG_SET_CAPACITY => {
                let capacity = read_varu64(&mut cur)? as usize;
                Self::apply_capacity(&mut self.items, &mut self.capacity, capacity.max(1));
            }
            TAG_ENQUEUE => {
                let value = self.codec.decode(&mut cur)?;
                Self::push_evicting(&mut self.items, self.capacity, value);
            }
            TAG_DEQUEUE => {
                self.items.pop_front();
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
        write_varu64(writer, self.items.len() as u64)?;
        write_varu64(writer, self.capacity as u64)?;
        for item in &self.items {
            self.codec.encode(item, writer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RmpValueCodec;

    fn ring(capacity: usize) -> RingBuffer<i64> {
        RingBuffer::new(capacity, Arc::new(RmpValueCodec)).unwrap()
    }

    #[test]
    fn overwrite_on_full() {
        let mut r = ring(3);
        for v in [1, 2, 3, 4] {
            r.enqueue(v).unwrap();
        }
        assert_eq!(r.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert!(r.set_capacity(2).unwrap());
        assert_eq!(r.iter().copied().collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn grow_then_shrink_preserves_newest() {
        let mut r = ring(3);
        for v in [1, 2, 3] {
            r.enqueue(v).unwrap();
        }
        assert!(r.set_capacity(5).unwrap());
        r.enqueue(4).unwrap();
        r.enqueue(5).unwrap();
        assert_eq!(r.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
        assert!(r.set_capacity(2).unwrap());
        assert_eq!(r.iter().copied().collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn set_capacity_no_op_returns_false() {
        let mut r = ring(3);
        assert!(!r.set_capacity(3).unwrap());
    }

    #[test]
    fn zero_capacity_is_invalid_argument() {
        assert!(RingBuffer::<i64>::new(0, Arc::new(RmpValueCodec)).is_err());
    }

    #[test]
    fn snapshot_restores_capacity_and_order() {
        let mut r = ring(100);
        for v in 1..=100 {
            r.enqueue(v).unwrap();
        }
        let mut buf = Vec::new();
        r.append_snapshot(&mut buf).unwrap();

        let mut fresh = ring(1);
        fresh.apply(&buf).unwrap();
        assert_eq!(fresh.capacity(), 100);
        assert_eq!(fresh.count(), 100);
        fresh.set_capacity(50).unwrap();
        let rest: Vec<_> = fresh.iter().copied().collect();
        assert_eq!(rest, (51..=100).collect::<Vec<_>>());
    }
}

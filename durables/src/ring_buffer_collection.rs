//! §4.7 Ring buffer collection: `K` → independent ring buffer. Shares the
//! per-buffer mechanics of [`crate::ring_buffer::RingBuffer`] but owns one
//! log writer for the whole collection (keyed commands) rather than giving
//! each buffer its own, since buffers come and go at runtime.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::io::Write;
use std::sync::Arc;

use durables_base::{codec_failure, invalid_argument, Result};

use crate::codec::ValueCodec;
use crate::entry::{read_header, write_header};
use crate::lifecycle::{LogWriter, StateMachine};
use crate::varint::{read_varu64, write_varu64};

const TAG_SNAPSHOT: u32 = 0;
const TAG_CLEAR_ALL: u32 = 1;
const TAG_CLEAR_BUFFER: u32 = 2;
const TAG_REMOVE_BUFFER: u32 = 3;
const TAG_SET_CAPACITY: u32 = 4;
const TAG_ENQUEUE_ITEM: u32 = 5;
const TAG_DEQUEUE_ITEM: u32 = 6;

struct BufferState<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BufferState<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
        }
    }

    fn apply_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.items.len() > capacity {
            self.items.pop_front();
        }
    }

    fn push_evicting(&mut self, value: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(value);
    }
}

pub struct RingBufferCollection<K, T> {
    buffers: HashMap<K, BufferState<T>>,
    key_codec: Arc<dyn ValueCodec<K>>,
    value_codec: Arc<dyn ValueCodec<T>>,
    log_writer: Option<Arc<dyn LogWriter>>,
}

impl<K, T> RingBufferCollection<K, T>
where
    K: Eq + Hash + Clone,
{
    pub fn new(key_codec: Arc<dyn ValueCodec<K>>, value_codec: Arc<dyn ValueCodec<T>>) -> Self {
        Self {
            buffers: HashMap::new(),
            key_codec,
            value_codec,
            log_writer: None,
        }
    }

    pub fn count(&self) -> usize {
        self.buffers.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.buffers.keys()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.buffers.contains_key(key)
    }

    pub fn capacity_of(&self, key: &K) -> Option<usize> {
        self.buffers.get(key).map(|b| b.capacity)
    }

    pub fn count_of(&self, key: &K) -> usize {
        self.buffers.get(key).map(|b| b.items.len()).unwrap_or(0)
    }

    pub fn iter_of<'a>(&'a self, key: &K) -> Box<dyn Iterator<Item = &'a T> + 'a> {
        match self.buffers.get(key) {
            Some(b) => Box::new(b.items.iter()),
            None => Box::new(std::iter::empty()),
        }
    }

    /// Creates the buffer if absent; if present, overwrites its capacity
    /// unconditionally (always logs, even when the capacity is unchanged).
    pub fn ensure_buffer(&mut self, key: K, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(invalid_argument("ring buffer capacity must be >= 1"));
        }
        match self.buffers.get_mut(&key) {
            Some(buf) => buf.apply_capacity(capacity),
            None => {
                self.buffers.insert(key.clone(), BufferState::new(capacity));
            }
        }
        self.append_keyed(TAG_SET_CAPACITY, &key, move |w| write_varu64(w, capacity as u64))
    }

    pub fn remove(&mut self, key: &K) -> Result<bool> {
        if self.buffers.remove(key).is_none() {
            return Ok(false);
        }
        self.append_keyed(TAG_REMOVE_BUFFER, key, |_| Ok(()))?;
        Ok(true)
    }

    pub fn clear_buffer(&mut self, key: &K) -> Result<bool> {
        let Some(buf) = self.buffers.get_mut(key) else {
            return Ok(false);
        };
        if buf.items.is_empty() {
            return Ok(false);
        }
        buf.items.clear();
        self.append_keyed(TAG_CLEAR_BUFFER, key, |_| Ok(()))?;
        Ok(true)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.buffers.clear();
        self.append(TAG_CLEAR_ALL, |_| Ok(()))
    }

    pub fn enqueue(&mut self, key: &K, value: T) -> Result<()> {
        let Some(buf) = self.buffers.get_mut(key) else {
            return Err(invalid_argument("enqueue on unknown ring buffer key; call ensure_buffer first"));
        };
        let mut payload = Vec::new();
        self.value_codec.encode(&value, &mut payload)?;
        buf.push_evicting(value);
        self.append_keyed(TAG_ENQUEUE_ITEM, key, move |w| {
            w.write_all(&payload)?;
            Ok(())
        })
    }

    pub fn try_dequeue(&mut self, key: &K) -> Option<T> {
        let value = self.buffers.get_mut(key)?.items.pop_front()?;
        let _ = self.append_keyed(TAG_DEQUEUE_ITEM, key, |_| Ok(()));
        Some(value)
    }

    fn append_keyed(
        &self,
        tag: u32,
        key: &K,
        write_payload: impl FnOnce(&mut dyn Write) -> Result<()> + 'static,
    ) -> Result<()> {
        let mut key_payload = Vec::new();
        self.key_codec.encode(key, &mut key_payload)?;
        self.append(tag, move |w| {
            w.write_all(&key_payload)?;
            write_payload(w)
        })
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

impl<K, T> StateMachine for RingBufferCollection<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Send + 'static,
{
    fn reset(&mut self, log_writer: Arc<dyn LogWriter>) {
        self.buffers.clear();
        self.log_writer = Some(log_writer);
    }

    fn apply(&mut self, entry: &[u8]) -> Result<()> {
        let mut cur = std::io::Cursor::new(entry);
        let tag = read_header(&mut cur)?;
        match tag {
            TAG_SNAPSHOT => {
                self.buffers.clear();
                let buffer_count = read_varu64(&mut cur)? as usize;
                for _ in 0..buffer_count {
                    let key = self.key_codec.decode(&mut cur)?;
                    let capacity = read_varu64(&mut cur)? as usize;
                    let item_count = read_varu64(&mut cur)? as usize;
                    let mut buf = BufferState::new(capacity.max(1));
                    for _ in 0..item_count {
                        buf.items.push_back(self.value_codec.decode(&mut cur)?);
                    }
                    self.buffers.insert(key, buf);
                }
            }
            TAG_CLEAR_ALL => {
                self.buffers.clear();
            }
            TAG_CLEAR_BUFFER => {
                let key = self.key_codec.decode(&mut cur)?;
                if let Some(buf) = self.buffers.get_mut(&key) {
                    buf.items.clear();
                }
            }
            TAG_REMOVE_BUFFER => {
                let key = self.key_codec.decode(&mut cur)?;
                self.buffers.remove(&key);
            }
            TAG_SET_CAPACITY => {
                let key = self.key_codec.decode(&mut cur)?;
                let capacity = read_varu64(&mut cur)? as usize;
                self.buffers
                    .entry(key)
                    .or_insert_with(|| BufferState::new(capacity.max(1)))
                    .apply_capacity(capacity.max(1));
            }
            TAG_ENQUEUE_ITEM => {
                let key = self.key_codec.decode(&mut cur)?;
                let value = self.value_codec.decode(&mut cur)?;
                let Some(buf) = self.buffers.get_mut(&key) else {
                    return Err(codec_failure("enqueue into unknown ring buffer key on replay"));
                };
                buf.push_evicting(value);
            }
            TAG_DEQUEUE_ITEM => {
                let key = self.key_codec.decode(&mut cur)?;
                if let Some(buf) = self.buffers.get_mut(&key) {
                    buf.items.pop_front();
                }
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
        write_varu64(writer, self.buffers.len() as u64)?;
        for (key, buf) in self.buffers.iter() {
            self.key_codec.encode(key, writer)?;
            write_varu64(writer, buf.capacity as u64)?;
            write_varu64(writer, buf.items.len() as u64)?;
            for item in &buf.items {
                self.value_codec.encode(item, writer)?;
            }
        }
        Ok(())
    }
}

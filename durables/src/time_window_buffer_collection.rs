//! §4.9 Time-window buffer collection: `K` → independent time-window buffer.
//! Mirrors [`crate::ring_buffer_collection::RingBufferCollection`] with a
//! window in place of a capacity and a recorded timestamp on each item.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::io::Write;
use std::sync::Arc;

use durables_base::{codec_failure, invalid_argument, Result};

use crate::clock::Clock;
use crate::codec::ValueCodec;
use crate::entry::{read_header, write_header};
use crate::lifecycle::{LogWriter, StateMachine};
use crate::varint::{read_vari64, read_varu64, write_vari64, write_varu64};

const TAG_SNAPSHOT: u32 = 0;
const TAG_CLEAR_ALL: u32 = 1;
const TAG_CLEAR_BUFFER: u32 = 2;
const TAG_REMOVE_BUFFER: u32 = 3;
const TAG_SET_WINDOW: u32 = 4;
const TAG_ENQUEUE_ITEM: u32 = 5;
const TAG_DEQUEUE_ITEM: u32 = 6;

struct BufferState<T> {
    items: VecDeque<(T, i64)>,
    window_seconds: i64,
}

impl<T> BufferState<T> {
    fn new(window_seconds: i64) -> Self {
        Self {
            items: VecDeque::new(),
            window_seconds,
        }
    }

    fn purge_before(&mut self, reference_now: i64) {
        let cutoff = reference_now - self.window_seconds;
        self.items.retain(|(_, ts)| *ts >= cutoff);
    }
}

pub struct TimeWindowBufferCollection<K, T> {
    buffers: HashMap<K, BufferState<T>>,
    clock: Arc<dyn Clock>,
    key_codec: Arc<dyn ValueCodec<K>>,
    value_codec: Arc<dyn ValueCodec<T>>,
    log_writer: Option<Arc<dyn LogWriter>>,
}

impl<K, T> TimeWindowBufferCollection<K, T>
where
    K: Eq + Hash + Clone,
{
    pub fn new(
        clock: Arc<dyn Clock>,
        key_codec: Arc<dyn ValueCodec<K>>,
        value_codec: Arc<dyn ValueCodec<T>>,
    ) -> Self {
        Self {
            buffers: HashMap::new(),
            clock,
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

    pub fn window_of(&self, key: &K) -> Option<i64> {
        self.buffers.get(key).map(|b| b.window_seconds)
    }

    pub fn count_of(&self, key: &K) -> usize {
        self.buffers.get(key).map(|b| b.items.len()).unwrap_or(0)
    }

    pub fn iter_of<'a>(&'a self, key: &K) -> Box<dyn Iterator<Item = &'a T> + 'a> {
        match self.buffers.get(key) {
            Some(b) => Box::new(b.items.iter().map(|(v, _)| v)),
            None => Box::new(std::iter::empty()),
        }
    }

    /// Creates the buffer if absent; if present, overwrites its window
    /// unconditionally (always logs).
    pub fn ensure_buffer(&mut self, key: K, window_seconds: i64) -> Result<()> {
        if window_seconds < 1 {
            return Err(invalid_argument("time window must be >= 1 second"));
        }
        let now = self.clock.now_seconds();
        match self.buffers.get_mut(&key) {
            Some(buf) => {
                buf.window_seconds = window_seconds;
                buf.purge_before(now);
            }
            None => {
                self.buffers.insert(key.clone(), BufferState::new(window_seconds));
            }
        }
        self.append_keyed(TAG_SET_WINDOW, &key, move |w| write_vari64(w, window_seconds))
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

    pub fn enqueue(&mut self, key: &K, value: T) -> Result<()>
    where
        T: Clone,
    {
        let ts = self.clock.now_seconds();
        let Some(buf) = self.buffers.get_mut(key) else {
            return Err(invalid_argument(
                "enqueue on unknown time-window buffer key; call ensure_buffer first",
            ));
        };
        let mut payload = Vec::new();
        self.value_codec.encode(&value, &mut payload)?;
        buf.items.push_back((value, ts));
        buf.purge_before(ts);
        self.append_keyed(TAG_ENQUEUE_ITEM, key, move |w| {
            w.write_all(&payload)?;
            write_vari64(w, ts)
        })
    }

    pub fn try_dequeue(&mut self, key: &K) -> Option<T> {
        let (value, _) = self.buffers.get_mut(key)?.items.pop_front()?;
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

impl<K, T> StateMachine for TimeWindowBufferCollection<K, T>
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
                    let window_seconds = read_vari64(&mut cur)?.max(1);
                    let item_count = read_varu64(&mut cur)? as usize;
                    let mut buf = BufferState::new(window_seconds);
                    for _ in 0..item_count {
                        let value = self.value_codec.decode(&mut cur)?;
                        let ts = read_vari64(&mut cur)?;
                        buf.items.push_back((value, ts));
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
            TAG_SET_WINDOW => {
                let key = self.key_codec.decode(&mut cur)?;
                let window_seconds = read_vari64(&mut cur)?.max(1);
                let now = self.clock.now_seconds();
                let buf = self
                    .buffers
                    .entry(key)
                    .or_insert_with(|| BufferState::new(window_seconds));
                buf.window_seconds = window_seconds;
                buf.purge_before(now);
            }
            TAG_ENQUEUE_ITEM => {
                let key = self.key_codec.decode(&mut cur)?;
                let value = self.value_codec.decode(&mut cur)?;
                let ts = read_vari64(&mut cur)?;
                let Some(buf) = self.buffers.get_mut(&key) else {
                    return Err(codec_failure(
                        "enqueue into unknown time-window buffer key on replay",
                    ));
                };
                buf.items.push_back((value, ts));
                buf.purge_before(ts);
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
            write_vari64(writer, buf.window_seconds)?;
            write_varu64(writer, buf.items.len() as u64)?;
            for (value, ts) in &buf.items {
                self.value_codec.encode(value, writer)?;
                write_vari64(writer, *ts)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RmpValueCodec;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct ManualClock(AtomicI64);
    impl Clock for ManualClock {
        fn now_seconds(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
        fn now_ticks(&self) -> i64 {
            self.0.load(Ordering::SeqCst) * 1000
        }
    }
    impl ManualClock {
        fn set(&self, t: i64) {
            self.0.store(t, Ordering::SeqCst);
        }
    }

    fn collection(clock: Arc<ManualClock>) -> TimeWindowBufferCollection<String, String> {
        TimeWindowBufferCollection::new(clock, Arc::new(RmpValueCodec), Arc::new(RmpValueCodec))
    }

    #[test]
    fn buffers_are_isolated() {
        let clock = Arc::new(ManualClock(AtomicI64::new(0)));
        let mut c = collection(clock.clone());
        c.ensure_buffer("a".into(), 10).unwrap();
        c.ensure_buffer("b".into(), 10).unwrap();
        c.enqueue(&"a".to_string(), "x".into()).unwrap();
        assert_eq!(c.count_of(&"a".to_string()), 1);
        assert_eq!(c.count_of(&"b".to_string()), 0);
    }

    #[test]
    fn snapshot_roundtrip() {
        let clock = Arc::new(ManualClock(AtomicI64::new(0)));
        let mut c = collection(clock.clone());
        c.ensure_buffer("a".into(), 10).unwrap();
        c.enqueue(&"a".to_string(), "x".into()).unwrap();

        let mut buf = Vec::new();
        c.append_snapshot(&mut buf).unwrap();

        let mut fresh = collection(clock);
        fresh.apply(&buf).unwrap();
        assert_eq!(fresh.count(), 1);
        assert_eq!(fresh.iter_of(&"a".to_string()).cloned().collect::<Vec<_>>(), vec!["x".to_string()]);
    }
}

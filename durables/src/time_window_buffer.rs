//! §4.8 Time-window buffer: FIFO of `(item, unix-second timestamp)`, purged
//! on every `enqueue` and `set_window` to entries with
//! `timestamp >= now - window_seconds`.
//!
//! Replay nuance (spec §4.8 "Time source"): an `Enqueue` entry carries its
//! own recorded timestamp, so its purge on replay uses *that* timestamp as
//! "now" — fully deterministic, independent of wall-clock time at recovery.
//! A `SetWindow` entry carries no timestamp, so its purge on replay (like
//! its live counterpart) uses the live clock, matching the original's
//! write-time semantics; this is the one place replay is not ts-for-ts
//! reproducible, and it's intentional (see spec's note on this).

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;

use durables_base::{invalid_argument, Result};

use crate::clock::Clock;
use crate::codec::ValueCodec;
use crate::entry::{read_header, write_header};
use crate::lifecycle::{LogWriter, StateMachine};
use crate::varint::{read_vari64, read_varu64, write_vari64, write_varu64};

const TAG_CLEAR: u32 = 0;
const TAG_SNAPSHOT: u32 = 1;
const TAG_SET_WINDOW: u32 = 2;
const TAG_ENQUEUE: u32 = 3;
const TAG_DEQUEUE: u32 = 4;

pub struct TimeWindowBuffer<T> {
    items: VecDeque<(T, i64)>,
    window_seconds: i64,
    clock: Arc<dyn Clock>,
    codec: Arc<dyn ValueCodec<T>>,
    log_writer: Option<Arc<dyn LogWriter>>,
}

impl<T> TimeWindowBuffer<T> {
    pub fn new(window_seconds: i64, clock: Arc<dyn Clock>, codec: Arc<dyn ValueCodec<T>>) -> Result<Self> {
        if window_seconds < 1 {
            return Err(invalid_argument("time window must be >= 1 second"));
        }
        Ok(Self {
            items: VecDeque::new(),
            window_seconds,
            clock,
            codec,
            log_writer: None,
        })
    }

    pub fn window_seconds(&self) -> i64 {
        self.window_seconds
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Oldest→newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter().map(|(v, _)| v)
    }

    pub fn copy_to(&self, dst: &mut Vec<T>, offset: usize)
    where
        T: Clone,
    {
        dst.extend(self.items.iter().skip(offset).map(|(v, _)| v.clone()));
    }

    pub fn drain_to(&mut self, dst: &mut Vec<T>) -> Result<()>
    where
        T: Clone,
    {
        dst.extend(self.items.iter().map(|(v, _)| v.clone()));
        self.clear()
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.items.is_empty() {
            return Ok(());
        }
        self.items.clear();
        self.append(TAG_CLEAR, |_| Ok(()))
    }

    fn purge_before(&mut self, reference_now: i64) {
        let cutoff = reference_now - self.window_seconds;
        self.items.retain(|(_, ts)| *ts >= cutoff);
    }

    /// Returns `false` (no log entry) when `window` is unchanged.
    pub fn set_window(&mut self, window_seconds: i64) -> Result<bool> {
        if window_seconds < 1 {
            return Err(invalid_argument("time window must be >= 1 second"));
        }
        if window_seconds == self.window_seconds {
            return Ok(false);
        }
        self.window_seconds = window_seconds;
        self.purge_before(self.clock.now_seconds());
        self.append(TAG_SET_WINDOW, move |w| write_vari64(w, window_seconds))?;
        Ok(true)
    }

    pub fn enqueue(&mut self, value: T) -> Result<()>
    where
        T: Clone,
    {
        let ts = self.clock.now_seconds();
        let mut payload = Vec::new();
        self.codec.encode(&value, &mut payload)?;
        self.items.push_back((value, ts));
        self.purge_before(ts);
        self.append(TAG_ENQUEUE, move |w| {
            w.write_all(&payload)?;
            write_vari64(w, ts)
        })
    }

    pub fn try_dequeue(&mut self) -> Option<T> {
        let (value, _) = self.items.pop_front()?;
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

impl<T> StateMachine for TimeWindowBuffer<T>
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
                self.window_seconds = read_vari64(&mut cur)?.max(1);
                let count = read_varu64(&mut cur)? as usize;
                for _ in 0..count {
                    let value = self.codec.decode(&mut cur)?;
                    let ts = read_vari64(&mut cur)?;
                    self.items.push_back((value, ts));
                }
            }
            TAG_SET_WINDOW => {
                self.window_seconds = read_vari64(&mut cur)?.max(1);
                self.purge_before(self.clock.now_seconds());
            }
            TAG_ENQUEUE => {
                let value = self.codec.decode(&mut cur)?;
                let ts = read_vari64(&mut cur)?;
                self.items.push_back((value, ts));
                self.purge_before(ts);
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
        write_vari64(writer, self.window_seconds)?;
        write_varu64(writer, self.items.len() as u64)?;
        for (value, ts) in &self.items {
            self.codec.encode(value, writer)?;
            write_vari64(writer, *ts)?;
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

    fn buffer(window: i64, clock: Arc<ManualClock>) -> TimeWindowBuffer<String> {
        TimeWindowBuffer::new(window, clock, Arc::new(RmpValueCodec)).unwrap()
    }

    #[test]
    fn purges_expired_entries_on_enqueue() {
        let clock = Arc::new(ManualClock(AtomicI64::new(0)));
        let mut b = buffer(10, clock.clone());
        b.enqueue("A".into()).unwrap();
        clock.set(6);
        b.enqueue("B".into()).unwrap();
        clock.set(11);
        b.enqueue("C".into()).unwrap();
        assert_eq!(
            b.iter().cloned().collect::<Vec<_>>(),
            vec!["B".to_string(), "C".to_string()]
        );
    }

    #[test]
    fn shrinking_window_purges_immediately() {
        let clock = Arc::new(ManualClock(AtomicI64::new(0)));
        let mut b = buffer(30, clock.clone());
        b.enqueue("at0".into()).unwrap();
        clock.set(10);
        b.enqueue("at10".into()).unwrap();
        clock.set(20);
        b.enqueue("at20".into()).unwrap();
        assert!(b.set_window(15).unwrap());
        assert_eq!(
            b.iter().cloned().collect::<Vec<_>>(),
            vec!["at10".to_string(), "at20".to_string()]
        );
    }

    #[test]
    fn set_window_no_op_returns_false() {
        let clock = Arc::new(ManualClock(AtomicI64::new(0)));
        let mut b = buffer(10, clock);
        assert!(!b.set_window(10).unwrap());
    }

    #[test]
    fn rejects_sub_second_window() {
        let clock = Arc::new(ManualClock(AtomicI64::new(0)));
        assert!(TimeWindowBuffer::<String>::new(0, clock, Arc::new(RmpValueCodec)).is_err());
    }
}

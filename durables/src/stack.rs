//! §4.2 Stack: LIFO sequence of `T`.

use std::io::Write;
use std::sync::Arc;

use durables_base::{invalid_operation, Result};

use crate::codec::ValueCodec;
use crate::entry::{read_header, write_header};
use crate::lifecycle::{LogWriter, StateMachine};

const TAG_CLEAR: u32 = 0;
const TAG_SNAPSHOT: u32 = 1;
const TAG_PUSH: u32 = 2;
const TAG_POP: u32 = 3;

pub struct Stack<T> {
    // Bottom-to-top; `push`/`pop` act on the back.
    items: Vec<T>,
    codec: Arc<dyn ValueCodec<T>>,
    log_writer: Option<Arc<dyn LogWriter>>,
}

impl<T> Stack<T> {
    pub fn new(codec: Arc<dyn ValueCodec<T>>) -> Self {
        Self {
            items: Vec::new(),
            codec,
            log_writer: None,
        }
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn peek(&self) -> Result<&T> {
        self.items
            .last()
            .ok_or_else(|| invalid_operation("peek on empty stack"))
    }

    pub fn try_peek(&self) -> Option<&T> {
        self.items.last()
    }

    /// Top-to-bottom.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter().rev()
    }

    pub fn clear(&mut self) -> Result<()> {
        self.items.clear();
        self.append(TAG_CLEAR, |_| Ok(()))
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        let mut payload = Vec::new();
        self.codec.encode(&value, &mut payload)?;
        self.items.push(value);
        self.append(TAG_PUSH, move |w| {
            w.write_all(&payload)?;
            Ok(())
        })
    }

    pub fn try_pop(&mut self) -> Option<T> {
        let value = self.items.pop()?;
        // A failure appending here only drops durability of an already
        // in-memory-applied mutation; that's the host's StorageFailure to
        // propagate, matching the error-propagation policy (§7) for every
        // structure but the cancellation source.
        let _ = self.append(TAG_POP, |_| Ok(()));
        Some(value)
    }

    pub fn pop(&mut self) -> Result<T> {
        self.try_pop()
            .ok_or_else(|| invalid_operation("pop on empty stack"))
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

impl<T> StateMachine for Stack<T>
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
                let count = crate::varint::read_varu64(&mut cur)? as usize;
                self.items.reserve(count);
                for _ in 0..count {
                    self.items.push(self.codec.decode(&mut cur)?);
                }
            }
            TAG_PUSH => {
                self.items.push(self.codec.decode(&mut cur)?);
            }
            TAG_POP => {
                self.items.pop();
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
        crate::varint::write_varu64(writer, self.items.len() as u64)?;
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

    fn stack() -> Stack<String> {
        Stack::new(Arc::new(RmpValueCodec))
    }

    #[test]
    fn lifo_order() {
        let mut s = stack();
        s.push("one".into()).unwrap();
        s.push("two".into()).unwrap();
        s.push("three".into()).unwrap();
        assert_eq!(s.pop().unwrap(), "three");
        assert_eq!(
            s.iter().cloned().collect::<Vec<_>>(),
            vec!["two".to_string(), "one".to_string()]
        );
    }

    #[test]
    fn pop_on_empty_fails_without_mutation() {
        let mut s = stack();
        assert!(s.pop().is_err());
        assert_eq!(s.count(), 0);
    }

    #[test]
    fn snapshot_preserves_layout() {
        let mut s = stack();
        s.push("a".into()).unwrap();
        s.push("b".into()).unwrap();
        s.push("c".into()).unwrap();

        let mut buf = Vec::new();
        s.append_snapshot(&mut buf).unwrap();

        let mut fresh = stack();
        fresh.apply(&buf).unwrap();
        assert_eq!(fresh.count(), 3);
        assert_eq!(fresh.pop().unwrap(), "c");
    }
}

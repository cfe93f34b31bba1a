//! §4.4 Ordered set: unique `T` with preserved insertion order.

use std::collections::HashSet;
use std::hash::Hash;
use std::io::Write;
use std::sync::Arc;

use durables_base::Result;

use crate::codec::ValueCodec;
use crate::entry::{read_header, write_header};
use crate::lifecycle::{LogWriter, StateMachine};

const TAG_CLEAR: u32 = 0;
const TAG_SNAPSHOT: u32 = 1;
const TAG_ADD: u32 = 2;
const TAG_REMOVE: u32 = 3;

pub struct OrderedSet<T: Eq + Hash + Clone> {
    members: HashSet<T>,
    order: Vec<T>,
    codec: Arc<dyn ValueCodec<T>>,
    log_writer: Option<Arc<dyn LogWriter>>,
}

impl<T: Eq + Hash + Clone> OrderedSet<T> {
    pub fn new(codec: Arc<dyn ValueCodec<T>>) -> Self {
        Self {
            members: HashSet::new(),
            order: Vec::new(),
            codec,
            log_writer: None,
        }
    }

    pub fn count(&self) -> usize {
        debug_assert_eq!(self.members.len(), self.order.len());
        self.order.len()
    }

    pub fn contains(&self, value: &T) -> bool {
        self.members.contains(value)
    }

    pub fn try_get_value(&self, value: &T) -> Option<&T> {
        self.members.get(value)
    }

    /// Insertion-order view, zero-copy.
    pub fn ordered_items(&self) -> &[T] {
        &self.order
    }

    pub fn copy_to(&self, dst: &mut Vec<T>, offset: usize) {
        dst.extend(self.order.iter().skip(offset).cloned());
    }

    pub fn clear(&mut self) -> Result<()> {
        self.members.clear();
        self.order.clear();
        self.append(TAG_CLEAR, |_| Ok(()))
    }

    pub fn add(&mut self, value: T) -> Result<bool> {
        if !self.members.insert(value.clone()) {
            return Ok(false);
        }
        self.order.push(value.clone());
        let mut payload = Vec::new();
        self.codec.encode(&value, &mut payload)?;
        self.append(TAG_ADD, move |w| {
            w.write_all(&payload)?;
            Ok(())
        })?;
        Ok(true)
    }

    pub fn remove(&mut self, value: &T) -> Result<bool> {
        if !self.members.remove(value) {
            return Ok(false);
        }
        let pos = self
            .order
            .iter()
            .position(|v| v == value)
            .expect("membership invariant: value present in order if present in set");
        self.order.remove(pos);
        let mut payload = Vec::new();
        self.codec.encode(value, &mut payload)?;
        self.append(TAG_REMOVE, move |w| {
            w.write_all(&payload)?;
            Ok(())
        })?;
        Ok(true)
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

    fn insert_no_log(&mut self, value: T) {
        if self.members.insert(value.clone()) {
            self.order.push(value);
        }
    }

    fn remove_no_log(&mut self, value: &T) {
        if self.members.remove(value) {
            if let Some(pos) = self.order.iter().position(|v| v == value) {
                self.order.remove(pos);
            }
        }
    }
}

impl<T> StateMachine for OrderedSet<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    fn reset(&mut self, log_writer: Arc<dyn LogWriter>) {
        self.members.clear();
        self.order.clear();
        self.log_writer = Some(log_writer);
    }

    fn apply(&mut self, entry: &[u8]) -> Result<()> {
        let mut cur = std::io::Cursor::new(entry);
        let tag = read_header(&mut cur)?;
        match tag {
            TAG_CLEAR => {
                self.members.clear();
                self.order.clear();
            }
            TAG_SNAPSHOT => {
                self.members.clear();
                self.order.clear();
                let count = crate::varint::read_varu64(&mut cur)? as usize;
                for _ in 0..count {
                    let value = self.codec.decode(&mut cur)?;
                    self.insert_no_log(value);
                }
            }
            TAG_ADD => {
                let value = self.codec.decode(&mut cur)?;
                self.insert_no_log(value);
            }
            TAG_REMOVE => {
                let value = self.codec.decode(&mut cur)?;
                self.remove_no_log(&value);
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
        crate::varint::write_varu64(writer, self.order.len() as u64)?;
        for item in &self.order {
            self.codec.encode(item, writer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RmpValueCodec;

    fn set() -> OrderedSet<String> {
        OrderedSet::new(Arc::new(RmpValueCodec))
    }

    #[test]
    fn dedups_preserving_order() {
        let mut s = set();
        assert!(s.add("one".into()).unwrap());
        assert!(s.add("two".into()).unwrap());
        assert!(!s.add("one".into()).unwrap());
        assert_eq!(s.count(), 2);
        assert_eq!(s.ordered_items(), &["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn remove_no_op_does_not_log() {
        let mut s = set();
        s.add("a".into()).unwrap();
        assert!(!s.remove(&"missing".to_string()).unwrap());
        assert_eq!(s.count(), 1);
    }
}

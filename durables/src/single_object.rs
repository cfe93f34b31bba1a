//! §4.12 Single-object container: a reference-valued container of `T`.
//! The one batch-on-AppendEntries structure besides the cancellation source
//! — direct mutation of the held value can't be tracked, so every durable
//! write serializes the whole value, not a per-mutation delta.

use std::io::Write;
use std::sync::Arc;

use durables_base::Result;

use crate::codec::ValueCodec;
use crate::entry::{read_header, write_header};
use crate::lifecycle::{LogWriter, StateMachine};

// Single entry form per spec §4.12; the tag is always 0, kept only so this
// structure shares the general `version + tag` framing of every other one.
const TAG_VALUE: u32 = 0;

pub struct SingleObject<T> {
    value: Option<T>,
    record_exists: bool,
    codec: Arc<dyn ValueCodec<T>>,
}

impl<T: Default> SingleObject<T> {
    pub fn new(codec: Arc<dyn ValueCodec<T>>) -> Self {
        Self {
            value: None,
            record_exists: false,
            codec,
        }
    }

    pub fn record_exists(&self) -> bool {
        self.record_exists
    }

    /// Lazily materializes a default instance if none has been loaded yet.
    pub fn value(&mut self) -> &T {
        self.value.get_or_insert_with(T::default)
    }

    /// Direct mutable access; the next `AppendEntries`/`AppendSnapshot`
    /// serializes whatever this leaves behind, since mutation through this
    /// handle can't itself be observed.
    pub fn value_mut(&mut self) -> &mut T {
        self.value.get_or_insert_with(T::default)
    }

    pub fn set(&mut self, v: T) {
        self.value = Some(v);
    }
}

impl<T> StateMachine for SingleObject<T>
where
    T: Send + 'static,
{
    fn reset(&mut self, _log_writer: Arc<dyn LogWriter>) {
        self.value = None;
        self.record_exists = false;
    }

    fn apply(&mut self, entry: &[u8]) -> Result<()> {
        let mut cur = std::io::Cursor::new(entry);
        let tag = read_header(&mut cur)?;
        if tag != TAG_VALUE {
            return Err(durables_base::unsupported_command(format!("tag {tag}")));
        }
        self.value = Some(self.codec.decode(&mut cur)?);
        self.record_exists = true;
        Ok(())
    }

    fn append_entries(&mut self, writer: &mut dyn Write) -> Result<()> {
        let Some(value) = &self.value else {
            return Ok(());
        };
        write_header(writer, TAG_VALUE)?;
        self.codec.encode(value, writer)
    }

    fn append_snapshot(&mut self, writer: &mut dyn Write) -> Result<()> {
        self.append_entries(writer)
    }

    fn on_write_completed(&mut self) {
        self.record_exists = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RmpValueCodec;

    #[test]
    fn value_getter_lazily_constructs_default() {
        let mut obj: SingleObject<String> = SingleObject::new(Arc::new(RmpValueCodec));
        assert!(!obj.record_exists());
        assert_eq!(obj.value(), "");
    }

    #[test]
    fn direct_mutation_is_what_gets_persisted() {
        let mut obj: SingleObject<Vec<i64>> = SingleObject::new(Arc::new(RmpValueCodec));
        obj.value_mut().push(1);
        obj.value_mut().push(2);

        let mut buf = Vec::new();
        obj.append_entries(&mut buf).unwrap();

        let mut fresh: SingleObject<Vec<i64>> = SingleObject::new(Arc::new(RmpValueCodec));
        fresh.apply(&buf).unwrap();
        assert_eq!(fresh.value(), &vec![1, 2]);
        assert!(fresh.record_exists());
    }

    #[test]
    fn on_write_completed_latches_record_exists() {
        let mut obj: SingleObject<String> = SingleObject::new(Arc::new(RmpValueCodec));
        obj.set("hello".into());
        assert!(!obj.record_exists());
        obj.on_write_completed();
        assert!(obj.record_exists());
    }
}

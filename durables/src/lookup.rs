//! §4.5 List / Set / Ordered-set lookups: `K` → collection of `V`.
//!
//! All three share one journaling engine ([`LookupCore`]) generalized over a
//! small [`ValueContainer`] trait that captures the one place their
//! semantics actually differ (duplicates-allowed-ordered vs
//! unique-unordered vs unique-ordered); everything about command tags,
//! snapshotting and the key-becomes-empty cascade is shared.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::io::Write;
use std::sync::Arc;

use durables_base::Result;

use crate::codec::ValueCodec;
use crate::entry::{read_header, write_header};
use crate::lifecycle::{LogWriter, StateMachine};
use crate::varint::{read_varu64, write_varu64};

const TAG_CLEAR: u32 = 0;
const TAG_SNAPSHOT: u32 = 1;
const TAG_ADD: u32 = 2;
const TAG_REMOVE_KEY: u32 = 3;
const TAG_REMOVE_ITEM: u32 = 4;

trait ValueContainer<V>: Default {
    /// Insert one occurrence. List containers always return `true`; set
    /// containers return `false` when `value` was already present.
    fn insert(&mut self, value: V) -> bool;
    /// Remove one occurrence (first occurrence for list, the single match
    /// for set variants). Returns whether anything was removed.
    fn remove_one(&mut self, value: &V) -> bool;
    fn is_empty(&self) -> bool;
    fn len(&self) -> usize;
    fn contains(&self, value: &V) -> bool;
    fn iter_values(&self) -> Box<dyn Iterator<Item = &V> + '_>;
}

#[derive(Default)]
struct ListValues<V>(Vec<V>);
impl<V: PartialEq> ValueContainer<V> for ListValues<V> {
    fn insert(&mut self, value: V) -> bool {
        self.0.push(value);
        true
    }
    fn remove_one(&mut self, value: &V) -> bool {
        match self.0.iter().position(|v| v == value) {
            Some(pos) => {
                self.0.remove(pos);
                true
            }
            None => false,
        }
    }
    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    fn len(&self) -> usize {
        self.0.len()
    }
    fn contains(&self, value: &V) -> bool {
        self.0.iter().any(|v| v == value)
    }
    fn iter_values(&self) -> Box<dyn Iterator<Item = &V> + '_> {
        Box::new(self.0.iter())
    }
}

#[derive(Default)]
struct SetValues<V: Eq + Hash>(HashSet<V>);
impl<V: Eq + Hash> ValueContainer<V> for SetValues<V> {
    fn insert(&mut self, value: V) -> bool {
        self.0.insert(value)
    }
    fn remove_one(&mut self, value: &V) -> bool {
        self.0.remove(value)
    }
    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    fn len(&self) -> usize {
        self.0.len()
    }
    fn contains(&self, value: &V) -> bool {
        self.0.contains(value)
    }
    fn iter_values(&self) -> Box<dyn Iterator<Item = &V> + '_> {
        Box::new(self.0.iter())
    }
}

struct OrderedSetValues<V: Eq + Hash + Clone> {
    set: HashSet<V>,
    order: Vec<V>,
}
impl<V: Eq + Hash + Clone> Default for OrderedSetValues<V> {
    fn default() -> Self {
        Self {
            set: HashSet::new(),
            order: Vec::new(),
        }
    }
}
impl<V: Eq + Hash + Clone> ValueContainer<V> for OrderedSetValues<V> {
    fn insert(&mut self, value: V) -> bool {
        if self.set.insert(value.clone()) {
            self.order.push(value);
            true
        } else {
            false
        }
    }
    fn remove_one(&mut self, value: &V) -> bool {
        if self.set.remove(value) {
            if let Some(pos) = self.order.iter().position(|v| v == value) {
                self.order.remove(pos);
            }
            true
        } else {
            false
        }
    }
    fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
    fn len(&self) -> usize {
        self.set.len()
    }
    fn contains(&self, value: &V) -> bool {
        self.set.contains(value)
    }
    fn iter_values(&self) -> Box<dyn Iterator<Item = &V> + '_> {
        Box::new(self.order.iter())
    }
}

struct LookupCore<K, V, C> {
    map: HashMap<K, C>,
    key_codec: Arc<dyn ValueCodec<K>>,
    value_codec: Arc<dyn ValueCodec<V>>,
    log_writer: Option<Arc<dyn LogWriter>>,
}

impl<K, V, C> LookupCore<K, V, C>
where
    K: Eq + Hash + Clone,
    C: ValueContainer<V> + Default,
{
    fn new(key_codec: Arc<dyn ValueCodec<K>>, value_codec: Arc<dyn ValueCodec<V>>) -> Self {
        Self {
            map: HashMap::new(),
            key_codec,
            value_codec,
            log_writer: None,
        }
    }

    fn count(&self) -> usize {
        self.map.len()
    }

    fn keys(&self) -> impl Iterator<Item = &K> {
        self.map.keys()
    }

    fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    fn get(&self, key: &K) -> Option<&C> {
        self.map.get(key)
    }

    fn iter(&self) -> impl Iterator<Item = (&K, &C)> {
        self.map.iter()
    }

    fn clear(&mut self) -> Result<()> {
        self.map.clear();
        self.append(TAG_CLEAR, |_| Ok(()))
    }

    fn add(&mut self, key: K, value: V) -> Result<bool>
    where
        V: Clone,
    {
        let container = self.map.entry(key.clone()).or_default();
        if !container.insert(value.clone()) {
            if container.is_empty() {
                self.map.remove(&key);
            }
            return Ok(false);
        }
        let mut payload = Vec::new();
        self.key_codec.encode(&key, &mut payload)?;
        self.value_codec.encode(&value, &mut payload)?;
        self.append(TAG_ADD, move |w| {
            w.write_all(&payload)?;
            Ok(())
        })?;
        Ok(true)
    }

    fn remove_key(&mut self, key: &K) -> Result<bool> {
        if self.map.remove(key).is_none() {
            return Ok(false);
        }
        let mut payload = Vec::new();
        self.key_codec.encode(key, &mut payload)?;
        self.append(TAG_REMOVE_KEY, move |w| {
            w.write_all(&payload)?;
            Ok(())
        })?;
        Ok(true)
    }

    fn remove_item(&mut self, key: &K, value: &V) -> Result<bool> {
        let Some(container) = self.map.get_mut(key) else {
            return Ok(false);
        };
        if !container.remove_one(value) {
            return Ok(false);
        }
        if container.is_empty() {
            self.map.remove(key);
        }
        let mut payload = Vec::new();
        self.key_codec.encode(key, &mut payload)?;
        self.value_codec.encode(value, &mut payload)?;
        self.append(TAG_REMOVE_ITEM, move |w| {
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

    fn reset(&mut self, log_writer: Arc<dyn LogWriter>) {
        self.map.clear();
        self.log_writer = Some(log_writer);
    }

    fn apply(&mut self, entry: &[u8]) -> Result<()> {
        let mut cur = std::io::Cursor::new(entry);
        let tag = read_header(&mut cur)?;
        match tag {
            TAG_CLEAR => {
                self.map.clear();
            }
            TAG_SNAPSHOT => {
                self.map.clear();
                let key_count = read_varu64(&mut cur)? as usize;
                for _ in 0..key_count {
                    let key = self.key_codec.decode(&mut cur)?;
                    let value_count = read_varu64(&mut cur)? as usize;
                    let container = self.map.entry(key).or_default();
                    for _ in 0..value_count {
                        let value = self.value_codec.decode(&mut cur)?;
                        container.insert(value);
                    }
                }
            }
            TAG_ADD => {
                let key = self.key_codec.decode(&mut cur)?;
                let value = self.value_codec.decode(&mut cur)?;
                self.map.entry(key).or_default().insert(value);
            }
            TAG_REMOVE_KEY => {
                let key = self.key_codec.decode(&mut cur)?;
                self.map.remove(&key);
            }
            TAG_REMOVE_ITEM => {
                let key = self.key_codec.decode(&mut cur)?;
                let value = self.value_codec.decode(&mut cur)?;
                if let Some(container) = self.map.get_mut(&key) {
                    container.remove_one(&value);
                    if container.is_empty() {
                        self.map.remove(&key);
                    }
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
        write_varu64(writer, self.map.len() as u64)?;
        for (key, container) in self.map.iter() {
            self.key_codec.encode(key, writer)?;
            write_varu64(writer, container.len() as u64)?;
            for value in container.iter_values() {
                self.value_codec.encode(value, writer)?;
            }
        }
        Ok(())
    }
}

macro_rules! forward_state_machine {
    ($ty:ident) => {
        impl<K, V> StateMachine for $ty<K, V>
        where
            K: Eq + Hash + Clone + Send + 'static,
            V: Clone + Send + 'static + PartialEq,
        {
            fn reset(&mut self, log_writer: Arc<dyn LogWriter>) {
                self.core.reset(log_writer)
            }
            fn apply(&mut self, entry: &[u8]) -> Result<()> {
                self.core.apply(entry)
            }
            fn append_entries(&mut self, writer: &mut dyn Write) -> Result<()> {
                self.core.append_entries(writer)
            }
            fn append_snapshot(&mut self, writer: &mut dyn Write) -> Result<()> {
                self.core.append_snapshot(writer)
            }
        }
    };
}

/// `K` → ordered list of `V`, duplicates allowed.
pub struct ListLookup<K, V> {
    core: LookupCore<K, V, ListValues<V>>,
}

impl<K: Eq + Hash + Clone, V: Clone + PartialEq> ListLookup<K, V> {
    pub fn new(key_codec: Arc<dyn ValueCodec<K>>, value_codec: Arc<dyn ValueCodec<V>>) -> Self {
        Self {
            core: LookupCore::new(key_codec, value_codec),
        }
    }

    pub fn add(&mut self, key: K, value: V) -> Result<()> {
        self.core.add(key, value).map(|_| ())
    }

    pub fn add_range(&mut self, key: &K, values: impl IntoIterator<Item = V>) -> Result<()>
    where
        K: Clone,
    {
        for value in values {
            self.core.add(key.clone(), value)?;
        }
        Ok(())
    }

    pub fn remove_key(&mut self, key: &K) -> Result<bool> {
        self.core.remove_key(key)
    }

    pub fn remove(&mut self, key: &K, value: &V) -> Result<bool> {
        self.core.remove_item(key, value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.core.contains_key(key)
    }

    pub fn get(&self, key: &K) -> &[V] {
        self.core
            .get(key)
            .map(|c| c.0.as_slice())
            .unwrap_or(&[])
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.core.keys()
    }

    pub fn count(&self) -> usize {
        self.core.count()
    }

    pub fn clear(&mut self) -> Result<()> {
        self.core.clear()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &[V])> {
        self.core.iter().map(|(k, c)| (k, c.0.as_slice()))
    }
}
forward_state_machine!(ListLookup);

/// `K` → unique set of `V`, insertion order not preserved.
pub struct SetLookup<K, V: Eq + Hash> {
    core: LookupCore<K, V, SetValues<V>>,
}

impl<K: Eq + Hash + Clone, V: Eq + Hash + Clone> SetLookup<K, V> {
    pub fn new(key_codec: Arc<dyn ValueCodec<K>>, value_codec: Arc<dyn ValueCodec<V>>) -> Self {
        Self {
            core: LookupCore::new(key_codec, value_codec),
        }
    }

    pub fn add(&mut self, key: K, value: V) -> Result<bool> {
        self.core.add(key, value)
    }

    pub fn remove_key(&mut self, key: &K) -> Result<bool> {
        self.core.remove_key(key)
    }

    pub fn remove(&mut self, key: &K, value: &V) -> Result<bool> {
        self.core.remove_item(key, value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.core.contains_key(key)
    }

    pub fn contains_item(&self, key: &K, value: &V) -> bool {
        self.core
            .get(key)
            .map(|c| c.contains(value))
            .unwrap_or(false)
    }

    pub fn values(&self, key: &K) -> Box<dyn Iterator<Item = &V> + '_> {
        match self.core.get(key) {
            Some(c) => c.iter_values(),
            None => Box::new(std::iter::empty()),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.core.keys()
    }

    pub fn count(&self) -> usize {
        self.core.count()
    }

    pub fn clear(&mut self) -> Result<()> {
        self.core.clear()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, Box<dyn Iterator<Item = &V> + '_>)> {
        self.core.iter().map(|(k, c)| (k, c.iter_values()))
    }
}
forward_state_machine!(SetLookup);

/// `K` → unique ordered set of `V`.
pub struct OrderedSetLookup<K, V: Eq + Hash + Clone> {
    core: LookupCore<K, V, OrderedSetValues<V>>,
}

impl<K: Eq + Hash + Clone, V: Eq + Hash + Clone> OrderedSetLookup<K, V> {
    pub fn new(key_codec: Arc<dyn ValueCodec<K>>, value_codec: Arc<dyn ValueCodec<V>>) -> Self {
        Self {
            core: LookupCore::new(key_codec, value_codec),
        }
    }

    pub fn add(&mut self, key: K, value: V) -> Result<bool> {
        self.core.add(key, value)
    }

    pub fn remove_key(&mut self, key: &K) -> Result<bool> {
        self.core.remove_key(key)
    }

    pub fn remove(&mut self, key: &K, value: &V) -> Result<bool> {
        self.core.remove_item(key, value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.core.contains_key(key)
    }

    pub fn contains_item(&self, key: &K, value: &V) -> bool {
        self.core
            .get(key)
            .map(|c| c.contains(value))
            .unwrap_or(false)
    }

    pub fn get(&self, key: &K) -> &[V] {
        self.core
            .get(key)
            .map(|c| c.order.as_slice())
            .unwrap_or(&[])
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.core.keys()
    }

    pub fn count(&self) -> usize {
        self.core.count()
    }

    pub fn clear(&mut self) -> Result<()> {
        self.core.clear()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &[V])> {
        self.core.iter().map(|(k, c)| (k, c.order.as_slice()))
    }
}
forward_state_machine!(OrderedSetLookup);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RmpValueCodec;

    #[test]
    fn list_lookup_preserves_duplicates() {
        let mut l: ListLookup<String, String> =
            ListLookup::new(Arc::new(RmpValueCodec), Arc::new(RmpValueCodec));
        l.add("k".into(), "a".into()).unwrap();
        l.add("k".into(), "b".into()).unwrap();
        l.add("k".into(), "a".into()).unwrap();
        l.remove(&"k".to_string(), &"a".to_string()).unwrap();
        assert_eq!(l.get(&"k".to_string()), &["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn set_lookup_deduplicates() {
        let mut s: SetLookup<String, String> =
            SetLookup::new(Arc::new(RmpValueCodec), Arc::new(RmpValueCodec));
        assert!(s.add("k".into(), "a".into()).unwrap());
        assert!(!s.add("k".into(), "a".into()).unwrap());
        assert_eq!(s.values(&"k".to_string()).count(), 1);
    }

    #[test]
    fn ordered_set_lookup_preserves_insertion_order() {
        let mut o: OrderedSetLookup<String, String> =
            OrderedSetLookup::new(Arc::new(RmpValueCodec), Arc::new(RmpValueCodec));
        o.add("k".into(), "c".into()).unwrap();
        o.add("k".into(), "a".into()).unwrap();
        o.add("k".into(), "b".into()).unwrap();
        assert_eq!(
            o.get(&"k".to_string()),
            &["c".to_string(), "a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn removing_last_item_deletes_key() {
        let mut s: SetLookup<String, String> =
            SetLookup::new(Arc::new(RmpValueCodec), Arc::new(RmpValueCodec));
        s.add("k".into(), "a".into()).unwrap();
        assert!(s.remove(&"k".to_string(), &"a".to_string()).unwrap());
        assert!(!s.contains(&"k".to_string()));
        assert_eq!(s.count(), 0);
    }

    #[test]
    fn set_lookup_iterates_key_value_pairs() {
        let mut s: SetLookup<String, String> =
            SetLookup::new(Arc::new(RmpValueCodec), Arc::new(RmpValueCodec));
        s.add("k".into(), "a".into()).unwrap();
        let (key, mut values) = s.iter().next().unwrap();
        assert_eq!(key, "k");
        assert_eq!(values.next(), Some(&"a".to_string()));
    }

    #[test]
    fn ordered_set_lookup_iterates_key_value_pairs() {
        let mut o: OrderedSetLookup<String, String> =
            OrderedSetLookup::new(Arc::new(RmpValueCodec), Arc::new(RmpValueCodec));
        o.add("k".into(), "c".into()).unwrap();
        o.add("k".into(), "a".into()).unwrap();
        let pairs: Vec<_> = o.iter().collect();
        assert_eq!(
            pairs,
            vec![(&"k".to_string(), ["c".to_string(), "a".to_string()].as_slice())]
        );
    }
}

//! §4.10 Tree: rooted, directed, acyclic; unique node values; each
//! non-root node has exactly one parent; removal cascades to descendants.
//!
//! `move`'s asymmetry is intentional (spec §9 open question): a no-op
//! (`new_parent` already is `v`'s parent, or either endpoint is missing)
//! returns `Ok(false)`; a structurally invalid move (cycle, or moving a
//! non-leaf root) raises [`durables_base::ErrorKind::InvalidOperation`].

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::io::Write;
use std::sync::Arc;

use durables_base::{invalid_argument, invalid_operation, Result};

use crate::codec::ValueCodec;
use crate::entry::{read_header, write_header};
use crate::lifecycle::{LogWriter, StateMachine};
use crate::varint::{read_varu64, write_varu64};

const TAG_CLEAR: u32 = 0;
const TAG_SNAPSHOT: u32 = 1;
const TAG_ADD: u32 = 2;
const TAG_REMOVE: u32 = 3;
const TAG_MOVE: u32 = 4;
const TAG_SET_ROOT: u32 = 5;

pub struct Tree<T: Eq + Hash + Clone> {
    root: Option<T>,
    parent: HashMap<T, T>,
    // Insertion-ordered per node; absent key means "no children".
    children: HashMap<T, Vec<T>>,
    codec: Arc<dyn ValueCodec<T>>,
    log_writer: Option<Arc<dyn LogWriter>>,
}

/// Lazy breadth-first walk of a node's descendants (not including the node
/// itself).
pub struct Descendants<'a, T: Eq + Hash + Clone> {
    tree: &'a Tree<T>,
    queue: VecDeque<T>,
}

impl<'a, T: Eq + Hash + Clone> Iterator for Descendants<'a, T> {
    type Item = T;
    fn next(&mut self) -> Option<T> {
        let node = self.queue.pop_front()?;
        if let Some(children) = self.tree.children.get(&node) {
            self.queue.extend(children.iter().cloned());
        }
        Some(node)
    }
}

impl<T: Eq + Hash + Clone> Tree<T> {
    pub fn new(codec: Arc<dyn ValueCodec<T>>) -> Self {
        Self {
            root: None,
            parent: HashMap::new(),
            children: HashMap::new(),
            codec,
            log_writer: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn count(&self) -> usize {
        if self.root.is_some() {
            1 + self.parent.len()
        } else {
            0
        }
    }

    pub fn root(&self) -> Option<&T> {
        self.root.as_ref()
    }

    pub fn contains(&self, v: &T) -> bool {
        self.root.as_ref() == Some(v) || self.parent.contains_key(v)
    }

    pub fn try_get_parent(&self, v: &T) -> Option<&T> {
        self.parent.get(v)
    }

    pub fn get_children(&self, v: &T) -> &[T] {
        self.children.get(v).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get_descendants(&self, v: &T) -> Descendants<'_, T> {
        let mut queue = VecDeque::new();
        if let Some(children) = self.children.get(v) {
            queue.extend(children.iter().cloned());
        }
        Descendants { tree: self, queue }
    }

    /// Breadth-first from the root.
    pub fn iter(&self) -> std::vec::IntoIter<T> {
        let mut out = Vec::with_capacity(self.count());
        if let Some(root) = &self.root {
            let mut queue = VecDeque::new();
            queue.push_back(root.clone());
            while let Some(node) = queue.pop_front() {
                if let Some(children) = self.children.get(&node) {
                    queue.extend(children.iter().cloned());
                }
                out.push(node);
            }
        }
        out.into_iter()
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.root.is_none() {
            return Ok(());
        }
        self.root = None;
        self.parent.clear();
        self.children.clear();
        self.append(TAG_CLEAR, |_| Ok(()))
    }

    pub fn set_root(&mut self, v: T) -> Result<()> {
        if self.root.is_some() {
            return Err(invalid_argument("tree already has a root"));
        }
        let mut payload = Vec::new();
        self.codec.encode(&v, &mut payload)?;
        self.root = Some(v);
        self.append(TAG_SET_ROOT, move |w| {
            w.write_all(&payload)?;
            Ok(())
        })
    }

    pub fn add(&mut self, parent: T, v: T) -> Result<()> {
        if !self.contains(&parent) {
            return Err(invalid_argument("parent not present in tree"));
        }
        if self.contains(&v) {
            return Err(invalid_argument("value already present in tree"));
        }
        let mut payload = Vec::new();
        self.codec.encode(&parent, &mut payload)?;
        self.codec.encode(&v, &mut payload)?;
        self.insert_child(parent, v);
        self.append(TAG_ADD, move |w| {
            w.write_all(&payload)?;
            Ok(())
        })
    }

    pub fn remove(&mut self, v: &T) -> Result<bool> {
        if !self.contains(v) {
            return Ok(false);
        }
        self.remove_subtree(v);
        let mut payload = Vec::new();
        self.codec.encode(v, &mut payload)?;
        self.append(TAG_REMOVE, move |w| {
            w.write_all(&payload)?;
            Ok(())
        })?;
        Ok(true)
    }

    /// Returns `Ok(false)` for a no-op (missing endpoint, `v == new_parent`,
    /// or `new_parent` already is `v`'s parent); raises `InvalidOperation`
    /// for a cycle-forming move or an attempt to move a non-leaf root.
    pub fn move_node(&mut self, v: &T, new_parent: &T) -> Result<bool> {
        if !self.contains(v) || !self.contains(new_parent) {
            return Ok(false);
        }
        if v == new_parent {
            return Ok(false);
        }
        if self.parent.get(v) == Some(new_parent) {
            return Ok(false);
        }
        if self.root.as_ref() == Some(v) {
            if self.count() > 1 {
                return Err(invalid_operation(
                    "cannot move the root of a tree with more than one node",
                ));
            }
            return Ok(false);
        }
        if self.get_descendants(v).any(|d| &d == new_parent) {
            return Err(invalid_operation(
                "move would create a cycle: new parent is a descendant of v",
            ));
        }
        self.reparent(v, new_parent);
        let mut payload = Vec::new();
        self.codec.encode(v, &mut payload)?;
        self.codec.encode(new_parent, &mut payload)?;
        self.append(TAG_MOVE, move |w| {
            w.write_all(&payload)?;
            Ok(())
        })?;
        Ok(true)
    }

    fn insert_child(&mut self, parent: T, child: T) {
        self.parent.insert(child.clone(), parent.clone());
        self.children.entry(parent).or_default().push(child);
    }

    fn reparent(&mut self, v: &T, new_parent: &T) {
        if let Some(old_parent) = self.parent.remove(v) {
            if let Some(siblings) = self.children.get_mut(&old_parent) {
                siblings.retain(|c| c != v);
            }
        }
        self.parent.insert(v.clone(), new_parent.clone());
        self.children.entry(new_parent.clone()).or_default().push(v.clone());
    }

    fn remove_subtree(&mut self, v: &T) {
        if self.root.as_ref() == Some(v) {
            self.root = None;
            self.parent.clear();
            self.children.clear();
            return;
        }
        if let Some(p) = self.parent.remove(v) {
            if let Some(siblings) = self.children.get_mut(&p) {
                siblings.retain(|c| c != v);
            }
        }
        let mut queue = VecDeque::new();
        queue.push_back(v.clone());
        while let Some(node) = queue.pop_front() {
            if let Some(children) = self.children.remove(&node) {
                for child in &children {
                    self.parent.remove(child);
                }
                queue.extend(children);
            }
        }
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

impl<T> StateMachine for Tree<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    fn reset(&mut self, log_writer: Arc<dyn LogWriter>) {
        self.root = None;
        self.parent.clear();
        self.children.clear();
        self.log_writer = Some(log_writer);
    }

    fn apply(&mut self, entry: &[u8]) -> Result<()> {
        let mut cur = std::io::Cursor::new(entry);
        let tag = read_header(&mut cur)?;
        match tag {
            TAG_CLEAR => {
                self.root = None;
                self.parent.clear();
                self.children.clear();
            }
            TAG_SNAPSHOT => {
                self.root = None;
                self.parent.clear();
                self.children.clear();
                let count = read_varu64(&mut cur)? as usize;
                if count == 0 {
                    return Ok(());
                }
                let root = self.codec.decode(&mut cur)?;
                self.root = Some(root);
                for _ in 1..count {
                    let child = self.codec.decode(&mut cur)?;
                    let parent = self.codec.decode(&mut cur)?;
                    self.insert_child(parent, child);
                }
            }
            TAG_ADD => {
                let parent = self.codec.decode(&mut cur)?;
                let child = self.codec.decode(&mut cur)?;
                self.insert_child(parent, child);
            }
            TAG_REMOVE => {
                let v = self.codec.decode(&mut cur)?;
                self.remove_subtree(&v);
            }
            TAG_MOVE => {
                let v = self.codec.decode(&mut cur)?;
                let new_parent = self.codec.decode(&mut cur)?;
                self.reparent(&v, &new_parent);
            }
            TAG_SET_ROOT => {
                let v = self.codec.decode(&mut cur)?;
                self.root = Some(v);
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
        write_varu64(writer, self.count() as u64)?;
        let Some(root) = self.root.clone() else {
            return Ok(());
        };
        self.codec.encode(&root, writer)?;
        let mut queue = VecDeque::new();
        queue.push_back(root);
        while let Some(node) = queue.pop_front() {
            let Some(children) = self.children.get(&node).cloned() else {
                continue;
            };
            for child in &children {
                self.codec.encode(child, writer)?;
                self.codec.encode(&node, writer)?;
                queue.push_back(child.clone());
            }
        }
        Ok(())
    }
}

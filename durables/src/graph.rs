//! §4.11 Graph: directed, node set + per-node outgoing map (dest→edge data)
//! + per-node incoming set; at most one edge per `(src, dst)`; cycles and
//! self-loops allowed.
//!
//! Representation invariant (spec §9 "avoiding cyclic references"): the
//! edge datum lives exactly once, in the source's outgoing map. A
//! destination's incoming set carries only source keys, so [`get_incoming`]
//! is reconstructed by following each incoming source back to its outgoing
//! entry for the node in question.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::io::Write;
use std::sync::Arc;

use durables_base::{invalid_argument, Result};

use crate::codec::ValueCodec;
use crate::entry::{read_header, write_header};
use crate::lifecycle::{LogWriter, StateMachine};
use crate::varint::{read_varu64, write_varu64};

const TAG_CLEAR: u32 = 0;
const TAG_SNAPSHOT: u32 = 1;
const TAG_ADD_NODE: u32 = 2;
const TAG_REMOVE_NODE: u32 = 3;
const TAG_ADD_EDGE: u32 = 4;
const TAG_UPSERT_EDGE: u32 = 5;
const TAG_REMOVE_EDGE: u32 = 6;

pub struct Graph<N: Eq + Hash + Clone, E> {
    nodes: HashSet<N>,
    outgoing: HashMap<N, HashMap<N, E>>,
    incoming: HashMap<N, HashSet<N>>,
    node_codec: Arc<dyn ValueCodec<N>>,
    edge_codec: Arc<dyn ValueCodec<E>>,
    log_writer: Option<Arc<dyn LogWriter>>,
}

impl<N: Eq + Hash + Clone, E: Clone> Graph<N, E> {
    pub fn new(node_codec: Arc<dyn ValueCodec<N>>, edge_codec: Arc<dyn ValueCodec<E>>) -> Self {
        Self {
            nodes: HashSet::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            node_codec,
            edge_codec,
            log_writer: None,
        }
    }

    pub fn count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains_node(&self, v: &N) -> bool {
        self.nodes.contains(v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&N, Option<&HashMap<N, E>>)> {
        self.nodes.iter().map(move |n| (n, self.outgoing.get(n)))
    }

    pub fn get_outgoing<'a>(&'a self, v: &N) -> Box<dyn Iterator<Item = (&'a N, &'a E)> + 'a> {
        match self.outgoing.get(v) {
            Some(m) => Box::new(m.iter()),
            None => Box::new(std::iter::empty()),
        }
    }

    pub fn get_incoming<'a>(&'a self, v: &'a N) -> Box<dyn Iterator<Item = (&'a N, &'a E)> + 'a> {
        match self.incoming.get(v) {
            Some(srcs) => Box::new(srcs.iter().filter_map(move |src| {
                self.outgoing.get(src).and_then(|m| m.get(v)).map(|edge| (src, edge))
            })),
            None => Box::new(std::iter::empty()),
        }
    }

    pub fn get_neighbors(&self, v: &N) -> HashSet<N> {
        let mut out: HashSet<N> = self.outgoing.get(v).map(|m| m.keys().cloned().collect()).unwrap_or_default();
        if let Some(srcs) = self.incoming.get(v) {
            out.extend(srcs.iter().cloned());
        }
        out
    }

    pub fn try_get_edge(&self, src: &N, dst: &N) -> Option<&E> {
        self.outgoing.get(src)?.get(dst)
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.nodes.is_empty() {
            return Ok(());
        }
        self.nodes.clear();
        self.outgoing.clear();
        self.incoming.clear();
        self.append(TAG_CLEAR, |_| Ok(()))
    }

    pub fn add_node(&mut self, v: N) -> Result<bool> {
        if !self.nodes.insert(v.clone()) {
            return Ok(false);
        }
        let mut payload = Vec::new();
        self.node_codec.encode(&v, &mut payload)?;
        self.append(TAG_ADD_NODE, move |w| {
            w.write_all(&payload)?;
            Ok(())
        })?;
        Ok(true)
    }

    pub fn remove_node(&mut self, v: &N) -> Result<bool> {
        if !self.nodes.remove(v) {
            return Ok(false);
        }
        self.detach(v);
        let mut payload = Vec::new();
        self.node_codec.encode(v, &mut payload)?;
        self.append(TAG_REMOVE_NODE, move |w| {
            w.write_all(&payload)?;
            Ok(())
        })?;
        Ok(true)
    }

    fn detach(&mut self, v: &N) {
        if let Some(dsts) = self.outgoing.remove(v) {
            for dst in dsts.keys() {
                if let Some(srcs) = self.incoming.get_mut(dst) {
                    srcs.remove(v);
                }
            }
        }
        if let Some(srcs) = self.incoming.remove(v) {
            for src in &srcs {
                if let Some(dsts) = self.outgoing.get_mut(src) {
                    dsts.remove(v);
                }
            }
        }
    }

    /// `Err(InvalidArgument)` if either endpoint is missing; `Ok(false)` if
    /// the edge already exists.
    pub fn add_edge(&mut self, src: N, dst: N, edge: E) -> Result<bool> {
        self.check_endpoints(&src, &dst)?;
        if self.outgoing.get(&src).map(|m| m.contains_key(&dst)).unwrap_or(false) {
            return Ok(false);
        }
        self.insert_edge(src.clone(), dst.clone(), edge.clone());
        let mut payload = Vec::new();
        self.node_codec.encode(&src, &mut payload)?;
        self.node_codec.encode(&dst, &mut payload)?;
        self.edge_codec.encode(&edge, &mut payload)?;
        self.append(TAG_ADD_EDGE, move |w| {
            w.write_all(&payload)?;
            Ok(())
        })?;
        Ok(true)
    }

    /// `Err(InvalidArgument)` if either endpoint is missing. Creates or
    /// replaces the edge unconditionally.
    pub fn upsert_edge(&mut self, src: N, dst: N, edge: E) -> Result<()> {
        self.check_endpoints(&src, &dst)?;
        self.insert_edge(src.clone(), dst.clone(), edge.clone());
        let mut payload = Vec::new();
        self.node_codec.encode(&src, &mut payload)?;
        self.node_codec.encode(&dst, &mut payload)?;
        self.edge_codec.encode(&edge, &mut payload)?;
        self.append(TAG_UPSERT_EDGE, move |w| {
            w.write_all(&payload)?;
            Ok(())
        })
    }

    pub fn remove_edge(&mut self, src: &N, dst: &N) -> Result<bool> {
        let removed = self.outgoing.get_mut(src).map(|m| m.remove(dst).is_some()).unwrap_or(false);
        if !removed {
            return Ok(false);
        }
        if let Some(srcs) = self.incoming.get_mut(dst) {
            srcs.remove(src);
        }
        let mut payload = Vec::new();
        self.node_codec.encode(src, &mut payload)?;
        self.node_codec.encode(dst, &mut payload)?;
        self.append(TAG_REMOVE_EDGE, move |w| {
            w.write_all(&payload)?;
            Ok(())
        })?;
        Ok(true)
    }

    fn check_endpoints(&self, src: &N, dst: &N) -> Result<()> {
        if !self.nodes.contains(src) || !self.nodes.contains(dst) {
            return Err(invalid_argument("add_edge/upsert_edge endpoint not present in graph"));
        }
        Ok(())
    }

    fn insert_edge(&mut self, src: N, dst: N, edge: E) {
        self.outgoing.entry(src.clone()).or_default().insert(dst.clone(), edge);
        self.incoming.entry(dst).or_default().insert(src);
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

impl<N, E> StateMachine for Graph<N, E>
where
    N: Eq + Hash + Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn reset(&mut self, log_writer: Arc<dyn LogWriter>) {
        self.nodes.clear();
        self.outgoing.clear();
        self.incoming.clear();
        self.log_writer = Some(log_writer);
    }

    fn apply(&mut self, entry: &[u8]) -> Result<()> {
        let mut cur = std::io::Cursor::new(entry);
        let tag = read_header(&mut cur)?;
        match tag {
            TAG_CLEAR => {
                self.nodes.clear();
                self.outgoing.clear();
                self.incoming.clear();
            }
            TAG_SNAPSHOT => {
                self.nodes.clear();
                self.outgoing.clear();
                self.incoming.clear();
                let node_count = read_varu64(&mut cur)? as usize;
                for _ in 0..node_count {
                    let node = self.node_codec.decode(&mut cur)?;
                    self.nodes.insert(node);
                }
                let edge_count = read_varu64(&mut cur)? as usize;
                for _ in 0..edge_count {
                    let src = self.node_codec.decode(&mut cur)?;
                    let dst = self.node_codec.decode(&mut cur)?;
                    let edge = self.edge_codec.decode(&mut cur)?;
                    self.insert_edge(src, dst, edge);
                }
            }
            TAG_ADD_NODE => {
                let node = self.node_codec.decode(&mut cur)?;
                self.nodes.insert(node);
            }
            TAG_REMOVE_NODE => {
                let node = self.node_codec.decode(&mut cur)?;
                self.nodes.remove(&node);
                self.detach(&node);
            }
            TAG_ADD_EDGE | TAG_UPSERT_EDGE => {
                let src = self.node_codec.decode(&mut cur)?;
                let dst = self.node_codec.decode(&mut cur)?;
                let edge = self.edge_codec.decode(&mut cur)?;
                self.insert_edge(src, dst, edge);
            }
            TAG_REMOVE_EDGE => {
                let src = self.node_codec.decode(&mut cur)?;
                let dst = self.node_codec.decode(&mut cur)?;
                if let Some(m) = self.outgoing.get_mut(&src) {
                    m.remove(&dst);
                }
                if let Some(srcs) = self.incoming.get_mut(&dst) {
                    srcs.remove(&src);
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
        write_varu64(writer, self.nodes.len() as u64)?;
        for node in &self.nodes {
            self.node_codec.encode(node, writer)?;
        }
        let edge_count: usize = self.outgoing.values().map(|m| m.len()).sum();
        write_varu64(writer, edge_count as u64)?;
        for (src, dsts) in &self.outgoing {
            for (dst, edge) in dsts {
                self.node_codec.encode(src, writer)?;
                self.node_codec.encode(dst, writer)?;
                self.edge_codec.encode(edge, writer)?;
            }
        }
        Ok(())
    }
}

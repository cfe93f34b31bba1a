//! The "field-framed codec" the spec treats as an external collaborator:
//! each typed field a command carries is written behind a small header (here,
//! a length prefix) so a reader can skip or validate it without already
//! knowing the payload's shape. Structures are generic over [`ValueCodec<T>`]
//! so a host can inject its own wire format; [`RmpValueCodec`] is the default
//! used by this crate's own tests and by [`crate::testing`].
//!
//! Codecs are shared immutably across every command a structure appends or
//! applies (see the ownership design note): a structure holds an
//! `Arc<dyn ValueCodec<T>>`, never a `&mut`.

use std::io::{Read, Write};

use durables_base::{codec_failure, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::varint::{read_bytes, write_bytes};

/// Reads and writes a single user-supplied value as one length-framed field.
pub trait ValueCodec<T>: Send + Sync {
    fn encode(&self, value: &T, w: &mut dyn Write) -> Result<()>;
    fn decode(&self, r: &mut dyn Read) -> Result<T>;
}

/// Default codec: msgpack body behind a varint length header.
#[derive(Debug, Default, Clone, Copy)]
pub struct RmpValueCodec;

impl<T: Serialize + DeserializeOwned> ValueCodec<T> for RmpValueCodec {
    fn encode(&self, value: &T, w: &mut dyn Write) -> Result<()> {
        let bytes =
            rmp_serde::to_vec(value).map_err(|e| codec_failure(format!("encode failed: {e}")))?;
        write_bytes(w, &bytes)
    }

    fn decode(&self, r: &mut dyn Read) -> Result<T> {
        let bytes = read_bytes(r)?;
        rmp_serde::from_slice(&bytes).map_err(|e| codec_failure(format!("decode failed: {e}")))
    }
}

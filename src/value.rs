//! The closed value-tree type that flows through task arguments, return
//! values, and recorded dependency sets, plus its fingerprint function
//! (§3, §4.2).
//!
//! The source this engine is modeled on (`mem_/__init__.py::get_hash`)
//! dispatches dynamically on `isinstance`/`hasattr`. Rust has no equivalent
//! of open-ended duck typing here, and doesn't need one: a closed sum type
//! is both simpler and lets the compiler check that every shape in §3 is
//! handled (see §9 design notes).

use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::hash::Digest;
use crate::node::Node;

/// Sentinel bytes used by the sequence/mapping encodings (§4.2). Chosen to
/// match the spec exactly so the encoding is unambiguous without needing a
/// self-describing format.
const SEQ_MAP_START: u8 = 0x01;
const SEQ_MAP_END: u8 = 0x01;
const MAP_KV_SEP: u8 = 0x03;
const SEQ_ELEM_SEP: u8 = 0x00;

/// Recursion depth limit for [`Value::fingerprint`] (§9 "depth guard").
/// `Value` can't form a reference cycle, but a pathologically deep
/// `Seq`/`Map` nesting would otherwise recurse until the stack overflows;
/// this rejects such a tree outright instead.
const MAX_FINGERPRINT_DEPTH: usize = 512;

/// The value tree: everything that can appear as a task argument, a
/// return value, or a recorded dependency (§3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Str(String),
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    Seq(Vec<Value>),
    /// Represented as an insertion-ordered vec of pairs rather than a
    /// `HashMap` on purpose: the fingerprint must not depend on iteration
    /// order (§4.2), and round-tripping through `serde_json` would
    /// otherwise force `Value` to implement `Eq + Hash`, which `f64`-free
    /// but otherwise-open value trees don't need elsewhere.
    Map(Vec<(Value, Value)>),
    Node(Node),
    /// A reference to a loaded code module, fingerprinted as the hash of
    /// its defining source file (§4.2). Carries the path purely for
    /// diagnostics; the fingerprint only ever depends on file content.
    Module(ModuleRef),
}

/// A reference to the source file defining a task, used to make a task's
/// own code part of its dependency set (§4.3, §4.5).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModuleRef {
    pub path: std::path::PathBuf,
}

impl ModuleRef {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Node> for Value {
    fn from(n: Node) -> Self {
        Value::Node(n)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Seq(v.into_iter().map(Into::into).collect())
    }
}

impl Value {
    /// Compute this value's fingerprint (§4.2).
    ///
    /// Returns `None` only when the tree contains a [`Node`] whose content
    /// is currently unavailable (e.g. a [`crate::node::FileNode`] pointing
    /// at a missing file) — per §4.1, that propagates as a cache miss
    /// rather than a crash.
    pub fn fingerprint(&self) -> Option<Digest> {
        self.fingerprint_at_depth(0)
    }

    fn fingerprint_at_depth(&self, depth: usize) -> Option<Digest> {
        if depth > MAX_FINGERPRINT_DEPTH {
            panic!(
                "value tree nesting exceeds depth limit of {MAX_FINGERPRINT_DEPTH}; rejecting rather than recursing into a stack overflow"
            );
        }
        match self {
            Value::Int(i) => Some(Digest::from_buffer(i.to_le_bytes())),
            Value::Bool(b) => Some(Digest::from_buffer([*b as u8])),
            Value::Str(s) => Some(Digest::from_fields([s.as_bytes()])),
            Value::Bytes(b) => Some(Digest::from_fields([b.as_slice()])),
            Value::Module(m) => Digest::from_file(&m.path).ok(),
            Value::Node(n) => n.fingerprint(),
            Value::Seq(items) => fingerprint_seq(items, depth + 1),
            Value::Map(entries) => fingerprint_map(entries, depth + 1),
        }
    }
}

fn fingerprint_seq(items: &[Value], depth: usize) -> Option<Digest> {
    let mut fields: Vec<Vec<u8>> = vec![vec![SEQ_MAP_START]];
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            fields.push(vec![SEQ_ELEM_SEP]);
        }
        fields.push(item.fingerprint_at_depth(depth)?.as_str().as_bytes().to_vec());
    }
    fields.push(vec![SEQ_MAP_END]);
    Some(Digest::from_fields(fields))
}

fn fingerprint_map(entries: &[(Value, Value)], depth: usize) -> Option<Digest> {
    // Canonical order: sort by each key's own fingerprint (§4.2), never by
    // insertion order or by the runtime map's iteration order.
    let mut by_key_fp: Vec<(Digest, Digest)> = Vec::with_capacity(entries.len());
    for (k, v) in entries {
        let kfp = k.fingerprint_at_depth(depth)?;
        let vfp = v.fingerprint_at_depth(depth)?;
        by_key_fp.push((kfp, vfp));
    }
    by_key_fp.sort_by(|(a, _), (b, _)| a.as_str().cmp(b.as_str()));

    let mut fields: Vec<Vec<u8>> = vec![vec![SEQ_MAP_START]];
    for (i, (kfp, vfp)) in by_key_fp.iter().enumerate() {
        if i > 0 {
            fields.push(vec![SEQ_ELEM_SEP]);
        }
        fields.push(kfp.as_str().as_bytes().to_vec());
        fields.push(vec![MAP_KV_SEP]);
        fields.push(vfp.as_str().as_bytes().to_vec());
    }
    Some(Digest::from_fields(fields))
}

/// Serialize byte strings as base64 so a `Value` tree round-trips through
/// `serde_json` (§3 "Serialization format").
mod base64_bytes {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        BASE64.encode(bytes).serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        BASE64.decode(&s).map_err(serde::de::Error::custom)
    }
}

//! Key vectors, subgraphs, tags, and the other shared data model types.
//!
//! The three key-vector roles (GKV, CKV, TKV) all share the same underlying
//! representation and matching rule; they are kept as distinct newtypes so
//! the type system stops a caller from handing a calibration key vector to
//! an API that expects a graph key vector.

use std::collections::HashMap;
use std::fmt;

/// Wildcard value: a row whose value for some key is `0xFFFF_FFFF` matches
/// any value the query supplies for that key.
pub const WILDCARD_VALUE: u32 = 0xFFFF_FFFF;

/// A single key/value pair inside a key vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyValue {
    /// Key ID.
    pub key: u32,
    /// Value, or [`WILDCARD_VALUE`] to match any value for this key.
    pub value: u32,
}

impl KeyValue {
    pub const fn new(key: u32, value: u32) -> Self {
        Self { key, value }
    }
}

/// An ordered sequence of [`KeyValue`] pairs, with multiset equality: two key
/// vectors are equal iff they contain the same pairs irrespective of order
/// (duplicates counted).
#[derive(Debug, Clone, Default)]
pub struct KeyVector(pub Vec<KeyValue>);

impl KeyVector {
    pub fn new(pairs: impl Into<Vec<KeyValue>>) -> Self {
        Self(pairs.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyValue> {
        self.0.iter()
    }

    pub fn value_for(&self, key: u32) -> Option<u32> {
        self.0.iter().find(|kv| kv.key == key).map(|kv| kv.value)
    }

    /// Returns the set of keys present, for computing `key_id_subset` style
    /// filters (used by `get_supported_gkvs`).
    pub fn keys(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().map(|kv| kv.key)
    }

    /// Row-vs-query matching rule: every pair in `self` (the database row)
    /// must be satisfiable by `query` — present verbatim, or wildcarded.
    /// Keys in `query` that `self` does not mention are ignored.
    pub fn matches(&self, query: &KeyVector) -> bool {
        self.0.iter().all(|row_kv| {
            match query.value_for(row_kv.key) {
                Some(v) => v == row_kv.value || row_kv.value == WILDCARD_VALUE,
                None => false,
            }
        })
    }

    /// Specificity used to break ties between multiple matching rows: the
    /// most-specific (greatest key count) row wins. Equal specificity among
    /// two matching rows is a database-build error the caller must detect.
    pub fn specificity(&self) -> usize {
        self.0.len()
    }
}

impl PartialEq for KeyVector {
    fn eq(&self, other: &Self) -> bool {
        if self.0.len() != other.0.len() {
            return false;
        }
        let mut remaining: Vec<KeyValue> = other.0.clone();
        for kv in &self.0 {
            if let Some(pos) = remaining.iter().position(|o| o == kv) {
                remaining.swap_remove(pos);
            } else {
                return false;
            }
        }
        true
    }
}

impl Eq for KeyVector {}

impl FromIterator<KeyValue> for KeyVector {
    fn from_iter<T: IntoIterator<Item = KeyValue>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

macro_rules! kv_role {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct $name(pub KeyVector);

        impl $name {
            pub fn new(pairs: impl Into<Vec<KeyValue>>) -> Self {
                Self(KeyVector::new(pairs))
            }

            pub fn matches(&self, query: &$name) -> bool {
                self.0.matches(&query.0)
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}[", stringify!($name))?;
                for (i, kv) in self.0.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "({:#x},{:#x})", kv.key, kv.value)?;
                }
                write!(f, "]")
            }
        }
    };
}

kv_role!(GraphKeyVector, "Graph key vector (GKV): selects a topology.");
kv_role!(
    CalKeyVector,
    "Calibration key vector (CKV): selects calibration data for a topology."
);
kv_role!(
    TagKeyVector,
    "Tag key vector (TKV): selects parameters for a tagged module."
);

/// 32-bit subgraph identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubgraphId(pub u32);

impl fmt::Display for SubgraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sg:{:#x}", self.0)
    }
}

/// `(module_id, module_instance_id)` pair; instance IDs are globally unique
/// within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleInstance {
    /// Static module type ID.
    pub module_id: u32,
    /// Instance ID, unique within the owning graph.
    pub instance_id: u32,
}

/// 32-bit tag identifier denoting a role (e.g. "stream volume").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagId(pub u32);

/// 16-byte identifier on shared subgraphs, used to detect cross-database
/// mismatches when the same subgraph is registered from more than one
/// database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(pub [u8; 16]);

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// An ordered pair `(src_sg_id, dst_sg_id)` with opaque connection payload.
#[derive(Debug, Clone)]
pub struct SubgraphConnection {
    pub src_sg_id: SubgraphId,
    pub dst_sg_id: SubgraphId,
    pub payload: Vec<u8>,
}

/// The database-resident definition of a subgraph: everything the resolver
/// (C2) can read out of the ACDB for a given `sg_id`. Distinct from the
/// runtime pool entry in `acdb-graph`, which tracks the refcount and
/// wire-open state — this type is immutable, sourced straight from disk.
#[derive(Debug, Clone, Default)]
pub struct SubgraphDef {
    pub sg_id: SubgraphId,
    pub children: Vec<SubgraphId>,
    /// Per-processor-domain persistent-cal blob, keyed by [`ProcDomain`].
    pub persistent_cal: HashMap<ProcDomain, Vec<u8>>,
    /// `Some` only for subgraphs imported/exported as shared across
    /// databases.
    pub guid: Option<Guid>,
}

/// A 32-bit calibration-blob record as returned by `get_nonpersist_cal`:
/// `{iid, pid, size, errcode, payload[size]}`.
#[derive(Debug, Clone)]
pub struct CalBlobRecord {
    /// Module instance ID.
    pub iid: u32,
    /// Parameter ID.
    pub pid: u32,
    /// Per-parameter error code, independent of the overall query result.
    pub errcode: i32,
    /// Raw parameter bytes.
    pub payload: Vec<u8>,
}

/// Processor domain identifier — a master or a satellite. Mirrors the
/// domain IDs used by the wire transport and the service registry, both
/// of which live outside this workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcDomain(pub u8);

/// The low 12 bits of a wire packet token carry a data-path buffer index;
/// the high 20 bits carry a monotonic debug counter advanced by the
/// dispatcher. Kept as a dedicated type (Design Notes) so the two halves
/// cannot be confused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub buffer_index: u16,
    pub debug: u32,
}

const BUFFER_INDEX_BITS: u32 = 12;
const BUFFER_INDEX_MASK: u32 = (1 << BUFFER_INDEX_BITS) - 1;

impl Token {
    /// Builds a token from its halves. `buffer_index` is truncated to 12
    /// bits and `debug` to 20 bits.
    pub fn new(buffer_index: u16, debug: u32) -> Self {
        Self {
            buffer_index: buffer_index & (BUFFER_INDEX_MASK as u16),
            debug: debug & (u32::MAX >> BUFFER_INDEX_BITS),
        }
    }

    pub fn encode(self) -> u32 {
        ((self.debug & (u32::MAX >> BUFFER_INDEX_BITS)) << BUFFER_INDEX_BITS)
            | (self.buffer_index as u32 & BUFFER_INDEX_MASK)
    }

    pub fn decode(raw: u32) -> Self {
        Self {
            buffer_index: (raw & BUFFER_INDEX_MASK) as u16,
            debug: raw >> BUFFER_INDEX_BITS,
        }
    }
}

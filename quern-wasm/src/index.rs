//! Ordered index handles addressable from host callbacks.
//!
//! An index maps keys to tuple ids and supports `lower_bound`/`upper_bound`
//! (returning the distance from `begin()` to the matched iterator) plus
//! random access by iterator offset. Two implementations exist per key type:
//!
//! - [`ArrayIndex`]: sorted `(key, tuple-id)` pairs, plain binary search.
//! - [`RmiIndex`]: a two-layer recursive model. A learned root model picks
//!   a leaf segment, the match is located inside it. Model quality only
//!   affects speed; the search window expands leafwise until it provably
//!   brackets the boundary, so results equal the array index's.
//!
//! Floats order by their total order so NaN keys cannot wedge a lookup;
//! string keys compare bytewise.

use std::cmp::Ordering;

use crate::abi::KeyType;
use crate::context::WasmContext;
use crate::error::{BackendError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexKind {
    Array,
    RecursiveModel,
}

impl IndexKind {
    pub fn suffix(self) -> &'static str {
        match self {
            IndexKind::Array => "array",
            IndexKind::RecursiveModel => "rmi",
        }
    }
}

/// Key behavior shared by every index key type.
pub trait IndexKey: Clone + Send + Sync + 'static {
    fn key_cmp(&self, other: &Self) -> Ordering;
    /// Projection into model space for the recursive model index.
    fn model_key(&self) -> f64;
}

macro_rules! integral_index_key {
    ($($ty:ty),*) => {$(
        impl IndexKey for $ty {
            fn key_cmp(&self, other: &Self) -> Ordering {
                self.cmp(other)
            }
            fn model_key(&self) -> f64 {
                *self as i64 as f64
            }
        }
    )*};
}

integral_index_key!(i8, i16, i32, i64);

impl IndexKey for bool {
    fn key_cmp(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
    fn model_key(&self) -> f64 {
        *self as u8 as f64
    }
}

impl IndexKey for f32 {
    fn key_cmp(&self, other: &Self) -> Ordering {
        self.total_cmp(other)
    }
    fn model_key(&self) -> f64 {
        *self as f64
    }
}

impl IndexKey for f64 {
    fn key_cmp(&self, other: &Self) -> Ordering {
        self.total_cmp(other)
    }
    fn model_key(&self) -> f64 {
        *self
    }
}

impl IndexKey for Vec<u8> {
    fn key_cmp(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
    /// First eight bytes, big endian, zero padded. Monotonic with the
    /// bytewise order; longer shared prefixes collapse, which only widens
    /// the search window.
    fn model_key(&self) -> f64 {
        let mut word = [0u8; 8];
        let take = self.len().min(8);
        word[..take].copy_from_slice(&self[..take]);
        u64::from_be_bytes(word) as f64
    }
}

/// Ordered lookup over `(key, tuple-id)` entries.
pub trait OrderedIndex<K: IndexKey>: Send + Sync {
    fn len(&self) -> u32;
    /// Offset of the first entry not less than `key`.
    fn lower_bound(&self, key: &K) -> u32;
    /// Offset of the first entry greater than `key`.
    fn upper_bound(&self, key: &K) -> u32;
    /// `begin() + offset` access.
    fn entry(&self, offset: u32) -> Option<(&K, u32)>;
}

pub struct ArrayIndex<K> {
    entries: Vec<(K, u32)>,
}

impl<K: IndexKey> ArrayIndex<K> {
    pub fn from_entries(mut entries: Vec<(K, u32)>) -> Self {
        entries.sort_by(|a, b| a.0.key_cmp(&b.0));
        Self { entries }
    }
}

impl<K: IndexKey> OrderedIndex<K> for ArrayIndex<K> {
    fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    fn lower_bound(&self, key: &K) -> u32 {
        self.entries
            .partition_point(|(k, _)| k.key_cmp(key) == Ordering::Less) as u32
    }

    fn upper_bound(&self, key: &K) -> u32 {
        self.entries
            .partition_point(|(k, _)| k.key_cmp(key) != Ordering::Greater) as u32
    }

    fn entry(&self, offset: u32) -> Option<(&K, u32)> {
        self.entries.get(offset as usize).map(|(k, t)| (k, *t))
    }
}

#[derive(Clone, Copy, Debug)]
struct LinearModel {
    slope: f64,
    intercept: f64,
}

impl LinearModel {
    /// Least-squares fit; degenerates to a constant when the inputs carry
    /// no spread or produce non-finite moments.
    fn fit(points: &[(f64, f64)]) -> Self {
        let n = points.len() as f64;
        if points.is_empty() {
            return Self {
                slope: 0.0,
                intercept: 0.0,
            };
        }
        let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
        let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
        let var: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
        let cov: f64 = points
            .iter()
            .map(|p| (p.0 - mean_x) * (p.1 - mean_y))
            .sum();
        let slope = if var > 0.0 { cov / var } else { 0.0 };
        let intercept = mean_y - slope * mean_x;
        if slope.is_finite() && intercept.is_finite() {
            Self { slope, intercept }
        } else {
            Self {
                slope: 0.0,
                intercept: 0.0,
            }
        }
    }

    fn predict(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Entries per RMI leaf segment.
const RMI_LEAF_SIZE: usize = 64;

pub struct RmiIndex<K> {
    entries: Vec<(K, u32)>,
    /// Leaf start offsets; `bounds.len() == leaves + 1`, `bounds[0] == 0`.
    bounds: Vec<usize>,
    root: LinearModel,
}

impl<K: IndexKey> RmiIndex<K> {
    pub fn from_entries(mut entries: Vec<(K, u32)>) -> Self {
        entries.sort_by(|a, b| a.0.key_cmp(&b.0));
        let n = entries.len();
        let leaves = n.div_ceil(RMI_LEAF_SIZE).max(1);
        let bounds: Vec<usize> = (0..=leaves).map(|j| j * n / leaves).collect();
        let points: Vec<(f64, f64)> = entries
            .iter()
            .enumerate()
            .map(|(i, (k, _))| (k.model_key(), (i * leaves / n.max(1)) as f64))
            .collect();
        let root = LinearModel::fit(&points);
        Self {
            entries,
            bounds,
            root,
        }
    }

    fn leaves(&self) -> usize {
        self.bounds.len() - 1
    }

    /// Bounded search: the root model proposes a leaf, then the window
    /// expands leafwise until it provably brackets the partition point of
    /// `before` (true for entries left of the boundary).
    fn search(&self, key: &K, before: impl Fn(&K) -> bool) -> u32 {
        let n = self.entries.len();
        if n == 0 {
            return 0;
        }
        let pred = self.root.predict(key.model_key());
        let mut leaf = if pred.is_finite() {
            (pred.max(0.0) as usize).min(self.leaves() - 1)
        } else {
            0
        };
        let mut start = self.bounds[leaf];
        let mut end = self.bounds[leaf + 1];
        while start > 0 && !before(&self.entries[start - 1].0) {
            leaf -= 1;
            start = self.bounds[leaf];
        }
        let mut right = leaf;
        while end < n && before(&self.entries[end].0) {
            right += 1;
            end = self.bounds[right + 1];
        }
        let within = self.entries[start..end].partition_point(|(k, _)| before(k));
        (start + within) as u32
    }
}

impl<K: IndexKey> OrderedIndex<K> for RmiIndex<K> {
    fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    fn lower_bound(&self, key: &K) -> u32 {
        self.search(key, |k| k.key_cmp(key) == Ordering::Less)
    }

    fn upper_bound(&self, key: &K) -> u32 {
        self.search(key, |k| k.key_cmp(key) != Ordering::Greater)
    }

    fn entry(&self, offset: u32) -> Option<(&K, u32)> {
        self.entries.get(offset as usize).map(|(k, t)| (k, *t))
    }
}

/// Key argument of a bound lookup, as decoded from the guest's call.
#[derive(Clone, Debug)]
pub enum HostKey {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(Vec<u8>),
}

impl HostKey {
    pub fn tag(&self) -> KeyType {
        match self {
            HostKey::Bool(_) => KeyType::B,
            HostKey::I8(_) => KeyType::I1,
            HostKey::I16(_) => KeyType::I2,
            HostKey::I32(_) => KeyType::I4,
            HostKey::I64(_) => KeyType::I8,
            HostKey::F32(_) => KeyType::F,
            HostKey::F64(_) => KeyType::D,
            HostKey::Str(_) => KeyType::P,
        }
    }
}

/// Type-erased index storage; the variant fixes the key type.
pub enum KeyedIndex {
    Bool(Box<dyn OrderedIndex<bool>>),
    I8(Box<dyn OrderedIndex<i8>>),
    I16(Box<dyn OrderedIndex<i16>>),
    I32(Box<dyn OrderedIndex<i32>>),
    I64(Box<dyn OrderedIndex<i64>>),
    F32(Box<dyn OrderedIndex<f32>>),
    F64(Box<dyn OrderedIndex<f64>>),
    Str(Box<dyn OrderedIndex<Vec<u8>>>),
}

impl KeyedIndex {
    pub fn tag(&self) -> KeyType {
        match self {
            KeyedIndex::Bool(_) => KeyType::B,
            KeyedIndex::I8(_) => KeyType::I1,
            KeyedIndex::I16(_) => KeyType::I2,
            KeyedIndex::I32(_) => KeyType::I4,
            KeyedIndex::I64(_) => KeyType::I8,
            KeyedIndex::F32(_) => KeyType::F,
            KeyedIndex::F64(_) => KeyType::D,
            KeyedIndex::Str(_) => KeyType::P,
        }
    }

    fn tuple_id_at(&self, offset: u32) -> Option<u32> {
        match self {
            KeyedIndex::Bool(ix) => ix.entry(offset).map(|(_, t)| t),
            KeyedIndex::I8(ix) => ix.entry(offset).map(|(_, t)| t),
            KeyedIndex::I16(ix) => ix.entry(offset).map(|(_, t)| t),
            KeyedIndex::I32(ix) => ix.entry(offset).map(|(_, t)| t),
            KeyedIndex::I64(ix) => ix.entry(offset).map(|(_, t)| t),
            KeyedIndex::F32(ix) => ix.entry(offset).map(|(_, t)| t),
            KeyedIndex::F64(ix) => ix.entry(offset).map(|(_, t)| t),
            KeyedIndex::Str(ix) => ix.entry(offset).map(|(_, t)| t),
        }
    }
}

/// One registered index: (kind, key type) plus its backing structure.
pub struct IndexHandle {
    kind: IndexKind,
    keyed: KeyedIndex,
}

impl IndexHandle {
    pub fn new(kind: IndexKind, keyed: KeyedIndex) -> Self {
        Self { kind, keyed }
    }

    /// Convenience constructor for the common `i32` case.
    pub fn over_i32(kind: IndexKind, entries: Vec<(i32, u32)>) -> Self {
        let keyed = match kind {
            IndexKind::Array => KeyedIndex::I32(Box::new(ArrayIndex::from_entries(entries))),
            IndexKind::RecursiveModel => {
                KeyedIndex::I32(Box::new(RmiIndex::from_entries(entries)))
            }
        };
        Self::new(kind, keyed)
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    pub fn key_type(&self) -> KeyType {
        self.keyed.tag()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundOp {
    Lower,
    Upper,
}

/// Host side of `idx_lower_bound_*` / `idx_upper_bound_*`.
pub fn bound_lookup(
    ctx: &WasmContext,
    kind: IndexKind,
    idx: u64,
    key: HostKey,
    op: BoundOp,
) -> Result<u32> {
    let handle = ctx.index(idx)?;
    check_handle(handle, kind, key.tag(), idx)?;
    macro_rules! dispatch {
        ($ix:expr, $k:expr) => {
            match op {
                BoundOp::Lower => $ix.lower_bound($k),
                BoundOp::Upper => $ix.upper_bound($k),
            }
        };
    }
    Ok(match (&handle.keyed, &key) {
        (KeyedIndex::Bool(ix), HostKey::Bool(k)) => dispatch!(ix, k),
        (KeyedIndex::I8(ix), HostKey::I8(k)) => dispatch!(ix, k),
        (KeyedIndex::I16(ix), HostKey::I16(k)) => dispatch!(ix, k),
        (KeyedIndex::I32(ix), HostKey::I32(k)) => dispatch!(ix, k),
        (KeyedIndex::I64(ix), HostKey::I64(k)) => dispatch!(ix, k),
        (KeyedIndex::F32(ix), HostKey::F32(k)) => dispatch!(ix, k),
        (KeyedIndex::F64(ix), HostKey::F64(k)) => dispatch!(ix, k),
        (KeyedIndex::Str(ix), HostKey::Str(k)) => dispatch!(ix, k),
        // check_handle already compared the tags.
        _ => unreachable!("index key tag mismatch slipped past the check"),
    })
}

/// Host side of `idx_scan_*`: writes `batch` consecutive tuple ids starting
/// at iterator offset `entry` into guest memory at `out`.
pub fn scan_into(
    ctx: &WasmContext,
    kind: IndexKind,
    key_type: KeyType,
    idx: u64,
    entry: u32,
    out: u32,
    batch: u32,
) -> Result<()> {
    let handle = ctx.index(idx)?;
    check_handle(handle, kind, key_type, idx)?;
    for i in 0..batch {
        let tuple_id = handle.keyed.tuple_id_at(entry + i).ok_or_else(|| {
            BackendError::Invariant(format!(
                "index {idx} scan past the end (offset {})",
                entry + i
            ))
        })?;
        ctx.arena().write_bytes(out + 4 * i, &tuple_id.to_le_bytes())?;
    }
    Ok(())
}

fn check_handle(handle: &IndexHandle, kind: IndexKind, key: KeyType, idx: u64) -> Result<()> {
    if handle.kind() != kind || handle.key_type() != key {
        return Err(BackendError::Invariant(format!(
            "index {idx} is ({:?}, {:?}) but the callback expected ({kind:?}, {key:?})",
            handle.kind(),
            handle.key_type(),
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_bounds_match_the_spec_example() {
        // Keys {1, 3, 3, 5}: lower_bound(3) = 1, upper_bound(3) = 3.
        let ix = ArrayIndex::from_entries(vec![(1, 10), (3, 11), (3, 12), (5, 13)]);
        assert_eq!(ix.lower_bound(&3), 1);
        assert_eq!(ix.upper_bound(&3), 3);
        assert_eq!(ix.lower_bound(&0), 0);
        assert_eq!(ix.upper_bound(&9), 4);
        assert_eq!(ix.entry(1), Some((&3, 11)));
        assert_eq!(ix.entry(4), None);
    }

    #[test]
    fn rmi_agrees_with_the_array_index() {
        let entries: Vec<(i64, u32)> = (0..500)
            .map(|i| ((i * 7 % 101) as i64, i as u32))
            .collect();
        let array = ArrayIndex::from_entries(entries.clone());
        let rmi = RmiIndex::from_entries(entries);
        for key in -3i64..105 {
            assert_eq!(rmi.lower_bound(&key), array.lower_bound(&key), "lb {key}");
            assert_eq!(rmi.upper_bound(&key), array.upper_bound(&key), "ub {key}");
        }
    }

    #[test]
    fn rmi_handles_string_keys() {
        let words = ["ash", "basalt", "flint", "gneiss", "quartz", "shale"];
        let entries: Vec<(Vec<u8>, u32)> = words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.as_bytes().to_vec(), i as u32))
            .collect();
        let rmi = RmiIndex::from_entries(entries);
        assert_eq!(rmi.lower_bound(&b"flint".to_vec()), 2);
        assert_eq!(rmi.upper_bound(&b"flint".to_vec()), 3);
        assert_eq!(rmi.lower_bound(&b"granite".to_vec()), 3);
    }

    #[test]
    fn rmi_tolerates_nan_float_keys() {
        let entries = vec![(1.0f64, 0), (2.0, 1), (f64::NAN, 2)];
        let rmi = RmiIndex::from_entries(entries);
        // NaN sorts last under the total order; lookups stay consistent.
        assert_eq!(rmi.lower_bound(&2.0), 1);
        assert_eq!(rmi.upper_bound(&2.0), 2);
    }

    #[test]
    fn empty_indexes_return_zero_bounds() {
        let rmi = RmiIndex::<i32>::from_entries(Vec::new());
        assert_eq!(rmi.lower_bound(&7), 0);
        assert_eq!(rmi.upper_bound(&7), 0);
        assert_eq!(rmi.len(), 0);
    }
}

//! Functional-redundancy discovery between key substreams.
//!
//! Real-world variant files carry many INFO/FORMAT keys whose streams are
//! copies or simple functions of each other (a caller emitting the same
//! depth under two names, a count key mirroring another plus a constant).
//! Discovery runs pairwise over the sampled streams and emits two spanning
//! forests: the size graph records "B's per-variant counts equal A's", the
//! data graph records "B's payload is a small function of A's". Only roots
//! are materialized in the archive; every non-root stores a recipe instead.
//!
//! Edges always point from a lower key id to a higher one and no node has
//! more than one incoming edge, so both graphs are cycle-free forests by
//! construction.

use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHasher};
use std::hash::{Hash, Hasher};

use super::{read_varint, write_varint, zigzag, unzigzag, FIELD_PRESENT_FLAG};
use crate::error::{Error, Result};
use crate::record::ValueType;

/// Upper bound on lookup-table recipes; bigger tables stop paying for
/// themselves against simply storing the stream.
const MAX_LOOKUP_ENTRIES: usize = 4096;

/// Sampled view of one key's substreams, as retained by the orchestrator at
/// close time. `eligible` is false once any part of the stream has already
/// been flushed to disk; such streams can only act as forced roots.
pub struct StreamSample<'a> {
    pub key_id: u32,
    pub eligible: bool,
    pub value_type: ValueType,
    pub sizes: &'a [u32],
    pub data: &'a [u8],
}

/// Equality forest over size streams: `(key_id, is_root)` nodes and
/// `(src, dst)` edges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SizeGraph {
    pub nodes: Vec<(u32, bool)>,
    pub edges: Vec<(u32, u32)>,
}

impl SizeGraph {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

/// Reconstruction recipe carried by a data-graph edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataFunction {
    /// Byte-identical payloads.
    Identity,
    /// `b = mul * a + add` over little-endian i32 values; `mul = 1` is the
    /// constant-offset case.
    Linear { mul: i64, add: i64 },
    /// Per-variant value mapping, sorted by key for deterministic storage.
    Lookup(Vec<(Vec<u8>, Vec<u8>)>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEdge {
    pub src: u32,
    pub dst: u32,
    pub func: DataFunction,
}

/// Functional forest over data streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataGraph {
    pub nodes: Vec<(u32, bool)>,
    pub edges: Vec<DataEdge>,
}

impl DataGraph {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

// ============================================================================
// Discovery
// ============================================================================

fn fingerprint(sizes: &[u32]) -> u64 {
    let mut h = FxHasher::default();
    sizes.hash(&mut h);
    h.finish()
}

/// Group size streams into strict-equality components; the lowest key id of
/// each component becomes its root. Streams are bucketed by fingerprint
/// first so only candidates with matching hashes are compared byte-wise.
pub fn discover_size_graph(samples: &[StreamSample]) -> SizeGraph {
    let mut buckets: FxHashMap<u64, Vec<usize>> = FxHashMap::default();
    for (i, s) in samples.iter().enumerate() {
        if s.eligible {
            buckets.entry(fingerprint(s.sizes)).or_default().push(i);
        }
    }

    let mut edges: Vec<(u32, u32)> = Vec::new();
    let mut is_target = vec![false; samples.len()];

    for members in buckets.values() {
        // Bucket members arrive in ascending key order; the first member of
        // each verified-equal group is the canonical root.
        let mut roots: Vec<usize> = Vec::new();
        for &i in members {
            let mut matched = false;
            for &r in &roots {
                if samples[r].sizes == samples[i].sizes {
                    edges.push((samples[r].key_id, samples[i].key_id));
                    is_target[i] = true;
                    matched = true;
                    break;
                }
            }
            if !matched {
                roots.push(i);
            }
        }
    }

    edges.sort_unstable();
    let nodes = samples
        .iter()
        .enumerate()
        .map(|(i, s)| (s.key_id, !is_target[i]))
        .collect();
    SizeGraph { nodes, edges }
}

/// Probe the ordered relation menu for one `(src, dst)` pair.
fn probe_pair(src: &StreamSample, dst: &StreamSample) -> Option<DataFunction> {
    if src.sizes.len() != dst.sizes.len() {
        return None;
    }

    // Identity: equal counts and equal bytes.
    if src.sizes == dst.sizes && src.data == dst.data {
        return Some(DataFunction::Identity);
    }

    // Offset, then general affine, for integer-typed pairs with aligned
    // element counts.
    if src.value_type == ValueType::Int
        && dst.value_type == ValueType::Int
        && src.sizes == dst.sizes
        && src.data.len() == dst.data.len()
        && src.data.len() % 4 == 0
    {
        if let Some(f) = probe_linear(src.data, dst.data) {
            return Some(f);
        }
    }

    probe_lookup(src, dst)
}

fn i32_at(data: &[u8], i: usize) -> i64 {
    i32::from_le_bytes([data[4 * i], data[4 * i + 1], data[4 * i + 2], data[4 * i + 3]]) as i64
}

fn probe_linear(a: &[u8], b: &[u8]) -> Option<DataFunction> {
    let n = a.len() / 4;
    if n == 0 {
        return None;
    }

    // Constant offset first: it wins menu order over a general affine fit.
    let d = i32_at(b, 0) - i32_at(a, 0);
    if (0..n).all(|i| i32_at(b, i) - i32_at(a, i) == d) {
        return Some(DataFunction::Linear { mul: 1, add: d });
    }

    // General affine: solve from the first two distinct source values.
    let a0 = i32_at(a, 0);
    let b0 = i32_at(b, 0);
    let (a1, b1) = (1..n)
        .map(|i| (i32_at(a, i), i32_at(b, i)))
        .find(|&(ai, _)| ai != a0)?;

    let num = b1 - b0;
    let den = a1 - a0;
    if num % den != 0 {
        return None;
    }
    let mul = num / den;
    let add = b0 - mul * a0;
    if (0..n).all(|i| mul * i32_at(a, i) + add == i32_at(b, i)) {
        Some(DataFunction::Linear { mul, add })
    } else {
        None
    }
}

fn probe_lookup(src: &StreamSample, dst: &StreamSample) -> Option<DataFunction> {
    let mut table: FxHashMap<&[u8], &[u8]> = FxHashMap::default();
    let mut off_a = 0usize;
    let mut off_b = 0usize;

    for (&sa, &sb) in src.sizes.iter().zip(dst.sizes.iter()) {
        // Size words carry the presence flag; only the low bits are lengths.
        let la = (sa & !FIELD_PRESENT_FLAG) as usize;
        let lb = (sb & !FIELD_PRESENT_FLAG) as usize;
        let ka = &src.data[off_a..off_a + la];
        let vb = &dst.data[off_b..off_b + lb];
        off_a += la;
        off_b += lb;

        match table.get(ka) {
            Some(&existing) if existing != vb => return None,
            Some(_) => {}
            None => {
                if table.len() >= MAX_LOOKUP_ENTRIES {
                    return None;
                }
                table.insert(ka, vb);
            }
        }
    }

    let mut entries: Vec<(Vec<u8>, Vec<u8>)> = table
        .into_iter()
        .map(|(k, v)| (k.to_vec(), v.to_vec()))
        .collect();
    entries.sort();
    Some(DataFunction::Lookup(entries))
}

/// Discover the data-function forest. For every eligible target, sources
/// are scanned in ascending key id and the first relation in the fixed menu
/// (identity, offset, affine, lookup) wins; targets scan in parallel, which
/// cannot change the outcome because each target's scan is independent.
pub fn discover_data_graph(samples: &[StreamSample]) -> DataGraph {
    let edges: Vec<DataEdge> = samples
        .par_iter()
        .enumerate()
        .filter(|(_, dst)| dst.eligible)
        .filter_map(|(di, dst)| {
            samples[..di]
                .iter()
                .filter(|src| src.eligible && src.key_id < dst.key_id)
                .find_map(|src| {
                    probe_pair(src, dst).map(|func| DataEdge {
                        src: src.key_id,
                        dst: dst.key_id,
                        func,
                    })
                })
        })
        .collect();

    let mut is_target: FxHashMap<u32, bool> = FxHashMap::default();
    for e in &edges {
        is_target.insert(e.dst, true);
    }
    let nodes = samples
        .iter()
        .map(|s| (s.key_id, !is_target.contains_key(&s.key_id)))
        .collect();
    DataGraph { nodes, edges }
}

// ============================================================================
// Serialization
// ============================================================================

pub fn store_nodes(nodes: &[(u32, bool)]) -> Vec<u8> {
    let mut buf = Vec::new();
    write_varint(&mut buf, nodes.len() as u64);
    for &(key, is_root) in nodes {
        write_varint(&mut buf, key as u64);
        buf.push(is_root as u8);
    }
    buf
}

pub fn load_nodes(data: &[u8]) -> Result<Vec<(u32, bool)>> {
    let mut pos = 0usize;
    let n = read_varint(data, &mut pos)
        .ok_or_else(|| Error::format("truncated graph node stream"))? as usize;
    let mut nodes = Vec::with_capacity(n);
    for _ in 0..n {
        let key = read_varint(data, &mut pos)
            .ok_or_else(|| Error::format("truncated graph node entry"))? as u32;
        let is_root = *data
            .get(pos)
            .ok_or_else(|| Error::format("truncated graph node entry"))?;
        pos += 1;
        nodes.push((key, is_root != 0));
    }
    Ok(nodes)
}

pub fn store_edges(edges: &[(u32, u32)]) -> Vec<u8> {
    let mut buf = Vec::new();
    write_varint(&mut buf, edges.len() as u64);
    for &(src, dst) in edges {
        write_varint(&mut buf, src as u64);
        write_varint(&mut buf, dst as u64);
    }
    buf
}

pub fn load_edges(data: &[u8]) -> Result<Vec<(u32, u32)>> {
    let mut pos = 0usize;
    let n = read_varint(data, &mut pos)
        .ok_or_else(|| Error::format("truncated graph edge stream"))? as usize;
    let mut edges = Vec::with_capacity(n);
    for _ in 0..n {
        let src = read_varint(data, &mut pos)
            .ok_or_else(|| Error::format("truncated graph edge entry"))? as u32;
        let dst = read_varint(data, &mut pos)
            .ok_or_else(|| Error::format("truncated graph edge entry"))? as u32;
        edges.push((src, dst));
    }
    Ok(edges)
}

impl DataFunction {
    pub fn store(&self, buf: &mut Vec<u8>) {
        match self {
            DataFunction::Identity => buf.push(0),
            DataFunction::Linear { mul, add } => {
                buf.push(1);
                write_varint(buf, zigzag(*mul));
                write_varint(buf, zigzag(*add));
            }
            DataFunction::Lookup(entries) => {
                buf.push(2);
                write_varint(buf, entries.len() as u64);
                for (k, v) in entries {
                    write_varint(buf, k.len() as u64);
                    buf.extend_from_slice(k);
                    write_varint(buf, v.len() as u64);
                    buf.extend_from_slice(v);
                }
            }
        }
    }

    pub fn load(data: &[u8]) -> Result<Self> {
        let mut pos = 0usize;
        let tag = *data
            .get(pos)
            .ok_or_else(|| Error::format("empty function descriptor"))?;
        pos += 1;
        match tag {
            0 => Ok(DataFunction::Identity),
            1 => {
                let mul = read_varint(data, &mut pos)
                    .ok_or_else(|| Error::format("truncated linear descriptor"))?;
                let add = read_varint(data, &mut pos)
                    .ok_or_else(|| Error::format("truncated linear descriptor"))?;
                Ok(DataFunction::Linear {
                    mul: unzigzag(mul),
                    add: unzigzag(add),
                })
            }
            2 => {
                let n = read_varint(data, &mut pos)
                    .ok_or_else(|| Error::format("truncated lookup descriptor"))?
                    as usize;
                let mut entries = Vec::with_capacity(n);
                for _ in 0..n {
                    let klen = read_varint(data, &mut pos)
                        .ok_or_else(|| Error::format("truncated lookup key"))?
                        as usize;
                    let k = data
                        .get(pos..pos + klen)
                        .ok_or_else(|| Error::format("truncated lookup key"))?
                        .to_vec();
                    pos += klen;
                    let vlen = read_varint(data, &mut pos)
                        .ok_or_else(|| Error::format("truncated lookup value"))?
                        as usize;
                    let v = data
                        .get(pos..pos + vlen)
                        .ok_or_else(|| Error::format("truncated lookup value"))?
                        .to_vec();
                    pos += vlen;
                    entries.push((k, v));
                }
                Ok(DataFunction::Lookup(entries))
            }
            t => Err(Error::format(format!("unknown function descriptor tag {t}"))),
        }
    }

    /// Apply the recipe to one variant's source value.
    pub fn apply(&self, src: &[u8]) -> Result<Vec<u8>> {
        match self {
            DataFunction::Identity => Ok(src.to_vec()),
            DataFunction::Linear { mul, add } => {
                if src.len() % 4 != 0 {
                    return Err(Error::codec(
                        "linear function applied to non-integer payload",
                    ));
                }
                let mut out = Vec::with_capacity(src.len());
                for c in src.chunks_exact(4) {
                    let a = i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64;
                    out.extend_from_slice(&((mul * a + add) as i32).to_le_bytes());
                }
                Ok(out)
            }
            DataFunction::Lookup(entries) => entries
                .binary_search_by(|(k, _)| k.as_slice().cmp(src))
                .map(|i| entries[i].1.clone())
                .map_err(|_| Error::codec("lookup function missing source value")),
        }
    }
}

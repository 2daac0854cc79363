//! The CompressedFile orchestrator.
//!
//! Public entry point of the engine: owns the archive handle, the schema,
//! the worker pool and the lifecycle state machine
//! (`none → writing → closed` or `none → reading → closed`). Compression
//! and decompression sessions live in [`write`] and [`read`].

mod read;
mod write;

use std::path::Path;
use std::sync::{Condvar, Mutex};
use tracing::info;

use crate::compression::graph::{DataGraph, SizeGraph};
use crate::compression::{read_varint, write_varint};
use crate::error::{Error, Result};
use crate::params::Params;
use crate::record::{FieldValue, KeyDesc, KeyKind, ValueType, VariantDesc};

pub(crate) const NO_DB_FIELDS: usize = 6;
pub(crate) const DB_CHROM: usize = 0;
pub(crate) const DB_POS: usize = 1;
pub(crate) const DB_ID: usize = 2;
pub(crate) const DB_REF: usize = 3;
pub(crate) const DB_ALT: usize = 4;
pub(crate) const DB_QUAL: usize = 5;

pub(crate) const DB_FIELD_NAMES: [&str; NO_DB_FIELDS] =
    ["chrom", "pos", "id", "ref", "alt", "qual"];

pub(crate) const STREAM_PARAMS: &str = "params";
pub(crate) const STREAM_DESCRIPTIONS: &str = "descriptions";
pub(crate) const STREAM_SIZE_NODES: &str = "gopt_size_nodes";
pub(crate) const STREAM_SIZE_EDGES: &str = "gopt_size_edges";
pub(crate) const STREAM_DATA_NODES: &str = "gopt_data_nodes";
pub(crate) const STREAM_DATA_EDGES: &str = "gopt_data_edges";

/// Number of parts kept in flight ahead of the read cursors.
pub(crate) const PREFETCH_PARTS: u32 = 3;

pub(crate) fn db_size_name(db_id: usize) -> String {
    format!("db_{}_size", DB_FIELD_NAMES[db_id])
}

pub(crate) fn db_data_name(db_id: usize) -> String {
    format!("db_{}_data", DB_FIELD_NAMES[db_id])
}

pub(crate) fn key_size_name(key_id: u32) -> String {
    format!("key_{key_id}_size")
}

pub(crate) fn key_data_name(key_id: u32) -> String {
    format!("key_{key_id}_data")
}

pub(crate) fn key_func_name(key_id: u32) -> String {
    format!("key_{key_id}_func")
}

// ============================================================================
// Shared synchronisation primitives
// ============================================================================

/// First-error slot shared between the orchestrator and its workers. The
/// first recorded error wins; later ones are dropped.
#[derive(Default)]
pub(crate) struct ErrorSlot {
    slot: Mutex<Option<Error>>,
}

impl ErrorSlot {
    pub fn set(&self, e: Error) {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_none() {
            *slot = Some(e);
        }
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    pub fn take(&self) -> Option<Error> {
        self.slot.lock().unwrap().take()
    }
}

/// Per-stream turn gate: a worker may pass slot `i` only when its part index
/// equals the slot's next-expected index. Waiters re-check the error slot so
/// a failing pool cannot strand them.
pub(crate) struct OrderGate {
    expected: Mutex<Vec<u32>>,
    cv: Condvar,
}

impl OrderGate {
    pub fn new(n_slots: usize) -> Self {
        Self {
            expected: Mutex::new(vec![0; n_slots]),
            cv: Condvar::new(),
        }
    }

    pub fn wait_turn(&self, slot: usize, part: u32, err: &ErrorSlot) -> Result<()> {
        let mut expected = self.expected.lock().unwrap();
        while expected[slot] != part {
            if err.is_set() {
                return Err(Error::state("worker pool terminated by earlier failure"));
            }
            expected = self.cv.wait(expected).unwrap();
        }
        Ok(())
    }

    pub fn advance(&self, slot: usize) {
        let mut expected = self.expected.lock().unwrap();
        expected[slot] += 1;
        self.cv.notify_all();
    }

    pub fn notify_all(&self) {
        let _guard = self.expected.lock().unwrap();
        self.cv.notify_all();
    }
}

// ============================================================================
// Descriptions blob
// ============================================================================

pub(crate) fn append_string(buf: &mut Vec<u8>, s: &str) {
    write_varint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

pub(crate) fn read_string(data: &[u8], pos: &mut usize) -> Result<String> {
    let len = read_varint(data, pos)
        .ok_or_else(|| Error::format("truncated string length in descriptions"))?
        as usize;
    let bytes = data
        .get(*pos..*pos + len)
        .ok_or_else(|| Error::format("truncated string in descriptions"))?;
    *pos += len;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::format("descriptions string is not valid UTF-8"))
}

/// Everything the decoder needs besides the parts themselves.
pub(crate) struct Descriptions {
    pub no_variants: u32,
    pub no_samples: u32,
    pub ploidy: u8,
    pub gt_key_id: Option<u32>,
    pub keys: Vec<KeyDesc>,
    pub meta: String,
    pub header: String,
    pub samples: Vec<String>,
}

impl Descriptions {
    pub fn store(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_varint(&mut buf, self.no_variants as u64);
        write_varint(&mut buf, self.no_samples as u64);
        buf.push(self.ploidy);
        write_varint(&mut buf, self.gt_key_id.map(|g| g as u64 + 1).unwrap_or(0));
        write_varint(&mut buf, self.keys.len() as u64);
        for k in &self.keys {
            write_varint(&mut buf, k.key_id as u64);
            buf.push(k.kind.to_u8());
            buf.push(k.value_type.to_u8());
            write_varint(&mut buf, k.arity as u64);
        }
        append_string(&mut buf, &self.meta);
        append_string(&mut buf, &self.header);
        write_varint(&mut buf, self.samples.len() as u64);
        for s in &self.samples {
            append_string(&mut buf, s);
        }
        buf
    }

    pub fn load(data: &[u8]) -> Result<Self> {
        let mut pos = 0usize;
        let trunc = || Error::format("truncated descriptions blob");

        let no_variants = read_varint(data, &mut pos).ok_or_else(trunc)? as u32;
        let no_samples = read_varint(data, &mut pos).ok_or_else(trunc)? as u32;
        let ploidy = *data.get(pos).ok_or_else(trunc)?;
        pos += 1;
        let gt_raw = read_varint(data, &mut pos).ok_or_else(trunc)?;
        let gt_key_id = if gt_raw == 0 {
            None
        } else {
            Some(gt_raw as u32 - 1)
        };

        let no_keys = read_varint(data, &mut pos).ok_or_else(trunc)? as usize;
        let mut keys = Vec::with_capacity(no_keys);
        for _ in 0..no_keys {
            let key_id = read_varint(data, &mut pos).ok_or_else(trunc)? as u32;
            let kind = KeyKind::from_u8(*data.get(pos).ok_or_else(trunc)?)
                .ok_or_else(|| Error::format("unknown key kind in descriptions"))?;
            pos += 1;
            let value_type = ValueType::from_u8(*data.get(pos).ok_or_else(trunc)?)
                .ok_or_else(|| Error::format("unknown value type in descriptions"))?;
            pos += 1;
            let arity = read_varint(data, &mut pos).ok_or_else(trunc)? as u32;
            keys.push(KeyDesc {
                key_id,
                kind,
                value_type,
                arity,
            });
        }

        let meta = read_string(data, &mut pos)?;
        let header = read_string(data, &mut pos)?;
        let n_samples = read_varint(data, &mut pos).ok_or_else(trunc)? as usize;
        let mut samples = Vec::with_capacity(n_samples);
        for _ in 0..n_samples {
            samples.push(read_string(data, &mut pos)?);
        }

        Ok(Self {
            no_variants,
            no_samples,
            ploidy,
            gt_key_id,
            keys,
            meta,
            header,
            samples,
        })
    }
}

// ============================================================================
// The orchestrator
// ============================================================================

enum Session {
    None,
    Writing(Box<write::WriteSession>),
    Reading(Box<read::ReadSession>),
    Closed,
}

/// Multi-stream compressed variant archive: the public engine API.
///
/// One instance handles one archive in one direction. Schema setters must
/// all run before the first [`set_variant`](Self::set_variant); getters are
/// valid only after [`open_for_reading`](Self::open_for_reading).
pub struct CompressedFile {
    session: Session,
    params: Params,
    meta: String,
    header: String,
    samples: Vec<String>,
    keys: Vec<KeyDesc>,
    no_keys: u32,
    no_samples: u32,
    ploidy: u8,
    gt_key_id: Option<u32>,
    pbwt_requested: bool,
    no_variants: u32,
}

impl Default for CompressedFile {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressedFile {
    pub fn new() -> Self {
        Self {
            session: Session::None,
            params: Params::default(),
            meta: String::new(),
            header: String::new(),
            samples: Vec::new(),
            keys: Vec::new(),
            no_keys: 0,
            no_samples: 0,
            ploidy: 1,
            gt_key_id: None,
            pbwt_requested: false,
            no_variants: 0,
        }
    }

    /// Create an archive for compression. Fails if the path exists.
    pub fn open_for_writing(&mut self, path: impl AsRef<Path>, no_keys: u32) -> Result<()> {
        if !matches!(self.session, Session::None) {
            return Err(Error::state("open_for_writing after a session started"));
        }
        let session = write::WriteSession::create(path.as_ref(), no_keys)?;
        self.no_keys = no_keys;
        self.session = Session::Writing(Box::new(session));
        info!(path = %path.as_ref().display(), no_keys, "opened archive for writing");
        Ok(())
    }

    /// Open an archive for decompression, validating magic and directory.
    pub fn open_for_reading(&mut self, path: impl AsRef<Path>) -> Result<()> {
        if !matches!(self.session, Session::None) {
            return Err(Error::state("open_for_reading after a session started"));
        }
        let session = read::ReadSession::open(path.as_ref(), self.params.no_threads)?;

        self.params.neglect_limit = session.neglect_limit();
        let desc = session.descriptions();
        self.no_variants = desc.no_variants;
        self.no_samples = desc.no_samples;
        self.ploidy = desc.ploidy;
        self.gt_key_id = desc.gt_key_id;
        self.no_keys = desc.keys.len() as u32;
        self.keys = desc.keys.clone();
        self.meta = desc.meta.clone();
        self.header = desc.header.clone();
        self.samples = desc.samples.clone();

        self.session = Session::Reading(Box::new(session));
        info!(
            path = %path.as_ref().display(),
            variants = self.no_variants,
            "opened archive for reading"
        );
        Ok(())
    }

    fn writing(&mut self) -> Result<&mut write::WriteSession> {
        match &mut self.session {
            Session::Writing(w) => Ok(w),
            _ => Err(Error::state("operation requires a writing session")),
        }
    }

    fn reading(&mut self) -> Result<&mut read::ReadSession> {
        match &mut self.session {
            Session::Reading(r) => Ok(r),
            _ => Err(Error::state("operation requires a reading session")),
        }
    }

    fn check_settable(&self) -> Result<()> {
        match &self.session {
            Session::Writing(w) if !w.started() => Ok(()),
            Session::Writing(_) => Err(Error::state("setters must run before the first variant")),
            Session::None => Ok(()),
            _ => Err(Error::state("setters require a writing session")),
        }
    }

    fn check_gettable(&self) -> Result<()> {
        match &self.session {
            Session::Reading(_) => Ok(()),
            _ => Err(Error::state("getters require a reading session")),
        }
    }

    // ---- schema setters (pre-variant) ------------------------------------

    pub fn set_meta(&mut self, meta: String) -> Result<()> {
        self.check_settable()?;
        self.meta = meta;
        Ok(())
    }

    pub fn set_header(&mut self, header: String) -> Result<()> {
        self.check_settable()?;
        self.header = header;
        Ok(())
    }

    pub fn add_samples(&mut self, samples: Vec<String>) -> Result<()> {
        self.check_settable()?;
        self.samples.extend(samples);
        Ok(())
    }

    pub fn set_keys(&mut self, keys: Vec<KeyDesc>) -> Result<()> {
        self.check_settable()?;
        if keys.len() as u32 != self.no_keys {
            return Err(Error::schema(format!(
                "key table has {} entries, archive declared {}",
                keys.len(),
                self.no_keys
            )));
        }
        for (i, k) in keys.iter().enumerate() {
            if k.key_id != i as u32 {
                return Err(Error::schema(format!(
                    "key at position {i} carries id {}; ids must be dense and ascending",
                    k.key_id
                )));
            }
        }
        self.keys = keys;
        Ok(())
    }

    pub fn set_ploidy(&mut self, ploidy: u8) -> Result<()> {
        self.check_settable()?;
        self.ploidy = ploidy;
        Ok(())
    }

    pub fn set_gt_id(&mut self, gt_key_id: u32) -> Result<()> {
        self.check_settable()?;
        self.gt_key_id = Some(gt_key_id);
        Ok(())
    }

    pub fn set_neglect_limit(&mut self, neglect_limit: u32) -> Result<()> {
        self.check_settable()?;
        self.params.neglect_limit = neglect_limit;
        Ok(())
    }

    /// Also legal before `open_for_reading`, where it sizes the prefetch
    /// pool.
    pub fn set_no_threads(&mut self, no_threads: u32) -> Result<()> {
        self.check_settable()?;
        self.params.no_threads = no_threads.max(1);
        Ok(())
    }

    pub fn set_no_samples(&mut self, no_samples: u32) -> Result<()> {
        self.check_settable()?;
        self.no_samples = no_samples;
        Ok(())
    }

    /// Initialise the PBWT transform from the configured ploidy, sample
    /// count and neglect limit. Required before the first genotype variant.
    pub fn init_pbwt(&mut self) -> Result<()> {
        self.check_settable()?;
        if self.pbwt_requested {
            return Err(Error::state("init_pbwt called twice"));
        }
        self.pbwt_requested = true;
        Ok(())
    }

    // ---- getters (reading) -----------------------------------------------

    pub fn get_meta(&self) -> Result<&str> {
        self.check_gettable()?;
        Ok(&self.meta)
    }

    pub fn get_header(&self) -> Result<&str> {
        self.check_gettable()?;
        Ok(&self.header)
    }

    pub fn get_samples(&self) -> Result<&[String]> {
        self.check_gettable()?;
        Ok(&self.samples)
    }

    pub fn get_keys(&self) -> Result<&[KeyDesc]> {
        self.check_gettable()?;
        Ok(&self.keys)
    }

    pub fn get_ploidy(&self) -> Result<u8> {
        self.check_gettable()?;
        Ok(self.ploidy)
    }

    pub fn get_gt_id(&self) -> Result<Option<u32>> {
        self.check_gettable()?;
        Ok(self.gt_key_id)
    }

    pub fn get_no_variants(&self) -> Result<u32> {
        self.check_gettable()?;
        Ok(self.no_variants)
    }

    pub fn get_no_samples(&self) -> Result<u32> {
        self.check_gettable()?;
        Ok(self.no_samples)
    }

    pub fn get_no_keys(&self) -> Result<u32> {
        self.check_gettable()?;
        Ok(self.no_keys)
    }

    pub fn get_neglect_limit(&self) -> Result<u32> {
        self.check_gettable()?;
        Ok(self.params.neglect_limit)
    }

    /// True once every variant has been read back.
    pub fn eof(&mut self) -> Result<bool> {
        let no_variants = self.no_variants;
        let r = self.reading()?;
        Ok(r.variants_read() >= no_variants)
    }

    // ---- record flow ------------------------------------------------------

    /// Append one variant. `fields` must carry one entry per declared key;
    /// a declared genotype field must hold `no_samples × ploidy` alleles.
    pub fn set_variant(&mut self, desc: &VariantDesc, fields: Vec<FieldValue>) -> Result<()> {
        let meta = write::SchemaView {
            keys: &self.keys,
            no_samples: self.no_samples,
            ploidy: self.ploidy,
            gt_key_id: self.gt_key_id,
            params: self.params,
            pbwt_requested: self.pbwt_requested,
        };
        let w = match &mut self.session {
            Session::Writing(w) => w,
            _ => return Err(Error::state("set_variant requires a writing session")),
        };
        w.set_variant(&meta, desc, fields)
    }

    /// Read the next variant into `desc`/`fields`; returns `false` at EOF.
    pub fn get_variant(
        &mut self,
        desc: &mut VariantDesc,
        fields: &mut Vec<FieldValue>,
    ) -> Result<bool> {
        let r = self.reading()?;
        r.get_variant(desc, fields)
    }

    /// Install redundancy graphs. Empty graphs request internal discovery
    /// at close; non-empty graphs are validated and applied immediately.
    pub fn optimize_db(&mut self, size_graph: SizeGraph, data_graph: DataGraph) -> Result<()> {
        let gt_key_id = self.gt_key_id;
        let w = self.writing()?;
        w.optimize_db(size_graph, data_graph, gt_key_id)
    }

    /// Flush remaining buffers, write the directory and join all workers
    /// (writing), or drain the prefetch pool (reading).
    pub fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.session, Session::Closed) {
            Session::Writing(mut w) => {
                let meta = write::SchemaView {
                    keys: &self.keys,
                    no_samples: self.no_samples,
                    ploidy: self.ploidy,
                    gt_key_id: self.gt_key_id,
                    params: self.params,
                    pbwt_requested: self.pbwt_requested,
                };
                w.close(&meta, &self.meta, &self.header, &self.samples)
            }
            Session::Reading(mut r) => r.close(),
            Session::None => Err(Error::state("close without an open session")),
            Session::Closed => Err(Error::state("archive already closed")),
        }
    }
}

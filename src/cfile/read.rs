//! Decompression session.
//!
//! The mirror of the write path: the directory and structural streams are
//! loaded at open, then a pool of workers decodes parts ahead of the
//! cursors that re-interleave substreams into variant records. A queue of
//! `(slot, part)` preparation tokens drives the prefetch; cursors top the
//! queue up as they consume, so at most a few parts per stream are resident.
//! Text and genotype parts decode in part order under a turn gate because
//! their dictionary and model state is sequential.

use rustc_hash::FxHashMap;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::debug;

use super::{
    db_data_name, db_size_name, key_data_name, key_func_name, key_size_name, Descriptions,
    ErrorSlot, OrderGate, DB_ALT, DB_CHROM, DB_ID, DB_POS, DB_QUAL, DB_REF, NO_DB_FIELDS,
    PREFETCH_PARTS, STREAM_DATA_EDGES, STREAM_DATA_NODES, STREAM_DESCRIPTIONS, STREAM_PARAMS,
    STREAM_SIZE_EDGES, STREAM_SIZE_NODES,
};
use crate::archive::Archive;
use crate::compression::entropy::{self, EntropyParams};
use crate::compression::graph::{self, DataFunction};
use crate::compression::pbwt::Pbwt;
use crate::compression::rc::{self, ContextModels, GtHistory, RangeDecoder, DEFAULT_MAX_LOG_COUNTER};
use crate::compression::text_pp::TextPreprocessing;
use crate::compression::{
    bytes_to_sizes, read_le_u32, read_varint, unzigzag, FIELD_PRESENT_FLAG, PP_COMPRESS_FLAG,
};
use crate::error::{Error, Result};
use crate::params::Params;
use crate::queue::RegisteringQueue;
use crate::record::{FieldValue, ValueType, VariantDesc};

#[derive(Debug, Clone, Copy)]
enum Decode {
    Sizes(EntropyParams),
    Plain(EntropyParams),
    Text(EntropyParams),
    Gt,
}

struct SlotPlan {
    sid: u32,
    decode: Decode,
}

#[derive(Debug, Clone, Copy)]
struct PrepToken {
    slot: usize,
    part: u32,
}

enum Prepared {
    Sizes(Vec<u32>),
    Data(Vec<u8>),
}

/// Decoded parts waiting for their cursor, keyed by `(slot, part)`.
#[derive(Default)]
struct PreparedStore {
    map: Mutex<FxHashMap<(usize, u32), Prepared>>,
    cv: Condvar,
}

impl PreparedStore {
    fn insert(&self, key: (usize, u32), value: Prepared) {
        self.map.lock().unwrap().insert(key, value);
        self.cv.notify_all();
    }

    fn take(&self, key: (usize, u32), err: &ErrorSlot) -> Result<Prepared> {
        let mut map = self.map.lock().unwrap();
        loop {
            if let Some(v) = map.remove(&key) {
                return Ok(v);
            }
            if err.is_set() {
                return Err(Error::state("prefetch pool terminated by earlier failure"));
            }
            map = self.cv.wait(map).unwrap();
        }
    }

    fn notify_all(&self) {
        let _guard = self.map.lock().unwrap();
        self.cv.notify_all();
    }
}

struct GtDecoder {
    pbwt: Pbwt,
    models: ContextModels,
    history: GtHistory,
}

struct ReaderShared {
    archive: Arc<Archive>,
    queue: RegisteringQueue<PrepToken>,
    prepared: PreparedStore,
    gate: OrderGate,
    text_states: Vec<Mutex<TextPreprocessing>>,
    gt: Mutex<GtDecoder>,
    plan: Vec<SlotPlan>,
    error: ErrorSlot,
    max_log: u32,
}

// ============================================================================
// Cursors
// ============================================================================

struct SizeCursor {
    slot: usize,
    n_parts: u32,
    next_part: u32,
    entries: Vec<u32>,
    pos: usize,
}

impl SizeCursor {
    fn new(slot: usize, n_parts: u32) -> Self {
        Self {
            slot,
            n_parts,
            next_part: 0,
            entries: Vec::new(),
            pos: 0,
        }
    }

    fn next(&mut self, shared: &ReaderShared) -> Result<u32> {
        while self.pos >= self.entries.len() {
            let part = load_part(shared, self.slot, &mut self.next_part, self.n_parts)?;
            self.entries = match part {
                Prepared::Sizes(v) => v,
                Prepared::Data(_) => {
                    return Err(Error::format("data part prepared for a size cursor"))
                }
            };
            self.pos = 0;
        }
        let v = self.entries[self.pos];
        self.pos += 1;
        Ok(v)
    }
}

struct DataCursor {
    slot: usize,
    n_parts: u32,
    next_part: u32,
    data: Vec<u8>,
    pos: usize,
}

impl DataCursor {
    fn new(slot: usize, n_parts: u32) -> Self {
        Self {
            slot,
            n_parts,
            next_part: 0,
            data: Vec::new(),
            pos: 0,
        }
    }

    fn next_bytes(&mut self, shared: &ReaderShared, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        while self.pos >= self.data.len() {
            let part = load_part(shared, self.slot, &mut self.next_part, self.n_parts)?;
            self.data = match part {
                Prepared::Data(v) => v,
                Prepared::Sizes(_) => {
                    return Err(Error::format("size part prepared for a data cursor"))
                }
            };
            self.pos = 0;
        }
        if self.pos + len > self.data.len() {
            return Err(Error::format("variant value crosses a part boundary"));
        }
        let out = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(out)
    }
}

/// Take the next prepared part of a slot and keep the prefetch window full.
fn load_part(
    shared: &ReaderShared,
    slot: usize,
    next_part: &mut u32,
    n_parts: u32,
) -> Result<Prepared> {
    if *next_part >= n_parts {
        return Err(Error::format("substream exhausted before the last variant"));
    }
    let part = shared.prepared.take((slot, *next_part), &shared.error)?;
    let ahead = *next_part + PREFETCH_PARTS;
    if ahead < n_parts {
        shared.queue.push(PrepToken { slot, part: ahead });
    }
    *next_part += 1;
    Ok(part)
}

// ============================================================================
// The session
// ============================================================================

pub(crate) struct ReadSession {
    shared: Arc<ReaderShared>,
    workers: Vec<JoinHandle<()>>,
    desc: Descriptions,
    neglect_limit: u32,
    no_variants: u32,
    i_variant: u32,
    closed: bool,
    db_size: Vec<SizeCursor>,
    db_data: Vec<DataCursor>,
    key_size: Vec<Option<SizeCursor>>,
    key_data: Vec<Option<DataCursor>>,
    size_src: Vec<Option<u32>>,
    data_func: Vec<Option<(u32, DataFunction)>>,
    cur_sizes: Vec<u32>,
    prev_chrom: String,
    prev_pos: i64,
}

impl ReadSession {
    pub fn open(path: &Path, no_threads: u32) -> Result<Self> {
        let archive = Arc::new(Archive::open(path)?);

        let params_blob = archive
            .read_stream(STREAM_PARAMS)?
            .ok_or_else(|| Error::format("archive is missing its parameter stream"))?;
        let mut params = Params::default();
        params.load_params(&params_blob)?;

        let desc_part = archive
            .read_stream(STREAM_DESCRIPTIONS)?
            .ok_or_else(|| Error::format("archive is missing its descriptions stream"))?;
        let raw_len = read_le_u32(&desc_part, 0)? as usize;
        let desc_raw = entropy::decode_block(&desc_part[4..], entropy::P_META, raw_len)?;
        let desc = Descriptions::load(&desc_raw)?;
        let no_keys = desc.keys.len();

        // Graph streams. Node lists are parsed for validation; edges drive
        // reconstruction.
        let load = |name: &str| -> Result<Vec<u8>> {
            archive
                .read_stream(name)?
                .ok_or_else(|| Error::format(format!("archive is missing stream {name}")))
        };
        graph::load_nodes(&load(STREAM_SIZE_NODES)?)?;
        graph::load_nodes(&load(STREAM_DATA_NODES)?)?;
        let size_edges = graph::load_edges(&load(STREAM_SIZE_EDGES)?)?;
        let data_edge_pairs = graph::load_edges(&load(STREAM_DATA_EDGES)?)?;

        let mut size_src: Vec<Option<u32>> = vec![None; no_keys];
        for (src, dst) in size_edges {
            if src >= dst || dst as usize >= no_keys || size_src[dst as usize].is_some() {
                return Err(Error::format("size graph is not a forward forest"));
            }
            size_src[dst as usize] = Some(src);
        }

        let mut data_func: Vec<Option<(u32, DataFunction)>> = vec![None; no_keys];
        for (src, dst) in data_edge_pairs {
            if src >= dst || dst as usize >= no_keys || data_func[dst as usize].is_some() {
                return Err(Error::format("data graph is not a forward forest"));
            }
            let blob = load(&key_func_name(dst))?;
            let mut pos = 0usize;
            let stored_src = read_varint(&blob, &mut pos)
                .ok_or_else(|| Error::format("truncated function descriptor"))?
                as u32;
            if stored_src != src {
                return Err(Error::format(format!(
                    "function descriptor of key {dst} names source {stored_src}, edges name {src}"
                )));
            }
            let func = DataFunction::load(&blob[pos..])?;
            data_func[dst as usize] = Some((src, func));
        }

        // Build slot plans and cursors for every materialized stream.
        let mut plan: Vec<SlotPlan> = Vec::new();
        let mut key_size: Vec<Option<SizeCursor>> = Vec::with_capacity(no_keys);
        let mut key_data: Vec<Option<DataCursor>> = Vec::with_capacity(no_keys);

        let make_slot = |plan: &mut Vec<SlotPlan>, name: String, decode: Decode| -> Result<(usize, u32)> {
            let sid = archive
                .stream_id(&name)
                .ok_or_else(|| Error::format(format!("archive is missing stream {name}")))?;
            let n_parts = archive.n_parts(sid) as u32;
            let slot = plan.len();
            plan.push(SlotPlan { sid, decode });
            Ok((slot, n_parts))
        };

        for k in 0..no_keys {
            if size_src[k].is_none() {
                let (slot, n_parts) = make_slot(
                    &mut plan,
                    key_size_name(k as u32),
                    Decode::Sizes(entropy::P_SIZE),
                )?;
                key_size.push(Some(SizeCursor::new(slot, n_parts)));
            } else {
                key_size.push(None);
            }

            if data_func[k].is_none() {
                let decode = if desc.gt_key_id == Some(k as u32) {
                    Decode::Gt
                } else {
                    match desc.keys[k].value_type {
                        ValueType::Int => Decode::Plain(entropy::P_INT),
                        ValueType::Real => Decode::Plain(entropy::P_REAL),
                        ValueType::Flag => Decode::Plain(entropy::P_FLAG),
                        ValueType::Char | ValueType::String => Decode::Text(entropy::P_TEXT),
                    }
                };
                let (slot, n_parts) = make_slot(&mut plan, key_data_name(k as u32), decode)?;
                key_data.push(Some(DataCursor::new(slot, n_parts)));
            } else {
                key_data.push(None);
            }
        }

        let db_routes = [
            Decode::Text(entropy::P_DB_CHROM),
            Decode::Plain(entropy::P_DB_POS),
            Decode::Text(entropy::P_DB_ID),
            Decode::Text(entropy::P_DB_REF),
            Decode::Text(entropy::P_DB_ALT),
            Decode::Plain(entropy::P_DB_QUAL),
        ];
        let mut db_size = Vec::with_capacity(NO_DB_FIELDS);
        let mut db_data = Vec::with_capacity(NO_DB_FIELDS);
        for (db_id, decode) in db_routes.into_iter().enumerate() {
            let (slot, n_parts) = make_slot(
                &mut plan,
                db_size_name(db_id),
                Decode::Sizes(entropy::P_SIZE),
            )?;
            db_size.push(SizeCursor::new(slot, n_parts));
            let (slot, n_parts) = make_slot(&mut plan, db_data_name(db_id), decode)?;
            db_data.push(DataCursor::new(slot, n_parts));
        }

        let mut pbwt = Pbwt::new();
        pbwt.init(desc.ploidy as u32, desc.no_samples, params.neglect_limit);

        let n_slots = plan.len();
        let shared = Arc::new(ReaderShared {
            archive: Arc::clone(&archive),
            queue: RegisteringQueue::new(1),
            prepared: PreparedStore::default(),
            gate: OrderGate::new(n_slots),
            text_states: (0..n_slots)
                .map(|_| Mutex::new(TextPreprocessing::new()))
                .collect(),
            gt: Mutex::new(GtDecoder {
                pbwt,
                models: ContextModels::new(),
                history: GtHistory::default(),
            }),
            plan,
            error: ErrorSlot::default(),
            max_log: DEFAULT_MAX_LOG_COUNTER,
        });

        // Seed the prefetch window, slot-major so every stream's parts are
        // queued in increasing order.
        let mut cursors_parts: Vec<(usize, u32)> = Vec::new();
        for c in key_size.iter().flatten() {
            cursors_parts.push((c.slot, c.n_parts));
        }
        for c in key_data.iter().flatten() {
            cursors_parts.push((c.slot, c.n_parts));
        }
        for c in &db_size {
            cursors_parts.push((c.slot, c.n_parts));
        }
        for c in &db_data {
            cursors_parts.push((c.slot, c.n_parts));
        }
        for (slot, n_parts) in cursors_parts {
            for part in 0..n_parts.min(PREFETCH_PARTS) {
                shared.queue.push(PrepToken { slot, part });
            }
        }

        let mut workers = Vec::new();
        for i in 0..no_threads.max(1) {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("gts-prep-{i}"))
                .spawn(move || worker_loop(shared))?;
            workers.push(handle);
        }
        debug!(threads = no_threads, slots = n_slots, "started prefetch pool");

        let no_variants = desc.no_variants;
        Ok(Self {
            shared,
            workers,
            desc,
            neglect_limit: params.neglect_limit,
            no_variants,
            i_variant: 0,
            closed: false,
            db_size,
            db_data,
            key_size,
            key_data,
            size_src,
            data_func,
            cur_sizes: vec![0; no_keys],
            prev_chrom: String::new(),
            prev_pos: 0,
        })
    }

    pub fn descriptions(&self) -> &Descriptions {
        &self.desc
    }

    pub fn neglect_limit(&self) -> u32 {
        self.neglect_limit
    }

    pub fn variants_read(&self) -> u32 {
        self.i_variant
    }

    fn check_error(&self) -> Result<()> {
        if self.shared.error.is_set() {
            return Err(self
                .shared
                .error
                .take()
                .unwrap_or_else(|| Error::state("prefetch pool failed")));
        }
        Ok(())
    }

    pub fn get_variant(
        &mut self,
        desc: &mut VariantDesc,
        fields: &mut Vec<FieldValue>,
    ) -> Result<bool> {
        self.check_error()?;
        if self.i_variant >= self.no_variants {
            return Ok(false);
        }
        let shared = Arc::clone(&self.shared);

        let db_string = |db_id: usize, this: &mut Self| -> Result<String> {
            let len = this.db_size[db_id].next(&shared)?;
            let bytes = this.db_data[db_id].next_bytes(&shared, len as usize)?;
            String::from_utf8(bytes)
                .map_err(|_| Error::format("database field is not valid UTF-8"))
        };

        desc.chrom = db_string(DB_CHROM, self)?;

        let pos_len = self.db_size[DB_POS].next(&shared)?;
        let pos_bytes = self.db_data[DB_POS].next_bytes(&shared, pos_len as usize)?;
        let mut off = 0usize;
        let delta = unzigzag(
            read_varint(&pos_bytes, &mut off)
                .ok_or_else(|| Error::format("truncated position delta"))?,
        );
        if desc.chrom != self.prev_chrom {
            self.prev_pos = 0;
            self.prev_chrom = desc.chrom.clone();
        }
        desc.pos = self.prev_pos + delta;
        self.prev_pos = desc.pos;

        desc.id = db_string(DB_ID, self)?;
        desc.ref_allele = db_string(DB_REF, self)?;
        desc.alt = db_string(DB_ALT, self)?;
        desc.qual = db_string(DB_QUAL, self)?;

        let no_keys = self.desc.keys.len();
        fields.clear();
        fields.resize(no_keys, FieldValue::default());

        // Keys decode in ascending id order, so every graph source is ready
        // before its dependents.
        for k in 0..no_keys {
            let word = match self.size_src[k] {
                Some(src) => self.cur_sizes[src as usize],
                None => self.key_size[k]
                    .as_mut()
                    .expect("size root has a cursor")
                    .next(&shared)?,
            };
            self.cur_sizes[k] = word;
            let present = word & FIELD_PRESENT_FLAG != 0;
            let len = (word & !FIELD_PRESENT_FLAG) as usize;

            let data = match &self.data_func[k] {
                Some((src, func)) => func.apply(&fields[*src as usize].data)?,
                None => self.key_data[k]
                    .as_mut()
                    .expect("data root has a cursor")
                    .next_bytes(&shared, len)?,
            };
            fields[k] = FieldValue { present, data };
        }

        self.i_variant += 1;
        Ok(true)
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::state("reading session already closed"));
        }
        self.shared.queue.mark_completed();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        self.closed = true;
        self.check_error()
    }
}

impl Drop for ReadSession {
    fn drop(&mut self) {
        if !self.closed {
            self.shared.queue.mark_completed();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// Workers
// ============================================================================

fn worker_loop(shared: Arc<ReaderShared>) {
    while let Some(token) = shared.queue.pop() {
        if shared.error.is_set() {
            continue;
        }
        if let Err(e) = prepare_part(&shared, token) {
            shared.error.set(e);
            shared.gate.notify_all();
            shared.prepared.notify_all();
        }
    }
}

fn prepare_part(shared: &ReaderShared, token: PrepToken) -> Result<()> {
    let plan = &shared.plan[token.slot];
    let blob = shared.archive.read_part(plan.sid, token.part)?;
    let word = read_le_u32(&blob, 0)?;
    let comp = &blob[4..];

    let prepared = match plan.decode {
        Decode::Sizes(preset) => {
            if word & PP_COMPRESS_FLAG != 0 {
                return Err(Error::format("size part carries the preprocessed flag"));
            }
            let raw = entropy::decode_block(comp, preset, word as usize)?;
            Prepared::Sizes(bytes_to_sizes(&raw)?)
        }
        Decode::Plain(preset) => {
            if word & PP_COMPRESS_FLAG != 0 {
                return Err(Error::format(
                    "preprocessed flag on a stream that never preprocesses",
                ));
            }
            Prepared::Data(entropy::decode_block(comp, preset, word as usize)?)
        }
        Decode::Text(preset) => {
            if word & PP_COMPRESS_FLAG == 0 {
                return Err(Error::format("text part is missing the preprocessed flag"));
            }
            let raw_len = (word & !PP_COMPRESS_FLAG) as usize;
            let decoded = entropy::decode_block(comp, preset, raw_len)?;
            // Dictionary state is sequential: postprocess in part order.
            shared.gate.wait_turn(token.slot, token.part, &shared.error)?;
            let out = shared.text_states[token.slot]
                .lock()
                .unwrap()
                .postprocess(&decoded)?;
            shared.gate.advance(token.slot);
            Prepared::Data(out)
        }
        Decode::Gt => {
            shared.gate.wait_turn(token.slot, token.part, &shared.error)?;
            let out = decode_gt_part(shared, comp, word as usize)?;
            shared.gate.advance(token.slot);
            Prepared::Data(out)
        }
    };

    shared.prepared.insert((token.slot, token.part), prepared);
    Ok(())
}

fn decode_gt_part(shared: &ReaderShared, comp: &[u8], raw_len: usize) -> Result<Vec<u8>> {
    if raw_len == 0 {
        return Ok(Vec::new());
    }
    let mut st = shared.gt.lock().unwrap();
    let nsp = st.pbwt.no_haplotypes();
    if nsp == 0 || raw_len % nsp != 0 {
        return Err(Error::codec(format!(
            "genotype part of {raw_len} bytes is not a whole number of {nsp}-haplotype sites"
        )));
    }

    let mut dec = RangeDecoder::new(comp);
    let mut out = Vec::with_capacity(raw_len);
    let GtDecoder {
        pbwt,
        models,
        history,
    } = &mut *st;
    for _ in 0..raw_len / nsp {
        let permuted = rc::decode_gt_site(models, &mut dec, history, nsp, shared.max_log)?;
        out.extend_from_slice(&pbwt.decode(&permuted)?);
    }
    Ok(out)
}

//! Compression session.
//!
//! The orchestrator thread stages every variant into per-stream buffers and
//! turns full buffers into packages; worker threads route each package
//! through its codec pipeline and append the finished parts. Two turn gates
//! keep the archive deterministic: the coder section orders appends within a
//! stream, the text section orders dictionary work among text parts of a
//! stream. Genotype packages encode inside their coder turn because PBWT and
//! the range-coder models are sequential across parts.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, info};

use super::{
    db_data_name, db_size_name, key_data_name, key_func_name, key_size_name, Descriptions,
    ErrorSlot, OrderGate, DB_ALT, DB_CHROM, DB_ID, DB_POS, DB_QUAL, DB_REF, NO_DB_FIELDS,
    STREAM_DATA_EDGES, STREAM_DATA_NODES, STREAM_DESCRIPTIONS, STREAM_PARAMS, STREAM_SIZE_EDGES,
    STREAM_SIZE_NODES,
};
use crate::archive::Archive;
use crate::buffer::{StreamBuffer, MAX_BUFFER_GT_SIZE, MAX_BUFFER_SIZE};
use crate::compression::entropy::{self, EntropyParams};
use crate::compression::graph::{
    self, DataFunction, DataGraph, SizeGraph, StreamSample,
};
use crate::compression::pbwt::Pbwt;
use crate::compression::rc::{self, ContextModels, GtHistory, RangeEncoder, DEFAULT_MAX_LOG_COUNTER};
use crate::compression::text_pp::TextPreprocessing;
use crate::compression::{
    sizes_to_bytes, write_varint, zigzag, FIELD_PRESENT_FLAG, PP_COMPRESS_FLAG,
};
use crate::error::{Error, Result};
use crate::params::Params;
use crate::queue::RegisteringQueue;
use crate::record::{FieldValue, KeyDesc, ValueType, VariantDesc};

/// Schema fields borrowed from the orchestrator for one call.
pub(crate) struct SchemaView<'a> {
    pub keys: &'a [KeyDesc],
    pub no_samples: u32,
    pub ploidy: u8,
    pub gt_key_id: Option<u32>,
    pub params: Params,
    pub pbwt_requested: bool,
}

/// Codec pipeline of one slot (key or database field).
#[derive(Debug, Clone, Copy)]
enum Route {
    Plain(EntropyParams),
    Text(EntropyParams),
    Gt,
}

struct SlotPlan {
    sid_size: u32,
    sid_data: u32,
    route: Route,
}

/// Unit of deferred compression. Immutable once enqueued.
struct Package {
    slot: usize,
    part_id: u32,
    sizes: Vec<u32>,
    data: Vec<u8>,
    store_sizes: bool,
    store_data: bool,
}

struct GtEncoder {
    pbwt: Pbwt,
    models: ContextModels,
    history: GtHistory,
}

struct WriterShared {
    archive: Arc<Archive>,
    queue: RegisteringQueue<Package>,
    coder: OrderGate,
    text: OrderGate,
    text_states: Vec<Mutex<TextPreprocessing>>,
    gt: Mutex<GtEncoder>,
    plan: Vec<SlotPlan>,
    error: ErrorSlot,
    max_log: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptState {
    NotRequested,
    DiscoverAtClose,
    Applied,
}

pub(crate) struct WriteSession {
    archive: Arc<Archive>,
    shared: Option<Arc<WriterShared>>,
    workers: Vec<JoinHandle<()>>,
    no_keys: u32,
    started: bool,
    closed: bool,
    /// Staging buffers: one slot per key, then the six database fields.
    bufs: Vec<StreamBuffer>,
    part_next: Vec<u32>,
    prev_chrom: String,
    prev_pos: i64,
    no_variants: u32,
    opt: OptState,
    size_graph: SizeGraph,
    data_graph: DataGraph,
    size_src: Vec<Option<u32>>,
    data_func: Vec<Option<(u32, DataFunction)>>,
}

impl WriteSession {
    pub fn create(path: &Path, no_keys: u32) -> Result<Self> {
        let archive = Arc::new(Archive::create(path)?);
        let n_slots = no_keys as usize + NO_DB_FIELDS;
        Ok(Self {
            archive,
            shared: None,
            workers: Vec::new(),
            no_keys,
            started: false,
            closed: false,
            bufs: (0..n_slots).map(|_| StreamBuffer::new(MAX_BUFFER_SIZE)).collect(),
            part_next: vec![0; n_slots],
            prev_chrom: String::new(),
            prev_pos: 0,
            no_variants: 0,
            opt: OptState::NotRequested,
            size_graph: SizeGraph::default(),
            data_graph: DataGraph::default(),
            size_src: vec![None; no_keys as usize],
            data_func: vec![None; no_keys as usize],
        })
    }

    pub fn started(&self) -> bool {
        self.started
    }

    fn check_error(&self) -> Result<()> {
        if let Some(shared) = &self.shared {
            if shared.error.is_set() {
                return Err(shared
                    .error
                    .take()
                    .unwrap_or_else(|| Error::state("worker pool failed")));
            }
        }
        Ok(())
    }

    /// Freeze the schema, register every stream and spawn the worker pool.
    /// Runs once, at the first variant (or at close for empty archives).
    fn ensure_started(&mut self, meta: &SchemaView) -> Result<()> {
        if self.started {
            return Ok(());
        }
        if meta.keys.len() as u32 != self.no_keys {
            return Err(Error::schema(format!(
                "archive declared {} keys but set_keys provided {}",
                self.no_keys,
                meta.keys.len()
            )));
        }
        if let Some(g) = meta.gt_key_id {
            if g >= self.no_keys {
                return Err(Error::schema(format!(
                    "genotype key id {g} out of range for {} keys",
                    self.no_keys
                )));
            }
        }

        let mut plan = Vec::with_capacity(self.bufs.len());
        for k in 0..self.no_keys {
            let sid_size = self.archive.register_stream(&key_size_name(k))?;
            let sid_data = self.archive.register_stream(&key_data_name(k))?;
            let route = if meta.gt_key_id == Some(k) {
                self.bufs[k as usize] = StreamBuffer::new(MAX_BUFFER_GT_SIZE);
                Route::Gt
            } else {
                match meta.keys[k as usize].value_type {
                    ValueType::Int => Route::Plain(entropy::P_INT),
                    ValueType::Real => Route::Plain(entropy::P_REAL),
                    ValueType::Flag => Route::Plain(entropy::P_FLAG),
                    ValueType::Char | ValueType::String => Route::Text(entropy::P_TEXT),
                }
            };
            plan.push(SlotPlan {
                sid_size,
                sid_data,
                route,
            });
        }

        let db_routes = [
            Route::Text(entropy::P_DB_CHROM),
            Route::Plain(entropy::P_DB_POS),
            Route::Text(entropy::P_DB_ID),
            Route::Text(entropy::P_DB_REF),
            Route::Text(entropy::P_DB_ALT),
            Route::Plain(entropy::P_DB_QUAL),
        ];
        for (db_id, route) in db_routes.into_iter().enumerate() {
            let sid_size = self.archive.register_stream(&db_size_name(db_id))?;
            let sid_data = self.archive.register_stream(&db_data_name(db_id))?;
            plan.push(SlotPlan {
                sid_size,
                sid_data,
                route,
            });
        }

        let mut pbwt = Pbwt::new();
        if meta.pbwt_requested {
            pbwt.init(
                meta.ploidy as u32,
                meta.no_samples,
                meta.params.neglect_limit,
            );
        }

        let n_slots = self.bufs.len();
        let shared = Arc::new(WriterShared {
            archive: Arc::clone(&self.archive),
            queue: RegisteringQueue::new(1),
            coder: OrderGate::new(n_slots),
            text: OrderGate::new(n_slots),
            text_states: (0..n_slots)
                .map(|_| Mutex::new(TextPreprocessing::new()))
                .collect(),
            gt: Mutex::new(GtEncoder {
                pbwt,
                models: ContextModels::new(),
                history: GtHistory::default(),
            }),
            plan,
            error: ErrorSlot::default(),
            max_log: DEFAULT_MAX_LOG_COUNTER,
        });

        for i in 0..meta.params.no_threads.max(1) {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("gts-coder-{i}"))
                .spawn(move || worker_loop(shared))?;
            self.workers.push(handle);
        }

        debug!(
            threads = meta.params.no_threads,
            slots = n_slots,
            "started coder pool"
        );
        self.shared = Some(shared);
        self.started = true;
        Ok(())
    }

    pub fn set_variant(
        &mut self,
        meta: &SchemaView,
        desc: &VariantDesc,
        fields: Vec<FieldValue>,
    ) -> Result<()> {
        self.check_error()?;
        self.ensure_started(meta)?;

        if fields.len() as u32 != self.no_keys {
            return Err(Error::schema(format!(
                "variant carries {} fields, schema declares {}",
                fields.len(),
                self.no_keys
            )));
        }
        if let Some(g) = meta.gt_key_id {
            let nsp = meta.no_samples as usize * meta.ploidy as usize;
            if fields[g as usize].data.len() != nsp {
                return Err(Error::schema(format!(
                    "genotype field holds {} allele codes, expected {nsp}",
                    fields[g as usize].data.len()
                )));
            }
        }

        let nk = self.no_keys as usize;

        let chrom = desc.chrom.as_bytes();
        self.bufs[nk + DB_CHROM].append(chrom.len() as u32, chrom);

        // Position deltas restart at zero on every chromosome change.
        if desc.chrom != self.prev_chrom {
            self.prev_pos = 0;
            self.prev_chrom = desc.chrom.clone();
        }
        let delta = desc.pos - self.prev_pos;
        self.prev_pos = desc.pos;
        let mut pos_enc = Vec::with_capacity(10);
        write_varint(&mut pos_enc, zigzag(delta));
        self.bufs[nk + DB_POS].append(pos_enc.len() as u32, &pos_enc);

        let id = desc.id.as_bytes();
        self.bufs[nk + DB_ID].append(id.len() as u32, id);
        let ref_allele = desc.ref_allele.as_bytes();
        self.bufs[nk + DB_REF].append(ref_allele.len() as u32, ref_allele);
        let alt = desc.alt.as_bytes();
        self.bufs[nk + DB_ALT].append(alt.len() as u32, alt);
        let qual = desc.qual.as_bytes();
        self.bufs[nk + DB_QUAL].append(qual.len() as u32, qual);

        for (k, f) in fields.iter().enumerate() {
            if f.data.len() >= FIELD_PRESENT_FLAG as usize {
                return Err(Error::schema(format!(
                    "field {k} holds {} bytes, beyond the size-word range",
                    f.data.len()
                )));
            }
            // Size words carry the presence flag so an explicitly-present
            // empty value survives the round-trip; absent fields store 0.
            let word = if f.present || !f.data.is_empty() {
                FIELD_PRESENT_FLAG | f.data.len() as u32
            } else {
                0
            };
            self.bufs[k].append(word, &f.data);
        }
        self.no_variants += 1;

        for slot in 0..self.bufs.len() {
            if self.bufs[slot].flushed() {
                self.flush_slot(slot);
            }
        }
        Ok(())
    }

    /// Cut a package from one slot's buffers and enqueue it. Fully non-root
    /// slots drop their buffers without consuming a part index.
    fn flush_slot(&mut self, slot: usize) {
        let (store_sizes, store_data) = if slot < self.no_keys as usize {
            (
                self.size_src[slot].is_none(),
                self.data_func[slot].is_none(),
            )
        } else {
            (true, true)
        };

        let (sizes, data) = self.bufs[slot].take();
        if sizes.is_empty() || (!store_sizes && !store_data) {
            return;
        }

        let part_id = self.part_next[slot];
        self.part_next[slot] += 1;

        let shared = self.shared.as_ref().expect("pool started before flush");
        shared.queue.push(Package {
            slot,
            part_id,
            sizes,
            data,
            store_sizes,
            store_data,
        });
    }

    pub fn optimize_db(
        &mut self,
        size_graph: SizeGraph,
        data_graph: DataGraph,
        gt_key_id: Option<u32>,
    ) -> Result<()> {
        self.check_error()?;
        if self.opt != OptState::NotRequested {
            return Err(Error::state("optimize_db called twice"));
        }
        if size_graph.is_empty() && data_graph.is_empty() {
            self.opt = OptState::DiscoverAtClose;
            return Ok(());
        }
        self.apply_graphs(size_graph, data_graph, gt_key_id)?;
        self.opt = OptState::Applied;
        Ok(())
    }

    /// Validate externally supplied or discovered graphs and fill the
    /// per-key reconstruction maps. A target with parts already on disk
    /// would violate the raw-data exclusivity invariant and is rejected.
    fn apply_graphs(
        &mut self,
        size_graph: SizeGraph,
        data_graph: DataGraph,
        gt_key_id: Option<u32>,
    ) -> Result<()> {
        for &(src, dst) in &size_graph.edges {
            if src >= dst || dst >= self.no_keys {
                return Err(Error::schema(format!(
                    "size edge ({src} -> {dst}) is not a forward edge over {} keys",
                    self.no_keys
                )));
            }
            if self.size_src[dst as usize].is_some() {
                return Err(Error::schema(format!(
                    "size stream of key {dst} has two incoming edges"
                )));
            }
            if self.part_next[dst as usize] != 0 {
                return Err(Error::state(format!(
                    "size target key {dst} already has parts on disk"
                )));
            }
            self.size_src[dst as usize] = Some(src);
        }

        for edge in &data_graph.edges {
            let (src, dst) = (edge.src, edge.dst);
            if src >= dst || dst >= self.no_keys {
                return Err(Error::schema(format!(
                    "data edge ({src} -> {dst}) is not a forward edge over {} keys",
                    self.no_keys
                )));
            }
            if gt_key_id == Some(src) || gt_key_id == Some(dst) {
                return Err(Error::schema(
                    "genotype stream cannot participate in the data graph",
                ));
            }
            if self.data_func[dst as usize].is_some() {
                return Err(Error::schema(format!(
                    "data stream of key {dst} has two incoming edges"
                )));
            }
            if self.part_next[dst as usize] != 0 {
                return Err(Error::state(format!(
                    "data target key {dst} already has parts on disk"
                )));
            }
            self.data_func[dst as usize] = Some((src, edge.func.clone()));
        }

        // Normalize node lists: every key appears, roots are the non-targets.
        self.size_graph = SizeGraph {
            nodes: (0..self.no_keys)
                .map(|k| (k, self.size_src[k as usize].is_none()))
                .collect(),
            edges: size_graph.edges,
        };
        self.data_graph = DataGraph {
            nodes: (0..self.no_keys)
                .map(|k| (k, self.data_func[k as usize].is_none()))
                .collect(),
            edges: data_graph.edges,
        };
        Ok(())
    }

    /// Internal redundancy discovery over streams that never flushed a part.
    fn discover_graphs(&mut self, meta: &SchemaView) -> Result<()> {
        let in_buffer = |k: usize| self.part_next[k] == 0;

        let size_samples: Vec<StreamSample> = (0..self.no_keys as usize)
            .map(|k| StreamSample {
                key_id: k as u32,
                eligible: in_buffer(k),
                value_type: meta.keys[k].value_type,
                sizes: self.bufs[k].sizes(),
                data: &[],
            })
            .collect();
        let size_graph = graph::discover_size_graph(&size_samples);
        drop(size_samples);

        let data_samples: Vec<StreamSample> = (0..self.no_keys as usize)
            .map(|k| StreamSample {
                key_id: k as u32,
                eligible: in_buffer(k) && meta.gt_key_id != Some(k as u32),
                value_type: meta.keys[k].value_type,
                sizes: self.bufs[k].sizes(),
                data: self.bufs[k].data(),
            })
            .collect();
        let data_graph = graph::discover_data_graph(&data_samples);
        drop(data_samples);

        info!(
            size_edges = size_graph.edges.len(),
            data_edges = data_graph.edges.len(),
            "graph optimizer finished"
        );
        self.apply_graphs(size_graph, data_graph, meta.gt_key_id)
    }

    pub fn close(
        &mut self,
        meta: &SchemaView,
        meta_text: &str,
        header: &str,
        samples: &[String],
    ) -> Result<()> {
        if self.closed {
            return Err(Error::state("writing session already closed"));
        }
        self.check_error()?;
        self.ensure_started(meta)?;

        if self.opt == OptState::DiscoverAtClose {
            self.discover_graphs(meta)?;
        }
        if self.opt == OptState::NotRequested {
            // No optimizer run: every stream is its own root.
            self.size_graph = SizeGraph {
                nodes: (0..self.no_keys).map(|k| (k, true)).collect(),
                edges: Vec::new(),
            };
            self.data_graph = DataGraph {
                nodes: (0..self.no_keys).map(|k| (k, true)).collect(),
                edges: Vec::new(),
            };
        }

        for slot in 0..self.bufs.len() {
            if !self.bufs[slot].is_empty() {
                self.flush_slot(slot);
            }
        }

        let shared = Arc::clone(self.shared.as_ref().expect("pool started"));
        shared.queue.mark_completed();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        self.closed = true;
        self.check_error()?;

        self.write_structural_streams(meta, meta_text, header, samples)?;
        self.archive.finalize()?;
        self.log_close_stats();
        Ok(())
    }

    fn write_structural_streams(
        &self,
        meta: &SchemaView,
        meta_text: &str,
        header: &str,
        samples: &[String],
    ) -> Result<()> {
        // Function descriptors for data non-roots.
        for (dst, entry) in self.data_func.iter().enumerate() {
            if let Some((src, func)) = entry {
                let mut blob = Vec::new();
                write_varint(&mut blob, *src as u64);
                func.store(&mut blob);
                let sid = self.archive.register_stream(&key_func_name(dst as u32))?;
                self.archive.append_part(sid, &blob)?;
            }
        }

        // Graph node and edge streams.
        let pairs: Vec<(u32, u32)> = self
            .data_graph
            .edges
            .iter()
            .map(|e| (e.src, e.dst))
            .collect();
        for (name, blob) in [
            (STREAM_SIZE_NODES, graph::store_nodes(&self.size_graph.nodes)),
            (STREAM_SIZE_EDGES, graph::store_edges(&self.size_graph.edges)),
            (STREAM_DATA_NODES, graph::store_nodes(&self.data_graph.nodes)),
            (STREAM_DATA_EDGES, graph::store_edges(&pairs)),
        ] {
            let sid = self.archive.register_stream(name)?;
            self.archive.append_part(sid, &blob)?;
        }

        // Descriptions, entropy-compressed with the metadata preset.
        let desc = Descriptions {
            no_variants: self.no_variants,
            no_samples: meta.no_samples,
            ploidy: meta.ploidy,
            gt_key_id: meta.gt_key_id,
            keys: meta.keys.to_vec(),
            meta: meta_text.to_string(),
            header: header.to_string(),
            samples: samples.to_vec(),
        };
        let raw = desc.store();
        let comp = entropy::encode_block(&raw, entropy::P_META)?;
        let mut part = Vec::with_capacity(4 + comp.len());
        part.extend_from_slice(&(raw.len() as u32).to_le_bytes());
        part.extend_from_slice(&comp);
        let sid = self.archive.register_stream(STREAM_DESCRIPTIONS)?;
        self.archive.append_part(sid, &part)?;

        // The 5-byte parameter blob, stored raw.
        let sid = self.archive.register_stream(STREAM_PARAMS)?;
        self.archive.append_part(sid, &meta.params.store_params())?;
        Ok(())
    }

    fn log_close_stats(&self) {
        let stats = self.archive.stream_stats();
        let total: u64 = stats.iter().map(|(_, _, b)| b).sum();
        info!(
            variants = self.no_variants,
            streams = stats.len(),
            bytes = total,
            "archive closed"
        );
        for (name, parts, bytes) in stats {
            if bytes > 0 {
                debug!(stream = %name, parts, bytes, "stream stored");
            }
        }
    }
}

impl Drop for WriteSession {
    fn drop(&mut self) {
        if let Some(shared) = &self.shared {
            shared.queue.mark_completed();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// Workers
// ============================================================================

fn worker_loop(shared: Arc<WriterShared>) {
    while let Some(pkg) = shared.queue.pop() {
        if shared.error.is_set() {
            continue; // drain remaining packages without touching the archive
        }
        if let Err(e) = process_package(&shared, pkg) {
            shared.error.set(e);
            shared.coder.notify_all();
            shared.text.notify_all();
        }
    }
}

fn process_package(shared: &WriterShared, pkg: Package) -> Result<()> {
    let plan = &shared.plan[pkg.slot];

    let size_part = if pkg.store_sizes {
        let raw = sizes_to_bytes(&pkg.sizes);
        Some(frame_part(&raw, entropy::P_SIZE, false)?)
    } else {
        None
    };

    let mut data_part = None;
    if pkg.store_data {
        match plan.route {
            Route::Plain(preset) => {
                data_part = Some(frame_part(&pkg.data, preset, false)?);
            }
            Route::Text(preset) => {
                // Dictionary learning is sequential per stream: take the
                // text turn, preprocess, then release before entropy coding.
                shared.text.wait_turn(pkg.slot, pkg.part_id, &shared.error)?;
                let preprocessed = shared.text_states[pkg.slot]
                    .lock()
                    .unwrap()
                    .preprocess(&pkg.data);
                shared.text.advance(pkg.slot);
                data_part = Some(frame_part(&preprocessed, preset, true)?);
            }
            Route::Gt => {} // encoded below, inside the coder turn
        }
    }

    shared.coder.wait_turn(pkg.slot, pkg.part_id, &shared.error)?;
    if pkg.store_data && matches!(plan.route, Route::Gt) {
        data_part = Some(encode_gt_part(shared, &pkg)?);
    }
    if let Some(part) = size_part {
        shared.archive.append_part(plan.sid_size, &part)?;
    }
    if let Some(part) = data_part {
        shared.archive.append_part(plan.sid_data, &part)?;
    }
    shared.coder.advance(pkg.slot);
    Ok(())
}

/// Frame one part: the raw length word (with the preprocessed flag when the
/// text pass ran) followed by the entropy-coded payload.
fn frame_part(raw: &[u8], preset: EntropyParams, preprocessed: bool) -> Result<Vec<u8>> {
    if raw.len() >= PP_COMPRESS_FLAG as usize {
        return Err(Error::codec(format!(
            "part payload of {} bytes exceeds the 1 GiB cap",
            raw.len()
        )));
    }
    let comp = entropy::encode_block(raw, preset)?;
    let mut word = raw.len() as u32;
    if preprocessed {
        word |= PP_COMPRESS_FLAG;
    }
    let mut part = Vec::with_capacity(4 + comp.len());
    part.extend_from_slice(&word.to_le_bytes());
    part.extend_from_slice(&comp);
    Ok(part)
}

/// PBWT + run-length + range coding of one genotype part. Runs inside the
/// coder turn: transform state and models are sequential across parts.
fn encode_gt_part(shared: &WriterShared, pkg: &Package) -> Result<Vec<u8>> {
    if pkg.data.is_empty() {
        return Ok(0u32.to_le_bytes().to_vec());
    }

    let mut st = shared.gt.lock().unwrap();
    if !st.pbwt.is_initialised() {
        return Err(Error::state("genotype data staged before init_pbwt"));
    }
    let nsp = st.pbwt.no_haplotypes();
    if nsp == 0 || pkg.data.len() % nsp != 0 {
        return Err(Error::codec(format!(
            "genotype part of {} bytes is not a whole number of {nsp}-haplotype sites",
            pkg.data.len()
        )));
    }

    let mut enc = RangeEncoder::new();
    let GtEncoder {
        pbwt,
        models,
        history,
    } = &mut *st;
    for site in pkg.data.chunks_exact(nsp) {
        let permuted = pbwt.encode(site)?;
        rc::encode_gt_site(models, &mut enc, history, &permuted, shared.max_log);
    }
    let bytes = enc.finish();

    let mut part = Vec::with_capacity(4 + bytes.len());
    part.extend_from_slice(&(pkg.data.len() as u32).to_le_bytes());
    part.extend_from_slice(&bytes);
    Ok(part)
}

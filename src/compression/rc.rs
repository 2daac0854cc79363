//! Context-adaptive range coder for the genotype path.
//!
//! A forward range coder with integer cumulative frequencies drives all
//! genotype coding. Models are adaptive and keyed by a tagged 64-bit-class
//! context; encoder and decoder intern models lazily from the same context
//! sequence, so their states stay bit-identical at every step.

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};

const RC_TOP: u32 = 1 << 24;

/// Default bound on model totals: counters halve at `1 << max_log`.
pub const DEFAULT_MAX_LOG_COUNTER: u32 = 16;

/// Longest run a single token can carry (three residual bytes).
pub const MAX_RUN_LEN: u32 = (1 << 24) - 1;

/// Alphabet of the run-length prefix model: literal lengths 0..=15 plus
/// three escape codes announcing 1, 2 or 3 residual bytes.
const PREFIX_ALPHABET: usize = 19;
const PREFIX_LARGE1: usize = 16;
const PREFIX_LARGE2: usize = 17;
const PREFIX_LARGE3: usize = 18;

// ============================================================================
// Range encoder (LZMA-style with carry propagation via 64-bit low)
// ============================================================================

pub struct RangeEncoder {
    low: u64,
    range: u32,
    cache: u8,
    cache_size: u32,
    output: Vec<u8>,
}

impl Default for RangeEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeEncoder {
    pub fn new() -> Self {
        Self {
            low: 0,
            range: 0xFFFF_FFFF,
            cache: 0,
            cache_size: 1,
            output: Vec::new(),
        }
    }

    #[inline(always)]
    fn shift_low(&mut self) {
        let low_hi = (self.low >> 32) as u8;
        if low_hi != 0 || (self.low as u32) < 0xFF00_0000 {
            let mut byte = self.cache;
            loop {
                self.output.push(byte.wrapping_add(low_hi));
                byte = 0xFF;
                self.cache_size -= 1;
                if self.cache_size == 0 {
                    break;
                }
            }
            self.cache = ((self.low >> 24) & 0xFF) as u8;
        }
        self.cache_size += 1;
        self.low = ((self.low as u32) << 8) as u64;
    }

    #[inline(always)]
    fn encode(&mut self, cum: u32, freq: u32, total: u32) {
        let r = self.range / total;
        self.low += cum as u64 * r as u64;
        if cum + freq < total {
            self.range = r * freq;
        } else {
            self.range -= r * cum;
        }
        while self.range < RC_TOP {
            self.range <<= 8;
            self.shift_low();
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        for _ in 0..5 {
            self.shift_low();
        }
        self.output
    }
}

// ============================================================================
// Range decoder
// ============================================================================

pub struct RangeDecoder<'a> {
    range: u32,
    code: u32,
    input: &'a [u8],
    pos: usize,
}

impl<'a> RangeDecoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        let mut dec = Self {
            range: 0xFFFF_FFFF,
            code: 0,
            input,
            pos: 0,
        };
        // Skip first byte (always 0x00 from the encoder's initial cache).
        if !input.is_empty() {
            dec.pos = 1;
        }
        for _ in 0..4 {
            dec.code = (dec.code << 8) | dec.next_byte() as u32;
        }
        dec
    }

    #[inline(always)]
    fn next_byte(&mut self) -> u8 {
        if self.pos < self.input.len() {
            let b = self.input[self.pos];
            self.pos += 1;
            b
        } else {
            0
        }
    }

    #[inline(always)]
    fn decode(&mut self, cum_freqs: &[u32], n_symbols: usize, total: u32) -> usize {
        let r = self.range / total;
        let offset = (self.code / r).min(total - 1);

        // Linear scan; genotype alphabets are small in practice.
        let mut sym = 0;
        while sym + 1 < n_symbols && cum_freqs[sym + 1] <= offset {
            sym += 1;
        }

        let cum = cum_freqs[sym];
        let freq = cum_freqs[sym + 1] - cum;

        self.code -= cum * r;
        if cum + freq < total {
            self.range = r * freq;
        } else {
            self.range -= r * cum;
        }

        while self.range < RC_TOP {
            self.code = (self.code << 8) | self.next_byte() as u32;
            self.range <<= 8;
        }
        sym
    }
}

// ============================================================================
// Adaptive model with bounded counter growth
// ============================================================================

struct AdaptiveModel {
    cum_freqs: Vec<u32>,
    n_symbols: usize,
    total: u32,
    rescale_threshold: u32,
}

impl AdaptiveModel {
    fn new(n_symbols: usize, max_log_counter: u32) -> Self {
        // Uniform Laplace-smoothed start: every symbol has count 1.
        let cum_freqs: Vec<u32> = (0..=n_symbols).map(|i| i as u32).collect();
        Self {
            cum_freqs,
            n_symbols,
            total: n_symbols as u32,
            rescale_threshold: 1 << max_log_counter,
        }
    }

    #[inline(always)]
    fn encode_params(&self, sym: usize) -> (u32, u32, u32) {
        let cum = self.cum_freqs[sym];
        let freq = self.cum_freqs[sym + 1] - cum;
        (cum, freq, self.total)
    }

    #[inline(always)]
    fn update(&mut self, sym: usize) {
        for i in (sym + 1)..=self.n_symbols {
            self.cum_freqs[i] += 1;
        }
        self.total += 1;
        if self.total >= self.rescale_threshold {
            self.rescale();
        }
    }

    fn rescale(&mut self) {
        let mut cum = 0u32;
        let mut prev = self.cum_freqs[0];
        self.cum_freqs[0] = 0;
        for i in 0..self.n_symbols {
            let freq = self.cum_freqs[i + 1] - prev;
            prev = self.cum_freqs[i + 1];
            cum += (freq >> 1).max(1);
            self.cum_freqs[i + 1] = cum;
        }
        self.total = cum;
    }
}

// ============================================================================
// Tagged contexts and the context → model map
// ============================================================================

/// Context selecting one adaptive model. The discriminant plays the role of
/// the original 64-bit tag nibble; payload bits carry recent history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Context {
    /// Run symbol, conditioned on the previous two run symbols.
    Symbol { hist: u16 },
    /// Run symbol at a site boundary, conditioned on the previous site's
    /// trailing history.
    Suffix { hist: u16 },
    /// Run-length prefix code, conditioned on the run symbol.
    Prefix { sym: u8 },
    /// First, second, third residual byte of a large run length.
    Large1 { sym: u8 },
    Large2 { sym: u8 },
    Large3 { sym: u8 },
}

/// Lazily interned context → adaptive model map. One instance is shared by
/// every genotype part of an archive and rebuilt identically on decode.
#[derive(Default)]
pub struct ContextModels {
    models: FxHashMap<Context, AdaptiveModel>,
}

impl ContextModels {
    pub fn new() -> Self {
        Self::default()
    }

    fn model(&mut self, ctx: Context, n_symbols: usize, max_log: u32) -> &mut AdaptiveModel {
        self.models
            .entry(ctx)
            .or_insert_with(|| AdaptiveModel::new(n_symbols, max_log))
    }

    /// Encode one symbol under `ctx` and update the model.
    pub fn encode_symbol(
        &mut self,
        enc: &mut RangeEncoder,
        ctx: Context,
        symbol: usize,
        n_symbols: usize,
        max_log: u32,
    ) {
        let model = self.model(ctx, n_symbols, max_log);
        let (cum, freq, total) = model.encode_params(symbol);
        enc.encode(cum, freq, total);
        model.update(symbol);
    }

    /// Decode one symbol under `ctx`, updating the model identically to the
    /// encoder.
    pub fn decode_symbol(
        &mut self,
        dec: &mut RangeDecoder,
        ctx: Context,
        n_symbols: usize,
        max_log: u32,
    ) -> usize {
        let model = self.model(ctx, n_symbols, max_log);
        let sym = dec.decode(&model.cum_freqs, model.n_symbols, model.total);
        model.update(sym);
        sym
    }
}

// ============================================================================
// Run-length coding for genotype sites
// ============================================================================

/// Rolling history of the last two run symbols, shared across sites.
#[derive(Debug, Default, Clone, Copy)]
pub struct GtHistory {
    hist: u16,
}

impl GtHistory {
    #[inline]
    fn push(&mut self, sym: u8) {
        self.hist = (self.hist << 8) | sym as u16;
    }
}

/// Encode one `(symbol, run length)` pair. The symbol goes out under
/// `sym_ctx`; the length as a prefix code with up to three residual bytes
/// under the large-value bands. Boundary lengths always take the shortest
/// form, ties resolving to the lower band.
fn encode_run(
    models: &mut ContextModels,
    enc: &mut RangeEncoder,
    sym_ctx: Context,
    symbol: u8,
    len: u32,
    max_log: u32,
) {
    debug_assert!(len >= 1 && len <= MAX_RUN_LEN);
    models.encode_symbol(enc, sym_ctx, symbol as usize, 256, max_log);

    let pfx_ctx = Context::Prefix { sym: symbol };
    if len <= 15 {
        models.encode_symbol(enc, pfx_ctx, len as usize, PREFIX_ALPHABET, max_log);
    } else if len <= 0xFF {
        models.encode_symbol(enc, pfx_ctx, PREFIX_LARGE1, PREFIX_ALPHABET, max_log);
        models.encode_symbol(enc, Context::Large1 { sym: symbol }, len as usize, 256, max_log);
    } else if len <= 0xFFFF {
        models.encode_symbol(enc, pfx_ctx, PREFIX_LARGE2, PREFIX_ALPHABET, max_log);
        models.encode_symbol(
            enc,
            Context::Large1 { sym: symbol },
            (len & 0xFF) as usize,
            256,
            max_log,
        );
        models.encode_symbol(
            enc,
            Context::Large2 { sym: symbol },
            ((len >> 8) & 0xFF) as usize,
            256,
            max_log,
        );
    } else {
        models.encode_symbol(enc, pfx_ctx, PREFIX_LARGE3, PREFIX_ALPHABET, max_log);
        models.encode_symbol(
            enc,
            Context::Large1 { sym: symbol },
            (len & 0xFF) as usize,
            256,
            max_log,
        );
        models.encode_symbol(
            enc,
            Context::Large2 { sym: symbol },
            ((len >> 8) & 0xFF) as usize,
            256,
            max_log,
        );
        models.encode_symbol(
            enc,
            Context::Large3 { sym: symbol },
            ((len >> 16) & 0xFF) as usize,
            256,
            max_log,
        );
    }
}

fn decode_run(
    models: &mut ContextModels,
    dec: &mut RangeDecoder,
    sym_ctx: Context,
    max_log: u32,
) -> (u8, u32) {
    let symbol = models.decode_symbol(dec, sym_ctx, 256, max_log) as u8;

    let pfx_ctx = Context::Prefix { sym: symbol };
    let prefix = models.decode_symbol(dec, pfx_ctx, PREFIX_ALPHABET, max_log);
    let len = match prefix {
        0..=15 => prefix as u32,
        PREFIX_LARGE1 => models.decode_symbol(dec, Context::Large1 { sym: symbol }, 256, max_log) as u32,
        PREFIX_LARGE2 => {
            let b0 = models.decode_symbol(dec, Context::Large1 { sym: symbol }, 256, max_log) as u32;
            let b1 = models.decode_symbol(dec, Context::Large2 { sym: symbol }, 256, max_log) as u32;
            b0 | (b1 << 8)
        }
        _ => {
            let b0 = models.decode_symbol(dec, Context::Large1 { sym: symbol }, 256, max_log) as u32;
            let b1 = models.decode_symbol(dec, Context::Large2 { sym: symbol }, 256, max_log) as u32;
            let b2 = models.decode_symbol(dec, Context::Large3 { sym: symbol }, 256, max_log) as u32;
            b0 | (b1 << 8) | (b2 << 16)
        }
    };
    (symbol, len)
}

/// Run-length encode one permuted genotype site. The first run of a site is
/// conditioned as a boundary symbol; runs never cross site boundaries.
pub fn encode_gt_site(
    models: &mut ContextModels,
    enc: &mut RangeEncoder,
    history: &mut GtHistory,
    site: &[u8],
    max_log: u32,
) {
    let mut pos = 0usize;
    let mut first = true;
    while pos < site.len() {
        let symbol = site[pos];
        let mut run = 1usize;
        while pos + run < site.len() && site[pos + run] == symbol && (run as u32) < MAX_RUN_LEN {
            run += 1;
        }

        let sym_ctx = if first {
            Context::Suffix { hist: history.hist }
        } else {
            Context::Symbol { hist: history.hist }
        };
        encode_run(models, enc, sym_ctx, symbol, run as u32, max_log);
        history.push(symbol);

        pos += run;
        first = false;
    }
}

/// Decode one permuted genotype site of exactly `site_len` symbols.
pub fn decode_gt_site(
    models: &mut ContextModels,
    dec: &mut RangeDecoder,
    history: &mut GtHistory,
    site_len: usize,
    max_log: u32,
) -> Result<Vec<u8>> {
    let mut site = Vec::with_capacity(site_len);
    let mut first = true;
    while site.len() < site_len {
        let sym_ctx = if first {
            Context::Suffix { hist: history.hist }
        } else {
            Context::Symbol { hist: history.hist }
        };
        let (symbol, len) = decode_run(models, dec, sym_ctx, max_log);
        history.push(symbol);
        first = false;

        if len == 0 || site.len() + len as usize > site_len {
            return Err(Error::codec(format!(
                "genotype run of {len} overruns site of {site_len}"
            )));
        }
        site.resize(site.len() + len as usize, symbol);
    }
    Ok(site)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_coder_basic() {
        let mut enc = RangeEncoder::new();
        enc.encode(0, 1, 4);
        enc.encode(1, 1, 4);
        enc.encode(2, 1, 4);
        enc.encode(3, 1, 4);
        enc.encode(0, 1, 4);
        let compressed = enc.finish();

        let mut dec = RangeDecoder::new(&compressed);
        let cum = &[0u32, 1, 2, 3, 4];
        for expected in [0, 1, 2, 3, 0] {
            assert_eq!(dec.decode(cum, 4, 4), expected);
        }
    }

    #[test]
    fn test_range_coder_skewed() {
        let mut enc = RangeEncoder::new();
        let total = 100u32;
        let syms: Vec<usize> = (0..1000).map(|i| usize::from(i % 33 == 0)).collect();
        for &s in &syms {
            let (cum, freq) = if s == 0 { (0, 97) } else { (97, 3) };
            enc.encode(cum, freq, total);
        }
        let compressed = enc.finish();

        let mut dec = RangeDecoder::new(&compressed);
        let cum = &[0u32, 97, 100];
        for &expected in &syms {
            assert_eq!(dec.decode(cum, 2, total), expected);
        }
    }

    #[test]
    fn test_adaptive_models_stay_in_sync() {
        let symbols: Vec<usize> = (0..5000).map(|i| (i * 7 + 3) % 20).collect();
        let max_log = DEFAULT_MAX_LOG_COUNTER;
        let ctx = Context::Symbol { hist: 0 };

        let mut enc_models = ContextModels::new();
        let mut enc = RangeEncoder::new();
        for &s in &symbols {
            enc_models.encode_symbol(&mut enc, ctx, s, 20, max_log);
        }
        let compressed = enc.finish();

        let mut dec_models = ContextModels::new();
        let mut dec = RangeDecoder::new(&compressed);
        for &expected in &symbols {
            assert_eq!(dec_models.decode_symbol(&mut dec, ctx, 20, max_log), expected);
        }
    }

    #[test]
    fn test_rescale_keeps_decode_aligned() {
        // Force many rescales with a tiny counter bound.
        let max_log = 6;
        let ctx = Context::Prefix { sym: 1 };
        let symbols: Vec<usize> = (0..10_000).map(|i| (i % 3) * 2).collect();

        let mut enc_models = ContextModels::new();
        let mut enc = RangeEncoder::new();
        for &s in &symbols {
            enc_models.encode_symbol(&mut enc, ctx, s, 8, max_log);
        }
        let compressed = enc.finish();

        let mut dec_models = ContextModels::new();
        let mut dec = RangeDecoder::new(&compressed);
        for &expected in &symbols {
            assert_eq!(dec_models.decode_symbol(&mut dec, ctx, 8, max_log), expected);
        }
    }

    fn roundtrip_sites(sites: &[Vec<u8>]) {
        let max_log = DEFAULT_MAX_LOG_COUNTER;

        let mut enc_models = ContextModels::new();
        let mut enc_hist = GtHistory::default();
        let mut enc = RangeEncoder::new();
        for site in sites {
            encode_gt_site(&mut enc_models, &mut enc, &mut enc_hist, site, max_log);
        }
        let compressed = enc.finish();

        let mut dec_models = ContextModels::new();
        let mut dec_hist = GtHistory::default();
        let mut dec = RangeDecoder::new(&compressed);
        for site in sites {
            let got =
                decode_gt_site(&mut dec_models, &mut dec, &mut dec_hist, site.len(), max_log)
                    .unwrap();
            assert_eq!(&got, site);
        }
    }

    #[test]
    fn test_run_len_roundtrip_small_runs() {
        roundtrip_sites(&[
            vec![0, 0, 1, 1, 1, 0, 2, 2],
            vec![1, 1, 1, 1, 0, 0, 0, 0],
            vec![3, 0, 0, 0, 0, 0, 0, 3],
        ]);
    }

    #[test]
    fn test_run_len_roundtrip_boundary_lengths() {
        // Lengths straddling the literal/1-byte/2-byte prefix boundaries.
        for len in [1usize, 15, 16, 255, 256, 65535, 65536, 70000] {
            roundtrip_sites(&[vec![0u8; len], vec![1u8; len]]);
        }
    }

    #[test]
    fn test_run_len_all_reference_compresses_hard() {
        let sites: Vec<Vec<u8>> = (0..1000).map(|_| vec![0u8; 8]).collect();
        let mut models = ContextModels::new();
        let mut hist = GtHistory::default();
        let mut enc = RangeEncoder::new();
        for site in &sites {
            encode_gt_site(&mut models, &mut enc, &mut hist, site, DEFAULT_MAX_LOG_COUNTER);
        }
        let compressed = enc.finish();
        // 8000 raw symbols of pure runs collapse to model warm-up cost only.
        assert!(compressed.len() < 200, "compressed to {}", compressed.len());
    }
}

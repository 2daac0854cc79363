//! Uniform adapter over the block entropy coder.
//!
//! Every non-genotype substream passes through `encode_block`/`decode_block`
//! with a named per-stream preset. Calls are stateless and thread-safe, so
//! workers can compress blocks of different streams concurrently.

use crate::error::{Error, Result};

/// Per-stream entropy coder configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntropyParams {
    /// Backend compression level.
    pub level: i32,
}

// Named presets, one per substream family.
pub const P_SIZE: EntropyParams = EntropyParams { level: 19 };
pub const P_DATA: EntropyParams = EntropyParams { level: 19 };
pub const P_FLAG: EntropyParams = EntropyParams { level: 15 };
pub const P_TEXT: EntropyParams = EntropyParams { level: 19 };
pub const P_INT: EntropyParams = EntropyParams { level: 19 };
pub const P_REAL: EntropyParams = EntropyParams { level: 19 };

pub const P_DB_CHROM: EntropyParams = EntropyParams { level: 19 };
pub const P_DB_POS: EntropyParams = EntropyParams { level: 19 };
pub const P_DB_ID: EntropyParams = EntropyParams { level: 19 };
pub const P_DB_REF: EntropyParams = EntropyParams { level: 19 };
pub const P_DB_ALT: EntropyParams = EntropyParams { level: 19 };
pub const P_DB_QUAL: EntropyParams = EntropyParams { level: 19 };

pub const P_META: EntropyParams = EntropyParams { level: 19 };

/// Compress one block. Empty input yields empty output.
pub fn encode_block(data: &[u8], params: EntropyParams) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    zstd::bulk::compress(data, params.level)
        .map_err(|e| Error::codec(format!("entropy coder rejected block: {e}")))
}

/// Decompress one block produced by [`encode_block`]. `raw_size` is the
/// exact uncompressed length recorded in the part header.
pub fn decode_block(data: &[u8], _params: EntropyParams, raw_size: usize) -> Result<Vec<u8>> {
    if raw_size == 0 {
        if !data.is_empty() {
            return Err(Error::codec("non-empty block with zero raw size"));
        }
        return Ok(Vec::new());
    }
    let out = zstd::bulk::decompress(data, raw_size)
        .map_err(|e| Error::codec(format!("entropy coder failed to decode block: {e}")))?;
    if out.len() != raw_size {
        return Err(Error::codec(format!(
            "decoded block length {} does not match recorded raw size {}",
            out.len(),
            raw_size
        )));
    }
    Ok(out)
}

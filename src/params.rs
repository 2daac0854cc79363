//! Archive parameters and their on-disk blob.
//!
//! The parameter blob is exactly 5 bytes: the magic `G T S 1` followed by the
//! neglect limit. Everything else the decoder needs travels in the archive's
//! `descriptions` stream.

use crate::error::{Error, Result};

/// Default number of coder worker threads.
pub const DEFAULT_NO_THREADS: u32 = 8;

/// Default PBWT neglect limit (rare-allele pruning threshold).
pub const DEFAULT_NEGLECT_LIMIT: u32 = 10;

/// Magic prefix of the parameter blob and of the archive footer.
pub const PARAMS_MAGIC: [u8; 4] = *b"GTS1";

/// Tunable engine parameters, fixed before the first variant is staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Params {
    /// Number of worker threads consuming the package queue.
    pub no_threads: u32,
    /// PBWT rare-allele pruning threshold. Larger values keep more branches
    /// in the prefix array (more memory, better compression).
    pub neglect_limit: u32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            no_threads: DEFAULT_NO_THREADS,
            neglect_limit: DEFAULT_NEGLECT_LIMIT,
        }
    }
}

impl Params {
    /// Serialize the 5-byte parameter blob.
    pub fn store_params(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(5);
        v.extend_from_slice(&PARAMS_MAGIC);
        v.push(self.neglect_limit.min(255) as u8);
        v
    }

    /// Parse a parameter blob, validating magic and length.
    pub fn load_params(&mut self, blob: &[u8]) -> Result<()> {
        if blob.len() != 5 {
            return Err(Error::format(format!(
                "parameter blob has {} bytes, expected 5",
                blob.len()
            )));
        }
        if blob[..4] != PARAMS_MAGIC {
            return Err(Error::format("parameter blob magic mismatch"));
        }
        self.neglect_limit = blob[4] as u32;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_roundtrip() {
        let p = Params {
            no_threads: 4,
            neglect_limit: 25,
        };
        let blob = p.store_params();
        assert_eq!(blob.len(), 5);

        let mut q = Params::default();
        q.load_params(&blob).unwrap();
        assert_eq!(q.neglect_limit, 25);
    }

    #[test]
    fn test_params_bad_magic() {
        let mut p = Params::default();
        assert!(p.load_params(b"XTS1\x0a").is_err());
        assert!(p.load_params(b"GTS1").is_err());
    }

    #[test]
    fn test_default_thread_count() {
        assert_eq!(Params::default().no_threads, 8);
        assert_eq!(Params::default().neglect_limit, 10);
    }
}

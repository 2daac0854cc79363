//! Positional Burrows–Wheeler transform for genotype haplotype columns.
//!
//! Each variant site contributes one vector of allele codes, one per
//! haplotype (`no_samples × ploidy`). The transform permutes every site by a
//! running prefix array so that haplotypes sharing recent history become
//! adjacent, turning the site vectors into long runs for the range coder.
//! The prefix array is updated per site by a stable counting sort on the
//! emitted allele codes, so the decoder replays the identical update from
//! the decoded site and both states stay in lockstep.

use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct Pbwt {
    perm: Vec<u32>,
    scratch: Vec<u32>,
    neglect_limit: u32,
    initialised: bool,
}

impl Pbwt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the prefix array to identity for `no_samples × ploidy`
    /// haplotypes. `neglect_limit` prunes rare-allele branches: codes seen
    /// fewer times in a site do not form their own sort bucket.
    pub fn init(&mut self, ploidy: u32, no_samples: u32, neglect_limit: u32) {
        let n = (ploidy as usize) * (no_samples as usize);
        self.perm = (0..n as u32).collect();
        self.scratch = vec![0; n];
        self.neglect_limit = neglect_limit;
        self.initialised = true;
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised
    }

    pub fn no_haplotypes(&self) -> usize {
        self.perm.len()
    }

    /// Permute one site vector into PBWT order and advance the prefix array.
    pub fn encode(&mut self, site: &[u8]) -> Result<Vec<u8>> {
        self.check_len(site.len())?;
        let permuted: Vec<u8> = self.perm.iter().map(|&k| site[k as usize]).collect();
        self.update(&permuted);
        Ok(permuted)
    }

    /// Invert one permuted site vector and advance the prefix array exactly
    /// as the encoder did.
    pub fn decode(&mut self, permuted: &[u8]) -> Result<Vec<u8>> {
        self.check_len(permuted.len())?;
        let mut site = vec![0u8; permuted.len()];
        for (v, &k) in permuted.iter().zip(self.perm.iter()) {
            site[k as usize] = *v;
        }
        self.update(permuted);
        Ok(site)
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if !self.initialised {
            return Err(Error::state("PBWT used before init"));
        }
        if len != self.perm.len() {
            return Err(Error::codec(format!(
                "PBWT site has {len} haplotypes, expected {}",
                self.perm.len()
            )));
        }
        Ok(())
    }

    /// Stable counting-sort update of the prefix array. Codes below the
    /// neglect limit collapse into bucket 0 so rare alleles do not fragment
    /// the established haplotype ordering.
    fn update(&mut self, permuted: &[u8]) {
        let mut counts = [0u32; 256];
        for &s in permuted {
            counts[s as usize] += 1;
        }

        let neglect_limit = self.neglect_limit;
        let effective = move |s: u8| -> usize {
            if s != 0 && counts[s as usize] < neglect_limit {
                0
            } else {
                s as usize
            }
        };

        let mut offsets = [0u32; 256];
        for &s in permuted {
            offsets[effective(s)] += 1;
        }
        let mut acc = 0u32;
        for o in offsets.iter_mut() {
            let c = *o;
            *o = acc;
            acc += c;
        }

        for (k, &s) in permuted.iter().enumerate() {
            let b = effective(s);
            self.scratch[offsets[b] as usize] = self.perm[k];
            offsets[b] += 1;
        }
        std::mem::swap(&mut self.perm, &mut self.scratch);
    }
}

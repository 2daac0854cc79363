//! Dictionary + tokenization preprocessor for text substreams.
//!
//! Identifier-like substreams (chromosome names, variant ids, alleles,
//! string-typed fields) repeat a small vocabulary of tokens. The
//! preprocessor learns that vocabulary once per stream, from the stream's
//! first part, and rewrites later occurrences as compact back-references the
//! entropy coder models well. The learned dictionary is serialized into the
//! first part, so the decoder rebuilds it without side channels.
//!
//! Wire format per part: `[varint n_new_entries][entry: varint len, bytes]*`
//! followed by the body, where `0x01 + varint id` is a dictionary reference
//! and `0x02` escapes a literal `0x01`/`0x02` byte.

use rustc_hash::FxHashMap;

use super::{read_varint, write_varint};
use crate::error::{Error, Result};

const TOKEN_REF: u8 = 0x01;
const ESCAPE: u8 = 0x02;

const MIN_TOKEN_LEN: usize = 4;
const MIN_TOKEN_COUNT: usize = 4;
const MAX_DICT_ENTRIES: usize = 1 << 16;

#[inline]
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.'
}

/// Per-stream text preprocessor state. One instance lives for the whole
/// archive lifetime of its stream; parts must pass through in part order.
#[derive(Debug, Default)]
pub struct TextPreprocessing {
    tokens: Vec<Vec<u8>>,
    index: FxHashMap<Vec<u8>, u32>,
    trained: bool,
}

impl TextPreprocessing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite `data` with dictionary back-references. The first call per
    /// stream learns the dictionary and emits it ahead of the body.
    pub fn preprocess(&mut self, data: &[u8]) -> Vec<u8> {
        let new_entries = if self.trained {
            Vec::new()
        } else {
            self.trained = true;
            self.train(data)
        };

        let mut out = Vec::with_capacity(data.len() / 2 + 16);
        write_varint(&mut out, new_entries.len() as u64);
        for tok in &new_entries {
            write_varint(&mut out, tok.len() as u64);
            out.extend_from_slice(tok);
        }

        self.emit_body(data, &mut out);
        out
    }

    /// Invert [`preprocess`]. Dictionary entries carried by the part are
    /// absorbed before the body is decoded.
    pub fn postprocess(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut pos = 0usize;
        let n_new = read_varint(data, &mut pos)
            .ok_or_else(|| Error::codec("text part truncated in dictionary header"))?
            as usize;
        for _ in 0..n_new {
            let len = read_varint(data, &mut pos)
                .ok_or_else(|| Error::codec("text part truncated in dictionary entry"))?
                as usize;
            let tok = data
                .get(pos..pos + len)
                .ok_or_else(|| Error::codec("text part dictionary entry overruns part"))?
                .to_vec();
            pos += len;
            self.tokens.push(tok);
        }

        let mut out = Vec::with_capacity(data.len() * 2);
        while pos < data.len() {
            match data[pos] {
                TOKEN_REF => {
                    pos += 1;
                    let id = read_varint(data, &mut pos)
                        .ok_or_else(|| Error::codec("text part truncated in token reference"))?
                        as usize;
                    let tok = self
                        .tokens
                        .get(id)
                        .ok_or_else(|| Error::codec(format!("unknown text token id {id}")))?;
                    out.extend_from_slice(tok);
                }
                ESCAPE => {
                    pos += 1;
                    let b = *data
                        .get(pos)
                        .ok_or_else(|| Error::codec("text part ends inside escape"))?;
                    pos += 1;
                    out.push(b);
                }
                b => {
                    out.push(b);
                    pos += 1;
                }
            }
        }
        Ok(out)
    }

    /// Count token frequencies in the first part and keep the frequent ones.
    fn train(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut counts: FxHashMap<&[u8], usize> = FxHashMap::default();
        for tok in Tokens::new(data) {
            if tok.len() >= MIN_TOKEN_LEN {
                *counts.entry(tok).or_insert(0) += 1;
            }
        }

        let mut candidates: Vec<(&[u8], usize)> = counts
            .into_iter()
            .filter(|&(_, c)| c >= MIN_TOKEN_COUNT)
            .collect();
        // Most frequent tokens get the shortest reference ids; the token
        // bytes break count ties so the dictionary is deterministic.
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        candidates.truncate(MAX_DICT_ENTRIES);

        let mut new_entries = Vec::with_capacity(candidates.len());
        for (tok, _) in candidates {
            let id = self.tokens.len() as u32;
            self.tokens.push(tok.to_vec());
            self.index.insert(tok.to_vec(), id);
            new_entries.push(tok.to_vec());
        }
        new_entries
    }

    fn emit_body(&self, data: &[u8], out: &mut Vec<u8>) {
        let mut pos = 0usize;
        while pos < data.len() {
            let b = data[pos];
            if is_token_byte(b) {
                let mut end = pos + 1;
                while end < data.len() && is_token_byte(data[end]) {
                    end += 1;
                }
                let tok = &data[pos..end];
                if let Some(&id) = self.index.get(tok) {
                    out.push(TOKEN_REF);
                    write_varint(out, id as u64);
                } else {
                    // Token bytes are never 0x01/0x02, no escaping needed.
                    out.extend_from_slice(tok);
                }
                pos = end;
            } else {
                if b == TOKEN_REF || b == ESCAPE {
                    out.push(ESCAPE);
                }
                out.push(b);
                pos += 1;
            }
        }
    }
}

/// Iterator over maximal token-byte runs of a buffer.
struct Tokens<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Tokens<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for Tokens<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        while self.pos < self.data.len() && !is_token_byte(self.data[self.pos]) {
            self.pos += 1;
        }
        if self.pos >= self.data.len() {
            return None;
        }
        let start = self.pos;
        while self.pos < self.data.len() && is_token_byte(self.data[self.pos]) {
            self.pos += 1;
        }
        Some(&self.data[start..self.pos])
    }
}

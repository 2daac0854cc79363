//! Archive container: a named, part-indexed blob store on disk.
//!
//! The file is a plain concatenation of parts in the order workers finish
//! them, followed by a directory mapping stream names to their part
//! `(offset, length)` vectors. The footer is the 8-byte little-endian
//! directory offset plus the magic `GTS1`, so the directory is located from
//! the end of the file on open.
//!
//! Appends for different streams may interleave freely; the container only
//! guarantees that parts of one stream keep the order in which `append_part`
//! was called. All mutation goes through one internal lock, so a shared
//! `Archive` is safe to hand to the worker pool.

use rustc_hash::FxHashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use crate::compression::{read_le_u32, read_le_u64, read_varint, write_varint};
use crate::error::{Error, Result};
use crate::params::PARAMS_MAGIC;

const FOOTER_SIZE: u64 = 12;

#[derive(Debug, Clone, Copy)]
struct PartEntry {
    offset: u64,
    len: u64,
}

#[derive(Debug)]
struct StreamEntry {
    name: String,
    parts: Vec<PartEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Writing,
    Reading,
}

struct Inner {
    file: File,
    mode: Mode,
    streams: Vec<StreamEntry>,
    ids: FxHashMap<String, u32>,
    cursor: u64,
    finalized: bool,
}

pub struct Archive {
    inner: Mutex<Inner>,
}

impl Archive {
    /// Create a fresh archive. Fails if the path already exists. The file
    /// is opened read-write so parts can be copied between streams.
    pub fn create(path: &Path) -> Result<Self> {
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), "created archive");
        Ok(Self {
            inner: Mutex::new(Inner {
                file,
                mode: Mode::Writing,
                streams: Vec::new(),
                ids: FxHashMap::default(),
                cursor: 0,
                finalized: false,
            }),
        })
    }

    /// Open an existing archive, validating the footer magic and directory.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < FOOTER_SIZE {
            return Err(Error::format("archive shorter than its footer"));
        }

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact(&mut footer)?;
        if footer[8..12] != PARAMS_MAGIC {
            return Err(Error::format("archive magic mismatch"));
        }
        let dir_offset = read_le_u64(&footer, 0)?;
        if dir_offset >= file_len - FOOTER_SIZE {
            return Err(Error::format("archive directory offset out of bounds"));
        }

        file.seek(SeekFrom::Start(dir_offset))?;
        let mut dir = vec![0u8; (file_len - FOOTER_SIZE - dir_offset) as usize];
        file.read_exact(&mut dir)?;

        let (streams, ids) = parse_directory(&dir, dir_offset)?;
        debug!(
            path = %path.display(),
            streams = streams.len(),
            "opened archive"
        );
        Ok(Self {
            inner: Mutex::new(Inner {
                file,
                mode: Mode::Reading,
                streams,
                ids,
                cursor: 0,
                finalized: false,
            }),
        })
    }

    /// Register a stream name, returning its stable id. Registering the same
    /// name twice returns the original id.
    pub fn register_stream(&self, name: &str) -> Result<u32> {
        let mut inner = self.inner.lock().unwrap();
        if inner.mode != Mode::Writing {
            return Err(Error::state("register_stream on a read-mode archive"));
        }
        if let Some(&id) = inner.ids.get(name) {
            return Ok(id);
        }
        let id = inner.streams.len() as u32;
        inner.streams.push(StreamEntry {
            name: name.to_string(),
            parts: Vec::new(),
        });
        inner.ids.insert(name.to_string(), id);
        Ok(id)
    }

    /// Look up a stream id by name.
    pub fn stream_id(&self, name: &str) -> Option<u32> {
        self.inner.lock().unwrap().ids.get(name).copied()
    }

    pub fn n_parts(&self, id: u32) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .streams
            .get(id as usize)
            .map(|s| s.parts.len())
            .unwrap_or(0)
    }

    /// Append one part to a stream. Parts of one stream are stored in call
    /// order; appends across streams serialize on the internal lock.
    pub fn append_part(&self, id: u32, data: &[u8]) -> Result<u32> {
        let mut inner = self.inner.lock().unwrap();
        if inner.mode != Mode::Writing || inner.finalized {
            return Err(Error::state("append_part on a closed or read-mode archive"));
        }
        if id as usize >= inner.streams.len() {
            return Err(Error::format(format!("unknown stream id {id}")));
        }

        let offset = inner.cursor;
        inner.file.write_all(data)?;
        inner.cursor += data.len() as u64;
        let entry = &mut inner.streams[id as usize];
        entry.parts.push(PartEntry {
            offset,
            len: data.len() as u64,
        });
        Ok(entry.parts.len() as u32 - 1)
    }

    /// Copy an already-written part onto the tail of another stream without
    /// re-encoding it. The copied blob becomes the destination stream's next
    /// part, exactly as if it had been appended.
    pub fn copy_part(&self, src_id: u32, part_idx: u32, dst_id: u32) -> Result<u32> {
        let mut inner = self.inner.lock().unwrap();
        if inner.mode != Mode::Writing || inner.finalized {
            return Err(Error::state("copy_part on a closed or read-mode archive"));
        }
        let src = inner
            .streams
            .get(src_id as usize)
            .ok_or_else(|| Error::format(format!("unknown stream id {src_id}")))?;
        let part = *src.parts.get(part_idx as usize).ok_or_else(|| {
            Error::format(format!("stream {src_id} has no part {part_idx}"))
        })?;
        if dst_id as usize >= inner.streams.len() {
            return Err(Error::format(format!("unknown stream id {dst_id}")));
        }

        inner.file.seek(SeekFrom::Start(part.offset))?;
        let mut buf = vec![0u8; part.len as usize];
        inner.file.read_exact(&mut buf)?;
        let cursor = inner.cursor;
        inner.file.seek(SeekFrom::Start(cursor))?;
        inner.file.write_all(&buf)?;

        let offset = inner.cursor;
        inner.cursor += part.len;
        let entry = &mut inner.streams[dst_id as usize];
        entry.parts.push(PartEntry {
            offset,
            len: part.len,
        });
        Ok(entry.parts.len() as u32 - 1)
    }

    /// Read one `(stream, part)` blob.
    pub fn read_part(&self, id: u32, part_idx: u32) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.mode != Mode::Reading {
            return Err(Error::state("read_part on a write-mode archive"));
        }
        let entry = inner
            .streams
            .get(id as usize)
            .ok_or_else(|| Error::format(format!("unknown stream id {id}")))?;
        let part = *entry.parts.get(part_idx as usize).ok_or_else(|| {
            Error::format(format!(
                "stream {} has no part {part_idx}",
                entry.name
            ))
        })?;

        inner.file.seek(SeekFrom::Start(part.offset))?;
        let mut buf = vec![0u8; part.len as usize];
        inner.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read a single-part stream by name; `None` if the name is unknown or
    /// the stream holds no parts.
    pub fn read_stream(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let id = match self.stream_id(name) {
            Some(id) => id,
            None => return Ok(None),
        };
        if self.n_parts(id) == 0 {
            return Ok(None);
        }
        self.read_part(id, 0).map(Some)
    }

    /// Per-stream `(name, parts, bytes)` statistics for close-time logging.
    pub fn stream_stats(&self) -> Vec<(String, usize, u64)> {
        let inner = self.inner.lock().unwrap();
        inner
            .streams
            .iter()
            .map(|s| {
                (
                    s.name.clone(),
                    s.parts.len(),
                    s.parts.iter().map(|p| p.len).sum(),
                )
            })
            .collect()
    }

    /// Write the directory and footer and flush. The archive accepts no
    /// appends afterwards.
    pub fn finalize(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.mode != Mode::Writing {
            return Err(Error::state("finalize on a read-mode archive"));
        }
        if inner.finalized {
            return Err(Error::state("archive already finalized"));
        }

        let dir_offset = inner.cursor;
        let mut dir = Vec::new();
        write_varint(&mut dir, inner.streams.len() as u64);
        for (id, s) in inner.streams.iter().enumerate() {
            write_varint(&mut dir, s.name.len() as u64);
            dir.extend_from_slice(s.name.as_bytes());
            dir.extend_from_slice(&(id as u32).to_le_bytes());
            dir.extend_from_slice(&(s.parts.len() as u32).to_le_bytes());
            for p in &s.parts {
                dir.extend_from_slice(&p.offset.to_le_bytes());
                dir.extend_from_slice(&p.len.to_le_bytes());
            }
        }
        inner.file.write_all(&dir)?;
        inner.file.write_all(&dir_offset.to_le_bytes())?;
        inner.file.write_all(&PARAMS_MAGIC)?;
        inner.file.flush()?;
        inner.finalized = true;
        debug!(streams = inner.streams.len(), "finalized archive");
        Ok(())
    }
}

fn parse_directory(
    dir: &[u8],
    dir_offset: u64,
) -> Result<(Vec<StreamEntry>, FxHashMap<String, u32>)> {
    let mut pos = 0usize;
    let n_streams = read_varint(dir, &mut pos)
        .ok_or_else(|| Error::format("truncated archive directory"))? as usize;

    let mut streams = Vec::with_capacity(n_streams);
    let mut ids = FxHashMap::default();

    for expected_id in 0..n_streams {
        let name_len = read_varint(dir, &mut pos)
            .ok_or_else(|| Error::format("truncated stream name length"))?
            as usize;
        let name_bytes = dir
            .get(pos..pos + name_len)
            .ok_or_else(|| Error::format("truncated stream name"))?;
        pos += name_len;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| Error::format("stream name is not valid UTF-8"))?
            .to_string();

        let id = read_le_u32(dir, pos)?;
        pos += 4;
        if id as usize != expected_id {
            return Err(Error::format(format!(
                "directory stream id {id} out of order"
            )));
        }

        let n_parts = read_le_u32(dir, pos)? as usize;
        pos += 4;
        let mut parts = Vec::with_capacity(n_parts);
        for _ in 0..n_parts {
            let offset = read_le_u64(dir, pos)?;
            pos += 8;
            let len = read_le_u64(dir, pos)?;
            pos += 8;
            if offset + len > dir_offset {
                return Err(Error::format(format!(
                    "part of stream {name} overruns the directory"
                )));
            }
            parts.push(PartEntry { offset, len });
        }

        ids.insert(name.clone(), id as u32);
        streams.push(StreamEntry { name, parts });
    }

    Ok((streams, ids))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_roundtrip_two_streams() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.gts");

        let ar = Archive::create(&path).unwrap();
        let s0 = ar.register_stream("alpha").unwrap();
        let s1 = ar.register_stream("beta").unwrap();
        ar.append_part(s0, b"one").unwrap();
        ar.append_part(s1, b"two-part").unwrap();
        ar.append_part(s0, b"three").unwrap();
        ar.finalize().unwrap();

        let rd = Archive::open(&path).unwrap();
        let a = rd.stream_id("alpha").unwrap();
        let b = rd.stream_id("beta").unwrap();
        assert_eq!(rd.n_parts(a), 2);
        assert_eq!(rd.n_parts(b), 1);
        assert_eq!(rd.read_part(a, 0).unwrap(), b"one");
        assert_eq!(rd.read_part(a, 1).unwrap(), b"three");
        assert_eq!(rd.read_part(b, 0).unwrap(), b"two-part");
        assert!(rd.stream_id("gamma").is_none());
    }

    #[test]
    fn test_create_refuses_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.gts");
        std::fs::write(&path, b"occupied").unwrap();
        assert!(matches!(
            Archive::create(&path),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_truncated_archive_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.gts");

        let ar = Archive::create(&path).unwrap();
        let s0 = ar.register_stream("alpha").unwrap();
        ar.append_part(s0, b"payload-payload-payload").unwrap();
        ar.finalize().unwrap();

        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 16]).unwrap();
        assert!(matches!(Archive::open(&path), Err(Error::Format(_))));
    }

    #[test]
    fn test_register_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.gts");
        let ar = Archive::create(&path).unwrap();
        let id0 = ar.register_stream("x").unwrap();
        let id1 = ar.register_stream("x").unwrap();
        assert_eq!(id0, id1);
    }

    #[test]
    fn test_part_offsets_strictly_increase() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.gts");
        let ar = Archive::create(&path).unwrap();
        let s = ar.register_stream("s").unwrap();
        for i in 0..10u8 {
            ar.append_part(s, &vec![i; (i as usize + 1) * 3]).unwrap();
        }
        ar.finalize().unwrap();

        let rd = Archive::open(&path).unwrap();
        let inner = rd.inner.lock().unwrap();
        let parts = &inner.streams[0].parts;
        for w in parts.windows(2) {
            assert!(w[1].offset > w[0].offset);
        }
    }

    #[test]
    fn test_copy_part_between_streams() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.gts");

        let ar = Archive::create(&path).unwrap();
        let s0 = ar.register_stream("src").unwrap();
        let s1 = ar.register_stream("dst").unwrap();
        ar.append_part(s0, b"first-part").unwrap();
        ar.append_part(s0, b"second").unwrap();
        ar.append_part(s1, b"own").unwrap();
        assert_eq!(ar.copy_part(s0, 1, s1).unwrap(), 1);
        ar.append_part(s1, b"tail").unwrap();
        assert!(ar.copy_part(s0, 7, s1).is_err());
        ar.finalize().unwrap();

        let rd = Archive::open(&path).unwrap();
        let dst = rd.stream_id("dst").unwrap();
        assert_eq!(rd.n_parts(dst), 3);
        assert_eq!(rd.read_part(dst, 0).unwrap(), b"own");
        assert_eq!(rd.read_part(dst, 1).unwrap(), b"second");
        assert_eq!(rd.read_part(dst, 2).unwrap(), b"tail");
        // The source stream is untouched.
        let src = rd.stream_id("src").unwrap();
        assert_eq!(rd.read_part(src, 1).unwrap(), b"second");
    }

    #[test]
    fn test_unknown_part_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.gts");
        let ar = Archive::create(&path).unwrap();
        let s = ar.register_stream("s").unwrap();
        ar.append_part(s, b"x").unwrap();
        ar.finalize().unwrap();

        let rd = Archive::open(&path).unwrap();
        assert!(rd.read_part(0, 1).is_err());
        assert!(rd.read_part(5, 0).is_err());
    }
}

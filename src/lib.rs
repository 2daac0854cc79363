//! GTS: a multi-stream compression engine for genomic variant archives.
//!
//! The engine decomposes a stream of variant records into many logical
//! substreams (one size and one data stream per INFO/FORMAT key, six fixed
//! database streams), discovers functional redundancy between substreams so
//! duplicates are stored once, and routes every substream through the codec
//! best suited to it: a dictionary text preprocessor plus block entropy
//! coding for identifier-like data, delta plus entropy coding for positions,
//! and a PBWT transform feeding a context-adaptive range coder for
//! genotypes.
//!
//! [`CompressedFile`] is the public entry point:
//!
//! ```no_run
//! use gts::{CompressedFile, FieldValue, KeyDesc, KeyKind, ValueType, VariantDesc};
//!
//! # fn main() -> gts::Result<()> {
//! let mut cf = CompressedFile::new();
//! cf.open_for_writing("cohort.gts", 1)?;
//! cf.set_keys(vec![KeyDesc {
//!     key_id: 0,
//!     kind: KeyKind::Info,
//!     value_type: ValueType::Int,
//!     arity: 1,
//! }])?;
//!
//! let desc = VariantDesc {
//!     chrom: "1".into(),
//!     pos: 100,
//!     id: "rs1".into(),
//!     ref_allele: "A".into(),
//!     alt: "T".into(),
//!     qual: "30".into(),
//! };
//! cf.set_variant(&desc, vec![FieldValue::new(42i32.to_le_bytes().to_vec())])?;
//! cf.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! The VCF/BCF parser and emitter, and any command-line front-end, are
//! external collaborators; this crate is the engine they drive.

pub mod archive;
pub mod buffer;
pub mod cfile;
pub mod compression;
pub mod error;
pub mod params;
pub mod queue;
pub mod record;

pub use cfile::CompressedFile;
pub use compression::graph::{DataEdge, DataFunction, DataGraph, SizeGraph};
pub use error::{Error, Result};
pub use params::Params;
pub use record::{FieldValue, KeyDesc, KeyKind, ValueType, VariantDesc};

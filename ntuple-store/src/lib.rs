//! A chunked, extensible, self-describing container.
//!
//! A [`Container`] is a single file holding a tree of [`Group`]s whose leaves are
//! [`Dataset`]s: typed, row-oriented arrays whose leading dimension grows without bound.
//! Datasets are stored in fixed-size chunks of rows, each passed through an optional
//! [`Filter`] pipeline.
//!
//! # File format
//!
//! ```text
//! ┌────────────────────────────┐
//! │       chunk blobs          │  appended as rows are written
//! ├────────────────────────────┤
//! │       footer (JSON)        │  the group tree and every dataset's chunk index
//! ├────────────────────────────┤
//! │  end of file (16 bytes):   │
//! │  footer offset (u64 LE),   │
//! │  version (u16 LE),         │
//! │  reserved (u16),           │
//! │  magic "NTPL"              │
//! └────────────────────────────┘
//! ```
//!
//! Rewriting a chunk or the footer appends a new copy; readers always start from the
//! end-of-file marker at the very end of the file.

pub mod comm;

mod attribute;
mod chunk;
mod container;
mod dataset;
mod dtype;
mod filter;
mod footer;
mod group;
mod resource;
mod values;

pub use attribute::*;
pub use container::*;
pub use dataset::*;
pub use dtype::*;
pub use filter::*;
pub use footer::{EOF_SIZE, MAGIC_BYTES, VERSION};
pub use group::*;
pub use resource::*;
pub use values::*;

/// The maximum number of dimensions of a dataset, the row dimension included.
pub const MAX_RANK: usize = 32;

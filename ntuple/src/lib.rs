//! Buffered, typed, columnar tables on top of [`ntuple_store`] containers.
//!
//! An [`Ntuple`] is a group holding one dataset per column. Rows are inserted one at a time
//! into per-column buffers and appended to the datasets whenever the buffers fill up, on
//! [`Ntuple::flush`], and on drop.
//!
//! ```
//! use ntuple::{ColumnDescriptor, Ntuple, row};
//! use ntuple_store::{Container, CreateMode, ElementType};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let container = Container::create(dir.path().join("hits.ntpl"), CreateMode::Exclusive).unwrap();
//! let hits = Ntuple::builder("hits")
//!     .column(ColumnDescriptor::scalar("energy", ElementType::F64).unwrap())
//!     .column(ColumnDescriptor::new("position", ElementType::F32, &[3]).unwrap())
//!     .build(container.clone())
//!     .unwrap();
//! hits.insert(&row![12.5f64, [0.0f32, 1.0, 2.0]]).unwrap();
//! hits.flush().unwrap();
//! assert_eq!(hits.rows_written(), 1);
//! ```
//!
//! Files written by many workers in parallel are combined with a [`Concatenator`], see
//! [`concat`].

pub mod concat;
pub mod numerology;

mod cell;
mod column;
mod ntuple;

pub use cell::*;
pub use column::*;
pub use concat::{ConcatFailure, ConcatOptions, ConcatSummary, Concatenator, DEFAULT_MEMORY_BYTES};
pub use ntuple::*;
pub use ntuple_error::{ErrorMode, NtupleError, NtupleResult};

//! Build-once, read-many key to multi-value maps persisted to constmap files.
//!
//! The `constmap` crate writes a dataset once into a single immutable file
//! and answers lookups against it with positioned reads, so readers never
//! load the dataset into memory. Keys and values are arbitrary byte strings;
//! a key may be stored several times and every value is kept, in insertion
//! order.
//!
//! A file is a fixed 256-bucket header, the records in insertion order, and
//! one open-addressing slot table per bucket. See [`layout`] for the exact
//! byte layout.
//!
//! ```
//! use constmap::{ConstMap, ConstMapBuilder};
//!
//! # fn main() -> constmap::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let path = dir.path().join("aliases.cmap");
//!
//! let mut builder = ConstMapBuilder::new();
//! builder.put("postmaster", "root")?;
//! builder.put("abuse", "root")?;
//! builder.put("abuse", "security")?;
//! builder.finalize_to_path(&path)?;
//!
//! let map = ConstMap::open_path(&path)?;
//! assert_eq!(map.get("abuse")?, vec![b"root".to_vec(), b"security".to_vec()]);
//! assert!(map.get("webmaster")?.is_empty());
//! # Ok(())
//! # }
//! ```

mod error;
pub use error::{ConstMapError, Result};

mod hasher;
pub use hasher::{ConstMapHasher, HASH_SEED, bucket_index, hash, slot_index};

pub mod layout;
pub use layout::{ConstMapBucket, ConstMapHeader, ConstMapInfo, ConstMapSlot, RecordHeader};

mod reader;
pub use reader::ConstMapReader;

mod writer;
pub use writer::ConstMapWriter;

mod constmap;
pub use constmap::{ConstMap, ConstMapIter};

mod builder;
pub use builder::ConstMapBuilder;

//! A small inode filesystem on top of a 64 MiB block store.
//!
//! Disk layout, in 1 KiB blocks:
//!
//! ```text
//! [0, 8)       free-block bitmap, one bit per block
//! [8, 40)      inode table, 256 inodes of 128 bytes
//! [40, 65536)  directory, indirection and file data blocks
//! ```
//!
//! Block 0 never holds data, so a zero block pointer means "no block".
//! Inode 0 is the root directory.

mod back_store;
mod bitmap;
mod block_cache;
mod block_dev;
mod block_map;
mod config;
mod directory;
mod error;
mod fd_table;
mod fs;
mod inode_table;
mod layout;
mod path;

pub use back_store::BackStore;
pub use bitmap::Bitmap;
pub use block_cache::BlockCache;
pub use block_dev::{BlockDevice, FileDevice, MemDevice};
pub use config::*;
pub use error::{FsError, Result};
pub use fd_table::Fd;
pub use fs::{DirRecord, FileSystem, Metadata};
pub use layout::{FileKind, Permissions};
pub use path::Location;

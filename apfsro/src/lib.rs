//! Read-only APFS (Apple File System) mount and block-mapping core.
//!
//! Mounts one volume of an APFS container and answers the two queries a
//! filesystem host builds everything else on: volume object-id → physical
//! block (through the object map) and (file, logical block) → physical
//! block (through the catalog's file-extent records). Both run over the
//! same on-disk B-tree substrate. All reads go through the [`BlockReader`]
//! trait, every persistent object is Fletcher-64 verified before use, and
//! nothing is ever written.
//!
//! ```no_run
//! use apfsro::{ApfsMount, ImageReader};
//!
//! let dev = ImageReader::open(std::path::Path::new("container.img"))?;
//! let mount = ApfsMount::open(dev, "vol=0")?;
//!
//! let stats = mount.statfs()?;
//! println!("{} of {} blocks free", stats.free_blocks, stats.total_blocks);
//!
//! let root = mount.root_inode();
//! let mapped = mount.get_block(&root, 0, 4096, false);
//! # let _ = mapped;
//! # Ok::<(), apfsro::ApfsError>(())
//! ```

pub mod error;
pub mod fletcher;
pub mod device;
pub mod object;
pub mod key;
pub mod btree;
pub mod omap;
pub mod superblock;
pub mod options;
pub mod mount;
pub mod extents;

pub use device::{BlockReader, Buffer, ImageReader};
pub use error::{ApfsError, Result};
pub use extents::{FileExtent, Inode, MappedBlock};
pub use mount::{ApfsMount, Statfs, ROOT_DIR_OID};
pub use options::MountOptions;

use std::io::{Read, Seek};

use crate::btree::Node;
use crate::device::{BlockReader, ImageReader, DEFAULT_BLOCK_SIZE};
use crate::error::{ApfsError, Result};
use crate::extents::Inode;
use crate::fletcher;
use crate::key::OMAP_VAL_SIZE;
use crate::object;
use crate::omap;
use crate::options::MountOptions;
use crate::superblock::{ApfsSuperblock, NxSuperblock, NX_MAGIC};

/// Block number of the container superblock.
pub const NX_BLOCK_NUM: u64 = 0;

/// Object id of the root directory inode.
pub const ROOT_DIR_OID: u64 = 2;

/// statfs magic for a mounted apfs volume: the container magic, which is
/// also what ends up in the superblock's magic slot at mount time.
pub const APFS_SUPER_MAGIC: u32 = NX_MAGIC;

/// statfs(2)-shaped summary of the mounted container and volume.
///
/// `available_blocks` simply repeats `free_blocks`, and there is no
/// free-file count at all; nothing on disk supports a better answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statfs {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub available_blocks: u64,
    pub files: u64,
    pub name_max: u32,
    pub fsid: u64,
    pub magic: u32,
}

/// A mounted, read-only APFS volume.
///
/// Built by walking the boot chain: container superblock → container object
/// map → volume superblock → volume object map → catalog root. The volume
/// omap root and catalog root node handles stay pinned for the life of the
/// mount; everything here is immutable once `open` returns, so shared
/// references can serve parallel callers. Dropping the mount releases the
/// handles in reverse acquisition order.
#[derive(Debug)]
pub struct ApfsMount<D: BlockReader> {
    dev: D,
    block_size: u32,
    nx: NxSuperblock,
    vol: ApfsSuperblock,
    omap_root: Node,
    cat_root: Node,
    opts: MountOptions,
}

impl<R: Read + Seek> ApfsMount<ImageReader<R>> {
    /// Mount a volume from an image stream.
    pub fn open_image(reader: R, options: &str) -> Result<Self> {
        ApfsMount::open(ImageReader::new(reader), options)
    }
}

impl<D: BlockReader> ApfsMount<D> {
    /// Mount the volume selected by `options` from the container on `dev`.
    ///
    /// Every step only holds what earlier steps produced, so a failure
    /// anywhere drops the partial state and leaves nothing behind.
    pub fn open(mut dev: D, options: &str) -> Result<Self> {
        log::info!("mounting read-only");

        // Assume a small block size until the superblock declares the real
        // one, then re-read block 0 at the declared size.
        if !dev.set_block_size(DEFAULT_BLOCK_SIZE) {
            log::error!("unable to set block size {}", DEFAULT_BLOCK_SIZE);
            return Err(ApfsError::InvalidBlockSize(DEFAULT_BLOCK_SIZE));
        }
        let mut buf = dev.read_block(NX_BLOCK_NUM)?;
        let mut nx = NxSuperblock::parse(&buf)?;

        if nx.block_size != dev.block_size() {
            if !dev.set_block_size(nx.block_size) {
                log::error!("bad block size {}", nx.block_size);
                return Err(ApfsError::InvalidBlockSize(nx.block_size));
            }
            buf = dev.read_block(NX_BLOCK_NUM)?;
            nx = NxSuperblock::parse(&buf)?;
        }
        if !fletcher::verify(&buf) {
            log::error!("inconsistent container superblock");
            return Err(ApfsError::InvalidChecksum);
        }
        let block_size = nx.block_size;

        let opts = MountOptions::parse(options)?;

        // Find the volume superblock for the requested slot through the
        // container object map.
        let vol_oid = match nx.fs_oids.get(opts.vol as usize) {
            None => {
                log::error!("volume number {} out of range", opts.vol);
                return Err(ApfsError::InvalidVolume(opts.vol));
            }
            Some(&0) => {
                log::error!("requested volume {} does not exist", opts.vol);
                return Err(ApfsError::InvalidVolume(opts.vol));
            }
            Some(&oid) => oid,
        };
        let nx_omap_root = omap::read_tree_root(&dev, nx.omap_oid)?;
        let vsb_block = omap::lookup(&dev, &nx_omap_root, vol_oid)?;
        let (_, vsb_buf) = object::read_object(&dev, vsb_block)?;
        let vol = ApfsSuperblock::parse(&vsb_buf)?;

        // The volume omap must be up before the catalog root can be
        // resolved, since the catalog oid is virtual.
        let omap_root = omap::read_tree_root(&dev, vol.omap_oid)?;
        let cat_block = omap::lookup(&dev, &omap_root, vol.root_tree_oid)?;
        let cat_root = Node::read(&dev, cat_block)?;

        Ok(ApfsMount {
            dev,
            block_size,
            nx,
            vol,
            omap_root,
            cat_root,
            opts,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Parsed container superblock.
    pub fn container(&self) -> &NxSuperblock {
        &self.nx
    }

    /// Parsed superblock of the mounted volume.
    pub fn volume(&self) -> &ApfsSuperblock {
        &self.vol
    }

    pub fn options(&self) -> &MountOptions {
        &self.opts
    }

    /// The root directory inode. Its object id doubles as its extent id;
    /// directories carry no extents anyway.
    pub fn root_inode(&self) -> Inode {
        Inode::new(ROOT_DIR_OID, ROOT_DIR_OID)
    }

    pub(crate) fn dev(&self) -> &D {
        &self.dev
    }

    pub(crate) fn omap_root(&self) -> &Node {
        &self.omap_root
    }

    pub(crate) fn cat_root(&self) -> &Node {
        &self.cat_root
    }

    /// Count the blocks in use across all volumes of the container.
    ///
    /// Walks the container omap tree root directly: every entry's 16-byte
    /// value names a volume superblock, whose fs_alloc_count is added up.
    /// Any single volume that cannot be read aborts the whole count.
    fn count_used_blocks(&self) -> Result<u64> {
        let root = omap::read_tree_root(&self.dev, self.nx.omap_oid)?;

        let mut used: u64 = 0;
        for i in 0..root.nkeys() {
            let val = root.value_bytes(i, OMAP_VAL_SIZE)?;
            if val.len() != OMAP_VAL_SIZE as usize {
                log::error!("bad entry {} in container object map", i);
                return Err(ApfsError::CorruptedData(
                    "bad container object map entry".into(),
                ));
            }

            // The volume superblock's block number is the second u64.
            let vsb = u64::from_le_bytes([
                val[8], val[9], val[10], val[11], val[12], val[13], val[14], val[15],
            ]);
            let (_, buf) = object::read_object(&self.dev, vsb)?;
            let vol = ApfsSuperblock::parse(&buf)?;
            used += vol.fs_alloc_count;
        }

        Ok(used)
    }

    /// Report statfs(2) fields for the mounted volume. Space counters cover
    /// the whole container (volumes share the disk); the file count covers
    /// only the mounted volume.
    pub fn statfs(&self) -> Result<Statfs> {
        let used = self.count_used_blocks()?;
        let total = self.nx.block_count;
        let free = total.saturating_sub(used);

        Ok(Statfs {
            block_size: self.block_size,
            total_blocks: total,
            free_blocks: free,
            available_blocks: free,
            files: self.vol.num_files
                + self.vol.num_directories
                + self.vol.num_symlinks
                + self.vol.num_other_fsobjects,
            name_max: 255,
            fsid: self.vol.fsid(),
            magic: APFS_SUPER_MAGIC,
        })
    }
}

use byteorder::{LittleEndian, ReadBytesExt};
use std::cmp::Ordering;
use std::io::Cursor;
use std::sync::Mutex;

use crate::btree::{self, FixedSizes};
use crate::device::BlockReader;
use crate::error::{ApfsError, Result};
use crate::key::{self, FileExtentKey};
use crate::mount::ApfsMount;

/// Low 56 bits of len_and_flags carry the extent length in bytes.
pub const FILE_EXTENT_LEN_MASK: u64 = 0x00FF_FFFF_FFFF_FFFF;

/// On-disk file-extent value: len_and_flags, phys_block_num, crypto_id.
const FILE_EXTENT_VAL_SIZE: usize = 24;

/// A resolved file extent: `len` bytes of the file starting at
/// `logical_addr`, backed by a run of physical blocks, or by nothing at all
/// when `phys_block_num` is 0 (a hole).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileExtent {
    pub logical_addr: u64,
    pub phys_block_num: u64,
    pub len: u64,
}

impl FileExtent {
    pub fn is_hole(&self) -> bool {
        self.phys_block_num == 0
    }

    fn covers(&self, addr: u64) -> bool {
        addr >= self.logical_addr && addr < self.logical_addr + self.len
    }
}

/// Result of mapping one logical block: up to `size` bytes at physical
/// block `bno`, or a hole when `bno` is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedBlock {
    pub bno: Option<u64>,
    pub size: u64,
}

/// An open file's handle into the extent map.
///
/// `extent_id` keys the file-extent records in the catalog (an inode's
/// private id, which need not equal its object id). The cache remembers the
/// last extent resolved, one entry deep; racing readers may each install
/// their own winner, every installed value is itself valid. The mutex is
/// never held across a device read.
#[derive(Debug)]
pub struct Inode {
    id: u64,
    extent_id: u64,
    cached_extent: Mutex<Option<FileExtent>>,
}

impl Inode {
    pub fn new(id: u64, extent_id: u64) -> Self {
        Inode {
            id,
            extent_id,
            cached_extent: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn extent_id(&self) -> u64 {
        self.extent_id
    }

    fn cached(&self, addr: u64) -> Option<FileExtent> {
        let cache = self
            .cached_extent
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        cache.filter(|extent| extent.covers(addr))
    }

    fn install(&self, extent: FileExtent) {
        let mut cache = self
            .cached_extent
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *cache = Some(extent);
    }
}

impl<D: BlockReader> ApfsMount<D> {
    /// Find the extent record covering logical block `iblock` of `inode`,
    /// consulting the per-inode cache before the catalog.
    pub fn read_extent(&self, inode: &Inode, iblock: u64) -> Result<FileExtent> {
        let iaddr = iblock * self.block_size() as u64;
        if let Some(extent) = inode.cached(iaddr) {
            return Ok(extent);
        }

        let extent = self.extent_lookup(inode, iaddr)?;
        inode.install(extent);
        Ok(extent)
    }

    /// Catalog lookup for the extent record covering byte `iaddr`.
    fn extent_lookup(&self, inode: &Inode, iaddr: u64) -> Result<FileExtent> {
        let block_size = self.block_size() as u64;
        let extent_id = inode.extent_id();
        let cmp =
            |k: &[u8]| -> Result<Ordering> { key::compare_extent_key(k, extent_id, iaddr) };

        let entry = match btree::lookup(
            self.dev(),
            self.cat_root(),
            &cmp,
            FixedSizes { key: 0, val: 0 },
            Some(self.omap_root()),
        )? {
            Some(entry) => entry,
            None => return Err(ApfsError::NotFound),
        };

        if entry.key().len() != FileExtentKey::SIZE || entry.value().len() != FILE_EXTENT_VAL_SIZE
        {
            log::error!("bad extent record for inode 0x{:x}", inode.id());
            return Err(ApfsError::CorruptedData(format!(
                "bad extent record for inode 0x{:x}",
                inode.id()
            )));
        }
        let ext_key = FileExtentKey::parse(entry.key())?;
        if ext_key.obj_id != extent_id || ext_key.j_type != key::J_TYPE_FILE_EXTENT {
            return Err(ApfsError::NotFound);
        }

        let mut val = Cursor::new(entry.value());
        let len_and_flags = val.read_u64::<LittleEndian>()?;
        let phys_block_num = val.read_u64::<LittleEndian>()?;
        let _crypto_id = val.read_u64::<LittleEndian>()?;
        let len = len_and_flags & FILE_EXTENT_LEN_MASK;

        // The extent interval must be block-aligned and non-empty
        if len == 0 || len % block_size != 0 || ext_key.logical_addr % block_size != 0 {
            log::error!("bad extent length for inode 0x{:x}", inode.id());
            return Err(ApfsError::CorruptedData(format!(
                "bad extent length for inode 0x{:x}",
                inode.id()
            )));
        }

        let extent = FileExtent {
            logical_addr: ext_key.logical_addr,
            phys_block_num,
            len,
        };
        if !extent.covers(iaddr) {
            return Err(ApfsError::NotFound);
        }
        Ok(extent)
    }

    /// Map `(inode, iblock)` to a run of physical blocks.
    ///
    /// Returns at most `max_size` bytes, clipped so the mapping never reads
    /// past the extent. Holes come back with no block and a positive size.
    /// Write mappings are always refused.
    pub fn get_block(
        &self,
        inode: &Inode,
        iblock: u64,
        max_size: u64,
        want_write: bool,
    ) -> Result<MappedBlock> {
        if want_write {
            return Err(ApfsError::ReadOnly);
        }

        let block_size = self.block_size() as u64;
        let extent = self.read_extent(inode, iblock)?;

        // Block offset of iblock within the extent, and the bytes left in
        // the extent past that point.
        let blk_off = iblock - extent.logical_addr / block_size;
        let size = max_size.min(extent.len - blk_off * block_size);

        let bno = if extent.is_hole() {
            None
        } else {
            Some(extent.phys_block_num + blk_off)
        };
        Ok(MappedBlock { bno, size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_coverage() {
        let extent = FileExtent {
            logical_addr: 8192,
            phys_block_num: 500,
            len: 8192,
        };
        assert!(!extent.covers(8191));
        assert!(extent.covers(8192));
        assert!(extent.covers(16383));
        assert!(!extent.covers(16384));
    }

    #[test]
    fn test_inode_cache_install_and_filter() {
        let inode = Inode::new(10, 12);
        assert_eq!(inode.cached(0), None);

        let extent = FileExtent {
            logical_addr: 0,
            phys_block_num: 700,
            len: 4096,
        };
        inode.install(extent);
        assert_eq!(inode.cached(0), Some(extent));
        assert_eq!(inode.cached(4095), Some(extent));
        assert_eq!(inode.cached(4096), None);
    }
}

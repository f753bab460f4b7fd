use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::{ApfsError, Result};
use crate::object::ObjectHeader;

/// NX_MAGIC = "NXSB" as little-endian u32
pub const NX_MAGIC: u32 = 0x4253584E;

/// APSB_MAGIC = "APSB" as little-endian u32
pub const APSB_MAGIC: u32 = 0x42535041;

/// Maximum number of volume slots a container superblock can carry.
pub const NX_MAX_FILE_SYSTEMS: usize = 100;

/// Smallest and largest container block sizes the format allows.
pub const NX_MINIMUM_BLOCK_SIZE: u32 = 4096;
pub const NX_MAXIMUM_BLOCK_SIZE: u32 = 65536;

// Field offsets within the container superblock, from the block start.
const NX_OMAP_OID_OFF: u64 = 160;
const NX_MAX_FILE_SYSTEMS_OFF: u64 = 180; // nx_fs_oid[] follows

// Field offsets within the volume superblock, from the block start.
const APFS_FS_ALLOC_COUNT_OFF: u64 = 88;
const APFS_OMAP_OID_OFF: u64 = 128;
const APFS_NUM_FILES_OFF: u64 = 184;
const APFS_VOL_UUID_OFF: u64 = 240;
const APFS_VOLNAME_OFF: u64 = 704;
const APFS_VOLNAME_LEN: usize = 256;

/// Container superblock (NXSB) — the root structure of an APFS container,
/// trimmed to the fields the mount path consumes.
#[derive(Debug, Clone)]
pub struct NxSuperblock {
    pub header: ObjectHeader,
    pub magic: u32,
    pub block_size: u32,
    pub block_count: u64,
    pub omap_oid: u64, // physical block of the container object map
    pub fs_oids: Vec<u64>, // volume superblock oids (virtual)
}

impl NxSuperblock {
    /// Parse the container superblock from a raw block.
    pub fn parse(block: &[u8]) -> Result<Self> {
        let header = ObjectHeader::parse(block)?;
        let mut cursor = Cursor::new(block);
        cursor.set_position(ObjectHeader::SIZE as u64);

        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != NX_MAGIC {
            return Err(ApfsError::InvalidMagic(magic));
        }

        let block_size = cursor.read_u32::<LittleEndian>()?;
        if !block_size.is_power_of_two()
            || !(NX_MINIMUM_BLOCK_SIZE..=NX_MAXIMUM_BLOCK_SIZE).contains(&block_size)
        {
            return Err(ApfsError::InvalidBlockSize(block_size));
        }
        let block_count = cursor.read_u64::<LittleEndian>()?;

        cursor.set_position(NX_OMAP_OID_OFF);
        let omap_oid = cursor.read_u64::<LittleEndian>()?;

        cursor.set_position(NX_MAX_FILE_SYSTEMS_OFF);
        let max_file_systems = cursor.read_u32::<LittleEndian>()?;
        let fs_count = (max_file_systems as usize).min(NX_MAX_FILE_SYSTEMS);
        let mut fs_oids = Vec::with_capacity(fs_count);
        for _ in 0..fs_count {
            fs_oids.push(cursor.read_u64::<LittleEndian>()?);
        }

        Ok(NxSuperblock {
            header,
            magic,
            block_size,
            block_count,
            omap_oid,
            fs_oids,
        })
    }
}

/// Volume superblock (APSB) — one per filesystem within the container,
/// trimmed to the fields the mount path and statfs consume.
#[derive(Debug, Clone)]
pub struct ApfsSuperblock {
    pub header: ObjectHeader,
    pub magic: u32,
    pub fs_alloc_count: u64,
    pub omap_oid: u64,      // physical block of the volume object map
    pub root_tree_oid: u64, // virtual oid of the catalog root
    pub num_files: u64,
    pub num_directories: u64,
    pub num_symlinks: u64,
    pub num_other_fsobjects: u64,
    pub uuid: [u8; 16],
    pub volume_name: String,
}

impl ApfsSuperblock {
    /// Parse a volume superblock from a raw block.
    pub fn parse(block: &[u8]) -> Result<Self> {
        let header = ObjectHeader::parse(block)?;
        if block.len() < APFS_VOLNAME_OFF as usize + APFS_VOLNAME_LEN {
            return Err(ApfsError::CorruptedData(format!(
                "volume superblock too short: {} bytes",
                block.len()
            )));
        }

        let mut cursor = Cursor::new(block);
        cursor.set_position(ObjectHeader::SIZE as u64);
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != APSB_MAGIC {
            return Err(ApfsError::InvalidMagic(magic));
        }

        cursor.set_position(APFS_FS_ALLOC_COUNT_OFF);
        let fs_alloc_count = cursor.read_u64::<LittleEndian>()?;

        cursor.set_position(APFS_OMAP_OID_OFF);
        let omap_oid = cursor.read_u64::<LittleEndian>()?;
        let root_tree_oid = cursor.read_u64::<LittleEndian>()?;

        cursor.set_position(APFS_NUM_FILES_OFF);
        let num_files = cursor.read_u64::<LittleEndian>()?;
        let num_directories = cursor.read_u64::<LittleEndian>()?;
        let num_symlinks = cursor.read_u64::<LittleEndian>()?;
        let num_other_fsobjects = cursor.read_u64::<LittleEndian>()?;

        let mut uuid = [0u8; 16];
        cursor.set_position(APFS_VOL_UUID_OFF);
        std::io::Read::read_exact(&mut cursor, &mut uuid)?;

        // volume_name: null-terminated UTF-8, up to 256 bytes
        let name_start = APFS_VOLNAME_OFF as usize;
        let name_buf = &block[name_start..name_start + APFS_VOLNAME_LEN];
        let nul_pos = name_buf.iter().position(|&b| b == 0).unwrap_or(APFS_VOLNAME_LEN);
        let volume_name = String::from_utf8_lossy(&name_buf[..nul_pos]).to_string();

        Ok(ApfsSuperblock {
            header,
            magic,
            fs_alloc_count,
            omap_oid,
            root_tree_oid,
            num_files,
            num_directories,
            num_symlinks,
            num_other_fsobjects,
            uuid,
            volume_name,
        })
    }

    /// 64-bit filesystem id: the two halves of the volume uuid XORed, the
    /// same derivation ext2 uses.
    pub fn fsid(&self) -> u64 {
        let lo = u64::from_le_bytes([
            self.uuid[0], self.uuid[1], self.uuid[2], self.uuid[3],
            self.uuid[4], self.uuid[5], self.uuid[6], self.uuid[7],
        ]);
        let hi = u64::from_le_bytes([
            self.uuid[8], self.uuid[9], self.uuid[10], self.uuid[11],
            self.uuid[12], self.uuid[13], self.uuid[14], self.uuid[15],
        ]);
        lo ^ hi
    }
}

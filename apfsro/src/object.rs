use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::device::{BlockReader, Buffer};
use crate::error::{ApfsError, Result};
use crate::fletcher;

// Object type constants (lower 16 bits of type_and_flags)
pub const OBJECT_TYPE_NX_SUPERBLOCK: u32 = 0x01;
pub const OBJECT_TYPE_BTREE: u32 = 0x02;
pub const OBJECT_TYPE_BTREE_NODE: u32 = 0x03;
pub const OBJECT_TYPE_OMAP: u32 = 0x0B;
pub const OBJECT_TYPE_FS: u32 = 0x0D;

pub const OBJECT_TYPE_MASK: u32 = 0x0000FFFF;

/// 32-byte header present on every APFS on-disk object. All fields are
/// little-endian.
#[derive(Debug, Clone)]
pub struct ObjectHeader {
    pub checksum: u64,       // 0x00
    pub oid: u64,            // 0x08
    pub xid: u64,            // 0x10
    pub type_and_flags: u32, // 0x18
    pub subtype: u32,        // 0x1C
}

impl ObjectHeader {
    /// Size of the on-disk header in bytes
    pub const SIZE: usize = 32;

    /// Parse an object header from the first 32 bytes of a block
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::CorruptedData(format!(
                "object header too short: {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        Ok(ObjectHeader {
            checksum: cursor.read_u64::<LittleEndian>()?,
            oid: cursor.read_u64::<LittleEndian>()?,
            xid: cursor.read_u64::<LittleEndian>()?,
            type_and_flags: cursor.read_u32::<LittleEndian>()?,
            subtype: cursor.read_u32::<LittleEndian>()?,
        })
    }

    /// Get the object type (lower 16 bits, no flags)
    pub fn object_type(&self) -> u32 {
        self.type_and_flags & OBJECT_TYPE_MASK
    }
}

/// Read block `bno`, verify the object checksum over bytes 8..block_size,
/// and decode the header.
pub fn read_object<D: BlockReader>(dev: &D, bno: u64) -> Result<(ObjectHeader, Buffer)> {
    let buf = dev.read_block(bno)?;

    if !fletcher::verify(&buf) {
        log::error!("bad object checksum in block 0x{:x}", bno);
        return Err(ApfsError::InvalidChecksum);
    }

    let header = ObjectHeader::parse(&buf)?;
    Ok((header, buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ImageReader;
    use std::io::Cursor;

    fn sealed_block(oid: u64) -> Vec<u8> {
        let mut block = vec![0u8; 4096];
        block[8..16].copy_from_slice(&oid.to_le_bytes());
        block[16..24].copy_from_slice(&1u64.to_le_bytes());
        block[24..28].copy_from_slice(&OBJECT_TYPE_BTREE_NODE.to_le_bytes());
        let cksum = fletcher::fletcher64(&block[8..]);
        block[..8].copy_from_slice(&cksum.to_le_bytes());
        block
    }

    #[test]
    fn test_read_object_roundtrip() {
        let mut dev = ImageReader::new(Cursor::new(sealed_block(0x500)));
        assert!(dev.set_block_size(4096));

        let (header, buf) = read_object(&dev, 0).unwrap();
        assert_eq!(header.oid, 0x500);
        assert_eq!(header.object_type(), OBJECT_TYPE_BTREE_NODE);
        assert_eq!(buf.len(), 4096);
    }

    #[test]
    fn test_read_object_bad_checksum() {
        let mut block = sealed_block(0x500);
        block[40] ^= 0xFF;
        let mut dev = ImageReader::new(Cursor::new(block));
        assert!(dev.set_block_size(4096));

        assert!(matches!(
            read_object(&dev, 0),
            Err(ApfsError::InvalidChecksum)
        ));
    }
}

use byteorder::{LittleEndian, ReadBytesExt};
use std::cmp::Ordering;
use std::io::Cursor;

use crate::btree::{self, FixedSizes, Node};
use crate::device::BlockReader;
use crate::error::{ApfsError, Result};
use crate::key::{OmapKey, OMAP_KEY_SIZE, OMAP_VAL_SIZE};
use crate::object::{self, ObjectHeader};

/// Read the object-map structure at a physical block and load the root node
/// of its mapping tree.
///
/// omap_phys_t layout after the object header: om_flags (u32),
/// om_snap_count (u32), om_tree_type (u32), om_snapshot_tree_type (u32),
/// om_tree_oid (u64, the physical block of the B-tree root).
pub fn read_tree_root<D: BlockReader>(dev: &D, omap_block: u64) -> Result<Node> {
    let (_, buf) = object::read_object(dev, omap_block)?;

    let mut cursor = Cursor::new(&buf[ObjectHeader::SIZE..]);
    let _om_flags = cursor.read_u32::<LittleEndian>()?;
    let _om_snap_count = cursor.read_u32::<LittleEndian>()?;
    let _om_tree_type = cursor.read_u32::<LittleEndian>()?;
    let _om_snap_tree_type = cursor.read_u32::<LittleEndian>()?;
    let om_tree_oid = cursor.read_u64::<LittleEndian>()?;

    Node::read(dev, om_tree_oid)
}

/// Resolve `oid` to its physical block through an object-map tree.
///
/// Entries sort by (oid, xid); querying with the maximum xid makes the
/// greatest-key-not-above search land on the newest version of the oid, so
/// the latest visible mapping wins without a second pass. An oid the map
/// does not know is corruption: every oid the core asks about came from a
/// structure that promised the mapping exists.
pub fn lookup<D: BlockReader>(dev: &D, root: &Node, oid: u64) -> Result<u64> {
    let cmp = |key: &[u8]| -> Result<Ordering> { Ok(OmapKey::parse(key)?.compare(oid, u64::MAX)) };
    let sizes = FixedSizes {
        key: OMAP_KEY_SIZE,
        val: OMAP_VAL_SIZE,
    };

    let entry = match btree::lookup(dev, root, &cmp, sizes, None)? {
        Some(entry) => entry,
        None => return missing(oid),
    };
    if OmapKey::parse(entry.key())?.oid != oid {
        return missing(oid);
    }

    // Value: (flags: u32, size: u32, paddr: u64)
    let val = entry.value();
    if val.len() != OMAP_VAL_SIZE as usize {
        log::error!("bad omap value size {} for oid 0x{:x}", val.len(), oid);
        return Err(ApfsError::CorruptedData(format!(
            "bad omap value size for oid 0x{:x}",
            oid
        )));
    }
    let paddr = u64::from_le_bytes([
        val[8], val[9], val[10], val[11], val[12], val[13], val[14], val[15],
    ]);

    if paddr == 0 {
        log::error!("oid 0x{:x} maps to block 0", oid);
        return Err(ApfsError::CorruptedData(format!(
            "oid 0x{:x} maps to block 0",
            oid
        )));
    }
    Ok(paddr)
}

fn missing(oid: u64) -> Result<u64> {
    log::error!("object map has no entry for oid 0x{:x}", oid);
    Err(ApfsError::CorruptedData(format!(
        "oid 0x{:x} not in object map",
        oid
    )))
}

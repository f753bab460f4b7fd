use byteorder::{LittleEndian, ReadBytesExt};
use std::cmp::Ordering;
use std::io::Cursor;
use std::ops::Range;

use crate::device::{BlockReader, Buffer};
use crate::error::{ApfsError, Result};
use crate::object::{self, ObjectHeader};
use crate::omap;

// B-tree node flags (from btn_flags)
pub const BTNODE_ROOT: u16 = 0x0001;
pub const BTNODE_LEAF: u16 = 0x0002;
pub const BTNODE_FIXED_KV_SIZE: u16 = 0x0004;

/// Deepest tree the engine will walk; anything past this is corruption.
pub const BTREE_MAX_DEPTH: u16 = 16;

/// Internal-node values are always an 8-byte child pointer.
const CHILD_PTR_SIZE: u16 = 8;

/// B-tree node-info header, 24 bytes after the object header. The free-list
/// fields in the second half only matter to writers and stay undecoded.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub flags: u16,
    pub level: u16,
    pub nkeys: u32,
    pub table_space_off: u16,
    pub table_space_len: u16,
    pub free_space_off: u16,
    pub free_space_len: u16,
}

impl NodeInfo {
    pub const SIZE: usize = 24;

    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::InvalidBTree("node info header too short".into()));
        }
        let mut cursor = Cursor::new(data);
        Ok(NodeInfo {
            flags: cursor.read_u16::<LittleEndian>()?,
            level: cursor.read_u16::<LittleEndian>()?,
            nkeys: cursor.read_u32::<LittleEndian>()?,
            table_space_off: cursor.read_u16::<LittleEndian>()?,
            table_space_len: cursor.read_u16::<LittleEndian>()?,
            free_space_off: cursor.read_u16::<LittleEndian>()?,
            free_space_len: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn is_leaf(&self) -> bool {
        self.flags & BTNODE_LEAF != 0
    }

    pub fn is_root(&self) -> bool {
        self.flags & BTNODE_ROOT != 0
    }

    pub fn is_fixed_kv(&self) -> bool {
        self.flags & BTNODE_FIXED_KV_SIZE != 0
    }
}

/// Fixed part of the tree-info block at the tail of a root node. Only the
/// declared key/value sizes matter here; the statistics after them do not.
#[derive(Debug, Clone, Copy)]
pub struct TreeInfo {
    pub flags: u32,
    pub node_size: u32,
    pub key_size: u32,
    pub val_size: u32,
}

impl TreeInfo {
    /// Full on-disk size of the info block, statistics included.
    pub const SIZE: usize = 40;

    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::InvalidBTree("tree info too short".into()));
        }
        let mut cursor = Cursor::new(data);
        Ok(TreeInfo {
            flags: cursor.read_u32::<LittleEndian>()?,
            node_size: cursor.read_u32::<LittleEndian>()?,
            key_size: cursor.read_u32::<LittleEndian>()?,
            val_size: cursor.read_u32::<LittleEndian>()?,
        })
    }
}

/// Fixed key/value entry sizes for trees whose nodes carry
/// `BTNODE_FIXED_KV_SIZE`; a root info block with nonzero sizes overrides
/// them. Variable-size trees pass zeros.
#[derive(Debug, Clone, Copy)]
pub struct FixedSizes {
    pub key: u16,
    pub val: u16,
}

/// A loaded B-tree node: a shared view over the block buffer plus the
/// decoded geometry needed to locate keys and values. Clones share the
/// buffer; the last one dropped releases it.
#[derive(Debug, Clone)]
pub struct Node {
    header: ObjectHeader,
    info: NodeInfo,
    tree_info: Option<TreeInfo>,
    buf: Buffer,
    toc_off: usize,
    key_area: usize,
    val_end: usize,
}

impl Node {
    /// Read block `bno`, verify it, and decode it as a B-tree node.
    pub fn read<D: BlockReader>(dev: &D, bno: u64) -> Result<Self> {
        let (header, buf) = object::read_object(dev, bno)?;
        Node::parse(header, buf)
    }

    fn parse(header: ObjectHeader, buf: Buffer) -> Result<Self> {
        if buf.len() < ObjectHeader::SIZE + NodeInfo::SIZE {
            return Err(ApfsError::InvalidBTree("node block too short".into()));
        }
        let info = NodeInfo::parse(&buf[ObjectHeader::SIZE..])?;

        let toc_off = ObjectHeader::SIZE + NodeInfo::SIZE + info.table_space_off as usize;
        let key_area = toc_off + info.table_space_len as usize;

        // Root nodes reserve the tail of the block for the tree-info record.
        let (tree_info, val_end) = if info.is_root() {
            if buf.len() < key_area + TreeInfo::SIZE {
                return Err(ApfsError::InvalidBTree("root node too short".into()));
            }
            let info_start = buf.len() - TreeInfo::SIZE;
            (Some(TreeInfo::parse(&buf[info_start..])?), info_start)
        } else {
            (None, buf.len())
        };

        let entry_size = if info.is_fixed_kv() { 4usize } else { 8usize };
        let toc_end = toc_off + info.nkeys as usize * entry_size;
        if toc_end > key_area || key_area > val_end {
            log::error!("bad table of contents in node 0x{:x}", header.oid);
            return Err(ApfsError::InvalidBTree(format!(
                "table of contents outside node 0x{:x}",
                header.oid
            )));
        }

        Ok(Node {
            header,
            info,
            tree_info,
            buf,
            toc_off,
            key_area,
            val_end,
        })
    }

    pub fn oid(&self) -> u64 {
        self.header.oid
    }

    pub fn level(&self) -> u16 {
        self.info.level
    }

    pub fn nkeys(&self) -> usize {
        self.info.nkeys as usize
    }

    pub fn is_leaf(&self) -> bool {
        self.info.is_leaf()
    }

    /// Table-of-contents entry: (key_off, key_len, val_off, val_len).
    /// Lengths are 0 for fixed-size entries.
    fn toc_entry(&self, index: usize) -> Result<(u16, u16, u16, u16)> {
        if index >= self.nkeys() {
            return Err(ApfsError::InvalidBTree(format!(
                "entry {} out of range in node 0x{:x}",
                index, self.header.oid
            )));
        }

        let read_u16 = |off: usize| u16::from_le_bytes([self.buf[off], self.buf[off + 1]]);
        if self.info.is_fixed_kv() {
            let off = self.toc_off + index * 4;
            Ok((read_u16(off), 0, read_u16(off + 2), 0))
        } else {
            let off = self.toc_off + index * 8;
            Ok((
                read_u16(off),
                read_u16(off + 2),
                read_u16(off + 4),
                read_u16(off + 6),
            ))
        }
    }

    /// Byte range of key `index`, clipped to the node's key/value regions.
    pub fn locate_key(&self, index: usize, fixed_key_size: u16) -> Result<Range<usize>> {
        let (key_off, key_len, _, _) = self.toc_entry(index)?;
        let len = if self.info.is_fixed_kv() {
            fixed_key_size as usize
        } else {
            key_len as usize
        };

        let start = self.key_area + key_off as usize;
        let end = start + len;
        if end > self.val_end {
            log::error!("key {} outside node 0x{:x}", index, self.header.oid);
            return Err(ApfsError::InvalidBTree(format!(
                "key out of bounds in node 0x{:x}",
                self.header.oid
            )));
        }
        Ok(start..end)
    }

    /// Byte range of value `index`.
    ///
    /// val_off counts back from the end of the value area to the START of
    /// the value data. Internal-node values are always a child pointer.
    pub fn locate_value(&self, index: usize, fixed_val_size: u16) -> Result<Range<usize>> {
        let (_, _, val_off, val_len) = self.toc_entry(index)?;
        let len = if !self.info.is_leaf() {
            CHILD_PTR_SIZE as usize
        } else if self.info.is_fixed_kv() {
            fixed_val_size as usize
        } else {
            val_len as usize
        };

        let start = match self.val_end.checked_sub(val_off as usize) {
            Some(s) if s >= self.key_area => s,
            _ => {
                log::error!("value {} outside node 0x{:x}", index, self.header.oid);
                return Err(ApfsError::InvalidBTree(format!(
                    "value out of bounds in node 0x{:x}",
                    self.header.oid
                )));
            }
        };
        let end = start + len;
        if end > self.val_end {
            log::error!("value {} outside node 0x{:x}", index, self.header.oid);
            return Err(ApfsError::InvalidBTree(format!(
                "value out of bounds in node 0x{:x}",
                self.header.oid
            )));
        }
        Ok(start..end)
    }

    pub fn key_bytes(&self, index: usize, fixed_key_size: u16) -> Result<&[u8]> {
        Ok(&self.buf[self.locate_key(index, fixed_key_size)?])
    }

    pub fn value_bytes(&self, index: usize, fixed_val_size: u16) -> Result<&[u8]> {
        Ok(&self.buf[self.locate_value(index, fixed_val_size)?])
    }

    /// Child pointer stored in internal-node entry `index`: a physical block
    /// for object-map trees, an oid for the catalog.
    pub fn child_ptr(&self, index: usize) -> Result<u64> {
        let val = self.value_bytes(index, CHILD_PTR_SIZE)?;
        Ok(u64::from_le_bytes([
            val[0], val[1], val[2], val[3], val[4], val[5], val[6], val[7],
        ]))
    }
}

/// Result of a successful lookup: the leaf node (kept alive by this handle),
/// the entry index, and the located key/value ranges.
pub struct BTreeCursor {
    node: Node,
    index: usize,
    key: Range<usize>,
    val: Range<usize>,
}

impl BTreeCursor {
    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn key(&self) -> &[u8] {
        &self.node.buf[self.key.clone()]
    }

    pub fn value(&self) -> &[u8] {
        &self.node.buf[self.val.clone()]
    }
}

/// Look up a key in the tree rooted at `root`.
///
/// `cmp` reports the ordering of an on-disk key relative to the search key
/// (`Less` means the on-disk key sorts first). The engine descends level by
/// level to the leaf entry with the greatest key not exceeding the target
/// and returns a cursor there; `Ok(None)` means every key in the tree is
/// greater. Catalog trees store child oids, resolved through `omap_root`;
/// object-map trees store physical blocks and pass `None`.
pub fn lookup<D, F>(
    dev: &D,
    root: &Node,
    cmp: &F,
    sizes: FixedSizes,
    omap_root: Option<&Node>,
) -> Result<Option<BTreeCursor>>
where
    D: BlockReader,
    F: Fn(&[u8]) -> Result<Ordering>,
{
    let sizes = effective_sizes(root, sizes);

    if root.level() > BTREE_MAX_DEPTH {
        log::error!("tree rooted at node 0x{:x} too deep", root.oid());
        return Err(ApfsError::InvalidBTree(format!(
            "tree depth {} beyond sanity bound",
            root.level()
        )));
    }

    let mut node = root.clone();
    let mut depth: u16 = 0;
    loop {
        if node.nkeys() == 0 {
            log::error!("empty b-tree node 0x{:x}", node.oid());
            return Err(ApfsError::InvalidBTree(format!(
                "empty node 0x{:x}",
                node.oid()
            )));
        }

        let index = match search_le(&node, sizes.key, cmp)? {
            Some(i) => i,
            None => return Ok(None), // target sorts before every key
        };

        if node.is_leaf() {
            if index > 0 && node.key_bytes(index, sizes.key)? == node.key_bytes(index - 1, sizes.key)? {
                log::error!("duplicate key in leaf node 0x{:x}", node.oid());
                return Err(ApfsError::InvalidBTree(format!(
                    "duplicate key in node 0x{:x}",
                    node.oid()
                )));
            }
            let key = node.locate_key(index, sizes.key)?;
            let val = node.locate_value(index, sizes.val)?;
            return Ok(Some(BTreeCursor {
                node,
                index,
                key,
                val,
            }));
        }

        depth += 1;
        if depth > BTREE_MAX_DEPTH {
            log::error!("descent below node 0x{:x} exceeds depth bound", root.oid());
            return Err(ApfsError::InvalidBTree(
                "descent exceeds depth bound".into(),
            ));
        }

        let child = node.child_ptr(index)?;
        let child_block = match omap_root {
            Some(om) => omap::lookup(dev, om, child)?,
            None => child,
        };
        node = Node::read(dev, child_block)?;
    }
}

/// Binary search for the greatest key that does not exceed the target.
fn search_le<F>(node: &Node, fixed_key_size: u16, cmp: &F) -> Result<Option<usize>>
where
    F: Fn(&[u8]) -> Result<Ordering>,
{
    let mut lo = 0usize;
    let mut hi = node.nkeys();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let key = node.key_bytes(mid, fixed_key_size)?;
        match cmp(key)? {
            Ordering::Greater => hi = mid,
            _ => lo = mid + 1,
        }
    }
    Ok(if lo == 0 { None } else { Some(lo - 1) })
}

/// Key/value sizes declared by the root's info block win over the caller's.
fn effective_sizes(root: &Node, fallback: FixedSizes) -> FixedSizes {
    match root.tree_info {
        Some(info) => FixedSizes {
            key: if info.key_size > 0 {
                info.key_size as u16
            } else {
                fallback.key
            },
            val: if info.val_size > 0 {
                info.val_size as u16
            } else {
                fallback.val
            },
        },
        None => fallback,
    }
}

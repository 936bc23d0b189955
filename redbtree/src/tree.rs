//! The copy-on-write B-tree engine.
//!
//! On-disk nodes are never rewritten. Every mutation builds replacement
//! nodes in memory, writes them to freshly allocated extents, issues a
//! durability barrier, and only then overwrites the single 8-byte pointer
//! that makes the new nodes reachable: either the root pointer at its fixed
//! header offset or one slot inside a parent node. A crash between barriers
//! therefore leaves either the old tree or the new tree, never a mixture.
//! The replaced nodes are recycled through the space allocator afterwards.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use nanorand::{Rng, WyRand};

use crate::{
    allocator::Allocator,
    cache::NodeCache,
    error::{Error, ErrorKind},
    format::{
        child_slot_offset, value_slot_offset, HDR_ROOTPTR_POS, KEY_LEN, MAGIC, NODE_SIZE,
    },
    io::{Device, DeviceExt, Fence},
    node::Node,
};

/// Behavior flags for [`BTree::open`] and an open tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Flags(u32);

impl Flags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Initialize an empty file into a new database on open.
    pub const CREATE: Self = Self(1);
    /// Issue a durability barrier at every publication point. Enabled by
    /// default; clearing it trades crash consistency for speed.
    pub const USE_WRITE_BARRIER: Self = Self(2);

    /// Returns true if every flag in `other` is also set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Where the pointer that published a node lives on disk. Updating this
/// slot is what commits a copy-on-write rewrite.
#[derive(Clone, Copy)]
enum Backlink {
    /// The fixed root pointer in the file header.
    Root,
    /// A child slot at `slot` inside the parent node at `node`.
    Child { node: u64, slot: u64 },
}

impl Backlink {
    const fn slot(self) -> u64 {
        match self {
            Self::Root => HDR_ROOTPTR_POS,
            Self::Child { slot, .. } => slot,
        }
    }
}

/// A single-file durable B-tree keyed by fixed 16-byte hashed keys.
///
/// The tree assumes exclusive access to its device for the lifetime of the
/// value; it is not thread-safe and performs no internal locking.
#[derive(Debug)]
pub struct BTree<D: Device> {
    device: D,
    allocator: Allocator,
    rootptr: u64,
    /// Incremented for every node write and stored as the node's start and
    /// end marks.
    mark: u32,
    flags: Flags,
    cache: Option<NodeCache>,
}

impl<D: Device> BTree<D> {
    /// Opens a tree stored on `device`.
    ///
    /// An empty device is initialized into a fresh database when
    /// [`Flags::CREATE`] is passed and rejected otherwise. A non-empty
    /// device must begin with the magic string. Barriers start enabled
    /// regardless of `flags`; use [`clear_flags`](Self::clear_flags) to
    /// disable them.
    pub fn open(mut device: D, flags: Flags) -> Result<Self, Error> {
        let length = device.length()?;
        let create = length == 0;
        if create {
            if !flags.contains(Flags::CREATE) {
                return Err(Error::from(ErrorKind::message(
                    "the file is empty and Flags::CREATE was not requested",
                )));
            }
            let mut dev = Fence::new(&mut device, true);
            Self::create_layout(&mut dev)?;
        } else {
            let mut magic = [0_u8; 16];
            device.read_exact_at(&mut magic, 0)?;
            if magic != MAGIC {
                return Err(Error::data_integrity(
                    "the file does not begin with the REDBTREE magic string",
                ));
            }
        }

        let allocator = Allocator::load(&device)?;
        let rootptr = device.read_u64_at(HDR_ROOTPTR_POS)?;
        let mut tree = Self {
            device,
            allocator,
            rootptr,
            mark: seed_mark(),
            flags: Flags::USE_WRITE_BARRIER,
            cache: None,
        };
        if create {
            tree.bootstrap_root()?;
        }
        Ok(tree)
    }

    /// Writes the initial layout into an empty device: magic string, zeroed
    /// allocator header and chain heads, zeroed root pointer, and space for
    /// the initial root node.
    fn create_layout(dev: &mut Fence<'_>) -> Result<(), Error> {
        let size = HDR_ROOTPTR_POS + 8 + NODE_SIZE as u64;
        dev.resize(size)?;
        dev.write_all_at(&MAGIC, 0)?;
        Allocator::format(dev, size)?;
        dev.write_u64_at(0, HDR_ROOTPTR_POS)?;
        dev.barrier()?;
        Ok(())
    }

    /// Allocates and publishes the empty leaf root of a fresh database.
    fn bootstrap_root(&mut self) -> Result<(), Error> {
        let rootptr = self.alloc_extent(NODE_SIZE as u32)?;
        self.write_node(&Node::new(true), rootptr)?;
        self.publish(Backlink::Root, rootptr)
    }

    /// Flushes the device and releases it.
    pub fn close(mut self) -> Result<(), Error> {
        self.device.synchronize()
    }

    /// Sets the given behavior flags.
    pub fn set_flags(&mut self, flags: Flags) {
        self.flags |= flags;
    }

    /// Clears the given behavior flags.
    pub fn clear_flags(&mut self, flags: Flags) {
        self.flags = Flags(self.flags.0 & !flags.0);
    }

    /// Installs a node cache. Purely an optimization; see [`NodeCache`].
    pub fn set_cache(&mut self, cache: NodeCache) {
        self.cache = Some(cache);
    }

    /// File offset of the current root node.
    #[must_use]
    pub fn root_offset(&self) -> u64 {
        self.rootptr
    }

    /// File offset where the allocator's bump area currently begins. Useful
    /// when measuring how much of the file allocations actually consumed.
    #[must_use]
    pub fn bump_offset(&self) -> u64 {
        self.allocator.bump_offset()
    }

    /// Bytes left in the allocator's pre-allocated bump window.
    #[must_use]
    pub fn free_space(&self) -> u64 {
        self.allocator.free_space()
    }

    /// Inserts `key` with `value`. When the key is already present the
    /// stored value is replaced if `replace` is set and
    /// [`ErrorKind::KeyAlreadyPresent`] is returned otherwise.
    pub fn add(&mut self, key: &[u8; KEY_LEN], value: &[u8], replace: bool) -> Result<(), Error> {
        let root = self.read_node(self.rootptr)?;
        if root.is_full() {
            // Grow the tree by one level: an empty root is written and the
            // old root split beneath it. This is the only way the height
            // increases.
            let new_root = self.alloc_extent(NODE_SIZE as u32)?;
            self.write_node(&Node::new(false), new_root)?;
            let old_root = self.rootptr;
            self.split_child(Backlink::Root, new_root, 0, old_root)?;
        }
        self.add_nonfull(self.rootptr, Backlink::Root, key, value, replace)
    }

    /// Inserts into the subtree rooted at `node_offset`, which is known to
    /// have room. Full children are split on the way down, so the eventual
    /// leaf insertion never propagates back up.
    fn add_nonfull(
        &mut self,
        node_offset: u64,
        link: Backlink,
        key: &[u8; KEY_LEN],
        value: &[u8],
        replace: bool,
    ) -> Result<(), Error> {
        let node = self.read_node(node_offset)?;
        match node.position_of(key) {
            Ok(index) => {
                if !replace {
                    return Err(Error::from(ErrorKind::KeyAlreadyPresent));
                }
                // Overwriting the value slot is the one in-place node
                // mutation in the engine: a single atomic 8-byte write that
                // leaves the node marks untouched.
                let new_value = self.write_value(value)?;
                self.sync()?;
                self.device
                    .write_u64_at(new_value, value_slot_offset(node_offset, index))?;
                self.sync()?;
                if let Some(cache) = &self.cache {
                    cache.evict(node_offset);
                }
                self.free_extent(node.values[index])
            }
            Err(index) if node.leaf => {
                let value_offset = self.write_value(value)?;
                let mut updated = (*node).clone();
                updated.insert_key_at(index, key, value_offset);
                let updated_offset = self.alloc_extent(NODE_SIZE as u32)?;
                self.write_node(&updated, updated_offset)?;
                self.publish(link, updated_offset)?;
                self.free_node(node_offset)
            }
            Err(index) => {
                let child_offset = node.children[index];
                let child = self.read_node(child_offset)?;
                if child.is_full() {
                    let updated_offset =
                        self.split_child(link, node_offset, index, child_offset)?;
                    // Re-descend into the rewritten node: the median moved
                    // up and may change which child covers the key.
                    self.add_nonfull(updated_offset, link, key, value, replace)
                } else {
                    let child_link = Backlink::Child {
                        node: node_offset,
                        slot: child_slot_offset(node_offset, index),
                    };
                    self.add_nonfull(child_offset, child_link, key, value, replace)
                }
            }
        }
    }

    /// Splits the full child at position `index` of the node at
    /// `parent_offset`. Three new nodes are written: the two halves and the
    /// updated parent with the median moved up. `link` is then pointed at
    /// the new parent and the replaced nodes are freed. Returns the new
    /// parent's offset.
    fn split_child(
        &mut self,
        link: Backlink,
        parent_offset: u64,
        index: usize,
        child_offset: u64,
    ) -> Result<u64, Error> {
        let parent = self.read_node(parent_offset)?;
        let child = self.read_node(child_offset)?;

        let (left, median_key, median_value, right) = child.split();
        let left_offset = self.alloc_extent(NODE_SIZE as u32)?;
        let right_offset = self.alloc_extent(NODE_SIZE as u32)?;
        self.write_node(&left, left_offset)?;
        self.write_node(&right, right_offset)?;

        let mut updated = (*parent).clone();
        updated.adopt_split(index, &median_key, median_value, left_offset, right_offset);
        let updated_offset = self.alloc_extent(NODE_SIZE as u32)?;
        self.write_node(&updated, updated_offset)?;

        self.publish(link, updated_offset)?;
        self.free_node(parent_offset)?;
        self.free_node(child_offset)?;
        Ok(updated_offset)
    }

    /// Looks up `key` and returns the file offset of its value payload.
    pub fn find(&self, key: &[u8; KEY_LEN]) -> Result<u64, Error> {
        let mut node_offset = self.rootptr;
        loop {
            let node = self.read_node(node_offset)?;
            match node.position_of(key) {
                Ok(index) => return Ok(node.values[index]),
                Err(index) => {
                    if node.leaf || node.children[index] == 0 {
                        return Err(Error::from(ErrorKind::KeyNotFound));
                    }
                    node_offset = node.children[index];
                }
            }
        }
    }

    /// Walks the tree in key order, invoking `visitor` with each key and
    /// the file offset of its value payload.
    pub fn walk<F>(&self, visitor: F) -> Result<(), Error>
    where
        F: FnMut(&[u8; KEY_LEN], u64) -> Result<(), Error>,
    {
        self.walk_from(self.rootptr, visitor)
    }

    /// Walks the subtree rooted at `node_offset` in key order. Mostly a
    /// debugging aid; [`walk`](Self::walk) covers the whole tree.
    pub fn walk_from<F>(&self, node_offset: u64, mut visitor: F) -> Result<(), Error>
    where
        F: FnMut(&[u8; KEY_LEN], u64) -> Result<(), Error>,
    {
        self.walk_node(node_offset, &mut visitor)
    }

    fn walk_node<F>(&self, node_offset: u64, visitor: &mut F) -> Result<(), Error>
    where
        F: FnMut(&[u8; KEY_LEN], u64) -> Result<(), Error>,
    {
        let node = self.read_node(node_offset)?;
        for index in 0..node.numkeys {
            if !node.leaf && node.children[index] != 0 {
                self.walk_node(node.children[index], visitor)?;
            }
            visitor(&node.keys[index], node.values[index])?;
        }
        if !node.leaf && node.children[node.numkeys] != 0 {
            self.walk_node(node.children[node.numkeys], visitor)?;
        }
        Ok(())
    }

    /// Length of the value stored at `offset`, as passed to the allocator
    /// when the value was written.
    pub fn value_len(&self, offset: u64) -> Result<u32, Error> {
        Allocator::size_of(&self.device, offset)
    }

    /// Reads back the entire value payload stored at `offset`.
    pub fn read_value(&self, offset: u64) -> Result<Vec<u8>, Error> {
        let length = self.value_len(offset)?;
        let mut value = vec![0; length as usize];
        self.device.read_exact_at(&mut value, offset)?;
        Ok(value)
    }

    /// Positioned read straight from the underlying device, for callers
    /// that fetch value payloads incrementally.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), Error> {
        self.device.read_exact_at(buf, offset)
    }

    /// Allocates an extent of `size` bytes on disk and returns the offset
    /// of its payload. Part of the on-disk allocator surface; tree
    /// operations allocate their own storage.
    pub fn allocate(&mut self, size: u32) -> Result<u64, Error> {
        self.alloc_extent(size)
    }

    /// Releases an extent previously returned by [`allocate`](Self::allocate).
    pub fn free(&mut self, offset: u64) -> Result<(), Error> {
        self.free_extent(offset)
    }

    fn barriers_enabled(&self) -> bool {
        self.flags.contains(Flags::USE_WRITE_BARRIER)
    }

    /// Issues a durability barrier unless barriers are disabled.
    fn sync(&mut self) -> Result<(), Error> {
        if self.barriers_enabled() {
            self.device.synchronize()?;
        }
        Ok(())
    }

    fn alloc_extent(&mut self, size: u32) -> Result<u64, Error> {
        let barriers = self.barriers_enabled();
        let mut dev = Fence::new(&mut self.device, barriers);
        self.allocator.allocate(&mut dev, size)
    }

    fn free_extent(&mut self, offset: u64) -> Result<(), Error> {
        let barriers = self.barriers_enabled();
        let mut dev = Fence::new(&mut self.device, barriers);
        self.allocator.free(&mut dev, offset)
    }

    /// Frees a node's extent, forgetting any cached copy first since the
    /// offset may be recycled.
    fn free_node(&mut self, offset: u64) -> Result<(), Error> {
        if let Some(cache) = &self.cache {
            cache.evict(offset);
        }
        self.free_extent(offset)
    }

    fn read_node(&self, offset: u64) -> Result<Arc<Node>, Error> {
        if let Some(cache) = &self.cache {
            if let Some(node) = cache.get(offset) {
                return Ok(node);
            }
        }
        let mut image = [0; NODE_SIZE];
        self.device.read_exact_at(&mut image, offset)?;
        let node = Arc::new(Node::decode(&image)?);
        if let Some(cache) = &self.cache {
            cache.insert(offset, node.clone());
        }
        Ok(node)
    }

    fn write_node(&mut self, node: &Node, offset: u64) -> Result<(), Error> {
        self.mark = self.mark.wrapping_add(1);
        let image = node.encode(self.mark);
        self.device.write_all_at(&image, offset)?;
        if let Some(cache) = &self.cache {
            cache.insert(offset, Arc::new(node.clone()));
        }
        Ok(())
    }

    /// Allocates an extent for `value` and writes the payload. The extent
    /// stays unreachable until a pointer to it is published.
    fn write_value(&mut self, value: &[u8]) -> Result<u64, Error> {
        let length =
            u32::try_from(value.len()).map_err(|_| Error::from(ErrorKind::AllocationTooLarge))?;
        let offset = self.alloc_extent(length)?;
        self.device.write_all_at(value, offset)?;
        Ok(offset)
    }

    /// Commits a rewrite: barriers the new nodes out, overwrites the single
    /// pointer slot that makes them reachable, and barriers again.
    fn publish(&mut self, link: Backlink, offset: u64) -> Result<(), Error> {
        self.sync()?;
        self.device.write_u64_at(offset, link.slot())?;
        match link {
            Backlink::Root => self.rootptr = offset,
            Backlink::Child { node, .. } => {
                if let Some(cache) = &self.cache {
                    cache.evict(node);
                }
            }
        }
        self.sync()
    }
}

/// Seeds the node mark from the clock and a random source so that node
/// images left behind by a previous process cannot masquerade as freshly
/// written ones.
fn seed_mark() -> u32 {
    let clock = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut rng = WyRand::new();
    rng.generate::<u32>() ^ (clock.as_secs() as u32) ^ clock.subsec_nanos()
}

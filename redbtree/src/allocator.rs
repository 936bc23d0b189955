//! The on-disk space allocator.
//!
//! Extents are carved from a bump area at the tail of the file and recycled
//! through per-size-class free lists. Each size class owns a chain of
//! on-disk blocks holding the offsets of freed extents; the head block of
//! every chain lives at a fixed position inside the file header, and later
//! blocks are themselves extents obtained from this allocator.
//!
//! `free` may need to `allocate` (to grow a chain) and `allocate` may need
//! to `free` (to discard an emptied chain block). The cycle is broken by
//! the special case in [`Allocator::free`]: an extent of the chain-block
//! size class freed while that class's tail block is full becomes the next
//! chain block itself.

use crate::{
    error::{Error, ErrorKind},
    format::{
        class_of, head_block_offset, real_size, BLOCK_ITEMS, BLOCK_NEXT, BLOCK_NUMITEMS,
        BLOCK_PREV, EXTENT_HEADER, FREELIST_BLOCK_ALLOC, FREELIST_BLOCK_ITEMS,
        FREELIST_BLOCK_SIZE, FREELIST_COUNT, HDR_FREEOFF_POS, HDR_FREE_POS, MAX_ALLOC,
        PREALLOC_SIZE,
    },
    io::{Device, DeviceExt, Fence},
};

/// The in-memory index of one size class's on-disk chain.
#[derive(Debug, Default)]
struct FreeList {
    /// Offsets of every block in the chain, head first. Blocks other than
    /// the last are full by construction.
    blocks: Vec<u64>,
    /// Number of live entries in the last block.
    last_items: u32,
}

impl FreeList {
    /// The chain always holds at least its head block once loaded.
    fn tail(&self) -> u64 {
        self.blocks[self.blocks.len() - 1]
    }
}

/// The space allocator state for an open tree.
#[derive(Debug)]
pub(crate) struct Allocator {
    /// Bytes of unallocated space in the bump area.
    free: u64,
    /// File offset where the bump area begins.
    freeoff: u64,
    lists: [FreeList; FREELIST_COUNT],
}

impl Allocator {
    /// Writes an empty allocator layout: no bump window, the bump area
    /// starting at `bump_start`, and every chain reduced to its zeroed head
    /// block. The caller has already resized the file to cover the header
    /// region.
    pub fn format(dev: &mut Fence<'_>, bump_start: u64) -> Result<(), Error> {
        dev.write_u64_at(0, HDR_FREE_POS)?;
        dev.write_u64_at(bump_start, HDR_FREEOFF_POS)?;
        for class in 0..FREELIST_COUNT {
            let block = head_block_offset(class);
            dev.write_u64_at(0, block + BLOCK_PREV)?;
            dev.write_u64_at(0, block + BLOCK_NEXT)?;
            dev.write_u64_at(0, block + BLOCK_NUMITEMS)?;
        }
        Ok(())
    }

    /// Loads the allocator state by walking every chain on disk, verifying
    /// that each block's entry count is possible and that only the tail of
    /// a chain may be partially filled.
    pub fn load(device: &dyn Device) -> Result<Self, Error> {
        let free = device.read_u64_at(HDR_FREE_POS)?;
        let freeoff = device.read_u64_at(HDR_FREEOFF_POS)?;

        let mut lists: [FreeList; FREELIST_COUNT] = std::array::from_fn(|_| FreeList::default());
        for (class, list) in lists.iter_mut().enumerate() {
            let mut block = head_block_offset(class);
            loop {
                let next = device.read_u64_at(block + BLOCK_NEXT)?;
                let numitems = device.read_u64_at(block + BLOCK_NUMITEMS)?;
                if numitems > u64::from(FREELIST_BLOCK_ITEMS) {
                    return Err(Error::data_integrity(format!(
                        "free-list block at {block} claims {numitems} entries"
                    )));
                }
                if next != 0 && numitems != u64::from(FREELIST_BLOCK_ITEMS) {
                    return Err(Error::data_integrity(format!(
                        "free-list block at {block} is not the tail of its chain but holds \
                         {numitems} entries"
                    )));
                }
                list.blocks.push(block);
                list.last_items = numitems as u32;
                if next == 0 {
                    break;
                }
                block = next;
            }
        }

        Ok(Self {
            free,
            freeoff,
            lists,
        })
    }

    /// File offset where the bump area currently begins.
    pub fn bump_offset(&self) -> u64 {
        self.freeoff
    }

    /// Bytes left in the bump window.
    pub fn free_space(&self) -> u64 {
        self.free
    }

    /// Allocates an extent of at least `size` bytes and returns the offset
    /// of its payload. The recorded size is exactly `size`; the extent
    /// footprint is the next power of two that also holds the 8-byte size
    /// header.
    pub fn allocate(&mut self, dev: &mut Fence<'_>, size: u32) -> Result<u64, Error> {
        if u64::from(size) + EXTENT_HEADER > MAX_ALLOC {
            return Err(Error::from(ErrorKind::AllocationTooLarge));
        }
        let real = real_size(size);

        if let Some(ptr) = self.pop(dev, real)? {
            let recorded = dev.read_u64_at(ptr - EXTENT_HEADER)?;
            if recorded != u64::from(size) {
                dev.write_u64_at(u64::from(size), ptr - EXTENT_HEADER)?;
                dev.barrier()?;
            }
            return Ok(ptr);
        }

        // No recycled extent; bump-allocate from the tail, growing the file
        // when the window is exhausted.
        while self.free < real {
            let length = self.freeoff + self.free;
            dev.resize(length + PREALLOC_SIZE)?;
            self.free += PREALLOC_SIZE;
        }
        let ptr = self.freeoff;
        self.free -= real;
        self.freeoff += real;
        dev.write_u64_at(self.free, HDR_FREE_POS)?;
        dev.write_u64_at(self.freeoff, HDR_FREEOFF_POS)?;
        dev.write_u64_at(u64::from(size), ptr)?;
        dev.barrier()?;
        Ok(ptr + EXTENT_HEADER)
    }

    /// Pops a recycled extent of footprint `real` from its class's chain,
    /// or returns `None` when the chain is empty.
    fn pop(&mut self, dev: &mut Fence<'_>, real: u64) -> Result<Option<u64>, Error> {
        let class = class_of(real);
        if self.lists[class].last_items == 0 && self.lists[class].blocks.len() == 1 {
            return Ok(None);
        }

        // An empty tail block is unlinked before anything is popped. The
        // unlinked block is itself storage of the chain-block size class:
        // it either satisfies a request of that class directly or goes back
        // through `free`.
        if self.lists[class].last_items == 0 {
            let list = &mut self.lists[class];
            let prev = list.blocks[list.blocks.len() - 2];
            dev.write_u64_at(0, prev + BLOCK_NEXT)?;
            dev.barrier()?;
            let unlinked = list.blocks.pop().expect("chain holds at least two blocks");
            // The block before the tail is full by construction.
            list.last_items = FREELIST_BLOCK_ITEMS;
            if real == FREELIST_BLOCK_SIZE {
                return Ok(Some(unlinked));
            }
            self.free(dev, unlinked)?;
        }

        let list = &mut self.lists[class];
        let tail = list.tail();
        let entry =
            dev.read_u64_at(tail + BLOCK_ITEMS + 8 * u64::from(list.last_items - 1))?;
        let remaining = list.last_items - 1;
        dev.write_u64_at(u64::from(remaining), tail + BLOCK_NUMITEMS)?;
        dev.barrier()?;
        list.last_items = remaining;
        Ok(Some(entry + EXTENT_HEADER))
    }

    /// Releases the extent whose payload starts at `ptr`, appending it to
    /// the free-list chain of its size class.
    pub fn free(&mut self, dev: &mut Fence<'_>, ptr: u64) -> Result<(), Error> {
        let size = dev.read_u64_at(ptr - EXTENT_HEADER)?;
        if size + EXTENT_HEADER > MAX_ALLOC {
            return Err(Error::data_integrity(format!(
                "extent at {ptr} claims an impossible size of {size} bytes"
            )));
        }
        let real = real_size(size as u32);
        let class = class_of(real);

        if self.lists[class].last_items == FREELIST_BLOCK_ITEMS {
            if real == FREELIST_BLOCK_SIZE {
                // The freed extent is exactly one chain block, and the tail
                // for its class is full. Adopting the extent as the new
                // tail block breaks the cycle where growing the chain would
                // pop from the very list being grown, leaving the previous
                // block short of full.
                let prev = self.lists[class].tail();
                dev.write_u64_at(prev, ptr + BLOCK_PREV)?;
                dev.write_u64_at(0, ptr + BLOCK_NEXT)?;
                dev.write_u64_at(0, ptr + BLOCK_NUMITEMS)?;
                dev.barrier()?;
                dev.write_u64_at(ptr, prev + BLOCK_NEXT)?;
                dev.barrier()?;
                let list = &mut self.lists[class];
                list.blocks.push(ptr);
                list.last_items = 0;
                return Ok(());
            }

            // Grow the chain with a freshly allocated block. Written and
            // flushed in full before the previous tail's next pointer makes
            // it reachable.
            let block = self.allocate(dev, FREELIST_BLOCK_ALLOC)?;
            let prev = self.lists[class].tail();
            dev.write_u64_at(prev, block + BLOCK_PREV)?;
            dev.write_u64_at(0, block + BLOCK_NEXT)?;
            dev.write_u64_at(0, block + BLOCK_NUMITEMS)?;
            dev.barrier()?;
            dev.write_u64_at(block, prev + BLOCK_NEXT)?;
            dev.barrier()?;
            let list = &mut self.lists[class];
            list.blocks.push(block);
            list.last_items = 0;
        }

        let list = &mut self.lists[class];
        let tail = list.tail();
        dev.write_u64_at(
            ptr - EXTENT_HEADER,
            tail + BLOCK_ITEMS + 8 * u64::from(list.last_items),
        )?;
        dev.barrier()?;
        let count = list.last_items + 1;
        dev.write_u64_at(u64::from(count), tail + BLOCK_NUMITEMS)?;
        dev.barrier()?;
        list.last_items = count;
        Ok(())
    }

    /// Reads back the size that was originally requested for the extent
    /// whose payload starts at `ptr`.
    pub fn size_of(device: &dyn Device, ptr: u64) -> Result<u32, Error> {
        let size = device.read_u64_at(ptr - EXTENT_HEADER)?;
        u32::try_from(size).map_err(|_| {
            Error::data_integrity(format!(
                "extent at {ptr} claims an impossible size of {size} bytes"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{format::HDR_ROOTPTR_POS, io::memory::MemoryDevice};

    const BUMP_START: u64 = HDR_ROOTPTR_POS + 8;

    fn formatted(name: &str) -> (MemoryDevice, Allocator) {
        MemoryDevice::delete(name);
        let mut device = MemoryDevice::open(name);
        device.resize(BUMP_START).unwrap();
        let mut fence = Fence::new(&mut device, true);
        Allocator::format(&mut fence, BUMP_START).unwrap();
        let allocator = Allocator::load(&device).unwrap();
        (device, allocator)
    }

    #[test]
    fn records_the_requested_size() {
        let (mut device, mut allocator) = formatted("allocator-sizes");
        let mut fence = Fence::new(&mut device, true);
        for size in [0, 1, 8, 9, 15, 16, 100, 252, 1000, 1016, 1017, 2040, 2041, 4096, 100_000] {
            let ptr = allocator.allocate(&mut fence, size).unwrap();
            assert_eq!(Allocator::size_of(&*fence, ptr).unwrap(), size);
        }
        MemoryDevice::delete("allocator-sizes");
    }

    #[test]
    fn payloads_do_not_overlap() {
        let (mut device, mut allocator) = formatted("allocator-overlap");
        let mut fence = Fence::new(&mut device, true);
        let mut extents = Vec::new();
        for (fill, size) in [(0x11_u8, 40_u32), (0x22, 100), (0x33, 9), (0x44, 300)] {
            let ptr = allocator.allocate(&mut fence, size).unwrap();
            fence.write_all_at(&vec![fill; size as usize], ptr).unwrap();
            extents.push((fill, size, ptr));
        }
        for (fill, size, ptr) in extents {
            let mut buf = vec![0; size as usize];
            fence.read_exact_at(&mut buf, ptr).unwrap();
            assert!(buf.iter().all(|byte| *byte == fill));
        }
        MemoryDevice::delete("allocator-overlap");
    }

    #[test]
    fn rejects_oversized_requests() {
        let (mut device, mut allocator) = formatted("allocator-oversized");
        let mut fence = Fence::new(&mut device, true);
        let too_large = allocator.allocate(&mut fence, 1 << 31).unwrap_err();
        assert!(matches!(too_large.kind, ErrorKind::AllocationTooLarge));
        let off_by_header = allocator
            .allocate(&mut fence, (MAX_ALLOC - EXTENT_HEADER) as u32 + 1)
            .unwrap_err();
        assert!(matches!(off_by_header.kind, ErrorKind::AllocationTooLarge));
        MemoryDevice::delete("allocator-oversized");
    }

    #[test]
    fn freed_extents_are_reused() {
        let (mut device, mut allocator) = formatted("allocator-reuse");
        let mut fence = Fence::new(&mut device, true);

        let first = allocator.allocate(&mut fence, 100).unwrap();
        allocator.free(&mut fence, first).unwrap();
        let bump_before = allocator.bump_offset();

        // Any size in the same class reuses the extent; the recorded size
        // follows the new request.
        let second = allocator.allocate(&mut fence, 120).unwrap();
        assert_eq!(second, first);
        assert_eq!(Allocator::size_of(&*fence, second).unwrap(), 120);
        assert_eq!(allocator.bump_offset(), bump_before);
        MemoryDevice::delete("allocator-reuse");
    }

    #[test]
    fn chains_grow_and_only_the_tail_is_partial() {
        let (mut device, mut allocator) = formatted("allocator-chains");
        let mut fence = Fence::new(&mut device, true);

        let count = u64::from(FREELIST_BLOCK_ITEMS) + 48;
        let mut extents = Vec::new();
        for _ in 0..count {
            extents.push(allocator.allocate(&mut fence, 100).unwrap());
        }
        for ptr in &extents {
            allocator.free(&mut fence, *ptr).unwrap();
        }

        let class = class_of(real_size(100));
        assert_eq!(allocator.lists[class].blocks.len(), 2);
        assert_eq!(allocator.lists[class].last_items, 48);

        // The chain is fully reconstructable from disk, and the non-tail
        // block records exactly its capacity.
        let reloaded = Allocator::load(&*fence).unwrap();
        assert_eq!(
            reloaded.lists[class].blocks,
            allocator.lists[class].blocks
        );
        assert_eq!(reloaded.lists[class].last_items, 48);
        let head = allocator.lists[class].blocks[0];
        assert_eq!(
            fence.read_u64_at(head + BLOCK_NUMITEMS).unwrap(),
            u64::from(FREELIST_BLOCK_ITEMS)
        );
        MemoryDevice::delete("allocator-chains");
    }

    #[test]
    fn balanced_traffic_does_not_grow_the_file() {
        let (mut device, mut allocator) = formatted("allocator-balanced");
        let mut fence = Fence::new(&mut device, true);

        let count = 10_000_u64;
        let mut extents = Vec::new();
        for _ in 0..count {
            extents.push(allocator.allocate(&mut fence, 100).unwrap());
        }
        let after_first_pass = allocator.bump_offset();

        for ptr in extents.iter().rev() {
            allocator.free(&mut fence, *ptr).unwrap();
        }
        let after_free_pass = allocator.bump_offset();
        // Freeing only costs chain blocks.
        assert!(
            after_free_pass - after_first_pass
                <= (count / u64::from(FREELIST_BLOCK_ITEMS) + 1) * FREELIST_BLOCK_SIZE
        );

        for _ in 0..count {
            allocator.allocate(&mut fence, 100).unwrap();
        }
        // The second pass was served entirely from the free lists.
        assert_eq!(allocator.bump_offset(), after_free_pass);
        MemoryDevice::delete("allocator-balanced");
    }

    #[test]
    fn chain_block_sized_extents_become_chain_blocks() {
        let (mut device, mut allocator) = formatted("allocator-special-case");
        let mut fence = Fence::new(&mut device, true);
        let class = class_of(FREELIST_BLOCK_SIZE);

        let count = u64::from(FREELIST_BLOCK_ITEMS) + 1;
        let mut extents = Vec::new();
        for _ in 0..count {
            extents.push(allocator.allocate(&mut fence, 2000).unwrap());
        }
        for ptr in &extents[..extents.len() - 1] {
            allocator.free(&mut fence, *ptr).unwrap();
        }
        assert_eq!(allocator.lists[class].blocks.len(), 1);
        assert_eq!(allocator.lists[class].last_items, FREELIST_BLOCK_ITEMS);

        // The head is full, so the next freed extent of this class is
        // adopted as the new tail block instead of allocating one.
        let adopted = *extents.last().unwrap();
        let bump_before = allocator.bump_offset();
        allocator.free(&mut fence, adopted).unwrap();
        assert_eq!(allocator.bump_offset(), bump_before);
        assert_eq!(allocator.lists[class].blocks.len(), 2);
        assert_eq!(allocator.lists[class].tail(), adopted);
        assert_eq!(allocator.lists[class].last_items, 0);

        // Draining the class hands the adopted block back out through the
        // unlink short-circuit once the tail empties.
        let reclaimed = allocator.allocate(&mut fence, 2000).unwrap();
        assert_eq!(reclaimed, adopted);
        assert_eq!(allocator.lists[class].blocks.len(), 1);
        for _ in 0..FREELIST_BLOCK_ITEMS {
            allocator.allocate(&mut fence, 2000).unwrap();
        }
        assert_eq!(allocator.lists[class].last_items, 0);
        MemoryDevice::delete("allocator-special-case");
    }

    #[test]
    fn bump_window_grows_in_prealloc_chunks() {
        let (mut device, mut allocator) = formatted("allocator-prealloc");
        let mut fence = Fence::new(&mut device, true);

        // Larger than one prealloc chunk: the window grows until it fits.
        let ptr = allocator
            .allocate(&mut fence, PREALLOC_SIZE as u32)
            .unwrap();
        assert_eq!(
            Allocator::size_of(&*fence, ptr).unwrap(),
            PREALLOC_SIZE as u32
        );
        assert_eq!(
            allocator.bump_offset() + allocator.free_space(),
            fence.length().unwrap()
        );
        MemoryDevice::delete("allocator-prealloc");
    }

    #[test]
    fn impossible_chain_metadata_is_rejected() {
        let (mut device, allocator) = formatted("allocator-bad-metadata");
        drop(allocator);
        let mut fence = Fence::new(&mut device, true);
        fence
            .write_u64_at(9999, head_block_offset(3) + BLOCK_NUMITEMS)
            .unwrap();
        assert!(Allocator::load(&*fence).is_err());
        MemoryDevice::delete("allocator-bad-metadata");
    }
}

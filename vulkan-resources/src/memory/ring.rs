use crate::{align_up, DeviceSize, Validated, ValidationError};
use bytemuck::{Pod, Zeroable};
use std::{
    error::Error,
    fmt::{self, Display},
};

/// The size in bytes of the header that precedes every block.
pub const HEADER_SIZE: DeviceSize = 4;

/// The largest arena a [`RingAllocator`] can manage.
pub const MAX_SIZE: DeviceSize = 1 << 30;

const EMPTY_BIT: u32 = 1;

/// An allocator which hands out ranges of a fixed arena in FIFO order, wrapping around at the
/// end.
///
/// The ring is best suited for transient data whose lifetime roughly follows allocation order,
/// like staging uploads or per-frame constants. Allocations may be freed in any order, but space
/// is only reclaimed from the *tail*, meaning the oldest allocation still alive.
///
/// # Algorithm
///
/// The allocator keeps two *virtual* cursors, the head and the tail. Both only ever increase and
/// never wrap, and only their low bits (modulo the arena size) index into the arena. The ring is
/// empty when they are equal and full when they are exactly one arena size apart.
///
/// Every block starts with a 4-byte header stored in the arena itself, holding the length of the
/// block (header included, always a multiple of 4) and a flag telling whether the block has been
/// freed. Allocating writes a header at the head and bumps the head. If the block doesn't fit
/// between the head and the end of the arena, the rest of the arena is covered by an empty
/// padding block and the allocation restarts at the beginning of the arena.
///
/// Freeing only sets the flag. Afterwards the tail walks forward over every freed block, until
/// it reaches one that is still in use or catches up with the head. A single long-lived
/// allocation therefore holds back everything allocated after it, even if that has already been
/// freed. When the ring becomes empty, both cursors jump to the next multiple of the arena size,
/// so that the next allocation can use the whole arena contiguously.
///
/// # Efficiency
///
/// Allocation is *O*(1). Freeing is *O*(*n*) in the number of freed blocks that become
/// reclaimable at once, and *O*(1) amortized.
pub struct RingAllocator {
    arena: Box<[u8]>,
    mask: DeviceSize,
    head: DeviceSize,
    tail: DeviceSize,
}

impl RingAllocator {
    /// Creates a new `RingAllocator` managing an arena of `size` bytes.
    ///
    /// `size` must be a power of two, greater than [`HEADER_SIZE`] and at most [`MAX_SIZE`].
    pub fn new(size: DeviceSize) -> Result<Self, Box<ValidationError>> {
        Self::validate_size(size)?;

        Ok(RingAllocator {
            arena: vec![0; size as usize].into_boxed_slice(),
            mask: size - 1,
            head: 0,
            tail: 0,
        })
    }

    pub(crate) fn validate_size(size: DeviceSize) -> Result<(), Box<ValidationError>> {
        if !size.is_power_of_two() {
            return Err(ValidationError::new("size", "is not a power of two"));
        }

        if size < HEADER_SIZE + 1 {
            return Err(ValidationError::new(
                "size",
                "is too small to hold a single block header",
            ));
        }

        if size > MAX_SIZE {
            return Err(ValidationError::new("size", "is greater than `MAX_SIZE`"));
        }

        Ok(())
    }

    /// Returns the size of the arena in bytes.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.mask + 1
    }

    /// Returns the number of bytes between the tail and the head, headers and padding included.
    #[inline]
    pub fn used_size(&self) -> DeviceSize {
        self.head - self.tail
    }

    /// Returns the number of bytes that are not held by any block.
    ///
    /// Because a block can't straddle the end of the arena, an allocation this big won't
    /// necessarily succeed.
    #[inline]
    pub fn free_size(&self) -> DeviceSize {
        self.size() - self.used_size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.used_size() == self.size()
    }

    /// Returns whether [`allocate`] would currently succeed for `size` bytes, without changing
    /// any state.
    ///
    /// [`allocate`]: Self::allocate
    pub fn can_allocate(&self, size: DeviceSize) -> bool {
        size != 0 && size <= self.size() && self.find_fit(block_size(size)).is_some()
    }

    /// Allocates `size` bytes.
    ///
    /// Returns [`RingAllocatorError::OutOfRingMemory`] if the request doesn't fit at the moment.
    /// This is an expected outcome: the caller can free older allocations and try again.
    pub fn allocate(
        &mut self,
        size: DeviceSize,
    ) -> Result<RingAllocation, Validated<RingAllocatorError>> {
        if size == 0 {
            return Err(Validated::ValidationError(ValidationError::new(
                "size",
                "is zero",
            )));
        }

        if size > self.size() {
            return Err(Validated::Error(RingAllocatorError::OutOfRingMemory));
        }

        let block_size = block_size(size);
        let placement = self
            .find_fit(block_size)
            .ok_or(Validated::Error(RingAllocatorError::OutOfRingMemory))?;

        if placement.start != self.head {
            let real_head = self.head & self.mask;
            self.write_header(real_head, BlockHeader::new(self.size() - real_head, true));
        }

        let real_start = placement.start & self.mask;
        self.write_header(real_start, BlockHeader::new(block_size, false));
        self.head = placement.start + block_size;

        let offset = real_start + HEADER_SIZE;
        tracing::trace!(
            size,
            offset,
            head = self.head,
            tail = self.tail,
            "ring allocate",
        );

        Ok(RingAllocation { offset, size })
    }

    /// Frees `allocation` and reclaims every freed block that is now contiguous with the tail.
    ///
    /// # Panics
    ///
    /// - Panics if `allocation` was not allocated by `self` and doesn't start at a block
    ///   boundary, or if its block has already been freed.
    /// - Panics if the block headers have been corrupted such that the tail overtakes the head.
    pub fn free(&mut self, allocation: RingAllocation) {
        let RingAllocation { offset, size } = allocation;

        assert!(
            offset % HEADER_SIZE == 0 && offset < self.size(),
            "offset {} does not belong to this ring allocator",
            offset,
        );

        // Adding the arena size first keeps blocks at the very start of the arena from
        // underflowing.
        let real_header = (offset + self.size() - HEADER_SIZE) & self.mask;
        let header = self.read_header(real_header);

        assert!(
            !header.is_empty(),
            "the block at offset {} has already been freed",
            offset,
        );

        self.write_header(real_header, BlockHeader::new(header.size(), true));
        tracing::trace!(size, offset, "ring free");

        self.chain_free_blocks();
    }

    /// Frees every allocation at once.
    ///
    /// Any [`RingAllocation`] still held by the caller is invalidated.
    #[inline]
    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Returns the payload of `allocation`.
    #[inline]
    pub fn bytes(&self, allocation: &RingAllocation) -> &[u8] {
        &self.arena[allocation.range()]
    }

    /// Returns the payload of `allocation` mutably.
    #[inline]
    pub fn bytes_mut(&mut self, allocation: &RingAllocation) -> &mut [u8] {
        &mut self.arena[allocation.range()]
    }

    fn find_fit(&self, block_size: DeviceSize) -> Option<Placement> {
        if block_size > self.free_size() {
            return None;
        }

        let size = self.size();
        let real_head = self.head & self.mask;
        let real_tail = self.tail & self.mask;

        if real_head < real_tail {
            // The head already wrapped around, so the only free space is the gap up to the tail.
            (block_size <= real_tail - real_head).then_some(Placement { start: self.head })
        } else if block_size <= size - real_head {
            Some(Placement { start: self.head })
        } else if block_size <= real_tail {
            Some(Placement {
                start: self.head + (size - real_head),
            })
        } else {
            None
        }
    }

    fn chain_free_blocks(&mut self) {
        while self.tail < self.head {
            let header = self.read_header(self.tail & self.mask);

            if !header.is_empty() {
                break;
            }

            if header.size() == 0 {
                self.corrupted();
            }

            self.tail += header.size();
        }

        if self.tail > self.head {
            self.corrupted();
        }

        if self.tail == self.head {
            let next = align_up(self.head, self.size());
            self.head = next;
            self.tail = next;
        }
    }

    #[cold]
    fn corrupted(&self) -> ! {
        tracing::error!(
            head = self.head,
            tail = self.tail,
            "ring allocator corrupted",
        );

        panic!(
            "ring allocator corrupted: tail ({}) went past head ({})",
            self.tail, self.head,
        );
    }

    fn read_header(&self, real_offset: DeviceSize) -> BlockHeader {
        let start = real_offset as usize;

        bytemuck::pod_read_unaligned(&self.arena[start..start + HEADER_SIZE as usize])
    }

    fn write_header(&mut self, real_offset: DeviceSize, header: BlockHeader) {
        let start = real_offset as usize;

        self.arena[start..start + HEADER_SIZE as usize]
            .copy_from_slice(bytemuck::bytes_of(&header));
    }
}

impl fmt::Debug for RingAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingAllocator")
            .field("size", &self.size())
            .field("head", &self.head)
            .field("tail", &self.tail)
            .finish_non_exhaustive()
    }
}

/// A range of a [`RingAllocator`]'s arena.
///
/// The allocation is not `Clone` and is consumed by [`RingAllocator::free`], so it can't be
/// freed twice.
#[derive(Debug, PartialEq, Eq)]
pub struct RingAllocation {
    offset: DeviceSize,
    size: DeviceSize,
}

impl RingAllocation {
    /// Returns the offset of the payload within the arena. The block header sits right before
    /// it.
    #[inline]
    pub fn offset(&self) -> DeviceSize {
        self.offset
    }

    /// Returns the number of bytes that were requested.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    fn range(&self) -> std::ops::Range<usize> {
        self.offset as usize..(self.offset + self.size) as usize
    }
}

/// Error that can be returned when allocating from a [`RingAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingAllocatorError {
    /// There is not enough contiguous space between the head and the tail.
    OutOfRingMemory,
}

impl Error for RingAllocatorError {}

impl Display for RingAllocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfRingMemory => "out of ring memory",
        };

        f.write_str(msg)
    }
}

#[derive(Clone, Copy, Debug)]
struct Placement {
    // Virtual offset of the block header.
    start: DeviceSize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
struct BlockHeader(u32);

impl BlockHeader {
    fn new(size: DeviceSize, empty: bool) -> Self {
        debug_assert!(size % HEADER_SIZE == 0 && size <= MAX_SIZE);

        BlockHeader(size as u32 | if empty { EMPTY_BIT } else { 0 })
    }

    fn size(self) -> DeviceSize {
        DeviceSize::from(self.0 & !0b11)
    }

    fn is_empty(self) -> bool {
        self.0 & EMPTY_BIT != 0
    }
}

fn block_size(size: DeviceSize) -> DeviceSize {
    align_up(size, HEADER_SIZE) + HEADER_SIZE
}

//! Host-side bookkeeping for transient memory.
//!
//! The allocators in this module don't create any Vulkan objects. They hand out offsets into a
//! region that the user can interpret in whichever way they need, for example as offsets into a
//! mapped staging buffer.

pub use self::ring::{RingAllocation, RingAllocator, RingAllocatorError};

pub mod ring;

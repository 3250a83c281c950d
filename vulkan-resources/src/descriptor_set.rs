//! Descriptor sets, preallocated per layout and per frame in flight.
//!
//! A descriptor set can't be rewritten while a command buffer that uses it is executing. The
//! [`DescriptorSetAllocator`] therefore gives every frame in flight its own range of sets: for
//! each distinct [`DescriptorSetLayoutKey`] it builds one descriptor pool holding
//! `max_objects × frames_in_flight` sets and allocates all of them up front.
//!
//! During a frame, [`next_set`] hands out the sets of the current frame slot one after the other.
//! [`begin_frame`] rewinds the slot once the frame that last used it has completed.
//!
//! `max_objects` is a static ceiling. Requesting more sets than that in a single frame is a
//! configuration bug and panics.
//!
//! [`next_set`]: DescriptorSetAllocator::next_set
//! [`begin_frame`]: DescriptorSetAllocator::begin_frame

use crate::{
    cache::KeyedObjectCache, device::DeviceFunctions, Validated, ValidationError, VulkanError,
};
use ash::vk;
use smallvec::SmallVec;
use std::{fmt, sync::Arc};

/// Parameters to create a native descriptor pool.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DescriptorPoolCreateInfo {
    /// The maximum number of descriptor sets that can be allocated from the pool.
    pub max_sets: u32,

    /// The number of descriptors of each type that the pool can hold in total.
    pub pool_sizes: SmallVec<[(vk::DescriptorType, u32); 8]>,
}

impl DescriptorPoolCreateInfo {
    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        if self.max_sets == 0 {
            return Err(ValidationError::new("max_sets", "is zero"));
        }

        for (index, &(_, count)) in self.pool_sizes.iter().enumerate() {
            if count == 0 {
                return Err(ValidationError::new(
                    format!("pool_sizes[{}]", index),
                    "has a descriptor count of zero",
                ));
            }
        }

        Ok(())
    }
}

/// Describes the sets a [`DescriptorSetPool`] holds.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayoutKey {
    /// The layout of every set.
    pub layout: vk::DescriptorSetLayout,

    /// The number of descriptors of each type in a single set.
    pub descriptor_counts: SmallVec<[(vk::DescriptorType, u32); 8]>,
}

impl DescriptorSetLayoutKey {
    /// Returns the pool needed to hold `max_sets` sets of this layout.
    fn pool_create_info(
        &self,
        max_sets: u32,
    ) -> Result<DescriptorPoolCreateInfo, Box<ValidationError>> {
        let mut pool_sizes = SmallVec::with_capacity(self.descriptor_counts.len());

        for (index, &(ty, count)) in self.descriptor_counts.iter().enumerate() {
            if count == 0 {
                return Err(ValidationError::new(
                    format!("descriptor_counts[{}]", index),
                    "has a descriptor count of zero",
                ));
            }

            let Some(pool_count) = count.checked_mul(max_sets) else {
                return Err(ValidationError::new(
                    format!("descriptor_counts[{}]", index),
                    format!(
                        "{} descriptors of type {:?} per set, multiplied by the {} sets of the \
                        pool, overflow a `u32`",
                        count, ty, max_sets,
                    ),
                ));
            };

            pool_sizes.push((ty, pool_count));
        }

        Ok(DescriptorPoolCreateInfo {
            max_sets,
            pool_sizes,
        })
    }
}

/// Parameters to create a new [`DescriptorSetAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorSetAllocatorCreateInfo {
    /// The maximum number of sets of a single layout that can be used during one frame.
    ///
    /// The default value is `256`.
    pub max_objects: u32,

    /// The number of frames that can be in flight at the same time.
    ///
    /// The default value is `2`.
    pub frames_in_flight: u32,
}

impl Default for DescriptorSetAllocatorCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            max_objects: 256,
            frames_in_flight: 2,
        }
    }
}

impl DescriptorSetAllocatorCreateInfo {
    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        if self.max_objects == 0 {
            return Err(ValidationError::new("max_objects", "is zero"));
        }

        if self.frames_in_flight == 0 {
            return Err(ValidationError::new("frames_in_flight", "is zero"));
        }

        let max_sets = self.max_objects.checked_mul(self.frames_in_flight);

        if max_sets.is_none() {
            return Err(ValidationError::new(
                "max_objects",
                "multiplied by `frames_in_flight` overflows a `u32`",
            ));
        }

        Ok(())
    }
}

/// A descriptor pool together with all the sets allocated from it.
pub struct DescriptorSetPool {
    pool: vk::DescriptorPool,
    // `max_objects` sets per frame slot, slot after slot.
    sets: Vec<vk::DescriptorSet>,
    max_objects: u32,
    cursors: SmallVec<[u32; 4]>,
}

impl DescriptorSetPool {
    /// Returns the native pool.
    #[inline]
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Returns every set of `frame_slot`.
    pub fn frame_sets(&self, frame_slot: u32) -> &[vk::DescriptorSet] {
        let start = (frame_slot * self.max_objects) as usize;

        &self.sets[start..start + self.max_objects as usize]
    }

    /// Returns how many sets of `frame_slot` have been handed out since it was last rewound.
    #[inline]
    pub fn used(&self, frame_slot: u32) -> u32 {
        self.cursors[frame_slot as usize]
    }
}

impl fmt::Debug for DescriptorSetPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorSetPool")
            .field("pool", &self.pool)
            .field("sets", &self.sets.len())
            .field("cursors", &self.cursors)
            .finish()
    }
}

/// Builds one [`DescriptorSetPool`] per distinct [`DescriptorSetLayoutKey`] and hands out its
/// sets frame by frame.
pub struct DescriptorSetAllocator {
    device: Arc<dyn DeviceFunctions>,
    max_objects: u32,
    frames_in_flight: u32,
    pools: KeyedObjectCache<DescriptorSetLayoutKey, DescriptorSetPool>,
}

impl DescriptorSetAllocator {
    /// Creates a new `DescriptorSetAllocator`. No pool is built until a key is requested.
    pub fn new(
        device: Arc<dyn DeviceFunctions>,
        create_info: DescriptorSetAllocatorCreateInfo,
    ) -> Result<Self, Box<ValidationError>> {
        create_info
            .validate()
            .map_err(|err| err.add_context("create_info"))?;

        let DescriptorSetAllocatorCreateInfo {
            max_objects,
            frames_in_flight,
        } = create_info;

        Ok(DescriptorSetAllocator {
            device,
            max_objects,
            frames_in_flight,
            pools: KeyedObjectCache::new(),
        })
    }

    #[inline]
    pub fn max_objects(&self) -> u32 {
        self.max_objects
    }

    #[inline]
    pub fn frames_in_flight(&self) -> u32 {
        self.frames_in_flight
    }

    /// Returns the number of pools that have been built.
    #[inline]
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Returns the pool for `key`, building it and allocating all of its sets first if needed.
    ///
    /// # Safety
    ///
    /// - `key.layout` must be a valid descriptor set layout of the device, and its bindings must
    ///   hold exactly the descriptors listed in `key.descriptor_counts`.
    pub unsafe fn get_or_build(
        &mut self,
        key: &DescriptorSetLayoutKey,
    ) -> Result<&DescriptorSetPool, Validated<VulkanError>> {
        unsafe { self.get_or_build_mut(key) }.map(|pool| &*pool)
    }

    /// Returns the next unused set of `key` for `frame_slot`.
    ///
    /// # Safety
    ///
    /// - Everything required by [`get_or_build`](Self::get_or_build).
    ///
    /// # Panics
    ///
    /// - Panics if `frame_slot` is not less than `frames_in_flight`.
    /// - Panics if more than `max_objects` sets of `key` are requested for `frame_slot` without
    ///   calling [`begin_frame`](Self::begin_frame) in between.
    pub unsafe fn next_set(
        &mut self,
        key: &DescriptorSetLayoutKey,
        frame_slot: u32,
    ) -> Result<vk::DescriptorSet, Validated<VulkanError>> {
        self.check_frame_slot(frame_slot);

        let max_objects = self.max_objects;
        let pool = unsafe { self.get_or_build_mut(key) }?;
        let cursor = &mut pool.cursors[frame_slot as usize];

        if *cursor >= max_objects {
            panic!(
                "more than `max_objects` ({}) descriptor sets of layout {:?} were requested in a \
                single frame",
                max_objects, key.layout,
            );
        }

        let index = frame_slot * max_objects + *cursor;
        *cursor += 1;

        Ok(pool.sets[index as usize])
    }

    /// Makes every set of `frame_slot` available again.
    ///
    /// # Panics
    ///
    /// - Panics if `frame_slot` is not less than `frames_in_flight`.
    pub fn begin_frame(&mut self, frame_slot: u32) {
        self.check_frame_slot(frame_slot);

        for pool in self.pools.values_mut() {
            pool.cursors[frame_slot as usize] = 0;
        }
    }

    /// Destroys every pool, and with them every set.
    ///
    /// # Safety
    ///
    /// - None of the sets may be in use by the device.
    pub unsafe fn invalidate_all(&mut self) {
        if !self.pools.is_empty() {
            tracing::debug!(count = self.pools.len(), "invalidating descriptor pools");
        }

        let device = &self.device;
        self.pools
            .invalidate_all(|_, pool| unsafe { device.destroy_descriptor_pool(pool.pool) });
    }

    fn check_frame_slot(&self, frame_slot: u32) {
        assert!(
            frame_slot < self.frames_in_flight,
            "frame slot {} is out of range for {} frames in flight",
            frame_slot,
            self.frames_in_flight,
        );
    }

    unsafe fn get_or_build_mut(
        &mut self,
        key: &DescriptorSetLayoutKey,
    ) -> Result<&mut DescriptorSetPool, Validated<VulkanError>> {
        let device = &self.device;
        let max_objects = self.max_objects;
        let frames_in_flight = self.frames_in_flight;

        self.pools.get_or_try_insert(key, |key| unsafe {
            build_pool(&**device, key, max_objects, frames_in_flight)
        })
    }
}

unsafe fn build_pool(
    device: &dyn DeviceFunctions,
    key: &DescriptorSetLayoutKey,
    max_objects: u32,
    frames_in_flight: u32,
) -> Result<DescriptorSetPool, Validated<VulkanError>> {
    // Cannot overflow, checked when the allocator was created.
    let max_sets = max_objects * frames_in_flight;
    let create_info = key
        .pool_create_info(max_sets)
        .map_err(|err| err.add_context("key"))?;
    debug_assert!(create_info.validate().is_ok());

    let pool = unsafe { device.create_descriptor_pool(&create_info) }?;
    let layouts = vec![key.layout; max_sets as usize];

    let sets = match unsafe { device.allocate_descriptor_sets(pool, &layouts) } {
        Ok(sets) => sets,
        Err(err) => {
            unsafe { device.destroy_descriptor_pool(pool) };
            return Err(err.into());
        }
    };

    tracing::debug!(
        ?pool,
        layout = ?key.layout,
        max_sets,
        "built descriptor pool",
    );

    Ok(DescriptorSetPool {
        pool,
        sets,
        max_objects,
        cursors: (0..frames_in_flight).map(|_| 0).collect(),
    })
}

impl Drop for DescriptorSetAllocator {
    fn drop(&mut self) {
        unsafe { self.invalidate_all() };
    }
}

impl fmt::Debug for DescriptorSetAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorSetAllocator")
            .field("max_objects", &self.max_objects)
            .field("frames_in_flight", &self.frames_in_flight)
            .field("pools", &self.pools)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{Call, MockDevice};
    use ash::vk::Handle;
    use smallvec::smallvec;

    fn key(layout: u64) -> DescriptorSetLayoutKey {
        DescriptorSetLayoutKey {
            layout: vk::DescriptorSetLayout::from_raw(layout),
            descriptor_counts: smallvec![
                (vk::DescriptorType::UNIFORM_BUFFER, 1),
                (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 2),
            ],
        }
    }

    fn allocator(device: &Arc<MockDevice>, max_objects: u32) -> DescriptorSetAllocator {
        DescriptorSetAllocator::new(
            device.clone(),
            DescriptorSetAllocatorCreateInfo {
                max_objects,
                frames_in_flight: 2,
            },
        )
        .unwrap()
    }

    #[test]
    fn create_info_validation() {
        let device = MockDevice::new();

        for (max_objects, frames_in_flight, context) in [
            (0, 2, "create_info.max_objects"),
            (4, 0, "create_info.frames_in_flight"),
            (u32::MAX, 2, "create_info.max_objects"),
        ] {
            let err = DescriptorSetAllocator::new(
                device.clone(),
                DescriptorSetAllocatorCreateInfo {
                    max_objects,
                    frames_in_flight,
                },
            )
            .unwrap_err();
            assert_eq!(err.context, context);
        }
    }

    #[test]
    fn pool_is_sized_for_every_frame_in_flight() {
        let device = MockDevice::new();
        let mut allocator = allocator(&device, 4);

        let pool = unsafe { allocator.get_or_build(&key(1)) }.unwrap().handle();

        assert_eq!(
            device.calls(),
            [
                Call::CreateDescriptorPool(DescriptorPoolCreateInfo {
                    max_sets: 8,
                    pool_sizes: smallvec![
                        (vk::DescriptorType::UNIFORM_BUFFER, 8),
                        (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 16),
                    ],
                }),
                Call::AllocateDescriptorSets { pool, count: 8 },
            ],
        );
    }

    #[test]
    fn each_key_is_built_once() {
        let device = MockDevice::new();
        let mut allocator = allocator(&device, 4);

        let a = unsafe { allocator.get_or_build(&key(1)) }.unwrap().handle();
        let b = unsafe { allocator.get_or_build(&key(1)) }.unwrap().handle();
        let c = unsafe { allocator.get_or_build(&key(2)) }.unwrap().handle();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(allocator.len(), 2);
        assert_eq!(
            device.count(|call| matches!(call, Call::CreateDescriptorPool(_))),
            2,
        );
    }

    #[test]
    fn frame_slots_hand_out_disjoint_sets() {
        let device = MockDevice::new();
        let mut allocator = allocator(&device, 2);
        let key = key(1);

        let slot0 = [
            unsafe { allocator.next_set(&key, 0) }.unwrap(),
            unsafe { allocator.next_set(&key, 0) }.unwrap(),
        ];
        let slot1 = unsafe { allocator.next_set(&key, 1) }.unwrap();

        assert_ne!(slot0[0], slot0[1]);
        assert!(!slot0.contains(&slot1));

        let pool = unsafe { allocator.get_or_build(&key) }.unwrap();
        assert_eq!(pool.frame_sets(0), slot0);
        assert_eq!(pool.used(0), 2);
        assert_eq!(pool.used(1), 1);

        allocator.begin_frame(0);
        assert_eq!(unsafe { allocator.next_set(&key, 0) }.unwrap(), slot0[0]);
        assert_eq!(unsafe { allocator.get_or_build(&key) }.unwrap().used(1), 1);
    }

    #[test]
    #[should_panic(expected = "more than `max_objects` (2)")]
    fn exceeding_max_objects_panics() {
        let device = MockDevice::new();
        let mut allocator = allocator(&device, 2);

        for _ in 0..3 {
            unsafe { allocator.next_set(&key(1), 0) }.unwrap();
        }
    }

    #[test]
    fn frame_slot_out_of_range_panics() {
        let device = MockDevice::new();
        let mut allocator = allocator(&device, 2);

        assert_should_panic!("out of range", {
            allocator.begin_frame(2);
        });
    }

    #[test]
    fn failed_set_allocation_destroys_the_pool() {
        let device = MockDevice::new();
        let mut allocator = allocator(&device, 2);

        device.fail_on(
            |call| matches!(call, Call::AllocateDescriptorSets { .. }),
            VulkanError::OutOfPoolMemory,
        );
        assert_eq!(
            unsafe { allocator.next_set(&key(1), 0) },
            Err(Validated::Error(VulkanError::OutOfPoolMemory)),
        );
        assert_eq!(allocator.len(), 0);
        assert_eq!(
            device.count(|call| matches!(call, Call::DestroyDescriptorPool(_))),
            1,
        );

        assert!(unsafe { allocator.next_set(&key(1), 0) }.is_ok());
    }

    #[test]
    fn descriptor_counts_are_validated_before_building() {
        let device = MockDevice::new();
        let mut allocator = allocator(&device, 2);

        let overflowing = DescriptorSetLayoutKey {
            layout: vk::DescriptorSetLayout::from_raw(1),
            descriptor_counts: smallvec![(vk::DescriptorType::STORAGE_BUFFER, u32::MAX)],
        };
        match unsafe { allocator.next_set(&overflowing, 0) } {
            Err(Validated::ValidationError(err)) => {
                assert_eq!(err.context, "key.descriptor_counts[0]");
                assert!(err.problem.contains("overflow"));
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let empty_binding = DescriptorSetLayoutKey {
            layout: vk::DescriptorSetLayout::from_raw(2),
            descriptor_counts: smallvec![
                (vk::DescriptorType::UNIFORM_BUFFER, 1),
                (vk::DescriptorType::SAMPLER, 0),
            ],
        };
        match unsafe { allocator.get_or_build(&empty_binding) } {
            Err(Validated::ValidationError(err)) => {
                assert_eq!(err.context, "key.descriptor_counts[1]");
            }
            other => panic!("unexpected result: {:?}", other.map(|pool| pool.handle())),
        }

        assert!(device.calls().is_empty());
        assert_eq!(allocator.len(), 0);
    }

    #[test]
    fn invalidate_all_destroys_every_pool() {
        let device = MockDevice::new();
        let mut allocator = allocator(&device, 2);
        unsafe { allocator.get_or_build(&key(1)) }.unwrap();
        unsafe { allocator.get_or_build(&key(2)) }.unwrap();

        unsafe { allocator.invalidate_all() };
        assert_eq!(allocator.len(), 0);
        assert_eq!(
            device.count(|call| matches!(call, Call::DestroyDescriptorPool(_))),
            2,
        );

        drop(allocator);
        assert_eq!(
            device.count(|call| matches!(call, Call::DestroyDescriptorPool(_))),
            2,
        );
    }
}

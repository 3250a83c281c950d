//! Content-addressed vertex and index buffers.
//!
//! Geometry that doesn't change between frames is usually resubmitted every frame anyway. The
//! [`BufferCache`] hashes each payload and hands back the buffer that was uploaded for the same
//! bytes in a previous frame, so that only new data is ever uploaded.
//!
//! Buffers are evicted at frame boundaries: a buffer that was not requested during a whole frame
//! is destroyed once that frame has completed on the device.

use super::{staging::Upload, RawBuffer};
use crate::{
    device::DeviceFunctions,
    sync::{CompletedFrame, FrameInFlight},
    Validated, ValidationError, VulkanError,
};
use ash::vk;
use foldhash::{quality::FixedState, HashMap};
use smallvec::SmallVec;
use std::{fmt, hash::BuildHasher, sync::Arc};

const HASH_SEED: u64 = 0x6c62_272e_07bb_0142;

/// Deduplicates per-frame buffer uploads by content.
///
/// Payloads are keyed by a 64-bit hash. Entries that share a hash also compare their bytes, so
/// two different payloads never share a buffer even if their hashes collide.
///
/// # Frame protocol
///
/// 1. Call [`get_or_create`] for every payload the frame draws with.
/// 2. Call [`finish_frame`] with the fence that the frame's submission signals.
/// 3. Once the frame has completed, call [`post_frame`] with the [`CompletedFrame`] obtained
///    from the returned [`FrameInFlight`]. Every buffer that was not requested during the frame
///    is destroyed and the per-frame counters are cleared.
///
/// Requesting buffers between steps 2 and 3 is an error, since eviction would not account for
/// those requests.
///
/// [`get_or_create`]: Self::get_or_create
/// [`finish_frame`]: Self::finish_frame
/// [`post_frame`]: Self::post_frame
pub struct BufferCache {
    device: Arc<dyn DeviceFunctions>,
    entries: HashMap<u64, SmallVec<[Entry; 1]>>,
    hash_state: FixedState,
    generation: u64,
    awaiting_completion: bool,
}

struct Entry {
    data: Box<[u8]>,
    usage: vk::BufferUsageFlags,
    buffer: RawBuffer,
    invocations: u32,
}

impl BufferCache {
    /// Creates an empty `BufferCache`.
    pub fn new(device: Arc<dyn DeviceFunctions>) -> Self {
        BufferCache {
            device,
            entries: HashMap::default(),
            hash_state: FixedState::with_seed(HASH_SEED),
            generation: 0,
            awaiting_completion: false,
        }
    }

    /// Returns the generation of the frame currently being recorded.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the number of cached buffers.
    pub fn len(&self) -> usize {
        self.entries.values().map(SmallVec::len).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns a buffer holding `data` with `usage`, uploading it through `uploader` if no
    /// buffer with the same bytes and usage is cached.
    ///
    /// The caller keeps ownership of `data`. On a hit nothing is copied; on a miss the cache
    /// keeps its own copy for comparisons.
    pub fn get_or_create(
        &mut self,
        uploader: &mut dyn Upload,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> Result<vk::Buffer, Validated<VulkanError>> {
        if self.awaiting_completion {
            return Err(ValidationError::new(
                "self",
                "the frame has been finished and `post_frame` has not been called yet",
            )
            .into());
        }

        let hash = self.hash_state.hash_one(data);

        if let Some(entry) = self.find_mut(hash, data, usage) {
            entry.invocations += 1;

            return Ok(entry.buffer.handle());
        }

        let buffer = uploader.stage_and_copy(data, usage)?;
        let handle = buffer.handle();
        tracing::debug!(hash, size = data.len(), buffer = ?handle, "cached new buffer");

        self.entries.entry(hash).or_default().push(Entry {
            data: data.into(),
            usage,
            buffer,
            invocations: 1,
        });

        Ok(handle)
    }

    /// Returns how many times `data` with `usage` has been requested in the current frame, or
    /// `None` if it isn't cached.
    pub fn invocation_count(&self, data: &[u8], usage: vk::BufferUsageFlags) -> Option<u32> {
        let hash = self.hash_state.hash_one(data);

        self.entries
            .get(&hash)?
            .iter()
            .find(|entry| entry.usage == usage && *entry.data == *data)
            .map(|entry| entry.invocations)
    }

    /// Ends the frame being recorded. `fence` is the fence that the frame's submission signals,
    /// or null if the caller tracks completion some other way.
    pub fn finish_frame(
        &mut self,
        fence: vk::Fence,
    ) -> Result<FrameInFlight, Box<ValidationError>> {
        if self.awaiting_completion {
            return Err(ValidationError::new(
                "self",
                "the previous frame has not been passed to `post_frame` yet",
            ));
        }

        self.awaiting_completion = true;

        Ok(FrameInFlight::new(self.generation, fence))
    }

    /// Evicts every buffer that was not requested during the completed frame, clears the
    /// per-frame counters and starts recording the next frame.
    pub fn post_frame(&mut self, completed: CompletedFrame) -> Result<(), Box<ValidationError>> {
        if !self.awaiting_completion {
            return Err(ValidationError::new(
                "self",
                "no frame has been finished with `finish_frame`",
            ));
        }

        if completed.generation() != self.generation {
            return Err(ValidationError::new(
                "completed",
                format!(
                    "is for frame {}, but frame {} is awaiting completion",
                    completed.generation(),
                    self.generation,
                ),
            ));
        }

        let mut evicted = 0usize;

        for list in self.entries.values_mut() {
            let mut index = 0;

            while index < list.len() {
                if list[index].invocations < 1 {
                    let entry = list.swap_remove(index);
                    // SAFETY: The buffer was last used by a frame that has completed.
                    unsafe { self.device.destroy_buffer(entry.buffer) };
                    evicted += 1;
                } else {
                    list[index].invocations = 0;
                    index += 1;
                }
            }
        }

        self.entries.retain(|_, list| !list.is_empty());
        tracing::debug!(
            generation = self.generation,
            evicted,
            "buffer cache post frame",
        );

        self.generation += 1;
        self.awaiting_completion = false;

        Ok(())
    }

    /// Destroys every cached buffer.
    ///
    /// # Safety
    ///
    /// - None of the cached buffers may be in use by the device.
    pub unsafe fn clear(&mut self) {
        for (_, list) in self.entries.drain() {
            for entry in list {
                unsafe { self.device.destroy_buffer(entry.buffer) };
            }
        }
    }

    fn find_mut(
        &mut self,
        hash: u64,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> Option<&mut Entry> {
        self.entries
            .get_mut(&hash)?
            .iter_mut()
            .find(|entry| entry.usage == usage && *entry.data == *data)
    }
}

impl Drop for BufferCache {
    fn drop(&mut self) {
        // The owner waits for the device to be idle before tearing the cache down.
        unsafe { self.clear() };
    }
}

impl fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferCache")
            .field("len", &self.len())
            .field("generation", &self.generation)
            .field("awaiting_completion", &self.awaiting_completion)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{Call, MockDevice, MockUploader};

    const VERTEX: vk::BufferUsageFlags = vk::BufferUsageFlags::VERTEX_BUFFER;

    fn complete(cache: &mut BufferCache) {
        let frame = cache.finish_frame(vk::Fence::null()).unwrap();
        let completed = unsafe { frame.assume_completed() };
        cache.post_frame(completed).unwrap();
    }

    #[test]
    fn same_payload_same_buffer() {
        let device = MockDevice::new();
        let mut uploader = MockUploader::new(&device);
        let mut cache = BufferCache::new(device.clone());

        let a = cache
            .get_or_create(&mut uploader, &[1, 2, 3], VERTEX)
            .unwrap();
        let b = cache
            .get_or_create(&mut uploader, &[1, 2, 3], VERTEX)
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(uploader.uploads(), 1);
        assert_eq!(cache.invocation_count(&[1, 2, 3], VERTEX), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn different_payload_or_usage_different_buffer() {
        let device = MockDevice::new();
        let mut uploader = MockUploader::new(&device);
        let mut cache = BufferCache::new(device.clone());

        let a = cache
            .get_or_create(&mut uploader, &[1, 2, 3], VERTEX)
            .unwrap();
        let b = cache
            .get_or_create(&mut uploader, &[1, 2, 4], VERTEX)
            .unwrap();
        let index = vk::BufferUsageFlags::INDEX_BUFFER;
        let c = cache
            .get_or_create(&mut uploader, &[1, 2, 3], index)
            .unwrap();

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(uploader.uploads(), 3);
    }

    #[test]
    fn unused_buffers_are_evicted_after_the_frame() {
        let device = MockDevice::new();
        let mut uploader = MockUploader::new(&device);
        let mut cache = BufferCache::new(device.clone());

        let kept = cache
            .get_or_create(&mut uploader, &[1; 16], VERTEX)
            .unwrap();
        cache
            .get_or_create(&mut uploader, &[1; 16], VERTEX)
            .unwrap();
        let dropped = cache
            .get_or_create(&mut uploader, &[2; 16], VERTEX)
            .unwrap();
        complete(&mut cache);

        // Both were requested during the first frame.
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.invocation_count(&[1; 16], VERTEX), Some(0));

        assert_eq!(
            cache.get_or_create(&mut uploader, &[1; 16], VERTEX),
            Ok(kept),
        );
        complete(&mut cache);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.invocation_count(&[2; 16], VERTEX), None);
        assert_eq!(
            device.calls_matching(|call| matches!(call, Call::DestroyBuffer(_))),
            [Call::DestroyBuffer(dropped)],
        );

        complete(&mut cache);
        assert!(cache.is_empty());
        assert_eq!(uploader.uploads(), 2);
    }

    #[test]
    fn requests_between_finish_and_post_are_rejected() {
        let device = MockDevice::new();
        let mut uploader = MockUploader::new(&device);
        let mut cache = BufferCache::new(device.clone());

        let frame = cache.finish_frame(vk::Fence::null()).unwrap();

        assert!(matches!(
            cache.get_or_create(&mut uploader, &[1], VERTEX),
            Err(Validated::ValidationError(_)),
        ));
        assert!(cache.finish_frame(vk::Fence::null()).is_err());

        let completed = unsafe { frame.assume_completed() };
        cache.post_frame(completed).unwrap();
        assert_eq!(cache.generation(), 1);
        assert!(cache.get_or_create(&mut uploader, &[1], VERTEX).is_ok());
    }

    #[test]
    fn stale_completion_tokens_are_rejected() {
        let device = MockDevice::new();
        let mut cache = BufferCache::new(device.clone());

        assert!(cache
            .post_frame(unsafe { FrameInFlight::new(0, vk::Fence::null()).assume_completed() })
            .is_err());

        let first = cache.finish_frame(vk::Fence::null()).unwrap();
        let completed = unsafe { first.assume_completed() };
        cache.post_frame(completed).unwrap();

        let _second = cache.finish_frame(vk::Fence::null()).unwrap();
        let err = cache
            .post_frame(unsafe { first.assume_completed() })
            .unwrap_err();
        assert_eq!(err.context, "completed");
    }

    #[test]
    fn failed_upload_caches_nothing() {
        let device = MockDevice::new();
        let mut uploader = MockUploader::new(&device);
        let mut cache = BufferCache::new(device.clone());

        uploader.fail_next(VulkanError::OutOfDeviceMemory);
        assert_eq!(
            cache.get_or_create(&mut uploader, &[5; 4], VERTEX),
            Err(Validated::Error(VulkanError::OutOfDeviceMemory)),
        );
        assert!(cache.is_empty());
        assert_eq!(cache.invocation_count(&[5; 4], VERTEX), None);
    }

    #[test]
    fn drop_destroys_all_buffers() {
        let device = MockDevice::new();
        let mut uploader = MockUploader::new(&device);
        let mut cache = BufferCache::new(device.clone());

        cache.get_or_create(&mut uploader, &[1], VERTEX).unwrap();
        cache.get_or_create(&mut uploader, &[2], VERTEX).unwrap();
        drop(cache);

        assert_eq!(
            device.count(|call| matches!(call, Call::DestroyBuffer(_))),
            2,
        );
    }
}

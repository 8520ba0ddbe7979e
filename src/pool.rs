//! Frame buffer pool
//!
//! An arena of reusable buffers addressed by slot index. `acquire` moves a
//! slot's storage out into a [`PooledBuffer`]; dropping the buffer (or
//! passing it to [`FramePool::release`]) moves the storage back and puts the
//! slot on the free list. Since storage is moved rather than shared, two
//! live buffers can never alias the same memory.
//!
//! Storage is zeroed only when a slot is reused for a different format or
//! size. The pool grows on demand up to `max_buffers` slots; past that
//! `acquire` fails and the caller drops the frame.

use bytemuck::Pod;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use crate::media::{PixelFormat, WireFormat};

/// Identifies the layout a buffer was last used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub format: u32,
    pub width: u32,
    pub height: u32,
}

impl PoolKey {
    pub fn video(format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            format: format.tag(),
            width,
            height,
        }
    }

    pub fn wire(format: WireFormat, width: u32, height: u32) -> Self {
        Self {
            format: format.tag(),
            width,
            height,
        }
    }

    /// Audio buffers: `width` is the channel count, `height` the samples per channel.
    pub fn audio(channels: u16, samples_per_channel: u32) -> Self {
        Self {
            format: u32::from_le_bytes(*b"F32A"),
            width: channels as u32,
            height: samples_per_channel,
        }
    }
}

/// Requested buffer layout and element count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
    pub key: PoolKey,
    pub len: usize,
}

impl BufferSpec {
    pub fn new(key: PoolKey, len: usize) -> Self {
        Self { key, len }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("pool '{pool}' reached its ceiling of {ceiling} buffers")]
    Exhausted { pool: String, ceiling: usize },
}

/// Index-based handle into the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    pub index: u32,
    pub generation: u32,
}

struct Slot<T> {
    data: Option<Vec<T>>,
    key: Option<PoolKey>,
    generation: u32,
}

struct PoolState<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
}

struct PoolInner<T> {
    name: String,
    max_buffers: usize,
    state: Mutex<PoolState<T>>,
}

impl<T> PoolInner<T> {
    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn give_back(&self, handle: BufferHandle, data: Vec<T>) {
        let mut state = self.lock();
        let index = handle.index as usize;
        if let Some(slot) = state.slots.get_mut(index) {
            if slot.generation == handle.generation && slot.data.is_none() {
                slot.data = Some(data);
                state.free.push(index);
            }
        }
    }
}

/// Shared, thread-safe buffer pool.
pub struct FramePool<T: Pod> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Pod> Clone for FramePool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Pod> FramePool<T> {
    pub fn new(name: impl Into<String>, max_buffers: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                max_buffers: max_buffers.max(1),
                state: Mutex::new(PoolState {
                    slots: Vec::new(),
                    free: Vec::new(),
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn max_buffers(&self) -> usize {
        self.inner.max_buffers
    }

    /// Grow the pool to at least `count` free buffers shaped like `spec`.
    pub fn preallocate(&self, spec: &BufferSpec, count: usize) -> Result<(), PoolError> {
        let mut state = self.inner.lock();
        while state.free.len() < count {
            if state.slots.len() >= self.inner.max_buffers {
                return Err(self.exhausted());
            }
            let index = state.slots.len();
            state.slots.push(Slot {
                data: Some(vec![T::zeroed(); spec.len]),
                key: Some(spec.key),
                generation: 0,
            });
            state.free.push(index);
        }
        Ok(())
    }

    /// Take a free buffer matching `spec`, growing the pool if needed.
    pub fn acquire(&self, spec: &BufferSpec) -> Result<PooledBuffer<T>, PoolError> {
        let mut state = self.inner.lock();

        // Prefer a free slot that already holds this layout
        let position = state
            .free
            .iter()
            .rposition(|&i| {
                let slot = &state.slots[i];
                slot.key == Some(spec.key)
                    && slot.data.as_ref().map(Vec::len) == Some(spec.len)
            })
            .or_else(|| state.free.len().checked_sub(1));

        let index = match position {
            Some(pos) => state.free.swap_remove(pos),
            None => {
                if state.slots.len() >= self.inner.max_buffers {
                    return Err(self.exhausted());
                }
                state.slots.push(Slot {
                    data: Some(Vec::new()),
                    key: None,
                    generation: 0,
                });
                state.slots.len() - 1
            }
        };

        let slot = &mut state.slots[index];
        let mut data = slot.data.take().unwrap_or_default();
        if slot.key != Some(spec.key) || data.len() != spec.len {
            data.clear();
            data.resize(spec.len, T::zeroed());
            slot.key = Some(spec.key);
        }
        slot.generation = slot.generation.wrapping_add(1);

        let handle = BufferHandle {
            index: index as u32,
            generation: slot.generation,
        };
        Ok(PooledBuffer {
            data,
            key: Some(spec.key),
            handle: Some(handle),
            pool: Some(Arc::clone(&self.inner)),
        })
    }

    /// Return a buffer to the free list. Equivalent to dropping it.
    pub fn release(&self, buffer: PooledBuffer<T>) {
        drop(buffer);
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Buffers currently handed out.
    pub fn live_count(&self) -> usize {
        let state = self.inner.lock();
        state.slots.len() - state.free.len()
    }

    /// Slots allocated so far.
    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }

    fn exhausted(&self) -> PoolError {
        PoolError::Exhausted {
            pool: self.inner.name.clone(),
            ceiling: self.inner.max_buffers,
        }
    }
}

/// A buffer checked out of a [`FramePool`], or a detached host buffer.
pub struct PooledBuffer<T: Pod> {
    data: Vec<T>,
    key: Option<PoolKey>,
    handle: Option<BufferHandle>,
    pool: Option<Arc<PoolInner<T>>>,
}

impl<T: Pod> PooledBuffer<T> {
    /// Wrap storage that does not belong to any pool.
    pub fn detached(data: Vec<T>) -> Self {
        Self {
            data,
            key: None,
            handle: None,
            pool: None,
        }
    }

    pub fn handle(&self) -> Option<BufferHandle> {
        self.handle
    }

    pub fn key(&self) -> Option<PoolKey> {
        self.key
    }

    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }
}

impl<T: Pod> Deref for PooledBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.data
    }
}

impl<T: Pod> DerefMut for PooledBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T: Pod> Drop for PooledBuffer<T> {
    fn drop(&mut self) {
        if let (Some(pool), Some(handle)) = (self.pool.take(), self.handle) {
            pool.give_back(handle, std::mem::take(&mut self.data));
        }
    }
}

impl<T: Pod> std::fmt::Debug for PooledBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgba_spec(width: u32, height: u32) -> BufferSpec {
        BufferSpec::new(
            PoolKey::video(PixelFormat::Rgba8, width, height),
            (width * height * 4) as usize,
        )
    }

    #[test]
    fn test_acquire_release_restores_free_count() {
        let pool: FramePool<u8> = FramePool::new("video", 8);
        pool.preallocate(&rgba_spec(16, 16), 2).unwrap();

        for spec in [rgba_spec(16, 16), rgba_spec(64, 32), rgba_spec(2, 2)] {
            let before = pool.free_count();
            let live_before = pool.live_count();
            let buffer = pool.acquire(&spec).unwrap();
            assert_eq!(buffer.len(), spec.len);
            pool.release(buffer);
            assert_eq!(pool.free_count(), before);
            assert_eq!(pool.live_count(), live_before);
            assert_eq!(pool.capacity(), 2);
        }
    }

    #[test]
    fn test_live_buffers_never_alias() {
        let pool: FramePool<u8> = FramePool::new("video", 4);
        let spec = rgba_spec(4, 4);
        let mut a = pool.acquire(&spec).unwrap();
        let mut b = pool.acquire(&spec).unwrap();
        assert_ne!(a.handle().unwrap().index, b.handle().unwrap().index);
        assert_ne!(a.as_ptr(), b.as_ptr());
        a[0] = 1;
        b[0] = 2;
        assert_eq!(a[0], 1);
    }

    #[test]
    fn test_reuse_zeroes_only_on_format_change() {
        let pool: FramePool<u8> = FramePool::new("video", 1);
        let spec = rgba_spec(4, 4);

        let mut buffer = pool.acquire(&spec).unwrap();
        buffer.fill(7);
        drop(buffer);

        // Same layout: contents survive
        let buffer = pool.acquire(&spec).unwrap();
        assert!(buffer.iter().all(|&b| b == 7));
        drop(buffer);

        // Different format, same size: zeroed
        let other = BufferSpec::new(PoolKey::video(PixelFormat::Bgra8, 4, 4), spec.len);
        let buffer = pool.acquire(&other).unwrap();
        assert!(buffer.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_ceiling_reports_exhaustion() {
        let pool: FramePool<f32> = FramePool::new("audio", 2);
        let spec = BufferSpec::new(PoolKey::audio(2, 480), 960);
        let _a = pool.acquire(&spec).unwrap();
        let _b = pool.acquire(&spec).unwrap();
        let err = pool.acquire(&spec).unwrap_err();
        assert_eq!(
            err,
            PoolError::Exhausted {
                pool: "audio".to_string(),
                ceiling: 2
            }
        );
        drop(_a);
        assert!(pool.acquire(&spec).is_ok());
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool: FramePool<u8> = FramePool::new("video", 4);
        let spec = rgba_spec(8, 8);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        if let Ok(buffer) = pool.acquire(&spec) {
                            assert_eq!(buffer.len(), spec.len);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.free_count(), pool.capacity());
    }

    #[test]
    fn test_detached_buffer_is_not_pooled() {
        let buffer = PooledBuffer::detached(vec![1u8, 2, 3]);
        assert!(!buffer.is_pooled());
        assert_eq!(&buffer[..], &[1, 2, 3]);
    }
}

use std::sync::atomic::{AtomicIsize, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};

use wavry_xr::{DecodedImage, TrackingFrameIndex, NULL_FRAME_INDEX};

pub const VIDEO_TEXTURE_COUNT: usize = 2;

const NO_TEXTURE: isize = -1;

/// Double buffered video textures shared by the decode consumer and the renderer.
///
/// The writer fills the slot after the published one, then publishes it by
/// index. The published frame index is kept in an atomic next to the slots, so
/// `video_frame_index` never touches a slot lock and the renderer repeats the
/// last frame when nothing new arrived.
#[derive(Debug)]
pub struct VideoTextureRing {
    slots: [Mutex<Option<DecodedImage>>; VIDEO_TEXTURE_COUNT],
    write_index: AtomicUsize,
    render_index: AtomicIsize,
    render_frame_index: AtomicU64,
}

impl Default for VideoTextureRing {
    fn default() -> Self {
        Self {
            slots: [Mutex::new(None), Mutex::new(None)],
            write_index: AtomicUsize::new(0),
            render_index: AtomicIsize::new(NO_TEXTURE),
            render_frame_index: AtomicU64::new(NULL_FRAME_INDEX),
        }
    }
}

fn lock(slot: &Mutex<Option<DecodedImage>>) -> MutexGuard<'_, Option<DecodedImage>> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl VideoTextureRing {
    pub fn update(&self, image: DecodedImage) {
        let index = self.write_index.load(Ordering::Acquire);
        let frame_index = image.frame_index;
        *lock(&self.slots[index]) = Some(image);
        self.write_index
            .store((index + 1) % VIDEO_TEXTURE_COUNT, Ordering::Release);
        self.render_index.store(index as isize, Ordering::Release);
        self.render_frame_index.store(frame_index, Ordering::Release);
    }

    fn published(&self) -> Option<usize> {
        let index = self.render_index.load(Ordering::Acquire);
        (index != NO_TEXTURE).then_some(index as usize)
    }

    /// Most recently published image.
    pub fn latest(&self) -> Option<DecodedImage> {
        let index = self.published()?;
        match self.slots[index].try_lock() {
            Ok(slot) => slot.clone(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().clone(),
            // The writer lapped this slot, the newer image is published in the other one.
            Err(TryLockError::WouldBlock) => lock(&self.slots[self.published()?]).clone(),
        }
    }

    /// Frame index of the published image. Lock free.
    pub fn video_frame_index(&self) -> Option<TrackingFrameIndex> {
        let frame_index = self.render_frame_index.load(Ordering::Acquire);
        (frame_index != NULL_FRAME_INDEX).then_some(frame_index)
    }

    pub fn clear(&self) {
        self.render_frame_index
            .store(NULL_FRAME_INDEX, Ordering::Release);
        self.render_index.store(NO_TEXTURE, Ordering::Release);
        self.write_index.store(0, Ordering::Release);
        for slot in &self.slots {
            *lock(slot) = None;
        }
    }
}

//! Display surface the codec renders decoded images into.
//!
//! Released output buffers come back here as images on a separate path from
//! the output-buffer events. The listener thread recovers each image's frame
//! index and publishes it to the graphics device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};

use wavry_xr::{DecodedImage, GraphicsDevice, ImageData};

use crate::backend::CALLBACK_ENQUEUE_TIMEOUT;
use crate::frame_index_map::FrameIndexMap;
use crate::{DecoderError, DecoderResult};

/// Images the surface can hold before the producer has to wait.
pub const MAX_IMAGE_COUNT: usize = 5;

const LISTENER_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SurfaceImage {
    pub timestamp_ns: u64,
    pub width: u32,
    pub height: u32,
    pub data: ImageData,
}

/// Producer side given to the codec backend.
#[derive(Debug, Clone)]
pub struct SurfaceHandle {
    tx: Sender<SurfaceImage>,
}

impl SurfaceHandle {
    /// Image-ready callback. Returns false when the image was dropped.
    pub fn present(&self, image: SurfaceImage) -> bool {
        match self.tx.send_timeout(image, CALLBACK_ENQUEUE_TIMEOUT) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    "display surface full, dropping image at {} ns",
                    err.into_inner().timestamp_ns
                );
                false
            }
        }
    }
}

struct ListenerShared {
    frame_index_map: Arc<FrameIndexMap>,
    graphics: Arc<dyn GraphicsDevice>,
    closed: AtomicBool,
    // Held only while an image is resolved and published, so teardown waits for it.
    destroy_lock: Mutex<()>,
}

impl ListenerShared {
    fn on_image_available(&self, image: SurfaceImage) {
        let _guard = match self.destroy_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let pts_us = image.timestamp_ns / 1000;
        let Some(frame_index) = self.frame_index_map.get_and_clear(pts_us) else {
            warn!("image listener: unknown frame index for pts: {pts_us} us, frame ignored");
            return;
        };

        self.graphics.update_video_texture(DecodedImage {
            frame_index,
            timestamp_ns: image.timestamp_ns,
            width: image.width,
            height: image.height,
            data: image.data,
        });
    }
}

pub struct DisplaySurface {
    handle: SurfaceHandle,
    shared: Arc<ListenerShared>,
    listener: Option<JoinHandle<()>>,
}

impl DisplaySurface {
    pub fn new(
        frame_index_map: Arc<FrameIndexMap>,
        graphics: Arc<dyn GraphicsDevice>,
    ) -> DecoderResult<Self> {
        let (tx, rx) = bounded(MAX_IMAGE_COUNT);
        let shared = Arc::new(ListenerShared {
            frame_index_map,
            graphics,
            closed: AtomicBool::new(false),
            destroy_lock: Mutex::new(()),
        });

        let listener = thread::Builder::new()
            .name("wavry-xr-image-listener".to_string())
            .spawn({
                let shared = shared.clone();
                move || listen(shared, rx)
            })
            .map_err(|_| DecoderError::SurfaceUnavailable)?;

        Ok(Self {
            handle: SurfaceHandle { tx },
            shared,
            listener: Some(listener),
        })
    }

    pub fn handle(&self) -> SurfaceHandle {
        self.handle.clone()
    }

    pub fn frame_index_map(&self) -> &Arc<FrameIndexMap> {
        &self.shared.frame_index_map
    }

    /// Stops publishing. Waits for an in-progress image callback to finish.
    pub fn close(&mut self) {
        {
            let _guard = match self.shared.destroy_lock.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            self.shared.closed.store(true, Ordering::Release);
        }
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
    }
}

impl Drop for DisplaySurface {
    fn drop(&mut self) {
        self.close();
    }
}

fn listen(shared: Arc<ListenerShared>, rx: Receiver<SurfaceImage>) {
    while !shared.closed.load(Ordering::Acquire) {
        match rx.recv_timeout(LISTENER_POLL) {
            Ok(image) => shared.on_image_available(image),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("image listener exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::texture_ring::VideoTextureRing;
    use bytes::Bytes;
    use std::time::Instant;
    use wavry_xr::{FoveatedDecodeParams, TrackingFrameIndex};

    #[derive(Default)]
    struct RingGraphics {
        ring: VideoTextureRing,
    }

    impl GraphicsDevice for RingGraphics {
        fn update_video_texture(&self, image: DecodedImage) {
            self.ring.update(image);
        }
        fn set_foveated_decode(&self, _params: Option<FoveatedDecodeParams>) {}
        fn clear_video_textures(&self) {
            self.ring.clear();
        }
        fn video_frame_index(&self) -> Option<TrackingFrameIndex> {
            self.ring.video_frame_index()
        }
    }

    fn image(timestamp_ns: u64) -> SurfaceImage {
        SurfaceImage {
            timestamp_ns,
            width: 4,
            height: 4,
            data: ImageData::Cpu {
                bytes: Bytes::from_static(&[0; 64]),
                stride: 16,
            },
        }
    }

    fn wait_for(graphics: &RingGraphics, frame_index: u64) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if graphics.video_frame_index() == Some(frame_index) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_publishes_resolved_image() {
        let map = Arc::new(FrameIndexMap::new(64));
        let graphics = Arc::new(RingGraphics::default());
        let surface = DisplaySurface::new(map.clone(), graphics.clone()).unwrap();

        map.set(1_500, 21);
        assert!(surface.handle().present(image(1_500_999)));
        assert!(wait_for(&graphics, 21));
        assert_eq!(map.get(1_500), None);
    }

    #[test]
    fn test_unresolved_image_is_dropped() {
        let map = Arc::new(FrameIndexMap::new(64));
        let graphics = Arc::new(RingGraphics::default());
        let surface = DisplaySurface::new(map.clone(), graphics.clone()).unwrap();

        assert!(surface.handle().present(image(77_000)));
        map.set(78, 5);
        surface.handle().present(image(78_000));
        assert!(wait_for(&graphics, 5));
        assert_eq!(graphics.ring.latest().map(|i| i.timestamp_ns), Some(78_000));
    }

    #[test]
    fn test_closed_surface_ignores_images() {
        let map = Arc::new(FrameIndexMap::new(64));
        let graphics = Arc::new(RingGraphics::default());
        let mut surface = DisplaySurface::new(map.clone(), graphics.clone()).unwrap();
        let handle = surface.handle();
        surface.close();

        map.set(9, 3);
        handle.present(image(9_000));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(graphics.video_frame_index(), None);
        assert_eq!(map.get(9), Some(3));
    }
}

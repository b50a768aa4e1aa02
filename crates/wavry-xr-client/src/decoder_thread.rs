use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};

use tracing::{error, info, warn};
use wavry_xr::{ClientContext, DecoderConfig, LatencySink, XrRuntime};
use wavry_xr_decoder::{create_decoder_plugin, BackendFactory, DecoderPlugin, RunCtx};

use crate::protocol::VideoFrameHeader;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone)]
pub struct DecoderThreadCtx {
    pub config: DecoderConfig,
    pub runtime: Arc<dyn XrRuntime>,
    pub client: Arc<dyn ClientContext>,
    pub latency: Arc<dyn LatencySink>,
    pub backend: BackendFactory,
}

/// Owns a decoder plugin and the thread draining its output.
#[derive(Default)]
pub struct DecoderThread {
    running: Arc<AtomicBool>,
    plugin: RwLock<Option<Arc<dyn DecoderPlugin>>>,
    client: RwLock<Option<Arc<dyn ClientContext>>>,
    last_packet_counter: Mutex<Option<u32>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DecoderThread {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn start(&self, ctx: DecoderThreadCtx) {
        self.stop();

        let backend = match (ctx.backend)() {
            Ok(backend) => backend,
            Err(err) => {
                error!("failed to create decoder backend: {err}");
                return;
            }
        };
        let plugin = create_decoder_plugin(
            RunCtx {
                config: ctx.config,
                runtime: ctx.runtime,
                client: Some(ctx.client.clone()),
                latency: Some(ctx.latency),
            },
            backend,
        );

        *write(&self.client) = Some(ctx.client);
        *lock(&self.last_packet_counter) = None;
        self.running.store(true, Ordering::Release);

        let spawned = thread::Builder::new()
            .name("wavry-xr-decoder".to_string())
            .spawn({
                let plugin = plugin.clone();
                let running = self.running.clone();
                move || {
                    if !plugin.run(&running) {
                        error!("decoder run loop failed");
                    }
                }
            });
        match spawned {
            Ok(handle) => {
                *write(&self.plugin) = Some(plugin);
                *lock(&self.handle) = Some(handle);
                info!("decoder thread started");
            }
            Err(err) => {
                error!("failed to spawn decoder thread: {err}");
                self.running.store(false, Ordering::Release);
                plugin.stop();
            }
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = lock(&self.handle).take() {
            let _ = handle.join();
        }
        if let Some(plugin) = write(&self.plugin).take() {
            plugin.stop();
            info!("decoder thread stopped");
        }
    }

    /// Submits one video packet. Returns false when it was dropped.
    pub fn queue_packet(&self, header: &VideoFrameHeader, payload: &[u8]) -> bool {
        let plugin = match self.plugin.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(plugin) = plugin else {
            return false;
        };

        self.track_packet_loss(header.packet_counter);
        plugin.queue_packet(payload, header.tracking_frame_index)
    }

    fn track_packet_loss(&self, packet_counter: u32) {
        let previous = lock(&self.last_packet_counter).replace(packet_counter);
        let Some(previous) = previous else {
            return;
        };
        if packet_counter == previous.wrapping_add(1) {
            return;
        }

        let client = match self.client.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(client) = client {
            // One request per loss episode, the next IDR clears the flag.
            if !client.is_waiting_next_idr() {
                warn!(
                    "video packet loss ({previous} -> {packet_counter}), requesting IDR"
                );
                client.set_waiting_next_idr(true);
                client.request_idr();
            }
        }
    }
}

impl Drop for DecoderThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use tracing::debug;
use wavry_xr::{LatencySink, TimeSync, TrackingFrameIndex, NULL_FRAME_INDEX};

use crate::protocol::{TIME_SYNC_PING, TIME_SYNC_REPLY, TIME_SYNC_RESULT};

const SLOT_COUNT: usize = 256;
const DECODE_LATENCY_SMOOTHING: f64 = 0.1;

#[derive(Debug, Clone, Copy)]
struct FrameTimes {
    frame_index: TrackingFrameIndex,
    received_us: Option<u64>,
    decoder_input_us: Option<u64>,
}

impl FrameTimes {
    const EMPTY: Self = Self {
        frame_index: NULL_FRAME_INDEX,
        received_us: None,
        decoder_input_us: None,
    };

    fn fresh(frame_index: TrackingFrameIndex) -> Self {
        Self {
            frame_index,
            ..Self::EMPTY
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyStats {
    pub frames_received: u64,
    pub frames_decoded: u64,
    pub frames_rendered: u64,
    pub last_decode_us: Option<u64>,
    pub avg_decode_us: Option<f64>,
    /// Receive to render of the last rendered frame.
    pub last_total_us: Option<u64>,
    pub rtt_us: Option<u64>,
    /// Server clock minus client clock.
    pub clock_offset_us: Option<i64>,
}

/// Per-frame stage timestamps, shared by the decoder, renderer and network paths.
#[derive(Debug)]
pub struct LatencyCollector {
    origin: Instant,
    slots: Mutex<Vec<FrameTimes>>,
    stats: Mutex<LatencyStats>,
}

impl Default for LatencyCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl LatencyCollector {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            slots: Mutex::new(vec![FrameTimes::EMPTY; SLOT_COUNT]),
            stats: Mutex::new(LatencyStats::default()),
        }
    }

    pub fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    pub fn stats(&self) -> LatencyStats {
        *lock(&self.stats)
    }

    /// Runs `update` on the slot owned by `frame_index`, claiming it when `claim` is set.
    fn with_slot(
        &self,
        frame_index: TrackingFrameIndex,
        claim: bool,
        update: impl FnOnce(&mut FrameTimes),
    ) {
        let mut slots = lock(&self.slots);
        let slot = &mut slots[(frame_index % SLOT_COUNT as u64) as usize];
        if slot.frame_index != frame_index {
            if !claim {
                return;
            }
            *slot = FrameTimes::fresh(frame_index);
        }
        update(slot);
    }

    pub fn received(&self, frame_index: TrackingFrameIndex) {
        let now = self.now_us();
        self.with_slot(frame_index, true, |slot| slot.received_us = Some(now));
        lock(&self.stats).frames_received += 1;
    }

    pub fn rendered(&self, frame_index: TrackingFrameIndex) {
        let now = self.now_us();
        let mut received = None;
        self.with_slot(frame_index, false, |slot| received = slot.received_us);
        let mut stats = lock(&self.stats);
        stats.frames_rendered += 1;
        if let Some(received) = received {
            stats.last_total_us = Some(now.saturating_sub(received));
        }
    }

    /// Handles an inbound time sync, returning the reply to send upstream if any.
    pub fn on_time_sync(&self, sync: &TimeSync) -> Option<TimeSync> {
        let now = self.now_us();
        match sync.mode {
            TIME_SYNC_PING => Some(TimeSync {
                mode: TIME_SYNC_REPLY,
                sequence: sync.sequence,
                server_time_us: sync.server_time_us,
                client_time_us: now,
            }),
            TIME_SYNC_RESULT => {
                let rtt = now.saturating_sub(sync.client_time_us);
                // Wire values are untrusted, i128 holds any u64 difference.
                let midpoint = sync.client_time_us as i128 + (rtt / 2) as i128;
                let offset = (sync.server_time_us as i128 - midpoint)
                    .clamp(i64::MIN as i128, i64::MAX as i128) as i64;
                debug!(rtt_us = rtt, offset_us = offset, "time sync");
                let mut stats = lock(&self.stats);
                stats.rtt_us = Some(rtt);
                stats.clock_offset_us = Some(offset);
                None
            }
            _ => None,
        }
    }
}

impl LatencySink for LatencyCollector {
    fn decoder_input(&self, frame_index: TrackingFrameIndex) {
        let now = self.now_us();
        self.with_slot(frame_index, true, |slot| slot.decoder_input_us = Some(now));
    }

    fn decoder_output(&self, frame_index: TrackingFrameIndex) {
        let now = self.now_us();
        let mut decode_us = None;
        self.with_slot(frame_index, false, |slot| {
            decode_us = slot.decoder_input_us.map(|input| now.saturating_sub(input));
        });

        let mut stats = lock(&self.stats);
        stats.frames_decoded += 1;
        if let Some(decode_us) = decode_us {
            stats.last_decode_us = Some(decode_us);
            stats.avg_decode_us = Some(match stats.avg_decode_us {
                Some(avg) => avg + (decode_us as f64 - avg) * DECODE_LATENCY_SMOOTHING,
                None => decode_us as f64,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_decode_latency_recorded() {
        let collector = LatencyCollector::new();
        collector.received(7);
        collector.decoder_input(7);
        thread::sleep(Duration::from_millis(2));
        collector.decoder_output(7);

        let stats = collector.stats();
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.frames_decoded, 1);
        assert!(stats.last_decode_us.unwrap() >= 2_000);
        assert_eq!(stats.avg_decode_us, stats.last_decode_us.map(|v| v as f64));
    }

    #[test]
    fn test_output_without_input_skips_latency() {
        let collector = LatencyCollector::new();
        collector.decoder_output(3);
        let stats = collector.stats();
        assert_eq!(stats.frames_decoded, 1);
        assert_eq!(stats.last_decode_us, None);
    }

    #[test]
    fn test_slot_reuse_drops_stale_frame() {
        let collector = LatencyCollector::new();
        collector.decoder_input(1);
        collector.decoder_input(1 + SLOT_COUNT as u64);
        collector.decoder_output(1);
        assert_eq!(collector.stats().last_decode_us, None);
    }

    #[test]
    fn test_ping_is_answered() {
        let collector = LatencyCollector::new();
        let reply = collector
            .on_time_sync(&TimeSync {
                mode: TIME_SYNC_PING,
                sequence: 4,
                server_time_us: 10_000,
                client_time_us: 0,
            })
            .unwrap();
        assert_eq!(reply.mode, TIME_SYNC_REPLY);
        assert_eq!(reply.sequence, 4);
        assert_eq!(reply.server_time_us, 10_000);
    }

    #[test]
    fn test_result_updates_offset() {
        let collector = LatencyCollector::new();
        thread::sleep(Duration::from_millis(1));
        let sent = collector.now_us();
        assert!(collector
            .on_time_sync(&TimeSync {
                mode: TIME_SYNC_RESULT,
                sequence: 1,
                server_time_us: sent + 50_000,
                client_time_us: sent,
            })
            .is_none());
        let stats = collector.stats();
        assert!(stats.rtt_us.is_some());
        let offset = stats.clock_offset_us.unwrap();
        assert!(offset <= 50_000 && offset > 40_000);
    }

    #[test]
    fn test_result_with_extreme_timestamps() {
        let collector = LatencyCollector::new();
        for (server_time_us, client_time_us) in [
            (i64::MAX as u64, u64::MAX),
            (u64::MAX, 0),
            (0, u64::MAX),
            (u64::MAX, u64::MAX),
        ] {
            assert!(collector
                .on_time_sync(&TimeSync {
                    mode: TIME_SYNC_RESULT,
                    sequence: 0,
                    server_time_us,
                    client_time_us,
                })
                .is_none());
            assert!(collector.stats().clock_offset_us.is_some());
        }

        collector.on_time_sync(&TimeSync {
            mode: TIME_SYNC_RESULT,
            sequence: 1,
            server_time_us: u64::MAX,
            client_time_us: 0,
        });
        assert_eq!(collector.stats().clock_offset_us, Some(i64::MAX));

        collector.on_time_sync(&TimeSync {
            mode: TIME_SYNC_RESULT,
            sequence: 2,
            server_time_us: 0,
            client_time_us: u64::MAX,
        });
        assert_eq!(collector.stats().clock_offset_us, Some(i64::MIN));
    }
}

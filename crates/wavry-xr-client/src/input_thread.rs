use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use wavry_xr::{
    ClientContext, EyeFov, EyeInfo, PoseFilter, PoseFilterParams, TrackingInfo, XrRuntime,
};

/// Smallest IPD or FOV change (meters, radians) worth a new view config.
pub const EYE_INFO_THRESHOLD: f32 = 0.01;

/// Input is sampled at this multiple of the display refresh rate.
pub const SAMPLES_PER_FRAME: f32 = 3.0;

const DEFAULT_FRAME_RATE: f32 = 90.0;
const MIN_FILTER_DT: f32 = 1e-4;

pub fn target_frame_duration(frame_rate: f32) -> Duration {
    let micros = (1.0 / (frame_rate * SAMPLES_PER_FRAME)) * 1e6;
    Duration::from_micros(micros.max(1.0) as u64)
}

/// Next deadline after `next`, skipping whole intervals that already passed.
pub fn next_wake_time(next: Instant, now: Instant, period: Duration) -> Instant {
    if next > now {
        return next;
    }
    let period_ns = period.as_nanos().max(1);
    let missed = (now - next).as_nanos() / period_ns + 1;
    now + Duration::from_nanos((missed * period_ns) as u64)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug)]
struct TrackingFilters {
    head: PoseFilter,
    hands: [PoseFilter; 2],
    last_sample: Option<Instant>,
}

impl TrackingFilters {
    fn new(params: PoseFilterParams) -> Self {
        Self {
            head: PoseFilter::new(params),
            hands: [PoseFilter::new(params); 2],
            last_sample: None,
        }
    }

    fn reset(&mut self) {
        self.head.reset();
        for hand in &mut self.hands {
            hand.reset();
        }
        self.last_sample = None;
    }

    fn apply(&mut self, info: &mut TrackingInfo, now: Instant) {
        let dt = match self.last_sample.replace(now) {
            Some(last) => now.duration_since(last).as_secs_f32().max(MIN_FILTER_DT),
            // First sample after a reset passes straight through.
            None => MIN_FILTER_DT,
        };
        info.head = self.head.filter(dt, info.head);
        for (pose, filter) in info.hands.iter_mut().zip(self.hands.iter_mut()) {
            match pose {
                Some(pose) => *pose = filter.filter(dt, *pose),
                None => filter.reset(),
            }
        }
    }
}

struct Shared {
    target_duration_us: AtomicU64,
    connected: AtomicBool,
    client_prediction: AtomicBool,
    running: AtomicBool,
    last_eye_info: Mutex<EyeInfo>,
    filters: Mutex<TrackingFilters>,
}

#[derive(Clone)]
pub struct InputCtx {
    pub runtime: Arc<dyn XrRuntime>,
    pub client: Arc<dyn ClientContext>,
}

/// Samples tracking at a fixed multiple of the refresh rate and ships it upstream.
pub struct InputThread {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Default for InputThread {
    fn default() -> Self {
        Self::new(PoseFilterParams::default())
    }
}

impl InputThread {
    pub fn new(filter_params: PoseFilterParams) -> Self {
        let thread = Self {
            shared: Arc::new(Shared {
                target_duration_us: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                client_prediction: AtomicBool::new(false),
                running: AtomicBool::new(false),
                last_eye_info: Mutex::new(EyeInfo::ZERO),
                filters: Mutex::new(TrackingFilters::new(filter_params)),
            }),
            handle: None,
        };
        thread.set_target_frame_rate(DEFAULT_FRAME_RATE);
        thread
    }

    /// Clears the last sent view config; dropping the connection also discards filter history.
    pub fn set_connected(&self, connected: bool) -> &Self {
        *lock(&self.shared.last_eye_info) = EyeInfo::ZERO;
        let was_connected = self.shared.connected.swap(connected, Ordering::AcqRel);
        if was_connected && !connected {
            lock(&self.shared.filters).reset();
        }
        self
    }

    pub fn set_client_prediction(&self, client_prediction: bool) -> &Self {
        self.shared
            .client_prediction
            .store(client_prediction, Ordering::Release);
        self
    }

    pub fn set_target_frame_rate(&self, frame_rate: f32) -> &Self {
        let target = target_frame_duration(frame_rate);
        self.shared
            .target_duration_us
            .store(target.as_micros() as u64, Ordering::Release);
        self
    }

    pub fn target_duration(&self) -> Duration {
        Duration::from_micros(self.shared.target_duration_us.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn start(&mut self, ctx: InputCtx) {
        self.stop();
        self.shared.running.store(true, Ordering::Release);
        let shared = self.shared.clone();
        match thread::Builder::new()
            .name("wavry-xr-input".to_string())
            .spawn(move || run(&shared, &ctx))
        {
            Ok(handle) => self.handle = Some(handle),
            Err(err) => {
                warn!("failed to spawn input thread: {err}");
                self.shared.running.store(false, Ordering::Release);
            }
        }
    }

    pub fn stop(&mut self) {
        self.shared.connected.store(false, Ordering::Release);
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for InputThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: &Shared, ctx: &InputCtx) {
    debug!("input thread started");
    let mut next_wake = Instant::now();
    while shared.running.load(Ordering::Acquire) {
        update(shared, ctx);

        let period = Duration::from_micros(shared.target_duration_us.load(Ordering::Acquire));
        next_wake = next_wake_time(next_wake + period, Instant::now(), period);
        thread::sleep(next_wake.saturating_duration_since(Instant::now()));
    }
    debug!("input thread exiting");
}

fn update(shared: &Shared, ctx: &InputCtx) {
    let connected = shared.connected.load(Ordering::Acquire);

    if connected {
        if let Some(eye_info) = ctx.runtime.eye_info() {
            let mut last = lock(&shared.last_eye_info);
            if eye_info.differs_from(&last, EYE_INFO_THRESHOLD) {
                *last = eye_info;
                drop(last);
                ctx.client.views_config_send(&eye_info);
                log_view_config(&eye_info);
            }
        }
    }

    ctx.runtime.poll_actions();
    if !connected {
        return;
    }

    let prediction = shared.client_prediction.load(Ordering::Acquire);
    let Some(mut info) = ctx.runtime.tracking_info(prediction) else {
        return;
    };
    lock(&shared.filters).apply(&mut info, Instant::now());
    ctx.client.input_send(&info);
}

fn fov_degrees(fov: &EyeFov) -> String {
    format!(
        "{{ left: {:.2}, right: {:.2}, top: {:.2}, bottom: {:.2} }}",
        fov.left.to_degrees(),
        fov.right.to_degrees(),
        fov.top.to_degrees(),
        fov.bottom.to_degrees()
    )
}

fn log_view_config(eye_info: &EyeInfo) {
    info!(
        ipd_mm = eye_info.ipd * 1000.0,
        left_eye = %fov_degrees(&eye_info.eye_fov[0]),
        right_eye = %fov_degrees(&eye_info.eye_fov[1]),
        "new view config sent"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use wavry_xr::{GraphicsDevice, Pose, RenderMode, TimeSync, TrackingFrameIndex};

    #[derive(Default)]
    struct CountingRuntime {
        polls: AtomicUsize,
    }

    impl XrRuntime for CountingRuntime {
        fn set_render_mode(&self, _mode: RenderMode) {}
        fn render_mode(&self) -> RenderMode {
            RenderMode::Lobby
        }
        fn eye_info(&self) -> Option<EyeInfo> {
            let mut eye = EyeInfo::ZERO;
            eye.ipd = 0.064;
            eye.eye_fov[0].left = -0.9;
            eye.eye_fov[1].left = -0.8;
            Some(eye)
        }
        fn poll_actions(&self) {
            self.polls.fetch_add(1, Ordering::SeqCst);
        }
        fn tracking_info(&self, _client_prediction: bool) -> Option<TrackingInfo> {
            Some(TrackingInfo {
                target_timestamp_us: 0,
                head: Pose::IDENTITY,
                hands: [Some(Pose::IDENTITY), None],
            })
        }
        fn render_frame(&self) -> Option<TrackingFrameIndex> {
            None
        }
        fn graphics(&self) -> Option<Arc<dyn GraphicsDevice>> {
            None
        }
    }

    #[derive(Default)]
    struct CountingClient {
        inputs: AtomicUsize,
        views: AtomicUsize,
    }

    impl ClientContext for CountingClient {
        fn input_send(&self, _info: &TrackingInfo) {
            self.inputs.fetch_add(1, Ordering::SeqCst);
        }
        fn views_config_send(&self, _eye_info: &EyeInfo) {
            self.views.fetch_add(1, Ordering::SeqCst);
        }
        fn time_sync_send(&self, _sync: &TimeSync) {}
        fn request_idr(&self) {}
        fn set_waiting_next_idr(&self, _waiting: bool) {}
        fn is_waiting_next_idr(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_target_duration() {
        assert_eq!(target_frame_duration(90.0), Duration::from_micros(3703));
        assert_eq!(target_frame_duration(60.0), Duration::from_micros(5555));
    }

    #[test]
    fn test_next_wake_time_skips_missed_intervals() {
        let t0 = Instant::now();
        let period = Duration::from_millis(10);

        let ahead = t0 + Duration::from_millis(10);
        assert_eq!(next_wake_time(ahead, t0 + Duration::from_millis(5), period), ahead);

        let now = t0 + Duration::from_millis(35);
        assert_eq!(
            next_wake_time(ahead, now, period),
            now + Duration::from_millis(30)
        );
        assert_eq!(next_wake_time(now, now, period), now + period);
    }

    fn start(runtime: Arc<CountingRuntime>, client: Arc<CountingClient>) -> InputThread {
        let mut thread = InputThread::default();
        thread.set_target_frame_rate(200.0);
        thread.start(InputCtx { runtime, client });
        thread
    }

    #[test]
    fn test_disconnected_only_polls() {
        let runtime = Arc::new(CountingRuntime::default());
        let client = Arc::new(CountingClient::default());
        let mut thread = start(runtime.clone(), client.clone());
        std::thread::sleep(Duration::from_millis(50));
        thread.stop();

        assert!(runtime.polls.load(Ordering::SeqCst) > 1);
        assert_eq!(client.inputs.load(Ordering::SeqCst), 0);
        assert_eq!(client.views.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_connected_sends_tracking_and_view_once() {
        let runtime = Arc::new(CountingRuntime::default());
        let client = Arc::new(CountingClient::default());
        let mut thread = start(runtime.clone(), client.clone());
        thread.set_connected(true);
        std::thread::sleep(Duration::from_millis(50));

        assert!(client.inputs.load(Ordering::SeqCst) > 1);
        assert_eq!(client.views.load(Ordering::SeqCst), 1);

        // Reconnecting forgets the last view config.
        thread.set_connected(false).set_connected(true);
        std::thread::sleep(Duration::from_millis(30));
        thread.stop();
        assert!(client.views.load(Ordering::SeqCst) >= 2);
        assert!(!thread.is_running());
    }

    #[test]
    fn test_filters_pass_first_sample_through() {
        let mut filters = TrackingFilters::new(PoseFilterParams::default());
        let mut info = TrackingInfo {
            target_timestamp_us: 0,
            head: Pose {
                position: glam::Vec3::new(1.0, 2.0, 3.0),
                orientation: glam::Quat::IDENTITY,
            },
            hands: [None, None],
        };
        let raw = info;
        filters.apply(&mut info, Instant::now());
        assert_eq!(info, raw);

        filters.reset();
        assert!(filters.last_sample.is_none());
    }
}

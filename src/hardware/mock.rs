//! Mock Hardware Implementations
//!
//! Simulated beamline devices for tests, dry runs and the CLI. All mock
//! devices use async-safe operations (tokio::time::sleep, not
//! std::thread::sleep) and report outcomes through the same event channels a
//! real control-system binding would.
//!
//! # Available Mocks
//!
//! - `MockMotor` - scalar PV with motion timing, settle error and fault injection
//! - `MockDetector` - frame producer that records when each acquisition started
//! - `MockSource` - beam source with shutter state events
//! - `MemoryImageStore` - in-memory image-set sink
//! - `StaticAlignment` - alignment solver returning a fixed pose
//! - `SimulatedDevices` - [`DeviceFactory`] handing out the mocks above
//!
//! # Modes
//!
//! - **Instant**: zero delays; completion events are published right after the
//!   command returns (deterministic unit tests)
//! - **Realistic**: distance/speed timing with periodic position updates

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, Duration, Instant};

use crate::hardware::capabilities::{
    AcquiredFrame, AcquisitionRequest, AlignmentSolver, BeamSource, Detector, DeviceFactory,
    DriverEvent, ImageSetMetadata, ImageSetStore, MotorDriver, SourceEvent, SourceState,
};
use crate::motion::pose::Pose;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Operational modes for mock devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockMode {
    /// Zero delays, deterministic - for unit tests
    #[default]
    Instant,
    /// Hardware-like timing - for integration tests
    Realistic,
}

// =============================================================================
// MockMotor
// =============================================================================

#[derive(Debug)]
struct MotorState {
    position: f64,
    connected: bool,
    moving: bool,
    fail_next_write: Option<String>,
    fault_on_next_move: Option<String>,
}

struct MotorInner {
    address: String,
    state: Mutex<MotorState>,
    events: broadcast::Sender<DriverEvent>,
    mode: MockMode,
    speed: f64,
    update_interval: Duration,
    settle_error: f64,
    commands: AtomicUsize,
}

/// Simulated motor / scalar process variable.
///
/// # Example
///
/// ```rust,ignore
/// let motor = MockMotor::builder("SR08ID01:X").initial_position(5.0).build();
/// let mut events = motor.subscribe();
/// motor.write(10.0).await?;
/// // ... PositionChanged(10.0), MoveFinished
/// ```
#[derive(Clone)]
pub struct MockMotor {
    inner: Arc<MotorInner>,
}

impl MockMotor {
    /// Instant-mode motor at position 0.0
    pub fn new(address: impl Into<String>) -> Self {
        Self::builder(address).build()
    }

    /// Create a builder
    pub fn builder(address: impl Into<String>) -> MockMotorBuilder {
        MockMotorBuilder::new(address)
    }

    /// Number of commands accepted by `write`
    pub fn command_count(&self) -> usize {
        self.inner.commands.load(Ordering::SeqCst)
    }

    /// Whether a simulated move is in progress
    pub fn is_moving(&self) -> bool {
        self.inner.state.lock().moving
    }

    /// Current simulated position, bypassing the connection check
    pub fn raw_position(&self) -> f64 {
        self.inner.state.lock().position
    }

    /// Simulate link loss
    pub fn disconnect(&self) {
        self.inner.state.lock().connected = false;
        let _ = self.inner.events.send(DriverEvent::Disconnected);
        tracing::debug!(address = %self.inner.address, "MockMotor: disconnected");
    }

    /// Simulate link recovery
    pub fn reconnect(&self) {
        self.inner.state.lock().connected = true;
        let _ = self.inner.events.send(DriverEvent::Connected);
        tracing::debug!(address = %self.inner.address, "MockMotor: reconnected");
    }

    /// Reject the next `write` with the given message
    pub fn fail_next_write(&self, message: impl Into<String>) {
        self.inner.state.lock().fail_next_write = Some(message.into());
    }

    /// Finish the next move with a driver `Error` event instead of `MoveFinished`
    pub fn fault_next_move(&self, message: impl Into<String>) {
        self.inner.state.lock().fault_on_next_move = Some(message.into());
    }

    fn motion_duration(&self, distance: f64) -> Duration {
        match self.inner.mode {
            MockMode::Instant => Duration::ZERO,
            MockMode::Realistic if self.inner.speed > 0.0 => {
                Duration::from_secs_f64(distance.abs() / self.inner.speed)
            }
            MockMode::Realistic => Duration::ZERO,
        }
    }
}

#[async_trait]
impl MotorDriver for MockMotor {
    fn address(&self) -> &str {
        &self.inner.address
    }

    async fn read(&self) -> Result<f64> {
        let state = self.inner.state.lock();
        if !state.connected {
            bail!("{}: not connected", self.inner.address);
        }
        Ok(state.position)
    }

    async fn write(&self, target: f64) -> Result<()> {
        let (start, fault) = {
            let mut state = self.inner.state.lock();
            if !state.connected {
                bail!("{}: not connected", self.inner.address);
            }
            if let Some(message) = state.fail_next_write.take() {
                return Err(anyhow!("{}: {}", self.inner.address, message));
            }
            state.moving = true;
            (state.position, state.fault_on_next_move.take())
        };
        self.inner.commands.fetch_add(1, Ordering::SeqCst);

        let duration = self.motion_duration(target - start);
        tracing::debug!(
            address = %self.inner.address,
            "MockMotor: moving from {:.4} to {:.4} ({:?})",
            start,
            target,
            duration
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            if duration.is_zero() {
                tokio::task::yield_now().await;
            } else {
                let steps = (duration.as_secs_f64() / inner.update_interval.as_secs_f64())
                    .ceil()
                    .max(1.0) as u32;
                let step_time = duration / steps;
                for step in 1..steps {
                    sleep(step_time).await;
                    let position = start + (target - start) * f64::from(step) / f64::from(steps);
                    inner.state.lock().position = position;
                    let _ = inner.events.send(DriverEvent::PositionChanged(position));
                }
                sleep(step_time).await;
            }

            let final_position = target + inner.settle_error;
            {
                let mut state = inner.state.lock();
                state.position = final_position;
                state.moving = false;
            }
            let _ = inner
                .events
                .send(DriverEvent::PositionChanged(final_position));
            match fault {
                Some(message) => {
                    let _ = inner.events.send(DriverEvent::Error(message));
                }
                None => {
                    let _ = inner.events.send(DriverEvent::MoveFinished);
                }
            }
        });

        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.inner.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }
}

/// Builder for MockMotor with fluent API
pub struct MockMotorBuilder {
    address: String,
    initial_position: f64,
    mode: MockMode,
    speed: f64,
    update_interval: Duration,
    settle_error: f64,
    connected: bool,
}

impl MockMotorBuilder {
    /// Create a new builder with defaults
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            initial_position: 0.0,
            mode: MockMode::Instant,
            speed: 10.0,
            update_interval: Duration::from_millis(20),
            settle_error: 0.0,
            connected: true,
        }
    }

    /// Set initial position
    pub fn initial_position(mut self, position: f64) -> Self {
        self.initial_position = position;
        self
    }

    /// Set operational mode
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set speed in units/sec (realistic mode)
    pub fn speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    /// Set interval between position updates (realistic mode)
    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    /// Offset added to every final position, to exercise move verification
    pub fn settle_error(mut self, error: f64) -> Self {
        self.settle_error = error;
        self
    }

    /// Start disconnected
    pub fn disconnected(mut self) -> Self {
        self.connected = false;
        self
    }

    /// Build the MockMotor
    pub fn build(self) -> MockMotor {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        MockMotor {
            inner: Arc::new(MotorInner {
                address: self.address,
                state: Mutex::new(MotorState {
                    position: self.initial_position,
                    connected: self.connected,
                    moving: false,
                    fail_next_write: None,
                    fault_on_next_move: None,
                }),
                events,
                mode: self.mode,
                speed: self.speed,
                update_interval: self.update_interval,
                settle_error: self.settle_error,
                commands: AtomicUsize::new(0),
            }),
        }
    }
}

// =============================================================================
// MockDetector
// =============================================================================

/// Simulated area detector.
pub struct MockDetector {
    name: String,
    resolution: (u32, u32),
    mode: MockMode,
    frame_count: AtomicUsize,
    acquisition_starts: Mutex<Vec<Instant>>,
    connection: watch::Sender<bool>,
}

impl MockDetector {
    /// Create a detector with the given resolution
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        let (connection, _) = watch::channel(true);
        Self {
            name: name.into(),
            resolution: (width, height),
            mode: MockMode::Instant,
            frame_count: AtomicUsize::new(0),
            acquisition_starts: Mutex::new(Vec::new()),
            connection,
        }
    }

    /// Use realistic timing (sleep for the exposure)
    pub fn with_mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Total frames produced
    pub fn frame_count(&self) -> usize {
        self.frame_count.load(Ordering::SeqCst)
    }

    /// Instants at which `acquire` was entered
    pub fn acquisition_starts(&self) -> Vec<Instant> {
        self.acquisition_starts.lock().clone()
    }

    /// Simulate link loss or recovery
    pub fn set_connected(&self, connected: bool) {
        self.connection.send_replace(connected);
    }
}

#[async_trait]
impl Detector for MockDetector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire(&self, request: &AcquisitionRequest) -> Result<AcquiredFrame> {
        self.acquisition_starts.lock().push(Instant::now());
        if !*self.connection.borrow() {
            bail!("{}: not connected", self.name);
        }
        if self.mode == MockMode::Realistic {
            sleep(request.exposure).await;
        }

        let index = self.frame_count.fetch_add(1, Ordering::SeqCst);
        let (width, height) = self.resolution;
        let pixels = (0..(width as usize * height as usize))
            .map(|i| ((i + index) % 4096) as u16)
            .collect();

        let mut metadata = BTreeMap::new();
        metadata.insert("label".to_string(), request.label.clone());
        metadata.insert(
            "exposure_ms".to_string(),
            request.exposure.as_millis().to_string(),
        );
        metadata.insert("frame_index".to_string(), index.to_string());

        tracing::debug!(detector = %self.name, label = %request.label, "MockDetector: frame {}", index);
        Ok(AcquiredFrame {
            detector: self.name.clone(),
            width,
            height,
            pixels,
            metadata,
            timestamp: Utc::now(),
        })
    }

    fn connection(&self) -> watch::Receiver<bool> {
        self.connection.subscribe()
    }
}

// =============================================================================
// MockSource
// =============================================================================

/// Simulated beam source with shutter.
pub struct MockSource {
    state: Arc<Mutex<SourceState>>,
    events: broadcast::Sender<SourceEvent>,
    connection: watch::Sender<bool>,
    shutter_delay: Duration,
    shutter_cycles: AtomicUsize,
}

impl MockSource {
    /// Source with instantaneous shutter
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (connection, _) = watch::channel(true);
        Self {
            state: Arc::new(Mutex::new(SourceState::default())),
            events,
            connection,
            shutter_delay: Duration::ZERO,
            shutter_cycles: AtomicUsize::new(0),
        }
    }

    /// Delay between a shutter command and its state event
    pub fn with_shutter_delay(mut self, delay: Duration) -> Self {
        self.shutter_delay = delay;
        self
    }

    /// How many times the shutter was opened
    pub fn shutter_cycles(&self) -> usize {
        self.shutter_cycles.load(Ordering::SeqCst)
    }

    /// Simulate link loss or recovery
    pub fn set_connected(&self, connected: bool) {
        self.connection.send_replace(connected);
    }

    fn ensure_connected(&self) -> Result<()> {
        if !*self.connection.borrow() {
            bail!("beam source not connected");
        }
        Ok(())
    }

    fn publish_later(&self, event: SourceEvent) {
        let state = self.state.clone();
        let events = self.events.clone();
        let delay = self.shutter_delay;
        tokio::spawn(async move {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                sleep(delay).await;
            }
            {
                let mut state = state.lock();
                match event {
                    SourceEvent::On => state.on = true,
                    SourceEvent::Off => {
                        state.on = false;
                        state.shutter_open = false;
                    }
                    SourceEvent::ShutterOpened => state.shutter_open = true,
                    SourceEvent::ShutterClosed => state.shutter_open = false,
                    SourceEvent::Error(_) => {}
                }
            }
            let _ = events.send(event);
        });
    }
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BeamSource for MockSource {
    async fn turn_on(&self) -> Result<()> {
        self.ensure_connected()?;
        self.publish_later(SourceEvent::On);
        Ok(())
    }

    async fn turn_off(&self) -> Result<()> {
        self.ensure_connected()?;
        self.publish_later(SourceEvent::Off);
        Ok(())
    }

    async fn open_shutter(&self) -> Result<()> {
        self.ensure_connected()?;
        self.shutter_cycles.fetch_add(1, Ordering::SeqCst);
        self.publish_later(SourceEvent::ShutterOpened);
        Ok(())
    }

    async fn close_shutter(&self) -> Result<()> {
        self.ensure_connected()?;
        self.publish_later(SourceEvent::ShutterClosed);
        Ok(())
    }

    fn state(&self) -> SourceState {
        *self.state.lock()
    }

    fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.events.subscribe()
    }

    fn connection(&self) -> watch::Receiver<bool> {
        self.connection.subscribe()
    }
}

// =============================================================================
// MemoryImageStore / StaticAlignment
// =============================================================================

/// An image set held by [`MemoryImageStore`].
#[derive(Debug, Clone)]
pub struct StoredImageSet {
    /// Set name
    pub name: String,
    /// Frames in acquisition order
    pub frames: Vec<AcquiredFrame>,
    /// Metadata supplied by the workflow
    pub metadata: ImageSetMetadata,
}

/// Append-only in-memory image-set store.
#[derive(Default)]
pub struct MemoryImageStore {
    sets: Mutex<Vec<StoredImageSet>>,
}

impl MemoryImageStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all stored sets
    pub fn sets(&self) -> Vec<StoredImageSet> {
        self.sets.lock().clone()
    }
}

#[async_trait]
impl ImageSetStore for MemoryImageStore {
    async fn add_image_set(
        &self,
        frames: Vec<AcquiredFrame>,
        metadata: ImageSetMetadata,
    ) -> Result<(String, usize)> {
        let mut sets = self.sets.lock();
        let name = format!("set{:03}", sets.len() + 1);
        let count = frames.len();
        sets.push(StoredImageSet {
            name: name.clone(),
            frames,
            metadata,
        });
        Ok((name, count))
    }
}

/// Alignment solver that always returns the same correction.
pub struct StaticAlignment {
    pose: Mutex<Pose>,
}

impl StaticAlignment {
    /// Solver returning `pose`
    pub fn new(pose: Pose) -> Self {
        Self {
            pose: Mutex::new(pose),
        }
    }

    /// Replace the returned correction
    pub fn set(&self, pose: Pose) {
        *self.pose.lock() = pose;
    }
}

#[async_trait]
impl AlignmentSolver for StaticAlignment {
    async fn solve(&self) -> Result<Pose> {
        Ok(*self.pose.lock())
    }
}

// =============================================================================
// SimulatedDevices - DeviceFactory implementation
// =============================================================================

/// Factory handing out mock devices; the same address always maps to the
/// same mock so tests can reach in and inspect it.
pub struct SimulatedDevices {
    mode: MockMode,
    motors: Mutex<HashMap<String, MockMotor>>,
    detectors: Mutex<HashMap<String, Arc<MockDetector>>>,
    source: Mutex<Option<Arc<MockSource>>>,
}

impl SimulatedDevices {
    /// Factory producing devices in the given mode
    pub fn new(mode: MockMode) -> Self {
        Self {
            mode,
            motors: Mutex::new(HashMap::new()),
            detectors: Mutex::new(HashMap::new()),
            source: Mutex::new(None),
        }
    }

    /// Mock motor previously built for `address`
    pub fn motor_mock(&self, address: &str) -> Option<MockMotor> {
        self.motors.lock().get(address).cloned()
    }

    /// Mock detector previously built under `name`
    pub fn detector_mock(&self, name: &str) -> Option<Arc<MockDetector>> {
        self.detectors.lock().get(name).cloned()
    }

    /// Mock source, if one was built
    pub fn source_mock(&self) -> Option<Arc<MockSource>> {
        self.source.lock().clone()
    }
}

impl Default for SimulatedDevices {
    fn default() -> Self {
        Self::new(MockMode::Instant)
    }
}

impl DeviceFactory for SimulatedDevices {
    fn name(&self) -> &'static str {
        "simulation"
    }

    fn motor(&self, address: &str) -> Result<Arc<dyn MotorDriver>> {
        let mut motors = self.motors.lock();
        let motor = motors
            .entry(address.to_string())
            .or_insert_with(|| MockMotor::builder(address).mode(self.mode).build())
            .clone();
        Ok(Arc::new(motor))
    }

    fn detector(&self, name: &str, _address: &str) -> Result<Arc<dyn Detector>> {
        let mut detectors = self.detectors.lock();
        let detector = detectors
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MockDetector::new(name, 64, 64).with_mode(self.mode)))
            .clone();
        Ok(detector)
    }

    fn source(&self, _address: &str) -> Result<Arc<dyn BeamSource>> {
        let mut source = self.source.lock();
        let source = source.get_or_insert_with(|| Arc::new(MockSource::new())).clone();
        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_finish(rx: &mut broadcast::Receiver<DriverEvent>) -> DriverEvent {
        loop {
            let event = rx.recv().await.unwrap();
            if matches!(event, DriverEvent::MoveFinished | DriverEvent::Error(_)) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_mock_motor_instant_move() {
        let motor = MockMotor::new("M1");
        let mut rx = motor.subscribe();

        motor.write(10.0).await.unwrap();
        assert_eq!(next_finish(&mut rx).await, DriverEvent::MoveFinished);
        assert_eq!(motor.read().await.unwrap(), 10.0);
        assert_eq!(motor.command_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_motor_realistic_reports_progress() {
        let motor = MockMotor::builder("M2")
            .mode(MockMode::Realistic)
            .speed(100.0)
            .update_interval(Duration::from_millis(10))
            .build();
        let mut rx = motor.subscribe();

        let start = Instant::now();
        motor.write(5.0).await.unwrap();
        assert!(motor.is_moving());

        let mut updates = 0;
        loop {
            match rx.recv().await.unwrap() {
                DriverEvent::PositionChanged(_) => updates += 1,
                DriverEvent::MoveFinished => break,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(updates >= 2, "expected intermediate updates, got {}", updates);
        assert!(start.elapsed() >= Duration::from_millis(45));
        assert_eq!(motor.read().await.unwrap(), 5.0);
    }

    #[tokio::test]
    async fn test_mock_motor_disconnected_rejects() {
        let motor = MockMotor::builder("M3").disconnected().build();
        assert!(motor.read().await.is_err());
        assert!(motor.write(1.0).await.is_err());
        assert_eq!(motor.command_count(), 0);

        motor.reconnect();
        assert!(motor.is_connected());
        assert!(motor.write(1.0).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_motor_fault_injection() {
        let motor = MockMotor::new("M4");
        motor.fail_next_write("amplifier fault");
        let err = motor.write(1.0).await.unwrap_err();
        assert!(err.to_string().contains("amplifier fault"));

        let mut rx = motor.subscribe();
        motor.fault_next_move("following error");
        motor.write(2.0).await.unwrap();
        assert_eq!(
            next_finish(&mut rx).await,
            DriverEvent::Error("following error".into())
        );
    }

    #[tokio::test]
    async fn test_mock_source_shutter_events() {
        let source = MockSource::new();
        let mut rx = source.subscribe();
        source.open_shutter().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), SourceEvent::ShutterOpened);
        assert!(source.state().shutter_open);
        source.close_shutter().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), SourceEvent::ShutterClosed);
        assert!(!source.state().shutter_open);
        assert_eq!(source.shutter_cycles(), 1);
    }

    #[tokio::test]
    async fn test_mock_detector_frames() {
        let detector = MockDetector::new("det", 4, 2);
        let frame = detector
            .acquire(&AcquisitionRequest {
                label: "angle_0".into(),
                exposure: Duration::from_millis(5),
            })
            .await
            .unwrap();
        assert_eq!(frame.pixels.len(), 8);
        assert_eq!(frame.metadata.get("label").map(String::as_str), Some("angle_0"));
        assert_eq!(detector.frame_count(), 1);
        assert_eq!(detector.acquisition_starts().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_names_sets() {
        let store = MemoryImageStore::new();
        let (name, count) = store
            .add_image_set(Vec::new(), ImageSetMetadata::default())
            .await
            .unwrap();
        assert_eq!(name, "set001");
        assert_eq!(count, 0);
        let (name, _) = store
            .add_image_set(Vec::new(), ImageSetMetadata::default())
            .await
            .unwrap();
        assert_eq!(name, "set002");
    }

    #[test]
    fn test_factory_reuses_mocks_per_address() {
        let factory = SimulatedDevices::default();
        let a = factory.motor("X").unwrap();
        let _ = factory.motor("X").unwrap();
        assert_eq!(a.address(), "X");
        assert!(factory.motor_mock("X").is_some());
        assert!(factory.motor_mock("Y").is_none());
    }
}

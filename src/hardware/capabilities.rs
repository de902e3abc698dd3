//! Device Capabilities
//!
//! The positioning core never speaks a wire protocol itself. Everything it
//! touches on the beamline is reached through the small traits in this module:
//!
//! - [`MotorDriver`]: one scalar process variable that can be read, commanded,
//!   and that reports connection/motion events. Axes, speed settings and
//!   work-point offsets all use it.
//! - [`Detector`]: acquires one frame plus metadata.
//! - [`BeamSource`]: beam on/off and shutter control with state events.
//! - [`ImageSetStore`]: append-only sink for acquired image sets.
//! - [`AlignmentSolver`]: external registration that yields a correction pose.
//! - [`DeviceFactory`]: builds drivers from configured addresses.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Reports asynchronous outcomes on a `tokio::sync::broadcast` channel, so
//!   several consumers (axis, monitor, logger) can listen independently
//!
//! # Example
//!
//! ```rust,ignore
//! let mut events = driver.subscribe();
//! driver.write(12.5).await?; // returns once the command is accepted
//! while let Ok(event) = events.recv().await {
//!     if matches!(event, DriverEvent::MoveFinished) {
//!         break;
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use crate::motion::pose::Pose;

// =============================================================================
// Motor Driver
// =============================================================================

/// Events published by a [`MotorDriver`].
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// Link to the device (re)established
    Connected,
    /// Link to the device lost
    Disconnected,
    /// Backend position update, independent of move completion
    PositionChanged(f64),
    /// The last commanded move has finished (successfully or not)
    MoveFinished,
    /// Device-reported fault
    Error(String),
}

/// Capability: scalar process variable with motion semantics.
///
/// # Contract
/// - `write` takes an absolute target in device units and returns once the
///   command has been accepted, NOT when motion completes
/// - completion is reported as [`DriverEvent::MoveFinished`]
/// - `read` fails when the device is unreachable
#[async_trait]
pub trait MotorDriver: Send + Sync {
    /// Control-system address of the process variable
    fn address(&self) -> &str;

    /// Current value
    async fn read(&self) -> Result<f64>;

    /// Command an absolute target
    async fn write(&self, target: f64) -> Result<()>;

    /// Subscribe to driver events
    fn subscribe(&self) -> broadcast::Receiver<DriverEvent>;

    /// Current link state
    fn is_connected(&self) -> bool;
}

// =============================================================================
// Detector
// =============================================================================

/// Parameters for a single detector acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionRequest {
    /// Free-form label stored with the frame (e.g. "angle_90")
    pub label: String,
    /// Integration time
    pub exposure: Duration,
}

/// One captured frame with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquiredFrame {
    /// Detector name
    pub detector: String,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Row-major pixel data
    pub pixels: Vec<u16>,
    /// Acquisition metadata (label, exposure, stage pose, ...)
    pub metadata: BTreeMap<String, String>,
    /// Capture timestamp
    pub timestamp: DateTime<Utc>,
}

/// Capability: frame acquisition.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Detector name
    fn name(&self) -> &str;

    /// Acquire one frame; resolves when the frame is read out
    async fn acquire(&self, request: &AcquisitionRequest) -> Result<AcquiredFrame>;

    /// Connection state stream
    fn connection(&self) -> watch::Receiver<bool>;
}

// =============================================================================
// Beam Source
// =============================================================================

/// Events published by a [`BeamSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// Source switched on
    On,
    /// Source switched off
    Off,
    /// Beam path open
    ShutterOpened,
    /// Beam path closed
    ShutterClosed,
    /// Device-reported fault
    Error(String),
}

/// Snapshot of the source state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceState {
    /// Source powered
    pub on: bool,
    /// Shutter open
    pub shutter_open: bool,
}

/// Capability: beam delivery control.
///
/// Commands return once accepted; the resulting state change arrives as a
/// [`SourceEvent`].
#[async_trait]
pub trait BeamSource: Send + Sync {
    /// Switch the source on
    async fn turn_on(&self) -> Result<()>;
    /// Switch the source off
    async fn turn_off(&self) -> Result<()>;
    /// Open the beam path
    async fn open_shutter(&self) -> Result<()>;
    /// Close the beam path
    async fn close_shutter(&self) -> Result<()>;
    /// Current state
    fn state(&self) -> SourceState;
    /// Subscribe to state events
    fn subscribe(&self) -> broadcast::Receiver<SourceEvent>;
    /// Connection state stream
    fn connection(&self) -> watch::Receiver<bool>;
}

// =============================================================================
// Dataset Sink / Alignment
// =============================================================================

/// Metadata attached to an image set when it is stored.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageSetMetadata {
    /// Operator comment
    pub comment: String,
    /// Acquisition angles in degrees
    pub angles: Vec<f64>,
    /// Scan range along the scan axis (start, stop), mm
    pub scan_range: (f64, f64),
    /// Stage pose before the acquisition started
    pub start_pose: Pose,
}

/// Capability: append-only image-set persistence.
#[async_trait]
pub trait ImageSetStore: Send + Sync {
    /// Store frames as a new set; returns (set name, frame count)
    async fn add_image_set(
        &self,
        frames: Vec<AcquiredFrame>,
        metadata: ImageSetMetadata,
    ) -> Result<(String, usize)>;
}

/// Capability: external registration producing a patient correction pose.
#[async_trait]
pub trait AlignmentSolver: Send + Sync {
    /// Compute the correction as a relative pose
    async fn solve(&self) -> Result<Pose>;
}

// =============================================================================
// Factory
// =============================================================================

/// Builds drivers from configured addresses.
///
/// The composition root picks the factory (simulation or a real control
/// system binding); everything downstream only sees the capability traits.
pub trait DeviceFactory: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &'static str;

    /// Motor or scalar process variable
    fn motor(&self, address: &str) -> Result<Arc<dyn MotorDriver>>;

    /// Detector
    fn detector(&self, name: &str, address: &str) -> Result<Arc<dyn Detector>>;

    /// Beam source
    fn source(&self, address: &str) -> Result<Arc<dyn BeamSource>>;
}

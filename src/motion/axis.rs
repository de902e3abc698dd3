//! Single actuator abstraction.
//!
//! An [`Axis`] wraps one [`MotorDriver`] and adds what the raw process
//! variable does not know about: travel limits, the one-move-at-a-time rule,
//! verification of the final position, and a typed event stream.
//!
//! # State machine
//!
//! ```text
//!   Idle --write()--> Moving --MoveFinished/Error/Disconnected--> Idle
//! ```
//!
//! `write` returns as soon as the driver accepted the command. The outcome
//! arrives later as [`AxisEvent::MoveCompleted`] or [`AxisEvent::MoveError`],
//! tagged with the correlation id from the returned [`MoveTicket`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{AppResult, PositionerError};
use crate::hardware::capabilities::{DriverEvent, MotorDriver};
use crate::motion::pose::Dof;

const AXIS_EVENT_CAPACITY: usize = 256;

/// Where a rotation axis takes its pivot from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frame {
    /// Pivot follows the current stage translation
    #[default]
    Global,
    /// Pivot is fixed relative to the axis mount
    Local,
}

/// Static description of one axis, as loaded from the stage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisSpec {
    /// Unique name within the stage
    pub name: String,
    /// Degree of freedom driven by this axis
    pub dof: Dof,
    /// Stacking position, lowest first
    pub order: u32,
    /// +1 or -1; multiplies device units into stage coordinates
    #[serde(default = "default_direction")]
    pub direction: i32,
    /// Pivot frame for rotations
    #[serde(default)]
    pub frame: Frame,
    /// Height this axis adds to the stack, mm
    #[serde(default)]
    pub size: f64,
    /// Offset from the treated point to the mechanical rotation centre, mm
    #[serde(default)]
    pub work_distance: [f64; 3],
    /// Travel range `[lower, upper]` in device units
    pub limits: [f64; 2],
    /// Positioning precision in device units
    #[serde(default)]
    pub precision: f64,
    /// Mechanical backlash in device units
    #[serde(default)]
    pub backlash: f64,
    /// Control-system address of the motor
    pub address: String,
}

fn default_direction() -> i32 {
    1
}

impl AxisSpec {
    /// Lower travel limit
    pub fn lower(&self) -> f64 {
        self.limits[0]
    }

    /// Upper travel limit
    pub fn upper(&self) -> f64 {
        self.limits[1]
    }

    /// Allowed deviation between target and read-back after a move
    pub fn tolerance(&self) -> f64 {
        self.precision + self.backlash
    }

    /// Direction as a float multiplier
    pub fn sign(&self) -> f64 {
        if self.direction < 0 {
            -1.0
        } else {
            1.0
        }
    }

    /// Whether the rotation pivot is offset from the origin
    pub fn has_work_distance(&self) -> bool {
        self.work_distance.iter().any(|v| *v != 0.0)
    }

    /// Check a target against the travel range
    pub fn check_limits(&self, target: f64) -> AppResult<()> {
        if !target.is_finite() || target < self.lower() || target > self.upper() {
            return Err(PositionerError::LimitExceeded {
                axis: self.name.clone(),
                target,
                lower: self.lower(),
                upper: self.upper(),
            });
        }
        Ok(())
    }
}

/// How a `write` value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveMode {
    /// Value is the target position
    #[default]
    Absolute,
    /// Value is added to the current position
    Relative,
}

impl fmt::Display for MoveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MoveMode::Absolute => write!(f, "absolute"),
            MoveMode::Relative => write!(f, "relative"),
        }
    }
}

/// The single in-flight request of an axis.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveRequest {
    /// Correlation id
    pub id: Uuid,
    /// Absolute target in device units
    pub target: f64,
    /// Mode the caller used
    pub mode: MoveMode,
    /// When the command was issued
    pub issued_at: DateTime<Utc>,
}

/// Receipt returned by [`Axis::write`].
#[derive(Debug, Clone, PartialEq)]
pub struct MoveTicket {
    /// Axis name
    pub axis: String,
    /// Correlation id carried by the completion event
    pub id: Uuid,
    /// Absolute target in device units
    pub target: f64,
}

/// Motion state of an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisState {
    /// No move in flight
    Idle,
    /// A move is in flight
    Moving,
}

/// Events published by an [`Axis`].
#[derive(Debug, Clone)]
pub enum AxisEvent {
    /// Backend position update
    PositionChanged {
        /// Axis name
        axis: String,
        /// Position in device units
        position: f64,
    },
    /// Move finished within tolerance
    MoveCompleted {
        /// Axis name
        axis: String,
        /// Correlation id
        move_id: Uuid,
        /// Commanded target
        target: f64,
        /// Read-back position
        actual: f64,
    },
    /// Move terminated with an error (verification, driver fault, link loss)
    MoveError {
        /// Axis name
        axis: String,
        /// Correlation id
        move_id: Uuid,
        /// What went wrong
        error: PositionerError,
    },
    /// Link state changed
    ConnectionChanged {
        /// Axis name
        axis: String,
        /// New link state
        connected: bool,
    },
}

impl AxisEvent {
    /// Correlation id for move outcome events
    pub fn move_id(&self) -> Option<Uuid> {
        match self {
            AxisEvent::MoveCompleted { move_id, .. } | AxisEvent::MoveError { move_id, .. } => {
                Some(*move_id)
            }
            _ => None,
        }
    }
}

struct AxisInner {
    spec: AxisSpec,
    driver: Arc<dyn MotorDriver>,
    in_flight: Mutex<Option<MoveRequest>>,
    state: watch::Sender<AxisState>,
    connected: watch::Sender<bool>,
    events: broadcast::Sender<AxisEvent>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for AxisInner {
    fn drop(&mut self) {
        if let Some(handle) = self.forwarder.get_mut().take() {
            handle.abort();
        }
    }
}

/// One actuator of a kinematic chain. Cheap to clone.
#[derive(Clone)]
pub struct Axis {
    inner: Arc<AxisInner>,
}

impl fmt::Debug for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Axis")
            .field("name", &self.inner.spec.name)
            .field("dof", &self.inner.spec.dof)
            .field("address", &self.inner.spec.address)
            .finish()
    }
}

impl Axis {
    /// Wrap a driver. Must be called from within a tokio runtime: a task is
    /// spawned that translates driver events into axis events.
    pub fn new(spec: AxisSpec, driver: Arc<dyn MotorDriver>) -> Self {
        let driver_events = driver.subscribe();
        let (state, _) = watch::channel(AxisState::Idle);
        let (connected, _) = watch::channel(driver.is_connected());
        let (events, _) = broadcast::channel(AXIS_EVENT_CAPACITY);

        let inner = Arc::new(AxisInner {
            spec,
            driver,
            in_flight: Mutex::new(None),
            state,
            connected,
            events,
            forwarder: Mutex::new(None),
        });

        let handle = tokio::spawn(forward_driver_events(
            Arc::downgrade(&inner),
            driver_events,
        ));
        *inner.forwarder.lock() = Some(handle);

        Self { inner }
    }

    /// Axis name
    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    /// Static configuration
    pub fn spec(&self) -> &AxisSpec {
        &self.inner.spec
    }

    /// Current motion state
    pub fn state(&self) -> AxisState {
        *self.inner.state.borrow()
    }

    /// The request currently in flight, if any
    pub fn in_flight(&self) -> Option<MoveRequest> {
        self.inner.in_flight.lock().clone()
    }

    /// Current link state
    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Link state stream for the connection monitor
    pub fn connection(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    /// Subscribe to axis events
    pub fn subscribe(&self) -> broadcast::Receiver<AxisEvent> {
        self.inner.events.subscribe()
    }

    /// Read the position in device units.
    pub async fn read(&self) -> AppResult<f64> {
        self.inner
            .driver
            .read()
            .await
            .map_err(|e| PositionerError::Connection {
                device: self.inner.spec.name.clone(),
                message: format!("{e:#}"),
            })
    }

    /// Command a move.
    ///
    /// # Errors
    /// - `AxisBusy` if a move is already in flight
    /// - `LimitExceeded` if the target is outside the travel range; the driver
    ///   is not touched
    /// - `Connection` if the current position cannot be read (relative mode)
    ///   or the driver rejects the command
    pub async fn write(&self, value: f64, mode: MoveMode) -> AppResult<MoveTicket> {
        let spec = &self.inner.spec;
        self.ensure_idle()?;

        let target = match mode {
            MoveMode::Absolute => value,
            MoveMode::Relative => self.read().await? + value,
        };
        spec.check_limits(target)?;

        let request = MoveRequest {
            id: Uuid::new_v4(),
            target,
            mode,
            issued_at: Utc::now(),
        };
        {
            let mut slot = self.inner.in_flight.lock();
            if let Some(existing) = slot.as_ref() {
                return Err(PositionerError::AxisBusy {
                    axis: spec.name.clone(),
                    move_id: existing.id.to_string(),
                });
            }
            *slot = Some(request.clone());
        }
        self.inner.state.send_replace(AxisState::Moving);

        tracing::debug!(axis = %spec.name, move_id = %request.id, %mode, target, "Axis move issued");

        if let Err(e) = self.inner.driver.write(target).await {
            self.inner.in_flight.lock().take();
            self.inner.state.send_replace(AxisState::Idle);
            tracing::warn!(axis = %spec.name, error = %e, "Driver rejected move");
            return Err(PositionerError::Connection {
                device: spec.name.clone(),
                message: format!("{e:#}"),
            });
        }

        Ok(MoveTicket {
            axis: spec.name.clone(),
            id: request.id,
            target,
        })
    }

    /// Resolve once no move is in flight.
    pub async fn wait_idle(&self) -> AppResult<()> {
        let mut rx = self.inner.state.subscribe();
        rx.wait_for(|state| *state == AxisState::Idle)
            .await
            .map(|_| ())
            .map_err(|_| PositionerError::Device(format!("axis '{}' dropped", self.name())))
    }

    fn ensure_idle(&self) -> AppResult<()> {
        match self.inner.in_flight.lock().as_ref() {
            Some(request) => Err(PositionerError::AxisBusy {
                axis: self.inner.spec.name.clone(),
                move_id: request.id.to_string(),
            }),
            None => Ok(()),
        }
    }
}

impl AxisInner {
    fn publish(&self, event: AxisEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn finish(&self, request: MoveRequest, outcome: Result<f64, PositionerError>) {
        self.state.send_replace(AxisState::Idle);
        let axis = self.spec.name.clone();
        match outcome {
            Ok(actual) => {
                tracing::debug!(axis = %axis, move_id = %request.id, actual, "Axis move completed");
                self.publish(AxisEvent::MoveCompleted {
                    axis,
                    move_id: request.id,
                    target: request.target,
                    actual,
                });
            }
            Err(error) => {
                tracing::warn!(axis = %axis, move_id = %request.id, %error, "Axis move failed");
                self.publish(AxisEvent::MoveError {
                    axis,
                    move_id: request.id,
                    error,
                });
            }
        }
    }

    async fn on_move_finished(&self) {
        let Some(request) = self.in_flight.lock().take() else {
            tracing::trace!(axis = %self.spec.name, "MoveFinished without request in flight");
            return;
        };

        let outcome = match self.driver.read().await {
            Ok(actual) => {
                let tolerance = self.spec.tolerance();
                if (request.target - actual).abs() > tolerance {
                    Err(PositionerError::MoveVerification {
                        axis: self.spec.name.clone(),
                        target: request.target,
                        actual,
                        tolerance,
                    })
                } else {
                    Ok(actual)
                }
            }
            Err(e) => Err(PositionerError::Connection {
                device: self.spec.name.clone(),
                message: format!("{e:#}"),
            }),
        };
        self.finish(request, outcome);
    }

    fn on_connection(&self, connected: bool) {
        self.connected.send_replace(connected);
        self.publish(AxisEvent::ConnectionChanged {
            axis: self.spec.name.clone(),
            connected,
        });
        if connected {
            return;
        }
        let request = self.in_flight.lock().take();
        if let Some(request) = request {
            self.finish(
                request,
                Err(PositionerError::Connection {
                    device: self.spec.name.clone(),
                    message: "link lost during move".to_string(),
                }),
            );
        }
    }

    async fn handle(&self, event: DriverEvent) {
        match event {
            DriverEvent::Connected => self.on_connection(true),
            DriverEvent::Disconnected => self.on_connection(false),
            DriverEvent::PositionChanged(position) => self.publish(AxisEvent::PositionChanged {
                axis: self.spec.name.clone(),
                position,
            }),
            DriverEvent::MoveFinished => self.on_move_finished().await,
            DriverEvent::Error(message) => {
                let request = self.in_flight.lock().take();
                match request {
                    Some(request) => self.finish(request, Err(PositionerError::Device(message))),
                    None => tracing::warn!(axis = %self.spec.name, %message, "Driver error while idle"),
                }
            }
        }
    }
}

async fn forward_driver_events(
    inner: Weak<AxisInner>,
    mut events: broadcast::Receiver<DriverEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(inner) = inner.upgrade() else { break };
                inner.handle(event).await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Axis lagged behind driver events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

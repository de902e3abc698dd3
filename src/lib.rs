//! # Beamline Positioner Core Library
//!
//! Patient positioning and workflow sequencing for a synchrotron
//! radiotherapy beamline. The library drives a stacked patient stage through
//! abstract device drivers, decomposes 6-DoF pose changes into per-axis
//! commands and sequences imaging and treatment as queues of asynchronous
//! hardware actions.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: capability traits every device backend implements
//!   (`MotorDriver`, `Detector`, `BeamSource`, `ImageSetStore`,
//!   `AlignmentSolver`, `DeviceFactory`) plus simulated devices.
//! - **`motion`**: single axes with limit checking and move verification,
//!   speed and work-point controllers, the kinematic chain and its
//!   decomposition solver.
//! - **`monitor`**: `ConnectionMonitor`, which ANDs member connectivity into
//!   one subsystem flag.
//! - **`workflow`**: the FIFO `WorkflowScheduler`, the `synchronize`
//!   concurrent-start primitive and the imaging/treatment sequences.
//! - **`system`**: the `PositioningSystem` facade consumed by operator UIs.
//! - **`config`**: figment-based configuration loading and validation.
//! - **`error`**: the `PositionerError` type shared by every module.
//! - **`tracing_setup`**: tracing subscriber initialization.

pub mod config;
pub mod error;
pub mod hardware;
pub mod monitor;
pub mod motion;
pub mod system;
pub mod tracing_setup;
pub mod workflow;

pub use config::BeamlineConfig;
pub use error::{AppResult, PositionerError};
pub use monitor::ConnectionMonitor;
pub use motion::{Axis, AxisSpec, Dof, KinematicChain, MoveMode, Pose};
pub use system::{PositioningSystem, SystemEvent, SystemStatus, WorkflowHandle};
pub use workflow::{WorkflowItem, WorkflowScheduler};

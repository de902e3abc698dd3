//! Hardware boundary: capability traits and simulated devices.

pub mod capabilities;
pub mod mock;

pub use capabilities::{
    AcquiredFrame, AcquisitionRequest, AlignmentSolver, BeamSource, Detector, DeviceFactory,
    DriverEvent, ImageSetMetadata, ImageSetStore, MotorDriver, SourceEvent, SourceState,
};

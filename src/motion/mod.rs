//! Stage motion: poses, axes, peer controllers and the kinematic chain.

pub mod axis;
pub mod chain;
pub mod controllers;
pub mod decomposition;
pub mod pose;

pub use axis::{Axis, AxisEvent, AxisSpec, AxisState, Frame, MoveMode, MoveTicket};
pub use chain::{AxisOutcome, ChainEvent, ChainMove, KinematicChain};
pub use controllers::{VelocityConfig, VelocityController, WorkPointConfig, WorkPointController};
pub use decomposition::{AxisCommand, Decomposition, DecompositionSettings};
pub use pose::{Dof, Pose};

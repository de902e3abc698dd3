//! Motion decomposition: one desired pose change to per-axis commands.
//!
//! The stage is a stack of single-DoF axes. Composing their transforms in
//! stacking order gives the stage transform S:
//!
//! ```text
//!   S = A_0 · A_1 · ... · A_n
//!   A_i = T(v_i · e_i)                        translation axis
//!   A_i = T(p_i) · R(e_i, v_i) · T(-p_i)      rotation axis about pivot p_i
//! ```
//!
//! Rotations about an offset pivot drag the treated point sideways, so
//! handing each translation axis the raw target component is not enough.
//! The solver allocates each target component to its single owning axis,
//! composes, measures the translational residual against the target and
//! corrects the translation allocations, re-projected through the rotation
//! stacked below each translation axis. The loop is bounded; running out of
//! iterations yields the best effort flagged `converged = false`.

use nalgebra::{Matrix3, Matrix4, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::PositionerError;
use crate::motion::axis::{AxisSpec, Frame};
use crate::motion::pose::{rotation_about, translation_matrix, translation_of, Dof, Pose};

/// Solver settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompositionSettings {
    /// Acceptable translational residual, mm
    pub tolerance_mm: f64,
    /// Upper bound on compose/correct passes
    pub max_iterations: usize,
}

impl Default for DecompositionSettings {
    fn default() -> Self {
        Self {
            tolerance_mm: 0.01,
            max_iterations: 16,
        }
    }
}

/// Relative command for one axis, in stage units (mm or degrees).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisCommand {
    /// Axis name
    pub axis: String,
    /// Degree of freedom the axis drives
    pub dof: Dof,
    /// Relative move
    pub value: f64,
}

/// Result of a decomposition.
#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition {
    /// Requested pose change
    pub target: Pose,
    /// One command per axis, in stacking order
    pub commands: Vec<AxisCommand>,
    /// Residual within tolerance
    pub converged: bool,
    /// Passes performed
    pub iterations: usize,
    /// Remaining translational residual the chain can act on, mm
    pub residual_mm: f64,
    /// Residual translation outside the chain's reachable directions, mm
    pub unreachable: Vector3<f64>,
    /// Non-zero target components with no owning axis
    pub unallocated: Vec<Dof>,
}

impl Decomposition {
    /// Command for a named axis
    pub fn command_for(&self, axis: &str) -> Option<f64> {
        self.commands
            .iter()
            .find(|c| c.axis == axis)
            .map(|c| c.value)
    }

    /// Largest absolute command
    pub fn max_command(&self) -> f64 {
        self.commands
            .iter()
            .fold(0.0_f64, |acc, c| acc.max(c.value.abs()))
    }

    /// Error describing a failed convergence, for callers that escalate it
    pub fn nonconvergence(&self) -> Option<PositionerError> {
        if self.converged {
            None
        } else {
            Some(PositionerError::DecompositionNonconvergence {
                iterations: self.iterations,
                residual: self.residual_mm,
            })
        }
    }
}

/// Index of the first axis driving each DoF.
fn owners(specs: &[AxisSpec]) -> [Option<usize>; 6] {
    let mut owners = [None; 6];
    for (i, spec) in specs.iter().enumerate() {
        let slot = &mut owners[spec.dof.pose_index()];
        if slot.is_none() {
            *slot = Some(i);
        }
    }
    owners
}

/// Rotation pivot for `specs[index]`, given the stage pose before the move.
pub fn pivot(specs: &[AxisSpec], index: usize, current: &Pose) -> Vector3<f64> {
    let spec = &specs[index];
    if !spec.has_work_distance() {
        return Vector3::zeros();
    }
    let stack_below: f64 = specs[..index].iter().map(|s| s.size).sum();
    let mut pivot = Vector3::from(spec.work_distance) + Vector3::new(0.0, 0.0, stack_below);
    if spec.frame == Frame::Global {
        pivot += current.translation();
    }
    pivot
}

/// Stage transform for per-axis values (stage units), composed in stacking
/// order.
pub fn compose(specs: &[AxisSpec], values: &[f64], current: &Pose) -> Matrix4<f64> {
    compose_with_rotations(specs, values, current).0
}

/// Composition plus, per axis, the pure rotation accumulated below it.
fn compose_with_rotations(
    specs: &[AxisSpec],
    values: &[f64],
    current: &Pose,
) -> (Matrix4<f64>, Vec<Matrix3<f64>>) {
    let mut stage = Matrix4::identity();
    let mut rotation = Matrix4::identity();
    let mut below = Vec::with_capacity(specs.len());

    for (i, (spec, value)) in specs.iter().zip(values).enumerate() {
        below.push(rotation.fixed_view::<3, 3>(0, 0).into_owned());
        if spec.dof.is_rotation() {
            let radians = value.to_radians();
            stage *= rotation_about(spec.dof, radians, &pivot(specs, i, current));
            rotation *= rotation_about(spec.dof, radians, &Vector3::zeros());
        } else {
            stage *= translation_matrix(&(spec.dof.unit_axis().into_inner() * *value));
        }
    }
    (stage, below)
}

/// Target transform for a pose, rotations composed in the chain's stacking
/// order.
pub fn target_transform(specs: &[AxisSpec], target: &Pose) -> Matrix4<f64> {
    let order: Vec<Dof> = specs.iter().map(|s| s.dof).collect();
    target.to_transform(&order)
}

/// Decompose a pose change into relative per-axis commands.
///
/// `specs` must be sorted by stacking order. `current` is the stage pose
/// before the move; it positions pivots of global-frame rotation axes.
pub fn decompose(
    specs: &[AxisSpec],
    target: &Pose,
    current: &Pose,
    settings: &DecompositionSettings,
) -> Decomposition {
    let owners = owners(specs);

    // Single owner per DoF; later axes with the same DoF get nothing.
    let mut values = vec![0.0; specs.len()];
    let mut unallocated = Vec::new();
    for dof in Dof::ALL {
        let component = target.get(dof);
        match owners[dof.pose_index()] {
            Some(index) => values[index] = component,
            None if component != 0.0 => unallocated.push(dof),
            None => {}
        }
    }

    let goal = translation_of(&target_transform(specs, target));
    let max_iterations = settings.max_iterations.max(1);
    let mut iterations = 0;
    let mut converged = false;
    let mut residual_mm;
    let mut unreachable;

    loop {
        iterations += 1;
        let (stage, below) = compose_with_rotations(specs, &values, current);
        let residual = goal - translation_of(&stage);

        // Global direction of every translation axis after the rotations
        // stacked below it.
        let directions: Vec<(usize, Vector3<f64>)> = specs
            .iter()
            .enumerate()
            .filter(|(i, spec)| {
                !spec.dof.is_rotation() && owners[spec.dof.pose_index()] == Some(*i)
            })
            .map(|(i, spec)| (i, below[i] * spec.dof.unit_axis().into_inner()))
            .collect();

        let reachable: Vector3<f64> = directions
            .iter()
            .map(|(_, d)| d * d.dot(&residual))
            .sum();
        residual_mm = reachable.norm();
        unreachable = residual - reachable;

        if residual_mm <= settings.tolerance_mm {
            converged = true;
            break;
        }
        if iterations >= max_iterations {
            break;
        }
        for (index, direction) in &directions {
            values[*index] += direction.dot(&residual);
        }
    }

    if !converged {
        tracing::warn!(
            iterations,
            residual_mm,
            "Decomposition stopped without converging"
        );
    }
    if unreachable.norm() > settings.tolerance_mm {
        tracing::debug!(
            x = unreachable.x,
            y = unreachable.y,
            z = unreachable.z,
            "Translation outside reachable directions"
        );
    }

    Decomposition {
        target: *target,
        commands: specs
            .iter()
            .zip(values)
            .map(|(spec, value)| AxisCommand {
                axis: spec.name.clone(),
                dof: spec.dof,
                value,
            })
            .collect(),
        converged,
        iterations,
        residual_mm,
        unreachable,
        unallocated,
    }
}

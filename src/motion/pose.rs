//! Six-degree-of-freedom poses and homogeneous transforms.
//!
//! Angles are degrees in every public field and argument; conversion to
//! radians happens only when a transform is built.

use nalgebra::{Matrix4, Rotation3, Unit, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Neg, Sub};

/// One controllable degree of freedom of the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dof {
    /// Translation along x (mm)
    Tx,
    /// Translation along y (mm)
    Ty,
    /// Translation along z (mm)
    Tz,
    /// Rotation about x (degrees)
    Rx,
    /// Rotation about y (degrees)
    Ry,
    /// Rotation about z (degrees)
    Rz,
}

impl Dof {
    /// All six degrees of freedom in pose-vector order.
    pub const ALL: [Dof; 6] = [Dof::Tx, Dof::Ty, Dof::Tz, Dof::Rx, Dof::Ry, Dof::Rz];

    /// True for rotational degrees of freedom.
    pub fn is_rotation(self) -> bool {
        matches!(self, Dof::Rx | Dof::Ry | Dof::Rz)
    }

    /// Cartesian index (0 = x, 1 = y, 2 = z) of the axis this DoF acts on.
    pub fn cartesian_index(self) -> usize {
        match self {
            Dof::Tx | Dof::Rx => 0,
            Dof::Ty | Dof::Ry => 1,
            Dof::Tz | Dof::Rz => 2,
        }
    }

    /// Index into the 6-vector representation.
    pub fn pose_index(self) -> usize {
        if self.is_rotation() {
            3 + self.cartesian_index()
        } else {
            self.cartesian_index()
        }
    }

    /// Unit vector of the Cartesian axis this DoF acts along or about.
    pub fn unit_axis(self) -> Unit<Vector3<f64>> {
        match self.cartesian_index() {
            0 => Vector3::x_axis(),
            1 => Vector3::y_axis(),
            _ => Vector3::z_axis(),
        }
    }

    /// Display unit.
    pub fn unit(self) -> &'static str {
        if self.is_rotation() {
            "deg"
        } else {
            "mm"
        }
    }
}

impl fmt::Display for Dof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Dof::Tx => "tx",
            Dof::Ty => "ty",
            Dof::Tz => "tz",
            Dof::Rx => "rx",
            Dof::Ry => "ry",
            Dof::Rz => "rz",
        };
        write!(f, "{}", label)
    }
}

/// A 6-DoF pose or pose change: (tx, ty, tz) in mm, (rx, ry, rz) in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    /// Translation x, mm
    #[serde(default)]
    pub tx: f64,
    /// Translation y, mm
    #[serde(default)]
    pub ty: f64,
    /// Translation z, mm
    #[serde(default)]
    pub tz: f64,
    /// Rotation about x, degrees
    #[serde(default)]
    pub rx: f64,
    /// Rotation about y, degrees
    #[serde(default)]
    pub ry: f64,
    /// Rotation about z, degrees
    #[serde(default)]
    pub rz: f64,
}

impl Pose {
    /// Zero pose.
    pub const ZERO: Pose = Pose {
        tx: 0.0,
        ty: 0.0,
        tz: 0.0,
        rx: 0.0,
        ry: 0.0,
        rz: 0.0,
    };

    /// Create a pose from its six components.
    pub fn new(tx: f64, ty: f64, tz: f64, rx: f64, ry: f64, rz: f64) -> Self {
        Self {
            tx,
            ty,
            tz,
            rx,
            ry,
            rz,
        }
    }

    /// Create a pose from a `[tx, ty, tz, rx, ry, rz]` array.
    pub fn from_array(values: [f64; 6]) -> Self {
        Self::new(
            values[0], values[1], values[2], values[3], values[4], values[5],
        )
    }

    /// The pose as `[tx, ty, tz, rx, ry, rz]`.
    pub fn to_array(&self) -> [f64; 6] {
        [self.tx, self.ty, self.tz, self.rx, self.ry, self.rz]
    }

    /// Pose with a single non-zero component.
    pub fn single(dof: Dof, value: f64) -> Self {
        let mut pose = Pose::ZERO;
        pose.set(dof, value);
        pose
    }

    /// Component value for a degree of freedom.
    pub fn get(&self, dof: Dof) -> f64 {
        self.to_array()[dof.pose_index()]
    }

    /// Overwrite one component.
    pub fn set(&mut self, dof: Dof, value: f64) {
        match dof {
            Dof::Tx => self.tx = value,
            Dof::Ty => self.ty = value,
            Dof::Tz => self.tz = value,
            Dof::Rx => self.rx = value,
            Dof::Ry => self.ry = value,
            Dof::Rz => self.rz = value,
        }
    }

    /// Translation part in mm.
    pub fn translation(&self) -> Vector3<f64> {
        Vector3::new(self.tx, self.ty, self.tz)
    }

    /// Largest absolute component; translations in mm and rotations in
    /// degrees are compared on the same scale.
    pub fn max_abs(&self) -> f64 {
        self.to_array()
            .iter()
            .fold(0.0_f64, |acc, v| acc.max(v.abs()))
    }

    /// All components are finite.
    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }

    /// Homogeneous transform: translation applied after the rotations, which
    /// are composed in the given order.
    pub fn to_transform(&self, rotation_order: &[Dof]) -> Matrix4<f64> {
        let mut rotation = Matrix4::identity();
        for dof in rotation_order.iter().filter(|d| d.is_rotation()) {
            rotation *= rotation_about(*dof, self.get(*dof).to_radians(), &Vector3::zeros());
        }
        translation_matrix(&self.translation()) * rotation
    }
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[tx {:.3}, ty {:.3}, tz {:.3} mm | rx {:.3}, ry {:.3}, rz {:.3} deg]",
            self.tx, self.ty, self.tz, self.rx, self.ry, self.rz
        )
    }
}

impl Add for Pose {
    type Output = Pose;

    fn add(self, rhs: Pose) -> Pose {
        let a = self.to_array();
        let b = rhs.to_array();
        Pose::from_array(std::array::from_fn(|i| a[i] + b[i]))
    }
}

impl Sub for Pose {
    type Output = Pose;

    fn sub(self, rhs: Pose) -> Pose {
        self + (-rhs)
    }
}

impl Neg for Pose {
    type Output = Pose;

    fn neg(self) -> Pose {
        let a = self.to_array();
        Pose::from_array(std::array::from_fn(|i| -a[i]))
    }
}

/// Pure translation as a homogeneous matrix.
pub fn translation_matrix(v: &Vector3<f64>) -> Matrix4<f64> {
    Matrix4::new_translation(v)
}

/// Rotation by `radians` about the Cartesian axis of `dof`, centred on
/// `pivot`: T(pivot) · R · T(−pivot).
pub fn rotation_about(dof: Dof, radians: f64, pivot: &Vector3<f64>) -> Matrix4<f64> {
    let rotation = Rotation3::from_axis_angle(&dof.unit_axis(), radians).to_homogeneous();
    translation_matrix(pivot) * rotation * translation_matrix(&-pivot)
}

/// Translation column of a homogeneous transform.
pub fn translation_of(m: &Matrix4<f64>) -> Vector3<f64> {
    Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)])
}

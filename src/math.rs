// Copyright © 2018 Cormac O'Brien
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Geometry primitives shared by the clip map and the trace solver.
//!
//! Distances along a trace and plane offsets are compared in `f32`, but dot
//! products that feed those comparisons are accumulated in `f64`. Long maps
//! put vertex coordinates in the tens of thousands of units, and a single
//! precision accumulation there loses enough bits to make a sweep tunnel
//! through a seam.

use std::ops::Neg;

use cgmath::{Angle, Deg, InnerSpace, Matrix, Matrix3, Vector3, Zero};
use num_derive::FromPrimitive;

/// Slop applied to AABB overlap tests.
pub const BOUNDS_CLIP_EPSILON: f32 = 0.25;

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum Axis {
    X = 0,
    Y = 1,
    Z = 2,
}

bitflags! {
    /// Which side(s) of a plane a box touches. `FRONT | BACK` means the box
    /// straddles the plane.
    pub struct PlaneSides: u8 {
        const FRONT = 1;
        const BACK = 2;
    }
}

/// A half-space boundary `{x : n.x <= dist}`.
///
/// Planes whose normal is exactly a positive basis vector carry an `axis`
/// tag so side tests can compare a single component instead of taking a dot
/// product. Negative axial normals deliberately do *not* get the tag; the
/// file format stores every plane together with its opposite at index
/// `i ^ 1`, and only the positive orientation is worth the fast path.
#[derive(Clone, Debug, PartialEq)]
pub struct Plane {
    normal: Vector3<f32>,
    dist: f32,
    axis: Option<Axis>,
    sign_bits: u8,
}

impl Plane {
    pub fn new(normal: Vector3<f32>, dist: f32) -> Plane {
        let axis = if normal.x == 1.0 {
            Some(Axis::X)
        } else if normal.y == 1.0 {
            Some(Axis::Y)
        } else if normal.z == 1.0 {
            Some(Axis::Z)
        } else {
            None
        };

        Plane {
            normal,
            dist,
            axis,
            sign_bits: sign_bits_for_normal(normal),
        }
    }

    /// An all-zero plane, used as the placeholder in a fresh trace result.
    pub fn zero() -> Plane {
        Plane {
            normal: Vector3::zero(),
            dist: 0.0,
            axis: None,
            sign_bits: 0,
        }
    }

    pub fn normal(&self) -> Vector3<f32> {
        self.normal
    }

    pub fn dist(&self) -> f32 {
        self.dist
    }

    pub fn axis(&self) -> Option<Axis> {
        self.axis
    }

    pub fn sign_bits(&self) -> u8 {
        self.sign_bits
    }

    /// Moves the plane without reorienting it. The box hull rewrites only
    /// the distances of its twelve fixed-normal planes on every reuse.
    pub fn set_dist(&mut self, dist: f32) {
        self.dist = dist;
    }

    /// Signed distance from `point` to the plane.
    pub fn point_dist(&self, point: Vector3<f32>) -> f32 {
        match self.axis {
            Some(a) => point[a as usize] - self.dist,
            None => point.dot(self.normal) - self.dist,
        }
    }
}

impl Neg for Plane {
    type Output = Plane;

    fn neg(self) -> Self::Output {
        Plane::new(-self.normal, -self.dist)
    }
}

pub fn sign_bits_for_normal(normal: Vector3<f32>) -> u8 {
    let mut bits = 0;
    for i in 0..3 {
        if normal[i] < 0.0 {
            bits |= 1 << i;
        }
    }
    bits
}

/// Classifies a box against a plane. This is the hottest test in the solver,
/// called once per BSP node per query.
///
/// The sign mask selects, per component, whether `maxs` or `mins`
/// contributes to the near corner, which yields the two extreme corner
/// distances without visiting all eight corners.
pub fn box_on_plane_side(mins: Vector3<f32>, maxs: Vector3<f32>, plane: &Plane) -> PlaneSides {
    // fast axial case
    if let Some(a) = plane.axis() {
        if plane.dist() <= mins[a as usize] {
            return PlaneSides::FRONT;
        }
        if plane.dist() >= maxs[a as usize] {
            return PlaneSides::BACK;
        }
        return PlaneSides::FRONT | PlaneSides::BACK;
    }

    let normal = plane.normal();
    let mut dist = [0.0f32; 2];
    for i in 0..3 {
        let b = (plane.sign_bits() >> i) & 1;
        dist[b as usize] += normal[i] * maxs[i];
        dist[(b ^ 1) as usize] += normal[i] * mins[i];
    }

    let mut sides = PlaneSides::empty();
    if dist[0] >= plane.dist() {
        sides |= PlaneSides::FRONT;
    }
    if dist[1] < plane.dist() {
        sides |= PlaneSides::BACK;
    }
    sides
}

/// An axis-aligned bounding box.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Bounds {
    pub mins: Vector3<f32>,
    pub maxs: Vector3<f32>,
}

impl Bounds {
    /// An inverted box which any added point will snap to.
    pub fn empty() -> Bounds {
        Bounds {
            mins: Vector3::new(99999.0, 99999.0, 99999.0),
            maxs: Vector3::new(-99999.0, -99999.0, -99999.0),
        }
    }

    pub fn new(mins: Vector3<f32>, maxs: Vector3<f32>) -> Bounds {
        Bounds { mins, maxs }
    }

    pub fn add_point(&mut self, p: Vector3<f32>) {
        for i in 0..3 {
            if p[i] < self.mins[i] {
                self.mins[i] = p[i];
            }
            if p[i] > self.maxs[i] {
                self.maxs[i] = p[i];
            }
        }
    }

    pub fn expand(&mut self, amount: f32) {
        for i in 0..3 {
            self.mins[i] -= amount;
            self.maxs[i] += amount;
        }
    }

    pub fn intersects(&self, other: &Bounds) -> bool {
        for i in 0..3 {
            if self.maxs[i] < other.mins[i] - BOUNDS_CLIP_EPSILON
                || self.mins[i] > other.maxs[i] + BOUNDS_CLIP_EPSILON
            {
                return false;
            }
        }
        true
    }

    pub fn intersects_point(&self, point: Vector3<f32>) -> bool {
        for i in 0..3 {
            if self.maxs[i] < point[i] - BOUNDS_CLIP_EPSILON
                || self.mins[i] > point[i] + BOUNDS_CLIP_EPSILON
            {
                return false;
            }
        }
        true
    }
}

/// Dot product accumulated in double precision.
pub fn dot64(a: Vector3<f32>, b: Vector3<f32>) -> f64 {
    a.x as f64 * b.x as f64 + a.y as f64 * b.y as f64 + a.z as f64 * b.z as f64
}

/// Cross product accumulated in double precision, truncated back to `f32`.
pub fn cross64(a: Vector3<f32>, b: Vector3<f32>) -> Vector3<f32> {
    let (ax, ay, az) = (a.x as f64, a.y as f64, a.z as f64);
    let (bx, by, bz) = (b.x as f64, b.y as f64, b.z as f64);
    Vector3::new(
        (ay * bz - az * by) as f32,
        (az * bx - ax * bz) as f32,
        (ax * by - ay * bx) as f32,
    )
}

/// Normalizes `v` in double precision, returning the normalized vector and
/// the length of the input. A zero input comes back unchanged with length 0,
/// which callers use to reject degenerate triangles and edges.
pub fn normalize64(v: Vector3<f32>) -> (Vector3<f32>, f64) {
    let (x, y, z) = (v.x as f64, v.y as f64, v.z as f64);
    let length_sq = x * x + y * y + z * z;
    if length_sq == 0.0 {
        return (v, 0.0);
    }
    let length = length_sq.sqrt();
    let inv = 1.0 / length;
    (
        Vector3::new((x * inv) as f32, (y * inv) as f32, (z * inv) as f32),
        length,
    )
}

/// Normalizes `v` in single precision, returning the normalized vector and
/// the length of the input.
pub fn normalize(v: Vector3<f32>) -> (Vector3<f32>, f32) {
    let length = v.magnitude();
    if length == 0.0 {
        return (v, 0.0);
    }
    (v / length, length)
}

/// Euler orientation of a submodel.
#[derive(Clone, Copy, Debug)]
pub struct Angles {
    pub pitch: Deg<f32>,
    pub yaw: Deg<f32>,
    pub roll: Deg<f32>,
}

impl Angles {
    pub fn zero() -> Angles {
        Angles {
            pitch: Deg(0.0),
            yaw: Deg(0.0),
            roll: Deg(0.0),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.pitch == Deg(0.0) && self.yaw == Deg(0.0) && self.roll == Deg(0.0)
    }
}

/// Unit forward/right/up vectors for an Euler orientation.
pub fn angle_vectors(angles: Angles) -> (Vector3<f32>, Vector3<f32>, Vector3<f32>) {
    let (sy, cy) = angles.yaw.sin_cos();
    let (sp, cp) = angles.pitch.sin_cos();
    let (sr, cr) = angles.roll.sin_cos();

    let forward = Vector3::new(cp * cy, cp * sy, -sp);
    let right = Vector3::new(-sr * sp * cy + cr * sy, -sr * sp * sy - cr * cy, -sr * cp);
    let up = Vector3::new(cr * sp * cy + sr * sy, cr * sp * sy - sr * cy, cr * cp);

    (forward, right, up)
}

/// Matrix that rotates a world-space point into the frame of reference of a
/// model oriented by `angles`. Apply the transpose to go back out.
pub fn rotation_matrix(angles: Angles) -> Matrix3<f32> {
    let (forward, right, up) = angle_vectors(angles);
    // rows are forward, -right, up
    Matrix3::from_cols(forward, -right, up).transpose()
}

fn project_point_onto_vector(
    point: Vector3<f32>,
    start: Vector3<f32>,
    dir: Vector3<f32>,
) -> Vector3<f32> {
    let p_vec = point - start;
    start + dir * p_vec.dot(dir)
}

/// Squared distance from `p` to the segment `lp1..lp2` whose unit direction
/// is `dir`.
pub fn distance_from_line_squared(
    p: Vector3<f32>,
    lp1: Vector3<f32>,
    lp2: Vector3<f32>,
    dir: Vector3<f32>,
) -> f32 {
    let proj = project_point_onto_vector(p, lp1, dir);
    for j in 0..3 {
        if (proj[j] > lp1[j] && proj[j] > lp2[j]) || (proj[j] < lp1[j] && proj[j] < lp2[j]) {
            // projection lands outside the segment; measure to the nearer end
            let t = if (proj[j] - lp1[j]).abs() < (proj[j] - lp2[j]).abs() {
                p - lp1
            } else {
                p - lp2
            };
            return t.magnitude2();
        }
    }
    (p - proj).magnitude2()
}

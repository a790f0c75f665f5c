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

//! Convex polygon clipping, used while building patch facets to prove that
//! a candidate facet is actually bounded by its border planes.

use cgmath::{InnerSpace, Vector3, Zero};

use crate::math::{cross64, dot64, normalize64, Bounds};

pub const MAX_POINTS_ON_WINDING: usize = 64;

/// Half the world per axis; a winding reaching this far is unbounded for
/// all practical purposes.
pub const MAX_MAP_BOUNDS: f32 = 65535.0;

/// A convex polygon, wound clockwise when viewed from its plane's front.
#[derive(Clone, Debug)]
pub struct Winding {
    points: Vec<Vector3<f32>>,
}

impl Winding {
    /// A quad spanning the whole world, lying in the given plane. Chopping
    /// it repeatedly against a facet's borders leaves the facet polygon.
    pub fn for_plane(normal: Vector3<f32>, dist: f32) -> Winding {
        // find the major axis
        let mut max = -MAX_MAP_BOUNDS;
        let mut x = None;
        for i in 0..3 {
            let v = normal[i].abs();
            if v > max {
                x = Some(i);
                max = v;
            }
        }
        let x = x.expect("base winding for zero plane");

        let mut up = Vector3::zero();
        match x {
            0 | 1 => up.z = 1.0,
            _ => up.x = 1.0,
        }

        let dot = dot64(up, normal);
        up += normal * (-dot as f32);
        let (up, _) = normalize64(up);

        let org = normal * dist;
        let right = cross64(up, normal);

        let up = up * MAX_MAP_BOUNDS;
        let right = right * MAX_MAP_BOUNDS;

        // project a world-sized axis-aligned box onto the plane
        Winding {
            points: vec![
                org - right + up,
                org + right + up,
                org + right - up,
                org - right - up,
            ],
        }
    }

    pub fn points(&self) -> &[Vector3<f32>] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Clips the winding against the plane, keeping the portion in front of
    /// it (`normal . x >= dist`). Returns `None` if nothing survives.
    ///
    /// ## Panics
    /// If the clipped polygon exceeds [`MAX_POINTS_ON_WINDING`]; facet
    /// construction never produces windings that large.
    pub fn chop(self, normal: Vector3<f32>, dist: f32, epsilon: f32) -> Option<Winding> {
        const SIDE_FRONT: usize = 0;
        const SIDE_BACK: usize = 1;
        const SIDE_ON: usize = 2;

        let mut dists = Vec::with_capacity(self.points.len() + 1);
        let mut sides = Vec::with_capacity(self.points.len() + 1);
        let mut counts = [0usize; 3];

        for p in &self.points {
            let dot = dot64(*p, normal) - dist as f64;
            let side = if dot > epsilon as f64 {
                SIDE_FRONT
            } else if dot < -(epsilon as f64) {
                SIDE_BACK
            } else {
                SIDE_ON
            };
            dists.push(dot);
            sides.push(side);
            counts[side] += 1;
        }
        sides.push(sides[0]);
        dists.push(dists[0]);

        if counts[SIDE_FRONT] == 0 {
            return None;
        }
        if counts[SIDE_BACK] == 0 {
            return Some(self);
        }

        let mut clipped = Vec::with_capacity(self.points.len() + 4);
        for i in 0..self.points.len() {
            let p1 = self.points[i];

            if sides[i] == SIDE_ON {
                clipped.push(p1);
                continue;
            }
            if sides[i] == SIDE_FRONT {
                clipped.push(p1);
            }
            if sides[i + 1] == SIDE_ON || sides[i + 1] == sides[i] {
                continue;
            }

            // generate a split point
            let p2 = self.points[(i + 1) % self.points.len()];
            let dot = dists[i] / (dists[i] - dists[i + 1]);
            let mut mid = Vector3::zero();
            for j in 0..3 {
                // avoid round off error when possible
                if normal[j] == 1.0 {
                    mid[j] = dist;
                } else if normal[j] == -1.0 {
                    mid[j] = -dist;
                } else {
                    mid[j] = p1[j] + (dot * (p2[j] as f64 - p1[j] as f64)) as f32;
                }
            }
            clipped.push(mid);
        }

        assert!(
            clipped.len() <= MAX_POINTS_ON_WINDING,
            "chop: MAX_POINTS_ON_WINDING",
        );

        Some(Winding { points: clipped })
    }

    pub fn bounds(&self) -> Bounds {
        let mut bounds = Bounds::empty();
        for p in &self.points {
            bounds.add_point(*p);
        }
        bounds
    }
}

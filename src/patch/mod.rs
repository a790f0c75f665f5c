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

//! Converts a quadratic Bezier patch mesh into convex facets the trace
//! solver can clip against like brushes.
//!
//! The control-point grid is refined column by column until every segment is
//! within [`SUBDIVIDE_DISTANCE`] of the true curve, transposed, refined
//! again, and stripped of degenerate columns. Each resulting quad (or pair
//! of triangles, when the quad is not planar) becomes a facet: a surface
//! plane plus border planes taken from the neighboring quads, completed
//! with axial and edge-slanted bevel planes so that a swept box cannot slip
//! around a facet's rim.
//!
//! Collision against curved surfaces has real sharp edges, so to speak:
//! plane expansion can push a raw surface outside its expanded bounding
//! box, a position test of a point against a surface with no volume is not
//! well defined, and meshes with partially degenerate rows survive only
//! because completely degenerate rows and columns are removed first.

mod winding;

use arrayvec::ArrayVec;
use cgmath::{Vector3, Zero};
use failure::{bail, ensure, Error};

use crate::math::{cross64, dot64, normalize64, sign_bits_for_normal, Bounds};
use self::winding::Winding;
pub(crate) use self::winding::MAX_MAP_BOUNDS;

pub const MAX_FACETS: usize = 1024;
// old engine versions used 2048 and crash on some defrag maps
pub const MAX_PATCH_PLANES: usize = 2048 + 128;
pub const MAX_GRID_SIZE: usize = 129;
/// Hard cap on borders per facet: 4 sides + 6 axial bevels + 16 edge bevels.
pub const MAX_FACET_BORDERS: usize = 4 + 6 + 16;

/// Never approximate the curve by more than this many units.
const SUBDIVIDE_DISTANCE: f32 = 16.0;
const PLANE_TRI_EPSILON: f32 = 0.1;
const WRAP_POINT_EPSILON: f32 = 0.1;
const GRID_POINT_EPSILON: f32 = 0.1;
const NORMAL_EPSILON: f32 = 0.0001;
const DIST_EPSILON: f32 = 0.02;
const CHOP_EPSILON: f32 = 0.1;

const EN_TOP: usize = 0;
const EN_RIGHT: usize = 1;
const EN_BOTTOM: usize = 2;
const EN_LEFT: usize = 3;

/// A facet boundary plane, stored in the patch's own plane table.
#[derive(Copy, Clone, Debug)]
pub struct PatchPlane {
    pub(crate) normal: Vector3<f32>,
    pub(crate) dist: f32,
    pub(crate) sign_bits: u8,
}

impl PatchPlane {
    fn new(normal: Vector3<f32>, dist: f32) -> PatchPlane {
        PatchPlane {
            normal,
            dist,
            sign_bits: sign_bits_for_normal(normal),
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct FacetBorder {
    pub(crate) plane: usize,
    /// The border plane's normal points into the facet.
    pub(crate) inward: bool,
    /// The border must not be Minkowski-expanded; it came from an adjacent
    /// facet's surface plane and already bounds the shared edge exactly.
    pub(crate) no_adjust: bool,
}

/// A convex region of the patch surface: one surface plane fenced by up to
/// [`MAX_FACET_BORDERS`] border planes.
#[derive(Clone, Debug)]
pub struct Facet {
    pub(crate) surface_plane: usize,
    pub(crate) borders: ArrayVec<[FacetBorder; MAX_FACET_BORDERS]>,
}

/// The collision form of one patch surface. Built once at map load,
/// immutable afterwards.
#[derive(Clone, Debug)]
pub struct PatchCollide {
    pub(crate) bounds: Bounds,
    pub(crate) planes: Vec<PatchPlane>,
    pub(crate) facets: Vec<Facet>,
}

impl PatchCollide {
    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    pub fn num_facets(&self) -> usize {
        self.facets.len()
    }
}

#[derive(Copy, Clone, PartialEq)]
enum Side {
    Front,
    Back,
    On,
}

/// The control-point grid under refinement. Indexed `(column, row)`.
struct Grid {
    width: usize,
    height: usize,
    wrap_width: bool,
    wrap_height: bool,
    points: Vec<Vector3<f32>>,
}

impl Grid {
    fn new(width: usize, height: usize) -> Grid {
        Grid {
            width,
            height,
            wrap_width: false,
            wrap_height: false,
            points: vec![Vector3::zero(); MAX_GRID_SIZE * MAX_GRID_SIZE],
        }
    }

    fn point(&self, i: usize, j: usize) -> Vector3<f32> {
        self.points[i * MAX_GRID_SIZE + j]
    }

    fn set_point(&mut self, i: usize, j: usize, p: Vector3<f32>) {
        self.points[i * MAX_GRID_SIZE + j] = p;
    }

    /// Marks the grid as cylindrical if the first and last columns coincide
    /// on every row.
    fn set_wrap_width(&mut self) {
        let mut wrap = true;
        'rows: for j in 0..self.height {
            for c in 0..3 {
                let d = self.point(0, j)[c] - self.point(self.width - 1, j)[c];
                if d < -WRAP_POINT_EPSILON || d > WRAP_POINT_EPSILON {
                    wrap = false;
                    break 'rows;
                }
            }
        }
        self.wrap_width = wrap;
    }

    /// Swaps rows and columns, including the wrap flags.
    fn transpose(&mut self) {
        let mut points = vec![Vector3::zero(); MAX_GRID_SIZE * MAX_GRID_SIZE];
        for i in 0..self.height {
            for j in 0..self.width {
                points[i * MAX_GRID_SIZE + j] = self.point(j, i);
            }
        }
        self.points = points;

        std::mem::swap(&mut self.width, &mut self.height);
        std::mem::swap(&mut self.wrap_width, &mut self.wrap_height);
    }

    /// Inserts columns until every approximating control point is within
    /// [`SUBDIVIDE_DISTANCE`] of the curve, collapsing columns that are
    /// already flat.
    fn subdivide_columns(&mut self) {
        let mut i = 0;
        while i + 2 < self.width {
            // column i interpolates, column i+1 approximates, column i+2
            // interpolates; see if the approximation is already flat enough
            let mut flat = true;
            for j in 0..self.height {
                if needs_subdivision(
                    self.point(i, j),
                    self.point(i + 1, j),
                    self.point(i + 2, j),
                ) {
                    flat = false;
                    break;
                }
            }

            if flat {
                // collapse the approximating column away
                for j in 0..self.height {
                    for k in i + 2..self.width {
                        let p = self.point(k, j);
                        self.set_point(k - 1, j, p);
                    }
                }
                self.width -= 1;
                // go to the next curve segment
                i += 1;
                continue;
            }

            if self.width + 2 > MAX_GRID_SIZE {
                warn!("grid subdivision overflowed MAX_GRID_SIZE");
                break;
            }

            for j in 0..self.height {
                let prev = self.point(i, j);
                let mid = self.point(i + 1, j);
                let next = self.point(i + 2, j);

                // make room for two additional columns
                let mut k = self.width - 1;
                while k > i + 1 {
                    let p = self.point(k, j);
                    self.set_point(k + 2, j, p);
                    k -= 1;
                }

                let (out1, out2, out3) = subdivide(prev, mid, next);
                self.set_point(i + 1, j, out1);
                self.set_point(i + 2, j, out2);
                self.set_point(i + 3, j, out3);
            }
            self.width += 2;
            // the new approximating column at i+1 may itself need to be
            // collapsed or subdivided farther, so don't advance i
        }
    }

    /// Removes columns which coincide with their neighbor on every row.
    fn remove_degenerate_columns(&mut self) {
        let mut i = 0;
        while i + 1 < self.width {
            let mut degenerate = true;
            for j in 0..self.height {
                if !compare_points(self.point(i, j), self.point(i + 1, j)) {
                    degenerate = false;
                    break;
                }
            }
            if !degenerate {
                i += 1;
                continue;
            }

            for j in 0..self.height {
                for k in i + 2..self.width {
                    let p = self.point(k, j);
                    self.set_point(k - 1, j, p);
                }
            }
            self.width -= 1;
            // re-check this column against its new neighbor
        }
    }
}

/// True if the quadratic segment through `b` strays far enough from the
/// chord `a..c` to matter for collision.
fn needs_subdivision(a: Vector3<f32>, b: Vector3<f32>, c: Vector3<f32>) -> bool {
    // linear midpoint vs exact curve midpoint
    let lmid = (a + c) * 0.5;
    let cmid = ((a + b) * 0.5 + (b + c) * 0.5) * 0.5;
    let delta = cmid - lmid;
    dot64(delta, delta).sqrt() >= SUBDIVIDE_DISTANCE as f64
}

/// De Casteljau split: `a, out1, out2, out3, c` replaces `a, b, c`.
fn subdivide(
    a: Vector3<f32>,
    b: Vector3<f32>,
    c: Vector3<f32>,
) -> (Vector3<f32>, Vector3<f32>, Vector3<f32>) {
    let out1 = (a + b) * 0.5;
    let out3 = (b + c) * 0.5;
    let out2 = (out1 + out3) * 0.5;
    (out1, out2, out3)
}

fn compare_points(a: Vector3<f32>, b: Vector3<f32>) -> bool {
    for c in 0..3 {
        let d = a[c] - b[c];
        if d < -GRID_POINT_EPSILON || d > GRID_POINT_EPSILON {
            return false;
        }
    }
    true
}

fn plane_from_points(
    a: Vector3<f32>,
    b: Vector3<f32>,
    c: Vector3<f32>,
) -> Option<(Vector3<f32>, f32)> {
    let d1 = b - a;
    let d2 = c - a;
    let (normal, length) = normalize64(cross64(d2, d1));
    if length == 0.0 {
        return None;
    }
    Some((normal, dot64(a, normal) as f32))
}

/// Matches an existing plane against a candidate in either orientation.
/// Returns `Some(true)` when the stored plane is the candidate's flip.
fn plane_equal(p: &PatchPlane, normal: Vector3<f32>, dist: f32) -> Option<bool> {
    if (p.normal.x - normal.x).abs() < NORMAL_EPSILON
        && (p.normal.y - normal.y).abs() < NORMAL_EPSILON
        && (p.normal.z - normal.z).abs() < NORMAL_EPSILON
        && (p.dist - dist).abs() < DIST_EPSILON
    {
        return Some(false);
    }

    if (p.normal.x + normal.x).abs() < NORMAL_EPSILON
        && (p.normal.y + normal.y).abs() < NORMAL_EPSILON
        && (p.normal.z + normal.z).abs() < NORMAL_EPSILON
        && (p.dist + dist).abs() < DIST_EPSILON
    {
        return Some(true);
    }

    None
}

/// Snaps near-axial unit vectors exactly onto the axis.
fn snap_vector(mut normal: Vector3<f32>) -> Vector3<f32> {
    for i in 0..3 {
        if (normal[i] - 1.0).abs() < NORMAL_EPSILON {
            normal = Vector3::zero();
            normal[i] = 1.0;
            break;
        }
        if (normal[i] + 1.0).abs() < NORMAL_EPSILON {
            normal = Vector3::zero();
            normal[i] = -1.0;
            break;
        }
    }
    normal
}

/// Per-triangle plane indices of the refined grid; -1 marks a degenerate
/// triangle.
struct GridPlanes {
    data: Vec<[i32; 2]>,
}

impl GridPlanes {
    fn new() -> GridPlanes {
        GridPlanes {
            data: vec![[-1, -1]; MAX_GRID_SIZE * MAX_GRID_SIZE],
        }
    }

    fn get(&self, i: usize, j: usize, tri: usize) -> i32 {
        self.data[i * MAX_GRID_SIZE + j][tri]
    }

    fn set(&mut self, i: usize, j: usize, tri: usize, plane: i32) {
        self.data[i * MAX_GRID_SIZE + j][tri] = plane;
    }

    /// A usable plane for quad `(i, j)`, falling back to the twin triangle.
    fn grid_plane(&self, i: usize, j: usize, tri: usize) -> i32 {
        let p = self.get(i, j, tri);
        if p != -1 {
            return p;
        }
        let p = self.get(i, j, tri ^ 1);
        if p != -1 {
            return p;
        }
        // should never happen
        warn!("grid_plane unresolvable");
        -1
    }
}

#[derive(Clone)]
struct WorkBorder {
    plane: i32,
    inward: bool,
    no_adjust: bool,
}

/// A facet under construction; border planes may still be -1 until
/// validation rejects or repairs them.
struct WorkFacet {
    surface_plane: i32,
    borders: Vec<WorkBorder>,
}

/// Build-local scratch: the shared plane table and the accumulated facets.
/// One builder per patch; nothing here is shared across builds, so patches
/// can be built in parallel at load time.
struct PatchCollideBuilder {
    planes: Vec<PatchPlane>,
    facets: Vec<Facet>,
}

impl PatchCollideBuilder {
    fn new() -> PatchCollideBuilder {
        PatchCollideBuilder {
            planes: Vec::new(),
            facets: Vec::new(),
        }
    }

    /// Finds or adds the plane through three points, matching loosely by
    /// point distance. Returns -1 for a degenerate triangle.
    fn find_plane(
        &mut self,
        p1: Vector3<f32>,
        p2: Vector3<f32>,
        p3: Vector3<f32>,
    ) -> Result<i32, Error> {
        let (normal, dist) = match plane_from_points(p1, p2, p3) {
            Some(p) => p,
            None => return Ok(-1),
        };

        // see if the points are close enough to an existing plane
        for (i, p) in self.planes.iter().enumerate() {
            if dot64(normal, p.normal) < 0.0 {
                continue; // allow backwards planes?
            }
            let close = |point: Vector3<f32>| {
                let d = dot64(point, p.normal) as f32 - p.dist;
                d >= -PLANE_TRI_EPSILON && d <= PLANE_TRI_EPSILON
            };
            if close(p1) && close(p2) && close(p3) {
                return Ok(i as i32);
            }
        }

        ensure!(self.planes.len() < MAX_PATCH_PLANES, "MAX_PATCH_PLANES");
        self.planes.push(PatchPlane::new(normal, dist));
        Ok(self.planes.len() as i32 - 1)
    }

    /// Finds or adds a plane by strict equality in either orientation,
    /// reporting whether the match was flipped.
    fn find_plane2(&mut self, normal: Vector3<f32>, dist: f32) -> Result<(i32, bool), Error> {
        for (i, p) in self.planes.iter().enumerate() {
            if let Some(flipped) = plane_equal(p, normal, dist) {
                return Ok((i as i32, flipped));
            }
        }

        ensure!(self.planes.len() < MAX_PATCH_PLANES, "MAX_PATCH_PLANES");
        self.planes.push(PatchPlane::new(normal, dist));
        Ok((self.planes.len() as i32 - 1, false))
    }

    /// Synthesizes a border plane through a grid edge by raising the edge 4
    /// units along the triangle normal.
    fn edge_plane_num(
        &mut self,
        grid: &Grid,
        grid_planes: &GridPlanes,
        i: usize,
        j: usize,
        k: usize,
    ) -> Result<i32, Error> {
        let raise = |builder: &Self, p: i32, point: Vector3<f32>| {
            point + builder.planes[p as usize].normal * 4.0
        };

        match k {
            // top border
            0 => {
                let p1 = grid.point(i, j);
                let p2 = grid.point(i + 1, j);
                let p = grid_planes.grid_plane(i, j, 0);
                if p == -1 {
                    return Ok(-1);
                }
                let up = raise(self, p, p1);
                self.find_plane(p1, p2, up)
            }

            // bottom border
            2 => {
                let p1 = grid.point(i, j + 1);
                let p2 = grid.point(i + 1, j + 1);
                let p = grid_planes.grid_plane(i, j, 1);
                if p == -1 {
                    return Ok(-1);
                }
                let up = raise(self, p, p1);
                self.find_plane(p2, p1, up)
            }

            // left border
            3 => {
                let p1 = grid.point(i, j);
                let p2 = grid.point(i, j + 1);
                let p = grid_planes.grid_plane(i, j, 1);
                if p == -1 {
                    return Ok(-1);
                }
                let up = raise(self, p, p1);
                self.find_plane(p2, p1, up)
            }

            // right border
            1 => {
                let p1 = grid.point(i + 1, j);
                let p2 = grid.point(i + 1, j + 1);
                let p = grid_planes.grid_plane(i, j, 0);
                if p == -1 {
                    return Ok(-1);
                }
                let up = raise(self, p, p1);
                self.find_plane(p1, p2, up)
            }

            // diagonal out of triangle 0
            4 => {
                let p1 = grid.point(i + 1, j + 1);
                let p2 = grid.point(i, j);
                let p = grid_planes.grid_plane(i, j, 0);
                if p == -1 {
                    return Ok(-1);
                }
                let up = raise(self, p, p1);
                self.find_plane(p1, p2, up)
            }

            // diagonal out of triangle 1
            5 => {
                let p1 = grid.point(i, j);
                let p2 = grid.point(i + 1, j + 1);
                let p = grid_planes.grid_plane(i, j, 1);
                if p == -1 {
                    return Ok(-1);
                }
                let up = raise(self, p, p1);
                self.find_plane(p1, p2, up)
            }

            _ => bail!("edge_plane_num: bad k {}", k),
        }
    }

    fn point_on_plane_side(&self, p: Vector3<f32>, plane_num: i32) -> Side {
        if plane_num == -1 {
            return Side::On;
        }
        let plane = &self.planes[plane_num as usize];
        let dot = dot64(p, plane.normal) - plane.dist as f64;
        if dot > PLANE_TRI_EPSILON as f64 {
            Side::Front
        } else if dot < -PLANE_TRI_EPSILON as f64 {
            Side::Back
        } else {
            Side::On
        }
    }

    /// Orients every border so its inward bit points at the facet. A border
    /// that lies in the facet's plane is cleared; a border that bisects the
    /// facet is bad patch data and is noted but kept.
    fn set_border_inward(
        &self,
        facet: &mut WorkFacet,
        grid: &Grid,
        i: usize,
        j: usize,
        which: i32,
    ) {
        let mut points = [Vector3::zero(); 4];
        let num_points;
        match which {
            -1 => {
                points = [
                    grid.point(i, j),
                    grid.point(i + 1, j),
                    grid.point(i + 1, j + 1),
                    grid.point(i, j + 1),
                ];
                num_points = 4;
            }
            0 => {
                points[0] = grid.point(i, j);
                points[1] = grid.point(i + 1, j);
                points[2] = grid.point(i + 1, j + 1);
                num_points = 3;
            }
            1 => {
                points[0] = grid.point(i + 1, j + 1);
                points[1] = grid.point(i, j + 1);
                points[2] = grid.point(i, j);
                num_points = 3;
            }
            _ => unreachable!("set_border_inward: bad which {}", which),
        }
        let points = &points[..num_points];

        for border in facet.borders.iter_mut() {
            let mut front = 0;
            let mut back = 0;
            for point in points {
                match self.point_on_plane_side(*point, border.plane) {
                    Side::Front => front += 1,
                    Side::Back => back += 1,
                    Side::On => (),
                }
            }

            if front > 0 && back == 0 {
                border.inward = true;
            } else if back > 0 && front == 0 {
                border.inward = false;
            } else if front == 0 && back == 0 {
                // flat side border
                border.plane = -1;
            } else {
                // bisecting side border
                warn!("set_border_inward: mixed plane sides");
                border.inward = false;
            }
        }
    }

    /// Proves the facet is a bounded region by chopping a world-sized
    /// winding with every border. A facet whose winding vanishes, or
    /// escapes the world, is missing a plane and gets dropped.
    fn validate_facet(&self, facet: &WorkFacet) -> bool {
        if facet.surface_plane == -1 {
            return false;
        }

        let surface = &self.planes[facet.surface_plane as usize];
        let mut w = Some(Winding::for_plane(surface.normal, surface.dist));
        for border in &facet.borders {
            if border.plane == -1 {
                return false;
            }
            let plane = &self.planes[border.plane as usize];
            let (normal, dist) = if border.inward {
                (plane.normal, plane.dist)
            } else {
                (-plane.normal, -plane.dist)
            };
            w = match w.take() {
                Some(cur) => cur.chop(normal, dist, CHOP_EPSILON),
                None => break,
            };
        }

        let w = match w {
            Some(w) => w,
            // winding was completely chopped away
            None => return false,
        };

        // see if the facet is unreasonably large
        let bounds = w.bounds();
        for j in 0..3 {
            if bounds.maxs[j] - bounds.mins[j] > MAX_MAP_BOUNDS {
                return false; // we must be missing a plane
            }
            if bounds.mins[j] >= MAX_MAP_BOUNDS || bounds.maxs[j] <= -MAX_MAP_BOUNDS {
                return false;
            }
        }
        true
    }

    /// Fences the facet with bevel planes: one per axial direction tangent
    /// to its bounds, one per viable slant of each non-axial edge, and
    /// finally the flip of the surface plane as a ceiling.
    fn add_facet_bevels(&mut self, facet: &mut WorkFacet) -> Result<(), Error> {
        let surface = self.planes[facet.surface_plane as usize];
        let mut w = Some(Winding::for_plane(surface.normal, surface.dist));
        for border in &facet.borders {
            if border.plane == facet.surface_plane {
                continue;
            }
            let plane = &self.planes[border.plane as usize];
            let (normal, dist) = if border.inward {
                (plane.normal, plane.dist)
            } else {
                (-plane.normal, -plane.dist)
            };
            w = match w.take() {
                Some(cur) => cur.chop(normal, dist, CHOP_EPSILON),
                None => break,
            };
        }
        let w = match w {
            Some(w) => w,
            None => return Ok(()),
        };

        let bounds = w.bounds();

        // add the axial planes
        for axis in 0..3 {
            for &dir in &[-1.0f32, 1.0] {
                let mut normal = Vector3::zero();
                normal[axis] = dir;
                let dist = if dir == 1.0 {
                    bounds.maxs[axis]
                } else {
                    -bounds.mins[axis]
                };

                // if it's the surface plane
                if plane_equal(&self.planes[facet.surface_plane as usize], normal, dist)
                    .is_some()
                {
                    continue;
                }
                // see if the plane is already present
                if facet.borders.iter().any(|b| {
                    plane_equal(&self.planes[b.plane as usize], normal, dist).is_some()
                }) {
                    continue;
                }

                if facet.borders.len() >= MAX_FACET_BORDERS {
                    warn!("too many bevels");
                    continue;
                }
                let (index, flipped) = self.find_plane2(normal, dist)?;
                facet.borders.push(WorkBorder {
                    plane: index,
                    inward: flipped,
                    no_adjust: false,
                });
            }
        }

        // add the edge bevels: test each non-axial edge against the six
        // slant planes it could need
        for j in 0..w.len() {
            let k = (j + 1) % w.len();
            let (edge, length) = normalize64(w.points()[j] - w.points()[k]);
            // degenerate edge
            if length < 0.5 {
                continue;
            }
            let edge = snap_vector(edge);
            if (0..3).any(|c| edge[c] == -1.0 || edge[c] == 1.0) {
                continue; // only test non-axial edges
            }

            for axis in 0..3 {
                for &dir in &[-1.0f32, 1.0] {
                    let mut vec2 = Vector3::zero();
                    vec2[axis] = dir;
                    let (normal, length) = normalize64(cross64(edge, vec2));
                    if length < 0.5 {
                        continue;
                    }
                    let dist = dot64(w.points()[j], normal) as f32;

                    // a proper edge bevel has every facet point behind it
                    let in_front = w
                        .points()
                        .iter()
                        .any(|p| dot64(*p, normal) - dist as f64 > 0.1);
                    if in_front {
                        continue;
                    }

                    // if it's the surface plane
                    if plane_equal(&self.planes[facet.surface_plane as usize], normal, dist)
                        .is_some()
                    {
                        continue;
                    }
                    // see if the plane is already present
                    if facet.borders.iter().any(|b| {
                        plane_equal(&self.planes[b.plane as usize], normal, dist).is_some()
                    }) {
                        continue;
                    }

                    if facet.borders.len() >= MAX_FACET_BORDERS {
                        warn!("too many bevels");
                        continue;
                    }
                    let (index, flipped) = self.find_plane2(normal, dist)?;

                    if facet.borders.iter().any(|b| b.plane == index) {
                        warn!("bevel plane already used");
                    }

                    // a bevel that chops the facet winding away entirely is
                    // from bad data; drop it and keep the facet
                    let plane = &self.planes[index as usize];
                    let (chop_normal, chop_dist) = if flipped {
                        (plane.normal, plane.dist)
                    } else {
                        (-plane.normal, -plane.dist)
                    };
                    if w.clone().chop(chop_normal, chop_dist, CHOP_EPSILON).is_none() {
                        debug!("add_facet_bevels: invalid bevel");
                        continue;
                    }

                    facet.borders.push(WorkBorder {
                        plane: index,
                        inward: flipped,
                        no_adjust: false,
                    });
                }
            }
        }

        // add the opposite of the surface plane as a ceiling
        if facet.borders.len() >= MAX_FACET_BORDERS {
            warn!("too many bevels");
            return Ok(());
        }
        facet.borders.push(WorkBorder {
            plane: facet.surface_plane,
            inward: true,
            no_adjust: false,
        });

        Ok(())
    }

    fn push_facet(&mut self, facet: WorkFacet) {
        let mut borders = ArrayVec::new();
        for b in facet.borders {
            debug_assert!(b.plane >= 0);
            borders.push(FacetBorder {
                plane: b.plane as usize,
                inward: b.inward,
                no_adjust: b.no_adjust,
            });
        }
        self.facets.push(Facet {
            surface_plane: facet.surface_plane as usize,
            borders,
        });
    }

    /// Turns each quad of the refined grid into one planar facet or two
    /// triangle facets, bordered by its neighbors' planes.
    fn from_grid(&mut self, grid: &Grid) -> Result<(), Error> {
        // find the planes for each triangle of the grid
        let mut grid_planes = GridPlanes::new();
        for i in 0..grid.width - 1 {
            for j in 0..grid.height - 1 {
                let p = self.find_plane(
                    grid.point(i, j),
                    grid.point(i + 1, j),
                    grid.point(i + 1, j + 1),
                )?;
                grid_planes.set(i, j, 0, p);

                let p = self.find_plane(
                    grid.point(i + 1, j + 1),
                    grid.point(i, j + 1),
                    grid.point(i, j),
                )?;
                grid_planes.set(i, j, 1, p);
            }
        }

        // create the borders for each facet
        for i in 0..grid.width - 1 {
            for j in 0..grid.height - 1 {
                let mut borders = [-1i32; 4];
                let mut no_adjust = [false; 4];

                borders[EN_TOP] = if j > 0 {
                    grid_planes.get(i, j - 1, 1)
                } else if grid.wrap_height {
                    grid_planes.get(i, grid.height - 2, 1)
                } else {
                    -1
                };
                no_adjust[EN_TOP] = borders[EN_TOP] == grid_planes.get(i, j, 0);
                if borders[EN_TOP] == -1 || no_adjust[EN_TOP] {
                    borders[EN_TOP] = self.edge_plane_num(grid, &grid_planes, i, j, 0)?;
                }

                borders[EN_BOTTOM] = if j < grid.height - 2 {
                    grid_planes.get(i, j + 1, 0)
                } else if grid.wrap_height {
                    grid_planes.get(i, 0, 0)
                } else {
                    -1
                };
                no_adjust[EN_BOTTOM] = borders[EN_BOTTOM] == grid_planes.get(i, j, 1);
                if borders[EN_BOTTOM] == -1 || no_adjust[EN_BOTTOM] {
                    borders[EN_BOTTOM] = self.edge_plane_num(grid, &grid_planes, i, j, 2)?;
                }

                borders[EN_LEFT] = if i > 0 {
                    grid_planes.get(i - 1, j, 0)
                } else if grid.wrap_width {
                    grid_planes.get(grid.width - 2, j, 0)
                } else {
                    -1
                };
                no_adjust[EN_LEFT] = borders[EN_LEFT] == grid_planes.get(i, j, 1);
                if borders[EN_LEFT] == -1 || no_adjust[EN_LEFT] {
                    borders[EN_LEFT] = self.edge_plane_num(grid, &grid_planes, i, j, 3)?;
                }

                borders[EN_RIGHT] = if i < grid.width - 2 {
                    grid_planes.get(i + 1, j, 1)
                } else if grid.wrap_width {
                    grid_planes.get(0, j, 1)
                } else {
                    -1
                };
                no_adjust[EN_RIGHT] = borders[EN_RIGHT] == grid_planes.get(i, j, 0);
                if borders[EN_RIGHT] == -1 || no_adjust[EN_RIGHT] {
                    borders[EN_RIGHT] = self.edge_plane_num(grid, &grid_planes, i, j, 1)?;
                }

                ensure!(self.facets.len() < MAX_FACETS, "MAX_FACETS");

                if grid_planes.get(i, j, 0) == grid_planes.get(i, j, 1) {
                    // one planar quad facet
                    if grid_planes.get(i, j, 0) == -1 {
                        continue; // degenerate
                    }
                    let mut facet = WorkFacet {
                        surface_plane: grid_planes.get(i, j, 0),
                        borders: vec![
                            WorkBorder {
                                plane: borders[EN_TOP],
                                inward: false,
                                no_adjust: no_adjust[EN_TOP],
                            },
                            WorkBorder {
                                plane: borders[EN_RIGHT],
                                inward: false,
                                no_adjust: no_adjust[EN_RIGHT],
                            },
                            WorkBorder {
                                plane: borders[EN_BOTTOM],
                                inward: false,
                                no_adjust: no_adjust[EN_BOTTOM],
                            },
                            WorkBorder {
                                plane: borders[EN_LEFT],
                                inward: false,
                                no_adjust: no_adjust[EN_LEFT],
                            },
                        ],
                    };
                    self.set_border_inward(&mut facet, grid, i, j, -1);
                    if self.validate_facet(&facet) {
                        self.add_facet_bevels(&mut facet)?;
                        self.push_facet(facet);
                    }
                } else {
                    // two separate triangles
                    let mut third = grid_planes.get(i, j, 1);
                    if third == -1 {
                        third = borders[EN_BOTTOM];
                        if third == -1 {
                            third = self.edge_plane_num(grid, &grid_planes, i, j, 4)?;
                        }
                    }
                    let mut facet = WorkFacet {
                        surface_plane: grid_planes.get(i, j, 0),
                        borders: vec![
                            WorkBorder {
                                plane: borders[EN_TOP],
                                inward: false,
                                no_adjust: no_adjust[EN_TOP],
                            },
                            WorkBorder {
                                plane: borders[EN_RIGHT],
                                inward: false,
                                no_adjust: no_adjust[EN_RIGHT],
                            },
                            WorkBorder {
                                plane: third,
                                inward: false,
                                no_adjust: false,
                            },
                        ],
                    };
                    self.set_border_inward(&mut facet, grid, i, j, 0);
                    if self.validate_facet(&facet) {
                        self.add_facet_bevels(&mut facet)?;
                        self.push_facet(facet);
                    }

                    ensure!(self.facets.len() < MAX_FACETS, "MAX_FACETS");

                    let mut third = grid_planes.get(i, j, 0);
                    if third == -1 {
                        third = borders[EN_TOP];
                        if third == -1 {
                            third = self.edge_plane_num(grid, &grid_planes, i, j, 5)?;
                        }
                    }
                    let mut facet = WorkFacet {
                        surface_plane: grid_planes.get(i, j, 1),
                        borders: vec![
                            WorkBorder {
                                plane: borders[EN_BOTTOM],
                                inward: false,
                                no_adjust: no_adjust[EN_BOTTOM],
                            },
                            WorkBorder {
                                plane: borders[EN_LEFT],
                                inward: false,
                                no_adjust: no_adjust[EN_LEFT],
                            },
                            WorkBorder {
                                plane: third,
                                inward: false,
                                no_adjust: false,
                            },
                        ],
                    };
                    self.set_border_inward(&mut facet, grid, i, j, 1);
                    if self.validate_facet(&facet) {
                        self.add_facet_bevels(&mut facet)?;
                        self.push_facet(facet);
                    }
                }
            }
        }

        Ok(())
    }
}

/// Builds the collision form of a quadratic patch whose control points are
/// packed as concatenated rows.
///
/// Both dimensions must be odd (quadratic curves interpolate every other
/// point) and at least 3.
pub fn generate_patch_collide(
    width: usize,
    height: usize,
    points: &[Vector3<f32>],
) -> Result<PatchCollide, Error> {
    ensure!(
        width > 2 && height > 2,
        "generate_patch_collide: bad parameters ({}, {})",
        width,
        height,
    );
    ensure!(
        width % 2 == 1 && height % 2 == 1,
        "generate_patch_collide: even sizes are invalid for quadratic meshes"
    );
    ensure!(
        width <= MAX_GRID_SIZE && height <= MAX_GRID_SIZE,
        "generate_patch_collide: source is > MAX_GRID_SIZE"
    );
    ensure!(
        points.len() >= width * height,
        "generate_patch_collide: not enough control points"
    );

    let mut grid = Grid::new(width, height);
    for i in 0..width {
        for j in 0..height {
            grid.set_point(i, j, points[j * width + i]);
        }
    }

    // subdivide both directions until flat enough; the grid is left in its
    // transposed orientation, which changes nothing for collision
    grid.set_wrap_width();
    grid.subdivide_columns();
    grid.remove_degenerate_columns();
    grid.transpose();
    grid.set_wrap_width();
    grid.subdivide_columns();
    grid.remove_degenerate_columns();

    // we now have a grid of points exactly on the curve; the approximate
    // surface defined by these points will be collided against
    let mut bounds = Bounds::empty();
    for i in 0..grid.width {
        for j in 0..grid.height {
            bounds.add_point(grid.point(i, j));
        }
    }

    let mut builder = PatchCollideBuilder::new();
    builder.from_grid(&grid)?;

    // expand by one unit for epsilon purposes
    bounds.expand(1.0);

    Ok(PatchCollide {
        bounds,
        planes: builder.planes,
        facets: builder.facets,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    /// A flat 3x3 grid in the z = 0 plane spanning 0..64 in x and y.
    fn flat_points() -> Vec<Vector3<f32>> {
        let mut points = Vec::new();
        for j in 0..3 {
            for i in 0..3 {
                points.push(Vector3::new(i as f32 * 32.0, j as f32 * 32.0, 0.0));
            }
        }
        points
    }

    /// A 3x3 grid curved upward along x.
    fn bump_points(height: f32) -> Vec<Vector3<f32>> {
        let mut points = Vec::new();
        for j in 0..3 {
            for i in 0..3 {
                let z = if i == 1 { height } else { 0.0 };
                points.push(Vector3::new(i as f32 * 64.0, j as f32 * 64.0, z));
            }
        }
        points
    }

    #[test]
    fn test_parameter_validation() {
        let points = flat_points();
        assert!(generate_patch_collide(2, 3, &points).is_err());
        assert!(generate_patch_collide(4, 3, &points).is_err());
        assert!(generate_patch_collide(3, 4, &points).is_err());
        assert!(generate_patch_collide(131, 3, &points).is_err());
        assert!(generate_patch_collide(3, 3, &points[..4]).is_err());
    }

    #[test]
    fn test_flat_grid_facets() {
        let pc = generate_patch_collide(3, 3, &flat_points()).unwrap();

        // a flat grid collapses to one plane per orientation and its facets
        // all share it as the surface plane
        assert!(pc.num_facets() >= 1);
        let surface = pc.facets[0].surface_plane;
        for facet in &pc.facets {
            assert_eq!(facet.surface_plane, surface);
            // the final border is always the ceiling: the surface plane
            // flipped inward
            let last = facet.borders.last().unwrap();
            assert_eq!(last.plane, surface);
            assert!(last.inward);
            assert!(facet.borders.len() <= MAX_FACET_BORDERS);
        }

        // bounds cover the grid expanded by a unit
        assert!(pc.bounds().mins.x <= -1.0 && pc.bounds().mins.x >= -1.5);
        assert!(pc.bounds().maxs.x >= 65.0 && pc.bounds().maxs.x <= 65.5);
        assert!(pc.bounds().maxs.z >= 1.0);
    }

    #[test]
    fn test_curved_grid_subdivides() {
        let flat = generate_patch_collide(3, 3, &bump_points(4.0)).unwrap();
        let curved = generate_patch_collide(3, 3, &bump_points(48.0)).unwrap();

        // a pronounced curve must refine into strictly more facets than a
        // nearly flat one
        assert!(curved.num_facets() > flat.num_facets());
        for facet in &curved.facets {
            assert!(!facet.borders.is_empty());
        }
    }

    #[test]
    fn test_grid_wrap_detection() {
        let mut grid = Grid::new(3, 3);
        for j in 0..3 {
            grid.set_point(0, j, Vector3::new(0.0, j as f32, 0.0));
            grid.set_point(1, j, Vector3::new(10.0, j as f32, 5.0));
            // last column coincides with the first
            grid.set_point(2, j, Vector3::new(0.05, j as f32, 0.0));
        }
        grid.set_wrap_width();
        assert!(grid.wrap_width);

        grid.set_point(2, 1, Vector3::new(3.0, 1.0, 0.0));
        grid.set_wrap_width();
        assert!(!grid.wrap_width);
    }

    #[test]
    fn test_remove_degenerate_columns() {
        let mut grid = Grid::new(4, 2);
        for j in 0..2 {
            grid.set_point(0, j, Vector3::new(0.0, j as f32, 0.0));
            grid.set_point(1, j, Vector3::new(8.0, j as f32, 0.0));
            // column 2 duplicates column 1
            grid.set_point(2, j, Vector3::new(8.0, j as f32, 0.0));
            grid.set_point(3, j, Vector3::new(16.0, j as f32, 0.0));
        }
        grid.remove_degenerate_columns();
        assert_eq!(grid.width, 3);
        assert_eq!(grid.point(2, 0), Vector3::new(16.0, 0.0, 0.0));
    }

    #[test]
    fn test_needs_subdivision() {
        let a = Vector3::new(0.0, 0.0, 0.0);
        let c = Vector3::new(64.0, 0.0, 0.0);
        // collinear control point: flat
        assert!(!needs_subdivision(a, Vector3::new(32.0, 0.0, 0.0), c));
        // tall arch: curved
        assert!(needs_subdivision(a, Vector3::new(32.0, 0.0, 64.0), c));
    }

    #[test]
    fn test_subdivide_midpoint() {
        let a = Vector3::new(0.0, 0.0, 0.0);
        let b = Vector3::new(32.0, 0.0, 64.0);
        let c = Vector3::new(64.0, 0.0, 0.0);
        let (o1, o2, o3) = subdivide(a, b, c);
        assert_eq!(o1, Vector3::new(16.0, 0.0, 32.0));
        assert_eq!(o3, Vector3::new(48.0, 0.0, 32.0));
        // the curve midpoint of a quadratic Bezier
        assert_eq!(o2, Vector3::new(32.0, 0.0, 32.0));
    }

    #[test]
    fn test_find_plane_deduplicates() {
        let mut builder = PatchCollideBuilder::new();
        let a = Vector3::new(0.0, 0.0, 0.0);
        let b = Vector3::new(64.0, 0.0, 0.0);
        let c = Vector3::new(0.0, 64.0, 0.0);

        let first = builder.find_plane(a, b, c).unwrap();
        assert!(first >= 0);
        // coplanar triangle maps onto the same entry
        let again = builder
            .find_plane(
                Vector3::new(8.0, 8.0, 0.0),
                Vector3::new(32.0, 8.0, 0.0),
                Vector3::new(8.0, 32.0, 0.0),
            )
            .unwrap();
        assert_eq!(first, again);

        // a degenerate triangle yields no plane
        let degenerate = builder.find_plane(a, a, b).unwrap();
        assert_eq!(degenerate, -1);
    }

    #[test]
    fn test_find_plane2_reports_flip() {
        let mut builder = PatchCollideBuilder::new();
        let (index, flipped) = builder.find_plane2(Vector3::unit_z(), 8.0).unwrap();
        assert!(!flipped);

        let (same, flipped) = builder.find_plane2(-Vector3::unit_z(), -8.0).unwrap();
        assert_eq!(index, same);
        assert!(flipped);
    }

    #[test]
    fn test_snap_vector() {
        let snapped = snap_vector(Vector3::new(1.0 - 1e-5, 1e-5, 0.0));
        assert_eq!(snapped, Vector3::new(1.0, 0.0, 0.0));
        let unchanged = snap_vector(Vector3::new(0.707, 0.707, 0.0));
        assert_eq!(unchanged, Vector3::new(0.707, 0.707, 0.0));
    }
}

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

//! The sweep solver: moves a box, point or capsule from a start to an end
//! position and finds the earliest contact with world geometry.
//!
//! The box is first symmetrized about its center so the sweep is a point
//! sweep; each plane it is tested against is pushed outward by the box
//! corner most extreme along the plane normal (selected straight from the
//! plane's sign bits). The tree walk visits leaves near-to-far, but a
//! larger volume can contact geometry in a later leaf at a smaller
//! fraction, so the sweep never early-outs on the first hit; it keeps the
//! minimum fraction over everything its bounds touch.

mod position;

pub use self::position::LeafList;

use cgmath::{InnerSpace, Matrix, Vector3, Zero};

use crate::bsp::{ClipMap, Contents, Handle, Leaf, NodeChild, SurfaceFlags};
use crate::math::{dot64, normalize, rotation_matrix, Angles, Bounds, Plane};
use crate::patch::PatchCollide;

/// Stop this far short of every surface, keeping positions valid under
/// later quantization and away from degenerate plane math.
pub const SURFACE_CLIP_EPSILON: f32 = 0.125;

const RADIUS_EPSILON: f32 = 1.0;

/// The result of sweeping a volume through the world.
#[derive(Clone, Debug, PartialEq)]
pub struct Trace {
    /// The whole sweep was inside solid; the contact plane is meaningless.
    pub all_solid: bool,
    /// The start position was inside solid.
    pub start_solid: bool,
    /// Portion of the sweep completed before contact; 1.0 = no contact.
    pub fraction: f32,
    /// Final position, derived from the caller's original endpoints.
    pub endpos: Vector3<f32>,
    /// Surface plane at the impact point, in world space.
    pub plane: Plane,
    /// Surface attributes of the side that was struck.
    pub surface_flags: SurfaceFlags,
    /// Contents on the other side of the struck surface.
    pub contents: Contents,
}

impl Default for Trace {
    fn default() -> Trace {
        Trace {
            all_solid: false,
            start_solid: false,
            fraction: 1.0,
            endpos: Vector3::zero(),
            plane: Plane::zero(),
            surface_flags: SurfaceFlags::empty(),
            contents: Contents::empty(),
        }
    }
}

/// Sphere pair standing in for a capsule during capsule-shaped queries.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Sphere {
    pub radius: f32,
    pub half_height: f32,
    pub offset: Vector3<f32>,
}

impl Sphere {
    /// The capsule inscribed in a symmetric box: the radius is the smaller
    /// of half-width and half-height, the sphere centers sit offset along z.
    fn for_size(size_max: Vector3<f32>) -> Sphere {
        let radius = if size_max.x > size_max.z {
            size_max.z
        } else {
            size_max.x
        };
        Sphere {
            radius,
            half_height: size_max.z,
            offset: Vector3::new(0.0, 0.0, size_max.z - radius),
        }
    }
}

/// Scratch state for one query, alive only for the duration of the call.
pub(crate) struct TraceWork {
    pub start: Vector3<f32>,
    pub end: Vector3<f32>,
    /// Symmetrized box: `size[0]` all non-positive, `size[1]` non-negative.
    pub size: [Vector3<f32>; 2],
    /// `offsets[sign_bits]` is the box corner most extreme along a plane
    /// normal with those sign bits, used for Minkowski expansion.
    pub offsets: [Vector3<f32>; 8],
    /// Half-size per axis, the tree descent's expansion for axial planes.
    pub extents: Vector3<f32>,
    /// AABB of the entire swept volume.
    pub bounds: Bounds,
    pub model_origin: Vector3<f32>,
    pub contents: Contents,
    pub is_point: bool,
    pub trace: Trace,
    pub sphere: Option<Sphere>,
}

impl ClipMap {
    /// Sweeps a box from `start` to `end` against a model and reports the
    /// first contact. A zero-sized box is traced as a point; with `capsule`
    /// set, the box outlines a capsule instead.
    pub fn box_trace(
        &mut self,
        start: Vector3<f32>,
        end: Vector3<f32>,
        mins: Vector3<f32>,
        maxs: Vector3<f32>,
        model: Handle,
        brush_mask: Contents,
        capsule: bool,
    ) -> Trace {
        self.trace(
            start,
            end,
            mins,
            maxs,
            model,
            Vector3::zero(),
            brush_mask,
            capsule,
            None,
        )
    }

    /// Sweeps against a submodel positioned at `origin` with the given
    /// orientation by rotating the trace line into the model's frame.
    ///
    /// Rotating the line is exact for capsules, which are rotationally
    /// symmetric. For boxes it is an approximation: the swept box itself
    /// stays axis-aligned, because rotating it would invalidate every
    /// bevel plane in the model.
    pub fn transformed_box_trace(
        &mut self,
        start: Vector3<f32>,
        end: Vector3<f32>,
        mins: Vector3<f32>,
        maxs: Vector3<f32>,
        model: Handle,
        brush_mask: Contents,
        origin: Vector3<f32>,
        angles: Angles,
        capsule: bool,
    ) -> Trace {
        // symmetrize the box and move the line into model-local space
        let mut size = [Vector3::zero(), Vector3::zero()];
        let mut start_l = Vector3::zero();
        let mut end_l = Vector3::zero();
        for i in 0..3 {
            let offset = (mins[i] + maxs[i]) * 0.5;
            size[0][i] = mins[i] - offset;
            size[1][i] = maxs[i] - offset;
            start_l[i] = start[i] + offset;
            end_l[i] = end[i] + offset;
        }
        start_l -= origin;
        end_l -= origin;

        let rotated = model != Handle::TempBox && !angles.is_zero();

        let half_width = size[1].x;
        let half_height = size[1].z;
        let radius = if half_width > half_height {
            half_height
        } else {
            half_width
        };
        let t = half_height - radius;

        let mut sphere = Sphere {
            radius,
            half_height,
            offset: Vector3::new(0.0, 0.0, t),
        };

        let matrix = if rotated {
            let matrix = rotation_matrix(angles);
            start_l = matrix * start_l;
            end_l = matrix * end_l;
            // the capsule's sphere offset rotates with the model
            let col = matrix[2];
            sphere.offset = Vector3::new(col.x * t, -col.y * t, col.z * t);
            Some(matrix)
        } else {
            None
        };

        let sphere = if capsule { Some(sphere) } else { None };

        let mut trace = self.trace(
            start_l, end_l, size[0], size[1], model, origin, brush_mask, capsule, sphere,
        );

        if let Some(matrix) = matrix {
            if trace.fraction != 1.0 {
                let normal = matrix.transpose() * trace.plane.normal();
                trace.plane = Plane::new(normal, trace.plane.dist());
            }
        }

        // the endpoint comes from the caller's coordinates, not the
        // rotated, offset ones the sweep ran in
        trace.endpos = start + (end - start) * trace.fraction;

        trace
    }

    #[allow(clippy::too_many_arguments)]
    fn trace(
        &mut self,
        start: Vector3<f32>,
        end: Vector3<f32>,
        mins: Vector3<f32>,
        maxs: Vector3<f32>,
        model: Handle,
        origin: Vector3<f32>,
        brush_mask: Contents,
        capsule: bool,
        sphere: Option<Sphere>,
    ) -> Trace {
        self.begin_check();
        self.stats.traces += 1;

        let mut tw = TraceWork {
            start: Vector3::zero(),
            end: Vector3::zero(),
            size: [Vector3::zero(), Vector3::zero()],
            offsets: [Vector3::zero(); 8],
            extents: Vector3::zero(),
            bounds: Bounds::new(Vector3::zero(), Vector3::zero()),
            model_origin: origin,
            contents: brush_mask,
            is_point: false,
            trace: Trace::default(),
            sphere: None,
        };

        if !self.is_loaded() {
            // map not loaded, shouldn't happen
            return tw.trace;
        }

        // adjust so that mins and maxs are always symmetric, which avoids
        // complications with plane expansion for rotated submodels
        for i in 0..3 {
            let offset = (mins[i] + maxs[i]) * 0.5;
            tw.size[0][i] = mins[i] - offset;
            tw.size[1][i] = maxs[i] - offset;
            tw.start[i] = start[i] + offset;
            tw.end[i] = end[i] + offset;
        }

        tw.sphere = match sphere {
            Some(s) => Some(s),
            None if capsule => Some(Sphere::for_size(tw.size[1])),
            None => None,
        };

        // offsets[sign_bits] = vector to the corner most extreme along a
        // normal with those component signs
        for sign_bits in 0..8 {
            for i in 0..3 {
                tw.offsets[sign_bits][i] = tw.size[(sign_bits >> i) & 1][i];
            }
        }

        // enclose the entire swept volume
        if let Some(s) = &tw.sphere {
            for i in 0..3 {
                let reach = s.offset[i].abs() + s.radius;
                if tw.start[i] < tw.end[i] {
                    tw.bounds.mins[i] = tw.start[i] - reach;
                    tw.bounds.maxs[i] = tw.end[i] + reach;
                } else {
                    tw.bounds.mins[i] = tw.end[i] - reach;
                    tw.bounds.maxs[i] = tw.start[i] + reach;
                }
            }
        } else {
            for i in 0..3 {
                if tw.start[i] < tw.end[i] {
                    tw.bounds.mins[i] = tw.start[i] + tw.size[0][i];
                    tw.bounds.maxs[i] = tw.end[i] + tw.size[1][i];
                } else {
                    tw.bounds.mins[i] = tw.end[i] + tw.size[0][i];
                    tw.bounds.maxs[i] = tw.start[i] + tw.size[1][i];
                }
            }
        }

        if start == end {
            // position test special case
            match model {
                Handle::TempCapsule => {
                    if tw.sphere.is_some() {
                        self.test_capsule_in_capsule(&mut tw, model);
                    } else {
                        self.test_bounding_box_in_capsule(&mut tw, model);
                    }
                }
                Handle::Model(0) => self.position_test(&mut tw),
                _ => {
                    let leaf = self.model(model).leaf.clone();
                    self.test_in_leaf(&mut tw, &leaf);
                }
            }
        } else {
            // point special case
            if tw.size[0] == Vector3::zero() {
                tw.is_point = true;
                tw.extents = Vector3::zero();
            } else {
                tw.is_point = false;
                tw.extents = tw.size[1];
            }

            match model {
                Handle::TempCapsule => {
                    if tw.sphere.is_some() {
                        self.trace_capsule_through_capsule(&mut tw, model);
                    } else {
                        self.trace_bounding_box_through_capsule(&mut tw, model);
                    }
                }
                Handle::Model(0) => {
                    let (p1, p2) = (tw.start, tw.end);
                    self.trace_through_tree(&mut tw, NodeChild::Node(0), 0.0, 1.0, p1, p2);
                }
                _ => {
                    let leaf = self.model(model).leaf.clone();
                    self.trace_through_leaf(&mut tw, &leaf);
                }
            }
        }

        // generate the endpoint from the original, unmodified start/end
        if tw.trace.fraction == 1.0 {
            tw.trace.endpos = end;
        } else {
            tw.trace.endpos = start + (end - start) * tw.trace.fraction;
        }

        // if all_solid is set the plane is not valid; if fraction == 1.0 we
        // never hit anything; otherwise the normal must have unit length
        debug_assert!(
            tw.trace.all_solid
                || tw.trace.fraction == 1.0
                || tw.trace.plane.normal().magnitude2() > 0.9999,
            "trace produced an invalid contact plane",
        );

        tw.trace
    }

    /// Recursive BSP descent. Walks the segment `p1..p2` (fractions
    /// `p1f..p2f` of the whole sweep) down the tree, visiting near children
    /// first and pruning subtrees that cannot beat the current fraction.
    fn trace_through_tree(
        &mut self,
        tw: &mut TraceWork,
        child: NodeChild,
        p1f: f32,
        p2f: f32,
        p1: Vector3<f32>,
        p2: Vector3<f32>,
    ) {
        if tw.trace.fraction <= p1f {
            return; // already hit something nearer
        }

        let num = match child {
            NodeChild::Leaf(leaf_id) => {
                let leaf = self.leaves[leaf_id].clone();
                self.trace_through_leaf(tw, &leaf);
                return;
            }
            NodeChild::Node(num) => num,
        };

        // find the point distances to the separating plane and the offset
        // for the size of the box
        let children = self.nodes[num].children;
        let plane = &self.planes[self.nodes[num].plane_id];

        let t1: f64;
        let t2: f64;
        let offset: f64;
        match plane.axis() {
            Some(axis) => {
                let axis = axis as usize;
                t1 = (p1[axis] - plane.dist()) as f64;
                t2 = (p2[axis] - plane.dist()) as f64;
                offset = tw.extents[axis] as f64;
            }
            None => {
                t1 = dot64(plane.normal(), p1) - plane.dist() as f64;
                t2 = dot64(plane.normal(), p2) - plane.dist() as f64;
                if tw.is_point {
                    offset = 0.0;
                } else {
                    // this is silly
                    offset = 2048.0;
                }
            }
        }

        // see which sides we need to consider
        if t1 >= offset + 1.0 && t2 >= offset + 1.0 {
            self.trace_through_tree(tw, children[0], p1f, p2f, p1, p2);
            return;
        }
        if t1 < -offset - 1.0 && t2 < -offset - 1.0 {
            self.trace_through_tree(tw, children[1], p1f, p2f, p1, p2);
            return;
        }

        // put the crosspoint SURFACE_CLIP_EPSILON units on the near side
        let side: usize;
        let mut frac: f32;
        let mut frac2: f32;
        let eps = SURFACE_CLIP_EPSILON as f64;
        if t1 < t2 {
            let idist = 1.0 / (t1 - t2);
            side = 1;
            frac2 = ((t1 + offset + eps) * idist) as f32;
            frac = ((t1 - offset + eps) * idist) as f32;
        } else if t1 > t2 {
            let idist = 1.0 / (t1 - t2);
            side = 0;
            frac2 = ((t1 - offset - eps) * idist) as f32;
            frac = ((t1 + offset + eps) * idist) as f32;
        } else {
            side = 0;
            frac = 1.0;
            frac2 = 0.0;
        }

        // move up to the node
        if frac < 0.0 {
            frac = 0.0;
        } else if frac > 1.0 {
            frac = 1.0;
        }
        let midf = p1f + (p2f - p1f) * frac;
        let mid = p1 + (p2 - p1) * frac;
        self.trace_through_tree(tw, children[side], p1f, midf, p1, mid);

        // go past the node
        if frac2 < 0.0 {
            frac2 = 0.0;
        } else if frac2 > 1.0 {
            frac2 = 1.0;
        }
        let midf = p1f + (p2f - p1f) * frac2;
        let mid = p1 + (p2 - p1) * frac2;
        self.trace_through_tree(tw, children[side ^ 1], midf, p2f, mid, p2);
    }

    /// Sweeps against every brush and patch a leaf references. Brushes
    /// already stamped this query were reached through another leaf and are
    /// skipped.
    pub(crate) fn trace_through_leaf(&mut self, tw: &mut TraceWork, leaf: &Leaf) {
        // trace line against all brushes in the leaf
        for k in 0..leaf.num_leaf_brushes {
            let brush_num = self.leaf_brushes[leaf.first_leaf_brush + k];

            {
                let brush = &mut self.brushes[brush_num];
                if brush.checkcount == self.checkcount {
                    continue; // already checked this brush in another leaf
                }
                brush.checkcount = self.checkcount;
            }

            let brush = &self.brushes[brush_num];
            if !brush.contents.intersects(tw.contents) {
                continue;
            }
            if !tw.bounds.intersects(&brush.bounds) {
                continue;
            }

            self.trace_through_brush(tw, brush_num);
            if tw.trace.fraction == 0.0 {
                return;
            }
        }

        // trace line against all patches in the leaf
        if self.settings.patch_collision {
            let player_curve = self.settings.player_curve_collision;
            for k in 0..leaf.num_leaf_surfaces {
                let surf_num = self.leaf_surfaces[leaf.first_leaf_surface + k];

                match self.surfaces.get_mut(surf_num) {
                    Some(Some(patch)) => {
                        if patch.checkcount == self.checkcount {
                            continue; // already checked this patch in another leaf
                        }
                        patch.checkcount = self.checkcount;
                        if !patch.contents.intersects(tw.contents) {
                            continue;
                        }
                    }
                    _ => continue,
                }

                self.stats.patch_traces += 1;
                let old_frac = tw.trace.fraction;

                if let Some(patch) = &self.surfaces[surf_num] {
                    trace_through_patch_collide(tw, &patch.collide, player_curve);
                    if tw.trace.fraction < old_frac {
                        tw.trace.surface_flags = patch.surface_flags;
                        tw.trace.contents = patch.contents;
                    }
                }

                if tw.trace.fraction == 0.0 {
                    return;
                }
            }
        }
    }

    /// Clips the sweep against one brush: the latest entering crossing and
    /// the earliest leaving crossing over all sides bracket the span the
    /// sweep spends inside the brush.
    fn trace_through_brush(&mut self, tw: &mut TraceWork, brush_num: usize) {
        if self.brushes[brush_num].num_sides == 0 {
            return;
        }
        self.stats.brush_traces += 1;

        let brush = &self.brushes[brush_num];

        let mut get_out = false;
        let mut start_out = false;
        let mut enter_frac = -1.0f32;
        let mut leave_frac = 1.0f32;
        let mut clip_plane: Option<usize> = None;
        let mut lead_side: Option<usize> = None;

        for side_num in brush.first_side..brush.first_side + brush.num_sides {
            let side = &self.brush_sides[side_num];
            let plane = &self.planes[side.plane_id];

            let d1: f32;
            let d2: f32;
            match &tw.sphere {
                Some(sphere) => {
                    // adjust the plane distance appropriately for radius
                    let dist = plane.dist() + sphere.radius;
                    // find the closest point on the capsule to the plane
                    let t = dot64(plane.normal(), sphere.offset);
                    let (startp, endp) = if t > 0.0 {
                        (tw.start - sphere.offset, tw.end - sphere.offset)
                    } else {
                        (tw.start + sphere.offset, tw.end + sphere.offset)
                    };
                    d1 = (dot64(startp, plane.normal()) - dist as f64) as f32;
                    d2 = (dot64(endp, plane.normal()) - dist as f64) as f32;
                }
                None => {
                    // adjust the plane distance appropriately for mins/maxs
                    let dist = plane.dist() as f64
                        - dot64(tw.offsets[plane.sign_bits() as usize], plane.normal());
                    d1 = (dot64(tw.start, plane.normal()) - dist) as f32;
                    d2 = (dot64(tw.end, plane.normal()) - dist) as f32;
                }
            }

            if d2 > 0.0 {
                get_out = true; // endpoint is not in solid
            }
            if d1 > 0.0 {
                start_out = true;
            }

            // if completely in front of face, no intersection with the
            // entire brush
            if d1 > 0.0 && (d2 >= SURFACE_CLIP_EPSILON || d2 >= d1) {
                return;
            }
            // if it doesn't cross the plane, the plane isn't relevant
            if d1 <= 0.0 && d2 <= 0.0 {
                continue;
            }

            if d1 > d2 {
                // enter
                let mut f = (d1 - SURFACE_CLIP_EPSILON) / (d1 - d2);
                if f < 0.0 {
                    f = 0.0;
                }
                if f > enter_frac {
                    enter_frac = f;
                    clip_plane = Some(side.plane_id);
                    lead_side = Some(side_num);
                }
            } else {
                // leave
                let mut f = (d1 + SURFACE_CLIP_EPSILON) / (d1 - d2);
                if f > 1.0 {
                    f = 1.0;
                }
                if f < leave_frac {
                    leave_frac = f;
                }
            }
        }

        // all planes have been checked and the trace was not completely
        // outside the brush
        if !start_out {
            // original point was inside brush
            tw.trace.start_solid = true;
            if !get_out {
                tw.trace.all_solid = true;
                tw.trace.fraction = 0.0;
                tw.trace.contents = brush.contents;
            }
            return;
        }

        if enter_frac < leave_frac && enter_frac > -1.0 && enter_frac < tw.trace.fraction {
            if enter_frac < 0.0 {
                enter_frac = 0.0;
            }
            tw.trace.fraction = enter_frac;
            if let Some(plane_id) = clip_plane {
                tw.trace.plane = self.planes[plane_id].clone();
            }
            if let Some(side_num) = lead_side {
                tw.trace.surface_flags = self.brush_sides[side_num].surface_flags;
            }
            tw.trace.contents = brush.contents;
        }
    }

    /// Capsule versus capsule: decomposed into the top and bottom spheres
    /// and, for horizontal movement, the connecting cylinder.
    fn trace_capsule_through_capsule(&mut self, tw: &mut TraceWork, model: Handle) {
        let bounds = self.model_bounds(model);
        let sphere = match &tw.sphere {
            Some(s) => *s,
            None => return,
        };

        // test trace bounds vs. capsule bounds
        if tw.bounds.mins.x > bounds.maxs.x + RADIUS_EPSILON
            || tw.bounds.mins.y > bounds.maxs.y + RADIUS_EPSILON
            || tw.bounds.mins.z > bounds.maxs.z + RADIUS_EPSILON
            || tw.bounds.maxs.x < bounds.mins.x - RADIUS_EPSILON
            || tw.bounds.maxs.y < bounds.mins.y - RADIUS_EPSILON
            || tw.bounds.maxs.z < bounds.mins.z - RADIUS_EPSILON
        {
            return;
        }

        // top and bottom sphere origins at the start and end of the trace
        let start_top = tw.start + sphere.offset;
        let start_bottom = tw.start - sphere.offset;
        let end_top = tw.end + sphere.offset;
        let end_bottom = tw.end - sphere.offset;

        let mut offset = Vector3::zero();
        let mut size = [Vector3::zero(), Vector3::zero()];
        for i in 0..3 {
            offset[i] = (bounds.mins[i] + bounds.maxs[i]) * 0.5;
            size[0][i] = bounds.mins[i] - offset[i];
            size[1][i] = bounds.maxs[i] - offset[i];
        }

        let half_width = size[1].x;
        let half_height = size[1].z;
        let radius = if half_width > half_height {
            half_height
        } else {
            half_width
        };
        let offs = half_height - radius;

        let mut top = offset;
        top.z += offs;
        let mut bottom = offset;
        bottom.z -= offs;

        // expand the sphere radii by the moving capsule's radius
        let radius = radius + sphere.radius;

        // if there is horizontal movement, test the connecting cylinder
        if tw.start.x != tw.end.x || tw.start.y != tw.end.y {
            // the cylinder height loses the sphere caps on both ends
            let h = half_height + sphere.half_height - radius;
            if h > 0.0 {
                let (start, end) = (tw.start, tw.end);
                trace_through_vertical_cylinder(tw, offset, radius, h, start, end);
            }
        }

        trace_through_sphere(tw, top, radius, start_bottom, end_bottom);
        trace_through_sphere(tw, bottom, radius, start_top, end_top);
    }

    /// Bounding box versus capsule: the box becomes the capsule and the
    /// capsule becomes a box hull, swapping the query into brush code.
    fn trace_bounding_box_through_capsule(&mut self, tw: &mut TraceWork, model: Handle) {
        let bounds = self.model_bounds(model);

        // recenter on the capsule
        let mut offset = Vector3::zero();
        let mut size = [Vector3::zero(), Vector3::zero()];
        for i in 0..3 {
            offset[i] = (bounds.mins[i] + bounds.maxs[i]) * 0.5;
            size[0][i] = bounds.mins[i] - offset[i];
            size[1][i] = bounds.maxs[i] - offset[i];
            tw.start[i] -= offset[i];
            tw.end[i] -= offset[i];
        }

        // replace the bounding box with the capsule
        tw.sphere = Some(Sphere::for_size(size[1]));

        // replace the capsule with the bounding box
        let handle = self.temp_box_model(tw.size[0], tw.size[1], false);
        let leaf = self.model(handle).leaf.clone();
        self.trace_through_leaf(tw, &leaf);
    }
}

/// One plane of a facet clip. Returns false when the sweep is entirely in
/// front of the plane, which rules out the whole facet.
fn check_facet_plane(
    normal: Vector3<f32>,
    dist: f32,
    start: Vector3<f32>,
    end: Vector3<f32>,
    enter_frac: &mut f32,
    leave_frac: &mut f32,
    hit: &mut bool,
) -> bool {
    *hit = false;

    let d1 = (dot64(start, normal) - dist as f64) as f32;
    let d2 = (dot64(end, normal) - dist as f64) as f32;

    // if completely in front of face, no intersection with the entire facet
    if d1 > 0.0 && (d2 >= SURFACE_CLIP_EPSILON || d2 >= d1) {
        return false;
    }
    // if it doesn't cross the plane, the plane isn't relevant
    if d1 <= 0.0 && d2 <= 0.0 {
        return true;
    }

    if d1 > d2 {
        // enter
        let mut f = (d1 - SURFACE_CLIP_EPSILON) / (d1 - d2);
        if f < 0.0 {
            f = 0.0;
        }
        // always favor previous plane hits and thus also the surface plane
        if f > *enter_frac {
            *enter_frac = f;
            *hit = true;
        }
    } else {
        // leave
        let mut f = (d1 + SURFACE_CLIP_EPSILON) / (d1 - d2);
        if f > 1.0 {
            f = 1.0;
        }
        if f < *leave_frac {
            *leave_frac = f;
        }
    }
    true
}

/// Sweeps the work volume against one patch's facets.
pub(crate) fn trace_through_patch_collide(
    tw: &mut TraceWork,
    pc: &PatchCollide,
    player_curve_collision: bool,
) {
    if !tw.bounds.intersects(&pc.bounds()) {
        return;
    }

    if tw.is_point {
        trace_point_through_patch_collide(tw, pc, player_curve_collision);
        return;
    }

    for facet in &pc.facets {
        let mut enter_frac = -1.0f32;
        let mut leave_frac = 1.0f32;
        let mut hit_num: i32 = -1;
        let mut hit = false;
        let mut best = (Vector3::zero(), 0.0f32);

        let pp = &pc.planes[facet.surface_plane];
        let mut normal = pp.normal;
        let mut dist = pp.dist;
        let (start_p, end_p);
        match &tw.sphere {
            Some(sphere) => {
                // adjust the plane distance appropriately for radius
                dist += sphere.radius;
                // find the closest point on the capsule to the plane
                let t = dot64(normal, sphere.offset) as f32;
                if t > 0.0 {
                    start_p = tw.start - sphere.offset;
                    end_p = tw.end - sphere.offset;
                } else {
                    start_p = tw.start + sphere.offset;
                    end_p = tw.end + sphere.offset;
                }
            }
            None => {
                let offset = dot64(tw.offsets[pp.sign_bits as usize], normal) as f32;
                dist -= offset;
                start_p = tw.start;
                end_p = tw.end;
            }
        }

        if !check_facet_plane(
            normal,
            dist,
            start_p,
            end_p,
            &mut enter_frac,
            &mut leave_frac,
            &mut hit,
        ) {
            continue;
        }
        if hit {
            best = (normal, dist);
        }

        let mut rejected = false;
        for (border_num, border) in facet.borders.iter().enumerate() {
            let pp = &pc.planes[border.plane];
            if border.inward {
                normal = -pp.normal;
                dist = -pp.dist;
            } else {
                normal = pp.normal;
                dist = pp.dist;
            }
            let (start_p, end_p);
            match &tw.sphere {
                Some(sphere) => {
                    dist += sphere.radius;
                    let t = dot64(normal, sphere.offset) as f32;
                    if t > 0.0 {
                        start_p = tw.start - sphere.offset;
                        end_p = tw.end - sphere.offset;
                    } else {
                        start_p = tw.start + sphere.offset;
                        end_p = tw.end + sphere.offset;
                    }
                }
                None => {
                    // this works even when the border is flipped because
                    // the box is centered
                    let offset = dot64(tw.offsets[pp.sign_bits as usize], normal) as f32;
                    dist += offset.abs();
                    start_p = tw.start;
                    end_p = tw.end;
                }
            }

            if !check_facet_plane(
                normal,
                dist,
                start_p,
                end_p,
                &mut enter_frac,
                &mut leave_frac,
                &mut hit,
            ) {
                rejected = true;
                break;
            }
            if hit {
                hit_num = border_num as i32;
                best = (normal, dist);
            }
        }
        if rejected {
            continue;
        }
        // never clip against the back side
        if hit_num == facet.borders.len() as i32 - 1 {
            continue;
        }

        if enter_frac < leave_frac && enter_frac >= 0.0 && enter_frac < tw.trace.fraction {
            tw.trace.fraction = enter_frac;
            tw.trace.plane = Plane::new(best.0, best.1);
        }
    }
}

/// Point sweeps get a dedicated path: facets have no volume, so the per
/// plane relationship tables are computed once and shared by every facet.
fn trace_point_through_patch_collide(
    tw: &mut TraceWork,
    pc: &PatchCollide,
    player_curve_collision: bool,
) {
    if !player_curve_collision || !tw.is_point {
        return;
    }

    // determine the trace's relationship to all planes
    let mut front_facing = [false; crate::patch::MAX_PATCH_PLANES];
    let mut intersection = [0.0f32; crate::patch::MAX_PATCH_PLANES];
    for (i, pp) in pc.planes.iter().enumerate() {
        let offset = dot64(tw.offsets[pp.sign_bits as usize], pp.normal) as f32;
        let d1 = (dot64(tw.start, pp.normal) as f32) - pp.dist + offset;
        let d2 = (dot64(tw.end, pp.normal) as f32) - pp.dist + offset;
        front_facing[i] = d1 > 0.0;
        intersection[i] = if d1 == d2 {
            99999.0
        } else {
            let f = d1 / (d1 - d2);
            if f <= 0.0 {
                99999.0
            } else {
                f
            }
        };
    }

    // see if any of the surface planes are intersected
    for facet in &pc.facets {
        if !front_facing[facet.surface_plane] {
            continue;
        }
        let intersect = intersection[facet.surface_plane];
        if intersect < 0.0 {
            continue; // surface is behind the starting point
        }
        if intersect > tw.trace.fraction {
            continue; // already hit something closer
        }

        let inside = facet.borders.iter().all(|border| {
            if front_facing[border.plane] ^ border.inward {
                intersection[border.plane] <= intersect
            } else {
                intersection[border.plane] >= intersect
            }
        });
        if !inside {
            continue;
        }

        // we hit this facet; recompute the crossing with a slight pushoff
        let pp = &pc.planes[facet.surface_plane];
        let offset = dot64(tw.offsets[pp.sign_bits as usize], pp.normal) as f32;
        let d1 = (dot64(tw.start, pp.normal) as f32) - pp.dist + offset;
        let d2 = (dot64(tw.end, pp.normal) as f32) - pp.dist + offset;

        let mut fraction = (d1 - SURFACE_CLIP_EPSILON) / (d1 - d2);
        if fraction < 0.0 {
            fraction = 0.0;
        }
        tw.trace.fraction = fraction;
        tw.trace.plane = Plane::new(pp.normal, pp.dist);
    }
}

/// First intersection of the segment with a sphere, for capsule caps.
fn trace_through_sphere(
    tw: &mut TraceWork,
    origin: Vector3<f32>,
    radius: f32,
    start: Vector3<f32>,
    end: Vector3<f32>,
) {
    // if inside the sphere
    let dir = start - origin;
    if dir.magnitude2() < radius * radius {
        tw.trace.fraction = 0.0;
        tw.trace.start_solid = true;
        let dir = end - origin;
        if dir.magnitude2() < radius * radius {
            tw.trace.all_solid = true;
        }
        return;
    }

    let (dir, length) = normalize(end - start);

    let l1 = crate::math::distance_from_line_squared(origin, start, end, dir);
    let v1 = end - origin;
    let l2 = v1.magnitude2();
    // no intersection and the end point is at least an epsilon away
    if l1 >= radius * radius && l2 > (radius + SURFACE_CLIP_EPSILON).powi(2) {
        return;
    }

    let v1 = start - origin;
    let b = 2.0 * (dir.x * v1.x + dir.y * v1.y + dir.z * v1.z);
    let c = v1.magnitude2() - (radius + RADIUS_EPSILON) * (radius + RADIUS_EPSILON);

    let d = b * b - 4.0 * c;
    if d > 0.0 {
        let sqrtd = d.sqrt();
        let mut fraction = (-b - sqrtd) * 0.5;
        if fraction < 0.0 {
            fraction = 0.0;
        } else {
            fraction /= length;
        }
        if fraction < tw.trace.fraction {
            tw.trace.fraction = fraction;
            let dir = end - start;
            let intersection = start + dir * fraction;
            let dir = (intersection - origin) * (1.0 / (radius + RADIUS_EPSILON));
            let intersection = intersection + tw.model_origin;
            tw.trace.plane = Plane::new(dir, dir.dot(intersection));
            tw.trace.contents = Contents::BODY;
        }
    }
    // d == 0 would slide along the sphere; d < 0 misses entirely
}

/// First intersection of the segment with a vertical cylinder extending
/// `half_height` above and below `origin`, for the capsule's side wall.
fn trace_through_vertical_cylinder(
    tw: &mut TraceWork,
    origin: Vector3<f32>,
    radius: f32,
    half_height: f32,
    start: Vector3<f32>,
    end: Vector3<f32>,
) {
    // 2d coordinates
    let start_2d = Vector3::new(start.x, start.y, 0.0);
    let end_2d = Vector3::new(end.x, end.y, 0.0);
    let org_2d = Vector3::new(origin.x, origin.y, 0.0);

    // between the lower and upper cylinder bounds
    if start.z <= origin.z + half_height && start.z >= origin.z - half_height {
        // if inside the cylinder
        let dir = start_2d - org_2d;
        if dir.magnitude2() < radius * radius {
            tw.trace.fraction = 0.0;
            tw.trace.start_solid = true;
            let dir = end_2d - org_2d;
            if dir.magnitude2() < radius * radius {
                tw.trace.all_solid = true;
            }
            return;
        }
    }

    let (dir, length) = normalize(end_2d - start_2d);

    let l1 = crate::math::distance_from_line_squared(org_2d, start_2d, end_2d, dir);
    let v1 = end_2d - org_2d;
    let l2 = v1.magnitude2();
    // no intersection and the end point is at least an epsilon away
    if l1 >= radius * radius && l2 > (radius + SURFACE_CLIP_EPSILON).powi(2) {
        return;
    }

    let v1 = start - origin;
    let b = 2.0 * (v1.x * dir.x + v1.y * dir.y);
    let c = v1.x * v1.x + v1.y * v1.y - (radius + RADIUS_EPSILON) * (radius + RADIUS_EPSILON);

    let d = b * b - 4.0 * c;
    if d > 0.0 {
        let sqrtd = d.sqrt();
        let mut fraction = (-b - sqrtd) * 0.5;
        if fraction < 0.0 {
            fraction = 0.0;
        } else {
            fraction /= length;
        }
        if fraction < tw.trace.fraction {
            let dir = end - start;
            let intersection = start + dir * fraction;
            // only if the intersection is between the cylinder's bounds
            if intersection.z <= origin.z + half_height
                && intersection.z >= origin.z - half_height
            {
                tw.trace.fraction = fraction;
                let mut dir = intersection - origin;
                dir.z = 0.0;
                let dir = dir * (1.0 / (radius + RADIUS_EPSILON));
                let intersection = intersection + tw.model_origin;
                tw.trace.plane = Plane::new(dir, dir.dot(intersection));
                tw.trace.contents = Contents::BODY;
            }
        }
    }
    // d == 0 would slide along the cylinder; d < 0 misses entirely
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bsp::{Brush, BrushSide, Model, Node, Patch, Settings, Shader};
    use crate::patch::generate_patch_collide;

    use cgmath::Deg;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    fn v(x: f32, y: f32, z: f32) -> Vector3<f32> {
        Vector3::new(x, y, z)
    }

    fn push_axial_brush(
        cm: &mut ClipMap,
        mins: Vector3<f32>,
        maxs: Vector3<f32>,
        contents: Contents,
    ) -> usize {
        let first_side = cm.brush_sides.len();
        let side_planes: [(Vector3<f32>, f32); 6] = [
            (-Vector3::unit_x(), -mins.x),
            (Vector3::unit_x(), maxs.x),
            (-Vector3::unit_y(), -mins.y),
            (Vector3::unit_y(), maxs.y),
            (-Vector3::unit_z(), -mins.z),
            (Vector3::unit_z(), maxs.z),
        ];
        for (normal, dist) in side_planes.iter() {
            let plane_id = cm.planes.len();
            cm.planes.push(Plane::new(*normal, *dist));
            cm.brush_sides.push(BrushSide {
                plane_id,
                shader_id: 0,
                surface_flags: SurfaceFlags::empty(),
            });
        }

        let brush_num = cm.brushes.len();
        cm.brushes.push(Brush {
            shader_id: 0,
            contents,
            bounds: Bounds::new(mins, maxs),
            first_side,
            num_sides: 6,
            checkcount: 0,
        });
        brush_num
    }

    fn empty_leaf() -> Leaf {
        Leaf {
            cluster: 0,
            area: 0,
            first_leaf_brush: 0,
            num_leaf_brushes: 0,
            first_leaf_surface: 0,
            num_leaf_surfaces: 0,
        }
    }

    /// A world split once at x = 0 with both leaves referencing every brush
    /// and patch (so the checkcount dedup actually matters), plus one
    /// submodel per brush.
    fn build_world(
        brush_bounds: &[(Vector3<f32>, Vector3<f32>)],
        patches: Vec<Patch>,
    ) -> ClipMap {
        let mut cm = ClipMap::new();
        cm.shaders.push(Shader {
            name: "textures/test".to_owned(),
            surface_flags: SurfaceFlags::empty(),
            contents: Contents::SOLID,
        });

        for (mins, maxs) in brush_bounds {
            push_axial_brush(&mut cm, *mins, *maxs, Contents::SOLID);
        }
        cm.surfaces = patches.into_iter().map(Some).collect();

        let num_brushes = cm.brushes.len();
        let num_surfaces = cm.surfaces.len();

        for _ in 0..2 {
            for b in 0..num_brushes {
                cm.leaf_brushes.push(b);
            }
            for s in 0..num_surfaces {
                cm.leaf_surfaces.push(s);
            }
        }
        for side in 0..2 {
            cm.leaves.push(Leaf {
                cluster: 0,
                area: 0,
                first_leaf_brush: side * num_brushes,
                num_leaf_brushes: num_brushes,
                first_leaf_surface: side * num_surfaces,
                num_leaf_surfaces: num_surfaces,
            });
        }

        let split = cm.planes.len();
        cm.planes.push(Plane::new(Vector3::unit_x(), 0.0));
        cm.nodes.push(Node {
            plane_id: split,
            children: [NodeChild::Leaf(0), NodeChild::Leaf(1)],
        });

        cm.models.push(Model {
            bounds: Bounds::new(v(-4096.0, -4096.0, -4096.0), v(4096.0, 4096.0, 4096.0)),
            leaf: empty_leaf(),
        });
        for b in 0..num_brushes {
            let pos = cm.leaf_brushes.len();
            cm.leaf_brushes.push(b);
            let mut leaf = empty_leaf();
            leaf.first_leaf_brush = pos;
            leaf.num_leaf_brushes = 1;
            cm.models.push(Model {
                bounds: cm.brushes[b].bounds,
                leaf,
            });
        }

        cm.init_box_hull();
        cm
    }

    fn unit_cube_world() -> ClipMap {
        build_world(&[(v(-1.0, -1.0, -1.0), v(1.0, 1.0, 1.0))], vec![])
    }

    fn solid_patch(collide: crate::patch::PatchCollide) -> Patch {
        Patch {
            surface_flags: SurfaceFlags::empty(),
            contents: Contents::SOLID,
            collide,
            checkcount: 0,
        }
    }

    /// A flat 3x3 patch in the z = 0 plane spanning 0..64; its facets face
    /// up (+z).
    fn flat_patch() -> Patch {
        let mut points = Vec::new();
        for j in 0..3 {
            for i in 0..3 {
                points.push(v(i as f32 * 32.0, j as f32 * 32.0, 0.0));
            }
        }
        solid_patch(generate_patch_collide(3, 3, &points).unwrap())
    }

    /// A full cylinder of the given radius around the z axis, wrapping at
    /// the 0-degree seam; its facets face outward.
    fn cylinder_patch(r: f32, h: f32) -> Patch {
        let ring = [
            (r, 0.0),
            (r, r),
            (0.0, r),
            (-r, r),
            (-r, 0.0),
            (-r, -r),
            (0.0, -r),
            (r, -r),
            (r, 0.0),
        ];
        let mut points = Vec::new();
        for j in 0..3 {
            let z = h * j as f32 / 2.0;
            for (x, y) in ring.iter() {
                points.push(v(*x, *y, z));
            }
        }
        solid_patch(generate_patch_collide(9, 3, &points).unwrap())
    }

    fn point_trace(cm: &mut ClipMap, start: Vector3<f32>, end: Vector3<f32>) -> Trace {
        cm.box_trace(
            start,
            end,
            Vector3::zero(),
            Vector3::zero(),
            Handle::world(),
            Contents::SOLID,
            false,
        )
    }

    #[test]
    fn test_point_trace_hits_cube() {
        let mut cm = unit_cube_world();
        let trace = point_trace(&mut cm, v(-2.0, 0.0, 0.0), v(2.0, 0.0, 0.0));

        // contact pushed SURFACE_CLIP_EPSILON short of the x = -1 face
        assert!(approx(trace.fraction, (1.0 - SURFACE_CLIP_EPSILON) / 4.0));
        assert_eq!(trace.plane.normal(), v(-1.0, 0.0, 0.0));
        assert!(approx(trace.endpos.x, -1.125));
        assert!(!trace.start_solid);
        assert!(!trace.all_solid);
        assert_eq!(trace.contents, Contents::SOLID);
    }

    #[test]
    fn test_trace_starting_inside_escapes() {
        let mut cm = unit_cube_world();
        let trace = point_trace(&mut cm, v(0.0, 0.0, 0.0), v(3.0, 0.0, 0.0));

        // the start is embedded but the endpoint gets out, so nothing is
        // recorded as a hit
        assert!(trace.start_solid);
        assert!(!trace.all_solid);
        assert_eq!(trace.fraction, 1.0);
        assert_eq!(trace.endpos, v(3.0, 0.0, 0.0));
    }

    #[test]
    fn test_sweep_entirely_inside_is_all_solid() {
        let mut cm = unit_cube_world();
        // both endpoints are embedded, so no plane is ever exited
        let trace = point_trace(&mut cm, v(-0.5, 0.0, 0.0), v(0.5, 0.0, 0.0));

        assert!(trace.all_solid);
        assert!(trace.start_solid);
        assert_eq!(trace.fraction, 0.0);
        assert_eq!(trace.contents, Contents::SOLID);
    }

    #[test]
    fn test_stationary_box_inside_is_all_solid() {
        let mut cm = unit_cube_world();
        let trace = cm.box_trace(
            Vector3::zero(),
            Vector3::zero(),
            v(-0.1, -0.1, -0.1),
            v(0.1, 0.1, 0.1),
            Handle::world(),
            Contents::SOLID,
            false,
        );

        assert!(trace.all_solid);
        assert!(trace.start_solid);
        assert_eq!(trace.fraction, 0.0);
        assert_eq!(trace.contents, Contents::SOLID);
    }

    #[test]
    fn test_miss_returns_whole_sweep() {
        let mut cm = unit_cube_world();
        let trace = point_trace(&mut cm, v(5.0, 5.0, 5.0), v(10.0, 10.0, 10.0));

        assert_eq!(trace.fraction, 1.0);
        assert_eq!(trace.endpos, v(10.0, 10.0, 10.0));
        assert_eq!(trace.plane.normal(), Vector3::zero());
    }

    #[test]
    fn test_box_sweep_expands_planes() {
        let mut cm = unit_cube_world();
        let half = v(0.5, 0.5, 0.5);
        let trace = cm.box_trace(
            v(-5.0, 0.0, 0.0),
            v(5.0, 0.0, 0.0),
            -half,
            half,
            Handle::world(),
            Contents::SOLID,
            false,
        );

        // the face plane is expanded by the box half-width, so contact
        // comes half a unit earlier than the point trace would
        assert!(approx(trace.fraction, (3.5 - SURFACE_CLIP_EPSILON) / 10.0));
        assert_eq!(trace.plane.normal(), v(-1.0, 0.0, 0.0));
        assert!(approx(trace.endpos.x, -1.625));
    }

    #[test]
    fn test_checkcount_dedups_shared_brushes() {
        let mut cm = build_world(
            &[
                (v(-1.0, -1.0, -1.0), v(1.0, 1.0, 1.0)),
                (v(1.0, -1.0, -1.0), v(3.0, 1.0, 1.0)),
            ],
            vec![],
        );
        cm.stats.reset();

        let trace = point_trace(&mut cm, v(-2.0, 0.5, 0.5), v(2.0, 0.5, 0.5));
        assert!(approx(trace.fraction, (1.0 - SURFACE_CLIP_EPSILON) / 4.0));
        assert_eq!(trace.plane.normal(), v(-1.0, 0.0, 0.0));

        // both brushes appear in both leaves, but each is swept only once
        assert_eq!(cm.stats.traces, 1);
        assert_eq!(cm.stats.brush_traces, 2);
    }

    #[test]
    fn test_trace_ends_at_touch_distance() {
        let mut cm = unit_cube_world();
        // a sweep ending exactly on the surface stops an epsilon early
        let trace = point_trace(&mut cm, v(-2.0, 0.0, 0.0), v(-1.0, 0.0, 0.0));
        assert!(approx(trace.fraction, 1.0 - SURFACE_CLIP_EPSILON));
        assert!(approx(trace.endpos.x, -1.125));
    }

    #[test]
    fn test_graze_outside_surface_misses() {
        let mut cm = unit_cube_world();
        // sliding past the cube a twentieth of a unit away must not hit
        let trace = point_trace(&mut cm, v(-2.0, 1.05, 0.0), v(2.0, 1.05, 0.0));
        assert_eq!(trace.fraction, 1.0);
        assert!(!trace.start_solid);
    }

    #[test]
    fn test_identity_sweep_matches_position_test() {
        let mut cm = unit_cube_world();
        let half = v(0.1, 0.1, 0.1);
        let step = v(0.01, 0.0, 0.0);

        for p in [v(0.0, 0.0, 0.0), v(3.0, 3.0, 3.0), v(-2.0, 0.0, 0.0)].iter() {
            let stationary = cm.box_trace(
                *p,
                *p,
                -half,
                half,
                Handle::world(),
                Contents::SOLID,
                false,
            );
            let moving = cm.box_trace(
                *p,
                *p + step,
                -half,
                half,
                Handle::world(),
                Contents::SOLID,
                false,
            );
            assert_eq!(
                stationary.fraction == 1.0,
                !moving.start_solid,
                "disagreement at {:?}",
                p
            );
        }
    }

    #[test]
    fn test_trace_is_deterministic() {
        let mut cm = unit_cube_world();
        let first = point_trace(&mut cm, v(-2.0, 0.25, 0.25), v(2.0, 0.25, 0.25));
        let second = point_trace(&mut cm, v(-2.0, 0.25, 0.25), v(2.0, 0.25, 0.25));
        assert_eq!(first, second);
    }

    #[test]
    fn test_random_trace_invariants() {
        let mut cm = unit_cube_world();
        let mut rng = StdRng::seed_from_u64(0x51_CA_FE);

        for _ in 0..300 {
            let mut point = || {
                v(
                    rng.gen_range(-4.0, 4.0),
                    rng.gen_range(-4.0, 4.0),
                    rng.gen_range(-4.0, 4.0),
                )
            };
            let start = point();
            let end = point();
            let half = v(
                rng.gen_range(0.0, 1.0),
                rng.gen_range(0.0, 1.0),
                rng.gen_range(0.0, 1.0),
            );

            let trace = cm.box_trace(
                start,
                end,
                -half,
                half,
                Handle::world(),
                Contents::SOLID,
                false,
            );

            assert!(trace.fraction >= 0.0 && trace.fraction <= 1.0);
            if trace.all_solid {
                assert!(trace.start_solid);
                assert_eq!(trace.fraction, 0.0);
            }
            if trace.fraction < 1.0 && !trace.all_solid {
                let len2 = trace.plane.normal().magnitude2();
                assert!(len2 > 0.9999 && len2 < 1.0001, "normal length {}", len2);
            }

            // endpoint round trip on the original endpoints
            let expect = if trace.fraction == 1.0 {
                end
            } else {
                start + (end - start) * trace.fraction
            };
            for i in 0..3 {
                assert!((trace.endpos[i] - expect[i]).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_fraction_scales_with_sweep_length() {
        let mut cm = unit_cube_world();
        let mut rng = StdRng::seed_from_u64(0xB0B);

        for _ in 0..100 {
            let start = v(rng.gen_range(1.5, 4.0), rng.gen_range(-3.0, 3.0), 0.0);
            let end = v(rng.gen_range(-4.0, -1.5), rng.gen_range(-3.0, 3.0), 0.0);
            let mid = start + (end - start) * 0.5;

            let half_trace = point_trace(&mut cm, start, mid);
            if half_trace.fraction == 1.0 || half_trace.start_solid {
                continue;
            }
            let full_trace = point_trace(&mut cm, start, end);
            // the same contact on a doubled sweep lands at half the
            // parameter
            assert!((full_trace.fraction - half_trace.fraction * 0.5).abs() < 1e-3);
        }
    }

    #[test]
    fn test_submodel_trace_matches_world() {
        let mut cm = unit_cube_world();

        let against_world = point_trace(&mut cm, v(-3.0, 0.2, 0.2), v(3.0, 0.2, 0.2));
        let against_submodel = cm.box_trace(
            v(-3.0, 0.2, 0.2),
            v(3.0, 0.2, 0.2),
            Vector3::zero(),
            Vector3::zero(),
            Handle::Model(1),
            Contents::SOLID,
            false,
        );

        // the world holds exactly the submodel's brush, so the synthetic
        // leaf and the tree must agree
        assert_eq!(against_world.fraction, against_submodel.fraction);
        assert_eq!(against_world.plane, against_submodel.plane);
        assert_eq!(against_world.contents, against_submodel.contents);
    }

    #[test]
    fn test_transformed_trace_zero_angles_is_translation() {
        let mut cm = unit_cube_world();
        let origin = v(10.0, -4.0, 2.0);
        let half = v(0.25, 0.25, 0.25);

        let transformed = cm.transformed_box_trace(
            v(7.0, -4.0, 2.0),
            v(13.0, -4.0, 2.0),
            -half,
            half,
            Handle::Model(1),
            Contents::SOLID,
            origin,
            Angles::zero(),
            false,
        );
        let local = cm.box_trace(
            v(-3.0, 0.0, 0.0),
            v(3.0, 0.0, 0.0),
            -half,
            half,
            Handle::Model(1),
            Contents::SOLID,
            false,
        );

        assert!(approx(transformed.fraction, local.fraction));
        assert_eq!(transformed.plane.normal(), local.plane.normal());
        // the endpoint comes back in the caller's coordinates
        let expect = v(7.0, -4.0, 2.0)
            + (v(13.0, -4.0, 2.0) - v(7.0, -4.0, 2.0)) * transformed.fraction;
        assert!(approx(transformed.endpos.x, expect.x));
    }

    #[test]
    fn test_rotated_submodel_capsule_trace() {
        let mut cm = build_world(
            &[
                (v(-1.0, -1.0, -1.0), v(1.0, 1.0, 1.0)),
                (v(1.0, -1.0, -1.0), v(3.0, 1.0, 1.0)),
            ],
            vec![],
        );

        // the second brush, yawed 45 degrees, sits across the diagonal
        let angles = Angles {
            pitch: Deg(0.0),
            yaw: Deg(45.0),
            roll: Deg(0.0),
        };
        let trace = cm.transformed_box_trace(
            v(8.0, 8.0, 0.0),
            v(0.0, 0.0, 0.0),
            v(-0.5, -0.5, -1.0),
            v(0.5, 0.5, 1.0),
            Handle::Model(2),
            Contents::SOLID,
            Vector3::zero(),
            angles,
            true,
        );

        assert!(trace.fraction > 0.0 && trace.fraction < 1.0);
        assert!(!trace.start_solid);
        let len2 = trace.plane.normal().magnitude2();
        assert!(len2 > 0.9999 && len2 < 1.0001);
        // the contact normal faces back along the approach diagonal
        assert!(trace.plane.normal().x > 0.3 && trace.plane.normal().y > 0.3);
    }

    #[test]
    fn test_point_trace_hits_flat_patch() {
        let mut cm = build_world(&[], vec![flat_patch()]);
        cm.stats.reset();

        let trace = point_trace(&mut cm, v(32.0, 32.0, 50.0), v(32.0, 32.0, -50.0));

        assert!(approx(trace.fraction, (50.0 - SURFACE_CLIP_EPSILON) / 100.0));
        assert!(trace.plane.normal().z > 0.99);
        assert!(approx(trace.endpos.z, SURFACE_CLIP_EPSILON));
        assert!(!trace.start_solid);
        assert_eq!(trace.contents, Contents::SOLID);
        // listed in both leaves, swept once
        assert_eq!(cm.stats.patch_traces, 1);
    }

    #[test]
    fn test_box_trace_hits_flat_patch() {
        let mut cm = build_world(&[], vec![flat_patch()]);
        let half = v(4.0, 4.0, 4.0);

        let trace = cm.box_trace(
            v(32.0, 32.0, 50.0),
            v(32.0, 32.0, -50.0),
            -half,
            half,
            Handle::world(),
            Contents::SOLID,
            false,
        );

        // the surface plane is pushed up by the box's lower corner
        assert!(approx(trace.fraction, (46.0 - SURFACE_CLIP_EPSILON) / 100.0));
        assert!(trace.plane.normal().z > 0.99);
        assert!(approx(trace.endpos.z, 4.0 + SURFACE_CLIP_EPSILON));
    }

    #[test]
    fn test_patches_can_be_disabled() {
        let mut cm = build_world(&[], vec![flat_patch()]);
        cm.settings.patch_collision = false;

        let trace = point_trace(&mut cm, v(32.0, 32.0, 50.0), v(32.0, 32.0, -50.0));
        assert_eq!(trace.fraction, 1.0);
    }

    #[test]
    fn test_cylinder_patch_wraps_at_seam() {
        let mut cm = build_world(&[], vec![cylinder_patch(64.0, 64.0)]);

        // approach the seam (the 0-degree column) head on
        let trace = point_trace(&mut cm, v(192.0, 0.01, 32.0), v(0.0, 0.01, 32.0));

        assert!(!trace.start_solid);
        assert!(
            trace.fraction > 0.6 && trace.fraction < 0.7,
            "fraction {}",
            trace.fraction
        );
        // contact lands on the cylinder wall near x = 64
        assert!(trace.endpos.x > 60.0 && trace.endpos.x < 66.0);
        assert!(trace.plane.normal().x > 0.7);
    }

    #[test]
    fn test_capsule_through_capsule() {
        let mut cm = unit_cube_world();
        let mins = v(-1.0, -1.0, -2.0);
        let maxs = v(1.0, 1.0, 2.0);
        let handle = cm.temp_box_model(mins, maxs, true);
        assert_eq!(handle, Handle::TempCapsule);

        let trace = cm.box_trace(
            v(-10.0, 0.0, 0.0),
            v(0.0, 0.0, 0.0),
            mins,
            maxs,
            handle,
            Contents::SOLID,
            true,
        );

        // both capsules have radius 1 and the expanded cylinder includes
        // the radius epsilon, so contact comes at three units of gap
        assert!(approx(trace.fraction, 0.7));
        assert!(approx(trace.endpos.x, -3.0));
        assert!(trace.plane.normal().x < -0.99);
        assert_eq!(trace.contents, Contents::BODY);
    }

    #[test]
    fn test_capsule_overlap_is_start_solid() {
        let mut cm = unit_cube_world();
        let mins = v(-1.0, -1.0, -2.0);
        let maxs = v(1.0, 1.0, 2.0);
        let handle = cm.temp_box_model(mins, maxs, true);

        let trace = cm.box_trace(
            v(0.5, 0.0, 0.0),
            v(0.5, 0.0, 0.0),
            mins,
            maxs,
            handle,
            Contents::SOLID,
            true,
        );

        assert!(trace.start_solid);
        assert!(trace.all_solid);
        assert_eq!(trace.fraction, 0.0);
    }

    #[test]
    fn test_box_through_capsule() {
        let mut cm = unit_cube_world();
        let mins = v(-1.0, -1.0, -2.0);
        let maxs = v(1.0, 1.0, 2.0);
        let handle = cm.temp_box_model(mins, maxs, true);

        // a box against the capsule model swaps shapes internally; the
        // stand-in box hull carries BODY contents
        let trace = cm.box_trace(
            v(-10.0, 0.0, 0.0),
            v(0.0, 0.0, 0.0),
            mins,
            maxs,
            handle,
            Contents::BODY,
            false,
        );

        assert!(trace.fraction > 0.0 && trace.fraction < 1.0);
        assert!(approx(trace.fraction, (8.0 - SURFACE_CLIP_EPSILON) / 10.0));
    }

    #[test]
    fn test_temp_box_model_trace() {
        let mut cm = unit_cube_world();
        let handle = cm.temp_box_model(v(-1.0, -1.0, -1.0), v(1.0, 1.0, 1.0), false);
        assert_eq!(handle, Handle::TempBox);

        let trace = cm.box_trace(
            v(-5.0, 0.0, 0.0),
            v(5.0, 0.0, 0.0),
            Vector3::zero(),
            Vector3::zero(),
            handle,
            Contents::BODY,
            false,
        );

        assert!(approx(trace.fraction, (4.0 - SURFACE_CLIP_EPSILON) / 10.0));
        assert_eq!(trace.plane.normal(), v(-1.0, 0.0, 0.0));
        assert_eq!(trace.contents, Contents::BODY);
    }

    #[test]
    fn test_loaded_map_traces_like_built_map() {
        // the same cube world, but parsed from a serialized file
        let data = crate::bsp::load::test::build_cube_map();
        let mut cm = crate::bsp::load::load(&data, Settings::default()).unwrap();

        let trace = point_trace(&mut cm, v(-2.0, 0.0, 0.0), v(2.0, 0.0, 0.0));
        assert!(approx(trace.fraction, (1.0 - SURFACE_CLIP_EPSILON) / 4.0));
        assert_eq!(trace.plane.normal(), v(-1.0, 0.0, 0.0));
    }

    #[test]
    fn test_content_mask_filters_brushes() {
        let mut cm = build_world(&[(v(-1.0, -1.0, -1.0), v(1.0, 1.0, 1.0))], vec![]);
        cm.brushes[0].contents = Contents::WATER;

        let solid_only = point_trace(&mut cm, v(-2.0, 0.0, 0.0), v(2.0, 0.0, 0.0));
        assert_eq!(solid_only.fraction, 1.0);

        let water = cm.box_trace(
            v(-2.0, 0.0, 0.0),
            v(2.0, 0.0, 0.0),
            Vector3::zero(),
            Vector3::zero(),
            Handle::world(),
            Contents::WATER,
            false,
        );
        assert!(water.fraction < 1.0);
        assert_eq!(water.contents, Contents::WATER);
    }
}

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

//! Stationary queries: is a volume overlapping solid geometry where it
//! stands, which leaves does a box touch, and what contents fill a point.

use cgmath::{InnerSpace, Vector3, Zero};

use crate::bsp::{ClipMap, Contents, Handle, Leaf, NodeChild};
use crate::math::{box_on_plane_side, dot64, rotation_matrix, Angles, Bounds, PlaneSides};
use crate::patch::PatchCollide;
use crate::trace::{Sphere, TraceWork};

/// Cap on leaves examined by one stationary overlap test.
pub const MAX_POSITION_LEAFS: usize = 1024;

/// Bounded output of a leaf-gathering walk.
///
/// When the walk finds more leaves than `max_count`, `overflowed` is set
/// and `last_leaf` still tracks the most recently visited leaf that is not
/// opaque, so callers can retry with a larger list or settle for an
/// approximation.
#[derive(Debug)]
pub struct LeafList {
    pub list: Vec<usize>,
    pub bounds: Bounds,
    pub last_leaf: usize,
    pub overflowed: bool,
    max_count: usize,
}

impl LeafList {
    fn new(bounds: Bounds, max_count: usize) -> LeafList {
        LeafList {
            list: Vec::new(),
            bounds,
            last_leaf: 0,
            overflowed: false,
            max_count,
        }
    }
}

impl ClipMap {
    /// Descends from node `num` to the leaf containing `p`.
    pub(crate) fn point_leafnum_node(&mut self, p: Vector3<f32>, num: usize) -> usize {
        let mut child = NodeChild::Node(num);
        loop {
            match child {
                NodeChild::Leaf(leaf_num) => {
                    self.stats.point_contents += 1;
                    return leaf_num;
                }
                NodeChild::Node(n) => {
                    let node = &self.nodes[n];
                    let d = self.planes[node.plane_id].point_dist(p);
                    child = if d < 0.0 {
                        node.children[1]
                    } else {
                        node.children[0]
                    };
                }
            }
        }
    }

    /// The leaf containing `p`, or 0 when no map is loaded.
    pub fn point_leafnum(&mut self, p: Vector3<f32>) -> usize {
        if !self.is_loaded() {
            return 0;
        }
        self.point_leafnum_node(p, 0)
    }

    fn store_leaf(&self, ll: &mut LeafList, leaf_num: usize) {
        // remember the last usable leaf even if the list is full
        if self.leaves[leaf_num].cluster != -1 {
            ll.last_leaf = leaf_num;
        }

        if ll.list.len() >= ll.max_count {
            ll.overflowed = true;
            return;
        }
        ll.list.push(leaf_num);
    }

    fn box_leafnums_node(&self, ll: &mut LeafList, mut child: NodeChild) {
        loop {
            let num = match child {
                NodeChild::Leaf(leaf_num) => {
                    self.store_leaf(ll, leaf_num);
                    return;
                }
                NodeChild::Node(num) => num,
            };

            let node = &self.nodes[num];
            let plane = &self.planes[node.plane_id];
            let sides = box_on_plane_side(ll.bounds.mins, ll.bounds.maxs, plane);
            if sides == PlaneSides::FRONT {
                child = node.children[0];
            } else if sides == PlaneSides::BACK {
                child = node.children[1];
            } else {
                // go down both
                self.box_leafnums_node(ll, node.children[0]);
                child = node.children[1];
            }
        }
    }

    /// Gathers every leaf whose region touches the box, up to `max_count`.
    pub fn box_leafnums(
        &mut self,
        mins: Vector3<f32>,
        maxs: Vector3<f32>,
        max_count: usize,
    ) -> LeafList {
        self.begin_check();

        let mut ll = LeafList::new(Bounds::new(mins, maxs), max_count);
        if self.is_loaded() {
            self.box_leafnums_node(&mut ll, NodeChild::Node(0));
        }
        ll
    }

    /// Stationary overlap against the whole world: collect the touched
    /// leaves, then test the volume inside each.
    pub(crate) fn position_test(&mut self, tw: &mut TraceWork) {
        let mut bounds = Bounds::new(tw.start + tw.size[0], tw.start + tw.size[1]);
        bounds.expand(1.0);

        self.begin_check();
        let mut ll = LeafList::new(bounds, MAX_POSITION_LEAFS);
        self.box_leafnums_node(&mut ll, NodeChild::Node(0));
        self.begin_check();

        // test the contents of the leaves
        for i in 0..ll.list.len() {
            let leaf = self.leaves[ll.list[i]].clone();
            self.test_in_leaf(tw, &leaf);
            if tw.trace.all_solid {
                break;
            }
        }
    }

    /// Tests the start volume against everything one leaf references.
    pub(crate) fn test_in_leaf(&mut self, tw: &mut TraceWork, leaf: &Leaf) {
        // test box position against all brushes in the leaf
        for k in 0..leaf.num_leaf_brushes {
            let brush_num = self.leaf_brushes[leaf.first_leaf_brush + k];

            {
                let brush = &mut self.brushes[brush_num];
                if brush.checkcount == self.checkcount {
                    continue; // already checked this brush in another leaf
                }
                brush.checkcount = self.checkcount;
            }

            if !self.brushes[brush_num].contents.intersects(tw.contents) {
                continue;
            }

            self.test_box_in_brush(tw, brush_num);
            if tw.trace.all_solid {
                return;
            }
        }

        // test against all patches
        if self.settings.patch_collision {
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

                if let Some(patch) = &self.surfaces[surf_num] {
                    if position_test_in_patch_collide(tw, &patch.collide) {
                        tw.trace.start_solid = true;
                        tw.trace.all_solid = true;
                        tw.trace.fraction = 0.0;
                        tw.trace.contents = patch.contents;
                        return;
                    }
                }
            }
        }
    }

    /// Is the start volume inside this brush? The first six sides are the
    /// axial bounding planes and were already covered by the bounds
    /// rejection, so only the remaining sides are tested.
    fn test_box_in_brush(&self, tw: &mut TraceWork, brush_num: usize) {
        let brush = &self.brushes[brush_num];
        if brush.num_sides == 0 {
            return;
        }

        // special test for axial
        if tw.bounds.mins.x > brush.bounds.maxs.x
            || tw.bounds.mins.y > brush.bounds.maxs.y
            || tw.bounds.mins.z > brush.bounds.maxs.z
            || tw.bounds.maxs.x < brush.bounds.mins.x
            || tw.bounds.maxs.y < brush.bounds.mins.y
            || tw.bounds.maxs.z < brush.bounds.mins.z
        {
            return;
        }

        for side_num in brush.first_side + 6..brush.first_side + brush.num_sides {
            let side = &self.brush_sides[side_num];
            let plane = &self.planes[side.plane_id];

            let d1 = match &tw.sphere {
                Some(sphere) => {
                    // adjust the plane distance appropriately for radius
                    let dist = plane.dist() as f64 + sphere.radius as f64;
                    // find the closest point on the capsule to the plane
                    let t = dot64(plane.normal(), sphere.offset);
                    let start_p = if t > 0.0 {
                        tw.start - sphere.offset
                    } else {
                        tw.start + sphere.offset
                    };
                    dot64(start_p, plane.normal()) - dist
                }
                None => {
                    // adjust the plane distance appropriately for mins/maxs
                    let dist = plane.dist() as f64
                        - dot64(tw.offsets[plane.sign_bits() as usize], plane.normal());
                    dot64(tw.start, plane.normal()) - dist
                }
            };

            // completely in front of this face, no intersection
            if d1 > 0.0 {
                return;
            }
        }

        // inside this brush
        tw.trace.start_solid = true;
        tw.trace.all_solid = true;
        tw.trace.fraction = 0.0;
        tw.trace.contents = brush.contents;
    }

    /// Overlap between the query capsule and a capsule model: any of the
    /// four sphere pairs or the two cylinders touching means solid.
    pub(crate) fn test_capsule_in_capsule(&mut self, tw: &mut TraceWork, model: Handle) {
        let bounds = self.model_bounds(model);
        let sphere = match &tw.sphere {
            Some(s) => *s,
            None => return,
        };

        let top = tw.start + sphere.offset;
        let bottom = tw.start - sphere.offset;

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

        let r = (sphere.radius + radius) * (sphere.radius + radius);

        // check if any of the spheres overlap
        let mut p1 = offset;
        p1.z += offs;
        if (p1 - top).magnitude2() < r || (p1 - bottom).magnitude2() < r {
            tw.trace.start_solid = true;
            tw.trace.all_solid = true;
            tw.trace.fraction = 0.0;
        }

        let mut p2 = offset;
        p2.z -= offs;
        if (p2 - top).magnitude2() < r || (p2 - bottom).magnitude2() < r {
            tw.trace.start_solid = true;
            tw.trace.all_solid = true;
            tw.trace.fraction = 0.0;
        }

        // if between the cylinder's upper and lower bounds
        if (top.z >= p1.z && top.z <= p2.z) || (bottom.z >= p1.z && bottom.z <= p2.z) {
            // 2d overlap of the cylinders
            let top_2d = Vector3::new(top.x, top.y, 0.0);
            let p1_2d = Vector3::new(p1.x, p1.y, 0.0);
            if (top_2d - p1_2d).magnitude2() < r {
                tw.trace.start_solid = true;
                tw.trace.all_solid = true;
                tw.trace.fraction = 0.0;
            }
        }
    }

    /// Overlap between the query box and a capsule model: swap shapes so
    /// the capsule math runs against the box hull.
    pub(crate) fn test_bounding_box_in_capsule(&mut self, tw: &mut TraceWork, model: Handle) {
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
        self.test_in_leaf(tw, &leaf);
    }

    /// ORed contents of every brush containing the point.
    pub fn point_contents(&mut self, p: Vector3<f32>, model: Handle) -> Contents {
        if !self.is_loaded() {
            return Contents::empty();
        }

        let leaf = match model {
            Handle::Model(0) => {
                let leaf_num = self.point_leafnum_node(p, 0);
                self.leaves[leaf_num].clone()
            }
            _ => self.model(model).leaf.clone(),
        };

        let mut contents = Contents::empty();
        for k in 0..leaf.num_leaf_brushes {
            let brush_num = self.leaf_brushes[leaf.first_leaf_brush + k];
            let brush = &self.brushes[brush_num];

            if !brush.bounds.intersects_point(p) {
                continue;
            }

            // see if the point is behind every side plane
            let inside = self.brush_sides[brush.first_side..brush.first_side + brush.num_sides]
                .iter()
                .all(|side| {
                    let plane = &self.planes[side.plane_id];
                    dot64(p, plane.normal()) as f32 <= plane.dist()
                });
            if inside {
                contents |= brush.contents;
            }
        }

        contents
    }

    /// Content sampling against a submodel at a world pose: the point is
    /// carried into the model's frame before sampling.
    pub fn transformed_point_contents(
        &mut self,
        p: Vector3<f32>,
        model: Handle,
        origin: Vector3<f32>,
        angles: Angles,
    ) -> Contents {
        let mut p_l = p - origin;

        if model != Handle::TempBox && !angles.is_zero() {
            p_l = rotation_matrix(angles) * p_l;
        }

        self.point_contents(p_l, model)
    }
}

/// Is the start volume inside any facet of the patch? Point queries always
/// miss; a surface has no volume for a point to be inside of.
pub(crate) fn position_test_in_patch_collide(tw: &TraceWork, pc: &PatchCollide) -> bool {
    if tw.is_point {
        return false;
    }

    for facet in &pc.facets {
        let pp = &pc.planes[facet.surface_plane];
        let mut normal = pp.normal;
        let mut dist = pp.dist;
        let start_p;
        match &tw.sphere {
            Some(sphere) => {
                // adjust the plane distance appropriately for radius
                dist += sphere.radius;
                // find the closest point on the capsule to the plane
                let t = dot64(normal, sphere.offset) as f32;
                start_p = if t > 0.0 {
                    tw.start - sphere.offset
                } else {
                    tw.start + sphere.offset
                };
            }
            None => {
                let offset = dot64(tw.offsets[pp.sign_bits as usize], normal) as f32;
                dist -= offset;
                start_p = tw.start;
            }
        }

        if (dot64(start_p, normal) as f32) - dist > 0.0 {
            continue;
        }

        let mut outside = false;
        for border in &facet.borders {
            let pp = &pc.planes[border.plane];
            if border.inward {
                normal = -pp.normal;
                dist = -pp.dist;
            } else {
                normal = pp.normal;
                dist = pp.dist;
            }
            let start_p;
            match &tw.sphere {
                Some(sphere) => {
                    dist += sphere.radius;
                    let t = dot64(normal, sphere.offset) as f32;
                    start_p = if t > 0.0 {
                        tw.start - sphere.offset
                    } else {
                        tw.start + sphere.offset
                    };
                }
                None => {
                    // works even when the border is flipped because the box
                    // is centered
                    let offset = dot64(tw.offsets[pp.sign_bits as usize], normal) as f32;
                    dist += offset.abs();
                    start_p = tw.start;
                }
            }

            if (dot64(start_p, normal) as f32) - dist > 0.0 {
                outside = true;
                break;
            }
        }
        if outside {
            continue;
        }

        // inside this patch facet
        return true;
    }

    false
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bsp::Settings;

    use cgmath::InnerSpace;

    fn cube_world() -> ClipMap {
        let data = crate::bsp::load::test::build_cube_map();
        crate::bsp::load::load(&data, Settings::default()).unwrap()
    }

    #[test]
    fn test_point_contents_inside_and_out() {
        let mut cm = cube_world();

        let inside = cm.point_contents(Vector3::new(0.5, 0.0, 0.0), Handle::world());
        assert_eq!(inside, Contents::SOLID);

        let outside = cm.point_contents(Vector3::new(5.0, 0.0, 0.0), Handle::world());
        assert_eq!(outside, Contents::empty());

        // exactly on the surface counts as inside
        let surface = cm.point_contents(Vector3::new(1.0, 0.0, 0.0), Handle::world());
        assert_eq!(surface, Contents::SOLID);
    }

    #[test]
    fn test_point_contents_temp_box() {
        let mut cm = cube_world();
        let handle = cm.temp_box_model(
            Vector3::new(4.0, 4.0, 4.0),
            Vector3::new(6.0, 6.0, 6.0),
            false,
        );

        let inside = cm.point_contents(Vector3::new(5.0, 5.0, 5.0), handle);
        assert_eq!(inside, Contents::BODY);

        let outside = cm.point_contents(Vector3::new(0.0, 0.0, 0.0), handle);
        assert_eq!(outside, Contents::empty());
    }

    #[test]
    fn test_transformed_point_contents_offset() {
        let mut cm = cube_world();

        // sampling at the model origin shifts the point into model space
        let origin = Vector3::new(10.0, 0.0, 0.0);
        let contents = cm.transformed_point_contents(
            Vector3::new(10.5, 0.0, 0.0),
            Handle::world(),
            origin,
            Angles::zero(),
        );
        assert_eq!(contents, Contents::SOLID);
    }

    #[test]
    fn test_point_leafnum_sides() {
        let mut cm = cube_world();
        // the cube map has one node on x = 0: leaf 0 in front, leaf 1 behind
        assert_eq!(cm.point_leafnum(Vector3::new(5.0, 0.0, 0.0)), 0);
        assert_eq!(cm.point_leafnum(Vector3::new(-5.0, 0.0, 0.0)), 1);
        assert!(cm.stats.point_contents >= 2);
    }

    #[test]
    fn test_box_leafnums_gathers_both_sides() {
        let mut cm = cube_world();

        let ll = cm.box_leafnums(
            Vector3::new(-2.0, -2.0, -2.0),
            Vector3::new(2.0, 2.0, 2.0),
            16,
        );
        assert!(!ll.overflowed);
        assert_eq!(ll.list.len(), 2);

        let one_side = cm.box_leafnums(
            Vector3::new(2.0, -1.0, -1.0),
            Vector3::new(4.0, 1.0, 1.0),
            16,
        );
        assert_eq!(one_side.list.len(), 1);
        assert_eq!(one_side.list[0], 0);
    }

    #[test]
    fn test_box_leafnums_overflow() {
        let mut cm = cube_world();

        let ll = cm.box_leafnums(
            Vector3::new(-2.0, -2.0, -2.0),
            Vector3::new(2.0, 2.0, 2.0),
            1,
        );
        assert!(ll.overflowed);
        assert_eq!(ll.list.len(), 1);
        // the overflowed leaf is still remembered
        assert_eq!(ll.last_leaf, 1);
    }

    #[test]
    fn test_position_test_in_patch_collide_point_misses() {
        let points = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(32.0, 0.0, 0.0),
            Vector3::new(64.0, 0.0, 0.0),
            Vector3::new(0.0, 32.0, 0.0),
            Vector3::new(32.0, 32.0, 0.0),
            Vector3::new(64.0, 32.0, 0.0),
            Vector3::new(0.0, 64.0, 0.0),
            Vector3::new(32.0, 64.0, 0.0),
            Vector3::new(64.0, 64.0, 0.0),
        ];
        let pc = crate::patch::generate_patch_collide(3, 3, &points).unwrap();

        let mut tw = TraceWork {
            start: Vector3::new(32.0, 32.0, 0.0),
            end: Vector3::new(32.0, 32.0, 0.0),
            size: [Vector3::zero(), Vector3::zero()],
            offsets: [Vector3::zero(); 8],
            extents: Vector3::zero(),
            bounds: Bounds::new(Vector3::zero(), Vector3::zero()),
            model_origin: Vector3::zero(),
            contents: Contents::SOLID,
            is_point: true,
            trace: Default::default(),
            sphere: None,
        };

        // a point has no volume to embed in a surface
        assert!(!position_test_in_patch_collide(&tw, &pc));

        // a box centered on the surface does overlap it
        tw.is_point = false;
        let half = Vector3::new(4.0, 4.0, 4.0);
        tw.size = [-half, half];
        for sign_bits in 0..8 {
            for i in 0..3 {
                tw.offsets[sign_bits][i] = tw.size[(sign_bits >> i) & 1][i];
            }
        }
        assert!(position_test_in_patch_collide(&tw, &pc));
    }

    #[test]
    fn test_unloaded_map_queries_are_empty() {
        let mut cm = ClipMap::new();
        assert_eq!(cm.point_leafnum(Vector3::new(1.0, 2.0, 3.0)), 0);
        assert_eq!(
            cm.point_contents(Vector3::zero(), Handle::world()),
            Contents::empty()
        );

        let trace = cm.box_trace(
            Vector3::zero(),
            Vector3::new(10.0, 0.0, 0.0),
            Vector3::zero(),
            Vector3::zero(),
            Handle::world(),
            Contents::SOLID,
            false,
        );
        assert_eq!(trace.fraction, 1.0);
        assert!(!trace.start_solid);
        assert_eq!(trace.plane.normal().magnitude(), 0.0);
    }
}

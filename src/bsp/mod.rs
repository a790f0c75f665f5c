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

//! The clip map: an in-memory BSP world built for collision queries.
//!
//! # Data structure
//!
//! Space is partitioned by a binary tree of splitting planes. Leaves are
//! convex cells which reference the solid brushes and curved-patch surfaces
//! they touch through two shared index arrays; a brush that straddles a
//! split appears in every leaf it touches, which is why queries stamp each
//! brush with a per-query check counter to avoid testing it twice.
//!
//! Every record type lives in a contiguous array owned by [`ClipMap`] and is
//! referenced by index, never by pointer. Submodel 0 is the world and is
//! queried through the tree root; the remaining submodels carry a synthetic
//! leaf listing their brushes and surfaces directly.
//!
//! A six-sided "box hull" brush is appended to the arrays at load time so
//! that a caller-supplied bounding box can be queried with the same brush
//! code as world geometry; see [`ClipMap::temp_box_model`].

mod check;
pub(crate) mod load;

use cgmath::{Vector3, Zero};
use failure::{bail, ensure, Error};

use crate::math::{Bounds, Plane};
use crate::patch::PatchCollide;

pub const MAX_SUBMODELS: usize = 256;

// extra array slots reserved for the box hull
const BOX_BRUSHES: usize = 1;
const BOX_SIDES: usize = 6;
const BOX_PLANES: usize = 12;

bitflags! {
    /// Content bits attached to brushes and patches through their shader.
    pub struct Contents: i32 {
        const SOLID = 0x1;
        const LAVA = 0x8;
        const SLIME = 0x10;
        const WATER = 0x20;
        const FOG = 0x40;
        const NOTTEAM1 = 0x80;
        const NOTTEAM2 = 0x100;
        const NOBOTCLIP = 0x200;
        const AREAPORTAL = 0x8000;
        const PLAYERCLIP = 0x10000;
        const MONSTERCLIP = 0x20000;
        const TELEPORTER = 0x40000;
        const JUMPPAD = 0x80000;
        const CLUSTERPORTAL = 0x100000;
        const DONOTENTER = 0x200000;
        const BOTCLIP = 0x400000;
        const MOVER = 0x800000;
        const ORIGIN = 0x1000000;
        const BODY = 0x2000000;
        const CORPSE = 0x4000000;
        const DETAIL = 0x8000000;
        const STRUCTURAL = 0x10000000;
        const TRANSLUCENT = 0x20000000;
        const TRIGGER = 0x40000000;
        const NODROP = 0x8000_0000u32 as i32;
    }
}

bitflags! {
    /// Surface attribute bits attached to brush sides through their shader.
    pub struct SurfaceFlags: i32 {
        const NODAMAGE = 0x1;
        const SLICK = 0x2;
        const SKY = 0x4;
        const LADDER = 0x8;
        const NOIMPACT = 0x10;
        const NOMARKS = 0x20;
        const FLESH = 0x40;
        const NODRAW = 0x80;
        const HINT = 0x100;
        const SKIP = 0x200;
        const NOLIGHTMAP = 0x400;
        const POINTLIGHT = 0x800;
        const METALSTEPS = 0x1000;
        const NOSTEPS = 0x2000;
        const NONSOLID = 0x4000;
        const LIGHTFILTER = 0x8000;
        const ALPHASHADOW = 0x10000;
        const NODLIGHT = 0x20000;
        const DUST = 0x40000;
    }
}

/// Shader metadata forwarded into trace results.
#[derive(Clone, Debug)]
pub struct Shader {
    pub name: String,
    pub surface_flags: SurfaceFlags,
    pub contents: Contents,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeChild {
    Node(usize),
    Leaf(usize),
}

#[derive(Debug)]
pub struct Node {
    pub plane_id: usize,
    pub children: [NodeChild; 2],
}

#[derive(Clone, Debug)]
pub struct Leaf {
    pub cluster: i32,
    pub area: i32,
    pub first_leaf_brush: usize,
    pub num_leaf_brushes: usize,
    pub first_leaf_surface: usize,
    pub num_leaf_surfaces: usize,
}

#[derive(Debug)]
pub struct BrushSide {
    pub plane_id: usize,
    pub shader_id: usize,
    pub surface_flags: SurfaceFlags,
}

/// A convex solid: the intersection of its sides' half-spaces.
///
/// The first six sides of every brush from the map are the axial bounding
/// planes in the fixed order -X +X -Y +Y -Z +Z, so the cached bounds are
/// read straight off their distances and position tests can skip them.
#[derive(Debug)]
pub struct Brush {
    pub shader_id: usize,
    pub contents: Contents,
    pub bounds: Bounds,
    pub first_side: usize,
    pub num_sides: usize,
    pub(crate) checkcount: u32,
}

/// A named subtree of the world. Submodels other than the world hold a
/// synthetic leaf instead of referencing the root tree.
#[derive(Clone, Debug)]
pub struct Model {
    pub bounds: Bounds,
    pub leaf: Leaf,
}

/// A curved surface converted into facet geometry for collision.
#[derive(Debug)]
pub struct Patch {
    pub surface_flags: SurfaceFlags,
    pub contents: Contents,
    pub collide: PatchCollide,
    pub(crate) checkcount: u32,
}

#[derive(Clone, Debug, Default)]
pub struct Visibility {
    pub vised: bool,
    pub num_clusters: usize,
    pub cluster_bytes: usize,
    pub data: Vec<u8>,
}

/// Runtime toggles, the crate's stand-in for console variables.
#[derive(Clone, Copy, Debug)]
pub struct Settings {
    /// Volume traces collide with patch facets.
    pub patch_collision: bool,
    /// Point traces collide with patch facets.
    pub player_curve_collision: bool,
    /// Skip building patch geometry at load time.
    pub no_curves: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            patch_collision: true,
            player_curve_collision: true,
            no_curves: false,
        }
    }
}

/// Counters bumped by successful query stages.
#[derive(Clone, Copy, Debug, Default)]
pub struct TraceStats {
    pub traces: u64,
    pub brush_traces: u64,
    pub patch_traces: u64,
    pub point_contents: u64,
}

impl TraceStats {
    pub fn reset(&mut self) {
        *self = TraceStats::default();
    }
}

/// Something traces can be run against: a submodel of the loaded map or the
/// temporary hull most recently stored by [`ClipMap::temp_box_model`].
///
/// `Model(0)` is the world and is swept through the BSP root; other
/// submodels are swept directly against their synthetic leaf.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Handle {
    Model(usize),
    TempBox,
    TempCapsule,
}

impl Handle {
    pub fn world() -> Handle {
        Handle::Model(0)
    }
}

/// Produces the raw bytes of a named map. This is the crate's only seam to
/// the outside world; callers decide whether bytes come from a pak archive,
/// the filesystem, or memory.
pub trait MapSource {
    fn open(&self, name: &str) -> Result<Vec<u8>, Error>;
}

/// The loaded collision world.
///
/// A fresh `ClipMap` is empty; every query against it returns a default
/// result until [`ClipMap::load_map`] succeeds.
#[derive(Debug)]
pub struct ClipMap {
    pub(crate) name: String,
    pub(crate) shaders: Vec<Shader>,
    pub(crate) planes: Vec<Plane>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) leaves: Vec<Leaf>,
    pub(crate) leaf_brushes: Vec<usize>,
    pub(crate) leaf_surfaces: Vec<usize>,
    pub(crate) models: Vec<Model>,
    pub(crate) brushes: Vec<Brush>,
    pub(crate) brush_sides: Vec<BrushSide>,
    pub(crate) surfaces: Vec<Option<Patch>>,
    pub(crate) entity_string: String,
    pub(crate) visibility: Visibility,
    pub(crate) checksum: u32,
    pub(crate) checkcount: u32,

    // temporary hull for box-shaped queries
    pub(crate) box_model: Model,
    pub(crate) box_planes: usize,
    pub(crate) box_brush: usize,

    pub settings: Settings,
    pub stats: TraceStats,
}

impl Default for ClipMap {
    fn default() -> ClipMap {
        ClipMap::new()
    }
}

impl ClipMap {
    /// An empty clip map with nothing loaded.
    pub fn new() -> ClipMap {
        ClipMap {
            name: String::new(),
            shaders: Vec::new(),
            planes: Vec::new(),
            nodes: Vec::new(),
            leaves: Vec::new(),
            leaf_brushes: Vec::new(),
            leaf_surfaces: Vec::new(),
            models: Vec::new(),
            brushes: Vec::new(),
            brush_sides: Vec::new(),
            surfaces: Vec::new(),
            entity_string: String::new(),
            visibility: Visibility::default(),
            checksum: 0,
            checkcount: 0,
            box_model: Model {
                bounds: Bounds::new(Vector3::zero(), Vector3::zero()),
                leaf: Leaf {
                    cluster: 0,
                    area: 0,
                    first_leaf_brush: 0,
                    num_leaf_brushes: 0,
                    first_leaf_surface: 0,
                    num_leaf_surfaces: 0,
                },
            },
            box_planes: 0,
            box_brush: 0,
            settings: Settings::default(),
            stats: TraceStats::default(),
        }
    }

    /// Loads the named map, replacing whatever was loaded before.
    ///
    /// Reloading the map that is already resident with `client_load` set is
    /// a no-op which returns the cached checksum. On error the map is left
    /// cleared, never half-loaded.
    pub fn load_map(
        &mut self,
        name: &str,
        client_load: bool,
        source: &dyn MapSource,
    ) -> Result<u32, Error> {
        ensure!(!name.is_empty(), "load_map: empty map name");

        if self.name == name && client_load {
            return Ok(self.checksum);
        }

        let settings = self.settings;
        self.clear_map();

        let data = source.open(name)?;
        let mut loaded = load::load(&data, settings)?;
        loaded.name = name.to_owned();
        loaded.settings = settings;
        *self = loaded;

        debug!(
            "loaded {}: {} nodes, {} leaves, {} brushes, {} planes, checksum {:#010x}",
            self.name,
            self.nodes.len(),
            self.leaves.len(),
            self.brushes.len(),
            self.planes.len(),
            self.checksum,
        );

        Ok(self.checksum)
    }

    /// Releases the loaded map. Settings survive, statistics reset.
    pub fn clear_map(&mut self) {
        let settings = self.settings;
        *self = ClipMap::new();
        self.settings = settings;
    }

    pub fn is_loaded(&self) -> bool {
        !self.nodes.is_empty()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn entity_string(&self) -> &str {
        &self.entity_string
    }

    pub fn num_clusters(&self) -> usize {
        self.visibility.num_clusters
    }

    pub fn num_inline_models(&self) -> usize {
        self.models.len()
    }

    pub fn inline_model(&self, index: usize) -> Result<Handle, Error> {
        ensure!(
            index < self.models.len(),
            "inline_model: bad model index {}",
            index
        );
        Ok(Handle::Model(index))
    }

    pub fn leaf_cluster(&self, leaf_id: usize) -> Result<i32, Error> {
        match self.leaves.get(leaf_id) {
            Some(l) => Ok(l.cluster),
            None => bail!("leaf_cluster: bad leaf index {}", leaf_id),
        }
    }

    pub fn leaf_area(&self, leaf_id: usize) -> Result<i32, Error> {
        match self.leaves.get(leaf_id) {
            Some(l) => Ok(l.area),
            None => bail!("leaf_area: bad leaf index {}", leaf_id),
        }
    }

    /// Resolves a handle to its model record.
    ///
    /// ## Panics
    /// If a `Handle::Model` index is out of range. Handles obtained from
    /// [`ClipMap::inline_model`] and [`ClipMap::temp_box_model`] are always
    /// valid for the map that produced them.
    pub fn model(&self, handle: Handle) -> &Model {
        match handle {
            Handle::Model(i) => &self.models[i],
            // the capsule reuses the box model's bounds
            Handle::TempBox | Handle::TempCapsule => &self.box_model,
        }
    }

    pub fn model_bounds(&self, handle: Handle) -> Bounds {
        self.model(handle).bounds
    }

    /// Starts a new deduplication pass: queries stamp every brush and patch
    /// they visit with the new counter value.
    ///
    /// The counter is 32 bits wide; on the wraparound every stale stamp is
    /// cleared so an old stamp can never alias the fresh counter.
    pub(crate) fn begin_check(&mut self) {
        self.checkcount = self.checkcount.wrapping_add(1);
        if self.checkcount == 0 {
            for brush in &mut self.brushes {
                brush.checkcount = 0;
            }
            for patch in self.surfaces.iter_mut().flatten() {
                patch.checkcount = 0;
            }
            self.checkcount = 1;
        }
    }

    /// Appends the planes, sides, brush and leaf-brush slot backing the
    /// temporary box hull. Called once at the end of a successful load.
    pub(crate) fn init_box_hull(&mut self) {
        self.box_planes = self.planes.len();
        self.box_brush = self.brushes.len();

        let first_side = self.brush_sides.len();
        for i in 0..6 {
            let axis = i >> 1;

            // each face stores an outward plane and its inward twin
            let mut normal = Vector3::zero();
            normal[axis] = 1.0;
            self.planes.push(Plane::new(normal, 0.0));

            let mut normal = Vector3::zero();
            normal[axis] = -1.0;
            self.planes.push(Plane::new(normal, 0.0));

            let side = i & 1;
            self.brush_sides.push(BrushSide {
                plane_id: self.box_planes + i * 2 + side,
                shader_id: 0,
                surface_flags: SurfaceFlags::empty(),
            });
        }
        debug_assert_eq!(self.planes.len(), self.box_planes + BOX_PLANES);
        debug_assert_eq!(self.brush_sides.len(), first_side + BOX_SIDES);

        self.brushes.push(Brush {
            shader_id: 0,
            contents: Contents::BODY,
            bounds: Bounds::new(Vector3::zero(), Vector3::zero()),
            first_side,
            num_sides: BOX_SIDES,
            checkcount: 0,
        });
        debug_assert_eq!(self.brushes.len(), self.box_brush + BOX_BRUSHES);

        let first_leaf_brush = self.leaf_brushes.len();
        self.leaf_brushes.push(self.box_brush);

        self.box_model.leaf = Leaf {
            cluster: 0,
            area: 0,
            first_leaf_brush,
            num_leaf_brushes: 1,
            first_leaf_surface: 0,
            num_leaf_surfaces: 0,
        };
    }

    /// Stores a caller-supplied bounding box in the temporary hull so it can
    /// be queried like any other submodel, and returns its handle.
    ///
    /// Only the twelve plane distances and the cached bounds change between
    /// reuses; the normals, sign bits and brush structure are fixed. When
    /// `capsule` is set the hull is left untouched and the returned handle
    /// selects the capsule query paths instead.
    pub fn temp_box_model(
        &mut self,
        mins: Vector3<f32>,
        maxs: Vector3<f32>,
        capsule: bool,
    ) -> Handle {
        self.box_model.bounds = Bounds::new(mins, maxs);

        if capsule {
            return Handle::TempCapsule;
        }

        let bp = self.box_planes;
        self.planes[bp].set_dist(maxs.x);
        self.planes[bp + 1].set_dist(-maxs.x);
        self.planes[bp + 2].set_dist(mins.x);
        self.planes[bp + 3].set_dist(-mins.x);
        self.planes[bp + 4].set_dist(maxs.y);
        self.planes[bp + 5].set_dist(-maxs.y);
        self.planes[bp + 6].set_dist(mins.y);
        self.planes[bp + 7].set_dist(-mins.y);
        self.planes[bp + 8].set_dist(maxs.z);
        self.planes[bp + 9].set_dist(-maxs.z);
        self.planes[bp + 10].set_dist(mins.z);
        self.planes[bp + 11].set_dist(-mins.z);

        self.brushes[self.box_brush].bounds = Bounds::new(mins, maxs);

        Handle::TempBox
    }
}

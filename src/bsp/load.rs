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

//! Parses a version-46 BSP byte buffer into a [`ClipMap`].
//!
//! The file starts with a 4-byte identifier and a version number, followed
//! by seventeen lump descriptors (offset and length). Only the lumps the
//! collision solver needs are decoded; draw-only lumps such as lightmaps
//! are validated but otherwise ignored. Draw vertices are read solely to
//! supply control points for patch surfaces.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use cgmath::Vector3;
use failure::{bail, ensure, Error};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::bsp::{
    check, Brush, BrushSide, ClipMap, Leaf, Model, Node, NodeChild, Patch, Settings, Shader,
    SurfaceFlags, Visibility, MAX_SUBMODELS,
};
use crate::math::{Bounds, Plane};
use crate::patch::generate_patch_collide;

const VERSION: i32 = 46;

const HEADER_SIZE: usize = 8 + LUMP_COUNT * 8;
const LUMP_COUNT: usize = 17;

const SHADER_NAME_MAX: usize = 64;

const SHADER_SIZE: usize = 72;
const PLANE_SIZE: usize = 16;
const NODE_SIZE: usize = 36;
const LEAF_SIZE: usize = 48;
const LEAF_INDEX_SIZE: usize = 4;
const MODEL_SIZE: usize = 40;
const BRUSH_SIZE: usize = 12;
const BRUSH_SIDE_SIZE: usize = 8;
const VERTEX_SIZE: usize = 44;
const SURFACE_SIZE: usize = 104;
const VIS_HEADER_SIZE: usize = 8;

const MAX_PATCH_VERTS: usize = 1024;

/// A draw surface of this kind carries a quadratic patch mesh.
const SURFACE_TYPE_PATCH: i32 = 2;

#[derive(Copy, Clone, Debug, FromPrimitive)]
enum LumpId {
    Entities = 0,
    Shaders = 1,
    Planes = 2,
    Nodes = 3,
    Leaves = 4,
    LeafSurfaces = 5,
    LeafBrushes = 6,
    Models = 7,
    Brushes = 8,
    BrushSides = 9,
    DrawVerts = 10,
    DrawIndexes = 11,
    Fogs = 12,
    Surfaces = 13,
    Lightmaps = 14,
    LightGrid = 15,
    Visibility = 16,
}

struct Lump {
    offset: usize,
    size: usize,
}

impl Lump {
    fn from_i32s(offset: i32, size: i32, file_len: usize) -> Result<Lump, Error> {
        ensure!(offset >= 0, "negative lump offset {}", offset);
        ensure!(size >= 0, "negative lump size {}", size);
        ensure!(
            offset as i64 + size as i64 <= file_len as i64,
            "lump [{} + {}] overruns file of {} bytes",
            offset,
            size,
            file_len,
        );
        Ok(Lump {
            offset: offset as usize,
            size: size as usize,
        })
    }

    fn slice<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.offset..self.offset + self.size]
    }

    fn record_count(&self, record_size: usize, what: &str) -> Result<usize, Error> {
        ensure!(
            self.size % record_size == 0,
            "funny {} lump size ({} % {})",
            what,
            self.size,
            record_size,
        );
        Ok(self.size / record_size)
    }
}

fn read_vector3(reader: &mut Cursor<&[u8]>) -> Result<Vector3<f32>, Error> {
    Ok(Vector3::new(
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
    ))
}

fn load_shaders(data: &[u8], lump: &Lump) -> Result<Vec<Shader>, Error> {
    let count = lump.record_count(SHADER_SIZE, "shader")?;
    ensure!(count >= 1, "map with no shaders");

    let mut reader = Cursor::new(lump.slice(data));
    let mut shaders = Vec::with_capacity(count);
    for _ in 0..count {
        let mut name_bytes = [0u8; SHADER_NAME_MAX];
        std::io::Read::read_exact(&mut reader, &mut name_bytes)?;
        let len = name_bytes.iter().position(|&b| b == 0).unwrap_or(SHADER_NAME_MAX);
        let name = String::from_utf8_lossy(&name_bytes[..len]).into_owned();

        let surface_flags = SurfaceFlags::from_bits_truncate(reader.read_i32::<LittleEndian>()?);
        let contents = super::Contents::from_bits_truncate(reader.read_i32::<LittleEndian>()?);

        shaders.push(Shader {
            name,
            surface_flags,
            contents,
        });
    }

    Ok(shaders)
}

fn load_planes(data: &[u8], lump: &Lump) -> Result<Vec<Plane>, Error> {
    let count = lump.record_count(PLANE_SIZE, "plane")?;
    ensure!(count >= 1, "map with no planes");

    let mut reader = Cursor::new(lump.slice(data));
    let mut planes = Vec::with_capacity(count);
    for _ in 0..count {
        let normal = read_vector3(&mut reader)?;
        let dist = reader.read_f32::<LittleEndian>()?;
        planes.push(Plane::new(normal, dist));
    }

    Ok(planes)
}

fn load_leaves(data: &[u8], lump: &Lump) -> Result<(Vec<Leaf>, usize), Error> {
    let count = lump.record_count(LEAF_SIZE, "leaf")?;
    ensure!(count >= 1, "map with no leaves");

    let mut reader = Cursor::new(lump.slice(data));
    let mut leaves = Vec::with_capacity(count);
    let mut num_clusters = 0;
    for _ in 0..count {
        let cluster = reader.read_i32::<LittleEndian>()?;
        let area = reader.read_i32::<LittleEndian>()?;

        // mins/maxs are only used for frustum culling by the renderer
        for _ in 0..6 {
            reader.read_i32::<LittleEndian>()?;
        }

        let first_leaf_surface = reader.read_i32::<LittleEndian>()?;
        let num_leaf_surfaces = reader.read_i32::<LittleEndian>()?;
        let first_leaf_brush = reader.read_i32::<LittleEndian>()?;
        let num_leaf_brushes = reader.read_i32::<LittleEndian>()?;
        ensure!(
            first_leaf_surface >= 0
                && num_leaf_surfaces >= 0
                && first_leaf_brush >= 0
                && num_leaf_brushes >= 0,
            "leaf with negative index range"
        );

        if cluster >= num_clusters {
            num_clusters = cluster + 1;
        }

        leaves.push(Leaf {
            cluster,
            area,
            first_leaf_brush: first_leaf_brush as usize,
            num_leaf_brushes: num_leaf_brushes as usize,
            first_leaf_surface: first_leaf_surface as usize,
            num_leaf_surfaces: num_leaf_surfaces as usize,
        });
    }

    Ok((leaves, num_clusters as usize))
}

fn load_indices(data: &[u8], lump: &Lump, what: &str) -> Result<Vec<i32>, Error> {
    let count = lump.record_count(LEAF_INDEX_SIZE, what)?;
    let mut reader = Cursor::new(lump.slice(data));
    let mut indices = Vec::with_capacity(count);
    for _ in 0..count {
        indices.push(reader.read_i32::<LittleEndian>()?);
    }
    Ok(indices)
}

/// Replaces out-of-range indices with 0, the way the original engine
/// tolerates maps compiled by buggy tools.
fn sanitize_indices(indices: Vec<i32>, limit: usize, what: &str) -> Vec<usize> {
    indices
        .into_iter()
        .enumerate()
        .map(|(i, index)| {
            if index < 0 || index as usize >= limit {
                warn!("[{}] invalid {} {:#010x}", i, what, index);
                0
            } else {
                index as usize
            }
        })
        .collect()
}

fn load_brush_sides(
    data: &[u8],
    lump: &Lump,
    shaders: &[Shader],
    num_planes: usize,
) -> Result<Vec<BrushSide>, Error> {
    let count = lump.record_count(BRUSH_SIDE_SIZE, "brush side")?;

    let mut reader = Cursor::new(lump.slice(data));
    let mut sides = Vec::with_capacity(count);
    for _ in 0..count {
        let plane_id = reader.read_i32::<LittleEndian>()?;
        ensure!(
            plane_id >= 0 && (plane_id as usize) < num_planes,
            "brush side with bad plane index {}",
            plane_id,
        );

        let shader_id = reader.read_i32::<LittleEndian>()?;
        ensure!(
            shader_id >= 0 && (shader_id as usize) < shaders.len(),
            "brush side with bad shader index {}",
            shader_id,
        );

        sides.push(BrushSide {
            plane_id: plane_id as usize,
            shader_id: shader_id as usize,
            surface_flags: shaders[shader_id as usize].surface_flags,
        });
    }

    Ok(sides)
}

fn load_brushes(
    data: &[u8],
    lump: &Lump,
    sides: &[BrushSide],
    shaders: &[Shader],
    planes: &[Plane],
) -> Result<Vec<Brush>, Error> {
    let count = lump.record_count(BRUSH_SIZE, "brush")?;

    let mut reader = Cursor::new(lump.slice(data));
    let mut brushes = Vec::with_capacity(count);
    for _ in 0..count {
        let first_side = reader.read_i32::<LittleEndian>()?;
        let num_sides = reader.read_i32::<LittleEndian>()?;
        ensure!(
            first_side >= 0
                && num_sides >= 0
                && first_side as usize + num_sides as usize <= sides.len(),
            "brush with bad side range [{} + {}]",
            first_side,
            num_sides,
        );
        ensure!(
            num_sides == 0 || num_sides >= 6,
            "brush with fewer than six sides"
        );

        let shader_id = reader.read_i32::<LittleEndian>()?;
        ensure!(
            shader_id >= 0 && (shader_id as usize) < shaders.len(),
            "brush with bad shader index {}",
            shader_id,
        );

        let first_side = first_side as usize;
        let num_sides = num_sides as usize;

        // the first six sides are the axial planes in -X +X -Y +Y -Z +Z
        // order, so the bounds are their distances
        let bounds = if num_sides >= 6 {
            let dist = |i: usize| planes[sides[first_side + i].plane_id].dist();
            Bounds::new(
                Vector3::new(-dist(0), -dist(2), -dist(4)),
                Vector3::new(dist(1), dist(3), dist(5)),
            )
        } else {
            Bounds::new(Vector3::new(0.0, 0.0, 0.0), Vector3::new(0.0, 0.0, 0.0))
        };

        brushes.push(Brush {
            shader_id: shader_id as usize,
            contents: shaders[shader_id as usize].contents,
            bounds,
            first_side,
            num_sides,
            checkcount: 0,
        });
    }

    Ok(brushes)
}

/// Loads the submodel table. Submodels past the world get a synthetic leaf
/// whose index runs are appended to the shared leaf-brush and leaf-surface
/// arrays.
fn load_models(
    data: &[u8],
    lump: &Lump,
    leaf_brushes: &mut Vec<usize>,
    leaf_surfaces: &mut Vec<usize>,
    num_brushes: usize,
    num_surfaces: usize,
) -> Result<Vec<Model>, Error> {
    let count = lump.record_count(MODEL_SIZE, "model")?;
    ensure!(count >= 1, "map with no models");
    ensure!(count <= MAX_SUBMODELS, "MAX_SUBMODELS exceeded");

    let mut reader = Cursor::new(lump.slice(data));
    let mut models = Vec::with_capacity(count);
    for i in 0..count {
        let mins = read_vector3(&mut reader)?;
        let maxs = read_vector3(&mut reader)?;
        let first_surface = reader.read_i32::<LittleEndian>()?;
        let num_surfaces_in = reader.read_i32::<LittleEndian>()?;
        let first_brush = reader.read_i32::<LittleEndian>()?;
        let num_brushes_in = reader.read_i32::<LittleEndian>()?;

        // spread the bounds by a unit to keep boundary contacts inside
        let mut bounds = Bounds::new(mins, maxs);
        bounds.expand(1.0);

        let mut leaf = Leaf {
            cluster: 0,
            area: 0,
            first_leaf_brush: 0,
            num_leaf_brushes: 0,
            first_leaf_surface: 0,
            num_leaf_surfaces: 0,
        };

        // the world is queried through the tree root and needs no leaf
        if i > 0 {
            ensure!(
                first_brush >= 0
                    && num_brushes_in >= 0
                    && first_brush as usize + num_brushes_in as usize <= num_brushes,
                "submodel {} with bad brush range",
                i,
            );
            ensure!(
                first_surface >= 0
                    && num_surfaces_in >= 0
                    && first_surface as usize + num_surfaces_in as usize <= num_surfaces,
                "submodel {} with bad surface range",
                i,
            );

            leaf.first_leaf_brush = leaf_brushes.len();
            leaf.num_leaf_brushes = num_brushes_in as usize;
            for j in 0..num_brushes_in as usize {
                leaf_brushes.push(first_brush as usize + j);
            }

            leaf.first_leaf_surface = leaf_surfaces.len();
            leaf.num_leaf_surfaces = num_surfaces_in as usize;
            for j in 0..num_surfaces_in as usize {
                leaf_surfaces.push(first_surface as usize + j);
            }
        }

        models.push(Model { bounds, leaf });
    }

    Ok(models)
}

fn load_nodes(
    data: &[u8],
    lump: &Lump,
    num_planes: usize,
    num_leaves: usize,
) -> Result<Vec<Node>, Error> {
    let count = lump.record_count(NODE_SIZE, "node")?;
    ensure!(count >= 1, "map with no nodes");

    let mut reader = Cursor::new(lump.slice(data));
    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        let plane_id = reader.read_i32::<LittleEndian>()?;
        ensure!(
            plane_id >= 0 && (plane_id as usize) < num_planes,
            "node with bad plane index {}",
            plane_id,
        );

        let mut children = [NodeChild::Leaf(0); 2];
        for child in children.iter_mut() {
            let c = reader.read_i32::<LittleEndian>()?;
            *child = if c < 0 {
                let leaf = (-1 - c) as usize;
                ensure!(leaf < num_leaves, "node with bad leaf child {}", c);
                NodeChild::Leaf(leaf)
            } else {
                ensure!((c as usize) < count, "node with bad node child {}", c);
                NodeChild::Node(c as usize)
            };
        }

        // culling mins/maxs
        for _ in 0..6 {
            reader.read_i32::<LittleEndian>()?;
        }

        nodes.push(Node {
            plane_id: plane_id as usize,
            children,
        });
    }

    Ok(nodes)
}

fn load_entity_string(data: &[u8], lump: &Lump) -> String {
    let bytes = lump.slice(data);
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).into_owned()
}

fn load_visibility(data: &[u8], lump: &Lump, num_clusters: usize) -> Result<Visibility, Error> {
    if lump.size == 0 {
        // no vis data compiled in; every cluster sees every other
        let cluster_bytes = (num_clusters + 31) & !31;
        return Ok(Visibility {
            vised: false,
            num_clusters,
            cluster_bytes,
            data: vec![255; cluster_bytes],
        });
    }

    ensure!(lump.size >= VIS_HEADER_SIZE, "truncated visibility lump");
    let mut reader = Cursor::new(lump.slice(data));
    let num_clusters = reader.read_i32::<LittleEndian>()?;
    let cluster_bytes = reader.read_i32::<LittleEndian>()?;
    ensure!(
        num_clusters >= 0 && cluster_bytes >= 0,
        "negative visibility header fields"
    );

    Ok(Visibility {
        vised: true,
        num_clusters: num_clusters as usize,
        cluster_bytes: cluster_bytes as usize,
        data: lump.slice(data)[VIS_HEADER_SIZE..].to_vec(),
    })
}

fn load_draw_verts(data: &[u8], lump: &Lump) -> Result<Vec<Vector3<f32>>, Error> {
    let count = lump.record_count(VERTEX_SIZE, "draw vertex")?;
    let slice = lump.slice(data);
    let mut verts = Vec::with_capacity(count);
    for i in 0..count {
        let mut reader = Cursor::new(&slice[i * VERTEX_SIZE..]);
        verts.push(read_vector3(&mut reader)?);
    }
    Ok(verts)
}

/// Scans the draw surfaces and builds facet collision for each patch;
/// planar and other surface kinds leave a hole so leaf-surface indices stay
/// aligned with the draw surface array.
fn load_patches(
    data: &[u8],
    surf_lump: &Lump,
    vert_lump: &Lump,
    shaders: &[Shader],
    settings: Settings,
) -> Result<Vec<Option<Patch>>, Error> {
    let count = surf_lump.record_count(SURFACE_SIZE, "surface")?;
    let verts = load_draw_verts(data, vert_lump)?;

    let mut reader = Cursor::new(surf_lump.slice(data));
    let mut surfaces = Vec::with_capacity(count);
    for _ in 0..count {
        let shader_id = reader.read_i32::<LittleEndian>()?;
        let _fog_id = reader.read_i32::<LittleEndian>()?;
        let surface_type = reader.read_i32::<LittleEndian>()?;
        let first_vert = reader.read_i32::<LittleEndian>()?;
        let _num_verts = reader.read_i32::<LittleEndian>()?;

        // indexes, lightmap placement, lod bounds
        for _ in 0..7 {
            reader.read_i32::<LittleEndian>()?;
        }
        for _ in 0..12 {
            reader.read_f32::<LittleEndian>()?;
        }

        let patch_width = reader.read_i32::<LittleEndian>()?;
        let patch_height = reader.read_i32::<LittleEndian>()?;

        if surface_type != SURFACE_TYPE_PATCH || settings.no_curves {
            surfaces.push(None);
            continue;
        }

        ensure!(
            shader_id >= 0 && (shader_id as usize) < shaders.len(),
            "patch with bad shader index {}",
            shader_id,
        );
        ensure!(
            patch_width >= 0 && patch_height >= 0,
            "patch with negative dimensions"
        );

        let width = patch_width as usize;
        let height = patch_height as usize;
        let point_count = width * height;
        ensure!(point_count <= MAX_PATCH_VERTS, "MAX_PATCH_VERTS exceeded");
        ensure!(
            first_vert >= 0 && first_vert as usize + point_count <= verts.len(),
            "patch with bad vertex range [{} + {}]",
            first_vert,
            point_count,
        );

        let points = &verts[first_vert as usize..first_vert as usize + point_count];
        let collide = generate_patch_collide(width, height, points)?;

        let shader = &shaders[shader_id as usize];
        surfaces.push(Some(Patch {
            surface_flags: shader.surface_flags,
            contents: shader.contents,
            collide,
            checkcount: 0,
        }));
    }

    Ok(surfaces)
}

/// Builds a complete clip map from a BSP file buffer.
pub fn load(data: &[u8], settings: Settings) -> Result<ClipMap, Error> {
    ensure!(data.len() >= HEADER_SIZE, "truncated header");

    let mut reader = Cursor::new(data);
    let _ident = reader.read_i32::<LittleEndian>()?;
    let version = reader.read_i32::<LittleEndian>()?;
    ensure!(
        version == VERSION,
        "wrong version number ({} should be {})",
        version,
        VERSION,
    );

    let mut lumps = Vec::with_capacity(LUMP_COUNT);
    for l in 0..LUMP_COUNT {
        let offset = reader.read_i32::<LittleEndian>()?;
        let size = reader.read_i32::<LittleEndian>()?;
        debug!(
            "{: <14} offset = {:#010x} | size = {:#010x}",
            format!("{:?}:", LumpId::from_usize(l).unwrap()),
            offset,
            size,
        );
        lumps.push(Lump::from_i32s(offset, size, data.len())?);
    }

    let checksum = check::block_checksum(data);

    let num_file_surfaces =
        lumps[LumpId::Surfaces as usize].record_count(SURFACE_SIZE, "surface")?;

    let shaders = load_shaders(data, &lumps[LumpId::Shaders as usize])?;
    let (leaves, num_clusters) = load_leaves(data, &lumps[LumpId::Leaves as usize])?;
    let raw_leaf_brushes = load_indices(data, &lumps[LumpId::LeafBrushes as usize], "leaf brush")?;
    let raw_leaf_surfaces =
        load_indices(data, &lumps[LumpId::LeafSurfaces as usize], "leaf surface")?;
    let planes = load_planes(data, &lumps[LumpId::Planes as usize])?;
    let brush_sides = load_brush_sides(
        data,
        &lumps[LumpId::BrushSides as usize],
        &shaders,
        planes.len(),
    )?;
    let brushes = load_brushes(
        data,
        &lumps[LumpId::Brushes as usize],
        &brush_sides,
        &shaders,
        &planes,
    )?;

    let mut leaf_brushes = sanitize_indices(raw_leaf_brushes, brushes.len(), "leaf brush");
    let mut leaf_surfaces =
        sanitize_indices(raw_leaf_surfaces, num_file_surfaces.max(1), "leaf surface");

    for (i, leaf) in leaves.iter().enumerate() {
        ensure!(
            leaf.first_leaf_brush + leaf.num_leaf_brushes <= leaf_brushes.len()
                && leaf.first_leaf_surface + leaf.num_leaf_surfaces <= leaf_surfaces.len(),
            "leaf {} with bad index range",
            i,
        );
    }

    let models = load_models(
        data,
        &lumps[LumpId::Models as usize],
        &mut leaf_brushes,
        &mut leaf_surfaces,
        brushes.len(),
        num_file_surfaces,
    )?;
    let nodes = load_nodes(
        data,
        &lumps[LumpId::Nodes as usize],
        planes.len(),
        leaves.len(),
    )?;
    let entity_string = load_entity_string(data, &lumps[LumpId::Entities as usize]);
    let visibility = load_visibility(data, &lumps[LumpId::Visibility as usize], num_clusters)?;
    let surfaces = load_patches(
        data,
        &lumps[LumpId::Surfaces as usize],
        &lumps[LumpId::DrawVerts as usize],
        &shaders,
        settings,
    )?;

    let mut cm = ClipMap::new();
    cm.shaders = shaders;
    cm.planes = planes;
    cm.nodes = nodes;
    cm.leaves = leaves;
    cm.leaf_brushes = leaf_brushes;
    cm.leaf_surfaces = leaf_surfaces;
    cm.models = models;
    cm.brushes = brushes;
    cm.brush_sides = brush_sides;
    cm.surfaces = surfaces;
    cm.entity_string = entity_string;
    cm.visibility = visibility;
    cm.checksum = checksum;
    cm.init_box_hull();

    Ok(cm)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use byteorder::WriteBytesExt;

    use std::collections::HashMap;
    use std::io::Write;

    use crate::bsp::{Contents, MapSource};

    struct TestSource {
        maps: HashMap<String, Vec<u8>>,
    }

    impl MapSource for TestSource {
        fn open(&self, name: &str) -> Result<Vec<u8>, Error> {
            match self.maps.get(name) {
                Some(data) => Ok(data.clone()),
                None => bail!("no such map: {}", name),
            }
        }
    }

    fn put_i32(buf: &mut Vec<u8>, v: i32) {
        buf.write_i32::<LittleEndian>(v).unwrap();
    }

    fn put_f32(buf: &mut Vec<u8>, v: f32) {
        buf.write_f32::<LittleEndian>(v).unwrap();
    }

    /// Serializes a map holding a single solid cube brush spanning
    /// -1..1 on every axis, split by the x = 0 plane.
    pub(crate) fn build_cube_map() -> Vec<u8> {
        let mut lumps: Vec<Vec<u8>> = vec![Vec::new(); LUMP_COUNT];

        // entities
        lumps[LumpId::Entities as usize].extend_from_slice(b"{\n\"classname\" \"worldspawn\"\n}\n\0");

        // one solid shader
        {
            let l = &mut lumps[LumpId::Shaders as usize];
            let mut name = [0u8; SHADER_NAME_MAX];
            name[..12].copy_from_slice(b"textures/box");
            l.write_all(&name).unwrap();
            put_i32(l, 0);
            put_i32(l, Contents::SOLID.bits());
        }

        // six cube face planes in brush-side order, then the split plane
        {
            let l = &mut lumps[LumpId::Planes as usize];
            let planes: [([f32; 3], f32); 7] = [
                ([-1.0, 0.0, 0.0], 1.0),
                ([1.0, 0.0, 0.0], 1.0),
                ([0.0, -1.0, 0.0], 1.0),
                ([0.0, 1.0, 0.0], 1.0),
                ([0.0, 0.0, -1.0], 1.0),
                ([0.0, 0.0, 1.0], 1.0),
                ([1.0, 0.0, 0.0], 0.0),
            ];
            for (normal, dist) in planes.iter() {
                for c in normal.iter() {
                    put_f32(l, *c);
                }
                put_f32(l, *dist);
            }
        }

        // a single node on x = 0, both children leaves
        {
            let l = &mut lumps[LumpId::Nodes as usize];
            put_i32(l, 6);
            put_i32(l, -1); // leaf 0
            put_i32(l, -2); // leaf 1
            for _ in 0..6 {
                put_i32(l, 0);
            }
        }

        // two leaves, each referencing the one brush
        {
            let l = &mut lumps[LumpId::Leaves as usize];
            for first_brush in &[0, 1] {
                put_i32(l, 0); // cluster
                put_i32(l, 0); // area
                for _ in 0..6 {
                    put_i32(l, 0);
                }
                put_i32(l, 0); // first leaf surface
                put_i32(l, 0); // num leaf surfaces
                put_i32(l, *first_brush);
                put_i32(l, 1);
            }
        }

        // leaf brushes: both entries point at brush 0
        {
            let l = &mut lumps[LumpId::LeafBrushes as usize];
            put_i32(l, 0);
            put_i32(l, 0);
        }

        // world model
        {
            let l = &mut lumps[LumpId::Models as usize];
            for c in &[-1.0f32, -1.0, -1.0, 1.0, 1.0, 1.0] {
                put_f32(l, *c);
            }
            for v in &[0, 0, 0, 1] {
                put_i32(l, *v);
            }
        }

        // the cube brush
        {
            let l = &mut lumps[LumpId::Brushes as usize];
            put_i32(l, 0); // first side
            put_i32(l, 6); // num sides
            put_i32(l, 0); // shader
        }

        {
            let l = &mut lumps[LumpId::BrushSides as usize];
            for plane in 0..6 {
                put_i32(l, plane);
                put_i32(l, 0);
            }
        }

        // assemble header + lumps
        let mut data = Vec::new();
        data.extend_from_slice(b"IBSP");
        put_i32(&mut data, VERSION);

        let mut offset = HEADER_SIZE;
        for lump in lumps.iter() {
            put_i32(&mut data, offset as i32);
            put_i32(&mut data, lump.len() as i32);
            offset += lump.len();
        }
        for lump in lumps.iter() {
            data.extend_from_slice(lump);
        }

        data
    }

    #[test]
    fn test_load_cube_map() {
        let data = build_cube_map();
        let cm = load(&data, Settings::default()).unwrap();

        assert_eq!(cm.nodes.len(), 1);
        assert_eq!(cm.leaves.len(), 2);
        assert_eq!(cm.models.len(), 1);
        assert_eq!(cm.brushes.len(), 1 + 1); // cube + box hull
        assert_eq!(cm.planes.len(), 7 + 12); // file planes + box hull

        let brush = &cm.brushes[0];
        assert_eq!(brush.contents, Contents::SOLID);
        assert_eq!(brush.bounds.mins, Vector3::new(-1.0, -1.0, -1.0));
        assert_eq!(brush.bounds.maxs, Vector3::new(1.0, 1.0, 1.0));

        assert!(cm.entity_string.contains("worldspawn"));
        assert!(!cm.visibility.vised);
    }

    #[test]
    fn test_load_map_idempotent() {
        let data = build_cube_map();
        let expected = check::block_checksum(&data);

        let mut maps = HashMap::new();
        maps.insert("maps/cube.bsp".to_owned(), data);
        let source = TestSource { maps };

        let mut cm = ClipMap::new();
        let checksum = cm.load_map("maps/cube.bsp", false, &source).unwrap();
        assert_eq!(checksum, expected);
        assert!(cm.is_loaded());

        // reloading for a client is a no-op returning the cached checksum
        let again = cm.load_map("maps/cube.bsp", true, &source).unwrap();
        assert_eq!(again, expected);

        cm.clear_map();
        assert!(!cm.is_loaded());
    }

    #[test]
    fn test_load_rejects_wrong_version() {
        let mut data = build_cube_map();
        data[4] = 29;
        assert!(load(&data, Settings::default()).is_err());
    }

    #[test]
    fn test_load_rejects_overrunning_lump() {
        let mut data = build_cube_map();
        // point the shader lump past the end of the file
        let lump_ofs = 8 + (LumpId::Shaders as usize) * 8 + 4;
        let huge = (data.len() as i32 * 2).to_le_bytes();
        data[lump_ofs..lump_ofs + 4].copy_from_slice(&huge);
        assert!(load(&data, Settings::default()).is_err());
    }

    #[test]
    fn test_load_rejects_truncated_header() {
        let data = build_cube_map();
        assert!(load(&data[..40], Settings::default()).is_err());
    }

    #[test]
    fn test_invalid_leaf_brush_is_sanitized() {
        let cleaned = sanitize_indices(vec![0, 7, -3], 2, "leaf brush");
        assert_eq!(cleaned, vec![0, 0, 0]);
    }
}

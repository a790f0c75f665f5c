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

//! Swept-AABB collision detection against a static world of BSP brushes and
//! curved patch surfaces.
//!
//! The world is loaded from a version-46 BSP byte buffer into a [`ClipMap`].
//! Queries sweep an axis-aligned box (or point, or capsule) from a start to
//! an end position and report the earliest fraction of the sweep at which
//! solid geometry is struck, along with the contact plane and the surface
//! and content flags of whatever was hit:
//!
//! ```no_run
//! # use cgmath::Vector3;
//! # use clipmap::{ClipMap, Contents, Handle};
//! # let mut cm = ClipMap::new();
//! let trace = cm.box_trace(
//!     Vector3::new(0.0, 0.0, 64.0),
//!     Vector3::new(0.0, 0.0, -512.0),
//!     Vector3::new(-15.0, -15.0, -24.0),
//!     Vector3::new(15.0, 15.0, 32.0),
//!     Handle::world(),
//!     Contents::SOLID,
//!     false,
//! );
//! if trace.fraction < 1.0 {
//!     println!("stood on {:?}", trace.plane.normal());
//! }
//! ```
//!
//! Sweeps against the world walk the BSP with planes expanded by the box's
//! support point (a Minkowski sum), so the box trace reduces to a point
//! trace against slightly fatter geometry. Curved patches are converted at
//! load time into sets of convex facets bounded by bevel planes and swept
//! with the same plane-clipping arithmetic as brushes.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

pub mod bsp;
pub mod math;
pub mod patch;
pub mod trace;

pub use crate::bsp::{
    ClipMap, Contents, Handle, MapSource, Settings, Shader, SurfaceFlags, TraceStats,
};
pub use crate::math::{Angles, Bounds, Plane};
pub use crate::trace::Trace;

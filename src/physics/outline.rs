//! Contour extraction - solid tile regions to closed polygons
//!
//! Every solid cell contributes the unit edges it shares with non-solid
//! cells, oriented so the solid side is on the left. Chaining those edges
//! yields counter-clockwise outer loops and clockwise holes; collinear
//! vertices are then dropped.

use crate::simulation::{MaterialRegistry, PhysicsClass};
use crate::world::{Chunk, CHUNK_SIZE};
use glam::{IVec2, Vec2};
use std::collections::HashMap;

/// Closed polygon; the last point connects back to the first
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Polygon {
    pub points: Vec<Vec2>,
}

impl Polygon {
    pub fn new(points: Vec<Vec2>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Shoelace area; positive for counter-clockwise loops
    pub fn signed_area(&self) -> f32 {
        let n = self.points.len();
        (0..n)
            .map(|i| {
                let a = self.points[i];
                let b = self.points[(i + 1) % n];
                a.x * b.y - b.x * a.y
            })
            .sum::<f32>()
            * 0.5
    }

    pub fn bounds(&self) -> Option<(Vec2, Vec2)> {
        let first = *self.points.first()?;
        Some(
            self.points
                .iter()
                .fold((first, first), |(min, max), p| (min.min(*p), max.max(*p))),
        )
    }

    pub fn translated(&self, offset: Vec2) -> Self {
        Self {
            points: self.points.iter().map(|p| *p + offset).collect(),
        }
    }
}

/// Per-pixel collision bitmap, row 0 at the bottom
#[derive(Clone, Debug, PartialEq)]
pub struct CollisionMask {
    pub width: usize,
    pub height: usize,
    bits: Vec<bool>,
}

impl CollisionMask {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            bits: vec![false; width * height],
        }
    }

    /// Mask from an image's alpha channel; image row 0 is the top
    pub fn from_image(image: &image::RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        let mut mask = Self::new(width as usize, height as usize);
        for (x, y, pixel) in image.enumerate_pixels() {
            if pixel.0[3] > 0 {
                mask.set(x as usize, (height - 1 - y) as usize, true);
            }
        }
        mask
    }

    pub fn get(&self, x: usize, y: usize) -> bool {
        x < self.width && y < self.height && self.bits[y * self.width + x]
    }

    pub fn set(&mut self, x: usize, y: usize, solid: bool) {
        if x < self.width && y < self.height {
            self.bits[y * self.width + x] = solid;
        }
    }

    pub fn count(&self) -> usize {
        self.bits.iter().filter(|bit| **bit).count()
    }

    pub fn outline(&self) -> Vec<Polygon> {
        trace_outline(self.width, self.height, |x, y| self.get(x, y))
    }
}

/// Outline of a chunk's Solid tiles in chunk-local tile units
pub fn chunk_outline(chunk: &Chunk, registry: &MaterialRegistry) -> Vec<Polygon> {
    trace_outline(CHUNK_SIZE, CHUNK_SIZE, |x, y| {
        registry.physics_class(chunk.material(x, y)) == PhysicsClass::Solid
    })
}

/// Direction of a unit edge
fn direction(from: IVec2, to: IVec2) -> IVec2 {
    to - from
}

/// Left turn first, then straight, then right
fn turn_rank(incoming: IVec2, outgoing: IVec2) -> i32 {
    let cross = incoming.x * outgoing.y - incoming.y * outgoing.x;
    if cross > 0 {
        0
    } else if cross == 0 {
        1
    } else {
        2
    }
}

/// Closed loops around the cells for which `solid(x, y)` holds
pub fn trace_outline(width: usize, height: usize, solid: impl Fn(usize, usize) -> bool) -> Vec<Polygon> {
    let is_solid = |x: i32, y: i32| {
        x >= 0 && y >= 0 && (x as usize) < width && (y as usize) < height && solid(x as usize, y as usize)
    };

    let mut edges: Vec<(IVec2, IVec2)> = Vec::new();
    for y in 0..height as i32 {
        for x in 0..width as i32 {
            if !is_solid(x, y) {
                continue;
            }
            if !is_solid(x, y - 1) {
                edges.push((IVec2::new(x, y), IVec2::new(x + 1, y)));
            }
            if !is_solid(x + 1, y) {
                edges.push((IVec2::new(x + 1, y), IVec2::new(x + 1, y + 1)));
            }
            if !is_solid(x, y + 1) {
                edges.push((IVec2::new(x + 1, y + 1), IVec2::new(x, y + 1)));
            }
            if !is_solid(x - 1, y) {
                edges.push((IVec2::new(x, y + 1), IVec2::new(x, y)));
            }
        }
    }

    let mut outgoing: HashMap<IVec2, Vec<usize>> = HashMap::new();
    for (index, (from, _)) in edges.iter().enumerate() {
        outgoing.entry(*from).or_default().push(index);
    }

    let mut used = vec![false; edges.len()];
    let mut polygons = Vec::new();

    for start in 0..edges.len() {
        if used[start] {
            continue;
        }
        used[start] = true;
        let origin = edges[start].0;
        let mut points = vec![origin];
        let mut current = start;

        loop {
            let (from, to) = edges[current];
            if to == origin {
                break;
            }
            points.push(to);
            let incoming = direction(from, to);

            let next = outgoing.get(&to).and_then(|candidates| {
                candidates
                    .iter()
                    .copied()
                    .filter(|&candidate| !used[candidate])
                    .min_by_key(|&candidate| {
                        let (a, b) = edges[candidate];
                        turn_rank(incoming, direction(a, b))
                    })
            });
            match next {
                Some(next) => {
                    used[next] = true;
                    current = next;
                }
                None => {
                    debug_assert!(false, "open outline at {:?}", to);
                    break;
                }
            }
        }

        polygons.push(Polygon::new(simplify(&points)));
    }

    polygons
}

/// Drop vertices lying on a straight line between their neighbors
fn simplify(points: &[IVec2]) -> Vec<Vec2> {
    let n = points.len();
    (0..n)
        .filter(|&i| {
            let prev = points[(i + n - 1) % n];
            let next = points[(i + 1) % n];
            let cur = points[i];
            direction(prev, cur).signum() != direction(cur, next).signum()
        })
        .map(|i| points[i].as_vec2())
        .collect()
}

//! Voxel map collaborator.
//!
//! Coordinates follow the usual voxel-shooter convention: `x` and `y` span
//! the ground plane and `z` grows downwards, so `z = 0` is the sky and the
//! bottom layer is indestructible water.

use std::collections::{BTreeMap, HashMap};

/// What the protocol needs from a map implementation.
pub trait VoxelMap: Send {
    /// Height of the topmost solid voxel in the column at `(x, y)`.
    fn get_z(&self, x: i32, y: i32) -> i32;

    /// Whether the voxel at `(x, y, z)` may be built or destroyed.
    fn can_build(&self, x: i32, y: i32, z: i32) -> bool;

    /// Sets or clears one voxel. `color` is `0xAARRGGBB`. Returns false if
    /// the coordinates are outside the map.
    fn set_point(&mut self, x: i32, y: i32, z: i32, solid: bool, color: u32) -> bool;

    /// Serialized voxel volume as streamed to clients.
    fn get_bytes(&self) -> Vec<u8>;

    fn width(&self) -> i32;
    fn length(&self) -> i32;
    fn depth(&self) -> i32;
}

/// A flat world: every column is solid from `ground_z` down. Edits are kept
/// sparsely per column.
#[derive(Debug, Clone)]
pub struct FlatMap {
    width: i32,
    length: i32,
    depth: i32,
    ground_z: i32,
    ground_color: u32,
    columns: HashMap<(i32, i32), BTreeMap<i32, Option<u32>>>,
}

impl FlatMap {
    pub const DEFAULT_GROUND_COLOR: u32 = 0x7F67_4028;

    pub fn new(width: i32, length: i32, depth: i32, ground_z: i32) -> Self {
        Self {
            width,
            length,
            depth,
            ground_z: ground_z.clamp(0, depth - 1),
            ground_color: Self::DEFAULT_GROUND_COLOR,
            columns: HashMap::new(),
        }
    }

    fn in_bounds(&self, x: i32, y: i32, z: i32) -> bool {
        (0..self.width).contains(&x) && (0..self.length).contains(&y) && (0..self.depth).contains(&z)
    }

    /// Colour of the voxel, or `None` if it is air or outside the map.
    pub fn voxel(&self, x: i32, y: i32, z: i32) -> Option<u32> {
        if !self.in_bounds(x, y, z) {
            return None;
        }
        if let Some(edit) = self.columns.get(&(x, y)).and_then(|column| column.get(&z)) {
            return *edit;
        }
        if z >= self.ground_z {
            Some(self.ground_color)
        } else {
            None
        }
    }

    pub fn is_solid(&self, x: i32, y: i32, z: i32) -> bool {
        self.voxel(x, y, z).is_some()
    }

    /// Solid spans of one column as `(top, bottom, colour)` triples. Colour
    /// is taken from the top voxel of each span.
    fn spans(&self, x: i32, y: i32) -> Vec<(i32, i32, u32)> {
        if !self.columns.contains_key(&(x, y)) {
            return vec![(self.ground_z, self.depth - 1, self.ground_color)];
        }

        let mut spans = Vec::new();
        let mut current: Option<(i32, u32)> = None;
        for z in 0..self.depth {
            match (self.voxel(x, y, z), current) {
                (Some(color), None) => current = Some((z, color)),
                (None, Some((top, color))) => {
                    spans.push((top, z - 1, color));
                    current = None;
                }
                _ => {}
            }
        }
        if let Some((top, color)) = current {
            spans.push((top, self.depth - 1, color));
        }
        spans
    }
}

impl Default for FlatMap {
    fn default() -> Self {
        Self::new(512, 512, 64, 32)
    }
}

impl VoxelMap for FlatMap {
    fn get_z(&self, x: i32, y: i32) -> i32 {
        if !self.columns.contains_key(&(x, y)) {
            return self.ground_z;
        }
        (0..self.depth)
            .find(|&z| self.is_solid(x, y, z))
            .unwrap_or(self.depth - 1)
    }

    fn can_build(&self, x: i32, y: i32, z: i32) -> bool {
        self.in_bounds(x, y, z) && z < self.depth - 1
    }

    fn set_point(&mut self, x: i32, y: i32, z: i32, solid: bool, color: u32) -> bool {
        if !self.in_bounds(x, y, z) {
            return false;
        }
        let value = if solid { Some(color) } else { None };
        self.columns.entry((x, y)).or_default().insert(z, value);
        true
    }

    /// Header `[width u16][length u16][depth u8]`, then for every column in
    /// row-major order `[span count u8]` followed by
    /// `[top u8][bottom u8][colour u32]` per span. Integers are little-endian.
    fn get_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(5 + (self.width * self.length) as usize * 7);
        bytes.extend_from_slice(&(self.width as u16).to_le_bytes());
        bytes.extend_from_slice(&(self.length as u16).to_le_bytes());
        bytes.push(self.depth as u8);

        for y in 0..self.length {
            for x in 0..self.width {
                let spans = self.spans(x, y);
                bytes.push(spans.len() as u8);
                for (top, bottom, color) in spans {
                    bytes.push(top as u8);
                    bytes.push(bottom as u8);
                    bytes.extend_from_slice(&color.to_le_bytes());
                }
            }
        }
        bytes
    }

    fn width(&self) -> i32 {
        self.width
    }

    fn length(&self) -> i32 {
        self.length
    }

    fn depth(&self) -> i32 {
        self.depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_ground() {
        let map = FlatMap::new(16, 16, 64, 40);
        assert_eq!(map.get_z(3, 4), 40);
        assert!(map.is_solid(3, 4, 40));
        assert!(!map.is_solid(3, 4, 39));
        assert!(!map.is_solid(-1, 4, 50));
    }

    #[test]
    fn test_build_and_destroy_changes_height() {
        let mut map = FlatMap::new(16, 16, 64, 40);
        assert!(map.set_point(1, 1, 39, true, 0x7F00_FF00));
        assert_eq!(map.get_z(1, 1), 39);
        assert_eq!(map.voxel(1, 1, 39), Some(0x7F00_FF00));

        assert!(map.set_point(1, 1, 39, false, 0));
        assert!(map.set_point(1, 1, 40, false, 0));
        assert_eq!(map.get_z(1, 1), 41);
    }

    #[test]
    fn test_can_build_bounds() {
        let map = FlatMap::new(16, 16, 64, 40);
        assert!(map.can_build(0, 0, 0));
        assert!(map.can_build(15, 15, 62));
        assert!(!map.can_build(15, 15, 63), "water layer");
        assert!(!map.can_build(16, 0, 10));
        assert!(!map.can_build(0, -1, 10));
    }

    #[test]
    fn test_set_point_out_of_bounds() {
        let mut map = FlatMap::new(4, 4, 8, 4);
        assert!(!map.set_point(4, 0, 0, true, 0));
        assert!(!map.set_point(0, 0, 8, true, 0));
    }

    #[test]
    fn test_serialized_layout() {
        let mut map = FlatMap::new(2, 1, 8, 4);
        map.set_point(1, 0, 2, true, 0x7F11_2233);

        let bytes = map.get_bytes();
        assert_eq!(&bytes[..5], &[2, 0, 1, 0, 8]);
        // Column (0, 0): one span 4..=7.
        assert_eq!(bytes[5], 1);
        assert_eq!(&bytes[6..8], &[4, 7]);
        // Column (1, 0): floating block plus ground.
        let second = 5 + 1 + 6;
        assert_eq!(bytes[second], 2);
        assert_eq!(&bytes[second + 1..second + 3], &[2, 2]);
        assert_eq!(
            &bytes[second + 3..second + 7],
            &0x7F11_2233u32.to_le_bytes()
        );
        assert_eq!(bytes.len(), second + 1 + 2 * 6);
    }
}

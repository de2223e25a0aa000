//! Small vector and colour types used on the wire and in the simulation.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Mul, Sub};

/// Any coordinate beyond this magnitude is treated as garbage input.
pub const MAX_COORDINATE: f32 = 100_000.0;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn dot(&self, other: &Vec3) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn sq_length(&self) -> f32 {
        self.dot(self)
    }

    pub fn length(&self) -> f32 {
        self.sq_length().sqrt()
    }

    pub fn sq_distance(&self, other: &Vec3) -> f32 {
        (*self - *other).sq_length()
    }

    pub fn distance(&self, other: &Vec3) -> f32 {
        self.sq_distance(other).sqrt()
    }

    /// Returns the unit vector in the same direction, or zero for a zero vector.
    pub fn normalized(&self) -> Vec3 {
        let length = self.length();
        if length > 0.0 {
            *self * (1.0 / length)
        } else {
            Vec3::ZERO
        }
    }

    /// Component-wise comparison with an absolute tolerance.
    pub fn approx_eq(&self, other: &Vec3, tolerance: f32) -> bool {
        (self.x - other.x).abs() <= tolerance
            && (self.y - other.y).abs() <= tolerance
            && (self.z - other.z).abs() <= tolerance
    }

    pub fn components(&self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }

    pub fn is_bad(&self) -> bool {
        bad_float(&self.components())
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Vec3;

    fn mul(self, rhs: f32) -> Vec3 {
        Vec3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl From<(f32, f32, f32)> for Vec3 {
    fn from((x, y, z): (f32, f32, f32)) -> Self {
        Vec3::new(x, y, z)
    }
}

/// True if any value is NaN, infinite or absurdly large.
pub fn bad_float(values: &[f32]) -> bool {
    values
        .iter()
        .any(|v| !v.is_finite() || v.abs() > MAX_COORDINATE)
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Packs the colour into the 0xAARRGGBB layout used by voxel storage.
    pub fn to_voxel(&self, alpha: u8) -> u32 {
        (alpha as u32) << 24 | (self.r as u32) << 16 | (self.g as u32) << 8 | self.b as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_vector_arithmetic() {
        let a = Vec3::new(1.0, 2.0, 3.0);
        let b = Vec3::new(4.0, 6.0, 3.0);

        assert_eq!(b - a, Vec3::new(3.0, 4.0, 0.0));
        assert_eq!(a + b, Vec3::new(5.0, 8.0, 6.0));
        assert_approx_eq!(a.distance(&b), 5.0);
        assert_approx_eq!(a.sq_distance(&b), 25.0);
    }

    #[test]
    fn test_normalize() {
        let v = Vec3::new(0.0, 3.0, 4.0).normalized();
        assert_approx_eq!(v.length(), 1.0);
        assert_approx_eq!(v.y, 0.6);
        assert_eq!(Vec3::ZERO.normalized(), Vec3::ZERO);
    }

    #[test]
    fn test_approx_eq_tolerance() {
        let a = Vec3::new(1.0, 0.0, 0.0);
        assert!(a.approx_eq(&Vec3::new(0.5, 0.4, -0.3), 0.5));
        assert!(!a.approx_eq(&Vec3::new(-1.0, 0.0, 0.0), 1.0));
    }

    #[test]
    fn test_bad_float_detection() {
        assert!(!bad_float(&[0.0, -12.5, 511.0]));
        assert!(bad_float(&[f32::NAN]));
        assert!(bad_float(&[1.0, f32::INFINITY]));
        assert!(bad_float(&[MAX_COORDINATE * 2.0]));
        assert!(Vec3::new(f32::NAN, 0.0, 0.0).is_bad());
    }

    #[test]
    fn test_color_voxel_packing() {
        let c = Color::new(0x11, 0x22, 0x33);
        assert_eq!(c.to_voxel(0x7F), 0x7F11_2233);
    }
}

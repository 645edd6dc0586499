use auto_ops::{impl_op_ex, impl_op_ex_commutative};
use nalgebra::{Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::Float;

/// A three-vector of floats (a position or a three-momentum).
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3(pub [Float; 3]);

impl From<[Float; 3]> for Vec3 {
    fn from(value: [Float; 3]) -> Self {
        Self(value)
    }
}
impl From<Vector3<Float>> for Vec3 {
    fn from(value: Vector3<Float>) -> Self {
        Self([value.x, value.y, value.z])
    }
}

impl Vec3 {
    pub fn new(x: Float, y: Float, z: Float) -> Self {
        Self([x, y, z])
    }
    pub fn x(&self) -> Float {
        self.0[0]
    }
    pub fn y(&self) -> Float {
        self.0[1]
    }
    pub fn z(&self) -> Float {
        self.0[2]
    }
    pub fn dot(&self, other: &Self) -> Float {
        self.x() * other.x() + self.y() * other.y() + self.z() * other.z()
    }
    pub fn cross(&self, other: &Self) -> Self {
        Self([
            self.y() * other.z() - self.z() * other.y(),
            self.z() * other.x() - self.x() * other.z(),
            self.x() * other.y() - self.y() * other.x(),
        ])
    }
    pub fn mag2(&self) -> Float {
        self.dot(self)
    }
    pub fn mag(&self) -> Float {
        self.mag2().sqrt()
    }
    /// The transverse (xy) component.
    pub fn perp(&self) -> Float {
        (self.x() * self.x() + self.y() * self.y()).sqrt()
    }
    pub fn phi(&self) -> Float {
        self.y().atan2(self.x())
    }
    pub fn costheta(&self) -> Float {
        self.z() / self.mag()
    }
    pub fn unit(&self) -> Self {
        let m = self.mag();
        Self([self.x() / m, self.y() / m, self.z() / m])
    }
    /// Promote to a four-vector with the energy computed from a mass.
    pub fn with_mass(&self, mass: Float) -> Vec4 {
        Vec4([
            self.x(),
            self.y(),
            self.z(),
            (mass * mass + self.mag2()).sqrt(),
        ])
    }
    /// Promote to a four-vector with an explicit energy.
    pub fn with_energy(&self, energy: Float) -> Vec4 {
        Vec4([self.x(), self.y(), self.z(), energy])
    }
    pub fn to_vector3(self) -> Vector3<Float> {
        Vector3::new(self.x(), self.y(), self.z())
    }
}

impl_op_ex!(+ |a: &Vec3, b: &Vec3| -> Vec3 { Vec3([a.x() + b.x(), a.y() + b.y(), a.z() + b.z()]) });
impl_op_ex!(-|a: &Vec3, b: &Vec3| -> Vec3 { Vec3([a.x() - b.x(), a.y() - b.y(), a.z() - b.z()]) });
impl_op_ex!(-|a: &Vec3| -> Vec3 { Vec3([-a.x(), -a.y(), -a.z()]) });
impl_op_ex_commutative!(*|a: &Vec3, b: &Float| -> Vec3 {
    Vec3([a.x() * b, a.y() * b, a.z() * b])
});
impl_op_ex!(/ |a: &Vec3, b: &Float| -> Vec3 { Vec3([a.x() / b, a.y() / b, a.z() / b]) });

/// A four-momentum `(px, py, pz, E)`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec4(pub [Float; 4]);

impl From<[Float; 4]> for Vec4 {
    fn from(value: [Float; 4]) -> Self {
        Self(value)
    }
}
impl From<Vector4<Float>> for Vec4 {
    fn from(value: Vector4<Float>) -> Self {
        Self([value.x, value.y, value.z, value.w])
    }
}

impl Vec4 {
    pub fn new(px: Float, py: Float, pz: Float, e: Float) -> Self {
        Self([px, py, pz, e])
    }
    /// Build from a three-momentum and a mass.
    pub fn from_momentum(p: [Float; 3], mass: Float) -> Self {
        Vec3(p).with_mass(mass)
    }
    pub fn px(&self) -> Float {
        self.0[0]
    }
    pub fn py(&self) -> Float {
        self.0[1]
    }
    pub fn pz(&self) -> Float {
        self.0[2]
    }
    pub fn e(&self) -> Float {
        self.0[3]
    }
    pub fn vec3(&self) -> Vec3 {
        Vec3([self.px(), self.py(), self.pz()])
    }
    /// The invariant mass squared, `E^2 - |p|^2`.
    pub fn mag2(&self) -> Float {
        self.e() * self.e() - self.vec3().mag2()
    }
    /// The invariant mass (zero for spacelike arguments).
    pub fn mag(&self) -> Float {
        self.mag2().max(0.0).sqrt()
    }
    pub fn perp(&self) -> Float {
        self.vec3().perp()
    }
    pub fn to_vector4(self) -> Vector4<Float> {
        Vector4::new(self.px(), self.py(), self.pz(), self.e())
    }
}

impl_op_ex!(+ |a: &Vec4, b: &Vec4| -> Vec4 {
    Vec4([a.px() + b.px(), a.py() + b.py(), a.pz() + b.pz(), a.e() + b.e()])
});
impl_op_ex!(-|a: &Vec4, b: &Vec4| -> Vec4 {
    Vec4([a.px() - b.px(), a.py() - b.py(), a.pz() - b.pz(), a.e() - b.e()])
});
impl_op_ex_commutative!(*|a: &Vec4, b: &Float| -> Vec4 {
    Vec4([a.px() * b, a.py() * b, a.pz() * b, a.e() * b])
});

impl std::iter::Sum for Vec4 {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Vec4::default(), |acc, v| acc + v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn three_vector_algebra() {
        let a = Vec3::new(1.0, 2.0, 2.0);
        let b = Vec3::new(0.0, -1.0, 1.0);
        assert_relative_eq!(a.mag(), 3.0);
        assert_relative_eq!(a.perp(), 5.0_f64.sqrt() as Float);
        assert_relative_eq!(a.dot(&b), 0.0);
        let c = a.cross(&b);
        assert_relative_eq!(c.dot(&a), 0.0);
        assert_relative_eq!(c.dot(&b), 0.0);
        assert_relative_eq!((a + b).y(), 1.0);
        assert_relative_eq!((2.0 * a).mag(), 6.0);
        assert_relative_eq!(a.unit().mag(), 1.0);
    }

    #[test]
    fn four_vector_invariant_mass() {
        let p = Vec4::from_momentum([0.3, -0.4, 1.2], 0.493677);
        assert_relative_eq!(p.mag(), 0.493677, epsilon = 1e-12);
        let q = Vec4::from_momentum([-0.3, 0.4, -1.2], 0.493677);
        // back-to-back kaons: invariant mass of the pair is just 2E
        assert_relative_eq!((p + q).mag(), 2.0 * p.e(), epsilon = 1e-12);
    }

    #[test]
    fn four_vector_sum() {
        let parts = [
            Vec4::from_momentum([0.1, 0.0, 0.0], 0.139570),
            Vec4::from_momentum([0.0, 0.2, 0.0], 0.139570),
        ];
        let total: Vec4 = parts.iter().copied().sum();
        assert_relative_eq!(total.px(), 0.1);
        assert_relative_eq!(total.py(), 0.2);
        assert_relative_eq!(total.e(), parts[0].e() + parts[1].e());
    }
}

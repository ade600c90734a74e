use std::{f64::consts::PI, fmt::Display, iter::Sum};

use auto_ops::{impl_op_ex, impl_op_ex_commutative};
use serde::{Deserialize, Serialize};

/// Wrap an azimuthal difference into $`[-\pi, \pi)`$.
pub fn delta_phi(phi_a: f64, phi_b: f64) -> f64 {
    (phi_a - phi_b + PI).rem_euclid(2.0 * PI) - PI
}

/// Angular separation $`\Delta R = \sqrt{\Delta\eta^2 + \Delta\phi^2}`$ between two directions.
pub fn delta_r(eta_a: f64, phi_a: f64, eta_b: f64, phi_b: f64) -> f64 {
    let deta = eta_a - eta_b;
    let dphi = delta_phi(phi_a, phi_b);
    (deta * deta + dphi * dphi).sqrt()
}

/// Transverse mass of a visible object and the missing transverse momentum,
/// $`m_T = \sqrt{2 p_T^{a} p_T^{b} (1 - \cos\Delta\phi)}`$.
pub fn transverse_mass(pt_a: f64, phi_a: f64, pt_b: f64, phi_b: f64) -> f64 {
    let cos_dphi = delta_phi(phi_a, phi_b).cos();
    (2.0 * pt_a * pt_b * (1.0 - cos_dphi)).max(0.0).sqrt()
}

/// A Cartesian four-momentum $`(p_x, p_y, p_z, E)`$.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec4 {
    /// The $`x`$-component of the momentum.
    pub px: f64,
    /// The $`y`$-component of the momentum.
    pub py: f64,
    /// The $`z`$-component of the momentum.
    pub pz: f64,
    /// The energy.
    pub e: f64,
}

impl Display for Vec4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[px = {:.5}, py = {:.5}, pz = {:.5}, e = {:.5}]",
            self.px, self.py, self.pz, self.e
        )
    }
}

impl Vec4 {
    /// Create a four-momentum from Cartesian components.
    pub fn new(px: f64, py: f64, pz: f64, e: f64) -> Self {
        Self { px, py, pz, e }
    }

    /// Create a four-momentum from the collider coordinates used by NanoAOD
    /// ($`p_T`$, $`\eta`$, $`\phi`$, $`m`$).
    pub fn from_pt_eta_phi_m(pt: f64, eta: f64, phi: f64, mass: f64) -> Self {
        let px = pt * phi.cos();
        let py = pt * phi.sin();
        let pz = pt * eta.sinh();
        let p2 = px * px + py * py + pz * pz;
        Self {
            px,
            py,
            pz,
            e: (p2 + mass * mass).sqrt(),
        }
    }

    /// Transverse momentum.
    pub fn pt(&self) -> f64 {
        self.px.hypot(self.py)
    }

    /// Pseudorapidity.
    pub fn eta(&self) -> f64 {
        (self.pz / self.pt()).asinh()
    }

    /// Azimuthal angle.
    pub fn phi(&self) -> f64 {
        self.py.atan2(self.px)
    }

    /// Squared three-momentum magnitude.
    pub fn p2(&self) -> f64 {
        self.px * self.px + self.py * self.py + self.pz * self.pz
    }

    /// The invariant mass squared, $`E^2 - |\vec{p}|^2`$. This may be slightly negative for
    /// nearly massless, collinear systems.
    pub fn mass2(&self) -> f64 {
        self.e * self.e - self.p2()
    }

    /// The invariant mass, or [`None`] when the squared mass is negative.
    pub fn mass(&self) -> Option<f64> {
        let m2 = self.mass2();
        (m2 >= 0.0).then(|| m2.sqrt())
    }

    /// Azimuthal separation to another four-momentum.
    pub fn delta_phi(&self, other: &Vec4) -> f64 {
        delta_phi(self.phi(), other.phi())
    }

    /// Angular separation to another four-momentum.
    pub fn delta_r(&self, other: &Vec4) -> f64 {
        delta_r(self.eta(), self.phi(), other.eta(), other.phi())
    }

    fn add(&self, other: &Vec4) -> Vec4 {
        Vec4::new(
            self.px + other.px,
            self.py + other.py,
            self.pz + other.pz,
            self.e + other.e,
        )
    }

    fn sub(&self, other: &Vec4) -> Vec4 {
        Vec4::new(
            self.px - other.px,
            self.py - other.py,
            self.pz - other.pz,
            self.e - other.e,
        )
    }

    fn scale(&self, factor: f64) -> Vec4 {
        Vec4::new(
            self.px * factor,
            self.py * factor,
            self.pz * factor,
            self.e * factor,
        )
    }
}

impl_op_ex!(+ |a: &Vec4, b: &Vec4| -> Vec4 { a.add(b) });
impl_op_ex!(-|a: &Vec4, b: &Vec4| -> Vec4 { a.sub(b) });
impl_op_ex!(-|a: &Vec4| -> Vec4 { a.scale(-1.0) });
impl_op_ex_commutative!(*|a: &Vec4, b: &f64| -> Vec4 { a.scale(*b) });

impl Sum for Vec4 {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Vec4::default(), |acc, p4| acc + p4)
    }
}

impl<'a> Sum<&'a Vec4> for Vec4 {
    fn sum<I: Iterator<Item = &'a Vec4>>(iter: I) -> Self {
        iter.fold(Vec4::default(), |acc, p4| acc + p4)
    }
}

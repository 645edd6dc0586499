use indexmap::IndexMap;
use lazy_static::lazy_static;

use crate::Float;

/// Static properties of a particle species: PDG code, name, mass (GeV),
/// charge (units of the elementary charge) and decay length `c * tau` (cm).
///
/// Antiparticles are looked up through the magnitude of their code with the
/// charge sign flipped, so the table only stores positive codes.
#[derive(Clone, Debug, PartialEq)]
pub struct ParticleProperties {
    /// The (positive) PDG Monte Carlo code.
    pub code: i32,
    /// A human-readable name, used as the default label in fit reports.
    pub name: &'static str,
    /// The nominal mass in GeV.
    pub mass: Float,
    /// The electric charge in units of the elementary charge.
    pub charge: i32,
    /// The nominal decay length `c * tau` in cm ([`Float::INFINITY`] for
    /// stable particles).
    pub ctau: Float,
}

impl ParticleProperties {
    /// Look up the properties for the given PDG code.
    ///
    /// Negative codes return the conjugate entry with the charge sign
    /// flipped. Returns [`None`] for codes not in the table.
    pub fn from_pdg_code(code: i32) -> Option<Self> {
        PARTICLE_TABLE.get(&code.abs()).map(|props| {
            let mut props = props.clone();
            if code < 0 {
                props.charge = -props.charge;
            }
            props
        })
    }

    /// True if the particle carries electric charge.
    pub fn is_charged(&self) -> bool {
        self.charge != 0
    }

    /// The expected flight length per unit momentum, `c * tau / m` (cm/GeV).
    ///
    /// This is the nominal value of the decay length parameter used by the
    /// fit, and [`None`] for massless or stable particles.
    pub fn tau(&self) -> Option<Float> {
        if self.mass > 0.0 && self.ctau.is_finite() {
            Some(self.ctau / self.mass)
        } else {
            None
        }
    }

    /// True if the nominal decay length is below `threshold` (cm), i.e. the
    /// particle decays too promptly to resolve a flight distance.
    pub fn decays_promptly(&self, threshold: Float) -> bool {
        self.ctau < threshold
    }
}

lazy_static! {
    static ref PARTICLE_TABLE: IndexMap<i32, ParticleProperties> = {
        let mut table = IndexMap::with_capacity(ENTRIES.len());
        for &(code, name, mass, charge, ctau) in ENTRIES {
            table.insert(
                code,
                ParticleProperties {
                    code,
                    name,
                    mass,
                    charge,
                    ctau,
                },
            );
        }
        table
    };
}

/// (code, name, mass [GeV], charge [e], ctau [cm])
const ENTRIES: &[(i32, &'static str, Float, i32, Float)] = &[
    (11, "e-", 0.000510999, -1, Float::INFINITY),
    (12, "nu_e", 0.0, 0, Float::INFINITY),
    (13, "mu-", 0.1056584, -1, 6.5864e4),
    (14, "nu_mu", 0.0, 0, Float::INFINITY),
    (15, "tau-", 1.77686, -1, 8.703e-3),
    (16, "nu_tau", 0.0, 0, Float::INFINITY),
    (22, "gamma", 0.0, 0, Float::INFINITY),
    (111, "pi0", 0.1349768, 0, 2.53e-6),
    (113, "rho0", 0.77526, 0, 1.32e-13),
    (130, "K_L0", 0.497611, 0, 1.534e3),
    (211, "pi+", 0.13957039, 1, 7.8045e2),
    (213, "rho+", 0.77526, 1, 1.32e-13),
    (221, "eta", 0.547862, 0, 1.51e-8),
    (223, "omega", 0.78266, 0, 2.27e-12),
    (310, "K_S0", 0.497611, 0, 2.6844),
    (313, "K*0", 0.89555, 0, 4.17e-13),
    (321, "K+", 0.493677, 1, 3.713e2),
    (323, "K*+", 0.89167, 1, 3.84e-13),
    (331, "eta'", 0.95778, 0, 1.05e-10),
    (411, "D+", 1.86966, 1, 3.118e-2),
    (413, "D*+", 2.01026, 1, 2.37e-7),
    (421, "D0", 1.86484, 0, 1.229e-2),
    (423, "D*0", 2.00685, 0, 1.0e-11),
    (431, "D_s+", 1.96835, 1, 1.512e-2),
    (443, "J/psi", 3.0969, 0, 2.13e-7),
    (511, "B0", 5.27966, 0, 4.554e-2),
    (521, "B+", 5.27934, 1, 4.911e-2),
    (531, "B_s0", 5.36692, 0, 4.527e-2),
    (2112, "n0", 0.93956542, 0, 2.63e13),
    (2212, "p+", 0.93827208, 1, Float::INFINITY),
    (3122, "Lambda0", 1.115683, 0, 7.89),
    (4122, "Lambda_c+", 2.28646, 1, 6.02e-3),
    (100443, "psi(2S)", 3.6861, 0, 6.7e-11),
    (300553, "Upsilon(4S)", 10.5794, 0, 9.6e-13),
];

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn lookup_by_code() {
        let kaon = ParticleProperties::from_pdg_code(321).unwrap();
        assert_eq!(kaon.name, "K+");
        assert_relative_eq!(kaon.mass, 0.493677);
        assert_eq!(kaon.charge, 1);
        assert!(ParticleProperties::from_pdg_code(99_999).is_none());
    }

    #[test]
    fn antiparticles_flip_charge() {
        let km = ParticleProperties::from_pdg_code(-321).unwrap();
        assert_eq!(km.charge, -1);
        assert_relative_eq!(km.mass, 0.493677);
        let pi0 = ParticleProperties::from_pdg_code(111).unwrap();
        assert_eq!(pi0.charge, 0);
    }

    #[test]
    fn prompt_decay_classification() {
        let dstar = ParticleProperties::from_pdg_code(413).unwrap();
        assert!(dstar.decays_promptly(1e-4));
        let d0 = ParticleProperties::from_pdg_code(421).unwrap();
        assert!(!d0.decays_promptly(1e-4));
        let ks = ParticleProperties::from_pdg_code(310).unwrap();
        assert!(!ks.decays_promptly(1e-4));
    }

    #[test]
    fn expected_flight_length_per_momentum() {
        let b0 = ParticleProperties::from_pdg_code(511).unwrap();
        assert_relative_eq!(b0.tau().unwrap(), 4.554e-2 / 5.27966, epsilon = 1e-12);
        assert!(ParticleProperties::from_pdg_code(22).unwrap().tau().is_none());
        assert!(ParticleProperties::from_pdg_code(2212).unwrap().tau().is_none());
    }
}

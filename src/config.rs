use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::Float;

/// The measured beam interaction region: a position (cm) and its 3×3
/// covariance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BeamSpot {
    /// The center of the interaction region in cm.
    pub position: [Float; 3],
    /// The covariance of the interaction region in cm².
    pub covariance: [[Float; 3]; 3],
}

impl BeamSpot {
    /// Create a new [`BeamSpot`] from a position and its covariance.
    pub fn new(position: [Float; 3], covariance: [[Float; 3]; 3]) -> Self {
        Self {
            position,
            covariance,
        }
    }
}

/// Which form of the invariant-mass constraint is applied to a composite.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MassConstraintMode {
    /// Constrain the node's own four-momentum when it carries an energy
    /// parameter, otherwise the summed daughter four-momentum.
    #[default]
    Auto,
    /// Always constrain the node's own four-momentum.
    Particle,
    /// Always constrain the summed daughter four-momentum.
    Daughters,
}

impl Display for MassConstraintMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MassConstraintMode::Auto => write!(f, "auto"),
            MassConstraintMode::Particle => write!(f, "particle"),
            MassConstraintMode::Daughters => write!(f, "daughters"),
        }
    }
}

impl FromStr for MassConstraintMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "particle" | "mother" => Ok(Self::Particle),
            "daughters" | "daughter" => Ok(Self::Daughters),
            _ => Err("Invalid mass constraint mode".to_string()),
        }
    }
}

/// Settings shared by every fit in a job.
///
/// All fields have documented defaults, so a plain [`FitConfig::default()`]
/// runs an unconstrained vertex fit at the nominal field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Maximum number of filter iterations before the fit is declared
    /// non-converging (default `100`).
    pub max_iterations: usize,
    /// Convergence threshold on the chi-square change per degree of freedom
    /// (default `0.01`).
    pub convergence_delta: Float,
    /// The magnetic field along `z` in Tesla (default `1.5`).
    pub magnetic_field: Float,
    /// Constrain the head of the tree to the interaction region
    /// (default `false`).
    pub ip_constraint: bool,
    /// The measured interaction region used by the beamspot constraint and,
    /// when present, as the production vertex seed.
    pub beam: Option<BeamSpot>,
    /// Width in cm of the loose diagonal prior applied to an origin vertex
    /// when no beam spot is configured (default `20.0`).
    pub origin_width: Float,
    /// PDG codes (magnitudes) whose invariant mass is constrained.
    pub mass_constraint_list: Vec<i32>,
    /// The form of the mass constraint (default [`MassConstraintMode::Auto`]).
    pub mass_constraint_mode: MassConstraintMode,
    /// PDG codes (magnitudes) whose decay length is constrained to the PDG
    /// mean.
    pub lifetime_constraint_list: Vec<i32>,
    /// Nominal `c·tau` in cm below which a mothered composite is treated as
    /// decaying at its mother's vertex (default `1e-4`, i.e. 1 µm).
    pub resonance_threshold: Float,
    /// Transverse sagitta scale `|pt·lambda·tau²|` in cm above which the
    /// curved flight parameterization replaces the straight-line form
    /// (default `1e-4`).
    pub geo_precision: Float,
    /// Seed every composite vertex from its daughters even when the candidate
    /// already carries one (default `false`).
    pub force_fit_all: bool,
    /// Apply constraints innermost-first (default `true`).
    pub innermost_first: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            convergence_delta: 0.01,
            magnetic_field: 1.5,
            ip_constraint: false,
            beam: None,
            origin_width: 20.0,
            mass_constraint_list: Vec::new(),
            mass_constraint_mode: MassConstraintMode::default(),
            lifetime_constraint_list: Vec::new(),
            resonance_threshold: 1e-4,
            geo_precision: 1e-4,
            force_fit_all: false,
            innermost_first: true,
        }
    }
}

impl FitConfig {
    /// True if the invariant mass of particles with the given PDG code should
    /// be constrained.
    pub fn mass_constrained(&self, pdg_code: i32) -> bool {
        self.mass_constraint_list.contains(&pdg_code.abs())
    }

    /// True if the decay length of particles with the given PDG code should
    /// be constrained to the PDG mean.
    pub fn lifetime_constrained(&self, pdg_code: i32) -> bool {
        self.lifetime_constraint_list.contains(&pdg_code.abs())
    }
}

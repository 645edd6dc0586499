use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    utils::helix::HelixParameters,
    utils::vectors::{Vec3, Vec4},
    Float,
};

/// A reconstructed track attached to a [`Candidate`]: perigee helix
/// parameters `(d0, phi0, omega, z0, tan_lambda)`, their 5×5 covariance and
/// the particle charge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackMeasurement {
    /// The measured helix parameters `(d0, phi0, omega, z0, tan_lambda)`.
    pub helix: [Float; 5],
    /// The 5×5 covariance of the helix parameters.
    pub covariance: [[Float; 5]; 5],
    /// The particle charge in units of the elementary charge.
    pub charge: i32,
}

impl TrackMeasurement {
    /// Create a new [`TrackMeasurement`] from helix parameters, their
    /// covariance and the track charge.
    pub fn new(helix: [Float; 5], covariance: [[Float; 5]; 5], charge: i32) -> Self {
        Self {
            helix,
            covariance,
            charge,
        }
    }

    /// The measured helix as a [`HelixParameters`] value.
    pub fn parameters(&self) -> HelixParameters {
        HelixParameters::from_array(self.helix)
    }
}

/// A calorimeter cluster attached to a [`Candidate`]: the shower position
/// (cm), energy (GeV) and their joint 4×4 covariance `(x, y, z, E)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterMeasurement {
    /// The measured shower position in cm.
    pub position: [Float; 3],
    /// The measured cluster energy in GeV.
    pub energy: Float,
    /// The joint 4×4 covariance of `(x, y, z, E)`.
    pub covariance: [[Float; 4]; 4],
}

impl ClusterMeasurement {
    /// Create a new [`ClusterMeasurement`] from a position, an energy and
    /// their joint covariance.
    pub fn new(position: [Float; 3], energy: Float, covariance: [[Float; 4]; 4]) -> Self {
        Self {
            position,
            energy,
            covariance,
        }
    }
}

/// A reconstructed particle hypothesis: the input to (and, via
/// [`Candidate::apply_report`], the output of) a fit.
///
/// Candidates form a plain owned tree. Final states carry a
/// [`TrackMeasurement`] or [`ClusterMeasurement`]; composites carry
/// daughters and optionally a previously fitted vertex. Everything else is
/// optional metadata the fitter either uses as a seed or fills in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// The PDG Monte Carlo code of the hypothesis.
    pub pdg_code: i32,
    /// An optional label overriding the PDG name in reports.
    pub name: Option<String>,
    /// The four-momentum in GeV.
    pub p4: Vec4,
    /// The decay vertex in cm, if one is known.
    pub vertex: Option<Vec3>,
    /// The 4×4 covariance of `(px, py, pz, E)`, if known.
    pub momentum_covariance: Option<[[Float; 4]; 4]>,
    /// The 3×3 covariance of the decay vertex, if known.
    pub vertex_covariance: Option<[[Float; 3]; 3]>,
    /// Daughter candidates (empty for final states).
    pub daughters: Vec<Candidate>,
    /// The associated track measurement, if any.
    pub track: Option<TrackMeasurement>,
    /// The associated calorimeter cluster, if any.
    pub cluster: Option<ClusterMeasurement>,
    /// Extra key-value metadata; the fitter adds its summary keys here.
    #[serde(default)]
    pub extra_info: IndexMap<String, Float>,
}

impl Candidate {
    /// Create a final-state [`Candidate`] from a PDG code and a
    /// four-momentum.
    pub fn new(pdg_code: i32, p4: Vec4) -> Self {
        Self {
            pdg_code,
            name: None,
            p4,
            vertex: None,
            momentum_covariance: None,
            vertex_covariance: None,
            daughters: Vec::new(),
            track: None,
            cluster: None,
            extra_info: IndexMap::new(),
        }
    }

    /// Create a composite [`Candidate`] whose four-momentum is the sum of
    /// its daughters'.
    pub fn composite(pdg_code: i32, daughters: Vec<Candidate>) -> Self {
        let p4 = daughters.iter().map(|daughter| daughter.p4).sum();
        Self {
            daughters,
            ..Self::new(pdg_code, p4)
        }
    }

    /// Attach a label used in place of the PDG name in reports.
    pub fn with_name<T: Into<String>>(mut self, name: T) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attach a track measurement.
    pub fn with_track(mut self, track: TrackMeasurement) -> Self {
        self.track = Some(track);
        self
    }

    /// Attach a calorimeter cluster measurement.
    pub fn with_cluster(mut self, cluster: ClusterMeasurement) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Attach a decay vertex (cm), used as the vertex seed unless the fit is
    /// configured to re-seed everything.
    pub fn with_vertex(mut self, vertex: [Float; 3]) -> Self {
        self.vertex = Some(Vec3(vertex));
        self
    }

    /// Attach a momentum covariance.
    pub fn with_momentum_covariance(mut self, covariance: [[Float; 4]; 4]) -> Self {
        self.momentum_covariance = Some(covariance);
        self
    }

    /// Attach a vertex covariance.
    pub fn with_vertex_covariance(mut self, covariance: [[Float; 3]; 3]) -> Self {
        self.vertex_covariance = Some(covariance);
        self
    }

    /// True if this candidate has daughters.
    pub fn is_composite(&self) -> bool {
        !self.daughters.is_empty()
    }

    fn descendant_mut(&mut self, path: &[usize]) -> Option<&mut Candidate> {
        let mut current = self;
        for &index in path {
            current = current.daughters.get_mut(index)?;
        }
        Some(current)
    }

    /// Copy a fit result back onto this candidate tree.
    ///
    /// Every [`FittedEntry`] updates the candidate it addresses (by daughter
    /// index path): four-momentum, vertex and covariance blocks, plus
    /// `decayLength`/`decayLengthErr` extra-info for nodes with a fitted
    /// flight length. The head candidate additionally receives the
    /// `chiSquared`, `ndf` and `pValue` summary keys.
    pub fn apply_report(&mut self, report: &FitReport) {
        for entry in &report.entries {
            if let Some(candidate) = self.descendant_mut(&entry.path) {
                candidate.p4 = entry.p4;
                candidate.momentum_covariance = Some(entry.momentum_covariance);
                if let Some(vertex) = entry.vertex {
                    candidate.vertex = Some(vertex);
                }
                if let Some(covariance) = entry.vertex_covariance {
                    candidate.vertex_covariance = Some(covariance);
                }
                if let Some((length, variance)) = entry.decay_length {
                    candidate
                        .extra_info
                        .insert("decayLength".to_string(), length);
                    candidate
                        .extra_info
                        .insert("decayLengthErr".to_string(), variance.max(0.0).sqrt());
                }
            }
        }
        self.extra_info
            .insert("chiSquared".to_string(), report.chi_square);
        self.extra_info.insert("ndf".to_string(), report.ndf as Float);
        self.extra_info.insert("pValue".to_string(), report.p_value);
    }
}

/// The fitted state of a single candidate inside a [`FitReport`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FittedEntry {
    /// Daughter-index path from the head candidate (empty for the head).
    pub path: Vec<usize>,
    /// The report label (candidate name or PDG name).
    pub name: String,
    /// The fitted four-momentum.
    pub p4: Vec4,
    /// The fitted 4×4 covariance of `(px, py, pz, E)`.
    pub momentum_covariance: [[Float; 4]; 4],
    /// The fitted decay vertex, for nodes that own one.
    pub vertex: Option<Vec3>,
    /// The fitted 3×3 vertex covariance.
    pub vertex_covariance: Option<[[Float; 3]; 3]>,
    /// The fitted decay length and its variance, for nodes with a flight
    /// length parameter.
    pub decay_length: Option<(Float, Float)>,
    /// The chi-square accumulated by this node's constraints and those of
    /// its descendants.
    pub chi_square: Float,
}

/// The outcome of a converged fit.
///
/// Produced by [`TreeFitter::fit`](crate::fitter::TreeFitter::fit) and
/// applied back onto the input tree with [`Candidate::apply_report`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    /// The total chi-square of the converged fit.
    pub chi_square: Float,
    /// The number of degrees of freedom (constraint rows minus state
    /// parameters).
    pub ndf: usize,
    /// The upper-tail chi-square probability of the fit.
    pub p_value: Float,
    /// The number of filter iterations used.
    pub iterations: usize,
    /// Per-candidate fitted states, head first.
    pub entries: Vec<FittedEntry>,
    /// Diagnostic map of `(label, first state index, dimension)` per node.
    pub index_map: Vec<(String, usize, usize)>,
}

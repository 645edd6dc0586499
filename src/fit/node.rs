use log::warn;
use nalgebra::DVector;

use crate::{
    fit::errcode::ErrCode,
    fit::params::FitParams,
    fit::tree::{DecayTree, ParticleId},
    utils::helix::{helix_from_vertex, momentum_covariance_from_helix, poca_of_two_helices},
    utils::vectors::{Vec3, Vec4},
    Float,
};

/// The concrete role a node plays in the fit, chosen once by the tree
/// factory.
///
/// The kind fixes the node's parameter block: positions are `(x, y, z)` in
/// cm, momenta `(px, py, pz)` (with an energy slot where noted) in GeV, and
/// `tau` is the decay length divided by the momentum magnitude (cm/GeV), so
/// that `tau · |p|` is the flight distance.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// A generated root carrying the measured beam interaction region;
    /// parameters `(x, y, z)`.
    InteractionPoint,
    /// A generated root with only a loose position prior; parameters
    /// `(x, y, z)`.
    Origin,
    /// A composite with its own decay vertex: `(x, y, z, tau, px, py, pz, E)`
    /// when mothered, `(x, y, z, px, py, pz, E)` for the motherless head.
    InternalParticle {
        /// Apply an invariant-mass constraint to this node.
        mass_constrained: bool,
        /// Constrain this node's decay length to the PDG mean.
        lifetime_constrained: bool,
    },
    /// A prompt composite that decays at its mother's vertex; parameters
    /// `(px, py, pz, E)`.
    Resonance {
        /// Apply an invariant-mass constraint to this node.
        mass_constrained: bool,
    },
    /// A charged final state measured as a helix; parameters
    /// `(px, py, pz, E, tau)`, with the momentum defined at the mother
    /// vertex.
    RecoTrack,
    /// A massless final state measured as a calorimeter cluster; parameters
    /// `(px, py, pz)`.
    RecoPhoton,
    /// A long-lived neutral kaon measured as a calorimeter cluster;
    /// parameters `(px, py, pz)`.
    RecoKlong,
    /// An unmeasured final state, free in the fit; parameters
    /// `(px, py, pz, E)`.
    MissingParticle,
}

impl NodeKind {
    /// The parameter count of this kind (composites lose their `tau` slot
    /// when they head the tree).
    pub fn dim(&self, mothered: bool) -> usize {
        match self {
            NodeKind::InteractionPoint | NodeKind::Origin => 3,
            NodeKind::InternalParticle { .. } => {
                if mothered {
                    8
                } else {
                    7
                }
            }
            NodeKind::Resonance { .. } => 4,
            NodeKind::RecoTrack => 5,
            NodeKind::RecoPhoton | NodeKind::RecoKlong => 3,
            NodeKind::MissingParticle => 4,
        }
    }

    /// True if the kind carries its own energy parameter. Cluster-based
    /// kinds derive the energy from `sqrt(p² + m²)` instead.
    pub fn has_energy(&self) -> bool {
        matches!(
            self,
            NodeKind::InternalParticle { .. }
                | NodeKind::Resonance { .. }
                | NodeKind::RecoTrack
                | NodeKind::MissingParticle
        )
    }

    /// True if the kind owns a vertex position block.
    pub fn has_position(&self) -> bool {
        matches!(
            self,
            NodeKind::InteractionPoint | NodeKind::Origin | NodeKind::InternalParticle { .. }
        )
    }

    /// True for composites that decay promptly at their mother's vertex.
    pub fn is_resonance(&self) -> bool {
        matches!(self, NodeKind::Resonance { .. })
    }
}

pub(crate) fn read_vec3(par: &DVector<Float>, index: usize) -> Vec3 {
    Vec3::new(par[index], par[index + 1], par[index + 2])
}

pub(crate) fn write_vec3(par: &mut DVector<Float>, index: usize, value: Vec3) {
    par[index] = value.x();
    par[index + 1] = value.y();
    par[index + 2] = value.z();
}

impl<'a> DecayTree<'a> {
    /// The four-momentum of a node as currently stored in `par`, deriving
    /// the energy from the nominal mass for kinds without an energy slot.
    pub(crate) fn node_p4(&self, par: &DVector<Float>, id: ParticleId) -> Vec4 {
        let mom = self
            .mom_index(id)
            .expect("momentum block required for a four-momentum");
        let p = read_vec3(par, mom);
        match self.energy_index(id) {
            Some(energy) => p.with_energy(par[energy]),
            None => p.with_mass(self.mass_of(id)),
        }
    }

    /// Seed the full state vector: phase one bottom-up, then the
    /// mother-dependent phase for the root (a no-op unless the tree is
    /// rooted in a generated origin, whose daughters are seeded inline).
    pub(crate) fn init_parameters(&self, params: &mut FitParams) -> ErrCode {
        let root = self.root();
        let mut status = self.init_state(root, params);
        status |= self.init_from_mother(root, params);
        status
    }

    /// Phase one: everything that can be seeded without the mother's vertex,
    /// daughters first. Composites seed their vertex here and then complete
    /// their daughters, so the momentum sum at the end sees fully seeded
    /// blocks.
    fn init_state(&self, id: ParticleId, params: &mut FitParams) -> ErrCode {
        let node = self.node(id);
        let mut status = ErrCode::OK;
        match node.kind {
            NodeKind::InteractionPoint | NodeKind::Origin => {
                if let Some(beam) = &self.config.beam {
                    write_vec3(params.par_mut(), node.index, Vec3(beam.position));
                }
                for &daughter in &node.daughters {
                    status |= self.init_state(daughter, params);
                }
                for &daughter in &node.daughters {
                    status |= self.init_from_mother(daughter, params);
                }
            }
            NodeKind::InternalParticle { .. } => {
                for &daughter in &node.daughters {
                    status |= self.init_state(daughter, params);
                }
                status |= self.seed_vertex(id, params);
                for &daughter in &node.daughters {
                    status |= self.init_from_mother(daughter, params);
                }
                status |= self.init_momentum(id, params);
            }
            NodeKind::Resonance { .. } => {
                for &daughter in &node.daughters {
                    status |= self.init_state(daughter, params);
                }
                status |= self.init_momentum(id, params);
            }
            NodeKind::RecoTrack => {
                let candidate = node.candidate.expect("track nodes carry a candidate");
                let p4 = candidate.p4;
                if p4.vec3().mag2() <= 0.0 {
                    return ErrCode::BAD_INPUT;
                }
                let mom = node.index;
                write_vec3(params.par_mut(), mom, p4.vec3());
                params.par_mut()[mom + 3] = p4.e();
            }
            NodeKind::RecoPhoton | NodeKind::RecoKlong => {
                // seeded in the mother-dependent phase, from the cluster and
                // the mother vertex
            }
            NodeKind::MissingParticle => {
                let candidate = node.candidate.expect("missing nodes carry a candidate");
                let mom = node.index;
                write_vec3(params.par_mut(), mom, candidate.p4.vec3());
                params.par_mut()[mom + 3] = candidate.p4.e();
            }
        }
        status
    }

    /// Seed a composite's vertex block: the candidate's own vertex, the
    /// transverse crossing of its two highest-pt track daughters (which also
    /// seeds those tracks' flight lengths), an already seeded daughter
    /// vertex, else leave it for the mother copy in phase two.
    fn seed_vertex(&self, id: ParticleId, params: &mut FitParams) -> ErrCode {
        let node = self.node(id);
        let pos = node.index;
        let mut status = ErrCode::OK;

        if !self.config.force_fit_all {
            if let Some(vertex) = node.candidate.and_then(|candidate| candidate.vertex) {
                write_vec3(params.par_mut(), pos, vertex);
                return status;
            }
        }

        let mut tracks: Vec<ParticleId> = self
            .vertex_daughters(id)
            .into_iter()
            .filter(|&daughter| matches!(self.node(daughter).kind, NodeKind::RecoTrack))
            .collect();
        tracks.sort_by(|&a, &b| {
            let pt_a = read_vec3(params.par(), self.node(a).index).perp();
            let pt_b = read_vec3(params.par(), self.node(b).index).perp();
            pt_b.partial_cmp(&pt_a).unwrap_or(std::cmp::Ordering::Equal)
        });
        if tracks.len() >= 2 {
            let helix_of = |id: ParticleId| {
                self.node(id)
                    .candidate
                    .and_then(|candidate| candidate.track.as_ref())
                    .map(|track| track.parameters())
            };
            if let (Some(first), Some(second)) = (helix_of(tracks[0]), helix_of(tracks[1])) {
                if let Some((flight_first, flight_second, seed)) =
                    poca_of_two_helices(&first, &second)
                {
                    write_vec3(params.par_mut(), pos, seed);
                    for (&track, flight) in
                        tracks.iter().take(2).zip([flight_first, flight_second])
                    {
                        let track_node = self.node(track);
                        let momentum = read_vec3(params.par(), track_node.index).mag();
                        if momentum > 0.0 {
                            params.par_mut()[track_node.index + 4] = flight / momentum;
                        }
                    }
                    return status;
                }
                warn!("vertex seed: no transverse crossing for {}", node.name);
                status |= ErrCode::POCA_FAILURE;
            }
        }

        for &daughter in &node.daughters {
            if self.node(daughter).kind.has_position() {
                let daughter_pos = self.node(daughter).index;
                let seed = read_vec3(params.par(), daughter_pos);
                if seed.mag2() > 0.0 {
                    write_vec3(params.par_mut(), pos, seed);
                    return status;
                }
            }
        }

        if !self.mothered(id) {
            // a mothered composite still gets its mother's vertex in phase
            // two; a motherless one is out of geometric information
            warn!(
                "not enough geometric information to seed a vertex for {}",
                node.name
            );
            status |= ErrCode::BAD_SETUP;
        }
        status
    }

    /// A composite's momentum is the sum of its daughters'. An empty or
    /// degenerate sum cannot seed a direction and is rejected.
    fn init_momentum(&self, id: ParticleId, params: &mut FitParams) -> ErrCode {
        let node = self.node(id);
        let p4: Vec4 = node
            .daughters
            .iter()
            .map(|&daughter| self.node_p4(params.par(), daughter))
            .sum();
        if p4.vec3().mag2() <= 0.0 || p4.e() <= 0.0 {
            return ErrCode::BAD_INPUT;
        }
        let mom = self
            .mom_index(id)
            .expect("composites own a momentum block");
        write_vec3(params.par_mut(), mom, p4.vec3());
        params.par_mut()[mom + 3] = p4.e();
        ErrCode::OK
    }

    /// Phase two: seeds that need the mother's vertex. Composites copy the
    /// mother vertex if theirs is still unset and seed their decay length;
    /// tracks propagate to the mother vertex for a flight length seed;
    /// cluster kinds point their momentum from the mother vertex to the
    /// cluster.
    fn init_from_mother(&self, id: ParticleId, params: &mut FitParams) -> ErrCode {
        let node = self.node(id);
        let mut status = ErrCode::OK;
        match node.kind {
            NodeKind::InteractionPoint | NodeKind::Origin => {}
            NodeKind::InternalParticle { .. } => {
                let pos = node.index;
                if let Some(mother) = node.mother {
                    if read_vec3(params.par(), pos).mag2() == 0.0 {
                        if let Some(mother_pos) = self.pos_index(mother) {
                            let seed = read_vec3(params.par(), mother_pos);
                            write_vec3(params.par_mut(), pos, seed);
                        }
                    }
                }
                status |= self.init_tau(id, params);
            }
            NodeKind::Resonance { .. } => {
                for &daughter in &node.daughters {
                    status |= self.init_from_mother(daughter, params);
                }
            }
            NodeKind::RecoTrack => {
                let tau = node.index + 4;
                if params.par()[tau] == 0.0 {
                    status |= self.seed_track_tau(id, params);
                }
            }
            NodeKind::RecoPhoton | NodeKind::RecoKlong => {
                status |= self.seed_cluster_momentum(id, params);
            }
            NodeKind::MissingParticle => {}
        }
        status
    }

    /// Decay length seed: the projection of the mother-to-vertex displacement
    /// onto the momentum direction, or the PDG mean when the vertices
    /// coincide.
    fn init_tau(&self, id: ParticleId, params: &mut FitParams) -> ErrCode {
        let Some(tau) = self.tau_index(id) else {
            return ErrCode::OK;
        };
        let node = self.node(id);
        let Some(mother_pos) = node.mother.and_then(|mother| self.pos_index(mother)) else {
            return ErrCode::OK;
        };
        let displacement =
            read_vec3(params.par(), node.index) - read_vec3(params.par(), mother_pos);
        let momentum = self.node_p4(params.par(), id).vec3();
        let mag2 = momentum.mag2();
        if mag2 <= 0.0 {
            return ErrCode::BAD_INPUT;
        }
        let mut seed = displacement.dot(&momentum) / mag2;
        if seed == 0.0 {
            seed = node
                .properties
                .as_ref()
                .and_then(|properties| properties.tau())
                .unwrap_or(0.0);
        }
        params.par_mut()[tau] = seed;
        ErrCode::OK
    }

    /// Propagate the track from the mother vertex to its perigee for a
    /// flight length seed. A failed propagation is recoverable: the flight
    /// stays zero and the filter sorts it out.
    fn seed_track_tau(&self, id: ParticleId, params: &mut FitParams) -> ErrCode {
        let node = self.node(id);
        let Some(mother_pos) = node.mother.and_then(|mother| self.pos_index(mother)) else {
            return ErrCode::OK;
        };
        let charge = node
            .candidate
            .and_then(|candidate| candidate.track.as_ref())
            .map_or(0, |track| track.charge);
        let vertex = read_vec3(params.par(), mother_pos);
        let momentum = read_vec3(params.par(), node.index);
        match helix_from_vertex(vertex, momentum, charge, self.config.magnetic_field) {
            Ok(prediction) => {
                let mag = momentum.mag();
                if mag > 0.0 {
                    params.par_mut()[node.index + 4] = -prediction.flight_length / mag;
                }
                ErrCode::OK
            }
            Err(_) => {
                warn!("flight length seed failed for {}", node.name);
                ErrCode::POCA_FAILURE
            }
        }
    }

    /// Point the cluster momentum from the mother vertex towards the shower.
    fn seed_cluster_momentum(&self, id: ParticleId, params: &mut FitParams) -> ErrCode {
        let node = self.node(id);
        let Some(cluster) = node.candidate.and_then(|candidate| candidate.cluster.as_ref())
        else {
            return ErrCode::BAD_INPUT;
        };
        let Some(mother_pos) = node.mother.and_then(|mother| self.pos_index(mother)) else {
            return ErrCode::BAD_INPUT;
        };
        let vertex = read_vec3(params.par(), mother_pos);
        let direction = Vec3(cluster.position) - vertex;
        if direction.mag2() <= 0.0 {
            return ErrCode::BAD_INPUT;
        }
        let mass = self.mass_of(id);
        let momentum = if matches!(node.kind, NodeKind::RecoKlong) {
            if cluster.energy <= mass {
                return ErrCode::BAD_INPUT;
            }
            (cluster.energy * cluster.energy - mass * mass).sqrt()
        } else {
            cluster.energy
        };
        write_vec3(params.par_mut(), node.index, direction.unit() * momentum);
        ErrCode::OK
    }

    /// Seed the covariance: loose diagonal priors per block, with the track
    /// momentum block propagated from the measured helix covariance.
    pub(crate) fn init_covariance(&self, params: &mut FitParams) -> ErrCode {
        self.init_covariance_node(self.root(), params)
    }

    fn init_covariance_node(&self, id: ParticleId, params: &mut FitParams) -> ErrCode {
        let mut status = ErrCode::OK;
        for &daughter in &self.node(id).daughters {
            status |= self.init_covariance_node(daughter, params);
        }
        let node = self.node(id);
        match node.kind {
            NodeKind::InteractionPoint | NodeKind::Origin => {
                let pos = node.index;
                for slot in 0..3 {
                    let width = match (&node.kind, &self.config.beam) {
                        (NodeKind::InteractionPoint, Some(beam)) => {
                            1000.0 * beam.covariance[slot][slot]
                        }
                        _ => self.config.origin_width * self.config.origin_width,
                    };
                    params.cov_mut()[(pos + slot, pos + slot)] = width;
                }
            }
            NodeKind::RecoTrack => {
                let candidate = node.candidate.expect("track nodes carry a candidate");
                let track = candidate.track.as_ref().expect("track nodes carry a track");
                let momentum = read_vec3(params.par(), node.index);
                match momentum_covariance_from_helix(
                    &track.parameters(),
                    &track.covariance,
                    track.charge,
                    self.config.magnetic_field,
                ) {
                    Ok(block) => {
                        for row in 0..3 {
                            for col in 0..3 {
                                params.cov_mut()[(node.index + row, node.index + col)] =
                                    1000.0 * block[(row, col)];
                            }
                        }
                    }
                    Err(_) => {
                        status |= ErrCode::BAD_INPUT;
                        let scale = 4.0 * momentum.mag2().max(1.0);
                        for slot in 0..3 {
                            params.cov_mut()[(node.index + slot, node.index + slot)] = scale;
                        }
                    }
                }
                let energy = params.par()[node.index + 3];
                params.cov_mut()[(node.index + 3, node.index + 3)] =
                    4.0 * (energy * energy).max(1.0);
                params.cov_mut()[(node.index + 4, node.index + 4)] = 100.0;
            }
            _ => {
                if let Some(pos) = node.kind.has_position().then_some(node.index) {
                    for slot in 0..3 {
                        params.cov_mut()[(pos + slot, pos + slot)] = 400.0;
                    }
                }
                if let Some(tau) = self.tau_index(id) {
                    params.cov_mut()[(tau, tau)] = 100.0;
                }
                if let Some(mom) = self.mom_index(id) {
                    let energy = self.node_p4(params.par(), id).e();
                    let scale = 4.0 * (energy * energy).max(1.0);
                    let width = if node.kind.has_energy() { 4 } else { 3 };
                    for slot in 0..width {
                        params.cov_mut()[(mom + slot, mom + slot)] = scale;
                    }
                }
            }
        }
        status
    }

    /// Make every composite four-momentum exactly the sum of its daughters',
    /// bottom-up, by absorbing the kinematic residual at the fitted point.
    pub(crate) fn force_p4_sum(&self, params: &mut FitParams) -> ErrCode {
        self.force_p4_sum_node(self.root(), params)
    }

    fn force_p4_sum_node(&self, id: ParticleId, params: &mut FitParams) -> ErrCode {
        let mut status = ErrCode::OK;
        for &daughter in &self.node(id).daughters {
            status |= self.force_p4_sum_node(daughter, params);
        }
        let node = self.node(id);
        if !matches!(
            node.kind,
            NodeKind::InternalParticle { .. } | NodeKind::Resonance { .. }
        ) {
            return status;
        }
        let Some(mom) = self.mom_index(id) else {
            return status;
        };
        let mut projection = crate::fit::projection::Projection::new(4, params.dim());
        let par = params.par().clone();
        status |= self.project_kinematic(id, &par, &mut projection);
        for slot in 0..4 {
            params.par_mut()[mom + slot] -= projection.r[slot];
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{Candidate, TrackMeasurement};
    use crate::config::FitConfig;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn measured_track(
        pdg_code: i32,
        vertex: Vec3,
        momentum: [Float; 3],
        mass: Float,
        charge: i32,
        b_field: Float,
    ) -> Candidate {
        let pred = helix_from_vertex(vertex, Vec3(momentum), charge, b_field).unwrap();
        let mut covariance = [[0.0; 5]; 5];
        for slot in 0..5 {
            covariance[slot][slot] = 1e-6;
        }
        Candidate::new(pdg_code, Vec4::from_momentum(momentum, mass))
            .with_track(TrackMeasurement::new(pred.helix.to_array(), covariance, charge))
    }

    fn two_track_b(vertex: Vec3, b_field: Float) -> Candidate {
        Candidate::composite(
            511,
            vec![
                measured_track(321, vertex, [0.6, 0.1, 0.4], 0.493677, 1, b_field),
                measured_track(-211, vertex, [-0.3, 0.5, -0.2], 0.13957039, -1, b_field),
            ],
        )
    }

    #[test]
    fn seeding_fills_momenta_and_sums() {
        let config = FitConfig::default();
        let vertex = Vec3::new(0.05, 0.12, -0.3);
        let b0 = two_track_b(vertex, config.magnetic_field).with_vertex([
            vertex.x(),
            vertex.y(),
            vertex.z(),
        ]);
        let tree = DecayTree::from_candidate(&b0, &config).unwrap();
        let mut params = FitParams::new(tree.dim());
        let status = tree.init_parameters(&mut params);
        assert!(status.is_success());
        let head = tree.root();
        let kaon = tree.node(head).daughters[0];
        assert_relative_eq!(params.par()[tree.node(kaon).index], 0.6);
        let head_p4 = tree.node_p4(params.par(), head);
        assert_relative_eq!(head_p4.px(), 0.3, epsilon = 1e-12);
        assert_relative_eq!(head_p4.py(), 0.6, epsilon = 1e-12);
        // the candidate vertex wins over any other seed
        let pos = tree.pos_index(head).unwrap();
        assert_relative_eq!(params.par()[pos], 0.05);
        assert_relative_eq!(params.par()[pos + 2], -0.3);
    }

    #[test]
    fn poca_seeding_recovers_the_vertex_and_flights() {
        let config = FitConfig::default();
        let vertex = Vec3::new(0.05, 0.12, -0.3);
        let b0 = two_track_b(vertex, config.magnetic_field);
        let tree = DecayTree::from_candidate(&b0, &config).unwrap();
        let mut params = FitParams::new(tree.dim());
        let status = tree.init_parameters(&mut params);
        assert!(status.is_success());
        let head = tree.root();
        let pos = tree.pos_index(head).unwrap();
        assert_abs_diff_eq!(params.par()[pos], vertex.x(), epsilon = 1e-6);
        assert_abs_diff_eq!(params.par()[pos + 1], vertex.y(), epsilon = 1e-6);
        assert_abs_diff_eq!(params.par()[pos + 2], vertex.z(), epsilon = 1e-6);
        // both flight seeds match a fresh vertex-to-perigee propagation
        for &daughter in &tree.node(head).daughters {
            let node = tree.node(daughter);
            let momentum = read_vec3(params.par(), node.index);
            let charge = node.candidate.unwrap().track.as_ref().unwrap().charge;
            let pred =
                helix_from_vertex(vertex, momentum, charge, config.magnetic_field).unwrap();
            assert_relative_eq!(
                params.par()[node.index + 4],
                -pred.flight_length / momentum.mag(),
                epsilon = 1e-4
            );
        }
    }

    #[test]
    fn zero_momentum_sum_is_bad_input() {
        let config = FitConfig::default();
        let vertex = Vec3::new(0.0, 0.0, 0.0);
        let b0 = Candidate::composite(
            511,
            vec![
                measured_track(211, vertex, [0.4, 0.0, 0.1], 0.13957039, 1, config.magnetic_field),
                measured_track(
                    -211,
                    vertex,
                    [-0.4, 0.0, -0.1],
                    0.13957039,
                    -1,
                    config.magnetic_field,
                ),
            ],
        );
        let tree = DecayTree::from_candidate(&b0, &config).unwrap();
        let mut params = FitParams::new(tree.dim());
        let status = tree.init_parameters(&mut params);
        assert!(status.contains(ErrCode::BAD_INPUT));
        // the daughters' own blocks keep their seeds
        let pion = tree.node(tree.root()).daughters[0];
        assert_relative_eq!(params.par()[tree.node(pion).index], 0.4);
    }

    #[test]
    fn covariance_seeds_are_positive() {
        let config = FitConfig::default();
        let vertex = Vec3::new(0.05, 0.12, -0.3);
        let b0 = two_track_b(vertex, config.magnetic_field);
        let tree = DecayTree::from_candidate(&b0, &config).unwrap();
        let mut params = FitParams::new(tree.dim());
        assert!(tree.init_parameters(&mut params).is_success());
        assert!(tree.init_covariance(&mut params).is_success());
        for slot in 0..tree.dim() {
            assert!(params.cov()[(slot, slot)] > 0.0, "slot {slot}");
        }
        let head = tree.root();
        let pos = tree.pos_index(head).unwrap();
        assert_relative_eq!(params.cov()[(pos, pos)], 400.0);
    }
}

use std::fmt::Display;

use nalgebra::{DVector, SMatrix};

use crate::{
    fit::errcode::ErrCode,
    fit::node::{read_vec3, NodeKind},
    fit::projection::Projection,
    fit::tree::{DecayTree, ParticleId},
    utils::helix::{b_field_over_c, helix_from_vertex_jacobian, wrap_angle},
    utils::vectors::Vec4,
    Float,
};

/// The constraint types, declared in application-rank order: measurements
/// first (they stabilize the state), exact relations afterwards.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConstraintKind {
    /// Root position against the interaction region.
    Beamspot,
    /// Five measured helix rows plus the exact flight and energy rows.
    Track,
    /// Cluster direction and energy for a photon.
    Photon,
    /// Cluster direction and energy for a neutral kaon.
    Klong,
    /// Decay length against the PDG mean.
    Lifetime,
    /// Four-momentum conservation at a decay.
    Kinematic,
    /// Flight displacement between a decay vertex and its mother's.
    Geometric,
    /// Invariant mass pinned to the nominal value.
    Mass,
}

impl Display for ConstraintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConstraintKind::Beamspot => "beamspot",
            ConstraintKind::Track => "track",
            ConstraintKind::Photon => "photon",
            ConstraintKind::Klong => "klong",
            ConstraintKind::Lifetime => "lifetime",
            ConstraintKind::Kinematic => "kinematic",
            ConstraintKind::Geometric => "geometric",
            ConstraintKind::Mass => "mass",
        };
        write!(f, "{}", name)
    }
}

/// One registered constraint: the node it belongs to, its kind, the node's
/// depth in the tree (zero at the root, more negative further down) and the
/// number of rows it projects.
#[derive(Clone, Debug)]
pub struct Constraint {
    pub(crate) particle: ParticleId,
    pub(crate) kind: ConstraintKind,
    pub(crate) depth: i32,
    pub(crate) n_rows: usize,
}

impl Constraint {
    /// The node this constraint belongs to.
    pub fn particle(&self) -> ParticleId {
        self.particle
    }

    /// The constraint type.
    pub fn kind(&self) -> ConstraintKind {
        self.kind
    }

    /// The number of rows this constraint projects.
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }
}

impl<'a> DecayTree<'a> {
    /// Collect and order every constraint in the tree.
    ///
    /// The list is sorted by `(depth, kind)`, applying the innermost
    /// particles first by default so that inner vertices are settled before
    /// the quantities that depend on them; the direction flips with the
    /// configuration.
    pub(crate) fn constraints(&self) -> Vec<Constraint> {
        let mut list = Vec::new();
        self.add_constraints(self.root(), 0, &mut list);
        let innermost_first = self.config.innermost_first;
        list.sort_by_key(|constraint| {
            (
                if innermost_first {
                    constraint.depth
                } else {
                    -constraint.depth
                },
                constraint.kind,
            )
        });
        list
    }

    fn add_constraints(&self, id: ParticleId, depth: i32, list: &mut Vec<Constraint>) {
        for &daughter in &self.node(id).daughters {
            self.add_constraints(daughter, depth - 1, list);
        }
        let push = |list: &mut Vec<Constraint>, kind: ConstraintKind, n_rows: usize| {
            list.push(Constraint {
                particle: id,
                kind,
                depth,
                n_rows,
            })
        };
        let node = self.node(id);
        match node.kind {
            NodeKind::InteractionPoint | NodeKind::Origin => {
                push(list, ConstraintKind::Beamspot, 3)
            }
            NodeKind::InternalParticle {
                mass_constrained,
                lifetime_constrained,
            } => {
                let pdg_tau = node
                    .properties
                    .as_ref()
                    .and_then(|properties| properties.tau());
                if lifetime_constrained && self.tau_index(id).is_some() && pdg_tau.is_some() {
                    push(list, ConstraintKind::Lifetime, 1);
                }
                push(list, ConstraintKind::Kinematic, 4);
                if self.mothered(id) && self.tau_index(id).is_some() {
                    push(list, ConstraintKind::Geometric, 3);
                }
                if mass_constrained {
                    push(list, ConstraintKind::Mass, 1);
                }
            }
            NodeKind::Resonance { mass_constrained } => {
                push(list, ConstraintKind::Kinematic, 4);
                if mass_constrained {
                    push(list, ConstraintKind::Mass, 1);
                }
            }
            NodeKind::RecoTrack => push(list, ConstraintKind::Track, 7),
            NodeKind::RecoPhoton => push(list, ConstraintKind::Photon, 3),
            NodeKind::RecoKlong => push(list, ConstraintKind::Klong, 3),
            NodeKind::MissingParticle => {}
        }
    }

    /// Project one constraint at the given reference state.
    pub(crate) fn project_constraint(
        &self,
        constraint: &Constraint,
        par: &DVector<Float>,
        projection: &mut Projection,
    ) -> ErrCode {
        let id = constraint.particle;
        match constraint.kind {
            ConstraintKind::Beamspot => self.project_beamspot(id, par, projection),
            ConstraintKind::Track => self.project_track(id, par, projection),
            ConstraintKind::Photon | ConstraintKind::Klong => {
                self.project_cluster(id, par, projection)
            }
            ConstraintKind::Lifetime => self.project_lifetime(id, par, projection),
            ConstraintKind::Kinematic => self.project_kinematic(id, par, projection),
            ConstraintKind::Geometric => self.project_geometric(id, par, projection),
            ConstraintKind::Mass => self.project_mass(id, par, projection),
        }
    }

    /// Root position against the interaction region (or the loose origin
    /// prior when no beam spot is configured).
    fn project_beamspot(
        &self,
        id: ParticleId,
        par: &DVector<Float>,
        projection: &mut Projection,
    ) -> ErrCode {
        let pos = self.node(id).index;
        match &self.config.beam {
            Some(beam) => {
                for row in 0..3 {
                    projection.r[row] = par[pos + row] - beam.position[row];
                    projection.h[(row, pos + row)] = 1.0;
                    for col in 0..3 {
                        projection.v[(row, col)] = beam.covariance[row][col];
                    }
                }
            }
            None => {
                let width = self.config.origin_width * self.config.origin_width;
                for row in 0..3 {
                    projection.r[row] = par[pos + row];
                    projection.h[(row, pos + row)] = 1.0;
                    projection.v[(row, row)] = width;
                }
            }
        }
        ErrCode::OK
    }

    /// Four-momentum conservation: the node's momentum minus the sum of its
    /// daughters'. Daughters without an energy slot contribute
    /// `sqrt(p² + m²)`; charged flying composites with a resolvable sagitta
    /// are rotated back through the field from their decay vertex to this
    /// one.
    pub(crate) fn project_kinematic(
        &self,
        id: ParticleId,
        par: &DVector<Float>,
        projection: &mut Projection,
    ) -> ErrCode {
        let Some(mom) = self.mom_index(id) else {
            return ErrCode::INCONSISTENT;
        };
        for row in 0..4 {
            projection.r[row] = par[mom + row];
            projection.h[(row, mom + row)] = 1.0;
        }
        let a = b_field_over_c(self.config.magnetic_field);
        for &daughter in &self.node(id).daughters {
            let daughter_node = self.node(daughter);
            let dmom = self
                .mom_index(daughter)
                .expect("every daughter carries momentum");
            let p = read_vec3(par, dmom);
            let charge = self.charge_of(daughter);
            let lambda = a * charge as Float;
            let bending = if matches!(daughter_node.kind, NodeKind::InternalParticle { .. })
                && charge != 0
            {
                // the same sagitta switch as the flight rows
                self.tau_index(daughter).filter(|&tau_slot| {
                    let tau = par[tau_slot];
                    (p.perp() * lambda * tau * tau).abs() > self.config.geo_precision
                })
            } else {
                None
            };
            if let Some(tau_slot) = bending {
                let chi = lambda * par[tau_slot];
                let (sin_chi, cos_chi) = chi.sin_cos();
                projection.r[0] -= p.x() * cos_chi + p.y() * sin_chi;
                projection.r[1] -= p.y() * cos_chi - p.x() * sin_chi;
                projection.h[(0, dmom)] -= cos_chi;
                projection.h[(0, dmom + 1)] -= sin_chi;
                projection.h[(0, tau_slot)] +=
                    lambda * (p.x() * sin_chi - p.y() * cos_chi);
                projection.h[(1, dmom)] += sin_chi;
                projection.h[(1, dmom + 1)] -= cos_chi;
                projection.h[(1, tau_slot)] +=
                    lambda * (p.y() * sin_chi + p.x() * cos_chi);
            } else {
                projection.r[0] -= p.x();
                projection.r[1] -= p.y();
                projection.h[(0, dmom)] -= 1.0;
                projection.h[(1, dmom + 1)] -= 1.0;
            }
            projection.r[2] -= p.z();
            projection.h[(2, dmom + 2)] -= 1.0;
            match self.energy_index(daughter) {
                Some(energy) => {
                    projection.r[3] -= par[energy];
                    projection.h[(3, energy)] -= 1.0;
                }
                None => {
                    let energy = p.with_mass(self.mass_of(daughter)).e();
                    if energy <= 0.0 {
                        return ErrCode::DIVERGING_CONSTRAINT;
                    }
                    projection.r[3] -= energy;
                    for slot in 0..3 {
                        projection.h[(3, dmom + slot)] -= p.0[slot] / energy;
                    }
                }
            }
        }
        ErrCode::OK
    }

    /// Flight displacement between this vertex and the mother's: the exact
    /// helical arc when the transverse sagitta is resolvable, the straight
    /// line `tau·p` otherwise. The longitudinal row is always straight.
    fn project_geometric(
        &self,
        id: ParticleId,
        par: &DVector<Float>,
        projection: &mut Projection,
    ) -> ErrCode {
        let node = self.node(id);
        let pos = node.index;
        let Some(mother_pos) = node.mother.and_then(|mother| self.pos_index(mother)) else {
            return ErrCode::INCONSISTENT;
        };
        let Some(tau_slot) = self.tau_index(id) else {
            return ErrCode::INCONSISTENT;
        };
        let Some(mom) = self.mom_index(id) else {
            return ErrCode::INCONSISTENT;
        };
        let tau = par[tau_slot];
        let p = read_vec3(par, mom);
        for row in 0..3 {
            projection.r[row] = par[pos + row] - par[mother_pos + row];
            projection.h[(row, pos + row)] = 1.0;
            projection.h[(row, mother_pos + row)] = -1.0;
        }
        let charge = self.charge_of(id);
        let lambda = b_field_over_c(self.config.magnetic_field) * charge as Float;
        let curved =
            charge != 0 && (p.perp() * lambda * tau * tau).abs() > self.config.geo_precision;
        if curved {
            let chi = lambda * tau;
            let (sin_chi, cos_chi) = chi.sin_cos();
            projection.r[0] -= (p.x() * sin_chi + p.y() * (1.0 - cos_chi)) / lambda;
            projection.r[1] -= (p.y() * sin_chi - p.x() * (1.0 - cos_chi)) / lambda;
            projection.h[(0, mom)] = -sin_chi / lambda;
            projection.h[(0, mom + 1)] = -(1.0 - cos_chi) / lambda;
            projection.h[(0, tau_slot)] = -(p.x() * cos_chi + p.y() * sin_chi);
            projection.h[(1, mom)] = (1.0 - cos_chi) / lambda;
            projection.h[(1, mom + 1)] = -sin_chi / lambda;
            projection.h[(1, tau_slot)] = -(p.y() * cos_chi - p.x() * sin_chi);
        } else {
            projection.r[0] -= tau * p.x();
            projection.r[1] -= tau * p.y();
            projection.h[(0, mom)] = -tau;
            projection.h[(0, tau_slot)] = -p.x();
            projection.h[(1, mom + 1)] = -tau;
            projection.h[(1, tau_slot)] = -p.y();
        }
        projection.r[2] -= tau * p.z();
        projection.h[(2, mom + 2)] = -tau;
        projection.h[(2, tau_slot)] = -p.z();
        ErrCode::OK
    }

    /// Invariant mass pinned to the nominal value, either on the node's own
    /// four-momentum or on its daughters' sum.
    fn project_mass(
        &self,
        id: ParticleId,
        par: &DVector<Float>,
        projection: &mut Projection,
    ) -> ErrCode {
        use crate::config::MassConstraintMode;
        let mass = self.mass_of(id);
        let own_energy = self.energy_index(id).is_some();
        let particle_variant = match self.config.mass_constraint_mode {
            MassConstraintMode::Auto => own_energy,
            MassConstraintMode::Particle => true,
            MassConstraintMode::Daughters => false,
        };
        if particle_variant {
            let Some(mom) = self.mom_index(id) else {
                return ErrCode::INCONSISTENT;
            };
            let Some(energy_slot) = self.energy_index(id) else {
                return ErrCode::INCONSISTENT;
            };
            let p = read_vec3(par, mom);
            let energy = par[energy_slot];
            projection.r[0] = energy * energy - p.mag2() - mass * mass;
            projection.h[(0, energy_slot)] = 2.0 * energy;
            for slot in 0..3 {
                projection.h[(0, mom + slot)] = -2.0 * p.0[slot];
            }
        } else {
            let mut sum = Vec4::new(0.0, 0.0, 0.0, 0.0);
            for &daughter in &self.node(id).daughters {
                sum = sum + self.node_p4(par, daughter);
            }
            projection.r[0] = sum.e() * sum.e() - sum.vec3().mag2() - mass * mass;
            for &daughter in &self.node(id).daughters {
                let dmom = self
                    .mom_index(daughter)
                    .expect("every daughter carries momentum");
                let p = read_vec3(par, dmom);
                match self.energy_index(daughter) {
                    Some(energy_slot) => {
                        projection.h[(0, energy_slot)] += 2.0 * sum.e();
                        for slot in 0..3 {
                            projection.h[(0, dmom + slot)] += -2.0 * sum.0[slot];
                        }
                    }
                    None => {
                        let energy = p.with_mass(self.mass_of(daughter)).e();
                        if energy <= 0.0 {
                            return ErrCode::DIVERGING_CONSTRAINT;
                        }
                        for slot in 0..3 {
                            projection.h[(0, dmom + slot)] +=
                                2.0 * sum.e() * p.0[slot] / energy - 2.0 * sum.0[slot];
                        }
                    }
                }
            }
        }
        ErrCode::OK
    }

    /// Decay length against the PDG mean, weighted by the mean itself.
    fn project_lifetime(
        &self,
        id: ParticleId,
        par: &DVector<Float>,
        projection: &mut Projection,
    ) -> ErrCode {
        let Some(tau_slot) = self.tau_index(id) else {
            return ErrCode::INCONSISTENT;
        };
        let Some(pdg_tau) = self
            .node(id)
            .properties
            .as_ref()
            .and_then(|properties| properties.tau())
        else {
            return ErrCode::INCONSISTENT;
        };
        projection.r[0] = par[tau_slot] - pdg_tau;
        projection.h[(0, tau_slot)] = 1.0;
        projection.v[(0, 0)] = pdg_tau * pdg_tau;
        ErrCode::OK
    }

    /// The five measured helix rows, the exact flight row tying the decay
    /// length to the vertex-to-perigee arc, and the exact mass-shell energy
    /// row.
    fn project_track(
        &self,
        id: ParticleId,
        par: &DVector<Float>,
        projection: &mut Projection,
    ) -> ErrCode {
        let node = self.node(id);
        let Some(track) = node.candidate.and_then(|candidate| candidate.track.as_ref()) else {
            return ErrCode::INCONSISTENT;
        };
        let Some(mother_pos) = node.mother.and_then(|mother| self.pos_index(mother)) else {
            return ErrCode::INCONSISTENT;
        };
        let mom = node.index;
        let vertex = read_vec3(par, mother_pos);
        let momentum = read_vec3(par, mom);
        let (prediction, jacobian) = match helix_from_vertex_jacobian(
            vertex,
            momentum,
            track.charge,
            self.config.magnetic_field,
        ) {
            Ok(result) => result,
            Err(_) => return ErrCode::DIVERGING_CONSTRAINT,
        };
        let predicted = prediction.helix.to_array();
        let measured = track.helix;
        for row in 0..5 {
            let residual = predicted[row] - measured[row];
            projection.r[row] = if row == 1 { wrap_angle(residual) } else { residual };
            for slot in 0..3 {
                projection.h[(row, mother_pos + slot)] = jacobian[(row, slot)];
                projection.h[(row, mom + slot)] = jacobian[(row, 3 + slot)];
            }
            for col in 0..5 {
                projection.v[(row, col)] = track.covariance[row][col];
            }
        }
        // flight row: tau·|p| undoes the vertex-to-perigee arc
        let mag = momentum.mag();
        if mag <= 0.0 {
            return ErrCode::DIVERGING_CONSTRAINT;
        }
        let tau = par[mom + 4];
        projection.r[5] = tau * mag + prediction.flight_length;
        projection.h[(5, mom + 4)] = mag;
        for slot in 0..3 {
            projection.h[(5, mom + slot)] =
                tau * momentum.0[slot] / mag + jacobian[(5, 3 + slot)];
            projection.h[(5, mother_pos + slot)] = jacobian[(5, slot)];
        }
        // mass shell
        let energy = par[mom + 3];
        let mass = self.mass_of(id);
        projection.r[6] = energy * energy - momentum.mag2() - mass * mass;
        projection.h[(6, mom + 3)] = 2.0 * energy;
        for slot in 0..3 {
            projection.h[(6, mom + slot)] = -2.0 * momentum.0[slot];
        }
        ErrCode::OK
    }

    /// Cluster direction (two rows, reduced along the dominant momentum
    /// axis) and energy, with the measurement covariance propagated from
    /// the cluster's.
    fn project_cluster(
        &self,
        id: ParticleId,
        par: &DVector<Float>,
        projection: &mut Projection,
    ) -> ErrCode {
        let node = self.node(id);
        let Some(cluster) = node.candidate.and_then(|candidate| candidate.cluster.as_ref())
        else {
            return ErrCode::INCONSISTENT;
        };
        let Some(mother_pos) = node.mother.and_then(|mother| self.pos_index(mother)) else {
            return ErrCode::INCONSISTENT;
        };
        let mom = node.index;
        let p = read_vec3(par, mom);
        if p.mag2() <= 0.0 {
            return ErrCode::DIVERGING_CONSTRAINT;
        }
        let mass = self.mass_of(id);
        let energy = p.with_mass(mass).e();

        // the momentum axis with the largest component anchors the reduction
        let mut main = 0;
        for axis in 1..3 {
            if p.0[axis].abs() > p.0[main].abs() {
                main = axis;
            }
        }
        let others = match main {
            0 => [1, 2],
            1 => [0, 2],
            _ => [0, 1],
        };

        // residual derivatives with respect to the cluster measurement, for
        // the covariance propagation
        let mut cluster_jacobian = SMatrix::<Float, 3, 4>::zeros();
        for (row, &axis) in others.iter().enumerate() {
            let delta_axis = cluster.position[axis] - par[mother_pos + axis];
            let delta_main = cluster.position[main] - par[mother_pos + main];
            projection.r[row] = delta_axis * p.0[main] - delta_main * p.0[axis];
            projection.h[(row, mother_pos + axis)] = -p.0[main];
            projection.h[(row, mother_pos + main)] = p.0[axis];
            projection.h[(row, mom + main)] = delta_axis;
            projection.h[(row, mom + axis)] = -delta_main;
            cluster_jacobian[(row, axis)] = p.0[main];
            cluster_jacobian[(row, main)] = -p.0[axis];
        }
        projection.r[2] = energy - cluster.energy;
        for slot in 0..3 {
            projection.h[(2, mom + slot)] = p.0[slot] / energy;
        }
        cluster_jacobian[(2, 3)] = -1.0;

        let mut cluster_covariance = SMatrix::<Float, 4, 4>::zeros();
        for row in 0..4 {
            for col in 0..4 {
                cluster_covariance[(row, col)] = cluster.covariance[row][col];
            }
        }
        let v = cluster_jacobian * cluster_covariance * cluster_jacobian.transpose();
        for row in 0..3 {
            for col in 0..3 {
                projection.v[(row, col)] = v[(row, col)];
            }
        }
        ErrCode::OK
    }
}

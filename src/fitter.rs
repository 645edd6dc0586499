use log::{debug, error, warn};

use crate::{
    candidate::{Candidate, FitReport, FittedEntry},
    fit::{
        kalman, node::read_vec3, Constraint, ConstraintKind, DecayTree, ErrCode, FitParams,
        NodeKind, ParticleId, Projection,
    },
    utils::stats::chi_square_prob,
    FitConfig, FitError, FitResult, Float,
};

/// The iteration driver.
///
/// A [`TreeFitter`] owns one fit: the node tree built from a [`Candidate`],
/// the global state with its covariance, and the ordered constraint list.
/// [`TreeFitter::fit`] seeds the state, filters the constraints to
/// convergence and extracts a [`FitReport`].
pub struct TreeFitter<'a> {
    tree: DecayTree<'a>,
    params: FitParams,
    constraints: Vec<Constraint>,
    ndf: usize,
}

impl<'a> TreeFitter<'a> {
    /// Set up a fit for `head` under `config`.
    ///
    /// Builds the node tree, registers and orders the constraints and checks
    /// that the system is overdetermined. No fitting happens here.
    pub fn new(head: &'a Candidate, config: &'a FitConfig) -> FitResult<Self> {
        let tree = DecayTree::from_candidate(head, config)?;
        let constraints = tree.constraints();
        let rows: usize = constraints.iter().map(Constraint::n_rows).sum();
        let dim = tree.dim();
        if rows <= dim {
            return Err(FitError::InconsistentConstraint(format!(
                "{} constraint rows cannot determine {} parameters",
                rows, dim
            )));
        }
        let params = FitParams::new(dim);
        Ok(Self {
            tree,
            params,
            constraints,
            ndf: rows - dim,
        })
    }

    /// Number of degrees of freedom: constraint rows minus state parameters.
    pub fn ndf(&self) -> usize {
        self.ndf
    }

    /// The constraints in application order.
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Run the fit and extract the report.
    ///
    /// Every iteration starts from the state the previous one produced,
    /// resets the covariance to the loose priors and filters the constraints
    /// in order, linearized at the iteration's opening state. The fit has
    /// converged when the chi-square moves by less than the configured delta
    /// per degree of freedom; running out of iterations is an error, as is a
    /// non-finite state or an unsolvable gain system.
    pub fn fit(&mut self) -> FitResult<FitReport> {
        let config = self.tree.config;
        let seed_status = self.tree.init_parameters(&mut self.params);
        if seed_status.contains(ErrCode::BAD_INPUT) || seed_status.contains(ErrCode::BAD_SETUP) {
            error!("parameter seeding failed ({})", seed_status);
            return Err(FitError::BadInput(format!(
                "parameter seeding failed ({})",
                seed_status
            )));
        }
        let cov_status = self.tree.init_covariance(&mut self.params);
        if cov_status.is_failure() {
            warn!("covariance seeding fell back to loose priors ({})", cov_status);
        }

        let dim = self.tree.dim();
        let mut previous = 0.0;
        let mut iterations = 0;
        let mut converged = false;
        for iteration in 0..config.max_iterations {
            iterations = iteration + 1;
            if iteration > 0 {
                self.params.reset_covariance();
                self.tree.init_covariance(&mut self.params);
            }
            self.params.reset_chi_square();
            let reference = self.params.par().clone();
            for constraint in &self.constraints {
                let mut projection = Projection::new(constraint.n_rows(), dim);
                // the first pass has no previous state worth linearizing
                // around, so each constraint sees the latest seeds directly
                let local_reference = if iteration == 0 {
                    self.params.par().clone()
                } else {
                    reference.clone()
                };
                let status =
                    self.tree
                        .project_constraint(constraint, &local_reference, &mut projection);
                if status.is_failure() {
                    debug!(
                        "projection failed for the {} constraint of {} ({})",
                        constraint.kind(),
                        self.tree.node(constraint.particle()).name,
                        status
                    );
                    if status.contains(ErrCode::INCONSISTENT) {
                        return Err(FitError::InconsistentConstraint(format!(
                            "the {} constraint does not apply to {}",
                            constraint.kind(),
                            self.tree.node(constraint.particle()).name
                        )));
                    }
                    return Err(FitError::NonConverging {
                        iterations,
                        chi_square: self.params.chi_square(),
                    });
                }
                let status = kalman::filter(
                    &mut self.params,
                    &projection,
                    &local_reference,
                    constraint.particle(),
                    constraint.kind(),
                );
                if status.contains(ErrCode::INVERSION_ERROR) {
                    error!(
                        "gain factorization failed for the {} constraint of {}",
                        constraint.kind(),
                        self.tree.node(constraint.particle()).name
                    );
                    return Err(FitError::SingularMatrix(format!(
                        "gain factorization failed for the {} constraint of {}",
                        constraint.kind(),
                        self.tree.node(constraint.particle()).name
                    )));
                }
                if status.is_failure() {
                    return Err(FitError::NonConverging {
                        iterations,
                        chi_square: self.params.chi_square(),
                    });
                }
            }
            let chi_square = self.params.chi_square();
            debug!(
                "iteration {}: chi2 {:.6}, delta {:+.6}",
                iteration,
                chi_square,
                chi_square - previous
            );
            if !chi_square.is_finite() || !self.params.is_finite() {
                return Err(FitError::NonConverging {
                    iterations,
                    chi_square,
                });
            }
            if iteration > 0
                && (chi_square - previous).abs() < config.convergence_delta * self.ndf as Float
            {
                previous = chi_square;
                converged = true;
                break;
            }
            previous = chi_square;
        }
        if !converged {
            return Err(FitError::NonConverging {
                iterations,
                chi_square: previous,
            });
        }
        if self
            .constraints
            .iter()
            .any(|constraint| constraint.kind() == ConstraintKind::Mass)
        {
            // mass constraints act on the composite's own block; square the
            // books so every reported composite is exactly its daughters' sum
            self.tree.force_p4_sum(&mut self.params);
        }
        Ok(self.report(iterations))
    }

    fn report(&self, iterations: usize) -> FitReport {
        let chi_square = self.params.chi_square();
        let entries = self
            .tree
            .ids_preorder()
            .into_iter()
            .filter(|&id| self.tree.node(id).candidate.is_some())
            .map(|id| self.entry(id))
            .collect();
        let index_map = self
            .tree
            .ids_preorder()
            .into_iter()
            .map(|id| {
                let node = self.tree.node(id);
                (node.name.clone(), node.index, self.tree.dim_of(id))
            })
            .collect();
        FitReport {
            chi_square,
            ndf: self.ndf,
            p_value: chi_square_prob(chi_square, self.ndf),
            iterations,
            entries,
            index_map,
        }
    }

    fn entry(&self, id: ParticleId) -> FittedEntry {
        let node = self.tree.node(id);
        let par = self.params.par();
        let cov = self.params.cov();
        let vertex = self.tree.pos_index(id).map(|pos| read_vec3(par, pos));
        let vertex_covariance = self.tree.pos_index(id).map(|pos| {
            let mut block = [[0.0; 3]; 3];
            for row in 0..3 {
                for col in 0..3 {
                    block[row][col] = cov[(pos + row, pos + col)];
                }
            }
            block
        });
        let chi_square = self
            .tree
            .subtree_ids(id)
            .into_iter()
            .map(|descendant| self.params.node_chi_square(descendant))
            .sum();
        FittedEntry {
            path: node.path.clone(),
            name: node.name.clone(),
            p4: self.tree.node_p4(par, id),
            momentum_covariance: self.momentum_covariance(id),
            vertex,
            vertex_covariance,
            decay_length: self.decay_length(id),
            chi_square,
        }
    }

    /// The 4x4 momentum covariance, widening the 3x3 block of cluster-based
    /// kinds with the mass-shell energy derivative.
    fn momentum_covariance(&self, id: ParticleId) -> [[Float; 4]; 4] {
        let cov = self.params.cov();
        let mom = self
            .tree
            .mom_index(id)
            .expect("reported nodes carry momentum");
        let mut block = [[0.0; 4]; 4];
        if self.tree.energy_index(id).is_some() {
            for row in 0..4 {
                for col in 0..4 {
                    block[row][col] = cov[(mom + row, mom + col)];
                }
            }
            return block;
        }
        let par = self.params.par();
        let p = read_vec3(par, mom);
        let energy = self.tree.node_p4(par, id).e();
        for row in 0..3 {
            for col in 0..3 {
                block[row][col] = cov[(mom + row, mom + col)];
            }
        }
        if energy <= 0.0 {
            return block;
        }
        let grad = [p.x() / energy, p.y() / energy, p.z() / energy];
        for row in 0..3 {
            let mut cross = 0.0;
            for col in 0..3 {
                cross += grad[col] * cov[(mom + col, mom + row)];
            }
            block[3][row] = cross;
            block[row][3] = cross;
        }
        let mut variance = 0.0;
        for row in 0..3 {
            for col in 0..3 {
                variance += grad[row] * cov[(mom + row, mom + col)] * grad[col];
            }
        }
        block[3][3] = variance;
        block
    }

    /// Flight distance `tau * |p|` and its variance, for mothered composites
    /// with their own vertex.
    fn decay_length(&self, id: ParticleId) -> Option<(Float, Float)> {
        let node = self.tree.node(id);
        if !matches!(node.kind, NodeKind::InternalParticle { .. }) || !self.tree.mothered(id) {
            return None;
        }
        let tau_slot = self.tree.tau_index(id)?;
        let mom = self.tree.mom_index(id)?;
        let par = self.params.par();
        let cov = self.params.cov();
        let tau = par[tau_slot];
        let p = read_vec3(par, mom);
        let mag = p.mag();
        if mag <= 0.0 {
            return None;
        }
        let slots = [tau_slot, mom, mom + 1, mom + 2];
        let grads = [mag, tau * p.x() / mag, tau * p.y() / mag, tau * p.z() / mag];
        let mut variance = 0.0;
        for (row, &slot_row) in slots.iter().enumerate() {
            for (col, &slot_col) in slots.iter().enumerate() {
                variance += grads[row] * cov[(slot_row, slot_col)] * grads[col];
            }
        }
        Some((tau * mag, variance))
    }
}

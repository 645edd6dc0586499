use crate::{
    candidate::Candidate,
    config::FitConfig,
    fit::node::NodeKind,
    pdg::ParticleProperties,
    FitError, FitResult, Float,
};

/// A stable handle to a node in a [`DecayTree`] arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticleId(pub(crate) usize);

/// One node of the fit tree.
///
/// Daughters are owned through arena ids; `mother` is a plain non-owning
/// back-link. `index` is the first slot of this node's parameter block in
/// the global state, assigned by [`DecayTree::update_index`].
#[derive(Clone, Debug)]
pub(crate) struct ParticleNode<'a> {
    /// The candidate this node was built from; [`None`] for a generated
    /// origin node.
    pub(crate) candidate: Option<&'a Candidate>,
    /// Daughter-index path from the head candidate.
    pub(crate) path: Vec<usize>,
    /// The report label.
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) properties: Option<ParticleProperties>,
    pub(crate) mother: Option<ParticleId>,
    pub(crate) daughters: Vec<ParticleId>,
    pub(crate) index: usize,
}

/// The arena-backed decay tree a fit runs over.
///
/// Built once per fit from a [`Candidate`] tree; the node set is fixed after
/// setup apart from [`DecayTree::remove_daughter`], which detaches a subtree
/// before indexing. All traversals start from the root, so detached slots
/// are simply never visited.
#[derive(Clone, Debug)]
pub struct DecayTree<'a> {
    nodes: Vec<ParticleNode<'a>>,
    root: ParticleId,
    pub(crate) config: &'a FitConfig,
    dim: usize,
}

impl<'a> DecayTree<'a> {
    /// Build the fit tree for `head`.
    ///
    /// When the configuration asks for an interaction-point constraint the
    /// head is wrapped in a generated origin node (an [`NodeKind::InteractionPoint`]
    /// if a beam spot is configured, a loose [`NodeKind::Origin`] otherwise);
    /// the head is then a mothered composite. Unknown PDG codes and
    /// chargeless tracks are rejected here.
    pub(crate) fn from_candidate(head: &'a Candidate, config: &'a FitConfig) -> FitResult<Self> {
        let mut tree = Self {
            nodes: Vec::new(),
            root: ParticleId(0),
            config,
            dim: 0,
        };
        if config.ip_constraint {
            let kind = if config.beam.is_some() {
                NodeKind::InteractionPoint
            } else {
                NodeKind::Origin
            };
            let name = match kind {
                NodeKind::InteractionPoint => "ip",
                _ => "origin",
            };
            let origin = tree.push(ParticleNode {
                candidate: None,
                path: Vec::new(),
                name: name.to_string(),
                kind,
                properties: None,
                mother: None,
                daughters: Vec::new(),
                index: 0,
            });
            let head_id = tree.add_candidate(head, Some(origin), Vec::new())?;
            tree.nodes[origin.0].daughters.push(head_id);
            tree.root = origin;
        } else {
            tree.root = tree.add_candidate(head, None, Vec::new())?;
        }
        if !tree.nodes[tree.root.0].kind.has_position() {
            return Err(FitError::BadInput(
                "the head of a decay tree must be a composite with a decay vertex".to_string(),
            ));
        }
        tree.update_index();
        Ok(tree)
    }

    fn push(&mut self, node: ParticleNode<'a>) -> ParticleId {
        let id = ParticleId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    fn add_candidate(
        &mut self,
        candidate: &'a Candidate,
        mother: Option<ParticleId>,
        path: Vec<usize>,
    ) -> FitResult<ParticleId> {
        let properties = ParticleProperties::from_pdg_code(candidate.pdg_code).ok_or_else(
            || FitError::BadInput(format!("unknown PDG code {}", candidate.pdg_code)),
        )?;
        let kind = self.classify(candidate, &properties, mother.is_some())?;
        let name = candidate
            .name
            .clone()
            .unwrap_or_else(|| properties.name.to_string());
        let id = self.push(ParticleNode {
            candidate: Some(candidate),
            path: path.clone(),
            name,
            kind,
            properties: Some(properties),
            mother,
            daughters: Vec::new(),
            index: 0,
        });
        for (position, daughter) in candidate.daughters.iter().enumerate() {
            let mut daughter_path = path.clone();
            daughter_path.push(position);
            let daughter_id = self.add_candidate(daughter, Some(id), daughter_path)?;
            self.nodes[id.0].daughters.push(daughter_id);
        }
        Ok(id)
    }

    /// The factory rule choosing each node's concrete kind, applied exactly
    /// once at build time.
    fn classify(
        &self,
        candidate: &Candidate,
        properties: &ParticleProperties,
        mothered: bool,
    ) -> FitResult<NodeKind> {
        if let Some(track) = &candidate.track {
            if track.charge == 0 {
                return Err(FitError::BadInput(format!(
                    "track-based candidate {} has zero charge",
                    candidate.pdg_code
                )));
            }
            return Ok(NodeKind::RecoTrack);
        }
        if candidate.cluster.is_some() {
            return Ok(if properties.mass == 0.0 {
                NodeKind::RecoPhoton
            } else {
                NodeKind::RecoKlong
            });
        }
        if candidate.is_composite() {
            let mass_constrained = self.config.mass_constrained(candidate.pdg_code);
            if mothered && properties.decays_promptly(self.config.resonance_threshold) {
                return Ok(NodeKind::Resonance { mass_constrained });
            }
            return Ok(NodeKind::InternalParticle {
                mass_constrained,
                lifetime_constrained: self.config.lifetime_constrained(candidate.pdg_code),
            });
        }
        Ok(NodeKind::MissingParticle)
    }

    /// Assign every reachable node its parameter block, daughters first, so
    /// the innermost particles take the lowest indices. Idempotent.
    pub(crate) fn update_index(&mut self) {
        let mut offset = 0;
        self.assign_index(self.root, &mut offset);
        self.dim = offset;
    }

    fn assign_index(&mut self, id: ParticleId, offset: &mut usize) {
        for daughter in self.nodes[id.0].daughters.clone() {
            self.assign_index(daughter, offset);
        }
        let dim = self.dim_of(id);
        let node = &mut self.nodes[id.0];
        node.index = *offset;
        *offset += dim;
    }

    /// The total state dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The root node (the generated origin if one was requested, otherwise
    /// the head candidate).
    pub(crate) fn root(&self) -> ParticleId {
        self.root
    }

    pub(crate) fn node(&self, id: ParticleId) -> &ParticleNode<'a> {
        &self.nodes[id.0]
    }

    pub(crate) fn mothered(&self, id: ParticleId) -> bool {
        self.nodes[id.0].mother.is_some()
    }

    /// The nominal mass of the node's hypothesis (zero for origin nodes).
    pub(crate) fn mass_of(&self, id: ParticleId) -> Float {
        self.nodes[id.0]
            .properties
            .as_ref()
            .map_or(0.0, |properties| properties.mass)
    }

    /// The hypothesis charge in units of the elementary charge.
    pub(crate) fn charge_of(&self, id: ParticleId) -> i32 {
        self.nodes[id.0]
            .properties
            .as_ref()
            .map_or(0, |properties| properties.charge)
    }

    /// This node's parameter count.
    pub(crate) fn dim_of(&self, id: ParticleId) -> usize {
        let node = &self.nodes[id.0];
        node.kind.dim(node.mother.is_some())
    }

    /// First index of the position block, following a resonance up to the
    /// vertex it shares with its mother.
    pub(crate) fn pos_index(&self, id: ParticleId) -> Option<usize> {
        let node = &self.nodes[id.0];
        match node.kind {
            NodeKind::InteractionPoint | NodeKind::Origin | NodeKind::InternalParticle { .. } => {
                Some(node.index)
            }
            NodeKind::Resonance { .. } => node.mother.and_then(|mother| self.pos_index(mother)),
            _ => None,
        }
    }

    /// Index of the decay length parameter, if the node has one.
    pub(crate) fn tau_index(&self, id: ParticleId) -> Option<usize> {
        let node = &self.nodes[id.0];
        match node.kind {
            NodeKind::InternalParticle { .. } if node.mother.is_some() => Some(node.index + 3),
            NodeKind::RecoTrack => Some(node.index + 4),
            _ => None,
        }
    }

    /// First index of the momentum block.
    pub(crate) fn mom_index(&self, id: ParticleId) -> Option<usize> {
        let node = &self.nodes[id.0];
        match node.kind {
            NodeKind::InternalParticle { .. } => {
                Some(node.index + if node.mother.is_some() { 4 } else { 3 })
            }
            NodeKind::Resonance { .. }
            | NodeKind::RecoTrack
            | NodeKind::RecoPhoton
            | NodeKind::RecoKlong
            | NodeKind::MissingParticle => Some(node.index),
            NodeKind::InteractionPoint | NodeKind::Origin => None,
        }
    }

    /// Index of the energy parameter, for kinds that carry one.
    pub(crate) fn energy_index(&self, id: ParticleId) -> Option<usize> {
        if self.nodes[id.0].kind.has_energy() {
            self.mom_index(id).map(|index| index + 3)
        } else {
            None
        }
    }

    /// Reachable node ids, mothers before daughters.
    pub(crate) fn ids_preorder(&self) -> Vec<ParticleId> {
        let mut ids = Vec::with_capacity(self.nodes.len());
        self.collect_preorder(self.root, &mut ids);
        ids
    }

    fn collect_preorder(&self, id: ParticleId, ids: &mut Vec<ParticleId>) {
        ids.push(id);
        for &daughter in &self.nodes[id.0].daughters {
            self.collect_preorder(daughter, ids);
        }
    }

    /// The node and all of its reachable descendants.
    pub(crate) fn subtree_ids(&self, id: ParticleId) -> Vec<ParticleId> {
        let mut ids = Vec::new();
        self.collect_preorder(id, &mut ids);
        ids
    }

    /// The daughters sharing this node's decay vertex: direct daughters,
    /// with resonances replaced by their own daughters recursively.
    pub(crate) fn vertex_daughters(&self, id: ParticleId) -> Vec<ParticleId> {
        let mut ids = Vec::new();
        self.collect_vertex_daughters(id, &mut ids);
        ids
    }

    fn collect_vertex_daughters(&self, id: ParticleId, ids: &mut Vec<ParticleId>) {
        for &daughter in &self.nodes[id.0].daughters {
            if matches!(self.nodes[daughter.0].kind, NodeKind::Resonance { .. }) {
                self.collect_vertex_daughters(daughter, ids);
            } else {
                ids.push(daughter);
            }
        }
    }

    /// The number of track-based final states below (and including) `id`.
    pub(crate) fn n_final_charged_candidates(&self, id: ParticleId) -> usize {
        let node = &self.nodes[id.0];
        match node.kind {
            NodeKind::RecoTrack => 1,
            _ => node
                .daughters
                .iter()
                .map(|&daughter| self.n_final_charged_candidates(daughter))
                .sum(),
        }
    }

    /// Detach `daughter` (and its subtree) from `mother` before the fit is
    /// set up. The arena slots stay allocated but become unreachable;
    /// callers must re-run [`DecayTree::update_index`] afterwards.
    pub(crate) fn remove_daughter(&mut self, mother: ParticleId, daughter: ParticleId) {
        self.nodes[mother.0]
            .daughters
            .retain(|&existing| existing != daughter);
        self.nodes[daughter.0].mother = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::TrackMeasurement;
    use crate::utils::vectors::Vec4;

    fn track(pdg_code: i32, p: [Float; 3], mass: Float, charge: i32) -> Candidate {
        Candidate::new(pdg_code, Vec4::from_momentum(p, mass))
            .with_track(TrackMeasurement::new([0.0; 5], [[1e-6; 5]; 5], charge))
    }

    fn two_track_b() -> Candidate {
        Candidate::composite(
            511,
            vec![
                track(321, [0.7, 0.1, 0.3], 0.493677, 1),
                track(-211, [-0.4, 0.2, 0.1], 0.13957039, -1),
            ],
        )
    }

    #[test]
    fn motherless_head_layout() {
        let config = FitConfig::default();
        let b0 = two_track_b();
        let tree = DecayTree::from_candidate(&b0, &config).unwrap();
        // daughters first: kaon block, pion block, then the head
        assert_eq!(tree.dim(), 17);
        let ids = tree.ids_preorder();
        assert_eq!(ids.len(), 3);
        let head = tree.root();
        assert_eq!(tree.dim_of(head), 7);
        assert_eq!(tree.node(head).index, 10);
        assert_eq!(tree.node(ids[1]).index, 0);
        assert_eq!(tree.node(ids[2]).index, 5);
        assert_eq!(tree.n_final_charged_candidates(head), 2);
        assert_eq!(tree.pos_index(head), Some(10));
        assert_eq!(tree.tau_index(head), None);
        assert_eq!(tree.mom_index(head), Some(13));
        assert_eq!(tree.energy_index(head), Some(16));
        assert_eq!(tree.tau_index(ids[1]), Some(4));
    }

    #[test]
    fn origin_rooted_layout() {
        let config = FitConfig {
            ip_constraint: true,
            ..Default::default()
        };
        let b0 = two_track_b();
        let tree = DecayTree::from_candidate(&b0, &config).unwrap();
        // 5 + 5 + 8 (mothered head gains a decay length) + 3 for the origin
        assert_eq!(tree.dim(), 21);
        let root = tree.root();
        assert!(matches!(tree.node(root).kind, NodeKind::Origin));
        assert!(tree.node(root).candidate.is_none());
        let head = tree.node(root).daughters[0];
        assert_eq!(tree.dim_of(head), 8);
        assert_eq!(tree.tau_index(head), Some(tree.node(head).index + 3));
        assert_eq!(tree.node(root).index, 18);
    }

    #[test]
    fn index_ranges_tile_the_state() {
        let config = FitConfig {
            ip_constraint: true,
            ..Default::default()
        };
        let b0 = two_track_b();
        let mut tree = DecayTree::from_candidate(&b0, &config).unwrap();
        let mut covered = vec![false; tree.dim()];
        for id in tree.ids_preorder() {
            let node = tree.node(id);
            for slot in node.index..node.index + tree.dim_of(id) {
                assert!(!covered[slot]);
                covered[slot] = true;
            }
        }
        assert!(covered.iter().all(|&slot| slot));
        // re-indexing changes nothing
        let before: Vec<usize> = tree.ids_preorder().iter().map(|&id| tree.node(id).index).collect();
        tree.update_index();
        let after: Vec<usize> = tree.ids_preorder().iter().map(|&id| tree.node(id).index).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn tree_shape_back_links() {
        let config = FitConfig::default();
        let b0 = two_track_b();
        let tree = DecayTree::from_candidate(&b0, &config).unwrap();
        let mut motherless = 0;
        for id in tree.ids_preorder() {
            match tree.node(id).mother {
                None => motherless += 1,
                Some(mother) => assert!(tree.node(mother).daughters.contains(&id)),
            }
            for &daughter in &tree.node(id).daughters {
                assert_eq!(tree.node(daughter).mother, Some(id));
            }
        }
        assert_eq!(motherless, 1);
    }

    #[test]
    fn prompt_composites_become_resonances() {
        let config = FitConfig::default();
        let dstar = Candidate::composite(
            413,
            vec![
                Candidate::composite(
                    421,
                    vec![
                        track(321, [0.7, 0.1, 0.3], 0.493677, 1),
                        track(-211, [-0.4, 0.2, 0.1], 0.13957039, -1),
                    ],
                ),
                track(211, [0.1, 0.05, 0.02], 0.13957039, 1),
            ],
        );
        let b0 = Candidate::composite(511, vec![dstar, track(-211, [-0.2, 0.3, 0.1], 0.13957039, -1)]);
        let tree = DecayTree::from_candidate(&b0, &config).unwrap();
        let ids = tree.ids_preorder();
        let dstar_id = ids[1];
        assert!(matches!(
            tree.node(dstar_id).kind,
            NodeKind::Resonance { .. }
        ));
        assert_eq!(tree.dim_of(dstar_id), 4);
        // the resonance decays at the head vertex
        assert_eq!(tree.pos_index(dstar_id), tree.pos_index(tree.root()));
        // but the D0 below it is long-lived enough for its own vertex
        let d0_id = ids[2];
        assert!(matches!(
            tree.node(d0_id).kind,
            NodeKind::InternalParticle { .. }
        ));
        assert_eq!(tree.dim_of(d0_id), 8);
        assert_eq!(tree.n_final_charged_candidates(tree.root()), 4);
        // vertex daughters of the head skip through the resonance
        let vertex_daughters = tree.vertex_daughters(tree.root());
        assert_eq!(vertex_daughters.len(), 3);
    }

    #[test]
    fn bad_inputs_are_rejected() {
        let config = FitConfig::default();
        let unknown = Candidate::new(123_456, Vec4::from_momentum([0.1, 0.0, 0.0], 1.0));
        assert!(DecayTree::from_candidate(&unknown, &config).is_err());
        let chargeless = Candidate::new(321, Vec4::from_momentum([0.1, 0.0, 0.0], 0.493677))
            .with_track(TrackMeasurement::new([0.0; 5], [[1e-6; 5]; 5], 0));
        let b0 = Candidate::composite(511, vec![chargeless]);
        assert!(DecayTree::from_candidate(&b0, &config).is_err());
    }

    #[test]
    fn bare_final_state_heads_are_rejected() {
        let config = FitConfig::default();
        let bare = track(321, [0.7, 0.1, 0.3], 0.493677, 1);
        assert!(matches!(
            DecayTree::from_candidate(&bare, &config),
            Err(FitError::BadInput(_))
        ));
        // wrapped under a generated origin the same track is fittable
        let wrapped = FitConfig {
            ip_constraint: true,
            ..Default::default()
        };
        let tree = DecayTree::from_candidate(&bare, &wrapped).unwrap();
        assert_eq!(tree.dim(), 8);
    }

    #[test]
    fn detached_subtrees_vanish_from_traversals() {
        let config = FitConfig::default();
        let b0 = two_track_b();
        let mut tree = DecayTree::from_candidate(&b0, &config).unwrap();
        let head = tree.root();
        let pion = tree.node(head).daughters[1];
        tree.remove_daughter(head, pion);
        tree.update_index();
        assert_eq!(tree.ids_preorder().len(), 2);
        assert_eq!(tree.dim(), 12);
        assert_eq!(tree.n_final_charged_candidates(head), 1);
    }
}

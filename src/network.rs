use crate::config::Config;
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeRecord};
use crate::objective::plogp;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhysicalNode {
    pub name: Option<String>,
    pub teleport_weight: Option<f64>,
    /// Precomputed flow for first-order networks.
    pub flow: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateNode {
    pub physical_id: u32,
    pub layer_id: Option<u32>,
    pub flow: Option<f64>,
}

/// Input network: physical nodes, optional state nodes and weighted links.
///
/// First-order networks only use physical ids; link endpoints are created on
/// demand. Once a state node is declared every link endpoint must be a state
/// node. Multilayer input is stored per layer and expanded into state links
/// when the network is compiled.
#[derive(Debug, Clone, Default)]
pub struct Network {
    physical: BTreeMap<u32, PhysicalNode>,
    states: BTreeMap<u32, StateNode>,
    links: BTreeMap<(u32, u32), f64>,
    meta: BTreeMap<u32, u32>,
    bipartite_start_id: Option<u32>,
    // (layer, physical) -> state id
    layer_nodes: BTreeMap<(u32, u32), u32>,
    // (layer, source, target) -> weight
    intra_links: BTreeMap<(u32, u32, u32), f64>,
    // (source layer, node, target layer) -> weight
    inter_links: BTreeMap<(u32, u32, u32), f64>,
}

fn check_weight(field: impl FnOnce() -> String, weight: f64) -> Result<()> {
    if !weight.is_finite() || weight < 0.0 {
        return Err(Error::input(
            field(),
            format!("weight must be finite and non-negative, got {weight}"),
        ));
    }
    Ok(())
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: u32) -> &mut PhysicalNode {
        self.physical.entry(id).or_default()
    }

    pub fn add_named_node(&mut self, id: u32, name: impl Into<String>) -> &mut PhysicalNode {
        let node = self.add_node(id);
        node.name = Some(name.into());
        node
    }

    pub fn set_node_teleport_weight(&mut self, id: u32, weight: f64) -> Result<()> {
        check_weight(|| format!("node {id} teleport weight"), weight)?;
        self.add_node(id).teleport_weight = Some(weight);
        Ok(())
    }

    /// Sets precomputed flow on a state node if one exists with this id,
    /// otherwise on the physical node.
    pub fn set_node_flow(&mut self, id: u32, flow: f64) -> Result<()> {
        check_weight(|| format!("node {id} flow"), flow)?;
        if let Some(state) = self.states.get_mut(&id) {
            state.flow = Some(flow);
        } else {
            self.add_node(id).flow = Some(flow);
        }
        Ok(())
    }

    /// Binds a state node to its physical node, turning this into a
    /// higher-order network.
    pub fn add_state_node(&mut self, state_id: u32, physical_id: u32) -> Result<()> {
        if let Some(existing) = self.states.get(&state_id) {
            if existing.physical_id != physical_id {
                return Err(Error::input(
                    format!("state node {state_id}"),
                    format!(
                        "already bound to physical node {}, cannot rebind to {physical_id}",
                        existing.physical_id
                    ),
                ));
            }
            return Ok(());
        }
        self.add_node(physical_id);
        self.states.insert(
            state_id,
            StateNode {
                physical_id,
                layer_id: None,
                flow: None,
            },
        );
        Ok(())
    }

    /// Adds weight to the link `source -> target`. Zero weights are ignored.
    pub fn add_link(&mut self, source: u32, target: u32, weight: f64) -> Result<()> {
        check_weight(|| format!("link {source} -> {target}"), weight)?;
        if weight == 0.0 {
            return Ok(());
        }
        *self.links.entry((source, target)).or_insert(0.0) += weight;
        Ok(())
    }

    /// Removes a link and returns its aggregated weight.
    pub fn remove_link(&mut self, source: u32, target: u32) -> Option<f64> {
        self.links.remove(&(source, target))
    }

    pub fn set_meta_data(&mut self, physical_id: u32, category: u32) {
        self.meta.insert(physical_id, category);
    }

    /// Node ids at or above `start_id` are feature nodes of a bipartite network.
    pub fn set_bipartite_start_id(&mut self, start_id: u32) {
        self.bipartite_start_id = Some(start_id);
    }

    /// Returns the state id of `(layer, node)`, creating it on first use.
    /// New ids follow the largest state id in use.
    pub fn add_multilayer_node(&mut self, layer: u32, node: u32) -> u32 {
        if let Some(&state_id) = self.layer_nodes.get(&(layer, node)) {
            return state_id;
        }
        let state_id = self.states.keys().next_back().map_or(0, |&last| last + 1);
        self.layer_nodes.insert((layer, node), state_id);
        self.physical.entry(node).or_default();
        self.states.insert(
            state_id,
            StateNode {
                physical_id: node,
                layer_id: Some(layer),
                flow: None,
            },
        );
        state_id
    }

    pub fn add_multilayer_intra_link(
        &mut self,
        layer: u32,
        source: u32,
        target: u32,
        weight: f64,
    ) -> Result<()> {
        check_weight(
            || format!("intra link {source} -> {target} in layer {layer}"),
            weight,
        )?;
        if weight == 0.0 {
            return Ok(());
        }
        self.add_multilayer_node(layer, source);
        self.add_multilayer_node(layer, target);
        *self.intra_links.entry((layer, source, target)).or_insert(0.0) += weight;
        Ok(())
    }

    /// Inter-layer link from `(source_layer, node)` into `target_layer`; it is
    /// spread over the out-links of `node` in the target layer.
    pub fn add_multilayer_inter_link(
        &mut self,
        source_layer: u32,
        node: u32,
        target_layer: u32,
        weight: f64,
    ) -> Result<()> {
        check_weight(
            || format!("inter link ({source_layer}, {node}) -> layer {target_layer}"),
            weight,
        )?;
        if weight == 0.0 {
            return Ok(());
        }
        self.add_multilayer_node(source_layer, node);
        *self
            .inter_links
            .entry((source_layer, node, target_layer))
            .or_insert(0.0) += weight;
        Ok(())
    }

    pub fn multilayer_state_id(&self, layer: u32, node: u32) -> Option<u32> {
        self.layer_nodes.get(&(layer, node)).copied()
    }

    pub fn physical_node(&self, id: u32) -> Option<&PhysicalNode> {
        self.physical.get(&id)
    }

    pub fn state_node(&self, id: u32) -> Option<&StateNode> {
        self.states.get(&id)
    }

    pub fn links(&self) -> impl Iterator<Item = (u32, u32, f64)> + '_ {
        self.links.iter().map(|(&(s, t), &w)| (s, t, w))
    }

    pub fn link_count(&self) -> usize {
        self.links.len() + self.intra_links.len()
    }

    #[inline]
    pub fn is_multilayer(&self) -> bool {
        !self.layer_nodes.is_empty()
    }

    #[inline]
    pub fn is_state_network(&self) -> bool {
        !self.states.is_empty()
    }

    pub fn has_inter_layer_links(&self) -> bool {
        !self.inter_links.is_empty()
    }

    pub fn bipartite_start_id(&self) -> Option<u32> {
        self.bipartite_start_id
    }

    /// Ids of the nodes that become leaves: state ids, or physical ids plus
    /// link endpoints for first-order input.
    pub fn node_ids(&self) -> BTreeSet<u32> {
        if self.is_state_network() {
            return self.states.keys().copied().collect();
        }
        let mut ids: BTreeSet<u32> = self.physical.keys().copied().collect();
        for &(s, t) in self.links.keys() {
            ids.insert(s);
            ids.insert(t);
        }
        ids
    }

    pub fn node_count(&self) -> usize {
        self.node_ids().len()
    }

    pub fn contains_state_node(&self, id: u32) -> bool {
        if self.is_state_network() {
            self.states.contains_key(&id)
        } else {
            self.physical.contains_key(&id)
                || self.links.keys().any(|&(s, t)| s == id || t == id)
        }
    }

    pub fn first_node_without_flow(&self) -> Option<u32> {
        if self.is_state_network() {
            return self
                .states
                .iter()
                .find(|(_, state)| state.flow.is_none())
                .map(|(&id, _)| id);
        }
        self.node_ids().into_iter().find(|id| {
            self.physical
                .get(id)
                .map_or(true, |node| node.flow.is_none())
        })
    }

    /// Structural checks on the input, independent of any options.
    pub fn validate(&self) -> Result<()> {
        if self.is_multilayer() && !self.links.is_empty() {
            return Err(Error::input(
                "links",
                "plain links cannot be mixed with multilayer links",
            ));
        }

        if self.is_multilayer() {
            if let Some((&id, _)) = self.states.iter().find(|(_, state)| state.layer_id.is_none()) {
                return Err(Error::input(
                    format!("state node {id}"),
                    "plain state nodes cannot be mixed with multilayer nodes",
                ));
            }
        }

        if self.is_state_network() {
            for &(s, t) in self.links.keys() {
                for id in [s, t] {
                    if !self.states.contains_key(&id) {
                        return Err(Error::input(
                            format!("link {s} -> {t}"),
                            format!("state node {id} is not bound to a physical node"),
                        ));
                    }
                }
            }
        }

        for &physical_id in self.meta.keys() {
            let known = if self.is_state_network() {
                self.physical.contains_key(&physical_id)
            } else {
                self.contains_state_node(physical_id)
            };
            if !known {
                return Err(Error::input(
                    format!("meta data for node {physical_id}"),
                    "no such physical node",
                ));
            }
        }

        if let Some(start) = self.bipartite_start_id {
            let ids = self.physical_ids_in_use();
            let has_feature = ids.iter().any(|&id| id >= start);
            let has_ordinary = ids.iter().any(|&id| id < start);
            if !has_feature || !has_ordinary {
                return Err(Error::input(
                    "bipartite_start_id",
                    format!(
                        "start id {start} does not split the nodes into two non-empty sets"
                    ),
                ));
            }
        }

        Ok(())
    }

    fn physical_ids_in_use(&self) -> BTreeSet<u32> {
        if self.is_state_network() {
            self.states.values().map(|s| s.physical_id).collect()
        } else {
            self.node_ids()
        }
    }

    /// Builds the compact graph the flow model and optimizer run on.
    pub fn compile(&self, config: &Config) -> Result<Graph> {
        config.validate_for(self)?;
        self.validate()?;

        let ids: Vec<u32> = self.node_ids().into_iter().collect();
        let mut nodes = Vec::with_capacity(ids.len());
        for &id in &ids {
            let (physical_id, layer_id, state_flow) = match self.states.get(&id) {
                Some(state) => (state.physical_id, state.layer_id, state.flow),
                None => (id, None, None),
            };
            let physical = self.physical.get(&physical_id);
            let precomputed_flow = if self.is_state_network() {
                state_flow
            } else {
                physical.and_then(|p| p.flow)
            };
            nodes.push(NodeRecord {
                id,
                physical_id,
                layer_id,
                name: physical.and_then(|p| p.name.clone()),
                teleport_weight: physical.and_then(|p| p.teleport_weight).unwrap_or(1.0),
                precomputed_flow,
                meta: self.meta.get(&physical_id).copied(),
                is_feature: self
                    .bipartite_start_id
                    .is_some_and(|start| physical_id >= start),
                data: Default::default(),
            });
        }

        let raw_links = if self.is_multilayer() {
            self.expand_multilayer(config)
        } else {
            self.links.iter().map(|(&(s, t), &w)| (s, t, w)).collect()
        };

        let mut index_of: FxHashMap<u32, u32> = FxHashMap::default();
        index_of.reserve(ids.len());
        for (idx, &id) in ids.iter().enumerate() {
            index_of.insert(id, idx as u32);
        }

        let mut links = Vec::with_capacity(raw_links.len());
        for (s, t, w) in raw_links {
            if s == t && !config.include_self_links {
                continue;
            }
            let (Some(&si), Some(&ti)) = (index_of.get(&s), index_of.get(&t)) else {
                return Err(Error::input(
                    format!("link {s} -> {t}"),
                    "endpoint is not a node of the network",
                ));
            };
            links.push((si, ti, w));
        }

        Ok(Graph::from_links(
            nodes,
            links,
            self.bipartite_start_id,
        ))
    }

    /// Out-link maps per layer: layer -> node -> [(target, weight)].
    fn layer_out_links(&self, symmetric: bool) -> BTreeMap<u32, BTreeMap<u32, Vec<(u32, f64)>>> {
        let mut out: BTreeMap<u32, BTreeMap<u32, Vec<(u32, f64)>>> = BTreeMap::new();
        for (&(layer, s, t), &w) in &self.intra_links {
            let layer_links = out.entry(layer).or_default();
            layer_links.entry(s).or_default().push((t, w));
            if symmetric && s != t {
                layer_links.entry(t).or_default().push((s, w));
            }
        }
        out
    }

    fn expand_multilayer(&self, config: &Config) -> Vec<(u32, u32, f64)> {
        let symmetric = config.resolved_flow_model().is_undirected_flow();
        let layers = self.layer_out_links(symmetric);
        let mut expanded: BTreeMap<(u32, u32), f64> = BTreeMap::new();
        let mut emit = |s: u32, t: u32, w: f64| {
            if w > 0.0 {
                *expanded.entry((s, t)).or_insert(0.0) += w;
            }
        };

        match config.multilayer_relax_rate {
            None => {
                for (&(layer, s, t), &w) in &self.intra_links {
                    if let (Some(si), Some(ti)) = (
                        self.multilayer_state_id(layer, s),
                        self.multilayer_state_id(layer, t),
                    ) {
                        emit(si, ti, w);
                    }
                }
                for (&(from_layer, node, to_layer), &w) in &self.inter_links {
                    let Some(source) = self.multilayer_state_id(from_layer, node) else {
                        continue;
                    };
                    let Some(out) = layers.get(&to_layer).and_then(|l| l.get(&node)) else {
                        continue;
                    };
                    let sum_out: f64 = out.iter().map(|&(_, lw)| lw).sum();
                    if sum_out <= 0.0 {
                        continue;
                    }
                    for &(target, lw) in out {
                        if let Some(ti) = self.multilayer_state_id(to_layer, target) {
                            emit(source, ti, w * lw / sum_out);
                        }
                    }
                }
            }
            Some(rate) => {
                let limit = config.multilayer_relax_limit;
                for (&layer, layer_links) in &layers {
                    for (&node, own_out) in layer_links {
                        let Some(source) = self.multilayer_state_id(layer, node) else {
                            continue;
                        };
                        let own_sum: f64 = own_out.iter().map(|&(_, w)| w).sum();
                        if own_sum <= 0.0 {
                            continue;
                        }
                        // Candidate layers with their out-strength and similarity to `layer`.
                        let mut candidates = Vec::new();
                        for (&other, other_links) in &layers {
                            if let Some(k) = limit {
                                if other.abs_diff(layer) > k {
                                    continue;
                                }
                            }
                            let Some(other_out) = other_links.get(&node) else {
                                continue;
                            };
                            let other_sum: f64 = other_out.iter().map(|&(_, w)| w).sum();
                            if other_sum <= 0.0 {
                                continue;
                            }
                            let similarity = if config.multilayer_relax_by_jsd && other != layer {
                                1.0 - jensen_shannon_divergence(own_out, own_sum, other_out, other_sum)
                            } else {
                                1.0
                            };
                            candidates.push((other, other_out, other_sum, similarity));
                        }
                        let norm: f64 = candidates
                            .iter()
                            .map(|&(_, _, sum, sim)| sum * sim)
                            .sum();

                        for &(target, w) in own_out {
                            if let Some(ti) = self.multilayer_state_id(layer, target) {
                                emit(source, ti, (1.0 - rate) * w);
                            }
                        }
                        if norm <= 0.0 {
                            continue;
                        }
                        for &(other, other_out, _, similarity) in &candidates {
                            let scale = rate * own_sum * similarity / norm;
                            for &(target, w) in other_out {
                                if let Some(ti) = self.multilayer_state_id(other, target) {
                                    emit(source, ti, scale * w);
                                }
                            }
                        }
                    }
                }
            }
        }

        expanded.into_iter().map(|((s, t), w)| (s, t, w)).collect()
    }
}

/// Jensen-Shannon divergence in bits between two out-link distributions.
pub fn jensen_shannon_divergence(
    a: &[(u32, f64)],
    sum_a: f64,
    b: &[(u32, f64)],
    sum_b: f64,
) -> f64 {
    let mut mixed: BTreeMap<u32, (f64, f64)> = BTreeMap::new();
    for &(t, w) in a {
        mixed.entry(t).or_default().0 += w / sum_a;
    }
    for &(t, w) in b {
        mixed.entry(t).or_default().1 += w / sum_b;
    }
    let mut h_mix = 0.0;
    let mut h_a = 0.0;
    let mut h_b = 0.0;
    for &(p, q) in mixed.values() {
        h_mix -= plogp((p + q) / 2.0);
        h_a -= plogp(p);
        h_b -= plogp(q);
    }
    (h_mix - (h_a + h_b) / 2.0).clamp(0.0, 1.0)
}

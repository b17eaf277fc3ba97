use crate::aggregate::{merge_items, ActiveNetwork};
use crate::config::InitialPartition;
use crate::graph::{FlowData, Graph};
use crate::objective::plogp;
use crate::optimizer::{Search, MIN_CODELENGTH_IMPROVEMENT};
use log::{debug, trace};
use rustc_hash::FxHashMap;

/// Nested module structure over the leaves of one network.
#[derive(Debug, Clone)]
pub(crate) struct HierarchyResult {
    // Per-leaf module chain from top to deepest module containing the leaf.
    pub(crate) leaf_paths: Vec<Vec<u32>>,
    pub(crate) top_modules: Vec<u32>,
    pub(crate) levels: u32,
    // Parent module index or u32::MAX for top modules.
    pub(crate) module_parent: Vec<u32>,
    // Encoded child ids per module:
    // leaves are [0, leaf_count), modules are [leaf_count, leaf_count + module_count).
    pub(crate) module_children_offsets: Vec<u32>,
    pub(crate) module_children: Vec<u32>,
    pub(crate) module_data: Vec<FlowData>,
}

/// Index, module and meta parts of a hierarchical codelength.
#[derive(Debug, Clone, Default)]
pub(crate) struct CodelengthTerms {
    pub(crate) index: f64,
    // Per module, without the meta part.
    pub(crate) modules: Vec<f64>,
    pub(crate) meta: f64,
}

impl CodelengthTerms {
    pub(crate) fn module_total(&self) -> f64 {
        self.modules.iter().sum()
    }

    pub(crate) fn total(&self) -> f64 {
        self.index + self.module_total() + self.meta
    }
}

#[inline]
fn common_prefix_len(a: &[u32], b: &[u32]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Flow, enter and exit of every module given each leaf's module chain.
fn compute_hierarchy_module_data(
    active: &ActiveNetwork,
    leaf_paths: &[Vec<u32>],
    module_count: usize,
) -> Vec<FlowData> {
    let mut module_data = vec![FlowData::default(); module_count];

    for (leaf, path) in leaf_paths.iter().enumerate() {
        let flow = active.data[leaf].flow;
        for &m in path {
            module_data[m as usize].flow += flow;
        }
    }

    for (s, t, flow) in active.links.links() {
        let ps = &leaf_paths[s as usize];
        let pt = &leaf_paths[t as usize];
        let lcp = common_prefix_len(ps, pt);
        cross_boundaries(&mut module_data, &ps[lcp..], &pt[lcp..], flow, active.directed);
    }

    module_data
}

/// Books `flow` as leaving every module in `exited` and entering every
/// module in `entered`. Undirected coding splits it over both directions.
#[inline]
fn cross_boundaries(
    module_data: &mut [FlowData],
    exited: &[u32],
    entered: &[u32],
    flow: f64,
    directed: bool,
) {
    if directed {
        for &m in exited {
            module_data[m as usize].exit_flow += flow;
        }
        for &m in entered {
            module_data[m as usize].enter_flow += flow;
        }
    } else {
        let half = flow / 2.0;
        for &m in exited.iter().chain(entered) {
            let md = &mut module_data[m as usize];
            md.exit_flow += half;
            md.enter_flow += half;
        }
    }
}

/// Length of one codebook: the exit code plus one code per child. Modules
/// are coded by their enter flow, leaves by flow, merged per physical node
/// for memory networks. The second value is the meta term of the leaf children.
fn codebook_length(
    leaf_network: &ActiveNetwork,
    exit: f64,
    module_enter_flows: impl IntoIterator<Item = f64>,
    leaf_children: &[u32],
    meta_data_rate: f64,
) -> (f64, f64) {
    let mut child_total = 0.0f64;
    let mut child_log = 0.0f64;
    for w in module_enter_flows {
        child_total += w;
        child_log += plogp(w);
    }

    match &leaf_network.physical {
        Some(physical) => {
            let merged = merge_items(leaf_children.iter().map(|&c| &physical[c as usize]));
            for (_, w) in merged {
                child_total += w;
                child_log += plogp(w);
            }
        }
        None => {
            for &c in leaf_children {
                let w = leaf_network.data[c as usize].flow;
                child_total += w;
                child_log += plogp(w);
            }
        }
    }

    let term = plogp(exit + child_total) - plogp(exit) - child_log;

    let meta = match &leaf_network.meta {
        Some(meta) if !leaf_children.is_empty() => {
            let merged = merge_items(leaf_children.iter().map(|&c| &meta[c as usize]));
            let total: f64 = merged.iter().map(|&(_, w)| w).sum();
            let entropy_sum: f64 = merged.iter().map(|&(_, w)| plogp(w)).sum();
            meta_data_rate * (plogp(total) - entropy_sum)
        }
        _ => 0.0,
    };

    (term, meta)
}

impl HierarchyResult {
    /// All leaves directly under the root.
    pub(crate) fn one_level(leaf_count: usize) -> Self {
        Self {
            leaf_paths: vec![Vec::new(); leaf_count],
            top_modules: Vec::new(),
            levels: 1,
            module_parent: Vec::new(),
            module_children_offsets: vec![0],
            module_children: Vec::new(),
            module_data: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn leaf_count(&self) -> usize {
        self.leaf_paths.len()
    }

    #[inline]
    pub(crate) fn leaf_base(&self) -> u32 {
        self.leaf_paths.len() as u32
    }

    #[inline]
    pub(crate) fn module_count(&self) -> usize {
        self.module_parent.len()
    }

    pub(crate) fn children(&self, module_idx: usize) -> &[u32] {
        let start = self.module_children_offsets[module_idx] as usize;
        let end = self.module_children_offsets[module_idx + 1] as usize;
        &self.module_children[start..end]
    }

    /// Leaves with no module above them.
    pub(crate) fn root_leaves(&self) -> impl Iterator<Item = u32> + '_ {
        self.leaf_paths
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_empty())
            .map(|(leaf, _)| leaf as u32)
    }

    /// Builds the hierarchy from a bottom-up partition sequence: `layers[0]`
    /// maps leaves to finest modules, `layers[k]` maps modules of layer `k-1`
    /// to their parents.
    pub(crate) fn from_layers(active: &ActiveNetwork, layers: &[Vec<u32>]) -> Self {
        let leaf_count = active.node_count();
        if layers.is_empty() {
            return Self::one_level(leaf_count);
        }

        let depth_count = layers.len();
        debug_assert_eq!(layers[0].len(), leaf_count);

        let module_counts_bottom: Vec<usize> = layers
            .iter()
            .map(|layer| layer.iter().max().map_or(0, |&m| m as usize + 1))
            .collect();

        // Top layer gets the lowest module indices.
        let mut local_of_bottom = vec![Vec::<u32>::new(); depth_count];
        let mut next_local = 0u32;
        for top_depth in 0..depth_count {
            let bottom_k = depth_count - 1 - top_depth;
            let count = module_counts_bottom[bottom_k] as u32;
            local_of_bottom[bottom_k] = (next_local..next_local + count).collect();
            next_local += count;
        }

        let module_count = next_local as usize;
        let leaf_base = leaf_count as u32;
        let mut module_parent = vec![u32::MAX; module_count];
        let mut module_children_raw: Vec<Vec<u32>> = vec![Vec::new(); module_count];

        for bottom_k in 0..depth_count - 1 {
            for id in 0..module_counts_bottom[bottom_k] {
                let local = local_of_bottom[bottom_k][id] as usize;
                let parent_id = layers[bottom_k + 1][id] as usize;
                module_parent[local] = local_of_bottom[bottom_k + 1][parent_id];
            }
        }

        for leaf in 0..leaf_count {
            let bottom_id = layers[0][leaf] as usize;
            let local = local_of_bottom[0][bottom_id] as usize;
            module_children_raw[local].push(leaf as u32);
        }

        for bottom_k in 1..depth_count {
            for child_id in 0..module_counts_bottom[bottom_k - 1] {
                let parent_id = layers[bottom_k][child_id] as usize;
                let child_local = local_of_bottom[bottom_k - 1][child_id];
                let parent_local = local_of_bottom[bottom_k][parent_id] as usize;
                module_children_raw[parent_local].push(leaf_base + child_local);
            }
        }

        let top_modules = local_of_bottom[depth_count - 1].clone();

        let mut leaf_paths = vec![Vec::<u32>::new(); leaf_count];
        let mut bottom_ids = vec![0u32; depth_count];
        for (leaf, path) in leaf_paths.iter_mut().enumerate() {
            bottom_ids[0] = layers[0][leaf];
            for k in 1..depth_count {
                bottom_ids[k] = layers[k][bottom_ids[k - 1] as usize];
            }
            path.extend(
                (0..depth_count)
                    .rev()
                    .map(|bottom_k| local_of_bottom[bottom_k][bottom_ids[bottom_k] as usize]),
            );
        }

        Self::assemble(active, leaf_paths, top_modules, module_parent, module_children_raw)
    }

    /// Builds the hierarchy from module paths given per leaf, top level
    /// first. Leaves without a path get a singleton top module.
    pub(crate) fn from_paths(active: &ActiveNetwork, paths: &[Option<&[u32]>]) -> Self {
        let leaf_count = active.node_count();
        let leaf_base = leaf_count as u32;
        let mut module_of_prefix: FxHashMap<Vec<u32>, u32> = FxHashMap::default();
        let mut module_parent = Vec::<u32>::new();
        let mut module_children_raw: Vec<Vec<u32>> = Vec::new();
        let mut top_modules = Vec::<u32>::new();
        let mut leaf_paths = vec![Vec::<u32>::new(); leaf_count];

        let new_module = |parent: u32,
                              module_parent: &mut Vec<u32>,
                              module_children_raw: &mut Vec<Vec<u32>>,
                              top_modules: &mut Vec<u32>|
         -> u32 {
            let idx = module_parent.len() as u32;
            module_parent.push(parent);
            module_children_raw.push(Vec::new());
            if parent == u32::MAX {
                top_modules.push(idx);
            } else {
                module_children_raw[parent as usize].push(leaf_base + idx);
            }
            idx
        };

        for (leaf, path) in paths.iter().enumerate() {
            let leaf_path = &mut leaf_paths[leaf];
            match path {
                Some(labels) if !labels.is_empty() => {
                    let mut parent = u32::MAX;
                    for depth in 0..labels.len() {
                        let prefix = labels[..=depth].to_vec();
                        let module = match module_of_prefix.get(&prefix) {
                            Some(&m) => m,
                            None => {
                                let m = new_module(
                                    parent,
                                    &mut module_parent,
                                    &mut module_children_raw,
                                    &mut top_modules,
                                );
                                module_of_prefix.insert(prefix, m);
                                m
                            }
                        };
                        leaf_path.push(module);
                        parent = module;
                    }
                    module_children_raw[parent as usize].push(leaf as u32);
                }
                _ => {
                    let m = new_module(
                        u32::MAX,
                        &mut module_parent,
                        &mut module_children_raw,
                        &mut top_modules,
                    );
                    leaf_path.push(m);
                    module_children_raw[m as usize].push(leaf as u32);
                }
            }
        }

        Self::assemble(active, leaf_paths, top_modules, module_parent, module_children_raw)
    }

    fn assemble(
        active: &ActiveNetwork,
        leaf_paths: Vec<Vec<u32>>,
        top_modules: Vec<u32>,
        module_parent: Vec<u32>,
        module_children_raw: Vec<Vec<u32>>,
    ) -> Self {
        let module_count = module_parent.len();
        let mut module_children_offsets = Vec::with_capacity(module_count + 1);
        module_children_offsets.push(0);
        let mut module_children = Vec::<u32>::new();
        for children in &module_children_raw {
            module_children.extend_from_slice(children);
            module_children_offsets.push(module_children.len() as u32);
        }

        let max_depth = leaf_paths.iter().map(Vec::len).max().unwrap_or(0);
        let module_data = compute_hierarchy_module_data(active, &leaf_paths, module_count);

        Self {
            leaf_paths,
            top_modules,
            levels: max_depth as u32 + 1,
            module_parent,
            module_children_offsets,
            module_children,
            module_data,
        }
    }

    /// Codelength of this hierarchy on `leaf_network`, split into its parts.
    pub(crate) fn codelength_terms(
        &self,
        leaf_network: &ActiveNetwork,
        meta_data_rate: f64,
    ) -> CodelengthTerms {
        let leaf_base = self.leaf_base();
        let root_leaves: Vec<u32> = self.root_leaves().collect();
        let (index, mut meta) = codebook_length(
            leaf_network,
            0.0,
            self.top_modules
                .iter()
                .map(|&m| self.module_data[m as usize].enter_flow),
            &root_leaves,
            meta_data_rate,
        );

        let mut modules = Vec::with_capacity(self.module_count());
        let mut leaf_children = Vec::new();
        for m in 0..self.module_count() {
            leaf_children.clear();
            leaf_children.extend(self.children(m).iter().filter(|&&c| c < leaf_base));
            let enter_flows = self
                .children(m)
                .iter()
                .filter(|&&c| c >= leaf_base)
                .map(|&c| self.module_data[(c - leaf_base) as usize].enter_flow);
            let (term, module_meta) = codebook_length(
                leaf_network,
                self.module_data[m].exit_flow,
                enter_flows,
                &leaf_children,
                meta_data_rate,
            );
            modules.push(term);
            meta += module_meta;
        }

        CodelengthTerms {
            index,
            modules,
            meta,
        }
    }
}

/// Growable hierarchy that sub-module recursion grafts into.
#[derive(Debug, Clone)]
struct DynamicHierarchy {
    leaf_count: usize,
    module_parent: Vec<u32>,
    module_child_start: Vec<u32>,
    module_child_end: Vec<u32>,
    // Flat pooled children storage for all modules.
    children: Vec<u32>,
    top_modules: Vec<u32>,
}

impl DynamicHierarchy {
    #[inline]
    fn leaf_base(&self) -> u32 {
        self.leaf_count as u32
    }

    fn from_result(hier: &HierarchyResult) -> Self {
        let module_count = hier.module_count();
        Self {
            leaf_count: hier.leaf_count(),
            module_parent: hier.module_parent.clone(),
            module_child_start: hier.module_children_offsets[..module_count].to_vec(),
            module_child_end: hier.module_children_offsets[1..=module_count].to_vec(),
            children: hier.module_children.clone(),
            top_modules: hier.top_modules.clone(),
        }
    }

    #[inline]
    fn module_count(&self) -> usize {
        self.module_parent.len()
    }

    #[inline]
    fn children_slice(&self, module_idx: u32) -> &[u32] {
        let i = module_idx as usize;
        &self.children[self.module_child_start[i] as usize..self.module_child_end[i] as usize]
    }

    #[inline]
    fn child_count(&self, module_idx: u32) -> usize {
        self.children_slice(module_idx).len()
    }

    fn is_leaf_module(&self, module_idx: u32) -> bool {
        let leaf_base = self.leaf_base();
        self.children_slice(module_idx)
            .iter()
            .all(|&child| child < leaf_base)
    }

    fn add_module_with_children(&mut self, parent: u32, children: &[u32]) -> u32 {
        let module_idx = self.module_parent.len() as u32;
        self.module_parent.push(parent);
        let start = self.children.len() as u32;
        self.children.extend_from_slice(children);
        self.module_child_start.push(start);
        self.module_child_end.push(self.children.len() as u32);
        module_idx
    }

    fn set_module_children(&mut self, module_idx: u32, children: &[u32]) {
        let start = self.children.len() as u32;
        self.children.extend_from_slice(children);
        let i = module_idx as usize;
        self.module_child_start[i] = start;
        self.module_child_end[i] = self.children.len() as u32;
    }

    fn fill_leaf_paths(&self, module_idx: u32, path: &mut Vec<u32>, leaf_paths: &mut [Vec<u32>]) {
        path.push(module_idx);
        let leaf_base = self.leaf_base();
        for &child in self.children_slice(module_idx) {
            if child < leaf_base {
                leaf_paths[child as usize] = path.clone();
            } else {
                self.fill_leaf_paths(child - leaf_base, path, leaf_paths);
            }
        }
        path.pop();
    }

    fn to_result(&self, active: &ActiveNetwork) -> HierarchyResult {
        let module_children_raw: Vec<Vec<u32>> = (0..self.module_count() as u32)
            .map(|m| self.children_slice(m).to_vec())
            .collect();

        let mut leaf_paths = vec![Vec::<u32>::new(); self.leaf_count];
        let mut path = Vec::<u32>::new();
        for &top in &self.top_modules {
            self.fill_leaf_paths(top, &mut path, &mut leaf_paths);
        }

        HierarchyResult::assemble(
            active,
            leaf_paths,
            self.top_modules.clone(),
            self.module_parent.clone(),
            module_children_raw,
        )
    }

    fn copy_local_module(
        &mut self,
        parent_global: u32,
        local_module_idx: u32,
        local_hier: &HierarchyResult,
        local_leaf_to_global_leaf: &[u32],
        next_level_leaf_modules: &mut Vec<u32>,
    ) -> u32 {
        let global_module = self.add_module_with_children(parent_global, &[]);
        let local_leaf_base = local_hier.leaf_base();

        let mut children = Vec::<u32>::new();
        let mut all_children_are_leaves = true;
        for &child in local_hier.children(local_module_idx as usize) {
            if child < local_leaf_base {
                children.push(local_leaf_to_global_leaf[child as usize]);
            } else {
                all_children_are_leaves = false;
                let global_child_module = self.copy_local_module(
                    global_module,
                    child - local_leaf_base,
                    local_hier,
                    local_leaf_to_global_leaf,
                    next_level_leaf_modules,
                );
                children.push(self.leaf_base() + global_child_module);
            }
        }

        self.set_module_children(global_module, &children);
        if all_children_are_leaves && children.len() > 1 {
            next_level_leaf_modules.push(global_module);
        }

        global_module
    }

    /// Replaces the leaves of `parent_module` with the modules of `local_hier`.
    fn graft_under_module(
        &mut self,
        parent_module: u32,
        local_hier: &HierarchyResult,
        local_leaf_to_global_leaf: &[u32],
        next_level_leaf_modules: &mut Vec<u32>,
    ) {
        let leaf_base = self.leaf_base();
        let mut new_children = Vec::<u32>::with_capacity(local_hier.top_modules.len());
        for &local_top in &local_hier.top_modules {
            let global_top_module = self.copy_local_module(
                parent_module,
                local_top,
                local_hier,
                local_leaf_to_global_leaf,
                next_level_leaf_modules,
            );
            new_children.push(leaf_base + global_top_module);
        }
        self.set_module_children(parent_module, &new_children);
    }
}

#[derive(Debug, Default)]
struct SplitScratch {
    global_to_local: Vec<u32>,
    local_module_data: Vec<FlowData>,
}

/// Codelength of `parent_members`' module after splitting it by
/// `sub_hierarchy`, counting links to the rest of the network: the parent's
/// new codebook plus every inserted module's codebook.
fn candidate_split_local_codelength(
    leaf_network: &ActiveNetwork,
    parent_members: &[u32],
    sub_hierarchy: &HierarchyResult,
    parent_exit_flow: f64,
    meta_data_rate: f64,
    scratch: &mut SplitScratch,
) -> f64 {
    let local_module_count = sub_hierarchy.module_count();
    if local_module_count == 0 {
        return f64::INFINITY;
    }
    let directed = leaf_network.directed;

    let SplitScratch {
        global_to_local,
        local_module_data,
    } = scratch;

    if global_to_local.len() != leaf_network.node_count() {
        global_to_local.clear();
        global_to_local.resize(leaf_network.node_count(), u32::MAX);
    }
    for (local_leaf, &global_leaf) in parent_members.iter().enumerate() {
        global_to_local[global_leaf as usize] = local_leaf as u32;
    }

    local_module_data.clear();
    local_module_data.extend(sub_hierarchy.module_data.iter().map(|d| FlowData {
        flow: d.flow,
        enter_flow: 0.0,
        exit_flow: 0.0,
    }));

    for (local_s, &global_s) in parent_members.iter().enumerate() {
        let ps = &sub_hierarchy.leaf_paths[local_s];
        for arc in leaf_network.links.out_arcs(global_s as usize) {
            match global_to_local[arc.node as usize] {
                u32::MAX => cross_boundaries(local_module_data, ps, &[], arc.flow, directed),
                local_t => {
                    let pt = &sub_hierarchy.leaf_paths[local_t as usize];
                    let lcp = common_prefix_len(ps, pt);
                    cross_boundaries(local_module_data, &ps[lcp..], &pt[lcp..], arc.flow, directed);
                }
            }
        }
    }

    for (local_t, &global_t) in parent_members.iter().enumerate() {
        let pt = &sub_hierarchy.leaf_paths[local_t];
        for arc in leaf_network.links.in_arcs(global_t as usize) {
            if global_to_local[arc.node as usize] == u32::MAX {
                cross_boundaries(local_module_data, &[], pt, arc.flow, directed);
            }
        }
    }

    for &global_leaf in parent_members {
        global_to_local[global_leaf as usize] = u32::MAX;
    }

    let (parent_term, _) = codebook_length(
        leaf_network,
        parent_exit_flow,
        sub_hierarchy
            .top_modules
            .iter()
            .map(|&top| local_module_data[top as usize].enter_flow),
        &[],
        meta_data_rate,
    );

    let local_leaf_base = sub_hierarchy.leaf_base();
    let mut inserted = 0.0f64;
    let mut leaf_children = Vec::new();
    for m in 0..local_module_count {
        let children = sub_hierarchy.children(m);
        leaf_children.clear();
        leaf_children.extend(
            children
                .iter()
                .filter(|&&c| c < local_leaf_base)
                .map(|&c| parent_members[c as usize]),
        );
        let enter_flows = children
            .iter()
            .filter(|&&c| c >= local_leaf_base)
            .map(|&c| local_module_data[(c - local_leaf_base) as usize].enter_flow);
        let (term, meta) = codebook_length(
            leaf_network,
            local_module_data[m].exit_flow,
            enter_flows,
            &leaf_children,
            meta_data_rate,
        );
        inserted += term + meta;
    }

    parent_term + inserted
}

/// Splits every module that holds only leaves, and keeps splitting the new
/// bottom modules, as long as a split shortens the module's codelength.
fn recursive_partition(
    search: &mut Search<'_>,
    leaf_network: &ActiveNetwork,
    hierarchy: &mut DynamicHierarchy,
) {
    let meta_data_rate = search.config.meta_data_rate;
    let tune_iteration_limit = search.config.tune_iteration_limit;
    let mut scratch = SplitScratch::default();

    let mut queue: Vec<u32> = (0..hierarchy.module_count() as u32)
        .filter(|&m| hierarchy.is_leaf_module(m) && hierarchy.child_count(m) > 1)
        .collect();
    let mut depth = 0usize;

    while !queue.is_empty() {
        // One snapshot per queue level; modules grafted at this level are split next level.
        let snapshot = hierarchy.to_result(leaf_network);
        let mut next_queue = Vec::new();
        let mut next_level_leaf_modules = Vec::new();
        let mut num_split = 0usize;

        for &module_idx in &queue {
            if !hierarchy.is_leaf_module(module_idx) {
                continue;
            }
            let parent_members = hierarchy.children_slice(module_idx).to_vec();
            if parent_members.len() <= 2 {
                continue;
            }

            let parent_exit_flow = snapshot.module_data[module_idx as usize].exit_flow;
            let (old_term, old_meta) = codebook_length(
                leaf_network,
                parent_exit_flow,
                std::iter::empty(),
                &parent_members,
                meta_data_rate,
            );
            let old_module_codelength = old_term + old_meta;

            let sub_active = leaf_network.induced_subnetwork(&parent_members);
            let mut sub_objective = search.objective_for(&sub_active);
            sub_objective.set_exit_network_flow(parent_exit_flow);
            let sub_one_level = sub_active.one_level_codelength();
            let sub_top = search.optimize_two_level(
                &sub_active,
                &mut sub_objective,
                sub_one_level,
                true,
                true,
                None,
                tune_iteration_limit,
            );
            let base_assignment = sub_top.assignment_to_leaves(sub_active.node_count());

            sub_objective.set_exit_network_flow(0.0);
            let super_result =
                search.find_hierarchical_super_modules(&sub_active, &sub_top, &mut sub_objective);

            let mut layers = Vec::with_capacity(1 + super_result.super_assignments.len());
            layers.push(base_assignment);
            layers.extend(super_result.super_assignments);
            let sub_hierarchy = HierarchyResult::from_layers(&sub_active, &layers);

            let num_submodules = sub_hierarchy.top_modules.len();
            if num_submodules <= 1 || num_submodules >= parent_members.len() {
                continue;
            }

            let new_local_codelength = candidate_split_local_codelength(
                leaf_network,
                &parent_members,
                &sub_hierarchy,
                parent_exit_flow,
                meta_data_rate,
                &mut scratch,
            );
            trace!(
                "sub-module split of {} leaves into {} modules: {:.6} -> {:.6}",
                parent_members.len(),
                num_submodules,
                old_module_codelength,
                new_local_codelength
            );
            if new_local_codelength >= old_module_codelength - MIN_CODELENGTH_IMPROVEMENT {
                continue;
            }

            next_level_leaf_modules.clear();
            hierarchy.graft_under_module(
                module_idx,
                &sub_hierarchy,
                &parent_members,
                &mut next_level_leaf_modules,
            );
            next_queue.extend_from_slice(&next_level_leaf_modules);
            num_split += 1;
        }

        debug!(
            "recursion depth {}: split {} of {} modules",
            depth,
            num_split,
            queue.len()
        );
        queue = next_queue;
        depth += 1;
    }
}

/// Composes bottom-up layers into one leaf -> top module assignment.
fn compose_layers(layers: &[Vec<u32>]) -> Vec<u32> {
    let mut assignment = layers[0].clone();
    for layer in &layers[1..] {
        for m in assignment.iter_mut() {
            *m = layer[*m as usize];
        }
    }
    assignment
}

/// Tries recursive sub-module refinement and keeps it only if it shortens the
/// whole hierarchy.
fn refine(
    search: &mut Search<'_>,
    leaf_network: &ActiveNetwork,
    base: HierarchyResult,
) -> HierarchyResult {
    let meta_data_rate = search.config.meta_data_rate;
    let base_codelength = base.codelength_terms(leaf_network, meta_data_rate).total();
    let mut dynamic = DynamicHierarchy::from_result(&base);
    recursive_partition(search, leaf_network, &mut dynamic);
    let refined = dynamic.to_result(leaf_network);
    let refined_codelength = refined.codelength_terms(leaf_network, meta_data_rate).total();
    debug!("recursive refinement: {base_codelength:.6} -> {refined_codelength:.6}");
    if refined_codelength < base_codelength - MIN_CODELENGTH_IMPROVEMENT {
        refined
    } else {
        base
    }
}

/// Full search on one trial: two-level partition, super modules and
/// sub-module recursion as the configuration allows.
pub(crate) fn partition_network(
    search: &mut Search<'_>,
    leaf_network: &ActiveNetwork,
    initial_modules: Option<&[u32]>,
) -> HierarchyResult {
    let config = search.config;
    let n = leaf_network.node_count();
    let one_level = HierarchyResult::one_level(n);
    if n <= 1 {
        return one_level;
    }
    let one_level_codelength = one_level
        .codelength_terms(leaf_network, config.meta_data_rate)
        .total();

    let multilevel = !config.two_level;
    let mut objective = search.objective_for(leaf_network);
    let top = search.optimize_two_level(
        leaf_network,
        &mut objective,
        one_level_codelength,
        true,
        multilevel,
        initial_modules,
        config.tune_iteration_limit,
    );

    let base_assignment = top.assignment_to_leaves(n);
    let two_level = HierarchyResult::from_layers(leaf_network, &[base_assignment.clone()]);
    let two_level_codelength = two_level
        .codelength_terms(leaf_network, config.meta_data_rate)
        .total();
    let num_top = top.node_count();
    let has_non_trivial_modules = (0..num_top).any(|m| top.members(m).len() > 1);
    debug!(
        "two-level partition: {num_top} modules, codelength {two_level_codelength:.6} (one-level {one_level_codelength:.6})"
    );

    if !config.prefer_modular_solution
        && has_non_trivial_modules
        && two_level_codelength > one_level_codelength
    {
        debug!("modular solution codes longer than one level, keeping one module");
        return HierarchyResult::from_layers(leaf_network, &[vec![0; n]]);
    }

    if !multilevel || num_top == 1 || num_top == n || config.fast_hierarchical_solution >= 3 {
        return two_level;
    }

    let super_result = search.find_hierarchical_super_modules(leaf_network, &top, &mut objective);
    let mut layers = Vec::with_capacity(1 + super_result.super_assignments.len());
    layers.push(base_assignment);
    layers.extend(super_result.super_assignments);
    debug!("found {} super-module levels", layers.len() - 1);

    if config.only_super_modules || config.fast_hierarchical_solution == 0 {
        let top_only = HierarchyResult::from_layers(leaf_network, &[compose_layers(&layers)]);
        if config.only_super_modules {
            return top_only;
        }
        return refine(search, leaf_network, top_only);
    }

    let layered = HierarchyResult::from_layers(leaf_network, &layers);
    if config.fast_hierarchical_solution == 1 {
        refine(search, leaf_network, layered)
    } else {
        layered
    }
}

/// Dense top-level module per leaf from the first entry of each path; leaves
/// without a path start in their own module.
pub(crate) fn initial_top_modules(graph: &Graph, partition: &InitialPartition) -> Vec<u32> {
    let mut dense: FxHashMap<u32, u32> = FxHashMap::default();
    let mut next = 0u32;
    let mut out = Vec::with_capacity(graph.node_count());
    for node in &graph.nodes {
        let module = match partition.path(node.id).and_then(|p| p.first()) {
            Some(&label) => *dense.entry(label).or_insert_with(|| {
                next += 1;
                next - 1
            }),
            None => {
                next += 1;
                next - 1
            }
        };
        out.push(module);
    }
    out
}

/// Hierarchy given by the caller's partition, or one level without one.
pub(crate) fn hierarchy_from_partition(
    graph: &Graph,
    leaf_network: &ActiveNetwork,
    partition: Option<&InitialPartition>,
) -> HierarchyResult {
    match partition {
        Some(partition) => {
            let paths: Vec<Option<&[u32]>> =
                graph.nodes.iter().map(|node| partition.path(node.id)).collect();
            HierarchyResult::from_paths(leaf_network, &paths)
        }
        None => HierarchyResult::one_level(leaf_network.node_count()),
    }
}

use crate::aggregate::ActiveNetwork;
use crate::graph::FlowData;
use crate::objective::{DeltaFlow, MapEquationObjective};
use crate::rng::TrialRng;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

pub(crate) const MIN_SINGLE_NODE_IMPROVEMENT: f64 = 1e-16;

/// Limits for one run of the core loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MoveOptions {
    /// Maximum sweeps, 0 for no limit.
    pub(crate) loop_limit: usize,
    pub(crate) min_improvement: f64,
    /// Nodes already sharing a module stay put during the first pass.
    pub(crate) lock_multi_module_nodes: bool,
    pub(crate) parallel: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct OptimizeLevelResult {
    pub(crate) node_module: Vec<u32>,
    pub(crate) module_data: Vec<FlowData>,
    pub(crate) codelength: f64,
    pub(crate) effective_loops: u32,
}

/// Modules a node could move to, with the link flow it has to each.
#[derive(Debug, Default)]
struct Candidates {
    slot: FxHashMap<u32, usize>,
    list: Vec<DeltaFlow>,
}

impl Candidates {
    fn clear(&mut self) {
        self.slot.clear();
        self.list.clear();
    }

    fn add(&mut self, module: u32, delta_exit: f64, delta_enter: f64) {
        let list = &mut self.list;
        let idx = *self.slot.entry(module).or_insert_with(|| {
            list.push(DeltaFlow {
                module,
                ..DeltaFlow::default()
            });
            list.len() - 1
        });
        list[idx].delta_exit += delta_exit;
        list[idx].delta_enter += delta_enter;
    }

    fn get(&self, module: u32) -> Option<DeltaFlow> {
        self.slot.get(&module).map(|&idx| self.list[idx])
    }

    fn len(&self) -> usize {
        self.list.len()
    }
}

/// Buffers reused from sweep to sweep.
#[derive(Debug, Default)]
struct SweepBuffers {
    node_order: Vec<u32>,
    module_order: Vec<u32>,
    candidates: Candidates,
}

/// A partition of the active network into modules, kept in step with the
/// objective as nodes move.
struct Partition<'a> {
    active: &'a ActiveNetwork,
    objective: &'a mut MapEquationObjective,
    node_module: Vec<u32>,
    module_data: Vec<FlowData>,
    module_size: Vec<u32>,
    dirty: Vec<bool>,
    // Modules emptied by moves, reused as the "new module" candidate.
    empty: Vec<u32>,
}

impl<'a> Partition<'a> {
    /// Every node in its own module, all nodes dirty.
    fn singletons(active: &'a ActiveNetwork, objective: &'a mut MapEquationObjective) -> Self {
        let n = active.node_count();
        let module_data = active.node_data();
        objective.init_partition(&module_data, active.items());
        Self {
            active,
            objective,
            node_module: (0..n as u32).collect(),
            module_data,
            module_size: vec![1; n],
            dirty: vec![true; n],
            empty: Vec::with_capacity(n),
        }
    }

    fn codelength(&self) -> f64 {
        self.objective.codelength
    }

    /// Link flow from `node` to every module it touches, plus its own module
    /// and, when it has company there, one empty module.
    fn gather(&self, node: usize, candidates: &mut Candidates) {
        candidates.clear();
        let links = &self.active.links;
        for arc in links.out_arcs(node) {
            candidates.add(self.node_module[arc.node as usize], arc.flow, 0.0);
        }
        for arc in links.in_arcs(node) {
            candidates.add(self.node_module[arc.node as usize], 0.0, arc.flow);
        }
        let current = self.node_module[node];
        candidates.add(current, 0.0, 0.0);
        if self.module_size[current as usize] > 1 {
            if let Some(&empty) = self.empty.last() {
                candidates.add(empty, 0.0, 0.0);
            }
        }
    }

    /// Link flow between `node` and the members of `old` and of `new`.
    fn flow_between(&self, node: usize, old: u32, new: u32) -> (DeltaFlow, DeltaFlow) {
        let mut old_delta = DeltaFlow {
            module: old,
            ..DeltaFlow::default()
        };
        let mut new_delta = DeltaFlow {
            module: new,
            ..DeltaFlow::default()
        };
        let links = &self.active.links;
        for arc in links.out_arcs(node) {
            match self.node_module[arc.node as usize] {
                m if m == old => old_delta.delta_exit += arc.flow,
                m if m == new => new_delta.delta_exit += arc.flow,
                _ => {}
            }
        }
        for arc in links.in_arcs(node) {
            match self.node_module[arc.node as usize] {
                m if m == old => old_delta.delta_enter += arc.flow,
                m if m == new => new_delta.delta_enter += arc.flow,
                _ => {}
            }
        }
        (old_delta, new_delta)
    }

    fn apply(&mut self, node: usize, old_delta: &DeltaFlow, new_delta: &DeltaFlow) {
        let old = old_delta.module as usize;
        let new = new_delta.module as usize;

        if self.module_size[new] == 0 {
            if let Some(pos) = self.empty.iter().rposition(|&m| m as usize == new) {
                self.empty.remove(pos);
            }
        }
        if self.module_size[old] == 1 {
            self.empty.push(old_delta.module);
        }

        self.objective.update_on_move(
            node,
            &self.active.data[node],
            old_delta,
            new_delta,
            &mut self.module_data,
        );

        self.module_size[old] -= 1;
        self.module_size[new] += 1;
        self.node_module[node] = new_delta.module;
    }

    /// Moves `node` to `target` whatever it costs. False if it is already there.
    fn move_to(&mut self, node: usize, target: u32) -> bool {
        let current = self.node_module[node];
        if current == target {
            return false;
        }
        let (old_delta, new_delta) = self.flow_between(node, current, target);
        self.apply(node, &old_delta, &new_delta);
        true
    }

    fn mark_neighbours_dirty(&mut self, node: usize) {
        let active = self.active;
        for arc in active.links.arcs(node) {
            self.dirty[arc.node as usize] = true;
        }
    }

    /// One sweep over the dirty nodes in random order. Each node moves to the
    /// candidate module with the largest strict codelength decrease; candidates
    /// are scanned in random order, and among moves as good as the best the one
    /// with the strongest outgoing link flow wins.
    fn sweep(&mut self, rng: &mut impl TrialRng, lock: bool, buffers: &mut SweepBuffers) -> u32 {
        let SweepBuffers {
            node_order,
            module_order,
            candidates,
        } = buffers;
        node_order.resize(self.active.node_count(), 0);
        rng.randomized_index_vector(node_order);

        let mut moved = 0u32;
        for &node in node_order.iter() {
            let node = node as usize;
            if !self.dirty[node] {
                continue;
            }
            let current = self.node_module[node];
            if lock && self.module_size[current as usize] > 1 {
                continue;
            }

            self.gather(node, candidates);
            let Some(old_delta) = candidates.get(current) else {
                continue;
            };
            module_order.resize(candidates.len(), 0);
            rng.randomized_index_vector(module_order);

            let mut best = (old_delta, 0.0f64);
            let mut strongest = (old_delta, 0.0f64);
            let shuffled = module_order.iter().map(|&i| &candidates.list[i as usize]);
            for (cand, delta) in self.objective.move_deltas(
                node,
                &self.active.data[node],
                &old_delta,
                shuffled,
                &self.module_data,
            ) {
                if delta < best.1 - MIN_SINGLE_NODE_IMPROVEMENT {
                    best = (cand, delta);
                }
                if cand.delta_exit > strongest.0.delta_exit {
                    strongest = (cand, delta);
                }
            }
            if strongest.0.module != best.0.module
                && strongest.1 <= best.1 + MIN_SINGLE_NODE_IMPROVEMENT
            {
                best = strongest;
            }

            let target = best.0;
            if target.module == current {
                self.dirty[node] = false;
                continue;
            }
            self.apply(node, &old_delta, &target);
            moved += 1 + self.follow_lone_neighbour(node, current, target.module);
        }
        moved
    }

    /// After `node` left `old` for `new`: a single linked node left alone in
    /// `old` follows it. Returns the number of extra moves.
    fn follow_lone_neighbour(&mut self, node: usize, old: u32, new: u32) -> u32 {
        let active = self.active;
        let mut left_behind = None;
        let mut links_into_old = 0u32;
        for arc in active.links.arcs(node) {
            let nbr = arc.node as usize;
            self.dirty[nbr] = true;
            if self.node_module[nbr] == old {
                left_behind = Some(nbr);
                links_into_old += 1;
            }
        }

        let Some(nbr) = left_behind else {
            return 0;
        };
        if links_into_old != 1 || self.module_size[old as usize] != 1 || !self.move_to(nbr, new) {
            return 0;
        }
        if active.links.degree(nbr) > 1 {
            self.mark_neighbours_dirty(nbr);
        }
        1
    }

    /// Best strictly improving module for `node` on the partition as it stands.
    /// Candidates are scanned by ascending module id so equal deltas resolve to
    /// the lowest id. `None` when the node is skipped this sweep.
    fn propose(&self, node: usize, lock: bool) -> Option<u32> {
        if !self.dirty[node] {
            return None;
        }
        let current = self.node_module[node];
        if lock && self.module_size[current as usize] > 1 {
            return None;
        }

        let mut candidates = Candidates::default();
        self.gather(node, &mut candidates);
        let old_delta = candidates.get(current)?;
        let mut list = candidates.list;
        list.sort_unstable_by_key(|c| c.module);

        let mut best = (current, 0.0f64);
        for (cand, delta) in self.objective.move_deltas(
            node,
            &self.active.data[node],
            &old_delta,
            &list,
            &self.module_data,
        ) {
            if delta < best.1 - MIN_SINGLE_NODE_IMPROVEMENT {
                best = (cand.module, delta);
            }
        }
        Some(best.0)
    }

    /// Evaluates every dirty node against the same frozen partition in parallel,
    /// then applies the proposals serially in visit order, re-checking each
    /// delta against the partition as it stands.
    fn sweep_parallel(
        &mut self,
        rng: &mut impl TrialRng,
        lock: bool,
        buffers: &mut SweepBuffers,
    ) -> u32 {
        let node_order = &mut buffers.node_order;
        node_order.resize(self.active.node_count(), 0);
        rng.randomized_index_vector(node_order);

        let proposals: Vec<Option<u32>> = {
            let frozen: &Self = self;
            node_order
                .par_iter()
                .map(|&node| frozen.propose(node as usize, lock))
                .collect()
        };

        let mut moved = 0u32;
        for (&node, proposal) in node_order.iter().zip(proposals) {
            let node = node as usize;
            let Some(target) = proposal else {
                continue;
            };
            let current = self.node_module[node];
            if target == current {
                self.dirty[node] = false;
                continue;
            }
            let (old_delta, new_delta) = self.flow_between(node, current, target);
            let delta = self.objective.get_delta_on_move(
                node,
                &self.active.data[node],
                &old_delta,
                &new_delta,
                &self.module_data,
            );
            if delta < -MIN_SINGLE_NODE_IMPROVEMENT {
                self.apply(node, &old_delta, &new_delta);
                self.mark_neighbours_dirty(node);
                moved += 1;
            } else {
                self.dirty[node] = false;
            }
        }
        moved
    }

    fn into_result(self, effective_loops: u32) -> OptimizeLevelResult {
        OptimizeLevelResult {
            codelength: self.objective.codelength,
            node_module: self.node_module,
            module_data: self.module_data,
            effective_loops,
        }
    }
}

/// Core loop: sweeps until no node moves, the codelength stops improving, or
/// the sweep limit is hit. Starts from singletons, or from `predefined_modules`.
pub(crate) fn optimize_active_network(
    active: &ActiveNetwork,
    rng: &mut impl TrialRng,
    objective: &mut MapEquationObjective,
    predefined_modules: Option<&[u32]>,
    options: MoveOptions,
) -> OptimizeLevelResult {
    let mut partition = Partition::singletons(active, objective);
    if let Some(modules) = predefined_modules {
        debug_assert_eq!(modules.len(), active.node_count());
        for (node, &module) in modules.iter().enumerate() {
            partition.move_to(node, module);
        }
    }

    let mut buffers = SweepBuffers::default();
    let mut core_loop_count = 0usize;
    let mut effective_loops = 0u32;
    let mut old_codelength = partition.codelength();

    loop {
        core_loop_count += 1;

        let moved = if options.parallel {
            partition.sweep_parallel(rng, options.lock_multi_module_nodes, &mut buffers)
        } else {
            partition.sweep(rng, options.lock_multi_module_nodes, &mut buffers)
        };

        let codelength = partition.codelength();
        if moved == 0 || codelength >= old_codelength - options.min_improvement {
            break;
        }

        effective_loops += 1;
        old_codelength = codelength;

        if core_loop_count == options.loop_limit {
            break;
        }
    }

    partition.into_result(effective_loops)
}

/// Codelength reached by moving nodes one at a time from singletons into
/// `assignment`, tracking the objective incrementally.
pub(crate) fn incremental_codelength(
    active: &ActiveNetwork,
    objective: &mut MapEquationObjective,
    assignment: &[u32],
) -> f64 {
    let mut partition = Partition::singletons(active, objective);
    for (node, &module) in assignment.iter().enumerate() {
        partition.move_to(node, module);
    }
    partition.codelength()
}

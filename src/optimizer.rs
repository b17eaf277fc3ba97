use crate::aggregate::{assignment_module_count, relabel_by_first_appearance, ActiveNetwork};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::mover::{
    incremental_codelength, optimize_active_network, MoveOptions, OptimizeLevelResult,
    MIN_SINGLE_NODE_IMPROVEMENT,
};
use crate::objective::MapEquationObjective;
use crate::rng::TrialStream;
use log::{debug, trace};

pub(crate) const MIN_CODELENGTH_IMPROVEMENT: f64 = 1e-10;

/// Search state of one trial: options and the trial's random stream.
pub(crate) struct Search<'c> {
    pub(crate) config: &'c Config,
    pub(crate) rng: TrialStream,
}

pub(crate) struct SuperHierarchySearch {
    // Per accepted level: previous-level module id -> new super-module id.
    pub(crate) super_assignments: Vec<Vec<u32>>,
}

/// Module codelength and index codelength with each node of `active` as a module.
fn partition_terms(active: &ActiveNetwork, objective: &mut MapEquationObjective) -> (f64, f64) {
    objective.init_partition(&active.node_data(), active.items());
    (objective.codelength, objective.index_codelength)
}

fn partition_codelength(active: &ActiveNetwork, objective: &mut MapEquationObjective) -> f64 {
    partition_terms(active, objective).0
}

impl<'c> Search<'c> {
    pub(crate) fn new(config: &'c Config, seed: u32) -> Self {
        Self {
            config,
            rng: TrialStream::new(config.rng, seed),
        }
    }

    fn move_options(&self, aggregation_level: usize, lock: bool) -> MoveOptions {
        MoveOptions {
            loop_limit: self.config.loop_limit(aggregation_level),
            min_improvement: self.config.core_loop_codelength_threshold,
            lock_multi_module_nodes: lock,
            parallel: self.config.inner_parallelization,
        }
    }

    pub(crate) fn objective_for(&self, active: &ActiveNetwork) -> MapEquationObjective {
        MapEquationObjective::new(&active.node_data())
            .with_meta_data_rate(self.config.meta_data_rate)
    }

    fn optimize(
        &mut self,
        active: &ActiveNetwork,
        objective: &mut MapEquationObjective,
        predefined_modules: Option<&[u32]>,
        options: MoveOptions,
    ) -> OptimizeLevelResult {
        optimize_active_network(
            active,
            &mut self.rng,
            objective,
            predefined_modules,
            options,
        )
    }

    /// Move, consolidate, repeat, until a level no longer shortens the
    /// codelength. `initial_modules` seeds the first level instead of singletons.
    pub(crate) fn find_top_modules_repeatedly_from_leaf(
        &mut self,
        leaf_network: &ActiveNetwork,
        objective: &mut MapEquationObjective,
        lock_first_loop: bool,
        allow_non_improving_hierarchy_levels: bool,
        initial_modules: Option<&[u32]>,
    ) -> ActiveNetwork {
        let mut have_modules = false;
        let mut active = leaf_network.clone();
        let mut consolidated_codelength = f64::INFINITY;
        let mut aggregation_level = 0usize;

        loop {
            if active.node_count() <= 1 {
                break;
            }

            let predefined = if aggregation_level == 0 {
                initial_modules
            } else {
                None
            };
            let lock = lock_first_loop && aggregation_level == 0 && predefined.is_none();
            let options = self.move_options(aggregation_level, lock);
            let level = self.optimize(&active, objective, predefined, options);
            debug!(
                "level {}: {} nodes -> {} modules, codelength {:.6} after {} effective loops",
                aggregation_level,
                active.node_count(),
                assignment_module_count(&level.node_module),
                level.codelength,
                level.effective_loops
            );

            let next_module_count = assignment_module_count(&level.node_module);
            let allow_non_improving_level =
                allow_non_improving_hierarchy_levels && next_module_count < active.node_count();
            if have_modules
                && level.codelength >= consolidated_codelength - MIN_SINGLE_NODE_IMPROVEMENT
                && !allow_non_improving_level
            {
                break;
            }

            let next = active.consolidate(&level.node_module, &level.module_data);
            consolidated_codelength = level.codelength;
            have_modules = true;
            aggregation_level += 1;

            let done = next.node_count() <= 1 || next.node_count() == active.node_count();
            active = next;
            if done {
                break;
            }
        }

        active
    }

    pub(crate) fn find_top_modules_repeatedly_from_modules(
        &mut self,
        active_top: &ActiveNetwork,
        objective: &mut MapEquationObjective,
        allow_non_improving_hierarchy_levels: bool,
    ) -> ActiveNetwork {
        let mut active = active_top.clone();
        let mut consolidated_codelength = partition_codelength(&active, objective);
        let mut aggregation_level = 0usize;

        loop {
            if active.node_count() <= 1 {
                break;
            }

            let options = self.move_options(aggregation_level, false);
            let level = self.optimize(&active, objective, None, options);

            let next_module_count = assignment_module_count(&level.node_module);
            let allow_non_improving_level =
                allow_non_improving_hierarchy_levels && next_module_count < active.node_count();
            if level.codelength >= consolidated_codelength - MIN_SINGLE_NODE_IMPROVEMENT
                && !allow_non_improving_level
            {
                break;
            }

            let next = active.consolidate(&level.node_module, &level.module_data);
            consolidated_codelength = level.codelength;
            aggregation_level += 1;

            let done = next.node_count() <= 1 || next.node_count() == active.node_count();
            active = next;
            if done {
                break;
            }
        }

        active
    }

    /// Re-runs the leaf-level core loop starting from the current top modules.
    fn fine_tune(
        &mut self,
        leaf_network: &ActiveNetwork,
        top_network: &mut ActiveNetwork,
        objective: &mut MapEquationObjective,
    ) -> u32 {
        if top_network.node_count() <= 1 {
            return 0;
        }

        let predefined_modules = top_network.assignment_to_leaves(leaf_network.node_count());
        let options = self.move_options(0, false);
        let level = self.optimize(leaf_network, objective, Some(&predefined_modules), options);

        if level.effective_loops == 0 {
            return 0;
        }

        *top_network = leaf_network.consolidate(&level.node_module, &level.module_data);
        level.effective_loops
    }

    /// Splits every top module into sub-modules, then moves the sub-modules
    /// between the former top modules.
    fn coarse_tune(
        &mut self,
        leaf_network: &ActiveNetwork,
        top_network: &mut ActiveNetwork,
        objective: &mut MapEquationObjective,
        allow_non_improving_hierarchy_levels: bool,
    ) -> u32 {
        if top_network.node_count() <= 1 {
            return 0;
        }

        let leaf_count = leaf_network.node_count();
        let old_assignment = top_network.assignment_to_leaves(leaf_count);
        let mut sub_assignment = vec![u32::MAX; leaf_count];
        let mut submodule_to_old_module = Vec::<u32>::new();
        let mut module_index_offset = 0u32;

        for old_module in 0..top_network.node_count() {
            let members = top_network.members(old_module);

            if members.len() < 2 {
                for &leaf in members {
                    sub_assignment[leaf as usize] = module_index_offset;
                }
                submodule_to_old_module.push(old_module as u32);
                module_index_offset += 1;
                continue;
            }

            let sub_active = leaf_network.induced_subnetwork(members);
            let mut sub_objective = self.objective_for(&sub_active);
            let sub_top = self.find_top_modules_repeatedly_from_leaf(
                &sub_active,
                &mut sub_objective,
                false,
                allow_non_improving_hierarchy_levels,
                None,
            );
            let sub_local_assignment = sub_top.assignment_to_leaves(sub_active.node_count());
            let num_submodules = assignment_module_count(&sub_local_assignment) as u32;

            for (local_idx, &leaf) in members.iter().enumerate() {
                sub_assignment[leaf as usize] = module_index_offset + sub_local_assignment[local_idx];
            }
            for _ in 0..num_submodules {
                submodule_to_old_module.push(old_module as u32);
            }
            module_index_offset += num_submodules;
        }

        debug_assert_eq!(module_index_offset as usize, submodule_to_old_module.len());
        debug_assert!(sub_assignment.iter().all(|&m| m != u32::MAX));

        let submodule_data =
            leaf_network.module_data(&sub_assignment, module_index_offset as usize);
        let submodule_network = leaf_network.consolidate(&sub_assignment, &submodule_data);

        let options = self.move_options(0, false);
        let level = self.optimize(
            &submodule_network,
            objective,
            Some(&submodule_to_old_module),
            options,
        );

        *top_network = submodule_network.consolidate(&level.node_module, &level.module_data);
        top_network.refresh_from_leaves(leaf_network);
        partition_codelength(top_network, objective);

        let refreshed_assignment = top_network.assignment_to_leaves(leaf_count);
        if old_assignment != refreshed_assignment {
            level.effective_loops.max(1)
        } else {
            0
        }
    }

    /// Alternates fine and coarse tuning until an iteration stops paying off.
    fn tune_top_modules(
        &mut self,
        leaf_network: &ActiveNetwork,
        top_network: &mut ActiveNetwork,
        objective: &mut MapEquationObjective,
        one_level_codelength: f64,
        allow_non_improving_hierarchy_levels: bool,
        tune_iteration_limit: u32,
    ) {
        let mut old_codelength = partition_codelength(top_network, objective);
        let mut do_fine_tune = true;
        let mut coarse_tuned = false;
        let mut tune_iteration = 0u32;

        while top_network.node_count() > 1 && tune_iteration.wrapping_add(1) != tune_iteration_limit
        {
            tune_iteration += 1;
            if do_fine_tune {
                let num_effective_loops = self.fine_tune(leaf_network, top_network, objective);
                trace!("fine tune {tune_iteration}: {num_effective_loops} effective loops");
                if num_effective_loops > 0 {
                    *top_network = self.find_top_modules_repeatedly_from_modules(
                        top_network,
                        objective,
                        allow_non_improving_hierarchy_levels,
                    );
                }
            } else {
                coarse_tuned = true;
                if !self.config.no_coarse_tune {
                    let num_effective_loops = self.coarse_tune(
                        leaf_network,
                        top_network,
                        objective,
                        allow_non_improving_hierarchy_levels,
                    );
                    trace!("coarse tune {tune_iteration}: {num_effective_loops} effective loops");
                    if num_effective_loops > 0 {
                        *top_network = self.find_top_modules_repeatedly_from_modules(
                            top_network,
                            objective,
                            allow_non_improving_hierarchy_levels,
                        );
                    }
                }
            }

            let new_codelength = partition_codelength(top_network, objective);
            let is_improvement = new_codelength
                <= old_codelength - self.config.core_loop_codelength_threshold
                && new_codelength
                    < old_codelength
                        - one_level_codelength * self.config.tune_iteration_relative_threshold;

            if !is_improvement {
                if coarse_tuned {
                    break;
                }
            } else {
                old_codelength = new_codelength;
            }

            do_fine_tune = !do_fine_tune;
        }
    }

    /// Top modules of `leaf_network` after repeated aggregation and tuning.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn optimize_two_level(
        &mut self,
        leaf_network: &ActiveNetwork,
        objective: &mut MapEquationObjective,
        one_level_codelength: f64,
        lock_first_loop: bool,
        allow_non_improving_hierarchy_levels: bool,
        initial_modules: Option<&[u32]>,
        tune_iteration_limit: u32,
    ) -> ActiveNetwork {
        let mut top_network = self.find_top_modules_repeatedly_from_leaf(
            leaf_network,
            objective,
            lock_first_loop,
            allow_non_improving_hierarchy_levels,
            initial_modules,
        );
        self.tune_top_modules(
            leaf_network,
            &mut top_network,
            objective,
            one_level_codelength,
            allow_non_improving_hierarchy_levels,
            tune_iteration_limit,
        );
        top_network
    }

    /// Repeatedly clusters the current top modules into super modules, coding
    /// each module by the flow entering it, while that shortens the index
    /// codelength.
    pub(crate) fn find_hierarchical_super_modules(
        &mut self,
        leaf_network: &ActiveNetwork,
        active_top: &ActiveNetwork,
        objective: &mut MapEquationObjective,
    ) -> SuperHierarchySearch {
        let mut active = active_top.clone();
        active.refresh_from_leaves(leaf_network);
        let mut old_index_length = partition_terms(&active, objective).1;
        let mut num_non_trivial_top_modules = usize::MAX;
        let mut super_assignments = Vec::<Vec<u32>>::new();

        while active.node_count() > 1 && num_non_trivial_top_modules > 1 {
            let mut super_active = active.clone();
            super_active.transform_node_flow_to_enter_flow();
            let super_leaf_network = super_active.with_compact_members();
            let mut super_objective = MapEquationObjective::new(&super_leaf_network.node_data());

            let super_one_level_codelength =
                partition_codelength(&super_leaf_network, &mut super_objective);
            let super_top = self.optimize_two_level(
                &super_leaf_network,
                &mut super_objective,
                super_one_level_codelength,
                false,
                true,
                None,
                self.config.tune_iteration_limit,
            );

            let super_assignment = super_top.assignment_to_leaves(super_leaf_network.node_count());
            let num_super_modules = assignment_module_count(&super_assignment);
            let trivial_solution =
                num_super_modules == 1 || num_super_modules == super_leaf_network.node_count();
            let (super_codelength, super_index_codelength) =
                partition_terms(&super_top, &mut super_objective);

            trace!(
                "super modules: {} candidates -> {} super modules, codelength {} vs index {} (new index {})",
                super_active.node_count(),
                num_super_modules,
                super_codelength,
                old_index_length,
                super_index_codelength
            );

            if trivial_solution {
                trace!("super modules rejected: trivial");
                break;
            }

            if super_codelength >= old_index_length - MIN_CODELENGTH_IMPROVEMENT {
                trace!("super modules rejected: no index improvement");
                break;
            }

            let mut super_module_members = vec![0u32; super_top.node_count()];
            for &m in &super_assignment {
                super_module_members[m as usize] += 1;
            }
            num_non_trivial_top_modules = super_module_members.iter().filter(|&&n| n > 1).count();

            let super_module_data = super_top.node_data();
            active = super_active.consolidate(&super_assignment, &super_module_data);
            active.refresh_from_leaves(leaf_network);
            super_assignments.push(super_assignment);
            old_index_length = super_index_codelength;
        }

        SuperHierarchySearch { super_assignments }
    }
}

/// Renumbers module labels to `0..k` in first-appearance order.
fn compact_assignment(graph: &Graph, assignment: &[u32]) -> Result<Vec<u32>> {
    if assignment.len() != graph.node_count() {
        return Err(Error::input(
            "assignment",
            format!(
                "has {} entries for {} nodes",
                assignment.len(),
                graph.node_count()
            ),
        ));
    }
    Ok(relabel_by_first_appearance(assignment).0)
}

/// Two-level codelength of `assignment` (node index -> module label) on a
/// graph with flow, evaluated from aggregated module data in one pass.
pub fn two_level_codelength(graph: &Graph, config: &Config, assignment: &[u32]) -> Result<f64> {
    let dense = compact_assignment(graph, assignment)?;
    let leaf_network = ActiveNetwork::from_graph(graph, config);
    let num_modules = assignment_module_count(&dense);
    let module_data = leaf_network.module_data(&dense, num_modules);
    let modules = leaf_network.consolidate(&dense, &module_data);
    let mut objective = MapEquationObjective::new(&leaf_network.node_data())
        .with_meta_data_rate(config.meta_data_rate);
    Ok(partition_codelength(&modules, &mut objective))
}

/// Same codelength as [`two_level_codelength`], reached by moving nodes one at
/// a time from singletons and tracking only the move deltas.
pub fn incremental_two_level_codelength(
    graph: &Graph,
    config: &Config,
    assignment: &[u32],
) -> Result<f64> {
    let dense = compact_assignment(graph, assignment)?;
    let leaf_network = ActiveNetwork::from_graph(graph, config);
    let mut objective = MapEquationObjective::new(&leaf_network.node_data())
        .with_meta_data_rate(config.meta_data_rate);
    Ok(incremental_codelength(&leaf_network, &mut objective, &dense))
}

use crate::error::{Error, Result};
use crate::network::Network;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Random-walk model used to turn link weights into stationary flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FlowModel {
    #[default]
    Undirected,
    Directed,
    /// Undirected steady state followed by one directed step.
    Undirdir,
    /// Like `Undirdir` but the initial state counts in-links only.
    Outdirdir,
    /// Flow proportional to raw link weights, no teleportation.
    Rawdir,
    /// Node and link flow supplied by the caller.
    Precomputed,
}

impl FlowModel {
    pub const ALL: [FlowModel; 6] = [
        FlowModel::Undirected,
        FlowModel::Directed,
        FlowModel::Undirdir,
        FlowModel::Outdirdir,
        FlowModel::Rawdir,
        FlowModel::Precomputed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FlowModel::Undirected => "undirected",
            FlowModel::Directed => "directed",
            FlowModel::Undirdir => "undirdir",
            FlowModel::Outdirdir => "outdirdir",
            FlowModel::Rawdir => "rawdir",
            FlowModel::Precomputed => "precomputed",
        }
    }

    /// Models whose initial steady state treats every link as bidirectional.
    #[inline]
    pub fn is_undirected_flow(self) -> bool {
        matches!(
            self,
            FlowModel::Undirected | FlowModel::Undirdir | FlowModel::Outdirdir
        )
    }

    /// Only the plain undirected model codes links symmetrically.
    #[inline]
    pub fn is_undirected_clustering(self) -> bool {
        self == FlowModel::Undirected
    }
}

impl fmt::Display for FlowModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        FlowModel::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::config("flow_model", format!("unknown flow model '{s}'")))
    }
}

/// Stream used for node and candidate-module shuffles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RngKind {
    #[default]
    Small,
    /// Mersenne twister with libc++ `uniform_int_distribution` draws.
    Mt19937,
}

/// Caller-supplied module assignment, keyed by state node id.
///
/// Each node maps to a module path from the top level down. Flat partitions
/// use one-element paths. Nodes left out are placed in singleton modules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitialPartition {
    paths: BTreeMap<u32, Vec<u32>>,
}

impl InitialPartition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_modules<I>(assignments: I) -> Self
    where
        I: IntoIterator<Item = (u32, u32)>,
    {
        let mut partition = Self::new();
        for (node, module) in assignments {
            partition.insert(node, module);
        }
        partition
    }

    pub fn from_paths<I>(paths: I) -> Self
    where
        I: IntoIterator<Item = (u32, Vec<u32>)>,
    {
        Self {
            paths: paths.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, node: u32, module: u32) {
        self.paths.insert(node, vec![module]);
    }

    pub fn insert_path(&mut self, node: u32, path: Vec<u32>) {
        self.paths.insert(node, path);
    }

    pub fn path(&self, node: u32) -> Option<&[u32]> {
        self.paths.get(&node).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &[u32])> + '_ {
        self.paths.iter().map(|(&node, path)| (node, path.as_slice()))
    }

    pub fn depth(&self) -> usize {
        self.paths.values().map(Vec::len).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub flow_model: FlowModel,
    pub directed: bool,
    pub teleportation_probability: f64,
    pub teleport_to_nodes: bool,
    pub markov_time: f64,
    pub include_self_links: bool,

    pub multilayer_relax_rate: Option<f64>,
    pub multilayer_relax_limit: Option<u32>,
    pub multilayer_relax_by_jsd: bool,

    pub meta_data_rate: f64,
    pub unweighted_meta_data: bool,

    pub two_level: bool,
    pub num_trials: u32,
    pub seed: u32,
    pub core_loop_limit: u32,
    pub core_loop_codelength_threshold: f64,
    pub tune_iteration_limit: u32,
    pub tune_iteration_relative_threshold: f64,
    pub fast_hierarchical_solution: u8,
    pub prefer_modular_solution: bool,
    pub only_super_modules: bool,
    pub no_coarse_tune: bool,
    pub no_infomap: bool,
    pub initial_partition: Option<InitialPartition>,

    pub hide_bipartite_nodes: bool,
    pub skip_adjust_bipartite_flow: bool,

    pub inner_parallelization: bool,
    pub trial_threads: Option<usize>,
    pub rng: RngKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flow_model: FlowModel::Undirected,
            directed: false,
            teleportation_probability: 0.15,
            teleport_to_nodes: false,
            markov_time: 1.0,
            include_self_links: false,
            multilayer_relax_rate: None,
            multilayer_relax_limit: None,
            multilayer_relax_by_jsd: false,
            meta_data_rate: 1.0,
            unweighted_meta_data: false,
            two_level: false,
            num_trials: 1,
            seed: 123,
            core_loop_limit: 10,
            core_loop_codelength_threshold: 1e-10,
            tune_iteration_limit: 0,
            tune_iteration_relative_threshold: 1e-5,
            fast_hierarchical_solution: 0,
            prefer_modular_solution: false,
            only_super_modules: false,
            no_coarse_tune: false,
            no_infomap: false,
            initial_partition: None,
            hide_bipartite_nodes: false,
            skip_adjust_bipartite_flow: false,
            inner_parallelization: false,
            trial_threads: None,
            rng: RngKind::Small,
        }
    }
}

fn check_finite(option: &'static str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(Error::config(option, format!("must be finite, got {value}")))
    }
}

impl Config {
    pub fn directed() -> Self {
        Self {
            flow_model: FlowModel::Directed,
            directed: true,
            ..Self::default()
        }
    }

    /// `directed` is shorthand for the directed model when no other model was chosen.
    pub fn resolved_flow_model(&self) -> FlowModel {
        if self.directed && self.flow_model == FlowModel::Undirected {
            FlowModel::Directed
        } else {
            self.flow_model
        }
    }

    #[inline]
    pub fn is_undirected_clustering(&self) -> bool {
        self.resolved_flow_model().is_undirected_clustering()
    }

    /// Core-loop sweep cap at a given aggregation level; 0 means unlimited.
    #[inline]
    pub fn loop_limit(&self, aggregation_level: usize) -> usize {
        let base = self.core_loop_limit as usize;
        if aggregation_level > 0 {
            base * 2
        } else {
            base
        }
    }

    /// Checks the options on their own.
    pub fn validate(&self) -> Result<()> {
        check_finite("teleportation_probability", self.teleportation_probability)?;
        if !(0.0..1.0).contains(&self.teleportation_probability) {
            return Err(Error::config(
                "teleportation_probability",
                format!("must be in [0, 1), got {}", self.teleportation_probability),
            ));
        }

        check_finite("markov_time", self.markov_time)?;
        if self.markov_time <= 0.0 {
            return Err(Error::config(
                "markov_time",
                format!("must be positive, got {}", self.markov_time),
            ));
        }

        if let Some(rate) = self.multilayer_relax_rate {
            check_finite("multilayer_relax_rate", rate)?;
            if !(0.0..=1.0).contains(&rate) {
                return Err(Error::config(
                    "multilayer_relax_rate",
                    format!("must be in [0, 1], got {rate}"),
                ));
            }
        } else if self.multilayer_relax_limit.is_some() || self.multilayer_relax_by_jsd {
            let option = if self.multilayer_relax_by_jsd {
                "multilayer_relax_by_jsd"
            } else {
                "multilayer_relax_limit"
            };
            return Err(Error::config(
                option,
                "requires multilayer_relax_rate to be set",
            ));
        }

        check_finite("meta_data_rate", self.meta_data_rate)?;
        if self.meta_data_rate < 0.0 {
            return Err(Error::config(
                "meta_data_rate",
                format!("must be non-negative, got {}", self.meta_data_rate),
            ));
        }

        if self.num_trials == 0 {
            return Err(Error::config("num_trials", "must be at least 1"));
        }

        check_finite(
            "core_loop_codelength_threshold",
            self.core_loop_codelength_threshold,
        )?;
        if self.core_loop_codelength_threshold < 0.0 {
            return Err(Error::config(
                "core_loop_codelength_threshold",
                "must be non-negative",
            ));
        }
        check_finite(
            "tune_iteration_relative_threshold",
            self.tune_iteration_relative_threshold,
        )?;
        if self.tune_iteration_relative_threshold < 0.0 {
            return Err(Error::config(
                "tune_iteration_relative_threshold",
                "must be non-negative",
            ));
        }

        if self.fast_hierarchical_solution > 3 {
            return Err(Error::config(
                "fast_hierarchical_solution",
                format!("must be 0..=3, got {}", self.fast_hierarchical_solution),
            ));
        }

        if self.trial_threads == Some(0) {
            return Err(Error::config("trial_threads", "must be at least 1"));
        }

        if self.directed
            && self.flow_model.is_undirected_flow()
            && self.flow_model != FlowModel::Undirected
        {
            return Err(Error::config(
                "directed",
                format!("contradicts flow model '{}'", self.flow_model),
            ));
        }

        if let Some(partition) = &self.initial_partition {
            if let Some((node, _)) = partition.iter().find(|(_, path)| path.is_empty()) {
                return Err(Error::config(
                    "initial_partition",
                    format!("node {node} has an empty module path"),
                ));
            }
        }

        Ok(())
    }

    /// Checks the options against the network they will run on.
    pub fn validate_for(&self, network: &Network) -> Result<()> {
        self.validate()?;

        if self.resolved_flow_model() == FlowModel::Precomputed {
            if let Some(id) = network.first_node_without_flow() {
                return Err(Error::config(
                    "flow_model",
                    format!("precomputed flow requires flow on every node, node {id} has none"),
                ));
            }
        }

        if !network.is_multilayer()
            && (self.multilayer_relax_rate.is_some()
                || self.multilayer_relax_limit.is_some()
                || self.multilayer_relax_by_jsd)
        {
            return Err(Error::config(
                "multilayer_relax_rate",
                "multilayer options given for a network without layers",
            ));
        }

        if self.multilayer_relax_rate.is_some() && network.has_inter_layer_links() {
            return Err(Error::config(
                "multilayer_relax_rate",
                "explicit inter-layer links cannot be combined with simulated relaxation",
            ));
        }

        if self.hide_bipartite_nodes && network.bipartite_start_id().is_none() {
            return Err(Error::config(
                "hide_bipartite_nodes",
                "network has no bipartite start id",
            ));
        }

        if let Some(partition) = &self.initial_partition {
            if let Some((node, _)) = partition
                .iter()
                .find(|(node, _)| !network.contains_state_node(*node))
            {
                return Err(Error::config(
                    "initial_partition",
                    format!("node {node} is not in the network"),
                ));
            }
        }

        Ok(())
    }
}

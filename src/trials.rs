use crate::aggregate::ActiveNetwork;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::flow::calculate_flow;
use crate::graph::Graph;
use crate::hierarchy::{
    hierarchy_from_partition, initial_top_modules, partition_network, CodelengthTerms,
    HierarchyResult,
};
use crate::network::Network;
use crate::optimizer::Search;
use crate::rng::seed_for_trial;
use crate::tree::InfoTree;
use log::{debug, info};
use rayon::prelude::*;
use std::sync::Mutex;

/// Summary of one finished trial.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialSummary {
    pub trial: u32,
    pub seed: u32,
    pub codelength: f64,
}

struct TrialOutcome {
    summary: TrialSummary,
    hierarchy: HierarchyResult,
    terms: CodelengthTerms,
}

impl TrialOutcome {
    fn improves_on(&self, other: &TrialOutcome) -> bool {
        let a = &self.summary;
        let b = &other.summary;
        a.codelength < b.codelength || (a.codelength == b.codelength && a.trial < b.trial)
    }
}

/// Best finished trial so far, shared by the trial workers.
#[derive(Default)]
struct BestSlot {
    inner: Mutex<Option<TrialOutcome>>,
}

impl BestSlot {
    /// Keeps `outcome` if it codes shorter than the current best; equal
    /// codelengths go to the lower trial index.
    fn offer(&self, outcome: TrialOutcome) -> Result<()> {
        let mut best = self
            .inner
            .lock()
            .map_err(|_| Error::Logic("best trial slot poisoned by a panicked trial".into()))?;
        let replace = best
            .as_ref()
            .map_or(true, |current| outcome.improves_on(current));
        if replace {
            *best = Some(outcome);
        }
        Ok(())
    }

    fn into_inner(self) -> Result<Option<TrialOutcome>> {
        self.inner
            .into_inner()
            .map_err(|_| Error::Logic("best trial slot poisoned by a panicked trial".into()))
    }
}

fn env_trial_threads() -> Option<usize> {
    ["INFOMAP_TRIAL_THREADS", "RAYON_NUM_THREADS"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .filter_map(|value| value.trim().parse::<usize>().ok())
        .find(|&n| n > 0)
}

/// Worker count for `trials` trials: explicit request, then environment,
/// then available parallelism, never more than the trial count.
fn resolve_trial_threads(trials: u32, requested_threads: Option<usize>) -> usize {
    let default_threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    let threads = requested_threads
        .filter(|&n| n > 0)
        .or_else(env_trial_threads)
        .unwrap_or(default_threads);
    threads.min(trials as usize).max(1)
}

fn run_trial(
    config: &Config,
    leaf_network: &ActiveNetwork,
    initial_modules: Option<&[u32]>,
    trial: u32,
) -> Result<TrialOutcome> {
    let seed = seed_for_trial(config.seed, trial);
    let mut search = Search::new(config, seed);
    let hierarchy = partition_network(&mut search, leaf_network, initial_modules);
    let terms = hierarchy.codelength_terms(leaf_network, config.meta_data_rate);
    let codelength = terms.total();
    if !codelength.is_finite() {
        return Err(Error::numerical(
            "optimization",
            format!("trial {trial} (seed {seed}) produced codelength {codelength}"),
        ));
    }
    debug!(
        "trial {trial} (seed {seed}): codelength {codelength:.9}, {} levels, {} top modules",
        hierarchy.levels,
        hierarchy.top_modules.len()
    );
    Ok(TrialOutcome {
        summary: TrialSummary {
            trial,
            seed,
            codelength,
        },
        hierarchy,
        terms,
    })
}

fn run_trials(
    config: &Config,
    graph: &Graph,
    leaf_network: &ActiveNetwork,
) -> Result<(Vec<TrialSummary>, TrialOutcome)> {
    let initial_modules = config
        .initial_partition
        .as_ref()
        .map(|partition| initial_top_modules(graph, partition));
    let initial_modules = initial_modules.as_deref();
    let num_trials = config.num_trials;
    let threads = resolve_trial_threads(num_trials, config.trial_threads);
    info!("running {num_trials} trials on {threads} threads");

    let best = BestSlot::default();
    let summaries: Vec<TrialSummary> = if threads == 1 {
        let mut out = Vec::with_capacity(num_trials as usize);
        for trial in 0..num_trials {
            let outcome = run_trial(config, leaf_network, initial_modules, trial)?;
            out.push(outcome.summary);
            best.offer(outcome)?;
        }
        out
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| Error::config("trial_threads", e.to_string()))?;
        pool.install(|| {
            (0..num_trials)
                .into_par_iter()
                .map(|trial| {
                    let outcome = run_trial(config, leaf_network, initial_modules, trial)?;
                    let summary = outcome.summary;
                    best.offer(outcome)?;
                    Ok(summary)
                })
                .collect::<Result<Vec<_>>>()
        })?
    };

    let best = best
        .into_inner()?
        .ok_or_else(|| Error::Logic("no trial finished".into()))?;
    Ok((summaries, best))
}

/// Runs the configured number of trials on a network and keeps the best tree.
#[derive(Debug)]
pub struct TrialDriver {
    config: Config,
    trials: Vec<TrialSummary>,
    best_trial: Option<u32>,
    tree: Option<InfoTree>,
}

impl TrialDriver {
    /// Fails on options that are invalid on their own.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            trials: Vec::new(),
            best_trial: None,
            tree: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Compiles `network`, computes flow and runs all trials, or scores the
    /// configured initial partition when `no_infomap` is set. Results of a
    /// previous run are replaced.
    pub fn run(&mut self, network: &Network) -> Result<&InfoTree> {
        self.trials.clear();
        self.best_trial = None;
        self.tree = None;

        let config = &self.config;
        let mut graph = network.compile(config)?;
        calculate_flow(&mut graph, config)?;
        let leaf_network = ActiveNetwork::from_graph(&graph, config);
        let one_level_codelength = HierarchyResult::one_level(graph.node_count())
            .codelength_terms(&leaf_network, config.meta_data_rate)
            .total();

        let best = if config.no_infomap {
            let hierarchy = hierarchy_from_partition(
                &graph,
                &leaf_network,
                config.initial_partition.as_ref(),
            );
            let terms = hierarchy.codelength_terms(&leaf_network, config.meta_data_rate);
            let summary = TrialSummary {
                trial: 0,
                seed: config.seed,
                codelength: terms.total(),
            };
            debug!("scored given partition: codelength {:.9}", summary.codelength);
            self.trials.push(summary);
            TrialOutcome {
                summary,
                hierarchy,
                terms,
            }
        } else {
            let (trials, best) = run_trials(config, &graph, &leaf_network)?;
            self.trials = trials;
            best
        };

        let tree = InfoTree::build(
            &graph,
            &leaf_network,
            &best.hierarchy,
            &best.terms,
            one_level_codelength,
            config.unweighted_meta_data,
            config.hide_bipartite_nodes,
        );
        info!(
            "best codelength {:.9} from trial {} of {}: {} levels, {} top modules, one-level {:.9}",
            tree.codelength(),
            best.summary.trial,
            self.trials.len(),
            tree.num_levels(),
            tree.num_top_modules(),
            one_level_codelength
        );
        self.best_trial = Some(best.summary.trial);
        Ok(self.tree.insert(tree))
    }

    /// The best tree of the last run.
    pub fn tree(&self) -> Result<&InfoTree> {
        self.tree
            .as_ref()
            .ok_or_else(|| Error::Logic("no result tree: run has not completed".into()))
    }

    /// Codelength of every trial of the last run, in trial order.
    pub fn codelengths(&self) -> Vec<f64> {
        self.trials.iter().map(|t| t.codelength).collect()
    }

    pub fn trials(&self) -> &[TrialSummary] {
        &self.trials
    }

    /// Index of the trial whose tree was kept.
    pub fn best_trial(&self) -> Option<u32> {
        self.best_trial
    }
}

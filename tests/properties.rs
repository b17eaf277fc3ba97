use infomap_core::{
    calculate_flow, incremental_two_level_codelength, two_level_codelength, Config, Error,
    FlowModel, Graph, InfoTree, InitialPartition, Network, RngKind, TrialDriver,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, Once};
use std::thread::{self, ThreadId};

/// Three dense groups of five with a few links between them.
fn planted_network() -> Network {
    let mut network = Network::new();
    for group in 0..3u32 {
        let base = group * 5;
        for i in 0..5 {
            for j in (i + 1)..5 {
                network.add_link(base + i, base + j, 1.0).unwrap();
            }
        }
    }
    network.add_link(4, 5, 0.5).unwrap();
    network.add_link(9, 10, 0.5).unwrap();
    network.add_link(14, 0, 0.5).unwrap();
    network
}

fn directed_network() -> Network {
    let mut network = Network::new();
    for &(s, t, w) in &[
        (0, 1, 1.0),
        (1, 2, 1.0),
        (2, 0, 1.0),
        (2, 3, 0.5),
        (3, 4, 1.0),
        (4, 5, 1.0),
        (5, 3, 1.0),
        (5, 6, 2.0),
        (6, 0, 1.0),
    ] {
        network.add_link(s, t, w).unwrap();
    }
    network
}

fn compiled(network: &Network, config: &Config) -> Graph {
    let mut graph = network.compile(config).unwrap();
    calculate_flow(&mut graph, config).unwrap();
    graph
}

#[test]
fn leaf_flow_sums_to_one_for_every_walk_model() {
    let network = directed_network();
    for model in [
        FlowModel::Undirected,
        FlowModel::Directed,
        FlowModel::Undirdir,
        FlowModel::Outdirdir,
        FlowModel::Rawdir,
    ] {
        let config = Config {
            flow_model: model,
            ..Config::default()
        };
        let graph = compiled(&network, &config);
        let sum = graph.node_flow_sum();
        assert!((sum - 1.0).abs() < 1e-9, "{model:?} sums to {sum}");
        assert!(graph.nodes.iter().all(|n| n.data.flow >= 0.0));
    }
}

#[test]
fn precomputed_flow_is_normalized() {
    let mut network = directed_network();
    for id in 0..7 {
        network.set_node_flow(id, (id + 1) as f64).unwrap();
    }
    let config = Config {
        flow_model: FlowModel::Precomputed,
        ..Config::default()
    };
    let graph = compiled(&network, &config);
    assert!((graph.node_flow_sum() - 1.0).abs() < 1e-9);
    assert!(graph.nodes[6].data.flow > graph.nodes[0].data.flow);
}

#[test]
fn node_teleport_weights_shift_directed_flow() {
    let mut network = Network::new();
    for &(s, t) in &[(0, 1), (1, 2), (2, 0)] {
        network.add_link(s, t, 1.0).unwrap();
    }
    network.set_node_teleport_weight(0, 4.0).unwrap();

    let uniform = compiled(&network, &Config::directed());
    for node in &uniform.nodes {
        assert!((node.data.flow - 1.0 / 3.0).abs() < 1e-9);
    }

    let config = Config {
        teleport_to_nodes: true,
        ..Config::directed()
    };
    let weighted = compiled(&network, &config);
    assert!((weighted.node_flow_sum() - 1.0).abs() < 1e-9);
    // Flow arriving at 1 comes from the heavily teleported node 0.
    assert!(weighted.nodes[1].data.flow > weighted.nodes[0].data.flow);
}

#[test]
fn removed_links_return_their_aggregated_weight() {
    let mut network = Network::new();
    network.add_link(0, 1, 1.0).unwrap();
    network.add_link(0, 1, 0.5).unwrap();
    network.add_link(1, 2, 1.0).unwrap();
    assert_eq!(network.link_count(), 2);

    assert_eq!(network.remove_link(0, 1), Some(1.5));
    assert_eq!(network.remove_link(0, 1), None);
    assert_eq!(network.link_count(), 1);
}

#[test]
fn incremental_moves_reach_full_codelength() {
    let assignments: [&[u32]; 4] = [
        &[0; 15],
        &[0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2],
        &[0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0],
        &[7, 7, 3, 3, 3, 9, 9, 9, 1, 1, 1, 1, 4, 4, 4],
    ];
    for config in [Config::default(), Config::directed()] {
        let graph = compiled(&planted_network(), &config);
        for assignment in assignments {
            let full = two_level_codelength(&graph, &config, assignment).unwrap();
            let incremental = incremental_two_level_codelength(&graph, &config, assignment).unwrap();
            assert!(
                (full - incremental).abs() < 1e-10,
                "full {full} vs incremental {incremental} for {assignment:?}"
            );
        }
    }
}

#[test]
fn incremental_moves_reach_full_codelength_with_memory() {
    let mut network = Network::new();
    // Two physical nodes each seen from two states.
    for (state, physical) in [(0, 0), (1, 0), (2, 1), (3, 1), (4, 2), (5, 3)] {
        network.add_state_node(state, physical).unwrap();
    }
    for &(s, t) in &[(0, 2), (2, 4), (4, 0), (1, 3), (3, 5), (5, 1), (0, 3)] {
        network.add_link(s, t, 1.0).unwrap();
    }
    let config = Config::directed();
    let graph = compiled(&network, &config);
    assert!(graph.has_memory());

    for assignment in [[0u32, 0, 0, 1, 1, 1], [0, 1, 0, 1, 0, 1], [0, 0, 1, 1, 2, 2]] {
        let full = two_level_codelength(&graph, &config, &assignment).unwrap();
        let incremental = incremental_two_level_codelength(&graph, &config, &assignment).unwrap();
        assert!((full - incremental).abs() < 1e-10);
    }
}

#[test]
fn same_seed_gives_same_result() {
    let network = planted_network();
    for rng in [RngKind::Small, RngKind::Mt19937] {
        let config = Config {
            seed: 7,
            num_trials: 3,
            rng,
            ..Config::default()
        };
        let mut first = TrialDriver::new(config.clone()).unwrap();
        let mut second = TrialDriver::new(config).unwrap();
        let a = first.run(&network).unwrap().clone();
        let b = second.run(&network).unwrap().clone();

        assert_eq!(a.codelength(), b.codelength());
        assert_eq!(a.module_ids(-1), b.module_ids(-1));
        assert_eq!(first.codelengths(), second.codelengths());
    }
}

#[test]
fn parallel_trials_match_serial_trials() {
    let network = directed_network();
    let serial = Config {
        directed: true,
        num_trials: 6,
        trial_threads: Some(1),
        ..Config::default()
    };
    let parallel = Config {
        trial_threads: Some(4),
        ..serial.clone()
    };

    let mut serial_driver = TrialDriver::new(serial).unwrap();
    let mut parallel_driver = TrialDriver::new(parallel).unwrap();
    let a = serial_driver.run(&network).unwrap().clone();
    let b = parallel_driver.run(&network).unwrap().clone();

    assert_eq!(serial_driver.codelengths(), parallel_driver.codelengths());
    assert_eq!(serial_driver.best_trial(), parallel_driver.best_trial());
    assert_eq!(a.codelength(), b.codelength());
    assert_eq!(a.module_ids(-1), b.module_ids(-1));
}

#[test]
fn best_trial_has_lowest_codelength() {
    let config = Config {
        num_trials: 5,
        seed: 99,
        ..Config::default()
    };
    let mut driver = TrialDriver::new(config).unwrap();
    let codelength = driver.run(&planted_network()).unwrap().codelength();
    let codelengths = driver.codelengths();
    assert_eq!(codelengths.len(), 5);

    let min = codelengths.iter().copied().fold(f64::INFINITY, f64::min);
    assert_eq!(codelength, min);
    let best = driver.best_trial().unwrap() as usize;
    assert_eq!(codelengths[best], min);
    assert!(codelengths[..best].iter().all(|&c| c > min));
}

#[test]
fn scoring_a_partition_is_idempotent() {
    let partition = InitialPartition::from_modules((0..15).map(|id| (id, id / 5)));
    let config = Config {
        no_infomap: true,
        initial_partition: Some(partition.clone()),
        ..Config::default()
    };
    let network = planted_network();
    let mut driver = TrialDriver::new(config).unwrap();
    let first = driver.run(&network).unwrap().codelength();
    let second = driver.run(&network).unwrap().codelength();

    assert_eq!(first, second);
    assert_eq!(driver.config().initial_partition.as_ref(), Some(&partition));
    let modules = driver.tree().unwrap().module_ids(1);
    for id in 0..15 {
        assert_eq!(modules[&id], modules[&(id - id % 5)]);
    }
}

#[test]
fn scoring_without_partition_gives_one_level() {
    let config = Config {
        no_infomap: true,
        ..Config::default()
    };
    let mut driver = TrialDriver::new(config).unwrap();
    let tree = driver.run(&planted_network()).unwrap();
    assert_eq!(tree.codelength(), tree.one_level_codelength());
    assert_eq!(tree.num_top_modules(), 0);
}

#[test]
fn optimized_codelength_never_exceeds_one_level() {
    let networks = [planted_network(), directed_network()];
    for network in &networks {
        for config in [
            Config::default(),
            Config::directed(),
            Config {
                two_level: true,
                ..Config::default()
            },
            Config {
                fast_hierarchical_solution: 3,
                ..Config::default()
            },
        ] {
            let mut driver = TrialDriver::new(config).unwrap();
            let tree = driver.run(network).unwrap();
            assert!(tree.codelength() <= tree.one_level_codelength() + 1e-12);
            assert!(tree.relative_codelength_savings() >= -1e-12);
        }
    }
}

#[test]
fn codelength_is_sum_of_its_parts() {
    for fast in 0..=3 {
        let config = Config {
            fast_hierarchical_solution: fast,
            ..Config::default()
        };
        let mut driver = TrialDriver::new(config).unwrap();
        let tree = driver.run(&planted_network()).unwrap();
        let parts = tree.index_codelength() + tree.module_codelength() + tree.meta_codelength();
        assert!((tree.codelength() - parts).abs() < 1e-12);

        let per_node: f64 = tree.iter().map(|node| node.codelength).sum();
        assert!((tree.codelength() - per_node).abs() < 1e-9);
    }
}

#[test]
fn planted_groups_are_recovered() {
    let mut driver = TrialDriver::new(Config::default()).unwrap();
    let tree = driver.run(&planted_network()).unwrap();
    let modules = tree.module_ids(-1);
    for group in 0..3u32 {
        let base = group * 5;
        for i in 1..5 {
            assert_eq!(modules[&base], modules[&(base + i)]);
        }
    }
    assert_ne!(modules[&0], modules[&5]);
    assert_ne!(modules[&5], modules[&10]);
}

#[test]
fn inner_parallel_moves_are_reproducible() {
    let config = Config {
        inner_parallelization: true,
        ..Config::default()
    };
    let network = planted_network();
    let mut first = TrialDriver::new(config.clone()).unwrap();
    let mut second = TrialDriver::new(config).unwrap();
    let a = first.run(&network).unwrap().clone();
    let b = second.run(&network).unwrap().clone();

    assert_eq!(a.codelength(), b.codelength());
    assert_eq!(a.module_ids(1), b.module_ids(1));
    assert!(a.codelength() < a.one_level_codelength());
}

#[test]
fn markov_time_coarsens_modules() {
    let network = planted_network();
    let mut short = TrialDriver::new(Config {
        markov_time: 0.5,
        ..Config::default()
    })
    .unwrap();
    let mut long = TrialDriver::new(Config {
        markov_time: 50.0,
        ..Config::default()
    })
    .unwrap();
    let short_modules = short.run(&network).unwrap().num_top_modules();
    let long_modules = long.run(&network).unwrap().num_top_modules();
    assert!(long_modules <= short_modules);
}

#[test]
#[ignore = "larger random network, slow in debug builds"]
fn larger_network_search_is_deterministic() {
    let mut network = Network::new();
    let mut state = 12345u64;
    for _ in 0..2000 {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let s = (state >> 33) as u32 % 300;
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let t = if state % 4 == 0 {
            (state >> 33) as u32 % 300
        } else {
            s / 20 * 20 + (state >> 33) as u32 % 20
        };
        if s != t {
            network.add_link(s, t, 1.0).unwrap();
        }
    }
    let config = Config {
        num_trials: 4,
        trial_threads: Some(2),
        ..Config::default()
    };
    let mut first = TrialDriver::new(config.clone()).unwrap();
    let mut second = TrialDriver::new(config).unwrap();
    let a = first.run(&network).unwrap().codelength();
    let b = second.run(&network).unwrap().codelength();
    assert_eq!(a, b);
    assert_eq!(first.codelengths(), second.codelengths());
}

#[test]
fn power_iteration_without_teleportation_can_fail_to_converge() {
    // A lopsided 3-cycle: without teleportation the flow rotates forever.
    let mut network = Network::new();
    for &(s, t, w) in &[(0, 1, 4.0), (1, 2, 1.0), (2, 0, 1.0)] {
        network.add_link(s, t, w).unwrap();
    }
    let config = Config {
        teleportation_probability: 0.0,
        ..Config::directed()
    };
    let mut graph = network.compile(&config).unwrap();
    let err = calculate_flow(&mut graph, &config).unwrap_err();
    assert!(
        matches!(err, Error::Numerical { stage: "power iteration", .. }),
        "{err}"
    );

    let mut driver = TrialDriver::new(config).unwrap();
    assert!(driver.run(&network).is_err());

    let graph = compiled(&network, &Config::directed());
    assert!((graph.node_flow_sum() - 1.0).abs() < 1e-9);
}

#[test]
fn self_links_carry_flow_only_when_included() {
    let mut network = Network::new();
    for &(s, t, w) in &[(0, 1, 1.0), (1, 2, 1.0), (2, 0, 1.0), (0, 0, 2.0)] {
        network.add_link(s, t, w).unwrap();
    }

    let dropped = compiled(&network, &Config::default());
    assert_eq!(dropped.edge_count(), 3);
    assert_eq!(dropped.self_link_weight, 0.0);
    for node in &dropped.nodes {
        assert!((node.data.flow - 1.0 / 3.0).abs() < 1e-12);
    }

    let config = Config {
        include_self_links: true,
        ..Config::default()
    };
    let kept = compiled(&network, &config);
    assert_eq!(kept.edge_count(), 4);
    assert_eq!(kept.self_link_weight, 2.0);
    // Node 0 owns the self-link weight on top of its two links.
    assert!((kept.nodes[0].data.flow - 0.5).abs() < 1e-12);
    assert!((kept.nodes[1].data.flow - 0.25).abs() < 1e-12);
    for e in 0..kept.edge_count() {
        if kept.edge_source[e] == kept.edge_target[e] {
            assert_eq!(kept.edge_coding_flow[e], 0.0);
        }
    }
}

#[test]
fn bipartite_feature_flow_moves_to_ordinary_nodes_unless_skipped() {
    let mut network = Network::new();
    for &(s, t) in &[(0, 10), (1, 10), (2, 11), (3, 11)] {
        network.add_link(s, t, 1.0).unwrap();
    }
    network.set_bipartite_start_id(10);

    let adjusted = compiled(&network, &Config::default());
    let skipped = compiled(
        &network,
        &Config {
            skip_adjust_bipartite_flow: true,
            ..Config::default()
        },
    );
    for graph in [&adjusted, &skipped] {
        assert!((graph.node_flow_sum() - 1.0).abs() < 1e-9);
    }

    let feature_flow = |graph: &Graph| -> f64 {
        graph
            .nodes
            .iter()
            .filter(|node| node.is_feature)
            .map(|node| node.data.flow)
            .sum()
    };
    assert_eq!(feature_flow(&adjusted), 0.0);
    assert!((feature_flow(&skipped) - 0.5).abs() < 1e-12);
    for node in adjusted.nodes.iter().filter(|node| !node.is_feature) {
        assert!((node.data.flow - 0.25).abs() < 1e-12);
    }
}

#[test]
fn entropy_rate_counts_branching_steps() {
    let mut cycle = Network::new();
    for &(s, t) in &[(0, 1), (1, 2), (2, 0)] {
        cycle.add_link(s, t, 1.0).unwrap();
    }
    let graph = compiled(&cycle, &Config::directed());
    assert!(graph.entropy_rate.abs() < 1e-12);

    // Node 0 splits its flow evenly over two links, one bit per visit.
    let mut branching = Network::new();
    for &(s, t) in &[(0, 1), (0, 2), (1, 0), (2, 0)] {
        branching.add_link(s, t, 1.0).unwrap();
    }
    let graph = compiled(&branching, &Config::directed());
    let hub = graph.index_of(0).unwrap();
    assert!(graph.entropy_rate > 0.3);
    assert!((graph.entropy_rate - graph.nodes[hub].data.flow).abs() < 1e-12);

    let mut driver = TrialDriver::new(Config::directed()).unwrap();
    let tree = driver.run(&branching).unwrap();
    assert!((tree.entropy_rate() - graph.entropy_rate).abs() < 1e-12);
}

/// State ids of the leaves below tree node `module`.
fn leaf_ids_under(tree: &InfoTree, module: usize) -> BTreeSet<u32> {
    tree.pre_order()
        .filter(|&idx| {
            let mut ancestor = tree.node(idx).unwrap().parent;
            while let Some(parent) = ancestor {
                if parent == module {
                    return true;
                }
                ancestor = tree.node(parent).unwrap().parent;
            }
            false
        })
        .filter_map(|idx| tree.node(idx).unwrap().leaf.as_ref().map(|leaf| leaf.state_id))
        .collect()
}

#[test]
fn directed_module_flow_counts_link_flow_only() {
    let network = directed_network();
    let config = Config {
        no_infomap: true,
        initial_partition: Some(InitialPartition::from_modules(
            (0..7).map(|id| (id, u32::from(id >= 3))),
        )),
        ..Config::directed()
    };
    let graph = compiled(&network, &config);

    // The final step leaves teleportation out: node flow is incoming link flow.
    for (idx, node) in graph.nodes.iter().enumerate() {
        let incoming: f64 = (0..graph.edge_count())
            .filter(|&e| graph.edge_target[e] as usize == idx)
            .map(|e| graph.edge_flow[e])
            .sum();
        assert!((node.data.flow - incoming).abs() < 1e-12);
    }

    let mut driver = TrialDriver::new(config).unwrap();
    let tree = driver.run(&network).unwrap();
    assert_eq!(tree.num_top_modules(), 2);
    for &module in &tree.root().children {
        let members = leaf_ids_under(tree, module);
        let inside = |idx: u32| members.contains(&graph.nodes[idx as usize].id);
        let mut exit = 0.0;
        let mut enter = 0.0;
        for e in 0..graph.edge_count() {
            let (s, t) = (graph.edge_source[e], graph.edge_target[e]);
            if inside(s) && !inside(t) {
                exit += graph.edge_coding_flow[e];
            } else if !inside(s) && inside(t) {
                enter += graph.edge_coding_flow[e];
            }
        }
        let data = &tree.node(module).unwrap().data;
        assert!(exit > 0.0);
        assert!((data.exit_flow - exit).abs() < 1e-12);
        assert!((data.enter_flow - enter).abs() < 1e-12);
    }
}

/// Three strongly linked pairs on a ring. Any modular split codes longer
/// than one level, but splitting off pairs is a local optimum.
fn ring_of_pairs() -> Network {
    let mut network = Network::new();
    for pair in 0..3u32 {
        let a = 2 * pair;
        network.add_link(a, a + 1, 1.0).unwrap();
        network.add_link(a + 1, (a + 2) % 6, 0.5625).unwrap();
    }
    network
}

#[test]
fn modular_solution_is_kept_only_when_preferred() {
    let network = ring_of_pairs();

    let mut driver = TrialDriver::new(Config::default()).unwrap();
    let collapsed = driver.run(&network).unwrap();
    assert!((collapsed.codelength() - collapsed.one_level_codelength()).abs() < 1e-9);
    assert!(collapsed.num_top_modules() <= 1);

    let mut driver = TrialDriver::new(Config {
        prefer_modular_solution: true,
        ..Config::default()
    })
    .unwrap();
    let modular = driver.run(&network).unwrap();
    assert!(modular.num_top_modules() > 1);
    assert!(modular.codelength() > modular.one_level_codelength() + 0.05);
}

#[test]
fn module_ids_follow_each_level_of_a_given_hierarchy() {
    // Group 0 splits in two sub-modules, group 1 has one, group 2 none.
    let partition = InitialPartition::from_paths((0..15u32).map(|id| {
        let path = match id {
            0..=2 => vec![0, 0],
            3..=4 => vec![0, 1],
            5..=9 => vec![1, 0],
            _ => vec![2],
        };
        (id, path)
    }));
    let config = Config {
        no_infomap: true,
        initial_partition: Some(partition),
        ..Config::default()
    };
    let mut driver = TrialDriver::new(config).unwrap();
    let tree = driver.run(&planted_network()).unwrap();
    assert_eq!(tree.num_levels(), 3);

    let top = tree.module_ids(1);
    let second = tree.module_ids(2);
    let distinct = |ids: &BTreeMap<u32, u32>| -> BTreeSet<u32> {
        ids.values().copied().collect()
    };
    assert_eq!(distinct(&top), (1..=3).collect());
    assert_eq!(distinct(&second), (1..=4).collect());

    assert_eq!(second[&0], second[&2]);
    assert_eq!(second[&3], second[&4]);
    assert_ne!(second[&0], second[&3]);
    for id in 6..10 {
        assert_eq!(second[&5], second[&id]);
    }
    // Group 2 sits directly under its top module at every deeper level.
    for id in 11..15 {
        assert_eq!(second[&10], second[&id]);
    }

    // Level 2 refines level 1.
    for (&a, &module_a) in &second {
        for (&b, &module_b) in &second {
            if module_a == module_b {
                assert_eq!(top[&a], top[&b]);
            }
        }
    }
    assert_eq!(tree.module_ids(3), second);
    assert_eq!(tree.module_ids(-1), second);
}

/// Log lines recorded per thread, so concurrently running tests stay apart.
struct Recorder(Mutex<Vec<(ThreadId, String)>>);

impl log::Log for Recorder {
    fn enabled(&self, _: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        if let Ok(mut lines) = self.0.lock() {
            lines.push((thread::current().id(), record.args().to_string()));
        }
    }

    fn flush(&self) {}
}

static RECORDER: Recorder = Recorder(Mutex::new(Vec::new()));

/// Runs one single-threaded trial and returns the log lines it emitted.
fn search_log(network: &Network, config: Config) -> Vec<String> {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        log::set_logger(&RECORDER).unwrap();
        log::set_max_level(log::LevelFilter::Trace);
    });
    let me = thread::current().id();
    RECORDER.0.lock().unwrap().retain(|(id, _)| *id != me);

    let config = Config {
        num_trials: 1,
        trial_threads: Some(1),
        inner_parallelization: false,
        ..config
    };
    let mut driver = TrialDriver::new(config).unwrap();
    driver.run(network).unwrap();

    RECORDER
        .0
        .lock()
        .unwrap()
        .iter()
        .filter(|(id, _)| *id == me)
        .map(|(_, line)| line.clone())
        .collect()
}

/// (aggregation level, effective loops) of every core-loop level line.
fn level_loops(lines: &[String]) -> Vec<(usize, u32)> {
    lines
        .iter()
        .filter_map(|line| {
            let rest = line.strip_prefix("level ")?;
            let (level, rest) = rest.split_once(':')?;
            let (_, loops) = rest.strip_suffix(" effective loops")?.rsplit_once(' ')?;
            Some((level.parse().ok()?, loops.parse().ok()?))
        })
        .collect()
}

/// (kind, iteration) of every tune line, kind being "fine" or "coarse".
fn tune_steps(lines: &[String]) -> Vec<(String, u32)> {
    lines
        .iter()
        .filter_map(|line| {
            let (kind, rest) = line.split_once(" tune ")?;
            let (iteration, _) = rest.split_once(':')?;
            Some((kind.to_string(), iteration.parse().ok()?))
        })
        .collect()
}

#[test]
fn core_loop_limit_caps_sweeps_per_level() {
    let network = planted_network();
    let unlimited = level_loops(&search_log(&network, Config::default()));
    assert!(!unlimited.is_empty());
    assert!(unlimited.iter().any(|&(_, loops)| loops >= 1));

    let limited = level_loops(&search_log(
        &network,
        Config {
            core_loop_limit: 1,
            ..Config::default()
        },
    ));
    assert!(!limited.is_empty());
    for &(level, loops) in &limited {
        // Aggregated levels get twice the base limit.
        let cap = if level == 0 { 1 } else { 2 };
        assert!(loops <= cap, "level {level} ran {loops} effective loops");
    }
}

#[test]
fn core_loop_threshold_stops_sweeps_without_large_gains() {
    let lines = search_log(
        &planted_network(),
        Config {
            core_loop_codelength_threshold: 100.0,
            ..Config::default()
        },
    );
    let levels = level_loops(&lines);
    assert!(!levels.is_empty());
    assert!(levels.iter().all(|&(_, loops)| loops == 0), "{levels:?}");
}

#[test]
fn tune_iteration_limit_bounds_tuning() {
    let network = planted_network();
    let steps = |config: Config| tune_steps(&search_log(&network, config));

    let unlimited = steps(Config::default());
    assert!(unlimited.iter().any(|(kind, _)| kind == "fine"));
    assert!(unlimited.iter().any(|(kind, _)| kind == "coarse"));

    let none = steps(Config {
        tune_iteration_limit: 1,
        ..Config::default()
    });
    assert!(none.is_empty(), "{none:?}");

    let fine_only = steps(Config {
        tune_iteration_limit: 2,
        ..Config::default()
    });
    assert!(!fine_only.is_empty());
    assert!(fine_only
        .iter()
        .all(|(kind, iteration)| kind == "fine" && *iteration == 1));
}

#[test]
fn tune_relative_threshold_ends_tuning_after_first_coarse_step() {
    let steps = tune_steps(&search_log(
        &planted_network(),
        Config {
            tune_iteration_relative_threshold: 1.0,
            ..Config::default()
        },
    ));
    assert!(steps.iter().any(|(kind, _)| kind == "coarse"));
    assert!(steps.iter().all(|&(_, iteration)| iteration <= 2), "{steps:?}");
}

#[test]
fn coarse_tuning_can_be_switched_off() {
    let steps = tune_steps(&search_log(
        &planted_network(),
        Config {
            no_coarse_tune: true,
            ..Config::default()
        },
    ));
    assert!(steps.iter().any(|(kind, _)| kind == "fine"));
    assert!(steps.iter().all(|(kind, _)| kind != "coarse"), "{steps:?}");
}

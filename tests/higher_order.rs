use infomap_core::{Config, InitialPartition, Network, TrialDriver, UNKNOWN_META};

/// Two disconnected state triangles; physical node 2 appears in both.
fn overlapping_memory_network() -> Network {
    let mut network = Network::new();
    for (state, physical) in [(0, 0), (1, 1), (2, 2), (3, 2), (4, 3), (5, 4)] {
        network.add_state_node(state, physical).unwrap();
    }
    for &(s, t) in &[(0, 1), (1, 2), (2, 0), (3, 4), (4, 5), (5, 3)] {
        network.add_link(s, t, 1.0).unwrap();
    }
    network
}

#[test]
fn memory_states_of_one_physical_node_may_overlap() {
    let mut driver = TrialDriver::new(Config::default()).unwrap();
    let tree = driver.run(&overlapping_memory_network()).unwrap();

    assert_eq!(tree.leaves().count(), 6);
    assert_eq!(tree.num_top_modules(), 2);

    let physical = tree.physical_module_ids(1);
    assert_eq!(physical.len(), 5);
    assert_eq!(physical[&2].len(), 2);
    for id in [0, 1, 3, 4] {
        assert_eq!(physical[&id].len(), 1);
    }

    let merged = tree.physical_leaves();
    assert_eq!(merged.len(), 6);
    let flow: f64 = merged.iter().map(|p| p.flow).sum();
    assert!((flow - 1.0).abs() < 1e-9);
}

#[test]
fn memory_codelength_rewards_merged_physical_nodes() {
    // Physical 0 seen from states 0 and 1, physical 1 from states 2 and 3.
    let mut network = Network::new();
    for (state, physical) in [(0, 0), (1, 0), (2, 1), (3, 1)] {
        network.add_state_node(state, physical).unwrap();
    }
    for &(s, t) in &[(0, 2), (2, 1), (1, 3), (3, 0)] {
        network.add_link(s, t, 1.0).unwrap();
    }

    let score = |modules: [u32; 4]| {
        let config = Config {
            no_infomap: true,
            initial_partition: Some(InitialPartition::from_modules(
                modules.iter().enumerate().map(|(s, &m)| (s as u32, m)),
            )),
            ..Config::default()
        };
        let mut driver = TrialDriver::new(config).unwrap();
        driver.run(&network).unwrap().codelength()
    };

    // One module coding two physical nodes of equal flow costs one bit.
    let merged = score([0, 0, 0, 0]);
    assert!((merged - 1.0).abs() < 1e-9);
    assert!(score([0, 1, 2, 3]) > merged);
}

fn two_layer_network() -> Network {
    let mut network = Network::new();
    for layer in 0..2 {
        for &(s, t) in &[(1, 2), (2, 3), (3, 1), (4, 5), (5, 6), (6, 4), (3, 4)] {
            network.add_multilayer_intra_link(layer, s, t, 1.0).unwrap();
        }
    }
    network
}

#[test]
fn relaxed_multilayer_network_keeps_layer_identity() {
    let network = two_layer_network();
    let config = Config {
        multilayer_relax_rate: Some(0.15),
        ..Config::default()
    };
    let mut driver = TrialDriver::new(config).unwrap();
    let tree = driver.run(&network).unwrap();

    assert_eq!(tree.leaves().count(), 12);
    let flow: f64 = tree.leaves().map(|leaf| leaf.data.flow).sum();
    assert!((flow - 1.0).abs() < 1e-9);
    for leaf in tree.leaves() {
        let info = leaf.leaf.as_ref().unwrap();
        let layer = info.layer_id.unwrap();
        assert_eq!(
            network.multilayer_state_id(layer, info.physical_id),
            Some(info.state_id)
        );
    }
    assert!(tree.codelength() <= tree.one_level_codelength());

    let physical = tree.physical_module_ids(-1);
    assert_eq!(physical.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn explicit_inter_layer_links_spread_over_target_layer() {
    let mut network = two_layer_network();
    network.add_multilayer_inter_link(0, 3, 1, 1.0).unwrap();
    network.add_multilayer_inter_link(1, 4, 0, 1.0).unwrap();

    let mut driver = TrialDriver::new(Config::directed()).unwrap();
    let tree = driver.run(&network).unwrap();
    let flow: f64 = tree.leaves().map(|leaf| leaf.data.flow).sum();
    assert!((flow - 1.0).abs() < 1e-9);
    assert!(tree.codelength() <= tree.one_level_codelength());
}

#[test]
fn relaxation_rejects_explicit_inter_links() {
    let mut network = two_layer_network();
    network.add_multilayer_inter_link(0, 3, 1, 1.0).unwrap();
    let mut driver = TrialDriver::new(Config {
        multilayer_relax_rate: Some(0.1),
        ..Config::default()
    })
    .unwrap();
    assert!(driver.run(&network).is_err());
}

fn two_triangles_with_meta(categories: [u32; 6]) -> Network {
    let mut network = Network::new();
    for &(s, t) in &[(0, 1), (1, 2), (2, 0), (3, 4), (4, 5), (5, 3)] {
        network.add_link(s, t, 1.0).unwrap();
    }
    for (id, &category) in categories.iter().enumerate() {
        network.set_meta_data(id as u32, category);
    }
    network
}

#[test]
fn aligned_meta_data_costs_nothing_inside_modules() {
    let mut driver = TrialDriver::new(Config::default()).unwrap();
    let tree = driver
        .run(&two_triangles_with_meta([1, 1, 1, 2, 2, 2]))
        .unwrap();

    assert_eq!(tree.num_top_modules(), 2);
    assert!(tree.meta_codelength().abs() < 1e-12);
    assert!((tree.codelength() - 3f64.log2()).abs() < 1e-9);
    // One level pays one extra bit for the two equally likely categories.
    assert!((tree.one_level_codelength() - (6f64.log2() + 1.0)).abs() < 1e-9);

    let root_meta = &tree.root().meta;
    assert_eq!(root_meta.len(), 2);
    for &(_, weight) in root_meta {
        assert!((weight - 0.5).abs() < 1e-9);
    }
}

#[test]
fn mixed_meta_data_adds_meta_codelength() {
    let config = Config {
        meta_data_rate: 2.0,
        ..Config::default()
    };
    let mut driver = TrialDriver::new(config).unwrap();
    let tree = driver
        .run(&two_triangles_with_meta([1, 2, 1, 2, 1, 2]))
        .unwrap();

    assert!(tree.meta_codelength() > 0.0);
    let parts = tree.index_codelength() + tree.module_codelength() + tree.meta_codelength();
    assert!((tree.codelength() - parts).abs() < 1e-12);
}

#[test]
fn zero_meta_rate_ignores_meta_data() {
    let config = Config {
        meta_data_rate: 0.0,
        ..Config::default()
    };
    let mut driver = TrialDriver::new(config).unwrap();
    let tree = driver
        .run(&two_triangles_with_meta([1, 2, 1, 2, 1, 2]))
        .unwrap();
    assert_eq!(tree.meta_codelength(), 0.0);
    assert!((tree.codelength() - 3f64.log2()).abs() < 1e-9);
}

#[test]
fn nodes_without_meta_data_share_the_unknown_category() {
    let mut network = two_triangles_with_meta([1, 1, 1, 2, 2, 2]);
    network.add_link(6, 0, 1.0).unwrap();
    let mut driver = TrialDriver::new(Config::default()).unwrap();
    let tree = driver.run(&network).unwrap();

    let leaf = tree
        .leaves()
        .find(|leaf| leaf.leaf.as_ref().unwrap().state_id == 6)
        .unwrap();
    assert_eq!(leaf.meta.len(), 1);
    assert_eq!(leaf.meta[0].0, UNKNOWN_META);
}

#[test]
fn unweighted_meta_data_counts_nodes_instead_of_flow() {
    // Node 0 links both triangles and carries the only category-1 label.
    let mut network = two_triangles_with_meta([1, 2, 2, 2, 2, 2]);
    network.add_link(0, 3, 1.0).unwrap();

    let root_weight = |unweighted_meta_data| {
        let mut driver = TrialDriver::new(Config {
            unweighted_meta_data,
            ..Config::default()
        })
        .unwrap();
        let tree = driver.run(&network).unwrap();
        let total: f64 = tree.root().meta.iter().map(|&(_, w)| w).sum();
        assert!((total - 1.0).abs() < 1e-9);
        tree.root()
            .meta
            .iter()
            .find(|&&(category, _)| category == 1)
            .map(|&(_, w)| w)
            .unwrap()
    };
    assert!((root_weight(false) - 3.0 / 14.0).abs() < 1e-9);
    assert!((root_weight(true) - 1.0 / 6.0).abs() < 1e-9);
}

#[test]
fn jsd_relaxation_favours_layers_with_similar_links() {
    let mut network = Network::new();
    for &(s, t) in &[(1, 2), (2, 3), (3, 1), (3, 4)] {
        network.add_multilayer_intra_link(0, s, t, 1.0).unwrap();
    }
    for &(s, t) in &[(1, 2), (2, 4), (4, 1), (3, 4)] {
        network.add_multilayer_intra_link(1, s, t, 1.0).unwrap();
    }

    // Node 2 links {1, 3} in layer 0 and {1, 4} in layer 1: divergence 0.5 bit.
    let relaxed_weight = |multilayer_relax_by_jsd| {
        let config = Config {
            multilayer_relax_rate: Some(0.3),
            multilayer_relax_by_jsd,
            ..Config::default()
        };
        let graph = network.compile(&config).unwrap();
        let source = graph
            .index_of(network.multilayer_state_id(0, 2).unwrap())
            .unwrap() as u32;
        let target = graph
            .index_of(network.multilayer_state_id(1, 4).unwrap())
            .unwrap() as u32;
        let edge = (0..graph.edge_count())
            .find(|&e| graph.edge_source[e] == source && graph.edge_target[e] == target)
            .unwrap();
        graph.edge_weight[edge]
    };
    assert!((relaxed_weight(false) - 0.15).abs() < 1e-12);
    assert!((relaxed_weight(true) - 0.1).abs() < 1e-12);

    let mut driver = TrialDriver::new(Config {
        multilayer_relax_rate: Some(0.3),
        multilayer_relax_by_jsd: true,
        ..Config::default()
    })
    .unwrap();
    let tree = driver.run(&network).unwrap();
    let flow: f64 = tree.leaves().map(|leaf| leaf.data.flow).sum();
    assert!((flow - 1.0).abs() < 1e-9);
}

use infomap_core::{Config, InitialPartition, Network, TrialDriver};

fn network_from_links(links: &[(u32, u32)]) -> Network {
    let mut network = Network::new();
    for &(s, t) in links {
        network.add_link(s, t, 1.0).unwrap();
    }
    network
}

fn two_triangles() -> Network {
    network_from_links(&[(0, 1), (1, 2), (2, 0), (3, 4), (4, 5), (5, 3)])
}

fn triangles_with_chain() -> Network {
    network_from_links(&[
        (0, 1),
        (0, 2),
        (1, 2),
        (2, 3),
        (3, 4),
        (4, 5),
        (5, 6),
        (5, 7),
        (6, 7),
    ])
}

fn assert_close(actual: f64, expected: f64, tol: f64) {
    assert!(
        (actual - expected).abs() <= tol,
        "expected {expected}, got {actual}"
    );
}

#[test]
fn disjoint_triangles_split_into_two_modules() {
    let mut driver = TrialDriver::new(Config::default()).unwrap();
    let tree = driver.run(&two_triangles()).unwrap();

    assert_eq!(tree.num_top_modules(), 2);
    let modules = tree.module_ids(1);
    assert_eq!(modules.len(), 6);
    assert_eq!(modules[&0], modules[&1]);
    assert_eq!(modules[&1], modules[&2]);
    assert_eq!(modules[&3], modules[&4]);
    assert_eq!(modules[&4], modules[&5]);
    assert_ne!(modules[&0], modules[&3]);

    assert_close(tree.codelength(), 3f64.log2(), 1e-9);
    assert_close(tree.one_level_codelength(), 6f64.log2(), 1e-9);
    assert_close(tree.index_codelength(), 0.0, 1e-12);
}

#[test]
fn forced_three_module_partition_scores_reference_codelength() {
    let config = Config {
        no_infomap: true,
        initial_partition: Some(InitialPartition::from_modules([
            (0, 0),
            (1, 0),
            (2, 0),
            (3, 1),
            (4, 1),
            (5, 2),
            (6, 2),
            (7, 2),
        ])),
        ..Config::default()
    };
    let mut driver = TrialDriver::new(config).unwrap();
    let tree = driver.run(&triangles_with_chain()).unwrap();

    assert_close(tree.codelength(), 2.5556, 1e-4);
    assert_eq!(tree.num_top_modules(), 3);
}

#[test]
fn forced_two_module_partition_scores_reference_codelength() {
    let config = Config {
        no_infomap: true,
        initial_partition: Some(InitialPartition::from_modules([
            (0, 0),
            (1, 0),
            (2, 0),
            (3, 0),
            (4, 2),
            (5, 2),
            (6, 2),
            (7, 2),
        ])),
        ..Config::default()
    };
    let mut driver = TrialDriver::new(config).unwrap();
    let tree = driver.run(&triangles_with_chain()).unwrap();

    assert_close(tree.codelength(), 2.6072, 1e-4);
    assert_eq!(tree.num_top_modules(), 2);
}

#[test]
fn optimizer_beats_forced_two_module_partition() {
    let mut driver = TrialDriver::new(Config::default()).unwrap();
    let tree = driver.run(&triangles_with_chain()).unwrap();

    assert!(tree.codelength() <= 2.6072 + 1e-4);
    assert!(tree.codelength() < tree.one_level_codelength());
    let modules = tree.module_ids(-1);
    assert_eq!(modules[&0], modules[&1]);
    assert_eq!(modules[&6], modules[&7]);
    assert_ne!(modules[&0], modules[&7]);
}

#[test]
fn single_isolated_node_codes_for_free() {
    let mut network = Network::new();
    network.add_node(0);
    let mut driver = TrialDriver::new(Config::default()).unwrap();
    let tree = driver.run(&network).unwrap();

    assert_eq!(tree.codelength(), 0.0);
    assert_eq!(tree.leaves().count(), 1);
    assert_eq!(tree.num_levels(), 1);
}

fn bipartite_network() -> Network {
    let mut network = network_from_links(&[(0, 10), (1, 10), (2, 11), (3, 11)]);
    network.set_bipartite_start_id(10);
    network
}

#[test]
fn hidden_bipartite_features_leave_projected_modules() {
    let config = Config {
        hide_bipartite_nodes: true,
        ..Config::default()
    };
    let mut driver = TrialDriver::new(config).unwrap();
    let tree = driver.run(&bipartite_network()).unwrap();

    assert_eq!(tree.leaves().count(), 4);
    assert!(tree
        .leaves()
        .all(|leaf| !leaf.leaf.as_ref().unwrap().is_feature));

    let modules = tree.module_ids(1);
    assert_eq!(modules.len(), 4);
    assert!(!modules.contains_key(&10));
    assert_eq!(modules[&0], modules[&1]);
    assert_eq!(modules[&2], modules[&3]);
    assert_ne!(modules[&0], modules[&2]);

    let leaf_flow: f64 = tree.leaves().map(|leaf| leaf.data.flow).sum();
    assert_close(leaf_flow, 1.0, 1e-9);
}

#[test]
fn visible_bipartite_features_carry_no_flow() {
    let mut driver = TrialDriver::new(Config::default()).unwrap();
    let tree = driver.run(&bipartite_network()).unwrap();

    assert_eq!(tree.leaves().count(), 6);
    for leaf in tree.leaves() {
        if leaf.leaf.as_ref().unwrap().is_feature {
            assert_eq!(leaf.data.flow, 0.0);
        }
    }
}

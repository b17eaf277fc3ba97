use crate::config::{Config, FlowModel};
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::objective::plogp;
use log::debug;

const MIN_POWER_ITERATIONS: usize = 50;
const MAX_POWER_ITERATIONS: usize = 200;
const POWER_ITERATION_TOLERANCE: f64 = 1.0e-15;
/// Residual above which an exhausted power iteration counts as diverged.
const POWER_ITERATION_FAILURE: f64 = 1.0e-9;
const FLOW_SUM_TOLERANCE: f64 = 1.0e-9;

fn normalize(v: &mut [f64]) {
    let sum: f64 = v.iter().sum();
    if sum > 0.0 {
        for x in v.iter_mut() {
            *x /= sum;
        }
    }
}

struct FlowState {
    node_flow: Vec<f64>,
    link_flow: Vec<f64>,
    node_out_degree: Vec<usize>,
    sum_link_out_weight: Vec<f64>,
    normalize_node_flow: bool,
}

/// Computes stationary node and link flow for the configured walk model and
/// derives the enter/exit flow each leaf contributes to the codelength.
pub fn calculate_flow(graph: &mut Graph, config: &Config) -> Result<()> {
    let model = config.resolved_flow_model();
    let n = graph.node_count();
    let m = graph.edge_count();

    graph.undirected_coding = model.is_undirected_clustering();

    if n == 0 {
        return Ok(());
    }

    if graph.sum_link_weight <= 0.0 && model != FlowModel::Precomputed {
        // Without links every node is equally likely.
        let uniform = 1.0 / n as f64;
        for node in graph.nodes.iter_mut() {
            node.data.flow = uniform;
        }
        finalize(graph, config, FlowState {
            node_flow: vec![uniform; n],
            link_flow: vec![0.0; m],
            node_out_degree: vec![0; n],
            sum_link_out_weight: vec![0.0; n],
            normalize_node_flow: false,
        })?;
        return Ok(());
    }

    let undirected_link_normalization = 2.0 * graph.sum_link_weight - graph.self_link_weight;
    let mut state = FlowState {
        node_flow: vec![0.0; n],
        link_flow: graph.edge_weight.clone(),
        node_out_degree: vec![0; n],
        sum_link_out_weight: vec![0.0; n],
        normalize_node_flow: false,
    };

    for e in 0..m {
        let s = graph.edge_source[e] as usize;
        let t = graph.edge_target[e] as usize;
        let w = graph.edge_weight[e];

        state.node_out_degree[s] += 1;
        state.sum_link_out_weight[s] += w;
        state.node_flow[s] += w / undirected_link_normalization;

        if s != t {
            if model.is_undirected_flow() {
                state.node_out_degree[t] += 1;
                state.sum_link_out_weight[t] += w;
            }
            if model != FlowModel::Outdirdir {
                state.node_flow[t] += w / undirected_link_normalization;
            }
        }
    }

    match model {
        FlowModel::Undirected => {
            for e in 0..m {
                state.link_flow[e] /= undirected_link_normalization;
                if graph.edge_source[e] != graph.edge_target[e] {
                    state.link_flow[e] *= 2.0;
                }
            }
        }
        FlowModel::Directed => directed_flow(graph, config, &mut state)?,
        FlowModel::Undirdir | FlowModel::Outdirdir => {
            let steady_state = std::mem::replace(&mut state.node_flow, vec![0.0; n]);
            for e in 0..m {
                let s = graph.edge_source[e] as usize;
                let t = graph.edge_target[e] as usize;
                state.node_flow[t] +=
                    steady_state[s] * state.link_flow[e] / state.sum_link_out_weight[s];
            }
            let sum_node_flow: f64 = state.node_flow.iter().sum();
            for e in 0..m {
                let s = graph.edge_source[e] as usize;
                state.link_flow[e] *=
                    steady_state[s] / state.sum_link_out_weight[s] / sum_node_flow;
            }
            state.normalize_node_flow = true;
        }
        FlowModel::Rawdir => {
            state.node_flow.iter_mut().for_each(|f| *f = 0.0);
            for e in 0..m {
                let t = graph.edge_target[e] as usize;
                state.link_flow[e] /= graph.sum_link_weight;
                state.node_flow[t] += state.link_flow[e];
            }
            state.normalize_node_flow = true;
        }
        FlowModel::Precomputed => {
            let mut sum_flow = 0.0;
            for (i, node) in graph.nodes.iter().enumerate() {
                let flow = node.precomputed_flow.ok_or_else(|| {
                    Error::config(
                        "flow_model",
                        format!("precomputed flow missing on node {}", node.id),
                    )
                })?;
                state.node_flow[i] = flow;
                sum_flow += flow;
            }
            if sum_flow <= 0.0 {
                return Err(Error::input("node flow", "precomputed node flow sums to zero"));
            }
            if (sum_flow - 1.0).abs() > FLOW_SUM_TOLERANCE {
                debug!("precomputed node flow sums to {sum_flow}, normalizing");
            }
            state.normalize_node_flow = true;
        }
    }

    finalize(graph, config, state)
}

fn directed_flow(graph: &Graph, config: &Config, state: &mut FlowState) -> Result<()> {
    let n = graph.node_count();
    let m = graph.edge_count();

    let mut node_teleport_weights = vec![0.0f64; n];
    if config.teleport_to_nodes {
        for (i, node) in graph.nodes.iter().enumerate() {
            node_teleport_weights[i] = node.teleport_weight;
        }
    } else {
        for e in 0..m {
            let s = graph.edge_source[e] as usize;
            node_teleport_weights[s] += graph.edge_weight[e] / graph.sum_link_weight;
        }
    }
    normalize(&mut node_teleport_weights);

    for e in 0..m {
        let s = graph.edge_source[e] as usize;
        if state.sum_link_out_weight[s] > 0.0 {
            state.link_flow[e] /= state.sum_link_out_weight[s];
        }
    }

    let node_flow = &mut state.node_flow;
    let mut node_flow_tmp = vec![0.0f64; n];

    let mut alpha = config.teleportation_probability;
    let mut beta = 1.0 - alpha;
    let mut iterations = 0usize;
    let mut err = 0.0f64;
    let dangling_rank_last = loop {
        let old_err = err;

        let mut dangling_rank = 0.0;
        for i in 0..n {
            if state.node_out_degree[i] == 0 {
                dangling_rank += node_flow[i];
            }
        }

        let tele_flow = alpha + beta * dangling_rank;
        for i in 0..n {
            node_flow_tmp[i] = tele_flow * node_teleport_weights[i];
        }

        for e in 0..m {
            let s = graph.edge_source[e] as usize;
            let t = graph.edge_target[e] as usize;
            node_flow_tmp[t] += beta * state.link_flow[e] * node_flow[s];
        }

        let mut node_flow_diff = -1.0f64;
        err = 0.0;
        for i in 0..n {
            node_flow_diff += node_flow_tmp[i];
            err += (node_flow_tmp[i] - node_flow[i]).abs();
        }

        node_flow.copy_from_slice(&node_flow_tmp);

        if node_flow_diff.abs() > 1.0e-10 {
            let denom = node_flow_diff + 1.0;
            if denom != 0.0 {
                for x in node_flow.iter_mut() {
                    *x /= denom;
                }
            }
        }

        if !err.is_finite() {
            return Err(Error::numerical(
                "power iteration",
                format!("non-finite residual after {} iterations", iterations + 1),
            ));
        }

        // Nudge teleportation when the walk sits in an equilibrium it cannot leave.
        if (err - old_err).abs() < 1.0e-17 {
            alpha += 1.0e-12;
            beta = 1.0 - alpha;
        }

        iterations += 1;
        if iterations >= MAX_POWER_ITERATIONS
            || (err <= POWER_ITERATION_TOLERANCE && iterations >= MIN_POWER_ITERATIONS)
        {
            break dangling_rank;
        }
    };

    if err > POWER_ITERATION_FAILURE {
        return Err(Error::numerical(
            "power iteration",
            format!("no convergence after {iterations} iterations, residual {err:e}"),
        ));
    }
    debug!("pagerank converged after {iterations} iterations, residual {err:e}");

    let mut sum_node_rank = 1.0 - dangling_rank_last;
    if sum_node_rank <= 0.0 {
        sum_node_rank = 1.0;
    }

    // Unrecorded teleportation: one last step along links only.
    node_flow.iter_mut().for_each(|x| *x = 0.0);
    for e in 0..m {
        let s = graph.edge_source[e] as usize;
        let t = graph.edge_target[e] as usize;
        let f = state.link_flow[e] * node_flow_tmp[s] / sum_node_rank;
        state.link_flow[e] = f;
        node_flow[t] += f;
    }
    let sum: f64 = node_flow.iter().sum();
    if (sum - 1.0).abs() > 1.0e-10 {
        state.normalize_node_flow = true;
    }
    Ok(())
}

fn finalize(graph: &mut Graph, config: &Config, mut state: FlowState) -> Result<()> {
    let n = graph.node_count();
    let m = graph.edge_count();

    if graph.bipartite_start_id.is_some() && !config.skip_adjust_bipartite_flow {
        // Feature nodes are not coded: their flow moves to the ordinary side.
        for e in 0..m {
            let s = graph.edge_source[e] as usize;
            let t = graph.edge_target[e] as usize;
            if graph.nodes[s].is_feature {
                state.node_flow[t] += state.link_flow[e];
                state.node_flow[s] = 0.0;
            } else {
                state.node_flow[s] += state.link_flow[e];
                state.node_flow[t] = 0.0;
            }
            // Two steps on the bipartite network are one step between ordinary nodes.
            state.link_flow[e] *= 2.0;
        }
        state.normalize_node_flow = true;
    }

    if state.normalize_node_flow {
        normalize(&mut state.node_flow);
    }

    let sum: f64 = state.node_flow.iter().sum();
    if !sum.is_finite() || (sum - 1.0).abs() > FLOW_SUM_TOLERANCE {
        return Err(Error::numerical(
            "flow normalization",
            format!("node flow sums to {sum}"),
        ));
    }
    if let Some(e) = state.link_flow.iter().position(|f| !f.is_finite()) {
        return Err(Error::numerical(
            "flow normalization",
            format!("non-finite flow on link {e}"),
        ));
    }

    for (node, &flow) in graph.nodes.iter_mut().zip(state.node_flow.iter()) {
        node.data.flow = flow;
        node.data.enter_flow = 0.0;
        node.data.exit_flow = 0.0;
    }

    graph.edge_flow = state.link_flow;
    for e in 0..m {
        let s = graph.edge_source[e];
        let t = graph.edge_target[e];
        graph.edge_coding_flow[e] = if s == t {
            0.0
        } else {
            graph.edge_flow[e] * config.markov_time
        };
    }

    for e in 0..m {
        let s = graph.edge_source[e] as usize;
        let t = graph.edge_target[e] as usize;
        if s == t {
            continue;
        }
        let f = graph.edge_coding_flow[e];
        if graph.undirected_coding {
            let h = f / 2.0;
            graph.nodes[s].data.exit_flow += h;
            graph.nodes[s].data.enter_flow += h;
            graph.nodes[t].data.exit_flow += h;
            graph.nodes[t].data.enter_flow += h;
        } else {
            graph.nodes[s].data.exit_flow += f;
            graph.nodes[t].data.enter_flow += f;
        }
    }

    graph.entropy_rate = entropy_rate(graph);
    debug!(
        "flow ready: {} nodes, {} links, entropy rate {:.6}",
        n, m, graph.entropy_rate
    );
    Ok(())
}

fn entropy_rate(graph: &Graph) -> f64 {
    let mut rate = 0.0;
    for (i, node) in graph.nodes.iter().enumerate() {
        let range = graph.out_range(i);
        let sum_out: f64 = graph.edge_flow[range.clone()].iter().sum();
        if sum_out <= 0.0 {
            continue;
        }
        let entropy: f64 = graph.edge_flow[range]
            .iter()
            .map(|&f| -plogp(f / sum_out))
            .sum();
        rate += node.data.flow * entropy;
    }
    rate
}

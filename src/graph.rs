use std::ops::{AddAssign, SubAssign};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlowData {
    pub flow: f64,
    pub enter_flow: f64,
    pub exit_flow: f64,
}

impl AddAssign for FlowData {
    #[inline]
    fn add_assign(&mut self, other: FlowData) {
        self.flow += other.flow;
        self.enter_flow += other.enter_flow;
        self.exit_flow += other.exit_flow;
    }
}

impl SubAssign for FlowData {
    #[inline]
    fn sub_assign(&mut self, other: FlowData) {
        self.flow -= other.flow;
        self.enter_flow -= other.enter_flow;
        self.exit_flow -= other.exit_flow;
    }
}

/// One leaf of the network: a state node, or a physical node in first-order input.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: u32,
    pub physical_id: u32,
    pub layer_id: Option<u32>,
    pub name: Option<String>,
    pub teleport_weight: f64,
    pub precomputed_flow: Option<f64>,
    pub meta: Option<u32>,
    pub is_feature: bool,
    pub data: FlowData,
}

/// Compiled network in CSR form, nodes sorted by id and edges by (source, target).
#[derive(Debug, Clone)]
pub struct Graph {
    pub nodes: Vec<NodeRecord>,
    pub edge_source: Vec<u32>,
    pub edge_target: Vec<u32>,
    pub edge_weight: Vec<f64>,
    /// Stationary link flow.
    pub edge_flow: Vec<f64>,
    /// Link flow seen by the codelength: scaled by markov time.
    pub edge_coding_flow: Vec<f64>,
    pub out_offsets: Vec<u32>,
    pub sum_link_weight: f64,
    pub self_link_weight: f64,
    /// Dense physical index per node.
    pub node_physical: Vec<u32>,
    /// Dense physical index -> physical id.
    pub physical_ids: Vec<u32>,
    pub bipartite_start_id: Option<u32>,
    pub undirected_coding: bool,
    pub entropy_rate: f64,
}

impl Graph {
    /// `links` are (source index, target index, weight) with weight > 0.
    pub fn from_links(
        nodes: Vec<NodeRecord>,
        mut links: Vec<(u32, u32, f64)>,
        bipartite_start_id: Option<u32>,
    ) -> Self {
        links.sort_unstable_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        let m = links.len();
        let n = nodes.len();
        let mut edge_source = Vec::with_capacity(m);
        let mut edge_target = Vec::with_capacity(m);
        let mut edge_weight = Vec::with_capacity(m);

        let mut out_counts = vec![0u32; n];

        let mut sum_link_weight = 0.0;
        let mut self_link_weight = 0.0;

        for (s, t, w) in links {
            edge_source.push(s);
            edge_target.push(t);
            edge_weight.push(w);
            out_counts[s as usize] += 1;
            sum_link_weight += w;
            if s == t {
                self_link_weight += w;
            }
        }

        let out_offsets = prefix_offsets(&out_counts);

        let mut physical_ids: Vec<u32> = nodes.iter().map(|n| n.physical_id).collect();
        physical_ids.sort_unstable();
        physical_ids.dedup();
        let node_physical = nodes
            .iter()
            .map(|n| physical_ids.partition_point(|&p| p < n.physical_id) as u32)
            .collect();

        Self {
            nodes,
            edge_source,
            edge_target,
            edge_weight,
            edge_flow: vec![0.0; m],
            edge_coding_flow: vec![0.0; m],
            out_offsets,
            sum_link_weight,
            self_link_weight,
            node_physical,
            physical_ids,
            bipartite_start_id,
            undirected_coding: true,
            entropy_rate: 0.0,
        }
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn edge_count(&self) -> usize {
        self.edge_source.len()
    }

    #[inline]
    pub fn physical_count(&self) -> usize {
        self.physical_ids.len()
    }

    /// Several state nodes share a physical node, so the memory map equation applies.
    #[inline]
    pub fn has_memory(&self) -> bool {
        self.physical_count() < self.node_count()
    }

    pub fn has_meta_data(&self) -> bool {
        self.nodes.iter().any(|n| n.meta.is_some())
    }

    #[inline]
    pub fn out_range(&self, node_idx: usize) -> std::ops::Range<usize> {
        self.out_offsets[node_idx] as usize..self.out_offsets[node_idx + 1] as usize
    }

    pub fn index_of(&self, id: u32) -> Option<usize> {
        self.nodes.binary_search_by_key(&id, |n| n.id).ok()
    }

    pub fn node_flow_sum(&self) -> f64 {
        self.nodes.iter().map(|n| n.data.flow).sum()
    }
}

pub(crate) fn prefix_offsets(counts: &[u32]) -> Vec<u32> {
    let mut offsets = vec![0u32; counts.len() + 1];
    for i in 0..counts.len() {
        offsets[i + 1] = offsets[i] + counts[i];
    }
    offsets
}

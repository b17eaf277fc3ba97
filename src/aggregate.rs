use crate::config::Config;
use crate::graph::{prefix_offsets, FlowData, Graph};
use crate::objective::{plogp, Items, NodeItems};
use rustc_hash::{FxHashMap, FxHashSet};

/// Category used for leaves without meta data.
pub const UNKNOWN_META: u32 = u32::MAX;

/// The far end of a link and the coding flow along it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Arc {
    pub(crate) node: u32,
    pub(crate) flow: f64,
}

/// Coding flow between nodes, indexed from both ends.
///
/// Self links are dropped since they never cross a module boundary. Undirected
/// networks store each link once; the side it is stored on carries no meaning.
#[derive(Debug, Clone, Default)]
pub(crate) struct Adjacency {
    out_offsets: Vec<u32>,
    out_arcs: Vec<Arc>,
    in_offsets: Vec<u32>,
    in_arcs: Vec<Arc>,
}

impl Adjacency {
    /// `links` are (source, target, flow). Parallel links are merged.
    pub(crate) fn from_links(node_count: usize, mut links: Vec<(u32, u32, f64)>) -> Self {
        links.retain(|&(s, t, _)| s != t);
        links.sort_by_key(|&(s, t, _)| (s, t));
        links.dedup_by(|next, kept| {
            let same = (next.0, next.1) == (kept.0, kept.1);
            if same {
                kept.2 += next.2;
            }
            same
        });

        let mut out_counts = vec![0u32; node_count];
        let mut in_counts = vec![0u32; node_count];
        for &(s, t, _) in &links {
            out_counts[s as usize] += 1;
            in_counts[t as usize] += 1;
        }
        let out_offsets = prefix_offsets(&out_counts);
        let in_offsets = prefix_offsets(&in_counts);

        let out_arcs = links
            .iter()
            .map(|&(_, node, flow)| Arc { node, flow })
            .collect();
        let mut in_arcs = vec![Arc { node: 0, flow: 0.0 }; links.len()];
        let mut next_slot = in_offsets[..node_count].to_vec();
        for &(s, t, flow) in &links {
            let slot = &mut next_slot[t as usize];
            in_arcs[*slot as usize] = Arc { node: s, flow };
            *slot += 1;
        }

        Self {
            out_offsets,
            out_arcs,
            in_offsets,
            in_arcs,
        }
    }

    #[inline]
    pub(crate) fn out_arcs(&self, node: usize) -> &[Arc] {
        &self.out_arcs[self.out_offsets[node] as usize..self.out_offsets[node + 1] as usize]
    }

    #[inline]
    pub(crate) fn in_arcs(&self, node: usize) -> &[Arc] {
        &self.in_arcs[self.in_offsets[node] as usize..self.in_offsets[node + 1] as usize]
    }

    /// Every link touching `node`, outgoing first.
    #[inline]
    pub(crate) fn arcs(&self, node: usize) -> impl Iterator<Item = &Arc> + '_ {
        self.out_arcs(node).iter().chain(self.in_arcs(node))
    }

    #[inline]
    pub(crate) fn degree(&self, node: usize) -> usize {
        self.out_arcs(node).len() + self.in_arcs(node).len()
    }

    fn node_count(&self) -> usize {
        self.out_offsets.len().saturating_sub(1)
    }

    /// All links as (source, target, flow) in source order.
    pub(crate) fn links(&self) -> impl Iterator<Item = (u32, u32, f64)> + '_ {
        (0..self.node_count()).flat_map(move |s| {
            self.out_arcs(s)
                .iter()
                .map(move |arc| (s as u32, arc.node, arc.flow))
        })
    }
}

/// Books link flow `flow` from `source` to `target` as boundary flow of the
/// two modules. Undirected coding splits it evenly over both directions.
#[inline]
pub(crate) fn add_boundary_flow(
    modules: &mut [FlowData],
    source: usize,
    target: usize,
    flow: f64,
    directed: bool,
) {
    if directed {
        modules[source].exit_flow += flow;
        modules[target].enter_flow += flow;
    } else {
        let half = flow / 2.0;
        for m in [source, target] {
            modules[m].exit_flow += half;
            modules[m].enter_flow += half;
        }
    }
}

/// The network one optimization pass runs on: leaves at level 0, modules of
/// the previous level after consolidation. Each node remembers the leaves it
/// stands for.
#[derive(Debug, Clone)]
pub(crate) struct ActiveNetwork {
    pub(crate) data: Vec<FlowData>,
    member_offsets: Vec<u32>,
    member_leaf: Vec<u32>,
    pub(crate) links: Adjacency,
    pub(crate) directed: bool,
    /// Physical-node flow per node, present for memory networks.
    pub(crate) physical: Option<Vec<Items>>,
    /// Meta category weights per node.
    pub(crate) meta: Option<Vec<Items>>,
}

/// Sums item lists key by key into one sorted list.
pub(crate) fn merge_items<'a, I>(lists: I) -> Items
where
    I: IntoIterator<Item = &'a Items>,
{
    let mut map: FxHashMap<u32, f64> = FxHashMap::default();
    for list in lists {
        for &(key, w) in list {
            *map.entry(key).or_insert(0.0) += w;
        }
    }
    let mut out: Items = map.into_iter().collect();
    out.sort_unstable_by_key(|&(key, _)| key);
    out
}

/// Relabels `assignment` to `0..k` in order of first appearance. Also returns
/// the original label of each new one.
pub(crate) fn relabel_by_first_appearance(assignment: &[u32]) -> (Vec<u32>, Vec<u32>) {
    let mut label: FxHashMap<u32, u32> = FxHashMap::default();
    let mut originals = Vec::new();
    let dense = assignment
        .iter()
        .map(|&m| {
            *label.entry(m).or_insert_with(|| {
                originals.push(m);
                originals.len() as u32 - 1
            })
        })
        .collect();
    (dense, originals)
}

#[inline]
pub(crate) fn assignment_module_count(assignment: &[u32]) -> usize {
    assignment.iter().collect::<FxHashSet<_>>().len()
}

fn identity_members(n: usize) -> (Vec<u32>, Vec<u32>) {
    ((0..=n as u32).collect(), (0..n as u32).collect())
}

impl ActiveNetwork {
    #[inline]
    pub(crate) fn node_count(&self) -> usize {
        self.data.len()
    }

    /// Leaves represented by `node`.
    pub(crate) fn members(&self, node: usize) -> &[u32] {
        let start = self.member_offsets[node] as usize;
        let end = self.member_offsets[node + 1] as usize;
        &self.member_leaf[start..end]
    }

    pub(crate) fn items(&self) -> NodeItems<'_> {
        NodeItems {
            physical: self.physical.as_deref(),
            meta: self.meta.as_deref(),
        }
    }

    pub(crate) fn node_data(&self) -> Vec<FlowData> {
        self.data.clone()
    }

    pub(crate) fn from_graph(graph: &Graph, config: &Config) -> Self {
        let n = graph.node_count();
        let links = (0..graph.edge_count())
            .map(|e| {
                (
                    graph.edge_source[e],
                    graph.edge_target[e],
                    graph.edge_coding_flow[e],
                )
            })
            .collect();

        let physical = graph.has_memory().then(|| {
            (0..n)
                .map(|i| vec![(graph.node_physical[i], graph.nodes[i].data.flow)])
                .collect()
        });

        let meta = (graph.has_meta_data() && config.meta_data_rate > 0.0).then(|| {
            let uniform = 1.0 / n as f64;
            graph
                .nodes
                .iter()
                .map(|node| {
                    let weight = if config.unweighted_meta_data {
                        uniform
                    } else {
                        node.data.flow
                    };
                    vec![(node.meta.unwrap_or(UNKNOWN_META), weight)]
                })
                .collect()
        });

        let (member_offsets, member_leaf) = identity_members(n);
        Self {
            data: graph.nodes.iter().map(|node| node.data).collect(),
            member_offsets,
            member_leaf,
            links: Adjacency::from_links(n, links),
            directed: !graph.undirected_coding,
            physical,
            meta,
        }
    }

    /// One node per module of `node_module`, numbered by first appearance.
    /// Links inside a module vanish; links between two modules are merged.
    pub(crate) fn consolidate(&self, node_module: &[u32], module_data: &[FlowData]) -> Self {
        let (dense, originals) = relabel_by_first_appearance(node_module);
        let k = originals.len();

        let mut by_module: Vec<Vec<usize>> = vec![Vec::new(); k];
        for (node, &m) in dense.iter().enumerate() {
            by_module[m as usize].push(node);
        }

        let mut member_offsets = Vec::with_capacity(k + 1);
        let mut member_leaf = Vec::with_capacity(self.member_leaf.len());
        member_offsets.push(0);
        for nodes in &by_module {
            for &node in nodes {
                member_leaf.extend_from_slice(self.members(node));
            }
            member_offsets.push(member_leaf.len() as u32);
        }

        let merged = |lists: &[Items]| -> Vec<Items> {
            by_module
                .iter()
                .map(|nodes| merge_items(nodes.iter().map(|&node| &lists[node])))
                .collect()
        };

        let links = self
            .links
            .links()
            .filter_map(|(s, t, flow)| {
                let (a, b) = (dense[s as usize], dense[t as usize]);
                match (a == b, self.directed) {
                    (true, _) => None,
                    (false, true) => Some((a, b, flow)),
                    (false, false) => Some((a.min(b), a.max(b), flow)),
                }
            })
            .collect();

        Self {
            data: originals.iter().map(|&m| module_data[m as usize]).collect(),
            member_offsets,
            member_leaf,
            links: Adjacency::from_links(k, links),
            directed: self.directed,
            physical: self.physical.as_deref().map(&merged),
            meta: self.meta.as_deref().map(&merged),
        }
    }

    /// Module index per leaf, taking the nodes of this network as modules.
    pub(crate) fn assignment_to_leaves(&self, leaf_count: usize) -> Vec<u32> {
        let mut out = vec![0u32; leaf_count];
        for module in 0..self.node_count() {
            for &leaf in self.members(module) {
                out[leaf as usize] = module as u32;
            }
        }
        out
    }

    /// Same network with each node as its own member, for searching above it.
    pub(crate) fn with_compact_members(&self) -> Self {
        let (member_offsets, member_leaf) = identity_members(self.node_count());
        Self {
            member_offsets,
            member_leaf,
            ..self.clone()
        }
    }

    /// Super-module search codes modules by the flow entering them; memory
    /// and meta terms belong to the leaf level and are dropped.
    pub(crate) fn transform_node_flow_to_enter_flow(&mut self) {
        for data in &mut self.data {
            data.flow = data.enter_flow;
        }
        self.physical = None;
        self.meta = None;
    }

    /// The network among `members` only, with local indices in the order given.
    pub(crate) fn induced_subnetwork(&self, members: &[u32]) -> Self {
        let k = members.len();
        let local: FxHashMap<u32, u32> = members
            .iter()
            .enumerate()
            .map(|(i, &global)| (global, i as u32))
            .collect();

        let mut links = Vec::new();
        for (source, &global) in members.iter().enumerate() {
            for arc in self.links.out_arcs(global as usize) {
                if let Some(&target) = local.get(&arc.node) {
                    links.push((source as u32, target, arc.flow));
                }
            }
        }

        let pick = |lists: &[Items]| -> Vec<Items> {
            members.iter().map(|&g| lists[g as usize].clone()).collect()
        };
        let (member_offsets, member_leaf) = identity_members(k);
        Self {
            data: members.iter().map(|&g| self.data[g as usize]).collect(),
            member_offsets,
            member_leaf,
            links: Adjacency::from_links(k, links),
            directed: self.directed,
            physical: self.physical.as_deref().map(&pick),
            meta: self.meta.as_deref().map(&pick),
        }
    }

    /// Flow, enter and exit of each module when nodes are grouped by `node_to_module`.
    pub(crate) fn module_data(&self, node_to_module: &[u32], num_modules: usize) -> Vec<FlowData> {
        let mut modules = vec![FlowData::default(); num_modules];
        for (data, &m) in self.data.iter().zip(node_to_module) {
            modules[m as usize].flow += data.flow;
        }
        for (s, t, flow) in self.links.links() {
            let ms = node_to_module[s as usize] as usize;
            let mt = node_to_module[t as usize] as usize;
            if ms != mt {
                add_boundary_flow(&mut modules, ms, mt, flow, self.directed);
            }
        }
        modules
    }

    /// Recomputes each node's flow data from the leaves it contains.
    pub(crate) fn refresh_from_leaves(&mut self, leaf_network: &ActiveNetwork) {
        if self.data.is_empty() {
            return;
        }
        let assignment = self.assignment_to_leaves(leaf_network.node_count());
        self.data = leaf_network.module_data(&assignment, self.node_count());
    }

    /// Codelength with every node in one module.
    pub(crate) fn one_level_codelength(&self) -> f64 {
        match &self.physical {
            Some(physical) => -merge_items(physical.iter())
                .iter()
                .map(|&(_, f)| plogp(f))
                .sum::<f64>(),
            None => -self.data.iter().map(|d| plogp(d.flow)).sum::<f64>(),
        }
    }
}

use crate::graph::FlowData;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaFlow {
    pub module: u32,
    pub delta_exit: f64,
    pub delta_enter: f64,
}

/// Weighted keys carried by a node: physical ids for memory networks, or meta
/// categories. Keys are unique within one list.
pub type Items = Vec<(u32, f64)>;

/// Per-node item lists beyond plain flow, indexed like the node data.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeItems<'a> {
    pub physical: Option<&'a [Items]>,
    pub meta: Option<&'a [Items]>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct MoveDeltaContext {
    // Cached old-module terms reused across candidate destinations for one moved node.
    node: usize,
    old_module: u32,
    de_old: f64,
    current_flow: f64,
    current_enter_flow: f64,
    current_exit_flow: f64,
    old_enter_before: f64,
    old_enter_after: f64,
    old_exit_before: f64,
    old_exit_after: f64,
    old_total_before: f64,
    old_total_after: f64,
}

#[inline]
pub fn plogp(p: f64) -> f64 {
    if p > 0.0 { p * p.log2() } else { 0.0 }
}

/// Item weights aggregated per module with the two entropy sums the
/// codelength needs: `Σ_m Σ_k plogp(w_mk)` and `Σ_m plogp(W_m)`.
#[derive(Debug, Clone, Default)]
struct ItemDistribution {
    node_items: Vec<Items>,
    module_items: Vec<FxHashMap<u32, f64>>,
    module_total: Vec<f64>,
    item_log_item: f64,
    total_log_total: f64,
}

impl ItemDistribution {
    fn from_nodes(nodes: &[Items]) -> Self {
        let mut module_items = Vec::with_capacity(nodes.len());
        let mut module_total = Vec::with_capacity(nodes.len());
        let mut item_log_item = 0.0;
        let mut total_log_total = 0.0;
        for items in nodes {
            let mut map = FxHashMap::default();
            let mut total = 0.0;
            for &(key, w) in items {
                *map.entry(key).or_insert(0.0) += w;
                total += w;
            }
            for &w in map.values() {
                item_log_item += plogp(w);
            }
            total_log_total += plogp(total);
            module_items.push(map);
            module_total.push(total);
        }
        Self {
            node_items: nodes.to_vec(),
            module_items,
            module_total,
            item_log_item,
            total_log_total,
        }
    }

    fn delta_on_move(&self, node: usize, old_m: usize, new_m: usize) -> (f64, f64) {
        if old_m == new_m {
            return (0.0, 0.0);
        }
        let old_items = &self.module_items[old_m];
        let new_items = &self.module_items[new_m];
        let mut d_item = 0.0;
        let mut moved = 0.0;
        for &(key, w) in &self.node_items[node] {
            let a = old_items.get(&key).copied().unwrap_or(0.0);
            let b = new_items.get(&key).copied().unwrap_or(0.0);
            d_item += plogp(a - w) - plogp(a) + plogp(b + w) - plogp(b);
            moved += w;
        }
        let w_old = self.module_total[old_m];
        let w_new = self.module_total[new_m];
        let d_total = plogp(w_old - moved) - plogp(w_old) + plogp(w_new + moved) - plogp(w_new);
        (d_item, d_total)
    }

    fn apply_move(&mut self, node: usize, old_m: usize, new_m: usize) {
        if old_m == new_m {
            return;
        }
        let (d_item, d_total) = self.delta_on_move(node, old_m, new_m);
        self.item_log_item += d_item;
        self.total_log_total += d_total;

        let mut moved = 0.0;
        for &(key, w) in &self.node_items[node] {
            let old_items = &mut self.module_items[old_m];
            if let Some(v) = old_items.get_mut(&key) {
                *v -= w;
                if *v <= 0.0 {
                    old_items.remove(&key);
                }
            }
            *self.module_items[new_m].entry(key).or_insert(0.0) += w;
            moved += w;
        }
        self.module_total[old_m] -= moved;
        self.module_total[new_m] += moved;
    }
}

#[derive(Debug, Clone)]
pub struct MapEquationObjective {
    pub codelength: f64,
    pub index_codelength: f64,
    pub module_codelength: f64,
    pub meta_codelength: f64,

    node_flow_log_node_flow: f64,
    flow_log_flow: f64,
    exit_log_exit: f64,
    enter_log_enter: f64,
    enter_flow: f64,
    enter_flow_log_enter_flow: f64,

    exit_network_flow: f64,
    exit_network_flow_log_exit_network_flow: f64,

    meta_data_rate: f64,
    // Memory networks code node flow per physical node within each module.
    memory: Option<ItemDistribution>,
    meta: Option<ItemDistribution>,
}

impl MapEquationObjective {
    pub fn new(node_data: &[FlowData]) -> Self {
        Self::from_flowdata_iter(node_data.iter())
    }

    pub fn from_flowdata_iter<'a, I>(node_data: I) -> Self
    where
        I: IntoIterator<Item = &'a FlowData>,
    {
        let mut node_flow_log_node_flow = 0.0;
        for n in node_data {
            node_flow_log_node_flow += plogp(n.flow);
        }
        Self {
            codelength: 0.0,
            index_codelength: 0.0,
            module_codelength: 0.0,
            meta_codelength: 0.0,
            node_flow_log_node_flow,
            flow_log_flow: 0.0,
            exit_log_exit: 0.0,
            enter_log_enter: 0.0,
            enter_flow: 0.0,
            enter_flow_log_enter_flow: 0.0,
            exit_network_flow: 0.0,
            exit_network_flow_log_exit_network_flow: 0.0,
            meta_data_rate: 1.0,
            memory: None,
            meta: None,
        }
    }

    pub fn with_meta_data_rate(mut self, rate: f64) -> Self {
        self.meta_data_rate = rate;
        self
    }

    /// Flow leaving a sub-network through its parent module boundary.
    pub fn set_exit_network_flow(&mut self, flow: f64) {
        self.exit_network_flow = flow;
        self.exit_network_flow_log_exit_network_flow = plogp(flow);
    }

    /// Starts from one module per entry of `module_data`; module `i` holds the
    /// items of node `i`.
    pub fn init_partition(&mut self, module_data: &[FlowData], items: NodeItems<'_>) {
        self.flow_log_flow = 0.0;
        self.exit_log_exit = 0.0;
        self.enter_log_enter = 0.0;
        self.enter_flow = self.exit_network_flow;

        for d in module_data {
            self.flow_log_flow += plogp(d.flow + d.exit_flow);
            self.enter_log_enter += plogp(d.enter_flow);
            self.exit_log_exit += plogp(d.exit_flow);
            self.enter_flow += d.enter_flow;
        }

        self.memory = items.physical.map(ItemDistribution::from_nodes);
        self.meta = items.meta.map(ItemDistribution::from_nodes);

        self.enter_flow_log_enter_flow = plogp(self.enter_flow);
        self.refresh_codelength();
    }

    fn refresh_codelength(&mut self) {
        let node_term = self
            .memory
            .as_ref()
            .map_or(self.node_flow_log_node_flow, |m| m.item_log_item);
        self.index_codelength = self.enter_flow_log_enter_flow
            - self.enter_log_enter
            - self.exit_network_flow_log_exit_network_flow;
        self.module_codelength = -self.exit_log_exit + self.flow_log_flow - node_term;
        self.meta_codelength = self.meta.as_ref().map_or(0.0, |m| {
            self.meta_data_rate * (m.total_log_total - m.item_log_item)
        });
        self.codelength = self.index_codelength + self.module_codelength + self.meta_codelength;
    }

    pub fn get_delta_on_move(
        &self,
        node: usize,
        current: &FlowData,
        old_delta: &DeltaFlow,
        new_delta: &DeltaFlow,
        module_data: &[FlowData],
    ) -> f64 {
        let context = self.prepare_move_context(node, current, old_delta, module_data);
        self.get_delta_on_move_with_context(&context, new_delta, module_data)
    }

    /// Codelength change of moving `node` out of `old_delta.module` into each
    /// of `candidates`, in the order given. The node's own module is skipped.
    pub(crate) fn move_deltas<'c, I>(
        &'c self,
        node: usize,
        current: &FlowData,
        old_delta: &DeltaFlow,
        candidates: I,
        module_data: &'c [FlowData],
    ) -> impl Iterator<Item = (DeltaFlow, f64)> + 'c
    where
        I: IntoIterator<Item = &'c DeltaFlow>,
        I::IntoIter: 'c,
    {
        let context = self.prepare_move_context(node, current, old_delta, module_data);
        candidates
            .into_iter()
            .filter(move |cand| cand.module != context.old_module)
            .map(move |cand| {
                let delta = self.get_delta_on_move_with_context(&context, cand, module_data);
                (*cand, delta)
            })
    }

    fn prepare_move_context(
        &self,
        node: usize,
        current: &FlowData,
        old_delta: &DeltaFlow,
        module_data: &[FlowData],
    ) -> MoveDeltaContext {
        let old_m = old_delta.module as usize;
        let de_old = old_delta.delta_enter + old_delta.delta_exit;

        let old_enter_before = plogp(module_data[old_m].enter_flow);
        let old_enter_after = plogp(module_data[old_m].enter_flow - current.enter_flow + de_old);
        let old_exit_before = plogp(module_data[old_m].exit_flow);
        let old_exit_after = plogp(module_data[old_m].exit_flow - current.exit_flow + de_old);
        let old_total_before = plogp(module_data[old_m].exit_flow + module_data[old_m].flow);
        let old_total_after = plogp(
            module_data[old_m].exit_flow + module_data[old_m].flow
                - current.exit_flow
                - current.flow
                + de_old,
        );

        MoveDeltaContext {
            node,
            old_module: old_delta.module,
            de_old,
            current_flow: current.flow,
            current_enter_flow: current.enter_flow,
            current_exit_flow: current.exit_flow,
            old_enter_before,
            old_enter_after,
            old_exit_before,
            old_exit_after,
            old_total_before,
            old_total_after,
        }
    }

    fn get_delta_on_move_with_context(
        &self,
        context: &MoveDeltaContext,
        new_delta: &DeltaFlow,
        module_data: &[FlowData],
    ) -> f64 {
        let new_m = new_delta.module as usize;
        let de_new = new_delta.delta_enter + new_delta.delta_exit;

        let delta_enter =
            plogp(self.enter_flow + context.de_old - de_new) - self.enter_flow_log_enter_flow;

        let delta_enter_log_enter = -context.old_enter_before
            - plogp(module_data[new_m].enter_flow)
            + context.old_enter_after
            + plogp(module_data[new_m].enter_flow + context.current_enter_flow - de_new);

        let delta_exit_log_exit = -context.old_exit_before - plogp(module_data[new_m].exit_flow)
            + context.old_exit_after
            + plogp(module_data[new_m].exit_flow + context.current_exit_flow - de_new);

        let delta_flow_log_flow = -context.old_total_before
            - plogp(module_data[new_m].exit_flow + module_data[new_m].flow)
            + context.old_total_after
            + plogp(
                module_data[new_m].exit_flow
                    + module_data[new_m].flow
                    + context.current_exit_flow
                    + context.current_flow
                    - de_new,
            );

        let mut delta =
            delta_enter - delta_enter_log_enter - delta_exit_log_exit + delta_flow_log_flow;

        let old_m = context.old_module as usize;
        if let Some(memory) = &self.memory {
            let (d_item, _) = memory.delta_on_move(context.node, old_m, new_m);
            delta -= d_item;
        }
        if let Some(meta) = &self.meta {
            let (d_item, d_total) = meta.delta_on_move(context.node, old_m, new_m);
            delta += self.meta_data_rate * (d_total - d_item);
        }
        delta
    }

    pub fn update_on_move(
        &mut self,
        node: usize,
        current: &FlowData,
        old_delta: &DeltaFlow,
        new_delta: &DeltaFlow,
        module_data: &mut [FlowData],
    ) {
        let old_m = old_delta.module as usize;
        let new_m = new_delta.module as usize;

        let de_old = old_delta.delta_enter + old_delta.delta_exit;
        let de_new = new_delta.delta_enter + new_delta.delta_exit;

        self.enter_flow -= module_data[old_m].enter_flow + module_data[new_m].enter_flow;
        self.enter_log_enter -=
            plogp(module_data[old_m].enter_flow) + plogp(module_data[new_m].enter_flow);
        self.exit_log_exit -=
            plogp(module_data[old_m].exit_flow) + plogp(module_data[new_m].exit_flow);
        self.flow_log_flow -= plogp(module_data[old_m].exit_flow + module_data[old_m].flow)
            + plogp(module_data[new_m].exit_flow + module_data[new_m].flow);

        module_data[old_m] -= *current;
        module_data[new_m] += *current;

        module_data[old_m].enter_flow += de_old;
        module_data[old_m].exit_flow += de_old;
        module_data[new_m].enter_flow -= de_new;
        module_data[new_m].exit_flow -= de_new;

        self.enter_flow += module_data[old_m].enter_flow + module_data[new_m].enter_flow;
        self.enter_log_enter +=
            plogp(module_data[old_m].enter_flow) + plogp(module_data[new_m].enter_flow);
        self.exit_log_exit +=
            plogp(module_data[old_m].exit_flow) + plogp(module_data[new_m].exit_flow);
        self.flow_log_flow += plogp(module_data[old_m].exit_flow + module_data[old_m].flow)
            + plogp(module_data[new_m].exit_flow + module_data[new_m].flow);

        if let Some(memory) = &mut self.memory {
            memory.apply_move(node, old_m, new_m);
        }
        if let Some(meta) = &mut self.meta {
            meta.apply_move(node, old_m, new_m);
        }

        self.enter_flow_log_enter_flow = plogp(self.enter_flow);
        self.refresh_codelength();
    }
}

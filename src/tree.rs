use crate::aggregate::{merge_items, ActiveNetwork, UNKNOWN_META};
use crate::graph::{FlowData, Graph};
use crate::hierarchy::{CodelengthTerms, HierarchyResult};
use crate::objective::Items;
use std::collections::BTreeMap;

/// Identity of the network node behind a leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafInfo {
    pub state_id: u32,
    pub physical_id: u32,
    pub layer_id: Option<u32>,
    pub name: Option<String>,
    /// Node at or above the bipartite start id.
    pub is_feature: bool,
}

/// One node of the result tree: the root, a module or a leaf.
#[derive(Debug, Clone)]
pub struct InfoNode {
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// 0 for the root.
    pub depth: u32,
    /// 1-based child ranks from the root down to this node.
    pub path: Vec<u32>,
    pub data: FlowData,
    /// Index codelength for the root, module codelength for modules, 0 for leaves.
    pub codelength: f64,
    /// Meta category distribution as (category, weight), sorted by category.
    pub meta: Items,
    pub leaf: Option<LeafInfo>,
}

impl InfoNode {
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.leaf.is_some()
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// A physical node's share of one leaf module, merging its state nodes there.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalLeaf {
    /// Tree index of the module holding the state nodes.
    pub module: usize,
    pub physical_id: u32,
    pub flow: f64,
    pub state_ids: Vec<u32>,
}

/// The winning hierarchy of a run.
#[derive(Debug, Clone)]
pub struct InfoTree {
    nodes: Vec<InfoNode>,
    codelength: f64,
    index_codelength: f64,
    module_codelength: f64,
    meta_codelength: f64,
    one_level_codelength: f64,
    entropy_rate: f64,
    num_levels: u32,
    hide_bipartite_nodes: bool,
}

/// Pending tree node while the arena is filled top-down.
enum Slot {
    Module(u32),
    Leaf(u32),
}

impl InfoTree {
    pub(crate) fn build(
        graph: &Graph,
        leaf_network: &ActiveNetwork,
        hierarchy: &HierarchyResult,
        terms: &CodelengthTerms,
        one_level_codelength: f64,
        unweighted_meta_data: bool,
        hide_bipartite_nodes: bool,
    ) -> Self {
        let leaf_base = hierarchy.leaf_base();
        let leaf_count = hierarchy.leaf_count();
        let module_count = hierarchy.module_count();
        let has_meta_data = graph.has_meta_data();

        // Lowest leaf index below each module, for ordering equal-flow siblings.
        let mut min_leaf = vec![u32::MAX; module_count];
        for (leaf, path) in hierarchy.leaf_paths.iter().enumerate() {
            for &m in path {
                let slot = &mut min_leaf[m as usize];
                *slot = (*slot).min(leaf as u32);
            }
        }

        let sort_key = |slot: &Slot| -> (f64, u32) {
            match *slot {
                Slot::Module(m) => (hierarchy.module_data[m as usize].flow, min_leaf[m as usize]),
                Slot::Leaf(leaf) => (leaf_network.data[leaf as usize].flow, leaf),
            }
        };
        let sorted_children = |slots: &mut Vec<Slot>| {
            slots.sort_by(|a, b| {
                let (fa, ia) = sort_key(a);
                let (fb, ib) = sort_key(b);
                fb.total_cmp(&fa).then(ia.cmp(&ib))
            });
        };

        let mut root_slots: Vec<Slot> = hierarchy
            .top_modules
            .iter()
            .map(|&m| Slot::Module(m))
            .chain(hierarchy.root_leaves().map(Slot::Leaf))
            .collect();
        sorted_children(&mut root_slots);

        let mut nodes = Vec::with_capacity(1 + module_count + leaf_count);
        nodes.push(InfoNode {
            parent: None,
            children: Vec::new(),
            depth: 0,
            path: Vec::new(),
            data: FlowData {
                flow: leaf_network.data.iter().map(|d| d.flow).sum(),
                enter_flow: 0.0,
                exit_flow: 0.0,
            },
            codelength: terms.index,
            meta: Items::new(),
            leaf: None,
        });

        let mut stack: Vec<(usize, Vec<Slot>)> = vec![(0, root_slots)];
        while let Some((parent, slots)) = stack.pop() {
            let parent_depth = nodes[parent].depth;
            let parent_path = nodes[parent].path.clone();
            for (rank, slot) in slots.into_iter().enumerate() {
                let idx = nodes.len();
                let mut path = parent_path.clone();
                path.push(rank as u32 + 1);
                match slot {
                    Slot::Module(m) => {
                        nodes.push(InfoNode {
                            parent: Some(parent),
                            children: Vec::new(),
                            depth: parent_depth + 1,
                            path,
                            data: hierarchy.module_data[m as usize],
                            codelength: terms.modules[m as usize],
                            meta: Items::new(),
                            leaf: None,
                        });
                        let mut child_slots: Vec<Slot> = hierarchy
                            .children(m as usize)
                            .iter()
                            .map(|&c| {
                                if c < leaf_base {
                                    Slot::Leaf(c)
                                } else {
                                    Slot::Module(c - leaf_base)
                                }
                            })
                            .collect();
                        sorted_children(&mut child_slots);
                        stack.push((idx, child_slots));
                    }
                    Slot::Leaf(leaf) => {
                        let record = &graph.nodes[leaf as usize];
                        let meta = if has_meta_data {
                            let weight = if unweighted_meta_data {
                                1.0 / leaf_count as f64
                            } else {
                                record.data.flow
                            };
                            vec![(record.meta.unwrap_or(UNKNOWN_META), weight)]
                        } else {
                            Items::new()
                        };
                        nodes.push(InfoNode {
                            parent: Some(parent),
                            children: Vec::new(),
                            depth: parent_depth + 1,
                            path,
                            data: leaf_network.data[leaf as usize],
                            codelength: 0.0,
                            meta,
                            leaf: Some(LeafInfo {
                                state_id: record.id,
                                physical_id: record.physical_id,
                                layer_id: record.layer_id,
                                name: record.name.clone(),
                                is_feature: record.is_feature,
                            }),
                        });
                    }
                }
                nodes[parent].children.push(idx);
            }
        }

        // Children come after their parent, so a reverse sweep sees them first.
        for idx in (0..nodes.len()).rev() {
            if nodes[idx].is_leaf() || nodes[idx].children.is_empty() {
                continue;
            }
            let merged = merge_items(nodes[idx].children.iter().map(|&c| &nodes[c].meta));
            nodes[idx].meta = merged;
        }

        let num_levels = nodes
            .iter()
            .filter(|n| n.is_leaf())
            .map(|n| n.depth)
            .max()
            .unwrap_or(0);

        Self {
            nodes,
            codelength: terms.total(),
            index_codelength: terms.index,
            module_codelength: terms.module_total(),
            meta_codelength: terms.meta,
            one_level_codelength,
            entropy_rate: graph.entropy_rate,
            num_levels,
            hide_bipartite_nodes,
        }
    }

    pub fn root(&self) -> &InfoNode {
        &self.nodes[0]
    }

    pub fn node(&self, idx: usize) -> Option<&InfoNode> {
        self.nodes.get(idx)
    }

    /// Number of tree nodes, the root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree has no nodes at all. A built tree always holds its
    /// root, so this is false even when the root has no children.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn codelength(&self) -> f64 {
        self.codelength
    }

    pub fn index_codelength(&self) -> f64 {
        self.index_codelength
    }

    /// Sum over all modules, without the meta part.
    pub fn module_codelength(&self) -> f64 {
        self.module_codelength
    }

    pub fn meta_codelength(&self) -> f64 {
        self.meta_codelength
    }

    pub fn one_level_codelength(&self) -> f64 {
        self.one_level_codelength
    }

    /// `1 - codelength / one_level_codelength`, or 0 when one level costs nothing.
    pub fn relative_codelength_savings(&self) -> f64 {
        if self.one_level_codelength > 0.0 {
            1.0 - self.codelength / self.one_level_codelength
        } else {
            0.0
        }
    }

    /// Depth of the deepest leaf: 1 for one level, 2 for a two-level partition.
    pub fn num_levels(&self) -> u32 {
        self.num_levels
    }

    pub fn num_top_modules(&self) -> usize {
        self.root()
            .children
            .iter()
            .filter(|&&c| !self.nodes[c].is_leaf())
            .count()
    }

    pub fn entropy_rate(&self) -> f64 {
        self.entropy_rate
    }

    fn is_hidden(&self, node: &InfoNode) -> bool {
        self.hide_bipartite_nodes && node.leaf.as_ref().is_some_and(|l| l.is_feature)
    }

    /// Indices of every node in depth-first pre-order, root first.
    pub fn pre_order(&self) -> PreOrder<'_> {
        PreOrder {
            tree: self,
            stack: vec![0],
        }
    }

    /// All nodes in depth-first pre-order, root first. Hidden feature leaves
    /// are skipped.
    pub fn iter(&self) -> impl Iterator<Item = &InfoNode> + '_ {
        self.pre_order()
            .map(move |idx| &self.nodes[idx])
            .filter(move |node| !self.is_hidden(node))
    }

    /// Leaves in pre-order.
    pub fn leaves(&self) -> impl Iterator<Item = &InfoNode> + '_ {
        self.iter().filter(|node| node.is_leaf())
    }

    /// Modules whose children are all leaves, in pre-order. Modules holding
    /// only hidden feature leaves are skipped.
    pub fn leaf_modules(&self) -> impl Iterator<Item = (usize, &InfoNode)> + '_ {
        self.pre_order()
            .map(move |idx| (idx, &self.nodes[idx]))
            .filter(move |(_, node)| {
                if node.is_leaf() || node.is_root() {
                    return false;
                }
                let children = node.children.iter().map(|&c| &self.nodes[c]);
                children.clone().all(InfoNode::is_leaf)
                    && children.clone().any(|child| !self.is_hidden(child))
            })
    }

    /// Tree index of the module a leaf belongs to at `level`: 1 is the top
    /// level, deeper levels fall back to the leaf's parent when the leaf sits
    /// higher, and any level <= 0 selects the parent. A leaf directly under
    /// the root belongs to the root.
    fn module_at_level(&self, leaf_idx: usize, level: i32) -> usize {
        let leaf = &self.nodes[leaf_idx];
        let parent = leaf.parent.unwrap_or(0);
        if level <= 0 || parent == 0 {
            return parent;
        }
        let mut chain = Vec::with_capacity(leaf.depth as usize);
        let mut current = parent;
        while current != 0 {
            chain.push(current);
            current = self.nodes[current].parent.unwrap_or(0);
        }
        chain.reverse();
        let level = (level as usize).min(chain.len());
        chain[level - 1]
    }

    /// Module id per state id at `level` (1 = top, -1 = finest). Ids are
    /// 1-based in pre-order of first appearance.
    pub fn module_ids(&self, level: i32) -> BTreeMap<u32, u32> {
        let mut dense: BTreeMap<usize, u32> = BTreeMap::new();
        let mut out = BTreeMap::new();
        for idx in self.pre_order() {
            let node = &self.nodes[idx];
            let Some(leaf) = node.leaf.as_ref() else {
                continue;
            };
            if self.is_hidden(node) {
                continue;
            }
            let module = self.module_at_level(idx, level);
            let next = dense.len() as u32 + 1;
            let id = *dense.entry(module).or_insert(next);
            out.insert(leaf.state_id, id);
        }
        out
    }

    /// Leaves merged per physical node inside each parent module, in pre-order
    /// of the modules. A physical node may appear under several modules.
    pub fn physical_leaves(&self) -> Vec<PhysicalLeaf> {
        let mut out = Vec::new();
        let mut module_entries: BTreeMap<u32, PhysicalLeaf> = BTreeMap::new();
        for idx in self.pre_order() {
            let node = &self.nodes[idx];
            if node.is_leaf() {
                continue;
            }
            module_entries.clear();
            for &c in &node.children {
                let child = &self.nodes[c];
                let Some(leaf) = child.leaf.as_ref() else {
                    continue;
                };
                if self.is_hidden(child) {
                    continue;
                }
                let entry = module_entries
                    .entry(leaf.physical_id)
                    .or_insert_with(|| PhysicalLeaf {
                        module: idx,
                        physical_id: leaf.physical_id,
                        flow: 0.0,
                        state_ids: Vec::new(),
                    });
                entry.flow += child.data.flow;
                entry.state_ids.push(leaf.state_id);
            }
            let mut entries: Vec<PhysicalLeaf> =
                std::mem::take(&mut module_entries).into_values().collect();
            entries.sort_by(|a, b| b.flow.total_cmp(&a.flow).then(a.physical_id.cmp(&b.physical_id)));
            out.extend(entries);
        }
        out
    }

    /// Module ids per physical id at `level`, numbered as in [`Self::module_ids`].
    /// Overlapping physical nodes list every module their state nodes are in.
    pub fn physical_module_ids(&self, level: i32) -> BTreeMap<u32, Vec<u32>> {
        let mut dense: BTreeMap<usize, u32> = BTreeMap::new();
        let mut out: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for idx in self.pre_order() {
            let node = &self.nodes[idx];
            let Some(leaf) = node.leaf.as_ref() else {
                continue;
            };
            if self.is_hidden(node) {
                continue;
            }
            let module = self.module_at_level(idx, level);
            let next = dense.len() as u32 + 1;
            let id = *dense.entry(module).or_insert(next);
            let ids = out.entry(leaf.physical_id).or_default();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        for ids in out.values_mut() {
            ids.sort_unstable();
        }
        out
    }
}

/// Depth-first pre-order walk over tree indices.
pub struct PreOrder<'t> {
    tree: &'t InfoTree,
    stack: Vec<usize>,
}

impl Iterator for PreOrder<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let idx = self.stack.pop()?;
        self.stack
            .extend(self.tree.nodes[idx].children.iter().rev().copied());
        Some(idx)
    }
}

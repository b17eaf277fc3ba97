//! Hierarchical community detection with the map equation.
//!
//! A [`Network`] is compiled into a [`Graph`], flow is computed by the
//! configured random-walk model, and a [`TrialDriver`] searches nested modules
//! over several seeded trials, keeping the shortest [`InfoTree`].

pub mod config;
pub mod error;
pub mod flow;
pub mod graph;
pub mod network;
pub mod objective;
pub mod optimizer;
pub mod rng;
pub mod tree;
pub mod trials;

pub(crate) mod aggregate;
pub(crate) mod hierarchy;
pub(crate) mod mover;

pub use aggregate::UNKNOWN_META;
pub use config::{Config, FlowModel, InitialPartition, RngKind};
pub use error::{Error, Result};
pub use flow::calculate_flow;
pub use graph::{FlowData, Graph, NodeRecord};
pub use network::Network;
pub use objective::MapEquationObjective;
pub use optimizer::{incremental_two_level_codelength, two_level_codelength};
pub use tree::{InfoNode, InfoTree, LeafInfo, PhysicalLeaf};
pub use trials::{TrialDriver, TrialSummary};

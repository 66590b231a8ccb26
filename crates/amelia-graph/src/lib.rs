pub mod approval;
pub mod engine;
pub mod nodes;
pub mod plan_parser;
pub mod routing;

pub use approval::{ApprovalDecision, ApprovalGate};
pub use engine::GraphEngine;
pub use nodes::{production_driver_resolver, DriverResolver, NodeContext};
pub use routing::{route, GraphNode};

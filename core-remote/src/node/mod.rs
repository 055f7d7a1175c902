//! Per-node polling, load scoring and tick bookkeeping.

pub mod history;
pub mod penalty;
pub mod processor;

pub use history::{TickHistory, TickRecord, TickStatus};
pub use penalty::{PenaltyDetails, MAX_PENALTY};
pub use processor::{NodeProcessor, NodeResources, NodeSnapshot, NodeState};

pub mod analysis;
pub mod condition;
pub mod error;
pub mod service;

pub use analysis::TopologyAnalysis;
pub use condition::{CmpOp, Condition, Literal, Side};
pub use error::TopologyError;
pub use service::TopologyService;

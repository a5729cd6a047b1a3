//! Topics and the process-wide topic registry.

pub mod registry;
pub mod topic;

pub use registry::TopicRegistry;
pub use topic::Topic;

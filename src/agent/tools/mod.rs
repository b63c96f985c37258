pub mod base;
pub mod registry;

pub use base::{ExecutionContext, Tool};
pub use registry::{ToolRegistry, ToolRegistryBuilder};

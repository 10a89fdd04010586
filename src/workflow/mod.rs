pub mod classifier;
pub mod store;
pub mod types;

pub use classifier::is_deterministic;
pub use store::{JsonFileStore, WorkflowFile, WorkflowStore};
pub use types::{Step, StepAction, WorkflowType};

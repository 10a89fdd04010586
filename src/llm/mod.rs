pub mod provider;
pub mod providers;
pub mod registry;
pub mod sse_parser;
pub mod types;

pub use provider::{generate_with_timeout, ModelClient};
pub use registry::{ModelRole, ModelRoles, ProviderRegistry, RoleBinding};
pub use types::{GenerateRequest, GenerateResponse, Part};

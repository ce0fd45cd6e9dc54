pub mod attachments;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod guardrails;
pub mod provider_config;
pub mod task_profile;
pub mod traits;
pub mod types;
pub mod validation;

pub use capabilities::{get_capabilities, has_capability, Capability, ModelCapabilities};
pub use config::AppConfig;
pub use error::{FieldError, HaloError, Result};
pub use guardrails::Guardrails;
pub use provider_config::{ProviderConfig, ProviderConfigResolver};
pub use task_profile::{ResolvedModel, TaskProfileResolver};
pub use traits::ProviderAdapter;
pub use types::*;

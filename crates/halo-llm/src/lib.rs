pub mod aggregator;
pub mod auth;
pub mod client_cache;
pub mod dispatch;
pub mod providers;
pub mod streaming;

pub use aggregator::{StreamAggregator, StreamFrame};
pub use auth::{ClientSecretCredential, TokenCredential};
pub use dispatch::{Adapters, ChatDispatcher, ImageGenerationOutput, PreparedCall};
pub use providers::{AzureOpenAiAdapter, FoundryAdapter, OpenAiAdapter};

pub mod azure;
pub mod foundry;
pub mod openai;

pub use azure::AzureOpenAiAdapter;
pub use foundry::FoundryAdapter;
pub use openai::OpenAiAdapter;

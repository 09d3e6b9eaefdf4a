pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::ScriptedModelClient;
pub use openai::OpenAiModelClient;
pub use traits::{ModelClient, ModelError, ModelMessage, ModelReply, ModelRole, ProposedCall};

//! 远端能力层：后端抽象与实现（OpenAI 兼容 / Scripted Mock）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::{ScriptedBackend, ScriptedReply};
pub use openai::OpenAiBackend;
pub use traits::{
    AgentBackend, AgentHandle, ContextMap, FailureHint, Invocation, InvocationOutput, RemoteFailure,
};

//! Agent Relay - 远端 Agent 调用的重试 / fallback 编排层
//!
//! 模块划分：
//! - **agent**: 无头 Agent 运行时（供 CLI / 聊天机器人 / HTTP 等前端调用）
//! - **config**: 配置加载（TOML + 环境变量），产出不可变快照
//! - **core**: 错误分类、退避、候选序列、单次尝试、单候选重试、跨候选 fallback
//! - **llm**: 远端能力抽象与实现（OpenAI 兼容 / Scripted Mock）
//! - **observability**: tracing 初始化

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;

pub use agent::{AgentManager, AgentReply};
pub use crate::core::{ErrorKind, FallbackOrchestrator, RelayError, RequestContext};

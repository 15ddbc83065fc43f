//! 核心编排层：错误分类、退避、候选序列、单次尝试、单候选重试、跨候选 fallback

pub mod backoff;
pub mod candidates;
pub mod classifier;
pub mod context;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod retry;

pub use backoff::BackoffScheduler;
pub use candidates::{CandidateList, CandidateSequencer};
pub use classifier::ErrorClassifier;
pub use context::{RequestContext, RetryBudget};
pub use error::{AttemptMeta, ClassifiedError, ErrorKind, RelayError, TerminalState};
pub use executor::{AgentResponse, AttemptOutcome, CallAttemptExecutor, Candidate, HandleGuard};
pub use orchestrator::FallbackOrchestrator;
pub use retry::{RetryCoordinator, RetryOutcome, RetryState};

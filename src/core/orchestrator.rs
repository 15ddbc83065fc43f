//! Fallback 编排器：主控循环
//!
//! 端点在外、模型在内，逐个候选运行 RetryCoordinator（每个候选一份新的 RetryBudget）：
//! - 成功立即返回，后续候选不再尝试；
//! - PolicyRejected / ConfigurationError / Cancelled 换候选也会复现，直接返回；
//! - 其余失败升级到下一个候选；全部失败后返回 AggregateExhausted。
//!
//! 外层另有有限次的整体重试：一轮全部耗尽且最后错误可重试时，退避后重跑整轮。

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::core::backoff::BackoffScheduler;
use crate::core::candidates::{CandidateList, CandidateSequencer};
use crate::core::context::RequestContext;
use crate::core::error::{ClassifiedError, ErrorKind, RelayError, TerminalState};
use crate::core::executor::{AgentResponse, CallAttemptExecutor, Candidate};
use crate::core::retry::{RetryCoordinator, RetryOutcome};
use crate::llm::AgentBackend;

/// 一轮编排的失败方式
#[derive(Debug)]
enum PassFailure {
    /// 不应继续尝试其他候选的错误
    Stopped {
        error: ClassifiedError,
        state: TerminalState,
        attempts: u32,
    },
    /// 所有候选都已尝试
    Exhausted {
        last: ClassifiedError,
        candidates_tried: usize,
    },
}

pub struct FallbackOrchestrator {
    executor: CallAttemptExecutor,
}

impl FallbackOrchestrator {
    pub fn new(backend: Arc<dyn AgentBackend>) -> Self {
        Self {
            executor: CallAttemptExecutor::new(backend),
        }
    }

    /// 执行一次逻辑请求；成功时 ctx.context 已合并远端返回的更新
    pub async fn execute(
        &self,
        ctx: &mut RequestContext,
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, RelayError> {
        let settings = Arc::clone(&ctx.settings);
        let candidates = CandidateSequencer::build(
            &settings.agent.model,
            &settings.agent.fallback_models,
            &settings.endpoints.primary,
            &settings.endpoints.fallbacks,
        );
        let scheduler = BackoffScheduler::new(settings.retry.base_delay)
            .with_jitter(settings.retry.jitter)
            .with_max_delay(settings.retry.max_delay);
        let max_passes = settings.retry.top_level_retries.saturating_add(1);
        let trace_id = ctx.trace_id.clone();

        let mut passes = 0u32;
        loop {
            passes += 1;
            let failure = match self.run_pass(&candidates, ctx, cancel).await {
                Ok(response) => return Ok(response),
                Err(failure) => failure,
            };

            let (last, candidates_tried) = match failure {
                PassFailure::Stopped {
                    error,
                    state,
                    attempts,
                } => {
                    tracing::warn!(
                        kind = %error.kind,
                        trace_id = %trace_id,
                        "request stopped without further fallback: {}",
                        error.message
                    );
                    return Err(RelayError::from_classified(&error, state, attempts)
                        .with_detail("trace_id", json!(trace_id))
                        .with_detail("passes", json!(passes)));
                }
                PassFailure::Exhausted {
                    last,
                    candidates_tried,
                } => (last, candidates_tried),
            };

            if !last.retriable || passes >= max_passes {
                tracing::error!(
                    candidates_tried,
                    passes,
                    last_kind = %last.kind,
                    trace_id = %trace_id,
                    "all candidates exhausted"
                );
                return Err(RelayError::aggregate(&last, candidates_tried, passes)
                    .with_detail("trace_id", json!(trace_id)));
            }

            let delay = scheduler.delay_for(passes - 1);
            tracing::info!(
                passes,
                delay_ms = delay.as_millis() as u64,
                "all candidates failed with retriable errors, retrying whole request"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let error = ClassifiedError::cancelled();
                    return Err(RelayError::from_classified(&error, TerminalState::FailedTerminal, 0)
                        .with_detail("trace_id", json!(trace_id))
                        .with_detail("passes", json!(passes)));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_pass(
        &self,
        candidates: &CandidateList,
        ctx: &mut RequestContext,
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, PassFailure> {
        let coordinator = RetryCoordinator::new(&self.executor);
        let mut last: Option<ClassifiedError> = None;
        let mut candidates_tried = 0usize;

        for (index, model, endpoint) in candidates.pairs() {
            let candidate = Candidate {
                index,
                model,
                endpoint,
            };
            if cancel.is_cancelled() {
                return Err(PassFailure::Stopped {
                    error: ClassifiedError::cancelled().at_candidate(index, model, endpoint),
                    state: TerminalState::FailedTerminal,
                    attempts: 0,
                });
            }
            if let Some(previous) = &last {
                tracing::info!(
                    model,
                    endpoint,
                    previous_kind = %previous.kind,
                    "escalating to next candidate"
                );
            }

            candidates_tried += 1;
            let budget = ctx.retry_budget();
            match coordinator.run(candidate, budget, ctx, cancel).await {
                RetryOutcome::Succeeded { response, .. } => return Ok(response),
                RetryOutcome::FailedTerminal { error, attempts } if error.kind.halts_fallback() => {
                    return Err(PassFailure::Stopped {
                        error,
                        state: TerminalState::FailedTerminal,
                        attempts,
                    });
                }
                RetryOutcome::FailedTerminal { error, .. }
                | RetryOutcome::ExhaustedRetriable { error, .. } => last = Some(error),
            }
        }

        let last = last.unwrap_or_else(|| {
            ClassifiedError::new(ErrorKind::ConfigurationError, "no candidates configured")
        });
        Err(PassFailure::Exhausted {
            last,
            candidates_tried,
        })
    }
}

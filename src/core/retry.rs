//! 单候选重试协调器
//!
//! 状态机：Attempting(i) → Succeeded | FailedTerminal | Attempting(i+1) | ExhaustedRetriable。
//! 不可重试错误立即终止；可重试错误在预算内退避后重试，预算用尽则 ExhaustedRetriable。
//! 退避等待可被取消，取消后不再发起下一次尝试。

use tokio_util::sync::CancellationToken;

use crate::core::backoff::BackoffScheduler;
use crate::core::context::{RequestContext, RetryBudget};
use crate::core::error::{ClassifiedError, TerminalState};
use crate::core::executor::{AgentResponse, CallAttemptExecutor, Candidate};

/// 协调器状态；Attempting(i) 是唯一的非终止状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Attempting(u32),
    Succeeded,
    ExhaustedRetriable,
    FailedTerminal,
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RetryState::Attempting(_))
    }

    /// Attempting(i) 失败后的转移；终止状态保持不变
    pub fn after_failure(self, retriable: bool, budget: &RetryBudget) -> RetryState {
        match self {
            RetryState::Attempting(_) if !retriable => RetryState::FailedTerminal,
            RetryState::Attempting(i) if budget.allows_retry_after(i) => RetryState::Attempting(i + 1),
            RetryState::Attempting(_) => RetryState::ExhaustedRetriable,
            terminal => terminal,
        }
    }
}

/// 协调器输出：成功响应，或带终止状态的最后一个错误；均附带实际尝试次数
#[derive(Debug, Clone)]
pub enum RetryOutcome {
    Succeeded {
        response: AgentResponse,
        attempts: u32,
    },
    ExhaustedRetriable {
        error: ClassifiedError,
        attempts: u32,
    },
    FailedTerminal {
        error: ClassifiedError,
        attempts: u32,
    },
}

impl RetryOutcome {
    pub fn state(&self) -> RetryState {
        match self {
            RetryOutcome::Succeeded { .. } => RetryState::Succeeded,
            RetryOutcome::ExhaustedRetriable { .. } => RetryState::ExhaustedRetriable,
            RetryOutcome::FailedTerminal { .. } => RetryState::FailedTerminal,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. }
            | RetryOutcome::ExhaustedRetriable { attempts, .. }
            | RetryOutcome::FailedTerminal { attempts, .. } => *attempts,
        }
    }

    /// 失败时的错误与终止状态
    pub fn failure(&self) -> Option<(&ClassifiedError, TerminalState)> {
        match self {
            RetryOutcome::Succeeded { .. } => None,
            RetryOutcome::ExhaustedRetriable { error, .. } => {
                Some((error, TerminalState::ExhaustedRetriable))
            }
            RetryOutcome::FailedTerminal { error, .. } => Some((error, TerminalState::FailedTerminal)),
        }
    }
}

pub struct RetryCoordinator<'a> {
    executor: &'a CallAttemptExecutor,
}

impl<'a> RetryCoordinator<'a> {
    pub fn new(executor: &'a CallAttemptExecutor) -> Self {
        Self { executor }
    }

    pub async fn run(
        &self,
        candidate: Candidate<'_>,
        mut budget: RetryBudget,
        ctx: &mut RequestContext,
        cancel: &CancellationToken,
    ) -> RetryOutcome {
        let retry = &ctx.settings.retry;
        let scheduler = BackoffScheduler::new(budget.base_delay())
            .with_jitter(retry.jitter)
            .with_max_delay(retry.max_delay);

        loop {
            let retry_index = budget.consume();

            let error = match self.executor.attempt(candidate, retry_index, ctx, cancel).await {
                Ok(response) => {
                    tracing::info!(
                        model = candidate.model,
                        endpoint = candidate.endpoint,
                        attempts = budget.used(),
                        "attempt succeeded"
                    );
                    return RetryOutcome::Succeeded {
                        response,
                        attempts: budget.used(),
                    };
                }
                Err(error) => error,
            };

            tracing::warn!(
                model = candidate.model,
                endpoint = candidate.endpoint,
                kind = %error.kind,
                retriable = error.retriable,
                retry_index,
                "attempt failed: {}",
                error.message
            );

            match RetryState::Attempting(retry_index).after_failure(error.retriable, &budget) {
                RetryState::FailedTerminal => {
                    return RetryOutcome::FailedTerminal {
                        error,
                        attempts: budget.used(),
                    };
                }
                RetryState::ExhaustedRetriable => {
                    return RetryOutcome::ExhaustedRetriable {
                        error,
                        attempts: budget.used(),
                    };
                }
                next => tracing::debug!(state = ?next, "retry scheduled"),
            }

            let delay = scheduler.delay_for(retry_index);
            tracing::info!(
                model = candidate.model,
                endpoint = candidate.endpoint,
                delay_ms = delay.as_millis() as u64,
                "backing off before retry {}",
                retry_index + 1
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return RetryOutcome::FailedTerminal {
                        error: ClassifiedError::cancelled()
                            .at_candidate(candidate.index, candidate.model, candidate.endpoint)
                            .at_retry(retry_index),
                        attempts: budget.used(),
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::RelaySettings;
    use crate::core::error::ErrorKind;
    use crate::llm::{FailureHint, ScriptedBackend, ScriptedReply};

    const CANDIDATE: Candidate<'static> = Candidate {
        index: 0,
        model: "A",
        endpoint: "E1",
    };

    fn setup(max_attempts: u32, backend: &ScriptedBackend) -> (CallAttemptExecutor, RequestContext) {
        let settings = RelaySettings::new("A", "E1")
            .with_retry(max_attempts, Duration::ZERO)
            .with_jitter(Duration::ZERO);
        let executor = CallAttemptExecutor::new(Arc::new(backend.clone()));
        (executor, RequestContext::new("q", Arc::new(settings)))
    }

    #[test]
    fn test_state_transitions() {
        let budget = RetryBudget::new(3, Duration::ZERO);
        assert!(!RetryState::Attempting(0).is_terminal());
        assert_eq!(
            RetryState::Attempting(0).after_failure(true, &budget),
            RetryState::Attempting(1)
        );
        assert_eq!(
            RetryState::Attempting(2).after_failure(true, &budget),
            RetryState::ExhaustedRetriable
        );
        assert_eq!(
            RetryState::Attempting(0).after_failure(false, &budget),
            RetryState::FailedTerminal
        );
        assert_eq!(
            RetryState::Succeeded.after_failure(true, &budget),
            RetryState::Succeeded
        );
        assert!(RetryState::ExhaustedRetriable.is_terminal());
    }

    #[tokio::test]
    async fn test_retriable_exhausts_budget() {
        for max_attempts in 1..=4 {
            let backend = ScriptedBackend::new().with_default(ScriptedReply::transport());
            let (executor, mut ctx) = setup(max_attempts, &backend);
            let budget = ctx.retry_budget();

            let outcome = RetryCoordinator::new(&executor)
                .run(CANDIDATE, budget, &mut ctx, &CancellationToken::new())
                .await;
            assert_eq!(outcome.state(), RetryState::ExhaustedRetriable);
            assert_eq!(outcome.attempts(), max_attempts);
            assert_eq!(backend.invocations(), max_attempts as usize);
            assert_eq!(backend.releases(), max_attempts as usize);
        }
    }

    #[tokio::test]
    async fn test_non_retriable_stops_after_one_attempt() {
        let backend = ScriptedBackend::new()
            .with_default(ScriptedReply::fail(FailureHint::InputGuardrail, None, "unsafe"));
        let (executor, mut ctx) = setup(5, &backend);
        let budget = ctx.retry_budget();

        let outcome = RetryCoordinator::new(&executor)
            .run(CANDIDATE, budget, &mut ctx, &CancellationToken::new())
            .await;
        assert_eq!(outcome.state(), RetryState::FailedTerminal);
        assert_eq!(outcome.attempts(), 1);
        let (error, state) = outcome.failure().unwrap();
        assert_eq!(error.kind, ErrorKind::PolicyRejected);
        assert_eq!(state, TerminalState::FailedTerminal);
        assert_eq!(backend.invocations(), 1);
    }

    #[tokio::test]
    async fn test_success_after_retries() {
        let backend = ScriptedBackend::new();
        backend.script(
            "A",
            "E1",
            vec![
                ScriptedReply::fail(FailureHint::RateLimit, Some(429), "rate limited"),
                ScriptedReply::fail(FailureHint::ModelBehavior, None, "hallucinated tool"),
                ScriptedReply::ok("done"),
            ],
        );
        let (executor, mut ctx) = setup(3, &backend);
        let budget = ctx.retry_budget();

        let outcome = RetryCoordinator::new(&executor)
            .run(CANDIDATE, budget, &mut ctx, &CancellationToken::new())
            .await;
        match outcome {
            RetryOutcome::Succeeded { response, attempts } => {
                assert_eq!(response.payload, "done");
                assert_eq!(response.retry_index, 2);
                assert_eq!(attempts, 3);
            }
            other => panic!("Expected Succeeded, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_between_attempts() {
        let backend = ScriptedBackend::new().with_default(ScriptedReply::transport());
        let settings = RelaySettings::new("A", "E1")
            .with_retry(3, Duration::from_secs(1))
            .with_jitter(Duration::ZERO);
        let executor = CallAttemptExecutor::new(Arc::new(backend.clone()));
        let mut ctx = RequestContext::new("q", Arc::new(settings));
        let budget = ctx.retry_budget();

        let start = tokio::time::Instant::now();
        let outcome = RetryCoordinator::new(&executor)
            .run(CANDIDATE, budget, &mut ctx, &CancellationToken::new())
            .await;
        assert_eq!(outcome.state(), RetryState::ExhaustedRetriable);
        // 1s + 2s，最后一次失败后不再等待
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_prevents_next_attempt() {
        let backend = ScriptedBackend::new().with_default(ScriptedReply::transport());
        let settings = RelaySettings::new("A", "E1").with_retry(3, Duration::from_secs(60));
        let executor = CallAttemptExecutor::new(Arc::new(backend.clone()));
        let mut ctx = RequestContext::new("q", Arc::new(settings));
        let budget = ctx.retry_budget();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        let watcher = backend.clone();
        tokio::spawn(async move {
            watcher.wait_for_invocations(1).await;
            trigger.cancel();
        });

        let outcome = RetryCoordinator::new(&executor)
            .run(CANDIDATE, budget, &mut ctx, &cancel)
            .await;
        assert_eq!(outcome.state(), RetryState::FailedTerminal);
        assert_eq!(outcome.failure().unwrap().0.kind, ErrorKind::Cancelled);
        assert_eq!(backend.invocations(), 1);
        assert_eq!(backend.acquisitions(), backend.releases());
    }
}

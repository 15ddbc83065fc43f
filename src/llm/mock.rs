//! 脚本化 Mock 后端（用于测试，无需 API）
//!
//! 按 (模型, 端点) 排队预设回复；队列为空时使用默认回复（默认回显用户消息）。
//! 记录获取 / 释放 / 调用次数与调用顺序，供测试断言「尝试了几次、句柄是否泄漏」。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::llm::{
    AgentBackend, AgentHandle, ContextMap, FailureHint, Invocation, InvocationOutput, RemoteFailure,
};

/// 预设回复
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Success {
        payload: String,
        context_updates: ContextMap,
    },
    Failure(RemoteFailure),
    /// 永不返回，用于取消测试
    Hang,
}

impl ScriptedReply {
    pub fn ok(payload: impl Into<String>) -> Self {
        ScriptedReply::Success {
            payload: payload.into(),
            context_updates: ContextMap::new(),
        }
    }

    pub fn fail(hint: FailureHint, status_code: Option<u16>, message: impl Into<String>) -> Self {
        let mut failure = RemoteFailure::new(hint, message);
        failure.status_code = status_code;
        ScriptedReply::Failure(failure)
    }

    /// 503 传输错误
    pub fn transport() -> Self {
        Self::fail(FailureHint::None, Some(503), "service unavailable")
    }
}

#[derive(Default)]
struct Inner {
    scripts: Mutex<HashMap<(String, String), VecDeque<ScriptedReply>>>,
    default_reply: Mutex<Option<ScriptedReply>>,
    acquire_failures: Mutex<HashMap<String, RemoteFailure>>,
    calls: Mutex<Vec<(String, String)>>,
    acquisitions: AtomicUsize,
    releases: AtomicUsize,
    invocations: AtomicUsize,
    invoked: Notify,
}

impl Inner {
    fn next_reply(&self, model: &str, endpoint: &str) -> Option<ScriptedReply> {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        scripts
            .get_mut(&(model.to_string(), endpoint.to_string()))
            .and_then(VecDeque::pop_front)
            .or_else(|| {
                self.default_reply
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
            })
    }
}

/// 脚本化后端
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    inner: Arc<Inner>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为 (model, endpoint) 追加预设回复
    pub fn script(&self, model: &str, endpoint: &str, replies: Vec<ScriptedReply>) {
        let mut scripts = self.inner.scripts.lock().unwrap_or_else(|e| e.into_inner());
        scripts
            .entry((model.to_string(), endpoint.to_string()))
            .or_default()
            .extend(replies);
    }

    /// 队列为空时的回复
    pub fn with_default(self, reply: ScriptedReply) -> Self {
        *self.inner.default_reply.lock().unwrap_or_else(|e| e.into_inner()) = Some(reply);
        self
    }

    /// 让某个端点的 acquire 失败
    pub fn fail_acquire(self, endpoint: &str, failure: RemoteFailure) -> Self {
        self.inner
            .acquire_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(endpoint.to_string(), failure);
        self
    }

    pub fn acquisitions(&self) -> usize {
        self.inner.acquisitions.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.inner.releases.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> usize {
        self.inner.invocations.load(Ordering::SeqCst)
    }

    /// 按发生顺序返回 (model, endpoint) 调用记录
    pub fn calls(&self) -> Vec<(String, String)> {
        self.inner.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn calls_to(&self, model: &str, endpoint: &str) -> usize {
        self.calls()
            .iter()
            .filter(|(m, e)| m == model && e == endpoint)
            .count()
    }

    /// 等待调用次数达到 n
    pub async fn wait_for_invocations(&self, n: usize) {
        loop {
            let notified = self.inner.invoked.notified();
            if self.invocations() >= n {
                return;
            }
            notified.await;
        }
    }
}

struct ScriptedHandle {
    inner: Arc<Inner>,
    released: bool,
}

#[async_trait]
impl AgentHandle for ScriptedHandle {
    async fn invoke(&mut self, invocation: &Invocation<'_>) -> Result<InvocationOutput, RemoteFailure> {
        let reply = self.inner.next_reply(invocation.model, invocation.endpoint);
        self.inner
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((invocation.model.to_string(), invocation.endpoint.to_string()));
        self.inner.invocations.fetch_add(1, Ordering::SeqCst);
        self.inner.invoked.notify_waiters();

        match reply {
            Some(ScriptedReply::Success {
                payload,
                context_updates,
            }) => Ok(InvocationOutput {
                payload,
                context_updates,
            }),
            Some(ScriptedReply::Failure(failure)) => Err(failure),
            Some(ScriptedReply::Hang) => std::future::pending().await,
            None => Ok(InvocationOutput::text(format!(
                "Echo from {}: {}",
                invocation.model, invocation.payload
            ))),
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn acquire(&self, endpoint: &str) -> Result<Box<dyn AgentHandle>, RemoteFailure> {
        let failure = self
            .inner
            .acquire_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(endpoint)
            .cloned();
        if let Some(failure) = failure {
            return Err(failure);
        }
        self.inner.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedHandle {
            inner: Arc::clone(&self.inner),
            released: false,
        }))
    }
}

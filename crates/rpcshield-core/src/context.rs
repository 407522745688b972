//! Per-call correlation id, visible to everything running inside the call.
//!
//! The id lives in a tokio task-local. [`RequestContext::scope`] binds it for
//! the duration of one future (the call's handler, including any outbound
//! calls it awaits) and unbinds it when the future completes or is dropped.
//! Unrelated tasks, even on the same worker thread, never see it.
//! [`RequestContext::sync_scope`] does the same for a closure on a plain
//! thread.
//!
//! Task-locals are not inherited by `tokio::spawn`; use
//! [`RequestContext::spawn`] to carry the current id into a child task.

use std::fmt;
use std::future::Future;

use tokio::task::JoinHandle;
use tracing::Span;

use crate::metadata::{Metadata, CORRELATION_ID_KEY};

tokio::task_local! {
    static CURRENT: RequestContext;
}

/// Correlation context for one inbound call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestContext {
    correlation_id: String,
}

impl RequestContext {
    /// Context for an inbound call: keeps `inbound` verbatim if it has any
    /// non-whitespace content, otherwise generates a fresh id.
    pub fn ensure(inbound: Option<&str>) -> Self {
        let correlation_id = match inbound {
            Some(id) if !id.trim().is_empty() => id.to_string(),
            _ => new_correlation_id(),
        };
        Self { correlation_id }
    }

    /// Context from the inbound call's `x-correlation-id` metadata entry.
    pub fn from_metadata<M: Metadata + ?Sized>(metadata: &M) -> Self {
        Self::ensure(metadata.get(CORRELATION_ID_KEY))
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Context of the call currently executing, if any.
    pub fn current() -> Option<Self> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// Correlation id of the call currently executing, if any.
    pub fn current_id() -> Option<String> {
        CURRENT.try_with(|ctx| ctx.correlation_id.clone()).ok()
    }

    /// Run `fut` with this context bound.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }

    /// Run `f` with this context bound, on the current thread.
    pub fn sync_scope<F, R>(self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        CURRENT.sync_scope(self, f)
    }

    /// Attach the current correlation id to outgoing metadata.
    ///
    /// Returns `false` (and leaves `metadata` untouched) when called outside
    /// any call scope.
    pub fn inject<M: Metadata + ?Sized>(metadata: &mut M) -> bool {
        match Self::current_id() {
            Some(id) => {
                tracing::debug!(correlation_id = %id, "Adding correlation ID to outgoing call");
                metadata.set(CORRELATION_ID_KEY, id);
                true
            }
            None => false,
        }
    }

    /// Spawn `fut` on the runtime with the current context (if any) bound.
    pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match Self::current() {
            Some(ctx) => tokio::spawn(ctx.scope(fut)),
            None => tokio::spawn(fut),
        }
    }

    /// Tracing span for the call, carrying the correlation id.
    pub fn span(&self, method: &str) -> Span {
        tracing::info_span!("rpc", correlation_id = %self.correlation_id, method)
    }
}

impl fmt::Display for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.correlation_id)
    }
}

/// Correlation id for the current call: `inbound` if supplied, else a new one.
pub fn ensure_context(inbound: Option<&str>) -> String {
    RequestContext::ensure(inbound).correlation_id
}

fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

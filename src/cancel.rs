//! Session-scoped cooperative cancellation.
//!
//! Cancellation here is best-effort and non-preemptive: a task already
//! executing inside the native engine runs to completion regardless.
//! Flagging a session only prevents (a) starting new work for it and
//! (b) dispatching queued-but-not-yet-started tasks. Tokens are checked at
//! well-defined suspension points — before dispatch and before starting a
//! queued or batched item — never inside the opaque native call.
//!
//! ## Usage
//!
//! ```no_run
//! use exponent_orchestrator::{CancellationRegistry, SessionId};
//! # #[tokio::main]
//! # async fn main() {
//! let registry = CancellationRegistry::new(std::time::Duration::from_secs(300));
//! let token = registry.register(&SessionId::new("user-42"));
//! // ... pass the token into compute_single / compute_batch ...
//! let flagged = registry.cancel_all(&SessionId::new("user-42"));
//! # let _ = flagged;
//! # }
//! ```

use crate::SessionId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

struct TokenInner {
    session: SessionId,
    cancelled: AtomicBool,
    live_tasks: AtomicUsize,
    last_activity: Mutex<Instant>,
}

/// Cooperative cancellation flag shared by reference with every task
/// spawned under a client operation. One token may gate many tasks
/// (a whole batch).
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    /// Detached token, not tracked by any registry. Useful for callers that
    /// do not need session-level cancellation (and for tests).
    pub fn detached(session: &SessionId) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                session: session.clone(),
                cancelled: AtomicBool::new(false),
                live_tasks: AtomicUsize::new(0),
                last_activity: Mutex::new(Instant::now()),
            }),
        }
    }

    /// Session this token belongs to.
    pub fn session(&self) -> &SessionId {
        &self.inner.session
    }

    /// Whether the owning session has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Flag the token. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// Number of tasks currently referencing this token.
    pub fn live_tasks(&self) -> usize {
        self.inner.live_tasks.load(Ordering::Acquire)
    }

    /// Register one task against this token. The returned guard decrements
    /// the live count when dropped, on every exit path.
    pub fn task_guard(&self) -> TaskGuard {
        self.inner.live_tasks.fetch_add(1, Ordering::AcqRel);
        self.touch();
        TaskGuard {
            token: self.clone(),
        }
    }

    fn touch(&self) {
        if let Ok(mut at) = self.inner.last_activity.lock() {
            *at = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.inner
            .last_activity
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }
}

/// RAII registration of one task against a [`CancellationToken`].
pub struct TaskGuard {
    token: CancellationToken,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.token.inner.live_tasks.fetch_sub(1, Ordering::AcqRel);
        self.token.touch();
    }
}

/// Per-session set of live cancellation tokens.
///
/// `register` hands out one token per incoming client operation;
/// `cancel_all` flags every live token for the session. A background reaper
/// removes tokens once every task referencing them has terminated and the
/// token has been idle past the configured window.
pub struct CancellationRegistry {
    sessions: Arc<DashMap<String, Vec<CancellationToken>>>,
    idle_ttl: Duration,
}

impl CancellationRegistry {
    /// Create a registry and spawn its cleanup task.
    ///
    /// `idle_ttl` — how long a token with no live tasks lingers before the
    /// reaper removes it.
    pub fn new(idle_ttl: Duration) -> Self {
        let registry = Self {
            sessions: Arc::new(DashMap::new()),
            idle_ttl,
        };

        let sessions = Arc::clone(&registry.sessions);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                reap_idle(&sessions, idle_ttl);
            }
        });

        registry
    }

    /// Create a fresh token for one client operation under `session`.
    pub fn register(&self, session: &SessionId) -> CancellationToken {
        let token = CancellationToken::detached(session);
        self.sessions
            .entry(session.as_str().to_string())
            .or_default()
            .push(token.clone());
        debug!(session_id = session.as_str(), "cancellation token registered");
        token
    }

    /// Flag every live token for `session`. Returns the number of tasks
    /// that were live at the moment of cancellation (tasks already running
    /// inside the engine still finish; only not-yet-started work is
    /// prevented).
    pub fn cancel_all(&self, session: &SessionId) -> usize {
        let mut flagged_tasks = 0;
        if let Some(tokens) = self.sessions.get(session.as_str()) {
            for token in tokens.iter() {
                if !token.is_cancelled() {
                    token.cancel();
                    flagged_tasks += token.live_tasks();
                }
            }
        }
        info!(
            session_id = session.as_str(),
            live_tasks = flagged_tasks,
            "session cancelled"
        );
        flagged_tasks
    }

    /// Number of sessions currently tracked.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is tracked.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn reap_idle(sessions: &DashMap<String, Vec<CancellationToken>>, idle_ttl: Duration) {
    let mut removed = 0usize;
    sessions.retain(|_, tokens| {
        tokens.retain(|t| {
            let keep = t.live_tasks() > 0 || t.idle_for() < idle_ttl;
            if !keep {
                removed += 1;
            }
            keep
        });
        !tokens.is_empty()
    });
    if removed > 0 {
        debug!(removed = removed, "reaped idle cancellation tokens");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_cancel_all_flags_tokens() {
        let registry = CancellationRegistry::new(Duration::from_secs(300));
        let session = SessionId::new("s1");
        let a = registry.register(&session);
        let b = registry.register(&session);
        assert!(!a.is_cancelled());
        assert!(!b.is_cancelled());

        registry.cancel_all(&session);
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_all_reports_live_task_count() {
        let registry = CancellationRegistry::new(Duration::from_secs(300));
        let session = SessionId::new("s2");
        let token = registry.register(&session);

        let _g1 = token.task_guard();
        let _g2 = token.task_guard();
        let _g3 = token.task_guard();

        assert_eq!(registry.cancel_all(&session), 3);
    }

    #[tokio::test]
    async fn test_cancel_all_other_session_untouched() {
        let registry = CancellationRegistry::new(Duration::from_secs(300));
        let victim = registry.register(&SessionId::new("victim"));
        let bystander = registry.register(&SessionId::new("bystander"));

        registry.cancel_all(&SessionId::new("victim"));
        assert!(victim.is_cancelled());
        assert!(!bystander.is_cancelled());
    }

    #[tokio::test]
    async fn test_task_guard_decrements_on_drop() {
        let token = CancellationToken::detached(&SessionId::new("s3"));
        {
            let _guard = token.task_guard();
            assert_eq!(token.live_tasks(), 1);
        }
        assert_eq!(token.live_tasks(), 0);
    }

    #[tokio::test]
    async fn test_reap_removes_idle_tokens_only() {
        let sessions: DashMap<String, Vec<CancellationToken>> = DashMap::new();
        let idle = CancellationToken::detached(&SessionId::new("idle"));
        let busy = CancellationToken::detached(&SessionId::new("busy"));
        let _guard = busy.task_guard();
        sessions.insert("idle".to_string(), vec![idle]);
        sessions.insert("busy".to_string(), vec![busy.clone()]);

        reap_idle(&sessions, Duration::ZERO);
        assert!(!sessions.contains_key("idle"));
        assert!(sessions.contains_key("busy"));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let token = CancellationToken::detached(&SessionId::new("s4"));
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }
}

//! Request/response correlation for forwarded tool calls
//!
//! Each forwarded invocation gets a [`CorrelationId`] and a `oneshot`
//! channel. Whoever removes the entry from the pending map owns the right to
//! resolve it, which makes resolution exactly-once whether the call ends in a
//! response, a timeout, or a disconnect.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::ConnectionId;
use crate::protocol::{CorrelationId, ToolResult};

/// How a pending call ended
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// The owning application answered
    Completed(ToolResult),
    /// No answer within the call timeout
    TimedOut { after: Duration },
    /// The owning connection went away (or could not be written to)
    Disconnected { reason: String },
}

impl CallOutcome {
    /// Flatten into the data-level result carried back to the agent
    pub fn into_tool_result(self) -> ToolResult {
        match self {
            CallOutcome::Completed(result) => result,
            CallOutcome::TimedOut { .. } => ToolResult::failure("timeout"),
            CallOutcome::Disconnected { .. } => ToolResult::failure("application disconnected"),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CallOutcome::Completed(ToolResult::Success { .. }) => "success",
            CallOutcome::Completed(ToolResult::Failure { .. }) => "error",
            CallOutcome::TimedOut { .. } => "timeout",
            CallOutcome::Disconnected { .. } => "disconnected",
        }
    }
}

/// What happened to an inbound `toolResponse`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStatus {
    Resolved,
    /// Unknown, already resolved, or timed out
    NotPending,
    /// The id belongs to a call forwarded to a different connection
    WrongOwner,
}

impl fmt::Display for ResolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveStatus::Resolved => write!(f, "resolved"),
            ResolveStatus::NotPending => write!(f, "not pending"),
            ResolveStatus::WrongOwner => write!(f, "wrong owner"),
        }
    }
}

struct PendingEntry {
    owner: ConnectionId,
    tool: String,
    created_at: Instant,
    tx: oneshot::Sender<CallOutcome>,
}

/// Waitable half of a call registered with [`Correlator::begin_call`]
#[derive(Debug)]
pub struct PendingCall {
    id: CorrelationId,
    owner: ConnectionId,
    deadline: Instant,
    rx: oneshot::Receiver<CallOutcome>,
}

impl PendingCall {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn owner(&self) -> ConnectionId {
        self.owner
    }
}

/// Tracks in-flight invocations
pub struct Correlator {
    next_id: AtomicU64,
    timeout: Duration,
    pending: Mutex<HashMap<CorrelationId, PendingEntry>>,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Never held across an await point
    fn pending(&self) -> MutexGuard<'_, HashMap<CorrelationId, PendingEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a call about to be forwarded to `owner`
    pub fn begin_call(&self, owner: ConnectionId, tool: impl Into<String>) -> PendingCall {
        let id = CorrelationId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let created_at = Instant::now();
        let (tx, rx) = oneshot::channel();

        self.pending().insert(
            id,
            PendingEntry {
                owner,
                tool: tool.into(),
                created_at,
                tx,
            },
        );

        PendingCall {
            id,
            owner,
            deadline: created_at + self.timeout,
            rx,
        }
    }

    /// Deliver an application's response
    ///
    /// Only the connection the call was forwarded to may resolve it. Late and
    /// duplicate responses are logged and otherwise ignored.
    pub fn resolve(
        &self,
        from: ConnectionId,
        id: CorrelationId,
        result: ToolResult,
    ) -> ResolveStatus {
        let entry = {
            let mut pending = self.pending();
            match pending.get(&id).map(|entry| entry.owner) {
                None => None,
                Some(owner) if owner != from => {
                    warn!(
                        "{} answered call {} which was forwarded to {}; ignoring",
                        from, id, owner
                    );
                    return ResolveStatus::WrongOwner;
                }
                Some(_) => pending.remove(&id),
            }
        };

        match entry {
            Some(entry) => {
                deliver(id, entry, CallOutcome::Completed(result));
                ResolveStatus::Resolved
            }
            None => {
                debug!("Response for call {} from {} is not pending; dropped", id, from);
                ResolveStatus::NotPending
            }
        }
    }

    /// Resolve one call with a failure outcome; false if it was not pending
    pub fn fail(&self, id: CorrelationId, outcome: CallOutcome) -> bool {
        let entry = self.pending().remove(&id);
        match entry {
            Some(entry) => {
                deliver(id, entry, outcome);
                true
            }
            None => false,
        }
    }

    /// Fail every call forwarded to a connection that went away
    pub fn fail_all_for(&self, owner: ConnectionId, reason: &str) -> usize {
        let entries: Vec<(CorrelationId, PendingEntry)> = {
            let mut pending = self.pending();
            let ids: Vec<CorrelationId> = pending
                .iter()
                .filter(|(_, entry)| entry.owner == owner)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = entries.len();
        for (id, entry) in entries {
            deliver(
                id,
                entry,
                CallOutcome::Disconnected {
                    reason: reason.to_string(),
                },
            );
        }
        if count > 0 {
            debug!("Failed {} pending calls for {}: {}", count, owner, reason);
        }
        count
    }

    /// Time out every call older than the configured timeout
    ///
    /// Covers calls whose waiter has gone away; waiters time themselves out
    /// in [`Correlator::wait`].
    pub fn expire_overdue(&self) -> usize {
        let now = Instant::now();
        let entries: Vec<(CorrelationId, PendingEntry)> = {
            let mut pending = self.pending();
            let ids: Vec<CorrelationId> = pending
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.created_at) >= self.timeout)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = entries.len();
        for (id, entry) in entries {
            deliver(id, entry, CallOutcome::TimedOut { after: self.timeout });
        }
        count
    }

    /// Await the outcome of a call, bounded by the call timeout
    pub async fn wait(&self, call: PendingCall) -> CallOutcome {
        let PendingCall {
            id, deadline, mut rx, ..
        } = call;

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => CallOutcome::Disconnected {
                reason: "call abandoned".to_string(),
            },
            Err(_) => {
                // Whoever wins the removal sends; either way rx now has a value
                self.fail(id, CallOutcome::TimedOut { after: self.timeout });
                rx.await.unwrap_or(CallOutcome::TimedOut {
                    after: self.timeout,
                })
            }
        }
    }

    /// Number of calls still awaiting resolution
    pub fn in_flight(&self) -> usize {
        self.pending().len()
    }
}

fn deliver(id: CorrelationId, entry: PendingEntry, outcome: CallOutcome) {
    debug!(
        "Call {} ('{}' on {}) resolved: {} after {:?}",
        id,
        entry.tool,
        entry.owner,
        outcome.label(),
        entry.created_at.elapsed()
    );
    if entry.tx.send(outcome).is_err() {
        debug!("Waiter for call {} is gone", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_resolve_delivers_result() {
        let correlator = Correlator::new(Duration::from_secs(30));
        let owner = ConnectionId::next();
        let call = correlator.begin_call(owner, "Ping");
        let id = call.id();

        assert_eq!(
            correlator.resolve(owner, id, ToolResult::success(json!("pong"))),
            ResolveStatus::Resolved
        );

        let outcome = correlator.wait(call).await;
        assert_eq!(outcome, CallOutcome::Completed(ToolResult::success(json!("pong"))));
        assert_eq!(correlator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let correlator = Correlator::new(Duration::from_secs(30));
        let owner = ConnectionId::next();
        let first = correlator.begin_call(owner, "a");
        let second = correlator.begin_call(owner, "b");
        assert!(second.id() > first.id());
        assert_eq!(correlator.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_response_is_noop() {
        let correlator = Correlator::new(Duration::from_secs(30));
        let owner = ConnectionId::next();
        let call = correlator.begin_call(owner, "Ping");
        let id = call.id();

        correlator.resolve(owner, id, ToolResult::success(json!(1)));
        assert_eq!(
            correlator.resolve(owner, id, ToolResult::success(json!(2))),
            ResolveStatus::NotPending
        );
        assert_eq!(
            correlator.resolve(owner, CorrelationId(9999), ToolResult::success(None)),
            ResolveStatus::NotPending
        );

        assert_eq!(
            correlator.wait(call).await,
            CallOutcome::Completed(ToolResult::success(json!(1)))
        );
    }

    #[tokio::test]
    async fn test_response_from_other_connection_is_ignored() {
        let correlator = Correlator::new(Duration::from_secs(30));
        let owner = ConnectionId::next();
        let stranger = ConnectionId::next();
        let call = correlator.begin_call(owner, "Ping");

        assert_eq!(
            correlator.resolve(stranger, call.id(), ToolResult::success(None)),
            ResolveStatus::WrongOwner
        );
        assert_eq!(correlator.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let correlator = Correlator::new(Duration::from_millis(500));
        let owner = ConnectionId::next();
        let call = correlator.begin_call(owner, "Slow");
        let id = call.id();

        let outcome = correlator.wait(call).await;
        assert_eq!(
            outcome,
            CallOutcome::TimedOut {
                after: Duration::from_millis(500)
            }
        );
        assert_eq!(
            outcome.into_tool_result(),
            ToolResult::failure("timeout")
        );

        // a late answer after the timeout changes nothing
        assert_eq!(
            correlator.resolve(owner, id, ToolResult::success(None)),
            ResolveStatus::NotPending
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_overdue_resolves_abandoned_calls() {
        let correlator = Correlator::new(Duration::from_secs(1));
        let owner = ConnectionId::next();
        let _abandoned = correlator.begin_call(owner, "Slow");

        tokio::time::advance(Duration::from_millis(500)).await;
        let _fresh = correlator.begin_call(owner, "Fast");
        assert_eq!(correlator.expire_overdue(), 0);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(correlator.expire_overdue(), 1);
        assert_eq!(correlator.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_fail_all_for_only_touches_owner() {
        let correlator = Correlator::new(Duration::from_secs(30));
        let gone = ConnectionId::next();
        let alive = ConnectionId::next();
        let call_a = correlator.begin_call(gone, "a");
        let call_b = correlator.begin_call(gone, "b");
        let call_c = correlator.begin_call(alive, "c");
        let id_c = call_c.id();

        assert_eq!(correlator.fail_all_for(gone, "application disconnected"), 2);

        for call in [call_a, call_b] {
            let outcome = correlator.wait(call).await;
            assert_eq!(outcome.label(), "disconnected");
            assert_eq!(
                outcome.into_tool_result(),
                ToolResult::failure("application disconnected")
            );
        }

        assert_eq!(correlator.in_flight(), 1);
        correlator.resolve(alive, id_c, ToolResult::failure("boom"));
        assert_eq!(
            correlator.wait(call_c).await,
            CallOutcome::Completed(ToolResult::failure("boom"))
        );
    }

    #[tokio::test]
    async fn test_racing_resolutions_deliver_once() {
        let correlator = Arc::new(Correlator::new(Duration::from_secs(30)));
        let owner = ConnectionId::next();
        let call = correlator.begin_call(owner, "Race");
        let id = call.id();

        let mut handles = Vec::new();
        for i in 0..8 {
            let correlator = Arc::clone(&correlator);
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    correlator.resolve(owner, id, ToolResult::success(json!(i))) == ResolveStatus::Resolved
                } else {
                    correlator.fail_all_for(owner, "gone") == 1
                }
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        let _ = correlator.wait(call).await;
        assert_eq!(correlator.in_flight(), 0);
    }
}

//! Request/response correlation over the event stream.
//!
//! A correlated [`Operation`] is sent with a fresh [`RequestId`] and parked
//! in the pending table until exactly one of these happens:
//!
//! - its success event arrives (resolve with the payload),
//! - its error event arrives (reject with the authority message verbatim),
//! - an `session.action_ack` arrives for an acknowledged action,
//! - its budget elapses (timeout, or optimistic success for actions
//!   whose grace period ran out without an ack).
//!
//! Every settlement path removes the pending entry under the table lock,
//! and only the path that removed it may deliver an outcome.
//!
//! Inbound events reach the correlator through
//! [`InboundObserver`] rather than the dispatcher, so clearing dispatcher
//! subscriptions never orphans an in-flight request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use quizsync_core::errors::{ClientError, Result};
use quizsync_core::ids::RequestId;
use quizsync_core::protocol::{Command, OutboundFrame, SessionEvent, events};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::connection::{ConnectionManager, InboundObserver};

/// How an operation treats `session.action_ack`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AckMode {
    /// Acks are not expected.
    Ignored,
    /// Wait the full budget for an ack or error.
    Strict,
    /// Resolve with `null` after the grace period if nothing arrived.
    Optimistic(Duration),
}

/// Description of one correlated command.
#[derive(Clone, Debug)]
pub struct Operation {
    name: &'static str,
    command: Command,
    success: Option<&'static str>,
    error: Option<&'static str>,
    identity: Vec<(&'static str, String)>,
    timeout: Duration,
    ack: AckMode,
}

impl Operation {
    /// An operation named `name` (used in timeout errors and logs) that
    /// sends `command` and waits at most `timeout`.
    ///
    /// The command's session id, when it has one, becomes an identity key.
    pub fn new(name: &'static str, command: Command, timeout: Duration) -> Self {
        let identity = command
            .session_id()
            .map(|sid| vec![("sessionId", sid.to_owned())])
            .unwrap_or_default();
        Self {
            name,
            command,
            success: None,
            error: None,
            identity,
            timeout,
            ack: AckMode::Ignored,
        }
    }

    /// Resolve when `event` arrives.
    #[must_use]
    pub fn succeeds_on(mut self, event: &'static str) -> Self {
        self.success = Some(event);
        self
    }

    /// Reject when `event` arrives.
    #[must_use]
    pub fn fails_on(mut self, event: &'static str) -> Self {
        self.error = Some(event);
        self
    }

    /// Require uncorrelated events to carry `value` under `key` (or omit it).
    #[must_use]
    pub fn identity(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.identity.push((key, value.into()));
        self
    }

    /// Settle on `session.action_ack`. With a non-zero `grace` the
    /// operation resolves optimistically once the grace period passes
    /// without an ack or error; zero waits the full budget.
    #[must_use]
    pub fn acknowledged(mut self, grace: Duration) -> Self {
        self.ack = if grace.is_zero() {
            AckMode::Strict
        } else {
            AckMode::Optimistic(grace)
        };
        self
    }

    /// Operation name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[derive(Debug)]
enum Settlement {
    Resolved(Value),
    Rejected(String),
}

struct Pending {
    operation: &'static str,
    success: Option<&'static str>,
    error: Option<&'static str>,
    identity: Vec<(&'static str, String)>,
    accepts_ack: bool,
    tx: oneshot::Sender<Settlement>,
}

impl Pending {
    fn settlement_for(&self, event: &SessionEvent) -> Option<Settlement> {
        if self.error.is_some_and(|e| event.is(e)) {
            let message = event.message().unwrap_or("unknown error").to_owned();
            return Some(Settlement::Rejected(message));
        }
        if self.accepts_ack && event.is(events::ACTION_ACK) {
            let ok = event.data.get("ok").and_then(Value::as_bool).unwrap_or(true);
            return Some(if ok {
                Settlement::Resolved(event.data.clone())
            } else {
                Settlement::Rejected(event.message().unwrap_or("action refused").to_owned())
            });
        }
        if self.success.is_some_and(|s| event.is(s)) {
            return Some(Settlement::Resolved(event.data.clone()));
        }
        None
    }

    fn identity_matches(&self, event: &SessionEvent) -> bool {
        self.identity
            .iter()
            .all(|(key, want)| event.identity(key).is_none_or(|got| got == want))
    }
}

type PendingTable = Mutex<HashMap<RequestId, Pending>>;

/// Removes the pending entry when the caller stops waiting.
struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let _ = self.table.lock().remove(&self.id);
    }
}

/// Pending-request table bound to one connection.
pub struct RequestCorrelator {
    connection: ConnectionManager,
    pending: PendingTable,
}

impl RequestCorrelator {
    /// Create a correlator and register it as an observer of `connection`.
    pub fn attach(connection: ConnectionManager) -> Arc<Self> {
        let correlator = Arc::new(Self {
            connection: connection.clone(),
            pending: Mutex::new(HashMap::new()),
        });
        let observer: Arc<dyn InboundObserver> = correlator.clone();
        connection.add_observer(Arc::downgrade(&observer));
        correlator
    }

    /// Number of operations awaiting settlement.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send `op` and wait for its single outcome.
    ///
    /// Fails without sending when the connection is not established: with
    /// [`ClientError::ReconnectExhausted`] once automatic reconnection gave
    /// up, [`ClientError::NotConnected`] otherwise.
    pub async fn perform(&self, op: Operation) -> Result<Value> {
        self.connection.ensure_connected()?;

        let id = RequestId::new();
        let (tx, mut rx) = oneshot::channel();
        let _ = self.pending.lock().insert(
            id.clone(),
            Pending {
                operation: op.name,
                success: op.success,
                error: op.error,
                identity: op.identity,
                accepts_ack: op.ack != AckMode::Ignored,
                tx,
            },
        );
        let _guard = PendingGuard {
            table: &self.pending,
            id: id.clone(),
        };

        self.connection
            .send_frame(&OutboundFrame::correlated(id.clone(), op.command))?;
        debug!(operation = op.name, request_id = %id, "sent");

        let wait = match op.ack {
            AckMode::Optimistic(grace) => grace.min(op.timeout),
            AckMode::Ignored | AckMode::Strict => op.timeout,
        };
        let settlement = match tokio::time::timeout(wait, &mut rx).await {
            Ok(Ok(settlement)) => settlement,
            Ok(Err(_)) => return Err(ClientError::Connection("request abandoned".into())),
            Err(_) => {
                if self.pending.lock().remove(&id).is_some() {
                    if let AckMode::Optimistic(_) = op.ack {
                        debug!(operation = op.name, request_id = %id, "no ack within grace; assuming success");
                        return Ok(Value::Null);
                    }
                    warn!(operation = op.name, request_id = %id, after = ?wait, "timed out");
                    return Err(ClientError::Timeout {
                        operation: op.name.to_owned(),
                        after: wait,
                    });
                }
                // settled while the timer fired
                match rx.try_recv() {
                    Ok(settlement) => settlement,
                    Err(_) => {
                        return Err(ClientError::Timeout {
                            operation: op.name.to_owned(),
                            after: wait,
                        });
                    }
                }
            }
        };

        match settlement {
            Settlement::Resolved(data) => {
                debug!(operation = op.name, request_id = %id, "resolved");
                Ok(data)
            }
            Settlement::Rejected(message) => {
                debug!(operation = op.name, request_id = %id, message, "rejected");
                Err(ClientError::Rejected {
                    operation: op.name.to_owned(),
                    message,
                })
            }
        }
    }
}

impl InboundObserver for RequestCorrelator {
    fn observe(&self, event: &SessionEvent) {
        let settled: Vec<(Pending, Settlement)> = {
            let mut table = self.pending.lock();
            match event.reply_to.as_ref() {
                // a reply settles its own request or, if that one is gone, nothing
                Some(id) => {
                    let settlement = table.get(id).and_then(|p| p.settlement_for(event));
                    settlement
                        .and_then(|s| table.remove(id).map(|p| (p, s)))
                        .into_iter()
                        .collect()
                }
                None => {
                    let matched: Vec<(RequestId, Settlement)> = table
                        .iter()
                        .filter(|(_, p)| p.identity_matches(event))
                        .filter_map(|(id, p)| p.settlement_for(event).map(|s| (id.clone(), s)))
                        .collect();
                    matched
                        .into_iter()
                        .filter_map(|(id, s)| table.remove(&id).map(|p| (p, s)))
                        .collect()
                }
            }
        };

        for (pending, settlement) in settled {
            debug!(operation = pending.operation, event = %event.event_type, "settling");
            let _ = pending.tx.send(settlement);
        }
    }
}

impl std::fmt::Debug for RequestCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCorrelator")
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::EventDispatcher;
    use crate::testing::{MemoryConnector, MemoryPeer};
    use assert_matches::assert_matches;
    use quizsync_core::model::ConnectionState;
    use quizsync_core::protocol::SessionAction;
    use quizsync_settings::ClientSettings;
    use serde_json::json;
    use tokio::time::Instant;

    async fn connected() -> (ConnectionManager, Arc<RequestCorrelator>, MemoryPeer) {
        let connector = MemoryConnector::new();
        let mgr = ConnectionManager::new(
            &ClientSettings::default(),
            Arc::new(connector.clone()),
            Arc::new(EventDispatcher::new()),
        );
        let correlator = RequestCorrelator::attach(mgr.clone());
        mgr.connect(Some("tok".into())).await.unwrap();
        let peer = connector.next_peer().await.unwrap();
        (mgr, correlator, peer)
    }

    fn join_op() -> Operation {
        Operation::new(
            "join",
            Command::Join {
                session_id: "sess-1".into(),
                user_id: "u-42".into(),
            },
            Duration::from_secs(10),
        )
        .succeeds_on(events::JOINED)
        .fails_on(events::ERROR)
    }

    fn pause_op(grace: Duration) -> Operation {
        Operation::new(
            "pause",
            Command::Action {
                session_id: "sess-1".into(),
                action: SessionAction::Pause,
                payload: None,
            },
            Duration::from_secs(10),
        )
        .fails_on(events::ERROR)
        .identity("action", SessionAction::Pause.as_str())
        .acknowledged(grace)
    }

    fn spawn(
        correlator: &Arc<RequestCorrelator>,
        op: Operation,
    ) -> tokio::task::JoinHandle<Result<Value>> {
        let c = Arc::clone(correlator);
        tokio::spawn(async move { c.perform(op).await })
    }

    #[tokio::test(start_paused = true)]
    async fn not_connected_fails_without_sending() {
        let connector = MemoryConnector::new();
        let mgr = ConnectionManager::new(
            &ClientSettings::default(),
            Arc::new(connector.clone()),
            Arc::new(EventDispatcher::new()),
        );
        let correlator = RequestCorrelator::attach(mgr);
        assert_eq!(correlator.perform(join_op()).await, Err(ClientError::NotConnected));
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_connection_fails_with_terminal_error() {
        let connector = MemoryConnector::new();
        connector.refuse_all(ClientError::Connection("down".into()));
        let mut settings = ClientSettings::default();
        settings.reconnect.max_attempts = 1;
        let mgr = ConnectionManager::new(
            &settings,
            Arc::new(connector.clone()),
            Arc::new(EventDispatcher::new()),
        );
        let correlator = RequestCorrelator::attach(mgr.clone());
        let _ = mgr.connect(Some("tok".into())).await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(
            correlator.perform(join_op()).await,
            Err(ClientError::ReconnectExhausted { attempts: 1 })
        );
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_on_reply_to() {
        let (_mgr, correlator, mut peer) = connected().await;
        let task = spawn(&correlator, join_op());

        let frame = peer.recv_command().await.unwrap();
        assert_eq!(frame.command.name(), "session.join");
        let id = frame.id.unwrap();
        peer.push(&SessionEvent::new(events::JOINED, json!({"role": "player"})).replying_to(id));

        assert_eq!(task.await.unwrap(), Ok(json!({"role": "player"})));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_on_uncorrelated_event_with_matching_session() {
        let (_mgr, correlator, mut peer) = connected().await;
        let task = spawn(&correlator, join_op());
        let _ = peer.recv_command().await.unwrap();

        peer.push(&SessionEvent::new(events::JOINED, json!({"sessionId": "sess-1"})));
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn other_session_does_not_settle() {
        let (_mgr, correlator, mut peer) = connected().await;
        let task = spawn(&correlator, join_op());
        let _ = peer.recv_command().await.unwrap();

        peer.push(&SessionEvent::new(events::JOINED, Value::Null).with_session("sess-2"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(correlator.pending_count(), 1);

        peer.push(&SessionEvent::new(events::JOINED, Value::Null).with_session("sess-1"));
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn error_event_rejects_with_authority_message() {
        let (_mgr, correlator, mut peer) = connected().await;
        let task = spawn(&correlator, join_op());
        let frame = peer.recv_command().await.unwrap();

        peer.push(
            &SessionEvent::new(events::ERROR, json!({"message": "Game session not found"}))
                .replying_to(frame.id.unwrap()),
        );
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Game session not found");
        assert_matches!(err, ClientError::Rejected { operation, .. } if operation == "join");
    }

    #[tokio::test(start_paused = true)]
    async fn unrelated_reply_is_ignored() {
        let (_mgr, correlator, mut peer) = connected().await;
        let task = spawn(&correlator, join_op());
        let frame = peer.recv_command().await.unwrap();
        let id = frame.id.unwrap();

        peer.push(&SessionEvent::new(events::WARNING, Value::Null).replying_to(id.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(correlator.pending_count(), 1);

        peer.push(&SessionEvent::new(events::JOINED, Value::Null).replying_to(id));
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn reply_to_finished_request_settles_nothing() {
        let (_mgr, correlator, mut peer) = connected().await;
        let answer = Operation::new(
            "answer",
            Command::Answer {
                session_id: "sess-1".into(),
                question_id: "q-3".into(),
                answer: "B".into(),
                elapsed_ms: 4200,
                extra: None,
            },
            Duration::from_secs(10),
        )
        .succeeds_on(events::ANSWER_RECORDED)
        .fails_on(events::ERROR);
        let task = spawn(&correlator, answer);
        let answer_id = peer.recv_command().await.unwrap().id.unwrap();
        assert_matches!(task.await.unwrap(), Err(ClientError::Timeout { .. }));

        let pause = spawn(&correlator, pause_op(Duration::ZERO));
        let pause_id = peer.recv_command().await.unwrap().id.unwrap();
        peer.push(
            &SessionEvent::new(events::ERROR, json!({"message": "Question not found"}))
                .with_session("sess-1")
                .replying_to(answer_id),
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(correlator.pending_count(), 1);

        peer.push(
            &SessionEvent::new(events::ACTION_ACK, json!({"action": "pause", "ok": true}))
                .replying_to(pause_id),
        );
        assert!(pause.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn unregistered_pong_does_not_settle_ping() {
        let (_mgr, correlator, mut peer) = connected().await;
        let ping = Operation::new("ping", Command::Ping {}, Duration::from_secs(5))
            .succeeds_on(events::PONG);
        let task = spawn(&correlator, ping);
        let id = peer.recv_frame().await.unwrap().id.unwrap();

        peer.push(&SessionEvent::new(events::PONG, json!({})).replying_to(RequestId::new()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(correlator.pending_count(), 1);

        peer.push(&SessionEvent::new(events::PONG, json!({})).replying_to(id));
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_connection_survives() {
        let (mgr, correlator, mut peer) = connected().await;
        let started = Instant::now();
        let op = Operation::new(
            "answer",
            Command::Answer {
                session_id: "sess-1".into(),
                question_id: "q-3".into(),
                answer: "B".into(),
                elapsed_ms: 4200,
                extra: None,
            },
            Duration::from_secs(10),
        )
        .succeeds_on(events::ANSWER_RECORDED)
        .fails_on(events::ERROR);
        let task = spawn(&correlator, op);
        let _ = peer.recv_command().await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_matches!(err, ClientError::Timeout { ref operation, .. } if operation == "answer");
        assert_eq!(mgr.state(), ConnectionState::Connected);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn settles_exactly_once() {
        let (_mgr, correlator, mut peer) = connected().await;
        let task = spawn(&correlator, join_op());
        let id = peer.recv_command().await.unwrap().id.unwrap();

        peer.push(&SessionEvent::new(events::JOINED, json!(1)).replying_to(id.clone()));
        peer.push(&SessionEvent::new(events::ERROR, json!({"message": "late"})).replying_to(id));
        assert_eq!(task.await.unwrap(), Ok(json!(1)));
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn uncorrelated_error_rejects_every_matching_request() {
        let (_mgr, correlator, mut peer) = connected().await;
        let a = spawn(&correlator, join_op());
        let b = spawn(&correlator, join_op());
        let _ = peer.recv_command().await.unwrap();
        let _ = peer.recv_command().await.unwrap();

        peer.push(&SessionEvent::new(events::ERROR, json!({"message": "Session full"})));
        assert_matches!(a.await.unwrap(), Err(ClientError::Rejected { .. }));
        assert_matches!(b.await.unwrap(), Err(ClientError::Rejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn action_resolves_optimistically_after_grace() {
        let (_mgr, correlator, mut peer) = connected().await;
        let started = Instant::now();
        let task = spawn(&correlator, pause_op(Duration::from_secs(1)));
        let frame = peer.recv_command().await.unwrap();
        assert_eq!(frame.command.name(), "session.action");

        assert_eq!(task.await.unwrap(), Ok(Value::Null));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn action_error_before_grace_rejects() {
        let (_mgr, correlator, mut peer) = connected().await;
        let task = spawn(&correlator, pause_op(Duration::from_secs(1)));
        let _ = peer.recv_command().await.unwrap();

        peer.push(&SessionEvent::new(events::ERROR, json!({"message": "Only the host can pause"})));
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Only the host can pause");
    }

    #[tokio::test(start_paused = true)]
    async fn negative_ack_rejects() {
        let (_mgr, correlator, mut peer) = connected().await;
        let task = spawn(&correlator, pause_op(Duration::from_secs(1)));
        let id = peer.recv_command().await.unwrap().id.unwrap();

        peer.push(
            &SessionEvent::new(
                events::ACTION_ACK,
                json!({"action": "pause", "ok": false, "message": "already paused"}),
            )
            .replying_to(id),
        );
        assert_matches!(
            task.await.unwrap(),
            Err(ClientError::Rejected { message, .. }) if message == "already paused"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ack_for_other_action_is_ignored() {
        let (_mgr, correlator, mut peer) = connected().await;
        let task = spawn(&correlator, pause_op(Duration::ZERO));
        let _ = peer.recv_command().await.unwrap();

        peer.push(&SessionEvent::new(events::ACTION_ACK, json!({"action": "resume", "ok": true})));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(correlator.pending_count(), 1);

        peer.push(&SessionEvent::new(events::ACTION_ACK, json!({"action": "pause", "ok": true})));
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn strict_ack_times_out() {
        let (_mgr, correlator, mut peer) = connected().await;
        let task = spawn(&correlator, pause_op(Duration::ZERO));
        let _ = peer.recv_command().await.unwrap();
        assert_matches!(task.await.unwrap(), Err(ClientError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_caller_clears_pending_entry() {
        let (_mgr, correlator, mut peer) = connected().await;
        let task = spawn(&correlator, join_op());
        let _ = peer.recv_command().await.unwrap();
        assert_eq!(correlator.pending_count(), 1);

        task.abort();
        let _ = task.await;
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_survive_subscriber_clear() {
        let (mgr, correlator, mut peer) = connected().await;
        let task = spawn(&correlator, join_op());
        let id = peer.recv_command().await.unwrap().id.unwrap();

        mgr.dispatcher().clear();
        peer.push(&SessionEvent::new(events::JOINED, Value::Null).replying_to(id));
        assert!(task.await.unwrap().is_ok());
    }
}

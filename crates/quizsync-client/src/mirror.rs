//! Local mirror of one session's broadcast state.
//!
//! [`SessionMirror`] subscribes to the dispatcher and folds every event of
//! its session into a [`SessionSnapshot`] published through a
//! `tokio::sync::watch` channel. The authority remains the source of truth;
//! a `session.state_sync` replaces whatever was folded so far.
//!
//! The mirror's subscription is removed by [`ConnectionManager::disconnect`]
//! along with every other subscription; attach a new mirror after
//! reconnecting from a client-initiated disconnect.
//!
//! [`ConnectionManager::disconnect`]: crate::connection::ConnectionManager::disconnect

use std::sync::Arc;

use quizsync_core::ids::SubscriptionId;
use quizsync_core::model::{Question, SessionSnapshot, SessionStatus};
use quizsync_core::protocol::{SessionEvent, events};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::dispatcher::{ANY, EventDispatcher};

/// Dispatcher-driven [`SessionSnapshot`] for one session.
pub struct SessionMirror {
    dispatcher: Arc<EventDispatcher>,
    subscription: SubscriptionId,
    state: Arc<watch::Sender<SessionSnapshot>>,
}

impl SessionMirror {
    /// Start mirroring `session_id`. `local_user` is the participant this
    /// client joined as, marked connected on `session.joined` and
    /// `session.reconnected`.
    pub fn attach(
        dispatcher: Arc<EventDispatcher>,
        session_id: impl Into<String>,
        local_user: Option<String>,
    ) -> Self {
        let (tx, _) = watch::channel(SessionSnapshot::new(session_id));
        let state = Arc::new(tx);
        let sink = Arc::clone(&state);
        let subscription = dispatcher.on(ANY, move |event| {
            let _ = sink.send_if_modified(|snap| fold(snap, local_user.as_deref(), event));
        });
        Self {
            dispatcher,
            subscription,
            state,
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Receiver notified on every change.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    /// Stop mirroring. Equivalent to dropping the mirror.
    pub fn detach(self) {}
}

impl Drop for SessionMirror {
    fn drop(&mut self) {
        let _ = self.dispatcher.off(ANY, self.subscription);
    }
}

impl std::fmt::Debug for SessionMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMirror")
            .field("session_id", &self.state.borrow().session_id)
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

fn set_status(snap: &mut SessionSnapshot, status: SessionStatus) -> bool {
    if snap.status == status {
        return false;
    }
    snap.status = status;
    true
}

fn i64_field(data: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| data.get(*k).and_then(Value::as_i64))
}

/// Apply one event to `snap`. Returns whether anything changed.
///
/// Events tagged with another session are ignored; untagged events are
/// assumed to belong to the mirrored session.
pub fn fold(snap: &mut SessionSnapshot, local_user: Option<&str>, event: &SessionEvent) -> bool {
    if event.session().is_some_and(|sid| sid != snap.session_id) {
        return false;
    }
    let data = &event.data;
    let user_id = event.data_str("userId");

    match event.event_type.as_str() {
        events::STATE_SYNC => {
            let body = data.get("session").unwrap_or(data);
            match serde_json::from_value::<SessionSnapshot>(body.clone()) {
                Ok(mut next) => {
                    if next.session_id.is_empty() {
                        next.session_id.clone_from(&snap.session_id);
                    }
                    debug!(session_id = %next.session_id, "state sync");
                    *snap = next;
                    true
                }
                Err(err) => {
                    warn!(error = %err, "unreadable state sync");
                    false
                }
            }
        }
        events::JOINED | events::RECONNECTED => {
            let Some(uid) = user_id.or(local_user) else {
                return false;
            };
            let existed = snap.participant(uid).is_some();
            let p = snap.participant_mut(uid);
            let changed = !existed || !p.connected;
            p.connected = true;
            changed
        }
        events::PARTICIPANT_UPDATED => {
            let Some(uid) = user_id else { return false };
            let before = snap.participant(uid).cloned();
            let p = snap.participant_mut(uid);
            if let Some(name) = data.get("displayName").and_then(Value::as_str) {
                p.display_name = Some(name.to_owned());
            }
            if let Some(score) = i64_field(data, &["score"]) {
                p.score = score;
            }
            p.connected = data.get("connected").and_then(Value::as_bool).unwrap_or(true);
            before.as_ref() != Some(&*p)
        }
        events::PARTICIPANT_LEFT => {
            let Some(uid) = user_id else { return false };
            let before = snap.participants.len();
            snap.participants.retain(|p| p.user_id != uid);
            snap.participants.len() != before
        }
        events::PARTICIPANT_DISCONNECTED => {
            let Some(uid) = user_id else { return false };
            let last_seen = event
                .data_str("lastSeen")
                .map(str::to_owned)
                .or_else(|| event.timestamp.clone());
            let p = snap.participant_mut(uid);
            p.connected = false;
            p.last_seen = last_seen;
            true
        }
        events::PARTICIPANT_ANSWERED => {
            let (Some(uid), Some(score)) = (user_id, i64_field(data, &["totalScore", "score"]))
            else {
                return false;
            };
            let p = snap.participant_mut(uid);
            let changed = p.score != score;
            p.score = score;
            changed
        }
        events::STARTED | events::RESUMED => set_status(snap, SessionStatus::Active),
        events::PAUSED => set_status(snap, SessionStatus::Paused),
        events::ENDED => {
            let status = if event.data_str("status") == Some("cancelled") {
                SessionStatus::Cancelled
            } else {
                SessionStatus::Finished
            };
            set_status(snap, status)
        }
        events::QUESTION => {
            let mut changed = false;
            if let Some(n) = data.get("questionNumber").and_then(Value::as_u64) {
                let index = usize::try_from(n.saturating_sub(1)).ok();
                changed |= snap.current_question_index != index;
                snap.current_question_index = index;
            }
            let question = data
                .get("question")
                .and_then(|q| serde_json::from_value::<Question>(q.clone()).ok());
            if let Some(question) = question {
                if !snap.questions.iter().any(|q| q.id == question.id) {
                    snap.questions.push(question);
                    changed = true;
                }
            }
            changed
        }
        events::LEADERBOARD => {
            let rows = data
                .get("leaderboard")
                .or_else(|| data.get("participants"))
                .and_then(Value::as_array);
            let mut changed = false;
            for row in rows.into_iter().flatten() {
                let (Some(uid), Some(score)) = (
                    row.get("userId").and_then(Value::as_str),
                    i64_field(row, &["score", "totalScore"]),
                ) else {
                    continue;
                };
                let p = snap.participant_mut(uid);
                changed |= p.score != score;
                p.score = score;
            }
            changed
        }
        _ => false,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ev(name: &str, data: Value) -> SessionEvent {
        SessionEvent::new(name, data).with_session("sess-1")
    }

    fn snapshot() -> SessionSnapshot {
        SessionSnapshot::new("sess-1")
    }

    #[test]
    fn other_session_is_ignored() {
        let mut snap = snapshot();
        let event = SessionEvent::new(events::STARTED, Value::Null).with_session("sess-2");
        assert!(!fold(&mut snap, None, &event));
        assert_eq!(snap.status, SessionStatus::Waiting);
    }

    #[test]
    fn lifecycle_status_transitions() {
        let mut snap = snapshot();
        assert!(fold(&mut snap, None, &ev(events::STARTED, Value::Null)));
        assert_eq!(snap.status, SessionStatus::Active);
        assert!(!fold(&mut snap, None, &ev(events::STARTED, Value::Null)));
        assert!(fold(&mut snap, None, &ev(events::PAUSED, Value::Null)));
        assert_eq!(snap.status, SessionStatus::Paused);
        assert!(fold(&mut snap, None, &ev(events::RESUMED, Value::Null)));
        assert_eq!(snap.status, SessionStatus::Active);
        assert!(fold(&mut snap, None, &ev(events::ENDED, json!({}))));
        assert_eq!(snap.status, SessionStatus::Finished);
    }

    #[test]
    fn cancelled_end() {
        let mut snap = snapshot();
        let _ = fold(&mut snap, None, &ev(events::ENDED, json!({"status": "cancelled"})));
        assert_eq!(snap.status, SessionStatus::Cancelled);
    }

    #[test]
    fn roster_updates() {
        let mut snap = snapshot();
        let _ = fold(
            &mut snap,
            None,
            &ev(events::PARTICIPANT_UPDATED, json!({"userId": "u-1", "displayName": "Ada", "score": 10})),
        );
        let _ = fold(&mut snap, None, &ev(events::PARTICIPANT_UPDATED, json!({"userId": "u-2"})));
        assert_eq!(snap.participants.len(), 2);
        assert_eq!(snap.participant("u-1").unwrap().display_name.as_deref(), Some("Ada"));

        let _ = fold(
            &mut snap,
            None,
            &ev(events::PARTICIPANT_DISCONNECTED, json!({"userId": "u-2", "lastSeen": "2026-01-01T00:00:00Z"})),
        );
        let u2 = snap.participant("u-2").unwrap();
        assert!(!u2.connected);
        assert_eq!(u2.last_seen.as_deref(), Some("2026-01-01T00:00:00Z"));
        assert_eq!(snap.connected_count(), 1);

        assert!(fold(&mut snap, None, &ev(events::PARTICIPANT_LEFT, json!({"userId": "u-1"}))));
        assert!(snap.participant("u-1").is_none());
        assert!(!fold(&mut snap, None, &ev(events::PARTICIPANT_LEFT, json!({"userId": "u-1"}))));
    }

    #[test]
    fn reconnected_marks_local_user() {
        let mut snap = snapshot();
        snap.participants.push(quizsync_core::model::Participant {
            connected: false,
            ..quizsync_core::model::Participant::new("me")
        });
        assert!(fold(&mut snap, Some("me"), &ev(events::RECONNECTED, json!({}))));
        assert!(snap.participant("me").unwrap().connected);
    }

    #[test]
    fn question_sets_index_and_appends_once() {
        let mut snap = snapshot();
        let q = json!({"questionNumber": 2, "question": {"id": "q-2", "text": "2+2?"}});
        assert!(fold(&mut snap, None, &ev(events::QUESTION, q.clone())));
        assert!(!fold(&mut snap, None, &ev(events::QUESTION, q)));
        assert_eq!(snap.current_question_index, Some(1));
        assert_eq!(snap.questions.len(), 1);
        assert_eq!(snap.questions[0].body["text"], "2+2?");
    }

    #[test]
    fn leaderboard_and_answers_update_scores() {
        let mut snap = snapshot();
        let board = json!({"leaderboard": [{"userId": "a", "score": 30}, {"userId": "b", "score": 20}]});
        assert!(fold(&mut snap, None, &ev(events::LEADERBOARD, board)));
        assert_eq!(snap.participant("a").unwrap().score, 30);

        let answered = json!({"userId": "b", "totalScore": 45});
        assert!(fold(&mut snap, None, &ev(events::PARTICIPANT_ANSWERED, answered)));
        assert_eq!(snap.participant("b").unwrap().score, 45);
    }

    #[test]
    fn state_sync_replaces() {
        let mut snap = snapshot();
        let _ = fold(&mut snap, None, &ev(events::PARTICIPANT_UPDATED, json!({"userId": "stale"})));
        let sync = json!({
            "status": "paused",
            "currentQuestionIndex": 3,
            "participants": [{"userId": "u-9", "score": 7}]
        });
        assert!(fold(&mut snap, None, &ev(events::STATE_SYNC, sync)));
        assert_eq!(snap.session_id, "sess-1");
        assert_eq!(snap.status, SessionStatus::Paused);
        assert_eq!(snap.current_question_index, Some(3));
        assert!(snap.participant("stale").is_none());
        assert!(snap.participant("u-9").unwrap().connected);
    }

    #[test]
    fn mirror_follows_dispatcher_and_detaches() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let mirror = SessionMirror::attach(Arc::clone(&dispatcher), "sess-1", Some("me".into()));
        let rx = mirror.watch();

        let _ = dispatcher.emit(&ev(events::STARTED, Value::Null));
        assert_eq!(mirror.snapshot().status, SessionStatus::Active);
        assert!(rx.has_changed().unwrap());

        mirror.detach();
        assert_eq!(dispatcher.subscriber_count(), 0);
    }
}

//! Session ingestion actors.
//!
//! Each configured session gets at most one actor task. The actor drives
//! a [`SourceListener`] (the platform integration), resolves every raw
//! event to its owning pair via the current config snapshot, and forwards
//! routed events to the engine. A listener that reports an invalid
//! credential marks the session invalid and is not restarted.

use crate::config::{ConfigStore, SessionConfig, SessionStatus};
use crate::error::{RelayError, RelayResult};
use crate::events::{RawMessage, RawSourceEvent, RoutedMessage, SourceEvent};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Platform-facing source of channel events. Implementations stream raw
/// events until the receiver closes or the connection fails.
#[async_trait]
pub trait SourceListener: Send + Sync + 'static {
    async fn listen(
        &self,
        session: &SessionConfig,
        events: mpsc::Sender<RawSourceEvent>,
    ) -> RelayResult<()>;
}

struct SessionActor {
    task: JoinHandle<()>,
}

/// Tracks one actor per session id and their connectivity status.
pub struct SessionRegistry {
    config: Arc<ConfigStore>,
    engine_tx: mpsc::Sender<SourceEvent>,
    actors: DashMap<String, SessionActor>,
    statuses: DashMap<String, SessionStatus>,
}

impl SessionRegistry {
    pub fn new(config: Arc<ConfigStore>, engine_tx: mpsc::Sender<SourceEvent>) -> Self {
        Self {
            config,
            engine_tx,
            actors: DashMap::new(),
            statuses: DashMap::new(),
        }
    }

    /// Spawn the actor for `session_id`. A session already running keeps
    /// its existing actor; a session previously marked invalid is not
    /// restarted until [`SessionRegistry::reset`] clears it.
    pub fn spawn(
        self: &Arc<Self>,
        session_id: &str,
        listener: Arc<dyn SourceListener>,
    ) -> RelayResult<()> {
        let session = self
            .config
            .current()
            .sessions
            .iter()
            .find(|s| s.id == session_id)
            .cloned()
            .ok_or_else(|| {
                RelayError::ConfigValidation(format!("unknown session {session_id:?}"))
            })?;

        if self.status(session_id) == SessionStatus::Invalid {
            return Err(RelayError::CredentialInvalid {
                session: session_id.to_string(),
            });
        }

        let registry = Arc::clone(self);
        let start = move || {
            tokio::spawn(async move {
                registry.run_actor(session, listener).await;
            })
        };

        // The entry guard makes check-and-spawn atomic: two concurrent
        // spawns for one session can never both start an actor.
        let id = session_id.to_string();
        match self.actors.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if !occupied.get().task.is_finished() {
                    tracing::debug!(session = session_id, "actor already running");
                    return Ok(());
                }
                occupied.insert(SessionActor { task: start() });
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(SessionActor { task: start() });
            }
        }
        self.statuses.insert(id, SessionStatus::Active);
        Ok(())
    }

    /// Stop the actor for a session, if one is running.
    pub fn stop(&self, session_id: &str) {
        if let Some((_, actor)) = self.actors.remove(session_id) {
            actor.task.abort();
            tracing::info!(session = session_id, "session actor stopped");
        }
        self.statuses
            .insert(session_id.to_string(), SessionStatus::Inactive);
    }

    /// Clear an invalid marker so the session may be spawned again after
    /// its credential was replaced.
    pub fn reset(&self, session_id: &str) {
        self.statuses
            .insert(session_id.to_string(), SessionStatus::Inactive);
    }

    pub fn status(&self, session_id: &str) -> SessionStatus {
        self.statuses
            .get(session_id)
            .map(|s| *s.value())
            .unwrap_or(SessionStatus::Inactive)
    }

    async fn run_actor(&self, session: SessionConfig, listener: Arc<dyn SourceListener>) {
        let (raw_tx, mut raw_rx) = mpsc::channel::<RawSourceEvent>(64);
        let session_id = session.id.clone();
        let owner = session.owner.clone();
        tracing::info!(session = %session_id, owner = %owner, "session actor started");

        let listen_session = session.clone();
        let listen =
            tokio::spawn(async move { listener.listen(&listen_session, raw_tx).await });

        while let Some(raw) = raw_rx.recv().await {
            let snapshot = self.config.current();
            for event in route_event(&snapshot, &owner, &session_id, raw) {
                if self.engine_tx.send(event).await.is_err() {
                    tracing::warn!(session = %session_id, "engine channel closed, actor exiting");
                    listen.abort();
                    return;
                }
            }
        }

        match listen.await {
            Ok(Ok(())) => {
                tracing::info!(session = %session_id, "listener finished");
                self.statuses
                    .insert(session_id.clone(), SessionStatus::Inactive);
            }
            Ok(Err(RelayError::CredentialInvalid { .. })) => {
                tracing::error!(session = %session_id, "credential invalid, session disabled");
                self.statuses
                    .insert(session_id.clone(), SessionStatus::Invalid);
            }
            Ok(Err(e)) => {
                tracing::error!(session = %session_id, error = %e, "listener failed");
                self.statuses
                    .insert(session_id.clone(), SessionStatus::Inactive);
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                tracing::error!(session = %session_id, error = %e, "listener task panicked");
                self.statuses
                    .insert(session_id.clone(), SessionStatus::Inactive);
            }
        }
    }
}

/// Resolve a raw event to routed engine events. Events on channels no
/// configured pair listens to are dropped.
fn route_event(
    snapshot: &crate::config::ConfigSnapshot,
    owner: &str,
    session_id: &str,
    raw: RawSourceEvent,
) -> Vec<SourceEvent> {
    match raw {
        RawSourceEvent::Created(msg) => route_message(snapshot, owner, session_id, msg)
            .map(SourceEvent::Created)
            .into_iter()
            .collect(),
        RawSourceEvent::Edited(msg) => route_message(snapshot, owner, session_id, msg)
            .map(SourceEvent::Edited)
            .into_iter()
            .collect(),
        RawSourceEvent::Deleted {
            channel,
            message_ids,
        } => {
            let Some(pair) = snapshot.pair_for_source(owner, &channel) else {
                tracing::debug!(owner, channel = %channel, "deletion on unrouted channel");
                return Vec::new();
            };
            message_ids
                .into_iter()
                .map(|message_id| SourceEvent::Deleted {
                    pair_id: pair.id.clone(),
                    session_id: session_id.to_string(),
                    message_id,
                })
                .collect()
        }
    }
}

fn route_message(
    snapshot: &crate::config::ConfigSnapshot,
    owner: &str,
    session_id: &str,
    msg: RawMessage,
) -> Option<RoutedMessage> {
    let Some(pair) = snapshot.pair_for_source(owner, &msg.channel) else {
        tracing::debug!(owner, channel = %msg.channel, "message on unrouted channel");
        return None;
    };
    Some(RoutedMessage {
        pair_id: pair.id.clone(),
        session_id: session_id.to_string(),
        message_id: msg.message_id,
        text: msg.text,
        image: msg.image,
    })
}

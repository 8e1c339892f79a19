//! Session Supervisor - the session registry
//!
//! One session actor per key, created on first request and linked to this
//! supervisor. Sessions are removed on explicit close or when their actor
//! dies; `CloseAll` disconnects everything on host shutdown.

use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use std::collections::HashMap;
use tracing::{error, info};

use shared_types::SessionInfo;

use crate::actors::session::{
    ConnectRequest, RemoteSession, RemoteSessionActor, SessionArguments, SessionMsg,
};
use crate::remote::RemoteError;

#[derive(Debug, Default)]
pub struct SessionSupervisor;

pub struct SessionSupervisorState {
    pub sessions: HashMap<String, ActorRef<SessionMsg>>,
}

#[derive(Debug)]
pub enum SessionSupervisorMsg {
    GetOrCreateSession {
        key: String,
        reply: RpcReplyPort<Result<ActorRef<SessionMsg>, String>>,
    },
    GetSession {
        key: String,
        reply: RpcReplyPort<Option<ActorRef<SessionMsg>>>,
    },
    ListSessions {
        reply: RpcReplyPort<Vec<SessionInfo>>,
    },
    CloseSession {
        key: String,
        reply: RpcReplyPort<bool>,
    },
    CloseAll {
        reply: RpcReplyPort<usize>,
    },
}

#[ractor::async_trait]
impl Actor for SessionSupervisor {
    type Msg = SessionSupervisorMsg;
    type State = SessionSupervisorState;
    type Arguments = ();

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        _args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        info!(supervisor = %myself.get_id(), "SessionSupervisor starting");
        Ok(SessionSupervisorState {
            sessions: HashMap::new(),
        })
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        event: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let SupervisionEvent::ActorTerminated(actor_cell, _, _)
        | SupervisionEvent::ActorFailed(actor_cell, _) = &event
        {
            let actor_id = actor_cell.get_id();
            state
                .sessions
                .retain(|_, session| session.get_id() != actor_id);
        }
        info!(
            supervisor = %myself.get_id(),
            event = ?event,
            "SessionSupervisor supervision event"
        );
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SessionSupervisorMsg::GetOrCreateSession { key, reply } => {
                if let Some(session) = state.sessions.get(&key) {
                    let _ = reply.send(Ok(session.clone()));
                    return Ok(());
                }

                let args = SessionArguments { key: key.clone() };
                match Actor::spawn_linked(None, RemoteSessionActor, args, myself.get_cell()).await {
                    Ok((actor_ref, _)) => {
                        info!(session = %key, "Session created");
                        state.sessions.insert(key, actor_ref.clone());
                        let _ = reply.send(Ok(actor_ref));
                    }
                    Err(e) => {
                        error!(session = %key, error = %e, "Failed to spawn RemoteSessionActor");
                        let _ = reply.send(Err(e.to_string()));
                    }
                }
            }
            SessionSupervisorMsg::GetSession { key, reply } => {
                let _ = reply.send(state.sessions.get(&key).cloned());
            }
            SessionSupervisorMsg::ListSessions { reply } => {
                let mut infos = Vec::new();
                for session in state.sessions.values() {
                    if let Ok(info) = ractor::call!(session, |port| SessionMsg::GetInfo { reply: port }) {
                        infos.push(info);
                    }
                }
                infos.sort_by(|a, b| a.key.cmp(&b.key));
                let _ = reply.send(infos);
            }
            SessionSupervisorMsg::CloseSession { key, reply } => {
                let closed = match state.sessions.remove(&key) {
                    Some(session) => {
                        close_session(&key, &session).await;
                        true
                    }
                    None => false,
                };
                let _ = reply.send(closed);
            }
            SessionSupervisorMsg::CloseAll { reply } => {
                let sessions: Vec<_> = state.sessions.drain().collect();
                let count = sessions.len();
                for (key, session) in sessions {
                    close_session(&key, &session).await;
                }
                if count > 0 {
                    info!(count, "Closed all sessions");
                }
                let _ = reply.send(count);
            }
        }
        Ok(())
    }
}

async fn close_session(key: &str, session: &ActorRef<SessionMsg>) {
    let _ = ractor::call!(session, |reply| SessionMsg::Disconnect { reply });
    session.stop(Some("session closed".to_string()));
    info!(session = %key, "Session closed");
}

// ============================================================================
// Registry client
// ============================================================================

/// Host-facing handle to the session registry.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    supervisor: ActorRef<SessionSupervisorMsg>,
}

impl SessionRegistry {
    pub async fn spawn() -> Result<Self, RemoteError> {
        let (supervisor, _) = Actor::spawn(None, SessionSupervisor, ())
            .await
            .map_err(|e| RemoteError::Spawn(e.to_string()))?;
        Ok(Self { supervisor })
    }

    pub fn supervisor(&self) -> &ActorRef<SessionSupervisorMsg> {
        &self.supervisor
    }

    /// The session for `key`, created (disconnected) on first request.
    pub async fn session(&self, key: impl Into<String>) -> Result<RemoteSession, RemoteError> {
        let key = key.into();
        let actor = ractor::call!(self.supervisor, |reply| {
            SessionSupervisorMsg::GetOrCreateSession {
                key: key.clone(),
                reply,
            }
        })
        .map_err(|e| RemoteError::Spawn(e.to_string()))?
        .map_err(RemoteError::Spawn)?;
        Ok(RemoteSession::new(key, actor))
    }

    /// Existing session for `key`, if any.
    pub async fn get(&self, key: impl Into<String>) -> Option<RemoteSession> {
        let key = key.into();
        let actor = ractor::call!(self.supervisor, |reply| SessionSupervisorMsg::GetSession {
            key: key.clone(),
            reply,
        })
        .ok()
        .flatten()?;
        Some(RemoteSession::new(key, actor))
    }

    /// Connect (or reconnect) the session for `key`.
    pub async fn connect(
        &self,
        key: impl Into<String>,
        request: ConnectRequest,
    ) -> Result<RemoteSession, RemoteError> {
        let session = self.session(key).await?;
        session.connect(request).await?;
        Ok(session)
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        ractor::call!(self.supervisor, |reply| SessionSupervisorMsg::ListSessions { reply })
            .unwrap_or_default()
    }

    /// Disconnect and forget `key`. Returns whether it existed.
    pub async fn close(&self, key: impl Into<String>) -> bool {
        let key = key.into();
        ractor::call!(self.supervisor, |reply| SessionSupervisorMsg::CloseSession { key, reply })
            .unwrap_or(false)
    }

    /// Disconnect every session; used on host shutdown.
    pub async fn close_all(&self) -> usize {
        ractor::call!(self.supervisor, |reply| SessionSupervisorMsg::CloseAll { reply })
            .unwrap_or(0)
    }
}

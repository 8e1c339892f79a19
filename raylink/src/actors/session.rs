//! RemoteSessionActor - owns the connectivity state of one named session
//!
//! The actor serializes connect/disconnect so a reconnect always closes the
//! previous link before opening a new one. Everything that runs *on* a link
//! (commands, file transfer) happens outside the actor: callers acquire the
//! current `Arc<SessionLink>` and work against it directly, so concurrent
//! workers never queue behind each other in the mailbox.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use shared_types::{ConnectionState, SessionInfo};

use crate::remote::command::{self, CommandHandle, CommandRequest};
use crate::remote::{RemoteError, SessionLink, SessionPaths, Transport};

#[derive(Debug, Default)]
pub struct RemoteSessionActor;

#[derive(Debug, Clone)]
pub struct SessionArguments {
    pub key: String,
}

/// Everything needed to open a link.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub transport: Transport,
    pub paths: SessionPaths,
    pub command_prefix: String,
    pub timeout: Duration,
    pub cancel_grace: Duration,
}

impl ConnectRequest {
    pub fn new(transport: Transport, paths: SessionPaths) -> Self {
        Self {
            transport,
            paths,
            command_prefix: String::new(),
            timeout: Duration::from_secs(10),
            cancel_grace: Duration::from_secs(2),
        }
    }
}

pub struct SessionState {
    key: String,
    link: Option<Arc<SessionLink>>,
    connection: ConnectionState,
    target: Option<String>,
    connected_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl SessionState {
    fn info(&self) -> SessionInfo {
        let link = self.link.as_ref().filter(|link| link.is_connected());
        SessionInfo {
            key: self.key.clone(),
            state: if link.is_some() {
                self.connection
            } else if self.connection == ConnectionState::Connecting {
                ConnectionState::Connecting
            } else {
                ConnectionState::Disconnected
            },
            target: self.target.clone(),
            remote_home: link.map(|l| l.paths().remote_home()),
            local_home: link.map(|l| l.paths().local_home()),
            upload_home: link.map(|l| l.paths().upload_home()),
            outstanding_commands: link.map(|l| l.outstanding_commands()).unwrap_or(0),
            connected_at: self.connected_at,
            last_error: self.last_error.clone(),
        }
    }

    async fn close_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.shutdown().await;
        }
        self.connection = ConnectionState::Disconnected;
        self.connected_at = None;
    }
}

#[derive(Debug)]
pub enum SessionMsg {
    Connect {
        request: ConnectRequest,
        reply: RpcReplyPort<Result<SessionInfo, RemoteError>>,
    },
    Disconnect {
        reply: RpcReplyPort<()>,
    },
    GetInfo {
        reply: RpcReplyPort<SessionInfo>,
    },
    Acquire {
        reply: RpcReplyPort<Result<Arc<SessionLink>, RemoteError>>,
    },
}

#[ractor::async_trait]
impl Actor for RemoteSessionActor {
    type Msg = SessionMsg;
    type State = SessionState;
    type Arguments = SessionArguments;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::debug!(session = %args.key, "RemoteSessionActor starting");
        Ok(SessionState {
            key: args.key,
            link: None,
            connection: ConnectionState::Disconnected,
            target: None,
            connected_at: None,
            last_error: None,
        })
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.close_link().await;
        tracing::debug!(session = %state.key, "RemoteSessionActor stopped");
        Ok(())
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SessionMsg::Connect { request, reply } => {
                let result = connect(state, request).await;
                let _ = reply.send(result);
            }
            SessionMsg::Disconnect { reply } => {
                if state.link.is_some() {
                    tracing::info!(session = %state.key, "Disconnecting session");
                }
                state.close_link().await;
                let _ = reply.send(());
            }
            SessionMsg::GetInfo { reply } => {
                let _ = reply.send(state.info());
            }
            SessionMsg::Acquire { reply } => {
                let link = state
                    .link
                    .as_ref()
                    .filter(|link| link.is_connected())
                    .cloned()
                    .ok_or(RemoteError::NotConnected);
                let _ = reply.send(link);
            }
        }
        Ok(())
    }
}

async fn connect(state: &mut SessionState, request: ConnectRequest) -> Result<SessionInfo, RemoteError> {
    // A live link is always closed before its replacement is opened.
    if state.link.is_some() {
        tracing::info!(session = %state.key, "Replacing existing connection");
        state.close_link().await;
    }

    let target = request.transport.describe();
    state.connection = ConnectionState::Connecting;
    state.target = Some(target.clone());

    if let Err(e) = request.transport.open(request.timeout).await {
        tracing::warn!(session = %state.key, target = %target, error = %e, "Connection failed");
        state.connection = ConnectionState::Disconnected;
        state.last_error = Some(e.to_string());
        return Err(e);
    }

    let link = Arc::new(SessionLink::new(
        state.key.clone(),
        request.transport,
        request.paths,
        request.command_prefix,
        request.cancel_grace,
    ));

    let remote_home = link.paths().remote_home();
    if let Err(e) = link.ensure_directory(&remote_home).await {
        tracing::warn!(session = %state.key, path = %remote_home, error = %e, "Could not create remote home");
    }

    state.connected_at = Some(link.connected_at());
    state.link = Some(link);
    state.connection = ConnectionState::Connected;
    state.last_error = None;
    tracing::info!(session = %state.key, target = %target, "Connected");
    Ok(state.info())
}

// ============================================================================
// Client
// ============================================================================

/// Cheap, cloneable client for a session actor.
#[derive(Debug, Clone)]
pub struct RemoteSession {
    key: String,
    actor: ActorRef<SessionMsg>,
}

impl RemoteSession {
    pub fn new(key: impl Into<String>, actor: ActorRef<SessionMsg>) -> Self {
        Self {
            key: key.into(),
            actor,
        }
    }

    /// Spawn an unsupervised session actor.
    pub async fn spawn(key: impl Into<String>) -> Result<Self, RemoteError> {
        let key = key.into();
        let (actor, _) = Actor::spawn(
            None,
            RemoteSessionActor,
            SessionArguments { key: key.clone() },
        )
        .await
        .map_err(|e| RemoteError::Spawn(e.to_string()))?;
        Ok(Self::new(key, actor))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn actor(&self) -> &ActorRef<SessionMsg> {
        &self.actor
    }

    pub async fn connect(&self, request: ConnectRequest) -> Result<SessionInfo, RemoteError> {
        ractor::call!(self.actor, |reply| SessionMsg::Connect { request, reply })
            .map_err(|e| RemoteError::Spawn(format!("session actor unavailable: {e}")))?
    }

    /// Idempotent; safe on a never-connected or stopped session.
    pub async fn disconnect(&self) {
        let _ = ractor::call!(self.actor, |reply| SessionMsg::Disconnect { reply });
    }

    pub async fn info(&self) -> SessionInfo {
        ractor::call!(self.actor, |reply| SessionMsg::GetInfo { reply }).unwrap_or_else(|_| {
            SessionInfo {
                key: self.key.clone(),
                state: ConnectionState::Disconnected,
                target: None,
                remote_home: None,
                local_home: None,
                upload_home: None,
                outstanding_commands: 0,
                connected_at: None,
                last_error: Some("session closed".to_string()),
            }
        })
    }

    pub async fn is_connected(&self) -> bool {
        self.info().await.state == ConnectionState::Connected
    }

    /// The current live link, or `NotConnected`.
    pub async fn link(&self) -> Result<Arc<SessionLink>, RemoteError> {
        ractor::call!(self.actor, |reply| SessionMsg::Acquire { reply })
            .map_err(|_| RemoteError::NotConnected)?
    }

    pub async fn start_command(&self, request: CommandRequest) -> Result<CommandHandle, RemoteError> {
        let link = self.link().await?;
        command::start(&link, request).await
    }

    pub async fn ensure_directory(&self, path: &str) -> Result<String, RemoteError> {
        self.link().await?.ensure_directory(path).await
    }

    pub async fn upload(&self, local: &Path, remote_dir: &str) -> Result<String, RemoteError> {
        self.link().await?.upload(local, remote_dir).await
    }

    pub async fn read_file(&self, remote_path: &str) -> Result<String, RemoteError> {
        self.link().await?.read_file(remote_path).await
    }
}

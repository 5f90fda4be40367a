use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::{
    error::ProtocolError,
    protocol::{Command, Event, SERVER_NAME},
    relay::Relay,
};

pub type SessionId = u64;

/// Sending side of a session's bounded outbound queue.
///
/// Fan-out uses [`Outbox::deliver`], which never waits: when the queue is full
/// the event is dropped for this session only, so a stalled reader cannot hold
/// up the rest of its room.
#[derive(Debug, Clone)]
pub struct Outbox {
    id: SessionId,
    tx: mpsc::Sender<Event>,
}

impl Outbox {
    pub fn channel(id: SessionId, capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn deliver(&self, event: Event) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(session = self.id, %event, "outbound queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session = self.id, "outbound queue closed");
                false
            }
        }
    }

    pub async fn send(&self, event: Event) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct Peer {
    username: String,
    outbox: Outbox,
}

impl Peer {
    pub fn new(username: impl Into<String>, outbox: Outbox) -> Self {
        Self {
            username: username.into(),
            outbox,
        }
    }

    pub fn id(&self) -> SessionId {
        self.outbox.id()
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Authenticated { username: String },
    InRoom { username: String, room: String },
}

impl SessionState {
    pub fn username(&self) -> Option<&str> {
        match self {
            SessionState::Connected => None,
            SessionState::Authenticated { username } | SessionState::InRoom { username, .. } => {
                Some(username.as_str())
            }
        }
    }

    pub fn room(&self) -> Option<&str> {
        match self {
            SessionState::InRoom { room, .. } => Some(room.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

pub struct Session {
    outbox: Outbox,
    relay: Relay,
    state: SessionState,
}

impl Session {
    pub fn new(outbox: Outbox, relay: Relay) -> Self {
        Self {
            outbox,
            relay,
            state: SessionState::Connected,
        }
    }

    pub fn id(&self) -> SessionId {
        self.outbox.id()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Parses and applies one client line. Protocol errors are reported to
    /// this session only and never close the connection.
    pub async fn handle_line(&mut self, line: &str) -> Flow {
        let outcome = match Command::parse(line) {
            Ok(command) => self.apply(command).await,
            Err(err) => Err(err),
        };

        match outcome {
            Ok(flow) => flow,
            Err(err) => {
                debug!(session = self.id(), %err, "command rejected");
                self.reply(err.into()).await;
                Flow::Continue
            }
        }
    }

    pub async fn apply(&mut self, command: Command) -> Result<Flow, ProtocolError> {
        match command {
            Command::Login { name } => self.login(name).await?,
            Command::Join { room } => self.join(room).await?,
            Command::Leave => self.leave().await?,
            Command::Msg { text } => self.send(&text).await?,
            Command::Pm { target, text } => self.private_send(&target, &text).await?,
            Command::Logout => {
                self.reply(Event::info("Bye")).await;
                self.disconnect().await;
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    async fn login(&mut self, name: String) -> Result<(), ProtocolError> {
        if self.state != SessionState::Connected {
            return Err(ProtocolError::AlreadyLoggedIn);
        }
        if name.is_empty() {
            return Err(ProtocolError::EmptyName);
        }
        if name.contains([':', ',']) {
            return Err(ProtocolError::InvalidName);
        }
        if name == SERVER_NAME {
            return Err(ProtocolError::ReservedName);
        }

        let peer = Peer::new(name.clone(), self.outbox.clone());
        if !self.relay.directory().register(peer).await {
            return Err(ProtocolError::NameTaken);
        }

        info!(session = self.id(), username = %name, "logged in");
        self.reply(Event::info(format!("Logged in as {name}"))).await;
        self.state = SessionState::Authenticated { username: name };
        Ok(())
    }

    async fn join(&mut self, room: String) -> Result<(), ProtocolError> {
        let username = self
            .state
            .username()
            .ok_or(ProtocolError::NotLoggedIn)?
            .to_string();
        if room.is_empty() {
            return Err(ProtocolError::EmptyRoom);
        }
        if room.contains(':') {
            return Err(ProtocolError::InvalidRoom);
        }
        if self.state.room() == Some(room.as_str()) {
            self.reply(Event::info(format!("Joined {room}"))).await;
            return Ok(());
        }

        let peer = Peer::new(username.clone(), self.outbox.clone());
        let previous = self.relay.directory().join(&room, peer).await;
        if let Some(previous) = previous {
            self.announce_departure(&previous, &username).await;
        }

        info!(session = self.id(), %username, %room, "joined room");
        self.reply(Event::info(format!("Joined {room}"))).await;
        self.relay
            .announce(&room, &format!("{username} joined the room."))
            .await;
        self.relay.publish_member_list(&room).await;
        self.state = SessionState::InRoom { username, room };
        Ok(())
    }

    async fn leave(&mut self) -> Result<(), ProtocolError> {
        let SessionState::InRoom { username, room } = &self.state else {
            return Err(ProtocolError::NotInRoom);
        };
        let (username, room) = (username.clone(), room.clone());

        self.relay.directory().leave(&room, self.id()).await;
        self.announce_departure(&room, &username).await;
        self.reply(Event::info(format!("Left {room}"))).await;
        self.state = SessionState::Authenticated { username };
        Ok(())
    }

    async fn send(&self, text: &str) -> Result<(), ProtocolError> {
        let SessionState::InRoom { username, room } = &self.state else {
            return Err(ProtocolError::MustJoinRoom);
        };
        self.relay.broadcast(room, username, text).await;
        Ok(())
    }

    async fn private_send(&self, target: &str, text: &str) -> Result<(), ProtocolError> {
        let from = self.state.username().ok_or(ProtocolError::NotLoggedIn)?;
        self.relay.private_message(from, target, text).await
    }

    /// Removes every directory entry this session owns. Runs on `LOGOUT` and
    /// when the transport goes away; calling it twice is harmless.
    pub async fn disconnect(&mut self) {
        let state = std::mem::replace(&mut self.state, SessionState::Connected);
        if let Some(username) = state.username() {
            self.relay.directory().unregister(username).await;
            info!(session = self.id(), %username, "logged out");
        }
        if let SessionState::InRoom { username, room } = &state {
            self.relay.directory().leave(room, self.id()).await;
            self.announce_departure(room, username).await;
        }
    }

    async fn announce_departure(&self, room: &str, username: &str) {
        self.relay
            .announce(room, &format!("{username} left the room."))
            .await;
        self.relay.publish_member_list(room).await;
    }

    async fn reply(&self, event: Event) {
        if !self.outbox.send(event).await {
            debug!(session = self.id(), "reply dropped, connection closing");
        }
    }
}

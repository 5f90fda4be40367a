use std::{fmt, io};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Fixed-width `yyyy-MM-dd HH:mm:ss`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Username used for messages the server itself posts into a room.
pub const SERVER_NAME: &str = "SERVER";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login { name: String },
    Join { room: String },
    Leave,
    Msg { text: String },
    Pm { target: String, text: String },
    Logout,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        if let Some(name) = line.strip_prefix("LOGIN:") {
            return Ok(Command::Login {
                name: name.trim().to_string(),
            });
        }
        if let Some(room) = line.strip_prefix("JOIN:") {
            return Ok(Command::Join {
                room: room.trim().to_string(),
            });
        }
        if let Some(text) = line.strip_prefix("MSG:") {
            return Ok(Command::Msg {
                text: text.to_string(),
            });
        }
        if let Some(rest) = line.strip_prefix("PM:") {
            let (target, text) = rest
                .split_once(':')
                .ok_or(ProtocolError::MalformedPrivateMessage)?;
            return Ok(Command::Pm {
                target: target.to_string(),
                text: text.to_string(),
            });
        }
        match line {
            "LEAVE" => Ok(Command::Leave),
            "LOGOUT" => Ok(Command::Logout),
            _ => Err(ProtocolError::UnknownCommand),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Info(String),
    Error(String),
    Room {
        timestamp: String,
        room: String,
        from: String,
        text: String,
    },
    Private {
        timestamp: String,
        from: String,
        text: String,
    },
    UserList(Vec<String>),
}

impl Event {
    pub fn info(text: impl Into<String>) -> Self {
        Event::Info(text.into())
    }

    /// Room broadcast stamped with the current local time.
    pub fn room(room: &str, from: &str, text: &str) -> Self {
        Event::Room {
            timestamp: timestamp(),
            room: room.to_string(),
            from: from.to_string(),
            text: text.to_string(),
        }
    }

    pub fn private(from: &str, text: &str) -> Self {
        Event::Private {
            timestamp: timestamp(),
            from: from.to_string(),
            text: text.to_string(),
        }
    }
}

impl From<ProtocolError> for Event {
    fn from(err: ProtocolError) -> Self {
        Event::Error(err.to_string())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Info(text) => write!(f, "INFO:{text}"),
            Event::Error(text) => write!(f, "ERROR:{text}"),
            Event::Room {
                timestamp,
                room,
                from,
                text,
            } => write!(f, "MSG:{timestamp}:{room}:{from}:{text}"),
            Event::Private {
                timestamp,
                from,
                text,
            } => write!(f, "PM:{timestamp}:{from}:{text}"),
            Event::UserList(names) => write!(f, "USERLIST:{}", names.join(",")),
        }
    }
}

pub fn timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Reads the next non-blank line, without its terminator. `None` means the
/// peer closed the stream. Invalid UTF-8 is replaced rather than rejected.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let bytes = reader.read_until(b'\n', &mut buf).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let line = String::from_utf8_lossy(&buf);
        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }
        return Ok(Some(trimmed.to_string()));
    }
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}

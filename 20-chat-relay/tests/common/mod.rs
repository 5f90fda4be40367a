#![allow(dead_code)]

use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use chat_relay::{
    directory::Directory,
    files::{FileServer, FileStore},
    protocol::{read_line, write_line},
    relay::Relay,
    server::ChatServer,
};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};

pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Harness {
    pub chat_addr: SocketAddr,
    pub file_addr: SocketAddr,
    pub relay: Relay,
    shutdown: Vec<oneshot::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Harness {
    pub async fn start(storage: &Path) -> Result<Self> {
        let relay = Relay::new(Arc::new(Directory::new()));

        let chat = ChatServer::new(TcpListener::bind("127.0.0.1:0").await?, relay.clone());
        let store = Arc::new(FileStore::open(storage).await?);
        let files = FileServer::new(
            TcpListener::bind("127.0.0.1:0").await?,
            store,
            relay.clone(),
        );
        let chat_addr = chat.local_addr()?;
        let file_addr = files.local_addr()?;

        let (chat_tx, chat_rx) = oneshot::channel::<()>();
        let (files_tx, files_rx) = oneshot::channel::<()>();
        let tasks = vec![
            tokio::spawn(async move {
                let _ = chat
                    .run_until(async move {
                        let _ = chat_rx.await;
                    })
                    .await;
            }),
            tokio::spawn(async move {
                let _ = files
                    .run_until(async move {
                        let _ = files_rx.await;
                    })
                    .await;
            }),
        ];

        Ok(Self {
            chat_addr,
            file_addr,
            relay,
            shutdown: vec![chat_tx, files_tx],
            tasks,
        })
    }

    pub async fn stop(self) {
        for tx in self.shutdown {
            let _ = tx.send(());
        }
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// A raw protocol client on the chat listener.
pub struct ChatClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ChatClient {
    /// Connects and consumes the welcome banner.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
        };
        let welcome = client.recv().await?;
        assert_eq!(welcome, "INFO:Welcome! Please login with LOGIN:<username>");
        Ok(client)
    }

    pub async fn login(addr: SocketAddr, name: &str) -> Result<Self> {
        let mut client = Self::connect(addr).await?;
        client.send(&format!("LOGIN:{name}")).await?;
        client.expect(&format!("INFO:Logged in as {name}")).await?;
        Ok(client)
    }

    pub async fn send(&mut self, line: &str) -> Result<()> {
        write_line(&mut self.writer, line).await?;
        Ok(())
    }

    /// Writes bytes as-is, for lines that are not valid UTF-8.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<String> {
        timeout(READ_TIMEOUT, read_line(&mut self.reader))
            .await??
            .ok_or_else(|| anyhow!("connection closed"))
    }

    pub async fn expect(&mut self, expected: &str) -> Result<()> {
        let line = self.recv().await?;
        if line != expected {
            return Err(anyhow!("expected '{expected}', got '{line}'"));
        }
        Ok(())
    }

    /// `None` when the server closed the connection.
    pub async fn recv_or_eof(&mut self) -> Result<Option<String>> {
        Ok(timeout(READ_TIMEOUT, read_line(&mut self.reader)).await??)
    }

    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Splits `MSG:<timestamp>:<rest>` into its timestamp and remainder.
pub fn split_room_message(line: &str) -> Option<(&str, &str)> {
    let body = line.strip_prefix("MSG:")?;
    let timestamp = body.get(..19)?;
    let rest = body.get(19..)?.strip_prefix(':')?;
    Some((timestamp, rest))
}

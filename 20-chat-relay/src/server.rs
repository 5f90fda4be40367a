use std::{future::Future, io, net::SocketAddr};

use anyhow::Result;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    select,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    protocol::{Event, read_line, write_line},
    relay::Relay,
    session::{Flow, Outbox, Session, SessionId},
};

pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

const WELCOME: &str = "Welcome! Please login with LOGIN:<username>";

/// Accept loop for chat connections. Every connection gets its own task, so
/// accepting never waits on an existing session.
pub struct ChatServer {
    listener: TcpListener,
    relay: Relay,
    outbox_capacity: usize,
}

impl ChatServer {
    pub fn new(listener: TcpListener, relay: Relay) -> Self {
        Self {
            listener,
            relay,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }

    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity.max(1);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let ChatServer {
            listener,
            relay,
            outbox_capacity,
        } = self;
        tokio::pin!(shutdown);
        let mut next_id: SessionId = 1;

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("chat server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            let outbox = Outbox::channel(next_id, outbox_capacity);
                            next_id += 1;
                            spawn_connection(stream, peer, outbox, &relay);
                        }
                        Err(err) => warn!(error = ?err, "failed to accept connection"),
                    }
                }
            }
        }

        Ok(())
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    (outbox, inbox): (Outbox, mpsc::Receiver<Event>),
    relay: &Relay,
) {
    let relay = relay.clone();
    tokio::spawn(async move {
        let id = outbox.id();
        debug!(session = id, %peer, "connection accepted");
        if let Err(err) = handle_connection(stream, outbox, inbox, relay).await {
            warn!(session = id, %peer, error = ?err, "connection closed with error");
        }
        debug!(session = id, %peer, "connection closed");
    });
}

async fn handle_connection(
    stream: TcpStream,
    outbox: Outbox,
    inbox: mpsc::Receiver<Event>,
    relay: Relay,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer_task = tokio::spawn(write_events(writer, inbox));

    let id = outbox.id();
    outbox.send(Event::info(WELCOME)).await;
    let mut session = Session::new(outbox, relay);
    let writer_result = run_session(&mut session, &mut reader, &mut writer_task).await;

    // Cleanup is identical for LOGOUT, EOF, read errors and dead writers.
    session.disconnect().await;
    drop(session);

    let writer_result = match writer_result {
        Some(result) => result,
        None => writer_task.await,
    };
    if let Err(err) = writer_result? {
        debug!(session = id, error = ?err, "write failed");
    }
    Ok(())
}

/// Feeds client lines into the session until it closes, the peer goes away,
/// or the writer stops. Returns the writer's result if it finished first.
async fn run_session<R>(
    session: &mut Session,
    reader: &mut R,
    writer_task: &mut JoinHandle<io::Result<()>>,
) -> Option<Result<io::Result<()>, tokio::task::JoinError>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        select! {
            line = read_line(&mut *reader) => {
                match line {
                    Ok(Some(line)) => {
                        if session.handle_line(&line).await == Flow::Close {
                            return None;
                        }
                    }
                    Ok(None) => return None,
                    Err(err) => {
                        debug!(session = session.id(), error = ?err, "read failed");
                        return None;
                    }
                }
            }
            writer_result = &mut *writer_task => {
                debug!(session = session.id(), "writer stopped");
                return Some(writer_result);
            }
        }
    }
}

/// Flips the returned flag once `signal` resolves. If the signal cannot be
/// installed the flag is never set, so servers keep running instead of
/// treating the failure as a shutdown request.
pub fn shutdown_on<F>(signal: F) -> watch::Receiver<bool>
where
    F: Future<Output = io::Result<()>> + Send + 'static,
{
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal.await {
            Ok(()) => {
                let _ = tx.send(true);
            }
            Err(err) => {
                warn!(error = ?err, "failed to install shutdown signal handler");
                std::future::pending::<()>().await;
            }
        }
    });
    rx
}

pub async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn write_events(
    mut writer: OwnedWriteHalf,
    mut inbox: mpsc::Receiver<Event>,
) -> io::Result<()> {
    while let Some(event) = inbox.recv().await {
        write_line(&mut writer, &event.to_string()).await?;
    }
    writer.shutdown().await
}

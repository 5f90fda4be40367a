//! Out-of-band file exchange.
//!
//! Runs its own listener and line-framed protocol, independent of the chat
//! connection:
//!
//! - `UPLOAD:<room>:<filename>:<size>:<uploader>` followed by exactly `<size>`
//!   raw bytes, answered with `OK:<id>`;
//! - `DOWNLOAD:<id>`, answered with `OK:<filename>:<size>` and the bytes.
//!
//! Failures are answered with `ERROR:<code>` (see [`TransferError::code`]).
//! Completed uploads are announced to their room through the [`Relay`].

use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use nanoid::nanoid;
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::Mutex,
};
use tracing::{debug, info, warn};

use crate::{
    error::TransferError,
    protocol::{read_line, write_line},
    relay::Relay,
};

/// Metadata of one completed upload. Never changes after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: String,
    pub file_name: String,
    pub size: u64,
    pub room: String,
    pub uploader: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub room: String,
    pub file_name: String,
    pub size: u64,
    pub uploader: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRequest {
    Upload(UploadRequest),
    Download { id: String },
}

impl FileRequest {
    pub fn parse(line: &str) -> Result<Self, TransferError> {
        if let Some(rest) = line.strip_prefix("UPLOAD:") {
            return parse_upload(rest).map(FileRequest::Upload);
        }
        if let Some(id) = line.strip_prefix("DOWNLOAD:") {
            let id = id.trim();
            if id.is_empty() {
                return Err(TransferError::BadRequest("missing file id".into()));
            }
            return Ok(FileRequest::Download { id: id.to_string() });
        }
        Err(TransferError::BadRequest(format!("unknown request '{line}'")))
    }
}

fn parse_upload(rest: &str) -> Result<UploadRequest, TransferError> {
    let bad = |what: &str| TransferError::BadRequest(what.to_string());

    let mut parts = rest.splitn(4, ':');
    let (Some(room), Some(file_name), Some(size), Some(uploader)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(bad("expected UPLOAD:<room>:<filename>:<size>:<uploader>"));
    };

    // Only the last path component is kept so uploads cannot escape the
    // storage directory.
    let file_name = Path::new(file_name.trim())
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| bad("invalid filename"))?;
    let size = size
        .trim()
        .parse::<u64>()
        .map_err(|_| bad("size is not a number"))?;
    let (room, uploader) = (room.trim(), uploader.trim());
    if room.is_empty() || uploader.is_empty() {
        return Err(bad("room and uploader are required"));
    }

    Ok(UploadRequest {
        room: room.to_string(),
        file_name: file_name.to_string(),
        size,
        uploader: uploader.to_string(),
    })
}

/// Upload storage on the local filesystem plus the id → record registry.
pub struct FileStore {
    root: PathBuf,
    records: Mutex<HashMap<String, Arc<FileRecord>>>,
}

impl FileStore {
    pub async fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            records: Mutex::new(HashMap::new()),
        })
    }

    /// Reads exactly `upload.size` bytes from `body` into a fresh file and
    /// registers it. A short body removes the partial file and registers
    /// nothing.
    pub async fn store<R>(
        &self,
        upload: &UploadRequest,
        body: &mut R,
    ) -> Result<Arc<FileRecord>, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let id = nanoid!();
        let path = self.root.join(format!("{id}_{}", upload.file_name));

        let received = match write_body(&path, upload.size, body).await {
            Ok(received) => received,
            Err(err) => {
                discard(&path).await;
                return Err(err.into());
            }
        };
        if received < upload.size {
            discard(&path).await;
            return Err(TransferError::Incomplete {
                expected: upload.size,
                received,
            });
        }

        let record = Arc::new(FileRecord {
            id: id.clone(),
            file_name: upload.file_name.clone(),
            size: received,
            room: upload.room.clone(),
            uploader: upload.uploader.clone(),
            path,
        });
        self.records.lock().await.insert(id, Arc::clone(&record));
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<FileRecord>> {
        self.records.lock().await.get(id).cloned()
    }
}

async fn write_body<R>(path: &Path, size: u64, body: &mut R) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut file = File::create(path).await?;
    let mut limited = body.take(size);
    let received = tokio::io::copy(&mut limited, &mut file).await?;
    file.flush().await?;
    Ok(received)
}

async fn discard(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await {
        debug!(?error, path = %path.display(), "failed to remove partial upload");
    }
}

pub struct FileServer {
    listener: TcpListener,
    store: Arc<FileStore>,
    relay: Relay,
}

impl FileServer {
    pub fn new(listener: TcpListener, store: Arc<FileStore>, relay: Relay) -> Self {
        Self {
            listener,
            store,
            relay,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let FileServer {
            listener,
            store,
            relay,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("file exchange shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => spawn_transfer(stream, peer, &store, &relay),
                        Err(err) => warn!(error = ?err, "failed to accept file connection"),
                    }
                }
            }
        }

        Ok(())
    }
}

fn spawn_transfer(stream: TcpStream, peer: SocketAddr, store: &Arc<FileStore>, relay: &Relay) {
    let store = Arc::clone(store);
    let relay = relay.clone();
    tokio::spawn(async move {
        if let Err(err) = handle_transfer(stream, &store, &relay).await {
            warn!(peer = %peer, error = ?err, "file transfer closed with error");
        }
    });
}

async fn handle_transfer(stream: TcpStream, store: &FileStore, relay: &Relay) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let Some(header) = read_line(&mut reader).await? else {
        return Ok(());
    };

    let outcome = match FileRequest::parse(&header) {
        Ok(FileRequest::Upload(upload)) => {
            handle_upload(&upload, &mut reader, &mut writer, store, relay).await
        }
        Ok(FileRequest::Download { id }) => handle_download(&id, &mut writer, store).await,
        Err(err) => Err(err),
    };

    if let Err(err) = outcome {
        debug!(%err, "file request failed");
        write_line(&mut writer, &format!("ERROR:{}", err.code())).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

async fn handle_upload<R, W>(
    upload: &UploadRequest,
    body: &mut R,
    writer: &mut W,
    store: &FileStore,
    relay: &Relay,
) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let record = store.store(upload, body).await?;
    info!(
        id = %record.id,
        file = %record.file_name,
        size = record.size,
        room = %record.room,
        uploader = %record.uploader,
        "upload stored"
    );
    relay.announce_file(&record).await;
    write_line(writer, &format!("OK:{}", record.id)).await?;
    Ok(())
}

async fn handle_download<W>(
    id: &str,
    writer: &mut W,
    store: &FileStore,
) -> Result<(), TransferError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let record = store
        .get(id)
        .await
        .ok_or_else(|| TransferError::NotFound(id.to_string()))?;
    let file = File::open(&record.path).await?;

    write_line(writer, &format!("OK:{}:{}", record.file_name, record.size)).await?;

    // Past the header the peer is reading raw bytes, so a failure can only
    // cut the body short.
    let copied = tokio::io::copy(&mut file.take(record.size), writer).await;
    match copied {
        Ok(sent) if sent == record.size => {
            writer.flush().await?;
            debug!(id, sent, "download served");
        }
        Ok(sent) => warn!(id, sent, size = record.size, "stored file shorter than recorded"),
        Err(error) => warn!(id, ?error, "download interrupted"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(size: u64) -> UploadRequest {
        UploadRequest {
            room: "general".into(),
            file_name: "notes.txt".into(),
            size,
            uploader: "alice".into(),
        }
    }

    #[test]
    fn parses_upload_and_download_headers() {
        assert_eq!(
            FileRequest::parse("UPLOAD:general:notes.txt:10:alice").expect("upload"),
            FileRequest::Upload(upload(10))
        );
        assert_eq!(
            FileRequest::parse("DOWNLOAD:abc").expect("download"),
            FileRequest::Download { id: "abc".into() }
        );
    }

    #[test]
    fn strips_directories_from_upload_names() {
        let Ok(FileRequest::Upload(request)) =
            FileRequest::parse("UPLOAD:general:../../etc/passwd:3:alice")
        else {
            panic!("expected upload request");
        };
        assert_eq!(request.file_name, "passwd");
    }

    #[test]
    fn rejects_malformed_headers() {
        for line in [
            "UPLOAD:general:notes.txt:ten:alice",
            "UPLOAD:general:notes.txt:10",
            "UPLOAD::notes.txt:10:alice",
            "UPLOAD:general:..:10:alice",
            "DOWNLOAD:",
            "DELETE:abc",
        ] {
            let err = FileRequest::parse(line).expect_err(line);
            assert_eq!(err.code(), "BadRequest", "{line}");
        }
    }

    #[tokio::test]
    async fn stored_upload_is_registered_with_its_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(dir.path()).await.expect("open store");
        let mut body: &[u8] = b"0123456789 trailing";

        let record = store.store(&upload(10), &mut body).await.expect("store");

        assert_eq!(record.size, 10);
        assert_eq!(record.file_name, "notes.txt");
        assert_eq!(
            tokio::fs::read(&record.path).await.expect("read back"),
            b"0123456789"
        );
        assert_eq!(store.get(&record.id).await, Some(record));
    }

    #[tokio::test]
    async fn identifiers_are_unique() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(dir.path()).await.expect("open store");

        let mut first: &[u8] = b"aa";
        let mut second: &[u8] = b"bb";
        let a = store.store(&upload(2), &mut first).await.expect("first");
        let b = store.store(&upload(2), &mut second).await.expect("second");

        assert_ne!(a.id, b.id);
        assert_ne!(a.path, b.path);
    }

    #[tokio::test]
    async fn short_upload_is_discarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(dir.path()).await.expect("open store");
        let mut body: &[u8] = b"0123";

        let err = store
            .store(&upload(10), &mut body)
            .await
            .expect_err("upload should be incomplete");

        assert!(matches!(
            err,
            TransferError::Incomplete {
                expected: 10,
                received: 4
            }
        ));
        let mut entries = tokio::fs::read_dir(dir.path()).await.expect("read dir");
        assert!(entries.next_entry().await.expect("entry").is_none());
    }

    #[tokio::test]
    async fn unreadable_body_after_header_adds_no_error_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(dir.path()).await.expect("open store");
        // Opening a directory succeeds on Unix but reading it fails.
        let record = FileRecord {
            id: "broken".into(),
            file_name: "notes.txt".into(),
            size: 10,
            room: "general".into(),
            uploader: "alice".into(),
            path: dir.path().to_path_buf(),
        };
        store
            .records
            .lock()
            .await
            .insert(record.id.clone(), Arc::new(record));

        let mut sent = Vec::new();
        handle_download("broken", &mut sent, &store)
            .await
            .expect("failure after the header is not reported");

        assert_eq!(sent, b"OK:notes.txt:10\n");
    }

    #[tokio::test]
    async fn missing_download_fails_before_any_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(dir.path()).await.expect("open store");

        let mut sent = Vec::new();
        let err = handle_download("nope", &mut sent, &store)
            .await
            .expect_err("unknown id");

        assert_eq!(err.code(), "NotFound");
        assert!(sent.is_empty());
    }
}

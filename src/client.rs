//! Upload client.
//!
//! Registers a file with the master, then streams it to the storage node it
//! was placed on. Every connection starts by asking the node how much it
//! already holds; a broken connection is retried from there, and a clean
//! one is followed by a reconnect that confirms the node holds every byte.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, SeekFrom},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, info, warn};

use crate::{
    config::UploadConfig,
    errors::{CLOSE_NORMAL, Code},
    handlers::metadata_handlers::RequestUploadReq,
    models::{chunk::Chunk, file_record::FileRecord},
};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("master request failed: {0}")]
    Master(#[from] reqwest::Error),
    #[error("master rejected the upload ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("storage node refused the stream ({code:?}): {reason}")]
    Refused { code: Code, reason: String },
    #[error("stream failed: {0}")]
    Stream(String),
    #[error("gave up after {attempts} failed attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl UploadError {
    /// Errors another attempt cannot fix.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, UploadError::Stream(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for UploadError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        UploadError::Stream(err.to_string())
    }
}

/// Result of a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub file_id: String,
    pub filename: String,
    pub bytes_stored: u64,
    /// Connections opened, including the confirming one.
    pub connections: u32,
}

/// How one connection ended.
enum Attempt {
    /// The node already held at least the declared size.
    Done(u64),
    /// Bytes were sent from `resume_offset` and the stream closed cleanly.
    Sent { resume_offset: u64 },
}

pub struct Uploader {
    http: reqwest::Client,
    cfg: UploadConfig,
}

impl Uploader {
    pub fn new(cfg: UploadConfig) -> Result<Self, UploadError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http, cfg })
    }

    /// Register and transfer the configured file.
    pub async fn upload(&self) -> Result<UploadReport, UploadError> {
        let path = self.cfg.file.clone();
        let record = self.register(&path).await?;
        self.transfer(&record, &path).await
    }

    /// `POST /uploads` for `path`, using its file name and current size.
    pub async fn register(&self, path: &Path) -> Result<FileRecord, UploadError> {
        let meta = tokio::fs::metadata(path).await.map_err(|source| UploadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let req = RequestUploadReq {
            filename,
            size_bytes: i64::try_from(meta.len()).unwrap_or(i64::MAX),
        };

        let url = format!("{}/uploads", self.cfg.master_url.trim_end_matches('/'));
        let resp = self.http.post(&url).json(&req).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|body| body.get("error").and_then(|e| e.as_str()).map(String::from))
                .unwrap_or_else(|| "no error message".into());
            return Err(UploadError::Rejected { status, message });
        }

        let record: FileRecord = resp.json().await?;
        info!(
            file_id = %record.file_id,
            node = %record.storage_node_address,
            "registered upload"
        );
        Ok(record)
    }

    /// Stream `path` to the node `record` was placed on until the node
    /// holds `record.size_bytes` bytes.
    pub async fn transfer(
        &self,
        record: &FileRecord,
        path: &Path,
    ) -> Result<UploadReport, UploadError> {
        let size = u64::try_from(record.size_bytes).unwrap_or(0);
        let mut failures = 0u32;
        let mut connections = 0u32;
        let mut last_sent_from: Option<u64> = None;

        loop {
            connections += 1;
            let err = match self.attempt(record, path, size).await {
                Ok(Attempt::Done(bytes_stored)) => {
                    info!(file_id = %record.file_id, bytes_stored, "upload complete");
                    return Ok(UploadReport {
                        file_id: record.file_id.clone(),
                        filename: record.filename.clone(),
                        bytes_stored,
                        connections,
                    });
                }
                Ok(Attempt::Sent { resume_offset }) if last_sent_from != Some(resume_offset) => {
                    last_sent_from = Some(resume_offset);
                    failures = 0;
                    continue;
                }
                Ok(Attempt::Sent { resume_offset }) => UploadError::Stream(format!(
                    "no progress past offset {}",
                    resume_offset
                )),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => err,
            };

            failures += 1;
            if failures >= self.cfg.max_attempts {
                return Err(UploadError::Exhausted {
                    attempts: failures,
                    last: err.to_string(),
                });
            }
            warn!(
                file_id = %record.file_id,
                attempt = failures,
                "upload attempt failed, retrying in {:?}: {}",
                self.cfg.retry_delay,
                err
            );
            tokio::time::sleep(self.cfg.retry_delay).await;
        }
    }

    async fn attempt(
        &self,
        record: &FileRecord,
        path: &Path,
        size: u64,
    ) -> Result<Attempt, UploadError> {
        let mut request = stream_url(&record.storage_node_address).into_client_request()?;
        if !record.auth_token.is_empty() {
            let bearer = HeaderValue::from_str(&format!("Bearer {}", record.auth_token))
                .map_err(|err| UploadError::Stream(err.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, bearer);
        }

        let (socket, _) = connect_async(request).await?;
        let (mut sink, mut stream) = socket.split();
        let file_id = record.file_id.as_str();

        sink.send(encode(&Chunk::status(file_id, 0))?).await?;
        let resume_offset = match stream.next().await {
            Some(Ok(Message::Text(text))) => decode(text.as_str())?.offset,
            Some(Ok(Message::Close(frame))) => return Err(refusal(frame)),
            Some(Ok(other)) => {
                return Err(UploadError::Stream(format!("unexpected message {:?}", other)));
            }
            Some(Err(err)) => return Err(err.into()),
            None => return Err(UploadError::Stream("connection closed before status".into())),
        };
        debug!(file_id, resume_offset, "storage node reported resume offset");

        if resume_offset >= size {
            sink.send(close_message()).await?;
            drain_until_close(&mut stream).await;
            return Ok(Attempt::Done(resume_offset));
        }

        let mut file = File::open(path).await.map_err(|source| UploadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        file.seek(SeekFrom::Start(resume_offset))
            .await
            .map_err(|source| UploadError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let chunk_size = self.cfg.chunk_size;
        let send_all = async {
            let mut offset = resume_offset;
            let mut buf = vec![0u8; chunk_size];
            while offset < size {
                let want = usize::try_from(size - offset).map_or(chunk_size, |rest| rest.min(chunk_size));
                let n = read_full(&mut file, &mut buf[..want])
                    .await
                    .map_err(|source| UploadError::Io {
                        path: path.to_path_buf(),
                        source,
                    })?;
                if n == 0 {
                    warn!(file_id, offset, "file ended before its declared size");
                    break;
                }
                let chunk = Chunk {
                    file_id: file_id.to_string(),
                    offset,
                    chunk_index: offset / chunk_size as u64,
                    data: Bytes::copy_from_slice(&buf[..n]),
                };
                sink.send(encode(&chunk)?).await?;
                offset += n as u64;
            }
            sink.send(close_message()).await?;
            Ok::<_, UploadError>(())
        };

        let watch_status = async {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(status) = decode(text.as_str()) {
                            debug!(file_id, durable = status.offset, "storage node progress");
                        }
                    }
                    Some(Ok(Message::Close(frame))) => return close_outcome(frame),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(UploadError::from(err)),
                    None => {
                        return Err(UploadError::Stream(
                            "connection dropped without a close frame".into(),
                        ));
                    }
                }
            }
        };

        let (sent, closed) = tokio::join!(send_all, watch_status);
        match (sent, closed) {
            (_, Err(err)) if err.is_fatal() => Err(err),
            (Err(err), _) => Err(err),
            (Ok(()), Err(err)) => Err(err),
            (Ok(()), Ok(())) => Ok(Attempt::Sent { resume_offset }),
        }
    }
}

fn stream_url(address: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.starts_with("ws://") || address.starts_with("wss://") {
        format!("{}/stream", address)
    } else {
        format!("ws://{}/stream", address)
    }
}

fn encode(chunk: &Chunk) -> Result<Message, UploadError> {
    serde_json::to_string(chunk)
        .map(|text| Message::Text(text.into()))
        .map_err(|err| UploadError::Stream(err.to_string()))
}

fn decode(text: &str) -> Result<Chunk, UploadError> {
    serde_json::from_str(text).map_err(|err| UploadError::Stream(format!("bad status: {}", err)))
}

fn close_message() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "upload sent".into(),
    }))
}

/// A close frame received where the node should have kept the stream open.
fn refusal(frame: Option<CloseFrame>) -> UploadError {
    match close_outcome(frame) {
        Err(err) => err,
        Ok(()) => UploadError::Stream("stream closed before status".into()),
    }
}

/// Map a close frame to an outcome. Codes the node uses for rejections
/// become fatal errors, anything else unclean is retryable.
fn close_outcome(frame: Option<CloseFrame>) -> Result<(), UploadError> {
    let Some(frame) = frame else {
        return Err(UploadError::Stream("closed without a status code".into()));
    };
    let raw = u16::from(frame.code);
    if raw == CLOSE_NORMAL {
        return Ok(());
    }
    let reason = frame.reason.as_str().to_string();
    match Code::from_close_code(raw) {
        Some(code @ (Code::InvalidArgument | Code::Unauthenticated | Code::NotFound)) => {
            Err(UploadError::Refused { code, reason })
        }
        Some(code) => Err(UploadError::Stream(format!("{:?}: {}", code, reason))),
        None => Err(UploadError::Stream(format!("close code {}: {}", raw, reason))),
    }
}

async fn drain_until_close<S>(stream: &mut S)
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(Ok(msg)) = stream.next().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }
}

async fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(code: u16, reason: &str) -> Option<CloseFrame> {
        Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        })
    }

    #[test]
    fn rejections_are_fatal_and_faults_retry() {
        assert!(close_outcome(frame(1000, "")).is_ok());

        let err = close_outcome(frame(4401, "bad token")).unwrap_err();
        assert!(matches!(err, UploadError::Refused { code: Code::Unauthenticated, .. }));
        assert!(err.is_fatal());

        let err = close_outcome(frame(4400, "no data")).unwrap_err();
        assert!(err.is_fatal());

        for code in [4409, 4499, 4503, 4500, 1006, 1011] {
            assert!(!close_outcome(frame(code, "")).unwrap_err().is_fatal(), "{}", code);
        }
        assert!(!close_outcome(None).unwrap_err().is_fatal());
    }

    #[test]
    fn stream_urls() {
        assert_eq!(stream_url("localhost:50052"), "ws://localhost:50052/stream");
        assert_eq!(stream_url("wss://node.example/"), "wss://node.example/stream");
    }

    #[tokio::test]
    async fn read_full_stops_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        tokio::fs::write(&path, b"abcde").await.unwrap();
        let mut file = File::open(&path).await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(read_full(&mut file, &mut buf).await.unwrap(), 4);
        assert_eq!(read_full(&mut file, &mut buf).await.unwrap(), 1);
        assert_eq!(buf[0], b'e');
        assert_eq!(read_full(&mut file, &mut buf).await.unwrap(), 0);
    }
}

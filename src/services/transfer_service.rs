//! src/services/transfer_service.rs
//!
//! TransferService: the storage node's side of an upload. Each connected
//! client gets one call to [`TransferService::stream_file`], which
//! authenticates the stream by `file_id`, derives the resume offset from the
//! durable length of the target file and appends chunk payloads to it.
//! Payloads live on local disk sharded beneath
//! `base_path/{shard}/{shard}/{file_id}`; the file's existence and length
//! are the only resume state.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures::StreamExt;
use md5::Context;
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::{
    errors::Code,
    models::chunk::Chunk,
    services::{
        active_uploads::ActiveUploads,
        channel::{ChannelError, ChunkChannel},
        observer::UploadObserver,
        token::{TokenError, TokenIssuer},
    },
};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(#[from] TokenError),
    #[error("{context}: {source}")]
    Internal {
        context: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("stream cancelled")]
    Cancelled,
    #[error(transparent)]
    Transport(ChannelError),
}

impl TransferError {
    pub fn code(&self) -> Code {
        match self {
            TransferError::InvalidArgument(_) => Code::InvalidArgument,
            TransferError::Unauthenticated(_) => Code::Unauthenticated,
            TransferError::Internal { .. } => Code::Internal,
            TransferError::Cancelled => Code::Cancelled,
            TransferError::Transport(_) => Code::Unavailable,
        }
    }

    fn internal(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| TransferError::Internal { context, source }
    }
}

impl From<ChannelError> for TransferError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Cancelled => TransferError::Cancelled,
            ChannelError::Malformed(msg) => TransferError::InvalidArgument(msg),
            other => TransferError::Transport(other),
        }
    }
}

pub type TransferResult<T> = Result<T, TransferError>;

/// How far the storage node trusts the `offset` a client puts on a chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OffsetPolicy {
    /// Any chunk at or past the durable length is appended verbatim;
    /// anything before it is skipped whole.
    #[default]
    Trust,
    /// Offsets must line up with the durable length: a chunk that would
    /// leave a gap is rejected, and a chunk overlapping the durable tail
    /// contributes only its unseen suffix.
    Strict,
}

#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Emit a status chunk whenever the durable length crosses a multiple
    /// of this many bytes. Zero disables periodic status.
    pub status_interval: u64,
    pub offset_policy: OffsetPolicy,
    /// `sync_data` after every appended chunk.
    pub sync_each_chunk: bool,
}

pub const DEFAULT_STATUS_INTERVAL: u64 = 1024 * 1024;

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            status_interval: DEFAULT_STATUS_INTERVAL,
            offset_policy: OffsetPolicy::Trust,
            sync_each_chunk: false,
        }
    }
}

/// What one successful stream did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    pub file_id: String,
    pub resume_offset: u64,
    pub bytes_stored: u64,
    pub chunks_written: u64,
    pub chunks_skipped: u64,
    pub checksum: String,
}

#[derive(Clone)]
pub struct TransferService {
    /// Base directory on disk where uploaded files are stored.
    base_path: PathBuf,
    settings: TransferSettings,
    tokens: TokenIssuer,
    active: ActiveUploads,
    observer: Arc<dyn UploadObserver>,
}

const MAX_FILE_ID_LEN: usize = 255;

impl TransferService {
    pub fn new(
        base_path: impl Into<PathBuf>,
        settings: TransferSettings,
        tokens: TokenIssuer,
        observer: Arc<dyn UploadObserver>,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            settings,
            tokens,
            active: ActiveUploads::new(),
            observer,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn active(&self) -> &ActiveUploads {
        &self.active
    }

    /// Reject ids that cannot safely name a file under `base_path`.
    fn ensure_file_id_safe(file_id: &str) -> TransferResult<()> {
        if file_id.is_empty() {
            return Err(TransferError::InvalidArgument(
                "file_id missing from first chunk".into(),
            ));
        }
        let unsafe_id = file_id.len() > MAX_FILE_ID_LEN
            || file_id.starts_with('.')
            || file_id.contains("..")
            || file_id
                .bytes()
                .any(|b| b.is_ascii_control() || matches!(b, b'/' | b'\\' | b'\0' | b':'));
        if unsafe_id {
            return Err(TransferError::InvalidArgument(format!(
                "file_id `{}` is not a valid storage name",
                file_id.escape_default()
            )));
        }
        Ok(())
    }

    /// Two-level shard directories for a file id.
    ///
    /// First two bytes of MD5(file_id) as lowercase hex (00–ff).
    fn file_shards(file_id: &str) -> (String, String) {
        let digest = md5::compute(file_id);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Where the bytes for `file_id` live. Parents may not exist yet.
    pub fn file_path(&self, file_id: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::file_shards(file_id);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(file_id);
        path
    }

    /// Durable length of `file_id`, zero if nothing was stored yet.
    pub async fn stored_len(&self, file_id: &str) -> TransferResult<u64> {
        Self::ensure_file_id_safe(file_id)?;
        match fs::metadata(self.file_path(file_id)).await {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(TransferError::internal("failed to stat stored file")(err)),
        }
    }

    /// Serve one chunk stream until it ends.
    ///
    /// Returns once the peer ends the stream cleanly, or with the fault that
    /// stopped it. Bytes made durable before a fault stay on disk and are
    /// picked up by the next stream for the same `file_id`.
    pub async fn stream_file<C: ChunkChannel>(
        &self,
        channel: C,
        token: Option<&str>,
    ) -> TransferResult<StreamSummary> {
        debug!("new chunk stream established");
        let result = self.run_stream(channel, token).await;
        match &result {
            Ok(summary) => info!(
                file_id = %summary.file_id,
                bytes_stored = summary.bytes_stored,
                written = summary.chunks_written,
                skipped = summary.chunks_skipped,
                "upload stream finished"
            ),
            Err(TransferError::Transport(err)) => {
                warn!("stream interrupted, durable bytes kept for resume: {}", err)
            }
            Err(err) => warn!(code = ?err.code(), "stream failed: {}", err),
        }
        result
    }

    async fn run_stream<C: ChunkChannel>(
        &self,
        mut channel: C,
        token: Option<&str>,
    ) -> TransferResult<StreamSummary> {
        let first = match channel.recv().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                return Err(TransferError::InvalidArgument(
                    "stream started without data".into(),
                ));
            }
            Err(err) => {
                return Err(TransferError::InvalidArgument(format!(
                    "stream started without data: {}",
                    err
                )));
            }
        };

        let file_id = first.file_id.clone();
        Self::ensure_file_id_safe(&file_id)?;
        self.tokens.verify(&file_id, token)?;

        let lease = self.active.acquire(&file_id).await;

        let path = self.file_path(&file_id);
        let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
            TransferError::internal("storage path missing parent directory")(io::Error::new(
                io::ErrorKind::Other,
                path.display().to_string(),
            ))
        })?;
        fs::create_dir_all(&parent)
            .await
            .map_err(TransferError::internal("failed to create storage directory"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(TransferError::internal("failed to open file for writing"))?;
        let resume_offset = file
            .metadata()
            .await
            .map_err(TransferError::internal("failed to stat file"))?
            .len();

        info!(file_id = %file_id, resume_offset, "opened upload target");
        lease.begin(resume_offset);

        channel.send(Chunk::status(&file_id, resume_offset)).await?;
        self.notify_started(&file_id, resume_offset);

        let mut summary = StreamSummary {
            file_id: file_id.clone(),
            resume_offset,
            bytes_stored: resume_offset,
            chunks_written: 0,
            chunks_skipped: 0,
            checksum: String::new(),
        };
        let mut reported_boundary = self.boundary(resume_offset);
        let mut current = first;

        loop {
            if !current.file_id.is_empty() && current.file_id != file_id {
                return Err(TransferError::InvalidArgument(format!(
                    "chunk for `{}` on a stream opened for `{}`",
                    current.file_id.escape_default(),
                    file_id
                )));
            }

            self.append_chunk(&mut file, &current, &mut summary).await?;
            lease.record(summary.bytes_stored);

            let boundary = self.boundary(summary.bytes_stored);
            if boundary > reported_boundary {
                reported_boundary = boundary;
                let status = Chunk::status(&file_id, summary.bytes_stored);
                if let Err(err) = channel.send(status).await {
                    warn!(file_id = %file_id, "failed to send progress status: {}", err);
                }
            }

            current = match channel.recv().await? {
                Some(chunk) => chunk,
                None => break,
            };
        }

        file.sync_all()
            .await
            .map_err(TransferError::internal("failed to sync file"))?;
        drop(file);

        summary.checksum = file_md5(&path)
            .await
            .map_err(TransferError::internal("failed to checksum stored file"))?;
        self.observer
            .upload_finished(&file_id, summary.bytes_stored, summary.checksum.clone())
            .await;

        drop(lease);
        Ok(summary)
    }

    /// Append whatever part of `chunk` is not durable yet.
    async fn append_chunk(
        &self,
        file: &mut File,
        chunk: &Chunk,
        summary: &mut StreamSummary,
    ) -> TransferResult<()> {
        let durable = summary.bytes_stored;
        let payload: &[u8] = match self.settings.offset_policy {
            OffsetPolicy::Trust if chunk.offset >= durable => &chunk.data[..],
            OffsetPolicy::Trust => &[],
            OffsetPolicy::Strict if chunk.offset > durable => {
                return Err(TransferError::InvalidArgument(format!(
                    "chunk {} at offset {} leaves a gap after durable length {}",
                    chunk.chunk_index, chunk.offset, durable
                )));
            }
            OffsetPolicy::Strict if chunk.end_offset() > durable => {
                let already = usize::try_from(durable - chunk.offset).unwrap_or(usize::MAX);
                &chunk.data[already.min(chunk.data.len())..]
            }
            OffsetPolicy::Strict => &[],
        };

        if payload.is_empty() {
            if !chunk.data.is_empty() {
                debug!(
                    file_id = %summary.file_id,
                    chunk_index = chunk.chunk_index,
                    offset = chunk.offset,
                    durable,
                    "skipping chunk already received"
                );
                summary.chunks_skipped += 1;
            }
            return Ok(());
        }

        file.write_all(payload)
            .await
            .map_err(TransferError::internal("file write failed"))?;
        file.flush()
            .await
            .map_err(TransferError::internal("file write failed"))?;
        if self.settings.sync_each_chunk {
            file.sync_data()
                .await
                .map_err(TransferError::internal("failed to sync chunk"))?;
        }

        summary.bytes_stored += payload.len() as u64;
        summary.chunks_written += 1;
        Ok(())
    }

    fn boundary(&self, durable: u64) -> u64 {
        match self.settings.status_interval {
            0 => 0,
            interval => durable / interval,
        }
    }

    /// Fire the started report without holding up the stream.
    fn notify_started(&self, file_id: &str, resume_offset: u64) {
        let observer = Arc::clone(&self.observer);
        let file_id = file_id.to_string();
        tokio::spawn(async move {
            observer.upload_started(&file_id, resume_offset).await;
        });
    }
}

/// Hex MD5 of a stored file.
async fn file_md5(path: &Path) -> io::Result<String> {
    let file = File::open(path).await?;
    let mut stream = ReaderStream::new(file);
    let mut digest = Context::new();
    while let Some(bytes) = stream.next().await {
        digest.consume(&bytes?);
    }
    Ok(format!("{:x}", digest.compute()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{channel::QueueChannel, observer::NoopObserver};
    use bytes::Bytes;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const FILE: &str = "file_test";

    fn service_with(dir: &TempDir, settings: TransferSettings, tokens: TokenIssuer) -> TransferService {
        TransferService::new(dir.path(), settings, tokens, Arc::new(NoopObserver))
    }

    fn service(dir: &TempDir) -> TransferService {
        service_with(dir, TransferSettings::default(), TokenIssuer::unsigned())
    }

    fn chunk(offset: u64, index: u64, data: &[u8]) -> Chunk {
        Chunk {
            file_id: FILE.into(),
            offset,
            chunk_index: index,
            data: Bytes::copy_from_slice(data),
        }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    /// Contiguous chunks covering `payloads` in order, starting at `start`.
    fn contiguous(start: u64, payloads: &[Vec<u8>]) -> Vec<Chunk> {
        let mut offset = start;
        payloads
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let c = chunk(offset, i as u64, p);
                offset += p.len() as u64;
                c
            })
            .collect()
    }

    async fn seed_file(svc: &TransferService, contents: &[u8]) {
        let path = svc.file_path(FILE);
        fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        fs::write(&path, contents).await.unwrap();
    }

    async fn stored(svc: &TransferService) -> Vec<u8> {
        fs::read(svc.file_path(FILE)).await.unwrap_or_default()
    }

    /// Send `chunks`, end the stream cleanly, return the result and every
    /// status the server emitted.
    async fn run(
        svc: &TransferService,
        token: Option<String>,
        chunks: Vec<Chunk>,
    ) -> (TransferResult<StreamSummary>, Vec<Chunk>) {
        let (server, peer) = QueueChannel::pair(256);
        let task = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.stream_file(server, token.as_deref()).await })
        };
        for c in chunks {
            let _ = peer.send(c).await;
        }
        let mut rx = peer.finish();
        let result = task.await.unwrap();
        let mut statuses = Vec::new();
        while let Ok(status) = rx.try_recv() {
            statuses.push(status);
        }
        (result, statuses)
    }

    #[tokio::test]
    async fn two_chunks_into_fresh_file() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let a = pattern(1024, 1);
        let b = pattern(1024, 2);

        let (result, statuses) = run(&svc, None, contiguous(0, &[a.clone(), b.clone()])).await;
        let summary = result.unwrap();

        assert_eq!(summary.bytes_stored, 2048);
        assert_eq!(summary.resume_offset, 0);
        assert_eq!(statuses[0], Chunk::status(FILE, 0));
        assert_eq!(stored(&svc).await, [a, b].concat());
        assert!(svc.active().is_empty());
    }

    #[tokio::test]
    async fn replayed_prefix_is_left_untouched() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let prefix = pattern(1024, 7);
        let tail = pattern(1024, 9);
        seed_file(&svc, &prefix).await;

        let (result, statuses) =
            run(&svc, None, contiguous(0, &[prefix.clone(), tail.clone()])).await;
        let summary = result.unwrap();

        assert_eq!(statuses[0].offset, 1024);
        assert_eq!(summary.chunks_skipped, 1);
        assert_eq!(summary.bytes_stored, 2048);
        assert_eq!(stored(&svc).await, [prefix, tail].concat());
    }

    #[tokio::test]
    async fn replaying_durable_ranges_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let original = pattern(3000, 3);
        seed_file(&svc, &original).await;

        let replays = vec![
            chunk(0, 0, &pattern(1000, 99)),
            chunk(1500, 1, &pattern(700, 42)),
            chunk(2999, 2, &pattern(10, 5)),
        ];
        let (result, _) = run(&svc, None, replays).await;

        assert_eq!(result.unwrap().chunks_skipped, 3);
        assert_eq!(stored(&svc).await, original);
    }

    #[tokio::test]
    async fn appends_concatenate_in_order() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let payloads: Vec<Vec<u8>> = [1usize, 500, 4096, 7, 70_000]
            .iter()
            .enumerate()
            .map(|(i, len)| pattern(*len, i as u8))
            .collect();

        let (result, _) = run(&svc, None, contiguous(0, &payloads)).await;

        let total: usize = payloads.iter().map(Vec::len).sum();
        assert_eq!(result.unwrap().bytes_stored, total as u64);
        assert_eq!(stored(&svc).await, payloads.concat());
    }

    #[tokio::test]
    async fn status_follows_each_mebibyte_boundary() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let payloads: Vec<Vec<u8>> = (0..5).map(|i| pattern(300 * 1024, i)).collect();

        let (result, statuses) = run(&svc, None, contiguous(0, &payloads)).await;
        result.unwrap();

        let offsets: Vec<u64> = statuses.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0, 4 * 300 * 1024]);
        assert!(statuses.iter().all(Chunk::is_status));
    }

    #[tokio::test]
    async fn cancellation_keeps_exactly_the_accepted_chunks() {
        let dir = TempDir::new().unwrap();
        let settings = TransferSettings {
            status_interval: 100,
            ..TransferSettings::default()
        };
        let svc = service_with(&dir, settings, TokenIssuer::unsigned());

        let (server, mut peer) = QueueChannel::pair(16);
        let task = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.stream_file(server, None).await })
        };

        let payloads: Vec<Vec<u8>> = (0..4).map(|i| pattern(100, i)).collect();
        let chunks = contiguous(0, &payloads);
        assert_eq!(peer.rx.recv().await.unwrap().offset, 0);
        for (k, c) in chunks.iter().take(3).enumerate() {
            peer.send(c.clone()).await.unwrap();
            let status = peer.rx.recv().await.unwrap();
            assert_eq!(status.offset, 100 * (k as u64 + 1));
        }

        peer.cancel();
        let _ = peer.send(chunks[3].clone()).await;

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(err.code(), Code::Cancelled);
        assert_eq!(stored(&svc).await, payloads[..3].concat());
    }

    #[tokio::test]
    async fn disconnect_surfaces_fault_and_keeps_bytes() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let payloads: Vec<Vec<u8>> = (0..2).map(|i| pattern(512, i)).collect();

        let (server, peer) = QueueChannel::pair(16);
        let task = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.stream_file(server, None).await })
        };
        for c in contiguous(0, &payloads) {
            peer.send(c).await.unwrap();
        }
        peer.fail(ChannelError::Disconnected("connection reset".into()))
            .await;

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            TransferError::Transport(ChannelError::Disconnected(_))
        ));
        assert_eq!(stored(&svc).await, payloads.concat());
        assert_eq!(svc.stored_len(FILE).await.unwrap(), 1024);
    }

    #[tokio::test]
    async fn stream_without_data_is_invalid() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let (result, statuses) = run(&svc, None, vec![]).await;
        assert_eq!(result.unwrap_err().code(), Code::InvalidArgument);
        assert!(statuses.is_empty());
    }

    #[tokio::test]
    async fn first_chunk_needs_a_usable_file_id() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        for bad in ["", "../escape", "a/b", ".hidden", "nul\0byte"] {
            let mut c = chunk(0, 0, b"x");
            c.file_id = bad.into();
            let (result, _) = run(&svc, None, vec![c]).await;
            assert_eq!(result.unwrap_err().code(), Code::InvalidArgument, "{bad:?}");
        }
        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn foreign_file_id_mid_stream_is_rejected() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let mut second = chunk(1, 1, b"y");
        second.file_id = "file_other".into();

        let (result, _) = run(&svc, None, vec![chunk(0, 0, b"x"), second]).await;

        assert_eq!(result.unwrap_err().code(), Code::InvalidArgument);
        assert_eq!(stored(&svc).await, b"x");
    }

    #[tokio::test]
    async fn signed_tokens_are_checked() {
        let dir = TempDir::new().unwrap();
        let issuer = TokenIssuer::with_secret("shared");
        let svc = service_with(&dir, TransferSettings::default(), issuer.clone());

        let (result, _) = run(&svc, None, vec![chunk(0, 0, b"x")]).await;
        assert_eq!(result.unwrap_err().code(), Code::Unauthenticated);

        let (result, _) = run(&svc, Some("bogus".into()), vec![chunk(0, 0, b"x")]).await;
        assert_eq!(result.unwrap_err().code(), Code::Unauthenticated);

        let other_file_token = issuer.issue("file_other");
        let (result, _) = run(&svc, Some(other_file_token), vec![chunk(0, 0, b"x")]).await;
        assert_eq!(result.unwrap_err().code(), Code::Unauthenticated);

        let (result, _) = run(&svc, Some(issuer.issue(FILE)), vec![chunk(0, 0, b"x")]).await;
        assert_eq!(result.unwrap().bytes_stored, 1);
    }

    #[tokio::test]
    async fn trusted_offsets_append_past_a_gap() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let (result, _) = run(&svc, None, vec![chunk(0, 0, b"ab"), chunk(10, 1, b"cd")]).await;
        assert_eq!(result.unwrap().bytes_stored, 4);
        assert_eq!(stored(&svc).await, b"abcd");
    }

    #[tokio::test]
    async fn strict_offsets_reject_gaps() {
        let dir = TempDir::new().unwrap();
        let settings = TransferSettings {
            offset_policy: OffsetPolicy::Strict,
            ..TransferSettings::default()
        };
        let svc = service_with(&dir, settings, TokenIssuer::unsigned());

        let (result, _) = run(&svc, None, vec![chunk(0, 0, b"ab"), chunk(10, 1, b"cd")]).await;
        assert_eq!(result.unwrap_err().code(), Code::InvalidArgument);
        assert_eq!(stored(&svc).await, b"ab");
    }

    #[tokio::test]
    async fn strict_offsets_append_only_the_unseen_suffix() {
        let dir = TempDir::new().unwrap();
        let settings = TransferSettings {
            offset_policy: OffsetPolicy::Strict,
            ..TransferSettings::default()
        };
        let svc = service_with(&dir, settings, TokenIssuer::unsigned());
        seed_file(&svc, b"hello").await;

        let (result, _) = run(&svc, None, vec![chunk(3, 0, b"lo, world")]).await;
        assert_eq!(result.unwrap().bytes_stored, 12);
        assert_eq!(stored(&svc).await, b"hello, world");
    }

    #[tokio::test]
    async fn lost_status_sends_do_not_fail_the_stream() {
        let dir = TempDir::new().unwrap();
        let settings = TransferSettings {
            status_interval: 4,
            ..TransferSettings::default()
        };
        let svc = service_with(&dir, settings, TokenIssuer::unsigned());

        let (server, mut peer) = QueueChannel::pair(16);
        let task = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.stream_file(server, None).await })
        };
        peer.send(chunk(0, 0, b"abcd")).await.unwrap();
        assert_eq!(peer.rx.recv().await.unwrap(), Chunk::status(FILE, 0));

        // Nobody reads statuses from here on.
        peer.rx.close();
        peer.send(chunk(4, 1, b"efgh")).await.unwrap();
        drop(peer);

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.bytes_stored, 8);
        assert_eq!(stored(&svc).await, b"abcdefgh");
    }

    #[tokio::test]
    async fn unwritable_target_is_internal_and_appends_nothing() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        // A directory where the payload file should be.
        fs::create_dir_all(svc.file_path(FILE)).await.unwrap();

        let (result, statuses) = run(&svc, None, vec![chunk(0, 0, b"abc")]).await;

        let err = result.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(statuses.is_empty());
        let mut entries = fs::read_dir(svc.file_path(FILE)).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
        assert!(svc.active().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn failed_append_is_internal() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        if !Path::new("/dev/full").exists() {
            return;
        }
        let path = svc.file_path(FILE);
        fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        std::os::unix::fs::symlink("/dev/full", &path).unwrap();

        let (result, statuses) = run(&svc, None, vec![chunk(0, 0, b"abc")]).await;

        let err = result.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(
            matches!(err, TransferError::Internal { context: "file write failed", .. }),
            "{err:?}"
        );
        assert_eq!(statuses, vec![Chunk::status(FILE, 0)]);
        assert!(svc.active().is_empty());
    }

    #[tokio::test]
    async fn synced_appends_store_every_chunk() {
        let dir = TempDir::new().unwrap();
        let settings = TransferSettings {
            sync_each_chunk: true,
            offset_policy: OffsetPolicy::Strict,
            ..TransferSettings::default()
        };
        let svc = service_with(&dir, settings, TokenIssuer::unsigned());
        let payloads: Vec<Vec<u8>> = (0..3).map(|i| pattern(2048, i)).collect();

        let (result, _) = run(&svc, None, contiguous(0, &payloads)).await;

        let summary = result.unwrap();
        assert_eq!(summary.bytes_stored, 3 * 2048);
        assert_eq!(summary.chunks_written, 3);
        assert_eq!(stored(&svc).await, payloads.concat());
    }

    #[tokio::test]
    async fn concurrent_streams_for_one_file_take_turns() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let first = pattern(300, 1);
        let second = pattern(200, 2);

        let (server_a, mut peer_a) = QueueChannel::pair(16);
        let task_a = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.stream_file(server_a, None).await })
        };
        peer_a.send(chunk(0, 0, &first[..100])).await.unwrap();
        assert_eq!(peer_a.rx.recv().await.unwrap().offset, 0);

        // The second stream starts from scratch while the first still holds the file.
        let (server_b, mut peer_b) = QueueChannel::pair(16);
        let task_b = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.stream_file(server_b, None).await })
        };
        peer_b.send(chunk(0, 0, &second[..10])).await.unwrap();
        let early =
            tokio::time::timeout(std::time::Duration::from_millis(100), peer_b.rx.recv()).await;
        assert!(early.is_err(), "second stream opened the file while the first held it");

        peer_a.send(chunk(100, 1, &first[100..])).await.unwrap();
        drop(peer_a.finish());
        let summary_a = task_a.await.unwrap().unwrap();
        assert_eq!(summary_a.bytes_stored, 300);

        let resume = peer_b.rx.recv().await.unwrap();
        assert_eq!(resume, Chunk::status(FILE, summary_a.bytes_stored));
        peer_b.send(chunk(300, 1, &second)).await.unwrap();
        drop(peer_b.finish());

        let summary_b = task_b.await.unwrap().unwrap();
        assert_eq!(summary_b.resume_offset, 300);
        assert_eq!(summary_b.chunks_skipped, 1);
        assert_eq!(stored(&svc).await, [first, second].concat());
        assert!(svc.active().is_empty());
    }

    #[derive(Default)]
    struct Recorder {
        finished: Mutex<Vec<(String, u64, String)>>,
    }

    impl UploadObserver for Recorder {
        fn upload_started<'a>(
            &'a self,
            _file_id: &'a str,
            _resume_offset: u64,
        ) -> crate::services::observer::ObserverFuture<'a> {
            Box::pin(async {})
        }

        fn upload_finished<'a>(
            &'a self,
            file_id: &'a str,
            bytes_stored: u64,
            checksum: String,
        ) -> crate::services::observer::ObserverFuture<'a> {
            Box::pin(async move {
                self.finished
                    .lock()
                    .unwrap()
                    .push((file_id.to_string(), bytes_stored, checksum));
            })
        }
    }

    #[tokio::test]
    async fn clean_end_reports_length_and_checksum() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let svc = TransferService::new(
            dir.path(),
            TransferSettings::default(),
            TokenIssuer::unsigned(),
            recorder.clone(),
        );

        let (result, _) = run(&svc, None, vec![chunk(0, 0, b"abc")]).await;
        let summary = result.unwrap();

        let expected = format!("{:x}", md5::compute(b"abc"));
        assert_eq!(summary.checksum, expected);
        let finished = recorder.finished.lock().unwrap().clone();
        assert_eq!(finished, vec![(FILE.to_string(), 3, expected)]);
    }

    #[tokio::test]
    async fn files_are_sharded_under_the_root() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let path = svc.file_path("file_abc");
        let rel = path.strip_prefix(dir.path()).unwrap();
        let parts: Vec<_> = rel.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 2);
        assert_eq!(parts[2], "file_abc");
    }
}

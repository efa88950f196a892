//! Direct peer-to-peer file transfer over TCP.
//!
//! One connection carries one file: the sender offers it with `FileTransferRequest`,
//! the receiver answers with `FileTransferResponse`, and on acceptance the raw bytes
//! follow on the same stream. Receiving is gated by an [`AcceptPolicy`].

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use lanshare_core::checksum::{sha256_file, verify_file, ChecksumError};
use lanshare_core::wire::{receive_message, send_message, WireError};
use lanshare_core::{Body, ChecksumAlgorithm, Message};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::TransferMetrics;

const REJECTED_REASON: &str = "Transfer rejected by recipient";
const SAVE_PATH_ATTEMPTS: usize = 16;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),

    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: SocketAddr, reason: String },

    #[error("timed out")]
    Timeout,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Checksum(#[from] ChecksumError),

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("incomplete transfer: {transferred} of {expected} bytes")]
    Incomplete { transferred: u64, expected: u64 },

    #[error("no free port in {from}..={to}")]
    NoFreePort { from: u16, to: u16 },
}

/// What the sender learned from a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered { bytes: u64 },
    Rejected { reason: Option<String> },
}

/// What the receiver did with one incoming offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Rejected,
    Saved { path: PathBuf },
    /// Checksum mismatch. `path` is `None` when the file was deleted.
    VerificationFailed { path: Option<PathBuf> },
    /// Stream ended early; the partial file was removed.
    Incomplete { received: u64, expected: u64 },
}

/// Incoming offer as seen by the accept policy.
#[derive(Debug, Clone)]
pub struct TransferOffer {
    pub file_name: String,
    pub file_size: u64,
    pub from: SocketAddr,
    pub checksum: String,
}

/// Emitted after a file was received and verified.
#[derive(Debug, Clone)]
pub struct FileReceived {
    pub file_name: String,
    pub saved_path: PathBuf,
    pub from: SocketAddr,
}

/// What to do with a received file whose checksum does not match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MismatchPolicy {
    #[default]
    Keep,
    Delete,
}

type Decide = dyn Fn(TransferOffer) -> BoxFuture<'static, bool> + Send + Sync;

/// Decides whether to accept an incoming transfer. Always bounded by the accept timeout;
/// no answer in time means reject.
#[derive(Clone)]
pub struct AcceptPolicy(Arc<Decide>);

impl AcceptPolicy {
    pub fn accept_all() -> Self {
        Self::from_fn(|_| true)
    }

    pub fn reject_all() -> Self {
        Self::from_fn(|_| false)
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&TransferOffer) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(move |offer| {
            let answer = f(&offer);
            async move { answer }.boxed()
        }))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(TransferOffer) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        Self(Arc::new(move |offer| f(offer).boxed()))
    }

    /// Ask on stdin: `y`/`yes` accepts, anything else (or EOF) rejects.
    ///
    /// One reader task owns stdin for the life of the policy, so a prompt abandoned on
    /// timeout does not swallow the answer to the next one.
    pub fn console_prompt() -> Self {
        Self::line_prompt(stdin_lines)
    }

    fn line_prompt<F>(open: F) -> Self
    where
        F: Fn() -> mpsc::UnboundedReceiver<String> + Send + Sync + 'static,
    {
        let open = Arc::new(open);
        let source: Arc<tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>> = Arc::default();
        Self::from_async(move |offer: TransferOffer| {
            let open = open.clone();
            let source = source.clone();
            async move {
                let mut slot = source.lock().await;
                let lines = slot.get_or_insert_with(|| open());
                // typed before this question was asked
                while lines.try_recv().is_ok() {}
                println!(
                    "\nIncoming file from {}: {} ({} bytes). Accept? [y/N]",
                    offer.from, offer.file_name, offer.file_size
                );
                lines
                    .recv()
                    .await
                    .is_some_and(|line| matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
            }
        })
    }

    pub async fn decide(&self, offer: TransferOffer, timeout: Duration) -> bool {
        let name = offer.file_name.clone();
        match tokio::time::timeout(timeout, (self.0)(offer)).await {
            Ok(answer) => answer,
            Err(_) => {
                info!(file = %name, "accept decision timed out, rejecting");
                false
            }
        }
    }
}

fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

impl Default for AcceptPolicy {
    fn default() -> Self {
        Self::reject_all()
    }
}

impl std::fmt::Debug for AcceptPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AcceptPolicy(..)")
    }
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FileSender {
    pub buffer_size: usize,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
}

impl FileSender {
    /// Offer `path` to the receiver at `addr` and stream it if accepted.
    /// A rejection is `Ok(SendOutcome::Rejected)`, not an error.
    pub async fn send_file(&self, addr: SocketAddr, path: &Path) -> Result<SendOutcome, TransferError> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransferError::FileNotFound(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        if !meta.is_file() {
            return Err(TransferError::NotAFile(path.to_path_buf()));
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::NotAFile(path.to_path_buf()))?;
        let checksum = sha256_file(path).await?;

        debug!(%addr, file = %file_name, "connecting");
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                return Err(TransferError::Connect {
                    addr,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(TransferError::Connect {
                    addr,
                    reason: "timed out".into(),
                })
            }
        };
        let _ = stream.set_nodelay(true);
        self.send_over(stream, path, &file_name, meta.len(), &checksum).await
    }

    /// The exchange after connecting. Generic so tests can drive it over in-memory pipes.
    pub(crate) async fn send_over<S>(
        &self,
        mut stream: S,
        path: &Path,
        file_name: &str,
        file_size: u64,
        checksum: &str,
    ) -> Result<SendOutcome, TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = Message::transfer_request(file_name, file_size, checksum);
        send_message(&mut stream, &request, self.io_timeout).await?;

        let response = receive_message(&mut stream, self.io_timeout)
            .await?
            .ok_or(TransferError::Protocol("connection closed before response"))?;
        let (accepted, error_message) = match response.body {
            Body::FileTransferResponse {
                accepted,
                error_message,
                ..
            } => (accepted, error_message),
            _ => return Err(TransferError::Protocol("expected FileTransferResponse")),
        };
        if !accepted {
            info!(file = %file_name, reason = error_message.as_deref().unwrap_or(""), "transfer rejected");
            return Ok(SendOutcome::Rejected {
                reason: error_message,
            });
        }

        // the offer fixed the size; bytes appended since then are not sent
        let mut file = tokio::fs::File::open(path).await?.take(file_size);
        let mut metrics = TransferMetrics::start("send");
        let mut buf = vec![0u8; self.buffer_size.max(1)];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            tokio::time::timeout(self.io_timeout, stream.write_all(&buf[..n]))
                .await
                .map_err(|_| TransferError::Timeout)??;
            metrics.record(n as u64, file_size);
        }
        tokio::time::timeout(self.io_timeout, stream.flush())
            .await
            .map_err(|_| TransferError::Timeout)??;
        metrics.finish();

        if metrics.bytes_transferred != file_size {
            return Err(TransferError::Incomplete {
                transferred: metrics.bytes_transferred,
                expected: file_size,
            });
        }
        let _ = stream.shutdown().await;
        Ok(SendOutcome::Delivered {
            bytes: metrics.bytes_transferred,
        })
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReceiverSettings {
    pub download_directory: PathBuf,
    pub buffer_size: usize,
    pub accept_timeout: Duration,
    pub io_timeout: Duration,
    pub mismatch_policy: MismatchPolicy,
}

struct Shared {
    settings: ReceiverSettings,
    policy: RwLock<AcceptPolicy>,
    events: broadcast::Sender<FileReceived>,
}

struct Running {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct FileReceiver {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl FileReceiver {
    pub fn new(settings: ReceiverSettings) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                settings,
                policy: RwLock::new(AcceptPolicy::default()),
                events,
            }),
            running: Mutex::new(None),
        }
    }

    pub fn set_policy(&self, policy: AcceptPolicy) {
        *self.shared.policy.write() = policy;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FileReceived> {
        self.shared.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Actual bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.addr)
    }

    /// Bind `port`, or the first free port in `port+1..=port+search_range` if it is taken,
    /// and start accepting. Returns the address actually bound.
    pub async fn start(&self, port: u16, search_range: u16) -> Result<SocketAddr, TransferError> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }
        let listener = bind_with_fallback(port, search_range).await?;
        let addr = listener.local_addr()?;
        if port != 0 && addr.port() != port {
            warn!(configured = port, actual = addr.port(), "listen port taken, using fallback");
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, self.shared.clone(), cancel.clone()));
        info!(%addr, "file receiver listening");

        let mut slot = self.running.lock();
        if let Some(existing) = slot.as_ref() {
            cancel.cancel();
            return Ok(existing.addr);
        }
        *slot = Some(Running { addr, cancel, task });
        Ok(addr)
    }

    /// Stop accepting and release the port. Transfers already in progress finish on their own.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.cancel.cancel();
        let _ = running.task.await;
        info!(addr = %running.addr, "file receiver stopped");
    }

    /// Run one incoming exchange on an already-accepted stream.
    pub async fn receive<S>(&self, stream: S, from: SocketAddr) -> Result<ReceiveOutcome, TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        receive_one(stream, from, &self.shared).await
    }
}

impl Drop for FileReceiver {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

async fn bind_with_fallback(port: u16, search_range: u16) -> Result<TcpListener, TransferError> {
    match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
        Ok(l) => return Ok(l),
        Err(e) if port == 0 => return Err(e.into()),
        Err(e) => debug!(port, error = %e, "configured port unavailable"),
    }
    let last = port.saturating_add(search_range);
    for candidate in port.saturating_add(1)..=last {
        if let Ok(l) = TcpListener::bind((Ipv4Addr::UNSPECIFIED, candidate)).await {
            return Ok(l);
        }
    }
    Err(TransferError::NoFreePort { from: port, to: last })
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let (stream, from) = tokio::select! {
            _ = cancel.cancelled() => break,
            r = listener.accept() => match r {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };
        let _ = stream.set_nodelay(true);
        let shared = shared.clone();
        tokio::spawn(async move {
            match receive_one(stream, from, &shared).await {
                Ok(ReceiveOutcome::Saved { path }) => info!(%from, path = %path.display(), "file received"),
                Ok(ReceiveOutcome::Rejected) => info!(%from, "offer rejected"),
                Ok(ReceiveOutcome::VerificationFailed { path }) => {
                    warn!(%from, kept = ?path, "checksum verification failed")
                }
                Ok(ReceiveOutcome::Incomplete { received, expected }) => {
                    warn!(%from, received, expected, "transfer incomplete, partial file removed")
                }
                Err(e) => warn!(%from, error = %e, "incoming transfer failed"),
            }
        });
    }
}

async fn receive_one<S>(mut stream: S, from: SocketAddr, shared: &Shared) -> Result<ReceiveOutcome, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let settings = &shared.settings;
    let request = receive_message(&mut stream, settings.io_timeout)
        .await?
        .ok_or(TransferError::Protocol("connection closed before request"))?;
    let (file_name, file_size, checksum) = match request.body {
        Body::FileTransferRequest {
            file_name,
            file_size,
            checksum,
        } => (file_name, file_size, checksum),
        _ => return Err(TransferError::Protocol("expected FileTransferRequest")),
    };
    info!(%from, file = %file_name, size = file_size, "incoming offer");

    let Some(safe_name) = sanitize_file_name(&file_name) else {
        warn!(%from, file = %file_name, "unusable file name, rejecting");
        let nack = Message::transfer_response(false, file_name, file_size, checksum, Some("Invalid file name".into()));
        send_message(&mut stream, &nack, settings.io_timeout).await?;
        return Ok(ReceiveOutcome::Rejected);
    };

    let offer = TransferOffer {
        file_name: safe_name.clone(),
        file_size,
        from,
        checksum: checksum.clone(),
    };
    let policy = shared.policy.read().clone();
    let accepted = policy.decide(offer, settings.accept_timeout).await;

    if !accepted {
        let nack = Message::transfer_response(false, file_name, file_size, checksum, Some(REJECTED_REASON.into()));
        send_message(&mut stream, &nack, settings.io_timeout).await?;
        return Ok(ReceiveOutcome::Rejected);
    }

    tokio::fs::create_dir_all(&settings.download_directory).await?;
    let (path, file) = create_unique(&settings.download_directory, &safe_name).await?;
    let ack = Message::transfer_response(true, file_name.clone(), file_size, checksum.clone(), None);
    if let Err(e) = send_message(&mut stream, &ack, settings.io_timeout).await {
        drop(file);
        let _ = tokio::fs::remove_file(&path).await;
        return Err(e.into());
    }

    let received = match stream_to_file(&mut stream, file, file_size, settings).await {
        Ok(n) => n,
        Err(e) => {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }
    };
    if received != file_size {
        let _ = tokio::fs::remove_file(&path).await;
        return Ok(ReceiveOutcome::Incomplete {
            received,
            expected: file_size,
        });
    }

    if !checksum.trim().is_empty() && !verify_file(&path, &checksum, ChecksumAlgorithm::Sha256).await? {
        error!(file = %path.display(), "checksum mismatch");
        return Ok(match settings.mismatch_policy {
            MismatchPolicy::Keep => ReceiveOutcome::VerificationFailed { path: Some(path) },
            MismatchPolicy::Delete => {
                let _ = tokio::fs::remove_file(&path).await;
                ReceiveOutcome::VerificationFailed { path: None }
            }
        });
    }

    // No subscribers is fine.
    let _ = shared.events.send(FileReceived {
        file_name: safe_name,
        saved_path: path.clone(),
        from,
    });
    Ok(ReceiveOutcome::Saved { path })
}

/// Copy exactly `expected` bytes (or until EOF) from the stream into `file`.
async fn stream_to_file<S>(
    stream: &mut S,
    mut file: tokio::fs::File,
    expected: u64,
    settings: &ReceiverSettings,
) -> Result<u64, TransferError>
where
    S: AsyncRead + Unpin,
{
    let mut metrics = TransferMetrics::start("recv");
    let mut buf = vec![0u8; settings.buffer_size.max(1)];
    let mut remaining = expected;
    while remaining > 0 {
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = tokio::time::timeout(settings.io_timeout, stream.read(&mut buf[..want]))
            .await
            .map_err(|_| TransferError::Timeout)??;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        remaining -= n as u64;
        metrics.record(n as u64, expected);
    }
    file.flush().await?;
    file.sync_all().await?;
    metrics.finish();
    Ok(metrics.bytes_transferred)
}

/// Reduce an offered name to its final path component. `None` if nothing usable remains.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next()?.trim();
    if last.is_empty() || last == "." || last == ".." || last.contains('\0') {
        return None;
    }
    Some(last.to_owned())
}

/// `dir/name`, or `dir/stem_1.ext`, `dir/stem_2.ext`, ... if taken.
pub async fn unique_save_path(dir: &Path, file_name: &str) -> PathBuf {
    let first = dir.join(file_name);
    if !exists(&first).await {
        return first;
    }
    let name = Path::new(file_name);
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_owned());
    let ext = name.extension().map(|e| e.to_string_lossy().into_owned());
    let mut n = 1u32;
    loop {
        let candidate = match &ext {
            Some(ext) => dir.join(format!("{}_{}.{}", stem, n, ext)),
            None => dir.join(format!("{}_{}", stem, n)),
        };
        if !exists(&candidate).await {
            return candidate;
        }
        n += 1;
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Create the destination without ever overwriting; retries if another transfer wins the name.
async fn create_unique(dir: &Path, file_name: &str) -> std::io::Result<(PathBuf, tokio::fs::File)> {
    let mut last_err = None;
    for _ in 0..SAVE_PATH_ATTEMPTS {
        let path = unique_save_path(dir, file_name).await;
        match tokio::fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(f) => return Ok((path, f)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::AlreadyExists, "no free file name")))
}

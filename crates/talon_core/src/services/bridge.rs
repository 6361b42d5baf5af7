//! Subprocess query bridge.
//!
//! Runs queries through the server's command-line client and turns its JSON output into
//! rows. Streaming mode reads line-delimited JSON incrementally; rows are yielded as soon
//! as a complete line is available.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::task::{ready, Context, Poll};

use futures_util::Stream;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::error::{Result, TalonError};
use crate::models::{AuthMethod, CertificateBundle, Credentials, RowDecoder, StreamingRow};
use crate::services::credentials::CredentialStore;
use crate::services::identity::ClientIdentity;

const READ_CHUNK: usize = 8 * 1024;
const ROW_CHANNEL_CAPACITY: usize = 256;

/// Accumulates output bytes and hands back complete lines.
///
/// A line split across reads is held until its newline arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete line, without the line terminator.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let Some(last_newline) = self.buf.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let rest = self.buf.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buf, rest);

        complete[..complete.len() - 1]
            .split(|&b| b == b'\n')
            .map(|line| {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                String::from_utf8_lossy(line).into_owned()
            })
            .collect()
    }

    /// Take whatever is left once the output has ended.
    pub fn finish(&mut self) -> Option<String> {
        let taken = std::mem::take(&mut self.buf);
        let rest = taken.strip_suffix(b"\r").unwrap_or(&taken);
        if rest.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(rest).into_owned())
        }
    }

    /// Bytes waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Rows from a running query.
///
/// Yields data rows in output order, then either the end-of-stream marker or an error.
/// Dropping the stream or calling [`RowStream::cancel`] terminates the subprocess.
pub struct RowStream {
    rx: mpsc::Receiver<Result<StreamingRow>>,
    cancel: CancellationToken,
    completed: CancellationToken,
    finished: bool,
}

impl RowStream {
    /// Terminate the subprocess. The next poll yields `Cancelled`, rows still buffered
    /// are discarded, and the stream ends.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this query when triggered.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Triggered once the subprocess has been reaped, whether it finished, failed or
    /// was cancelled.
    pub fn completion_token(&self) -> CancellationToken {
        self.completed.clone()
    }
}

impl Stream for RowStream {
    type Item = Result<StreamingRow>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        if self.cancel.is_cancelled() {
            self.finished = true;
            self.rx.close();
            return Poll::Ready(Some(Err(TalonError::Cancelled)));
        }

        let next = ready!(self.rx.poll_recv(cx));
        self.finished = match &next {
            Some(Ok(row)) => row.is_end_of_stream(),
            Some(Err(_)) | None => true,
        };
        Poll::Ready(next)
    }
}

impl Drop for RowStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for RowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream").field("cancelled", &self.cancel.is_cancelled()).finish()
    }
}

/// Output format requested from the client executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    JsonLines,
    JsonArray,
}

impl OutputFormat {
    fn as_arg(self) -> &'static str {
        match self {
            Self::JsonLines => "jsonl",
            Self::JsonArray => "json",
        }
    }
}

/// Runs queries through the command-line client.
pub struct SubprocessBridge {
    config: BridgeConfig,
    // Keeps activated bundle files alive while the store points at them
    bundle_dir: Mutex<Option<TempDir>>,
}

impl SubprocessBridge {
    /// Create a bridge for the configured client executable.
    pub fn new(config: BridgeConfig) -> Self {
        Self { config, bundle_dir: Mutex::new(None) }
    }

    /// Active bridge configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn config_path(&self) -> Result<&Path> {
        self.config.config_path.as_deref().ok_or_else(|| {
            TalonError::not_configured("No client config file set for the query bridge")
        })
    }

    fn query_command(&self, query: &str, format: OutputFormat) -> Result<Command> {
        let mut cmd = Command::new(&self.config.executable);
        cmd.arg("query")
            .arg("--config")
            .arg(self.config_path()?)
            .arg("--format")
            .arg(format.as_arg())
            .arg(query)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    fn spawn(&self, mut cmd: Command) -> Result<Child> {
        cmd.spawn().map_err(|e| {
            TalonError::process(
                None,
                format!("Failed to launch {}: {e}", self.config.executable.display()),
            )
        })
    }

    /// Run a query and stream rows as the subprocess produces them.
    pub fn execute_streaming(&self, query: &str) -> Result<RowStream> {
        let mut child = self.spawn(self.query_command(query, OutputFormat::JsonLines)?)?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(TalonError::internal("Subprocess pipes were not captured"));
        };

        tracing::debug!(query = %query, pid = ?child.id(), "Streaming query started");

        let (tx, rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let completed = CancellationToken::new();
        let stderr_task = tokio::spawn(read_bounded(stderr, self.config.stderr_limit_bytes));
        tokio::spawn(pump_rows(child, stdout, stderr_task, tx, cancel.clone(), completed.clone()));

        Ok(RowStream { rx, cancel, completed, finished: false })
    }

    /// Run a query and collect its result array. The end-of-stream marker is the last row.
    pub async fn execute(&self, query: &str) -> Result<Vec<StreamingRow>> {
        let child = self.spawn(self.query_command(query, OutputFormat::JsonArray)?)?;
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TalonError::process(None, format!("Failed to read query output: {e}")))?;

        if !output.status.success() {
            return Err(TalonError::process(
                output.status.code(),
                bounded_text(&output.stderr, self.config.stderr_limit_bytes),
            ));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let mut decoder = RowDecoder::new();
        let mut rows = Vec::new();
        if !text.trim().is_empty() {
            let parsed: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| TalonError::decoding_with_source("Query output is not valid JSON", e))?;
            let serde_json::Value::Array(items) = parsed else {
                return Err(TalonError::decoding("Query output is not a JSON array"));
            };
            rows.extend(items.into_iter().filter_map(|item| decoder.decode_value(item)));
        }

        tracing::debug!(query = %query, rows = rows.len(), "Query finished");
        rows.push(decoder.finish());
        Ok(rows)
    }

    /// Version reported by the client executable.
    pub async fn version(&self) -> Result<String> {
        let mut cmd = Command::new(&self.config.executable);
        cmd.arg("version").stdin(Stdio::null()).kill_on_drop(true);
        let output = cmd.output().await.map_err(|e| {
            TalonError::process(
                None,
                format!("Failed to launch {}: {e}", self.config.executable.display()),
            )
        })?;

        if !output.status.success() {
            return Err(TalonError::process(
                output.status.code(),
                bounded_text(&output.stderr, self.config.stderr_limit_bytes),
            ));
        }
        Ok(parse_version(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Activate mutual TLS from an extracted bundle.
    ///
    /// The PEMs are written to an owner-only temporary directory that lives as long as
    /// this bridge or until the next activation. Invalid material is rejected before the
    /// store is touched.
    pub fn activate_bundle(
        &self,
        store: &CredentialStore,
        server_url: &str,
        bundle: &CertificateBundle,
    ) -> Result<Credentials> {
        validate_bundle(bundle)?;
        let dir = tempfile::Builder::new().prefix("talon-identity-").tempdir().map_err(|e| {
            TalonError::storage(format!("Failed to create identity directory: {e}"), None)
        })?;

        let credentials = configure_from_dir(store, server_url, bundle, dir.path())?;
        *self.bundle_dir.lock() = Some(dir);
        Ok(credentials)
    }

    /// Like [`activate_bundle`](Self::activate_bundle) but keeps the PEMs in `dir`, so the
    /// stored credentials survive a restart.
    pub fn install_bundle(
        &self,
        store: &CredentialStore,
        server_url: &str,
        bundle: &CertificateBundle,
        dir: &Path,
    ) -> Result<Credentials> {
        validate_bundle(bundle)?;
        create_private_dir(dir)?;
        configure_from_dir(store, server_url, bundle, dir)
    }
}

impl std::fmt::Debug for SubprocessBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubprocessBridge").field("config", &self.config).finish()
    }
}

fn validate_bundle(bundle: &CertificateBundle) -> Result<()> {
    ClientIdentity::from_bytes(
        bundle.client_certificate().as_bytes(),
        bundle.private_key().as_bytes(),
        Some(bundle.ca_certificate().as_bytes()),
    )?;
    Ok(())
}

fn configure_from_dir(
    store: &CredentialStore,
    server_url: &str,
    bundle: &CertificateBundle,
    dir: &Path,
) -> Result<Credentials> {
    let cert_path = write_private(dir, "client.crt", bundle.client_certificate())?;
    let key_path = write_private(dir, "client.key", bundle.private_key())?;
    let ca_path = write_private(dir, "ca.crt", bundle.ca_certificate())?;

    let method = AuthMethod::mutual_tls(cert_path, key_path).with_ca(ca_path);
    let credentials = store.configure(server_url, method)?;
    tracing::info!(
        common_name = %bundle.common_name(),
        dir = %dir.display(),
        "Activated certificate bundle"
    );
    Ok(credentials)
}

fn create_private_dir(dir: &Path) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir).map_err(|e| {
        TalonError::storage(format!("Failed to create {}: {e}", dir.display()), None)
    })
}

fn write_private(dir: &Path, name: &str, contents: &str) -> Result<PathBuf> {
    use std::io::Write;

    let path = dir.join(name);
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(&path)
        .map_err(|e| TalonError::storage(format!("Failed to create {name}: {e}"), None))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| TalonError::storage(format!("Failed to write {name}: {e}"), None))?;
    Ok(path)
}

/// Prefer a `version:` field, fall back to the first non-empty line.
fn parse_version(stdout: &str) -> String {
    let lines = || stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    lines()
        .find_map(|line| line.strip_prefix("version:").map(|v| v.trim().to_string()))
        .or_else(|| lines().next().map(String::from))
        .unwrap_or_default()
}

fn bounded_text(bytes: &[u8], limit: usize) -> String {
    let kept = &bytes[..bytes.len().min(limit)];
    String::from_utf8_lossy(kept).trim().to_string()
}

/// Drain a pipe completely but keep at most `limit` bytes.
async fn read_bounded<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> String {
    let mut kept = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) => {
                tracing::debug!(error = %e, "Stopped reading subprocess stderr");
                break;
            }
        }
    }
    bounded_text(&kept, limit)
}

/// Why the pump stopped before delivering its final item.
enum Halt {
    Cancelled,
    ConsumerGone,
}

/// Send one item unless the query is cancelled first.
async fn deliver(
    tx: &mpsc::Sender<Result<StreamingRow>>,
    item: Result<StreamingRow>,
    cancel: &CancellationToken,
) -> Result<(), Halt> {
    select! {
        biased;
        _ = cancel.cancelled() => Err(Halt::Cancelled),
        sent = tx.send(item) => sent.map_err(|_| Halt::ConsumerGone),
    }
}

async fn pump_rows<R: AsyncRead + Unpin>(
    mut child: Child,
    stdout: R,
    stderr_task: tokio::task::JoinHandle<String>,
    tx: mpsc::Sender<Result<StreamingRow>>,
    cancel: CancellationToken,
    completed: CancellationToken,
) {
    let _completed = completed.drop_guard();

    match stream_rows(&mut child, stdout, stderr_task, &tx, &cancel).await {
        Ok(()) => {}
        Err(Halt::Cancelled) => {
            tracing::debug!(pid = ?child.id(), "Cancelling streaming query");
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "Subprocess already exited");
            }
        }
        Err(Halt::ConsumerGone) => {
            tracing::debug!("Row consumer went away, stopping query");
            let _ = child.kill().await;
        }
    }
}

async fn stream_rows<R: AsyncRead + Unpin>(
    child: &mut Child,
    mut stdout: R,
    stderr_task: tokio::task::JoinHandle<String>,
    tx: &mpsc::Sender<Result<StreamingRow>>,
    cancel: &CancellationToken,
) -> Result<(), Halt> {
    let mut lines = LineBuffer::new();
    let mut decoder = RowDecoder::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let read = select! {
            biased;
            _ = cancel.cancelled() => return Err(Halt::Cancelled),
            r = stdout.read(&mut chunk) => r,
        };

        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let _ = child.start_kill();
                let err = TalonError::process(None, format!("Failed to read query output: {e}"));
                return deliver(tx, Err(err), cancel).await;
            }
        };

        for line in lines.push(&chunk[..n]) {
            if let Some(row) = decoder.decode_line(&line) {
                deliver(tx, Ok(row), cancel).await?;
            }
        }
    }

    if let Some(row) = lines.finish().and_then(|line| decoder.decode_line(&line)) {
        deliver(tx, Ok(row), cancel).await?;
    }

    let status = select! {
        biased;
        _ = cancel.cancelled() => return Err(Halt::Cancelled),
        s = child.wait() => s,
    };
    let stderr = stderr_task.await.unwrap_or_default();

    let outcome = match status {
        Ok(status) if status.success() => {
            tracing::debug!(rows = decoder.rows_emitted(), "Streaming query finished");
            Ok(decoder.finish())
        }
        Ok(status) => {
            tracing::warn!(exit_code = ?status.code(), "Streaming query failed");
            Err(TalonError::process(status.code(), stderr))
        }
        Err(e) => Err(TalonError::process(None, format!("Failed to wait for subprocess: {e}"))),
    };
    deliver(tx, outcome, cancel).await
}

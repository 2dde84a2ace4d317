//! Push status stream handling
//!
//! Container engines report push progress as a sequence of JSON objects, one
//! per line. [`scan_statuses`] decodes them on a background task, drops the
//! noisy address-specific lines and forwards the rest through a bounded
//! channel, so a slow renderer throttles the network read. Along the way it
//! picks up the image digest that newer engines print in a status line.
//! Older engines put the digest in an `aux` payload instead; those records
//! reach the consumer, which hands them to [`display_statuses`]'s callback.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::io::{self, Write};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Records buffered between the decoding task and the consumer
pub const STATUS_CHANNEL_CAPACITY: usize = 16;

lazy_static! {
    // Newer engines end the stream with a status like
    // "<tag>: digest: sha256:cafe...9012 size: 1819"
    static ref DIGEST_STATUS_RE: Regex = Regex::new(r"digest: (sha256:[a-f0-9]{64})").unwrap();
}

/// One decoded status record
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub progress_detail: Option<ProgressDetail>,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub error_detail: Option<ErrorDetail>,
    /// Legacy plain error text
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub aux: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProgressDetail {
    #[serde(default)]
    pub current: Option<i64>,
    #[serde(default)]
    pub total: Option<i64>,
}

/// Structured error reported inside the status stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Error)]
#[error("{message}")]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
}

impl StatusRecord {
    /// The error this record reports, if any
    pub fn failure(&self) -> Option<ErrorDetail> {
        if let Some(detail) = &self.error_detail {
            return Some(detail.clone());
        }
        self.error.as_ref().map(|message| ErrorDetail {
            code: None,
            message: message.clone(),
        })
    }

    /// Digest embedded in the status text by newer engines
    pub fn digest_from_status(&self) -> Option<String> {
        let status = self.status.as_deref()?;
        DIGEST_STATUS_RE
            .captures(status)
            .and_then(|captures| captures.get(1))
            .map(|digest| digest.as_str().to_string())
    }

    fn is_suppressed(&self, skips: &[String]) -> bool {
        match self.status.as_deref() {
            Some(status) => skips.iter().any(|skip| status.contains(skip.as_str())),
            None => false,
        }
    }
}

/// Failure while consuming a filtered status stream
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Remote(#[from] ErrorDetail),
}

/// Consumer end of a status scan started by [`scan_statuses`]
pub struct FilteredStatuses {
    records: mpsc::Receiver<StatusRecord>,
    digest_rx: Option<oneshot::Receiver<String>>,
    digest: Option<String>,
}

impl FilteredStatuses {
    /// Next record that survived filtering, or `None` once the scan ended
    pub async fn next(&mut self) -> Option<StatusRecord> {
        self.records.recv().await
    }

    /// First digest found in a status line so far.
    ///
    /// The digest is published before the record carrying it is forwarded,
    /// so once [`next`](Self::next) has returned that record, or `None`,
    /// this reflects it.
    pub fn digest(&mut self) -> Option<&str> {
        if self.digest.is_none() {
            if let Some(rx) = self.digest_rx.as_mut() {
                match rx.try_recv() {
                    Ok(digest) => {
                        self.digest = Some(digest);
                        self.digest_rx = None;
                    }
                    Err(TryRecvError::Closed) => self.digest_rx = None,
                    Err(TryRecvError::Empty) => {}
                }
            }
        }
        self.digest.as_deref()
    }
}

/// Start filtering a raw status stream.
///
/// Records whose status contains any of `skips` are dropped. An undecodable
/// record or a read error ends the scan quietly; records already forwarded
/// stay valid. Dropping the returned [`FilteredStatuses`] stops the scan.
pub fn scan_statuses<R>(input: R, skips: Vec<String>) -> FilteredStatuses
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (records_tx, records) = mpsc::channel(STATUS_CHANNEL_CAPACITY);
    let (digest_tx, digest_rx) = oneshot::channel();

    tokio::spawn(forward_statuses(input, skips, records_tx, digest_tx));

    FilteredStatuses {
        records,
        digest_rx: Some(digest_rx),
        digest: None,
    }
}

async fn forward_statuses<R>(
    input: R,
    skips: Vec<String>,
    records: mpsc::Sender<StatusRecord>,
    digest_tx: oneshot::Sender<String>,
) where
    R: AsyncRead + Unpin,
{
    let mut digest_tx = Some(digest_tx);
    let mut lines = BufReader::new(input).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("scan statuses: {}", e);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record: StatusRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                warn!("scan statuses: {}", e);
                break;
            }
        };

        if let Some(digest) = record.digest_from_status() {
            if let Some(tx) = digest_tx.take() {
                debug!("Found digest in push status: {}", digest);
                let _ = tx.send(digest);
            }
        }

        if record.is_suppressed(&skips) {
            continue;
        }

        if records.send(record).await.is_err() {
            debug!("Status consumer went away, stopping scan");
            break;
        }
    }
}

/// Render filtered records to `out` until the scan ends.
///
/// Records with an `aux` payload go to `on_aux` instead of being printed.
/// A record reporting an error stops rendering with [`StatusError::Remote`].
pub async fn display_statuses<W, F>(
    statuses: &mut FilteredStatuses,
    out: &mut W,
    mut on_aux: F,
) -> std::result::Result<(), StatusError>
where
    W: Write + ?Sized,
    F: FnMut(&serde_json::Value),
{
    while let Some(record) = statuses.next().await {
        if let Some(aux) = &record.aux {
            on_aux(aux);
            continue;
        }
        if let Some(failure) = record.failure() {
            out.flush()?;
            return Err(StatusError::Remote(failure));
        }
        render_status(out, &record)?;
    }
    out.flush()?;
    Ok(())
}

/// Write one record as a plain line.
///
/// Progress bar updates are skipped: they only make sense on a terminal
/// that can redraw them in place.
pub fn render_status<W: Write + ?Sized>(out: &mut W, record: &StatusRecord) -> io::Result<()> {
    if let Some(stream) = &record.stream {
        return write!(out, "{}", stream);
    }
    if record.progress.as_deref().is_some_and(|p| !p.is_empty()) {
        return Ok(());
    }

    let status = record.status.as_deref().unwrap_or_default();
    if status.is_empty() && record.id.is_none() {
        return Ok(());
    }

    if let Some(id) = &record.id {
        write!(out, "{}: ", id)?;
    }
    writeln!(out, "{}", status)
}

#[derive(Deserialize)]
struct AuxDigest {
    #[serde(default, alias = "Digest")]
    digest: String,
}

/// Digest carried in an `aux` payload by older engines
pub fn digest_from_aux(aux: &serde_json::Value) -> Option<String> {
    match AuxDigest::deserialize(aux) {
        Ok(parsed) if !parsed.digest.is_empty() => Some(parsed.digest),
        Ok(_) => None,
        Err(e) => {
            warn!("extract digest: {}", e);
            None
        }
    }
}

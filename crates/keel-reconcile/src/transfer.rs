//! Chunked artifact transfer.
//!
//! Artifacts are pushed to a registry replica over one client-streaming
//! upload. The blob is split into frames of at most `chunk_size` bytes, each
//! tagged with the destination filename. Closing the stream signals
//! completion; the replica commits only then, so a failed push leaves nothing
//! half-written behind.
//!
//! ```text
//! 10000 bytes, chunk 4096:  [4096] [4096] [1808] close -> Ack
//!     0 bytes, chunk 4096:  [0] close -> Ack
//! ```
//!
//! Re-pushing is idempotent because the replica overwrites by filename.

use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::artifact::ArtifactKey;
use crate::error::{Error, Result};
use crate::metrics::TransferMetrics;
use crate::remote::{Ack, Code, Frame, RegistryClient, RemoteError, RemoteResult, call};

/// Largest payload a single frame may carry.
pub const MAX_FRAME_PAYLOAD: usize = 4096;

/// Validates a chunk size.
///
/// # Errors
///
/// Returns [`Error::Config`] unless `1 <= chunk_size <= MAX_FRAME_PAYLOAD`.
pub fn validate_chunk_size(chunk_size: usize) -> Result<usize> {
    if (1..=MAX_FRAME_PAYLOAD).contains(&chunk_size) {
        Ok(chunk_size)
    } else {
        Err(Error::Config(format!(
            "chunk size must be between 1 and {MAX_FRAME_PAYLOAD}, got {chunk_size}"
        )))
    }
}

/// Splits `content` into frames addressed to `filename`.
///
/// An empty artifact yields one empty frame so the filename still reaches the
/// replica. Frames share the underlying buffer.
#[must_use]
pub fn frames(filename: &str, content: &Bytes, chunk_size: usize) -> Vec<Frame> {
    let chunk_size = chunk_size.clamp(1, MAX_FRAME_PAYLOAD);
    if content.is_empty() {
        return vec![Frame {
            target_filename: filename.to_string(),
            content: Bytes::new(),
        }];
    }
    (0..content.len())
        .step_by(chunk_size)
        .map(|start| Frame {
            target_filename: filename.to_string(),
            content: content.slice(start..(start + chunk_size).min(content.len())),
        })
        .collect()
}

/// Pushes an artifact to one replica.
///
/// Each frame send and the final close are bounded by `timeout`. Any failure
/// aborts the whole push; the caller retries from the first frame.
///
/// # Errors
///
/// Returns the classified error of the first failing step.
pub async fn push(
    client: &dyn RegistryClient,
    key: &ArtifactKey,
    content: &Bytes,
    chunk_size: usize,
    timeout: Duration,
) -> Result<Ack> {
    let chunk_size = validate_chunk_size(chunk_size)?;
    let filename = key.filename();
    let metrics = TransferMetrics::new();
    let mut sink = call("registry.upload", timeout, client.upload()).await?;

    for (index, frame) in frames(&filename, content, chunk_size).into_iter().enumerate() {
        let size = frame.content.len();
        if let Err(err) = call("registry.send", timeout, sink.send(frame)).await {
            tracing::warn!(%filename, frame = index, error = %err, "artifact push aborted");
            metrics.record_aborted();
            return Err(err);
        }
        metrics.record_frame(size);
    }

    let ack = call("registry.close", timeout, sink.close_and_recv()).await?;
    tracing::info!(%filename, size = ack.size, "artifact committed");
    Ok(ack)
}

/// Removes a pushed artifact by filename. Absence counts as success.
///
/// # Errors
///
/// Returns any classified error other than `NotFound`.
pub async fn delete(client: &dyn RegistryClient, filename: &str, timeout: Duration) -> Result<()> {
    match call("registry.delete", timeout, client.delete_artifact(filename)).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_found() => {
            tracing::debug!(%filename, "artifact already absent");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Receiving side of an upload.
///
/// Validates each frame and yields the artifact only when the stream closes.
#[derive(Debug)]
pub struct Reassembler {
    max_frame: usize,
    filename: Option<String>,
    buffer: BytesMut,
}

impl Reassembler {
    /// Creates a reassembler accepting frames up to `max_frame` bytes.
    #[must_use]
    pub fn new(max_frame: usize) -> Self {
        Self {
            max_frame,
            filename: None,
            buffer: BytesMut::new(),
        }
    }

    /// Accepts one frame.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an oversized frame, an empty filename, or
    /// a filename that differs from the first frame's.
    pub fn push(&mut self, frame: Frame) -> RemoteResult<()> {
        if frame.content.len() > self.max_frame {
            return Err(RemoteError::new(
                Code::InvalidArgument,
                format!(
                    "frame of {} bytes exceeds limit of {}",
                    frame.content.len(),
                    self.max_frame
                ),
            ));
        }
        if frame.target_filename.is_empty() {
            return Err(RemoteError::new(
                Code::InvalidArgument,
                "frame has no target filename",
            ));
        }
        match &self.filename {
            Some(existing) if *existing != frame.target_filename => {
                return Err(RemoteError::new(
                    Code::InvalidArgument,
                    format!(
                        "frame for {} in upload of {existing}",
                        frame.target_filename
                    ),
                ));
            }
            Some(_) => {}
            None => self.filename = Some(frame.target_filename),
        }
        self.buffer.extend_from_slice(&frame.content);
        Ok(())
    }

    /// Completes the upload.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if no frame was received.
    pub fn finish(self) -> RemoteResult<(String, Bytes)> {
        let filename = self.filename.ok_or_else(|| {
            RemoteError::new(Code::InvalidArgument, "upload closed before any frame")
        })?;
        Ok((filename, self.buffer.freeze()))
    }
}

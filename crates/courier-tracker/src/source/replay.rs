//! Replays recorded fixes from a newline-delimited JSON file.
//!
//! Each non-empty line is a [`LocationFix`]:
//! `{"latitude":10.75,"longitude":106.66,"timestamp":"2024-05-01T08:05:00Z"}`.
//! Fixes are delivered `batch_size` at a time, one batch per deferred
//! interval; the stream ends normally after the last batch.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::{Batcher, FixStream, LocationSource, PermissionState, UpdateOptions};
use crate::error::{Error, Result};
use crate::tracking::LocationFix;

/// Location source reading recorded fixes from disk.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    path: PathBuf,
    batch_size: usize,
}

impl ReplaySource {
    /// Create a replay source for `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, batch_size: usize) -> Self {
        Self {
            path: path.into(),
            batch_size: batch_size.max(1),
        }
    }

    /// The recording being replayed.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse a recording, reporting the first malformed line.
pub(crate) fn parse_recording(text: &str) -> Result<Vec<LocationFix>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|e| {
                Error::subscription(format!("replay line {}: {e}", index + 1))
            })
        })
        .collect()
}

#[async_trait::async_trait]
impl LocationSource for ReplaySource {
    fn name(&self) -> &'static str {
        "replay"
    }

    async fn request_foreground_permission(&self) -> Result<PermissionState> {
        Ok(PermissionState::Granted)
    }

    async fn request_background_permission(&self) -> Result<PermissionState> {
        Ok(PermissionState::Granted)
    }

    async fn subscribe(&self, options: UpdateOptions) -> Result<FixStream> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        let recorded = parse_recording(&text)?;
        debug!(path = %self.path.display(), fixes = recorded.len(), "Replaying recording");

        let mut batcher = Batcher::new(&options);
        let mut batches = Vec::new();
        for chunk in recorded.chunks(self.batch_size) {
            for fix in chunk {
                batcher.push(*fix);
            }
            batches.extend(batcher.take());
        }

        let (tx, fixes) = FixStream::channel(1);
        let producer = tokio::spawn(async move {
            for batch in batches {
                tokio::time::sleep(options.deferred_interval).await;
                if tx.send(Ok(batch)).await.is_err() {
                    break;
                }
            }
        });

        Ok(fixes.with_producer(producer.abort_handle()))
    }
}

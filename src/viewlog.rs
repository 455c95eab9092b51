//! Best-effort view logging.
//!
//! Playback hands records to a bounded queue; a background forwarder posts
//! them to the remote log sheet. Delivery is at-most-once: failures are
//! logged locally and dropped, and playback never waits on the sink.

use crate::media::ViewLogRecord;
use crate::surface::LogSink;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const QUEUE_DEPTH: usize = 64;

/// Log sink posting records to the Apps Script web endpoint.
pub struct ScriptLogSink {
    client: reqwest::Client,
    url: String,
}

impl ScriptLogSink {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl LogSink for ScriptLogSink {
    async fn post(&self, record: &ViewLogRecord) -> Result<()> {
        self.client
            .post(&self.url)
            .json(record)
            .send()
            .await
            .context("Failed to post view log")?
            .error_for_status()
            .context("Log sink returned error")?;
        Ok(())
    }
}

/// Handle for enqueueing view records. Cheap to clone.
#[derive(Clone)]
pub struct ViewLogger {
    tx: mpsc::Sender<ViewLogRecord>,
}

impl ViewLogger {
    /// Spawn the forwarder task and return the enqueue handle.
    pub fn spawn(sink: Arc<dyn LogSink>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ViewLogRecord>(QUEUE_DEPTH);

        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(err) = sink.post(&record).await {
                    tracing::warn!(
                        "Dropping view log for content {}: {}",
                        record.content_id,
                        err
                    );
                }
            }
        });

        (Self { tx }, handle)
    }

    /// Enqueue a record without blocking. A full queue drops the record.
    pub fn record(&self, record: ViewLogRecord) {
        if self.tx.try_send(record).is_err() {
            tracing::warn!("View log queue full, dropping record");
        }
    }
}

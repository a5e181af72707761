//! Best-effort upload of chat transcripts to the device registry.
//!
//! A bounded queue decouples the conversational path from the backend: the
//! session enqueues with `try_send` and never waits, a worker task drains the
//! queue and fires each upload as a detached subtask. A full queue or a
//! failed upload is logged and dropped.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use murmur_core::registry::{ChatReport, DeviceRegistry};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const QUEUE_CAPACITY: usize = 64;

#[derive(Debug)]
enum ReportItem {
    Chat {
        report: ChatReport,
        /// Reserved for utterance audio; uploads are text-only for now.
        audio: Option<Bytes>,
        at: DateTime<Utc>,
    },
    /// Tells the worker to stop draining and exit.
    Shutdown,
}

/// Cloneable handle to the session's reporting queue.
#[derive(Clone)]
pub struct ReportSink {
    tx: mpsc::Sender<ReportItem>,
}

impl ReportSink {
    /// Starts the drain worker and returns the handle to feed it.
    pub fn spawn(registry: Arc<dyn DeviceRegistry>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ReportItem>(QUEUE_CAPACITY);
        let handle = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    ReportItem::Chat { report, audio, at } => {
                        debug!(kind = ?report.kind, at = %at, has_audio = audio.is_some(), "uploading chat report");
                        let registry = registry.clone();
                        tokio::spawn(async move {
                            if let Err(e) = registry.report_chat(report).await {
                                warn!(error = ?e, "chat report upload failed");
                            }
                        });
                    }
                    ReportItem::Shutdown => break,
                }
            }
            info!("report worker stopped");
        });
        (Self { tx }, handle)
    }

    /// Enqueues one transcript line without waiting. Dropped when the queue
    /// is full.
    pub fn submit(&self, report: ChatReport) {
        let item = ReportItem::Chat {
            report,
            audio: None,
            at: Utc::now(),
        };
        if let Err(e) = self.tx.try_send(item) {
            warn!(error = %e, "report queue full, dropping transcript line");
        }
    }

    /// Signals the worker to exit. Does not wait for in-flight uploads.
    pub fn shutdown(&self) {
        let _ = self.tx.try_send(ReportItem::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use murmur_core::registry::{ConfigOverlay, RegistryError, ReportKind};
    use std::time::Duration;

    struct RecordingRegistry {
        uploads: mpsc::UnboundedSender<ChatReport>,
    }

    #[async_trait]
    impl DeviceRegistry for RecordingRegistry {
        async fn fetch_device_config(
            &self,
            _device_id: &str,
            _client_id: &str,
        ) -> Result<ConfigOverlay, RegistryError> {
            Ok(ConfigOverlay::default())
        }

        async fn report_chat(&self, report: ChatReport) -> Result<()> {
            self.uploads.send(report).unwrap();
            Ok(())
        }
    }

    fn report(text: &str) -> ChatReport {
        ChatReport {
            device_id: "AA:BB".into(),
            session_id: "s1".into(),
            kind: ReportKind::Asr,
            text: text.into(),
        }
    }

    #[tokio::test]
    async fn submitted_reports_reach_the_registry() {
        let (uploads_tx, mut uploads_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(RecordingRegistry { uploads: uploads_tx });
        let (sink, worker) = ReportSink::spawn(registry);

        sink.submit(report("hello"));
        sink.submit(report("world"));

        let first = tokio::time::timeout(Duration::from_secs(1), uploads_rx.recv())
            .await
            .expect("upload timed out")
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), uploads_rx.recv())
            .await
            .expect("upload timed out")
            .unwrap();
        assert_eq!(first.text, "hello");
        assert_eq!(second.text, "world");

        sink.shutdown();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_the_worker_without_draining() {
        let (uploads_tx, _uploads_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(RecordingRegistry { uploads: uploads_tx });
        let (sink, worker) = ReportSink::spawn(registry);

        sink.shutdown();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker did not stop")
            .unwrap();

        // Submitting after shutdown is harmless.
        sink.submit(report("late"));
    }
}

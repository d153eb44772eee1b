//! End-to-end tests driving `Bus` over the in-memory broker.

mod queue_test;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use crate::bus::Bus;
use crate::config::BusSettings;
use crate::transport::MemoryBroker;

/// A broker plus a scratch directory for queue maps.
pub(crate) struct Harness {
    pub broker: MemoryBroker,
    dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            broker: MemoryBroker::new(),
            dir: TempDir::new().unwrap(),
        }
    }

    /// Settings whose queue map lives in `<scratch>/<map>`.
    pub fn settings(&self, map: &str) -> BusSettings {
        BusSettings {
            queues_file: Some(self.dir.path().join(map).display().to_string()),
            ..Default::default()
        }
    }

    pub async fn bus(&self) -> Arc<Bus> {
        self.bus_with(self.settings("queues")).await
    }

    pub async fn bus_with(&self, settings: BusSettings) -> Arc<Bus> {
        Bus::connect(settings, Arc::new(self.broker.connect()))
            .await
            .unwrap()
    }

    /// Waits until `queue` holds `count` ready messages.
    pub async fn wait_for_count(&self, queue: &str, count: usize) {
        let reached = timeout(Duration::from_secs(2), async {
            while self.broker.message_count(queue) != Some(count) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(
            reached.is_ok(),
            "queue {} never reached {} messages (has {:?})",
            queue,
            count,
            self.broker.message_count(queue)
        );
    }
}

pub(crate) async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for handler")
        .expect("handler channel closed")
}

/// Asserts nothing else arrives for a short while.
pub(crate) async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    if let Ok(Some(extra)) = timeout(Duration::from_millis(100), rx.recv()).await {
        panic!("unexpected extra message: {:?}", extra);
    }
}

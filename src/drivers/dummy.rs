//! Driver that observes nothing. Useful for printers without network
//! access and for exercising the manager.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::info;

use super::{Driver, DriverContext, DriverHealth};
use crate::error::Result;

const IDLE_TICK: Duration = Duration::from_secs(60);

pub struct DummyDriver {
    ctx: DriverContext,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DummyDriver {
    pub fn new(ctx: DriverContext) -> Self {
        Self {
            ctx,
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Driver for DummyDriver {
    fn driver_key(&self) -> &'static str {
        "dummy"
    }

    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let running = Arc::clone(&self.running);
        let handle = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                tokio::time::sleep(IDLE_TICK).await;
            }
        });
        *self.task.lock().unwrap() = Some(handle);
        info!("Dummy driver started for printer {}", self.ctx.printer_id);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            info!("Dummy driver stopped for printer {}", self.ctx.printer_id);
        }
        Ok(())
    }

    fn health(&self) -> DriverHealth {
        let running = self.running.load(Ordering::SeqCst);
        DriverHealth::new(self.driver_key(), self.ctx.printer_id, running, running).with_detail("status", "ok")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::testing;
    use serde_json::json;

    #[tokio::test]
    async fn test_start_stop_is_idempotent() {
        let (ctx, _rx) = testing::context(1, json!({}));
        let driver = DummyDriver::new(ctx);

        driver.stop().await.unwrap();
        driver.start().await.unwrap();
        driver.start().await.unwrap();
        assert!(driver.health().running);
        assert_eq!(driver.health().details["status"], "ok");

        driver.stop().await.unwrap();
        assert!(!driver.health().running);
        driver.stop().await.unwrap();
    }
}

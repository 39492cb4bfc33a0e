use std::sync::Arc;
use std::time::Duration;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info};

use crate::services::booking::{BookingSaga, SweepReport};

/// Периодическая уборка: просроченные pending-бронирования → timeout.
pub struct CleanupService {
    saga: Arc<BookingSaga>,
    interval: Duration,
}

impl CleanupService {
    pub fn new(saga: Arc<BookingSaga>, interval_seconds: u64) -> Self {
        Self {
            saga,
            interval: Duration::from_secs(interval_seconds.max(1)),
        }
    }

    /// Один проход. Ошибки только в лог: следующий проход повторит.
    pub async fn run_once(&self) -> Option<SweepReport> {
        info!("🧹 Starting expired booking sweep");
        match self.saga.sweep_expired_bookings().await {
            Ok(report) => {
                if report.expired + report.skipped + report.failed == 0 {
                    info!("🎫 No expired bookings to cleanup");
                } else {
                    info!(
                        expired = report.expired,
                        skipped = report.skipped,
                        failed = report.failed,
                        "✅ Booking sweep completed"
                    );
                }
                Some(report)
            }
            Err(e) => {
                error!(error = %e, "booking sweep failed");
                None
            }
        }
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.run_once().await;
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
            info!("cleanup loop stopped");
        })
    }
}

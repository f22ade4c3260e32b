//! Periodic local status poll
//!
//! Keeps the selected device id and pairing indicator fresh while the
//! phone is on the display's setup network. Purely best-effort: failures
//! are logged at debug level and otherwise ignored.

use super::{DevicePortal, StatusReport};
use crate::auth::{AuthSession, DeviceStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Handle to a running poll; dropping it stops the poll
pub struct StatusPoller {
    cancelled: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl StatusPoller {
    pub fn spawn(portal: Arc<DevicePortal>, session: Arc<AuthSession>, every: Duration) -> Self {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if flag.load(Ordering::Acquire) {
                    break;
                }
                poll_once(&portal, &session, &flag).await;
            }
            debug!("Status poll stopped");
        });

        Self { cancelled, handle }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.handle.abort();
    }

}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// One poll round. Returns whether a report was applied; a report that
/// arrives after cancellation is discarded.
pub async fn poll_once(portal: &DevicePortal, session: &AuthSession, cancelled: &AtomicBool) -> bool {
    let report = match portal.status().await {
        Ok(Some(report)) => report,
        Ok(None) => return false,
        Err(e) => {
            debug!("Local status poll failed: {}", e);
            return false;
        }
    };

    if cancelled.load(Ordering::Acquire) {
        debug!("Discarding status report after cancellation");
        return false;
    }

    apply_status(session, &report);
    true
}

pub fn apply_status(session: &AuthSession, report: &StatusReport) {
    if let Some(id) = &report.device_id {
        session.set_device_id(Some(id.clone()));
    }
    match report.wifi_connected {
        Some(true) => session.set_device_status(DeviceStatus::PairedOnline),
        Some(false) => session.set_device_status(DeviceStatus::PairedOffline),
        None => {}
    }
}

//! Notification sink for transient user-facing messages.

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastVariant {
    Info,
    Success,
    Warning,
    Error,
}

pub trait Notifier {
    fn toast(&self, message: &str, variant: ToastVariant) -> Result<()>;
}

/// Deliver a toast, logging instead of failing when delivery breaks.
pub fn notify_best_effort(notifier: &dyn Notifier, message: &str, variant: ToastVariant) {
    if let Err(err) = notifier.toast(message, variant) {
        warn!(err = %err, "toast delivery failed");
    }
}

/// Notifier that only logs; used when no platform UI is attached.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn toast(&self, message: &str, variant: ToastVariant) -> Result<()> {
        info!(?variant, "{message}");
        Ok(())
    }
}

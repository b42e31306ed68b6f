//! Hand-off point for mail addressed to non-local domains.
//!
//! The session only identifies a recipient as remote and delegates; routing
//! policy and delivery live behind this trait. The default implementation
//! records the hand-off and drops the message, since queue durability is out
//! of scope here.

use anyhow::Result;
use async_trait::async_trait;
use log::info;

/// Delayed-delivery seam for non-local recipients.
#[async_trait]
pub trait RelayQueue: Send + Sync {
    /// Enqueues one message for later delivery to `recipient` at `domain`.
    async fn enqueue(&self, domain: &str, from: &str, recipient: &str, data: &[u8])
        -> Result<()>;
}

/// Relay that logs each hand-off and discards the message.
#[derive(Debug, Default)]
pub struct LoggingRelay;

#[async_trait]
impl RelayQueue for LoggingRelay {
    async fn enqueue(
        &self,
        domain: &str,
        from: &str,
        recipient: &str,
        data: &[u8],
    ) -> Result<()> {
        info!(
            "relaying {} bytes from {} to {} via {}",
            data.len(),
            from,
            recipient,
            domain
        );
        Ok(())
    }
}

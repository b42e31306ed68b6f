//! The mail repository contract and its in-memory implementation.
//!
//! The session only ever sees the trait: a lookup from username-or-address to
//! a known local mailbox, and a durable append of a delivered message. A
//! relational backend can be slotted in behind the same seam.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::smtp::Address;

/// Storage seam the session delivers through.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Looks up a local mailbox by username (local part) or full address,
    /// returning the first match.
    async fn find_mailbox(&self, username_or_address: &str) -> Option<Address>;

    /// Durably persists one delivered message. Must be safe under concurrent
    /// invocation.
    async fn save_email(
        &self,
        recipient: &Address,
        from: &str,
        tos: &str,
        data: &[u8],
    ) -> Result<()>;
}

/// One persisted message as the repository received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEmail {
    /// The local recipient this copy was stored for.
    pub recipient: String,
    /// Formatted reverse-path.
    pub from: String,
    /// Comma-joined formatted forward-paths of the whole envelope.
    pub tos: String,
    /// Raw message body.
    pub data: Vec<u8>,
}

/// In-memory repository: a fixed mailbox table plus an append-only message
/// log behind a mutex. Backs the binary and the test suites; not durable.
#[derive(Default)]
pub struct MemoryRepository {
    mailboxes: Vec<Address>,
    emails: Mutex<Vec<StoredEmail>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mailboxes(mailboxes: Vec<Address>) -> Self {
        Self {
            mailboxes,
            emails: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of everything saved so far.
    pub fn emails(&self) -> Vec<StoredEmail> {
        self.emails
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn find_mailbox(&self, username_or_address: &str) -> Option<Address> {
        self.mailboxes
            .iter()
            .find(|mailbox| {
                mailbox.address == username_or_address
                    || mailbox.local_part() == username_or_address
            })
            .cloned()
    }

    async fn save_email(
        &self,
        recipient: &Address,
        from: &str,
        tos: &str,
        data: &[u8],
    ) -> Result<()> {
        let mut emails = self
            .emails
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        emails.push(StoredEmail {
            recipient: recipient.address.clone(),
            from: from.to_string(),
            tos: tos.to_string(),
            data: data.to_vec(),
        });
        Ok(())
    }
}

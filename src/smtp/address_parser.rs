//! Parses RFC 5322 address syntax into the (display-name, mailbox) pair the
//! session and repository work with.

use std::fmt;

use anyhow::{anyhow, bail, Result};
use mailparse::{addrparse, MailAddr};

/// A parsed mail address: an optional display name plus the mailbox itself.
///
/// Immutable once parsed. The `Display` implementation produces the canonical
/// form used on the wire and in the repository: `<user@domain>` or
/// `Name <user@domain>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// Display name, if the input carried one (`Bob <bob@example.com>`).
    pub name: Option<String>,
    /// The bare mailbox, e.g. `bob@example.com`.
    pub address: String,
}

impl Address {
    /// Parses a single address from `input`.
    ///
    /// Accepts the forms `user@domain`, `<user@domain>`, and
    /// `Name <user@domain>`. Group syntax, address lists, and mailboxes
    /// without an `@` are rejected.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let parsed =
            addrparse(input).map_err(|e| anyhow!("invalid address {:?}: {}", input, e))?;
        if parsed.len() != 1 {
            bail!("expected exactly one address, got {:?}", input);
        }
        match &parsed[0] {
            MailAddr::Single(info) if info.addr.contains('@') => Ok(Address {
                name: info.display_name.clone(),
                address: info.addr.clone(),
            }),
            MailAddr::Single(_) => bail!("address {:?} has no domain part", input),
            MailAddr::Group(_) => bail!("group syntax is not accepted: {:?}", input),
        }
    }

    /// The part before the first `@`, used for mailbox lookup by username.
    pub fn local_part(&self) -> &str {
        self.address
            .split_once('@')
            .map_or(self.address.as_str(), |(local, _)| local)
    }

    /// The part after the first `@`, or `None` for a degenerate mailbox.
    pub fn domain(&self) -> Option<&str> {
        self.address.split_once('@').map(|(_, domain)| domain)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => write!(f, "{} <{}>", name, self.address),
            _ => write!(f, "<{}>", self.address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_mailbox() {
        let addr = Address::parse("alice@example.com").unwrap();
        assert_eq!(addr.name, None);
        assert_eq!(addr.address, "alice@example.com");
        assert_eq!(addr.to_string(), "<alice@example.com>");
    }

    #[test]
    fn parses_angle_bracket_form() {
        let addr = Address::parse("<alice@example.com>").unwrap();
        assert_eq!(addr.address, "alice@example.com");
    }

    #[test]
    fn parses_display_name() {
        let addr = Address::parse("Alice Archer <alice@example.com>").unwrap();
        assert_eq!(addr.name.as_deref(), Some("Alice Archer"));
        assert_eq!(addr.to_string(), "Alice Archer <alice@example.com>");
    }

    #[test]
    fn local_part_and_domain() {
        let addr = Address::parse("alice@example.com").unwrap();
        assert_eq!(addr.local_part(), "alice");
        assert_eq!(addr.domain(), Some("example.com"));
    }

    #[test]
    fn rejects_missing_domain() {
        assert!(Address::parse("alice").is_err());
        assert!(Address::parse("").is_err());
    }

    #[test]
    fn rejects_address_lists() {
        assert!(Address::parse("a@example.com, b@example.com").is_err());
    }
}

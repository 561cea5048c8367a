//! Stateless address transforms between the external correspondent, the
//! proxy sub-address and the private mailbox.
//!
//! Nomenclature used across the crate:
//! - *third party*, the external sender writing to a proxy address
//! - *proxy address*, any `local@{domain}` address of the relay domain
//! - *private account*, the upstream mailbox the relay forwards to

use std::{fmt::Display, sync::LazyLock};

use lettre::message::Mailbox;
use regex::Regex;

static NON_ALPHANUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[^A-Za-z0-9]+").expect("valid pattern"));

/// Result type for address operations.
pub type AddressResult<T> = Result<T, AddressError>;

/// Errors that can occur while splitting or parsing addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// The address has no `@` separator.
    MissingAt(String),
    /// The address could not be parsed as an RFC 5322 mailbox.
    Malformed(String),
}

impl Display for AddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressError::MissingAt(address) => write!(f, "Address has no '@': {address}"),
            AddressError::Malformed(address) => write!(f, "Malformed address: {address}"),
        }
    }
}

impl std::error::Error for AddressError {}

/// A parsed mailbox, display name kept apart from the address itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailAddress {
    pub name: Option<String>,
    pub address: String,
}

impl MailAddress {
    /// Creates a new [`MailAddress`], an empty name is treated as absent.
    pub fn new(name: Option<String>, address: String) -> Self {
        Self {
            name: name.filter(|n| !n.is_empty()),
            address,
        }
    }
}

impl Display for MailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} <{}>", self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Parses a single RFC 5322 mailbox such as `Peter <peter@example.com>`
/// or a bare `peter@example.com`.
///
/// # Examples
///
/// ```rust
/// let parsed = mailrelay_utils::parse_address("Peter Sanford <psanford@example.com>").unwrap();
/// assert_eq!(parsed.name.as_deref(), Some("Peter Sanford"));
/// assert_eq!(parsed.address, "psanford@example.com");
/// ```
pub fn parse_address(value: &str) -> AddressResult<MailAddress> {
    let mailbox: Mailbox = value
        .trim()
        .parse()
        .map_err(|_| AddressError::Malformed(value.to_string()))?;
    Ok(MailAddress::new(mailbox.name, mailbox.email.to_string()))
}

/// Splits an address on its last `@`, returning `(local, domain)`.
///
/// ```rust
/// let (local, domain) = mailrelay_utils::extract_domain_local_part("me@proxy.example.com").unwrap();
/// assert_eq!((local, domain), ("me", "proxy.example.com"));
/// ```
pub fn extract_domain_local_part(address: &str) -> AddressResult<(&str, &str)> {
    address
        .rsplit_once('@')
        .ok_or_else(|| AddressError::MissingAt(address.to_string()))
}

/// Replaces every maximal run of characters outside `[A-Za-z0-9]` with a
/// single `_`.
///
/// ```rust
/// assert_eq!(mailrelay_utils::sanitize("first.last--x"), "first_last_x");
/// assert_eq!(mailrelay_utils::sanitize("a_b"), "a_b");
/// ```
pub fn sanitize(local_part: &str) -> String {
    NON_ALPHANUMERIC.replace_all(local_part, "_").into_owned()
}

/// Builds the sub-addressed private mailbox that a message sent to
/// `destination_local_part@{proxy domain}` is forwarded to.
pub fn proxy_forward_address(
    private_mailbox: &str,
    private_domain: &str,
    destination_local_part: &str,
) -> String {
    format!(
        "{private_mailbox}+{}@{private_domain}",
        sanitize(destination_local_part)
    )
}

/// The configured private account, split into mailbox and domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateAccount {
    address: String,
    at: usize,
}

impl PrivateAccount {
    /// Parses the private address, failing when no `@` is present.
    pub fn parse(address: &str) -> AddressResult<Self> {
        let at = address
            .rfind('@')
            .ok_or_else(|| AddressError::MissingAt(address.to_string()))?;
        Ok(Self {
            address: address.to_string(),
            at,
        })
    }

    /// Returns the full private address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns the part before the `@`.
    pub fn mailbox(&self) -> &str {
        &self.address[..self.at]
    }

    /// Returns the part after the `@`.
    pub fn domain(&self) -> &str {
        &self.address[self.at + 1..]
    }

    /// Returns the sub-address a message for `destination_local_part` is
    /// forwarded to.
    pub fn forward_address(&self, destination_local_part: &str) -> String {
        proxy_forward_address(self.mailbox(), self.domain(), destination_local_part)
    }
}

/// Returns the first recipient (lower-cased) whose domain is `domain`.
///
/// When several recipients live on the proxy domain the first one in
/// header order wins.
pub fn find_proxy_recipient(recipients: &[String], domain: &str) -> Option<String> {
    recipients
        .iter()
        .map(|r| r.trim().to_lowercase())
        .find(|r| matches!(extract_domain_local_part(r), Ok((_, d)) if d == domain))
}

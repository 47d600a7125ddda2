//! XMPP Collaborator Trait Abstractions
//!
//! The wire protocol, authentication and the OMEMO session crypto are owned by
//! external collaborators. The bot only talks to them through these traits, so
//! the whole run can be exercised against the mocks in [`super::mock`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// XMPP address (`local@domain/resource`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid(String);

impl Jid {
    /// Parse and validate an address.
    ///
    /// Accepts `domain`, `local@domain` and either of those with a `/resource`.
    pub fn parse(input: &str) -> XmppResult<Self> {
        let input = input.trim();
        if input.is_empty() || input.chars().any(char::is_whitespace) {
            return Err(XmppError::InvalidJid(input.to_string()));
        }

        let (bare, resource) = match input.split_once('/') {
            Some((bare, resource)) => (bare, Some(resource)),
            None => (input, None),
        };

        let domain = match bare.split_once('@') {
            Some((local, domain)) if !local.is_empty() => domain,
            Some(_) => return Err(XmppError::InvalidJid(input.to_string())),
            None => bare,
        };

        if domain.is_empty() || domain.contains('@') || resource == Some("") {
            return Err(XmppError::InvalidJid(input.to_string()));
        }

        Ok(Self(input.to_string()))
    }

    /// Address without the resource part
    pub fn bare(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    /// Server part of the address
    pub fn domain(&self) -> &str {
        let bare = self.bare();
        bare.split_once('@').map_or(bare, |(_, domain)| domain)
    }

    pub fn resource(&self) -> Option<&str> {
        self.0.split_once('/').map(|(_, resource)| resource)
    }

    /// Same account, ignoring resources
    pub fn same_account(&self, other: &Jid) -> bool {
        self.bare() == other.bare()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Jid {
    type Err = XmppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Jid {
    type Error = XmppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.0
    }
}

/// Roster entry returned by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterItem {
    pub jid: Jid,
    pub name: Option<String>,
}

/// One archived message as returned by a message archive query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedMessage {
    /// Delay stamp of the forwarded stanza
    pub stamp: DateTime<Utc>,
    pub from: Jid,
    #[serde(default)]
    pub body: Option<String>,
    /// Out-of-band attachment URL
    #[serde(default)]
    pub oob_url: Option<String>,
}

/// Archive query window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveQuery {
    pub with: Jid,
    pub start: DateTime<Utc>,
    /// Result set page size
    pub max: usize,
}

/// One OMEMO device of an account
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    pub jid: Jid,
    pub id: u32,
    #[serde(with = "hex_bytes")]
    pub identity_key: Vec<u8>,
}

impl Device {
    /// SHA-256 of the identity key, hex, grouped in blocks of 8
    pub fn fingerprint(&self) -> String {
        let digest = hex::encode(Sha256::digest(&self.identity_key));
        digest
            .as_bytes()
            .chunks(8)
            .map(|block| String::from_utf8_lossy(block).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} device {} [{}]", self.jid.bare(), self.id, self.fingerprint())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Plain message before encryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub to: Jid,
    pub body: String,
    /// XHTML-IM body
    pub html: Option<String>,
    pub oob_url: Option<String>,
}

impl OutgoingMessage {
    /// Plain chat message
    pub fn chat(to: Jid, body: impl Into<String>) -> Self {
        Self {
            to,
            body: body.into(),
            html: None,
            oob_url: None,
        }
    }
}

/// Explicit Message Encryption label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mechanism {
    pub namespace: String,
    pub name: String,
}

/// Ciphertext produced for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ciphertext {
    pub device_id: u32,
    pub namespace: String,
    pub payload: String,
}

/// Non-fatal per-device encryption failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionFailure {
    pub jid: Jid,
    pub device_id: u32,
    pub reason: String,
}

impl fmt::Display for EncryptionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} device {}: {}", self.jid.bare(), self.device_id, self.reason)
    }
}

/// Result of one encryption pass over a set of devices
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptOutcome {
    pub ciphertexts: Vec<Ciphertext>,
    pub errors: Vec<EncryptionFailure>,
}

/// Stanza handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedStanza {
    pub to: Jid,
    pub device_id: u32,
    pub payload: String,
    pub mechanism: Mechanism,
}

/// Result type for collaborator operations
pub type XmppResult<T> = Result<T, XmppError>;

/// Collaborator errors
#[derive(Debug, thiserror::Error)]
pub enum XmppError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not supported by server: {0}")]
    Unsupported(String),

    #[error("Invalid JID: {0:?}")]
    InvalidJid(String),

    #[error("Not connected")]
    NotConnected,
}

/// Service discovery (XEP-0030)
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Look up the HTTP upload component of the own server, if any
    async fn find_upload_service(&self) -> XmppResult<Option<Jid>>;
}

/// Keep-alive ping (XEP-0199)
#[async_trait]
pub trait Ping: Send + Sync {
    /// Ping the own server and return the round trip
    async fn ping(&self) -> XmppResult<Duration>;
}

/// Message archive (XEP-0313)
pub trait MessageArchive: Send + Sync {
    /// Lazily page through archived messages in ascending stamp order.
    ///
    /// Each item is one result set page of at most `query.max` messages. A
    /// page-level error does not end the stream.
    fn retrieve(&self, query: ArchiveQuery) -> BoxStream<'_, XmppResult<Vec<ArchivedMessage>>>;
}

/// HTTP file upload (XEP-0363, with XEP-0454 media sharing)
#[async_trait]
pub trait HttpUpload: Send + Sync {
    /// Upload a local file through `service` and return its GET URL.
    ///
    /// Returns `XmppError::Timeout` when the slot request is not answered.
    async fn upload_file(&self, service: &Jid, path: &Path) -> XmppResult<String>;
}

/// Protocol extensions injected into a transport at construction
#[derive(Clone)]
pub struct Extensions {
    pub discovery: Arc<dyn ServiceDiscovery>,
    pub ping: Arc<dyn Ping>,
    pub archive: Arc<dyn MessageArchive>,
    pub upload: Arc<dyn HttpUpload>,
}

/// XMPP transport abstraction
///
/// `connect` resolves once the session is established (roster and stream
/// ready). Connection-level retries and timeouts belong to the implementation.
#[async_trait]
pub trait XmppClient: Send + Sync {
    /// Own address
    fn jid(&self) -> &Jid;

    /// Capability interfaces this transport was built with
    fn extensions(&self) -> &Extensions;

    /// Connect, authenticate and wait for session start
    async fn connect(&mut self, password: &str) -> XmppResult<()>;

    /// Broadcast initial presence
    async fn send_presence(&self) -> XmppResult<()>;

    /// Fetch the roster
    async fn get_roster(&self) -> XmppResult<Vec<RosterItem>>;

    /// Send one encrypted message stanza
    async fn send(&self, stanza: EncryptedStanza) -> XmppResult<()>;

    /// Close the stream
    async fn disconnect(&mut self) -> XmppResult<()>;
}

/// OMEMO session layer
///
/// Implementations keep their session state in a
/// [`SessionStore`](super::store::SessionStore).
#[async_trait]
pub trait Encryptor: Send + Sync {
    /// Devices currently published by `jid`
    async fn devices(&self, jid: &Jid) -> XmppResult<Vec<Device>>;

    /// Encrypt `message` once per device.
    ///
    /// A broken session on one device is reported in
    /// [`EncryptOutcome::errors`] instead of failing the whole call.
    async fn encrypt(
        &self,
        message: &OutgoingMessage,
        devices: &[Device],
    ) -> XmppResult<EncryptOutcome>;
}

//! Mock collaborators for testing
//!
//! In-process stand-ins for the XMPP transport, its extensions, the OMEMO
//! session layer and the operator prompt. [`MockServer`] owns one of each and
//! hands out clients wired to them, so tests can script the server side and
//! assert on what the bot did.

use super::download::{AttachmentFetcher, DownloadError};
use super::store::{SessionStore, StoreResult};
use super::traits::*;
use super::trust::TrustPrompt;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Namespace used by the mock session layer
pub const MOCK_NAMESPACE: &str = "eu.siacs.conversations.axolotl";

/// In-memory [`SessionStore`]
#[derive(Default)]
pub struct MemoryStore {
    table: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemoryStore {
    fn load(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.table.lock().unwrap().get(key).cloned())
    }

    fn store(&self, key: &str, value: Value) -> StoreResult<()> {
        self.table.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.table.lock().unwrap().remove(key);
        Ok(())
    }

    fn entries(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>> {
        Ok(self
            .table
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// Prompt that replays canned answers
#[derive(Clone, Default)]
pub struct ScriptedPrompt {
    state: Arc<Mutex<PromptState>>,
}

#[derive(Default)]
struct PromptState {
    answers: VecDeque<String>,
    questions: Vec<String>,
    notices: Vec<String>,
}

impl ScriptedPrompt {
    pub fn new(answers: &[&str]) -> Self {
        let prompt = Self::default();
        prompt.state.lock().unwrap().answers = answers.iter().map(|a| a.to_string()).collect();
        prompt
    }

    /// Every question asked so far
    pub fn questions(&self) -> Vec<String> {
        self.state.lock().unwrap().questions.clone()
    }

    pub fn notices(&self) -> Vec<String> {
        self.state.lock().unwrap().notices.clone()
    }
}

impl TrustPrompt for ScriptedPrompt {
    fn ask(&mut self, question: &str) -> io::Result<String> {
        let mut state = self.state.lock().unwrap();
        state.questions.push(question.to_string());
        state
            .answers
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no scripted answer left"))
    }

    fn notice(&mut self, message: &str) {
        self.state.lock().unwrap().notices.push(message.to_string());
    }
}

/// Observable transport events, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Presence,
    RosterFetched,
    Sent(EncryptedStanza),
    Disconnected,
}

/// Archive serving a fixed message list
#[derive(Default)]
pub struct MockArchive {
    messages: Mutex<Vec<ArchivedMessage>>,
    failing_pages: Mutex<HashSet<usize>>,
    queries: Mutex<Vec<ArchiveQuery>>,
}

impl MockArchive {
    pub fn push(&self, message: ArchivedMessage) {
        self.messages.lock().unwrap().push(message);
    }

    /// Make page `index` (zero-based) come back as an error
    pub fn fail_page(&self, index: usize) {
        self.failing_pages.lock().unwrap().insert(index);
    }

    pub fn queries(&self) -> Vec<ArchiveQuery> {
        self.queries.lock().unwrap().clone()
    }
}

impl MessageArchive for MockArchive {
    fn retrieve(&self, query: ArchiveQuery) -> BoxStream<'_, XmppResult<Vec<ArchivedMessage>>> {
        self.queries.lock().unwrap().push(query.clone());

        // Like a real archive, only the window is applied server side here;
        // sender filtering is left to the caller.
        let matching: Vec<ArchivedMessage> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.stamp >= query.start)
            .cloned()
            .collect();
        let failing = self.failing_pages.lock().unwrap().clone();

        let pages: Vec<XmppResult<Vec<ArchivedMessage>>> = matching
            .chunks(query.max.max(1))
            .enumerate()
            .map(|(index, page)| {
                if failing.contains(&index) {
                    Err(XmppError::Protocol(format!("malformed result page {}", index)))
                } else {
                    Ok(page.to_vec())
                }
            })
            .collect();

        stream::iter(pages).boxed()
    }
}

/// Upload service that answers with `<base_url>/<file name>`
pub struct MockUploader {
    base_url: String,
    delay: Mutex<Option<Duration>>,
    failure: Mutex<Option<String>>,
    uploads: Mutex<Vec<PathBuf>>,
}

impl MockUploader {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            delay: Mutex::new(None),
            failure: Mutex::new(None),
            uploads: Mutex::new(Vec::new()),
        }
    }

    /// Hold every upload for `delay` before answering
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Fail every upload with a protocol error
    pub fn set_failure(&self, reason: impl Into<String>) {
        *self.failure.lock().unwrap() = Some(reason.into());
    }

    pub fn uploads(&self) -> Vec<PathBuf> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpUpload for MockUploader {
    async fn upload_file(&self, _service: &Jid, path: &Path) -> XmppResult<String> {
        self.uploads.lock().unwrap().push(path.to_path_buf());

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failure.lock().unwrap().clone();
        if let Some(reason) = failure {
            return Err(XmppError::Protocol(reason));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        Ok(format!("{}/{}", self.base_url.trim_end_matches('/'), name))
    }
}

/// Discovery answering with a fixed upload component
pub struct MockDiscovery {
    upload_service: Mutex<Option<Jid>>,
}

impl MockDiscovery {
    pub fn new(upload_service: Option<Jid>) -> Self {
        Self {
            upload_service: Mutex::new(upload_service),
        }
    }

    pub fn set_upload_service(&self, service: Option<Jid>) {
        *self.upload_service.lock().unwrap() = service;
    }
}

#[async_trait]
impl ServiceDiscovery for MockDiscovery {
    async fn find_upload_service(&self) -> XmppResult<Option<Jid>> {
        Ok(self.upload_service.lock().unwrap().clone())
    }
}

/// Ping that always answers immediately
#[derive(Default)]
pub struct MockPing {
    count: Mutex<usize>,
}

impl MockPing {
    pub fn count(&self) -> usize {
        *self.count.lock().unwrap()
    }
}

#[async_trait]
impl Ping for MockPing {
    async fn ping(&self) -> XmppResult<Duration> {
        *self.count.lock().unwrap() += 1;
        Ok(Duration::from_millis(1))
    }
}

/// Scripted server side shared by mock clients
pub struct MockServer {
    pub archive: Arc<MockArchive>,
    pub uploader: Arc<MockUploader>,
    pub discovery: Arc<MockDiscovery>,
    pub ping: Arc<MockPing>,
    roster: Mutex<Vec<RosterItem>>,
    events: Arc<Mutex<Vec<ClientEvent>>>,
    password: Option<String>,
    fail_send_to_device: Mutex<HashSet<u32>>,
}

impl MockServer {
    /// Server with an upload component at `upload.<domain>`
    pub fn new(domain: &str) -> Arc<Self> {
        Self::configured(domain, None)
    }

    /// Server that rejects any password other than `password`
    pub fn with_password(domain: &str, password: &str) -> Arc<Self> {
        Self::configured(domain, Some(password.to_string()))
    }

    /// Server for `domain`, optionally checking the password
    pub fn configured(domain: &str, password: Option<String>) -> Arc<Self> {
        let upload = Jid::parse(&format!("upload.{}", domain)).ok();
        Arc::new(Self {
            archive: Arc::new(MockArchive::default()),
            uploader: Arc::new(MockUploader::new(format!("https://upload.{}/files", domain))),
            discovery: Arc::new(MockDiscovery::new(upload)),
            ping: Arc::new(MockPing::default()),
            roster: Mutex::new(Vec::new()),
            events: Arc::new(Mutex::new(Vec::new())),
            password,
            fail_send_to_device: Mutex::new(HashSet::new()),
        })
    }

    pub fn add_roster_item(&self, jid: Jid) {
        self.roster.lock().unwrap().push(RosterItem { jid, name: None });
    }

    /// Make stanzas for `device_id` fail at the transport
    pub fn fail_send_to(&self, device_id: u32) {
        self.fail_send_to_device.lock().unwrap().insert(device_id);
    }

    /// Client for `jid` wired to this server's extensions
    pub fn client(self: &Arc<Self>, jid: Jid) -> MockClient {
        let extensions = Extensions {
            discovery: self.discovery.clone(),
            ping: self.ping.clone(),
            archive: self.archive.clone(),
            upload: self.uploader.clone(),
        };
        MockClient {
            jid,
            server: Arc::clone(self),
            extensions,
            connected: false,
        }
    }

    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Stanzas that reached the server
    pub fn sent(&self) -> Vec<EncryptedStanza> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::Sent(stanza) => Some(stanza),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: ClientEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Mock transport
pub struct MockClient {
    jid: Jid,
    server: Arc<MockServer>,
    extensions: Extensions,
    connected: bool,
}

impl MockClient {
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn ensure_connected(&self) -> XmppResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(XmppError::NotConnected)
        }
    }
}

#[async_trait]
impl XmppClient for MockClient {
    fn jid(&self) -> &Jid {
        &self.jid
    }

    fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    async fn connect(&mut self, password: &str) -> XmppResult<()> {
        if let Some(expected) = &self.server.password {
            if expected != password {
                return Err(XmppError::Auth("not-authorized".to_string()));
            }
        }
        self.connected = true;
        self.server.record(ClientEvent::Connected);
        Ok(())
    }

    async fn send_presence(&self) -> XmppResult<()> {
        self.ensure_connected()?;
        self.server.record(ClientEvent::Presence);
        Ok(())
    }

    async fn get_roster(&self) -> XmppResult<Vec<RosterItem>> {
        self.ensure_connected()?;
        self.server.record(ClientEvent::RosterFetched);
        Ok(self.server.roster.lock().unwrap().clone())
    }

    async fn send(&self, stanza: EncryptedStanza) -> XmppResult<()> {
        self.ensure_connected()?;
        if self
            .server
            .fail_send_to_device
            .lock()
            .unwrap()
            .contains(&stanza.device_id)
        {
            return Err(XmppError::Network("stream reset".to_string()));
        }
        self.server.record(ClientEvent::Sent(stanza));
        Ok(())
    }

    async fn disconnect(&mut self) -> XmppResult<()> {
        self.connected = false;
        self.server.record(ClientEvent::Disconnected);
        Ok(())
    }
}

/// Mock OMEMO session layer
///
/// Keeps one `session:<jid>:<device>` blob per device in the session store and
/// derives a deterministic "ciphertext" from it. Devices marked broken fail
/// individually.
pub struct MockEncryptor {
    store: Arc<dyn SessionStore>,
    devices: Mutex<HashMap<String, Vec<Device>>>,
    broken: Mutex<HashSet<(String, u32)>>,
    encrypted_for: Mutex<Vec<u32>>,
}

impl MockEncryptor {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            devices: Mutex::new(HashMap::new()),
            broken: Mutex::new(HashSet::new()),
            encrypted_for: Mutex::new(Vec::new()),
        }
    }

    /// Publish a device for its account
    pub fn add_device(&self, device: Device) {
        self.devices
            .lock()
            .unwrap()
            .entry(device.jid.bare().to_string())
            .or_default()
            .push(device);
    }

    /// Make encryption to this device fail
    pub fn break_session(&self, jid: &Jid, device_id: u32) {
        self.broken
            .lock()
            .unwrap()
            .insert((jid.bare().to_string(), device_id));
    }

    /// Device ids encryption was attempted for, in order
    pub fn encrypted_for(&self) -> Vec<u32> {
        self.encrypted_for.lock().unwrap().clone()
    }

    fn encrypt_one(&self, message: &OutgoingMessage, device: &Device) -> Result<String, String> {
        let key = format!("session:{}:{}", device.jid.bare(), device.id);
        let counter = self
            .store
            .load(&key)
            .map_err(|e| e.to_string())?
            .and_then(|v| v.get("counter").and_then(Value::as_u64))
            .unwrap_or(0)
            + 1;
        self.store
            .store(&key, json!({ "counter": counter }))
            .map_err(|e| e.to_string())?;

        let mut hasher = Sha256::new();
        hasher.update(&device.identity_key);
        hasher.update(counter.to_be_bytes());
        hasher.update(message.body.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

#[async_trait]
impl Encryptor for MockEncryptor {
    async fn devices(&self, jid: &Jid) -> XmppResult<Vec<Device>> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .get(jid.bare())
            .cloned()
            .unwrap_or_default())
    }

    async fn encrypt(
        &self,
        message: &OutgoingMessage,
        devices: &[Device],
    ) -> XmppResult<EncryptOutcome> {
        let mut outcome = EncryptOutcome::default();

        for device in devices {
            self.encrypted_for.lock().unwrap().push(device.id);

            let broken = self
                .broken
                .lock()
                .unwrap()
                .contains(&(device.jid.bare().to_string(), device.id));
            if broken {
                outcome.errors.push(EncryptionFailure {
                    jid: device.jid.clone(),
                    device_id: device.id,
                    reason: "no session and no usable bundle".to_string(),
                });
                continue;
            }

            match self.encrypt_one(message, device) {
                Ok(payload) => outcome.ciphertexts.push(Ciphertext {
                    device_id: device.id,
                    namespace: MOCK_NAMESPACE.to_string(),
                    payload,
                }),
                Err(reason) => outcome.errors.push(EncryptionFailure {
                    jid: device.jid.clone(),
                    device_id: device.id,
                    reason,
                }),
            }
        }

        Ok(outcome)
    }
}

/// Fetcher that records URLs instead of downloading
#[derive(Default)]
pub struct MockFetcher {
    fetched: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl MockFetcher {
    pub fn fail_url(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl AttachmentFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<PathBuf, DownloadError> {
        self.fetched.lock().unwrap().push(url.to_string());
        if self.failing.lock().unwrap().contains(url) {
            return Err(DownloadError::Status(404));
        }
        Ok(PathBuf::from("/tmp").join(url.rsplit('/').next().unwrap_or("download")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_client_requires_connection() {
        let server = MockServer::new("example.org");
        let mut client = server.client(jid("bot@example.org"));

        assert!(matches!(
            client.send_presence().await,
            Err(XmppError::NotConnected)
        ));

        client.connect("secret").await.unwrap();
        client.send_presence().await.unwrap();
        client.disconnect().await.unwrap();

        assert_eq!(
            server.events(),
            vec![
                ClientEvent::Connected,
                ClientEvent::Presence,
                ClientEvent::Disconnected
            ]
        );
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let server = MockServer::with_password("example.org", "right");
        let mut client = server.client(jid("bot@example.org"));

        assert!(matches!(
            client.connect("wrong").await,
            Err(XmppError::Auth(_))
        ));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_archive_pages_respect_max_and_window() {
        let archive = MockArchive::default();
        for minute in 0..5 {
            archive.push(ArchivedMessage {
                stamp: Utc.with_ymd_and_hms(2026, 1, 1, 12, minute, 0).unwrap(),
                from: jid("bob@example.org"),
                body: Some(format!("m{}", minute)),
                oob_url: None,
            });
        }

        let query = ArchiveQuery {
            with: jid("bob@example.org"),
            start: Utc.with_ymd_and_hms(2026, 1, 1, 12, 1, 0).unwrap(),
            max: 3,
        };
        let pages: Vec<_> = archive.retrieve(query).collect().await;

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].as_ref().unwrap().len(), 3);
        assert_eq!(pages[1].as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_encryptor_keeps_session_blobs() {
        let store = Arc::new(MemoryStore::new());
        let encryptor = MockEncryptor::new(store.clone());
        let device = Device {
            jid: jid("bob@example.org"),
            id: 1,
            identity_key: vec![1; 32],
        };
        let message = OutgoingMessage::chat(jid("bob@example.org"), "hi");

        let first = encryptor.encrypt(&message, &[device.clone()]).await.unwrap();
        let second = encryptor.encrypt(&message, &[device]).await.unwrap();

        assert_ne!(first.ciphertexts[0].payload, second.ciphertexts[0].payload);
        assert_eq!(
            store.load("session:bob@example.org:1").unwrap(),
            Some(json!({"counter": 2}))
        );
    }

    #[tokio::test]
    async fn test_uploader_builds_url() {
        let uploader = MockUploader::new("https://upload.example.org/files/");
        let url = uploader
            .upload_file(&jid("upload.example.org"), Path::new("/home/me/cat.png"))
            .await
            .unwrap();
        assert_eq!(url, "https://upload.example.org/files/cat.png");
    }
}

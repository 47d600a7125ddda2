//! Xare Bot
//!
//! Run-once lifecycle:
//! - Connect and wait for the session
//! - Announce presence, fetch the roster
//! - Drain the offline backlog from the peer and hand each entry to the
//!   backlog observer
//! - Optionally send one encrypted text message, then one file
//! - Disconnect
//!
//! There is no reconnect or retry. A failure while establishing the session
//! ends the run; a failed optional send is recorded and the run carries on to
//! the disconnect.

use super::backlog::{drain_backlog, BacklogEntry, BacklogQuery};
use super::delivery::{DeliveryError, EncryptedDelivery};
use super::download::AttachmentFetcher;
use super::traits::*;
use super::transfer::{send_file, TransferError};
use super::trust::TrustPrompt;
use chrono::Utc;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// Bot configuration, resolved from CLI flags and the config file
pub struct BotConfig {
    /// The one peer this bot talks to
    pub peer: Jid,
    pub password: Zeroizing<String>,
    pub lookback: Duration,
    pub page_size: usize,
    pub upload_timeout: Duration,
    /// Text to send after the backlog, if any
    pub message: Option<String>,
    /// File to send after the text, if any
    pub file: Option<PathBuf>,
}

/// Lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotState {
    Disconnected,
    Connecting,
    SessionEstablished,
    RosterFetched,
    BacklogDrained,
    Sending,
    FileSending,
    Disconnecting,
}

/// Outcome of an optional send step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Sent { dispatched: usize },
    Failed(String),
}

impl StepOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }
}

/// What one run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub backlog: Vec<BacklogEntry>,
    pub message: Option<StepOutcome>,
    pub file: Option<StepOutcome>,
    /// Every state entered, in order
    pub transitions: Vec<BotState>,
}

impl RunReport {
    /// True if any requested send did not go out
    pub fn has_failed_steps(&self) -> bool {
        self.message.as_ref().is_some_and(StepOutcome::is_failure)
            || self.file.as_ref().is_some_and(StepOutcome::is_failure)
    }
}

/// Errors that end a run
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error("Connection failed: {0}")]
    Connect(#[source] XmppError),

    #[error("Presence announcement failed: {0}")]
    Presence(#[source] XmppError),

    #[error("Roster fetch failed: {0}")]
    Roster(#[source] XmppError),

    #[error("Unrecoverable delivery failure: {0}")]
    Delivery(#[source] DeliveryError),

    #[error("Unrecoverable file transfer failure: {0}")]
    Transfer(#[source] TransferError),
}

/// Called once per backlog entry, oldest first, before any send
pub type BacklogObserver = Box<dyn FnMut(&BacklogEntry) + Send>;

/// Xare bot
pub struct XareBot<C, E, P> {
    client: C,
    delivery: EncryptedDelivery<E, P>,
    fetcher: Box<dyn AttachmentFetcher>,
    config: BotConfig,
    observer: BacklogObserver,
    state: BotState,
    transitions: Vec<BotState>,
}

impl<C, E, P> XareBot<C, E, P>
where
    C: XmppClient,
    E: Encryptor,
    P: TrustPrompt,
{
    pub fn new(
        client: C,
        delivery: EncryptedDelivery<E, P>,
        fetcher: Box<dyn AttachmentFetcher>,
        config: BotConfig,
    ) -> Self {
        Self {
            client,
            delivery,
            fetcher,
            config,
            observer: Box::new(|_| {}),
            state: BotState::Disconnected,
            transitions: Vec::new(),
        }
    }

    /// Emit drained backlog entries to `observer`
    pub fn with_backlog_observer(
        mut self,
        observer: impl FnMut(&BacklogEntry) + Send + 'static,
    ) -> Self {
        self.observer = Box::new(observer);
        self
    }

    pub fn state(&self) -> BotState {
        self.state
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn delivery(&self) -> &EncryptedDelivery<E, P> {
        &self.delivery
    }

    fn enter(&mut self, state: BotState) {
        debug!(from = ?self.state, to = ?state, "state transition");
        self.state = state;
        self.transitions.push(state);
    }

    /// Run the whole lifecycle once.
    ///
    /// Returns `Err` only for failures that end the run early; the bot is
    /// `Disconnected` afterwards either way.
    pub async fn run(&mut self) -> Result<RunReport, BotError> {
        self.enter(BotState::Connecting);
        let password = self.config.password.clone();
        let connected = self.client.connect(&password).await;
        if let Err(e) = connected {
            error!(jid = %self.client.jid(), error = %e, "connection failed");
            self.enter(BotState::Disconnected);
            return Err(BotError::Connect(e));
        }
        self.enter(BotState::SessionEstablished);
        info!(jid = %self.client.jid(), "session started");

        let result = self.session().await;

        self.enter(BotState::Disconnecting);
        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "disconnect failed");
        }
        self.enter(BotState::Disconnected);

        result.map(|(backlog, message, file)| RunReport {
            backlog,
            message,
            file,
            transitions: self.transitions.clone(),
        })
    }

    #[allow(clippy::type_complexity)]
    async fn session(
        &mut self,
    ) -> Result<(Vec<BacklogEntry>, Option<StepOutcome>, Option<StepOutcome>), BotError> {
        self.client.send_presence().await.map_err(BotError::Presence)?;
        let roster = self.client.get_roster().await.map_err(BotError::Roster)?;
        debug!(items = roster.len(), "roster fetched");
        if !roster.iter().any(|item| item.jid.same_account(&self.config.peer)) {
            warn!(peer = %self.config.peer, "peer is not in the roster");
        }
        self.enter(BotState::RosterFetched);

        match self.client.extensions().ping.ping().await {
            Ok(rtt) => debug!(rtt_ms = rtt.as_millis() as u64, "server ping"),
            Err(e) => warn!(error = %e, "server ping failed"),
        }

        let query = BacklogQuery {
            with: self.config.peer.clone(),
            lookback: self.config.lookback,
            page_size: self.config.page_size,
        };
        let backlog = drain_backlog(
            self.client.extensions().archive.as_ref(),
            self.fetcher.as_ref(),
            &query,
            Utc::now(),
        )
        .await;
        for entry in &backlog {
            (self.observer)(entry);
        }
        self.enter(BotState::BacklogDrained);

        let message = match self.config.message.clone() {
            Some(text) => Some(self.send_text(text).await?),
            None => None,
        };

        let file = match self.config.file.clone() {
            Some(path) => Some(self.send_attachment(path).await?),
            None => None,
        };

        Ok((backlog, message, file))
    }

    async fn send_text(&mut self, text: String) -> Result<StepOutcome, BotError> {
        self.enter(BotState::Sending);
        let message = OutgoingMessage::chat(self.config.peer.clone(), text);

        match self.delivery.send(&self.client, &message).await {
            Ok(report) => Ok(StepOutcome::Sent {
                dispatched: report.dispatched,
            }),
            Err(e) if e.is_fatal() => Err(BotError::Delivery(e)),
            Err(e) => {
                error!(peer = %self.config.peer, error = %e, "message not sent");
                Ok(StepOutcome::Failed(e.to_string()))
            }
        }
    }

    async fn send_attachment(&mut self, path: PathBuf) -> Result<StepOutcome, BotError> {
        self.enter(BotState::FileSending);

        match send_file(
            &self.client,
            &mut self.delivery,
            &path,
            &self.config.peer,
            self.config.upload_timeout,
        )
        .await
        {
            Ok(report) => Ok(StepOutcome::Sent {
                dispatched: report.delivery.dispatched,
            }),
            Err(e) if e.is_fatal() => Err(BotError::Transfer(e)),
            Err(e) => {
                error!(path = %path.display(), error = %e, "file not sent");
                Ok(StepOutcome::Failed(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmpp::backlog::{DEFAULT_LOOKBACK, DEFAULT_PAGE_SIZE};
    use crate::xmpp::mock::*;
    use crate::xmpp::transfer::DEFAULT_UPLOAD_TIMEOUT;
    use crate::xmpp::trust::{TrustLevel, TrustPolicy};
    use std::sync::Arc;

    type TestBot = XareBot<MockClient, MockEncryptor, ScriptedPrompt>;

    fn config(message: Option<&str>, file: Option<PathBuf>) -> BotConfig {
        BotConfig {
            peer: Jid::parse("alice@example.org").unwrap(),
            password: Zeroizing::new("secret".to_string()),
            lookback: DEFAULT_LOOKBACK,
            page_size: DEFAULT_PAGE_SIZE,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
            message: message.map(str::to_string),
            file,
        }
    }

    fn bot(server: &Arc<MockServer>, config: BotConfig, trusted: &[u32]) -> TestBot {
        let store = Arc::new(MemoryStore::new());
        let encryptor = MockEncryptor::new(store.clone());
        let trust = TrustPolicy::new(store, ScriptedPrompt::new(&[]));
        for id in trusted {
            let device = Device {
                jid: config.peer.clone(),
                id: *id,
                identity_key: vec![*id as u8; 32],
            };
            trust.set_trust(&device, TrustLevel::Trusted).unwrap();
            encryptor.add_device(device);
        }

        XareBot::new(
            server.client(Jid::parse("bot@example.org/xare").unwrap()),
            EncryptedDelivery::new(encryptor, trust),
            Box::new(MockFetcher::default()),
            config,
        )
    }

    #[tokio::test]
    async fn test_minimal_run() {
        let server = MockServer::new("example.org");
        let mut bot = bot(&server, config(None, None), &[]);

        let report = bot.run().await.unwrap();

        assert_eq!(bot.state(), BotState::Disconnected);
        assert!(report.backlog.is_empty());
        assert!(report.message.is_none() && report.file.is_none());
        assert_eq!(
            report.transitions,
            vec![
                BotState::Connecting,
                BotState::SessionEstablished,
                BotState::RosterFetched,
                BotState::BacklogDrained,
                BotState::Disconnecting,
                BotState::Disconnected,
            ]
        );
        assert_eq!(server.ping.count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_ends_run() {
        let server = MockServer::with_password("example.org", "other");
        let mut bot = bot(&server, config(Some("hi"), None), &[1]);

        let err = bot.run().await.unwrap_err();

        assert!(matches!(err, BotError::Connect(XmppError::Auth(_))));
        assert_eq!(bot.state(), BotState::Disconnected);
        assert!(server.events().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_still_disconnects() {
        let server = MockServer::new("example.org");
        // Peer has no devices at all
        let mut bot = bot(&server, config(Some("hi"), None), &[]);

        let report = bot.run().await.unwrap();

        assert!(matches!(report.message, Some(StepOutcome::Failed(_))));
        assert!(report.has_failed_steps());
        assert_eq!(server.events().last(), Some(&ClientEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_text_then_file() {
        let server = MockServer::new("example.org");
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut bot = bot(
            &server,
            config(Some("hello"), Some(file.path().to_path_buf())),
            &[1],
        );

        let report = bot.run().await.unwrap();

        assert_eq!(report.message, Some(StepOutcome::Sent { dispatched: 1 }));
        assert_eq!(report.file, Some(StepOutcome::Sent { dispatched: 1 }));
        assert!(!report.has_failed_steps());
        assert!(report.transitions.contains(&BotState::Sending));
        assert!(report.transitions.contains(&BotState::FileSending));
        assert_eq!(server.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_prompt_failure_ends_run_after_disconnect() {
        let server = MockServer::new("example.org");
        let mut bot = bot(&server, config(Some("hello"), None), &[]);
        // Undecided device, and no answer available
        bot.delivery.encryptor().add_device(Device {
            jid: Jid::parse("alice@example.org").unwrap(),
            id: 9,
            identity_key: vec![9; 32],
        });

        let err = bot.run().await.unwrap_err();

        assert!(matches!(err, BotError::Delivery(_)));
        assert_eq!(bot.state(), BotState::Disconnected);
        assert_eq!(server.events().last(), Some(&ClientEvent::Disconnected));
    }
}

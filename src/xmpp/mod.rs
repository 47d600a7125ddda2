//! XMPP Bot Module
//!
//! Single-peer OMEMO bot. One run connects, drains the peer's offline backlog,
//! optionally sends one encrypted message and one file, then disconnects.
//! Nothing but the session and trust tables is kept between runs.

pub mod backlog;
pub mod bot;
pub mod delivery;
pub mod download;
pub mod mock;
pub mod simulated;
pub mod store;
pub mod traits;
pub mod transfer;
pub mod trust;

#[cfg(test)]
mod proptests;

pub use backlog::{drain_backlog, BacklogEntry, BacklogQuery};
pub use bot::{BacklogObserver, BotConfig, BotError, BotState, RunReport, StepOutcome, XareBot};
pub use delivery::{DeliveryError, DeliveryReport, EncryptedDelivery};
pub use download::{AttachmentFetcher, HttpDownloader};
pub use store::{JsonFileStore, SessionStore, StoreError};
pub use traits::{Device, Encryptor, Jid, XmppClient, XmppError, XmppResult};
pub use transfer::{send_file, TransferError};
pub use trust::{StdinPrompt, TrustLevel, TrustPolicy, TrustPrompt};

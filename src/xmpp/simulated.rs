//! Simulated Backend
//!
//! Loads a JSON fixture describing the server side of a run (account password,
//! roster, archived messages, the peer's devices and the upload component) and
//! wires the mock collaborators from it. `xare run --simulate` uses this to
//! drive the full lifecycle without a network.

use super::mock::{MockClient, MockEncryptor, MockServer};
use super::store::SessionStore;
use super::traits::{ArchivedMessage, Device, Jid};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Server-side fixture
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fixture {
    /// Password the server accepts; any password if absent
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub roster: Vec<Jid>,

    #[serde(default)]
    pub archive: Vec<ArchivedMessage>,

    #[serde(default)]
    pub devices: Vec<FixtureDevice>,

    /// Whether the server advertises an HTTP upload component
    #[serde(default = "default_upload")]
    pub upload: bool,

    #[serde(default)]
    pub upload_delay_ms: Option<u64>,
}

fn default_upload() -> bool {
    true
}

/// Published device, optionally without a usable session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureDevice {
    #[serde(flatten)]
    pub device: Device,

    #[serde(default)]
    pub broken: bool,
}

/// Fixture loading errors
#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
    #[error("Failed to read fixture {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid fixture {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl Fixture {
    pub fn load(path: &Path) -> Result<Self, FixtureError> {
        let contents = std::fs::read_to_string(path).map_err(|source| FixtureError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| FixtureError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Collaborators built from a fixture
pub struct Simulation {
    pub server: Arc<MockServer>,
    pub client: MockClient,
    pub encryptor: MockEncryptor,
}

/// Stand up a simulated server for `own_jid` and a client logged into it.
///
/// The encryptor keeps its session blobs in `store`, like a real session layer
/// would.
pub fn simulate(fixture: Fixture, own_jid: Jid, store: Arc<dyn SessionStore>) -> Simulation {
    let server = MockServer::configured(own_jid.domain(), fixture.password);

    for jid in fixture.roster {
        server.add_roster_item(jid);
    }
    for message in fixture.archive {
        server.archive.push(message);
    }
    if !fixture.upload {
        server.discovery.set_upload_service(None);
    }
    if let Some(ms) = fixture.upload_delay_ms {
        server.uploader.set_delay(Duration::from_millis(ms));
    }

    let encryptor = MockEncryptor::new(store);
    for FixtureDevice { device, broken } in fixture.devices {
        if broken {
            encryptor.break_session(&device.jid, device.id);
        }
        encryptor.add_device(device);
    }

    debug!(jid = %own_jid, "simulated server ready");
    let client = server.client(own_jid);
    Simulation {
        server,
        client,
        encryptor,
    }
}

use super::config::{effective_store_path, resolve_paths, XareConfig};
use super::credential::{determine_password_source, read_password, PASSWORD_ENV};
use super::{init_logging, RunArgs};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use xare::xmpp::simulated::{simulate, Fixture};
use xare::xmpp::{
    BotConfig, EncryptedDelivery, HttpDownloader, JsonFileStore, SessionStore, StdinPrompt,
    TrustPolicy, XareBot,
};

/// Exit code when the run completed but a requested send did not go out
pub const EXIT_SEND_FAILED: u8 = 3;

/// Run the bot once, returning the process exit status
///
/// Connects, prints the peer's offline backlog to stdout, sends the optional
/// message and file, and disconnects.
///
/// ## Configuration Loading
///
/// 1. `--config` flag if provided
/// 2. Config file next to `--store-path` if provided
/// 3. Default config at `~/.local/share/xare/config.toml`
///
/// If the config file doesn't exist, a commented default is generated.
/// Flags override the file: `--jid`, `--to`, `--password`, `--store-path`.
///
/// ## Transport
///
/// The networked XMPP stack is an external collaborator. This binary drives
/// the lifecycle against a simulated server described by `--simulate`.
pub async fn execute(
    args: RunArgs,
    level_override: Option<&str>,
) -> Result<u8, Box<dyn std::error::Error>> {
    let (config_path, store_flag) = resolve_paths(args.config, args.store_path);
    let store_hint = store_flag
        .clone()
        .unwrap_or_else(super::config::default_store_path);
    let (config, created) = XareConfig::load_or_create(&config_path, &store_hint)?;

    init_logging(level_override.unwrap_or(&config.logging.level));
    if created {
        info!(path = %config_path.display(), "created default configuration");
    }

    let jid = args
        .jid
        .or_else(|| config.account.jid.clone())
        .ok_or("No account JID: pass --jid or set [account] jid")?;
    let peer = args
        .to
        .or_else(|| config.peer.jid.clone())
        .ok_or("No peer JID: pass --to or set [peer] jid")?;

    let fixture_path = args.simulate.ok_or(
        "No XMPP transport is linked into this build; pass --simulate <fixture.json>",
    )?;
    let fixture = Fixture::load(&fixture_path)?;

    let source = determine_password_source(
        args.password,
        std::env::var(PASSWORD_ENV).ok(),
        config.account.password.clone(),
    );
    let password = read_password(source, &jid)?;

    let store_path = effective_store_path(store_flag, &config);
    let store: Arc<dyn SessionStore> = Arc::new(JsonFileStore::open(&store_path)?);
    info!(jid = %jid, peer = %peer, store = %store_path.display(), "starting");

    let bot_config = BotConfig {
        peer,
        password,
        lookback: config.lookback()?,
        page_size: config.backlog.page_size,
        upload_timeout: config.upload_timeout()?,
        message: args.send_msg,
        file: args.send_file.map(PathBuf::from),
    };

    let simulation = simulate(fixture, jid, store.clone());
    let delivery = EncryptedDelivery::new(simulation.encryptor, TrustPolicy::new(store, StdinPrompt));
    let fetcher = HttpDownloader::new(&config.backlog.download_dir)?;

    let mut bot = XareBot::new(simulation.client, delivery, Box::new(fetcher), bot_config)
        .with_backlog_observer(|entry| println!("{} {}", entry.stamp, entry.body));
    let report = bot.run().await?;

    if report.has_failed_steps() {
        warn!("run finished with failed send steps");
        return Ok(EXIT_SEND_FAILED);
    }
    Ok(0)
}

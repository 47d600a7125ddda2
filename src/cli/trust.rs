use super::config::{effective_store_path, resolve_paths, XareConfig};
use xare::xmpp::store::JsonFileStore;
use xare::xmpp::trust::{list_decisions, TrustEntry};
use xare::xmpp::{Device, Jid};

/// Print the persisted trust decisions
///
/// Reads the session table without modifying it. A missing config file is
/// not created here; the defaults apply.
pub fn execute(
    config_path: Option<String>,
    store_path: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (config_path, store_flag) = resolve_paths(config_path, store_path);
    let config = if config_path.exists() {
        XareConfig::load(&config_path)?
    } else {
        XareConfig::default()
    };

    let store_path = effective_store_path(store_flag, &config);
    let store = JsonFileStore::open(&store_path)?;
    let decisions = list_decisions(&store)?;

    println!("Store: {}", store_path.display());
    if decisions.is_empty() {
        println!("No trust decisions recorded");
        return Ok(());
    }

    for entry in &decisions {
        println!("{}", format_entry(entry));
    }

    Ok(())
}

/// One listing line: level, account, device id and fingerprint
pub fn format_entry(entry: &TrustEntry) -> String {
    let level = format!("{:?}", entry.record.level).to_lowercase();
    let fingerprint = match (Jid::parse(&entry.jid), hex::decode(&entry.record.identity_key)) {
        (Ok(jid), Ok(identity_key)) => Device {
            jid,
            id: entry.device_id,
            identity_key,
        }
        .fingerprint(),
        _ => "(unreadable identity key)".to_string(),
    };
    format!(
        "{:<10} {} device {} [{}]",
        level, entry.jid, entry.device_id, fingerprint
    )
}

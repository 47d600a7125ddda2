use tracing::warn;
use xare::xmpp::Jid;
use zeroize::Zeroizing;

/// Environment variable consulted for the account password
pub const PASSWORD_ENV: &str = "XARE_PASSWORD";

/// Where the account password comes from, checked in order
#[derive(Debug)]
pub enum PasswordSource {
    /// From --password (visible in the process list, warned about)
    Flag(String),
    /// From XARE_PASSWORD
    EnvVar(String),
    /// From `[account] password` in the config file
    Config(String),
    /// Interactive prompt (masked input)
    Prompt,
}

/// Determine the password source
///
/// Returns the first of:
/// 1. `--password` if given
/// 2. XARE_PASSWORD if set
/// 3. The config file value if set
/// 4. Otherwise, an interactive prompt
pub fn determine_password_source(
    flag: Option<String>,
    env: Option<String>,
    config: Option<String>,
) -> PasswordSource {
    if let Some(password) = flag {
        PasswordSource::Flag(password)
    } else if let Some(password) = env {
        PasswordSource::EnvVar(password)
    } else if let Some(password) = config {
        PasswordSource::Config(password)
    } else {
        PasswordSource::Prompt
    }
}

/// Read the account password for `jid`
pub fn read_password(
    source: PasswordSource,
    jid: &Jid,
) -> Result<Zeroizing<String>, Box<dyn std::error::Error>> {
    let password = match source {
        PasswordSource::Flag(password) => {
            warn!("password given on the command line is visible to other local users");
            Zeroizing::new(password)
        }
        PasswordSource::EnvVar(password) | PasswordSource::Config(password) => {
            Zeroizing::new(password)
        }
        PasswordSource::Prompt => {
            let prompt = format!("Password for {}: ", jid.bare());
            let password = rpassword::prompt_password(prompt)
                .map_err(|e| format!("Failed to read password: {}", e))?;
            Zeroizing::new(password)
        }
    };

    if password.is_empty() {
        return Err("Password cannot be empty".into());
    }

    Ok(password)
}

//! Device Trust Policy
//!
//! Blind trust is off: every device that has no recorded decision for its
//! current identity key is put to the operator as a yes/no question before
//! anything is encrypted to it. Decisions are written to the session store one
//! device at a time, so an interrupted batch never asks twice.

use super::store::{SessionStore, StoreError};
use super::traits::Device;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use tracing::{info, warn};

/// Store key prefix for trust records
pub const TRUST_KEY_PREFIX: &str = "trust:";

/// Trust state of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Undecided,
    Trusted,
    Distrusted,
}

/// Persisted decision for one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRecord {
    /// Hex identity key the decision was made for
    pub identity_key: String,
    pub level: TrustLevel,
}

/// Blocking yes/no question to the operator
///
/// Called synchronously from the single bot flow; nothing else runs while a
/// question is outstanding.
pub trait TrustPrompt {
    /// Ask `question` and return the raw answer line.
    ///
    /// Must return an error rather than an empty answer once input is exhausted.
    fn ask(&mut self, question: &str) -> io::Result<String>;

    /// Show a message without expecting an answer
    fn notice(&mut self, message: &str);
}

/// Prompt on the controlling terminal
#[derive(Debug, Default)]
pub struct StdinPrompt;

impl TrustPrompt for StdinPrompt {
    fn ask(&mut self, question: &str) -> io::Result<String> {
        let mut stdout = io::stdout();
        write!(stdout, "{}", question)?;
        stdout.flush()?;

        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stdin closed while waiting for a trust decision",
            ));
        }
        Ok(line)
    }

    fn notice(&mut self, message: &str) {
        println!("{}", message);
    }
}

/// Result type for trust operations
pub type TrustResult<T> = Result<T, TrustError>;

/// Trust policy errors
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("Trust store error: {0}")]
    Store(#[from] StoreError),

    #[error("Malformed trust record {key}: {reason}")]
    Record { key: String, reason: String },

    #[error("Trust prompt failed: {0}")]
    Prompt(#[from] io::Error),
}

/// Trust decisions backed by the session store
pub struct TrustPolicy<P> {
    store: Arc<dyn SessionStore>,
    prompt: P,
}

impl<P: TrustPrompt> TrustPolicy<P> {
    pub fn new(store: Arc<dyn SessionStore>, prompt: P) -> Self {
        Self { store, prompt }
    }

    /// Recorded trust for `device`.
    ///
    /// A record made for a different identity key counts as undecided.
    pub fn trust_level(&self, device: &Device) -> TrustResult<TrustLevel> {
        let key = trust_key(device);
        let Some(value) = self.store.load(&key)? else {
            return Ok(TrustLevel::Undecided);
        };

        let record: TrustRecord =
            serde_json::from_value(value).map_err(|e| TrustError::Record {
                key: key.clone(),
                reason: e.to_string(),
            })?;

        if record.identity_key != hex::encode(&device.identity_key) {
            warn!(
                jid = %device.jid.bare(),
                device = device.id,
                "identity key changed since last decision, asking again"
            );
            return Ok(TrustLevel::Undecided);
        }

        Ok(record.level)
    }

    /// Record a decision for `device`
    pub fn set_trust(&self, device: &Device, level: TrustLevel) -> TrustResult<()> {
        let record = TrustRecord {
            identity_key: hex::encode(&device.identity_key),
            level,
        };
        let value = serde_json::to_value(&record).map_err(|e| TrustError::Record {
            key: trust_key(device),
            reason: e.to_string(),
        })?;
        self.store.store(&trust_key(device), value)?;
        Ok(())
    }

    /// Resolve trust for a batch of encryption targets.
    ///
    /// Undecided devices are asked about one at a time, and each answer is
    /// persisted before the next question. Duplicate devices in the batch are
    /// only considered once. Returns every device with its final level.
    pub fn resolve(&mut self, devices: Vec<Device>) -> TrustResult<Vec<(Device, TrustLevel)>> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(devices.len());

        for device in devices {
            if !seen.insert((device.jid.bare().to_string(), device.id)) {
                continue;
            }

            let level = match self.trust_level(&device)? {
                TrustLevel::Undecided => {
                    let level = self.confirm(&device)?;
                    self.set_trust(&device, level)?;
                    if level == TrustLevel::Trusted {
                        info!(jid = %device.jid.bare(), device = device.id, fingerprint = %device.fingerprint(), "device trusted manually");
                    } else {
                        info!(jid = %device.jid.bare(), device = device.id, "device distrusted");
                    }
                    level
                }
                level => level,
            };

            resolved.push((device, level));
        }

        Ok(resolved)
    }

    /// Ask until the operator gives a valid answer
    fn confirm(&mut self, device: &Device) -> TrustResult<TrustLevel> {
        let question = format!(
            "[{}] Trust the following device? (yes/no) {}: ",
            device.jid.bare(),
            device
        );

        loop {
            let answer = self.prompt.ask(&question)?;
            match answer.trim() {
                "yes" => return Ok(TrustLevel::Trusted),
                "no" => return Ok(TrustLevel::Distrusted),
                _ => self.prompt.notice("Please answer yes or no."),
            }
        }
    }
}

/// Store key of the trust record for `device`
pub fn trust_key(device: &Device) -> String {
    format!("{}{}:{}", TRUST_KEY_PREFIX, device.jid.bare(), device.id)
}

/// One persisted decision, as listed by `xare trust`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustEntry {
    pub jid: String,
    pub device_id: u32,
    pub record: TrustRecord,
}

/// All persisted trust decisions in key order
pub fn list_decisions(store: &dyn SessionStore) -> TrustResult<Vec<TrustEntry>> {
    let mut out = Vec::new();
    for (key, value) in store.entries(TRUST_KEY_PREFIX)? {
        let malformed = |reason: String| TrustError::Record {
            key: key.clone(),
            reason,
        };

        let rest = &key[TRUST_KEY_PREFIX.len()..];
        let (jid, id) = rest
            .rsplit_once(':')
            .ok_or_else(|| malformed("missing device id".to_string()))?;
        let device_id = id.parse().map_err(|e| malformed(format!("{}", e)))?;
        let record = serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;

        out.push(TrustEntry {
            jid: jid.to_string(),
            device_id,
            record,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmpp::mock::{MemoryStore, ScriptedPrompt};
    use crate::xmpp::traits::Jid;
    use serde_json::json;

    fn device(id: u32, key: u8) -> Device {
        Device {
            jid: Jid::parse("bob@example.org/phone").unwrap(),
            id,
            identity_key: vec![key; 32],
        }
    }

    fn setup(answers: &[&str]) -> (TrustPolicy<ScriptedPrompt>, ScriptedPrompt, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let prompt = ScriptedPrompt::new(answers);
        let policy = TrustPolicy::new(store.clone(), prompt.clone());
        (policy, prompt, store)
    }

    #[test]
    fn test_unknown_device_is_undecided() {
        let (policy, _, _) = setup(&[]);
        assert_eq!(policy.trust_level(&device(1, 1)).unwrap(), TrustLevel::Undecided);
    }

    #[test]
    fn test_resolve_prompts_once_per_undecided_device() {
        let (mut policy, prompt, _) = setup(&["yes", "no"]);

        let resolved = policy.resolve(vec![device(1, 1), device(2, 2)]).unwrap();

        assert_eq!(prompt.questions().len(), 2);
        assert_eq!(resolved[0].1, TrustLevel::Trusted);
        assert_eq!(resolved[1].1, TrustLevel::Distrusted);
        // Persisted before resolve returned
        assert_eq!(policy.trust_level(&device(1, 1)).unwrap(), TrustLevel::Trusted);
        assert_eq!(policy.trust_level(&device(2, 2)).unwrap(), TrustLevel::Distrusted);
    }

    #[test]
    fn test_decided_devices_are_not_prompted() {
        let (mut policy, prompt, _) = setup(&[]);
        policy.set_trust(&device(1, 1), TrustLevel::Trusted).unwrap();
        policy.set_trust(&device(2, 2), TrustLevel::Distrusted).unwrap();

        let resolved = policy.resolve(vec![device(1, 1), device(2, 2)]).unwrap();

        assert!(prompt.questions().is_empty());
        assert_eq!(resolved[0].1, TrustLevel::Trusted);
        assert_eq!(resolved[1].1, TrustLevel::Distrusted);
    }

    #[test]
    fn test_invalid_answers_are_reasked() {
        let (mut policy, prompt, _) = setup(&["maybe", "YES", "", "yes"]);

        let resolved = policy.resolve(vec![device(1, 1)]).unwrap();

        assert_eq!(resolved[0].1, TrustLevel::Trusted);
        assert_eq!(prompt.questions().len(), 4);
        assert_eq!(prompt.notices().len(), 3);
    }

    #[test]
    fn test_answer_whitespace_is_trimmed() {
        let (mut policy, _, _) = setup(&["  no\n"]);
        let resolved = policy.resolve(vec![device(1, 1)]).unwrap();
        assert_eq!(resolved[0].1, TrustLevel::Distrusted);
    }

    #[test]
    fn test_exhausted_input_is_an_error() {
        let (mut policy, _, _) = setup(&["hmm"]);
        assert!(matches!(
            policy.resolve(vec![device(1, 1)]),
            Err(TrustError::Prompt(_))
        ));
        assert_eq!(policy.trust_level(&device(1, 1)).unwrap(), TrustLevel::Undecided);
    }

    #[test]
    fn test_earlier_decisions_survive_failed_batch() {
        let (mut policy, _, _) = setup(&["yes"]);

        // Second device has no answer left
        assert!(policy.resolve(vec![device(1, 1), device(2, 2)]).is_err());
        assert_eq!(policy.trust_level(&device(1, 1)).unwrap(), TrustLevel::Trusted);
    }

    #[test]
    fn test_key_change_requires_new_decision() {
        let (mut policy, prompt, _) = setup(&["no"]);
        policy.set_trust(&device(1, 1), TrustLevel::Trusted).unwrap();

        let resolved = policy.resolve(vec![device(1, 9)]).unwrap();

        assert_eq!(prompt.questions().len(), 1);
        assert_eq!(resolved[0].1, TrustLevel::Distrusted);
    }

    #[test]
    fn test_duplicates_in_batch_prompt_once() {
        let (mut policy, prompt, _) = setup(&["yes"]);
        let resolved = policy.resolve(vec![device(1, 1), device(1, 1)]).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(prompt.questions().len(), 1);
    }

    #[test]
    fn test_question_identifies_device() {
        let (mut policy, prompt, _) = setup(&["yes"]);
        let d = device(42, 3);
        policy.resolve(vec![d.clone()]).unwrap();

        let question = &prompt.questions()[0];
        assert!(question.contains("bob@example.org"));
        assert!(question.contains("device 42"));
        assert!(question.contains(&d.fingerprint()));
    }

    #[test]
    fn test_record_layout() {
        let (policy, _, store) = setup(&[]);
        policy.set_trust(&device(5, 0xab), TrustLevel::Trusted).unwrap();

        assert_eq!(
            store.load("trust:bob@example.org:5").unwrap(),
            Some(json!({"identity_key": "ab".repeat(32), "level": "trusted"}))
        );
    }

    #[test]
    fn test_malformed_record_is_reported() {
        let (policy, _, store) = setup(&[]);
        store
            .store("trust:bob@example.org:1", json!({"level": 3}))
            .unwrap();
        assert!(matches!(
            policy.trust_level(&device(1, 1)),
            Err(TrustError::Record { .. })
        ));
    }

    #[test]
    fn test_list_decisions() {
        let (policy, _, store) = setup(&[]);
        policy.set_trust(&device(2, 2), TrustLevel::Distrusted).unwrap();
        policy.set_trust(&device(1, 1), TrustLevel::Trusted).unwrap();
        store.store("session:bob@example.org:1", json!({})).unwrap();

        let entries = list_decisions(store.as_ref()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].jid, "bob@example.org");
        assert_eq!(entries[0].device_id, 1);
        assert_eq!(entries[0].record.level, TrustLevel::Trusted);
        assert_eq!(entries[1].record.level, TrustLevel::Distrusted);
    }
}

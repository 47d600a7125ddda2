//! Encrypted Delivery
//!
//! Fans one plain message out as one ciphertext stanza per trusted device of
//! the recipient. Delivery is best effort across devices: a broken session on
//! one device is logged and the others still get the message.

use super::store::StoreError;
use super::traits::*;
use super::trust::{TrustError, TrustLevel, TrustPolicy, TrustPrompt};
use tracing::{debug, info, warn};

/// Known Explicit Message Encryption (XEP-0380) mechanisms
const MECHANISMS: &[(&str, &str)] = &[
    ("urn:xmpp:otr:0", "OTR"),
    ("jabber:x:encrypted", "Legacy OpenPGP"),
    ("urn:xmpp:openpgp:0", "OpenPGP for XMPP"),
    ("eu.siacs.conversations.axolotl", "OMEMO"),
    ("urn:xmpp:omemo:1", "OMEMO 1"),
    ("urn:xmpp:omemo:2", "OMEMO"),
];

/// Label for ciphertexts of `namespace`.
///
/// Unknown namespaces are labelled with the namespace itself.
pub fn mechanism(namespace: &str) -> Mechanism {
    let name = MECHANISMS
        .iter()
        .find(|(ns, _)| *ns == namespace)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| namespace.to_string());

    Mechanism {
        namespace: namespace.to_string(),
        name,
    }
}

/// What happened to one send
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Stanzas handed to the transport
    pub dispatched: usize,
    /// Devices that could not be encrypted to
    pub failures: Vec<EncryptionFailure>,
    /// Devices whose stanza the transport rejected
    pub send_failures: Vec<EncryptionFailure>,
    /// Devices skipped because they are distrusted
    pub distrusted: Vec<u32>,
}

/// Result type for delivery
pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Delivery errors
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("XMPP error: {0}")]
    Xmpp(#[from] XmppError),

    #[error("Trust resolution failed: {0}")]
    Trust(#[from] TrustError),

    #[error("{0} has no trusted device to encrypt to")]
    NoTrustedDevices(Jid),

    #[error("Encryption failed for every device of {jid} ({failures} failures)")]
    NothingEncrypted { jid: Jid, failures: usize },
}

impl DeliveryError {
    /// Errors that must end the run rather than just this send: the trust
    /// store failed, or the operator could not be asked.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeliveryError::Trust(TrustError::Store(_)) | DeliveryError::Trust(TrustError::Prompt(_))
        )
    }

    /// Underlying store error, if that is what failed
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            DeliveryError::Trust(TrustError::Store(e)) => Some(e),
            _ => None,
        }
    }
}

/// Encryption plus trust gate in front of the transport
pub struct EncryptedDelivery<E, P> {
    encryptor: E,
    trust: TrustPolicy<P>,
}

impl<E: Encryptor, P: TrustPrompt> EncryptedDelivery<E, P> {
    pub fn new(encryptor: E, trust: TrustPolicy<P>) -> Self {
        Self { encryptor, trust }
    }

    pub fn encryptor(&self) -> &E {
        &self.encryptor
    }

    pub fn trust(&self) -> &TrustPolicy<P> {
        &self.trust
    }

    /// Encrypt `message` for every trusted device of its recipient and send it.
    ///
    /// 1. Discover the recipient's devices
    /// 2. Resolve trust, prompting for undecided devices
    /// 3. Encrypt per trusted device, collecting per-device failures
    /// 4. Label and dispatch each ciphertext, collecting per-device transport
    ///    failures
    ///
    /// Fails with the last transport error only if no stanza went out.
    pub async fn send<C>(&mut self, client: &C, message: &OutgoingMessage) -> DeliveryResult<DeliveryReport>
    where
        C: XmppClient + ?Sized,
    {
        let recipient = &message.to;

        let devices = self.encryptor.devices(recipient).await?;
        debug!(jid = %recipient, devices = devices.len(), "resolved encryption targets");

        let mut report = DeliveryReport::default();
        let mut trusted = Vec::new();
        for (device, level) in self.trust.resolve(devices)? {
            match level {
                TrustLevel::Trusted => trusted.push(device),
                TrustLevel::Distrusted => report.distrusted.push(device.id),
                // resolve() never leaves a device undecided
                TrustLevel::Undecided => report.distrusted.push(device.id),
            }
        }

        if trusted.is_empty() {
            return Err(DeliveryError::NoTrustedDevices(recipient.clone()));
        }

        let outcome = self.encryptor.encrypt(message, &trusted).await?;

        for failure in &outcome.errors {
            warn!(
                jid = %failure.jid.bare(),
                device = failure.device_id,
                reason = %failure.reason,
                "non-critical encryption error"
            );
        }
        report.failures = outcome.errors;

        if outcome.ciphertexts.is_empty() {
            return Err(DeliveryError::NothingEncrypted {
                jid: recipient.clone(),
                failures: report.failures.len(),
            });
        }

        let mut last_error = None;
        for ciphertext in outcome.ciphertexts {
            let device_id = ciphertext.device_id;
            let stanza = EncryptedStanza {
                to: recipient.clone(),
                device_id,
                mechanism: mechanism(&ciphertext.namespace),
                payload: ciphertext.payload,
            };
            match client.send(stanza).await {
                Ok(()) => report.dispatched += 1,
                Err(e) => {
                    warn!(
                        jid = %recipient.bare(),
                        device = device_id,
                        error = %e,
                        "stanza not dispatched"
                    );
                    report.send_failures.push(EncryptionFailure {
                        jid: recipient.clone(),
                        device_id,
                        reason: e.to_string(),
                    });
                    last_error = Some(e);
                }
            }
        }

        if report.dispatched == 0 {
            if let Some(e) = last_error {
                return Err(DeliveryError::Xmpp(e));
            }
        }

        info!(
            jid = %recipient,
            dispatched = report.dispatched,
            failed = report.failures.len() + report.send_failures.len(),
            "encrypted message sent"
        );

        Ok(report)
    }
}

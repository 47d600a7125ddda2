//! File Transfer
//!
//! Uploads a local file through the server's HTTP upload component and sends
//! the resulting link to the peer through [`EncryptedDelivery`], the same path
//! a text message takes. There is no plaintext shortcut for attachments.

use super::delivery::{DeliveryError, DeliveryReport, EncryptedDelivery};
use super::traits::*;
use super::trust::TrustPrompt;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Default wait for the upload slot and transfer
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// XHTML-IM body namespace
pub const XHTML_NS: &str = "http://www.w3.org/1999/xhtml";

/// Result type for file transfer
pub type TransferResult<T> = Result<T, TransferError>;

/// File transfer errors
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Could not send file in time ({0:?})")]
    TimedOut(Duration),

    #[error("File not found or not a regular file: {0}")]
    FileNotFound(String),

    #[error("Server offers no HTTP upload service")]
    Unsupported,

    #[error("Upload failed: {0}")]
    Upload(#[source] XmppError),

    #[error("Sending the file link failed: {0}")]
    Delivery(#[from] DeliveryError),
}

impl TransferError {
    /// See [`DeliveryError::is_fatal`]
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransferError::Delivery(e) if e.is_fatal())
    }
}

/// Successful transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub url: String,
    pub delivery: DeliveryReport,
}

/// Minimal XHTML-IM body linking `url`
pub fn link_html(url: &str) -> String {
    let url = escape_xml(url);
    format!(r#"<body xmlns="{}"><a href="{}">{}</a></body>"#, XHTML_NS, url, url)
}

/// Message announcing an uploaded file
///
/// The link goes in the body, the XHTML-IM body and the out-of-band URL.
pub fn attachment_message(to: Jid, url: &str) -> OutgoingMessage {
    OutgoingMessage {
        to,
        body: url.to_string(),
        html: Some(link_html(url)),
        oob_url: Some(url.to_string()),
    }
}

fn escape_xml(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Upload `path` and send its link to `to`.
///
/// The upload is bounded by `timeout`; running out of time yields
/// [`TransferError::TimedOut`] and nothing is sent.
pub async fn send_file<C, E, P>(
    client: &C,
    delivery: &mut EncryptedDelivery<E, P>,
    path: &Path,
    to: &Jid,
    timeout: Duration,
) -> TransferResult<TransferReport>
where
    C: XmppClient + ?Sized,
    E: Encryptor,
    P: TrustPrompt,
{
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => {}
        _ => return Err(TransferError::FileNotFound(path.display().to_string())),
    }

    let extensions = client.extensions();
    let service = extensions
        .discovery
        .find_upload_service()
        .await
        .map_err(TransferError::Upload)?
        .ok_or(TransferError::Unsupported)?;

    let url = match tokio::time::timeout(timeout, extensions.upload.upload_file(&service, path)).await {
        Ok(Ok(url)) => url,
        Ok(Err(XmppError::Timeout(_))) | Err(_) => return Err(TransferError::TimedOut(timeout)),
        Ok(Err(e)) => return Err(TransferError::Upload(e)),
    };
    info!(url = %url, "Upload success!");

    info!(jid = %to, "Sending file");
    let message = attachment_message(to.clone(), &url);
    let report = delivery.send(client, &message).await?;

    Ok(TransferReport {
        url,
        delivery: report,
    })
}

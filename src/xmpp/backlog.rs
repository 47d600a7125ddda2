//! Offline Backlog Retrieval
//!
//! Pages through the message archive for the configured lookback window and
//! keeps only what the expected peer sent. File links are downloaded as they
//! come by; text bodies are collected oldest first.

use super::download::AttachmentFetcher;
use super::traits::{ArchiveQuery, ArchivedMessage, Jid, MessageArchive};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, warn};

/// Default lookback window (6 hours)
pub const DEFAULT_LOOKBACK: Duration = Duration::from_secs(6 * 60 * 60);

/// Default archive page size
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// What to retrieve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacklogQuery {
    /// Only messages from this account are kept
    pub with: Jid,
    pub lookback: Duration,
    pub page_size: usize,
}

/// One text message from the backlog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacklogEntry {
    pub stamp: DateTime<Utc>,
    pub from: Jid,
    pub body: String,
}

/// How one archived message is handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Text(BacklogEntry),
    Attachment(String),
    Skip,
}

/// Sort one archived message into text, attachment or noise
pub fn classify(message: ArchivedMessage, expected: &Jid) -> Classified {
    if !message.from.same_account(expected) {
        return Classified::Skip;
    }

    let body = message.body.filter(|b| !b.is_empty());
    let oob_url = message.oob_url.filter(|u| !u.is_empty());

    match (body, oob_url) {
        (_, Some(url)) => Classified::Attachment(url),
        (Some(body), None) => Classified::Text(BacklogEntry {
            stamp: message.stamp,
            from: message.from,
            body,
        }),
        // Chat state notifications and other hints carry neither
        (None, None) => Classified::Skip,
    }
}

/// Start of the archive window ending at `now`
pub fn window_start(now: DateTime<Utc>, lookback: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lookback)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Drain the backlog of `query.with` as of `now`.
///
/// Pages and attachment downloads that fail are logged and skipped; they never
/// end the retrieval.
pub async fn drain_backlog(
    archive: &dyn MessageArchive,
    fetcher: &dyn AttachmentFetcher,
    query: &BacklogQuery,
    now: DateTime<Utc>,
) -> Vec<BacklogEntry> {
    let archive_query = ArchiveQuery {
        with: query.with.clone(),
        start: window_start(now, query.lookback),
        max: query.page_size.max(1),
    };
    debug!(with = %archive_query.with, start = %archive_query.start, max = archive_query.max, "querying archive");

    let mut entries = Vec::new();
    let mut pages = archive.retrieve(archive_query);
    let mut page_index = 0usize;

    while let Some(page) = pages.next().await {
        let page_no = page_index;
        page_index += 1;

        let messages = match page {
            Ok(messages) => messages,
            Err(e) => {
                warn!(page = page_no, error = %e, "skipping unreadable archive page");
                continue;
            }
        };

        for message in messages {
            match classify(message, &query.with) {
                Classified::Text(entry) => entries.push(entry),
                Classified::Attachment(url) => {
                    if let Err(e) = fetcher.fetch(&url).await {
                        warn!(url = %url, error = %e, "Failed to download file");
                    }
                }
                Classified::Skip => {}
            }
        }
    }

    debug!(entries = entries.len(), pages = page_index, "backlog drained");
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmpp::mock::{MockArchive, MockFetcher};
    use chrono::TimeZone;

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).unwrap()
    }

    fn msg(hour: u32, minute: u32, from: &str, body: Option<&str>, oob: Option<&str>) -> ArchivedMessage {
        ArchivedMessage {
            stamp: Utc.with_ymd_and_hms(2026, 3, 1, hour, minute, 0).unwrap(),
            from: jid(from),
            body: body.map(str::to_string),
            oob_url: oob.map(str::to_string),
        }
    }

    fn query() -> BacklogQuery {
        BacklogQuery {
            with: jid("alice@example.org"),
            lookback: DEFAULT_LOOKBACK,
            page_size: 2,
        }
    }

    #[test]
    fn test_window_start() {
        assert_eq!(
            window_start(now(), DEFAULT_LOOKBACK),
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
        );
        assert_eq!(
            window_start(now(), Duration::from_secs(u64::MAX)),
            DateTime::<Utc>::MIN_UTC
        );
    }

    #[test]
    fn test_classify() {
        let expected = jid("alice@example.org");

        assert!(matches!(
            classify(msg(13, 0, "alice@example.org/phone", Some("hi"), None), &expected),
            Classified::Text(e) if e.body == "hi"
        ));
        assert_eq!(
            classify(msg(13, 0, "alice@example.org", Some("https://x/a.png"), Some("https://x/a.png")), &expected),
            Classified::Attachment("https://x/a.png".to_string())
        );
        assert_eq!(
            classify(msg(13, 0, "mallory@example.org", Some("hi"), None), &expected),
            Classified::Skip
        );
        assert_eq!(
            classify(msg(13, 0, "alice@example.org", None, None), &expected),
            Classified::Skip
        );
        assert_eq!(
            classify(msg(13, 0, "alice@example.org", Some(""), None), &expected),
            Classified::Skip
        );
    }

    #[test]
    fn test_attachment_without_body_still_counts() {
        let expected = jid("alice@example.org");
        assert_eq!(
            classify(msg(13, 0, "alice@example.org", None, Some("https://x/f.txt")), &expected),
            Classified::Attachment("https://x/f.txt".to_string())
        );
    }

    #[tokio::test]
    async fn test_only_expected_sender_in_order() {
        let archive = MockArchive::default();
        archive.push(msg(13, 0, "alice@example.org/phone", Some("one"), None));
        archive.push(msg(13, 5, "bob@example.org", Some("not for us"), None));
        archive.push(msg(13, 10, "alice@example.org/laptop", None, None));
        archive.push(msg(13, 15, "alice@example.org/phone", Some("two"), None));
        archive.push(msg(13, 20, "alice@example.org/phone", Some("three"), None));
        let fetcher = MockFetcher::default();

        let entries = drain_backlog(&archive, &fetcher, &query(), now()).await;

        let bodies: Vec<&str> = entries.iter().map(|e| e.body.as_str()).collect();
        assert_eq!(bodies, vec!["one", "two", "three"]);
        assert!(entries.windows(2).all(|w| w[0].stamp <= w[1].stamp));
        assert!(fetcher.fetched().is_empty());
    }

    #[tokio::test]
    async fn test_messages_outside_window_are_not_requested() {
        let archive = MockArchive::default();
        archive.push(msg(11, 59, "alice@example.org", Some("too old"), None));
        archive.push(msg(12, 1, "alice@example.org", Some("recent"), None));
        let fetcher = MockFetcher::default();

        let entries = drain_backlog(&archive, &fetcher, &query(), now()).await;

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].body, "recent");
        let queries = archive.queries();
        assert_eq!(queries[0].start, Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        assert_eq!(queries[0].max, 2);
    }

    #[tokio::test]
    async fn test_attachment_downloaded_once_not_listed() {
        let archive = MockArchive::default();
        let url = "https://upload.example.org/files/cat.png";
        archive.push(msg(13, 0, "alice@example.org/phone", Some(url), Some(url)));
        archive.push(msg(13, 1, "alice@example.org/phone", Some("look!"), None));
        let fetcher = MockFetcher::default();

        let entries = drain_backlog(&archive, &fetcher, &query(), now()).await;

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].body, "look!");
        assert_eq!(fetcher.fetched(), vec![url.to_string()]);
    }

    #[tokio::test]
    async fn test_failed_download_does_not_stop_backlog() {
        let archive = MockArchive::default();
        let url = "https://upload.example.org/files/gone.png";
        archive.push(msg(13, 0, "alice@example.org", None, Some(url)));
        archive.push(msg(13, 1, "alice@example.org", Some("after"), None));
        let fetcher = MockFetcher::default();
        fetcher.fail_url(url);

        let entries = drain_backlog(&archive, &fetcher, &query(), now()).await;

        assert_eq!(fetcher.fetched().len(), 1);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].body, "after");
    }

    #[tokio::test]
    async fn test_bad_page_is_skipped() {
        let archive = MockArchive::default();
        for (minute, body) in [(0, "a"), (1, "b"), (2, "c"), (3, "d"), (4, "e")] {
            archive.push(msg(13, minute, "alice@example.org", Some(body), None));
        }
        // Pages of two: [a, b] [c, d] [e]
        archive.fail_page(1);
        let fetcher = MockFetcher::default();

        let entries = drain_backlog(&archive, &fetcher, &query(), now()).await;

        let bodies: Vec<&str> = entries.iter().map(|e| e.body.as_str()).collect();
        assert_eq!(bodies, vec!["a", "b", "e"]);
    }

    #[tokio::test]
    async fn test_empty_archive() {
        let archive = MockArchive::default();
        let fetcher = MockFetcher::default();
        assert!(drain_backlog(&archive, &fetcher, &query(), now()).await.is_empty());
    }
}

//! IMAP implementation of [`MailFetcher`].
//!
//! One connection per fetch — mailboxes are polled on a minutes-scale
//! interval, so caching TLS sessions buys nothing and a fresh LOGIN avoids
//! stale-connection handling entirely.

use std::sync::Arc;
use std::time::Duration;

use async_imap::Session;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mailparse::{DispositionType, ParsedMail};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{self, pki_types::ServerName};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::{DaemonConfig, MailServerConfig};
use crate::storage::MailboxRow;

use super::{truncate_to_second, FetchError, FetchedMessage, MailFetcher};

/// Upper bound on one complete fetch (connect, login, search, fetch, logout).
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

type ImapSession = Session<TlsStream<TcpStream>>;

// ─── ImapFetcher ──────────────────────────────────────────────────────────────

pub struct ImapFetcher {
    config: Arc<DaemonConfig>,
}

impl ImapFetcher {
    pub fn new(config: Arc<DaemonConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailFetcher for ImapFetcher {
    async fn fetch(
        &self,
        mailbox: &MailboxRow,
        with_body: bool,
        limit: usize,
    ) -> Result<Vec<FetchedMessage>, FetchError> {
        let server = self.config.imap_server(&mailbox.server_name);
        match tokio::time::timeout(FETCH_TIMEOUT, fetch_inbox(&server, mailbox, with_body, limit))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::Protocol(format!(
                "fetch from {} timed out after {}s",
                server.imap_host,
                FETCH_TIMEOUT.as_secs()
            ))),
        }
    }
}

// ─── Connection ───────────────────────────────────────────────────────────────

async fn connect(server: &MailServerConfig, mailbox: &MailboxRow) -> Result<ImapSession, FetchError> {
    let host = server.imap_host.clone();
    let tcp = TcpStream::connect((host.as_str(), server.imap_port))
        .await
        .map_err(|e| FetchError::Connect(host.clone(), e.to_string()))?;

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let server_name = ServerName::try_from(host.clone())
        .map_err(|e| FetchError::Connect(host.clone(), e.to_string()))?;
    let tls = TlsConnector::from(Arc::new(tls_config))
        .connect(server_name, tcp)
        .await
        .map_err(|e| FetchError::Connect(host.clone(), e.to_string()))?;

    let mut client = async_imap::Client::new(tls);
    // Consume the server greeting before LOGIN.
    let _ = client.read_response().await;

    let session = client
        .login(&mailbox.account, &mailbox.auth_code)
        .await
        .map_err(|_| FetchError::Auth(mailbox.account.clone()))?;
    debug!(account = %mailbox.account, host = %host, "IMAP login ok");
    Ok(session)
}

async fn fetch_inbox(
    server: &MailServerConfig,
    mailbox: &MailboxRow,
    with_body: bool,
    limit: usize,
) -> Result<Vec<FetchedMessage>, FetchError> {
    let mut session = connect(server, mailbox).await?;

    session
        .select("INBOX")
        .await
        .map_err(|e| FetchError::Protocol(e.to_string()))?;

    let seqs = session
        .search("ALL")
        .await
        .map_err(|e| FetchError::Protocol(e.to_string()))?;

    // Sequence numbers ascend in arrival order; the tail is the recent window.
    let mut ids: Vec<u32> = seqs.into_iter().collect();
    ids.sort_unstable();
    if ids.len() > limit {
        ids = ids.split_off(ids.len() - limit);
    }
    if ids.is_empty() {
        let _ = session.logout().await;
        return Ok(Vec::new());
    }

    let set = ids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let query = if with_body {
        "(ENVELOPE INTERNALDATE BODY.PEEK[])"
    } else {
        "(ENVELOPE INTERNALDATE)"
    };

    let fetches = {
        let stream = session
            .fetch(&set, query)
            .await
            .map_err(|e| FetchError::Protocol(e.to_string()))?;
        stream
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| FetchError::Protocol(e.to_string()))?
    };

    let mut messages = Vec::with_capacity(fetches.len());
    for fetch in &fetches {
        match parse_fetch(fetch, with_body) {
            Some(msg) => messages.push(msg),
            None => warn!(account = %mailbox.account, "skipping message without envelope"),
        }
    }

    let _ = session.logout().await;
    debug!(
        account = %mailbox.account,
        count = messages.len(),
        with_body,
        "fetched recent window"
    );
    Ok(messages)
}

// ─── Message parsing ──────────────────────────────────────────────────────────

fn parse_fetch(fetch: &async_imap::types::Fetch, with_body: bool) -> Option<FetchedMessage> {
    let envelope = fetch.envelope()?;

    let sender = envelope
        .from
        .as_ref()
        .and_then(|addrs| addrs.first())
        .and_then(|addr| {
            let user = addr.mailbox.as_deref()?;
            let host = addr.host.as_deref()?;
            Some(format!(
                "{}@{}",
                String::from_utf8_lossy(user),
                String::from_utf8_lossy(host)
            ))
        })
        .unwrap_or_default();

    let subject = envelope
        .subject
        .as_deref()
        .map(decode_header_value)
        .unwrap_or_default();

    // Prefer the Date header; fall back to the server's INTERNALDATE, then
    // to the current time (as the original protocol client did).
    let reception_time = envelope
        .date
        .as_deref()
        .and_then(parse_date_header)
        .or_else(|| fetch.internal_date().map(|d| d.with_timezone(&Utc)))
        .unwrap_or_else(Utc::now);

    let body = if with_body {
        fetch.body().and_then(extract_body_text)
    } else {
        None
    };

    Some(FetchedMessage {
        sender,
        subject,
        reception_time: truncate_to_second(reception_time),
        body,
    })
}

/// Decode a possibly MIME-encoded-word header value (`=?utf-8?B?...?=`).
fn decode_header_value(raw: &[u8]) -> String {
    let mut line = b"Subject: ".to_vec();
    line.extend_from_slice(raw);
    line.extend_from_slice(b"\n");
    match mailparse::parse_header(&line) {
        Ok((header, _)) => header.get_value(),
        Err(_) => String::from_utf8_lossy(raw).into_owned(),
    }
}

fn parse_date_header(raw: &[u8]) -> Option<DateTime<Utc>> {
    let text = std::str::from_utf8(raw).ok()?.trim();
    if let Ok(ts) = DateTime::parse_from_rfc2822(text) {
        return Some(ts.with_timezone(&Utc));
    }
    // dateparse tolerates the looser headers seen in the wild, but it will
    // also invent a date from pure garbage; require at least one digit
    // before trusting it so the INTERNALDATE fallback can fire.
    if !text.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    let epoch = mailparse::dateparse(text).ok()?;
    DateTime::<Utc>::from_timestamp(epoch, 0)
}

/// Extract a plain-text body from a raw RFC 822 message.
///
/// text/plain parts win; without one, the first text/html part is reduced to
/// text. Attachments are skipped.
fn extract_body_text(raw: &[u8]) -> Option<String> {
    let parsed = mailparse::parse_mail(raw).ok()?;
    if let Some(text) = find_part(&parsed, "text/plain") {
        let trimmed = text.trim().to_string();
        if !trimmed.is_empty() {
            return Some(trimmed);
        }
    }
    find_part(&parsed, "text/html")
        .map(|html| strip_html(&html))
        .filter(|t| !t.is_empty())
}

fn find_part(mail: &ParsedMail, mimetype: &str) -> Option<String> {
    if mail.get_content_disposition().disposition == DispositionType::Attachment {
        return None;
    }
    if mail.subparts.is_empty() {
        if mail.ctype.mimetype.eq_ignore_ascii_case(mimetype) {
            return mail.get_body().ok();
        }
        return None;
    }
    mail.subparts.iter().find_map(|p| find_part(p, mimetype))
}

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

fn strip_html(html: &str) -> String {
    let without_tags = TAG_RE.replace_all(html, " ");
    WS_RE.replace_all(&without_tags, " ").trim().to_string()
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_html_to_readable_text() {
        let html = "<html><body><p>Hello <b>world</b></p>\n<div>second   line</div></body></html>";
        assert_eq!(strip_html(html), "Hello world second line");
    }

    #[test]
    fn decodes_mime_encoded_subject() {
        // "=?utf-8?B?aGVsbG8=?=" is base64 for "hello"
        assert_eq!(decode_header_value(b"=?utf-8?B?aGVsbG8=?="), "hello");
        assert_eq!(decode_header_value(b"plain subject"), "plain subject");
    }

    #[test]
    fn parses_rfc2822_date_header() {
        let ts = parse_date_header(b"Sat, 30 Aug 2026 10:15:42 +0200").unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-08-30T08:15:42+00:00");
        // loose real-world variant with a trailing comment
        let ts = parse_date_header(b"Sat, 30 Aug 2026 10:15:42 +0200 (CEST)").unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-08-30T08:15:42+00:00");
    }

    #[test]
    fn malformed_date_header_is_rejected_not_invented() {
        // must come back None so the caller falls through to INTERNALDATE
        assert!(parse_date_header(b"not a date").is_none());
        assert!(parse_date_header(b"").is_none());
    }

    #[test]
    fn prefers_plain_text_part_over_html() {
        let raw = concat!(
            "Subject: test\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/alternative; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "plain body\r\n",
            "--b\r\n",
            "Content-Type: text/html; charset=utf-8\r\n",
            "\r\n",
            "<p>html body</p>\r\n",
            "--b--\r\n"
        );
        assert_eq!(extract_body_text(raw.as_bytes()).unwrap(), "plain body");
    }

    #[test]
    fn falls_back_to_stripped_html() {
        let raw = concat!(
            "Subject: test\r\n",
            "Content-Type: text/html; charset=utf-8\r\n",
            "\r\n",
            "<p>only   html</p>\r\n"
        );
        assert_eq!(extract_body_text(raw.as_bytes()).unwrap(), "only html");
    }
}

//! Mailbox adapter: lists unread messages with attachments from a
//! monitored inbox. The IMAP protocol work is blocking, so the adapter
//! bridges it onto the runtime with `spawn_blocking`.

pub mod poller;

use async_trait::async_trait;
use mailparse::MailHeaderMap;
use std::sync::Arc;
use tracing::warn;

use crate::errors::AppError;

#[derive(Debug, Clone)]
pub struct MailAttachment {
    pub filename: Option<String>,
    pub mime: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct MailMessage {
    /// RFC 5322 Message-ID; the idempotency key for e-mail ingestion.
    pub message_id: String,
    pub subject: String,
    pub from_name: Option<String>,
    pub from_email: Option<String>,
    pub attachments: Vec<MailAttachment>,
    /// IMAP UID, used to flag the message as seen.
    uid: Option<u32>,
}

impl MailMessage {
    pub fn new(
        message_id: String,
        subject: String,
        from_name: Option<String>,
        from_email: Option<String>,
        attachments: Vec<MailAttachment>,
    ) -> Self {
        Self {
            message_id,
            subject,
            from_name,
            from_email,
            attachments,
            uid: None,
        }
    }
}

#[async_trait]
pub trait Mailbox: Send + Sync {
    async fn list_unread(&self) -> Result<Vec<MailMessage>, AppError>;

    /// Flags a message as handled so the next poll skips it.
    async fn mark_processed(&self, message: &MailMessage) -> Result<(), AppError>;
}

#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub folder: String,
}

pub struct ImapMailbox {
    config: Arc<ImapConfig>,
}

impl ImapMailbox {
    pub fn new(config: ImapConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn list_unread(&self) -> Result<Vec<MailMessage>, AppError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || fetch_unread_blocking(&config))
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("mailbox task panicked: {e}")))?
    }

    async fn mark_processed(&self, message: &MailMessage) -> Result<(), AppError> {
        let Some(uid) = message.uid else {
            return Ok(());
        };
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || mark_seen_blocking(&config, uid))
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("mailbox task panicked: {e}")))?
    }
}

type TlsSession = imap::Session<native_tls::TlsStream<std::net::TcpStream>>;

fn open_session(config: &ImapConfig) -> Result<TlsSession, AppError> {
    let tls = native_tls::TlsConnector::builder()
        .build()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("tls init: {e}")))?;
    let tcp = std::net::TcpStream::connect((config.host.as_str(), config.port))
        .map_err(|e| AppError::Internal(anyhow::anyhow!("imap connect: {e}")))?;
    tcp.set_read_timeout(Some(std::time::Duration::from_secs(60)))
        .and_then(|_| tcp.set_write_timeout(Some(std::time::Duration::from_secs(60))))
        .map_err(|e| AppError::Internal(anyhow::anyhow!("imap socket: {e}")))?;
    let tls_stream = tls
        .connect(&config.host, tcp)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("tls handshake: {e}")))?;

    let client = imap::Client::new(tls_stream);
    let mut session = client
        .login(&config.username, &config.password)
        .map_err(|(e, _)| AppError::Internal(anyhow::anyhow!("imap login: {e}")))?;
    session
        .select(&config.folder)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("imap select: {e}")))?;
    Ok(session)
}

fn fetch_unread_blocking(config: &ImapConfig) -> Result<Vec<MailMessage>, AppError> {
    let mut session = open_session(config)?;

    let uids = session
        .uid_search("UNSEEN")
        .map_err(|e| AppError::Internal(anyhow::anyhow!("imap search: {e}")))?;

    let mut out = Vec::new();
    for uid in uids {
        let fetches = session
            .uid_fetch(uid.to_string(), "RFC822")
            .map_err(|e| AppError::Internal(anyhow::anyhow!("imap fetch {uid}: {e}")))?;
        for fetch in fetches.iter() {
            let Some(body) = fetch.body() else {
                continue;
            };
            match parse_message(body) {
                Ok(Some(mut message)) => {
                    message.uid = Some(uid);
                    out.push(message);
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping unparseable message uid {uid}: {e}"),
            }
        }
    }

    let _ = session.logout();
    Ok(out)
}

fn mark_seen_blocking(config: &ImapConfig, uid: u32) -> Result<(), AppError> {
    let mut session = open_session(config)?;
    session
        .uid_store(uid.to_string(), "+FLAGS (\\Seen)")
        .map_err(|e| AppError::Internal(anyhow::anyhow!("imap store {uid}: {e}")))?;
    let _ = session.logout();
    Ok(())
}

/// Parses one raw RFC822 message. Returns `None` for messages without a
/// Message-ID, which cannot be deduplicated safely.
fn parse_message(raw: &[u8]) -> Result<Option<MailMessage>, AppError> {
    let parsed =
        mailparse::parse_mail(raw).map_err(|e| AppError::Corrupt(format!("mail parse: {e}")))?;

    let Some(message_id) = parsed.headers.get_first_value("Message-ID") else {
        return Ok(None);
    };
    let subject = parsed
        .headers
        .get_first_value("Subject")
        .unwrap_or_default();

    let (from_name, from_email) = parsed
        .headers
        .get_first_value("From")
        .and_then(|raw| mailparse::addrparse(&raw).ok())
        .and_then(|addrs| addrs.into_inner().into_iter().next())
        .map(|addr| match addr {
            mailparse::MailAddr::Single(info) => (info.display_name, Some(info.addr)),
            mailparse::MailAddr::Group(group) => (Some(group.group_name), None),
        })
        .unwrap_or((None, None));

    let mut attachments = Vec::new();
    collect_attachments(&parsed, &mut attachments);

    Ok(Some(MailMessage {
        message_id: message_id.trim().to_string(),
        subject,
        from_name,
        from_email,
        attachments,
        uid: None,
    }))
}

fn collect_attachments(part: &mailparse::ParsedMail<'_>, out: &mut Vec<MailAttachment>) {
    for sub in &part.subparts {
        collect_attachments(sub, out);
    }
    let disposition = part.get_content_disposition();
    if disposition.disposition != mailparse::DispositionType::Attachment {
        return;
    }
    match part.get_body_raw() {
        Ok(data) => out.push(MailAttachment {
            filename: disposition.params.get("filename").cloned(),
            mime: part.ctype.mimetype.clone(),
            data,
        }),
        Err(e) => warn!("Dropping undecodable attachment: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Message-ID: <m1@mail.example>\r\n\
Subject: Data Analyst | DA-2025-004\r\n\
From: Jane Doe <jane@example.com>\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"b\"\r\n\
\r\n\
--b\r\n\
Content-Type: text/plain\r\n\
\r\n\
Please find my CV attached.\r\n\
--b\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"cv.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQ=\r\n\
--b--\r\n";

    #[test]
    fn test_parse_message_extracts_fields() {
        let message = parse_message(SAMPLE.as_bytes()).unwrap().unwrap();
        assert_eq!(message.message_id, "<m1@mail.example>");
        assert_eq!(message.subject, "Data Analyst | DA-2025-004");
        assert_eq!(message.from_name.as_deref(), Some("Jane Doe"));
        assert_eq!(message.from_email.as_deref(), Some("jane@example.com"));
        assert_eq!(message.attachments.len(), 1);
        assert_eq!(message.attachments[0].mime, "application/pdf");
        assert_eq!(message.attachments[0].filename.as_deref(), Some("cv.pdf"));
        // base64 "JVBERi0xLjQ=" is "%PDF-1.4".
        assert_eq!(message.attachments[0].data, b"%PDF-1.4");
    }

    #[test]
    fn test_message_without_id_skipped() {
        let raw = "Subject: hello\r\n\r\nbody";
        assert!(parse_message(raw.as_bytes()).unwrap().is_none());
    }
}

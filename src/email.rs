//! Attachment extraction from RFC822 messages.
//!
//! Pulls the parts worth scanning out of a raw message: anything declaring
//! an image content type, a PDF, or an opaque octet-stream (spam senders
//! routinely mislabel images). Decoding and MIME traversal are delegated
//! to `mail-parser`.

use mail_parser::{MessageParser, MimeHeaders};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("failed to parse message")]
    ParseFailed,
}

/// One attachment candidate as declared by the message.
#[derive(Debug, Clone)]
pub struct AttachmentPart {
    /// Declared content type, `type/subtype` lowercased.
    pub content_type: String,
    /// Declared filename, content id, or a positional fallback.
    pub filename: String,
    /// Decoded bytes.
    pub data: Vec<u8>,
}

/// Content types the pipeline will look at.
fn is_scannable(content_type: &str) -> bool {
    content_type.starts_with("image/")
        || content_type == "application/pdf"
        || content_type == "application/octet-stream"
}

/// Extract MIME type from a content type, defaulting to octet-stream.
fn mime_type_from_content_type(ct: Option<&mail_parser::ContentType>) -> String {
    ct.map(|ct| {
        if let Some(subtype) = ct.subtype() {
            format!("{}/{}", ct.ctype(), subtype)
        } else {
            ct.ctype().to_string()
        }
    })
    .unwrap_or_else(|| "application/octet-stream".to_string())
    .to_lowercase()
}

/// Parse a raw message and collect its scannable attachments.
pub fn candidate_parts(raw: &[u8]) -> Result<Vec<AttachmentPart>, EmailError> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or(EmailError::ParseFailed)?;

    let mut parts = Vec::new();
    for (index, attachment) in message.attachments().enumerate() {
        let content_type = mime_type_from_content_type(attachment.content_type());
        if !is_scannable(&content_type) {
            tracing::debug!(content_type = %content_type, "skipping non-scannable attachment");
            continue;
        }
        let filename = attachment
            .attachment_name()
            .map(str::to_string)
            .or_else(|| attachment.content_id().map(str::to_string))
            .unwrap_or_else(|| format!("part-{index}"));
        parts.push(AttachmentPart {
            content_type,
            filename,
            data: attachment.contents().to_vec(),
        });
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    fn build_message(attachments: &[(&str, &str, &[u8])]) -> Vec<u8> {
        let mut msg = String::from(
            "From: sender@example.com\r\n\
             To: victim@example.com\r\n\
             Subject: hot stock tips\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: multipart/mixed; boundary=\"SIEVE\"\r\n\
             \r\n\
             --SIEVE\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             see attached\r\n",
        );
        for (content_type, name, data) in attachments {
            let encoded = base64::engine::general_purpose::STANDARD.encode(data);
            msg.push_str(&format!(
                "--SIEVE\r\n\
                 Content-Type: {content_type}; name=\"{name}\"\r\n\
                 Content-Disposition: attachment; filename=\"{name}\"\r\n\
                 Content-Transfer-Encoding: base64\r\n\
                 \r\n\
                 {encoded}\r\n"
            ));
        }
        msg.push_str("--SIEVE--\r\n");
        msg.into_bytes()
    }

    #[test]
    fn collects_image_and_pdf_attachments() {
        let raw = build_message(&[
            ("image/gif", "pill.gif", b"GIF89a fake"),
            ("application/pdf", "doc.pdf", b"%PDF-1.4 fake"),
            ("text/html", "page.html", b"<html></html>"),
        ]);
        let parts = candidate_parts(&raw).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].content_type, "image/gif");
        assert_eq!(parts[0].filename, "pill.gif");
        assert_eq!(parts[0].data, b"GIF89a fake");
        assert_eq!(parts[1].content_type, "application/pdf");
    }

    #[test]
    fn octet_stream_counts_as_scannable() {
        let raw = build_message(&[("application/octet-stream", "mystery.bin", b"GIF89a")]);
        let parts = candidate_parts(&raw).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].content_type, "application/octet-stream");
    }

    #[test]
    fn message_without_attachments_yields_empty() {
        let raw = b"From: a@example.com\r\nSubject: hi\r\n\r\njust text\r\n";
        let parts = candidate_parts(raw).unwrap();
        assert!(parts.is_empty());
    }
}

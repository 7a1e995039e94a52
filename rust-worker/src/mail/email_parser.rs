//! RFC 5322 email parser using mailparse.
//!
//! Turns raw message content into the handful of fields payload extraction
//! and correlation need: ids, addresses, subject, and the text/HTML bodies.

use anyhow::{Context, Result};
use mailparse::{parse_mail, DispositionType, MailHeaderMap, ParsedMail};
use tracing::{debug, warn};

use super::MessageContent;

/// Normalised email.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedEmail {
    /// Message-Id header value (without angle brackets)
    pub message_id: Option<String>,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
}

impl ParsedEmail {
    /// Normalise either content shape into a `ParsedEmail`.
    pub fn from_content(content: &MessageContent) -> Result<Self> {
        match content {
            MessageContent::Rfc822 { raw } => parse_raw_email(raw),
            MessageContent::Fields {
                from,
                to,
                subject,
                text,
                html,
            } => Ok(ParsedEmail {
                message_id: None,
                from: from.clone(),
                to: to.clone(),
                subject: subject.clone(),
                text: text.clone().filter(|t| !t.trim().is_empty()),
                html: html.clone().filter(|h| !h.trim().is_empty()),
            }),
        }
    }
}

/// Parse raw RFC 5322 email content.
pub fn parse_raw_email(raw_content: &str) -> Result<ParsedEmail> {
    let mail = parse_mail(raw_content.as_bytes()).context("Failed to parse email")?;

    let message_id = mail
        .headers
        .get_first_value("Message-Id")
        .or_else(|| mail.headers.get_first_value("Message-ID"))
        .map(|id| id.trim().trim_matches(|c| c == '<' || c == '>').to_string())
        .filter(|id| !id.is_empty());

    let header = |name: &str| mail.headers.get_first_value(name).unwrap_or_default();

    let mut text_parts = Vec::new();
    let mut html_parts = Vec::new();
    collect_bodies(&mail, &mut text_parts, &mut html_parts);

    let parsed = ParsedEmail {
        message_id,
        from: header("From"),
        to: header("To"),
        subject: header("Subject"),
        text: join_parts(text_parts),
        html: join_parts(html_parts),
    };

    debug!(
        message_id = ?parsed.message_id,
        has_text = parsed.text.is_some(),
        has_html = parsed.html.is_some(),
        "email_parse_complete"
    );

    Ok(parsed)
}

/// Walk the MIME tree collecting text/plain and text/html bodies.
///
/// Attachments are skipped. A text/plain body that is really HTML is
/// treated as HTML.
fn collect_bodies(mail: &ParsedMail, text: &mut Vec<String>, html: &mut Vec<String>) {
    if mail.get_content_disposition().disposition == DispositionType::Attachment {
        return;
    }

    let content_type = mail.ctype.mimetype.as_str();

    if content_type.starts_with("multipart/") {
        for part in &mail.subparts {
            collect_bodies(part, text, html);
        }
        return;
    }

    match content_type {
        "text/html" => {
            if let Some(body) = extract_body_text(mail) {
                html.push(body);
            }
        }
        "text/plain" => {
            if let Some(body) = extract_body_text(mail) {
                let lower = body.to_lowercase();
                if lower.contains("<html") || lower.contains("<body") {
                    warn!("email_plain_contains_html");
                    html.push(body);
                } else {
                    text.push(body);
                }
            }
        }
        _ => {}
    }
}

fn join_parts(parts: Vec<String>) -> Option<String> {
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

/// Extract the body text from a mail part.
fn extract_body_text(mail: &ParsedMail) -> Option<String> {
    match mail.get_body() {
        Ok(body) if body.trim().is_empty() => None,
        Ok(body) => Some(body),
        Err(e) => {
            warn!(error = %e, "email_body_extraction_failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_text_email() {
        let raw = "Message-Id: <test123@example.com>\r\n\
From: VFS <noreply@vfsglobal.com>\r\n\
To: inbox+job-42@example.com\r\n\
Subject: Code: 123456\r\n\
Content-Type: text/plain\r\n\
\r\n\
Your OTP is 123456\r\n";

        let result = parse_raw_email(raw).unwrap();

        assert_eq!(result.message_id, Some("test123@example.com".to_string()));
        assert_eq!(result.subject, "Code: 123456");
        assert_eq!(result.to, "inbox+job-42@example.com");
        assert!(result.from.contains("vfsglobal.com"));
        assert!(result.text.unwrap().contains("123456"));
        assert!(result.html.is_none());
    }

    #[test]
    fn test_parse_multipart_alternative() {
        let raw = r#"Message-Id: <multi123@example.com>
Subject: Multipart Test
Content-Type: multipart/alternative; boundary="boundary123"

--boundary123
Content-Type: text/plain

Plain text version

--boundary123
Content-Type: text/html

<html><body>HTML version</body></html>

--boundary123--"#;

        let result = parse_raw_email(raw).unwrap();

        assert!(result.text.unwrap().contains("Plain text version"));
        assert!(result.html.unwrap().contains("HTML version"));
    }

    #[test]
    fn test_parse_skips_attachments() {
        let raw = r#"Subject: With attachment
Content-Type: multipart/mixed; boundary="outer"

--outer
Content-Type: text/plain

Body text

--outer
Content-Type: text/plain
Content-Disposition: attachment; filename="codes.txt"

999999

--outer--"#;

        let result = parse_raw_email(raw).unwrap();
        let text = result.text.unwrap();
        assert!(text.contains("Body text"));
        assert!(!text.contains("999999"));
    }

    #[test]
    fn test_parse_no_message_id() {
        let raw = "Subject: No Message ID\r\nContent-Type: text/html\r\n\r\n<html>Test</html>";

        let result = parse_raw_email(raw).unwrap();

        assert!(result.message_id.is_none());
        assert!(result.html.is_some());
    }

    #[test]
    fn test_plain_body_with_html_is_html() {
        let raw = "Content-Type: text/plain\r\n\r\n<html><body><a href=\"https://x\">go</a></body></html>";
        let result = parse_raw_email(raw).unwrap();
        assert!(result.text.is_none());
        assert!(result.html.is_some());
    }

    #[test]
    fn test_from_fields_content() {
        let content = MessageContent::Fields {
            from: "a@example.com".to_string(),
            to: "b@example.com".to_string(),
            subject: "Hi".to_string(),
            text: Some("   ".to_string()),
            html: Some("<p>x</p>".to_string()),
        };
        let parsed = ParsedEmail::from_content(&content).unwrap();
        assert_eq!(parsed.to, "b@example.com");
        assert!(parsed.text.is_none());
        assert_eq!(parsed.html.as_deref(), Some("<p>x</p>"));
    }
}

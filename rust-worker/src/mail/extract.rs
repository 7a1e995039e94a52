//! Payload extraction from normalised mail.
//!
//! Two kinds of rule, tried in order:
//! - a structural rule: CSS selector over the HTML body (link or element text)
//! - regular expressions over the subject, then the text body

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use scraper::{Html, Selector};
use tracing::debug;

use super::ParsedEmail;

/// Patterns used when none are configured: common one-time-code phrasings,
/// then a bare six digit number as a last resort.
pub const DEFAULT_PATTERNS: &[&str] = &[
    r"(?i)OTP[:\s]+([0-9]{4,8})",
    r"(?i)verification code[:\s]+([0-9]{4,8})",
    r"(?i)one-time password[:\s]+([0-9]{4,8})",
    r"(?i)code[:\s]+([0-9]{4,8})",
    r"\b([0-9]{6})\b",
];

#[derive(Debug, Clone)]
struct StructuralRule {
    selector: Selector,
    /// Attribute to read; `None` reads the element text.
    attribute: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PayloadExtractor {
    patterns: Vec<Regex>,
    structural: Option<StructuralRule>,
}

impl PayloadExtractor {
    pub fn new(patterns: &[String], selector: Option<&str>, attribute: Option<&str>) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("invalid payload pattern {p:?}")))
            .collect::<Result<Vec<_>>>()?;

        let structural = match selector {
            Some(raw) => {
                let selector = Selector::parse(raw)
                    .map_err(|e| anyhow!("invalid payload selector {raw:?}: {e:?}"))?;
                Some(StructuralRule {
                    selector,
                    attribute: attribute.map(str::to_string).filter(|a| !a.is_empty()),
                })
            }
            None => None,
        };

        if patterns.is_empty() && structural.is_none() {
            return Err(anyhow!("at least one payload pattern or selector is required"));
        }

        Ok(Self {
            patterns,
            structural,
        })
    }

    pub fn with_default_patterns() -> Self {
        Self {
            patterns: DEFAULT_PATTERNS
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
            structural: None,
        }
    }

    /// Extract the trigger payload, or `None` if no rule matches.
    pub fn extract(&self, email: &ParsedEmail) -> Option<String> {
        if let (Some(rule), Some(html)) = (&self.structural, email.html.as_deref()) {
            if let Some(value) = select_first(html, rule) {
                debug!(rule = "selector", payload_length = value.len(), "payload_extracted");
                return Some(value);
            }
        }

        let body = match (&email.text, &email.html) {
            (Some(text), _) => Some(text.clone()),
            (None, Some(html)) => Some(html_to_text(html)),
            (None, None) => None,
        };

        for pattern in &self.patterns {
            let haystacks = std::iter::once(email.subject.as_str()).chain(body.as_deref());
            for haystack in haystacks {
                if let Some(value) = first_capture(pattern, haystack) {
                    debug!(
                        rule = "pattern",
                        pattern = pattern.as_str(),
                        payload_length = value.len(),
                        "payload_extracted"
                    );
                    return Some(value);
                }
            }
        }

        None
    }
}

fn first_capture(pattern: &Regex, haystack: &str) -> Option<String> {
    let captures = pattern.captures(haystack)?;
    captures
        .get(1)
        .or_else(|| captures.get(0))
        .map(|m| m.as_str().trim().to_string())
        .filter(|v| !v.is_empty())
}

fn select_first(html: &str, rule: &StructuralRule) -> Option<String> {
    let document = Html::parse_document(html);
    document.select(&rule.selector).find_map(|element| {
        let value = match &rule.attribute {
            Some(attr) => element.value().attr(attr).map(str::to_string),
            None => Some(element.text().collect::<String>()),
        }?;
        let value = value.trim().to_string();
        (!value.is_empty()).then_some(value)
    })
}

/// Flatten an HTML document to its visible text.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    document
        .root_element()
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(subject: &str, text: Option<&str>, html: Option<&str>) -> ParsedEmail {
        ParsedEmail {
            subject: subject.to_string(),
            text: text.map(str::to_string),
            html: html.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_patterns_subject_code() {
        let extractor = PayloadExtractor::with_default_patterns();
        assert_eq!(
            extractor.extract(&email("Code: 123456", None, None)),
            Some("123456".to_string())
        );
    }

    #[test]
    fn test_default_patterns_body_otp() {
        let extractor = PayloadExtractor::with_default_patterns();
        let mail = email("Your login", Some("Hello,\nYour OTP: 4821\nThanks"), None);
        assert_eq!(extractor.extract(&mail), Some("4821".to_string()));
    }

    #[test]
    fn test_pattern_order_wins() {
        let extractor = PayloadExtractor::with_default_patterns();
        // The explicit phrasing beats the bare six digit fallback.
        let mail = email("Ref 999999", Some("verification code: 12345678"), None);
        assert_eq!(extractor.extract(&mail), Some("12345678".to_string()));
    }

    #[test]
    fn test_html_only_body_is_flattened() {
        let extractor = PayloadExtractor::with_default_patterns();
        let mail = email("Welcome", None, Some("<html><body><p>OTP: <b>7777</b></p></body></html>"));
        assert_eq!(extractor.extract(&mail), Some("7777".to_string()));
    }

    #[test]
    fn test_structural_rule_reads_link() {
        let extractor = PayloadExtractor::new(
            &[],
            Some(r#"a[href*="confirm"]"#),
            Some("href"),
        )
        .unwrap();
        let html = r#"<html><body>
            <a href="https://example.com/help">Help</a>
            <a href="https://example.com/confirm?t=abc">Confirm</a>
        </body></html>"#;
        assert_eq!(
            extractor.extract(&email("Confirm your account", None, Some(html))),
            Some("https://example.com/confirm?t=abc".to_string())
        );
    }

    #[test]
    fn test_structural_rule_falls_back_to_patterns() {
        let extractor = PayloadExtractor::new(
            &[r"token=(\w+)".to_string()],
            Some("a.missing"),
            Some("href"),
        )
        .unwrap();
        let mail = email("x", Some("see token=xyz"), Some("<p>nothing</p>"));
        assert_eq!(extractor.extract(&mail), Some("xyz".to_string()));
    }

    #[test]
    fn test_no_match() {
        let extractor = PayloadExtractor::with_default_patterns();
        assert_eq!(extractor.extract(&email("Newsletter", Some("no codes here"), None)), None);
    }

    #[test]
    fn test_invalid_rules_rejected() {
        assert!(PayloadExtractor::new(&["(".to_string()], None, None).is_err());
        assert!(PayloadExtractor::new(&[], Some("a[[["), None).is_err());
        assert!(PayloadExtractor::new(&[], None, None).is_err());
    }
}

//! Sender and subject filtering for candidate trigger messages.

use tracing::debug;

use super::ParsedEmail;

/// Which messages are considered at all. Empty lists accept everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterRules {
    /// Sender substrings or domains, matched case-insensitively.
    pub senders: Vec<String>,
    /// Subject substrings, matched case-insensitively.
    pub subjects: Vec<String>,
}

impl FilterRules {
    pub fn new(senders: Option<Vec<String>>, subjects: Option<Vec<String>>) -> Self {
        Self {
            senders: normalise(senders),
            subjects: normalise(subjects),
        }
    }

    pub fn accepts(&self, email: &ParsedEmail) -> bool {
        let sender = email.from.to_lowercase();
        if !self.senders.is_empty() && !self.senders.iter().any(|s| sender.contains(s.as_str())) {
            debug!(sender = %email.from, "mail_filter_sender_rejected");
            return false;
        }

        let subject = email.subject.to_lowercase();
        if !self.subjects.is_empty() && !self.subjects.iter().any(|s| subject.contains(s.as_str())) {
            debug!(subject = %email.subject, "mail_filter_subject_rejected");
            return false;
        }

        true
    }
}

fn normalise(list: Option<Vec<String>>) -> Vec<String> {
    list.unwrap_or_default()
        .into_iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

//! Pre-download screening. Oversized messages, blacklisted senders and
//! subjects matching suspicious patterns are refused before the body is
//! fetched, and are never indexed.
use crate::types::Envelope;

pub const DEFAULT_SUSPICIOUS_PATTERNS: [&str; 8] = [
    "urgent",
    "verify account",
    "suspended",
    "click here immediately",
    "congratulations",
    "you won",
    "claim your prize",
    "act now",
];

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScreeningRules {
    pub max_message_bytes: Option<u64>,
    /// Case-insensitive substrings of the `From` header.
    pub blacklist_senders: Vec<String>,
    /// Case-insensitive substrings of the `Subject` header.
    pub suspicious_patterns: Vec<String>,
}

impl ScreeningRules {
    /// Whether any rule needs the envelope before download.
    pub fn is_active(&self) -> bool {
        self.max_message_bytes.is_some()
            || !self.blacklist_senders.is_empty()
            || !self.suspicious_patterns.is_empty()
    }

    /// Reasons to refuse the message; empty when it may be downloaded.
    pub fn check(&self, envelope: &Envelope) -> Vec<String> {
        let mut reasons = Vec::new();

        if let Some(reason) = envelope.size.and_then(|size| self.check_size(size)) {
            reasons.push(reason);
        }

        let sender = envelope.sender.to_lowercase();
        if !sender.is_empty()
            && self
                .blacklist_senders
                .iter()
                .any(|blocked| !blocked.is_empty() && sender.contains(&blocked.to_lowercase()))
        {
            reasons.push(format!("sender is blacklisted: {}", envelope.sender));
        }

        let subject = envelope.subject.to_lowercase();
        let hits: Vec<&str> = self
            .suspicious_patterns
            .iter()
            .map(String::as_str)
            .filter(|pattern| !pattern.is_empty() && subject.contains(&pattern.to_lowercase()))
            .collect();
        if !hits.is_empty() {
            reasons.push(format!("suspicious subject: {}", hits.join(", ")));
        }

        reasons
    }

    pub fn check_size(&self, size: u64) -> Option<String> {
        match self.max_message_bytes {
            Some(max) if size > max => Some(format!("size {} bytes exceeds limit of {}", size, max)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> ScreeningRules {
        ScreeningRules {
            max_message_bytes: Some(1024),
            blacklist_senders: vec!["spam.example".into()],
            suspicious_patterns: DEFAULT_SUSPICIOUS_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn clean_envelope_passes() {
        let envelope = Envelope {
            size: Some(512),
            sender: "Alice <alice@example.com>".into(),
            subject: "Quarterly numbers".into(),
        };
        assert!(rules().check(&envelope).is_empty());
    }

    #[test]
    fn every_broken_rule_is_reported() {
        let envelope = Envelope {
            size: Some(4096),
            sender: "Prize Desk <desk@SPAM.example>".into(),
            subject: "URGENT: you won".into(),
        };
        let reasons = rules().check(&envelope);
        assert_eq!(reasons.len(), 3);
        assert!(reasons[0].contains("4096"));
        assert!(reasons[1].contains("blacklisted"));
        assert!(reasons[2].contains("urgent, you won"));
    }

    #[test]
    fn unknown_size_is_not_held_against_the_message() {
        let envelope = Envelope {
            size: None,
            ..Envelope::default()
        };
        assert!(rules().check(&envelope).is_empty());
        assert!(!ScreeningRules::default().is_active());
    }
}

//! Best-effort PII scrubbing applied to chunks before they are indexed.
//!
//! Regex-only: false positives and misses are expected. This is a hygiene
//! filter, not a security boundary.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

pub const DEFAULT_MASK: &str = "[REDACTED]";

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("valid email regex")
});
static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\+?1[-.\s]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}\b")
        .expect("valid phone regex")
});
static SSN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("valid ssn regex"));
// Naive: any 13-19 digit run with optional separators.
static CARD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d[ -]*?){13,19}\b").expect("valid card regex"));

/// Matches found in a text, per category.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PiiMatches {
    pub emails: Vec<String>,
    pub phones: Vec<String>,
    pub ssns: Vec<String>,
    pub cards: Vec<String>,
}

impl PiiMatches {
    pub fn is_empty(&self) -> bool {
        self.emails.is_empty() && self.phones.is_empty() && self.ssns.is_empty() && self.cards.is_empty()
    }
}

fn find_all(re: &Regex, text: &str) -> Vec<String> {
    re.find_iter(text).map(|m| m.as_str().to_string()).collect()
}

pub fn detect(text: &str) -> PiiMatches {
    PiiMatches {
        emails: find_all(&EMAIL_RE, text),
        phones: find_all(&PHONE_RE, text),
        ssns: find_all(&SSN_RE, text),
        cards: find_all(&CARD_RE, text),
    }
}

/// Replace every match with `mask`. Patterns run in order: email, phone,
/// SSN, card.
pub fn redact(text: &str, mask: &str) -> String {
    [&*EMAIL_RE, &*PHONE_RE, &*SSN_RE, &*CARD_RE]
        .iter()
        .fold(text.to_string(), |acc, re| {
            re.replace_all(&acc, regex::NoExpand(mask)).into_owned()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_email_and_ssn() {
        let out = redact("mail jane.doe@example.com, ssn 123-45-6789.", DEFAULT_MASK);
        assert_eq!(out, "mail [REDACTED], ssn [REDACTED].");
    }

    #[test]
    fn test_redacts_phone() {
        let out = redact("call 555-123-4567 today", DEFAULT_MASK);
        assert_eq!(out, "call [REDACTED] today");
    }

    #[test]
    fn test_redacts_card_number() {
        let out = redact("card 4111 1111 1111 1111 on file", "#");
        assert!(!out.contains("4111"));
    }

    #[test]
    fn test_plain_text_untouched() {
        let text = "Employees accrue 20 days of leave per year.";
        assert_eq!(redact(text, DEFAULT_MASK), text);
        assert!(detect(text).is_empty());
    }

    #[test]
    fn test_detect_categories() {
        let m = detect("a@b.io and 123-45-6789");
        assert_eq!(m.emails, vec!["a@b.io"]);
        assert_eq!(m.ssns, vec!["123-45-6789"]);
    }

    #[test]
    fn test_mask_is_literal() {
        assert_eq!(redact("x@y.com", "$1"), "$1");
    }
}

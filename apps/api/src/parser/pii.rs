//! Conservative PII masking for cleaned document text.
//!
//! Only e-mail addresses and phone numbers are masked. The patterns are
//! intentionally narrow: a false negative leaves a contact line in the text,
//! a false positive destroys resume content the matcher needs.

use regex::Regex;
use std::sync::OnceLock;

pub const EMAIL_TOKEN: &str = "[EMAIL]";
pub const PHONE_TOKEN: &str = "[PHONE]";

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("static regex")
    })
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // International or local formats with at least 7 digits total, allowing
    // separators. Anchored on word boundaries so years and ids stay intact.
    RE.get_or_init(|| {
        Regex::new(r"(?x)
            (?:\+\d{1,3}[\s.\-]?)?       # optional country code
            (?:\(\d{2,4}\)[\s.\-]?)?     # optional area code in parens
            \d{2,4}[\s.\-]\d{2,4}[\s.\-]\d{2,4}(?:[\s.\-]\d{2,4})?
            |\+\d{9,14}
        ")
        .expect("static regex")
    })
}

/// Originals removed from the text, returned out-of-band to the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedPii {
    pub emails: Vec<String>,
    pub phones: Vec<String>,
}

impl ExtractedPii {
    pub fn primary_email(&self) -> Option<&str> {
        self.emails.first().map(String::as_str)
    }

    pub fn primary_phone(&self) -> Option<&str> {
        self.phones.first().map(String::as_str)
    }
}

/// Replaces e-mails and phone numbers with their tokens and returns the
/// originals. Deterministic: same text in, same masked text and PII out.
pub fn mask_pii(text: &str) -> (String, ExtractedPii) {
    let mut pii = ExtractedPii::default();

    let masked = email_re().replace_all(text, |caps: &regex::Captures<'_>| {
        pii.emails.push(caps[0].to_string());
        EMAIL_TOKEN
    });

    let masked = phone_re().replace_all(&masked, |caps: &regex::Captures<'_>| {
        let candidate = caps[0].trim();
        let digits = candidate.chars().filter(|c| c.is_ascii_digit()).count();
        if digits >= 7 {
            pii.phones.push(candidate.to_string());
            PHONE_TOKEN.to_string()
        } else {
            candidate.to_string()
        }
    });

    (masked.into_owned(), pii)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks_email() {
        let (masked, pii) = mask_pii("Contact: jane.doe+cv@example.co.uk for details");
        assert_eq!(masked, "Contact: [EMAIL] for details");
        assert_eq!(pii.emails, vec!["jane.doe+cv@example.co.uk"]);
    }

    #[test]
    fn test_masks_international_phone() {
        let (masked, pii) = mask_pii("Call +971501234567 today");
        assert_eq!(masked, "Call [PHONE] today");
        assert_eq!(pii.phones.len(), 1);
    }

    #[test]
    fn test_masks_separated_phone() {
        let (masked, pii) = mask_pii("Phone: 050 123 4567.");
        assert!(masked.contains(PHONE_TOKEN), "got: {masked}");
        assert_eq!(pii.primary_phone(), Some("050 123 4567"));
    }

    #[test]
    fn test_leaves_years_alone() {
        let (masked, pii) = mask_pii("Worked 2019 - 2023 on pipelines, 8 years total");
        assert!(!masked.contains(PHONE_TOKEN), "got: {masked}");
        assert!(pii.phones.is_empty());
    }

    #[test]
    fn test_multiple_emails_collected_in_order() {
        let (_, pii) = mask_pii("a@x.com then b@y.org");
        assert_eq!(pii.emails, vec!["a@x.com", "b@y.org"]);
        assert_eq!(pii.primary_email(), Some("a@x.com"));
    }

    #[test]
    fn test_deterministic() {
        let text = "jane@x.com / +14155550123";
        assert_eq!(mask_pii(text), mask_pii(text));
    }
}

//! Best-effort lead field extraction from caller speech
//!
//! Pattern matching over the caller's finalized utterances. The first
//! match in call order wins for each field. Nothing here is guaranteed to
//! be right; the record keeps the full transcript alongside.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Fields pulled out of the transcript for the call record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedFields {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub business_type: Option<String>,
}

static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap()
});

/// "john at acme dot com"
static SPOKEN_EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([a-z0-9._%+-]+)\s+at\s+([a-z0-9-]+(?:\s+dot\s+[a-z0-9-]+)+)\b").unwrap()
});

static PHONE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+?\d[\d\s().-]{5,}\d").unwrap());

static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:(?i:my\s+name\s+is)|(?i:this\s+is)|(?i:i['’]m)|(?i:i\s+am))\s+([A-Z][a-zA-Z'-]+(?:\s+[A-Z][a-zA-Z'-]+)?)",
    )
    .unwrap()
});

static BUSINESS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:i\s+run|i\s+own|i\s+have|we\s+are|we['’]re|my\s+business\s+is)\s+(?:a|an)\s+([a-z][a-z\- ]*?)\s*(?:\b(?:business|company|in|and|called|based|from|with|that|so)\b|[.,!?;]|$)",
    )
    .unwrap()
});

/// Capitalised words that follow "I'm" / "this is" without being names
const NOT_NAMES: &[&str] = &[
    "Calling", "Looking", "Interested", "Just", "Not", "Here", "Fine", "Good", "Sorry", "Trying",
    "Wondering", "Sure", "Okay", "Great",
];

/// Nouns that follow "I have a" without describing a business
const NOT_BUSINESSES: &[&str] = &[
    "question", "questions", "problem", "minute", "moment", "second", "quote", "call",
];

/// Extract fields from caller lines, falling back to `caller_id` for the phone
pub fn extract_fields<'a, I>(caller_lines: I, caller_id: Option<&str>) -> ExtractedFields
where
    I: IntoIterator<Item = &'a str>,
{
    let mut fields = ExtractedFields::default();

    for line in caller_lines {
        if fields.email.is_none() {
            fields.email = find_email(line);
        }
        if fields.phone.is_none() {
            fields.phone = find_phone(line);
        }
        if fields.name.is_none() {
            fields.name = find_name(line);
        }
        if fields.business_type.is_none() {
            fields.business_type = find_business_type(line);
        }
    }

    if fields.phone.is_none() {
        fields.phone = caller_id.and_then(find_phone);
    }

    fields
}

fn find_email(line: &str) -> Option<String> {
    if let Some(m) = EMAIL_REGEX.find(line) {
        return Some(m.as_str().trim_end_matches('.').to_lowercase());
    }

    let caps = SPOKEN_EMAIL_REGEX.captures(line)?;
    let user = caps.get(1)?.as_str();
    let domain = caps
        .get(2)?
        .as_str()
        .split_whitespace()
        .filter(|w| !w.eq_ignore_ascii_case("dot"))
        .collect::<Vec<_>>()
        .join(".");
    Some(format!("{}@{}", user, domain).to_lowercase())
}

fn find_phone(line: &str) -> Option<String> {
    PHONE_REGEX.find_iter(line).find_map(|m| {
        let raw = m.as_str();
        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        if (7..=15).contains(&digits.len()) {
            if raw.starts_with('+') {
                Some(format!("+{}", digits))
            } else {
                Some(digits)
            }
        } else {
            None
        }
    })
}

fn find_name(line: &str) -> Option<String> {
    NAME_REGEX.captures_iter(line).find_map(|caps| {
        let name = caps.get(1)?.as_str();
        let first = name.split_whitespace().next()?;
        if NOT_NAMES.contains(&first) {
            None
        } else {
            Some(name.to_string())
        }
    })
}

fn find_business_type(line: &str) -> Option<String> {
    BUSINESS_REGEX.captures_iter(line).find_map(|caps| {
        let kind = caps.get(1)?.as_str().trim().to_lowercase();
        let last = kind.split_whitespace().last()?;
        if NOT_BUSINESSES.contains(&last) {
            None
        } else {
            Some(kind)
        }
    })
}

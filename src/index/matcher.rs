//! Attribute matching for C-FIND and C-MOVE identifiers

use std::cmp::Ordering;

use dicom_core::VR;
use regex::{Regex, RegexBuilder};

/// Matching rule for one key of a query identifier
///
/// A query value holding several values (backslash separated) matches when
/// any of them does; a stored multi-valued attribute matches when any of its
/// values does.
#[derive(Debug, Clone)]
pub struct Matcher {
    alternatives: Vec<Pattern>,
}

#[derive(Debug, Clone)]
enum Pattern {
    /// Case-sensitive equality
    Exact(String),
    /// `*` and `?` wildcards, case-insensitive
    Wildcard(Regex),
    /// Inclusive date/time range, either side open
    Range {
        lower: Option<String>,
        upper: Option<String>,
    },
}

impl Matcher {
    /// Builds the rule for a key value of the given VR
    pub fn new(vr: VR, value: &str) -> Result<Self, regex::Error> {
        let value = value.trim_matches(|c: char| c.is_whitespace() || c == '\0');
        if value.is_empty() || value == "*" {
            return Ok(Self::universal());
        }

        let alternatives = value
            .split('\\')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Pattern::parse(vr, v))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { alternatives })
    }

    pub fn universal() -> Self {
        Self {
            alternatives: Vec::new(),
        }
    }

    pub fn is_universal(&self) -> bool {
        self.alternatives.is_empty()
    }

    /// The literal value when this is a single exact match
    pub fn single_value(&self) -> Option<&str> {
        match self.alternatives.as_slice() {
            [Pattern::Exact(value)] => Some(value.as_str()),
            _ => None,
        }
    }

    /// Every literal value when all alternatives are exact matches
    pub fn exact_values(&self) -> Option<Vec<&str>> {
        if self.is_universal() {
            return None;
        }
        self.alternatives
            .iter()
            .map(|p| match p {
                Pattern::Exact(value) => Some(value.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Matches a stored value; callers decide what an absent value means
    pub fn matches(&self, stored: &str) -> bool {
        if self.is_universal() {
            return true;
        }
        stored
            .split('\\')
            .map(str::trim)
            .any(|value| self.alternatives.iter().any(|p| p.matches(value)))
    }
}

impl Pattern {
    fn parse(vr: VR, value: &str) -> Result<Self, regex::Error> {
        match vr {
            VR::UI => Ok(Pattern::Exact(value.to_string())),
            VR::DA | VR::TM | VR::DT => Ok(parse_temporal(vr, value)),
            _ if value.contains(['*', '?']) => wildcard(value).map(Pattern::Wildcard),
            _ => Ok(Pattern::Exact(value.to_string())),
        }
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::Exact(expected) => value == expected,
            Pattern::Wildcard(regex) => regex.is_match(value),
            Pattern::Range { lower, upper } => {
                if value.is_empty() {
                    return false;
                }
                lower
                    .as_deref()
                    .map_or(true, |l| compare_prefix(value, l) != Ordering::Less)
                    && upper
                        .as_deref()
                        .map_or(true, |u| compare_prefix(value, u) != Ordering::Greater)
            }
        }
    }
}

fn parse_temporal(vr: VR, value: &str) -> Pattern {
    let clean = |s: &str| -> Option<String> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        Some(match vr {
            VR::TM => s.replace(':', ""),
            VR::DA => s.replace('.', ""),
            VR::DT => without_utc_offset(s).to_string(),
            _ => s.to_string(),
        })
    };
    match range_separator(vr, value) {
        Some(i) => Pattern::Range {
            lower: clean(&value[..i]),
            upper: clean(&value[i + 1..]),
        },
        None => {
            let v = clean(value);
            Pattern::Range {
                lower: v.clone(),
                upper: v,
            }
        }
    }
}

/// Position of the `-` splitting a range; in DT values a `-HHMM` UTC offset
/// is part of the bound, not a separator
fn range_separator(vr: VR, value: &str) -> Option<usize> {
    if vr != VR::DT {
        return value.find('-');
    }
    let bytes = value.as_bytes();
    value
        .match_indices('-')
        .map(|(i, _)| i)
        .find(|&i| !is_utc_offset(bytes, i))
}

fn is_utc_offset(bytes: &[u8], at: usize) -> bool {
    let digits = bytes
        .get(at + 1..at + 5)
        .map_or(false, |d| d.iter().all(u8::is_ascii_digit));
    let closed = matches!(bytes.get(at + 5), None | Some(b'-'));
    let start = bytes[..at]
        .iter()
        .rposition(|&b| b == b'-')
        .map_or(0, |p| p + 1);
    // the offset must follow at least a full date
    digits && closed && at - start >= 8
}

fn without_utc_offset(value: &str) -> &str {
    let bytes = value.as_bytes();
    match bytes.len().checked_sub(5) {
        Some(at)
            if at >= 8
                && matches!(bytes[at], b'+' | b'-')
                && bytes[at + 1..].iter().all(u8::is_ascii_digit) =>
        {
            &value[..at]
        }
        _ => value,
    }
}

/// Orders `value` against `bound` on their common prefix, so `20240131` lies
/// within `2024-2024` and `101530` within `1015`
fn compare_prefix(value: &str, bound: &str) -> Ordering {
    let n = value.len().min(bound.len());
    value.as_bytes()[..n].cmp(&bound.as_bytes()[..n])
}

fn wildcard(value: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::with_capacity(value.len() + 8);
    pattern.push('^');
    for c in value.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            c => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    pattern.push('$');
    RegexBuilder::new(&pattern).case_insensitive(true).build()
}

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::{Captures, Regex};

/// Tokens shorter than this never take part in matching.
pub(crate) const MIN_TERM_CHARS: usize = 3;

fn entity_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});")
            .expect("entity pattern is a valid regex")
    })
}

fn markup_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)\s*>|<!--.*?-->|<[^>]*>")
            .expect("markup pattern is a valid regex")
    })
}

pub(crate) fn decode_entities(input: &str) -> String {
    entity_pattern()
        .replace_all(input, |caps: &Captures<'_>| {
            let raw = &caps[1];
            decode_entity(raw).map(String::from).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn decode_entity(raw: &str) -> Option<char> {
    if let Some(hex) = raw.strip_prefix("#x").or_else(|| raw.strip_prefix("#X")) {
        return u32::from_str_radix(hex, 16).ok().and_then(char::from_u32);
    }
    if let Some(decimal) = raw.strip_prefix('#') {
        return decimal.parse::<u32>().ok().and_then(char::from_u32);
    }

    let decoded = match raw {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => ' ',
        "ndash" => '–',
        "mdash" => '—',
        "hellip" => '…',
        "laquo" => '«',
        "raquo" => '»',
        "lsquo" => '‘',
        "rsquo" => '’',
        "ldquo" => '“',
        "rdquo" => '”',
        "copy" => '©',
        "reg" => '®',
        "deg" => '°',
        "times" => '×',
        _ => return None,
    };
    Some(decoded)
}

pub(crate) fn strip_markup(input: &str) -> String {
    markup_pattern().replace_all(input, " ").into_owned()
}

/// Entity-decoded, markup-free, lowercased text where every run of
/// non-alphanumeric characters is a single space.
pub(crate) fn normalize(input: &str) -> String {
    let decoded = decode_entities(input);
    let stripped = strip_markup(&decoded);

    let mut normalized = String::with_capacity(stripped.len());
    let mut pending_space = false;
    for ch in stripped.chars() {
        if ch.is_alphanumeric() {
            if pending_space && !normalized.is_empty() {
                normalized.push(' ');
            }
            pending_space = false;
            normalized.extend(ch.to_lowercase());
        } else {
            pending_space = true;
        }
    }

    normalized
}

/// Distinct terms of `input` in order of first appearance.
pub(crate) fn terms(input: &str) -> Vec<String> {
    let normalized = normalize(input);
    let mut seen = HashSet::new();
    normalized
        .split_whitespace()
        .filter(|token| token.chars().count() >= MIN_TERM_CHARS)
        .filter(|token| seen.insert(token.to_string()))
        .map(str::to_string)
        .collect()
}

/// Lowercased, whitespace-collapsed form used for criterion-name comparison.
pub(crate) fn normalize_label(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoding_patterns_compile_and_match() {
        assert!(entity_pattern().is_match("&amp;"));
        assert!(markup_pattern().is_match("<b>"));
        assert_eq!(strip_markup("a<br/>b"), "a b");
        assert_eq!(decode_entities("x &lt; y"), "x < y");
    }

    #[test]
    fn normalize_strips_markup_and_entities() {
        let normalized = normalize("<p>Cells &amp; <b>ATP</b>&nbsp;production!</p>");
        assert_eq!(normalized, "cells atp production");
    }

    #[test]
    fn normalize_drops_script_bodies() {
        let normalized = normalize("Answer<script>alert('x')</script> here");
        assert_eq!(normalized, "answer here");
    }

    #[test]
    fn normalize_decodes_numeric_entities() {
        assert_eq!(normalize("caf&#233; &#x41;BC"), "café abc");
    }

    #[test]
    fn unknown_entities_are_kept_verbatim() {
        assert_eq!(decode_entities("a &bogus; b"), "a &bogus; b");
    }

    #[test]
    fn terms_drop_short_tokens_and_duplicates() {
        let found = terms("An ox ate the oats; the OX ate more oats.");
        assert_eq!(found, vec!["ate", "the", "oats", "more"]);
    }

    #[test]
    fn terms_of_blank_text_are_empty() {
        assert!(terms("  <br/> ... ").is_empty());
    }

    #[test]
    fn normalize_label_collapses_whitespace() {
        assert_eq!(normalize_label("  Use of\tEvidence "), "use of evidence");
    }

    #[test]
    fn round2_rounds_half_away_from_zero() {
        assert_eq!(round2(46.254), 46.25);
        assert_eq!(round2(46.255_1), 46.26);
    }
}

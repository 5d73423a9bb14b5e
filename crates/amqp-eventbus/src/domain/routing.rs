//! Routing-key matching.
//!
//! Topic patterns are dot-delimited words where `*` matches exactly one word
//! and `#` matches zero or more words.

use super::config::ExchangeKind;

/// Returns true when `routing_key` matches the topic `pattern`. An empty key
/// or pattern has no words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    if pattern == "#" {
        return true;
    }
    match_words(&words(pattern), &words(routing_key))
}

fn words(s: &str) -> Vec<&str> {
    if s.is_empty() {
        Vec::new()
    } else {
        s.split('.').collect()
    }
}

fn match_words(pat: &[&str], key: &[&str]) -> bool {
    let mut pi = 0;
    let mut ki = 0;
    // Backtrack point: (pattern index after the last `#`, key index it consumed up to)
    let mut hash: Option<(usize, usize)> = None;

    loop {
        if pi < pat.len() && pat[pi] == "#" {
            hash = Some((pi + 1, ki));
            pi += 1;
            continue;
        }
        if ki == key.len() && pi == pat.len() {
            return true;
        }
        if ki < key.len() && pi < pat.len() && (pat[pi] == "*" || pat[pi] == key[ki]) {
            pi += 1;
            ki += 1;
            continue;
        }
        match hash {
            Some((resume, consumed)) if consumed < key.len() => {
                hash = Some((resume, consumed + 1));
                pi = resume;
                ki = consumed + 1;
            }
            _ => return false,
        }
    }
}

/// Whether a binding with `pattern` on an exchange of `kind` receives a
/// message published with `routing_key`.
pub fn binding_matches(kind: ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
        ExchangeKind::Direct => pattern == routing_key,
        ExchangeKind::Topic => topic_matches(pattern, routing_key),
    }
}

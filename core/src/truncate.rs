//! Character-counted truncation helpers for caps, tails, and display names.

/// Prefix of `s` holding at most `max` characters.
pub(crate) fn take_first_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Suffix of `s` holding at most `max` characters.
pub(crate) fn take_last_chars(s: &str, max: usize) -> &str {
    let total = s.chars().count();
    if total <= max {
        return s;
    }
    match s.char_indices().nth(total - max) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Middle-style truncation to `max` characters, ellipsis included.
pub(crate) fn truncate_middle(s: &str, max: usize) -> String {
    let total = s.chars().count();
    if total <= max {
        return s.to_string();
    }
    if max <= 1 {
        return "…".to_string();
    }
    let keep = (max - 1) / 2;
    let head = take_first_chars(s, max - 1 - keep);
    let tail = take_last_chars(s, keep);
    format!("{head}…{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn first_and_last_respect_char_boundaries() {
        let s = "héllo wörld";
        assert_eq!(take_first_chars(s, 4), "héll");
        assert_eq!(take_last_chars(s, 4), "örld");
        assert_eq!(take_first_chars(s, 100), s);
        assert_eq!(take_last_chars(s, 100), s);
    }

    #[test]
    fn middle_truncation_keeps_both_ends() {
        let long = "abcdefghijklmnopqrstuvwxyz";
        let out = truncate_middle(long, 9);
        assert_eq!(out.chars().count(), 9);
        assert!(out.starts_with("abcd"));
        assert!(out.ends_with("wxyz"));
        assert!(out.contains('…'));
        assert_eq!(truncate_middle("short", 9), "short");
    }
}

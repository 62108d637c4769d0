//! Glob-style patterns: `*` matches any run of characters, `?` exactly one.
//!
//! Rule tables resolve by specificity: patterns are visited shortest first
//! (ties broken by the pattern text) and the last match wins, so
//! `{"*": deny, "git *": allow}` allows `git status`.

use std::collections::BTreeMap;

use regex_lite::Regex;

fn compile(pattern: &str) -> Option<Regex> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push_str("(?s)^");
    for ch in pattern.chars() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex_lite::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    source.push('$');
    Regex::new(&source).ok()
}

/// Whether `input` matches `pattern` as a whole.
pub fn matches(input: &str, pattern: &str) -> bool {
    compile(pattern).is_some_and(|re| re.is_match(input))
}

/// Resolve `input` against a rule table; `None` when no pattern matches.
pub fn resolve<'a, V>(input: &str, rules: &'a BTreeMap<String, V>) -> Option<&'a V> {
    let mut ordered: Vec<(&String, &V)> = rules.iter().collect();
    ordered.sort_by(|a, b| a.0.len().cmp(&b.0.len()).then_with(|| a.0.cmp(b.0)));
    ordered
        .into_iter()
        .filter(|(pattern, _)| matches(input, pattern))
        .last()
        .map(|(_, value)| value)
}

//! Action canonicalization and glob matching.
//!
//! Actions are stored and compared in `verb:noun` form. Free-form input in
//! any of the accepted spellings (spaces, hyphens, underscores, camelCase,
//! mixed case) collapses to the same canonical token. A bare single word is
//! kept as-is and expanded to `verb:*` at match time, so policies preserve
//! the author's form.

use glob::{MatchOptions, Pattern};

/// Canonicalize a free-form action string to lowercase `verb:noun`.
///
/// `"Read File"`, `"readFile"`, `"read-file"` and `"read_file"` all become
/// `"read:file"`. Nouns of more than one word are joined with `_`
/// (`"send email notification"` → `"send:email_notification"`). A single
/// bare token stays bare. Idempotent: anything already containing `:` is
/// only lowercased.
pub fn normalize(raw: &str) -> String {
    let action = raw.trim();
    if action.contains(':') {
        return action.to_ascii_lowercase();
    }

    // camelCase split must happen before lowercasing
    let spaced = split_camel(action);
    let lowered = spaced.to_ascii_lowercase().replace(['-', '_'], " ");

    let parts: Vec<&str> = lowered.split_whitespace().collect();
    match parts.as_slice() {
        [] => String::new(),
        [single] => (*single).to_string(),
        [verb, nouns @ ..] => format!("{verb}:{}", nouns.join("_")),
    }
}

/// True when the incoming action satisfies a rule's action pattern.
///
/// Both sides are normalized first; a bare side (no `:`, not the lone `*`)
/// is expanded with `:*` before the glob test.
pub fn action_matches(action: &str, pattern: &str) -> bool {
    let text = expand(&normalize(action));
    let pat = expand(&normalize(pattern));
    glob_match(&text, &pat)
}

/// True when the resource satisfies a rule's resource pattern. A missing,
/// empty, or `*` pattern matches anything; `/` is a literal character.
pub fn resource_matches(resource: &str, pattern: Option<&str>) -> bool {
    match pattern {
        None => true,
        Some(p) if p.is_empty() || p == "*" => true,
        Some(p) => glob_match(&resource.to_ascii_lowercase(), &p.to_ascii_lowercase()),
    }
}

fn expand(token: &str) -> String {
    if token.is_empty() || token == "*" || token.contains(':') {
        token.to_string()
    } else {
        format!("{token}:*")
    }
}

fn split_camel(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    let mut prev_lower = false;
    for ch in s.chars() {
        if ch.is_ascii_uppercase() && prev_lower {
            out.push(' ');
        }
        prev_lower = ch.is_ascii_lowercase();
        out.push(ch);
    }
    out
}

fn glob_match(text: &str, pattern: &str) -> bool {
    let options = MatchOptions {
        case_sensitive: false,
        ..MatchOptions::new()
    };
    match Pattern::new(pattern) {
        Ok(p) => p.matches_with(text, options),
        // unparseable pattern degrades to a literal comparison
        Err(_) => text.eq_ignore_ascii_case(pattern),
    }
}

//! `${VAR}` substitution for service environment values.
//!
//! Two forms are honored:
//! - `${VAR}` — replaced by the binding; left verbatim when unbound.
//! - `${VAR:-default}` — replaced by the binding when present, else the
//!   default (an empty default is valid).
//!
//! Variable names match `[A-Za-z_][A-Za-z0-9_]*`. Substituted values are
//! not re-scanned, so there is no recursive expansion.

use std::collections::HashMap;

/// Substitute variable placeholders in a single value.
pub fn substitute_variables(value: &str, bindings: &HashMap<String, String>) -> String {
    let bytes = value.as_bytes();
    let mut out = String::with_capacity(value.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(close) = value[i + 2..].find('}') {
                let inner = &value[i + 2..i + 2 + close];
                let placeholder = &value[i..i + 2 + close + 1];
                out.push_str(&expand(inner, placeholder, bindings));
                i += 2 + close + 1;
                continue;
            }
        }
        let Some(ch) = value[i..].chars().next() else {
            break;
        };
        out.push(ch);
        i += ch.len_utf8();
    }

    out
}

fn expand(inner: &str, placeholder: &str, bindings: &HashMap<String, String>) -> String {
    let (name, default) = match inner.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (inner, None),
    };

    if !is_valid_name(name) {
        return placeholder.to_string();
    }
    if let Some(bound) = bindings.get(name) {
        return bound.clone();
    }
    match default {
        Some(default) => default.to_string(),
        // Unbound without default: leave the placeholder verbatim.
        None => placeholder.to_string(),
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

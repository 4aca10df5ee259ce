//! Secret-reference resolver (C4): parses and substitutes
//! `${secret:PATH:KEY}` references against a pluggable secret source.
//!
//! The grammar is deliberately narrow — a full-string-anchored regex, not a
//! general template engine — so references embedded in arbitrary config
//! text can't be confused with shell interpolation or other `${...}` forms.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use reactorcide_types::ReferenceError;
use regex::Regex;

/// A parsed `${secret:PATH:KEY}` reference.
///
/// `raw` is the exact matched text (`${secret:PATH:KEY}`), kept alongside
/// the parsed `path`/`key` so callers that need to special-case an
/// occurrence — e.g. reporting it back to a user, or treating repeated
/// identical references consistently when a getter is impure — don't have
/// to reconstruct it from the parsed parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub path: String,
    pub key: String,
    pub raw: String,
}

static REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{secret:([A-Za-z0-9/_-]+):([A-Za-z0-9_-]+)\}").unwrap());

static FULL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$\{secret:([A-Za-z0-9/_-]+):([A-Za-z0-9_-]+)\}$").unwrap());

/// Parses `s` as a secret reference iff it matches the grammar as a whole
/// string (no surrounding text).
pub fn parse(s: &str) -> Option<SecretRef> {
    let caps = FULL_RE.captures(s)?;
    Some(SecretRef {
        path: caps[1].to_string(),
        key: caps[2].to_string(),
        raw: s.to_string(),
    })
}

/// Finds every `${secret:PATH:KEY}` occurrence within `text`, in order.
pub fn find_all(text: &str) -> Vec<SecretRef> {
    REF_RE
        .captures_iter(text)
        .map(|caps| SecretRef {
            path: caps[1].to_string(),
            key: caps[2].to_string(),
            raw: caps[0].to_string(),
        })
        .collect()
}

/// Collects every secret reference reachable from a flat `String -> String`
/// map's values, without resolving any of them.
///
/// Used by validation/dry-run paths that need to report which secrets a job
/// *would* need — e.g. so a user can confirm a store has every key a job
/// references before actually running it.
pub fn collect_refs(map: &BTreeMap<String, String>) -> Vec<SecretRef> {
    map.values().flat_map(|v| find_all(v)).collect()
}

/// Replaces every reference in `text` with `getter(path, key)`.
///
/// A `None` result is left in place when `missing_ok` is true; otherwise
/// resolution fails with [`ReferenceError::SecretNotFound`]. The same
/// reference appearing more than once is resolved independently each time
/// (getters are expected, but not required, to be pure).
pub fn resolve_in_string(
    text: &str,
    getter: &mut dyn FnMut(&str, &str) -> Option<String>,
    missing_ok: bool,
) -> Result<String, ReferenceError> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in REF_RE.captures_iter(text) {
        let m = caps.get(0).unwrap();
        out.push_str(&text[last..m.start()]);
        let path = &caps[1];
        let key = &caps[2];
        match getter(path, key) {
            Some(value) => out.push_str(&value),
            None if missing_ok => out.push_str(m.as_str()),
            None => {
                return Err(ReferenceError::SecretNotFound {
                    path: path.to_string(),
                    key: key.to_string(),
                });
            }
        }
        last = m.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// Recursively resolves references through a flat `String -> String` map's
/// values (keys are never rewritten).
pub fn resolve_in_map(
    map: &BTreeMap<String, String>,
    getter: &mut dyn FnMut(&str, &str) -> Option<String>,
    missing_ok: bool,
) -> Result<BTreeMap<String, String>, ReferenceError> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), resolve_in_string(v, getter, missing_ok)?)))
        .collect()
}

/// Recursively resolves references through a [`serde_json::Value`] tree:
/// string leaves are substituted, maps and arrays recurse, everything else
/// passes through unchanged.
pub fn resolve_in_json(
    value: &serde_json::Value,
    getter: &mut dyn FnMut(&str, &str) -> Option<String>,
    missing_ok: bool,
) -> Result<serde_json::Value, ReferenceError> {
    use serde_json::Value;
    match value {
        Value::String(s) => Ok(Value::String(resolve_in_string(s, getter, missing_ok)?)),
        Value::Array(items) => {
            let resolved = items
                .iter()
                .map(|v| resolve_in_json(v, getter, missing_ok))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(resolved))
        }
        Value::Object(map) => {
            let resolved = map
                .iter()
                .map(|(k, v)| Ok((k.clone(), resolve_in_json(v, getter, missing_ok)?)))
                .collect::<Result<serde_json::Map<_, _>, ReferenceError>>()?;
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

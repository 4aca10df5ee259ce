//! Secret masker (C2): a thread-safe set of secret strings, and literal
//! (not haystack-regex) replacement of every occurrence in a byte stream
//! with a fixed redaction token.
//!
//! Values shorter than [`MIN_SECRET_LEN`] are ignored on registration —
//! masking a one- or two-character secret would blank out unrelated text.

use std::collections::BTreeMap;
use std::sync::RwLock;

use regex::Regex;

/// Secrets shorter than this are not registered.
pub const MIN_SECRET_LEN: usize = 3;

/// Token substituted for every masked occurrence.
pub const DEFAULT_REDACTION_TOKEN: &str = "[REDACTED]";

/// Thread-safe secret set plus a compiled matcher, rebuilt on each mutation.
///
/// Rebuilding on every `register` keeps `mask` lock-free-ish (a single read
/// lock) at the cost of a full rebuild per registration; registration is
/// rare relative to masking, which happens on every line of child output.
pub struct Masker {
    inner: RwLock<Inner>,
    redaction_token: String,
}

struct Inner {
    secrets: Vec<String>,
    matcher: Option<Regex>,
}

impl Default for Masker {
    fn default() -> Self {
        Self::new()
    }
}

impl Masker {
    pub fn new() -> Self {
        Self::with_token(DEFAULT_REDACTION_TOKEN)
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                secrets: Vec::new(),
                matcher: None,
            }),
            redaction_token: token.into(),
        }
    }

    /// Registers a single secret value. No-op if shorter than
    /// [`MIN_SECRET_LEN`] or already registered.
    pub fn register(&self, value: impl AsRef<str>) {
        self.register_many(std::iter::once(value.as_ref().to_string()));
    }

    /// Registers many values in one matcher rebuild.
    pub fn register_many<I, S>(&self, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inner = self.inner.write().expect("masker lock poisoned");
        let mut changed = false;
        for value in values {
            let value = value.into();
            if value.len() < MIN_SECRET_LEN {
                continue;
            }
            if !inner.secrets.iter().any(|s| s == &value) {
                inner.secrets.push(value);
                changed = true;
            }
        }
        if changed {
            inner.rebuild();
        }
    }

    /// Replaces every registered secret occurring in `text` with the
    /// redaction token. Longer secrets are matched before shorter ones so a
    /// secret that is a substring of another is not partially masked first.
    pub fn mask(&self, text: &str) -> String {
        let inner = self.inner.read().expect("masker lock poisoned");
        let Some(matcher) = inner.matcher.as_ref() else {
            return text.to_string();
        };
        matcher
            .replace_all(text, self.redaction_token.as_str())
            .into_owned()
    }

    /// Masks each element of an argv-style argument list.
    pub fn mask_args<I, S>(&self, args: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        args.into_iter().map(|a| self.mask(a.as_ref())).collect()
    }

    /// Masks every value in a string map. If `mask_keys` is true, keys are
    /// masked too (values are always masked).
    pub fn mask_map(
        &self,
        map: &BTreeMap<String, String>,
        mask_keys: bool,
    ) -> BTreeMap<String, String> {
        map.iter()
            .map(|(k, v)| {
                let key = if mask_keys { self.mask(k) } else { k.clone() };
                (key, self.mask(v))
            })
            .collect()
    }

    /// Removes every registered secret.
    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("masker lock poisoned");
        inner.secrets.clear();
        inner.matcher = None;
    }

    /// Number of currently registered secrets.
    pub fn size(&self) -> usize {
        self.inner.read().expect("masker lock poisoned").secrets.len()
    }

    /// Whether `value` is currently registered.
    pub fn contains(&self, value: impl AsRef<str>) -> bool {
        let value = value.as_ref();
        self.inner
            .read()
            .expect("masker lock poisoned")
            .secrets
            .iter()
            .any(|s| s == value)
    }
}

impl Inner {
    fn rebuild(&mut self) {
        if self.secrets.is_empty() {
            self.matcher = None;
            return;
        }
        // Longest-first so overlapping secrets (one a substring of another)
        // mask the longer match; regex alternation picks the first branch
        // that matches at a given position, not the longest.
        let mut sorted = self.secrets.clone();
        sorted.sort_by(|a, b| b.len().cmp(&a.len()));
        let pattern = sorted
            .iter()
            .map(|s| regex::escape(s))
            .collect::<Vec<_>>()
            .join("|");
        self.matcher =
            Some(Regex::new(&pattern).expect("escaped literal alternation always compiles"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_secrets_are_ignored() {
        let m = Masker::new();
        m.register("ab");
        assert_eq!(m.size(), 0);
        assert_eq!(m.mask("ab is not a secret"), "ab is not a secret");
    }

    #[test]
    fn registered_value_is_masked_everywhere_it_appears() {
        let m = Masker::new();
        m.register("supersecret");
        let out = m.mask("VAR=supersecret and again supersecret!");
        assert_eq!(out, "VAR=[REDACTED] and again [REDACTED]!");
    }

    #[test]
    fn unregistered_text_passes_through_unchanged() {
        let m = Masker::new();
        assert_eq!(m.mask("nothing registered"), "nothing registered");
    }

    #[test]
    fn regex_metacharacters_in_secrets_are_escaped() {
        let m = Masker::new();
        m.register("a.b*c(d)");
        assert_eq!(m.mask("prefix a.b*c(d) suffix"), "prefix [REDACTED] suffix");
        assert_eq!(m.mask("axbycxdy"), "axbycxdy");
    }

    #[test]
    fn longer_secret_masked_over_shorter_substring() {
        let m = Masker::new();
        m.register("secret");
        m.register("secretvalue");
        let out = m.mask("token=secretvalue");
        assert_eq!(out, "token=[REDACTED]");
    }

    #[test]
    fn register_many_dedupes_and_rebuilds_once() {
        let m = Masker::new();
        m.register_many(["abc".to_string(), "abc".to_string(), "defg".to_string()]);
        assert_eq!(m.size(), 2);
    }

    #[test]
    fn mask_args_masks_each_element() {
        let m = Masker::new();
        m.register("hunter2");
        let masked = m.mask_args(["--password", "hunter2"]);
        assert_eq!(masked, vec!["--password", "[REDACTED]"]);
    }

    #[test]
    fn mask_map_masks_values_not_keys_by_default() {
        let m = Masker::new();
        m.register("sekrit");
        let mut map = BTreeMap::new();
        map.insert("sekrit".to_string(), "sekrit".to_string());
        let masked = m.mask_map(&map, false);
        assert_eq!(masked.get("sekrit").unwrap(), "[REDACTED]");
    }

    #[test]
    fn clear_forgets_everything() {
        let m = Masker::new();
        m.register("topsecret");
        m.clear();
        assert_eq!(m.size(), 0);
        assert_eq!(m.mask("topsecret"), "topsecret");
    }

    #[test]
    fn contains_reflects_registration() {
        let m = Masker::new();
        assert!(!m.contains("x1234"));
        m.register("x1234");
        assert!(m.contains("x1234"));
    }

    proptest::proptest! {
        #[test]
        fn any_registered_value_of_min_length_is_never_left_unmasked(
            prefix in "[a-zA-Z0-9 ]{0,20}",
            secret in "[a-zA-Z0-9]{3,20}",
            suffix in "[a-zA-Z0-9 ]{0,20}",
        ) {
            let m = Masker::new();
            m.register(&secret);
            let haystack = format!("{prefix}{secret}{suffix}");
            let masked = m.mask(&haystack);
            prop_assert!(!masked.contains(&secret));
        }

        #[test]
        fn short_values_never_get_registered(secret in "[a-zA-Z0-9]{0,2}") {
            let m = Masker::new();
            m.register(&secret);
            prop_assert_eq!(m.size(), 0);
        }
    }
}

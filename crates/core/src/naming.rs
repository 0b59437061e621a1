//! DNS-1123 label generation.
//!
//! Names derived from user input (resource names, selector keys, ...) are
//! sanitized into the `[a-z0-9-]` alphabet and capped at 63 characters. The
//! unique variant reserves 9 characters for a `-<hash8>` suffix computed over
//! the raw input, so two long inputs sharing a truncated prefix still produce
//! distinct labels.

use once_cell::sync::Lazy;
use regex::Regex;
use xxhash_rust::xxh64::xxh64;

use crate::{Error, Result};

/// Maximum length of a DNS-1123 label.
pub const DNS1123_LABEL_MAX_LENGTH: usize = 63;

/// `-` plus 8 hex digits.
const HASH_SUFFIX_LEN: usize = 9;

const DNS1123_LABEL_FMT: &str = "[a-z0-9]([-a-z0-9]*[a-z0-9])?";

static INVALID_DNS1123_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new("[^-a-z0-9]+").expect("static regex"));
static DNS1123_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(&format!("^{}$", DNS1123_LABEL_FMT)).expect("static regex"));

/// Generates valid label names, optionally under a fixed prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceNamer {
    prefix: String,
}

impl ResourceNamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every generated name starts with `<prefix>-`.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn sanitized_label(&self, name: &str) -> String {
        let joined = if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}-{}", self.prefix.trim_end_matches('-'), name)
        };
        let lower = joined.to_lowercase();
        INVALID_DNS1123_CHARS.replace_all(&lower, "-").trim_matches('-').to_string()
    }

    /// Sanitize `name` and truncate it to 63 characters.
    pub fn dns1123_label(&self, name: &str) -> Result<String> {
        let mut label = self.sanitized_label(name);
        label.truncate(DNS1123_LABEL_MAX_LENGTH);
        validate_dns1123_label(&label)?;
        Ok(label)
    }

    /// Like [`dns1123_label`](Self::dns1123_label) but always ends with the
    /// first 8 hex digits of the xxHash64 of the unsanitized input.
    pub fn unique_dns1123_label(&self, name: &str) -> Result<String> {
        let suffix = hash_suffix(name);
        let mut label = self.sanitized_label(name);
        label.truncate(DNS1123_LABEL_MAX_LENGTH - HASH_SUFFIX_LEN);
        label.push('-');
        label.push_str(&suffix);
        validate_dns1123_label(&label)?;
        Ok(label)
    }
}

fn hash_suffix(name: &str) -> String {
    // Unpadded hex; leading zero nibbles are dropped before taking 8 digits.
    let mut hex = format!("{:x}", xxh64(name.as_bytes(), 0));
    hex.truncate(HASH_SUFFIX_LEN - 1);
    hex
}

/// Check `label` against RFC 1123 label rules.
pub fn validate_dns1123_label(label: &str) -> Result<()> {
    let mut errs = Vec::new();
    if label.len() > DNS1123_LABEL_MAX_LENGTH {
        errs.push(format!("must be no more than {} characters", DNS1123_LABEL_MAX_LENGTH));
    }
    if !DNS1123_LABEL.is_match(label) {
        errs.push(format!(
            "a lowercase RFC 1123 label must consist of lower case alphanumeric characters or '-', and must start and end with an alphanumeric character (e.g. 'my-name',  or '123-abc', regex used for validation is '{}')",
            DNS1123_LABEL_FMT
        ));
    }
    if errs.is_empty() {
        Ok(())
    } else {
        Err(Error::InvalidLabel { label: label.to_string(), reason: errs.join(",") })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_are_sanitized_only() {
        let rn = ResourceNamer::new();
        assert_eq!(rn.dns1123_label("prometheus-k8s").unwrap(), "prometheus-k8s");
        assert_eq!(rn.dns1123_label("My_Service.Name").unwrap(), "my-service-name");
        assert_eq!(rn.dns1123_label("--a!!!b--").unwrap(), "a-b");
    }

    #[test]
    fn prefix_is_joined_with_single_dash() {
        let rn = ResourceNamer::with_prefix("shard--");
        assert_eq!(rn.dns1123_label("Web").unwrap(), "shard-web");
        assert_eq!(rn.prefix(), "shard--");
    }

    #[test]
    fn long_names_are_truncated() {
        let rn = ResourceNamer::new();
        let name = "a".repeat(100);
        let out = rn.dns1123_label(&name).unwrap();
        assert_eq!(out.len(), DNS1123_LABEL_MAX_LENGTH);
    }

    #[test]
    fn empty_after_sanitize_is_invalid() {
        let rn = ResourceNamer::new();
        let err = rn.dns1123_label("___").unwrap_err();
        assert!(matches!(err, Error::InvalidLabel { ref label, .. } if label.is_empty()), "{err}");
    }

    #[test]
    fn truncation_ending_in_dash_is_invalid() {
        let rn = ResourceNamer::new();
        let name = format!("{}_b", "a".repeat(62));
        assert!(matches!(rn.dns1123_label(&name), Err(Error::InvalidLabel { .. })));
    }

    #[test]
    fn unique_labels_diverge_after_truncation() {
        let rn = ResourceNamer::new();
        let base = "x".repeat(60);
        let a = rn.unique_dns1123_label(&format!("{base}-abc")).unwrap();
        let b = rn.unique_dns1123_label(&format!("{base}-XYZ")).unwrap();
        assert_ne!(a, b);
        assert_eq!(a[..54], b[..54]);
        assert!(a.len() <= DNS1123_LABEL_MAX_LENGTH);
        assert!(b.len() <= DNS1123_LABEL_MAX_LENGTH);
    }

    #[test]
    fn unique_label_is_stable_and_hashes_raw_input() {
        let rn = ResourceNamer::new();
        let a = rn.unique_dns1123_label("Foo").unwrap();
        let b = rn.unique_dns1123_label("foo").unwrap();
        assert_eq!(a, rn.unique_dns1123_label("Foo").unwrap());
        assert_eq!(&a[..4], "foo-");
        assert_ne!(a, b, "case differences survive through the hash");
    }

    #[test]
    fn unique_label_of_empty_input_fails() {
        let rn = ResourceNamer::new();
        // "-<hash>" starts with a dash.
        assert!(rn.unique_dns1123_label("").is_err());
    }

    #[test]
    fn validation_reports_length() {
        let err = validate_dns1123_label(&"a".repeat(64)).unwrap_err().to_string();
        assert!(err.contains("must be no more than 63 characters"), "{err}");
    }
}

//! Generated namespace names
//!
//! Names look like `<prefix>-<context>-<suffix>` where the context is an
//! optional hint such as the test name, and the suffix is five random
//! lowercase alphanumerics. Results always fit a DNS-1123 label.

use rand::Rng;

use podlab_common::config::DEFAULT_NAMESPACE_PREFIX;
use podlab_common::MAX_DNS_LABEL_LEN;

const SUFFIX_LEN: usize = 5;
const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Unique name with the default prefix
pub fn generate() -> String {
    unique_name(DEFAULT_NAMESPACE_PREFIX, None)
}

/// Unique name built from `prefix`, an optional context hint and a random suffix
pub fn unique_name(prefix: &str, context: Option<&str>) -> String {
    let prefix = match sanitize(prefix) {
        p if p.is_empty() => DEFAULT_NAMESPACE_PREFIX.to_string(),
        p => p,
    };
    let suffix = random_suffix();

    let context = context.map(sanitize).filter(|c| !c.is_empty());
    let Some(context) = context else {
        let max_prefix = MAX_DNS_LABEL_LEN - SUFFIX_LEN - 1;
        return format!("{}-{}", truncate(&prefix, max_prefix), suffix);
    };

    // prefix + '-' + context + '-' + suffix
    let budget = MAX_DNS_LABEL_LEN.saturating_sub(prefix.len() + SUFFIX_LEN + 2);
    if budget == 0 {
        let max_prefix = MAX_DNS_LABEL_LEN - SUFFIX_LEN - 1;
        return format!("{}-{}", truncate(&prefix, max_prefix), suffix);
    }
    format!("{}-{}-{}", prefix, truncate(&context, budget), suffix)
}

/// Lowercase, map anything outside `[a-z0-9]` to `-`, collapse runs of
/// `-` and trim them from both ends.
pub fn sanitize(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

fn truncate(value: &str, max: usize) -> String {
    value
        .chars()
        .take(max)
        .collect::<String>()
        .trim_end_matches('-')
        .to_string()
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}

/// True when `name` is a valid DNS-1123 label
pub fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_DNS_LABEL_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_collapses_and_trims() {
        assert_eq!(sanitize("OrderServiceIT::creates_order"), "orderserviceit-creates-order");
        assert_eq!(sanitize("--Hello   World--"), "hello-world");
        assert_eq!(sanitize("___"), "");
    }

    #[test]
    fn generated_names_are_unique_dns_labels() {
        let a = generate();
        let b = generate();
        assert_ne!(a, b);
        assert!(a.starts_with("podlab-"));
        assert_eq!(a.len(), "podlab-".len() + SUFFIX_LEN);
        assert!(is_dns_label(&a));
    }

    #[test]
    fn context_is_truncated_to_fit() {
        let long = "a_really_long_test_method_name_that_keeps_going_and_going_forever";
        let name = unique_name("podlab", Some(long));
        assert!(name.len() <= MAX_DNS_LABEL_LEN);
        assert!(name.starts_with("podlab-a-really-long"));
        assert!(is_dns_label(&name));
    }

    #[test]
    fn empty_context_is_ignored() {
        let name = unique_name("it", Some("!!!"));
        assert!(name.starts_with("it-"));
        assert_eq!(name.len(), 3 + SUFFIX_LEN);
    }

    #[test]
    fn dns_label_check() {
        assert!(is_dns_label("web-1"));
        assert!(!is_dns_label("Web"));
        assert!(!is_dns_label("-web"));
        assert!(!is_dns_label(&"a".repeat(64)));
    }
}

//! Deterministic cache keys for fetch criteria.

use crate::config::EngineConfig;
use crate::types::CacheKey;
use crate::types::FetchCriteria;
use crate::types::ItemId;
use sha2::Digest;
use sha2::Sha256;

const FIELD_SEP: char = '\u{1f}';
const ITEM_SEP: char = '\u{1e}';
const DIGEST_LEN: usize = 32;

/// Turns [`FetchCriteria`] into a [`CacheKey`] of the form `namespace:vN:<32 hex digits>`.
///
/// Two criteria that only differ in the order of their list values map onto the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprinter {
    prefix: String,
}

impl Fingerprinter {
    pub fn new(namespace: &str, version: u32) -> Self {
        Self {
            prefix: format!("{}:v{version}:", sanitize(namespace)),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.namespace(), config.key_version())
    }

    /// Common prefix of every key this fingerprinter produces. Handy for [`TtlStore::invalidate_by_prefix`](crate::store::TtlStore::invalidate_by_prefix).
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn fingerprint(&self, criteria: &FetchCriteria) -> CacheKey {
        let canonical = canonical_string(&criteria.normalized());
        let digest = format!("{:x}", Sha256::digest(canonical.as_bytes()));
        CacheKey::from_parts(&self.prefix, &digest[..DIGEST_LEN])
    }
}

// Every field is tagged so that moving a value from one field into another changes the key. Values are prefixed
// with their byte length, so a separator inside a value can't imitate a field or item boundary.
fn canonical_string(criteria: &FetchCriteria) -> String {
    fn push_value(out: &mut String, value: &str) {
        out.push_str(&value.len().to_string());
        out.push(':');
        out.push_str(value);
    }

    fn push_text(out: &mut String, tag: &str, value: Option<&str>) {
        out.push_str(tag);
        out.push('=');
        if let Some(value) = value {
            push_value(out, value);
        }
        out.push(FIELD_SEP);
    }

    fn push_list<'a>(out: &mut String, tag: &str, values: impl Iterator<Item = &'a str>) {
        out.push_str(tag);
        out.push('=');
        for value in values {
            push_value(out, value);
            out.push(ITEM_SEP);
        }
        out.push(FIELD_SEP);
    }

    let mut out = String::with_capacity(128);
    push_text(&mut out, "q", criteria.query.as_deref());
    push_text(&mut out, "city", criteria.city.as_deref());
    push_list(&mut out, "status", criteria.statuses.iter().map(String::as_str));
    push_list(&mut out, "cat", criteria.categories.iter().map(String::as_str));
    push_list(&mut out, "prio", criteria.priority_ids.iter().map(ItemId::as_str));
    push_list(&mut out, "excl", criteria.exclude_ids.iter().map(ItemId::as_str));
    push_text(&mut out, "mode", Some(&criteria.mode.to_string()));
    out
}

fn sanitize(namespace: &str) -> String {
    let cleaned: String = namespace
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            }
            else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() {
        "_".to_string()
    }
    else {
        cleaned
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::FetchMode;

    fn criteria() -> FetchCriteria {
        FetchCriteria::new()
            .with_query("Roofers")
            .with_city("la")
            .with_status("active")
            .with_status("verified")
            .with_category("roofing")
            .with_category("solar")
            .with_priority_id("p-2")
            .with_priority_id("p-1")
    }

    #[test]
    fn stable_under_permutation() {
        let fp = Fingerprinter::new("listings", 3);
        let permuted = FetchCriteria::new()
            .with_query("  roofers")
            .with_city("LA")
            .with_status("verified")
            .with_status("active")
            .with_category("solar")
            .with_category("roofing")
            .with_priority_id("p-2")
            .with_priority_id("p-1")
            .with_priority_id("p-2");

        assert_eq!(fp.fingerprint(&criteria()), fp.fingerprint(&permuted));
        assert_eq!(fp.fingerprint(&criteria()), fp.fingerprint(&criteria()));
    }

    #[test]
    fn different_content_different_key() {
        let fp = Fingerprinter::new("listings", 3);
        let base = fp.fingerprint(&criteria());

        assert_ne!(base, fp.fingerprint(&criteria().with_city("sf")));
        assert_ne!(base, fp.fingerprint(&criteria().with_excluded_id("p-1")));
        assert_ne!(
            base,
            fp.fingerprint(&criteria().with_mode(FetchMode::Bounded { limit: 150 }))
        );
    }

    #[test]
    fn values_do_not_leak_between_fields() {
        let fp = Fingerprinter::new("listings", 1);
        let as_status = FetchCriteria::new().with_status("roofing");
        let as_category = FetchCriteria::new().with_category("roofing");
        assert_ne!(fp.fingerprint(&as_status), fp.fingerprint(&as_category));
    }

    #[test]
    fn separators_inside_values_do_not_collide() {
        let fp = Fingerprinter::new("listings", 1);
        let joined = FetchCriteria::new().with_status(format!("a{ITEM_SEP}b"));
        let split = FetchCriteria::new().with_status("a").with_status("b");
        assert_ne!(fp.fingerprint(&joined), fp.fingerprint(&split));

        let smuggled = FetchCriteria::new().with_query(format!("x{FIELD_SEP}city=la"));
        let honest = FetchCriteria::new().with_query("x").with_city("la");
        assert_ne!(fp.fingerprint(&smuggled), fp.fingerprint(&honest));
    }

    #[test]
    fn priority_order_is_part_of_the_key() {
        let fp = Fingerprinter::new("listings", 1);
        let first = FetchCriteria::new().with_priority_id("a").with_priority_id("b");
        let second = FetchCriteria::new().with_priority_id("b").with_priority_id("a");
        assert_ne!(fp.fingerprint(&first), fp.fingerprint(&second));
    }

    #[test]
    fn version_changes_the_key() {
        let v1 = Fingerprinter::new("listings", 1).fingerprint(&criteria());
        let v2 = Fingerprinter::new("listings", 2).fingerprint(&criteria());
        assert_ne!(v1, v2);
    }

    #[test]
    fn key_shape() {
        let fp = Fingerprinter::new(" Map Listings! ", 7);
        let key = fp.fingerprint(&criteria());

        assert_eq!(fp.prefix(), "map_listings_:v7:");
        assert!(key.starts_with(fp.prefix()));
        assert_eq!(key.as_str().len(), fp.prefix().len() + DIGEST_LEN);
        assert!(key
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ':'));
    }
}

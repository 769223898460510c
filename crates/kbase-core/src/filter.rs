//! In-memory source filtering for scoped search.
//!
//! The store receives the normalized keys as a pushed-down predicate, but
//! every result is re-verified here: exact normalized match always, plus
//! prefix/suffix matching on path-segment boundaries when the filter is
//! small, to tolerate path-representation drift (drive letters, mount
//! prefixes, directory scopes).

use std::collections::HashSet;

use crate::paths::normalize_key;

/// Shorter side of a fuzzy match must be at least this long.
const MIN_FUZZY_LEN: usize = 4;

/// A normalized set of source keys to restrict a search to.
#[derive(Debug, Clone)]
pub struct SourceFilter {
    keys: HashSet<String>,
    ordered: Vec<String>,
    fuzzy: bool,
}

impl SourceFilter {
    /// Build a filter from raw identifiers. Fuzzy matching is enabled only
    /// when there are fewer than `fuzzy_limit` distinct keys.
    pub fn new<S: AsRef<str>>(sources: &[S], fuzzy_limit: usize) -> Self {
        let mut keys = HashSet::new();
        let mut ordered = Vec::new();
        for s in sources {
            let key = normalize_key(s.as_ref());
            if !key.is_empty() && keys.insert(key.clone()) {
                ordered.push(key);
            }
        }
        let fuzzy = ordered.len() < fuzzy_limit;
        Self {
            keys,
            ordered,
            fuzzy,
        }
    }

    /// Normalized keys, in first-seen order, for predicate pushdown.
    pub fn keys(&self) -> &[String] {
        &self.ordered
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn is_fuzzy(&self) -> bool {
        self.fuzzy
    }

    /// Whether a stored row's source belongs to this filter.
    pub fn matches(&self, row_source: &str) -> bool {
        let key = normalize_key(row_source);
        if self.keys.contains(&key) {
            return true;
        }
        self.fuzzy && self.ordered.iter().any(|k| fuzzy_match(&key, k))
    }
}

fn fuzzy_match(a: &str, b: &str) -> bool {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if short.len() < MIN_FUZZY_LEN || short.len() == long.len() {
        return false;
    }
    if long.ends_with(short) {
        let head = &long[..long.len() - short.len()];
        if short.starts_with('/') || head.ends_with('/') {
            return true;
        }
    }
    if long.starts_with(short) {
        let tail = &long[short.len()..];
        if short.ends_with('/') || tail.starts_with('/') {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_is_normalized() {
        let f = SourceFilter::new(&["C:\\Docs\\A.md"], 50);
        assert!(f.matches("c:/docs/a.md"));
        assert!(f.matches("C:/Docs//A.md"));
        assert!(!f.matches("c:/docs/b.md"));
    }

    #[test]
    fn suffix_match_tolerates_drive_prefix() {
        let f = SourceFilter::new(&["/users/me/notes.md"], 50);
        assert!(f.matches("c:/users/me/notes.md"));
    }

    #[test]
    fn prefix_match_scopes_directories() {
        let f = SourceFilter::new(&["/srv/docs"], 50);
        assert!(f.matches("/srv/docs/guide.md"));
        assert!(!f.matches("/srv/docs-old/guide.md"));
    }

    #[test]
    fn suffix_requires_segment_boundary() {
        let f = SourceFilter::new(&["notes.md"], 50);
        assert!(f.matches("/home/me/notes.md"));
        assert!(!f.matches("/home/me/mynotes.md"));
    }

    #[test]
    fn large_filters_are_exact_only() {
        let sources: Vec<String> = (0..60).map(|i| format!("/data/file{}.md", i)).collect();
        let f = SourceFilter::new(&sources, 50);
        assert!(!f.is_fuzzy());
        assert!(f.matches("/data/file7.md"));
        assert!(!f.matches("c:/data/file7.md"));
    }

    #[test]
    fn short_keys_never_fuzzy_match() {
        let f = SourceFilter::new(&["a.md"], 50);
        assert!(f.matches("a.md"));
        assert!(f.matches("/x/a.md"));
        let f = SourceFilter::new(&["/a"], 50);
        assert!(!f.matches("/a/b/c"));
    }

    #[test]
    fn keys_are_deduplicated() {
        let f = SourceFilter::new(&["/A.md", "/a.md", "/b.md"], 50);
        assert_eq!(f.keys(), &["/a.md".to_string(), "/b.md".to_string()]);
    }
}

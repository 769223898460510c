//! Source key normalization.
//!
//! Every source is identified in the catalog and the vector table by a
//! single canonical key produced by [`normalize_key`]: trimmed, `file://`
//! prefix removed, backslashes unified to `/`, duplicate separators
//! collapsed, trailing separator removed, lower-cased. Keys are computed
//! once at write time; [`key_variants`] exists only for the delete path's
//! diagnostic fallback over rows written by older builds.

/// Unify separators and collapse duplicate slashes without changing case.
pub fn unify_separators(identifier: &str) -> String {
    let trimmed = identifier.trim();
    let trimmed = trimmed.strip_prefix("file://").unwrap_or(trimmed);
    let replaced = trimmed.replace('\\', "/");

    // Keep the "//" that follows a URL scheme.
    let (scheme, rest) = match replaced.find("://") {
        Some(pos) => replaced.split_at(pos + 3),
        None => ("", replaced.as_str()),
    };

    let mut out = String::with_capacity(replaced.len());
    out.push_str(scheme);
    let mut prev_slash = false;
    for c in rest.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }

    while out.len() > 1 && out.ends_with('/') && !out.ends_with("://") {
        out.pop();
    }
    out
}

/// Canonical catalog/table key for a file path or URL.
pub fn normalize_key(identifier: &str) -> String {
    unify_separators(identifier).to_lowercase()
}

/// Historical shapes a source key may have been stored under: raw,
/// separator-unified, and fully normalized. Deduplicated, raw first.
pub fn key_variants(identifier: &str) -> Vec<String> {
    let mut variants = vec![
        identifier.to_string(),
        identifier.trim().to_string(),
        unify_separators(identifier),
        normalize_key(identifier),
    ];
    let mut seen = std::collections::HashSet::new();
    variants.retain(|v| !v.is_empty() && seen.insert(v.clone()));
    variants
}

/// Human-readable name: the last path segment, or the host for bare URLs.
pub fn display_name(identifier: &str) -> String {
    let unified = unify_separators(identifier);
    let without_query = unified.split(['?', '#']).next().unwrap_or(&unified);
    let body = match without_query.find("://") {
        Some(pos) => &without_query[pos + 3..],
        None => without_query,
    };
    body.rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or(body)
        .to_string()
}

/// Host portion of a URL, if the identifier is one.
pub fn url_host(identifier: &str) -> Option<String> {
    let unified = unify_separators(identifier);
    let pos = unified.find("://")?;
    let rest = &unified[pos + 3..];
    let host = rest.split(['/', '?', '#']).next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_windows_paths() {
        assert_eq!(normalize_key("C:\\Docs\\Report.PDF"), "c:/docs/report.pdf");
    }

    #[test]
    fn collapses_and_trims_separators() {
        assert_eq!(normalize_key("  /home//me/notes/  "), "/home/me/notes");
        assert_eq!(normalize_key("file:///tmp/a.md"), "/tmp/a.md");
    }

    #[test]
    fn keeps_url_scheme_slashes() {
        assert_eq!(
            normalize_key("HTTPS://Example.com//Guide/"),
            "https://example.com/guide"
        );
    }

    #[test]
    fn root_is_preserved() {
        assert_eq!(normalize_key("/"), "/");
    }

    #[test]
    fn variants_are_unique_and_include_raw() {
        let v = key_variants("C:\\Docs\\A.md");
        assert_eq!(v[0], "C:\\Docs\\A.md");
        assert!(v.contains(&"C:/Docs/A.md".to_string()));
        assert!(v.contains(&"c:/docs/a.md".to_string()));
        let unique: std::collections::HashSet<_> = v.iter().collect();
        assert_eq!(unique.len(), v.len());
    }

    #[test]
    fn display_names() {
        assert_eq!(display_name("/home/me/notes.md"), "notes.md");
        assert_eq!(display_name("C:\\a\\b.pdf"), "b.pdf");
        assert_eq!(display_name("https://example.com/docs/intro?x=1"), "intro");
        assert_eq!(display_name("https://example.com/"), "example.com");
    }

    #[test]
    fn hosts() {
        assert_eq!(url_host("https://Docs.Rs/tokio"), Some("docs.rs".to_string()));
        assert_eq!(url_host("/tmp/a"), None);
    }
}

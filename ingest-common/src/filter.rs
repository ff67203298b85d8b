//! # Filter
//!
//! Decides whether an operation belongs to this index at all. Runs on every inbound operation,
//! so it does no I/O and no allocation on the hot path.
use std::collections::HashSet;

/// Normalize a namespace such as `pub.example`, `pub.example.` or `pub.example.*` into the
/// prefix form `pub.example.`.
pub fn namespace_prefix(namespace: &str) -> String {
    let trimmed = namespace.trim();
    let trimmed = trimmed.strip_suffix(".*").unwrap_or(trimmed);
    format!("{}.", trimmed.trim_end_matches('.'))
}

/// Collection part of a `collection/rkey` path. A path without a separator is all collection.
pub fn collection_of(path: &str) -> &str {
    match path.split_once('/') {
        Some((collection, _)) => collection,
        None => path,
    }
}

#[derive(Clone, Debug)]
pub struct EventFilter {
    prefix: String,
    allowed: Option<HashSet<String>>,
}

impl EventFilter {
    /// Accept every collection under `namespace`.
    pub fn for_namespace(namespace: &str) -> Self {
        Self {
            prefix: namespace_prefix(namespace),
            allowed: None,
        }
    }

    /// Accept only the listed collections. An empty list falls back to namespace mode.
    pub fn with_allowlist<I, S>(namespace: &str, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed: HashSet<String> = collections.into_iter().map(Into::into).collect();

        Self {
            prefix: namespace_prefix(namespace),
            allowed: if allowed.is_empty() {
                None
            } else {
                Some(allowed)
            },
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_strict(&self) -> bool {
        self.allowed.is_some()
    }

    pub fn should_process(&self, path: &str) -> bool {
        self.accepts_collection(collection_of(path))
    }

    pub fn accepts_collection(&self, collection: &str) -> bool {
        match &self.allowed {
            Some(allowed) => allowed.contains(collection),
            None => collection.len() > self.prefix.len() && collection.starts_with(&self.prefix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_prefix_forms() {
        assert_eq!(namespace_prefix("pub.example"), "pub.example.");
        assert_eq!(namespace_prefix("pub.example."), "pub.example.");
        assert_eq!(namespace_prefix("pub.example.*"), "pub.example.");
        assert_eq!(namespace_prefix(" pub.example "), "pub.example.");
    }

    #[test]
    fn test_namespace_mode() {
        let filter = EventFilter::for_namespace("pub.example.*");

        assert!(filter.should_process("pub.example.widget/3k2"));
        assert!(filter.should_process("pub.example.other/abc"));
        assert!(filter.should_process("pub.example.feed.post/abc"));
        assert!(!filter.should_process("app.bsky.feed.post/3k2"));
        assert!(!filter.should_process("pub.examples.widget/3k2"));
        assert!(!filter.should_process("pub.example/3k2"));
        assert!(!filter.should_process("pub.example./3k2"));
        assert!(!filter.is_strict());
    }

    #[test]
    fn test_allowlist_mode_is_literal() {
        let filter = EventFilter::with_allowlist("pub.example", ["pub.example.widget"]);

        assert!(filter.is_strict());
        assert!(filter.should_process("pub.example.widget/3k2"));
        assert!(!filter.should_process("pub.example.other/3k2"));
        assert!(!filter.should_process("pub.example.widgets/3k2"));
    }

    #[test]
    fn test_empty_allowlist_falls_back_to_namespace() {
        let filter = EventFilter::with_allowlist("pub.example", Vec::<String>::new());

        assert!(!filter.is_strict());
        assert!(filter.should_process("pub.example.other/3k2"));
    }

    #[test]
    fn test_path_without_separator() {
        let filter = EventFilter::for_namespace("pub.example");

        assert_eq!(collection_of("pub.example.post"), "pub.example.post");
        assert!(filter.should_process("pub.example.post"));
    }
}

//! Request matching rules and the selection algorithm over them.
//!
//! A matcher is an immutable `(host, path, path type)` triple. Selection folds
//! over all candidate matchers with [`RequestMatcher::is_better_match_for_request_than`],
//! keeping the best one seen so far:
//!
//! * the request hostname must equal the matcher host;
//! * `Exact` and `ImplementationSpecific` matchers match on path equality and
//!   always replace the current best;
//! * `Prefix` matchers match when the request path starts with the matcher
//!   path (a plain string prefix, so `/prefix` matches `/prefix1`) and only
//!   replace a current best that is itself a `Prefix` with a strictly shorter
//!   path.

use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::core::annotations::RouteMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathType {
    Exact,
    Prefix,
    ImplementationSpecific,
}

impl PathType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "Exact",
            Self::Prefix => "Prefix",
            Self::ImplementationSpecific => "ImplementationSpecific",
        }
    }
}

impl fmt::Display for PathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PathType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Exact" => Ok(Self::Exact),
            "Prefix" => Ok(Self::Prefix),
            "ImplementationSpecific" => Ok(Self::ImplementationSpecific),
            other => Err(format!("unknown path type '{other}'")),
        }
    }
}

/// A single routing rule.
#[derive(Debug, Clone)]
pub struct RequestMatcher {
    host: String,
    path: String,
    path_type: PathType,
    metadata: Arc<RouteMetadata>,
}

impl RequestMatcher {
    /// Create a matcher with empty metadata. The host is stored lowercased.
    pub fn new(host: impl Into<String>, path: impl Into<String>, path_type: PathType) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            path: path.into(),
            path_type,
            metadata: Arc::new(RouteMetadata::default()),
        }
    }

    pub fn with_metadata(mut self, metadata: RouteMetadata) -> Self {
        self.metadata = Arc::new(metadata);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn path_type(&self) -> PathType {
        self.path_type
    }

    pub fn metadata(&self) -> &RouteMetadata {
        &self.metadata
    }

    /// Structural identity over `(host, path, path type)`; metadata is ignored.
    pub fn is_identical_to(&self, other: &RequestMatcher) -> bool {
        self.host == other.host && self.path == other.path && self.path_type == other.path_type
    }

    /// Whether this matcher accepts the request at all.
    pub fn matches(&self, hostname: &str, path: &str) -> bool {
        if self.host != hostname {
            return false;
        }
        match self.path_type {
            PathType::Exact | PathType::ImplementationSpecific => path == self.path,
            PathType::Prefix => path.starts_with(self.path.as_str()),
        }
    }

    /// Whether this matcher should replace `current` as the best match for a
    /// request to `hostname` + `path`.
    pub fn is_better_match_for_request_than(
        &self,
        current: Option<&RequestMatcher>,
        hostname: &str,
        path: &str,
    ) -> bool {
        if !self.matches(hostname, path) {
            return false;
        }
        match self.path_type {
            PathType::Exact | PathType::ImplementationSpecific => true,
            PathType::Prefix => match current {
                None => true,
                Some(current) => {
                    current.path_type == PathType::Prefix && current.path.len() < self.path.len()
                }
            },
        }
    }
}

/// Fold `items` down to the one whose matcher best fits the request.
pub fn select_best<'a, T, I, F>(items: I, hostname: &str, path: &str, matcher_of: F) -> Option<&'a T>
where
    I: IntoIterator<Item = &'a T>,
    F: Fn(&T) -> &RequestMatcher,
    T: 'a,
{
    items.into_iter().fold(None, |best: Option<&'a T>, candidate| {
        let current = best.map(&matcher_of);
        if matcher_of(candidate).is_better_match_for_request_than(current, hostname, path) {
            Some(candidate)
        } else {
            best
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn best<'a>(matchers: &'a [RequestMatcher], host: &str, path: &str) -> Option<&'a RequestMatcher> {
        select_best(matchers, host, path, |m| m)
    }

    #[test]
    fn test_host_must_match() {
        let matcher = RequestMatcher::new("a.example.com", "/", PathType::Prefix);
        assert!(matcher.matches("a.example.com", "/anything"));
        assert!(!matcher.matches("b.example.com", "/anything"));
    }

    #[test]
    fn test_host_is_lowercased() {
        let matcher = RequestMatcher::new("A.Example.COM", "/", PathType::Prefix);
        assert_eq!(matcher.host(), "a.example.com");
    }

    #[test]
    fn test_exact_requires_equal_path() {
        let matcher = RequestMatcher::new("h", "/api", PathType::Exact);
        assert!(matcher.matches("h", "/api"));
        assert!(!matcher.matches("h", "/api/"));
        assert!(!matcher.matches("h", "/ap"));
    }

    #[test]
    fn test_prefix_is_not_segment_aware() {
        let matcher = RequestMatcher::new("h", "/prefix", PathType::Prefix);
        assert!(matcher.matches("h", "/prefix1"));
        assert!(matcher.matches("h", "/prefix/x"));
        assert!(!matcher.matches("h", "/pre"));
    }

    #[test]
    fn test_longest_prefix_wins_in_any_order() {
        let short = RequestMatcher::new("h", "/a", PathType::Prefix);
        let long = RequestMatcher::new("h", "/a/b", PathType::Prefix);

        let forward = vec![short.clone(), long.clone()];
        let reverse = vec![long, short];

        assert_eq!(best(&forward, "h", "/a/b/c").unwrap().path(), "/a/b");
        assert_eq!(best(&reverse, "h", "/a/b/c").unwrap().path(), "/a/b");
    }

    #[test]
    fn test_exact_beats_prefix() {
        let matchers = vec![
            RequestMatcher::new("h", "/x", PathType::Exact),
            RequestMatcher::new("h", "/x", PathType::Prefix),
            RequestMatcher::new("h", "/", PathType::Prefix),
        ];
        let selected = best(&matchers, "h", "/x").unwrap();
        assert_eq!(selected.path_type(), PathType::Exact);
    }

    #[test]
    fn test_implementation_specific_behaves_like_exact() {
        let matchers = vec![
            RequestMatcher::new("h", "/", PathType::Prefix),
            RequestMatcher::new("h", "/login", PathType::ImplementationSpecific),
        ];
        assert_eq!(
            best(&matchers, "h", "/login").unwrap().path_type(),
            PathType::ImplementationSpecific
        );
        assert_eq!(best(&matchers, "h", "/login/x").unwrap().path(), "/");
    }

    #[test]
    fn test_equal_length_prefix_keeps_first() {
        let first = RequestMatcher::new("h", "/ab", PathType::Prefix).with_metadata(RouteMetadata {
            annotations: [("order".to_string(), "first".to_string())].into(),
            ..Default::default()
        });
        let second = RequestMatcher::new("h", "/ab", PathType::Prefix);
        let matchers = vec![first, second];
        let selected = best(&matchers, "h", "/abc").unwrap();
        assert_eq!(selected.metadata().annotations["order"], "first");
    }

    #[test]
    fn test_duplicate_exact_later_wins() {
        let first = RequestMatcher::new("h", "/x", PathType::Exact);
        let second = RequestMatcher::new("h", "/x", PathType::Exact).with_metadata(RouteMetadata {
            annotations: [("order".to_string(), "second".to_string())].into(),
            ..Default::default()
        });
        let matchers = vec![first, second];
        let selected = best(&matchers, "h", "/x").unwrap();
        assert_eq!(selected.metadata().annotations["order"], "second");
    }

    #[test]
    fn test_no_match() {
        let matchers = vec![RequestMatcher::new("h", "/x", PathType::Exact)];
        assert!(best(&matchers, "h", "/y").is_none());
        assert!(best(&matchers, "other", "/x").is_none());
    }

    #[test]
    fn test_identity_ignores_metadata() {
        let a = RequestMatcher::new("h", "/x", PathType::Prefix);
        let b = RequestMatcher::new("h", "/x", PathType::Prefix).with_metadata(RouteMetadata {
            annotations: [("k".to_string(), "v".to_string())].into(),
            ..Default::default()
        });
        let c = RequestMatcher::new("h", "/x", PathType::Exact);
        assert!(a.is_identical_to(&b));
        assert!(!a.is_identical_to(&c));
    }

    #[test]
    fn test_path_type_parsing() {
        assert_eq!("Prefix".parse::<PathType>().unwrap(), PathType::Prefix);
        assert_eq!(
            "ImplementationSpecific".parse::<PathType>().unwrap(),
            PathType::ImplementationSpecific
        );
        assert!("prefix".parse::<PathType>().is_err());
    }
}

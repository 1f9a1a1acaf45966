use crate::core::uri::{
    InvalidUri,
    Uri,
    WildcardUri,
    validate_strict_uri,
};

/// How a procedure registration or subscription should be matched against concrete URIs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchStyle {
    /// The stored URI must equal the concrete URI.
    #[default]
    Exact,
    /// The stored URI must be a component-aligned prefix of the concrete URI.
    Prefix,
    /// The stored pattern must have the same number of components as the concrete URI, with empty
    /// components matching anything.
    Wildcard,
}

impl TryFrom<&str> for MatchStyle {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "exact" => Ok(Self::Exact),
            "prefix" => Ok(Self::Prefix),
            "wildcard" => Ok(Self::Wildcard),
            _ => Err(Self::Error::msg(format!("invalid match style: {value}"))),
        }
    }
}

impl From<MatchStyle> for &'static str {
    fn from(value: MatchStyle) -> Self {
        match value {
            MatchStyle::Exact => "exact",
            MatchStyle::Prefix => "prefix",
            MatchStyle::Wildcard => "wildcard",
        }
    }
}

impl From<MatchStyle> for String {
    fn from(value: MatchStyle) -> Self {
        Into::<&'static str>::into(value).to_owned()
    }
}

impl std::fmt::Display for MatchStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).into())
    }
}

/// Validates that a URI is well formed for the given match style.
///
/// Exact and prefix matching require strict URIs. Wildcard patterns permit empty components.
pub fn validate_pattern(pattern: &WildcardUri, style: MatchStyle) -> Result<(), InvalidUri> {
    match style {
        MatchStyle::Exact | MatchStyle::Prefix => validate_strict_uri(pattern),
        MatchStyle::Wildcard => Ok(()),
    }
}

/// Checks whether a stored pattern matches a concrete URI under the given match style.
pub fn pattern_matches_uri(pattern: &WildcardUri, style: MatchStyle, uri: &Uri) -> bool {
    match style {
        MatchStyle::Exact => pattern.as_ref() == uri.as_ref(),
        MatchStyle::Prefix => {
            let mut uri_components = uri.split();
            pattern
                .split()
                .all(|component| uri_components.next() == Some(component))
        }
        MatchStyle::Wildcard => {
            let pattern_components = pattern.split().collect::<Vec<_>>();
            let uri_components = uri.split().collect::<Vec<_>>();
            pattern_components.len() == uri_components.len()
                && pattern_components
                    .into_iter()
                    .zip(uri_components)
                    .all(|(pattern, uri)| pattern.is_empty() || pattern == uri)
        }
    }
}

/// Checks whether two stored patterns of the same match style can both match some concrete URI.
pub fn patterns_overlap(style: MatchStyle, a: &WildcardUri, b: &WildcardUri) -> bool {
    match style {
        MatchStyle::Exact => a == b,
        MatchStyle::Prefix => {
            let mut a_components = a.split();
            let mut b_components = b.split();
            loop {
                match (a_components.next(), b_components.next()) {
                    (Some(a), Some(b)) if a == b => continue,
                    (Some(_), Some(_)) => return false,
                    // One pattern is a component-aligned prefix of the other.
                    _ => return true,
                }
            }
        }
        MatchStyle::Wildcard => {
            let a_components = a.split().collect::<Vec<_>>();
            let b_components = b.split().collect::<Vec<_>>();
            a_components.len() == b_components.len()
                && a_components
                    .into_iter()
                    .zip(b_components)
                    .all(|(a, b)| a.is_empty() || b.is_empty() || a == b)
        }
    }
}

#[cfg(test)]
mod match_style_test {
    use crate::core::{
        match_style::{
            MatchStyle,
            pattern_matches_uri,
            patterns_overlap,
            validate_pattern,
        },
        uri::{
            Uri,
            WildcardUri,
        },
    };

    fn pattern(pattern: &str) -> WildcardUri {
        WildcardUri::try_from(pattern).unwrap()
    }

    fn uri(uri: &str) -> Uri {
        Uri::try_from(uri).unwrap()
    }

    #[test]
    fn parses_match_styles() {
        assert_matches::assert_matches!(MatchStyle::try_from("exact"), Ok(MatchStyle::Exact));
        assert_matches::assert_matches!(MatchStyle::try_from("prefix"), Ok(MatchStyle::Prefix));
        assert_matches::assert_matches!(MatchStyle::try_from("wildcard"), Ok(MatchStyle::Wildcard));
        assert_matches::assert_matches!(MatchStyle::try_from("fuzzy"), Err(_));
    }

    #[test]
    fn validates_patterns_by_style() {
        assert_matches::assert_matches!(validate_pattern(&pattern("a.b"), MatchStyle::Exact), Ok(()));
        assert_matches::assert_matches!(validate_pattern(&pattern("a..b"), MatchStyle::Exact), Err(_));
        assert_matches::assert_matches!(validate_pattern(&pattern("a..b"), MatchStyle::Prefix), Err(_));
        assert_matches::assert_matches!(
            validate_pattern(&pattern("a..b"), MatchStyle::Wildcard),
            Ok(())
        );
    }

    #[test]
    fn matches_exact_uris() {
        assert!(pattern_matches_uri(
            &pattern("com.test.topic"),
            MatchStyle::Exact,
            &uri("com.test.topic")
        ));
        assert!(!pattern_matches_uri(
            &pattern("com.test.topic"),
            MatchStyle::Exact,
            &uri("com.test.topic.a")
        ));
    }

    #[test]
    fn matches_component_aligned_prefixes() {
        assert!(pattern_matches_uri(
            &pattern("com.test"),
            MatchStyle::Prefix,
            &uri("com.test.topic.a")
        ));
        assert!(pattern_matches_uri(
            &pattern("com.test"),
            MatchStyle::Prefix,
            &uri("com.test")
        ));
        // Not component-aligned.
        assert!(!pattern_matches_uri(
            &pattern("com.test"),
            MatchStyle::Prefix,
            &uri("com.testing.topic")
        ));
        assert!(!pattern_matches_uri(
            &pattern("com.test.topic"),
            MatchStyle::Prefix,
            &uri("com.test")
        ));
    }

    #[test]
    fn matches_wildcards_on_equal_arity() {
        assert!(pattern_matches_uri(
            &pattern("com..topic"),
            MatchStyle::Wildcard,
            &uri("com.anything.topic")
        ));
        assert!(!pattern_matches_uri(
            &pattern("com..topic"),
            MatchStyle::Wildcard,
            &uri("com.a.b.topic")
        ));
        assert!(!pattern_matches_uri(
            &pattern("com..topic"),
            MatchStyle::Wildcard,
            &uri("com.a.other")
        ));
    }

    #[test]
    fn detects_overlapping_patterns() {
        assert!(patterns_overlap(
            MatchStyle::Exact,
            &pattern("a.b"),
            &pattern("a.b")
        ));
        assert!(!patterns_overlap(
            MatchStyle::Exact,
            &pattern("a.b"),
            &pattern("a.c")
        ));

        assert!(patterns_overlap(
            MatchStyle::Prefix,
            &pattern("a.b"),
            &pattern("a.b.c")
        ));
        assert!(patterns_overlap(
            MatchStyle::Prefix,
            &pattern("a.b.c"),
            &pattern("a.b")
        ));
        assert!(!patterns_overlap(
            MatchStyle::Prefix,
            &pattern("a.b"),
            &pattern("a.c")
        ));

        assert!(patterns_overlap(
            MatchStyle::Wildcard,
            &pattern("a..c"),
            &pattern("a.b.")
        ));
        assert!(!patterns_overlap(
            MatchStyle::Wildcard,
            &pattern("a..c"),
            &pattern("a.b.d")
        ));
        assert!(!patterns_overlap(
            MatchStyle::Wildcard,
            &pattern("a..c"),
            &pattern("a.b")
        ));
    }
}

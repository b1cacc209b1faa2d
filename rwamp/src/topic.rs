use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum UriError {
    InvalidUri(String),
    InvalidPolicy(String),
}

impl fmt::Display for UriError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UriError::InvalidUri(s) => {
                write!(f, "InvalidUri({})", s)
            }
            UriError::InvalidPolicy(s) => {
                write!(f, "InvalidPolicy({})", s)
            }
        }
    }
}

/// Matching policy of a subscription or registration, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    Exact,
    Prefix,
    Wildcard,
}

impl MatchPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchPolicy::Exact => "exact",
            MatchPolicy::Prefix => "prefix",
            MatchPolicy::Wildcard => "wildcard",
        }
    }
}

impl FromStr for MatchPolicy {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, UriError> {
        match s {
            "exact" => Ok(MatchPolicy::Exact),
            "prefix" => Ok(MatchPolicy::Prefix),
            "wildcard" => Ok(MatchPolicy::Wildcard),
            _ => Err(UriError::InvalidPolicy(format!("invalid match policy `{}`", s))),
        }
    }
}

impl fmt::Display for MatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A topic or procedure URI: dot-separated components. In a wildcard
/// pattern, an empty component is a wildcard position matching any single
/// component of a concrete URI.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub struct Uri(Vec<String>);

impl Uri {
    #[inline]
    pub fn components(&self) -> &[String] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether any component is a wildcard position.
    #[inline]
    pub fn is_wildcard(&self) -> bool {
        self.0.iter().any(|c| c.is_empty())
    }

    /// The pattern key: one boolean per component, true where the component
    /// is a wildcard position. Together with its length this identifies the
    /// shape of a wildcard pattern.
    #[inline]
    pub fn pattern_key(&self) -> Vec<bool> {
        self.0.iter().map(|c| c.is_empty()).collect()
    }

    /// Validate this URI against the policy it is being used under. Concrete
    /// topic names and exact/prefix patterns must not contain wildcard
    /// positions; wildcard patterns must contain at least one.
    pub fn validate(&self, policy: MatchPolicy) -> Result<(), UriError> {
        match policy {
            MatchPolicy::Exact | MatchPolicy::Prefix => {
                if self.is_wildcard() {
                    return Err(UriError::InvalidUri(format!(
                        "`{}` contains empty components, not allowed under {} matching",
                        self, policy
                    )));
                }
            }
            MatchPolicy::Wildcard => {
                if !self.is_wildcard() {
                    return Err(UriError::InvalidUri(format!(
                        "`{}` contains no wildcard component, use exact matching",
                        self
                    )));
                }
            }
        }
        Ok(())
    }
}

impl FromStr for Uri {
    type Err = UriError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, UriError> {
        let components: Vec<String> = s.split('.').map(String::from).collect();
        if components.iter().all(|c| c.is_empty()) {
            return Err(UriError::InvalidUri(format!("invalid URI `{}`", s)));
        }
        Ok(Uri(components))
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// The pattern key of a pattern given as a string.
#[inline]
pub fn pattern_key_of(pattern: &str) -> Vec<bool> {
    pattern.split('.').map(|c| c.is_empty()).collect()
}

/// Reduce a concrete URI's components against a pattern key: components at
/// wildcard positions are blanked out. The result is the only pattern string
/// with that key which can match the URI, so matching is a direct lookup.
#[inline]
pub fn reduced_form(components: &[&str], key: &[bool]) -> String {
    debug_assert_eq!(components.len(), key.len());
    components
        .iter()
        .zip(key.iter())
        .map(|(c, wildcard)| if *wildcard { "" } else { *c })
        .collect::<Vec<_>>()
        .join(".")
}

/// Whether a wildcard pattern matches a concrete URI: same component count,
/// wildcard positions match anything, literal components must be equal.
#[inline]
pub fn wildcard_matches(pattern: &str, uri: &str) -> bool {
    let mut pi = pattern.split('.');
    let mut ui = uri.split('.');
    loop {
        match (pi.next(), ui.next()) {
            (Some(p), Some(u)) => {
                if !p.is_empty() && p != u {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uri() {
        let u: Uri = "com.example.topic1".parse().unwrap();
        assert_eq!(u.components(), &["com", "example", "topic1"]);
        assert_eq!(u.to_string(), "com.example.topic1");
        assert!(!u.is_wildcard());

        let w: Uri = "com.example..create".parse().unwrap();
        assert!(w.is_wildcard());
        assert_eq!(w.pattern_key(), vec![false, false, true, false]);

        assert!("".parse::<Uri>().is_err());
        assert!("...".parse::<Uri>().is_err());
    }

    #[test]
    fn test_validate() {
        let exact: Uri = "com.example.topic1".parse().unwrap();
        assert!(exact.validate(MatchPolicy::Exact).is_ok());
        assert!(exact.validate(MatchPolicy::Prefix).is_ok());
        assert!(exact.validate(MatchPolicy::Wildcard).is_err());

        let wild: Uri = "com.example..create".parse().unwrap();
        assert!(wild.validate(MatchPolicy::Wildcard).is_ok());
        assert!(wild.validate(MatchPolicy::Exact).is_err());
        assert!(wild.validate(MatchPolicy::Prefix).is_err());
    }

    #[test]
    fn test_match_policy() {
        assert_eq!("exact".parse::<MatchPolicy>().unwrap(), MatchPolicy::Exact);
        assert_eq!("prefix".parse::<MatchPolicy>().unwrap(), MatchPolicy::Prefix);
        assert_eq!("wildcard".parse::<MatchPolicy>().unwrap(), MatchPolicy::Wildcard);
        assert!("fuzzy".parse::<MatchPolicy>().is_err());
        assert_eq!(MatchPolicy::Wildcard.to_string(), "wildcard");
    }

    #[test]
    fn test_wildcard_matches() {
        assert!(wildcard_matches("com.example..create", "com.example.widget.create"));
        assert!(wildcard_matches("com.example..create", "com.example.anything.create"));
        assert!(!wildcard_matches("com.example..create", "com.example.create"));
        assert!(!wildcard_matches("com.example..create", "com.example.widget.delete"));
        assert!(!wildcard_matches("com.example..create", "com.example.widget.create.extra"));
    }

    #[test]
    fn test_reduced_form() {
        let key = pattern_key_of("com.example..create");
        let components: Vec<&str> = "com.example.widget.create".split('.').collect();
        assert_eq!(reduced_form(&components, &key), "com.example..create");
    }
}

// Namespace-qualified key patterns shared by both cache backends

use crate::errors::CacheError;
use regex::Regex;

/// Separator between the namespace and the caller's key
pub const NAMESPACE_SEPARATOR: char = ':';

/// Build the stored form of a caller's key: `"{app_name}:{key}"`
pub fn qualify_key(app_name: &str, key: &str) -> String {
    format!("{}{}{}", app_name, NAMESPACE_SEPARATOR, key)
}

/// Strip the namespace from a stored key, if it belongs to `app_name`
pub fn unqualify_key<'a>(app_name: &str, qualified: &'a str) -> Option<&'a str> {
    qualified
        .strip_prefix(app_name)
        .and_then(|rest| rest.strip_prefix(NAMESPACE_SEPARATOR))
}

/// A caller's glob pattern bound to one namespace.
///
/// The pattern may contain `*` (any run of characters) and `?` (any single
/// character) and matches anywhere inside the namespace, so the effective
/// pattern is `"{app_name}:*{pattern}*"`. The namespace itself is always
/// matched literally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern {
    app_name: String,
    pattern: String,
}

impl KeyPattern {
    pub fn new(app_name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            pattern: pattern.into(),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Compile into an anchored regex over qualified keys
    pub fn to_regex(&self) -> Result<Regex, CacheError> {
        let mut source = String::with_capacity(self.app_name.len() + self.pattern.len() + 16);
        source.push_str("(?s)^");
        source.push_str(&regex::escape(&self.app_name));
        source.push_str(&regex::escape(&NAMESPACE_SEPARATOR.to_string()));
        source.push_str(".*");
        for c in self.pattern.chars() {
            match c {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                other => source.push_str(&regex::escape(&other.to_string())),
            }
        }
        source.push_str(".*$");

        Regex::new(&source).map_err(|e| CacheError::InvalidPattern {
            pattern: self.pattern.clone(),
            reason: e.to_string(),
        })
    }

    /// Render as a Redis `SCAN MATCH` glob
    pub fn to_redis_match(&self) -> String {
        let mut glob = String::with_capacity(self.app_name.len() + self.pattern.len() + 4);
        for c in self.app_name.chars() {
            push_redis_literal(&mut glob, c);
        }
        glob.push(NAMESPACE_SEPARATOR);
        glob.push('*');
        for c in self.pattern.chars() {
            match c {
                '*' | '?' => glob.push(c),
                other => push_redis_literal(&mut glob, other),
            }
        }
        glob.push('*');
        glob
    }
}

fn push_redis_literal(glob: &mut String, c: char) {
    if matches!(c, '*' | '?' | '[' | ']' | '\\') {
        glob.push('\\');
    }
    glob.push(c);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualify_and_unqualify() {
        let qualified = qualify_key("App", "Foo:1");
        assert_eq!(qualified, "App:Foo:1");
        assert_eq!(unqualify_key("App", &qualified), Some("Foo:1"));
        assert_eq!(unqualify_key("Other", &qualified), None);
        assert_eq!(unqualify_key("Ap", &qualified), None);
    }

    #[test]
    fn test_substring_pattern_matches_within_namespace() {
        let regex = KeyPattern::new("App", "Foo").to_regex().unwrap();
        assert!(regex.is_match("App:Foo:1"));
        assert!(regex.is_match("App:Bar:Foo"));
        assert!(!regex.is_match("App:Bar:1"));
        assert!(!regex.is_match("Other:Foo:1"));
        assert!(!regex.is_match("App2:Foo:1"));
    }

    #[test]
    fn test_glob_wildcards() {
        let regex = KeyPattern::new("App", "Foo:?").to_regex().unwrap();
        assert!(regex.is_match("App:Foo:1"));
        assert!(!regex.is_match("App:Foo:"));

        let regex = KeyPattern::new("App", "*").to_regex().unwrap();
        assert!(regex.is_match("App:anything"));
        assert!(!regex.is_match("Apps:anything"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let regex = KeyPattern::new("A.p", "x+y").to_regex().unwrap();
        assert!(regex.is_match("A.p:x+y"));
        assert!(!regex.is_match("Axp:xxy"));
    }

    #[test]
    fn test_redis_match_escapes_namespace() {
        assert_eq!(KeyPattern::new("App", "Foo").to_redis_match(), "App:*Foo*");
        assert_eq!(KeyPattern::new("A*p", "F?o").to_redis_match(), "A\\*p:*F?o*");
        assert_eq!(KeyPattern::new("App", "[x]").to_redis_match(), "App:*\\[x\\]*");
    }
}

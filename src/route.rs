//! URL pattern translation.
//!
//! Endpoints are written with `:name` parameters and a trailing `*name`
//! catch-all (`/users/:id`, `/files/*path`). The router expects `{name}`
//! and `{*name}`; segments already written that way are accepted as well.

use std::fmt;

/// One `/`-separated piece of a URL pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Static(String),
    Param(String),
    CatchAll(String),
}

impl Segment {
    fn is_wildcard(&self) -> bool {
        !matches!(self, Segment::Static(_))
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Static(text) => f.write_str(text),
            Segment::Param(name) => write!(f, "{{{name}}}"),
            Segment::CatchAll(name) => write!(f, "{{*{name}}}"),
        }
    }
}

/// A parsed URL pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    segments: Vec<Segment>,
}

impl RoutePattern {
    pub fn parse(pattern: &str) -> Result<Self, String> {
        let Some(rest) = pattern.strip_prefix('/') else {
            return Err(format!("'{pattern}' must start with '/'"));
        };

        let raw: Vec<&str> = rest.split('/').collect();
        let mut segments = Vec::with_capacity(raw.len());
        for (index, text) in raw.iter().enumerate() {
            let segment = parse_segment(pattern, text)?;
            if let Segment::CatchAll(name) = &segment {
                if index + 1 != raw.len() {
                    return Err(format!(
                        "catch-all '*{name}' must be the last segment of '{pattern}'"
                    ));
                }
            }
            segments.push(segment);
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Whether the two patterns cannot live in one router.
    ///
    /// After an identical prefix, two wildcards at the same position must
    /// agree on both kind and name.
    pub fn conflicts_with(&self, other: &RoutePattern) -> bool {
        for (mine, theirs) in self.segments.iter().zip(&other.segments) {
            if mine == theirs {
                continue;
            }
            return mine.is_wildcard() && theirs.is_wildcard();
        }
        false
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

/// Translate a configured URL pattern into router syntax.
pub fn to_axum_path(pattern: &str) -> Result<String, String> {
    RoutePattern::parse(pattern).map(|route| route.to_string())
}

fn parse_segment(pattern: &str, text: &str) -> Result<Segment, String> {
    if let Some(name) = text.strip_prefix(':') {
        check_name(pattern, name)?;
        return Ok(Segment::Param(name.to_string()));
    }
    if let Some(name) = text.strip_prefix('*') {
        check_name(pattern, name)?;
        return Ok(Segment::CatchAll(name.to_string()));
    }
    if let Some(inner) = text.strip_prefix('{').and_then(|t| t.strip_suffix('}')) {
        if let Some(name) = inner.strip_prefix('*') {
            check_name(pattern, name)?;
            return Ok(Segment::CatchAll(name.to_string()));
        }
        check_name(pattern, inner)?;
        return Ok(Segment::Param(inner.to_string()));
    }
    if text.contains([':', '*', '{', '}']) {
        return Err(format!("parameter must span a whole segment in '{pattern}'"));
    }
    Ok(Segment::Static(text.to_string()))
}

fn check_name(pattern: &str, name: &str) -> Result<(), String> {
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
        return Err(format!("invalid parameter name '{name}' in '{pattern}'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflicts(a: &str, b: &str) -> bool {
        let a = RoutePattern::parse(a).unwrap();
        let b = RoutePattern::parse(b).unwrap();
        a.conflicts_with(&b) && b.conflicts_with(&a)
    }

    #[test]
    fn test_static_path() {
        assert_eq!(to_axum_path("/echo").unwrap(), "/echo");
        assert_eq!(to_axum_path("/").unwrap(), "/");
        assert_eq!(to_axum_path("/api/v1/items/").unwrap(), "/api/v1/items/");
    }

    #[test]
    fn test_named_parameters() {
        assert_eq!(
            to_axum_path("/users/:id/posts/:post_id").unwrap(),
            "/users/{id}/posts/{post_id}"
        );
    }

    #[test]
    fn test_catch_all() {
        assert_eq!(to_axum_path("/files/*path").unwrap(), "/files/{*path}");
        assert!(to_axum_path("/files/*path/more").is_err());
        assert!(to_axum_path("/files/{*path}/more").is_err());
    }

    #[test]
    fn test_braced_segments() {
        assert_eq!(to_axum_path("/users/{id}").unwrap(), "/users/{id}");
        assert_eq!(to_axum_path("/files/{*rest}").unwrap(), "/files/{*rest}");
        assert_eq!(
            RoutePattern::parse("/users/{id}").unwrap(),
            RoutePattern::parse("/users/:id").unwrap()
        );
    }

    #[test]
    fn test_malformed_braces() {
        assert!(to_axum_path("/a/{x").is_err());
        assert!(to_axum_path("/a/x}").is_err());
        assert!(to_axum_path("/a/{}").is_err());
        assert!(to_axum_path("/a/{*}").is_err());
        assert!(to_axum_path("/a/{x}.json").is_err());
        assert!(to_axum_path("/a/{x}{y}").is_err());
        assert!(to_axum_path("/a/{x y}").is_err());
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(to_axum_path("users").is_err());
        assert!(to_axum_path("/users/:").is_err());
        assert!(to_axum_path("/users/id:x").is_err());
        assert!(to_axum_path("/users/:a.b").is_err());
    }

    #[test]
    fn test_parameter_names_must_agree() {
        assert!(conflicts("/users/:id", "/users/:name"));
        assert!(conflicts("/users/:id/posts", "/users/:name"));
        assert!(conflicts("/files/*path", "/files/:name"));
        assert!(conflicts("/files/*path", "/files/*rest"));
        assert!(conflicts("/files/{*path}", "/files/:path"));
    }

    #[test]
    fn test_compatible_patterns() {
        assert!(!conflicts("/users/:id", "/users/:id"));
        assert!(!conflicts("/users/:id", "/users/:id/posts/:post"));
        assert!(!conflicts("/users/new", "/users/:id"));
        assert!(!conflicts("/users/:id", "/orders/:order"));
        assert!(!conflicts("/a/:x/b/:y", "/a/:x/c/:z"));
    }
}

//! Three-tier responder storage and the matching algorithm.

use crate::component::PathComponent;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Fixed capacity of an encoded route key.
pub const ROUTE_KEY_CAPACITY: usize = 256;

/// Fixed-width encoded `METHOD + ' ' + PATH`, the O(1) lookup key for
/// parameterless routes. Derived from the request start line each time
/// dispatch is attempted, never stored beyond it.
#[derive(Clone, Copy)]
pub struct RouteKey {
    len: u16,
    bytes: [u8; ROUTE_KEY_CAPACITY],
}

impl RouteKey {
    /// Encode a key. Returns `None` when method + path exceed the fixed
    /// capacity; such requests can only match in the later tiers.
    pub fn new(method: &str, path: &str) -> Option<Self> {
        Self::encode(method, path, false)
    }

    /// Case-insensitive variant: lower-cases while encoding.
    pub fn new_ignore_case(method: &str, path: &str) -> Option<Self> {
        Self::encode(method, path, true)
    }

    fn encode(method: &str, path: &str, lower: bool) -> Option<Self> {
        let total = method.len() + 1 + path.len();
        if total > ROUTE_KEY_CAPACITY {
            return None;
        }
        let mut bytes = [0u8; ROUTE_KEY_CAPACITY];
        bytes[..method.len()].copy_from_slice(method.as_bytes());
        bytes[method.len()] = b' ';
        bytes[method.len() + 1..total].copy_from_slice(path.as_bytes());
        if lower {
            bytes[..total].make_ascii_lowercase();
        }
        Some(Self {
            len: total as u16,
            bytes,
        })
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl PartialEq for RouteKey {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for RouteKey {}

impl Hash for RouteKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl fmt::Debug for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RouteKey({})", String::from_utf8_lossy(self.as_bytes()))
    }
}

/// A registered route: method, raw path, and its compiled components.
#[derive(Debug, Clone)]
pub struct Route {
    method: String,
    path: String,
    components: Vec<PathComponent>,
}

impl Route {
    /// Compile a route specification, e.g. `Route::parse("GET", "/users/{id}")`.
    pub fn parse(method: &str, path: &str) -> Self {
        let components = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(PathComponent::parse)
            .collect();
        Self {
            method: method.to_uppercase(),
            path: path.to_string(),
            components,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn components(&self) -> &[PathComponent] {
        &self.components
    }

    pub fn segment_count(&self) -> usize {
        self.components.len()
    }

    /// True when any component captures a parameter.
    pub fn is_parameterized(&self) -> bool {
        self.components.iter().any(PathComponent::is_parameter)
    }

    /// True when the path contains a `**` component.
    pub fn has_catchall(&self) -> bool {
        self.components
            .iter()
            .any(|c| matches!(c, PathComponent::Catchall))
    }
}

/// Registration failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertError {
    /// A parameterless route with this key already exists and override was
    /// not requested.
    Duplicate { method: String, path: String },
    /// Method + path exceed [`ROUTE_KEY_CAPACITY`].
    KeyTooLong { method: String, path: String },
    /// `**` may only appear as the final component.
    CatchallNotLast { path: String },
}

impl fmt::Display for InsertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsertError::Duplicate { method, path } => {
                write!(f, "duplicate route: {} {}", method, path)
            }
            InsertError::KeyTooLong { method, path } => {
                write!(f, "route key too long: {} {}", method, path)
            }
            InsertError::CatchallNotLast { path } => {
                write!(f, "catchall must be the final segment: {}", path)
            }
        }
    }
}

impl std::error::Error for InsertError {}

/// Route match result.
#[derive(Debug)]
pub struct Match<'a, T> {
    /// The matched stored value.
    pub value: &'a T,
    /// Captured path parameters as (name, value) pairs. Catchall tails are
    /// captured under `"*"`.
    pub params: Vec<(String, String)>,
}

/// Three-tier route storage: parameterless (exact key), parameterized
/// (bucketed by segment count), catchall. Populated at registration time,
/// queried at request time, never mutated mid-request.
#[derive(Debug)]
pub struct RouteTable<T> {
    parameterless: HashMap<RouteKey, T>,
    parameterized: Vec<Vec<(Route, T)>>,
    catchall: Vec<(Route, T)>,
    ignore_case: bool,
}

impl<T> RouteTable<T> {
    /// Create an empty, case-sensitive table.
    pub fn new() -> Self {
        Self {
            parameterless: HashMap::new(),
            parameterized: Vec::new(),
            catchall: Vec::new(),
            ignore_case: false,
        }
    }

    /// Table variant that lower-cases method + path before key encoding.
    pub fn new_ignore_case() -> Self {
        Self {
            ignore_case: true,
            ..Self::new()
        }
    }

    fn key_for(&self, method: &str, path: &str) -> Option<RouteKey> {
        if self.ignore_case {
            RouteKey::new_ignore_case(method, path)
        } else {
            RouteKey::new(method, path)
        }
    }

    /// Number of registered routes across all tiers.
    pub fn len(&self) -> usize {
        self.parameterless.len()
            + self.parameterized.iter().map(Vec::len).sum::<usize>()
            + self.catchall.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a route. `override_existing` controls whether a duplicate
    /// parameterless key replaces the previous value or is rejected.
    pub fn insert(
        &mut self,
        route: Route,
        value: T,
        override_existing: bool,
    ) -> Result<(), InsertError> {
        if let Some(pos) = route
            .components()
            .iter()
            .position(|c| matches!(c, PathComponent::Catchall))
        {
            if pos + 1 != route.components().len() {
                return Err(InsertError::CatchallNotLast {
                    path: route.path().to_string(),
                });
            }
            self.catchall.push((route, value));
            return Ok(());
        }

        if route.is_parameterized() {
            let count = route.segment_count();
            if self.parameterized.len() <= count {
                self.parameterized.resize_with(count + 1, Vec::new);
            }
            self.parameterized[count].push((route, value));
            return Ok(());
        }

        let key = self
            .key_for(route.method(), route.path())
            .ok_or_else(|| InsertError::KeyTooLong {
                method: route.method().to_string(),
                path: route.path().to_string(),
            })?;
        if !override_existing && self.parameterless.contains_key(&key) {
            return Err(InsertError::Duplicate {
                method: route.method().to_string(),
                path: route.path().to_string(),
            });
        }
        self.parameterless.insert(key, value);
        Ok(())
    }

    /// Resolve a request to a stored value, trying the three tiers in order
    /// and stopping at the first match.
    pub fn find(&self, method: &str, path: &str) -> Option<Match<'_, T>> {
        // Tier 1: parameterless exact match, always tried first.
        if let Some(key) = self.key_for(method, path) {
            if let Some(value) = self.parameterless.get(&key) {
                return Some(Match {
                    value,
                    params: Vec::new(),
                });
            }
        }

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        // Tier 2: exact segment count bucket, registration order.
        if let Some(bucket) = self.parameterized.get(segments.len()) {
            'candidates: for (route, value) in bucket {
                if !self.method_matches(route.method(), method) {
                    continue;
                }
                for (component, segment) in route.components().iter().zip(&segments) {
                    if !component.is_parameter() && !literal_matches(component, segment) {
                        continue 'candidates;
                    }
                }
                let mut params = Vec::new();
                for (component, segment) in route.components().iter().zip(&segments) {
                    if component.is_parameter() {
                        component.capture(segment, &mut params);
                    }
                }
                return Some(Match { value, params });
            }
        }

        // Tier 3: catchall walk, registration order.
        'catchalls: for (route, value) in &self.catchall {
            if !self.method_matches(route.method(), method) {
                continue;
            }
            let mut params = Vec::new();
            let mut index = 0;
            for component in route.components() {
                match component {
                    PathComponent::Catchall => {
                        params.push(("*".to_string(), segments[index..].join("/")));
                        return Some(Match { value, params });
                    }
                    component if component.is_parameter() => match segments.get(index) {
                        Some(segment) => {
                            component.capture(segment, &mut params);
                            index += 1;
                        }
                        None => continue 'catchalls,
                    },
                    component => match segments.get(index) {
                        Some(segment) if literal_matches(component, segment) => index += 1,
                        _ => continue 'catchalls,
                    },
                }
            }
            // Insert validates the catchall is the final component, so the
            // walk above always returns before falling through.
        }

        None
    }

    fn method_matches(&self, route_method: &str, request_method: &str) -> bool {
        if self.ignore_case {
            route_method.eq_ignore_ascii_case(request_method)
        } else {
            route_method == request_method
        }
    }
}

impl<T> Default for RouteTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn literal_matches(component: &PathComponent, segment: &str) -> bool {
    match component {
        PathComponent::Literal(text) => text == segment,
        // Non-parameter composites (unbalanced braces) compare as full text.
        other => other.value() == segment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameterless_exact_match() {
        let mut table = RouteTable::new();
        table.insert(Route::parse("GET", "/"), 0, false).unwrap();
        table.insert(Route::parse("GET", "/users"), 1, false).unwrap();
        table.insert(Route::parse("POST", "/users"), 2, false).unwrap();

        assert_eq!(*table.find("GET", "/").unwrap().value, 0);
        assert_eq!(*table.find("GET", "/users").unwrap().value, 1);
        assert_eq!(*table.find("POST", "/users").unwrap().value, 2);
        assert!(table.find("DELETE", "/users").is_none());
        assert!(table.find("GET", "/unknown").is_none());
    }

    #[test]
    fn test_parameterless_wins_over_parameterized() {
        let mut table = RouteTable::new();
        table.insert(Route::parse("GET", "/users/{id}"), 1, false).unwrap();
        table.insert(Route::parse("GET", "/users/me"), 2, false).unwrap();

        // Tier 1 always runs before tier 2.
        assert_eq!(*table.find("GET", "/users/me").unwrap().value, 2);
        assert_eq!(*table.find("GET", "/users/42").unwrap().value, 1);
    }

    #[test]
    fn test_parameterized_capture() {
        let mut table = RouteTable::new();
        table
            .insert(Route::parse("GET", "/users/{id}/posts/{post_id}"), 1, false)
            .unwrap();

        let m = table.find("GET", "/users/42/posts/99").unwrap();
        assert_eq!(*m.value, 1);
        assert_eq!(
            m.params,
            vec![
                ("id".to_string(), "42".to_string()),
                ("post_id".to_string(), "99".to_string()),
            ]
        );
    }

    #[test]
    fn test_registration_order_tie_break() {
        let mut table = RouteTable::new();
        table.insert(Route::parse("GET", "/a/{x}"), 1, false).unwrap();
        table.insert(Route::parse("GET", "/a/{y}"), 2, false).unwrap();

        // Both candidates satisfy every literal segment; the earlier
        // registration wins deterministically.
        let m = table.find("GET", "/a/value").unwrap();
        assert_eq!(*m.value, 1);
        assert_eq!(m.params, vec![("x".to_string(), "value".to_string())]);
    }

    #[test]
    fn test_segment_count_out_of_range() {
        let mut table = RouteTable::new();
        table.insert(Route::parse("GET", "/a/{x}"), 1, false).unwrap();

        assert!(table.find("GET", "/a").is_none());
        assert!(table.find("GET", "/a/b/c").is_none());
    }

    #[test]
    fn test_catchall_boundary() {
        let mut table = RouteTable::new();
        table.insert(Route::parse("GET", "/files/**"), 1, false).unwrap();

        let m = table.find("GET", "/files/a/b/c").unwrap();
        assert_eq!(*m.value, 1);
        assert_eq!(m.params, vec![("*".to_string(), "a/b/c".to_string())]);
        assert!(table.find("GET", "/other/a").is_none());
    }

    #[test]
    fn test_catchall_matches_empty_tail() {
        let mut table = RouteTable::new();
        table.insert(Route::parse("GET", "/files/**"), 1, false).unwrap();

        let m = table.find("GET", "/files").unwrap();
        assert_eq!(m.params, vec![("*".to_string(), String::new())]);
    }

    #[test]
    fn test_catchall_registration_order() {
        let mut table = RouteTable::new();
        table.insert(Route::parse("GET", "/{kind}/**"), 1, false).unwrap();
        table.insert(Route::parse("GET", "/files/**"), 2, false).unwrap();

        // The earlier-registered catchall also satisfies /files/x.
        assert_eq!(*table.find("GET", "/files/x").unwrap().value, 1);
    }

    #[test]
    fn test_parameterized_wins_over_catchall() {
        let mut table = RouteTable::new();
        table.insert(Route::parse("GET", "/api/**"), 1, false).unwrap();
        table.insert(Route::parse("GET", "/api/{version}"), 2, false).unwrap();

        assert_eq!(*table.find("GET", "/api/v1").unwrap().value, 2);
        assert_eq!(*table.find("GET", "/api/v1/users").unwrap().value, 1);
    }

    #[test]
    fn test_composite_segment() {
        let mut table = RouteTable::new();
        table
            .insert(Route::parse("GET", "/releases/v{version}"), 1, false)
            .unwrap();

        let m = table.find("GET", "/releases/v1.2").unwrap();
        assert_eq!(*m.value, 1);
        assert_eq!(m.params, vec![("version".to_string(), "1.2".to_string())]);
    }

    #[test]
    fn test_duplicate_rejected_without_override() {
        let mut table = RouteTable::new();
        table.insert(Route::parse("GET", "/users"), 1, false).unwrap();

        let err = table.insert(Route::parse("GET", "/users"), 2, false).unwrap_err();
        assert!(matches!(err, InsertError::Duplicate { .. }));
        // The original registration is untouched.
        assert_eq!(*table.find("GET", "/users").unwrap().value, 1);
    }

    #[test]
    fn test_duplicate_replaced_with_override() {
        let mut table = RouteTable::new();
        table.insert(Route::parse("GET", "/users"), 1, false).unwrap();
        table.insert(Route::parse("GET", "/users"), 2, true).unwrap();

        assert_eq!(*table.find("GET", "/users").unwrap().value, 2);
    }

    #[test]
    fn test_catchall_must_be_last() {
        let mut table = RouteTable::new();
        let err = table
            .insert(Route::parse("GET", "/a/**/b"), 1, false)
            .unwrap_err();
        assert!(matches!(err, InsertError::CatchallNotLast { .. }));
    }

    #[test]
    fn test_key_too_long() {
        let mut table = RouteTable::new();
        let path = format!("/{}", "x".repeat(ROUTE_KEY_CAPACITY));
        let err = table.insert(Route::parse("GET", &path), 1, false).unwrap_err();
        assert!(matches!(err, InsertError::KeyTooLong { .. }));
    }

    #[test]
    fn test_ignore_case_variant() {
        let mut table = RouteTable::new_ignore_case();
        table.insert(Route::parse("GET", "/Users"), 1, false).unwrap();

        assert_eq!(*table.find("GET", "/users").unwrap().value, 1);
        assert_eq!(*table.find("get", "/USERS").unwrap().value, 1);
    }

    #[test]
    fn test_method_must_match_in_later_tiers() {
        let mut table = RouteTable::new();
        table.insert(Route::parse("GET", "/users/{id}"), 1, false).unwrap();
        table.insert(Route::parse("GET", "/files/**"), 2, false).unwrap();

        assert!(table.find("POST", "/users/42").is_none());
        assert!(table.find("POST", "/files/a").is_none());
    }

    #[test]
    fn test_route_key_determinism() {
        let a = RouteKey::new("GET", "/users").unwrap();
        let b = RouteKey::new("GET", "/users").unwrap();
        let c = RouteKey::new("GET", "/user").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let lower = RouteKey::new_ignore_case("GET", "/Users").unwrap();
        let lower2 = RouteKey::new_ignore_case("get", "/users").unwrap();
        assert_eq!(lower, lower2);
    }

    #[test]
    fn test_len() {
        let mut table = RouteTable::new();
        assert!(table.is_empty());
        table.insert(Route::parse("GET", "/"), 0, false).unwrap();
        table.insert(Route::parse("GET", "/{x}"), 1, false).unwrap();
        table.insert(Route::parse("GET", "/**"), 2, false).unwrap();
        assert_eq!(table.len(), 3);
    }
}

//! Compiled path segments.
//!
//! A route specification such as `/users/{id}/files/**` is split on `/` and
//! each raw segment is compiled into one [`PathComponent`] at registration
//! time. Components are immutable once built and owned by the route that
//! declares them.

/// One compiled segment of a route path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathComponent {
    /// Plain text, matched by literal comparison.
    Literal(String),
    /// `{name}`, matches any single segment and captures it.
    Parameter(String),
    /// `**`, matches the entire remaining path.
    Catchall,
    /// A segment mixing literal text and an embedded parameter, e.g.
    /// `a{b}c`. Chained pairwise: `a{b}c` compiles to
    /// `Composite(a, Composite({b}, c))`.
    Composite(Box<PathComponent>, Option<Box<PathComponent>>),
}

impl PathComponent {
    /// Compile one raw path segment.
    pub fn parse(segment: &str) -> Self {
        if segment == "**" {
            return PathComponent::Catchall;
        }
        match segment.find('{') {
            None => PathComponent::Literal(segment.to_string()),
            Some(0) => match segment.find('}') {
                Some(close) => {
                    let name = segment[1..close].to_string();
                    let rest = &segment[close + 1..];
                    if rest.is_empty() {
                        PathComponent::Parameter(name)
                    } else {
                        PathComponent::Composite(
                            Box::new(PathComponent::Parameter(name)),
                            Some(Box::new(PathComponent::parse(rest))),
                        )
                    }
                }
                // Unbalanced brace, keep the text literal.
                None => PathComponent::Literal(segment.to_string()),
            },
            Some(open) => PathComponent::Composite(
                Box::new(PathComponent::Literal(segment[..open].to_string())),
                Some(Box::new(PathComponent::parse(&segment[open..]))),
            ),
        }
    }

    /// True for `Parameter`, `Catchall`, and any composite containing one.
    pub fn is_parameter(&self) -> bool {
        match self {
            PathComponent::Literal(_) => false,
            PathComponent::Parameter(_) | PathComponent::Catchall => true,
            PathComponent::Composite(first, second) => {
                first.is_parameter()
                    || second.as_deref().map_or(false, PathComponent::is_parameter)
            }
        }
    }

    /// Matchable text: the literal text, the parameter name, or the
    /// concatenation of both for composites.
    pub fn value(&self) -> String {
        match self {
            PathComponent::Literal(text) => text.clone(),
            PathComponent::Parameter(name) => name.clone(),
            PathComponent::Catchall => "**".to_string(),
            PathComponent::Composite(first, second) => {
                let mut out = first.value();
                if let Some(second) = second {
                    out.push_str(&second.value());
                }
                out
            }
        }
    }

    /// Concatenated literal text at the front of this component. Used to
    /// locate where a preceding parameter capture ends inside a composite.
    fn leading_literal(&self) -> &str {
        match self {
            PathComponent::Literal(text) => text,
            PathComponent::Composite(first, _) => first.leading_literal(),
            _ => "",
        }
    }

    /// Record the parameter values this component captures from `segment`.
    pub(crate) fn capture(&self, segment: &str, params: &mut Vec<(String, String)>) {
        match self {
            PathComponent::Literal(_) | PathComponent::Catchall => {}
            PathComponent::Parameter(name) => {
                params.push((name.clone(), segment.to_string()));
            }
            PathComponent::Composite(first, second) => {
                match (first.as_ref(), second.as_deref()) {
                    (PathComponent::Literal(text), Some(rest)) => {
                        let tail = segment.strip_prefix(text.as_str()).unwrap_or(segment);
                        rest.capture(tail, params);
                    }
                    (PathComponent::Parameter(name), Some(rest)) => {
                        let lead = rest.leading_literal();
                        let end = if lead.is_empty() {
                            segment.len()
                        } else {
                            segment.find(lead).unwrap_or(segment.len())
                        };
                        params.push((name.clone(), segment[..end].to_string()));
                        rest.capture(&segment[end..], params);
                    }
                    (only, _) => only.capture(segment, params),
                }
            }
        }
    }
}

//! Middleware pipeline
//!
//! Two kinds, with different lifetimes. Static middleware runs once per
//! route at registration time and edits the route's compiled default
//! response. Dynamic middleware runs once per request on the scheduler, in
//! registration order, and can short-circuit the chain.

pub mod cookie;

pub use cookie::{Cookie, SameSite};

use crate::parser::{Method, Version};
use crate::request::Request;
use crate::response::{Response, StatusCode};
use crate::router::RouteDefaults;
use crate::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Outcome of one dynamic middleware step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Proceed to the next step, then the route logic.
    Continue,
    /// Halt the chain; the in-flight response is written as-is.
    Stop,
}

/// Boxed future returned by a dynamic middleware step.
pub type BoxFlowFuture<'a> = Pin<Box<dyn Future<Output = Result<Flow>> + Send + 'a>>;

/// Per-request middleware. Runs on the cooperative scheduler; a slow step
/// never stalls the reactor thread. Errors are routed to the error
/// responder exactly like responder errors.
pub trait DynamicMiddleware: Send + Sync {
    fn handle<'a>(
        &'a self,
        req: &'a mut Request,
        res: &'a mut Response,
    ) -> BoxFlowFuture<'a>;
}

/// Ordered dynamic middleware chain.
#[derive(Clone, Default)]
pub struct DynamicChain {
    steps: Vec<Arc<dyn DynamicMiddleware>>,
}

impl DynamicChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<M: DynamicMiddleware + 'static>(&mut self, step: M) {
        self.steps.push(Arc::new(step));
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Run the chain in registration order, short-circuiting on `Stop`.
    pub async fn run(&self, req: &mut Request, res: &mut Response) -> Result<Flow> {
        for step in &self.steps {
            if step.handle(req, res).await? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }
}

/// Registration-time middleware.
///
/// Declares what it handles (any unset criterion handles everything) and
/// the edits it makes. When it handles the route being registered it
/// overrides declared fields, merges response headers, and appends cookies
/// into the route's compiled defaults. It never runs per request.
#[derive(Clone, Default)]
pub struct StaticMiddleware {
    methods: Option<Vec<Method>>,
    versions: Option<Vec<Version>>,
    content_types: Option<Vec<String>>,
    statuses: Option<Vec<u16>>,
    excluded_paths: Vec<String>,
    set_status: Option<StatusCode>,
    set_content_type: Option<String>,
    set_version: Option<Version>,
    headers: Vec<(String, String)>,
    cookies: Vec<Cookie>,
}

impl StaticMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to routes with one of these methods.
    pub fn handles_methods(mut self, methods: impl Into<Vec<Method>>) -> Self {
        self.methods = Some(methods.into());
        self
    }

    /// Restrict to routes with one of these versions.
    pub fn handles_versions(mut self, versions: impl Into<Vec<Version>>) -> Self {
        self.versions = Some(versions.into());
        self
    }

    /// Restrict to routes declaring one of these content types.
    pub fn handles_content_types(mut self, types: impl Into<Vec<String>>) -> Self {
        self.content_types = Some(types.into());
        self
    }

    /// Restrict to routes declaring one of these statuses.
    pub fn handles_statuses(mut self, statuses: impl Into<Vec<u16>>) -> Self {
        self.statuses = Some(statuses.into());
        self
    }

    /// Opt a specific route path out.
    pub fn exclude_path(mut self, path: impl Into<String>) -> Self {
        self.excluded_paths.push(path.into());
        self
    }

    pub fn set_status(mut self, status: StatusCode) -> Self {
        self.set_status = Some(status);
        self
    }

    pub fn set_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.set_content_type = Some(content_type.into());
        self
    }

    pub fn set_version(mut self, version: Version) -> Self {
        self.set_version = Some(version);
        self
    }

    /// Merge a response header into handled routes.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Append a cookie to handled routes.
    pub fn cookie(mut self, cookie: Cookie) -> Self {
        self.cookies.push(cookie);
        self
    }

    /// Whether this middleware handles the route being registered.
    pub fn handles(&self, path: &str, defaults: &RouteDefaults) -> bool {
        if self.excluded_paths.iter().any(|p| p == path) {
            return false;
        }
        if let Some(methods) = &self.methods {
            if !methods.contains(&defaults.method) {
                return false;
            }
        }
        if let Some(versions) = &self.versions {
            if !versions.contains(&defaults.version) {
                return false;
            }
        }
        if let Some(types) = &self.content_types {
            match &defaults.content_type {
                Some(declared) if types.iter().any(|t| t == declared) => {}
                _ => return false,
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&defaults.status.as_u16()) {
                return false;
            }
        }
        true
    }

    /// Edit the compiled defaults. Later middleware overrides earlier.
    pub fn apply(&self, defaults: &mut RouteDefaults) {
        if let Some(status) = self.set_status {
            defaults.status = status;
        }
        if let Some(content_type) = &self.set_content_type {
            defaults.content_type = Some(content_type.clone());
        }
        if let Some(version) = self.set_version {
            defaults.version = version;
        }
        for (name, value) in &self.headers {
            defaults.merge_header(name, value);
        }
        defaults.cookies.extend(self.cookies.iter().cloned());
    }
}

/// Ordered static middleware chain, applied at registration time.
#[derive(Clone, Default)]
pub struct StaticChain {
    steps: Vec<StaticMiddleware>,
}

impl StaticChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, step: StaticMiddleware) {
        self.steps.push(step);
    }

    /// Apply every handling step, in registration order.
    pub fn apply(&self, path: &str, defaults: &mut RouteDefaults) {
        for step in &self.steps {
            if step.handles(path, defaults) {
                step.apply(defaults);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Method;

    fn defaults(method: Method, content_type: Option<&str>) -> RouteDefaults {
        RouteDefaults {
            method,
            version: Version::Http11,
            status: StatusCode::OK,
            content_type: content_type.map(str::to_string),
            headers: Vec::new(),
            cookies: Vec::new(),
        }
    }

    #[test]
    fn test_static_middleware_applies_edits() {
        let mw = StaticMiddleware::new()
            .header("x-frame-options", "DENY")
            .cookie(Cookie::new("seen", "1"));

        let mut d = defaults(Method::Get, Some("text/html"));
        assert!(mw.handles("/page", &d));
        mw.apply(&mut d);
        assert_eq!(d.headers, vec![("x-frame-options".to_string(), "DENY".to_string())]);
        assert_eq!(d.cookies.len(), 1);
    }

    #[test]
    fn test_static_middleware_method_criterion() {
        let mw = StaticMiddleware::new()
            .handles_methods(vec![Method::Post])
            .set_status(StatusCode::CREATED);

        let d = defaults(Method::Get, None);
        assert!(!mw.handles("/items", &d));
        let d = defaults(Method::Post, None);
        assert!(mw.handles("/items", &d));
    }

    #[test]
    fn test_static_middleware_version_criterion() {
        let mw = StaticMiddleware::new()
            .handles_versions(vec![Version::Http10])
            .set_version(Version::Http11);

        let d = defaults(Method::Get, None);
        assert!(!mw.handles("/", &d));

        let mut d = defaults(Method::Get, None);
        d.version = Version::Http10;
        assert!(mw.handles("/", &d));
        mw.apply(&mut d);
        assert_eq!(d.version, Version::Http11);
    }

    #[test]
    fn test_static_middleware_excluded_path() {
        let mw = StaticMiddleware::new().exclude_path("/health").header("x-a", "1");
        let d = defaults(Method::Get, None);
        assert!(!mw.handles("/health", &d));
        assert!(mw.handles("/other", &d));
    }

    #[test]
    fn test_static_middleware_content_type_criterion() {
        let mw = StaticMiddleware::new()
            .handles_content_types(vec!["application/json".to_string()]);
        assert!(!mw.handles("/", &defaults(Method::Get, None)));
        assert!(!mw.handles("/", &defaults(Method::Get, Some("text/plain"))));
        assert!(mw.handles("/", &defaults(Method::Get, Some("application/json"))));
    }

    #[test]
    fn test_static_chain_later_overrides_earlier() {
        let mut chain = StaticChain::new();
        chain.add(StaticMiddleware::new().header("x-served-by", "alpha"));
        chain.add(StaticMiddleware::new().header("x-served-by", "beta"));

        let mut d = defaults(Method::Get, None);
        chain.apply("/", &mut d);
        assert_eq!(d.headers, vec![("x-served-by".to_string(), "beta".to_string())]);
    }

    struct Gate {
        allow: bool,
    }

    impl DynamicMiddleware for Gate {
        fn handle<'a>(
            &'a self,
            _req: &'a mut Request,
            res: &'a mut Response,
        ) -> BoxFlowFuture<'a> {
            Box::pin(async move {
                if self.allow {
                    Ok(Flow::Continue)
                } else {
                    res.status = StatusCode::TOO_MANY_REQUESTS;
                    Ok(Flow::Stop)
                }
            })
        }
    }

    struct Tag;

    impl DynamicMiddleware for Tag {
        fn handle<'a>(
            &'a self,
            _req: &'a mut Request,
            res: &'a mut Response,
        ) -> BoxFlowFuture<'a> {
            Box::pin(async move {
                res.headers.push(("x-tagged".to_string(), "yes".to_string()));
                Ok(Flow::Continue)
            })
        }
    }

    #[tokio::test]
    async fn test_dynamic_chain_runs_in_order() {
        let mut chain = DynamicChain::new();
        chain.add(Gate { allow: true });
        chain.add(Tag);

        let mut req = crate::request::RequestBuilder::new(Method::Get, "/").build();
        let mut res = Response::ok();
        assert_eq!(chain.run(&mut req, &mut res).await.unwrap(), Flow::Continue);
        assert_eq!(res.header("x-tagged"), Some("yes"));
    }

    #[tokio::test]
    async fn test_dynamic_chain_short_circuits() {
        let mut chain = DynamicChain::new();
        chain.add(Gate { allow: false });
        chain.add(Tag);

        let mut req = crate::request::RequestBuilder::new(Method::Get, "/").build();
        let mut res = Response::ok();
        assert_eq!(chain.run(&mut req, &mut res).await.unwrap(), Flow::Stop);
        // The chain halted before the tagging step.
        assert_eq!(res.header("x-tagged"), None);
        assert_eq!(res.status, StatusCode::TOO_MANY_REQUESTS);
    }
}

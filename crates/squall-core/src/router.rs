//! Router façade: responder storage, middleware pipeline, and fallbacks.
//!
//! Registration applies static middleware and pre-renders static payloads;
//! dispatch resolves a responder through the three-tier table and falls back
//! to the configured not-found responder (or a hard-coded 404). The fixed
//! variant is built before traffic and reads without locking; the shared
//! variant supports post-boot registration bursts behind a lock.

use crate::middleware::{DynamicChain, DynamicMiddleware, Flow, StaticChain, StaticMiddleware};
use crate::parser::{Method, Version};
use crate::request::Request;
use crate::responder::{
    BoxResponseFuture, DateCache, DynamicHandler, ErrorHandler, Responder, StaticPayload,
};
use crate::response::{Response, StatusCode};
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use squall_router::{Route, RouteTable};
use std::future::Future;
use std::sync::Arc;

/// Declared metadata for a route being registered.
#[derive(Debug, Clone)]
pub struct RouteSpec {
    pub method: Method,
    pub path: String,
    pub version: Version,
    pub status: StatusCode,
    pub content_type: Option<String>,
    /// Emit a live `date` header on responses for this route.
    pub date_header: bool,
    /// Replace an existing registration instead of rejecting it.
    pub override_existing: bool,
}

impl RouteSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            version: Version::Http11,
            status: StatusCode::OK,
            content_type: None,
            date_header: true,
            override_existing: false,
        }
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn without_date(mut self) -> Self {
        self.date_header = false;
        self
    }

    pub fn overriding(mut self) -> Self {
        self.override_existing = true;
        self
    }
}

/// A route's compiled default response metadata. Static middleware edits
/// this at registration time; it is immutable afterwards.
#[derive(Debug, Clone)]
pub struct RouteDefaults {
    pub method: Method,
    pub version: Version,
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<crate::middleware::Cookie>,
}

impl RouteDefaults {
    fn from_spec(spec: &RouteSpec) -> Self {
        Self {
            method: spec.method,
            version: spec.version,
            status: spec.status,
            content_type: spec.content_type.clone(),
            headers: Vec::new(),
            cookies: Vec::new(),
        }
    }

    /// Merge one header; a later value replaces an earlier one of the same
    /// name.
    pub fn merge_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(slot) => slot.1 = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }
}

/// A stored responder plus the defaults its responses start from. Cloning
/// is cheap: payloads and handlers are refcounted.
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    pub responder: Responder,
    pub defaults: RouteDefaults,
    pub date_header: bool,
}

enum Routes {
    /// Built once before traffic, read without locking.
    Fixed(RouteTable<CompiledRoute>),
    /// Post-boot registration variant; writes take the lock.
    Shared(Arc<RwLock<RouteTable<CompiledRoute>>>),
}

/// Outcome of one dynamic request cycle.
pub(crate) struct RespondOutcome {
    pub bytes: Option<Bytes>,
    pub close: bool,
}

/// Top-level façade tying responder storage, middleware, and fallback
/// responders together.
pub struct Router {
    routes: Routes,
    static_chain: StaticChain,
    dynamic_chain: DynamicChain,
    not_found: CompiledRoute,
    error_handler: ErrorHandler,
}

impl Router {
    /// Router with fixed storage: registration completes before traffic and
    /// dispatch never locks.
    pub fn new() -> Self {
        Self::with_table(RouteTable::new())
    }

    /// Router over an already-built table (the registration burst may have
    /// happened elsewhere, e.g. a build-time table producer).
    pub fn with_table(table: RouteTable<CompiledRoute>) -> Self {
        Self {
            routes: Routes::Fixed(table),
            static_chain: StaticChain::new(),
            dynamic_chain: DynamicChain::new(),
            not_found: default_not_found(),
            error_handler: default_error_handler(),
        }
    }

    /// Router whose storage accepts post-boot registration through
    /// [`Router::shared`]. Writers serialize on the lock.
    pub fn with_shared_routes() -> Self {
        Self {
            routes: Routes::Shared(Arc::new(RwLock::new(RouteTable::new()))),
            static_chain: StaticChain::new(),
            dynamic_chain: DynamicChain::new(),
            not_found: default_not_found(),
            error_handler: default_error_handler(),
        }
    }

    /// Add static middleware. Applies to routes registered afterwards.
    pub fn static_middleware(&mut self, middleware: StaticMiddleware) {
        self.static_chain.add(middleware);
    }

    /// Add dynamic middleware to the per-request chain.
    pub fn dynamic_middleware<M: DynamicMiddleware + 'static>(&mut self, middleware: M) {
        self.dynamic_chain.add(middleware);
    }

    /// Register a static route: the full response is rendered now.
    pub fn register_static(&mut self, spec: RouteSpec, body: impl Into<Bytes>) -> Result<()> {
        let compiled = compile_static_route(&self.static_chain, &spec, body.into());
        self.insert(spec, compiled)
    }

    /// Register fixed wire bytes, written verbatim on match.
    pub fn register_literal(
        &mut self,
        method: Method,
        path: &str,
        response: &'static [u8],
    ) -> Result<()> {
        let spec = RouteSpec::new(method, path).without_date();
        let defaults = RouteDefaults::from_spec(&spec);
        let compiled = CompiledRoute {
            responder: Responder::Static(StaticPayload::Literal(response)),
            defaults,
            date_header: false,
        };
        self.insert(spec, compiled)
    }

    /// Register a dynamic route from an async closure.
    pub fn register_dynamic<F, Fut>(&mut self, spec: RouteSpec, handler: F) -> Result<()>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        self.register_handler(spec, into_handler(handler))
    }

    /// Register a dynamic route from an already-boxed handler.
    pub fn register_handler(&mut self, spec: RouteSpec, handler: DynamicHandler) -> Result<()> {
        let compiled = compile_dynamic_route(&self.static_chain, &spec, handler);
        self.insert(spec, compiled)
    }

    fn insert(&mut self, spec: RouteSpec, compiled: CompiledRoute) -> Result<()> {
        let route = Route::parse(spec.method.as_str(), &spec.path);
        match &mut self.routes {
            Routes::Fixed(table) => table.insert(route, compiled, spec.override_existing)?,
            Routes::Shared(table) => {
                table.write().insert(route, compiled, spec.override_existing)?
            }
        }
        Ok(())
    }

    /// Configure the not-found responder with a static body.
    pub fn not_found_static(&mut self, spec: RouteSpec, body: impl Into<Bytes>) {
        self.not_found = compile_static_route(&self.static_chain, &spec, body.into());
    }

    /// Configure a dynamic not-found responder.
    pub fn not_found_dynamic<F, Fut>(&mut self, spec: RouteSpec, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        self.not_found = compile_dynamic_route(&self.static_chain, &spec, into_handler(handler));
    }

    /// Replace the error responder.
    pub fn on_error(&mut self, handler: ErrorHandler) {
        self.error_handler = handler;
    }

    /// Post-boot registration handle; `None` for the fixed variant.
    pub fn shared(&self) -> Option<SharedRoutes> {
        match &self.routes {
            Routes::Fixed(_) => None,
            Routes::Shared(table) => Some(SharedRoutes {
                table: table.clone(),
                static_chain: self.static_chain.clone(),
            }),
        }
    }

    /// True when requests cannot take the inline static path.
    pub fn has_dynamic_work(&self) -> bool {
        !self.dynamic_chain.is_empty()
    }

    /// Resolve a responder for the dispatch key, cloning the compiled route
    /// out of storage.
    pub fn resolve(&self, method: &str, path: &str) -> Option<(CompiledRoute, Vec<(String, String)>)> {
        match &self.routes {
            Routes::Fixed(table) => table
                .find(method, path)
                .map(|m| (m.value.clone(), m.params)),
            Routes::Shared(table) => {
                let table = table.read();
                table.find(method, path).map(|m| (m.value.clone(), m.params))
            }
        }
    }

    /// Resolve with the not-found fallback.
    pub fn resolve_or_not_found(
        &self,
        method: &str,
        path: &str,
    ) -> (CompiledRoute, Vec<(String, String)>) {
        self.resolve(method, path)
            .unwrap_or_else(|| (self.not_found.clone(), Vec::new()))
    }

    /// Drive one request through dynamic middleware and the responder on
    /// the scheduler, returning rendered wire bytes. Errors route to the
    /// error responder, which runs to completion; its own failure
    /// force-closes the connection without a response.
    pub(crate) async fn respond(
        &self,
        route: CompiledRoute,
        mut req: Request,
        date: DateCache,
    ) -> RespondOutcome {
        let mut res = seed_response(&route.defaults);
        let outcome = match self.dynamic_chain.run(&mut req, &mut res).await {
            Err(err) => Err(err),
            Ok(Flow::Stop) => Ok(finish(res, &route, &date)),
            Ok(Flow::Continue) => match &route.responder {
                Responder::Static(payload) => Ok(payload.render(&date.now())),
                Responder::Dynamic(handler) => match handler(req).await {
                    Ok(mut out) => {
                        merge_seeded(&res, &mut out);
                        Ok(finish(out, &route, &date))
                    }
                    Err(err) => Err(err),
                },
            },
        };
        match outcome {
            Ok(bytes) => RespondOutcome {
                bytes: Some(bytes),
                close: false,
            },
            Err(err) => {
                log::warn!("request failed: {}", err);
                match (self.error_handler)(&err).await {
                    Ok(res) => RespondOutcome {
                        bytes: Some(finish(res, &route, &date)),
                        close: true,
                    },
                    Err(inner) => {
                        log::error!("error responder failed: {}", inner);
                        RespondOutcome {
                            bytes: None,
                            close: true,
                        }
                    }
                }
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for post-boot registration into a router built with
/// [`Router::with_shared_routes`]. Mutation is serialized by the lock; the
/// design expects single-writer registration bursts.
#[derive(Clone)]
pub struct SharedRoutes {
    table: Arc<RwLock<RouteTable<CompiledRoute>>>,
    static_chain: StaticChain,
}

impl SharedRoutes {
    pub fn register_static(&self, spec: RouteSpec, body: impl Into<Bytes>) -> Result<()> {
        let compiled = compile_static_route(&self.static_chain, &spec, body.into());
        self.insert(spec, compiled)
    }

    pub fn register_dynamic<F, Fut>(&self, spec: RouteSpec, handler: F) -> Result<()>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        let compiled = compile_dynamic_route(&self.static_chain, &spec, into_handler(handler));
        self.insert(spec, compiled)
    }

    fn insert(&self, spec: RouteSpec, compiled: CompiledRoute) -> Result<()> {
        let route = Route::parse(spec.method.as_str(), &spec.path);
        self.table
            .write()
            .insert(route, compiled, spec.override_existing)?;
        Ok(())
    }
}

fn into_handler<F, Fut>(handler: F) -> DynamicHandler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    Arc::new(move |req| Box::pin(handler(req)) as BoxResponseFuture)
}

fn compile_static_route(chain: &StaticChain, spec: &RouteSpec, body: Bytes) -> CompiledRoute {
    let mut defaults = RouteDefaults::from_spec(spec);
    chain.apply(&spec.path, &mut defaults);
    let payload = compile_static_payload(&defaults, &body, spec.date_header);
    CompiledRoute {
        responder: Responder::Static(payload),
        defaults,
        date_header: spec.date_header,
    }
}

fn compile_dynamic_route(
    chain: &StaticChain,
    spec: &RouteSpec,
    handler: DynamicHandler,
) -> CompiledRoute {
    let mut defaults = RouteDefaults::from_spec(spec);
    chain.apply(&spec.path, &mut defaults);
    CompiledRoute {
        responder: Responder::Dynamic(handler),
        defaults,
        date_header: spec.date_header,
    }
}

/// Render a static route's wire bytes. With a date header the payload keeps
/// the constant parts pre-rendered around the live date slot.
fn compile_static_payload(defaults: &RouteDefaults, body: &[u8], date_header: bool) -> StaticPayload {
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(b"HTTP/1.1 ");
    head.extend_from_slice(defaults.status.as_u16().to_string().as_bytes());
    head.push(b' ');
    head.extend_from_slice(defaults.status.reason_phrase().as_bytes());
    head.extend_from_slice(b"\r\nserver: squall\r\n");
    if let Some(content_type) = &defaults.content_type {
        head.extend_from_slice(b"content-type: ");
        head.extend_from_slice(content_type.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    for (name, value) in &defaults.headers {
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    for cookie in &defaults.cookies {
        head.extend_from_slice(b"set-cookie: ");
        head.extend_from_slice(cookie.to_header_value().as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"content-length: ");
    head.extend_from_slice(body.len().to_string().as_bytes());
    head.extend_from_slice(b"\r\n");
    if date_header {
        head.extend_from_slice(b"date: ");
        let mut suffix = Vec::with_capacity(4 + body.len());
        suffix.extend_from_slice(b"\r\n\r\n");
        suffix.extend_from_slice(body);
        StaticPayload::Dated {
            prefix: Bytes::from(head),
            suffix: Bytes::from(suffix),
        }
    } else {
        head.extend_from_slice(b"\r\n");
        head.extend_from_slice(body);
        StaticPayload::Buffer(Bytes::from(head))
    }
}

fn default_not_found() -> CompiledRoute {
    let spec = RouteSpec::new(Method::Get, "/")
        .status(StatusCode::NOT_FOUND)
        .content_type("text/plain");
    let defaults = RouteDefaults::from_spec(&spec);
    let payload = compile_static_payload(&defaults, b"Not Found", true);
    CompiledRoute {
        responder: Responder::Static(payload),
        defaults,
        date_header: true,
    }
}

fn default_error_handler() -> ErrorHandler {
    Arc::new(|_err: &Error| {
        Box::pin(async { Ok(Response::internal_error("Internal Server Error")) })
            as BoxResponseFuture
    })
}

fn seed_response(defaults: &RouteDefaults) -> Response {
    let mut res = Response::new(defaults.status);
    if let Some(content_type) = &defaults.content_type {
        res.headers
            .push(("content-type".to_string(), content_type.clone()));
    }
    for (name, value) in &defaults.headers {
        res.headers.push((name.clone(), value.clone()));
    }
    for cookie in &defaults.cookies {
        res.headers
            .push(("set-cookie".to_string(), cookie.to_header_value()));
    }
    res
}

/// Headers the chain added to the seeded response survive into the
/// handler's response when absent there.
fn merge_seeded(seeded: &Response, out: &mut Response) {
    for (name, value) in &seeded.headers {
        if !out.has_header(name) {
            out.headers.push((name.clone(), value.clone()));
        }
    }
}

fn finish(mut res: Response, route: &CompiledRoute, date: &DateCache) -> Bytes {
    if route.date_header && !res.has_header("date") {
        res.headers.push(("date".to_string(), date.now_string()));
    }
    res.to_http1_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{BoxFlowFuture, Cookie};
    use crate::request::RequestBuilder;
    use std::collections::HashMap;

    fn wire(payload: &StaticPayload, date: &DateCache) -> String {
        String::from_utf8(payload.render(&date.now()).to_vec()).unwrap()
    }

    #[test]
    fn test_register_static_compiles_payload() {
        let mut router = Router::new();
        router
            .register_static(
                RouteSpec::new(Method::Get, "/health").content_type("text/plain"),
                "OK",
            )
            .unwrap();

        let (route, params) = router.resolve("GET", "/health").unwrap();
        assert!(params.is_empty());
        let Responder::Static(payload) = &route.responder else {
            panic!("expected static responder");
        };
        let rendered = wire(payload, &DateCache::new());
        assert!(rendered.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(rendered.contains("content-type: text/plain\r\n"));
        assert!(rendered.contains("content-length: 2\r\n"));
        assert!(rendered.contains("date: "));
        assert!(rendered.ends_with("\r\n\r\nOK"));
    }

    #[test]
    fn test_static_middleware_shapes_payload() {
        let mut router = Router::new();
        router.static_middleware(
            StaticMiddleware::new()
                .header("x-frame-options", "DENY")
                .cookie(Cookie::new("seen", "1")),
        );
        router
            .register_static(RouteSpec::new(Method::Get, "/page").content_type("text/html"), "<p>hi</p>")
            .unwrap();

        let (route, _) = router.resolve("GET", "/page").unwrap();
        let Responder::Static(payload) = &route.responder else {
            panic!("expected static responder");
        };
        let rendered = wire(payload, &DateCache::new());
        assert!(rendered.contains("x-frame-options: DENY\r\n"));
        assert!(rendered.contains("set-cookie: seen=1\r\n"));
    }

    #[test]
    fn test_register_literal_writes_verbatim() {
        let mut router = Router::new();
        router
            .register_literal(
                Method::Get,
                "/ping",
                b"HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n",
            )
            .unwrap();

        let (route, _) = router.resolve("GET", "/ping").unwrap();
        let Responder::Static(StaticPayload::Literal(bytes)) = &route.responder else {
            panic!("expected literal responder");
        };
        assert!(bytes.starts_with(b"HTTP/1.1 204"));
    }

    #[test]
    fn test_duplicate_registration_is_error() {
        let mut router = Router::new();
        router
            .register_static(RouteSpec::new(Method::Get, "/a"), "1")
            .unwrap();
        let err = router
            .register_static(RouteSpec::new(Method::Get, "/a"), "2")
            .unwrap_err();
        assert!(matches!(err, Error::Registration(_)));

        // Overriding replaces instead.
        router
            .register_static(RouteSpec::new(Method::Get, "/a").overriding(), "3")
            .unwrap();
    }

    #[test]
    fn test_not_found_fallback() {
        let mut router = Router::new();
        router.not_found_static(
            RouteSpec::new(Method::Get, "/")
                .status(StatusCode::NOT_FOUND)
                .content_type("text/plain"),
            "gone missing",
        );

        let (route, params) = router.resolve_or_not_found("GET", "/nope");
        assert!(params.is_empty());
        let Responder::Static(payload) = &route.responder else {
            panic!("expected static responder");
        };
        let rendered = wire(payload, &DateCache::new());
        assert!(rendered.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(rendered.ends_with("gone missing"));
    }

    #[test]
    fn test_shared_routes_post_boot_registration() {
        let router = Router::with_shared_routes();
        assert!(router.resolve("GET", "/late").is_none());

        let shared = router.shared().unwrap();
        shared
            .register_static(RouteSpec::new(Method::Get, "/late"), "here")
            .unwrap();
        assert!(router.resolve("GET", "/late").is_some());

        // Duplicate keys still error through the shared handle.
        assert!(shared
            .register_static(RouteSpec::new(Method::Get, "/late"), "again")
            .is_err());
    }

    #[tokio::test]
    async fn test_respond_dynamic_extracts_param() {
        let mut router = Router::new();
        router
            .register_dynamic(
                RouteSpec::new(Method::Get, "/users/{id}").content_type("text/plain"),
                |req: Request| async move {
                    let id = req.param("id").unwrap_or_default().to_string();
                    Ok(Response::text(id))
                },
            )
            .unwrap();

        let (route, params) = router.resolve("GET", "/users/42").unwrap();
        assert_eq!(params, vec![("id".to_string(), "42".to_string())]);

        let req = RequestBuilder::new(Method::Get, "/users/42")
            .params(params.into_iter().collect::<HashMap<_, _>>())
            .build();
        let outcome = router.respond(route, req, DateCache::new()).await;
        assert!(!outcome.close);
        let rendered = String::from_utf8(outcome.bytes.unwrap().to_vec()).unwrap();
        assert!(rendered.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(rendered.ends_with("\r\n\r\n42"));
    }

    struct Deny;

    impl DynamicMiddleware for Deny {
        fn handle<'a>(
            &'a self,
            _req: &'a mut Request,
            res: &'a mut Response,
        ) -> BoxFlowFuture<'a> {
            Box::pin(async move {
                res.status = StatusCode::FORBIDDEN;
                res.body = bytes::Bytes::from_static(b"denied");
                Ok(Flow::Stop)
            })
        }
    }

    #[tokio::test]
    async fn test_respond_short_circuit_writes_in_flight_response() {
        let mut router = Router::new();
        router.dynamic_middleware(Deny);
        router
            .register_dynamic(RouteSpec::new(Method::Get, "/secret"), |_req| async {
                Ok(Response::text("never"))
            })
            .unwrap();

        let (route, _) = router.resolve("GET", "/secret").unwrap();
        let req = RequestBuilder::new(Method::Get, "/secret").build();
        let outcome = router.respond(route, req, DateCache::new()).await;
        assert!(!outcome.close);
        let rendered = String::from_utf8(outcome.bytes.unwrap().to_vec()).unwrap();
        assert!(rendered.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(rendered.ends_with("denied"));
    }

    #[tokio::test]
    async fn test_respond_routes_errors_to_error_responder() {
        let mut router = Router::new();
        router
            .register_dynamic(RouteSpec::new(Method::Get, "/boom"), |_req| async {
                Err(Error::Responder("exploded".to_string()))
            })
            .unwrap();

        let (route, _) = router.resolve("GET", "/boom").unwrap();
        let req = RequestBuilder::new(Method::Get, "/boom").build();
        let outcome = router.respond(route, req, DateCache::new()).await;
        // Responder failure: best-effort error page plus connection close.
        assert!(outcome.close);
        let rendered = String::from_utf8(outcome.bytes.unwrap().to_vec()).unwrap();
        assert!(rendered.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    }

    #[tokio::test]
    async fn test_respond_seeds_defaults_into_dynamic_response() {
        let mut router = Router::new();
        router.static_middleware(StaticMiddleware::new().header("x-served-by", "squall"));
        router
            .register_dynamic(RouteSpec::new(Method::Get, "/tagged"), |_req| async {
                Ok(Response::text("body"))
            })
            .unwrap();

        let (route, _) = router.resolve("GET", "/tagged").unwrap();
        let req = RequestBuilder::new(Method::Get, "/tagged").build();
        let outcome = router.respond(route, req, DateCache::new()).await;
        let rendered = String::from_utf8(outcome.bytes.unwrap().to_vec()).unwrap();
        assert!(rendered.contains("x-served-by: squall\r\n"));
        assert!(rendered.contains("date: "));
    }
}

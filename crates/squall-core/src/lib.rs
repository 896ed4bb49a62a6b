//! squall-core: Embeddable HTTP server core
//!
//! The request-dispatch and connection-I/O engine: per-worker epoll
//! reactors with edge-triggered one-shot notification, the three-tier route
//! dispatch from squall-router, and the buffer/socket primitives that turn
//! responder output into bytes on the wire with minimal copying.
//!
//! ## Shape
//! - `socket` / `poll` / `conn` - non-blocking I/O, the kernel event queue
//!   and wake pipe, per-connection state
//! - `parser` - offset-based HTTP/1.1 request-head parser
//! - `router` / `responder` / `middleware` - dispatch façade, static and
//!   dynamic responders, the two middleware pipelines
//! - `server` - the boot entry point and the per-worker reactor loop

#![warn(clippy::all)]

pub mod conn;
pub mod error;
pub mod middleware;
pub mod parser;
pub mod poll;
pub mod request;
pub mod responder;
pub mod response;
pub mod router;
pub mod server;
pub mod socket;

// Re-exports
pub use error::{Error, Result};
pub use parser::{Method, Version};
pub use request::{Request, RequestBuilder};
pub use response::{Response, ResponseBuilder, StatusCode};

pub use middleware::{
    Cookie, DynamicChain, DynamicMiddleware, Flow, SameSite, StaticChain, StaticMiddleware,
};
pub use responder::{
    BoxResponseFuture, DateCache, DynamicHandler, ErrorHandler, Responder, StaticPayload,
};
pub use router::{CompiledRoute, RouteDefaults, RouteSpec, Router, SharedRoutes};

pub use conn::{ConnSlab, ConnState, Connection};
pub use poll::{Event, Events, Poller, Token, WakePipe, Waker};
pub use socket::{Drained, ReadOutcome, Socket};

pub use server::{create_listener, ConnectionTracker, Server, ServerConfig};

// Dispatch engine re-exports
pub use squall_router::{InsertError, Match, PathComponent, Route, RouteTable};

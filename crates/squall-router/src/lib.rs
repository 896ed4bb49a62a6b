//! squall-router: Zero-dependency three-tier route dispatch engine
//!
//! Single Source of Truth (SSOT) dispatch engine used by squall-core. Routes
//! are partitioned at registration time into three tiers which are tried in
//! order at request time, stopping at the first match:
//!
//! 1. **Parameterless** - exact `METHOD + PATH` key lookup, O(1)
//! 2. **Parameterized** - buckets indexed by segment count, scanned in
//!    registration order; literal segments must match exactly, parameter
//!    segments match anything
//! 3. **Catchall** - routes ending in `**`, scanned in registration order
//!
//! ## Path Syntax
//! - `{name}` - Named parameter (captures one segment)
//! - `**` - Catchall (captures the remaining path, must be last)
//! - `a{name}c` - Composite segment mixing literal text and a parameter
//!
//! ## Tie-break
//! Within a tier, the earlier-registered route wins. Registering a duplicate
//! parameterless key without requesting override is an error, never a silent
//! no-op.
//!
//! ## Example
//! ```
//! use squall_router::{Route, RouteTable};
//!
//! let mut table = RouteTable::new();
//! table.insert(Route::parse("GET", "/users"), 0, false).unwrap();
//! table.insert(Route::parse("GET", "/users/{id}"), 1, false).unwrap();
//! table.insert(Route::parse("GET", "/files/**"), 2, false).unwrap();
//!
//! let m = table.find("GET", "/users/123").unwrap();
//! assert_eq!(*m.value, 1);
//! assert_eq!(m.params, vec![("id".to_string(), "123".to_string())]);
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]

mod component;
mod table;

pub use component::PathComponent;
pub use table::{InsertError, Match, Route, RouteKey, RouteTable, ROUTE_KEY_CAPACITY};

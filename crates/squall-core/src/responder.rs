//! Responders: the units that produce a response for a matched route.
//!
//! Static payloads are fully rendered at registration time; responding is a
//! pure socket write. Dynamic responders run user futures on the scheduler
//! and hand their result back to the owning reactor.

use crate::request::Request;
use crate::response::Response;
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use smallvec::{smallvec, SmallVec};
use std::fmt;
use std::future::Future;
use std::io::IoSlice;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Boxed future returned by dynamic route logic.
pub type BoxResponseFuture = Pin<Box<dyn Future<Output = Result<Response>> + Send>>;

/// Dynamic route logic: user-supplied, may suspend on the scheduler.
pub type DynamicHandler = Arc<dyn Fn(Request) -> BoxResponseFuture + Send + Sync>;

/// Error responder: renders a best-effort error page for a failed request
/// cycle. Runs to completion before the connection closes.
pub type ErrorHandler = Arc<dyn Fn(&Error) -> BoxResponseFuture + Send + Sync>;

/// Pre-rendered payload owned by a static responder.
#[derive(Debug, Clone)]
pub enum StaticPayload {
    /// Fixed wire bytes known at compile time.
    Literal(&'static [u8]),
    /// Pre-rendered owned buffer.
    Buffer(Bytes),
    /// Pre-rendered head and tail around a live `date` header value. The
    /// constant parts are never reformatted; each response is three
    /// vectored segments: prefix, fresh date, suffix (which carries the
    /// body).
    Dated { prefix: Bytes, suffix: Bytes },
}

impl StaticPayload {
    /// Borrow the payload as vectored-write segments.
    pub fn segments<'a>(&'a self, date: &'a [u8]) -> SmallVec<[IoSlice<'a>; 3]> {
        match self {
            StaticPayload::Literal(bytes) => smallvec![IoSlice::new(bytes)],
            StaticPayload::Buffer(bytes) => smallvec![IoSlice::new(bytes)],
            StaticPayload::Dated { prefix, suffix } => smallvec![
                IoSlice::new(prefix),
                IoSlice::new(date),
                IoSlice::new(suffix),
            ],
        }
    }

    /// Render to one owned buffer. Used on the task path, where the reactor
    /// thread is not the writer.
    pub fn render(&self, date: &[u8]) -> Bytes {
        match self {
            StaticPayload::Literal(bytes) => Bytes::from_static(*bytes),
            StaticPayload::Buffer(bytes) => bytes.clone(),
            StaticPayload::Dated { prefix, suffix } => {
                let mut out = Vec::with_capacity(prefix.len() + date.len() + suffix.len());
                out.extend_from_slice(prefix);
                out.extend_from_slice(date);
                out.extend_from_slice(suffix);
                Bytes::from(out)
            }
        }
    }

    /// Total payload length on the wire, date segment included.
    pub fn wire_len(&self, date_len: usize) -> usize {
        match self {
            StaticPayload::Literal(bytes) => bytes.len(),
            StaticPayload::Buffer(bytes) => bytes.len(),
            StaticPayload::Dated { prefix, suffix } => prefix.len() + date_len + suffix.len(),
        }
    }
}

/// The unit that produces a response for a matched route.
#[derive(Clone)]
pub enum Responder {
    /// Output fixed at registration time; responding is a pure write.
    Static(StaticPayload),
    /// Output computed per request by user logic, which may suspend.
    Dynamic(DynamicHandler),
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Responder::Static(payload) => f.debug_tuple("Static").field(payload).finish(),
            Responder::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Length of an IMF-fixdate value, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub const HTTP_DATE_LEN: usize = 29;

/// Shared, staleness-bounded cache of the `date` header value.
///
/// Refreshed lazily on access once the cached value is older than one
/// second. Injected into the responders that need it rather than read from
/// ambient global state.
#[derive(Clone)]
pub struct DateCache {
    inner: Arc<Mutex<DateInner>>,
}

struct DateInner {
    rendered: [u8; HTTP_DATE_LEN],
    refreshed: Instant,
}

impl DateCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(DateInner {
                rendered: format_http_date(SystemTime::now()),
                refreshed: Instant::now(),
            })),
        }
    }

    /// Current `date` header value, at most one second stale.
    pub fn now(&self) -> [u8; HTTP_DATE_LEN] {
        let mut inner = self.inner.lock();
        if inner.refreshed.elapsed() >= Duration::from_secs(1) {
            inner.rendered = format_http_date(SystemTime::now());
            inner.refreshed = Instant::now();
        }
        inner.rendered
    }

    /// Current value as a header string.
    pub fn now_string(&self) -> String {
        String::from_utf8_lossy(&self.now()).into_owned()
    }
}

impl Default for DateCache {
    fn default() -> Self {
        Self::new()
    }
}

const DAYS: [&[u8; 3]; 7] = [b"Sun", b"Mon", b"Tue", b"Wed", b"Thu", b"Fri", b"Sat"];
const MONTHS: [&[u8; 3]; 12] = [
    b"Jan", b"Feb", b"Mar", b"Apr", b"May", b"Jun", b"Jul", b"Aug", b"Sep", b"Oct", b"Nov",
    b"Dec",
];

/// Format a timestamp as IMF-fixdate (no external dependency).
fn format_http_date(time: SystemTime) -> [u8; HTTP_DATE_LEN] {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let days = secs / 86_400;
    let secs_of_day = secs % 86_400;
    // 1970-01-01 was a Thursday.
    let weekday = ((days + 4) % 7) as usize;

    // Era-based civil-from-days conversion.
    let z = days as i64 + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097) as u64;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe as i64 + era * 400 + i64::from(month <= 2);

    let mut out = [0u8; HTTP_DATE_LEN];
    out[..3].copy_from_slice(DAYS[weekday]);
    out[3] = b',';
    out[4] = b' ';
    write_padded(&mut out[5..7], day);
    out[7] = b' ';
    out[8..11].copy_from_slice(MONTHS[month as usize - 1]);
    out[11] = b' ';
    write_padded(&mut out[12..16], year as u64);
    out[16] = b' ';
    write_padded(&mut out[17..19], secs_of_day / 3_600);
    out[19] = b':';
    write_padded(&mut out[20..22], (secs_of_day % 3_600) / 60);
    out[22] = b':';
    write_padded(&mut out[23..25], secs_of_day % 60);
    out[25..].copy_from_slice(b" GMT");
    out
}

/// Zero-padded decimal into a fixed-width slot.
fn write_padded(out: &mut [u8], mut value: u64) {
    for slot in out.iter_mut().rev() {
        *slot = b'0' + (value % 10) as u8;
        value /= 10;
    }
}

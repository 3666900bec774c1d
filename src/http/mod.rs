//! Multi-transfer HTTP driver riding on the event loop.

mod multi;
mod options;

pub use multi::{HttpResponse, MultiDriver, fetch};
pub use options::{ProxyKind, ProxyOptions, RequestOptions};

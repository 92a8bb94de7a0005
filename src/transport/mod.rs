//! HTTP transport to external extraction services.

mod http;

pub use http::{HttpTransport, RawResponse, TransportError};

//! HTTP side of the multiplexed port.

mod handlers;
mod proxy;
mod server;

pub use handlers::{HttpBody, HttpContext, handle};
pub use proxy::{ProxyError, Upstream};
pub use server::HttpServer;

//! An HTTP forward proxy built as a composable filter pipeline. Plain and
//! TLS clients speak HTTP/1.1 plus CONNECT; each request runs through an
//! ordered filter chain before reaching one of two forwarding engines (a
//! persistent HTTP forwarder and a CONNECT tunnel), and anything
//! unauthenticated or malformed is answered byte-for-byte like a stock
//! Apache server.

pub mod config;
pub mod filters;
pub mod http;
pub mod mimic;
pub mod proxy;
pub mod stats;
pub mod transport;

pub use config::{Config, parse_config};
pub use proxy::server::Server;

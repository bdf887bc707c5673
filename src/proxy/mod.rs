// src/proxy/mod.rs
mod backend;
mod forwarder;
mod pool;
mod proxy;

pub use backend::Backend;
pub use forwarder::{rewrite_uri, ClientAddr, Forward, ForwardError, HttpForwarder};
pub use pool::{PoolError, ServerPool};
pub use proxy::{BufferedRequest, Proxy, ProxyError};

// src/health/probe.rs
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use url::Url;

/// TCP reachability probe: alive when a connection opens within `limit`.
pub async fn is_backend_alive(url: &Url, limit: Duration) -> bool {
    let (host, port) = match (url.host_str(), url.port_or_known_default()) {
        (Some(host), Some(port)) => (host.trim_start_matches('[').trim_end_matches(']'), port),
        _ => {
            debug!("Backend {} has no probe address", url);
            return false;
        }
    };

    match timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!("Site unreachable, error: {}", e);
            false
        }
        Err(_) => {
            debug!("Site unreachable, connect timed out after {:?}", limit);
            false
        }
    }
}

// src/proxy/forwarder.rs
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::http::uri::InvalidUri;
use hyper::{Body, Client, Request, Response, Uri, Version};
use hyper_tls::HttpsConnector;
use std::net::SocketAddr;
use url::Url;

/// Client address of the inbound request, stored in request extensions.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("invalid upstream uri: {0}")]
    InvalidUri(#[from] InvalidUri),

    #[error("transport error: {0}")]
    Transport(#[from] hyper::Error),

    #[error("{0}")]
    Other(String),
}

/// Delivers a request to a single upstream target.
#[async_trait]
pub trait Forward: Send + Sync {
    async fn forward(&self, target: &Url, req: Request<Body>) -> Result<Response<Body>, ForwardError>;
}

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Single-host reverse proxy over a pooled hyper client.
#[derive(Clone)]
pub struct HttpForwarder {
    client: Client<HttpsConnector<HttpConnector>, Body>,
}

impl HttpForwarder {
    pub fn new() -> Self {
        let client = Client::builder().build::<_, Body>(HttpsConnector::new());
        Self { client }
    }
}

impl Default for HttpForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Forward for HttpForwarder {
    async fn forward(&self, target: &Url, mut req: Request<Body>) -> Result<Response<Body>, ForwardError> {
        *req.uri_mut() = rewrite_uri(target, req.uri())?;
        *req.version_mut() = Version::HTTP_11;

        strip_hop_by_hop(req.headers_mut());
        if let Some(ClientAddr(addr)) = req.extensions().get::<ClientAddr>().copied() {
            append_forwarded_for(req.headers_mut(), addr);
        }

        let mut response = self.client.request(req).await?;
        strip_hop_by_hop(response.headers_mut());
        Ok(response)
    }
}

/// Moves `uri` onto `target`, joining the paths with exactly one slash.
pub fn rewrite_uri(target: &Url, uri: &Uri) -> Result<Uri, ForwardError> {
    let host = target
        .host_str()
        .ok_or_else(|| ForwardError::Other(format!("{} has no host", target)))?;
    let authority = match target.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let path = join_paths(target.path(), uri.path());
    let query = match (target.query(), uri.query()) {
        (Some(a), Some(b)) if !a.is_empty() => format!("?{}&{}", a, b),
        (Some(a), None) if !a.is_empty() => format!("?{}", a),
        (_, Some(b)) => format!("?{}", b),
        _ => String::new(),
    };

    Ok(format!("{}://{}{}{}", target.scheme(), authority, path, query).parse()?)
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, addr: SocketAddr) {
    let ip = addr.ip().to_string();
    let value = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{}, {}", prior, ip),
        None => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_rewrite_plain_target() {
        let uri: Uri = "/users/7?full=1".parse().unwrap();
        let out = rewrite_uri(&url("http://127.0.0.1:8001"), &uri).unwrap();
        assert_eq!(out.to_string(), "http://127.0.0.1:8001/users/7?full=1");
    }

    #[test]
    fn test_rewrite_joins_target_path_and_query() {
        let uri: Uri = "/users?page=2".parse().unwrap();
        let out = rewrite_uri(&url("https://api.internal/v1/?key=abc"), &uri).unwrap();
        assert_eq!(out.to_string(), "https://api.internal/v1/users?key=abc&page=2");

        let out = rewrite_uri(&url("http://api.internal:9000/v1"), &uri).unwrap();
        assert_eq!(out.to_string(), "http://api.internal:9000/v1/users?page=2");
    }

    #[test]
    fn test_strip_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));
    }

    #[test]
    fn test_forwarded_for_appends() {
        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, "10.0.0.1:5000".parse().unwrap());
        append_forwarded_for(&mut headers, "10.0.0.2:5000".parse().unwrap());
        assert_eq!(headers["x-forwarded-for"], "10.0.0.1, 10.0.0.2");
    }
}

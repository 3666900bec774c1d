use std::time::Duration;

/// Proxy kinds the transfer backend understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Socks4,
    Socks5,
}

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub kind: ProxyKind,
}

/// Per-request options consumed by the multi-driver.
///
/// This is the normalized surface the external request builder feeds into
/// the driver; retry policies, caching and cookies live in that builder, not
/// here.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Whole-transfer deadline.
    pub timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub follow_redirects: bool,
    pub max_redirects: Option<u32>,
    pub verify_ssl: bool,
    pub user_agent: Option<String>,
    pub proxy: Option<ProxyOptions>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            headers: Vec::new(),
            body: None,
            timeout: None,
            connect_timeout: None,
            follow_redirects: true,
            max_redirects: Some(10),
            verify_ssl: true,
            user_agent: None,
            proxy: None,
        }
    }
}

impl RequestOptions {
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

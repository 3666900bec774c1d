use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use curl::easy::{Easy2, Handler, List, ProxyType, WriteError};
use curl::multi::{Easy2Handle, Multi};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::http::options::{ProxyKind, RequestOptions};
use crate::promise::Promise;
use crate::runtime::Handle as LoopHandle;

/// Default cap on concurrent in-flight transfers; requests beyond it queue.
const DEFAULT_MAX_IN_FLIGHT: usize = 32;

/// A completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u32,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Negotiated version from the status line, e.g. `"HTTP/1.1"`.
    pub version: Option<String>,
}

pub(crate) type Completion = Box<dyn FnOnce(Result<HttpResponse>)>;

/// Per-transfer collector for body bytes and raw header lines.
#[derive(Default)]
struct Collector {
    body: Vec<u8>,
    header_lines: Vec<String>,
}

impl Handler for Collector {
    fn write(&mut self, data: &[u8]) -> std::result::Result<usize, WriteError> {
        self.body.extend_from_slice(data);
        Ok(data.len())
    }

    fn header(&mut self, data: &[u8]) -> bool {
        if let Ok(line) = std::str::from_utf8(data) {
            self.header_lines.push(line.trim_end().to_string());
        }
        true
    }
}

struct Slot {
    handle: Easy2Handle<Collector>,
    callback: Completion,
}

/// Drives many concurrent HTTP transfers on one `curl` multi handle.
///
/// `tick` advances active transfers and collects completions; the event loop
/// folds `next_poll_timeout` into its idle sleep so curl's internal timers
/// are honored without blocking.
pub struct MultiDriver {
    multi: Multi,
    slots: HashMap<usize, Slot>,
    backlog: VecDeque<(usize, Easy2<Collector>, Completion)>,
    next_token: usize,
    max_in_flight: usize,
}

impl MultiDriver {
    pub fn new() -> Self {
        Self {
            multi: Multi::new(),
            slots: HashMap::new(),
            backlog: VecDeque::new(),
            next_token: 0,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    pub fn set_max_in_flight(&mut self, max: usize) {
        self.max_in_flight = max.max(1);
    }

    /// Number of transfers not yet completed (active + queued).
    pub fn active(&self) -> usize {
        self.slots.len() + self.backlog.len()
    }

    /// Queue a transfer; the callback fires exactly once, from a later
    /// `tick` (or from `cancel`).
    pub fn add(&mut self, url: &str, options: &RequestOptions, callback: Completion) -> Result<usize> {
        let easy = build_transfer(url, options)?;
        let token = self.next_token;
        self.next_token += 1;

        if self.slots.len() < self.max_in_flight {
            self.attach(token, easy, callback)?;
        } else {
            self.backlog.push_back((token, easy, callback));
        }
        trace!(token, url, "http transfer queued");
        Ok(token)
    }

    /// Cancel a pending or active transfer. The completion callback fires
    /// with [`Error::Cancelled`]. Returns false for unknown tokens.
    pub fn cancel(&mut self, token: usize) -> bool {
        if let Some(position) = self.backlog.iter().position(|(t, _, _)| *t == token) {
            if let Some((_, _, callback)) = self.backlog.remove(position) {
                callback(Err(Error::Cancelled));
            }
            return true;
        }
        let Some(slot) = self.slots.remove(&token) else {
            return false;
        };
        let _ = self.multi.remove2(slot.handle);
        (slot.callback)(Err(Error::Cancelled));
        true
    }

    /// How long the loop may sleep before curl needs attention. `None` when
    /// no transfer is active.
    pub fn next_poll_timeout(&self) -> Option<Duration> {
        if self.slots.is_empty() {
            return None;
        }
        match self.multi.get_timeout() {
            Ok(Some(timeout)) => Some(timeout),
            // curl has no pending timer: poll again within the loop's cap.
            Ok(None) | Err(_) => None,
        }
    }

    /// Advance transfers and detach finished ones. Completions are returned
    /// (not invoked) so the loop can run them outside the driver borrow.
    pub fn tick(&mut self) -> Vec<(Completion, Result<HttpResponse>)> {
        if self.slots.is_empty() {
            return Vec::new();
        }
        if let Err(err) = self.multi.perform() {
            debug!(%err, "curl multi perform failed");
        }

        let mut finished: Vec<(usize, std::result::Result<(), curl::Error>)> = Vec::new();
        self.multi.messages(|message| {
            if let (Ok(token), Some(result)) = (message.token(), message.result()) {
                finished.push((token, result));
            }
        });

        let mut completions = Vec::new();
        for (token, result) in finished {
            let Some(slot) = self.slots.remove(&token) else {
                continue;
            };
            let outcome = match self.multi.remove2(slot.handle) {
                Ok(easy) => finish_transfer(easy, result),
                Err(err) => Err(Error::Http {
                    status: None,
                    message: err.to_string(),
                }),
            };
            completions.push((slot.callback, outcome));
        }

        // Promote queued transfers into freed capacity.
        while self.slots.len() < self.max_in_flight {
            let Some((token, easy, callback)) = self.backlog.pop_front() else {
                break;
            };
            if let Err(err) = self.attach(token, easy, callback) {
                debug!(token, %err, "failed to start queued transfer");
            }
        }
        completions
    }

    fn attach(&mut self, token: usize, easy: Easy2<Collector>, callback: Completion) -> Result<()> {
        let mut handle = self.multi.add2(easy).map_err(|e| Error::Http {
            status: None,
            message: e.to_string(),
        })?;
        handle.set_token(token).map_err(|e| Error::Http {
            status: None,
            message: e.to_string(),
        })?;
        self.slots.insert(token, Slot { handle, callback });
        Ok(())
    }
}

fn build_transfer(url: &str, options: &RequestOptions) -> Result<Easy2<Collector>> {
    let map_err = |e: curl::Error| Error::Http {
        status: None,
        message: e.to_string(),
    };

    let mut easy = Easy2::new(Collector::default());
    easy.url(url).map_err(map_err)?;

    match options.method.to_ascii_uppercase().as_str() {
        "GET" => easy.get(true).map_err(map_err)?,
        "POST" => easy.post(true).map_err(map_err)?,
        "HEAD" => easy.nobody(true).map_err(map_err)?,
        other => easy.custom_request(other).map_err(map_err)?,
    }

    if let Some(body) = &options.body {
        easy.post_fields_copy(body).map_err(map_err)?;
    }

    if !options.headers.is_empty() {
        let mut list = List::new();
        for (name, value) in &options.headers {
            list.append(&format!("{name}: {value}")).map_err(map_err)?;
        }
        easy.http_headers(list).map_err(map_err)?;
    }

    if let Some(timeout) = options.timeout {
        easy.timeout(timeout).map_err(map_err)?;
    }
    if let Some(timeout) = options.connect_timeout {
        easy.connect_timeout(timeout).map_err(map_err)?;
    }
    easy.follow_location(options.follow_redirects).map_err(map_err)?;
    if let Some(max) = options.max_redirects {
        easy.max_redirections(max).map_err(map_err)?;
    }
    easy.ssl_verify_peer(options.verify_ssl).map_err(map_err)?;
    easy.ssl_verify_host(options.verify_ssl).map_err(map_err)?;
    if let Some(agent) = &options.user_agent {
        easy.useragent(agent).map_err(map_err)?;
    }

    if let Some(proxy) = &options.proxy {
        easy.proxy(&proxy.host).map_err(map_err)?;
        easy.proxy_port(proxy.port).map_err(map_err)?;
        easy.proxy_type(match proxy.kind {
            ProxyKind::Http => ProxyType::Http,
            ProxyKind::Socks4 => ProxyType::Socks4,
            ProxyKind::Socks5 => ProxyType::Socks5,
        })
        .map_err(map_err)?;
        if let Some(user) = &proxy.user {
            easy.proxy_username(user).map_err(map_err)?;
        }
        if let Some(pass) = &proxy.pass {
            easy.proxy_password(pass).map_err(map_err)?;
        }
    }

    Ok(easy)
}

fn finish_transfer(
    mut easy: Easy2<Collector>,
    result: std::result::Result<(), curl::Error>,
) -> Result<HttpResponse> {
    if let Err(err) = result {
        if err.is_operation_timedout() {
            return Err(Error::Timeout(Duration::ZERO));
        }
        return Err(Error::Http {
            status: None,
            message: err.to_string(),
        });
    }

    let status = easy.response_code().map_err(|e| Error::Http {
        status: None,
        message: e.to_string(),
    })?;

    let collector = easy.get_mut();
    let (version, headers) = parse_header_lines(&collector.header_lines);
    Ok(HttpResponse {
        status,
        headers,
        body: std::mem::take(&mut collector.body),
        version,
    })
}

/// Keep only the final header block (redirects produce one block per hop);
/// the block's status line yields the HTTP version.
fn parse_header_lines(lines: &[String]) -> (Option<String>, Vec<(String, String)>) {
    let start = lines
        .iter()
        .rposition(|line| line.starts_with("HTTP/"))
        .unwrap_or(0);
    let mut version = None;
    let mut headers = Vec::new();
    for line in &lines[start..] {
        if line.starts_with("HTTP/") {
            version = line.split_whitespace().next().map(ToString::to_string);
        } else if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    (version, headers)
}

/// Start a transfer on `handle`'s loop; the promise settles on completion.
/// Cancelling the promise cancels the transfer.
pub fn fetch(handle: &LoopHandle, url: &str, options: RequestOptions) -> Promise<HttpResponse> {
    let (promise, resolver) = Promise::pending_with(handle);
    let added = handle.with_http(|driver| {
        let resolver = resolver.clone();
        driver.add(url, &options, Box::new(move |outcome| {
            resolver.settle(outcome.map(std::rc::Rc::new));
        }))
    });

    match added {
        Some(Ok(token)) => {
            let handle = handle.clone();
            promise.on_cancel(move || {
                let _ = handle.with_http(|driver| driver.cancel(token));
            });
        }
        Some(Err(err)) => resolver.reject(err),
        None => resolver.reject(Error::Cancelled),
    }
    promise
}

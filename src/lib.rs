pub mod blocklist;
pub mod cache;
pub mod server;
pub mod upstream;

/// Maximum size of a client request and of one streamed response chunk.
pub const BUFSIZE: usize = 4096;

pub const CACHE_DIR: &str = "./cache";
pub const BLOCKLIST_PATH: &str = "./blocklist";

/// Client-facing error statuses. Each one is rendered as a bare status line
/// followed by a blank line, no body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpError {
    BadRequest,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    VersionNotSupported,
}

impl HttpError {
    pub fn code(self) -> u16 {
        match self {
            HttpError::BadRequest => 400,
            HttpError::Forbidden => 403,
            HttpError::NotFound => 404,
            HttpError::MethodNotAllowed => 405,
            HttpError::VersionNotSupported => 505,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            HttpError::BadRequest => "Bad Request",
            HttpError::Forbidden => "Forbidden",
            HttpError::NotFound => "Not Found",
            HttpError::MethodNotAllowed => "Method Not Allowed",
            HttpError::VersionNotSupported => "HTTP Version Not Supported",
        }
    }

    /// Renders the full error response. The version falls back to HTTP/1.1
    /// when the request never parsed far enough to yield one.
    pub fn to_response(self, version: Option<HttpVersion>) -> String {
        format!(
            "{} {} {}\r\n\r\n",
            version.map_or("HTTP/1.1", HttpVersion::as_str),
            self.code(),
            self.reason()
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
        }
    }
}

/// A successfully parsed client request. Headers keep their original order
/// for forwarding upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedRequest {
    pub uri: String,
    pub version: HttpVersion,
    pub headers: Vec<(String, String)>,
}

/// Upstream endpoint derived from an absolute request URI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    pub path: String,
}

pub fn parse_request(data: &[u8]) -> Result<ParsedRequest, HttpError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(data) {
        Ok(httparse::Status::Complete(_)) => {
            match req.method.ok_or(HttpError::BadRequest)? {
                "GET" => {}
                "HEAD" | "POST" | "PUT" => return Err(HttpError::MethodNotAllowed),
                _ => return Err(HttpError::BadRequest),
            }
            let uri = req.path.ok_or(HttpError::BadRequest)?.to_string();
            let version = match req.version {
                Some(0) => HttpVersion::Http10,
                Some(1) => HttpVersion::Http11,
                _ => return Err(HttpError::VersionNotSupported),
            };
            let headers = req
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect();
            Ok(ParsedRequest {
                uri,
                version,
                headers,
            })
        }
        Ok(httparse::Status::Partial) => Err(HttpError::BadRequest),
        // httparse reports a missing version token and an unsupported one the
        // same way; only a request line that names HTTP/x gets a 505.
        Err(httparse::Error::Version) => {
            if request_line_names_version(data) {
                Err(HttpError::VersionNotSupported)
            } else {
                Err(HttpError::BadRequest)
            }
        }
        Err(_) => Err(HttpError::BadRequest),
    }
}

fn request_line_names_version(data: &[u8]) -> bool {
    let line_end = data
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(data.len());
    data[..line_end].windows(6).any(|w| w == b" HTTP/")
}

/// Splits an absolute `http://host[:port]/path` URI into its upstream target.
/// The scheme must be plain http; a missing host maps to 404 like a failed
/// resolution would.
pub fn parse_uri(uri: &str) -> Result<UpstreamTarget, HttpError> {
    let rest = uri.strip_prefix("http://").ok_or(HttpError::BadRequest)?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let (host, port) = match authority.split_once(':') {
        Some((host, "")) => (host, 80),
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| HttpError::NotFound)?),
        None => (authority, 80),
    };
    if host.is_empty() {
        return Err(HttpError::NotFound);
    }
    Ok(UpstreamTarget {
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

/// djb2 over the raw URI bytes. The decimal rendering of this value is the
/// cache filename, so it must stay deterministic across runs.
pub fn cache_key(uri: &str) -> u64 {
    uri.bytes().fold(5381u64, |hash, byte| {
        hash.wrapping_mul(33).wrapping_add(u64::from(byte))
    })
}

/// URIs carrying a query string are treated as dynamic content and bypass
/// the cache entirely.
pub fn is_cacheable(uri: &str) -> bool {
    !uri.contains('?')
}

/// Rewrites a proxy-style request into origin form: `GET <path> <version>`,
/// original headers minus persistent-connection negotiation. A client
/// `Connection: keep-alive` becomes `Connection: close`.
pub fn build_upstream_request(req: &ParsedRequest, target: &UpstreamTarget) -> String {
    let mut out = format!("GET {} {}\r\n", target.path, req.version.as_str());
    for (name, value) in &req.headers {
        let keep_alive = value.trim().eq_ignore_ascii_case("keep-alive");
        if keep_alive && name.eq_ignore_ascii_case("proxy-connection") {
            continue;
        }
        if keep_alive && name.eq_ignore_ascii_case("connection") {
            out.push_str("Connection: close\r\n");
            continue;
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

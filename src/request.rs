use std::fmt;

// the only request headers the proxy itself inspects; everything else rides
// along in the retained raw bytes.
const HOST: &str = "Host";
const USER_AGENT: &str = "User-Agent";
const CONNECTION: &str = "Connection";
const IF_NONE_MATCH: &str = "If-None-Match";
const IF_MODIFIED_SINCE: &str = "If-Modified-Since";

const MAX_HEADERS: usize = 64;

/// Errors encountered when parsing a client request.
#[derive(Debug)]
pub enum Error {
    /// The bytes end before the header section is complete.
    Incomplete,
    /// The request line or a header failed to parse.
    Malformed(httparse::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Incomplete => write!(f, "request ended before headers were complete"),
            Error::Malformed(err) => write!(f, "malformed request: {}", err),
        }
    }
}

/// A parsed client request. Immutable after parse; revalidation layers
/// conditional headers on via [`Request::with_validators`], which produces a
/// derived copy rather than mutating the original.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    /// The request line exactly as the client sent it.
    pub request_line: String,
    /// Request target as received: absolute-form for GET/POST,
    /// authority-form for CONNECT.
    pub target: String,
    pub host: String,
    /// Port string from the Host header (or CONNECT authority); empty means
    /// the scheme default applies.
    pub port: String,
    pub user_agent: String,
    pub connection: String,
    pub if_none_match: String,
    pub if_modified_since: String,
    raw: Vec<u8>,
}

impl Request {
    /// Parses a request from the bytes read off the client socket. The full
    /// byte sequence is retained for verbatim forwarding.
    pub fn parse(raw: &[u8]) -> Result<Request, Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed.parse(raw) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => return Err(Error::Incomplete),
            Err(err) => return Err(Error::Malformed(err)),
        }

        let method = parsed.method.unwrap_or_default().to_string();
        let target = parsed.path.unwrap_or_default().to_string();

        let mut request = Request {
            method,
            request_line: first_line(raw),
            target,
            host: String::new(),
            port: String::new(),
            user_agent: String::new(),
            connection: String::new(),
            if_none_match: String::new(),
            if_modified_since: String::new(),
            raw: raw.to_vec(),
        };

        // header names are matched exactly as received; the proxy only
        // understands the canonical spellings.
        for header in parsed.headers.iter() {
            let value = String::from_utf8_lossy(header.value).trim().to_string();
            match header.name {
                HOST => request.set_host_and_port(&value),
                USER_AGENT => request.user_agent = value,
                CONNECTION => request.connection = value,
                IF_NONE_MATCH => request.if_none_match = value,
                IF_MODIFIED_SINCE => request.if_modified_since = value,
                _ => {}
            }
        }

        // CONNECT clients put the authority in the request target; fall back
        // to it when no Host header was sent.
        if request.host.is_empty() && !request.target.is_empty() && !request.target.contains('/') {
            let target = request.target.clone();
            request.set_host_and_port(&target);
        }

        Ok(request)
    }

    fn set_host_and_port(&mut self, value: &str) {
        match value.split_once(':') {
            Some((host, port)) => {
                self.host = host.to_string();
                self.port = port.to_string();
            }
            None => self.host = value.to_string(),
        }
    }

    /// Canonical re-emission: `METHOD target HTTP/1.1` followed by the fixed
    /// header set in order, each only when non-empty. The port rides on the
    /// Host header unless it is the default 80.
    pub fn emit(&self) -> String {
        let mut out = format!("{} {} HTTP/1.1\r\n", self.method, self.target);

        if !self.host.is_empty() {
            out.push_str(HOST);
            out.push_str(": ");
            out.push_str(&self.host);
            if !self.port.is_empty() && self.port != "80" {
                out.push(':');
                out.push_str(&self.port);
            }
            out.push_str("\r\n");
        }
        for (name, value) in [
            (USER_AGENT, &self.user_agent),
            (CONNECTION, &self.connection),
            (IF_NONE_MATCH, &self.if_none_match),
            (IF_MODIFIED_SINCE, &self.if_modified_since),
        ] {
            if !value.is_empty() {
                out.push_str(name);
                out.push_str(": ");
                out.push_str(value);
                out.push_str("\r\n");
            }
        }

        out.push_str("\r\n");
        out
    }

    /// Derived copy carrying the cached entry's validators for a conditional
    /// fetch. Empty validator strings leave the corresponding header unset.
    pub fn with_validators(&self, etag: &str, last_modified: &str) -> Request {
        let mut derived = self.clone();
        if !etag.is_empty() {
            derived.if_none_match = etag.to_string();
        }
        if !last_modified.is_empty() {
            derived.if_modified_since = last_modified.to_string();
        }
        derived
    }

    /// The request bytes exactly as received from the client.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Numeric origin port, falling back to `default` when the client named
    /// none or named one that does not parse.
    pub fn origin_port(&self, default: u16) -> u16 {
        if self.port.is_empty() {
            return default;
        }
        self.port.parse().unwrap_or(default)
    }
}

fn first_line(raw: &[u8]) -> String {
    let line = raw.split(|&b| b == b'\n').next().unwrap_or(&[]);
    String::from_utf8_lossy(line).trim_end_matches('\r').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const GET_REQUEST: &[u8] = b"GET http://httpbin.org/forms/post HTTP/1.1\r\n\
        Host: httpbin.org\r\n\
        User-Agent: curl/8.5.0\r\n\
        Accept: */*\r\n\r\n";

    #[test]
    fn parses_absolute_form_get() {
        let request = Request::parse(GET_REQUEST).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.target, "http://httpbin.org/forms/post");
        assert_eq!(request.host, "httpbin.org");
        assert_eq!(request.port, "");
        assert_eq!(request.user_agent, "curl/8.5.0");
        assert_eq!(
            request.request_line,
            "GET http://httpbin.org/forms/post HTTP/1.1"
        );
        assert_eq!(request.origin_port(80), 80);
    }

    #[test]
    fn parses_host_header_with_port() {
        let raw = b"GET http://example.com:8080/a HTTP/1.1\r\nHost: example.com:8080\r\n\r\n";
        let request = Request::parse(raw).unwrap();
        assert_eq!(request.host, "example.com");
        assert_eq!(request.port, "8080");
        assert_eq!(request.origin_port(80), 8080);
    }

    #[test]
    fn connect_falls_back_to_authority_target() {
        let raw = b"CONNECT www.example.com:443 HTTP/1.1\r\n\r\n";
        let request = Request::parse(raw).unwrap();
        assert_eq!(request.method, "CONNECT");
        assert_eq!(request.host, "www.example.com");
        assert_eq!(request.port, "443");
        assert_eq!(request.origin_port(443), 443);
    }

    #[test]
    fn emit_uses_canonical_order_and_omits_default_port() {
        let raw = b"GET http://example.com/x HTTP/1.1\r\n\
            Connection: close\r\n\
            Host: example.com:80\r\n\
            User-Agent: test-agent\r\n\r\n";
        let request = Request::parse(raw).unwrap();
        assert_eq!(
            request.emit(),
            "GET http://example.com/x HTTP/1.1\r\n\
             Host: example.com\r\n\
             User-Agent: test-agent\r\n\
             Connection: close\r\n\r\n"
        );
    }

    #[test]
    fn emit_keeps_explicit_port() {
        let raw = b"GET http://example.com:8080/x HTTP/1.1\r\nHost: example.com:8080\r\n\r\n";
        let request = Request::parse(raw).unwrap();
        assert!(request.emit().contains("Host: example.com:8080\r\n"));
    }

    #[test]
    fn validators_layer_onto_a_derived_copy() {
        let request = Request::parse(GET_REQUEST).unwrap();
        let derived = request.with_validators("\"abc123\"", "Tue, 01 Apr 2025 10:00:00 GMT");

        assert_eq!(request.if_none_match, "");
        assert_eq!(derived.if_none_match, "\"abc123\"");
        let emitted = derived.emit();
        assert!(emitted.contains("If-None-Match: \"abc123\"\r\n"));
        assert!(emitted.contains("If-Modified-Since: Tue, 01 Apr 2025 10:00:00 GMT\r\n"));
    }

    #[test]
    fn raw_bytes_are_retained_verbatim() {
        let raw = b"POST http://example.com/submit HTTP/1.1\r\n\
            Host: example.com\r\n\
            Content-Length: 9\r\n\r\nfield=one";
        let request = Request::parse(raw).unwrap();
        assert_eq!(request.raw(), raw);
    }

    #[test]
    fn malformed_request_line_is_rejected() {
        assert!(matches!(
            Request::parse(b"NOT A VALID REQUEST\r\n\r\n"),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn truncated_headers_are_incomplete() {
        assert!(matches!(
            Request::parse(b"GET http://example.com/ HTTP/1.1\r\nHost: exam"),
            Err(Error::Incomplete)
        ));
    }
}

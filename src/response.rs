use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};

const TRANSFER_ENCODING: &str = "Transfer-Encoding";
const CHUNKED: &str = "chunked";
const CONTENT_LENGTH: &str = "Content-Length";
const DATE: &str = "Date";
const EXPIRES: &str = "Expires";
const LAST_MODIFIED: &str = "Last-Modified";
const ETAG: &str = "ETag";
const CACHE_CONTROL: &str = "Cache-Control";

const MAX_HEADERS: usize = 64;

// IMF-fixdate, the one HTTP-date form origins actually send.
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Errors encountered when parsing an origin response.
#[derive(Debug)]
pub enum Error {
    /// The bytes end before the status line and headers are complete.
    Incomplete,
    /// The status line or a header failed to parse.
    Malformed(httparse::Error),
    /// Content-Length carried a non-numeric value.
    InvalidContentLength,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Incomplete => write!(f, "response ended before headers were complete"),
            Error::Malformed(err) => write!(f, "malformed response: {}", err),
            Error::InvalidContentLength => write!(f, "Content-Length is not a number"),
        }
    }
}

/// How a stored response may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Normal,
    MustRevalidate,
    NoStore,
    Immutable,
}

/// Whether a response may live in a shared cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
}

/// A parsed origin response plus the freshness facts derived from its
/// headers. Headers keep their received spelling and insertion order so the
/// re-emitted bytes mirror what the origin sent.
#[derive(Debug, Clone)]
pub struct Response {
    pub http_version: String,
    pub status_code: u16,
    pub status_message: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,

    pub is_chunked: bool,
    /// Parsed Content-Length; -1 when the header is absent.
    pub content_length: i64,
    /// Expiration instant as an HTTP-date string; empty means already
    /// expired for cache purposes.
    pub expire_time: String,
    pub cache_mode: CacheMode,
    pub visibility: Visibility,
    pub no_store: bool,
    pub no_cache: bool,
    pub must_revalidate: bool,
    /// Effective max-age in seconds; -1 when unspecified or unparseable.
    pub max_age: i64,
}

impl Response {
    /// Parses a response message. Bytes past the header-terminating blank
    /// line become the initial body. The freshness evaluation (cache mode and
    /// expiration instant) runs here, exactly once per response.
    pub fn parse(raw: &[u8]) -> Result<Response, Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut headers);
        let header_len = match parsed.parse(raw) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Err(Error::Incomplete),
            Err(err) => return Err(Error::Malformed(err)),
        };

        let mut response = Response {
            http_version: format!("HTTP/1.{}", parsed.version.unwrap_or(1)),
            status_code: parsed.code.unwrap_or(0),
            status_message: parsed.reason.unwrap_or_default().to_string(),
            headers: Vec::with_capacity(parsed.headers.len()),
            body: raw[header_len..].to_vec(),
            is_chunked: false,
            content_length: -1,
            expire_time: String::new(),
            cache_mode: CacheMode::Normal,
            visibility: Visibility::Public,
            no_store: false,
            no_cache: false,
            must_revalidate: false,
            max_age: -1,
        };

        for header in parsed.headers.iter() {
            let value = String::from_utf8_lossy(header.value).trim().to_string();
            if header.name == TRANSFER_ENCODING && value.contains(CHUNKED) {
                response.is_chunked = true;
            } else if header.name == CONTENT_LENGTH {
                response.content_length =
                    value.parse().map_err(|_| Error::InvalidContentLength)?;
            }
            response.headers.push((header.name.to_string(), value));
        }

        response.parse_cache_control();
        response.set_expire_time();
        Ok(response)
    }

    // derive the cache mode, visibility and max-age from Cache-Control.
    // directives outside the understood set are ignored.
    fn parse_cache_control(&mut self) {
        let value = match self.header(CACHE_CONTROL) {
            Some(v) => v.to_string(),
            None => return,
        };

        // once an s-maxage wins, later max-age directives must not override it.
        let mut s_maxage_locked = false;

        for directive in value.split(',') {
            let directive = directive.trim();
            if directive == "no-store" {
                self.no_store = true;
                self.cache_mode = CacheMode::NoStore;
            } else if directive == "no-cache" {
                self.no_cache = true;
                self.cache_mode = CacheMode::MustRevalidate;
            } else if directive == "must-revalidate" || directive == "proxy-revalidate" {
                self.must_revalidate = true;
                self.cache_mode = CacheMode::MustRevalidate;
            } else if directive == "private" {
                self.visibility = Visibility::Private;
            } else if directive == "public" {
                self.visibility = Visibility::Public;
            } else if let Some(seconds) = directive.strip_prefix("max-age=") {
                if !s_maxage_locked {
                    self.max_age = match seconds.parse::<i64>() {
                        Ok(n) if n >= 0 => n,
                        _ => -1,
                    };
                }
            } else if let Some(seconds) = directive.strip_prefix("s-maxage=") {
                // s-maxage only applies to a shared cache when the response
                // is public.
                if self.visibility == Visibility::Public {
                    match seconds.parse::<i64>() {
                        Ok(n) if n >= 0 => {
                            s_maxage_locked = true;
                            self.max_age = n;
                        }
                        _ => self.max_age = -1,
                    }
                }
            }
        }

        if !self.no_store && !self.no_cache && !self.must_revalidate {
            self.cache_mode = CacheMode::Normal;
        }
    }

    // compute the expiration instant, first rule that applies:
    //   1. Date + max-age
    //   2. Expires, verbatim
    //   3. must-revalidate forces expiry at Date
    //   4. heuristic: Date + (Date - Last-Modified) / 10
    //   5. none: empty, treated as already expired
    fn set_expire_time(&mut self) {
        let date = self.header(DATE).and_then(parse_http_date);

        if self.max_age > 0 {
            if let Some(date) = date {
                self.expire_time = format_http_date(date + chrono::Duration::seconds(self.max_age));
                return;
            }
        }

        if let Some(expires) = self.header(EXPIRES).map(str::to_string) {
            self.expire_time = expires;
            return;
        }

        if self.must_revalidate {
            if let Some(date) = date {
                self.expire_time = format_http_date(date);
                return;
            }
        }

        if self.cache_mode != CacheMode::NoStore {
            let last_modified = self.header(LAST_MODIFIED).and_then(parse_http_date);
            if let (Some(date), Some(last_modified)) = (date, last_modified) {
                let heuristic = (date - last_modified).num_seconds() / 10;
                self.expire_time =
                    format_http_date(date + chrono::Duration::seconds(heuristic));
            }
        }
    }

    /// First header value under exactly this name, as received.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn etag(&self) -> Option<&str> {
        self.header(ETAG)
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.header(LAST_MODIFIED)
    }

    pub fn cache_control(&self) -> Option<&str> {
        self.header(CACHE_CONTROL)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Appends body bytes and updates Content-Length to the new total.
    pub fn add_body(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
        let len = self.body.len().to_string();
        match self.headers.iter_mut().find(|(n, _)| n == CONTENT_LENGTH) {
            Some((_, value)) => *value = len,
            None => self.headers.push((CONTENT_LENGTH.to_string(), len)),
        }
        self.content_length = self.body.len() as i64;
    }

    /// Appends relayed chunk bytes; chunked framing carries its own lengths,
    /// so no header is touched.
    pub fn add_chunked_data(&mut self, bytes: &[u8]) {
        if self.is_chunked {
            self.body.extend_from_slice(bytes);
        }
    }

    /// Re-emits the message: status line, headers in insertion order, blank
    /// line, body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 256);
        out.extend_from_slice(self.status_line().as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    pub fn status_line(&self) -> String {
        format!(
            "{} {} {}",
            self.http_version, self.status_code, self.status_message
        )
        .trim_end()
        .to_string()
    }

    /// Whether this response may be stored under the proxy's policy.
    pub fn is_cacheable(&self, is_private_cache: bool) -> bool {
        if self.status_code != 200 || self.cache_mode == CacheMode::NoStore {
            return false;
        }
        if self.visibility == Visibility::Private && !is_private_cache {
            return false;
        }
        true
    }

    /// Whether a stored copy must be revalidated with the origin before reuse.
    pub fn needs_revalidation(&self) -> bool {
        self.cache_mode == CacheMode::MustRevalidate || self.no_cache
    }
}

pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), HTTP_DATE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn format_http_date(instant: DateTime<Utc>) -> String {
    instant.format(HTTP_DATE_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &[u8]) -> Response {
        Response::parse(raw).unwrap()
    }

    #[test]
    fn parses_status_line_headers_and_body() {
        let response = parse(
            b"HTTP/1.1 200 OK\r\n\
              Date: Tue, 01 Apr 2025 10:00:00 GMT\r\n\
              Content-Length: 5\r\n\r\nhello",
        );
        assert_eq!(response.status_code, 200);
        assert_eq!(response.status_message, "OK");
        assert_eq!(response.http_version, "HTTP/1.1");
        assert_eq!(response.content_length, 5);
        assert_eq!(response.body(), b"hello");
        assert!(!response.is_chunked);
    }

    #[test]
    fn reemission_preserves_header_insertion_order() {
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\n\
              Server: origin/1.0\r\n\
              ETag: \"abc\"\r\n\
              Content-Length: 2\r\n\r\nok";
        let response = parse(raw);
        assert_eq!(response.to_bytes(), raw);
    }

    #[test]
    fn round_trip_keeps_derived_fields() {
        let first = parse(
            b"HTTP/1.1 200 OK\r\n\
              Date: Tue, 01 Apr 2025 10:00:00 GMT\r\n\
              Cache-Control: public, max-age=60\r\n\
              Content-Length: 4\r\n\r\nbody",
        );
        let second = parse(&first.to_bytes());
        assert_eq!(second.status_code, first.status_code);
        assert_eq!(second.content_length, first.content_length);
        assert_eq!(second.is_chunked, first.is_chunked);
        assert_eq!(second.cache_mode, first.cache_mode);
        assert_eq!(second.expire_time, first.expire_time);
        assert_eq!(second.body(), first.body());
    }

    #[test]
    fn chunked_transfer_encoding_is_detected() {
        let response = parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert!(response.is_chunked);
        assert_eq!(response.content_length, -1);
    }

    #[test]
    fn non_numeric_content_length_fails_the_parse() {
        assert!(matches!(
            Response::parse(b"HTTP/1.1 200 OK\r\nContent-Length: banana\r\n\r\n"),
            Err(Error::InvalidContentLength)
        ));
    }

    #[test]
    fn truncated_head_is_incomplete() {
        assert!(matches!(
            Response::parse(b"HTTP/1.1 200 OK\r\nDate: Tue"),
            Err(Error::Incomplete)
        ));
    }

    #[test]
    fn no_store_sets_flag_and_mode() {
        let response = parse(b"HTTP/1.1 200 OK\r\nCache-Control: no-cache, no-store\r\n\r\n");
        assert!(response.no_store);
        assert!(response.no_cache);
        assert_eq!(response.cache_mode, CacheMode::NoStore);
    }

    #[test]
    fn no_cache_alone_requires_revalidation() {
        let response = parse(b"HTTP/1.1 200 OK\r\nCache-Control: no-cache\r\n\r\n");
        assert_eq!(response.cache_mode, CacheMode::MustRevalidate);
        assert!(response.needs_revalidation());
    }

    #[test]
    fn proxy_revalidate_counts_as_must_revalidate() {
        let response = parse(b"HTTP/1.1 200 OK\r\nCache-Control: proxy-revalidate\r\n\r\n");
        assert!(response.must_revalidate);
        assert_eq!(response.cache_mode, CacheMode::MustRevalidate);
    }

    #[test]
    fn unrestricted_response_defaults_to_normal() {
        let response = parse(b"HTTP/1.1 200 OK\r\nCache-Control: public, max-age=300\r\n\r\n");
        assert_eq!(response.cache_mode, CacheMode::Normal);
        assert_eq!(response.max_age, 300);
        assert!(!response.needs_revalidation());
    }

    #[test]
    fn bad_max_age_value_stays_unset() {
        let response = parse(b"HTTP/1.1 200 OK\r\nCache-Control: max-age=soon\r\n\r\n");
        assert_eq!(response.max_age, -1);
        let response = parse(b"HTTP/1.1 200 OK\r\nCache-Control: max-age=-5\r\n\r\n");
        assert_eq!(response.max_age, -1);
    }

    #[test]
    fn s_maxage_wins_over_later_max_age_when_public() {
        let response =
            parse(b"HTTP/1.1 200 OK\r\nCache-Control: public, s-maxage=600, max-age=60\r\n\r\n");
        assert_eq!(response.max_age, 600);
    }

    #[test]
    fn s_maxage_is_ignored_for_private_responses() {
        let response =
            parse(b"HTTP/1.1 200 OK\r\nCache-Control: private, s-maxage=600, max-age=60\r\n\r\n");
        assert_eq!(response.max_age, 60);
        assert_eq!(response.visibility, Visibility::Private);
    }

    #[test]
    fn expiration_from_date_plus_max_age() {
        let response = parse(
            b"HTTP/1.1 200 OK\r\n\
              Date: Tue, 01 Apr 2025 10:00:00 GMT\r\n\
              Cache-Control: max-age=60\r\n\r\n",
        );
        assert_eq!(response.expire_time, "Tue, 01 Apr 2025 10:01:00 GMT");
    }

    #[test]
    fn expires_header_is_used_verbatim() {
        let response = parse(
            b"HTTP/1.1 200 OK\r\nExpires: Wed, 02 Apr 2025 08:00:00 GMT\r\n\r\n",
        );
        assert_eq!(response.expire_time, "Wed, 02 Apr 2025 08:00:00 GMT");
    }

    #[test]
    fn must_revalidate_expires_at_date() {
        let response = parse(
            b"HTTP/1.1 200 OK\r\n\
              Date: Tue, 01 Apr 2025 10:00:00 GMT\r\n\
              Cache-Control: must-revalidate\r\n\r\n",
        );
        assert_eq!(response.expire_time, "Tue, 01 Apr 2025 10:00:00 GMT");
    }

    #[test]
    fn heuristic_expiration_is_a_tenth_of_the_age() {
        // two hours between Last-Modified and Date: expire 12 minutes past Date.
        let response = parse(
            b"HTTP/1.1 200 OK\r\n\
              Date: Tue, 01 Apr 2025 10:00:00 GMT\r\n\
              Last-Modified: Tue, 01 Apr 2025 08:00:00 GMT\r\n\r\n",
        );
        assert_eq!(response.expire_time, "Tue, 01 Apr 2025 10:12:00 GMT");
    }

    #[test]
    fn no_usable_headers_leaves_expiration_empty() {
        let response = parse(b"HTTP/1.1 200 OK\r\nServer: origin/1.0\r\n\r\n");
        assert_eq!(response.expire_time, "");
    }

    #[test]
    fn add_body_updates_content_length() {
        let mut response = parse(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhello");
        response.add_body(b"world");
        assert_eq!(response.content_length, 10);
        assert_eq!(response.header("Content-Length"), Some("10"));
        assert_eq!(response.body(), b"helloworld");
    }

    #[test]
    fn cacheability_follows_status_directives_and_visibility() {
        let ok = parse(b"HTTP/1.1 200 OK\r\nCache-Control: max-age=60\r\n\r\n");
        assert!(ok.is_cacheable(false));

        let not_found = parse(b"HTTP/1.1 404 Not Found\r\n\r\n");
        assert!(!not_found.is_cacheable(false));

        let no_store = parse(b"HTTP/1.1 200 OK\r\nCache-Control: no-store\r\n\r\n");
        assert!(!no_store.is_cacheable(false));

        let private = parse(b"HTTP/1.1 200 OK\r\nCache-Control: private\r\n\r\n");
        assert!(!private.is_cacheable(false));
        assert!(private.is_cacheable(true));
    }

    #[test]
    fn http_dates_parse_and_format_round_trip() {
        let parsed = parse_http_date("Tue, 01 Apr 2025 10:00:00 GMT").unwrap();
        assert_eq!(format_http_date(parsed), "Tue, 01 Apr 2025 10:00:00 GMT");
        assert!(parse_http_date("not a date").is_none());
    }
}

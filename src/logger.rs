use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;

use crate::cache::CacheStatus;

/// Append-only sink for per-request lifecycle events. Every line carries a
/// wall-clock UTC timestamp; a single mutex serializes writers so events for
/// one request id keep their order. Request id -1 marks events that happen
/// outside any assigned request.
pub struct Logger {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl Logger {
    /// Opens (and truncates) the log file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Logger> {
        let file = File::create(path)?;
        Ok(Logger::from_writer(Box::new(BufWriter::new(file))))
    }

    /// Wraps an arbitrary writer; tests pass an in-memory buffer.
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Logger {
        Logger {
            sink: Mutex::new(writer),
        }
    }

    fn write_line(&self, id: i64, body: &str) {
        let timestamp = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
        let mut sink = self.sink.lock().unwrap();
        // a failed log write must never take a worker down with it.
        let _ = writeln!(sink, "[{}] {}: {}", timestamp, id, body);
        let _ = sink.flush();
    }

    pub fn log_new_request(&self, id: i64, request_line: &str, ip_from: &str) {
        self.write_line(id, &format!("\"{}\" from {}", request_line, ip_from));
    }

    pub fn log_requesting(&self, id: i64, request_line: &str, server: &str) {
        self.write_line(id, &format!("Requesting \"{}\" from {}", request_line, server));
    }

    pub fn log_received(&self, id: i64, response_line: &str, server: &str) {
        self.write_line(id, &format!("Received \"{}\" from {}", response_line, server));
    }

    /// Result of the cache lookup for a client request. `detail` is the
    /// stored entry's expiration instant where one applies.
    pub fn log_cache_request(&self, id: i64, status: CacheStatus, detail: &str) {
        match status {
            CacheStatus::NotInCache => self.write_line(id, "not in cache"),
            CacheStatus::Expired => {
                self.write_line(id, &format!("in cache, but expired at {}", detail))
            }
            CacheStatus::RequiresValidation => {
                self.write_line(id, "in cache, requires validation")
            }
            CacheStatus::Valid => self.write_line(id, "in cache, valid"),
            _ => {}
        }
    }

    /// Admission decision for a response received from an origin. `detail`
    /// carries the non-cacheable reason or the expiration instant.
    pub fn log_cache_response(&self, id: i64, status: CacheStatus, detail: &str) {
        match status {
            CacheStatus::NotCacheable => {
                self.write_line(id, &format!("not cacheable because {}", detail))
            }
            CacheStatus::WillExpire => {
                self.write_line(id, &format!("cached, expires at {}", detail))
            }
            CacheStatus::Revalidation => {
                self.write_line(id, "cached, but requires re-validation")
            }
            _ => {}
        }
    }

    pub fn log_responding(&self, id: i64, response_line: &str) {
        self.write_line(id, &format!("Responding \"{}\"", response_line));
    }

    pub fn log_tunnel_closed(&self, id: i64) {
        self.write_line(id, "Tunnel closed");
    }

    pub fn log_error(&self, id: i64, message: &str) {
        self.write_line(id, &format!("ERROR {}", message));
    }

    pub fn log_note(&self, id: i64, message: &str) {
        self.write_line(id, &format!("NOTE {}", message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn capture_logger() -> (Logger, Capture) {
        let capture = Capture::default();
        (Logger::from_writer(Box::new(capture.clone())), capture)
    }

    #[test]
    fn new_request_records_line_and_source() {
        let (logger, capture) = capture_logger();
        logger.log_new_request(0, "GET http://example.com/ HTTP/1.1", "10.0.0.7");
        let line = capture.contents();
        assert!(line.contains("0: \"GET http://example.com/ HTTP/1.1\" from 10.0.0.7"));
        // every entry starts with a bracketed utc timestamp.
        assert!(line.starts_with('['));
        assert!(line.contains("GMT]"));
    }

    #[test]
    fn cache_request_grammar_matches_each_status() {
        let (logger, capture) = capture_logger();
        logger.log_cache_request(1, CacheStatus::NotInCache, "");
        logger.log_cache_request(2, CacheStatus::Expired, "Tue, 01 Apr 2025 10:00:00 GMT");
        logger.log_cache_request(3, CacheStatus::RequiresValidation, "");
        logger.log_cache_request(4, CacheStatus::Valid, "");

        let contents = capture.contents();
        assert!(contents.contains("1: not in cache"));
        assert!(contents.contains("2: in cache, but expired at Tue, 01 Apr 2025 10:00:00 GMT"));
        assert!(contents.contains("3: in cache, requires validation"));
        assert!(contents.contains("4: in cache, valid"));
    }

    #[test]
    fn cache_response_grammar_matches_each_status() {
        let (logger, capture) = capture_logger();
        logger.log_cache_response(5, CacheStatus::NotCacheable, "no-store directive");
        logger.log_cache_response(6, CacheStatus::WillExpire, "Tue, 01 Apr 2025 11:00:00 GMT");
        logger.log_cache_response(7, CacheStatus::Revalidation, "");

        let contents = capture.contents();
        assert!(contents.contains("5: not cacheable because no-store directive"));
        assert!(contents.contains("6: cached, expires at Tue, 01 Apr 2025 11:00:00 GMT"));
        assert!(contents.contains("7: cached, but requires re-validation"));
    }

    #[test]
    fn diagnostics_use_the_sentinel_outside_requests() {
        let (logger, capture) = capture_logger();
        logger.log_error(-1, "empty request received");
        logger.log_note(-1, "proxy started and waiting for connections");
        logger.log_tunnel_closed(9);

        let contents = capture.contents();
        assert!(contents.contains("-1: ERROR empty request received"));
        assert!(contents.contains("-1: NOTE proxy started and waiting for connections"));
        assert!(contents.contains("9: Tunnel closed"));
    }
}

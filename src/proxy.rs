use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use http::StatusCode;

use crate::cache::{Cache, CacheStatus, DEFAULT_CLEANUP_INTERVAL};
use crate::logger::Logger;
use crate::request::Request;
use crate::response::{CacheMode, Response};
use crate::wire;

// receive timeout installed on a freshly accepted client socket.
const CLIENT_RECV_TIMEOUT: Duration = Duration::from_secs(30);
// quiet period that ends a normal message read.
const QUIET_RECV_TIMEOUT: Duration = Duration::from_secs(10);
// tighter bound while waiting for the head of a fresh origin reply.
const HEADER_RECV_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// bodies longer than one receive buffer are drained to EOF instead of being
// completed by quiet reads.
const LONG_RESPONSE_THRESHOLD: i64 = 65536;

const TUNNEL_IDLE_TIMEOUT: Duration = Duration::from_millis(10_500);
// tunnel relays wake this often to check the idle window and shutdown flag.
const TUNNEL_POLL_INTERVAL: Duration = Duration::from_secs(1);
// the accept loop polls at this cadence so stop() is observed promptly.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The proxy: listening socket, shared cache, lifecycle log, and the accept
/// loop that hands each client connection to a worker thread. Workers share
/// nothing but the cache and the log.
pub struct Proxy {
    listener: TcpListener,
    cache: Cache,
    logger: Arc<Logger>,
    request_count: AtomicI64,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Proxy {
    /// Binds the listening socket. Bind failures are fatal to the caller.
    pub fn new(port: u16, max_cache_entries: usize, logger: Logger) -> std::io::Result<Proxy> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        // the accept loop polls rather than blocks so the shutdown flag is
        // observed within one interval.
        listener.set_nonblocking(true)?;

        let logger = Arc::new(logger);
        logger.log_note(
            -1,
            &format!("proxy started on port {}", listener.local_addr()?.port()),
        );

        Ok(Proxy {
            listener,
            cache: Cache::new(max_cache_entries, DEFAULT_CLEANUP_INTERVAL),
            logger,
            request_count: AtomicI64::new(0),
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until [`Proxy::stop`] is called, spawning one
    /// worker per client, then joins whatever workers remain.
    pub fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        self.logger
            .log_note(-1, "proxy started and waiting for connections");

        while self.running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((client, addr)) => {
                    if let Err(err) = client.set_read_timeout(Some(CLIENT_RECV_TIMEOUT)) {
                        log::warn!("could not set client receive timeout: {}", err);
                    }

                    let mut workers = self.workers.lock().unwrap();
                    // reap finished workers so the roster stays small.
                    let mut in_flight = Vec::with_capacity(workers.len() + 1);
                    for handle in workers.drain(..) {
                        if handle.is_finished() {
                            let _ = handle.join();
                        } else {
                            in_flight.push(handle);
                        }
                    }
                    *workers = in_flight;

                    let proxy = Arc::clone(&self);
                    workers.push(thread::spawn(move || proxy.handle_client(client, addr)));
                    log::debug!("spawned worker, {} connections in flight", workers.len());
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(err) => {
                    // a failed accept never takes the proxy down.
                    if self.running.load(Ordering::SeqCst) {
                        self.logger
                            .log_error(-1, &format!("failed to accept connection: {}", err));
                    }
                }
            }
        }

        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        self.logger.log_note(-1, "proxy stopped");
    }

    /// Signals the accept loop and any tunnels to wind down. `run` returns
    /// once the remaining workers finish.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    // per-connection entry point: read and parse the client request, then
    // dispatch on the method. every exit path closes the client socket by
    // dropping it.
    fn handle_client(&self, mut client: TcpStream, addr: SocketAddr) {
        let client_ip = addr.ip().to_string();
        log::debug!("connection received from {}", client_ip);

        let raw = match wire::recv_until_quiet(&mut client, QUIET_RECV_TIMEOUT) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.logger
                    .log_error(-1, &format!("failed to read client request: {}", err));
                return;
            }
        };
        if raw.is_empty() {
            self.logger.log_error(-1, "empty request received");
            return;
        }

        let request = match Request::parse(&raw) {
            Ok(request) => request,
            Err(err) => {
                self.logger
                    .log_error(-1, &format!("failed to parse request: {}", err));
                self.send_error_response(&mut client, -1, StatusCode::BAD_REQUEST);
                return;
            }
        };

        let id = self.request_count.fetch_add(1, Ordering::SeqCst);
        self.logger
            .log_new_request(id, &request.request_line, &client_ip);

        match request.method.as_str() {
            "GET" => self.process_get(&mut client, &request, id),
            "POST" => self.process_post(&mut client, &request, id),
            "CONNECT" => self.process_connect(&mut client, &request, id),
            other => {
                self.logger
                    .log_error(id, &format!("method {} not implemented", other));
                self.send_error_response(&mut client, id, StatusCode::NOT_IMPLEMENTED);
            }
        }
    }

    // GET: consult the cache, revalidate a stored copy when its directives
    // demand it (or when it expired but still carries validators), otherwise
    // fetch from the origin and offer the result for admission.
    fn process_get(&self, client: &mut TcpStream, request: &Request, id: i64) {
        let full_url = format!("{}{}", request.host, request.target);

        let (status, cached) = self.cache.get(&full_url);
        match &cached {
            Some(response) => self
                .logger
                .log_cache_request(id, status, &response.expire_time),
            None => self.logger.log_cache_request(id, status, ""),
        }

        if status == CacheStatus::Valid {
            if let Some(response) = &cached {
                if let Err(err) = client.write_all(&response.to_bytes()) {
                    log::warn!("failed to send cached response to client: {}", err);
                    return;
                }
                self.logger.log_responding(id, &response.status_line());
                return;
            }
        }

        if matches!(
            status,
            CacheStatus::RequiresValidation | CacheStatus::Expired
        ) {
            if let Some(stale) = &cached {
                let etag = stale.etag().unwrap_or("");
                let last_modified = stale.last_modified().unwrap_or("");
                if etag.is_empty() && last_modified.is_empty() {
                    self.logger
                        .log_note(id, "validation not possible - no validator headers");
                } else if self.revalidate(client, request, id, stale, etag, last_modified) {
                    return;
                }
            }
        }

        self.fetch_from_origin(client, request, id, &full_url);
    }

    // conditional fetch against the origin using the stored validators.
    // returns true when the request was fully answered (304 served from the
    // cache, or an error page already sent); false falls through to a fresh
    // full fetch.
    fn revalidate(
        &self,
        client: &mut TcpStream,
        request: &Request,
        id: i64,
        stale: &Response,
        etag: &str,
        last_modified: &str,
    ) -> bool {
        let port = request.origin_port(80);
        let mut server = match wire::resolve_and_connect(&request.host, port, CONNECT_TIMEOUT) {
            Ok(stream) => stream,
            Err(err) => {
                self.logger.log_error(
                    id,
                    &format!(
                        "failed to connect to {}:{} for validation: {}",
                        request.host, port, err
                    ),
                );
                self.send_error_response(client, id, StatusCode::BAD_GATEWAY);
                return true;
            }
        };

        if !etag.is_empty() {
            self.logger
                .log_note(id, &format!("using ETag for validation: {}", etag));
        }
        if !last_modified.is_empty() {
            self.logger.log_note(
                id,
                &format!("using Last-Modified for validation: {}", last_modified),
            );
        }

        let conditional = request.with_validators(etag, last_modified);
        self.logger
            .log_requesting(id, &conditional.request_line, &request.host);
        if let Err(err) = server.write_all(conditional.emit().as_bytes()) {
            self.logger
                .log_error(id, &format!("failed to send validation request: {}", err));
            return false;
        }

        let reply = match wire::recv_until_quiet(&mut server, QUIET_RECV_TIMEOUT) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.logger
                    .log_error(id, &format!("failed to read validation response: {}", err));
                return false;
            }
        };
        if reply.is_empty() {
            self.logger
                .log_error(id, "empty validation response from origin");
            return false;
        }

        let validation = match Response::parse(&reply) {
            Ok(response) => response,
            Err(err) => {
                self.logger
                    .log_error(id, &format!("failed to parse validation response: {}", err));
                return false;
            }
        };
        self.logger
            .log_received(id, &validation.status_line(), &request.host);

        if validation.status_code == 304 {
            self.logger
                .log_note(id, "validation successful - using cached copy");
            if let Err(err) = client.write_all(&stale.to_bytes()) {
                log::warn!("failed to send cached response to client: {}", err);
                return true;
            }
            self.logger.log_responding(id, &stale.status_line());
            return true;
        }

        // anything but 304 means the content changed; the validation reply is
        // discarded and a fresh fetch delivers the new representation.
        self.logger
            .log_note(id, "content changed - using new response");
        false
    }

    // full fetch: forward the canonical request, frame the reply per its
    // headers, and offer 200s for cache admission.
    fn fetch_from_origin(
        &self,
        client: &mut TcpStream,
        request: &Request,
        id: i64,
        full_url: &str,
    ) {
        let port = request.origin_port(80);
        self.logger
            .log_requesting(id, &request.request_line, &request.host);

        let mut server = match wire::resolve_and_connect(&request.host, port, CONNECT_TIMEOUT) {
            Ok(stream) => stream,
            Err(err) => {
                self.logger.log_error(
                    id,
                    &format!("failed to connect to {}:{}: {}", request.host, port, err),
                );
                self.send_error_response(client, id, StatusCode::BAD_GATEWAY);
                return;
            }
        };

        if let Err(err) = server.write_all(request.emit().as_bytes()) {
            self.logger
                .log_error(id, &format!("failed to send request to origin: {}", err));
            self.send_error_response(client, id, StatusCode::BAD_GATEWAY);
            return;
        }

        let initial = match wire::recv_until_quiet(&mut server, HEADER_RECV_TIMEOUT) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.logger
                    .log_error(id, &format!("failed to read origin response: {}", err));
                self.send_error_response(client, id, StatusCode::BAD_GATEWAY);
                return;
            }
        };
        if initial.is_empty() {
            self.logger.log_error(id, "empty response from origin");
            self.send_error_response(client, id, StatusCode::BAD_GATEWAY);
            return;
        }

        let mut response = match Response::parse(&initial) {
            Ok(response) => response,
            Err(err) => {
                self.logger
                    .log_error(id, &format!("failed to parse origin response: {}", err));
                self.send_error_response(client, id, StatusCode::BAD_GATEWAY);
                return;
            }
        };

        self.forward_origin_response(client, &mut server, &initial, &mut response, id);

        self.logger
            .log_received(id, &response.status_line(), &request.host);
        if let Some(etag) = response.etag() {
            self.logger.log_note(id, &format!("ETag: {}", etag));
        }
        if let Some(cache_control) = response.cache_control() {
            self.logger
                .log_note(id, &format!("Cache-Control: {}", cache_control));
        }

        if response.status_code == 200 {
            self.handle_caching(response, full_url, id);
        } else {
            self.logger.log_responding(id, &response.status_line());
        }
    }

    // body framing: chunked streams are relayed segment by segment as they
    // arrive, long bodies are drained to EOF, short bodies are completed by a
    // quiet read and sent whole.
    fn forward_origin_response(
        &self,
        client: &mut TcpStream,
        server: &mut TcpStream,
        initial: &[u8],
        response: &mut Response,
        id: i64,
    ) {
        if response.is_chunked {
            self.logger.log_note(id, "detected chunked encoding");
            if let Err(err) = client.write_all(initial) {
                log::warn!("failed to relay response head to client: {}", err);
                return;
            }
            let chunks = relay_chunks(server, client, response.body());
            response.add_chunked_data(&chunks);
        } else if response.content_length > LONG_RESPONSE_THRESHOLD {
            self.logger.log_note(
                id,
                &format!("detected large content: {} bytes", response.content_length),
            );
            let rest = wire::recv_all(server);
            response.add_body(&rest);
            if let Err(err) = client.write_all(&response.to_bytes()) {
                log::warn!("failed to send response to client: {}", err);
            }
        } else {
            if response.content_length > 0
                && (response.body_len() as i64) < response.content_length
            {
                if let Ok(rest) = wire::recv_until_quiet(server, QUIET_RECV_TIMEOUT) {
                    response.add_body(&rest);
                }
            }
            if let Err(err) = client.write_all(&response.to_bytes()) {
                log::warn!("failed to send response to client: {}", err);
            }
        }
    }

    // admission: refusals are logged with the most specific reason, stored
    // entries with their expiration or revalidation obligation.
    fn handle_caching(&self, response: Response, url: &str, id: i64) {
        if !response.is_cacheable(false) {
            let reason = if response.status_code != 200 {
                "status code is not 200 OK"
            } else if response.no_store {
                "no-store directive"
            } else if response.cache_mode == CacheMode::NoStore {
                "cache-control: no-store"
            } else {
                "unknown"
            };
            self.logger
                .log_cache_response(id, CacheStatus::NotCacheable, reason);
            return;
        }

        if !response.expire_time.is_empty() {
            self.logger
                .log_cache_response(id, CacheStatus::WillExpire, &response.expire_time);
        } else if response.no_cache || response.must_revalidate {
            self.logger
                .log_cache_response(id, CacheStatus::Revalidation, "");
        }

        self.cache.put(url, Arc::new(response), &self.logger);
    }

    // POST: forward the client's bytes verbatim, frame the reply like any
    // origin response, never cache.
    fn process_post(&self, client: &mut TcpStream, request: &Request, id: i64) {
        let port = request.origin_port(80);
        self.logger
            .log_requesting(id, &request.request_line, &request.host);

        let mut server = match wire::resolve_and_connect(&request.host, port, CONNECT_TIMEOUT) {
            Ok(stream) => stream,
            Err(err) => {
                self.logger.log_error(
                    id,
                    &format!("failed to connect to {}:{}: {}", request.host, port, err),
                );
                self.send_error_response(client, id, StatusCode::BAD_GATEWAY);
                return;
            }
        };

        if let Err(err) = server.write_all(request.raw()) {
            self.logger
                .log_error(id, &format!("failed to send request to origin: {}", err));
            self.send_error_response(client, id, StatusCode::BAD_GATEWAY);
            return;
        }

        let initial = match wire::recv_until_quiet(&mut server, HEADER_RECV_TIMEOUT) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.logger
                    .log_error(id, &format!("failed to read origin response: {}", err));
                self.send_error_response(client, id, StatusCode::BAD_GATEWAY);
                return;
            }
        };
        if initial.is_empty() {
            self.logger.log_error(id, "empty response from origin");
            self.send_error_response(client, id, StatusCode::BAD_GATEWAY);
            return;
        }

        let mut response = match Response::parse(&initial) {
            Ok(response) => response,
            Err(err) => {
                self.logger
                    .log_error(id, &format!("failed to parse origin response: {}", err));
                self.send_error_response(client, id, StatusCode::BAD_GATEWAY);
                return;
            }
        };

        self.forward_origin_response(client, &mut server, &initial, &mut response, id);
        self.logger
            .log_received(id, &response.status_line(), &request.host);
        self.logger.log_responding(id, &response.status_line());
    }

    // CONNECT: reply 200 and relay opaque bytes both ways until either side
    // closes, the idle window lapses, or the proxy shuts down.
    fn process_connect(&self, client: &mut TcpStream, request: &Request, id: i64) {
        let port = request.origin_port(443);
        let server = match wire::resolve_and_connect(&request.host, port, CONNECT_TIMEOUT) {
            Ok(stream) => stream,
            Err(err) => {
                self.logger.log_error(
                    id,
                    &format!(
                        "failed to connect to {}:{} for tunnel: {}",
                        request.host, port, err
                    ),
                );
                self.send_error_response(client, id, StatusCode::BAD_GATEWAY);
                return;
            }
        };

        if let Err(err) = client.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n") {
            log::warn!("failed to confirm tunnel to client: {}", err);
            return;
        }
        self.logger
            .log_responding(id, "HTTP/1.1 200 Connection established");

        self.run_tunnel(client, &server, id);
        self.logger.log_tunnel_closed(id);
    }

    fn run_tunnel(&self, client: &TcpStream, server: &TcpStream, id: i64) {
        let clones = (
            client.try_clone(),
            server.try_clone(),
            server.try_clone(),
            client.try_clone(),
        );
        let (Ok(client_read), Ok(server_write), Ok(server_read), Ok(client_write)) = clones
        else {
            self.logger.log_error(id, "failed to split tunnel sockets");
            return;
        };

        let last_activity = Arc::new(Mutex::new(Instant::now()));

        let upstream = {
            let running = Arc::clone(&self.running);
            let activity = Arc::clone(&last_activity);
            let logger = Arc::clone(&self.logger);
            thread::spawn(move || {
                relay_tunnel_direction(
                    client_read,
                    server_write,
                    "client",
                    false,
                    running,
                    activity,
                    logger,
                    id,
                )
            })
        };

        // the downstream direction is the single authority on idle timeout so
        // the note is emitted once.
        relay_tunnel_direction(
            server_read,
            client_write,
            "server",
            true,
            Arc::clone(&self.running),
            last_activity,
            Arc::clone(&self.logger),
            id,
        );
        let _ = upstream.join();
    }

    // synthesizes the proxy's own error page. `id` is -1 when the failure
    // happened before a request id was assigned.
    fn send_error_response(&self, client: &mut TcpStream, id: i64, status: StatusCode) {
        let code = status.as_u16();
        let reason = status.canonical_reason().unwrap_or("Error");
        let status_line = format!("HTTP/1.1 {} {}", code, reason);
        let body = format!(
            "<html><head><title>{} {}</title></head><body><h1>{} {}</h1>\
             <p>Proxy Error</p></body></html>",
            code, reason, code, reason
        );
        let message = format!(
            "{}\r\nContent-Type: text/html\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
            status_line,
            body.len(),
            body
        );

        if let Err(err) = client.write_all(message.as_bytes()) {
            log::warn!("failed to send error response to client: {}", err);
        }
        self.logger.log_responding(id, &status_line);
    }
}

fn chunk_stream_finished(data: &[u8]) -> bool {
    data.ends_with(b"0\r\n\r\n")
}

// relay chunk bytes from the origin to the client as they arrive, collecting
// them for the parsed response. the stream ends at the terminal chunk marker,
// which may already sit in the bytes read with the header.
fn relay_chunks(server: &mut TcpStream, client: &mut TcpStream, already_received: &[u8]) -> Vec<u8> {
    let mut collected = Vec::new();
    if chunk_stream_finished(already_received) {
        return collected;
    }

    let mut buf = vec![0u8; wire::RECV_BUF_SIZE];
    loop {
        match server.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                collected.extend_from_slice(&buf[..n]);
                if client.write_all(&buf[..n]).is_err() {
                    break;
                }
                if chunk_stream_finished(&collected) {
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    collected
}

// one direction of a CONNECT tunnel. wakes every poll interval to observe the
// shutdown flag and, when `enforce_idle` is set, the shared idle window.
// closing both sockets on exit unblocks the opposite direction.
#[allow(clippy::too_many_arguments)]
fn relay_tunnel_direction(
    mut from: TcpStream,
    mut to: TcpStream,
    from_label: &'static str,
    enforce_idle: bool,
    running: Arc<AtomicBool>,
    last_activity: Arc<Mutex<Instant>>,
    logger: Arc<Logger>,
    id: i64,
) {
    if from.set_read_timeout(Some(TUNNEL_POLL_INTERVAL)).is_err() {
        let _ = from.shutdown(Shutdown::Both);
        let _ = to.shutdown(Shutdown::Both);
        return;
    }

    let mut buf = vec![0u8; wire::RECV_BUF_SIZE];
    while running.load(Ordering::Relaxed) {
        match from.read(&mut buf) {
            Ok(0) => {
                logger.log_note(id, &format!("connection closed by {}", from_label));
                break;
            }
            Ok(n) => {
                *last_activity.lock().unwrap() = Instant::now();
                if to.write_all(&buf[..n]).is_err() {
                    logger.log_error(
                        id,
                        &format!("failed to forward tunnel data from {}", from_label),
                    );
                    break;
                }
            }
            Err(err) if wire::is_timeout(&err) => {
                if enforce_idle
                    && last_activity.lock().unwrap().elapsed() >= TUNNEL_IDLE_TIMEOUT
                {
                    logger.log_note(id, "tunnel timeout after 10.5 seconds of inactivity");
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }

    let _ = from.shutdown(Shutdown::Both);
    let _ = to.shutdown(Shutdown::Both);
}

use std::io::{self, ErrorKind, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

// all socket reads in the proxy go through a buffer of this size. a read that
// comes back shorter than the buffer is taken as the end of the current burst.
pub const RECV_BUF_SIZE: usize = 65536;

// receive timeout installed on every origin socket we hand out.
pub const ORIGIN_RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves `host:port` and connects to the first address that accepts,
/// bounding each connect attempt by `connect_timeout`. The returned stream
/// carries a 10-second receive timeout.
pub fn resolve_and_connect(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> io::Result<TcpStream> {
    let addrs = (host, port).to_socket_addrs()?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, connect_timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(ORIGIN_RECV_TIMEOUT))?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            ErrorKind::AddrNotAvailable,
            format!("no addresses resolved for {}:{}", host, port),
        )
    }))
}

/// Reads from `stream` until it goes quiet: a short read, a clean EOF, or
/// `timeout` elapsing with no data all end the loop. Returns whatever was
/// accumulated; an I/O error is fatal only when nothing was received yet.
pub fn recv_until_quiet(stream: &mut TcpStream, timeout: Duration) -> io::Result<Vec<u8>> {
    stream.set_read_timeout(Some(timeout))?;

    let mut received = Vec::new();
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    loop {
        match stream.read(&mut buf) {
            // a zero-byte receive is a clean EOF, not an error.
            Ok(0) => break,
            Ok(n) => {
                received.extend_from_slice(&buf[..n]);
                if n < buf.len() {
                    break;
                }
            }
            Err(err) if is_timeout(&err) => break,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                if received.is_empty() {
                    return Err(err);
                }
                break;
            }
        }
    }

    Ok(received)
}

/// Drains `stream` to EOF. Used when the caller already knows more body is
/// coming and just wants everything until the peer closes; the socket's
/// receive timeout bounds each wait, and a timeout ends the drain.
pub fn recv_all(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    received
}

// read timeouts surface as WouldBlock or TimedOut depending on the platform.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

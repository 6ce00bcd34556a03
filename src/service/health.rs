//! Liveness checks for service ports.

use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const HTTP_TIMEOUT: Duration = Duration::from_secs(2);

/// Whether something accepts TCP connections on `127.0.0.1:<port>`.
pub fn port_open(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).is_ok()
}

/// Whether `GET http://127.0.0.1:<port><path>` answers 200.
pub fn http_ok(port: u16, path: &str) -> bool {
    let url = format!("http://127.0.0.1:{port}{path}");
    let client = match reqwest::blocking::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            debug!(%url, error = %err, "building http client");
            return false;
        }
    };
    match client.get(&url).send() {
        Ok(resp) => resp.status() == reqwest::StatusCode::OK,
        Err(err) => {
            debug!(%url, error = %err, "health check failed");
            false
        }
    }
}

/// Poll `check` every `interval` until it holds or `window` elapses.
///
/// `check` always runs at least once.
pub fn wait_until<F>(window: Duration, interval: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + window;
    loop {
        if check() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(interval.min(deadline - now));
    }
}

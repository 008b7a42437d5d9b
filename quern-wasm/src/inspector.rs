//! Remote-debug channel for generated modules.
//!
//! Compiled only with the `inspector` feature and activated by a configured
//! port >= 1024. The server runs in a background thread on
//! `std::net::TcpListener` (no async runtime required) and exposes:
//!
//! - `GET /`: a synthesized JS bootstrap page that fetches the emitted
//!   module bytes, binds a stub import object and calls `main`, so an
//!   attached browser's developer tools can step through the generated code
//! - `GET /module.wasm`: the emitted module bytes
//! - `GET /ws`: WebSocket endpoint (RFC 6455 upgrade) pushing execution
//!   events
//!
//! The driver blocks until the bootstrap has fetched the module (the
//! debugger is attached) before it runs the query natively, and keeps the
//! engine's conservative check configuration while the channel is up.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use base64::Engine as _;
use sha1::{Digest, Sha1};

struct InspectorState {
    context_id: u32,
    module: Vec<u8>,
    events: Mutex<Vec<String>>,
    bootstrap_seen: Mutex<bool>,
    bootstrap_cv: Condvar,
}

/// Debug server handle; stops when dropped.
pub struct InspectorServer {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    state: Arc<InspectorState>,
}

impl InspectorServer {
    pub fn start(port: u16, context_id: u32, module: Vec<u8>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));
        let state = Arc::new(InspectorState {
            context_id,
            module,
            events: Mutex::new(Vec::new()),
            bootstrap_seen: Mutex::new(false),
            bootstrap_cv: Condvar::new(),
        });
        let thread_state = state.clone();
        let thread_running = running.clone();
        thread::Builder::new()
            .name("quern-inspector".to_string())
            .spawn(move || serve_loop(&listener, &thread_state, &thread_running))?;
        Ok(Self {
            local_addr,
            running,
            state,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.local_addr)
    }

    pub fn push_event(&self, event: &str) {
        self.state.events.lock().unwrap().push(event.to_string());
    }

    /// Blocks until the bootstrap page has fetched the module, or the
    /// timeout elapses. Returns whether a debugger attached.
    pub fn wait_for_bootstrap(&self, timeout: Duration) -> bool {
        let seen = self.state.bootstrap_seen.lock().unwrap();
        let (seen, _) = self
            .state
            .bootstrap_cv
            .wait_timeout_while(seen, timeout, |seen| !*seen)
            .unwrap();
        *seen
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for InspectorServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_loop(listener: &TcpListener, state: &Arc<InspectorState>, running: &AtomicBool) {
    while running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _peer)) => {
                let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
                let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
                handle_connection(stream, state);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // Nonblocking accept lets stop() terminate promptly.
                thread::sleep(Duration::from_millis(25));
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(_) => {
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                thread::sleep(Duration::from_millis(25));
            }
        }
    }
}

fn handle_connection(mut stream: TcpStream, state: &Arc<InspectorState>) {
    let mut reader = BufReader::new(&stream);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() {
        return;
    }
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return;
    }
    let (method, path) = (parts[0], parts[1]);
    let headers = read_headers(&mut reader);

    if method != "GET" {
        let _ = write_response(&mut stream, 405, "text/plain", b"Method Not Allowed");
        return;
    }

    match path {
        "/" => {
            let page = BOOTSTRAP_HTML.replace("__CTX_ID__", &state.context_id.to_string());
            let _ = write_response(&mut stream, 200, "text/html; charset=utf-8", page.as_bytes());
        }
        "/module.wasm" => {
            let _ = write_response(&mut stream, 200, "application/wasm", &state.module);
            let mut seen = state.bootstrap_seen.lock().unwrap();
            *seen = true;
            state.bootstrap_cv.notify_all();
        }
        "/ws" => {
            if handle_websocket(&mut stream, &headers, state).is_err() {
                let _ = write_response(
                    &mut stream,
                    400,
                    "text/plain",
                    b"websocket upgrade failed",
                );
            }
        }
        _ => {
            let _ = write_response(&mut stream, 404, "text/plain", b"Not Found");
        }
    }
}

fn read_headers(reader: &mut BufReader<&TcpStream>) -> Vec<(String, String)> {
    let mut headers = Vec::with_capacity(16);
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\r', '\n']);
                if trimmed.is_empty() {
                    break;
                }
                if let Some((key, value)) = trimmed.split_once(':') {
                    headers.push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
                }
            }
        }
    }
    headers
}

fn header_value<'a>(headers: &'a [(String, String)], key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// `Sec-WebSocket-Accept` per RFC 6455.
fn websocket_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

fn write_ws_text_frame(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len();
    let mut header = [0u8; 10];
    header[0] = 0x81; // FIN + text
    let header_len = if len < 126 {
        header[1] = len as u8;
        2
    } else if u16::try_from(len).is_ok() {
        header[1] = 126;
        header[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        4
    } else {
        header[1] = 127;
        header[2..10].copy_from_slice(&(len as u64).to_be_bytes());
        10
    };
    stream.write_all(&header[..header_len])?;
    stream.write_all(payload)
}

fn handle_websocket(
    stream: &mut TcpStream,
    headers: &[(String, String)],
    state: &Arc<InspectorState>,
) -> std::io::Result<()> {
    let upgrade = header_value(headers, "upgrade").unwrap_or_default();
    let connection = header_value(headers, "connection").unwrap_or_default();
    let key = header_value(headers, "sec-websocket-key")
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "missing key"))?;
    if !upgrade.eq_ignore_ascii_case("websocket")
        || !connection
            .split(',')
            .any(|part| part.trim().eq_ignore_ascii_case("upgrade"))
    {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "missing websocket upgrade headers",
        ));
    }
    let accept = websocket_accept_key(key.trim());
    write!(
        stream,
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    )?;
    for event in state.events.lock().unwrap().iter() {
        write_ws_text_frame(stream, event.as_bytes())?;
    }
    // Normal closure after the push keeps the endpoint lightweight.
    stream.write_all(&[0x88, 0x00])?;
    stream.flush()
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> std::io::Result<()> {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Unknown",
    };
    write!(
        stream,
        "HTTP/1.1 {status} {status_text}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        body.len(),
    )?;
    stream.write_all(body)?;
    stream.flush()
}

/// Synthesized bootstrap: fetches the module, binds a stub import object
/// (every host callback logs and returns 0) and calls `main`, so browser
/// dev tools can drive the generated code. Table images and the arena are
/// host-side state and are absent here; the page is a stepping vehicle, not
/// a faithful re-execution.
const BOOTSTRAP_HTML: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>quern inspector</title></head>
<body>
<pre id="log"></pre>
<script>
(async () => {
  const log = (...args) => {
    document.getElementById('log').textContent += args.join(' ') + '\n';
    console.log(...args);
  };
  const env = new Proxy({}, {
    get: (_imports, name) => (...args) => { log('host call:', name, ...args); return 0; }
  });
  const response = await fetch('/module.wasm');
  const bytes = await response.arrayBuffer();
  log('module:', bytes.byteLength, 'bytes');
  const { instance } = await WebAssembly.instantiate(bytes, { env });
  log('rows:', instance.exports.main(__CTX_ID__));
})();
</script>
</body>
</html>
"#;

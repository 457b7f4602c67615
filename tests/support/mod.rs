//! Shared test support: a minimal canned-response HTTP origin
//!
//! The origin binds an ephemeral port, records every request it sees
//! (path and conditional headers), tracks how many requests are in
//! flight at once, and serves responses from a FIFO queue with an
//! optional fallback. Responses can stall mid-body to open race and
//! cancellation windows.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

#[derive(Clone, Debug)]
pub struct CannedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Send this many body bytes, then pause for `stall_for` before the rest
    pub stall_after: Option<usize>,
    pub stall_for: Duration,
}

impl CannedResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
            stall_after: None,
            stall_for: Duration::ZERO,
        }
    }

    pub fn not_modified() -> Self {
        Self {
            status: 304,
            headers: Vec::new(),
            body: Vec::new(),
            stall_after: None,
            stall_for: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            stall_after: None,
            stall_for: Duration::ZERO,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_etag(self, etag: &str) -> Self {
        self.with_header("ETag", etag)
    }

    pub fn with_last_modified(self, value: &str) -> Self {
        self.with_header("Last-Modified", value)
    }

    pub fn stalled(mut self, after: usize, stall_for: Duration) -> Self {
        self.stall_after = Some(after);
        self.stall_for = stall_for;
        self
    }
}

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub path: String,
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
}

#[derive(Default)]
struct OriginState {
    responses: Mutex<VecDeque<CannedResponse>>,
    default_response: Mutex<Option<CannedResponse>>,
    requests: Mutex<Vec<RecordedRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

pub struct TestOrigin {
    addr: SocketAddr,
    state: Arc<OriginState>,
    accept_loop: tokio::task::JoinHandle<()>,
}

impl TestOrigin {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(OriginState::default());
        let loop_state = Arc::clone(&state);
        let accept_loop = tokio::spawn(async move {
            loop {
                let Ok((conn, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_connection(conn, Arc::clone(&loop_state)));
            }
        });
        Self {
            addr,
            state,
            accept_loop,
        }
    }

    pub fn url(&self, path: &str) -> Url {
        Url::parse(&format!("http://{}{}", self.addr, path)).unwrap()
    }

    /// Queue the next response; responses serve in FIFO order.
    pub fn enqueue(&self, response: CannedResponse) {
        self.state.responses.lock().unwrap().push_back(response);
    }

    /// Response served whenever the queue is empty.
    pub fn set_default(&self, response: CannedResponse) {
        *self.state.default_response.lock().unwrap() = Some(response);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.lock().unwrap().len()
    }

    /// Largest number of simultaneously in-flight requests observed.
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Drop for TestOrigin {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn handle_connection(mut conn: TcpStream, state: Arc<OriginState>) {
    let Some(request) = read_request_head(&mut conn).await else {
        return;
    };
    state.requests.lock().unwrap().push(request);

    let in_flight = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

    let response = state
        .responses
        .lock()
        .unwrap()
        .pop_front()
        .or_else(|| state.default_response.lock().unwrap().clone())
        .unwrap_or_else(|| CannedResponse::status(500));

    write_response(&mut conn, &response).await;
    state.in_flight.fetch_sub(1, Ordering::SeqCst);
}

async fn read_request_head(conn: &mut TcpStream) -> Option<RecordedRequest> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match conn.read(&mut byte).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => head.push(byte[0]),
        }
    }

    let head = String::from_utf8_lossy(&head);
    let mut lines = head.lines();
    let request_line = lines.next()?;
    let path = request_line.split_whitespace().nth(1)?.to_string();

    let mut if_none_match = None;
    let mut if_modified_since = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim().to_string();
            match name.to_ascii_lowercase().as_str() {
                "if-none-match" => if_none_match = Some(value),
                "if-modified-since" => if_modified_since = Some(value),
                _ => {}
            }
        }
    }

    Some(RecordedRequest {
        path,
        if_none_match,
        if_modified_since,
    })
}

async fn write_response(conn: &mut TcpStream, response: &CannedResponse) {
    let reason = match response.status {
        200 => "OK",
        304 => "Not Modified",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Response",
    };
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nConnection: close\r\nContent-Length: {}\r\n",
        response.status,
        reason,
        response.body.len()
    );
    for (name, value) in &response.headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    if conn.write_all(head.as_bytes()).await.is_err() {
        return;
    }
    match response.stall_after {
        Some(sent) if sent <= response.body.len() => {
            if conn.write_all(&response.body[..sent]).await.is_err() {
                return;
            }
            let _ = conn.flush().await;
            tokio::time::sleep(response.stall_for).await;
            let _ = conn.write_all(&response.body[sent..]).await;
        }
        _ => {
            let _ = conn.write_all(&response.body).await;
        }
    }
    let _ = conn.flush().await;
}

/// Build an in-memory tar archive for directory-fetch tests.
pub fn build_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *contents).unwrap();
    }
    builder.into_inner().unwrap()
}

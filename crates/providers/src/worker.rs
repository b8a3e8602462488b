//! Background completion worker.
//!
//! Each request runs on its own OS thread with a private Tokio runtime, so the
//! caller's UI context never blocks. Progress comes back through a
//! `std::sync::mpsc` channel as [`CompletionEvent`]s tagged with the caller's epoch.

use futures::future::{AbortHandle, AbortRegistration, Abortable};
use shared::agent_api::ChatMessage;
use shared::events::{CompletionEvent, Epoch};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::openai::{ApiConfig, CompletionError, OpenAIClient};

/// Everything a worker needs; owned so it can move to the worker thread.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub epoch: Epoch,
    pub messages: Vec<ChatMessage>,
    pub api: ApiConfig,
    pub temperature: f32,
}

/// Caller-side handle to a running worker.
///
/// Dropping the handle does not stop the worker; it runs to completion and its
/// events can still be told apart by epoch.
#[derive(Debug)]
pub struct WorkerHandle {
    epoch: Epoch,
    abort: AbortHandle,
}

impl WorkerHandle {
    pub fn new(epoch: Epoch, abort: AbortHandle) -> Self {
        Self { epoch, abort }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Stop the request. The worker still emits one `Failed { "Cancelled" }` terminal.
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }
}

/// Starts completion workers. The controller depends on this seam rather than
/// on threads and HTTP directly.
pub trait CompletionLauncher: Send {
    fn launch(&self, request: CompletionRequest, events: Sender<CompletionEvent>) -> WorkerHandle;
}

/// Launcher that talks to the real completion API.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompletionWorker;

impl CompletionLauncher for CompletionWorker {
    fn launch(&self, request: CompletionRequest, events: Sender<CompletionEvent>) -> WorkerHandle {
        start(request, events)
    }
}

/// Spawn a worker thread for `request`.
///
/// The channel receives zero or more `Increment`s followed by exactly one
/// terminal event; nothing is sent after the terminal.
pub fn start(request: CompletionRequest, events: Sender<CompletionEvent>) -> WorkerHandle {
    let epoch = request.epoch;
    let (abort_handle, abort_reg) = AbortHandle::new_pair();
    let finished = Arc::new(AtomicBool::new(false));

    tracing::info!(
        epoch,
        model = %request.api.model,
        messages = request.messages.len(),
        "starting completion"
    );

    std::thread::spawn(move || {
        let tx_panic = events.clone();
        let finished_panic = finished.clone();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            run(request, events, abort_reg, &finished);
        }));
        if res.is_err() && !finished_panic.swap(true, Ordering::SeqCst) {
            tracing::warn!(epoch, "completion worker panicked");
            let _ = tx_panic.send(CompletionEvent::Failed {
                epoch,
                error: "Something went wrong while processing that request.".to_string(),
            });
        }
    });

    WorkerHandle::new(epoch, abort_handle)
}

fn run(
    request: CompletionRequest,
    events: Sender<CompletionEvent>,
    abort_reg: AbortRegistration,
    finished: &AtomicBool,
) {
    let epoch = request.epoch;
    let terminal = |event: CompletionEvent| {
        if !finished.swap(true, Ordering::SeqCst) {
            let _ = events.send(event);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            terminal(CompletionEvent::Failed {
                epoch,
                error: format!("Failed to start async runtime: {}", e),
            });
            return;
        }
    };

    let client = OpenAIClient::new(request.api);
    let increments = events.clone();
    let result = rt.block_on(Abortable::new(
        client.stream_chat(&request.messages, request.temperature, |text| {
            let _ = increments.send(CompletionEvent::Increment {
                epoch,
                text: text.to_string(),
            });
        }),
        abort_reg,
    ));

    let outcome = match result {
        Ok(inner) => inner,
        Err(_aborted) => Err(CompletionError::Cancelled),
    };

    match outcome {
        Ok(text) => {
            tracing::debug!(epoch, chars = text.len(), "completion finished");
            terminal(CompletionEvent::Completed { epoch, text });
        }
        Err(e) => {
            tracing::warn!(epoch, error = %e, "completion failed");
            terminal(CompletionEvent::Failed {
                epoch,
                error: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc::{channel, Receiver};
    use std::time::Duration;

    fn read_request(stream: &std::net::TcpStream) -> String {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut head = String::new();
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap() == 0 || line == "\r\n" {
                break;
            }
            let lower = line.to_ascii_lowercase();
            if let Some(v) = lower.strip_prefix("content-length:") {
                content_length = v.trim().parse().unwrap_or(0);
            }
            head.push_str(&lower);
        }
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).unwrap();
        head + "\r\n" + &String::from_utf8_lossy(&body)
    }

    /// Serve one canned HTTP response; the captured request is sent on the returned channel.
    fn serve_once(status: &'static str, content_type: &'static str, body: String) -> (String, Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (req_tx, req_rx) = channel();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let request = read_request(&stream);
                let _ = req_tx.send(request);
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    content_type,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.flush();
            }
        });
        (format!("http://{}/v1", addr), req_rx)
    }

    fn sse_body(deltas: &[&str]) -> String {
        let mut body = String::new();
        for d in deltas {
            body.push_str(&format!(
                "data: {}\n\n",
                serde_json::json!({"choices": [{"delta": {"content": d}}]})
            ));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn request(epoch: Epoch, endpoint: &str) -> CompletionRequest {
        CompletionRequest {
            epoch,
            messages: vec![ChatMessage::system("be terse"), ChatMessage::user("hi")],
            api: ApiConfig::new(endpoint, "sk-test", "gpt-test"),
            temperature: 0.5,
        }
    }

    fn collect(rx: &Receiver<CompletionEvent>) -> Vec<CompletionEvent> {
        let mut out = Vec::new();
        loop {
            let event = rx
                .recv_timeout(Duration::from_secs(20))
                .expect("worker produced no terminal event");
            let terminal = event.is_terminal();
            out.push(event);
            if terminal {
                break;
            }
        }
        out
    }

    #[test]
    fn test_streams_accumulated_text_in_order() {
        let (endpoint, req_rx) = serve_once("200 OK", "text/event-stream", sse_body(&["H", "e", "l"]));
        let (tx, rx) = channel();
        let handle = start(request(7, &endpoint), tx);
        assert_eq!(handle.epoch(), 7);

        let events = collect(&rx);
        assert_eq!(
            events,
            vec![
                CompletionEvent::Increment { epoch: 7, text: "H".into() },
                CompletionEvent::Increment { epoch: 7, text: "He".into() },
                CompletionEvent::Increment { epoch: 7, text: "Hel".into() },
                CompletionEvent::Completed { epoch: 7, text: "Hel".into() },
            ]
        );

        let sent = req_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(sent.starts_with("post /v1/chat/completions"));
        assert!(sent.contains("authorization: bearer sk-test"));
        assert!(sent.contains(r#""stream":true"#));
        assert!(sent.contains(r#""model":"gpt-test""#));
        assert!(sent.contains(r#""temperature":0.5"#));
        assert!(sent.contains(r#"{"role":"system","content":"be terse"}"#));

        // nothing after the terminal
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_upstream_error_is_single_failure() {
        let (endpoint, _req) = serve_once(
            "401 Unauthorized",
            "application/json",
            r#"{"error":{"message":"Incorrect API key provided"}}"#.to_string(),
        );
        let (tx, rx) = channel();
        start(request(1, &endpoint), tx);

        let events = collect(&rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            CompletionEvent::Failed { epoch, error } => {
                assert_eq!(*epoch, 1);
                assert!(error.contains("401"));
                assert!(error.contains("Incorrect API key provided"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_plain_json_reply_is_accepted() {
        let (endpoint, _req) = serve_once(
            "200 OK",
            "application/json",
            r#"{"choices":[{"message":{"role":"assistant","content":"whole reply"}}]}"#.to_string(),
        );
        let (tx, rx) = channel();
        start(request(2, &endpoint), tx);

        let events = collect(&rx);
        assert_eq!(
            events,
            vec![CompletionEvent::Completed { epoch: 2, text: "whole reply".into() }]
        );
    }

    #[test]
    fn test_transport_error_fails() {
        // bind then drop to get a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let (tx, rx) = channel();
        start(request(3, &format!("http://127.0.0.1:{}/v1", port)), tx);

        let events = collect(&rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], CompletionEvent::Failed { epoch: 3, .. }));
    }

    #[test]
    fn test_abort_emits_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            // accept and hold the connection open without answering
            if let Ok((stream, _)) = listener.accept() {
                let _ = read_request(&stream);
                std::thread::sleep(Duration::from_secs(30));
                drop(stream);
            }
        });

        let (tx, rx) = channel();
        let handle = start(request(4, &format!("http://{}/v1", addr)), tx);
        std::thread::sleep(Duration::from_millis(200));
        handle.abort();
        assert!(handle.is_aborted());

        let events = collect(&rx);
        assert_eq!(
            events,
            vec![CompletionEvent::Failed { epoch: 4, error: "Cancelled".into() }]
        );
    }
}

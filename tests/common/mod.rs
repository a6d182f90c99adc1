use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// One scripted HTTP/1.1 response: status code plus a body to send verbatim
/// as `application/json`.
#[derive(Clone)]
pub struct Scripted {
    pub status: u16,
    pub body: String,
}

impl Scripted {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// A throwaway local HTTP server that answers every request in sequence
/// from a fixed script, then keeps repeating the last entry. Good enough to
/// exercise the real `ReqwestClient` against canned config-service replies
/// without standing up a mock-server dependency.
///
/// `GET /services/config` (the meta-server discovery endpoint a
/// [`config_sync_core::ConfigSyncClient`] resolves synchronously before its
/// first fetch) is answered out-of-band with a single entry pointing back at
/// this same server, rather than consuming a slot in `script`: tests pass
/// this server's own address as both the meta-server seed and the resolved
/// config-service endpoint, so the script's indices should only ever track
/// actual `configs/...`/`notifications/v2` calls.
pub struct TestServer {
    pub base_url: String,
    pub request_count: Arc<AtomicUsize>,
}

pub async fn start_server(script: Vec<Scripted>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let base_url = format!("http://{addr}");
    let request_count = Arc::new(AtomicUsize::new(0));
    let counter = request_count.clone();

    let accept_base_url = base_url.clone();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let script = script.clone();
            let counter = counter.clone();
            let base_url = accept_base_url.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                // Requests here have no body; a single read is enough to
                // drain the request line and headers.
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let request_line = String::from_utf8_lossy(&buf[..n]);

                let entry = if request_line.starts_with("GET /services/config") {
                    Scripted::new(200, format!("[{{\"homepageUrl\":\"{base_url}\"}}]"))
                } else {
                    let index = counter.fetch_add(1, Ordering::SeqCst);
                    script
                        .get(index.min(script.len().saturating_sub(1)))
                        .cloned()
                        .unwrap_or(Scripted::new(500, ""))
                };

                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    entry.status,
                    reason_phrase(entry.status),
                    entry.body.len(),
                    entry.body,
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    TestServer {
        base_url,
        request_count,
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        304 => "Not Modified",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

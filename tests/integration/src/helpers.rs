//! Test helpers: an in-process mock RESP backend and request plumbing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use shoal_backend::{BackendConfig, BackendConn, Reply, Request, WaitGroup};
use shoal_protocol::{Decoder, Resp};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

/// Decides the raw bytes written back for one decoded request. An empty
/// reply writes nothing, which leaves the request in flight forever.
pub type Handler = Arc<dyn Fn(Vec<Resp>) -> Vec<u8> + Send + Sync>;

/// A mock backend accepting real TCP connections and answering each
/// decoded multi-bulk request through its handler.
pub struct MockBackend {
    pub addr: String,
}

impl MockBackend {
    pub async fn start<H>(handler: H) -> MockBackend
    where
        H: Fn(Vec<Resp>) -> Vec<u8> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handler: Handler = Arc::new(handler);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve_conn(stream, handler.clone()));
            }
        });

        MockBackend { addr }
    }

    /// A backend that answers every request with `+PONG`.
    pub async fn pong() -> MockBackend {
        MockBackend::start(|_| b"+PONG\r\n".to_vec()).await
    }

    /// A backend that accepts requests but never answers them.
    pub async fn silent() -> MockBackend {
        MockBackend::start(|_| Vec::new()).await
    }
}

async fn serve_conn(stream: TcpStream, handler: Handler) {
    let (read_half, mut write_half) = stream.into_split();
    let mut dec = Decoder::new(read_half);
    loop {
        let Ok(multi) = dec.decode_multi_bulk().await else {
            return;
        };
        let reply = handler(multi);
        if !reply.is_empty() && write_half.write_all(&reply).await.is_err() {
            return;
        }
    }
}

/// The first token of a request, for dispatch in handlers.
pub fn command_name(multi: &[Resp]) -> String {
    match multi.first() {
        Some(Resp::Bulk(Some(b))) => String::from_utf8_lossy(b).to_uppercase(),
        _ => String::new(),
    }
}

/// The nth token of a request as a string.
pub fn command_arg(multi: &[Resp], n: usize) -> String {
    match multi.get(n) {
        Some(Resp::Bulk(Some(b))) => String::from_utf8_lossy(b).to_string(),
        _ => String::new(),
    }
}

/// Wraps a payload as a RESP bulk reply.
pub fn bulk_reply(payload: &str) -> Vec<u8> {
    format!("${}\r\n{}\r\n", payload.len(), payload).into_bytes()
}

/// A config sized for tests: one database, short deadlines.
pub fn test_config() -> BackendConfig {
    BackendConfig {
        recv_timeout: Duration::from_secs(2),
        send_timeout: Duration::from_secs(2),
        keepalive_period: Duration::ZERO,
        max_pipeline: 128,
        number_databases: 1,
        ..BackendConfig::default()
    }
}

/// Builds a request with a fresh batch handle and enqueues it.
pub async fn submit(bc: &BackendConn, tokens: &[&str]) -> Arc<Request> {
    let mut r = Request::new(tokens.iter().map(|t| Resp::bulk(t.to_string())).collect());
    r.batch = Some(WaitGroup::new());
    let r = Arc::new(r);
    bc.push_back(r.clone()).await;
    r
}

/// Awaits a submitted request's batch handle and returns its reply.
pub async fn wait_reply(r: &Request) -> Reply {
    r.batch.as_ref().expect("submitted with a batch").wait().await;
    r.reply().expect("completed request has a reply").clone()
}

/// Makes worker logs visible while debugging a test; set `RUST_LOG` to
/// raise the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shoal=error".into()),
        )
        .try_init();
}

/// Polls `cond` until it holds or the deadline passes.
pub async fn wait_until(deadline: Duration, cond: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

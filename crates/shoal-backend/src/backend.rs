//! Backend connection worker.
//!
//! One [`BackendConn`] owns one long-lived TCP connection to a backend and
//! runs rounds until closed. Each round has exactly two concurrent halves:
//! the writer loop drains the input queue, encodes requests onto the
//! socket with adaptive flushing, and hands each request to the reader
//! through a bounded `tasks` channel whose capacity is the pipeline depth;
//! the reader loop decodes responses and pairs them with tasks in FIFO
//! order. The reader never reorders and never decodes in parallel, which
//! is what makes pipelining correct.
//!
//! Health is a three-state machine: disconnected, connected, and
//! data-stale (reachable but not authoritative: replication down or a
//! snapshot still loading). Replies prefixed `MASTERDOWN` or `LOADING`
//! demote the connection; a keepalive `INFO` probe promotes it back.
//!
//! Every request dequeued from the input queue or the in-flight channel is
//! completed exactly once, with the backend's verbatim reply or one of the
//! sentinel errors. Nothing is dropped silently.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shoal_protocol::offheap;
use shoal_protocol::{Decoder, Encoder, FlushEncoder, ProtocolError, Resp};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::delay::DelayExp2;
use crate::error::BackendError;
use crate::request::Request;
use crate::sync::WaitGroup;

const STATE_DISCONNECTED: usize = 0;
const STATE_CONNECTED: usize = 1;
const STATE_DATA_STALE: usize = 2;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const INPUT_QUEUE_SIZE: usize = 1024;

/// Round failures tolerated before backoff kicks in.
const MAX_QUICK_RETRIES: u32 = 10;

const RETRY_DELAY_MIN: Duration = Duration::from_millis(50);
const RETRY_DELAY_MAX: Duration = Duration::from_secs(5);

struct Inner {
    addr: String,
    database: usize,
    config: Arc<BackendConfig>,
    state: AtomicUsize,
    closed: AtomicBool,
    input_tx: Mutex<Option<mpsc::Sender<Arc<Request>>>>,
}

/// Handle to one backend connection worker. Cheap to clone.
#[derive(Clone)]
pub struct BackendConn {
    inner: Arc<Inner>,
}

impl BackendConn {
    /// Creates the worker and spawns its connection loop. Must be called
    /// inside a tokio runtime.
    pub fn new(addr: impl Into<String>, database: usize, config: Arc<BackendConfig>) -> BackendConn {
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_SIZE);
        let inner = Arc::new(Inner {
            addr: addr.into(),
            database,
            config,
            state: AtomicUsize::new(STATE_DISCONNECTED),
            closed: AtomicBool::new(false),
            input_tx: Mutex::new(Some(input_tx)),
        });
        let worker = Worker {
            inner: inner.clone(),
            input: input_rx,
            retry_fails: 0,
            retry_delay: DelayExp2::new(RETRY_DELAY_MIN, RETRY_DELAY_MAX),
        };
        tokio::spawn(worker.run());
        BackendConn { inner }
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn database(&self) -> usize {
        self.inner.database
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_CONNECTED
    }

    /// Closes the input queue. Idempotent. The worker finishes its backlog
    /// and exits; anything it cannot deliver is failed with
    /// `backend conn reset`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        // taking the sender closes the channel once every transient
        // push_back clone is gone
        self.inner.input_tx.lock().unwrap().take();
    }

    /// Enqueues a request. The batch handle, if any, is added to before
    /// this returns, so the caller may wait on it immediately after.
    ///
    /// A closed worker completes the request with `backend conn reset`
    /// instead of dropping it.
    pub async fn push_back(&self, r: Arc<Request>) {
        if let Some(batch) = &r.batch {
            batch.add(1);
        }
        let tx = self.inner.input_tx.lock().unwrap().as_ref().cloned();
        match tx {
            Some(tx) => {
                if let Err(err) = tx.send(r).await {
                    err.0.complete(Err(BackendError::ConnReset));
                }
            }
            None => r.complete(Err(BackendError::ConnReset)),
        }
    }

    /// Periodic health probe. A no-op (returning false) while requests
    /// are queued. Healthy and disconnected workers get a `PING`; a
    /// data-stale worker gets an `INFO` whose reply is interpreted on the
    /// shared callback task.
    pub async fn keep_alive(&self) -> bool {
        if !self.input_is_empty() {
            return false;
        }
        match self.inner.state.load(Ordering::Acquire) {
            STATE_DATA_STALE => {
                let batch = WaitGroup::new();
                let mut m = Request::new(vec![Resp::bulk("INFO")]);
                m.batch = Some(batch.clone());
                let m = Arc::new(m);
                self.push_back(m.clone()).await;

                let inner = self.inner.clone();
                let probe: KeepAliveProbe = Box::pin(async move {
                    batch.wait().await;
                    if let Err(e) = interpret_info_reply(&inner, &m) {
                        if !inner.closed.load(Ordering::Acquire) {
                            warn!(
                                addr = %inner.addr,
                                database = inner.database,
                                error = %e,
                                "backend conn recover from DataStale failed"
                            );
                        }
                    }
                });
                // a full callback queue drops the probe; the next tick
                // sends another
                let _ = keepalive_callback().try_send(probe);
            }
            _ => {
                let m = Arc::new(Request::new(vec![Resp::bulk("PING")]));
                self.push_back(m).await;
            }
        }
        true
    }

    fn input_is_empty(&self) -> bool {
        let guard = self.inner.input_tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx.capacity() == tx.max_capacity(),
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// keepalive callback channel
// ---------------------------------------------------------------------------

type KeepAliveProbe = Pin<Box<dyn Future<Output = ()> + Send>>;

const KEEPALIVE_CALLBACK_CAPACITY: usize = 128;

static KEEPALIVE_CALLBACK: Mutex<Option<mpsc::Sender<KeepAliveProbe>>> = Mutex::new(None);

// One task interprets all INFO replies so the reader loops stay free of
// parse work. The task dies with the runtime that first spawned it, so a
// closed channel is respawned on the next probe.
fn keepalive_callback() -> mpsc::Sender<KeepAliveProbe> {
    let mut guard = KEEPALIVE_CALLBACK.lock().unwrap();
    if let Some(tx) = guard.as_ref() {
        if !tx.is_closed() {
            return tx.clone();
        }
    }
    let (tx, mut rx) = mpsc::channel::<KeepAliveProbe>(KEEPALIVE_CALLBACK_CAPACITY);
    tokio::spawn(async move {
        while let Some(probe) = rx.recv().await {
            probe.await;
        }
    });
    *guard = Some(tx.clone());
    tx
}

fn interpret_info_reply(inner: &Inner, m: &Request) -> Result<(), String> {
    let reply = m.reply().ok_or_else(|| "info reply is missing".to_string())?;
    let resp = match reply {
        Ok(resp) => resp,
        Err(e) => return Err(e.to_string()),
    };
    match resp {
        Resp::Error(v) => Err(format!("bad info resp: {}", String::from_utf8_lossy(v))),
        Resp::Bulk(v) => {
            let info = parse_info(v.as_deref().unwrap_or(b""));
            if info.get("master_link_status").map(String::as_str) == Some("down") {
                return Ok(());
            }
            if info.get("loading").map(String::as_str) == Some("1") {
                return Ok(());
            }
            if inner
                .state
                .compare_exchange(
                    STATE_DATA_STALE,
                    STATE_CONNECTED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                info!(
                    addr = %inner.addr,
                    database = inner.database,
                    "backend conn state = Connected (keepalive)"
                );
            }
            Ok(())
        }
        other => Err(format!(
            "bad info resp: should be string, but got {}",
            other.type_name()
        )),
    }
}

/// Splits an INFO payload into its `key:value` lines, trimming both sides
/// and skipping anything malformed.
fn parse_info(raw: &[u8]) -> HashMap<String, String> {
    let mut info = HashMap::new();
    for line in String::from_utf8_lossy(raw).lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if !key.is_empty() {
            info.insert(key.to_string(), value.trim().to_string());
        }
    }
    info
}

// ---------------------------------------------------------------------------
// connection rounds
// ---------------------------------------------------------------------------

struct Worker {
    inner: Arc<Inner>,
    input: mpsc::Receiver<Arc<Request>>,
    retry_fails: u32,
    retry_delay: DelayExp2,
}

impl Worker {
    async fn run(mut self) {
        info!(
            addr = %self.inner.addr,
            database = self.inner.database,
            "backend conn start service"
        );
        let mut round = 0u64;
        while !self.inner.closed.load(Ordering::Acquire) {
            debug!(
                addr = %self.inner.addr,
                database = self.inner.database,
                round,
                "backend conn round"
            );
            let result = self.loop_writer(round).await;
            self.inner
                .state
                .store(STATE_DISCONNECTED, Ordering::Release);
            self.drain_input();
            if let Err(e) = result {
                warn!(
                    addr = %self.inner.addr,
                    database = self.inner.database,
                    round,
                    error = %e,
                    "backend conn writer exit"
                );
                self.delay_before_retry().await;
            }
            round += 1;
        }
        info!(
            addr = %self.inner.addr,
            database = self.inner.database,
            "backend conn stop and exit"
        );
    }

    /// One connection round: dial, handshake, spawn the reader, then
    /// pipeline requests until the input closes or the round breaks.
    async fn loop_writer(&mut self, round: u64) -> Result<(), BackendError> {
        let (enc, tasks_tx) = self.new_backend_reader(round).await?;
        let mut p = FlushEncoder::new(enc);

        self.inner.state.store(STATE_CONNECTED, Ordering::Release);
        self.retry_fails = 0;
        self.retry_delay.reset();

        p.max_interval = Duration::from_millis(1);
        p.max_buffered = self.inner.config.max_pipeline / 2;

        let send_timeout = self.inner.config.send_timeout;
        loop {
            let Some(r) = self.input.recv().await else {
                // input closed: backlog done, clean exit
                return Ok(());
            };
            if r.read_only && r.is_broken() {
                r.complete(Err(BackendError::RequestBroken));
                continue;
            }
            if let Err(e) = with_deadline(send_timeout, p.encode_multi_bulk(&r.multi)).await {
                return Err(fail_request(&r, e));
            }
            // flush only once the queue momentarily drains, batching
            // bursts into single writes
            let force = self.input.is_empty();
            if let Err(e) = with_deadline(send_timeout, p.flush(force)).await {
                return Err(fail_request(&r, e));
            }
            if let Err(err) = tasks_tx.send(r).await {
                // reader died mid-round; its cleanup owns the in-flight
                // tasks, this request is ours to fail
                let e = BackendError::ConnFailure("reader exited".to_string());
                err.0.complete(Err(e.clone()));
                return Err(e);
            }
        }
        // dropping tasks_tx closes the channel; the reader drains and exits
    }

    /// Dials and prepares one socket, then spawns the reader half with a
    /// fresh bounded tasks channel. The reader owns the read half; the
    /// returned encoder owns the write half.
    async fn new_backend_reader(
        &self,
        round: u64,
    ) -> Result<(Encoder<OwnedWriteHalf>, mpsc::Sender<Arc<Request>>), BackendError> {
        let stream = self
            .dial()
            .await
            .map_err(|e| BackendError::ConnFailure(e.to_string()))?;
        let (read_half, write_half) = stream.into_split();

        let config = &self.inner.config;
        let mut dec = Decoder::with_buffer(read_half, offheap::make_slice(config.recv_bufsize));
        let mut enc = Encoder::with_buffer(write_half, offheap::make_slice(config.send_bufsize));

        if let Some(auth) = config.auth() {
            let multi = vec![Resp::bulk("AUTH"), Resp::bulk(auth.to_string())];
            self.handshake(&mut enc, &mut dec, &multi).await?;
        }
        if self.inner.database != 0 {
            let multi = vec![
                Resp::bulk("SELECT"),
                Resp::bulk(self.inner.database.to_string()),
            ];
            self.handshake(&mut enc, &mut dec, &multi).await?;
        }

        let (tasks_tx, tasks_rx) = mpsc::channel(config.max_pipeline.max(1));
        tokio::spawn(loop_reader(self.inner.clone(), dec, tasks_rx, round));
        Ok((enc, tasks_tx))
    }

    async fn dial(&self) -> io::Result<TcpStream> {
        let connect = TcpStream::connect(self.inner.addr.as_str());
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect timed out",
                ))
            }
        };
        stream.set_nodelay(true)?;
        let period = self.inner.config.keepalive_period;
        if !period.is_zero() {
            let sock = socket2::SockRef::from(&stream);
            sock.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(period))?;
        }
        Ok(stream)
    }

    /// Sends one preamble command (AUTH, SELECT) and requires a simple
    /// string reply.
    async fn handshake(
        &self,
        enc: &mut Encoder<OwnedWriteHalf>,
        dec: &mut Decoder<OwnedReadHalf>,
        multi: &[Resp],
    ) -> Result<(), BackendError> {
        let config = &self.inner.config;
        with_deadline(config.send_timeout, enc.encode_multi_bulk(multi, true))
            .await
            .map_err(|e| BackendError::ConnFailure(e.to_string()))?;
        let resp = with_deadline(config.recv_timeout, dec.decode())
            .await
            .map_err(|e| BackendError::ConnFailure(e.to_string()))?;
        match resp {
            Resp::Simple(_) => Ok(()),
            Resp::Error(v) => Err(BackendError::ConnFailure(format!(
                "error resp: {}",
                String::from_utf8_lossy(&v)
            ))),
            other => Err(BackendError::ConnFailure(format!(
                "error resp: should be string, but got {}",
                other.type_name()
            ))),
        }
    }

    fn drain_input(&mut self) {
        while let Ok(r) = self.input.try_recv() {
            r.complete(Err(BackendError::ConnReset));
        }
    }

    /// Reconnects immediately for the first few failures, then sleeps an
    /// exponentially growing delay. New requests arriving during the sleep
    /// are failed at once so the router never stacks up behind a dead
    /// backend; close aborts the sleep.
    async fn delay_before_retry(&mut self) {
        self.retry_fails += 1;
        if self.retry_fails <= MAX_QUICK_RETRIES {
            return;
        }
        let sleep = tokio::time::sleep(self.retry_delay.after());
        tokio::pin!(sleep);
        while !self.inner.closed.load(Ordering::Acquire) {
            tokio::select! {
                _ = &mut sleep => return,
                r = self.input.recv() => match r {
                    Some(r) => r.complete(Err(BackendError::ConnReset)),
                    None => return,
                },
            }
        }
    }
}

fn fail_request(r: &Request, e: ProtocolError) -> BackendError {
    let e = BackendError::ConnFailure(e.to_string());
    r.complete(Err(e.clone()));
    e
}

/// Reader half of one round: pairs each decoded response with the next
/// task in FIFO order. Exits when the tasks channel closes or a decode
/// fails; either way every remaining task is completed before the read
/// half drops (which releases the socket).
async fn loop_reader(
    inner: Arc<Inner>,
    mut dec: Decoder<OwnedReadHalf>,
    mut tasks: mpsc::Receiver<Arc<Request>>,
    round: u64,
) {
    let recv_timeout = inner.config.recv_timeout;
    let mut exit: Result<(), BackendError> = Ok(());
    while let Some(r) = tasks.recv().await {
        let resp = match with_deadline(recv_timeout, dec.decode()).await {
            Ok(resp) => resp,
            Err(e) => {
                let err = BackendError::ConnFailure(e.to_string());
                r.complete(Err(err.clone()));
                exit = Err(err);
                break;
            }
        };
        if let Some(payload) = resp.error_payload() {
            let cause = if payload.starts_with(b"MASTERDOWN") {
                Some("MASTERDOWN")
            } else if payload.starts_with(b"LOADING") {
                Some("LOADING")
            } else {
                None
            };
            if let Some(cause) = cause {
                let demoted = inner.state.compare_exchange(
                    STATE_CONNECTED,
                    STATE_DATA_STALE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                if demoted.is_ok() {
                    warn!(
                        addr = %inner.addr,
                        database = inner.database,
                        cause,
                        "backend conn state = DataStale"
                    );
                }
            }
        }
        // RESP errors included: the reply is handed up verbatim
        r.complete(Ok(resp));
    }
    // refuse new tasks, then fail whatever was still in flight
    tasks.close();
    while let Ok(r) = tasks.try_recv() {
        r.complete(Err(BackendError::ConnReset));
    }
    match exit {
        Ok(()) => debug!(
            addr = %inner.addr,
            database = inner.database,
            round,
            "backend conn reader exit"
        ),
        Err(e) => warn!(
            addr = %inner.addr,
            database = inner.database,
            round,
            error = %e,
            "backend conn reader exit"
        ),
    }
}

/// Applies a socket deadline to one codec operation. Zero disables it.
async fn with_deadline<T, F>(deadline: Duration, op: F) -> Result<T, ProtocolError>
where
    F: Future<Output = Result<T, ProtocolError>>,
{
    if deadline.is_zero() {
        return op.await;
    }
    match tokio::time::timeout(deadline, op).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "deadline exceeded",
        ))),
    }
}

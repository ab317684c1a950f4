//! Backend worker scenarios: rounds, preamble, health states, close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shoal_backend::{BackendConfig, BackendConn, BackendError};
use shoal_protocol::Resp;

use crate::helpers::{
    bulk_reply, command_arg, command_name, submit, test_config, wait_reply, wait_until,
    MockBackend,
};

#[tokio::test]
async fn ping_three_times_gets_three_pongs() {
    let backend = MockBackend::pong().await;
    let bc = BackendConn::new(&backend.addr, 0, Arc::new(test_config()));

    let r1 = submit(&bc, &["PING"]).await;
    let r2 = submit(&bc, &["PING"]).await;
    let r3 = submit(&bc, &["PING"]).await;

    for r in [&r1, &r2, &r3] {
        assert_eq!(wait_reply(r).await.unwrap(), Resp::simple("PONG"));
    }
    assert!(bc.is_connected());

    bc.close();
}

#[tokio::test]
async fn auth_and_select_precede_traffic() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let backend = MockBackend::start(move |multi| {
        let name = command_name(&multi);
        record
            .lock()
            .unwrap()
            .push((name.clone(), command_arg(&multi, 1)));
        match name.as_str() {
            "AUTH" | "SELECT" => b"+OK\r\n".to_vec(),
            _ => b"+PONG\r\n".to_vec(),
        }
    })
    .await;

    let config = BackendConfig {
        product_auth: Some("sesame".into()),
        number_databases: 4,
        ..test_config()
    };
    let bc = BackendConn::new(&backend.addr, 2, Arc::new(config));

    let r = submit(&bc, &["PING"]).await;
    assert_eq!(wait_reply(&r).await.unwrap(), Resp::simple("PONG"));

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0], ("AUTH".to_string(), "sesame".to_string()));
    assert_eq!(seen[1], ("SELECT".to_string(), "2".to_string()));
    assert_eq!(seen[2].0, "PING");

    bc.close();
}

#[tokio::test]
async fn broken_read_only_request_is_refused() {
    let backend = MockBackend::pong().await;
    let bc = BackendConn::new(&backend.addr, 0, Arc::new(test_config()));

    let mut r = shoal_backend::Request::new(vec![Resp::bulk("GET"), Resp::bulk("k")]);
    r.read_only = true;
    r.broken = Arc::new(AtomicBool::new(true));
    r.batch = Some(shoal_backend::WaitGroup::new());
    let r = Arc::new(r);
    bc.push_back(r.clone()).await;

    assert_eq!(
        wait_reply(&r).await,
        Err(BackendError::RequestBroken),
        "broken read-only requests fail before transmission"
    );

    bc.close();
}

#[tokio::test]
async fn unreachable_backend_fails_requests_with_reset() {
    // nothing listens on port 1; every round fails at dial
    let bc = BackendConn::new("127.0.0.1:1", 0, Arc::new(test_config()));

    let r = submit(&bc, &["PING"]).await;
    let reply = tokio::time::timeout(Duration::from_secs(5), wait_reply(&r))
        .await
        .expect("request against a dead backend must still complete");
    assert_eq!(reply, Err(BackendError::ConnReset));
    assert!(!bc.is_connected());

    bc.close();
}

#[tokio::test]
async fn close_completes_queued_and_in_flight_requests() {
    let backend = MockBackend::silent().await;
    let config = BackendConfig {
        recv_timeout: Duration::from_millis(300),
        ..test_config()
    };
    let bc = BackendConn::new(&backend.addr, 0, Arc::new(config));

    let mut requests = Vec::new();
    for i in 0..8 {
        requests.push(submit(&bc, &["GET", &format!("k{i}")]).await);
    }
    // let the writer move some of them in flight
    tokio::time::sleep(Duration::from_millis(50)).await;

    bc.close();

    for r in &requests {
        let reply = tokio::time::timeout(Duration::from_secs(5), wait_reply(r))
            .await
            .expect("every request must complete in finite time after close");
        assert!(reply.is_err(), "no request may complete successfully");
    }
}

#[tokio::test]
async fn loading_reply_demotes_then_keepalive_recovers() {
    crate::helpers::init_tracing();

    let loaded = Arc::new(AtomicBool::new(false));
    let state = loaded.clone();
    let backend = MockBackend::start(move |multi| match command_name(&multi).as_str() {
        "INFO" => {
            state.store(true, Ordering::Release);
            bulk_reply("# Replication\r\nmaster_link_status:up\r\nloading:0\r\n")
        }
        _ if !state.load(Ordering::Acquire) => {
            b"-LOADING Redis is loading the dataset in memory\r\n".to_vec()
        }
        _ => b"+PONG\r\n".to_vec(),
    })
    .await;

    let bc = BackendConn::new(&backend.addr, 0, Arc::new(test_config()));

    // the LOADING error reaches the caller verbatim and demotes the state
    let r = submit(&bc, &["PING"]).await;
    let reply = wait_reply(&r).await.unwrap();
    assert!(matches!(&reply, Resp::Error(v) if v.starts_with(b"LOADING")));
    assert!(
        wait_until(Duration::from_secs(2), || !bc.is_connected()).await,
        "LOADING must demote the worker out of Connected"
    );

    // keepalive sends INFO; its reply promotes the worker back
    assert!(bc.keep_alive().await);
    assert!(
        wait_until(Duration::from_secs(5), || bc.is_connected()).await,
        "keepalive INFO must recover the worker"
    );

    bc.close();
}

#[tokio::test]
async fn keepalive_pings_a_healthy_worker() {
    let pings = Arc::new(Mutex::new(0usize));
    let count = pings.clone();
    let backend = MockBackend::start(move |multi| {
        if command_name(&multi) == "PING" {
            *count.lock().unwrap() += 1;
        }
        b"+PONG\r\n".to_vec()
    })
    .await;

    let bc = BackendConn::new(&backend.addr, 0, Arc::new(test_config()));
    let r = submit(&bc, &["PING"]).await;
    wait_reply(&r).await.unwrap();

    assert!(bc.keep_alive().await);
    assert!(
        wait_until(Duration::from_secs(2), || *pings.lock().unwrap() >= 2).await,
        "keepalive must enqueue a PING"
    );

    bc.close();
}

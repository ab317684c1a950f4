//! Pipelining ordering guarantees.

use std::sync::Arc;
use std::time::Duration;

use shoal_backend::{BackendConn, Request, WaitGroup};
use shoal_protocol::Resp;

use crate::helpers::{bulk_reply, command_arg, submit, test_config, wait_reply, MockBackend};

#[tokio::test]
async fn responses_pair_with_requests_in_enqueue_order() {
    // the backend echoes each request's first argument, so a mispaired
    // response is immediately visible
    let backend = MockBackend::start(|multi| bulk_reply(&command_arg(&multi, 1))).await;
    let bc = BackendConn::new(&backend.addr, 0, Arc::new(test_config()));

    let mut requests = Vec::new();
    for i in 0..100 {
        requests.push(submit(&bc, &["ECHO", &i.to_string()]).await);
    }

    for (i, r) in requests.iter().enumerate() {
        let reply = wait_reply(r).await.unwrap();
        assert_eq!(reply, Resp::bulk(i.to_string()), "response {i} mispaired");
    }

    bc.close();
}

#[tokio::test]
async fn one_group_covers_a_fanout() {
    let backend = MockBackend::pong().await;
    let bc = BackendConn::new(&backend.addr, 0, Arc::new(test_config()));

    let group = WaitGroup::new();
    let mut requests = Vec::new();
    for _ in 0..10 {
        group.add(1);
        let mut r = Request::new(vec![Resp::bulk("PING")]);
        r.group = Some(group.clone());
        let r = Arc::new(r);
        bc.push_back(r.clone()).await;
        requests.push(r);
    }

    tokio::time::timeout(Duration::from_secs(5), group.wait())
        .await
        .expect("group must fire once all sub-requests complete");
    for r in &requests {
        assert_eq!(r.reply(), Some(&Ok(Resp::simple("PONG"))));
    }

    bc.close();
}

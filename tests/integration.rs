// tests/integration.rs

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout, Duration, Instant};

use common::{hub_pair, init_logging, EventLog, InstrumentedTransport};
use queue_rpc::{
    //
    create_memory_transport_with_hub,
    Address,
    Envelope,
    Result,
    RpcClient,
    RpcConfig,
    RpcError,
    RpcWorker,
    SubscribeOptions,
    TransportPtr,
    DEFAULT_REQUEST_QUEUE,
};

const WAIT: Duration = Duration::from_secs(2);

fn echo_worker(transport: TransportPtr) -> RpcWorker {
    RpcWorker::new(transport, DEFAULT_REQUEST_QUEUE, |payload: Bytes| async move {
        Ok(payload)
    })
}

async fn client_on(transport: TransportPtr, id: &str) -> RpcClient {
    RpcClient::with_transport(transport, &RpcConfig::memory(id))
        .await
        .expect("client setup")
}

#[tokio::test]
async fn ping_gets_pong() -> Result<()> {
    // ---
    init_logging();
    let (_hub, worker_tp, client_tp) = hub_pair("ping").await;

    let worker = RpcWorker::new(worker_tp, DEFAULT_REQUEST_QUEUE, |payload: Bytes| async move {
        assert_eq!(payload, Bytes::from_static(b"ping"));
        Ok(Bytes::from_static(b"pong"))
    });
    let task = worker.spawn();

    let client = client_on(client_tp, "ping").await;
    let reply = client.call(Bytes::from_static(b"ping"), WAIT).await?;

    assert_eq!(reply, Bytes::from_static(b"pong"));
    assert_eq!(client.pending_count(), 0);

    worker.shutdown();
    task.await.expect("worker task panicked")?;
    Ok(())
}

#[tokio::test]
async fn out_of_order_replies_reach_their_callers() -> Result<()> {
    // ---
    // Arrange: a hand-driven responder holds all three requests, then
    // answers them in the order C, A, B.
    // ---
    init_logging();
    let (hub, responder_tp, client_tp) = hub_pair("shuffle").await;

    responder_tp.declare_queue(DEFAULT_REQUEST_QUEUE, true).await?;
    let mut requests = responder_tp
        .subscribe(DEFAULT_REQUEST_QUEUE, SubscribeOptions::manual_ack(3))
        .await?;

    let client = client_on(client_tp, "shuffle").await;

    let calls: Vec<_> = ["A", "B", "C"]
        .into_iter()
        .map(|name| {
            let client = client.clone();
            tokio::spawn(async move { client.call(Bytes::from(name), WAIT).await })
        })
        .collect();

    let mut held = HashMap::new();
    for _ in 0..3 {
        let delivery = timeout(WAIT, requests.inbox.recv())
            .await
            .expect("request not delivered")
            .expect("request inbox closed");
        let name = String::from_utf8(delivery.envelope.payload.to_vec()).expect("utf8");
        held.insert(name, delivery);
    }

    // ---
    // Act
    // ---
    for name in ["C", "A", "B"] {
        let delivery = held.remove(name).expect("request held");
        let env = delivery.envelope;
        let reply = Envelope::response(
            env.reply_to.expect("reply_to set"),
            Bytes::from(format!("reply-{name}")),
            env.correlation_id.expect("correlation_id set"),
        );
        responder_tp.publish(reply).await?;
        responder_tp.ack(delivery.ack_token).await?;
    }

    // ---
    // Assert
    // ---
    let mut replies = Vec::new();
    for call in calls {
        replies.push(call.await.expect("call task panicked")?);
    }

    assert_eq!(
        replies,
        vec![
            Bytes::from_static(b"reply-A"),
            Bytes::from_static(b"reply-B"),
            Bytes::from_static(b"reply-C"),
        ]
    );
    assert_eq!(client.pending_count(), 0);
    assert_eq!(client.unmatched_responses(), 0);
    assert_eq!(hub.unacked_count(), 0);
    Ok(())
}

#[tokio::test]
async fn concurrent_calls_each_get_their_own_reply() -> Result<()> {
    // ---
    init_logging();
    let (_hub, worker_tp, client_tp) = hub_pair("concurrent").await;

    let worker = echo_worker(worker_tp);
    let task = worker.spawn();
    let client = client_on(client_tp, "concurrent").await;

    let calls: Vec<_> = (0..10)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                let payload = Bytes::from(format!("message-{i}"));
                let reply = client.call(payload.clone(), WAIT).await;
                (payload, reply)
            })
        })
        .collect();

    for call in calls {
        let (sent, reply) = call.await.expect("call task panicked");
        assert_eq!(reply?, sent);
    }

    assert_eq!(client.pending_count(), 0);

    worker.shutdown();
    task.await.expect("worker task panicked")?;
    Ok(())
}

#[tokio::test]
async fn timeout_removes_entry_and_late_reply_is_dropped() -> Result<()> {
    // ---
    init_logging();
    let (_hub, worker_tp, client_tp) = hub_pair("timeout").await;

    let worker = RpcWorker::new(worker_tp, DEFAULT_REQUEST_QUEUE, |payload: Bytes| async move {
        sleep(Duration::from_millis(300)).await;
        Ok(payload)
    });
    let task = worker.spawn();
    let client = client_on(client_tp, "timeout").await;

    let deadline = Duration::from_millis(10);
    let started = Instant::now();
    let result = client.call(Bytes::from_static(b"slow"), deadline).await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(RpcError::Timeout)), "got {result:?}");
    assert!(elapsed >= deadline, "timed out early after {elapsed:?}");
    assert_eq!(client.pending_count(), 0);

    // The worker still replies once it finishes; nobody is waiting.
    let late = timeout(WAIT, async {
        while client.unmatched_responses() == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(late.is_ok(), "late reply never arrived");
    assert_eq!(client.unmatched_responses(), 1);
    assert_eq!(client.pending_count(), 0);

    worker.shutdown();
    task.await.expect("worker task panicked")?;
    Ok(())
}

#[tokio::test]
async fn unknown_reply_does_not_disturb_pending_call() -> Result<()> {
    // ---
    init_logging();
    let (_hub, worker_tp, client_tp) = hub_pair("stray").await;

    let worker = RpcWorker::new(worker_tp, DEFAULT_REQUEST_QUEUE, |payload: Bytes| async move {
        sleep(Duration::from_millis(50)).await;
        Ok(payload)
    });
    let task = worker.spawn();
    let client = client_on(client_tp.clone(), "stray").await;

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call(Bytes::from_static(b"real"), WAIT).await })
    };

    client_tp
        .publish(Envelope::response(
            client.reply_to().clone(),
            Bytes::from_static(b"junk"),
            "not-a-pending-id".into(),
        ))
        .await?;

    let reply = call.await.expect("call task panicked")?;

    assert_eq!(reply, Bytes::from_static(b"real"));
    assert_eq!(client.unmatched_responses(), 1);

    worker.shutdown();
    task.await.expect("worker task panicked")?;
    Ok(())
}

#[tokio::test]
async fn worker_processes_one_request_at_a_time() -> Result<()> {
    // ---
    // Arrange
    // ---
    init_logging();
    let (_hub, worker_tp, client_tp) = hub_pair("serial").await;

    let log = EventLog::default();
    let worker_tp = InstrumentedTransport::wrap(worker_tp, log.clone());

    let handler_log = log.clone();
    let worker = RpcWorker::new(worker_tp, DEFAULT_REQUEST_QUEUE, move |payload: Bytes| {
        let log = handler_log.clone();
        async move {
            log.push("start");
            sleep(Duration::from_millis(20)).await;
            log.push("end");
            Ok(payload)
        }
    });
    let task = worker.spawn();
    let client = client_on(client_tp, "serial").await;

    // ---
    // Act
    // ---
    let calls: Vec<_> = (0..3)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.call(Bytes::from(format!("{i}")), WAIT).await })
        })
        .collect();

    for call in calls {
        call.await.expect("call task panicked")?;
    }

    worker.shutdown();
    task.await.expect("worker task panicked")?;

    // ---
    // Assert: the next request starts only after the previous one is acked.
    // ---
    let events = log.events();
    let expected: Vec<String> = std::iter::repeat(["start", "end", "ack"])
        .take(3)
        .flatten()
        .map(String::from)
        .collect();
    assert_eq!(events, expected);
    Ok(())
}

#[tokio::test]
async fn processing_failure_rejects_and_worker_keeps_serving() -> Result<()> {
    // ---
    init_logging();
    let (hub, worker_tp, client_tp) = hub_pair("failure").await;

    let log = EventLog::default();
    let worker_tp = InstrumentedTransport::wrap(worker_tp, log.clone());

    let worker = RpcWorker::new(worker_tp, DEFAULT_REQUEST_QUEUE, |payload: Bytes| async move {
        if payload.as_ref() == b"fail" {
            return Err(RpcError::Processing("refusing to process".into()));
        }
        Ok(payload)
    });
    let task = worker.spawn();
    let client = client_on(client_tp, "failure").await;

    let failed = client
        .call(Bytes::from_static(b"fail"), Duration::from_millis(100))
        .await;
    assert!(matches!(failed, Err(RpcError::Timeout)), "got {failed:?}");

    let ok = client.call(Bytes::from_static(b"fine"), WAIT).await?;
    assert_eq!(ok, Bytes::from_static(b"fine"));

    worker.shutdown();
    task.await.expect("worker task panicked")?;

    // Rejected without requeue: nothing is left on the request queue.
    assert_eq!(hub.ready_count(DEFAULT_REQUEST_QUEUE), Some(0));
    assert_eq!(log.events(), vec!["nack requeue=false".to_string(), "ack".to_string()]);
    Ok(())
}

#[tokio::test]
async fn panicking_handler_is_rejected() -> Result<()> {
    // ---
    init_logging();
    let (_hub, worker_tp, client_tp) = hub_pair("panic").await;

    let log = EventLog::default();
    let worker_tp = InstrumentedTransport::wrap(worker_tp, log.clone());

    let worker = RpcWorker::new(worker_tp, DEFAULT_REQUEST_QUEUE, |payload: Bytes| async move {
        if payload.as_ref() == b"boom" {
            panic!("handler blew up");
        }
        Ok(payload)
    });
    let task = worker.spawn();
    let client = client_on(client_tp, "panic").await;

    let failed = client
        .call(Bytes::from_static(b"boom"), Duration::from_millis(100))
        .await;
    assert!(matches!(failed, Err(RpcError::Timeout)));

    let ok = client.call(Bytes::from_static(b"calm"), WAIT).await?;
    assert_eq!(ok, Bytes::from_static(b"calm"));

    worker.shutdown();
    task.await.expect("worker task panicked")?;

    assert_eq!(log.events(), vec!["nack requeue=false".to_string(), "ack".to_string()]);
    Ok(())
}

#[tokio::test]
async fn handler_panicking_before_its_future_is_rejected() -> Result<()> {
    // ---
    init_logging();
    let (_hub, worker_tp, client_tp) = hub_pair("syncpanic").await;

    let log = EventLog::default();
    let worker_tp = InstrumentedTransport::wrap(worker_tp, log.clone());

    let worker = RpcWorker::new(worker_tp, DEFAULT_REQUEST_QUEUE, |payload: Bytes| {
        if payload.as_ref() == b"boom" {
            panic!("handler blew up while building its future");
        }
        async move { Ok(payload) }
    });
    let task = worker.spawn();
    let client = client_on(client_tp, "syncpanic").await;

    let failed = client
        .call(Bytes::from_static(b"boom"), Duration::from_millis(100))
        .await;
    assert!(matches!(failed, Err(RpcError::Timeout)));

    let ok = client.call(Bytes::from_static(b"calm"), WAIT).await?;
    assert_eq!(ok, Bytes::from_static(b"calm"));

    worker.shutdown();
    task.await.expect("worker task panicked")?;

    assert_eq!(log.events(), vec!["nack requeue=false".to_string(), "ack".to_string()]);
    Ok(())
}

#[tokio::test]
async fn second_run_on_same_worker_is_refused() -> Result<()> {
    // ---
    // Arrange
    // ---
    init_logging();
    let (_hub, worker_tp, client_tp) = hub_pair("tworuns").await;

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let worker = {
        let active = active.clone();
        let peak = peak.clone();
        RpcWorker::new(worker_tp, DEFAULT_REQUEST_QUEUE, move |payload: Bytes| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(payload)
            }
        })
    };

    // ---
    // Act
    // ---
    let task = worker.spawn();
    sleep(Duration::from_millis(20)).await;

    let second = worker.clone().spawn();
    let refused = timeout(WAIT, second)
        .await
        .expect("second run did not return")
        .expect("worker task panicked");

    let client = client_on(client_tp, "tworuns").await;
    let calls: Vec<_> = (0..4)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.call(Bytes::from(format!("{i}")), WAIT).await })
        })
        .collect();
    for call in calls {
        call.await.expect("call task panicked")?;
    }

    // ---
    // Assert
    // ---
    assert!(matches!(refused, Err(RpcError::Transport(_))), "got {refused:?}");
    assert_eq!(peak.load(Ordering::SeqCst), 1);

    worker.shutdown();
    task.await.expect("worker task panicked")?;
    Ok(())
}

#[tokio::test]
async fn worker_can_run_again_after_shutdown() -> Result<()> {
    // ---
    init_logging();
    let (_hub, worker_tp, _client_tp) = hub_pair("rerun").await;
    let worker = echo_worker(worker_tp);

    let first = worker.spawn();
    sleep(Duration::from_millis(10)).await;
    worker.shutdown();
    first.await.expect("worker task panicked")?;

    // The running slot is released; the shutdown flag still stops it at once.
    let second = timeout(WAIT, worker.run()).await.expect("second run hung");
    assert!(second.is_ok(), "got {second:?}");
    Ok(())
}

#[tokio::test]
async fn request_without_reply_to_is_rejected() -> Result<()> {
    // ---
    init_logging();
    let (hub, worker_tp, producer_tp) = hub_pair("noreply").await;

    let log = EventLog::default();
    let worker_tp = InstrumentedTransport::wrap(worker_tp, log.clone());
    let worker = echo_worker(worker_tp.clone());

    worker_tp.declare_queue(DEFAULT_REQUEST_QUEUE, true).await?;
    let task = worker.spawn();

    producer_tp
        .publish(Envelope::response(
            Address::from(DEFAULT_REQUEST_QUEUE),
            Bytes::from_static(b"orphan"),
            "id-without-reply-to".into(),
        ))
        .await?;

    let rejected = timeout(WAIT, async {
        while log.events().is_empty() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(rejected.is_ok(), "request was never settled");
    assert_eq!(log.events(), vec!["nack requeue=false".to_string()]);
    assert_eq!(hub.ready_count(DEFAULT_REQUEST_QUEUE), Some(0));

    worker.shutdown();
    task.await.expect("worker task panicked")?;
    Ok(())
}

#[tokio::test]
async fn publish_failure_leaves_no_pending_entry() -> Result<()> {
    // ---
    init_logging();
    let (_hub, _worker_tp, client_tp) = hub_pair("pubfail").await;

    let client_tp = InstrumentedTransport::failing_publish(client_tp);
    let client = client_on(client_tp, "pubfail").await;

    let result = client.call(Bytes::from_static(b"lost"), WAIT).await;

    assert!(matches!(result, Err(RpcError::Publish(_))), "got {result:?}");
    assert_eq!(client.pending_count(), 0);
    Ok(())
}

#[tokio::test]
async fn dropped_call_future_leaves_no_pending_entry() -> Result<()> {
    // ---
    init_logging();
    let (_hub, _worker_tp, client_tp) = hub_pair("dropped").await;
    let client = client_on(client_tp, "dropped").await;

    // No worker: the call would wait for the full timeout.
    let outer = timeout(
        Duration::from_millis(20),
        client.call(Bytes::from_static(b"abandon me"), WAIT),
    )
    .await;

    assert!(outer.is_err());
    assert_eq!(client.pending_count(), 0);
    Ok(())
}

#[tokio::test]
async fn worker_reports_connection_loss() -> Result<()> {
    // ---
    init_logging();
    let (_hub, worker_tp, _client_tp) = hub_pair("connlost").await;

    let worker = echo_worker(worker_tp.clone());
    let task = worker.spawn();

    // Let the worker subscribe before pulling the connection.
    sleep(Duration::from_millis(20)).await;
    worker_tp.close().await?;

    let result = timeout(WAIT, task)
        .await
        .expect("worker did not notice the closed connection")
        .expect("worker task panicked");

    assert!(matches!(result, Err(RpcError::ConnectionLost)), "got {result:?}");
    Ok(())
}

#[tokio::test]
async fn shutdown_stops_worker_cleanly() -> Result<()> {
    // ---
    init_logging();
    let (_hub, worker_tp, _client_tp) = hub_pair("shutdown").await;

    let worker = echo_worker(worker_tp);
    let task = worker.spawn();

    sleep(Duration::from_millis(10)).await;
    worker.shutdown();
    worker.shutdown();

    let result = timeout(WAIT, task)
        .await
        .expect("worker did not stop")
        .expect("worker task panicked");
    assert!(result.is_ok());
    Ok(())
}

#[tokio::test]
async fn client_shutdown_cancels_pending_calls() -> Result<()> {
    // ---
    init_logging();
    let (_hub, _worker_tp, client_tp) = hub_pair("cshutdown").await;
    let client = client_on(client_tp, "cshutdown").await;

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call(Bytes::from_static(b"waiting"), WAIT).await })
    };

    let registered = timeout(WAIT, async {
        while client.pending_count() == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(registered.is_ok());

    client.shutdown();
    client.shutdown();

    let result = call.await.expect("call task panicked");
    assert!(matches!(result, Err(RpcError::Cancelled)), "got {result:?}");
    assert_eq!(client.pending_count(), 0);
    Ok(())
}

#[tokio::test]
async fn lost_reply_queue_fails_pending_calls_with_connection_lost() -> Result<()> {
    // ---
    init_logging();
    let (_hub, _worker_tp, client_tp) = hub_pair("replylost").await;
    let client = client_on(client_tp.clone(), "replylost").await;

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call(Bytes::from_static(b"stranded"), WAIT).await })
    };

    let registered = timeout(WAIT, async {
        while client.pending_count() == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(registered.is_ok());

    client_tp.close().await?;

    let result = timeout(WAIT, call)
        .await
        .expect("pending call was not settled")
        .expect("call task panicked");
    assert!(matches!(result, Err(RpcError::ConnectionLost)), "got {result:?}");

    // Later calls fail fast with the same error instead of waiting out the deadline.
    let started = Instant::now();
    let again = client.call(Bytes::from_static(b"after"), WAIT).await;
    assert!(matches!(again, Err(RpcError::ConnectionLost)), "got {again:?}");
    assert!(started.elapsed() < WAIT);
    assert_eq!(client.pending_count(), 0);

    // A shutdown afterwards keeps reporting the connection loss.
    client.shutdown();
    let after_shutdown = client.call(Bytes::from_static(b"later"), WAIT).await;
    assert!(matches!(after_shutdown, Err(RpcError::ConnectionLost)));
    Ok(())
}

#[tokio::test]
async fn call_after_shutdown_fails_without_publishing() -> Result<()> {
    // ---
    // Arrange
    // ---
    init_logging();
    let (hub, _worker_tp, client_tp) = hub_pair("postshutdown").await;
    let client = client_on(client_tp, "postshutdown").await;

    // ---
    // Act
    // ---
    client.shutdown();

    let started = Instant::now();
    let result = client.call(Bytes::from_static(b"too late"), WAIT).await;

    // ---
    // Assert
    // ---
    assert!(matches!(result, Err(RpcError::Cancelled)), "got {result:?}");
    assert!(started.elapsed() < WAIT);
    assert_eq!(client.pending_count(), 0);
    // Nothing reached the request queue for a worker to process.
    assert_eq!(hub.ready_count(DEFAULT_REQUEST_QUEUE), Some(0));
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct AddRequest {
    a: i32,
    b: i32,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct AddResponse {
    sum: i32,
}

#[tokio::test]
async fn typed_json_round_trip() -> Result<()> {
    // ---
    init_logging();
    let (_hub, worker_tp, client_tp) = hub_pair("json").await;

    let worker = RpcWorker::json(worker_tp, "math", |req: AddRequest| async move {
        Ok(AddResponse { sum: req.a + req.b })
    });
    let task = worker.spawn();

    let config = RpcConfig::memory("json-client").with_request_queue("math");
    let client = RpcClient::with_transport(client_tp, &config).await?;

    let resp: AddResponse = client.request(&AddRequest { a: 2, b: 3 }, WAIT).await?;
    assert_eq!(resp, AddResponse { sum: 5 });

    worker.shutdown();
    task.await.expect("worker task panicked")?;
    Ok(())
}

#[tokio::test]
async fn competing_workers_share_the_request_queue() -> Result<()> {
    // ---
    init_logging();
    let (hub, first_tp, client_tp) = hub_pair("compete").await;
    let second_tp = create_memory_transport_with_hub(&RpcConfig::memory("compete-second"), hub.clone()).await?;

    let tag = |name: &'static str| {
        move |payload: Bytes| async move {
            sleep(Duration::from_millis(10)).await;
            let mut reply = payload.to_vec();
            reply.extend_from_slice(name.as_bytes());
            Ok::<_, RpcError>(Bytes::from(reply))
        }
    };

    let first = RpcWorker::new(first_tp, DEFAULT_REQUEST_QUEUE, tag(":first"));
    let second = RpcWorker::new(second_tp, DEFAULT_REQUEST_QUEUE, tag(":second"));
    let tasks = [first.spawn(), second.spawn()];

    sleep(Duration::from_millis(20)).await;
    let client = client_on(client_tp, "compete").await;

    let calls: Vec<_> = (0..6)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.call(Bytes::from(format!("{i}")), WAIT).await })
        })
        .collect();

    let mut served_by = HashMap::<&str, usize>::new();
    for call in calls {
        let reply = call.await.expect("call task panicked")?;
        let text = String::from_utf8(reply.to_vec()).expect("utf8");
        let who = if text.ends_with(":first") { "first" } else { "second" };
        *served_by.entry(who).or_default() += 1;
    }

    assert_eq!(served_by.values().sum::<usize>(), 6);
    assert!(served_by.len() == 2, "both workers should serve: {served_by:?}");

    first.shutdown();
    second.shutdown();
    for task in tasks {
        task.await.expect("worker task panicked")?;
    }
    Ok(())
}

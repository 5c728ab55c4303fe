//! End-to-end tests: several clients talking through one router.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use wshrpc_core::types::{command, CommandGetMetaData};
use wshrpc_core::{
    ErrorKind, Router, RouterOptions, RpcClient, RpcContext, RpcOpts, SubscriptionRequest,
    WaveEvent,
};

const WAIT: Duration = Duration::from_secs(2);

fn start_router() -> Arc<Router> {
    let router = Router::new(RouterOptions::default());
    router.start();
    router
}

async fn connected(router: &Arc<Router>, ctx: RpcContext) -> (RpcClient, String) {
    let client = RpcClient::new(router.connect_local().unwrap());
    let route = client.connect(ctx).await.unwrap();
    (client, route)
}

#[tokio::test]
async fn test_getmeta_fills_oref_from_caller_context() {
    let router = start_router();
    router
        .handlers()
        .register_call(command::GET_META, |_ctx, req: CommandGetMetaData| async move {
            anyhow::Ok(json!({"oref": req.oref.to_string(), "view": "term"}))
        });

    let (controller, _) = connected(&router, RpcContext::block_controller("b1")).await;
    let meta: Value = controller
        .call(command::GET_META, json!({}), RpcOpts::default())
        .await
        .unwrap();
    assert_eq!(meta, json!({"oref": "block:b1", "view": "term"}));

    // A caller-supplied reference wins over the context.
    let meta: Value = controller
        .call(command::GET_META, json!({"oref": "block:b9"}), RpcOpts::default())
        .await
        .unwrap();
    assert_eq!(meta["oref"], "block:b9");
}

#[tokio::test]
async fn test_call_forwarded_to_announced_route() {
    let router = start_router();
    let (server, server_route) = connected(&router, RpcContext::conn_server("ssh1")).await;
    server
        .handlers()
        .register_call(command::TEST, |ctx, v: Value| async move {
            anyhow::Ok(json!({"echo": v, "from": ctx.source}))
        });

    let (caller, caller_route) = connected(&router, RpcContext::default()).await;
    let reply: Value = caller
        .call(
            command::TEST,
            json!("ping"),
            RpcOpts::default().to_route(server_route),
        )
        .await
        .unwrap();
    assert_eq!(reply, json!({"echo": "ping", "from": caller_route}));

    // The alias reaches the same handler.
    let reply: Value = caller
        .call(command::TEST, json!(1), RpcOpts::default().to_route("conn:ssh1"))
        .await
        .unwrap();
    assert_eq!(reply["echo"], 1);
}

#[tokio::test]
async fn test_event_reaches_subscriber_only() {
    let router = start_router();
    let (subscriber, _) = connected(&router, RpcContext::default()).await;
    let (bystander, _) = connected(&router, RpcContext::default()).await;
    let (publisher, publisher_route) = connected(&router, RpcContext::default()).await;

    let mut sub_events = subscriber.subscribe_local("blockclose");
    let mut other_events = bystander.subscribe_local("blockclose");
    subscriber
        .subscribe(&SubscriptionRequest::scoped("blockclose", ["b1"]))
        .await
        .unwrap();

    publisher
        .publish_event(
            &WaveEvent::new("blockclose")
                .with_scopes(["b1"])
                .with_persist(1),
        )
        .await
        .unwrap();

    let event = timeout(WAIT, sub_events.recv()).await.unwrap().unwrap();
    assert_eq!(event.event, "blockclose");
    assert_eq!(event.scopes, vec!["b1"]);
    assert_eq!(event.sender, publisher_route);

    assert!(timeout(Duration::from_millis(100), other_events.recv())
        .await
        .is_err());

    let history = bystander.read_history("blockclose", "b1", 10).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_unsubscribed_route_stops_receiving() {
    let router = start_router();
    let (subscriber, _) = connected(&router, RpcContext::default()).await;
    let mut events = subscriber.subscribe_local("connchange");
    subscriber
        .subscribe(&SubscriptionRequest::all("connchange"))
        .await
        .unwrap();
    subscriber.unsubscribe("connchange").await.unwrap();

    let report = router.publish(&WaveEvent::new("connchange").with_scopes(["ssh1"]));
    assert_eq!(report.delivered, 0);
    assert!(timeout(Duration::from_millis(100), events.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_call_times_out() {
    let router = start_router();
    router
        .handlers()
        .register_call("hang", |ctx, _v: Value| async move {
            ctx.cancel.cancelled().await;
            anyhow::Ok(())
        });
    let (client, _) = connected(&router, RpcContext::default()).await;

    let started = Instant::now();
    let err = client
        .call::<Value>(
            "hang",
            Value::Null,
            RpcOpts::default().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.kind(), ErrorKind::TimedOut);
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < WAIT);
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_response_stream_cancel_stops_handler() {
    let router = start_router();
    let (producer, producer_route) = connected(&router, RpcContext::default()).await;
    let stopped = Arc::new(AtomicBool::new(false));
    let flag = stopped.clone();
    producer
        .handlers()
        .register_response_stream(command::STREAM_TEST, move |_ctx, _v: Value, sink| {
            let flag = flag.clone();
            async move {
                let mut i = 0u64;
                while sink.send(i).await.is_ok() {
                    i += 1;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                flag.store(true, Ordering::SeqCst);
                anyhow::Ok(())
            }
        });

    let (consumer, _) = connected(&router, RpcContext::default()).await;
    let mut stream = consumer
        .response_stream(
            command::STREAM_TEST,
            Value::Null,
            RpcOpts::default().to_route(producer_route),
        )
        .await
        .unwrap();

    for expected in 0..3u64 {
        let item: u64 = timeout(WAIT, stream.recv_as())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(item, expected);
    }
    stream.cancel();
    assert!(stream.recv().await.is_none());

    timeout(WAIT, async {
        while !stopped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(consumer.pending_calls(), 0);
}

#[tokio::test]
async fn test_response_stream_reports_errors_then_closes() {
    let router = start_router();
    router
        .handlers()
        .register_response_stream("countdown", |_ctx, n: u32, sink| async move {
            for i in (1..=n).rev() {
                sink.send(i).await?;
            }
            sink.send_error("liftoff aborted").await?;
            anyhow::Ok(())
        });
    let (client, _) = connected(&router, RpcContext::default()).await;

    let mut stream = client
        .response_stream("countdown", 2u32, RpcOpts::default())
        .await
        .unwrap();
    assert_eq!(stream.recv().await.unwrap().unwrap(), json!(2));
    assert_eq!(stream.recv().await.unwrap().unwrap(), json!(1));
    let err = stream.recv().await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandlerError);
    assert!(stream.recv().await.is_none());
}

#[tokio::test]
async fn test_missing_route_fails_fast() {
    let router = start_router();
    let (client, _) = connected(&router, RpcContext::default()).await;
    let err = client
        .call::<Value>(
            command::TEST,
            Value::Null,
            RpcOpts::default().to_route("controller:nope"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RouteNotFound);
}

#[tokio::test]
async fn test_streaming_request_sums_fragments() {
    let router = start_router();
    let (server, server_route) = connected(&router, RpcContext::default()).await;
    server
        .handlers()
        .register_streaming_request("sum", |_ctx, start: i64, mut requests| async move {
            let mut total = start;
            while let Some(item) = requests.recv_as::<i64>().await {
                total += item?;
            }
            anyhow::Ok(total)
        });

    let (client, _) = connected(&router, RpcContext::default()).await;
    let mut call = client
        .streaming_request("sum", 10i64, RpcOpts::default().to_route(server_route))
        .await
        .unwrap();
    for n in [1i64, 2, 3] {
        call.send(n).await.unwrap();
    }
    let total = call.finish().await.unwrap();
    assert_eq!(total, json!(16));
}

#[tokio::test]
async fn test_complex_call_echoes_each_fragment() {
    let router = start_router();
    router.handlers().register_complex(
        "upper",
        |_ctx, _v: Value, mut requests, sink| async move {
            while let Some(item) = requests.recv_as::<String>().await {
                sink.send(item?.to_uppercase()).await?;
            }
            anyhow::Ok(())
        },
    );
    let (client, _) = connected(&router, RpcContext::default()).await;

    let mut call = client
        .complex("upper", Value::Null, RpcOpts::default())
        .await
        .unwrap();
    call.requests.send("ab").await.unwrap();
    assert_eq!(call.responses.recv().await.unwrap().unwrap(), json!("AB"));
    call.requests.send("cd").await.unwrap();
    assert_eq!(call.responses.recv().await.unwrap().unwrap(), json!("CD"));
    call.requests.close().await.unwrap();
    assert!(timeout(WAIT, call.responses.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_complex_response_side_closes_before_request_side() {
    let router = start_router();
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<String>>();
    router.handlers().register_complex(
        "drain",
        move |_ctx, _v: Value, mut requests, sink| {
            let seen_tx = seen_tx.clone();
            async move {
                sink.send("ready").await?;
                drop(sink);
                let mut seen = Vec::new();
                while let Some(item) = requests.recv_as::<String>().await {
                    seen.push(item?);
                }
                let _ = seen_tx.send(seen);
                anyhow::Ok(())
            }
        },
    );
    let (client, _) = connected(&router, RpcContext::default()).await;

    let mut call = client
        .complex("drain", Value::Null, RpcOpts::default())
        .await
        .unwrap();
    assert_eq!(call.responses.recv().await.unwrap().unwrap(), json!("ready"));
    assert!(timeout(WAIT, call.responses.recv()).await.unwrap().is_none());
    assert!(!call.requests.is_closed());

    call.requests.send("late").await.unwrap();
    call.requests.close().await.unwrap();
    let seen = timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap();
    assert_eq!(seen, vec!["late"]);
}

#[tokio::test]
async fn test_disconnect_releases_routes_and_subscriptions() {
    let router = start_router();
    let (client, route) = connected(&router, RpcContext::block_controller("b7")).await;
    client
        .subscribe(&SubscriptionRequest::all("blockclose"))
        .await
        .unwrap();
    assert!(router.routes().contains("controller:b7"));

    drop(client);
    timeout(WAIT, async {
        while router.routes().contains(&route) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(!router.routes().contains("controller:b7"));
    assert!(router.events().subscriptions_of(&route).is_empty());
}

#[tokio::test]
async fn test_tcp_round_trip() {
    let router = start_router();
    router
        .handlers()
        .register_call(command::TEST, |_ctx, v: Value| async move { anyhow::Ok(v) });
    let mut server = router
        .serve_tcp("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let client = RpcClient::connect_tcp(server.addr()).await.unwrap();
    let route = client.connect(RpcContext::default()).await.unwrap();
    assert!(route.starts_with("proc:"));

    let reply: Value = client
        .call(command::TEST, json!({"n": 42}), RpcOpts::default())
        .await
        .unwrap();
    assert_eq!(reply, json!({"n": 42}));

    server.shutdown();
    router.stop();
}

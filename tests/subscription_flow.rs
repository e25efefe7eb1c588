//! End-to-end subscription tests over real websockets.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use common::{eventually, params, start_server, start_server_with};
use live_sync::client::{ClientError, LoadError, Payload};
use live_sync::config::LiveSyncConfig;
use live_sync::middleware::{Flow, MiddlewareContext, MiddlewareError, Next};
use live_sync::routing::{Params, RouteMatch};
use live_sync::server::{stream, StreamHandler, SubscriptionSink, EVENT_CLOSE, EVENT_CONNECTION};
use live_sync::Snapshot;

async fn hold_open(sink: SubscriptionSink) {
    sink.closed().await;
}

#[tokio::test]
async fn test_room_updates_reach_cache_and_subscribers_in_order() {
    let seen_params: Arc<Mutex<Option<Params>>> = Arc::new(Mutex::new(None));
    let record = Arc::clone(&seen_params);
    let server = start_server(move |builder| {
        builder
            .route(
                "/rooms/:id",
                stream(move |sink: SubscriptionSink| {
                    let record = Arc::clone(&record);
                    async move {
                        *record.lock().unwrap() = Some(sink.route().params.clone());
                        sink.send(&json!({ "users": 3 })).unwrap();
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        sink.send(&json!({ "users": 4 })).unwrap();
                        sink.closed().await;
                    }
                }),
            )
            .unwrap()
    })
    .await;

    let client = server.client();
    let room = params(&[("id", "42")]);
    let path = client.preload_subscription("/rooms/:id", &room).unwrap();
    assert_eq!(path, "/rooms/42");
    assert!(matches!(
        client.use_subscription("/rooms/:id", &room).unwrap(),
        Snapshot::Pending(_)
    ));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = client
        .subscribe(&path, move |payload: &Payload| {
            let _ = tx.send(payload.clone());
        })
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, Payload::Data(json!({ "users": 3 })));
    assert_eq!(
        client.use_subscription("/rooms/:id", &room).unwrap().value(),
        Some(&json!({ "users": 3 }))
    );

    let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second, Payload::Data(json!({ "users": 4 })));
    assert_eq!(
        client.use_subscription("/rooms/:id", &room).unwrap().value(),
        Some(&json!({ "users": 4 }))
    );

    assert_eq!(
        seen_params.lock().unwrap().clone(),
        Some(params(&[("id", "42")]))
    );
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unmatched_path_closes_with_policy_violation() {
    let server = start_server(|builder| builder.route("/rooms/:id", stream(hold_open)).unwrap()).await;
    let client = server.client();

    client.load("/users/1");
    assert_eq!(
        client.resolve("/users/1").await,
        Err(ClientError::Load {
            path: "/users/1".into(),
            source: LoadError::Closed(1008)
        })
    );
    assert_eq!(client.is_stale("/users/1"), Some(true));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_first_registered_route_wins() {
    let server = start_server(|builder| {
        builder
            .route(
                "/users/:id",
                stream(|sink: SubscriptionSink| async move {
                    let _ = sink.send(&json!({ "route": "by-id", "id": sink.param::<String>("id") }));
                    sink.closed().await;
                }),
            )
            .unwrap()
            .route(
                "/users/active",
                stream(|sink: SubscriptionSink| async move {
                    let _ = sink.send(&json!({ "route": "active" }));
                    sink.closed().await;
                }),
            )
            .unwrap()
    })
    .await;
    let client = server.client();

    client.load("/users/active");
    assert_eq!(
        client.resolve("/users/active").await.unwrap(),
        json!({ "route": "by-id", "id": "active" })
    );
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_optional_segment_over_the_wire() {
    let server = start_server(|builder| {
        builder
            .route(
                "/feed{/:page}",
                stream(|sink: SubscriptionSink| async move {
                    let page = sink.param::<u32>("page").unwrap_or(1);
                    let _ = sink.send(&json!({ "page": page }));
                    sink.closed().await;
                }),
            )
            .unwrap()
    })
    .await;
    let client = server.client();

    let first = client.preload_subscription("/feed{/:page}", &Params::new()).unwrap();
    let second = client
        .preload_subscription("/feed{/:page}", &params(&[("page", "2")]))
        .unwrap();
    assert_eq!(first, "/feed");
    assert_eq!(second, "/feed/2");

    assert_eq!(client.resolve(&first).await.unwrap(), json!({ "page": 1 }));
    assert_eq!(client.resolve(&second).await.unwrap(), json!({ "page": 2 }));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_middleware_short_circuit_skips_handler() {
    let opened = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&opened);
    let server = start_server(move |builder| {
        builder
            .middleware(|ctx: MiddlewareContext, next: Next| async move {
                let private = matches!(
                    &ctx,
                    MiddlewareContext::Route(route) if route.path.starts_with("/private")
                );
                if private {
                    return Ok(Flow::Halt);
                }
                next.run(ctx).await
            })
            .route(
                "/private/:id",
                stream(move |sink: SubscriptionSink| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    hold_open(sink)
                }),
            )
            .unwrap()
    })
    .await;
    let client = server.client();

    client.load("/private/1");
    assert_eq!(
        client.resolve("/private/1").await,
        Err(ClientError::Load {
            path: "/private/1".into(),
            source: LoadError::Closed(1008)
        })
    );
    assert_eq!(opened.load(Ordering::SeqCst), 0);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_middleware_error_fails_connection() {
    let server = start_server(|builder| {
        builder
            .middleware(|ctx: MiddlewareContext, next: Next| async move {
                if matches!(ctx, MiddlewareContext::Route(_)) {
                    return Err(MiddlewareError::Failed("lookup failed".into()));
                }
                next.run(ctx).await
            })
            .route("/rooms/:id", stream(hold_open))
            .unwrap()
    })
    .await;
    let client = server.client();

    client.load("/rooms/1");
    assert_eq!(
        client.resolve("/rooms/1").await,
        Err(ClientError::Load {
            path: "/rooms/1".into(),
            source: LoadError::Closed(1011)
        })
    );
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_middleware_panic_closes_with_internal_error() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    let (counter, closed) = (Arc::clone(&attempts), Arc::clone(&closes));
    let server = start_server(move |builder| {
        builder
            .middleware(move |ctx: MiddlewareContext, next: Next| {
                let counter = Arc::clone(&counter);
                async move {
                    if matches!(ctx, MiddlewareContext::Route(_)) {
                        counter.fetch_add(1, Ordering::SeqCst);
                        panic!("room lookup exploded");
                    }
                    next.run(ctx).await
                }
            })
            .on(EVENT_CLOSE, move |_| {
                closed.fetch_add(1, Ordering::SeqCst);
            })
            .route("/rooms/:id", stream(hold_open))
            .unwrap()
    })
    .await;
    let client = server.client();

    client.load("/rooms/1");
    assert_eq!(
        client.resolve("/rooms/1").await,
        Err(ClientError::Load {
            path: "/rooms/1".into(),
            source: LoadError::Closed(1011)
        })
    );
    assert_eq!(client.is_stale("/rooms/1"), Some(true));
    assert!(eventually(|| closes.load(Ordering::SeqCst) == 1).await);

    // A 1011 closure is not retried.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(eventually(|| server.tracker.active_count() == 0).await);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_middleware_params_reach_handler() {
    let server = start_server(|builder| {
        builder
            .middleware(|mut ctx: MiddlewareContext, next: Next| async move {
                if let MiddlewareContext::Route(route) = &mut ctx {
                    route.params.insert("tenant".into(), "acme".into());
                }
                next.run(ctx).await
            })
            .route(
                "/rooms/:id",
                stream(|sink: SubscriptionSink| async move {
                    let _ = sink.send(&sink.route().params);
                    sink.closed().await;
                }),
            )
            .unwrap()
    })
    .await;
    let client = server.client();

    client.load("/rooms/9");
    assert_eq!(
        client.resolve("/rooms/9").await.unwrap(),
        json!({ "id": "9", "tenant": "acme" })
    );
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_handler_rejection_and_error_payloads() {
    let server = start_server(|builder| {
        builder
            .route("/closed/:id", |_route: &RouteMatch| None::<StreamHandler>)
            .unwrap()
            .route(
                "/broken/:id",
                stream(|sink: SubscriptionSink| async move {
                    let _ = sink.send_error("room unavailable");
                    sink.closed().await;
                }),
            )
            .unwrap()
    })
    .await;
    let client = server.client();

    client.load("/closed/1");
    assert!(matches!(
        client.resolve("/closed/1").await,
        Err(ClientError::Load {
            source: LoadError::Closed(1008),
            ..
        })
    ));

    client.load("/broken/1");
    assert_eq!(
        client.resolve("/broken/1").await,
        Err(ClientError::Payload {
            path: "/broken/1".into(),
            detail: "room unavailable".into()
        })
    );
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_lifecycle_events_reach_listeners() {
    let connections = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    let (opened, closed) = (Arc::clone(&connections), Arc::clone(&closes));
    let server = start_server(move |builder| {
        builder
            .on(EVENT_CONNECTION, move |_| {
                opened.fetch_add(1, Ordering::SeqCst);
            })
            .on(EVENT_CLOSE, move |_| {
                closed.fetch_add(1, Ordering::SeqCst);
            })
            .route(
                "/rooms/:id",
                stream(|sink: SubscriptionSink| async move {
                    let _ = sink.send(&json!({ "users": 1 }));
                    sink.closed().await;
                }),
            )
            .unwrap()
    })
    .await;
    let client = server.client();

    client.load("/rooms/1");
    client.resolve("/rooms/1").await.unwrap();
    assert_eq!(connections.load(Ordering::SeqCst), 1);
    assert_eq!(server.tracker.active_count(), 1);

    client.invalidate("/rooms/1");
    assert!(eventually(|| closes.load(Ordering::SeqCst) == 1).await);
    assert!(eventually(|| server.tracker.active_count() == 0).await);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_connection_limit_rejects_upgrade() {
    let mut config = LiveSyncConfig::default();
    config.listener.max_connections = 1;
    let server = start_server_with(config, |builder| {
        builder
            .route(
                "/rooms/:id",
                stream(|sink: SubscriptionSink| async move {
                    let _ = sink.send(&json!({ "ok": true }));
                    sink.closed().await;
                }),
            )
            .unwrap()
    })
    .await;
    let client = server.client();

    client.load("/rooms/1");
    client.resolve("/rooms/1").await.unwrap();

    client.load("/rooms/2");
    assert!(matches!(
        client.resolve("/rooms/2").await,
        Err(ClientError::Load {
            source: LoadError::Connection(_),
            ..
        })
    ));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_subscriptions_and_marks_stale() {
    let server = start_server(|builder| {
        builder
            .route(
                "/rooms/:id",
                stream(|sink: SubscriptionSink| async move {
                    let _ = sink.send(&json!({ "users": 2 }));
                    sink.closed().await;
                }),
            )
            .unwrap()
    })
    .await;
    let client = server.client();

    client.load("/rooms/1");
    client.resolve("/rooms/1").await.unwrap();

    let tracker = server.tracker.clone();
    server.stop().await.unwrap();
    assert_eq!(tracker.active_count(), 0);
    assert!(eventually(|| client.is_stale("/rooms/1") == Some(true)).await);
    assert!(client.cached("/rooms/1").is_none());
}

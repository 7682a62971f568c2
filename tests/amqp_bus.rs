//! RPC and event integration tests using testcontainers.
//!
//! These tests spin up RabbitMQ in a container. Run with:
//! cargo test --test amqp_bus -- --ignored --nocapture

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use protobus::{
    Bus, BusConfig, BusError, ConnectionEvent, ReconnectConfig, RetryOptions, ServiceDefinition,
    ServiceError, ServiceOptions,
};
use serde_json::json;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

/// Start RabbitMQ and return (container, amqp_url).
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    tokio::time::sleep(Duration::from_secs(2)).await;

    let host_port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");
    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    (container, format!("amqp://guest:guest@{}:{}", host, host_port))
}

fn test_config(url: &str) -> BusConfig {
    BusConfig {
        url: url.to_string(),
        reconnect: ReconnectConfig {
            max_retries: 20,
            initial_delay_ms: 200,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
        },
        ..BusConfig::default()
    }
}

const MATH_SCHEMA: &str = "service Math { rpc add(AddRequest) returns (AddResponse); }\n\
                           message AddRequest { int32 a = 1; int32 b = 2; }\n\
                           message AddResponse { int32 result = 1; }";

const FLAKY_SCHEMA: &str = "service Flaky { rpc poke(Poke) returns (Poke); }\n\
                            message Poke { string action = 1; }";

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_add_rpc_round_trip() {
    let (_container, url) = start_rabbitmq().await;
    let bus = Bus::connect(test_config(&url)).await.expect("connect");

    let math = ServiceDefinition::new("Math")
        .schema_text(MATH_SCHEMA)
        .method_fn("add", |request, _ctx| async move {
            let a = request["a"].as_i64().unwrap_or(0);
            let b = request["b"].as_i64().unwrap_or(0);
            Ok(json!({ "result": a + b }))
        });
    let _host = bus.serve(math).await.expect("serve");

    let proxy = bus.proxy("Math").expect("proxy");
    let response = proxy
        .call("add", &json!({"a": 1, "b": 2}), Some("tester"))
        .await
        .expect("call");
    assert_eq!(response, json!({"result": 3}));

    bus.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_handled_error_is_not_retried() {
    let (_container, url) = start_rabbitmq().await;
    let bus = Bus::connect(test_config(&url)).await.expect("connect");

    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);
    let flaky = ServiceDefinition::new("Flaky")
        .schema_text(FLAKY_SCHEMA)
        .options(ServiceOptions {
            max_concurrent: Some(1),
            retry: Some(RetryOptions {
                max_retries: 3,
                retry_delay_ms: 100,
                message_ttl_ms: None,
            }),
        })
        .method_fn("poke", move |_request, _ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<serde_json::Value, _>(ServiceError::handled("VALIDATION_ERROR", "bad"))
            }
        });
    let _host = bus.serve(flaky).await.expect("serve");

    let proxy = bus.proxy("Flaky").expect("proxy");
    let err = proxy
        .call("poke", &json!({"action": "handled_error"}), None)
        .await
        .expect_err("handled error expected");
    match err {
        BusError::Service {
            code, handled, ..
        } => {
            assert_eq!(code, "VALIDATION_ERROR");
            assert!(handled);
        }
        other => panic!("unexpected error {:?}", other),
    }

    // Give any stray retry time to fire, then confirm there was none.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    bus.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_unhandled_error_retries_then_recovers() {
    let (_container, url) = start_rabbitmq().await;
    let bus = Bus::connect(test_config(&url)).await.expect("connect");

    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);
    let flaky = ServiceDefinition::new("Flaky")
        .schema_text(FLAKY_SCHEMA)
        .options(ServiceOptions {
            max_concurrent: Some(1),
            retry: Some(RetryOptions {
                max_retries: 3,
                retry_delay_ms: 100,
                message_ttl_ms: None,
            }),
        })
        .method_fn("poke", move |_request, _ctx| {
            let counter = Arc::clone(&counter);
            async move {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(ServiceError::internal("transient"))
                } else {
                    Ok(json!({"action": "recovered"}))
                }
            }
        });
    let _host = bus.serve(flaky).await.expect("serve");

    let proxy = bus.proxy("Flaky").expect("proxy");
    let response = proxy
        .call("poke", &json!({"action": "retry_me"}), None)
        .await
        .expect("eventual success");
    assert_eq!(response["action"], "recovered");

    let total = invocations.load(Ordering::SeqCst);
    assert!(total == 3, "expected 3 invocations, saw {}", total);

    bus.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_exhausted_retries_land_in_dlq() {
    let (_container, url) = start_rabbitmq().await;
    let bus = Bus::connect(test_config(&url)).await.expect("connect");

    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);
    let flaky = ServiceDefinition::new("Flaky")
        .schema_text(FLAKY_SCHEMA)
        .options(ServiceOptions {
            max_concurrent: Some(1),
            retry: Some(RetryOptions {
                max_retries: 3,
                retry_delay_ms: 100,
                message_ttl_ms: None,
            }),
        })
        .method_fn("poke", move |_request, _ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<serde_json::Value, _>(ServiceError::internal("always broken"))
            }
        });
    let _host = bus.serve(flaky).await.expect("serve");

    // Fire and forget; the caller is not part of this scenario.
    let body = bus
        .codec()
        .encode_request("Flaky.poke", &json!({"action": "explode"}), "")
        .expect("encode");
    bus.rpc()
        .publish(&body, "REQUEST.Flaky.poke")
        .await
        .expect("publish");

    // 1 initial + 3 retries at 100ms spacing, then the DLQ hop.
    let channel = bus.connection().open_channel().await.expect("channel");
    let mut dead_letter = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(message) = channel
            .basic_get("Flaky.DLQ", lapin::options::BasicGetOptions::default())
            .await
            .expect("basic_get")
        {
            dead_letter = Some(message);
            break;
        }
    }
    let dead_letter = dead_letter.expect("message in DLQ");
    assert_eq!(invocations.load(Ordering::SeqCst), 4);

    let headers = dead_letter
        .delivery
        .properties
        .headers()
        .as_ref()
        .expect("dlq headers")
        .inner();
    match headers.get("x-retry-count") {
        Some(lapin::types::AMQPValue::LongUInt(count)) => assert_eq!(*count, 3),
        other => panic!("unexpected x-retry-count {:?}", other),
    }
    match headers.get("x-original-routing-key") {
        Some(lapin::types::AMQPValue::LongString(key)) => {
            assert_eq!(key.as_bytes(), b"REQUEST.Flaky.poke")
        }
        other => panic!("unexpected x-original-routing-key {:?}", other),
    }
    assert!(headers.get("x-original-queue").is_some());
    assert!(headers.get("x-dlq-time").is_some());

    bus.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_event_fanout_through_router() {
    let (_container, url) = start_rabbitmq().await;
    let bus = Bus::connect(test_config(&url)).await.expect("connect");

    let orange_hits = Arc::new(AtomicUsize::new(0));
    let rabbit_hits = Arc::new(AtomicUsize::new(0));

    let orange_counter = Arc::clone(&orange_hits);
    let rabbit_counter_a = Arc::clone(&rabbit_hits);
    let rabbit_counter_b = Arc::clone(&rabbit_hits);

    let zoo = ServiceDefinition::new("Zoo")
        .schema_text(
            "service Zoo { rpc noop(Sighting) returns (Sighting); }\n\
             message Sighting { string animal = 1; }",
        )
        .on_event_fn("*.orange.*", move |_payload, _ty, _topic| {
            let counter = Arc::clone(&orange_counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .on_event_fn("*.*.rabbit", move |_payload, _ty, _topic| {
            let counter = Arc::clone(&rabbit_counter_a);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .on_event_fn("lazy.#", move |_payload, _ty, _topic| {
            let counter = Arc::clone(&rabbit_counter_b);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
    let _host = bus.serve(zoo).await.expect("serve");

    tokio::time::sleep(Duration::from_millis(200)).await;
    bus.events()
        .publish(
            "Sighting",
            &json!({"animal": "rabbit"}),
            Some("quick.orange.rabbit"),
        )
        .await
        .expect("publish");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(orange_hits.load(Ordering::SeqCst), 1);
    assert_eq!(rabbit_hits.load(Ordering::SeqCst), 1);

    bus.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_reconnect_rebinds_and_resumes() {
    let (container, url) = start_rabbitmq().await;
    let bus = Bus::connect(test_config(&url)).await.expect("connect");

    let math = ServiceDefinition::new("Math")
        .schema_text(MATH_SCHEMA)
        .method_fn("add", |request, _ctx| async move {
            let a = request["a"].as_i64().unwrap_or(0);
            let b = request["b"].as_i64().unwrap_or(0);
            Ok(json!({ "result": a + b }))
        });
    let _host = bus.serve(math).await.expect("serve");

    let proxy = bus.proxy("Math").expect("proxy");
    let response = proxy
        .call("add", &json!({"a": 2, "b": 3}), None)
        .await
        .expect("call before restart");
    assert_eq!(response["result"], 5);

    let mut events = bus.connection().subscribe();
    container.stop().await.expect("stop rabbitmq");
    container.start().await.expect("restart rabbitmq");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    let mut reconnected = false;
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(ConnectionEvent::Reconnected)) => {
                reconnected = true;
                break;
            }
            Ok(_) => continue,
            Err(_) => continue,
        }
    }
    assert!(reconnected, "no Reconnected event observed");

    // Consumers re-bind asynchronously after the event.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let response = proxy
        .call("add", &json!({"a": 20, "b": 30}), None)
        .await
        .expect("call after restart");
    assert_eq!(response["result"], 50);

    bus.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_bigint_payload_over_the_wire() {
    let (_container, url) = start_rabbitmq().await;
    let bus = Bus::connect(test_config(&url)).await.expect("connect");

    let ledger = ServiceDefinition::new("Ledger")
        .schema_text(
            "service Ledger { rpc burn(Burn) returns (Burn); }\n\
             message Burn { bigint amount = 1; }",
        )
        .method_fn("burn", |request, _ctx| async move { Ok(request) });
    let _host = bus.serve(ledger).await.expect("serve");

    let max = "115792089237316195423570985008687907853269984665640564039457584007913129639935";
    let proxy = bus.proxy("Ledger").expect("proxy");
    let response = proxy
        .call("burn", &json!({ "amount": max }), None)
        .await
        .expect("call");
    assert_eq!(response["amount"], json!(max));

    bus.shutdown().await;
}

//! End-to-end facade tests
//!
//! Exercises the assembled core the way an application would:
//! command/query dispatch, event fan-out, inbox dedup, outbox
//! store-and-forward, queue ordering, and the circuit breaker.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mc_common::{
    CommandMessage, CoreConfig, EnqueueOptions, Envelope, EventMessage, InboxOptions,
    MercuryError, OutboxOptions, ProcessingConfig, ProcessingContext, QueryMessage, Result,
};
use mc_dispatch::{CommandHandler, EventHandler, QueryHandler};
use mc_outbox::OutboxProcessorConfig;
use mc_queue::QueueWorkerConfig;
use mc_runtime::{PollLoopConfig, WorkQueueConfig};
use mc_sdk::{Mercury, MercuryBuilder};
use serde::{Deserialize, Serialize};

// ============================================================================
// Test messages and handlers
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct CreateOrder {
    customer_id: String,
    amount: f64,
}

impl CommandMessage for CreateOrder {
    type Response = String;

    fn message_type() -> &'static str {
        "orders.create"
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GetOrderCount;

impl QueryMessage for GetOrderCount {
    type Response = u64;

    fn message_type() -> &'static str {
        "orders.count"
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OrderCreated {
    order_id: String,
}

impl EventMessage for OrderCreated {
    fn message_type() -> &'static str {
        "orders.created"
    }
}

struct CreateOrderHandler {
    invocations: Arc<AtomicU32>,
    fail: Arc<AtomicBool>,
}

#[async_trait]
impl CommandHandler<CreateOrder> for CreateOrderHandler {
    async fn handle(&self, _command: CreateOrder, _ctx: &ProcessingContext) -> Result<String> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(MercuryError::handler("order rejected"));
        }
        Ok("o1".to_string())
    }
}

struct OrderCountHandler {
    invocations: Arc<AtomicU32>,
}

#[async_trait]
impl QueryHandler<GetOrderCount> for OrderCountHandler {
    async fn handle(&self, _query: GetOrderCount, _ctx: &ProcessingContext) -> Result<u64> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(42)
    }
}

struct FanoutHandler {
    invocations: Arc<AtomicU32>,
    fail: bool,
}

#[async_trait]
impl EventHandler<OrderCreated> for FanoutHandler {
    async fn handle(&self, _event: OrderCreated, _ctx: &ProcessingContext) -> Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(MercuryError::handler("fanout handler exploded"))
        } else {
            Ok(())
        }
    }
}

fn fast_poll() -> PollLoopConfig {
    PollLoopConfig {
        idle_delay: Duration::from_millis(5),
        busy_delay: Duration::from_millis(1),
        error_delay: Duration::from_millis(5),
        work_queue: WorkQueueConfig::default(),
    }
}

fn no_retry_config() -> CoreConfig {
    CoreConfig {
        processing: ProcessingConfig {
            max_retries: 0,
            ..Default::default()
        },
    }
}

async fn basic_core(
    fail: Arc<AtomicBool>,
    invocations: Arc<AtomicU32>,
) -> Mercury {
    MercuryBuilder::new()
        .with_config(no_retry_config())
        .register_command::<CreateOrder, _>(CreateOrderHandler { invocations, fail })
        .unwrap()
        .build()
        .await
        .unwrap()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn command_dispatch_happy_path() {
    let invocations = Arc::new(AtomicU32::new(0));
    let core = basic_core(Arc::new(AtomicBool::new(false)), Arc::clone(&invocations)).await;

    let order_id = core
        .send_command(CreateOrder {
            customer_id: "c1".to_string(),
            amount: 9.99,
        })
        .await
        .unwrap();

    assert_eq!(order_id, "o1");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    let metrics = core.get_metrics().await.unwrap();
    assert_eq!(metrics.commands_sent, 1);
    assert_eq!(metrics.messages_handled, 1);
    assert_eq!(metrics.messages_failed, 0);

    core.shutdown().await.unwrap();
}

#[tokio::test]
async fn query_round_trip() {
    let invocations = Arc::new(AtomicU32::new(0));
    let core = MercuryBuilder::new()
        .with_config(no_retry_config())
        .register_query::<GetOrderCount, _>(OrderCountHandler {
            invocations: Arc::clone(&invocations),
        })
        .unwrap()
        .build()
        .await
        .unwrap();

    assert_eq!(core.send_query(GetOrderCount).await.unwrap(), 42);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    core.shutdown().await.unwrap();
}

#[tokio::test]
async fn event_fanout_with_one_failing_handler() {
    let first = Arc::new(AtomicU32::new(0));
    let second = Arc::new(AtomicU32::new(0));
    let third = Arc::new(AtomicU32::new(0));

    let core = MercuryBuilder::new()
        .with_config(no_retry_config())
        .register_event::<OrderCreated, _>(FanoutHandler {
            invocations: Arc::clone(&first),
            fail: false,
        })
        .register_event::<OrderCreated, _>(FanoutHandler {
            invocations: Arc::clone(&second),
            fail: true,
        })
        .register_event::<OrderCreated, _>(FanoutHandler {
            invocations: Arc::clone(&third),
            fail: false,
        })
        .build()
        .await
        .unwrap();

    let flags = core
        .publish_event(OrderCreated {
            order_id: "o1".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(flags, vec![true, false, true]);
    // No handler invocation was cancelled by the sibling failure.
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
    assert_eq!(third.load(Ordering::SeqCst), 1);

    core.shutdown().await.unwrap();
}

#[tokio::test]
async fn batch_send_reports_per_message_flags() {
    let invocations = Arc::new(AtomicU32::new(0));
    let fail = Arc::new(AtomicBool::new(false));
    let core = basic_core(Arc::clone(&fail), Arc::clone(&invocations)).await;

    let flags = core
        .send_batch(vec![
            CreateOrder {
                customer_id: "c1".to_string(),
                amount: 1.0,
            },
            CreateOrder {
                customer_id: "c2".to_string(),
                amount: 2.0,
            },
        ])
        .await
        .unwrap();
    assert_eq!(flags, vec![true, true]);

    core.shutdown().await.unwrap();
}

#[tokio::test]
async fn inbox_dedup_invokes_handler_once() {
    let invocations = Arc::new(AtomicU32::new(0));
    let core = basic_core(Arc::new(AtomicBool::new(false)), Arc::clone(&invocations)).await;

    let envelope = Envelope::command(&CreateOrder {
        customer_id: "c1".to_string(),
        amount: 9.99,
    })
    .unwrap();
    let options = InboxOptions::from_source("edi");

    let first = core
        .process_incoming(envelope.clone(), options.clone())
        .await
        .unwrap();
    assert!(first.is_success());

    // Identical (message_id, source): silent no-op.
    let second = core.process_incoming(envelope, options).await.unwrap();
    assert!(second.is_success());
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    core.shutdown().await.unwrap();
}

#[tokio::test]
async fn outbox_delivers_through_transport_to_consumer() {
    let core = MercuryBuilder::new()
        .with_config(no_retry_config())
        .with_outbox_config(OutboxProcessorConfig {
            batch_size: 10,
            lease_duration: Duration::from_secs(5),
            publish_parallelism: 2,
            poll: fast_poll(),
        })
        .build()
        .await
        .unwrap();

    let delivered = Arc::new(AtomicU32::new(0));
    {
        let delivered = Arc::clone(&delivered);
        core.transport()
            .subscribe(
                "order-events",
                mc_transport::contract::handler_fn(move |_envelope| {
                    let delivered = Arc::clone(&delivered);
                    async move {
                        delivered.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
                Default::default(),
            )
            .await
            .unwrap();
    }

    core.publish_to_outbox(
        OrderCreated {
            order_id: "o1".to_string(),
        },
        OutboxOptions::to_destination("order-events"),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 1);

    let metrics = core.get_metrics().await.unwrap();
    assert_eq!(metrics.outbox_pending, 0);

    core.shutdown().await.unwrap();
}

#[tokio::test]
async fn queue_respects_priority_and_delay() {
    let invocations = Arc::new(AtomicU32::new(0));
    let seen: Arc<parking_lot::Mutex<Vec<String>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));

    #[derive(Debug, Serialize, Deserialize)]
    struct Tagged {
        tag: String,
    }

    impl CommandMessage for Tagged {
        type Response = ();

        fn message_type() -> &'static str {
            "test.tagged"
        }
    }

    struct TaggedHandler {
        seen: Arc<parking_lot::Mutex<Vec<String>>>,
        invocations: Arc<AtomicU32>,
    }

    #[async_trait]
    impl CommandHandler<Tagged> for TaggedHandler {
        async fn handle(&self, command: Tagged, _ctx: &ProcessingContext) -> Result<()> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(command.tag);
            Ok(())
        }
    }

    let core = MercuryBuilder::new()
        .with_config(no_retry_config())
        .with_queue_config(QueueWorkerConfig {
            workers: 1,
            max_retries: 3,
            lease_duration: Duration::from_secs(5),
            batch_size: 10,
            poll: fast_poll(),
        })
        .register_command::<Tagged, _>(TaggedHandler {
            seen: Arc::clone(&seen),
            invocations: Arc::clone(&invocations),
        })
        .unwrap()
        .build()
        .await
        .unwrap();

    core.enqueue_command(
        Tagged {
            tag: "A".to_string(),
        },
        "work",
        EnqueueOptions::default(),
    )
    .await
    .unwrap();
    core.enqueue_command(
        Tagged {
            tag: "B".to_string(),
        },
        "work",
        EnqueueOptions {
            priority: 5,
            delay: Some(Duration::from_millis(500)),
            metadata: Default::default(),
        },
    )
    .await
    .unwrap();
    core.enqueue_command(
        Tagged {
            tag: "C".to_string(),
        },
        "work",
        EnqueueOptions::default(),
    )
    .await
    .unwrap();

    core.start_queue("work").unwrap();
    tokio::time::sleep(Duration::from_millis(900)).await;
    core.stop_queue("work").await.unwrap();

    assert_eq!(*seen.lock(), vec!["A", "C", "B"]);
    core.shutdown().await.unwrap();
}

#[tokio::test]
async fn circuit_breaker_fails_fast_then_recovers() {
    let invocations = Arc::new(AtomicU32::new(0));
    let fail = Arc::new(AtomicBool::new(true));

    let core = MercuryBuilder::new()
        .with_config(CoreConfig {
            processing: ProcessingConfig {
                max_retries: 0,
                circuit_breaker_threshold: 3,
                circuit_breaker_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        })
        .register_command::<CreateOrder, _>(CreateOrderHandler {
            invocations: Arc::clone(&invocations),
            fail: Arc::clone(&fail),
        })
        .unwrap()
        .build()
        .await
        .unwrap();

    let order = || CreateOrder {
        customer_id: "c1".to_string(),
        amount: 1.0,
    };

    // Three consecutive failures trip the breaker.
    for _ in 0..3 {
        let err = core.send_command(order()).await.unwrap_err();
        assert!(matches!(err, MercuryError::Handler(_)));
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    // Fourth call fails fast without reaching the handler.
    let err = core.send_command(order()).await.unwrap_err();
    assert!(matches!(err, MercuryError::CircuitOpen(_)));
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    // After the break duration a probe is admitted; success closes.
    fail.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(core.send_command(order()).await.unwrap(), "o1");
    assert_eq!(core.send_command(order()).await.unwrap(), "o1");
    assert_eq!(invocations.load(Ordering::SeqCst), 5);

    core.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_queue_message_lands_in_dead_letters_and_can_be_retried() {
    let invocations = Arc::new(AtomicU32::new(0));
    let fail = Arc::new(AtomicBool::new(true));

    let core = MercuryBuilder::new()
        .with_config(no_retry_config())
        .with_queue_config(QueueWorkerConfig {
            workers: 1,
            max_retries: 1,
            lease_duration: Duration::from_secs(5),
            batch_size: 10,
            poll: fast_poll(),
        })
        .with_error_handler(Arc::new(mc_dispatch::DefaultErrorHandler::new(
            Duration::from_millis(2),
            Duration::from_millis(10),
        )))
        .register_command::<CreateOrder, _>(CreateOrderHandler {
            invocations: Arc::clone(&invocations),
            fail: Arc::clone(&fail),
        })
        .unwrap()
        .build()
        .await
        .unwrap();

    core.enqueue_command(
        CreateOrder {
            customer_id: "c1".to_string(),
            amount: 1.0,
        },
        "orders",
        EnqueueOptions::default(),
    )
    .await
    .unwrap();

    core.start_queue("orders").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    core.stop_queue("orders").await.unwrap();

    // Initial attempt + one retry, then dead-lettered.
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    let dead = core.dead_letters().list(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].component, "queue:orders");

    // Manual retry succeeds once the handler recovers.
    fail.store(false, Ordering::SeqCst);
    core.dead_letters().retry(dead[0].id).await.unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    let stats = core.dead_letters().statistics().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.active, 0);

    core.shutdown().await.unwrap();
}

#[tokio::test]
async fn health_report_reflects_system_state() {
    let core = MercuryBuilder::new().build().await.unwrap();

    let health = core.get_health().await.unwrap();
    assert!(health.transport_connected);
    assert_eq!(health.dead_letter_count, 0);
    assert_eq!(health.running_queues, 0);

    core.shutdown().await.unwrap();

    let health = core.get_health().await.unwrap();
    assert!(!health.transport_connected);
}

//! Per-delivery processing installed on every consumer.
//!
//! One place implements the acknowledgement discipline, the handler
//! timeout, reply publication, and the retry and dead-letter state
//! machine. Failed messages are re-published to the service's retry queue
//! with bookkeeping headers until the retry budget is spent, then land in
//! the dead-letter queue.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicPublishOptions, BasicRejectOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::ServiceError;

/// Header carrying the number of redeliveries a message went through.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
/// Header preserving the routing key the message was first published with.
pub const ORIGINAL_ROUTING_KEY_HEADER: &str = "x-original-routing-key";
/// Header recording when the first failure happened, unix milliseconds.
pub const FIRST_FAILURE_HEADER: &str = "x-first-failure-time";
/// Header carrying the most recent failure message.
pub const LAST_ERROR_HEADER: &str = "x-last-error";
/// Header naming the queue a dead-lettered message came from.
pub const ORIGINAL_QUEUE_HEADER: &str = "x-original-queue";
/// Header recording when a message was dead-lettered, unix milliseconds.
pub const DLQ_TIME_HEADER: &str = "x-dlq-time";

/// Content type stamped on every published message.
pub(crate) const OCTET_STREAM: &str = "application/octet-stream";
/// Persistent delivery mode.
pub(crate) const PERSISTENT: u8 = 2;

/// A delivery as seen by user-facing handlers.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub redelivered: bool,
    /// Redeliveries so far, zero on first delivery.
    pub retry_count: u32,
    /// Routing key of the first delivery; equals `routing_key` unless the
    /// message came back through the retry queue.
    pub original_routing_key: String,
    pub first_failure_time: Option<i64>,
}

/// Failure surfaced by a delivery callback.
#[derive(Debug)]
pub struct HandlerFailure {
    pub message: String,
    pub code: String,
    /// Business-semantic rejection; propagated, never retried.
    pub handled: bool,
    /// False for permanent faults such as undecodable payloads.
    pub retryable: bool,
    /// Encoded error reply for RPC callers, when one exists.
    pub reply: Option<Vec<u8>>,
}

impl HandlerFailure {
    pub fn unhandled(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: "INTERNAL_ERROR".to_string(),
            handled: false,
            retryable: true,
            reply: None,
        }
    }

    /// Undecodable or schema-invalid payload. Permanent, never retried.
    pub fn invalid(message: impl Into<String>, reply: Option<Vec<u8>>) -> Self {
        Self {
            message: message.into(),
            code: "INVALID_MESSAGE".to_string(),
            handled: false,
            retryable: false,
            reply,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            message: format!("message processing timed out after {:?}", after),
            code: "TIMEOUT".to_string(),
            handled: false,
            retryable: true,
            reply: None,
        }
    }

    pub fn from_service_error(error: ServiceError, reply: Option<Vec<u8>>) -> Self {
        Self {
            message: error.message,
            code: error.code,
            handled: error.handled,
            retryable: !error.handled,
            reply,
        }
    }
}

/// Callback invoked per delivery. Returns optional reply bytes published
/// to the caller's reply queue.
pub type DeliveryCallback =
    Arc<dyn Fn(IncomingMessage) -> BoxFuture<'static, Result<Option<Vec<u8>>, HandlerFailure>> + Send + Sync>;

/// Retry wiring of a consumer queue.
#[derive(Debug, Clone)]
pub struct RetryQueues {
    pub max_retries: u32,
    pub retry_queue: String,
    pub dlq_queue: String,
}

/// Policy knobs for one consumer.
#[derive(Clone)]
pub struct ConsumeOptions {
    /// Defer acknowledgement until the handler finishes.
    pub late_ack: bool,
    /// Bound on a single handler invocation.
    pub timeout: Duration,
    /// Exchange replies are published to.
    pub callbacks_exchange: String,
    /// Retry and dead-letter wiring, when enabled.
    pub retry: Option<RetryQueues>,
}

pub(crate) struct ConsumeContext {
    pub channel: Channel,
    pub queue: String,
    pub options: ConsumeOptions,
    pub callback: DeliveryCallback,
}

/// Drive a consumer stream, processing each delivery on its own task.
///
/// Concurrency is bounded by the channel prefetch when acknowledgements
/// are deferred; early-ack consumers are unbounded.
pub(crate) fn spawn_consume_loop(
    mut consumer: lapin::Consumer,
    ctx: Arc<ConsumeContext>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => {
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        handle_delivery(ctx, delivery).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "consumer stream error, stopping loop");
                    break;
                }
            }
        }
        debug!("consumer stream ended");
    })
}

/// What to do with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureAction {
    /// Re-publish to the retry queue and ack the original.
    Retry,
    /// Re-publish to the dead-letter queue and ack the original.
    DeadLetter,
    /// Reply with the encoded error (if any) and drop the message.
    Discard,
}

fn failure_action(
    late_ack: bool,
    retry: Option<&RetryQueues>,
    failure: &HandlerFailure,
    retry_count: u32,
) -> FailureAction {
    let retry_active = late_ack
        && failure.retryable
        && !failure.handled
        && retry.map_or(false, |r| r.max_retries > 0);
    if !retry_active {
        return FailureAction::Discard;
    }
    let budget = retry.map(|r| r.max_retries).unwrap_or(0);
    if retry_count < budget {
        FailureAction::Retry
    } else {
        FailureAction::DeadLetter
    }
}

async fn handle_delivery(ctx: Arc<ConsumeContext>, delivery: Delivery) {
    let message = incoming_message(&delivery);
    let correlation_id = message.correlation_id.clone();
    let reply_to = message.reply_to.clone();
    let retry_count = message.retry_count;
    let original_routing_key = message.original_routing_key.clone();
    let first_failure_time = message.first_failure_time;
    let late_ack = ctx.options.late_ack;

    if !late_ack {
        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            error!(error = %e, queue = %ctx.queue, "failed to ack delivery");
            return;
        }
    }

    let outcome = match tokio::time::timeout(ctx.options.timeout, (ctx.callback)(message)).await {
        Ok(result) => result,
        Err(_) => Err(HandlerFailure::timeout(ctx.options.timeout)),
    };

    match outcome {
        Ok(reply) => {
            if late_ack {
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    error!(error = %e, queue = %ctx.queue, "failed to ack delivery");
                    return;
                }
            }
            if let (Some(bytes), Some(reply_to)) = (reply, reply_to) {
                publish_reply(&ctx, &reply_to, correlation_id.as_deref(), &bytes).await;
            }
        }
        Err(failure) => {
            match failure_action(late_ack, ctx.options.retry.as_ref(), &failure, retry_count) {
                FailureAction::Retry => {
                    let headers = retry_headers(
                        retry_count + 1,
                        &original_routing_key,
                        first_failure_time,
                        &failure.message,
                    );
                    requeue(&ctx, &delivery, headers, RequeueTarget::Retry).await;
                }
                FailureAction::DeadLetter => {
                    warn!(
                        queue = %ctx.queue,
                        retry_count,
                        error = %failure.message,
                        "retry budget exhausted, dead-lettering message"
                    );
                    let headers = dlq_headers(
                        retry_count,
                        &original_routing_key,
                        first_failure_time,
                        &failure.message,
                        &ctx.queue,
                    );
                    requeue(&ctx, &delivery, headers, RequeueTarget::DeadLetter).await;
                }
                FailureAction::Discard => {
                    if let (Some(bytes), Some(reply_to)) = (failure.reply.as_ref(), reply_to) {
                        publish_reply(&ctx, &reply_to, correlation_id.as_deref(), bytes).await;
                    }
                    if late_ack {
                        if let Err(e) = delivery
                            .reject(BasicRejectOptions { requeue: false })
                            .await
                        {
                            error!(error = %e, queue = %ctx.queue, "failed to reject delivery");
                        }
                    } else {
                        warn!(
                            queue = %ctx.queue,
                            code = %failure.code,
                            error = %failure.message,
                            "handler failed after early ack"
                        );
                    }
                }
            }
        }
    }
}

enum RequeueTarget {
    Retry,
    DeadLetter,
}

/// Re-publish the original body to the retry queue or the DLQ through the
/// default exchange, then ack the original delivery.
async fn requeue(
    ctx: &ConsumeContext,
    delivery: &Delivery,
    headers: FieldTable,
    target: RequeueTarget,
) {
    let Some(retry) = ctx.options.retry.as_ref() else {
        return;
    };
    let queue = match target {
        RequeueTarget::Retry => &retry.retry_queue,
        RequeueTarget::DeadLetter => &retry.dlq_queue,
    };

    let mut properties = BasicProperties::default()
        .with_content_type(OCTET_STREAM.into())
        .with_delivery_mode(PERSISTENT)
        .with_headers(headers);
    if let Some(correlation_id) = delivery.properties.correlation_id() {
        properties = properties.with_correlation_id(correlation_id.clone());
    }
    if let Some(reply_to) = delivery.properties.reply_to() {
        properties = properties.with_reply_to(reply_to.clone());
    }

    match ctx
        .channel
        .basic_publish(
            "",
            queue,
            BasicPublishOptions::default(),
            &delivery.data,
            properties,
        )
        .await
    {
        Ok(_) => {
            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                error!(error = %e, queue = %ctx.queue, "failed to ack after requeue");
            }
        }
        Err(e) => {
            // Leave the message unacked so the broker redelivers it.
            error!(error = %e, target = %queue, "failed to publish to retry target");
        }
    }
}

async fn publish_reply(
    ctx: &ConsumeContext,
    reply_to: &str,
    correlation_id: Option<&str>,
    body: &[u8],
) {
    let mut properties = BasicProperties::default()
        .with_content_type(OCTET_STREAM.into())
        .with_delivery_mode(PERSISTENT);
    if let Some(id) = correlation_id {
        properties = properties.with_correlation_id(id.to_string().into());
    }

    if let Err(e) = ctx
        .channel
        .basic_publish(
            &ctx.options.callbacks_exchange,
            reply_to,
            BasicPublishOptions::default(),
            body,
            properties,
        )
        .await
    {
        error!(error = %e, reply_to = %reply_to, "failed to publish reply");
    }
}

fn incoming_message(delivery: &Delivery) -> IncomingMessage {
    let headers = delivery.properties.headers().as_ref();
    let routing_key = delivery.routing_key.to_string();
    IncomingMessage {
        body: delivery.data.clone(),
        correlation_id: delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(ToString::to_string),
        reply_to: delivery
            .properties
            .reply_to()
            .as_ref()
            .map(ToString::to_string),
        redelivered: delivery.redelivered,
        retry_count: headers
            .and_then(|h| header_u32(h, RETRY_COUNT_HEADER))
            .unwrap_or(0),
        original_routing_key: headers
            .and_then(|h| header_string(h, ORIGINAL_ROUTING_KEY_HEADER))
            .unwrap_or_else(|| routing_key.clone()),
        first_failure_time: headers.and_then(|h| header_i64(h, FIRST_FAILURE_HEADER)),
        routing_key,
    }
}

fn retry_headers(
    retry_count: u32,
    original_routing_key: &str,
    first_failure_time: Option<i64>,
    last_error: &str,
) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongUInt(retry_count));
    headers.insert(
        ORIGINAL_ROUTING_KEY_HEADER.into(),
        AMQPValue::LongString(original_routing_key.to_string().into()),
    );
    headers.insert(
        FIRST_FAILURE_HEADER.into(),
        AMQPValue::LongLongInt(first_failure_time.unwrap_or_else(now_millis)),
    );
    headers.insert(
        LAST_ERROR_HEADER.into(),
        AMQPValue::LongString(last_error.to_string().into()),
    );
    headers
}

fn dlq_headers(
    retry_count: u32,
    original_routing_key: &str,
    first_failure_time: Option<i64>,
    last_error: &str,
    original_queue: &str,
) -> FieldTable {
    let mut headers = retry_headers(
        retry_count,
        original_routing_key,
        first_failure_time,
        last_error,
    );
    headers.insert(
        ORIGINAL_QUEUE_HEADER.into(),
        AMQPValue::LongString(original_queue.to_string().into()),
    );
    headers.insert(DLQ_TIME_HEADER.into(), AMQPValue::LongLongInt(now_millis()));
    headers
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn header_u32(headers: &FieldTable, key: &str) -> Option<u32> {
    headers.inner().get(key).and_then(|v| match v {
        AMQPValue::ShortShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongUInt(n) => Some(*n),
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
        _ => None,
    })
}

fn header_i64(headers: &FieldTable, key: &str) -> Option<i64> {
    headers.inner().get(key).and_then(|v| match v {
        AMQPValue::ShortShortInt(n) => Some(i64::from(*n)),
        AMQPValue::ShortShortUInt(n) => Some(i64::from(*n)),
        AMQPValue::ShortInt(n) => Some(i64::from(*n)),
        AMQPValue::ShortUInt(n) => Some(i64::from(*n)),
        AMQPValue::LongInt(n) => Some(i64::from(*n)),
        AMQPValue::LongUInt(n) => Some(i64::from(*n)),
        AMQPValue::LongLongInt(n) => Some(*n),
        AMQPValue::Timestamp(n) => i64::try_from(*n).ok(),
        _ => None,
    })
}

fn header_string(headers: &FieldTable, key: &str) -> Option<String> {
    headers.inner().get(key).and_then(|v| match v {
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes())
            .ok()
            .map(ToString::to_string),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry_queues(max_retries: u32) -> RetryQueues {
        RetryQueues {
            max_retries,
            retry_queue: "Svc.Retry".to_string(),
            dlq_queue: "Svc.DLQ".to_string(),
        }
    }

    #[test]
    fn test_unhandled_failure_is_retried_until_budget() {
        let failure = HandlerFailure::unhandled("boom");
        let queues = retry_queues(3);
        assert_eq!(
            failure_action(true, Some(&queues), &failure, 0),
            FailureAction::Retry
        );
        assert_eq!(
            failure_action(true, Some(&queues), &failure, 2),
            FailureAction::Retry
        );
        assert_eq!(
            failure_action(true, Some(&queues), &failure, 3),
            FailureAction::DeadLetter
        );
    }

    #[test]
    fn test_handled_failure_is_never_retried() {
        let failure = HandlerFailure::from_service_error(
            ServiceError::handled("VALIDATION_ERROR", "bad"),
            Some(vec![1]),
        );
        assert_eq!(
            failure_action(true, Some(&retry_queues(3)), &failure, 0),
            FailureAction::Discard
        );
    }

    #[test]
    fn test_invalid_message_is_never_retried() {
        let failure = HandlerFailure::invalid("garbage", None);
        assert_eq!(
            failure_action(true, Some(&retry_queues(3)), &failure, 0),
            FailureAction::Discard
        );
    }

    #[test]
    fn test_retry_needs_late_ack_and_budget() {
        let failure = HandlerFailure::unhandled("boom");
        assert_eq!(
            failure_action(false, Some(&retry_queues(3)), &failure, 0),
            FailureAction::Discard
        );
        assert_eq!(
            failure_action(true, Some(&retry_queues(0)), &failure, 0),
            FailureAction::Discard
        );
        assert_eq!(failure_action(true, None, &failure, 0), FailureAction::Discard);
    }

    #[test]
    fn test_retry_headers_carry_bookkeeping() {
        let headers = retry_headers(2, "REQUEST.Svc.m", Some(1234), "boom");
        assert_eq!(header_u32(&headers, RETRY_COUNT_HEADER), Some(2));
        assert_eq!(
            header_string(&headers, ORIGINAL_ROUTING_KEY_HEADER).as_deref(),
            Some("REQUEST.Svc.m")
        );
        assert_eq!(header_i64(&headers, FIRST_FAILURE_HEADER), Some(1234));
        assert_eq!(header_string(&headers, LAST_ERROR_HEADER).as_deref(), Some("boom"));
    }

    #[test]
    fn test_dlq_headers_keep_final_count_and_queue() {
        let headers = dlq_headers(3, "REQUEST.Svc.m", Some(1234), "boom", "Svc");
        assert_eq!(header_u32(&headers, RETRY_COUNT_HEADER), Some(3));
        assert_eq!(header_string(&headers, ORIGINAL_QUEUE_HEADER).as_deref(), Some("Svc"));
        assert!(header_i64(&headers, DLQ_TIME_HEADER).is_some());
        assert_eq!(header_i64(&headers, FIRST_FAILURE_HEADER), Some(1234));
    }

    #[test]
    fn test_first_failure_defaults_to_now() {
        let before = now_millis();
        let headers = retry_headers(1, "rk", None, "err");
        let stamped = header_i64(&headers, FIRST_FAILURE_HEADER).unwrap();
        assert!(stamped >= before);
    }
}

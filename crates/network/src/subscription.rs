use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Instrument};

use crate::error::Error;
use crate::events::{PeerEvent, Registries};
use crate::message::{Decoder, Message, Messages, RawMessage, ReceivedMessage};
use crate::rate_limit::RateLimiter;
use crate::swarm::{CtrlMsg, Route};
use crate::validation::ValidationResult;

/// Pending raw messages a subscription can hold before the router starts dropping them.
const INBOUND_QUEUE_SIZE: usize = 1024;

/// Validated messages waiting to be read by the application.
const DELIVERY_QUEUE_SIZE: usize = 256;

const PEER_EVENTS_QUEUE_SIZE: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Created,
    Joined,
    Subscribed,
    Closed,
}

/// What a subscription shares with the node that created it.
#[derive(Clone)]
pub(crate) struct Context {
    pub ctrl: mpsc::Sender<CtrlMsg>,
    pub registries: Arc<Registries>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub token: CancellationToken,
}

/// Publishing side of a subscription, cheap to clone.
#[derive(Clone)]
pub struct Publisher {
    topic: String,
    ctrl: mpsc::Sender<CtrlMsg>,
    registries: Arc<Registries>,
}

impl Publisher {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Encode and submit a message to the router.
    ///
    /// Resolves once the router has accepted the message for local fan-out.
    pub async fn publish(&self, message: &dyn Message) -> Result<(), Error> {
        let data = message.marshal_binary().map_err(Error::Encode)?;
        if data.is_empty() {
            return Err(Error::NilPayload);
        }

        self.registries
            .messages
            .for_each(|handler| handler.published(&self.topic, message));

        let (reply, rx) = oneshot::channel();
        self.ctrl
            .send(CtrlMsg::Publish {
                topic: self.topic.clone(),
                data: Bytes::from(data),
                reply,
            })
            .await
            .map_err(|_| Error::TaskGone)?;

        rx.await.map_err(|_| Error::TaskGone)?
    }
}

/// A joined topic, with the tasks validating its messages and forwarding its peer events.
pub struct Subscription {
    topic: String,
    state: SubscriptionState,
    publisher: Publisher,
    messages: Messages,
    token: CancellationToken,
    message_loop: Option<JoinHandle<mpsc::Sender<ReceivedMessage>>>,
    event_loop: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Join `topic` and start the message and event loops.
    pub(crate) async fn open(topic: String, decode: Decoder, ctx: Context) -> Result<Self, Error> {
        let mut state = SubscriptionState::Created;
        trace!(%topic, ?state, "Opening subscription");

        let (tx_raw, rx_raw) = mpsc::channel(INBOUND_QUEUE_SIZE);
        let (tx_peer_events, rx_peer_events) = mpsc::channel(PEER_EVENTS_QUEUE_SIZE);
        let (tx_delivery, rx_delivery) = mpsc::channel(DELIVERY_QUEUE_SIZE);
        let lagged = Arc::new(AtomicU64::new(0));

        let route = Route {
            messages: tx_raw,
            peer_events: tx_peer_events,
            lagged: Arc::clone(&lagged),
        };

        let (reply, rx_reply) = oneshot::channel();
        ctx.ctrl
            .send(CtrlMsg::Subscribe {
                topic: topic.clone(),
                route,
                reply,
            })
            .await
            .map_err(|_| Error::TaskGone)?;

        rx_reply.await.map_err(|_| Error::TaskGone)??;

        state = SubscriptionState::Joined;
        trace!(%topic, ?state, "Joined topic");

        let token = ctx.token.child_token();

        let message_loop = tokio::spawn(
            message_loop(MessageLoop {
                topic: topic.clone(),
                decode,
                rx: rx_raw,
                tx: tx_delivery,
                lagged,
                ctx: ctx.clone(),
                token: token.clone(),
            })
            .in_current_span(),
        );

        let event_loop = tokio::spawn(
            event_loop(
                topic.clone(),
                rx_peer_events,
                Arc::clone(&ctx.registries),
                token.clone(),
            )
            .in_current_span(),
        );

        state = SubscriptionState::Subscribed;
        debug!(%topic, ?state, "Subscription open");

        Ok(Self {
            publisher: Publisher {
                topic: topic.clone(),
                ctrl: ctx.ctrl,
                registries: ctx.registries,
            },
            messages: Messages::new(topic.clone(), rx_delivery),
            topic,
            state,
            token,
            message_loop: Some(message_loop),
            event_loop: Some(event_loop),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn messages(&self) -> Messages {
        self.messages.clone()
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    pub async fn publish(&self, message: &dyn Message) -> Result<(), Error> {
        if self.state == SubscriptionState::Closed {
            return Err(Error::NotSubscribed(self.topic.clone()));
        }

        self.publisher.publish(message).await
    }

    /// Stop both loops, leave the topic and close the delivery channel, in that order.
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.state == SubscriptionState::Closed {
            return Ok(());
        }

        self.state = SubscriptionState::Closed;
        self.token.cancel();

        if let Some(event_loop) = self.event_loop.take() {
            if let Err(e) = event_loop.await {
                warn!(topic = %self.topic, "Event loop failed: {e}");
            }
        }

        let (reply, rx) = oneshot::channel();
        let left = match self
            .publisher
            .ctrl
            .send(CtrlMsg::Unsubscribe {
                topic: self.topic.clone(),
                reply,
            })
            .await
        {
            Ok(()) => rx.await.map_err(|_| Error::TaskGone),
            Err(_) => Err(Error::TaskGone),
        };

        if let Some(message_loop) = self.message_loop.take() {
            match message_loop.await {
                // Dropping the last sender closes the delivery channel
                Ok(tx_delivery) => drop(tx_delivery),
                Err(e) => warn!(topic = %self.topic, "Message loop failed: {e}"),
            }
        }

        debug!(topic = %self.topic, "Subscription closed");

        left
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Run the admission and validation pipeline on a raw message.
///
/// Returns the verdict, and the decoded message when decoding succeeded.
pub(crate) fn validate(
    topic: &str,
    decode: Decoder,
    raw: &RawMessage,
    rate_limiter: Option<&RateLimiter>,
    registries: &Registries,
) -> (ValidationResult, Option<Arc<dyn Message>>) {
    if let Some(limiter) = rate_limiter {
        if !raw.is_local() && !limiter.allow(&raw.propagation_source, raw.data.len()) {
            registries
                .messages
                .for_each(|handler| handler.throttled(topic, raw));

            return (ValidationResult::Ignore, None);
        }
    }

    let message = match decode(&raw.data) {
        Ok(message) => message,
        Err(e) => {
            registries
                .messages
                .for_each(|handler| handler.broken(topic, raw, &e));

            return (ValidationResult::Reject, None);
        }
    };

    let result = registries
        .validator_chain()
        .validate(topic, &raw.source, message.as_ref());

    registries
        .messages
        .for_each(|handler| handler.received(topic, raw, message.as_ref(), result));

    (result, Some(message))
}

struct MessageLoop {
    topic: String,
    decode: Decoder,
    rx: mpsc::Receiver<RawMessage>,
    tx: mpsc::Sender<ReceivedMessage>,
    lagged: Arc<AtomicU64>,
    ctx: Context,
    token: CancellationToken,
}

/// Validate routed messages, report verdicts to the router, deliver accepted messages.
///
/// Hands the delivery sender back on exit so that the caller decides when the channel closes.
async fn message_loop(mut l: MessageLoop) -> mpsc::Sender<ReceivedMessage> {
    loop {
        let raw = tokio::select! {
            biased;
            _ = l.token.cancelled() => break,
            raw = l.rx.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };

        let dropped = l.lagged.swap(0, Ordering::Relaxed);
        if dropped > 0 && !deliver(&l, ReceivedMessage::failed(Error::Lagged(dropped))).await {
            break;
        }

        let (result, message) = validate(
            &l.topic,
            l.decode,
            &raw,
            l.ctx.rate_limiter.as_deref(),
            &l.ctx.registries,
        );

        if let Some(message_id) = raw.message_id.clone() {
            let report = CtrlMsg::ReportValidation {
                message_id,
                propagation_source: raw.propagation_source,
                result,
            };

            if l.ctx.ctrl.send(report).await.is_err() {
                break;
            }
        }

        if let (ValidationResult::Accept, Some(message)) = (result, message) {
            if !deliver(&l, ReceivedMessage::accepted(message, raw)).await {
                break;
            }
        }
    }

    trace!(topic = %l.topic, "Message loop stopped");
    l.tx
}

async fn deliver(l: &MessageLoop, item: ReceivedMessage) -> bool {
    tokio::select! {
        biased;
        _ = l.token.cancelled() => false,
        result = l.tx.send(item) => result.is_ok(),
    }
}

async fn event_loop(
    topic: String,
    mut rx: mpsc::Receiver<PeerEvent>,
    registries: Arc<Registries>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        registries
            .peer_events
            .for_each(|handler| handler.handle(&topic, &event));
    }

    trace!(%topic, "Event loop stopped");
}

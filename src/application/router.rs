//! Cross-context messaging: handler dispatch with a uniform
//! `{success, data?, error?}` envelope, plus the in-process channel that
//! stands in for the host's message passing.

use crate::domain::messages::{Message, MessageResponse, UNKNOWN_MESSAGE_TYPE};
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Unknown message type")]
    UnknownType,
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Infra(#[from] InfraError),
}

/// One execution context's message handling.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<Option<Value>, HandlerError>;
}

pub struct MessageRouter<H> {
    context: &'static str,
    handler: Arc<H>,
}

impl<H> Clone for MessageRouter<H> {
    fn clone(&self) -> Self {
        Self {
            context: self.context,
            handler: self.handler.clone(),
        }
    }
}

impl<H: MessageHandler + 'static> MessageRouter<H> {
    pub fn new(context: &'static str, handler: Arc<H>) -> Self {
        Self { context, handler }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Never fails: handler errors and panics come back as failure envelopes.
    pub async fn dispatch(&self, message: Message) -> MessageResponse {
        let kind = message.kind.as_str().to_string();
        debug!(context = self.context, kind = %kind, "dispatching message");
        let outcome = AssertUnwindSafe(self.handler.handle(message))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(data)) => MessageResponse::ok(data),
            Ok(Err(HandlerError::UnknownType)) => {
                warn!(context = self.context, kind = %kind, "unknown message type");
                MessageResponse::failure(UNKNOWN_MESSAGE_TYPE)
            }
            Ok(Err(failure)) => {
                error!(context = self.context, kind = %kind, error = %failure, "message handler failed");
                MessageResponse::failure(failure.to_string())
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(context = self.context, kind = %kind, reason = %reason, "message handler panicked");
                MessageResponse::failure(reason)
            }
        }
    }

    /// Serves requests until every sender is gone. Each request runs in its
    /// own task so a slow reply never blocks later deliveries.
    pub fn listen(self, mut receiver: ChannelReceiver) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(envelope) = receiver.rx.recv().await {
                let router = self.clone();
                tokio::spawn(async move {
                    let response = router.dispatch(envelope.message).await;
                    if envelope.respond_to.send(response).is_err() {
                        debug!(context = router.context, "sender went away before the reply");
                    }
                });
            }
            debug!(context = self.context, "listener closed");
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "message handler panicked".to_string()
}

pub struct Envelope {
    pub message: Message,
    pub respond_to: oneshot::Sender<MessageResponse>,
}

#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::Sender<Envelope>,
}

pub struct ChannelReceiver {
    rx: mpsc::Receiver<Envelope>,
}

pub fn channel(capacity: usize) -> (ChannelSender, ChannelReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelSender { tx }, ChannelReceiver { rx })
}

impl ChannelReceiver {
    /// Next raw request, for contexts that answer by hand.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl ChannelSender {
    pub async fn send(&self, message: Message) -> Result<MessageResponse, InfraError> {
        let (respond_to, reply) = oneshot::channel();
        self.tx
            .send(Envelope {
                message,
                respond_to,
            })
            .await
            .map_err(|_| {
                InfraError::Disconnected(
                    "Could not establish connection. Receiving end does not exist.".to_string(),
                )
            })?;
        reply.await.map_err(|_| {
            InfraError::Disconnected("The message port closed before a response was received.".to_string())
        })
    }

    /// Sends and unwraps the envelope; failure envelopes become `Rejected`.
    pub async fn request<T: DeserializeOwned>(&self, message: Message) -> Result<Option<T>, InfraError> {
        let data = self
            .send(message)
            .await?
            .into_result()
            .map_err(InfraError::Rejected)?;
        match data {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::messages::MessageType;
    use std::sync::Mutex;

    struct EchoHandler {
        seen: Mutex<Vec<MessageType>>,
    }

    #[async_trait]
    impl MessageHandler for EchoHandler {
        async fn handle(&self, message: Message) -> Result<Option<Value>, HandlerError> {
            self.seen.lock().expect("seen lock").push(message.kind.clone());
            match message.kind {
                MessageType::Ping => Ok(message.payload),
                MessageType::ToggleGhost => Err(HandlerError::Invalid("ghosting unavailable".to_string())),
                MessageType::HideMornings => panic!("boom"),
                _ => Err(HandlerError::UnknownType),
            }
        }
    }

    fn router() -> MessageRouter<EchoHandler> {
        MessageRouter::new(
            "test",
            Arc::new(EchoHandler {
                seen: Mutex::new(Vec::new()),
            }),
        )
    }

    #[tokio::test]
    async fn unknown_type_yields_standard_error() {
        let message: Message =
            serde_json::from_value(serde_json::json!({ "type": "UNKNOWN" })).expect("message");
        let response = router().dispatch(message).await;
        assert_eq!(response, MessageResponse::failure("Unknown message type"));
    }

    #[tokio::test]
    async fn handler_error_and_panic_become_failure_envelopes() {
        let router = router();
        let failed = router.dispatch(Message::new(MessageType::ToggleGhost)).await;
        assert_eq!(failed.error.as_deref(), Some("ghosting unavailable"));

        let panicked = router.dispatch(Message::new(MessageType::HideMornings)).await;
        assert!(!panicked.success);
        assert_eq!(panicked.error.as_deref(), Some("boom"));

        let still_serving = router
            .dispatch(Message::with_payload(MessageType::Ping, &"pong").expect("message"))
            .await;
        assert_eq!(still_serving, MessageResponse::ok(Some(serde_json::json!("pong"))));
    }

    #[tokio::test]
    async fn channel_round_trip_preserves_order() {
        let router = router();
        let handler = router.handler().clone();
        let (sender, receiver) = channel(8);
        let listener = router.listen(receiver);

        for index in 0..5 {
            let response = sender
                .send(Message::with_payload(MessageType::Ping, &index).expect("message"))
                .await
                .expect("reply");
            assert_eq!(response.data, Some(serde_json::json!(index)));
        }
        assert_eq!(handler.seen.lock().expect("seen lock").len(), 5);

        drop(sender);
        listener.await.expect("listener ends");
    }

    #[tokio::test]
    async fn dropped_responder_is_disconnected() {
        let (sender, mut receiver) = channel(1);
        let drop_side = tokio::spawn(async move {
            let envelope = receiver.recv().await.expect("envelope");
            drop(envelope.respond_to);
        });

        let result = sender.send(Message::new(MessageType::GetState)).await;
        assert!(matches!(result, Err(InfraError::Disconnected(_))));
        drop_side.await.expect("task");
    }

    #[tokio::test]
    async fn send_without_listener_is_disconnected() {
        let (sender, receiver) = channel(1);
        drop(receiver);
        let result = sender.send(Message::new(MessageType::Ping)).await;
        assert!(matches!(result, Err(InfraError::Disconnected(_))));
    }

    #[tokio::test]
    async fn request_decodes_data_and_surfaces_failures() {
        let (sender, receiver) = channel(4);
        router().listen(receiver);

        let echoed: Option<String> = sender
            .request(Message::with_payload(MessageType::Ping, &"hello").expect("message"))
            .await
            .expect("request");
        assert_eq!(echoed.as_deref(), Some("hello"));

        let rejected = sender
            .request::<Value>(Message::new(MessageType::AuthRequired))
            .await;
        assert!(matches!(rejected, Err(InfraError::Rejected(message)) if message == "Unknown message type"));
    }
}

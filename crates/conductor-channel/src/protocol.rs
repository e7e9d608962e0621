//! Request/response correlation and typed message dispatch over a channel.

use crate::channel::{ChannelClient, ChannelServer};
use async_trait::async_trait;
use conductor_core::ids::{AgentId, MessageId};
use conductor_core::message::{AgentMessage, MessageType};
use conductor_core::{Error, Result};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Recent message ids remembered per sender for duplicate detection.
const SEEN_WINDOW: usize = 1024;

/// Async handler invoked for a dispatched message or a correlated response.
pub type MessageHandler = Arc<dyn Fn(AgentMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(AgentMessage) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// The narrow transport seam the protocol is written against; both channel
/// ends implement it.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    fn local_id(&self) -> &AgentId;

    async fn send(&self, message: AgentMessage) -> Result<()>;

    /// Next inbound message, or `None` when the timeout elapses.
    async fn receive(&self, timeout: Duration) -> Option<AgentMessage>;
}

#[async_trait]
impl MessageTransport for ChannelClient {
    fn local_id(&self) -> &AgentId {
        ChannelClient::local_id(self)
    }

    async fn send(&self, message: AgentMessage) -> Result<()> {
        ChannelClient::send(self, message).await
    }

    async fn receive(&self, timeout: Duration) -> Option<AgentMessage> {
        ChannelClient::receive(self, timeout).await
    }
}

#[async_trait]
impl MessageTransport for ChannelServer {
    fn local_id(&self) -> &AgentId {
        ChannelServer::local_id(self)
    }

    async fn send(&self, message: AgentMessage) -> Result<()> {
        ChannelServer::send(self, message).await
    }

    async fn receive(&self, timeout: Duration) -> Option<AgentMessage> {
        ChannelServer::receive(self, timeout).await
    }
}

struct SeenWindow {
    set: HashSet<MessageId>,
    order: VecDeque<MessageId>,
}

impl SeenWindow {
    fn new() -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `id`; returns false if it was already present.
    fn insert(&mut self, id: MessageId) -> bool {
        if !self.set.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > SEEN_WINDOW {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

/// Peer protocol: registers typed handlers, correlates responses to
/// outstanding requests, and polices duplicate message ids.
pub struct Protocol {
    transport: Arc<dyn MessageTransport>,
    handlers: StdMutex<HashMap<MessageType, MessageHandler>>,
    pending: StdMutex<HashMap<MessageId, Option<MessageHandler>>>,
    seen: StdMutex<HashMap<AgentId, SeenWindow>>,
}

impl Protocol {
    pub fn new(transport: Arc<dyn MessageTransport>) -> Self {
        Self {
            transport,
            handlers: StdMutex::new(HashMap::new()),
            pending: StdMutex::new(HashMap::new()),
            seen: StdMutex::new(HashMap::new()),
        }
    }

    pub fn local_id(&self) -> AgentId {
        self.transport.local_id().clone()
    }

    /// Register the handler for a message type. Last registration wins.
    pub fn register_handler(&self, message_type: MessageType, handler: MessageHandler) {
        self.handlers
            .lock()
            .expect("handler table lock poisoned")
            .insert(message_type, handler);
    }

    /// Send a `task_request` to `receiver`. The optional callback fires
    /// exactly once when the correlated response arrives.
    pub async fn send_request(
        &self,
        receiver: AgentId,
        payload: Map<String, Value>,
        callback: Option<MessageHandler>,
    ) -> Result<MessageId> {
        let message = AgentMessage::new(
            self.local_id(),
            receiver,
            MessageType::TaskRequest,
            payload,
        );
        let message_id = message.message_id.clone();
        self.pending
            .lock()
            .expect("pending table lock poisoned")
            .insert(message_id.clone(), callback);

        if let Err(e) = self.transport.send(message).await {
            // The request never left, so the pending entry must not linger.
            self.pending
                .lock()
                .expect("pending table lock poisoned")
                .remove(&message_id);
            return Err(e);
        }
        Ok(message_id)
    }

    /// Reply to `request` with a correlated `task_response`.
    pub async fn send_response(
        &self,
        request: &AgentMessage,
        payload: Map<String, Value>,
    ) -> Result<()> {
        let response = AgentMessage::response_to(request, self.local_id(), payload);
        self.transport.send(response).await
    }

    /// Send a fire-and-forget message of the given type.
    pub async fn send_message(
        &self,
        receiver: AgentId,
        message_type: MessageType,
        payload: Map<String, Value>,
    ) -> Result<()> {
        let message = AgentMessage::new(self.local_id(), receiver, message_type, payload);
        self.transport.send(message).await
    }

    /// Drain the inbound queue, dispatching each message. Waits at most
    /// `idle_timeout` for the first message, then keeps going while the
    /// queue stays non-empty. A duplicate message id aborts the drain with
    /// a protocol error; already-dispatched messages stay dispatched.
    pub async fn process_messages(&self, idle_timeout: Duration) -> Result<usize> {
        let mut processed = 0usize;
        let mut wait = idle_timeout;
        while let Some(message) = self.transport.receive(wait).await {
            self.dispatch(message).await?;
            processed += 1;
            wait = Duration::ZERO;
        }
        Ok(processed)
    }

    async fn dispatch(&self, message: AgentMessage) -> Result<()> {
        let fresh = self
            .seen
            .lock()
            .expect("seen table lock poisoned")
            .entry(message.sender_id.clone())
            .or_insert_with(SeenWindow::new)
            .insert(message.message_id.clone());
        if !fresh {
            return Err(Error::DuplicateMessageId {
                sender_id: message.sender_id.to_string(),
                message_id: message.message_id.to_string(),
            });
        }

        if message.message_type == MessageType::TaskResponse {
            if let Some(correlation_id) = message.correlation_id.clone() {
                // Remove before invoking so the callback can never fire twice.
                let entry = self
                    .pending
                    .lock()
                    .expect("pending table lock poisoned")
                    .remove(&correlation_id);
                match entry {
                    Some(Some(callback)) => {
                        callback(message).await;
                        return Ok(());
                    }
                    Some(None) => {
                        debug!(correlation = %correlation_id, "Response to callback-less request");
                        return Ok(());
                    }
                    None => {
                        // Not ours; fall through to the type handler.
                    }
                }
            }
        }

        let handler = self
            .handlers
            .lock()
            .expect("handler table lock poisoned")
            .get(&message.message_type)
            .cloned();
        match handler {
            Some(handler) => handler(message).await,
            None => {
                warn!(
                    message_type = message.message_type.as_str(),
                    sender = %message.sender_id,
                    "Dropping message with no registered handler"
                );
            }
        }
        Ok(())
    }

    /// Outstanding request count, for introspection.
    pub fn pending_requests(&self) -> usize {
        self.pending
            .lock()
            .expect("pending table lock poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    /// In-memory transport: sent messages can be pushed back as inbound.
    struct LoopbackTransport {
        id: AgentId,
        outbox: StdMutex<Vec<AgentMessage>>,
        inbox: AsyncMutex<VecDeque<AgentMessage>>,
    }

    impl LoopbackTransport {
        fn new(id: AgentId) -> Self {
            Self {
                id,
                outbox: StdMutex::new(Vec::new()),
                inbox: AsyncMutex::new(VecDeque::new()),
            }
        }

        fn sent(&self) -> Vec<AgentMessage> {
            self.outbox.lock().unwrap().clone()
        }

        async fn push_inbound(&self, message: AgentMessage) {
            self.inbox.lock().await.push_back(message);
        }
    }

    #[async_trait]
    impl MessageTransport for LoopbackTransport {
        fn local_id(&self) -> &AgentId {
            &self.id
        }

        async fn send(&self, message: AgentMessage) -> Result<()> {
            self.outbox.lock().unwrap().push(message);
            Ok(())
        }

        async fn receive(&self, _timeout: Duration) -> Option<AgentMessage> {
            self.inbox.lock().await.pop_front()
        }
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> MessageHandler {
        handler(move |_message| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test]
    async fn test_callback_fires_exactly_once() {
        let transport = Arc::new(LoopbackTransport::new(AgentId::numbered(1)));
        let protocol = Protocol::new(transport.clone());
        let fired = Arc::new(AtomicUsize::new(0));

        let request_id = protocol
            .send_request(
                AgentId::numbered(2),
                Map::new(),
                Some(counting_handler(Arc::clone(&fired))),
            )
            .await
            .unwrap();
        assert_eq!(protocol.pending_requests(), 1);

        let request = transport.sent().pop().unwrap();
        assert_eq!(request.message_id, request_id);

        let response = AgentMessage::response_to(&request, AgentId::numbered(2), Map::new());
        transport.push_inbound(response).await;
        protocol.process_messages(Duration::ZERO).await.unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(protocol.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_message_id_is_protocol_error() {
        let transport = Arc::new(LoopbackTransport::new(AgentId::numbered(1)));
        let protocol = Protocol::new(transport.clone());
        protocol.register_handler(
            MessageType::Coordination,
            counting_handler(Arc::new(AtomicUsize::new(0))),
        );

        let message = AgentMessage::new(
            AgentId::numbered(2),
            AgentId::numbered(1),
            MessageType::Coordination,
            Map::new(),
        );
        transport.push_inbound(message.clone()).await;
        transport.push_inbound(message).await;

        let result = protocol.process_messages(Duration::ZERO).await;
        assert!(matches!(result, Err(Error::DuplicateMessageId { .. })));
    }

    #[tokio::test]
    async fn test_last_handler_registration_wins() {
        let transport = Arc::new(LoopbackTransport::new(AgentId::numbered(1)));
        let protocol = Protocol::new(transport.clone());

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        protocol.register_handler(MessageType::StatusUpdate, counting_handler(Arc::clone(&first)));
        protocol.register_handler(MessageType::StatusUpdate, counting_handler(Arc::clone(&second)));

        transport
            .push_inbound(AgentMessage::new(
                AgentId::numbered(2),
                AgentId::numbered(1),
                MessageType::StatusUpdate,
                Map::new(),
            ))
            .await;
        protocol.process_messages(Duration::ZERO).await.unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unhandled_message_is_dropped() {
        let transport = Arc::new(LoopbackTransport::new(AgentId::numbered(1)));
        let protocol = Protocol::new(transport.clone());

        transport
            .push_inbound(AgentMessage::new(
                AgentId::numbered(2),
                AgentId::numbered(1),
                MessageType::Heartbeat,
                Map::new(),
            ))
            .await;

        let processed = protocol.process_messages(Duration::ZERO).await.unwrap();
        assert_eq!(processed, 1);
    }

    #[tokio::test]
    async fn test_failed_send_clears_pending_entry() {
        struct FailingTransport {
            id: AgentId,
        }

        #[async_trait]
        impl MessageTransport for FailingTransport {
            fn local_id(&self) -> &AgentId {
                &self.id
            }

            async fn send(&self, _message: AgentMessage) -> Result<()> {
                Err(Error::ChannelWrite("gone".into()))
            }

            async fn receive(&self, _timeout: Duration) -> Option<AgentMessage> {
                None
            }
        }

        let protocol = Protocol::new(Arc::new(FailingTransport {
            id: AgentId::numbered(1),
        }));
        let result = protocol
            .send_request(AgentId::numbered(2), Map::new(), None)
            .await;
        assert!(result.is_err());
        assert_eq!(protocol.pending_requests(), 0);
    }
}

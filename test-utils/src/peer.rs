use std::time::Duration;

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    SinkExt,
    StreamExt,
};
use wamproute::{
    core::{
        id::Id,
        stream::{
            MessageStream,
            StreamMessage,
        },
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::{
            Uri,
            WildcardUri,
        },
    },
    message::message::{
        CallMessage,
        HelloMessage,
        Message,
        PublishMessage,
        RegisterMessage,
        SubscribeMessage,
    },
    router::RouterHandle,
};

/// A bare-bones WAMP peer that speaks raw messages over a direct router connection.
///
/// Tests drive the router through this peer so that every frame in and out of the router is
/// visible to assertions.
pub struct TestPeer {
    stream: Box<dyn MessageStream>,
    next_request: u64,
    pub session: Option<Id>,
}

impl TestPeer {
    /// Connects a new peer directly to the router, in process.
    pub fn connect_direct(router_handle: &RouterHandle) -> Self {
        Self {
            stream: router_handle.direct_connect().stream(),
            next_request: 0,
            session: None,
        }
    }

    /// The next request ID for this peer.
    pub fn next_request_id(&mut self) -> Id {
        self.next_request += 1;
        Id::try_from(self.next_request).unwrap()
    }

    /// Sends one message to the router.
    pub async fn send(&mut self, message: Message) -> Result<()> {
        self.stream.send(StreamMessage::Message(message)).await
    }

    /// Receives the next message from the router, waiting up to 5 seconds.
    pub async fn receive(&mut self) -> Result<Message> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match self.stream.next().await {
                    Some(Ok(StreamMessage::Message(message))) => return Ok(message),
                    Some(Ok(StreamMessage::Ping(_))) => continue,
                    Some(Err(err)) => return Err(err),
                    None => return Err(Error::msg("stream closed")),
                }
            }
        })
        .await
        .map_err(|_| Error::msg("timed out waiting for a message"))?
    }

    /// Receives the next message if one arrives within a short window.
    ///
    /// Used to assert that a message was *not* sent.
    pub async fn try_receive(&mut self) -> Option<Message> {
        tokio::time::timeout(Duration::from_millis(250), self.receive())
            .await
            .ok()
            .and_then(|message| message.ok())
    }

    fn roles() -> Dictionary {
        let roles = ["caller", "callee", "publisher", "subscriber"]
            .into_iter()
            .map(|role| {
                (
                    role.to_owned(),
                    Value::Dictionary(Dictionary::default()),
                )
            })
            .collect::<Dictionary>();
        Dictionary::from_iter([("roles".to_owned(), Value::Dictionary(roles))])
    }

    /// Says HELLO and waits for WELCOME, recording the assigned session ID.
    pub async fn join_realm(&mut self, realm: &str) -> Result<Id> {
        self.send(Message::Hello(HelloMessage {
            realm: Uri::try_from(realm).map_err(Error::new)?,
            details: Self::roles(),
        }))
        .await?;
        match self.receive().await? {
            Message::Welcome(message) => {
                self.session = Some(message.session);
                Ok(message.session)
            }
            message => Err(Error::msg(format!(
                "expected WELCOME, got {}",
                message.message_name()
            ))),
        }
    }

    /// Subscribes to a topic and waits for the acknowledgement.
    pub async fn subscribe(&mut self, topic: &str) -> Result<Id> {
        self.subscribe_with_options(topic, Dictionary::default())
            .await
    }

    /// Subscribes to a topic with options and waits for the acknowledgement.
    pub async fn subscribe_with_options(
        &mut self,
        topic: &str,
        options: Dictionary,
    ) -> Result<Id> {
        let request = self.next_request_id();
        self.send(Message::Subscribe(SubscribeMessage {
            request,
            options,
            topic: WildcardUri::try_from(topic).map_err(Error::new)?,
        }))
        .await?;
        match self.receive().await? {
            Message::Subscribed(message) if message.subscribe_request == request => {
                Ok(message.subscription)
            }
            message => Err(Error::msg(format!(
                "expected SUBSCRIBED, got {message:?}"
            ))),
        }
    }

    /// Publishes an event, without waiting for anything.
    pub async fn publish(
        &mut self,
        topic: &str,
        arguments: List,
        options: Dictionary,
    ) -> Result<Id> {
        let request = self.next_request_id();
        self.send(Message::Publish(PublishMessage {
            request,
            options,
            topic: Uri::try_from(topic).map_err(Error::new)?,
            arguments,
            arguments_keyword: Dictionary::default(),
        }))
        .await?;
        Ok(request)
    }

    /// Registers a procedure and waits for the acknowledgement.
    pub async fn register(&mut self, procedure: &str) -> Result<Id> {
        self.register_with_options(procedure, Dictionary::default())
            .await
    }

    /// Registers a procedure with options and waits for the acknowledgement.
    pub async fn register_with_options(
        &mut self,
        procedure: &str,
        options: Dictionary,
    ) -> Result<Id> {
        let request = self.next_request_id();
        self.send(Message::Register(RegisterMessage {
            request,
            options,
            procedure: WildcardUri::try_from(procedure).map_err(Error::new)?,
        }))
        .await?;
        match self.receive().await? {
            Message::Registered(message) if message.register_request == request => {
                Ok(message.registration)
            }
            message => Err(Error::msg(format!(
                "expected REGISTERED, got {message:?}"
            ))),
        }
    }

    /// Issues a call, without waiting for the result.
    pub async fn call(
        &mut self,
        procedure: &str,
        arguments: List,
        options: Dictionary,
    ) -> Result<Id> {
        let request = self.next_request_id();
        self.send(Message::Call(CallMessage {
            request,
            options,
            procedure: Uri::try_from(procedure).map_err(Error::new)?,
            arguments,
            arguments_keyword: Dictionary::default(),
        }))
        .await?;
        Ok(request)
    }
}

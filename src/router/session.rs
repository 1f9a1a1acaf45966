use std::{
    fmt::Debug,
    future::Future,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use futures_util::lock::Mutex;
use log::{
    debug,
    error,
    info,
    warn,
};
use tokio::sync::{
    RwLock,
    broadcast::{
        self,
        error::RecvError,
    },
    mpsc::UnboundedSender,
};

use crate::{
    core::{
        cancel::CallCancelMode,
        close::CloseReason,
        error::{
            BasicError,
            ChannelTransmittableError,
            ChannelTransmittableResult,
            InteractionError,
            uri_for_error,
        },
        hash::HashMap,
        id::{
            Id,
            IdAllocator,
            SequentialIdAllocator,
        },
        match_style::MatchStyle,
        publish_options::PublishOptions,
        roles::{
            PeerRole,
            PeerRoles,
            router_roles_details,
        },
        stream::ConnectionType,
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
    message::{
        common::{
            abort_message_for_error,
            error_for_request,
            goodbye_and_out,
            goodbye_with_close_reason,
        },
        message::{
            CallMessage,
            CancelMessage,
            ErrorMessage,
            HelloMessage,
            InterruptMessage,
            InvocationMessage,
            Message,
            PublishMessage,
            PublishedMessage,
            RegisterMessage,
            RegisteredMessage,
            ResultMessage,
            SubscribeMessage,
            SubscribedMessage,
            UnregisterMessage,
            UnregisteredMessage,
            UnsubscribeMessage,
            UnsubscribedMessage,
            WelcomeMessage,
            YieldMessage,
        },
    },
    router::{
        context::{
            RealmContext,
            RouterContext,
        },
        procedure::ProcedureManager,
        realm::RealmSession,
        topic::TopicManager,
    },
};

/// An in-flight procedure call issued by this session.
#[derive(Clone)]
struct RpcCall {
    invocation_id: Id,
    callee: Id,
    timeout: Duration,
    receive_progress: bool,
    state: Arc<Mutex<RpcCallState>>,
    // Subscribed before the INVOCATION is sent, so an immediate reply cannot be missed.
    reply_rx: Arc<Mutex<Option<broadcast::Receiver<ChannelTransmittableResult<RpcYield>>>>>,
}

#[derive(Debug, Default)]
struct RpcCallState {
    canceled: bool,
}

/// The terminal outcome of a procedure call that did not produce a RESULT.
enum CallTerminal {
    CalleeError(ChannelTransmittableError),
    Canceled,
    CalleeDisconnect,
    TimedOut,
}

/// The result of an invocation, produced by the callee session.
#[derive(Debug, Clone)]
pub struct RpcYield {
    pub invocation_id: Id,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub options: Dictionary,
}

/// A message related to procedure calls that must be strongly ordered.
#[derive(Debug, Clone)]
pub(crate) enum ProcedureMessage {
    Call(CallMessage),
    Cancel(CancelMessage),
}

#[derive(Default)]
struct EstablishedSessionState {
    realm: Uri,
    subscriptions: HashMap<Id, (WildcardUri, MatchStyle)>,
    registrations: HashMap<Id, (WildcardUri, MatchStyle)>,
    active_calls: HashMap<Id, RpcCall>,
}

impl Debug for EstablishedSessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        #[derive(Debug)]
        #[allow(unused)]
        struct DebugEstablishedSessionState<'a> {
            realm: &'a Uri,
        }

        DebugEstablishedSessionState { realm: &self.realm }.fmt(f)
    }
}

#[derive(Debug, Default)]
enum SessionState {
    #[default]
    Opening,
    Established(EstablishedSessionState),
    // The closing handshake keeps the established resources until the final cleanup.
    Closing(EstablishedSessionState),
    Closed,
}

impl SessionState {
    fn closing() -> Self {
        Self::Closing(EstablishedSessionState::default())
    }

    fn is_same_state(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (Self::Opening, Self::Opening)
                | (Self::Established(_), Self::Established(_))
                | (Self::Closing(_), Self::Closing(_))
                | (Self::Closed, Self::Closed)
        )
    }

    fn allowed_state_transition(&self, next: &Self) -> bool {
        matches!(
            (self, next),
            (Self::Opening, Self::Established(_))
                | (Self::Opening, Self::Closed)
                | (Self::Established(_), Self::Closing(_))
                | (Self::Established(_), Self::Closed)
                | (Self::Closing(_), Self::Closed)
        )
    }
}

/// A handle to an asynchronously-running router session.
#[derive(Clone)]
pub struct SessionHandle {
    id: Id,
    roles: Arc<RwLock<PeerRoles>>,
    id_allocator: Arc<Box<dyn IdAllocator>>,
    message_tx: UnboundedSender<Message>,
    closed_session_tx: broadcast::Sender<()>,
    rpc_reply_tx: broadcast::Sender<ChannelTransmittableResult<RpcYield>>,
}

impl SessionHandle {
    /// The session ID, as reported out to the peer.
    pub fn id(&self) -> Id {
        self.id
    }

    /// The roles the peer advertised when the session was established.
    pub async fn roles(&self) -> PeerRoles {
        self.roles.read().await.clone()
    }

    /// A reference to the session's ID generator.
    pub fn id_generator(&self) -> Arc<Box<dyn IdAllocator>> {
        self.id_allocator.clone()
    }

    /// Enqueues a message to be sent over the session.
    ///
    /// Messages are delivered to the peer in the order they are enqueued.
    pub fn send_message(&self, message: Message) -> Result<()> {
        self.message_tx.send(message).map_err(Error::new)
    }

    /// Closes the session with a GOODBYE handshake.
    pub fn close(&self, close_reason: CloseReason) -> Result<()> {
        self.send_message(goodbye_with_close_reason(close_reason))
    }

    /// The receiver channel that is populated when the session moves to the CLOSED state.
    pub fn closed_session_rx(&self) -> broadcast::Receiver<()> {
        self.closed_session_tx.subscribe()
    }

    /// The receiver channel for responses to INVOCATION messages sent to this session.
    pub(crate) fn rpc_reply_rx(
        &self,
    ) -> broadcast::Receiver<ChannelTransmittableResult<RpcYield>> {
        self.rpc_reply_tx.subscribe()
    }
}

/// The router end of a WAMP session.
///
/// Handles WAMP messages in a state machine and holds all session-scoped state.
pub struct Session {
    id: Id,
    connection_type: ConnectionType,
    message_tx: UnboundedSender<Message>,
    service_message_tx: UnboundedSender<Message>,
    state: RwLock<SessionState>,
    // Established resources parked at the transition to CLOSED, awaiting cleanup.
    retired_state: Mutex<Option<EstablishedSessionState>>,
    roles: Arc<RwLock<PeerRoles>>,
    id_allocator: Arc<Box<dyn IdAllocator>>,

    closed_session_tx: broadcast::Sender<()>,

    rpc_reply_tx: broadcast::Sender<ChannelTransmittableResult<RpcYield>>,
    _rpc_reply_rx: broadcast::Receiver<ChannelTransmittableResult<RpcYield>>,
    call_cancel_tx: broadcast::Sender<Id>,
    _call_cancel_rx: broadcast::Receiver<Id>,

    publish_tx: broadcast::Sender<PublishMessage>,
    procedure_message_tx: broadcast::Sender<ProcedureMessage>,
}

impl Session {
    /// Creates a new session.
    ///
    /// `message_tx` is the router-internal channel consumed by the connection's session loop;
    /// `service_message_tx` feeds the service that owns the wire.
    pub fn new(
        id: Id,
        connection_type: ConnectionType,
        message_tx: UnboundedSender<Message>,
        service_message_tx: UnboundedSender<Message>,
    ) -> Self {
        let (closed_session_tx, _) = broadcast::channel(16);
        let (rpc_reply_tx, rpc_reply_rx) = broadcast::channel(256);
        let (call_cancel_tx, call_cancel_rx) = broadcast::channel(256);
        let (publish_tx, _) = broadcast::channel(256);
        let (procedure_message_tx, _) = broadcast::channel(256);
        Self {
            id,
            connection_type,
            message_tx,
            service_message_tx,
            state: RwLock::new(SessionState::default()),
            retired_state: Mutex::new(None),
            roles: Arc::new(RwLock::new(PeerRoles::default())),
            id_allocator: Arc::new(Box::new(SequentialIdAllocator::default())),
            closed_session_tx,
            rpc_reply_tx,
            _rpc_reply_rx: rpc_reply_rx,
            call_cancel_tx,
            _call_cancel_rx: call_cancel_rx,
            publish_tx,
            procedure_message_tx,
        }
    }

    /// The session ID.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Checks if the session is closed.
    pub async fn closed(&self) -> bool {
        matches!(*self.state.read().await, SessionState::Closed)
    }

    /// Generates a handle to the session, which can be saved separately from the session's
    /// lifecycle.
    pub fn session_handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            roles: self.roles.clone(),
            id_allocator: self.id_allocator.clone(),
            message_tx: self.message_tx.clone(),
            closed_session_tx: self.closed_session_tx.clone(),
            rpc_reply_tx: self.rpc_reply_tx.clone(),
        }
    }

    /// The receiver channel for publications, for strong ordering.
    pub(crate) fn publish_rx(&self) -> broadcast::Receiver<PublishMessage> {
        self.publish_tx.subscribe()
    }

    /// The receiver channel for procedure call messages, for strong ordering.
    pub(crate) fn procedure_message_rx(&self) -> broadcast::Receiver<ProcedureMessage> {
        self.procedure_message_tx.subscribe()
    }

    async fn get_from_established_session_state<F, T>(&self, f: F) -> Result<T, Error>
    where
        F: Fn(&EstablishedSessionState) -> T,
    {
        match &*self.state.read().await {
            SessionState::Established(state) => Ok(f(state)),
            _ => Err(Error::msg("session is not in the established state")),
        }
    }

    async fn modify_established_session_state<F, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut EstablishedSessionState) -> T,
    {
        match &mut *self.state.write().await {
            SessionState::Established(state) => Ok(f(state)),
            _ => Err(Error::msg("session is not in the established state")),
        }
    }

    /// Sends a message to the peer through the session state machine.
    ///
    /// No message is delivered on a closed session; a closing session only lets the closing
    /// handshake through.
    pub async fn send_message(&self, message: Message) -> Result<()> {
        match &*self.state.read().await {
            SessionState::Closed => {
                debug!(
                    "Dropped {} message for closed session {}",
                    message.message_name(),
                    self.id
                );
                return Ok(());
            }
            SessionState::Closing(_)
                if !matches!(message, Message::Goodbye(_) | Message::Abort(_)) =>
            {
                debug!(
                    "Dropped {} message for closing session {}",
                    message.message_name(),
                    self.id
                );
                return Ok(());
            }
            _ => (),
        }
        self.transition_state_from_sending_message(&message).await?;
        self.service_message_tx.send(message).map_err(Error::new)
    }

    async fn transition_state_from_sending_message(&self, message: &Message) -> Result<()> {
        let next_state = match message {
            Message::Abort(_) => SessionState::Closed,
            Message::Goodbye(_) => match *self.state.read().await {
                SessionState::Closing(_) => SessionState::Closed,
                _ => SessionState::closing(),
            },
            _ => return Ok(()),
        };
        self.transition_state(next_state).await
    }

    /// Handles a message over the session state machine.
    pub async fn handle_message<S>(
        &self,
        context: RouterContext<S>,
        message: Message,
    ) -> Result<()> {
        debug!("Received message for session {}: {message:?}", self.id);
        if let Err(err) = self.handle_message_on_state_machine(&context, message).await {
            self.send_message(abort_message_for_error(&err)).await?;
            return Err(err);
        }
        Ok(())
    }

    async fn handle_message_on_state_machine<S>(
        &self,
        context: &RouterContext<S>,
        message: Message,
    ) -> Result<()> {
        // Read state separately from handling the message, so that we don't lock the session
        // state.
        let mut opening = false;
        let mut closing = false;
        let mut closed = false;
        match *self.state.read().await {
            SessionState::Opening => opening = true,
            SessionState::Closing(_) => closing = true,
            SessionState::Closed => closed = true,
            _ => (),
        }

        if closed {
            Err(InteractionError::ProtocolViolation(format!(
                "received {} message on a closed session",
                message.message_name()
            ))
            .into())
        } else if closing {
            self.handle_closing(context, message).await
        } else if opening {
            self.handle_opening(context, message).await
        } else {
            self.handle_established(context, message).await
        }
    }

    async fn handle_opening<S>(&self, context: &RouterContext<S>, message: Message) -> Result<()> {
        match message {
            Message::Hello(message) => {
                if let Err(err) = self.handle_hello(context, &message).await {
                    return self.send_message(abort_message_for_error(&err)).await;
                }
                Ok(())
            }
            Message::Abort(_) => {
                warn!("Router session {} aborted by peer: {message:?}", self.id);
                self.transition_state(SessionState::Closed).await
            }
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message on an opening session",
                message.message_name()
            ))
            .into()),
        }
    }

    async fn handle_hello<S>(
        &self,
        context: &RouterContext<S>,
        message: &HelloMessage,
    ) -> Result<()> {
        let realm_context = context.realm_context(&message.realm)?;

        // Session acceptance is delegated to the external authentication hook.
        context
            .router()
            .session_policies()
            .authenticate_session(&realm_context, self.id, message)
            .await?;

        *self.roles.write().await = PeerRoles::from_details(&message.details);

        realm_context.lock().await.sessions.insert(
            self.id,
            RealmSession {
                session: self.session_handle(),
            },
        );
        info!("Session {} joined realm {}", self.id, message.realm);

        self.transition_state(SessionState::Established(EstablishedSessionState {
            realm: message.realm.clone(),
            subscriptions: HashMap::default(),
            registrations: HashMap::default(),
            active_calls: HashMap::default(),
        }))
        .await?;

        let details = Dictionary::from_iter([
            (
                "agent".to_owned(),
                Value::String(context.router().config().agent.clone()),
            ),
            (
                "roles".to_owned(),
                Value::Dictionary(router_roles_details(
                    context.router().config().roles.iter().cloned(),
                )),
            ),
        ]);
        self.send_message(Message::Welcome(WelcomeMessage {
            session: self.id,
            details,
        }))
        .await
    }

    async fn handle_established<S>(
        &self,
        context: &RouterContext<S>,
        message: Message,
    ) -> Result<()> {
        match message {
            Message::Abort(_) => {
                warn!("Router session {} aborted by peer: {message:?}", self.id);
                self.transition_state(SessionState::Closed).await
            }
            Message::Goodbye(_) => {
                self.transition_state(SessionState::closing()).await?;
                self.send_message(goodbye_and_out()).await
            }
            ref message @ Message::Subscribe(ref subscribe_message) => {
                if let Err(err) = self.handle_subscribe(context, subscribe_message).await {
                    return self.send_message(error_for_request(message, &err)).await;
                }
                Ok(())
            }
            ref message @ Message::Unsubscribe(ref unsubscribe_message) => {
                if let Err(err) = self.handle_unsubscribe(context, unsubscribe_message).await {
                    return self.send_message(error_for_request(message, &err)).await;
                }
                Ok(())
            }
            ref message @ Message::Publish(ref publish_message) => {
                if let Err(err) = self.handle_publish(context, publish_message).await {
                    return self.send_message(error_for_request(message, &err)).await;
                }
                Ok(())
            }
            ref message @ Message::Register(ref register_message) => {
                if let Err(err) = self.handle_register(context, register_message).await {
                    return self.send_message(error_for_request(message, &err)).await;
                }
                Ok(())
            }
            ref message @ Message::Unregister(ref unregister_message) => {
                if let Err(err) = self.handle_unregister(context, unregister_message).await {
                    return self.send_message(error_for_request(message, &err)).await;
                }
                Ok(())
            }
            ref message @ Message::Call(ref call_message) => {
                if let Err(err) = self.handle_call(context, call_message).await {
                    return self.send_message(error_for_request(message, &err)).await;
                }
                Ok(())
            }
            ref message @ Message::Yield(ref yield_message) => {
                if let Err(err) = self.handle_yield(context, yield_message).await {
                    return self.send_message(error_for_request(message, &err)).await;
                }
                Ok(())
            }
            ref message @ Message::Cancel(ref cancel_message) => {
                if let Err(err) = self.handle_cancel(context, cancel_message).await {
                    return self.send_message(error_for_request(message, &err)).await;
                }
                Ok(())
            }
            Message::Error(ref error_message) => {
                match error_message.request_type {
                    Message::INVOCATION_TAG => {
                        self.rpc_reply_tx
                            .send(Err(ChannelTransmittableError::try_from(&message)?))
                            .ok();
                    }
                    _ => {
                        error!(
                            "Invalid ERROR message with request type {} received from the peer: {error_message:?}",
                            error_message.request_type
                        );
                        return Err(
                            BasicError::InvalidArgument("invalid request type".to_owned()).into(),
                        );
                    }
                }
                Ok(())
            }
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message on an established session",
                message.message_name()
            ))
            .into()),
        }
    }

    fn match_style_option(options: &Dictionary) -> Result<MatchStyle> {
        match options.get("match") {
            None => Ok(MatchStyle::default()),
            Some(value) => value
                .string()
                .ok_or_else(|| {
                    Error::new(BasicError::InvalidArgument(
                        "match option must be a string".to_owned(),
                    ))
                })
                .and_then(|value| {
                    MatchStyle::try_from(value)
                        .map_err(|err| BasicError::InvalidArgument(err.to_string()).into())
                }),
        }
    }

    async fn handle_subscribe<S>(
        &self,
        context: &RouterContext<S>,
        message: &SubscribeMessage,
    ) -> Result<()> {
        if !self.roles.read().await.has(PeerRole::Subscriber) {
            return Err(BasicError::NotAllowed("peer is not a subscriber".to_owned()).into());
        }
        let realm = self
            .get_from_established_session_state(|state| state.realm.clone())
            .await?;
        let context = context.realm_context(&realm)?;
        let match_style = Self::match_style_option(&message.options)?;
        let subscription =
            TopicManager::subscribe(&context, self.id, message.topic.clone(), match_style).await?;
        self.modify_established_session_state(|state| {
            state
                .subscriptions
                .insert(subscription, (message.topic.clone(), match_style))
        })
        .await?;
        self.send_message(Message::Subscribed(SubscribedMessage {
            subscribe_request: message.request,
            subscription,
        }))
        .await?;
        // Activate the subscription only after sending the response, so that the peer does not
        // receive events prior to the confirmation.
        TopicManager::activate_subscription(&context, self.id, &message.topic, match_style).await;
        Ok(())
    }

    async fn handle_unsubscribe<S>(
        &self,
        context: &RouterContext<S>,
        message: &UnsubscribeMessage,
    ) -> Result<()> {
        let (topic, match_style) = self
            .modify_established_session_state(|state| {
                state
                    .subscriptions
                    .remove(&message.subscribed_subscription)
                    .ok_or(InteractionError::NoSuchSubscription)
            })
            .await??;
        let realm = self
            .get_from_established_session_state(|state| state.realm.clone())
            .await?;
        let context = context.realm_context(&realm)?;
        TopicManager::unsubscribe(&context, self.id, &topic, match_style).await;
        self.send_message(Message::Unsubscribed(UnsubscribedMessage {
            unsubscribe_request: message.request,
        }))
        .await
    }

    async fn handle_publish<S>(
        &self,
        _: &RouterContext<S>,
        message: &PublishMessage,
    ) -> Result<()> {
        self.publish_tx
            .send(message.clone())
            .map(|_| ())
            .map_err(Error::new)
    }

    /// Handles an ordered publication from the peer.
    ///
    /// Returns when the publication has been enqueued to all subscribers.
    pub async fn handle_ordered_publish<S>(
        &self,
        context: &RouterContext<S>,
        message: PublishMessage,
    ) -> Result<()> {
        if let Err(err) = self.handle_ordered_publish_internal(context, &message).await {
            self.send_message(error_for_request(&Message::Publish(message), &err))
                .await?;
        }
        Ok(())
    }

    async fn handle_ordered_publish_internal<S>(
        &self,
        context: &RouterContext<S>,
        message: &PublishMessage,
    ) -> Result<()> {
        if !self.roles.read().await.has(PeerRole::Publisher) {
            return Err(BasicError::NotAllowed("peer is not a publisher".to_owned()).into());
        }
        let options = PublishOptions::try_from(message)?;
        let realm = self
            .get_from_established_session_state(|state| state.realm.clone())
            .await?;
        let context = context.realm_context(&realm)?;
        let (publication, _) =
            TopicManager::publish(&context, self.id, message, &options).await?;
        if options.acknowledge {
            self.send_message(Message::Published(PublishedMessage {
                publish_request: message.request,
                publication,
            }))
            .await?;
        }
        Ok(())
    }

    async fn handle_register<S>(
        &self,
        context: &RouterContext<S>,
        message: &RegisterMessage,
    ) -> Result<()> {
        if !self.roles.read().await.has(PeerRole::Callee) {
            return Err(BasicError::NotAllowed("peer is not a callee".to_owned()).into());
        }
        let realm = self
            .get_from_established_session_state(|state| state.realm.clone())
            .await?;
        let context = context.realm_context(&realm)?;

        let match_style = Self::match_style_option(&message.options)?;
        if let Some(invoke) = message.options.get("invoke") {
            let invoke = invoke.string().ok_or_else(|| {
                Error::new(BasicError::InvalidArgument(
                    "invoke option must be a string".to_owned(),
                ))
            })?;
            if invoke != "single" {
                return Err(BasicError::NotAllowed(format!(
                    "invocation policy {invoke} is not supported"
                ))
                .into());
            }
        }

        let registration = ProcedureManager::register(
            &context,
            self.id,
            message.procedure.clone(),
            match_style,
        )
        .await?;
        self.modify_established_session_state(|state| {
            state
                .registrations
                .insert(registration, (message.procedure.clone(), match_style))
        })
        .await?;
        self.send_message(Message::Registered(RegisteredMessage {
            register_request: message.request,
            registration,
        }))
        .await?;
        // Activate the procedure only after sending the response, so that the peer does not
        // receive invocations prior to the confirmation.
        ProcedureManager::activate_procedure(&context, &message.procedure, match_style).await;
        Ok(())
    }

    async fn handle_unregister<S>(
        &self,
        context: &RouterContext<S>,
        message: &UnregisterMessage,
    ) -> Result<()> {
        let (procedure, match_style) = self
            .modify_established_session_state(|state| {
                state
                    .registrations
                    .remove(&message.registered_registration)
                    .ok_or(InteractionError::NoSuchRegistration)
            })
            .await??;
        let realm = self
            .get_from_established_session_state(|state| state.realm.clone())
            .await?;
        let context = context.realm_context(&realm)?;
        ProcedureManager::unregister(&context, &procedure, match_style).await;
        self.send_message(Message::Unregistered(UnregisteredMessage {
            unregister_request: message.request,
        }))
        .await
    }

    async fn handle_call<S>(&self, _: &RouterContext<S>, message: &CallMessage) -> Result<()> {
        self.procedure_message_tx
            .send(ProcedureMessage::Call(message.clone()))
            .map(|_| ())
            .map_err(Error::new)
    }

    async fn handle_cancel<S>(&self, _: &RouterContext<S>, message: &CancelMessage) -> Result<()> {
        self.procedure_message_tx
            .send(ProcedureMessage::Cancel(message.clone()))
            .map(|_| ())
            .map_err(Error::new)
    }

    /// Handles an ordered procedure call from the peer.
    ///
    /// Returns when the invocation has been sent to the callee. Returns the original call request
    /// ID for [`Self::handle_call_result`].
    pub async fn handle_ordered_call<S>(
        &self,
        context: &RouterContext<S>,
        message: CallMessage,
    ) -> Result<Option<Id>> {
        match self.handle_ordered_call_internal(context, &message).await {
            Ok(()) => Ok(Some(message.request)),
            Err(err) => {
                self.modify_established_session_state(|state| {
                    state.active_calls.remove(&message.request)
                })
                .await
                .ok();
                self.send_message(error_for_request(&Message::Call(message), &err))
                    .await?;
                Ok(None)
            }
        }
    }

    async fn handle_ordered_call_internal<S>(
        &self,
        context: &RouterContext<S>,
        message: &CallMessage,
    ) -> Result<()> {
        if !self.roles.read().await.has(PeerRole::Caller) {
            return Err(BasicError::NotAllowed("peer is not a caller".to_owned()).into());
        }
        let realm = self
            .get_from_established_session_state(|state| state.realm.clone())
            .await?;
        let context = context.realm_context(&realm)?;

        context
            .router()
            .rpc_policies()
            .validate_call(&context, self.id, &message.procedure)
            .await?;

        let receive_progress = message
            .options
            .get("receive_progress")
            .and_then(|value| value.bool())
            .unwrap_or(false);
        let disclose_me = message
            .options
            .get("disclose_me")
            .and_then(|value| value.bool())
            .unwrap_or(false);
        let timeout = message
            .options
            .get("timeout")
            .and_then(|value| value.integer())
            .unwrap_or(0);
        let timeout = Duration::from_millis(timeout);

        let (registration_id, callee_id, callee) = {
            let realm = context.lock().await;
            let (_, procedure) = realm
                .procedure_manager
                .match_procedure(&message.procedure)
                .ok_or(InteractionError::NoSuchProcedure)?;
            let callee = realm
                .sessions
                .get(&procedure.callee)
                .ok_or(InteractionError::NoSuchProcedure)?;
            (
                procedure.registration_id,
                procedure.callee,
                callee.session.clone(),
            )
        };

        // Invocation IDs are scoped to the callee session.
        let invocation_id = callee.id_generator().generate_id().await?;

        let call = RpcCall {
            invocation_id,
            callee: callee_id,
            timeout,
            receive_progress,
            state: Arc::new(Mutex::new(RpcCallState::default())),
            reply_rx: Arc::new(Mutex::new(Some(callee.rpc_reply_rx()))),
        };
        self.modify_established_session_state(|state| {
            state.active_calls.insert(message.request, call)
        })
        .await?;

        let mut details = Dictionary::from_iter([(
            "procedure".to_owned(),
            Value::String(message.procedure.to_string()),
        )]);
        if receive_progress {
            details.insert("receive_progress".to_owned(), Value::Bool(true));
        }
        if !timeout.is_zero() {
            details.insert(
                "timeout".to_owned(),
                Value::Integer(timeout.as_millis() as u64),
            );
        }
        if disclose_me {
            details.insert("caller".to_owned(), Value::Integer(self.id.into()));
        }

        callee.send_message(Message::Invocation(InvocationMessage {
            request: invocation_id,
            registered_registration: registration_id,
            details,
            call_arguments: message.arguments.clone(),
            call_arguments_keyword: message.arguments_keyword.clone(),
        }))?;
        Ok(())
    }

    /// Drives the call mapped to the request ID returned from [`Self::handle_ordered_call`] until
    /// its terminal response.
    ///
    /// Exactly one terminal message reaches the caller: the first of a final RESULT, a callee
    /// ERROR, cancellation, timeout, or callee disconnect wins. Progressive results may be
    /// forwarded along the way.
    pub async fn handle_call_result<S>(
        &self,
        context: &RouterContext<S>,
        call_request: Id,
    ) -> Result<()> {
        // The session may be tearing down concurrently; there is nothing left to drive.
        let (realm, call) = match self
            .get_from_established_session_state(|state| {
                (
                    state.realm.clone(),
                    state.active_calls.get(&call_request).cloned(),
                )
            })
            .await
        {
            Ok((realm, call)) => (realm, call),
            Err(_) => return Ok(()),
        };
        let call = match call {
            Some(call) => call,
            None => return Ok(()),
        };
        let context = context.realm_context(&realm)?;

        let result = self.drive_call(&context, call_request, &call).await;

        // Forget the call only when everything is done.
        self.modify_established_session_state(|state| state.active_calls.remove(&call_request))
            .await
            .ok();
        result
    }

    async fn drive_call<S>(
        &self,
        context: &RealmContext<S>,
        call_request: Id,
        call: &RpcCall,
    ) -> Result<()> {
        let callee = match context.session(call.callee).await {
            Some(callee) => callee,
            None => {
                return self
                    .finish_call(call_request, CallTerminal::CalleeDisconnect)
                    .await;
            }
        };
        let mut rpc_reply_rx = match call.reply_rx.lock().await.take() {
            Some(rpc_reply_rx) => rpc_reply_rx,
            None => callee.rpc_reply_rx(),
        };
        let mut cancel_rx = self.call_cancel_tx.subscribe();
        let mut caller_closed_rx = self.closed_session_tx.subscribe();
        let mut callee_closed_rx = callee.closed_session_rx();

        // The cancellation may have landed before the subscriptions above.
        if call.state.lock().await.canceled {
            return self.finish_call(call_request, CallTerminal::Canceled).await;
        }

        let mut timeout: Pin<Box<dyn Future<Output = ()> + Send>> = if call.timeout.is_zero() {
            Box::pin(futures_util::future::pending())
        } else {
            Box::pin(tokio::time::sleep(call.timeout))
        };

        loop {
            tokio::select! {
                reply = rpc_reply_rx.recv() => {
                    match reply {
                        Ok(Ok(rpc_yield)) if rpc_yield.invocation_id == call.invocation_id => {
                            let progress = call.receive_progress
                                && rpc_yield
                                    .options
                                    .get("progress")
                                    .and_then(|value| value.bool())
                                    .unwrap_or(false);
                            let mut details = Dictionary::default();
                            if progress {
                                details.insert("progress".to_owned(), Value::Bool(true));
                            }
                            self.send_message(Message::Result(ResultMessage {
                                call_request,
                                details,
                                yield_arguments: rpc_yield.arguments,
                                yield_arguments_keyword: rpc_yield.arguments_keyword,
                            }))
                            .await?;
                            if !progress || call.state.lock().await.canceled {
                                return Ok(());
                            }
                        }
                        Ok(Err(err)) if err.request_id == Some(call.invocation_id) => {
                            return self
                                .finish_call(call_request, CallTerminal::CalleeError(err))
                                .await;
                        }
                        Ok(_) => continue,
                        Err(RecvError::Closed) => {
                            return self
                                .finish_call(call_request, CallTerminal::CalleeDisconnect)
                                .await;
                        }
                        Err(RecvError::Lagged(_)) => continue,
                    }
                }
                invocation_id = cancel_rx.recv() => {
                    if invocation_id.is_ok_and(|id| id == call.invocation_id) {
                        return self.finish_call(call_request, CallTerminal::Canceled).await;
                    }
                }
                _ = caller_closed_rx.recv() => {
                    // The caller left; interrupt the callee. No terminal message is owed.
                    self.interrupt_callee(&callee, call, CallCancelMode::KillNoWait);
                    return Ok(());
                }
                _ = callee_closed_rx.recv() => {
                    return self
                        .finish_call(call_request, CallTerminal::CalleeDisconnect)
                        .await;
                }
                _ = &mut timeout => {
                    self.interrupt_callee(&callee, call, CallCancelMode::KillNoWait);
                    return self.finish_call(call_request, CallTerminal::TimedOut).await;
                }
            }
        }
    }

    fn interrupt_callee(&self, callee: &SessionHandle, call: &RpcCall, mode: CallCancelMode) {
        let interrupt = Message::Interrupt(InterruptMessage {
            invocation_request: call.invocation_id,
            options: Dictionary::from_iter([("mode".to_owned(), Value::String(mode.into()))]),
        });
        if let Err(err) = callee.send_message(interrupt) {
            debug!(
                "Failed to send INTERRUPT to callee session {}: {err}",
                callee.id()
            );
        }
    }

    async fn finish_call(&self, call_request: Id, terminal: CallTerminal) -> Result<()> {
        let (reason, mut details) = match terminal {
            CallTerminal::CalleeError(err) => (
                err.reason.clone(),
                Dictionary::from_iter([("message".to_owned(), Value::String(err.message))]),
            ),
            CallTerminal::Canceled => (
                uri_for_error(&Error::new(InteractionError::Canceled)),
                Dictionary::default(),
            ),
            CallTerminal::CalleeDisconnect => (
                uri_for_error(&Error::new(InteractionError::Canceled)),
                Dictionary::from_iter([(
                    "reason".to_owned(),
                    Value::String("callee_disconnect".to_owned()),
                )]),
            ),
            CallTerminal::TimedOut => (
                uri_for_error(&Error::new(InteractionError::Timeout)),
                Dictionary::default(),
            ),
        };
        details
            .entry("message".to_owned())
            .or_insert_with(|| Value::String("call did not complete".to_owned()));
        self.send_message(Message::Error(ErrorMessage {
            request_type: Message::CALL_TAG,
            request: call_request,
            details,
            error: reason,
            ..Default::default()
        }))
        .await
    }

    /// Handles an ordered procedure call cancel from the peer.
    pub async fn handle_ordered_cancel<S>(
        &self,
        context: &RouterContext<S>,
        message: CancelMessage,
    ) -> Result<()> {
        let mode = match message.options.get("mode").and_then(|mode| mode.string()) {
            Some(mode) => CallCancelMode::try_from(mode).unwrap_or_default(),
            None => CallCancelMode::default(),
        };

        let (realm, call) = match self
            .get_from_established_session_state(|state| {
                (
                    state.realm.clone(),
                    state.active_calls.get(&message.call_request).cloned(),
                )
            })
            .await
        {
            Ok((realm, call)) => (realm, call),
            Err(_) => return Ok(()),
        };

        // If there is no active call for the request being canceled, the terminal response has
        // already been emitted, and there is nothing to do.
        let call = match call {
            Some(call) => call,
            None => return Ok(()),
        };
        let context = context.realm_context(&realm)?;

        // Mark the call as canceled, so the task driving the call knows to stop.
        call.state.lock().await.canceled = true;

        if mode != CallCancelMode::Skip {
            if let Some(callee) = context.session(call.callee).await {
                self.interrupt_callee(&callee, &call, mode);
            }
        }

        if mode != CallCancelMode::Kill {
            // Notify the task driving the call to respond to the caller immediately. With the
            // kill mode, the callee's own terminal reply is awaited instead.
            self.call_cancel_tx.send(call.invocation_id).ok();
        }

        Ok(())
    }

    async fn handle_yield<S>(&self, _: &RouterContext<S>, message: &YieldMessage) -> Result<()> {
        self.rpc_reply_tx
            .send(Ok(RpcYield {
                invocation_id: message.invocation_request,
                arguments: message.arguments.clone(),
                arguments_keyword: message.arguments_keyword.clone(),
                options: message.options.clone(),
            }))
            .ok();
        Ok(())
    }

    async fn handle_closing<S>(&self, _: &RouterContext<S>, message: Message) -> Result<()> {
        match message {
            Message::Goodbye(_) => self.transition_state(SessionState::Closed).await,
            _ => Ok(()),
        }
    }

    async fn validate_state_transition(&self, state: &SessionState) -> Result<bool> {
        let current_state = self.state.read().await;
        if current_state.is_same_state(state) {
            return Ok(true);
        }

        if !current_state.allowed_state_transition(state) {
            return Err(BasicError::Internal(format!(
                "invalid state transition from {current_state:?} to {state:?}"
            ))
            .into());
        }

        Ok(false)
    }

    async fn transition_state(&self, state: SessionState) -> Result<()> {
        if self.validate_state_transition(&state).await? {
            return Ok(());
        }

        debug!(
            "Router session {} ({:?}) transitioned from {:?} to {state:?}",
            self.id,
            self.connection_type,
            self.state.read().await
        );
        {
            let mut current = self.state.write().await;
            let next = match (std::mem::take(&mut *current), state) {
                // Established resources move into the closing handshake state, so they are still
                // revoked at cleanup.
                (SessionState::Established(established), SessionState::Closing(_)) => {
                    SessionState::Closing(established)
                }
                (
                    SessionState::Established(established) | SessionState::Closing(established),
                    next @ SessionState::Closed,
                ) => {
                    *self.retired_state.lock().await = Some(established);
                    next
                }
                (_, next) => next,
            };
            *current = next;
        }

        match &*self.state.read().await {
            SessionState::Established(_) => {
                self.id_allocator.reset().await;
            }
            SessionState::Closed => {
                self.closed_session_tx.send(()).ok();
            }
            _ => (),
        }

        Ok(())
    }

    /// Cleans up all session-scoped state on the router.
    ///
    /// Subscriptions and registrations are revoked under one realm lock, so no message from
    /// another session can observe a partially-removed session.
    pub async fn clean_up<S>(&self, context: &RouterContext<S>) {
        let established = {
            let mut state = self.state.write().await;
            match std::mem::take(&mut *state) {
                SessionState::Established(established) | SessionState::Closing(established) => {
                    *state = SessionState::Closed;
                    Some(established)
                }
                _ => {
                    *state = SessionState::Closed;
                    None
                }
            }
        };
        self.closed_session_tx.send(()).ok();

        let established = match established {
            Some(established) => Some(established),
            None => self.retired_state.lock().await.take(),
        };
        let established = match established {
            Some(established) => established,
            None => return,
        };

        let context = match context.realm_context(&established.realm) {
            Ok(context) => context,
            Err(err) => {
                error!(
                    "Failed to clean up session {}, due to error getting context for realm {}: {err:?}",
                    self.id, established.realm
                );
                return;
            }
        };

        let mut removed_topics = Vec::default();
        {
            let mut realm = context.lock().await;
            for (topic, match_style) in established.subscriptions.values() {
                if realm
                    .topic_manager
                    .remove_subscriber(topic, *match_style, self.id)
                {
                    removed_topics.push(topic.clone());
                }
            }
            for (procedure, match_style) in established.registrations.values() {
                realm.procedure_manager.remove(procedure, *match_style);
            }
            realm.sessions.remove(&self.id);
        }

        let realm_uri = established.realm;
        for topic in removed_topics {
            context
                .router()
                .pub_sub_policies()
                .topic_removed(&realm_uri, &topic);
        }
        info!("Session {} left realm {realm_uri}", self.id);
    }
}

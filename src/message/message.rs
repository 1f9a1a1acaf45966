use anyhow::Result;

use crate::core::{
    error::InteractionError,
    id::Id,
    types::{
        Dictionary,
        Integer,
        List,
        Value,
    },
    uri::{
        Uri,
        WildcardUri,
    },
};

/// A HELLO message for a peer to initiate a WAMP session in a realm.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HelloMessage {
    pub realm: Uri,
    pub details: Dictionary,
}

/// A WELCOME message for a router to confirm a peer's WAMP session in a realm.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WelcomeMessage {
    pub session: Id,
    pub details: Dictionary,
}

/// An ABORT message for quickly terminating a WAMP session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AbortMessage {
    pub details: Dictionary,
    pub reason: Uri,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

/// A GOODBYE message for ending a WAMP session with a two-way handshake.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GoodbyeMessage {
    pub details: Dictionary,
    pub reason: Uri,
}

/// An ERROR message for communicating an error in response to a single request.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub request_type: Integer,
    pub request: Id,
    pub details: Dictionary,
    pub error: Uri,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

/// A PUBLISH message for publishing an event to a topic.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishMessage {
    pub request: Id,
    pub options: Dictionary,
    pub topic: Uri,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

/// A PUBLISHED message for confirming an event was published.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub publish_request: Id,
    pub publication: Id,
}

/// A SUBSCRIBE message for subscribing to a topic.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscribeMessage {
    pub request: Id,
    pub options: Dictionary,
    pub topic: WildcardUri,
}

/// A SUBSCRIBED message for confirming a peer has subscribed to a topic.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscribedMessage {
    pub subscribe_request: Id,
    pub subscription: Id,
}

/// An UNSUBSCRIBE message for unsubscribing from a topic.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnsubscribeMessage {
    pub request: Id,
    pub subscribed_subscription: Id,
}

/// An UNSUBSCRIBED message for confirming a peer has unsubscribed from a topic.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnsubscribedMessage {
    pub unsubscribe_request: Id,
}

/// An EVENT message for relaying a published event to subscribers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EventMessage {
    pub subscribed_subscription: Id,
    pub published_publication: Id,
    pub details: Dictionary,
    pub publish_arguments: List,
    pub publish_arguments_keyword: Dictionary,
}

/// A CALL message for invoking a procedure.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallMessage {
    pub request: Id,
    pub options: Dictionary,
    pub procedure: Uri,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

/// A CANCEL message for canceling a previously-issued procedure call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CancelMessage {
    pub call_request: Id,
    pub options: Dictionary,
}

/// A RESULT message for sending the result of a procedure invocation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResultMessage {
    pub call_request: Id,
    pub details: Dictionary,
    pub yield_arguments: List,
    pub yield_arguments_keyword: Dictionary,
}

/// A REGISTER message for registering a procedure in the realm.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegisterMessage {
    pub request: Id,
    pub options: Dictionary,
    pub procedure: WildcardUri,
}

/// A REGISTERED message for confirming a procedure has been registered.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegisteredMessage {
    pub register_request: Id,
    pub registration: Id,
}

/// An UNREGISTER message for unregistering a procedure in the realm.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnregisterMessage {
    pub request: Id,
    pub registered_registration: Id,
}

/// An UNREGISTERED message for confirming a procedure has been unregistered.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnregisteredMessage {
    pub unregister_request: Id,
}

/// An INVOCATION message for invoking a procedure on its callee.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InvocationMessage {
    pub request: Id,
    pub registered_registration: Id,
    pub details: Dictionary,
    pub call_arguments: List,
    pub call_arguments_keyword: Dictionary,
}

/// An INTERRUPT message for interrupting an in-flight invocation on its callee.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InterruptMessage {
    pub invocation_request: Id,
    pub options: Dictionary,
}

/// A YIELD message for yielding the result of an invocation from the callee.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct YieldMessage {
    pub invocation_request: Id,
    pub options: Dictionary,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

/// A WAMP message.
///
/// On the wire, every message is an array whose first element is an integer type tag. The
/// [`Self::to_list`] and [`Self::from_list`] methods implement that framing; serializers only
/// handle the byte representation of the resulting value list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(HelloMessage),
    Welcome(WelcomeMessage),
    Abort(AbortMessage),
    Goodbye(GoodbyeMessage),
    Error(ErrorMessage),
    Publish(PublishMessage),
    Published(PublishedMessage),
    Subscribe(SubscribeMessage),
    Subscribed(SubscribedMessage),
    Unsubscribe(UnsubscribeMessage),
    Unsubscribed(UnsubscribedMessage),
    Event(EventMessage),
    Call(CallMessage),
    Cancel(CancelMessage),
    Result(ResultMessage),
    Register(RegisterMessage),
    Registered(RegisteredMessage),
    Unregister(UnregisterMessage),
    Unregistered(UnregisteredMessage),
    Invocation(InvocationMessage),
    Interrupt(InterruptMessage),
    Yield(YieldMessage),
}

/// Reads typed fields off a decoded message array, in order.
struct MessageReader {
    name: &'static str,
    values: std::vec::IntoIter<Value>,
}

impl MessageReader {
    fn new(name: &'static str, values: std::vec::IntoIter<Value>) -> Self {
        Self { name, values }
    }

    fn violation(&self, what: String) -> anyhow::Error {
        InteractionError::ProtocolViolation(format!("{} message {what}", self.name)).into()
    }

    fn next(&mut self, field: &str) -> Result<Value> {
        self.values
            .next()
            .ok_or_else(|| self.violation(format!("is missing {field}")))
    }

    fn id(&mut self, field: &str) -> Result<Id> {
        let value = self.next(field)?;
        value
            .integer()
            .and_then(|value| Id::try_from(value).ok())
            .ok_or_else(|| self.violation(format!("has an invalid {field}")))
    }

    fn integer(&mut self, field: &str) -> Result<Integer> {
        self.next(field)?
            .integer()
            .ok_or_else(|| self.violation(format!("has an invalid {field}")))
    }

    fn uri(&mut self, field: &str) -> Result<Uri> {
        let value = self.next(field)?;
        value
            .string()
            .and_then(|value| Uri::try_from(value).ok())
            .ok_or_else(|| self.violation(format!("has an invalid {field}")))
    }

    fn wildcard_uri(&mut self, field: &str) -> Result<WildcardUri> {
        let value = self.next(field)?;
        value
            .string()
            .and_then(|value| WildcardUri::try_from(value).ok())
            .ok_or_else(|| self.violation(format!("has an invalid {field}")))
    }

    fn dictionary(&mut self, field: &str) -> Result<Dictionary> {
        match self.next(field)? {
            Value::Dictionary(value) => Ok(value),
            _ => Err(self.violation(format!("has an invalid {field}"))),
        }
    }

    /// Reads a trailing dictionary that may be omitted entirely.
    fn trailing_dictionary(&mut self, field: &str) -> Result<Dictionary> {
        match self.values.next() {
            Some(Value::Dictionary(value)) => Ok(value),
            Some(_) => Err(self.violation(format!("has an invalid {field}"))),
            None => Ok(Dictionary::default()),
        }
    }

    /// Reads a trailing list that may be omitted entirely.
    fn trailing_list(&mut self, field: &str) -> Result<List> {
        match self.values.next() {
            Some(Value::List(value)) => Ok(value),
            Some(_) => Err(self.violation(format!("has an invalid {field}"))),
            None => Ok(List::default()),
        }
    }

    fn finish(mut self) -> Result<()> {
        if self.values.next().is_some() {
            return Err(self.violation("has trailing elements".to_owned()));
        }
        Ok(())
    }
}

fn push_payload(list: &mut List, arguments: &List, arguments_keyword: &Dictionary) {
    // Trailing empty payloads are omitted, but keyword arguments force the positional list to be
    // present so elements stay positionally unambiguous.
    if !arguments.is_empty() || !arguments_keyword.is_empty() {
        list.push(Value::List(arguments.clone()));
    }
    if !arguments_keyword.is_empty() {
        list.push(Value::Dictionary(arguments_keyword.clone()));
    }
}

impl Message {
    pub const HELLO_TAG: Integer = 1;
    pub const WELCOME_TAG: Integer = 2;
    pub const ABORT_TAG: Integer = 3;
    pub const GOODBYE_TAG: Integer = 6;
    pub const ERROR_TAG: Integer = 8;
    pub const PUBLISH_TAG: Integer = 16;
    pub const PUBLISHED_TAG: Integer = 17;
    pub const SUBSCRIBE_TAG: Integer = 32;
    pub const SUBSCRIBED_TAG: Integer = 33;
    pub const UNSUBSCRIBE_TAG: Integer = 34;
    pub const UNSUBSCRIBED_TAG: Integer = 35;
    pub const EVENT_TAG: Integer = 36;
    pub const CALL_TAG: Integer = 48;
    pub const CANCEL_TAG: Integer = 49;
    pub const RESULT_TAG: Integer = 50;
    pub const REGISTER_TAG: Integer = 64;
    pub const REGISTERED_TAG: Integer = 65;
    pub const UNREGISTER_TAG: Integer = 66;
    pub const UNREGISTERED_TAG: Integer = 67;
    pub const INVOCATION_TAG: Integer = 68;
    pub const INTERRUPT_TAG: Integer = 69;
    pub const YIELD_TAG: Integer = 70;

    /// The integer type tag of the message.
    pub fn tag(&self) -> Integer {
        match self {
            Self::Hello(_) => Self::HELLO_TAG,
            Self::Welcome(_) => Self::WELCOME_TAG,
            Self::Abort(_) => Self::ABORT_TAG,
            Self::Goodbye(_) => Self::GOODBYE_TAG,
            Self::Error(_) => Self::ERROR_TAG,
            Self::Publish(_) => Self::PUBLISH_TAG,
            Self::Published(_) => Self::PUBLISHED_TAG,
            Self::Subscribe(_) => Self::SUBSCRIBE_TAG,
            Self::Subscribed(_) => Self::SUBSCRIBED_TAG,
            Self::Unsubscribe(_) => Self::UNSUBSCRIBE_TAG,
            Self::Unsubscribed(_) => Self::UNSUBSCRIBED_TAG,
            Self::Event(_) => Self::EVENT_TAG,
            Self::Call(_) => Self::CALL_TAG,
            Self::Cancel(_) => Self::CANCEL_TAG,
            Self::Result(_) => Self::RESULT_TAG,
            Self::Register(_) => Self::REGISTER_TAG,
            Self::Registered(_) => Self::REGISTERED_TAG,
            Self::Unregister(_) => Self::UNREGISTER_TAG,
            Self::Unregistered(_) => Self::UNREGISTERED_TAG,
            Self::Invocation(_) => Self::INVOCATION_TAG,
            Self::Interrupt(_) => Self::INTERRUPT_TAG,
            Self::Yield(_) => Self::YIELD_TAG,
        }
    }

    /// The message name, mostly for logging.
    pub fn message_name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "HELLO",
            Self::Welcome(_) => "WELCOME",
            Self::Abort(_) => "ABORT",
            Self::Goodbye(_) => "GOODBYE",
            Self::Error(_) => "ERROR",
            Self::Publish(_) => "PUBLISH",
            Self::Published(_) => "PUBLISHED",
            Self::Subscribe(_) => "SUBSCRIBE",
            Self::Subscribed(_) => "SUBSCRIBED",
            Self::Unsubscribe(_) => "UNSUBSCRIBE",
            Self::Unsubscribed(_) => "UNSUBSCRIBED",
            Self::Event(_) => "EVENT",
            Self::Call(_) => "CALL",
            Self::Cancel(_) => "CANCEL",
            Self::Result(_) => "RESULT",
            Self::Register(_) => "REGISTER",
            Self::Registered(_) => "REGISTERED",
            Self::Unregister(_) => "UNREGISTER",
            Self::Unregistered(_) => "UNREGISTERED",
            Self::Invocation(_) => "INVOCATION",
            Self::Interrupt(_) => "INTERRUPT",
            Self::Yield(_) => "YIELD",
        }
    }

    /// The request ID on the message.
    pub fn request_id(&self) -> Option<Id> {
        match self {
            Self::Error(message) => Some(message.request),
            Self::Publish(message) => Some(message.request),
            Self::Published(message) => Some(message.publish_request),
            Self::Subscribe(message) => Some(message.request),
            Self::Subscribed(message) => Some(message.subscribe_request),
            Self::Unsubscribe(message) => Some(message.request),
            Self::Unsubscribed(message) => Some(message.unsubscribe_request),
            Self::Call(message) => Some(message.request),
            Self::Cancel(message) => Some(message.call_request),
            Self::Result(message) => Some(message.call_request),
            Self::Register(message) => Some(message.request),
            Self::Registered(message) => Some(message.register_request),
            Self::Unregister(message) => Some(message.request),
            Self::Unregistered(message) => Some(message.unregister_request),
            Self::Invocation(message) => Some(message.request),
            Self::Interrupt(message) => Some(message.invocation_request),
            Self::Yield(message) => Some(message.invocation_request),
            _ => None,
        }
    }

    /// The details dictionary on the message.
    pub fn details(&self) -> Option<&Dictionary> {
        match self {
            Self::Hello(message) => Some(&message.details),
            Self::Welcome(message) => Some(&message.details),
            Self::Abort(message) => Some(&message.details),
            Self::Goodbye(message) => Some(&message.details),
            Self::Error(message) => Some(&message.details),
            Self::Event(message) => Some(&message.details),
            Self::Result(message) => Some(&message.details),
            Self::Invocation(message) => Some(&message.details),
            _ => None,
        }
    }

    /// The error reason on the message.
    pub fn reason(&self) -> Option<&Uri> {
        match self {
            Self::Abort(message) => Some(&message.reason),
            Self::Goodbye(message) => Some(&message.reason),
            Self::Error(message) => Some(&message.error),
            _ => None,
        }
    }

    /// Encodes the message as its on-the-wire value list.
    pub fn to_list(&self) -> List {
        let mut list = List::from_iter([Value::Integer(self.tag())]);
        match self {
            Self::Hello(message) => {
                list.push(Value::String(message.realm.to_string()));
                list.push(Value::Dictionary(message.details.clone()));
            }
            Self::Welcome(message) => {
                list.push(Value::Integer(message.session.into()));
                list.push(Value::Dictionary(message.details.clone()));
            }
            Self::Abort(message) => {
                list.push(Value::Dictionary(message.details.clone()));
                list.push(Value::String(message.reason.to_string()));
                push_payload(&mut list, &message.arguments, &message.arguments_keyword);
            }
            Self::Goodbye(message) => {
                list.push(Value::Dictionary(message.details.clone()));
                list.push(Value::String(message.reason.to_string()));
            }
            Self::Error(message) => {
                list.push(Value::Integer(message.request_type));
                list.push(Value::Integer(message.request.into()));
                list.push(Value::Dictionary(message.details.clone()));
                list.push(Value::String(message.error.to_string()));
                push_payload(&mut list, &message.arguments, &message.arguments_keyword);
            }
            Self::Publish(message) => {
                list.push(Value::Integer(message.request.into()));
                list.push(Value::Dictionary(message.options.clone()));
                list.push(Value::String(message.topic.to_string()));
                push_payload(&mut list, &message.arguments, &message.arguments_keyword);
            }
            Self::Published(message) => {
                list.push(Value::Integer(message.publish_request.into()));
                list.push(Value::Integer(message.publication.into()));
            }
            Self::Subscribe(message) => {
                list.push(Value::Integer(message.request.into()));
                list.push(Value::Dictionary(message.options.clone()));
                list.push(Value::String(message.topic.to_string()));
            }
            Self::Subscribed(message) => {
                list.push(Value::Integer(message.subscribe_request.into()));
                list.push(Value::Integer(message.subscription.into()));
            }
            Self::Unsubscribe(message) => {
                list.push(Value::Integer(message.request.into()));
                list.push(Value::Integer(message.subscribed_subscription.into()));
            }
            Self::Unsubscribed(message) => {
                list.push(Value::Integer(message.unsubscribe_request.into()));
            }
            Self::Event(message) => {
                list.push(Value::Integer(message.subscribed_subscription.into()));
                list.push(Value::Integer(message.published_publication.into()));
                list.push(Value::Dictionary(message.details.clone()));
                push_payload(
                    &mut list,
                    &message.publish_arguments,
                    &message.publish_arguments_keyword,
                );
            }
            Self::Call(message) => {
                list.push(Value::Integer(message.request.into()));
                list.push(Value::Dictionary(message.options.clone()));
                list.push(Value::String(message.procedure.to_string()));
                push_payload(&mut list, &message.arguments, &message.arguments_keyword);
            }
            Self::Cancel(message) => {
                list.push(Value::Integer(message.call_request.into()));
                list.push(Value::Dictionary(message.options.clone()));
            }
            Self::Result(message) => {
                list.push(Value::Integer(message.call_request.into()));
                list.push(Value::Dictionary(message.details.clone()));
                push_payload(
                    &mut list,
                    &message.yield_arguments,
                    &message.yield_arguments_keyword,
                );
            }
            Self::Register(message) => {
                list.push(Value::Integer(message.request.into()));
                list.push(Value::Dictionary(message.options.clone()));
                list.push(Value::String(message.procedure.to_string()));
            }
            Self::Registered(message) => {
                list.push(Value::Integer(message.register_request.into()));
                list.push(Value::Integer(message.registration.into()));
            }
            Self::Unregister(message) => {
                list.push(Value::Integer(message.request.into()));
                list.push(Value::Integer(message.registered_registration.into()));
            }
            Self::Unregistered(message) => {
                list.push(Value::Integer(message.unregister_request.into()));
            }
            Self::Invocation(message) => {
                list.push(Value::Integer(message.request.into()));
                list.push(Value::Integer(message.registered_registration.into()));
                list.push(Value::Dictionary(message.details.clone()));
                push_payload(
                    &mut list,
                    &message.call_arguments,
                    &message.call_arguments_keyword,
                );
            }
            Self::Interrupt(message) => {
                list.push(Value::Integer(message.invocation_request.into()));
                list.push(Value::Dictionary(message.options.clone()));
            }
            Self::Yield(message) => {
                list.push(Value::Integer(message.invocation_request.into()));
                list.push(Value::Dictionary(message.options.clone()));
                push_payload(&mut list, &message.arguments, &message.arguments_keyword);
            }
        }
        list
    }

    /// Decodes a message from its on-the-wire value list.
    ///
    /// Fails with a protocol violation for unknown tags, missing fields, or mistyped fields.
    pub fn from_list(list: List) -> Result<Self> {
        let mut values = list.into_iter();
        let tag = values
            .next()
            .and_then(|tag| tag.integer())
            .ok_or_else(|| {
                InteractionError::ProtocolViolation(
                    "message does not start with an integer tag".to_owned(),
                )
            })?;
        let message = match tag {
            Self::HELLO_TAG => {
                let mut reader = MessageReader::new("HELLO", values);
                let message = Self::Hello(HelloMessage {
                    realm: reader.uri("realm")?,
                    details: reader.trailing_dictionary("details")?,
                });
                reader.finish()?;
                message
            }
            Self::WELCOME_TAG => {
                let mut reader = MessageReader::new("WELCOME", values);
                let message = Self::Welcome(WelcomeMessage {
                    session: reader.id("session")?,
                    details: reader.trailing_dictionary("details")?,
                });
                reader.finish()?;
                message
            }
            Self::ABORT_TAG => {
                let mut reader = MessageReader::new("ABORT", values);
                let message = Self::Abort(AbortMessage {
                    details: reader.dictionary("details")?,
                    reason: reader.uri("reason")?,
                    arguments: reader.trailing_list("arguments")?,
                    arguments_keyword: reader.trailing_dictionary("arguments_keyword")?,
                });
                reader.finish()?;
                message
            }
            Self::GOODBYE_TAG => {
                let mut reader = MessageReader::new("GOODBYE", values);
                let message = Self::Goodbye(GoodbyeMessage {
                    details: reader.dictionary("details")?,
                    reason: reader.uri("reason")?,
                });
                reader.finish()?;
                message
            }
            Self::ERROR_TAG => {
                let mut reader = MessageReader::new("ERROR", values);
                let message = Self::Error(ErrorMessage {
                    request_type: reader.integer("request_type")?,
                    request: reader.id("request")?,
                    details: reader.dictionary("details")?,
                    error: reader.uri("error")?,
                    arguments: reader.trailing_list("arguments")?,
                    arguments_keyword: reader.trailing_dictionary("arguments_keyword")?,
                });
                reader.finish()?;
                message
            }
            Self::PUBLISH_TAG => {
                let mut reader = MessageReader::new("PUBLISH", values);
                let message = Self::Publish(PublishMessage {
                    request: reader.id("request")?,
                    options: reader.dictionary("options")?,
                    topic: reader.uri("topic")?,
                    arguments: reader.trailing_list("arguments")?,
                    arguments_keyword: reader.trailing_dictionary("arguments_keyword")?,
                });
                reader.finish()?;
                message
            }
            Self::PUBLISHED_TAG => {
                let mut reader = MessageReader::new("PUBLISHED", values);
                let message = Self::Published(PublishedMessage {
                    publish_request: reader.id("publish_request")?,
                    publication: reader.id("publication")?,
                });
                reader.finish()?;
                message
            }
            Self::SUBSCRIBE_TAG => {
                let mut reader = MessageReader::new("SUBSCRIBE", values);
                let message = Self::Subscribe(SubscribeMessage {
                    request: reader.id("request")?,
                    options: reader.dictionary("options")?,
                    topic: reader.wildcard_uri("topic")?,
                });
                reader.finish()?;
                message
            }
            Self::SUBSCRIBED_TAG => {
                let mut reader = MessageReader::new("SUBSCRIBED", values);
                let message = Self::Subscribed(SubscribedMessage {
                    subscribe_request: reader.id("subscribe_request")?,
                    subscription: reader.id("subscription")?,
                });
                reader.finish()?;
                message
            }
            Self::UNSUBSCRIBE_TAG => {
                let mut reader = MessageReader::new("UNSUBSCRIBE", values);
                let message = Self::Unsubscribe(UnsubscribeMessage {
                    request: reader.id("request")?,
                    subscribed_subscription: reader.id("subscribed_subscription")?,
                });
                reader.finish()?;
                message
            }
            Self::UNSUBSCRIBED_TAG => {
                let mut reader = MessageReader::new("UNSUBSCRIBED", values);
                let message = Self::Unsubscribed(UnsubscribedMessage {
                    unsubscribe_request: reader.id("unsubscribe_request")?,
                });
                reader.finish()?;
                message
            }
            Self::EVENT_TAG => {
                let mut reader = MessageReader::new("EVENT", values);
                let message = Self::Event(EventMessage {
                    subscribed_subscription: reader.id("subscribed_subscription")?,
                    published_publication: reader.id("published_publication")?,
                    details: reader.dictionary("details")?,
                    publish_arguments: reader.trailing_list("publish_arguments")?,
                    publish_arguments_keyword: reader
                        .trailing_dictionary("publish_arguments_keyword")?,
                });
                reader.finish()?;
                message
            }
            Self::CALL_TAG => {
                let mut reader = MessageReader::new("CALL", values);
                let message = Self::Call(CallMessage {
                    request: reader.id("request")?,
                    options: reader.dictionary("options")?,
                    procedure: reader.uri("procedure")?,
                    arguments: reader.trailing_list("arguments")?,
                    arguments_keyword: reader.trailing_dictionary("arguments_keyword")?,
                });
                reader.finish()?;
                message
            }
            Self::CANCEL_TAG => {
                let mut reader = MessageReader::new("CANCEL", values);
                let message = Self::Cancel(CancelMessage {
                    call_request: reader.id("call_request")?,
                    options: reader.trailing_dictionary("options")?,
                });
                reader.finish()?;
                message
            }
            Self::RESULT_TAG => {
                let mut reader = MessageReader::new("RESULT", values);
                let message = Self::Result(ResultMessage {
                    call_request: reader.id("call_request")?,
                    details: reader.dictionary("details")?,
                    yield_arguments: reader.trailing_list("yield_arguments")?,
                    yield_arguments_keyword: reader
                        .trailing_dictionary("yield_arguments_keyword")?,
                });
                reader.finish()?;
                message
            }
            Self::REGISTER_TAG => {
                let mut reader = MessageReader::new("REGISTER", values);
                let message = Self::Register(RegisterMessage {
                    request: reader.id("request")?,
                    options: reader.dictionary("options")?,
                    procedure: reader.wildcard_uri("procedure")?,
                });
                reader.finish()?;
                message
            }
            Self::REGISTERED_TAG => {
                let mut reader = MessageReader::new("REGISTERED", values);
                let message = Self::Registered(RegisteredMessage {
                    register_request: reader.id("register_request")?,
                    registration: reader.id("registration")?,
                });
                reader.finish()?;
                message
            }
            Self::UNREGISTER_TAG => {
                let mut reader = MessageReader::new("UNREGISTER", values);
                let message = Self::Unregister(UnregisterMessage {
                    request: reader.id("request")?,
                    registered_registration: reader.id("registered_registration")?,
                });
                reader.finish()?;
                message
            }
            Self::UNREGISTERED_TAG => {
                let mut reader = MessageReader::new("UNREGISTERED", values);
                let message = Self::Unregistered(UnregisteredMessage {
                    unregister_request: reader.id("unregister_request")?,
                });
                reader.finish()?;
                message
            }
            Self::INVOCATION_TAG => {
                let mut reader = MessageReader::new("INVOCATION", values);
                let message = Self::Invocation(InvocationMessage {
                    request: reader.id("request")?,
                    registered_registration: reader.id("registered_registration")?,
                    details: reader.dictionary("details")?,
                    call_arguments: reader.trailing_list("call_arguments")?,
                    call_arguments_keyword: reader
                        .trailing_dictionary("call_arguments_keyword")?,
                });
                reader.finish()?;
                message
            }
            Self::INTERRUPT_TAG => {
                let mut reader = MessageReader::new("INTERRUPT", values);
                let message = Self::Interrupt(InterruptMessage {
                    invocation_request: reader.id("invocation_request")?,
                    options: reader.trailing_dictionary("options")?,
                });
                reader.finish()?;
                message
            }
            Self::YIELD_TAG => {
                let mut reader = MessageReader::new("YIELD", values);
                let message = Self::Yield(YieldMessage {
                    invocation_request: reader.id("invocation_request")?,
                    options: reader.dictionary("options")?,
                    arguments: reader.trailing_list("arguments")?,
                    arguments_keyword: reader.trailing_dictionary("arguments_keyword")?,
                });
                reader.finish()?;
                message
            }
            _ => {
                return Err(InteractionError::ProtocolViolation(format!(
                    "unknown message tag {tag}"
                ))
                .into());
            }
        };
        Ok(message)
    }
}

#[cfg(test)]
mod message_test {
    use crate::core::{
        id::Id,
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::Uri,
    };
    use crate::message::message::{
        CallMessage,
        HelloMessage,
        Message,
        YieldMessage,
    };

    fn decode(json: &str) -> anyhow::Result<Message> {
        Message::from_list(serde_json::from_str::<List>(json).unwrap())
    }

    fn encode(message: &Message) -> String {
        serde_json::to_string(&message.to_list()).unwrap()
    }

    #[test]
    fn decodes_message_from_tuple() {
        assert_matches::assert_matches!(decode(r#"
            [1, "com.test"]
        "#), Ok(Message::Hello(message)) => {
            assert_eq!(message, HelloMessage {
                realm: Uri::try_from("com.test").unwrap(),
                details: Dictionary::default(),
            })
        });

        assert_matches::assert_matches!(decode(r#"
            [1, "com.test", { "key": true }]
        "#), Ok(Message::Hello(message)) => {
            assert_eq!(message, HelloMessage {
                realm: Uri::try_from("com.test").unwrap(),
                details: Dictionary::from_iter([("key".to_owned(), Value::Bool(true))]),
            })
        });

        assert_matches::assert_matches!(decode(r#"
            [48, 7814135, {}, "com.myapp.ping"]
        "#), Ok(Message::Call(message)) => {
            assert_eq!(message, CallMessage {
                request: Id::try_from(7814135).unwrap(),
                options: Dictionary::default(),
                procedure: Uri::try_from("com.myapp.ping").unwrap(),
                arguments: List::default(),
                arguments_keyword: Dictionary::default(),
            })
        });

        assert_matches::assert_matches!(decode(r#"
            [48, 7814135, {}, "com.myapp.user.new", ["Johnny"], {
                "firstname": "John",
                "surname": "Doe"
            }]
        "#), Ok(Message::Call(message)) => {
            assert_eq!(message, CallMessage {
                request: Id::try_from(7814135).unwrap(),
                options: Dictionary::default(),
                procedure: Uri::try_from("com.myapp.user.new").unwrap(),
                arguments: List::from_iter([
                    Value::String("Johnny".to_owned()),
                ]),
                arguments_keyword: Dictionary::from_iter([
                    ("firstname".to_owned(), Value::String("John".to_owned())),
                    ("surname".to_owned(), Value::String("Doe".to_owned())),
                ]),
            })
        });
    }

    #[test]
    fn encodes_message_to_tuple() {
        assert_eq!(
            encode(&Message::Hello(HelloMessage {
                realm: Uri::try_from("com.test").unwrap(),
                details: Dictionary::default(),
            })),
            r#"[1,"com.test",{}]"#
        );

        assert_eq!(
            encode(&Message::Call(CallMessage {
                request: Id::try_from(25).unwrap(),
                options: Dictionary::default(),
                procedure: Uri::try_from("com.myapp.add2").unwrap(),
                arguments: List::from_iter([Value::Integer(23), Value::Integer(7)]),
                arguments_keyword: Dictionary::default(),
            })),
            r#"[48,25,{},"com.myapp.add2",[23,7]]"#
        );
    }

    #[test]
    fn omits_trailing_empty_payloads() {
        let encoded = encode(&Message::Yield(YieldMessage {
            invocation_request: Id::try_from(1).unwrap(),
            options: Dictionary::default(),
            arguments: List::default(),
            arguments_keyword: Dictionary::default(),
        }));
        assert_eq!(encoded, r#"[70,1,{}]"#);
    }

    #[test]
    fn keyword_arguments_force_positional_list() {
        let encoded = encode(&Message::Yield(YieldMessage {
            invocation_request: Id::try_from(1).unwrap(),
            options: Dictionary::default(),
            arguments: List::default(),
            arguments_keyword: Dictionary::from_iter([("a".to_owned(), Value::Integer(1))]),
        }));
        assert_eq!(encoded, r#"[70,1,{},[],{"a":1}]"#);
    }

    #[test]
    fn round_trips_through_value_list() {
        let message = Message::Call(CallMessage {
            request: Id::try_from(7814135).unwrap(),
            options: Dictionary::default(),
            procedure: Uri::try_from("com.myapp.echo").unwrap(),
            arguments: List::from_iter([Value::String("Hello, world!".to_owned())]),
            arguments_keyword: Dictionary::default(),
        });
        assert_matches::assert_matches!(Message::from_list(message.to_list()), Ok(decoded) => {
            pretty_assertions::assert_eq!(decoded, message);
        });
    }

    #[test]
    fn fails_decoding_malformed_messages() {
        assert_matches::assert_matches!(decode(r#"["HELLO"]"#), Err(err) => {
            assert!(err.to_string().contains("does not start with an integer tag"));
        });
        assert_matches::assert_matches!(decode(r#"[1000, "com.test"]"#), Err(err) => {
            assert!(err.to_string().contains("unknown message tag"));
        });
        assert_matches::assert_matches!(decode(r#"[48, 1, {}]"#), Err(err) => {
            assert!(err.to_string().contains("CALL message is missing procedure"));
        });
        assert_matches::assert_matches!(decode(r#"[48, 1, {}, "com!!bad"]"#), Err(err) => {
            assert!(err.to_string().contains("CALL message has an invalid procedure"));
        });
        assert_matches::assert_matches!(decode(r#"[33, 1, 2, 3]"#), Err(err) => {
            assert!(err.to_string().contains("SUBSCRIBED message has trailing elements"));
        });
    }
}

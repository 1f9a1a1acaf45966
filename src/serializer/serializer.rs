use std::fmt::Debug;

use anyhow::Result;

use crate::{
    message::message::Message,
    serializer::{
        json::JsonSerializer,
        message_pack::MessagePackSerializer,
    },
};

/// The type of serializer to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SerializerType {
    /// Serializes messages to and from JavaScript Object Notation.
    Json,
    /// Serializes messages to and from the MessagePack format.
    MessagePack,
}

impl SerializerType {
    /// The subprotocol name used during protocol negotiation.
    pub fn subprotocol(&self) -> &'static str {
        match self {
            Self::Json => "wamp.2.json",
            Self::MessagePack => "wamp.2.msgpack",
        }
    }

    /// Whether the serializer produces binary frames.
    pub fn binary(&self) -> bool {
        match self {
            Self::Json => false,
            Self::MessagePack => true,
        }
    }
}

impl TryFrom<&str> for SerializerType {
    type Error = &'static str;
    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        match value {
            "wamp.2.json" => Ok(Self::Json),
            "wamp.2.msgpack" => Ok(Self::MessagePack),
            _ => Err("unsupported serializer"),
        }
    }
}

/// A serializer, which serializes and deserializes WAMP messages to a well-known format that can
/// be passed over wire.
///
/// Does not implement message batching.
pub trait Serializer: Send + Debug {
    /// Serializes the given message to bytes.
    fn serialize(&self, value: &Message) -> Result<Vec<u8>>;

    /// Deserializes bytes to a message.
    fn deserialize(&self, bytes: &[u8]) -> Result<Message>;
}

/// Creates a new [`Serializer`] for the given type.
pub fn new_serializer(serializer_type: SerializerType) -> Box<dyn Serializer> {
    match serializer_type {
        SerializerType::Json => Box::new(JsonSerializer::default()),
        SerializerType::MessagePack => Box::new(MessagePackSerializer::default()),
    }
}

#[cfg(test)]
mod serializer_test {
    use crate::{
        core::{
            id::Id,
            types::{
                Dictionary,
                List,
                Value,
            },
        },
        message::message::{
            EventMessage,
            Message,
        },
        serializer::serializer::{
            SerializerType,
            new_serializer,
        },
    };

    fn event() -> Message {
        Message::Event(EventMessage {
            subscribed_subscription: Id::try_from(5512315355).unwrap(),
            published_publication: Id::try_from(4429313566).unwrap(),
            details: Dictionary::default(),
            publish_arguments: List::from_iter([Value::String("hi".to_owned())]),
            publish_arguments_keyword: Dictionary::from_iter([(
                "color".to_owned(),
                Value::String("orange".to_owned()),
            )]),
        })
    }

    #[test]
    fn json_serializes_to_utf8_array_text() {
        let serializer = new_serializer(SerializerType::Json);
        assert_matches::assert_matches!(serializer.serialize(&event()), Ok(bytes) => {
            assert_eq!(
                std::str::from_utf8(&bytes).unwrap(),
                r#"[36,5512315355,4429313566,{},["hi"],{"color":"orange"}]"#
            );
            assert_matches::assert_matches!(serializer.deserialize(&bytes), Ok(decoded) => {
                pretty_assertions::assert_eq!(decoded, event());
            });
        });
    }

    #[test]
    fn message_pack_round_trips_messages() {
        let serializer = new_serializer(SerializerType::MessagePack);
        assert_matches::assert_matches!(serializer.serialize(&event()), Ok(bytes) => {
            assert_matches::assert_matches!(serializer.deserialize(&bytes), Ok(decoded) => {
                pretty_assertions::assert_eq!(decoded, event());
            });
        });
    }

    #[test]
    fn json_rejects_invalid_frames() {
        let serializer = new_serializer(SerializerType::Json);
        assert_matches::assert_matches!(serializer.deserialize(br#"{"not":"an array"}"#), Err(_));
        assert_matches::assert_matches!(serializer.deserialize(br#"[9999,1]"#), Err(err) => {
            assert!(err.to_string().contains("unknown message tag"));
        });
        assert_matches::assert_matches!(
            serializer.deserialize(&br#"[1,"com.test"]"#[..1]),
            Err(_)
        );
    }

    #[test]
    fn subprotocols_identify_serializers() {
        assert_matches::assert_matches!(
            SerializerType::try_from("wamp.2.json"),
            Ok(SerializerType::Json)
        );
        assert_matches::assert_matches!(
            SerializerType::try_from("wamp.2.msgpack"),
            Ok(SerializerType::MessagePack)
        );
        assert_matches::assert_matches!(SerializerType::try_from("wamp.2.cbor"), Err(_));
        assert!(!SerializerType::Json.binary());
        assert!(SerializerType::MessagePack.binary());
    }
}

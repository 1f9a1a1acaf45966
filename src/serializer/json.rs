use anyhow::{
    Error,
    Result,
};

use crate::{
    core::types::List,
    message::message::Message,
    serializer::serializer::Serializer,
};

/// A serializer implemented for JavaScript Object Notation.
#[derive(Debug, Default)]
pub struct JsonSerializer {}

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Message) -> Result<Vec<u8>> {
        serde_json::to_vec(&value.to_list()).map_err(Error::new)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Message> {
        Message::from_list(serde_json::from_slice::<List>(bytes).map_err(Error::new)?)
    }
}

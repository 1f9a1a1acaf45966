use anyhow::Error;

use crate::{
    core::{
        error::BasicError,
        hash::HashSet,
        id::Id,
        types::{
            Dictionary,
            Value,
        },
    },
    message::message::PublishMessage,
};

/// Options for publishing an event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// Should the publisher be excluded from receiving the event?
    pub exclude_me: bool,
    /// Blocked session IDs.
    pub exclude: Option<HashSet<Id>>,
    /// Allowed session IDs.
    pub eligible: Option<HashSet<Id>>,
    /// Should the publisher's session ID be disclosed to receivers?
    pub disclose_me: bool,
    /// Should the publication be acknowledged with a PUBLISHED message?
    pub acknowledge: bool,
}

impl PublishOptions {
    /// Checks whether the event may be delivered to the given subscriber session.
    pub fn allows(&self, publisher: Id, subscriber: Id) -> bool {
        if self.exclude_me && subscriber == publisher {
            return false;
        }
        if self
            .exclude
            .as_ref()
            .is_some_and(|exclude| exclude.contains(&subscriber))
        {
            return false;
        }
        if self
            .eligible
            .as_ref()
            .is_some_and(|eligible| !eligible.contains(&subscriber))
        {
            return false;
        }
        true
    }

    fn session_id_set(value: &Value, key: &str) -> Result<HashSet<Id>, Error> {
        value
            .list()
            .ok_or_else(|| BasicError::InvalidArgument(format!("{key} must be a list")))?
            .iter()
            .map(|value| {
                value
                    .integer()
                    .ok_or_else(|| {
                        BasicError::InvalidArgument(format!("{key} must contain session ids"))
                    })
                    .and_then(|value| {
                        Id::try_from(value).map_err(|err| {
                            BasicError::InvalidArgument(format!("invalid id in {key}: {err}"))
                        })
                    })
            })
            .collect::<Result<HashSet<_>, _>>()
            .map_err(Error::new)
    }

    fn bool_option(options: &Dictionary, key: &str) -> Result<bool, Error> {
        match options.get(key) {
            Some(value) => value
                .bool()
                .ok_or_else(|| BasicError::InvalidArgument(format!("{key} must be a bool")).into()),
            None => Ok(false),
        }
    }
}

impl TryFrom<&PublishMessage> for PublishOptions {
    type Error = Error;
    fn try_from(value: &PublishMessage) -> Result<Self, Self::Error> {
        let options = &value.options;
        Ok(Self {
            exclude_me: Self::bool_option(options, "exclude_me")?,
            exclude: options
                .get("exclude")
                .map(|value| Self::session_id_set(value, "exclude"))
                .transpose()?,
            eligible: options
                .get("eligible")
                .map(|value| Self::session_id_set(value, "eligible"))
                .transpose()?,
            disclose_me: Self::bool_option(options, "disclose_me")?,
            acknowledge: Self::bool_option(options, "acknowledge")?,
        })
    }
}

#[cfg(test)]
mod publish_options_test {
    use crate::{
        core::{
            hash::HashSet,
            id::Id,
            publish_options::PublishOptions,
            types::{
                Dictionary,
                List,
                Value,
            },
        },
        message::message::PublishMessage,
    };

    fn id(value: u64) -> Id {
        Id::try_from(value).unwrap()
    }

    #[test]
    fn parses_options_from_publish_message() {
        let message = PublishMessage {
            options: Dictionary::from_iter([
                ("exclude_me".to_owned(), Value::Bool(true)),
                ("acknowledge".to_owned(), Value::Bool(true)),
                (
                    "eligible".to_owned(),
                    Value::List(List::from_iter([Value::Integer(12), Value::Integer(13)])),
                ),
            ]),
            ..Default::default()
        };
        assert_matches::assert_matches!(PublishOptions::try_from(&message), Ok(options) => {
            pretty_assertions::assert_eq!(options, PublishOptions {
                exclude_me: true,
                acknowledge: true,
                eligible: Some(HashSet::from_iter([id(12), id(13)])),
                ..Default::default()
            });
        });
    }

    #[test]
    fn fails_on_malformed_options() {
        let message = PublishMessage {
            options: Dictionary::from_iter([(
                "exclude".to_owned(),
                Value::String("not a list".to_owned()),
            )]),
            ..Default::default()
        };
        assert_matches::assert_matches!(PublishOptions::try_from(&message), Err(err) => {
            assert!(err.to_string().contains("exclude must be a list"));
        });
    }

    #[test]
    fn filters_receivers() {
        let options = PublishOptions {
            exclude_me: true,
            exclude: Some(HashSet::from_iter([id(20)])),
            eligible: Some(HashSet::from_iter([id(10), id(20), id(30)])),
            ..Default::default()
        };
        let publisher = id(10);
        assert!(!options.allows(publisher, id(10)));
        assert!(!options.allows(publisher, id(20)));
        assert!(options.allows(publisher, id(30)));
        assert!(!options.allows(publisher, id(40)));
    }
}

use anyhow::Result;
use log::debug;

use crate::{
    core::{
        error::{
            BasicError,
            InteractionError,
        },
        hash::HashMap,
        id::Id,
        match_style::{
            MatchStyle,
            pattern_matches_uri,
            validate_pattern,
        },
        publish_options::PublishOptions,
        roles::RouterRole,
        types::{
            Dictionary,
            Value,
        },
        uri::{
            Uri,
            WildcardUri,
        },
    },
    message::message::{
        EventMessage,
        Message,
        PublishMessage,
    },
    router::context::RealmContext,
};

/// A single subscriber to a topic.
pub struct TopicSubscriber {
    pub session: Id,
    pub subscription_id: Id,
    active: bool,
}

/// A topic that events can be published to for subscribers.
///
/// Subscribers are kept in subscription order, so event delivery within one publication is
/// deterministic.
pub struct Topic {
    pub uri: WildcardUri,
    pub match_style: MatchStyle,
    persistent: bool,
    subscribers: Vec<TopicSubscriber>,
}

impl Topic {
    fn new(uri: WildcardUri, match_style: MatchStyle, persistent: bool) -> Self {
        Self {
            uri,
            match_style,
            persistent,
            subscribers: Vec::default(),
        }
    }

    fn subscriber_mut(&mut self, session: Id) -> Option<&mut TopicSubscriber> {
        self.subscribers
            .iter_mut()
            .find(|subscriber| subscriber.session == session)
    }
}

#[derive(Default)]
struct PrefixTrieNode {
    children: HashMap<String, PrefixTrieNode>,
    topic: Option<Topic>,
}

impl PrefixTrieNode {
    fn is_empty(&self) -> bool {
        self.topic.is_none() && self.children.is_empty()
    }
}

/// Prefix-matched topics, keyed by dot-separated URI components.
///
/// A publish on `a.b.c` matches every stored pattern along the component path `a`, `a.b`,
/// `a.b.c`.
#[derive(Default)]
struct PrefixTrie {
    root: PrefixTrieNode,
}

impl PrefixTrie {
    fn get_mut(&mut self, pattern: &WildcardUri) -> Option<&mut Topic> {
        let mut node = &mut self.root;
        for component in pattern.split() {
            node = node.children.get_mut(component)?;
        }
        node.topic.as_mut()
    }

    fn get_or_create<F>(&mut self, pattern: &WildcardUri, create: F) -> (&mut Topic, bool)
    where
        F: FnOnce() -> Topic,
    {
        let mut node = &mut self.root;
        for component in pattern.split() {
            node = node.children.entry(component.to_owned()).or_default();
        }
        let mut created = false;
        let topic = node.topic.get_or_insert_with(|| {
            created = true;
            create()
        });
        (topic, created)
    }

    fn remove(&mut self, pattern: &WildcardUri) {
        let components = pattern.split().collect::<Vec<_>>();
        Self::remove_at(&mut self.root, &components);
    }

    fn remove_at(node: &mut PrefixTrieNode, components: &[&str]) {
        match components.split_first() {
            None => node.topic = None,
            Some((first, rest)) => {
                if let Some(child) = node.children.get_mut(*first) {
                    Self::remove_at(child, rest);
                    if child.is_empty() {
                        node.children.remove(*first);
                    }
                }
            }
        }
    }

    fn matches(&self, uri: &Uri) -> Vec<&Topic> {
        let mut matches = Vec::default();
        let mut node = &self.root;
        for component in uri.split() {
            node = match node.children.get(component) {
                Some(node) => node,
                None => return matches,
            };
            if let Some(topic) = &node.topic {
                matches.push(topic);
            }
        }
        matches
    }
}

/// A manager for all topics owned by a realm.
///
/// Topic entries are created lazily on first subscribe, and non-persistent entries are destroyed
/// when their subscriber set becomes empty.
#[derive(Default)]
pub struct TopicManager {
    exact: HashMap<WildcardUri, Topic>,
    prefix: PrefixTrie,
    wildcard: HashMap<WildcardUri, Topic>,
}

impl TopicManager {
    /// Creates a topic entry that survives with no subscribers.
    pub fn create_persistent_topic(&mut self, uri: Uri) {
        let uri = WildcardUri::from(uri);
        self.exact
            .entry(uri.clone())
            .or_insert_with(|| Topic::new(uri, MatchStyle::Exact, true));
    }

    fn get_mut(&mut self, uri: &WildcardUri, match_style: MatchStyle) -> Option<&mut Topic> {
        match match_style {
            MatchStyle::Exact => self.exact.get_mut(uri),
            MatchStyle::Prefix => self.prefix.get_mut(uri),
            MatchStyle::Wildcard => self.wildcard.get_mut(uri),
        }
    }

    fn get_or_create(&mut self, uri: &WildcardUri, match_style: MatchStyle) -> (&mut Topic, bool) {
        // The created flag must be decided inside the factory, so observers fire exactly once per
        // entry.
        let mut created = false;
        let mut create = || {
            created = true;
            Topic::new(uri.clone(), match_style, false)
        };
        let topic = match match_style {
            MatchStyle::Exact => self.exact.entry(uri.clone()).or_insert_with(&mut create),
            MatchStyle::Prefix => {
                let (topic, _) = self.prefix.get_or_create(uri, &mut create);
                topic
            }
            MatchStyle::Wildcard => self.wildcard.entry(uri.clone()).or_insert_with(&mut create),
        };
        (topic, created)
    }

    fn remove(&mut self, uri: &WildcardUri, match_style: MatchStyle) {
        match match_style {
            MatchStyle::Exact => {
                self.exact.remove(uri);
            }
            MatchStyle::Prefix => self.prefix.remove(uri),
            MatchStyle::Wildcard => {
                self.wildcard.remove(uri);
            }
        }
    }

    /// Removes a session's subscription record from a topic entry.
    ///
    /// Returns whether the topic entry itself was destroyed as a result.
    pub(crate) fn remove_subscriber(
        &mut self,
        uri: &WildcardUri,
        match_style: MatchStyle,
        session: Id,
    ) -> bool {
        let topic_entry = match self.get_mut(uri, match_style) {
            Some(topic_entry) => topic_entry,
            None => return false,
        };
        topic_entry
            .subscribers
            .retain(|subscriber| subscriber.session != session);
        if topic_entry.subscribers.is_empty() && !topic_entry.persistent {
            self.remove(uri, match_style);
            return true;
        }
        false
    }

    /// All topic entries matching the published URI, across all match styles.
    fn matches(&self, uri: &Uri) -> Vec<&Topic> {
        let mut matches = Vec::default();
        if let Some(topic) = self.exact.get(&WildcardUri::from(uri)) {
            matches.push(topic);
        }
        matches.extend(self.prefix.matches(uri));
        matches.extend(
            self.wildcard
                .values()
                .filter(|topic| pattern_matches_uri(&topic.uri, MatchStyle::Wildcard, uri)),
        );
        matches
    }

    /// Subscribes a session to a topic.
    ///
    /// Idempotent per (session, topic, match style): re-subscribing yields the existing
    /// subscription ID.
    pub async fn subscribe<S>(
        context: &RealmContext<S>,
        session: Id,
        topic: WildcardUri,
        match_style: MatchStyle,
    ) -> Result<Id> {
        if !context.router().config().roles.contains(&RouterRole::Broker) {
            return Err(BasicError::NotAllowed("router is not a broker".to_owned()).into());
        }
        if validate_pattern(&topic, match_style).is_err() {
            return Err(InteractionError::InvalidUri.into());
        }

        context
            .router()
            .pub_sub_policies()
            .validate_subscription(context, session, &topic)
            .await?;

        let subscription_id = context.router().id_allocator().generate_id().await?;
        let mut realm = context.lock().await;
        let realm_uri = realm.uri().clone();
        let (topic_entry, created) = realm.topic_manager.get_or_create(&topic, match_style);
        let subscription_id = match topic_entry.subscriber_mut(session) {
            Some(existing) => existing.subscription_id,
            None => {
                topic_entry.subscribers.push(TopicSubscriber {
                    session,
                    subscription_id,
                    active: false,
                });
                subscription_id
            }
        };
        drop(realm);

        if created {
            context
                .router()
                .pub_sub_policies()
                .topic_created(&realm_uri, &topic);
        }
        Ok(subscription_id)
    }

    /// Activates a subscriber's subscription.
    ///
    /// Required for proper ordering of events. The subscription must not receive events until
    /// after the peer has received the subscription confirmation.
    pub async fn activate_subscription<S>(
        context: &RealmContext<S>,
        session: Id,
        topic: &WildcardUri,
        match_style: MatchStyle,
    ) {
        if let Some(topic) = context.lock().await.topic_manager.get_mut(topic, match_style) {
            if let Some(subscriber) = topic.subscriber_mut(session) {
                subscriber.active = true;
            }
        }
    }

    /// Unsubscribes a session from a topic.
    ///
    /// Removes the topic entry when its subscriber set becomes empty, unless the entry is
    /// persistent.
    pub async fn unsubscribe<S>(
        context: &RealmContext<S>,
        session: Id,
        topic: &WildcardUri,
        match_style: MatchStyle,
    ) {
        let mut realm = context.lock().await;
        let realm_uri = realm.uri().clone();
        let removed = realm
            .topic_manager
            .remove_subscriber(topic, match_style, session);
        drop(realm);

        if removed {
            context
                .router()
                .pub_sub_policies()
                .topic_removed(&realm_uri, topic);
        }
    }

    /// Publishes an event to all topics matching the published URI.
    ///
    /// Returns the publication ID, shared by all receivers, and whether any topic entry matched.
    /// The subscriber set is snapshotted under the realm lock; events are enqueued to receivers
    /// after the lock is released.
    pub async fn publish<S>(
        context: &RealmContext<S>,
        session: Id,
        message: &PublishMessage,
        options: &PublishOptions,
    ) -> Result<(Id, bool)> {
        if !context.router().config().roles.contains(&RouterRole::Broker) {
            return Err(BasicError::NotAllowed("router is not a broker".to_owned()).into());
        }

        context
            .router()
            .pub_sub_policies()
            .validate_publication(context, session, &message.topic)
            .await?;

        let publication = context.router().id_allocator().generate_id().await?;

        let realm = context.lock().await;
        let mut receivers = Vec::default();
        let mut matched = false;
        for topic in realm.topic_manager.matches(&message.topic) {
            matched = true;
            let mut details = Dictionary::default();
            if topic.match_style != MatchStyle::Exact {
                details.insert(
                    "topic".to_owned(),
                    Value::String(message.topic.to_string()),
                );
            }
            if options.disclose_me {
                details.insert("publisher".to_owned(), Value::Integer(session.into()));
            }
            for subscriber in &topic.subscribers {
                if !subscriber.active || !options.allows(session, subscriber.session) {
                    continue;
                }
                let receiver = match realm.sessions.get(&subscriber.session) {
                    Some(receiver) => receiver.session.clone(),
                    None => continue,
                };
                receivers.push((
                    receiver,
                    EventMessage {
                        subscribed_subscription: subscriber.subscription_id,
                        published_publication: publication,
                        details: details.clone(),
                        publish_arguments: message.arguments.clone(),
                        publish_arguments_keyword: message.arguments_keyword.clone(),
                    },
                ));
            }
        }
        drop(realm);

        for (receiver, event) in receivers {
            let receiver_id = receiver.id();
            if let Err(err) = receiver.send_message(Message::Event(event)) {
                // The receiver may be tearing down concurrently.
                debug!("Failed to enqueue event for session {receiver_id}: {err}");
            }
        }
        Ok((publication, matched))
    }
}

use anyhow::Result;
use test_utils::peer::TestPeer;
use wamproute::{
    core::{
        id::Id,
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        Message,
        UnsubscribeMessage,
    },
    router::{
        EmptyPubSubPolicies,
        EmptyRpcPolicies,
        EmptySessionPolicies,
        RealmConfig,
        RouterConfig,
        RouterHandle,
        new_web_socket_router,
    },
};

const REALM: &str = "com.wamproute.test";
const OTHER_REALM: &str = "com.wamproute.other";

async fn start_router() -> Result<RouterHandle> {
    let mut config = RouterConfig::default();
    config.realms.push(RealmConfig {
        name: "test".to_owned(),
        uri: Uri::try_from(REALM)?,
        ..Default::default()
    });
    config.realms.push(RealmConfig {
        name: "other".to_owned(),
        uri: Uri::try_from(OTHER_REALM)?,
        ..Default::default()
    });
    let router = new_web_socket_router(
        config,
        Box::new(EmptySessionPolicies::default()),
        Box::new(EmptyPubSubPolicies::default()),
        Box::new(EmptyRpcPolicies::default()),
    )?;
    router.start().await
}

async fn connect(router_handle: &RouterHandle, realm: &str) -> TestPeer {
    let mut peer = TestPeer::connect_direct(router_handle);
    peer.join_realm(realm).await.unwrap();
    peer
}

fn acknowledge() -> Dictionary {
    Dictionary::from_iter([("acknowledge".to_owned(), Value::Bool(true))])
}

#[tokio::test]
async fn subscriber_receives_published_event_with_shared_publication_id() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let mut alice = connect(&router_handle, REALM).await;
    let mut bob = connect(&router_handle, REALM).await;

    let subscription = alice.subscribe("com.x.greet").await.unwrap();

    let request = bob
        .publish(
            "com.x.greet",
            List::from_iter([Value::String("hi".to_owned())]),
            acknowledge(),
        )
        .await
        .unwrap();

    let publication = assert_matches::assert_matches!(
        bob.receive().await,
        Ok(Message::Published(message)) => {
            assert_eq!(message.publish_request, request);
            message.publication
        }
    );

    assert_matches::assert_matches!(alice.receive().await, Ok(Message::Event(message)) => {
        assert_eq!(message.subscribed_subscription, subscription);
        assert_eq!(message.published_publication, publication);
        pretty_assertions::assert_eq!(
            message.publish_arguments,
            List::from_iter([Value::String("hi".to_owned())])
        );
    });
}

#[tokio::test]
async fn prefix_subscription_matches_component_aligned_uris() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let mut alice = connect(&router_handle, REALM).await;
    let mut bob = connect(&router_handle, REALM).await;

    let subscription = alice
        .subscribe_with_options(
            "com.x",
            Dictionary::from_iter([("match".to_owned(), Value::String("prefix".to_owned()))]),
        )
        .await
        .unwrap();

    bob.publish(
        "com.x.y.z",
        List::from_iter([Value::Integer(7)]),
        Dictionary::default(),
    )
    .await
    .unwrap();

    assert_matches::assert_matches!(alice.receive().await, Ok(Message::Event(message)) => {
        assert_eq!(message.subscribed_subscription, subscription);
        pretty_assertions::assert_eq!(message.publish_arguments, List::from_iter([Value::Integer(7)]));
        // Pattern subscriptions learn the concrete topic from event details.
        assert_matches::assert_matches!(message.details.get("topic"), Some(Value::String(topic)) => {
            assert_eq!(topic, "com.x.y.z");
        });
    });

    // A non-aligned URI does not match.
    bob.publish("com.xy.z", List::default(), Dictionary::default())
        .await
        .unwrap();
    assert_matches::assert_matches!(alice.try_receive().await, None);
}

#[tokio::test]
async fn wildcard_subscription_matches_on_equal_arity() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let mut alice = connect(&router_handle, REALM).await;
    let mut bob = connect(&router_handle, REALM).await;

    let subscription = alice
        .subscribe_with_options(
            "com..created",
            Dictionary::from_iter([("match".to_owned(), Value::String("wildcard".to_owned()))]),
        )
        .await
        .unwrap();

    bob.publish(
        "com.user.created",
        List::from_iter([Value::Integer(1)]),
        Dictionary::default(),
    )
    .await
    .unwrap();
    assert_matches::assert_matches!(alice.receive().await, Ok(Message::Event(message)) => {
        assert_eq!(message.subscribed_subscription, subscription);
    });

    bob.publish(
        "com.user.account.created",
        List::from_iter([Value::Integer(2)]),
        Dictionary::default(),
    )
    .await
    .unwrap();
    assert_matches::assert_matches!(alice.try_receive().await, None);
}

#[tokio::test]
async fn publisher_excluded_only_when_requested() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let mut alice = connect(&router_handle, REALM).await;

    alice.subscribe("com.x.greet").await.unwrap();

    // With exclude_me, the publisher does not receive its own event.
    alice
        .publish(
            "com.x.greet",
            List::from_iter([Value::Integer(1)]),
            Dictionary::from_iter([("exclude_me".to_owned(), Value::Bool(true))]),
        )
        .await
        .unwrap();
    assert_matches::assert_matches!(alice.try_receive().await, None);

    // Without it, the publisher is an ordinary subscriber.
    alice
        .publish(
            "com.x.greet",
            List::from_iter([Value::Integer(2)]),
            Dictionary::default(),
        )
        .await
        .unwrap();
    assert_matches::assert_matches!(alice.receive().await, Ok(Message::Event(message)) => {
        pretty_assertions::assert_eq!(message.publish_arguments, List::from_iter([Value::Integer(2)]));
    });
}

#[tokio::test]
async fn exclude_and_eligible_filter_receivers() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let mut alice = connect(&router_handle, REALM).await;
    let mut bob = connect(&router_handle, REALM).await;
    let mut carol = connect(&router_handle, REALM).await;
    let mut dave = connect(&router_handle, REALM).await;

    let alice_session = alice.session.unwrap();
    let bob_session = bob.session.unwrap();

    alice.subscribe("com.x.topic").await.unwrap();
    bob.subscribe("com.x.topic").await.unwrap();
    carol.subscribe("com.x.topic").await.unwrap();

    // Alice and Bob are eligible, but Bob is excluded.
    dave.publish(
        "com.x.topic",
        List::from_iter([Value::Integer(42)]),
        Dictionary::from_iter([
            (
                "eligible".to_owned(),
                Value::List(List::from_iter([
                    Value::Integer(alice_session.into()),
                    Value::Integer(bob_session.into()),
                ])),
            ),
            (
                "exclude".to_owned(),
                Value::List(List::from_iter([Value::Integer(bob_session.into())])),
            ),
        ]),
    )
    .await
    .unwrap();

    assert_matches::assert_matches!(alice.receive().await, Ok(Message::Event(_)));
    assert_matches::assert_matches!(bob.try_receive().await, None);
    assert_matches::assert_matches!(carol.try_receive().await, None);
}

#[tokio::test]
async fn events_from_one_publisher_preserve_publication_order() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let mut subscriber = connect(&router_handle, REALM).await;
    let mut publisher = connect(&router_handle, REALM).await;

    subscriber.subscribe("com.x.counter").await.unwrap();

    for i in 0..5 {
        publisher
            .publish(
                "com.x.counter",
                List::from_iter([Value::Integer(i)]),
                Dictionary::default(),
            )
            .await
            .unwrap();
    }

    for i in 0..5 {
        assert_matches::assert_matches!(subscriber.receive().await, Ok(Message::Event(message)) => {
            pretty_assertions::assert_eq!(message.publish_arguments, List::from_iter([Value::Integer(i)]));
        });
    }
}

#[tokio::test]
async fn resubscribing_returns_the_existing_subscription() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let mut alice = connect(&router_handle, REALM).await;

    let first = alice.subscribe("com.x.topic").await.unwrap();
    let second = alice.subscribe("com.x.topic").await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn unsubscribing_stops_event_delivery() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let mut alice = connect(&router_handle, REALM).await;
    let mut bob = connect(&router_handle, REALM).await;

    let subscription = alice.subscribe("com.x.topic").await.unwrap();

    let request = alice.next_request_id();
    alice
        .send(Message::Unsubscribe(UnsubscribeMessage {
            request,
            subscribed_subscription: subscription,
        }))
        .await
        .unwrap();
    assert_matches::assert_matches!(alice.receive().await, Ok(Message::Unsubscribed(message)) => {
        assert_eq!(message.unsubscribe_request, request);
    });

    bob.publish("com.x.topic", List::default(), Dictionary::default())
        .await
        .unwrap();
    assert_matches::assert_matches!(alice.try_receive().await, None);
}

#[tokio::test]
async fn unsubscribing_an_unknown_subscription_fails() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let mut alice = connect(&router_handle, REALM).await;

    let request = alice.next_request_id();
    alice
        .send(Message::Unsubscribe(UnsubscribeMessage {
            request,
            subscribed_subscription: Id::try_from(12345).unwrap(),
        }))
        .await
        .unwrap();
    assert_matches::assert_matches!(alice.receive().await, Ok(Message::Error(message)) => {
        assert_eq!(message.request, request);
        assert_eq!(message.error.as_ref(), "wamp.error.no_such_subscription");
    });
}

#[tokio::test]
async fn subscribing_with_invalid_uri_for_exact_match_fails() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let mut alice = connect(&router_handle, REALM).await;

    // A pattern URI is not a valid exact-match topic.
    let request = alice.next_request_id();
    alice
        .send(Message::Subscribe(wamproute::message::message::SubscribeMessage {
            request,
            options: Dictionary::default(),
            topic: wamproute::core::uri::WildcardUri::try_from("com..x").unwrap(),
        }))
        .await
        .unwrap();

    assert_matches::assert_matches!(alice.receive().await, Ok(Message::Error(message)) => {
        assert_eq!(message.request, request);
        assert_eq!(message.error.as_ref(), "wamp.error.invalid_uri");
    });

    // No state was created: subscribing properly afterwards works from scratch.
    assert_matches::assert_matches!(alice.subscribe("com.x").await, Ok(_));
}

#[tokio::test]
async fn publication_without_acknowledge_is_silent() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let mut alice = connect(&router_handle, REALM).await;
    let mut bob = connect(&router_handle, REALM).await;

    alice.subscribe("com.x.topic").await.unwrap();
    bob.publish("com.x.topic", List::default(), Dictionary::default())
        .await
        .unwrap();

    assert_matches::assert_matches!(alice.receive().await, Ok(Message::Event(_)));
    assert_matches::assert_matches!(bob.try_receive().await, None);
}

#[tokio::test]
async fn subscriptions_do_not_cross_realms() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let mut alice = connect(&router_handle, REALM).await;
    let mut bob = connect(&router_handle, OTHER_REALM).await;

    alice.subscribe("com.x.topic").await.unwrap();
    bob.publish("com.x.topic", List::default(), Dictionary::default())
        .await
        .unwrap();

    assert_matches::assert_matches!(alice.try_receive().await, None);
}

#[tokio::test]
async fn disclosed_publisher_is_visible_to_subscribers() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let mut alice = connect(&router_handle, REALM).await;
    let mut bob = connect(&router_handle, REALM).await;
    let bob_session = bob.session.unwrap();

    alice.subscribe("com.x.topic").await.unwrap();
    bob.publish(
        "com.x.topic",
        List::default(),
        Dictionary::from_iter([("disclose_me".to_owned(), Value::Bool(true))]),
    )
    .await
    .unwrap();

    assert_matches::assert_matches!(alice.receive().await, Ok(Message::Event(message)) => {
        assert_eq!(
            message.details.get("publisher"),
            Some(&Value::Integer(bob_session.into()))
        );
    });
}

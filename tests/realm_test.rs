use anyhow::Result;
use test_utils::peer::TestPeer;
use wamproute::{
    core::{
        types::Dictionary,
        uri::{
            Uri,
            WildcardUri,
        },
    },
    message::message::{
        GoodbyeMessage,
        HelloMessage,
        Message,
        SubscribeMessage,
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

#[tokio::test]
async fn peer_joins_realm() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let mut peer = TestPeer::connect_direct(&router_handle);

    assert_matches::assert_matches!(peer.join_realm(REALM).await, Ok(session) => {
        assert!(u64::from(session) >= 1);
    });

    router_handle.cancel().unwrap();
    router_handle.join().await.unwrap();
}

#[tokio::test]
async fn rejects_unknown_realm() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let mut peer = TestPeer::connect_direct(&router_handle);

    peer.send(Message::Hello(HelloMessage {
        realm: Uri::try_from("com.wamproute.missing").unwrap(),
        details: Dictionary::default(),
    }))
    .await
    .unwrap();

    assert_matches::assert_matches!(peer.receive().await, Ok(Message::Abort(message)) => {
        assert_eq!(message.reason.as_ref(), "wamp.error.no_such_realm");
    });
}

#[tokio::test]
async fn goodbye_handshake_closes_session() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let mut peer = TestPeer::connect_direct(&router_handle);
    peer.join_realm(REALM).await.unwrap();

    peer.send(Message::Goodbye(GoodbyeMessage {
        details: Dictionary::default(),
        reason: Uri::try_from("wamp.close.close_realm").unwrap(),
    }))
    .await
    .unwrap();

    assert_matches::assert_matches!(peer.receive().await, Ok(Message::Goodbye(message)) => {
        assert_eq!(message.reason.as_ref(), "wamp.close.goodbye_and_out");
    });
}

#[tokio::test]
async fn new_session_starts_on_same_connection_after_goodbye() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let mut peer = TestPeer::connect_direct(&router_handle);
    let first_session = peer.join_realm(REALM).await.unwrap();

    peer.send(Message::Goodbye(GoodbyeMessage {
        details: Dictionary::default(),
        reason: Uri::try_from("wamp.close.close_realm").unwrap(),
    }))
    .await
    .unwrap();
    assert_matches::assert_matches!(peer.receive().await, Ok(Message::Goodbye(_)));

    assert_matches::assert_matches!(peer.join_realm(OTHER_REALM).await, Ok(second_session) => {
        assert_ne!(first_session, second_session);
    });
}

#[tokio::test]
async fn aborts_session_on_message_before_hello() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let mut peer = TestPeer::connect_direct(&router_handle);

    let request = peer.next_request_id();
    peer.send(Message::Subscribe(SubscribeMessage {
        request,
        options: Dictionary::default(),
        topic: WildcardUri::try_from("com.wamproute.topic").unwrap(),
    }))
    .await
    .unwrap();

    assert_matches::assert_matches!(peer.receive().await, Ok(Message::Abort(message)) => {
        assert_eq!(message.reason.as_ref(), "wamp.error.protocol_violation");
    });
}

#[tokio::test]
async fn router_shutdown_closes_established_sessions() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();
    let mut peer = TestPeer::connect_direct(&router_handle);
    peer.join_realm(REALM).await.unwrap();

    router_handle.cancel().unwrap();

    assert_matches::assert_matches!(peer.receive().await, Ok(Message::Goodbye(message)) => {
        assert_eq!(message.reason.as_ref(), "wamp.close.system_shutdown");
    });
    peer.send(Message::Goodbye(GoodbyeMessage {
        details: Dictionary::default(),
        reason: Uri::try_from("wamp.close.goodbye_and_out").unwrap(),
    }))
    .await
    .unwrap();

    router_handle.join().await.unwrap();
}

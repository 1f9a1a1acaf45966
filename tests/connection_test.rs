use anyhow::Result;
use futures_util::{
    SinkExt,
    StreamExt,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Message as WsMessage,
        client::IntoClientRequest,
        http::header::SEC_WEBSOCKET_PROTOCOL,
    },
};
use wamproute::{
    core::{
        types::Dictionary,
        uri::Uri,
    },
    message::message::{
        HelloMessage,
        Message,
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
    serializer::serializer::{
        SerializerType,
        new_serializer,
    },
};

const REALM: &str = "com.wamproute.test";

async fn start_router() -> Result<RouterHandle> {
    let mut config = RouterConfig::default();
    config.realms.push(RealmConfig {
        name: "test".to_owned(),
        uri: Uri::try_from(REALM)?,
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

#[tokio::test(flavor = "multi_thread")]
async fn negotiates_json_binding_over_websocket() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();

    let mut request = format!("ws://{}", router_handle.local_addr())
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, "wamp.2.json".parse().unwrap());
    let (mut stream, response) = connect_async(request).await.unwrap();
    assert_eq!(
        response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|header| header.to_str().ok()),
        Some("wamp.2.json")
    );

    stream
        .send(WsMessage::Text(
            format!(r#"[1,"{REALM}",{{}}]"#).into(),
        ))
        .await
        .unwrap();

    let reply = stream.next().await.unwrap().unwrap();
    assert!(reply.is_text());
    let reply: serde_json::Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(reply[0], serde_json::json!(2));
    assert!(reply[1].is_u64());

    router_handle.cancel().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn negotiates_message_pack_binding_over_websocket() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();

    let mut request = format!("ws://{}", router_handle.local_addr())
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, "wamp.2.msgpack".parse().unwrap());
    let (mut stream, response) = connect_async(request).await.unwrap();
    assert_eq!(
        response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|header| header.to_str().ok()),
        Some("wamp.2.msgpack")
    );

    let serializer = new_serializer(SerializerType::MessagePack);
    let hello = serializer
        .serialize(&Message::Hello(HelloMessage {
            realm: Uri::try_from(REALM).unwrap(),
            details: Dictionary::default(),
        }))
        .unwrap();
    stream.send(WsMessage::Binary(hello.into())).await.unwrap();

    let reply = stream.next().await.unwrap().unwrap();
    assert!(reply.is_binary());
    assert_matches::assert_matches!(
        serializer.deserialize(&reply.into_data()),
        Ok(Message::Welcome(_))
    );

    router_handle.cancel().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn rejects_connections_with_unknown_subprotocol() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();

    let mut request = format!("ws://{}", router_handle.local_addr())
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, "wamp.2.cbor".parse().unwrap());
    assert_matches::assert_matches!(connect_async(request).await, Err(_));

    router_handle.cancel().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn rejects_connections_without_subprotocol() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router().await.unwrap();

    let request = format!("ws://{}", router_handle.local_addr())
        .into_client_request()
        .unwrap();
    assert_matches::assert_matches!(connect_async(request).await, Err(_));

    router_handle.cancel().unwrap();
}

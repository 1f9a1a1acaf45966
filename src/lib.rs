//! # wamproute
//!
//! **wamproute** is an embeddable router for the **Web Application Messaging Protocol** (WAMP),
//! built on [`tokio`](https://tokio.rs) and ready for use on top of WebSocket streams.
//!
//! WAMP is an open, routed protocol that provides two messaging patterns on a single session:
//! Publish & Subscribe and routed Remote Procedure Calls. Peers talk to one another by
//! establishing sessions on a shared realm through a shared router. The protocol specification is
//! described [here](https://wamp-proto.org/spec.html).
//!
//! The router implements the broker role (topics, subscriptions, event fan-out with exact, prefix,
//! and wildcard matching) and the dealer role (procedure registrations, call/invocation
//! correlation, call cancellation, timeouts, and progressive results).
//!
//! Configure a router through a [`RouterConfig`][`crate::router::RouterConfig`] and construct it
//! directly. If you are working with WebSocket connections, the
//! [`new_web_socket_router`][`crate::router::new_web_socket_router`] utility function sets up the
//! proper modules for convenience.
//!
//! The router runs in a background task transparent to the caller. It can be interacted with
//! through the returned [`RouterHandle`][`crate::router::RouterHandle`], which also allows
//! in-process peers to attach through
//! [`direct_connect`][`crate::router::RouterHandle::direct_connect`] without a network stack.
//!
//! ```no_run
//! use wamproute::{
//!     core::uri::Uri,
//!     router::{
//!         EmptyPubSubPolicies,
//!         EmptyRpcPolicies,
//!         EmptySessionPolicies,
//!         RealmConfig,
//!         RouterConfig,
//!         new_web_socket_router,
//!     },
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut config = RouterConfig::default();
//!     config.port = 8080;
//!     config.realms.push(RealmConfig {
//!         name: "Test Realm".to_owned(),
//!         uri: Uri::try_from("com.wamproute.realm.test").unwrap(),
//!         ..Default::default()
//!     });
//!
//!     // Policy modules can be used to inject custom behavior for sessions and resources
//!     // created on the router.
//!     let router = new_web_socket_router(
//!         config,
//!         Box::new(EmptySessionPolicies::default()),
//!         Box::new(EmptyPubSubPolicies::default()),
//!         Box::new(EmptyRpcPolicies::default()),
//!     )
//!     .unwrap();
//!
//!     // Start the router in a background task.
//!     let router_handle = router.start().await.unwrap();
//!
//!     // Let the router run for as long as desired...
//!
//!     // Cancel and wait for the router to terminate.
//!     router_handle.cancel().unwrap();
//!     router_handle.join().await.unwrap();
//! }
//! ```
pub mod core;
pub mod message;
pub mod router;
pub mod serializer;
pub mod transport;

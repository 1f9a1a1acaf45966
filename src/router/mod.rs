mod acceptor;
mod app;
mod connection;
mod context;
mod procedure;
mod realm;
mod router;
mod session;
mod topic;
mod web_socket_router;

pub use acceptor::{
    acceptor::{
        Acceptance,
        Acceptor,
        AcceptorFactory,
    },
    web_socket_acceptor::WebSocketAcceptorFactory,
};
pub use app::{
    access::{
        EmptySessionPolicies,
        SessionPolicies,
    },
    pub_sub::{
        EmptyPubSubPolicies,
        PubSubPolicies,
    },
    rpc::{
        EmptyRpcPolicies,
        RpcPolicies,
    },
};
pub use context::{
    RealmContext,
    RouterContext,
};
pub use realm::RealmConfig;
pub use router::{
    DirectConnection,
    Router,
    RouterConfig,
    RouterHandle,
};
pub use session::SessionHandle;
pub use web_socket_router::{
    WebSocketRouter,
    new_web_socket_router,
};

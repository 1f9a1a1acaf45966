use anyhow::Result;
use async_trait::async_trait;

use crate::{
    core::id::Id,
    message::message::HelloMessage,
    router::context::RealmContext,
};

/// Router-level acceptance hook for new sessions.
///
/// Consulted when a peer sends HELLO, before the session joins the requested realm. Returning an
/// error rejects the session with an ABORT message. Authentication schemes plug in here.
#[async_trait]
pub trait SessionPolicies<S>: Send + Sync {
    /// Decides whether the session may be established in the realm.
    async fn authenticate_session(
        &self,
        context: &RealmContext<S>,
        session: Id,
        message: &HelloMessage,
    ) -> Result<()>;
}

/// Default implementation of [`SessionPolicies`] that accepts every session.
#[derive(Debug, Default)]
pub struct EmptySessionPolicies {}

#[async_trait]
impl<S> SessionPolicies<S> for EmptySessionPolicies {
    async fn authenticate_session(
        &self,
        _: &RealmContext<S>,
        _: Id,
        _: &HelloMessage,
    ) -> Result<()> {
        Ok(())
    }
}

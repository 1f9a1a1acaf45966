use std::sync::Arc;

use anyhow::Result;
use futures_util::lock::{
    Mutex,
    MutexGuard,
};

use crate::{
    core::{
        error::InteractionError,
        id::Id,
        uri::Uri,
    },
    router::{
        realm::Realm,
        router::Router,
        session::SessionHandle,
    },
};

/// The context of a task running for a router.
///
/// Used to share ownership of the router across many tasks.
pub struct RouterContext<S>
where
    S: 'static,
{
    router: Arc<Router<S>>,
}

impl<S> RouterContext<S> {
    /// Constructs a new context wrapper around a router.
    pub(crate) fn new(router: Router<S>) -> Self {
        Self {
            router: Arc::new(router),
        }
    }

    pub fn router(&self) -> &Router<S> {
        self.router.as_ref()
    }

    /// The context for a single realm on the router.
    pub fn realm_context(&self, realm: &Uri) -> Result<RealmContext<S>> {
        let realm = self
            .router
            .realm_manager()
            .get(realm)
            .ok_or(InteractionError::NoSuchRealm)?;
        Ok(RealmContext {
            context: self.clone(),
            realm,
        })
    }
}

impl<S> Clone for RouterContext<S> {
    fn clone(&self) -> Self {
        Self {
            router: self.router.clone(),
        }
    }
}

/// The context of a task operating on a single realm.
///
/// All realm state is guarded by one mutex. Operations lock the realm for structural reads and
/// writes, and release the lock before sending messages out to sessions.
pub struct RealmContext<S>
where
    S: 'static,
{
    context: RouterContext<S>,
    realm: Arc<Mutex<Realm>>,
}

impl<S> RealmContext<S> {
    pub fn router(&self) -> &Router<S> {
        self.context.router()
    }

    pub fn router_context(&self) -> &RouterContext<S> {
        &self.context
    }

    /// Locks the realm for structural access.
    pub async fn lock(&self) -> MutexGuard<'_, Realm> {
        self.realm.lock().await
    }

    /// The handle of a session in the realm.
    pub async fn session(&self, session: Id) -> Option<SessionHandle> {
        self.realm
            .lock()
            .await
            .sessions
            .get(&session)
            .map(|session| session.session.clone())
    }
}

impl<S> Clone for RealmContext<S> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            realm: self.realm.clone(),
        }
    }
}

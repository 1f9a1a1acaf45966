use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    future::join_all,
    lock::Mutex,
};

use crate::{
    core::{
        close::CloseReason,
        hash::HashMap,
        id::Id,
        uri::Uri,
    },
    router::{
        procedure::ProcedureManager,
        session::SessionHandle,
        topic::TopicManager,
    },
};

/// Configuration for a single realm hosted on a router.
#[derive(Debug, Default, Clone)]
pub struct RealmConfig {
    /// Human-readable name, for logging.
    pub name: String,
    /// URI peers use to address the realm.
    pub uri: Uri,
    /// Topics that exist for the lifetime of the realm, even with no subscribers.
    pub persistent_topics: Vec<Uri>,
}

/// A session that has joined a realm.
pub struct RealmSession {
    pub session: SessionHandle,
}

/// A single routing namespace.
///
/// Subscriptions and registrations are scoped to a realm and never cross realms.
pub struct Realm {
    pub config: RealmConfig,
    pub sessions: HashMap<Id, RealmSession>,
    pub topic_manager: TopicManager,
    pub procedure_manager: ProcedureManager,
}

impl Realm {
    pub fn new(config: RealmConfig) -> Self {
        let mut topic_manager = TopicManager::default();
        for topic in &config.persistent_topics {
            topic_manager.create_persistent_topic(topic.clone());
        }
        Self {
            config,
            sessions: HashMap::default(),
            topic_manager,
            procedure_manager: ProcedureManager::default(),
        }
    }

    pub fn uri(&self) -> &Uri {
        &self.config.uri
    }
}

/// Shuts down a realm by closing all of its sessions.
pub async fn shut_down_realm(realm: &Mutex<Realm>, close_reason: CloseReason) -> Result<()> {
    let mut closed_rxs = Vec::default();
    {
        let realm = realm.lock().await;
        for session in realm.sessions.values() {
            session.session.close(close_reason)?;
            closed_rxs.push(session.session.closed_session_rx());
        }
    }

    let futures = closed_rxs.iter_mut().map(|rx| rx.recv());
    tokio::select! {
        _ = join_all(futures) => {},
        _ = tokio::time::sleep(Duration::from_secs(2)) => {
            return Err(Error::msg("timed out waiting for sessions to close cleanly"));
        }
    }

    realm.lock().await.sessions.clear();
    Ok(())
}

/// The set of realms hosted on a router.
#[derive(Default)]
pub struct RealmManager {
    realms: HashMap<Uri, Arc<Mutex<Realm>>>,
}

impl RealmManager {
    pub fn get(&self, uri: &Uri) -> Option<Arc<Mutex<Realm>>> {
        self.realms.get(uri).cloned()
    }

    pub fn insert(&mut self, realm: Realm) {
        let uri = realm.uri().clone();
        self.realms.insert(uri, Arc::new(Mutex::new(realm)));
    }

    pub fn uris(&self) -> impl Iterator<Item = &Uri> {
        self.realms.keys()
    }
}

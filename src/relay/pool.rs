use std::sync::Arc;

use futures_util::future::join_all;

use crate::signer::Event;

use super::session::RelaySession;

/// The announcer's set of relay sessions, one per configured endpoint.
pub struct RelayPool {
    sessions: Vec<Arc<RelaySession>>,
}

impl RelayPool {
    pub fn new(urls: impl IntoIterator<Item = String>) -> Self {
        Self {
            sessions: urls
                .into_iter()
                .map(|url| Arc::new(RelaySession::new(url)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn connect_all(&self) {
        for session in &self.sessions {
            session.connect();
        }
    }

    /// Broadcasts one event to every relay; returns how many acknowledged.
    /// Individual relay failures are logged by the sessions and ignored.
    pub async fn publish_all(&self, event: &Event) -> usize {
        let publishes = self
            .sessions
            .iter()
            .map(|session| session.publish(event.clone()));
        join_all(publishes)
            .await
            .into_iter()
            .filter(|accepted| *accepted)
            .count()
    }

    pub fn disconnect_all(&self) {
        for session in &self.sessions {
            session.disconnect();
        }
    }
}

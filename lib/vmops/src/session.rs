// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process-wide cache of vCenter sessions.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex};

use slog::{debug, info};

/// A live connection to a vCenter endpoint.
pub trait Session: Send + Sync {
    /// Returns whether the session can still be used.
    fn is_connected(&self) -> bool;

    /// Ends the session. Must tolerate being called on a session that has
    /// already dropped its connection.
    fn disconnect(&self);
}

/// The endpoint a session is connected to.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionKey {
    pub host: String,
    pub port: u16,
}

impl Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Sessions keyed by `host:port`.
///
/// A session is created on first use and cached. A cached session that
/// reports itself disconnected is replaced on the next lookup.
pub struct SessionRegistry<S: Session> {
    sessions: Mutex<BTreeMap<SessionKey, Arc<S>>>,
    log: slog::Logger,
}

impl<S: Session> SessionRegistry<S> {
    pub fn new(log: slog::Logger) -> Self {
        Self { sessions: Mutex::new(BTreeMap::new()), log }
    }

    /// Returns the cached session for `host:port`, calling `connect` to
    /// create one if none is cached or the cached one is disconnected.
    ///
    /// The registry stays locked while `connect` runs, so concurrent callers
    /// for the same endpoint never open two sessions.
    pub fn get_or_connect<F, E>(
        &self,
        host: &str,
        port: u16,
        connect: F,
    ) -> Result<Arc<S>, E>
    where
        F: FnOnce(&str, u16) -> Result<S, E>,
    {
        let key = SessionKey { host: host.to_owned(), port };
        let mut sessions = self.sessions.lock().unwrap();

        if let Some(existing) = sessions.get(&key) {
            if existing.is_connected() {
                debug!(self.log, "reusing session"; "endpoint" => %key);
                return Ok(Arc::clone(existing));
            }
            info!(self.log, "cached session disconnected, reconnecting";
                  "endpoint" => %key);
            existing.disconnect();
            sessions.remove(&key);
        }

        let session = Arc::new(connect(host, port)?);
        info!(self.log, "connected"; "endpoint" => %key);
        sessions.insert(key, Arc::clone(&session));
        Ok(session)
    }

    /// Drops and disconnects the session for `host:port`, if any.
    pub fn clear(&self, host: &str, port: u16) -> bool {
        let key = SessionKey { host: host.to_owned(), port };
        let removed = self.sessions.lock().unwrap().remove(&key);
        match removed {
            Some(session) => {
                session.disconnect();
                info!(self.log, "session cleared"; "endpoint" => %key);
                true
            }
            None => false,
        }
    }

    /// Drops and disconnects every cached session.
    pub fn clear_all(&self) {
        let sessions = std::mem::take(&mut *self.sessions.lock().unwrap());
        for (key, session) in sessions {
            session.disconnect();
            info!(self.log, "session cleared"; "endpoint" => %key);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

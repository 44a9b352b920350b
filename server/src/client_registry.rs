//! The live set of connected client sessions.
//!
//! The registry owns one slot per possible connection (capacity
//! [`MAX_CLIENTS`]) and hands out sessions on registration. Username
//! lookups see only logged-in sessions. The live count is published
//! through a watch channel so shutdown can wait for the set to drain.
//! Registration and login-binding share one lock, which is what makes
//! "at most one live session per player name" an invariant rather than
//! a race.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::client::ClientSession;
use crate::errors::OperationError;
use crate::player::Player;

/// Maximum number of simultaneously connected clients.
pub const MAX_CLIENTS: usize = 64;

pub struct ClientRegistry {
    slots: Mutex<Vec<Option<Arc<ClientSession>>>>,
    /// Live-session count, published on every register/unregister. The
    /// empty-barrier is a wait for this to read zero.
    count: watch::Sender<usize>,
}

impl ClientRegistry {
    pub fn new() -> Arc<Self> {
        debug!("initializing client registry ({} slots)", MAX_CLIENTS);
        let (count, _) = watch::channel(0);
        Arc::new(Self {
            slots: Mutex::new(vec![None; MAX_CLIENTS]),
            count,
        })
    }

    /// Register an accepted connection, creating its session. The write
    /// half moves into the session; the read half is returned for the
    /// service loop. Returns `None`, dropping the connection unanswered,
    /// when the registry is full.
    pub fn register(
        self: &Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Option<(Arc<ClientSession>, OwnedReadHalf)> {
        let (read_half, write_half) = stream.into_split();
        let mut slots = self.lock();
        let Some(slot) = slots.iter().position(Option::is_none) else {
            info!("registry full, refusing connection from {}", addr);
            return None;
        };

        let session = ClientSession::new(self.clone(), addr, write_half);
        slots[slot] = Some(session.clone());
        let live = slots.iter().filter(|s| s.is_some()).count();
        self.count.send_replace(live);
        info!(
            "[{}] registered client from {} (total connected: {})",
            session.id(),
            addr,
            live
        );
        Some((session, read_half))
    }

    /// Remove a session from the registry. Releases the empty-barrier when
    /// the last session goes. Returns false if the session was not
    /// registered.
    pub fn unregister(&self, session: &Arc<ClientSession>) -> bool {
        let mut slots = self.lock();
        let Some(slot) = slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|held| Arc::ptr_eq(held, session)))
        else {
            debug!("[{}] unregister: session not found", session.id());
            return false;
        };
        slots[slot] = None;
        let live = slots.iter().filter(|s| s.is_some()).count();
        self.count.send_replace(live);
        info!(
            "[{}] unregistered client (total connected: {})",
            session.id(),
            live
        );
        true
    }

    /// The live session logged in under `name`, if there is one.
    pub fn lookup(&self, name: &str) -> Option<Arc<ClientSession>> {
        let slots = self.lock();
        slots
            .iter()
            .flatten()
            .find(|session| {
                session
                    .player()
                    .is_some_and(|player| player.name() == name)
            })
            .cloned()
    }

    /// A snapshot of every currently logged-in player. The clones remain
    /// valid after the registry lock is released.
    pub fn all_players(&self) -> Vec<Arc<Player>> {
        let slots = self.lock();
        slots
            .iter()
            .flatten()
            .filter_map(|session| session.player())
            .collect()
    }

    /// Atomically check that `player`'s name is unclaimed and bind it to
    /// `session`. This is the whole of the unique-live-login invariant.
    pub(crate) fn bind_player(
        &self,
        session: &ClientSession,
        player: Arc<Player>,
    ) -> Result<(), OperationError> {
        let slots = self.lock();
        if session.player().is_some() {
            return Err(OperationError::AlreadyLoggedIn);
        }
        let taken = slots.iter().flatten().any(|other| {
            other
                .player()
                .is_some_and(|held| held.name() == player.name())
        });
        if taken {
            return Err(OperationError::NameInUse(player.name().to_string()));
        }
        session.set_player(player);
        Ok(())
    }

    /// Ask every live session's service loop to wind down, as if its
    /// client had closed the connection. Sessions are *not* unregistered
    /// here; each service loop does that itself on the way out, which is
    /// what eventually releases [`wait_for_empty`](Self::wait_for_empty).
    pub fn shutdown_all(&self) {
        let slots = self.lock();
        let live: Vec<_> = slots.iter().flatten().cloned().collect();
        info!("shutting down {} client connection(s)", live.len());
        for session in live {
            debug!("[{}] requesting shutdown", session.id());
            session.request_shutdown();
        }
    }

    /// Block until no sessions remain registered. May be called from any
    /// number of tasks; all of them are released together when the count
    /// reaches zero (including immediately, if it already is).
    pub async fn wait_for_empty(&self) {
        let mut count = self.count.subscribe();
        // The sender lives in self, so this cannot fail while we borrow it.
        let _ = count.wait_for(|live| *live == 0).await;
    }

    /// Number of currently registered sessions.
    pub fn len(&self) -> usize {
        *self.count.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Option<Arc<ClientSession>>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testutil::register_one;
    use crate::player_registry::PlayerRegistry;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_register_and_unregister_track_count() {
        let registry = ClientRegistry::new();
        assert!(registry.is_empty());

        let (a, _ra) = register_one(&registry).await;
        let (b, _rb) = register_one(&registry).await;
        assert_eq!(registry.len(), 2);

        assert!(registry.unregister(&a));
        assert_eq!(registry.len(), 1);
        assert!(!registry.unregister(&a), "double unregister must fail");
        assert!(registry.unregister(&b));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_sees_only_logged_in_sessions() {
        let registry = ClientRegistry::new();
        let players = PlayerRegistry::new();
        let (a, _ra) = register_one(&registry).await;
        let (_b, _rb) = register_one(&registry).await;

        assert!(registry.lookup("alice").is_none());
        a.login(players.register("alice")).unwrap();

        let found = registry.lookup("alice").unwrap();
        assert!(Arc::ptr_eq(&found, &a));
        assert!(registry.lookup("bob").is_none());
    }

    #[tokio::test]
    async fn test_all_players_snapshots_logged_in_players() {
        let registry = ClientRegistry::new();
        let players = PlayerRegistry::new();
        let (a, _ra) = register_one(&registry).await;
        let (b, _rb) = register_one(&registry).await;
        let (_c, _rc) = register_one(&registry).await;

        a.login(players.register("alice")).unwrap();
        b.login(players.register("bob")).unwrap();

        let mut names: Vec<_> = registry
            .all_players()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, ["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_wait_for_empty_is_a_barrier() {
        let registry = ClientRegistry::new();

        // Empty registry: returns immediately.
        timeout(Duration::from_secs(1), registry.wait_for_empty())
            .await
            .expect("empty registry must not block");

        let (a, _ra) = register_one(&registry).await;
        let (b, _rb) = register_one(&registry).await;

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_for_empty().await })
        };
        // Still armed while sessions remain.
        assert!(
            timeout(Duration::from_millis(50), registry.wait_for_empty())
                .await
                .is_err()
        );

        registry.unregister(&a);
        registry.unregister(&b);
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("barrier must release on empty")
            .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_name_binding_is_refused() {
        let registry = ClientRegistry::new();
        let players = PlayerRegistry::new();
        let (a, _ra) = register_one(&registry).await;
        let (b, _rb) = register_one(&registry).await;

        a.login(players.register("alice")).unwrap();
        assert!(matches!(
            b.login(players.register("alice")),
            Err(OperationError::NameInUse(_))
        ));

        // Once the first session unregisters and logs out, the name frees.
        a.logout().await.unwrap();
        registry.unregister(&a);
        b.login(players.register("alice")).unwrap();
    }
}

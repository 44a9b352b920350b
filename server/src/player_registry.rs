//! The canonical username → player map.
//!
//! Registration is idempotent: the first LOGIN under a name creates the
//! player, every later one (including after a disconnect) gets the same
//! record back with its rating intact. Nothing is ever evicted; the map
//! lives for the whole server run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info};

use crate::player::Player;

#[derive(Debug, Default)]
pub struct PlayerRegistry {
    players: Mutex<HashMap<String, Arc<Player>>>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        debug!("initializing player registry");
        Self {
            players: Mutex::new(HashMap::new()),
        }
    }

    /// Look up or create the player with the given name.
    pub fn register(&self, name: &str) -> Arc<Player> {
        let mut players = self
            .players
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match players.get(name) {
            Some(player) => {
                debug!("player `{}` already registered", name);
                player.clone()
            }
            None => {
                debug!("registering new player `{}`", name);
                let player = Arc::new(Player::new(name));
                players.insert(name.to_string(), player.clone());
                player
            }
        }
    }

    /// Number of players ever registered this run.
    pub fn len(&self) -> usize {
        self.players
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Log the final standings. Called once during graceful shutdown, after
    /// every session has drained.
    pub fn finalize(&self) {
        let players = self
            .players
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut standings: Vec<_> = players.values().cloned().collect();
        standings.sort_by_key(|p| std::cmp::Reverse(p.rating()));
        info!("final standings ({} players):", standings.len());
        for player in standings {
            info!("  {}\t{}", player.name(), player.rating());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::{post_result, INITIAL_RATING};
    use shared::game::{GameRole, Outcome};

    #[test]
    fn test_registration_is_idempotent() {
        let registry = PlayerRegistry::new();
        let first = registry.register("alice");
        let again = registry.register("alice");

        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_distinct_names_get_distinct_players() {
        let registry = PlayerRegistry::new();
        let alice = registry.register("alice");
        let bob = registry.register("bob");

        assert!(!Arc::ptr_eq(&alice, &bob));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_rating_survives_reregistration() {
        let registry = PlayerRegistry::new();
        let alice = registry.register("alice");
        let bob = registry.register("bob");
        post_result(&alice, &bob, Outcome::Win(GameRole::First));
        drop((alice, bob));

        // A later login under the same names sees the updated ratings.
        assert_eq!(registry.register("alice").rating(), INITIAL_RATING + 16);
        assert_eq!(registry.register("bob").rating(), INITIAL_RATING - 16);
    }
}

//! Player records and rating arithmetic.
//!
//! A [`Player`] is the persistent identity behind a username: created on
//! first login, retained by the player registry for the life of the server,
//! and shared by reference with whichever session is currently logged in
//! under that name. The username never changes; the rating does, through
//! [`post_result`], which applies the Elo update after every finished game.

use std::sync::{Mutex, PoisonError};

use log::{debug, info};
use shared::game::{GameRole, Outcome};

/// Rating assigned to a newly created player.
pub const INITIAL_RATING: i32 = 1500;

/// Elo K-factor: the maximum rating movement a single game can cause.
const ELO_K: f64 = 32.0;

/// A named, rated player.
#[derive(Debug)]
pub struct Player {
    name: String,
    rating: Mutex<i32>,
}

impl Player {
    /// Create a player with the initial rating.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rating: Mutex::new(INITIAL_RATING),
        }
    }

    /// The player's username.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The player's current rating.
    pub fn rating(&self) -> i32 {
        *self
            .rating
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// The probability that a player rated `rating` beats one rated
/// `opponent`, under the Elo model with a 400-point scale.
pub fn expected_score(rating: i32, opponent: i32) -> f64 {
    1.0 / (1.0 + 10f64.powf(f64::from(opponent - rating) / 400.0))
}

/// Post the result of a finished game between `first` (the player who held
/// the first-player role) and `second`.
///
/// Scores are 1 for a win, 0 for a loss, 0.5 each for a draw. The rating
/// delta is computed once from both current ratings, truncated to an
/// integer, and applied with opposite signs, so the two ratings always move
/// by exactly opposite amounts. Both ratings are read and written under
/// both players' locks, taken in a stable order, so concurrent readers
/// never observe a half-applied update.
pub fn post_result(first: &Player, second: &Player, outcome: Outcome) {
    if std::ptr::eq(first, second) {
        debug!("dropping result that names the same player on both sides");
        return;
    }

    // Lock in address order so two concurrent posts over the same pair
    // cannot deadlock.
    let (lock_a, lock_b) = if (first as *const Player) < (second as *const Player) {
        (&first.rating, &second.rating)
    } else {
        (&second.rating, &first.rating)
    };
    let mut guard_a = lock_a.lock().unwrap_or_else(PoisonError::into_inner);
    let mut guard_b = lock_b.lock().unwrap_or_else(PoisonError::into_inner);
    let (first_rating, second_rating) = if std::ptr::eq(lock_a, &first.rating) {
        (&mut *guard_a, &mut *guard_b)
    } else {
        (&mut *guard_b, &mut *guard_a)
    };

    let first_score = match outcome {
        Outcome::Draw => 0.5,
        Outcome::Win(GameRole::First) => 1.0,
        Outcome::Win(GameRole::Second) => 0.0,
    };
    let expected = expected_score(*first_rating, *second_rating);
    let delta = (ELO_K * (first_score - expected)) as i32;

    *first_rating += delta;
    *second_rating -= delta;
    info!(
        "result posted: {} {} vs {} {} ({:?}), ratings now {} / {}",
        first.name(),
        first_score,
        second.name(),
        1.0 - first_score,
        outcome,
        *first_rating,
        *second_rating
    );
}

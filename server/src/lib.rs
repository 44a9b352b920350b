//! # Match Server Library
//!
//! Server side of the two-player match service. It accepts client
//! connections and mediates invitations and games between logged-in
//! players, keeping Elo ratings for the life of the process.
//!
//! ## Module Organization
//!
//! - [`player`] / [`player_registry`]: persistent player records (name,
//!   rating) and the canonical name to player map. Players are created on
//!   first login and never evicted, so ratings survive disconnects.
//! - [`invitation`]: the three-state offer (open, accepted, closed)
//!   linking two sessions, holding the game while one is in progress.
//! - [`client`]: per-connection session state and every client-visible
//!   operation (login, logout, invite, revoke, decline, accept, move,
//!   resign), plus the serialized outbound packet path.
//! - [`client_registry`]: the bounded live-session set. Handles username
//!   lookup, player snapshots, shutdown broadcast, and the empty-barrier
//!   that graceful shutdown waits on.
//! - [`network`]: the accept loop and the per-connection service loop
//!   that decodes requests and dispatches them.
//! - [`errors`]: the request-level error type behind every NACK.
//!
//! ## Concurrency Model
//!
//! One tokio task per connection plus the acceptor. Sessions touch each
//! other constantly (an invitation lives in two sessions' lists), so the
//! locking rules are few and strict. Two-session operations lock both
//! invitation lists in ascending session-id order. List removals commit
//! before the notifications that report them, and no state lock is ever
//! held across the process-wide send lock.

pub mod client;
pub mod client_registry;
pub mod errors;
pub mod invitation;
pub mod network;
pub mod player;
pub mod player_registry;

//! # Shared Match-Server Library
//!
//! This crate contains everything that both the match server and its clients
//! need in order to talk to each other: the framed binary wire protocol and
//! the game abstraction that a match is played over.
//!
//! ## Wire Protocol
//!
//! Every message on the wire is a *packet*: a fixed 16-byte header followed
//! by an optional raw payload. The header carries the packet type, a small
//! integer id (usually a client-local invitation id), a game role, the
//! payload length, and a send timestamp. Multi-byte header fields travel in
//! network byte order and are converted exactly once, at the codec boundary.
//! See [`protocol`] for the header layout, the packet type table, and the
//! async send/receive functions.
//!
//! ## Game Abstraction
//!
//! The server mediates two-player matches but does not care which game is
//! being played; it only needs a small capability set: parse a move, apply
//! it, resign, test for termination, and render the state as text. That
//! contract is the [`game::Game`] trait. The one shipped implementation is
//! [`game::TicTacToe`].
//!
//! ## Design Notes
//!
//! - The codec never panics on malformed input; truncated frames surface as
//!   errors and a clean end-of-stream is reported as a distinct non-error
//!   signal so service loops can terminate quietly.
//! - Payloads are opaque 8-bit bytes with no terminator; interpretation
//!   (usernames, move strings, board text) happens above the codec.

pub mod game;
pub mod protocol;

pub use game::{Game, GameError, GameMove, GameRole, Outcome, TicTacToe};
pub use protocol::{
    recv_packet, send_packet, Packet, PacketHeader, PacketType, ProtocolError, HEADER_SIZE,
};

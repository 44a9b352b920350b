//! Operation errors for the session layer.
//!
//! Every variant here is a *request-level* failure: the request was
//! well-formed on the wire but invalid in the current state. The service
//! loop answers all of them with a single NACK and keeps the connection
//! alive. Connection-fatal conditions (truncated frames, dead peers) travel
//! as [`shared::ProtocolError`] instead.

use shared::game::GameError;
use shared::protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OperationError {
    /// LOGIN on a session that is already logged in.
    #[error("client is already logged in")]
    AlreadyLoggedIn,

    /// An operation that requires a logged-in session.
    #[error("client is not logged in")]
    NotLoggedIn,

    /// LOGIN under a name some live session already holds.
    #[error("player `{0}` is already logged in on another connection")]
    NameInUse(String),

    /// INVITE naming a player with no logged-in session.
    #[error("no logged-in player named `{0}`")]
    UnknownUser(String),

    /// INVITE naming the inviter itself.
    #[error("a client cannot invite itself")]
    SelfInvitation,

    /// A role byte outside {1, 2}, or matching roles for the two sides.
    #[error("invalid game role")]
    InvalidRole,

    /// The peer of an invitation logged out mid-operation.
    #[error("the invitation peer is no longer available")]
    PeerUnavailable,

    /// An invitation id that names no live invitation on this session.
    #[error("no invitation with id {0}")]
    UnknownInvitation(u8),

    /// The invitation exists but is not in the state the operation needs.
    #[error("invitation is not in the required state")]
    WrongState,

    /// The caller is not the source of the invitation it tried to revoke.
    #[error("client is not the source of this invitation")]
    NotSource,

    /// The caller is not the target of the invitation it tried to act on.
    #[error("client is not the target of this invitation")]
    NotTarget,

    /// The session's invitation list is at its capacity bound.
    #[error("invitation list is full")]
    ListFull,

    /// A payload that must be text (username, move) was not valid UTF-8,
    /// or was empty where a name is required.
    #[error("payload is not usable text")]
    BadPayload,

    /// The move was rejected by the game.
    #[error(transparent)]
    Game(#[from] GameError),

    /// Sending a required packet failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

//! Invitations: the three-state offer linking two client sessions.
//!
//! An invitation is created OPEN by its source, stored in both
//! participants' invitation lists (usually under different local ids),
//! and either closed directly (revoke, decline) or accepted, at which
//! point it carries the game being played until that game terminates.
//!
//! State machine: `Open -> Accepted -> Closed` and `Open -> Closed`;
//! Closed is terminal. A game exists exactly while the invitation is
//! ACCEPTED (and may linger, terminated, after the transition to CLOSED).
//!
//! The invitation holds strong handles to both sessions. The reference
//! graph is torn down by the invariant that every closed invitation is
//! removed from both participants' lists, which drops the handles in the
//! other direction.

use std::sync::{Arc, Mutex, PoisonError};

use shared::game::{Game, GameRole, Outcome, TicTacToe};

use crate::client::ClientSession;
use crate::errors::OperationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationState {
    Open,
    Accepted,
    Closed,
}

struct Inner {
    state: InvitationState,
    game: Option<Box<dyn Game>>,
}

/// What a successful move did to the game.
pub struct MoveReport {
    /// The state rendering to push to the opponent.
    pub rendered: String,
    /// Set when this move terminated the game.
    pub outcome: Option<Outcome>,
}

pub struct Invitation {
    source: Arc<ClientSession>,
    target: Arc<ClientSession>,
    source_role: GameRole,
    target_role: GameRole,
    inner: Mutex<Inner>,
}

impl Invitation {
    /// Create an OPEN invitation between two distinct sessions playing
    /// different roles.
    pub fn new(
        source: Arc<ClientSession>,
        target: Arc<ClientSession>,
        source_role: GameRole,
        target_role: GameRole,
    ) -> Self {
        debug_assert!(!Arc::ptr_eq(&source, &target));
        debug_assert_ne!(source_role, target_role);
        Self {
            source,
            target,
            source_role,
            target_role,
            inner: Mutex::new(Inner {
                state: InvitationState::Open,
                game: None,
            }),
        }
    }

    pub fn source(&self) -> &Arc<ClientSession> {
        &self.source
    }

    pub fn target(&self) -> &Arc<ClientSession> {
        &self.target
    }

    pub fn source_role(&self) -> GameRole {
        self.source_role
    }

    pub fn target_role(&self) -> GameRole {
        self.target_role
    }

    /// The role played by `session`, if it is a participant.
    pub fn role_of(&self, session: &Arc<ClientSession>) -> Option<GameRole> {
        if Arc::ptr_eq(&self.source, session) {
            Some(self.source_role)
        } else if Arc::ptr_eq(&self.target, session) {
            Some(self.target_role)
        } else {
            None
        }
    }

    /// The other participant, if `session` is one.
    pub fn peer_of(&self, session: &Arc<ClientSession>) -> Option<Arc<ClientSession>> {
        if Arc::ptr_eq(&self.source, session) {
            Some(self.target.clone())
        } else if Arc::ptr_eq(&self.target, session) {
            Some(self.source.clone())
        } else {
            None
        }
    }

    pub fn state(&self) -> InvitationState {
        self.lock().state
    }

    /// Accept the invitation: OPEN -> ACCEPTED, creating the game.
    /// Returns the rendered initial game state.
    pub fn accept(&self) -> Result<String, OperationError> {
        let mut inner = self.lock();
        if inner.state != InvitationState::Open {
            return Err(OperationError::WrongState);
        }
        let game: Box<dyn Game> = Box::new(TicTacToe::new());
        let rendered = game.render();
        inner.state = InvitationState::Accepted;
        inner.game = Some(game);
        Ok(rendered)
    }

    /// Close the invitation: OPEN|ACCEPTED -> CLOSED.
    ///
    /// If a game is still in progress it is resigned by `resigner`, which
    /// is then required; a game that already terminated (or never existed)
    /// closes with `None`. Returns the game's outcome, if there was a game.
    pub fn close(&self, resigner: Option<GameRole>) -> Result<Option<Outcome>, OperationError> {
        let mut inner = self.lock();
        if inner.state == InvitationState::Closed {
            return Err(OperationError::WrongState);
        }
        if let Some(game) = inner.game.as_mut() {
            if !game.is_over() {
                let role = resigner.ok_or(OperationError::WrongState)?;
                game.resign(role)?;
            }
        }
        inner.state = InvitationState::Closed;
        Ok(inner.game.as_ref().and_then(|g| g.outcome()))
    }

    /// Parse and apply a move by `role` in the game this invitation holds.
    /// Only valid while ACCEPTED.
    pub fn make_move(&self, role: GameRole, text: &str) -> Result<MoveReport, OperationError> {
        let mut inner = self.lock();
        if inner.state != InvitationState::Accepted {
            return Err(OperationError::WrongState);
        }
        let game = inner.game.as_mut().ok_or(OperationError::WrongState)?;
        let mv = game.parse_move(role, text)?;
        game.apply_move(mv)?;
        Ok(MoveReport {
            rendered: game.render(),
            outcome: game.outcome(),
        })
    }

    /// The game's outcome, once there is one.
    pub fn outcome(&self) -> Option<Outcome> {
        self.lock().game.as_ref().and_then(|g| g.outcome())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Invitation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invitation")
            .field("source", &self.source.id())
            .field("target", &self.target.id())
            .field("source_role", &self.source_role)
            .field("target_role", &self.target_role)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testutil::session_pair;

    #[tokio::test]
    async fn test_new_invitation_is_open() {
        let (source, _a, target, _b) = session_pair().await;
        let inv = Invitation::new(source.clone(), target.clone(), GameRole::First, GameRole::Second);

        assert_eq!(inv.state(), InvitationState::Open);
        assert_eq!(inv.role_of(&source), Some(GameRole::First));
        assert_eq!(inv.role_of(&target), Some(GameRole::Second));
        assert!(Arc::ptr_eq(&inv.peer_of(&source).unwrap(), &target));
        assert!(inv.outcome().is_none());
    }

    #[tokio::test]
    async fn test_accept_creates_game_and_renders_initial_state() {
        let (source, _a, target, _b) = session_pair().await;
        let inv = Invitation::new(source, target, GameRole::Second, GameRole::First);

        let rendered = inv.accept().unwrap();
        assert_eq!(inv.state(), InvitationState::Accepted);
        assert!(rendered.contains("X to move"));

        // A second accept is an error.
        assert!(matches!(inv.accept(), Err(OperationError::WrongState)));
    }

    #[tokio::test]
    async fn test_close_open_invitation_needs_no_resigner() {
        let (source, _a, target, _b) = session_pair().await;
        let inv = Invitation::new(source, target, GameRole::First, GameRole::Second);

        assert_eq!(inv.close(None).unwrap(), None);
        assert_eq!(inv.state(), InvitationState::Closed);
        assert!(matches!(inv.close(None), Err(OperationError::WrongState)));
    }

    #[tokio::test]
    async fn test_close_with_game_in_progress_resigns() {
        let (source, _a, target, _b) = session_pair().await;
        let inv = Invitation::new(source, target, GameRole::First, GameRole::Second);
        inv.accept().unwrap();

        // Closing an in-progress game without a resigner is an error.
        assert!(matches!(inv.close(None), Err(OperationError::WrongState)));
        assert_eq!(inv.state(), InvitationState::Accepted);

        let outcome = inv.close(Some(GameRole::First)).unwrap();
        assert_eq!(outcome, Some(Outcome::Win(GameRole::Second)));
        assert_eq!(inv.state(), InvitationState::Closed);
    }

    #[tokio::test]
    async fn test_moves_only_while_accepted() {
        let (source, _a, target, _b) = session_pair().await;
        let inv = Invitation::new(source, target, GameRole::First, GameRole::Second);

        assert!(matches!(
            inv.make_move(GameRole::First, "5"),
            Err(OperationError::WrongState)
        ));

        inv.accept().unwrap();
        let report = inv.make_move(GameRole::First, "5").unwrap();
        assert!(report.outcome.is_none());
        assert!(report.rendered.contains("O to move"));

        inv.close(Some(GameRole::Second)).unwrap();
        assert!(matches!(
            inv.make_move(GameRole::First, "1"),
            Err(OperationError::WrongState)
        ));
    }

    #[tokio::test]
    async fn test_finished_game_closes_without_resigner() {
        let (source, _a, target, _b) = session_pair().await;
        let inv = Invitation::new(source, target, GameRole::First, GameRole::Second);
        inv.accept().unwrap();

        for (role, text) in [
            (GameRole::First, "1"),
            (GameRole::Second, "4"),
            (GameRole::First, "2"),
            (GameRole::Second, "5"),
        ] {
            inv.make_move(role, text).unwrap();
        }
        let report = inv.make_move(GameRole::First, "3").unwrap();
        assert_eq!(report.outcome, Some(Outcome::Win(GameRole::First)));

        assert_eq!(inv.close(None).unwrap(), Some(Outcome::Win(GameRole::First)));
        assert_eq!(inv.state(), InvitationState::Closed);
    }
}

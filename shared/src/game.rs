//! Game abstraction and the built-in tic-tac-toe implementation.
//!
//! The session layer treats a match as an opaque [`Game`]: it parses and
//! applies moves, asks whether the game is over and who won, and renders the
//! state as text for the players. Nothing above this module knows a board
//! from a deck of cards.

use std::fmt;

use thiserror::Error;

/// A participant's side in a game. On the wire, First is 1 and Second is 2;
/// 0 means "no role" (or a drawn game in an ENDED packet).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameRole {
    First,
    Second,
}

impl GameRole {
    /// The other side.
    pub fn opponent(self) -> Self {
        match self {
            GameRole::First => GameRole::Second,
            GameRole::Second => GameRole::First,
        }
    }

    /// The board mark drawn for this role.
    pub fn mark(self) -> char {
        match self {
            GameRole::First => 'X',
            GameRole::Second => 'O',
        }
    }

    /// The wire byte for this role.
    pub fn code(self) -> u8 {
        match self {
            GameRole::First => 1,
            GameRole::Second => 2,
        }
    }

    /// Decode a wire role byte; 0 and anything above 2 are not roles.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(GameRole::First),
            2 => Some(GameRole::Second),
            _ => None,
        }
    }
}

impl fmt::Display for GameRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mark())
    }
}

/// How a finished game came out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Draw,
    Win(GameRole),
}

impl Outcome {
    /// The wire byte carried in an ENDED packet's role field:
    /// 0 for a draw, otherwise the winner's role code.
    pub fn code(self) -> u8 {
        match self {
            Outcome::Draw => 0,
            Outcome::Win(role) => role.code(),
        }
    }
}

/// A parsed, validated move, ready to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameMove {
    /// The role making the move.
    pub role: GameRole,
    /// Game-defined cell index; for tic-tac-toe, 0..=8 row-major from the
    /// top-left.
    pub cell: u8,
}

/// Reasons a move can be refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    #[error("cannot interpret `{0}` as a move")]
    Malformed(String),
    #[error("the move asserts the opponent's mark")]
    WrongMark,
    #[error("it is not this player's turn")]
    NotYourTurn,
    #[error("that cell is already occupied")]
    CellOccupied,
    #[error("the game is already over")]
    GameOver,
}

/// The capability set the server requires of a game.
///
/// Implementations must be safe to drive from any task; the server
/// serializes access through the owning invitation's lock.
pub trait Game: Send {
    /// Interpret `text` as a move by `role`, checking syntax and turn
    /// order. Returns the move without applying it.
    fn parse_move(&self, role: GameRole, text: &str) -> Result<GameMove, GameError>;

    /// Apply a previously parsed move, checking legality in the current
    /// state. On success the turn passes to the opponent and termination is
    /// re-evaluated.
    fn apply_move(&mut self, mv: GameMove) -> Result<(), GameError>;

    /// Resign on behalf of `role`, awarding the win to the opponent.
    /// It is an error if the game has already terminated.
    fn resign(&mut self, role: GameRole) -> Result<(), GameError>;

    /// Whether the game has terminated.
    fn is_over(&self) -> bool;

    /// The result, once the game has terminated.
    fn outcome(&self) -> Option<Outcome>;

    /// A human-readable, multi-line description of the current state.
    fn render(&self) -> String;
}

/// The eight winning lines of a 3x3 board, as cell indices.
const LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

/// Classic tic-tac-toe. First player is X and moves first.
///
/// Move syntax: a digit `1`-`9` selecting a cell (row-major, top-left
/// origin), optionally followed by `<-X` or `<-O` asserting the mover's
/// mark. `5` and `5<-X` are the same move for the first player; `5<-O`
/// from the first player is an error.
#[derive(Debug, Clone)]
pub struct TicTacToe {
    board: [Option<GameRole>; 9],
    next_mover: GameRole,
    outcome: Option<Outcome>,
}

impl TicTacToe {
    pub fn new() -> Self {
        Self {
            board: [None; 9],
            next_mover: GameRole::First,
            outcome: None,
        }
    }

    /// Recompute the outcome after a move: a completed line wins, a full
    /// board with no line is a draw.
    fn evaluate(&mut self) {
        for line in &LINES {
            if let Some(role) = self.board[line[0]] {
                if self.board[line[1]] == Some(role) && self.board[line[2]] == Some(role) {
                    self.outcome = Some(Outcome::Win(role));
                    return;
                }
            }
        }
        if self.board.iter().all(Option::is_some) {
            self.outcome = Some(Outcome::Draw);
        }
    }

    fn cell_mark(&self, cell: usize) -> char {
        match self.board[cell] {
            Some(role) => role.mark(),
            None => ' ',
        }
    }
}

impl Default for TicTacToe {
    fn default() -> Self {
        Self::new()
    }
}

impl Game for TicTacToe {
    fn parse_move(&self, role: GameRole, text: &str) -> Result<GameMove, GameError> {
        let mut chars = text.chars();
        let digit = chars
            .next()
            .and_then(|c| c.to_digit(10))
            .filter(|d| (1..=9).contains(d))
            .ok_or_else(|| GameError::Malformed(text.to_string()))?;

        // Optional "<-X" / "<-O" suffix asserting the mover's mark.
        let suffix: String = chars.collect();
        match suffix.as_str() {
            "" => {}
            "<-X" | "<-O" => {
                let asserted = suffix.chars().last();
                if asserted != Some(role.mark()) {
                    return Err(GameError::WrongMark);
                }
            }
            _ => return Err(GameError::Malformed(text.to_string())),
        }

        if role != self.next_mover {
            return Err(GameError::NotYourTurn);
        }

        Ok(GameMove {
            role,
            cell: (digit - 1) as u8,
        })
    }

    fn apply_move(&mut self, mv: GameMove) -> Result<(), GameError> {
        if self.outcome.is_some() {
            return Err(GameError::GameOver);
        }
        if mv.role != self.next_mover {
            return Err(GameError::NotYourTurn);
        }
        let cell = mv.cell as usize;
        if cell >= 9 {
            return Err(GameError::Malformed(format!("cell {}", mv.cell)));
        }
        if self.board[cell].is_some() {
            return Err(GameError::CellOccupied);
        }

        self.board[cell] = Some(mv.role);
        self.evaluate();
        self.next_mover = self.next_mover.opponent();
        Ok(())
    }

    fn resign(&mut self, role: GameRole) -> Result<(), GameError> {
        if self.outcome.is_some() {
            return Err(GameError::GameOver);
        }
        self.outcome = Some(Outcome::Win(role.opponent()));
        Ok(())
    }

    fn is_over(&self) -> bool {
        self.outcome.is_some()
    }

    fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    /// Renders the fixed 40-character board text, e.g. for a fresh game:
    ///
    /// ```text
    ///  | |
    /// -----
    ///  | |
    /// -----
    ///  | |
    /// X to move
    /// ```
    fn render(&self) -> String {
        let mut out = String::with_capacity(40);
        for row in 0..3 {
            for col in 0..3 {
                out.push(self.cell_mark(row * 3 + col));
                if col < 2 {
                    out.push('|');
                }
            }
            out.push('\n');
            if row < 2 {
                out.push_str("-----\n");
            }
        }
        out.push(self.next_mover.mark());
        out.push_str(" to move\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play(game: &mut TicTacToe, role: GameRole, text: &str) {
        let mv = game.parse_move(role, text).unwrap();
        game.apply_move(mv).unwrap();
    }

    #[test]
    fn test_initial_render() {
        let game = TicTacToe::new();
        let state = game.render();
        assert_eq!(state, " | | \n-----\n | | \n-----\n | | \nX to move\n");
        assert_eq!(state.len(), 40);
    }

    #[test]
    fn test_render_after_moves() {
        let mut game = TicTacToe::new();
        play(&mut game, GameRole::First, "1");
        play(&mut game, GameRole::Second, "5");
        assert_eq!(game.render(), "X| | \n-----\n |O| \n-----\n | | \nX to move\n");
    }

    #[test]
    fn test_parse_plain_and_suffixed_forms() {
        let game = TicTacToe::new();
        let plain = game.parse_move(GameRole::First, "5").unwrap();
        let suffixed = game.parse_move(GameRole::First, "5<-X").unwrap();
        assert_eq!(plain, suffixed);
        assert_eq!(plain.cell, 4);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let game = TicTacToe::new();
        for text in ["", "0", "a", "10", "5<-", "5<-Z", "5 <-X"] {
            assert!(
                game.parse_move(GameRole::First, text).is_err(),
                "`{}` should not parse",
                text
            );
        }
    }

    #[test]
    fn test_parse_rejects_wrong_mark() {
        let game = TicTacToe::new();
        assert_eq!(
            game.parse_move(GameRole::First, "5<-O"),
            Err(GameError::WrongMark)
        );
    }

    #[test]
    fn test_parse_enforces_turn_order() {
        let game = TicTacToe::new();
        assert_eq!(
            game.parse_move(GameRole::Second, "1"),
            Err(GameError::NotYourTurn)
        );
    }

    #[test]
    fn test_apply_rejects_occupied_cell() {
        let mut game = TicTacToe::new();
        play(&mut game, GameRole::First, "5");
        let mv = GameMove {
            role: GameRole::Second,
            cell: 4,
        };
        assert_eq!(game.apply_move(mv), Err(GameError::CellOccupied));
    }

    #[test]
    fn test_row_win() {
        let mut game = TicTacToe::new();
        for (role, text) in [
            (GameRole::First, "1"),
            (GameRole::Second, "4"),
            (GameRole::First, "2"),
            (GameRole::Second, "5"),
            (GameRole::First, "3"),
        ] {
            play(&mut game, role, text);
        }
        assert!(game.is_over());
        assert_eq!(game.outcome(), Some(Outcome::Win(GameRole::First)));
        assert_eq!(game.outcome().unwrap().code(), 1);
    }

    #[test]
    fn test_column_and_diagonal_wins() {
        // Column 1-4-7 for O.
        let mut game = TicTacToe::new();
        for (role, text) in [
            (GameRole::First, "2"),
            (GameRole::Second, "1"),
            (GameRole::First, "3"),
            (GameRole::Second, "4"),
            (GameRole::First, "5"),
            (GameRole::Second, "7"),
        ] {
            play(&mut game, role, text);
        }
        assert_eq!(game.outcome(), Some(Outcome::Win(GameRole::Second)));

        // Diagonal 1-5-9 for X.
        let mut game = TicTacToe::new();
        for (role, text) in [
            (GameRole::First, "1"),
            (GameRole::Second, "2"),
            (GameRole::First, "5"),
            (GameRole::Second, "3"),
            (GameRole::First, "9"),
        ] {
            play(&mut game, role, text);
        }
        assert_eq!(game.outcome(), Some(Outcome::Win(GameRole::First)));
    }

    #[test]
    fn test_full_board_without_line_is_draw() {
        // X X O / O O X / X O X
        let mut game = TicTacToe::new();
        for (role, text) in [
            (GameRole::First, "1"),
            (GameRole::Second, "3"),
            (GameRole::First, "2"),
            (GameRole::Second, "4"),
            (GameRole::First, "6"),
            (GameRole::Second, "5"),
            (GameRole::First, "7"),
            (GameRole::Second, "8"),
            (GameRole::First, "9"),
        ] {
            play(&mut game, role, text);
        }
        assert_eq!(game.outcome(), Some(Outcome::Draw));
        assert_eq!(game.outcome().unwrap().code(), 0);
    }

    #[test]
    fn test_no_moves_after_game_over() {
        let mut game = TicTacToe::new();
        for (role, text) in [
            (GameRole::First, "1"),
            (GameRole::Second, "4"),
            (GameRole::First, "2"),
            (GameRole::Second, "5"),
            (GameRole::First, "3"),
        ] {
            play(&mut game, role, text);
        }
        let mv = GameMove {
            role: GameRole::Second,
            cell: 8,
        };
        assert_eq!(game.apply_move(mv), Err(GameError::GameOver));
    }

    #[test]
    fn test_resignation_awards_opponent() {
        let mut game = TicTacToe::new();
        play(&mut game, GameRole::First, "1");
        game.resign(GameRole::Second).unwrap();
        assert_eq!(game.outcome(), Some(Outcome::Win(GameRole::First)));

        let mut game = TicTacToe::new();
        game.resign(GameRole::First).unwrap();
        assert_eq!(game.outcome(), Some(Outcome::Win(GameRole::Second)));
        assert_eq!(game.resign(GameRole::Second), Err(GameError::GameOver));
    }

    #[test]
    fn test_role_helpers() {
        assert_eq!(GameRole::First.opponent(), GameRole::Second);
        assert_eq!(GameRole::Second.opponent(), GameRole::First);
        assert_eq!(GameRole::from_code(0), None);
        assert_eq!(GameRole::from_code(1), Some(GameRole::First));
        assert_eq!(GameRole::from_code(2), Some(GameRole::Second));
        assert_eq!(GameRole::from_code(3), None);
        assert_eq!(GameRole::First.code(), 1);
        assert_eq!(GameRole::Second.mark(), 'O');
    }
}

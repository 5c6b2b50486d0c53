//! Board model - 5x5 grid of pieces

use serde::{Deserialize, Serialize};

/// Side length of the board
pub const BOARD_SIZE: usize = 5;

/// Player slot within a game
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Player {
    PlayerA,
    PlayerB,
}

impl Player {
    /// The opponent of this player
    pub fn other(self) -> Self {
        match self {
            Self::PlayerA => Self::PlayerB,
            Self::PlayerB => Self::PlayerA,
        }
    }
}

impl std::fmt::Display for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PlayerA => f.write_str("PlayerA"),
            Self::PlayerB => f.write_str("PlayerB"),
        }
    }
}

/// Piece kinds available in the game
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PieceKind {
    /// Single step in any direction
    Pawn,
    /// Orthogonal jump of two
    Hero1,
    /// Diagonal jump of two
    Hero2,
    /// Knight-like jump
    Hero3,
}

/// A piece on the board. Pieces are never mutated, only relocated or captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Piece {
    pub owner: Player,
    pub kind: PieceKind,
    /// Distinguishes pieces of the same owner and kind
    pub instance: u8,
}

impl Piece {
    pub const fn new(owner: Player, kind: PieceKind, instance: u8) -> Self {
        Self {
            owner,
            kind,
            instance,
        }
    }
}

/// Board coordinate. Signed so that out-of-range client input stays representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coord {
    pub row: i32,
    pub col: i32,
}

impl Coord {
    pub const fn new(row: i32, col: i32) -> Self {
        Self { row, col }
    }

    fn index(self) -> Option<(usize, usize)> {
        if Board::is_in_bounds(self) {
            Some((self.row as usize, self.col as usize))
        } else {
            None
        }
    }
}

/// The 5x5 grid of cell contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Board {
    cells: [[Option<Piece>; BOARD_SIZE]; BOARD_SIZE],
}

impl Board {
    /// A board with no pieces
    pub fn empty() -> Self {
        Self {
            cells: [[None; BOARD_SIZE]; BOARD_SIZE],
        }
    }

    /// The opening position: each side's back rank is Pawn, Hero1, Hero2, Hero3, Pawn
    pub fn opening() -> Self {
        let mut board = Self::empty();
        for (player, row) in [(Player::PlayerA, 0), (Player::PlayerB, 4)] {
            let rank = [
                Piece::new(player, PieceKind::Pawn, 1),
                Piece::new(player, PieceKind::Hero1, 1),
                Piece::new(player, PieceKind::Hero2, 1),
                Piece::new(player, PieceKind::Hero3, 1),
                Piece::new(player, PieceKind::Pawn, 2),
            ];
            for (col, piece) in rank.into_iter().enumerate() {
                board.cells[row][col] = Some(piece);
            }
        }
        board
    }

    pub fn is_in_bounds(at: Coord) -> bool {
        (0..BOARD_SIZE as i32).contains(&at.row) && (0..BOARD_SIZE as i32).contains(&at.col)
    }

    /// Piece at a cell; `None` for empty or out-of-bounds cells
    pub fn get(&self, at: Coord) -> Option<Piece> {
        let (row, col) = at.index()?;
        self.cells[row][col]
    }

    /// Put `piece` at `at`, clearing its prior cell. Returns the captured occupant.
    ///
    /// Out-of-bounds targets leave the board untouched.
    pub fn place(&mut self, at: Coord, piece: Piece) -> Option<Piece> {
        let (row, col) = at.index()?;
        if let Some(prior) = self.find(piece) {
            if prior == at {
                return None;
            }
            if let Some((prior_row, prior_col)) = prior.index() {
                self.cells[prior_row][prior_col] = None;
            }
        }
        self.cells[row][col].replace(piece)
    }

    /// Location of a piece, if it is on the board
    pub fn find(&self, piece: Piece) -> Option<Coord> {
        self.pieces()
            .find(|(_, candidate)| *candidate == piece)
            .map(|(at, _)| at)
    }

    /// All occupied cells in row-major order
    pub fn pieces(&self) -> impl Iterator<Item = (Coord, Piece)> + '_ {
        self.cells.iter().enumerate().flat_map(|(row, cells)| {
            cells.iter().enumerate().filter_map(move |(col, cell)| {
                cell.map(|piece| (Coord::new(row as i32, col as i32), piece))
            })
        })
    }
}

impl Default for Board {
    fn default() -> Self {
        Self::opening()
    }
}

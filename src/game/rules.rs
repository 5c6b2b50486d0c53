//! Move rules - per-piece movement geometry and legality

use super::board::{Board, Coord, PieceKind, Player, BOARD_SIZE};

/// Decide whether `mover` may move the piece at `from` to `to`.
///
/// Total over all inputs: out-of-range coordinates are simply illegal.
/// Jumps are never blocked by intervening pieces.
pub fn is_legal(board: &Board, mover: Player, from: Coord, to: Coord) -> bool {
    if !Board::is_in_bounds(to) {
        return false;
    }

    let piece = match board.get(from) {
        Some(piece) if piece.owner == mover => piece,
        _ => return false,
    };

    if board.get(to).is_some_and(|target| target.owner == mover) {
        return false;
    }

    let d_row = (i64::from(to.row) - i64::from(from.row)).abs();
    let d_col = (i64::from(to.col) - i64::from(from.col)).abs();
    matches_geometry(piece.kind, d_row, d_col)
}

/// Displacement check for a piece kind, on absolute deltas
fn matches_geometry(kind: PieceKind, d_row: i64, d_col: i64) -> bool {
    match kind {
        // Staying in place is not a move
        PieceKind::Pawn => d_row <= 1 && d_col <= 1 && (d_row, d_col) != (0, 0),
        PieceKind::Hero1 => (d_row == 0 && d_col == 2) || (d_col == 0 && d_row == 2),
        PieceKind::Hero2 => d_row == 2 && d_col == 2,
        PieceKind::Hero3 => (d_row == 2 && d_col == 1) || (d_row == 1 && d_col == 2),
    }
}

/// Every in-bounds destination the piece at `from` may legally reach
pub fn legal_targets(board: &Board, mover: Player, from: Coord) -> Vec<Coord> {
    let size = BOARD_SIZE as i32;
    (0..size)
        .flat_map(|row| (0..size).map(move |col| Coord::new(row, col)))
        .filter(|to| is_legal(board, mover, from, *to))
        .collect()
}

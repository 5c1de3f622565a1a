// src/position.rs
//
// Position oracle for the search. Board representation, move generation and
// legality come from the `chess` crate; this wrapper adds the state the
// search needs on top of it: a copy-make do/undo stack, the rule-50 counter,
// repetition detection over the zobrist history, static exchange evaluation
// and a handful of derived keys for the history tables.

use std::str::FromStr;

use chess::{
    get_bishop_moves, get_king_moves, get_knight_moves, get_pawn_attacks, get_rook_moves, BitBoard,
    Board, ChessMove, Color, MoveGen, Piece, Square, EMPTY,
};

use crate::types::{piece_value_mg, Move16, Value};

/// One saved frame of the copy-make stack.
#[derive(Clone)]
struct Undo {
    board: Board,
    rule50: u32,
    captured: Option<Piece>,
}

#[derive(Clone, Copy)]
struct HistEntry {
    key: u64,
}

#[derive(Clone)]
pub struct Position {
    board: Board,
    rule50: u32,
    game_ply: u32,
    captured: Option<Piece>,
    stack: Vec<Undo>,
    /// Zobrist keys of every position from the game start up to and
    /// including the current one.
    hist: Vec<HistEntry>,
}

/// Dense piece index used by the history tables: 0..=5 white pawn..king,
/// 6..=11 black pawn..king.
#[inline]
pub fn piece_idx(color: Color, piece: Piece) -> usize {
    color.to_index() * 6 + piece.to_index()
}

pub const PIECE_IDX_NB: usize = 12;

#[inline]
fn mix64(mut x: u64) -> u64 {
    // splitmix64 finalizer
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

impl Position {
    pub fn startpos() -> Position {
        let board = Board::default();
        let key = board.get_hash();
        Position {
            board,
            rule50: 0,
            game_ply: 0,
            captured: None,
            stack: Vec::with_capacity(256),
            hist: vec![HistEntry { key }],
        }
    }

    /// Builds a position from a FEN string. The `chess` crate discards the
    /// halfmove clock and the move number, so those two fields are parsed
    /// here.
    pub fn from_fen(fen: &str) -> Option<Position> {
        let board = Board::from_str(fen).ok()?;
        let mut fields = fen.split_whitespace().skip(4);
        let rule50 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        let fullmove: u32 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(1);
        let game_ply =
            2 * fullmove.saturating_sub(1) + (board.side_to_move() == Color::Black) as u32;
        let key = board.get_hash();
        Some(Position {
            board,
            rule50,
            game_ply,
            captured: None,
            stack: Vec::with_capacity(256),
            hist: vec![HistEntry { key }],
        })
    }

    #[inline]
    pub fn board(&self) -> &Board {
        &self.board
    }

    #[inline]
    pub fn side_to_move(&self) -> Color {
        self.board.side_to_move()
    }

    #[inline]
    pub fn key(&self) -> u64 {
        self.board.get_hash()
    }

    #[inline]
    pub fn key_after(&self, m: ChessMove) -> u64 {
        self.board.make_move_new(m).get_hash()
    }

    #[inline]
    pub fn rule50_count(&self) -> u32 {
        self.rule50
    }

    #[inline]
    pub fn game_ply(&self) -> u32 {
        self.game_ply
    }

    #[inline]
    pub fn checkers(&self) -> BitBoard {
        *self.board.checkers()
    }

    #[inline]
    pub fn in_check(&self) -> bool {
        *self.board.checkers() != EMPTY
    }

    #[inline]
    pub fn piece_on(&self, sq: Square) -> Option<Piece> {
        self.board.piece_on(sq)
    }

    #[inline]
    pub fn color_on(&self, sq: Square) -> Option<Color> {
        self.board.color_on(sq)
    }

    /// The piece that `m` would move, which is defined for every move of the
    /// current position.
    #[inline]
    pub fn moved_piece(&self, m: ChessMove) -> Piece {
        self.board.piece_on(m.get_source()).unwrap_or(Piece::Pawn)
    }

    /// The piece captured by the previous `do_move`, if any.
    #[inline]
    pub fn captured_piece(&self) -> Option<Piece> {
        self.captured
    }

    #[inline]
    pub fn piece_count(&self) -> u32 {
        self.board.combined().popcnt()
    }

    pub fn non_pawn_material(&self, color: Color) -> Value {
        let us = *self.board.color_combined(color);
        let mut v = 0;
        for piece in [Piece::Knight, Piece::Bishop, Piece::Rook, Piece::Queen] {
            v += piece_value_mg(piece) * (*self.board.pieces(piece) & us).popcnt() as Value;
        }
        v
    }

    /// The board crate only plays standard chess.
    #[inline]
    pub fn is_chess960(&self) -> bool {
        false
    }

    pub fn can_castle_any(&self) -> bool {
        self.board.castle_rights(Color::White) != chess::CastleRights::NoRights
            || self.board.castle_rights(Color::Black) != chess::CastleRights::NoRights
    }

    /// True for captures, including en passant.
    pub fn is_capture(&self, m: ChessMove) -> bool {
        if self.board.piece_on(m.get_dest()).is_some() {
            return true;
        }
        // en passant: a pawn moving diagonally onto an empty square
        self.board.piece_on(m.get_source()) == Some(Piece::Pawn)
            && m.get_source().get_file() != m.get_dest().get_file()
    }

    /// Captures plus queen promotions: the move class the capture stages of
    /// the move picker generate.
    #[inline]
    pub fn capture_stage(&self, m: ChessMove) -> bool {
        self.is_capture(m) || m.get_promotion() == Some(Piece::Queen)
    }

    /// Value of the piece standing on the destination square (the en
    /// passant victim counts as a pawn).
    pub fn capture_value(&self, m: ChessMove) -> Value {
        match self.board.piece_on(m.get_dest()) {
            Some(p) => crate::types::piece_value_eg(p),
            None if self.is_capture(m) => crate::types::piece_value_eg(Piece::Pawn),
            None => 0,
        }
    }

    pub fn captured_type(&self, m: ChessMove) -> Piece {
        match self.board.piece_on(m.get_dest()) {
            Some(p) => p,
            None => Piece::Pawn,
        }
    }

    #[inline]
    pub fn legal(&self, m: ChessMove) -> bool {
        self.board.legal(m)
    }

    pub fn gives_check(&self, m: ChessMove) -> bool {
        *self.board.make_move_new(m).checkers() != EMPTY
    }

    pub fn legal_moves(&self) -> Vec<ChessMove> {
        MoveGen::new_legal(&self.board).collect()
    }

    pub fn has_legal_moves(&self) -> bool {
        MoveGen::new_legal(&self.board).next().is_some()
    }

    /// Resolves a 16-bit TT move against the current position, returning
    /// the legal move it denotes, if any. Corrupted entries fall out here.
    pub fn resolve_move16(&self, m16: Move16) -> Option<ChessMove> {
        let m = m16.decode()?;
        if self.board.legal(m) {
            Some(m)
        } else {
            None
        }
    }

    pub fn do_move(&mut self, m: ChessMove) {
        let captured = if self.is_capture(m) {
            Some(self.captured_type(m))
        } else {
            None
        };
        let zeroing = captured.is_some() || self.moved_piece(m) == Piece::Pawn;
        self.stack.push(Undo {
            board: self.board,
            rule50: self.rule50,
            captured: self.captured,
        });
        self.board = self.board.make_move_new(m);
        self.captured = captured;
        self.rule50 = if zeroing { 0 } else { self.rule50 + 1 };
        self.game_ply += 1;
        self.hist.push(HistEntry { key: self.board.get_hash() });
    }

    pub fn undo_move(&mut self) {
        let undo = self.stack.pop().expect("undo without matching do");
        self.board = undo.board;
        self.rule50 = undo.rule50;
        self.captured = undo.captured;
        self.game_ply -= 1;
        self.hist.pop();
    }

    /// Passes the move to the opponent. Only valid when not in check.
    pub fn do_null_move(&mut self) {
        debug_assert!(!self.in_check());
        self.stack.push(Undo {
            board: self.board,
            rule50: self.rule50,
            captured: self.captured,
        });
        self.board = self.board.null_move().expect("null move while in check");
        self.captured = None;
        self.rule50 += 1;
        self.game_ply += 1;
        self.hist.push(HistEntry { key: self.board.get_hash() });
    }

    pub fn undo_null_move(&mut self) {
        self.undo_move();
    }

    /// Draw by the 50-move rule or by repetition. A single repetition whose
    /// earlier occurrence lies inside the search tree (distance < `ply`)
    /// already scores as a draw; repetitions against the pre-root game
    /// history need a second occurrence.
    pub fn is_draw(&self, ply: i32) -> bool {
        if self.rule50 >= 100 && (!self.in_check() || self.has_legal_moves()) {
            return true;
        }
        let n = self.hist.len();
        let window = (self.rule50 as usize).min(n - 1);
        if window < 4 {
            return false;
        }
        let cur = self.hist[n - 1].key;
        let mut reps = 0;
        let mut d = 4;
        while d <= window {
            if self.hist[n - 1 - d].key == cur {
                if (d as i32) < ply {
                    return true;
                }
                reps += 1;
                if reps == 2 {
                    return true;
                }
            }
            d += 2;
        }
        false
    }

    /// Whether the side to move has a reversible move that completes a
    /// repetition of a position seen within the rule-50 window. Callers
    /// gate this behind `rule50 >= 3` and a below-draw alpha, so the legal
    /// move scan stays off the hot path.
    pub fn upcoming_repetition(&self, _ply: i32) -> bool {
        if self.rule50 < 3 {
            return false;
        }
        let n = self.hist.len();
        let window = (self.rule50 as usize).min(n - 1);
        if window < 3 {
            return false;
        }
        for m in MoveGen::new_legal(&self.board) {
            if self.is_capture(m) || self.moved_piece(m) == Piece::Pawn {
                continue;
            }
            let key = self.key_after(m);
            let mut d = 3;
            while d <= window {
                if self.hist[n - 1 - d].key == key {
                    return true;
                }
                d += 2;
            }
        }
        false
    }

    /// All pieces of either colour attacking `sq` given `occupied`.
    fn attackers_to(&self, sq: Square, occupied: BitBoard) -> BitBoard {
        let b = &self.board;
        let rooks = *b.pieces(Piece::Rook) | *b.pieces(Piece::Queen);
        let bishops = *b.pieces(Piece::Bishop) | *b.pieces(Piece::Queen);
        let white = *b.color_combined(Color::White);
        let black = *b.color_combined(Color::Black);
        (get_rook_moves(sq, occupied) & rooks)
            | (get_bishop_moves(sq, occupied) & bishops)
            | (get_knight_moves(sq) & *b.pieces(Piece::Knight))
            | (get_king_moves(sq) & *b.pieces(Piece::King))
            | (get_pawn_attacks(sq, Color::White, *b.pieces(Piece::Pawn) & black))
            | (get_pawn_attacks(sq, Color::Black, *b.pieces(Piece::Pawn) & white))
    }

    /// Static exchange evaluation: true if the swap-off on the destination
    /// square of `m` does not lose more than `threshold`.
    pub fn see_ge(&self, m: ChessMove, threshold: Value) -> bool {
        // Castling never loses material; promotions are approximated by
        // their capture value like any other move.
        if self.moved_piece(m) == Piece::King
            && (m.get_source().get_file().to_index() as i32
                - m.get_dest().get_file().to_index() as i32)
                .abs()
                > 1
        {
            return threshold <= 0;
        }

        let from = m.get_source();
        let to = m.get_dest();

        let mut swap = self.capture_value_mg(m) - threshold;
        if swap < 0 {
            return false;
        }

        swap = piece_value_mg(self.moved_piece(m)) - swap;
        if swap <= 0 {
            return true;
        }

        let b = &self.board;
        let mut occupied =
            *b.combined() ^ BitBoard::from_square(from) | BitBoard::from_square(to);
        let mut stm = self.side_to_move();
        let mut attackers = self.attackers_to(to, occupied) & occupied;
        let mut res = true;

        loop {
            stm = !stm;
            attackers &= occupied;
            let stm_attackers = attackers & *b.color_combined(stm);
            if stm_attackers == EMPTY {
                break;
            }
            res = !res;

            // Pick the least valuable attacker and remove it from the board
            let mut next_value = 0;
            let mut picked = EMPTY;
            for piece in [
                Piece::Pawn,
                Piece::Knight,
                Piece::Bishop,
                Piece::Rook,
                Piece::Queen,
                Piece::King,
            ] {
                let candidates = stm_attackers & *b.pieces(piece);
                if candidates != EMPTY {
                    next_value = piece_value_mg(piece);
                    picked = BitBoard::from_square(candidates.to_square());
                    if piece == Piece::King {
                        // The king can only capture if no defenders remain
                        return if attackers & *b.color_combined(!stm) & occupied != EMPTY {
                            !res
                        } else {
                            res
                        };
                    }
                    break;
                }
            }

            swap = next_value - swap;
            if swap < 0 {
                break;
            }
            occupied ^= picked;

            // Reveal x-ray attackers behind the piece that just moved
            attackers |= self.attackers_to(to, occupied) & occupied;
        }
        res
    }

    fn capture_value_mg(&self, m: ChessMove) -> Value {
        match self.board.piece_on(m.get_dest()) {
            Some(p) => piece_value_mg(p),
            None if self.is_capture(m) => piece_value_mg(Piece::Pawn),
            None => 0,
        }
    }

    /// Key of the pawn structure, used to index the pawn history and the
    /// pawn correction history.
    pub fn pawn_key(&self) -> u64 {
        let pawns = self.board.pieces(Piece::Pawn);
        let white = *pawns & *self.board.color_combined(Color::White);
        let black = *pawns & *self.board.color_combined(Color::Black);
        mix64(white.0 ^ mix64(black.0))
    }

    pub fn minor_key(&self) -> u64 {
        let b = &self.board;
        let minors = *b.pieces(Piece::Knight) | *b.pieces(Piece::Bishop) | *b.pieces(Piece::King);
        let white = minors & *b.color_combined(Color::White);
        let black = minors & *b.color_combined(Color::Black);
        mix64(white.0 ^ mix64(black.0).rotate_left(1))
    }

    pub fn major_key(&self) -> u64 {
        let b = &self.board;
        let majors = *b.pieces(Piece::Rook) | *b.pieces(Piece::Queen) | *b.pieces(Piece::King);
        let white = majors & *b.color_combined(Color::White);
        let black = majors & *b.color_combined(Color::Black);
        mix64(white.0 ^ mix64(black.0).rotate_left(2))
    }

    pub fn non_pawn_key(&self, color: Color) -> u64 {
        let b = &self.board;
        let own = *b.color_combined(color);
        let non_pawn = own & !*b.pieces(Piece::Pawn);
        mix64(non_pawn.0 ^ (color.to_index() as u64).wrapping_mul(0x9e3779b97f4a7c15))
    }

    pub fn perft(&self, depth: u32) -> u64 {
        fn walk(board: &Board, depth: u32) -> u64 {
            if depth == 0 {
                return 1;
            }
            let movegen = MoveGen::new_legal(board);
            if depth == 1 {
                return movegen.len() as u64;
            }
            let mut nodes = 0;
            for m in movegen {
                nodes += walk(&board.make_move_new(m), depth - 1);
            }
            nodes
        }
        walk(&self.board, depth)
    }

    pub fn to_fen(&self) -> String {
        // The board prints the piece placement and side fields; rebuild the
        // two counters this wrapper owns.
        let base = format!("{}", self.board);
        let mut fields: Vec<&str> = base.split_whitespace().collect();
        let rule50 = self.rule50.to_string();
        let fullmove = (1 + self.game_ply / 2).to_string();
        if fields.len() >= 6 {
            fields[4] = &rule50;
            fields[5] = &fullmove;
        }
        fields.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startpos_basics() {
        let pos = Position::startpos();
        assert_eq!(pos.side_to_move(), Color::White);
        assert_eq!(pos.rule50_count(), 0);
        assert_eq!(pos.piece_count(), 32);
        assert_eq!(pos.legal_moves().len(), 20);
        assert!(!pos.in_check());
        assert!(pos.can_castle_any());
    }

    #[test]
    fn fen_counters_parsed() {
        let pos = Position::from_fen("8/8/8/8/8/5k2/8/4K2R w K - 13 37").unwrap();
        assert_eq!(pos.rule50_count(), 13);
        assert_eq!(pos.game_ply(), 72);
    }

    #[test]
    fn do_undo_restores_state() {
        let mut pos = Position::startpos();
        let key = pos.key();
        let m = ChessMove::new(Square::E2, Square::E4, None);
        pos.do_move(m);
        assert_ne!(pos.key(), key);
        assert_eq!(pos.rule50_count(), 0);
        pos.undo_move();
        assert_eq!(pos.key(), key);
        assert_eq!(pos.rule50_count(), 0);
        assert_eq!(pos.game_ply(), 0);
    }

    #[test]
    fn repetition_detected() {
        let mut pos = Position::startpos();
        let seq = [
            ChessMove::new(Square::G1, Square::F3, None),
            ChessMove::new(Square::G8, Square::F6, None),
            ChessMove::new(Square::F3, Square::G1, None),
            ChessMove::new(Square::F6, Square::G8, None),
        ];
        // two full shuffles reach the start position for the third time
        for _ in 0..2 {
            for m in seq {
                pos.do_move(m);
            }
        }
        assert!(pos.is_draw(0));
        // inside a search tree a single recurrence is enough
        let mut pos = Position::startpos();
        for m in seq {
            pos.do_move(m);
        }
        assert!(pos.is_draw(6));
        assert!(!pos.is_draw(0));
    }

    #[test]
    fn see_simple_exchanges() {
        // Pawn takes defended pawn: losing for threshold 0 only if the
        // recapture outweighs the gain; here exd5 wins a clean pawn.
        let pos =
            Position::from_fen("rnbqkbnr/ppp1pppp/8/3p4/4P3/8/PPPP1PPP/RNBQKBNR w KQkq - 0 2")
                .unwrap();
        let exd5 = ChessMove::new(Square::E4, Square::D5, None);
        assert!(pos.see_ge(exd5, 0));

        // Queen takes a defended pawn loses material.
        let pos =
            Position::from_fen("rnbqkbnr/ppp1pppp/8/3p4/8/3Q4/PPPPPPPP/RNB1KBNR w KQkq - 0 2")
                .unwrap();
        let qxd5 = ChessMove::new(Square::D3, Square::D5, None);
        assert!(!pos.see_ge(qxd5, 0));
        assert!(pos.see_ge(qxd5, -2000));
    }

    #[test]
    fn gives_check_and_captures() {
        let pos =
            Position::from_fen("rnbqkbnr/ppppp2p/5p2/6p1/8/4P3/PPPP1PPP/RNBQKBNR w KQkq - 0 3")
                .unwrap();
        let qh5 = ChessMove::new(Square::D1, Square::H5, None);
        assert!(pos.gives_check(qh5));
        assert!(!pos.is_capture(qh5));
    }

    #[test]
    fn perft_startpos() {
        let pos = Position::startpos();
        assert_eq!(pos.perft(1), 20);
        assert_eq!(pos.perft(2), 400);
        assert_eq!(pos.perft(3), 8902);
    }
}

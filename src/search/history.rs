// src/search/history.rs
//
// Statistical tables used for move ordering, reductions and static-eval
// correction. Every counter is a saturated signed value updated with the
// gravity rule, which keeps |entry| <= limit without explicit clamping of
// the running value. All tables are private to their worker.

use chess::{ChessMove, Color};

use crate::position::{piece_idx, Position, PIECE_IDX_NB};
use crate::types::Move16;

pub const LOW_PLY_HISTORY_SIZE: usize = 5;
pub const PAWN_HISTORY_SIZE: usize = 512;
pub const CORRECTION_HISTORY_SIZE: usize = 16384;

/// Piece slot count for continuation tables: the dense piece index plus one
/// sentinel slot used by null moves and the pre-root stack frames.
pub const CONT_PIECE_NB: usize = PIECE_IDX_NB + 1;
pub const NO_PIECE_IDX: usize = PIECE_IDX_NB;

/// The single write idiom for every history counter: move the entry towards
/// the bonus and decay it in proportion, so it saturates at +/- limit.
#[inline]
pub fn gravity(entry: &mut i16, bonus: i32, limit: i32) {
    let bonus = bonus.clamp(-limit, limit);
    let e = *entry as i32;
    *entry = (e + bonus - e * bonus.abs() / limit) as i16;
}

#[inline]
pub fn from_to(m: ChessMove) -> usize {
    m.get_source().to_index() * 64 + m.get_dest().to_index()
}

/// Butterfly table: (side to move, from-to) for quiet moves.
pub struct ButterflyHistory {
    data: Vec<i16>,
    limit: i32,
}

impl ButterflyHistory {
    fn new(limit: i32) -> ButterflyHistory {
        ButterflyHistory { data: vec![0; 2 * 4096], limit }
    }

    #[inline]
    pub fn get(&self, color: Color, m: ChessMove) -> i32 {
        self.data[color.to_index() * 4096 + from_to(m)] as i32
    }

    #[inline]
    pub fn update(&mut self, color: Color, m: ChessMove, bonus: i32) {
        gravity(&mut self.data[color.to_index() * 4096 + from_to(m)], bonus, self.limit);
    }
}

/// From-to table indexed by ply, consulted only close to the root.
pub struct LowPlyHistory {
    data: Vec<i16>,
    limit: i32,
}

impl LowPlyHistory {
    fn new(limit: i32) -> LowPlyHistory {
        LowPlyHistory { data: vec![0; LOW_PLY_HISTORY_SIZE * 4096], limit }
    }

    #[inline]
    pub fn get(&self, ply: usize, m: ChessMove) -> i32 {
        self.data[ply * 4096 + from_to(m)] as i32
    }

    #[inline]
    pub fn update(&mut self, ply: usize, m: ChessMove, bonus: i32) {
        if ply < LOW_PLY_HISTORY_SIZE {
            gravity(&mut self.data[ply * 4096 + from_to(m)], bonus, self.limit);
        }
    }
}

/// Capture ordering table: (moved piece, destination, captured piece type).
pub struct CaptureHistory {
    data: Vec<i16>,
    limit: i32,
}

impl CaptureHistory {
    fn new(limit: i32) -> CaptureHistory {
        CaptureHistory { data: vec![0; PIECE_IDX_NB * 64 * 6], limit }
    }

    #[inline]
    fn slot(piece: usize, to: usize, captured: usize) -> usize {
        (piece * 64 + to) * 6 + captured
    }

    #[inline]
    pub fn get(&self, piece: usize, to: usize, captured: usize) -> i32 {
        self.data[Self::slot(piece, to, captured)] as i32
    }

    #[inline]
    pub fn update(&mut self, piece: usize, to: usize, captured: usize, bonus: i32) {
        gravity(&mut self.data[Self::slot(piece, to, captured)], bonus, self.limit);
    }
}

/// Quiet ordering table keyed by the pawn structure.
pub struct PawnHistory {
    data: Vec<i16>,
    limit: i32,
}

impl PawnHistory {
    fn new(limit: i32) -> PawnHistory {
        PawnHistory { data: vec![0; PAWN_HISTORY_SIZE * PIECE_IDX_NB * 64], limit }
    }

    #[inline]
    pub fn index(pos: &Position) -> usize {
        (pos.pawn_key() as usize) & (PAWN_HISTORY_SIZE - 1)
    }

    #[inline]
    fn slot(key: usize, piece: usize, to: usize) -> usize {
        (key * PIECE_IDX_NB + piece) * 64 + to
    }

    #[inline]
    pub fn get(&self, key: usize, piece: usize, to: usize) -> i32 {
        self.data[Self::slot(key, piece, to)] as i32
    }

    #[inline]
    pub fn update(&mut self, key: usize, piece: usize, to: usize, bonus: i32) {
        gravity(&mut self.data[Self::slot(key, piece, to)], bonus, self.limit);
    }
}

/// Handle to one (piece x to) continuation table, stored on the stack
/// frames instead of a borrowed pointer so frames stay plain data.
pub type ContIndex = usize;

/// Continuation history: outer dimensions (in check, capture, prior piece,
/// prior destination), inner table (piece, destination).
pub struct ContinuationHistory {
    data: Vec<i16>,
    limit: i32,
}

const CONT_INNER: usize = CONT_PIECE_NB * 64;

impl ContinuationHistory {
    fn new(limit: i32) -> ContinuationHistory {
        ContinuationHistory { data: vec![0; 4 * CONT_INNER * CONT_INNER], limit }
    }

    /// Index of the inner table selected by the move just played.
    #[inline]
    pub fn index(in_check: bool, capture: bool, piece: usize, to: usize) -> ContIndex {
        ((((in_check as usize) * 2 + capture as usize) * CONT_PIECE_NB + piece) * 64 + to)
            * CONT_INNER
    }

    /// The sentinel table used below the root and after null moves.
    #[inline]
    pub fn sentinel() -> ContIndex {
        Self::index(false, false, NO_PIECE_IDX, 0)
    }

    #[inline]
    pub fn get(&self, idx: ContIndex, piece: usize, to: usize) -> i32 {
        self.data[idx + piece * 64 + to] as i32
    }

    #[inline]
    pub fn update(&mut self, idx: ContIndex, piece: usize, to: usize, bonus: i32) {
        gravity(&mut self.data[idx + piece * 64 + to], bonus, self.limit);
    }
}

/// Countermove table: the refutation to try after an opponent move
/// described by (piece, destination).
pub struct CounterMoveHistory {
    data: Vec<Move16>,
}

impl CounterMoveHistory {
    fn new() -> CounterMoveHistory {
        CounterMoveHistory { data: vec![Move16::NONE; PIECE_IDX_NB * 64] }
    }

    #[inline]
    pub fn get(&self, piece: usize, to: usize) -> Move16 {
        self.data[piece * 64 + to]
    }

    #[inline]
    pub fn set(&mut self, piece: usize, to: usize, m: ChessMove) {
        self.data[piece * 64 + to] = Move16::encode(m);
    }
}

/// Correction history keyed by a position fingerprint and the side to move.
/// Entries refine the raw static eval.
pub struct CorrectionHistory {
    data: Vec<i16>,
    limit: i32,
}

impl CorrectionHistory {
    fn new(limit: i32) -> CorrectionHistory {
        CorrectionHistory { data: vec![0; CORRECTION_HISTORY_SIZE * 2], limit }
    }

    #[inline]
    fn slot(key: u64, us: Color) -> usize {
        (key as usize & (CORRECTION_HISTORY_SIZE - 1)) * 2 + us.to_index()
    }

    #[inline]
    pub fn get(&self, key: u64, us: Color) -> i32 {
        self.data[Self::slot(key, us)] as i32
    }

    #[inline]
    pub fn update(&mut self, key: u64, us: Color, bonus: i32) {
        gravity(&mut self.data[Self::slot(key, us)], bonus, self.limit);
    }
}

/// Correction history keyed by the previous move pair rather than a
/// position fingerprint: outer (prior piece, prior to), inner (piece, to).
pub struct ContinuationCorrectionHistory {
    data: Vec<i16>,
    limit: i32,
}

impl ContinuationCorrectionHistory {
    fn new(limit: i32) -> ContinuationCorrectionHistory {
        ContinuationCorrectionHistory { data: vec![0; CONT_INNER * CONT_INNER], limit }
    }

    #[inline]
    pub fn index(piece: usize, to: usize) -> ContIndex {
        (piece * 64 + to) * CONT_INNER
    }

    #[inline]
    pub fn sentinel() -> ContIndex {
        Self::index(NO_PIECE_IDX, 0)
    }

    #[inline]
    pub fn get(&self, idx: ContIndex, piece: usize, to: usize) -> i32 {
        self.data[idx + piece * 64 + to] as i32
    }

    #[inline]
    pub fn update(&mut self, idx: ContIndex, piece: usize, to: usize, bonus: i32) {
        gravity(&mut self.data[idx + piece * 64 + to], bonus, self.limit);
    }
}

/// All per-worker statistical state.
pub struct Histories {
    pub main: ButterflyHistory,
    pub low_ply: LowPlyHistory,
    pub capture: CaptureHistory,
    pub pawn: PawnHistory,
    pub cont: ContinuationHistory,
    pub cont_corr: ContinuationCorrectionHistory,
    pub counter_moves: CounterMoveHistory,
    pub corr_pawn: CorrectionHistory,
    pub corr_minor: CorrectionHistory,
    pub corr_major: CorrectionHistory,
    pub corr_non_pawn: [CorrectionHistory; 2],
}

impl Histories {
    pub fn new(params: &super::params::SearchParams) -> Histories {
        Histories {
            main: ButterflyHistory::new(params.main_history_limit),
            low_ply: LowPlyHistory::new(params.low_ply_history_limit),
            capture: CaptureHistory::new(params.capture_history_limit),
            pawn: PawnHistory::new(params.pawn_history_limit),
            cont: ContinuationHistory::new(params.cont_history_limit),
            cont_corr: ContinuationCorrectionHistory::new(params.corr_limit),
            counter_moves: CounterMoveHistory::new(),
            corr_pawn: CorrectionHistory::new(params.corr_limit),
            corr_minor: CorrectionHistory::new(params.corr_limit),
            corr_major: CorrectionHistory::new(params.corr_limit),
            corr_non_pawn: [
                CorrectionHistory::new(params.corr_limit),
                CorrectionHistory::new(params.corr_limit),
            ],
        }
    }

    pub fn clear(&mut self) {
        self.main.data.fill(0);
        self.low_ply.data.fill(0);
        self.capture.data.fill(0);
        self.pawn.data.fill(0);
        self.cont.data.fill(0);
        self.cont_corr.data.fill(0);
        self.counter_moves.data.fill(Move16::NONE);
        self.corr_pawn.data.fill(0);
        self.corr_minor.data.fill(0);
        self.corr_major.data.fill(0);
        self.corr_non_pawn[0].data.fill(0);
        self.corr_non_pawn[1].data.fill(0);
    }

    /// New-search aging: only the low-ply table is position dependent
    /// enough to stale out between moves.
    pub fn new_search(&mut self) {
        self.low_ply.data.fill(0);
    }
}

/// Dense index of the piece moving in `m` for the current position.
#[inline]
pub fn moved_piece_idx(pos: &Position, m: ChessMove) -> usize {
    piece_idx(pos.side_to_move(), pos.moved_piece(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::params::SearchParams;

    #[test]
    fn gravity_saturates() {
        let mut e = 0i16;
        for _ in 0..1000 {
            gravity(&mut e, 7183, 7183);
            assert!(e as i32 <= 7183);
        }
        assert_eq!(e as i32, 7183);
        for _ in 0..1000 {
            gravity(&mut e, -7183, 7183);
            assert!((e as i32) >= -7183);
        }
        assert_eq!(e as i32, -7183);
    }

    #[test]
    fn gravity_stays_within_limit_under_mixed_updates() {
        let mut e = 0i16;
        let mut x: u32 = 12345;
        for _ in 0..10000 {
            x = x.wrapping_mul(1664525).wrapping_add(1013904223);
            let bonus = (x % 4000) as i32 - 2000;
            gravity(&mut e, bonus, 2000);
            assert!((e as i32).abs() <= 2000, "entry escaped: {}", e);
        }
    }

    #[test]
    fn continuation_sentinel_is_stable() {
        let params = SearchParams::default();
        let h = ContinuationHistory::new(params.cont_history_limit);
        let s = ContinuationHistory::sentinel();
        for piece in 0..PIECE_IDX_NB {
            assert_eq!(h.get(s, piece, 0), 0);
        }
    }
}

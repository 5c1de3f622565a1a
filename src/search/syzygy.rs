// src/search/syzygy.rs
//
// Syzygy endgame tablebase probing.
//
// Uses shakmaty-syzygy for the table file access. Probes happen only at low
// piece counts, so the conversion chess::Board -> FEN -> shakmaty::Chess is
// off the hot path by construction.

use chess::ChessMove;
use shakmaty::fen::Fen;
use shakmaty::{CastlingMode, Chess};
use shakmaty_syzygy::{Dtz, Tablebase, Wdl};
use std::path::Path;

use crate::position::Position;
use crate::types::{
    Value, PAWN_VALUE_EG, VALUE_DRAW, VALUE_MATED_IN_MAX_PLY, VALUE_MATE_IN_MAX_PLY,
};

const MAX_DTZ: i32 = 1000;
const RANK_BOUND: i32 = MAX_DTZ - 100;

/// Search-facing probe configuration, assembled from the UCI options.
#[derive(Clone, Debug)]
pub struct TbConfig {
    /// Maximum piece count probed during the search; 0 disables probing.
    pub cardinality: u32,
    /// Minimum remaining depth for probes at the cardinality limit.
    pub probe_depth: i32,
    /// Whether cursed wins / blessed losses count as draws.
    pub use_rule50: bool,
}

impl Default for TbConfig {
    fn default() -> TbConfig {
        TbConfig { cardinality: 0, probe_depth: 1, use_rule50: true }
    }
}

pub struct SyzygyTb {
    tb: Tablebase<Chess>,
    max_pieces: u32,
}

fn to_shakmaty(pos: &Position) -> Option<Chess> {
    let fen: Fen = pos.to_fen().parse().ok()?;
    fen.into_position(CastlingMode::Standard).ok()
}

impl SyzygyTb {
    pub fn new<P: AsRef<Path>>(path: P) -> anyhow::Result<SyzygyTb> {
        let mut tb = Tablebase::new();
        tb.add_directory(path.as_ref())?;
        let max_pieces = tb.max_pieces() as u32;
        Ok(SyzygyTb { tb, max_pieces })
    }

    #[inline]
    pub fn max_pieces(&self) -> u32 {
        self.max_pieces
    }

    /// WDL from the side to move's view, in -2..=2. `None` means the probe
    /// failed (missing table, castling rights, conversion error); the
    /// search continues without tablebase guidance at that node.
    pub fn probe_wdl(&self, pos: &Position) -> Option<i32> {
        if pos.can_castle_any() || pos.piece_count() > self.max_pieces {
            return None;
        }
        let sh = to_shakmaty(pos)?;
        let wdl = self.tb.probe_wdl_after_zeroing(&sh).ok()?;
        Some(match wdl {
            Wdl::Loss => -2,
            Wdl::BlessedLoss => -1,
            Wdl::Draw => 0,
            Wdl::CursedWin => 1,
            Wdl::Win => 2,
        })
    }

    fn probe_dtz(&self, sh: &Chess) -> Option<i32> {
        let Dtz(plies) = self.tb.probe_dtz(sh).ok()?.ignore_rounding();
        Some(plies)
    }

    /// Ranks the root moves with DTZ tables so the root controller can
    /// restrict the search to preserving moves. Returns false when the
    /// position could not be ranked; ranks are zeroed in that case.
    pub fn rank_root_moves(
        &self,
        pos: &mut Position,
        moves: &[ChessMove],
        ranks: &mut Vec<(i32, Value)>,
    ) -> bool {
        ranks.clear();
        if pos.can_castle_any() || pos.piece_count() > self.max_pieces {
            return false;
        }
        let cnt50 = pos.rule50_count() as i32;
        for &m in moves {
            pos.do_move(m);
            let ranked = (|| {
                let sh = to_shakmaty(pos)?;
                // DTZ of the child is from the opponent's view
                let dtz = -self.probe_dtz(&sh)?;
                let r = if dtz > 0 {
                    if dtz + cnt50 <= 99 && !pos.upcoming_repetition(0) {
                        MAX_DTZ
                    } else {
                        MAX_DTZ - (dtz + cnt50)
                    }
                } else if dtz < 0 {
                    if -dtz + cnt50 <= 99 {
                        -MAX_DTZ
                    } else {
                        -MAX_DTZ + (-dtz + cnt50)
                    }
                } else {
                    0
                };
                let score = if r >= RANK_BOUND {
                    VALUE_MATE_IN_MAX_PLY - 1
                } else if r > 0 {
                    (r - (MAX_DTZ - 200)).max(3) * PAWN_VALUE_EG / 200
                } else if r == 0 {
                    VALUE_DRAW
                } else if r > -RANK_BOUND {
                    (r + (MAX_DTZ - 200)).min(-3) * PAWN_VALUE_EG / 200
                } else {
                    VALUE_MATED_IN_MAX_PLY + 1
                };
                Some((r, score))
            })();
            pos.undo_move();
            match ranked {
                Some(pair) => ranks.push(pair),
                None => {
                    ranks.clear();
                    return false;
                }
            }
        }
        true
    }
}

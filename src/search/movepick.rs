// src/search/movepick.rs
//
// Staged move picker. Moves come out in approximate best-first order: the
// TT move, then winning captures, refutations, quiets sorted by the history
// tables, and finally the losing captures. Quiescence and ProbCut run
// reduced stage sets. Generation is lazy per stage and selection is an
// on-demand partial selection sort.
//
// All yielded moves come from the legal move generator; the caller's
// `pos.legal` filter only matters for moves injected from outside the
// generator (the TT move is validated at construction instead).

use chess::{ChessMove, MoveGen};

use crate::position::Position;
use crate::search::history::{moved_piece_idx, ContIndex, Histories, LOW_PLY_HISTORY_SIZE};
use crate::types::{piece_value_eg, Depth, Value, DEPTH_QS_CHECKS};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Stage {
    TtMove,
    CaptureInit,
    GoodCapture,
    Refutation,
    QuietInit,
    Quiet,
    BadCapture,
    EvasionInit,
    Evasion,
    QsCaptureInit,
    QsCapture,
    QsCheckInit,
    QsCheck,
    ProbCutInit,
    ProbCut,
    Done,
}

#[derive(Clone, Copy)]
struct ScoredMove {
    mv: ChessMove,
    score: i32,
}

/// Everything the scoring functions need from the searcher's stack.
#[derive(Clone, Copy)]
pub struct PickContext {
    /// Continuation tables of plies -1, -2, -3, -4 and -6.
    pub cont: [ContIndex; 5],
    pub ply: usize,
    pub pawn_index: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Main,
    Qsearch,
    ProbCut,
}

pub struct MovePicker {
    stage: Stage,
    mode: Mode,
    tt_move: Option<ChessMove>,
    killers: [Option<ChessMove>; 2],
    counter: Option<ChessMove>,
    refutations: Vec<ChessMove>,
    moves: Vec<ScoredMove>,
    bad_captures: Vec<ScoredMove>,
    cur: usize,
    depth: Depth,
    probcut_threshold: Value,
    skip_quiets: bool,
    ctx: PickContext,
}

impl MovePicker {
    /// Picker for the main search.
    pub fn new(
        pos: &Position,
        tt_move: Option<ChessMove>,
        killers: [Option<ChessMove>; 2],
        counter: Option<ChessMove>,
        depth: Depth,
        ctx: PickContext,
    ) -> MovePicker {
        let stage = if pos.in_check() {
            if tt_move.is_some() { Stage::TtMove } else { Stage::EvasionInit }
        } else if tt_move.is_some() {
            Stage::TtMove
        } else {
            Stage::CaptureInit
        };
        MovePicker {
            stage,
            mode: Mode::Main,
            tt_move,
            killers,
            counter,
            refutations: Vec::new(),
            moves: Vec::with_capacity(48),
            bad_captures: Vec::new(),
            cur: 0,
            depth,
            probcut_threshold: 0,
            skip_quiets: false,
            ctx,
        }
    }

    /// Picker for the quiescence search.
    pub fn new_qsearch(
        pos: &Position,
        tt_move: Option<ChessMove>,
        depth: Depth,
        ctx: PickContext,
    ) -> MovePicker {
        let stage = if tt_move.is_some() {
            Stage::TtMove
        } else if pos.in_check() {
            Stage::EvasionInit
        } else {
            Stage::QsCaptureInit
        };
        let mut picker = MovePicker::new(pos, tt_move, [None, None], None, depth, ctx);
        picker.stage = stage;
        picker.mode = Mode::Qsearch;
        picker
    }

    /// Picker for ProbCut: captures whose SEE clears the threshold.
    pub fn new_probcut(
        _pos: &Position,
        tt_move: Option<ChessMove>,
        threshold: Value,
        ctx: PickContext,
    ) -> MovePicker {
        MovePicker {
            stage: if tt_move.is_some() { Stage::TtMove } else { Stage::ProbCutInit },
            mode: Mode::ProbCut,
            tt_move,
            killers: [None, None],
            counter: None,
            refutations: Vec::new(),
            moves: Vec::with_capacity(16),
            bad_captures: Vec::new(),
            cur: 0,
            depth: 0,
            probcut_threshold: threshold,
            skip_quiets: false,
            ctx,
        }
    }

    /// After a movecount-pruning trigger the remaining quiet stages are
    /// skipped; only captures can still be yielded.
    pub fn skip_quiet_moves(&mut self) {
        self.skip_quiets = true;
    }

    fn is_refutation(&self, m: ChessMove) -> bool {
        self.refutations.contains(&m)
    }

    fn score_capture(&self, pos: &Position, hists: &Histories, m: ChessMove) -> i32 {
        let captured = pos.captured_type(m);
        7 * piece_value_eg(captured)
            + hists.capture.get(
                moved_piece_idx(pos, m),
                m.get_dest().to_index(),
                captured.to_index(),
            )
    }

    fn score_quiet(&self, pos: &Position, hists: &Histories, m: ChessMove) -> i32 {
        let pc = moved_piece_idx(pos, m);
        let to = m.get_dest().to_index();
        let mut score = 2 * hists.main.get(pos.side_to_move(), m);
        score += 2 * hists.cont.get(self.ctx.cont[0], pc, to);
        score += hists.cont.get(self.ctx.cont[1], pc, to);
        score += hists.cont.get(self.ctx.cont[3], pc, to);
        score += hists.cont.get(self.ctx.cont[4], pc, to);
        score += hists.pawn.get(self.ctx.pawn_index, pc, to);
        if self.ctx.ply < LOW_PLY_HISTORY_SIZE {
            score += 2 * hists.low_ply.get(self.ctx.ply, m) / (1 + self.ctx.ply as i32);
        }
        score
    }

    fn score_evasion(&self, pos: &Position, hists: &Histories, m: ChessMove) -> i32 {
        if pos.is_capture(m) {
            piece_value_eg(pos.captured_type(m)) + (1 << 28)
        } else {
            let pc = moved_piece_idx(pos, m);
            let to = m.get_dest().to_index();
            hists.main.get(pos.side_to_move(), m) + hists.cont.get(self.ctx.cont[0], pc, to)
        }
    }

    fn generate_captures(&mut self, pos: &Position, hists: &Histories) {
        self.moves.clear();
        self.cur = 0;
        for m in MoveGen::new_legal(pos.board()) {
            if pos.capture_stage(m) && Some(m) != self.tt_move {
                let score = self.score_capture(pos, hists, m);
                self.moves.push(ScoredMove { mv: m, score });
            }
        }
    }

    fn generate_quiets(&mut self, pos: &Position, hists: &Histories) {
        self.moves.clear();
        self.cur = 0;
        for m in MoveGen::new_legal(pos.board()) {
            if !pos.capture_stage(m) && Some(m) != self.tt_move && !self.is_refutation(m) {
                let score = self.score_quiet(pos, hists, m);
                self.moves.push(ScoredMove { mv: m, score });
            }
        }
    }

    fn generate_evasions(&mut self, pos: &Position, hists: &Histories) {
        self.moves.clear();
        self.cur = 0;
        for m in MoveGen::new_legal(pos.board()) {
            if Some(m) != self.tt_move {
                let score = self.score_evasion(pos, hists, m);
                self.moves.push(ScoredMove { mv: m, score });
            }
        }
    }

    fn generate_quiet_checks(&mut self, pos: &Position) {
        self.moves.clear();
        self.cur = 0;
        for m in MoveGen::new_legal(pos.board()) {
            if !pos.capture_stage(m) && Some(m) != self.tt_move && pos.gives_check(m) {
                self.moves.push(ScoredMove { mv: m, score: 0 });
            }
        }
    }

    /// Selection sort step: yields the best remaining move of the current
    /// list, or None when exhausted.
    fn pick_best(&mut self) -> Option<ScoredMove> {
        if self.cur >= self.moves.len() {
            return None;
        }
        let mut best = self.cur;
        for i in self.cur + 1..self.moves.len() {
            if self.moves[i].score > self.moves[best].score {
                best = i;
            }
        }
        self.moves.swap(self.cur, best);
        let m = self.moves[self.cur];
        self.cur += 1;
        Some(m)
    }

    pub fn next_move(&mut self, pos: &Position, hists: &Histories) -> Option<ChessMove> {
        loop {
            match self.stage {
                Stage::TtMove => {
                    self.stage = match self.mode {
                        Mode::ProbCut => Stage::ProbCutInit,
                        _ if pos.in_check() => Stage::EvasionInit,
                        Mode::Qsearch => Stage::QsCaptureInit,
                        Mode::Main => Stage::CaptureInit,
                    };
                    if let Some(m) = self.tt_move {
                        return Some(m);
                    }
                }

                Stage::CaptureInit => {
                    self.generate_captures(pos, hists);
                    self.stage = Stage::GoodCapture;
                }

                Stage::GoodCapture => match self.pick_best() {
                    Some(sm) => {
                        // Losing captures are deferred to the last stage
                        if pos.see_ge(sm.mv, -sm.score / 16) {
                            return Some(sm.mv);
                        }
                        self.bad_captures.push(sm);
                    }
                    None => {
                        self.refutations.clear();
                        for k in self.killers.into_iter().flatten() {
                            self.refutations.push(k);
                        }
                        if let Some(c) = self.counter {
                            if !self.refutations.contains(&c) {
                                self.refutations.push(c);
                            }
                        }
                        self.cur = 0;
                        self.stage = Stage::Refutation;
                    }
                },

                Stage::Refutation => {
                    while self.cur < self.refutations.len() {
                        let m = self.refutations[self.cur];
                        self.cur += 1;
                        if Some(m) != self.tt_move
                            && !pos.capture_stage(m)
                            && pos.legal(m)
                            && !self.skip_quiets
                        {
                            return Some(m);
                        }
                    }
                    // Drop refutations that were not playable so the quiet
                    // stage exclusion list stays accurate
                    self.refutations.retain(|&m| pos.legal(m) && !pos.capture_stage(m));
                    self.stage = Stage::QuietInit;
                }

                Stage::QuietInit => {
                    if self.skip_quiets {
                        self.cur = 0;
                        self.stage = Stage::BadCapture;
                    } else {
                        self.generate_quiets(pos, hists);
                        self.stage = Stage::Quiet;
                    }
                }

                Stage::Quiet => {
                    if !self.skip_quiets {
                        if let Some(sm) = self.pick_best() {
                            return Some(sm.mv);
                        }
                    }
                    self.cur = 0;
                    self.stage = Stage::BadCapture;
                }

                Stage::BadCapture => {
                    if self.cur < self.bad_captures.len() {
                        let m = self.bad_captures[self.cur].mv;
                        self.cur += 1;
                        return Some(m);
                    }
                    self.stage = Stage::Done;
                }

                Stage::EvasionInit => {
                    self.generate_evasions(pos, hists);
                    self.stage = Stage::Evasion;
                }

                Stage::Evasion => {
                    return self.pick_best().map(|sm| sm.mv);
                }

                Stage::QsCaptureInit => {
                    self.generate_captures(pos, hists);
                    self.stage = Stage::QsCapture;
                }

                Stage::QsCapture => match self.pick_best() {
                    Some(sm) => return Some(sm.mv),
                    None => {
                        if self.depth >= DEPTH_QS_CHECKS {
                            self.stage = Stage::QsCheckInit;
                        } else {
                            self.stage = Stage::Done;
                        }
                    }
                },

                Stage::QsCheckInit => {
                    self.generate_quiet_checks(pos);
                    self.stage = Stage::QsCheck;
                }

                Stage::QsCheck => match self.pick_best() {
                    Some(sm) => return Some(sm.mv),
                    None => self.stage = Stage::Done,
                },

                Stage::ProbCutInit => {
                    self.generate_captures(pos, hists);
                    self.stage = Stage::ProbCut;
                }

                Stage::ProbCut => match self.pick_best() {
                    Some(sm) => {
                        if pos.see_ge(sm.mv, self.probcut_threshold) {
                            return Some(sm.mv);
                        }
                    }
                    None => self.stage = Stage::Done,
                },

                Stage::Done => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::history::{from_to, ContinuationHistory};
    use crate::search::params::SearchParams;

    fn ctx() -> PickContext {
        PickContext {
            cont: [ContinuationHistory::sentinel(); 5],
            ply: 0,
            pawn_index: 0,
        }
    }

    fn drain(picker: &mut MovePicker, pos: &Position, hists: &Histories) -> Vec<ChessMove> {
        let mut out = Vec::new();
        while let Some(m) = picker.next_move(pos, hists) {
            out.push(m);
        }
        out
    }

    #[test]
    fn yields_every_legal_move_exactly_once() {
        let pos = Position::startpos();
        let hists = Histories::new(&SearchParams::default());
        let mut picker = MovePicker::new(&pos, None, [None, None], None, 8, ctx());
        let mut all = drain(&mut picker, &pos, &hists);
        all.sort_by_key(|m| from_to(*m));
        let mut legal = pos.legal_moves();
        legal.sort_by_key(|m| from_to(*m));
        assert_eq!(all, legal);
    }

    #[test]
    fn tt_move_comes_first() {
        let pos = Position::startpos();
        let hists = Histories::new(&SearchParams::default());
        let tt = pos.legal_moves()[7];
        let mut picker = MovePicker::new(&pos, Some(tt), [None, None], None, 8, ctx());
        let all = drain(&mut picker, &pos, &hists);
        assert_eq!(all[0], tt);
        assert_eq!(all.iter().filter(|&&m| m == tt).count(), 1);
        assert_eq!(all.len(), 20);
    }

    #[test]
    fn skip_quiets_yields_no_more_quiets() {
        let pos = Position::from_fen(
            "rnbqkbnr/ppp1pppp/8/3p4/4P3/8/PPPP1PPP/RNBQKBNR w KQkq - 0 2",
        )
        .unwrap();
        let hists = Histories::new(&SearchParams::default());
        let mut picker = MovePicker::new(&pos, None, [None, None], None, 8, ctx());
        picker.skip_quiet_moves();
        let rest = drain(&mut picker, &pos, &hists);
        assert!(!rest.is_empty());
        for m in rest {
            assert!(pos.capture_stage(m), "quiet move {} yielded after skip", m);
        }
    }

    #[test]
    fn qsearch_picker_yields_captures_and_checks_only() {
        let pos = Position::from_fen(
            "rnbqkbnr/ppp1pppp/8/3p4/4P3/8/PPPP1PPP/RNBQKBNR w KQkq - 0 2",
        )
        .unwrap();
        let hists = Histories::new(&SearchParams::default());
        let mut picker = MovePicker::new_qsearch(&pos, None, 0, ctx());
        let all = drain(&mut picker, &pos, &hists);
        assert!(!all.is_empty());
        for m in all {
            assert!(pos.capture_stage(m) || pos.gives_check(m));
        }
    }

    #[test]
    fn evasions_when_in_check() {
        let pos = Position::from_fen("4k3/8/8/8/7b/8/3P4/4K3 w - - 0 1").unwrap();
        assert!(pos.in_check());
        let hists = Histories::new(&SearchParams::default());
        let mut picker = MovePicker::new(&pos, None, [None, None], None, 5, ctx());
        let mut all = drain(&mut picker, &pos, &hists);
        all.sort_by_key(|m| from_to(*m));
        let mut legal = pos.legal_moves();
        legal.sort_by_key(|m| from_to(*m));
        assert_eq!(all, legal);
    }

    #[test]
    fn killers_precede_unscored_quiets() {
        let pos = Position::startpos();
        let hists = Histories::new(&SearchParams::default());
        let killer = ChessMove::new(chess::Square::G1, chess::Square::F3, None);
        let mut picker = MovePicker::new(&pos, None, [Some(killer), None], None, 8, ctx());
        let all = drain(&mut picker, &pos, &hists);
        assert_eq!(all[0], killer);
    }
}

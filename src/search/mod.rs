// src/search/mod.rs
//
// The search core: a recursive negamax with alpha-beta pruning and a large
// family of selective heuristics, plus the iterative deepening driver with
// aspiration windows that each worker thread runs on its own copy of the
// root position. Workers share the transposition table and the cooperative
// stop flags; everything else (histories, stack, root move list) is private.

pub mod history;
pub mod lazy_smp;
pub mod movepick;
pub mod params;
pub mod syzygy;
pub mod time;
pub mod timenet;
pub mod tt;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chess::{ChessMove, Color, Piece, Square};
use rand::Rng;

use crate::evaluate::evaluate;
use crate::position::{piece_idx, Position};
use crate::types::*;

use history::{
    moved_piece_idx, ContIndex, ContinuationCorrectionHistory, ContinuationHistory, Histories,
    PawnHistory, LOW_PLY_HISTORY_SIZE,
};
use lazy_smp::SharedContext;
use movepick::{MovePicker, PickContext};
use params::SearchParams;
use syzygy::{SyzygyTb, TbConfig};
use time::{SearchLimits, TimeManager};
use tt::TranspositionTable;

/// Compile-time node classification. The root has materially different
/// bookkeeping, so it is a type, not a runtime flag.
pub trait NodeSpec {
    const ROOT: bool;
    const PV: bool;
}

pub enum RootNode {}
pub enum PvNode {}
pub enum NonPvNode {}

impl NodeSpec for RootNode {
    const ROOT: bool = true;
    const PV: bool = true;
}

impl NodeSpec for PvNode {
    const ROOT: bool = false;
    const PV: bool = true;
}

impl NodeSpec for NonPvNode {
    const ROOT: bool = false;
    const PV: bool = false;
}

/// The move recorded on a stack frame: distinguishes "no move" (sentinel
/// frames, excluded-move re-searches) from an actual null move.
#[derive(Clone, Copy, PartialEq, Eq)]
enum FrameMove {
    None,
    Null,
    Real(ChessMove),
}

impl FrameMove {
    #[inline]
    fn is_real(self) -> bool {
        matches!(self, FrameMove::Real(_))
    }

    #[inline]
    fn real(self) -> Option<ChessMove> {
        match self {
            FrameMove::Real(m) => Some(m),
            _ => None,
        }
    }
}

/// One ply of search state. The stack is oversized by seven sentinel
/// frames below the root and two above the horizon so that relative
/// accesses from ss-7 to ss+2 are always in bounds.
#[derive(Clone, Copy)]
struct Frame {
    ply: i32,
    current_move: FrameMove,
    excluded_move: Option<ChessMove>,
    killers: [Option<ChessMove>; 2],
    static_eval: Value,
    stat_score: i32,
    move_count: i32,
    in_check: bool,
    tt_pv: bool,
    tt_hit: bool,
    cutoff_cnt: i32,
    cont_idx: ContIndex,
    cont_corr_idx: ContIndex,
    /// Dense index and destination of the piece moved at this frame.
    moved_piece: usize,
    moved_to: usize,
}

impl Frame {
    fn sentinel(ply: i32) -> Frame {
        Frame {
            ply,
            current_move: FrameMove::None,
            excluded_move: None,
            killers: [None, None],
            static_eval: VALUE_NONE,
            stat_score: 0,
            move_count: 0,
            in_check: false,
            tt_pv: false,
            tt_hit: false,
            cutoff_cnt: 0,
            cont_idx: ContinuationHistory::sentinel(),
            cont_corr_idx: ContinuationCorrectionHistory::sentinel(),
            moved_piece: history::NO_PIECE_IDX,
            moved_to: 0,
        }
    }
}

const STACK_OFFSET: usize = 7;

/// One root move and its accumulated statistics across iterations.
#[derive(Clone)]
pub struct RootMove {
    pub pv: Vec<ChessMove>,
    pub score: Value,
    pub previous_score: Value,
    pub average_score: Value,
    pub mean_squared_score: i64,
    pub uci_score: Value,
    pub score_lowerbound: bool,
    pub score_upperbound: bool,
    pub sel_depth: i32,
    pub tb_rank: i32,
    pub tb_score: Value,
    pub effort: u64,
}

impl RootMove {
    pub fn new(m: ChessMove) -> RootMove {
        RootMove {
            pv: vec![m],
            score: -VALUE_INFINITE,
            previous_score: -VALUE_INFINITE,
            average_score: -VALUE_INFINITE,
            mean_squared_score: -(VALUE_INFINITE as i64),
            uci_score: -VALUE_INFINITE,
            score_lowerbound: false,
            score_upperbound: false,
            sel_depth: 0,
            tb_rank: 0,
            tb_score: 0,
            effort: 0,
        }
    }
}

/// Score as reported over the protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UciScore {
    Cp(i32),
    Mate(i32),
}

pub fn uci_score(v: Value) -> UciScore {
    if v.abs() >= VALUE_MATE_IN_MAX_PLY {
        let moves = if v > 0 { (VALUE_MATE - v + 1) / 2 } else { (-VALUE_MATE - v) / 2 };
        UciScore::Mate(moves)
    } else {
        UciScore::Cp(v)
    }
}

/// One full "info" update for the protocol layer.
pub struct InfoFull<'a> {
    pub depth: Depth,
    pub sel_depth: i32,
    pub multipv: usize,
    pub score: UciScore,
    pub lowerbound: bool,
    pub upperbound: bool,
    pub wdl: Option<(i32, i32, i32)>,
    pub nodes: u64,
    pub nps: u64,
    pub hashfull: usize,
    pub tb_hits: u64,
    pub time_ms: u64,
    pub pv: &'a [ChessMove],
}

/// Hooks the protocol layer installs; the core never prints itself.
pub struct SearchCallbacks {
    pub on_update_full: Box<dyn Fn(&InfoFull) + Send + Sync>,
    pub on_iter: Box<dyn Fn(Depth, ChessMove, usize) + Send + Sync>,
    pub on_update_no_moves: Box<dyn Fn(UciScore) + Send + Sync>,
    pub on_bestmove: Box<dyn Fn(Option<ChessMove>, Option<ChessMove>) + Send + Sync>,
}

/// Strength handicap: converts UCI Elo into a fractional level and picks a
/// deliberately sub-optimal root move once per search.
struct Skill {
    level: f64,
    best: Option<ChessMove>,
}

impl Skill {
    fn new(skill_level: i32, uci_elo: i32) -> Skill {
        let level = if uci_elo != 0 {
            let e = (uci_elo - 1320) as f64 / (3190 - 1320) as f64;
            (((37.2473 * e - 40.8525) * e + 22.2943) * e - 0.311438).clamp(0.0, 19.0)
        } else {
            skill_level as f64
        };
        Skill { level, best: None }
    }

    fn enabled(&self) -> bool {
        self.level < 20.0
    }

    fn time_to_pick(&self, depth: Depth) -> bool {
        depth == 1 + self.level as Depth
    }

    fn pick_best(&mut self, root_moves: &[RootMove], multi_pv: usize) -> Option<ChessMove> {
        let mut rng = rand::thread_rng();
        let top_score = root_moves[0].score;
        let delta = (top_score - root_moves[multi_pv - 1].score).min(PAWN_VALUE_MG);
        let weakness = 120.0 - 2.0 * self.level;
        let mut max_score = -VALUE_INFINITE;

        for rm in root_moves.iter().take(multi_pv) {
            let push = ((weakness * (top_score - rm.score) as f64
                + delta as f64 * rng.gen_range(0.0..weakness))
                / 128.0) as Value;
            if rm.score + push >= max_score {
                max_score = rm.score + push;
                self.best = Some(rm.pv[0]);
            }
        }
        self.best
    }
}

fn stat_bonus(params: &SearchParams, d: Depth) -> i32 {
    (params.stat_bonus_mult * d - params.stat_bonus_sub).min(params.stat_bonus_max)
}

fn stat_malus(params: &SearchParams, d: Depth) -> i32 {
    (params.stat_malus_mult * d - params.stat_malus_sub).min(params.stat_malus_max)
}

fn futility_move_count(improving: bool, depth: Depth) -> i32 {
    (3 + depth * depth) / (2 - improving as i32)
}

/// Small noise around the draw score, a function of the node count only,
/// to sidestep threefold blindness.
#[inline]
fn value_draw(nodes: u64) -> Value {
    VALUE_DRAW - 1 + (nodes & 0x2) as Value
}

/// A search worker. One per thread; the first is the main worker and also
/// runs the clock and the protocol updates.
pub struct Worker {
    pub id: usize,
    thread_count: usize,
    params: SearchParams,

    pos: Position,
    hists: Histories,
    stack: Vec<Frame>,
    reductions: Vec<i32>,

    pub root_moves: Vec<RootMove>,
    pub root_depth: Depth,
    pub completed_depth: Depth,
    sel_depth: i32,
    pv_idx: usize,
    pv_last: usize,
    multi_pv: usize,
    root_delta: Value,
    nmp_min_ply: i32,
    optimism: [Value; 2],
    calls_cnt: i64,

    shared: Arc<SharedContext>,
    tt: Arc<TranspositionTable>,
    tb: Option<Arc<SyzygyTb>>,
    tb_config: TbConfig,
    tb_cardinality: u32,
    pub root_in_tb: bool,

    pub limits: SearchLimits,
    tm: TimeManager,
    callbacks: Option<Arc<SearchCallbacks>>,

    skill_level: i32,
    uci_elo: i32,
    show_wdl: bool,

    // Main-worker state that survives between searches
    pub best_previous_score: Value,
    pub best_previous_average_score: Value,
    iter_value: [Value; 4],
    previous_time_reduction: f64,
    best_move_changes: f64,
}

impl Worker {
    pub fn new(
        id: usize,
        thread_count: usize,
        shared: Arc<SharedContext>,
        tt: Arc<TranspositionTable>,
        params: SearchParams,
    ) -> Worker {
        let mut stack = Vec::with_capacity(MAX_PLY + STACK_OFFSET + 3);
        for i in 0..MAX_PLY + STACK_OFFSET + 3 {
            stack.push(Frame::sentinel(i as i32 - STACK_OFFSET as i32));
        }
        let mut reductions = vec![0; MAX_MOVES];
        for (i, r) in reductions.iter_mut().enumerate().skip(1) {
            *r = ((params.lmr_base + (thread_count as f64).ln() * params.lmr_scale)
                * (i as f64).ln()) as i32;
        }
        let hists = Histories::new(&params);
        Worker {
            id,
            thread_count,
            params,
            pos: Position::startpos(),
            hists,
            stack,
            reductions,
            root_moves: Vec::new(),
            root_depth: 0,
            completed_depth: 0,
            sel_depth: 0,
            pv_idx: 0,
            pv_last: 0,
            multi_pv: 1,
            root_delta: 1,
            nmp_min_ply: 0,
            optimism: [0, 0],
            calls_cnt: 0,
            shared,
            tt,
            tb: None,
            tb_config: TbConfig::default(),
            tb_cardinality: 0,
            root_in_tb: false,
            limits: SearchLimits::default(),
            tm: TimeManager::new(
                &mut SearchLimits::default(),
                Color::White,
                0,
                0,
                100,
                0,
                false,
                &mut 0,
                &SearchParams::default(),
            ),
            callbacks: None,
            skill_level: 20,
            uci_elo: 0,
            show_wdl: false,
            best_previous_score: VALUE_INFINITE,
            best_previous_average_score: VALUE_INFINITE,
            iter_value: [0; 4],
            previous_time_reduction: 1.0,
            best_move_changes: 0.0,
        }
    }

    pub fn clear(&mut self) {
        self.hists.clear();
        self.best_previous_score = VALUE_INFINITE;
        self.best_previous_average_score = VALUE_INFINITE;
        self.previous_time_reduction = 1.0;
    }

    /// Installs everything a new search needs. Called by the pool before
    /// the worker threads start.
    #[allow(clippy::too_many_arguments)]
    pub fn prepare(
        &mut self,
        pos: Position,
        root_moves: Vec<RootMove>,
        limits: SearchLimits,
        tm: TimeManager,
        tt: Arc<TranspositionTable>,
        tb: Option<Arc<SyzygyTb>>,
        tb_config: TbConfig,
        root_in_tb: bool,
        multi_pv: usize,
        skill_level: i32,
        uci_elo: i32,
        show_wdl: bool,
        callbacks: Option<Arc<SearchCallbacks>>,
    ) {
        self.pos = pos;
        self.root_moves = root_moves;
        self.limits = limits;
        self.tm = tm;
        self.tt = tt;
        self.tb_cardinality = if tb.is_some() { tb_config.cardinality } else { 0 };
        self.tb = tb;
        self.tb_config = tb_config;
        self.root_in_tb = root_in_tb;
        self.multi_pv = multi_pv;
        self.skill_level = skill_level;
        self.uci_elo = uci_elo;
        self.show_wdl = show_wdl;
        self.callbacks = callbacks;
        self.root_depth = 0;
        self.completed_depth = 0;
        self.nmp_min_ply = 0;
        self.calls_cnt = 0;
        self.best_move_changes = 0.0;
        self.hists.new_search();
        for frame in self.stack.iter_mut() {
            let ply = frame.ply;
            *frame = Frame::sentinel(ply);
        }
    }

    #[inline]
    fn frame(&self, ply: i32) -> &Frame {
        &self.stack[(ply + STACK_OFFSET as i32) as usize]
    }

    #[inline]
    fn frame_mut(&mut self, ply: i32) -> &mut Frame {
        &mut self.stack[(ply + STACK_OFFSET as i32) as usize]
    }

    #[inline]
    fn is_main(&self) -> bool {
        self.id == 0
    }

    #[inline]
    fn nodes_searched(&self) -> u64 {
        self.shared.nodes_searched()
    }

    #[inline]
    fn count_node(&mut self) {
        self.shared.nodes[self.id].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn stopped(&self) -> bool {
        self.shared.stop.load(Ordering::Relaxed)
    }

    fn reduction(&self, improving: bool, depth: Depth, move_count: i32, delta: Value) -> i32 {
        let d = (depth as usize).min(MAX_MOVES - 1);
        let mn = (move_count as usize).min(MAX_MOVES - 1);
        let r = self.reductions[d] * self.reductions[mn];
        r + self.params.red_base - delta * self.params.red_delta_mult / self.root_delta.max(1)
            + (!improving && r > 936) as i32 * 1024
    }

    fn futility_margin(&self, depth: Depth, no_tt_cut: bool, improving: bool, worsening: bool) -> Value {
        let m = self.params.futility_mult - self.params.futility_no_tt_cut * no_tt_cut as i32;
        m * depth - 2 * m * improving as i32 - m * worsening as i32 / 3
    }

    /// Weighted sum over the correction-history stripes; scaled down by
    /// `corr_value_div` before it touches the eval.
    fn correction_value(&self, ply: i32) -> i32 {
        let us = self.pos.side_to_move();
        let p = &self.params;
        let pcv = self.hists.corr_pawn.get(self.pos.pawn_key(), us);
        let micv = self.hists.corr_minor.get(self.pos.minor_key(), us);
        let macv = self.hists.corr_major.get(self.pos.major_key(), us);
        let wnpcv = self.hists.corr_non_pawn[0].get(self.pos.non_pawn_key(Color::White), us);
        let bnpcv = self.hists.corr_non_pawn[1].get(self.pos.non_pawn_key(Color::Black), us);
        let prev = self.frame(ply - 1);
        let cntcv = if prev.current_move.is_real() {
            self.hists.cont_corr.get(
                self.frame(ply - 2).cont_corr_idx,
                prev.moved_piece,
                prev.moved_to,
            )
        } else {
            0
        };
        p.corr_weight_pawn * pcv
            + p.corr_weight_minor * micv
            + p.corr_weight_major * macv
            + p.corr_weight_non_pawn * (wnpcv + bnpcv)
            + p.corr_weight_cont * cntcv
    }

    fn to_corrected_static_eval(&self, v: Value, correction: i32) -> Value {
        (v + correction / self.params.corr_value_div)
            .clamp(VALUE_TB_LOSS_IN_MAX_PLY + 1, VALUE_TB_WIN_IN_MAX_PLY - 1)
    }

    fn update_correction_histories(&mut self, ply: i32, bonus: i32) {
        let us = self.pos.side_to_move();
        let pawn_key = self.pos.pawn_key();
        let minor_key = self.pos.minor_key();
        let major_key = self.pos.major_key();
        let wnp = self.pos.non_pawn_key(Color::White);
        let bnp = self.pos.non_pawn_key(Color::Black);
        self.hists.corr_pawn.update(pawn_key, us, bonus);
        self.hists.corr_minor.update(minor_key, us, bonus);
        self.hists.corr_major.update(major_key, us, bonus);
        self.hists.corr_non_pawn[0].update(wnp, us, bonus);
        self.hists.corr_non_pawn[1].update(bnp, us, bonus);
        let prev = *self.frame(ply - 1);
        if prev.current_move.is_real() {
            self.hists.cont_corr.update(
                self.frame(ply - 2).cont_corr_idx,
                prev.moved_piece,
                prev.moved_to,
                bonus,
            );
        }
    }

    /// Updates the continuation histories of plies -1, -2, -3, -4 and -6
    /// with the move described by (piece, to). Only the first two entries
    /// are touched while in check.
    fn update_continuation_histories(&mut self, ply: i32, piece: usize, to: usize, bonus: i32) {
        let in_check = self.frame(ply).in_check;
        for offset in [1, 2, 3, 4, 6] {
            if in_check && offset > 2 {
                break;
            }
            let prev = *self.frame(ply - offset);
            if prev.current_move.is_real() {
                let weighted = if offset == 3 { bonus / 2 } else { bonus };
                self.hists.cont.update(prev.cont_idx, piece, to, weighted);
            }
        }
    }

    fn update_quiet_histories(&mut self, ply: i32, m: ChessMove, bonus: i32) {
        let us = self.pos.side_to_move();
        let pc = moved_piece_idx(&self.pos, m);
        let to = m.get_dest().to_index();
        self.hists.main.update(us, m, bonus);
        if (ply as usize) < LOW_PLY_HISTORY_SIZE {
            self.hists.low_ply.update(ply as usize, m, bonus);
        }
        self.update_continuation_histories(ply, pc, to, bonus);
        let pawn_index = PawnHistory::index(&self.pos);
        self.hists.pawn.update(pawn_index, pc, to, bonus / 2);
    }

    /// Killers, countermove and the quiet history bundle for a fail-high
    /// quiet move.
    fn update_quiet_stats(&mut self, ply: i32, m: ChessMove, bonus: i32) {
        let frame = self.frame_mut(ply);
        if frame.killers[0] != Some(m) {
            frame.killers[1] = frame.killers[0];
            frame.killers[0] = Some(m);
        }
        self.update_quiet_histories(ply, m, bonus);
        let prev = *self.frame(ply - 1);
        if prev.current_move.is_real() {
            self.hists
                .counter_moves
                .set(prev.moved_piece, prev.moved_to, m);
        }
    }

    /// Stats bookkeeping after a node finds a best move.
    #[allow(clippy::too_many_arguments)]
    fn update_all_stats(
        &mut self,
        ply: i32,
        best_move: ChessMove,
        best_value: Value,
        beta: Value,
        prev_sq: Option<Square>,
        quiets: &[ChessMove],
        captures: &[ChessMove],
        depth: Depth,
    ) {
        let bonus1 = stat_bonus(&self.params, depth + 1);
        let malus1 = stat_malus(&self.params, depth + 1);

        if !self.pos.capture_stage(best_move) {
            let bonus2 = if best_value > beta + 145 {
                bonus1
            } else {
                stat_bonus(&self.params, depth)
            };
            self.update_quiet_stats(ply, best_move, bonus2);
            for &q in quiets {
                self.update_quiet_histories(ply, q, -malus1);
            }
        } else {
            let pc = moved_piece_idx(&self.pos, best_move);
            let to = best_move.get_dest().to_index();
            let captured = self.pos.captured_type(best_move).to_index();
            self.hists.capture.update(pc, to, captured, bonus1);
        }

        // Extra penalty for an early refuted quiet on the previous ply
        let prev = *self.frame(ply - 1);
        if let (Some(sq), FrameMove::Real(_)) = (prev_sq, prev.current_move) {
            let early = prev.move_count == 1 + prev.tt_hit as i32
                || prev.current_move.real() == prev.killers[0];
            if early && self.pos.captured_piece().is_none() {
                let piece = match (self.pos.piece_on(sq), self.pos.color_on(sq)) {
                    (Some(p), Some(c)) => piece_idx(c, p),
                    _ => history::NO_PIECE_IDX,
                };
                self.update_prev_continuation(ply - 1, piece, sq.to_index(), -malus1);
            }
        }

        for &c in captures {
            let pc = moved_piece_idx(&self.pos, c);
            let to = c.get_dest().to_index();
            let captured = self.pos.captured_type(c).to_index();
            self.hists.capture.update(pc, to, captured, -malus1);
        }
    }

    /// Continuation update anchored one ply back (the caller passes ply-1).
    fn update_prev_continuation(&mut self, ply: i32, piece: usize, to: usize, bonus: i32) {
        let in_check = self.frame(ply).in_check;
        for offset in [1, 2, 3, 4, 6] {
            if in_check && offset > 2 {
                break;
            }
            let prev = *self.frame(ply - offset);
            if prev.current_move.is_real() {
                let weighted = if offset == 3 { bonus / 2 } else { bonus };
                self.hists.cont.update(prev.cont_idx, piece, to, weighted);
            }
        }
    }

    fn pick_context(&self, ply: i32) -> PickContext {
        PickContext {
            cont: [
                self.frame(ply - 1).cont_idx,
                self.frame(ply - 2).cont_idx,
                self.frame(ply - 3).cont_idx,
                self.frame(ply - 4).cont_idx,
                self.frame(ply - 6).cont_idx,
            ],
            ply: ply as usize,
            pawn_index: PawnHistory::index(&self.pos),
        }
    }

    fn do_move(&mut self, ply: i32, m: ChessMove, gives_check: bool, capture: bool) {
        let pc = moved_piece_idx(&self.pos, m);
        let to = m.get_dest().to_index();
        let in_check = self.frame(ply).in_check;
        {
            let frame = self.frame_mut(ply);
            frame.current_move = FrameMove::Real(m);
            frame.moved_piece = pc;
            frame.moved_to = to;
            frame.cont_idx = ContinuationHistory::index(in_check, capture, pc, to);
            frame.cont_corr_idx = ContinuationCorrectionHistory::index(pc, to);
        }
        self.pos.do_move(m);
        self.count_node();
        let _ = gives_check;
    }

    fn undo_move(&mut self) {
        self.pos.undo_move();
    }

    fn do_null_move(&mut self, ply: i32) {
        let frame = self.frame_mut(ply);
        frame.current_move = FrameMove::Null;
        frame.moved_piece = history::NO_PIECE_IDX;
        frame.moved_to = 0;
        frame.cont_idx = ContinuationHistory::sentinel();
        frame.cont_corr_idx = ContinuationCorrectionHistory::sentinel();
        self.pos.do_null_move();
        self.count_node();
    }

    fn undo_null_move(&mut self) {
        self.pos.undo_null_move();
    }

    /// Main-thread clock poll, every `calls_cnt` node visits.
    fn check_time(&mut self) {
        self.calls_cnt -= 1;
        if self.calls_cnt > 0 {
            return;
        }
        self.calls_cnt = if self.limits.nodes > 0 {
            (self.limits.nodes as i64 / 1024).min(1024).max(512)
        } else {
            1024
        };

        if self.shared.ponder.load(Ordering::Relaxed) {
            return;
        }

        let nodes = self.nodes_searched();
        let elapsed = self.tm.elapsed(nodes);
        let hard_stop = (self.tm.active()
            && (elapsed > self.tm.maximum()
                || self.shared.stop_on_ponderhit.load(Ordering::Relaxed)))
            || (self.limits.movetime > 0 && elapsed >= self.limits.movetime as f64)
            || (self.limits.nodes > 0 && nodes >= self.limits.nodes);
        if hard_stop {
            self.shared.stop.store(true, Ordering::Relaxed);
            self.shared.aborted_search.store(true, Ordering::Relaxed);
        }
    }

    // ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
    // Iterative deepening

    /// The per-worker driver: repeats `search::<RootNode>` with increasing
    /// depth inside aspiration windows until stopped.
    pub fn iterative_deepening(&mut self) {
        let us = self.pos.side_to_move();
        let mut last_best_move: Option<ChessMove> = None;
        let mut last_best_pv: Vec<ChessMove> = Vec::new();
        let mut last_best_score = -VALUE_INFINITE;
        let mut last_best_move_depth = 0;
        let mut time_reduction = 1.0;
        let mut iter_idx = 0usize;
        let mut search_again_counter = 0;
        let mut delta;
        let mut alpha;
        let mut beta;

        if self.is_main() {
            let fill = if self.best_previous_score == VALUE_INFINITE {
                VALUE_ZERO
            } else {
                self.best_previous_score
            };
            self.iter_value = [fill; 4];
        }

        let mut skill = Skill::new(self.skill_level, self.uci_elo);
        let mut multi_pv = self.multi_pv;
        if skill.enabled() {
            multi_pv = multi_pv.max(4);
        }
        multi_pv = multi_pv.min(self.root_moves.len());

        let mut pv_scratch: Vec<ChessMove> = Vec::new();

        while !self.stopped() {
            self.root_depth += 1;
            if self.root_depth >= MAX_PLY as Depth {
                break;
            }
            if self.limits.depth > 0 && self.is_main() && self.root_depth > self.limits.depth {
                break;
            }

            // Age out the PV variability measure
            if self.is_main() {
                self.best_move_changes /= 2.0;
            }

            for rm in self.root_moves.iter_mut() {
                rm.previous_score = rm.score;
            }

            let mut pv_first = 0;
            self.pv_last = 0;

            if !self.shared.increase_depth.load(Ordering::Relaxed) {
                search_again_counter += 1;
            }

            // MultiPV loop: one full root search per line
            self.pv_idx = 0;
            while self.pv_idx < multi_pv && !self.stopped() {
                if self.pv_idx == self.pv_last {
                    pv_first = self.pv_last;
                    self.pv_last += 1;
                    while self.pv_last < self.root_moves.len()
                        && self.root_moves[self.pv_last].tb_rank
                            == self.root_moves[pv_first].tb_rank
                    {
                        self.pv_last += 1;
                    }
                }

                self.sel_depth = 0;

                let prev = self.root_moves[self.pv_idx].average_score;
                let prev = if prev == -VALUE_INFINITE { VALUE_ZERO } else { prev };
                let msq = self.root_moves[self.pv_idx].mean_squared_score;
                delta = self.params.asp_delta_base
                    + (msq.unsigned_abs() / self.params.asp_delta_div as u64) as Value;
                alpha = (prev - delta).max(-VALUE_INFINITE);
                beta = (prev + delta).min(VALUE_INFINITE);

                let opt = self.params.optimism_mult * prev
                    / (prev.abs() + self.params.optimism_add);
                self.optimism[us.to_index()] = opt;
                self.optimism[(!us).to_index()] = -opt;

                let mut failed_high_cnt = 0;
                loop {
                    let adjusted_depth = (self.root_depth
                        - failed_high_cnt
                        - 3 * (search_again_counter + 1) / 4)
                        .max(1);
                    self.root_delta = beta - alpha;
                    pv_scratch.clear();
                    let best_value = self.search::<RootNode>(
                        0,
                        alpha,
                        beta,
                        adjusted_depth,
                        false,
                        &mut pv_scratch,
                    );

                    // The stable sort is load-bearing: every non-PV move
                    // carries -INFINITE and must keep its relative order.
                    self.root_moves[self.pv_idx..self.pv_last]
                        .sort_by(|a, b| (b.score, b.previous_score).cmp(&(a.score, a.previous_score)));

                    if self.stopped() {
                        break;
                    }

                    if self.is_main()
                        && multi_pv == 1
                        && (best_value <= alpha || best_value >= beta)
                        && self.tm.elapsed_ms() > 3000
                    {
                        self.emit_pv(self.root_depth, multi_pv);
                    }

                    if best_value <= alpha {
                        beta = (alpha + beta) / 2;
                        alpha = (best_value - delta).max(-VALUE_INFINITE);
                        failed_high_cnt = 0;
                        if self.is_main() {
                            self.shared.stop_on_ponderhit.store(false, Ordering::Relaxed);
                        }
                    } else if best_value >= beta {
                        beta = (best_value + delta).min(VALUE_INFINITE);
                        failed_high_cnt += 1;
                    } else {
                        break;
                    }

                    delta += delta / 3;
                }

                self.root_moves[pv_first..self.pv_idx + 1]
                    .sort_by(|a, b| (b.score, b.previous_score).cmp(&(a.score, a.previous_score)));

                if self.is_main()
                    && (self.stopped()
                        || self.pv_idx + 1 == multi_pv
                        || self.tm.elapsed_ms() > 3000)
                {
                    self.emit_pv(self.root_depth, multi_pv);
                }

                self.pv_idx += 1;
            }

            if !self.stopped() {
                self.completed_depth = self.root_depth;
            }

            // Aborted-iteration recovery: an unproven mated-in score from a
            // cancelled search must not replace the last complete result.
            if self.stopped()
                && self.root_moves[0].score != -VALUE_INFINITE
                && self.root_moves[0].score <= VALUE_MATED_IN_MAX_PLY
                && !last_best_pv.is_empty()
            {
                self.root_moves[0].pv = last_best_pv.clone();
                self.root_moves[0].score = last_best_score;
                self.root_moves[0].uci_score = last_best_score;
            }

            if Some(self.root_moves[0].pv[0]) != last_best_move {
                last_best_move = Some(self.root_moves[0].pv[0]);
                last_best_move_depth = self.root_depth;
            }
            if !self.stopped() {
                last_best_pv = self.root_moves[0].pv.clone();
                last_best_score = self.root_moves[0].score;
            }

            let best_value = self.root_moves[0].score;

            // Early stop once a requested mate-in-N is proven
            if self.limits.mate > 0
                && best_value >= VALUE_MATE_IN_MAX_PLY
                && VALUE_MATE - best_value <= 2 * self.limits.mate
            {
                self.shared.stop.store(true, Ordering::Relaxed);
            }

            if !self.is_main() {
                continue;
            }

            if skill.enabled() && skill.time_to_pick(self.root_depth) {
                skill.pick_best(&self.root_moves, multi_pv);
            }

            // Collect best-move flips from all workers for instability
            self.best_move_changes += self.shared.take_best_move_changes() as f64;

            if self.tm.active()
                && !self.stopped()
                && !self.shared.stop_on_ponderhit.load(Ordering::Relaxed)
            {
                let total_nodes = self.nodes_searched().max(1);
                let nodes_effort = self.root_moves[0].effort * 100 / total_nodes;

                let falling_eval = ((11
                    + 2 * (self.best_previous_average_score - best_value)
                    + (self.iter_value[iter_idx] - best_value)) as f64
                    / 100.0)
                    .clamp(0.58, 1.67);

                time_reduction = if last_best_move_depth + 8 < self.completed_depth {
                    1.495
                } else {
                    0.687
                };
                let reduction = (1.48 + self.previous_time_reduction) / (2.17 * time_reduction);
                let instability =
                    1.0 + 1.88 * self.best_move_changes / self.thread_count as f64;

                let mut total_time =
                    self.tm.optimum() * falling_eval * reduction * instability;

                if self.params.use_time_net {
                    total_time *=
                        timenet::time_factor(&self.pos, self.params.tm_net_divisor);
                }

                if self.root_moves.len() == 1 {
                    total_time = total_time.min(self.params.tm_single_reply_ms);
                }

                let elapsed = self.tm.elapsed(total_nodes);

                let plateau = elapsed > total_time * 0.739
                    && self.completed_depth >= 10
                    && nodes_effort >= 97;

                if elapsed > total_time || plateau {
                    // Keep pondering if the protocol asked for it; stop
                    // for real otherwise.
                    if self.shared.ponder.load(Ordering::Relaxed) {
                        self.shared.stop_on_ponderhit.store(true, Ordering::Relaxed);
                    } else {
                        self.shared.stop.store(true, Ordering::Relaxed);
                    }
                } else {
                    let defer = elapsed > total_time * 0.506;
                    self.shared.increase_depth.store(!defer, Ordering::Relaxed);
                }
            }

            self.iter_value[iter_idx] = best_value;
            iter_idx = (iter_idx + 1) & 3;
        }

        if !self.is_main() {
            return;
        }

        self.previous_time_reduction = time_reduction;

        if skill.enabled() {
            let pick = skill
                .best
                .or_else(|| skill.pick_best(&self.root_moves, multi_pv));
            if let Some(best) = pick {
                if let Some(idx) = self.root_moves.iter().position(|rm| rm.pv[0] == best) {
                    self.root_moves.swap(0, idx);
                }
            }
        }
    }

    /// Formats and emits the "info" lines for the searched PVs.
    pub fn emit_pv(&self, depth: Depth, multi_pv: usize) {
        let callbacks = match &self.callbacks {
            Some(cb) => cb,
            None => return,
        };
        let nodes = self.nodes_searched();
        let time_ms = self.tm.elapsed_ms().max(1);
        let nps = nodes * 1000 / time_ms;
        let tb_hits = self.shared.tb_hits_total()
            + if self.root_in_tb { self.root_moves.len() as u64 } else { 0 };
        let hashfull = self.tt.hashfull();

        for (i, rm) in self.root_moves.iter().take(multi_pv).enumerate() {
            let updated = rm.score != -VALUE_INFINITE;
            if depth == 1 && !updated && i > 0 {
                continue;
            }
            let d = if updated { depth } else { (depth - 1).max(1) };
            let mut v = if updated { rm.uci_score } else { rm.previous_score };
            if v == -VALUE_INFINITE {
                v = VALUE_ZERO;
            }
            let tb = self.root_in_tb && v.abs() < VALUE_MATE_IN_MAX_PLY;
            let v = if tb { rm.tb_score } else { v };
            let exact_bounds = i != self.pv_idx || tb || !updated;

            let info = InfoFull {
                depth: d,
                sel_depth: rm.sel_depth,
                multipv: i + 1,
                score: uci_score(v),
                lowerbound: !exact_bounds && rm.score_lowerbound,
                upperbound: !exact_bounds && rm.score_upperbound,
                wdl: if self.show_wdl {
                    Some(win_rate_model(v, self.pos.game_ply()))
                } else {
                    None
                },
                nodes,
                nps,
                hashfull,
                tb_hits,
                time_ms,
                pv: &rm.pv,
            };
            (callbacks.on_update_full)(&info);
        }
    }

    // ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
    // Main search

    fn search<NT: NodeSpec>(
        &mut self,
        ply: i32,
        mut alpha: Value,
        mut beta: Value,
        mut depth: Depth,
        cut_node: bool,
        pv: &mut Vec<ChessMove>,
    ) -> Value {
        let pv_node = NT::PV;
        let root_node = NT::ROOT;

        // Upcoming-repetition draw: lift a below-draw alpha when the mover
        // can force a cycle.
        if !root_node
            && self.pos.rule50_count() >= 3
            && alpha < VALUE_DRAW
            && self.pos.upcoming_repetition(ply)
        {
            alpha = value_draw(self.nodes_searched());
            if alpha >= beta {
                return alpha;
            }
        }

        // Horizon: drop into quiescence
        if depth <= 0 {
            return if pv_node {
                self.qsearch::<PvNode>(ply, alpha, beta, 0, pv)
            } else {
                self.qsearch::<NonPvNode>(ply, alpha, beta, 0, pv)
            };
        }

        debug_assert!(-VALUE_INFINITE <= alpha && alpha < beta && beta <= VALUE_INFINITE);
        debug_assert!(pv_node || alpha == beta - 1);
        debug_assert!(!(pv_node && cut_node));

        // Step 1. Initialize the node
        let in_check = self.pos.in_check();
        let prior_capture = self.pos.captured_piece().is_some();
        let us = self.pos.side_to_move();
        let mut best_value = -VALUE_INFINITE;
        let mut max_value = VALUE_INFINITE;
        let mut best_move: Option<ChessMove> = None;

        self.frame_mut(ply).in_check = in_check;
        self.frame_mut(ply).move_count = 0;

        if self.is_main() {
            self.check_time();
        }

        if pv_node {
            pv.clear();
            if self.sel_depth < ply + 1 {
                self.sel_depth = ply + 1;
            }
        }

        if !root_node {
            // Step 2. Aborted search and immediate draw
            if self.stopped() || self.pos.is_draw(ply) || ply >= MAX_PLY as i32 - 1 {
                return if ply >= MAX_PLY as i32 - 1 && !in_check {
                    evaluate(&self.pos, self.optimism[us.to_index()])
                } else {
                    value_draw(self.nodes_searched())
                };
            }

            // Step 3. Mate distance pruning
            alpha = alpha.max(mated_in(ply));
            beta = beta.min(mate_in(ply + 1));
            if alpha >= beta {
                return alpha;
            }
        } else {
            self.root_delta = beta - alpha;
        }

        {
            let f = self.frame_mut(ply + 1);
            f.excluded_move = None;
            f.cutoff_cnt = 0;
        }
        {
            let f = self.frame_mut(ply + 2);
            f.killers = [None, None];
        }
        let prev_frame = *self.frame(ply - 1);
        let prev_sq = prev_frame.current_move.real().map(|m| m.get_dest());
        self.frame_mut(ply).stat_score = 0;

        // Step 4. Transposition table lookup
        let excluded_move = self.frame(ply).excluded_move;
        let pos_key = self.pos.key();
        let (tt_hit, tt_data, tt_writer) = self.tt.probe(pos_key);
        self.frame_mut(ply).tt_hit = tt_hit;
        let tt_value = if tt_hit {
            value_from_tt(tt_data.value, ply, self.pos.rule50_count())
        } else {
            VALUE_NONE
        };
        let tt_move = if root_node {
            Some(self.root_moves[self.pv_idx].pv[0])
        } else if tt_hit {
            self.pos.resolve_move16(tt_data.mv)
        } else {
            None
        };
        let tt_capture = tt_move.map_or(false, |m| self.pos.capture_stage(m));

        if excluded_move.is_none() {
            let tt_pv = pv_node || (tt_hit && tt_data.is_pv);
            self.frame_mut(ply).tt_pv = tt_pv;
        }
        let tt_pv = self.frame(ply).tt_pv;

        // At non-PV nodes, an early TT cutoff
        if !pv_node
            && excluded_move.is_none()
            && tt_data.depth > depth - (tt_value <= beta) as Depth
            && is_valid(tt_value)
            && tt_data.bound.includes(if tt_value >= beta { Bound::LOWER } else { Bound::UPPER })
            && (cut_node == (tt_value >= beta) || depth > 5)
        {
            // Refresh the ordering stats of the TT move on its way out
            if let Some(m) = tt_move {
                if tt_value >= beta {
                    if !tt_capture {
                        self.update_quiet_stats(ply, m, stat_bonus(&self.params, depth));
                    }
                    if let Some(sq) = prev_sq {
                        if prev_frame.move_count <= 2 && !prior_capture {
                            let piece = match (self.pos.piece_on(sq), self.pos.color_on(sq)) {
                                (Some(p), Some(c)) => piece_idx(c, p),
                                _ => history::NO_PIECE_IDX,
                            };
                            self.update_prev_continuation(
                                ply - 1,
                                piece,
                                sq.to_index(),
                                -stat_malus(&self.params, depth + 1),
                            );
                        }
                    }
                } else if !tt_capture {
                    let penalty = -stat_malus(&self.params, depth);
                    self.hists.main.update(us, m, penalty);
                    let pc = moved_piece_idx(&self.pos, m);
                    self.update_continuation_histories(
                        ply,
                        pc,
                        m.get_dest().to_index(),
                        penalty,
                    );
                }
            }

            // Graph-history safety: no TT cutoffs at high rule-50 counts
            if self.pos.rule50_count() < 90 {
                return tt_value;
            }
        }

        // Step 5. Tablebase probe
        if !root_node && excluded_move.is_none() && self.tb_cardinality > 0 {
            let pieces = self.pos.piece_count();
            if pieces <= self.tb_cardinality
                && (pieces < self.tb_cardinality || depth >= self.tb_config.probe_depth)
                && self.pos.rule50_count() == 0
                && !self.pos.can_castle_any()
            {
                if self.is_main() {
                    self.calls_cnt = 0;
                }
                let wdl = self.tb.as_ref().and_then(|tb| tb.probe_wdl(&self.pos));
                if let Some(wdl) = wdl {
                    self.shared.tb_hits[self.id].fetch_add(1, Ordering::Relaxed);
                    let draw_score = self.tb_config.use_rule50 as i32;

                    let value = if wdl < -draw_score {
                        VALUE_MATED_IN_MAX_PLY + ply + 1
                    } else if wdl > draw_score {
                        VALUE_MATE_IN_MAX_PLY - ply - 1
                    } else {
                        VALUE_DRAW + 2 * wdl * draw_score
                    };

                    let bound = if wdl < -draw_score {
                        Bound::UPPER
                    } else if wdl > draw_score {
                        Bound::LOWER
                    } else {
                        Bound::EXACT
                    };

                    if bound == Bound::EXACT
                        || (bound == Bound::LOWER && value >= beta)
                        || (bound == Bound::UPPER && value <= alpha)
                    {
                        self.tt.store(
                            tt_writer,
                            pos_key,
                            value_to_tt(value, ply),
                            tt_pv,
                            bound,
                            (depth + 6).min(MAX_PLY as Depth - 1),
                            Move16::NONE,
                            VALUE_NONE,
                        );
                        return value;
                    }

                    if pv_node {
                        if bound == Bound::LOWER {
                            best_value = value;
                            alpha = alpha.max(best_value);
                        } else {
                            max_value = value;
                        }
                    }
                }
            }
        }

        // Step 6. Static evaluation — skipped entirely while in check
        let correction = self.correction_value(ply);

        if in_check {
            self.frame_mut(ply).static_eval = VALUE_NONE;
            return self.search_moves::<NT>(SearchMovesArgs {
                ply,
                alpha,
                beta,
                depth,
                cut_node,
                pv,
                in_check,
                prior_capture,
                prev_sq,
                excluded_move,
                tt_move,
                tt_capture,
                tt_hit,
                tt_value,
                tt_depth: tt_data.depth,
                tt_bound: tt_data.bound,
                tt_writer,
                pos_key,
                raw_eval: VALUE_NONE,
                improving: false,
                correction,
                best_value,
                max_value,
                best_move,
            });
        }

        let mut eval;
        let raw_eval;
        {
            // keep the three-way split readable
            if excluded_move.is_some() {
                eval = self.frame(ply).static_eval;
                raw_eval = eval;
            } else if tt_hit {
                let raw = if is_valid(tt_data.eval) {
                    tt_data.eval
                } else {
                    evaluate(&self.pos, self.optimism[us.to_index()])
                };
                raw_eval = raw;
                let corrected = self.to_corrected_static_eval(raw, correction);
                self.frame_mut(ply).static_eval = corrected;
                eval = corrected;
                // The TT value is usually a better estimate than the eval
                if is_valid(tt_value)
                    && tt_data
                        .bound
                        .includes(if tt_value > eval { Bound::LOWER } else { Bound::UPPER })
                {
                    eval = tt_value;
                }
            } else {
                let raw = evaluate(&self.pos, self.optimism[us.to_index()]);
                raw_eval = raw;
                let corrected = self.to_corrected_static_eval(raw, correction);
                self.frame_mut(ply).static_eval = corrected;
                eval = corrected;
                self.tt.store(
                    tt_writer,
                    pos_key,
                    VALUE_NONE,
                    tt_pv,
                    Bound::NONE,
                    DEPTH_UNSEARCHED,
                    Move16::NONE,
                    raw,
                );
            }

            // Step 6b. Use the eval trend to improve quiet move ordering
            if let FrameMove::Real(prev_move) = prev_frame.current_move {
                if !prev_frame.in_check && !prior_capture {
                    let bonus = (-self.params.eval_hist_bonus_mult
                        * (prev_frame.static_eval + self.frame(ply).static_eval))
                        .clamp(
                            -self.params.eval_hist_bonus_max,
                            self.params.eval_hist_bonus_max,
                        );
                    self.hists.main.update(!us, prev_move, bonus);
                    if let Some(sq) = prev_sq {
                        let piece = self.pos.piece_on(sq);
                        if piece.is_some()
                            && piece != Some(Piece::Pawn)
                            && prev_move.get_promotion().is_none()
                        {
                            let pc = piece_idx(!us, piece.unwrap_or(Piece::Pawn));
                            let pawn_index = PawnHistory::index(&self.pos);
                            self.hists.pawn.update(pawn_index, pc, sq.to_index(), bonus / 2);
                        }
                    }
                }
            }

        }

        // Step 6c. Improving / opponent-worsening flags
        let two_back = self.frame(ply - 2).static_eval;
        let improving = is_valid(two_back) && self.frame(ply).static_eval > two_back;
        let opponent_worsening = is_valid(prev_frame.static_eval)
            && self.frame(ply).static_eval + prev_frame.static_eval > 2;

        let static_eval = self.frame(ply).static_eval;

        // Step 7. Razoring
        if eval < alpha - self.params.razor_base - self.params.razor_depth_sq * depth * depth {
            let mut scratch = Vec::new();
            let value = self.qsearch::<NonPvNode>(ply, alpha - 1, alpha, 0, &mut scratch);
            if value < alpha && !is_decisive(value) {
                return value;
            }
        }

        // Step 8. Reverse futility pruning
        if !tt_pv
            && depth < self.params.rfp_max_depth
            && eval
                - self.futility_margin(depth, !tt_hit && cut_node, improving, opponent_worsening)
                - prev_frame.stat_score / self.params.rfp_stat_score_div
                >= beta
            && eval >= beta
            && !is_decisive(eval)
        {
            return beta + (eval - beta) / 3;
        }

        // Step 9. Null move search with verification
        if cut_node
            && prev_frame.current_move != FrameMove::Null
            && prev_frame.stat_score < self.params.nmp_stat_score_max
            && eval >= beta
            && eval >= static_eval
            && static_eval >= beta - self.params.nmp_beta_mult * depth + self.params.nmp_beta_base
            && excluded_move.is_none()
            && self.pos.non_pawn_material(us) > 0
            && ply >= self.nmp_min_ply
            && !is_loss(beta)
        {
            let r = ((eval - beta) / self.params.nmp_eval_div).min(self.params.nmp_eval_red_max)
                + depth / 3
                + self.params.nmp_base_red;

            self.do_null_move(ply);
            let mut scratch = Vec::new();
            let null_value = -self.search::<NonPvNode>(
                ply + 1,
                -beta,
                -beta + 1,
                depth - r,
                false,
                &mut scratch,
            );
            self.undo_null_move();

            if null_value >= beta && !is_win(null_value) {
                if self.nmp_min_ply != 0 || depth < self.params.nmp_verify_depth {
                    return null_value;
                }

                debug_assert!(self.nmp_min_ply == 0);
                // Verification search with null moves disabled along the
                // first 3/4 of the remaining depth
                self.nmp_min_ply = ply + 3 * (depth - r) / 4;
                let v = self.search::<NonPvNode>(ply, beta - 1, beta, depth - r, false, &mut scratch);
                self.nmp_min_ply = 0;

                if v >= beta {
                    return null_value;
                }
            }
        }

        // Step 10. Internal iterative reductions
        if pv_node && tt_move.is_none() {
            depth -= self.params.iir_pv_reduction;
        }
        if depth <= 0 {
            return self.qsearch::<PvNode>(ply, alpha, beta, 0, pv);
        }
        if cut_node
            && depth >= self.params.iir_cut_min_depth
            && (tt_move.is_none() || tt_data.bound == Bound::UPPER)
        {
            depth -= 1 + tt_move.is_none() as Depth;
        }

        // Step 11. ProbCut
        let probcut_beta = beta + self.params.probcut_margin
            - self.params.probcut_improving * improving as i32;
        if !pv_node
            && depth > 3
            && !is_decisive(beta)
            && !(tt_data.depth >= depth - 3 && is_valid(tt_value) && tt_value < probcut_beta)
        {
            let ctx = self.pick_context(ply);
            let mut picker = MovePicker::new_probcut(
                &self.pos,
                tt_move.filter(|m| self.pos.capture_stage(*m)),
                probcut_beta - static_eval,
                ctx,
            );
            let mut scratch = Vec::new();
            while let Some(m) = picker.next_move(&self.pos, &self.hists) {
                if Some(m) == excluded_move {
                    continue;
                }
                let gives_check = self.pos.gives_check(m);
                self.do_move(ply, m, gives_check, true);
                let mut value =
                    -self.qsearch::<NonPvNode>(ply + 1, -probcut_beta, -probcut_beta + 1, 0, &mut scratch);
                if value >= probcut_beta {
                    value = -self.search::<NonPvNode>(
                        ply + 1,
                        -probcut_beta,
                        -probcut_beta + 1,
                        depth - 4,
                        !cut_node,
                        &mut scratch,
                    );
                }
                self.undo_move();

                if value >= probcut_beta {
                    let pc = moved_piece_idx(&self.pos, m);
                    let to = m.get_dest().to_index();
                    let captured = self.pos.captured_type(m).to_index();
                    self.hists.capture.update(
                        pc,
                        to,
                        captured,
                        stat_bonus(&self.params, depth - 2),
                    );
                    self.tt.store(
                        tt_writer,
                        pos_key,
                        value_to_tt(value, ply),
                        tt_pv,
                        Bound::LOWER,
                        depth - 3,
                        Move16::encode(m),
                        static_eval,
                    );
                    return if !is_decisive(value) {
                        value - (probcut_beta - beta)
                    } else {
                        value
                    };
                }
                if self.stopped() {
                    return VALUE_ZERO;
                }
            }
        }

        self.search_moves::<NT>(SearchMovesArgs {
            ply,
            alpha,
            beta,
            depth,
            cut_node,
            pv,
            in_check,
            prior_capture,
            prev_sq,
            excluded_move,
            tt_move,
            tt_capture,
            tt_hit,
            tt_value,
            tt_depth: tt_data.depth,
            tt_bound: tt_data.bound,
            tt_writer,
            pos_key,
            raw_eval,
            improving,
            correction,
            best_value,
            max_value,
            best_move,
        })
    }

    // ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
    // Quiescence search

    fn qsearch<NT: NodeSpec>(
        &mut self,
        ply: i32,
        mut alpha: Value,
        beta: Value,
        depth: Depth,
        pv: &mut Vec<ChessMove>,
    ) -> Value {
        let pv_node = NT::PV;
        debug_assert!(!NT::ROOT);
        debug_assert!(alpha >= -VALUE_INFINITE && alpha < beta && beta <= VALUE_INFINITE);
        debug_assert!(pv_node || alpha == beta - 1);
        debug_assert!(depth <= 0);

        // Step 1. Upcoming-repetition draw
        if self.pos.rule50_count() >= 3
            && alpha < VALUE_DRAW
            && self.pos.upcoming_repetition(ply)
        {
            alpha = value_draw(self.nodes_searched());
            if alpha >= beta {
                return alpha;
            }
        }

        if pv_node {
            pv.clear();
        }

        let in_check = self.pos.in_check();
        self.frame_mut(ply).in_check = in_check;
        let us = self.pos.side_to_move();
        let mut best_move: Option<ChessMove> = None;

        // Step 2. Immediate draw or ply cap
        if self.pos.is_draw(ply) || ply >= MAX_PLY as i32 - 1 {
            return if ply >= MAX_PLY as i32 - 1 && !in_check {
                evaluate(&self.pos, self.optimism[us.to_index()])
            } else {
                VALUE_DRAW
            };
        }

        let tt_depth = if in_check || depth >= DEPTH_QS_CHECKS {
            DEPTH_QS_CHECKS
        } else {
            DEPTH_QS_NO_CHECKS
        };

        // Step 3. Transposition table lookup
        let pos_key = self.pos.key();
        let (tt_hit, tt_data, tt_writer) = self.tt.probe(pos_key);
        self.frame_mut(ply).tt_hit = tt_hit;
        let tt_value = if tt_hit {
            value_from_tt(tt_data.value, ply, self.pos.rule50_count())
        } else {
            VALUE_NONE
        };
        let tt_move = if tt_hit { self.pos.resolve_move16(tt_data.mv) } else { None };
        let pv_hit = tt_hit && tt_data.is_pv;

        if !pv_node
            && tt_data.depth >= tt_depth
            && is_valid(tt_value)
            && tt_data.bound.includes(if tt_value >= beta { Bound::LOWER } else { Bound::UPPER })
        {
            return tt_value;
        }

        // Step 4. Static evaluation and stand-pat
        let mut best_value;
        let futility_base;
        let raw_eval;
        if in_check {
            self.frame_mut(ply).static_eval = VALUE_NONE;
            raw_eval = VALUE_NONE;
            best_value = -VALUE_INFINITE;
            futility_base = -VALUE_INFINITE;
        } else {
            let correction = self.correction_value(ply);
            let prev_frame = *self.frame(ply - 1);
            let raw = if tt_hit && is_valid(tt_data.eval) {
                tt_data.eval
            } else if prev_frame.current_move == FrameMove::Null
                && is_valid(prev_frame.static_eval)
            {
                -prev_frame.static_eval
            } else {
                evaluate(&self.pos, self.optimism[us.to_index()])
            };
            raw_eval = raw;
            let corrected = self.to_corrected_static_eval(raw, correction);
            self.frame_mut(ply).static_eval = corrected;
            best_value = corrected;

            if tt_hit
                && is_valid(tt_value)
                && tt_data
                    .bound
                    .includes(if tt_value > best_value { Bound::LOWER } else { Bound::UPPER })
            {
                best_value = tt_value;
            }

            // Stand pat
            if best_value >= beta {
                if !is_decisive(best_value) {
                    best_value = (3 * best_value + beta) / 4;
                }
                if !tt_hit {
                    self.tt.store(
                        tt_writer,
                        pos_key,
                        value_to_tt(best_value, ply),
                        false,
                        Bound::LOWER,
                        DEPTH_UNSEARCHED,
                        Move16::NONE,
                        raw,
                    );
                }
                return best_value;
            }

            if best_value > alpha {
                alpha = best_value;
            }
            futility_base = corrected + self.params.qs_futility_margin;
        }

        let prev_sq = self.frame(ply - 1).current_move.real().map(|m| m.get_dest());
        let ctx = self.pick_context(ply);
        let mut picker = MovePicker::new_qsearch(&self.pos, tt_move, depth, ctx);

        let mut move_count = 0;
        let mut quiet_check_evasions = 0;
        let mut child_pv: Vec<ChessMove> = Vec::new();

        // Step 5. Move loop
        while let Some(m) = picker.next_move(&self.pos, &self.hists) {
            debug_assert!(self.pos.legal(m));
            let gives_check = self.pos.gives_check(m);
            let capture = self.pos.capture_stage(m);
            move_count += 1;

            // Step 5a. Pruning, only while not losing
            if !is_loss(best_value) {
                if !gives_check
                    && Some(m.get_dest()) != prev_sq
                    && !is_loss(futility_base)
                    && m.get_promotion().is_none()
                {
                    if move_count > 2 {
                        continue;
                    }
                    let futility_value = futility_base + self.pos.capture_value(m);
                    if futility_value <= alpha {
                        best_value = best_value.max(futility_value);
                        continue;
                    }
                    if futility_base <= alpha && !self.pos.see_ge(m, 1) {
                        best_value = best_value.max(futility_base);
                        continue;
                    }
                }

                // At most two quiet evasions are examined
                if quiet_check_evasions > 1 {
                    break;
                }

                // Continuation-history pruning for bad quiets
                if !capture {
                    let pc = moved_piece_idx(&self.pos, m);
                    let to = m.get_dest().to_index();
                    if self.hists.cont.get(ctx.cont[0], pc, to) < 0
                        && self.hists.cont.get(ctx.cont[1], pc, to) < 0
                    {
                        continue;
                    }
                }

                if !self.pos.see_ge(m, self.params.qs_see_margin) {
                    continue;
                }
            }

            quiet_check_evasions += (!capture && in_check) as i32;

            // Step 5b. Make, recurse, unmake
            self.do_move(ply, m, gives_check, capture);
            child_pv.clear();
            let value = if pv_node {
                -self.qsearch::<PvNode>(ply + 1, -beta, -alpha, depth - 1, &mut child_pv)
            } else {
                -self.qsearch::<NonPvNode>(ply + 1, -beta, -alpha, depth - 1, &mut child_pv)
            };
            self.undo_move();

            debug_assert!(value > -VALUE_INFINITE && value < VALUE_INFINITE);

            // Step 5c. Fold the result
            if value > best_value {
                best_value = value;
                if value > alpha {
                    best_move = Some(m);
                    if pv_node {
                        pv.clear();
                        pv.push(m);
                        pv.extend_from_slice(&child_pv);
                    }
                    if pv_node && value < beta {
                        alpha = value;
                    } else {
                        break;
                    }
                }
            }
        }

        // Step 6. Mate detection
        if in_check && best_value == -VALUE_INFINITE {
            debug_assert!(!self.pos.has_legal_moves());
            return mated_in(ply);
        }

        // Step 7. Smooth a non-decisive fail-high towards beta
        if best_value >= beta && !is_decisive(best_value) {
            best_value = (3 * best_value + beta) / 4;
        }

        // Step 8. Store the result
        self.tt.store(
            tt_writer,
            pos_key,
            value_to_tt(best_value, ply),
            pv_hit,
            if best_value >= beta { Bound::LOWER } else { Bound::UPPER },
            tt_depth,
            best_move.map(Move16::encode).unwrap_or(Move16::NONE),
            raw_eval,
        );

        debug_assert!(best_value > -VALUE_INFINITE && best_value < VALUE_INFINITE);
        best_value
    }

    /// Steps 12-22 of the main search: the move loop and everything after
    /// it. Split out so the early-pruning phase above stays readable.
    fn search_moves<NT: NodeSpec>(&mut self, args: SearchMovesArgs) -> Value {
        let SearchMovesArgs {
            ply,
            mut alpha,
            beta,
            mut depth,
            cut_node,
            pv,
            in_check,
            prior_capture,
            prev_sq,
            excluded_move,
            tt_move,
            tt_capture,
            tt_hit,
            tt_value,
            tt_depth,
            tt_bound,
            tt_writer,
            pos_key,
            raw_eval,
            improving,
            correction,
            mut best_value,
            max_value,
            mut best_move,
        } = args;
        let pv_node = NT::PV;
        let root_node = NT::ROOT;
        let all_node = !pv_node && !cut_node;
        let us = self.pos.side_to_move();
        let tt_pv = self.frame(ply).tt_pv;
        let static_eval = self.frame(ply).static_eval;
        let _ = tt_hit;

        // Step 12. ProbCut shortcut while in check: a stored lower-bound
        // capture far above beta is trusted without a search.
        let probcut_beta = beta + self.params.probcut_incheck_margin;
        if in_check
            && !pv_node
            && tt_capture
            && tt_bound.includes(Bound::LOWER)
            && tt_depth >= depth - 4
            && tt_value >= probcut_beta
            && !is_decisive(tt_value)
            && !is_decisive(beta)
        {
            return probcut_beta;
        }

        // Step 13. Instantiate the move picker
        let counter = prev_sq.and_then(|sq| {
            let piece = match (self.pos.piece_on(sq), self.pos.color_on(sq)) {
                (Some(p), Some(c)) => piece_idx(c, p),
                _ => return None,
            };
            let m16 = self.hists.counter_moves.get(piece, sq.to_index());
            self.pos.resolve_move16(m16)
        });
        let killers = self.frame(ply).killers;
        let ctx = self.pick_context(ply);
        let mut picker = MovePicker::new(&self.pos, tt_move, killers, counter, depth, ctx);

        let mut move_count = 0;
        let mut move_count_pruning = false;
        let mut quiets_searched: Vec<ChessMove> = Vec::new();
        let mut captures_searched: Vec<ChessMove> = Vec::new();
        let mut child_pv: Vec<ChessMove> = Vec::new();

        while let Some(m) = picker.next_move(&self.pos, &self.hists) {
            if Some(m) == excluded_move {
                continue;
            }

            // At root only moves inside the active MultiPV/tbRank window
            // are searched.
            if root_node
                && !self.root_moves[self.pv_idx..self.pv_last]
                    .iter()
                    .any(|rm| rm.pv[0] == m)
            {
                continue;
            }

            if !root_node && !self.pos.legal(m) {
                continue;
            }

            move_count += 1;
            self.frame_mut(ply).move_count = move_count;

            if root_node && self.is_main() && self.tm.elapsed_ms() > 3000 {
                if let Some(cb) = &self.callbacks {
                    (cb.on_iter)(depth, m, move_count as usize + self.pv_idx);
                }
            }

            let capture = self.pos.capture_stage(m);
            let moved_piece = moved_piece_idx(&self.pos, m);
            let to = m.get_dest().to_index();
            let gives_check = self.pos.gives_check(m);
            let captured = self.pos.captured_type(m);
            let capt_hist = self.hists.capture.get(moved_piece, to, captured.to_index());
            let mut new_depth = depth - 1;
            let mut extension: Depth = 0;

            let delta = beta - alpha;
            let mut r = self.reduction(improving, depth, move_count, delta);

            let nodes_before = if root_node {
                self.shared.nodes[self.id].load(Ordering::Relaxed)
            } else {
                0
            };

            // Step 14. Pruning at shallow depth
            if !root_node && self.pos.non_pawn_material(us) > 0 && !is_loss(best_value) {
                if !move_count_pruning && move_count >= futility_move_count(improving, depth) {
                    picker.skip_quiet_moves();
                    move_count_pruning = true;
                }

                let lmr_depth = new_depth - r / 1024;

                if capture || gives_check {
                    // Futility pruning for captures
                    if !gives_check
                        && !in_check
                        && lmr_depth < 7
                        && static_eval
                            + self.params.fp_capt_base
                            + self.params.fp_capt_mult * lmr_depth
                            + piece_value_eg(captured)
                            + capt_hist / 7
                            <= alpha
                    {
                        continue;
                    }
                    // SEE pruning with a history-adjusted margin
                    if !self
                        .pos
                        .see_ge(m, -self.params.see_capt_mult * depth - capt_hist / 32)
                    {
                        continue;
                    }
                } else {
                    let mut hist = self.hists.cont.get(ctx.cont[0], moved_piece, to)
                        + self.hists.cont.get(ctx.cont[1], moved_piece, to)
                        + self.hists.pawn.get(ctx.pawn_index, moved_piece, to);

                    // Continuation-history pruning
                    if lmr_depth < self.params.cont_prune_max_lmr_depth
                        && hist < -self.params.cont_prune_mult * depth
                    {
                        continue;
                    }

                    hist += 2 * self.hists.main.get(us, m);
                    let mut lmr_depth = lmr_depth + hist / self.params.hist_lmr_div;

                    // Futility pruning at the parent
                    if !in_check
                        && lmr_depth < self.params.fp_max_lmr_depth
                        && static_eval + self.params.fp_base + self.params.fp_mult * lmr_depth
                            <= alpha
                    {
                        continue;
                    }

                    lmr_depth = lmr_depth.max(0);

                    // Negative-SEE pruning
                    if !self
                        .pos
                        .see_ge(m, -self.params.see_quiet_mult * lmr_depth * lmr_depth)
                    {
                        continue;
                    }
                }
            }

            // Step 15. Extensions
            if ply < 2 * self.root_depth {
                // Singular extension: re-search all other moves at reduced
                // depth against a lowered bound. If they all fail low, the
                // TT move is singular and deserves more depth.
                if !root_node
                    && Some(m) == tt_move
                    && excluded_move.is_none()
                    && depth
                        >= self.params.se_depth_base
                            - (self.completed_depth > self.params.se_completed_depth) as Depth
                            + 2 * (tt_pv && pv_node) as Depth
                    && is_valid(tt_value)
                    && !is_decisive(tt_value)
                    && tt_bound.includes(Bound::LOWER)
                    && tt_depth >= depth - 3
                {
                    let singular_beta = tt_value
                        - (self.params.se_margin_mult
                            + self.params.se_margin_ttpv * (tt_pv && !pv_node) as i32)
                            * depth
                            / 64;
                    let singular_depth = depth / 2;

                    self.frame_mut(ply).excluded_move = Some(m);
                    let mut scratch = Vec::new();
                    let value = self.search::<NonPvNode>(
                        ply,
                        singular_beta - 1,
                        singular_beta,
                        singular_depth,
                        cut_node,
                        &mut scratch,
                    );
                    self.frame_mut(ply).excluded_move = None;

                    if value < singular_beta {
                        extension = 1
                            + (value < singular_beta - self.params.se_double_margin) as Depth
                            + (value < singular_beta - self.params.se_triple_margin) as Depth;
                        if !pv_node && extension >= 2 {
                            depth += (depth < 13) as Depth;
                        }
                    } else if value >= beta && !is_decisive(value) {
                        // Multi-cut: several moves fail high here
                        return value;
                    } else if tt_value >= beta {
                        extension = -3;
                    } else if cut_node {
                        extension = -2;
                    }
                } else if pv_node
                    && capture
                    && Some(m.get_dest()) == prev_sq
                    && capt_hist > self.params.recapture_ext_hist
                {
                    extension = 1;
                }
            }

            new_depth += extension;

            // Step 16. Make the move
            self.do_move(ply, m, gives_check, capture);

            // Step 16b. Reduction adjustments, in 1024ths of a ply
            if tt_pv {
                r -= 1024
                    + (is_valid(tt_value) && tt_value > alpha) as i32 * 1024
                    + (tt_depth >= depth) as i32 * 1024;
            }
            if pv_node {
                r -= 1024;
            }
            r += self.params.red_adjust_base - correction.abs() / self.params.red_corr_div;
            if cut_node {
                r += 2048 - (tt_depth >= depth && tt_pv) as i32 * 1024;
            }
            if tt_capture && !capture {
                r += 1024 + (depth < 8) as i32 * 1024;
            }
            if self.frame(ply + 1).cutoff_cnt > 3 {
                r += 1024 + all_node as i32 * 1024;
            }
            if Some(m) == tt_move {
                r -= 2048;
            }

            let stat_score = if capture {
                7 * piece_value_eg(captured) + capt_hist / 16
                    - self.params.stat_score_capt_base
            } else {
                2 * self.hists.main.get(us, m)
                    + self.hists.cont.get(ctx.cont[0], moved_piece, to)
                    + self.hists.cont.get(ctx.cont[1], moved_piece, to)
                    - self.params.stat_score_quiet_base
            };
            self.frame_mut(ply).stat_score = stat_score;
            r -= stat_score * self.params.stat_score_red_mult / 16384;

            let mut value = -VALUE_INFINITE;

            // Step 17. Late-move reduction / extension
            if depth >= 2 && move_count > 1 {
                let d = (new_depth - r / 1024).clamp(
                    1,
                    new_depth
                        + !all_node as Depth
                        + (pv_node && best_move.is_none()) as Depth,
                );
                child_pv.clear();
                value =
                    -self.search::<NonPvNode>(ply + 1, -(alpha + 1), -alpha, d, true, &mut child_pv);

                // The reduced search beat alpha: re-search at an adjusted
                // full depth.
                if value > alpha && d < new_depth {
                    let deeper =
                        value > best_value + self.params.lmr_deeper_base + 2 * new_depth;
                    let shallower = value < best_value + self.params.lmr_shallower_margin;
                    new_depth += deeper as Depth - shallower as Depth;
                    if new_depth > d {
                        child_pv.clear();
                        value = -self.search::<NonPvNode>(
                            ply + 1,
                            -(alpha + 1),
                            -alpha,
                            new_depth,
                            !cut_node,
                            &mut child_pv,
                        );
                    }
                    if value >= beta {
                        self.update_continuation_histories(
                            ply,
                            moved_piece,
                            to,
                            stat_bonus(&self.params, new_depth),
                        );
                    }
                }
            }
            // Step 18. Full-depth zero-window search when LMR is skipped
            else if !pv_node || move_count > 1 {
                if tt_move.is_none() && cut_node {
                    r += 2048;
                }
                child_pv.clear();
                value = -self.search::<NonPvNode>(
                    ply + 1,
                    -(alpha + 1),
                    -alpha,
                    new_depth - (r > self.params.full_depth_red_threshold) as Depth,
                    !cut_node,
                    &mut child_pv,
                );
            }

            // Step 19. Full-window search at PV nodes
            if pv_node && (move_count == 1 || (value > alpha && (root_node || value < beta))) {
                // Do not drop straight into qsearch for the TT move close
                // to the root.
                if Some(m) == tt_move && self.root_depth > 8 {
                    new_depth = new_depth.max(1);
                }
                child_pv.clear();
                value =
                    -self.search::<PvNode>(ply + 1, -beta, -alpha, new_depth, false, &mut child_pv);
            }

            // Step 20. Unmake
            self.undo_move();
            debug_assert!(value > -VALUE_INFINITE && value < VALUE_INFINITE);

            // Step 21. Record the result. A stop makes the value unusable:
            // bail out without touching best move, PV or TT.
            if self.stopped() {
                return VALUE_ZERO;
            }

            if root_node {
                let nodes_after = self.shared.nodes[self.id].load(Ordering::Relaxed);
                if let Some(idx) = self.root_moves.iter().position(|rm| rm.pv[0] == m) {
                    let sel_depth = self.sel_depth;
                    let flip = {
                        let rm = &mut self.root_moves[idx];
                        rm.effort += nodes_after - nodes_before;
                        rm.average_score = if rm.average_score == -VALUE_INFINITE {
                            value
                        } else {
                            (2 * value + rm.average_score) / 3
                        };
                        rm.mean_squared_score =
                            rm.average_score as i64 * rm.average_score.abs() as i64;

                        if move_count == 1 || value > alpha {
                            rm.score = value;
                            rm.uci_score = value;
                            rm.sel_depth = sel_depth;
                            rm.score_lowerbound = false;
                            rm.score_upperbound = false;
                            if value >= beta {
                                rm.score_lowerbound = true;
                                rm.uci_score = beta;
                            } else if value <= alpha {
                                rm.score_upperbound = true;
                                rm.uci_score = alpha;
                            }
                            rm.pv.truncate(1);
                            rm.pv.extend_from_slice(&child_pv);
                            move_count > 1
                        } else {
                            // Other moves keep -INFINITE so the stable sort
                            // leaves their order untouched
                            rm.score = -VALUE_INFINITE;
                            false
                        }
                    };
                    if flip && self.pv_idx == 0 {
                        self.shared.best_move_changes[self.id].fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            if value > best_value {
                best_value = value;

                if value > alpha {
                    best_move = Some(m);

                    if pv_node && !root_node {
                        pv.clear();
                        pv.push(m);
                        pv.extend_from_slice(&child_pv);
                    }

                    if value >= beta {
                        self.frame_mut(ply).cutoff_cnt +=
                            tt_move.is_none() as i32 + (extension < 2) as i32;
                        break;
                    }

                    // A PV improvement without a cutoff shrinks the
                    // remaining depth
                    if depth > 1 && beta < 14362 && value > -12393 {
                        depth -= if depth > 3 && depth < 12 { 2 } else { 1 };
                    }
                    debug_assert!(depth > 0);
                    alpha = value;
                }
            }

            if Some(m) != best_move {
                if capture && captures_searched.len() < 32 {
                    captures_searched.push(m);
                } else if !capture && quiets_searched.len() < 64 {
                    quiets_searched.push(m);
                }
            }
        }

        // Step 22. Terminal handling and statistics
        if move_count == 0 {
            best_value = if excluded_move.is_some() {
                alpha
            } else if in_check {
                mated_in(ply)
            } else {
                VALUE_DRAW
            };
        } else if let Some(bm) = best_move {
            self.update_all_stats(
                ply,
                bm,
                best_value,
                beta,
                prev_sq,
                &quiets_searched,
                &captures_searched,
                depth,
            );
        } else if let Some(sq) = prev_sq {
            let prev_frame = *self.frame(ply - 1);
            if !prior_capture {
                // Every move failed low: reward the prior move that led
                // here.
                let mult = (depth > 5) as i32
                    + (pv_node || cut_node) as i32
                    + (best_value < alpha - 113 * depth) as i32
                    + (prev_frame.move_count > 12) as i32;
                let bonus = stat_bonus(&self.params, depth) * mult;
                let piece = match (self.pos.piece_on(sq), self.pos.color_on(sq)) {
                    (Some(p), Some(c)) => piece_idx(c, p),
                    _ => history::NO_PIECE_IDX,
                };
                self.update_prev_continuation(ply - 1, piece, sq.to_index(), bonus);
                if let FrameMove::Real(prev_move) = prev_frame.current_move {
                    self.hists.main.update(!us, prev_move, bonus / 2);
                    if self.pos.piece_on(sq).map_or(false, |p| p != Piece::Pawn)
                        && prev_move.get_promotion().is_none()
                    {
                        let pawn_index = PawnHistory::index(&self.pos);
                        self.hists.pawn.update(pawn_index, piece, sq.to_index(), bonus / 2);
                    }
                }
            } else if let Some(victim) = self.pos.captured_piece() {
                // The prior capture refuted everything here
                let piece = match (self.pos.piece_on(sq), self.pos.color_on(sq)) {
                    (Some(p), Some(c)) => piece_idx(c, p),
                    _ => history::NO_PIECE_IDX,
                };
                self.hists.capture.update(
                    piece,
                    sq.to_index(),
                    victim.to_index(),
                    stat_bonus(&self.params, depth),
                );
            }
        } else if let Some(ttm) = tt_move {
            if !all_node {
                self.hists
                    .main
                    .update(us, ttm, stat_bonus(&self.params, depth) / 4);
            }
        }

        // Soften a non-decisive fail-high towards beta at non-PV nodes
        if !pv_node && best_value >= beta && !is_decisive(best_value) {
            best_value = (best_value * depth + beta) / (depth + 1);
        }

        if pv_node {
            best_value = best_value.min(max_value);
        }

        // Inherit ttPv from the parent on a fail low at reasonable depth
        if best_value <= alpha && self.frame(ply - 1).tt_pv && depth > 3 {
            self.frame_mut(ply).tt_pv = true;
        }

        if excluded_move.is_none() && !(root_node && self.pv_idx > 0) {
            let bound = if best_value >= beta {
                Bound::LOWER
            } else if pv_node && best_move.is_some() {
                Bound::EXACT
            } else {
                Bound::UPPER
            };
            self.tt.store(
                tt_writer,
                pos_key,
                value_to_tt(best_value, ply),
                self.frame(ply).tt_pv,
                bound,
                depth,
                best_move.map(Move16::encode).unwrap_or(Move16::NONE),
                raw_eval,
            );
        }

        // Adjust the correction histories with what the search learnt
        // about the static eval
        if !in_check
            && best_move.map_or(true, |m| !self.pos.capture_stage(m))
            && is_valid(static_eval)
            && ((best_value < static_eval && best_value < beta)
                || (best_value > static_eval && best_move.is_some()))
        {
            let limit = self.params.corr_limit;
            let bonus = ((best_value - static_eval) * depth / 8)
                .clamp(-limit / 4, limit / 4);
            self.update_correction_histories(ply, bonus);
        }

        debug_assert!(best_value > -VALUE_INFINITE && best_value < VALUE_INFINITE);
        best_value
    }
}

/// Material/ply win-rate model used for the optional WDL report.
fn win_rate_model(v: Value, ply: u32) -> (i32, i32, i32) {
    let m = (ply as f64 / 2.0 + 1.0).min(240.0) / 64.0;
    let a = ((-1.06249702 * m + 7.42016937) * m + 0.89425629) * m + 348.60356174;
    let b = ((-5.33122190 * m + 39.57831533) * m - 90.84473771) * m + 123.40620748;
    let x = (v as f64).clamp(-4000.0, 4000.0);
    let win = (1000.0 / (1.0 + ((a - x) / b).exp())).round() as i32;
    let loss = (1000.0 / (1.0 + ((a + x) / b).exp())).round() as i32;
    let draw = 1000 - win - loss;
    (win, draw, loss)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draw_value_noise_depends_on_node_parity_only() {
        for nodes in 0..64u64 {
            let v = value_draw(nodes);
            assert!(v == VALUE_DRAW - 1 || v == VALUE_DRAW + 1);
            assert_eq!(v, VALUE_DRAW - 1 + (nodes & 0x2) as Value);
        }
    }

    #[test]
    fn stat_bonus_is_monotone_and_clamped() {
        let params = SearchParams::default();
        let mut prev = stat_bonus(&params, 1);
        for d in 2..60 {
            let b = stat_bonus(&params, d);
            assert!(b >= prev);
            assert!(b <= params.stat_bonus_max);
            prev = b;
        }
    }

    #[test]
    fn futility_move_count_grows_with_depth() {
        for d in 1..20 {
            assert!(futility_move_count(false, d) < futility_move_count(false, d + 1));
            assert_eq!(futility_move_count(true, d), 3 + d * d);
            assert_eq!(futility_move_count(false, d), (3 + d * d) / 2);
        }
    }

    #[test]
    fn mate_scores_format_as_moves() {
        assert_eq!(uci_score(mate_in(1)), UciScore::Mate(1));
        assert_eq!(uci_score(mate_in(3)), UciScore::Mate(2));
        assert_eq!(uci_score(mated_in(2)), UciScore::Mate(-1));
        assert_eq!(uci_score(150), UciScore::Cp(150));
    }

    #[test]
    fn skill_level_from_elo_is_fractional() {
        let weak = Skill::new(20, 1320);
        assert!(weak.enabled());
        assert!(weak.level < 1.0);
        let strong = Skill::new(20, 3190);
        assert!(strong.level > 18.0);
        let off = Skill::new(20, 0);
        assert!(!off.enabled());
    }

    #[test]
    fn win_rate_model_sums_to_thousand() {
        for (v, ply) in [(0, 20), (150, 40), (-300, 80), (1000, 10)] {
            let (w, d, l) = win_rate_model(v, ply);
            assert_eq!(w + d + l, 1000);
            assert!(w >= 0 && d >= 0 && l >= 0);
        }
    }
}

/// Bundle of state handed from `search` into the move loop, so the borrow
/// of the pv buffer can be threaded through explicitly.
struct SearchMovesArgs<'a> {
    ply: i32,
    alpha: Value,
    beta: Value,
    depth: Depth,
    cut_node: bool,
    pv: &'a mut Vec<ChessMove>,
    in_check: bool,
    prior_capture: bool,
    prev_sq: Option<Square>,
    excluded_move: Option<ChessMove>,
    tt_move: Option<ChessMove>,
    tt_capture: bool,
    tt_hit: bool,
    tt_value: Value,
    tt_depth: Depth,
    tt_bound: Bound,
    tt_writer: tt::TtWriter,
    pos_key: u64,
    raw_eval: Value,
    improving: bool,
    correction: i32,
    best_value: Value,
    max_value: Value,
    best_move: Option<ChessMove>,
}

// src/search/lazy_smp.rs
//
// Thread pool for the lazy SMP search: one main worker plus helpers, all
// running the same iterative deepening on private state, sharing only the
// transposition table and a handful of relaxed atomic flags. There are no
// locks on the hot path; the single mutex guards worker ownership between
// searches and the condvar signals search completion to the UCI thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chess::ChessMove;
use parking_lot::{Condvar, Mutex};

use crate::position::Position;
use crate::search::params::SearchParams;
use crate::search::syzygy::{SyzygyTb, TbConfig};
use crate::search::time::{SearchLimits, TimeManager};
use crate::search::tt::TranspositionTable;
use crate::search::{RootMove, SearchCallbacks, UciScore, Worker};
use crate::types::{is_win, Move16, VALUE_DRAW, VALUE_MATE_IN_MAX_PLY};

/// Flags and counters shared by every worker. All accesses are relaxed;
/// the search tolerates stale reads within one poll interval.
pub struct SharedContext {
    pub stop: AtomicBool,
    pub stop_on_ponderhit: AtomicBool,
    pub ponder: AtomicBool,
    pub increase_depth: AtomicBool,
    pub aborted_search: AtomicBool,
    pub nodes: Vec<AtomicU64>,
    pub tb_hits: Vec<AtomicU64>,
    pub best_move_changes: Vec<AtomicU64>,
}

impl SharedContext {
    fn new(threads: usize) -> SharedContext {
        SharedContext {
            stop: AtomicBool::new(false),
            stop_on_ponderhit: AtomicBool::new(false),
            ponder: AtomicBool::new(false),
            increase_depth: AtomicBool::new(true),
            aborted_search: AtomicBool::new(false),
            nodes: (0..threads).map(|_| AtomicU64::new(0)).collect(),
            tb_hits: (0..threads).map(|_| AtomicU64::new(0)).collect(),
            best_move_changes: (0..threads).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn nodes_searched(&self) -> u64 {
        self.nodes.iter().map(|n| n.load(Ordering::Relaxed)).sum()
    }

    pub fn tb_hits_total(&self) -> u64 {
        self.tb_hits.iter().map(|n| n.load(Ordering::Relaxed)).sum()
    }

    /// Drains the per-worker best-move-change counters.
    pub fn take_best_move_changes(&self) -> u64 {
        self.best_move_changes
            .iter()
            .map(|n| n.swap(0, Ordering::Relaxed))
            .sum()
    }

    fn reset_counters(&self) {
        for n in &self.nodes {
            n.store(0, Ordering::Relaxed);
        }
        for n in &self.tb_hits {
            n.store(0, Ordering::Relaxed);
        }
        for n in &self.best_move_changes {
            n.store(0, Ordering::Relaxed);
        }
    }
}

/// Engine options the pool consumes; the UCI layer owns the parsing.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub threads: usize,
    pub hash_mb: usize,
    pub multi_pv: usize,
    pub skill_level: i32,
    pub limit_strength: bool,
    pub uci_elo: i32,
    pub show_wdl: bool,
    pub move_overhead: i64,
    pub slow_mover: i64,
    pub nodestime: i64,
    pub ponder: bool,
    pub syzygy_path: String,
    pub syzygy_probe_depth: i32,
    pub syzygy_50_move_rule: bool,
    pub syzygy_probe_limit: u32,
}

impl Default for EngineOptions {
    fn default() -> EngineOptions {
        EngineOptions {
            threads: 1,
            hash_mb: 16,
            multi_pv: 1,
            skill_level: 20,
            limit_strength: false,
            uci_elo: 1320,
            show_wdl: false,
            move_overhead: 10,
            slow_mover: 100,
            nodestime: 0,
            ponder: false,
            syzygy_path: String::new(),
            syzygy_probe_depth: 1,
            syzygy_50_move_rule: true,
            syzygy_probe_limit: 7,
        }
    }
}

pub struct ThreadPool {
    pub options: EngineOptions,
    params: SearchParams,
    shared: Arc<SharedContext>,
    tt: Arc<TranspositionTable>,
    tb: Option<Arc<SyzygyTb>>,
    workers: Arc<Mutex<Vec<Worker>>>,
    searching: Arc<(Mutex<bool>, Condvar)>,
    callbacks: Arc<SearchCallbacks>,
    available_nodes: Arc<AtomicI64>,
}

impl ThreadPool {
    pub fn new(callbacks: SearchCallbacks) -> ThreadPool {
        let options = EngineOptions::default();
        let params = SearchParams::default();
        let shared = Arc::new(SharedContext::new(options.threads));
        let tt = Arc::new(TranspositionTable::new(options.hash_mb));
        let workers = Arc::new(Mutex::new(Self::build_workers(
            options.threads,
            &shared,
            &tt,
            &params,
        )));
        ThreadPool {
            options,
            params,
            shared,
            tt,
            tb: None,
            workers,
            searching: Arc::new((Mutex::new(false), Condvar::new())),
            callbacks: Arc::new(callbacks),
            available_nodes: Arc::new(AtomicI64::new(0)),
        }
    }

    fn build_workers(
        threads: usize,
        shared: &Arc<SharedContext>,
        tt: &Arc<TranspositionTable>,
        params: &SearchParams,
    ) -> Vec<Worker> {
        (0..threads)
            .map(|id| Worker::new(id, threads, shared.clone(), tt.clone(), params.clone()))
            .collect()
    }

    pub fn set_threads(&mut self, threads: usize) {
        self.wait_for_search_finished();
        self.options.threads = threads.max(1);
        self.shared = Arc::new(SharedContext::new(self.options.threads));
        *self.workers.lock() =
            Self::build_workers(self.options.threads, &self.shared, &self.tt, &self.params);
    }

    pub fn set_hash(&mut self, mb: usize) {
        self.wait_for_search_finished();
        self.options.hash_mb = mb.max(1);
        self.tt = Arc::new(TranspositionTable::new(self.options.hash_mb));
    }

    /// Enables or disables the move-time network. Workers carry their own
    /// parameter copies, so they are rebuilt.
    pub fn set_time_net(&mut self, enabled: bool) {
        self.wait_for_search_finished();
        self.params.use_time_net = enabled;
        *self.workers.lock() =
            Self::build_workers(self.options.threads, &self.shared, &self.tt, &self.params);
    }

    pub fn set_syzygy_path(&mut self, path: &str) {
        self.wait_for_search_finished();
        self.options.syzygy_path = path.to_string();
        self.tb = if path.is_empty() || path == "<empty>" {
            None
        } else {
            SyzygyTb::new(path).ok().map(Arc::new)
        };
    }

    /// "ucinewgame": drop all learned state.
    pub fn clear(&mut self) {
        self.wait_for_search_finished();
        self.tt.clear();
        self.tt.new_search();
        self.available_nodes.store(0, Ordering::Relaxed);
        for w in self.workers.lock().iter_mut() {
            w.clear();
        }
    }

    pub fn nodes_searched(&self) -> u64 {
        self.shared.nodes_searched()
    }

    pub fn tb_hits(&self) -> u64 {
        self.shared.tb_hits_total()
    }

    /// "stop": cooperative cancellation.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
    }

    /// "ponderhit": the predicted move was played. Either the search
    /// already used its budget and stops now, or it converts to a normal
    /// search on its own clock.
    pub fn ponderhit(&self) {
        if self.shared.stop_on_ponderhit.load(Ordering::Relaxed) {
            self.shared.stop.store(true, Ordering::Relaxed);
        } else {
            self.shared.ponder.store(false, Ordering::Relaxed);
        }
    }

    pub fn wait_for_search_finished(&self) {
        let (lock, cvar) = &*self.searching;
        let mut searching = lock.lock();
        while *searching {
            cvar.wait(&mut searching);
        }
    }

    /// Launches a search. Returns immediately; the coordinator thread
    /// drives the workers and emits "bestmove" through the callbacks.
    pub fn start_searching(&mut self, mut root: Position, mut limits: SearchLimits) {
        self.wait_for_search_finished();

        let us = root.side_to_move();
        self.shared.stop.store(false, Ordering::Relaxed);
        self.shared.stop_on_ponderhit.store(false, Ordering::Relaxed);
        self.shared.ponder.store(limits.ponder, Ordering::Relaxed);
        self.shared.increase_depth.store(true, Ordering::Relaxed);
        self.shared.aborted_search.store(false, Ordering::Relaxed);
        self.shared.reset_counters();
        self.tt.new_search();

        // Build the root move list, honouring "searchmoves"
        let legal = root.legal_moves();
        let allowed: Vec<ChessMove> = if limits.searchmoves.is_empty() {
            legal
        } else {
            legal
                .into_iter()
                .filter(|m| limits.searchmoves.contains(m))
                .collect()
        };

        if allowed.is_empty() {
            let score = if root.in_check() {
                UciScore::Mate(0)
            } else {
                UciScore::Cp(VALUE_DRAW)
            };
            (self.callbacks.on_update_no_moves)(score);
            (self.callbacks.on_bestmove)(None, None);
            return;
        }

        let mut root_moves: Vec<RootMove> = allowed.iter().map(|&m| RootMove::new(m)).collect();

        // Rank the root moves with the tablebases when possible
        let mut root_in_tb = false;
        let mut tb_config = TbConfig {
            cardinality: self.options.syzygy_probe_limit,
            probe_depth: self.options.syzygy_probe_depth,
            use_rule50: self.options.syzygy_50_move_rule,
        };
        if let Some(tb) = &self.tb {
            tb_config.cardinality = tb_config.cardinality.min(tb.max_pieces());
            let mut ranks = Vec::new();
            if root.piece_count() <= tb_config.cardinality
                && tb.rank_root_moves(&mut root, &allowed, &mut ranks)
            {
                root_in_tb = true;
                for (rm, (rank, score)) in root_moves.iter_mut().zip(&ranks) {
                    rm.tb_rank = *rank;
                    rm.tb_score = *score;
                }
                root_moves.sort_by_key(|rm| -rm.tb_rank);
                // With DTZ ranking in hand, probes during the search add
                // nothing unless we are losing
                if root_moves[0].tb_score > VALUE_DRAW {
                    tb_config.cardinality = 0;
                }
            }
        }

        let mut avail = self.available_nodes.load(Ordering::Relaxed);
        let tm = TimeManager::new(
            &mut limits,
            us,
            root.game_ply(),
            self.options.move_overhead,
            self.options.slow_mover,
            self.options.nodestime,
            self.options.ponder,
            &mut avail,
            &self.params,
        );
        self.available_nodes.store(avail, Ordering::Relaxed);

        let skill_level = if self.options.limit_strength {
            self.options.skill_level.min(19)
        } else {
            self.options.skill_level
        };
        let uci_elo = if self.options.limit_strength { self.options.uci_elo } else { 0 };

        {
            let mut workers = self.workers.lock();
            for w in workers.iter_mut() {
                w.prepare(
                    root.clone(),
                    root_moves.clone(),
                    limits.clone(),
                    tm.clone(),
                    self.tt.clone(),
                    self.tb.clone(),
                    tb_config.clone(),
                    root_in_tb,
                    self.options.multi_pv,
                    skill_level,
                    uci_elo,
                    self.options.show_wdl,
                    if w.id == 0 { Some(self.callbacks.clone()) } else { None },
                );
            }
        }

        let (lock, _) = &*self.searching;
        *lock.lock() = true;

        let workers = self.workers.clone();
        let shared = self.shared.clone();
        let searching = self.searching.clone();
        let callbacks = self.callbacks.clone();
        let tt = self.tt.clone();
        let available_nodes = self.available_nodes.clone();
        let infinite = limits.infinite;
        let fixed_depth = limits.depth > 0;
        let nodestime = self.options.nodestime;
        let inc_us = limits.inc[us.to_index()];
        let multi_pv = self.options.multi_pv;
        let skill_enabled = skill_level < 20 || uci_elo != 0;

        thread::spawn(move || {
            let mut guard = workers.lock();

            thread::scope(|s| {
                let (main, helpers) = guard.split_at_mut(1);
                for w in helpers.iter_mut() {
                    s.spawn(move || w.iterative_deepening());
                }
                main[0].iterative_deepening();

                // The protocol forbids emitting bestmove while pondering or
                // in an infinite search: wait here for "stop"/"ponderhit".
                while !shared.stop.load(Ordering::Relaxed)
                    && (shared.ponder.load(Ordering::Relaxed) || infinite)
                {
                    thread::sleep(Duration::from_millis(1));
                }

                shared.stop.store(true, Ordering::Relaxed);
            });

            if nodestime != 0 {
                available_nodes
                    .fetch_add(inc_us - shared.nodes_searched() as i64, Ordering::Relaxed);
            }

            let best = if multi_pv == 1 && !fixed_depth && !skill_enabled {
                best_thread(&guard)
            } else {
                0
            };

            let (best_score, best_avg) = {
                let rm = &guard[best].root_moves[0];
                (rm.score, rm.average_score)
            };
            guard[0].best_previous_score = best_score;
            guard[0].best_previous_average_score = best_avg;

            // A new best thread means its PV was never printed
            if best != 0 {
                let depth = guard[best].completed_depth;
                guard[best].callbacks = Some(callbacks.clone());
                guard[best].emit_pv(depth, multi_pv);
                guard[best].callbacks = None;
            }

            let best_move = guard[best].root_moves[0].pv[0];
            let ponder_move = match guard[best].root_moves[0].pv.get(1) {
                Some(&m) => Some(m),
                None => extract_ponder_from_tt(&mut guard[best], &tt, best_move),
            };
            (callbacks.on_bestmove)(Some(best_move), ponder_move);

            drop(guard);

            let (lock, cvar) = &*searching;
            *lock.lock() = false;
            cvar.notify_all();
        });
    }
}

/// Vote among the workers for the most trustworthy result: deeper searches
/// of better scores get more votes, proven wins are taken on depth.
fn best_thread(workers: &[Worker]) -> usize {
    if workers.len() == 1 {
        return 0;
    }

    let min_score = workers
        .iter()
        .map(|w| w.root_moves[0].score)
        .min()
        .unwrap_or(VALUE_DRAW);

    let mut votes: HashMap<u16, i64> = HashMap::new();
    for w in workers {
        let rm = &w.root_moves[0];
        *votes.entry(Move16::encode(rm.pv[0]).0).or_insert(0) +=
            (rm.score - min_score + 14) as i64 * w.completed_depth as i64;
    }

    let mut best = 0;
    for (i, w) in workers.iter().enumerate().skip(1) {
        let best_rm = &workers[best].root_moves[0];
        let rm = &w.root_moves[0];

        let better = if best_rm.score >= VALUE_MATE_IN_MAX_PLY {
            // Proven mates: prefer the shortest
            rm.score > best_rm.score
        } else if is_win(rm.score) && !is_win(best_rm.score) {
            true
        } else {
            !is_win(best_rm.score)
                && votes.get(&Move16::encode(rm.pv[0]).0).copied().unwrap_or(0)
                    > votes.get(&Move16::encode(best_rm.pv[0]).0).copied().unwrap_or(0)
        };
        if better {
            best = i;
        }
    }
    best
}

/// When the PV holds a single move, fish a ponder move out of the
/// transposition table so the GUI has something to think about.
fn extract_ponder_from_tt(
    worker: &mut Worker,
    tt: &TranspositionTable,
    best_move: ChessMove,
) -> Option<ChessMove> {
    if !worker.pos.legal(best_move) {
        return None;
    }
    worker.pos.do_move(best_move);
    let (hit, data, _) = tt.probe(worker.pos.key());
    let ponder = if hit && data.mv != Move16::NONE {
        worker.pos.resolve_move16(data.mv)
    } else {
        None
    };
    worker.pos.undo_move();
    if let Some(m) = ponder {
        worker.root_moves[0].pv.push(m);
    }
    ponder
}

// src/search/time.rs
//
// Time management: converts the clock state received with "go" into an
// optimum (soft) and maximum (hard) budget for the current move. The
// per-iteration stop decision that combines these budgets with search
// stability lives in the iterative deepening loop.

use std::time::Instant;

use chess::{ChessMove, Color};

use crate::search::params::SearchParams;

/// Everything the "go" command can constrain the search with.
#[derive(Clone, Debug)]
pub struct SearchLimits {
    /// Remaining clock per side, milliseconds.
    pub time: [i64; 2],
    /// Increment per side, milliseconds.
    pub inc: [i64; 2],
    pub movestogo: i32,
    pub movetime: i64,
    pub depth: i32,
    pub nodes: u64,
    pub mate: i32,
    pub infinite: bool,
    pub perft: u32,
    pub ponder: bool,
    pub searchmoves: Vec<ChessMove>,
    pub start_time: Instant,
}

impl Default for SearchLimits {
    fn default() -> SearchLimits {
        SearchLimits {
            time: [0, 0],
            inc: [0, 0],
            movestogo: 0,
            movetime: 0,
            depth: 0,
            nodes: 0,
            mate: 0,
            infinite: false,
            perft: 0,
            ponder: false,
            searchmoves: Vec::new(),
            start_time: Instant::now(),
        }
    }
}

impl SearchLimits {
    pub fn use_time_management(&self, us: Color) -> bool {
        self.time[us.to_index()] != 0
            && self.movetime == 0
            && self.depth == 0
            && self.nodes == 0
            && self.mate == 0
            && !self.infinite
            && self.perft == 0
    }
}

#[derive(Clone)]
pub struct TimeManager {
    start_time: Instant,
    optimum_ms: f64,
    maximum_ms: f64,
    /// Nodes-per-millisecond conversion, 0 when real time is used.
    npmsec: i64,
    active: bool,
}

impl TimeManager {
    /// Computes the move budget. With `npmsec` set, the remaining "time" is
    /// measured in nodes instead of milliseconds ('nodes as time' mode);
    /// `available_nodes` carries the node budget across the moves of a game.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        limits: &mut SearchLimits,
        us: Color,
        ply: u32,
        move_overhead: i64,
        slow_mover: i64,
        npmsec: i64,
        ponder_option: bool,
        available_nodes: &mut i64,
        params: &SearchParams,
    ) -> TimeManager {
        let active = limits.use_time_management(us);
        if !active {
            return TimeManager {
                start_time: limits.start_time,
                optimum_ms: 0.0,
                maximum_ms: 0.0,
                npmsec: 0,
                active: false,
            };
        }

        if npmsec != 0 {
            if *available_nodes == 0 {
                *available_nodes = npmsec * limits.time[us.to_index()];
            }
            limits.time[us.to_index()] = *available_nodes;
            limits.inc[us.to_index()] *= npmsec;
        }

        let time = limits.time[us.to_index()].max(1) as f64;
        let inc = limits.inc[us.to_index()] as f64;
        let overhead = move_overhead as f64;
        let mtg = if limits.movestogo > 0 { limits.movestogo.min(50) } else { 50 } as f64;

        let mut time_left =
            (time + inc * (mtg - 1.0) - overhead * (2.0 + mtg)).max(1.0);
        time_left = time_left * slow_mover as f64 / 100.0;

        let (opt_scale, max_scale);
        if limits.movestogo == 0 {
            // Sudden death (plus increment)
            let log_time = (time / 1000.0).max(1e-3).log10();
            let (c1, c2, c3) = params.tm_opt_constant;
            let opt_constant = (c1 + c2 * log_time).min(c3);
            let (d1, d2, d3) = params.tm_max_constant;
            let max_constant = (d1 + d2 * log_time).max(d3);
            let (inc_weight, extra_lo, extra_hi) = params.tm_opt_extra;
            let opt_extra = (1.0 + inc_weight * inc / time).clamp(extra_lo, extra_hi);

            opt_scale = ((params.tm_opt_scale_base
                + (ply as f64 + params.tm_opt_scale_ply_add).powf(params.tm_opt_scale_pow)
                    * opt_constant)
                .min(params.tm_opt_scale_cap * time / time_left))
                * opt_extra;
            max_scale =
                (max_constant + ply as f64 / params.tm_max_ply_div).min(params.tm_max_scale_cap);
        } else {
            // x moves in y time
            opt_scale = ((params.tm_mtg_opt_base + ply as f64 / params.tm_mtg_opt_ply_div) / mtg)
                .min(params.tm_mtg_opt_cap * time / time_left);
            max_scale = (params.tm_mtg_max_base + params.tm_mtg_max_mult * mtg)
                .min(params.tm_mtg_max_cap);
        }

        let optimum = opt_scale * time_left;
        let maximum = (params.tm_max_time_frac * time - overhead).min(max_scale * optimum)
            - params.tm_max_offset_ms;
        let optimum = if ponder_option { optimum + optimum / 4.0 } else { optimum };

        TimeManager {
            start_time: limits.start_time,
            optimum_ms: optimum.max(1.0),
            maximum_ms: maximum.max(1.0),
            npmsec,
            active: true,
        }
    }

    #[inline]
    pub fn active(&self) -> bool {
        self.active
    }

    /// Elapsed budget units: milliseconds, or searched nodes when running
    /// in 'nodes as time' mode.
    #[inline]
    pub fn elapsed(&self, nodes: u64) -> f64 {
        if self.npmsec != 0 {
            nodes as f64
        } else {
            self.start_time.elapsed().as_secs_f64() * 1000.0
        }
    }

    /// Wall-clock milliseconds since the search started, for reporting.
    #[inline]
    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    #[inline]
    pub fn optimum(&self) -> f64 {
        self.optimum_ms
    }

    #[inline]
    pub fn maximum(&self) -> f64 {
        self.maximum_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(limits: &mut SearchLimits, ply: u32) -> TimeManager {
        let mut avail = 0;
        TimeManager::new(
            limits,
            Color::White,
            ply,
            10,
            100,
            0,
            false,
            &mut avail,
            &SearchParams::default(),
        )
    }

    #[test]
    fn budgets_are_positive_and_ordered() {
        let mut limits = SearchLimits {
            time: [60_000, 60_000],
            inc: [600, 600],
            ..Default::default()
        };
        let tm = manager(&mut limits, 20);
        assert!(tm.active());
        assert!(tm.optimum() > 0.0);
        assert!(tm.maximum() >= tm.optimum() * 0.9);
        assert!(tm.maximum() < 60_000.0);
    }

    #[test]
    fn moves_to_go_spreads_the_clock() {
        let mut short = SearchLimits {
            time: [10_000, 10_000],
            movestogo: 2,
            ..Default::default()
        };
        let mut long = SearchLimits {
            time: [10_000, 10_000],
            movestogo: 40,
            ..Default::default()
        };
        let near = manager(&mut short, 30);
        let far = manager(&mut long, 30);
        assert!(near.optimum() > far.optimum());
    }

    #[test]
    fn fixed_depth_disables_management() {
        let mut limits = SearchLimits {
            time: [60_000, 60_000],
            depth: 10,
            ..Default::default()
        };
        let tm = manager(&mut limits, 0);
        assert!(!tm.active());
    }

    #[test]
    fn nodestime_counts_nodes_as_elapsed() {
        let mut limits = SearchLimits {
            time: [1_000, 1_000],
            ..Default::default()
        };
        let mut avail = 0;
        let tm = TimeManager::new(
            &mut limits,
            Color::White,
            0,
            10,
            100,
            1000,
            false,
            &mut avail,
            &SearchParams::default(),
        );
        assert_eq!(avail, 1_000_000);
        assert_eq!(tm.elapsed(12345), 12345.0);
    }
}

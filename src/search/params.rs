// src/search/params.rs
//
// The numeric scaling parameters of the search and time-management
// formulas live here so they can be retuned without touching the
// algorithms. Defaults follow the values the search was tuned with.

#[derive(Clone, Debug)]
pub struct SearchParams {
    // Razoring
    pub razor_base: i32,
    pub razor_depth_sq: i32,

    // Reverse futility (static null move)
    pub rfp_max_depth: i32,
    pub futility_mult: i32,
    pub futility_no_tt_cut: i32,
    pub rfp_stat_score_div: i32,

    // Null move
    pub nmp_stat_score_max: i32,
    pub nmp_beta_mult: i32,
    pub nmp_beta_base: i32,
    pub nmp_eval_div: i32,
    pub nmp_eval_red_max: i32,
    pub nmp_base_red: i32,
    pub nmp_verify_depth: i32,

    // Internal iterative reductions
    pub iir_pv_reduction: i32,
    pub iir_cut_min_depth: i32,

    // ProbCut
    pub probcut_margin: i32,
    pub probcut_improving: i32,
    pub probcut_incheck_margin: i32,

    // Shallow-depth pruning
    pub fp_capt_base: i32,
    pub fp_capt_mult: i32,
    pub see_capt_mult: i32,
    pub cont_prune_mult: i32,
    pub cont_prune_max_lmr_depth: i32,
    pub hist_lmr_div: i32,
    pub fp_base: i32,
    pub fp_mult: i32,
    pub fp_max_lmr_depth: i32,
    pub see_quiet_mult: i32,

    // Singular extensions
    pub se_depth_base: i32,
    pub se_completed_depth: i32,
    pub se_margin_mult: i32,
    pub se_margin_ttpv: i32,
    pub se_double_margin: i32,
    pub se_triple_margin: i32,

    // Capture extension at the previous destination square
    pub recapture_ext_hist: i32,

    // Reduction adjustments, in 1024ths of a ply
    pub lmr_base: f64,
    pub lmr_scale: f64,
    pub red_delta_mult: i32,
    pub red_base: i32,
    pub red_adjust_base: i32,
    pub red_corr_div: i32,
    pub stat_score_quiet_base: i32,
    pub stat_score_capt_base: i32,
    pub stat_score_red_mult: i32,
    pub lmr_deeper_base: i32,
    pub lmr_shallower_margin: i32,
    pub full_depth_red_threshold: i32,

    // Quiescence
    pub qs_futility_margin: i32,
    pub qs_see_margin: i32,

    // History bonuses and limits
    pub stat_bonus_mult: i32,
    pub stat_bonus_sub: i32,
    pub stat_bonus_max: i32,
    pub stat_malus_mult: i32,
    pub stat_malus_sub: i32,
    pub stat_malus_max: i32,
    pub eval_hist_bonus_mult: i32,
    pub eval_hist_bonus_max: i32,

    pub main_history_limit: i32,
    pub low_ply_history_limit: i32,
    pub capture_history_limit: i32,
    pub pawn_history_limit: i32,
    pub cont_history_limit: i32,

    // Correction history
    pub corr_limit: i32,
    pub corr_weight_pawn: i32,
    pub corr_weight_minor: i32,
    pub corr_weight_major: i32,
    pub corr_weight_non_pawn: i32,
    pub corr_weight_cont: i32,
    pub corr_value_div: i32,

    // Aspiration windows
    pub asp_delta_base: i32,
    pub asp_delta_div: i32,
    pub optimism_mult: i32,
    pub optimism_add: i32,

    // Time management: sudden death
    pub tm_opt_constant: (f64, f64, f64),
    pub tm_max_constant: (f64, f64, f64),
    pub tm_opt_scale_pow: f64,
    pub tm_opt_scale_base: f64,
    pub tm_opt_scale_ply_add: f64,
    pub tm_opt_scale_cap: f64,
    pub tm_opt_extra: (f64, f64, f64),
    pub tm_max_scale_cap: f64,
    pub tm_max_ply_div: f64,

    // Time management: moves in time
    pub tm_mtg_opt_base: f64,
    pub tm_mtg_opt_ply_div: f64,
    pub tm_mtg_opt_cap: f64,
    pub tm_mtg_max_base: f64,
    pub tm_mtg_max_mult: f64,
    pub tm_mtg_max_cap: f64,

    // Time management: hard cap and per-iteration decision
    pub tm_max_time_frac: f64,
    pub tm_max_offset_ms: f64,
    pub tm_single_reply_ms: f64,
    pub tm_net_divisor: f64,
    pub use_time_net: bool,
}

impl Default for SearchParams {
    fn default() -> SearchParams {
        SearchParams {
            razor_base: 456,
            razor_depth_sq: 252,

            rfp_max_depth: 9,
            futility_mult: 140,
            futility_no_tt_cut: 23,
            rfp_stat_score_div: 306,

            nmp_stat_score_max: 17329,
            nmp_beta_mult: 21,
            nmp_beta_base: 258,
            nmp_eval_div: 173,
            nmp_eval_red_max: 6,
            nmp_base_red: 4,
            nmp_verify_depth: 16,

            iir_pv_reduction: 3,
            iir_cut_min_depth: 8,

            probcut_margin: 168,
            probcut_improving: 61,
            probcut_incheck_margin: 413,

            fp_capt_base: 197,
            fp_capt_mult: 248,
            see_capt_mult: 205,
            cont_prune_mult: 3832,
            cont_prune_max_lmr_depth: 6,
            hist_lmr_div: 7011,
            fp_base: 112,
            fp_mult: 138,
            fp_max_lmr_depth: 12,
            see_quiet_mult: 27,

            se_depth_base: 4,
            se_completed_depth: 22,
            se_margin_mult: 82,
            se_margin_ttpv: 65,
            se_double_margin: 21,
            se_triple_margin: 76,

            recapture_ext_hist: 4000,

            lmr_base: 20.57,
            lmr_scale: 0.5,
            red_delta_mult: 1073,
            red_base: 1372,
            red_adjust_base: 307,
            red_corr_div: 32768,
            stat_score_quiet_base: 4006,
            stat_score_capt_base: 4653,
            stat_score_red_mult: 1287,
            lmr_deeper_base: 43,
            lmr_shallower_margin: 9,
            full_depth_red_threshold: 3560,

            qs_futility_margin: 200,
            qs_see_margin: -95,

            stat_bonus_mult: 336,
            stat_bonus_sub: 547,
            stat_bonus_max: 1561,
            stat_malus_mult: 336,
            stat_malus_sub: 547,
            stat_malus_max: 1561,
            eval_hist_bonus_mult: 18,
            eval_hist_bonus_max: 1817,

            main_history_limit: 7183,
            low_ply_history_limit: 7183,
            capture_history_limit: 10692,
            pawn_history_limit: 8192,
            cont_history_limit: 29952,

            corr_limit: 1024,
            corr_weight_pawn: 6245,
            corr_weight_minor: 3471,
            corr_weight_major: 3442,
            corr_weight_non_pawn: 5958,
            corr_weight_cont: 6566,
            corr_value_div: 131072,

            asp_delta_base: 10,
            asp_delta_div: 15799,
            optimism_mult: 109,
            optimism_add: 141,

            tm_opt_constant: (0.00308, 0.000319, 0.00506),
            tm_max_constant: (3.39, 3.01, 2.93),
            tm_opt_scale_pow: 0.462,
            tm_opt_scale_base: 0.0122,
            tm_opt_scale_ply_add: 2.95,
            tm_opt_scale_cap: 0.213,
            tm_opt_extra: (0.12, 1.0, 1.12),
            tm_max_scale_cap: 6.64,
            tm_max_ply_div: 12.0,

            tm_mtg_opt_base: 0.88,
            tm_mtg_opt_ply_div: 116.4,
            tm_mtg_opt_cap: 0.88,
            tm_mtg_max_base: 1.5,
            tm_mtg_max_mult: 0.11,
            tm_mtg_max_cap: 6.3,

            tm_max_time_frac: 0.84,
            tm_max_offset_ms: 10.0,
            tm_single_reply_ms: 500.0,
            tm_net_divisor: 3750.0,
            use_time_net: true,
        }
    }
}

// src/uci.rs
//
// UCI protocol handler: parses commands from the GUI, keeps the current
// position, forwards "go" to the thread pool and prints the updates the
// search core hands back through its callbacks.

use std::io::BufRead;
use std::time::Instant;

use chess::{ChessMove, Piece, ALL_SQUARES};

use crate::position::Position;
use crate::search::lazy_smp::ThreadPool;
use crate::search::time::SearchLimits;
use crate::search::{InfoFull, SearchCallbacks, UciScore};

const ENGINE_NAME: &str = "Peregrine 0.6";
const ENGINE_AUTHOR: &str = "the Peregrine developers";

pub struct UciHandler {
    pool: ThreadPool,
    pos: Position,
}

fn format_score(score: UciScore) -> String {
    match score {
        UciScore::Cp(v) => format!("cp {}", v),
        UciScore::Mate(n) => format!("mate {}", n),
    }
}

fn print_info(info: &InfoFull) {
    let mut line = format!(
        "info depth {} seldepth {} multipv {} score {}",
        info.depth,
        info.sel_depth,
        info.multipv,
        format_score(info.score)
    );
    if let Some((w, d, l)) = info.wdl {
        line.push_str(&format!(" wdl {} {} {}", w, d, l));
    }
    if info.lowerbound {
        line.push_str(" lowerbound");
    } else if info.upperbound {
        line.push_str(" upperbound");
    }
    line.push_str(&format!(
        " nodes {} nps {} hashfull {} tbhits {} time {} pv",
        info.nodes, info.nps, info.hashfull, info.tb_hits, info.time_ms
    ));
    for m in info.pv {
        line.push(' ');
        line.push_str(&m.to_string());
    }
    println!("{}", line);
}

fn parse_square(s: &[u8]) -> Option<chess::Square> {
    let file = s[0].wrapping_sub(b'a');
    let rank = s[1].wrapping_sub(b'1');
    if file > 7 || rank > 7 {
        return None;
    }
    Some(ALL_SQUARES[(rank * 8 + file) as usize])
}

fn parse_uci_move(pos: &Position, s: &str) -> Option<ChessMove> {
    if s.len() < 4 || !s.is_ascii() {
        return None;
    }
    let bytes = s.as_bytes();
    let src = parse_square(&bytes[0..2])?;
    let dst = parse_square(&bytes[2..4])?;
    let promotion = s.chars().nth(4).and_then(|c| match c {
        'q' => Some(Piece::Queen),
        'r' => Some(Piece::Rook),
        'b' => Some(Piece::Bishop),
        'n' => Some(Piece::Knight),
        _ => None,
    });
    let m = ChessMove::new(src, dst, promotion);
    if pos.legal(m) {
        Some(m)
    } else {
        None
    }
}

impl UciHandler {
    pub fn new() -> UciHandler {
        let callbacks = SearchCallbacks {
            on_update_full: Box::new(|info| print_info(info)),
            on_iter: Box::new(|depth, m, num| {
                println!("info depth {} currmove {} currmovenumber {}", depth, m, num)
            }),
            on_update_no_moves: Box::new(|score| {
                println!("info depth 0 score {}", format_score(score))
            }),
            on_bestmove: Box::new(|best, ponder| match (best, ponder) {
                (Some(b), Some(p)) => println!("bestmove {} ponder {}", b, p),
                (Some(b), None) => println!("bestmove {}", b),
                _ => println!("bestmove (none)"),
            }),
        };
        UciHandler {
            pool: ThreadPool::new(callbacks),
            pos: Position::startpos(),
        }
    }

    /// Reads commands until "quit".
    pub fn run(&mut self) -> anyhow::Result<()> {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = line?;
            if !self.handle_command(&line) {
                break;
            }
        }
        Ok(())
    }

    /// Dispatches one command line. Returns false on "quit".
    pub fn handle_command(&mut self, line: &str) -> bool {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.first() {
            Some(&"uci") => self.cmd_uci(),
            Some(&"isready") => println!("readyok"),
            Some(&"setoption") => self.cmd_setoption(&tokens[1..]),
            Some(&"ucinewgame") => {
                self.pool.clear();
                self.pos = Position::startpos();
            }
            Some(&"position") => self.cmd_position(&tokens[1..]),
            Some(&"go") => self.cmd_go(&tokens[1..]),
            Some(&"stop") => self.pool.stop(),
            Some(&"ponderhit") => self.pool.ponderhit(),
            Some(&"quit") => {
                self.pool.stop();
                self.pool.wait_for_search_finished();
                return false;
            }
            _ => (),
        }
        true
    }

    fn cmd_uci(&self) {
        println!("id name {}", ENGINE_NAME);
        println!("id author {}", ENGINE_AUTHOR);
        println!();
        println!("option name Hash type spin default 16 min 1 max 1048576");
        println!("option name Threads type spin default 1 min 1 max 512");
        println!("option name MultiPV type spin default 1 min 1 max 256");
        println!("option name Skill Level type spin default 20 min 0 max 20");
        println!("option name UCI_LimitStrength type check default false");
        println!("option name UCI_Elo type spin default 1320 min 1320 max 3190");
        println!("option name UCI_ShowWDL type check default false");
        println!("option name Move Overhead type spin default 10 min 0 max 5000");
        println!("option name Slow Mover type spin default 100 min 10 max 1000");
        println!("option name nodestime type spin default 0 min 0 max 10000");
        println!("option name Ponder type check default false");
        println!("option name TimeNet type check default true");
        println!("option name SyzygyPath type string default <empty>");
        println!("option name SyzygyProbeDepth type spin default 1 min 1 max 100");
        println!("option name Syzygy50MoveRule type check default true");
        println!("option name SyzygyProbeLimit type spin default 7 min 0 max 7");
        println!("uciok");
    }

    fn cmd_setoption(&mut self, tokens: &[&str]) {
        // setoption name <name with spaces> [value <value with spaces>]
        let mut name: Vec<&str> = Vec::new();
        let mut value: Vec<&str> = Vec::new();
        let mut mode = "";
        for &tok in tokens {
            match tok {
                "name" if mode.is_empty() => mode = "name",
                "value" => mode = "value",
                _ => match mode {
                    "name" => name.push(tok),
                    "value" => value.push(tok),
                    _ => (),
                },
            }
        }
        let name = name.join(" ");
        let value = value.join(" ");

        let as_int = || value.parse::<i64>().unwrap_or(0);
        let as_bool = || value.eq_ignore_ascii_case("true");

        match name.as_str() {
            "Hash" => self.pool.set_hash(as_int().max(1) as usize),
            "Threads" => self.pool.set_threads(as_int().max(1) as usize),
            "MultiPV" => self.pool.options.multi_pv = as_int().clamp(1, 256) as usize,
            "Skill Level" => self.pool.options.skill_level = as_int().clamp(0, 20) as i32,
            "UCI_LimitStrength" => self.pool.options.limit_strength = as_bool(),
            "UCI_Elo" => self.pool.options.uci_elo = as_int().clamp(1320, 3190) as i32,
            "UCI_ShowWDL" => self.pool.options.show_wdl = as_bool(),
            "Move Overhead" => self.pool.options.move_overhead = as_int().clamp(0, 5000),
            "Slow Mover" => self.pool.options.slow_mover = as_int().clamp(10, 1000),
            "nodestime" => self.pool.options.nodestime = as_int().clamp(0, 10000),
            "Ponder" => self.pool.options.ponder = as_bool(),
            "TimeNet" => self.pool.set_time_net(as_bool()),
            "SyzygyPath" => self.pool.set_syzygy_path(&value),
            "SyzygyProbeDepth" => {
                self.pool.options.syzygy_probe_depth = as_int().clamp(1, 100) as i32
            }
            "Syzygy50MoveRule" => self.pool.options.syzygy_50_move_rule = as_bool(),
            "SyzygyProbeLimit" => {
                self.pool.options.syzygy_probe_limit = as_int().clamp(0, 7) as u32
            }
            _ => println!("info string unknown option {}", name),
        }
    }

    fn cmd_position(&mut self, tokens: &[&str]) {
        let mut idx = 0;
        let parsed = match tokens.first() {
            Some(&"startpos") => {
                idx = 1;
                Some(Position::startpos())
            }
            Some(&"fen") => {
                let end = tokens
                    .iter()
                    .position(|&t| t == "moves")
                    .unwrap_or(tokens.len());
                let fen = tokens[1..end].join(" ");
                idx = end;
                Position::from_fen(&fen)
            }
            _ => None,
        };
        let mut pos = match parsed {
            Some(p) => p,
            None => return,
        };
        if tokens.get(idx) == Some(&"moves") {
            for &tok in &tokens[idx + 1..] {
                match parse_uci_move(&pos, tok) {
                    Some(m) => pos.do_move(m),
                    None => break,
                }
            }
        }
        self.pos = pos;
    }

    fn cmd_go(&mut self, tokens: &[&str]) {
        let mut limits = SearchLimits {
            start_time: Instant::now(),
            ..Default::default()
        };
        let mut it = tokens.iter();
        let mut searchmoves = false;
        while let Some(&tok) = it.next() {
            let num = |it: &mut std::slice::Iter<&str>| -> i64 {
                it.next().and_then(|v| v.parse().ok()).unwrap_or(0)
            };
            match tok {
                "wtime" => limits.time[0] = num(&mut it),
                "btime" => limits.time[1] = num(&mut it),
                "winc" => limits.inc[0] = num(&mut it),
                "binc" => limits.inc[1] = num(&mut it),
                "movestogo" => limits.movestogo = num(&mut it) as i32,
                "movetime" => limits.movetime = num(&mut it),
                "depth" => limits.depth = num(&mut it) as i32,
                "nodes" => limits.nodes = num(&mut it) as u64,
                "mate" => limits.mate = num(&mut it) as i32,
                "perft" => limits.perft = num(&mut it) as u32,
                "infinite" => limits.infinite = true,
                "ponder" => limits.ponder = true,
                "searchmoves" => searchmoves = true,
                _ => {
                    if searchmoves {
                        if let Some(m) = parse_uci_move(&self.pos, tok) {
                            limits.searchmoves.push(m);
                        }
                    }
                }
            }
        }
        if limits.perft > 0 {
            self.run_perft(limits.perft);
            return;
        }

        self.pool.start_searching(self.pos.clone(), limits);
    }

    fn run_perft(&mut self, depth: u32) {
        let start = Instant::now();
        let mut total = 0u64;
        for m in self.pos.legal_moves() {
            self.pos.do_move(m);
            let cnt = if depth > 1 { self.pos.perft(depth - 1) } else { 1 };
            self.pos.undo_move();
            total += cnt;
            println!("{}: {}", m, cnt);
        }
        println!();
        println!("Nodes searched: {}", total);
        println!(
            "info string perft {} in {} ms",
            total,
            start.elapsed().as_millis()
        );
    }
}

impl Default for UciHandler {
    fn default() -> Self {
        UciHandler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_moves_including_promotions() {
        let pos = Position::startpos();
        assert!(parse_uci_move(&pos, "e2e4").is_some());
        assert!(parse_uci_move(&pos, "e2e5").is_none());
        let promo = Position::from_fen("8/P6k/8/8/8/8/8/K7 w - - 0 1").unwrap();
        let m = parse_uci_move(&promo, "a7a8q").unwrap();
        assert_eq!(m.get_promotion(), Some(Piece::Queen));
    }

    #[test]
    fn score_formatting() {
        assert_eq!(format_score(UciScore::Cp(13)), "cp 13");
        assert_eq!(format_score(UciScore::Mate(-3)), "mate -3");
    }
}

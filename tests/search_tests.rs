// End-to-end search scenarios driven through the thread pool, checking
// protocol-level properties rather than exact move choices.

use std::sync::{Arc, Mutex};

use chess::{ChessMove, Square};
use peregrine::position::Position;
use peregrine::search::lazy_smp::ThreadPool;
use peregrine::search::time::SearchLimits;
use peregrine::search::{SearchCallbacks, UciScore};

#[derive(Clone, Debug)]
enum Event {
    Info {
        depth: i32,
        multipv: usize,
        score: UciScore,
        lowerbound: bool,
        upperbound: bool,
        pv: Vec<ChessMove>,
    },
    NoMoves(UciScore),
    Best(Option<ChessMove>, Option<ChessMove>),
}

fn run_search(
    pos: Position,
    limits: SearchLimits,
    configure: impl FnOnce(&mut ThreadPool),
) -> Vec<Event> {
    let events: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let (e1, e2, e3) = (events.clone(), events.clone(), events.clone());
    let callbacks = SearchCallbacks {
        on_update_full: Box::new(move |info| {
            e1.lock().unwrap().push(Event::Info {
                depth: info.depth,
                multipv: info.multipv,
                score: info.score,
                lowerbound: info.lowerbound,
                upperbound: info.upperbound,
                pv: info.pv.to_vec(),
            })
        }),
        on_iter: Box::new(|_, _, _| {}),
        on_update_no_moves: Box::new(move |score| {
            e2.lock().unwrap().push(Event::NoMoves(score))
        }),
        on_bestmove: Box::new(move |best, ponder| {
            e3.lock().unwrap().push(Event::Best(best, ponder))
        }),
    };
    let mut pool = ThreadPool::new(callbacks);
    configure(&mut pool);
    pool.start_searching(pos, limits);
    pool.wait_for_search_finished();
    let out = events.lock().unwrap().clone();
    out
}

fn best_move(events: &[Event]) -> Option<ChessMove> {
    events.iter().rev().find_map(|e| match e {
        Event::Best(m, _) => Some(*m),
        _ => None,
    })?
}

fn last_info_at_depth(events: &[Event], depth: i32, multipv: usize) -> Option<&Event> {
    events.iter().rev().find(|e| {
        matches!(e, Event::Info { depth: d, multipv: m, .. } if *d == depth && *m == multipv)
    })
}

fn depth_limits(depth: i32) -> SearchLimits {
    SearchLimits { depth, ..Default::default() }
}

#[test]
fn initial_position_depth_6() {
    let pos = Position::startpos();
    let legal = pos.legal_moves();
    let events = run_search(pos, depth_limits(6), |_| {});

    let best = best_move(&events).expect("a bestmove must be emitted");
    assert!(legal.contains(&best), "bestmove {} is not a legal opening move", best);

    let info = last_info_at_depth(&events, 6, 1).expect("an info line for depth 6");
    if let Event::Info { score, pv, .. } = info {
        match score {
            UciScore::Cp(cp) => {
                assert!(cp.abs() <= 200, "opening score {} is out of range", cp)
            }
            UciScore::Mate(_) => panic!("the opening is not a forced mate"),
        }
        assert_eq!(pv.first(), Some(&best), "the PV must start with the bestmove");
    }
}

#[test]
fn forced_mate_in_one_is_found() {
    let pos = Position::from_fen("7k/5Q2/6K1/8/8/8/8/8 w - - 0 1").unwrap();
    let events = run_search(pos, depth_limits(5), |_| {});

    let best = best_move(&events).expect("a bestmove must be emitted");
    let mating = [
        ChessMove::new(Square::F7, Square::G7, None),
        ChessMove::new(Square::F7, Square::F8, None),
    ];
    assert!(mating.contains(&best), "{} does not mate in one", best);

    let mate_reported = events.iter().any(
        |e| matches!(e, Event::Info { score: UciScore::Mate(1), .. }),
    );
    assert!(mate_reported, "score mate 1 was never reported");
}

#[test]
fn stalemate_reports_draw_and_no_move() {
    let pos = Position::from_fen("7k/5K2/6Q1/8/8/8/8/8 b - - 0 1").unwrap();
    assert!(!pos.has_legal_moves());
    let events = run_search(pos, depth_limits(1), |_| {});

    assert!(
        events
            .iter()
            .any(|e| matches!(e, Event::NoMoves(UciScore::Cp(0)))),
        "a draw score must be reported for the stalemate"
    );
    assert!(
        events
            .iter()
            .any(|e| matches!(e, Event::Best(None, _))),
        "no bestmove exists in a stalemate"
    );
}

#[test]
fn threefold_repetition_scores_as_draw() {
    let mut pos = Position::startpos();
    let shuffle = [
        ChessMove::new(Square::G1, Square::F3, None),
        ChessMove::new(Square::G8, Square::F6, None),
        ChessMove::new(Square::F3, Square::G1, None),
        ChessMove::new(Square::F6, Square::G8, None),
    ];
    for _ in 0..2 {
        for m in shuffle {
            pos.do_move(m);
        }
    }
    assert!(pos.is_draw(0));

    let events = run_search(pos, depth_limits(8), |_| {});
    let info = last_info_at_depth(&events, 8, 1)
        .or_else(|| last_info_at_depth(&events, 7, 1))
        .expect("a completed info line");
    if let Event::Info { score, .. } = info {
        match score {
            UciScore::Cp(cp) => assert!(
                cp.abs() <= 200,
                "a repeated position must not score as winning, got {}",
                cp
            ),
            UciScore::Mate(_) => panic!("a repeated position is not mate"),
        }
    }
}

#[test]
fn multipv_lines_are_distinct_and_ordered() {
    let pos = Position::startpos();
    let events = run_search(pos, depth_limits(6), |pool| {
        pool.options.multi_pv = 3;
    });

    let mut firsts = Vec::new();
    let mut scores = Vec::new();
    for idx in 1..=3 {
        let info = last_info_at_depth(&events, 6, idx).expect("three multipv lines");
        if let Event::Info { score, pv, .. } = info {
            firsts.push(pv[0]);
            match score {
                UciScore::Cp(cp) => scores.push(*cp),
                UciScore::Mate(_) => panic!("no mates in the opening"),
            }
        }
    }
    assert!(scores[0] >= scores[1] && scores[1] >= scores[2], "{:?}", scores);
    firsts.sort_by_key(|m| m.to_string());
    firsts.dedup();
    assert_eq!(firsts.len(), 3, "multipv lines must start with distinct moves");
}

#[test]
fn node_limit_stops_the_search() {
    let pos = Position::startpos();
    let limits = SearchLimits { nodes: 20_000, ..Default::default() };
    let events = run_search(pos, limits, |_| {});
    assert!(best_move(&events).is_some());
}

#[test]
fn searchmoves_restricts_the_root() {
    let pos = Position::startpos();
    let only = ChessMove::new(Square::A2, Square::A3, None);
    let limits = SearchLimits {
        depth: 4,
        searchmoves: vec![only],
        ..Default::default()
    };
    let events = run_search(pos, limits, |_| {});
    assert_eq!(best_move(&events), Some(only));
}

#[test]
fn bound_flags_never_appear_on_final_exact_lines() {
    // After a finished iteration the chosen PV line reports an exact score
    let pos = Position::startpos();
    let events = run_search(pos, depth_limits(5), |_| {});
    let info = last_info_at_depth(&events, 5, 1).expect("depth 5 info");
    if let Event::Info { lowerbound, upperbound, .. } = info {
        assert!(!lowerbound && !upperbound);
    }
}

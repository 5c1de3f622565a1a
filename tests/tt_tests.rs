use peregrine::search::tt::TranspositionTable;
use peregrine::types::{Bound, Move16};

#[test]
fn test_tt_store_and_probe() {
    let tt = TranspositionTable::new(1);
    tt.new_search();
    let key = 0xdead_beef_dead_beef;
    let (hit, _, writer) = tt.probe(key);
    assert!(!hit);
    tt.store(writer, key, 42, false, Bound::EXACT, 5, Move16::NONE, 50);
    let (hit, data, _) = tt.probe(key);
    assert!(hit, "entry should be found");
    assert_eq!(data.value, 42);
    assert_eq!(data.depth, 5);
    assert_eq!(data.eval, 50);
    assert_eq!(data.bound, Bound::EXACT);
}

#[test]
fn test_tt_eval_round_trip() {
    let tt = TranspositionTable::new(1);
    tt.new_search();

    // Positive, negative and boundary static evals survive the packing
    for (i, &eval) in [0i32, 100, -100, 500, -500, 32000, -32000].iter().enumerate() {
        let key = 0x1234_5678_0000_0000u64.wrapping_add((i as u64) << 20);
        let (_, _, writer) = tt.probe(key);
        tt.store(writer, key, 42, false, Bound::EXACT, 10, Move16::NONE, eval);
        let (hit, data, _) = tt.probe(key);
        assert!(hit);
        assert_eq!(data.eval, eval, "eval mismatch for {}", eval);
        assert_eq!(data.value, 42, "value corrupted for eval={}", eval);
        assert_eq!(data.depth, 10, "depth corrupted for eval={}", eval);
    }
}

#[test]
fn test_tt_clear() {
    let tt = TranspositionTable::new(1);
    tt.new_search();
    let key = 0xabc_0000_0000;
    let (_, _, writer) = tt.probe(key);
    tt.store(writer, key, 10, false, Bound::LOWER, 2, Move16::NONE, 15);
    assert!(tt.probe(key).0);
    tt.clear();
    assert!(!tt.probe(key).0);
}

#[test]
fn test_tt_generation_and_hashfull() {
    let tt = TranspositionTable::new(1);
    tt.new_search();
    for key in 0..64u64 {
        let spread = key << 58;
        let (_, _, writer) = tt.probe(spread);
        tt.store(writer, spread, 1, false, Bound::UPPER, 3, Move16::NONE, 0);
    }
    let filled = tt.hashfull();
    assert!(filled > 0);
    // A new search ages every entry out of the current generation
    tt.new_search();
    assert_eq!(tt.hashfull(), 0);
}

#[test]
fn test_tt_exact_keeps_priority_over_shallow_bounds() {
    let tt = TranspositionTable::new(1);
    tt.new_search();
    let key = 0x0f0f_0f0f_0f0f_0f0f;
    let (_, _, writer) = tt.probe(key);
    tt.store(writer, key, 77, true, Bound::EXACT, 12, Move16(0x0abc), 5);
    // A much shallower upper bound must not displace the deep exact entry
    let (_, _, writer) = tt.probe(key);
    tt.store(writer, key, -5, false, Bound::UPPER, 2, Move16(0x0123), 5);
    let (hit, data, _) = tt.probe(key);
    assert!(hit);
    assert_eq!(data.depth, 12);
    assert_eq!(data.value, 77);
    assert_eq!(data.mv, Move16(0x0abc));
}

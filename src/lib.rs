//! Peregrine: a UCI chess engine built around a parallel alpha-beta
//! search with iterative deepening, aspiration windows and a shared
//! lock-free transposition table. Board representation and move
//! generation come from the `chess` crate; everything search-related
//! lives under [`search`].

pub mod evaluate;
pub mod position;
pub mod search;
pub mod types;
pub mod uci;

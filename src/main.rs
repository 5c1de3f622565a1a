// src/main.rs

use anyhow::Result;
use peregrine::uci::UciHandler;

fn main() -> Result<()> {
    let mut handler = UciHandler::new();
    handler.run()
}

use clap::Parser;
use fixelstats::pipeline::{run, StatsArgs};

fn main() {
    let args = StatsArgs::parse();
    if let Err(e) = run(&args) {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

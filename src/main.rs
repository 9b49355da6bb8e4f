use std::io;

use clap::Parser;
use hugebench::{BUFFER_ELEMENTS, BenchConfig, run_all};

/// Times alloc, first touch, parallel sum and free of a huge buffer under THP, 2MB and 1GB
/// hugetlb pages, and plain malloc.
///
/// With no flags this is the fixed benchmark: 16 Gi elements, one worker per core, strategies in
/// report order.
#[derive(Parser, Debug)]
#[command(about, version)]
struct Args {
  /// Elements (i32) per buffer
  #[arg(short, long, default_value_t = BUFFER_ELEMENTS)]
  elements: usize,
  /// Worker threads for the touch and sum phases [default: one per core]
  #[arg(short, long)]
  threads: Option<usize>,
}

fn main() -> anyhow::Result<()> {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

  let Args { elements, threads } = Args::parse();
  let config = BenchConfig { elements, threads };

  run_all(&config, &mut io::stdout())?;
  Ok(())
}

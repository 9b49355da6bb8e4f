use hugebench::{
  BenchConfig, BenchOutcome, HugeTlb1G, PlainHeap, ProvisionError, Strategy, run_all, run_bench,
};
use pretty_assertions::assert_eq;

const LEN: usize = 1024;
const SUM: u64 = 1024 * 1023 / 2;

fn report(bytes: Vec<u8>) -> Vec<String> {
  String::from_utf8(bytes)
    .expect("report is utf-8")
    .lines()
    .map(str::to_owned)
    .collect()
}

/// Replaces the millisecond count so lines can be compared exactly.
fn mask_ms(line: &str) -> String {
  match line.strip_suffix(" ms").and_then(|l| l.rsplit_once(": ")) {
    Some((head, ms)) if ms.parse::<u64>().is_ok() => format!("{head}: N ms"),
    _ => line.to_owned(),
  }
}

#[test]
fn completed_block_layout() {
  let mut out = Vec::new();
  let outcome = run_bench::<PlainHeap, _>(LEN, &mut out).unwrap();

  let BenchOutcome::Completed { sum, verified, .. } = outcome else {
    panic!("malloc of {LEN} elements failed");
  };
  assert_eq!(sum, SUM);
  assert!(verified);

  let lines: Vec<_> = report(out).iter().map(|l| mask_ms(l)).collect();
  assert_eq!(
    lines,
    [
      "malloc sum: 523776",
      "malloc time alloc: N ms",
      "malloc time touch: N ms",
      "malloc time sum: N ms",
      "malloc time free: N ms",
      "",
    ]
  );
}

#[test]
fn failed_allocation_short_circuits() {
  let mut out = Vec::new();
  let outcome = run_bench::<HugeTlb1G, _>(usize::MAX, &mut out).unwrap();

  assert!(matches!(
    outcome,
    BenchOutcome::Failed {
      error: Some(ProvisionError::Overflow { .. }),
      ..
    }
  ));
  assert_eq!(report(out), ["1gb_hp failed to allocate memory", ""]);
}

#[test]
fn all_strategies_agree_on_the_sum() {
  let config = BenchConfig {
    elements: LEN,
    threads: Some(2),
  };
  let mut out = Vec::new();
  let runs = run_all(&config, &mut out).unwrap();

  let order: Vec<_> = runs.iter().map(|r| r.strategy).collect();
  assert_eq!(order, Strategy::ALL);

  let lines = report(out);
  for run in &runs {
    let name = run.strategy.name();
    match &run.outcome {
      BenchOutcome::Completed { sum, verified, .. } => {
        assert_eq!(*sum, SUM, "{name}");
        assert!(verified);
        assert!(lines.contains(&format!("{name} sum: {SUM}")));
      }
      BenchOutcome::Failed { error, .. } => {
        // Hosts without a reserved hugetlb pool end up here.
        assert!(
          matches!(run.strategy, Strategy::Huge2M | Strategy::Huge1G),
          "{name}: {error:?}"
        );
        assert!(lines.contains(&format!("{name} failed to allocate memory")));
      }
    }
  }

  // THP and malloc never depend on the hugetlb pool.
  assert!(runs[0].outcome.sum().is_some());
  assert!(runs[3].outcome.sum().is_some());

  let totals: Vec<_> = lines[lines.len() - 4..].iter().map(|l| mask_ms(l)).collect();
  assert_eq!(
    totals,
    [
      "time thp: N ms",
      "time 2mb_hp: N ms",
      "time 1gb_hp: N ms",
      "time malloc: N ms",
    ]
  );
}

#[test]
fn single_worker_matches_many() {
  let sums = |threads| {
    let config = BenchConfig {
      elements: LEN * 64 + 5,
      threads: Some(threads),
    };
    let runs = run_all(&config, &mut Vec::new()).unwrap();
    runs[3].outcome.sum()
  };
  assert_eq!(sums(1), sums(8));
  assert_eq!(sums(1), Some(hugebench::expected_sum(LEN * 64 + 5)));
}

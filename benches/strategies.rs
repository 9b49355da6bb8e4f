use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use hugebench::{AlignedThp, Buffer, HugeTlb1G, HugeTlb2M, PlainHeap, Provision};
use std::hint::black_box;

/// 64 MiB of `i32`s: 32 whole 2MB pages, or one 1GB page.
const LEN: usize = 16 << 20;

/// Whether `P` can provision `LEN` elements on this host.
fn available<P: Provision>() -> bool {
  let mut v = Buffer::<P>::new();
  v.init(LEN);
  v.ok()
}

/// init + free of an untouched buffer.
fn alloc_free<P: Provision>(c: &mut Criterion) {
  if !available::<P>() {
    eprintln!("{}: skipped, cannot allocate {LEN} elements", P::NAME);
    return;
  }
  let mut group = c.benchmark_group("alloc_free");
  group.bench_function(BenchmarkId::from_parameter(P::NAME), |b| {
    b.iter(|| {
      let mut v = Buffer::<P>::new();
      v.init(black_box(LEN));
      v.free();
    })
  });
  group.finish();
}

/// First-touch fill followed by the parallel sum, allocation excluded.
fn touch_sum<P: Provision>(c: &mut Criterion) {
  if !available::<P>() {
    return;
  }
  let mut group = c.benchmark_group("touch_sum");
  group.throughput(Throughput::Bytes((LEN * size_of::<i32>()) as u64));
  group.bench_function(BenchmarkId::from_parameter(P::NAME), |b| {
    b.iter_batched_ref(
      || {
        let mut v = Buffer::<P>::new();
        v.init(LEN);
        v
      },
      |v| {
        v.touch();
        black_box(v.sum())
      },
      criterion::BatchSize::PerIteration,
    )
  });
  group.finish();
}

fn benchmark_strategies(c: &mut Criterion) {
  alloc_free::<AlignedThp>(c);
  alloc_free::<HugeTlb2M>(c);
  alloc_free::<HugeTlb1G>(c);
  alloc_free::<PlainHeap>(c);

  touch_sum::<AlignedThp>(c);
  touch_sum::<HugeTlb2M>(c);
  touch_sum::<HugeTlb1G>(c);
  touch_sum::<PlainHeap>(c);
}

criterion_group! {
  name = benches;
  config = Criterion::default().sample_size(10);
  targets = benchmark_strategies
}
criterion_main!(benches);

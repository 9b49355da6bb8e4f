//! Huge-buffer provisioning benchmark.
//!
//! Allocates a buffer of 16 Gi `i32`s four different ways (THP-hinted aligned heap, 2MB hugetlb
//! mapping, 1GB hugetlb mapping, plain `malloc`), then times allocation, first touch, a parallel
//! sum, and release for each.

#[cfg(not(unix))]
compile_error!("hugebench needs a unix libc (mmap, munmap, posix_memalign)");

use core::{
  marker::PhantomData,
  mem::{MaybeUninit, size_of},
  ops::{Index, IndexMut},
  ptr::{NonNull, null_mut},
  slice,
};
use std::{
  fmt,
  hint::black_box,
  io::{self, Write},
  time::Instant,
};

use log::{debug, info, warn};
use rayon::prelude::*;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Elements in the benchmarked buffer: 16 Gi `i32`s, 64 GiB of backing memory.
pub const BUFFER_ELEMENTS: usize = 16 << 30;

/// Alignment requested for the THP strategy so the region starts on a 2MB boundary.
pub const THP_ALIGN: usize = 1 << 21;

/// `log2` of the 2MB huge page size.
pub const HUGE_2MB_SHIFT: u32 = 21;
/// `log2` of the 1GB huge page size.
pub const HUGE_1GB_SHIFT: u32 = 30;

/// Elements handed to a rayon task at once in the touch and sum phases.
const CHUNK_ELEMENTS: usize = 1 << 16;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(THP_ALIGN.is_power_of_two());
const _: () = assert!(THP_ALIGN == 1 << HUGE_2MB_SHIFT);
const _: () = assert!(BUFFER_ELEMENTS * size_of::<i32>() % (1 << HUGE_1GB_SHIFT) == 0);
const _: () = assert!(CHUNK_ELEMENTS.is_power_of_two());

// =============================================================================
// Errors
// =============================================================================

/// Why a strategy could not provision its buffer.
#[derive(Debug, Error)]
pub enum ProvisionError {
  #[error("{len} elements do not fit in the address space")]
  Overflow { len: usize },

  #[error("mmap of {bytes} bytes backed by 2^{shift} byte pages failed: {source}")]
  Map {
    bytes: usize,
    shift: u32,
    #[source]
    source: io::Error,
  },

  #[error("posix_memalign of {bytes} bytes failed: {source}")]
  AlignedAlloc {
    bytes: usize,
    #[source]
    source: io::Error,
  },

  #[error("malloc of {bytes} bytes returned null")]
  Heap { bytes: usize },

  #[error("explicit huge pages are not supported on this platform")]
  Unsupported,
}

/// Failures of the harness itself. Strategy failures are reported, not raised.
#[derive(Debug, Error)]
pub enum BenchError {
  #[error("failed to write report: {0}")]
  Io(#[from] io::Error),

  #[error("failed to build worker pool: {0}")]
  ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

// =============================================================================
// Platform
// =============================================================================

/// Byte length of `len` elements, bounded by what a Rust slice may span.
fn byte_len(len: usize) -> Result<usize, ProvisionError> {
  len
    .checked_mul(size_of::<i32>())
    .filter(|&bytes| bytes <= isize::MAX as usize)
    .ok_or(ProvisionError::Overflow { len })
}

#[cfg(target_os = "linux")]
fn os_mmap_huge(bytes: usize, shift: u32) -> Result<NonNull<u8>, ProvisionError> {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      bytes,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE
        | libc::MAP_ANONYMOUS
        | libc::MAP_HUGETLB
        | ((shift as libc::c_int) << libc::MAP_HUGE_SHIFT),
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    return Err(ProvisionError::Map {
      bytes,
      shift,
      source: io::Error::last_os_error(),
    });
  }
  NonNull::new(ptr.cast()).ok_or(ProvisionError::Map {
    bytes,
    shift,
    source: io::ErrorKind::AddrNotAvailable.into(),
  })
}

#[cfg(not(target_os = "linux"))]
fn os_mmap_huge(_bytes: usize, _shift: u32) -> Result<NonNull<u8>, ProvisionError> {
  Err(ProvisionError::Unsupported)
}

unsafe fn os_munmap(ptr: NonNull<u8>, bytes: usize) {
  let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), bytes) };
  debug_assert_eq!(rc, 0, "munmap failed");
}

fn os_memalign(bytes: usize, align: usize) -> Result<NonNull<u8>, ProvisionError> {
  let mut ptr: *mut libc::c_void = null_mut();
  let rc = unsafe { libc::posix_memalign(&mut ptr, align, bytes) };
  if rc != 0 {
    return Err(ProvisionError::AlignedAlloc {
      bytes,
      source: io::Error::from_raw_os_error(rc),
    });
  }
  // A zero-byte request may legally succeed with a null pointer.
  NonNull::new(ptr.cast()).ok_or(ProvisionError::AlignedAlloc {
    bytes,
    source: io::Error::from_raw_os_error(libc::ENOMEM),
  })
}

/// Asks the kernel to back `[ptr, ptr + bytes)` with transparent huge pages. Best-effort.
#[cfg(target_os = "linux")]
unsafe fn os_advise_hugepage(ptr: NonNull<u8>, bytes: usize) -> io::Result<()> {
  if unsafe { libc::madvise(ptr.as_ptr().cast(), bytes, libc::MADV_HUGEPAGE) } != 0 {
    return Err(io::Error::last_os_error());
  }
  Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn os_advise_hugepage(_ptr: NonNull<u8>, _bytes: usize) -> io::Result<()> {
  Err(io::ErrorKind::Unsupported.into())
}

fn os_malloc(bytes: usize) -> Result<NonNull<u8>, ProvisionError> {
  NonNull::new(unsafe { libc::malloc(bytes) }.cast()).ok_or(ProvisionError::Heap { bytes })
}

unsafe fn os_free(ptr: NonNull<u8>) {
  unsafe { libc::free(ptr.as_ptr().cast()) };
}

// =============================================================================
// Provisioning Strategies
// =============================================================================

mod sealed {
  pub trait Sealed {}
}

/// How a [`Buffer`] obtains and returns its backing memory.
///
/// Implemented only by the four benchmarked strategies.
pub trait Provision: sealed::Sealed {
  /// Name used in the report.
  const NAME: &'static str;

  /// Obtains `bytes` of writable memory aligned for `i32`.
  fn acquire(bytes: usize) -> Result<NonNull<u8>, ProvisionError>;

  /// Returns memory obtained from [`Provision::acquire`].
  ///
  /// # Safety
  /// `ptr` must come from `acquire(bytes)` of the same strategy and must not be released twice.
  unsafe fn release(ptr: NonNull<u8>, bytes: usize);
}

/// 2MB-aligned heap allocation with a `MADV_HUGEPAGE` hint.
pub struct AlignedThp;

impl sealed::Sealed for AlignedThp {}

impl Provision for AlignedThp {
  const NAME: &'static str = "thp";

  fn acquire(bytes: usize) -> Result<NonNull<u8>, ProvisionError> {
    let ptr = os_memalign(bytes, THP_ALIGN)?;
    if let Err(e) = unsafe { os_advise_hugepage(ptr, bytes) } {
      debug!("MADV_HUGEPAGE on {bytes} bytes ignored: {e}");
    }
    Ok(ptr)
  }

  unsafe fn release(ptr: NonNull<u8>, _bytes: usize) {
    unsafe { os_free(ptr) };
  }
}

/// Anonymous private `MAP_HUGETLB` mapping with `2^SHIFT` byte pages.
///
/// Fails instead of falling back when the hugetlb pool is short.
pub struct HugeTlb<const SHIFT: u32>;

pub type HugeTlb2M = HugeTlb<HUGE_2MB_SHIFT>;
pub type HugeTlb1G = HugeTlb<HUGE_1GB_SHIFT>;

impl<const SHIFT: u32> sealed::Sealed for HugeTlb<SHIFT> {}

impl<const SHIFT: u32> Provision for HugeTlb<SHIFT> {
  const NAME: &'static str = match SHIFT {
    HUGE_2MB_SHIFT => "2mb_hp",
    HUGE_1GB_SHIFT => "1gb_hp",
    _ => "hugetlb",
  };

  fn acquire(bytes: usize) -> Result<NonNull<u8>, ProvisionError> {
    os_mmap_huge(align_up(bytes, 1 << SHIFT), SHIFT)
  }

  unsafe fn release(ptr: NonNull<u8>, bytes: usize) {
    // hugetlb munmap wants whole pages.
    unsafe { os_munmap(ptr, align_up(bytes, 1 << SHIFT)) };
  }
}

/// Plain `malloc` with no page size hint.
pub struct PlainHeap;

impl sealed::Sealed for PlainHeap {}

impl Provision for PlainHeap {
  const NAME: &'static str = "malloc";

  fn acquire(bytes: usize) -> Result<NonNull<u8>, ProvisionError> {
    os_malloc(bytes)
  }

  unsafe fn release(ptr: NonNull<u8>, _bytes: usize) {
    unsafe { os_free(ptr) };
  }
}

// =============================================================================
// Buffer
// =============================================================================

/// Fixed-size array of `i32` whose memory comes from strategy `P`.
///
/// Created empty. [`Buffer::init`] provisions the memory and [`Buffer::free`] releases it, so
/// both can be timed on their own. Elements are readable only after [`Buffer::touch`]; until then
/// the accessors see an empty buffer.
pub struct Buffer<P: Provision> {
  ptr: Option<NonNull<i32>>,
  len: usize,
  /// Every element has been written since the last `init`.
  touched: bool,
  error: Option<ProvisionError>,
  _provision: PhantomData<P>,
}

pub type ThpVec = Buffer<AlignedThp>;
pub type Huge2MVec = Buffer<HugeTlb2M>;
pub type Huge1GVec = Buffer<HugeTlb1G>;
pub type MallocVec = Buffer<PlainHeap>;

// The buffer exclusively owns its region; shared access only hands out `&[i32]`.
unsafe impl<P: Provision> Send for Buffer<P> {}
unsafe impl<P: Provision> Sync for Buffer<P> {}

impl<P: Provision> Default for Buffer<P> {
  fn default() -> Self {
    Self::new()
  }
}

impl<P: Provision> Buffer<P> {
  pub const fn new() -> Self {
    Self {
      ptr: None,
      len: 0,
      touched: false,
      error: None,
      _provision: PhantomData,
    }
  }

  /// Provisions room for `len` elements. Never fails: check [`Buffer::ok`] afterwards.
  pub fn init(&mut self, len: usize) {
    debug_assert!(self.ptr.is_none(), "{} buffer initialized twice", P::NAME);
    self.free();
    self.len = len;
    self.touched = false;
    self.error = None;

    let acquired = byte_len(len).and_then(|bytes| {
      debug!("{}: acquiring {bytes} bytes", P::NAME);
      P::acquire(bytes)
    });
    match acquired {
      Ok(ptr) => self.ptr = Some(ptr.cast()),
      Err(e) => self.error = Some(e),
    }
  }

  /// Whether the last [`Buffer::init`] obtained memory.
  pub fn ok(&self) -> bool {
    self.ptr.is_some()
  }

  /// Logical element count recorded by the last [`Buffer::init`].
  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// Cause of the last failed [`Buffer::init`].
  pub fn last_error(&self) -> Option<&ProvisionError> {
    self.error.as_ref()
  }

  pub fn take_error(&mut self) -> Option<ProvisionError> {
    self.error.take()
  }

  /// Whether [`Buffer::touch`] has written every element since the last `init`.
  pub fn is_touched(&self) -> bool {
    self.touched
  }

  /// Writes `i` to element `i` in parallel, faulting in every page. See [`fill_index`].
  pub fn touch(&mut self) {
    fill_index(self.as_uninit_mut());
    self.touched = self.ptr.is_some();
  }

  /// The elements. Empty unless the buffer holds memory that has been touched.
  pub fn as_slice(&self) -> &[i32] {
    match self.ptr {
      Some(ptr) if self.touched => unsafe { slice::from_raw_parts(ptr.as_ptr(), self.len) },
      _ => &[],
    }
  }

  pub fn as_mut_slice(&mut self) -> &mut [i32] {
    match self.ptr {
      Some(ptr) if self.touched => unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), self.len) },
      _ => &mut [],
    }
  }

  fn as_uninit_mut(&mut self) -> &mut [MaybeUninit<i32>] {
    match self.ptr {
      Some(ptr) => unsafe { slice::from_raw_parts_mut(ptr.as_ptr().cast(), self.len) },
      None => &mut [],
    }
  }

  /// Parallel sum of all elements; see [`reduce`].
  pub fn sum(&self) -> u64 {
    reduce(self.as_slice())
  }

  /// Returns the memory to the strategy. A second call is a no-op.
  pub fn free(&mut self) {
    self.touched = false;
    let Some(ptr) = self.ptr.take() else {
      return;
    };
    // Keep the stores made through `ptr` observable up to the release.
    let ptr = black_box(ptr);
    // `len` was validated by `byte_len` in `init`.
    let bytes = self.len * size_of::<i32>();
    unsafe { P::release(ptr.cast(), bytes) };
  }
}

impl<P: Provision> Drop for Buffer<P> {
  fn drop(&mut self) {
    self.free();
  }
}

impl<P: Provision> Index<usize> for Buffer<P> {
  type Output = i32;

  fn index(&self, i: usize) -> &i32 {
    &self.as_slice()[i]
  }
}

impl<P: Provision> IndexMut<usize> for Buffer<P> {
  fn index_mut(&mut self, i: usize) -> &mut i32 {
    &mut self.as_mut_slice()[i]
  }
}

impl<P: Provision> fmt::Debug for Buffer<P> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Buffer")
      .field("strategy", &P::NAME)
      .field("ptr", &self.ptr)
      .field("len", &self.len)
      .field("touched", &self.touched)
      .field("error", &self.error)
      .finish()
  }
}

// =============================================================================
// Workload
// =============================================================================

/// Writes `i` to element `i`, faulting in every page. Runs on the current rayon pool.
pub fn fill_index(values: &mut [MaybeUninit<i32>]) {
  values
    .par_chunks_mut(CHUNK_ELEMENTS)
    .enumerate()
    .for_each(|(chunk, slots)| {
      let base = chunk * CHUNK_ELEMENTS;
      for (offset, slot) in slots.iter_mut().enumerate() {
        // Truncation past `i32::MAX` is part of the workload.
        slot.write((base + offset) as i32);
      }
    });
}

/// Sum of all elements, each sign-extended to `u64`, with wrapping addition.
///
/// Every worker folds a private partial over disjoint chunks and the partials are added, so the
/// result does not depend on the worker count.
pub fn reduce(values: &[i32]) -> u64 {
  values
    .par_chunks(CHUNK_ELEMENTS)
    .map(|chunk| chunk.iter().fold(0u64, |acc, &v| acc.wrapping_add(v as u64)))
    .reduce(|| 0, u64::wrapping_add)
}

/// What [`reduce`] returns for a buffer of `len` elements after [`fill_index`].
///
/// Equal to `len * (len - 1) / 2` while `len <= 2^31`; past that the stored values wrap every
/// 2^32 indices.
pub const fn expected_sum(len: usize) -> u64 {
  const PERIOD: i128 = 1 << 32;
  const HALF: i128 = 1 << 31;

  // Sum of the values stored at the first `m` indices of a period.
  const fn partial(m: i128) -> i128 {
    let negative = if m > HALF { m - HALF } else { 0 };
    m * (m - 1) / 2 - PERIOD * negative
  }

  let n = len as i128;
  ((n / PERIOD) * partial(PERIOD) + partial(n % PERIOD)) as u64
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

// =============================================================================
// Timing
// =============================================================================

/// Runs `work` and returns its result with the elapsed wall-clock milliseconds.
pub fn timed<R>(work: impl FnOnce() -> R) -> (R, u64) {
  let start = Instant::now();
  let out = work();
  let elapsed = start.elapsed().as_millis();
  (out, u64::try_from(elapsed).unwrap_or(u64::MAX))
}

/// Elapsed wall-clock milliseconds of `work`.
pub fn ms(work: impl FnOnce()) -> u64 {
  timed(work).1
}

// =============================================================================
// Benchmark Driver
// =============================================================================

/// Milliseconds spent in each phase of one run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PhaseTimings {
  pub alloc: u64,
  pub touch: u64,
  pub sum: u64,
  pub free: u64,
}

#[derive(Debug)]
pub enum BenchOutcome {
  /// `init` left the buffer without memory; later phases were skipped.
  Failed {
    alloc_ms: u64,
    error: Option<ProvisionError>,
  },
  Completed {
    sum: u64,
    /// `sum == expected_sum(len)`.
    verified: bool,
    timings: PhaseTimings,
  },
}

impl BenchOutcome {
  pub fn sum(&self) -> Option<u64> {
    match self {
      Self::Completed { sum, .. } => Some(*sum),
      Self::Failed { .. } => None,
    }
  }
}

/// Allocates, touches, sums and frees `len` elements with strategy `P`, writing the report
/// block for `P` to `out`.
pub fn run_bench<P: Provision, W: Write>(len: usize, out: &mut W) -> io::Result<BenchOutcome> {
  let name = P::NAME;
  let mut v = Buffer::<P>::new();

  let alloc = ms(|| v.init(len));
  if !v.ok() {
    let error = v.take_error();
    match &error {
      Some(e) => warn!("{name}: allocation failed after {alloc} ms: {e}"),
      None => warn!("{name}: allocation failed after {alloc} ms"),
    }
    writeln!(out, "{name} failed to allocate memory")?;
    writeln!(out)?;
    return Ok(BenchOutcome::Failed {
      alloc_ms: alloc,
      error,
    });
  }

  let touch = ms(|| v.touch());
  let (sum, sum_ms) = timed(|| {
    let sum = v.sum();
    writeln!(out, "{name} sum: {sum}").map(|()| sum)
  });
  let sum = sum?;
  let free = ms(|| v.free());

  let expected = expected_sum(len);
  let verified = sum == expected;
  if !verified {
    warn!("{name}: sum {sum} differs from expected {expected}");
  }

  writeln!(out, "{name} time alloc: {alloc} ms")?;
  writeln!(out, "{name} time touch: {touch} ms")?;
  writeln!(out, "{name} time sum: {sum_ms} ms")?;
  writeln!(out, "{name} time free: {free} ms")?;
  writeln!(out)?;

  Ok(BenchOutcome::Completed {
    sum,
    verified,
    timings: PhaseTimings {
      alloc,
      touch,
      sum: sum_ms,
      free,
    },
  })
}

// =============================================================================
// Runner
// =============================================================================

/// The benchmarked strategies, in report order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Strategy {
  Thp,
  Huge2M,
  Huge1G,
  Malloc,
}

impl Strategy {
  pub const ALL: [Strategy; 4] = [Self::Thp, Self::Huge2M, Self::Huge1G, Self::Malloc];

  pub const fn name(self) -> &'static str {
    match self {
      Self::Thp => AlignedThp::NAME,
      Self::Huge2M => HugeTlb2M::NAME,
      Self::Huge1G => HugeTlb1G::NAME,
      Self::Malloc => PlainHeap::NAME,
    }
  }

  /// Runs [`run_bench`] monomorphized for this strategy.
  pub fn run<W: Write>(self, len: usize, out: &mut W) -> io::Result<BenchOutcome> {
    match self {
      Self::Thp => run_bench::<AlignedThp, W>(len, out),
      Self::Huge2M => run_bench::<HugeTlb2M, W>(len, out),
      Self::Huge1G => run_bench::<HugeTlb1G, W>(len, out),
      Self::Malloc => run_bench::<PlainHeap, W>(len, out),
    }
  }
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BenchConfig {
  /// Elements per buffer.
  pub elements: usize,
  /// Worker count for the touch and sum phases. `None` uses rayon's global pool.
  pub threads: Option<usize>,
}

impl Default for BenchConfig {
  fn default() -> Self {
    Self {
      elements: BUFFER_ELEMENTS,
      threads: None,
    }
  }
}

/// One strategy's outcome plus the wall-clock time of its whole run.
#[derive(Debug)]
pub struct StrategyRun {
  pub strategy: Strategy,
  pub total_ms: u64,
  pub outcome: BenchOutcome,
}

/// Benchmarks every strategy in [`Strategy::ALL`] order, one at a time, then reports the total
/// time of each.
pub fn run_all<W: Write + Send>(
  config: &BenchConfig,
  out: &mut W,
) -> Result<Vec<StrategyRun>, BenchError> {
  let runs = match config.threads {
    Some(threads) => rayon::ThreadPoolBuilder::new()
      .num_threads(threads)
      .build()?
      .install(|| run_sequence(config.elements, out))?,
    None => run_sequence(config.elements, out)?,
  };

  for run in &runs {
    writeln!(out, "time {}: {} ms", run.strategy, run.total_ms)?;
  }
  Ok(runs)
}

fn run_sequence<W: Write>(len: usize, out: &mut W) -> io::Result<Vec<StrategyRun>> {
  info!(
    "benchmarking {len} elements on {} workers",
    rayon::current_num_threads()
  );

  let mut runs = Vec::with_capacity(Strategy::ALL.len());
  for strategy in Strategy::ALL {
    let (outcome, total_ms) = timed(|| strategy.run(len, out));
    runs.push(StrategyRun {
      strategy,
      total_ms,
      outcome: outcome?,
    });
  }
  Ok(runs)
}

// =============================================================================
// Tests
// =============================================================================

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use limen::Allocator;

const OPS: u64 = 10_000;

/// limen alloc/release throughput.
fn limen_alloc_release(a: &mut Allocator, size: usize) {
  for _ in 0..OPS {
    let ptr = a.allocate(size).unwrap();
    black_box(ptr);
    unsafe { a.release(ptr.as_ptr()) };
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn benchmark_alloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("alloc_throughput");

  for size in [8, 32, 64, 128, 512] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("limen", size), &size, |b, &size| {
      let mut a = Allocator::new();
      b.iter(|| limen_alloc_release(&mut a, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_alloc_throughput);
criterion_main!(benches);

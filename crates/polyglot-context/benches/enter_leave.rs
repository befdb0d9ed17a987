use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use polyglot_context::{ContextOptions, Engine};

fn bench_enter_leave(c: &mut Criterion) {
    let engine = Engine::new();
    let context = engine.create_context(ContextOptions::default()).unwrap();

    c.bench_function("enter_leave_single_thread", |b| {
        b.iter(|| {
            context.enter().unwrap();
            context.leave().unwrap();
        });
    });

    let mut group = c.benchmark_group("nested_enter");
    for depth in [1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::new("depth", depth), &depth, |b, &depth| {
            b.iter(|| {
                for _ in 0..depth {
                    context.enter().unwrap();
                }
                for _ in 0..depth {
                    context.leave().unwrap();
                }
            });
        });
    }
    group.finish();

    context.close(false).unwrap();
}

fn bench_poll(c: &mut Criterion) {
    let engine = Engine::new();
    let context = engine.create_context(ContextOptions::default()).unwrap();
    context.enter().unwrap();

    c.bench_function("poll_no_pending_actions", |b| {
        b.iter(|| black_box(context.poll()).unwrap());
    });

    c.bench_function("enter_scope_guard", |b| {
        b.iter(|| {
            let guard = context.enter_scope().unwrap();
            black_box(&guard);
        });
    });

    context.leave().unwrap();
    context.close(false).unwrap();
}

criterion_group!(benches, bench_enter_leave, bench_poll);
criterion_main!(benches);

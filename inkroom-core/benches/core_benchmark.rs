use criterion::{criterion_group, criterion_main, Criterion};
use inkroom_core::{EventBus, EventEntry, Scene, ScenePathType, SceneTree};
use serde_json::json;
use std::hint::black_box;
use std::time::{Duration, Instant};

/// 10 directories × 100 scenes.
fn populated_tree() -> SceneTree {
    let mut tree = SceneTree::new();
    for d in 0..10 {
        let scenes = (0..100).map(|s| Scene::new(format!("p{s}"))).collect();
        tree.insert(&format!("/deck{d}"), scenes, usize::MAX).unwrap();
    }
    tree
}

fn bench_resolve_path(c: &mut Criterion) {
    let tree = populated_tree();
    c.bench_function("resolve_path_1k_scenes", |b| {
        b.iter(|| {
            assert_eq!(
                tree.resolve_path_type(black_box("/deck9/p99")),
                ScenePathType::Page
            );
        })
    });
}

fn bench_remove_current_directory(c: &mut Criterion) {
    let tree = populated_tree();
    c.bench_function("remove_current_dir_recovery", |b| {
        b.iter_batched(
            || {
                let mut t = tree.clone();
                t.set_current_path("/deck5/p50").unwrap();
                t
            },
            |mut t| {
                t.remove("/deck5").unwrap();
                black_box(t.current_path().len());
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_replace_root(c: &mut Criterion) {
    let tree = populated_tree();
    let mut remote = tree.clone();
    remote.remove("/deck3").unwrap();
    let root = remote.root().clone();

    c.bench_function("replace_root_with_recovery", |b| {
        b.iter_batched(
            || {
                let mut t = tree.clone();
                t.set_current_path("/deck3/p0").unwrap();
                (t, root.clone())
            },
            |(mut t, root)| {
                black_box(t.replace_root(root));
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_high_frequency_flush(c: &mut Criterion) {
    c.bench_function("high_frequency_flush_1k", |b| {
        b.iter(|| {
            let mut bus = EventBus::new();
            bus.subscribe_high_frequency("cursor", Duration::from_millis(100));
            let start = Instant::now();
            for i in 0..1_000 {
                bus.receive(EventEntry::member(1, "cursor", json!(i)), start);
            }
            black_box(bus.tick(start + Duration::from_secs(1)));
        })
    });
}

criterion_group!(
    benches,
    bench_resolve_path,
    bench_remove_current_directory,
    bench_replace_root,
    bench_high_frequency_flush,
);
criterion_main!(benches);

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use myrpc_client::HashRing;

fn bench_get_node(c: &mut Criterion) {
    let backends: Vec<String> = (0..50)
        .map(|i| format!("tcp@10.0.0.{}:8000", i))
        .collect();
    let ring = HashRing::new(&backends, 50);

    c.bench_function("ring_get_node", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = i.wrapping_add(1);
            black_box(ring.get_node(&format!("key-{}", i)))
        })
    });
}

fn bench_add_remove(c: &mut Criterion) {
    let backends: Vec<String> = (0..50)
        .map(|i| format!("tcp@10.0.0.{}:8000", i))
        .collect();

    c.bench_function("ring_add_remove_node", |b| {
        let mut ring = HashRing::new(&backends, 50);
        b.iter(|| {
            ring.add_node("tcp@10.0.1.1:9000");
            ring.remove_node("tcp@10.0.1.1:9000");
        })
    });
}

criterion_group!(benches, bench_get_node, bench_add_remove);
criterion_main!(benches);

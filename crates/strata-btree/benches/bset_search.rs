use criterion::{black_box, criterion_group, criterion_main, Criterion};
use strata_btree::NodeData;
use strata_types::{Bkey, Bpos, Bval, KeyType, KeyVal};

fn populated(n: u64) -> NodeData {
    let mut data = NodeData::new();
    for i in 0..n {
        data.insert_sorted(KeyVal::new(
            Bkey::new(Bpos::new(1, (i + 1) * 8), 8, KeyType::Extent),
            Bval::None,
        ));
        if i % 40 == 0 {
            data.seal();
        }
    }
    data
}

fn bench_seek(c: &mut Criterion) {
    let data = populated(128);
    c.bench_function("node_iter_seek", |b| {
        b.iter(|| {
            let mut it = data.iter_at(black_box(Bpos::new(1, 512)), true);
            black_box(it.peek(&data))
        });
    });

    c.bench_function("node_iter_walk", |b| {
        b.iter(|| {
            let mut it = data.iter_at(Bpos::MIN, true);
            let mut n = 0_u32;
            while it.peek(&data).is_some() {
                it.advance(&data);
                n += 1;
            }
            black_box(n)
        });
    });
}

criterion_group!(benches, bench_seek);
criterion_main!(benches);

use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tessel::types;
use tessel::{BlockId, Signature, Stack, StackCreateInfo, Value, World, WorldCreateInfo};

const RECEIVERS: usize = 256;

/// A world with `kinds` record types that all answer `weight`, and a block
/// that sends `weight` to every element of its input list and sums the
/// answers.
fn build_world(kinds: usize) -> (Arc<World>, BlockId, Value) {
    let world = World::new(WorldCreateInfo::default());
    let mut types_ = Vec::new();
    for k in 0..kinds {
        let ty = world.define_record(&format!("Kind{k}"), &[]);
        let weight = world.add_block(
            Signature::new("weight")
                .input("self", types::any())
                .output("w", types::int(), 1),
            move |_, p| {
                p.load_int(1, k as i32 + 1);
                p.return_();
                Ok(())
            },
        );
        world.add_method(ty.id, "weight", weight);
        types_.push(ty);
    }

    let total = world.add_block(
        Signature::new("total")
            .input("items", types::list())
            .output("sum", types::int(), 2)
            .locals(5),
        |_, p| {
            p.load_int(1, 0);
            p.load_int(2, 0);
            let top = p.current_offset();
            let done = p.jump_if_done(1, 0);
            p.get_index(3, 0, 1);
            p.send("weight", 3, 1, 4)?;
            p.add_int(2, 2, 4);
            p.increment(1);
            p.jump_back(top);
            p.bind(done);
            p.return_();
            Ok(())
        },
    );

    let items = (0..RECEIVERS)
        .map(|i| types_[i % kinds].initial_value())
        .collect();
    (world, total, Value::list(items))
}

fn run_case(c: &mut Criterion, name: &str, kinds: usize) {
    let (world, total, items) = build_world(kinds);
    let mut with_ic = Stack::new(world.clone(), StackCreateInfo::default());
    let mut without_ic = Stack::new(
        world,
        StackCreateInfo {
            inline_cache: false,
            ..Default::default()
        },
    );
    let warmup = with_ic.call(total, vec![items.clone()]).expect("warmup");
    black_box(warmup);

    c.bench_function(&format!("{name}_with_inline_cache"), |b| {
        b.iter(|| {
            let outputs = with_ic.call(total, vec![items.clone()]).expect("run");
            black_box(outputs);
        })
    });

    c.bench_function(&format!("{name}_without_inline_cache"), |b| {
        b.iter(|| {
            let outputs = without_ic.call(total, vec![items.clone()]).expect("run");
            black_box(outputs);
        })
    });
}

fn bench_inline_cache(c: &mut Criterion) {
    run_case(c, "monomorphic", 1);
    run_case(c, "polymorphic", 3);
    run_case(c, "megamorphic", 8);
}

criterion_group!(benches, bench_inline_cache);
criterion_main!(benches);

//! Evaluator behavior: correctness of fused kernels, grouping, caching
//! counters, idempotence, side effects.

use lanejit_codegen::kir::CmpOp;

use crate::test::helpers::{init, serial};
use crate::trace;
use crate::{state, JitBackend, ReduceOp, VarType};

const B: JitBackend = JitBackend::Cpu;

#[test]
fn counter_arithmetic_evaluates() {
    let _serial = serial();
    init();
    let x = trace::counter(B, 16).unwrap();
    let two = trace::literal_u32(B, 2, 1).unwrap();
    let y = trace::mul(&x, &two).unwrap();
    let z = trace::add(&y, &x).unwrap();

    let values: Vec<u32> = trace::read(&z).unwrap();
    let expected: Vec<u32> = (0..16).map(|i| i * 3).collect();
    assert_eq!(values, expected);
}

#[test]
fn literal_roots_materialize_without_a_kernel() {
    let _serial = serial();
    init();
    let before = state::cache_counters();
    let ones = trace::literal_f32(B, 1.5, 32).unwrap();
    let values: Vec<f32> = trace::read(&ones).unwrap();
    assert_eq!(values, vec![1.5f32; 32]);

    // Materializing a literal is a fill, not a kernel launch.
    let after = state::cache_counters();
    assert_eq!(before.launches, after.launches);
}

#[test]
fn width_groups_launch_separate_kernels() {
    let _serial = serial();
    init();
    let a = trace::counter(B, 64).unwrap();
    let b = trace::counter(B, 32).unwrap();
    let one = trace::literal_u32(B, 1, 1).unwrap();
    let a1 = trace::add(&a, &one).unwrap();
    let b1 = trace::add(&b, &one).unwrap();

    trace::schedule(&a1).unwrap();
    trace::schedule(&b1).unwrap();

    let before = state::cache_counters();
    crate::eval(B).unwrap();
    let after = state::cache_counters();
    assert_eq!(after.launches - before.launches, 2);

    let a_values: Vec<u32> = trace::read(&a1).unwrap();
    let b_values: Vec<u32> = trace::read(&b1).unwrap();
    assert_eq!(a_values[63], 64);
    assert_eq!(b_values[31], 32);
}

#[test]
fn identical_schedules_hit_the_kernel_cache() {
    let _serial = serial();
    init();

    let run = || {
        let x = trace::counter(B, 100).unwrap();
        let k = trace::literal_u32(B, 7777, 1).unwrap();
        let y = trace::add(&x, &k).unwrap();
        let values: Vec<u32> = trace::read(&y).unwrap();
        assert_eq!(values[99], 99 + 7777);
    };

    run();
    let first = state::cache_counters();
    run();
    let second = state::cache_counters();

    assert_eq!(second.hits - first.hits, 1);
    assert_eq!(second.hard_misses, first.hard_misses);
    assert_eq!(second.soft_misses, first.soft_misses);
}

#[test]
fn evaluated_variables_are_not_rescheduled() {
    let _serial = serial();
    init();
    let x = trace::counter(B, 8).unwrap();
    let one = trace::literal_u32(B, 1, 1).unwrap();
    let y = trace::add(&x, &one).unwrap();
    let _: Vec<u32> = trace::read(&y).unwrap();

    let before = state::cache_counters();
    trace::schedule(&y).unwrap();
    crate::eval(B).unwrap();
    let after = state::cache_counters();
    assert_eq!(before.launches, after.launches);
}

#[test]
fn scalar_operands_broadcast() {
    let _serial = serial();
    init();
    let x = trace::counter(B, 10).unwrap();
    let f = trace::cast(&x, VarType::Float32).unwrap();
    let half = trace::literal_f32(B, 0.5, 1).unwrap();
    let y = trace::add(&f, &half).unwrap();

    let values: Vec<f32> = trace::read(&y).unwrap();
    for (i, v) in values.iter().enumerate() {
        assert_eq!(*v, i as f32 + 0.5);
    }
}

#[test]
fn comparisons_and_select() {
    let _serial = serial();
    init();
    let x = trace::counter(B, 8).unwrap();
    let four = trace::literal_u32(B, 4, 1).unwrap();
    let mask = trace::cmp(CmpOp::Lt, &x, &four).unwrap();
    let hundred = trace::literal_u32(B, 100, 1).unwrap();
    let y = trace::select(&mask, &hundred, &x).unwrap();

    let values: Vec<u32> = trace::read(&y).unwrap();
    assert_eq!(values, vec![100, 100, 100, 100, 4, 5, 6, 7]);
}

#[test]
fn scatter_reduce_outside_a_loop() {
    let _serial = serial();
    init();
    let target = trace::literal_u32(B, 0, 5).unwrap();
    let index = trace::counter(B, 20).unwrap();
    let five = trace::literal_u32(B, 5, 1).unwrap();
    let slot = trace::binop(lanejit_codegen::kir::BinOp::Div, &index, &five).unwrap();
    let one = trace::literal_u32(B, 1, 1).unwrap();

    trace::scatter_reduce(ReduceOp::Add, &target, &one, &slot, None).unwrap();
    let values: Vec<u32> = trace::read(&target).unwrap();
    assert_eq!(values, vec![5, 5, 5, 5, 0]);
}

#[test]
fn gather_reads_through_a_pointer() {
    let _serial = serial();
    init();
    let table = trace::array_from_slice(B, VarType::UInt32, &[10u32, 11, 12, 13]).unwrap();
    let index = trace::counter(B, 4).unwrap();
    let gathered = trace::gather(&table, &index, None).unwrap();
    let values: Vec<u32> = trace::read(&gathered).unwrap();
    assert_eq!(values, vec![10, 11, 12, 13]);
}

#[test]
fn dependency_order_is_respected_in_schedule() {
    let _serial = serial();
    init();
    // A chain a -> b -> c must appear in dependency order inside one group.
    let a = trace::counter(B, 12).unwrap();
    let one = trace::literal_u32(B, 1, 1).unwrap();
    let b = trace::add(&a, &one).unwrap();
    let c = trace::mul(&b, &b).unwrap();

    let values: Vec<u32> = trace::read(&c).unwrap();
    for (i, v) in values.iter().enumerate() {
        let expected = (i as u32 + 1) * (i as u32 + 1);
        assert_eq!(*v, expected);
    }
}

#[test]
fn external_callbacks_run_once_per_eval() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let _serial = serial();
    init();
    let calls = Arc::new(AtomicUsize::new(0));

    let x = trace::counter(B, 4).unwrap();
    let one = trace::literal_u32(B, 1, 1).unwrap();
    let y = trace::add(&x, &one).unwrap();

    {
        let calls = Arc::clone(&calls);
        let mut state = state::lock();
        state.extra.insert(
            y.index(),
            crate::var::Extra {
                callback: Some(crate::var::ExtraCallback::External(Box::new(move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                }))),
                dep: Vec::new(),
            },
        );
        crate::var::get_mut(&mut state, y.index()).unwrap().extra = true;
    }

    let _: Vec<u32> = trace::read(&y).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A second read needs no eval, so the callback must not fire again.
    let _: Vec<u32> = trace::read(&y).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

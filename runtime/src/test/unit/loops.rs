//! Wavefront loop scenarios: masked state updates and side effects.

use lanejit_codegen::kir::CmpOp;

use crate::test::helpers::{serial, WavefrontLoop};
use crate::trace;
use crate::{JitBackend, ReduceOp, VarType};

const B: JitBackend = JitBackend::Cpu;

#[test]
fn loop_with_masked_state() {
    let _serial = serial();

    let mut x = trace::counter(B, 10).unwrap();
    let mut y = trace::literal_f32(B, 0.0, 1).unwrap();
    let mut z = trace::literal_f32(B, 1.0, 1).unwrap();

    let one_u = trace::literal_u32(B, 1, 1).unwrap();
    let one_f = trace::literal_f32(B, 1.0, 1).unwrap();
    let five = trace::literal_u32(B, 5, 1).unwrap();

    let mut looped = WavefrontLoop::new(B);
    loop {
        let cond = trace::cmp(CmpOp::Lt, &x, &five).unwrap();
        if !looped.cond(cond, &mut [&mut x, &mut y, &mut z]).unwrap() {
            break;
        }
        let xf = trace::cast(&x, VarType::Float32).unwrap();
        y = trace::add(&y, &xf).unwrap();
        x = trace::add(&x, &one_u).unwrap();
        z = trace::add(&z, &one_f).unwrap();
    }

    let z_values: Vec<f32> = trace::read(&z).unwrap();
    let y_values: Vec<f32> = trace::read(&y).unwrap();
    let x_values: Vec<u32> = trace::read(&x).unwrap();

    assert_eq!(z_values, vec![6.0, 5.0, 4.0, 3.0, 2.0, 1.0, 1.0, 1.0, 1.0, 1.0]);
    assert_eq!(y_values, vec![10.0, 10.0, 9.0, 7.0, 4.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    assert_eq!(x_values, vec![5, 5, 5, 5, 5, 5, 6, 7, 8, 9]);
}

#[test]
fn loop_side_effects_happen_once() {
    let _serial = serial();

    let mut x = trace::counter(B, 10).unwrap();
    let mut y = trace::literal_f32(B, 0.0, 1).unwrap();
    let target = trace::literal_u32(B, 0, 11).unwrap();

    let one_u = trace::literal_u32(B, 1, 1).unwrap();
    let five = trace::literal_u32(B, 5, 1).unwrap();

    let mut looped = WavefrontLoop::new(B);
    loop {
        let cond = trace::cmp(CmpOp::Lt, &x, &five).unwrap();
        if !looped.cond(cond, &mut [&mut x, &mut y]).unwrap() {
            break;
        }
        trace::scatter_reduce(ReduceOp::Add, &target, &one_u, &x, None).unwrap();
        let xf = trace::cast(&x, VarType::Float32).unwrap();
        y = trace::add(&y, &xf).unwrap();
        x = trace::add(&x, &one_u).unwrap();
    }

    let y_values: Vec<f32> = trace::read(&y).unwrap();
    let x_values: Vec<u32> = trace::read(&x).unwrap();
    let target_values: Vec<u32> = trace::read(&target).unwrap();

    assert_eq!(y_values, vec![10.0, 10.0, 9.0, 7.0, 4.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    assert_eq!(x_values, vec![5, 5, 5, 5, 5, 5, 6, 7, 8, 9]);
    assert_eq!(target_values, vec![1, 2, 3, 4, 5, 0, 0, 0, 0, 0, 0]);
}

#[test]
fn loop_side_effect_without_loop_variables() {
    let _serial = serial();

    let mut x = trace::counter(B, 10).unwrap();
    let mut y = trace::literal_f32(B, 0.0, 1).unwrap();
    let target = trace::literal_u32(B, 0, 11).unwrap();

    let one_u = trace::literal_u32(B, 1, 1).unwrap();
    let two = trace::literal_u32(B, 2, 1).unwrap();
    let five = trace::literal_u32(B, 5, 1).unwrap();

    let mut looped = WavefrontLoop::new(B);
    loop {
        let cond = trace::cmp(CmpOp::Lt, &x, &five).unwrap();
        if !looped.cond(cond, &mut [&mut x, &mut y]).unwrap() {
            break;
        }
        // The scattered value and index are loop-invariant; only the mask
        // stack limits how many lanes contribute.
        trace::scatter_reduce(ReduceOp::Add, &target, &two, &two, None).unwrap();
        let xf = trace::cast(&x, VarType::Float32).unwrap();
        y = trace::add(&y, &xf).unwrap();
        x = trace::add(&x, &one_u).unwrap();
    }

    let target_values: Vec<u32> = trace::read(&target).unwrap();
    assert_eq!(target_values, vec![0, 0, 30, 0, 0, 0, 0, 0, 0, 0, 0]);
}

#[test]
fn side_effect_rollback_discards_queued_scatters() {
    let _serial = serial();

    let target = trace::literal_u32(B, 0, 4).unwrap();
    let index = trace::counter(B, 4).unwrap();
    let one = trace::literal_u32(B, 1, 1).unwrap();

    let checkpoint = crate::with_thread_state(B, |ts| Ok(ts.side_effects_scheduled())).unwrap();
    trace::scatter_reduce(ReduceOp::Add, &target, &one, &index, None).unwrap();
    crate::with_thread_state(B, |ts| ts.side_effects_rollback(checkpoint)).unwrap();

    let values: Vec<u32> = trace::read(&target).unwrap();
    assert_eq!(values, vec![0, 0, 0, 0]);
}

#[test]
fn loop_masked_side_effect_at_scale() {
    let _serial = serial();

    let mut x = trace::counter(B, 1_000_000).unwrap();
    let target = trace::literal_u32(B, 0, 10).unwrap();

    let one = trace::literal_u32(B, 1, 1).unwrap();
    let ten = trace::literal_u32(B, 10, 1).unwrap();

    let mut looped = WavefrontLoop::new(B);
    loop {
        let cond = trace::cmp(CmpOp::Lt, &x, &ten).unwrap();
        if !looped.cond(cond, &mut [&mut x]).unwrap() {
            break;
        }
        // Unmasked lanes would index far past the target buffer.
        trace::scatter_reduce(ReduceOp::Add, &target, &one, &x, None).unwrap();
        x = trace::add(&x, &one).unwrap();
    }

    let target_values: Vec<u32> = trace::read(&target).unwrap();
    assert_eq!(target_values, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
}

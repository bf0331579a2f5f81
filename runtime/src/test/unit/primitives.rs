//! Laws of the parallel primitives on the CPU backend.

use lanejit_device::alloc::{self, AllocType};

use crate::primitives::{set_cpu_block_size, AggregationEntry};
use crate::test::helpers::serial;
use crate::thread_state::with_thread_state;
use crate::{memory, JitBackend, ReduceOp, VarType};

const B: JitBackend = JitBackend::Cpu;

fn upload<T: Copy>(values: &[T]) -> *mut u8 {
    let bytes = std::mem::size_of_val(values);
    let ptr = alloc::malloc(AllocType::HostAsync, bytes).unwrap();
    unsafe { std::ptr::copy_nonoverlapping(values.as_ptr() as *const u8, ptr, bytes) };
    ptr
}

fn download<T: Copy + Default>(ptr: *const u8, count: usize) -> Vec<T> {
    crate::sync_thread(B).unwrap();
    let mut out = vec![T::default(); count];
    unsafe {
        std::ptr::copy_nonoverlapping(
            ptr,
            out.as_mut_ptr() as *mut u8,
            count * std::mem::size_of::<T>(),
        )
    };
    out
}

fn discard(ptr: *mut u8) {
    crate::sync_thread(B).unwrap();
    memory::free_async(ptr).unwrap();
    memory::release_all(memory::take_pending());
}

#[test]
fn memset_patterns() {
    let _serial = serial();
    let out = alloc::malloc(AllocType::HostAsync, 64).unwrap();
    with_thread_state(B, |ts| ts.memset_async(out, 16, 4, &0xdeadbeefu32.to_ne_bytes()))
        .unwrap();
    let values: Vec<u32> = download(out, 16);
    assert_eq!(values, vec![0xdeadbeefu32; 16]);

    // All-zero patterns degenerate to a byte fill.
    with_thread_state(B, |ts| ts.memset_async(out, 8, 8, &0u64.to_ne_bytes())).unwrap();
    let values: Vec<u64> = download(out, 8);
    assert_eq!(values, vec![0u64; 8]);
    discard(out);
}

#[test]
fn memset_rejects_bad_element_size() {
    let _serial = serial();
    let out = alloc::malloc(AllocType::HostAsync, 64).unwrap();
    let result = with_thread_state(B, |ts| ts.memset_async(out, 4, 3, &[0u8; 8]));
    assert!(result.is_err());
    discard(out);
}

#[test]
fn reduce_sums_match_closed_forms() {
    let _serial = serial();
    set_cpu_block_size(256);

    // 1024 stays within one launch tier, 2048 forces the two-pass path.
    for (n, expected) in [(1024u32, 523_776u32), (2048, 2_096_128)] {
        let values: Vec<u32> = (0..n).collect();
        let input = upload(&values);
        let out = alloc::malloc(AllocType::HostAsync, 4).unwrap();
        with_thread_state(B, |ts| {
            ts.reduce(VarType::UInt32, ReduceOp::Add, input as *const u8, n, out)
        })
        .unwrap();
        let result: Vec<u32> = download(out, 1);
        assert_eq!(result[0], expected);
        discard(input);
        discard(out);
    }
    set_cpu_block_size(16384);
}

#[test]
fn reduce_min_max_and_or() {
    let _serial = serial();
    let values: Vec<u32> = vec![7, 3, 9, 12, 5, 3];
    let input = upload(&values);
    let out = alloc::malloc(AllocType::HostAsync, 4).unwrap();

    let run = |op: ReduceOp| -> u32 {
        with_thread_state(B, |ts| {
            ts.reduce(VarType::UInt32, op, input as *const u8, values.len() as u32, out)
        })
        .unwrap();
        download::<u32>(out, 1)[0]
    };

    assert_eq!(run(ReduceOp::Min), 3);
    assert_eq!(run(ReduceOp::Max), 12);
    assert_eq!(run(ReduceOp::And), 7 & 3 & 9 & 12 & 5 & 3);
    assert_eq!(run(ReduceOp::Or), 7 | 3 | 9 | 12 | 5);
    assert_eq!(run(ReduceOp::Mul), 7 * 3 * 9 * 12 * 5 * 3);
    discard(input);
    discard(out);
}

#[test]
fn reduce_float_with_tolerance() {
    let _serial = serial();
    set_cpu_block_size(64);
    let values: Vec<f32> = (0..1000).map(|i| (i as f32) * 0.25).collect();
    let input = upload(&values);
    let out = alloc::malloc(AllocType::HostAsync, 4).unwrap();
    with_thread_state(B, |ts| {
        ts.reduce(VarType::Float32, ReduceOp::Add, input as *const u8, 1000, out)
    })
    .unwrap();
    let result: Vec<f32> = download(out, 1);
    let expected: f32 = values.iter().sum();
    assert!((result[0] - expected).abs() < expected * 1e-5);
    set_cpu_block_size(16384);
    discard(input);
    discard(out);
}

#[test]
fn all_any_ignore_padding() {
    let _serial = serial();
    // Size 5 is not a multiple of four, so the filler path runs.
    let ones = [1u8, 1, 1, 1, 1];
    let ptr = upload(&ones);
    let (all, any) = with_thread_state(B, |ts| {
        Ok((ts.all(ptr, 5).unwrap(), ts.any(ptr, 5).unwrap()))
    })
    .unwrap();
    assert!(all);
    assert!(any);
    discard(ptr);

    let mixed = [1u8, 0, 1, 0, 1];
    let ptr = upload(&mixed);
    let (all, any) = with_thread_state(B, |ts| {
        Ok((ts.all(ptr, 5).unwrap(), ts.any(ptr, 5).unwrap()))
    })
    .unwrap();
    assert!(!all);
    assert!(any);
    discard(ptr);

    let zeros = [0u8; 5];
    let ptr = upload(&zeros);
    let (all, any) = with_thread_state(B, |ts| {
        Ok((ts.all(ptr, 5).unwrap(), ts.any(ptr, 5).unwrap()))
    })
    .unwrap();
    assert!(!all);
    assert!(!any);
    discard(ptr);
}

#[test]
fn prefix_sum_laws() {
    let _serial = serial();
    set_cpu_block_size(8);

    let ones = vec![1u32; 8];
    let input = upload(&ones);
    let out = alloc::malloc(AllocType::HostAsync, 32).unwrap();

    with_thread_state(B, |ts| {
        ts.prefix_sum(VarType::UInt32, true, input as *const u8, 8, out)
    })
    .unwrap();
    assert_eq!(download::<u32>(out, 8), vec![0, 1, 2, 3, 4, 5, 6, 7]);

    with_thread_state(B, |ts| {
        ts.prefix_sum(VarType::UInt32, false, input as *const u8, 8, out)
    })
    .unwrap();
    assert_eq!(download::<u32>(out, 8), vec![1, 2, 3, 4, 5, 6, 7, 8]);

    // In-place form agrees.
    with_thread_state(B, |ts| {
        ts.prefix_sum(VarType::UInt32, false, input as *const u8, 8, input)
    })
    .unwrap();
    assert_eq!(download::<u32>(input, 8), vec![1, 2, 3, 4, 5, 6, 7, 8]);

    set_cpu_block_size(16384);
    discard(input);
    discard(out);
}

#[test]
fn prefix_sum_multi_block() {
    let _serial = serial();
    set_cpu_block_size(32);

    let n = 1000u32;
    let values: Vec<u32> = (0..n).collect();
    let input = upload(&values);
    let out = alloc::malloc(AllocType::HostAsync, (n * 4) as usize).unwrap();
    with_thread_state(B, |ts| {
        ts.prefix_sum(VarType::UInt32, false, input as *const u8, n, out)
    })
    .unwrap();

    let result: Vec<u32> = download(out, n as usize);
    let mut running = 0u32;
    for (i, v) in result.iter().enumerate() {
        running += i as u32;
        assert_eq!(*v, running);
    }

    set_cpu_block_size(16384);
    discard(input);
    discard(out);
}

#[test]
fn prefix_sum_int32_normalizes_to_unsigned() {
    let _serial = serial();
    let values: Vec<i32> = vec![3, -1, 4, -1, 5];
    let input = upload(&values);
    let out = alloc::malloc(AllocType::HostAsync, 32).unwrap();
    with_thread_state(B, |ts| {
        ts.prefix_sum(VarType::Int32, false, input as *const u8, 5, out)
    })
    .unwrap();
    assert_eq!(download::<i32>(out, 5), vec![3, 2, 6, 5, 10]);
    discard(input);
    discard(out);
}

#[test]
fn compress_returns_increasing_indices() {
    let _serial = serial();
    set_cpu_block_size(16);

    let mask: Vec<u8> = (0..100u32).map(|i| (i % 3 == 0) as u8).collect();
    let input = upload(&mask);
    let out = alloc::malloc(AllocType::HostAsync, 100 * 4).unwrap();

    let count = with_thread_state(B, |ts| ts.compress(input as *const u8, 100, out as *mut u32))
        .unwrap();

    let expected: Vec<u32> = (0..100).filter(|i| i % 3 == 0).collect();
    assert_eq!(count as usize, expected.len());
    let indices: Vec<u32> = download(out, count as usize);
    assert_eq!(indices, expected);

    set_cpu_block_size(16384);
    discard(input);
    discard(out);
}

#[test]
fn mkperm_sorts_stably_into_buckets() {
    let _serial = serial();
    let values: Vec<u32> = vec![2, 0, 1, 2, 0, 1, 0, 2];
    let input = upload(&values);
    let perm_buf = alloc::malloc(AllocType::HostAsync, values.len() * 4).unwrap();
    let offsets_buf = alloc::malloc(AllocType::HostAsync, (3 * 4 + 1) * 4).unwrap();

    let unique = with_thread_state(B, |ts| {
        ts.mkperm(
            input as *const u32,
            values.len() as u32,
            3,
            perm_buf as *mut u32,
            Some(offsets_buf as *mut u32),
        )
    })
    .unwrap();
    assert_eq!(unique, 3);

    let perm: Vec<u32> = download(perm_buf, values.len());

    // perm is a permutation of 0..n in bucket order...
    let mut sorted = perm.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, (0..values.len() as u32).collect::<Vec<_>>());
    for window in perm.windows(2) {
        assert!(values[window[0] as usize] <= values[window[1] as usize]);
    }
    // ...and stable: equal buckets preserve index order.
    assert_eq!(perm, vec![1, 4, 6, 2, 5, 0, 3, 7]);

    let offsets: Vec<u32> = download(offsets_buf, 3 * 4 + 1);
    assert_eq!(offsets[12], 3);
    assert_eq!(&offsets[0..3], &[0, 0, 3]);
    assert_eq!(&offsets[4..7], &[1, 3, 2]);
    assert_eq!(&offsets[8..11], &[2, 5, 3]);

    discard(input);
    discard(perm_buf);
    discard(offsets_buf);
}

#[test]
fn mkperm_rejects_zero_buckets() {
    let _serial = serial();
    let values = vec![0u32; 4];
    let input = upload(&values);
    let perm_buf = alloc::malloc(AllocType::HostAsync, 16).unwrap();
    let result = with_thread_state(B, |ts| {
        ts.mkperm(input as *const u32, 4, 0, perm_buf as *mut u32, None)
    });
    assert!(result.is_err());
    discard(input);
    discard(perm_buf);
}

#[test]
fn block_copy_replicates_and_block_sum_reduces() {
    let _serial = serial();
    let values: Vec<u32> = vec![1, 2, 3];
    let input = upload(&values);
    let copied = alloc::malloc(AllocType::HostAsync, 3 * 4 * 4).unwrap();

    with_thread_state(B, |ts| {
        ts.block_copy(VarType::UInt32, input as *const u8, copied, 3, 4)
    })
    .unwrap();
    assert_eq!(
        download::<u32>(copied, 12),
        vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]
    );

    let summed = alloc::malloc(AllocType::HostAsync, 3 * 4).unwrap();
    with_thread_state(B, |ts| {
        ts.block_sum(VarType::UInt32, copied as *const u8, summed, 3, 4)
    })
    .unwrap();
    assert_eq!(download::<u32>(summed, 3), vec![4, 8, 12]);

    // block_size == 1 degenerates to a copy.
    let direct = alloc::malloc(AllocType::HostAsync, 3 * 4).unwrap();
    with_thread_state(B, |ts| {
        ts.block_copy(VarType::UInt32, input as *const u8, direct, 3, 1)
    })
    .unwrap();
    assert_eq!(download::<u32>(direct, 3), values);

    discard(input);
    discard(copied);
    discard(summed);
    discard(direct);
}

#[test]
fn poke_publishes_small_values() {
    let _serial = serial();
    let cell = alloc::malloc(AllocType::HostAsync, 8).unwrap();
    with_thread_state(B, |ts| ts.poke(cell, &0x1122334455667788u64.to_ne_bytes())).unwrap();
    assert_eq!(download::<u64>(cell, 1)[0], 0x1122334455667788);

    with_thread_state(B, |ts| ts.poke(cell, &[0xaau8])).unwrap();
    assert_eq!(download::<u64>(cell, 1)[0] & 0xff, 0xaa);

    assert!(with_thread_state(B, |ts| ts.poke(cell, &[0u8; 3])).is_err());
    discard(cell);
}

#[test]
fn aggregate_mixes_immediates_and_copies() {
    let _serial = serial();
    let source = [0x4242u16];
    let dst = alloc::malloc(AllocType::HostAsync, 16).unwrap();
    with_thread_state(B, |ts| ts.memset_async(dst, 16, 1, &[0u8])).unwrap();

    let entries = vec![
        AggregationEntry { offset: 0, size: 4, src: 0x11223344 },
        AggregationEntry { offset: 4, size: -2, src: source.as_ptr() as usize },
        AggregationEntry { offset: 8, size: 1, src: 0x99 },
    ];
    with_thread_state(B, |ts| ts.aggregate(dst, entries)).unwrap();

    crate::sync_thread(B).unwrap();
    let bytes: Vec<u8> = download(dst, 16);
    assert_eq!(u32::from_ne_bytes(bytes[0..4].try_into().unwrap()), 0x11223344);
    assert_eq!(u16::from_ne_bytes(bytes[4..6].try_into().unwrap()), 0x4242);
    assert_eq!(bytes[8], 0x99);
    discard(dst);
}

#[test]
fn host_funcs_observe_queue_order() {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    let _serial = serial();
    let cell = alloc::malloc(AllocType::HostAsync, 4).unwrap();
    let seen = Arc::new(AtomicU32::new(0));

    with_thread_state(B, |ts| {
        ts.memset_async(cell, 1, 4, &7u32.to_ne_bytes())?;
        let seen = Arc::clone(&seen);
        let probe = lanejit_device::SendPtr(cell);
        ts.enqueue_host_func(Box::new(move || {
            let value = unsafe { *(probe.get() as *const u32) };
            seen.store(value, Ordering::SeqCst);
        }))
    })
    .unwrap();

    crate::sync_thread(B).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 7);
    discard(cell);
}

#[test]
fn memcpy_async_chains_after_writes() {
    let _serial = serial();
    let src = alloc::malloc(AllocType::HostAsync, 64).unwrap();
    let dst = alloc::malloc(AllocType::HostAsync, 64).unwrap();

    with_thread_state(B, |ts| {
        ts.memset_async(src, 16, 4, &5u32.to_ne_bytes())?;
        ts.memcpy_async(dst, src as *const u8, 64)
    })
    .unwrap();

    assert_eq!(download::<u32>(dst, 16), vec![5u32; 16]);
    discard(src);
    discard(dst);
}

//! CPU implementations of the parallel primitives.
//!
//! Every operation is one or more tasks chained onto the thread state's
//! task, so operations submitted in program order are observed in program
//! order. Work is split into blocks of [`cpu_block_size`] elements whenever
//! more than one pool worker is available.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use lanejit_device::alloc::{self, AllocType};
use lanejit_device::{pool_size, SendPtr, Task};
use lanejit_dtype::{KernelType, ReduceOp, VarType};

use crate::error::{Result, UnsupportedTypeSnafu};
use crate::flags::{flag, JitFlag};
use crate::history::{self, KernelHistoryEntry};
use crate::memory;
use crate::primitives::{cpu_block_size, AggregationEntry};
use crate::thread_state::CpuState;
use crate::JitBackend;

/// Chain a task onto the thread state's queue, honoring the launch-blocking
/// and kernel-history flags.
pub(crate) fn submit(
    cpu: &mut CpuState,
    kind: KernelType,
    width: u32,
    blocks: u32,
    func: impl Fn(u32) + Send + Sync + 'static,
) {
    let task = match &cpu.task {
        Some(previous) => Task::submit(&[previous], blocks.max(1), func),
        None => Task::submit(&[], blocks.max(1), func),
    };

    if flag(JitFlag::LaunchBlocking) {
        task.wait();
    }
    if flag(JitFlag::KernelHistory) {
        let mut entry = KernelHistoryEntry::new(JitBackend::Cpu, kind, width);
        entry.task = Some(task.clone());
        history::append(entry);
    }

    cpu.task = Some(task);
}

/// Split `size` elements into pool blocks: `(block_size, block_count)`.
fn partition(size: u32) -> (u32, u32) {
    if pool_size() > 1 {
        let block_size = cpu_block_size();
        (block_size, size.div_ceil(block_size))
    } else {
        (size.max(1), 1)
    }
}

// ---------------------------------------------------------------------------
// Scalar kernels
// ---------------------------------------------------------------------------

/// Host-side scalar arithmetic used by the reduction and scan kernels.
trait Arith: Copy + Send + 'static {
    fn zero() -> Self;
    fn one() -> Self;
    fn min_identity() -> Self;
    fn max_identity() -> Self;
    fn add(self, other: Self) -> Self;
    fn mul(self, other: Self) -> Self;
    fn min_(self, other: Self) -> Self;
    fn max_(self, other: Self) -> Self;
}

macro_rules! impl_arith_int {
    ($($t:ty),*) => {$(
        impl Arith for $t {
            fn zero() -> Self { 0 }
            fn one() -> Self { 1 }
            fn min_identity() -> Self { <$t>::MAX }
            fn max_identity() -> Self { <$t>::MIN }
            fn add(self, other: Self) -> Self { self.wrapping_add(other) }
            fn mul(self, other: Self) -> Self { self.wrapping_mul(other) }
            fn min_(self, other: Self) -> Self { self.min(other) }
            fn max_(self, other: Self) -> Self { self.max(other) }
        }
    )*};
}

impl_arith_int!(u8, u16, u32, u64, i8, i16, i32, i64);

macro_rules! impl_arith_float {
    ($($t:ty),*) => {$(
        impl Arith for $t {
            fn zero() -> Self { 0.0 }
            fn one() -> Self { 1.0 }
            fn min_identity() -> Self { <$t>::INFINITY }
            fn max_identity() -> Self { <$t>::NEG_INFINITY }
            fn add(self, other: Self) -> Self { self + other }
            fn mul(self, other: Self) -> Self { self * other }
            fn min_(self, other: Self) -> Self { self.min(other) }
            fn max_(self, other: Self) -> Self { self.max(other) }
        }
    )*};
}

impl_arith_float!(f32, f64);

impl Arith for half::f16 {
    fn zero() -> Self {
        half::f16::from_f32(0.0)
    }
    fn one() -> Self {
        half::f16::from_f32(1.0)
    }
    fn min_identity() -> Self {
        half::f16::INFINITY
    }
    fn max_identity() -> Self {
        half::f16::NEG_INFINITY
    }
    fn add(self, other: Self) -> Self {
        half::f16::from_f32(self.to_f32() + other.to_f32())
    }
    fn mul(self, other: Self) -> Self {
        half::f16::from_f32(self.to_f32() * other.to_f32())
    }
    fn min_(self, other: Self) -> Self {
        if other < self {
            other
        } else {
            self
        }
    }
    fn max_(self, other: Self) -> Self {
        if other > self {
            other
        } else {
            self
        }
    }
}

type Reduction = fn(*const u8, u32, u32, *mut u8);

fn red_fold<T: Arith>(
    ptr: *const u8,
    start: u32,
    end: u32,
    out: *mut u8,
    identity: T,
    fold: fn(T, T) -> T,
) {
    let p = ptr as *const T;
    let mut accum = identity;
    for i in start..end {
        accum = fold(accum, unsafe { *p.add(i as usize) });
    }
    unsafe { *(out as *mut T) = accum };
}

fn red_add<T: Arith>(ptr: *const u8, start: u32, end: u32, out: *mut u8) {
    red_fold(ptr, start, end, out, T::zero(), T::add);
}
fn red_mul<T: Arith>(ptr: *const u8, start: u32, end: u32, out: *mut u8) {
    red_fold(ptr, start, end, out, T::one(), T::mul);
}
fn red_min<T: Arith>(ptr: *const u8, start: u32, end: u32, out: *mut u8) {
    red_fold(ptr, start, end, out, T::min_identity(), T::min_);
}
fn red_max<T: Arith>(ptr: *const u8, start: u32, end: u32, out: *mut u8) {
    red_fold(ptr, start, end, out, T::max_identity(), T::max_);
}

/// Bitwise reductions reinterpret lanes as unsigned words.
trait Bits: Copy + Send + 'static {
    fn ones() -> Self;
    fn zeros() -> Self;
    fn and(self, other: Self) -> Self;
    fn or(self, other: Self) -> Self;
}

macro_rules! impl_bits {
    ($($t:ty),*) => {$(
        impl Bits for $t {
            fn ones() -> Self { <$t>::MAX }
            fn zeros() -> Self { 0 }
            fn and(self, other: Self) -> Self { self & other }
            fn or(self, other: Self) -> Self { self | other }
        }
    )*};
}

impl_bits!(u8, u16, u32, u64);

fn red_and<T: Bits>(ptr: *const u8, start: u32, end: u32, out: *mut u8) {
    let p = ptr as *const T;
    let mut accum = T::ones();
    for i in start..end {
        accum = accum.and(unsafe { *p.add(i as usize) });
    }
    unsafe { *(out as *mut T) = accum };
}

fn red_or<T: Bits>(ptr: *const u8, start: u32, end: u32, out: *mut u8) {
    let p = ptr as *const T;
    let mut accum = T::zeros();
    for i in start..end {
        accum = accum.or(unsafe { *p.add(i as usize) });
    }
    unsafe { *(out as *mut T) = accum };
}

fn arith_reduction<T: Arith>(op: ReduceOp) -> Option<Reduction> {
    Some(match op {
        ReduceOp::Add => red_add::<T>,
        ReduceOp::Mul => red_mul::<T>,
        ReduceOp::Min => red_min::<T>,
        ReduceOp::Max => red_max::<T>,
        ReduceOp::And | ReduceOp::Or => return None,
    })
}

fn bit_reduction(ty: VarType, op: ReduceOp) -> Option<Reduction> {
    let and = matches!(op, ReduceOp::And);
    Some(match ty.make_unsigned() {
        VarType::Bool | VarType::UInt8 => {
            if and {
                red_and::<u8>
            } else {
                red_or::<u8>
            }
        }
        VarType::UInt16 => {
            if and {
                red_and::<u16>
            } else {
                red_or::<u16>
            }
        }
        VarType::UInt32 => {
            if and {
                red_and::<u32>
            } else {
                red_or::<u32>
            }
        }
        VarType::UInt64 => {
            if and {
                red_and::<u64>
            } else {
                red_or::<u64>
            }
        }
        _ => return None,
    })
}

fn reduction_fn(ty: VarType, op: ReduceOp) -> Result<Reduction> {
    let reduction = match op {
        ReduceOp::And | ReduceOp::Or => bit_reduction(ty, op),
        _ => match ty {
            VarType::Bool | VarType::UInt8 => arith_reduction::<u8>(op),
            VarType::Int8 => arith_reduction::<i8>(op),
            VarType::UInt16 => arith_reduction::<u16>(op),
            VarType::Int16 => arith_reduction::<i16>(op),
            VarType::UInt32 => arith_reduction::<u32>(op),
            VarType::Int32 => arith_reduction::<i32>(op),
            VarType::UInt64 => arith_reduction::<u64>(op),
            VarType::Int64 => arith_reduction::<i64>(op),
            VarType::Float16 => arith_reduction::<half::f16>(op),
            VarType::Float32 => arith_reduction::<f32>(op),
            VarType::Float64 => arith_reduction::<f64>(op),
            _ => None,
        },
    };
    reduction
        .ok_or_else(|| UnsupportedTypeSnafu { type_name: ty.name(), primitive: "reduce" }.build())
}

// ---------------------------------------------------------------------------
// memset / memcpy
// ---------------------------------------------------------------------------

pub fn memset_async(
    cpu: &mut CpuState,
    ptr: *mut u8,
    size: u32,
    isize: u32,
    src: &[u8],
) -> Result<()> {
    if size == 0 {
        return Ok(());
    }

    let mut pattern = [0u8; 8];
    pattern[..isize as usize].copy_from_slice(&src[..isize as usize]);

    // An all-zero pattern degenerates to a plain byte fill.
    let (size, isize) = if pattern[..isize as usize].iter().all(|&b| b == 0) {
        (size * isize, 1u32)
    } else {
        (size, isize)
    };

    let (block_size, blocks) = partition(size);
    let dst = SendPtr(ptr);
    submit(cpu, KernelType::Other, size, blocks, move |index| {
        let start = index * block_size;
        let end = (start + block_size).min(size);
        unsafe {
            match isize {
                1 => std::ptr::write_bytes(
                    dst.get().add(start as usize),
                    pattern[0],
                    (end - start) as usize,
                ),
                2 => {
                    let value = u16::from_ne_bytes(pattern[..2].try_into().unwrap());
                    let p = dst.get() as *mut u16;
                    for i in start..end {
                        *p.add(i as usize) = value;
                    }
                }
                4 => {
                    let value = u32::from_ne_bytes(pattern[..4].try_into().unwrap());
                    let p = dst.get() as *mut u32;
                    for i in start..end {
                        *p.add(i as usize) = value;
                    }
                }
                _ => {
                    let value = u64::from_ne_bytes(pattern);
                    let p = dst.get() as *mut u64;
                    for i in start..end {
                        *p.add(i as usize) = value;
                    }
                }
            }
        }
    });
    Ok(())
}

pub fn memcpy_async(cpu: &mut CpuState, dst: *mut u8, src: *const u8, size: usize) -> Result<()> {
    let to = SendPtr(dst);
    let from = SendPtr(src as *mut u8);
    submit(cpu, KernelType::Other, size as u32, 1, move |_| unsafe {
        std::ptr::copy_nonoverlapping(from.get() as *const u8, to.get(), size);
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// reduce
// ---------------------------------------------------------------------------

pub fn reduce(
    cpu: &mut CpuState,
    ty: VarType,
    op: ReduceOp,
    ptr: *const u8,
    size: u32,
    out: *mut u8,
) -> Result<()> {
    let tsize = ty.size() as u32;
    let reduction = reduction_fn(ty, op)?;
    let (block_size, blocks) = partition(size);

    tracing::debug!(
        type_name = ty.name(),
        op = op.name(),
        size,
        blocks,
        "reduce"
    );

    let target =
        if blocks > 1 { alloc::malloc(AllocType::HostAsync, (blocks * tsize) as usize)? } else { out };

    let input = SendPtr(ptr as *mut u8);
    let scratch = SendPtr(target);
    submit(cpu, KernelType::Reduce, size, blocks, move |index| {
        let start = index * block_size;
        let end = (start + block_size).min(size);
        reduction(input.get() as *const u8, start, end, unsafe {
            scratch.get().add((index * tsize) as usize)
        });
    });

    if blocks > 1 {
        reduce(cpu, ty, op, target as *const u8, blocks, out)?;
        memory::free_async(target)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// prefix sum
// ---------------------------------------------------------------------------

type ScanPass1 = fn(*const u8, u32, u32, u32, *mut u8);
type ScanPass2 = fn(*const u8, *mut u8, u32, u32, u32, *const u8, bool);

fn scan_pass_1<T: Arith>(input: *const u8, start: u32, end: u32, index: u32, scratch: *mut u8) {
    let p = input as *const T;
    let mut accum = T::zero();
    for i in start..end {
        accum = accum.add(unsafe { *p.add(i as usize) });
    }
    unsafe { *(scratch as *mut T).add(index as usize) = accum };
}

fn scan_pass_2<T: Arith>(
    input: *const u8,
    output: *mut u8,
    start: u32,
    end: u32,
    index: u32,
    scratch: *const u8,
    exclusive: bool,
) {
    let p = input as *const T;
    let q = output as *mut T;
    let mut accum = if scratch.is_null() {
        T::zero()
    } else {
        unsafe { *(scratch as *const T).add(index as usize) }
    };

    if exclusive {
        for i in start..end {
            let value = unsafe { *p.add(i as usize) };
            unsafe { *q.add(i as usize) = accum };
            accum = accum.add(value);
        }
    } else {
        for i in start..end {
            let value = unsafe { *p.add(i as usize) };
            accum = accum.add(value);
            unsafe { *q.add(i as usize) = accum };
        }
    }
}

fn scan_fns(ty: VarType) -> Result<(ScanPass1, ScanPass2)> {
    Ok(match ty {
        VarType::UInt32 => (scan_pass_1::<u32>, scan_pass_2::<u32>),
        VarType::UInt64 => (scan_pass_1::<u64>, scan_pass_2::<u64>),
        VarType::Float32 => (scan_pass_1::<f32>, scan_pass_2::<f32>),
        VarType::Float64 => (scan_pass_1::<f64>, scan_pass_2::<f64>),
        _ => {
            return UnsupportedTypeSnafu { type_name: ty.name(), primitive: "prefix_sum" }.fail()
        }
    })
}

pub fn prefix_sum(
    cpu: &mut CpuState,
    ty: VarType,
    exclusive: bool,
    input: *const u8,
    size: u32,
    output: *mut u8,
) -> Result<()> {
    let isize = ty.size() as u32;
    let (pass_1, pass_2) = scan_fns(ty)?;
    let (block_size, blocks) = partition(size);

    tracing::debug!(type_name = ty.name(), exclusive, size, blocks, "prefix_sum");

    let mut scratch: *mut u8 = std::ptr::null_mut();
    if blocks > 1 {
        scratch = alloc::malloc(AllocType::HostAsync, (blocks * isize) as usize)?;

        let from = SendPtr(input as *mut u8);
        let to = SendPtr(scratch);
        submit(cpu, KernelType::Other, size, blocks, move |index| {
            let start = index * block_size;
            let end = (start + block_size).min(size);
            pass_1(from.get() as *const u8, start, end, index, to.get());
        });

        // Per-block seeds: exclusive scan over the block sums.
        prefix_sum(cpu, ty, true, scratch as *const u8, blocks, scratch)?;
    }

    let from = SendPtr(input as *mut u8);
    let to = SendPtr(output);
    let seeds = SendPtr(scratch);
    submit(cpu, KernelType::Other, size, blocks, move |index| {
        let start = index * block_size;
        let end = (start + block_size).min(size);
        pass_2(
            from.get() as *const u8,
            to.get(),
            start,
            end,
            index,
            seeds.get() as *const u8,
            exclusive,
        );
    });

    if !scratch.is_null() {
        memory::free_async(scratch)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// compress
// ---------------------------------------------------------------------------

pub fn compress(cpu: &mut CpuState, input: *const u8, size: u32, output: *mut u32) -> Result<u32> {
    let (block_size, blocks) = partition(size);

    tracing::debug!(size, blocks, "compress");

    let mut scratch: *mut u8 = std::ptr::null_mut();
    if blocks > 1 {
        scratch = alloc::malloc(AllocType::HostAsync, (blocks * 4) as usize)?;

        let from = SendPtr(input as *mut u8);
        let counts = SendPtr(scratch);
        submit(cpu, KernelType::Other, size, blocks, move |index| {
            let start = index * block_size;
            let end = (start + block_size).min(size);
            let p = from.get() as *const u8;
            let mut accum = 0u32;
            for i in start..end {
                accum += unsafe { *p.add(i as usize) } as u32;
            }
            unsafe { *(counts.get() as *mut u32).add(index as usize) = accum };
        });

        prefix_sum(cpu, VarType::UInt32, true, scratch as *const u8, blocks, scratch)?;
    }

    let count_cell = alloc::malloc(AllocType::HostAsync, 4)?;
    let from = SendPtr(input as *mut u8);
    let to = SendPtr(output);
    let seeds = SendPtr(scratch);
    let count_out = SendPtr(count_cell);
    submit(cpu, KernelType::Other, size, blocks, move |index| {
        let start = index * block_size;
        let end = (start + block_size).min(size);
        let p = from.get() as *const u8;
        let q = to.get() as *mut u32;

        let mut accum = if seeds.get().is_null() {
            0u32
        } else {
            unsafe { *(seeds.get() as *const u32).add(index as usize) }
        };

        for i in start..end {
            let value = unsafe { *p.add(i as usize) } as u32;
            if value != 0 {
                unsafe { *q.add(accum as usize) = i };
            }
            accum += value;
        }

        if end == size {
            unsafe { *(count_out.get() as *mut u32) = accum };
        }
    });

    if !scratch.is_null() {
        memory::free_async(scratch)?;
    }

    if let Some(task) = &cpu.task {
        task.wait();
    }
    let count = unsafe { *(count_cell as *const u32) };
    memory::free_async(count_cell)?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// mkperm
// ---------------------------------------------------------------------------

pub fn mkperm(
    cpu: &mut CpuState,
    ptr: *const u32,
    size: u32,
    bucket_count: u32,
    perm: *mut u32,
    offsets: Option<*mut u32>,
) -> Result<u32> {
    let workers = pool_size();
    let (block_size, blocks) = if workers > 1 {
        // Spread over the pool, but keep blocks above the scheduling
        // granularity.
        let rough = size.div_ceil(workers * 4);
        let block_size = rough.max(cpu_block_size());
        (block_size, size.div_ceil(block_size))
    } else {
        (size, 1)
    };

    tracing::debug!(size, bucket_count, block_size, blocks, "mkperm");

    // Per-block bucket tables, allocated in phase 1 and freed by the
    // scatter phase.
    let tables: Arc<Vec<AtomicUsize>> =
        Arc::new((0..blocks).map(|_| AtomicUsize::new(0)).collect());
    let unique = Arc::new(AtomicU32::new(0));

    // Phase 1: per-block occurrence counts.
    let input = SendPtr(ptr as *mut u32);
    let tables_1 = Arc::clone(&tables);
    submit(cpu, KernelType::CallReduce, size, blocks, move |index| {
        let start = index * block_size;
        let end = (start + block_size).min(size);
        let p = input.get() as *const u32;

        let mut local = vec![0u32; bucket_count as usize].into_boxed_slice();
        for i in start..end {
            local[unsafe { *p.add(i as usize) } as usize] += 1;
        }
        let raw = Box::into_raw(local) as *mut u32;
        tables_1[index as usize].store(raw as usize, Ordering::Release);
    });

    // Serial integration: turn counts into global offsets and collect the
    // non-empty buckets.
    let tables_2 = Arc::clone(&tables);
    let unique_2 = Arc::clone(&unique);
    let offsets_ptr = offsets.map(|p| SendPtr(p));
    submit(cpu, KernelType::CallReduce, size, 1, move |_| {
        let mut sum = 0u32;
        let mut unique_local = 0u32;
        for bucket in 0..bucket_count {
            let mut sum_local = 0u32;
            for table in tables_2.iter().take(blocks as usize) {
                let table = table.load(Ordering::Acquire) as *mut u32;
                unsafe {
                    let value = *table.add(bucket as usize);
                    *table.add(bucket as usize) = sum + sum_local;
                    sum_local += value;
                }
            }
            if sum_local > 0 {
                if let Some(offsets) = offsets_ptr {
                    unsafe {
                        let entry = offsets.get().add(unique_local as usize * 4);
                        *entry = bucket;
                        *entry.add(1) = sum;
                        *entry.add(2) = sum_local;
                        *entry.add(3) = 0;
                    }
                }
                unique_local += 1;
                sum += sum_local;
            }
        }
        if let Some(offsets) = offsets_ptr {
            unsafe { *offsets.get().add(bucket_count as usize * 4) = unique_local };
        }
        unique_2.store(unique_local, Ordering::Release);
    });

    let integrated = cpu.task.clone();

    // Phase 2: scatter the permutation; each block frees its table.
    let input = SendPtr(ptr as *mut u32);
    let output = SendPtr(perm);
    let tables_3 = Arc::clone(&tables);
    submit(cpu, KernelType::CallReduce, size, blocks, move |index| {
        let start = index * block_size;
        let end = (start + block_size).min(size);
        let p = input.get() as *const u32;
        let q = output.get();
        let table = tables_3[index as usize].load(Ordering::Acquire) as *mut u32;

        unsafe {
            for i in start..end {
                let bucket = *p.add(i as usize) as usize;
                let slot = *table.add(bucket);
                *table.add(bucket) = slot + 1;
                *q.add(slot as usize) = i;
            }
            let slice = std::ptr::slice_from_raw_parts_mut(table, bucket_count as usize);
            drop(Box::from_raw(slice));
        }
    });

    // The caller only needs the offsets table, which the integration pass
    // finishes; the scatter keeps running asynchronously.
    if let Some(task) = integrated {
        task.wait();
    }
    Ok(unique.load(Ordering::Acquire))
}

// ---------------------------------------------------------------------------
// block copy / block sum
// ---------------------------------------------------------------------------

type BlockOp = fn(*const u8, *mut u8, u32, u32, u32);

fn block_copy_op<T: Copy>(input: *const u8, output: *mut u8, start: u32, end: u32, block: u32) {
    let p = input as *const T;
    let q = output as *mut T;
    for i in start..end {
        let value = unsafe { *p.add(i as usize) };
        for j in 0..block {
            unsafe { *q.add((i * block + j) as usize) = value };
        }
    }
}

fn block_sum_op<T: Arith>(input: *const u8, output: *mut u8, start: u32, end: u32, block: u32) {
    let p = input as *const T;
    let q = output as *mut T;
    for i in start..end {
        let mut sum = T::zero();
        for j in 0..block {
            sum = sum.add(unsafe { *p.add((i * block + j) as usize) });
        }
        unsafe { *q.add(i as usize) = sum };
    }
}

fn block_op(ty: VarType, sum: bool) -> Result<BlockOp> {
    Ok(match ty {
        VarType::UInt8 => {
            if sum {
                block_sum_op::<u8>
            } else {
                block_copy_op::<u8>
            }
        }
        VarType::UInt16 => {
            if sum {
                block_sum_op::<u16>
            } else {
                block_copy_op::<u16>
            }
        }
        VarType::UInt32 => {
            if sum {
                block_sum_op::<u32>
            } else {
                block_copy_op::<u32>
            }
        }
        VarType::UInt64 => {
            if sum {
                block_sum_op::<u64>
            } else {
                block_copy_op::<u64>
            }
        }
        VarType::Float32 => {
            if sum {
                block_sum_op::<f32>
            } else {
                block_copy_op::<f32>
            }
        }
        VarType::Float64 => {
            if sum {
                block_sum_op::<f64>
            } else {
                block_copy_op::<f64>
            }
        }
        _ => {
            let primitive = if sum { "block_sum" } else { "block_copy" };
            return UnsupportedTypeSnafu { type_name: ty.name(), primitive }.fail();
        }
    })
}

pub fn block_copy(
    cpu: &mut CpuState,
    ty: VarType,
    input: *const u8,
    output: *mut u8,
    size: u32,
    block: u32,
) -> Result<()> {
    let op = block_op(ty, false)?;
    let (block_size, blocks) = partition(size);
    let from = SendPtr(input as *mut u8);
    let to = SendPtr(output);
    submit(cpu, KernelType::Other, size, blocks, move |index| {
        let start = index * block_size;
        let end = (start + block_size).min(size);
        op(from.get() as *const u8, to.get(), start, end, block);
    });
    Ok(())
}

pub fn block_sum(
    cpu: &mut CpuState,
    ty: VarType,
    input: *const u8,
    output: *mut u8,
    size: u32,
    block: u32,
) -> Result<()> {
    let op = block_op(ty, true)?;
    let (block_size, blocks) = partition(size);
    let from = SendPtr(input as *mut u8);
    let to = SendPtr(output);
    submit(cpu, KernelType::Other, size, blocks, move |index| {
        let start = index * block_size;
        let end = (start + block_size).min(size);
        op(from.get() as *const u8, to.get(), start, end, block);
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// poke / aggregate / host callbacks
// ---------------------------------------------------------------------------

pub fn poke(cpu: &mut CpuState, dst: *mut u8, src: &[u8]) -> Result<()> {
    let mut payload = [0u8; 8];
    let length = src.len();
    payload[..length].copy_from_slice(src);

    let to = SendPtr(dst);
    submit(cpu, KernelType::Other, length as u32, 1, move |_| unsafe {
        std::ptr::copy_nonoverlapping(payload.as_ptr(), to.get(), length);
    });
    Ok(())
}

pub fn aggregate(cpu: &mut CpuState, dst: *mut u8, entries: Vec<AggregationEntry>) -> Result<()> {
    let size = entries.len() as u32;
    let (block_size, blocks) = partition(size);
    let entries = Arc::new(entries);
    let base = SendPtr(dst);

    // The entry list is consumed: the last finished block drops it.
    submit(cpu, KernelType::Other, size, blocks, move |index| {
        let start = index * block_size;
        let end = (start + block_size).min(size);
        for entry in &entries[start as usize..end as usize] {
            let target = unsafe { base.get().add(entry.offset) };
            let source = entry.src;
            unsafe {
                match entry.size {
                    1 => *target = source as u8,
                    2 => *(target as *mut u16) = source as u16,
                    4 => *(target as *mut u32) = source as u32,
                    8 => *(target as *mut u64) = source as u64,
                    -1 => *target = *(source as *const u8),
                    -2 => *(target as *mut u16) = *(source as *const u16),
                    -4 => *(target as *mut u32) = *(source as *const u32),
                    -8 => *(target as *mut u64) = *(source as *const u64),
                    _ => {}
                }
            }
        }
    });
    Ok(())
}

pub fn enqueue_host_func(cpu: &mut CpuState, func: Box<dyn FnOnce() + Send>) -> Result<()> {
    let idle = cpu.task.as_ref().map(|t| t.completed()).unwrap_or(true);
    if idle {
        func();
        return Ok(());
    }

    let slot = Mutex::new(Some(func));
    submit(cpu, KernelType::Other, 1, 1, move |_| {
        if let Some(callback) = slot.lock().take() {
            callback();
        }
    });
    Ok(())
}

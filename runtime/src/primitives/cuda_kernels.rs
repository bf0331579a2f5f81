//! Generated CUDA C source of the builtin primitive kernels.
//!
//! The kernels are compiled once per device through NVRTC when the CUDA
//! backend is first used; entry points are looked up by the names produced
//! here (`reduce_sum_u32`, `scan_exc_large_f64`, ..).

use std::fmt::Write;

use lanejit_dtype::{ReduceOp, VarType};

/// Types with generated reduction kernels.
pub const REDUCE_TYPES: &[VarType] = &[
    VarType::UInt8,
    VarType::Int8,
    VarType::UInt16,
    VarType::Int16,
    VarType::UInt32,
    VarType::Int32,
    VarType::UInt64,
    VarType::Int64,
    VarType::Float32,
    VarType::Float64,
];

/// Types with generated prefix-sum/compress kernels.
pub const SCAN_TYPES: &[VarType] =
    &[VarType::UInt32, VarType::UInt64, VarType::Float32, VarType::Float64];

/// Types with generated block copy/sum kernels.
pub const BLOCK_TYPES: &[VarType] =
    &[VarType::UInt32, VarType::UInt64, VarType::Float32, VarType::Float64];

pub fn reduce_kernel_name(op: ReduceOp, ty: VarType) -> String {
    format!("reduce_{}_{}", op.name(), ty.name())
}

pub fn scan_kernel_name(exclusive: bool, large: bool, ty: VarType) -> String {
    format!(
        "scan_{}_{}_{}",
        if exclusive { "exc" } else { "inc" },
        if large { "large" } else { "small" },
        ty.name()
    )
}

pub fn block_kernel_name(sum: bool, ty: VarType) -> String {
    format!("block_{}_{}", if sum { "sum" } else { "copy" }, ty.name())
}

fn identity(op: ReduceOp, ty: VarType) -> &'static str {
    match (op, ty) {
        (ReduceOp::Add, t) if t.is_float() => "0.0",
        (ReduceOp::Add, _) => "0",
        (ReduceOp::Mul, t) if t.is_float() => "1.0",
        (ReduceOp::Mul, _) => "1",
        (ReduceOp::Min, VarType::Float32) => "__int_as_float(0x7f800000)",
        (ReduceOp::Min, VarType::Float64) => "__longlong_as_double(0x7ff0000000000000ll)",
        (ReduceOp::Max, VarType::Float32) => "__int_as_float(0xff800000)",
        (ReduceOp::Max, VarType::Float64) => "__longlong_as_double(0xfff0000000000000ll)",
        (ReduceOp::Min, VarType::UInt8) => "0xff",
        (ReduceOp::Min, VarType::UInt16) => "0xffff",
        (ReduceOp::Min, VarType::UInt32) => "0xffffffffu",
        (ReduceOp::Min, VarType::UInt64) => "0xffffffffffffffffull",
        (ReduceOp::Min, VarType::Int8) => "127",
        (ReduceOp::Min, VarType::Int16) => "32767",
        (ReduceOp::Min, VarType::Int32) => "2147483647",
        (ReduceOp::Min, VarType::Int64) => "9223372036854775807ll",
        (ReduceOp::Max, VarType::Int8) => "(-128)",
        (ReduceOp::Max, VarType::Int16) => "(-32768)",
        (ReduceOp::Max, VarType::Int32) => "(-2147483647 - 1)",
        (ReduceOp::Max, VarType::Int64) => "(-9223372036854775807ll - 1)",
        (ReduceOp::Max, _) => "0",
        (ReduceOp::And, _) => "~0",
        (ReduceOp::Or, _) => "0",
        (ReduceOp::Min, _) => unreachable!("Min identity not defined for {ty:?}"),
    }
}

fn combine(op: ReduceOp, ty: VarType) -> &'static str {
    match (op, ty) {
        (ReduceOp::Add, _) => "a + b",
        (ReduceOp::Mul, _) => "a * b",
        (ReduceOp::Min, VarType::Float32) => "fminf(a, b)",
        (ReduceOp::Min, VarType::Float64) => "fmin(a, b)",
        (ReduceOp::Min, _) => "a < b ? a : b",
        (ReduceOp::Max, VarType::Float32) => "fmaxf(a, b)",
        (ReduceOp::Max, VarType::Float64) => "fmax(a, b)",
        (ReduceOp::Max, _) => "a > b ? a : b",
        (ReduceOp::And, _) => "a & b",
        (ReduceOp::Or, _) => "a | b",
    }
}

/// Bit conversions between a scan element type and the 64-bit scratch words.
fn to_bits(ty: VarType) -> &'static str {
    match ty {
        VarType::Float32 => "(unsigned long long) __float_as_uint(v)",
        VarType::Float64 => "(unsigned long long) __double_as_longlong(v)",
        _ => "(unsigned long long) v",
    }
}

fn from_bits(ty: VarType) -> &'static str {
    match ty {
        VarType::Float32 => "__uint_as_float((unsigned int) w)",
        VarType::Float64 => "__longlong_as_double((long long) w)",
        VarType::UInt32 => "(unsigned int) w",
        _ => "(unsigned long long) w",
    }
}

fn items_per_thread(ty: VarType, large: bool) -> u32 {
    match (ty.size(), large) {
        (8, false) => 2,
        (_, false) => 4,
        (8, true) => 8,
        (_, true) => 16,
    }
}

/// Emit the full builtin kernel module.
pub fn builtin_source() -> String {
    let mut src = String::with_capacity(64 * 1024);

    src.push_str(
        "typedef unsigned char u8;\n\
         typedef unsigned int u32;\n\
         typedef unsigned long long u64;\n\n\
         struct AggregationEntry {\n\
         \x20   unsigned long long offset;\n\
         \x20   int size;\n\
         \x20   int pad;\n\
         \x20   unsigned long long src;\n\
         };\n\n",
    );

    // 64-bit fill used by memset_async.
    src.push_str(
        "extern \"C\" __global__ void fill_64(u64 *ptr, u32 size, u64 value) {\n\
         \x20   u32 stride = blockDim.x * gridDim.x;\n\
         \x20   for (u32 i = blockIdx.x * blockDim.x + threadIdx.x; i < size; i += stride)\n\
         \x20       ptr[i] = value;\n\
         }\n\n",
    );

    for &ty in REDUCE_TYPES {
        for op in [ReduceOp::Add, ReduceOp::Mul, ReduceOp::Min, ReduceOp::Max] {
            write_reduction(&mut src, op, ty);
        }
        if ty.is_integral() {
            write_reduction(&mut src, ReduceOp::And, ty);
            write_reduction(&mut src, ReduceOp::Or, ty);
        }
    }

    write_scan_init(&mut src);
    for &ty in SCAN_TYPES {
        for exclusive in [false, true] {
            write_scan_small(&mut src, exclusive, ty);
            write_scan_large(&mut src, exclusive, ty);
        }
    }

    write_compress_small(&mut src);
    write_compress_large(&mut src);

    write_transpose(&mut src);
    write_mkperm(&mut src);

    for &ty in BLOCK_TYPES {
        write_block_copy(&mut src, ty);
        write_block_sum(&mut src, ty);
    }

    write_poke(&mut src);
    write_aggregate(&mut src);

    src
}

fn write_reduction(src: &mut String, op: ReduceOp, ty: VarType) {
    let t = ty.cuda_name();
    let name = reduce_kernel_name(op, ty);
    let ident = identity(op, ty);
    let comb = combine(op, ty);
    let _ = write!(
        src,
        "extern \"C\" __global__ void {name}(const {t} *in, u32 n, {t} *out) {{\n\
         \x20   extern __shared__ unsigned char shared_raw[];\n\
         \x20   {t} *shared = ({t} *) shared_raw;\n\
         \x20   u32 tid = threadIdx.x, stride = blockDim.x * gridDim.x;\n\
         \x20   {t} acc = ({t}) {ident};\n\
         \x20   for (u32 i = blockIdx.x * blockDim.x + tid; i < n; i += stride) {{\n\
         \x20       {t} a = acc, b = in[i];\n\
         \x20       acc = {comb};\n\
         \x20   }}\n\
         \x20   shared[tid] = acc;\n\
         \x20   __syncthreads();\n\
         \x20   for (u32 s = blockDim.x / 2; s > 0; s >>= 1) {{\n\
         \x20       if (tid < s) {{\n\
         \x20           {t} a = shared[tid], b = shared[tid + s];\n\
         \x20           shared[tid] = {comb};\n\
         \x20       }}\n\
         \x20       __syncthreads();\n\
         \x20   }}\n\
         \x20   if (tid == 0)\n\
         \x20       out[blockIdx.x] = shared[0];\n\
         }}\n\n",
    );
}

fn write_scan_init(src: &mut String) {
    // Scratch layout: one (flag, value) pair of u64 per block, preceded by
    // 32 padding pairs whose flag is "prefix available, value 0" so that the
    // decoupled lookback always terminates.
    src.push_str(
        "extern \"C\" __global__ void scan_large_init(u64 *scratch, u32 pairs) {\n\
         \x20   u32 stride = blockDim.x * gridDim.x;\n\
         \x20   for (u32 i = blockIdx.x * blockDim.x + threadIdx.x; i < pairs; i += stride) {\n\
         \x20       scratch[2 * i] = (i < 32) ? 2ull : 0ull;\n\
         \x20       scratch[2 * i + 1] = 0ull;\n\
         \x20   }\n\
         }\n\n",
    );
}

/// Double-buffered inclusive scan over per-thread totals held in shared
/// memory; returns code leaving the *exclusive* base of each thread in
/// `base`. Requires `shared` to hold `2 * blockDim.x` elements.
fn thread_scan_snippet(t: &str) -> String {
    format!(
        "\x20   u32 pout = 0;\n\
         \x20   shared[tid] = sum;\n\
         \x20   __syncthreads();\n\
         \x20   for (u32 d = 1; d < blockDim.x; d <<= 1) {{\n\
         \x20       u32 pin = pout;\n\
         \x20       pout ^= 1;\n\
         \x20       {t} value = shared[pin * blockDim.x + tid];\n\
         \x20       if (tid >= d)\n\
         \x20           value = value + shared[pin * blockDim.x + tid - d];\n\
         \x20       shared[pout * blockDim.x + tid] = value;\n\
         \x20       __syncthreads();\n\
         \x20   }}\n\
         \x20   {t} base = (tid > 0) ? shared[pout * blockDim.x + tid - 1] : ({t}) 0;\n\
         \x20   {t} total = shared[pout * blockDim.x + blockDim.x - 1];\n"
    )
}

fn write_scan_small(src: &mut String, exclusive: bool, ty: VarType) {
    let t = ty.cuda_name();
    let name = scan_kernel_name(exclusive, false, ty);
    let ipt = items_per_thread(ty, false);
    let store = if exclusive { "out[k] = run; run = run + v;" } else { "run = run + v; out[k] = run;" };
    let scan = thread_scan_snippet(t);
    let _ = write!(
        src,
        "extern \"C\" __global__ void {name}(const {t} *in, {t} *out, u32 size) {{\n\
         \x20   extern __shared__ unsigned char shared_raw[];\n\
         \x20   {t} *shared = ({t} *) shared_raw;\n\
         \x20   const u32 ipt = {ipt};\n\
         \x20   u32 tid = threadIdx.x;\n\
         \x20   {t} values[{ipt}];\n\
         \x20   {t} sum = ({t}) 0;\n\
         \x20   for (u32 j = 0; j < ipt; ++j) {{\n\
         \x20       u32 k = tid * ipt + j;\n\
         \x20       {t} v = (k < size) ? in[k] : ({t}) 0;\n\
         \x20       values[j] = v;\n\
         \x20       sum = sum + v;\n\
         \x20   }}\n\
         {scan}\
         \x20   (void) total;\n\
         \x20   {t} run = base;\n\
         \x20   for (u32 j = 0; j < ipt; ++j) {{\n\
         \x20       u32 k = tid * ipt + j;\n\
         \x20       if (k < size) {{\n\
         \x20           {t} v = values[j];\n\
         \x20           {store}\n\
         \x20       }}\n\
         \x20   }}\n\
         }}\n\n",
    );
}

fn write_scan_large(src: &mut String, exclusive: bool, ty: VarType) {
    let t = ty.cuda_name();
    let name = scan_kernel_name(exclusive, true, ty);
    let ipt = items_per_thread(ty, true);
    let pack = to_bits(ty);
    let unpack = from_bits(ty);
    let store = if exclusive { "out[k] = run; run = run + v;" } else { "run = run + v; out[k] = run;" };
    let scan = thread_scan_snippet(t);
    let _ = write!(
        src,
        "extern \"C\" __global__ void {name}(const {t} *in, {t} *out, u32 size, u64 *scratch) {{\n\
         \x20   extern __shared__ unsigned char shared_raw[];\n\
         \x20   {t} *shared = ({t} *) shared_raw;\n\
         \x20   __shared__ {t} block_prefix;\n\
         \x20   const u32 ipt = {ipt};\n\
         \x20   u32 tid = threadIdx.x;\n\
         \x20   u64 block_base = (u64) blockIdx.x * blockDim.x * ipt;\n\
         \x20   {t} values[{ipt}];\n\
         \x20   {t} sum = ({t}) 0;\n\
         \x20   for (u32 j = 0; j < ipt; ++j) {{\n\
         \x20       u64 k = block_base + (u64) tid * ipt + j;\n\
         \x20       {t} v = (k < size) ? in[k] : ({t}) 0;\n\
         \x20       values[j] = v;\n\
         \x20       sum = sum + v;\n\
         \x20   }}\n\
         {scan}\
         \x20   if (tid == 0) {{\n\
         \x20       long long block = (long long) blockIdx.x;\n\
         \x20       {t} v = total;\n\
         \x20       scratch[2 * block + 1] = {pack};\n\
         \x20       __threadfence();\n\
         \x20       atomicExch(scratch + 2 * block, 1ull);\n\
         \x20       {t} prefix = ({t}) 0;\n\
         \x20       for (long long j = block - 1;; --j) {{\n\
         \x20           u64 flag;\n\
         \x20           do {{\n\
         \x20               flag = atomicAdd(scratch + 2 * j, 0ull);\n\
         \x20           }} while (flag == 0ull);\n\
         \x20           u64 w = scratch[2 * j + 1];\n\
         \x20           prefix = {unpack} + prefix;\n\
         \x20           if (flag == 2ull)\n\
         \x20               break;\n\
         \x20       }}\n\
         \x20       v = prefix + total;\n\
         \x20       scratch[2 * block + 1] = {pack};\n\
         \x20       __threadfence();\n\
         \x20       atomicExch(scratch + 2 * block, 2ull);\n\
         \x20       block_prefix = prefix;\n\
         \x20   }}\n\
         \x20   __syncthreads();\n\
         \x20   {t} run = block_prefix + base;\n\
         \x20   for (u32 j = 0; j < ipt; ++j) {{\n\
         \x20       u64 k = block_base + (u64) tid * ipt + j;\n\
         \x20       if (k < size) {{\n\
         \x20           {t} v = values[j];\n\
         \x20           {store}\n\
         \x20       }}\n\
         \x20   }}\n\
         }}\n\n",
    );
}

fn write_compress_small(src: &mut String) {
    let scan = thread_scan_snippet("u32");
    let _ = write!(
        src,
        "extern \"C\" __global__ void compress_small(const u8 *in, u32 *out, u32 size, u32 *count_out) {{\n\
         \x20   extern __shared__ unsigned char shared_raw[];\n\
         \x20   u32 *shared = (u32 *) shared_raw;\n\
         \x20   const u32 ipt = 4;\n\
         \x20   u32 tid = threadIdx.x;\n\
         \x20   u32 values[4];\n\
         \x20   u32 sum = 0;\n\
         \x20   for (u32 j = 0; j < ipt; ++j) {{\n\
         \x20       u32 k = tid * ipt + j;\n\
         \x20       u32 v = (u32) in[k];\n\
         \x20       values[j] = v;\n\
         \x20       sum = sum + v;\n\
         \x20   }}\n\
         {scan}\
         \x20   u32 run = base;\n\
         \x20   for (u32 j = 0; j < ipt; ++j) {{\n\
         \x20       u32 k = tid * ipt + j;\n\
         \x20       if (values[j])\n\
         \x20           out[run] = k;\n\
         \x20       run += values[j];\n\
         \x20   }}\n\
         \x20   if (tid == blockDim.x - 1)\n\
         \x20       *count_out = total;\n\
         }}\n\n",
    );
}

fn write_compress_large(src: &mut String) {
    let scan = thread_scan_snippet("u32");
    let _ = write!(
        src,
        "extern \"C\" __global__ void compress_large(const u8 *in, u32 *out, u64 *scratch, u32 *count_out) {{\n\
         \x20   extern __shared__ unsigned char shared_raw[];\n\
         \x20   u32 *shared = (u32 *) shared_raw;\n\
         \x20   __shared__ u32 block_prefix;\n\
         \x20   const u32 ipt = 16;\n\
         \x20   u32 tid = threadIdx.x;\n\
         \x20   u64 block_base = (u64) blockIdx.x * blockDim.x * ipt;\n\
         \x20   u32 values[16];\n\
         \x20   u32 sum = 0;\n\
         \x20   for (u32 j = 0; j < ipt; ++j) {{\n\
         \x20       u32 v = (u32) in[block_base + (u64) tid * ipt + j];\n\
         \x20       values[j] = v;\n\
         \x20       sum = sum + v;\n\
         \x20   }}\n\
         {scan}\
         \x20   if (tid == 0) {{\n\
         \x20       long long block = (long long) blockIdx.x;\n\
         \x20       scratch[2 * block + 1] = (u64) total;\n\
         \x20       __threadfence();\n\
         \x20       atomicExch(scratch + 2 * block, 1ull);\n\
         \x20       u32 prefix = 0;\n\
         \x20       for (long long j = block - 1;; --j) {{\n\
         \x20           u64 flag;\n\
         \x20           do {{\n\
         \x20               flag = atomicAdd(scratch + 2 * j, 0ull);\n\
         \x20           }} while (flag == 0ull);\n\
         \x20           prefix += (u32) scratch[2 * j + 1];\n\
         \x20           if (flag == 2ull)\n\
         \x20               break;\n\
         \x20       }}\n\
         \x20       scratch[2 * block + 1] = (u64) (prefix + total);\n\
         \x20       __threadfence();\n\
         \x20       atomicExch(scratch + 2 * block, 2ull);\n\
         \x20       block_prefix = prefix;\n\
         \x20       if (blockIdx.x == gridDim.x - 1)\n\
         \x20           *count_out = prefix + total;\n\
         \x20   }}\n\
         \x20   __syncthreads();\n\
         \x20   u32 run = block_prefix + base;\n\
         \x20   for (u32 j = 0; j < ipt; ++j) {{\n\
         \x20       u64 k = block_base + (u64) tid * ipt + j;\n\
         \x20       if (values[j])\n\
         \x20           out[run] = (u32) k;\n\
         \x20       run += values[j];\n\
         \x20   }}\n\
         }}\n\n",
    );
}

fn write_transpose(src: &mut String) {
    src.push_str(
        "extern \"C\" __global__ void transpose_u32(const u32 *in, u32 *out, u32 rows, u32 cols) {\n\
         \x20   __shared__ u32 tile[16][17];\n\
         \x20   u32 x = blockIdx.x * 16 + threadIdx.x;\n\
         \x20   u32 y = blockIdx.y * 16 + threadIdx.y;\n\
         \x20   if (x < cols && y < rows)\n\
         \x20       tile[threadIdx.y][threadIdx.x] = in[(u64) y * cols + x];\n\
         \x20   __syncthreads();\n\
         \x20   x = blockIdx.y * 16 + threadIdx.x;\n\
         \x20   y = blockIdx.x * 16 + threadIdx.y;\n\
         \x20   if (x < rows && y < cols)\n\
         \x20       out[(u64) y * rows + x] = tile[threadIdx.x][threadIdx.y];\n\
         }\n\n",
    );
}

fn write_mkperm(src: &mut String) {
    // Warp-cooperative counting: group the active lanes by bucket value, one
    // leader updates the counter for the whole group. Ranking by lane index
    // keeps the permutation stable within a warp.
    src.push_str(
        "__device__ inline void count_bucket(u32 *counters, u32 bucket, bool valid) {\n\
         \x20   u32 active = __ballot_sync(0xffffffffu, valid);\n\
         \x20   if (!valid) return;\n\
         \x20   u32 peers = __match_any_sync(active, bucket);\n\
         \x20   u32 leader = __ffs(peers) - 1;\n\
         \x20   if ((threadIdx.x & 31) == leader)\n\
         \x20       atomicAdd(counters + bucket, __popc(peers));\n\
         }\n\n\
         __device__ inline void place_bucket(u32 *counters, u32 bucket, bool valid, u32 element, u32 *perm) {\n\
         \x20   u32 active = __ballot_sync(0xffffffffu, valid);\n\
         \x20   if (!valid) return;\n\
         \x20   u32 lane = threadIdx.x & 31;\n\
         \x20   u32 peers = __match_any_sync(active, bucket);\n\
         \x20   u32 leader = __ffs(peers) - 1;\n\
         \x20   u32 rank = __popc(peers & ((1u << lane) - 1));\n\
         \x20   u32 base_slot = 0;\n\
         \x20   if (lane == leader)\n\
         \x20       base_slot = atomicAdd(counters + bucket, __popc(peers));\n\
         \x20   base_slot = __shfl_sync(peers, base_slot, leader);\n\
         \x20   perm[base_slot + rank] = element;\n\
         }\n\n",
    );

    // Phase 1 variants: per-warp shared counters (tiny), per-block shared
    // counters (small), global counters (large).
    src.push_str(
        "extern \"C\" __global__ void mkperm_phase_1_tiny(const u32 *ptr, u32 *buckets, u32 size, u32 size_per_block, u32 bucket_count) {\n\
         \x20   extern __shared__ unsigned char shared_raw[];\n\
         \x20   u32 *shared = (u32 *) shared_raw;\n\
         \x20   u32 warp_count = blockDim.x >> 5;\n\
         \x20   u32 warp = threadIdx.x >> 5, lane = threadIdx.x & 31;\n\
         \x20   for (u32 i = threadIdx.x; i < bucket_count * warp_count; i += blockDim.x)\n\
         \x20       shared[i] = 0;\n\
         \x20   __syncthreads();\n\
         \x20   u32 chunk = (size_per_block + warp_count - 1) / warp_count;\n\
         \x20   u32 start = blockIdx.x * size_per_block + warp * chunk;\n\
         \x20   u32 end = min(min(start + chunk, (blockIdx.x + 1) * size_per_block), size);\n\
         \x20   for (u32 i = start + lane; i < end + lane; i += 32) {\n\
         \x20       bool valid = i < end;\n\
         \x20       count_bucket(shared + warp * bucket_count, valid ? ptr[i] : 0, valid);\n\
         \x20   }\n\
         \x20   __syncthreads();\n\
         \x20   u32 chunk_index = blockIdx.x * warp_count;\n\
         \x20   for (u32 i = threadIdx.x; i < bucket_count * warp_count; i += blockDim.x)\n\
         \x20       buckets[(u64) chunk_index * bucket_count + i] = shared[i];\n\
         }\n\n",
    );

    src.push_str(
        "extern \"C\" __global__ void mkperm_phase_1_small(const u32 *ptr, u32 *buckets, u32 size, u32 size_per_block, u32 bucket_count) {\n\
         \x20   extern __shared__ unsigned char shared_raw[];\n\
         \x20   u32 *shared = (u32 *) shared_raw;\n\
         \x20   for (u32 i = threadIdx.x; i < bucket_count; i += blockDim.x)\n\
         \x20       shared[i] = 0;\n\
         \x20   __syncthreads();\n\
         \x20   u32 start = blockIdx.x * size_per_block;\n\
         \x20   u32 end = min(start + size_per_block, size);\n\
         \x20   for (u32 i = start + threadIdx.x; i < end + threadIdx.x; i += blockDim.x) {\n\
         \x20       bool valid = i < end;\n\
         \x20       count_bucket(shared, valid ? ptr[i] : 0, valid);\n\
         \x20   }\n\
         \x20   __syncthreads();\n\
         \x20   for (u32 i = threadIdx.x; i < bucket_count; i += blockDim.x)\n\
         \x20       atomicAdd(buckets + (u64) blockIdx.x * bucket_count + i, shared[i]);\n\
         }\n\n",
    );

    src.push_str(
        "extern \"C\" __global__ void mkperm_phase_1_large(const u32 *ptr, u32 *buckets, u32 size, u32 size_per_block, u32 bucket_count) {\n\
         \x20   u32 start = blockIdx.x * size_per_block;\n\
         \x20   u32 end = min(start + size_per_block, size);\n\
         \x20   u32 *counters = buckets + (u64) blockIdx.x * bucket_count;\n\
         \x20   for (u32 i = start + threadIdx.x; i < end + threadIdx.x; i += blockDim.x) {\n\
         \x20       bool valid = i < end;\n\
         \x20       count_bucket(counters, valid ? ptr[i] : 0, valid);\n\
         \x20   }\n\
         }\n\n",
    );

    // Phase 3: compact non-empty buckets into (bucket, start, size, 0)
    // quadruples. The scanned table's first chunk row holds the global
    // start of every bucket.
    src.push_str(
        "extern \"C\" __global__ void mkperm_phase_3(const u32 *buckets, u32 bucket_count, u32 bucket_count_rounded, u32 size, u32 *counter, u32 *offsets) {\n\
         \x20   u32 stride = blockDim.x * gridDim.x;\n\
         \x20   for (u32 b = blockIdx.x * blockDim.x + threadIdx.x; b < bucket_count_rounded; b += stride) {\n\
         \x20       if (b >= bucket_count)\n\
         \x20           continue;\n\
         \x20       u32 start = buckets[b];\n\
         \x20       u32 end = (b + 1 < bucket_count) ? buckets[b + 1] : size;\n\
         \x20       u32 count = end - start;\n\
         \x20       if (count == 0)\n\
         \x20           continue;\n\
         \x20       u32 slot = atomicAdd(counter, 1u);\n\
         \x20       offsets[4 * slot + 0] = b;\n\
         \x20       offsets[4 * slot + 1] = start;\n\
         \x20       offsets[4 * slot + 2] = count;\n\
         \x20       offsets[4 * slot + 3] = 0;\n\
         \x20   }\n\
         }\n\n",
    );

    // Phase 4 variants mirror phase 1, replaying the traversal and placing
    // elements through the scanned counters.
    src.push_str(
        "extern \"C\" __global__ void mkperm_phase_4_tiny(const u32 *ptr, u32 *buckets, u32 *perm, u32 size, u32 size_per_block, u32 bucket_count) {\n\
         \x20   extern __shared__ unsigned char shared_raw[];\n\
         \x20   u32 *shared = (u32 *) shared_raw;\n\
         \x20   u32 warp_count = blockDim.x >> 5;\n\
         \x20   u32 warp = threadIdx.x >> 5, lane = threadIdx.x & 31;\n\
         \x20   u32 chunk_index = blockIdx.x * warp_count;\n\
         \x20   for (u32 i = threadIdx.x; i < bucket_count * warp_count; i += blockDim.x)\n\
         \x20       shared[i] = buckets[(u64) chunk_index * bucket_count + i];\n\
         \x20   __syncthreads();\n\
         \x20   u32 chunk = (size_per_block + warp_count - 1) / warp_count;\n\
         \x20   u32 start = blockIdx.x * size_per_block + warp * chunk;\n\
         \x20   u32 end = min(min(start + chunk, (blockIdx.x + 1) * size_per_block), size);\n\
         \x20   for (u32 i = start + lane; i < end + lane; i += 32) {\n\
         \x20       bool valid = i < end;\n\
         \x20       place_bucket(shared + warp * bucket_count, valid ? ptr[i] : 0, valid, i, perm);\n\
         \x20   }\n\
         }\n\n",
    );

    src.push_str(
        "extern \"C\" __global__ void mkperm_phase_4_small(const u32 *ptr, u32 *buckets, u32 *perm, u32 size, u32 size_per_block, u32 bucket_count) {\n\
         \x20   extern __shared__ unsigned char shared_raw[];\n\
         \x20   u32 *shared = (u32 *) shared_raw;\n\
         \x20   for (u32 i = threadIdx.x; i < bucket_count; i += blockDim.x)\n\
         \x20       shared[i] = buckets[(u64) blockIdx.x * bucket_count + i];\n\
         \x20   __syncthreads();\n\
         \x20   u32 start = blockIdx.x * size_per_block;\n\
         \x20   u32 end = min(start + size_per_block, size);\n\
         \x20   for (u32 i = start + threadIdx.x; i < end + threadIdx.x; i += blockDim.x) {\n\
         \x20       bool valid = i < end;\n\
         \x20       place_bucket(shared, valid ? ptr[i] : 0, valid, i, perm);\n\
         \x20   }\n\
         }\n\n",
    );

    src.push_str(
        "extern \"C\" __global__ void mkperm_phase_4_large(const u32 *ptr, u32 *buckets, u32 *perm, u32 size, u32 size_per_block, u32 bucket_count) {\n\
         \x20   u32 start = blockIdx.x * size_per_block;\n\
         \x20   u32 end = min(start + size_per_block, size);\n\
         \x20   u32 *counters = buckets + (u64) blockIdx.x * bucket_count;\n\
         \x20   for (u32 i = start + threadIdx.x; i < end + threadIdx.x; i += blockDim.x) {\n\
         \x20       bool valid = i < end;\n\
         \x20       place_bucket(counters, valid ? ptr[i] : 0, valid, i, perm);\n\
         \x20   }\n\
         }\n\n",
    );
}

fn write_block_copy(src: &mut String, ty: VarType) {
    let t = ty.cuda_name();
    let name = block_kernel_name(false, ty);
    let _ = write!(
        src,
        "extern \"C\" __global__ void {name}(const {t} *in, {t} *out, u32 size, u32 block) {{\n\
         \x20   u32 stride = blockDim.x * gridDim.x;\n\
         \x20   for (u32 i = blockIdx.x * blockDim.x + threadIdx.x; i < size; i += stride)\n\
         \x20       out[i] = in[i / block];\n\
         }}\n\n",
    );
}

fn write_block_sum(src: &mut String, ty: VarType) {
    let t = ty.cuda_name();
    let name = block_kernel_name(true, ty);
    let _ = write!(
        src,
        "extern \"C\" __global__ void {name}(const {t} *in, {t} *out, u32 size, u32 block) {{\n\
         \x20   u32 stride = blockDim.x * gridDim.x;\n\
         \x20   for (u32 i = blockIdx.x * blockDim.x + threadIdx.x; i < size; i += stride)\n\
         \x20       atomicAdd(out + i / block, in[i]);\n\
         }}\n\n",
    );
}

fn write_poke(src: &mut String) {
    for (name, t) in
        [("poke_u8", "unsigned char"), ("poke_u16", "unsigned short"), ("poke_u32", "u32"), ("poke_u64", "u64")]
    {
        let _ = write!(
            src,
            "extern \"C\" __global__ void {name}({t} *dst, {t} value) {{\n\
             \x20   *dst = value;\n\
             }}\n\n",
        );
    }
}

fn write_aggregate(src: &mut String) {
    src.push_str(
        "extern \"C\" __global__ void aggregate(unsigned char *dst, const AggregationEntry *entries, u32 size) {\n\
         \x20   u32 stride = blockDim.x * gridDim.x;\n\
         \x20   for (u32 i = blockIdx.x * blockDim.x + threadIdx.x; i < size; i += stride) {\n\
         \x20       AggregationEntry e = entries[i];\n\
         \x20       unsigned char *p = dst + e.offset;\n\
         \x20       switch (e.size) {\n\
         \x20           case 1: *p = (unsigned char) e.src; break;\n\
         \x20           case 2: *(unsigned short *) p = (unsigned short) e.src; break;\n\
         \x20           case 4: *(u32 *) p = (u32) e.src; break;\n\
         \x20           case 8: *(u64 *) p = e.src; break;\n\
         \x20           case -1: *p = *(const unsigned char *) e.src; break;\n\
         \x20           case -2: *(unsigned short *) p = *(const unsigned short *) e.src; break;\n\
         \x20           case -4: *(u32 *) p = *(const u32 *) e.src; break;\n\
         \x20           case -8: *(u64 *) p = *(const u64 *) e.src; break;\n\
         \x20       }\n\
         \x20   }\n\
         }\n\n",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_contains_expected_entry_points() {
        let src = builtin_source();
        for name in [
            "fill_64",
            "reduce_sum_u32",
            "reduce_and_u64",
            "scan_exc_small_u32",
            "scan_inc_large_f64",
            "scan_large_init",
            "compress_small",
            "compress_large",
            "transpose_u32",
            "mkperm_phase_1_tiny",
            "mkperm_phase_3",
            "mkperm_phase_4_large",
            "block_sum_f32",
            "poke_u64",
            "aggregate",
        ] {
            assert!(
                src.contains(&format!("__global__ void {name}")),
                "missing kernel {name}"
            );
        }
    }

    #[test]
    fn float_reductions_have_no_bitwise_variant() {
        let src = builtin_source();
        assert!(!src.contains("reduce_and_f32"));
        assert!(!src.contains("reduce_or_f64"));
    }
}

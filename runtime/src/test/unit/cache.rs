//! Disk tier of the kernel cache.

use crate::cache;
use crate::test::helpers::{init, serial};
use crate::JitBackend;

#[test]
fn round_trip_and_silent_misses() {
    let _serial = serial();
    init();

    let payload = b"kernel artifact bytes".to_vec();
    let hash = 0xfeed_f00d_dead_beef_0123_4567_89ab_cdefu128;

    assert!(cache::disk_load(JitBackend::Cpu, hash).is_none());

    cache::disk_write(JitBackend::Cpu, hash, &payload);
    assert_eq!(cache::disk_load(JitBackend::Cpu, hash).as_deref(), Some(payload.as_slice()));

    // Backend is part of the key.
    assert!(cache::disk_load(JitBackend::Cuda, hash).is_none());
}

#[test]
fn corrupt_header_is_a_miss() {
    let _serial = serial();
    init();

    let hash = 0x0101_0202_0303_0404_0505_0606_0707_0808u128;
    cache::disk_write(JitBackend::Cpu, hash, b"payload");

    // Flip the format version in place.
    let path = cache::cache_dir().join(format!("cpu-{hash:032x}.bin"));
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[4] ^= 0xff;
    std::fs::write(&path, &bytes).unwrap();

    assert!(cache::disk_load(JitBackend::Cpu, hash).is_none());
}

#[test]
fn truncated_payload_is_a_miss() {
    let _serial = serial();
    init();

    let hash = 0x1111_2222_3333_4444_5555_6666_7777_8888u128;
    cache::disk_write(JitBackend::Cpu, hash, b"0123456789");

    let path = cache::cache_dir().join(format!("cpu-{hash:032x}.bin"));
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();

    assert!(cache::disk_load(JitBackend::Cpu, hash).is_none());
}

#[test]
fn assembler_dedupes_globals_and_callables() {
    let _serial = serial();
    let mut scratch = crate::state::lock_eval();
    scratch.globals.clear();
    scratch.callables.clear();
    scratch.globals_map.clear();

    let a = crate::assemble::register_global(&mut scratch, "__device__ int helper_a;\n");
    let b = crate::assemble::register_global(&mut scratch, "__device__ int helper_b;\n");
    let a2 = crate::assemble::register_global(&mut scratch, "__device__ int helper_a;\n");
    assert_eq!(a, a2);
    assert_ne!(a, b);
    assert_eq!(scratch.globals.len(), 2);

    let body = format!("callable {}:\n    ret\n", crate::assemble::callable_name_placeholder());
    let (hash_1, slot_1) = crate::assemble::register_callable(&mut scratch, &body).unwrap();
    let (hash_2, slot_2) = crate::assemble::register_callable(&mut scratch, &body).unwrap();
    assert_eq!(hash_1, hash_2);
    assert_eq!(slot_1, slot_2);
    assert_eq!(scratch.callables.len(), 1);

    // The stored callable carries its hash instead of the placeholder.
    assert!(scratch.callables[0].contains(&format!("{hash_1:032x}")));
    assert!(!scratch.callables[0].contains('^'));

    scratch.globals.clear();
    scratch.callables.clear();
    scratch.globals_map.clear();
}

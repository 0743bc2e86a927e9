#![no_main]

use freelist_space_fuzzing::Ops;
use libfuzzer_sys::{fuzz_mutator, fuzz_target, fuzzer_mutate};
use mutatis::Session;

/// Space sizes to run against, in words. The smallest fits entirely within
/// the size classes, so its allocations never reach the dictionary; the
/// largest is mostly dictionary.
const CAPACITIES: [usize; 3] = [200, 4096, 1 << 16];

const fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

fn decode(data: &[u8]) -> Option<(usize, Ops)> {
    let (&selector, data) = data.split_first()?;
    let capacity = CAPACITIES[usize::from(selector) % CAPACITIES.len()];
    let (ops, _) = bincode::decode_from_slice::<Ops, _>(data, bincode_config()).ok()?;
    Some((capacity, ops))
}

fuzz_mutator!(|data: &mut [u8], size: usize, max_size: usize, seed: u32| {
    let _ = env_logger::try_init();

    // With probability of about 1/8, just use the default mutator.
    if seed.count_ones() % 8 == 0 || max_size == 0 || data.is_empty() {
        return fuzzer_mutate(data, size, max_size);
    }

    // Keep the capacity selector, and decode the ops after it, or start from
    // no ops if that fails.
    let selector = if size > 0 { data[0] } else { seed as u8 };
    let mut ops = decode(&data[..size.min(data.len())]).map_or_else(Ops::default, |(_, ops)| ops);

    let mut session = Session::new().seed(seed.into()).shrink(max_size < size);
    if session.mutate(&mut ops).is_ok() {
        data[0] = selector;
        let end = max_size.min(data.len());
        let body = &mut data[1..end];
        loop {
            if let Ok(new_size) = bincode::encode_into_slice(&ops, &mut *body, bincode_config()) {
                return new_size + 1;
            }

            // When re-encoding fails (presumably because `data` is not large
            // enough) then pop an op off the end and try again, until there
            // are no ops left to pop.
            if !ops.pop() {
                break;
            }
        }
    }

    // If we failed to mutate the ops for whatever reason, fall back to the
    // fuzzer's default mutation strategies.
    fuzzer_mutate(data, size, max_size)
});

fuzz_target!(|data: &[u8]| {
    let _ = env_logger::try_init();
    if let Some((capacity, ops)) = decode(data) {
        log::debug!("running {} bytes of ops against {capacity} words", data.len());
        if let Err(e) = ops.run(capacity) {
            panic!("error: {e}");
        }
    }
});

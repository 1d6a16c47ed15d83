#![no_main]

use alloc_hater::{AllocatorOp, Evaluator};
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use malloc_hater::MallocSubject;

const MAX_BLOCKS: usize = 64;

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    num_blocks: usize,
    ops: Vec<AllocatorOp>,
}

fuzz_target!(|args: Args| {
    let subject =
        match MallocSubject::<4096, 7, _>::with_blocks(args.num_blocks % MAX_BLOCKS + 1) {
            Ok(s) => s,
            Err(_) => return,
        };

    let mut eval = Evaluator::new(subject);
    eval.evaluate(args.ops).unwrap();

    let stats = eval.subject().inner().stats();
    assert_eq!(stats.allocated_blocks, stats.free_blocks);
});

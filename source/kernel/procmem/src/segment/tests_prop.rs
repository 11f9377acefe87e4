// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the segment list
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; random fixed inserts and unmaps against list invariants
//!
//! TEST_SCOPE:
//!   - Partition invariants after arbitrary operation sequences
//!   - Lookup exhaustiveness
//!   - Map/unmap round trip restores the prior shape
//!
//! TEST_SCENARIOS:
//!   - partition_survives_random_ops(): verify() holds after every step
//!   - find_is_exhaustive(): every page resolves to the segment containing it
//!   - map_then_unmap_restores_shape(): mapping over a hole then unmapping it is a no-op

use super::*;
use proptest::prelude::*;

const SPAN: u64 = 256;

#[derive(Clone, Debug)]
enum Op {
    Map { start: u64, pages: u64, prot: u32 },
    Unmap { start: u64, pages: u64 },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..SPAN, 1u64..32, 1u32..8).prop_map(|(start, pages, prot)| Op::Map { start, pages, prot }),
        (0..SPAN, 1u64..32).prop_map(|(start, pages)| Op::Unmap { start, pages }),
    ]
}

fn mapping(prot: u32) -> Mapping {
    Mapping {
        backing: Backing::Anonymous,
        offset: 0,
        prot: Prot::from_bits_truncate(prot),
        sharing: Sharing::Private,
        access: Access::READ,
        owner: None,
    }
}

fn apply(list: &mut SegmentList, op: &Op) {
    let (start, pages, mapping) = match *op {
        Op::Map { start, pages, prot } => (start, pages, Some(self::mapping(prot))),
        Op::Unmap { start, pages } => (start, pages, None),
    };
    let pages = pages.min(SPAN - start);
    let _ = list.insert(Placement::Fixed(PageIndex::new(start)), pages, mapping);
}

fn shape(list: &SegmentList) -> Vec<(u64, u64, bool, u32)> {
    list.iter()
        .map(|seg| (seg.start.raw(), seg.pages, seg.is_hole(), seg.prot().bits()))
        .collect()
}

proptest! {
    #[test]
    fn partition_survives_random_ops(ops in prop::collection::vec(arb_op(), 1..40)) {
        let mut list = SegmentList::new(PageIndex::new(SPAN));
        for op in &ops {
            apply(&mut list, op);
            prop_assert_eq!(list.verify(), Ok(()));
        }
    }

    #[test]
    fn find_is_exhaustive(ops in prop::collection::vec(arb_op(), 0..20)) {
        let mut list = SegmentList::new(PageIndex::new(SPAN));
        for op in &ops {
            apply(&mut list, op);
        }
        for page in 0..SPAN {
            let seg = list.find(PageIndex::new(page));
            prop_assert!(seg.contains(PageIndex::new(page)));
        }
    }

    #[test]
    fn map_then_unmap_restores_shape(
        ops in prop::collection::vec(arb_op(), 0..10),
        pages in 1u64..16,
        prot in 1u32..8,
    ) {
        let mut list = SegmentList::new(PageIndex::new(SPAN));
        for op in &ops {
            apply(&mut list, op);
        }
        // only a range that is currently a single hole round-trips exactly
        if let Some(start) = list.place_high(pages, PageIndex::new(0)) {
            let before = shape(&list);
            list.insert(Placement::Fixed(start), pages, Some(mapping(prot))).unwrap();
            list.insert(Placement::Fixed(start), pages, None).unwrap();
            prop_assert_eq!(shape(&list), before);
        }
    }
}

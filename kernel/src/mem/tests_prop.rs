// kernel/src/mem/tests_prop.rs
//
// Region 表の性質テスト。
// - 切り出した Region 同士は重ならず、すべて元の Free の内側に収まる
// - Free を越える要求は失敗し、Free は動かない

#![cfg(test)]

use std::vec::Vec;

use proptest::prelude::*;

use super::addr::VirtAddr;
use super::regions::{Region, RegionError, RegionKind, RegionTable, MAX_REGIONS};

fn arb_request() -> impl Strategy<Value = (u64, u32, u64)> {
    (1u64..0x10_0000, 12u32..22, prop_oneof![Just(0u64), Just(0x1000u64)])
}

proptest! {
    #[test]
    fn carved_regions_never_overlap(reqs in prop::collection::vec(arb_request(), 1..40)) {
        let t = RegionTable::new();
        t.init(VirtAddr(0x40_0000), 0x20_0000).unwrap();
        let free = t.free_region().unwrap();

        let mut got: Vec<Region> = Vec::new();
        for (len, align_shift, guard) in reqs {
            match t.alloc(len, 1 << align_shift, "p", guard, RegionKind::Other, false) {
                Ok(r) => got.push(r),
                Err(RegionError::TableFull) => prop_assert!(t.len() >= MAX_REGIONS),
                Err(e) => prop_assert!(false, "unexpected {:?}", e),
            }
        }

        for (i, a) in got.iter().enumerate() {
            prop_assert!(a.start.0 >= free.start.0 && a.end() <= free.end());
            prop_assert!(a.end() <= t.free_region().unwrap().start.0);
            for b in &got[i + 1..] {
                prop_assert!(a.end() <= b.start.0 || b.end() <= a.start.0);
            }
        }
    }

    #[test]
    fn oversized_requests_fail_without_moving_free(extra in 1u64..0x1_0000, guard in 0u64..0x2000) {
        let t = RegionTable::new();
        t.init(VirtAddr(0x40_0000), 0x20_0000).unwrap();
        t.alloc_address(0x3000, 0x1000, "first").unwrap();
        let before = t.free_region().unwrap();

        let res = t.alloc(before.length + extra, 0x1000, "too big", guard, RegionKind::Stack, false);
        let is_out_of_space = matches!(res, Err(RegionError::OutOfAddressSpace { .. }));
        prop_assert!(is_out_of_space);
        prop_assert_eq!(t.free_region().unwrap(), before);
    }
}

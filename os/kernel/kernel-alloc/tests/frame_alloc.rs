mod common;

use common::{TestHart, TestRam, allocator};
use kernel_alloc::frame_alloc::{ALLOC_JUNK, BorrowOrder, FREE_JUNK, FrameAllocConfig};
use kernel_alloc::refcount::RefCountTable;
use kernel_sync::Hart;
use kernel_vmem::{FrameAlloc, fill_frame};
use std::collections::HashSet;
use std::sync::Mutex;

#[test]
fn init_splits_frames_evenly() {
    let ram = TestRam::new(44);
    let alloc = allocator(&ram, 4, FrameAllocConfig::per_cpu(4), None);
    assert_eq!(alloc.managed_frames(), 40);
    assert_eq!(alloc.free_frames(), 40);
    for cpu in 0..4 {
        assert_eq!(alloc.free_frames_on(cpu), 10);
    }
}

#[test]
fn unaligned_kernel_end_is_rounded_up() {
    let ram = TestRam::new(12);
    let alloc = common::TestAlloc::init(
        &ram,
        &common::HART,
        ram.frame(1).base() + 0x10,
        ram.end(),
        FrameAllocConfig::global(),
        None,
    );
    assert_eq!(alloc.first_frame(), ram.frame(2));
    assert_eq!(alloc.free_frames(), 10);
}

#[test]
fn frames_are_junk_filled() {
    let ram = TestRam::new(8);
    let alloc = allocator(&ram, 2, FrameAllocConfig::global(), None);

    let frame = alloc.alloc_4k().unwrap();
    assert!(ram.bytes(frame).iter().all(|b| *b == ALLOC_JUNK));

    alloc.free_4k(frame.base());
    let bytes = ram.bytes(frame);
    assert!(bytes[8..].iter().all(|b| *b == FREE_JUNK));
}

#[test]
fn every_frame_is_handed_out_once() {
    let ram = TestRam::new(36);
    let alloc = allocator(&ram, 4, FrameAllocConfig::per_cpu(4), None);

    let mut seen = HashSet::new();
    while let Some(frame) = alloc.alloc_4k() {
        assert!(frame.base() >= ram.frame(4).base() && frame.base() < ram.end());
        assert!(seen.insert(frame), "{frame} handed out twice");
    }
    assert_eq!(seen.len(), 32);
    assert_eq!(alloc.free_frames(), 0);
    assert_eq!(alloc.alloc_4k(), None);

    for frame in seen {
        alloc.free_4k(frame.base());
    }
    assert_eq!(alloc.free_frames(), 32);
}

#[test]
fn empty_core_borrows_from_neighbor() {
    let ram = TestRam::new(40);
    let alloc = allocator(&ram, 0, FrameAllocConfig::per_cpu(4), None);
    TestHart::become_hart(1);

    for _ in 0..10 {
        alloc.alloc_4k().unwrap();
    }
    assert_eq!(alloc.free_frames_on(1), 0);

    alloc.alloc_4k().unwrap();
    assert_eq!(alloc.free_frames_on(2), 9);
    assert_eq!(alloc.free_frames_on(0), 10);
    assert_eq!(alloc.free_frames_on(3), 10);
}

#[test]
fn borrowing_can_start_at_core_zero() {
    let ram = TestRam::new(40);
    let config = FrameAllocConfig::per_cpu(4).with_borrow(BorrowOrder::FromZero);
    let alloc = allocator(&ram, 0, config, None);
    TestHart::become_hart(2);

    for _ in 0..10 {
        alloc.alloc_4k().unwrap();
    }
    alloc.alloc_4k().unwrap();
    assert_eq!(alloc.free_frames_on(0), 9);
    assert_eq!(alloc.free_frames_on(3), 10);
}

#[test]
fn freed_frames_land_on_the_freeing_core() {
    let ram = TestRam::new(16);
    let alloc = allocator(&ram, 0, FrameAllocConfig::per_cpu(4), None);

    TestHart::become_hart(0);
    let frame = alloc.alloc_4k().unwrap();
    assert_eq!(alloc.free_frames_on(0), 3);

    TestHart::become_hart(3);
    alloc.free_4k(frame.base());
    assert_eq!(alloc.free_frames_on(0), 3);
    assert_eq!(alloc.free_frames_on(3), 5);

    // The next allocation on core 3 gets it right back.
    assert_eq!(alloc.alloc_4k(), Some(frame));
}

#[test]
fn extra_cores_share_lists() {
    let ram = TestRam::new(8);
    let alloc = allocator(&ram, 0, FrameAllocConfig::per_cpu(2), None);
    TestHart::become_hart(5);
    alloc.alloc_4k().unwrap();
    assert_eq!(alloc.free_frames_on(1), 3);
    assert_eq!(alloc.free_frames_on(0), 4);
}

#[test]
fn global_list_serves_every_core() {
    let ram = TestRam::new(8);
    let alloc = allocator(&ram, 0, FrameAllocConfig::global(), None);
    assert_eq!(alloc.lists(), 1);

    TestHart::become_hart(6);
    let frame = alloc.alloc_4k().unwrap();
    TestHart::become_hart(2);
    alloc.free_4k(frame.base());
    assert_eq!(alloc.free_frames_on(0), 8);
}

#[test]
#[should_panic(expected = "not page aligned")]
fn freeing_unaligned_address_is_fatal() {
    let ram = TestRam::new(8);
    let alloc = allocator(&ram, 2, FrameAllocConfig::global(), None);
    let frame = alloc.alloc_4k().unwrap();
    alloc.free_4k(frame.base() + 8);
}

#[test]
#[should_panic(expected = "outside managed memory")]
fn freeing_kernel_frames_is_fatal() {
    let ram = TestRam::new(8);
    let alloc = allocator(&ram, 2, FrameAllocConfig::global(), None);
    alloc.free_4k(ram.frame(1).base());
}

#[test]
#[should_panic(expected = "outside managed memory")]
fn freeing_past_the_top_is_fatal() {
    let ram = TestRam::new(8);
    let alloc = allocator(&ram, 2, FrameAllocConfig::global(), None);
    alloc.free_4k(ram.end());
}

#[test]
#[should_panic(expected = "lists")]
fn too_many_lists_is_fatal() {
    let ram = TestRam::new(8);
    let _ = allocator(&ram, 0, FrameAllocConfig::per_cpu(64), None);
}

#[test]
fn shared_frames_are_recycled_after_last_release() {
    let mut storage = vec![0u16; 16];
    let ram = TestRam::new(10);
    let alloc = allocator(
        &ram,
        2,
        FrameAllocConfig::global(),
        Some(RefCountTable::new(&mut storage)),
    );

    let frame = alloc.alloc_4k().unwrap();
    assert_eq!(alloc.ref_count(frame), Some(1));
    assert_eq!(alloc.retain_4k(frame), Some(2));
    unsafe { fill_frame(&ram, frame, 0xab) };

    alloc.free_4k(frame.base());
    assert_eq!(alloc.ref_count_4k(frame), Some(1));
    assert_eq!(alloc.free_frames(), 7);
    assert!(ram.bytes(frame).iter().all(|b| *b == 0xab));

    alloc.free_4k(frame.base());
    assert_eq!(alloc.ref_count(frame), Some(0));
    assert_eq!(alloc.free_frames(), 8);
    assert!(ram.bytes(frame)[8..].iter().all(|b| *b == FREE_JUNK));

    // Reallocation starts over at one reference.
    assert_eq!(alloc.alloc_4k(), Some(frame));
    assert_eq!(alloc.ref_count(frame), Some(1));
}

#[test]
#[should_panic(expected = "no references")]
fn double_free_is_caught_with_counting() {
    let mut storage = vec![0u16; 8];
    let ram = TestRam::new(8);
    let alloc = allocator(
        &ram,
        0,
        FrameAllocConfig::global(),
        Some(RefCountTable::new(&mut storage)),
    );
    let frame = alloc.alloc_4k().unwrap();
    alloc.free_4k(frame.base());
    alloc.free_4k(frame.base());
}

#[test]
fn without_counting_sharing_is_unavailable() {
    let ram = TestRam::new(4);
    let alloc = allocator(&ram, 0, FrameAllocConfig::global(), None);
    let frame = alloc.alloc_4k().unwrap();
    assert_eq!(alloc.retain_4k(frame), None);
    assert_eq!(alloc.ref_count_4k(frame), None);
}

#[test]
fn count_and_statistics_locks_run_with_interrupts_off() {
    let mut storage = vec![0; 8];
    let ram = TestRam::new(8);
    let refs = RefCountTable::new(&mut storage);
    let alloc = allocator(&ram, 0, FrameAllocConfig::per_cpu(2), Some(refs));
    let hart = &common::HART;
    let frame = alloc.alloc_4k().unwrap();

    let mut before = TestHart::disables();
    let mut each = |what: &str| {
        let now = TestHart::disables();
        assert!(now > before, "{what} took its lock with interrupts on");
        assert!(hart.interrupts_enabled(), "{what} left interrupts off");
        before = now;
    };
    let _ = alloc.free_frames();
    each("free_frames");
    let _ = alloc.free_frames_on(1);
    each("free_frames_on");
    let _ = alloc.ref_count(frame);
    each("ref_count");
    alloc.retain_4k(frame);
    each("retain_4k");
    alloc.free_4k(frame.base());
    each("free_4k");
}

#[test]
fn concurrent_cores_never_share_a_frame() {
    const CORES: usize = 4;
    const HELD: usize = 20;

    let ram = TestRam::new(4 + 400);
    let alloc = allocator(&ram, 4, FrameAllocConfig::per_cpu(CORES), None);
    let live = Mutex::new(HashSet::new());

    std::thread::scope(|s| {
        for core in 0..CORES {
            let (alloc, ram, live) = (&alloc, &ram, &live);
            s.spawn(move || {
                TestHart::become_hart(core);
                #[allow(clippy::cast_possible_truncation)]
                let tag = core as u8 + 1;
                for _ in 0..50 {
                    let frames: Vec<_> = (0..HELD).map(|_| alloc.alloc_4k().unwrap()).collect();
                    for &f in &frames {
                        assert!(live.lock().unwrap().insert(f), "{f} handed out twice");
                        unsafe { fill_frame(ram, f, tag) };
                    }
                    for &f in &frames {
                        assert!(ram.bytes(f).iter().all(|b| *b == tag));
                        assert!(live.lock().unwrap().remove(&f));
                        alloc.free_4k(f.base());
                    }
                }
            });
        }
    });

    assert_eq!(alloc.free_frames(), 400);
    assert!(live.lock().unwrap().is_empty());
}

mod common;

use common::{TestRam, allocator};
use kernel_alloc::frame_alloc::FrameAllocConfig;
use kernel_alloc::kvm::{KernelLayout, KernelPageTable};
use kernel_info::memory::{
    KERNBASE, NPROC, PAGE_SIZE, PHYSTOP, PLIC, PLIC_SIZE, TRAMPOLINE, UART0, VIRTIO0, kstack,
};
use kernel_vmem::addresses::VirtualAddress;
use kernel_vmem::{PhysMapper, PteFlags};

const STACKS: usize = 4;

fn layout(ram: &TestRam) -> KernelLayout {
    KernelLayout {
        phys_top: ram.end(),
        kernel_stacks: STACKS,
        ..KernelLayout::qemu_virt(ram.frame(4).base(), ram.frame(2))
    }
}

fn flags_at<M: PhysMapper>(table: &KernelPageTable<'_, M>, at: u64) -> Option<PteFlags> {
    let pte = table.address_space().walk(VirtualAddress::new(at))?;
    pte.valid().then(|| pte.flags())
}

#[test]
fn qemu_virt_uses_board_addresses() {
    let ram = TestRam::new(1);
    let layout = KernelLayout::qemu_virt(ram.frame(0).base(), ram.frame(0));
    assert_eq!(layout.uart.as_u64(), UART0);
    assert_eq!(layout.virtio.as_u64(), VIRTIO0);
    assert_eq!(layout.plic.as_u64(), PLIC);
    assert_eq!(layout.plic_size, PLIC_SIZE);
    assert_eq!(layout.kernel_base.as_u64(), KERNBASE);
    assert_eq!(layout.phys_top.as_u64(), PHYSTOP);
    assert_eq!(layout.kernel_stacks, NPROC);
}

#[test]
fn kernel_table_maps_every_region() {
    let ram = TestRam::new(256);
    let alloc = allocator(&ram, 8, FrameAllocConfig::global(), None);
    let layout = layout(&ram);
    let table = KernelPageTable::build(&ram, &alloc, &layout);

    let rw = Some(PteFlags::V | PteFlags::R | PteFlags::W);
    let rx = Some(PteFlags::V | PteFlags::R | PteFlags::X);

    assert_eq!(flags_at(&table, UART0), rw);
    assert_eq!(flags_at(&table, VIRTIO0), rw);
    assert_eq!(flags_at(&table, VIRTIO0 + PAGE_SIZE), None);
    assert_eq!(flags_at(&table, PLIC), rw);
    assert_eq!(flags_at(&table, PLIC + PLIC_SIZE - PAGE_SIZE), rw);
    assert_eq!(flags_at(&table, PLIC + PLIC_SIZE), None);

    let text_end = layout.text_end.as_u64();
    assert_eq!(flags_at(&table, KERNBASE), rx);
    assert_eq!(flags_at(&table, text_end - PAGE_SIZE), rx);
    assert_eq!(flags_at(&table, text_end), rw);
    assert_eq!(flags_at(&table, ram.end().as_u64() - PAGE_SIZE), rw);
    assert_eq!(flags_at(&table, ram.end().as_u64()), None);

    // Direct map: VA == PA.
    let pte = table.address_space().walk(VirtualAddress::new(text_end)).unwrap();
    assert_eq!(pte.frame(), layout.text_end.page());

    assert_eq!(flags_at(&table, TRAMPOLINE), rx);
    let pte = table.address_space().walk(VirtualAddress::new(TRAMPOLINE)).unwrap();
    assert_eq!(pte.frame(), layout.trampoline);
}

#[test]
fn kernel_stacks_are_separated_by_guard_pages() {
    let ram = TestRam::new(256);
    let alloc = allocator(&ram, 8, FrameAllocConfig::global(), None);
    let table = KernelPageTable::build(&ram, &alloc, &layout(&ram));

    let mut frames = Vec::new();
    for slot in 0..STACKS {
        let stack = kstack(slot);
        assert_eq!(
            flags_at(&table, stack),
            Some(PteFlags::V | PteFlags::R | PteFlags::W)
        );
        assert_eq!(flags_at(&table, stack + PAGE_SIZE), None, "guard of slot {slot}");
        frames.push(table.address_space().walk(VirtualAddress::new(stack)).unwrap().frame());
    }
    frames.sort();
    frames.dedup();
    assert_eq!(frames.len(), STACKS);
    assert_eq!(flags_at(&table, kstack(STACKS)), None);
}

#[test]
fn nothing_is_user_accessible() {
    let ram = TestRam::new(256);
    let alloc = allocator(&ram, 8, FrameAllocConfig::global(), None);
    let table = KernelPageTable::build(&ram, &alloc, &layout(&ram));
    for at in [UART0, PLIC, KERNBASE, TRAMPOLINE, kstack(0)] {
        assert!(table.address_space().translate(VirtualAddress::new(at)).is_none());
    }
}

#[test]
fn build_uses_tables_and_stacks_only() {
    let ram = TestRam::new(256);
    let alloc = allocator(&ram, 8, FrameAllocConfig::global(), None);
    let table = KernelPageTable::build(&ram, &alloc, &layout(&ram));

    // Root; low middle table with leaf tables for the devices (1) and the
    // PLIC (2); RAM middle and leaf table; top middle and leaf table; stacks.
    assert_eq!(alloc.free_frames(), 248 - (1 + (1 + 1 + 2) + 2 + 2 + STACKS));
    assert_eq!(
        table.satp(),
        (8 << 60) | table.address_space().root_page().ppn()
    );
}

#[test]
#[should_panic(expected = "kvm: out of memory")]
fn running_out_of_memory_is_fatal() {
    let ram = TestRam::new(16);
    let alloc = allocator(&ram, 10, FrameAllocConfig::global(), None);
    let _ = KernelPageTable::build(&ram, &alloc, &layout(&ram));
}

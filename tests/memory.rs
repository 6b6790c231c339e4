// Page accounting through a whole address-space lifecycle. This
// lives in its own test binary so nothing else allocates while
// the balance is measured.

use kernel::kalloc::{free_pages, host_init};
use kernel::vm::{allocuvm, copyout, copyuvm, freevm, setupkvm};
use kernel::x86::PGSIZE;

#[test]
fn every_page_comes_back() {
    host_init();
    let before = free_pages();

    let parent = setupkvm().unwrap();
    assert_eq!(allocuvm(parent, 0, 5 * PGSIZE), Some(5 * PGSIZE));
    copyout(parent, 3 * PGSIZE + 17, b"deep copy me").unwrap();

    let child = copyuvm(parent, 5 * PGSIZE).unwrap();

    freevm(child);
    freevm(parent);
    assert_eq!(free_pages(), before);
}

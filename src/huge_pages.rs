//! DMA memory backed by Linux huge pages.
//!
//! Each allocation is an mlocked 2 MiB huge-page mapping, which is
//! physically contiguous, so every host page inside it translates through
//! one pagemap lookup of its base.

use crate::dma::Allocator;
use std::boxed::Box;
use std::error::Error;
use std::format;
use std::io::{self, Read, Seek};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::{fs, mem, process, ptr};

const HUGE_PAGE_BITS: u32 = 21;
pub const HUGE_PAGE_SIZE: usize = 1 << HUGE_PAGE_BITS;

static HUGE_PAGE_ID: AtomicUsize = AtomicUsize::new(0);

fn round_to_huge_page(size: usize) -> usize {
    if size % HUGE_PAGE_SIZE != 0 {
        ((size >> HUGE_PAGE_BITS) + 1) << HUGE_PAGE_BITS
    } else {
        size
    }
}

pub struct HugePageAllocator;

impl Allocator for HugePageAllocator {
    fn allocate(&self, layout: core::alloc::Layout) -> Result<*mut u8, Box<dyn Error>> {
        let size = round_to_huge_page(layout.size());

        let id = HUGE_PAGE_ID.fetch_add(1, Ordering::SeqCst);
        let path = format!("/mnt/huge/nvme-{}-{}", process::id(), id);

        match fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.clone())
        {
            Ok(f) => {
                let pointer = unsafe {
                    libc::mmap(
                        ptr::null_mut(),
                        size,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_SHARED | libc::MAP_HUGETLB,
                        f.as_raw_fd(),
                        0,
                    )
                };
                if pointer == libc::MAP_FAILED {
                    Err("failed to mmap huge page - are huge pages enabled and free?".into())
                } else if unsafe { libc::mlock(pointer, size) } == 0 {
                    Ok(pointer as *mut u8)
                } else {
                    Err("failed to memory lock huge page".into())
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Err(Box::new(io::Error::new(
                e.kind(),
                format!("huge page {path} could not be created - huge pages enabled?"),
            ))),
            Err(e) => Err(Box::new(e)),
        }
    }

    fn deallocate(
        &self,
        address: *mut u8,
        layout: core::alloc::Layout,
    ) -> Result<(), Box<dyn Error>> {
        let size = round_to_huge_page(layout.size());
        if unsafe { libc::munmap(address as *mut libc::c_void, size) } == 0 {
            Ok(())
        } else {
            Err("failed to munmap huge page".into())
        }
    }

    fn translate_virtual_to_physical(
        &self,
        virtual_address: *const u8,
    ) -> Result<u64, Box<dyn Error>> {
        let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;

        let mut file = fs::OpenOptions::new()
            .read(true)
            .open("/proc/self/pagemap")?;

        file.seek(io::SeekFrom::Start(
            (virtual_address as usize / pagesize * mem::size_of::<usize>()) as u64,
        ))?;

        let mut buffer = [0; mem::size_of::<usize>()];
        file.read_exact(&mut buffer)?;

        let physical_frame = usize::from_ne_bytes(buffer);
        Ok(
            ((physical_frame & 0x007F_FFFF_FFFF_FFFF) * pagesize
                + virtual_address as usize % pagesize) as u64,
        )
    }
}

/// Access rights applied to a mapped region with [`Mmap::protect`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Protection {
    None,
    Read,
    ReadWrite,
}

#[cfg(windows)]
pub mod _win {
    use super::Protection;
    use core::ptr::null_mut;
    use std::io;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect},
        winnt::{
            MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READONLY,
            PAGE_READWRITE,
        },
    };

    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub fn new(size: usize) -> io::Result<Self> {
            unsafe {
                let mem = VirtualAlloc(null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE);
                if mem.is_null() {
                    return Err(io::Error::last_os_error());
                }
                let mem = mem as *mut u8;

                Ok(Self {
                    start: mem,
                    end: mem.add(size),
                    size,
                })
            }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            self.end
        }
        pub const fn size(&self) -> usize {
            self.size
        }

        /// Drops the physical pages backing `page..page+size`. They read as zero afterwards.
        pub fn dontneed(&self, page: *mut u8, size: usize) {
            unsafe {
                VirtualFree(page.cast(), size, MEM_DECOMMIT);
                VirtualAlloc(page.cast(), size, MEM_COMMIT, PAGE_READWRITE);
            }
        }

        pub fn decommit(&self, page: *mut u8, size: usize) {
            self.dontneed(page, size);
        }

        pub fn commit(&self, page: *mut u8, size: usize) {
            unsafe {
                VirtualAlloc(page.cast(), size, MEM_COMMIT, PAGE_READWRITE);
            }
        }

        pub fn protect(&self, protection: Protection) {
            let flags = match protection {
                Protection::None => PAGE_NOACCESS,
                Protection::Read => PAGE_READONLY,
                Protection::ReadWrite => PAGE_READWRITE,
            };
            unsafe {
                let mut old = 0;
                VirtualProtect(self.start.cast(), self.size, flags, &mut old);
            }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            if self.start.is_null() {
                return;
            }
            unsafe {
                VirtualFree(self.start.cast(), 0, MEM_RELEASE);
            }
        }
    }
}

#[cfg(unix)]
pub mod _unix {
    use super::Protection;
    use std::io;
    use std::ptr::null_mut;

    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub const fn size(&self) -> usize {
            self.size
        }
        pub fn new(size: usize) -> io::Result<Self> {
            unsafe {
                let map = libc::mmap(
                    null_mut(),
                    size as _,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    return Err(io::Error::last_os_error());
                }
                Ok(Self {
                    start: map as *mut u8,
                    end: (map as usize + size) as *mut u8,
                    size,
                })
            }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            self.end
        }

        /// Drops the physical pages backing `page..page+size`. They read as zero afterwards.
        pub fn dontneed(&self, page: *mut u8, size: usize) {
            unsafe {
                libc::madvise(page as *mut _, size as _, libc::MADV_DONTNEED);
            }
        }

        pub fn decommit(&self, page: *mut u8, size: usize) {
            self.dontneed(page, size);
        }

        pub fn commit(&self, page: *mut u8, size: usize) {
            unsafe {
                libc::madvise(page as *mut _, size as _, libc::MADV_WILLNEED);
            }
        }

        pub fn protect(&self, protection: Protection) {
            let prot = match protection {
                Protection::None => libc::PROT_NONE,
                Protection::Read => libc::PROT_READ,
                Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            };
            unsafe {
                let res = libc::mprotect(self.start as *mut _, self.size as _, prot);
                assert_eq!(
                    res,
                    0,
                    "mprotect({:p}, {}) failed: {}",
                    self.start,
                    self.size,
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            if self.start.is_null() {
                return;
            }
            unsafe {
                libc::munmap(self.start() as *mut _, self.size as _);
            }
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

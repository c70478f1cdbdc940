//! Page protection and raw code writes.
//!
//! This is the only module that touches executable memory directly. Every
//! other component goes through [`CodeRegion`], whose contract is an
//! address, a length, and the bytes written there.

use std::sync::OnceLock;

use crate::error::{BranchError, BranchResult};

/// Page protection requested for a trampoline page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadWriteExecute,
    ReadExecute,
}

/// Host page size, queried once.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(sys::page_size)
}

/// The run of whole pages covering `[address, address + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    start: usize,
    len: usize,
}

impl PageSpan {
    pub fn containing(address: usize, len: usize) -> Self {
        Self::with_page_size(address, len, page_size())
    }

    fn with_page_size(address: usize, len: usize, page: usize) -> Self {
        let start = address & !(page - 1);
        let end = address.saturating_add(len.max(1));
        let end = end.saturating_add(page - 1) & !(page - 1);
        Self {
            start,
            len: end - start,
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Change protection of every page touched by `[address, address + len)`.
pub fn protect(address: usize, len: usize, protection: Protection) -> BranchResult<()> {
    let span = PageSpan::containing(address, len);
    // SAFETY: the span only covers pages that contain the caller's code
    // range; changing their protection does not invalidate any Rust borrow.
    unsafe { sys::protect(span, protection) }.map_err(|source| BranchError::Permission {
        address,
        len,
        source,
    })
}

/// Request read+write+execute for the page(s) holding `address`.
pub fn make_writable(address: usize, len: usize) -> BranchResult<()> {
    protect(address, len, Protection::ReadWriteExecute)
}

/// Request read+execute for the page(s) holding `address`.
pub fn make_execute_only(address: usize, len: usize) -> BranchResult<()> {
    protect(address, len, Protection::ReadExecute)
}

/// A few bytes of machine code that the patch engine owns.
///
/// The region must stay mapped for the rest of the process. Writes require
/// the covering pages to be writable (see [`make_writable`]).
#[derive(Debug, Clone, Copy)]
pub struct CodeRegion {
    address: usize,
    len: usize,
}

impl CodeRegion {
    /// # Safety
    /// `address..address + len` must be mapped, readable code that nothing
    /// else in the process writes to, and must remain mapped forever.
    pub unsafe fn new(address: usize, len: usize) -> Self {
        Self { address, len }
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy the current bytes out of the region.
    pub fn read(&self) -> Vec<u8> {
        (0..self.len)
            // SAFETY: the constructor guarantees the range is mapped and readable.
            .map(|i| unsafe { std::ptr::read_volatile((self.address + i) as *const u8) })
            .collect()
    }

    /// Write a single byte at `offset`.
    ///
    /// # Safety
    /// The page holding `offset` must currently be writable.
    pub unsafe fn write_byte(&self, offset: usize, byte: u8) {
        debug_assert!(offset < self.len);
        unsafe { std::ptr::write_volatile((self.address + offset) as *mut u8, byte) }
    }

    /// Overwrite `N` bytes at `offset` with one store.
    ///
    /// The store is not atomic with respect to threads executing the region.
    ///
    /// # Safety
    /// The pages holding the range must currently be writable.
    pub unsafe fn write_bytes<const N: usize>(&self, offset: usize, bytes: [u8; N]) {
        debug_assert!(offset + N <= self.len);
        // [u8; N] has alignment 1, so an unaligned field is fine.
        unsafe { std::ptr::write_volatile((self.address + offset) as *mut [u8; N], bytes) }
    }

    /// Make freshly written instructions visible to instruction fetch.
    pub fn sync_icache(&self) {
        // SAFETY: the range is mapped for the lifetime of the region.
        unsafe { sys::flush_icache(self.address, self.len) }
    }
}

#[cfg(unix)]
mod sys {
    use super::{PageSpan, Protection};

    pub fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 { 4096 } else { size as usize }
    }

    pub unsafe fn protect(span: PageSpan, protection: Protection) -> std::io::Result<()> {
        let prot = match protection {
            Protection::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
        };
        let result = unsafe { libc::mprotect(span.start() as *mut libc::c_void, span.len(), prot) };
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
    pub unsafe fn flush_icache(_address: usize, _len: usize) {
        // x86 snoops stores into the instruction stream.
    }

    #[cfg(all(target_arch = "aarch64", target_vendor = "apple"))]
    pub unsafe fn flush_icache(address: usize, len: usize) {
        unsafe extern "C" {
            fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
        }
        unsafe { sys_icache_invalidate(address as *mut libc::c_void, len) }
    }

    #[cfg(all(target_arch = "aarch64", not(target_vendor = "apple")))]
    pub unsafe fn flush_icache(address: usize, len: usize) {
        unsafe extern "C" {
            fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
        }
        unsafe {
            __clear_cache(
                address as *mut libc::c_char,
                (address + len) as *mut libc::c_char,
            )
        }
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
    pub unsafe fn flush_icache(_address: usize, _len: usize) {}
}

#[cfg(windows)]
mod sys {
    use super::{PageSpan, Protection};
    use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows_sys::Win32::System::Memory::{
        PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS, VirtualProtect,
    };
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    pub fn page_size() -> usize {
        let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        if info.dwPageSize == 0 { 4096 } else { info.dwPageSize as usize }
    }

    pub unsafe fn protect(span: PageSpan, protection: Protection) -> std::io::Result<()> {
        let flags = match protection {
            Protection::ReadWriteExecute => PAGE_EXECUTE_READWRITE,
            Protection::ReadExecute => PAGE_EXECUTE_READ,
        };
        let mut old: PAGE_PROTECTION_FLAGS = 0;
        let ok = unsafe { VirtualProtect(span.start() as *const _, span.len(), flags, &mut old) };
        if ok == 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    pub unsafe fn flush_icache(address: usize, len: usize) {
        unsafe { FlushInstructionCache(GetCurrentProcess(), address as *const _, len) };
    }
}

#[cfg(not(any(unix, windows)))]
mod sys {
    use super::{PageSpan, Protection};

    pub fn page_size() -> usize {
        4096
    }

    pub unsafe fn protect(_span: PageSpan, _protection: Protection) -> std::io::Result<()> {
        Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
    }

    pub unsafe fn flush_icache(_address: usize, _len: usize) {}
}

/// Anonymous read+write+execute page used by tests as a stand-in for a
/// trampoline.
#[cfg(all(test, unix))]
pub(crate) struct ScratchPage {
    ptr: std::ptr::NonNull<u8>,
    size: usize,
}

#[cfg(all(test, unix))]
impl ScratchPage {
    pub fn new() -> Self {
        let size = page_size();
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED, "mmap failed");
        let ptr = std::ptr::NonNull::new(ptr as *mut u8).expect("mmap returned null");
        Self { ptr, size }
    }

    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn region(&self, offset: usize, len: usize) -> CodeRegion {
        assert!(offset + len <= self.size);
        unsafe { CodeRegion::new(self.address() + offset, len) }
    }
}

#[cfg(all(test, unix))]
impl Drop for ScratchPage {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = page_size();
        assert!(size >= 4096);
        assert!(size.is_power_of_two());
    }

    #[test]
    fn test_span_within_one_page() {
        let span = PageSpan::with_page_size(0x1234, 5, 0x1000);
        assert_eq!(span.start(), 0x1000);
        assert_eq!(span.len(), 0x1000);
    }

    #[test]
    fn test_span_straddles_boundary() {
        let span = PageSpan::with_page_size(0x1ffe, 5, 0x1000);
        assert_eq!(span.start(), 0x1000);
        assert_eq!(span.len(), 0x2000);
    }

    #[test]
    fn test_span_on_page_start() {
        let span = PageSpan::with_page_size(0x3000, 4, 0x1000);
        assert_eq!(span.start(), 0x3000);
        assert_eq!(span.len(), 0x1000);
    }

    #[cfg(unix)]
    #[test]
    fn test_protect_scratch_page() {
        let page = ScratchPage::new();
        let region = page.region(16, 5);

        make_writable(region.address(), region.len()).unwrap();
        unsafe {
            region.write_byte(0, 0xE9);
            region.write_bytes(1, [1, 2, 3, 4]);
        }
        region.sync_icache();
        make_execute_only(region.address(), region.len()).unwrap();

        assert_eq!(region.read(), vec![0xE9, 1, 2, 3, 4]);
        assert_eq!(page.size(), page_size());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_protect_unmapped_page_fails() {
        let err = make_writable(0, 1).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PagePermissions);
    }
}

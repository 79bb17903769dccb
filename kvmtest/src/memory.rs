use std::{
    ffi::c_void,
    mem::size_of,
    num::NonZeroUsize,
    os::fd::BorrowedFd,
    ptr::{NonNull, copy_nonoverlapping},
    sync::OnceLock,
};

use anyhow::{Context, Result, ensure};
use bytemuck::{CheckedBitPattern, Pod};
use nix::{
    sys::{
        mman::{MapFlags, ProtFlags, mmap, mmap_anonymous, mprotect, munmap},
        sysinfo::sysinfo,
    },
    unistd::{SysconfVar, sysconf},
};
use tracing::{debug, warn};
use volatile::VolatilePtr;
use x86_64::PhysAddr;

use crate::{
    hypervisor::{UserMemoryRegion, VirtualMachine},
    kvm::KvmUserspaceMemoryRegionFlags,
};

pub type MemoryFlags = KvmUserspaceMemoryRegionFlags;

/// The host page size, which is also the granularity of memory slots.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .and_then(|size| usize::try_from(size).ok())
            .unwrap_or(0x1000)
    })
}

pub fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    Some(value.checked_add(align - 1)? & !(align - 1))
}

/// Free host memory in bytes.
pub fn host_free_memory() -> Result<u64> {
    let info = sysinfo().context("failed to query sysinfo")?;
    Ok(info.ram_unused())
}

/// Guest memory registered as a hypervisor memory slot.
///
/// Regions are only ever owned by an [`crate::Instance`], which removes the
/// slot before the backing memory is unmapped.
pub struct MemoryRegion {
    slot: u32,
    gpa: PhysAddr,
    offset: usize,
    len: usize,
    flags: MemoryFlags,
    mapping: Mapping,
}

impl MemoryRegion {
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// The page-aligned guest physical address the slot starts at.
    pub fn gpa(&self) -> PhysAddr {
        self.gpa
    }

    /// The guest physical address that was requested for this region.
    pub fn base(&self) -> PhysAddr {
        self.gpa + self.offset as u64
    }

    /// Size of the registered slot, including alignment padding.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn flags(&self) -> MemoryFlags {
        self.flags
    }

    /// Host address of the page-aligned allocation backing the slot.
    pub fn allocation(&self) -> NonNull<u8> {
        self.mapping.as_ptr().cast()
    }

    /// Host address that corresponds to [`MemoryRegion::base`].
    pub fn usable_ptr(&self) -> NonNull<u8> {
        unsafe { self.allocation().byte_add(self.offset) }
    }

    pub fn contains(&self, gpa: PhysAddr, len: usize) -> bool {
        self.offset_of(gpa, len).is_some()
    }

    /// Translate a guest physical address inside the slot to a host pointer.
    pub fn host_ptr(&self, gpa: PhysAddr, len: usize) -> Option<NonNull<u8>> {
        let offset = self.offset_of(gpa, len)?;
        Some(unsafe { self.allocation().byte_add(offset) })
    }

    fn offset_of(&self, gpa: PhysAddr, len: usize) -> Option<usize> {
        let offset = gpa.as_u64().checked_sub(self.gpa.as_u64())?;
        let offset = usize::try_from(offset).ok()?;
        let end = offset.checked_add(len)?;
        (end <= self.len).then_some(offset)
    }

    pub fn read<T>(&self, gpa: PhysAddr) -> Result<T>
    where
        T: CheckedBitPattern,
    {
        let offset = self
            .offset_of(gpa, size_of::<T>())
            .context("address out of bounds")?;
        let mut bits = vec![0; size_of::<T>()];
        self.mapping.read_into(offset, &mut bits)?;
        let value = bytemuck::checked::try_pod_read_unaligned(&bits)?;
        Ok(value)
    }

    pub fn ptr<T>(&self, gpa: PhysAddr) -> Result<VolatilePtr<'_, T>>
    where
        T: Pod,
    {
        let offset = self
            .offset_of(gpa, size_of::<T>())
            .context("address out of bounds")?;
        self.mapping.ptr(offset)
    }

    pub fn write_bytes(&self, gpa: PhysAddr, bytes: &[u8]) -> Result<()> {
        let offset = self
            .offset_of(gpa, bytes.len())
            .context("address out of bounds")?;
        self.mapping.write_bytes(offset, bytes)
    }

    pub fn read_bytes(&self, gpa: PhysAddr, len: usize) -> Result<Vec<u8>> {
        let offset = self.offset_of(gpa, len).context("address out of bounds")?;
        let mut bytes = vec![0; len];
        self.mapping.read_into(offset, &mut bytes)?;
        Ok(bytes)
    }

    /// Read a NUL-terminated string of at most `max_len` bytes. The string is
    /// cut off at the end of the region.
    pub fn read_c_string(&self, gpa: PhysAddr, max_len: usize) -> Result<Vec<u8>> {
        let offset = self.offset_of(gpa, 0).context("address out of bounds")?;
        let end = self.len.min(offset.saturating_add(max_len));
        let mut bytes = Vec::new();
        for offset in offset..end {
            let byte = self.mapping.ptr::<u8>(offset)?.read();
            if byte == 0 {
                break;
            }
            bytes.push(byte);
        }
        Ok(bytes)
    }

    /// Remove the slot from the VM and release the backing memory.
    pub(crate) fn release<V>(self, vm: Option<&V>)
    where
        V: VirtualMachine,
    {
        if let Some(vm) = vm {
            let region = UserMemoryRegion {
                slot: self.slot,
                flags: self.flags,
                guest_phys_addr: self.gpa,
                memory_size: 0,
                userspace_addr: self.allocation().as_ptr() as usize,
            };
            let res = unsafe { vm.set_user_memory_region(&region) };
            if let Err(err) = res {
                warn!(slot = self.slot, "failed to remove memory slot: {err:#}");
            }
        }
        debug!(slot = self.slot, "releasing memory region");
    }
}

/// Allocate page-aligned host memory and register it as memory slot `slot`
/// at `baseaddr`.
///
/// The slot starts at `baseaddr` rounded down to the page size, so the memory
/// for `baseaddr` starts at `allocation + baseaddr % page_size`. Padding on
/// either end is part of the slot and stays writable.
pub fn alloc_memory<V>(
    vm: &V,
    slot: u32,
    baseaddr: PhysAddr,
    size: usize,
    flags: MemoryFlags,
) -> Result<MemoryRegion>
where
    V: VirtualMachine,
{
    ensure!(size > 0, "cannot allocate an empty memory region");

    let page_size = page_size();
    let gpa = baseaddr.align_down(page_size as u64);
    let offset = usize::try_from(baseaddr - gpa)?;
    let len = size
        .checked_add(offset)
        .and_then(|len| align_up(len, page_size))
        .context("memory region too big")?;
    let end = gpa
        .as_u64()
        .checked_add(u64::try_from(len)?)
        .context("memory region exceeds the guest physical address space")?;
    PhysAddr::try_new(end - 1)
        .ok()
        .context("memory region exceeds the guest physical address space")?;

    debug!(slot, gpa = %format_args!("{:#x}", gpa.as_u64()), len, "allocating memory region");
    let mapping = Mapping::guarded(len)?;

    let region = UserMemoryRegion {
        slot,
        flags,
        guest_phys_addr: gpa,
        memory_size: len,
        userspace_addr: mapping.as_ptr().as_ptr() as usize,
    };
    // If this fails, `mapping` is dropped before the error is returned and
    // nothing stays registered.
    unsafe { vm.set_user_memory_region(&region) }
        .with_context(|| format!("failed to register memory slot {slot}"))?;

    Ok(MemoryRegion {
        slot,
        gpa,
        offset,
        len,
        flags,
        mapping,
    })
}

/// A host mapping that is unmapped when dropped.
pub struct Mapping {
    ptr: NonNull<c_void>,
    len: NonZeroUsize,
    mapped_len: usize,
}

impl Mapping {
    pub fn anonymous(len: usize) -> Result<Self> {
        let len = NonZeroUsize::new(len).context("cannot create empty mmap")?;

        let res = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_ANONYMOUS | MapFlags::MAP_PRIVATE,
            )
        };
        let ptr = res.context("failed to mmap memory")?;

        Ok(Self {
            ptr,
            len,
            mapped_len: len.get(),
        })
    }

    /// Like [`Mapping::anonymous`], but followed by an inaccessible guard
    /// page.
    pub fn guarded(len: usize) -> Result<Self> {
        let guard = page_size();
        let mapped_len = len.checked_add(guard).context("mapping too big")?;
        let mut mapping = Self::anonymous(mapped_len)?;
        mapping.len = NonZeroUsize::new(len).context("cannot create empty mmap")?;

        let guard_page = unsafe { mapping.ptr.byte_add(len) };
        let res = unsafe { mprotect(guard_page, guard, ProtFlags::PROT_NONE) };
        res.context("failed to protect guard page")?;

        Ok(mapping)
    }

    pub fn shared(fd: BorrowedFd<'_>, len: usize) -> Result<Self> {
        let len = NonZeroUsize::new(len).context("cannot create empty mmap")?;

        let res = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        };
        let ptr = res.context("failed to mmap file")?;

        Ok(Self {
            ptr,
            len,
            mapped_len: len.get(),
        })
    }

    pub fn as_ptr(&self) -> NonNull<c_void> {
        self.ptr
    }

    pub fn len(&self) -> NonZeroUsize {
        self.len
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        let end = offset.checked_add(len).context("offset too big")?;
        ensure!(end <= self.len.get(), "offset too big");
        Ok(())
    }

    pub fn ptr<T>(&self, offset: usize) -> Result<VolatilePtr<'_, T>>
    where
        T: Pod,
    {
        self.check_bounds(offset, size_of::<T>())?;
        unsafe {
            let ptr = self.ptr.byte_add(offset).cast();
            Ok(VolatilePtr::new(ptr))
        }
    }

    pub fn read_into(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.ptr::<u8>(offset + i)?.read();
        }
        Ok(())
    }

    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check_bounds(offset, bytes.len())?;
        unsafe {
            let dst = self.ptr.byte_add(offset).cast::<u8>();
            copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len());
        }
        Ok(())
    }
}

unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        let res = unsafe { munmap(self.ptr, self.mapped_len) };
        if let Err(err) = res {
            warn!("failed to unmap memory: {err}");
        }
    }
}

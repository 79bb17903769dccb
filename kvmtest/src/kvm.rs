use std::{
    fs::OpenOptions,
    mem::size_of,
    num::NonZeroU32,
    os::{
        fd::{AsFd, AsRawFd, FromRawFd, OwnedFd},
        unix::prelude::OpenOptionsExt,
    },
};

use anyhow::{Context, Result, ensure};
use bitflags::bitflags;
use bytemuck::{Pod, Zeroable, cast_slice, pod_read_unaligned};
use nix::{
    errno::Errno, ioctl_read, ioctl_readwrite, ioctl_write_int_bad, ioctl_write_ptr,
    libc::O_CLOEXEC, request_code_none,
};
use tracing::debug;

use crate::{
    hypervisor::{CpuidQuery, Hypervisor, UserMemoryRegion, VirtualCpu, VirtualMachine},
    memory::Mapping,
};

const KVMIO: u8 = 0xAE;

/// The only API version KVM has ever shipped.
const KVM_API_VERSION: i32 = 12;

pub struct KvmHandle {
    fd: OwnedFd,
    vcpu_mmap_size: usize,
}

impl KvmHandle {
    pub fn new() -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(O_CLOEXEC)
            .open("/dev/kvm")
            .context("failed to open /dev/kvm")?;
        let fd = OwnedFd::from(file);

        ioctl_write_int_bad!(kvm_get_api_version, request_code_none!(KVMIO, 0x00));
        let res = unsafe { kvm_get_api_version(fd.as_raw_fd(), 0) };
        let version = res.context("failed to execute get_api_version")?;
        debug!(version, "determined kvm version");
        ensure!(
            version == KVM_API_VERSION,
            "unsupported kvm api version ({version})"
        );

        ioctl_write_int_bad!(kvm_get_vcpu_mmap_size, request_code_none!(KVMIO, 0x04));
        let res = unsafe { kvm_get_vcpu_mmap_size(fd.as_raw_fd(), 0) };
        let vcpu_mmap_size = res.context("failed to query vcpu mmap size")?;
        let vcpu_mmap_size = usize::try_from(vcpu_mmap_size)?;
        ensure!(
            vcpu_mmap_size >= size_of::<KvmRun>(),
            "unexpected vcpu mmap size: got {vcpu_mmap_size}, expected at least {}",
            size_of::<KvmRun>()
        );

        Ok(Self { fd, vcpu_mmap_size })
    }

    pub fn check_extension(&self, cap: KvmCap) -> Result<Option<NonZeroU32>> {
        ioctl_write_int_bad!(kvm_check_extension, request_code_none!(KVMIO, 0x03));
        let res = unsafe { kvm_check_extension(self.fd.as_raw_fd(), cap.0 as i32) };
        let value = res.context("failed to check extension")?;
        Ok(NonZeroU32::new(u32::try_from(value)?))
    }

    pub fn create_vm(&self) -> Result<VmHandle> {
        debug!("creating vm");

        ioctl_write_int_bad!(kvm_create_vm, request_code_none!(KVMIO, 0x01));
        let res = unsafe { kvm_create_vm(self.fd.as_raw_fd(), 0) };
        let raw_fd = res.context("failed to create vm")?;
        let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

        Ok(VmHandle { fd })
    }

    /// Query up to `max_entries` supported CPUID leaves.
    pub fn get_supported_cpuid(&self, max_entries: usize) -> Result<CpuidQuery> {
        debug!(max_entries, "querying supported cpuid");

        let mut buffer = CpuidBuffer::new(max_entries)?;
        ioctl_readwrite!(kvm_get_supported_cpuid, KVMIO, 0x05, KvmCpuid2Header);
        let res = unsafe { kvm_get_supported_cpuid(self.fd.as_raw_fd(), buffer.as_mut_ptr()) };
        match res {
            Ok(_) => Ok(CpuidQuery::Entries(buffer.entries().to_vec())),
            Err(Errno::E2BIG) => Ok(CpuidQuery::TooSmall),
            Err(err) => Err(err).context("failed to query supported cpuid features"),
        }
    }
}

pub struct VmHandle {
    fd: OwnedFd,
}

impl VmHandle {
    pub fn create_vcpu(&self, id: i32) -> Result<VcpuHandle> {
        debug!(id, "creating vcpu");

        ioctl_write_int_bad!(kvm_create_vcpu, request_code_none!(KVMIO, 0x41));
        let res = unsafe { kvm_create_vcpu(self.fd.as_raw_fd(), id) };
        let raw_fd = res.context("failed to create cpu")?;
        let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

        Ok(VcpuHandle { fd })
    }

    /// # Safety
    ///
    /// The host memory described by `region` must stay mapped until the slot
    /// is removed again or the VM is closed.
    pub unsafe fn set_user_memory_region(&self, region: &KvmUserspaceMemoryRegion) -> Result<()> {
        debug!(
            slot = region.slot,
            guest_phys_addr = %format_args!("{:#x}", region.guest_phys_addr),
            memory_size = region.memory_size,
            "setting memory region"
        );

        ioctl_write_ptr!(
            kvm_set_user_memory_region,
            KVMIO,
            0x46,
            KvmUserspaceMemoryRegion
        );
        let res = unsafe { kvm_set_user_memory_region(self.fd.as_raw_fd(), region) };
        res.context("failed to set memory region")?;
        Ok(())
    }
}

pub struct VcpuHandle {
    fd: OwnedFd,
}

impl VcpuHandle {
    pub fn get_regs(&self) -> Result<KvmRegs> {
        let mut regs = KvmRegs::zeroed();
        ioctl_read!(kvm_get_regs, KVMIO, 0x81, KvmRegs);
        let res = unsafe { kvm_get_regs(self.fd.as_raw_fd(), &mut regs) };
        res.context("failed to get registers")?;
        Ok(regs)
    }

    pub fn set_regs(&self, regs: KvmRegs) -> Result<()> {
        ioctl_write_ptr!(kvm_set_regs, KVMIO, 0x82, KvmRegs);
        let res = unsafe { kvm_set_regs(self.fd.as_raw_fd(), &regs) };
        res.context("failed to set registers")?;
        Ok(())
    }

    pub fn get_sregs(&self) -> Result<KvmSregs> {
        let mut regs = KvmSregs::zeroed();
        ioctl_read!(kvm_get_sregs, KVMIO, 0x83, KvmSregs);
        let res = unsafe { kvm_get_sregs(self.fd.as_raw_fd(), &mut regs) };
        res.context("failed to get special registers")?;
        Ok(regs)
    }

    pub fn set_sregs(&self, regs: KvmSregs) -> Result<()> {
        ioctl_write_ptr!(kvm_set_sregs, KVMIO, 0x84, KvmSregs);
        let res = unsafe { kvm_set_sregs(self.fd.as_raw_fd(), &regs) };
        res.context("failed to set special registers")?;
        Ok(())
    }

    pub fn set_cpuid(&self, entries: &[KvmCpuidEntry2]) -> Result<()> {
        debug!(entries = entries.len(), "setting cpuid");

        let mut buffer = CpuidBuffer::new(entries.len())?;
        buffer.entries_mut().copy_from_slice(entries);

        ioctl_write_ptr!(kvm_set_cpuid2, KVMIO, 0x90, KvmCpuid2Header);
        let res = unsafe { kvm_set_cpuid2(self.fd.as_raw_fd(), buffer.as_mut_ptr()) };
        res.context("failed to set cpuid")?;

        Ok(())
    }

    pub fn map_kvm_run_block(&self, len: usize) -> Result<Mapping> {
        Mapping::shared(self.fd.as_fd(), len).context("failed to map vcpu kvm_run block")
    }

    /// Returns `true` if the cpu ran uninterrupted or returns `false` if the
    /// thread was interrupted by a signal.
    pub fn run(&self) -> Result<bool> {
        debug!("running vcpu");

        ioctl_write_int_bad!(kvm_run, request_code_none!(KVMIO, 0x80));

        loop {
            let res = unsafe { kvm_run(self.fd.as_raw_fd(), 0) };
            match res {
                Ok(_) => return Ok(true),
                Err(Errno::EAGAIN) => {}
                Err(Errno::EINTR) => return Ok(false),
                Err(e) => return Err(e).context("failed to run vcpu"),
            }
        }
    }
}

impl Hypervisor for KvmHandle {
    type Vm = VmHandle;

    fn vcpu_mmap_size(&self) -> Result<usize> {
        Ok(self.vcpu_mmap_size)
    }

    fn create_vm(&self) -> Result<VmHandle> {
        KvmHandle::create_vm(self)
    }

    fn has_extended_cpuid(&self) -> Result<bool> {
        Ok(self.check_extension(KvmCap::EXT_CPUID)?.is_some())
    }

    fn query_supported_cpuid(&self, max_entries: usize) -> Result<CpuidQuery> {
        self.get_supported_cpuid(max_entries)
    }
}

impl VirtualMachine for VmHandle {
    type Vcpu = VcpuHandle;

    fn create_vcpu(&self, id: u32) -> Result<VcpuHandle> {
        VmHandle::create_vcpu(self, i32::try_from(id)?)
    }

    unsafe fn set_user_memory_region(&self, region: &UserMemoryRegion) -> Result<()> {
        let region = KvmUserspaceMemoryRegion {
            slot: region.slot,
            flags: region.flags,
            guest_phys_addr: region.guest_phys_addr.as_u64(),
            memory_size: u64::try_from(region.memory_size)?,
            userspace_addr: region.userspace_addr as u64,
        };
        unsafe { VmHandle::set_user_memory_region(self, &region) }
    }
}

impl VirtualCpu for VcpuHandle {
    fn set_cpuid(&self, entries: &[KvmCpuidEntry2]) -> Result<()> {
        VcpuHandle::set_cpuid(self, entries)
    }

    fn get_regs(&self) -> Result<KvmRegs> {
        VcpuHandle::get_regs(self)
    }

    fn set_regs(&self, regs: KvmRegs) -> Result<()> {
        VcpuHandle::set_regs(self, regs)
    }

    fn get_sregs(&self) -> Result<KvmSregs> {
        VcpuHandle::get_sregs(self)
    }

    fn set_sregs(&self, sregs: KvmSregs) -> Result<()> {
        VcpuHandle::set_sregs(self, sregs)
    }

    fn map_run_state(&self, len: usize) -> Result<Mapping> {
        self.map_kvm_run_block(len)
    }

    fn run(&self) -> Result<bool> {
        VcpuHandle::run(self)
    }
}

/// Owned `struct kvm_cpuid2` with room for a fixed number of entries.
struct CpuidBuffer {
    words: Vec<u32>,
}

impl CpuidBuffer {
    const HEADER_WORDS: usize = size_of::<KvmCpuid2Header>() / size_of::<u32>();
    const ENTRY_WORDS: usize = size_of::<KvmCpuidEntry2>() / size_of::<u32>();

    fn new(nent: usize) -> Result<Self> {
        let len = nent
            .checked_mul(Self::ENTRY_WORDS)
            .and_then(|len| len.checked_add(Self::HEADER_WORDS))
            .context("cpuid buffer too big")?;
        let mut words = vec![0; len];
        words[0] = u32::try_from(nent)?;
        Ok(Self { words })
    }

    fn nent(&self) -> usize {
        let capacity = (self.words.len() - Self::HEADER_WORDS) / Self::ENTRY_WORDS;
        // The kernel writes back how many entries it filled in.
        (self.words[0] as usize).min(capacity)
    }

    fn entries(&self) -> &[KvmCpuidEntry2] {
        let end = Self::HEADER_WORDS + self.nent() * Self::ENTRY_WORDS;
        cast_slice(&self.words[Self::HEADER_WORDS..end])
    }

    fn entries_mut(&mut self) -> &mut [KvmCpuidEntry2] {
        let end = Self::HEADER_WORDS + self.nent() * Self::ENTRY_WORDS;
        bytemuck::cast_slice_mut(&mut self.words[Self::HEADER_WORDS..end])
    }

    fn as_mut_ptr(&mut self) -> *mut KvmCpuid2Header {
        self.words.as_mut_ptr().cast()
    }
}

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct KvmRegs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

const KVM_NR_INTERRUPTS: usize = 256;

#[derive(Clone, Copy, Pod, Zeroable, Debug)]
#[repr(C)]
pub struct KvmSregs {
    pub cs: KvmSegment,
    pub ds: KvmSegment,
    pub es: KvmSegment,
    pub fs: KvmSegment,
    pub gs: KvmSegment,
    pub ss: KvmSegment,
    pub tr: KvmSegment,
    pub ldt: KvmSegment,
    pub gdt: KvmDtable,
    pub idt: KvmDtable,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,
    pub apic_base: u64,
    pub interrupt_bitmap: [u64; KVM_NR_INTERRUPTS.div_ceil(64)],
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct KvmSegment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub ty: u8,
    pub present: u8,
    pub dpl: u8,
    pub db: u8,
    pub s: u8,
    pub l: u8,
    pub g: u8,
    pub avl: u8,
    pub unusable: u8,
    _padding: u8,
}

impl KvmSegment {
    /// The code segment as it looks right after a cold reset.
    pub const RESET_CODE: Self = Self {
        base: 0xffff_0000,
        limit: 0xffff,
        selector: 0xf000,
        ty: 11,
        present: 1,
        dpl: 0,
        db: 0,
        s: 1,
        l: 0,
        g: 0,
        avl: 0,
        unusable: 0,
        _padding: 0,
    };
}

impl std::fmt::Debug for KvmSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvmSegment")
            .field("base", &self.base)
            .field("limit", &self.limit)
            .field("selector", &self.selector)
            .field("ty", &self.ty)
            .field("present", &self.present)
            .field("dpl", &self.dpl)
            .field("db", &self.db)
            .field("s", &self.s)
            .field("l", &self.l)
            .field("g", &self.g)
            .field("avl", &self.avl)
            .field("unusable", &self.unusable)
            .finish()
    }
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct KvmDtable {
    pub base: u64,
    pub limit: u16,
    _padding: [u16; 3],
}

impl std::fmt::Debug for KvmDtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvmDtable")
            .field("base", &self.base)
            .field("limit", &self.limit)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct KvmCpuidEntry2 {
    pub function: u32,
    pub index: u32,
    pub flags: u32,
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    padding: [u32; 3],
}

impl KvmCpuidEntry2 {
    pub const fn new(function: u32, index: u32, [eax, ebx, ecx, edx]: [u32; 4]) -> Self {
        Self {
            function,
            index,
            flags: 0,
            eax,
            ebx,
            ecx,
            edx,
            padding: [0; 3],
        }
    }
}

#[repr(C)]
pub struct KvmCpuid2Header {
    nent: u32,
    _padding: u32,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct KvmRun {
    pub request_interrupt_window: u8,
    pub immediate_exit: u8,
    padding1: [u8; 6],

    pub exit_reason: u32,
    pub ready_for_interrupt_injection: u8,
    pub if_flag: u8,
    pub flags: u16,

    pub cr8: u64,
    pub apic_base: u64,

    pub exit_data: [u8; 256],

    pub kvm_valid_regs: u64,
    pub kvm_dirty_regs: u64,
    pub regs: KvmSyncRegs,

    padding2: [u8; 1744],

    space_for_data: [u8; 4096],
}

impl KvmRun {
    /// Offset of the port I/O data area that follows the first page.
    pub const IO_DATA_OFFSET: usize = 4096;
}

pub const KVM_EXIT_UNKNOWN: u32 = 0;
pub const KVM_EXIT_IO: u32 = 2;
pub const KVM_EXIT_DEBUG: u32 = 4;
pub const KVM_EXIT_HLT: u32 = 5;
pub const KVM_EXIT_MMIO: u32 = 6;
pub const KVM_EXIT_IRQ_WINDOW_OPEN: u32 = 7;
pub const KVM_EXIT_SHUTDOWN: u32 = 8;
pub const KVM_EXIT_FAIL_ENTRY: u32 = 9;
pub const KVM_EXIT_INTR: u32 = 10;
pub const KVM_EXIT_INTERNAL_ERROR: u32 = 17;
pub const KVM_EXIT_SYSTEM_EVENT: u32 = 24;

#[derive(Clone, Copy, Debug)]
pub enum KvmExit {
    Unknown(KvmExitUnknown),
    Io(KvmExitIo),
    Debug(KvmExitDebug),
    Hlt,
    Mmio(KvmExitMmio),
    IrqWindowOpen,
    Shutdown,
    FailEntry(KvmExitFailEntry),
    Interrupted,
    Internal(KvmExitInternalError),
    SystemEvent(KvmExitSystemEvent),
    Other { exit_reason: u32 },
}

impl KvmExit {
    /// Decode the exit reason and the exit union of a `kvm_run` block.
    pub fn decode(exit_reason: u32, exit_data: &[u8; 256]) -> Self {
        match exit_reason {
            KVM_EXIT_UNKNOWN => {
                KvmExit::Unknown(pod_read_unaligned(&exit_data[..size_of::<KvmExitUnknown>()]))
            }
            KVM_EXIT_IO => KvmExit::Io(pod_read_unaligned(&exit_data[..size_of::<KvmExitIo>()])),
            KVM_EXIT_DEBUG => {
                KvmExit::Debug(pod_read_unaligned(&exit_data[..size_of::<KvmExitDebug>()]))
            }
            KVM_EXIT_HLT => KvmExit::Hlt,
            KVM_EXIT_MMIO => {
                KvmExit::Mmio(pod_read_unaligned(&exit_data[..size_of::<KvmExitMmio>()]))
            }
            KVM_EXIT_IRQ_WINDOW_OPEN => KvmExit::IrqWindowOpen,
            KVM_EXIT_SHUTDOWN => KvmExit::Shutdown,
            KVM_EXIT_FAIL_ENTRY => KvmExit::FailEntry(pod_read_unaligned(
                &exit_data[..size_of::<KvmExitFailEntry>()],
            )),
            KVM_EXIT_INTR => KvmExit::Interrupted,
            KVM_EXIT_INTERNAL_ERROR => KvmExit::Internal(pod_read_unaligned(
                &exit_data[..size_of::<KvmExitInternalError>()],
            )),
            KVM_EXIT_SYSTEM_EVENT => KvmExit::SystemEvent(pod_read_unaligned(
                &exit_data[..size_of::<KvmExitSystemEvent>()],
            )),
            exit_reason => KvmExit::Other { exit_reason },
        }
    }
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct KvmSyncRegs {
    pub regs: KvmRegs,
    pub sregs: KvmSregs,
    pub events: KvmVcpuEvents,
    _padding: [u8; 1528],
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct KvmVcpuEvents {
    pub exception: [u8; 8],
    pub interrupt: [u8; 4],
    pub nmi: [u8; 4],
    pub sipi_vector: u32,
    pub flags: u32,
    pub smi: [u8; 4],
    reserved: [u8; 27],
    pub exception_has_payload: u8,
    pub exception_payload: u64,
}

#[derive(Clone, Copy, Pod, Zeroable, Debug)]
#[repr(C, packed)]
pub struct KvmExitUnknown {
    pub hardware_exit_reason: u64,
}

pub const KVM_EXIT_IO_IN: u8 = 0;
pub const KVM_EXIT_IO_OUT: u8 = 1;

#[derive(Clone, Copy, Pod, Zeroable, Debug)]
#[repr(C, packed)]
pub struct KvmExitIo {
    pub direction: u8,
    pub size: u8,
    pub port: u16,
    pub count: u32,
    /// relative to kvm_run start
    pub data_offset: u64,
}

#[derive(Clone, Copy, Pod, Zeroable, Debug)]
#[repr(C, packed)]
pub struct KvmExitDebug {
    pub exception: u32,
    pub pad: u32,
    pub pc: u64,
    pub dr6: u64,
    pub dr7: u64,
}

#[derive(Clone, Copy, Pod, Zeroable, Debug)]
#[repr(C, packed)]
pub struct KvmExitMmio {
    pub phys_addr: u64,
    pub data: [u8; 8],
    pub len: u32,
    pub is_write: u8,
}

#[derive(Clone, Copy, Pod, Zeroable, Debug)]
#[repr(C, packed)]
pub struct KvmExitFailEntry {
    pub hardware_entry_failure_reason: u64,
    pub cpu: u32,
}

#[derive(Clone, Copy, Pod, Zeroable, Debug)]
#[repr(C, packed)]
pub struct KvmExitInternalError {
    pub suberror: u32,
    pub ndata: u32,
    pub data: [u64; 16],
}

#[derive(Clone, Copy, Pod, Zeroable, Debug)]
#[repr(C, packed)]
pub struct KvmExitSystemEvent {
    pub ty: u32,
    pub ndata: u32,
    pub data: [u64; 16],
}

#[repr(transparent)]
pub struct KvmCap(pub u32);

impl KvmCap {
    pub const EXT_CPUID: Self = Self(7);
}

#[derive(Debug)]
#[repr(C)]
pub struct KvmUserspaceMemoryRegion {
    pub slot: u32,
    pub flags: KvmUserspaceMemoryRegionFlags,
    pub guest_phys_addr: u64,
    /// bytes
    pub memory_size: u64,
    /// start of the userspace allocated memory
    pub userspace_addr: u64,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct KvmUserspaceMemoryRegionFlags: u32 {
        const KVM_MEM_LOG_DIRTY_PAGES = 1 << 0;
        const KVM_MEM_READONLY = 1 << 1;
    }
}

//! The capability surface the harness needs from a hypervisor.
//!
//! [`crate::kvm`] implements these traits on top of `/dev/kvm`. The simulated
//! backend used by the unit tests lives in `crate::sim`.

use anyhow::Result;
use x86_64::PhysAddr;

use crate::{
    kvm::{KvmCpuidEntry2, KvmRegs, KvmSregs, KvmUserspaceMemoryRegionFlags},
    memory::{self, Mapping},
};

/// Outcome of a single supported-CPUID query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpuidQuery {
    Entries(Vec<KvmCpuidEntry2>),
    /// The buffer offered to the hypervisor was too small.
    TooSmall,
}

/// A memory slot as handed to the hypervisor.
#[derive(Debug, Clone, Copy)]
pub struct UserMemoryRegion {
    pub slot: u32,
    pub flags: KvmUserspaceMemoryRegionFlags,
    pub guest_phys_addr: PhysAddr,
    /// Size in bytes. A size of zero removes the slot.
    pub memory_size: usize,
    pub userspace_addr: usize,
}

/// The system-wide hypervisor handle (`/dev/kvm`).
pub trait Hypervisor {
    type Vm: VirtualMachine;

    /// Size of the per-vCPU run state mapping.
    fn vcpu_mmap_size(&self) -> Result<usize>;

    fn create_vm(&self) -> Result<Self::Vm>;

    /// Whether the hypervisor can report the CPUID leaves it supports.
    fn has_extended_cpuid(&self) -> Result<bool>;

    fn query_supported_cpuid(&self, max_entries: usize) -> Result<CpuidQuery>;

    /// Free host memory in bytes.
    fn host_free_memory(&self) -> Result<u64> {
        memory::host_free_memory()
    }
}

pub trait VirtualMachine {
    type Vcpu: VirtualCpu;

    fn create_vcpu(&self, id: u32) -> Result<Self::Vcpu>;

    /// Register (or, with a zero size, remove) a memory slot.
    ///
    /// # Safety
    ///
    /// The host memory described by `region` must stay mapped until the slot
    /// is removed again or the VM is dropped.
    unsafe fn set_user_memory_region(&self, region: &UserMemoryRegion) -> Result<()>;
}

pub trait VirtualCpu {
    fn set_cpuid(&self, entries: &[KvmCpuidEntry2]) -> Result<()>;

    fn get_regs(&self) -> Result<KvmRegs>;

    fn set_regs(&self, regs: KvmRegs) -> Result<()>;

    fn get_sregs(&self) -> Result<KvmSregs>;

    fn set_sregs(&self, sregs: KvmSregs) -> Result<()>;

    /// Map the vCPU's `kvm_run` block into the host.
    fn map_run_state(&self, len: usize) -> Result<Mapping>;

    /// Release a mapping obtained from [`VirtualCpu::map_run_state`].
    fn unmap_run_state(&self, mapping: Mapping) {
        drop(mapping);
    }

    /// Enter the guest. Returns `false` if a signal interrupted the call
    /// before the guest exited.
    fn run(&self) -> Result<bool>;
}

pub type VcpuOf<H> = <<H as Hypervisor>::Vm as VirtualMachine>::Vcpu;

//! Building and tearing down a single-vCPU VM.

use std::ptr::NonNull;

use anyhow::{Context, anyhow, ensure};
use bit_field::BitField;
use bytemuck::bytes_of;
use tracing::{debug, info};
use x86_64::{PhysAddr, registers::control::Cr0Flags};

use crate::{
    cpuid,
    error::{Classify, Error},
    hypervisor::{Hypervisor, VcpuOf, VirtualCpu, VirtualMachine},
    layout::{Layout, X86_RESET_CODE},
    memory::{self, Mapping, MemoryFlags, MemoryRegion},
    result::{RESULT_HEADER_SIZE, ResultHeader},
    run::ExecState,
};

pub const RAM_SLOT: u32 = 0;
pub const RESULT_SLOT: u32 = 1;

/// Longest file name read from the guest.
const MAX_FILE_NAME_LEN: usize = 256;

/// The code and data that make up a guest.
#[derive(Debug, Clone, Copy)]
pub struct GuestImage<'a> {
    /// Flat binary loaded at the kernel base.
    pub payload: &'a [u8],
    /// Code placed at the reset vector.
    pub reset_code: &'a [u8],
}

impl<'a> GuestImage<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            payload,
            reset_code: &X86_RESET_CODE,
        }
    }

    pub fn with_reset_code(self, reset_code: &'a [u8]) -> Self {
        Self { reset_code, ..self }
    }
}

/// A VM with one vCPU, guest RAM and the result page.
///
/// Dropping an instance releases everything it holds, including instances
/// that were only partially built.
pub struct Instance<H>
where
    H: Hypervisor,
{
    pub(crate) layout: Layout,
    ram_size: usize,
    pub(crate) state: ExecState,
    pub(crate) run_state: Option<Mapping>,
    pub(crate) vcpu: Option<VcpuOf<H>>,
    regions: Vec<MemoryRegion>,
    vm: Option<H::Vm>,
}

impl<H> Instance<H>
where
    H: Hypervisor,
{
    /// Create a VM, load `image` and prepare the vCPU to start at the reset
    /// vector.
    pub fn create(
        hypervisor: &H,
        layout: Layout,
        image: &GuestImage<'_>,
        ram_size: usize,
    ) -> Result<Self, Error> {
        let page_size = memory::page_size();
        layout
            .validate(page_size)
            .context("invalid memory layout")
            .resource()?;
        if image.reset_code.len() > layout.reset_code_size {
            return Err(Error::Resource(anyhow!(
                "reset code is {} bytes, at most {} bytes fit",
                image.reset_code.len(),
                layout.reset_code_size
            )));
        }

        let ram_size = layout.adjust_ram_size(ram_size, image.payload.len(), page_size);
        let free_memory = hypervisor.host_free_memory().environment()?;
        if free_memory < ram_size as u64 {
            return Err(Error::Environment(anyhow!(
                "not enough free memory: {ram_size} bytes required, {free_memory} bytes available"
            )));
        }

        let mmap_size = hypervisor.vcpu_mmap_size().resource()?;
        let vm = hypervisor.create_vm().resource()?;
        let mut instance = Self {
            layout,
            ram_size,
            state: ExecState::Runnable,
            run_state: None,
            vcpu: None,
            regions: Vec::new(),
            vm: Some(vm),
        };

        let cpuid = cpuid::supported_cpuid(hypervisor).resource()?;

        let vcpu = instance.vm().resource()?.create_vcpu(0).resource()?;
        let vcpu = instance.vcpu.insert(vcpu);
        match &cpuid {
            Some(cpuid) => vcpu.set_cpuid(cpuid.entries()).resource()?,
            None => debug!("keeping default cpuid leaves"),
        }
        instance.run_state = Some(vcpu.map_run_state(mmap_size).resource()?);

        let result_page = layout.result_page(page_size);
        instance.alloc_memory(RAM_SLOT, PhysAddr::zero(), ram_size, MemoryFlags::empty())?;
        instance.alloc_memory(
            RESULT_SLOT,
            PhysAddr::new(result_page),
            layout.result_slot_size(page_size),
            MemoryFlags::empty(),
        )?;

        instance
            .load(image)
            .context("failed to load guest image")
            .resource()?;
        instance
            .prime_vcpu()
            .context("failed to initialize vcpu")
            .resource()?;
        instance.reset_result().resource()?;

        info!(ram_size, payload = image.payload.len(), "created vm instance");
        Ok(instance)
    }

    fn load(&self, image: &GuestImage<'_>) -> anyhow::Result<()> {
        self.ram()?
            .write_bytes(PhysAddr::new(self.layout.kernel_base), image.payload)
            .context("payload doesn't fit into ram")?;
        self.result_region()?
            .write_bytes(PhysAddr::new(self.layout.reset_base), image.reset_code)
            .context("failed to write reset code")?;
        Ok(())
    }

    /// Point the vCPU at the reset vector with power-on control registers.
    fn prime_vcpu(&self) -> anyhow::Result<()> {
        let vcpu = self.vcpu()?;
        let reset_base = self.layout.reset_base;

        let mut sregs = vcpu.get_sregs()?;
        let cs_base = reset_base & !0xffff;
        sregs.cs.base = cs_base;
        sregs.cs.selector = cs_base.get_bits(4..20) as u16;
        sregs.cr0 = (Cr0Flags::EXTENSION_TYPE
            | Cr0Flags::CACHE_DISABLE
            | Cr0Flags::NOT_WRITE_THROUGH)
            .bits();
        vcpu.set_sregs(sregs)?;

        let mut regs = vcpu.get_regs()?;
        regs.rip = reset_base & 0xffff;
        // Bit 1 is reserved and always set.
        regs.rflags = 2;
        vcpu.set_regs(regs)?;

        Ok(())
    }

    /// Allocate and register another memory slot.
    ///
    /// The region stays owned by the instance and is released when the
    /// instance is destroyed.
    pub fn alloc_memory(
        &mut self,
        slot: u32,
        baseaddr: PhysAddr,
        size: usize,
        flags: MemoryFlags,
    ) -> Result<&MemoryRegion, Error> {
        if self.region(slot).is_some() {
            return Err(Error::Resource(anyhow!("memory slot {slot} is already in use")));
        }
        let vm = self.vm().resource()?;
        let region = memory::alloc_memory(vm, slot, baseaddr, size, flags).resource()?;
        self.regions.push(region);
        Ok(&self.regions[self.regions.len() - 1])
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// RAM size after adjustment.
    pub fn ram_size(&self) -> usize {
        self.ram_size
    }

    pub fn state(&self) -> ExecState {
        self.state
    }

    pub fn region(&self, slot: u32) -> Option<&MemoryRegion> {
        self.regions.iter().find(|region| region.slot() == slot)
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn ram(&self) -> anyhow::Result<&MemoryRegion> {
        self.region(RAM_SLOT).context("guest ram isn't mapped")
    }

    pub fn result_region(&self) -> anyhow::Result<&MemoryRegion> {
        self.region(RESULT_SLOT).context("result page isn't mapped")
    }

    pub(crate) fn vm(&self) -> anyhow::Result<&H::Vm> {
        self.vm.as_ref().context("vm was destroyed")
    }

    pub(crate) fn vcpu(&self) -> anyhow::Result<&VcpuOf<H>> {
        self.vcpu.as_ref().context("vcpu was destroyed")
    }

    /// Translate a guest physical address to host memory. `len` bytes
    /// starting at `addr` have to lie within a single region.
    pub fn guest_ptr(&self, addr: u64, len: usize) -> Option<NonNull<u8>> {
        let gpa = PhysAddr::try_new(addr).ok()?;
        self.regions
            .iter()
            .find_map(|region| region.host_ptr(gpa, len))
    }

    /// Read a NUL-terminated string from guest memory.
    pub fn guest_string(&self, addr: u64, max_len: usize) -> Option<String> {
        let gpa = PhysAddr::try_new(addr).ok()?;
        let region = self.regions.iter().find(|region| region.contains(gpa, 1))?;
        let bytes = region.read_c_string(gpa, max_len).ok()?;
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// File name a verdict points to, or `<unknown>` if the guest passed a
    /// bad pointer.
    pub(crate) fn guest_file_name(&self, addr: u64) -> String {
        self.guest_string(addr, MAX_FILE_NAME_LEN)
            .unwrap_or_else(|| "<unknown>".to_owned())
    }

    pub(crate) fn read_result_header(&self) -> anyhow::Result<ResultHeader> {
        self.result_region()?
            .read(PhysAddr::new(self.layout.result_base))
            .context("failed to read result header")
    }

    pub(crate) fn read_message(&self) -> anyhow::Result<String> {
        let gpa = PhysAddr::new(self.layout.result_base + RESULT_HEADER_SIZE as u64);
        let bytes = self
            .result_region()?
            .read_c_string(gpa, self.layout.message_capacity())?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Mark the result channel as empty.
    pub(crate) fn reset_result(&self) -> anyhow::Result<()> {
        let region = self.result_region()?;
        region.write_bytes(
            PhysAddr::new(self.layout.result_base),
            bytes_of(&ResultHeader::empty()),
        )?;
        region.write_bytes(
            PhysAddr::new(self.layout.result_base + RESULT_HEADER_SIZE as u64),
            &[0],
        )?;
        Ok(())
    }

    /// Release all resources. Calling this more than once is fine.
    ///
    /// Teardown failures are logged and don't stop the remaining steps.
    pub fn destroy(&mut self) {
        if self.vm.is_none() {
            return;
        }

        if let Some(mapping) = self.run_state.take() {
            match &self.vcpu {
                Some(vcpu) => vcpu.unmap_run_state(mapping),
                None => drop(mapping),
            }
        }

        // Release in reverse allocation order.
        while let Some(region) = self.regions.pop() {
            region.release(self.vm.as_ref());
        }

        drop(self.vcpu.take());
        drop(self.vm.take());

        info!("destroyed vm instance");
    }
}

impl<H> Drop for Instance<H>
where
    H: Hypervisor,
{
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use x86_64::PhysAddr;

    use super::{GuestImage, Instance, RAM_SLOT, RESULT_SLOT};
    use crate::{
        error::Error,
        kvm::KvmCpuidEntry2,
        layout::{DEFAULT_RAM_SIZE, Layout, X86_RESET_CODE},
        memory::{MemoryFlags, page_size},
        result::{RESULT_NONE, ResultHeader},
        run::ExecState,
        sim::{SimHypervisor, SimStats},
    };

    const PAYLOAD: &[u8] = &[0xf4, 0xeb, 0xfd];

    fn create(sim: &SimHypervisor) -> Result<Instance<SimHypervisor>, Error> {
        Instance::create(
            sim,
            Layout::default(),
            &GuestImage::new(PAYLOAD),
            DEFAULT_RAM_SIZE,
        )
    }

    #[test]
    fn test_slots() {
        let sim = SimHypervisor::new();
        let instance = create(&sim).unwrap();

        assert_eq!(
            sim.stats(),
            SimStats {
                vms: 1,
                vcpus: 1,
                slots: 2,
                run_mappings: 1,
            }
        );

        let ram = sim.region(RAM_SLOT).unwrap();
        assert_eq!(ram.guest_phys_addr, PhysAddr::zero());
        assert_eq!(ram.memory_size, DEFAULT_RAM_SIZE);
        assert_eq!(instance.ram_size(), DEFAULT_RAM_SIZE);

        let result = sim.region(RESULT_SLOT).unwrap();
        let page = page_size() as u64;
        assert_eq!(
            result.guest_phys_addr.as_u64(),
            0xffff_f000 / page * page
        );
        assert_eq!(
            result.guest_phys_addr.as_u64() + result.memory_size as u64,
            0x1_0000_0000
        );
        assert_eq!(instance.state(), ExecState::Runnable);
    }

    #[test]
    fn test_image_is_loaded() {
        let sim = SimHypervisor::new();
        let _instance = create(&sim).unwrap();

        assert_eq!(sim.read_guest(0x1000, PAYLOAD.len()).unwrap(), PAYLOAD);
        assert_eq!(sim.read_guest(0xffff_fff0, 8).unwrap(), X86_RESET_CODE);

        let header = sim.read_guest(0xffff_f000, 16).unwrap();
        let header = bytemuck::pod_read_unaligned::<ResultHeader>(&header);
        assert_eq!(header.result, RESULT_NONE);
        assert_eq!(sim.read_guest(0xffff_f010, 1).unwrap(), [0]);
    }

    #[test]
    fn test_custom_reset_code() {
        let sim = SimHypervisor::new();
        let code = [0xf4; 4];
        let image = GuestImage::new(PAYLOAD).with_reset_code(&code);
        let _instance =
            Instance::create(&sim, Layout::default(), &image, DEFAULT_RAM_SIZE).unwrap();
        assert_eq!(sim.read_guest(0xffff_fff0, 4).unwrap(), code);

        let too_long = [0x90; 9];
        let image = GuestImage::new(PAYLOAD).with_reset_code(&too_long);
        let res = Instance::create(&sim, Layout::default(), &image, DEFAULT_RAM_SIZE);
        assert!(matches!(res, Err(Error::Resource(_))));
    }

    #[test]
    fn test_vcpu_starts_at_reset_vector() {
        let sim = SimHypervisor::new();
        let _instance = create(&sim).unwrap();

        let sregs = sim.sregs();
        assert_eq!(sregs.cs.base, 0xffff_0000);
        assert_eq!(sregs.cs.selector, 0xf000);
        assert_eq!(sregs.cr0, 0x6000_0010);
        let regs = sim.regs();
        assert_eq!(regs.rip, 0xfff0);
        assert_eq!(regs.rflags, 2);
    }

    #[test]
    fn test_cpuid_is_applied() {
        let sim = SimHypervisor::new();
        let leaves = vec![KvmCpuidEntry2::new(0x8000_0001, 0, [0, 0, 1, 1 << 29])];
        sim.set_supported_cpuid(leaves.clone());
        let _instance = create(&sim).unwrap();
        assert_eq!(sim.applied_cpuid(), Some(leaves));
    }

    #[test]
    fn test_missing_cpuid_support() {
        let sim = SimHypervisor::new();
        sim.set_extended_cpuid(false);
        let _instance = create(&sim).unwrap();
        assert_eq!(sim.applied_cpuid(), None);
    }

    #[test]
    fn test_cpuid_failure_is_fatal() {
        let sim = SimHypervisor::new();
        sim.fail_cpuid_query();
        assert!(matches!(create(&sim), Err(Error::Resource(_))));
        assert_eq!(sim.stats(), SimStats::default());
    }

    #[test]
    fn test_repeated_create_destroy() {
        let sim = SimHypervisor::new();
        for _ in 0..32 {
            let mut instance = create(&sim).unwrap();
            instance.destroy();
            assert_eq!(sim.stats(), SimStats::default());
            // Destroying twice is fine.
            instance.destroy();
            drop(instance);
            assert_eq!(sim.stats(), SimStats::default());
        }
    }

    #[test]
    fn test_result_slot_failure_rolls_back() {
        let sim = SimHypervisor::new();
        sim.fail_slot_registration(RESULT_SLOT);
        let res = create(&sim);
        assert!(matches!(res, Err(Error::Resource(_))));
        assert_eq!(sim.stats(), SimStats::default());
        assert!(sim.region(RAM_SLOT).is_none());
    }

    #[test]
    fn test_low_host_memory() {
        let sim = SimHypervisor::new();
        sim.set_free_memory(DEFAULT_RAM_SIZE as u64 - 1);
        let res = create(&sim);
        assert!(matches!(res, Err(Error::Environment(_))));
        assert_eq!(sim.stats().vms, 0);
    }

    #[test]
    fn test_small_ram_grows() {
        let sim = SimHypervisor::new();
        let instance =
            Instance::create(&sim, Layout::default(), &GuestImage::new(PAYLOAD), 0x1000).unwrap();
        assert_eq!(instance.ram_size(), 11 * 1024 * 1024);
    }

    #[test]
    fn test_extra_slots() {
        let sim = SimHypervisor::new();
        let mut instance = create(&sim).unwrap();

        let region = instance
            .alloc_memory(2, PhysAddr::new(0x8000_0123), 100, MemoryFlags::empty())
            .unwrap();
        assert_eq!(region.base().as_u64(), 0x8000_0123);
        assert_eq!(sim.stats().slots, 3);

        let res = instance.alloc_memory(2, PhysAddr::new(0x9000_0000), 100, MemoryFlags::empty());
        assert!(matches!(res, Err(Error::Resource(_))));

        instance.destroy();
        assert_eq!(sim.stats(), SimStats::default());
    }

    #[test]
    fn test_guest_pointers() {
        let sim = SimHypervisor::new();
        let instance = create(&sim).unwrap();

        instance
            .ram()
            .unwrap()
            .write_bytes(PhysAddr::new(0x2000), b"guest.c\0")
            .unwrap();
        assert_eq!(instance.guest_file_name(0x2000), "guest.c");
        assert_eq!(instance.guest_file_name(0x8000_0000), "<unknown>");
        assert_eq!(instance.guest_file_name(u64::MAX), "<unknown>");

        assert!(instance.guest_ptr(0x1000, PAYLOAD.len()).is_some());
        assert!(instance.guest_ptr(DEFAULT_RAM_SIZE as u64 - 1, 2).is_none());
        assert!(instance.guest_ptr(0xffff_fff0, 8).is_some());
    }
}

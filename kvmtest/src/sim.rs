//! An in-process hypervisor that runs scripted guests.
//!
//! Guests are sequences of [`GuestStep`]s. Each step either touches guest
//! memory or produces a VM exit that is written into the run state mapping
//! exactly like KVM would. Resource counters make it possible to check that
//! everything acquired through the hypervisor traits is released again.

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashSet, VecDeque},
    ffi::c_void,
    mem::{offset_of, size_of},
    ptr::{NonNull, copy_nonoverlapping},
    rc::Rc,
};

use anyhow::{Context, Result, bail, ensure};
use bytemuck::{Zeroable, bytes_of};
use tracing::debug;

use crate::{
    hypervisor::{CpuidQuery, Hypervisor, UserMemoryRegion, VirtualCpu, VirtualMachine},
    kvm::{
        KVM_EXIT_HLT, KVM_EXIT_IO, KVM_EXIT_IO_IN, KVM_EXIT_IO_OUT, KVM_EXIT_MMIO,
        KVM_EXIT_SHUTDOWN, KvmCpuidEntry2, KvmExitIo, KvmExitMmio, KvmRegs, KvmRun, KvmSegment,
        KvmSregs,
    },
    layout::Layout,
    memory::{Mapping, page_size},
    result::{RESULT_EXIT, RESULT_HEADER_SIZE, ResultHeader},
};

/// Power-on value of CR0.
const RESET_CR0: u64 = 0x6000_0010;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestStep {
    /// Write to guest physical memory. Doesn't exit.
    Write { gpa: u64, bytes: Vec<u8> },
    Halt,
    /// Triple fault.
    Shutdown,
    Out { port: u16, data: Vec<u8> },
    In { port: u16, len: u8 },
    MmioRead { addr: u64, len: u8 },
    MmioWrite { addr: u64, data: Vec<u8> },
    /// Exit with an arbitrary exit reason and zeroed exit data.
    Exit(u32),
    /// Loop forever. Only a signal gets the vCPU out of `run`.
    Spin,
}

/// Builds guest scripts that talk the result channel protocol.
#[derive(Debug, Clone)]
pub struct Script {
    layout: Layout,
    steps: Vec<GuestStep>,
}

impl Script {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: GuestStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn write(self, gpa: u64, bytes: &[u8]) -> Self {
        self.step(GuestStep::Write {
            gpa,
            bytes: bytes.to_vec(),
        })
    }

    /// Place a NUL-terminated string in guest memory.
    pub fn write_str(self, gpa: u64, s: &str) -> Self {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.step(GuestStep::Write { gpa, bytes })
    }

    /// Fill in the result channel without halting.
    pub fn set_result(self, result: i32, file_addr: u64, lineno: i32, message: &str) -> Self {
        let header = ResultHeader {
            result,
            lineno,
            file_addr,
        };
        let result_base = self.layout.result_base;
        self.write(result_base, bytes_of(&header))
            .write_str(result_base + RESULT_HEADER_SIZE as u64, message)
    }

    /// Fill in the result channel and halt.
    pub fn report(self, result: i32, file_addr: u64, lineno: i32, message: &str) -> Self {
        self.set_result(result, file_addr, lineno, message)
            .step(GuestStep::Halt)
    }

    pub fn exit(self) -> Self {
        let result_base = self.layout.result_base;
        self.write(result_base, &RESULT_EXIT.to_ne_bytes())
            .step(GuestStep::Halt)
    }

    pub fn console(self, text: &str) -> Self {
        let port = self.layout.console_port;
        self.step(GuestStep::Out {
            port,
            data: text.as_bytes().to_vec(),
        })
    }

    pub fn halt(self) -> Self {
        self.step(GuestStep::Halt)
    }

    pub fn spin(self) -> Self {
        self.step(GuestStep::Spin)
    }

    pub fn into_steps(self) -> Vec<GuestStep> {
        self.steps
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimStats {
    pub vms: usize,
    pub vcpus: usize,
    pub slots: usize,
    pub run_mappings: usize,
}

struct SimState {
    stats: SimStats,
    next_vm_id: u64,
    regions: BTreeMap<(u64, u32), UserMemoryRegion>,
    failing_slots: HashSet<u32>,
    free_memory: u64,
    extended_cpuid: bool,
    supported_cpuid: Vec<KvmCpuidEntry2>,
    cpuid_queries: Vec<usize>,
    fail_cpuid_query: bool,
    applied_cpuid: Option<Vec<KvmCpuidEntry2>>,
    regs: KvmRegs,
    sregs: KvmSregs,
    script: VecDeque<GuestStep>,
    runs: usize,
    /// Data area of the last read exit, checked on the next entry.
    pending_read: Option<(usize, usize)>,
    reads: Vec<Vec<u8>>,
}

impl SimState {
    fn reset_vcpu_state(&mut self) {
        self.regs = KvmRegs {
            rip: 0xfff0,
            rflags: 2,
            ..KvmRegs::zeroed()
        };
        self.sregs = KvmSregs {
            cs: KvmSegment::RESET_CODE,
            cr0: RESET_CR0,
            ..KvmSregs::zeroed()
        };
    }
}

/// The simulated system handle. Clones share the same state.
#[derive(Clone)]
pub struct SimHypervisor {
    state: Rc<RefCell<SimState>>,
}

impl SimHypervisor {
    pub fn new() -> Self {
        let mut state = SimState {
            stats: SimStats::default(),
            next_vm_id: 0,
            regions: BTreeMap::new(),
            failing_slots: HashSet::new(),
            free_memory: u64::MAX,
            extended_cpuid: true,
            supported_cpuid: vec![
                KvmCpuidEntry2::new(0, 0, [1, 0x756e_6547, 0x6c65_746e, 0x4965_6e69]),
                KvmCpuidEntry2::new(1, 0, [0x000a_06a0, 0, 0, 0x0781_abfd]),
            ],
            cpuid_queries: Vec::new(),
            fail_cpuid_query: false,
            applied_cpuid: None,
            regs: KvmRegs::zeroed(),
            sregs: KvmSregs::zeroed(),
            script: VecDeque::new(),
            runs: 0,
            pending_read: None,
            reads: Vec::new(),
        };
        state.reset_vcpu_state();
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn with_script(script: Script) -> Self {
        let sim = Self::new();
        sim.load_script(script);
        sim
    }

    pub fn load_script(&self, script: Script) {
        self.state.borrow_mut().script = script.into_steps().into();
    }

    pub fn stats(&self) -> SimStats {
        self.state.borrow().stats
    }

    /// The slot currently registered under `slot` in any VM.
    pub fn region(&self, slot: u32) -> Option<UserMemoryRegion> {
        self.state
            .borrow()
            .regions
            .iter()
            .find(|((_, id), _)| *id == slot)
            .map(|(_, region)| *region)
    }

    /// Make registering `slot` fail.
    pub fn fail_slot_registration(&self, slot: u32) {
        self.state.borrow_mut().failing_slots.insert(slot);
    }

    pub fn set_free_memory(&self, bytes: u64) {
        self.state.borrow_mut().free_memory = bytes;
    }

    pub fn set_extended_cpuid(&self, supported: bool) {
        self.state.borrow_mut().extended_cpuid = supported;
    }

    pub fn set_supported_cpuid(&self, entries: Vec<KvmCpuidEntry2>) {
        self.state.borrow_mut().supported_cpuid = entries;
    }

    /// Buffer sizes of all supported-CPUID queries so far.
    pub fn cpuid_queries(&self) -> Vec<usize> {
        self.state.borrow().cpuid_queries.clone()
    }

    pub fn fail_cpuid_query(&self) {
        self.state.borrow_mut().fail_cpuid_query = true;
    }

    /// The leaves last applied to a vCPU.
    pub fn applied_cpuid(&self) -> Option<Vec<KvmCpuidEntry2>> {
        self.state.borrow().applied_cpuid.clone()
    }

    pub fn regs(&self) -> KvmRegs {
        self.state.borrow().regs
    }

    pub fn sregs(&self) -> KvmSregs {
        self.state.borrow().sregs
    }

    /// Number of times a vCPU was entered.
    pub fn runs(&self) -> usize {
        self.state.borrow().runs
    }

    /// What the host handed the guest for each port or MMIO read.
    pub fn reads(&self) -> Vec<Vec<u8>> {
        self.state.borrow().reads.clone()
    }

    /// Read guest physical memory through the registered slots.
    pub fn read_guest(&self, gpa: u64, len: usize) -> Result<Vec<u8>> {
        let host = self.translate(gpa, len)?;
        let mut bytes = vec![0; len];
        unsafe {
            copy_nonoverlapping(host.as_ptr(), bytes.as_mut_ptr(), len);
        }
        Ok(bytes)
    }

    fn write_guest(&self, gpa: u64, bytes: &[u8]) -> Result<()> {
        let host = self.translate(gpa, bytes.len())?;
        unsafe {
            copy_nonoverlapping(bytes.as_ptr(), host.as_ptr(), bytes.len());
        }
        Ok(())
    }

    fn translate(&self, gpa: u64, len: usize) -> Result<NonNull<u8>> {
        let state = self.state.borrow();
        let region = state
            .regions
            .values()
            .find(|region| {
                let start = region.guest_phys_addr.as_u64();
                let end = start + region.memory_size as u64;
                start <= gpa && gpa.saturating_add(len as u64) <= end
            })
            .with_context(|| format!("guest access at {gpa:#x} isn't backed by a slot"))?;
        let offset = gpa - region.guest_phys_addr.as_u64();
        let host = region.userspace_addr + offset as usize;
        NonNull::new(host as *mut u8).context("null host address")
    }
}

impl Default for SimHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Hypervisor for SimHypervisor {
    type Vm = SimVm;

    fn vcpu_mmap_size(&self) -> Result<usize> {
        Ok(size_of::<KvmRun>())
    }

    fn create_vm(&self) -> Result<SimVm> {
        let mut state = self.state.borrow_mut();
        let id = state.next_vm_id;
        state.next_vm_id += 1;
        state.stats.vms += 1;
        debug!(id, "creating simulated vm");
        Ok(SimVm {
            id,
            sim: self.clone(),
        })
    }

    fn has_extended_cpuid(&self) -> Result<bool> {
        Ok(self.state.borrow().extended_cpuid)
    }

    fn query_supported_cpuid(&self, max_entries: usize) -> Result<CpuidQuery> {
        let mut state = self.state.borrow_mut();
        state.cpuid_queries.push(max_entries);
        if state.fail_cpuid_query {
            bail!("failed to query supported cpuid features: EIO");
        }
        if state.supported_cpuid.len() > max_entries {
            return Ok(CpuidQuery::TooSmall);
        }
        Ok(CpuidQuery::Entries(state.supported_cpuid.clone()))
    }

    fn host_free_memory(&self) -> Result<u64> {
        Ok(self.state.borrow().free_memory)
    }
}

pub struct SimVm {
    id: u64,
    sim: SimHypervisor,
}

impl VirtualMachine for SimVm {
    type Vcpu = SimVcpu;

    fn create_vcpu(&self, id: u32) -> Result<SimVcpu> {
        let mut state = self.sim.state.borrow_mut();
        state.stats.vcpus += 1;
        state.reset_vcpu_state();
        debug!(vm = self.id, id, "creating simulated vcpu");
        Ok(SimVcpu {
            sim: self.sim.clone(),
            run_state: Cell::new(None),
        })
    }

    unsafe fn set_user_memory_region(&self, region: &UserMemoryRegion) -> Result<()> {
        let mut state = self.sim.state.borrow_mut();
        let key = (self.id, region.slot);

        if region.memory_size == 0 {
            if state.regions.remove(&key).is_some() {
                state.stats.slots -= 1;
            }
            return Ok(());
        }

        ensure!(
            !state.failing_slots.contains(&region.slot),
            "failed to set memory region: EFAULT"
        );
        ensure!(
            !state.regions.contains_key(&key),
            "failed to set memory region: slot {} is in use",
            region.slot
        );
        let page_size = page_size();
        ensure!(
            region.guest_phys_addr.as_u64() % page_size as u64 == 0
                && region.memory_size % page_size == 0
                && region.userspace_addr % page_size == 0,
            "failed to set memory region: EINVAL"
        );

        let start = region.guest_phys_addr.as_u64();
        let end = start + region.memory_size as u64;
        let overlaps = state
            .regions
            .iter()
            .filter(|((vm, _), _)| *vm == self.id)
            .any(|(_, other)| {
                let other_start = other.guest_phys_addr.as_u64();
                let other_end = other_start + other.memory_size as u64;
                start < other_end && other_start < end
            });
        ensure!(!overlaps, "failed to set memory region: EEXIST");

        state.regions.insert(key, *region);
        state.stats.slots += 1;
        Ok(())
    }
}

impl Drop for SimVm {
    fn drop(&mut self) {
        let mut state = self.sim.state.borrow_mut();
        // KVM drops all slots together with the VM.
        let before = state.regions.len();
        state.regions.retain(|(vm, _), _| *vm != self.id);
        let removed = before - state.regions.len();
        state.stats.slots -= removed;
        state.stats.vms -= 1;
    }
}

pub struct SimVcpu {
    sim: SimHypervisor,
    run_state: Cell<Option<(NonNull<c_void>, usize)>>,
}

impl SimVcpu {
    fn write_run(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let (ptr, len) = self.run_state.get().context("run state isn't mapped")?;
        ensure!(offset + bytes.len() <= len, "write exceeds the run state");
        unsafe {
            copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>().as_ptr().add(offset), bytes.len());
        }
        Ok(())
    }

    fn read_run(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let (ptr, mapped) = self.run_state.get().context("run state isn't mapped")?;
        ensure!(offset + len <= mapped, "read exceeds the run state");
        let mut bytes = vec![0; len];
        unsafe {
            copy_nonoverlapping(ptr.cast::<u8>().as_ptr().add(offset), bytes.as_mut_ptr(), len);
        }
        Ok(bytes)
    }

    fn set_exit(&self, exit_reason: u32, exit_data: &[u8]) -> Result<()> {
        self.write_run(offset_of!(KvmRun, exit_reason), &exit_reason.to_ne_bytes())?;
        self.write_run(offset_of!(KvmRun, exit_data), &[0; 256])?;
        self.write_run(offset_of!(KvmRun, exit_data), exit_data)
    }

    /// Give the host something to overwrite, so that tests can tell whether
    /// it did.
    fn expect_read(&self, offset: usize, len: usize) -> Result<()> {
        self.write_run(offset, &vec![0xff; len])?;
        self.sim.state.borrow_mut().pending_read = Some((offset, len));
        Ok(())
    }
}

impl VirtualCpu for SimVcpu {
    fn set_cpuid(&self, entries: &[KvmCpuidEntry2]) -> Result<()> {
        self.sim.state.borrow_mut().applied_cpuid = Some(entries.to_vec());
        Ok(())
    }

    fn get_regs(&self) -> Result<KvmRegs> {
        Ok(self.sim.state.borrow().regs)
    }

    fn set_regs(&self, regs: KvmRegs) -> Result<()> {
        self.sim.state.borrow_mut().regs = regs;
        Ok(())
    }

    fn get_sregs(&self) -> Result<KvmSregs> {
        Ok(self.sim.state.borrow().sregs)
    }

    fn set_sregs(&self, sregs: KvmSregs) -> Result<()> {
        self.sim.state.borrow_mut().sregs = sregs;
        Ok(())
    }

    fn map_run_state(&self, len: usize) -> Result<Mapping> {
        ensure!(
            self.run_state.get().is_none(),
            "run state is already mapped"
        );
        let mapping = Mapping::anonymous(len)?;
        self.run_state.set(Some((mapping.as_ptr(), len)));
        self.sim.state.borrow_mut().stats.run_mappings += 1;
        Ok(mapping)
    }

    fn unmap_run_state(&self, mapping: Mapping) {
        if self.run_state.take().is_some() {
            self.sim.state.borrow_mut().stats.run_mappings -= 1;
        }
        drop(mapping);
    }

    fn run(&self) -> Result<bool> {
        let pending = {
            let mut state = self.sim.state.borrow_mut();
            state.runs += 1;
            state.pending_read.take()
        };
        if let Some((offset, len)) = pending {
            let bytes = self.read_run(offset, len)?;
            self.sim.state.borrow_mut().reads.push(bytes);
        }

        loop {
            let step = {
                let mut state = self.sim.state.borrow_mut();
                match state.script.front() {
                    Some(GuestStep::Spin) => GuestStep::Spin,
                    _ => state.script.pop_front().unwrap_or(GuestStep::Shutdown),
                }
            };

            match step {
                GuestStep::Write { gpa, bytes } => self.sim.write_guest(gpa, &bytes)?,
                GuestStep::Halt => {
                    self.set_exit(KVM_EXIT_HLT, &[])?;
                    return Ok(true);
                }
                GuestStep::Shutdown => {
                    self.set_exit(KVM_EXIT_SHUTDOWN, &[])?;
                    return Ok(true);
                }
                GuestStep::Out { port, data } => {
                    let io = KvmExitIo {
                        direction: KVM_EXIT_IO_OUT,
                        size: 1,
                        port,
                        count: u32::try_from(data.len())?,
                        data_offset: KvmRun::IO_DATA_OFFSET as u64,
                    };
                    self.write_run(KvmRun::IO_DATA_OFFSET, &data)?;
                    self.set_exit(KVM_EXIT_IO, bytes_of(&io))?;
                    return Ok(true);
                }
                GuestStep::In { port, len } => {
                    let io = KvmExitIo {
                        direction: KVM_EXIT_IO_IN,
                        size: len,
                        port,
                        count: 1,
                        data_offset: KvmRun::IO_DATA_OFFSET as u64,
                    };
                    self.expect_read(KvmRun::IO_DATA_OFFSET, usize::from(len))?;
                    self.set_exit(KVM_EXIT_IO, bytes_of(&io))?;
                    return Ok(true);
                }
                GuestStep::MmioRead { addr, len } => {
                    let mmio = KvmExitMmio {
                        phys_addr: addr,
                        data: [0xff; 8],
                        len: u32::from(len),
                        is_write: 0,
                    };
                    self.set_exit(KVM_EXIT_MMIO, bytes_of(&mmio))?;
                    let offset = offset_of!(KvmRun, exit_data) + offset_of!(KvmExitMmio, data);
                    self.sim.state.borrow_mut().pending_read = Some((offset, usize::from(len)));
                    return Ok(true);
                }
                GuestStep::MmioWrite { addr, data } => {
                    let mut bytes = [0; 8];
                    let len = data.len().min(8);
                    bytes[..len].copy_from_slice(&data[..len]);
                    let mmio = KvmExitMmio {
                        phys_addr: addr,
                        data: bytes,
                        len: u32::try_from(len)?,
                        is_write: 1,
                    };
                    self.set_exit(KVM_EXIT_MMIO, bytes_of(&mmio))?;
                    return Ok(true);
                }
                GuestStep::Exit(exit_reason) => {
                    self.set_exit(exit_reason, &[])?;
                    return Ok(true);
                }
                GuestStep::Spin => {
                    // Returns once a signal has been handled.
                    nix::unistd::pause();
                    return Ok(false);
                }
            }
        }
    }
}

impl Drop for SimVcpu {
    fn drop(&mut self) {
        let mut state = self.sim.state.borrow_mut();
        state.stats.vcpus -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::{GuestStep, Script, SimHypervisor, SimStats};
    use crate::{
        hypervisor::{Hypervisor, UserMemoryRegion, VirtualCpu, VirtualMachine},
        kvm::{KVM_EXIT_HLT, KvmRun},
        layout::Layout,
        memory::{Mapping, MemoryFlags, page_size},
    };

    #[test]
    fn test_counters_follow_handles() {
        let sim = SimHypervisor::new();
        let vm = sim.create_vm().unwrap();
        let vcpu = vm.create_vcpu(0).unwrap();
        let run = vcpu.map_run_state(size_of::<KvmRun>()).unwrap();
        assert_eq!(
            sim.stats(),
            SimStats {
                vms: 1,
                vcpus: 1,
                slots: 0,
                run_mappings: 1,
            }
        );
        vcpu.unmap_run_state(run);
        drop(vcpu);
        drop(vm);
        assert_eq!(sim.stats(), SimStats::default());
    }

    #[test]
    fn test_dropping_the_vm_removes_its_slots() {
        let sim = SimHypervisor::new();
        let vm = sim.create_vm().unwrap();
        let memory = Mapping::anonymous(page_size()).unwrap();
        let region = UserMemoryRegion {
            slot: 0,
            flags: MemoryFlags::empty(),
            guest_phys_addr: x86_64::PhysAddr::new(0),
            memory_size: page_size(),
            userspace_addr: memory.as_ptr().as_ptr() as usize,
        };
        unsafe { vm.set_user_memory_region(&region) }.unwrap();
        assert_eq!(sim.stats().slots, 1);
        drop(vm);
        assert_eq!(sim.stats().slots, 0);
    }

    #[test]
    fn test_script_writes_guest_memory() {
        let layout = Layout::default();
        let sim = SimHypervisor::with_script(Script::new(layout).write(0x10, b"abc").halt());
        let vm = sim.create_vm().unwrap();
        let memory = Mapping::anonymous(page_size()).unwrap();
        let region = UserMemoryRegion {
            slot: 0,
            flags: MemoryFlags::empty(),
            guest_phys_addr: x86_64::PhysAddr::new(0),
            memory_size: page_size(),
            userspace_addr: memory.as_ptr().as_ptr() as usize,
        };
        unsafe { vm.set_user_memory_region(&region) }.unwrap();
        let vcpu = vm.create_vcpu(0).unwrap();
        let run = vcpu.map_run_state(size_of::<KvmRun>()).unwrap();

        assert!(vcpu.run().unwrap());
        assert_eq!(sim.read_guest(0x10, 3).unwrap(), b"abc");
        let exit_reason = run.ptr::<u32>(8).unwrap().read();
        assert_eq!(exit_reason, KVM_EXIT_HLT);
        vcpu.unmap_run_state(run);
    }

    #[test]
    fn test_report_helper() {
        let layout = Layout::default();
        let steps = Script::new(layout).report(0, 0x2000, 7, "ok").into_steps();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[2], GuestStep::Halt);
        let GuestStep::Write { gpa, bytes } = &steps[1] else {
            panic!("expected a write");
        };
        assert_eq!(*gpa, layout.result_base + 16);
        assert_eq!(bytes, b"ok\0");
    }
}

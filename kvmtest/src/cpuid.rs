use anyhow::{Result, bail};
use tracing::debug;

use crate::{
    hypervisor::{CpuidQuery, Hypervisor},
    kvm::KvmCpuidEntry2,
};

const INITIAL_ENTRIES: usize = 8;
/// KVM itself never returns more than 256 entries.
const MAX_ENTRIES: usize = 1024;

/// The CPUID leaves a guest gets to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuidDescriptor {
    entries: Box<[KvmCpuidEntry2]>,
}

impl CpuidDescriptor {
    pub fn new(entries: impl Into<Box<[KvmCpuidEntry2]>>) -> Self {
        Self {
            entries: entries.into(),
        }
    }

    pub fn entries(&self) -> &[KvmCpuidEntry2] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, function: u32, index: u32) -> Option<&KvmCpuidEntry2> {
        self.entries
            .iter()
            .find(|entry| entry.function == function && entry.index == index)
    }
}

/// Find the CPUID leaves supported by the hypervisor.
///
/// Returns `None` if the hypervisor can't report them. The vCPU then keeps
/// the hypervisor's default leaves, which isn't enough for guests that switch
/// to 64-bit mode.
pub fn supported_cpuid(hypervisor: &impl Hypervisor) -> Result<Option<CpuidDescriptor>> {
    if !hypervisor.has_extended_cpuid()? {
        debug!("hypervisor can't report supported cpuid leaves");
        return Ok(None);
    }

    let mut max_entries = INITIAL_ENTRIES;
    while max_entries <= MAX_ENTRIES {
        match hypervisor.query_supported_cpuid(max_entries)? {
            CpuidQuery::Entries(entries) => {
                debug!(entries = entries.len(), "found supported cpuid leaves");
                return Ok(Some(CpuidDescriptor::new(entries)));
            }
            CpuidQuery::TooSmall => max_entries *= 2,
        }
    }

    bail!("supported cpuid list doesn't fit into {MAX_ENTRIES} entries")
}

#[cfg(test)]
mod tests {
    use super::supported_cpuid;
    use crate::{kvm::KvmCpuidEntry2, sim::SimHypervisor};

    fn leaves(count: u32) -> Vec<KvmCpuidEntry2> {
        (0..count)
            .map(|function| KvmCpuidEntry2::new(function, 0, [function, 0, 0, 0]))
            .collect()
    }

    #[test]
    fn test_unsupported_is_not_an_error() {
        let sim = SimHypervisor::new();
        sim.set_extended_cpuid(false);
        assert_eq!(supported_cpuid(&sim).unwrap(), None);
        assert!(sim.cpuid_queries().is_empty());
    }

    #[test]
    fn test_buffer_grows_until_everything_fits() {
        let sim = SimHypervisor::new();
        sim.set_supported_cpuid(leaves(50));

        let descriptor = supported_cpuid(&sim).unwrap().unwrap();
        assert_eq!(descriptor.len(), 50);
        assert_eq!(descriptor.find(42, 0).unwrap().eax, 42);
        assert!(descriptor.find(42, 1).is_none());
        assert_eq!(sim.cpuid_queries(), [8, 16, 32, 64]);
    }

    #[test]
    fn test_small_list_fits_first_try() {
        let sim = SimHypervisor::new();
        sim.set_supported_cpuid(leaves(3));
        let descriptor = supported_cpuid(&sim).unwrap().unwrap();
        assert_eq!(descriptor.entries(), &leaves(3)[..]);
        assert_eq!(sim.cpuid_queries(), [8]);
    }

    #[test]
    fn test_largest_buffer_is_tried() {
        let sim = SimHypervisor::new();
        sim.set_supported_cpuid(leaves(1024));
        let descriptor = supported_cpuid(&sim).unwrap().unwrap();
        assert_eq!(descriptor.len(), 1024);
        assert_eq!(sim.cpuid_queries().last(), Some(&1024));
    }

    #[test]
    fn test_growth_is_bounded() {
        let sim = SimHypervisor::new();
        sim.set_supported_cpuid(leaves(2000));
        let err = supported_cpuid(&sim).unwrap_err();
        assert!(err.to_string().contains("1024 entries"));
        assert_eq!(
            sim.cpuid_queries(),
            [8, 16, 32, 64, 128, 256, 512, 1024]
        );
    }

    #[test]
    fn test_other_failures_are_fatal() {
        let sim = SimHypervisor::new();
        sim.fail_cpuid_query();
        assert!(supported_cpuid(&sim).is_err());
    }
}

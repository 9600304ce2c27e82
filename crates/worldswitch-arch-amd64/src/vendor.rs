/// CPU vendor, as identified by the CPUID leaf-0 vendor string.
///
/// Vendor decides which hardware-virtualization flavor the switch driver
/// manages; everything downstream dispatches on this value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    /// GenuineIntel.
    Intel,

    /// AuthenticAMD.
    Amd,

    /// HygonGenuine (Dhyana; SVM-compatible).
    Hygon,

    /// Anything else.
    #[default]
    Unknown,
}

impl CpuVendor {
    /// Identifies the vendor from the CPUID leaf-0 EBX/EDX/ECX registers.
    pub fn from_cpuid(ebx: u32, ecx: u32, edx: u32) -> CpuVendor {
        let mut vendor = [0u8; 12];
        vendor[0..4].copy_from_slice(&ebx.to_le_bytes());
        vendor[4..8].copy_from_slice(&edx.to_le_bytes());
        vendor[8..12].copy_from_slice(&ecx.to_le_bytes());

        match &vendor {
            b"GenuineIntel" => CpuVendor::Intel,
            b"AuthenticAMD" => CpuVendor::Amd,
            b"HygonGenuine" => CpuVendor::Hygon,
            _ => CpuVendor::Unknown,
        }
    }

    /// Checks if this vendor implements VMX.
    pub fn uses_vmx(self) -> bool {
        matches!(self, CpuVendor::Intel)
    }

    /// Checks if this vendor implements SVM.
    pub fn uses_svm(self) -> bool {
        matches!(self, CpuVendor::Amd | CpuVendor::Hygon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_strings() {
        // "GenuineIntel" split as CPUID returns it: EBX="Genu", EDX="ineI",
        // ECX="ntel".
        let intel = CpuVendor::from_cpuid(
            u32::from_le_bytes(*b"Genu"),
            u32::from_le_bytes(*b"ntel"),
            u32::from_le_bytes(*b"ineI"),
        );
        assert_eq!(intel, CpuVendor::Intel);
        assert!(intel.uses_vmx());

        let amd = CpuVendor::from_cpuid(
            u32::from_le_bytes(*b"Auth"),
            u32::from_le_bytes(*b"cAMD"),
            u32::from_le_bytes(*b"enti"),
        );
        assert_eq!(amd, CpuVendor::Amd);
        assert!(amd.uses_svm());

        assert_eq!(CpuVendor::from_cpuid(0, 0, 0), CpuVendor::Unknown);
    }
}

//! Device scoring
//!
//! Picks the device with the highest estimated compute throughput:
//! cores per multiprocessor × multiprocessor count × clock rate.

/// Compute mode reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComputeMode {
    #[default]
    Default,
    Exclusive,
    /// No contexts may be created on the device
    Prohibited,
    ExclusiveProcess,
}

impl ComputeMode {
    /// Map the driver's numeric compute mode
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => ComputeMode::Exclusive,
            2 => ComputeMode::Prohibited,
            3 => ComputeMode::ExclusiveProcess,
            _ => ComputeMode::Default,
        }
    }
}

/// Properties used to rank devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    pub ordinal: usize,
    pub name: String,
    pub compute_mode: ComputeMode,
    /// Compute capability
    pub major: u32,
    pub minor: u32,
    pub multiprocessor_count: u32,
    pub clock_rate_khz: u32,
}

/// Cores per multiprocessor, keyed by SM version `0xMm`
const SM_CORES: &[(u32, u32)] = &[
    (0x30, 192),
    (0x32, 192),
    (0x35, 192),
    (0x37, 192),
    (0x50, 128),
    (0x52, 128),
    (0x53, 128),
    (0x60, 64),
    (0x61, 128),
    (0x62, 128),
    (0x70, 64),
    (0x72, 64),
    (0x75, 64),
    (0x80, 64),
    (0x86, 128),
    (0x87, 128),
    (0x89, 128),
    (0x90, 128),
];

/// Compute capability reported by emulation devices
const EMULATION_VERSION: u32 = 9999;

/// Cores per multiprocessor for a compute capability
///
/// Versions missing from the table are assumed to be newer than its last
/// entry and use that entry's count.
pub fn cores_per_multiprocessor(major: u32, minor: u32) -> u32 {
    if major == EMULATION_VERSION && minor == EMULATION_VERSION {
        return 1;
    }

    let sm = (major << 4) + minor;
    SM_CORES
        .iter()
        .find(|(version, _)| *version == sm)
        .or_else(|| SM_CORES.last())
        .map_or(1, |(_, cores)| *cores)
}

impl DeviceProperties {
    pub fn new(ordinal: usize, major: u32, minor: u32, multiprocessor_count: u32, clock_rate_khz: u32) -> Self {
        Self {
            ordinal,
            name: format!("Device {}", ordinal),
            compute_mode: ComputeMode::Default,
            major,
            minor,
            multiprocessor_count,
            clock_rate_khz,
        }
    }

    pub fn with_compute_mode(mut self, mode: ComputeMode) -> Self {
        self.compute_mode = mode;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Estimated throughput score
    pub fn estimated_throughput(&self) -> u64 {
        u64::from(self.multiprocessor_count)
            * u64::from(cores_per_multiprocessor(self.major, self.minor))
            * u64::from(self.clock_rate_khz)
    }
}

/// Ordinal of the fastest device that allows contexts
///
/// Ties keep the earlier device; a device scoring zero is never picked.
pub fn select_fastest_device(devices: &[DeviceProperties]) -> Option<usize> {
    let mut best: Option<(u64, usize)> = None;
    let mut prohibited = 0;

    for device in devices {
        if device.compute_mode == ComputeMode::Prohibited {
            prohibited += 1;
            continue;
        }

        let score = device.estimated_throughput();
        if score > best.map_or(0, |(s, _)| s) {
            best = Some((score, device.ordinal));
        }
    }

    if prohibited > 0 {
        log::debug!("{} device(s) skipped: compute mode prohibited", prohibited);
    }

    best.map(|(score, ordinal)| {
        log::debug!("Selected device {} (score {})", ordinal, score);
        ordinal
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(3, 0, 192)]
    #[case(5, 2, 128)]
    #[case(6, 0, 64)]
    #[case(6, 1, 128)]
    #[case(7, 5, 64)]
    #[case(8, 6, 128)]
    #[case(12, 0, 128)]
    #[case(9999, 9999, 1)]
    fn test_cores_per_multiprocessor(#[case] major: u32, #[case] minor: u32, #[case] cores: u32) {
        assert_eq!(cores_per_multiprocessor(major, minor), cores);
    }

    #[test]
    fn test_select_fastest() {
        let devices = vec![
            DeviceProperties::new(0, 6, 1, 10, 1_500_000),
            DeviceProperties::new(1, 7, 5, 40, 1_590_000),
            DeviceProperties::new(2, 5, 2, 16, 1_100_000),
        ];
        assert_eq!(select_fastest_device(&devices), Some(1));
    }

    #[test]
    fn test_skips_prohibited() {
        let devices = vec![
            DeviceProperties::new(0, 7, 5, 40, 1_590_000).with_compute_mode(ComputeMode::Prohibited),
            DeviceProperties::new(1, 6, 1, 10, 1_500_000),
        ];
        assert_eq!(select_fastest_device(&devices), Some(1));
    }

    #[test]
    fn test_ties_keep_first() {
        let devices = vec![
            DeviceProperties::new(0, 7, 5, 40, 1_000_000),
            DeviceProperties::new(1, 7, 5, 40, 1_000_000),
        ];
        assert_eq!(select_fastest_device(&devices), Some(0));
    }

    #[test]
    fn test_no_eligible_device() {
        assert_eq!(select_fastest_device(&[]), None);

        let all_prohibited =
            vec![DeviceProperties::new(0, 7, 5, 40, 1_590_000).with_compute_mode(ComputeMode::Prohibited)];
        assert_eq!(select_fastest_device(&all_prohibited), None);

        let zero_score = vec![DeviceProperties::new(0, 7, 5, 0, 1_590_000)];
        assert_eq!(select_fastest_device(&zero_score), None);
    }

    #[test]
    fn test_compute_mode_from_raw() {
        assert_eq!(ComputeMode::from_raw(0), ComputeMode::Default);
        assert_eq!(ComputeMode::from_raw(2), ComputeMode::Prohibited);
    }
}

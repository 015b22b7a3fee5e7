//! Boot configuration parsed from a command-line style string.
//!
//! ```text
//! ncpus=4 klog=debug hz=100 slz.spins=128 caps=on max_sysmsg=16
//! ```

use lwkt_abi::MAX_CPUS;

use crate::klog::KlogLevel;

const DEFAULT_NCPUS: usize = 2;
const DEFAULT_KLOG: KlogLevel = KlogLevel::Info;
const DEFAULT_HZ: u32 = 0;
const DEFAULT_PREEMPT: bool = true;
const DEFAULT_SLZ_SPINS: u32 = 64;
const DEFAULT_CAPS: bool = true;
const DEFAULT_MAX_SYSMSG: usize = 32;
const DEFAULT_IPIQ_DEPTH: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootConfig {
    pub ncpus: usize,
    pub klog: KlogLevel,
    /// Preemption tick rate. Zero disables the tick source.
    pub hz: u32,
    /// Honor reschedule requests at safe points.
    pub preempt: bool,
    /// Spin budget for adaptive serializer entry before yielding.
    pub slz_spins: u32,
    pub caps: bool,
    pub max_sysmsg: usize,
    pub ipiq_depth: usize,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            ncpus: DEFAULT_NCPUS,
            klog: DEFAULT_KLOG,
            hz: DEFAULT_HZ,
            preempt: DEFAULT_PREEMPT,
            slz_spins: DEFAULT_SLZ_SPINS,
            caps: DEFAULT_CAPS,
            max_sysmsg: DEFAULT_MAX_SYSMSG,
            ipiq_depth: DEFAULT_IPIQ_DEPTH,
        }
    }
}

impl BootConfig {
    /// Default configuration with a given CPU count.
    pub fn with_cpus(ncpus: usize) -> Self {
        Self {
            ncpus: ncpus.clamp(1, MAX_CPUS),
            ..Self::default()
        }
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("on")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
        || value.eq_ignore_ascii_case("enabled")
        || value == "1"
    {
        Some(true)
    } else if value.eq_ignore_ascii_case("off")
        || value.eq_ignore_ascii_case("false")
        || value.eq_ignore_ascii_case("no")
        || value.eq_ignore_ascii_case("disabled")
        || value == "0"
    {
        Some(false)
    } else {
        None
    }
}

pub fn config_from_cmdline(cmdline: Option<&str>) -> BootConfig {
    let mut cfg = BootConfig::default();
    let Some(cmdline) = cmdline else {
        return cfg;
    };
    for token in cmdline.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        match key {
            "ncpus" => {
                if let Ok(n) = value.parse::<usize>() {
                    if (1..=MAX_CPUS).contains(&n) {
                        cfg.ncpus = n;
                    }
                }
            }
            "klog" => {
                if let Some(level) = KlogLevel::from_name(value) {
                    cfg.klog = level;
                }
            }
            "hz" => {
                if let Ok(hz) = value.parse::<u32>() {
                    cfg.hz = hz;
                }
            }
            "preempt" => {
                if let Some(on) = parse_bool(value) {
                    cfg.preempt = on;
                }
            }
            "slz.spins" => {
                if let Ok(spins) = value.parse::<u32>() {
                    cfg.slz_spins = spins;
                }
            }
            "caps" => {
                if let Some(on) = parse_bool(value) {
                    cfg.caps = on;
                }
            }
            "max_sysmsg" => {
                if let Ok(max) = value.parse::<usize>() {
                    cfg.max_sysmsg = max;
                }
            }
            "ipiq.depth" => {
                if let Ok(depth) = value.parse::<usize>() {
                    if depth > 0 {
                        cfg.ipiq_depth = depth;
                    }
                }
            }
            _ => {}
        }
    }
    cfg
}

use serde::{Deserialize, Serialize};

/// Env var that turns on latency tracing for register accesses.
pub const TRACE_LATENCY_ENV: &str = "GOLDFISH_PIPE_TRACE_LATENCY";

pub const DEFAULT_INITIAL_CAPACITY: u32 = 64;
pub const DEFAULT_MAX_CAPACITY: u32 = 65536;

/// Highest guest physical address of the low RAM region on a given machine type.
///
/// Guest buffers on the same side of the split are assumed to live in one host block, which lets
/// a multi-buffer transfer resolve the block once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RamSplit(pub u64);

impl RamSplit {
    /// RAM below 4GiB and relocated above it.
    pub const X86: RamSplit = RamSplit(0xFFFF_FFFF);
    /// RAM starts at 1GiB and is contiguous from there.
    pub const ARM: RamSplit = RamSplit(0x4000_0000);
    /// Two RAM regions around the I/O hole ending at 512MiB.
    pub const MIPS: RamSplit = RamSplit(0x2000_0000);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeDeviceConfig {
    /// Channel table size of the command-buffer protocol after reset.
    pub initial_capacity: u32,
    /// Upper bound on channel table growth, also enforced on snapshot load.
    pub max_capacity: u32,
    /// `None` resolves every transfer buffer individually.
    pub ram_split: Option<RamSplit>,
    /// Report register accesses and wake deliveries slower than one millisecond.
    pub trace_latency: bool,
}

impl Default for PipeDeviceConfig {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            max_capacity: DEFAULT_MAX_CAPACITY,
            ram_split: Some(RamSplit::X86),
            trace_latency: false,
        }
    }
}

impl PipeDeviceConfig {
    /// Default configuration with [`TRACE_LATENCY_ENV`] applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(raw) = std::env::var(TRACE_LATENCY_ENV) {
            self.trace_latency = env_value_enables(&raw);
        }
        self
    }
}

fn env_value_enables(raw: &str) -> bool {
    let v = raw.trim();
    !v.is_empty() && v != "0"
}

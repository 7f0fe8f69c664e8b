//! Hardware interface definitions for the clustered systolic array
//!
//! The accelerator is a grid of clusters, each a grid of PEs. Every PE owns
//! small scratchpads for input activations (iact), weights (wght) and partial
//! sums (psum). The host talks to it through one port per data category plus
//! a narrow DMA channel used for status words and, in serial mode, for all
//! data.

use serde::{Deserialize, Serialize};

use crate::error::{MapError, MapResult};
use crate::store::PostScale;

/// Fixed geometry and bit widths of one accelerator instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratorConfig {
    /// PE rows per cluster
    pub pe_rows: usize,
    /// PE columns per cluster
    pub pe_cols: usize,
    /// Cluster rows in the array
    pub cluster_rows: usize,
    /// Cluster columns in the array
    pub cluster_cols: usize,
    /// Weights consumed per MAC cycle
    pub parallel_macs: usize,

    pub iact_data_bits: u32,
    pub wght_data_bits: u32,
    pub psum_data_bits: u32,
    /// Width of the overflow count stored next to every iact/wght value
    pub overflow_bits: u32,
    pub iact_addr_bits: u32,
    pub wght_addr_bits: u32,

    pub iact_trans_bits: u32,
    pub wght_trans_bits: u32,
    pub psum_trans_bits: u32,

    pub iact_addr_per_pe: usize,
    pub iacts_per_pe: usize,
    pub wght_addr_per_pe: usize,
    pub wghts_per_pe: usize,
    pub psums_per_pe: usize,

    /// Routers (and GLB instances) per cluster for each port
    pub iact_routers: usize,
    pub wght_routers: usize,
    pub psum_routers: usize,

    pub iact_router_bits: u32,
    pub wght_router_bits: u32,
    pub psum_router_bits: u32,

    /// Depth of one iact GLB instance in transmission words
    pub iact_mem_words: usize,
    /// Depth of one psum GLB instance in transmission words
    pub psum_mem_words: usize,

    /// Width of the DMA / configuration word
    pub dma_bits: u32,
    /// Bit position where the weight half of a serial data word starts
    pub serial_split_bits: u32,
}

impl AcceleratorConfig {
    /// The 4x3 PE, 2x8 cluster instance used by the reference test benches
    pub fn default_openeye() -> Self {
        Self {
            pe_rows: 3,
            pe_cols: 4,
            cluster_rows: 8,
            cluster_cols: 2,
            parallel_macs: 2,
            iact_data_bits: 8,
            wght_data_bits: 8,
            psum_data_bits: 20,
            overflow_bits: 4,
            iact_addr_bits: 4,
            wght_addr_bits: 7,
            iact_trans_bits: 24,
            wght_trans_bits: 24,
            psum_trans_bits: 40,
            iact_addr_per_pe: 9,
            iacts_per_pe: 16,
            wght_addr_per_pe: 16,
            wghts_per_pe: 192,
            psums_per_pe: 32,
            iact_routers: 3,
            wght_routers: 3,
            psum_routers: 4,
            iact_router_bits: 6,
            wght_router_bits: 1,
            psum_router_bits: 3,
            iact_mem_words: 512,
            psum_mem_words: 768,
            dma_bits: 48,
            serial_split_bits: 24,
        }
    }

    /// Load a configuration from JSON; missing fields take the default value
    pub fn from_json(json: &str) -> MapResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every width and depth is usable
    pub fn validate(&self) -> MapResult<()> {
        let counts = [
            ("pe_rows", self.pe_rows),
            ("pe_cols", self.pe_cols),
            ("cluster_rows", self.cluster_rows),
            ("cluster_cols", self.cluster_cols),
            ("parallel_macs", self.parallel_macs),
            ("iact_addr_per_pe", self.iact_addr_per_pe),
            ("iacts_per_pe", self.iacts_per_pe),
            ("wght_addr_per_pe", self.wght_addr_per_pe),
            ("wghts_per_pe", self.wghts_per_pe),
            ("psums_per_pe", self.psums_per_pe),
            ("iact_routers", self.iact_routers),
            ("wght_routers", self.wght_routers),
            ("psum_routers", self.psum_routers),
            ("iact_mem_words", self.iact_mem_words),
            ("psum_mem_words", self.psum_mem_words),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(MapError::config(format!("{} must be positive", name)));
            }
        }

        let widths = [
            ("iact_data_bits", self.iact_data_bits),
            ("wght_data_bits", self.wght_data_bits),
            ("psum_data_bits", self.psum_data_bits),
            ("iact_addr_bits", self.iact_addr_bits),
            ("wght_addr_bits", self.wght_addr_bits),
            ("iact_trans_bits", self.iact_trans_bits),
            ("wght_trans_bits", self.wght_trans_bits),
            ("psum_trans_bits", self.psum_trans_bits),
            ("iact_router_bits", self.iact_router_bits),
            ("wght_router_bits", self.wght_router_bits),
            ("psum_router_bits", self.psum_router_bits),
            ("dma_bits", self.dma_bits),
            ("serial_split_bits", self.serial_split_bits),
        ];
        for (name, value) in widths {
            if value == 0 || value > 63 {
                return Err(MapError::config(format!(
                    "{} must be between 1 and 63, got {}",
                    name, value
                )));
            }
        }

        if self.wght_routers < self.pe_rows {
            return Err(MapError::config("every PE row needs its own weight router"));
        }
        if self.psum_routers < self.pe_cols {
            return Err(MapError::config("every PE column needs its own psum router"));
        }
        if self.serial_split_bits >= self.dma_bits {
            return Err(MapError::config("serial split must lie inside the DMA word"));
        }
        for port in Port::ALL {
            if port.values_per_trans(self) == 0 {
                return Err(MapError::config(format!(
                    "{} transmission word cannot hold a single value",
                    port
                )));
            }
        }
        if self.iact_addr_per_trans() == 0 || self.wght_addr_per_trans() == 0 {
            return Err(MapError::config("transmission word cannot hold an address"));
        }
        Ok(())
    }

    pub fn num_clusters(&self) -> usize {
        self.cluster_rows * self.cluster_cols
    }

    pub fn pes_per_cluster(&self) -> usize {
        self.pe_rows * self.pe_cols
    }

    pub fn total_pes(&self) -> usize {
        self.num_clusters() * self.pes_per_cluster()
    }

    /// Width of one stored iact entry: value plus overflow count
    pub fn iact_word_bits(&self) -> u32 {
        self.iact_data_bits + self.overflow_bits
    }

    /// Width of one stored weight entry: value plus overflow count
    pub fn wght_word_bits(&self) -> u32 {
        self.wght_data_bits + self.overflow_bits
    }

    pub fn iact_addr_per_trans(&self) -> usize {
        (self.iact_trans_bits / self.iact_addr_bits) as usize
    }

    pub fn wght_addr_per_trans(&self) -> usize {
        (self.wght_trans_bits / self.wght_addr_bits) as usize
    }

    /// Largest value representable at `bits` in two's complement
    pub fn max_value(bits: u32) -> i64 {
        (1i64 << (bits - 1)) - 1
    }

    /// Smallest value representable at `bits` in two's complement
    pub fn min_value(bits: u32) -> i64 {
        -(1i64 << (bits - 1))
    }
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self::default_openeye()
    }
}

/// The three data ports of the accelerator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Port {
    Iact,
    Wght,
    Psum,
}

impl Port {
    pub const ALL: [Port; 3] = [Port::Iact, Port::Wght, Port::Psum];

    /// Width of the value field of one data entry
    pub fn data_bits(&self, config: &AcceleratorConfig) -> u32 {
        match self {
            Port::Iact => config.iact_data_bits,
            Port::Wght => config.wght_data_bits,
            Port::Psum => config.psum_data_bits,
        }
    }

    /// Width of one packed data entry, including the overflow count
    pub fn entry_bits(&self, config: &AcceleratorConfig) -> u32 {
        match self {
            Port::Iact => config.iact_word_bits(),
            Port::Wght => config.wght_word_bits(),
            Port::Psum => config.psum_data_bits,
        }
    }

    /// Width of address entries, if the port carries an address list
    pub fn addr_bits(&self, config: &AcceleratorConfig) -> Option<u32> {
        match self {
            Port::Iact => Some(config.iact_addr_bits),
            Port::Wght => Some(config.wght_addr_bits),
            Port::Psum => None,
        }
    }

    pub fn trans_bits(&self, config: &AcceleratorConfig) -> u32 {
        match self {
            Port::Iact => config.iact_trans_bits,
            Port::Wght => config.wght_trans_bits,
            Port::Psum => config.psum_trans_bits,
        }
    }

    pub fn routers(&self, config: &AcceleratorConfig) -> usize {
        match self {
            Port::Iact => config.iact_routers,
            Port::Wght => config.wght_routers,
            Port::Psum => config.psum_routers,
        }
    }

    pub fn router_bits(&self, config: &AcceleratorConfig) -> u32 {
        match self {
            Port::Iact => config.iact_router_bits,
            Port::Wght => config.wght_router_bits,
            Port::Psum => config.psum_router_bits,
        }
    }

    /// Data entries per transmission word: floor(trans width / entry width)
    pub fn values_per_trans(&self, config: &AcceleratorConfig) -> usize {
        (self.trans_bits(config) / self.entry_bits(config)) as usize
    }

    /// Address entries per transmission word
    pub fn addrs_per_trans(&self, config: &AcceleratorConfig) -> usize {
        match self.addr_bits(config) {
            Some(bits) => (self.trans_bits(config) / bits) as usize,
            None => 0,
        }
    }

    /// Number of lanes (one per cluster and router) the port fans out to
    pub fn lanes(&self, config: &AcceleratorConfig) -> usize {
        config.num_clusters() * self.routers(config)
    }

    /// Lane index of (cluster column, cluster row, router): cluster-major,
    /// router-minor
    pub fn lane(&self, config: &AcceleratorConfig, cl_x: usize, cl_y: usize, router: usize) -> usize {
        (cl_x * config.cluster_rows + cl_y) * self.routers(config) + router
    }
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Port::Iact => write!(f, "iact"),
            Port::Wght => write!(f, "wght"),
            Port::Psum => write!(f, "psum"),
        }
    }
}

/// Which wire format the host uses to feed the accelerator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireFormat {
    /// One transmission-width word per port lane per cycle
    Parallel,
    /// Everything through the single DMA channel
    Serial,
}

/// Per-run settings that are not part of the hardware geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub wire_format: WireFormat,
    /// Leave zero-valued activations out of the scratchpads
    pub zero_skip: bool,
    pub data_mode: bool,
    pub autofunction: bool,
    pub pooling_mode: bool,
    /// Rescaling applied when a verified output becomes the next input
    pub post_scale: PostScale,
    /// Upper bound on concurrently running golden/encoding jobs, 0 for rayon's default
    pub max_parallel_jobs: usize,
    /// Seed for generated test activations and weights
    pub seed: u64,
    /// Generated values are drawn from `-random_magnitude..=random_magnitude`
    pub random_magnitude: i64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            wire_format: WireFormat::Parallel,
            zero_skip: false,
            data_mode: true,
            autofunction: false,
            pooling_mode: true,
            post_scale: PostScale::None,
            max_parallel_jobs: 0,
            seed: 0x5eed,
            random_magnitude: 8,
        }
    }
}

/// Encode a signed value as a `width`-bit two's complement field
pub fn encode_twos_complement(value: i64, width: u32) -> MapResult<u64> {
    encode_signed_field("two's complement", value, width)
}

/// Decode a `width`-bit two's complement field; bits above `width` are ignored
pub fn decode_twos_complement(raw: u64, width: u32) -> i64 {
    if width == 0 {
        return 0;
    }
    let masked = raw & field_mask(width);
    if width < 64 && masked >= 1u64 << (width - 1) {
        masked as i64 - (1i64 << width)
    } else {
        masked as i64
    }
}

/// Two's complement encode, reporting overflow against a named field
pub fn encode_signed_field(field: &str, value: i64, width: u32) -> MapResult<u64> {
    if width == 0 || width > 63 {
        return Err(MapError::overflow(field, value, width));
    }
    let min = AcceleratorConfig::min_value(width);
    let max = AcceleratorConfig::max_value(width);
    if value < min || value > max {
        return Err(MapError::overflow(field, value, width));
    }
    Ok((value as u64) & field_mask(width))
}

/// Check that an unsigned count fits a `width`-bit field
pub fn encode_unsigned_field(field: &str, value: usize, width: u32) -> MapResult<u64> {
    let value = value as u64;
    if width == 0 || (width < 64 && value > field_mask(width)) {
        return Err(MapError::overflow(field, value as i64, width));
    }
    Ok(value)
}

pub(crate) fn field_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AcceleratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.total_pes(), 192);
        assert_eq!(config.iact_word_bits(), 12);
        assert_eq!(Port::Iact.values_per_trans(&config), 2);
        assert_eq!(Port::Iact.addrs_per_trans(&config), 6);
        assert_eq!(Port::Wght.addrs_per_trans(&config), 3);
        assert_eq!(Port::Psum.values_per_trans(&config), 2);
        assert_eq!(Port::Psum.addrs_per_trans(&config), 0);
    }

    #[test]
    fn test_config_from_partial_json() {
        let config = AcceleratorConfig::from_json(r#"{"cluster_rows": 4}"#).unwrap();
        assert_eq!(config.cluster_rows, 4);
        assert_eq!(config.pe_cols, 4);
    }

    #[test]
    fn test_config_rejects_zero_width() {
        let mut config = AcceleratorConfig::default();
        config.psum_data_bits = 0;
        assert!(matches!(config.validate(), Err(MapError::ConfigError { .. })));
    }

    #[test]
    fn test_lane_order_is_cluster_major() {
        let config = AcceleratorConfig::default();
        assert_eq!(Port::Iact.lane(&config, 0, 0, 2), 2);
        assert_eq!(Port::Iact.lane(&config, 0, 1, 0), 3);
        assert_eq!(Port::Iact.lane(&config, 1, 0, 0), 24);
        assert_eq!(Port::Psum.lanes(&config), 64);
    }

    #[test]
    fn test_twos_complement_round_trip() {
        for width in [1u32, 4, 8, 12, 20] {
            let min = AcceleratorConfig::min_value(width);
            let max = AcceleratorConfig::max_value(width);
            for v in min..=max {
                let raw = encode_twos_complement(v, width).unwrap();
                assert!(raw < (1u64 << width));
                assert_eq!(decode_twos_complement(raw, width), v);
            }
        }
    }

    #[test]
    fn test_twos_complement_literals() {
        assert_eq!(encode_twos_complement(-1, 8).unwrap(), 0xff);
        assert_eq!(encode_twos_complement(-128, 8).unwrap(), 0x80);
        assert_eq!(decode_twos_complement(0x80000, 20), -524288);
        assert_eq!(decode_twos_complement(0x7ffff, 20), 524287);
        assert_eq!(decode_twos_complement(5, 0), 0);
    }

    #[test]
    fn test_twos_complement_overflow() {
        assert!(encode_twos_complement(128, 8).is_err());
        assert!(encode_twos_complement(-129, 8).is_err());
        assert!(encode_unsigned_field("refreshes", 256, 8).is_err());
        assert_eq!(encode_unsigned_field("refreshes", 255, 8).unwrap(), 255);
    }
}

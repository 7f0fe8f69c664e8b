//! Per-repetition status register
//!
//! In serial mode the register travels as DMA words. Bit layout (offset,
//! width), least significant bit first:
//!
//! | word | field                  | offset | width |
//! |------|------------------------|--------|-------|
//! | 0    | data_mode              | 0      | 1     |
//! | 0    | fraction_bits          | 1      | 5     |
//! | 0    | autofunction           | 6      | 1     |
//! | 0    | pooling_mode           | 7      | 1     |
//! | 0    | needed_refreshes       | 8      | 8     |
//! | 0    | used_x_cluster         | 16     | 2     |
//! | 0    | used_y_cluster         | 18     | 4     |
//! | 0    | needed_iact_writes     | 22     | 4     |
//! | 0    | used_psum_per_pe       | 26     | 6     |
//! | 0    | used_iact_addr_per_pe  | 32     | 4     |
//! | 0    | used_wght_addr_per_pe  | 36     | 5     |
//! | 0    | used_iact_per_pe       | 41     | 7     |
//! | 1    | iact_addr_len          | 0      | 2     |
//! | 1    | iact_data_len          | 2      | 4     |
//! | 1    | stride_x               | 6      | 4     |
//! | 1    | stride_y               | 10     | 4     |
//! | 1    | capture_output         | 14     | 1     |
//! | 1    | skip_wght              | 15     | 1     |
//! | 1    | skip_psum              | 16     | 1     |
//! | 1    | skip_iact              | 17     | 1     |
//!
//! The computing mask follows in `ceil(total_pes / dma_bits)` words, lowest
//! chunk first.

use serde::{Deserialize, Serialize};

use crate::error::{MapError, MapResult};
use crate::hardware::{encode_unsigned_field, field_mask, AcceleratorConfig, RunOptions};
use crate::pack::WideWord;
use crate::tiling::{ComputingMask, TilingPlan};

/// Width of the refresh counter, which bounds the refreshes per repetition
pub const NEEDED_REFRESHES_BITS: u32 = 8;

/// Placement of one field inside the status words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusField {
    pub name: &'static str,
    pub word: usize,
    pub offset: u32,
    pub width: u32,
}

const fn field(name: &'static str, word: usize, offset: u32, width: u32) -> StatusField {
    StatusField {
        name,
        word,
        offset,
        width,
    }
}

pub const STATUS_LAYOUT: [StatusField; 20] = [
    field("data_mode", 0, 0, 1),
    field("fraction_bits", 0, 1, 5),
    field("autofunction", 0, 6, 1),
    field("pooling_mode", 0, 7, 1),
    field("needed_refreshes", 0, 8, NEEDED_REFRESHES_BITS),
    field("used_x_cluster", 0, 16, 2),
    field("used_y_cluster", 0, 18, 4),
    field("needed_iact_writes", 0, 22, 4),
    field("used_psum_per_pe", 0, 26, 6),
    field("used_iact_addr_per_pe", 0, 32, 4),
    field("used_wght_addr_per_pe", 0, 36, 5),
    field("used_iact_per_pe", 0, 41, 7),
    field("iact_addr_len", 1, 0, 2),
    field("iact_data_len", 1, 2, 4),
    field("stride_x", 1, 6, 4),
    field("stride_y", 1, 10, 4),
    field("capture_output", 1, 14, 1),
    field("skip_wght", 1, 15, 1),
    field("skip_psum", 1, 16, 1),
    field("skip_iact", 1, 17, 1),
];

const STATUS_WORDS: usize = 2;

/// Configuration the accelerator needs before one repetition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRegister {
    pub data_mode: bool,
    pub fraction_bits: u32,
    pub autofunction: bool,
    pub pooling_mode: bool,
    pub needed_refreshes: usize,
    pub used_x_cluster: usize,
    pub used_y_cluster: usize,
    pub needed_iact_writes: usize,
    pub used_psum_per_pe: usize,
    pub used_iact_addr_per_pe: usize,
    pub used_wght_addr_per_pe: usize,
    pub used_iact_per_pe: usize,
    pub iact_addr_len: usize,
    pub iact_data_len: usize,
    pub stride_x: usize,
    pub stride_y: usize,
    /// Partial sums are complete and must be read back after this repetition
    pub capture_output: bool,
    /// Weights are unchanged from the previous repetition and are not sent
    pub skip_wght: bool,
    /// Accumulation continues on the previous partial sums; no bias is sent
    pub skip_psum: bool,
    /// Activations are unchanged from the previous repetition and are not sent
    pub skip_iact: bool,
    /// Cycles the psum port waits before the first read (parallel only)
    pub psum_delay: usize,
}

impl StatusRegister {
    pub fn for_repetition(
        config: &AcceleratorConfig,
        plan: &TilingPlan,
        options: &RunOptions,
        fraction_bits: u32,
        r: usize,
    ) -> Self {
        let (iact_addr_len, iact_data_len) = plan.iact_image_words(config);
        Self {
            data_mode: options.data_mode,
            fraction_bits,
            autofunction: options.autofunction,
            pooling_mode: options.pooling_mode,
            needed_refreshes: plan.refresh_ranges[r].count,
            used_x_cluster: plan.used_x_cluster,
            used_y_cluster: plan.used_y_cluster,
            needed_iact_writes: plan.needed_iact_writes,
            used_psum_per_pe: plan.used_psum_per_pe,
            used_iact_addr_per_pe: plan.used_iact_addr_per_pe,
            used_wght_addr_per_pe: plan.used_wght_addr_per_pe,
            used_iact_per_pe: plan.used_iact_per_pe,
            iact_addr_len,
            iact_data_len,
            stride_x: plan.shape.stride_x,
            stride_y: plan.shape.stride_y,
            capture_output: plan.captures_output(r),
            skip_wght: plan.reuses_weights(r),
            skip_psum: !plan.loads_bias(r),
            skip_iact: reuses_activations(plan, r),
            psum_delay: plan.psum_delay,
        }
    }

    fn values(&self) -> [usize; 20] {
        [
            usize::from(self.data_mode),
            self.fraction_bits as usize,
            usize::from(self.autofunction),
            usize::from(self.pooling_mode),
            self.needed_refreshes,
            self.used_x_cluster,
            self.used_y_cluster,
            self.needed_iact_writes,
            self.used_psum_per_pe,
            self.used_iact_addr_per_pe,
            self.used_wght_addr_per_pe,
            self.used_iact_per_pe,
            self.iact_addr_len,
            self.iact_data_len,
            self.stride_x,
            self.stride_y,
            usize::from(self.capture_output),
            usize::from(self.skip_wght),
            usize::from(self.skip_psum),
            usize::from(self.skip_iact),
        ]
    }

    /// Pack into DMA words; a field that does not fit is an encoding error
    pub fn to_dma_words(&self, config: &AcceleratorConfig) -> MapResult<Vec<u64>> {
        let mut words = vec![0u64; STATUS_WORDS];
        for (field, value) in STATUS_LAYOUT.iter().zip(self.values()) {
            if field.offset + field.width > config.dma_bits {
                return Err(MapError::config(format!(
                    "status field {} does not fit a {}-bit DMA word",
                    field.name, config.dma_bits
                )));
            }
            let raw = encode_unsigned_field(field.name, value, field.width)?;
            words[field.word] |= raw << field.offset;
        }
        Ok(words)
    }

    /// Unpack DMA words produced by [`StatusRegister::to_dma_words`]
    ///
    /// `psum_delay` is not part of the serial layout and reads back as 0.
    pub fn from_dma_words(words: &[u64]) -> MapResult<Self> {
        if words.len() < STATUS_WORDS {
            return Err(MapError::stream(format!(
                "status needs {} DMA words, got {}",
                STATUS_WORDS,
                words.len()
            )));
        }
        let get = |name: &str| -> usize {
            STATUS_LAYOUT
                .iter()
                .find(|f| f.name == name)
                .map(|f| ((words[f.word] >> f.offset) & field_mask(f.width)) as usize)
                .unwrap_or(0)
        };
        Ok(Self {
            data_mode: get("data_mode") == 1,
            fraction_bits: get("fraction_bits") as u32,
            autofunction: get("autofunction") == 1,
            pooling_mode: get("pooling_mode") == 1,
            needed_refreshes: get("needed_refreshes"),
            used_x_cluster: get("used_x_cluster"),
            used_y_cluster: get("used_y_cluster"),
            needed_iact_writes: get("needed_iact_writes"),
            used_psum_per_pe: get("used_psum_per_pe"),
            used_iact_addr_per_pe: get("used_iact_addr_per_pe"),
            used_wght_addr_per_pe: get("used_wght_addr_per_pe"),
            used_iact_per_pe: get("used_iact_per_pe"),
            iact_addr_len: get("iact_addr_len"),
            iact_data_len: get("iact_data_len"),
            stride_x: get("stride_x"),
            stride_y: get("stride_y"),
            capture_output: get("capture_output") == 1,
            skip_wght: get("skip_wght") == 1,
            skip_psum: get("skip_psum") == 1,
            skip_iact: get("skip_iact") == 1,
            psum_delay: 0,
        })
    }
}

/// True when repetition `r` reads the same activations as `r - 1`
fn reuses_activations(plan: &TilingPlan, r: usize) -> bool {
    if r == 0 {
        return false;
    }
    let (now, before) = (plan.repetition(r), plan.repetition(r - 1));
    now.channel_group == before.channel_group && now.window == before.window
}

/// The computing mask as one wide bus, bit `ComputingMask::index` per PE
pub fn mask_bus(mask: &ComputingMask) -> WideWord {
    let bits = mask.bits();
    let mut bus = WideWord::zero(bits.len());
    for (i, &active) in bits.iter().enumerate() {
        if active {
            bus.set_field(i, 1, 1);
        }
    }
    bus
}

/// The computing mask split into DMA words, lowest chunk first
pub fn mask_dma_words(config: &AcceleratorConfig, mask: &ComputingMask) -> Vec<u64> {
    mask_bus(mask).chunks(config.dma_bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{LayerShape, Padding};
    use crate::tiling::GeometryPlanner;
    use pretty_assertions::assert_eq;

    fn conv_status(r: usize) -> StatusRegister {
        let config = AcceleratorConfig::default();
        let shape = LayerShape::conv(16, 16, 8, 4, (3, 3), (1, 1), Padding::Same);
        let plan = GeometryPlanner::new(config.clone()).plan(&shape).unwrap();
        StatusRegister::for_repetition(&config, &plan, &RunOptions::default(), 3, r)
    }

    #[test]
    fn test_layout_is_contiguous() {
        for word in 0..STATUS_WORDS {
            let mut next = 0;
            for f in STATUS_LAYOUT.iter().filter(|f| f.word == word) {
                assert_eq!(f.offset, next, "{}", f.name);
                next = f.offset + f.width;
            }
            assert!(next <= 48);
        }
    }

    #[test]
    fn test_status_word_fields() {
        let status = conv_status(1);
        let words = status.to_dma_words(&AcceleratorConfig::default()).unwrap();

        let expected0 = 1
            | (3 << 1)
            | (1 << 7)
            | (4 << 8)
            | (2 << 16)
            | (1 << 18)
            | (2 << 22)
            | (4 << 26)
            | (4u64 << 32)
            | (12u64 << 36)
            | (12u64 << 41);
        assert_eq!(words[0], expected0);

        let expected1 = 1 | (6 << 2) | (1 << 6) | (1 << 10) | (1 << 14) | (1 << 16);
        assert_eq!(words[1], expected1);
    }

    #[test]
    fn test_status_round_trip() {
        let mut status = conv_status(0);
        status.psum_delay = 0;
        let words = status.to_dma_words(&AcceleratorConfig::default()).unwrap();
        assert_eq!(StatusRegister::from_dma_words(&words).unwrap(), status);
    }

    #[test]
    fn test_field_overflow_is_fatal() {
        let mut status = conv_status(0);
        status.stride_x = 16;
        let err = status.to_dma_words(&AcceleratorConfig::default()).unwrap_err();
        assert!(matches!(err, MapError::EncodingOverflow { ref field, .. } if field == "stride_x"));
    }

    #[test]
    fn test_mask_words() {
        let config = AcceleratorConfig::default();
        let mask = ComputingMask::full(&config);
        let words = mask_dma_words(&config, &mask);
        assert_eq!(words.len(), 4);
        assert!(words.iter().all(|&w| w == (1u64 << 48) - 1));
    }
}

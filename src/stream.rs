//! Scratchpad images and the two wire formats
//!
//! Encoders produce one [`RepetitionFrame`] per repetition: the status
//! register plus per-lane scratchpad images for every port. A frame is then
//! serialized either into per-lane word vectors ([`ParallelTransmission`]) or
//! into a single DMA word sequence (serial).

use serde::{Deserialize, Serialize};

use crate::error::MapResult;
use crate::hardware::{AcceleratorConfig, Port};
use crate::pack::{pack_image, pack_router_bus, pack_serial_word, router_dma_words, WideWord};
use crate::status::{mask_bus, mask_dma_words, StatusRegister};
use crate::tiling::TilingPlan;

/// One scratchpad data entry: a value and its overflow count (the element
/// position inside the image)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataWord {
    pub value: i64,
    pub overflow: u32,
}

/// Contents of one PE scratchpad as sent over one lane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScratchpadImage {
    /// Cumulative end pointers
    pub addr_words: Vec<usize>,
    pub data_words: Vec<DataWord>,
}

impl ScratchpadImage {
    pub fn push(&mut self, value: i64, overflow: u32) {
        self.data_words.push(DataWord { value, overflow });
    }

    pub fn push_addr(&mut self, end: usize) {
        self.addr_words.push(end);
    }

    /// Close a line: its end pointer is the number of entries written so far
    pub fn end_line(&mut self) {
        self.addr_words.push(self.data_words.len());
    }

    pub fn is_empty(&self) -> bool {
        self.addr_words.is_empty() && self.data_words.is_empty()
    }
}

/// All images of one port, grouped by lane in send order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPayload {
    pub port: Port,
    pub lanes: Vec<Vec<ScratchpadImage>>,
}

impl PortPayload {
    pub fn new(port: Port, config: &AcceleratorConfig) -> Self {
        Self {
            port,
            lanes: vec![Vec::new(); port.lanes(config)],
        }
    }

    pub fn push(&mut self, lane: usize, image: ScratchpadImage) {
        self.lanes[lane].push(image);
    }

    pub fn image_count(&self) -> usize {
        self.lanes.iter().map(Vec::len).sum()
    }

    /// Image words per lane: (address words, data words)
    fn image_words(&self, config: &AcceleratorConfig, plan: &TilingPlan) -> (usize, usize) {
        match self.port {
            Port::Iact => plan.iact_image_words(config),
            Port::Wght => plan.wght_image_words(config),
            Port::Psum => (0, plan.psum_words_per_slot(config)),
        }
    }

    /// Pack every lane into fixed-length image words
    pub fn pack(&self, config: &AcceleratorConfig, plan: &TilingPlan) -> MapResult<Vec<Vec<u64>>> {
        let (addr_words, data_words) = self.image_words(config, plan);
        self.lanes
            .iter()
            .map(|images| {
                let mut words = Vec::with_capacity(images.len() * (addr_words + data_words));
                for image in images {
                    words.extend(pack_image(config, self.port, image, addr_words, data_words)?);
                }
                Ok(words)
            })
            .collect()
    }
}

/// Everything the host sends for one repetition
///
/// Ports the status register marks as skipped carry no images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepetitionFrame {
    pub repetition: usize,
    pub status: StatusRegister,
    pub iact: PortPayload,
    pub wght: PortPayload,
    /// Bias values loaded into the partial sums, one image per output slot
    pub bias: PortPayload,
}

/// Parallel wire image of one repetition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelTransmission {
    pub repetition: usize,
    pub status: StatusRegister,
    pub use_pes: WideWord,
    pub iact_router: WideWord,
    pub wght_router: WideWord,
    pub psum_router: WideWord,
    /// Words per lane, indexed by [`Port::lane`]
    pub iact: Vec<Vec<u64>>,
    pub wght: Vec<Vec<u64>>,
    pub psum: Vec<Vec<u64>>,
}

impl ParallelTransmission {
    pub fn lanes(&self, port: Port) -> &[Vec<u64>] {
        match port {
            Port::Iact => &self.iact,
            Port::Wght => &self.wght,
            Port::Psum => &self.psum,
        }
    }

    pub fn word_count(&self) -> usize {
        Port::ALL
            .iter()
            .map(|&port| self.lanes(port).iter().map(Vec::len).sum::<usize>())
            .sum()
    }
}

/// What actually goes over the wire for one repetition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WirePayload {
    Parallel(ParallelTransmission),
    Serial { repetition: usize, words: Vec<u64> },
}

impl WirePayload {
    pub fn repetition(&self) -> usize {
        match self {
            WirePayload::Parallel(tx) => tx.repetition,
            WirePayload::Serial { repetition, .. } => *repetition,
        }
    }

    pub fn word_count(&self) -> usize {
        match self {
            WirePayload::Parallel(tx) => tx.word_count(),
            WirePayload::Serial { words, .. } => words.len(),
        }
    }
}

pub fn serialize_parallel(
    config: &AcceleratorConfig,
    plan: &TilingPlan,
    frame: &RepetitionFrame,
) -> MapResult<ParallelTransmission> {
    let codes = &plan.router_codes;
    Ok(ParallelTransmission {
        repetition: frame.repetition,
        status: frame.status.clone(),
        use_pes: mask_bus(&plan.computing_mask),
        iact_router: pack_router_bus(config, Port::Iact, &codes.iact)?,
        wght_router: pack_router_bus(config, Port::Wght, &codes.wght)?,
        psum_router: pack_router_bus(config, Port::Psum, &codes.psum)?,
        iact: frame.iact.pack(config, plan)?,
        wght: frame.wght.pack(config, plan)?,
        psum: frame.bias.pack(config, plan)?,
    })
}

/// Serial DMA words of one repetition
///
/// Order: status words, computing mask, iact/wght/psum router codes, then
/// the data words. Lane `j` of the activation and weight ports share data
/// words, activations in the low half. Bias words follow, lane by lane.
pub fn serialize_serial(config: &AcceleratorConfig, plan: &TilingPlan, frame: &RepetitionFrame) -> MapResult<Vec<u64>> {
    let mut words = frame.status.to_dma_words(config)?;
    words.extend(mask_dma_words(config, &plan.computing_mask));
    for port in Port::ALL {
        words.extend(router_dma_words(config, port, plan.router_codes.port(port))?);
    }

    let iact = frame.iact.pack(config, plan)?;
    let wght = frame.wght.pack(config, plan)?;
    let empty = Vec::new();
    for j in 0..iact.len().max(wght.len()) {
        let a = iact.get(j).unwrap_or(&empty);
        let b = wght.get(j).unwrap_or(&empty);
        for k in 0..a.len().max(b.len()) {
            words.push(pack_serial_word(
                a.get(k).copied().unwrap_or(0),
                b.get(k).copied().unwrap_or(0),
                config.serial_split_bits,
            ));
        }
    }

    for lane in frame.bias.pack(config, plan)? {
        words.extend(lane);
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::RunOptions;
    use crate::layer::{LayerShape, Padding};
    use crate::tiling::GeometryPlanner;
    use pretty_assertions::assert_eq;

    fn frame_for(shape: &LayerShape) -> (AcceleratorConfig, TilingPlan, RepetitionFrame) {
        let config = AcceleratorConfig::default();
        let plan = GeometryPlanner::new(config.clone()).plan(shape).unwrap();
        let status = StatusRegister::for_repetition(&config, &plan, &RunOptions::default(), 0, 0);
        let frame = RepetitionFrame {
            repetition: 0,
            status,
            iact: PortPayload::new(Port::Iact, &config),
            wght: PortPayload::new(Port::Wght, &config),
            bias: PortPayload::new(Port::Psum, &config),
        };
        (config, plan, frame)
    }

    #[test]
    fn test_end_line_records_cumulative_count() {
        let mut image = ScratchpadImage::default();
        assert!(image.is_empty());
        image.push(4, 0);
        image.end_line();
        image.push(2, 1);
        image.push(7, 2);
        image.end_line();
        assert_eq!(image.addr_words, vec![1, 3]);
    }

    #[test]
    fn test_parallel_lanes_are_fixed_length() {
        let shape = LayerShape::conv(8, 8, 4, 8, (3, 3), (1, 1), Padding::Same);
        let (config, plan, mut frame) = frame_for(&shape);
        let mut image = ScratchpadImage::default();
        image.push(1, 0);
        image.end_line();
        frame.iact.push(0, image.clone());
        frame.iact.push(0, ScratchpadImage::default());
        frame.iact.push(5, image);

        let tx = serialize_parallel(&config, &plan, &frame).unwrap();
        let (addr, data) = plan.iact_image_words(&config);
        assert_eq!(tx.iact[0].len(), 2 * (addr + data));
        assert_eq!(tx.iact[5].len(), addr + data);
        assert!(tx.iact[1].is_empty());
        assert_eq!(tx.iact.len(), Port::Iact.lanes(&config));
        assert_eq!(tx.use_pes.bits(), config.total_pes());
        assert_eq!(tx.psum_router.bits(), 64 * 3);
    }

    #[test]
    fn test_serial_header_and_interleave() {
        let shape = LayerShape::conv(8, 8, 4, 8, (3, 3), (1, 1), Padding::Same);
        let (config, plan, mut frame) = frame_for(&shape);
        let mut iact = ScratchpadImage::default();
        iact.push(3, 0);
        iact.end_line();
        let mut wght = ScratchpadImage::default();
        wght.push(-1, 0);
        wght.push_addr(1);
        frame.iact.push(0, iact);
        frame.wght.push(0, wght);

        let words = serialize_serial(&config, &plan, &frame).unwrap();
        // status, mask, then 48 iact, 48 wght and 64 psum router codes
        let header = 2 + 4 + 6 + 1 + 4;
        assert_eq!(StatusRegister::from_dma_words(&words[..2]).unwrap().used_iact_per_pe, 12);

        let (iact_addr, iact_data) = plan.iact_image_words(&config);
        let (wght_addr, wght_data) = plan.wght_image_words(&config);
        let data_words = (iact_addr + iact_data).max(wght_addr + wght_data);
        assert_eq!(words.len(), header + data_words);
        assert_eq!(words[header], pack_serial_word(1, 1, 24));
        assert_eq!(words[header + 1], pack_serial_word(3, 0, 24));
        assert_eq!(words[header + wght_addr], pack_serial_word(0, 0xff, 24));
    }
}

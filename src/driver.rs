//! Driving the accelerator layer by layer
//!
//! Frames of a layer are encoded up front (in parallel), then sent one
//! repetition at a time. Output is captured only after repetitions that
//! complete their partial sums, and the next frame goes out only after that
//! capture.

use tracing::{debug, info, warn};

use crate::encoder::{encode_layer, EncodeContext};
use crate::error::{MapError, MapResult};
use crate::hardware::{decode_twos_complement, AcceleratorConfig, Port, RunOptions, WireFormat};
use crate::layer::LayerKind;
use crate::pack::{pack_image, unpack_image};
use crate::store::{Tensor, TensorStore};
use crate::stream::{serialize_parallel, serialize_serial, ParallelTransmission, ScratchpadImage, WirePayload};
use crate::tiling::{PsumSlot, TilingPlan};
use crate::verify::{
    compare, compute_golden, decode_captured_stream, place_outputs, reference_output_stream, CapturedStream,
    Comparison,
};

/// Connection to an accelerator
pub trait HardwareHandle {
    /// Called once before the first frame of a layer
    fn begin_layer(&mut self, _plan: &TilingPlan) -> MapResult<()> {
        Ok(())
    }

    fn send(&mut self, payload: &WirePayload) -> MapResult<()>;

    /// Psum words of the last repetition that captured output
    fn capture(&mut self) -> MapResult<CapturedStream>;
}

/// Outcome of running one layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerReport {
    pub layer: usize,
    pub repetitions: usize,
    pub words_sent: usize,
    pub comparison: Comparison,
    pub observed: Tensor,
}

/// Encode, send and verify one layer; a matching output is written back as
/// the next layer's input
pub fn run_layer(
    config: &AcceleratorConfig,
    plan: &TilingPlan,
    store: &mut TensorStore,
    layer: usize,
    options: &RunOptions,
    hardware: &mut dyn HardwareHandle,
) -> MapResult<LayerReport> {
    let (observed, comparison, words_sent) = {
        let tensors = store.layer_tensors(layer)?;
        let ctx = EncodeContext::new(config, plan, tensors, options)?;
        let golden = compute_golden(&tensors, options.max_parallel_jobs)?;
        let frames = encode_layer(&ctx)?;
        info!(layer, layer_shape = %plan.shape, repetitions = frames.len(), "running layer");

        hardware.begin_layer(plan)?;
        let mut observed = Tensor::zeros(&plan.shape.output_dims());
        let mut comparison = Comparison::default();
        let mut words_sent = 0;
        for frame in &frames {
            let payload = match options.wire_format {
                WireFormat::Parallel => WirePayload::Parallel(serialize_parallel(config, plan, frame)?),
                WireFormat::Serial => WirePayload::Serial {
                    repetition: frame.repetition,
                    words: serialize_serial(config, plan, frame)?,
                },
            };
            words_sent += payload.word_count();
            hardware.send(&payload)?;
            debug!(repetition = frame.repetition, words = payload.word_count(), "sent frame");

            if frame.status.capture_output {
                let captured = hardware.capture()?;
                let values = decode_captured_stream(config, plan, frame.repetition, &captured)?;
                comparison.merge(compare(&plan.shape, &golden, &values));
                place_outputs(&plan.shape, &mut observed, &values)?;
            }
        }
        (observed, comparison, words_sent)
    };

    if comparison.is_match() {
        store.write_back(config, layer, observed.clone(), &options.post_scale)?;
    } else {
        warn!(layer, mismatches = comparison.mismatches.len(), "layer output differs from golden");
    }
    Ok(LayerReport {
        layer,
        repetitions: plan.needed_total_transmissions,
        words_sent,
        comparison,
        observed,
    })
}

/// Answers every capture with the golden output
#[derive(Debug, Clone)]
pub struct LoopbackArray {
    config: AcceleratorConfig,
    golden: Tensor,
    plan: Option<TilingPlan>,
    last: Option<(usize, bool)>,
}

impl LoopbackArray {
    pub fn new(config: AcceleratorConfig, golden: Tensor) -> Self {
        Self {
            config,
            golden,
            plan: None,
            last: None,
        }
    }
}

impl HardwareHandle for LoopbackArray {
    fn begin_layer(&mut self, plan: &TilingPlan) -> MapResult<()> {
        self.plan = Some(plan.clone());
        Ok(())
    }

    fn send(&mut self, payload: &WirePayload) -> MapResult<()> {
        let serial = matches!(payload, WirePayload::Serial { .. });
        self.last = Some((payload.repetition(), serial));
        Ok(())
    }

    fn capture(&mut self) -> MapResult<CapturedStream> {
        let plan = self.plan.as_ref().ok_or_else(|| MapError::stream("no layer started"))?;
        let (r, serial) = self.last.ok_or_else(|| MapError::stream("nothing sent"))?;
        reference_output_stream(&self.config, plan, &self.golden, r, serial)
    }
}

/// Decoded scratchpad contents of one lane
type LaneImages = Vec<Vec<i64>>;

/// Software model of the array on the parallel wire
///
/// Scratchpads keep their contents across repetitions that skip a port;
/// partial sums keep accumulating until a bias load resets them.
#[derive(Debug, Clone)]
pub struct EmulatedArray {
    config: AcceleratorConfig,
    plan: Option<TilingPlan>,
    iact: Vec<LaneImages>,
    wght: Vec<LaneImages>,
    psums: Vec<Vec<i64>>,
    pending: Option<CapturedStream>,
}

impl EmulatedArray {
    pub fn new(config: AcceleratorConfig) -> Self {
        Self {
            config,
            plan: None,
            iact: Vec::new(),
            wght: Vec::new(),
            psums: Vec::new(),
            pending: None,
        }
    }

    /// Split lane words into images and expand activations to dense
    /// positions
    fn load(&self, plan: &TilingPlan, port: Port, lanes: &[Vec<u64>]) -> Vec<LaneImages> {
        let config = &self.config;
        let (addr_words, data_words) = match port {
            Port::Iact => plan.iact_image_words(config),
            _ => plan.wght_image_words(config),
        };
        let image_len = (addr_words + data_words).max(1);
        lanes
            .iter()
            .map(|words| {
                words
                    .chunks(image_len)
                    .map(|chunk| {
                        let (addrs, entries) = unpack_image(config, port, chunk, addr_words);
                        match port {
                            Port::Iact => {
                                let written = addrs.iter().copied().max().unwrap_or(0);
                                let mut line = vec![0; plan.line_occupancy];
                                for entry in entries.iter().take(written) {
                                    if let Some(slot) = line.get_mut(entry.overflow as usize) {
                                        *slot = entry.value;
                                    }
                                }
                                line
                            }
                            _ => entries.iter().map(|e| e.value).collect(),
                        }
                    })
                    .collect()
            })
            .collect()
    }

    fn image<'a>(images: &'a [LaneImages], lane: usize, index: usize, port: Port) -> MapResult<&'a [i64]> {
        images
            .get(lane)
            .and_then(|lane_images| lane_images.get(index))
            .map(Vec::as_slice)
            .ok_or_else(|| MapError::stream(format!("{} lane {} has no image {}", port, lane, index)))
    }

    /// Products accumulated by the PEs of one output slot
    fn accumulate(&self, plan: &TilingPlan, r: usize, slot: &PsumSlot) -> MapResult<Vec<i64>> {
        let config = &self.config;
        let shape = &plan.shape;
        let column = plan.wght_column;
        let mut acc = vec![0i64; plan.used_psum_per_pe];

        if shape.kind == LayerKind::Dense {
            for pe_y in 0..config.pe_rows {
                let router = pe_y % config.iact_routers;
                let lane = Port::Iact.lane(config, slot.cl_x, 0, router);
                let inputs = Self::image(&self.iact, lane, pe_y / config.iact_routers, Port::Iact)?;
                let wght_lane = Port::Wght.lane(config, slot.cl_x, slot.cl_y, pe_y);
                let weights = Self::image(&self.wght, wght_lane, 0, Port::Wght)?;
                for (i, &input) in inputs.iter().enumerate() {
                    for (j, a) in acc.iter_mut().enumerate() {
                        *a += weights.get(i * column + j).copied().unwrap_or(0) * input;
                    }
                }
            }
            return Ok(acc);
        }

        let local = slot.refresh - plan.spatial_refreshes(r).start;
        let routers = config.iact_routers;
        for offset in 0..plan.used_y_cluster {
            let cl_y = slot.cl_y + offset;
            for pe_y in 0..config.pe_rows {
                let ky = offset * config.pe_rows + pe_y;
                if ky >= shape.kernel_height {
                    continue;
                }
                let weights = Self::image(&self.wght, Port::Wght.lane(config, slot.cl_x, cl_y, pe_y), 0, Port::Wght)?;
                for c in 0..plan.used_channels {
                    for kx in 0..shape.kernel_width {
                        let line = slot.pe_x * shape.stride_x + kx;
                        let lane = Port::Iact.lane(config, slot.cl_x, cl_y, line % routers);
                        let index = local * plan.needed_iact_writes + line / routers;
                        let input = Self::image(&self.iact, lane, index, Port::Iact)?
                            .get(c * shape.kernel_height + ky)
                            .copied()
                            .unwrap_or(0);
                        let col = c * shape.kernel_width + kx;
                        for (j, a) in acc.iter_mut().enumerate() {
                            *a += weights.get(col * column + j).copied().unwrap_or(0) * input;
                        }
                    }
                }
            }
        }
        Ok(acc)
    }

    fn run(&mut self, tx: &ParallelTransmission) -> MapResult<()> {
        let plan = self.plan.take().ok_or_else(|| MapError::stream("no layer started"))?;
        let result = self.step(&plan, tx);
        self.plan = Some(plan);
        result
    }

    fn step(&mut self, plan: &TilingPlan, tx: &ParallelTransmission) -> MapResult<()> {
        let config = self.config.clone();
        let status = &tx.status;
        let r = tx.repetition;
        if !status.skip_iact {
            self.iact = self.load(plan, Port::Iact, &tx.iact);
        }
        if !status.skip_wght {
            self.wght = self.load(plan, Port::Wght, &tx.wght);
        }

        let slots = plan.psum_slots(&config, r);
        let per_slot = plan.psum_words_per_slot(&config);
        if !status.skip_psum {
            let mut cursors = vec![0usize; tx.psum.len()];
            let mut loaded = Vec::with_capacity(slots.len());
            for slot in &slots {
                let start = cursors[slot.lane];
                let words = tx.psum[slot.lane]
                    .get(start..start + per_slot)
                    .ok_or_else(|| MapError::stream(format!("bias lane {} too short", slot.lane)))?;
                cursors[slot.lane] += per_slot;
                let (_, entries) = unpack_image(&config, Port::Psum, words, 0);
                loaded.push(entries.iter().take(plan.used_psum_per_pe).map(|e| e.value).collect());
            }
            self.psums = loaded;
        } else if self.psums.len() != slots.len() {
            return Err(MapError::stream(format!(
                "repetition {} continues {} partial sums but has {} slots",
                r,
                self.psums.len(),
                slots.len()
            )));
        }

        for (k, slot) in slots.iter().enumerate() {
            if slot.position.is_none() {
                continue;
            }
            let acc = self.accumulate(plan, r, slot)?;
            for (psum, a) in self.psums[k].iter_mut().zip(acc) {
                *psum = decode_twos_complement((*psum + a) as u64, config.psum_data_bits);
            }
        }

        if status.capture_output {
            let mut lanes = vec![Vec::new(); Port::Psum.lanes(&config)];
            for (slot, values) in slots.iter().zip(&self.psums) {
                let mut image = ScratchpadImage::default();
                for &v in values {
                    image.push(v, 0);
                }
                lanes[slot.lane].extend(pack_image(&config, Port::Psum, &image, 0, per_slot)?);
            }
            self.pending = Some(CapturedStream::Parallel(lanes));
        }
        Ok(())
    }
}

impl HardwareHandle for EmulatedArray {
    fn begin_layer(&mut self, plan: &TilingPlan) -> MapResult<()> {
        self.plan = Some(plan.clone());
        self.iact.clear();
        self.wght.clear();
        self.psums.clear();
        self.pending = None;
        Ok(())
    }

    fn send(&mut self, payload: &WirePayload) -> MapResult<()> {
        match payload {
            WirePayload::Parallel(tx) => self.run(tx),
            WirePayload::Serial { .. } => Err(MapError::stream("the emulator drives the parallel wire only")),
        }
    }

    fn capture(&mut self) -> MapResult<CapturedStream> {
        self.pending.take().ok_or_else(|| MapError::stream("no output captured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{LayerShape, LayerSpec, ModelDescription, Padding};
    use crate::tiling::GeometryPlanner;
    use pretty_assertions::assert_eq;

    fn run_single(shape: LayerShape, options: &RunOptions) -> LayerReport {
        let config = AcceleratorConfig::default();
        let plan = GeometryPlanner::new(config.clone()).plan(&shape).unwrap();
        let model = ModelDescription::new(vec![LayerSpec::new(shape)]);
        let mut store = TensorStore::initialize(&model).unwrap();
        store.quantize(&model, &config, options).unwrap();
        let mut hardware = EmulatedArray::new(config.clone());
        run_layer(&config, &plan, &mut store, 0, options, &mut hardware).unwrap()
    }

    fn assert_matches(shape: LayerShape) {
        let report = run_single(shape.clone(), &RunOptions::default());
        assert!(report.comparison.is_match(), "{}: {:?}", shape, report.comparison.mismatches.first());
        assert_eq!(report.comparison.checked, shape.output_dims().iter().product::<usize>(), "{}", shape);
    }

    #[test]
    fn test_emulated_conv_matches_golden() {
        assert_matches(LayerShape::conv(8, 8, 4, 8, (3, 3), (1, 1), Padding::Same));
    }

    #[test]
    fn test_emulated_conv_across_channel_and_filter_groups() {
        assert_matches(LayerShape::conv(6, 6, 6, 20, (3, 3), (1, 1), Padding::Same));
    }

    #[test]
    fn test_emulated_odd_width_and_stride() {
        assert_matches(LayerShape::conv(7, 7, 3, 4, (3, 3), (1, 1), Padding::Same));
        assert_matches(LayerShape::conv(8, 8, 2, 4, (3, 3), (2, 2), Padding::Same));
        assert_matches(LayerShape::conv(14, 14, 2, 2, (1, 1), (1, 1), Padding::Same));
    }

    #[test]
    fn test_emulated_tall_kernel_chains_clusters() {
        assert_matches(LayerShape::conv(12, 12, 1, 2, (5, 5), (1, 1), Padding::Same));
        assert_matches(LayerShape::conv(12, 12, 1, 1, (9, 9), (1, 1), Padding::Valid));
    }

    #[test]
    fn test_emulated_spatial_windows() {
        assert_matches(LayerShape::conv(96, 96, 1, 2, (3, 3), (1, 1), Padding::Same));
    }

    #[test]
    fn test_emulated_depthwise_and_dense() {
        assert_matches(LayerShape::depthwise(8, 8, 3, (3, 3), (1, 1), Padding::Same));
        assert_matches(LayerShape::dense(64, 10));
        assert_matches(LayerShape::dense(100, 40));
    }

    /// Encode, serialize and emulate by hand, then rebuild the output tensor
    fn emulate_by_hand(padding: Padding) -> (Tensor, Tensor) {
        let config = AcceleratorConfig::default();
        let options = RunOptions::default();
        let shape = LayerShape::conv(4, 4, 1, 1, (3, 3), (1, 1), padding);
        let plan = GeometryPlanner::new(config.clone()).plan(&shape).unwrap();
        let model = ModelDescription::new(vec![LayerSpec::new(shape.clone())]);
        let mut store = TensorStore::initialize(&model).unwrap();
        store.set_input((1..=16).collect()).unwrap();
        store.set_weights(0, vec![1; 9]).unwrap();
        store.set_bias(0, vec![0]).unwrap();

        let tensors = store.layer_tensors(0).unwrap();
        let golden = compute_golden(&tensors, 0).unwrap();
        let ctx = EncodeContext::new(&config, &plan, tensors, &options).unwrap();
        let mut hardware = EmulatedArray::new(config.clone());
        hardware.begin_layer(&plan).unwrap();
        let mut observed = Tensor::zeros(&shape.output_dims());
        for frame in encode_layer(&ctx).unwrap() {
            let payload = WirePayload::Parallel(serialize_parallel(&config, &plan, &frame).unwrap());
            hardware.send(&payload).unwrap();
            if frame.status.capture_output {
                let captured = hardware.capture().unwrap();
                let values = decode_captured_stream(&config, &plan, frame.repetition, &captured).unwrap();
                place_outputs(&shape, &mut observed, &values).unwrap();
            }
        }
        (observed, golden)
    }

    #[test]
    fn test_wire_round_trip_reproduces_golden() {
        let (observed, golden) = emulate_by_hand(Padding::Same);
        assert_eq!(observed, golden);
        assert_eq!(observed.shape, vec![1, 4, 4]);

        let (observed, golden) = emulate_by_hand(Padding::Valid);
        assert_eq!(observed, golden);
        assert_eq!(observed.data, vec![54, 63, 90, 99]);
    }

    #[test]
    fn test_zero_skip_preserves_results() {
        let options = RunOptions {
            zero_skip: true,
            ..RunOptions::default()
        };
        let shape = LayerShape::conv(8, 8, 4, 4, (3, 3), (1, 1), Padding::Same);
        assert!(run_single(shape, &options).comparison.is_match());
    }

    #[test]
    fn test_output_written_back_for_next_layer() {
        let config = AcceleratorConfig::default();
        let model = ModelDescription::new(vec![
            LayerSpec::new(LayerShape::conv(4, 4, 1, 2, (3, 3), (1, 1), Padding::Same)),
            LayerSpec::new(LayerShape::dense(32, 4)),
        ]);
        let options = RunOptions {
            post_scale: crate::store::PostScale::Shift(4),
            ..RunOptions::default()
        };
        let mut store = TensorStore::initialize(&model).unwrap();
        store.quantize(&model, &config, &options).unwrap();
        let plan = GeometryPlanner::new(config.clone()).plan(&model.layers[0].shape).unwrap();
        let mut hardware = EmulatedArray::new(config.clone());
        let report = run_layer(&config, &plan, &mut store, 0, &options, &mut hardware).unwrap();
        assert!(report.comparison.is_match());

        let next = store.layer_tensors(1).unwrap().input;
        assert_eq!(next.shape, vec![32]);
        let expected: Vec<i64> = report.observed.data.iter().map(|v| (v >> 4).clamp(-128, 127)).collect();
        assert_eq!(next.data, expected);
    }

    #[test]
    fn test_loopback_serial() {
        let config = AcceleratorConfig::default();
        let shape = LayerShape::conv(8, 8, 8, 4, (3, 3), (1, 1), Padding::Same);
        let options = RunOptions {
            wire_format: WireFormat::Serial,
            ..RunOptions::default()
        };
        let plan = GeometryPlanner::new(config.clone()).plan(&shape).unwrap();
        let model = ModelDescription::new(vec![LayerSpec::new(shape)]);
        let mut store = TensorStore::initialize(&model).unwrap();
        store.quantize(&model, &config, &options).unwrap();
        let golden = compute_golden(&store.layer_tensors(0).unwrap(), 0).unwrap();

        let mut hardware = LoopbackArray::new(config.clone(), golden.clone());
        let report = run_layer(&config, &plan, &mut store, 0, &options, &mut hardware).unwrap();
        assert!(report.comparison.is_match());
        assert_eq!(report.observed, golden);
        assert_eq!(report.repetitions, 2);
        assert!(report.words_sent > 0);
    }

    #[test]
    fn test_emulator_rejects_serial() {
        let mut hardware = EmulatedArray::new(AcceleratorConfig::default());
        let payload = WirePayload::Serial {
            repetition: 0,
            words: vec![],
        };
        assert!(hardware.send(&payload).is_err());
        assert!(hardware.capture().is_err());
    }
}

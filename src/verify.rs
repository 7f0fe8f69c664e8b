//! Golden reference and output verification
//!
//! The golden model uses the same padding convention as the encoders:
//! positions outside the input map read [`PADDING_SENTINEL`]. Captured psum
//! words are decoded with the slot order of [`TilingPlan::psum_slots`].

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::encoder::PADDING_SENTINEL;
use crate::error::{MapError, MapResult};
use crate::hardware::{AcceleratorConfig, Port};
use crate::layer::{LayerKind, LayerShape};
use crate::pack::{pack_image, unpack_image};
use crate::parallel::with_job_limit;
use crate::store::{LayerTensors, Tensor};
use crate::stream::ScratchpadImage;
use crate::tiling::{PsumSlot, TilingPlan};

/// Psum words read back after a repetition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapturedStream {
    /// Words per psum lane
    Parallel(Vec<Vec<u64>>),
    /// Psum lanes concatenated in lane order
    Serial(Vec<u64>),
}

/// One decoded output value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputValue {
    pub filter: usize,
    pub y: usize,
    pub x: usize,
    pub value: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub filter: usize,
    pub x: usize,
    pub y: usize,
    pub golden: i64,
    pub observed: i64,
}

/// Result of checking observed outputs against the golden tensor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    pub checked: usize,
    pub mismatches: Vec<Mismatch>,
}

impl Comparison {
    pub fn is_match(&self) -> bool {
        self.mismatches.is_empty()
    }

    pub fn merge(&mut self, other: Comparison) {
        self.checked += other.checked;
        self.mismatches.extend(other.mismatches);
    }
}

/// Expected layer output, computed per output filter in parallel
pub fn compute_golden(tensors: &LayerTensors<'_>, max_jobs: usize) -> MapResult<Tensor> {
    let shape = tensors.shape;
    let per_filter: Vec<Vec<i64>> = with_job_limit(max_jobs, || {
        (0..shape.filters)
            .into_par_iter()
            .map(|f| match shape.kind {
                LayerKind::Conv | LayerKind::DepthwiseConv => golden_map(tensors, f),
                LayerKind::Dense => vec![golden_neuron(tensors, f)],
            })
            .collect()
    })?;
    let data = per_filter.into_iter().flatten().collect();
    let golden = Tensor::from_vec(&shape.output_dims(), data)?;
    debug!(layer = %shape, values = golden.len(), "computed golden output");
    Ok(golden)
}

fn golden_map(tensors: &LayerTensors<'_>, f: usize) -> Vec<i64> {
    let shape = tensors.shape;
    let (pad_y, pad_x) = shape.kernel_pad();
    let bias = tensors.bias.get(&[f]).unwrap_or(0);
    let channels: Vec<usize> = match shape.kind {
        LayerKind::DepthwiseConv => vec![f],
        _ => (0..shape.in_channels).collect(),
    };

    let mut out = Vec::with_capacity(shape.output_positions());
    for y in 0..shape.out_height() {
        for x in 0..shape.out_width() {
            let mut acc = bias;
            for &c in &channels {
                for ky in 0..shape.kernel_height {
                    let iy = (y * shape.stride_y + ky) as isize - pad_y as isize;
                    for kx in 0..shape.kernel_width {
                        let ix = (x * shape.stride_x + kx) as isize - pad_x as isize;
                        let input = tensors.input.get_padded(c, iy, ix).unwrap_or(PADDING_SENTINEL);
                        acc += weight(tensors, c, f, ky, kx) * input;
                    }
                }
            }
            out.push(acc);
        }
    }
    out
}

fn weight(tensors: &LayerTensors<'_>, c: usize, f: usize, ky: usize, kx: usize) -> i64 {
    match tensors.shape.kind {
        LayerKind::DepthwiseConv => tensors.weights.get(&[c, ky, kx]),
        _ => tensors.weights.get(&[c, f, ky, kx]),
    }
    .unwrap_or(0)
}

fn golden_neuron(tensors: &LayerTensors<'_>, o: usize) -> i64 {
    let bias = tensors.bias.get(&[o]).unwrap_or(0);
    (0..tensors.shape.in_channels).fold(bias, |acc, i| {
        acc + tensors.weights.get(&[o, i]).unwrap_or(0) * tensors.input.get(&[i]).unwrap_or(0)
    })
}

fn output_index(shape: &LayerShape, filter: usize, y: usize, x: usize) -> Vec<usize> {
    match shape.kind {
        LayerKind::Dense => vec![filter],
        _ => vec![filter, y, x],
    }
}

/// Split captured words into one word list per psum lane
fn lane_words(config: &AcceleratorConfig, plan: &TilingPlan, slots: &[PsumSlot], captured: &CapturedStream) -> MapResult<Vec<Vec<u64>>> {
    match captured {
        CapturedStream::Parallel(lanes) => Ok(lanes.clone()),
        CapturedStream::Serial(words) => {
            let per_slot = plan.psum_words_per_slot(config);
            let mut counts = vec![0usize; Port::Psum.lanes(config)];
            for slot in slots {
                counts[slot.lane] += per_slot;
            }
            let needed: usize = counts.iter().sum();
            if words.len() < needed {
                return Err(MapError::stream(format!(
                    "captured {} psum words, expected {}",
                    words.len(),
                    needed
                )));
            }
            let mut start = 0;
            Ok(counts
                .into_iter()
                .map(|count| {
                    let lane = words[start..start + count].to_vec();
                    start += count;
                    lane
                })
                .collect())
        }
    }
}

/// Decode the psum words of repetition `r` into output values
///
/// Padding filters and idle slots are dropped.
pub fn decode_captured_stream(
    config: &AcceleratorConfig,
    plan: &TilingPlan,
    r: usize,
    captured: &CapturedStream,
) -> MapResult<Vec<OutputValue>> {
    let slots = plan.psum_slots(config, r);
    let lanes = lane_words(config, plan, &slots, captured)?;
    let per_slot = plan.psum_words_per_slot(config);
    let filters = plan.filter_range(r);

    let mut cursors = vec![0usize; lanes.len()];
    let mut values = Vec::new();
    for slot in &slots {
        let lane = lanes
            .get(slot.lane)
            .ok_or_else(|| MapError::stream(format!("no psum lane {}", slot.lane)))?;
        let start = cursors[slot.lane];
        let words = lane.get(start..start + per_slot).ok_or_else(|| {
            MapError::stream(format!("psum lane {} ended after {} words", slot.lane, lane.len()))
        })?;
        cursors[slot.lane] += per_slot;

        let Some((y, x)) = slot.position else {
            continue;
        };
        let (_, entries) = unpack_image(config, Port::Psum, words, 0);
        for (j, entry) in entries.iter().take(plan.used_psum_per_pe).enumerate() {
            let filter = slot.first_filter + j;
            if filters.contains(&filter) {
                values.push(OutputValue {
                    filter,
                    y,
                    x,
                    value: entry.value,
                });
            }
        }
    }
    Ok(values)
}

/// Psum words a correct accelerator emits for repetition `r`
pub fn reference_output_stream(
    config: &AcceleratorConfig,
    plan: &TilingPlan,
    golden: &Tensor,
    r: usize,
    serial: bool,
) -> MapResult<CapturedStream> {
    let per_slot = plan.psum_words_per_slot(config);
    let filters = plan.filter_range(r);
    let mut lanes = vec![Vec::new(); Port::Psum.lanes(config)];
    for slot in plan.psum_slots(config, r) {
        let mut image = ScratchpadImage::default();
        for j in 0..plan.used_psum_per_pe {
            let filter = slot.first_filter + j;
            let value = match slot.position {
                Some((y, x)) if filters.contains(&filter) => {
                    golden.get(&output_index(&plan.shape, filter, y, x)).unwrap_or(0)
                }
                _ => 0,
            };
            image.push(value, 0);
        }
        lanes[slot.lane].extend(pack_image(config, Port::Psum, &image, 0, per_slot)?);
    }
    Ok(if serial {
        CapturedStream::Serial(lanes.into_iter().flatten().collect())
    } else {
        CapturedStream::Parallel(lanes)
    })
}

/// Check observed values against the golden tensor; the first mismatch is
/// logged
pub fn compare(shape: &LayerShape, golden: &Tensor, observed: &[OutputValue]) -> Comparison {
    let mut comparison = Comparison::default();
    for v in observed {
        let expected = golden.get(&output_index(shape, v.filter, v.y, v.x)).unwrap_or(0);
        comparison.checked += 1;
        if expected != v.value {
            if comparison.mismatches.is_empty() {
                error!(
                    filter = v.filter,
                    x = v.x,
                    y = v.y,
                    golden = expected,
                    observed = v.value,
                    "first output mismatch"
                );
            }
            comparison.mismatches.push(Mismatch {
                filter: v.filter,
                x: v.x,
                y: v.y,
                golden: expected,
                observed: v.value,
            });
        }
    }
    comparison
}

/// Write observed values into an output tensor
pub fn place_outputs(shape: &LayerShape, output: &mut Tensor, observed: &[OutputValue]) -> MapResult<()> {
    for v in observed {
        output.set(&output_index(shape, v.filter, v.y, v.x), v.value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::Padding;
    use crate::tiling::GeometryPlanner;
    use pretty_assertions::assert_eq;

    fn tensors<'a>(shape: &'a LayerShape, input: &'a Tensor, weights: &'a Tensor, bias: &'a Tensor) -> LayerTensors<'a> {
        LayerTensors {
            shape,
            input,
            weights,
            bias,
            fraction_bits: 0,
        }
    }

    #[test]
    fn test_golden_valid_conv() {
        let shape = LayerShape::conv(4, 4, 1, 1, (3, 3), (1, 1), Padding::Valid);
        let input = Tensor::from_vec(&[1, 4, 4], (1..=16).collect()).unwrap();
        let weights = Tensor::from_vec(&[1, 1, 3, 3], vec![1; 9]).unwrap();
        let bias = Tensor::zeros(&[1]);
        let golden = compute_golden(&tensors(&shape, &input, &weights, &bias), 0).unwrap();
        assert_eq!(golden.shape, vec![1, 2, 2]);
        assert_eq!(golden.data, vec![54, 63, 90, 99]);
    }

    #[test]
    fn test_golden_same_padding_reads_sentinel() {
        let shape = LayerShape::conv(1, 1, 1, 1, (3, 3), (1, 1), Padding::Same);
        let input = Tensor::from_vec(&[1, 1, 1], vec![5]).unwrap();
        let weights = Tensor::from_vec(&[1, 1, 3, 3], vec![1; 9]).unwrap();
        let bias = Tensor::from_vec(&[1], vec![2]).unwrap();
        let golden = compute_golden(&tensors(&shape, &input, &weights, &bias), 2).unwrap();
        assert_eq!(golden.data, vec![15]);
    }

    #[test]
    fn test_golden_strided_same_pads_by_kernel() {
        let shape = LayerShape::conv(4, 4, 1, 1, (3, 3), (2, 2), Padding::Same);
        let input = Tensor::from_vec(&[1, 4, 4], (1..=16).collect()).unwrap();
        let weights = Tensor::from_vec(&[1, 1, 3, 3], vec![1; 9]).unwrap();
        let bias = Tensor::zeros(&[1]);
        let golden = compute_golden(&tensors(&shape, &input, &weights, &bias), 0).unwrap();
        assert_eq!(golden.shape, vec![1, 2, 2]);
        // 1 + 2 + 5 + 6 plus five sentinel taps at (0, 0)
        assert_eq!(golden.data, vec![19, 33, 60, 99]);
    }

    #[test]
    fn test_golden_depthwise_and_dense() {
        let shape = LayerShape::depthwise(1, 2, 2, (1, 1), (1, 1), Padding::Valid);
        let input = Tensor::from_vec(&[2, 1, 2], vec![1, 2, 3, 4]).unwrap();
        let weights = Tensor::from_vec(&[2, 1, 1], vec![10, -1]).unwrap();
        let bias = Tensor::from_vec(&[2], vec![0, 100]).unwrap();
        let golden = compute_golden(&tensors(&shape, &input, &weights, &bias), 0).unwrap();
        assert_eq!(golden.data, vec![10, 20, 97, 96]);

        let shape = LayerShape::dense(3, 2);
        let input = Tensor::from_vec(&[3], vec![1, 2, 3]).unwrap();
        let weights = Tensor::from_vec(&[2, 3], vec![1, 1, 1, -1, 0, 2]).unwrap();
        let bias = Tensor::from_vec(&[2], vec![4, -4]).unwrap();
        let golden = compute_golden(&tensors(&shape, &input, &weights, &bias), 0).unwrap();
        assert_eq!(golden.data, vec![10, 1]);
    }

    #[test]
    fn test_reference_stream_decodes_to_golden() {
        let config = AcceleratorConfig::default();
        let shape = LayerShape::conv(7, 7, 1, 3, (3, 3), (1, 1), Padding::Same);
        let plan = GeometryPlanner::new(config.clone()).plan(&shape).unwrap();
        let golden = Tensor::from_vec(&shape.output_dims(), (0..147).map(|v| v - 70).collect()).unwrap();

        for serial in [false, true] {
            let stream = reference_output_stream(&config, &plan, &golden, 0, serial).unwrap();
            let observed = decode_captured_stream(&config, &plan, 0, &stream).unwrap();
            assert_eq!(observed.len(), golden.len());
            assert!(compare(&shape, &golden, &observed).is_match());

            let mut rebuilt = Tensor::zeros(&shape.output_dims());
            place_outputs(&shape, &mut rebuilt, &observed).unwrap();
            assert_eq!(rebuilt, golden);
        }
    }

    #[test]
    fn test_compare_reports_coordinates() {
        let shape = LayerShape::conv(2, 2, 1, 2, (1, 1), (1, 1), Padding::Valid);
        let golden = Tensor::from_vec(&[2, 2, 2], vec![0, 1, 2, 3, 4, 5, 6, 7]).unwrap();
        let observed = vec![
            OutputValue { filter: 1, y: 1, x: 0, value: 6 },
            OutputValue { filter: 1, y: 0, x: 1, value: -5 },
        ];
        let comparison = compare(&shape, &golden, &observed);
        assert_eq!(comparison.checked, 2);
        assert_eq!(
            comparison.mismatches,
            vec![Mismatch { filter: 1, x: 1, y: 0, golden: 5, observed: -5 }]
        );
    }

    #[test]
    fn test_truncated_capture_is_stream_error() {
        let config = AcceleratorConfig::default();
        let shape = LayerShape::dense(8, 3);
        let plan = GeometryPlanner::new(config.clone()).plan(&shape).unwrap();
        let err = decode_captured_stream(&config, &plan, 0, &CapturedStream::Serial(vec![0; 3])).unwrap_err();
        assert!(matches!(err, MapError::StreamError { .. }));
    }
}

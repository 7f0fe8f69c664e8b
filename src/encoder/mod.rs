//! Stream encoders
//!
//! One encoder per layer kind turns the tensors of a layer into per-lane
//! scratchpad images for a repetition. The activation layout of spatial
//! layers is shared: every image is one input column of the receptive field,
//! holding `kernel_height` values per channel.

mod conv;
mod dense;
mod depthwise;

pub use conv::ConvEncoder;
pub use dense::DenseEncoder;
pub use depthwise::DepthwiseEncoder;

use rayon::prelude::*;
use std::ops::Range;
use tracing::debug;

use crate::error::{MapError, MapResult};
use crate::hardware::{AcceleratorConfig, Port, RunOptions};
use crate::layer::LayerKind;
use crate::parallel::with_job_limit;
use crate::status::StatusRegister;
use crate::store::LayerTensors;
use crate::stream::{PortPayload, RepetitionFrame, ScratchpadImage};
use crate::tiling::TilingPlan;

/// Value fed for input positions outside the map
pub const PADDING_SENTINEL: i64 = 1;

/// Everything an encoder reads for one layer
#[derive(Debug, Clone, Copy)]
pub struct EncodeContext<'a> {
    pub config: &'a AcceleratorConfig,
    pub plan: &'a TilingPlan,
    pub tensors: LayerTensors<'a>,
    pub options: &'a RunOptions,
}

impl<'a> EncodeContext<'a> {
    pub fn new(
        config: &'a AcceleratorConfig,
        plan: &'a TilingPlan,
        tensors: LayerTensors<'a>,
        options: &'a RunOptions,
    ) -> MapResult<Self> {
        if tensors.shape != &plan.shape {
            return Err(MapError::shape(plan.shape.to_string(), tensors.shape.to_string()));
        }
        Ok(Self {
            config,
            plan,
            tensors,
            options,
        })
    }
}

/// Turns layer tensors into scratchpad images
pub trait StreamEncoder: Send + Sync {
    fn encode_activations(&self, ctx: &EncodeContext<'_>, r: usize) -> MapResult<PortPayload>;

    fn encode_weights(&self, ctx: &EncodeContext<'_>, r: usize) -> MapResult<PortPayload>;

    /// Bias images in output slot order
    fn encode_bias(&self, ctx: &EncodeContext<'_>, r: usize) -> MapResult<PortPayload> {
        let (config, plan) = (ctx.config, ctx.plan);
        let filters = plan.filter_range(r);
        let mut payload = PortPayload::new(Port::Psum, config);
        for slot in plan.psum_slots(config, r) {
            let mut image = ScratchpadImage::default();
            for f in slot.first_filter..slot.first_filter + plan.used_psum_per_pe {
                let value = if filters.contains(&f) {
                    ctx.tensors.bias.get(&[f]).unwrap_or(0)
                } else {
                    0
                };
                image.push(value, 0);
            }
            payload.push(slot.lane, image);
        }
        Ok(payload)
    }
}

pub fn encoder_for(kind: LayerKind) -> Box<dyn StreamEncoder> {
    match kind {
        LayerKind::Conv => Box::new(ConvEncoder),
        LayerKind::DepthwiseConv => Box::new(DepthwiseEncoder),
        LayerKind::Dense => Box::new(DenseEncoder),
    }
}

/// Status and images of repetition `r`; skipped ports stay empty
pub fn encode_repetition(encoder: &dyn StreamEncoder, ctx: &EncodeContext<'_>, r: usize) -> MapResult<RepetitionFrame> {
    let config = ctx.config;
    let status = StatusRegister::for_repetition(config, ctx.plan, ctx.options, ctx.tensors.fraction_bits, r);

    let iact = if status.skip_iact {
        PortPayload::new(Port::Iact, config)
    } else {
        encoder.encode_activations(ctx, r)?
    };
    let wght = if status.skip_wght {
        PortPayload::new(Port::Wght, config)
    } else {
        encoder.encode_weights(ctx, r)?
    };
    let bias = if status.skip_psum {
        PortPayload::new(Port::Psum, config)
    } else {
        encoder.encode_bias(ctx, r)?
    };

    debug!(
        repetition = r,
        iact_images = iact.image_count(),
        wght_images = wght.image_count(),
        bias_images = bias.image_count(),
        "encoded repetition"
    );
    Ok(RepetitionFrame {
        repetition: r,
        status,
        iact,
        wght,
        bias,
    })
}

/// Encode every repetition of a layer, in parallel
pub fn encode_layer(ctx: &EncodeContext<'_>) -> MapResult<Vec<RepetitionFrame>> {
    let encoder = encoder_for(ctx.plan.shape.kind);
    let total = ctx.plan.needed_total_transmissions;
    with_job_limit(ctx.options.max_parallel_jobs, || {
        (0..total)
            .into_par_iter()
            .map(|r| encode_repetition(encoder.as_ref(), ctx, r))
            .collect::<MapResult<Vec<_>>>()
    })?
}

/// Activation images of a spatial layer
///
/// Cycle `k` of the window feeds cluster row offset `k % used_y_cluster` of
/// every group with refresh `k / used_y_cluster`. Line `write * routers +
/// router` of the slot block goes to the router's lane; lines past the
/// receptive field and blocks below the map are sent as empty images.
pub(crate) fn encode_spatial_activations(ctx: &EncodeContext<'_>, r: usize) -> PortPayload {
    let (config, plan) = (ctx.config, ctx.plan);
    let shape = &plan.shape;
    let channels = plan.channel_range(r);
    let refreshes = plan.spatial_refreshes(r);
    let used_y = plan.used_y_cluster;
    let lines = (config.pe_cols - 1) * shape.stride_x + shape.kernel_width;

    let mut payload = PortPayload::new(Port::Iact, config);
    for cycle in 0..plan.refresh_ranges[r].count {
        let offset = cycle % used_y;
        let refresh = refreshes.start + cycle / used_y;
        for cl_x in 0..config.cluster_cols {
            for group in 0..plan.cluster_groups {
                let cl_y = group * used_y + offset;
                if !plan.computing_mask.cluster_active(cl_x, cl_y) {
                    continue;
                }
                let base = plan.slot_base(config, refresh, group, cl_x);
                let (block_y, block_x) = (base / plan.padded_width, base % plan.padded_width);
                for router in 0..config.iact_routers {
                    for write in 0..plan.needed_iact_writes {
                        let line = write * config.iact_routers + router;
                        let image = if block_y >= shape.out_height() || line >= lines {
                            ScratchpadImage::default()
                        } else {
                            activation_line(ctx, channels.clone(), block_y, block_x * shape.stride_x + line)
                        };
                        payload.push(Port::Iact.lane(config, cl_x, cl_y, router), image);
                    }
                }
            }
        }
    }
    payload
}

/// One input column (unpadded column index `column`) across all kernel rows
/// of output row `out_y`, channel by channel
fn activation_line(ctx: &EncodeContext<'_>, channels: Range<usize>, out_y: usize, column: usize) -> ScratchpadImage {
    let shape = &ctx.plan.shape;
    let (pad_y, pad_x) = ctx.plan.kernel_pad;
    let x = column as isize - pad_x as isize;
    let mut image = ScratchpadImage::default();
    let mut position = 0u32;
    for c in channels {
        for ky in 0..shape.kernel_height {
            let y = (out_y * shape.stride_y + ky) as isize - pad_y as isize;
            let value = ctx.tensors.input.get_padded(c, y, x).unwrap_or(PADDING_SENTINEL);
            push_activation(&mut image, ctx.options, value, position);
            position += 1;
        }
        image.end_line();
    }
    image
}

/// Append an activation unless zero skipping drops it; the position keeps
/// counting either way
pub(crate) fn push_activation(image: &mut ScratchpadImage, options: &RunOptions, value: i64, position: u32) {
    if !(options.zero_skip && value == 0) {
        image.push(value, position);
    }
}

/// Append one weight column of `plan.wght_column` entries and its end
/// pointer in transmission words
pub(crate) fn push_weight_column(
    image: &mut ScratchpadImage,
    ctx: &EncodeContext<'_>,
    mut value: impl FnMut(usize) -> Option<i64>,
) {
    let column = ctx.plan.wght_column;
    for entry in 0..column {
        image.push(value(entry).unwrap_or(0), 0);
    }
    let per_word = Port::Wght.values_per_trans(ctx.config);
    image.push_addr(image.data_words.len() / per_word);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::layer::{LayerShape, ModelDescription, LayerSpec, Padding};
    use crate::store::TensorStore;
    use crate::tiling::GeometryPlanner;
    use pretty_assertions::assert_eq;

    /// Planned layer with deterministic tensors
    pub(crate) struct Fixture {
        pub config: AcceleratorConfig,
        pub plan: TilingPlan,
        pub store: TensorStore,
        pub options: RunOptions,
    }

    impl Fixture {
        pub fn new(shape: LayerShape) -> Self {
            let config = AcceleratorConfig::default();
            let plan = GeometryPlanner::new(config.clone()).plan(&shape).unwrap();
            let model = ModelDescription::new(vec![LayerSpec::new(shape)]);
            let mut store = TensorStore::initialize(&model).unwrap();
            let options = RunOptions::default();
            store.quantize(&model, &config, &options).unwrap();
            Self {
                config,
                plan,
                store,
                options,
            }
        }

        pub fn ctx(&self) -> EncodeContext<'_> {
            EncodeContext::new(&self.config, &self.plan, self.store.layer_tensors(0).unwrap(), &self.options).unwrap()
        }
    }

    #[test]
    fn test_activation_lines_carry_padding_sentinel() {
        let mut fx = Fixture::new(LayerShape::conv(4, 4, 1, 1, (3, 3), (1, 1), Padding::Same));
        fx.store.set_input((1..=16).collect()).unwrap();
        let ctx = fx.ctx();
        let payload = encode_spatial_activations(&ctx, 0);

        let lane = &payload.lanes[Port::Iact.lane(&fx.config, 0, 0, 0)];
        assert_eq!(lane.len(), fx.plan.needed_iact_writes);
        let values: Vec<i64> = lane[0].data_words.iter().map(|w| w.value).collect();
        assert_eq!(values, vec![1, 1, 1]);

        let lane = &payload.lanes[Port::Iact.lane(&fx.config, 0, 0, 1)];
        let values: Vec<i64> = lane[0].data_words.iter().map(|w| w.value).collect();
        assert_eq!(values, vec![1, 1, 5]);
        assert_eq!(lane[0].addr_words, vec![3]);

        // second block of the refresh starts at output row 1
        let lane = &payload.lanes[Port::Iact.lane(&fx.config, 1, 0, 2)];
        let values: Vec<i64> = lane[0].data_words.iter().map(|w| w.value).collect();
        assert_eq!(values, vec![2, 6, 10]);

        // line 5 lies right of the map
        let values: Vec<i64> = lane[1].data_words.iter().map(|w| w.value).collect();
        assert_eq!(values, vec![1, 1, 1]);

        // blocks below the map are sent empty
        let lane = &payload.lanes[Port::Iact.lane(&fx.config, 0, 2, 0)];
        assert!(lane.iter().all(ScratchpadImage::is_empty));
    }

    #[test]
    fn test_zero_skip_leaves_position_gaps() {
        let mut fx = Fixture::new(LayerShape::conv(4, 4, 1, 1, (3, 3), (1, 1), Padding::Valid));
        fx.store.set_input(vec![0, 0, 0, 0, 3, 0, 0, 0, 7, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        fx.options.zero_skip = true;
        let ctx = fx.ctx();
        let payload = encode_spatial_activations(&ctx, 0);
        let image = &payload.lanes[Port::Iact.lane(&fx.config, 0, 0, 0)][0];
        assert_eq!(image.addr_words, vec![2]);
        let entries: Vec<(i64, u32)> = image.data_words.iter().map(|w| (w.value, w.overflow)).collect();
        assert_eq!(entries, vec![(3, 1), (7, 2)]);
    }

    #[test]
    fn test_skipped_ports_carry_no_images() {
        let fx = Fixture::new(LayerShape::conv(96, 96, 1, 4, (3, 3), (1, 1), Padding::Same));
        let ctx = fx.ctx();
        let encoder = encoder_for(LayerKind::Conv);
        let first = encode_repetition(encoder.as_ref(), &ctx, 0).unwrap();
        let second = encode_repetition(encoder.as_ref(), &ctx, 1).unwrap();
        assert!(first.wght.image_count() > 0);
        assert!(second.status.skip_wght);
        assert_eq!(second.wght.image_count(), 0);
        assert!(second.iact.image_count() > 0);
        assert!(second.bias.image_count() > 0);
    }

    #[test]
    fn test_bias_only_on_first_channel_group() {
        let fx = Fixture::new(LayerShape::conv(8, 8, 8, 2, (3, 3), (1, 1), Padding::Same));
        let ctx = fx.ctx();
        let frames = encode_layer(&ctx).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].bias.image_count() > 0);
        assert_eq!(frames[1].bias.image_count(), 0);
        assert!(frames[1].status.capture_output);

        let slot = fx.plan.psum_slots(&fx.config, 0)[0];
        let image = &frames[0].bias.lanes[slot.lane][0];
        let expected: Vec<i64> = ctx.tensors.bias.data.clone();
        let values: Vec<i64> = image.data_words.iter().map(|w| w.value).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn test_context_rejects_foreign_tensors() {
        let fx = Fixture::new(LayerShape::dense(8, 3));
        let other = GeometryPlanner::new(fx.config.clone())
            .plan(&LayerShape::dense(9, 3))
            .unwrap();
        let tensors = fx.store.layer_tensors(0).unwrap();
        assert!(EncodeContext::new(&fx.config, &other, tensors, &fx.options).is_err());
    }
}

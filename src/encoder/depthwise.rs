//! Depthwise convolution: one channel per repetition

use super::{encode_spatial_activations, push_weight_column, EncodeContext, StreamEncoder};
use crate::error::MapResult;
use crate::hardware::Port;
use crate::stream::{PortPayload, ScratchpadImage};

/// Depthwise convolution with weights `[channel][ky][kx]`
#[derive(Debug, Clone, Copy, Default)]
pub struct DepthwiseEncoder;

impl StreamEncoder for DepthwiseEncoder {
    fn encode_activations(&self, ctx: &EncodeContext<'_>, r: usize) -> MapResult<PortPayload> {
        Ok(encode_spatial_activations(ctx, r))
    }

    fn encode_weights(&self, ctx: &EncodeContext<'_>, r: usize) -> MapResult<PortPayload> {
        let (config, plan) = (ctx.config, ctx.plan);
        let weights = ctx.tensors.weights;

        let mut payload = PortPayload::new(Port::Wght, config);
        for cl_x in 0..config.cluster_cols {
            for cl_y in 0..config.cluster_rows {
                for pe_y in 0..config.pe_rows {
                    if !plan.computing_mask.pe_row_active(cl_x, cl_y, pe_y) {
                        continue;
                    }
                    let ky = (cl_y % plan.used_y_cluster) * config.pe_rows + pe_y;
                    let mut image = ScratchpadImage::default();
                    for c in plan.channel_range(r) {
                        for kx in 0..plan.shape.kernel_width {
                            push_weight_column(&mut image, ctx, |entry| {
                                (entry == 0).then(|| weights.get(&[c, ky, kx])).flatten()
                            });
                        }
                    }
                    payload.push(Port::Wght.lane(config, cl_x, cl_y, pe_y), image);
                }
            }
        }
        Ok(payload)
    }
}

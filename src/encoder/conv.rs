//! Standard convolution

use super::{encode_spatial_activations, push_weight_column, EncodeContext, StreamEncoder};
use crate::error::MapResult;
use crate::hardware::Port;
use crate::stream::{PortPayload, ScratchpadImage};

/// Convolution with weights `[channel][filter][ky][kx]`
#[derive(Debug, Clone, Copy, Default)]
pub struct ConvEncoder;

impl StreamEncoder for ConvEncoder {
    fn encode_activations(&self, ctx: &EncodeContext<'_>, r: usize) -> MapResult<PortPayload> {
        Ok(encode_spatial_activations(ctx, r))
    }

    /// PE row `pe_y` of cluster row `cl_y` holds kernel row
    /// `(cl_y % used_y) * pe_rows + pe_y`: one column of filter weights per
    /// (channel, kx)
    fn encode_weights(&self, ctx: &EncodeContext<'_>, r: usize) -> MapResult<PortPayload> {
        let (config, plan) = (ctx.config, ctx.plan);
        let kernel_width = plan.shape.kernel_width;
        let channels = plan.channel_range(r);
        let filters = plan.filter_range(r);
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
                    for c in channels.clone() {
                        for kx in 0..kernel_width {
                            push_weight_column(&mut image, ctx, |entry| {
                                let f = filters.start + entry;
                                if f < filters.end {
                                    weights.get(&[c, f, ky, kx])
                                } else {
                                    None
                                }
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

//! Fully connected layers
//!
//! Only PE column 0 computes. PE row `pe_y` of every cluster in column
//! `cl_x` holds input neurons `pe_y * used_iact ..` of the channel group;
//! cluster `cl_y * cluster_cols + cl_x` produces `used_psum` consecutive
//! output neurons.

use super::{push_activation, push_weight_column, EncodeContext, StreamEncoder};
use crate::error::MapResult;
use crate::hardware::Port;
use crate::stream::{PortPayload, ScratchpadImage};

/// Dense layer with weights `[output][input]`
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseEncoder;

impl StreamEncoder for DenseEncoder {
    /// Activations enter at cluster row 0 and are chained down each column
    fn encode_activations(&self, ctx: &EncodeContext<'_>, r: usize) -> MapResult<PortPayload> {
        let (config, plan) = (ctx.config, ctx.plan);
        let inputs = plan.channel_range(r);
        let per_pe = plan.used_iact_per_pe;

        let mut payload = PortPayload::new(Port::Iact, config);
        for cl_x in 0..config.cluster_cols {
            for router in 0..config.iact_routers {
                for write in 0..plan.needed_iact_writes {
                    let row = write * config.iact_routers + router;
                    if row >= config.pe_rows {
                        continue;
                    }
                    let mut image = ScratchpadImage::default();
                    for i in 0..per_pe {
                        let n = inputs.start + row * per_pe + i;
                        let value = if n < inputs.end {
                            ctx.tensors.input.get(&[n]).unwrap_or(0)
                        } else {
                            0
                        };
                        push_activation(&mut image, ctx.options, value, i as u32);
                    }
                    image.end_line();
                    payload.push(Port::Iact.lane(config, cl_x, 0, router), image);
                }
            }
        }
        Ok(payload)
    }

    fn encode_weights(&self, ctx: &EncodeContext<'_>, r: usize) -> MapResult<PortPayload> {
        let (config, plan) = (ctx.config, ctx.plan);
        let inputs = plan.channel_range(r);
        let outputs = plan.filter_range(r);
        let per_pe = plan.used_iact_per_pe;
        let weights = ctx.tensors.weights;

        let mut payload = PortPayload::new(Port::Wght, config);
        for cl_x in 0..config.cluster_cols {
            for cl_y in 0..config.cluster_rows {
                let first = outputs.start + (cl_y * config.cluster_cols + cl_x) * plan.used_psum_per_pe;
                for pe_y in 0..config.pe_rows {
                    let mut image = ScratchpadImage::default();
                    for i in 0..per_pe {
                        let n = inputs.start + pe_y * per_pe + i;
                        push_weight_column(&mut image, ctx, |entry| {
                            let o = first + entry;
                            let real = entry < plan.used_psum_per_pe && o < outputs.end && n < inputs.end;
                            real.then(|| weights.get(&[o, n])).flatten()
                        });
                    }
                    payload.push(Port::Wght.lane(config, cl_x, cl_y, pe_y), image);
                }
            }
        }
        Ok(payload)
    }
}

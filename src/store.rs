//! Quantized tensors of a model run
//!
//! Slot `i` of the feature maps is the input of layer `i`; slot `n_layers`
//! is the output of the last layer. Verified outputs are written back into
//! the next slot so the following layer consumes what the hardware produced.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MapError, MapResult};
use crate::hardware::{AcceleratorConfig, RunOptions};
use crate::layer::{LayerKind, LayerShape, ModelDescription, PoolMode, Pooling};

/// Scale of the fixed-point conversion of float weights and activations
const QUANT_SCALE: f64 = 127.0;

/// Row-major integer tensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<i64>,
}

impl Tensor {
    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![0; shape.iter().product()],
        }
    }

    pub fn from_vec(shape: &[usize], data: Vec<i64>) -> MapResult<Self> {
        let len: usize = shape.iter().product();
        if data.len() != len {
            return Err(MapError::shape(
                format!("{} values for shape {:?}", len, shape),
                format!("{} values", data.len()),
            ));
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn offset(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut offset = 0;
        for (&i, &dim) in index.iter().zip(&self.shape) {
            if i >= dim {
                return None;
            }
            offset = offset * dim + i;
        }
        Some(offset)
    }

    pub fn get(&self, index: &[usize]) -> Option<i64> {
        self.offset(index).map(|o| self.data[o])
    }

    pub fn set(&mut self, index: &[usize], value: i64) -> MapResult<()> {
        let offset = self
            .offset(index)
            .ok_or_else(|| MapError::shape(format!("index inside {:?}", self.shape), format!("{:?}", index)))?;
        self.data[offset] = value;
        Ok(())
    }

    /// Element of a `[c][h][w]` tensor at a possibly negative spatial
    /// position; `None` outside the map
    pub fn get_padded(&self, c: usize, y: isize, x: isize) -> Option<i64> {
        if y < 0 || x < 0 {
            return None;
        }
        self.get(&[c, y as usize, x as usize])
    }

    /// Pool every channel of a `[c][h][w]` tensor
    pub fn pool(&self, pooling: &Pooling) -> MapResult<Self> {
        pooling.validate(&self.shape)?;
        let dims = pooling.output_dims(&self.shape);
        let (window_y, window_x) = pooling.window;
        let (stride_y, stride_x) = pooling.stride;
        let mut data = Vec::with_capacity(dims.iter().product());
        for c in 0..dims[0] {
            for y in 0..dims[1] {
                for x in 0..dims[2] {
                    let window = (0..window_y).flat_map(move |dy| {
                        (0..window_x).filter_map(move |dx| self.get(&[c, y * stride_y + dy, x * stride_x + dx]))
                    });
                    data.push(match pooling.mode {
                        PoolMode::Max => window.max().unwrap_or(0),
                        PoolMode::Average => window.sum::<i64>() / (window_y * window_x) as i64,
                    });
                }
            }
        }
        Tensor::from_vec(&dims, data)
    }

    /// Reinterpret as a vector, keeping CHW order
    pub fn flatten(self) -> Self {
        Self {
            shape: vec![self.data.len()],
            data: self.data,
        }
    }
}

/// Rescaling applied when an observed output becomes the next input
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostScale {
    #[default]
    None,
    /// Arithmetic shift right
    Shift(u32),
    /// Floor division
    Divide(i64),
}

impl PostScale {
    pub fn apply(&self, value: i64) -> i64 {
        match *self {
            PostScale::None => value,
            PostScale::Shift(bits) => value >> bits.min(63),
            PostScale::Divide(divisor) => floor_div(value, divisor),
        }
    }

    fn validate(&self) -> MapResult<()> {
        match self {
            PostScale::Divide(0) => Err(MapError::config("post-scale divisor must not be zero")),
            _ => Ok(()),
        }
    }
}

fn floor_div(value: i64, divisor: i64) -> i64 {
    let quotient = value / divisor;
    if value % divisor != 0 && ((value < 0) != (divisor < 0)) {
        quotient - 1
    } else {
        quotient
    }
}

/// Borrowed view of everything one layer reads
#[derive(Debug, Clone, Copy)]
pub struct LayerTensors<'a> {
    pub shape: &'a LayerShape,
    pub input: &'a Tensor,
    pub weights: &'a Tensor,
    pub bias: &'a Tensor,
    pub fraction_bits: u32,
}

/// Feature maps, weights and biases of one model run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorStore {
    shapes: Vec<LayerShape>,
    pools: Vec<Option<Pooling>>,
    feature_maps: Vec<Tensor>,
    weights: Vec<Tensor>,
    bias: Vec<Tensor>,
    fraction_bits: Vec<u32>,
}

impl TensorStore {
    /// Zero-filled tensors for every layer of the model
    pub fn initialize(model: &ModelDescription) -> MapResult<Self> {
        model.validate()?;
        let shapes: Vec<LayerShape> = model.shapes().cloned().collect();
        let mut feature_maps: Vec<Tensor> = shapes.iter().map(|s| Tensor::zeros(&s.input_dims())).collect();
        if let Some(last) = model.layers.last() {
            feature_maps.push(Tensor::zeros(&last.output_dims()));
        }
        Ok(Self {
            pools: model.layers.iter().map(|l| l.pool).collect(),
            weights: shapes.iter().map(|s| Tensor::zeros(&s.weight_dims())).collect(),
            bias: shapes.iter().map(|s| Tensor::zeros(&s.bias_dims())).collect(),
            fraction_bits: vec![0; shapes.len()],
            feature_maps,
            shapes,
        })
    }

    /// Fill weights, biases and the model input
    ///
    /// Float values are scaled by 127, rounded and clamped to the data width.
    /// Missing values are drawn from a generator seeded with `options.seed`.
    pub fn quantize(&mut self, model: &ModelDescription, config: &AcceleratorConfig, options: &RunOptions) -> MapResult<()> {
        let mut rng = StdRng::seed_from_u64(options.seed);
        let magnitude = options.random_magnitude.max(0);
        let wght_range = data_range(config.wght_data_bits);
        let iact_range = data_range(config.iact_data_bits);
        let psum_range = data_range(config.psum_data_bits);

        for (i, spec) in model.layers.iter().enumerate() {
            match &spec.weights {
                Some(values) => {
                    self.weights[i].data = quantize_values(values, wght_range);
                    self.fraction_bits[i] = fraction_bits(values);
                }
                None => fill_random(&mut self.weights[i], &mut rng, magnitude, wght_range),
            }
            match &spec.bias {
                Some(values) => self.bias[i].data = quantize_values(values, psum_range),
                None => fill_random(&mut self.bias[i], &mut rng, magnitude, psum_range),
            }
            debug!(layer = i, fraction_bits = self.fraction_bits[i], "quantized layer parameters");
        }

        match &model.input {
            Some(values) => self.feature_maps[0].data = quantize_values(values, iact_range),
            None => fill_random(&mut self.feature_maps[0], &mut rng, magnitude, iact_range),
        }
        Ok(())
    }

    pub fn layer_count(&self) -> usize {
        self.shapes.len()
    }

    pub fn layer_tensors(&self, layer: usize) -> MapResult<LayerTensors<'_>> {
        let shape = self
            .shapes
            .get(layer)
            .ok_or_else(|| MapError::invalid_layer(format!("no layer {} in a {}-layer model", layer, self.shapes.len())))?;
        Ok(LayerTensors {
            shape,
            input: &self.feature_maps[layer],
            weights: &self.weights[layer],
            bias: &self.bias[layer],
            fraction_bits: self.fraction_bits[layer],
        })
    }

    pub fn feature_map(&self, slot: usize) -> Option<&Tensor> {
        self.feature_maps.get(slot)
    }

    /// Replace a layer's weights with explicit integer values
    pub fn set_weights(&mut self, layer: usize, data: Vec<i64>) -> MapResult<()> {
        let shape = self.layer_tensors(layer)?.shape.weight_dims();
        self.weights[layer] = Tensor::from_vec(&shape, data)?;
        Ok(())
    }

    pub fn set_bias(&mut self, layer: usize, data: Vec<i64>) -> MapResult<()> {
        let shape = self.layer_tensors(layer)?.shape.bias_dims();
        self.bias[layer] = Tensor::from_vec(&shape, data)?;
        Ok(())
    }

    pub fn set_input(&mut self, data: Vec<i64>) -> MapResult<()> {
        let shape = self.feature_maps[0].shape.clone();
        self.feature_maps[0] = Tensor::from_vec(&shape, data)?;
        Ok(())
    }

    /// Store the observed output of `layer` as the input of the next one
    ///
    /// Values are post-scaled and then saturated to the activation width.
    /// The layer's host pooling step runs next, and a spatial output feeding
    /// a dense layer is flattened last.
    pub fn write_back(
        &mut self,
        config: &AcceleratorConfig,
        layer: usize,
        output: Tensor,
        post_scale: &PostScale,
    ) -> MapResult<()> {
        post_scale.validate()?;
        let shape = self.layer_tensors(layer)?.shape;
        if output.shape != shape.output_dims() {
            return Err(MapError::shape(
                format!("{:?}", shape.output_dims()),
                format!("{:?}", output.shape),
            ));
        }

        let (min, max) = data_range(config.iact_data_bits);
        let mut scaled = Tensor {
            data: output.data.iter().map(|&v| post_scale.apply(v).clamp(min, max)).collect(),
            shape: output.shape,
        };
        if let Some(pooling) = &self.pools[layer] {
            scaled = scaled.pool(pooling)?;
            debug!(layer, pool = %pooling, dims = ?scaled.shape, "pooled layer output");
        }
        if let Some(next) = self.shapes.get(layer + 1) {
            if next.kind == LayerKind::Dense && scaled.shape.len() > 1 {
                scaled = scaled.flatten();
            }
            if scaled.shape != next.input_dims() {
                return Err(MapError::shape(
                    format!("{:?}", next.input_dims()),
                    format!("{:?}", scaled.shape),
                ));
            }
        }
        self.feature_maps[layer + 1] = scaled;
        Ok(())
    }
}

fn data_range(bits: u32) -> (i64, i64) {
    (AcceleratorConfig::min_value(bits), AcceleratorConfig::max_value(bits))
}

fn quantize_values(values: &[f64], (min, max): (i64, i64)) -> Vec<i64> {
    values
        .iter()
        .map(|v| ((v * QUANT_SCALE).round() as i64).clamp(min, max))
        .collect()
}

fn fill_random(tensor: &mut Tensor, rng: &mut StdRng, magnitude: i64, (min, max): (i64, i64)) {
    for value in tensor.data.iter_mut() {
        *value = rng.gen_range(-magnitude..=magnitude).clamp(min, max);
    }
}

/// Fraction bits of a float weight set: `floor(|log2(max |w|)|)`
pub fn fraction_bits(values: &[f64]) -> u32 {
    let peak = values.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    if peak == 0.0 || !peak.is_finite() {
        return 0;
    }
    (peak.log2().abs().floor() as u32).min(31)
}

//! Layer shapes and model descriptions
//!
//! A [`LayerShape`] carries everything the planner needs to know about one
//! layer. Tensor layouts used throughout the crate:
//!
//! - feature maps: `[channels][height][width]`, or `[neurons]` for dense
//! - conv weights: `[in_channels][filters][kernel_height][kernel_width]`
//! - depthwise weights: `[channels][kernel_height][kernel_width]`
//! - dense weights: `[outputs][inputs]`
//! - bias: one value per output channel or neuron

use serde::{Deserialize, Serialize};

use crate::error::{MapError, MapResult};

/// Layer kinds the accelerator can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    Conv,
    DepthwiseConv,
    Dense,
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerKind::Conv => write!(f, "conv"),
            LayerKind::DepthwiseConv => write!(f, "depthwise"),
            LayerKind::Dense => write!(f, "dense"),
        }
    }
}

/// Spatial padding mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Padding {
    /// Output size is ceil(input / stride); out-of-range taps read the sentinel
    Same,
    /// Only windows fully inside the input
    Valid,
}

/// Shape of one layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerShape {
    pub kind: LayerKind,
    pub kernel_height: usize,
    pub kernel_width: usize,
    pub stride_y: usize,
    pub stride_x: usize,
    pub padding: Padding,
    pub in_channels: usize,
    pub in_height: usize,
    pub in_width: usize,
    /// Output channels; equals `in_channels` for depthwise, output neurons for dense
    pub filters: usize,
}

impl LayerShape {
    #[allow(clippy::too_many_arguments)]
    pub fn conv(
        in_height: usize,
        in_width: usize,
        in_channels: usize,
        filters: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: Padding,
    ) -> Self {
        Self {
            kind: LayerKind::Conv,
            kernel_height: kernel.0,
            kernel_width: kernel.1,
            stride_y: stride.0,
            stride_x: stride.1,
            padding,
            in_channels,
            in_height,
            in_width,
            filters,
        }
    }

    pub fn depthwise(
        in_height: usize,
        in_width: usize,
        channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: Padding,
    ) -> Self {
        Self {
            kind: LayerKind::DepthwiseConv,
            kernel_height: kernel.0,
            kernel_width: kernel.1,
            stride_y: stride.0,
            stride_x: stride.1,
            padding,
            in_channels: channels,
            in_height,
            in_width,
            filters: channels,
        }
    }

    pub fn dense(inputs: usize, outputs: usize) -> Self {
        Self {
            kind: LayerKind::Dense,
            kernel_height: 1,
            kernel_width: 1,
            stride_y: 1,
            stride_x: 1,
            padding: Padding::Valid,
            in_channels: inputs,
            in_height: 1,
            in_width: 1,
            filters: outputs,
        }
    }

    /// Check the shape is internally consistent
    pub fn validate(&self) -> MapResult<()> {
        let fields = [
            ("kernel_height", self.kernel_height),
            ("kernel_width", self.kernel_width),
            ("stride_y", self.stride_y),
            ("stride_x", self.stride_x),
            ("in_channels", self.in_channels),
            ("in_height", self.in_height),
            ("in_width", self.in_width),
            ("filters", self.filters),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(MapError::invalid_layer(format!("{} must be positive", name)));
            }
        }

        match self.kind {
            LayerKind::Dense => {
                if self.in_height != 1 || self.in_width != 1 || self.kernel_height != 1 || self.kernel_width != 1 {
                    return Err(MapError::invalid_layer("dense layers have no spatial extent"));
                }
            }
            LayerKind::DepthwiseConv if self.filters != self.in_channels => {
                return Err(MapError::invalid_layer(format!(
                    "depthwise layer has {} channels but {} filters",
                    self.in_channels, self.filters
                )));
            }
            _ => {}
        }

        if self.padding == Padding::Valid
            && (self.kernel_height > self.in_height || self.kernel_width > self.in_width)
        {
            return Err(MapError::invalid_layer(format!(
                "{}x{} kernel does not fit a {}x{} input without padding",
                self.kernel_height, self.kernel_width, self.in_height, self.in_width
            )));
        }
        Ok(())
    }

    pub fn out_height(&self) -> usize {
        out_extent(self.in_height, self.kernel_height, self.stride_y, self.padding)
    }

    pub fn out_width(&self) -> usize {
        out_extent(self.in_width, self.kernel_width, self.stride_x, self.padding)
    }

    /// Output spatial positions per channel
    pub fn output_positions(&self) -> usize {
        self.out_height() * self.out_width()
    }

    /// Padding before the first row and column, (top, left)
    ///
    /// Same padding is `ceil((k - 1) / 2)` whatever the stride.
    pub fn kernel_pad(&self) -> (usize, usize) {
        match self.padding {
            Padding::Valid => (0, 0),
            Padding::Same => ((self.kernel_height - 1).div_ceil(2), (self.kernel_width - 1).div_ceil(2)),
        }
    }

    pub fn input_dims(&self) -> Vec<usize> {
        match self.kind {
            LayerKind::Dense => vec![self.in_channels],
            _ => vec![self.in_channels, self.in_height, self.in_width],
        }
    }

    pub fn output_dims(&self) -> Vec<usize> {
        match self.kind {
            LayerKind::Dense => vec![self.filters],
            _ => vec![self.filters, self.out_height(), self.out_width()],
        }
    }

    pub fn weight_dims(&self) -> Vec<usize> {
        match self.kind {
            LayerKind::Conv => vec![self.in_channels, self.filters, self.kernel_height, self.kernel_width],
            LayerKind::DepthwiseConv => vec![self.in_channels, self.kernel_height, self.kernel_width],
            LayerKind::Dense => vec![self.filters, self.in_channels],
        }
    }

    pub fn bias_dims(&self) -> Vec<usize> {
        vec![self.filters]
    }
}

fn out_extent(input: usize, kernel: usize, stride: usize, padding: Padding) -> usize {
    match padding {
        Padding::Same => input.div_ceil(stride),
        Padding::Valid => (input.saturating_sub(kernel)) / stride + 1,
    }
}

impl std::fmt::Display for LayerShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            LayerKind::Dense => write!(f, "dense {} -> {}", self.in_channels, self.filters),
            _ => write!(
                f,
                "{} {}x{}/{}x{} {}x{}x{} -> {}x{}x{} ({:?})",
                self.kind,
                self.kernel_height,
                self.kernel_width,
                self.stride_y,
                self.stride_x,
                self.in_height,
                self.in_width,
                self.in_channels,
                self.out_height(),
                self.out_width(),
                self.filters,
                self.padding,
            ),
        }
    }
}

/// Reduction of a host pooling step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolMode {
    /// Mean of the window, truncated toward zero
    Average,
    Max,
}

/// Pooling done on the host between two accelerator layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pooling {
    pub mode: PoolMode,
    /// (height, width)
    pub window: (usize, usize),
    /// (y, x)
    pub stride: (usize, usize),
}

impl Pooling {
    pub fn new(mode: PoolMode, window: (usize, usize), stride: (usize, usize)) -> Self {
        Self { mode, window, stride }
    }

    /// Check the pool against the `[c][h][w]` map it reduces
    pub fn validate(&self, dims: &[usize]) -> MapResult<()> {
        if self.window.0 == 0 || self.window.1 == 0 || self.stride.0 == 0 || self.stride.1 == 0 {
            return Err(MapError::invalid_layer("pool window and stride must be positive"));
        }
        match dims {
            [_, h, w] if self.window.0 <= *h && self.window.1 <= *w => Ok(()),
            [_, h, w] => Err(MapError::invalid_layer(format!(
                "{}x{} pool window does not fit a {}x{} map",
                self.window.0, self.window.1, h, w
            ))),
            _ => Err(MapError::invalid_layer(format!("cannot pool a {:?} tensor", dims))),
        }
    }

    /// Dims of the pooled map; only windows fully inside the input count
    pub fn output_dims(&self, dims: &[usize]) -> Vec<usize> {
        match dims {
            [c, h, w] => vec![
                *c,
                h.saturating_sub(self.window.0) / self.stride.0 + 1,
                w.saturating_sub(self.window.1) / self.stride.1 + 1,
            ],
            other => other.to_vec(),
        }
    }
}

impl std::fmt::Display for Pooling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.mode {
            PoolMode::Average => "avgpool",
            PoolMode::Max => "maxpool",
        };
        write!(
            f,
            "{} {}x{}/{}x{}",
            name, self.window.0, self.window.1, self.stride.0, self.stride.1
        )
    }
}

/// One layer of a model with optional floating point parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub shape: LayerShape,
    /// Flattened in the layout of [`LayerShape::weight_dims`]
    #[serde(default)]
    pub weights: Option<Vec<f64>>,
    #[serde(default)]
    pub bias: Option<Vec<f64>>,
    /// Applied on the host to the verified output before the next layer
    #[serde(default)]
    pub pool: Option<Pooling>,
}

impl LayerSpec {
    pub fn new(shape: LayerShape) -> Self {
        Self {
            shape,
            weights: None,
            bias: None,
            pool: None,
        }
    }

    pub fn with_pool(mut self, pool: Pooling) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Dims handed to the next layer, after pooling
    pub fn output_dims(&self) -> Vec<usize> {
        let dims = self.shape.output_dims();
        match &self.pool {
            Some(pool) => pool.output_dims(&dims),
            None => dims,
        }
    }
}

/// A chain of layers, each consuming the previous layer's output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelDescription {
    pub layers: Vec<LayerSpec>,
    /// Layer-0 activations in [-1, 1); random test data when absent
    #[serde(default)]
    pub input: Option<Vec<f64>>,
}

impl ModelDescription {
    pub fn new(layers: Vec<LayerSpec>) -> Self {
        Self { layers, input: None }
    }

    pub fn from_json(json: &str) -> MapResult<Self> {
        let model: Self = serde_json::from_str(json)?;
        model.validate()?;
        Ok(model)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn shapes(&self) -> impl Iterator<Item = &LayerShape> {
        self.layers.iter().map(|l| &l.shape)
    }

    /// Check every layer and that consecutive layers chain
    pub fn validate(&self) -> MapResult<()> {
        if self.layers.is_empty() {
            return Err(MapError::invalid_layer("model has no layers"));
        }
        for layer in &self.layers {
            layer.shape.validate()?;
            check_len("weights", layer.weights.as_deref(), &layer.shape.weight_dims())?;
            check_len("bias", layer.bias.as_deref(), &layer.shape.bias_dims())?;
            if let Some(pool) = &layer.pool {
                pool.validate(&layer.shape.output_dims())?;
            }
        }
        check_len("input", self.input.as_deref(), &self.layers[0].shape.input_dims())?;

        for pair in self.layers.windows(2) {
            let produced = pair[0].output_dims();
            let consumed = pair[1].shape.input_dims();
            let chains = match pair[1].shape.kind {
                LayerKind::Dense => produced.iter().product::<usize>() == consumed[0],
                _ => produced == consumed,
            };
            if !chains {
                return Err(MapError::shape(
                    format!("{:?} for {}", consumed, pair[1].shape),
                    format!("{:?} from {}", produced, pair[0].shape),
                ));
            }
        }
        Ok(())
    }
}

fn check_len(what: &str, values: Option<&[f64]>, dims: &[usize]) -> MapResult<()> {
    let expected: usize = dims.iter().product();
    match values {
        Some(values) if values.len() != expected => Err(MapError::shape(
            format!("{} {} values {:?}", expected, what, dims),
            format!("{} values", values.len()),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_padding_shapes() {
        let shape = LayerShape::conv(8, 8, 4, 8, (3, 3), (1, 1), Padding::Same);
        assert_eq!(shape.out_height(), 8);
        assert_eq!(shape.out_width(), 8);
        assert_eq!(shape.kernel_pad(), (1, 1));

        let strided = LayerShape::conv(8, 8, 4, 8, (3, 3), (2, 2), Padding::Same);
        assert_eq!(strided.out_width(), 4);
        assert_eq!(strided.kernel_pad(), (1, 1));

        let even = LayerShape::conv(8, 8, 1, 1, (8, 4), (1, 1), Padding::Same);
        assert_eq!(even.kernel_pad(), (4, 2));
    }

    #[test]
    fn test_valid_padding_shapes() {
        let shape = LayerShape::conv(4, 4, 1, 1, (3, 3), (1, 1), Padding::Valid);
        assert_eq!(shape.output_dims(), vec![1, 2, 2]);
        assert_eq!(shape.kernel_pad(), (0, 0));
    }

    #[test]
    fn test_dims_per_kind() {
        let dw = LayerShape::depthwise(6, 6, 3, (3, 3), (1, 1), Padding::Same);
        assert_eq!(dw.weight_dims(), vec![3, 3, 3]);
        assert_eq!(dw.output_dims(), vec![3, 6, 6]);

        let dense = LayerShape::dense(64, 10);
        assert_eq!(dense.input_dims(), vec![64]);
        assert_eq!(dense.weight_dims(), vec![10, 64]);
        assert_eq!(dense.output_positions(), 1);
    }

    #[test]
    fn test_validate_rejects_bad_depthwise() {
        let mut dw = LayerShape::depthwise(6, 6, 3, (3, 3), (1, 1), Padding::Same);
        dw.filters = 4;
        assert!(matches!(dw.validate(), Err(MapError::InvalidLayer { .. })));
    }

    #[test]
    fn test_model_chain_flattens_into_dense() {
        let model = ModelDescription::new(vec![
            LayerSpec::new(LayerShape::conv(4, 4, 1, 2, (3, 3), (1, 1), Padding::Same)),
            LayerSpec::new(LayerShape::dense(32, 10)),
        ]);
        assert!(model.validate().is_ok());

        let broken = ModelDescription::new(vec![
            LayerSpec::new(LayerShape::conv(4, 4, 1, 2, (3, 3), (1, 1), Padding::Same)),
            LayerSpec::new(LayerShape::conv(4, 4, 3, 2, (3, 3), (1, 1), Padding::Same)),
        ]);
        assert!(matches!(broken.validate(), Err(MapError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_pool_changes_chained_dims() {
        let pool = Pooling::new(PoolMode::Max, (2, 2), (2, 2));
        let conv = LayerSpec::new(LayerShape::conv(8, 8, 1, 4, (3, 3), (1, 1), Padding::Same)).with_pool(pool);
        assert_eq!(conv.output_dims(), vec![4, 4, 4]);

        let model = ModelDescription::new(vec![conv.clone(), LayerSpec::new(LayerShape::dense(64, 10))]);
        assert!(model.validate().is_ok());

        let unpooled = ModelDescription::new(vec![conv, LayerSpec::new(LayerShape::dense(256, 10))]);
        assert!(matches!(unpooled.validate(), Err(MapError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_pool_rejects_dense_and_oversized_windows() {
        let dense = LayerSpec::new(LayerShape::dense(8, 4)).with_pool(Pooling::new(PoolMode::Average, (2, 2), (2, 2)));
        assert!(matches!(
            ModelDescription::new(vec![dense]).validate(),
            Err(MapError::InvalidLayer { .. })
        ));

        let wide = Pooling::new(PoolMode::Max, (5, 5), (1, 1));
        let conv = LayerSpec::new(LayerShape::conv(4, 4, 1, 1, (3, 3), (1, 1), Padding::Same)).with_pool(wide);
        assert!(ModelDescription::new(vec![conv]).validate().is_err());
    }

    #[test]
    fn test_model_json_round_trip() {
        let mut layer = LayerSpec::new(LayerShape::dense(2, 1));
        layer.weights = Some(vec![0.5, -0.25]);
        let model = ModelDescription::new(vec![layer]);
        let json = model.to_json().unwrap();
        let parsed = ModelDescription::from_json(&json).unwrap();
        assert_eq!(parsed, model);
    }
}

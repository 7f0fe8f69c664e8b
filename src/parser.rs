//! Parser for the layer description language
//!
//! Parses model descriptions like:
//! - `conv(in=28x28x1, filters=8, kernel=3, stride=1, padding=same)`
//! - `depthwise(in=14x14x8, kernel=3x3, stride=2)`
//! - `maxpool(window=2)` or `avgpool(window=3x3, stride=2)`
//! - `dense(in=392, out=10)`
//!
//! Layers are separated by `;`. Spatial inputs are written height x width x
//! channels. Kernel, window and stride accept either one number or `HxW`.
//! A pool statement attaches to the layer before it; its stride defaults to
//! the window.

use crate::error::{MapError, MapResult};
use crate::layer::{LayerKind, LayerShape, LayerSpec, ModelDescription, Padding, PoolMode, Pooling};
use crate::lexer::{Lexer, Token};

/// Parser for layer descriptions
pub struct Parser<'source> {
    lexer: Lexer<'source>,
    current: Option<Token>,
    error_at: Option<usize>,
}

/// A `key=value` argument inside a layer call
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Number(usize),
    Dims(Vec<usize>),
    Word(String),
}

/// One `;`-separated statement
enum Statement {
    Layer(LayerSpec),
    Pool(Pooling),
}

impl<'source> Parser<'source> {
    pub fn new(source: &'source str) -> Self {
        let mut parser = Self {
            lexer: Lexer::new(source),
            current: None,
            error_at: None,
        };
        parser.advance();
        parser
    }

    /// Advance to the next token
    fn advance(&mut self) -> Option<Token> {
        let prev = self.current.take();
        self.current = match self.lexer.next() {
            Some(Ok(tok)) => Some(tok),
            Some(Err(())) => {
                self.error_at.get_or_insert(self.lexer.span().start);
                None
            }
            None => None,
        };
        prev
    }

    /// Check if current token has the same kind as expected
    fn check(&self, expected: &Token) -> bool {
        match &self.current {
            Some(tok) => std::mem::discriminant(tok) == std::mem::discriminant(expected),
            None => false,
        }
    }

    /// Consume token if it matches, otherwise error
    fn expect(&mut self, expected: Token) -> MapResult<Token> {
        self.lexer_error()?;
        match self.advance() {
            Some(tok) if std::mem::discriminant(&tok) == std::mem::discriminant(&expected) => Ok(tok),
            other => Err(MapError::parse_error(format!(
                "Expected '{}', got {}",
                expected,
                describe(other.as_ref())
            ))),
        }
    }

    fn lexer_error(&self) -> MapResult<()> {
        match self.error_at {
            Some(position) => Err(MapError::LexerError {
                position,
                message: "unrecognised character".to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Parse a complete model (layers separated by semicolons)
    pub fn parse_model(&mut self) -> MapResult<ModelDescription> {
        let mut layers = Vec::new();

        while self.current.is_some() {
            match self.parse_statement()? {
                Statement::Layer(layer) => layers.push(layer),
                Statement::Pool(pool) => {
                    let layer = layers
                        .last_mut()
                        .ok_or_else(|| MapError::parse_error(format!("'{}' must follow a layer", pool)))?;
                    if layer.pool.replace(pool).is_some() {
                        return Err(MapError::parse_error("A layer takes at most one pool"));
                    }
                }
            }

            if self.check(&Token::Semicolon) {
                self.advance();
            } else if self.current.is_some() {
                return Err(MapError::parse_error(format!(
                    "Expected ';' between layers, got {}",
                    describe(self.current.as_ref())
                )));
            }
        }
        self.lexer_error()?;

        let model = ModelDescription::new(layers);
        model.validate()?;
        Ok(model)
    }

    /// Parse one call: `kind(key=value, ...)`
    fn parse_statement(&mut self) -> MapResult<Statement> {
        let name = match self.advance() {
            Some(Token::Ident(name)) => name,
            other => {
                self.lexer_error()?;
                return Err(MapError::parse_error(format!(
                    "Expected layer kind, got {}",
                    describe(other.as_ref())
                )));
            }
        };

        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        while !self.check(&Token::RParen) {
            args.push(self.parse_arg()?);
            if self.check(&Token::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(Token::RParen)?;

        match pool_mode(&name) {
            Some(mode) => build_pool(mode, &args).map(Statement::Pool),
            None => build_layer(layer_kind(&name)?, &args).map(|shape| Statement::Layer(LayerSpec::new(shape))),
        }
    }

    fn parse_arg(&mut self) -> MapResult<(String, Value)> {
        let key = match self.advance() {
            Some(Token::Ident(key)) => key,
            other => {
                self.lexer_error()?;
                return Err(MapError::parse_error(format!(
                    "Expected argument name, got {}",
                    describe(other.as_ref())
                )));
            }
        };
        self.expect(Token::Equals)?;
        let value = match self.advance() {
            Some(Token::Number(n)) => Value::Number(n),
            Some(Token::Dims(dims)) => Value::Dims(dims),
            Some(Token::Ident(word)) => Value::Word(word),
            other => {
                self.lexer_error()?;
                return Err(MapError::parse_error(format!(
                    "Expected value for '{}', got {}",
                    key,
                    describe(other.as_ref())
                )));
            }
        };
        Ok((key, value))
    }
}

fn describe(token: Option<&Token>) -> String {
    match token {
        Some(tok) => format!("'{}'", tok),
        None => "end of input".to_string(),
    }
}

fn layer_kind(name: &str) -> MapResult<LayerKind> {
    match name {
        "conv" | "conv2d" => Ok(LayerKind::Conv),
        "depthwise" | "dwconv" => Ok(LayerKind::DepthwiseConv),
        "dense" | "fc" => Ok(LayerKind::Dense),
        other => Err(MapError::parse_error(format!("Unknown layer kind '{}'", other))),
    }
}

fn pool_mode(name: &str) -> Option<PoolMode> {
    match name {
        "maxpool" => Some(PoolMode::Max),
        "avgpool" => Some(PoolMode::Average),
        _ => None,
    }
}

fn build_pool(mode: PoolMode, args: &[(String, Value)]) -> MapResult<Pooling> {
    let find = |key: &str| args.iter().find(|(k, _)| k == key).map(|(_, v)| v);
    if let Some((key, _)) = args.iter().find(|(k, _)| !matches!(k.as_str(), "window" | "stride")) {
        return Err(MapError::parse_error(format!("Unknown argument '{}' for pool", key)));
    }
    let window = pair(find("window"), "window", 2)?;
    let stride = match find("stride") {
        None => window,
        value => pair(value, "stride", 1)?,
    };
    Ok(Pooling::new(mode, window, stride))
}

fn build_layer(kind: LayerKind, args: &[(String, Value)]) -> MapResult<LayerShape> {
    let find = |key: &str| args.iter().find(|(k, _)| k == key).map(|(_, v)| v);

    for (key, _) in args {
        let known = match kind {
            LayerKind::Dense => matches!(key.as_str(), "in" | "out"),
            LayerKind::Conv => matches!(key.as_str(), "in" | "filters" | "kernel" | "stride" | "padding"),
            LayerKind::DepthwiseConv => matches!(key.as_str(), "in" | "kernel" | "stride" | "padding"),
        };
        if !known {
            return Err(MapError::parse_error(format!("Unknown argument '{}' for {}", key, kind)));
        }
    }

    let shape = match kind {
        LayerKind::Dense => {
            let inputs = number(find("in"), "in")?;
            let outputs = number(find("out"), "out")?;
            LayerShape::dense(inputs, outputs)
        }
        LayerKind::Conv | LayerKind::DepthwiseConv => {
            let (height, width, channels) = match find("in") {
                Some(Value::Dims(d)) if d.len() == 3 => (d[0], d[1], d[2]),
                _ => return Err(MapError::parse_error("'in' must be HxWxC")),
            };
            let kernel = pair(find("kernel"), "kernel", 3)?;
            let stride = pair(find("stride"), "stride", 1)?;
            let padding = match find("padding") {
                None => Padding::Same,
                Some(Value::Word(w)) if w == "same" => Padding::Same,
                Some(Value::Word(w)) if w == "valid" => Padding::Valid,
                Some(_) => return Err(MapError::parse_error("'padding' must be same or valid")),
            };
            if kind == LayerKind::Conv {
                let filters = number(find("filters"), "filters")?;
                LayerShape::conv(height, width, channels, filters, kernel, stride, padding)
            } else {
                LayerShape::depthwise(height, width, channels, kernel, stride, padding)
            }
        }
    };
    shape.validate()?;
    Ok(shape)
}

fn number(value: Option<&Value>, key: &str) -> MapResult<usize> {
    match value {
        Some(Value::Number(n)) => Ok(*n),
        Some(_) => Err(MapError::parse_error(format!("'{}' must be a number", key))),
        None => Err(MapError::parse_error(format!("Missing argument '{}'", key))),
    }
}

fn pair(value: Option<&Value>, key: &str, default: usize) -> MapResult<(usize, usize)> {
    match value {
        None => Ok((default, default)),
        Some(Value::Number(n)) => Ok((*n, *n)),
        Some(Value::Dims(d)) if d.len() == 2 => Ok((d[0], d[1])),
        Some(_) => Err(MapError::parse_error(format!("'{}' must be N or HxW", key))),
    }
}

/// Parse a model description from source text
pub fn parse_model(source: &str) -> MapResult<ModelDescription> {
    Parser::new(source).parse_model()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_conv() {
        let model = parse_model("conv(in=8x8x4, filters=8, kernel=3, stride=1, padding=same)").unwrap();
        assert_eq!(model.layers.len(), 1);
        assert_eq!(
            model.layers[0].shape,
            LayerShape::conv(8, 8, 4, 8, (3, 3), (1, 1), Padding::Same)
        );
    }

    #[test]
    fn test_parse_chain_with_defaults() {
        let source = "
            conv2d(in=4x4x1, filters=2);
            dwconv(in=4x4x2, kernel=3x3, padding=same);
            fc(in=32, out=10);
        ";
        let model = parse_model(source).unwrap();
        let kinds: Vec<_> = model.shapes().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![LayerKind::Conv, LayerKind::DepthwiseConv, LayerKind::Dense]);
        assert_eq!(model.layers[0].shape.kernel_width, 3);
        assert_eq!(model.layers[2].shape, LayerShape::dense(32, 10));
    }

    #[test]
    fn test_unknown_kind() {
        let err = parse_model("lstm(in=4)").unwrap_err();
        assert!(matches!(err, MapError::ParseError { .. }));
    }

    #[test]
    fn test_parse_pools() {
        let source = "
            conv(in=8x8x1, filters=4, kernel=3);
            maxpool(window=2);
            conv(in=4x4x4, filters=2, kernel=3);
            avgpool(window=3x3, stride=1);
            dense(in=8, out=3)
        ";
        let model = parse_model(source).unwrap();
        assert_eq!(model.layers.len(), 3);
        assert_eq!(model.layers[0].pool, Some(Pooling::new(PoolMode::Max, (2, 2), (2, 2))));
        assert_eq!(model.layers[1].pool, Some(Pooling::new(PoolMode::Average, (3, 3), (1, 1))));
        assert_eq!(model.layers[1].output_dims(), vec![2, 2, 2]);
        assert_eq!(model.layers[2].pool, None);
    }

    #[test]
    fn test_pool_placement_errors() {
        let err = parse_model("maxpool(window=2); dense(in=4, out=2)").unwrap_err();
        assert!(err.to_string().contains("must follow a layer"));

        let err = parse_model("conv(in=8x8x1, filters=1); maxpool(window=2); avgpool(window=2)").unwrap_err();
        assert!(err.to_string().contains("at most one pool"));

        let err = parse_model("conv(in=8x8x1, filters=1); maxpool(size=2)").unwrap_err();
        assert!(err.to_string().contains("Unknown argument 'size'"));

        // pooling a vector is rejected by model validation
        let err = parse_model("dense(in=8, out=4); maxpool(window=2)").unwrap_err();
        assert!(matches!(err, MapError::InvalidLayer { .. }));
    }

    #[test]
    fn test_unknown_argument() {
        let err = parse_model("dense(in=4, out=2, kernel=3)").unwrap_err();
        assert!(err.to_string().contains("Unknown argument 'kernel'"));
    }

    #[test]
    fn test_missing_separator() {
        let err = parse_model("dense(in=4, out=2) dense(in=2, out=1)").unwrap_err();
        assert!(err.to_string().contains("Expected ';'"));
    }

    #[test]
    fn test_lexer_error_position() {
        let err = parse_model("dense(in=4, out=2) $").unwrap_err();
        assert!(matches!(err, MapError::LexerError { position: 19, .. }));
    }

    #[test]
    fn test_chain_mismatch_is_reported() {
        let err = parse_model("dense(in=4, out=2); dense(in=3, out=1)").unwrap_err();
        assert!(matches!(err, MapError::ShapeMismatch { .. }));
    }
}

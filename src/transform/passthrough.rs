//! Identity transform
//!
//! Stores the upload byte-for-byte. Used for non-image uploads and whenever
//! variants are only a naming concern.

use super::{
    OutputFormat, TransformError, TransformFactory, TransformOptions, TransformStream,
    Transformer, VariantSpec,
};
use crate::upload::ByteStream;

/// Factory for identity transforms
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl TransformFactory for PassThrough {
    fn create(
        &self,
        _options: &TransformOptions,
        _variant: Option<&VariantSpec>,
    ) -> Result<Box<dyn Transformer>, TransformError> {
        Ok(Box::new(PassThroughTransformer))
    }
}

struct PassThroughTransformer;

impl Transformer for PassThroughTransformer {
    fn output_format(&self) -> Option<OutputFormat> {
        None
    }

    fn transform(self: Box<Self>, input: ByteStream) -> TransformStream {
        TransformStream {
            output: input,
            info: None,
        }
    }
}

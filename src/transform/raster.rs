//! Raster image transforms
//!
//! Resizes and re-encodes images with the `image` crate. Decoding needs the
//! whole file, so the input is buffered (bounded by `max_input_bytes`) and the
//! CPU-heavy work runs on the blocking pool.
//!
//! Without a variant or global format the output keeps the detected source
//! format, but no format is declared up front, so the stored content type
//! stays whatever mimetype the client sent.

use super::{
    Fit, OutputFormat, TransformError, TransformFactory, TransformInfo, TransformOptions,
    TransformStream, Transformer, VariantSpec,
};
use crate::upload::ByteStream;
use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::{self, Cursor};
use tokio::sync::oneshot;

/// Factory for image resize/re-encode transforms
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageTransforms;

impl TransformFactory for ImageTransforms {
    fn create(
        &self,
        options: &TransformOptions,
        variant: Option<&VariantSpec>,
    ) -> Result<Box<dyn Transformer>, TransformError> {
        let width = variant.and_then(|v| v.width);
        let height = variant.and_then(|v| v.height);
        if width == Some(0) || height == Some(0) {
            return Err(TransformError::InvalidParams(
                "width and height must be greater than zero".into(),
            ));
        }

        Ok(Box::new(ImageTransformer {
            params: RenderParams {
                width,
                height,
                fit: options.fit,
                format: options.format_for(variant),
                quality: options.quality_for(variant),
                max_input_bytes: options.max_input_bytes,
            },
        }))
    }
}

#[derive(Debug, Clone, Copy)]
struct RenderParams {
    width: Option<u32>,
    height: Option<u32>,
    fit: Fit,
    format: Option<OutputFormat>,
    quality: u8,
    max_input_bytes: usize,
}

struct ImageTransformer {
    params: RenderParams,
}

impl Transformer for ImageTransformer {
    fn output_format(&self) -> Option<OutputFormat> {
        self.params.format
    }

    fn transform(self: Box<Self>, input: ByteStream) -> TransformStream {
        let params = self.params;
        let (info_tx, info_rx) = oneshot::channel();

        let output = stream::once(async move {
            let data = read_limited(input, params.max_input_bytes).await?;
            let (encoded, info) = tokio::task::spawn_blocking(move || render(&data, &params))
                .await
                .map_err(io::Error::other)??;
            let _ = info_tx.send(info);
            Ok::<_, io::Error>(encoded)
        })
        .boxed();

        TransformStream {
            output,
            info: Some(info_rx),
        }
    }
}

async fn read_limited(mut input: ByteStream, limit: usize) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    while let Some(chunk) = input.try_next().await? {
        if data.len() + chunk.len() > limit {
            return Err(TransformError::InputTooLarge { limit }.into());
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

fn render(data: &[u8], params: &RenderParams) -> Result<(Bytes, TransformInfo), TransformError> {
    let source_format = image::guess_format(data)
        .map_err(|e| TransformError::ProcessingFailed(format!("unrecognised image: {e}")))?;
    let img = image::load_from_memory_with_format(data, source_format)
        .map_err(|e| TransformError::ProcessingFailed(format!("decode failed: {e}")))?;

    let img = resize(img, params);
    let format = params
        .format
        .or_else(|| output_format_of(source_format))
        .unwrap_or(OutputFormat::Png);
    let encoded = encode(&img, format, params.quality)?;

    let info = TransformInfo {
        width: img.width(),
        height: img.height(),
        format,
        size: encoded.len(),
    };
    Ok((Bytes::from(encoded), info))
}

fn resize(img: DynamicImage, params: &RenderParams) -> DynamicImage {
    let filter = FilterType::Lanczos3;
    match (params.width, params.height) {
        (None, None) => img,
        (Some(w), None) => img.resize(w, u32::MAX, filter),
        (None, Some(h)) => img.resize(u32::MAX, h, filter),
        (Some(w), Some(h)) => match params.fit {
            Fit::Inside => img.resize(w, h, filter),
            Fit::Fill => img.resize_exact(w, h, filter),
            Fit::Cover => img.resize_to_fill(w, h, filter),
        },
    }
}

fn output_format_of(format: ImageFormat) -> Option<OutputFormat> {
    match format {
        ImageFormat::Jpeg => Some(OutputFormat::Jpeg),
        ImageFormat::Png => Some(OutputFormat::Png),
        ImageFormat::WebP => Some(OutputFormat::WebP),
        ImageFormat::Gif => Some(OutputFormat::Gif),
        _ => None,
    }
}

fn encode(img: &DynamicImage, format: OutputFormat, quality: u8) -> Result<Vec<u8>, TransformError> {
    let mut buf = Cursor::new(Vec::new());

    match format {
        OutputFormat::Jpeg => {
            let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
            img.to_rgb8()
                .write_with_encoder(encoder)
                .map_err(|e| TransformError::ProcessingFailed(format!("JPEG encode failed: {e}")))?;
        }
        OutputFormat::Png => {
            img.write_to(&mut buf, ImageFormat::Png)
                .map_err(|e| TransformError::ProcessingFailed(format!("PNG encode failed: {e}")))?;
        }
        OutputFormat::WebP => {
            // lossless only, quality does not apply
            let encoder = WebPEncoder::new_lossless(&mut buf);
            img.to_rgba8()
                .write_with_encoder(encoder)
                .map_err(|e| TransformError::ProcessingFailed(format!("WebP encode failed: {e}")))?;
        }
        OutputFormat::Gif => {
            DynamicImage::ImageRgba8(img.to_rgba8())
                .write_to(&mut buf, ImageFormat::Gif)
                .map_err(|e| TransformError::ProcessingFailed(format!("GIF encode failed: {e}")))?;
        }
    }

    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(width: u32, height: u32) -> Bytes {
        let img = DynamicImage::new_rgb8(width, height);
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        Bytes::from(buf.into_inner())
    }

    fn input(data: Bytes) -> ByteStream {
        // split to make sure the transform reassembles chunks
        let mid = data.len() / 2;
        stream::iter(vec![Ok(data.slice(..mid)), Ok(data.slice(mid..))]).boxed()
    }

    async fn run(
        options: &TransformOptions,
        variant: Option<&VariantSpec>,
        data: Bytes,
    ) -> (io::Result<Vec<Bytes>>, Option<TransformInfo>) {
        let transformer = ImageTransforms.create(options, variant).unwrap();
        let running = transformer.transform(input(data));
        let output = running.output.try_collect::<Vec<_>>().await;
        let info = match running.info {
            Some(rx) => rx.await.ok(),
            None => None,
        };
        (output, info)
    }

    #[tokio::test]
    async fn test_resize_by_width_keeps_aspect_ratio() {
        let variant = VariantSpec::new("sm").with_size(Some(10), None);
        let (output, info) = run(&TransformOptions::default(), Some(&variant), png_bytes(40, 20)).await;

        let encoded = output.unwrap().concat();
        let decoded = image::load_from_memory(&encoded).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (10, 5));

        let info = info.unwrap();
        assert_eq!(info.format, OutputFormat::Png);
        assert_eq!((info.width, info.height), (10, 5));
        assert_eq!(info.size, encoded.len());
    }

    #[tokio::test]
    async fn test_fill_stretches_to_box() {
        let options = TransformOptions {
            fit: Fit::Fill,
            ..TransformOptions::default()
        };
        let variant = VariantSpec::new("sq").with_size(Some(8), Some(8));
        let (_, info) = run(&options, Some(&variant), png_bytes(40, 20)).await;
        let info = info.unwrap();
        assert_eq!((info.width, info.height), (8, 8));
    }

    #[tokio::test]
    async fn test_declared_format_is_used() {
        let variant = VariantSpec::new("sm").with_format(OutputFormat::Jpeg);
        let transformer = ImageTransforms
            .create(&TransformOptions::default(), Some(&variant))
            .unwrap();
        assert_eq!(transformer.output_format(), Some(OutputFormat::Jpeg));

        let (output, _) = run(&TransformOptions::default(), Some(&variant), png_bytes(4, 4)).await;
        let encoded = output.unwrap().concat();
        assert_eq!(&encoded[0..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn test_invalid_image_fails_in_band() {
        let (output, info) = run(
            &TransformOptions::default(),
            None,
            Bytes::from_static(b"definitely not an image"),
        )
        .await;
        assert!(output.is_err());
        assert!(info.is_none());
    }

    #[tokio::test]
    async fn test_input_limit() {
        let options = TransformOptions {
            max_input_bytes: 16,
            ..TransformOptions::default()
        };
        let (output, _) = run(&options, None, png_bytes(40, 20)).await;
        let err = output.unwrap_err();
        assert!(err.to_string().contains("exceeds 16 bytes"));
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let variant = VariantSpec::new("bad").with_size(Some(0), None);
        assert!(matches!(
            ImageTransforms.create(&TransformOptions::default(), Some(&variant)),
            Err(TransformError::InvalidParams(_))
        ));
    }
}

//! PNG and JPEG.
//!
//! Images are `(height, width)` or `(height, width, channels)` arrays. A 1D
//! array of `n` elements is written as a `1 x n` grayscale row. Single-channel
//! images decode to two dimensions; callers that stored another layout
//! reshape to the recorded shape.
//!
//! A chunk compressed with a raster codec stacks its samples top to bottom in
//! one image, padding narrower samples with zeros on the right. Each sample
//! is cropped back out using the chunk's shape index.

use std::borrow::Cow;
use std::io::Cursor;

use image::codecs::jpeg::{JpegDecoder, JpegEncoder};
use image::codecs::png::{PngDecoder, PngEncoder};
use image::{ColorType, ExtendedColorType, ImageDecoder, ImageEncoder, ImageFormat};
use tc_types::{DType, NdArray};

use crate::compression::Compression;
use crate::error::{CodecError, CodecResult};

const JPEG_QUALITY: u8 = 90;

/// Largest side a JPEG can have.
const JPEG_MAX_DIMENSION: usize = 65_535;

fn max_dimension(compression: Compression) -> usize {
    match compression {
        Compression::Jpeg => JPEG_MAX_DIMENSION,
        _ => u32::MAX as usize,
    }
}

/// `(height, width, channels)` of an image array.
fn geometry(compression: Compression, shape: &[usize]) -> CodecResult<(usize, usize, usize)> {
    match *shape {
        [width] => Ok((1, width, 1)),
        [height, width] => Ok((height, width, 1)),
        [height, width, channels] => Ok((height, width, channels)),
        _ => Err(CodecError::constraint(
            compression,
            format!("expected a 1D, 2D or 3D array, got {} dimensions", shape.len()),
        )),
    }
}

/// Check that an array of `dtype` and `shape` can be written as `compression`.
pub fn validate(compression: Compression, dtype: DType, shape: &[usize]) -> CodecResult<()> {
    let (height, width, channels) = geometry(compression, shape)?;
    match compression {
        Compression::Png => {
            if !matches!(dtype, DType::U8 | DType::U16) {
                return Err(CodecError::constraint(
                    compression,
                    format!("dtype {dtype} is not uint8 or uint16"),
                ));
            }
            if !(1..=4).contains(&channels) {
                return Err(CodecError::constraint(
                    compression,
                    format!("{channels} channels, expected 1 to 4"),
                ));
            }
        }
        Compression::Jpeg => {
            if dtype != DType::U8 {
                return Err(CodecError::constraint(
                    compression,
                    format!("dtype {dtype} is not uint8"),
                ));
            }
            if channels != 1 && channels != 3 {
                return Err(CodecError::constraint(
                    compression,
                    format!("{channels} channels, expected 1 or 3"),
                ));
            }
        }
        other => return Err(CodecError::constraint(other, "not a raster codec")),
    }
    if height == 0 || width == 0 {
        return Err(CodecError::constraint(compression, "image has no pixels"));
    }
    let limit = max_dimension(compression);
    if height > limit || width > limit {
        return Err(CodecError::constraint(
            compression,
            format!("{height}x{width} image exceeds {limit} pixels per side"),
        ));
    }
    Ok(())
}

fn color_type(dtype: DType, channels: usize) -> ExtendedColorType {
    match (dtype, channels) {
        (DType::U16, 1) => ExtendedColorType::L16,
        (DType::U16, 2) => ExtendedColorType::La16,
        (DType::U16, 3) => ExtendedColorType::Rgb16,
        (DType::U16, _) => ExtendedColorType::Rgba16,
        (_, 1) => ExtendedColorType::L8,
        (_, 2) => ExtendedColorType::La8,
        (_, 3) => ExtendedColorType::Rgb8,
        _ => ExtendedColorType::Rgba8,
    }
}

fn le16_to_ne(data: &[u8]) -> Vec<u8> {
    data.chunks_exact(2)
        .flat_map(|b| u16::from_le_bytes([b[0], b[1]]).to_ne_bytes())
        .collect()
}

fn ne16_to_le(data: &[u8]) -> Vec<u8> {
    data.chunks_exact(2)
        .flat_map(|b| u16::from_ne_bytes([b[0], b[1]]).to_le_bytes())
        .collect()
}

pub fn encode(compression: Compression, array: &NdArray) -> CodecResult<Vec<u8>> {
    let shape = array.shape();
    validate(compression, array.dtype(), shape)?;
    let (height, width, channels) = geometry(compression, shape)?;
    let (height, width) = (height as u32, width as u32);
    let color = color_type(array.dtype(), channels);
    let pixels: Cow<'_, [u8]> = if array.dtype() == DType::U16 {
        Cow::Owned(le16_to_ne(array.as_bytes()))
    } else {
        Cow::Borrowed(array.as_bytes())
    };

    let mut out = Vec::new();
    let written = match compression {
        Compression::Png => PngEncoder::new(&mut out).write_image(&pixels, width, height, color),
        _ => JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
            .write_image(&pixels, width, height, color),
    };
    written.map_err(|e| CodecError::encode(compression, e))?;
    Ok(out)
}

fn format_of(compression: Compression) -> CodecResult<ImageFormat> {
    match compression {
        Compression::Png => Ok(ImageFormat::Png),
        Compression::Jpeg => Ok(ImageFormat::Jpeg),
        other => Err(CodecError::constraint(other, "not a raster codec")),
    }
}

fn shape_for(height: u32, width: u32, channels: usize) -> Vec<usize> {
    if channels == 1 {
        vec![height as usize, width as usize]
    } else {
        vec![height as usize, width as usize, channels]
    }
}

pub fn decode(compression: Compression, bytes: &[u8]) -> CodecResult<NdArray> {
    let format = format_of(compression)?;
    let img = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| CodecError::decode(compression, e))?;
    let (width, height) = (img.width(), img.height());
    let (dtype, channels, data) = match img.color() {
        ColorType::L8 | ColorType::La8 | ColorType::Rgb8 | ColorType::Rgba8 => {
            let channels = img.color().channel_count() as usize;
            (DType::U8, channels, img.into_bytes())
        }
        ColorType::L16 | ColorType::La16 | ColorType::Rgb16 | ColorType::Rgba16 => {
            let channels = img.color().channel_count() as usize;
            (DType::U16, channels, ne16_to_le(img.as_bytes()))
        }
        _ => (DType::U8, 4, img.to_rgba8().into_raw()),
    };
    Ok(NdArray::from_bytes(
        dtype,
        shape_for(height, width, channels),
        data,
    )?)
}

/// Shape from the image header, without decoding pixels.
pub fn read_shape(compression: Compression, bytes: &[u8]) -> CodecResult<Vec<usize>> {
    let err = |e: image::ImageError| CodecError::decode(compression, e);
    let ((width, height), color) = match format_of(compression)? {
        ImageFormat::Png => {
            let decoder = PngDecoder::new(Cursor::new(bytes)).map_err(err)?;
            (decoder.dimensions(), decoder.color_type())
        }
        _ => {
            let decoder = JpegDecoder::new(Cursor::new(bytes)).map_err(err)?;
            (decoder.dimensions(), decoder.color_type())
        }
    };
    Ok(shape_for(height, width, color.channel_count() as usize))
}

/// Samples of one chunk stacked top to bottom in a single image.
struct Canvas {
    /// `(height, width)` per sample; samples without elements are `(0, 0)`.
    samples: Vec<(usize, usize)>,
    height: usize,
    width: usize,
    channels: usize,
}

impl Canvas {
    fn plan(compression: Compression, shapes: &[&[usize]]) -> CodecResult<Self> {
        let mut canvas = Canvas {
            samples: Vec::with_capacity(shapes.len()),
            height: 0,
            width: 0,
            channels: 0,
        };
        for shape in shapes {
            if shape.iter().product::<usize>() == 0 {
                canvas.samples.push((0, 0));
                continue;
            }
            let (height, width, channels) = geometry(compression, shape)?;
            if canvas.channels == 0 {
                canvas.channels = channels;
            } else if canvas.channels != channels {
                return Err(CodecError::constraint(
                    compression,
                    format!(
                        "samples with {} and {channels} channels cannot share a chunk",
                        canvas.channels
                    ),
                ));
            }
            canvas.samples.push((height, width));
            canvas.height += height;
            canvas.width = canvas.width.max(width);
        }
        let limit = max_dimension(compression);
        if canvas.height > limit || canvas.width > limit {
            return Err(CodecError::constraint(
                compression,
                format!(
                    "packed {}x{} image exceeds {limit} pixels per side",
                    canvas.height, canvas.width
                ),
            ));
        }
        Ok(canvas)
    }

    fn is_blank(&self) -> bool {
        self.height == 0
    }

    fn shape(&self) -> Vec<usize> {
        if self.channels == 1 {
            vec![self.height, self.width]
        } else {
            vec![self.height, self.width, self.channels]
        }
    }

    fn num_sample_elements(&self) -> usize {
        self.samples.iter().map(|(h, w)| h * w).sum::<usize>() * self.channels
    }
}

/// Whether samples of `shapes` can be packed into one image.
pub fn can_pack(compression: Compression, shapes: &[&[usize]]) -> bool {
    Canvas::plan(compression, shapes).is_ok()
}

/// Pack the samples in `raw` (laid out back to back, shaped by `shapes`)
/// into one image and encode it.
pub fn pack(compression: Compression, raw: &[u8], shapes: &[&[usize]]) -> CodecResult<Vec<u8>> {
    let canvas = Canvas::plan(compression, shapes)?;
    if canvas.is_blank() {
        return Ok(Vec::new());
    }
    let numel = canvas.num_sample_elements();
    let dtype = match raw.len() / numel {
        1 if raw.len() == numel => DType::U8,
        2 if raw.len() == 2 * numel => DType::U16,
        _ => {
            return Err(CodecError::constraint(
                compression,
                format!("{} bytes do not hold {numel} 8 or 16 bit elements", raw.len()),
            ))
        }
    };
    let itemsize = dtype.itemsize();
    let row_bytes = canvas.width * canvas.channels * itemsize;
    let mut pixels = vec![0u8; canvas.height * row_bytes];
    let (mut top, mut offset) = (0, 0);
    for &(height, width) in &canvas.samples {
        let sample_row = width * canvas.channels * itemsize;
        for row in 0..height {
            let dst = (top + row) * row_bytes;
            pixels[dst..dst + sample_row].copy_from_slice(&raw[offset..offset + sample_row]);
            offset += sample_row;
        }
        top += height;
    }
    encode(compression, &NdArray::from_bytes(dtype, canvas.shape(), pixels)?)
}

/// Inverse of [`pack`]: decode the image and crop every sample back out.
pub fn unpack(compression: Compression, data: &[u8], shapes: &[&[usize]]) -> CodecResult<Vec<u8>> {
    let canvas = Canvas::plan(compression, shapes)?;
    if canvas.is_blank() {
        return Ok(Vec::new());
    }
    let image = decode(compression, data)?;
    if image.shape() != canvas.shape() {
        return Err(CodecError::decode(
            compression,
            format!(
                "packed image is {:?}, chunk shapes need {:?}",
                image.shape(),
                canvas.shape()
            ),
        ));
    }
    let itemsize = image.dtype().itemsize();
    let pixels = image.as_bytes();
    let row_bytes = canvas.width * canvas.channels * itemsize;
    let mut out = Vec::with_capacity(canvas.num_sample_elements() * itemsize);
    let mut top = 0;
    for &(height, width) in &canvas.samples {
        let sample_row = width * canvas.channels * itemsize;
        for row in 0..height {
            let src = (top + row) * row_bytes;
            out.extend_from_slice(&pixels[src..src + sample_row]);
        }
        top += height;
    }
    Ok(out)
}

//! Pluggable audio and video decoding.
//!
//! Media codecs are not implemented in this crate. A [`MediaBackend`] is
//! installed on the [`Pipeline`](crate::Pipeline) by the embedding
//! application (an ffmpeg binding, a test fake, ...). Without one, media
//! samples can still be stored verbatim but not decoded.

use tc_types::NdArray;

use crate::compression::Compression;
use crate::error::CodecResult;

/// Where the encoded media lives.
#[derive(Clone, Copy, Debug)]
pub enum MediaSource<'a> {
    /// Encoded bytes held in memory.
    Bytes(&'a [u8]),
    /// A local path or URL the backend reads itself, so that it can seek
    /// instead of downloading the whole file.
    Url(&'a str),
}

/// A normalized range over the frame axis of a video.
///
/// `start..stop` is always ascending with a positive `step`; `reverse`
/// asks for the selected frames in descending order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRange {
    pub start: usize,
    pub stop: usize,
    pub step: usize,
    pub reverse: bool,
}

impl FrameRange {
    /// Number of frames selected.
    pub fn len(&self) -> usize {
        if self.stop <= self.start {
            0
        } else {
            (self.stop - self.start).div_ceil(self.step.max(1))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frame numbers in output order.
    pub fn frames(&self) -> Vec<usize> {
        let mut frames: Vec<usize> = (self.start..self.stop).step_by(self.step.max(1)).collect();
        if self.reverse {
            frames.reverse();
        }
        frames
    }
}

/// Audio/video decoding capability.
pub trait MediaBackend: Send + Sync {
    /// Decode an audio clip to `(samples, channels)`.
    fn decode_audio(&self, compression: Compression, source: MediaSource<'_>)
        -> CodecResult<NdArray>;

    /// Shape of an audio clip without decoding it.
    fn audio_shape(&self, compression: Compression, source: MediaSource<'_>)
        -> CodecResult<Vec<usize>>;

    /// Shape of a video, `(frames, height, width, channels)`, without decoding it.
    fn video_shape(&self, compression: Compression, source: MediaSource<'_>)
        -> CodecResult<Vec<usize>>;

    /// Decode exactly the frames selected by `range`.
    fn decode_video(
        &self,
        compression: Compression,
        source: MediaSource<'_>,
        range: FrameRange,
    ) -> CodecResult<NdArray>;
}

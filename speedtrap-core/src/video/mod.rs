//! video: FFmpeg bridge
//!
//! Decoding: [`VideoSource`] opens a file or stream URI and hands every decoded
//! frame to a callback as packed RGB24.
//!
//! Encoding: [`ClipEncoder`] is a streaming H.264 writer. It backs both the
//! per-track violation clips ([`FfmpegClipWriter`]) and the optional full-run
//! recording.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{
    codec, decoder, encoder, format, frame, media, software::scaling, util::rational::Rational,
};
use tracing::{debug, info};

/// Output pixel format for the encoder (YUV420p is universally compatible).
const ENCODE_FORMAT: format::Pixel = format::Pixel::YUV420P;
/// Bilinear scaling for both the decode and encode conversions.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;
/// Used when a live stream does not advertise its frame rate.
const FALLBACK_FPS: i32 = 30;

/// A single decoded video frame in RGB24 format, along with its presentation
/// timestamp (in the source stream's time-base units).
#[derive(Debug, Clone)]
pub struct RgbFrame {
    pub data: Vec<u8>, // packed RGB24, row-major
    pub width: u32,
    pub height: u32,
    pub pts: i64,
}

impl RgbFrame {
    /// A frame filled with one colour.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3], pts: i64) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take((width * height * 3) as usize)
            .collect();
        Self {
            data,
            width,
            height,
            pts,
        }
    }
}

/// Stream metadata needed to size and pace encoders.
#[derive(Debug, Clone, Copy)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
}

impl VideoInfo {
    pub fn fps(&self) -> f64 {
        f64::from(self.frame_rate)
    }
}

// ── Decoding ─────────────────────────────────────────────────────────────────

/// An opened input with its video decoder and RGB converter.
pub struct VideoSource {
    ictx: format::context::Input,
    decoder: decoder::Video,
    to_rgb: scaling::Context,
    stream_index: usize,
    info: VideoInfo,
}

impl VideoSource {
    /// Open `uri` (a path or anything FFmpeg's demuxers accept, e.g. `rtsp://`).
    pub fn open<P: AsRef<Path>>(uri: P) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;

        let ictx = format::input(&uri).context("could not open video source")?;
        let stream = ictx
            .streams()
            .best(media::Type::Video)
            .context("no video stream found in input")?;
        let stream_index = stream.index();

        let mut frame_rate = stream.avg_frame_rate();
        if frame_rate.numerator() <= 0 || frame_rate.denominator() <= 0 {
            frame_rate = stream.rate();
        }
        if frame_rate.numerator() <= 0 || frame_rate.denominator() <= 0 {
            frame_rate = Rational::new(FALLBACK_FPS, 1);
        }

        let decoder = codec::context::Context::from_parameters(stream.parameters())
            .context("failed to build decoder context")?
            .decoder()
            .video()
            .context("failed to open video decoder")?;

        let width = decoder.width();
        let height = decoder.height();
        let to_rgb = scaling::Context::get(
            decoder.format(),
            width,
            height,
            format::Pixel::RGB24,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-RGB scaler")?;

        let info = VideoInfo {
            width,
            height,
            frame_rate,
        };
        info!(width, height, fps = info.fps(), "opened video source");

        Ok(Self {
            ictx,
            decoder,
            to_rgb,
            stream_index,
            info,
        })
    }

    pub fn info(&self) -> VideoInfo {
        self.info
    }

    /// Decode every frame in order and pass it to `frame_fn`. Decoding stops
    /// early when `frame_fn` returns `Ok(false)`; an `Err` aborts and is
    /// returned. Returns the number of frames delivered.
    pub fn for_each_frame<F>(&mut self, mut frame_fn: F) -> Result<u64>
    where
        F: FnMut(RgbFrame) -> Result<bool>,
    {
        let mut decoded = frame::Video::empty();
        let mut rgb = frame::Video::empty();
        let mut delivered = 0u64;

        for (stream, packet) in self.ictx.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            self.decoder
                .send_packet(&packet)
                .context("decoder send_packet")?;

            while self.decoder.receive_frame(&mut decoded).is_ok() {
                let frame = convert(&mut self.to_rgb, &decoded, &mut rgb, delivered, &self.info)?;
                delivered += 1;
                if !frame_fn(frame)? {
                    debug!(delivered, "decoding stopped by caller");
                    return Ok(delivered);
                }
            }
        }

        self.decoder.send_eof().ok();
        while self.decoder.receive_frame(&mut decoded).is_ok() {
            let frame = convert(&mut self.to_rgb, &decoded, &mut rgb, delivered, &self.info)?;
            delivered += 1;
            if !frame_fn(frame)? {
                break;
            }
        }

        info!(delivered, "video source exhausted");
        Ok(delivered)
    }
}

fn convert(
    to_rgb: &mut scaling::Context,
    decoded: &frame::Video,
    rgb: &mut frame::Video,
    index: u64,
    info: &VideoInfo,
) -> Result<RgbFrame> {
    to_rgb
        .run(decoded, rgb)
        .context("to-RGB scaling failed")?;

    // Compact to a plain Vec<u8> (remove stride padding if any)
    let stride = rgb.stride(0);
    let raw = rgb.data(0);
    let row_len = info.width as usize * 3;
    let mut data = Vec::with_capacity(row_len * info.height as usize);
    for row in 0..info.height as usize {
        let start = row * stride;
        data.extend_from_slice(&raw[start..start + row_len]);
    }

    Ok(RgbFrame {
        data,
        width: info.width,
        height: info.height,
        pts: decoded.pts().unwrap_or(index as i64),
    })
}

/// Read stream metadata without decoding.
pub fn probe<P: AsRef<Path>>(uri: P) -> Result<VideoInfo> {
    VideoSource::open(uri).map(|s| s.info())
}

/// Return the approximate total frame count for a video file (used for
/// progress reporting). Falls back to 0 for live streams or when the count
/// cannot be determined.
pub fn total_frames<P: AsRef<Path>>(input_path: P) -> u64 {
    ffmpeg::init().ok();
    let Ok(ictx) = format::input(&input_path) else {
        return 0;
    };
    let Some(stream) = ictx.streams().best(media::Type::Video) else {
        return 0;
    };
    // nb_frames is set by most muxers; fall back to duration × fps estimate.
    let nb = stream.frames();
    if nb > 0 {
        return nb as u64;
    }
    let dur = stream.duration();
    let tb = stream.time_base();
    let fps = stream.avg_frame_rate();
    if dur > 0 && tb.denominator() > 0 && fps.numerator() > 0 {
        let seconds = dur as f64 * tb.numerator() as f64 / tb.denominator() as f64;
        let fps_f = fps.numerator() as f64 / fps.denominator() as f64;
        return (seconds * fps_f).round() as u64;
    }
    0
}

// ── Encoding ─────────────────────────────────────────────────────────────────

/// Streaming H.264 encoder writing one output file.
pub struct ClipEncoder {
    octx: format::context::Output,
    encoder: encoder::Video,
    to_yuv: scaling::Context,
    rgb_frame: frame::Video,
    yuv_frame: frame::Video,
    stream_index: usize,
    time_base: Rational,
    stream_time_base: Rational,
    width: u32,
    height: u32,
    written: u64,
}

impl ClipEncoder {
    pub fn create<P: AsRef<Path>>(
        output_path: P,
        width: u32,
        height: u32,
        frame_rate: Rational,
    ) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;

        let mut octx =
            format::output(&output_path).context("could not create output context")?;
        let global_header = octx
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER);

        let encoder_codec = encoder::find(codec::Id::H264)
            .context("H.264 encoder not found; is FFmpeg built with libx264?")?;
        let time_base = frame_rate.invert();

        let (encoder, stream_index) = {
            let mut out_stream = octx.add_stream(encoder_codec)?;
            let mut builder = codec::context::Context::new_with_codec(encoder_codec)
                .encoder()
                .video()?;
            builder.set_width(width);
            builder.set_height(height);
            builder.set_format(ENCODE_FORMAT);
            builder.set_time_base(time_base);
            builder.set_frame_rate(Some(frame_rate));
            if global_header {
                builder.set_flags(codec::flag::Flags::GLOBAL_HEADER);
            }

            let encoder = builder
                .open_as_with(
                    encoder_codec,
                    ffmpeg::Dictionary::from_iter([("crf", "23"), ("preset", "veryfast")]),
                )
                .context("failed to open H.264 encoder")?;
            out_stream.set_parameters(&encoder);
            out_stream.set_time_base(time_base);
            (encoder, out_stream.index())
        };

        octx.write_header()
            .context("failed to write output header")?;
        let stream_time_base = octx
            .stream(stream_index)
            .map(|s| s.time_base())
            .context("output stream vanished after header")?;

        let to_yuv = scaling::Context::get(
            format::Pixel::RGB24,
            width,
            height,
            ENCODE_FORMAT,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-YUV scaler")?;

        Ok(Self {
            octx,
            encoder,
            to_yuv,
            rgb_frame: frame::Video::new(format::Pixel::RGB24, width, height),
            yuv_frame: frame::Video::empty(),
            stream_index,
            time_base,
            stream_time_base,
            width,
            height,
            written: 0,
        })
    }

    pub fn push(&mut self, frame: &RgbFrame) -> Result<()> {
        if frame.width != self.width || frame.height != self.height {
            bail!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width,
                frame.height,
                self.width,
                self.height
            );
        }

        let row_len = self.width as usize * 3;
        let stride = self.rgb_frame.stride(0);
        let plane = self.rgb_frame.data_mut(0);
        for row in 0..self.height as usize {
            let dst = row * stride;
            let src = row * row_len;
            plane[dst..dst + row_len].copy_from_slice(&frame.data[src..src + row_len]);
        }

        self.to_yuv
            .run(&self.rgb_frame, &mut self.yuv_frame)
            .context("to-YUV scaling failed")?;
        self.yuv_frame.set_pts(Some(self.written as i64));
        self.encoder
            .send_frame(&self.yuv_frame)
            .context("encoder send_frame")?;
        self.drain()?;
        self.written += 1;
        Ok(())
    }

    /// Flush the encoder and write the trailer. Returns frames written.
    pub fn finish(mut self) -> Result<u64> {
        self.encoder.send_eof().context("encoder send_eof")?;
        self.drain()?;
        self.octx
            .write_trailer()
            .context("failed to write output trailer")?;
        Ok(self.written)
    }

    /// Drain all pending packets from the encoder and write them to the muxer.
    fn drain(&mut self) -> Result<()> {
        let mut encoded = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut encoded).is_ok() {
            encoded.set_stream(self.stream_index);
            encoded.rescale_ts(self.time_base, self.stream_time_base);
            encoded
                .write_interleaved(&mut self.octx)
                .context("failed to write encoded packet")?;
        }
        Ok(())
    }
}

/// Encodes a contiguous run of frames into one clip file.
pub trait ClipWriter: Send + Sync {
    fn write_clip(&self, path: &Path, frames: &[Arc<RgbFrame>]) -> Result<()>;
}

/// [`ClipWriter`] producing H.264 MP4 files at the source frame rate.
pub struct FfmpegClipWriter {
    frame_rate: Rational,
}

impl FfmpegClipWriter {
    pub fn new(frame_rate: Rational) -> Self {
        Self { frame_rate }
    }
}

impl ClipWriter for FfmpegClipWriter {
    fn write_clip(&self, path: &Path, frames: &[Arc<RgbFrame>]) -> Result<()> {
        let first = frames.first().context("clip has no frames")?;
        let mut clip = ClipEncoder::create(path, first.width, first.height, self.frame_rate)
            .with_context(|| format!("failed to create clip {}", path.display()))?;
        for frame in frames {
            clip.push(frame)?;
        }
        let written = clip.finish()?;
        debug!(path = %path.display(), written, "clip written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filled_frame_has_packed_rgb() {
        let f = RgbFrame::filled(2, 3, [1, 2, 3], 7);
        assert_eq!(f.data.len(), 18);
        assert_eq!(&f.data[..6], &[1, 2, 3, 1, 2, 3]);
        assert_eq!(f.pts, 7);
    }

    #[test]
    fn fps_from_rational() {
        let info = VideoInfo {
            width: 1,
            height: 1,
            frame_rate: Rational::new(30000, 1001),
        };
        assert!((info.fps() - 29.97).abs() < 0.01);
    }
}

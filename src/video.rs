extern crate ffmpeg_next;

use std::path::Path;

use image::RgbImage;

use crate::{Error, Result};

/// Container-level metadata for a video, obtained once per run.
#[derive(Clone, Copy, Debug)]
pub struct VideoInfo {
    /// Total number of frames in the video stream.
    pub total_frames: u64,
    /// Average frame rate.
    pub fps: f64,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Stream duration in seconds.
    pub duration: f64,
}

/// A decoded video frame alongside its frame number in the source video.
pub type IndexedFrame = (u64, RgbImage);

/// Narrow seam over video decoding.
///
/// The detection engine only ever consumes frames through this trait, which keeps it
/// independent of FFmpeg and lets tests drive it with synthetic in-memory sources.
///
/// Frames are 8-bit RGB, row-major, contiguous. The iterator yields frames in strictly
/// increasing frame-number order within `[start, end)`. A truncated stream simply ends
/// early; an unrecoverable read error is surfaced as an `Err` item and must be
/// propagated by the caller without retry.
pub trait FrameSource {
    /// Returns the video metadata.
    fn info(&self) -> VideoInfo;

    /// Returns an iterator over the frames with numbers in `[start, end)`.
    fn read_frames(&mut self, start: u64, end: u64)
        -> Result<Box<dyn Iterator<Item = Result<IndexedFrame>> + '_>>;
}

/// Thin wrapper around the native `FFmpeg` video decoder.
struct Decoder {
    decoder: ffmpeg_next::codec::decoder::Video,
    converter: ffmpeg_next::software::scaling::Context,
}

impl Decoder {
    fn build_threading_config() -> ffmpeg_next::codec::threading::Config {
        let mut config = ffmpeg_next::codec::threading::Config::default();
        config.count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        config.kind = ffmpeg_next::codec::threading::Type::Frame;
        config
    }

    fn from_stream(stream: ffmpeg_next::format::stream::Stream, threaded: bool) -> Result<Self> {
        let ctx = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())?;
        let mut decoder = ctx.decoder();

        if threaded {
            decoder.set_threading(Self::build_threading_config());
        }

        let decoder = decoder.video()?;
        let converter = decoder.converter(ffmpeg_next::format::Pixel::RGB24)?;

        Ok(Self { decoder, converter })
    }

    fn send_packet(&mut self, packet: &ffmpeg_next::packet::Packet) -> Result<()> {
        Ok(self.decoder.send_packet(packet)?)
    }

    fn send_eof(&mut self) -> Result<()> {
        Ok(self.decoder.send_eof()?)
    }

    fn receive_frame(&mut self, frame: &mut ffmpeg_next::frame::Video) -> Result<()> {
        Ok(self.decoder.receive_frame(frame)?)
    }

    fn convert_frame(
        &mut self,
        frame: &ffmpeg_next::frame::Video,
        converted: &mut ffmpeg_next::frame::Video,
    ) -> Result<()> {
        self.converter.run(frame, converted)?;
        Ok(())
    }
}

/// A [FrameSource] backed by the FFmpeg demuxer and decoder.
pub struct FfmpegFrameSource {
    ctx: ffmpeg_next::format::context::Input,
    stream_idx: usize,
    time_base: f64,
    info: VideoInfo,
    threaded_decoding: bool,
}

impl FfmpegFrameSource {
    /// Opens the video at `path` and probes its metadata.
    ///
    /// The best video stream is selected; other streams are ignored.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::PathNotFound(path.to_owned()));
        }

        let ctx = ffmpeg_next::format::input(&path)?;
        let stream = ctx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| Error::Decoder(format!("no video stream in {}", path.display())))?;
        let stream_idx = stream.index();
        let time_base = f64::from(stream.time_base());

        // Probe frame dimensions through a throwaway decoder context.
        let decoder = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())?
            .decoder()
            .video()?;
        let (width, height) = (decoder.width(), decoder.height());

        let mut fps = f64::from(stream.avg_frame_rate());
        if fps <= 0.0 {
            fps = f64::from(stream.rate());
        }
        if fps <= 0.0 {
            return Err(Error::Decoder(format!(
                "no usable frame rate in {}",
                path.display()
            )));
        }

        // Try to get the duration from the stream info. If it is invalid, get it from the
        // format context.
        //
        // As an example, Matroska does not store the duration in the stream; it only
        // stores it in the format context.
        let duration = if stream.duration() > 0 {
            stream.duration() as f64 * time_base
        } else {
            ctx.duration() as f64 / f64::from(ffmpeg_next::ffi::AV_TIME_BASE)
        };

        let total_frames = if stream.frames() > 0 {
            stream.frames() as u64
        } else {
            (duration * fps).round() as u64
        };

        tracing::debug!(
            total_frames,
            fps,
            width,
            height,
            "opened video {}",
            path.display()
        );

        Ok(Self {
            ctx,
            stream_idx,
            time_base,
            info: VideoInfo {
                total_frames,
                fps,
                width,
                height,
                duration,
            },
            threaded_decoding: false,
        })
    }

    /// Returns a new [FfmpegFrameSource] with `threaded_decoding` set to the provided value.
    pub fn with_threaded_decoding(mut self, threaded_decoding: bool) -> Self {
        self.threaded_decoding = threaded_decoding;
        self
    }

    // Seeks the demuxer to the keyframe at or before `frame`. Decoding then rolls
    // forward to the exact frame number.
    fn seek_to_frame(&mut self, frame: u64) -> Result<()> {
        let ts_secs = frame as f64 / self.info.fps;
        let ts = (ts_secs * f64::from(ffmpeg_next::ffi::AV_TIME_BASE)) as i64;
        self.ctx.seek(ts, ..ts)?;
        Ok(())
    }
}

impl FrameSource for FfmpegFrameSource {
    fn info(&self) -> VideoInfo {
        self.info
    }

    fn read_frames(
        &mut self,
        start: u64,
        end: u64,
    ) -> Result<Box<dyn Iterator<Item = Result<IndexedFrame>> + '_>> {
        self.seek_to_frame(start)?;

        let stream = self
            .ctx
            .stream(self.stream_idx)
            .ok_or_else(|| Error::Decoder("video stream disappeared".to_string()))?;
        let decoder = Decoder::from_stream(stream, self.threaded_decoding)?;

        Ok(Box::new(FrameIter {
            packets: self.ctx.packets(),
            decoder,
            stream_idx: self.stream_idx,
            time_base: self.time_base,
            fps: self.info.fps,
            start,
            end,
            last_index: None,
            eof_sent: false,
            finished: false,
            decoded: ffmpeg_next::frame::Video::empty(),
            converted: ffmpeg_next::frame::Video::empty(),
        }))
    }
}

struct FrameIter<'a> {
    packets: ffmpeg_next::format::context::input::PacketIter<'a>,
    decoder: Decoder,
    stream_idx: usize,
    time_base: f64,
    fps: f64,
    start: u64,
    end: u64,
    last_index: Option<u64>,
    eof_sent: bool,
    finished: bool,
    decoded: ffmpeg_next::frame::Video,
    converted: ffmpeg_next::frame::Video,
}

impl FrameIter<'_> {
    // Derives the frame number from the frame PTS. Streams that carry no PTS fall back
    // to counting from the last known frame.
    fn frame_index(&self) -> u64 {
        match self.decoded.pts() {
            Some(pts) => (pts as f64 * self.time_base * self.fps).round() as u64,
            None => self.last_index.map(|i| i + 1).unwrap_or(self.start),
        }
    }

    fn to_rgb_image(&mut self) -> Result<RgbImage> {
        self.decoder
            .convert_frame(&self.decoded, &mut self.converted)?;

        let (width, height) = (self.converted.width(), self.converted.height());
        let stride = self.converted.stride(0);
        let data = self.converted.data(0);
        let row_len = width as usize * 3;

        // The converted frame rows may be padded to the scaler's alignment; copy row by
        // row to produce a contiguous buffer.
        let mut buf = Vec::with_capacity(row_len * height as usize);
        for y in 0..height as usize {
            buf.extend_from_slice(&data[y * stride..y * stride + row_len]);
        }

        RgbImage::from_raw(width, height, buf).ok_or_else(|| {
            Error::InternalConsistency("converted frame buffer has wrong size".to_string())
        })
    }
}

impl Iterator for FrameIter<'_> {
    type Item = Result<IndexedFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            // Drain any frames the decoder already holds.
            while self.decoder.receive_frame(&mut self.decoded).is_ok() {
                let index = self.frame_index();
                self.last_index = Some(index);

                if index < self.start {
                    // Roll-forward from the seek keyframe.
                    continue;
                }
                if index >= self.end {
                    self.finished = true;
                    return None;
                }

                return match self.to_rgb_image() {
                    Ok(image) => Some(Ok((index, image))),
                    Err(e) => {
                        self.finished = true;
                        Some(Err(e))
                    }
                };
            }

            if self.eof_sent {
                self.finished = true;
                return None;
            }

            // Feed the decoder the next packet for our stream.
            match self.packets.next() {
                Some((stream, packet)) => {
                    if stream.index() != self.stream_idx {
                        continue;
                    }
                    if let Err(e) = self.decoder.send_packet(&packet) {
                        self.finished = true;
                        return Some(Err(e));
                    }
                }
                None => {
                    if let Err(e) = self.decoder.send_eof() {
                        self.finished = true;
                        return Some(Err(e));
                    }
                    self.eof_sent = true;
                }
            }
        }
    }
}

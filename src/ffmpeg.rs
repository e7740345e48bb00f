use std::{fs::File, path::Path};

use ffmpeg_next::{codec, encoder, format, frame, ChannelLayout, Packet, Rational};

use crate::{
    output::{EncodeError, FormatEncoder},
    timeline::DenseAudioBuffer,
};

fn ffmpeg_error(e: ffmpeg_next::Error) -> EncodeError {
    EncodeError::Ffmpeg(e.to_string())
}

/// Compressed output through libavcodec, the muxer writes to the temp path itself.
#[derive(Debug)]
pub struct FfmpegEncoder {
    name: &'static str,
    codec: codec::Id,
    bit_rate: Option<usize>,
}

static FLAC: FfmpegEncoder = FfmpegEncoder {
    name: "flac",
    codec: codec::Id::FLAC,
    bit_rate: None,
};

static MP3: FfmpegEncoder = FfmpegEncoder {
    name: "mp3",
    codec: codec::Id::MP3,
    bit_rate: Some(128_000),
};

pub fn encoders() -> Vec<&'static dyn FormatEncoder> {
    vec![&FLAC, &MP3]
}

// mono, so planar and packed layouts are the same
fn fill_frame(
    frame: &mut frame::Audio,
    samples: &[i16],
    sample_format: format::Sample,
) -> Result<(), EncodeError> {
    match sample_format {
        format::Sample::I16(_) => frame.plane_mut::<i16>(0).copy_from_slice(samples),
        format::Sample::I32(_) => {
            for (out, s) in frame.plane_mut::<i32>(0).iter_mut().zip(samples) {
                *out = (*s as i32) << 16;
            }
        }
        format::Sample::F32(_) => {
            for (out, s) in frame.plane_mut::<f32>(0).iter_mut().zip(samples) {
                *out = *s as f32 / 32768.0;
            }
        }
        other => {
            return Err(EncodeError::Ffmpeg(format!(
                "unsupported sample format {other:?}"
            )))
        }
    }
    Ok(())
}

fn write_packets(
    enc: &mut encoder::audio::Encoder,
    octx: &mut format::context::Output,
    stream_index: usize,
    enc_time_base: Rational,
    out_time_base: Rational,
) -> Result<(), EncodeError> {
    let mut packet = Packet::empty();
    while enc.receive_packet(&mut packet).is_ok() {
        packet.set_stream(stream_index);
        packet.rescale_ts(enc_time_base, out_time_base);
        packet.write_interleaved(octx).map_err(ffmpeg_error)?;
    }
    Ok(())
}

impl FormatEncoder for FfmpegEncoder {
    fn name(&self) -> &'static str {
        self.name
    }

    fn extension(&self) -> &'static str {
        self.name
    }

    fn encode(
        &self,
        buffer: &DenseAudioBuffer,
        _file: &mut File,
        path: &Path,
    ) -> Result<(), EncodeError> {
        ffmpeg_next::init().map_err(ffmpeg_error)?;
        let rate = buffer.sample_rate as i32;
        let mut octx = format::output_as(&path, self.name).map_err(ffmpeg_error)?;
        let codec = encoder::find(self.codec)
            .ok_or_else(|| EncodeError::Ffmpeg(format!("no {} encoder in this ffmpeg", self.name)))?;
        let sample_format = codec
            .audio()
            .map_err(ffmpeg_error)?
            .formats()
            .and_then(|mut formats| {
                formats.find(|f| {
                    matches!(
                        f,
                        format::Sample::I16(_) | format::Sample::I32(_) | format::Sample::F32(_)
                    )
                })
            })
            .ok_or_else(|| EncodeError::Ffmpeg(format!("{} has no usable sample format", self.name)))?;

        let (stream_index, mut enc) = {
            let mut stream = octx.add_stream(codec).map_err(ffmpeg_error)?;
            let context = codec::context::Context::from_parameters(stream.parameters())
                .map_err(ffmpeg_error)?;
            let mut enc = context.encoder().audio().map_err(ffmpeg_error)?;
            enc.set_rate(rate);
            enc.set_channel_layout(ChannelLayout::MONO);
            enc.set_format(sample_format);
            enc.set_time_base(Rational(1, rate));
            if let Some(bit_rate) = self.bit_rate {
                enc.set_bit_rate(bit_rate);
            }
            let enc = enc.open_as(codec).map_err(ffmpeg_error)?;
            stream.set_parameters(&enc);
            (stream.index(), enc)
        };
        octx.write_header().map_err(ffmpeg_error)?;
        let out_time_base = octx
            .stream(stream_index)
            .map(|s| s.time_base())
            .ok_or_else(|| EncodeError::Ffmpeg("output stream vanished".into()))?;
        let enc_time_base = Rational(1, rate);

        let frame_size = match enc.frame_size() {
            0 => 4096,
            n => n as usize,
        };
        for (i, chunk) in buffer.samples.chunks(frame_size).enumerate() {
            let mut frame = frame::Audio::new(sample_format, chunk.len(), ChannelLayout::MONO);
            frame.set_rate(buffer.sample_rate);
            frame.set_pts(Some((i * frame_size) as i64));
            fill_frame(&mut frame, chunk, sample_format)?;
            enc.send_frame(&frame).map_err(ffmpeg_error)?;
            write_packets(&mut enc, &mut octx, stream_index, enc_time_base, out_time_base)?;
        }
        enc.send_eof().map_err(ffmpeg_error)?;
        write_packets(&mut enc, &mut octx, stream_index, enc_time_base, out_time_base)?;
        octx.write_trailer().map_err(ffmpeg_error)?;
        Ok(())
    }
}

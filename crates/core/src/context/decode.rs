//! Container decoding through symphonia.

use std::io::{Cursor, ErrorKind};

use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};
use tracing::debug;

use super::DecodedAudio;
use crate::{
    format::{diagnostic_prefix, NormalizedAudio},
    AudioError, AudioErrorKind, Result,
};

/// Decodes on the blocking pool so the event loop keeps turning.
pub(crate) async fn decode_off_thread(audio: NormalizedAudio) -> Result<DecodedAudio> {
    tokio::task::spawn_blocking(move || decode_bytes(audio))
        .await
        .map_err(|err| AudioError::decode_failed("decoder task aborted").with_cause(err))?
}

pub(crate) fn decode_bytes(audio: NormalizedAudio) -> Result<DecodedAudio> {
    let NormalizedAudio {
        bytes, detected, ..
    } = audio;
    let byte_len = bytes.len();
    let prefix = diagnostic_prefix(&bytes);
    let failure = |kind: AudioErrorKind, what: &str| {
        AudioError::new(
            kind,
            format!("{what} ({byte_len} bytes, starts with {prefix}, tagged {detected:?})"),
        )
    };

    let mut hint = Hint::new();
    if let Some(extension) = detected.extension() {
        hint.with_extension(extension);
    }

    let source = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|err| failure(AudioErrorKind::DecodeFailed, "unrecognised container").with_cause(err))?;
    let mut reader = probed.format;

    let track = reader
        .tracks()
        .iter()
        .find(|track| track.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| failure(AudioErrorKind::FormatUnsupported, "no decodable audio track"))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut channels = track
        .codec_params
        .channels
        .map(|channels| channels.count() as u16)
        .unwrap_or(0);
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|err| failure(AudioErrorKind::FormatUnsupported, "unsupported codec").with_cause(err))?;

    let mut samples = Vec::new();
    loop {
        let packet = match reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err)) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(err) => {
                return Err(failure(AudioErrorKind::DecodeFailed, "container read failed").with_cause(err))
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate = spec.rate;
                channels = spec.channels.count() as u16;
                let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buffer.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buffer.samples());
            }
            Err(SymphoniaError::DecodeError(reason)) => {
                debug!(reason, "skipping corrupt packet");
            }
            Err(err) => {
                return Err(failure(AudioErrorKind::DecodeFailed, "packet decode failed").with_cause(err))
            }
        }
    }

    if samples.is_empty() || sample_rate == 0 || channels == 0 {
        return Err(failure(AudioErrorKind::DecodeFailed, "no audio frames decoded"));
    }

    debug!(
        byte_len,
        sample_rate,
        channels,
        samples = samples.len(),
        "decoded audio buffer"
    );

    Ok(DecodedAudio {
        sample_rate,
        channels,
        samples,
    })
}

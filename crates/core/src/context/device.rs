//! Output-device host backed by cpal.
//!
//! Each transport node owns its own output stream on a dedicated thread;
//! cpal streams are not `Send` on every platform, so they never leave the
//! thread that built them.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use rubato::{FftFixedIn, Resampler};
use tracing::{debug, info, warn};

use super::{
    decode::decode_off_thread, AudioHost, DecodedAudio, HandleState, HostContext, TransportNode,
    TransportRequest,
};
use crate::{format::NormalizedAudio, AudioError, AudioErrorKind, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Input frames per resampler block.
const RESAMPLE_CHUNK: usize = 1024;

/// Host that renders to a real output device.
#[derive(Debug, Default)]
pub struct DeviceHost {
    preferred_device: Option<String>,
}

impl DeviceHost {
    pub fn new(preferred_device: Option<String>) -> Self {
        Self { preferred_device }
    }
}

#[async_trait]
impl AudioHost for DeviceHost {
    fn name(&self) -> &'static str {
        "device"
    }

    async fn create_context(&self) -> Result<Arc<dyn HostContext>> {
        let preferred = self.preferred_device.clone();
        let probe = preferred.clone();
        let (device_name, sample_rate) = tokio::task::spawn_blocking(move || {
            let device = select_device(probe.as_deref())?;
            let name = device.name().unwrap_or_else(|_| "unknown".to_string());
            let config = device.default_output_config().map_err(|err| {
                AudioError::initialization_failed("output device has no default configuration")
                    .with_cause(err)
            })?;
            Ok::<_, AudioError>((name, config.sample_rate().0))
        })
        .await
        .map_err(|err| AudioError::initialization_failed("device probe aborted").with_cause(err))??;

        info!(device = %device_name, sample_rate, "output device context created");
        Ok(Arc::new(DeviceContext {
            preferred_device: preferred,
            sample_rate,
            state: Mutex::new(HandleState::Suspended),
        }))
    }
}

#[derive(Debug)]
struct DeviceContext {
    preferred_device: Option<String>,
    sample_rate: u32,
    state: Mutex<HandleState>,
}

impl DeviceContext {
    fn transition(&self, next: HandleState) -> Result<()> {
        let mut state = self.state.lock();
        if *state == HandleState::Closed {
            return Err(AudioError::initialization_failed("audio context has been closed"));
        }
        *state = next;
        Ok(())
    }
}

#[async_trait]
impl HostContext for DeviceContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn state(&self) -> HandleState {
        *self.state.lock()
    }

    async fn resume(&self) -> Result<()> {
        self.transition(HandleState::Running)
    }

    async fn suspend(&self) -> Result<()> {
        self.transition(HandleState::Suspended)
    }

    async fn close(&self) -> Result<()> {
        *self.state.lock() = HandleState::Closed;
        Ok(())
    }

    async fn decode(&self, audio: NormalizedAudio) -> Result<DecodedAudio> {
        decode_off_thread(audio).await
    }

    fn start_transport(&self, request: TransportRequest) -> Result<Box<dyn TransportNode>> {
        if self.state() != HandleState::Running {
            return Err(AudioError::playback_failed(
                "audio context is not running; resume it before starting playback",
            ));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let preferred = self.preferred_device.clone();
        let (stop_flag, finished_flag) = (stop.clone(), finished.clone());

        thread::Builder::new()
            .name("kiosk-voice-transport".to_string())
            .spawn(move || {
                let TransportRequest {
                    buffer,
                    offset,
                    gain,
                    ended,
                } = request;
                match render(preferred.as_deref(), &buffer, offset, gain, &stop_flag) {
                    Ok(()) if !stop_flag.load(Ordering::SeqCst) => {
                        let _ = ended.send(());
                    }
                    Ok(()) => {}
                    Err(err) => warn!(%err, "output transport failed"),
                }
                finished_flag.store(true, Ordering::SeqCst);
            })
            .map_err(|err| {
                AudioError::playback_failed("failed to spawn transport thread").with_cause(err)
            })?;

        Ok(Box::new(DeviceTransport { stop, finished }))
    }
}

#[derive(Debug)]
struct DeviceTransport {
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

impl TransportNode for DeviceTransport {
    fn stop(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl Drop for DeviceTransport {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn select_device(preferred: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    if let Some(wanted) = preferred {
        match host.output_devices() {
            Ok(mut devices) => {
                if let Some(device) =
                    devices.find(|device| device.name().map(|name| name == wanted).unwrap_or(false))
                {
                    return Ok(device);
                }
                warn!(device = wanted, "preferred output device not found, using default");
            }
            Err(err) => warn!(%err, "failed to enumerate output devices"),
        }
    }

    host.default_output_device()
        .ok_or_else(|| AudioError::initialization_failed("no output device available"))
}

fn render(
    preferred: Option<&str>,
    buffer: &DecodedAudio,
    offset: Duration,
    gain: Arc<super::GainNode>,
    stop: &AtomicBool,
) -> Result<()> {
    let device = select_device(preferred)?;
    let supported = device.default_output_config().map_err(|err| {
        AudioError::initialization_failed("output device has no default configuration")
            .with_cause(err)
    })?;
    if supported.sample_format() != cpal::SampleFormat::F32 {
        return Err(AudioError::new(
            AudioErrorKind::FormatUnsupported,
            format!(
                "output device uses {:?} samples; only f32 streams are supported",
                supported.sample_format()
            ),
        ));
    }

    let config: cpal::StreamConfig = supported.config();
    let out_channels = usize::from(config.channels.max(1));
    let source = prepare_output(buffer, offset, config.sample_rate.0, out_channels)?;
    let total = source.len() / out_channels;
    let cursor = Arc::new(AtomicUsize::new(0));

    let position = cursor.clone();
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let level = gain.value();
                for frame in data.chunks_mut(out_channels) {
                    let index = position.fetch_add(1, Ordering::Relaxed);
                    match source.get(index * out_channels..(index + 1) * out_channels) {
                        Some(samples) => frame
                            .iter_mut()
                            .zip(samples)
                            .for_each(|(slot, sample)| *slot = sample * level),
                        None => frame.fill(0.0),
                    }
                }
            },
            |err| warn!(%err, "output stream error"),
            None,
        )
        .map_err(|err| AudioError::playback_failed("failed to open output stream").with_cause(err))?;
    stream
        .play()
        .map_err(|err| AudioError::playback_failed("failed to start output stream").with_cause(err))?;

    while !stop.load(Ordering::SeqCst) && cursor.load(Ordering::Relaxed) < total {
        thread::sleep(POLL_INTERVAL);
    }
    debug!(frames = total, stopped = stop.load(Ordering::SeqCst), "output transport finished");
    Ok(())
}

/// Interleaved frames of the clip from `offset` onwards, at the device's
/// rate and channel count.
fn prepare_output(
    buffer: &DecodedAudio,
    offset: Duration,
    out_rate: u32,
    out_channels: usize,
) -> Result<Vec<f32>> {
    let channels = usize::from(buffer.channels.max(1));
    let start = ((offset.as_secs_f64() * f64::from(buffer.sample_rate)) as usize).min(buffer.frames());

    let mut planar = vec![Vec::with_capacity(buffer.frames() - start); channels];
    for frame in buffer.samples.chunks_exact(channels).skip(start) {
        for (channel, sample) in planar.iter_mut().zip(frame) {
            channel.push(*sample);
        }
    }

    let planar = resample(planar, buffer.sample_rate, out_rate)?;
    Ok(interleave(&planar, out_channels))
}

fn resample(planar: Vec<Vec<f32>>, from: u32, to: u32) -> Result<Vec<Vec<f32>>> {
    let frames = planar.first().map_or(0, Vec::len);
    if from == to || from == 0 || to == 0 || frames == 0 {
        return Ok(planar);
    }

    let mut resampler =
        FftFixedIn::<f32>::new(from as usize, to as usize, RESAMPLE_CHUNK, 2, planar.len())
            .map_err(|err| {
                AudioError::new(
                    AudioErrorKind::FormatUnsupported,
                    format!("cannot convert {from} Hz audio to {to} Hz"),
                )
                .with_cause(err)
            })?;

    let expected = (frames as f64 * f64::from(to) / f64::from(from)).round() as usize;
    let mut out = vec![Vec::with_capacity(expected + RESAMPLE_CHUNK); planar.len()];

    let mut position = 0;
    while frames - position >= resampler.input_frames_next() {
        let end = position + resampler.input_frames_next();
        let block: Vec<&[f32]> = planar.iter().map(|channel| &channel[position..end]).collect();
        append(&mut out, resampler.process(&block, None).map_err(conversion_failed)?);
        position = end;
    }
    if position < frames {
        let tail: Vec<&[f32]> = planar.iter().map(|channel| &channel[position..]).collect();
        append(
            &mut out,
            resampler
                .process_partial(Some(tail.as_slice()), None)
                .map_err(conversion_failed)?,
        );
    }

    let delay = resampler.output_delay();
    while out[0].len() < delay + expected {
        let flushed = resampler
            .process_partial::<&[f32]>(None, None)
            .map_err(conversion_failed)?;
        if flushed.first().map_or(true, Vec::is_empty) {
            break;
        }
        append(&mut out, flushed);
    }

    for channel in &mut out {
        channel.drain(..delay.min(channel.len()));
        channel.truncate(expected);
    }
    Ok(out)
}

fn append(out: &mut [Vec<f32>], chunk: Vec<Vec<f32>>) {
    for (channel, samples) in out.iter_mut().zip(chunk) {
        channel.extend(samples);
    }
}

fn conversion_failed(err: rubato::ResampleError) -> AudioError {
    AudioError::playback_failed("sample rate conversion failed").with_cause(err)
}

/// Maps source channels onto the device layout. Matching layouts pass
/// through, a mono device gets the average of all sources, and otherwise
/// output channel `n` takes source channel `n % sources`.
fn interleave(planar: &[Vec<f32>], out_channels: usize) -> Vec<f32> {
    let sources = planar.len();
    let frames = planar.first().map_or(0, Vec::len);
    let mut out = Vec::with_capacity(frames * out_channels);

    for index in 0..frames {
        if out_channels == 1 && sources > 1 {
            out.push(planar.iter().map(|channel| channel[index]).sum::<f32>() / sources as f32);
            continue;
        }
        for channel in 0..out_channels {
            out.push(planar[channel % sources][index]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::f32::consts::PI;

    use super::*;

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn resampling_keeps_length_and_level() {
        let tone: Vec<f32> = (0..16_000)
            .map(|i| (2.0 * PI * 440.0 * i as f32 / 16_000.0).sin() * 0.5)
            .collect();
        let out = resample(vec![tone.clone()], 16_000, 48_000).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 48_000);
        let ratio = rms(&out[0][4_800..43_200]) / rms(&tone);
        assert!((0.9..1.1).contains(&ratio), "{ratio}");

        assert_eq!(resample(vec![tone.clone()], 48_000, 48_000).unwrap()[0], tone);
    }

    #[test]
    fn stereo_clips_keep_their_channels() {
        let buffer = DecodedAudio {
            sample_rate: 48_000,
            channels: 2,
            samples: vec![0.1, -0.1, 0.2, -0.2, 0.3, -0.3],
        };

        let stereo = prepare_output(&buffer, Duration::ZERO, 48_000, 2).unwrap();
        assert_eq!(stereo, buffer.samples);

        let mono = prepare_output(&buffer, Duration::ZERO, 48_000, 1).unwrap();
        assert_eq!(mono, vec![0.0, 0.0, 0.0]);

        let surround = interleave(&[vec![0.5], vec![-0.5]], 4);
        assert_eq!(surround, vec![0.5, -0.5, 0.5, -0.5]);
    }

    #[test]
    fn offset_skips_whole_frames() {
        let buffer = DecodedAudio {
            sample_rate: 4,
            channels: 1,
            samples: vec![0.0, 0.25, 0.5, 0.75],
        };
        let out = prepare_output(&buffer, Duration::from_millis(500), 4, 2).unwrap();
        assert_eq!(out, vec![0.5, 0.5, 0.75, 0.75]);
    }
}

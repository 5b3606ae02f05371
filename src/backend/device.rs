use super::{AudioBackend, StreamFormat};
use crate::bridge::RenderHandle;
use crate::error::{PetalMixError, Result};
use crate::render::{InputBlock, RenderState};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use crossbeam_channel::{Receiver, Sender, bounded};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Blocks of input buffered between the input and output callbacks.
const INPUT_BUFFER_BLOCKS: usize = 4;

/// State shared between the backend and its stream callbacks.
#[derive(Default)]
struct DeviceShared {
    running: AtomicBool,
    output_latency_us: AtomicU64,
    input_latency_us: AtomicU64,
    /// Input channels delivered by the open streams.
    input_channels: AtomicU16,
    device_error: Mutex<Option<PetalMixError>>,
    input_error: Mutex<Option<PetalMixError>>,
}

impl DeviceShared {
    fn report(&self, error: PetalMixError) {
        let mut slot = self
            .device_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    fn report_input(&self, error: PetalMixError) {
        self.input_channels.store(0, Ordering::Relaxed);
        *self
            .input_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    fn take_input_error(&self) -> Option<PetalMixError> {
        self.input_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[derive(Debug, Clone, Copy)]
struct Negotiated {
    format: StreamFormat,
    output_sample_format: cpal::SampleFormat,
    input: Option<(u16, cpal::SampleFormat)>,
}

struct AudioThread {
    stop_tx: Sender<()>,
    join: JoinHandle<()>,
}

/// Backend on the default `cpal` host.
///
/// `cpal::Stream` is not `Send` on every platform, so the streams are created,
/// played and dropped on a dedicated thread that lives from [`start`] to
/// [`stop`]. Input, when enabled, is captured by a separate input stream and
/// handed to the output callback through a ring buffer.
///
/// [`start`]: AudioBackend::start
/// [`stop`]: AudioBackend::stop
pub struct CpalBackend {
    negotiated: Option<Negotiated>,
    shared: Arc<DeviceShared>,
    input_error: Option<PetalMixError>,
    thread: Option<AudioThread>,
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalBackend {
    pub fn new() -> Self {
        Self {
            negotiated: None,
            shared: Arc::new(DeviceShared::default()),
            input_error: None,
            thread: None,
        }
    }
}

impl AudioBackend for CpalBackend {
    fn configure(&mut self, format: &StreamFormat) -> Result<()> {
        if self.thread.is_some() {
            return Err(PetalMixError::ReconfigureBusy(
                "audio stream is running".into(),
            ));
        }

        let host = cpal::default_host();
        let device = host.default_output_device().ok_or_else(|| {
            crate::error::PetalMixError::AudioDevice("No default output device available".into())
        })?;
        let output_sample_format = output_sample_format(&device, format)?;

        self.input_error = None;
        self.shared.take_input_error();
        let input = if format.enable_input {
            match input_config(&host) {
                Ok(input) => Some(input),
                Err(error) => {
                    log::warn!("Audio input disabled: {}", error);
                    self.input_error = Some(error);
                    None
                }
            }
        } else {
            None
        };

        log::debug!(
            "Configured output {} Hz x {} ({:?}), input {:?}",
            format.sample_rate,
            format.channels,
            output_sample_format,
            input
        );
        self.negotiated = Some(Negotiated {
            format: *format,
            output_sample_format,
            input,
        });
        Ok(())
    }

    fn start(&mut self, handle: RenderHandle<RenderState>) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let negotiated = self.negotiated.ok_or_else(|| {
            crate::error::PetalMixError::Engine("Audio backend is not configured".into())
        })?;

        let shared = self.shared.clone();
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let join = std::thread::Builder::new()
            .name("petalmix-audio".into())
            .spawn(move || run_streams(negotiated, handle, shared, ready_tx, stop_rx))
            .map_err(|e| {
                crate::error::PetalMixError::SystemFatal(format!(
                    "Failed to spawn audio thread: {}",
                    e
                ))
            })?;

        let ready = ready_rx.recv().unwrap_or_else(|_| {
            Err(PetalMixError::SystemFatal(
                "Audio thread exited during start".into(),
            ))
        });
        if let Err(error) = ready {
            let _ = join.join();
            return Err(error);
        }

        self.shared.running.store(true, Ordering::Relaxed);
        self.thread = Some(AudioThread { stop_tx, join });
        log::debug!("Audio streams started");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(thread) = self.thread.take() {
            self.shared.running.store(false, Ordering::Relaxed);
            let _ = thread.stop_tx.send(());
            if thread.join.join().is_err() {
                log::error!("Audio thread panicked");
            }
            log::debug!("Audio streams stopped");
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    fn input_channels(&self) -> u16 {
        if self.thread.is_some() {
            return self.shared.input_channels.load(Ordering::Relaxed);
        }
        self.negotiated
            .and_then(|negotiated| negotiated.input)
            .map_or(0, |(channels, _)| channels)
    }

    fn output_latency(&self) -> Duration {
        Duration::from_micros(self.shared.output_latency_us.load(Ordering::Relaxed))
    }

    fn input_latency(&self) -> Duration {
        Duration::from_micros(self.shared.input_latency_us.load(Ordering::Relaxed))
    }

    fn buffer_duration(&self) -> Duration {
        self.negotiated
            .map_or(Duration::ZERO, |negotiated| negotiated.format.block_duration())
    }

    fn take_device_error(&mut self) -> Option<PetalMixError> {
        let error = self
            .shared
            .device_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if error.is_some() {
            self.shared.running.store(false, Ordering::Relaxed);
        }
        error
    }

    fn take_input_error(&mut self) -> Option<PetalMixError> {
        self.input_error.take().or_else(|| self.shared.take_input_error())
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn output_sample_format(device: &cpal::Device, format: &StreamFormat) -> Result<cpal::SampleFormat> {
    let rate = cpal::SampleRate(format.sample_rate);
    let supported = device.supported_output_configs().map_err(|e| {
        crate::error::PetalMixError::HardwareConfiguration(format!(
            "Failed to query output configs: {}",
            e
        ))
    })?;
    let matching = supported
        .filter(|range| range.channels() == format.channels)
        .filter(|range| range.min_sample_rate() <= rate && rate <= range.max_sample_rate())
        .map(|range| range.sample_format())
        .collect::<Vec<_>>();

    [cpal::SampleFormat::F32, cpal::SampleFormat::I16, cpal::SampleFormat::U16]
        .into_iter()
        .find(|candidate| matching.contains(candidate))
        .ok_or_else(|| {
            crate::error::PetalMixError::HardwareConfiguration(format!(
                "Output device does not support {} Hz x {} channels",
                format.sample_rate, format.channels
            ))
        })
}

fn input_config(host: &cpal::Host) -> Result<(u16, cpal::SampleFormat)> {
    let device = host
        .default_input_device()
        .ok_or_else(|| PetalMixError::InputUnavailable("No default input device".into()))?;
    let config = device
        .default_input_config()
        .map_err(|e| PetalMixError::InputUnavailable(format!("No usable input config: {}", e)))?;
    Ok((config.channels(), config.sample_format()))
}

struct Streams {
    _output: cpal::Stream,
    _input: Option<cpal::Stream>,
}

/// Body of the audio thread: open and play the streams, report, then hold them
/// until told to stop.
fn run_streams(
    negotiated: Negotiated,
    handle: RenderHandle<RenderState>,
    shared: Arc<DeviceShared>,
    ready_tx: Sender<Result<()>>,
    stop_rx: Receiver<()>,
) {
    match open_streams(negotiated, handle, shared) {
        Ok(streams) => {
            let _ = ready_tx.send(Ok(()));
            let _ = stop_rx.recv();
            drop(streams);
        }
        Err(error) => {
            let _ = ready_tx.send(Err(error));
        }
    }
}

fn open_streams(
    negotiated: Negotiated,
    handle: RenderHandle<RenderState>,
    shared: Arc<DeviceShared>,
) -> Result<Streams> {
    let format = negotiated.format;
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or_else(|| {
        crate::error::PetalMixError::AudioDevice("No default output device available".into())
    })?;

    let capture = negotiated.input.and_then(|(channels, sample_format)| {
        let opened = open_capture(&host, &format, channels, sample_format, &shared);
        without_input_on_error(opened, &shared)
    });
    let (input_stream, consumer, input_channels) = match capture {
        Some(Capture {
            stream,
            consumer,
            channels,
        }) => (Some(stream), Some(consumer), channels),
        None => (None, None, 0),
    };
    shared.input_channels.store(input_channels, Ordering::Relaxed);

    let config = cpal::StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Fixed(format.block_size as u32),
    };
    let render = OutputRender::new(handle, shared.clone(), consumer, input_channels, &format);

    let output = match negotiated.output_sample_format {
        cpal::SampleFormat::F32 => create_stream::<f32>(&device, &config, render, shared)?,
        cpal::SampleFormat::I16 => create_stream::<i16>(&device, &config, render, shared)?,
        cpal::SampleFormat::U16 => create_stream::<u16>(&device, &config, render, shared)?,
        _ => {
            return Err(crate::error::PetalMixError::AudioFormat(
                "Unsupported sample format".into(),
            ));
        }
    };

    output.play().map_err(|e| {
        crate::error::PetalMixError::AudioDevice(format!("Failed to start stream: {}", e))
    })?;

    Ok(Streams {
        _output: output,
        _input: input_stream,
    })
}

/// An open input stream and the consumer end of its capture ring.
struct Capture {
    stream: cpal::Stream,
    consumer: HeapCons<f32>,
    channels: u16,
}

fn open_capture(
    host: &cpal::Host,
    format: &StreamFormat,
    channels: u16,
    sample_format: cpal::SampleFormat,
    shared: &Arc<DeviceShared>,
) -> Result<Capture> {
    let capacity = format.max_frames * usize::from(channels) * INPUT_BUFFER_BLOCKS;
    let (producer, consumer) = HeapRb::<f32>::new(capacity.max(1)).split();
    let stream = open_input(host, format, channels, sample_format, producer, shared)?;
    stream.play().map_err(|e| {
        PetalMixError::InputUnavailable(format!("Failed to start input stream: {}", e))
    })?;
    Ok(Capture {
        stream,
        consumer,
        channels,
    })
}

/// Input problems never stop output: a failed input is recorded for the engine and
/// rendering continues with zero input channels.
fn without_input_on_error<T>(opened: Result<T>, shared: &DeviceShared) -> Option<T> {
    match opened {
        Ok(capture) => Some(capture),
        Err(error) => {
            let error = match error {
                PetalMixError::InputUnavailable(_) | PetalMixError::InputAccessDenied => error,
                other => PetalMixError::InputUnavailable(other.to_string()),
            };
            log::warn!("Audio input disabled: {}", error);
            shared.report_input(error);
            None
        }
    }
}

/// Everything the output callback owns.
///
/// Scratch buffers hold one slice of `max_frames`; device buffers of any size are
/// rendered slice by slice so the callback never reallocates.
struct OutputRender {
    handle: RenderHandle<RenderState>,
    shared: Arc<DeviceShared>,
    consumer: Option<HeapCons<f32>>,
    input_channels: u16,
    channels: u16,
    max_frames: usize,
    mix: Vec<f32>,
    input: Vec<f32>,
}

impl OutputRender {
    fn new(
        handle: RenderHandle<RenderState>,
        shared: Arc<DeviceShared>,
        consumer: Option<HeapCons<f32>>,
        input_channels: u16,
        format: &StreamFormat,
    ) -> Self {
        let max_frames = format.max_frames.max(1);
        Self {
            handle,
            shared,
            consumer,
            input_channels,
            channels: format.channels.max(1),
            max_frames,
            mix: vec![0.0; max_frames * usize::from(format.channels.max(1))],
            input: vec![0.0; max_frames * usize::from(input_channels)],
        }
    }

    fn fill<T>(&mut self, data: &mut [T])
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = usize::from(self.channels);
        for chunk in data.chunks_mut(self.max_frames * channels) {
            let frames = chunk.len() / channels;
            let mix = &mut self.mix[..chunk.len()];
            mix.fill(0.0);

            let input = match self.consumer.as_mut() {
                Some(consumer) => {
                    let input = &mut self.input[..frames * usize::from(self.input_channels)];
                    input.fill(0.0);
                    consumer.pop_slice(input);
                    Some(InputBlock::new(input, self.input_channels))
                }
                None => None,
            };

            self.handle.render(mix, input);
            for (sample, value) in chunk.iter_mut().zip(mix.iter()) {
                *sample = T::from_sample(*value);
            }
        }
    }
}

fn create_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut render: OutputRender,
    shared: Arc<DeviceShared>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], info: &cpal::OutputCallbackInfo| {
                let timestamp = info.timestamp();
                if let Some(latency) = timestamp.playback.duration_since(&timestamp.callback) {
                    render
                        .shared
                        .output_latency_us
                        .store(latency.as_micros() as u64, Ordering::Relaxed);
                }

                render.fill(data);
            },
            move |err| stream_error(&shared, err),
            None,
        )
        .map_err(|e| {
            crate::error::PetalMixError::AudioDevice(format!("Failed to build stream: {}", e))
        })?;

    Ok(stream)
}

fn open_input(
    host: &cpal::Host,
    format: &StreamFormat,
    channels: u16,
    sample_format: cpal::SampleFormat,
    producer: HeapProd<f32>,
    shared: &Arc<DeviceShared>,
) -> Result<cpal::Stream> {
    let device = host
        .default_input_device()
        .ok_or_else(|| PetalMixError::InputUnavailable("No default input device".into()))?;
    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    match sample_format {
        cpal::SampleFormat::F32 => create_input_stream::<f32>(&device, &config, producer, shared),
        cpal::SampleFormat::I16 => create_input_stream::<i16>(&device, &config, producer, shared),
        cpal::SampleFormat::U16 => create_input_stream::<u16>(&device, &config, producer, shared),
        _ => Err(crate::error::PetalMixError::AudioFormat(
            "Unsupported input sample format".into(),
        )),
    }
}

fn create_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut producer: HeapProd<f32>,
    shared: &Arc<DeviceShared>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let latency_shared = shared.clone();
    let error_shared = shared.clone();

    device
        .build_input_stream(
            config,
            move |data: &[T], info: &cpal::InputCallbackInfo| {
                let timestamp = info.timestamp();
                if let Some(latency) = timestamp.callback.duration_since(&timestamp.capture) {
                    latency_shared
                        .input_latency_us
                        .store(latency.as_micros() as u64, Ordering::Relaxed);
                }
                // Overflow drops the newest input.
                for &sample in data {
                    if producer.try_push(f32::from_sample(sample)).is_err() {
                        break;
                    }
                }
            },
            move |err| stream_error(&error_shared, err),
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                PetalMixError::InputUnavailable("Input device not available".into())
            }
            other => PetalMixError::AudioDevice(format!("Failed to build input stream: {}", other)),
        })
}

fn stream_error(shared: &DeviceShared, err: cpal::StreamError) {
    match err {
        cpal::StreamError::DeviceNotAvailable => {
            log::error!("Audio device lost");
            shared.running.store(false, Ordering::Relaxed);
            shared.report(PetalMixError::SystemFatal("Audio device not available".into()));
        }
        other => log::error!("Audio stream error: {}", other),
    }
}

//! Host audio capture.
//!
//! An [`AudioSource`] pushes PCM chunks into a bounded ring. Each
//! [`AudioSubscriber`] reads the ring through its own cursor, so every
//! subscriber sees a chunk at most once and a slow subscriber only loses
//! the chunks that were overwritten.
//!
//! Audio is its own failure domain: a failing source marks the service
//! faulted and stops recording. Video capture never looks at it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CoreError;

// ── AudioChunk ───────────────────────────────────────────────────

/// PCM format of a chunk. Payloads are interleaved signed 16-bit
/// little-endian samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    /// Payload size of `duration` worth of samples.
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let frames = (self.sample_rate as f64 * duration.as_secs_f64()).round() as usize;
        frames * self.channels as usize * 2
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioChunk {
    pub payload: Bytes,
    /// Starts at 1 and increases by one per chunk pushed.
    pub sequence_number: u64,
    pub format: AudioFormat,
}

// ── AudioRing ────────────────────────────────────────────────────

/// Bounded chunk buffer; the oldest chunk is dropped on overflow.
#[derive(Debug)]
struct AudioRing {
    chunks: VecDeque<AudioChunk>,
    capacity: usize,
    next_sequence: u64,
}

impl AudioRing {
    fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            next_sequence: 1,
        }
    }

    fn push(&mut self, format: AudioFormat, payload: Bytes) -> u64 {
        if self.chunks.len() == self.capacity {
            self.chunks.pop_front();
        }
        let sequence_number = self.next_sequence;
        self.next_sequence += 1;
        self.chunks.push_back(AudioChunk {
            payload,
            sequence_number,
            format,
        });
        sequence_number
    }

    /// First chunk at or after `cursor`.
    fn read_from(&self, cursor: u64) -> Option<&AudioChunk> {
        let oldest = self.chunks.front()?.sequence_number;
        let index = cursor.saturating_sub(oldest) as usize;
        self.chunks.get(index)
    }
}

// ── AudioSink ────────────────────────────────────────────────────

struct AudioShared {
    ring: Mutex<AudioRing>,
    recording: AtomicBool,
    faulted: AtomicBool,
}

impl AudioShared {
    fn ring(&self) -> MutexGuard<'_, AudioRing> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle a source writes through. Cheap to clone; safe to call from an
/// audio driver callback.
#[derive(Clone)]
pub struct AudioSink {
    shared: Arc<AudioShared>,
}

impl AudioSink {
    /// Append a chunk. Ignored while the service is not recording.
    pub fn push(&self, format: AudioFormat, payload: impl Into<Bytes>) {
        if !self.shared.recording.load(Ordering::SeqCst) {
            return;
        }
        self.shared.ring().push(format, payload.into());
    }

    /// Report an unrecoverable source failure.
    pub fn fail(&self, reason: impl std::fmt::Display) {
        let was_recording = self.shared.recording.swap(false, Ordering::SeqCst);
        if !self.shared.faulted.swap(true, Ordering::SeqCst) {
            warn!(recording = was_recording, "audio source failed: {reason}");
        }
    }
}

// ── AudioSource ──────────────────────────────────────────────────

/// Producer of PCM audio.
pub trait AudioSource: Send {
    fn name(&self) -> &'static str;

    /// Begin producing into `sink`. Must return promptly; production
    /// happens on the source's own thread or driver callback.
    fn start(&mut self, sink: AudioSink) -> Result<(), CoreError>;

    /// Stop producing. Must be safe to call when not started.
    fn stop(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioSourceKind {
    #[default]
    Silence,
    Tone,
    /// Default input device through cpal.
    Cpal,
}

impl std::str::FromStr for AudioSourceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "silence" => Ok(AudioSourceKind::Silence),
            "tone" => Ok(AudioSourceKind::Tone),
            "cpal" => Ok(AudioSourceKind::Cpal),
            other => Err(CoreError::InvalidSetting {
                name: "audio.source",
                reason: format!("unknown audio source {other:?}"),
            }),
        }
    }
}

// ── AudioConfig ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Start recording when the host starts.
    pub enabled: bool,
    pub source: AudioSourceKind,
    /// Chunks kept for subscribers.
    pub ring_capacity: usize,
    pub chunk_duration: Duration,
    pub format: AudioFormat,
    /// Frequency of the test tone.
    pub tone_hz: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            source: AudioSourceKind::Silence,
            ring_capacity: 64,
            chunk_duration: Duration::from_millis(20),
            format: AudioFormat {
                sample_rate: 48_000,
                channels: 2,
            },
            tone_hz: 440.0,
        }
    }
}

/// Build the configured source.
pub fn open_source(config: &AudioConfig) -> Result<Box<dyn AudioSource>, CoreError> {
    match config.source {
        AudioSourceKind::Silence => Ok(Box::new(ToneSource::silence(
            config.format,
            config.chunk_duration,
        ))),
        AudioSourceKind::Tone => Ok(Box::new(ToneSource::tone(
            config.format,
            config.chunk_duration,
            config.tone_hz,
        ))),
        #[cfg(feature = "cpal")]
        AudioSourceKind::Cpal => Ok(Box::new(cpal_source::CpalSource::new(config.chunk_duration))),
        #[cfg(not(feature = "cpal"))]
        AudioSourceKind::Cpal => Err(CoreError::InvalidSetting {
            name: "audio.source",
            reason: "built without the `cpal` feature".into(),
        }),
    }
}

// ── AudioCaptureService ──────────────────────────────────────────

pub struct AudioCaptureService {
    shared: Arc<AudioShared>,
    source: Mutex<Box<dyn AudioSource>>,
}

impl AudioCaptureService {
    pub fn new(source: Box<dyn AudioSource>, ring_capacity: usize) -> Self {
        Self {
            shared: Arc::new(AudioShared {
                ring: Mutex::new(AudioRing::new(ring_capacity)),
                recording: AtomicBool::new(false),
                faulted: AtomicBool::new(false),
            }),
            source: Mutex::new(source),
        }
    }

    pub fn from_config(config: &AudioConfig) -> Result<Self, CoreError> {
        Ok(Self::new(open_source(config)?, config.ring_capacity))
    }

    /// A service whose source could not be opened. It starts faulted and
    /// every `start_recording` reports `reason`.
    pub fn unavailable(reason: impl Into<String>, ring_capacity: usize) -> Self {
        let service = Self::new(
            Box::new(UnavailableSource {
                reason: reason.into(),
            }),
            ring_capacity,
        );
        service.shared.faulted.store(true, Ordering::SeqCst);
        service
    }

    fn source(&self) -> MutexGuard<'_, Box<dyn AudioSource>> {
        self.source.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Idempotent. Clears a previous fault.
    pub fn start_recording(&self) -> Result<(), CoreError> {
        let mut source = self.source();
        if self.shared.recording.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.shared.faulted.swap(false, Ordering::SeqCst) {
            // The failed run never got a matching stop.
            source.stop();
        }
        self.shared.recording.store(true, Ordering::SeqCst);
        let sink = AudioSink {
            shared: Arc::clone(&self.shared),
        };
        if let Err(e) = source.start(sink) {
            self.shared.recording.store(false, Ordering::SeqCst);
            self.shared.faulted.store(true, Ordering::SeqCst);
            warn!(source = source.name(), "audio start failed: {e}");
            return Err(e);
        }
        info!(source = source.name(), "audio recording started");
        Ok(())
    }

    /// Idempotent. Also releases a source that failed mid-run.
    pub fn stop_recording(&self) {
        let mut source = self.source();
        let was_recording = self.shared.recording.swap(false, Ordering::SeqCst);
        if was_recording || self.shared.faulted.load(Ordering::SeqCst) {
            source.stop();
        }
        if was_recording {
            info!(source = source.name(), "audio recording stopped");
        }
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::SeqCst)
    }

    pub fn is_faulted(&self) -> bool {
        self.shared.faulted.load(Ordering::SeqCst)
    }

    /// A reader that starts with the next chunk pushed.
    pub fn subscribe(&self) -> AudioSubscriber {
        let cursor = self.shared.ring().next_sequence;
        AudioSubscriber {
            shared: Arc::clone(&self.shared),
            cursor,
        }
    }
}

impl Drop for AudioCaptureService {
    fn drop(&mut self) {
        self.stop_recording();
    }
}

// ── AudioSubscriber ──────────────────────────────────────────────

pub struct AudioSubscriber {
    shared: Arc<AudioShared>,
    cursor: u64,
}

impl AudioSubscriber {
    /// Non-blocking. `None` when no unread chunk is buffered.
    pub fn get_next_audio_chunk(&mut self) -> Option<AudioChunk> {
        let ring = self.shared.ring();
        let chunk = ring.read_from(self.cursor)?.clone();
        if chunk.sequence_number > self.cursor {
            debug!(
                skipped = chunk.sequence_number - self.cursor,
                "audio subscriber fell behind"
            );
        }
        self.cursor = chunk.sequence_number + 1;
        Some(chunk)
    }
}

// ── UnavailableSource ────────────────────────────────────────────

struct UnavailableSource {
    reason: String,
}

impl AudioSource for UnavailableSource {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    fn start(&mut self, _sink: AudioSink) -> Result<(), CoreError> {
        Err(CoreError::Other(format!("audio unavailable: {}", self.reason)))
    }

    fn stop(&mut self) {}
}

// ── ToneSource ───────────────────────────────────────────────────

/// Generated sine tone, or silence. Runs without any audio hardware.
pub struct ToneSource {
    format: AudioFormat,
    chunk_duration: Duration,
    frequency: Option<f32>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ToneSource {
    pub fn silence(format: AudioFormat, chunk_duration: Duration) -> Self {
        Self::with_frequency(format, chunk_duration, None)
    }

    pub fn tone(format: AudioFormat, chunk_duration: Duration, hz: f32) -> Self {
        Self::with_frequency(format, chunk_duration, Some(hz))
    }

    fn with_frequency(format: AudioFormat, chunk_duration: Duration, frequency: Option<f32>) -> Self {
        Self {
            format,
            chunk_duration: chunk_duration.max(Duration::from_millis(1)),
            frequency,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

fn render_tone(format: AudioFormat, frames: usize, frequency: Option<f32>, phase: &mut u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(frames * format.channels as usize * 2);
    for _ in 0..frames {
        let sample = match frequency {
            Some(hz) => {
                let t = *phase as f32 / format.sample_rate as f32;
                ((t * hz * std::f32::consts::TAU).sin() * i16::MAX as f32 * 0.25) as i16
            }
            None => 0,
        };
        *phase += 1;
        for _ in 0..format.channels {
            out.extend_from_slice(&sample.to_le_bytes());
        }
    }
    out
}

impl AudioSource for ToneSource {
    fn name(&self) -> &'static str {
        match self.frequency {
            Some(_) => "tone",
            None => "silence",
        }
    }

    fn start(&mut self, sink: AudioSink) -> Result<(), CoreError> {
        self.stop();
        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let (format, chunk, frequency) = (self.format, self.chunk_duration, self.frequency);
        let frames = format.bytes_for(chunk) / (format.channels.max(1) as usize * 2);

        let handle = thread::Builder::new()
            .name("audio-tone".into())
            .spawn(move || {
                let mut phase = 0u64;
                let mut next = Instant::now();
                while running.load(Ordering::SeqCst) {
                    sink.push(format, render_tone(format, frames, frequency, &mut phase));
                    next += chunk;
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else {
                        next = now;
                    }
                }
            })
            .map_err(|e| CoreError::Other(format!("failed to spawn audio thread: {e}")))?;
        self.thread = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

// ── CpalSource ───────────────────────────────────────────────────

#[cfg(feature = "cpal")]
mod cpal_source {
    use std::sync::mpsc as std_mpsc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use tracing::info;

    use super::{AudioFormat, AudioSink, AudioSource};
    use crate::error::CoreError;

    /// Default input device. The stream lives on its own thread because
    /// `cpal::Stream` is not `Send` on every platform.
    pub struct CpalSource {
        chunk_duration: Duration,
        stop_tx: Option<std_mpsc::Sender<()>>,
        thread: Option<JoinHandle<()>>,
    }

    impl CpalSource {
        pub fn new(chunk_duration: Duration) -> Self {
            Self {
                chunk_duration,
                stop_tx: None,
                thread: None,
            }
        }
    }

    fn open_stream(sink: AudioSink, chunk_duration: Duration) -> Result<cpal::Stream, String> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| "no audio input device found".to_string())?;
        let default_config = device
            .default_input_config()
            .map_err(|e| format!("no default input config: {e}"))?;

        let format = AudioFormat {
            sample_rate: default_config.sample_rate().0,
            channels: default_config.channels(),
        };
        let config = cpal::StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        info!(
            device = %device.name().unwrap_or_default(),
            sample_rate = format.sample_rate,
            channels = format.channels,
            "opening audio input"
        );

        let chunk_bytes = format.bytes_for(chunk_duration).max(2);
        let mut pending: Vec<u8> = Vec::with_capacity(chunk_bytes);
        let data_sink = sink.clone();
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for sample in data {
                        let s = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                        pending.extend_from_slice(&s.to_le_bytes());
                        if pending.len() >= chunk_bytes {
                            data_sink.push(format, std::mem::take(&mut pending));
                            pending.reserve(chunk_bytes);
                        }
                    }
                },
                move |err| sink.fail(format!("audio stream error: {err}")),
                None,
            )
            .map_err(|e| format!("failed to build input stream: {e}"))?;
        stream
            .play()
            .map_err(|e| format!("failed to start input stream: {e}"))?;
        Ok(stream)
    }

    impl AudioSource for CpalSource {
        fn name(&self) -> &'static str {
            "cpal"
        }

        fn start(&mut self, sink: AudioSink) -> Result<(), CoreError> {
            self.stop();
            let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
            let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), String>>();
            let chunk_duration = self.chunk_duration;

            let handle = thread::Builder::new()
                .name("audio-cpal".into())
                .spawn(move || match open_stream(sink, chunk_duration) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        // Parked until stop() drops or signals the sender.
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                })
                .map_err(|e| CoreError::Other(format!("failed to spawn audio thread: {e}")))?;

            match ready_rx.recv() {
                Ok(Ok(())) => {
                    self.stop_tx = Some(stop_tx);
                    self.thread = Some(handle);
                    Ok(())
                }
                Ok(Err(e)) => {
                    let _ = handle.join();
                    Err(CoreError::Other(e))
                }
                Err(_) => Err(CoreError::Other("audio thread exited during setup".into())),
            }
        }

        fn stop(&mut self) {
            if let Some(tx) = self.stop_tx.take() {
                let _ = tx.send(());
            }
            if let Some(handle) = self.thread.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(feature = "cpal")]
pub use cpal_source::CpalSource;

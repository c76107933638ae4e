//! Audio I/O - Mikrofon-Capture und Wiedergabe
//!
//! Verwendet cpal für Cross-Platform Audio. Gearbeitet wird intern mit
//! Mono/48kHz; weicht das Gerät ab, wird linear resampelt. Zwischen den
//! Geräte-Callbacks und der RTP-Seite liegen Ring-Buffer.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Interne Sample Rate (48kHz, Opus-Standard)
pub const SAMPLE_RATE: u32 = 48000;

/// Frame-Größe in Samples (20ms @ 48kHz)
pub const FRAME_SIZE: usize = 960;

/// Kapazität der Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuild(String),

    #[error("Failed to start audio stream: {0}")]
    StreamStart(String),
}

// ============================================================================
// SHARED STATE
// ============================================================================

/// Zwischen Geräte-Callbacks und RTP-Seite geteilter Zustand
pub struct AudioShared {
    capture: Mutex<HeapRb<f32>>,
    playback: Mutex<HeapRb<f32>>,
    muted: AtomicBool,
}

impl AudioShared {
    fn new() -> Self {
        Self {
            capture: Mutex::new(HeapRb::new(RING_BUFFER_SIZE)),
            playback: Mutex::new(HeapRb::new(RING_BUFFER_SIZE)),
            muted: AtomicBool::new(false),
        }
    }

    /// Liest einen vollen Capture-Frame, falls genug Samples anliegen
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture.lock();
        if buffer.occupied_len() < FRAME_SIZE {
            return None;
        }
        let mut frame = Vec::with_capacity(FRAME_SIZE);
        for _ in 0..FRAME_SIZE {
            if let Some(sample) = buffer.try_pop() {
                frame.push(sample);
            }
        }
        Some(frame)
    }

    /// Stellt empfangene Samples zur Wiedergabe ein
    pub fn write_samples(&self, samples: &[f32]) {
        let mut buffer = self.playback.lock();
        for sample in samples {
            let _ = buffer.try_push(*sample);
        }
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
        tracing::debug!("Microphone muted: {}", muted);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }
}

// ============================================================================
// AUDIO IO
// ============================================================================

/// Offene Capture- und Playback-Streams eines Anrufs
///
/// Droppen stoppt beide Streams und gibt die Geräte frei.
pub struct AudioIo {
    _input_stream: Stream,
    _output_stream: Stream,
    shared: Arc<AudioShared>,
}

// cpal::Stream ist nicht Send; die Streams werden aber nur gehalten,
// nie über Thread-Grenzen benutzt (vgl. AudioHandler im gleichen Muster)
unsafe impl Send for AudioIo {}

impl AudioIo {
    /// Erwirbt Standard-Ein- und -Ausgabegerät und startet beide Streams
    ///
    /// Schlägt fehl, wenn kein Gerät vorhanden ist oder der Zugriff
    /// verweigert wird; der Anrufaufbau bricht dann ab.
    pub fn start() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let input = host.default_input_device().ok_or(AudioError::NoInputDevice)?;
        let output = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;

        let shared = Arc::new(AudioShared::new());
        let input_stream = Self::build_capture(&input, Arc::clone(&shared))?;
        let output_stream = Self::build_playback(&output, Arc::clone(&shared))?;

        input_stream
            .play()
            .map_err(|e| AudioError::StreamStart(e.to_string()))?;
        output_stream
            .play()
            .map_err(|e| AudioError::StreamStart(e.to_string()))?;

        tracing::info!("Audio started: {}Hz mono", SAMPLE_RATE);

        Ok(Self {
            _input_stream: input_stream,
            _output_stream: output_stream,
            shared,
        })
    }

    /// Geteilter Zustand für die RTP-Pump-Tasks
    pub fn shared(&self) -> Arc<AudioShared> {
        Arc::clone(&self.shared)
    }

    pub fn set_muted(&self, muted: bool) {
        self.shared.set_muted(muted);
    }

    fn build_capture(device: &Device, shared: Arc<AudioShared>) -> Result<Stream, AudioError> {
        let config = Self::pick_config(
            device
                .supported_input_configs()
                .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?,
        )?;
        let source_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        tracing::info!("Capturing at {}Hz, {} channel(s)", source_rate, channels);

        device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Mute unterbricht nur den Capture-Pfad; der Stream
                    // selbst läuft weiter, es wird nichts neu verhandelt
                    if shared.is_muted() {
                        return;
                    }
                    // Auf Mono mischen
                    let mono: Vec<f32> = data
                        .chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                        .collect();
                    let samples = resample(&mono, source_rate, SAMPLE_RATE);
                    let mut buffer = shared.capture.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuild(e.to_string()))
    }

    fn build_playback(device: &Device, shared: Arc<AudioShared>) -> Result<Stream, AudioError> {
        let config = Self::pick_config(
            device
                .supported_output_configs()
                .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?,
        )?;
        let target_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        tracing::info!("Playing back at {}Hz, {} channel(s)", target_rate, channels);

        device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels;
                    let needed =
                        (frames as f32 * SAMPLE_RATE as f32 / target_rate as f32) as usize;
                    let mono: Vec<f32> = {
                        let mut buffer = shared.playback.lock();
                        (0..needed).map(|_| buffer.try_pop().unwrap_or(0.0)).collect()
                    };
                    let out = resample(&mono, SAMPLE_RATE, target_rate);
                    for (i, frame) in data.chunks_mut(channels).enumerate() {
                        let sample = out.get(i).copied().unwrap_or(0.0);
                        for slot in frame {
                            *slot = sample;
                        }
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuild(e.to_string()))
    }

    /// Wählt eine F32-Konfiguration, bevorzugt exakt 48kHz
    fn pick_config<I>(configs: I) -> Result<StreamConfig, AudioError>
    where
        I: Iterator<Item = cpal::SupportedStreamConfigRange>,
    {
        let target = cpal::SampleRate(SAMPLE_RATE);
        let mut fallback = None;

        for range in configs {
            if range.sample_format() != SampleFormat::F32 {
                continue;
            }
            if range.min_sample_rate() <= target && range.max_sample_rate() >= target {
                return Ok(range.with_sample_rate(target).into());
            }
            fallback.get_or_insert_with(|| range.with_max_sample_rate().into());
        }

        fallback.ok_or_else(|| {
            AudioError::UnsupportedConfig("no f32 configuration available".to_string())
        })
    }
}

/// Einfaches lineares Resampling
fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }
    let ratio = to_rate as f32 / from_rate as f32;
    let out_len = (input.len() as f32 * ratio) as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f32 / ratio;
            let idx = pos as usize;
            let frac = pos - idx as f32;
            let a = input.get(idx).copied().unwrap_or(0.0);
            let b = input.get(idx + 1).copied().unwrap_or(a);
            a + (b - a) * frac
        })
        .collect()
}

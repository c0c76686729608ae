//! # Tone Media Source
//!
//! A PCMU tone generator implementing the client's [`MediaSource`] seam.
//! Used by the client binary to stream real audio frames without a capture
//! device: a sine tone, mu-law encoded, paced in 20 ms frames.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::protocol::duration::StreamDuration;
use crate::protocol::media::MediaParameter;
use crate::session::client::{MediaSource, MediaSourceEvent, MediaSourceState};

/// Samples per channel in one paced frame (20 ms at 8 kHz).
const FRAME_SAMPLES: u64 = 160;
const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Encode one 16-bit linear PCM sample as G.711 mu-law.
pub fn linear_to_ulaw(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    let mut value = sample as i32;
    let sign: u8 = if value < 0 {
        value = -value;
        0x80
    } else {
        0
    };
    if value > CLIP {
        value = CLIP;
    }
    value += BIAS;

    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (value & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((value >> (exponent + 3)) & 0x0f) as u8;
    !(sign | (exponent << 4) | mantissa)
}

struct Shared {
    position_nanos: AtomicU64,
    paused: AtomicBool,
    stopped: AtomicBool,
}

/// Sine tone source streaming PCMU frames until a configured duration.
pub struct ToneMediaSource {
    events: mpsc::UnboundedSender<MediaSourceEvent>,
    offered: Vec<MediaParameter>,
    selected: Option<MediaParameter>,
    state: MediaSourceState,
    frequency: f64,
    max_duration: StreamDuration,
    shared: Arc<Shared>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ToneMediaSource {
    pub fn new(
        events: mpsc::UnboundedSender<MediaSourceEvent>,
        offered: Vec<MediaParameter>,
        frequency: f64,
        max_duration: StreamDuration,
    ) -> Self {
        Self {
            events,
            offered,
            selected: None,
            state: MediaSourceState::Preparing,
            frequency,
            max_duration,
            shared: Arc::new(Shared {
                position_nanos: AtomicU64::new(0),
                paused: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
            task: None,
        }
    }

    fn emit(&self, event: MediaSourceEvent) {
        let _ = self.events.send(event);
    }
}

impl MediaSource for ToneMediaSource {
    fn state(&self) -> MediaSourceState {
        self.state
    }

    fn position(&self) -> StreamDuration {
        StreamDuration::from_nanos(self.shared.position_nanos.load(Ordering::SeqCst))
    }

    fn offered_media(&self) -> Vec<MediaParameter> {
        self.offered.clone()
    }

    fn selected_media(&self) -> Option<MediaParameter> {
        self.selected.clone()
    }

    fn start_streaming(
        &mut self,
        selected_media: Option<MediaParameter>,
        discard_to: Option<StreamDuration>,
        start_paused: bool,
    ) {
        self.selected = selected_media.clone();
        self.shared.paused.store(start_paused, Ordering::SeqCst);

        if let Some(discard_to) = discard_to {
            // Skip forward without treating the skipped span as delivered.
            self.shared
                .position_nanos
                .store(discard_to.nanos(), Ordering::SeqCst);
            self.emit(MediaSourceEvent::Discarded {
                start: StreamDuration::ZERO,
                discarded: discard_to,
            });
        }

        let Some(media) = selected_media else {
            // "No media" session: nothing to stream, report immediate end.
            self.state = MediaSourceState::End;
            self.emit(MediaSourceEvent::End {
                duration: StreamDuration::ZERO,
            });
            return;
        };

        self.state = if start_paused {
            MediaSourceState::Paused
        } else {
            MediaSourceState::Streaming
        };

        let shared = self.shared.clone();
        let events = self.events.clone();
        let frequency = self.frequency;
        let max_nanos = self.max_duration.nanos();
        let channels = media.channels.len().max(1);
        let rate = media.rate;
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FRAME_INTERVAL);
            loop {
                ticker.tick().await;
                if shared.stopped.load(Ordering::SeqCst) {
                    break;
                }
                if shared.paused.load(Ordering::SeqCst) {
                    continue;
                }
                let position = shared.position_nanos.load(Ordering::SeqCst);
                if position >= max_nanos {
                    let _ = events.send(MediaSourceEvent::End {
                        duration: StreamDuration::from_nanos(position),
                    });
                    break;
                }
                let start_sample = position / (1_000_000_000 / rate as u64);
                let mut frame = Vec::with_capacity(FRAME_SAMPLES as usize * channels);
                for n in 0..FRAME_SAMPLES {
                    let t = (start_sample + n) as f64 / rate as f64;
                    let amplitude = (2.0 * std::f64::consts::PI * frequency * t).sin();
                    let sample = (amplitude * 8192.0) as i16;
                    let encoded = linear_to_ulaw(sample);
                    for _ in 0..channels {
                        frame.push(encoded);
                    }
                }
                shared.position_nanos.store(
                    StreamDuration::from_nanos(position)
                        .with_added_samples(FRAME_SAMPLES, rate)
                        .nanos(),
                    Ordering::SeqCst,
                );
                if events.send(MediaSourceEvent::Audio(frame)).is_err() {
                    break;
                }
            }
        }));
    }

    fn pause(&mut self) {
        if !self.shared.paused.swap(true, Ordering::SeqCst) {
            self.state = MediaSourceState::Paused;
            self.emit(MediaSourceEvent::Paused);
        }
    }

    fn resume(&mut self) {
        if self.shared.paused.swap(false, Ordering::SeqCst) {
            self.state = MediaSourceState::Streaming;
            self.emit(MediaSourceEvent::Resumed {
                start: self.position(),
                discarded: StreamDuration::ZERO,
            });
        }
    }

    fn close(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.state = MediaSourceState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ulaw_encoding_known_values() {
        // Silence encodes to 0xff, full-scale positive to 0x80.
        assert_eq!(linear_to_ulaw(0), 0xff);
        assert_eq!(linear_to_ulaw(i16::MAX), 0x80);
        assert_eq!(linear_to_ulaw(i16::MIN + 1), 0x00);
        // Sign bit distinguishes positive and negative of same magnitude.
        assert_eq!(linear_to_ulaw(1000) ^ linear_to_ulaw(-1000), 0x80);
    }

    #[tokio::test]
    async fn test_tone_source_streams_frames_and_tracks_position() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut source = ToneMediaSource::new(
            tx,
            vec![MediaParameter::pcmu_stereo_8k()],
            440.0,
            StreamDuration::from_millis(60),
        );
        source.start_streaming(Some(MediaParameter::pcmu_stereo_8k()), None, false);

        let mut audio_frames = 0;
        let mut ended = false;
        while let Some(event) = rx.recv().await {
            match event {
                MediaSourceEvent::Audio(frame) => {
                    // 160 samples per channel, stereo PCMU.
                    assert_eq!(frame.len(), 320);
                    audio_frames += 1;
                }
                MediaSourceEvent::End { duration } => {
                    assert_eq!(duration, StreamDuration::from_millis(60));
                    ended = true;
                    break;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(ended);
        assert_eq!(audio_frames, 3);
        assert_eq!(source.position(), StreamDuration::from_millis(60));
    }

    #[tokio::test]
    async fn test_discard_to_advances_position_without_audio() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut source = ToneMediaSource::new(
            tx,
            vec![MediaParameter::pcmu_stereo_8k()],
            440.0,
            StreamDuration::from_seconds(10),
        );
        source.start_streaming(
            Some(MediaParameter::pcmu_stereo_8k()),
            Some(StreamDuration::from_seconds(2)),
            true,
        );
        assert_eq!(source.position(), StreamDuration::from_seconds(2));
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            MediaSourceEvent::Discarded {
                start: StreamDuration::ZERO,
                discarded: StreamDuration::from_seconds(2),
            }
        );
        assert_eq!(source.state(), MediaSourceState::Paused);
        source.close();
    }

    #[tokio::test]
    async fn test_pause_resume_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut source = ToneMediaSource::new(
            tx,
            vec![MediaParameter::pcmu_stereo_8k()],
            440.0,
            StreamDuration::from_seconds(10),
        );
        source.start_streaming(Some(MediaParameter::pcmu_stereo_8k()), None, true);
        source.resume();
        assert_eq!(
            rx.recv().await.unwrap(),
            MediaSourceEvent::Resumed {
                start: StreamDuration::ZERO,
                discarded: StreamDuration::ZERO,
            }
        );
        source.pause();
        assert_eq!(rx.recv().await.unwrap(), MediaSourceEvent::Paused);
        // Double pause does not emit a second event.
        source.pause();
        source.close();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_media_session_ends_immediately() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut source = ToneMediaSource::new(
            tx,
            vec![MediaParameter::pcmu_stereo_8k()],
            440.0,
            StreamDuration::from_seconds(10),
        );
        source.start_streaming(None, None, false);
        assert_eq!(
            rx.recv().await.unwrap(),
            MediaSourceEvent::End {
                duration: StreamDuration::ZERO
            }
        );
        assert_eq!(source.state(), MediaSourceState::End);
    }
}

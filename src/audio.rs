//! Chime playback for timer alerts.

use rodio::source::{SineWave, Source, Zero};
use rodio::{OutputStream, OutputStreamHandle, Sink};
use std::cell::RefCell;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const TONE_MS: u64 = 150;
const GAP_MS: u64 = 50;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Failed to initialize audio output: {0}")]
    Stream(#[from] rodio::StreamError),
    #[error("Failed to play audio: {0}")]
    Play(#[from] rodio::PlayError),
}

/// Plays chimes on the default output device. Not `Send`; keep it on the
/// thread that created it.
pub struct AudioPlayer {
    _stream: OutputStream,
    handle: OutputStreamHandle,
    current: RefCell<Option<Sink>>,
}

impl AudioPlayer {
    pub fn new() -> Result<Self, AudioError> {
        let (stream, handle) = OutputStream::try_default()?;
        Ok(Self {
            _stream: stream,
            handle,
            current: RefCell::new(None),
        })
    }

    /// Plays the alternating two-tone chime for roughly `length`, replacing
    /// any chime still playing.
    pub fn play_chime(&self, length: Duration) {
        if let Err(e) = self.play_tones(length) {
            warn!(error = %e, "Failed to play chime");
        }
    }

    /// Cuts off the chime in progress, if any.
    pub fn stop(&self) {
        if let Some(sink) = self.current.borrow_mut().take() {
            sink.stop();
            debug!("Chime stopped");
        }
    }

    fn play_tones(&self, length: Duration) -> Result<(), AudioError> {
        self.stop();
        let sink = Sink::try_new(&self.handle)?;

        // 880 Hz (A5) and 1046.5 Hz (C6), alternating until the length is filled
        let pairs = chime_pairs(length);
        for _ in 0..pairs {
            sink.append(
                SineWave::new(880.0)
                    .take_duration(Duration::from_millis(TONE_MS))
                    .amplify(0.3),
            );
            sink.append(Zero::<f32>::new(1, 44100).take_duration(Duration::from_millis(GAP_MS)));
            sink.append(
                SineWave::new(1046.5)
                    .take_duration(Duration::from_millis(TONE_MS))
                    .amplify(0.3),
            );
            sink.append(Zero::<f32>::new(1, 44100).take_duration(Duration::from_millis(GAP_MS)));
        }

        debug!(pairs, "Chime playing");
        *self.current.borrow_mut() = Some(sink);
        Ok(())
    }

    /// Blocks until the current chime has finished.
    pub fn wait(&self) {
        if let Some(sink) = self.current.borrow().as_ref() {
            sink.sleep_until_end();
        }
    }
}

/// Number of tone pairs needed to fill `length`; at least one.
fn chime_pairs(length: Duration) -> u64 {
    let pair_ms = 2 * (TONE_MS + GAP_MS);
    let length_ms = u64::try_from(length.as_millis()).unwrap_or(u64::MAX);
    length_ms.div_ceil(pair_ms).max(1)
}

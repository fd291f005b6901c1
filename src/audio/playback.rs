//! Gapless playback scheduling against the output device clock.
//!
//! Every buffer starts at `max(cursor, now)` and pushes the cursor forward by
//! its own duration, so a burst of chunks plays back-to-back and no chunk ever
//! overlaps one still playing.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use super::AudioConfig;
use super::OUTPUT_SAMPLE_RATE_HZ;
use super::device::{CompletionFn, OutputDevice, OutputStream, SourceId};
use super::frame::PlaybackBuffer;
use crate::error::LinkError;

/// Buffers scheduled but not yet finished. `speaking` mirrors non-emptiness
/// and is only ever updated while the set is locked.
struct ActiveSources {
    ids: Mutex<HashSet<SourceId>>,
    speaking: Arc<watch::Sender<bool>>,
}

impl ActiveSources {
    fn new(speaking: Arc<watch::Sender<bool>>) -> Self {
        Self {
            ids: Mutex::new(HashSet::new()),
            speaking,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<SourceId>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, ids: &HashSet<SourceId>) {
        let speaking = !ids.is_empty();
        self.speaking.send_if_modified(|current| {
            if *current == speaking {
                return false;
            }
            *current = speaking;
            true
        });
    }

    fn insert(&self, id: SourceId) {
        let mut ids = self.lock();
        ids.insert(id);
        self.publish(&ids);
    }

    fn remove(&self, id: SourceId) -> bool {
        let mut ids = self.lock();
        let removed = ids.remove(&id);
        if removed {
            self.publish(&ids);
        }
        removed
    }

    fn clear(&self) {
        let mut ids = self.lock();
        ids.clear();
        self.publish(&ids);
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Where a buffer landed on the output clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub id: SourceId,
    pub start_at: f64,
    pub duration: f64,
}

/// Owns the output device for one session.
pub struct PlaybackScheduler {
    output: Box<dyn OutputStream>,
    active: Arc<ActiveSources>,
    cursor: f64,
    next_id: SourceId,
    starvation_threshold: f64,
}

impl PlaybackScheduler {
    /// Open the output device at the fixed output rate.
    ///
    /// `speaking` is the signal the facade exposes; it is driven from the
    /// ActiveSourceSet and nowhere else.
    pub fn open(
        device: &dyn OutputDevice,
        config: &AudioConfig,
        speaking: Arc<watch::Sender<bool>>,
    ) -> Result<Self, LinkError> {
        let active = Arc::new(ActiveSources::new(speaking));
        let on_complete: CompletionFn = {
            let active = active.clone();
            Arc::new(move |id| {
                if !active.remove(id) {
                    log::debug!("Completion for unknown source {} ignored", id);
                }
            })
        };

        let output = device.open(OUTPUT_SAMPLE_RATE_HZ, on_complete)?;
        let cursor = output.now();
        log::info!(
            "Playback scheduler ready: device={}, rate={}Hz",
            config.playback_device,
            OUTPUT_SAMPLE_RATE_HZ
        );

        Ok(Self {
            output,
            active,
            cursor,
            next_id: 0,
            starvation_threshold: config.starvation_threshold_ms as f64 / 1000.0,
        })
    }

    /// Queue `buffer` right after everything already scheduled.
    pub fn schedule(&mut self, buffer: PlaybackBuffer) -> Result<ScheduledSource, LinkError> {
        let now = self.output.now();
        let behind = now - self.cursor;
        if behind > self.starvation_threshold {
            log::debug!(
                "Playback starved for {:.3}s, moving cursor {:.3} -> {:.3}",
                behind,
                self.cursor,
                now
            );
        }

        let start_at = self.cursor.max(now);
        let duration = buffer.duration();
        let id = self.next_id;
        self.next_id += 1;

        // Insert before handing to the device so an early completion finds it
        self.active.insert(id);
        if let Err(e) = self.output.play_at(id, buffer, start_at) {
            self.active.remove(id);
            log::error!("Failed to schedule playback buffer: {}", e);
            return Err(e);
        }

        self.cursor = start_at + duration;
        log::debug!(
            "Scheduled source {} at {:.3}s for {:.3}s",
            id,
            start_at,
            duration
        );
        Ok(ScheduledSource {
            id,
            start_at,
            duration,
        })
    }

    /// Stop everything immediately and start the next turn from device now.
    pub fn reset(&mut self) {
        self.output.stop_all();
        self.active.clear();
        self.cursor = self.output.now();
    }

    pub fn is_speaking(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn active_sources(&self) -> usize {
        self.active.len()
    }

    /// Device time at which the next buffer would start at the earliest.
    pub fn cursor(&self) -> f64 {
        self.cursor
    }
}

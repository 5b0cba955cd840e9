use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

use rockola_common::{PlayerPhase, QueueItem, StatusInfo};

use crate::metrics::SessionMetrics;
use crate::playback::{Generation, PlaybackEvent, PlaybackEventKind, PlaybackSurface};

struct NowPlaying {
    item: QueueItem,
    /// None until the item has been loaded on the surface. An item promoted
    /// while offline stays unloaded until connectivity returns.
    generation: Option<Generation>,
}

/// Owns the backlog and the now-playing slot and decides what plays next.
///
/// All mutation happens through `enqueue`, `advance`, `set_connectivity`,
/// `teardown` and the adapter event handlers, each of which runs to completion
/// on the event loop. Commands to the surface are fire-and-forget; their
/// outcome comes back as generation-stamped [`PlaybackEvent`]s.
///
/// Invariants:
/// - the now-playing item is never also in the backlog
/// - the backlog is empty whenever nothing is playing
/// - `is_playing` implies a current item and `is_online`
pub struct QueueController<S: PlaybackSurface> {
    surface: S,
    backlog: VecDeque<QueueItem>,
    current: Option<NowPlaying>,
    is_playing: bool,
    is_online: bool,
    metrics: Arc<SessionMetrics>,
}

impl<S: PlaybackSurface> QueueController<S> {
    pub fn new(surface: S, metrics: Arc<SessionMetrics>) -> Self {
        Self {
            surface,
            backlog: VecDeque::new(),
            current: None,
            is_playing: false,
            is_online: true,
            metrics,
        }
    }

    /// Queue phase: whether an item holds the slot and whether the network
    /// allows it to play. Transport state reported by the surface is tracked
    /// separately in [`is_playing`](Self::is_playing), so an item the surface
    /// has not started yet still reads as `Playing` while online.
    pub fn state(&self) -> PlayerPhase {
        match self.current {
            None => PlayerPhase::Idle,
            Some(_) if !self.is_online => PlayerPhase::PausedOffline,
            Some(_) => PlayerPhase::Playing,
        }
    }

    pub fn current(&self) -> Option<&QueueItem> {
        self.current.as_ref().map(|c| &c.item)
    }

    pub fn current_generation(&self) -> Option<Generation> {
        self.current.as_ref().and_then(|c| c.generation)
    }

    pub fn backlog(&self) -> impl Iterator<Item = &QueueItem> {
        self.backlog.iter()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn is_online(&self) -> bool {
        self.is_online
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    /// Accept a new request. Never fails.
    pub fn enqueue(&mut self, item: QueueItem) {
        if self.current.is_none() {
            info!("[QUEUE] {} ({}): nothing playing, promoting immediately", item.title, item.video_id);
            self.promote(item);
        } else {
            debug!("[QUEUE] {} ({}): queued at position {}", item.title, item.video_id, self.backlog.len() + 1);
            self.backlog.push_back(item);
        }
    }

    /// Natural completion of the item loaded as `generation`.
    ///
    /// Completions that do not refer to the current load are discarded, which
    /// makes duplicate and late signals harmless.
    pub fn advance(&mut self, generation: Generation) {
        if !self.is_current(generation) {
            self.discard_stale("completion", generation);
            return;
        }
        if let Some(current) = &self.current {
            info!("[QUEUE] Finished: {}", current.item.title);
        }
        self.metrics.record_played();
        self.promote_next();
    }

    /// Level-triggered connectivity gate. Repeated reports of the same level are no-ops.
    pub fn set_connectivity(&mut self, online: bool) {
        if online == self.is_online {
            return;
        }
        self.is_online = online;
        info!("[QUEUE] Connectivity: {}", if online { "online" } else { "offline" });
        if !online {
            self.metrics.record_offline();
        }

        let Some(current) = &self.current else {
            return;
        };

        if online {
            if self.is_playing {
                return;
            }
            let loaded = current.generation;
            match loaded {
                Some(generation) => {
                    info!("[QUEUE] Resuming {} ({})", current.item.title, generation);
                    self.surface.play();
                    self.is_playing = true;
                }
                None => self.start_current(),
            }
        } else if self.is_playing {
            info!("[QUEUE] Pausing {} until connectivity returns", current.item.title);
            self.surface.pause();
            self.is_playing = false;
        }
    }

    /// End of session: drop everything and release the surface.
    pub fn teardown(&mut self) {
        info!(
            "[QUEUE] Teardown: dropping current item and {} queued request(s)",
            self.backlog.len()
        );
        self.backlog.clear();
        self.current = None;
        self.is_playing = false;
        self.surface.stop();
    }

    /// Authoritative transport state from the surface.
    pub fn playing_changed(&mut self, playing: bool, generation: Generation) {
        if !self.is_current(generation) {
            self.discard_stale("playing-changed", generation);
            return;
        }
        if playing && !self.is_online {
            debug!("[QUEUE] Surface started playing while offline ({}), pausing", generation);
            self.surface.pause();
            self.is_playing = false;
            return;
        }
        self.is_playing = playing;
    }

    /// The current load could not be played.
    ///
    /// Online, the item is skipped so one bad source never stalls the queue.
    /// Offline, the failure is most likely the network itself: the item keeps
    /// its slot and is reloaded when connectivity returns.
    pub fn load_failed(&mut self, generation: Generation, reason: &str) {
        if !self.is_current(generation) {
            self.discard_stale("failure", generation);
            return;
        }
        let Some(current) = self.current.as_mut() else {
            return;
        };

        if self.is_online {
            warn!("[QUEUE] Skipping {} after playback failure: {}", current.item.title, reason);
            self.metrics.record_load_failure(reason);
            self.promote_next();
        } else {
            warn!("[QUEUE] {} failed while offline, will reload: {}", current.item.title, reason);
            self.metrics.record_error(reason);
            current.generation = None;
            self.is_playing = false;
        }
    }

    pub fn handle_playback_event(&mut self, event: PlaybackEvent) {
        match event.kind {
            PlaybackEventKind::PlayingChanged(playing) => self.playing_changed(playing, event.generation),
            PlaybackEventKind::Completed => self.advance(event.generation),
            PlaybackEventKind::Failed(reason) => self.load_failed(event.generation, &reason),
        }
    }

    pub fn status(&self, connection_id: Option<String>) -> StatusInfo {
        let loaded = self.current_generation().is_some();
        StatusInfo {
            phase: self.state(),
            current: self.current().cloned(),
            is_playing: self.is_playing,
            is_online: self.is_online,
            backlog_len: self.backlog.len(),
            generation: self.current_generation().map(|g| g.0),
            position_ms: loaded
                .then(|| self.surface.position())
                .flatten()
                .map(|d| d.as_millis() as u64),
            duration_ms: loaded
                .then(|| self.surface.duration())
                .flatten()
                .map(|d| d.as_millis() as u64),
            connection_id,
            stats: self.metrics.snapshot(),
        }
    }

    fn is_current(&self, generation: Generation) -> bool {
        self.current_generation() == Some(generation)
    }

    fn discard_stale(&self, what: &str, generation: Generation) {
        debug!(
            "[QUEUE] Discarding stale {} for {} (current: {:?})",
            what,
            generation,
            self.current_generation()
        );
        self.metrics.record_stale_event();
    }

    /// Pop the backlog head into the now-playing slot, or go idle.
    fn promote_next(&mut self) {
        match self.backlog.pop_front() {
            Some(next) => self.promote(next),
            None => {
                info!("[QUEUE] Backlog empty, idle");
                self.current = None;
                self.is_playing = false;
            }
        }
    }

    fn promote(&mut self, item: QueueItem) {
        self.current = Some(NowPlaying { item, generation: None });
        self.is_playing = false;
        if self.is_online {
            self.start_current();
        } else if let Some(current) = &self.current {
            info!("[QUEUE] Offline, holding {} until connectivity returns", current.item.title);
        }
    }

    fn start_current(&mut self) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        let generation = self.surface.load(&current.item.playback_url);
        current.generation = Some(generation);
        info!("[QUEUE] Now playing: {} ({})", current.item.title, generation);
        self.surface.play();
        self.is_playing = true;
    }
}

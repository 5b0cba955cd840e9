use gstreamer as gst;
use gst::prelude::*;
use tracing::{info, debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::PlaybackConfig;

/// Tag distinguishing successive loads on the playback surface.
///
/// Every event the adapter emits carries the generation of the load it
/// belongs to; anything stamped with an older generation is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(pub u64);

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "g{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEventKind {
    /// Authoritative transport state reported by the pipeline.
    PlayingChanged(bool),
    /// Natural end of the loaded source. At most once per generation.
    Completed,
    /// The source could not be loaded or played. At most once per generation.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackEvent {
    pub generation: Generation,
    pub kind: PlaybackEventKind,
}

/// Command surface of the single video output.
///
/// Commands are fire-and-forget. Their outcome is reported asynchronously as
/// [`PlaybackEvent`]s stamped with the generation returned by `load`.
pub trait PlaybackSurface {
    /// Replace the active source, stopping whatever was playing.
    fn load(&mut self, url: &str) -> Generation;
    fn play(&mut self);
    fn pause(&mut self);
    /// Stop and unload. Never produces a completion.
    fn stop(&mut self);

    fn position(&self) -> Option<Duration> {
        None
    }

    fn duration(&self) -> Option<Duration> {
        None
    }
}

struct BusWatcher {
    is_running: Arc<AtomicBool>,
    // Set once Completed or Failed has been sent for this generation
    terminal: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct GstPlayer {
    pipeline: gst::Element,
    generation: u64,
    loaded: bool,
    watcher: Option<BusWatcher>,
    event_tx: UnboundedSender<PlaybackEvent>,
}

impl GstPlayer {
    pub fn new(config: &PlaybackConfig, event_tx: UnboundedSender<PlaybackEvent>) -> anyhow::Result<Self> {
        let pipeline = gst::ElementFactory::make("playbin")
            .name("playbin")
            .build()?;

        if let Some(sink_name) = &config.video_sink {
            let sink = gst::ElementFactory::make(sink_name)
                .name("video-sink")
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create video sink '{}': {}", sink_name, e))?;
            pipeline.set_property("video-sink", &sink);
            info!("[PLAYBACK] Using video sink: {}", sink_name);
        }

        pipeline.set_property("volume", config.volume as f64 / 100.0);

        info!("[PLAYBACK] Player created with playbin");

        Ok(Self {
            pipeline,
            generation: 0,
            loaded: false,
            watcher: None,
            event_tx,
        })
    }

    fn current_generation(&self) -> Generation {
        Generation(self.generation)
    }

    fn emit(&self, kind: PlaybackEventKind) {
        let _ = self.event_tx.send(PlaybackEvent {
            generation: self.current_generation(),
            kind,
        });
    }

    fn spawn_watcher(&mut self, generation: Generation) -> anyhow::Result<()> {
        let bus = self.pipeline.bus().ok_or_else(|| anyhow::anyhow!("Pipeline has no bus"))?;
        let pipeline = self.pipeline.clone();
        let is_running = Arc::new(AtomicBool::new(true));
        let running = is_running.clone();
        let terminal = Arc::new(AtomicBool::new(false));
        let terminal_sent = terminal.clone();
        let event_tx = self.event_tx.clone();

        let handle = std::thread::spawn(move || {
            let send = |kind: PlaybackEventKind| {
                let is_terminal = matches!(kind, PlaybackEventKind::Completed | PlaybackEventKind::Failed(_));
                if is_terminal && terminal_sent.swap(true, Ordering::SeqCst) {
                    return;
                }
                let _ = event_tx.send(PlaybackEvent { generation, kind });
            };

            while running.load(Ordering::SeqCst) {
                // Wait for up to 100ms for a message
                let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(100)) else {
                    continue;
                };

                use gst::MessageView;
                match msg.view() {
                    MessageView::StateChanged(s) if s.src().map(|src| src.as_ptr() as usize == pipeline.as_ptr() as usize).unwrap_or(false) => {
                        debug!("[PLAYBACK] {}: Pipeline state changed from {:?} to {:?}", generation, s.old(), s.current());
                        if s.current() == gst::State::Playing && s.old() != gst::State::Playing {
                            send(PlaybackEventKind::PlayingChanged(true));
                        } else if s.old() == gst::State::Playing && s.current() != gst::State::Playing {
                            send(PlaybackEventKind::PlayingChanged(false));
                        }
                    }
                    MessageView::Eos(..) => {
                        info!("[PLAYBACK] {}: End of stream", generation);
                        send(PlaybackEventKind::Completed);
                        break;
                    }
                    MessageView::Error(err) => {
                        let error_msg = format!("Error from {:?}: {} ({:?})",
                            err.src().map(|s| s.path_string()),
                            err.error(),
                            err.debug());
                        tracing::error!("[PLAYBACK] {}: {}", generation, error_msg);
                        send(PlaybackEventKind::Failed(error_msg));
                        break;
                    }
                    _ => (),
                }
            }
            debug!("[PLAYBACK] {}: Bus watcher exiting", generation);
        });

        self.watcher = Some(BusWatcher { is_running, terminal, handle });
        Ok(())
    }

    /// Report a failure for the current load unless the bus already did.
    fn emit_failure(&self, reason: String) {
        let already_sent = self
            .watcher
            .as_ref()
            .map(|w| w.terminal.swap(true, Ordering::SeqCst))
            .unwrap_or(false);
        if !already_sent {
            self.emit(PlaybackEventKind::Failed(reason));
        }
    }

    fn stop_watcher(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.is_running.store(false, Ordering::SeqCst);
            if watcher.handle.join().is_err() {
                tracing::error!("[PLAYBACK] Bus watcher thread panicked during cleanup");
            }
        }
    }

    /// Bring the pipeline down and drop any bus messages the previous source
    /// left behind, so they cannot be attributed to the next generation.
    fn reset_pipeline(&mut self) {
        self.stop_watcher();
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("[PLAYBACK] Failed to reset pipeline: {}", e);
        }
        if let Some(bus) = self.pipeline.bus() {
            bus.set_flushing(true);
            bus.set_flushing(false);
        }
        self.loaded = false;
    }
}

impl PlaybackSurface for GstPlayer {
    fn load(&mut self, url: &str) -> Generation {
        self.reset_pipeline();
        self.generation += 1;
        let generation = self.current_generation();

        let uri = to_uri(url);
        info!("[PLAYBACK] {}: Loading {}", generation, uri);
        self.pipeline.set_property("uri", &uri);

        if let Err(e) = self.spawn_watcher(generation) {
            self.emit_failure(e.to_string());
            return generation;
        }

        // Preroll so that play() only has to flip the transport state
        match self.pipeline.set_state(gst::State::Paused) {
            Ok(gst::StateChangeSuccess::Async) => debug!("[PLAYBACK] {}: Prerolling (async)", generation),
            Ok(_) => debug!("[PLAYBACK] {}: Prerolled", generation),
            Err(e) => {
                // The bus normally carries the detailed error; report in case it does not
                self.emit_failure(format!("Failed to load {}: {}", uri, e));
                return generation;
            }
        }

        self.loaded = true;
        generation
    }

    fn play(&mut self) {
        if !self.loaded {
            warn!("[PLAYBACK] play() with no source loaded, ignoring");
            self.emit(PlaybackEventKind::PlayingChanged(false));
            return;
        }
        if let Err(e) = self.pipeline.set_state(gst::State::Playing) {
            self.emit_failure(format!("Failed to start playback: {}", e));
        }
    }

    fn pause(&mut self) {
        if !self.loaded {
            return;
        }
        if let Err(e) = self.pipeline.set_state(gst::State::Paused) {
            warn!("[PLAYBACK] {}: Failed to pause: {}", self.current_generation(), e);
        }
    }

    fn stop(&mut self) {
        info!("[PLAYBACK] Stopping playback");
        self.reset_pipeline();
    }

    fn position(&self) -> Option<Duration> {
        if !self.loaded {
            return None;
        }
        self.pipeline
            .query_position::<gst::ClockTime>()
            .map(|t| Duration::from_nanos(t.nseconds()))
    }

    fn duration(&self) -> Option<Duration> {
        if !self.loaded {
            return None;
        }
        self.pipeline
            .query_duration::<gst::ClockTime>()
            .map(|t| Duration::from_nanos(t.nseconds()))
    }
}

impl Drop for GstPlayer {
    fn drop(&mut self) {
        self.reset_pipeline();
    }
}

/// Local paths become file:// URIs; anything with a scheme passes through.
fn to_uri(url: &str) -> String {
    if url.contains("://") {
        return url.to_string();
    }
    let path = std::path::Path::new(url);
    let abs_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|d| d.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    format!("file://{}", abs_path.display())
}

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A single video request pushed by a station.
///
/// `video_id` identifies the request, not the video: the same clip requested
/// twice arrives as two items and plays twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    #[serde(rename = "idEstacion")]
    pub station_id: String,
    #[serde(rename = "idVideo")]
    pub video_id: String,
    pub title: String,
    #[serde(rename = "thumbnails", default)]
    pub thumbnail_url: String,
    #[serde(rename = "url")]
    pub playback_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlayerPhase {
    Idle,
    Playing,
    PausedOffline,
}

impl std::fmt::Display for PlayerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayerPhase::Idle => write!(f, "idle"),
            PlayerPhase::Playing => write!(f, "playing"),
            PlayerPhase::PausedOffline => write!(f, "paused (offline)"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub items_played: u64,
    pub load_failures: u64,
    pub stale_events_discarded: u64,
    pub reconnects: u64,
    pub offline_transitions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInfo {
    pub phase: PlayerPhase,
    pub current: Option<QueueItem>,
    pub is_playing: bool,
    pub is_online: bool,
    pub backlog_len: usize,
    pub generation: Option<u64>,
    pub position_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub connection_id: Option<String>,
    pub stats: SessionStats,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "queue")]
    Queue,
    #[serde(rename = "enqueue")]
    Enqueue { item: QueueItem },
    #[serde(rename = "logout")]
    Logout,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Error(String),
    Status(StatusInfo),
    Queue(Vec<QueueItem>),
}

/// Daemon socket: XDG_RUNTIME_DIR/rockola.sock or /tmp/rockola-{USER}.sock
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .map(|d| d.join("rockola.sock"))
        .unwrap_or_else(|| {
            let user = std::env::var("USER").unwrap_or_else(|_| "rockola".to_string());
            PathBuf::from(format!("/tmp/rockola-{}.sock", user))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_item_uses_dispatch_field_names() {
        let raw = r#"{
            "idEstacion": "S1D50",
            "idVideo": "req-17",
            "title": "La Chingana",
            "thumbnails": "https://img.example/t.jpg",
            "url": "https://cdn.example/v.mp4"
        }"#;
        let item: QueueItem = serde_json::from_str(raw).unwrap();
        assert_eq!(item.station_id, "S1D50");
        assert_eq!(item.video_id, "req-17");
        assert_eq!(item.thumbnail_url, "https://img.example/t.jpg");
        assert_eq!(item.playback_url, "https://cdn.example/v.mp4");
    }

    #[test]
    fn missing_thumbnail_defaults_to_empty() {
        let raw = r#"{"idEstacion":"a","idVideo":"b","title":"c","url":"d"}"#;
        let item: QueueItem = serde_json::from_str(raw).unwrap();
        assert!(item.thumbnail_url.is_empty());
    }

    #[test]
    fn request_is_tagged_by_method() {
        let json = serde_json::to_string(&Request::Status).unwrap();
        assert_eq!(json, r#"{"method":"status"}"#);

        let parsed: Request = serde_json::from_str(r#"{"method":"logout"}"#).unwrap();
        assert!(matches!(parsed, Request::Logout));
    }
}

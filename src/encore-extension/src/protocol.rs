//! Requests and events exchanged between the host and its extensions.
//!
//! host-main carries process-wide endpoints (notifications, liveness);
//! host-view carries endpoints scoped to one scene (player control and
//! now-playing state).

use encore_rpc::{Blob, Postable, Request, Timestamp};
use serde::{Deserialize, Serialize};

// host-main

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostNotification {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub artwork: Option<Blob>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPosted {
    pub id: String,
}

impl Request for PostNotification {
    type Response = NotificationPosted;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingHost {
    pub sent_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongHost {
    pub sent_at: Timestamp,
    pub received_at: Timestamp,
}

impl Request for PingHost {
    type Response = PongHost;
}

// host-view

encore_rpc::open_enum! {
    pub enum PlayerAction {
        Play = "play",
        Pause = "pause",
        Toggle = "toggle",
        Stop = "stop",
        Next = "next",
        Previous = "previous",
    }
}

encore_rpc::open_enum! {
    pub enum PlaybackState {
        Playing = "playing",
        Paused = "paused",
        Stopped = "stopped",
        Buffering = "buffering",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    /// Duration in seconds when known.
    pub duration_seconds: Option<u32>,
    #[serde(default)]
    pub artwork: Option<Blob>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerCommand {
    pub action: PlayerAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStatus {
    pub state: PlaybackState,
    pub position_seconds: u64,
}

impl Request for PlayerCommand {
    type Response = PlayerStatus;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NowPlaying {
    pub track: TrackInfo,
    pub state: PlaybackState,
    pub position_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNowPlaying;

impl Request for GetNowPlaying {
    type Response = Option<NowPlaying>;
}

/// Playback moved: state change, seek or track change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackChanged {
    pub state: PlaybackState,
    pub track: Option<TrackInfo>,
    pub position_seconds: u64,
    pub at: Timestamp,
}

impl Postable for PlaybackChanged {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NowPlayingChanged {
    pub now_playing: Option<NowPlaying>,
}

impl Postable for NowPlayingChanged {}

//! Host subsystems that endpoint handlers delegate to.
//!
//! The real notification center and player live elsewhere in the host; the
//! in-memory implementations here back tests and the loopback demo.

use crate::protocol::{
    NowPlaying, PlaybackState, PlayerAction, PlayerStatus, PostNotification, TrackInfo,
};
use async_trait::async_trait;
use encore_rpc::RemoteError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl From<ServiceError> for RemoteError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unsupported(message) => RemoteError::handler(message),
            ServiceError::Unavailable(message) => RemoteError::unavailable(message),
        }
    }
}

#[async_trait]
pub trait NotificationCenter: Send + Sync {
    /// Show a notification on behalf of `extension_id`; returns its id.
    async fn post(&self, extension_id: &str, notification: &PostNotification)
        -> ServiceResult<String>;
}

#[async_trait]
pub trait PlaybackControl: Send + Sync {
    async fn apply(&self, action: &PlayerAction) -> ServiceResult<PlayerStatus>;

    async fn now_playing(&self) -> Option<NowPlaying>;
}

/// Records every notification it is asked to show.
#[derive(Debug, Default)]
pub struct InMemoryNotifications {
    posted: Mutex<Vec<(String, PostNotification)>>,
    next_id: AtomicU64,
}

impl InMemoryNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(extension_id, notification)` pairs in the order they were posted.
    pub fn posted(&self) -> Vec<(String, PostNotification)> {
        self.posted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl NotificationCenter for InMemoryNotifications {
    async fn post(
        &self,
        extension_id: &str,
        notification: &PostNotification,
    ) -> ServiceResult<String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.posted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((extension_id.to_string(), notification.clone()));
        Ok(format!("notification-{id}"))
    }
}

#[derive(Debug)]
struct PlayerState {
    queue: Vec<TrackInfo>,
    index: usize,
    state: PlaybackState,
    position_seconds: u64,
}

/// A queue-backed player that only tracks state; it produces no audio.
#[derive(Debug)]
pub struct InMemoryPlayback {
    inner: Mutex<PlayerState>,
}

impl InMemoryPlayback {
    pub fn with_queue(queue: Vec<TrackInfo>) -> Self {
        Self {
            inner: Mutex::new(PlayerState {
                queue,
                index: 0,
                state: PlaybackState::Stopped,
                position_seconds: 0,
            }),
        }
    }

    /// Move the playhead, e.g. to simulate progress.
    pub fn seek(&self, position_seconds: u64) {
        self.lock().position_seconds = position_seconds;
    }

    fn lock(&self) -> MutexGuard<'_, PlayerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryPlayback {
    fn default() -> Self {
        Self::with_queue(Vec::new())
    }
}

#[async_trait]
impl PlaybackControl for InMemoryPlayback {
    async fn apply(&self, action: &PlayerAction) -> ServiceResult<PlayerStatus> {
        let mut player = self.lock();
        if player.queue.is_empty() && !matches!(action, PlayerAction::Stop) {
            return Err(ServiceError::Unavailable("queue is empty".into()));
        }
        let last = player.queue.len().saturating_sub(1);
        match action {
            PlayerAction::Play => player.state = PlaybackState::Playing,
            PlayerAction::Pause => player.state = PlaybackState::Paused,
            PlayerAction::Toggle => {
                player.state = match player.state {
                    PlaybackState::Playing => PlaybackState::Paused,
                    _ => PlaybackState::Playing,
                }
            }
            PlayerAction::Stop => {
                player.state = PlaybackState::Stopped;
                player.position_seconds = 0;
            }
            PlayerAction::Next => {
                player.index = (player.index + 1).min(last);
                player.position_seconds = 0;
            }
            PlayerAction::Previous => {
                player.index = player.index.saturating_sub(1);
                player.position_seconds = 0;
            }
            PlayerAction::Unknown(raw) => return Err(ServiceError::Unsupported(raw.clone())),
        }
        Ok(PlayerStatus {
            state: player.state.clone(),
            position_seconds: player.position_seconds,
        })
    }

    async fn now_playing(&self) -> Option<NowPlaying> {
        let player = self.lock();
        if matches!(player.state, PlaybackState::Stopped) {
            return None;
        }
        player.queue.get(player.index).map(|track| NowPlaying {
            track: track.clone(),
            state: player.state.clone(),
            position_seconds: player.position_seconds,
        })
    }
}

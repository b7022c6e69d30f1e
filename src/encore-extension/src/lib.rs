//! Extension hosting for Encore.
//!
//! Extensions run as separate processes and talk to the host over
//! [`encore_rpc`] connections:
//! - one host-main connection per extension for process-wide endpoints
//!   ([`protocol::PostNotification`], [`protocol::PingHost`]),
//! - one host-view connection per scene for player control and playback
//!   events ([`protocol::PlayerCommand`], [`protocol::PlaybackChanged`]).
//!
//! Every handler sees the calling extension's [`ExtensionManifest`] through
//! [`ManifestKey`] and refuses work the manifest does not grant.
//!
//! # Usage
//!
//! ```rust,ignore
//! use encore_extension::{ExtensionHost, ExtensionManifest, InProcessExtension};
//!
//! let host = ExtensionHost::new(&config.rpc, notifications, playback);
//! let extension = InProcessExtension::connect(&host, ExtensionManifest::builtin("demo")).await?;
//! let scene = extension.open_scene(&host, "main")?;
//! let status = scene.dispatch(&PlayerCommand { action: PlayerAction::Play }, true).await?;
//! ```

mod host;
mod loopback;
pub mod manifest;
pub mod protocol;
pub mod services;

pub use host::{main_endpoints, view_endpoints, ExtensionHost};
pub use loopback::{InProcessExtension, LoopbackError};
pub use manifest::{
    ExtensionManifest, ManifestError, ManifestKey, ManifestVersion, Permission,
    UnsupportedManifestVersion, MANIFEST_FILE,
};
pub use protocol::{
    GetNowPlaying, NotificationPosted, NowPlaying, NowPlayingChanged, PingHost, PlaybackChanged,
    PlaybackState, PlayerAction, PlayerCommand, PlayerStatus, PongHost, PostNotification,
    TrackInfo,
};
pub use services::{
    InMemoryNotifications, InMemoryPlayback, NotificationCenter, PlaybackControl, ServiceError,
    ServiceResult,
};

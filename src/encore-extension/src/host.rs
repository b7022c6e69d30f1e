//! Host-side bookkeeping for attached extensions and their scenes.

use crate::manifest::{ExtensionManifest, ManifestKey, Permission};
use crate::protocol::{
    GetNowPlaying, NotificationPosted, PingHost, PlaybackChanged, PlayerCommand, PongHost,
    PostNotification,
};
use crate::services::{NotificationCenter, PlaybackControl};
use encore_core::RpcConfig;
use encore_rpc::{ChannelHandle, Connection, Context, Dispatcher, Endpoints, RemoteError, Role};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Manifest of the calling extension, provided it grants `permission`.
fn require(
    context: &Context,
    permission: Permission,
) -> Result<Arc<ExtensionManifest>, RemoteError> {
    let manifest = context
        .get::<ManifestKey>()
        .ok_or_else(|| RemoteError::permission_denied("caller has no manifest"))?;
    if !manifest.grants(&permission) {
        return Err(RemoteError::permission_denied(format!(
            "extension '{}' lacks the '{permission}' permission",
            manifest.id
        )));
    }
    Ok(manifest)
}

/// Endpoints served on every extension's host-main connection.
pub fn main_endpoints(notifications: Arc<dyn NotificationCenter>) -> Endpoints {
    Endpoints::new()
        .with(move |request: PostNotification, context: Context| {
            let notifications = notifications.clone();
            async move {
                let manifest = require(&context, Permission::Notifications)?;
                let id = notifications.post(&manifest.id, &request).await?;
                Ok::<_, RemoteError>(NotificationPosted { id })
            }
        })
        .with(|request: PingHost, _| async move {
            Ok::<_, RemoteError>(PongHost {
                sent_at: request.sent_at,
                received_at: chrono::Utc::now(),
            })
        })
}

/// Endpoints served on every host-view (scene) connection.
pub fn view_endpoints(playback: Arc<dyn PlaybackControl>) -> Endpoints {
    let now_playing = playback.clone();
    Endpoints::new()
        .with(move |command: PlayerCommand, context: Context| {
            let playback = playback.clone();
            async move {
                require(&context, Permission::Playback)?;
                Ok::<_, RemoteError>(playback.apply(&command.action).await?)
            }
        })
        .with(move |_: GetNowPlaying, _| {
            let playback = now_playing.clone();
            async move { Ok::<_, RemoteError>(playback.now_playing().await) }
        })
}

struct Attached {
    manifest: Arc<ExtensionManifest>,
    main: Arc<Connection>,
    scenes: HashMap<String, Arc<Connection>>,
}

impl Attached {
    /// Swap in a new manifest for the main connection and every scene.
    fn replace_manifest(&mut self, manifest: Arc<ExtensionManifest>) {
        for connection in std::iter::once(&self.main).chain(self.scenes.values()) {
            connection
                .dispatcher()
                .context()
                .set::<ManifestKey>(Some(manifest.clone()));
        }
        self.manifest = manifest;
    }
}

/// Tracks one host-main connection per extension and one host-view
/// connection per scene.
pub struct ExtensionHost {
    eager_ping: bool,
    notifications: Arc<dyn NotificationCenter>,
    playback: Arc<dyn PlaybackControl>,
    extensions: Mutex<HashMap<String, Attached>>,
}

impl ExtensionHost {
    pub fn new(
        config: &RpcConfig,
        notifications: Arc<dyn NotificationCenter>,
        playback: Arc<dyn PlaybackControl>,
    ) -> Self {
        Self {
            eager_ping: config.eager_ping,
            notifications,
            playback,
            extensions: Mutex::new(HashMap::new()),
        }
    }

    fn extensions(&self) -> MutexGuard<'_, HashMap<String, Attached>> {
        self.extensions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connection(
        &self,
        role: Role,
        endpoints: Endpoints,
        manifest: &Arc<ExtensionManifest>,
    ) -> Arc<Connection> {
        let dispatcher = Dispatcher::new(role, endpoints);
        dispatcher.context().set::<ManifestKey>(Some(manifest.clone()));
        Arc::new(Connection::new(dispatcher))
    }

    /// Bind `handle` as the host-main channel of the extension described by
    /// `manifest`.
    ///
    /// Returns `false` if that extension already has a live main channel;
    /// the manifest it was attached with stays in force. A previously
    /// invalidated extension rebinds on its existing connections and the new
    /// manifest replaces the old one for main and scene handlers alike.
    pub async fn attach_extension(
        &self,
        manifest: ExtensionManifest,
        handle: Arc<dyn ChannelHandle>,
    ) -> bool {
        let id = manifest.id.clone();
        let main = {
            let mut extensions = self.extensions();
            match extensions.get_mut(&id) {
                Some(attached) if attached.main.is_bound() => {
                    if *attached.manifest != manifest {
                        warn!(extension = %id, "extension already attached; new manifest ignored");
                    } else {
                        debug!(extension = %id, "extension already attached");
                    }
                    return false;
                }
                Some(attached) => {
                    if *attached.manifest != manifest {
                        info!(extension = %id, version = %manifest.version, "manifest replaced on reattach");
                        attached.replace_manifest(Arc::new(manifest));
                    }
                    attached.main.clone()
                }
                None => {
                    let manifest = Arc::new(manifest);
                    let main = self.connection(
                        Role::HostMain,
                        main_endpoints(self.notifications.clone()),
                        &manifest,
                    );
                    extensions.insert(
                        id.clone(),
                        Attached {
                            main: main.clone(),
                            manifest,
                            scenes: HashMap::new(),
                        },
                    );
                    main
                }
            }
        };

        if !main.take_ownership(handle) {
            debug!(extension = %id, "main channel rejected");
            return false;
        }
        info!(extension = %id, "extension attached");

        if self.eager_ping {
            if let Err(err) = main.ping(false).await {
                warn!(extension = %id, error = %err, "eager ping failed");
            }
        }
        true
    }

    /// Bind `handle` as the host-view channel for one scene of an attached
    /// extension. Returns `false` if the extension is unknown or the scene is
    /// already bound.
    pub fn attach_scene(
        &self,
        extension_id: &str,
        scene_id: &str,
        handle: Arc<dyn ChannelHandle>,
    ) -> bool {
        let scene = {
            let mut extensions = self.extensions();
            let Some(attached) = extensions.get_mut(extension_id) else {
                warn!(extension = extension_id, scene = scene_id, "scene for unknown extension");
                return false;
            };
            let manifest = attached.manifest.clone();
            attached
                .scenes
                .entry(scene_id.to_string())
                .or_insert_with(|| {
                    self.connection(Role::HostView, view_endpoints(self.playback.clone()), &manifest)
                })
                .clone()
        };

        let bound = scene.take_ownership(handle);
        if bound {
            info!(extension = extension_id, scene = scene_id, "scene attached");
        }
        bound
    }

    pub fn manifest(&self, extension_id: &str) -> Option<Arc<ExtensionManifest>> {
        self.extensions()
            .get(extension_id)
            .map(|attached| attached.manifest.clone())
    }

    /// Sorted ids of every attached extension.
    pub fn extension_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.extensions().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The extension's host-main connection, or the placeholder.
    pub fn main(&self, extension_id: &str) -> Arc<Connection> {
        self.extensions()
            .get(extension_id)
            .map(|attached| attached.main.clone())
            .unwrap_or_else(Connection::shared_placeholder)
    }

    /// The scene's host-view connection if it is live, otherwise the
    /// placeholder, on which every call fails immediately.
    pub fn scene(&self, extension_id: &str, scene_id: &str) -> Arc<Connection> {
        self.extensions()
            .get(extension_id)
            .and_then(|attached| attached.scenes.get(scene_id))
            .filter(|scene| scene.is_bound())
            .cloned()
            .unwrap_or_else(Connection::shared_placeholder)
    }

    /// Post `event` to every bound scene of every extension. Failures are
    /// logged; returns how many scenes accepted the event.
    pub async fn broadcast_playback(&self, event: &PlaybackChanged) -> usize {
        let scenes: Vec<(String, String, Arc<Connection>)> = self
            .extensions()
            .iter()
            .flat_map(|(extension_id, attached)| {
                attached
                    .scenes
                    .iter()
                    .filter(|(_, scene)| scene.is_bound())
                    .map(move |(scene_id, scene)| {
                        (extension_id.clone(), scene_id.clone(), scene.clone())
                    })
            })
            .collect();

        let mut delivered = 0;
        for (extension_id, scene_id, scene) in scenes {
            match scene.post(event, false).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(extension = %extension_id, scene = %scene_id, error = %err, "playback broadcast failed")
                }
            }
        }
        debug!(delivered, "playback broadcast");
        delivered
    }

    /// Tear down the extension's main connection and every scene.
    pub fn detach_extension(&self, extension_id: &str) -> bool {
        let Some(attached) = self.extensions().remove(extension_id) else {
            return false;
        };
        for scene in attached.scenes.values() {
            scene.teardown();
        }
        attached.main.teardown();
        info!(extension = extension_id, scenes = attached.scenes.len(), "extension detached");
        true
    }
}

impl Drop for ExtensionHost {
    fn drop(&mut self) {
        let ids = self.extension_ids();
        for id in ids {
            self.detach_extension(&id);
        }
    }
}

//! Extension side of an in-process extension, connected to an
//! [`ExtensionHost`] over [`MemoryChannel`] pairs.

use crate::host::ExtensionHost;
use crate::manifest::ExtensionManifest;
use encore_rpc::{
    ChannelHandle, Connection, Dispatcher, Endpoints, MemoryChannel, Role, RpcError,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoopbackError {
    #[error("host refused extension '{0}'")]
    ExtensionRejected(String),
    #[error("host refused scene '{scene}' of extension '{extension}'")]
    SceneRejected { extension: String, scene: String },
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

pub struct InProcessExtension {
    manifest: ExtensionManifest,
    main: Connection,
    scenes: Mutex<HashMap<String, Arc<Connection>>>,
}

impl InProcessExtension {
    /// Attach a new extension to `host` and bind its side of the channel.
    pub async fn connect(
        host: &ExtensionHost,
        manifest: ExtensionManifest,
    ) -> Result<Self, LoopbackError> {
        let (host_end, extension_end) = MemoryChannel::pair();
        let main = Connection::new(Dispatcher::new(Role::HostMain, Endpoints::new()));
        main.take_ownership(Arc::new(extension_end));

        let host_end: Arc<dyn ChannelHandle> = Arc::new(host_end);
        if !host.attach_extension(manifest.clone(), host_end).await {
            return Err(LoopbackError::ExtensionRejected(manifest.id));
        }
        Ok(Self {
            manifest,
            main,
            scenes: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn manifest(&self) -> &ExtensionManifest {
        &self.manifest
    }

    /// Connection used to call host-main endpoints.
    pub fn main(&self) -> &Connection {
        &self.main
    }

    /// Open a scene and return the connection used to call host-view
    /// endpoints and receive scene events.
    pub fn open_scene(
        &self,
        host: &ExtensionHost,
        scene_id: &str,
    ) -> Result<Arc<Connection>, LoopbackError> {
        let (host_end, extension_end) = MemoryChannel::pair();
        let scene = Arc::new(Connection::new(Dispatcher::new(
            Role::HostView,
            Endpoints::new(),
        )));
        scene.take_ownership(Arc::new(extension_end));

        if !host.attach_scene(&self.manifest.id, scene_id, Arc::new(host_end)) {
            return Err(LoopbackError::SceneRejected {
                extension: self.manifest.id.clone(),
                scene: scene_id.to_string(),
            });
        }
        self.scenes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scene_id.to_string(), scene.clone());
        Ok(scene)
    }

    pub fn scene(&self, scene_id: &str) -> Option<Arc<Connection>> {
        self.scenes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scene_id)
            .cloned()
    }
}

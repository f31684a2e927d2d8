use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use crate::event::{Event, EventBus};
use crate::storage::descriptor::DataDescriptor;
use crate::torrent::{Torrent, TorrentId};

/// Posible registry errors.
#[derive(Debug)]
pub enum RegistryError {
    PoisonedDescriptorsLock,
    PoisonedPendingLock,
    PoisonedDataLock,
    /// Attaching a second data descriptor to a torrent is a misuse.
    StorageAlreadyAttached(TorrentId),
    UnknownTorrent(TorrentId),
}

/// Per-torrent lifecycle record owned by the registry.
#[derive(Debug)]
pub struct TorrentDescriptor {
    torrent: Torrent,
    active: AtomicBool,
    data: Mutex<Option<Arc<DataDescriptor>>>,
}

impl TorrentDescriptor {
    fn new(torrent: Torrent) -> Self {
        Self {
            torrent,
            active: AtomicBool::new(true),
            data: Mutex::new(None),
        }
    }

    pub fn torrent(&self) -> &Torrent {
        &self.torrent
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    /// The attached storage view, if any.
    pub fn data(&self) -> Result<Option<Arc<DataDescriptor>>, RegistryError> {
        Ok(self
            .data
            .lock()
            .map_err(|_| RegistryError::PoisonedDataLock)?
            .clone())
    }

    fn attach(&self, data: Arc<DataDescriptor>) -> Result<(), RegistryError> {
        let mut slot = self
            .data
            .lock()
            .map_err(|_| RegistryError::PoisonedDataLock)?;
        if slot.is_some() {
            return Err(RegistryError::StorageAlreadyAttached(self.torrent.id));
        }
        *slot = Some(data);
        Ok(())
    }
}

/// Creates, looks up and tears down per-torrent state, fanning out
/// lifecycle events on the shared bus.
#[derive(Debug)]
pub struct TorrentRegistry {
    /// Ids announced before their metadata arrived (magnet fetch).
    pending: Mutex<HashSet<TorrentId>>,
    descriptors: Mutex<HashMap<TorrentId, Arc<TorrentDescriptor>>>,
    bus: Arc<EventBus>,
}

impl TorrentRegistry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            pending: Mutex::new(HashSet::new()),
            descriptors: Mutex::new(HashMap::new()),
            bus,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Announces a torrent id whose metadata is still being fetched,
    /// so incoming handshakes for it are accepted meanwhile.
    pub fn register_id(&self, id: TorrentId) -> Result<(), RegistryError> {
        self.lock_pending()?.insert(id);
        Ok(())
    }

    /// Registers a torrent, creating its descriptor if absent.
    ///
    /// Registering the same torrent twice returns the same descriptor.
    pub fn register(&self, torrent: Torrent) -> Result<Arc<TorrentDescriptor>, RegistryError> {
        let id = torrent.id;
        let descriptor = {
            let mut descriptors = self.lock_descriptors()?;
            descriptors
                .entry(id)
                .or_insert_with(|| {
                    info!("Torrent {} registered", id);
                    Arc::new(TorrentDescriptor::new(torrent))
                })
                .clone()
        };
        self.lock_pending()?.remove(&id);
        Ok(descriptor)
    }

    /// Attaches the storage view to a registered torrent.
    ///
    /// # Errors
    /// - `UnknownTorrent` if the id was never registered.
    /// - `StorageAlreadyAttached` on a second attach; the first stays.
    pub fn attach_storage(
        &self,
        id: TorrentId,
        data: Arc<DataDescriptor>,
    ) -> Result<(), RegistryError> {
        let descriptor = self
            .lookup(&id)?
            .ok_or(RegistryError::UnknownTorrent(id))?;
        descriptor.attach(data)
    }

    pub fn lookup(&self, id: &TorrentId) -> Result<Option<Arc<TorrentDescriptor>>, RegistryError> {
        Ok(self.lock_descriptors()?.get(id).cloned())
    }

    /// Whether connections for the torrent should be accepted: the id
    /// is known, and either the metadata is still being fetched or the
    /// descriptor is active.
    pub fn is_supported_and_active(&self, id: &TorrentId) -> Result<bool, RegistryError> {
        if self.lock_pending()?.contains(id) {
            return Ok(true);
        }
        Ok(self
            .lock_descriptors()?
            .get(id)
            .map(|descriptor| descriptor.is_active())
            .unwrap_or(false))
    }

    /// Removes the torrent and closes its storage. A second call for
    /// the same id is a no-op. Close errors are logged and swallowed;
    /// the torrent is gone regardless.
    pub fn unregister(&self, id: &TorrentId) -> Result<(), RegistryError> {
        self.lock_pending()?.remove(id);
        let removed = self.lock_descriptors()?.remove(id);

        let descriptor = match removed {
            Some(descriptor) => descriptor,
            None => return Ok(()),
        };
        descriptor.deactivate();
        if let Ok(Some(data)) = descriptor.data() {
            if let Err(err) = data.close() {
                warn!("Closing storage of {} failed: {:?}", id, err);
            }
        }
        info!("Torrent {} unregistered", id);
        self.bus.emit(Event::TorrentStopped { torrent: *id });
        Ok(())
    }

    fn lock_descriptors(
        &self,
    ) -> Result<MutexGuard<HashMap<TorrentId, Arc<TorrentDescriptor>>>, RegistryError> {
        self.descriptors
            .lock()
            .map_err(|_| RegistryError::PoisonedDescriptorsLock)
    }

    fn lock_pending(&self) -> Result<MutexGuard<HashSet<TorrentId>>, RegistryError> {
        self.pending
            .lock()
            .map_err(|_| RegistryError::PoisonedPendingLock)
    }
}

pub mod autosync;
pub mod host;
pub mod index;
pub mod lifecycle;
pub mod reconcile;
pub mod remote;
pub mod settings;
pub mod store;
pub mod types;
pub mod upload;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub use autosync::{AutoSyncConfig, AutoSyncScheduler, SyncCallback};
pub use host::{DocumentHost, HostError, HostSyncBridge, NullDocumentHost, OpenBatchOptions};
pub use index::{ContentIndex, IndexError, InitOptions, MigrationReport};
pub use lifecycle::{LifecycleEngine, LifecycleError, ToggleOutcome};
pub use reconcile::{EditOp, InsertOutcome, PendingCommit, Projection, ReconcileEngine, ReconcileError};
pub use remote::{BackendAdapter, BackendUploader, MockBackendAdapter, TranslateAuth};
pub use settings::{SettingsStore, UserSettings};
pub use store::{CacheStats, DownloadRequest, ImageFetcher, LocalImageStore, StoreError};
pub use types::{
    DisplaySource, GroupRef, HostEvent, ImageRecord, ImageRef, ImageStatus, ImageType, Product,
    PublishSku, UploadSummary,
};
pub use upload::{ImageUploader, UploadConfig, UploadManager, UploadObserver, UploadParams};

#[cfg(feature = "backend-http")]
pub use remote::HttpBackendAdapter;
#[cfg(feature = "backend-http")]
pub use store::HttpImageFetcher;

/// Where the durable state lives and how the background machinery is
/// tuned.
#[derive(Debug, Clone)]
pub struct ServicesConfig {
    /// Directory for the content index and settings files.
    pub data_dir: PathBuf,
    /// Root of the per-product image cache.
    pub cache_dir: PathBuf,
    /// Discard persisted index data from before the three-state schema.
    pub force_cleanup: bool,
    pub upload: UploadConfig,
}

/// External collaborators, injected once at startup.
pub struct ServiceDeps {
    pub fetcher: Arc<dyn ImageFetcher>,
    pub adapter: Arc<dyn BackendAdapter>,
    pub host: Arc<dyn DocumentHost>,
}

/// The wired-up service graph. Constructed explicitly and passed around;
/// there is no ambient singleton.
pub struct Services {
    pub index: Arc<ContentIndex>,
    pub store: Arc<LocalImageStore>,
    pub lifecycle: Arc<LifecycleEngine>,
    pub reconcile: Arc<ReconcileEngine>,
    pub uploads: Arc<UploadManager>,
    pub bridge: Arc<HostSyncBridge>,
    pub settings: Arc<SettingsStore>,
    pub adapter: Arc<dyn BackendAdapter>,
    auto_sync: Mutex<Option<AutoSyncScheduler>>,
}

impl Services {
    pub fn initialize(config: ServicesConfig, deps: ServiceDeps) -> Result<Self, IndexError> {
        let index = Arc::new(ContentIndex::new(config.data_dir.join("content_index.json")));
        index.initialize(InitOptions {
            force_cleanup: config.force_cleanup,
        })?;
        let store = Arc::new(LocalImageStore::new(
            config.cache_dir,
            Arc::clone(&index),
            deps.fetcher,
        ));
        let lifecycle = Arc::new(LifecycleEngine::new(Arc::clone(&index)));
        let reconcile = Arc::new(ReconcileEngine::new(Arc::clone(&index)));
        let uploader = Arc::new(BackendUploader::new(
            Arc::clone(&store),
            Arc::clone(&deps.adapter),
        ));
        let uploads = Arc::new(UploadManager::new(
            config.upload,
            uploader,
            Arc::clone(&index),
        ));
        let bridge = Arc::new(HostSyncBridge::new(
            Arc::clone(&index),
            Arc::clone(&store),
            deps.host,
        ));
        let settings = Arc::new(SettingsStore::open(settings::default_settings_path(
            &config.data_dir,
        )));
        Ok(Self {
            index,
            store,
            lifecycle,
            reconcile,
            uploads,
            bridge,
            settings,
            adapter: deps.adapter,
            auto_sync: Mutex::new(None),
        })
    }

    /// Pulls the product's current group structure from the backend,
    /// registers it in the index, and normalizes any legacy status tags.
    pub fn sync_product(&self, apply_code: &str) -> Result<Product, String> {
        let product = self.adapter.fetch_product(apply_code)?;
        self.index.put_product(product.clone());
        self.index.save_index_data().map_err(|e| e.to_string())?;
        self.index
            .migrate_product_to_three_state(apply_code)
            .map_err(|e| e.to_string())?;
        Ok(product)
    }

    /// Starts the recurring sync. Replaces any previously running
    /// scheduler.
    pub fn start_auto_sync(&self, config: AutoSyncConfig, callback: SyncCallback) {
        let scheduler = AutoSyncScheduler::spawn(config, Arc::clone(&self.settings), callback);
        let mut guard = self.auto_sync.lock().expect("poisoned");
        if let Some(previous) = guard.replace(scheduler) {
            previous.stop();
        }
    }

    /// Stops background work and flushes the index.
    pub fn teardown(&self) -> Result<(), IndexError> {
        if let Some(scheduler) = self.auto_sync.lock().expect("poisoned").take() {
            scheduler.stop();
        }
        self.uploads.cancel();
        self.index.save_index_data()
    }
}

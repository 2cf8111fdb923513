use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;

use crate::midi::registry::model::{LoadError, PumpRegistry, PumpStatus, RegistryLayout};
use crate::midi::registry::source::PumpSource;

/// Single-writer, many-reader handle to the current pump table.
///
/// Readers take an `Arc` of the snapshot and keep it for as long as they
/// need it; a reload swaps the pointer and never touches a published table.
#[derive(Clone)]
pub struct SharedRegistry {
    current: Arc<RwLock<Arc<PumpRegistry>>>,
    loading: Arc<Mutex<()>>,
    layout: RegistryLayout,
}

impl SharedRegistry {
    pub fn new(layout: RegistryLayout) -> SharedRegistry {
        SharedRegistry {
            current: Arc::new(RwLock::new(Arc::new(PumpRegistry::default()))),
            loading: Arc::new(Mutex::new(())),
            layout,
        }
    }

    pub fn current(&self) -> Arc<PumpRegistry> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn snapshot(&self) -> Vec<PumpStatus> {
        self.current().snapshot()
    }

    fn swap(&self, registry: PumpRegistry) {
        let registry = Arc::new(registry);
        match self.current.write() {
            Ok(mut guard) => *guard = registry,
            Err(poisoned) => *poisoned.into_inner() = registry,
        }
    }

    /// Loads `source` and publishes it. On failure the previous table stays.
    pub async fn reload(&self, source: &dyn PumpSource) -> Result<usize, LoadError> {
        let _loading = self.loading.lock().await;
        let registry = source.load(&self.layout).await?;
        let size = registry.len();
        self.swap(registry);
        log::info!("loaded {size} pumps from {}", source.describe());
        Ok(size)
    }
}

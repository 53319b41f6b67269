use super::processor::{SnapshotConfig, SnapshotProcessor};
use crate::component::ComponentId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

type ProcessorMap = Mutex<HashMap<ComponentId, Arc<SnapshotProcessor>>>;

/// Snapshot processors by component id.
///
/// The same processor definition may be referenced by a logs, a metrics and a traces pipeline.
/// They must share one set of buffers and one capability registration, so construction goes
/// through [`ProcessorRegistry::create_or_get`]. The registry is owned by the host integration
/// layer and cleared when the host shuts down completely.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: Arc<ProcessorMap>,
}

/// Lets a processor remove itself from the registry that created it on stop
pub(crate) struct RegistryHandle {
    processors: Weak<ProcessorMap>,
}

impl RegistryHandle {
    pub(crate) fn deregister(&self, id: &ComponentId, processor: &SnapshotProcessor) {
        let processors = match self.processors.upgrade() {
            Some(processors) => processors,
            None => return,
        };
        let mut processors = processors.lock();
        if processors
            .get(id)
            .map(|existing| std::ptr::eq(Arc::as_ptr(existing), processor))
            .unwrap_or(false)
        {
            processors.remove(id);
        }
    }
}

impl ProcessorRegistry {
    pub fn new() -> ProcessorRegistry {
        ProcessorRegistry::default()
    }

    /// Returns the processor registered under `id`, creating it from `config` first if there is
    /// none. The config of an existing processor is left as is.
    pub fn create_or_get(&self, id: &ComponentId, config: &SnapshotConfig) -> Arc<SnapshotProcessor> {
        let mut processors = self.processors.lock();
        if let Some(existing) = processors.get(id) {
            return existing.clone();
        }

        let processor = Arc::new(
            SnapshotProcessor::new(id.clone(), config.clone()).with_registry(RegistryHandle {
                processors: Arc::downgrade(&self.processors),
            }),
        );
        processors.insert(id.clone(), processor.clone());
        log::debug!("created snapshot processor processor={}", id);
        processor
    }

    pub fn get(&self, id: &ComponentId) -> Option<Arc<SnapshotProcessor>> {
        self.processors.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &ComponentId) -> Option<Arc<SnapshotProcessor>> {
        self.processors.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.processors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.lock().is_empty()
    }

    pub fn clear(&self) {
        self.processors.lock().clear();
    }
}

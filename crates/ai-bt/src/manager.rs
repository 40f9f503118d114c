use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::asset::{AssetId, BehaviorTreeAsset};
use crate::error::AssetError;
use crate::template::TreeTemplate;

/// Shares compiled templates between every component that runs the same asset.
///
/// Entries are keyed by asset identity and live until [`TemplateCache::invalidate`] or
/// [`TemplateCache::clear`]. Loading holds the lock while compiling, so the first load of an
/// asset is serialized.
#[derive(Debug, Default)]
pub struct TemplateCache {
    templates: Mutex<HashMap<AssetId, Arc<TreeTemplate>>>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide cache used by components that were not given their own.
    pub fn global() -> &'static TemplateCache {
        static GLOBAL: OnceLock<TemplateCache> = OnceLock::new();
        GLOBAL.get_or_init(TemplateCache::new)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<AssetId, Arc<TreeTemplate>>> {
        self.templates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn load(&self, asset: &BehaviorTreeAsset) -> Result<Arc<TreeTemplate>, AssetError> {
        let mut templates = self.lock();
        if let Some(template) = templates.get(&asset.id()) {
            return Ok(template.clone());
        }
        let template = Arc::new(TreeTemplate::compile(asset)?);
        templates.insert(asset.id(), template.clone());
        Ok(template)
    }

    pub fn contains(&self, asset: AssetId) -> bool {
        self.lock().contains_key(&asset)
    }

    /// Drops the cached template; running instances keep their `Arc`.
    pub fn invalidate(&self, asset: AssetId) -> bool {
        self.lock().remove(&asset).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

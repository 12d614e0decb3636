//! Model registry with explicit discovery.
//!
//! Applications enumerate their models in [`ModelSource`]s (usually declared
//! with [`model_source!`](crate::model_source)). [`ModelRegistry::discover`]
//! loads the sources selected by a [`DiscoveryScope`] once, checks that every
//! table name is unique and publishes an immutable [`RegistryHandle`].

use crate::error::{DbError, DbResult};
use crate::models::model::ModelDescriptor;
use parking_lot::RwLock;
use serde_json::json;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// A named, enumerable collection of models.
pub trait ModelSource: Send + Sync {
    /// Module path the models live under, e.g. `app::business::sys`.
    fn module_path(&self) -> &str;

    fn load(&self) -> DbResult<Vec<ModelDescriptor>>;
}

/// A source backed by a static list of descriptor constructors.
pub struct StaticModelSource {
    module_path: &'static str,
    models: &'static [fn() -> ModelDescriptor],
}

impl StaticModelSource {
    pub const fn new(module_path: &'static str, models: &'static [fn() -> ModelDescriptor]) -> Self {
        Self {
            module_path,
            models,
        }
    }
}

impl ModelSource for StaticModelSource {
    fn module_path(&self) -> &str {
        self.module_path
    }

    fn load(&self) -> DbResult<Vec<ModelDescriptor>> {
        Ok(self
            .models
            .iter()
            .map(|describe| {
                let mut descriptor = describe();
                descriptor.source_module = self.module_path.to_string();
                descriptor
            })
            .collect())
    }
}

impl std::fmt::Debug for StaticModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticModelSource")
            .field("module_path", &self.module_path)
            .field("models", &self.models.len())
            .finish()
    }
}

/// Declare a static [`StaticModelSource`].
///
/// ```ignore
/// model_source!(pub SYS_MODELS => [SysUser, SysRole]);
/// model_source!(pub LEGACY_MODELS, "app::legacy" => [LegacyUser]);
/// ```
///
/// The first form uses the invoking module's path.
#[macro_export]
macro_rules! model_source {
    ($vis:vis $name:ident => [$($model:ty),* $(,)?]) => {
        $crate::model_source!($vis $name, ::std::module_path!() => [$($model),*]);
    };
    ($vis:vis $name:ident, $module:expr => [$($model:ty),* $(,)?]) => {
        $vis static $name: $crate::models::StaticModelSource = $crate::models::StaticModelSource::new(
            $module,
            &[$(<$model as $crate::models::Model>::descriptor),*],
        );
    };
}

/// Which sources discovery loads, by module path.
///
/// `include` entries are path prefixes; an empty list includes everything.
/// `exclude` entries are path prefixes too, and a single-segment entry such as
/// `tests` also matches that segment anywhere in the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryScope {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for DiscoveryScope {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: vec!["tests".to_string()],
        }
    }
}

impl DiscoveryScope {
    pub fn including<I, S>(include: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: include.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn exclude(mut self, path: impl Into<String>) -> Self {
        self.exclude.push(path.into());
        self
    }

    pub fn contains(&self, module_path: &str) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|p| has_prefix(module_path, p));
        let excluded = self.exclude.iter().any(|p| {
            has_prefix(module_path, p)
                || (!p.contains("::") && module_path.split("::").any(|segment| segment == p))
        });
        included && !excluded
    }
}

/// Segment-wise prefix: `app::sys` is a prefix of `app::sys::user`, not of `app::system`.
fn has_prefix(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with("::"))
}

#[derive(Debug)]
struct Inner {
    models: Vec<ModelDescriptor>,
    by_table: HashMap<String, usize>,
    by_type: HashMap<TypeId, usize>,
}

/// Immutable snapshot of a completed discovery.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    inner: Arc<Inner>,
}

impl RegistryHandle {
    pub fn get(&self, table_name: &str) -> Option<&ModelDescriptor> {
        self.inner
            .by_table
            .get(table_name)
            .map(|&i| &self.inner.models[i])
    }

    pub fn get_by_type<M: 'static>(&self) -> Option<&ModelDescriptor> {
        self.inner
            .by_type
            .get(&TypeId::of::<M>())
            .map(|&i| &self.inner.models[i])
    }

    /// All models in discovery order.
    pub fn all(&self) -> &[ModelDescriptor] {
        &self.inner.models
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.inner
            .models
            .iter()
            .map(|m| m.table_name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.models.is_empty()
    }

    /// Aggregate table metadata for the external migration tool.
    pub fn metadata_json(&self) -> serde_json::Value {
        let tables: Vec<_> = self
            .inner
            .models
            .iter()
            .map(|m| {
                json!({
                    "name": m.table_name,
                    "comment": m.comment,
                    "model": m.type_name,
                    "module": m.source_module,
                    "capabilities": m.capabilities,
                    "columns": m.columns,
                })
            })
            .collect();
        json!({ "tables": tables })
    }

    fn build(scope: &DiscoveryScope, sources: &[&dyn ModelSource]) -> DbResult<Self> {
        let mut models: Vec<ModelDescriptor> = Vec::new();
        let mut by_table: HashMap<String, usize> = HashMap::new();
        let mut by_type: HashMap<TypeId, usize> = HashMap::new();

        for source in sources {
            let module = source.module_path();
            if !scope.contains(module) {
                debug!(module = %module, "Skipping model source outside discovery scope");
                continue;
            }

            let descriptors = source.load().map_err(|e| match e {
                DbError::DiscoveryError { .. } => e,
                other => DbError::discovery(module, other.to_string()),
            })?;
            debug!(module = %module, count = descriptors.len(), "Loaded model source");

            for descriptor in descriptors {
                if let Some(&existing) = by_table.get(&descriptor.table_name) {
                    let first = &models[existing];
                    // The same model listed by two sources is registered once.
                    if first.type_id == descriptor.type_id {
                        continue;
                    }
                    return Err(DbError::duplicate_table_name(
                        descriptor.table_name.clone(),
                        format!("{} ({})", first.type_name, first.source_module),
                        format!("{} ({})", descriptor.type_name, descriptor.source_module),
                    ));
                }
                let index = models.len();
                by_table.insert(descriptor.table_name.clone(), index);
                by_type.entry(descriptor.type_id).or_insert(index);
                models.push(descriptor);
            }
        }

        Ok(Self {
            inner: Arc::new(Inner {
                models,
                by_table,
                by_type,
            }),
        })
    }
}

/// Holds the published result of discovery.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    published: RwLock<Option<RegistryHandle>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run discovery once. Later calls return the cached handle without
    /// loading any source until [`ModelRegistry::reset`].
    ///
    /// On error nothing is published.
    pub fn discover(
        &self,
        scope: &DiscoveryScope,
        sources: &[&dyn ModelSource],
    ) -> DbResult<RegistryHandle> {
        let mut published = self.published.write();
        if let Some(handle) = published.as_ref() {
            debug!("Model registry already discovered; returning cached handle");
            return Ok(handle.clone());
        }

        let handle = RegistryHandle::build(scope, sources)?;
        info!(
            models = handle.len(),
            tables = ?handle.table_names(),
            "Model discovery complete"
        );
        *published = Some(handle.clone());
        Ok(handle)
    }

    /// The published handle, or `RegistryNotReady` before discovery.
    pub fn handle(&self) -> DbResult<RegistryHandle> {
        self.published
            .read()
            .clone()
            .ok_or(DbError::RegistryNotReady)
    }

    pub fn is_ready(&self) -> bool {
        self.published.read().is_some()
    }

    pub fn get(&self, table_name: &str) -> Option<ModelDescriptor> {
        self.published
            .read()
            .as_ref()
            .and_then(|h| h.get(table_name).cloned())
    }

    pub fn all(&self) -> Vec<ModelDescriptor> {
        self.published
            .read()
            .as_ref()
            .map(|h| h.all().to_vec())
            .unwrap_or_default()
    }

    /// Drop the published handle so the next discovery scans again.
    /// Intended for test harnesses.
    pub fn reset(&self) {
        self.published.write().take();
    }
}

/// The process-wide model registry.
pub fn global() -> &'static ModelRegistry {
    static GLOBAL: OnceLock<ModelRegistry> = OnceLock::new();
    GLOBAL.get_or_init(ModelRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::model::{ColumnDef, ColumnType, Model};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SysUser;
    impl Model for SysUser {
        fn columns() -> Vec<ColumnDef> {
            vec![ColumnDef::new("username", ColumnType::VarChar { length: 50 })]
        }
    }

    struct SysRole;
    impl Model for SysRole {
        fn columns() -> Vec<ColumnDef> {
            vec![ColumnDef::new("name", ColumnType::VarChar { length: 50 })]
        }
    }

    struct LegacyUser;
    impl Model for LegacyUser {
        fn table_name() -> String {
            "sys_user".to_string()
        }
        fn columns() -> Vec<ColumnDef> {
            Vec::new()
        }
    }

    crate::model_source!(SYS_MODELS, "app::business::sys" => [SysUser, SysRole]);
    crate::model_source!(LEGACY_MODELS, "app::business::legacy" => [LegacyUser]);
    crate::model_source!(TEST_MODELS, "app::business::tests" => [LegacyUser]);
    crate::model_source!(LOCAL_MODELS => [SysRole]);

    /// Counts loads; fails when asked to.
    struct CountingSource {
        loads: AtomicUsize,
        fail: bool,
    }

    impl ModelSource for CountingSource {
        fn module_path(&self) -> &str {
            "app::business::counting"
        }

        fn load(&self) -> DbResult<Vec<ModelDescriptor>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(DbError::internal("model definition is malformed"))
            } else {
                Ok(vec![SysRole::descriptor()])
            }
        }
    }

    #[test]
    fn test_discover_and_lookup() {
        let registry = ModelRegistry::new();
        let handle = registry
            .discover(&DiscoveryScope::default(), &[&SYS_MODELS])
            .unwrap();
        assert_eq!(handle.table_names(), vec!["sys_user", "sys_role"]);
        assert_eq!(
            handle.get("sys_user").unwrap().source_module,
            "app::business::sys"
        );
        assert!(handle.get_by_type::<SysRole>().is_some());
        assert!(handle.get("missing").is_none());
        assert_eq!(registry.get("sys_role").unwrap().table_name, "sys_role");
        assert_eq!(registry.all().len(), 2);
    }

    #[test]
    fn test_duplicate_table_name_publishes_nothing() {
        let registry = ModelRegistry::new();
        let err = registry
            .discover(&DiscoveryScope::default(), &[&SYS_MODELS, &LEGACY_MODELS])
            .unwrap_err();
        match &err {
            DbError::DuplicateTableName { table, first, second } => {
                assert_eq!(table, "sys_user");
                assert!(first.contains("app::business::sys"));
                assert!(second.contains("app::business::legacy"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!registry.is_ready());
        assert!(matches!(registry.handle(), Err(DbError::RegistryNotReady)));
    }

    #[test]
    fn test_same_model_in_two_sources_registered_once() {
        let registry = ModelRegistry::new();
        let everything = DiscoveryScope {
            include: Vec::new(),
            exclude: Vec::new(),
        };
        let handle = registry
            .discover(&everything, &[&SYS_MODELS, &LOCAL_MODELS])
            .unwrap();
        assert_eq!(handle.len(), 2);
        assert_eq!(
            handle.get("sys_role").unwrap().source_module,
            "app::business::sys"
        );
    }

    #[test]
    fn test_tests_modules_excluded_by_default() {
        let registry = ModelRegistry::new();
        let handle = registry
            .discover(&DiscoveryScope::default(), &[&SYS_MODELS, &TEST_MODELS])
            .unwrap();
        assert_eq!(handle.len(), 2);
        assert_eq!(
            handle.get("sys_user").unwrap().type_id,
            TypeId::of::<SysUser>()
        );
    }

    #[test]
    fn test_scope_matching() {
        let scope = DiscoveryScope::including(["app::business"]);
        assert!(scope.contains("app::business"));
        assert!(scope.contains("app::business::sys"));
        assert!(!scope.contains("app::businessy"));
        assert!(!scope.contains("app::business::sys::tests"));
        assert!(!scope.contains("other::models"));

        let scope = DiscoveryScope::default().exclude("app::business::legacy");
        assert!(scope.contains("app::business::sys"));
        assert!(!scope.contains("app::business::legacy::v1"));
    }

    #[test]
    fn test_discovery_runs_once_until_reset() {
        let registry = ModelRegistry::new();
        let source = CountingSource {
            loads: AtomicUsize::new(0),
            fail: false,
        };
        registry
            .discover(&DiscoveryScope::default(), &[&source])
            .unwrap();
        registry
            .discover(&DiscoveryScope::default(), &[&source])
            .unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);

        registry.reset();
        assert!(!registry.is_ready());
        registry
            .discover(&DiscoveryScope::default(), &[&source])
            .unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_source_failure_becomes_discovery_error() {
        let registry = ModelRegistry::new();
        let source = CountingSource {
            loads: AtomicUsize::new(0),
            fail: true,
        };
        let err = registry
            .discover(&DiscoveryScope::default(), &[&SYS_MODELS, &source])
            .unwrap_err();
        assert!(matches!(
            &err,
            DbError::DiscoveryError { module, .. } if module == "app::business::counting"
        ));
        assert!(err.to_string().contains("malformed"));
        assert!(!registry.is_ready());
    }

    #[test]
    fn test_metadata_json() {
        let registry = ModelRegistry::new();
        let handle = registry
            .discover(&DiscoveryScope::default(), &[&SYS_MODELS])
            .unwrap();
        let metadata = handle.metadata_json();
        let tables = metadata["tables"].as_array().unwrap();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0]["name"], "sys_user");
        assert_eq!(tables[0]["columns"][0]["name"], "id");
        assert_eq!(tables[0]["capabilities"]["timestamps"], true);
    }

    #[test]
    fn test_local_model_source_uses_module_path() {
        assert_eq!(LOCAL_MODELS.module_path(), module_path!());
    }
}

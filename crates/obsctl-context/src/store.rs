use std::path::{Path, PathBuf};

use tracing::{debug, info, Span};

use crate::codec;
use crate::error::Result;
use crate::model::{
    ApiEntry, ContextName, OidcSettings, Registry, ResolvedContext, TenantEntry,
};

/// Registry operations backed by the config file.
///
/// Every call loads the file, applies one change and writes it back, so a
/// store can be used from any fresh process without coordination. Two
/// processes racing on the same file get last-writer-wins.
#[derive(Debug, Clone)]
pub struct ContextStore {
    path: PathBuf,
    span: Span,
}

impl ContextStore {
    /// Store at the path resolved from the environment.
    pub fn from_env() -> Self {
        Self::new(codec::config_path())
    }

    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let span = tracing::debug_span!("context_store", path = %path.display());
        Self { path, span }
    }

    /// Log store activity under `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Read the registry as it is on disk.
    pub fn load(&self) -> Result<Registry> {
        let _enter = self.span.enter();
        codec::load(&self.path)
    }

    fn update<T>(&self, op: impl FnOnce(&mut Registry) -> Result<T>) -> Result<T> {
        let _enter = self.span.enter();
        let mut registry = codec::load(&self.path)?;
        let value = op(&mut registry)?;
        codec::save(&self.path, &registry)?;
        Ok(value)
    }

    /// Register an API. Returns the name it was stored under.
    pub fn add_api(&self, name: Option<&str>, url: &str) -> Result<String> {
        let name = self.update(|registry| registry.add_api(name, url))?;
        info!(parent: &self.span, api = %name, "added api");
        Ok(name)
    }

    pub fn remove_api(&self, name: &str) -> Result<()> {
        self.update(|registry| registry.remove_api(name))?;
        info!(parent: &self.span, api = name, "removed api");
        Ok(())
    }

    /// Add a tenant under `api`, becoming current if nothing is selected yet.
    pub fn add_tenant(
        &self,
        name: &str,
        api: &str,
        remote_tenant: &str,
        oidc: Option<OidcSettings>,
    ) -> Result<()> {
        let entry = TenantEntry {
            tenant: remote_tenant.to_string(),
            ca: None,
            oidc,
        };
        self.add_tenant_entry(name, api, entry)
    }

    /// Like [`ContextStore::add_tenant`] with a fully built entry (CA included).
    pub fn add_tenant_entry(&self, name: &str, api: &str, entry: TenantEntry) -> Result<()> {
        let became_current = self.update(|registry| registry.add_tenant(name, api, entry))?;
        info!(parent: &self.span, api, tenant = name, "added tenant");
        if became_current {
            debug!(parent: &self.span, api, tenant = name, "set new tenant as current");
        }
        Ok(())
    }

    pub fn remove_tenant(&self, name: &str, api: &str) -> Result<()> {
        self.update(|registry| registry.remove_tenant(name, api))?;
        info!(parent: &self.span, api, tenant = name, "removed tenant");
        Ok(())
    }

    /// Remove `api/tenant`, dropping the API too if this was its last tenant.
    pub fn remove_context(&self, api: &str, tenant: &str) -> Result<()> {
        self.update(|registry| registry.remove_context(api, tenant))?;
        info!(parent: &self.span, api, tenant, "removed context");
        Ok(())
    }

    pub fn set_current(&self, api: &str, tenant: &str) -> Result<()> {
        self.update(|registry| registry.set_current(api, tenant))?;
        info!(parent: &self.span, api, tenant, "switched current context");
        Ok(())
    }

    /// The current tenant and its API.
    pub fn get_current(&self) -> Result<(TenantEntry, ApiEntry)> {
        let resolved = self.current()?;
        Ok((resolved.tenant, resolved.api))
    }

    pub fn get_context(&self, api: &str, tenant: &str) -> Result<(TenantEntry, ApiEntry)> {
        let resolved = self.load()?.resolve(api, tenant)?;
        Ok((resolved.tenant, resolved.api))
    }

    /// The current context, including its names.
    pub fn current(&self) -> Result<ResolvedContext> {
        self.load()?.resolve_current()
    }

    /// Every registered context and the current selection.
    pub fn list_contexts(&self) -> Result<(Vec<ContextName>, Option<ContextName>)> {
        let registry = self.load()?;
        Ok((registry.contexts(), registry.current().cloned()))
    }

    /// Write back a tenant entry, e.g. one carrying a refreshed token.
    pub fn save_tenant(&self, api: &str, tenant: &str, entry: TenantEntry) -> Result<()> {
        self.update(|registry| registry.replace_tenant(api, tenant, entry))?;
        debug!(parent: &self.span, api, tenant, "updated tenant in config file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ContextError;
    use tempfile::TempDir;

    fn setup() -> (ContextStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = ContextStore::new(temp_dir.path().join("obsctl").join("config.json"));
        (store, temp_dir)
    }

    #[test]
    fn test_end_to_end_first_context() {
        let (store, _temp) = setup();

        store.add_api(Some("stage"), "https://stage:9090").unwrap();
        store.add_tenant("t", "stage", "t", None).unwrap();

        let (tenant, api) = store.get_current().unwrap();
        assert_eq!(tenant, TenantEntry::new("t"));
        assert_eq!(api.url, "https://stage:9090/");
    }

    #[test]
    fn test_every_mutation_is_persisted() {
        let (store, _temp) = setup();
        store.add_api(Some("stage"), "https://stage:9090").unwrap();

        // A second handle sees the change without sharing any memory.
        let other = ContextStore::new(store.path());
        assert!(other.load().unwrap().api("stage").is_some());

        other.add_tenant("t", "stage", "t", None).unwrap();
        assert_eq!(
            store.load().unwrap().current(),
            Some(&ContextName::new("stage", "t"))
        );
    }

    #[test]
    fn test_failed_mutation_leaves_file_untouched() {
        let (store, _temp) = setup();
        store.add_api(Some("stage"), "https://stage:9090").unwrap();
        let before = std::fs::read(store.path()).unwrap();

        let err = store.add_api(Some("stage"), "https://elsewhere").unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(std::fs::read(store.path()).unwrap(), before);
    }

    #[test]
    fn test_get_context_not_found() {
        let (store, _temp) = setup();
        store.add_api(Some("stage"), "https://stage:9090").unwrap();

        let err = store.get_context("stage", "missing").unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(
            store.get_context("prod", "t"),
            Err(ContextError::ApiNotFound(_))
        ));
    }

    #[test]
    fn test_get_current_empty() {
        let (store, _temp) = setup();
        assert!(matches!(store.get_current(), Err(ContextError::EmptyContext)));
    }

    #[test]
    fn test_list_contexts() {
        let (store, _temp) = setup();
        store.add_api(Some("stage"), "https://stage:9090").unwrap();
        store.add_api(Some("prod"), "https://prod:9090").unwrap();
        store.add_tenant("b", "stage", "b", None).unwrap();
        store.add_tenant("a", "stage", "a", None).unwrap();
        store.add_tenant("a", "prod", "a", None).unwrap();

        let (contexts, current) = store.list_contexts().unwrap();
        let names: Vec<String> = contexts.iter().map(ToString::to_string).collect();
        assert_eq!(names, ["prod/a", "stage/a", "stage/b"]);
        assert_eq!(current, Some(ContextName::new("stage", "b")));
    }

    #[test]
    fn test_save_tenant_requires_existing_slot() {
        let (store, _temp) = setup();
        store.add_api(Some("stage"), "https://stage:9090").unwrap();
        store.add_tenant("t", "stage", "t", None).unwrap();

        store
            .save_tenant("stage", "t", TenantEntry::new("renamed"))
            .unwrap();
        assert_eq!(store.get_current().unwrap().0.tenant, "renamed");

        store.remove_tenant("t", "stage").unwrap();
        assert!(store
            .save_tenant("stage", "t", TenantEntry::new("t"))
            .unwrap_err()
            .is_not_found());
    }
}

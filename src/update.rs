//! Backend configuration updates.
//!
//! Applies a validated patch to one backend. A model change that renames
//! the sanitized identifier triggers an identity migration: the old
//! config/unit pair is removed and a new pair is created under the new id,
//! optionally cycling the process. At every point the persisted config set
//! has at most one entry per id; after step 3 of a migration the new
//! config is the authoritative state.

use std::{sync::Arc, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    catalog::Catalog,
    config::{
        label_for, sanitize_model_name, validate_alias, BackendConfig, ServiceStatus,
    },
    error::Error,
    lifecycle::LifecycleEngine,
    ports,
    store::StateStore,
    supervisor::remove_unit,
};

/// Partial update for one backend. Unknown fields are rejected at the
/// HTTP layer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BackendPatch {
    /// Model name or path, resolved through the catalog.
    pub model: Option<String>,
    /// New alias; an empty string clears the alias.
    pub alias: Option<String>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub threads: Option<u32>,
    pub ctx_size: Option<u32>,
    pub gpu_layers: Option<u32>,
    pub verbose: Option<bool>,
    pub embeddings: Option<bool>,
    pub jinja: Option<bool>,
    pub custom_flags: Option<Vec<String>>,
    /// Cycle the process so changes take effect now (when it was running).
    #[serde(default)]
    pub restart: bool,
}

/// What an update did, surfaced through the admin API.
#[derive(Debug)]
pub struct UpdateOutcome {
    pub backend: BackendConfig,
    pub migrated: bool,
    pub old_id: Option<String>,
}

pub struct UpdateService {
    store: Arc<StateStore>,
    catalog: Arc<Catalog>,
    lifecycle: Arc<LifecycleEngine>,
    /// Settle time between unloading the old unit and removing it during
    /// migration of a running backend.
    migrate_settle: Duration,
}

impl UpdateService {
    pub fn new(
        store: Arc<StateStore>,
        catalog: Arc<Catalog>,
        lifecycle: Arc<LifecycleEngine>,
    ) -> Self {
        Self {
            store,
            catalog,
            lifecycle,
            migrate_settle: Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.migrate_settle = settle;
        self
    }

    pub async fn apply(
        &self,
        identifier: &str,
        patch: BackendPatch,
    ) -> Result<UpdateOutcome, Error> {
        let backend = self
            .store
            .find_by_identifier(identifier)
            .ok_or_else(|| Error::NotFound(format!("no server matches `{identifier}`")))?;

        self.validate(&backend, &patch)?;

        // A model change may rename the sanitized identifier.
        if let Some(model) = &patch.model {
            let path = self.catalog.resolve(model).ok_or_else(|| {
                Error::NotFound(format!("model `{model}` not found in the models directory"))
            })?;
            if self
                .store
                .list_backends()
                .iter()
                .any(|b| b.id != backend.id && b.model_path == path)
            {
                return Err(Error::Conflict(format!(
                    "model {} is already served by another backend",
                    path.display()
                )));
            }

            let model_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| model.clone());
            let new_id = sanitize_model_name(&model_name);

            if new_id != backend.id {
                return self.migrate(backend, patch, new_id, model_name, path).await;
            }

            // Same identity, new file (e.g. moved on disk).
            let mut updated = backend;
            updated.model_path = path;
            updated.model_name = model_name;
            return self.apply_plain(updated, patch).await;
        }

        self.apply_plain(backend, patch).await
    }

    /// Field validation independent of the migration decision.
    fn validate(&self, backend: &BackendConfig, patch: &BackendPatch) -> Result<(), Error> {
        if let Some(alias) = patch.alias.as_deref().filter(|a| !a.is_empty()) {
            validate_alias(alias)?;
            let taken = self.store.list_backends().iter().any(|b| {
                b.id != backend.id
                    && b.alias
                        .as_deref()
                        .is_some_and(|existing| existing.eq_ignore_ascii_case(alias))
            });
            if taken {
                return Err(Error::Conflict(format!("alias `{alias}` is already in use")));
            }
        }

        if let Some(port) = patch.port {
            let mut used = self.store.used_ports();
            used.remove(&backend.port);
            ports::check_requested(port, &used, Some(backend.port))?;
        }

        if let Some(host) = &patch.host {
            if host.trim().is_empty() {
                return Err(Error::Validation("host must not be empty".into()));
            }
        }

        Ok(())
    }

    /// Copy patch fields that don't affect identity.
    fn merge_fields(backend: &mut BackendConfig, patch: &BackendPatch) {
        if let Some(alias) = &patch.alias {
            backend.alias = (!alias.is_empty()).then(|| alias.clone());
        }
        if let Some(port) = patch.port {
            backend.port = port;
        }
        if let Some(host) = &patch.host {
            backend.host = host.clone();
        }
        if let Some(threads) = patch.threads {
            backend.threads = Some(threads);
        }
        if let Some(ctx) = patch.ctx_size {
            backend.ctx_size = Some(ctx);
        }
        if let Some(layers) = patch.gpu_layers {
            backend.gpu_layers = Some(layers);
        }
        if let Some(verbose) = patch.verbose {
            backend.verbose = verbose;
        }
        if let Some(embeddings) = patch.embeddings {
            backend.embeddings = embeddings;
        }
        if let Some(jinja) = patch.jinja {
            backend.jinja = jinja;
        }
        if let Some(flags) = &patch.custom_flags {
            backend.custom_flags = flags.clone();
        }
    }

    /// Non-migrating path: persist the merged config, regenerate the unit,
    /// and cycle the process if asked to.
    async fn apply_plain(
        &self,
        mut backend: BackendConfig,
        patch: BackendPatch,
    ) -> Result<UpdateOutcome, Error> {
        let was_running = backend.status == ServiceStatus::Running;
        Self::merge_fields(&mut backend, &patch);

        if was_running && patch.restart {
            if let Err(e) = self.lifecycle.supervisor().stop(&backend.label).await {
                warn!(id = %backend.id, error = %e, "stop before reconfigure failed");
            }
            if let Err(e) = self.lifecycle.supervisor().unload(&backend.plist_path).await {
                warn!(id = %backend.id, error = %e, "unload before reconfigure failed");
            }
            backend.status = ServiceStatus::Stopped;
            backend.pid = None;
        }

        self.store.save_backend(&backend)?;
        self.lifecycle.unit_spec(&backend).write()?;

        if was_running && patch.restart {
            let backend = self.lifecycle.start(&backend.id).await?;
            return Ok(UpdateOutcome { backend, migrated: false, old_id: None });
        }

        Ok(UpdateOutcome { backend, migrated: false, old_id: None })
    }

    /// Identity migration: the sanitized id changed, so the old
    /// config/unit pair is removed and a new pair created.
    async fn migrate(
        &self,
        old: BackendConfig,
        patch: BackendPatch,
        new_id: String,
        model_name: String,
        model_path: std::path::PathBuf,
    ) -> Result<UpdateOutcome, Error> {
        // 1. The new id must be free on disk.
        if self.store.backend_exists(&new_id) {
            return Err(Error::Conflict(format!(
                "a server with id `{new_id}` already exists"
            )));
        }

        let was_running = old.status == ServiceStatus::Running;

        // 2. Take the old process down before its definition disappears.
        if was_running && patch.restart {
            if let Err(e) = self.lifecycle.supervisor().stop(&old.label).await {
                warn!(id = %old.id, error = %e, "stop of migrating backend failed");
            }
            if let Err(e) = self.lifecycle.supervisor().unload(&old.plist_path).await {
                warn!(id = %old.id, error = %e, "unload of migrating backend failed");
            }
            tokio::time::sleep(self.migrate_settle).await;
        }

        // 3. Remove the old pair. From here on the new config is the
        // authoritative state.
        remove_unit(&old.plist_path)?;
        self.store.delete_backend(&old.id)?;

        // 4–5. Build and persist the successor, then write its unit.
        let paths = self.store.backend_paths(&new_id);
        let mut backend = old.clone();
        backend.id = new_id.clone();
        backend.label = label_for(&new_id);
        backend.model_path = model_path;
        backend.model_name = model_name;
        backend.plist_path = paths.plist;
        backend.stdout_path = paths.stdout;
        backend.stderr_path = paths.stderr;
        backend.http_log_path = paths.http_log;
        backend.status = ServiceStatus::Stopped;
        backend.pid = None;
        backend.metal_memory_mb = None;
        Self::merge_fields(&mut backend, &patch);

        self.store.save_backend(&backend)?;
        self.lifecycle.unit_spec(&backend).write()?;

        info!(old_id = %old.id, new_id = %backend.id, "backend identity migrated");

        // 6. Bring the successor up if the predecessor was running.
        if was_running && patch.restart {
            let backend = self.lifecycle.start(&new_id).await?;
            return Ok(UpdateOutcome {
                backend,
                migrated: true,
                old_id: Some(old.id),
            });
        }

        Ok(UpdateOutcome {
            backend,
            migrated: true,
            old_id: Some(old.id),
        })
    }
}

//! Model file management.
//!
//! Deletion resolves the identifier through the catalog, discovers
//! dependent backends strictly by absolute path (shard membership for
//! sharded sets — filename matching is forbidden), and either refuses or
//! cascades over the dependents before unlinking the weights.

use std::{path::PathBuf, sync::Arc};

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    catalog::{Catalog, ModelInfo},
    config::ServiceStatus,
    error::Error,
    lifecycle::LifecycleEngine,
    store::StateStore,
    supervisor::remove_unit,
};

/// Result of a model deletion, surfaced through the admin API.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReport {
    pub model: String,
    pub deleted_files: Vec<PathBuf>,
    pub removed_backends: Vec<String>,
}

pub struct ModelManager {
    store: Arc<StateStore>,
    catalog: Arc<Catalog>,
    lifecycle: Arc<LifecycleEngine>,
}

impl ModelManager {
    pub fn new(
        store: Arc<StateStore>,
        catalog: Arc<Catalog>,
        lifecycle: Arc<LifecycleEngine>,
    ) -> Self {
        Self { store, catalog, lifecycle }
    }

    /// Backend ids that serve this model. Path-exact: a backend depends on
    /// a sharded set when its model path is one of the shards, and on a
    /// single file only under path equality.
    pub fn dependents_for(&self, entry: &ModelInfo) -> Vec<String> {
        self.store
            .list_backends()
            .into_iter()
            .filter(|b| {
                if entry.is_sharded {
                    entry.shard_paths.iter().any(|shard| *shard == b.model_path)
                } else {
                    b.model_path == entry.path
                }
            })
            .map(|b| b.id)
            .collect()
    }

    pub async fn delete(&self, identifier: &str, cascade: bool) -> Result<DeleteReport, Error> {
        let entry = self.catalog.resolve_entry(identifier).ok_or_else(|| {
            Error::NotFound(format!("model `{identifier}` not found"))
        })?;

        let dependents = self.dependents_for(&entry);
        if !dependents.is_empty() && !cascade {
            return Err(Error::Conflict(format!(
                "model {} is used by {} server(s)",
                entry.filename,
                dependents.len()
            )));
        }

        let mut removed_backends = Vec::new();
        for id in dependents {
            let Some(backend) = self.store.load_backend(&id)? else {
                continue;
            };
            if backend.status == ServiceStatus::Running {
                if let Err(e) = self.lifecycle.stop(&id).await {
                    warn!(id, error = %e, "stop during cascade delete failed");
                }
            }
            remove_unit(&backend.plist_path)?;
            self.store.delete_backend(&id)?;
            self.store.delete_history(&id);
            info!(id, "removed backend during cascade delete");
            removed_backends.push(id);
        }

        let mut deleted_files = Vec::new();
        if entry.is_sharded {
            for shard in &entry.shard_paths {
                std::fs::remove_file(shard)?;
                deleted_files.push(shard.clone());
            }
            // Sharded sets often live in their own directory; tidy it up
            // if nothing else is in there.
            if let Some(parent) = entry.path.parent() {
                let _ = std::fs::remove_dir(parent);
            }
        } else {
            std::fs::remove_file(&entry.path)?;
            deleted_files.push(entry.path.clone());
        }

        info!(model = %entry.filename, files = deleted_files.len(), "model deleted");
        Ok(DeleteReport {
            model: entry.filename,
            deleted_files,
            removed_backends,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{sanitize_model_name, BackendConfig, TuningDefaults};
    use crate::lifecycle::Timings;
    use crate::store::ModelsDirProvider;
    use crate::supervisor::mock::MockSupervisor;
    use crate::supervisor::Supervisor;
    use std::path::Path;
    use std::time::Duration;

    struct Fixture {
        _state: tempfile::TempDir,
        models: tempfile::TempDir,
        store: Arc<StateStore>,
        supervisor: Arc<MockSupervisor>,
        manager: ModelManager,
    }

    fn fixture() -> Fixture {
        let state = tempfile::tempdir().unwrap();
        let models = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(state.path().to_path_buf()).unwrap());
        let mut global = store.global().unwrap();
        global.models_directory = models.path().to_path_buf();
        store.save_global(&global).unwrap();

        let supervisor = Arc::new(MockSupervisor::new());
        let catalog = Arc::new(Catalog::new(
            Arc::clone(&store) as Arc<dyn ModelsDirProvider>
        ));
        let lifecycle = Arc::new(LifecycleEngine::with_timings(
            Arc::clone(&store),
            Arc::clone(&supervisor) as Arc<dyn crate::supervisor::Supervisor>,
            "/usr/local/bin/llama-server".into(),
            Timings {
                start_timeout: Duration::from_millis(200),
                port_timeout: Duration::from_millis(200),
                stop_timeout: Duration::from_millis(200),
                metal_grace: Duration::ZERO,
                throttle_settle: Duration::from_millis(10),
                port_poll: Duration::from_millis(20),
            },
        ));
        let manager = ModelManager::new(Arc::clone(&store), catalog, lifecycle);
        Fixture { _state: state, models, store, supervisor, manager }
    }

    fn add_backend_for(f: &Fixture, model_name: &str, path: &Path, port: u16) -> BackendConfig {
        let id = sanitize_model_name(model_name);
        let backend = BackendConfig::new(
            model_name,
            path,
            port,
            f.store.backend_paths(&id),
            &TuningDefaults::default(),
        );
        f.store.save_backend(&backend).unwrap();
        backend
    }

    // -----------------------------------------------------------------------
    // Dependent discovery + refusal
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn delete_without_cascade_refuses_when_in_use() {
        let f = fixture();
        let path = f.models.path().join("x.gguf");
        std::fs::write(&path, b"gguf").unwrap();
        add_backend_for(&f, "x.gguf", &path, 9400);

        let err = f.manager.delete("x.gguf", false).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(err.to_string().contains("used by 1 server(s)"));
        assert!(path.exists(), "model must not be deleted");
    }

    #[tokio::test]
    async fn delete_unused_model_unlinks_it() {
        let f = fixture();
        let path = f.models.path().join("x.gguf");
        std::fs::write(&path, b"gguf").unwrap();

        let report = f.manager.delete("x.gguf", false).await.unwrap();
        assert_eq!(report.deleted_files, vec![path.clone()]);
        assert!(report.removed_backends.is_empty());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.manager.delete("ghost.gguf", true).await,
            Err(Error::NotFound(_))
        ));
    }

    // -----------------------------------------------------------------------
    // Cascade is path-exact: two backends on /m/x.gguf are removed, the
    // backend on /other/x.gguf (same basename!) survives.
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn cascade_delete_filters_by_absolute_path_not_filename() {
        let f = fixture();
        let shared = f.models.path().join("x.gguf");
        std::fs::write(&shared, b"gguf").unwrap();

        let other_dir = tempfile::tempdir().unwrap();
        let other = other_dir.path().join("x.gguf");
        std::fs::write(&other, b"gguf").unwrap();

        // Two dependents of the shared file. The store enforces unique ids
        // in real operation; forge distinct ids here to model the scenario.
        let mut a = add_backend_for(&f, "x.gguf", &shared, 9400);
        a.id = "x-a".into();
        f.store.save_backend(&a).unwrap();
        f.store.delete_backend("x").unwrap();
        let mut b = add_backend_for(&f, "x.gguf", &shared, 9401);
        b.id = "x-b".into();
        f.store.save_backend(&b).unwrap();
        f.store.delete_backend("x").unwrap();
        // Third backend: same basename, different directory.
        let mut c = add_backend_for(&f, "x.gguf", &other, 9402);
        c.id = "x-c".into();
        f.store.save_backend(&c).unwrap();
        f.store.delete_backend("x").unwrap();

        let report = f.manager.delete("x.gguf", true).await.unwrap();

        assert!(!shared.exists());
        assert!(other.exists(), "same-basename model elsewhere must survive");
        let mut removed = report.removed_backends.clone();
        removed.sort();
        assert_eq!(removed, vec!["x-a", "x-b"]);
        assert!(f.store.load_backend("x-c").unwrap().is_some());
    }

    #[tokio::test]
    async fn cascade_stops_running_dependents() {
        let f = fixture();
        let path = f.models.path().join("x.gguf");
        std::fs::write(&path, b"gguf").unwrap();
        let mut backend = add_backend_for(&f, "x.gguf", &path, 9400);
        backend.status = ServiceStatus::Running;
        f.store.save_backend(&backend).unwrap();
        f.supervisor.start(&backend.label).await.unwrap();

        let report = f.manager.delete("x.gguf", true).await.unwrap();
        assert_eq!(report.removed_backends, vec!["x"]);
        assert!(!f.supervisor.is_running(&backend.label));
        assert!(f.store.load_backend("x").unwrap().is_none());
    }

    // -----------------------------------------------------------------------
    // Sharded sets
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn sharded_delete_unlinks_every_shard() {
        let f = fixture();
        let sub = f.models.path().join("big");
        std::fs::create_dir(&sub).unwrap();
        for i in 1..=3 {
            std::fs::write(sub.join(format!("big-0000{i}-of-00003.gguf")), b"gguf").unwrap();
        }

        let report = f.manager.delete("big", true).await.unwrap();
        assert_eq!(report.deleted_files.len(), 3);
        assert!(!sub.exists(), "emptied shard directory is removed");
    }

    #[tokio::test]
    async fn backend_on_a_later_shard_counts_as_dependent() {
        let f = fixture();
        for i in 1..=2 {
            std::fs::write(
                f.models.path().join(format!("big-0000{i}-of-00002.gguf")),
                b"gguf",
            )
            .unwrap();
        }
        // Depend on shard 2, not the entry point.
        let shard2 = f.models.path().join("big-00002-of-00002.gguf");
        add_backend_for(&f, "big-00002-of-00002.gguf", &shard2, 9400);

        let err = f.manager.delete("big", false).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }
}

//! JSON-backed store for registered projects and quick-access sites.
//!
//! The file is the source of truth; every mutation rewrites it atomically
//! (write a sibling `.tmp`, then rename). The supervisor only ever reads
//! from here.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use devport_core::{
    AppConfig, NewProject, NewQuickAccessSite, Project, ProjectUpdate, QuickAccessSite,
    QuickAccessSiteUpdate,
};

#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    path: PathBuf,
    config: AppConfig,
}

impl ConfigStore {
    /// Load the config file, or start from an empty config when it does
    /// not exist yet. A file that exists but fails to parse is an error;
    /// silently resetting it would throw away the user's registrations.
    pub async fn load(path: PathBuf) -> anyhow::Result<Self> {
        let config = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("failed to parse config file {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read config file {}", path.display()));
            }
        };

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner { path, config })),
        })
    }

    pub async fn get_config(&self) -> AppConfig {
        self.inner.lock().await.config.clone()
    }

    pub async fn list_projects(&self) -> Vec<Project> {
        self.inner.lock().await.config.projects.clone()
    }

    pub async fn get_project(&self, id: &str) -> Option<Project> {
        self.inner
            .lock()
            .await
            .config
            .projects
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    pub async fn add_project(&self, new: NewProject) -> anyhow::Result<Project> {
        if new.name.trim().is_empty() {
            bail!("project name must not be empty");
        }
        if new.command.trim().is_empty() {
            bail!("project command must not be empty");
        }
        if !Path::new(&new.path).is_absolute() {
            bail!("project path must be absolute: {}", new.path);
        }

        let now = Utc::now();
        let project = Project {
            id: uuid::Uuid::new_v4().to_string(),
            name: new.name,
            path: new.path,
            command: new.command,
            port: new.port,
            description: new.description,
            created_at: now,
            updated_at: now,
        };

        let mut inner = self.inner.lock().await;
        inner.config.projects.push(project.clone());
        inner.persist().await?;
        Ok(project)
    }

    pub async fn update_project(
        &self,
        id: &str,
        updates: ProjectUpdate,
    ) -> anyhow::Result<Option<Project>> {
        if let Some(path) = &updates.path
            && !Path::new(path).is_absolute()
        {
            bail!("project path must be absolute: {path}");
        }

        let mut inner = self.inner.lock().await;
        let Some(project) = inner.config.projects.iter_mut().find(|p| p.id == id) else {
            return Ok(None);
        };

        if let Some(name) = updates.name {
            project.name = name;
        }
        if let Some(path) = updates.path {
            project.path = path;
        }
        if let Some(command) = updates.command {
            project.command = command;
        }
        if let Some(port) = updates.port {
            project.port = Some(port);
        }
        if let Some(description) = updates.description {
            project.description = Some(description);
        }
        project.updated_at = Utc::now();
        let updated = project.clone();

        inner.persist().await?;
        Ok(Some(updated))
    }

    pub async fn delete_project(&self, id: &str) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.config.projects.len();
        inner.config.projects.retain(|p| p.id != id);
        if inner.config.projects.len() == before {
            return Ok(false);
        }
        inner.persist().await?;
        Ok(true)
    }

    pub async fn add_quick_access_site(
        &self,
        new: NewQuickAccessSite,
    ) -> anyhow::Result<QuickAccessSite> {
        if new.name.trim().is_empty() {
            bail!("site name must not be empty");
        }
        if new.url.trim().is_empty() {
            bail!("site url must not be empty");
        }

        let site = QuickAccessSite {
            id: uuid::Uuid::new_v4().to_string(),
            name: new.name,
            url: new.url,
            description: new.description,
            icon: new.icon,
            created_at: Utc::now(),
        };

        let mut inner = self.inner.lock().await;
        inner.config.quick_access_sites.push(site.clone());
        inner.persist().await?;
        Ok(site)
    }

    pub async fn update_quick_access_site(
        &self,
        id: &str,
        updates: QuickAccessSiteUpdate,
    ) -> anyhow::Result<Option<QuickAccessSite>> {
        let mut inner = self.inner.lock().await;
        let Some(site) = inner
            .config
            .quick_access_sites
            .iter_mut()
            .find(|s| s.id == id)
        else {
            return Ok(None);
        };

        if let Some(name) = updates.name {
            site.name = name;
        }
        if let Some(url) = updates.url {
            site.url = url;
        }
        if let Some(description) = updates.description {
            site.description = Some(description);
        }
        if let Some(icon) = updates.icon {
            site.icon = Some(icon);
        }
        let updated = site.clone();

        inner.persist().await?;
        Ok(Some(updated))
    }

    pub async fn delete_quick_access_site(&self, id: &str) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.config.quick_access_sites.len();
        inner.config.quick_access_sites.retain(|s| s.id != id);
        if inner.config.quick_access_sites.len() == before {
            return Ok(false);
        }
        inner.persist().await?;
        Ok(true)
    }
}

impl Inner {
    async fn persist(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create config dir {}", parent.display()))?;
        }

        let data =
            serde_json::to_vec_pretty(&self.config).context("failed to serialize config")?;
        let tmp = self.path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(&data)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        file.flush().await.ok();
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to persist {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_config_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("config.json")
    }

    fn sample_project() -> NewProject {
        NewProject {
            name: "web".to_string(),
            path: "/srv/web".to_string(),
            command: "npm run dev".to_string(),
            port: Some(3000),
            description: None,
        }
    }

    #[tokio::test]
    async fn add_then_get_project_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(scratch_config_path(&dir)).await.unwrap();

        let project = store.add_project(sample_project()).await.unwrap();
        assert!(!project.id.is_empty());

        let fetched = store.get_project(&project.id).await.unwrap();
        assert_eq!(fetched.name, "web");
        assert_eq!(fetched.port, Some(3000));
    }

    #[tokio::test]
    async fn config_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_config_path(&dir);

        let store = ConfigStore::load(path.clone()).await.unwrap();
        let project = store.add_project(sample_project()).await.unwrap();
        drop(store);

        let reloaded = ConfigStore::load(path).await.unwrap();
        assert!(reloaded.get_project(&project.id).await.is_some());
    }

    #[tokio::test]
    async fn update_touches_only_provided_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(scratch_config_path(&dir)).await.unwrap();
        let project = store.add_project(sample_project()).await.unwrap();

        let updated = store
            .update_project(
                &project.id,
                ProjectUpdate {
                    command: Some("npm start".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.command, "npm start");
        assert_eq!(updated.name, "web");
        assert_eq!(updated.port, Some(3000));
        assert!(updated.updated_at >= updated.created_at);
    }

    #[tokio::test]
    async fn update_unknown_project_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(scratch_config_path(&dir)).await.unwrap();
        let result = store
            .update_project("nope", ProjectUpdate::default())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn delete_project_reports_whether_it_existed() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(scratch_config_path(&dir)).await.unwrap();
        let project = store.add_project(sample_project()).await.unwrap();

        assert!(store.delete_project(&project.id).await.unwrap());
        assert!(!store.delete_project(&project.id).await.unwrap());
    }

    #[tokio::test]
    async fn relative_project_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(scratch_config_path(&dir)).await.unwrap();
        let mut new = sample_project();
        new.path = "relative/dir".to_string();
        assert!(store.add_project(new).await.is_err());
    }

    #[tokio::test]
    async fn corrupt_config_file_is_an_error_not_a_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_config_path(&dir);
        tokio::fs::write(&path, b"{not json").await.unwrap();

        assert!(ConfigStore::load(path).await.is_err());
    }

    #[tokio::test]
    async fn quick_access_sites_crud() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(scratch_config_path(&dir)).await.unwrap();

        let site = store
            .add_quick_access_site(NewQuickAccessSite {
                name: "docs".to_string(),
                url: "https://example.com/docs".to_string(),
                description: None,
                icon: None,
            })
            .await
            .unwrap();

        let updated = store
            .update_quick_access_site(
                &site.id,
                QuickAccessSiteUpdate {
                    url: Some("https://example.com/v2".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.url, "https://example.com/v2");

        assert!(store.delete_quick_access_site(&site.id).await.unwrap());
        assert!(store.get_config().await.quick_access_sites.is_empty());
    }
}

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::models::{CoachSettings, SettingsUpdate};
use crate::utils::validation::validate_base_url;

pub struct SettingsManager {
    path: PathBuf,
    data: RwLock<CoachSettings>,
}

impl SettingsManager {
    pub async fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let initial = match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => {
                serde_json::from_slice::<CoachSettings>(&bytes).unwrap_or_else(|e| {
                    warn!("配置文件解析失败，使用默认配置: {}", e);
                    CoachSettings::default()
                })
            }
            _ => {
                let default = CoachSettings::default();
                let json = serde_json::to_string_pretty(&default)?;
                tokio::fs::write(&path, json)
                    .await
                    .with_context(|| format!("写入默认配置失败: {:?}", path))?;
                default
            }
        };

        Ok(Self {
            path,
            data: RwLock::new(initial),
        })
    }

    pub async fn get(&self) -> CoachSettings {
        self.data.read().await.clone()
    }

    pub async fn update(&self, update: SettingsUpdate) -> Result<CoachSettings> {
        let mut config = self.data.write().await;

        if let Some(service) = update.service {
            validate_base_url(&service.base_url).map_err(anyhow::Error::msg)?;
            config.service = service;
        }
        if let Some(analysis) = update.analysis {
            config.analysis = analysis;
        }
        if let Some(capture) = update.capture {
            config.capture = capture;
        }
        if let Some(session) = update.session {
            config.session = session;
        }
        if let Some(logger) = update.logger {
            config.logger = logger;
        }
        if let Some(placeholders) = update.extra_placeholders {
            config.extra_placeholders = placeholders;
        }

        self.save(&config).await?;
        info!("配置已更新并保存: {:?}", self.path);
        Ok(config.clone())
    }

    async fn save(&self, config: &CoachSettings) -> Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnalysisSettings;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_creates_default_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let manager = SettingsManager::new(path.clone()).await.unwrap();
        assert!(path.exists());
        assert_eq!(manager.get().await.analysis.feedback_throttle_ms, 1500);
    }

    #[tokio::test]
    async fn test_corrupt_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let manager = SettingsManager::new(path).await.unwrap();
        assert_eq!(manager.get().await.session.navigate_delay_ms, 3000);
    }

    #[tokio::test]
    async fn test_update_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let manager = SettingsManager::new(path.clone()).await.unwrap();

        manager
            .update(SettingsUpdate {
                analysis: Some(AnalysisSettings {
                    feedback_throttle_ms: 2500,
                    ..AnalysisSettings::default()
                }),
                extra_placeholders: Some(vec!["I'm not familiar with that exercise yet".into()]),
                ..SettingsUpdate::default()
            })
            .await
            .unwrap();

        let reloaded = SettingsManager::new(path).await.unwrap().get().await;
        assert_eq!(reloaded.analysis.feedback_throttle_ms, 2500);
        assert_eq!(reloaded.extra_placeholders.len(), 1);
    }

    #[tokio::test]
    async fn test_update_rejects_bad_base_url() {
        let dir = tempdir().unwrap();
        let manager = SettingsManager::new(dir.path().join("settings.json"))
            .await
            .unwrap();

        let mut service = manager.get().await.service;
        service.base_url = "localhost:8000".into();
        let result = manager
            .update(SettingsUpdate {
                service: Some(service),
                ..SettingsUpdate::default()
            })
            .await;
        assert!(result.is_err());
    }
}

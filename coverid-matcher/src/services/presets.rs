//! Preset store
//!
//! Holds the preset catalog in memory and persists every change to the
//! `settings` table. Sessions copy the preset they run with at submission,
//! so a change here only affects sessions submitted afterwards.

use chrono::Utc;
use coverid_common::events::{CoverEvent, EventBus};
use coverid_common::{Error, Result};
use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::db::settings::{get_setting, set_setting, PRESET_CATALOG_KEY};
use crate::models::preset::is_valid_preset_name;
use crate::models::{ConfigPreset, PresetCatalog};

pub struct PresetStore {
    db: SqlitePool,
    event_bus: EventBus,
    catalog: RwLock<PresetCatalog>,
}

impl PresetStore {
    /// Load the stored catalog, seeding the built-in presets on first start
    ///
    /// A stored catalog that fails to parse or validate is a configuration
    /// error; it is never silently replaced.
    pub async fn load(db: SqlitePool, event_bus: EventBus) -> Result<Self> {
        let catalog = match get_setting(&db, PRESET_CATALOG_KEY).await? {
            Some(json) => {
                let catalog: PresetCatalog = serde_json::from_str(&json)
                    .map_err(|e| Error::Config(format!("Stored preset catalog is invalid: {}", e)))?;
                catalog.validate()?;
                tracing::info!(
                    active = %catalog.performance_level,
                    presets = catalog.presets.len(),
                    "Loaded preset catalog"
                );
                catalog
            }
            None => {
                let catalog = PresetCatalog::default();
                persist(&db, &catalog).await?;
                tracing::info!(active = %catalog.performance_level, "Seeded built-in presets");
                catalog
            }
        };

        Ok(Self {
            db,
            event_bus,
            catalog: RwLock::new(catalog),
        })
    }

    pub async fn catalog(&self) -> PresetCatalog {
        self.catalog.read().await.clone()
    }

    /// Name and body of the active preset
    pub async fn active(&self) -> Result<(String, ConfigPreset)> {
        let catalog = self.catalog.read().await;
        let preset = catalog.active().cloned().ok_or_else(|| {
            Error::Internal(format!(
                "Active preset {} missing from catalog",
                catalog.performance_level
            ))
        })?;
        Ok((catalog.performance_level.clone(), preset))
    }

    pub async fn get(&self, name: &str) -> Result<ConfigPreset> {
        self.catalog
            .read()
            .await
            .presets
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Preset {}", name)))
    }

    /// Named preset, or the active one when `name` is `None`
    pub async fn resolve(&self, name: Option<&str>) -> Result<(String, ConfigPreset)> {
        match name {
            Some(name) => Ok((name.to_string(), self.get(name).await?)),
            None => self.active().await,
        }
    }

    /// Create or replace a preset body
    pub async fn put(&self, name: &str, preset: ConfigPreset) -> Result<()> {
        if !is_valid_preset_name(name) {
            return Err(Error::InvalidInput(format!(
                "Preset name {:?} must be 1-64 characters of a-z, 0-9, '_' or '-'",
                name
            )));
        }
        preset.validate()?;

        let mut catalog = self.catalog.write().await;
        let mut updated = catalog.clone();
        updated.presets.insert(name.to_string(), preset);
        persist(&self.db, &updated).await?;
        *catalog = updated;

        tracing::info!(preset = name, "Preset updated");
        self.event_bus.emit_lossy(CoverEvent::PresetChanged {
            active_preset: catalog.performance_level.clone(),
            updated_preset: Some(name.to_string()),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Switch the active preset (`performance_level`)
    pub async fn set_active(&self, name: &str) -> Result<()> {
        let mut catalog = self.catalog.write().await;
        if !catalog.presets.contains_key(name) {
            return Err(Error::NotFound(format!("Preset {}", name)));
        }
        if catalog.performance_level == name {
            return Ok(());
        }

        let mut updated = catalog.clone();
        updated.performance_level = name.to_string();
        persist(&self.db, &updated).await?;
        *catalog = updated;

        tracing::info!(active = name, "Active preset changed");
        self.event_bus.emit_lossy(CoverEvent::PresetChanged {
            active_preset: name.to_string(),
            updated_preset: None,
            timestamp: Utc::now(),
        });
        Ok(())
    }
}

async fn persist(db: &SqlitePool, catalog: &PresetCatalog) -> Result<()> {
    let json = serde_json::to_string(catalog)
        .map_err(|e| Error::Internal(format!("Failed to serialize presets: {}", e)))?;
    set_setting(db, PRESET_CATALOG_KEY, &json).await
}

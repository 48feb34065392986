use std::{
    default::Default,
    ops::{Deref, DerefMut},
    sync::{Arc, OnceLock},
};

use crate::punishment::PunishmentManager;
use dashmap::DashMap;
use poise::serenity_prelude as serenity;
use serde::{Deserialize, Serialize};
use serenity::prelude::TypeMapKey;

/// Guild configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildConfig {
    // The ID of the guild
    pub guild_id: u64,
    // Role applied to punished members; punishments cannot be issued
    // until this is configured.
    pub punish_role_id: Option<u64>,
    // Channel receiving moderation-log case messages
    pub modlog_channel_id: Option<u64>,
}

impl Default for GuildConfig {
    fn default() -> Self {
        Self {
            guild_id: 0,
            punish_role_id: None,
            modlog_channel_id: None,
        }
    }
}

/// Centralized data structure for the bot
#[derive(Clone)]
pub struct Data(pub Arc<DataInner>);

// Implement TypeMapKey for Data to allow storing it in Serenity's data map
impl TypeMapKey for Data {
    type Value = Data;
}

impl Default for Data {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data")
            .field("guild_configs", &self.guild_configs)
            .field("manager_set", &self.0.manager.get().is_some())
            .finish()
    }
}

impl Data {
    /// Create a new Data instance
    #[must_use]
    pub fn new() -> Self {
        Self(DataInner::new().into())
    }

    /// Load data from YAML file
    pub async fn load() -> Self {
        Self(Arc::new(DataInner::load().await))
    }

    /// Get the guild configuration for a specific guild
    #[must_use]
    pub fn get_guild_config(&self, guild_id: u64) -> Option<GuildConfig> {
        self.0
            .guild_configs
            .get(&guild_id)
            .map(|entry| entry.value().clone())
    }

    /// Shared handle to the config map, for the platform layer
    #[must_use]
    pub fn guild_configs_handle(&self) -> Arc<DashMap<u64, GuildConfig>> {
        Arc::clone(&self.0.guild_configs)
    }

    /// Install the punishment manager once the platform is available.
    /// A second call is ignored.
    pub fn set_manager(&self, manager: Arc<PunishmentManager>) {
        let _ = self.0.manager.set(manager);
    }

    /// The punishment manager, None until [`Self::set_manager`] ran
    #[must_use]
    pub fn manager(&self) -> Option<&Arc<PunishmentManager>> {
        self.0.manager.get()
    }

    /// Save data to YAML file
    /// # Errors
    /// This function will return an error if:
    /// - The data directory cannot be created
    /// - The guild configurations cannot be serialized to YAML
    /// - The YAML data cannot be written to the config file
    pub async fn save(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.0.save().await
    }
}

impl Deref for Data {
    type Target = DataInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Data {
    fn deref_mut(&mut self) -> &mut Self::Target {
        Arc::make_mut(&mut self.0)
    }
}

/// Main centralized data structure for the bot
#[derive(Clone)]
pub struct DataInner {
    // Map of guild_id -> guild configuration
    pub guild_configs: Arc<DashMap<u64, GuildConfig>>,
    // Set after the client exists; commands treat None as "still starting"
    manager: OnceLock<Arc<PunishmentManager>>,
}

impl Default for DataInner {
    fn default() -> Self {
        Self::new()
    }
}

impl DataInner {
    // Create a new Data instance
    #[must_use]
    pub fn new() -> Self {
        Self {
            guild_configs: Arc::new(DashMap::new()),
            manager: OnceLock::new(),
        }
    }

    /// Load guild configurations from a YAML file.
    /// If the file doesn't exist, it returns a new empty Data instance.
    pub async fn load() -> Self {
        const CONFIG_FILE: &str = "data/guild_configs.yaml";

        let data = Self::new();

        if let Ok(file_content) = tokio::fs::read_to_string(CONFIG_FILE).await {
            if let Ok(configs) = serde_yaml::from_str::<Vec<GuildConfig>>(&file_content) {
                for config in configs {
                    data.guild_configs.insert(config.guild_id, config);
                }
            }
        }

        data
    }

    /// Save all guild configurations to a YAML file, creating the data
    /// directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// This function will return an error if:
    /// - The data directory cannot be created
    /// - The guild configurations cannot be serialized to YAML
    /// - The YAML data cannot be written to the config file
    pub async fn save(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        const DATA_DIR: &str = "data";
        const CONFIG_FILE: &str = "data/guild_configs.yaml";

        if !std::path::Path::new(DATA_DIR).exists() {
            tokio::fs::create_dir_all(DATA_DIR).await?;
        }

        let configs: Vec<GuildConfig> = self
            .guild_configs
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let yaml = serde_yaml::to_string(&configs)?;
        tokio::fs::write(CONFIG_FILE, yaml).await?;

        Ok(())
    }
}

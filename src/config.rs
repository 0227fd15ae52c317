use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub import: ImportConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImportConfig {
    /// How many times a block's transaction is attempted before the import
    /// loop gives up and propagates the failure.
    #[serde(default = "default_max_commit_attempts")]
    pub max_commit_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            max_commit_attempts: default_max_commit_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_max_commit_attempts() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    500
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("Failed to read config file '{}': {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("Failed to parse config file '{}': {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> eyre::Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre::eyre!("database.url must not be empty"));
        }
        if self.import.max_commit_attempts == 0 {
            return Err(eyre::eyre!("import.max_commit_attempts must be at least 1"));
        }
        Ok(())
    }
}

//! Server configuration module
//!
//! Parses and manages server configuration from YAML files.
//!
//! The game loop holds the parsed config as an immutable `Arc<ServerConfig>`
//! snapshot. A rehash parses a fresh file and swaps the snapshot; nothing
//! mutates a config in place.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Work factors bcrypt accepts
pub const BCRYPT_COST_MIN: u32 = 4;
pub const BCRYPT_COST_MAX: u32 = 31;

/// Hard cap on distinct item stacks per trade offer.
pub const TRADE_STACKS_MAX: usize = 64;

/// A position in the world (map, x, y)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub m: u16,
    pub x: u16,
    pub y: u16,
}

impl Point {
    /// Create a new point
    pub fn new(m: u16, x: u16, y: u16) -> Self {
        Self { m, x, y }
    }
}

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    // ============================================
    // Listener
    // ============================================
    pub bind_ip: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Seconds of silence before a connection is dropped
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    // ============================================
    // Game loop
    // ============================================
    /// Milliseconds between scheduler ticks
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// How long a disconnected character stays in the world
    #[serde(default = "default_logout_linger_ms")]
    pub logout_linger_ms: u64,

    /// Seconds between saves of changed characters
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,

    /// Account/character store. In-memory only when unset.
    #[serde(default)]
    pub store_path: Option<String>,

    // ============================================
    // Accounts
    // ============================================
    /// Allow new accounts to be created
    #[serde(default = "default_registration")]
    pub registration: bool,

    #[serde(default)]
    pub account: AccountLimits,

    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,

    /// Budget for a background password hash/verify
    #[serde(default = "default_login_deadline_ms")]
    pub login_deadline_ms: u64,

    /// Starting position for new characters
    #[serde(default)]
    pub start_point: Point,

    // ============================================
    // Flood control
    // ============================================
    /// Per-route minimum interval overrides, keyed "family.action"
    /// (lower case, e.g. "trade.request") in milliseconds
    #[serde(default)]
    pub flood: BTreeMap<String, u64>,

    // ============================================
    // Subsystems
    // ============================================
    #[serde(default)]
    pub trade: TradeConfig,

    #[serde(default)]
    pub exp: ExpConfig,

    #[serde(default)]
    pub checkin: CheckinConfig,
}

/// Length limits and per-account caps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountLimits {
    #[serde(default = "default_min_username")]
    pub min_username: usize,
    #[serde(default = "default_max_username")]
    pub max_username: usize,
    #[serde(default = "default_min_password")]
    pub min_password: usize,
    #[serde(default = "default_max_password")]
    pub max_password: usize,
    #[serde(default = "default_min_name")]
    pub min_character_name: usize,
    #[serde(default = "default_max_name")]
    pub max_character_name: usize,
    #[serde(default = "default_max_characters")]
    pub max_characters: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeConfig {
    /// Distinct item stacks allowed in one offer
    #[serde(default = "default_max_stacks")]
    pub max_stacks: usize,

    /// Block staff in the protected tier range from trading
    #[serde(default = "default_admin_protection")]
    pub admin_protection: bool,

    #[serde(default = "default_protected_min_tier")]
    pub protected_min_tier: u8,

    #[serde(default = "default_protected_max_tier")]
    pub protected_max_tier: u8,

    /// Write every completed trade to the `trade` log target
    #[serde(default)]
    pub log_trades: bool,

    /// Item ids bound to their owner; never offered in a trade
    #[serde(default)]
    pub lore_items: Vec<u16>,
}

impl TradeConfig {
    /// Whether a character of this admin tier is barred from trading.
    pub fn protects(&self, tier: u8) -> bool {
        self.admin_protection && (self.protected_min_tier..=self.protected_max_tier).contains(&tier)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpConfig {
    #[serde(default = "default_max_exp")]
    pub max_exp: u64,

    /// Multiplier per subscription tier, indexed by tier. Missing tiers use 1.0.
    #[serde(default)]
    pub tier_multipliers: Vec<f64>,
}

impl ExpConfig {
    pub fn tier_multiplier(&self, tier: u8) -> f64 {
        self.tier_multipliers
            .get(tier as usize)
            .copied()
            .unwrap_or(1.0)
    }
}

/// Periodic server-list check-in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckinConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_checkin_url")]
    pub url: String,

    /// Public host name advertised to the list. Falls back to bind_ip.
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_server_name")]
    pub server_name: String,

    #[serde(default)]
    pub site: String,

    #[serde(default)]
    pub zone: String,

    #[serde(default = "default_checkin_period")]
    pub period_secs: u64,

    #[serde(default = "default_checkin_deadline")]
    pub deadline_secs: u64,
}

// ============================================
// Default value functions
// These are called by serde when a field is missing
// ============================================

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8078
}

fn default_max_connections() -> usize {
    300
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_tick_ms() -> u64 {
    10
}

fn default_logout_linger_ms() -> u64 {
    5_000
}

fn default_save_interval_secs() -> u64 {
    60
}

fn default_registration() -> bool {
    true
}

fn default_bcrypt_cost() -> u32 {
    bcrypt::DEFAULT_COST
}

fn default_login_deadline_ms() -> u64 {
    5_000
}

fn default_min_username() -> usize {
    4
}

fn default_max_username() -> usize {
    16
}

fn default_min_password() -> usize {
    6
}

fn default_max_password() -> usize {
    12
}

fn default_min_name() -> usize {
    4
}

fn default_max_name() -> usize {
    12
}

fn default_max_characters() -> usize {
    3
}

fn default_max_stacks() -> usize {
    10
}

fn default_admin_protection() -> bool {
    true
}

fn default_protected_min_tier() -> u8 {
    1
}

fn default_protected_max_tier() -> u8 {
    3
}

fn default_max_exp() -> u64 {
    2_000_000_000
}

fn default_checkin_url() -> String {
    "http://eoserv.net/SLN/check.php".to_string()
}

fn default_server_name() -> String {
    "Untitled Server".to_string()
}

fn default_checkin_period() -> u64 {
    600
}

fn default_checkin_deadline() -> u64 {
    30
}

impl Default for AccountLimits {
    fn default() -> Self {
        Self {
            min_username: default_min_username(),
            max_username: default_max_username(),
            min_password: default_min_password(),
            max_password: default_max_password(),
            min_character_name: default_min_name(),
            max_character_name: default_max_name(),
            max_characters: default_max_characters(),
        }
    }
}

impl Default for TradeConfig {
    fn default() -> Self {
        Self {
            max_stacks: default_max_stacks(),
            admin_protection: default_admin_protection(),
            protected_min_tier: default_protected_min_tier(),
            protected_max_tier: default_protected_max_tier(),
            log_trades: false,
            lore_items: Vec::new(),
        }
    }
}

impl Default for ExpConfig {
    fn default() -> Self {
        Self {
            max_exp: default_max_exp(),
            tier_multipliers: Vec::new(),
        }
    }
}

impl Default for CheckinConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_checkin_url(),
            host: String::new(),
            server_name: default_server_name(),
            site: String::new(),
            zone: String::new(),
            period_secs: default_checkin_period(),
            deadline_secs: default_checkin_deadline(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            port: default_port(),
            max_connections: default_max_connections(),
            idle_timeout_secs: default_idle_timeout_secs(),
            tick_ms: default_tick_ms(),
            logout_linger_ms: default_logout_linger_ms(),
            save_interval_secs: default_save_interval_secs(),
            store_path: None,
            registration: default_registration(),
            account: AccountLimits::default(),
            bcrypt_cost: default_bcrypt_cost(),
            login_deadline_ms: default_login_deadline_ms(),
            start_point: Point::default(),
            flood: BTreeMap::new(),
            trade: TradeConfig::default(),
            exp: ExpConfig::default(),
            checkin: CheckinConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file
    ///
    /// # Example
    /// ```no_run
    /// use ember::config::ServerConfig;
    ///
    /// let config = ServerConfig::from_file("conf/world.yaml")
    ///     .expect("Failed to load config");
    /// println!("port: {}", config.port);
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ServerConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML in {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from a YAML string
    ///
    /// Useful for testing
    pub fn from_str(contents: &str) -> Result<Self> {
        let config: ServerConfig = serde_yaml::from_str(contents)
            .context("Failed to parse YAML")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.bind_ip.is_empty(), "bind_ip cannot be empty");
        anyhow::ensure!(self.tick_ms > 0, "tick_ms must be positive");
        anyhow::ensure!(self.max_connections > 0, "max_connections must be positive");

        anyhow::ensure!(
            (BCRYPT_COST_MIN..=BCRYPT_COST_MAX).contains(&self.bcrypt_cost),
            "bcrypt_cost {} out of range ({}..={})",
            self.bcrypt_cost,
            BCRYPT_COST_MIN,
            BCRYPT_COST_MAX
        );

        let a = &self.account;
        anyhow::ensure!(
            a.min_username <= a.max_username,
            "account username limits inverted: {} > {}",
            a.min_username,
            a.max_username
        );
        anyhow::ensure!(
            a.min_password <= a.max_password,
            "account password limits inverted: {} > {}",
            a.min_password,
            a.max_password
        );
        anyhow::ensure!(
            a.min_character_name <= a.max_character_name,
            "character name limits inverted: {} > {}",
            a.min_character_name,
            a.max_character_name
        );

        anyhow::ensure!(
            self.trade.max_stacks > 0 && self.trade.max_stacks <= TRADE_STACKS_MAX,
            "trade.max_stacks must be 1..={} (got {})",
            TRADE_STACKS_MAX,
            self.trade.max_stacks
        );

        anyhow::ensure!(
            self.exp.tier_multipliers.iter().all(|m| m.is_finite() && *m >= 0.0),
            "exp.tier_multipliers must be finite and non-negative"
        );

        for key in self.flood.keys() {
            anyhow::ensure!(
                key.split_once('.').is_some_and(|(f, a)| !f.is_empty() && !a.is_empty()),
                "flood key {:?} must look like \"family.action\"",
                key
            );
        }

        if self.checkin.enabled {
            anyhow::ensure!(!self.checkin.url.is_empty(), "checkin.url cannot be empty");
            anyhow::ensure!(self.checkin.deadline_secs > 0, "checkin.deadline_secs must be positive");
        }

        Ok(())
    }

    /// Save configuration to a YAML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(&self)
            .context("Failed to serialize config to YAML")?;

        fs::write(path.as_ref(), yaml)
            .with_context(|| format!("Failed to write config to {}", path.as_ref().display()))?;

        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn logout_linger(&self) -> Duration {
        Duration::from_millis(self.logout_linger_ms)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }

    pub fn login_deadline(&self) -> Duration {
        Duration::from_millis(self.login_deadline_ms)
    }

    /// Flood interval override for a route, if configured.
    pub fn flood_override(&self, family: &str, action: &str) -> Option<Duration> {
        let key = format!("{}.{}", family.to_ascii_lowercase(), action.to_ascii_lowercase());
        self.flood.get(&key).copied().map(Duration::from_millis)
    }
}

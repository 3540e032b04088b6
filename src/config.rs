//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use std::time::Duration;

use serde::Deserialize;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub federation: FederationConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    /// Followed ActivityPub feeds used to seed the in-memory repository
    #[serde(default)]
    pub feeds: Vec<FeedSeed>,
    /// Known remote followers of local users, used for the reblog fan-out
    #[serde(default)]
    pub followers: Vec<FollowerSeed>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "blog.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://blog.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Outbound federation settings
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// User agent sent with every transport request
    pub user_agent: String,
    /// Deadline for a single transport call, in seconds
    pub request_timeout_secs: u64,
    /// Number of workers draining the delivery queue
    pub delivery_workers: usize,
    /// Parallel deliveries during an announce fan-out
    pub max_concurrent_deliveries: usize,
    /// Local user that acts when no other user is given
    pub main_user: String,
}

impl FederationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// How long a resolved actor stays memoised (default: 600)
    pub actor_ttl_secs: u64,
    /// Maximum memoised actors (default: 1000)
    pub actor_max_entries: u64,
    /// Memoise the mention lookup table between calls (default: true)
    pub cache_mentions: bool,
    /// How long processed inbound activity ids are remembered (default: 86400)
    pub seen_activity_ttl_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

/// A followed feed declared in configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FeedSeed {
    /// Actor URL of the followed feed
    pub url: String,
    /// Login of the local friend user the feed belongs to
    pub friend_login: String,
    /// Keep replies mentioning people we do not follow
    #[serde(default)]
    pub show_replies: bool,
}

/// A remote follower declared in configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FollowerSeed {
    /// Local user being followed
    pub local_user: String,
    /// Actor URL of the follower
    pub actor: String,
    /// Personal inbox of the follower
    pub inbox: String,
    /// Shared inbox of the follower's server, if it has one
    #[serde(default)]
    pub shared_inbox: Option<String>,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FRIENDS_FEDERATION__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.domain", "localhost")?
            .set_default("server.protocol", "http")?
            .set_default("federation.user_agent", "FriendsFederation/0.1.0")?
            .set_default("federation.request_timeout_secs", 10)?
            .set_default("federation.delivery_workers", 2)?
            .set_default("federation.max_concurrent_deliveries", 10)?
            .set_default("federation.main_user", "admin")?
            .set_default("cache.actor_ttl_secs", 600)?
            .set_default("cache.actor_max_entries", 1000)?
            .set_default("cache.cache_mentions", true)?
            .set_default("cache.seen_activity_ttl_secs", 86400)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (FRIENDS_FEDERATION__*)
            .add_source(
                Environment::with_prefix("FRIENDS_FEDERATION")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        if !self.server.protocol.eq_ignore_ascii_case("http")
            && !self.server.protocol.eq_ignore_ascii_case("https")
        {
            return Err(crate::error::AppError::Config(format!(
                "server.protocol must be http or https, got {}",
                self.server.protocol
            )));
        }

        if self.federation.request_timeout_secs == 0 {
            return Err(crate::error::AppError::Config(
                "federation.request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.federation.delivery_workers == 0 {
            return Err(crate::error::AppError::Config(
                "federation.delivery_workers must be greater than 0".to_string(),
            ));
        }

        if self.federation.max_concurrent_deliveries == 0 {
            return Err(crate::error::AppError::Config(
                "federation.max_concurrent_deliveries must be greater than 0".to_string(),
            ));
        }

        if self.federation.main_user.trim().is_empty() {
            return Err(crate::error::AppError::Config(
                "federation.main_user must not be empty".to_string(),
            ));
        }

        for feed in &self.feeds {
            if url::Url::parse(&feed.url).is_err() {
                return Err(crate::error::AppError::Config(format!(
                    "feeds.url is not a valid URL: {}",
                    feed.url
                )));
            }
        }

        for follower in &self.followers {
            let urls = [Some(&follower.actor), Some(&follower.inbox), follower.shared_inbox.as_ref()];
            if let Some(invalid) = urls
                .into_iter()
                .flatten()
                .find(|candidate| url::Url::parse(candidate).is_err())
            {
                return Err(crate::error::AppError::Config(format!(
                    "followers entry for {} has an invalid URL: {}",
                    follower.local_user, invalid
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            domain: "blog.example.net".to_string(),
            protocol: "https".to_string(),
        },
        federation: FederationConfig {
            user_agent: "FriendsFederation/test".to_string(),
            request_timeout_secs: 5,
            delivery_workers: 1,
            max_concurrent_deliveries: 4,
            main_user: "admin".to_string(),
        },
        cache: CacheConfig {
            actor_ttl_secs: 60,
            actor_max_entries: 100,
            cache_mentions: true,
            seen_activity_ttl_secs: 60,
        },
        logging: LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
        feeds: Vec::new(),
        followers: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_defaults() {
        let config = test_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.base_url(), "https://blog.example.net");
        assert_eq!(config.federation.request_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut config = test_config();
        config.federation.request_timeout_secs = 0;

        let error = config
            .validate()
            .expect_err("a zero deadline would leave transport calls unbounded");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("request_timeout_secs")
        ));
    }

    #[test]
    fn validate_rejects_unknown_protocol() {
        let mut config = test_config();
        config.server.protocol = "gopher".to_string();

        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_seed_feed_with_invalid_url() {
        let mut config = test_config();
        config.feeds.push(FeedSeed {
            url: "not a url".to_string(),
            friend_login: "alice".to_string(),
            show_replies: false,
        });

        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_follower_with_invalid_inbox() {
        let mut config = test_config();
        config.followers.push(FollowerSeed {
            local_user: "admin".to_string(),
            actor: "https://social.example/users/bob".to_string(),
            inbox: "inbox".to_string(),
            shared_inbox: None,
        });

        assert!(config.validate().is_err());
    }
}

use std::{fs, path::Path, path::PathBuf, sync::Arc, time::Duration};

use serde::Deserialize;

use crate::{
    router::{AddressMatcher, MessageRouter, Route},
    AddressError, BlobStore, FileBlobStore, LogPublisher, Mailer, MailerResult, PrivateAccount,
    PublishResult, Publisher, SmtpMailer, UrlSigner,
};

/// Top-level configuration for the relay, as read from TOML.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Proxy domain the relay receives mail for.
    #[serde(default)]
    pub domain: String,

    #[serde(default)]
    pub private_address: String,

    /// Address the private account writes to for outbound delivery.
    #[serde(default)]
    pub outbound_address: String,

    /// Local part of the operator notification sender.
    #[serde(default = "default_error_sender")]
    pub error_sender: String,

    #[serde(default = "default_mailer_daemon")]
    pub mailer_daemon: String,

    /// Suffix the mail platform appends to the ids of sent messages,
    /// defaults to `@{domain}`.
    #[serde(default)]
    pub reply_id_suffix: Option<String>,

    #[serde(default = "default_presign_ttl_secs")]
    pub presign_ttl_secs: u64,

    #[serde(default)]
    pub bucket: BucketConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub mailer: MailerConfig,

    #[serde(default)]
    pub publisher: PublisherConfig,

    #[serde(default, rename = "route")]
    pub routes: Vec<RouteConfig>,
}

/// Key prefixes of the blob store layout.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BucketConfig {
    #[serde(default)]
    pub msg_prefix: String,

    #[serde(default)]
    pub forward_meta_prefix: String,

    #[serde(default)]
    pub outbox_prefix: String,

    #[serde(default = "default_sent_prefix")]
    pub sent_prefix: String,
}

/// Blob store backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// Filesystem-backed store.
    #[serde(rename = "file")]
    File {
        #[serde(default = "default_storage_path")]
        path: String,
        /// Public location the store is served from, used in notifications.
        public_url: Option<String>,
        /// Secret the presigned URLs are signed with, required along
        /// with `public_url`.
        signing_key: Option<String>,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::File {
            path: default_storage_path(),
            public_url: None,
            signing_key: None,
        }
    }
}

/// Outgoing mail transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum MailerConfig {
    #[serde(rename = "smtp")]
    Smtp {
        #[serde(default = "default_smtp_host")]
        host: String,
        #[serde(default = "default_smtp_port")]
        port: u16,
        username: Option<String>,
        password: Option<String>,
        #[serde(default)]
        tls: bool,
    },
}

impl Default for MailerConfig {
    fn default() -> Self {
        MailerConfig::Smtp {
            host: default_smtp_host(),
            port: default_smtp_port(),
            username: None,
            password: None,
            tls: false,
        }
    }
}

/// Notification backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type")]
pub enum PublisherConfig {
    /// Writes notifications to the log.
    #[default]
    #[serde(rename = "log")]
    Log,

    /// Publishes notifications on a Redis channel named after the topic.
    #[serde(rename = "redis")]
    Redis {
        #[serde(default = "default_redis_url")]
        url: String,
    },
}

/// A single route as written in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub src: String,
    pub dst: String,

    #[serde(default, alias = "sns")]
    pub notify: Option<String>,

    #[serde(default)]
    pub forward: bool,

    #[serde(default)]
    pub drop: bool,

    #[serde(default)]
    pub allow_suspect_messages: bool,
}

impl StorageConfig {
    /// Creates the configured blob store.
    pub fn build(&self) -> Arc<dyn BlobStore> {
        match self {
            StorageConfig::File {
                path,
                public_url,
                signing_key,
            } => {
                let mut store = FileBlobStore::new(PathBuf::from(path));
                if let Some(public_url) = public_url {
                    store = store.with_public_url(public_url.clone());
                }
                if let Some(signing_key) = signing_key {
                    store = store.with_signer(UrlSigner::new(signing_key.as_bytes()));
                }
                Arc::new(store)
            }
        }
    }
}

impl MailerConfig {
    /// Creates the configured mailer, `domain` being used for the
    /// generated message ids.
    pub fn build(&self, domain: &str) -> MailerResult<Arc<dyn Mailer>> {
        match self {
            MailerConfig::Smtp {
                host,
                port,
                username,
                password,
                tls,
            } => {
                let credentials = username
                    .clone()
                    .map(|username| (username, password.clone().unwrap_or_default()));
                Ok(Arc::new(SmtpMailer::new(
                    host,
                    *port,
                    credentials,
                    *tls,
                    domain,
                )?))
            }
        }
    }
}

impl PublisherConfig {
    /// Creates the configured publisher.
    pub fn build(&self) -> PublishResult<Arc<dyn Publisher>> {
        match self {
            PublisherConfig::Log => Ok(Arc::new(LogPublisher)),
            #[cfg(feature = "redis")]
            PublisherConfig::Redis { url } => Ok(Arc::new(crate::RedisPublisher::new(url)?)),
            #[cfg(not(feature = "redis"))]
            PublisherConfig::Redis { .. } => Err(crate::PublishError::Connection(
                "redis publisher requires the `redis` feature".to_string(),
            )),
        }
    }
}

/// Validated, immutable settings the relay runs with.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub domain: String,
    pub private_account: PrivateAccount,
    pub outbound_address: String,
    pub error_sender: String,
    pub mailer_daemon: String,
    pub reply_id_suffix: String,
    pub presign_ttl: Duration,
    pub bucket: BucketConfig,
    pub router: MessageRouter,
}

impl RelayConfig {
    /// Address operator notifications are sent from.
    pub fn error_address(&self) -> String {
        format!("{}@{}", self.error_sender, self.domain)
    }
}

impl Config {
    /// Checks required fields and compiles the routes.
    pub fn validate(&self) -> Result<RelayConfig, ConfigError> {
        let required = [
            ("domain", &self.domain),
            ("private_address", &self.private_address),
            ("outbound_address", &self.outbound_address),
            ("bucket.msg_prefix", &self.bucket.msg_prefix),
            ("bucket.forward_meta_prefix", &self.bucket.forward_meta_prefix),
            ("bucket.outbox_prefix", &self.bucket.outbox_prefix),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(name));
            }
        }

        let StorageConfig::File {
            public_url,
            signing_key,
            ..
        } = &self.storage;
        let unsigned = signing_key.as_deref().is_none_or(|key| key.is_empty());
        if public_url.is_some() && unsigned {
            return Err(ConfigError::Missing("storage.signing_key"));
        }

        let private_account =
            PrivateAccount::parse(&self.private_address).map_err(ConfigError::Address)?;

        let mut routes = Vec::with_capacity(self.routes.len());
        for (index, route) in self.routes.iter().enumerate() {
            let compile = |value: &str| {
                AddressMatcher::parse(value, &self.private_address).map_err(|e| {
                    ConfigError::Pattern {
                        route: index,
                        value: value.to_string(),
                        error: e.to_string(),
                    }
                })
            };
            routes.push(Route {
                src: compile(route.src.as_str())?,
                dst: compile(route.dst.as_str())?,
                notify: route.notify.clone().filter(|topic| !topic.is_empty()),
                forward: route.forward,
                drop: route.drop,
                allow_suspect: route.allow_suspect_messages,
            });
        }

        Ok(RelayConfig {
            domain: self.domain.clone(),
            private_account,
            outbound_address: self.outbound_address.clone(),
            error_sender: self.error_sender.clone(),
            mailer_daemon: self.mailer_daemon.to_lowercase(),
            reply_id_suffix: self
                .reply_id_suffix
                .clone()
                .unwrap_or_else(|| format!("@{}", self.domain)),
            presign_ttl: Duration::from_secs(self.presign_ttl_secs),
            bucket: self.bucket.clone(),
            router: MessageRouter::new(routes),
        })
    }
}

/// Loads configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    toml::from_str(&content).map_err(ConfigError::Parse)
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// An I/O error occurred reading the file.
    Io(std::io::Error),
    /// A parse error occurred deserializing TOML.
    Parse(toml::de::Error),
    /// A required field is missing or empty.
    Missing(&'static str),
    /// The private address cannot be split.
    Address(AddressError),
    /// A route pattern does not compile.
    Pattern {
        route: usize,
        value: String,
        error: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Config I/O error: {e}"),
            ConfigError::Parse(e) => write!(f, "Config parse error: {e}"),
            ConfigError::Missing(name) => write!(f, "Config field missing: {name}"),
            ConfigError::Address(e) => write!(f, "Config private address invalid: {e}"),
            ConfigError::Pattern {
                route,
                value,
                error,
            } => write!(f, "Config route {route} has invalid pattern {value}: {error}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn default_error_sender() -> String {
    "error".to_string()
}

fn default_mailer_daemon() -> String {
    "mailer-daemon@amazonses.com".to_string()
}

fn default_presign_ttl_secs() -> u64 {
    300
}

fn default_sent_prefix() -> String {
    "sent".to_string()
}

fn default_storage_path() -> String {
    "mailstore".to_string()
}

fn default_smtp_host() -> String {
    "127.0.0.1".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::VerdictSet;

    const MINIMAL: &str = r#"
domain = "proxy.example.com"
private_address = "me@private.example.com"
outbound_address = "outbound@proxy.example.com"

[bucket]
msg_prefix = "email"
forward_meta_prefix = "forward"
outbox_prefix = "outbox"
"#;

    #[test]
    fn test_parse_minimal_config() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        let relay = config.validate().unwrap();
        assert_eq!(relay.domain, "proxy.example.com");
        assert_eq!(relay.private_account.mailbox(), "me");
        assert_eq!(relay.private_account.domain(), "private.example.com");
        assert!(relay.router.routes().is_empty());
    }

    #[test]
    fn test_parse_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        let relay = config.validate().unwrap();
        assert_eq!(relay.error_address(), "error@proxy.example.com");
        assert_eq!(relay.mailer_daemon, "mailer-daemon@amazonses.com");
        assert_eq!(relay.reply_id_suffix, "@proxy.example.com");
        assert_eq!(relay.presign_ttl, Duration::from_secs(300));
        assert_eq!(relay.bucket.sent_prefix, "sent");
        assert!(matches!(config.publisher, PublisherConfig::Log));
        match config.storage {
            StorageConfig::File {
                path,
                public_url,
                signing_key,
            } => {
                assert_eq!(path, "mailstore");
                assert!(public_url.is_none());
                assert!(signing_key.is_none());
            }
        }
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
domain = "proxy.example.com"
private_address = "me@private.example.com"
outbound_address = "outbound@proxy.example.com"
error_sender = "postmaster"
mailer_daemon = "MAILER-DAEMON@example.net"
reply_id_suffix = "@email.amazonses.com"
presign_ttl_secs = 60

[bucket]
msg_prefix = "email"
forward_meta_prefix = "forward"
outbox_prefix = "outbox"
sent_prefix = "archive"

[storage]
type = "file"
path = "/var/lib/mailrelay"
public_url = "https://mail.example.com/store"
signing_key = "change-me"

[mailer]
type = "smtp"
host = "smtp.example.com"
port = 587
username = "relay"
password = "secret"
tls = true

[publisher]
type = "redis"
url = "redis://redis:6379"

[[route]]
src = "/.*@example\\.com/"
dst = "sales@proxy.example.com"
sns = "sales"
forward = true

[[route]]
src = "__PRIVATE_ADDRESS__"
dst = "/.*/"
notify = "outgoing"
allow_suspect_messages = true

[[route]]
src = "spam@bad.com"
dst = "/.*/"
drop = true
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let relay = config.validate().unwrap();

        assert_eq!(relay.error_address(), "postmaster@proxy.example.com");
        assert_eq!(relay.mailer_daemon, "mailer-daemon@example.net");
        assert_eq!(relay.reply_id_suffix, "@email.amazonses.com");
        assert_eq!(relay.presign_ttl, Duration::from_secs(60));
        assert_eq!(relay.bucket.sent_prefix, "archive");

        match &config.mailer {
            MailerConfig::Smtp {
                host,
                port,
                username,
                tls,
                ..
            } => {
                assert_eq!(host, "smtp.example.com");
                assert_eq!(*port, 587);
                assert_eq!(username.as_deref(), Some("relay"));
                assert!(*tls);
            }
        }

        match &config.publisher {
            PublisherConfig::Redis { url } => assert_eq!(url, "redis://redis:6379"),
            _ => panic!("Expected Redis publisher"),
        }

        let routes = relay.router.routes();
        assert_eq!(routes.len(), 3);
        assert_eq!(routes[0].notify.as_deref(), Some("sales"));
        assert!(routes[0].forward);
        assert!(routes[1].src.is_match("me@private.example.com"));
        assert!(routes[1].allow_suspect);
        assert!(!routes[1].forward);
        assert!(routes[2].drop);
        assert!(routes[2].notify.is_none());

        assert_eq!(
            relay.router.evaluate(
                &["spam@proxy.example.com".to_string()],
                "spam@bad.com",
                &VerdictSet::default()
            ),
            crate::router::RouteOutcome::Drop
        );
    }

    #[test]
    fn test_sample_config() {
        let config: Config = toml::from_str(include_str!("../../../config/mailrelay.toml")).unwrap();
        let relay = config.validate().unwrap();
        assert_eq!(relay.router.routes().len(), 2);
        assert_eq!(
            relay.router.evaluate(
                &["x@proxy.example.com".to_string()],
                "bulk@spam.example.net",
                &VerdictSet::default()
            ),
            crate::router::RouteOutcome::Drop
        );
    }

    #[test]
    fn test_build_collaborators() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.storage.build().name(), "file");
        assert_eq!(config.publisher.build().unwrap().name(), "log");
    }

    #[test]
    fn test_missing_required_field() {
        let config: Config = toml::from_str(
            r#"
domain = "proxy.example.com"
private_address = "me@private.example.com"
"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("outbound_address"))
        ));
    }

    #[test]
    fn test_public_url_requires_signing_key() {
        let toml = format!(
            "{MINIMAL}\n[storage]\ntype = \"file\"\npublic_url = \"https://mail.example.com/store\"\n"
        );
        let config: Config = toml::from_str(&toml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("storage.signing_key"))
        ));

        let signed = format!("{toml}signing_key = \"secret\"\n");
        let config: Config = toml::from_str(&signed).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_private_address_without_at() {
        let toml = MINIMAL.replace("me@private.example.com", "me");
        let config: Config = toml::from_str(&toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Address(_))));
    }

    #[test]
    fn test_invalid_pattern_fails_at_load() {
        let toml = format!("{MINIMAL}\n[[route]]\nsrc = \"/(/\"\ndst = \"a@b.com\"\n");
        let config: Config = toml::from_str(&toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Pattern { route: 0, .. }));
        assert!(err.to_string().contains("/(/"));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.domain, "proxy.example.com");
        assert!(matches!(
            load_config(Path::new("/nonexistent/mailrelay.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}

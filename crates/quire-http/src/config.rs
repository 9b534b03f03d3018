use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf, time::Duration};

use quire_resolve::Roots;
use serde::Deserialize;

use crate::AuthScheme;

/// Settings for a `Server`.
///
/// Loaded once at startup; the engine never reads configuration files itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name the server answers to, also used for `SERVER_NAME`.
    pub server_name: String,
    pub server_admin: String,
    /// Value of the `Server` response header.
    pub server_header: String,
    /// Additional host names accepted in `Host`, `*` accepts any.
    pub aliases: Vec<String>,
    /// Names and addresses of local interfaces accepted in `Host`.
    pub interfaces: Vec<String>,
    pub listeners: Vec<ListenerConfig>,

    pub max_clients: usize,
    pub max_clients_per_host: usize,
    /// Largest request body accepted, 0 for no limit.
    pub max_request_size: u64,
    pub hostname_lookups: HostnameLookups,
    pub default_encryption: EncryptionPolicy,

    pub keep_alive: bool,
    /// Seconds a connection may sit between requests.
    pub keep_alive_timeout: u64,
    /// Seconds a connection may go without progress while handling a request.
    pub timeout: u64,

    pub web_interface: bool,
    pub default_locale: Option<String>,
    pub default_auth_scheme: AuthScheme,
    /// Groups whose members may authenticate with local credentials.
    pub system_groups: Vec<String>,

    /// Directory holding the gateway helper programs.
    pub cgi_bin: PathBuf,
    /// Directory for request body temporary files.
    pub request_root: PathBuf,
    /// Variables every helper starts with.
    pub helper_env: BTreeMap<String, String>,

    pub roots: Roots,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let mut helper_env = BTreeMap::new();
        helper_env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());

        Self {
            server_name: "localhost".to_string(),
            server_admin: "root@localhost".to_string(),
            server_header: "quire/0.1 IPP/2.1".to_string(),
            aliases: Vec::new(),
            interfaces: Vec::new(),
            listeners: vec![ListenerConfig {
                addr: SocketAddr::from(([127, 0, 0, 1], 631)),
                encryption: ListenerEncryption::IfRequested,
            }],
            max_clients: 100,
            max_clients_per_host: 100,
            max_request_size: 0,
            hostname_lookups: HostnameLookups::Off,
            default_encryption: EncryptionPolicy::IfRequested,
            keep_alive: true,
            keep_alive_timeout: 30,
            timeout: 900,
            web_interface: true,
            default_locale: None,
            default_auth_scheme: AuthScheme::Basic,
            system_groups: vec!["sys".to_string(), "root".to_string(), "wheel".to_string()],
            cgi_bin: PathBuf::from("/usr/lib/quire/cgi-bin"),
            request_root: PathBuf::from("/var/spool/quire"),
            helper_env,
            roots: Roots::default(),
        }
    }
}

impl ServerConfig {
    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Whether a request body of `length` bytes is over the configured limit.
    pub fn exceeds_request_size(&self, length: u64) -> bool {
        self.max_request_size > 0 && length > self.max_request_size
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub addr: SocketAddr,
    #[serde(default)]
    pub encryption: ListenerEncryption,
}

/// TLS behavior of a single listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListenerEncryption {
    Never,
    /// Plaintext, upgraded when the client opens with a TLS record or asks for it.
    #[default]
    IfRequested,
    /// TLS from the first byte.
    Always,
}

/// Server-wide policy for plaintext connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionPolicy {
    Never,
    #[default]
    IfRequested,
    /// Authentication challenges to remote plaintext clients become `426 Upgrade Required`.
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostnameLookups {
    #[default]
    Off,
    On,
    /// Reverse lookup, confirmed by a forward lookup of the result.
    Double,
}

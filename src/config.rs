use crate::domain::identity::{derive_node_id, NodeId, DEFAULT_PEER_PREFIX};
use crate::replication::MeshConfig;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

const ENV_PREFIX: &str = "INSPECTION_SYNC_";

#[derive(Debug, Clone)]
pub struct Config {
    // Identity
    pub identity: String,
    pub display_name: Option<String>,
    pub peer_prefix: String,

    // Peer transport
    pub transport_listen_addr: SocketAddr,
    pub address_book: Vec<(NodeId, SocketAddr)>,

    // Node API
    pub api_enabled: bool,
    pub api_listen_addr: String,

    // Storage; in-memory when unset
    pub db_path: Option<String>,

    // Timers
    pub connect_timeout_ms: u64,
    pub bootstrap_delay_ms: u64,
    pub reconnect_interval_secs: u64,
    pub flush_interval_secs: u64,

    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: String::new(),
            display_name: None,
            peer_prefix: DEFAULT_PEER_PREFIX.to_string(),
            transport_listen_addr: SocketAddr::from(([0, 0, 0, 0], 4433)),
            address_book: Vec::new(),
            api_enabled: true,
            api_listen_addr: "127.0.0.1:8081".to_string(),
            db_path: None,
            connect_timeout_ms: 10_000,
            bootstrap_delay_ms: 800,
            reconnect_interval_secs: 30,
            flush_interval_secs: 15,
            debug: false,
        }
    }
}

impl Config {
    /// The mesh settings this configuration describes.
    pub fn mesh_config(&self) -> MeshConfig {
        let mut mesh = MeshConfig::new(self.identity.clone())
            .peer_prefix(self.peer_prefix.clone())
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .bootstrap_delay(Duration::from_millis(self.bootstrap_delay_ms))
            .reconnect_interval(Duration::from_secs(self.reconnect_interval_secs))
            .flush_interval(Duration::from_secs(self.flush_interval_secs));
        if let Some(name) = &self.display_name {
            mesh = mesh.display_name(name.clone());
        }
        mesh
    }

    /// Id of the local node.
    pub fn node_id(&self) -> NodeId {
        derive_node_id(&self.peer_prefix, &self.identity)
    }
}

pub fn load_config() -> anyhow::Result<Config> {
    load_config_from(|key| std::env::var(key).ok())
}

/// Build the configuration from a variable lookup.
pub fn load_config_from(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
    let get = |name: &str| var(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.is_empty());
    let flag = |name: &str, default: bool| {
        get(name)
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(default)
    };
    let number = |name: &str, default: u64| {
        get(name).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let defaults = Config::default();

    let identity = get("IDENTITY")
        .ok_or_else(|| anyhow::anyhow!("{}IDENTITY is required", ENV_PREFIX))?;

    let peer_prefix = get("PEER_PREFIX").unwrap_or(defaults.peer_prefix);

    let transport_listen_addr = match get("LISTEN_ADDR") {
        Some(addr) => addr.parse()?,
        None => defaults.transport_listen_addr,
    };

    let address_book = match get("PEERS") {
        Some(list) => parse_address_book(&list, &peer_prefix)?,
        None => Vec::new(),
    };

    Ok(Config {
        identity,
        display_name: get("DISPLAY_NAME"),
        peer_prefix,
        transport_listen_addr,
        address_book,
        api_enabled: flag("API_ENABLED", defaults.api_enabled),
        api_listen_addr: get("API_LISTEN_ADDR").unwrap_or(defaults.api_listen_addr),
        db_path: get("DB_PATH"),
        connect_timeout_ms: number("CONNECT_TIMEOUT_MS", defaults.connect_timeout_ms),
        bootstrap_delay_ms: number("BOOTSTRAP_DELAY_MS", defaults.bootstrap_delay_ms),
        reconnect_interval_secs: number("RECONNECT_INTERVAL_SECS", defaults.reconnect_interval_secs),
        flush_interval_secs: number("FLUSH_INTERVAL_SECS", defaults.flush_interval_secs),
        debug: var("DEBUG").is_some(),
    })
}

/// Parse `peer@host:port` entries separated by commas.
///
/// The peer is either a node id or an e-mail, from which the id is derived:
/// `oae-1f2e...@10.0.0.7:4433` or `ana@example.com@10.0.0.7:4433`.
pub fn parse_address_book(list: &str, prefix: &str) -> anyhow::Result<Vec<(NodeId, SocketAddr)>> {
    let mut book = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (peer, addr) = entry
            .rsplit_once('@')
            .ok_or_else(|| anyhow::anyhow!("invalid peer entry {:?}, expected peer@host:port", entry))?;
        let id = if peer.contains('@') {
            derive_node_id(prefix, peer)
        } else {
            NodeId::new(peer)
        };
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow::anyhow!("no address for {:?}", addr))?;
        book.push((id, addr));
    }
    Ok(book)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        load_config_from(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.peer_prefix, "oae");
        assert_eq!(cfg.transport_listen_addr.port(), 4433);
        assert!(cfg.api_enabled);
        assert!(cfg.db_path.is_none());
    }

    #[test]
    fn test_identity_is_required() {
        assert!(load(&[]).is_err());
        assert!(load(&[("INSPECTION_SYNC_IDENTITY", "")]).is_err());
    }

    #[test]
    fn test_load_config_defaults() {
        let cfg = load(&[("INSPECTION_SYNC_IDENTITY", "ana@example.com")]).unwrap();
        assert_eq!(cfg.identity, "ana@example.com");
        assert_eq!(cfg.connect_timeout_ms, 10_000);
        assert_eq!(cfg.reconnect_interval_secs, 30);
        assert!(cfg.address_book.is_empty());
        assert!(!cfg.debug);
    }

    #[test]
    fn test_load_config_overrides() {
        let cfg = load(&[
            ("INSPECTION_SYNC_IDENTITY", "ana@example.com"),
            ("INSPECTION_SYNC_DISPLAY_NAME", "Ana"),
            ("INSPECTION_SYNC_PEER_PREFIX", "lab"),
            ("INSPECTION_SYNC_LISTEN_ADDR", "127.0.0.1:5000"),
            ("INSPECTION_SYNC_API_ENABLED", "false"),
            ("INSPECTION_SYNC_DB_PATH", "/tmp/node.db"),
            ("INSPECTION_SYNC_FLUSH_INTERVAL_SECS", "5"),
            ("DEBUG", "1"),
        ])
        .unwrap();
        assert_eq!(cfg.display_name.as_deref(), Some("Ana"));
        assert_eq!(cfg.transport_listen_addr, "127.0.0.1:5000".parse().unwrap());
        assert!(!cfg.api_enabled);
        assert_eq!(cfg.db_path.as_deref(), Some("/tmp/node.db"));
        assert_eq!(cfg.flush_interval_secs, 5);
        assert!(cfg.debug);
        assert!(cfg.node_id().as_str().starts_with("lab-"));
    }

    #[test]
    fn test_parse_error_uses_default() {
        let cfg = load(&[
            ("INSPECTION_SYNC_IDENTITY", "ana@example.com"),
            ("INSPECTION_SYNC_CONNECT_TIMEOUT_MS", "soon"),
        ])
        .unwrap();
        assert_eq!(cfg.connect_timeout_ms, 10_000);
    }

    #[test]
    fn test_bad_listen_addr_is_an_error() {
        let result = load(&[
            ("INSPECTION_SYNC_IDENTITY", "ana@example.com"),
            ("INSPECTION_SYNC_LISTEN_ADDR", "nowhere"),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_address_book_by_id_and_email() {
        let book = parse_address_book(
            "oae-abc@127.0.0.1:4433, bia@example.com@127.0.0.1:4434",
            "oae",
        )
        .unwrap();
        assert_eq!(book.len(), 2);
        assert_eq!(book[0], (NodeId::new("oae-abc"), "127.0.0.1:4433".parse().unwrap()));
        assert_eq!(book[1].0, derive_node_id("oae", "bia@example.com"));
        assert_eq!(book[1].1.port(), 4434);
    }

    #[test]
    fn test_address_book_rejects_missing_address() {
        assert!(parse_address_book("oae-abc", "oae").is_err());
        assert!(parse_address_book("oae-abc@not-an-addr", "oae").is_err());
    }

    #[test]
    fn test_mesh_config_carries_timers() {
        let cfg = load(&[
            ("INSPECTION_SYNC_IDENTITY", "ana@example.com"),
            ("INSPECTION_SYNC_BOOTSTRAP_DELAY_MS", "50"),
        ])
        .unwrap();
        let mesh = cfg.mesh_config();
        assert_eq!(mesh.identity, "ana@example.com");
        assert_eq!(mesh.display_name, "ana@example.com");
        assert_eq!(mesh.bootstrap_delay, Duration::from_millis(50));
        assert!(mesh.validate().is_ok());
    }
}

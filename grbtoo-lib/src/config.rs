//! Runtime configuration.
//!
//! Configuration is a JSON document in which every section and field is optional; missing
//! values take the defaults shown by [Config::default]. Unknown fields are rejected so that
//! typos do not silently fall back to defaults.
//!
//! ```json
//! {
//!   "gcn": {"server": "68.169.57.253:8099", "events_dir": "~/data/gcn/"},
//!   "observability": {"packets": [61, "110-130"], "min_alt": 30, "ebv_max": 0.5},
//!   "site": {"latitude": -22.5344, "longitude": -45.5825, "elevation": 1864}
//! }
//! ```
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    astro::{Site, UniformDust},
    decision::{Criteria, PacketFilter},
    listener::{ListenOpts, DEFAULT_IVORN},
    Error, Result,
};

/// Addresses of the observatory devices a trigger commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DevicesConfig {
    pub telescope: String,
    pub camera: String,
    pub filterwheel: String,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        DevicesConfig {
            telescope: "/Telescope/0".into(),
            camera: "/Camera/0".into(),
            filterwheel: "/FilterWheel/0".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GcnConfig {
    /// Feed server as `host:port`.
    pub server: String,
    pub ivorn: String,
    /// Seconds of silence after which the connection is considered dead.
    pub iamalive_timeout: u64,
    /// Reconnect backoff ceiling in seconds.
    pub max_reconnect_timeout: u64,
    /// Archive directory. Archiving is disabled when `null`.
    pub events_dir: Option<PathBuf>,
    /// Public base URL of the archive.
    pub www: Option<String>,
}

impl Default for GcnConfig {
    fn default() -> Self {
        GcnConfig {
            server: "68.169.57.253:8099".into(),
            ivorn: DEFAULT_IVORN.into(),
            iamalive_timeout: 150,
            max_reconnect_timeout: 1024,
            events_dir: Some(PathBuf::from("~/data/gcn_test/")),
            www: Some("http://localhost/".into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObservabilityConfig {
    pub packets: PacketFilter,
    /// Minimum altitude in degrees.
    pub min_alt: f64,
    /// Maximum E(B-V) in magnitudes.
    pub ebv_max: f64,
    /// Moon distance in degrees below which an advisory is logged.
    pub min_moondist: f64,
    /// Exposure plan file.
    pub sequence: PathBuf,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        let criteria = Criteria::default();
        ObservabilityConfig {
            packets: criteria.packets,
            min_alt: criteria.min_alt,
            ebv_max: criteria.ebv_max,
            min_moondist: criteria.min_moondist,
            sequence: PathBuf::from("~/.chimera/grb_sequence.json"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DustConfig {
    /// Extinction reported for every position.
    pub ebv: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub devices: DevicesConfig,
    pub gcn: GcnConfig,
    pub observability: ObservabilityConfig,
    pub site: Site,
    pub dust: DustConfig,
    /// Chat bot token. Accepted for compatibility; no chat interface is provided.
    pub telegram_token: Option<String>,
}

impl Config {
    /// Read, validate and resolve a config file.
    ///
    /// # Errors
    /// [Error::Config] if the file cannot be read, parsed, or fails validation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("failed to read {}: {err}", path.display())))?;
        json.parse()
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))
    }

    /// Check value ranges.
    ///
    /// # Errors
    /// [Error::Config] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        self.server_addr()?;
        if self.gcn.iamalive_timeout < 1 {
            return Err(Error::Config("gcn.iamalive_timeout must be >= 1".into()));
        }
        if self.gcn.max_reconnect_timeout < 1 {
            return Err(Error::Config("gcn.max_reconnect_timeout must be >= 1".into()));
        }
        if !(-90.0..=90.0).contains(&self.site.latitude) {
            return Err(Error::Config(format!(
                "site.latitude {} out of range",
                self.site.latitude
            )));
        }
        if !self.site.longitude.is_finite() {
            return Err(Error::Config("site.longitude must be finite".into()));
        }
        let obs = &self.observability;
        for (name, value) in [
            ("min_alt", obs.min_alt),
            ("ebv_max", obs.ebv_max),
            ("min_moondist", obs.min_moondist),
            ("dust.ebv", self.dust.ebv),
        ] {
            if !value.is_finite() {
                return Err(Error::Config(format!("{name} must be finite")));
            }
        }
        Ok(())
    }

    /// Feed server host and port.
    ///
    /// # Errors
    /// [Error::Config] if `gcn.server` is not `host:port`.
    pub fn server_addr(&self) -> Result<(String, u16)> {
        let server = &self.gcn.server;
        let invalid = || Error::Config(format!("gcn.server {server:?} is not host:port"));
        let (host, port) = server.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        Ok((host.to_string(), port))
    }

    /// # Errors
    /// [Error::Config] if the server address is invalid.
    pub fn listen_opts(&self) -> Result<ListenOpts> {
        let (host, port) = self.server_addr()?;
        Ok(ListenOpts::builder()
            .host(host)
            .port(port)
            .ivorn(self.gcn.ivorn.clone())
            .iamalive_timeout(Duration::from_secs(self.gcn.iamalive_timeout))
            .max_reconnect_timeout(Duration::from_secs(self.gcn.max_reconnect_timeout))
            .build())
    }

    #[must_use]
    pub fn criteria(&self) -> Criteria {
        let obs = &self.observability;
        Criteria {
            packets: obs.packets.clone(),
            min_alt: obs.min_alt,
            ebv_max: obs.ebv_max,
            min_moondist: obs.min_moondist,
        }
    }

    #[must_use]
    pub fn dust(&self) -> UniformDust {
        UniformDust(self.dust.ebv)
    }

    /// Replace a leading `~` in every configured path with the user's home directory.
    fn expand_paths(&mut self) {
        self.observability.sequence = expand_tilde(&self.observability.sequence);
        if let Some(ref dir) = self.gcn.events_dir {
            self.gcn.events_dir = Some(expand_tilde(dir));
        }
    }
}

impl FromStr for Config {
    type Err = Error;

    /// Parse, validate, and expand paths in a JSON config.
    fn from_str(s: &str) -> Result<Self> {
        let mut config: Config =
            serde_json::from_str(s).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        config.expand_paths();
        Ok(config)
    }
}

/// Expand a leading `~` component. Paths without one, or when the home directory is unknown,
/// are returned unchanged.
#[must_use]
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = "{}".parse().unwrap();

        assert_eq!(config.devices.telescope, "/Telescope/0");
        assert_eq!(config.gcn.iamalive_timeout, 150);
        assert_eq!(
            config.server_addr().unwrap(),
            ("68.169.57.253".to_string(), 8099)
        );
        assert_eq!(config.observability.min_moondist, 10.0);
        assert!(config.criteria().packets.contains(999));
        assert!(!config.criteria().packets.contains(1000));
        assert!(config.telegram_token.is_none());
        assert!(!config.observability.sequence.starts_with("~"));
    }

    #[test]
    fn full_config() {
        let config: Config = r#"{
            "devices": {"telescope": "/FakeTelescope/0"},
            "gcn": {
                "server": "localhost:5341",
                "iamalive_timeout": 30,
                "max_reconnect_timeout": 64,
                "events_dir": "/var/gcn",
                "www": null
            },
            "observability": {
                "packets": [61, "110-130"],
                "min_alt": 25.5,
                "ebv_max": 0.8,
                "sequence": "/etc/grbtoo/sequence.json"
            },
            "site": {"latitude": 19.8, "longitude": -155.5},
            "dust": {"ebv": 0.02},
            "telegram_token": "123:abc"
        }"#
        .parse()
        .unwrap();

        assert_eq!(config.devices.telescope, "/FakeTelescope/0");
        assert_eq!(config.devices.camera, "/Camera/0");
        assert_eq!(config.gcn.events_dir, Some(PathBuf::from("/var/gcn")));
        assert_eq!(config.gcn.www, None);
        assert_eq!(config.site.elevation, 0.0);
        assert_eq!(config.dust().0, 0.02);

        let criteria = config.criteria();
        assert!(criteria.packets.contains(61));
        assert!(criteria.packets.contains(115));
        assert!(!criteria.packets.contains(62));
        assert_eq!(criteria.min_alt, 25.5);

        let opts = config.listen_opts().unwrap();
        assert_eq!(opts.host, "localhost");
        assert_eq!(opts.port, 5341);
        assert_eq!(opts.iamalive_timeout, Duration::from_secs(30));
        assert_eq!(opts.max_reconnect_timeout, Duration::from_secs(64));
    }

    #[test]
    fn invalid_configs() {
        for json in [
            r#"{"gcn": {"server": "localhost"}}"#,
            r#"{"gcn": {"server": "localhost:99999"}}"#,
            r#"{"gcn": {"server": ":8099"}}"#,
            r#"{"gcn": {"iamalive_timeout": 0}}"#,
            r#"{"site": {"latitude": 91, "longitude": 0}}"#,
            r#"{"observability": {"packets": ["9-1"]}}"#,
            r#"{"observability": {"min_altitude": 10}}"#,
            r#"{"unknown": 1}"#,
        ] {
            let zult = json.parse::<Config>();
            assert!(matches!(zult, Err(Error::Config(_))), "{json}: {zult:?}");
        }
    }

    #[test]
    fn tilde_expansion() {
        let expanded = expand_tilde(Path::new("~/data/gcn"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("data/gcn"));
        }
        assert_eq!(expand_tilde(Path::new("/abs/~")), PathBuf::from("/abs/~"));
        assert_eq!(expand_tilde(Path::new("~user")), PathBuf::from("~user"));
    }

    #[test]
    fn load_reports_path() {
        let zult = Config::load("/nonexistent/grbtoo.json");
        let Err(Error::Config(msg)) = zult else {
            panic!("expected config error, got {zult:?}");
        };
        assert!(msg.contains("/nonexistent/grbtoo.json"), "{msg}");
    }
}

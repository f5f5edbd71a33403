//! Application settings objects and initialization

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

static PREFIX: &str = "imposter";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub port: u16,
    pub host: String,
    /// Directory holding the mock configuration files. Response files,
    /// script files and store preload files are resolved against it.
    pub config_dir: String,
    pub actix_keep_alive: Option<u32>,

    pub human_logs: bool,

    pub statsd_host: Option<String>,
    pub statsd_port: u16,
    pub statsd_label: String,

    /// Externally visible base URL. Defaults to `http://<host>:<port>`;
    /// `${system.server.url}` placeholders resolve to this value.
    pub server_url: Option<String>,

    /// Cors Settings
    pub cors_allowed_origin: Option<String>,
    pub cors_max_age: Option<usize>,
    pub cors_allowed_methods: Option<Vec<String>>,
    pub cors_allowed_headers: Option<Vec<String>>,
}

impl Settings {
    /// Load the settings from the config file if supplied, then the environment.
    pub fn with_env_and_config_file(filename: Option<&str>) -> Result<Self, ConfigError> {
        let mut s = Config::builder();

        // Merge the config file if supplied
        if let Some(config_filename) = filename {
            s = s.add_source(File::with_name(config_filename));
        }

        // Merge the environment overrides
        // While the prefix is currently case insensitive, it's traditional that
        // environment vars be UPPERCASE, this ensures that will continue should
        // Environment ever change their policy about case insensitivity.
        // This will accept environment variables specified as
        // `IMPOSTER_FOO__BAR_VALUE="gorp"` as `foo.bar_value = "gorp"`
        s = s.add_source(Environment::with_prefix(&PREFIX.to_uppercase()).separator("__"));

        match s.build().and_then(|s| s.try_deserialize::<Self>()) {
            Ok(s) => Ok(s),
            // Configuration errors are not very sysop friendly, Try to make them
            // a bit more 3AM useful.
            Err(ConfigError::Message(v)) => {
                println!("Bad configuration: {:?}", &v);
                println!("Please set in config file or use environment variable.");
                println!(
                    "For example to set `config_dir` use env var `{}_CONFIG_DIR`\n",
                    PREFIX.to_uppercase()
                );
                error!("Configuration error: Value undefined {:?}", &v);
                Err(ConfigError::NotFound(v))
            }
            Err(e) => {
                error!("Configuration error: Other: {:?}", &e);
                Err(e)
            }
        }
    }

    #[cfg(debug_assertions)]
    pub fn test_settings() -> Self {
        let mut settings = Self::with_env_and_config_file(None)
            .expect("Could not get Settings in test_settings");
        settings.port = 8080;
        settings.host = "127.0.0.1".to_owned();
        settings.statsd_host = None;
        settings
    }

    /// The URL clients should use to reach this server.
    pub fn base_url(&self) -> String {
        self.server_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }

    pub fn banner(&self) -> String {
        format!("http://{}:{} (config: {})", self.host, self.port, self.config_dir)
    }
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            port: 8080,
            host: "127.0.0.1".to_string(),
            config_dir: ".".to_string(),
            actix_keep_alive: None,
            human_logs: false,
            statsd_host: None,
            statsd_port: 8125,
            statsd_label: "imposter".to_string(),
            server_url: None,
            cors_allowed_origin: Some("*".to_owned()),
            cors_allowed_methods: Some(
                ["DELETE", "GET", "POST", "PUT", "PATCH", "OPTIONS"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
            ),
            cors_allowed_headers: Some(
                ["Authorization", "Content-Type", "SOAPAction", "UserAgent"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
            ),
            cors_max_age: None,
        }
    }
}

//! Main application server

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{dev, http::Method, web, web::Data, App, HttpServer};

use crate::config::ImposterConfig;
use crate::error::ApiError;
use crate::limiter::RateLimiter;
use crate::respond::ComposeEnv;
use crate::server::metrics::Metrics;
use crate::settings::Settings;
use crate::steps::StepEnv;
use crate::store::StoreFactory;
use crate::template::ServerInfo;

pub mod metrics;
#[cfg(test)]
mod test;

/// This is the global HTTP state object that will be made available to
/// all HTTP API calls.
pub struct ServerState {
    pub config: Arc<ImposterConfig>,

    /// The process-wide store provider behind every named store.
    pub stores: StoreFactory,

    pub limiter: Arc<RateLimiter>,

    /// Metric reporting
    pub metrics: Metrics,

    pub http_client: reqwest::Client,

    /// Directory that response files, scripts and preloads resolve
    /// against.
    pub config_dir: PathBuf,

    pub server_info: ServerInfo,

    /// System-wide XPath namespace bindings, copied out of the config.
    namespaces: BTreeMap<String, String>,
}

impl ServerState {
    pub fn new(
        config: ImposterConfig,
        stores: StoreFactory,
        metrics: Metrics,
        config_dir: PathBuf,
        server_info: ServerInfo,
    ) -> Self {
        let namespaces = config
            .system
            .as_ref()
            .map(|system| system.xml_namespaces.clone())
            .unwrap_or_default();
        let limiter = Arc::new(RateLimiter::from_env(&stores));
        Self {
            config: Arc::new(config),
            stores,
            limiter,
            metrics,
            http_client: reqwest::Client::new(),
            config_dir,
            server_info,
            namespaces,
        }
    }

    pub fn system_namespaces(&self) -> &BTreeMap<String, String> {
        &self.namespaces
    }

    pub fn compose_env(&self) -> ComposeEnv<'_> {
        ComposeEnv {
            config_dir: &self.config_dir,
            factory: &self.stores,
            server: &self.server_info,
        }
    }

    pub fn step_env(&self) -> StepEnv<'_> {
        StepEnv {
            config_dir: &self.config_dir,
            factory: &self.stores,
            server: &self.server_info,
            system_namespaces: &self.namespaces,
            http_client: &self.http_client,
        }
    }
}

pub struct Server;

#[macro_export]
macro_rules! build_app {
    ($state: expr, $cors: expr) => {
        App::new()
            .app_data($state.clone())
            // Middleware is applied LIFO
            .wrap($cors)
            // The resource collection governs the whole path namespace.
            .default_service(web::route().to($crate::web::handlers::handle))
    };
}

impl Server {
    pub async fn with_settings(settings: Settings) -> Result<dev::Server, ApiError> {
        let settings_copy = settings.clone();
        let metrics_client = metrics::metrics_from_opts(
            &settings.statsd_label,
            settings.statsd_host.as_deref(),
            settings.statsd_port,
        )?;
        let host = settings.host.clone();
        let port = settings.port;

        let config_dir = PathBuf::from(&settings.config_dir);
        let config = ImposterConfig::load_dir(&config_dir)?;
        info!(
            "loaded {} resource(s), {} interceptor(s)",
            config.resources.len(),
            config.interceptors.len()
        );

        if env::var("AWS_LAMBDA_FUNCTION_NAME").is_ok() {
            // The serverless adapter wraps the same pipeline; selection
            // happens in the deployment entry point.
            info!("AWS_LAMBDA_FUNCTION_NAME is set; expecting the serverless adapter");
        }

        let stores = StoreFactory::from_env()?;
        stores.preload(&config.stores, &config_dir);

        let server_info = ServerInfo {
            port,
            url: settings.base_url(),
        };
        let state = Data::new(ServerState::new(
            config,
            stores,
            Metrics::from(&metrics_client),
            config_dir,
            server_info,
        ));

        let mut server =
            HttpServer::new(move || build_app!(state, build_cors(&settings_copy)));

        if let Some(keep_alive) = settings.actix_keep_alive {
            server = server.keep_alive(std::time::Duration::from_secs(keep_alive as u64));
        }

        let server = server
            .bind(format!("{}:{}", host, port))
            .expect("Could not get Server in Server::with_settings")
            .run();
        Ok(server)
    }
}

pub fn build_cors(settings: &Settings) -> Cors {
    // actix is getting increasingly tighter about CORS headers. Our server
    // serves whatever the mock author declared, so stay permissive and let
    // a wrapping proxy narrow things down.
    let mut cors = Cors::default();

    if let Some(allowed_methods) = &settings.cors_allowed_methods {
        let mut methods = vec![];
        for method_string in allowed_methods {
            let method = Method::from_bytes(method_string.as_bytes()).unwrap();
            methods.push(method);
        }
        cors = cors.allowed_methods(methods);
    }
    if let Some(allowed_headers) = &settings.cors_allowed_headers {
        cors = cors.allowed_headers(allowed_headers);
    }

    if let Some(max_age) = &settings.cors_max_age {
        cors = cors.max_age(*max_age);
    }

    // explicitly set the CORS allow origin, since Default does not
    // appear to set the `allow-origins: *` header.
    if let Some(ref origin) = settings.cors_allowed_origin {
        if origin == "*" {
            cors = cors.allow_any_origin();
        } else {
            cors = cors.allowed_origin(origin);
        }
    }

    cors
}

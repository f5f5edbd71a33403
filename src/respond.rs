//! Response composition.
//!
//! Applies a response descriptor to the exchange's mutable
//! response-state: delay, status, headers, failure simulation, body from
//! inline content or a config-dir file, and template substitution.
//! Overrides already present on the state (set by script steps) win over
//! the descriptor.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;

use crate::config::{DelayConfig, FailureKind, ResponseConfig};
use crate::error::{ApiErrorKind, ApiResult};
use crate::exchange::Exchange;
use crate::store::StoreFactory;
use crate::template::{ServerInfo, TemplateContext};

/// Collaborators the composer needs besides the exchange.
pub struct ComposeEnv<'a> {
    pub config_dir: &'a Path,
    pub factory: &'a StoreFactory,
    pub server: &'a ServerInfo,
}

/// Resolve a config-dir-relative path, rejecting traversal outside the
/// configuration directory.
pub fn resolve_config_path(config_dir: &Path, relative: &str) -> ApiResult<PathBuf> {
    let base = config_dir
        .canonicalize()
        .map_err(|e| ApiErrorKind::ResponseFile(format!("{}: {}", config_dir.display(), e)))?;
    let candidate = base
        .join(relative)
        .canonicalize()
        .map_err(|e| ApiErrorKind::ResponseFile(format!("{}: {}", relative, e)))?;
    if !candidate.starts_with(&base) {
        return Err(ApiErrorKind::PathTraversal(relative.to_owned()).into());
    }
    Ok(candidate)
}

/// The delay to apply: an exact duration, or a uniform draw from
/// `[min, max]`.
pub fn pick_delay(delay: &DelayConfig) -> Option<Duration> {
    if delay.exact > 0 {
        return Some(Duration::from_millis(delay.exact));
    }
    if delay.min > 0 && delay.max > 0 {
        let millis = rand::thread_rng().gen_range(delay.min..=delay.max.max(delay.min));
        return Some(Duration::from_millis(millis));
    }
    None
}

async fn apply_delay(delay: Option<DelayConfig>) {
    if let Some(duration) = delay.as_ref().and_then(pick_delay) {
        trace!("delaying response by {:?}", duration);
        tokio::time::sleep(duration).await;
    }
}

/// Compose the chosen response descriptor onto the response-state.
pub async fn compose_response(
    config: &ResponseConfig,
    exchange: &mut Exchange,
    env: &ComposeEnv<'_>,
) -> ApiResult<()> {
    let delay = exchange.state.delay.take().or(config.delay);
    apply_delay(delay).await;

    if config.status_code > 0 {
        exchange.state.status = config.status_code;
    }
    let headers: Vec<(String, String)> = config
        .headers
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    for (name, value) in headers {
        exchange.state.set_header(&name, &value);
    }

    match exchange.state.fail.take().or(config.fail) {
        Some(FailureKind::EmptyResponse) => {
            debug!("simulating failure: empty response");
            exchange.state.body.clear();
            return Ok(());
        }
        Some(FailureKind::CloseConnection) => {
            debug!("simulating failure: close connection");
            exchange.state.stopped = true;
            return Ok(());
        }
        None => {}
    }

    let file = exchange.state.file.take().or_else(|| config.file.clone());
    let mut body = match file {
        Some(file) => {
            let path = resolve_config_path(env.config_dir, &file)?;
            match fs::read_to_string(&path) {
                Ok(contents) => contents,
                Err(e) => {
                    warn!("failed to read response file {}: {}", path.display(), e);
                    exchange.state.status = 500;
                    exchange.state.body = b"failed to load response file".to_vec();
                    return Ok(());
                }
            }
        }
        None => config.content.clone().unwrap_or_default(),
    };

    if config.template {
        let tctx = TemplateContext::new(exchange, env.factory, env.server);
        body = tctx.render(&body);
    }
    exchange.state.body = body.into_bytes();
    Ok(())
}

/// Apply state-only overrides when no descriptor gets composed (a script
/// claimed the response): pending delay, failure simulation and a body
/// file chosen via `withFile`.
pub async fn finalize_overrides(exchange: &mut Exchange, env: &ComposeEnv<'_>) -> ApiResult<()> {
    let delay = exchange.state.delay.take();
    apply_delay(delay).await;

    match exchange.state.fail.take() {
        Some(FailureKind::EmptyResponse) => {
            exchange.state.body.clear();
            return Ok(());
        }
        Some(FailureKind::CloseConnection) => {
            exchange.state.stopped = true;
            return Ok(());
        }
        None => {}
    }

    if let Some(file) = exchange.state.file.take() {
        let path = resolve_config_path(env.config_dir, &file)?;
        match fs::read_to_string(&path) {
            Ok(contents) => exchange.state.body = contents.into_bytes(),
            Err(e) => {
                warn!("failed to read response file {}: {}", path.display(), e);
                exchange.state.status = 500;
                exchange.state.body = b"failed to load response file".to_vec();
            }
        }
    }
    Ok(())
}

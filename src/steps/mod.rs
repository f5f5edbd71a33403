//! Step execution: scripted and remote-call actions that run between
//! capture and response composition, strictly in declaration order.

pub mod remote;
pub mod script;

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::Step;
use crate::error::ApiResult;
use crate::exchange::Exchange;
use crate::store::StoreFactory;
use crate::template::ServerInfo;

/// Collaborators shared by every step.
pub struct StepEnv<'a> {
    pub config_dir: &'a Path,
    pub factory: &'a StoreFactory,
    pub server: &'a ServerInfo,
    pub system_namespaces: &'a BTreeMap<String, String>,
    pub http_client: &'a reqwest::Client,
}

/// Run the step list. The first failure aborts the remaining steps; the
/// caller turns it into a 5xx unless an earlier step already claimed the
/// response.
pub async fn run_steps(
    steps: &[Step],
    exchange: &mut Exchange,
    env: &StepEnv<'_>,
) -> ApiResult<()> {
    for (index, step) in steps.iter().enumerate() {
        let result = match step {
            Step::Script(config) => script::run(config, exchange, env),
            Step::Remote(config) => remote::run(config, exchange, env).await,
        };
        if let Err(e) = result {
            warn!("step {} failed: {}", index, e);
            return Err(e);
        }
    }
    Ok(())
}

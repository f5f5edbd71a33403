//! Mock configuration model.
//!
//! The typed form of the operator-supplied configuration: resources,
//! interceptors, match conditions, captures, response descriptors, steps,
//! store preloads. Loading from disk is a thin wrapper around `serde_yaml`;
//! everything downstream consumes these types only.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{ApiError, ApiErrorKind, ApiResult};
use crate::wsdl::WsdlCatalog;

/// Handler family served by an imposter configuration.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Plugin {
    #[default]
    Rest,
    Soap,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ImposterConfig {
    pub plugin: Plugin,
    pub resources: Vec<Resource>,
    pub interceptors: Vec<Interceptor>,
    /// Named store definitions, preloaded at startup.
    pub stores: BTreeMap<String, StoreDefinition>,
    pub system: Option<SystemConfig>,
    /// Operations/bindings table exposed by the WSDL collaborator.
    pub wsdl: Option<WsdlCatalog>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SystemConfig {
    /// Namespace bindings applied to every XPath evaluation.
    pub xml_namespaces: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreDefinition {
    /// Inline key/value entries loaded at startup.
    pub preload_data: BTreeMap<String, serde_json::Value>,
    /// JSON object file, resolved relative to the configuration directory.
    pub preload_file: Option<String>,
}

/// A matcher descriptor. All fields are independently optional; a
/// descriptor with no fields matches everything with score 0.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestMatcher {
    pub method: Option<String>,
    pub path: Option<String>,
    pub path_params: BTreeMap<String, MatchCondition>,
    pub query_params: BTreeMap<String, MatchCondition>,
    pub form_params: BTreeMap<String, MatchCondition>,
    pub request_headers: BTreeMap<String, MatchCondition>,
    pub request_body: Option<BodyMatchConfig>,
    /// Free-form expression predicates; all must hold.
    pub all_of: Vec<ExpressionPredicate>,
    /// Free-form expression predicates; at least one must hold.
    pub any_of: Vec<ExpressionPredicate>,

    // SOAP extensions
    pub operation: Option<String>,
    pub soap_action: Option<String>,
    pub binding: Option<String>,

    pub capture: BTreeMap<String, Capture>,
    pub concurrency: Vec<ConcurrencyLimit>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Resource {
    #[serde(flatten)]
    pub matcher: RequestMatcher,
    #[serde(default)]
    pub response: ResponseConfig,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Interceptor {
    #[serde(flatten)]
    pub matcher: RequestMatcher,
    pub response: Option<ResponseConfig>,
    /// When false the exchange is marked handled and resource matching is
    /// skipped entirely.
    #[serde(rename = "continue", default)]
    pub continue_: bool,
}

/// Comparison operators for match conditions.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
pub enum MatchOperator {
    #[default]
    EqualTo,
    NotEqualTo,
    Contains,
    NotContains,
    Matches,
    NotMatches,
    Exists,
    NotExists,
}

/// A `(value, operator)` pair. In configuration this is either a bare
/// string (implying `EqualTo`) or a mapping with explicit fields.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(from = "MatchConditionDef")]
pub struct MatchCondition {
    pub value: String,
    pub operator: MatchOperator,
}

impl MatchCondition {
    pub fn equal_to(value: &str) -> Self {
        Self {
            value: value.to_owned(),
            operator: MatchOperator::EqualTo,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MatchConditionDef {
    Simple(String),
    Full {
        #[serde(default)]
        value: String,
        #[serde(default)]
        operator: MatchOperator,
    },
}

impl From<MatchConditionDef> for MatchCondition {
    fn from(def: MatchConditionDef) -> Self {
        match def {
            MatchConditionDef::Simple(value) => MatchCondition {
                value,
                operator: MatchOperator::EqualTo,
            },
            MatchConditionDef::Full { value, operator } => MatchCondition { value, operator },
        }
    }
}

/// A single body predicate: a condition applied to the whole body, to a
/// JSON-path projection of it, or to an XPath projection of it.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BodyPredicate {
    pub value: String,
    pub operator: MatchOperator,
    pub json_path: Option<String>,
    pub x_path: Option<String>,
    /// Matcher-level namespace bindings, merged over the system-wide ones.
    pub xml_namespaces: BTreeMap<String, String>,
}

impl BodyPredicate {
    fn is_set(&self) -> bool {
        !self.value.is_empty()
            || self.json_path.is_some()
            || self.x_path.is_some()
            || self.operator != MatchOperator::EqualTo
    }
}

/// Body matching: exactly one of {single predicate, all-of, any-of}.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BodyMatchConfig {
    #[serde(flatten)]
    pub single: BodyPredicate,
    pub all_of: Vec<BodyPredicate>,
    pub any_of: Vec<BodyPredicate>,
}

/// An expression predicate: a template expression paired with a condition.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpressionPredicate {
    pub expression: String,
    #[serde(flatten)]
    pub condition: MatchCondition,
}

fn default_true() -> bool {
    true
}

fn default_capture_store() -> String {
    "request".to_owned()
}

/// Declarative extraction of a value from the exchange into a store.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capture {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Target store name; `request` is the per-request store.
    #[serde(default = "default_capture_store")]
    pub store: String,
    /// Source producing the item name. Defaults to the capture id.
    pub key: Option<CaptureSource>,
    #[serde(flatten)]
    pub source: CaptureSource,
}

/// One of the supported capture sources. The first populated field wins,
/// checked in declaration order.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CaptureSource {
    pub path_param: Option<String>,
    pub query_param: Option<String>,
    pub form_param: Option<String>,
    pub request_header: Option<String>,
    pub expression: Option<String>,
    #[serde(rename = "const")]
    pub const_value: Option<String>,
    pub request_body: Option<BodyQuery>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BodyQuery {
    pub json_path: Option<String>,
    pub x_path: Option<String>,
    pub xml_namespaces: BTreeMap<String, String>,
}

/// A per-resource concurrent-in-flight limit and the response returned
/// once it is exceeded.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyLimit {
    pub limit: i64,
    pub response: ResponseConfig,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum FailureKind {
    EmptyResponse,
    CloseConnection,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DelayConfig {
    /// Exact delay in milliseconds.
    pub exact: u64,
    pub min: u64,
    pub max: u64,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResponseConfig {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    /// Inline body content. Mutually exclusive with `file`.
    pub content: Option<String>,
    /// Config-dir-relative body file. Mutually exclusive with `content`.
    pub file: Option<String>,
    /// Apply template substitution to the body.
    pub template: bool,
    pub delay: Option<DelayConfig>,
    pub fail: Option<FailureKind>,
}

/// A step executed between capture and response composition.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Step {
    Script(ScriptStepConfig),
    Remote(RemoteStepConfig),
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScriptStepConfig {
    /// Must be absent, `js` or `javascript`.
    pub lang: Option<String>,
    pub code: Option<String>,
    /// Config-dir-relative script file.
    pub file: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RemoteStepConfig {
    pub method: Option<String>,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub capture: BTreeMap<String, Capture>,
}

impl ImposterConfig {
    pub fn from_yaml(raw: &str) -> ApiResult<Self> {
        let config: ImposterConfig = serde_yaml::from_str(raw)
            .map_err(|e| ApiError::from(ApiErrorKind::Config(e.to_string())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ApiResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| ApiErrorKind::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml(&raw)
    }

    /// Load and merge every `*-config.{yaml,yml,json}` file in a directory.
    /// The merged configuration keeps declaration order within each file and
    /// directory-listing order across files.
    pub fn load_dir(dir: &Path) -> ApiResult<Self> {
        let mut merged = ImposterConfig::default();
        let mut entries: Vec<_> = fs::read_dir(dir)
            .map_err(|e| ApiErrorKind::Config(format!("{}: {}", dir.display(), e)))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                name.ends_with("-config.yaml")
                    || name.ends_with("-config.yml")
                    || name.ends_with("-config.json")
            })
            .collect();
        entries.sort();

        if entries.is_empty() {
            return Err(ApiErrorKind::Config(format!(
                "no *-config.{{yaml,yml,json}} files under {}",
                dir.display()
            ))
            .into());
        }

        for path in entries {
            debug!("loading mock configuration from {}", path.display());
            let config = Self::from_file(&path)?;
            merged.merge(config)?;
        }
        merged.validate()?;
        Ok(merged)
    }

    fn merge(&mut self, other: ImposterConfig) -> ApiResult<()> {
        if other.plugin != Plugin::Rest && self.plugin != Plugin::Rest && other.plugin != self.plugin
        {
            return Err(ApiErrorKind::Config(
                "configuration files disagree on the plugin type".to_owned(),
            )
            .into());
        }
        if other.plugin != Plugin::Rest {
            self.plugin = other.plugin;
        }
        self.resources.extend(other.resources);
        self.interceptors.extend(other.interceptors);
        self.stores.extend(other.stores);
        if let Some(system) = other.system {
            match &mut self.system {
                Some(existing) => existing.xml_namespaces.extend(system.xml_namespaces),
                None => self.system = Some(system),
            }
        }
        if other.wsdl.is_some() {
            self.wsdl = other.wsdl;
        }
        Ok(())
    }

    /// Reject configurations the pipeline cannot give a meaning to.
    pub fn validate(&self) -> ApiResult<()> {
        for (idx, resource) in self.resources.iter().enumerate() {
            Self::validate_matcher(&resource.matcher, &format!("resources[{}]", idx))?;
            Self::validate_steps(&resource.steps, &format!("resources[{}]", idx))?;
        }
        for (idx, interceptor) in self.interceptors.iter().enumerate() {
            Self::validate_matcher(&interceptor.matcher, &format!("interceptors[{}]", idx))?;
        }
        Ok(())
    }

    fn validate_matcher(matcher: &RequestMatcher, at: &str) -> ApiResult<()> {
        if let Some(body) = &matcher.request_body {
            let variants = [
                body.single.is_set(),
                !body.all_of.is_empty(),
                !body.any_of.is_empty(),
            ]
            .iter()
            .filter(|set| **set)
            .count();
            if variants != 1 {
                return Err(ApiErrorKind::Config(format!(
                    "{}: requestBody must set exactly one of a single predicate, allOf or anyOf",
                    at
                ))
                .into());
            }
        }
        for limit in &matcher.concurrency {
            if limit.limit <= 0 {
                return Err(ApiErrorKind::Config(format!(
                    "{}: concurrency limits must be positive",
                    at
                ))
                .into());
            }
        }
        Ok(())
    }

    fn validate_steps(steps: &[Step], at: &str) -> ApiResult<()> {
        for (idx, step) in steps.iter().enumerate() {
            if let Step::Script(script) = step {
                match script.lang.as_deref() {
                    None | Some("js") | Some("javascript") => {}
                    Some(other) => {
                        return Err(ApiErrorKind::Config(format!(
                            "{}.steps[{}]: unsupported script language {:?}",
                            at, idx, other
                        ))
                        .into())
                    }
                }
                if script.code.is_none() && script.file.is_none() {
                    return Err(ApiErrorKind::Config(format!(
                        "{}.steps[{}]: script step needs either code or file",
                        at, idx
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }
}

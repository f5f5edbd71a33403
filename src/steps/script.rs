//! Sandboxed JavaScript step.
//!
//! A fresh QuickJS runtime is built per step with a bounded host API:
//! `context` (the request materialised as plain string maps),
//! `stores.open(...)`, a `respond()` builder, `random` and `console`.
//! The runtime is synchronous; builder calls collect response mutations
//! that are applied to the exchange when the script completes.

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};

use rquickjs::{CatchResultExt, Context, Function, Runtime};
use serde_json::json;

use super::StepEnv;
use crate::config::{DelayConfig, FailureKind, ScriptStepConfig};
use crate::error::{ApiError, ApiResult};
use crate::exchange::Exchange;
use crate::respond::resolve_config_path;
use crate::store::{Store, StoreFactory, REQUEST_STORE};
use crate::template;

/// JS layer over the flat native hooks: console, stores, respond() and
/// random, mirroring the documented script API.
const HOST_SHIM: &str = r#"
const console = {
  _write(level, args) {
    const msg = args.map(a => {
      if (typeof a === 'string') return a;
      try { return JSON.stringify(a); } catch { return String(a); }
    }).join(' ');
    __console(level, msg);
  },
  log(...args)   { this._write('log', args); },
  debug(...args) { this._write('debug', args); },
  info(...args)  { this._write('info', args); },
  warn(...args)  { this._write('warn', args); },
  error(...args) { this._write('error', args); },
};

const stores = {
  open(name) {
    return {
      save(key, value) {
        __store_save(name, key, typeof value === 'string' ? value : JSON.stringify(value));
      },
      load(key) { return __store_load(name, key); },
      loadAsJson(key) {
        const raw = __store_load(name, key);
        return raw === null ? null : JSON.parse(raw);
      },
      delete(key) { __store_delete(name, key); },
      loadAll() { return JSON.parse(__store_load_all(name)); },
      hasItemWithKey(key) { return __store_has(name, key); },
    };
  },
};

function respond() {
  const builder = {
    withStatusCode(code) { __respond('status', String(code), ''); return builder; },
    withContent(content) { __respond('content', String(content), ''); return builder; },
    withFile(file) { __respond('file', String(file), ''); return builder; },
    withHeader(name, value) { __respond('header', String(name), String(value)); return builder; },
    withEmpty() { __respond('empty', '', ''); return builder; },
    withDelay(ms) { __respond('delay', String(ms), ''); return builder; },
    withDelayRange(min, max) { __respond('delay_range', String(min), String(max)); return builder; },
    withFailure(kind) { __respond('failure', String(kind), ''); return builder; },
    usingDefaultBehaviour() { __respond('use_default', '', ''); return builder; },
    skipDefaultBehaviour() { __respond('skip_default', '', ''); return builder; },
    and() { return builder; },
  };
  return builder;
}

const random = {
  alphabetic(opts = {}) { return __random('alphabetic', JSON.stringify(opts)); },
  alphanumeric(opts = {}) { return __random('alphanumeric', JSON.stringify(opts)); },
  any(opts = {}) { return __random('any', JSON.stringify(opts)); },
  numeric(opts = {}) { return __random('numeric', JSON.stringify(opts)); },
  uuid(opts = {}) { return __random('uuid', JSON.stringify(opts)); },
};
"#;

type PendingOps = Arc<Mutex<Vec<(String, String, String)>>>;

pub fn run(config: &ScriptStepConfig, exchange: &mut Exchange, env: &StepEnv<'_>) -> ApiResult<()> {
    let source = load_source(config, env)?;
    let context_json = request_context_json(exchange);
    let ops: PendingOps = Arc::default();

    let runtime = Runtime::new().map_err(|e| ApiError::step(&format!("js runtime: {}", e)))?;
    let context =
        Context::full(&runtime).map_err(|e| ApiError::step(&format!("js context: {}", e)))?;

    let request_store = exchange.store.clone();
    let factory = env.factory.clone();

    context.with(|ctx| -> ApiResult<()> {
        install_host_api(&ctx, &factory, &request_store, &ops)
            .map_err(|e| ApiError::step(&format!("js host api: {}", e)))?;

        let request_context = ctx
            .json_parse(context_json)
            .catch(&ctx)
            .map_err(|e| ApiError::step(&format!("js context init: {}", e)))?;
        ctx.globals()
            .set("context", request_context)
            .map_err(|e| ApiError::step(&format!("js context init: {}", e)))?;

        ctx.eval::<(), _>(source.as_bytes())
            .catch(&ctx)
            .map_err(|e| ApiError::step(&format!("script error: {}", e)))?;
        Ok(())
    })?;

    let ops = ops.lock().unwrap();
    apply_ops(&ops, exchange);
    Ok(())
}

fn load_source(config: &ScriptStepConfig, env: &StepEnv<'_>) -> ApiResult<String> {
    if let Some(code) = &config.code {
        return Ok(code.clone());
    }
    let file = config
        .file
        .as_deref()
        .ok_or_else(|| ApiError::step("script step has neither code nor file"))?;
    let path = resolve_config_path(env.config_dir, file)?;
    fs::read_to_string(&path).map_err(|e| ApiError::step(&format!("{}: {}", file, e)))
}

/// The request materialised as plain string maps, first value per key.
fn request_context_json(exchange: &Exchange) -> String {
    let request = &exchange.request;
    let mut headers: HashMap<&str, &str> = HashMap::new();
    for (name, value) in request.headers() {
        headers.entry(name.as_str()).or_insert(value.as_str());
    }
    let mut query: HashMap<&str, &str> = HashMap::new();
    for (name, value) in request.query_params() {
        query.entry(name.as_str()).or_insert(value.as_str());
    }
    json!({
        "request": {
            "method": request.method(),
            "path": request.path(),
            "uri": request.uri(),
            "body": request.body_string(),
            "headers": headers,
            "queryParams": query,
            "pathParams": exchange.path_params(),
            "formParams": request.form(),
        }
    })
    .to_string()
}

fn store_for(factory: &StoreFactory, request_store: &Store, name: &str) -> Store {
    if name == REQUEST_STORE {
        request_store.clone()
    } else {
        factory.open(name)
    }
}

fn install_host_api<'js>(
    ctx: &rquickjs::Ctx<'js>,
    factory: &StoreFactory,
    request_store: &Store,
    ops: &PendingOps,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    {
        let factory = factory.clone();
        let request_store = request_store.clone();
        globals.set(
            "__store_save",
            Function::new(ctx.clone(), move |store: String, key: String, value: String| {
                store_for(&factory, &request_store, &store)
                    .save(&key, serde_json::Value::String(value));
            })?,
        )?;
    }
    {
        let factory = factory.clone();
        let request_store = request_store.clone();
        globals.set(
            "__store_load",
            Function::new(ctx.clone(), move |store: String, key: String| -> Option<String> {
                store_for(&factory, &request_store, &store).load_string(&key)
            })?,
        )?;
    }
    {
        let factory = factory.clone();
        let request_store = request_store.clone();
        globals.set(
            "__store_delete",
            Function::new(ctx.clone(), move |store: String, key: String| {
                store_for(&factory, &request_store, &store).delete(&key);
            })?,
        )?;
    }
    {
        let factory = factory.clone();
        let request_store = request_store.clone();
        globals.set(
            "__store_load_all",
            Function::new(ctx.clone(), move |store: String| -> String {
                let entries = store_for(&factory, &request_store, &store).scan("");
                serde_json::Value::Object(entries.into_iter().collect()).to_string()
            })?,
        )?;
    }
    {
        let factory = factory.clone();
        let request_store = request_store.clone();
        globals.set(
            "__store_has",
            Function::new(ctx.clone(), move |store: String, key: String| -> bool {
                store_for(&factory, &request_store, &store).has(&key)
            })?,
        )?;
    }
    {
        let ops = Arc::clone(ops);
        globals.set(
            "__respond",
            Function::new(ctx.clone(), move |op: String, a: String, b: String| {
                ops.lock().unwrap().push((op, a, b));
            })?,
        )?;
    }
    globals.set(
        "__random",
        Function::new(ctx.clone(), |kind: String, opts_json: String| -> String {
            let opts: serde_json::Value =
                serde_json::from_str(&opts_json).unwrap_or(serde_json::Value::Null);
            let length = opts
                .get("length")
                .and_then(|v| v.as_u64())
                .unwrap_or(1) as usize;
            let uppercase = opts
                .get("uppercase")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let chars = opts.get("chars").and_then(|v| v.as_str());
            template::random_value(&kind, length, uppercase, chars).unwrap_or_default()
        })?,
    )?;
    globals.set(
        "__console",
        Function::new(ctx.clone(), |level: String, message: String| {
            match level.as_str() {
                "error" => error!("[script] {}", message),
                "warn" => warn!("[script] {}", message),
                "debug" => debug!("[script] {}", message),
                _ => info!("[script] {}", message),
            }
        })?,
    )?;

    ctx.eval::<(), _>(HOST_SHIM.as_bytes())?;
    Ok(())
}

/// Apply collected `respond()` mutations to the response-state.
fn apply_ops(ops: &[(String, String, String)], exchange: &mut Exchange) {
    let state = &mut exchange.state;
    for (op, a, b) in ops {
        match op.as_str() {
            "status" => {
                if let Ok(code) = a.parse() {
                    state.status = code;
                }
            }
            "content" => state.body = a.clone().into_bytes(),
            "file" => state.file = Some(a.clone()),
            "header" => state.set_header(a, b),
            "empty" => state.body.clear(),
            "delay" => {
                if let Ok(exact) = a.parse() {
                    state.delay = Some(DelayConfig {
                        exact,
                        ..Default::default()
                    });
                }
            }
            "delay_range" => {
                if let (Ok(min), Ok(max)) = (a.parse(), b.parse()) {
                    state.delay = Some(DelayConfig {
                        exact: 0,
                        min,
                        max,
                    });
                }
            }
            "failure" => {
                state.fail = match a.as_str() {
                    "EmptyResponse" => Some(FailureKind::EmptyResponse),
                    "CloseConnection" => Some(FailureKind::CloseConnection),
                    other => {
                        warn!("script requested unknown failure kind {:?}", other);
                        None
                    }
                }
            }
            "use_default" => state.handled = false,
            "skip_default" => state.handled = true,
            other => warn!("ignoring unknown respond op {:?}", other),
        }
    }
}

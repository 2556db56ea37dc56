// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JavaScript isolates on the embedded boa interpreter.
//!
//! A boa `Context` is not `Send`, so every isolate owns a dedicated OS thread
//! that keeps the context alive and serves requests from a channel. Host
//! callables block on the gateway's runtime handle from that thread.
//!
//! Application code is a script whose handler is either the `export default`
//! value or a global `handle` function. The handler receives the request and
//! the version config (without `app_code`) and returns, or resolves to, a
//! `{status, headers?, body}` document. `host.db`, `host.fetch` and
//! `host.log` are available as synchronous globals.

use std::cell::RefCell;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use boa_engine::context::ContextBuilder;
use boa_engine::{Context, JsError, JsNativeError, JsResult, JsString, JsValue, NativeFunction, Source, js_string};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::host::{FetchRequest, HostBindings, LogLevel};
use super::{Isolate, IsolateSpec, IsolateUsage, VmEngine, VmRequest};
use crate::error::{Error, Result};

/// Global the `export default` value is bound to.
const HANDLER_GLOBAL: &str = "__tenantgateHandler";

/// Backward jumps allowed per evaluation before the script is aborted.
const LOOP_ITERATION_LIMIT: u64 = 50_000_000;

const RECURSION_LIMIT: usize = 512;

/// Stack of an isolate thread; the interpreter recurses deeply on nested code.
const THREAD_STACK_BYTES: usize = 16 * 1024 * 1024;

const PRELUDE: &str = r#"
globalThis.host = Object.freeze({
  db: (sql, params) => JSON.parse(__tenantgate_db(String(sql), JSON.stringify(params ?? []))),
  fetch: (request) => JSON.parse(__tenantgate_fetch(JSON.stringify(typeof request === "string" ? { url: request } : request))),
  log: (level, ...message) => __tenantgate_log(String(level), message.map(String).join(" ")),
});
"#;

const COLLECT: &str = r#"
(function () {
  const state = globalThis.__tenantgateState;
  if (!state.done) return JSON.stringify({ pending: true });
  if ("error" in state) return JSON.stringify({ error: state.error });
  return JSON.stringify({ value: state.value ?? null });
})()
"#;

struct HostContext {
    bindings: HostBindings,
    runtime: Handle,
}

thread_local! {
    static HOST: RefCell<Option<HostContext>> = const { RefCell::new(None) };
}

struct Job {
    request: VmRequest,
    reply: oneshot::Sender<Result<Value>>,
}

/// Engine that boots boa-backed isolates.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptEngine;

#[async_trait]
impl VmEngine for ScriptEngine {
    async fn create(&self, spec: IsolateSpec, host: HostBindings) -> Result<Arc<dyn Isolate>> {
        let runtime = Handle::current();
        let (boot_tx, boot_rx) = oneshot::channel();
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let cpu_micros = Arc::new(AtomicU64::new(0));
        let thread_cpu = cpu_micros.clone();
        let workspace_id = spec.workspace_id;

        std::thread::Builder::new()
            .name("tg-isolate".to_string())
            .stack_size(THREAD_STACK_BYTES)
            .spawn(move || {
                HOST.with(|cell| {
                    *cell.borrow_mut() = Some(HostContext {
                        bindings: host,
                        runtime,
                    })
                });
                serve(spec, boot_tx, job_rx, &thread_cpu);
                HOST.with(|cell| cell.borrow_mut().take());
            })?;

        boot_rx
            .await
            .map_err(|_| Error::VmFailure("isolate thread exited during boot".into()))??;
        debug!(workspace_id = %workspace_id, "Script isolate booted");

        Ok(Arc::new(ScriptIsolate {
            jobs: Mutex::new(Some(job_tx)),
            cpu_micros,
        }))
    }
}

struct ScriptIsolate {
    jobs: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    cpu_micros: Arc<AtomicU64>,
}

#[async_trait]
impl Isolate for ScriptIsolate {
    async fn handle(&self, request: &VmRequest) -> Result<Value> {
        let sender = self
            .jobs
            .lock()
            .ok()
            .and_then(|jobs| jobs.clone())
            .ok_or_else(|| Error::VmFailure("isolate terminated".into()))?;
        let (reply, answer) = oneshot::channel();
        sender
            .send(Job {
                request: request.clone(),
                reply,
            })
            .map_err(|_| Error::VmFailure("isolate thread exited".into()))?;
        answer
            .await
            .map_err(|_| Error::VmFailure("isolate thread exited".into()))?
    }

    /// The interpreter exposes no heap statistics; only CPU time is reported.
    fn usage(&self) -> IsolateUsage {
        IsolateUsage {
            memory_bytes: 0,
            cpu_time: Duration::from_micros(self.cpu_micros.load(Ordering::Relaxed)),
        }
    }

    fn terminate(&self) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.take();
        }
    }
}

/// Body of an isolate thread: boot, then answer jobs until the channel closes.
fn serve(
    spec: IsolateSpec,
    boot: oneshot::Sender<Result<()>>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    cpu_micros: &AtomicU64,
) {
    let config = handler_config(&spec.config);
    let mut context = match boot_context(&spec.code) {
        Ok(context) => context,
        Err(e) => {
            let _ = boot.send(Err(e));
            return;
        }
    };
    if boot.send(Ok(())).is_err() {
        return;
    }

    while let Some(job) = jobs.blocking_recv() {
        let started = Instant::now();
        let result = invoke(&mut context, &job.request, &config);
        cpu_micros.fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        if job.reply.send(result).is_err() {
            warn!(workspace_id = %spec.workspace_id, "Isolate answer arrived after its deadline");
        }
    }
    debug!(workspace_id = %spec.workspace_id, "Script isolate stopped");
}

fn boot_context(code: &str) -> Result<Context> {
    let mut context = ContextBuilder::new()
        .build()
        .map_err(|e| vm_failure("interpreter", e))?;
    context
        .runtime_limits_mut()
        .set_loop_iteration_limit(LOOP_ITERATION_LIMIT);
    context.runtime_limits_mut().set_recursion_limit(RECURSION_LIMIT);

    register(&mut context, js_string!("__tenantgate_db"), 2, host_db)?;
    register(&mut context, js_string!("__tenantgate_fetch"), 1, host_fetch)?;
    register(&mut context, js_string!("__tenantgate_log"), 2, host_log)?;
    context
        .eval(Source::from_bytes(PRELUDE))
        .map_err(|e| vm_failure("prelude", e))?;

    context
        .eval(Source::from_bytes(&bind_default_export(code)))
        .map_err(|e| vm_failure("failed to compile application code", e))?;
    context.run_jobs();

    let lookup = format!("typeof (globalThis.{HANDLER_GLOBAL} ?? globalThis.handle) === \"function\"");
    let has_handler = context
        .eval(Source::from_bytes(&lookup))
        .map_err(|e| vm_failure("application code", e))?
        .to_boolean();
    if !has_handler {
        return Err(Error::VmFailure(
            "application code exports no handler function".into(),
        ));
    }
    Ok(context)
}

fn invoke(context: &mut Context, request: &VmRequest, config: &str) -> Result<Value> {
    let request = js_literal(&serde_json::to_string(request)?)?;
    let config = js_literal(config)?;
    let start = format!(
        r#"(function () {{
  const handler = globalThis.{HANDLER_GLOBAL} ?? globalThis.handle;
  const state = {{ done: false }};
  globalThis.__tenantgateState = state;
  Promise.resolve()
    .then(() => handler(JSON.parse({request}), JSON.parse({config})))
    .then(
      (value) => {{ state.done = true; state.value = value; }},
      (error) => {{ state.done = true; state.error = String((error && error.stack) || error); }},
    );
}})()"#
    );
    context
        .eval(Source::from_bytes(&start))
        .map_err(|e| vm_failure("handler", e))?;
    context.run_jobs();

    let answer = context
        .eval(Source::from_bytes(COLLECT))
        .map_err(|e| vm_failure("handler", e))?;
    let text = answer
        .to_string(context)
        .map_err(|e| vm_failure("handler", e))?
        .to_std_string_escaped();
    let mut outcome: Value = serde_json::from_str(&text)
        .map_err(|e| Error::VmFailure(format!("handler returned non-JSON output: {e}")))?;
    if let Some(error) = outcome.get("error") {
        return Err(Error::VmFailure(format!("handler threw: {}", error.as_str().unwrap_or("unknown error"))));
    }
    match outcome.get_mut("value") {
        Some(value) => Ok(value.take()),
        None => Err(Error::VmFailure("handler did not settle".into())),
    }
}

/// Rewrite the first `export default` into an assignment to [`HANDLER_GLOBAL`].
fn bind_default_export(code: &str) -> String {
    const EXPORT: &str = "export default";
    match code.find(EXPORT) {
        Some(at) => format!(
            "{}globalThis.{HANDLER_GLOBAL} ={}",
            &code[..at],
            &code[at + EXPORT.len()..]
        ),
        None => code.to_string(),
    }
}

/// Version config as handed to the handler, without the code itself.
fn handler_config(config: &Value) -> String {
    let mut config = config.clone();
    if let Some(object) = config.as_object_mut() {
        object.remove("app_code");
    }
    config.to_string()
}

/// JSON text as a JavaScript string literal.
fn js_literal(json: &str) -> Result<String> {
    Ok(serde_json::to_string(json)?)
}

fn register(
    context: &mut Context,
    name: JsString,
    length: usize,
    body: fn(&JsValue, &[JsValue], &mut Context) -> JsResult<JsValue>,
) -> Result<()> {
    context
        .register_global_callable(name, length, NativeFunction::from_fn_ptr(body))
        .map_err(|e| vm_failure("host binding", e))
}

fn vm_failure(what: &str, err: JsError) -> Error {
    Error::VmFailure(format!("{what}: {err}"))
}

fn js_error(err: impl Display) -> JsError {
    JsNativeError::error()
        .with_message(err.to_string())
        .into()
}

fn arg_string(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    match args.get(index) {
        Some(value) if !value.is_undefined() => Ok(value.to_string(context)?.to_std_string_escaped()),
        _ => Ok(String::new()),
    }
}

fn with_host<T>(f: impl FnOnce(&HostContext) -> JsResult<T>) -> JsResult<T> {
    HOST.with(|cell| match cell.borrow().as_ref() {
        Some(host) => f(host),
        None => Err(js_error("host bindings are not available")),
    })
}

fn json_value(text: &str) -> JsValue {
    JsValue::from(JsString::from(text))
}

fn host_db(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let sql = arg_string(args, 0, context)?;
    let params: Vec<Value> = serde_json::from_str(&arg_string(args, 1, context)?).map_err(js_error)?;
    let result = with_host(|host| {
        host.runtime
            .block_on(host.bindings.db_query(&sql, &params))
            .map_err(js_error)
    })?;
    Ok(json_value(&serde_json::to_string(&result).map_err(js_error)?))
}

fn host_fetch(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let request: FetchRequest = serde_json::from_str(&arg_string(args, 0, context)?).map_err(js_error)?;
    let response = with_host(|host| {
        host.runtime
            .block_on(host.bindings.fetch(request))
            .map_err(js_error)
    })?;
    Ok(json_value(&serde_json::to_string(&response).map_err(js_error)?))
}

fn host_log(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let level = arg_string(args, 0, context)?;
    let message = arg_string(args, 1, context)?;
    let level = serde_json::from_value(Value::String(level.to_ascii_lowercase())).unwrap_or(LogLevel::Info);
    with_host(|host| {
        host.bindings.log(level, &message);
        Ok(JsValue::undefined())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use serde_json::json;
    use tempfile::TempDir;
    use uuid::Uuid;

    use crate::config::VmSettings;
    use crate::store::WorkspaceVersion;
    use crate::vm::{SqliteWorkspaceDb, VmPool};

    fn version(code: &str) -> WorkspaceVersion {
        WorkspaceVersion {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            version: 1,
            ui_schema: json!({}),
            db_schema: json!({}),
            config: json!({ "app_code": code, "greeting": "hello" }),
            workflow_id: None,
            changelog: None,
            created_by: Uuid::new_v4(),
            created_at: crate::time::now(),
        }
    }

    fn request(method: &str, path: &str, body: &[u8]) -> VmRequest {
        VmRequest::from_parts(method, path, BTreeMap::new(), Vec::new(), body, None).unwrap()
    }

    fn pool(dir: &TempDir) -> VmPool {
        VmPool::new(
            Arc::new(ScriptEngine),
            Arc::new(SqliteWorkspaceDb::new(dir.path())),
            VmSettings::default(),
        )
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_default_export_handles_request() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir);
        let v = version(
            r#"
            const double = (n) => n * 2;
            export default (req, config) => ({
              status: 201,
              headers: { "x-handled-by": "script" },
              body: { path: req.path, method: req.method, doubled: double(req.body.n), greeting: config.greeting, code: config.app_code ?? null },
            });
            "#,
        );

        let response = pool
            .handle(&v, &request("post", "/orders", br#"{"n": 21}"#), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(response.headers["x-handled-by"], "script");
        assert_eq!(
            response.body,
            json!({ "path": "/orders", "method": "POST", "doubled": 42, "greeting": "hello", "code": null })
        );
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_handler_and_global_state_survive_requests() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir);
        let v = version(
            r#"
            let hits = 0;
            async function handle(req) {
              hits += 1;
              const value = await Promise.resolve(hits);
              return { status: 200, body: { hits: value } };
            }
            "#,
        );

        for expected in 1..=3 {
            let response = pool
                .handle(&v, &request("GET", "/", b""), Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(response.body, json!({ "hits": expected }));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_host_db_is_scoped_to_workspace() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir);
        let v = version(
            r#"
            export default (req) => {
              host.db("CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY, text TEXT)");
              if (req.method === "POST") {
                host.db("INSERT INTO notes (text) VALUES (?)", [req.body.text]);
              }
              host.log("info", "listing notes");
              const result = host.db("SELECT text FROM notes ORDER BY id");
              return { status: 200, body: result.rows.map((row) => row.text) };
            };
            "#,
        );

        pool.handle(&v, &request("POST", "/notes", br#"{"text": "first"}"#), Duration::from_secs(5))
            .await
            .unwrap();
        let listed = pool
            .handle(&v, &request("GET", "/notes", b""), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(listed.body, json!(["first"]));
        assert!(SqliteWorkspaceDb::new(dir.path()).exists(v.workspace_id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_thrown_error_fails_and_evicts() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir);
        let v = version(r#"export default () => { throw new Error("boom"); };"#);

        let err = pool
            .handle(&v, &request("GET", "/", b""), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::VmFailure(ref message) if message.contains("boom")));
        assert!(pool.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_malformed_code_fails_boot() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir);

        let syntax = pool
            .handle(&version("export default (req => {"), &request("GET", "/", b""), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(syntax, Error::VmFailure(_)));

        let no_handler = pool
            .handle(&version("const x = 1;"), &request("GET", "/", b""), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(no_handler, Error::VmFailure(ref message) if message.contains("no handler")));
        assert!(pool.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalid_status_is_rejected() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir);
        let v = version(r#"export default () => ({ status: 42, body: null });"#);

        let err = pool
            .handle(&v, &request("GET", "/", b""), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VmFailure(ref message) if message.contains("invalid status")));
    }

    #[test]
    fn test_bind_default_export() {
        assert_eq!(
            bind_default_export("const a = 1;\nexport default function handle() {}"),
            format!("const a = 1;\nglobalThis.{HANDLER_GLOBAL} = function handle() {{}}")
        );
        assert_eq!(bind_default_export("function handle() {}"), "function handle() {}");
    }
}

// Copyright 2018-2023 the Deno authors. All rights reserved. MIT license.

//! Shared test rigs: a scriptable in-process engine and a scripted HTTP
//! listener standing in for the fallback service.

use crate::engine::CompatFlags;
use crate::engine::CompileOrigin;
use crate::engine::EngineLock;
use crate::engine::InstantiateModuleOptions;
use crate::engine::JsPromise;
use crate::engine::JsValue;
use crate::engine::ModuleHandle;
use crate::error::generic_error;
use crate::error::type_error;
use crate::error::AnyError;
use crate::modules::DynamicImportHandler;
use crate::modules::ModuleInfo;
use crate::modules::ModuleRegistry;
use crate::modules::ResolveMethod;
use crate::modules::ResolveOption;
use crate::path::Path;
use std::collections::HashMap;
use std::io::Read;
use std::io::Write;
use std::net::Shutdown;
use std::net::TcpListener;
use std::net::TcpStream;
use std::rc::Rc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

#[derive(Debug)]
pub(crate) struct MockModule {
  pub name: String,
  pub source: Option<String>,
  pub synthetic_exports: Option<Vec<String>>,
  pub compile_cache: Option<Vec<u8>>,
  pub origin: Option<CompileOrigin>,
  pub evaluated: bool,
  pub pending_top_level_await: bool,
  pub exports: HashMap<String, u64>,
  namespace_value: Option<u64>,
  default_value: Option<u64>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum MockValue {
  Str(String),
  Bytes(Vec<u8>),
  Json(serde_json::Value),
  Wasm(usize),
  Function { name: String, source: String },
  Error(String),
  Namespace(u64),
  DefaultExport(u64),
  Undefined,
}

#[derive(Debug, PartialEq)]
pub(crate) enum MockPromiseState {
  Resolved(u64),
  Rejected(u64),
}

/// An engine whose modules and values are plain bookkeeping, so tests can
/// assert on exactly what the registry asked for.
pub(crate) struct MockEngine {
  next_id: u64,
  pub modules: HashMap<u64, MockModule>,
  pub values: HashMap<u64, MockValue>,
  pub promises: HashMap<u64, MockPromiseState>,
  pub compile_calls: usize,
  pub called_functions: Vec<u64>,
  pub flags: CompatFlags,
  slots: [*mut (); 8],
}

impl MockEngine {
  pub fn new() -> MockEngine {
    MockEngine {
      next_id: 0,
      modules: HashMap::new(),
      values: HashMap::new(),
      promises: HashMap::new(),
      compile_calls: 0,
      called_functions: Vec::new(),
      flags: CompatFlags::default(),
      slots: [std::ptr::null_mut(); 8],
    }
  }

  fn mint(&mut self) -> u64 {
    self.next_id += 1;
    self.next_id
  }

  pub fn module(&self, handle: &ModuleHandle) -> &MockModule {
    self.modules.get(&handle.raw()).expect("unknown module handle")
  }

  pub fn source_of(&self, handle: &ModuleHandle) -> Option<&str> {
    self.module(handle).source.as_deref()
  }

  pub fn module_count(&self) -> usize {
    self.modules.len()
  }

  pub fn value(&self, value: &JsValue) -> &MockValue {
    self.values.get(&value.raw()).expect("unknown value handle")
  }

  pub fn rejection_message(&self, promise: &JsPromise) -> Option<&str> {
    match self.promises.get(&promise.raw())? {
      MockPromiseState::Rejected(value) => match self.values.get(value)? {
        MockValue::Error(message) => Some(message),
        _ => None,
      },
      MockPromiseState::Resolved(_) => None,
    }
  }

  pub fn resolution_value(&self, promise: &JsPromise) -> Option<JsValue> {
    match self.promises.get(&promise.raw())? {
      MockPromiseState::Resolved(value) => Some(JsValue::from_raw(*value)),
      MockPromiseState::Rejected(_) => None,
    }
  }

  /// The module a namespace value belongs to.
  pub fn namespace_module(&self, value: &JsValue) -> Option<ModuleHandle> {
    match self.values.get(&value.raw())? {
      MockValue::Namespace(module) => Some(ModuleHandle::from_raw(*module)),
      _ => None,
    }
  }
}

impl EngineLock for MockEngine {
  fn compile_module(
    &mut self,
    name: &str,
    source: &str,
    compile_cache: Option<&[u8]>,
    origin: CompileOrigin,
  ) -> Result<ModuleHandle, AnyError> {
    self.compile_calls += 1;
    if source.contains("syntax_error") {
      return Err(type_error(format!("Unexpected token in {name}")));
    }
    let id = self.mint();
    self.modules.insert(
      id,
      MockModule {
        name: name.to_string(),
        source: Some(source.to_string()),
        synthetic_exports: None,
        compile_cache: compile_cache.map(<[u8]>::to_vec),
        origin: Some(origin),
        evaluated: false,
        pending_top_level_await: source.contains("await"),
        exports: HashMap::new(),
        namespace_value: None,
        default_value: None,
      },
    );
    Ok(ModuleHandle::from_raw(id))
  }

  fn create_synthetic_module(
    &mut self,
    name: &str,
    export_names: &[String],
  ) -> Result<ModuleHandle, AnyError> {
    let id = self.mint();
    self.modules.insert(
      id,
      MockModule {
        name: name.to_string(),
        source: None,
        synthetic_exports: Some(export_names.to_vec()),
        compile_cache: None,
        origin: None,
        evaluated: false,
        pending_top_level_await: false,
        exports: HashMap::new(),
        namespace_value: None,
        default_value: None,
      },
    );
    Ok(ModuleHandle::from_raw(id))
  }

  fn instantiate_module(
    &mut self,
    module: &ModuleHandle,
    options: InstantiateModuleOptions,
  ) -> Result<(), AnyError> {
    let module = self
      .modules
      .get_mut(&module.raw())
      .ok_or_else(|| generic_error("unknown module handle"))?;
    if options == InstantiateModuleOptions::NoTopLevelAwait
      && module.pending_top_level_await
    {
      return Err(generic_error(format!(
        "Top-level await is not permitted in {}",
        module.name
      )));
    }
    module.evaluated = true;
    Ok(())
  }

  fn module_namespace(&mut self, module: &ModuleHandle) -> JsValue {
    let raw = module.raw();
    if let Some(value) =
      self.modules.get(&raw).and_then(|m| m.namespace_value)
    {
      return JsValue::from_raw(value);
    }
    let id = self.mint();
    self.values.insert(id, MockValue::Namespace(raw));
    if let Some(module) = self.modules.get_mut(&raw) {
      module.namespace_value = Some(id);
    }
    JsValue::from_raw(id)
  }

  fn module_default_export(
    &mut self,
    module: &ModuleHandle,
  ) -> Result<JsValue, AnyError> {
    let raw = module.raw();
    if self.modules.get(&raw).is_none() {
      return Err(generic_error("unknown module handle"));
    }
    if let Some(value) = self.modules[&raw].default_value {
      return Ok(JsValue::from_raw(value));
    }
    let id = self.mint();
    self.values.insert(id, MockValue::DefaultExport(raw));
    if let Some(module) = self.modules.get_mut(&raw) {
      module.default_value = Some(id);
    }
    Ok(JsValue::from_raw(id))
  }

  fn set_module_export(
    &mut self,
    module: &ModuleHandle,
    name: &str,
    value: &JsValue,
  ) -> Result<(), AnyError> {
    let module = self
      .modules
      .get_mut(&module.raw())
      .ok_or_else(|| generic_error("unknown module handle"))?;
    module.exports.insert(name.to_string(), value.raw());
    Ok(())
  }

  fn compile_wasm(&mut self, bytes: &[u8]) -> Result<JsValue, AnyError> {
    if !bytes.starts_with(b"\0asm") {
      return Err(type_error("Invalid WebAssembly module"));
    }
    let id = self.mint();
    self.values.insert(id, MockValue::Wasm(bytes.len()));
    Ok(JsValue::from_raw(id))
  }

  fn parse_json(&mut self, source: &str) -> Result<JsValue, AnyError> {
    let value: serde_json::Value = serde_json::from_str(source)
      .map_err(|err| type_error(format!("Invalid JSON: {err}")))?;
    let id = self.mint();
    self.values.insert(id, MockValue::Json(value));
    Ok(JsValue::from_raw(id))
  }

  fn wrap_bytes(&mut self, bytes: Vec<u8>) -> JsValue {
    let id = self.mint();
    self.values.insert(id, MockValue::Bytes(bytes));
    JsValue::from_raw(id)
  }

  fn wrap_string(&mut self, text: &str) -> JsValue {
    let id = self.mint();
    self.values.insert(id, MockValue::Str(text.to_string()));
    JsValue::from_raw(id)
  }

  fn compile_function(
    &mut self,
    name: &str,
    source: &str,
    _receiver: &JsValue,
  ) -> Result<JsValue, AnyError> {
    if source.contains("syntax_error") {
      return Err(type_error(format!("Unexpected token in {name}")));
    }
    let id = self.mint();
    self.values.insert(
      id,
      MockValue::Function {
        name: name.to_string(),
        source: source.to_string(),
      },
    );
    Ok(JsValue::from_raw(id))
  }

  fn call_function(&mut self, function: &JsValue) -> Result<JsValue, AnyError> {
    match self.values.get(&function.raw()) {
      Some(MockValue::Function { .. }) => {
        self.called_functions.push(function.raw());
        let id = self.mint();
        self.values.insert(id, MockValue::Undefined);
        Ok(JsValue::from_raw(id))
      }
      _ => Err(type_error("value is not a function")),
    }
  }

  fn error_value(&mut self, message: &str) -> JsValue {
    let id = self.mint();
    self.values.insert(id, MockValue::Error(message.to_string()));
    JsValue::from_raw(id)
  }

  fn resolved_promise(&mut self, value: &JsValue) -> JsPromise {
    let id = self.mint();
    self
      .promises
      .insert(id, MockPromiseState::Resolved(value.raw()));
    JsPromise::from_raw(id)
  }

  fn rejected_promise(&mut self, reason: &JsValue) -> JsPromise {
    let id = self.mint();
    self
      .promises
      .insert(id, MockPromiseState::Rejected(reason.raw()));
    JsPromise::from_raw(id)
  }

  fn embedder_slot(&self, index: usize) -> *mut () {
    self.slots.get(index).copied().unwrap_or(std::ptr::null_mut())
  }

  fn set_embedder_slot(&mut self, index: usize, ptr: *mut ()) {
    self.slots[index] = ptr;
  }

  fn compat_flags(&self) -> CompatFlags {
    self.flags
  }
}

pub(crate) fn path(s: &str) -> Path {
  Path::parse(s).unwrap()
}

/// Compiles `source` with the engine and registers it as a worker-bundle
/// module, the way an embedder assembles a worker.
pub(crate) fn add_bundle_source(
  js: &mut MockEngine,
  registry: &mut ModuleRegistry,
  specifier: &str,
  source: &str,
) -> ModuleHandle {
  let name = path(specifier).to_string(false);
  let info =
    ModuleInfo::from_source(js, &name, source, None, CompileOrigin::Bundle)
      .unwrap();
  let handle = info.handle().clone();
  registry.add(path(specifier), info);
  handle
}

pub(crate) fn resolve_handle_for(
  js: &mut MockEngine,
  registry: &mut ModuleRegistry,
  specifier: &str,
  option: ResolveOption,
) -> Option<ModuleHandle> {
  registry
    .resolve(
      js,
      &path(specifier),
      None,
      option,
      ResolveMethod::Import,
      None,
    )
    .unwrap()
    .map(|info| info.handle().clone())
}

/// Handler that runs the thunk immediately and resolves with its value.
pub(crate) fn passthrough_handler() -> DynamicImportHandler {
  Rc::new(|js, thunk| {
    let value = thunk(js)?;
    Ok(js.resolved_promise(&value))
  })
}

/// An ES-module fallback-service response body.
pub(crate) fn module_body(name: &str, source: &str) -> String {
  serde_json::to_string(&serde_json::json!({
    "name": name,
    "esModule": source,
  }))
  .unwrap()
}

#[derive(Debug)]
pub(crate) struct RecordedRequest {
  pub method: String,
  pub target: String,
  pub headers: Vec<(String, String)>,
  pub body: String,
}

impl RecordedRequest {
  pub fn header(&self, name: &str) -> Option<&str> {
    let name = name.to_ascii_lowercase();
    self
      .headers
      .iter()
      .find(|(key, _)| *key == name)
      .map(|(_, value)| value.as_str())
  }
}

#[derive(Clone, Debug)]
pub(crate) enum TestResponse {
  /// 200 with the given body.
  Ok(String),
  /// 200 with an empty body.
  Empty,
  /// 301 with the given `Location`.
  Redirect(String),
  /// The given status with an empty body.
  Status(u16),
  /// Read the request, then close the connection without responding.
  CloseAbruptly,
  /// 200 with a module body echoing the requested specifier as the name.
  EchoModule,
}

/// A scripted HTTP/1.1 listener. Each connection carries one request; the
/// scripted responses are consumed in order, and anything past the script
/// gets a 404.
pub(crate) struct TestServer {
  pub addr: String,
  pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
  hit_count: Arc<AtomicUsize>,
}

impl TestServer {
  pub fn start(script: Vec<TestResponse>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let requests: Arc<Mutex<Vec<RecordedRequest>>> =
      Arc::new(Mutex::new(Vec::new()));
    let hit_count = Arc::new(AtomicUsize::new(0));

    let thread_requests = requests.clone();
    let thread_hits = hit_count.clone();
    std::thread::spawn(move || {
      let mut script = script.into_iter();
      for stream in listener.incoming() {
        let Ok(mut stream) = stream else { continue };
        let Some(request) = read_http_request(&mut stream) else {
          continue;
        };
        thread_hits.fetch_add(1, Ordering::SeqCst);
        let response =
          script.next().unwrap_or(TestResponse::Status(404));
        let reply = match &response {
          TestResponse::Ok(body) => http_response(200, &[], body),
          TestResponse::Empty => http_response(200, &[], ""),
          TestResponse::Redirect(target) => {
            http_response(301, &[("location", target)], "")
          }
          TestResponse::Status(status) => http_response(*status, &[], ""),
          TestResponse::CloseAbruptly => {
            thread_requests.lock().unwrap().push(request);
            let _ = stream.shutdown(Shutdown::Both);
            continue;
          }
          TestResponse::EchoModule => {
            let body = echo_module_body(&request);
            http_response(200, &[], &body)
          }
        };
        thread_requests.lock().unwrap().push(request);
        let _ = stream.write_all(reply.as_bytes());
        let _ = stream.flush();
        let _ = stream.shutdown(Shutdown::Both);
      }
    });

    TestServer {
      addr,
      requests,
      hit_count,
    }
  }

  pub fn hits(&self) -> usize {
    self.hit_count.load(Ordering::SeqCst)
  }
}

fn echo_module_body(request: &RecordedRequest) -> String {
  let name = if request.method == "GET" {
    let specifier = query_params(&request.target)
      .into_iter()
      .find(|(name, _)| name == "specifier")
      .map(|(_, value)| value)
      .unwrap_or_default();
    specifier
      .strip_prefix('/')
      .map(str::to_string)
      .unwrap_or(specifier)
  } else {
    serde_json::from_str::<serde_json::Value>(&request.body)
      .ok()
      .and_then(|body| body["specifier"].as_str().map(str::to_string))
      .unwrap_or_default()
  };
  serde_json::to_string(&serde_json::json!({
    "name": name,
    "esModule": "export default 1",
  }))
  .unwrap()
}

fn http_response(
  status: u16,
  extra_headers: &[(&str, &str)],
  body: &str,
) -> String {
  let reason = match status {
    200 => "OK",
    301 => "Moved Permanently",
    404 => "Not Found",
    _ => "Whatever",
  };
  let mut response = format!(
    "HTTP/1.1 {status} {reason}\r\ncontent-length: {}\r\nconnection: close\r\n",
    body.len()
  );
  for (name, value) in extra_headers {
    response.push_str(&format!("{name}: {value}\r\n"));
  }
  response.push_str("\r\n");
  response.push_str(body);
  response
}

fn read_http_request(stream: &mut TcpStream) -> Option<RecordedRequest> {
  let mut buf = Vec::new();
  let mut chunk = [0u8; 1024];
  let header_end = loop {
    match stream.read(&mut chunk) {
      Ok(0) => return None,
      Ok(n) => {
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
          break pos;
        }
      }
      Err(_) => return None,
    }
  };

  let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
  let mut lines = head.lines();
  let request_line = lines.next()?;
  let mut parts = request_line.split_whitespace();
  let method = parts.next()?.to_string();
  let target = parts.next()?.to_string();

  let mut headers = Vec::new();
  let mut content_length = 0usize;
  for line in lines {
    if let Some((name, value)) = line.split_once(':') {
      let name = name.trim().to_ascii_lowercase();
      let value = value.trim().to_string();
      if name == "content-length" {
        content_length = value.parse().unwrap_or(0);
      }
      headers.push((name, value));
    }
  }

  let mut body = buf[header_end + 4..].to_vec();
  while body.len() < content_length {
    match stream.read(&mut chunk) {
      Ok(0) => break,
      Ok(n) => body.extend_from_slice(&chunk[..n]),
      Err(_) => break,
    }
  }
  body.truncate(content_length);

  Some(RecordedRequest {
    method,
    target,
    headers,
    body: String::from_utf8_lossy(&body).to_string(),
  })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
  haystack
    .windows(needle.len())
    .position(|window| window == needle)
}

pub(crate) fn query_params(target: &str) -> Vec<(String, String)> {
  let query = target.split_once('?').map(|(_, q)| q).unwrap_or("");
  query
    .split('&')
    .filter(|pair| !pair.is_empty())
    .map(|pair| {
      let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
      (percent_decode(name), percent_decode(value))
    })
    .collect()
}

fn percent_decode(encoded: &str) -> String {
  let bytes = encoded.as_bytes();
  let mut out = Vec::with_capacity(bytes.len());
  let mut i = 0;
  while i < bytes.len() {
    match bytes[i] {
      b'%' if i + 2 < bytes.len() => {
        let hex = &encoded[i + 1..i + 3];
        match u8::from_str_radix(hex, 16) {
          Ok(byte) => {
            out.push(byte);
            i += 3;
            continue;
          }
          Err(_) => out.push(b'%'),
        }
        i += 1;
      }
      b'+' => {
        out.push(b' ');
        i += 1;
      }
      byte => {
        out.push(byte);
        i += 1;
      }
    }
  }
  String::from_utf8_lossy(&out).to_string()
}

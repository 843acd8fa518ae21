// Copyright 2018-2023 the Deno authors. All rights reserved. MIT license.

//! The narrow interface through which the registry talks to the embedding
//! JavaScript engine. The engine itself (isolate, contexts, promise
//! plumbing) stays on the other side of [`EngineLock`]; the registry only
//! sees opaque identity handles.

use crate::error::AnyError;

/// Identity of an engine-side ES module. Handles compare and hash by
/// identity: two handles are equal iff they refer to the same live module
/// object, which is what the registry's reverse lookup relies on.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ModuleHandle(u64);

impl ModuleHandle {
  pub fn from_raw(raw: u64) -> ModuleHandle {
    ModuleHandle(raw)
  }

  pub fn raw(&self) -> u64 {
    self.0
  }
}

/// Identity of an arbitrary engine-side value.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct JsValue(u64);

impl JsValue {
  pub fn from_raw(raw: u64) -> JsValue {
    JsValue(raw)
  }

  pub fn raw(&self) -> u64 {
    self.0
  }
}

/// Identity of an engine-side promise.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JsPromise(u64);

impl JsPromise {
  pub fn from_raw(raw: u64) -> JsPromise {
    JsPromise(raw)
  }

  pub fn raw(&self) -> u64 {
    self.0
  }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum InstantiateModuleOptions {
  /// Allows a pending top-level await in the module when evaluated. The
  /// engine drains the microtask queue once to give it a chance to settle.
  #[default]
  Default,
  /// Fails if the module evaluation results in a pending promise.
  NoTopLevelAwait,
}

/// How compiled source should be treated by the engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompileOrigin {
  /// The content comes from a worker bundle.
  Bundle,
  /// The content is a built-in module: an immutable, process-lifetime
  /// buffer whose compilation data may be cached.
  Builtin,
}

/// Compatibility switches consulted during dynamic import.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompatFlags {
  /// Rewrite known bare Node.js specifiers (`fs`) to `node:` form.
  pub node_compat: bool,
  /// Route `node:process` to the v2 process implementation.
  pub node_process_v2: bool,
  /// Reject dynamic imports that carry import attributes.
  pub reject_unknown_import_attributes: bool,
}

/// The context embedder-data slot reserved for the module registry pointer.
pub const REGISTRY_EMBEDDER_SLOT: usize = 2;

/// Exclusive access to the isolate, plus the handful of engine operations
/// module resolution needs. Everything here is synchronous; the registry is
/// only ever touched while a lock is held.
pub trait EngineLock {
  /// Compiles ES module source text under the given name, optionally fed
  /// with a compilation-cache blob from an earlier run.
  fn compile_module(
    &mut self,
    name: &str,
    source: &str,
    compile_cache: Option<&[u8]>,
    origin: CompileOrigin,
  ) -> Result<ModuleHandle, AnyError>;

  /// Creates a synthetic module whose exports will later be populated by
  /// the registry's synthetic evaluator.
  fn create_synthetic_module(
    &mut self,
    name: &str,
    export_names: &[String],
  ) -> Result<ModuleHandle, AnyError>;

  /// Instantiates and evaluates the module. Under
  /// [`InstantiateModuleOptions::Default`] the engine drains the microtask
  /// queue once so a pending top-level await can settle; under
  /// `NoTopLevelAwait` a still-pending evaluation promise is an error.
  fn instantiate_module(
    &mut self,
    module: &ModuleHandle,
    options: InstantiateModuleOptions,
  ) -> Result<(), AnyError>;

  fn module_namespace(&mut self, module: &ModuleHandle) -> JsValue;

  fn module_default_export(
    &mut self,
    module: &ModuleHandle,
  ) -> Result<JsValue, AnyError>;

  fn set_module_export(
    &mut self,
    module: &ModuleHandle,
    name: &str,
    value: &JsValue,
  ) -> Result<(), AnyError>;

  fn compile_wasm(&mut self, bytes: &[u8]) -> Result<JsValue, AnyError>;

  fn parse_json(&mut self, source: &str) -> Result<JsValue, AnyError>;

  fn wrap_bytes(&mut self, bytes: Vec<u8>) -> JsValue;

  fn wrap_string(&mut self, text: &str) -> JsValue;

  /// Compiles `source` as a function body with `receiver` providing the
  /// scope object, the way a CommonJS wrapper function is built.
  fn compile_function(
    &mut self,
    name: &str,
    source: &str,
    receiver: &JsValue,
  ) -> Result<JsValue, AnyError>;

  fn call_function(&mut self, function: &JsValue) -> Result<JsValue, AnyError>;

  /// Constructs an engine error value with the given message.
  fn error_value(&mut self, message: &str) -> JsValue;

  fn resolved_promise(&mut self, value: &JsValue) -> JsPromise;

  fn rejected_promise(&mut self, reason: &JsValue) -> JsPromise;

  /// Per-context embedder data. Slot [`REGISTRY_EMBEDDER_SLOT`] is reserved
  /// for the module registry pointer.
  fn embedder_slot(&self, index: usize) -> *mut ();

  fn set_embedder_slot(&mut self, index: usize, ptr: *mut ());

  fn compat_flags(&self) -> CompatFlags;
}

/// Observes module compilation, for timing and diagnostics.
pub trait CompilationObserver {
  fn on_module_compile(&self, _name: &str, _origin: CompileOrigin) {}
  fn on_wasm_compile(&self, _len: usize) {}
}

/// Observer that records nothing.
#[derive(Default)]
pub struct NoopCompilationObserver;

impl CompilationObserver for NoopCompilationObserver {}

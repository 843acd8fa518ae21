// Copyright 2018-2023 the Deno authors. All rights reserved. MIT license.

use crate::engine::CompileOrigin;
use crate::engine::EngineLock;
use crate::engine::JsValue;
use crate::engine::ModuleHandle;
use crate::error::generic_error;
use crate::error::AnyError;
use crate::path::Path;
use serde::Deserialize;
use serde::Serialize;

mod dynamic_import;
mod registry;

pub use dynamic_import::dynamic_import_callback;
pub use dynamic_import::module_resolve_callback;
pub use registry::CommonJsProviderFactory;
pub use registry::DynamicImportHandler;
pub use registry::ModuleRef;
pub use registry::ModuleRegistry;
pub use registry::ModuleThunk;

/// Which of the three overlapping namespaces a module lives in.
#[derive(
  Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ModuleNamespace {
  /// Supplied by the worker bundle.
  #[default]
  Bundle,
  /// A public built-in; a bundle module under the same path overrides it.
  Builtin,
  /// An engine-internal built-in, never visible to user code.
  Internal,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ResolveOption {
  /// Check the worker bundle first, then builtins.
  #[default]
  Default,
  /// Check only non-internal builtins.
  BuiltinOnly,
  /// Check only internal builtins.
  InternalOnly,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ResolveMethod {
  /// Standard static or dynamic import.
  #[default]
  Import,
  /// The CommonJS `require` method.
  Require,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RequireOptions {
  /// Require returns the module namespace.
  #[default]
  Default,
  /// Require returns the default export.
  ExportDefault,
}

/// Thunk that builds a module on first resolve. May return `None` when the
/// module is unavailable at this call site, in which case the entry stays a
/// factory and resolution fails.
pub type ModuleFactory = Box<
  dyn FnMut(
    &mut dyn EngineLock,
    ResolveMethod,
    Option<&Path>,
  ) -> Result<Option<ModuleInfo>, AnyError>,
>;

/// An instantiated module: the engine handle, plus the synthetic payload
/// the engine's synthetic evaluator callback needs, if any.
#[derive(Debug)]
pub struct ModuleInfo {
  handle: ModuleHandle,
  synthetic: Option<SyntheticModuleInfo>,
  named_exports: Option<Vec<String>>,
}

impl ModuleInfo {
  /// Wraps a module the embedder already compiled.
  pub fn new(handle: ModuleHandle) -> ModuleInfo {
    ModuleInfo {
      handle,
      synthetic: None,
      named_exports: None,
    }
  }

  /// Compiles ES module source text into an instantiated artifact.
  pub fn from_source(
    js: &mut dyn EngineLock,
    name: &str,
    source: &str,
    compile_cache: Option<&[u8]>,
    origin: CompileOrigin,
  ) -> Result<ModuleInfo, AnyError> {
    let handle = js.compile_module(name, source, compile_cache, origin)?;
    Ok(ModuleInfo::new(handle))
  }

  /// Creates a synthetic module whose exports (`default` plus
  /// `named_exports`) are populated later by [`evaluate_synthetic_module`].
  pub fn synthetic(
    js: &mut dyn EngineLock,
    name: &str,
    named_exports: Option<Vec<String>>,
    synthetic: SyntheticModuleInfo,
  ) -> Result<ModuleInfo, AnyError> {
    let mut export_names = vec!["default".to_string()];
    if let Some(named) = &named_exports {
      export_names.extend(named.iter().cloned());
    }
    let handle = js.create_synthetic_module(name, &export_names)?;
    Ok(ModuleInfo {
      handle,
      synthetic: Some(synthetic),
      named_exports,
    })
  }

  pub fn handle(&self) -> &ModuleHandle {
    &self.handle
  }

  pub fn synthetic_info(&self) -> Option<&SyntheticModuleInfo> {
    self.synthetic.as_ref()
  }

  pub fn named_exports(&self) -> Option<&[String]> {
    self.named_exports.as_deref()
  }
}

/// Payload describing how to satisfy the engine's synthetic-module
/// evaluation callback.
#[derive(Debug)]
pub enum SyntheticModuleInfo {
  /// Schema file scope as the default export plus named top-level
  /// declarations.
  Capnp(CapnpModuleInfo),
  CommonJs(CommonJsModuleInfo),
  Data(JsValue),
  Text(JsValue),
  Wasm(JsValue),
  Json(JsValue),
  /// A host object projected as the default export.
  Object(JsValue),
}

#[derive(Debug)]
pub struct CapnpModuleInfo {
  pub file_scope: JsValue,
  pub top_level_decls: Vec<(String, JsValue)>,
}

/// Supplies the engine-side `module`/`exports` objects a CommonJS wrapper
/// function runs against. The concrete provider belongs to the embedder.
pub trait CommonJsModuleProvider {
  /// The receiver object the wrapper function is compiled against.
  fn context(&self, js: &mut dyn EngineLock) -> Result<JsValue, AnyError>;
  /// The `module.exports` value observed after evaluation.
  fn exports(&self, js: &mut dyn EngineLock) -> Result<JsValue, AnyError>;
}

pub struct CommonJsModuleInfo {
  provider: Box<dyn CommonJsModuleProvider>,
  eval_func: JsValue,
}

impl std::fmt::Debug for CommonJsModuleInfo {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CommonJsModuleInfo")
      .field("eval_func", &self.eval_func)
      .finish()
  }
}

impl CommonJsModuleInfo {
  pub fn new(
    js: &mut dyn EngineLock,
    name: &str,
    source: &str,
    provider: Box<dyn CommonJsModuleProvider>,
  ) -> Result<CommonJsModuleInfo, AnyError> {
    let receiver = provider.context(js)?;
    let eval_func = js.compile_function(name, source, &receiver)?;
    Ok(CommonJsModuleInfo {
      provider,
      eval_func,
    })
  }

  pub fn exports(&self, js: &mut dyn EngineLock) -> Result<JsValue, AnyError> {
    self.provider.exports(js)
  }
}

/// Populates an instantiated synthetic module's exports from its payload.
/// The engine calls this from its synthetic evaluation callback; the
/// payload is borrowed from the registry entry for the duration of the
/// call.
pub fn evaluate_synthetic_module(
  js: &mut dyn EngineLock,
  registry: &ModuleRegistry,
  module: &ModuleHandle,
) -> Result<(), AnyError> {
  let module_ref = registry.resolve_handle(module).ok_or_else(|| {
    generic_error("synthetic module is not present in the registry")
  })?;
  let synthetic = module_ref.info.synthetic_info().ok_or_else(|| {
    generic_error(format!(
      "module \"{}\" is not synthetic",
      module_ref.specifier.to_string(true)
    ))
  })?;
  match synthetic {
    SyntheticModuleInfo::Data(value)
    | SyntheticModuleInfo::Text(value)
    | SyntheticModuleInfo::Wasm(value)
    | SyntheticModuleInfo::Json(value)
    | SyntheticModuleInfo::Object(value) => {
      js.set_module_export(module, "default", value)?;
    }
    SyntheticModuleInfo::Capnp(info) => {
      js.set_module_export(module, "default", &info.file_scope)?;
      for (name, value) in &info.top_level_decls {
        js.set_module_export(module, name, value)?;
      }
    }
    SyntheticModuleInfo::CommonJs(info) => {
      js.call_function(&info.eval_func)?;
      let exports = info.exports(js)?;
      js.set_module_export(module, "default", &exports)?;
    }
  }
  Ok(())
}

/// Node.js built-in modules recognized when node compat is enabled. A bare
/// dynamic-import specifier matching one of these names is rewritten to its
/// `node:` form before resolution.
pub(crate) static KNOWN_NODE_MODULES: &[&str] = &[
  "assert",
  "assert/strict",
  "async_hooks",
  "buffer",
  "console",
  "constants",
  "crypto",
  "diagnostics_channel",
  "dns",
  "dns/promises",
  "events",
  "fs",
  "fs/promises",
  "module",
  "net",
  "os",
  "path",
  "path/posix",
  "path/win32",
  "process",
  "querystring",
  "stream",
  "stream/consumers",
  "stream/promises",
  "stream/web",
  "string_decoder",
  "timers",
  "timers/promises",
  "tls",
  "url",
  "util",
  "util/types",
  "zlib",
];

pub(crate) fn check_node_specifier(specifier: &str) -> Option<String> {
  if KNOWN_NODE_MODULES.contains(&specifier) {
    Some(format!("node:{specifier}"))
  } else {
    None
  }
}

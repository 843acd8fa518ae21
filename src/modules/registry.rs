// Copyright 2018-2023 the Deno authors. All rights reserved. MIT license.

use crate::config::BundleModule;
use crate::config::BundleModuleContent;
use crate::config::ModuleBundle;
use crate::config::ModuleConfig;
use crate::config::ModuleContent;
use crate::engine::CompilationObserver;
use crate::engine::CompileOrigin;
use crate::engine::EngineLock;
use crate::engine::InstantiateModuleOptions;
use crate::engine::JsPromise;
use crate::engine::JsValue;
use crate::engine::ModuleHandle;
use crate::engine::NoopCompilationObserver;
use crate::engine::REGISTRY_EMBEDDER_SLOT;
use crate::error::generic_error;
use crate::error::AnyError;
use crate::fallback::FallbackClient;
use crate::fallback::FallbackResult;
use crate::fallback::FallbackVersion;
use crate::modules::CommonJsModuleInfo;
use crate::modules::CommonJsModuleProvider;
use crate::modules::ModuleFactory;
use crate::modules::ModuleInfo;
use crate::modules::ModuleNamespace;
use crate::modules::RequireOptions;
use crate::modules::ResolveMethod;
use crate::modules::ResolveOption;
use crate::modules::SyntheticModuleInfo;
use crate::path::Path;
use log::debug;
use log::error;
use std::borrow::Cow;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

/// Handler invoked for each dynamic import so the embedder can set up the
/// context the instantiation needs. The thunk performs the instantiation
/// and yields the module namespace; the handler's promise is the import's
/// result.
pub type DynamicImportHandler =
  Rc<dyn Fn(&mut dyn EngineLock, ModuleThunk) -> Result<JsPromise, AnyError>>;

pub type ModuleThunk =
  Box<dyn FnOnce(&mut dyn EngineLock) -> Result<JsValue, AnyError>>;

/// Builds the engine-specific CommonJS `module`/`exports` context for a
/// module delivered by the fallback service.
pub type CommonJsProviderFactory = Rc<
  dyn Fn(
    &mut dyn EngineLock,
    &str,
  ) -> Result<Box<dyn CommonJsModuleProvider>, AnyError>,
>;

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct EntryKey {
  specifier: Path,
  namespace: ModuleNamespace,
}

/// Current shape of an entry's module. Transitions one way only:
/// `Source` or `Factory` becomes `Instantiated` at most once; once
/// instantiated the engine handle is stable for the entry's lifetime.
enum ModuleArtifact {
  Source(Cow<'static, str>),
  Factory(ModuleFactory),
  Instantiated(ModuleInfo),
}

struct Entry {
  artifact: ModuleArtifact,
  // Kept until the first successful compile.
  compile_cache: Option<Vec<u8>>,
}

/// A resolved registry entry, as seen from a reverse lookup by handle.
pub struct ModuleRef<'a> {
  pub specifier: &'a Path,
  pub namespace: ModuleNamespace,
  pub info: &'a ModuleInfo,
}

/// The collection of modules known to a script, reachable by import or
/// require. Bound to a single engine context and only ever touched under
/// that isolate's lock.
pub struct ModuleRegistry {
  entries: HashMap<EntryKey, Entry>,
  // Memoized fallback-service redirects, absolute specifier string to
  // redirect target, consulted before re-contacting the service.
  fallback_redirects: HashMap<String, String>,
  observer: Rc<dyn CompilationObserver>,
  dynamic_import_handler: Option<DynamicImportHandler>,
  commonjs_provider_factory: Option<CommonJsProviderFactory>,
  fallback: Option<Arc<FallbackClient>>,
  fallback_version: FallbackVersion,
}

impl ModuleRegistry {
  pub fn new(observer: Rc<dyn CompilationObserver>) -> ModuleRegistry {
    ModuleRegistry {
      entries: HashMap::new(),
      fallback_redirects: HashMap::new(),
      observer,
      dynamic_import_handler: None,
      commonjs_provider_factory: None,
      fallback: None,
      fallback_version: FallbackVersion::default(),
    }
  }

  /// Stores this registry's pointer in the context's reserved embedder
  /// slot so engine callbacks can find it. The registry must outlive the
  /// context and must not move afterwards, and the context must not hand
  /// the pointer out beyond its own callbacks.
  pub fn install(&mut self, js: &mut dyn EngineLock) {
    js.set_embedder_slot(
      REGISTRY_EMBEDDER_SLOT,
      self as *mut ModuleRegistry as *mut (),
    );
  }

  /// Recovers the registry previously stored with [`ModuleRegistry::install`].
  ///
  /// # Safety
  ///
  /// The caller must be inside an engine callback for the context the
  /// registry was installed into, with no other live reference to the
  /// registry.
  pub unsafe fn from_lock<'a>(
    js: &dyn EngineLock,
  ) -> Option<&'a mut ModuleRegistry> {
    let ptr = js.embedder_slot(REGISTRY_EMBEDDER_SLOT) as *mut ModuleRegistry;
    ptr.as_mut()
  }

  pub fn set_dynamic_import_handler(&mut self, handler: DynamicImportHandler) {
    self.dynamic_import_handler = Some(handler);
  }

  pub fn set_commonjs_provider_factory(
    &mut self,
    factory: CommonJsProviderFactory,
  ) {
    self.commonjs_provider_factory = Some(factory);
  }

  /// Attaches the out-of-process fallback lookup service. The client may be
  /// shared by multiple registries; it is owned by the embedder.
  pub fn set_fallback(
    &mut self,
    client: Arc<FallbackClient>,
    version: FallbackVersion,
  ) {
    self.fallback = Some(client);
    self.fallback_version = version;
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Registers a worker-bundle module that the embedder has already
  /// instantiated.
  ///
  /// # Panics
  ///
  /// Panics if the key is already registered; registration happens at
  /// worker assembly time where a duplicate is a programming error.
  pub fn add(&mut self, specifier: Path, info: ModuleInfo) {
    self.insert(
      specifier,
      ModuleNamespace::Bundle,
      ModuleArtifact::Instantiated(info),
      None,
    );
  }

  /// Registers a built-in module from source text. The module is compiled
  /// on first resolve, so the worker bundle gets a chance to override it.
  ///
  /// # Panics
  ///
  /// Panics on an invalid specifier, a duplicate key, or the `Bundle`
  /// namespace (bundle modules go through [`ModuleRegistry::add`]).
  pub fn add_builtin_source(
    &mut self,
    specifier: &str,
    source: impl Into<Cow<'static, str>>,
    namespace: ModuleNamespace,
    compile_cache: Option<Vec<u8>>,
  ) {
    let path = parse_builtin_specifier(specifier, namespace);
    self.insert(
      path,
      namespace,
      ModuleArtifact::Source(source.into()),
      compile_cache,
    );
  }

  /// Registers a built-in module built lazily by a factory on first
  /// resolve.
  ///
  /// # Panics
  ///
  /// Same conditions as [`ModuleRegistry::add_builtin_source`].
  pub fn add_builtin_factory(
    &mut self,
    specifier: &str,
    factory: ModuleFactory,
    namespace: ModuleNamespace,
  ) {
    let path = parse_builtin_specifier(specifier, namespace);
    self.insert(path, namespace, ModuleArtifact::Factory(factory), None);
  }

  /// Registers a built-in module that projects a host object as its
  /// default export.
  ///
  /// # Panics
  ///
  /// Same conditions as [`ModuleRegistry::add_builtin_source`].
  pub fn add_builtin_object(
    &mut self,
    specifier: &str,
    object: JsValue,
    namespace: ModuleNamespace,
  ) {
    let name = specifier.to_string();
    self.add_builtin_factory(
      specifier,
      Box::new(move |js, _method, _referrer| {
        Ok(Some(ModuleInfo::synthetic(
          js,
          &name,
          None,
          SyntheticModuleInfo::Object(object.clone()),
        )?))
      }),
      namespace,
    );
  }

  /// Registers every module of a decoded bundle, optionally filtered by
  /// namespace.
  pub fn add_builtin_bundle(
    &mut self,
    bundle: &ModuleBundle,
    filter: Option<ModuleNamespace>,
  ) {
    for module in &bundle.modules {
      if filter.map_or(true, |wanted| module.namespace == wanted) {
        self.add_builtin_bundle_module(module);
      }
    }
  }

  pub fn add_builtin_bundle_filtered(
    &mut self,
    bundle: &ModuleBundle,
    filter: impl Fn(&BundleModule) -> bool,
  ) {
    for module in &bundle.modules {
      if filter(module) {
        self.add_builtin_bundle_module(module);
      }
    }
  }

  /// Registers a single bundle module, dispatching by content kind. Wasm,
  /// data and JSON modules become factories so the work of wrapping them
  /// is deferred until first import.
  pub fn add_builtin_bundle_module(&mut self, module: &BundleModule) {
    let name = module.name.clone();
    match &module.content {
      BundleModuleContent::Src(src) => self.add_builtin_source(
        &module.name,
        src.clone(),
        module.namespace,
        module.compile_cache.clone(),
      ),
      BundleModuleContent::Wasm(bytes) => {
        let bytes = bytes.clone();
        let observer = self.observer.clone();
        self.add_builtin_factory(
          &module.name,
          Box::new(move |js, _method, _referrer| {
            observer.on_wasm_compile(bytes.len());
            let wasm = js.compile_wasm(&bytes)?;
            Ok(Some(ModuleInfo::synthetic(
              js,
              &name,
              None,
              SyntheticModuleInfo::Wasm(wasm),
            )?))
          }),
          module.namespace,
        );
      }
      BundleModuleContent::Data(bytes) => {
        let bytes = bytes.clone();
        self.add_builtin_factory(
          &module.name,
          Box::new(move |js, _method, _referrer| {
            let data = js.wrap_bytes(bytes.clone());
            Ok(Some(ModuleInfo::synthetic(
              js,
              &name,
              None,
              SyntheticModuleInfo::Data(data),
            )?))
          }),
          module.namespace,
        );
      }
      BundleModuleContent::Json(text) => {
        let text = text.clone();
        self.add_builtin_factory(
          &module.name,
          Box::new(move |js, _method, _referrer| {
            let value = js.parse_json(&text)?;
            Ok(Some(ModuleInfo::synthetic(
              js,
              &name,
              None,
              SyntheticModuleInfo::Json(value),
            )?))
          }),
          module.namespace,
        );
      }
    }
  }

  /// Resolves a specifier to an instantiated module, or `None` when no
  /// module is found. Lookup order is governed by `option`; a miss in the
  /// local namespaces escalates to the fallback service (never for
  /// internal-only resolution). A returned entry is always instantiated.
  pub fn resolve(
    &mut self,
    js: &mut dyn EngineLock,
    specifier: &Path,
    referrer: Option<&Path>,
    option: ResolveOption,
    method: ResolveMethod,
    raw_specifier: Option<&str>,
  ) -> Result<Option<&ModuleInfo>, AnyError> {
    match option {
      ResolveOption::InternalOnly => {
        if self.contains(specifier, ModuleNamespace::Internal) {
          return self.materialize(
            js,
            specifier,
            ModuleNamespace::Internal,
            referrer,
            method,
          );
        }
        // Internal resolution never consults the fallback service.
        return Ok(None);
      }
      ResolveOption::BuiltinOnly => {
        if self.contains(specifier, ModuleNamespace::Builtin) {
          return self.materialize(
            js,
            specifier,
            ModuleNamespace::Builtin,
            referrer,
            method,
          );
        }
      }
      ResolveOption::Default => {
        // The worker bundle may override a builtin, so it wins.
        if self.contains(specifier, ModuleNamespace::Bundle) {
          return self.materialize(
            js,
            specifier,
            ModuleNamespace::Bundle,
            referrer,
            method,
          );
        }
        if self.contains(specifier, ModuleNamespace::Builtin) {
          return self.materialize(
            js,
            specifier,
            ModuleNamespace::Builtin,
            referrer,
            method,
          );
        }
      }
    }

    debug_assert!(option != ResolveOption::InternalOnly);

    let absolute = specifier.to_string(true);
    if let Some(target) = self.fallback_redirects.get(&absolute).cloned() {
      // Known redirect. Resolve with DEFAULT so bundle-typed modules from
      // the fallback service stay reachable.
      let redirected = self.eval_redirect(specifier, &target)?;
      return self.resolve(
        js,
        &redirected,
        referrer,
        ResolveOption::Default,
        method,
        raw_specifier,
      );
    }

    let Some(client) = self.fallback.clone() else {
      return Ok(None);
    };
    let referrer_str =
      referrer.map(|path| path.to_string(true)).unwrap_or_default();
    let Some(found) = client.try_resolve(
      self.fallback_version,
      method.into(),
      &absolute,
      raw_specifier,
      &referrer_str,
      &[],
    ) else {
      return Ok(None);
    };
    match found {
      FallbackResult::Module(config) => {
        let mut namespace = ModuleNamespace::Bundle;
        if option == ResolveOption::BuiltinOnly
          && (absolute.starts_with("/node:")
            || absolute.starts_with("/cloudflare:")
            || absolute.starts_with("/workerd:"))
        {
          namespace = ModuleNamespace::Builtin;
        }
        let name = config
          .name
          .clone()
          .unwrap_or_else(|| specifier.to_string(false));
        let Some(info) =
          self.module_info_from_config(js, &name, &config, namespace)?
        else {
          return Ok(None);
        };
        self.insert(
          specifier.clone(),
          namespace,
          ModuleArtifact::Instantiated(info),
          None,
        );
        self.materialize(js, specifier, namespace, referrer, method)
      }
      FallbackResult::Redirect(target) => {
        debug!("fallback service redirected {absolute} to {target}");
        self
          .fallback_redirects
          .insert(absolute, target.clone());
        let redirected = self.eval_redirect(specifier, &target)?;
        self.resolve(
          js,
          &redirected,
          referrer,
          ResolveOption::Default,
          method,
          raw_specifier,
        )
      }
    }
  }

  /// Answers "which entry does this engine module handle belong to?" by
  /// scanning the table. Entries still holding source or a factory are
  /// skipped; their modules have no handle yet. The scan is O(N) but is
  /// only reached from engine callbacks that are rare relative to
  /// resolves.
  pub fn resolve_handle(&self, module: &ModuleHandle) -> Option<ModuleRef> {
    for (key, entry) in &self.entries {
      if let ModuleArtifact::Instantiated(info) = &entry.artifact {
        if info.handle() == module {
          return Some(ModuleRef {
            specifier: &key.specifier,
            namespace: key.namespace,
            info,
          });
        }
      }
    }
    None
  }

  /// Resolves a dynamic import and hands instantiation to the registered
  /// handler. Missing module, missing handler and resolution failures all
  /// become a rejected promise carrying `No such module "<raw specifier>"`.
  pub fn resolve_dynamic_import(
    &mut self,
    js: &mut dyn EngineLock,
    specifier: &Path,
    referrer: &Path,
    raw_specifier: &str,
  ) -> Result<JsPromise, AnyError> {
    // A built-in module may import only internal built-ins, never bundle
    // modules. If the worker bundle overrode the built-in, the built-in
    // entry was never registered and the referrer will not be found here.
    let option = if self.contains(referrer, ModuleNamespace::Builtin) {
      ResolveOption::InternalOnly
    } else {
      ResolveOption::Default
    };

    let maybe_handle = self
      .resolve(
        js,
        specifier,
        Some(referrer),
        option,
        ResolveMethod::Import,
        Some(raw_specifier),
      )?
      .map(|info| info.handle().clone());

    if let Some(handle) = maybe_handle {
      if let Some(handler) = self.dynamic_import_handler.clone() {
        let thunk: ModuleThunk = Box::new(move |js| {
          js.instantiate_module(&handle, InstantiateModuleOptions::Default)?;
          Ok(js.module_namespace(&handle))
        });
        return handler(js, thunk);
      }
      // With no handler installed the module is treated as missing.
    }

    let reason =
      js.error_value(&format!("No such module \"{raw_specifier}\""));
    Ok(js.rejected_promise(&reason))
  }

  /// Synchronously resolves and instantiates an internal module, returning
  /// its namespace.
  pub fn resolve_internal_import(
    &mut self,
    js: &mut dyn EngineLock,
    specifier: &str,
  ) -> Result<JsValue, AnyError> {
    let path = Path::parse(specifier)
      .map_err(|_| generic_error(format!("No such module \"{specifier}\"")))?;
    let handle = self
      .resolve(
        js,
        &path,
        None,
        ResolveOption::InternalOnly,
        ResolveMethod::Import,
        Some(specifier),
      )?
      .map(|info| info.handle().clone())
      .ok_or_else(|| {
        generic_error(format!("No such module \"{specifier}\""))
      })?;
    js.instantiate_module(&handle, InstantiateModuleOptions::Default)?;
    Ok(js.module_namespace(&handle))
  }

  /// The synchronous core of CommonJS `require()`: forces instantiation
  /// (a pending top-level await is an error there) and returns the
  /// namespace or the default export.
  pub fn require_impl(
    js: &mut dyn EngineLock,
    info: &ModuleInfo,
    options: RequireOptions,
  ) -> Result<JsValue, AnyError> {
    js.instantiate_module(
      info.handle(),
      InstantiateModuleOptions::NoTopLevelAwait,
    )?;
    match options {
      RequireOptions::Default => Ok(js.module_namespace(info.handle())),
      RequireOptions::ExportDefault => js.module_default_export(info.handle()),
    }
  }

  fn contains(&self, specifier: &Path, namespace: ModuleNamespace) -> bool {
    self.entries.contains_key(&EntryKey {
      specifier: specifier.clone(),
      namespace,
    })
  }

  fn insert(
    &mut self,
    specifier: Path,
    namespace: ModuleNamespace,
    artifact: ModuleArtifact,
    compile_cache: Option<Vec<u8>>,
  ) {
    let display = specifier.to_string(true);
    let prev = self.entries.insert(
      EntryKey {
        specifier,
        namespace,
      },
      Entry {
        artifact,
        compile_cache,
      },
    );
    assert!(
      prev.is_none(),
      "module {display} is already registered in the {namespace:?} namespace"
    );
  }

  /// Brings the entry to the instantiated state if it is not there yet and
  /// returns its module. A source entry that fails to compile is left as
  /// source, so a later resolve can retry; failures are not cached. A
  /// factory returning nothing stays a factory and the resolve misses.
  fn materialize(
    &mut self,
    js: &mut dyn EngineLock,
    specifier: &Path,
    namespace: ModuleNamespace,
    referrer: Option<&Path>,
    method: ResolveMethod,
  ) -> Result<Option<&ModuleInfo>, AnyError> {
    let key = EntryKey {
      specifier: specifier.clone(),
      namespace,
    };
    let observer = self.observer.clone();
    let entry = self
      .entries
      .get_mut(&key)
      .expect("entry disappeared during resolve");
    match &mut entry.artifact {
      ModuleArtifact::Instantiated(_) => {}
      ModuleArtifact::Source(source) => {
        let name = key.specifier.to_string(false);
        observer.on_module_compile(&name, CompileOrigin::Builtin);
        let source = source.clone();
        let info = ModuleInfo::from_source(
          js,
          &name,
          &source,
          entry.compile_cache.as_deref(),
          CompileOrigin::Builtin,
        )?;
        entry.artifact = ModuleArtifact::Instantiated(info);
        entry.compile_cache = None;
      }
      ModuleArtifact::Factory(factory) => {
        match factory(js, method, referrer)? {
          Some(info) => entry.artifact = ModuleArtifact::Instantiated(info),
          None => return Ok(None),
        }
      }
    }
    match &self.entries[&key].artifact {
      ModuleArtifact::Instantiated(info) => Ok(Some(info)),
      _ => unreachable!(),
    }
  }

  fn eval_redirect(
    &self,
    specifier: &Path,
    target: &str,
  ) -> Result<Path, AnyError> {
    specifier.parent().eval(target).map_err(|err| {
      generic_error(format!(
        "fallback service redirect target \"{target}\" for \"{}\" is \
         invalid: {err}",
        specifier.to_string(true)
      ))
    })
  }

  /// Builds a module from a fallback-service configuration. `Ok(None)`
  /// means the configuration names a content kind this registry cannot
  /// materialize; compile failures propagate.
  fn module_info_from_config(
    &self,
    js: &mut dyn EngineLock,
    name: &str,
    config: &ModuleConfig,
    namespace: ModuleNamespace,
  ) -> Result<Option<ModuleInfo>, AnyError> {
    let origin = match namespace {
      ModuleNamespace::Builtin => CompileOrigin::Builtin,
      _ => CompileOrigin::Bundle,
    };
    let info = match &config.content {
      ModuleContent::EsModule(source) => {
        self.observer.on_module_compile(name, origin);
        ModuleInfo::from_source(js, name, source, None, origin)?
      }
      ModuleContent::CommonJsModule(source) => {
        let Some(factory) = &self.commonjs_provider_factory else {
          error!(
            "no CommonJS provider installed; cannot materialize fallback \
             module {name}"
          );
          return Ok(None);
        };
        let provider = factory(js, name)?;
        let cjs = CommonJsModuleInfo::new(js, name, source, provider)?;
        ModuleInfo::synthetic(
          js,
          name,
          None,
          SyntheticModuleInfo::CommonJs(cjs),
        )?
      }
      ModuleContent::Text(text) => {
        let value = js.wrap_string(text);
        ModuleInfo::synthetic(js, name, None, SyntheticModuleInfo::Text(value))?
      }
      ModuleContent::Data(bytes) => {
        let value = js.wrap_bytes(bytes.clone());
        ModuleInfo::synthetic(js, name, None, SyntheticModuleInfo::Data(value))?
      }
      ModuleContent::Wasm(bytes) => {
        self.observer.on_wasm_compile(bytes.len());
        let value = js.compile_wasm(bytes)?;
        ModuleInfo::synthetic(js, name, None, SyntheticModuleInfo::Wasm(value))?
      }
      ModuleContent::Json(text) => {
        let value = js.parse_json(text)?;
        ModuleInfo::synthetic(js, name, None, SyntheticModuleInfo::Json(value))?
      }
    };
    Ok(Some(info))
  }
}

impl Default for ModuleRegistry {
  fn default() -> ModuleRegistry {
    ModuleRegistry::new(Rc::new(NoopCompilationObserver))
  }
}

fn parse_builtin_specifier(
  specifier: &str,
  namespace: ModuleNamespace,
) -> Path {
  assert!(
    namespace != ModuleNamespace::Bundle,
    "builtin registration cannot use the Bundle namespace"
  );
  match Path::parse(specifier) {
    Ok(path) => path,
    Err(err) => panic!("invalid builtin specifier {specifier:?}: {err}"),
  }
}

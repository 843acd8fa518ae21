// Copyright 2018-2023 the Deno authors. All rights reserved. MIT license.

//! Adapters between engine import callbacks and the registry.

use crate::engine::EngineLock;
use crate::engine::JsPromise;
use crate::engine::ModuleHandle;
use crate::error::is_execution_terminated;
use crate::error::type_error;
use crate::error::AnyError;
use crate::modules::check_node_specifier;
use crate::modules::ModuleNamespace;
use crate::modules::ModuleRegistry;
use crate::modules::ResolveMethod;
use crate::modules::ResolveOption;
use crate::path::has_reserved_prefix;
use crate::path::Path;

/// Implementation of the engine's host-import-dynamically callback.
///
/// Every failure mode (attribute rejection, specifier or referrer parse
/// failure, resolution miss, engine exception) is translated into a
/// rejected promise; `None` is returned only when the engine cannot
/// continue and no promise can be produced at all.
pub fn dynamic_import_callback(
  js: &mut dyn EngineLock,
  referrer_name: &str,
  specifier: &str,
  attributes: &[(String, String)],
) -> Option<JsPromise> {
  let registry = match unsafe { ModuleRegistry::from_lock(js) } {
    Some(registry) => registry,
    None => {
      return Some(make_rejected(
        js,
        &format!("No such module \"{specifier}\""),
      ));
    }
  };

  let flags = js.compat_flags();

  // Import attributes alter the interpretation of a module, so the safest
  // thing is to reject ones we do not implement. Deployed applications
  // predate that guideline, hence the compatibility flag.
  if !attributes.is_empty() && flags.reject_unknown_import_attributes {
    return Some(make_rejected(
      js,
      "Unrecognized import attributes specified",
    ));
  }

  let Ok(referrer) = Path::parse(referrer_name) else {
    return Some(make_rejected(
      js,
      &format!("No such module \"{specifier}\""),
    ));
  };

  let mut spec = specifier.to_string();
  if flags.node_compat {
    if let Some(node_spec) = check_node_specifier(&spec) {
      spec = node_spec;
    }
  }

  // The process module implementation is selected by compat flag; both
  // live in the internal namespace and resolve through the internal path
  // regardless of the referrer.
  if spec == "node:process" {
    let process_spec = if flags.node_process_v2 {
      "node-internal:public_process"
    } else {
      "node-internal:legacy_process"
    };
    return match registry.resolve_internal_import(js, process_spec) {
      Ok(namespace) => Some(js.resolved_promise(&namespace)),
      Err(err) if is_execution_terminated(&err) => None,
      Err(err) => Some(make_rejected(js, &err.to_string())),
    };
  }

  let specifier_path = if has_reserved_prefix(&spec) {
    Path::parse(&spec)
  } else {
    referrer.parent().eval(&spec)
  };
  let Ok(specifier_path) = specifier_path else {
    return Some(make_rejected(
      js,
      &format!("No such module \"{specifier}\""),
    ));
  };

  match registry.resolve_dynamic_import(js, &specifier_path, &referrer, specifier)
  {
    Ok(promise) => Some(promise),
    Err(err) if is_execution_terminated(&err) => None,
    Err(err) => Some(make_rejected(js, &err.to_string())),
  }
}

/// Implementation of the engine's static-import resolve callback: maps a
/// referrer module handle plus a specifier string back to a registered
/// module handle.
pub fn module_resolve_callback(
  js: &mut dyn EngineLock,
  referrer: &ModuleHandle,
  specifier: &str,
) -> Result<ModuleHandle, AnyError> {
  let registry = unsafe { ModuleRegistry::from_lock(js) }
    .ok_or_else(|| type_error("no module registry installed"))?;

  let (referrer_path, referrer_namespace) = {
    let module_ref = registry.resolve_handle(referrer).ok_or_else(|| {
      type_error("referrer module is not present in the registry")
    })?;
    (module_ref.specifier.clone(), module_ref.namespace)
  };

  // Built-in and internal modules resolve only internal modules; bundle
  // modules are outside their trust boundary.
  let option = match referrer_namespace {
    ModuleNamespace::Bundle => ResolveOption::Default,
    ModuleNamespace::Builtin | ModuleNamespace::Internal => {
      ResolveOption::InternalOnly
    }
  };

  let cannot_resolve = || {
    type_error(format!(
      r#"Cannot resolve module "{specifier}" from "{}""#,
      referrer_path.to_string(true)
    ))
  };

  let specifier_path = if has_reserved_prefix(specifier) {
    Path::parse(specifier)
  } else {
    referrer_path.parent().eval(specifier)
  }
  .map_err(|_| cannot_resolve())?;

  match registry.resolve(
    js,
    &specifier_path,
    Some(&referrer_path),
    option,
    ResolveMethod::Import,
    Some(specifier),
  )? {
    Some(info) => Ok(info.handle().clone()),
    None => Err(cannot_resolve()),
  }
}

fn make_rejected(js: &mut dyn EngineLock, message: &str) -> JsPromise {
  let reason = js.error_value(message);
  js.rejected_promise(&reason)
}

// Copyright 2018-2023 the Deno authors. All rights reserved. MIT license.

//! Module registry and resolver sitting between a JavaScript engine and a
//! worker bundle.
//!
//! The registry answers, during both static import-graph construction and
//! dynamic import, the question "given a specifier string and a referrer,
//! what artifact do I bind?" across three overlapping namespaces
//! (worker-bundle modules, public built-ins, engine-internal built-ins)
//! with deterministic precedence, lazy instantiation, identity-preserving
//! reverse lookup from an engine module handle back to its registry entry,
//! and an out-of-process fallback lookup service for modules that were not
//! pre-registered.
//!
//! The embedding engine stays behind the [`EngineLock`] trait; the
//! embedder wires [`dynamic_import_callback`] and
//! [`module_resolve_callback`] into the engine's host hooks and calls
//! [`ModuleRegistry::install`] to make the registry reachable from those
//! callbacks.

mod config;
mod engine;
pub mod error;
mod fallback;
mod modules;
mod path;

#[cfg(test)]
pub(crate) mod test_util;

// Re-exports
pub use anyhow;
pub use log;
pub use serde;
pub use serde_json;

pub use crate::config::BundleModule;
pub use crate::config::BundleModuleContent;
pub use crate::config::FallbackServiceRequest;
pub use crate::config::ImportAttribute;
pub use crate::config::ModuleBundle;
pub use crate::config::ModuleConfig;
pub use crate::config::ModuleContent;
pub use crate::engine::CompatFlags;
pub use crate::engine::CompilationObserver;
pub use crate::engine::CompileOrigin;
pub use crate::engine::EngineLock;
pub use crate::engine::InstantiateModuleOptions;
pub use crate::engine::JsPromise;
pub use crate::engine::JsValue;
pub use crate::engine::ModuleHandle;
pub use crate::engine::NoopCompilationObserver;
pub use crate::engine::REGISTRY_EMBEDDER_SLOT;
pub use crate::error::AnyError;
pub use crate::fallback::FallbackClient;
pub use crate::fallback::FallbackResult;
pub use crate::fallback::FallbackVersion;
pub use crate::fallback::ImportType;
pub use crate::modules::dynamic_import_callback;
pub use crate::modules::evaluate_synthetic_module;
pub use crate::modules::module_resolve_callback;
pub use crate::modules::CapnpModuleInfo;
pub use crate::modules::CommonJsModuleInfo;
pub use crate::modules::CommonJsModuleProvider;
pub use crate::modules::CommonJsProviderFactory;
pub use crate::modules::DynamicImportHandler;
pub use crate::modules::ModuleFactory;
pub use crate::modules::ModuleInfo;
pub use crate::modules::ModuleNamespace;
pub use crate::modules::ModuleRef;
pub use crate::modules::ModuleRegistry;
pub use crate::modules::ModuleThunk;
pub use crate::modules::RequireOptions;
pub use crate::modules::ResolveMethod;
pub use crate::modules::ResolveOption;
pub use crate::modules::SyntheticModuleInfo;
pub use crate::path::has_reserved_prefix;
pub use crate::path::Path;
pub use crate::path::PathError;
pub use crate::path::RESERVED_PREFIXES;

// Copyright 2018-2023 the Deno authors. All rights reserved. MIT license.

//! JSON wire shapes shared with the fallback service and with builtin
//! bundle producers. These mirror the JSON encoding of the service's
//! schema: one union field names the module content kind, `Data` fields are
//! carried as byte arrays.

use crate::modules::ModuleNamespace;
use serde::Deserialize;
use serde::Serialize;

/// A module definition as returned by the fallback service.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfig {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(flatten)]
  pub content: ModuleContent,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ModuleContent {
  EsModule(String),
  CommonJsModule(String),
  Text(String),
  Data(Vec<u8>),
  Wasm(Vec<u8>),
  Json(String),
}

/// Body of a V2 (POST) fallback service request.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackServiceRequest {
  #[serde(rename = "type")]
  pub import_type: String,
  pub specifier: String,
  pub referrer: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub raw_specifier: Option<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub attributes: Vec<ImportAttribute>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportAttribute {
  pub name: String,
  pub value: String,
}

/// A pre-built collection of builtin modules, registered in bulk during
/// worker assembly.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleBundle {
  #[serde(default)]
  pub modules: Vec<BundleModule>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleModule {
  pub name: String,
  #[serde(rename = "type", default)]
  pub namespace: ModuleNamespace,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub compile_cache: Option<Vec<u8>>,
  #[serde(flatten)]
  pub content: BundleModuleContent,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BundleModuleContent {
  Src(String),
  Wasm(Vec<u8>),
  Data(Vec<u8>),
  Json(String),
}

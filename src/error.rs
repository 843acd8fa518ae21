// Copyright 2018-2023 the Deno authors. All rights reserved. MIT license.

use anyhow::Error;
use std::borrow::Cow;
use std::fmt;

/// Every fallible path in this crate funnels into this alias: engine
/// exceptions surfaced through an [`crate::EngineLock`] call, fallback
/// payloads that fail to convert into a module, and resolution misses
/// promoted to errors.
pub type AnyError = anyhow::Error;

/// Builds an error tagged with the JavaScript error class it should be
/// raised as once it crosses back into the engine.
pub fn custom_error(
  class: &'static str,
  message: impl Into<Cow<'static, str>>,
) -> Error {
  CustomError {
    class,
    message: message.into(),
  }
  .into()
}

/// An `Error`-classed error: the shape of `No such module "..."` and of
/// an invalid fallback redirect target.
pub fn generic_error(message: impl Into<Cow<'static, str>>) -> Error {
  custom_error("Error", message)
}

/// A `TypeError`-classed error, raised by the static-import resolve
/// callback when a specifier cannot be bound from its referrer.
pub fn type_error(message: impl Into<Cow<'static, str>>) -> Error {
  custom_error("TypeError", message)
}

/// Carrier for the class tag attached by `custom_error()`. Private: it
/// only ever travels wrapped in an `anyhow::Error`, and the tag is
/// recovered with `get_custom_error_class()`.
#[derive(Debug)]
struct CustomError {
  class: &'static str,
  message: Cow<'static, str>,
}

impl fmt::Display for CustomError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str(&self.message)
  }
}

impl std::error::Error for CustomError {}

/// The class tag attached by `custom_error()`, or `None` for errors from
/// other sources. Embedders consult this when picking the JavaScript
/// error constructor for a rejection they are about to materialize.
pub fn get_custom_error_class(error: &Error) -> Option<&'static str> {
  error.downcast_ref::<CustomError>().map(|e| e.class)
}

/// Marker error raised by an engine lock when execution in the isolate was
/// terminated and no further JavaScript (including an error object for a
/// rejected promise) can run. The dynamic import trampoline translates this
/// into the engine's empty-promise sentinel rather than a rejection.
#[derive(Debug)]
pub struct ExecutionTerminated;

impl fmt::Display for ExecutionTerminated {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str("execution terminated")
  }
}

impl std::error::Error for ExecutionTerminated {}

pub fn execution_terminated() -> Error {
  ExecutionTerminated.into()
}

/// True if the error (at any level of its chain) is `ExecutionTerminated`.
pub fn is_execution_terminated(error: &Error) -> bool {
  error.chain().any(|e| e.is::<ExecutionTerminated>())
}

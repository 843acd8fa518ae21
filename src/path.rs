// Copyright 2018-2023 the Deno authors. All rights reserved. MIT license.

use std::error::Error;
use std::fmt;

/// Specifier prefixes that name built-in modules. A specifier beginning with
/// one of these is always treated as an absolute path and is never resolved
/// against a referrer.
pub const RESERVED_PREFIXES: &[&str] = &["node:", "cloudflare:", "workerd:"];

pub fn has_reserved_prefix(specifier: &str) -> bool {
  RESERVED_PREFIXES
    .iter()
    .any(|prefix| specifier.starts_with(prefix))
}

/// Error indicating the reason parsing or evaluating a module path failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PathError {
  Empty,
  EmptySegment,
  NulByte,
  DotSegment,
  EscapesRoot,
}
use PathError::*;

impl Error for PathError {}

impl fmt::Display for PathError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Empty => write!(f, "empty path"),
      EmptySegment => write!(f, "path contains an empty segment"),
      NulByte => write!(f, "path segment contains a NUL byte"),
      DotSegment => {
        write!(f, "\".\" and \"..\" are not valid parsed path segments")
      }
      EscapesRoot => write!(f, "path escapes the root"),
    }
  }
}

/// A hierarchical module path: a sequence of non-empty segments. All paths
/// are rooted; the leading separator in the string form is optional on input
/// and controlled by the caller on output.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Path {
  segments: Vec<String>,
}

impl Path {
  pub fn root() -> Path {
    Path::default()
  }

  /// Parses a specifier string into a path. A single leading `/` is
  /// accepted and ignored. `.` and `..` are not resolved here; use
  /// [`Path::eval`] for that.
  pub fn parse(specifier: &str) -> Result<Path, PathError> {
    if specifier.is_empty() {
      return Err(Empty);
    }
    let specifier = specifier.strip_prefix('/').unwrap_or(specifier);
    if specifier.is_empty() {
      return Err(Empty);
    }
    let mut segments = Vec::new();
    for segment in specifier.split('/') {
      segments.push(parse_segment(segment)?);
    }
    Ok(Path { segments })
  }

  pub fn is_root(&self) -> bool {
    self.segments.is_empty()
  }

  pub fn segments(&self) -> &[String] {
    &self.segments
  }

  /// The path with the last segment dropped. The root's parent is the root.
  pub fn parent(&self) -> Path {
    let mut segments = self.segments.clone();
    segments.pop();
    Path { segments }
  }

  /// Resolves a relative specifier against this path, treating `self` as a
  /// directory. A leading `/` makes the specifier absolute; `.` and `..`
  /// are folded away; `..` past the root is an error. A specifier starting
  /// with a reserved prefix (`node:`, `cloudflare:`, `workerd:`) is parsed
  /// as an absolute path without consulting `self` at all, which is how
  /// built-in specifiers bypass relative resolution.
  pub fn eval(&self, relative: &str) -> Result<Path, PathError> {
    if relative.is_empty() {
      return Err(Empty);
    }
    if has_reserved_prefix(relative) {
      return Path::parse(relative);
    }
    let (mut segments, rest) = match relative.strip_prefix('/') {
      Some(stripped) => (Vec::new(), stripped),
      None => (self.segments.clone(), relative),
    };
    if rest.is_empty() {
      return Ok(Path { segments });
    }
    for segment in rest.split('/') {
      match segment {
        "." => {}
        ".." => {
          if segments.pop().is_none() {
            return Err(EscapesRoot);
          }
        }
        _ => segments.push(parse_segment(segment)?),
      }
    }
    Ok(Path { segments })
  }

  /// Renders the path, with a leading separator when `absolute`.
  pub fn to_string(&self, absolute: bool) -> String {
    let joined = self.segments.join("/");
    if absolute {
      format!("/{joined}")
    } else {
      joined
    }
  }
}

fn parse_segment(segment: &str) -> Result<String, PathError> {
  if segment.is_empty() {
    return Err(EmptySegment);
  }
  if segment.contains('\0') {
    return Err(NulByte);
  }
  if segment == "." || segment == ".." {
    return Err(DotSegment);
  }
  Ok(segment.to_string())
}

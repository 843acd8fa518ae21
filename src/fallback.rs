// Copyright 2018-2023 the Deno authors. All rights reserved. MIT license.

//! Client for the out-of-process module fallback service.
//!
//! One background thread per client owns an async event loop and an HTTP
//! connection pool; `try_resolve` is callable from any thread holding an
//! engine lock and blocks until the background thread hands back a result,
//! preserving the illusion of a synchronous resolve.

use crate::config::FallbackServiceRequest;
use crate::config::ImportAttribute;
use crate::config::ModuleConfig;
use crate::error::AnyError;
use crate::modules::ResolveMethod;
use crate::path::has_reserved_prefix;
use log::debug;
use log::error;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread::JoinHandle;

/// Which wire protocol to speak to the fallback service.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FallbackVersion {
  /// GET with query parameters and an `x-resolve-method` header.
  #[default]
  V1,
  /// POST `/` with a JSON request body.
  V2,
}

/// The resolve method as carried on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImportType {
  Import,
  Require,
  Internal,
}

impl ImportType {
  fn method(self) -> &'static str {
    match self {
      ImportType::Import => "import",
      ImportType::Require => "require",
      ImportType::Internal => "internal",
    }
  }
}

impl From<ResolveMethod> for ImportType {
  fn from(method: ResolveMethod) -> ImportType {
    match method {
      ResolveMethod::Import => ImportType::Import,
      ResolveMethod::Require => ImportType::Require,
    }
  }
}

/// A successful fallback lookup: either a module definition to install, or
/// the specifier of another module to resolve instead.
#[derive(Clone, Debug, PartialEq)]
pub enum FallbackResult {
  Module(ModuleConfig),
  Redirect(String),
}

#[derive(Clone, Debug)]
struct FallbackRequest {
  version: FallbackVersion,
  import_type: ImportType,
  specifier: String,
  raw_specifier: Option<String>,
  referrer: String,
  attributes: Vec<(String, String)>,
}

#[derive(Default)]
struct SharedState {
  // Single-slot mailbox: at most one request may be pending.
  request: Option<FallbackRequest>,
  // `Some` means a response is ready; the inner `None` is "not found".
  response: Option<Option<FallbackResult>>,
  shutdown: bool,
}

#[derive(Default)]
struct Mailbox {
  state: Mutex<SharedState>,
  cv: Condvar,
}

/// Blocking client for the module fallback service.
pub struct FallbackClient {
  mailbox: Arc<Mailbox>,
  // Serializes callers so the single-slot mailbox never sees two requests;
  // concurrent callers queue here in some total order.
  gate: Mutex<()>,
  thread: Option<JoinHandle<()>>,
}

impl FallbackClient {
  /// Starts the background service thread. `address` is the host (and
  /// optional port, default 80) of the fallback service.
  pub fn new(address: impl Into<String>) -> FallbackClient {
    let address = address.into();
    let mailbox = Arc::new(Mailbox::default());
    let thread_mailbox = mailbox.clone();
    let thread = std::thread::Builder::new()
      .name("module-fallback".to_string())
      .spawn(move || thread_main(thread_mailbox, address))
      .expect("failed to spawn fallback service thread");
    FallbackClient {
      mailbox,
      gate: Mutex::new(()),
      thread: Some(thread),
    }
  }

  /// Asks the service to resolve a specifier. Blocks the calling thread
  /// until the background thread returns. `None` means not found, which is
  /// also the answer for every transport or protocol failure (each of
  /// those leaves a log record) and for a client that has shut down.
  pub fn try_resolve(
    &self,
    version: FallbackVersion,
    import_type: ImportType,
    specifier: &str,
    raw_specifier: Option<&str>,
    referrer: &str,
    attributes: &[(String, String)],
  ) -> Option<FallbackResult> {
    let _gate = self.gate.lock().unwrap();

    {
      let mut state = self.mailbox.state.lock().unwrap();
      if state.shutdown {
        debug!(
          "fallback service client is shut down; \
           treating {specifier} as not found"
        );
        return None;
      }
      assert!(
        state.request.is_none(),
        "fallback service client does not support concurrent requests"
      );
      state.request = Some(FallbackRequest {
        version,
        import_type,
        specifier: specifier.to_string(),
        raw_specifier: raw_specifier.map(str::to_string),
        referrer: referrer.to_string(),
        attributes: attributes.to_vec(),
      });
      self.mailbox.cv.notify_all();
    }

    let guard = self.mailbox.state.lock().unwrap();
    let mut state = self
      .mailbox
      .cv
      .wait_while(guard, |s| s.response.is_none() && !s.shutdown)
      .unwrap();
    match state.response.take() {
      Some(outcome) => outcome,
      // The background thread shut down without producing a response.
      None => None,
    }
  }
}

impl Drop for FallbackClient {
  fn drop(&mut self) {
    {
      let mut state = self.mailbox.state.lock().unwrap();
      state.shutdown = true;
      self.mailbox.cv.notify_all();
    }
    if let Some(thread) = self.thread.take() {
      let _ = thread.join();
    }
  }
}

fn thread_main(mailbox: Arc<Mailbox>, address: String) {
  // The async I/O context and HTTP client are set up once and reused for
  // all subsequent requests.
  let setup = || -> Result<(tokio::runtime::Runtime, reqwest::Client), AnyError>
  {
    let runtime = tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()?;
    let client = reqwest::Client::builder()
      .redirect(reqwest::redirect::Policy::none())
      .build()?;
    Ok((runtime, client))
  };
  let (runtime, client) = match setup() {
    Ok(pair) => pair,
    Err(err) => {
      error!(
        "fallback service thread exiting; module resolution disabled: \
         {err:#}"
      );
      // Signal any waiting caller and prevent future requests.
      let mut state = mailbox.state.lock().unwrap();
      state.response = Some(None);
      state.shutdown = true;
      mailbox.cv.notify_all();
      return;
    }
  };

  loop {
    let request = {
      let guard = mailbox.state.lock().unwrap();
      let mut state = mailbox
        .cv
        .wait_while(guard, |s| s.request.is_none() && !s.shutdown)
        .unwrap();
      if state.shutdown {
        return;
      }
      state.request.take().unwrap()
    };

    let outcome = match request.version {
      FallbackVersion::V1 => perform_v1(&runtime, &client, &address, &request),
      FallbackVersion::V2 => perform_v2(&runtime, &client, &address, &request),
    };

    let mut state = mailbox.state.lock().unwrap();
    state.response = Some(outcome);
    mailbox.cv.notify_all();
  }
}

enum RawResponse {
  NotFound,
  Body(String),
  Redirect(String),
}

fn perform_v1(
  runtime: &tokio::runtime::Runtime,
  client: &reqwest::Client,
  address: &str,
  request: &FallbackRequest,
) -> Option<FallbackResult> {
  let specifier = request.specifier.as_str();

  // When the last path segment begins with a reserved prefix, the query
  // carries only that segment (the prefix travels without the fake leading
  // path); otherwise the query carries the specifier as-is and the name
  // check below strips one leading slash. Fallback services match on this
  // exact shape.
  let mut prefixed = None;
  if let Some(pos) = specifier.rfind('/') {
    let segment = &specifier[pos + 1..];
    if has_reserved_prefix(segment) {
      prefixed = Some(segment);
    }
  }
  let (query_specifier, expected_name) = match prefixed {
    Some(segment) => (segment, segment),
    None => (
      specifier,
      specifier.strip_prefix('/').unwrap_or(specifier),
    ),
  };

  let url = format!("http://{address}/");
  let query = vec![
    ("specifier", query_specifier.to_string()),
    ("referrer", request.referrer.clone()),
    // V1 always includes rawSpecifier, defaulting to empty if absent.
    (
      "rawSpecifier",
      request.raw_specifier.clone().unwrap_or_default(),
    ),
  ];

  let raw = issue(
    runtime,
    &|| {
      client
        .get(url.as_str())
        .query(&query)
        .header("x-resolve-method", request.import_type.method())
        .header(reqwest::header::HOST, "localhost")
    },
    specifier,
  );
  handle_payload(raw, expected_name)
}

fn perform_v2(
  runtime: &tokio::runtime::Runtime,
  client: &reqwest::Client,
  address: &str,
  request: &FallbackRequest,
) -> Option<FallbackResult> {
  let body = FallbackServiceRequest {
    import_type: request.import_type.method().to_string(),
    specifier: request.specifier.clone(),
    referrer: request.referrer.clone(),
    raw_specifier: request.raw_specifier.clone(),
    attributes: request
      .attributes
      .iter()
      .map(|(name, value)| ImportAttribute {
        name: name.clone(),
        value: value.clone(),
      })
      .collect(),
  };
  let payload = match serde_json::to_string(&body) {
    Ok(payload) => payload,
    Err(err) => {
      error!(
        "fallback service request for {} could not be encoded: {err}",
        request.specifier
      );
      return None;
    }
  };

  let url = format!("http://{address}/");
  let raw = issue(
    runtime,
    &|| {
      client
        .post(url.as_str())
        .header(reqwest::header::HOST, "localhost")
        .body(payload.clone())
    },
    &request.specifier,
  );
  handle_payload(raw, &request.specifier)
}

/// Sends the request, retrying once with a fresh connection when the error
/// looks like a stale pooled connection.
fn issue(
  runtime: &tokio::runtime::Runtime,
  build: &dyn Fn() -> reqwest::RequestBuilder,
  context: &str,
) -> RawResponse {
  runtime.block_on(async {
    for attempt in 0..2 {
      match send_once(build()).await {
        Ok(raw) => return raw,
        Err(err) if attempt == 0 && is_disconnect_error(&err) => {
          debug!("stale fallback service connection for {context}; retrying");
          continue;
        }
        Err(err) => {
          error!("fallback service failed to fetch module {context}: {err}");
          return RawResponse::NotFound;
        }
      }
    }
    unreachable!()
  })
}

async fn send_once(
  request: reqwest::RequestBuilder,
) -> Result<RawResponse, reqwest::Error> {
  let response = request.send().await?;
  let status = response.status();

  if status == reqwest::StatusCode::MOVED_PERMANENTLY {
    let location = response
      .headers()
      .get(reqwest::header::LOCATION)
      .and_then(|value| value.to_str().ok())
      .map(str::to_string);
    // Drain the response body to allow connection reuse.
    let _ = response.bytes().await;
    return Ok(match location {
      Some(location) => RawResponse::Redirect(location),
      None => {
        error!("fallback service returned a redirect with no location");
        RawResponse::NotFound
      }
    });
  }

  if status != reqwest::StatusCode::OK {
    let body = response.text().await.unwrap_or_default();
    error!("fallback service failed to fetch module: status {status} {body}");
    return Ok(RawResponse::NotFound);
  }

  let body = response.text().await?;
  Ok(if body.is_empty() {
    // An empty payload means the service failed to fetch the module.
    RawResponse::NotFound
  } else {
    RawResponse::Body(body)
  })
}

fn handle_payload(
  raw: RawResponse,
  expected_name: &str,
) -> Option<FallbackResult> {
  match raw {
    RawResponse::NotFound => None,
    RawResponse::Redirect(location) => {
      Some(FallbackResult::Redirect(location))
    }
    RawResponse::Body(payload) => {
      let mut config: ModuleConfig = match serde_json::from_str(&payload) {
        Ok(config) => config,
        Err(err) => {
          error!(
            "fallback service returned an unparseable module for \
             {expected_name}: {err}"
          );
          return None;
        }
      };
      // A name in the returned module has to match the specifier we asked
      // for; this is a sanity check against misbehaving services.
      match &config.name {
        Some(name) if name != expected_name => {
          error!(
            "fallback service returned module name {name:?} which does not \
             match specifier {expected_name:?}"
          );
          None
        }
        _ => {
          if config.name.is_none() {
            config.name = Some(expected_name.to_string());
          }
          Some(FallbackResult::Module(config))
        }
      }
    }
  }
}

fn is_disconnect_error(err: &reqwest::Error) -> bool {
  let mut source = std::error::Error::source(err);
  while let Some(cause) = source {
    if let Some(io) = cause.downcast_ref::<std::io::Error>() {
      if matches!(
        io.kind(),
        std::io::ErrorKind::ConnectionReset
          | std::io::ErrorKind::ConnectionAborted
          | std::io::ErrorKind::BrokenPipe
          | std::io::ErrorKind::UnexpectedEof
      ) {
        return true;
      }
    }
    let rendered = cause.to_string();
    if rendered.contains("IncompleteMessage")
      || rendered.contains("connection closed before message completed")
    {
      return true;
    }
    source = cause.source();
  }
  false
}

//! HTTP front end: a `tiny_http` listener drained by a fixed pool of worker
//! threads, each dispatching to the shared [`LedgerRegistry`].

#![allow(missing_docs)]

use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tiny_http::{Header, Request, Response, Server};

use crate::core::config::ServerConfig;
use crate::core::errors::{Result, VrError};
use crate::daemon::protocol::{
    BYTES_INVALID, FormParams, PATH_REQUIRED, ROUTE_PING, ROUTE_RELEASE, ROUTE_REPORT,
    ROUTE_RESERVE, VolumeResponse, canonical_route,
};
use crate::ledger::registry::LedgerRegistry;
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};

/// Upper bound on a form body; reservation requests are a few hundred bytes.
const MAX_BODY_BYTES: u64 = 64 * 1024;

/// Status code and body produced for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub body: VolumeResponse,
}

impl Reply {
    fn ok(body: VolumeResponse) -> Self {
        Self { status: 200, body }
    }
}

/// Transport-independent request dispatch.
pub struct RequestHandler {
    registry: Arc<LedgerRegistry>,
    activity: ActivityLoggerHandle,
}

impl RequestHandler {
    #[must_use]
    pub fn new(registry: Arc<LedgerRegistry>, activity: ActivityLoggerHandle) -> Self {
        Self { registry, activity }
    }

    /// Dispatch one request by URL path.
    pub fn handle(&self, url_path: &str, params: &FormParams, remote_addr: &str) -> Reply {
        match canonical_route(url_path) {
            Some(ROUTE_RESERVE) => self.reserve(params, remote_addr),
            Some(ROUTE_RELEASE) => self.release(params, remote_addr),
            Some(ROUTE_REPORT) => self.report(params, remote_addr),
            Some(ROUTE_PING) => Reply::ok(VolumeResponse::success()),
            _ => self.reject(
                url_path,
                remote_addr,
                404,
                format!("Unknown route '{url_path}'."),
            ),
        }
    }

    fn reserve(&self, params: &FormParams, remote_addr: &str) -> Reply {
        let Some(path) = params.path() else {
            return self.reject(ROUTE_RESERVE, remote_addr, 400, PATH_REQUIRED);
        };
        let Some(bytes) = params.bytes() else {
            return self.reject(ROUTE_RESERVE, remote_addr, 400, BYTES_INVALID);
        };

        let started = Instant::now();
        let ledger = self.registry.ledger_for_path(path);
        match ledger.reserve(path, bytes) {
            Ok(admission) => {
                self.activity.send(ActivityEvent::Reserved {
                    remote_addr: remote_addr.to_string(),
                    path: path.to_string(),
                    bytes,
                    mount_point: admission.mount_point,
                    replaced: admission.replaced,
                    free_bytes: admission.free_bytes,
                    reserved_total: admission.reserved_total,
                    duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                });
                Reply::ok(VolumeResponse::success())
            }
            Err(error) => {
                let message = format!("Could not reserve {bytes} bytes for file '{path}': {error}");
                let status = error.http_status();
                self.activity.send(ActivityEvent::ReserveRejected {
                    remote_addr: remote_addr.to_string(),
                    path: path.to_string(),
                    bytes,
                    mount_point: ledger.mount_point().to_string(),
                    status,
                    error_code: error.code().to_string(),
                    error_message: message.clone(),
                });
                Reply {
                    status,
                    body: VolumeResponse::failure(message),
                }
            }
        }
    }

    fn release(&self, params: &FormParams, remote_addr: &str) -> Reply {
        let Some(path) = params.path() else {
            return self.reject(ROUTE_RELEASE, remote_addr, 400, PATH_REQUIRED);
        };
        let ledger = self.registry.ledger_for_path(path);
        let released_bytes = match ledger.release(path) {
            Ok(released_bytes) => released_bytes,
            Err(error) => {
                return self.reject(ROUTE_RELEASE, remote_addr, error.http_status(), error.to_string());
            }
        };
        self.activity.send(ActivityEvent::Released {
            remote_addr: remote_addr.to_string(),
            path: path.to_string(),
            mount_point: ledger.mount_point().to_string(),
            released_bytes,
        });
        Reply::ok(VolumeResponse::success())
    }

    fn report(&self, params: &FormParams, remote_addr: &str) -> Reply {
        let Some(path) = params.path() else {
            return self.reject(ROUTE_REPORT, remote_addr, 400, PATH_REQUIRED);
        };
        let ledger = self.registry.ledger_for_path(path);
        let snapshot = ledger.snapshot();
        self.activity.send(ActivityEvent::Reported {
            remote_addr: remote_addr.to_string(),
            path: path.to_string(),
            mount_point: ledger.mount_point().to_string(),
            entries: snapshot.len(),
        });
        Reply::ok(VolumeResponse::with_data(snapshot))
    }

    fn reject(
        &self,
        route: &str,
        remote_addr: &str,
        status: u16,
        message: impl Into<String>,
    ) -> Reply {
        let message = message.into();
        self.activity.send(ActivityEvent::RequestRejected {
            remote_addr: remote_addr.to_string(),
            route: route.to_string(),
            status,
            message: message.clone(),
        });
        Reply {
            status,
            body: VolumeResponse::failure(message),
        }
    }

    /// Read, dispatch and answer one HTTP request.
    fn serve(&self, mut request: Request) {
        let remote_addr = request
            .remote_addr()
            .map_or_else(|| "unknown".to_string(), ToString::to_string);
        let (url_path, query) = split_url(request.url());

        let reply = match read_form_body(&mut request) {
            Ok(body) => {
                let params = FormParams::parse(&query, body.as_deref());
                self.handle(&url_path, &params, &remote_addr)
            }
            Err(BodyError::Read(error)) => self.reject(
                &url_path,
                &remote_addr,
                400,
                format!("Could not read request body: {error}"),
            ),
            Err(BodyError::TooLarge) => self.reject(
                &url_path,
                &remote_addr,
                413,
                format!("Request body exceeds {MAX_BODY_BYTES} bytes."),
            ),
        };
        respond(request, &reply, &self.activity);
    }
}

/// Bound listener, not yet serving.
pub struct VolumeService {
    server: Arc<Server>,
    handler: Arc<RequestHandler>,
    local_addr: SocketAddr,
    worker_threads: usize,
    recv_timeout: Duration,
}

impl VolumeService {
    /// Bind `host:port` from `config`. Port 0 picks a free port.
    pub fn bind(
        config: &ServerConfig,
        registry: Arc<LedgerRegistry>,
        activity: ActivityLoggerHandle,
    ) -> Result<Self> {
        let listen_addr = config.listen_addr();
        let server = Server::http(&listen_addr).map_err(|error| VrError::Transport {
            details: format!("cannot listen on {listen_addr}: {error}"),
        })?;
        let local_addr = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| VrError::Transport {
                details: format!("listener on {listen_addr} has no IP address"),
            })?;

        Ok(Self {
            server: Arc::new(server),
            handler: Arc::new(RequestHandler::new(registry, activity)),
            local_addr,
            worker_threads: config.worker_threads.max(1),
            recv_timeout: Duration::from_millis(config.recv_timeout_ms.max(1)),
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start the worker pool.
    pub fn spawn(self) -> Result<ServiceHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(self.worker_threads);

        for index in 0..self.worker_threads {
            let server = Arc::clone(&self.server);
            let handler = Arc::clone(&self.handler);
            let shutdown_flag = Arc::clone(&shutdown);
            let recv_timeout = self.recv_timeout;
            let spawned = thread::Builder::new()
                .name(format!("vreserve-http-{index}"))
                .spawn(move || worker_loop(&server, &handler, &shutdown_flag, recv_timeout));
            match spawned {
                Ok(worker) => workers.push(worker),
                Err(error) => {
                    let partial = ServiceHandle {
                        server: self.server,
                        shutdown,
                        workers,
                        local_addr: self.local_addr,
                    };
                    let _ = partial.shutdown();
                    return Err(VrError::Runtime {
                        details: format!("failed to spawn HTTP worker {index}: {error}"),
                    });
                }
            }
        }

        Ok(ServiceHandle {
            server: self.server,
            shutdown,
            workers,
            local_addr: self.local_addr,
        })
    }
}

/// Running service.
pub struct ServiceHandle {
    server: Arc<Server>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl ServiceHandle {
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting requests and join every worker. In-flight requests finish first.
    pub fn shutdown(self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);
        for _ in &self.workers {
            self.server.unblock();
        }
        let mut panicked = 0_usize;
        for worker in self.workers {
            if worker.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(VrError::Runtime {
                details: format!("{panicked} HTTP worker(s) panicked"),
            });
        }
        Ok(())
    }
}

fn worker_loop(
    server: &Server,
    handler: &RequestHandler,
    shutdown: &AtomicBool,
    recv_timeout: Duration,
) {
    while !shutdown.load(Ordering::Acquire) {
        match server.recv_timeout(recv_timeout) {
            Ok(Some(request)) => handler.serve(request),
            Ok(None) => {}
            Err(error) => {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                handler.activity.send(ActivityEvent::Error {
                    code: "VR-3001".to_string(),
                    message: format!("accept failed: {error}"),
                });
                thread::sleep(recv_timeout);
            }
        }
    }
}

fn split_url(url: &str) -> (String, String) {
    match url.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (url.to_string(), String::new()),
    }
}

/// Why a form body could not be used.
#[derive(Debug)]
enum BodyError {
    Read(std::io::Error),
    TooLarge,
}

/// Body bytes when the request carries an urlencoded form, `None` otherwise.
///
/// Bodies over [`MAX_BODY_BYTES`] are refused whole, never truncated.
fn read_form_body(request: &mut Request) -> std::result::Result<Option<Vec<u8>>, BodyError> {
    let is_form = request.headers().iter().any(|header| {
        header.field.equiv("Content-Type")
            && header
                .value
                .as_str()
                .to_ascii_lowercase()
                .starts_with("application/x-www-form-urlencoded")
    });
    if !is_form {
        return Ok(None);
    }
    let mut body = Vec::new();
    request
        .as_reader()
        .take(MAX_BODY_BYTES + 1)
        .read_to_end(&mut body)
        .map_err(BodyError::Read)?;
    if body.len() as u64 > MAX_BODY_BYTES {
        return Err(BodyError::TooLarge);
    }
    Ok(Some(body))
}

fn respond(request: Request, reply: &Reply, activity: &ActivityLoggerHandle) {
    let (status, json) = match serde_json::to_string(&reply.body) {
        Ok(json) => (reply.status, json),
        Err(error) => {
            activity.send(ActivityEvent::Error {
                code: "VR-2201".to_string(),
                message: format!("cannot encode response: {error}"),
            });
            (
                500,
                r#"{"Succeeded":false,"ErrorMessage":"Internal encoding error.","Data":null}"#
                    .to_string(),
            )
        }
    };
    let mut response = Response::from_string(json).with_status_code(status);
    if let Ok(header) = Header::from_bytes(
        &b"Content-Type"[..],
        &b"application/json; charset=utf-8"[..],
    ) {
        response = response.with_header(header);
    }
    // Client hang-ups are not worth reporting.
    let _ = request.respond(response);
}

//! Unix daemon serving one `NonprofitIndex` over a socket.
//!
//! Imports run inside the daemon, so searches keep answering from the active
//! generation while a new one is built. Search results are cached per
//! generation; a swap makes every older entry unreachable.
//!
//! The accept loop hands connections to a fixed pool of worker threads over a
//! bounded channel. A `Shutdown` request stops the loop; the workers finish
//! their current connections and the socket and PID files are removed last,
//! so a client that sees the socket gone knows the daemon has exited.

use crate::config::AppConfig;
use crate::error::ImportError;
use crate::index::{Ein, Generation};
use crate::query::{ExportFormat, Filters, SearchRequest};
use crate::server::protocol::{
    Request, Response, SearchResponse, StatusResponse, read_message, write_message,
};
use crate::server::{get_pid_path, get_socket_path};
use crate::service::NonprofitIndex;
use crate::server::IndexClient;
use anyhow::{Context, Result, bail};
use crossbeam_channel::bounded;
use lru::LruCache;
use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::num::NonZeroUsize;
use std::os::unix::net::{UnixListener, UnixStream};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const CACHE_SIZE: usize = 256;

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Threads serving client connections
const CONNECTION_WORKERS: usize = 8;

const START_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_TIMEOUT: Duration = Duration::from_secs(40);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Effective config handed to a background daemon
const DAEMON_CONFIG: &str = "daemon-config.json";
const DAEMON_LOG: &str = "daemon.log";

/// Bytes of rendered export sent per frame
const EXPORT_CHUNK: usize = 64 * 1024;

type CacheKey = (Generation, SearchRequest);

struct ServerStats {
    start_time: Instant,
    queries_served: AtomicU64,
    exports_served: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl ServerStats {
    fn new() -> Self {
        Self {
            start_time: Instant::now(),
            queries_served: AtomicU64::new(0),
            exports_served: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    fn cache_hit_rate(&self) -> f32 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f32 / total as f32
        }
    }
}

pub struct IndexServer {
    index: NonprofitIndex,
    cache: Mutex<LruCache<CacheKey, crate::query::SearchResults>>,
    stats: ServerStats,
    shutdown: AtomicBool,
    socket_path: PathBuf,
}

fn error_response(e: impl std::fmt::Display) -> Response {
    Response::Error {
        message: e.to_string(),
    }
}

impl IndexServer {
    pub fn new(config: &AppConfig, data_dir: &Path) -> Result<Arc<Self>> {
        let index = NonprofitIndex::open(config, data_dir)?;
        index.resume_import().context("Failed to resume import")?;
        Ok(Self::with_index(index, get_socket_path()))
    }

    pub fn with_index(index: NonprofitIndex, socket_path: PathBuf) -> Arc<Self> {
        let capacity = NonZeroUsize::new(CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Arc::new(Self {
            index,
            cache: Mutex::new(LruCache::new(capacity)),
            stats: ServerStats::new(),
            shutdown: AtomicBool::new(false),
            socket_path,
        })
    }

    /// Accept connections until a `Shutdown` request (blocking)
    pub fn run(self: &Arc<Self>, pid_path: Option<&Path>) -> Result<()> {
        let (listener, _files) = self.bind(pid_path)?;
        info!(socket = %self.socket_path.display(), workers = CONNECTION_WORKERS, "Daemon listening");

        let (conn_tx, conn_rx) = bounded::<UnixStream>(CONNECTION_WORKERS);
        thread::scope(|scope| {
            for worker in 0..CONNECTION_WORKERS {
                let conn_rx = conn_rx.clone();
                scope.spawn(move || {
                    for stream in conn_rx {
                        if let Err(e) = self.handle_connection(stream) {
                            warn!(worker, error = %e, "Connection error");
                        }
                    }
                });
            }
            drop(conn_rx);

            for stream in listener.incoming() {
                if self.shutdown.load(Ordering::Acquire) {
                    break;
                }
                match stream {
                    Ok(stream) => {
                        let _ = stream.set_read_timeout(Some(CONNECTION_TIMEOUT));
                        let _ = stream.set_write_timeout(Some(CONNECTION_TIMEOUT));
                        if conn_tx.send(stream).is_err() {
                            break;
                        }
                    }
                    Err(e) => error!(error = %e, "Accept error"),
                }
            }
            // Workers drain and exit once the sender is gone
            drop(conn_tx);
        });

        info!("Daemon stopped");
        Ok(())
    }

    /// Bind the socket and claim the runtime files. The guard removes them on drop.
    fn bind(&self, pid_path: Option<&Path>) -> Result<(UnixListener, RuntimeFiles)> {
        let socket_path = &self.socket_path;
        if let Some(parent) = socket_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if socket_path.exists() {
            if IndexClient::connect_to(socket_path).is_some() {
                bail!("another daemon is listening on {}", socket_path.display());
            }
            fs::remove_file(socket_path)?;
        }

        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("Failed to bind to {}", socket_path.display()))?;
        let files = RuntimeFiles {
            socket: socket_path.clone(),
            pid: pid_path.map(Path::to_path_buf),
        };
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(socket_path, fs::Permissions::from_mode(0o600))?;
        }
        if let Some(pid_path) = pid_path {
            fs::write(pid_path, std::process::id().to_string())?;
        }
        Ok((listener, files))
    }

    fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = BufWriter::new(stream);

        loop {
            let request: Request = match read_message(&mut reader) {
                Ok(req) => req,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    write_message(&mut writer, &error_response(format!("Invalid request: {}", e)))?;
                    continue;
                }
            };

            if let Request::Export {
                term,
                filters,
                format,
                after,
            } = request
            {
                self.handle_export(&mut writer, term.as_deref(), &filters, format, after.as_deref())?;
                continue;
            }

            let response = self.handle_request(request);
            write_message(&mut writer, &response)?;

            if matches!(response, Response::ShuttingDown) {
                self.wake_listener();
                break;
            }
        }

        Ok(())
    }

    fn handle_request(&self, request: Request) -> Response {
        match request {
            Request::Search { request } => self.handle_search(request),

            Request::Organization { ein } => Response::Organization {
                organization: self.index.organization(&ein),
            },

            Request::StartImport { source } => match self.index.start_import(source) {
                Ok(job_id) => Response::ImportStarted { job_id },
                Err(e) => error_response(e),
            },

            Request::ImportStatus { job_id } => {
                let status = match job_id {
                    Some(id) => self.index.import_status(&id),
                    None => self.index.current_job().map(|job| job.status()),
                };
                Response::ImportStatus { status }
            }

            Request::CancelImport => match self.index.cancel_import() {
                Ok(job_id) => Response::ImportCancelled { job_id },
                Err(ImportError::NoActiveJob) => error_response("no import is running"),
                Err(e) => error_response(e),
            },

            Request::Health => Response::Health(self.index.health()),

            Request::Status => self.handle_status(),

            // Answered in handle_connection
            Request::Export { .. } => error_response("export must be streamed"),

            Request::Shutdown => {
                self.shutdown.store(true, Ordering::Release);
                Response::ShuttingDown
            }

            Request::Ping => Response::Pong,
        }
    }

    fn handle_search(&self, request: SearchRequest) -> Response {
        let start = Instant::now();
        let generation = self.index.active().generation();
        let key = (generation, request);

        if let Ok(mut cache) = self.cache.lock()
            && let Some(results) = cache.get(&key)
        {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            self.stats.queries_served.fetch_add(1, Ordering::Relaxed);
            return Response::Search(SearchResponse {
                results: results.clone(),
                duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                cached: true,
            });
        }

        self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
        let results = match self.index.search(&key.1) {
            Ok(results) => results,
            Err(e) => return error_response(e),
        };

        // Keyed by the generation that answered, which a swap may have advanced
        if let Ok(mut cache) = self.cache.lock() {
            cache.put((results.generation, key.1), results.clone());
        }
        self.stats.queries_served.fetch_add(1, Ordering::Relaxed);

        Response::Search(SearchResponse {
            results,
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
            cached: false,
        })
    }

    fn handle_export<W: Write>(
        &self,
        writer: &mut W,
        term: Option<&str>,
        filters: &Filters,
        format: ExportFormat,
        after: Option<&str>,
    ) -> io::Result<()> {
        let stream = match after {
            Some(raw) => match Ein::parse(raw) {
                Some(ein) => self.index.resume_export(term, filters, format, &ein),
                None => {
                    return write_message(writer, &error_response(format!("invalid EIN cursor {:?}", raw)));
                }
            },
            None => self.index.export(term, filters, format),
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => return write_message(writer, &error_response(e)),
        };

        let start = Instant::now();
        let mut block = vec![0u8; EXPORT_CHUNK];
        let mut carry: Vec<u8> = Vec::new();

        loop {
            let n = stream.read(&mut block)?;
            if n == 0 {
                break;
            }
            carry.extend_from_slice(&block[..n]);

            // Send only whole characters; a split code point waits for the next read
            let valid = match std::str::from_utf8(&carry) {
                Ok(_) => carry.len(),
                Err(e) => e.valid_up_to(),
            };
            if valid == 0 {
                continue;
            }
            let rest = carry.split_off(valid);
            let data = String::from_utf8(std::mem::replace(&mut carry, rest))
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            write_message(writer, &Response::ExportChunk { data })?;
        }
        if !carry.is_empty() {
            let data = String::from_utf8_lossy(&carry).into_owned();
            write_message(writer, &Response::ExportChunk { data })?;
        }

        let records = stream.emitted();
        let cursor = stream.cursor().map(|ein| ein.to_string());
        self.stats.exports_served.fetch_add(1, Ordering::Relaxed);
        debug!(
            records,
            generation = stream.generation(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Export streamed"
        );
        write_message(writer, &Response::ExportEnd { records, cursor })
    }

    fn handle_status(&self) -> Response {
        let active = self.index.active();
        let cached_queries = self.cache.lock().map(|c| c.len()).unwrap_or(0);
        Response::Status(StatusResponse {
            uptime_secs: self.stats.start_time.elapsed().as_secs(),
            active_generation: active.generation(),
            organizations: active.len() as u64,
            queries_served: self.stats.queries_served.load(Ordering::Relaxed),
            exports_served: self.stats.exports_served.load(Ordering::Relaxed),
            cache_hit_rate: self.stats.cache_hit_rate(),
            cached_queries,
        })
    }

    /// Unblock `incoming()` so the accept loop sees the shutdown flag
    fn wake_listener(&self) {
        let _ = UnixStream::connect(&self.socket_path);
    }
}

/// Socket and PID file of a running daemon, removed when dropped
struct RuntimeFiles {
    socket: PathBuf,
    pid: Option<PathBuf>,
}

impl Drop for RuntimeFiles {
    fn drop(&mut self) {
        if let Some(pid) = &self.pid {
            let _ = fs::remove_file(pid);
        }
        // Last, so a stopping client can wait on it
        let _ = fs::remove_file(&self.socket);
    }
}

/// Start `npsearch daemon foreground` as a detached child and wait until it
/// answers on the socket. The child gets the effective config through a file
/// in the data directory and writes its log beside it.
pub fn spawn_background(config: &AppConfig, data_dir: &Path) -> Result<()> {
    let exe = std::env::current_exe().context("Cannot locate the npsearch executable")?;
    let config_path = data_dir.join(DAEMON_CONFIG);
    let content = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
    fs::write(&config_path, content)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    let log_path = data_dir.join(DAEMON_LOG);
    let log = fs::File::create(&log_path)
        .with_context(|| format!("Failed to create {}", log_path.display()))?;

    let mut child = Command::new(exe)
        .arg("--config")
        .arg(&config_path)
        .arg("--data-dir")
        .arg(data_dir)
        .args(["daemon", "foreground"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(log))
        // Own process group: a Ctrl+C in the starting shell does not reach it
        .process_group(0)
        .spawn()
        .context("Failed to spawn daemon")?;

    let socket_path = get_socket_path();
    let deadline = Instant::now() + START_TIMEOUT;
    loop {
        if let Some(mut client) = IndexClient::connect_to(&socket_path)
            && client.ping().is_ok()
        {
            info!(pid = child.id(), socket = %socket_path.display(), "Daemon started");
            return Ok(());
        }
        if let Some(status) = child.try_wait()? {
            bail!("daemon exited with {}; see {}", status, log_path.display());
        }
        if Instant::now() >= deadline {
            bail!("daemon did not answer within {:?}; see {}", START_TIMEOUT, log_path.display());
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Run the daemon in the foreground (for debugging)
pub fn run_foreground(config: &AppConfig, data_dir: &Path) -> Result<()> {
    let server = IndexServer::new(config, data_dir)?;
    server.run(Some(&get_pid_path()))
}

/// Stop the running daemon. Returns false when none was listening.
pub fn stop_daemon() -> Result<bool> {
    stop_daemon_at(&get_socket_path(), &get_pid_path())
}

/// Send `Shutdown` over `socket_path` and wait until the daemon removes it.
/// Files left by a daemon that is no longer listening are cleared.
pub fn stop_daemon_at(socket_path: &Path, pid_path: &Path) -> Result<bool> {
    let Some(mut client) = IndexClient::connect_to(socket_path) else {
        if socket_path.exists() || pid_path.exists() {
            warn!(socket = %socket_path.display(), "Removing files of a daemon that is not listening");
            let _ = fs::remove_file(socket_path);
            let _ = fs::remove_file(pid_path);
        }
        return Ok(false);
    };

    client.shutdown().context("Daemon did not accept the shutdown request")?;
    drop(client);

    let deadline = Instant::now() + STOP_TIMEOUT;
    while socket_path.exists() {
        if Instant::now() >= deadline {
            bail!(
                "daemon still holds {} after {:?}",
                socket_path.display(),
                STOP_TIMEOUT
            );
        }
        thread::sleep(POLL_INTERVAL);
    }
    info!("Daemon stopped");
    Ok(true)
}

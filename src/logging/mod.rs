//! Logging infrastructure - structured tracing for the collector
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable log levels
//! - Zero-cost when disabled
//! - Optional JSON output and file output
//!
//! Fine-grained handle events (allocation, destruction) are emitted at
//! trace level. Collection summaries go out at info level, but only when the
//! owning collector has logging enabled.

use once_cell::sync::OnceCell;
use std::io;
use std::path::Path;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

pub use tracing::{debug, error, info, trace, warn};

static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Log file path. Console output is used when unset.
    pub log_path: Option<String>,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // HYBRID_GC_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("HYBRID_GC_LOG_LEVEL") {
            config.level = parse_level(&level_str);
        }

        // HYBRID_GC_LOG_FILE: path to log file
        if let Ok(path) = std::env::var("HYBRID_GC_LOG_FILE") {
            config.log_path = Some(path);
        }

        config.json_format = std::env::var("HYBRID_GC_LOG_JSON").is_ok();
        config.show_spans = std::env::var("HYBRID_GC_LOG_SPANS").is_ok();

        config
    }

    /// Minimal logging for hot allocation paths
    pub fn performance() -> Self {
        Self {
            level: Level::ERROR,
            ..Self::default()
        }
    }

    /// Verbose logging, every refcount event included
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            log_path: None,
            json_format: false,
            show_spans: true,
        }
    }
}

fn parse_level(value: &str) -> Level {
    match value.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging with configuration from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration
///
/// Only the first call installs a subscriber. If the host process already
/// installed a global subscriber, that one is left in place.
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let filter = env_filter(config.level);

        let layer: Box<dyn Layer<Registry> + Send + Sync> = match (&config.log_path, config.json_format) {
            (Some(path), json) => {
                let path = Path::new(path);
                let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
                let file_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_else(|| "hybrid_gc.log".into());
                let appender = tracing_appender::rolling::never(dir, file_name);
                if json {
                    fmt::layer()
                        .json()
                        .with_writer(appender)
                        .with_span_events(span_events)
                        .with_filter(filter)
                        .boxed()
                } else {
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_span_events(span_events)
                        .with_filter(filter)
                        .boxed()
                }
            }
            (None, true) => fmt::layer()
                .json()
                .with_writer(io::stdout)
                .with_span_events(span_events)
                .with_filter(filter)
                .boxed(),
            (None, false) => fmt::layer()
                .with_writer(io::stdout)
                .with_span_events(span_events)
                .with_target(true)
                .with_thread_ids(cfg!(debug_assertions))
                .with_line_number(cfg!(debug_assertions))
                .with_filter(filter)
                .boxed(),
        };

        tracing_subscriber::registry().with(layer).try_init().ok();
    });
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("hybrid_gc={}", level.as_str().to_lowercase()))
    })
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// ============================================================================
// Collector-specific logging functions
// ============================================================================

/// Log a managed allocation
#[inline]
pub fn log_allocation(type_name: &str, size: usize, ptr: *const ()) {
    trace!(
        target: "hybrid_gc::alloc",
        type_name,
        size_bytes = size,
        address = ?ptr,
        "object allocated"
    );
}

/// Log destruction of a managed object
#[inline]
pub fn log_deallocation(type_name: &str, size: usize, ptr: *const ()) {
    trace!(
        target: "hybrid_gc::alloc",
        type_name,
        size_bytes = size,
        address = ?ptr,
        "object destroyed"
    );
}

/// Log GC cycle start
pub fn log_gc_start(generation: usize, candidates: usize) {
    debug!(
        target: "hybrid_gc::collect",
        generation,
        candidates,
        "starting garbage collection cycle"
    );
}

/// Log GC cycle completion
pub fn log_gc_complete(duration_us: u64, cycles_collected: usize, live_objects: usize) {
    info!(
        target: "hybrid_gc::collect",
        duration_us,
        cycles_collected,
        live_objects,
        "garbage collection complete"
    );
}

/// Log mark phase completion
#[inline]
pub fn log_gc_mark(objects_scanned: usize, reachable: usize) {
    debug!(
        target: "hybrid_gc::collect",
        objects_scanned,
        reachable,
        "mark phase complete"
    );
}

/// Log sweep phase completion
#[inline]
pub fn log_gc_sweep(objects_swept: usize) {
    debug!(
        target: "hybrid_gc::collect",
        objects_swept,
        "sweep phase complete"
    );
}

/// Log a swallowed finalizer or cleanup-hook panic
pub fn log_finalizer_failure(hook: &str, type_name: &str, message: &str) {
    warn!(
        target: "hybrid_gc::finalize",
        hook,
        type_name,
        message,
        "finalizer panicked, continuing"
    );
}

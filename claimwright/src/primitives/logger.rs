use std::cell::RefCell;
use std::{sync::Arc, sync::OnceLock};

thread_local! {
    static THREAD_LOG_CONTEXT: RefCell<Option<String>> = const { RefCell::new(None) };
}

tokio::task_local! {
    /// Task-local logging context, set by the `claims_export` proc macro for async functions.
    pub static LOG_CONTEXT: RefCell<Option<String>>;
}

/// Sink for the crate's log records, implemented by the host.
///
/// Records are single `event.name key=value ...` lines, optionally prefixed with the
/// `[Claims][Component]` context of the operation that produced them.
///
/// # Examples
///
/// Implementing the `Logger` trait:
///
/// ```rust
///
/// use claimwright::primitives::logger::{Logger, LogLevel};
///
/// struct StdoutLogger;
///
/// impl Logger for StdoutLogger {
///     fn log(&self, level: LogLevel, message: String) {
///         println!("[{:?}] {}", level, message);
///     }
/// }
/// ```
///
/// ## kotlin
///
/// ```kotlin
/// object ClaimsLoggerBridge : Logger {
///     override fun log(level: LogLevel, message: String) {
///         when (level) {
///             LogLevel.TRACE, LogLevel.DEBUG -> logger.debug(message)
///             LogLevel.INFO -> logger.info(message)
///             LogLevel.WARN -> logger.warn(message)
///             LogLevel.ERROR -> logger.error(message)
///         }
///     }
/// }
///
/// setLogger(ClaimsLoggerBridge) // Call this only once!!!
/// ```
#[uniffi::export(with_foreign)]
pub trait Logger: Sync + Send {
    /// Receives one formatted record.
    fn log(&self, level: LogLevel, message: String);
}

/// Severity of a forwarded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, uniffi::Enum)]
pub enum LogLevel {
    /// Finest-grained detail
    Trace,
    /// Phase transitions and page summaries
    Debug,
    /// Definitions and reloads
    Info,
    /// Rollbacks and lock contention
    Warn,
    /// Failures that abort an operation
    Error,
}

/// `log` facade implementation forwarding to the installed [`Logger`].
struct ForeignLogger;

impl log::Log for ForeignLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        // Dependencies only get through from info upwards.
        metadata.level() <= log::Level::Info || metadata.target().starts_with("claimwright")
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        match LOGGER_INSTANCE.get() {
            Some(logger) => logger.log(log_level(record.level()), record.args().to_string()),
            None => eprintln!("claimwright logger not installed: {}", record.args()),
        }
    }

    fn flush(&self) {}
}

const fn log_level(level: log::Level) -> LogLevel {
    match level {
        log::Level::Error => LogLevel::Error,
        log::Level::Warn => LogLevel::Warn,
        log::Level::Info => LogLevel::Info,
        log::Level::Debug => LogLevel::Debug,
        log::Level::Trace => LogLevel::Trace,
    }
}

const fn level_filter(level: LogLevel) -> log::LevelFilter {
    match level {
        LogLevel::Trace => log::LevelFilter::Trace,
        LogLevel::Debug => log::LevelFilter::Debug,
        LogLevel::Info => log::LevelFilter::Info,
        LogLevel::Warn => log::LevelFilter::Warn,
        LogLevel::Error => log::LevelFilter::Error,
    }
}

static LOGGER_INSTANCE: OnceLock<Arc<dyn Logger>> = OnceLock::new();

/// Installs the host's [`Logger`] and routes every `log` record of the process through it.
///
/// Records below `max_level` are discarded before formatting. Only the first call installs a
/// logger; later calls only adjust the level.
#[uniffi::export]
pub fn set_logger(logger: Arc<dyn Logger>, max_level: LogLevel) {
    static FORWARDER: ForeignLogger = ForeignLogger;

    if LOGGER_INSTANCE.set(logger).is_ok() {
        if let Err(e) = log::set_logger(&FORWARDER) {
            // Another `log` implementation owns the facade; keep using it.
            eprintln!("claimwright logger not installed: {e}");
        }
    }
    log::set_max_level(level_filter(max_level));
}

/// Emits one record at `$level`, prefixed with the current [`LogContext`] when one is set.
///
/// Implementation detail of [`trace!`], [`debug!`], [`info!`], [`warn!`] and [`error!`].
#[doc(hidden)]
#[macro_export]
macro_rules! log_with_context {
    ($level:expr, $($arg:tt)*) => {
        match $crate::primitives::logger::get_context() {
            Some(ctx) => log::log!($level, "{} {}", ctx, format_args!($($arg)*)),
            None => log::log!($level, $($arg)*),
        }
    };
}

/// Logs at trace level within the current logging context.
///
/// # Examples
///
/// ```rust
/// use claimwright::primitives::logger::LogContext;
///
/// let _claims_logger_ctx = LogContext::new("ClaimsSchemaManager");
/// claimwright::trace!("page.requested offset={}", 200);
/// ```
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => { $crate::log_with_context!(log::Level::Trace, $($arg)*) };
}

/// Logs at debug level within the current logging context.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => { $crate::log_with_context!(log::Level::Debug, $($arg)*) };
}

/// Logs at info level within the current logging context.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => { $crate::log_with_context!(log::Level::Info, $($arg)*) };
}

/// Logs at warn level within the current logging context.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => { $crate::log_with_context!(log::Level::Warn, $($arg)*) };
}

/// Logs at error level within the current logging context.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => { $crate::log_with_context!(log::Level::Error, $($arg)*) };
}

/// Where a [`LogContext`] stored its prefix.
#[derive(Clone, Copy)]
enum ContextSlot {
    /// Inside a `LOG_CONTEXT.scope`, i.e. an exported async method
    Task,
    /// Anywhere else
    Thread,
}

impl ContextSlot {
    /// The task slot when inside a task-local scope, the thread slot otherwise.
    fn current() -> Self {
        if LOG_CONTEXT.try_with(|_| ()).is_ok() {
            Self::Task
        } else {
            Self::Thread
        }
    }

    /// Stores `context`, returning what it replaces.
    fn replace(self, context: Option<String>) -> Option<String> {
        match self {
            Self::Task => LOG_CONTEXT
                .try_with(|slot| slot.replace(context))
                .unwrap_or_default(),
            Self::Thread => THREAD_LOG_CONTEXT.with(|slot| slot.replace(context)),
        }
    }
}

/// Prefixes every record logged while it is alive with `[Claims][<component>]`.
///
/// Guards nest: dropping one restores the prefix that was active when it was created.
///
/// ```rust
/// use claimwright::primitives::logger::{get_context, LogContext};
///
/// {
///     let _claims_logger_ctx = LogContext::new("LockCoordinator");
///     assert_eq!(get_context().as_deref(), Some("[Claims][LockCoordinator]"));
/// }
/// assert_eq!(get_context(), None);
/// ```
pub struct LogContext {
    previous: Option<String>,
    slot: ContextSlot,
}

impl LogContext {
    /// Activates the prefix for `component` until the guard is dropped.
    #[must_use]
    pub fn new(component: &str) -> Self {
        let slot = ContextSlot::current();
        let previous = slot.replace(Some(format!("[Claims][{component}]")));
        Self { previous, slot }
    }
}

impl Drop for LogContext {
    fn drop(&mut self) {
        self.slot.replace(self.previous.take());
    }
}

/// The active logging prefix, task-local scopes taking precedence over the thread's.
#[must_use]
pub fn get_context() -> Option<String> {
    LOG_CONTEXT
        .try_with(|slot| slot.borrow().clone())
        .unwrap_or_else(|_| THREAD_LOG_CONTEXT.with(|slot| slot.borrow().clone()))
}

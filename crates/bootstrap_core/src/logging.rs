//! Loader log sink and panic capture.
//!
//! # Responsibility
//! - Start the rolling loader log under `<base>/MelonLoader/Logs` once per
//!   process, optionally echoed to the console.
//! - Capture panics from hook bodies as single sanitized log lines.
//!
//! # Invariants
//! - A second start with identical [`LogSettings`] is a no-op; any other
//!   settings are rejected and the active sink is kept.
//! - Starting the sink never panics.
//! - The loader never writes into the host's own log files.

use crate::config::LoaderConfig;
use flexi_logger::{
    Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming, WriteMode,
};
use log::{error, info};
use once_cell::sync::OnceCell;
use std::any::Any;
use std::path::{Path, PathBuf};

const LOG_FILE_BASENAME: &str = "bootstrap";
const ROTATE_AT_BYTES: u64 = 10 * 1024 * 1024;
const KEPT_LOG_FILES: usize = 5;
const PANIC_PAYLOAD_LIMIT: usize = 160;

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

static ACTIVE_SINK: OnceCell<ActiveSink> = OnceCell::new();
static PANIC_CAPTURE: OnceCell<()> = OnceCell::new();

struct ActiveSink {
    settings: LogSettings,
    _handle: LoggerHandle,
}

/// Validated parameters of the loader log sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    level: &'static str,
    directory: PathBuf,
    console_echo: bool,
}

impl LogSettings {
    /// Accepts `trace|debug|info|warn|error` (and `warning`) in any case and an
    /// absolute directory.
    pub fn new(level: &str, directory: impl AsRef<Path>) -> Result<Self, String> {
        let level = normalize_level(level).ok_or_else(|| {
            format!(
                "unsupported log level `{}`; expected {}",
                level.trim(),
                LEVELS.join("|")
            )
        })?;
        let directory = directory.as_ref();
        if directory.as_os_str().is_empty() {
            return Err("log directory cannot be empty".to_string());
        }
        if !directory.is_absolute() {
            return Err(format!(
                "log directory must be absolute, got `{}`",
                directory.display()
            ));
        }
        Ok(Self {
            level,
            directory: directory.to_path_buf(),
            console_echo: true,
        })
    }

    /// Settings for a resolved loader configuration; a hidden console
    /// disables the echo.
    pub fn for_config(config: &LoaderConfig) -> Result<Self, String> {
        Ok(Self::new(config.log_level(), config.log_dir())?.with_console_echo(!config.console.hide))
    }

    pub fn with_console_echo(mut self, echo: bool) -> Self {
        self.console_echo = echo;
        self
    }

    pub fn level(&self) -> &'static str {
        self.level
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn duplicate(&self) -> Duplicate {
        match (self.console_echo, self.level) {
            (false, _) => Duplicate::None,
            (true, "trace" | "debug") => Duplicate::Info,
            (true, _) => Duplicate::Warn,
        }
    }
}

/// Canonical name of `level`, or `None` when it is not a known level.
pub fn normalize_level(level: &str) -> Option<&'static str> {
    match level.trim().to_ascii_lowercase().as_str() {
        "warning" => Some("warn"),
        other => LEVELS.into_iter().find(|known| *known == other),
    }
}

/// Starts the loader log sink.
///
/// # Errors
/// - The directory cannot be created or the backend fails to start.
/// - A sink with different settings is already running.
pub fn init_logging(settings: &LogSettings) -> Result<(), String> {
    let active = ACTIVE_SINK.get_or_try_init(|| start_sink(settings))?;
    if active.settings != *settings {
        return Err(format!(
            "loader log already running (level `{}` at `{}`); refusing level `{}` at `{}`",
            active.settings.level,
            active.settings.directory.display(),
            settings.level,
            settings.directory.display()
        ));
    }
    Ok(())
}

fn start_sink(settings: &LogSettings) -> Result<ActiveSink, String> {
    std::fs::create_dir_all(&settings.directory).map_err(|err| {
        format!(
            "cannot create log directory `{}`: {err}",
            settings.directory.display()
        )
    })?;

    let handle = Logger::try_with_str(settings.level)
        .map_err(|err| format!("invalid log level `{}`: {err}", settings.level))?
        .log_to_file(
            FileSpec::default()
                .directory(settings.directory.clone())
                .basename(LOG_FILE_BASENAME),
        )
        .rotate(
            Criterion::Size(ROTATE_AT_BYTES),
            Naming::Numbers,
            Cleanup::KeepLogFiles(KEPT_LOG_FILES),
        )
        .write_mode(WriteMode::BufferAndFlush)
        .duplicate_to_stderr(settings.duplicate())
        .append()
        .format_for_files(flexi_logger::detailed_format)
        .start()
        .map_err(|err| format!("logger backend failed to start: {err}"))?;

    capture_panics_once();
    info!(
        "event=logging_init module=logging status=ok level={} log_dir={} console_echo={} os={} arch={} version={}",
        settings.level,
        settings.directory.display(),
        settings.console_echo,
        std::env::consts::OS,
        std::env::consts::ARCH,
        env!("CARGO_PKG_VERSION")
    );

    Ok(ActiveSink {
        settings: settings.clone(),
        _handle: handle,
    })
}

/// Settings of the running sink, if any.
pub fn logging_status() -> Option<LogSettings> {
    ACTIVE_SINK.get().map(|active| active.settings.clone())
}

/// `debug` in debug mode or debug builds, `info` otherwise.
pub fn default_log_level(debug_mode: bool) -> &'static str {
    if debug_mode || cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }
}

/// Renders a caught panic payload as one short line.
pub fn payload_message(payload: &(dyn Any + Send)) -> String {
    let raw = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload");
    single_line(raw, PANIC_PAYLOAD_LIMIT)
}

fn capture_panics_once() {
    PANIC_CAPTURE.get_or_init(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |panic| {
            let location = panic
                .location()
                .map_or_else(|| "unknown".to_string(), |at| format!("{}:{}", at.file(), at.line()));
            error!(
                "event=panic_captured module=logging status=error location={} payload={}",
                location,
                payload_message(panic.payload())
            );
            previous(panic);
        }));
    });
}

fn single_line(value: &str, limit: usize) -> String {
    let flattened = value.replace(['\n', '\r'], " ");
    if flattened.chars().count() <= limit {
        return flattened;
    }
    let mut truncated = flattened.chars().take(limit).collect::<String>();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::{default_log_level, init_logging, logging_status, payload_message, single_line, LogSettings};
    use crate::config::{HostPaths, LaunchOptions, LoaderConfig};

    #[test]
    fn levels_are_normalized() {
        let dir = std::env::temp_dir();
        assert_eq!(LogSettings::new(" INFO ", &dir).expect("info").level(), "info");
        assert_eq!(LogSettings::new("warning", &dir).expect("warning").level(), "warn");
        let error = LogSettings::new("verbose", &dir).expect_err("unknown level");
        assert!(error.contains("trace|debug|info|warn|error"));
    }

    #[test]
    fn relative_directories_are_rejected() {
        let error = LogSettings::new("info", "MelonLoader/Logs").expect_err("relative directory");
        assert!(error.contains("absolute"));
        assert!(LogSettings::new("info", "").is_err());
    }

    #[test]
    fn config_settings_follow_console_and_debug_options() {
        let host = HostPaths::from_executable("/games/host/Host.x86_64").expect("has parent");
        let options = LaunchOptions::parse(["--melonloader.debug", "--melonloader.hideconsole"]);
        let config = LoaderConfig::resolve(&options, &host);

        let settings = LogSettings::for_config(&config).expect("settings");
        assert_eq!(settings.level(), "debug");
        assert_eq!(settings.directory(), config.log_dir().as_path());
        assert_eq!(settings, LogSettings::new("debug", config.log_dir()).expect("same").with_console_echo(false));
    }

    #[test]
    fn debug_mode_forces_debug_level() {
        assert_eq!(default_log_level(true), "debug");
    }

    #[test]
    fn panic_payloads_become_one_capped_line() {
        let text: Box<dyn std::any::Any + Send> = Box::new(String::from("bad\nstate"));
        assert_eq!(payload_message(text.as_ref()), "bad state");
        let opaque: Box<dyn std::any::Any + Send> = Box::new(17_u32);
        assert_eq!(payload_message(opaque.as_ref()), "non-string panic payload");
        assert_eq!(single_line("abcdefghij", 4), "abcd...");
    }

    #[test]
    fn sink_starts_once_and_rejects_other_settings() {
        let dir = tempfile::tempdir().expect("temp dir");
        let logs = dir.path().join("Logs");
        let settings = LogSettings::new("info", &logs).expect("settings");

        init_logging(&settings).expect("first start");
        init_logging(&settings).expect("identical settings are a no-op");

        let louder = LogSettings::new("debug", &logs).expect("settings");
        assert!(init_logging(&louder).expect_err("level change").contains("refusing"));
        let silent = settings.clone().with_console_echo(false);
        assert!(init_logging(&silent).is_err());

        assert_eq!(logging_status(), Some(settings));
        assert!(logs.is_dir());
    }
}

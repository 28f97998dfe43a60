use std::{env, io, path::PathBuf, time::SystemTime};

use cronwork_models::errors::SendableError;

/// Console plus file logging for cronwork binaries. The file target is
/// `CRONWORK_LOG_PATH` when set, otherwise `worker.log` in the working
/// directory, with a temp-dir fallback for read-only deployments.
pub fn setup_logger() -> Result<(), SendableError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}: {}",
                humantime::format_rfc3339_seconds(SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .chain(std::io::stdout())
        .chain(open_log_file()?)
        .apply()?;
    Ok(())
}

fn open_log_file() -> io::Result<std::fs::File> {
    let primary = env::var("CRONWORK_LOG_PATH")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("worker.log"));

    fern::log_file(&primary).or_else(|err| {
        // The logger is not installed yet, so this can only go to stderr.
        let fallback = env::temp_dir().join("cronwork-worker.log");
        eprintln!(
            "cannot open log file {}: {err}; falling back to {}",
            primary.display(),
            fallback.display()
        );
        fern::log_file(&fallback)
    })
}

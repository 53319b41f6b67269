use crate::error::Result;
use simple_logger::SimpleLogger;

/// Installs `simple_logger` as the global `log` backend with UTC timestamps.
///
/// Arguments:
///
/// * `level`: maximum level that is emitted, usually taken from a debug switch of the embedding
/// agent.
///
/// Returns:
///
/// `Error::Logger` when a logger has already been installed for this process.
pub fn init(level: log::LevelFilter) -> Result<()> {
    SimpleLogger::new()
        .with_utc_timestamps()
        .with_level(level)
        .init()?;
    log::debug!("logger installed level={}", level);
    Ok(())
}

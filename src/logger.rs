use std::fs::File;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::Registry;
use tracing_subscriber::EnvFilter;

use crate::error::PkpdError;
use crate::settings::Settings;

/// Setup logging for the library
///
/// Log records from the `tracing` macros are formatted by `tracing-subscriber`.
/// The level comes from the `[log]` section and defaults to `info`; a filter
/// expression such as `pkpdsim=debug` is accepted as well.
///
/// If `log.file` is set, records are also written without colors to that
/// file inside the output folder. Installing a second subscriber in the
/// same process fails with [PkpdError::Logger].
pub fn setup_log(settings: &Settings) -> Result<(), PkpdError> {
    let log = &settings.log;
    let env_filter =
        EnvFilter::try_new(&log.level).map_err(|e| PkpdError::Logger(e.to_string()))?;

    let timestamper = CompactTimestamp {
        start: Instant::now(),
    };

    let file_layer = match &log.file {
        Some(name) => {
            let path = settings.output_file(name);
            let file = create_log_file(&path)?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_timer(timestamper.clone()),
            )
        }
        None => None,
    };

    let stdout_layer = log.stdout.then(|| {
        fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_timer(timestamper.clone())
    });

    Registry::default()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .map_err(|e| PkpdError::Logger(e.to_string()))
}

fn create_log_file(path: &Path) -> Result<File, PkpdError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(File::create(path)?)
}

#[derive(Clone)]
struct CompactTimestamp {
    start: Instant,
}

impl FormatTime for CompactTimestamp {
    fn format_time(
        &self,
        w: &mut tracing_subscriber::fmt::format::Writer<'_>,
    ) -> Result<(), std::fmt::Error> {
        let elapsed = self.start.elapsed();
        let hours = elapsed.as_secs() / 3600;
        let minutes = (elapsed.as_secs() % 3600) / 60;
        let seconds = elapsed.as_secs() % 60;

        write!(w, "{:02}h {:02}m {:02}s", hours, minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_level_is_reported() {
        let mut settings = Settings::new();
        settings.log.level = "pkpdsim=verbose".to_string();
        settings.log.stdout = false;
        assert!(matches!(setup_log(&settings), Err(PkpdError::Logger(_))));
    }
}

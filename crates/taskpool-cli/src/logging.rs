use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &LoggingConfig, cli_verbose: u8) -> anyhow::Result<()> {
    let log_level = match cli_verbose {
        0 => config.level.as_str(),
        1 => "debug",
        _ => "trace",
    };

    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.is_empty() => EnvFilter::try_new(directives)?,
        _ => EnvFilter::try_new(format!(
            "taskpool={log_level},taskpool_core={log_level}"
        ))?,
    };

    let subscriber = tracing_subscriber::registry().with(filter);

    match config.format.as_str() {
        "json" => {
            let json_layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_thread_names(true)
                .with_line_number(true)
                .with_file(true);
            subscriber.with(json_layer).try_init()?;
        }
        "compact" => {
            let compact_layer = fmt::layer().compact().with_target(false);
            subscriber.with(compact_layer).try_init()?;
        }
        _ => {
            let show_location = matches!(log_level, "debug" | "trace");
            let pretty_layer = fmt::layer()
                .with_target(show_location)
                .with_line_number(show_location)
                .with_file(show_location);
            subscriber.with(pretty_layer).try_init()?;
        }
    }
    Ok(())
}

use tracing::Level;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

/// Initialize process-wide logging.
///
/// `RUST_LOG` takes precedence over `level` when set. Calling this twice is
/// harmless: the second installation attempt is ignored.
pub fn init_logging(level: Level, json_output: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cluster_txn={},warn", level)));

    if json_output {
        let fmt_layer = fmt::layer()
            .json()
            .with_timer(SystemTime)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_thread_names(true);

        let _ = Registry::default()
            .with(env_filter)
            .with(fmt_layer)
            .try_init();
    } else {
        let fmt_layer = fmt::layer()
            .with_timer(SystemTime)
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
            .with_thread_ids(false)
            .with_thread_names(true);

        let _ = Registry::default()
            .with(env_filter)
            .with(fmt_layer)
            .try_init();
    }
}

/// Structured logging for transaction state transitions
#[macro_export]
macro_rules! log_txn_event {
    ($level:expr, $txn_id:expr, $node:expr, $event:expr) => {
        match $level {
            tracing::Level::ERROR => tracing::error!(
                txn_id = %$txn_id,
                node = %$node,
                event = $event,
                "Transaction event"
            ),
            tracing::Level::WARN => tracing::warn!(
                txn_id = %$txn_id,
                node = %$node,
                event = $event,
                "Transaction event"
            ),
            tracing::Level::INFO => tracing::info!(
                txn_id = %$txn_id,
                node = %$node,
                event = $event,
                "Transaction event"
            ),
            _ => tracing::debug!(
                txn_id = %$txn_id,
                node = %$node,
                event = $event,
                "Transaction event"
            ),
        }
    };
}

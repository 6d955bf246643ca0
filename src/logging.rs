//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; binaries call [`init_logging`]
//! once. The `ISOQUEUE_LOG` environment variable overrides the configured
//! level with a full `EnvFilter` directive (e.g. `isoqueue::executor=debug`).

use std::fmt::Write as _;

use serde_json::{Map, Value};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::{Format, Json, JsonFields, Writer};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingConfig};

pub const LOG_ENV: &str = "ISOQUEUE_LOG";

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        EnvFilter::try_new(format!("isoqueue={}", config.level.to_lowercase()))
            .unwrap_or_else(|_| EnvFilter::new("isoqueue=info"))
    })
}

/// Json event format that stamps every record with the application name.
pub struct AppField<F> {
    app: String,
    inner: F,
}

impl<S, N, F> FormatEvent<S, N> for AppField<F>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    F: FormatEvent<S, N>,
{
    fn format_event(&self, ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> std::fmt::Result {
        let mut line = String::new();
        self.inner.format_event(ctx, Writer::new(&mut line), event)?;

        match serde_json::from_str::<Map<String, Value>>(line.trim_end()) {
            Ok(mut record) => {
                record.insert("app".to_string(), Value::String(self.app.clone()));
                let encoded = serde_json::to_string(&record).map_err(|_| std::fmt::Error)?;
                writeln!(writer, "{}", encoded)
            }
            Err(_) => writer.write_str(&line),
        }
    }
}

fn json_layer<S>(app: &str) -> fmt::Layer<S, JsonFields, AppField<Format<Json>>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer().json().event_format(AppField {
        app: app.to_string(),
        inner: fmt::format().json().with_current_span(false).with_target(true),
    })
}

/// Installs the global subscriber. Returns `false` if one was already set.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = build_filter(config);
    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        LogFormat::Json => registry.with(json_layer(&config.app)).try_init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
    };

    if result.is_ok() {
        tracing::info!(event = "logging_initialized", app = %config.app, format = ?config.format);
    }
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn bad_level_falls_back() {
        let config = LoggingConfig {
            level: "not a level!!".to_string(),
            ..LoggingConfig::default()
        };
        let filter = build_filter(&config);
        assert!(!filter.to_string().is_empty());
    }

    #[test]
    fn json_lines_carry_the_app_name() {
        let captured = Captured::default();
        let sink = captured.clone();
        let subscriber = tracing_subscriber::registry().with(json_layer("billing-worker").with_writer(move || sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(event = "task_started", task_id = "t-1");
            tracing::warn!(event = "task_timeout", task_id = "t-2");
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let records: Vec<Value> = output.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record["app"], "billing-worker");
        }
        assert_eq!(records[0]["fields"]["event"], "task_started");
        assert_eq!(records[1]["fields"]["task_id"], "t-2");
        assert_eq!(records[1]["level"], "WARN");
    }
}

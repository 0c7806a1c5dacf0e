//! Per-supervisor telemetry accumulator (§4.D) plus process-wide tracing
//! setup (§ ambient logging).

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tracing_subscriber::{reload, EnvFilter};

/// Snapshot returned by `GET stats` and `get_all_loaded_models` (§4.F).
#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetrySnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub prompt_tokens: u64,
    pub time_to_first_token_ms: u64,
    pub tokens_per_second: f64,
}

/// Lock-free counters updated after every request a supervisor completes.
/// `tokens_per_second` and `time_to_first_token_ms` reflect the most recent
/// request, matching the source's "read from the most recently accessed
/// supervisor" semantics (§4.F Observability) rather than a running average.
#[derive(Default)]
pub struct TelemetryAccumulator {
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    prompt_tokens: AtomicU64,
    time_to_first_token_ms: AtomicU64,
    tokens_per_second_bits: AtomicU64,
}

impl TelemetryAccumulator {
    /// Parses an OpenAI-style `usage` object out of a completed (non-
    /// streaming) backend response and folds it into the running counters.
    pub fn record_from_response(&self, body: &Value, elapsed: Duration) {
        let usage = body.get("usage");
        let prompt = usage.and_then(|u| u.get("prompt_tokens")).and_then(Value::as_u64).unwrap_or(0);
        let completion =
            usage.and_then(|u| u.get("completion_tokens")).and_then(Value::as_u64).unwrap_or(0);

        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.input_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.output_tokens.fetch_add(completion, Ordering::Relaxed);
        self.time_to_first_token_ms.store(elapsed.as_millis() as u64, Ordering::Relaxed);

        let secs = elapsed.as_secs_f64();
        if secs > 0.0 && completion > 0 {
            self.store_tps(completion as f64 / secs);
        }
    }

    /// Streaming variant: token counts aren't visible in-band for most
    /// backends, so only the timing-derived fields are updated;
    /// `tokens_per_second` is approximated from forwarded byte count as a
    /// coarse proxy when no usage frame is seen.
    pub fn record_stream(&self, time_to_first_byte: Duration, total_elapsed: Duration, total_bytes: u64) {
        self.time_to_first_token_ms.store(time_to_first_byte.as_millis() as u64, Ordering::Relaxed);
        let secs = total_elapsed.as_secs_f64();
        if secs > 0.0 && total_bytes > 0 {
            // ~4 bytes/token is a standard rough estimate for UTF-8 English text.
            self.store_tps((total_bytes as f64 / 4.0) / secs);
        }
    }

    fn store_tps(&self, value: f64) {
        self.tokens_per_second_bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            time_to_first_token_ms: self.time_to_first_token_ms.load(Ordering::Relaxed),
            tokens_per_second: f64::from_bits(self.tokens_per_second_bits.load(Ordering::Relaxed)),
        }
    }
}

static RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, tracing_subscriber::Registry>> = OnceLock::new();
static LOG_APPENDER_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Installs the process-wide `tracing` subscriber behind a [`reload::Layer`]
/// so the `log-level` HTTP/CLI operation can change verbosity without a
/// restart, writing to both stdout and a rolling file under `log_dir` (the
/// file `logs/stream` tails, §4.G). `level` overrides `RUST_LOG` when set via
/// `--log-level` or `LEMONADE_LOG_LEVEL`; otherwise falls back to the
/// environment, then `info`.
pub fn init_tracing(level: Option<&str>, log_dir: &std::path::Path) -> std::path::PathBuf {
    let initial = match level {
        Some(l) => EnvFilter::new(map_log_level(l)),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let (filter_layer, handle) = reload::Layer::new(initial);
    let _ = RELOAD_HANDLE.set(handle);

    let _ = std::fs::create_dir_all(log_dir);
    let file_name = "citrine.log";
    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_APPENDER_GUARD.set(guard);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    let subscriber = tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(non_blocking));
    let _ = subscriber.try_init();

    log_dir.join(file_name)
}

/// Applies a new log level to the already-installed subscriber (§6
/// `log-level` operation). No-op if tracing hasn't been initialized yet.
pub fn set_log_level(level: &str) -> Result<(), crate::error::GatewayError> {
    let Some(handle) = RELOAD_HANDLE.get() else {
        return Err(crate::error::GatewayError::Internal {
            message: "tracing not initialized".to_string(),
        });
    };
    handle
        .reload(EnvFilter::new(map_log_level(level)))
        .map_err(|e| crate::error::GatewayError::Internal { message: e.to_string() })
}

/// Maps the §6 log-level vocabulary (critical/error/warning/info/debug/trace)
/// onto the `tracing` level names (error/warn/info/debug/trace).
pub fn map_log_level(level: &str) -> &'static str {
    match level.to_ascii_lowercase().as_str() {
        "critical" => "error",
        "error" => "error",
        "warning" | "warn" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn map_log_level_translates_spec_vocabulary() {
        assert_eq!(map_log_level("critical"), "error");
        assert_eq!(map_log_level("warning"), "warn");
        assert_eq!(map_log_level("TRACE"), "trace");
        assert_eq!(map_log_level("nonsense"), "info");
    }

    #[test]
    fn record_from_response_extracts_usage_fields() {
        let acc = TelemetryAccumulator::default();
        let body = json!({"usage": {"prompt_tokens": 10, "completion_tokens": 20}});
        acc.record_from_response(&body, Duration::from_millis(500));
        let snap = acc.snapshot();
        assert_eq!(snap.prompt_tokens, 10);
        assert_eq!(snap.output_tokens, 20);
        assert!(snap.tokens_per_second > 0.0);
    }

    #[test]
    fn record_from_response_missing_usage_is_a_no_op_for_tokens() {
        let acc = TelemetryAccumulator::default();
        acc.record_from_response(&json!({}), Duration::from_millis(10));
        let snap = acc.snapshot();
        assert_eq!(snap.output_tokens, 0);
    }

    #[test]
    fn counters_accumulate_across_multiple_requests() {
        let acc = TelemetryAccumulator::default();
        let body = json!({"usage": {"prompt_tokens": 5, "completion_tokens": 5}});
        acc.record_from_response(&body, Duration::from_millis(100));
        acc.record_from_response(&body, Duration::from_millis(100));
        assert_eq!(acc.snapshot().output_tokens, 10);
    }
}

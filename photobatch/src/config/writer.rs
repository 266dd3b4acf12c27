//! INI serialization: `EngineConfig` → commented INI text.

use std::fmt::Write;

use super::settings::EngineConfig;
use super::size::format_size;

/// Renders a config in the format `parse_ini` reads.
pub(super) fn to_config_string(config: &EngineConfig) -> String {
    let mut concurrency = String::new();
    for (task_type, limit) in &config.concurrency.limits {
        let _ = writeln!(concurrency, "{} = {}", task_type.key(), limit);
    }

    format!(
        r#"[resources]
; Memory budget shared by all running tasks (KB, MB, GB, TB suffixes)
max_memory = {max_memory}
max_cpu_cores = {max_cpu_cores}
; Log a warning when usage of either limit crosses this fraction
usage_alert_fraction = {usage_alert_fraction}

[processor]
; Worker pool size is min(max_workers, max_cpu_cores)
max_workers = {max_workers}
; Cached pipeline results (entries)
cache_size = {cache_size}
shutdown_grace_secs = {shutdown_grace_secs}

[scheduler]
max_concurrent_tasks = {max_concurrent_tasks}
; Backoff for tasks denied resources: base * 2^n, capped at max
requeue_base_delay_ms = {requeue_base_delay_ms}
requeue_max_delay_ms = {requeue_max_delay_ms}

[concurrency]
; Per task type caps; any other key defines a custom task type
{concurrency}
[export]
; Attempts per stage for recoverable errors, including the first
max_retry_attempts = {max_retry_attempts}
retry_base_delay_ms = {retry_base_delay_ms}
retry_max_delay_ms = {retry_max_delay_ms}
; overwrite or suffix (name-1.ext, name-2.ext, ...)
conflict_policy = {conflict_policy}

[logging]
directory = {log_directory}
file = {log_file}
"#,
        max_memory = format_size(config.resources.max_memory),
        max_cpu_cores = config.resources.max_cpu_cores,
        usage_alert_fraction = config.resources.usage_alert_fraction,
        max_workers = config.processor.max_workers,
        cache_size = config.processor.cache_size,
        shutdown_grace_secs = config.processor.shutdown_grace.as_secs(),
        max_concurrent_tasks = config.scheduler.max_concurrent_tasks,
        requeue_base_delay_ms = config.scheduler.requeue_base_delay.as_millis(),
        requeue_max_delay_ms = config.scheduler.requeue_max_delay.as_millis(),
        concurrency = concurrency,
        max_retry_attempts = config.export.max_retry_attempts,
        retry_base_delay_ms = config.export.retry_base_delay.as_millis(),
        retry_max_delay_ms = config.export.retry_max_delay.as_millis(),
        conflict_policy = config.export.conflict_policy.key(),
        log_directory = config.logging.directory.to_string_lossy(),
        log_file = config.logging.file,
    )
}

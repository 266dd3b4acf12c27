//! INI parsing: the single place where INI keys map to settings fields.

use ini::{Ini, Properties};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::file::ConfigFileError;
use super::settings::EngineConfig;
use super::size::parse_size;
use crate::coordinator::TaskType;
use crate::export::ConflictPolicy;

fn invalid(section: &str, key: &str, value: &str, reason: &str) -> ConfigFileError {
    ConfigFileError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Parses `section.key` with `FromStr`, if present.
fn get_parsed<T: FromStr>(
    props: &Properties,
    section: &str,
    key: &str,
    reason: &str,
) -> Result<Option<T>, ConfigFileError> {
    match props.get(key) {
        None => Ok(None),
        Some(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(section, key, v, reason)),
    }
}

fn get_positive(props: &Properties, section: &str, key: &str) -> Result<Option<usize>, ConfigFileError> {
    match get_parsed::<usize>(props, section, key, "must be a positive integer")? {
        Some(0) => Err(invalid(section, key, "0", "must be a positive integer")),
        other => Ok(other),
    }
}

fn get_millis(props: &Properties, section: &str, key: &str) -> Result<Option<Duration>, ConfigFileError> {
    Ok(get_parsed::<u64>(props, section, key, "must be a whole number of milliseconds")?
        .map(Duration::from_millis))
}

/// Parses an `Ini` into an `EngineConfig`, overlaying defaults.
pub(super) fn parse_ini(ini: &Ini) -> Result<EngineConfig, ConfigFileError> {
    let mut config = EngineConfig::default();

    if let Some(s) = ini.section(Some("resources")) {
        if let Some(v) = s.get("max_memory") {
            config.resources.max_memory = parse_size(v).map_err(|_| {
                invalid("resources", "max_memory", v, "expected format like '4GB' or '512MB'")
            })?;
        }
        if let Some(v) = get_positive(s, "resources", "max_cpu_cores")? {
            config.resources.max_cpu_cores = u32::try_from(v)
                .map_err(|_| invalid("resources", "max_cpu_cores", &v.to_string(), "too large"))?;
        }
        if let Some(v) =
            get_parsed::<f64>(s, "resources", "usage_alert_fraction", "must be a number in (0, 1]")?
        {
            if !(v > 0.0 && v <= 1.0) {
                return Err(invalid(
                    "resources",
                    "usage_alert_fraction",
                    &v.to_string(),
                    "must be a number in (0, 1]",
                ));
            }
            config.resources.usage_alert_fraction = v;
        }
    }

    if let Some(s) = ini.section(Some("processor")) {
        if let Some(v) = get_positive(s, "processor", "max_workers")? {
            config.processor.max_workers = v;
        }
        if let Some(v) = get_parsed(s, "processor", "cache_size", "must be a whole number of entries")? {
            config.processor.cache_size = v;
        }
        if let Some(v) =
            get_parsed::<u64>(s, "processor", "shutdown_grace_secs", "must be a whole number of seconds")?
        {
            config.processor.shutdown_grace = Duration::from_secs(v);
        }
    }

    if let Some(s) = ini.section(Some("scheduler")) {
        if let Some(v) = get_positive(s, "scheduler", "max_concurrent_tasks")? {
            config.scheduler.max_concurrent_tasks = v;
        }
        if let Some(v) = get_millis(s, "scheduler", "requeue_base_delay_ms")? {
            config.scheduler.requeue_base_delay = v;
        }
        if let Some(v) = get_millis(s, "scheduler", "requeue_max_delay_ms")? {
            config.scheduler.requeue_max_delay = v;
        }
        if config.scheduler.requeue_max_delay < config.scheduler.requeue_base_delay {
            return Err(invalid(
                "scheduler",
                "requeue_max_delay_ms",
                &config.scheduler.requeue_max_delay.as_millis().to_string(),
                "must not be below requeue_base_delay_ms",
            ));
        }
    }

    if let Some(s) = ini.section(Some("concurrency")) {
        for (key, value) in s.iter() {
            let limit: usize = value
                .trim()
                .parse()
                .map_err(|_| invalid("concurrency", key, value, "must be a whole number of tasks"))?;
            let task_type = TaskType::from_key(key.trim());
            match config.concurrency.limits.iter_mut().find(|(t, _)| *t == task_type) {
                Some(entry) => entry.1 = limit,
                None => config.concurrency.limits.push((task_type, limit)),
            }
        }
    }

    if let Some(s) = ini.section(Some("export")) {
        if let Some(v) = get_positive(s, "export", "max_retry_attempts")? {
            config.export.max_retry_attempts = u32::try_from(v)
                .map_err(|_| invalid("export", "max_retry_attempts", &v.to_string(), "too large"))?;
        }
        if let Some(v) = get_millis(s, "export", "retry_base_delay_ms")? {
            config.export.retry_base_delay = v;
        }
        if let Some(v) = get_millis(s, "export", "retry_max_delay_ms")? {
            config.export.retry_max_delay = v;
        }
        if let Some(v) = s.get("conflict_policy") {
            config.export.conflict_policy = ConflictPolicy::from_key(v).ok_or_else(|| {
                invalid("export", "conflict_policy", v, "must be 'overwrite' or 'suffix'")
            })?;
        }
    }

    if let Some(s) = ini.section(Some("logging")) {
        if let Some(v) = s.get("directory").map(str::trim).filter(|v| !v.is_empty()) {
            config.logging.directory = PathBuf::from(v);
        }
        if let Some(v) = s.get("file").map(str::trim).filter(|v| !v.is_empty()) {
            config.logging.file = v.to_string();
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<EngineConfig, ConfigFileError> {
        parse_ini(&Ini::load_from_str(text).unwrap())
    }

    #[test]
    fn test_empty_is_defaults() {
        assert_eq!(parse("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_full_file() {
        let config = parse(
            r#"
[resources]
max_memory = 2GB
max_cpu_cores = 6
usage_alert_fraction = 0.75

[processor]
max_workers = 3
cache_size = 32
shutdown_grace_secs = 2

[scheduler]
max_concurrent_tasks = 12
requeue_base_delay_ms = 5
requeue_max_delay_ms = 500

[concurrency]
transform = 2
thumbnail = 1

[export]
max_retry_attempts = 5
retry_base_delay_ms = 50
retry_max_delay_ms = 800
conflict_policy = suffix

[logging]
directory = /var/log/photobatch
file = engine.log
"#,
        )
        .unwrap();

        assert_eq!(config.resources.max_memory, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.resources.max_cpu_cores, 6);
        assert_eq!(config.resources.usage_alert_fraction, 0.75);
        assert_eq!(config.processor.max_workers, 3);
        assert_eq!(config.processor.cache_size, 32);
        assert_eq!(config.processor.shutdown_grace, Duration::from_secs(2));
        assert_eq!(config.scheduler.max_concurrent_tasks, 12);
        assert_eq!(config.scheduler.requeue_max_delay, Duration::from_millis(500));
        assert!(config.concurrency.limits.contains(&(TaskType::Transform, 2)));
        assert!(config
            .concurrency
            .limits
            .contains(&(TaskType::Custom("thumbnail".into()), 1)));
        assert!(config
            .concurrency
            .limits
            .iter()
            .any(|(t, _)| *t == TaskType::AnalysisExport));
        assert_eq!(config.export.max_retry_attempts, 5);
        assert_eq!(config.export.conflict_policy, ConflictPolicy::Suffix);
        assert_eq!(config.logging.directory, PathBuf::from("/var/log/photobatch"));
        assert_eq!(config.logging.file, "engine.log");
    }

    #[test]
    fn test_invalid_values_name_the_key() {
        let cases = [
            ("[resources]\nmax_memory = lots", "max_memory"),
            ("[resources]\nmax_cpu_cores = 0", "max_cpu_cores"),
            ("[resources]\nusage_alert_fraction = 1.5", "usage_alert_fraction"),
            ("[processor]\nmax_workers = -2", "max_workers"),
            ("[scheduler]\nrequeue_base_delay_ms = 100\nrequeue_max_delay_ms = 10", "requeue_max_delay_ms"),
            ("[concurrency]\ntransform = many", "transform"),
            ("[export]\nconflict_policy = rename", "conflict_policy"),
        ];
        for (text, expected_key) in cases {
            match parse(text) {
                Err(ConfigFileError::InvalidValue { key, .. }) => assert_eq!(key, expected_key, "{text}"),
                other => panic!("expected InvalidValue for {text}, got {other:?}"),
            }
        }
    }
}

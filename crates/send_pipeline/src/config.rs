use std::{collections::HashMap, fs, path::Path, time::Duration};

use serde::Deserialize;

use crate::{retry::RetryPolicy, scheduler::SchedulerOptions};

pub const SETTINGS_FILE: &str = "send_pipeline.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SendPipelineSettings {
    pub database_url: String,
    pub homeserver_url: Option<String>,
    pub access_token: Option<String>,
    pub sender_id: Option<String>,
    pub worker_count: usize,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for SendPipelineSettings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/send_pipeline.db".into(),
            homeserver_url: None,
            access_token: None,
            sender_id: None,
            worker_count: 4,
            max_attempts: 5,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            request_timeout_secs: 30,
        }
    }
}

impl SendPipelineSettings {
    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            worker_count: self.worker_count,
            max_attempts: self.max_attempts,
            retry_policy: RetryPolicy::new(self.retry_base_delay_ms, self.retry_max_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn set(&mut self, key: &str, value: &str) {
        match key {
            "database_url" => self.database_url = normalize_database_url(value),
            "homeserver_url" => self.homeserver_url = Some(value.to_string()),
            "access_token" => self.access_token = Some(value.to_string()),
            "sender_id" => self.sender_id = Some(value.to_string()),
            "worker_count" => set_parsed(&mut self.worker_count, value),
            "max_attempts" => set_parsed(&mut self.max_attempts, value),
            "retry_base_delay_ms" => set_parsed(&mut self.retry_base_delay_ms, value),
            "retry_max_delay_ms" => set_parsed(&mut self.retry_max_delay_ms, value),
            "request_timeout_secs" => set_parsed(&mut self.request_timeout_secs, value),
            _ => {}
        }
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, value: &str) {
    if let Ok(parsed) = value.trim().parse::<T>() {
        *slot = parsed;
    }
}

/// Defaults, then `send_pipeline.toml` in the working directory, then the
/// environment (`SEND_PIPELINE_<KEY>`, overridden by `APP__<KEY>`).
pub fn load_settings() -> SendPipelineSettings {
    let mut settings = settings_from_file(Path::new(SETTINGS_FILE));
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    settings
}

pub fn settings_from_file(path: &Path) -> SendPipelineSettings {
    let mut settings = SendPipelineSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            for (key, value) in file_cfg {
                let value = match value {
                    toml::Value::String(s) => s,
                    other => other.to_string(),
                };
                settings.set(&key, &value);
            }
        }
    }

    settings
}

const KEYS: [&str; 9] = [
    "database_url",
    "homeserver_url",
    "access_token",
    "sender_id",
    "worker_count",
    "max_attempts",
    "retry_base_delay_ms",
    "retry_max_delay_ms",
    "request_timeout_secs",
];

pub fn apply_env_overrides(
    settings: &mut SendPipelineSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    for key in KEYS {
        let upper = key.to_ascii_uppercase();
        for name in [format!("SEND_PIPELINE_{upper}"), format!("APP__{upper}")] {
            if let Some(value) = lookup(&name) {
                settings.set(key, &value);
            }
        }
    }
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return SendPipelineSettings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

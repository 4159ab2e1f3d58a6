use std::path::PathBuf;
use std::str::FromStr;

use crate::filters::{DEFAULT_EXCLUDED_DOMAINS, DEFAULT_EXCLUDED_EMAILS};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {name}")]
    Invalid { name: &'static str, value: String },
}

/// How the API handles an accepted webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Persist the payload, then run one drain pass.
    Queue,
    /// Process the payload in the request without touching the queue.
    Direct,
}

impl FromStr for ProcessingMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queue" => Ok(ProcessingMode::Queue),
            "direct" => Ok(ProcessingMode::Direct),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MauticSettings {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub api_bind: String,
    pub queue_dir: PathBuf,
    pub mode: ProcessingMode,
    pub max_attempts: u32,
    pub poll_interval_secs: u64,
    pub webhook_secret: Option<String>,
    pub products_path: Option<PathBuf>,
    pub excluded_emails: Vec<String>,
    pub excluded_domains: Vec<String>,
    pub mautic: MauticSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup; `from_env` passes the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_bind = var("FREEM_API_BIND").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let queue_dir = var("FREEM_QUEUE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./queue"));
        let mode = match var("FREEM_MODE") {
            Some(value) => value.parse().map_err(|_| SettingsError::Invalid {
                name: "FREEM_MODE",
                value,
            })?,
            None => ProcessingMode::Queue,
        };
        let max_attempts = parse_or("FREEM_MAX_ATTEMPTS", var("FREEM_MAX_ATTEMPTS"), 0)?;
        let poll_interval_secs =
            parse_or("FREEM_POLL_INTERVAL_SECS", var("FREEM_POLL_INTERVAL_SECS"), 30)?;
        let webhook_secret = var("FREEM_WEBHOOK_SECRET");
        let products_path = var("FREEM_PRODUCTS_PATH").map(PathBuf::from);
        let excluded_emails = var("FREEM_EXCLUDED_EMAILS")
            .map(|v| split_list(&v))
            .unwrap_or_else(|| owned(DEFAULT_EXCLUDED_EMAILS));
        let excluded_domains = var("FREEM_EXCLUDED_DOMAINS")
            .map(|v| split_list(&v))
            .unwrap_or_else(|| owned(DEFAULT_EXCLUDED_DOMAINS));

        let base_url = var("MAUTIC_API_URL")
            .or_else(|| var("MAUTICAPIURL"))
            .ok_or(SettingsError::Missing("MAUTIC_API_URL"))?;
        let username = var("MAUTIC_API_USER")
            .or_else(|| var("MAUTICAPIUSER"))
            .ok_or(SettingsError::Missing("MAUTIC_API_USER"))?;
        let password = var("MAUTIC_API_PASSWORD")
            .or_else(|| var("MAUTICAPIPW"))
            .ok_or(SettingsError::Missing("MAUTIC_API_PASSWORD"))?;
        let timeout_secs = parse_or("FREEM_CRM_TIMEOUT_SECS", var("FREEM_CRM_TIMEOUT_SECS"), 30)?;

        Ok(Self {
            api_bind,
            queue_dir,
            mode,
            max_attempts,
            poll_interval_secs,
            webhook_secret,
            products_path,
            excluded_emails,
            excluded_domains,
            mautic: MauticSettings {
                base_url,
                username,
                password,
                timeout_secs,
            },
        })
    }
}

fn parse_or<T: FromStr>(
    name: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, SettingsError> {
    match value {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| SettingsError::Invalid { name, value }),
        None => Ok(default),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

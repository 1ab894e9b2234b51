use std::str::FromStr;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_TEXT_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";
const DEFAULT_CLUSTER_RADIUS: f64 = 0.07;
const MAX_LISTINGS_PER_SEARCH: usize = 60;
const MAX_RETRY_DELAY_MS: u64 = 60_000;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub gemini_api_key: Option<SecretString>,
    pub gemini_api_base: String,
    pub text_model: String,
    pub image_model: String,
    pub listings_per_search: usize,
    pub text_max_retries: u32,
    pub image_max_retries: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_jitter_ms: u64,
    pub cluster_radius: f64,
    pub http_timeout_secs: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub gemini_api_base: String,
    pub text_model: String,
    pub image_model: String,
    pub listings_per_search: usize,
    pub text_max_retries: u32,
    pub image_max_retries: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_jitter_ms: u64,
    pub cluster_radius: f64,
    pub http_timeout_secs: u64,
    pub has_gemini_key: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: None,
            gemini_api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            text_model: DEFAULT_TEXT_MODEL.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            listings_per_search: 15,
            text_max_retries: 4,
            image_max_retries: 2,
            retry_initial_delay_ms: 1_000,
            retry_jitter_ms: 1_000,
            cluster_radius: DEFAULT_CLUSTER_RADIUS,
            http_timeout_secs: 60,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            gemini_api_key: env::var("GEMINI_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            gemini_api_base: env::var("GEMINI_API_BASE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.gemini_api_base),
            text_model: env::var("GEMINI_TEXT_MODEL").unwrap_or(defaults.text_model),
            image_model: env::var("GEMINI_IMAGE_MODEL").unwrap_or(defaults.image_model),
            listings_per_search: parse_env("LISTINGS_PER_SEARCH", defaults.listings_per_search)
                .clamp(1, MAX_LISTINGS_PER_SEARCH),
            text_max_retries: parse_env("TEXT_MAX_RETRIES", defaults.text_max_retries),
            image_max_retries: parse_env("IMAGE_MAX_RETRIES", defaults.image_max_retries),
            retry_initial_delay_ms: parse_env(
                "RETRY_INITIAL_DELAY_MS",
                defaults.retry_initial_delay_ms,
            )
            .min(MAX_RETRY_DELAY_MS),
            retry_jitter_ms: parse_env("RETRY_JITTER_MS", defaults.retry_jitter_ms)
                .min(MAX_RETRY_DELAY_MS),
            cluster_radius: sanitize_radius(parse_env("CLUSTER_RADIUS", defaults.cluster_radius)),
            http_timeout_secs: parse_env("HTTP_TIMEOUT_SECS", defaults.http_timeout_secs).max(1),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            gemini_api_base: self.gemini_api_base.clone(),
            text_model: self.text_model.clone(),
            image_model: self.image_model.clone(),
            listings_per_search: self.listings_per_search,
            text_max_retries: self.text_max_retries,
            image_max_retries: self.image_max_retries,
            retry_initial_delay_ms: self.retry_initial_delay_ms,
            retry_jitter_ms: self.retry_jitter_ms,
            cluster_radius: self.cluster_radius,
            http_timeout_secs: self.http_timeout_secs,
            has_gemini_key: self.gemini_api_key.is_some(),
        }
    }
}

fn sanitize_radius(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value.min(1.0)
    } else {
        DEFAULT_CLUSTER_RADIUS
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions)
        || env::var("ALLOW_DOTENV").is_ok_and(|v| matches!(v.trim(), "1" | "true" | "TRUE"))
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

use std::str::FromStr;

use flagger_core::{Error, Result, SdkInfo};

pub(crate) const DEFAULT_SOURCE_URL: &str = "https://flags.airdeploy.io/v3/config/";
pub(crate) const DEFAULT_BACKUP_SOURCE_URL: &str = "https://backup-api.airshiphq.com/v3/config/";
pub(crate) const DEFAULT_SSE_URL: &str = "https://sse.airdeploy.io/v3/sse/";
pub(crate) const DEFAULT_INGESTION_URL: &str = "https://ingestion.airdeploy.io/v3/ingest/";

// Environment variable overrides, applied when the corresponding InitArgs
// field is empty.
pub(crate) const ENV_API_KEY: &str = "FLAGGER_API_KEY";
pub(crate) const ENV_SOURCE_URL: &str = "FLAGGER_SOURCE_URL";
pub(crate) const ENV_BACKUP_SOURCE_URL: &str = "FLAGGER_BACKUP_SOURCE_URL";
pub(crate) const ENV_SSE_URL: &str = "FLAGGER_SSE_URL";
pub(crate) const ENV_INGESTION_URL: &str = "FLAGGER_INGESTION_URL";
pub(crate) const ENV_LOG_LEVEL: &str = "FLAGGER_LOG_LEVEL";

/// Arguments for [`crate::Flagger::init`].
///
/// Every field left empty falls back first to its `FLAGGER_*` environment
/// variable and then to the production default.
///
/// # Examples
/// ```
/// # use flagger::InitArgs;
/// let args = InitArgs::from_api_key("api-key")
///     .source_url("https://flags.example.com/config/");
/// ```
#[derive(Debug, Clone, Default)]
pub struct InitArgs {
    pub api_key: String,
    pub source_url: String,
    pub backup_source_url: String,
    pub sse_url: String,
    pub ingestion_url: String,
    pub log_level: String,
}

impl InitArgs {
    /// Create init arguments using the specified API key and defaults for
    /// everything else.
    pub fn from_api_key(api_key: impl Into<String>) -> InitArgs {
        InitArgs {
            api_key: api_key.into(),
            ..InitArgs::default()
        }
    }

    /// Override the primary configuration source URL.
    pub fn source_url(mut self, url: impl Into<String>) -> InitArgs {
        self.source_url = url.into();
        self
    }

    /// Override the backup configuration source URL.
    pub fn backup_source_url(mut self, url: impl Into<String>) -> InitArgs {
        self.backup_source_url = url.into();
        self
    }

    /// Override the server-sent-events URL.
    pub fn sse_url(mut self, url: impl Into<String>) -> InitArgs {
        self.sse_url = url.into();
        self
    }

    /// Override the ingestion URL.
    pub fn ingestion_url(mut self, url: impl Into<String>) -> InitArgs {
        self.ingestion_url = url.into();
        self
    }

    /// Override the log level (`off`, `error`, `warn`, `info`, `debug`,
    /// `trace`). Defaults to `error`.
    pub fn log_level(mut self, level: impl Into<String>) -> InitArgs {
        self.log_level = level.into();
        self
    }
}

/// Fully resolved endpoints, each already carrying the API key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedArgs {
    pub source_url: String,
    pub backup_source_url: String,
    pub sse_url: String,
    pub ingestion_url: String,
}

/// Validate `args`, apply environment-variable overrides and defaults, and
/// append the API key to every URL. Does not mutate `args`.
pub(crate) fn resolve_args(args: &InitArgs, sdk_info: &SdkInfo) -> Result<ResolvedArgs> {
    let api_key = var_or_env(&args.api_key, ENV_API_KEY);
    if api_key.is_empty() {
        log::error!(target: "flagger", "empty API key");
        return Err(Error::BadInitArgs);
    }

    if sdk_info.name.is_empty() || sdk_info.version.is_empty() {
        log::error!(target: "flagger", "empty SDK name or version");
        return Err(Error::BadInitArgs);
    }

    let resolved = ResolvedArgs {
        source_url: resolve_url("SourceURL", &args.source_url, ENV_SOURCE_URL, DEFAULT_SOURCE_URL, &api_key)?,
        backup_source_url: resolve_url(
            "BackupSourceURL",
            &args.backup_source_url,
            ENV_BACKUP_SOURCE_URL,
            DEFAULT_BACKUP_SOURCE_URL,
            &api_key,
        )?,
        sse_url: resolve_url("SSEURL", &args.sse_url, ENV_SSE_URL, DEFAULT_SSE_URL, &api_key)?,
        ingestion_url: resolve_url(
            "IngestionURL",
            &args.ingestion_url,
            ENV_INGESTION_URL,
            DEFAULT_INGESTION_URL,
            &api_key,
        )?,
    };

    apply_log_level(&var_or_env(&args.log_level, ENV_LOG_LEVEL))?;

    Ok(resolved)
}

fn var_or_env(value: &str, env_key: &str) -> String {
    if value.is_empty() {
        std::env::var(env_key).unwrap_or_default()
    } else {
        value.to_owned()
    }
}

fn resolve_url(
    name: &str,
    value: &str,
    env_key: &str,
    default: &str,
    api_key: &str,
) -> Result<String> {
    let provided = var_or_env(value, env_key);
    let base = if provided.is_empty() {
        default.to_owned()
    } else {
        provided
    };

    // must parse as an absolute URL
    match url::Url::parse(&base) {
        Ok(_) => {
            log::debug!(target: "flagger", "{name}: {base}");
            Ok(format!("{base}{api_key}"))
        }
        Err(_) => {
            log::error!(target: "flagger", "malformed {name}: {base}");
            Err(Error::BadInitArgs)
        }
    }
}

fn apply_log_level(level: &str) -> Result<()> {
    let level = if level.is_empty() { "error" } else { level };

    match log::LevelFilter::from_str(level) {
        Ok(level) => {
            log::set_max_level(level);
            Ok(())
        }
        Err(_) => {
            log::set_max_level(log::LevelFilter::Error);
            log::error!(target: "flagger", "cannot parse provided log level {level:?}, error level is set");
            Err(Error::BadInitArgs)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    // environment variables are process-global; serialize the tests that
    // touch them
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn sdk_info() -> SdkInfo {
        SdkInfo {
            name: "rust".to_owned(),
            version: "3.0.0".to_owned(),
        }
    }

    #[test]
    fn api_key_is_appended_to_every_url() {
        let _guard = ENV_LOCK.lock().unwrap();
        let args = InitArgs::from_api_key("k-123")
            .source_url("https://flags.example.com/config/")
            .backup_source_url("https://backup.example.com/config/")
            .sse_url("https://sse.example.com/sse/")
            .ingestion_url("https://ingestion.example.com/ingest/");

        let resolved = resolve_args(&args, &sdk_info()).unwrap();

        assert_eq!(resolved.source_url, "https://flags.example.com/config/k-123");
        assert_eq!(resolved.backup_source_url, "https://backup.example.com/config/k-123");
        assert_eq!(resolved.sse_url, "https://sse.example.com/sse/k-123");
        assert_eq!(resolved.ingestion_url, "https://ingestion.example.com/ingest/k-123");
    }

    #[test]
    fn empty_api_key_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var(ENV_API_KEY);

        let result = resolve_args(&InitArgs::default(), &sdk_info());

        assert!(matches!(result, Err(Error::BadInitArgs)));
    }

    #[test]
    fn relative_url_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        let args = InitArgs::from_api_key("k-123").source_url("/config/");

        let result = resolve_args(&args, &sdk_info());

        assert!(matches!(result, Err(Error::BadInitArgs)));
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        let args = InitArgs::from_api_key("k-123").log_level("loud");

        let result = resolve_args(&args, &sdk_info());

        assert!(matches!(result, Err(Error::BadInitArgs)));
    }

    #[test]
    fn environment_variables_fill_empty_fields() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(ENV_API_KEY, "env-key");
        std::env::set_var(ENV_SOURCE_URL, "https://env.example.com/config/");

        let resolved = resolve_args(&InitArgs::default(), &sdk_info());

        std::env::remove_var(ENV_API_KEY);
        std::env::remove_var(ENV_SOURCE_URL);

        let resolved = resolved.unwrap();
        assert_eq!(resolved.source_url, "https://env.example.com/config/env-key");
        assert_eq!(
            resolved.ingestion_url,
            format!("{DEFAULT_INGESTION_URL}env-key")
        );
    }
}

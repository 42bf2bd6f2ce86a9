use std::path::PathBuf;
use std::time::Duration;

use std::str::FromStr;

use anyhow::{bail, Context, Result};
use xrm_reconcile::SelectionPolicy;

/// Controller settings, read from `XRM_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    /// JSON manifest to load on startup. Without one the controller idles.
    pub manifest_path: Option<PathBuf>,
    pub reconcile_interval: Duration,
    /// Deadline handed to each reconciliation pass.
    pub pass_timeout: Duration,
    pub max_concurrency: usize,
    pub selection_policy: SelectionPolicy,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            manifest_path: None,
            reconcile_interval: Duration::from_secs(10),
            pass_timeout: Duration::from_secs(30),
            max_concurrency: 8,
            selection_policy: SelectionPolicy::Lenient,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Unset keys keep their defaults;
    /// set keys must parse.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| -> Result<Duration> {
            Ok(parse(&var, key)?.map(Duration::from_secs).unwrap_or(default))
        };

        let max_concurrency =
            parse(&var, "XRM_MAX_CONCURRENCY")?.unwrap_or(defaults.max_concurrency);
        if max_concurrency == 0 {
            bail!("XRM_MAX_CONCURRENCY must be at least 1");
        }

        let selection_policy = match var("XRM_SELECTION_POLICY").as_deref() {
            None | Some("lenient") => SelectionPolicy::Lenient,
            Some("deterministic") => SelectionPolicy::Deterministic,
            Some(other) => bail!("unknown XRM_SELECTION_POLICY {other:?}"),
        };

        let backoff_base = secs("XRM_BACKOFF_BASE", defaults.backoff_base)?;
        let backoff_max = secs("XRM_BACKOFF_MAX", defaults.backoff_max)?;
        if backoff_max < backoff_base {
            bail!("XRM_BACKOFF_MAX must not be below XRM_BACKOFF_BASE");
        }

        Ok(Self {
            log_level: var("XRM_LOG_LEVEL").unwrap_or(defaults.log_level),
            manifest_path: var("XRM_MANIFEST").map(PathBuf::from),
            reconcile_interval: secs("XRM_RECONCILE_INTERVAL", defaults.reconcile_interval)?,
            pass_timeout: secs("XRM_PASS_TIMEOUT", defaults.pass_timeout)?,
            max_concurrency,
            selection_policy,
            backoff_base,
            backoff_max,
        })
    }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|raw| {
            raw.parse()
                .with_context(|| format!("invalid {key} value {raw:?}"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rstest::rstest;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.reconcile_interval, Duration::from_secs(10));
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.selection_policy, SelectionPolicy::Lenient);
        assert!(config.manifest_path.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("XRM_RECONCILE_INTERVAL", "2"),
            ("XRM_PASS_TIMEOUT", "5"),
            ("XRM_MAX_CONCURRENCY", "3"),
            ("XRM_MANIFEST", "/etc/xrm/manifest.json"),
            ("XRM_SELECTION_POLICY", "deterministic"),
        ])
        .unwrap();

        assert_eq!(config.reconcile_interval, Duration::from_secs(2));
        assert_eq!(config.pass_timeout, Duration::from_secs(5));
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(
            config.manifest_path,
            Some(PathBuf::from("/etc/xrm/manifest.json"))
        );
        assert_eq!(config.selection_policy, SelectionPolicy::Deterministic);
    }

    #[test]
    fn test_unparsable_number_names_the_variable() {
        let err = config(&[("XRM_PASS_TIMEOUT", "soon")]).unwrap_err();
        assert!(err.to_string().contains("XRM_PASS_TIMEOUT"), "{err:#}");
    }

    #[rstest]
    #[case("XRM_SELECTION_POLICY", "random")]
    #[case("XRM_MAX_CONCURRENCY", "0")]
    #[case("XRM_BACKOFF_MAX", "0")]
    #[case("XRM_MAX_CONCURRENCY", "-1")]
    #[case("XRM_RECONCILE_INTERVAL", "10s")]
    fn test_rejects(#[case] key: &str, #[case] value: &str) {
        assert!(config(&[(key, value)]).is_err());
    }
}

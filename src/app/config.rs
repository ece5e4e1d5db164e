use crate::app::AppError;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub enode_client_id: String,
    pub enode_client_secret: String,
    pub enode_base_url: String,
    pub enode_auth_url: String,
    pub webhook_url: String,
    pub webhook_secret: String,
    pub mobile_push_url: Option<String>,
    pub db_path: String,
    pub http_bind: String,
    pub poll_interval_secs: u64,
    pub poll_grace_secs: u64,
    pub monitor_interval_secs: u64,
    pub monitor_grace_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            enode_client_id: required(&lookup, "ENODE_CLIENT_ID")?,
            enode_client_secret: required(&lookup, "ENODE_CLIENT_SECRET")?,
            enode_base_url: optional(&lookup, "ENODE_BASE_URL")
                .unwrap_or_else(|| "https://enode-api.production.enode.io".to_string()),
            enode_auth_url: optional(&lookup, "ENODE_AUTH_URL")
                .unwrap_or_else(|| "https://oauth.production.enode.io/oauth2/token".to_string()),
            webhook_url: required(&lookup, "WEBHOOK_URL")?,
            webhook_secret: required(&lookup, "ENODE_WEBHOOK_SECRET")?,
            mobile_push_url: optional(&lookup, "MOBILE_PUSH_URL"),
            db_path: optional(&lookup, "DB_PATH")
                .unwrap_or_else(|| "/var/lib/enode/telemetry.db".to_string()),
            http_bind: optional(&lookup, "HTTP_BIND")
                .unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            poll_interval_secs: parse_or_default(&lookup, "POLL_INTERVAL_SECS", 300_u64)?,
            poll_grace_secs: parse_or_default(&lookup, "POLL_GRACE_SECS", 120_u64)?,
            monitor_interval_secs: parse_or_default(&lookup, "MONITOR_INTERVAL_SECS", 1800_u64)?,
            monitor_grace_secs: parse_or_default(&lookup, "MONITOR_GRACE_SECS", 60_u64)?,
        })
    }
}

fn required<F>(lookup: &F, key: &str) -> Result<String, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    optional(lookup, key).ok_or_else(|| AppError::config(format!("{key} is required")))
}

fn optional<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or_default<T, F>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::config(format!("{key} must be a valid number"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::AppConfig;

    fn minimal(key: &str) -> Option<String> {
        match key {
            "ENODE_CLIENT_ID" => Some("client-id".to_string()),
            "ENODE_CLIENT_SECRET" => Some("client-secret".to_string()),
            "ENODE_WEBHOOK_SECRET" => Some("webhook-secret".to_string()),
            "WEBHOOK_URL" => Some("https://example.com/webhook/enode".to_string()),
            _ => None,
        }
    }

    #[test]
    fn rejects_missing_client_id() {
        let result = AppConfig::from_lookup(|key| match key {
            "ENODE_CLIENT_ID" => None,
            other => minimal(other),
        });

        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err().to_string(),
            "invalid configuration: ENODE_CLIENT_ID is required"
        );
    }

    #[test]
    fn applies_defaults_for_optional_fields() {
        let config = AppConfig::from_lookup(minimal).expect("config should be valid");

        assert_eq!(config.enode_client_id, "client-id");
        assert_eq!(
            config.enode_base_url,
            "https://enode-api.production.enode.io"
        );
        assert_eq!(config.mobile_push_url, None);
        assert_eq!(config.db_path, "/var/lib/enode/telemetry.db");
        assert_eq!(config.http_bind, "0.0.0.0:8080");
        assert_eq!(config.poll_interval_secs, 300);
        assert_eq!(config.poll_grace_secs, 120);
        assert_eq!(config.monitor_interval_secs, 1800);
        assert_eq!(config.monitor_grace_secs, 60);
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let result = AppConfig::from_lookup(|key| match key {
            "POLL_INTERVAL_SECS" => Some("abc".to_string()),
            other => minimal(other),
        });

        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err().to_string(),
            "invalid configuration: POLL_INTERVAL_SECS must be a valid number"
        );
    }

    #[test]
    fn treats_blank_values_as_missing() {
        let result = AppConfig::from_lookup(|key| match key {
            "WEBHOOK_URL" => Some("   ".to_string()),
            other => minimal(other),
        });

        assert!(result.is_err());
    }
}

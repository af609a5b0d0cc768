// src/config.rs
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,
    pub jwt_secret: String,
    pub stripe_webhook_secret: String,
    #[serde(default = "default_llm_api_url")]
    pub llm_api_url: String,
    #[serde(default)]
    pub llm_api_key: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    pub email_api_url: Option<String>,
    pub email_api_key: Option<String>,
    #[serde(default = "default_email_from")]
    pub email_from: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_trust_recalc_interval")]
    pub trust_recalc_interval_secs: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_llm_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_email_from() -> String {
    "SoulBond <hello@soulbond.ai>".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_trust_recalc_interval() -> u64 {
    3600
}

impl Config {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env()
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            database_url: "postgres://localhost/soulbond_test".to_string(),
            database_max_connections: default_max_connections(),
            jwt_secret: "test-secret".to_string(),
            stripe_webhook_secret: "whsec_test".to_string(),
            llm_api_url: default_llm_api_url(),
            llm_api_key: String::new(),
            llm_model: default_llm_model(),
            email_api_url: None,
            email_api_key: None,
            email_from: default_email_from(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            trust_recalc_interval_secs: default_trust_recalc_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_optional_settings() {
        let vars = vec![
            ("DATABASE_URL".to_string(), "postgres://db/soulbond".to_string()),
            ("JWT_SECRET".to_string(), "s3cret".to_string()),
            ("STRIPE_WEBHOOK_SECRET".to_string(), "whsec_x".to_string()),
        ];
        let config: Config = envy::from_iter(vars).unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.bind_addr, "127.0.0.1");
        assert_eq!(config.llm_model, "gpt-4o-mini");
        assert_eq!(config.trust_recalc_interval_secs, 3600);
        assert!(config.email_api_url.is_none());
    }

    #[test]
    fn missing_required_setting_is_an_error() {
        let vars = vec![("DATABASE_URL".to_string(), "postgres://db".to_string())];
        assert!(envy::from_iter::<_, Config>(vars).is_err());
    }
}

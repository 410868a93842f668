use std::env;
use std::path::PathBuf;

use wish_core::{GiftId, PROGRESS_FILE};

pub const DEFAULT_TEXT_API_BASE_URL: &str = "https://api.x.ai/v1";
pub const DEFAULT_TEXT_API_MODEL: &str = "grok-beta";
pub const DEFAULT_CALL_API_BASE_URL: &str = "https://api.vapi.ai";
pub const DEFAULT_SPECIAL_GIFTS: [GiftId; 3] = [28, 24, 19];
pub const CALL_PROFILES_FILE: &str = "call_profiles.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextApiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallApiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub destination: Option<String>,
    pub profiles_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub progress_path: PathBuf,
    pub seed: Option<u64>,
    pub special_gifts: Vec<GiftId>,
    pub max_gift_id: GiftId,
    pub text_api: TextApiConfig,
    pub call_api: CallApiConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let data_dir = PathBuf::from(var("WISH_DATA_DIR").unwrap_or_else(|| "data".into()));
        let progress_path = var("WISH_PROGRESS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join(PROGRESS_FILE));
        let profiles_path = data_dir.join(CALL_PROFILES_FILE);

        Self {
            host: var("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or("PORT", var("PORT"), 8080),
            seed: var("WISH_SEED").and_then(|raw| parse_opt("WISH_SEED", &raw)),
            special_gifts: var("WISH_SPECIAL_GIFTS")
                .map(|raw| parse_id_list(&raw))
                .unwrap_or_else(|| DEFAULT_SPECIAL_GIFTS.to_vec()),
            max_gift_id: parse_or("WISH_MAX_GIFT_ID", var("WISH_MAX_GIFT_ID"), 30),
            text_api: TextApiConfig {
                api_key: var("TEXT_API_KEY"),
                base_url: var("TEXT_API_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_TEXT_API_BASE_URL.into()),
                model: var("TEXT_API_MODEL").unwrap_or_else(|| DEFAULT_TEXT_API_MODEL.into()),
            },
            call_api: CallApiConfig {
                api_key: var("CALL_API_KEY"),
                base_url: var("CALL_API_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_CALL_API_BASE_URL.into()),
                destination: var("CALL_DESTINATION"),
                profiles_path,
            },
            data_dir,
            progress_path,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_opt<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("ignoring invalid {key}={raw}");
            None
        }
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> T {
    raw.and_then(|raw| parse_opt(key, &raw)).unwrap_or(default)
}

fn parse_id_list(raw: &str) -> Vec<GiftId> {
    raw.split(',')
        .filter(|part| !part.trim().is_empty())
        .filter_map(|part| parse_opt("WISH_SPECIAL_GIFTS", part))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = config(&[]);
        assert_eq!(cfg.bind_addr(), "0.0.0.0:8080");
        assert_eq!(cfg.data_dir, PathBuf::from("data"));
        assert_eq!(cfg.progress_path, PathBuf::from("data").join("progress.json"));
        assert_eq!(cfg.special_gifts, vec![28, 24, 19]);
        assert_eq!(cfg.max_gift_id, 30);
        assert_eq!(cfg.seed, None);
        assert_eq!(cfg.text_api.api_key, None);
        assert_eq!(cfg.text_api.model, "grok-beta");
        assert_eq!(
            cfg.call_api.profiles_path,
            PathBuf::from("data").join("call_profiles.json")
        );
    }

    #[test]
    fn reads_overrides_and_skips_bad_values() {
        let cfg = config(&[
            ("WISH_DATA_DIR", "/srv/wishes"),
            ("PORT", "not-a-port"),
            ("WISH_SEED", "42"),
            ("WISH_SPECIAL_GIFTS", "5, x,10,"),
            ("TEXT_API_KEY", "  "),
            ("CALL_DESTINATION", "+15550100"),
        ]);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.seed, Some(42));
        assert_eq!(cfg.special_gifts, vec![5, 10]);
        assert_eq!(cfg.progress_path, PathBuf::from("/srv/wishes/progress.json"));
        assert_eq!(cfg.text_api.api_key, None);
        assert_eq!(cfg.call_api.destination.as_deref(), Some("+15550100"));
    }
}

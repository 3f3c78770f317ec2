use crate::error::*;

use serde_derive::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Posix,
}

impl Default for StoreKind {
    fn default() -> StoreKind {
        StoreKind::Posix
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default)]
    pub kind: StoreKind,
    pub root: String,
    #[serde(default)]
    pub host: Option<String>,
}

impl EndpointConfig {
    /// Host label feeding the status store name derivation.  Falls back to
    /// a slug of the root path when no host is configured.
    pub fn host_label(&self) -> String {
        match &self.host {
            Some(host) => host.clone(),
            None => self.root.trim_matches('/').replace('/', "-"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketMapping {
    pub src: String,
    pub dst: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Input {
    pub source: EndpointConfig,
    pub destination: EndpointConfig,
    pub status: EndpointConfig,
    /// ordered source -> destination bucket mappings
    pub buckets: Vec<BucketMapping>,
    #[serde(default = "default_num_threads")]
    pub num_threads: u32,
    /// threshold between whole and chunked transfer, and the chunk size
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// digest re-upload period, in completed objects
    #[serde(default = "default_digest_refresh")]
    pub digest_refresh: u64,
    #[serde(default)]
    pub delete_source: bool,
    #[serde(default)]
    pub create_directories: bool,
    #[serde(default)]
    pub force_resume: bool,
}

fn default_num_threads() -> u32 {
    1
}

fn default_block_size() -> u64 {
    1024 * 1024
}

fn default_max_retries() -> u32 {
    3
}

fn default_digest_refresh() -> u64 {
    50
}

impl Input {
    pub fn new(input: &str) -> MigResult<Self> {
        let parsed: Input = serde_json::from_str(input)?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> MigResult<()> {
        if self.buckets.is_empty() {
            return Err(MigError::InvalidConfigError(
                "no bucket mappings configured".to_string(),
            ));
        }
        for mapping in &self.buckets {
            if mapping.src.is_empty() || mapping.dst.is_empty() {
                return Err(MigError::InvalidConfigError(
                    "bucket mappings need both a src and a dst".to_string(),
                ));
            }
        }
        if self.num_threads == 0 {
            return Err(MigError::InvalidConfigError(
                "num_threads must be at least 1".to_string(),
            ));
        }
        if self.block_size == 0 {
            return Err(MigError::InvalidConfigError(
                "block_size must be nonzero".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(MigError::InvalidConfigError(
                "max_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> String {
        r#"{
            "source": { "root": "/exports/src" },
            "destination": { "root": "/exports/dst", "host": "dst.example" },
            "status": { "root": "/exports/status" },
            "buckets": [ { "src": "photos", "dst": "photos-copy" } ]
        }"#
        .to_string()
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let input = Input::new(&minimal_config()).expect("parse");
        assert_eq!(input.num_threads, 1);
        assert_eq!(input.block_size, 1024 * 1024);
        assert_eq!(input.max_retries, 3);
        assert_eq!(input.digest_refresh, 50);
        assert!(!input.delete_source);
        assert_eq!(input.source.host_label(), "exports-src");
        assert_eq!(input.destination.host_label(), "dst.example");
    }

    #[test]
    fn rejects_empty_bucket_list() {
        let text = minimal_config().replace(
            r#"[ { "src": "photos", "dst": "photos-copy" } ]"#,
            "[]",
        );
        assert!(Input::new(&text).is_err());
    }

    #[test]
    fn rejects_zero_threads() {
        let text = minimal_config().replace(
            "\"buckets\":",
            "\"num_threads\": 0, \"buckets\":",
        );
        assert!(Input::new(&text).is_err());
    }

    #[test]
    fn rejects_missing_endpoint() {
        let text = minimal_config().replace(r#""status": { "root": "/exports/status" },"#, "");
        assert!(Input::new(&text).is_err());
    }
}

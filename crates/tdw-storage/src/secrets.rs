//! Warehouse credential lookup by logical secret id.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

fn default_port() -> u16 {
    5432
}

/// Connection parameters for the warehouse, as stored in the secret.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseSecret {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    #[serde(default)]
    pub schema: Option<String>,
}

impl fmt::Debug for WarehouseSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarehouseSecret")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("schema", &self.schema)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret {0:?} not found")]
    NotFound(String),
    #[error("secret {id:?} could not be read: {source}")]
    Unreadable {
        id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("secret {id:?} is malformed: {message}")]
    Malformed { id: String, message: String },
}

#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn fetch_secret(&self, secret_id: &str) -> Result<WarehouseSecret, SecretError>;
}

/// Environment variable holding the JSON secret for `secret_id`:
/// `tdw/warehouse` becomes `TDW_WAREHOUSE`.
pub fn env_var_for_secret(secret_id: &str) -> String {
    secret_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

#[derive(Debug, Default, Clone)]
pub struct EnvSecretProvider;

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn fetch_secret(&self, secret_id: &str) -> Result<WarehouseSecret, SecretError> {
        let var = env_var_for_secret(secret_id);
        let raw = std::env::var(&var).map_err(|_| SecretError::NotFound(secret_id.to_string()))?;
        serde_json::from_str(&raw).map_err(|err| SecretError::Malformed {
            id: secret_id.to_string(),
            message: err.to_string(),
        })
    }
}

/// Secrets kept as `<dir>/<id>.yaml`, with `/` in the id mapped to `__`.
#[derive(Debug, Clone)]
pub struct FileSecretProvider {
    dir: PathBuf,
}

impl FileSecretProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, secret_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.yaml", secret_id.replace('/', "__")))
    }
}

#[async_trait]
impl SecretProvider for FileSecretProvider {
    async fn fetch_secret(&self, secret_id: &str) -> Result<WarehouseSecret, SecretError> {
        let path = self.path_for(secret_id);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SecretError::NotFound(secret_id.to_string()))
            }
            Err(source) => {
                return Err(SecretError::Unreadable {
                    id: secret_id.to_string(),
                    source,
                })
            }
        };
        serde_yaml::from_str(&text).map_err(|err| SecretError::Malformed {
            id: secret_id.to_string(),
            message: err.to_string(),
        })
    }
}

/// Tries each provider in turn; only `NotFound` falls through to the next.
pub struct ChainSecretProvider {
    providers: Vec<Box<dyn SecretProvider>>,
}

impl ChainSecretProvider {
    pub fn new(providers: Vec<Box<dyn SecretProvider>>) -> Self {
        Self { providers }
    }

    pub fn env_then_dir(dir: impl Into<PathBuf>) -> Self {
        Self::new(vec![
            Box::new(EnvSecretProvider),
            Box::new(FileSecretProvider::new(dir)),
        ])
    }
}

#[async_trait]
impl SecretProvider for ChainSecretProvider {
    async fn fetch_secret(&self, secret_id: &str) -> Result<WarehouseSecret, SecretError> {
        for provider in &self.providers {
            match provider.fetch_secret(secret_id).await {
                Err(SecretError::NotFound(_)) => continue,
                other => return other,
            }
        }
        Err(SecretError::NotFound(secret_id.to_string()))
    }
}

/// Hands out one fixed secret regardless of id.
#[derive(Debug, Clone)]
pub struct StaticSecretProvider(pub WarehouseSecret);

#[async_trait]
impl SecretProvider for StaticSecretProvider {
    async fn fetch_secret(&self, _secret_id: &str) -> Result<WarehouseSecret, SecretError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn env_var_name_is_upper_snake() {
        assert_eq!(env_var_for_secret("tdw/warehouse"), "TDW_WAREHOUSE");
        assert_eq!(env_var_for_secret("prod-dds.creds"), "PROD_DDS_CREDS");
    }

    #[test]
    fn debug_output_hides_password() {
        let secret = WarehouseSecret {
            host: "localhost".into(),
            port: 5432,
            username: "tdw".into(),
            password: "hunter2".into(),
            database: "dds".into(),
            schema: None,
        };
        assert!(!format!("{secret:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn file_provider_reads_yaml_and_defaults_port() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("tdw__warehouse.yaml"),
            "host: db.internal\nusername: loader\npassword: pw\ndatabase: dds\nschema: dds_schema\n",
        )
        .unwrap();

        let secret = FileSecretProvider::new(dir.path())
            .fetch_secret("tdw/warehouse")
            .await
            .expect("secret");
        assert_eq!(secret.host, "db.internal");
        assert_eq!(secret.port, 5432);
        assert_eq!(secret.schema.as_deref(), Some("dds_schema"));
    }

    #[tokio::test]
    async fn chain_falls_through_missing_and_stops_on_malformed() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("broken.yaml"), "host: [").unwrap();
        let chain = ChainSecretProvider::env_then_dir(dir.path());

        let missing = chain.fetch_secret("tdw-test-definitely-absent").await.unwrap_err();
        assert!(matches!(missing, SecretError::NotFound(_)));

        let malformed = chain.fetch_secret("broken").await.unwrap_err();
        assert!(matches!(malformed, SecretError::Malformed { .. }));
    }
}

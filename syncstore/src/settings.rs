//! Backend selection from configuration.
//!
//! [`StorageSettings`] is resolved once at start up, typically deserialized from the
//! service configuration, and turned into a backend by [`connect`].

use serde::{Deserialize, Serialize};
use tracing::info;

use syncstore_core::{
    backend::{DynStorageBackend, StorageBackendBuilder},
    error::{StorageError, StorageResult},
};
use syncstore_memory::InMemoryStore;

/// Storage backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageSettings {
    /// In-process storage, lost on restart.
    Memory {
        #[serde(default)]
        readonly: bool,
    },

    /// MongoDB used as a key/value store.
    #[serde(rename = "mongodb")]
    MongoDb {
        /// Connection string.
        url: String,

        #[serde(default = "default_database")]
        database: String,

        #[serde(default = "default_pool_size")]
        max_pool_size: u32,

        /// Bound on server selection, and so on every operation, in milliseconds.
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,

        /// Attempts of the collection timestamp compare-and-swap loop.
        #[serde(default = "default_cas_attempts")]
        cas_max_attempts: usize,

        #[serde(default)]
        readonly: bool,
    },

    /// PostgreSQL.
    #[serde(rename = "postgresql")]
    Postgres {
        /// Connection URL.
        url: String,

        #[serde(default = "default_pool_size")]
        max_connections: u32,

        /// Bound on acquiring a pooled connection, in milliseconds.
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,

        #[serde(default)]
        readonly: bool,
    },
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings::Memory { readonly: false }
    }
}

impl StorageSettings {
    /// The backend name, as written in configuration.
    pub fn backend_name(&self) -> &'static str {
        match self {
            StorageSettings::Memory { .. } => "memory",
            StorageSettings::MongoDb { .. } => "mongodb",
            StorageSettings::Postgres { .. } => "postgresql",
        }
    }

    pub fn is_readonly(&self) -> bool {
        match self {
            StorageSettings::Memory { readonly }
            | StorageSettings::MongoDb { readonly, .. }
            | StorageSettings::Postgres { readonly, .. } => *readonly,
        }
    }
}

fn default_database() -> String {
    "syncstore".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_cas_attempts() -> usize {
    syncstore_core::timestamp::CasPolicy::DEFAULT_MAX_ATTEMPTS
}

/// Builds the backend described by `settings`.
///
/// Backends left out of the build (see the crate features) fail with
/// [`StorageError::Initialization`].
pub async fn connect(settings: &StorageSettings) -> StorageResult<Box<dyn DynStorageBackend>> {
    let backend: Box<dyn DynStorageBackend> = match settings {
        StorageSettings::Memory { readonly } => Box::new(
            InMemoryStore::builder()
                .readonly(*readonly)
                .build()
                .await?,
        ),
        StorageSettings::MongoDb { .. } => connect_mongodb(settings).await?,
        StorageSettings::Postgres { .. } => connect_postgres(settings).await?,
    };

    info!(
        backend = settings.backend_name(),
        readonly = settings.is_readonly(),
        "storage backend ready"
    );
    Ok(backend)
}

#[cfg(feature = "mongodb")]
async fn connect_mongodb(settings: &StorageSettings) -> StorageResult<Box<dyn DynStorageBackend>> {
    use std::time::Duration;
    use syncstore_core::timestamp::CasPolicy;
    use syncstore_mongodb::MongoDbStore;

    let StorageSettings::MongoDb {
        url,
        database,
        max_pool_size,
        timeout_ms,
        cas_max_attempts,
        readonly,
    } = settings
    else {
        return Err(StorageError::Initialization("not a MongoDB configuration".into()));
    };

    let store = MongoDbStore::builder(url, database)
        .max_pool_size(*max_pool_size)
        .connect_timeout(Duration::from_millis(*timeout_ms))
        .server_selection_timeout(Duration::from_millis(*timeout_ms))
        .cas_policy(CasPolicy::new(*cas_max_attempts))
        .readonly(*readonly)
        .build()
        .await?;
    Ok(Box::new(store))
}

#[cfg(not(feature = "mongodb"))]
async fn connect_mongodb(_settings: &StorageSettings) -> StorageResult<Box<dyn DynStorageBackend>> {
    Err(StorageError::Initialization(
        "MongoDB support requires the `mongodb` feature".into(),
    ))
}

#[cfg(feature = "postgres")]
async fn connect_postgres(settings: &StorageSettings) -> StorageResult<Box<dyn DynStorageBackend>> {
    use std::time::Duration;
    use syncstore_postgres::PostgresStore;

    let StorageSettings::Postgres {
        url,
        max_connections,
        timeout_ms,
        readonly,
    } = settings
    else {
        return Err(StorageError::Initialization("not a PostgreSQL configuration".into()));
    };

    let store = PostgresStore::builder(url)
        .max_connections(*max_connections)
        .acquire_timeout(Duration::from_millis(*timeout_ms))
        .readonly(*readonly)
        .build()
        .await?;
    Ok(Box::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn connect_postgres(_settings: &StorageSettings) -> StorageResult<Box<dyn DynStorageBackend>> {
    Err(StorageError::Initialization(
        "PostgreSQL support requires the `postgres` feature".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncstore_core::{
        backend::StorageBackend,
        record::{Record, Scope},
        store::DynRecordStore,
    };

    #[test]
    fn memory_is_the_default() {
        let settings: StorageSettings = serde_json::from_str(r#"{"backend": "memory"}"#).unwrap();

        assert_eq!(settings, StorageSettings::default());
    }

    #[test]
    fn postgres_settings_fill_defaults() {
        let settings: StorageSettings = serde_json::from_str(
            r#"{"backend": "postgresql", "url": "postgres://db/sync", "readonly": true}"#,
        )
        .unwrap();

        assert_eq!(
            settings,
            StorageSettings::Postgres {
                url: "postgres://db/sync".to_string(),
                max_connections: 10,
                timeout_ms: 5_000,
                readonly: true,
            }
        );
        assert_eq!(settings.backend_name(), "postgresql");
        assert!(settings.is_readonly());
    }

    #[test]
    fn mongodb_settings_fill_defaults() {
        let settings: StorageSettings =
            serde_json::from_str(r#"{"backend": "mongodb", "url": "mongodb://db:27017"}"#).unwrap();

        let StorageSettings::MongoDb { database, cas_max_attempts, .. } = settings else {
            panic!("expected MongoDB settings");
        };
        assert_eq!(database, "syncstore");
        assert_eq!(cas_max_attempts, 100);
    }

    #[test]
    fn unknown_backends_are_rejected() {
        let err = serde_json::from_str::<StorageSettings>(r#"{"backend": "redis"}"#).unwrap_err();

        assert!(err.to_string().contains("redis"));
    }

    #[tokio::test]
    async fn connects_a_memory_backend() {
        let store = DynRecordStore::new(connect(&StorageSettings::default()).await.unwrap());
        let articles = store.collection(Scope::new("articles", "alice"));

        let created = articles.create(Record::new()).await.unwrap();

        assert_eq!(
            articles.get(created.id().unwrap()).await.unwrap(),
            created
        );
        assert!(store.ping().await);
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn readonly_memory_backend_rejects_writes() {
        let backend = connect(&StorageSettings::Memory { readonly: true }).await.unwrap();
        let scope = Scope::new("articles", "alice");

        let err = StorageBackend::create(&backend, &scope, Record::new(), &[])
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Readonly(_)));
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn disabled_backends_fail_to_connect() {
        let settings = StorageSettings::Postgres {
            url: "postgres://db/sync".to_string(),
            max_connections: 1,
            timeout_ms: 10,
            readonly: false,
        };

        let err = connect(&settings).await.unwrap_err();

        assert!(matches!(err, StorageError::Initialization(_)));
    }
}

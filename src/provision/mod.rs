//! Disposable database pair for one diff run.

use crate::pg::connection::ConnectionInfo;
use crate::util::{Result, SchemaError};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::{debug, info, warn};

const POSTGRES_PORT: u16 = 5432;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionConfig {
    /// Image tag of the `postgres` image, e.g. `16-alpine`.
    pub postgres_version: String,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            postgres_version: "16-alpine".to_string(),
            username: "schemacheck".to_string(),
            password: "schemacheck".to_string(),
            database: "schemacheck".to_string(),
        }
    }
}

impl ProvisionConfig {
    pub fn with_postgres_version(mut self, version: impl Into<String>) -> Self {
        self.postgres_version = version.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Source,
    Target,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Source => "source",
            Role::Target => "target",
        }
    }
}

/// The source database receives the changelog, the target database the
/// mapped entities.
pub struct Environment {
    source: ConnectionInfo,
    target: ConnectionInfo,
    source_container: Option<ContainerAsync<Postgres>>,
    target_container: Option<ContainerAsync<Postgres>>,
}

impl Environment {
    /// Starts both containers concurrently. If either fails, the other one is
    /// removed before the error is returned.
    pub async fn start(config: &ProvisionConfig) -> Result<Self> {
        debug!("Starting postgres:{} containers", config.postgres_version);
        let (source, target) = tokio::join!(
            start_container(config, Role::Source),
            start_container(config, Role::Target)
        );

        match (source, target) {
            (Ok((source_container, source)), Ok((target_container, target))) => Ok(Self {
                source,
                target,
                source_container: Some(source_container),
                target_container: Some(target_container),
            }),
            (Ok((started, _)), Err(e)) | (Err(e), Ok((started, _))) => {
                remove_container(Some(started), "partially started").await;
                Err(e)
            }
            (Err(e), Err(other)) => {
                debug!("Second provisioning failure: {other}");
                Err(e)
            }
        }
    }

    /// Wraps databases whose lifecycle is managed elsewhere.
    pub fn external(source: ConnectionInfo, target: ConnectionInfo) -> Self {
        Self {
            source,
            target,
            source_container: None,
            target_container: None,
        }
    }

    pub fn source(&self) -> &ConnectionInfo {
        &self.source
    }

    pub fn target(&self) -> &ConnectionInfo {
        &self.target
    }

    pub fn is_managed(&self) -> bool {
        self.source_container.is_some() || self.target_container.is_some()
    }

    /// Removes every container this environment started. Safe to call more
    /// than once; failures are logged, never returned.
    pub async fn stop(&mut self) {
        if !self.is_managed() {
            return;
        }
        info!("Stop docker containers.");
        let source = self.source_container.take();
        let target = self.target_container.take();
        tokio::join!(
            remove_container(source, Role::Source.as_str()),
            remove_container(target, Role::Target.as_str())
        );
    }
}

async fn start_container(
    config: &ProvisionConfig,
    role: Role,
) -> Result<(ContainerAsync<Postgres>, ConnectionInfo)> {
    let fail = |what: &str, e: testcontainers::TestcontainersError| {
        SchemaError::Provision(format!(
            "Failed to {what} {} database container: {e}",
            role.as_str()
        ))
    };

    let container = Postgres::default()
        .with_user(&config.username)
        .with_password(&config.password)
        .with_db_name(&config.database)
        .with_tag(config.postgres_version.as_str())
        .start()
        .await
        .map_err(|e| fail("start", e))?;

    let host = container.get_host().await.map_err(|e| fail("resolve host of", e))?;
    let port = container
        .get_host_port_ipv4(POSTGRES_PORT)
        .await
        .map_err(|e| fail("resolve port of", e))?;

    let info = ConnectionInfo::new(
        host.to_string(),
        port,
        &config.database,
        &config.username,
        &config.password,
    );
    debug!("Started {} database at {}:{}", role.as_str(), info.host, info.port);
    Ok((container, info))
}

async fn remove_container(container: Option<ContainerAsync<Postgres>>, label: &str) {
    if let Some(container) = container {
        let id = container.id().to_string();
        if let Err(e) = container.rm().await {
            warn!("Failed to remove {label} database container {id}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_alpine_16() {
        let config = ProvisionConfig::default();
        assert_eq!(config.postgres_version, "16-alpine");
        assert_eq!(
            config.with_postgres_version("15").postgres_version,
            "15".to_string()
        );
    }

    #[tokio::test]
    async fn external_environment_stop_is_a_no_op() {
        let source = ConnectionInfo::new("localhost", 5432, "src", "u", "p");
        let target = ConnectionInfo::new("localhost", 5433, "tgt", "u", "p");
        let mut env = Environment::external(source.clone(), target.clone());

        assert!(!env.is_managed());
        env.stop().await;
        env.stop().await;
        assert_eq!(env.source(), &source);
        assert_eq!(env.target(), &target);
    }
}

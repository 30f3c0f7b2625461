//! Subscription renewal against the physaCI registrar.
//!
//! One renewal is four sequential stages: mint a replacement signing key,
//! probe the local node server for busy state (signed with the outgoing key),
//! assemble the subscription message, and POST it to the registrar. The new
//! key reaches disk only after the registrar accepts it.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{AUTHORIZATION, DATE, HOST};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::{ConfigError, ConfigResolver, NodeConfig};
use crate::signature;

const API_KEY_HEADER: &str = "x-functions-key";

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("could not determine local hostname: {0}")]
    Hostname(#[source] io::Error),
    #[error("could not generate acceptable key; {config} now holds a null key value")]
    KeyGeneration { config: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("node server status endpoint answered {0}")]
    NodeStatus(StatusCode),
    #[error("subscription request failed; response status code: {status}, response message: {body}")]
    Rejected { status: StatusCode, body: String },
}

/// Body POSTed to the registrar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionMessage {
    pub node_name: String,
    pub listen_port: u16,
    pub busy: bool,
    pub node_sig_key: String,
}

/// Body of the node server's `/status` answer. `busy` defaults to false when
/// the field is absent.
#[derive(Debug, Default, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub busy: bool,
}

/// Seam over the two outbound HTTP calls so the renewal flow is testable
/// without sockets.
#[async_trait]
trait RegistrarBackend: Send + Sync {
    /// Signed GET against `http://127.0.0.1:<port>/status`.
    async fn node_status(
        &self,
        port: u16,
        date: &str,
        authorization: &str,
    ) -> Result<NodeStatus, SubscribeError>;

    /// POST of the subscription message to the registrar.
    async fn register(
        &self,
        registrar_url: &Url,
        api_key: &str,
        message: &SubscriptionMessage,
    ) -> Result<(), SubscribeError>;
}

struct ReqwestRegistrarBackend {
    client: reqwest::Client,
}

impl ReqwestRegistrarBackend {
    fn new() -> Result<Self, SubscribeError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(4))
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RegistrarBackend for ReqwestRegistrarBackend {
    async fn node_status(
        &self,
        port: u16,
        date: &str,
        authorization: &str,
    ) -> Result<NodeStatus, SubscribeError> {
        let url = format!("http://{}:{port}/status", signature::SIGNED_HOST);
        let response = self
            .client
            .get(url)
            // The verifier signs over this exact Host value, portless.
            .header(HOST, signature::SIGNED_HOST)
            .header(DATE, date)
            .header(AUTHORIZATION, authorization)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SubscribeError::NodeStatus(response.status()));
        }
        Ok(response.json::<NodeStatus>().await?)
    }

    async fn register(
        &self,
        registrar_url: &Url,
        api_key: &str,
        message: &SubscriptionMessage,
    ) -> Result<(), SubscribeError> {
        let response = self
            .client
            .post(registrar_url.clone())
            .header(API_KEY_HEADER, api_key)
            .json(message)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SubscribeError::Rejected { status, body });
        }
        Ok(())
    }
}

/// Drives one subscription renewal against the registrar.
///
/// Owns the resolver it was handed; the caller decides where configuration
/// comes from and the client decides when it is written back.
pub struct SubscriptionClient {
    resolver: ConfigResolver,
    config: NodeConfig,
    node_name: String,
    backend: Arc<dyn RegistrarBackend>,
    mint_key: fn() -> String,
}

impl SubscriptionClient {
    pub fn new(resolver: ConfigResolver) -> Result<Self, SubscribeError> {
        let backend = Arc::new(ReqwestRegistrarBackend::new()?);
        Self::assemble(resolver, backend, signature::generate_node_key)
    }

    #[cfg(test)]
    fn with_backend(
        resolver: ConfigResolver,
        backend: Arc<dyn RegistrarBackend>,
        mint_key: fn() -> String,
    ) -> Result<Self, SubscribeError> {
        Self::assemble(resolver, backend, mint_key)
    }

    fn assemble(
        resolver: ConfigResolver,
        backend: Arc<dyn RegistrarBackend>,
        mint_key: fn() -> String,
    ) -> Result<Self, SubscribeError> {
        let config = resolver.resolve()?;
        let node_name = hostname::get()
            .map_err(SubscribeError::Hostname)?
            .to_string_lossy()
            .into_owned();
        tracing::debug!(
            registrar_url = %config.registrar_url,
            listen_port = config.listen_port,
            sig_key_file = %resolver.target_path().display(),
            "loaded subscriber configuration"
        );
        Ok(Self {
            resolver,
            config,
            node_name,
            backend,
            mint_key,
        })
    }

    /// Runs the four renewal stages once. No stage retries; the caller owns
    /// any retry policy, and a retried run mints a fresh key rather than
    /// resending an unacknowledged one.
    pub async fn send_subscription(&mut self) -> Result<(), SubscribeError> {
        tracing::info!("initiating physaCI registrar subscription");

        let previous_key = self.config.node_sig_key.clone();
        tracing::debug!("generating replacement node signature key");
        let new_key = (self.mint_key)();
        if signature::keys_match(&previous_key, &new_key) {
            // A random source that repeats itself cannot be trusted to sign
            // anything. Null the stored key so nothing keeps signing with it,
            // then fail the renewal.
            self.resolver.set_node_sig_key("");
            if let Err(err) = self.resolver.persist() {
                tracing::error!(error = %err, "failed to persist cleared signature key");
            }
            return Err(SubscribeError::KeyGeneration {
                config: self.resolver.target_path().display().to_string(),
            });
        }
        self.resolver.set_node_sig_key(&new_key);

        let busy = self.node_busy(&previous_key).await;

        let message = SubscriptionMessage {
            node_name: self.node_name.clone(),
            listen_port: self.config.listen_port,
            busy,
            node_sig_key: new_key,
        };

        tracing::info!("sending subscription request to registrar");
        self.backend
            .register(&self.config.registrar_url, &self.config.api_key, &message)
            .await?;

        self.resolver.persist()?;
        tracing::info!("subscription accepted; node signature key persisted");
        Ok(())
    }

    /// Best-effort busy probe, signed with the key the node server still
    /// knows. Every failure degrades to not-busy; only the registrar POST
    /// decides the fate of the renewal.
    async fn node_busy(&self, signing_key: &str) -> bool {
        if signing_key.is_empty() {
            tracing::debug!("no signing key on record; skipping node status probe");
            return false;
        }
        let date = signature::http_date(Utc::now());
        let authorization = signature::authorization_header(signing_key, &self.node_name, &date);
        match self
            .backend
            .node_status(self.config.listen_port, &date, &authorization)
            .await
        {
            Ok(status) => status.busy,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "could not determine node busy status; treating node as not busy"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;
    use test_timeout::tokio_timeout_test;

    const OLD_KEY: &str = "OLDKEY";

    #[derive(Debug, Clone)]
    struct ProbeCall {
        date: String,
        authorization: String,
    }

    #[derive(Default)]
    struct MockBackend {
        busy: bool,
        probe_error: Option<StatusCode>,
        reject: Option<(StatusCode, String)>,
        probes: Mutex<Vec<ProbeCall>>,
        registrations: Mutex<Vec<SubscriptionMessage>>,
    }

    #[async_trait]
    impl RegistrarBackend for MockBackend {
        async fn node_status(
            &self,
            _port: u16,
            date: &str,
            authorization: &str,
        ) -> Result<NodeStatus, SubscribeError> {
            self.probes.lock().unwrap().push(ProbeCall {
                date: date.to_string(),
                authorization: authorization.to_string(),
            });
            match self.probe_error {
                Some(status) => Err(SubscribeError::NodeStatus(status)),
                None => Ok(NodeStatus { busy: self.busy }),
            }
        }

        async fn register(
            &self,
            _registrar_url: &Url,
            _api_key: &str,
            message: &SubscriptionMessage,
        ) -> Result<(), SubscribeError> {
            self.registrations.lock().unwrap().push(message.clone());
            match &self.reject {
                Some((status, body)) => Err(SubscribeError::Rejected {
                    status: *status,
                    body: body.clone(),
                }),
                None => Ok(()),
            }
        }
    }

    fn config_file(node_sig_key: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("create temp config");
        write!(
            file,
            "# managed by the physaci_sub installer\n\
             [local]\n\
             physaci_registrar_url=https://registrar.example.com/api/subscribe\n\
             [physaci]\n\
             api_access_key=test-api-key\n\
             [node_server]\n\
             listen_port=8080\n\
             node_sig_key={node_sig_key}\n"
        )
        .expect("write config");
        file
    }

    fn client_over(
        file: &NamedTempFile,
        backend: Arc<MockBackend>,
        mint_key: fn() -> String,
    ) -> SubscriptionClient {
        let resolver = ConfigResolver::load_from(file.path().to_path_buf());
        SubscriptionClient::with_backend(resolver, backend, mint_key).expect("client")
    }

    fn fresh_key() -> String {
        signature::generate_node_key()
    }

    fn stale_key() -> String {
        OLD_KEY.to_string()
    }

    #[tokio_timeout_test]
    async fn successful_renewal_persists_the_new_key() {
        let file = config_file(OLD_KEY);
        let backend = Arc::new(MockBackend {
            busy: true,
            ..MockBackend::default()
        });
        let mut client = client_over(&file, backend.clone(), fresh_key);

        client.send_subscription().await.expect("renewal succeeds");

        let sent = backend.registrations.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let message = &sent[0];
        assert_eq!(message.node_name, hostname::get().unwrap().to_string_lossy());
        assert_eq!(message.listen_port, 8080);
        assert!(message.busy);
        assert_ne!(message.node_sig_key, OLD_KEY);

        let on_disk = std::fs::read_to_string(file.path()).expect("read config");
        assert!(on_disk.contains(&format!("node_sig_key={}\n", message.node_sig_key)));
        assert!(on_disk.starts_with("# managed by the physaci_sub installer\n"));
        assert!(on_disk.contains("listen_port=8080\n"));
    }

    #[tokio_timeout_test]
    async fn probe_signs_with_the_outgoing_key() {
        let file = config_file(OLD_KEY);
        let backend = Arc::new(MockBackend::default());
        let mut client = client_over(&file, backend.clone(), fresh_key);

        client.send_subscription().await.expect("renewal succeeds");

        let probes = backend.probes.lock().unwrap();
        assert_eq!(probes.len(), 1);
        let probe = &probes[0];
        let hostname = hostname::get().unwrap().to_string_lossy().into_owned();
        assert_eq!(
            probe.authorization,
            signature::authorization_header(OLD_KEY, &hostname, &probe.date)
        );
    }

    #[tokio_timeout_test]
    async fn empty_key_skips_the_probe_entirely() {
        let file = config_file("");
        let backend = Arc::new(MockBackend {
            busy: true,
            ..MockBackend::default()
        });
        let mut client = client_over(&file, backend.clone(), fresh_key);

        client.send_subscription().await.expect("renewal succeeds");

        assert!(backend.probes.lock().unwrap().is_empty());
        let sent = backend.registrations.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].busy, "no probe ran, so the node reports not busy");
    }

    #[tokio_timeout_test]
    async fn failed_probe_degrades_to_not_busy() {
        let file = config_file(OLD_KEY);
        let backend = Arc::new(MockBackend {
            probe_error: Some(StatusCode::SERVICE_UNAVAILABLE),
            ..MockBackend::default()
        });
        let mut client = client_over(&file, backend.clone(), fresh_key);

        client.send_subscription().await.expect("probe is advisory");

        let sent = backend.registrations.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].busy);
    }

    #[tokio_timeout_test]
    async fn rejected_registration_leaves_the_file_alone() {
        let file = config_file(OLD_KEY);
        let before = std::fs::read_to_string(file.path()).expect("read config");
        let backend = Arc::new(MockBackend {
            reject: Some((StatusCode::BAD_REQUEST, "bad api key".to_string())),
            ..MockBackend::default()
        });
        let mut client = client_over(&file, backend.clone(), fresh_key);

        let err = client.send_subscription().await.expect_err("rejected");
        match err {
            SubscribeError::Rejected { status, body } => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(body, "bad api key");
            }
            other => panic!("unexpected error: {other}"),
        }

        let after = std::fs::read_to_string(file.path()).expect("read config");
        assert_eq!(after, before);
    }

    #[tokio_timeout_test]
    async fn repeated_key_fails_the_renewal_and_nulls_the_stored_key() {
        let file = config_file(OLD_KEY);
        let backend = Arc::new(MockBackend::default());
        let mut client = client_over(&file, backend.clone(), stale_key);

        let err = client.send_subscription().await.expect_err("collision");
        assert!(matches!(err, SubscribeError::KeyGeneration { .. }));

        // No traffic: the renewal dies before either HTTP call.
        assert!(backend.probes.lock().unwrap().is_empty());
        assert!(backend.registrations.lock().unwrap().is_empty());

        let on_disk = std::fs::read_to_string(file.path()).expect("read config");
        assert!(on_disk.contains("node_sig_key=\n"));
        assert!(!on_disk.contains(OLD_KEY));
    }

    #[tokio_timeout_test]
    async fn collision_error_names_the_rewritten_file() {
        let file = config_file(OLD_KEY);
        let backend = Arc::new(MockBackend::default());
        let mut client = client_over(&file, backend, stale_key);

        let err = client.send_subscription().await.expect_err("collision");
        let rendered = err.to_string();
        assert!(rendered.contains(&file.path().display().to_string()));
        assert!(rendered.contains("null key value"));
    }
}

//! # Certificate Provisioner
//!
//! Obtains and refreshes the TLS certificate the tunneled HTTP/2 server
//! presents. Outside test mode the certificate comes from an ACME HTTP-01
//! order driven through the front's [`ChallengeStore`]; the account
//! credentials, certificate and private key all live in the sealed object
//! store so a restarted instance picks them up from anywhere. In test mode
//! ACME is bypassed entirely and a local key pair is loaded from disk.

use std::io::BufReader;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::configs::Config;
use crate::front::ChallengeStore;
use crate::store::{FileStore, SealedStore, StoreError};

/// Renew when the stored certificate has less than this long to live.
const RENEW_WINDOW: Duration = Duration::from_secs(30 * 24 * 3600);
/// Validity assumed for a freshly issued certificate.
const ISSUED_LIFETIME: Duration = Duration::from_secs(90 * 24 * 3600);
/// Order-poll ceiling.
const MAX_POLL_ATTEMPTS: u32 = 10;

#[derive(Debug, Error)]
/// Startup-fatal certificate problems.
pub enum ProvisionError {
    /// The object store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The ACME client failed.
    #[error("acme error: {0}")]
    Acme(#[from] instant_acme::Error),

    /// Key or CSR generation failed.
    #[error("keygen error: {0}")]
    Keygen(#[from] rcgen::Error),

    /// Assembling the TLS configuration failed.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// A stored artifact did not parse.
    #[error("bad artifact: {0}")]
    BadArtifact(String),

    /// Reading the local key pair failed (test mode).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Issuance record kept beside the certificate so renewal can be decided
/// without parsing X.509.
#[derive(Debug, Serialize, Deserialize)]
struct CertMeta {
    issued_at_unix: u64,
    not_after_unix: u64,
}

impl CertMeta {
    fn fresh(now: u64) -> Self {
        Self {
            issued_at_unix: now,
            not_after_unix: now + ISSUED_LIFETIME.as_secs(),
        }
    }

    fn needs_renewal(&self, now: u64) -> bool {
        self.not_after_unix <= now + RENEW_WINDOW.as_secs()
    }
}

/// Installs the process-wide rustls crypto provider. Idempotent; later
/// calls are no-ops.
pub fn install_default_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Certificate acquisition against the sealed store and the challenge
/// store.
pub struct CertProvisioner<S> {
    config: Arc<Config>,
    store: SealedStore<S>,
    challenges: Arc<ChallengeStore>,
}

impl<S: FileStore> CertProvisioner<S> {
    /// Wires the provisioner to its collaborators.
    pub fn new(config: Arc<Config>, store: SealedStore<S>, challenges: Arc<ChallengeStore>) -> Self {
        Self {
            config,
            store,
            challenges,
        }
    }

    /// Produces the server TLS configuration: TLS >= 1.2, ALPN `h2`, and
    /// required client certificates whenever a CA chain artifact exists.
    pub async fn tls_config(&self) -> Result<rustls::ServerConfig, ProvisionError> {
        if self.config.test_mode {
            tracing::info!("test mode, loading local key pair");
            return tls_config_from_files(&self.config.server_crt, &self.config.server_key);
        }

        let (certs, key) = match self.load_stored().await? {
            Some(pair) => pair,
            None => self.order_certificate().await?,
        };
        let client_ca = self.load_client_ca().await?;
        build_server_config(certs, key, client_ca)
    }

    /// Returns the stored certificate pair when it exists and is not inside
    /// the renewal window.
    async fn load_stored(
        &self,
    ) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>, ProvisionError>
    {
        let meta = match self.store.load(&self.artifact("cert.meta")).await {
            Ok(raw) => serde_json::from_slice::<CertMeta>(&raw)
                .map_err(|e| ProvisionError::BadArtifact(format!("cert.meta: {e}")))?,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if meta.needs_renewal(unix_now()) {
            tracing::info!(domain = %self.config.acme_domain, "stored certificate near expiry");
            return Ok(None);
        }

        let cert_pem = match self.store.load(&self.artifact("cert.pem")).await {
            Ok(raw) => raw,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let key_pem = match self.store.load(&self.artifact("key.pem")).await {
            Ok(raw) => raw,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(domain = %self.config.acme_domain, "using stored certificate");
        Ok(Some((parse_certs(&cert_pem)?, parse_key(&key_pem)?)))
    }

    /// Loads the ACME account, registering a fresh one when the store holds
    /// no credentials yet.
    async fn account(&self) -> Result<Account, ProvisionError> {
        match self.store.load(&self.artifact("user.reg")).await {
            Ok(raw) => {
                let credentials: AccountCredentials = serde_json::from_slice(&raw)
                    .map_err(|e| ProvisionError::BadArtifact(format!("user.reg: {e}")))?;
                Ok(Account::from_credentials(credentials).await?)
            }
            Err(StoreError::NotFound(_)) => {
                tracing::info!(directory = %self.config.acme_directory, "registering acme account");
                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &[],
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    &self.config.acme_directory,
                    None,
                )
                .await?;
                let raw = serde_json::to_vec(&credentials)
                    .map_err(|e| ProvisionError::BadArtifact(format!("credentials: {e}")))?;
                self.store.save(&self.artifact("user.reg"), &raw).await?;
                Ok(account)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Runs a full HTTP-01 order and persists the resulting artifacts.
    async fn order_certificate(
        &self,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ProvisionError> {
        let domain = self.config.acme_domain.clone();
        let account = self.account().await?;
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &[Identifier::Dns(domain.clone())],
            })
            .await?;

        let authorizations = order.authorizations().await?;
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    return Err(ProvisionError::BadArtifact(format!(
                        "authorization in unexpected state {status:?}"
                    )))
                }
            }
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| {
                    ProvisionError::BadArtifact("no http-01 challenge offered".into())
                })?;
            let key_auth = order.key_authorization(challenge);
            self.challenges
                .present(&domain, &challenge.token, key_auth.as_str());
            order.set_challenge_ready(&challenge.url).await?;
        }

        let outcome = self.poll_order(&mut order).await;
        self.challenges.cleanup(&domain, "", "");
        let status = outcome?;
        if status == OrderStatus::Invalid {
            return Err(ProvisionError::BadArtifact("order became invalid".into()));
        }

        let key_pair = rcgen::KeyPair::generate()?;
        let params = rcgen::CertificateParams::new(vec![domain.clone()])?;
        let csr = params.serialize_request(&key_pair)?;
        order.finalize(csr.der().as_ref()).await?;

        let cert_pem = loop {
            match order.certificate().await? {
                Some(pem) => break pem,
                None => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        };
        let key_pem = key_pair.serialize_pem();

        self.store
            .save(&self.artifact("cert.pem"), cert_pem.as_bytes())
            .await?;
        self.store
            .save(&self.artifact("key.pem"), key_pem.as_bytes())
            .await?;
        let meta = serde_json::to_vec(&CertMeta::fresh(unix_now()))
            .map_err(|e| ProvisionError::BadArtifact(format!("cert.meta: {e}")))?;
        self.store.save(&self.artifact("cert.meta"), &meta).await?;
        tracing::info!(domain = %domain, "certificate issued");

        Ok((parse_certs(cert_pem.as_bytes())?, parse_key(key_pem.as_bytes())?))
    }

    async fn poll_order(
        &self,
        order: &mut instant_acme::Order,
    ) -> Result<OrderStatus, ProvisionError> {
        let mut delay = Duration::from_millis(500);
        for _ in 0..MAX_POLL_ATTEMPTS {
            tokio::time::sleep(delay).await;
            let status = order.refresh().await?.status;
            match status {
                OrderStatus::Ready | OrderStatus::Valid | OrderStatus::Invalid => {
                    return Ok(status)
                }
                _ => {}
            }
            delay = (delay * 2).min(Duration::from_secs(8));
        }
        Err(ProvisionError::BadArtifact(
            "order did not settle in time".into(),
        ))
    }

    /// Optional client-auth CA chain beside the other domain artifacts.
    async fn load_client_ca(&self) -> Result<Option<RootCertStore>, ProvisionError> {
        let raw = match self.store.load(&self.artifact("chain.pem")).await {
            Ok(raw) => raw,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut roots = RootCertStore::empty();
        for cert in parse_certs(&raw)? {
            roots
                .add(cert)
                .map_err(|e| ProvisionError::BadArtifact(format!("chain.pem: {e}")))?;
        }
        Ok(Some(roots))
    }

    fn artifact(&self, name: &str) -> String {
        format!("/{}/{}", self.config.acme_domain, name)
    }
}

/// Test-mode TLS configuration from a local key pair on disk.
pub fn tls_config_from_files(
    crt_path: &str,
    key_path: &str,
) -> Result<rustls::ServerConfig, ProvisionError> {
    let mut crt_reader = BufReader::new(std::fs::File::open(crt_path)?);
    let certs = rustls_pemfile::certs(&mut crt_reader).collect::<Result<Vec<_>, _>>()?;

    let mut key_reader = BufReader::new(std::fs::File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| ProvisionError::BadArtifact(format!("no private key in {key_path}")))?;

    build_server_config(certs, key, None)
}

fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_ca: Option<RootCertStore>,
) -> Result<rustls::ServerConfig, ProvisionError> {
    let builder = rustls::ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ]);
    let mut config = match client_ca {
        Some(roots) => {
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| ProvisionError::BadArtifact(format!("client ca: {e}")))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key)?,
    };
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(config)
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, ProvisionError> {
    let certs = rustls_pemfile::certs(&mut &pem[..]).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ProvisionError::BadArtifact("no certificate in pem".into()));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, ProvisionError> {
    rustls_pemfile::private_key(&mut &pem[..])?
        .ok_or_else(|| ProvisionError::BadArtifact("no private key in pem".into()))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::StoreMode;
    use crate::store::DirStore;

    fn test_config(dir: &tempfile::TempDir, test_mode: bool) -> Arc<Config> {
        Arc::new(Config {
            ws_buf_kib: 65,
            h2_max_frame_kib: 64,
            h2_verbose: false,
            h2_retry_max_secs: 30,
            h2_warmup_secs: 0,
            ping_secs: 45,
            tcp_port: 0,
            dev: true,
            log_level: String::new(),
            acme_domain: "example.com".into(),
            acme_directory: "https://acme.invalid/directory".into(),
            test_mode,
            server_crt: dir.path().join("server.crt").to_string_lossy().into_owned(),
            server_key: dir.path().join("server.key").to_string_lossy().into_owned(),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            store_mode: StoreMode::Dir,
            store_key: [9u8; 32],
            store_url: dir.path().to_string_lossy().into_owned(),
        })
    }

    fn write_local_keypair(dir: &tempfile::TempDir) -> (String, String) {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".into()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let crt_path = dir.path().join("server.crt");
        let key_path = dir.path().join("server.key");
        std::fs::write(&crt_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key.serialize_pem()).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[tokio::test]
    async fn test_test_mode_uses_local_key_pair() {
        install_default_crypto_provider();
        let dir = tempfile::tempdir().unwrap();
        write_local_keypair(&dir);

        let config = test_config(&dir, true);
        let store = SealedStore::new(DirStore::new(dir.path()), &config.store_key);
        let provisioner = CertProvisioner::new(config, store, Arc::new(ChallengeStore::new()));

        let tls = provisioner.tls_config().await.unwrap();
        assert_eq!(tls.alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[tokio::test]
    async fn test_stored_certificate_reused_without_ordering() {
        install_default_crypto_provider();
        let dir = tempfile::tempdir().unwrap();
        let (cert_pem, key_pem) = write_local_keypair(&dir);

        let config = test_config(&dir, false);
        let store = SealedStore::new(DirStore::new(dir.path()), &config.store_key);
        store.save("/example.com/cert.pem", cert_pem.as_bytes()).await.unwrap();
        store.save("/example.com/key.pem", key_pem.as_bytes()).await.unwrap();
        let meta = serde_json::to_vec(&CertMeta::fresh(unix_now())).unwrap();
        store.save("/example.com/cert.meta", &meta).await.unwrap();

        let provisioner = CertProvisioner::new(config, store, Arc::new(ChallengeStore::new()));
        // The acme directory is unreachable, so success proves the stored
        // artifacts were used.
        let tls = provisioner.tls_config().await.unwrap();
        assert_eq!(tls.alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[test]
    fn test_renewal_window() {
        let now = 1_700_000_000;
        let fresh = CertMeta::fresh(now);
        assert!(!fresh.needs_renewal(now));
        // 61 days later: inside the 30-day window of a 90-day certificate.
        assert!(fresh.needs_renewal(now + 61 * 24 * 3600));
        // 59 days later: still comfortably valid.
        assert!(!fresh.needs_renewal(now + 59 * 24 * 3600));
    }

    #[tokio::test]
    async fn test_missing_local_pair_is_fatal_in_test_mode() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, true);
        let store = SealedStore::new(DirStore::new(dir.path()), &config.store_key);
        let provisioner = CertProvisioner::new(config, store, Arc::new(ChallengeStore::new()));

        assert!(matches!(
            provisioner.tls_config().await.unwrap_err(),
            ProvisionError::Io(_)
        ));
    }
}

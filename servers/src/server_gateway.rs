//! # Tunneling Gateway Server
//!
//! The gateway process: a plain-HTTP front that adopts one back-office
//! WebSocket as the carrier for a TLS-terminated HTTP/2 proxy endpoint.
//!
//! Startup order matters: the front must be serving before certificates are
//! provisioned, because the ACME HTTP-01 validator dials the front's
//! well-known challenge path. Any failure up to the first serve loop is
//! fatal and exits non-zero; after that the process loops forever.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

use lib_tunnel::acme::{install_default_crypto_provider, CertProvisioner};
use lib_tunnel::carrier::CarrierListener;
use lib_tunnel::configs::{Config, StoreMode};
use lib_tunnel::front::{ChallengeStore, FrontGateway};
use lib_tunnel::store::{AnyStore, DirStore, HttpStore, SealedStore};
use lib_tunnel::tunnel::TunnelServer;

/// PAC document location in the object store.
const PAC_PATH: &str = "/bricks.pac";
/// How often the PAC cache is refreshed from the store.
const PAC_REFRESH: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A .env file seeds the environment the same way the platform does.
    let _ = dotenvy::dotenv();
    let config = Arc::new(Config::from_env().context("configuration invalid")?);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_directive()))
        .init();
    install_default_crypto_provider();

    let backend = match config.store_mode {
        StoreMode::Http => AnyStore::Http(HttpStore::new(&config.store_url)),
        StoreMode::Dir => AnyStore::Dir(DirStore::new(&config.store_url)),
    };
    let store = SealedStore::new(backend, &config.store_key);

    let info = Bytes::from(serde_json::to_vec(
        &serde_json::json!({ "PingSecond": config.ping_secs }),
    )?);
    let pac_bytes = store
        .load_plain(PAC_PATH)
        .await
        .context("load pac from store")?;
    let pac = Arc::new(RwLock::new(Bytes::from(pac_bytes)));

    let challenge = Arc::new(ChallengeStore::new());
    let (carrier_tx, listener) = CarrierListener::channel();

    let front = FrontGateway::new(
        carrier_tx,
        challenge.clone(),
        info.clone(),
        pac.clone(),
        config.ws_buf_bytes(),
        None,
    );
    let bound = front
        .bind(config.bind_addr)
        .await
        .context("bind front gateway")?;
    let front_task = tokio::spawn(bound.serve());

    // The front is up, so HTTP-01 validations can reach the challenge route.
    let provisioner = CertProvisioner::new(config.clone(), store.clone(), challenge);
    let tls = Arc::new(
        provisioner
            .tls_config()
            .await
            .context("tls certificate provisioning failed")?,
    );

    let tunnel = TunnelServer::new(config, listener, tls, info, pac.clone());
    tokio::spawn(tunnel.run());
    tokio::spawn(refresh_pac(store, pac));

    front_task
        .await
        .context("front task aborted")?
        .context("front server failed")?;
    Ok(())
}

/// Occasional PAC refresher; readers keep the previous document when a
/// refresh fails.
async fn refresh_pac(store: SealedStore<AnyStore>, pac: Arc<RwLock<Bytes>>) {
    let mut interval = tokio::time::interval(PAC_REFRESH);
    interval.tick().await;
    loop {
        interval.tick().await;
        match store.load_plain(PAC_PATH).await {
            Ok(fresh) => {
                *pac.write().await = Bytes::from(fresh);
                tracing::debug!("pac cache refreshed");
            }
            Err(e) => tracing::warn!(error = %e, "pac refresh failed"),
        }
    }
}

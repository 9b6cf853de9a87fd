//! etcd-backed service registry.

use std::time::Duration;

use etcd_client::{
    Client, Compare, CompareOp, GetOptions, PutOptions, Txn, TxnOp,
};
use tokio::sync::watch;
use tonic::async_trait;
use tracing::{debug, info, warn};

use super::{
    RegistrationHandle, RegistryError, RegistryResult, ServiceRegistry, WorkerInfo,
};

/// Registry client over an etcd cluster.
#[derive(Clone)]
pub struct EtcdRegistry {
    client: Client,
    prefix: String,
}

impl EtcdRegistry {
    /// Connect to the cluster. `prefix` is prepended to every registration
    /// key, e.g. `/foreman/registry`.
    pub async fn connect(endpoints: &[String], prefix: &str) -> RegistryResult<Self> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self {
            client,
            prefix: prefix.trim_end_matches('/').to_string(),
        })
    }

    fn key_for(&self, info: &WorkerInfo) -> String {
        format!("{}/{}", self.prefix, info.key_suffix())
    }
}

#[async_trait]
impl ServiceRegistry for EtcdRegistry {
    async fn register(
        &self,
        info: WorkerInfo,
        ttl: Duration,
    ) -> RegistryResult<Box<dyn RegistrationHandle>> {
        let key = self.key_for(&info);
        let payload = serde_json::to_string(&info)?;
        let mut client = self.client.clone();

        let lease = client.lease_grant(ttl.as_secs().max(1) as i64, None).await?;
        let lease_id = lease.id();

        // CAS: put only if the key does not exist, bound to our lease. This
        // guarantees at most one live worker per worker_id.
        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                key.clone(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(
                key.clone(),
                payload,
                Some(PutOptions::new().with_lease(lease_id)),
            )]);
        let resp = client.txn(txn).await?;
        if !resp.succeeded() {
            // Another live worker holds this identity; give the lease back.
            if let Err(err) = client.lease_revoke(lease_id).await {
                warn!(error = %err, "failed to revoke lease after CAS miss");
            }
            return Err(RegistryError::AlreadyRegistered(key));
        }

        info!(key = %key, lease_id, ttl_secs = ttl.as_secs(), "worker registered");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(keep_alive_loop(
            client.clone(),
            key.clone(),
            lease_id,
            ttl,
            shutdown_rx,
        ));

        Ok(Box::new(EtcdRegistration {
            client,
            key,
            lease_id,
            shutdown_tx,
        }))
    }

    async fn resolve(&self, service_name: &str) -> RegistryResult<Vec<WorkerInfo>> {
        let prefix = format!("{}/{}/", self.prefix, service_name);
        let mut client = self.client.clone();
        let resp = client
            .get(prefix.clone(), Some(GetOptions::new().with_prefix()))
            .await?;

        let mut workers = Vec::new();
        for kv in resp.kvs() {
            match serde_json::from_slice::<WorkerInfo>(kv.value()) {
                Ok(info) => workers.push(info),
                Err(err) => {
                    warn!(
                        key = %String::from_utf8_lossy(kv.key()),
                        error = %err,
                        "skipping malformed registration payload"
                    );
                }
            }
        }
        Ok(workers)
    }
}

/// Renew the lease at a third of its TTL. Loss of the keep-alive channel is
/// logged and retried; the worker stays up and the lease TTL decides its
/// fate if etcd stays unreachable.
async fn keep_alive_loop(
    mut client: Client,
    key: String,
    lease_id: i64,
    ttl: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs((ttl.as_secs() / 3).max(1));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut channel = match client.lease_keep_alive(lease_id).await {
        Ok(pair) => Some(pair),
        Err(err) => {
            warn!(key = %key, error = %err, "failed to open keep-alive channel");
            None
        }
    };

    loop {
        tokio::select! {
            _ = shutdown_signalled(&mut shutdown_rx) => {
                debug!(key = %key, "keep-alive loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                let Some((keeper, stream)) = channel.as_mut() else {
                    match client.lease_keep_alive(lease_id).await {
                        Ok(pair) => channel = Some(pair),
                        Err(err) => warn!(key = %key, error = %err, "keep-alive channel still down"),
                    }
                    continue;
                };
                if let Err(err) = keeper.keep_alive().await {
                    warn!(key = %key, error = %err, "lease keep-alive send failed");
                    channel = None;
                    continue;
                }
                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {
                        debug!(key = %key, ttl = resp.ttl(), "lease renewed");
                    }
                    Ok(Some(_)) => {
                        warn!(key = %key, "lease expired on the server side");
                        channel = None;
                    }
                    Ok(None) => {
                        warn!(key = %key, "keep-alive channel closed");
                        channel = None;
                    }
                    Err(err) => {
                        warn!(key = %key, error = %err, "keep-alive receive failed");
                        channel = None;
                    }
                }
            }
        }
    }
}

/// Resolves when shutdown is requested, or when the sender side is gone.
/// A dropped registration handle means no signal can ever arrive, so the
/// keep-alive loop must stop renewing and let the lease TTL expire.
async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

struct EtcdRegistration {
    client: Client,
    key: String,
    lease_id: i64,
    shutdown_tx: watch::Sender<bool>,
}

#[async_trait]
impl RegistrationHandle for EtcdRegistration {
    async fn unregister(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut client = self.client.clone();
        if let Err(err) = client.delete(self.key.clone(), None).await {
            warn!(key = %self.key, error = %err, "failed to delete registration key");
        }
        if let Err(err) = client.lease_revoke(self.lease_id).await {
            warn!(key = %self.key, error = %err, "failed to revoke lease");
        }
        info!(key = %self.key, "worker unregistered");
    }
}

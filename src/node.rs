//! Wiring of the storage node and the lifecycle of its background tasks.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{ConfigError, NodeConfig};
use crate::crypto::{KeyError, KeyManager};
use crate::distributed::{
    CustodianTable, HttpShardTransport, ReplicationManager, ShardTransport, StoragePeer,
};
use crate::error::EngineError;
use crate::eviction::EvictionManager;
use crate::gateway::DeliveryGateway;
use crate::http::{self, AppState};
use crate::policy::{HttpTrustOracle, SharedOracle, StaticTrustOracle};
use crate::sovereignty::SovereigntyGate;
use crate::storage::{ContentStore, FileStorage, Storage, StorageError};
use crate::sync::{DocPeer, HttpDocPeer, SyncEngine};

const KEY_STORE_FILE: &str = "keys.json";

/// Conditions that stop a node from starting
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Key store error: {0}")]
    Keys(#[from] KeyError),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

pub struct Node {
    config: NodeConfig,
    store: Arc<ContentStore>,
    keys: Arc<KeyManager>,
    replication: Arc<ReplicationManager>,
    eviction: Arc<EvictionManager>,
    gateway: Arc<DeliveryGateway>,
    sync: Arc<SyncEngine>,
    doc_peers: Vec<Arc<dyn DocPeer>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Open a node on disk with HTTP peers. Fails if the storage root is
    /// unusable or the key store is corrupt.
    pub async fn open(config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;
        let backend: Arc<dyn Storage> = Arc::new(FileStorage::open(&config.storage_root)?);
        let keys = Arc::new(KeyManager::open(config.storage_root.join(KEY_STORE_FILE))?);
        let transport: Arc<dyn ShardTransport> = Arc::new(HttpShardTransport::new(
            config.node_id.clone(),
            config.peer_timeout(),
        )?);
        let oracle: SharedOracle = match &config.trust_oracle_url {
            Some(url) => Arc::new(HttpTrustOracle::new(url.clone(), config.peer_timeout())?),
            None => {
                warn!("No trust oracle configured; only owners and addressed readers are trusted");
                Arc::new(StaticTrustOracle::new())
            }
        };

        let mut doc_peers: Vec<Arc<dyn DocPeer>> = Vec::new();
        for peer in &config.peers {
            doc_peers.push(Arc::new(HttpDocPeer::new(
                config.node_id.clone(),
                peer.address.clone(),
                config.peer_timeout(),
            )?));
        }

        let mut node = Self::with_components(config, backend, keys, transport, oracle).await?;
        node.doc_peers = doc_peers;
        Ok(node)
    }

    /// Assemble a node from caller-supplied backend, keys, transport and oracle
    pub async fn with_components(
        config: NodeConfig,
        backend: Arc<dyn Storage>,
        keys: Arc<KeyManager>,
        transport: Arc<dyn ShardTransport>,
        oracle: SharedOracle,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let store = Arc::new(ContentStore::open(Arc::clone(&backend)).await?);
        let custodians = Arc::new(CustodianTable::open(Arc::clone(&backend)).await?);

        let members: Vec<String> = config
            .family_members
            .iter()
            .chain(config.cluster_members.iter())
            .cloned()
            .collect();
        match keys.cluster_info()? {
            None if !members.is_empty() => {
                let info = keys.generate_cluster_key(members)?;
                info!("Created cluster key {}", info.key_id);
            }
            // Members configured since the key was made join it on restart
            Some(info) => {
                let added = keys.enrol_cluster_members(members)?;
                if added > 0 {
                    info!("Enrolled {} new members in cluster key {}", added, info.key_id);
                }
            }
            None => {}
        }

        let replication = Arc::new(ReplicationManager::new(
            Arc::clone(&store),
            Arc::clone(&custodians),
            transport,
            Arc::clone(&oracle),
            config.replication_config(),
        ));
        for peer in &config.peers {
            replication
                .add_peer(StoragePeer::new(peer.peer_id.clone(), peer.address.clone()))
                .await;
        }

        let eviction = Arc::new(
            EvictionManager::new(Arc::clone(&store), custodians, config.eviction_config())
                .with_replication(Arc::clone(&replication)),
        );
        let sovereignty = SovereigntyGate::new(
            config.sovereignty,
            config.family_members.iter().cloned(),
            config.cluster_members.iter().cloned(),
        )
        .with_laptop_replication(config.laptop_replication);

        let gateway = Arc::new(DeliveryGateway::new(
            Arc::clone(&store),
            Arc::clone(&keys),
            oracle,
            sovereignty,
            Arc::clone(&replication),
            Arc::clone(&eviction),
            config.erasure_params(),
        )?);
        let sync = Arc::new(SyncEngine::new(backend));
        let (shutdown, _) = watch::channel(false);

        info!(
            "Node {} ready ({} sovereignty, {} blobs, {} bytes)",
            config.node_id,
            config.sovereignty,
            store.blob_count().await,
            store.used_bytes()
        );

        Ok(Self {
            config,
            store,
            keys,
            replication,
            eviction,
            gateway,
            sync,
            doc_peers: Vec::new(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn gateway(&self) -> &Arc<DeliveryGateway> {
        &self.gateway
    }

    pub fn replication(&self) -> &Arc<ReplicationManager> {
        &self.replication
    }

    pub fn eviction(&self) -> &Arc<EvictionManager> {
        &self.eviction
    }

    pub fn sync(&self) -> &Arc<SyncEngine> {
        &self.sync
    }

    pub fn router(&self) -> axum::Router {
        http::router(Arc::new(AppState {
            gateway: Arc::clone(&self.gateway),
            sync: Arc::clone(&self.sync),
        }))
    }

    /// Start placement, probing, eviction and document sync
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if let Some(worker) = Arc::clone(&self.replication)
            .spawn_placement_worker(self.shutdown.subscribe())
            .await
        {
            tasks.push(worker);
        }
        if self.gateway.sovereignty().should_replicate() {
            tasks.push(Arc::clone(&self.replication).spawn_probe_loop(self.shutdown.subscribe()));
        }
        tasks.push(Arc::clone(&self.eviction).spawn(self.shutdown.subscribe()));
        if !self.doc_peers.is_empty() {
            tasks.push(Arc::clone(&self.sync).spawn_sync_loop(
                self.doc_peers.clone(),
                self.config.sync_interval(),
                self.shutdown.subscribe(),
            ));
        }

        // Blobs written before a restart may still be short of custodians
        if self.gateway.sovereignty().should_replicate() {
            for record in self.store.records().await {
                if !record.local_shards.is_empty() {
                    self.replication.enqueue(record.digest());
                }
            }
        }
        info!("Node {} started {} background tasks", self.config.node_id, tasks.len());
    }

    /// Signal every background task and wait for them to finish
    pub async fn shutdown(&self) {
        if self.shutdown.send(true).is_err() {
            warn!("No background task was listening for shutdown");
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Node {} stopped", self.config.node_id);
    }
}

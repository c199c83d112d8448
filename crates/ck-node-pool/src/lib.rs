use async_trait::async_trait;
use ck_types::{NodeVersion, StatusInfo, WalletServiceError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(Uuid);

impl NodeId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Immutable endpoint snapshot handed to a single request. Created from a
/// [`Node`] at selection time and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOrigin {
    pub primary: String,
    pub fallback: Option<String>,
}

/// Static description of a configured remote node.
#[derive(Debug, Clone)]
pub struct NodeEndpoint {
    pub url: String,
    pub alt_url: Option<String>,
}

impl NodeEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            alt_url: None,
        }
    }

    pub fn with_alt(url: impl Into<String>, alt_url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            alt_url: Some(alt_url.into()),
        }
    }
}

/// Last known health of one node. Mutated only by the health checker.
#[derive(Debug, Clone, Default)]
pub struct NodeHealth {
    pub last_ping_ms: Option<u64>,
    pub reachable_height: Option<u64>,
    pub version: Option<NodeVersion>,
    pub is_allowed: bool,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub url: String,
    pub alt_url: Option<String>,
    pub health: NodeHealth,
}

impl Node {
    pub fn origin(&self) -> NodeOrigin {
        NodeOrigin {
            primary: self.url.clone(),
            fallback: self.alt_url.clone(),
        }
    }
}

/// Per-chain node acceptance criteria, explicit instead of scattered
/// constants: a node is allowed when its probe succeeded, its version is
/// at or above `min_version`, and its height is within `max_height_lag`
/// of the best height seen in the pool this cycle.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_height_lag: u64,
    pub min_version: Option<NodeVersion>,
    pub probe_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_height_lag: 10,
            min_version: None,
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// Chain-specific probe used exclusively by the health checker. Every
/// chain adapter implements this.
#[async_trait]
pub trait NodeStatusProbe: Send + Sync {
    async fn get_status_info(&self, origin: &NodeOrigin) -> Result<StatusInfo, WalletServiceError>;
}

struct PoolInner {
    nodes: Vec<Node>,
    /// Allowed node ids, best first. Recomputed after every probe pass.
    ranking: Vec<NodeId>,
}

/// Ranked pool of remote nodes for one chain. The request path reads the
/// ranking; only the health checker writes it. Reads take a short lock on
/// an already-computed snapshot and never wait on an in-flight probe pass.
pub struct NodePool {
    inner: RwLock<PoolInner>,
    config: PoolConfig,
}

impl NodePool {
    pub fn new(endpoints: Vec<NodeEndpoint>, config: PoolConfig) -> Self {
        let nodes = endpoints
            .into_iter()
            .map(|endpoint| Node {
                id: NodeId::new(),
                url: endpoint.url,
                alt_url: endpoint.alt_url,
                health: NodeHealth::default(),
            })
            .collect();
        Self {
            inner: RwLock::new(PoolInner {
                nodes,
                ranking: Vec::new(),
            }),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn has_active_node(&self) -> bool {
        !self.inner.read().expect("pool lock poisoned").ranking.is_empty()
    }

    /// Id of the currently preferred node, if any node is allowed.
    pub fn chosen_node_id(&self) -> Option<NodeId> {
        self.inner
            .read()
            .expect("pool lock poisoned")
            .ranking
            .first()
            .copied()
    }

    /// Origin snapshot of the best currently-ranked node.
    pub fn chosen_origin(&self) -> Option<NodeOrigin> {
        let inner = self.inner.read().expect("pool lock poisoned");
        let best = inner.ranking.first()?;
        inner
            .nodes
            .iter()
            .find(|node| node.id == *best)
            .map(Node::origin)
    }

    /// Allowed nodes in ranked order, best first.
    pub fn sorted_allowed_nodes(&self) -> Vec<Node> {
        let inner = self.inner.read().expect("pool lock poisoned");
        inner
            .ranking
            .iter()
            .filter_map(|id| inner.nodes.iter().find(|node| node.id == *id))
            .cloned()
            .collect()
    }

    /// Snapshot of every configured node regardless of health.
    pub fn all_nodes(&self) -> Vec<Node> {
        self.inner.read().expect("pool lock poisoned").nodes.clone()
    }

    /// Applies one probe pass and recomputes the ranking. A failed probe
    /// demotes the node for this cycle only; it is re-admitted as soon as
    /// a later probe succeeds.
    pub fn apply_probe_results(&self, results: Vec<(NodeId, Result<StatusInfo, WalletServiceError>)>) {
        let mut inner = self.inner.write().expect("pool lock poisoned");

        for (id, result) in results {
            let Some(node) = inner.nodes.iter_mut().find(|node| node.id == id) else {
                continue;
            };
            match result {
                Ok(status) => {
                    node.health.last_ping_ms = Some(status.ping_ms);
                    node.health.reachable_height = Some(status.height);
                    node.health.version = status.version;
                    node.health.is_allowed = match (self.config.min_version, status.version) {
                        (Some(min), Some(actual)) if actual < min => {
                            debug!(url = %node.url, %actual, %min, "node below minimum version");
                            false
                        }
                        (Some(_), None) => false,
                        _ => true,
                    };
                }
                Err(error) => {
                    warn!(url = %node.url, %error, "node probe failed, demoting for this cycle");
                    node.health.is_allowed = false;
                    node.health.last_ping_ms = None;
                }
            }
        }

        let best_height = inner
            .nodes
            .iter()
            .filter(|node| node.health.is_allowed)
            .filter_map(|node| node.health.reachable_height)
            .max()
            .unwrap_or(0);
        let min_height = best_height.saturating_sub(self.config.max_height_lag);

        let mut ranked: Vec<&Node> = inner
            .nodes
            .iter()
            .filter(|node| node.health.is_allowed)
            .filter(|node| node.health.reachable_height.unwrap_or(0) >= min_height)
            .collect();
        ranked.sort_by_key(|node| node.health.last_ping_ms.unwrap_or(u64::MAX));
        inner.ranking = ranked.iter().map(|node| node.id).collect();
    }
}

/// Probes every node in a pool and feeds the results back into its
/// ranking. One checker instance per chain.
pub struct HealthChecker {
    pool: Arc<NodePool>,
    probe: Arc<dyn NodeStatusProbe>,
    pass_in_flight: AtomicBool,
}

impl HealthChecker {
    pub fn new(pool: Arc<NodePool>, probe: Arc<dyn NodeStatusProbe>) -> Self {
        Self {
            pool,
            probe,
            pass_in_flight: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    /// One probe pass over all configured nodes, concurrently, each under
    /// the pool's probe timeout. Requests keep reading the previous
    /// ranking until the pass completes.
    pub async fn health_check(&self) {
        let nodes = self.pool.all_nodes();
        if nodes.is_empty() {
            return;
        }
        let timeout = self.pool.config().probe_timeout;

        let mut probes = JoinSet::new();
        for node in nodes {
            let probe = Arc::clone(&self.probe);
            let origin = node.origin();
            let id = node.id;
            probes.spawn(async move {
                let result = match tokio::time::timeout(timeout, probe.get_status_info(&origin)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(WalletServiceError::NetworkError),
                };
                (id, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = probes.join_next().await {
            if let Ok(outcome) = joined {
                results.push(outcome);
            }
        }
        self.pool.apply_probe_results(results);
    }

    /// Fire-and-forget health check used by the request path after a
    /// failed call. Never delays the caller and never stacks passes.
    pub fn trigger_out_of_band(self: &Arc<Self>) {
        if self
            .pass_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let checker = Arc::clone(self);
        tokio::spawn(async move {
            checker.health_check().await;
            checker.pass_in_flight.store(false, Ordering::Release);
        });
    }

    /// Periodic probe loop. The returned handle can be aborted on logout.
    pub fn spawn_loop(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let checker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                checker.health_check().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct ScriptedProbe {
        // url -> queue of scripted outcomes, last one repeats
        outcomes: Mutex<HashMap<String, Vec<Result<StatusInfo, WalletServiceError>>>>,
    }

    impl ScriptedProbe {
        fn new(outcomes: HashMap<String, Vec<Result<StatusInfo, WalletServiceError>>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
            }
        }
    }

    #[async_trait]
    impl NodeStatusProbe for ScriptedProbe {
        async fn get_status_info(
            &self,
            origin: &NodeOrigin,
        ) -> Result<StatusInfo, WalletServiceError> {
            let mut outcomes = self.outcomes.lock().unwrap();
            let queue = outcomes
                .get_mut(&origin.primary)
                .unwrap_or_else(|| panic!("unexpected probe of {}", origin.primary));
            if queue.len() > 1 {
                queue.remove(0)
            } else {
                queue[0].clone()
            }
        }
    }

    fn status(ping_ms: u64, height: u64, version: Option<&str>) -> StatusInfo {
        StatusInfo {
            ping_ms,
            height,
            version: version.map(|raw| raw.parse().unwrap()),
        }
    }

    fn pool_of(urls: &[&str], config: PoolConfig) -> Arc<NodePool> {
        let endpoints = urls.iter().map(|url| NodeEndpoint::new(*url)).collect();
        Arc::new(NodePool::new(endpoints, config))
    }

    #[test]
    fn fresh_pool_has_no_active_node() {
        let pool = pool_of(&["http://a", "http://b"], PoolConfig::default());
        assert!(!pool.has_active_node());
        assert!(pool.chosen_origin().is_none());
        assert!(pool.sorted_allowed_nodes().is_empty());
    }

    #[tokio::test]
    async fn ranking_prefers_low_ping_within_height_lag() -> anyhow::Result<()> {
        let pool = pool_of(
            &["http://slow", "http://fast", "http://behind"],
            PoolConfig {
                max_height_lag: 5,
                ..PoolConfig::default()
            },
        );
        let probe = Arc::new(ScriptedProbe::new(HashMap::from([
            ("http://slow".to_owned(), vec![Ok(status(250, 1000, None))]),
            ("http://fast".to_owned(), vec![Ok(status(40, 999, None))]),
            ("http://behind".to_owned(), vec![Ok(status(10, 990, None))]),
        ])));
        let checker = HealthChecker::new(Arc::clone(&pool), probe);
        checker.health_check().await;

        let ranked = pool.sorted_allowed_nodes();
        assert_eq!(ranked.len(), 2, "lagging node must be excluded");
        assert_eq!(ranked[0].url, "http://fast");
        assert_eq!(ranked[1].url, "http://slow");
        assert_eq!(pool.chosen_origin().unwrap().primary, "http://fast");
        Ok(())
    }

    #[tokio::test]
    async fn node_below_minimum_version_is_not_allowed() -> anyhow::Result<()> {
        let pool = pool_of(
            &["http://old", "http://new"],
            PoolConfig {
                min_version: Some("2.0.0".parse()?),
                ..PoolConfig::default()
            },
        );
        let probe = Arc::new(ScriptedProbe::new(HashMap::from([
            ("http://old".to_owned(), vec![Ok(status(10, 500, Some("1.9.9")))]),
            ("http://new".to_owned(), vec![Ok(status(90, 500, Some("2.0.0")))]),
        ])));
        HealthChecker::new(Arc::clone(&pool), probe).health_check().await;

        let ranked = pool.sorted_allowed_nodes();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].url, "http://new");
        Ok(())
    }

    #[tokio::test]
    async fn failed_probe_demotes_for_one_cycle_only() -> anyhow::Result<()> {
        let pool = pool_of(&["http://flaky"], PoolConfig::default());
        let probe = Arc::new(ScriptedProbe::new(HashMap::from([(
            "http://flaky".to_owned(),
            vec![
                Err(WalletServiceError::NetworkError),
                Ok(status(30, 700, None)),
            ],
        )])));
        let checker = HealthChecker::new(Arc::clone(&pool), probe);

        checker.health_check().await;
        assert!(!pool.has_active_node(), "failed probe must demote");

        checker.health_check().await;
        assert!(pool.has_active_node(), "next success must re-admit");
        assert_eq!(pool.chosen_origin().unwrap().primary, "http://flaky");
        Ok(())
    }

    #[tokio::test]
    async fn all_nodes_failing_leaves_empty_ranking() -> anyhow::Result<()> {
        let pool = pool_of(&["http://a", "http://b"], PoolConfig::default());
        let probe = Arc::new(ScriptedProbe::new(HashMap::from([
            ("http://a".to_owned(), vec![Err(WalletServiceError::NetworkError)]),
            (
                "http://b".to_owned(),
                vec![Err(WalletServiceError::RemoteServiceError("503".into()))],
            ),
        ])));
        HealthChecker::new(Arc::clone(&pool), probe).health_check().await;

        assert!(!pool.has_active_node());
        assert!(pool.chosen_node_id().is_none());
        Ok(())
    }

    #[test]
    fn origin_snapshot_carries_fallback() {
        let pool = Arc::new(NodePool::new(
            vec![NodeEndpoint::with_alt("http://main", "http://alt")],
            PoolConfig::default(),
        ));
        let node = pool.all_nodes().remove(0);
        let origin = node.origin();
        assert_eq!(origin.primary, "http://main");
        assert_eq!(origin.fallback.as_deref(), Some("http://alt"));
    }
}

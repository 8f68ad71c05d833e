//! Pooled mTLS channels to the fleet's agents.
//!
//! One lazily-connected channel per `host:port`, shared by every caller.
//! Entries are re-dialled when flagged unhealthy and evicted by a sweeper
//! once idle past the TTL.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use paasdeploy_proto::agent::agent_client::AgentClient;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tonic::{Code, Status};
use tracing::{debug, info};

use crate::error::Result;

/// Entries untouched for this long are closed by the sweeper.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(300);

/// Deadline ordinary unary calls run under. Deploy execution and log
/// streaming are exempt: they live as long as the caller's context.
pub const DEFAULT_RPC_DEADLINE: Duration = Duration::from_secs(30);

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// PEM material every dial uses: the root CA as trust anchor plus the
/// control plane's client identity.
#[derive(Clone)]
pub struct TlsMaterial {
    pub ca_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

struct PoolEntry {
    channel: Channel,
    last_used: Mutex<Instant>,
    unhealthy: AtomicBool,
}

impl PoolEntry {
    fn new(channel: Channel) -> Self {
        Self {
            channel,
            last_used: Mutex::new(Instant::now()),
            unhealthy: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().unwrap().elapsed()
    }
}

pub struct AgentPool {
    entries: RwLock<HashMap<String, Arc<PoolEntry>>>,
    tls: TlsMaterial,
    idle_ttl: Duration,
}

impl AgentPool {
    pub fn new(tls: TlsMaterial) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            tls,
            idle_ttl: DEFAULT_IDLE_TTL,
        })
    }

    /// A client for the agent at `address:port`. Healthy pooled channels are
    /// reused; a miss (or an entry flagged unhealthy) dials a fresh channel
    /// under the write lock with a double-checked lookup.
    pub async fn client(
        &self,
        address: &str,
        port: u16,
        server_name: &str,
    ) -> Result<AgentClient<Channel>> {
        let key = pool_key(address, port);

        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(&key) {
                if !entry.unhealthy.load(Ordering::Acquire) {
                    entry.touch();
                    return Ok(AgentClient::new(entry.channel.clone()));
                }
            }
        }

        let mut entries = self.entries.write().await;
        // someone else may have redialled while we waited for the lock
        if let Some(entry) = entries.get(&key) {
            if !entry.unhealthy.load(Ordering::Acquire) {
                entry.touch();
                return Ok(AgentClient::new(entry.channel.clone()));
            }
        }

        debug!(%key, "dialling agent");
        let channel = self.dial(address, port, server_name)?;
        entries.insert(key, Arc::new(PoolEntry::new(channel.clone())));

        Ok(AgentClient::new(channel))
    }

    fn dial(&self, address: &str, port: u16, server_name: &str) -> Result<Channel> {
        let tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(&self.tls.ca_pem))
            .identity(Identity::from_pem(&self.tls.cert_pem, &self.tls.key_pem))
            .domain_name(server_name);

        let channel = Endpoint::from_shared(format!("https://{address}:{port}"))?
            .tls_config(tls)?
            .connect_timeout(CONNECT_TIMEOUT)
            .http2_keep_alive_interval(KEEP_ALIVE_INTERVAL)
            .keep_alive_timeout(KEEP_ALIVE_TIMEOUT)
            .keep_alive_while_idle(true)
            .connect_lazy();

        Ok(channel)
    }

    /// Flag an entry so the next lookup redials. Called after transport-level
    /// failures.
    pub async fn flag_unhealthy(&self, address: &str, port: u16) {
        let entries = self.entries.read().await;
        if let Some(entry) = entries.get(&pool_key(address, port)) {
            entry.unhealthy.store(true, Ordering::Release);
        }
    }

    /// Drop entries that are unhealthy or idle past the TTL. Returns how
    /// many were evicted.
    pub async fn sweep(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();

        entries.retain(|key, entry| {
            let keep = !entry.unhealthy.load(Ordering::Acquire) && entry.idle_for() < self.idle_ttl;
            if !keep {
                debug!(%key, "evicting pooled agent channel");
            }
            keep
        });

        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Background eviction loop, stopped through the cancellation token.
    pub fn start_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let evicted = pool.sweep().await;
                if evicted > 0 {
                    info!(evicted, "agent pool sweep");
                }
            }
        })
    }
}

fn pool_key(address: &str, port: u16) -> String {
    format!("{address}:{port}")
}

/// Wrap a message in a request carrying the default per-call deadline.
pub fn with_deadline<T>(message: T) -> tonic::Request<T> {
    let mut request = tonic::Request::new(message);
    request.set_timeout(DEFAULT_RPC_DEADLINE);
    request
}

/// Retry a unary call at most twice on `unavailable`, sleeping
/// 100 ms × attempt between tries. Any other status aborts immediately.
pub async fn retry_unary<T, F, Fut>(mut call: F) -> std::result::Result<T, Status>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, Status>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Err(status) if status.code() == Code::Unavailable && attempt < 2 => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    use paasdeploy_pki::CertAuthority;
    use tonic::{Code, Status};

    use super::{retry_unary, AgentPool, TlsMaterial};

    fn tls_material() -> TlsMaterial {
        let ca = CertAuthority::generate().unwrap();
        let client = ca.issue_agent("control-plane", "localhost").unwrap();
        TlsMaterial {
            ca_pem: ca.root_cert_pem().as_bytes().to_vec(),
            cert_pem: client.cert_pem.into_bytes(),
            key_pem: client.key_pem.into_bytes(),
        }
    }

    #[tokio::test]
    async fn pool_reuses_channels_per_host() {
        let pool = AgentPool::new(tls_material());

        pool.client("10.0.0.7", 7646, "agent-1").await.unwrap();
        pool.client("10.0.0.7", 7646, "agent-1").await.unwrap();
        pool.client("10.0.0.8", 7646, "agent-2").await.unwrap();

        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn idle_entries_are_swept() {
        let pool = AgentPool::new(tls_material());
        pool.client("10.0.0.7", 7646, "agent-1").await.unwrap();

        // nothing idle yet
        assert_eq!(pool.sweep().await, 0);

        // rewind the entry's clock past the TTL
        {
            let entries = pool.entries.read().await;
            let entry = entries.values().next().unwrap();
            *entry.last_used.lock().unwrap() = Instant::now() - Duration::from_secs(600);
        }

        assert_eq!(pool.sweep().await, 1);
        assert_eq!(pool.len().await, 0);
    }

    #[tokio::test]
    async fn unhealthy_entries_are_redialled() {
        let pool = AgentPool::new(tls_material());
        pool.client("10.0.0.7", 7646, "agent-1").await.unwrap();
        pool.flag_unhealthy("10.0.0.7", 7646).await;

        // lookup replaces the entry rather than reusing it
        pool.client("10.0.0.7", 7646, "agent-1").await.unwrap();
        assert_eq!(pool.len().await, 1);

        let entries = pool.entries.read().await;
        assert!(!entries
            .values()
            .next()
            .unwrap()
            .unhealthy
            .load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn retry_stops_after_two_unavailable_retries() {
        let calls = AtomicU32::new(0);

        let result: Result<(), Status> = retry_unary(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Status::unavailable("agent down")) }
        })
        .await;

        assert_eq!(result.unwrap_err().code(), Code::Unavailable);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_aborts_on_other_statuses() {
        let calls = AtomicU32::new(0);

        let result: Result<(), Status> = retry_unary(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Status::invalid_argument("bad request")) }
        })
        .await;

        assert_eq!(result.unwrap_err().code(), Code::InvalidArgument);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_recovers_on_success() {
        let calls = AtomicU32::new(0);

        let result: Result<u32, Status> = retry_unary(|| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(Status::unavailable("first try fails"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

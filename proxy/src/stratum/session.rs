/// Client session - handshake and mining loop for one miner connection
///
/// `subscribe` must come first. After the reply the session is registered for
/// broadcasts and every outbound message goes through a single writer task,
/// so replies and pushed work never interleave on the wire.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify as Wake};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::protocol::{Method, Request, Response, StratumError};
use super::registry::{SessionHandle, SessionRegistry};
use super::transport::{LineReader, LineWriter};
use crate::blockchain::rpc_client::{submit_block, RpcCall};
use crate::config::{Config, Timeouts};
use crate::error::Result;
use crate::jobs::JobBook;
use crate::metrics::prometheus as metrics;
use crate::pow::{difficulty_to_target, is_valid_address, Difficulty, Uint128, Uint256};
use crate::shares::{Share, SharePublisher, ShareStatus, ShareValidator};

/// Per-session rules, fixed at startup.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub share_difficulty: Difficulty,
    pub share_target: Uint256,
    pub require_authorize: bool,
    pub validate_address: bool,
    pub testnet: bool,
    pub server_name: String,
    pub queue_depth: usize,
    pub timeouts: Timeouts,
}

impl SessionPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            share_difficulty: cfg.share_difficulty,
            share_target: difficulty_to_target(cfg.share_difficulty),
            require_authorize: cfg.require_authorize,
            validate_address: cfg.validate_address,
            testnet: cfg.testnet,
            server_name: cfg.server_name.clone(),
            queue_depth: cfg.session_queue,
            timeouts: cfg.timeouts.clone(),
        }
    }
}

/// Everything a session needs besides its own socket.
pub struct SessionContext {
    pub registry: Arc<SessionRegistry>,
    pub jobs: Arc<JobBook>,
    pub validator: Arc<ShareValidator>,
    pub publisher: Arc<dyn SharePublisher>,
    pub rpc: Arc<dyn RpcCall>,
    /// Wakes the template poller early.
    pub refresh: Arc<Wake>,
    /// Sessions and their background work (block submissions).
    pub tasks: TaskTracker,
    pub policy: SessionPolicy,
}

/// Keeps the session in the registry for as long as it is alive.
struct Registration<'a> {
    registry: &'a SessionRegistry,
    handle: Arc<SessionHandle>,
}

impl<'a> Registration<'a> {
    fn new(registry: &'a SessionRegistry, handle: Arc<SessionHandle>) -> Self {
        registry.register(handle.clone());
        Self { registry, handle }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.handle.close();
        self.registry.unregister(self.handle.id);
    }
}

pub struct ClientSession {
    id: u64,
    nonce_part1: Uint128,
    peer: SocketAddr,
    ctx: Arc<SessionContext>,
    shutdown: CancellationToken,
    worker: Option<String>,
}

impl ClientSession {
    pub fn new(
        id: u64,
        nonce_part1: Uint128,
        peer: SocketAddr,
        ctx: Arc<SessionContext>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            nonce_part1,
            peer,
            ctx,
            shutdown,
            worker: None,
        }
    }

    fn subscribe_reply(&self, id: Value) -> Response {
        Response::SubscribeReply {
            id,
            session: String::new(),
            nonce_part1: self.nonce_part1,
        }
    }

    /// Drive the connection until it closes. Cancellation is a clean exit.
    pub async fn run<R, W>(mut self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let timeouts = self.ctx.policy.timeouts.clone();
        let mut reader = LineReader::new(reader);
        let mut writer = LineWriter::new(writer);

        // A first message other than subscribe ends the session without a reply.
        let first = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            r = reader.wait_for(Method::Subscribe, Instant::now() + timeouts.init()) => r?,
        };
        writer
            .write_timed(
                &self.subscribe_reply(first.id().clone()),
                Instant::now() + timeouts.write(),
            )
            .await?;

        let (tx, rx) = mpsc::channel(self.ctx.policy.queue_depth.max(2));
        let handle = Arc::new(SessionHandle::new(
            self.id,
            self.nonce_part1,
            tx,
            self.shutdown.clone(),
        ));

        let ctx = self.ctx.clone();
        let _registration = Registration::new(&ctx.registry, handle.clone());
        debug!(session = self.id, "Subscribed");

        let writer_task = tokio::spawn(write_loop(
            writer,
            rx,
            self.shutdown.clone(),
            timeouts.write(),
            self.id,
        ));

        let result = self.serve(&handle, &mut reader, timeouts.inactivity()).await;

        handle.close();
        let _ = writer_task.await;
        result
    }

    async fn serve<R>(
        &mut self,
        handle: &SessionHandle,
        reader: &mut LineReader<R>,
        inactivity: Duration,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        handle.push(Response::SetDifficulty {
            target: self.ctx.policy.share_target,
        })?;
        if let Some(work) = self.ctx.jobs.current() {
            handle.push(Response::Notify(work.notify(true)))?;
        }

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                r = reader.read_timed(Instant::now() + inactivity) => r,
            };

            let request = match next {
                Ok(request) => request,
                Err(e) => {
                    // Decodable enough to answer: tell the miner why before closing.
                    if let (Some(id), Some(err)) = (e.reply_id(), StratumError::from_parse_error(&e)) {
                        let _ = handle.push(Response::error(id.clone(), err));
                    }
                    return Err(e);
                }
            };

            let response = match request {
                Request::Subscribe { id, .. } => self.subscribe_reply(id),
                Request::Authorize { id, username, .. } => {
                    let ok = self.authorize(username);
                    Response::ok(id, json!(ok))
                }
                Request::Submit {
                    id,
                    worker,
                    job,
                    ntime,
                    nonce_part2,
                    solution,
                } => self.submit(id, worker, job, ntime, nonce_part2, &solution),
            };

            handle.push(response)?;
        }
    }

    fn authorize(&mut self, username: String) -> bool {
        let policy = &self.ctx.policy;

        if policy.validate_address {
            let address = username.split('.').next().unwrap_or_default();
            let (valid, testnet) = is_valid_address(address);
            if !valid || testnet != policy.testnet {
                warn!(session = self.id, worker = %username, "Authorize rejected: bad payout address");
                return false;
            }
        }

        info!(session = self.id, peer = %self.peer, worker = %username, "Authorized");
        self.worker = Some(username);
        true
    }

    fn submit(
        &self,
        id: Value,
        worker: String,
        job: String,
        ntime: u32,
        nonce_part2: Uint128,
        solution: &[u8],
    ) -> Response {
        let policy = &self.ctx.policy;

        if policy.require_authorize && self.worker.is_none() {
            metrics::inc_rejected("unauthorized");
            return Response::error(id, StratumError::unauthorized());
        }

        let work = match self.ctx.jobs.get(&job) {
            Some(work) => work,
            None => {
                metrics::inc_rejected("job_not_found");
                debug!(session = self.id, job = %job, "Submit for unknown job");
                return Response::error(id, StratumError::job_not_found());
            }
        };

        let check = self.ctx.validator.check_share(
            &work,
            ntime,
            &self.nonce_part1,
            &nonce_part2,
            solution,
            &policy.share_target,
        );

        if check.status == ShareStatus::Invalid {
            metrics::inc_rejected("low_difficulty");
            debug!(session = self.id, job = %job, "Invalid share");
            return Response::error(id, StratumError::low_difficulty());
        }

        if let Some(hash) = &check.hash {
            if !self.ctx.validator.record(hash) {
                metrics::inc_rejected("duplicate");
                return Response::error(id, StratumError::duplicate_share());
            }
        }

        metrics::inc_accepted();
        let is_block = check.status == ShareStatus::Block;

        let share = Share {
            submitter: self.worker.clone().unwrap_or(worker),
            difficulty: policy.share_difficulty,
            net_difficulty: work.difficulty,
            subsidy: work.subsidy,
            host: self.peer.ip().to_string(),
            server: policy.server_name.clone(),
            valid: true,
            block: is_block,
            job: job.clone(),
            height: work.height,
            timestamp: Utc::now().timestamp(),
        };
        if let Err(e) = self.ctx.publisher.publish(share) {
            warn!(session = self.id, "Share not published: {}", e);
        }

        if let Some(block) = check.block {
            metrics::inc_blocks_found();
            info!(
                session = self.id,
                job = %job,
                height = work.height,
                hash = %check.hash.unwrap_or_default(),
                "Block found"
            );

            let rpc = self.ctx.rpc.clone();
            let refresh = self.ctx.refresh.clone();
            let height = work.height;
            self.ctx.tasks.spawn(async move {
                match submit_block(rpc.as_ref(), &block).await {
                    Ok(true) => info!(height, "Block accepted by node"),
                    Ok(false) => warn!(height, "Block rejected by node"),
                    Err(e) => error!(height, "Block submission failed: {}", e),
                }
                refresh.notify_one();
            });
        }

        Response::ok(id, json!(true))
    }
}

/// Sole writer for a registered session. Drains what was queued before
/// cancellation, then shuts the stream down.
async fn write_loop<W>(
    mut writer: LineWriter<W>,
    mut rx: mpsc::Receiver<Response>,
    shutdown: CancellationToken,
    write_timeout: Duration,
    session: u64,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            msg = rx.recv() => msg,
            _ = shutdown.cancelled() => None,
        };
        let Some(msg) = next else { break };

        if let Err(e) = writer.write_timed(&msg, Instant::now() + write_timeout).await {
            debug!(session, "Write failed: {}", e);
            shutdown.cancel();
            return;
        }
    }

    rx.close();
    while let Ok(msg) = rx.try_recv() {
        if writer
            .write_timed(&msg, Instant::now() + write_timeout)
            .await
            .is_err()
        {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ProxyError;
    use crate::jobs::sample_work;
    use crate::shares::StructuralVerifier;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

    #[derive(Default)]
    pub(crate) struct MemoryPublisher {
        pub shares: Mutex<Vec<Share>>,
    }

    impl SharePublisher for MemoryPublisher {
        fn publish(&self, share: Share) -> Result<()> {
            self.shares.lock().push(share);
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingRpc {
        pub calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl RpcCall for RecordingRpc {
        async fn call(&self, method: &str, params: Value) -> Result<Value> {
            self.calls.lock().push((method.to_string(), params));
            Ok(Value::Null)
        }
    }

    struct Harness {
        ctx: Arc<SessionContext>,
        publisher: Arc<MemoryPublisher>,
    }

    fn harness(policy: impl FnOnce(&mut SessionPolicy)) -> Harness {
        let mut p = SessionPolicy::from_config(&Config::default());
        p.share_target = Uint256::MAX;
        policy(&mut p);

        let publisher = Arc::new(MemoryPublisher::default());
        let ctx = Arc::new(SessionContext {
            registry: Arc::new(SessionRegistry::new()),
            jobs: Arc::new(JobBook::default()),
            validator: Arc::new(ShareValidator::new(Arc::new(StructuralVerifier))),
            publisher: publisher.clone(),
            rpc: Arc::new(RecordingRpc::default()),
            refresh: Arc::new(Wake::new()),
            tasks: TaskTracker::new(),
            policy: p,
        });
        Harness { ctx, publisher }
    }

    struct Peer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        out: WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn send(&mut self, v: Value) {
            let mut line = v.to_string();
            line.push('\n');
            self.out.write_all(line.as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Value> {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("peer read timed out")
                .unwrap()?;
            Some(serde_json::from_str(&line).unwrap())
        }
    }

    fn start(h: &Harness, id: u64) -> (Peer, tokio::task::JoinHandle<Result<()>>) {
        let (client, server) = duplex(16 * 1024);
        let (r, w) = split(server);
        let session = ClientSession::new(
            id,
            Uint128::nonce_partition([0xaa; 8], id),
            "10.1.2.3:4000".parse().unwrap(),
            h.ctx.clone(),
            CancellationToken::new(),
        );
        let task = tokio::spawn(session.run(r, w));

        let (cr, cw) = split(client);
        let peer = Peer {
            lines: BufReader::new(cr).lines(),
            out: cw,
        };
        (peer, task)
    }

    fn submit(job: &str) -> Value {
        json!({
            "id": 10,
            "method": "mining.submit",
            "params": [
                "t1miner.rig",
                job,
                "5f5e1000",
                "42".repeat(16),
                format!("fd4005{}", "5a".repeat(1344)),
            ],
        })
    }

    async fn subscribe(peer: &mut Peer) -> Value {
        peer.send(json!({"id": 1, "method": "mining.subscribe", "params": []}))
            .await;
        peer.recv().await.unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_then_difficulty_and_work() {
        let h = harness(|_| {});
        let work = h.ctx.jobs.insert(sample_work(50));
        let (mut peer, _task) = start(&h, 7);

        let reply = subscribe(&mut peer).await;
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["result"][1], "aaaaaaaaaaaaaaaa0700000000000000");

        let diff = peer.recv().await.unwrap();
        assert_eq!(diff["method"], "mining.set_difficulty");
        assert_eq!(diff["params"][0], "ff".repeat(32));

        let notify = peer.recv().await.unwrap();
        assert_eq!(notify["method"], "mining.notify");
        assert_eq!(notify["params"][0], work.job_id.as_str());
        assert!(h.ctx.registry.contains(7));
    }

    #[tokio::test]
    async fn test_authorize_first_is_rejected_silently() {
        let h = harness(|_| {});
        let (mut peer, task) = start(&h, 1);

        peer.send(json!({"id": 1, "method": "mining.authorize", "params": ["a", "b"]}))
            .await;

        assert!(peer.recv().await.is_none());
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::ProtocolViolation { .. }));
        assert!(h.ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_ok_share_is_published() {
        let h = harness(|_| {});
        let mut work = sample_work(50);
        work.target = Uint256::ZERO;
        let work = h.ctx.jobs.insert(work);
        let (mut peer, _task) = start(&h, 2);

        subscribe(&mut peer).await;
        peer.recv().await; // set_difficulty
        peer.recv().await; // notify

        peer.send(submit(&work.job_id)).await;
        let reply = peer.recv().await.unwrap();
        assert_eq!(reply["id"], 10);
        assert_eq!(reply["result"], true);

        let shares = h.publisher.shares.lock().clone();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].submitter, "t1miner.rig");
        assert_eq!(shares[0].host, "10.1.2.3");
        assert!(!shares[0].block);

        // Same solution again.
        peer.send(submit(&work.job_id)).await;
        let reply = peer.recv().await.unwrap();
        assert_eq!(reply["error"][0], StratumError::DUPLICATE_SHARE);
    }

    #[tokio::test]
    async fn test_unknown_job_keeps_session_open() {
        let h = harness(|_| {});
        let (mut peer, _task) = start(&h, 3);

        subscribe(&mut peer).await;
        peer.recv().await; // set_difficulty

        peer.send(submit("h1-00000000-99")).await;
        let reply = peer.recv().await.unwrap();
        assert_eq!(reply["error"][0], StratumError::JOB_NOT_FOUND);

        peer.send(json!({"id": 2, "method": "mining.authorize", "params": ["w", "x"]}))
            .await;
        let reply = peer.recv().await.unwrap();
        assert_eq!(reply["result"], true);
    }

    #[tokio::test]
    async fn test_low_difficulty_share() {
        let h = harness(|p| p.share_target = Uint256::ZERO);
        let mut work = sample_work(50);
        work.target = Uint256::ZERO;
        let work = h.ctx.jobs.insert(work);
        let (mut peer, _task) = start(&h, 4);

        subscribe(&mut peer).await;
        peer.recv().await;
        peer.recv().await;

        peer.send(submit(&work.job_id)).await;
        let reply = peer.recv().await.unwrap();
        assert_eq!(reply["error"][0], StratumError::LOW_DIFFICULTY);
        assert!(h.publisher.shares.lock().is_empty());
        assert!(h.ctx.registry.contains(4));
    }

    #[tokio::test]
    async fn test_require_authorize_policy() {
        let h = harness(|p| p.require_authorize = true);
        let work = h.ctx.jobs.insert(sample_work(50));
        let (mut peer, _task) = start(&h, 5);

        subscribe(&mut peer).await;
        peer.recv().await;
        peer.recv().await;

        peer.send(submit(&work.job_id)).await;
        let reply = peer.recv().await.unwrap();
        assert_eq!(reply["error"][0], StratumError::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_address_validation_on_authorize() {
        let h = harness(|p| p.validate_address = true);
        let (mut peer, _task) = start(&h, 6);

        subscribe(&mut peer).await;
        peer.recv().await;

        peer.send(json!({"id": 3, "method": "mining.authorize", "params": ["nope.rig", "x"]}))
            .await;
        let reply = peer.recv().await.unwrap();
        assert_eq!(reply["result"], false);
    }

    #[tokio::test]
    async fn test_unknown_method_answered_then_closed() {
        let h = harness(|_| {});
        let (mut peer, task) = start(&h, 8);

        subscribe(&mut peer).await;
        peer.recv().await;

        peer.send(json!({"id": 4, "method": "mining.extranonce.subscribe", "params": []}))
            .await;
        let reply = peer.recv().await.unwrap();
        assert_eq!(reply["id"], 4);
        assert_eq!(reply["error"][0], StratumError::INVALID_METHOD);

        assert!(peer.recv().await.is_none());
        assert!(matches!(
            task.await.unwrap(),
            Err(ProxyError::UnknownMethod { .. })
        ));
        assert!(!h.ctx.registry.contains(8));
    }

    #[tokio::test]
    async fn test_cancellation_unregisters() {
        let h = harness(|_| {});
        let (client, server) = duplex(4096);
        let (r, w) = split(server);
        let token = CancellationToken::new();
        let session = ClientSession::new(
            9,
            Uint128::nonce_partition([0xaa; 8], 9),
            "10.1.2.3:4000".parse().unwrap(),
            h.ctx.clone(),
            token.clone(),
        );
        let task = tokio::spawn(session.run(r, w));

        let (cr, cw) = split(client);
        let mut peer = Peer {
            lines: BufReader::new(cr).lines(),
            out: cw,
        };
        subscribe(&mut peer).await;
        peer.recv().await;
        assert!(h.ctx.registry.contains(9));

        token.cancel();
        assert!(task.await.unwrap().is_ok());
        assert!(!h.ctx.registry.contains(9));
    }
}

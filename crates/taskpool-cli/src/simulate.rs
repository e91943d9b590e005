//! In-process simulation: push-mode pool, a handful of simulated nodes,
//! some of which fail on purpose or crash mid-run.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use rand::Rng;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, sleep};
use tracing::{debug, info, warn};

use taskpool_core::domain::{LeaseGrant, NodeCapabilities, NodeId, Outcome, SubmitAck};
use taskpool_core::impls::ChannelDispatcher;
use taskpool_core::{DispatchMode, PoolBuilder, PoolConfig, TaskPool};

#[derive(Debug, Clone, Args)]
pub struct SimulateArgs {
    /// Number of simulated nodes
    #[arg(long, default_value_t = 4)]
    pub nodes: usize,

    /// Number of tasks to submit
    #[arg(long, default_value_t = 40)]
    pub tasks: usize,

    /// Probability that a node reports a failure for a task
    #[arg(long, default_value_t = 0.1)]
    pub failure_rate: f64,

    /// Failures the first node reports before it starts succeeding
    #[arg(long, default_value_t = 2)]
    pub forced_failures: u32,

    /// Let the last node crash after this many tasks (0 = never)
    #[arg(long, default_value_t = 3)]
    pub crash_after: u32,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,
}

/// How one simulated node behaves.
struct NodeBehaviour {
    id: NodeId,
    failure_rate: f64,
    remaining_failures: AtomicU32,
    /// Tasks left before the node goes silent; `None` runs forever.
    crash_after: Option<AtomicU32>,
}

impl NodeBehaviour {
    /// Decides the result of one task. `None` means the node just crashed.
    fn outcome(&self, grant: &LeaseGrant) -> Option<Outcome> {
        if let Some(left) = &self.crash_after
            && left.fetch_sub(1, Ordering::Relaxed) <= 1
        {
            return None;
        }

        let forced = self
            .remaining_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if forced {
            return Some(Outcome::failure(format!(
                "intentional failure on {}",
                grant.payload_ref
            )));
        }
        if rand::thread_rng().gen_bool(self.failure_rate) {
            return Some(Outcome::failure("simulated pdf parse error"));
        }
        Some(Outcome::success(json!({
            "summary_ref": format!("summary/{}", grant.task_id),
            "node": self.id.as_str(),
        })))
    }
}

pub fn simulation_config() -> PoolConfig {
    PoolConfig {
        lease_ttl_secs: 10,
        heartbeat_timeout_secs: 2,
        tick_interval_ms: 50,
        dispatch_mode: DispatchMode::Push,
        ..PoolConfig::default()
    }
}

pub async fn run(args: SimulateArgs) -> Result<()> {
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.failure_rate),
        "--failure-rate must be between 0 and 1"
    );
    anyhow::ensure!(args.nodes > 0, "--nodes must be at least 1");

    let config = simulation_config();
    anyhow::ensure!(
        args.tasks <= config.queue_capacity,
        "--tasks must not exceed queue capacity {}",
        config.queue_capacity
    );

    let dispatcher = Arc::new(ChannelDispatcher::new(2));
    let pool = PoolBuilder::new()
        .config(config)
        .dispatcher(dispatcher.clone())
        .build()
        .context("building simulation pool")?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut nodes: Vec<JoinHandle<()>> = Vec::with_capacity(args.nodes);
    for i in 0..args.nodes {
        let id = NodeId::new(format!("sim-{i}"));
        let behaviour = NodeBehaviour {
            id: id.clone(),
            failure_rate: args.failure_rate,
            remaining_failures: AtomicU32::new(if i == 0 { args.forced_failures } else { 0 }),
            crash_after: (args.nodes > 1 && i == args.nodes - 1 && args.crash_after > 0)
                .then(|| AtomicU32::new(args.crash_after)),
        };
        pool.register_node(id.clone(), NodeCapabilities::new(1));
        let inbox = dispatcher.connect(id);
        nodes.push(tokio::spawn(node_loop(
            pool.clone(),
            behaviour,
            inbox,
            stop_rx.clone(),
        )));
    }

    let scheduler = pool.spawn_scheduler();

    for i in 0..args.tasks {
        let priority = rand::thread_rng().gen_range(0..10);
        pool.submit(format!("paper:{i}"), priority)
            .with_context(|| format!("submitting task {i}"))?;
    }
    info!(tasks = args.tasks, nodes = args.nodes, "simulation started");

    let finished = wait_until_settled(&pool, args.tasks, Duration::from_secs(args.timeout_secs)).await;

    let _ = stop_tx.send(true);
    for node in nodes {
        let _ = node.await;
    }
    scheduler.shutdown_and_join().await;

    let report = json!({
        "stats": pool.stats(),
        "nodes": pool.nodes(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    anyhow::ensure!(finished, "simulation timed out before every task settled");
    Ok(())
}

async fn wait_until_settled(pool: &TaskPool, total: usize, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let counts = pool.queue().counts();
        if counts.finished() >= total {
            info!(
                completed = counts.completed,
                abandoned = counts.abandoned,
                "all tasks settled"
            );
            return true;
        }
        if Instant::now() >= deadline {
            warn!(live = counts.live(), "timed out waiting for tasks");
            return false;
        }
        sleep(Duration::from_millis(100)).await;
    }
}

async fn node_loop(
    pool: TaskPool,
    behaviour: NodeBehaviour,
    mut inbox: mpsc::Receiver<LeaseGrant>,
    mut stop: watch::Receiver<bool>,
) {
    let id = behaviour.id.clone();
    let mut heartbeat = tokio::time::interval(Duration::from_millis(500));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = heartbeat.tick() => {
                if let Err(e) = pool.heartbeat(&id) {
                    warn!(node_id = %id, error = %e, "heartbeat rejected");
                }
            }
            grant = inbox.recv() => {
                let Some(grant) = grant else { break };
                let Some(outcome) = behaviour.outcome(&grant) else {
                    warn!(node_id = %id, task_id = %grant.task_id, "node crashed");
                    break;
                };

                let work = Duration::from_millis(rand::thread_rng().gen_range(10..60));
                sleep(work).await;

                match pool.submit_result(grant.token, outcome).await {
                    Ok(SubmitAck::Accepted { state }) => {
                        debug!(node_id = %id, task_id = %grant.task_id, ?state, "result accepted");
                    }
                    Ok(SubmitAck::AlreadyFinalized) => {
                        debug!(node_id = %id, task_id = %grant.task_id, "result arrived late");
                    }
                    Err(e) => {
                        warn!(node_id = %id, task_id = %grant.task_id, error = %e, "result rejected");
                    }
                }
            }
        }
    }
    // a crashed node drops its inbox and goes silent
    drop(inbox);
    if *stop.borrow() {
        return;
    }
    let _ = stop.changed().await;
}

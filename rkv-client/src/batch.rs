//! # Batch Dispatcher
//!
//! Purpose: Execute a list of row operations against a table by grouping them per
//! destination server, sending each group concurrently, and replaying failed
//! actions until they succeed or run out of budget.
//!
//! ## Design Principles
//! 1. **Positional Results**: Actions keep their original index through every
//!    regrouping, so `results[i]` always belongs to `actions[i]`.
//! 2. **Waves**: All units of one round run concurrently and are classified in
//!    completion order; whatever needs replaying forms the next round.
//! 3. **Per-Action Budgets, Global Stop**: Each action counts its own retries, but
//!    once any action reaches its last retry the current replay is the final one.
//! 4. **Errors Never Escape Mid-Batch**: Per-action failures are collected and
//!    surface only as one aggregate error at the end.
//!
//! ## Flow
//!
//! ```text
//! pending = all actions
//! loop:
//!   group pending by server via locate()       (unresolvable -> failed)
//!   spawn one unit per server: sleep(backoff); stub.multi(request)
//!   as units finish:
//!     whole unit failed -> update cache; replay each action (or fail)
//!     per-action error  -> update cache; replay (or fail if do-not-retry)
//!     success           -> store result; callback
//!   replay empty or retries disabled -> stop
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rkv_common::{
    IndexedAction, Location, MultiRequest, MultiResponse, RemoteError, RowOperation, ServerName,
    TableName,
};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::config::pause_time;
use crate::connection::CoreConnection;
use crate::error::{ActionResult, BatchFailure, ClientError, FailedAction, Result};
use crate::stub_pool::StubPool;
use crate::tracker::ServerErrorTracker;

/// One batched request bound for a single server.
struct Unit {
    server: ServerName,
    request: MultiRequest,
    indices: Vec<usize>,
    delay: Duration,
}

/// State of one `process_batch` call.
pub(crate) struct BatchProcess<'a, F> {
    conn: &'a CoreConnection,
    table: TableName,
    actions: Vec<RowOperation>,
    results: Vec<Option<ActionResult>>,
    // Location each action was last sent to.
    locations: Vec<Option<Arc<Location>>>,
    retries: Vec<u32>,
    cur_num_retries: u32,
    tracker: Option<ServerErrorTracker>,
    // Servers that failed at least one action in the current wave.
    wave_errors: HashSet<ServerName>,
    failures: Vec<FailedAction>,
    callback: F,
}

impl<'a, F> BatchProcess<'a, F>
where
    F: FnMut(&Bytes, &Bytes, Option<&Bytes>) + Send,
{
    pub(crate) fn new(
        conn: &'a CoreConnection,
        table: TableName,
        actions: Vec<RowOperation>,
        callback: F,
    ) -> Self {
        let len = actions.len();
        BatchProcess {
            conn,
            table,
            actions,
            results: vec![None; len],
            locations: vec![None; len],
            retries: vec![0; len],
            cur_num_retries: 0,
            tracker: None,
            wave_errors: HashSet::new(),
            failures: Vec::new(),
            callback,
        }
    }

    /// Runs the batch to completion.
    ///
    /// Returns one result per action, or `RetriesExhausted` carrying every
    /// permanent failure alongside the full result list.
    pub(crate) async fn run(mut self) -> Result<Vec<ActionResult>> {
        if self.actions.is_empty() {
            return Ok(Vec::new());
        }

        let mut pending: Vec<usize> = (0..self.actions.len()).collect();
        let mut is_retry = false;
        let mut no_retry = self.conn.config.retries < 2;

        loop {
            self.conn.metrics.record_batch_wave();
            let units = self.group(&pending, is_retry).await;

            let mut join = JoinSet::new();
            for (id, unit) in units.iter().enumerate() {
                let pool = self.conn.pool.clone();
                let server = unit.server.clone();
                let request = unit.request.clone();
                let delay = unit.delay;
                let rpc_timeout = self.conn.config.rpc_timeout;
                join.spawn(async move {
                    let outcome = send_unit(pool, server, request, delay, rpc_timeout).await;
                    (id, outcome)
                });
            }

            let mut replay = Vec::new();
            let mut last_retry = false;
            while let Some(joined) = join.join_next().await {
                let (id, outcome) = match joined {
                    Ok(done) => done,
                    Err(err) => {
                        join.abort_all();
                        return Err(ClientError::Interrupted(format!(
                            "batch unit did not complete: {}",
                            err
                        )));
                    }
                };
                let unit = &units[id];
                match outcome {
                    Ok(response) => {
                        self.classify_response(unit, response, no_retry, &mut replay, &mut last_retry)
                    }
                    Err(err) => {
                        self.classify_unit_failure(unit, err, no_retry, &mut replay, &mut last_retry)
                    }
                }
            }

            last_retry |= self.report_wave_errors();

            if no_retry || replay.is_empty() {
                break;
            }
            self.conn.metrics.record_retried(replay.len() as u64);
            debug!(
                table = %self.table,
                attempt = self.cur_num_retries,
                actions = replay.len(),
                last_retry,
                "replaying failed actions"
            );
            pending = replay;
            is_retry = true;
            if last_retry {
                no_retry = true;
            }
        }

        self.finish()
    }

    /// Resolves and groups `pending` by destination server.
    async fn group(&mut self, pending: &[usize], is_retry: bool) -> Vec<Unit> {
        let mut units: Vec<Unit> = Vec::new();
        let mut by_server: HashMap<String, usize> = HashMap::new();

        for &idx in pending {
            let row = self.actions[idx].row().clone();
            let location = match self.conn.resolver.locate(&self.table, &row, true, true).await {
                Ok(location) => location,
                Err(err) => {
                    debug!(table = %self.table, index = idx, error = %err, "cannot resolve action");
                    self.fail(idx, None, Arc::new(err));
                    continue;
                }
            };

            let key = location.server().host_port();
            let unit_idx = match by_server.get(&key) {
                Some(&unit_idx) => unit_idx,
                None => {
                    units.push(Unit {
                        server: location.server().clone(),
                        request: MultiRequest::new(self.table.clone()),
                        indices: Vec::new(),
                        delay: Duration::ZERO,
                    });
                    by_server.insert(key, units.len() - 1);
                    units.len() - 1
                }
            };
            let unit = &mut units[unit_idx];
            unit.request.add(
                location.descriptor().region_name(),
                IndexedAction {
                    index: idx,
                    operation: self.actions[idx].clone(),
                },
            );
            unit.indices.push(idx);
            self.locations[idx] = Some(location);
        }

        if is_retry {
            for unit in &mut units {
                unit.delay = self.backoff_for(&unit.server);
                trace!(
                    attempt = self.cur_num_retries,
                    server = %unit.server.host_port(),
                    delay_ms = unit.delay.as_millis() as u64,
                    actions = unit.indices.len(),
                    "scheduling retry"
                );
            }
        }
        units
    }

    fn backoff_for(&self, server: &ServerName) -> Duration {
        let pause = self.conn.config.pause;
        if self.conn.config.retries_by_server {
            match &self.tracker {
                Some(tracker) => tracker.backoff_for(server, pause),
                None => Duration::ZERO,
            }
        } else {
            pause_time(pause, self.cur_num_retries.saturating_sub(1))
        }
    }

    /// No response at all: every action of the unit is a replay candidate.
    fn classify_unit_failure(
        &mut self,
        unit: &Unit,
        err: ClientError,
        no_retry: bool,
        replay: &mut Vec<usize>,
        last_retry: &mut bool,
    ) {
        debug!(server = %unit.server.host_port(), error = %err, "batch unit failed");
        let cause = Arc::new(err);
        for &idx in &unit.indices {
            self.update_cache(idx, None);
            if no_retry {
                self.fail(idx, Some(unit.server.clone()), cause.clone());
            } else {
                *last_retry |= self.add_to_replay(replay, idx);
            }
        }
    }

    fn classify_response(
        &mut self,
        unit: &Unit,
        response: MultiResponse,
        no_retry: bool,
        replay: &mut Vec<usize>,
        last_retry: &mut bool,
    ) {
        let slots: HashMap<usize, usize> = unit
            .indices
            .iter()
            .enumerate()
            .map(|(slot, &idx)| (idx, slot))
            .collect();
        let mut answered = vec![false; unit.indices.len()];
        for region in response.regions {
            for (idx, outcome) in region.results {
                let slot = match slots.get(&idx) {
                    Some(&slot) => slot,
                    None => {
                        warn!(index = idx, server = %unit.server.host_port(), "result for an action not sent");
                        continue;
                    }
                };
                answered[slot] = true;

                match outcome {
                    Ok(value) => {
                        (self.callback)(&region.region_name, self.actions[idx].row(), value.as_ref());
                        self.results[idx] = Some(ActionResult::Success(value));
                    }
                    Err(remote) => {
                        self.update_cache(idx, Some(&remote));
                        if remote.is_do_not_retry() || no_retry {
                            self.fail(idx, Some(unit.server.clone()), Arc::new(remote.into()));
                        } else {
                            *last_retry |= self.add_to_replay(replay, idx);
                        }
                    }
                }
            }
        }

        // Actions the server did not answer are treated like empty results.
        for (slot, &idx) in unit.indices.iter().enumerate() {
            if answered[slot] {
                continue;
            }
            self.update_cache(idx, None);
            if no_retry {
                let cause = ClientError::Remote(RemoteError::Failed {
                    message: "no result returned for action".into(),
                });
                self.fail(idx, Some(unit.server.clone()), Arc::new(cause));
            } else {
                *last_retry |= self.add_to_replay(replay, idx);
            }
        }
    }

    fn update_cache(&self, idx: usize, error: Option<&RemoteError>) {
        if let Some(source) = &self.locations[idx] {
            self.conn
                .update_cached_locations(&self.table, self.actions[idx].row(), error, source);
        }
    }

    /// Queues `idx` for replay.
    ///
    /// With flat backoff, returns true when this should be the last retry. With the
    /// error tracker the failing server is noted for `report_wave_errors` and the
    /// decision is made once per wave.
    fn add_to_replay(&mut self, replay: &mut Vec<usize>, idx: usize) -> bool {
        replay.push(idx);
        self.retries[idx] += 1;
        self.cur_num_retries = self.cur_num_retries.max(self.retries[idx]);

        if self.conn.config.retries_by_server {
            if let Some(source) = &self.locations[idx] {
                self.wave_errors.insert(source.server().clone());
            }
            false
        } else {
            self.cur_num_retries + 1 >= self.conn.config.retries
        }
    }

    /// Reports each server that failed in this wave once to the tracker.
    ///
    /// Returns true when the tracker's deadline has passed, making the next wave
    /// the last one.
    fn report_wave_errors(&mut self) -> bool {
        if self.wave_errors.is_empty() {
            return false;
        }
        let budget = self.conn.config.retry_deadline_budget();
        let tracker = self
            .tracker
            .get_or_insert_with(|| ServerErrorTracker::new(budget));
        for server in self.wave_errors.drain() {
            tracker.report_error(&server);
        }
        !tracker.can_retry_more()
    }

    fn fail(&mut self, idx: usize, destination: Option<ServerName>, cause: Arc<ClientError>) {
        self.results[idx] = Some(ActionResult::Failure(cause.clone()));
        self.failures.push(FailedAction {
            index: idx,
            operation: self.actions[idx].clone(),
            destination,
            cause,
        });
    }

    fn finish(self) -> Result<Vec<ActionResult>> {
        let results: Vec<ActionResult> = self
            .results
            .into_iter()
            .map(|result| {
                result.unwrap_or_else(|| {
                    ActionResult::Failure(Arc::new(ClientError::Interrupted(
                        "no outcome recorded".into(),
                    )))
                })
            })
            .collect();

        if self.failures.is_empty() {
            return Ok(results);
        }
        self.conn.metrics.record_failed(self.failures.len() as u64);
        let mut failures = self.failures;
        failures.sort_by_key(|f| f.index);
        let failure = BatchFailure { failures, results };
        warn!(table = %self.table, "{}", failure);
        Err(ClientError::RetriesExhausted(Box::new(failure)))
    }
}

/// Sends one unit after its backoff delay.
async fn send_unit(
    pool: Arc<StubPool>,
    server: ServerName,
    request: MultiRequest,
    delay: Duration,
    rpc_timeout: Duration,
) -> Result<MultiResponse> {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let stub = pool.region_stub(&server).await?;
    match tokio::time::timeout(rpc_timeout, stub.multi(request)).await {
        Ok(response) => Ok(response?),
        Err(_) => Err(ClientError::Timeout(rpc_timeout)),
    }
}

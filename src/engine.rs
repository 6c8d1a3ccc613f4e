//! The scheduling engine: one object owning the pending-job list, the slot
//! allocator, and the process supervisor behind a single mutex.
//!
//! Two tasks share an engine: the submission listener (calls [`Engine::submit`])
//! and the scheduler loop ([`Engine::run`]). The mutex is only ever held for
//! short, non-blocking sections and never across an await point, so queue
//! index updates and slot reserve/register/release operations are all
//! serialized with respect to each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::{Result, SlotdError};
use crate::scheduler::{Job, JobList, SlotPool};
use crate::supervisor::Supervisor;

/// Receipt handed back to a client whose job was queued.
#[derive(Debug, Clone, Copy)]
pub struct JobTicket {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Point-in-time view of the engine, for the status line and status
/// requests.
#[derive(Debug, Clone, Copy)]
pub struct EngineStatus {
    pub pending: usize,
    pub free_slots: usize,
    pub total_slots: u32,
    pub running: usize,
}

struct EngineState {
    list: JobList,
    slots: SlotPool,
    supervisor: Supervisor,
}

pub struct Engine {
    state: Mutex<EngineState>,
    /// Woken on submission so a queued job does not wait out the full poll
    /// interval.
    submitted: Notify,
    poll_interval: Duration,
    drain_timeout: Duration,
    total_slots: u32,
    draining: AtomicBool,
}

impl Engine {
    pub fn new(config: &ServerConfig, supervisor: Supervisor) -> Result<Self> {
        let slots = SlotPool::new(config.slots)?;
        Ok(Self {
            state: Mutex::new(EngineState {
                list: JobList::new(),
                slots,
                supervisor,
            }),
            submitted: Notify::new(),
            poll_interval: config.poll_interval,
            drain_timeout: config.drain_timeout,
            total_slots: config.slots,
            draining: AtomicBool::new(false),
        })
    }

    fn locked(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a job and wake the scheduler. Jobs are accepted even when no
    /// slots are free (they wait in the list), but not while the server is
    /// draining.
    pub fn submit(&self, argv: Vec<String>, priority: bool, slots: u32) -> Result<JobTicket> {
        if argv.is_empty() {
            return Err(SlotdError::EmptyArgv);
        }

        let job = Job::new(argv, priority, slots);
        let ticket = JobTicket {
            id: job.id,
            created_at: job.created_at,
        };
        let program = job.program().to_string();
        {
            // The flag is read under the same lock drain() writes it under,
            // so no job can slip into a list that is about to be cleared.
            let mut st = self.locked();
            if self.draining.load(Ordering::SeqCst) {
                return Err(SlotdError::Draining);
            }
            st.list.add(job);
        }
        self.submitted.notify_one();
        tracing::info!(
            job_id = %ticket.id,
            program = %program,
            priority,
            slots = slots.max(1),
            "job queued"
        );
        Ok(ticket)
    }

    pub fn status(&self) -> EngineStatus {
        let st = self.locked();
        EngineStatus {
            pending: st.list.len(),
            free_slots: st.slots.available(),
            total_slots: self.total_slots,
            running: st.supervisor.running(),
        }
    }

    /// One scheduler cycle: reap finished children, emit the status line,
    /// then admit as many queued jobs as the free slots allow.
    pub fn tick(&self) {
        let mut st = self.locked();
        Self::reap(&mut st);
        tracing::info!(
            pending = st.list.len(),
            free_slots = st.slots.available(),
            "status"
        );
        self.admit(&mut st);
    }

    fn reap(st: &mut EngineState) {
        let EngineState {
            slots, supervisor, ..
        } = st;
        for done in supervisor.reap(slots) {
            if done.success {
                tracing::info!(
                    job_id = %done.job.id,
                    pid = done.pid,
                    program = done.job.program(),
                    released = done.released,
                    "job finished"
                );
            } else {
                tracing::warn!(
                    job_id = %done.job.id,
                    pid = done.pid,
                    program = done.job.program(),
                    exit_code = done.exit_code,
                    released = done.released,
                    "job failed"
                );
            }
        }
    }

    /// The admission pass. The head job stays in its tier until it is
    /// either started or rejected, so a job that cannot run yet holds back
    /// everything behind it (head-of-line blocking) without reordering.
    fn admit(&self, st: &mut EngineState) {
        loop {
            let Some(head) = st.list.peek() else {
                break;
            };
            let requested = head.slots;

            // A job asking for more slots than the server has could never
            // run; reject it instead of wedging the queue.
            if requested > self.total_slots {
                if let Some(job) = st.list.pop() {
                    let err = SlotdError::TooManySlots {
                        requested,
                        total: self.total_slots,
                    };
                    tracing::warn!(
                        job_id = %job.id,
                        program = job.program(),
                        error = %err,
                        "job rejected"
                    );
                }
                continue;
            }

            if (st.slots.available() as u32) < requested {
                break;
            }

            let Some(job) = st.list.pop() else {
                break;
            };
            let job_id = job.id;
            let program = job.program().to_string();
            let EngineState {
                slots, supervisor, ..
            } = st;
            match supervisor.spawn(job, slots) {
                Ok(pid) => {
                    tracing::info!(job_id = %job_id, pid, program = %program, "job started");
                }
                Err(e) => {
                    // Reservation already rolled back; the job is lost.
                    tracing::warn!(job_id = %job_id, program = %program, error = %e, "failed to start job");
                }
            }
        }
    }

    /// Run the scheduler until `shutdown` fires, then drain.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            slots = self.total_slots,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "scheduler running"
        );
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.submitted.notified() => {}
            }
            self.tick();
        }
        self.drain().await;
    }

    /// Graceful shutdown: stop admitting, keep reaping until the children
    /// are gone or the drain timeout expires, then force-kill the
    /// stragglers and collect them.
    async fn drain(&self) {
        {
            let mut st = self.locked();
            self.draining.store(true, Ordering::SeqCst);
            let pending = st.list.len();
            if pending > 0 {
                tracing::warn!(pending, "draining: dropping jobs that never started");
                st.list.clear();
            }
            tracing::info!(running = st.supervisor.running(), "draining");
        }

        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        while tokio::time::Instant::now() < deadline {
            {
                let mut st = self.locked();
                Self::reap(&mut st);
                if !st.supervisor.has_children() {
                    tracing::info!("drain complete");
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        {
            let mut st = self.locked();
            st.supervisor.kill_all();
        }
        // SIGKILL is prompt; give the kernel a moment to deliver it.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let mut st = self.locked();
            Self::reap(&mut st);
            if !st.supervisor.has_children() {
                tracing::info!("drain complete after killing stragglers");
                return;
            }
        }

        let st = self.locked();
        for (pid, job) in st.supervisor.running_jobs() {
            tracing::error!(pid, program = job.program(), "child survived shutdown");
        }
    }
}

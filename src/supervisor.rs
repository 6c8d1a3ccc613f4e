//! Spawns admitted jobs as child processes and reaps them when they exit.
//!
//! The supervisor owns the pid → child-handle table and drives the slot
//! allocator through the job lifecycle: reserve before spawn, roll back on
//! any failure, register on success, release on reap. It holds each job's
//! owned copy for as long as its child runs so that shutdown can name the
//! jobs it had to kill.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::File;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::{Child, Command};

use crate::scheduler::{Job, SlotPool};

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("not enough free slots")]
    Busy,

    #[error("slot assignment needs {needed} bytes but the limit is {max}")]
    EnvOverflow { needed: usize, max: usize },

    #[error("failed to spawn: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("child terminated before a pid could be recorded")]
    NoPid,
}

/// A terminated child, with the slots it gave back.
#[derive(Debug)]
pub struct ReapedChild {
    pub pid: u32,
    pub job: Job,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub released: usize,
}

#[derive(Debug)]
struct RunningChild {
    job: Job,
    child: Child,
}

#[derive(Debug)]
pub struct Supervisor {
    children: HashMap<u32, RunningChild>,
    env_var: String,
    max_env_len: usize,
    /// Scratch buffer for slot-assignment values, reused across spawns.
    /// Only the scheduling side ever touches it.
    env_buf: String,
    stdout: Option<File>,
    stderr: Option<File>,
}

impl Supervisor {
    pub fn new(env_var: impl Into<String>, max_env_len: usize) -> Self {
        Self {
            children: HashMap::new(),
            env_var: env_var.into(),
            max_env_len,
            env_buf: String::new(),
            stdout: None,
            stderr: None,
        }
    }

    /// Route child stdout/stderr to the given sinks. Without this,
    /// children write to the null device.
    pub fn with_output(mut self, stdout: File, stderr: File) -> Self {
        self.stdout = Some(stdout);
        self.stderr = Some(stderr);
        self
    }

    pub fn running(&self) -> usize {
        self.children.len()
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// The jobs still running, for shutdown reporting.
    pub fn running_jobs(&self) -> Vec<(u32, &Job)> {
        self.children.iter().map(|(pid, rc)| (*pid, &rc.job)).collect()
    }

    /// Reserve slots for `job` and spawn it with the slot assignment in its
    /// environment. Any failure after the reservation rolls the slots back;
    /// the job is not retried. On success the child's pid is registered
    /// with its slot set and returned.
    pub fn spawn(&mut self, job: Job, slots: &mut SlotPool) -> Result<u32, SpawnError> {
        let Some(set) = slots.reserve(job.slots) else {
            return Err(SpawnError::Busy);
        };

        if let Err(e) = self.format_env_value(&set) {
            slots.unreserve(&set);
            return Err(e);
        }

        let child = match self.spawn_child(&job) {
            Ok(child) => child,
            Err(e) => {
                slots.unreserve(&set);
                return Err(SpawnError::Spawn(e));
            }
        };

        let Some(pid) = child.id() else {
            slots.unreserve(&set);
            return Err(SpawnError::NoPid);
        };

        tracing::debug!(pid, program = job.program(), slots = ?set, "child spawned");
        slots.register(pid, set);
        self.children.insert(pid, RunningChild { job, child });
        Ok(pid)
    }

    /// Comma-join the slot ids (ascending, no trailing separator) into the
    /// scratch buffer, honoring the configured length cap.
    fn format_env_value(&mut self, set: &[u32]) -> Result<(), SpawnError> {
        self.env_buf.clear();
        for (i, id) in set.iter().enumerate() {
            if i > 0 {
                self.env_buf.push(',');
            }
            let _ = write!(self.env_buf, "{id}");
            if self.env_buf.len() > self.max_env_len {
                return Err(SpawnError::EnvOverflow {
                    needed: self.env_buf.len(),
                    max: self.max_env_len,
                });
            }
        }
        Ok(())
    }

    fn spawn_child(&self, job: &Job) -> std::io::Result<Child> {
        let stdout = match &self.stdout {
            Some(f) => Stdio::from(f.try_clone()?),
            None => Stdio::null(),
        };
        let stderr = match &self.stderr {
            Some(f) => Stdio::from(f.try_clone()?),
            None => Stdio::null(),
        };
        Command::new(&job.argv[0])
            .args(&job.argv[1..])
            .env(&self.env_var, &self.env_buf)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
    }

    /// Sweep the child table once without blocking, releasing the slots of
    /// every child that has terminated. An empty result means either no
    /// children exist or none have exited yet; `has_children` tells the two
    /// apart. Safe to call again at any time.
    pub fn reap(&mut self, slots: &mut SlotPool) -> Vec<ReapedChild> {
        let mut exited = Vec::new();
        for (pid, rc) in self.children.iter_mut() {
            match rc.child.try_wait() {
                Ok(Some(status)) => exited.push((*pid, status)),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(pid, error = %e, "failed to poll child");
                }
            }
        }

        let mut reaped = Vec::with_capacity(exited.len());
        for (pid, status) in exited {
            let Some(rc) = self.children.remove(&pid) else {
                continue;
            };
            let released = slots.release(pid).unwrap_or(0);
            reaped.push(ReapedChild {
                pid,
                job: rc.job,
                success: status.success(),
                exit_code: status.code(),
                released,
            });
        }
        reaped
    }

    /// Force-kill every remaining child, naming each lost job. The kills
    /// are asynchronous; callers keep reaping until the table empties.
    pub fn kill_all(&mut self) {
        for (pid, rc) in self.children.iter_mut() {
            match rc.child.start_kill() {
                Ok(()) => {
                    tracing::warn!(pid, program = rc.job.program(), "job killed at shutdown")
                }
                Err(e) => {
                    tracing::warn!(pid, program = rc.job.program(), error = %e, "failed to kill child")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(argv: &[&str], slots: u32) -> Job {
        Job::new(argv.iter().map(|s| s.to_string()).collect(), false, slots)
    }

    async fn wait_until_reaped(sup: &mut Supervisor, slots: &mut SlotPool) -> Vec<ReapedChild> {
        for _ in 0..100 {
            let reaped = sup.reap(slots);
            if !reaped.is_empty() {
                return reaped;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("child never exited");
    }

    #[tokio::test]
    async fn spawn_registers_and_reap_releases() {
        let mut slots = SlotPool::new(2).expect("pool");
        let mut sup = Supervisor::new("SLOTD_TEST_SLOTS", 100);

        let pid = sup
            .spawn(job(&["/bin/sleep", "0.05"], 2), &mut slots)
            .expect("spawned");
        assert!(pid > 0);
        assert_eq!(slots.available(), 0);
        assert_eq!(slots.running(), 1);
        assert!(sup.has_children());

        let reaped = wait_until_reaped(&mut sup, &mut slots).await;
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].pid, pid);
        assert!(reaped[0].success);
        assert_eq!(reaped[0].released, 2);
        assert_eq!(slots.available(), 2);
        assert!(!sup.has_children());
    }

    #[tokio::test]
    async fn failed_spawn_rolls_back_reservation() {
        let mut slots = SlotPool::new(2).expect("pool");
        let mut sup = Supervisor::new("SLOTD_TEST_SLOTS", 100);

        let err = sup
            .spawn(job(&["/no/such/binary"], 1), &mut slots)
            .expect_err("spawn must fail");
        assert!(matches!(err, SpawnError::Spawn(_)));
        assert_eq!(slots.available(), 2);
        assert!(!sup.has_children());
    }

    #[tokio::test]
    async fn env_overflow_rolls_back_reservation() {
        let mut slots = SlotPool::new(4).expect("pool");
        // "0,1,2,3" needs 7 bytes.
        let mut sup = Supervisor::new("SLOTD_TEST_SLOTS", 3);

        let err = sup
            .spawn(job(&["/bin/true"], 4), &mut slots)
            .expect_err("value over the cap");
        assert!(matches!(err, SpawnError::EnvOverflow { .. }));
        assert_eq!(slots.available(), 4);
    }

    #[tokio::test]
    async fn busy_when_reserve_cannot_be_satisfied() {
        let mut slots = SlotPool::new(1).expect("pool");
        let mut sup = Supervisor::new("SLOTD_TEST_SLOTS", 100);

        let _pid = sup
            .spawn(job(&["/bin/sleep", "0.2"], 1), &mut slots)
            .expect("spawned");
        let err = sup
            .spawn(job(&["/bin/true"], 1), &mut slots)
            .expect_err("no slots left");
        assert!(matches!(err, SpawnError::Busy));

        wait_until_reaped(&mut sup, &mut slots).await;
    }

    #[tokio::test]
    async fn child_sees_its_slot_assignment() {
        let mut slots = SlotPool::new(3).expect("pool");
        let mut sup = Supervisor::new("SLOTD_TEST_SLOTS", 100);

        // Exits 0 only if the variable holds the two lowest slot ids.
        let check = job(
            &["/bin/sh", "-c", "test \"$SLOTD_TEST_SLOTS\" = 0,1"],
            2,
        );
        sup.spawn(check, &mut slots).expect("spawned");
        let reaped = wait_until_reaped(&mut sup, &mut slots).await;
        assert!(reaped[0].success, "child saw {:?}", reaped[0].exit_code);
    }

    #[test]
    fn env_value_is_comma_joined_ascending() {
        let mut sup = Supervisor::new("X", 100);
        sup.format_env_value(&[0, 3, 7]).expect("formats");
        assert_eq!(sup.env_buf, "0,3,7");
        sup.format_env_value(&[5]).expect("formats");
        assert_eq!(sup.env_buf, "5");
    }
}

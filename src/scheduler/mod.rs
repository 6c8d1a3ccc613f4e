//! Scheduling containers: the job type, the circular queue it lives in,
//! the two-tier pending list, and the slot allocator.

pub mod job;
pub mod list;
pub mod ring;
pub mod slots;

pub use job::Job;
pub use list::JobList;
pub use ring::Ring;
pub use slots::SlotPool;

//! Admission and response routing for outbound packages of a connection.
//!
//! Every connection has a [`job_pool::JobPool`]. Senders admit packages into the pool through the
//!  [`job_manager::JobManager`], which enforces a limit on the number of packages in flight
//!  (backpressure) and keeps admitted packages in a FIFO queue. The transport drains that queue
//!  in order, one package at a time.
//!
//! Each admitted package has a [`send_job::SendJob`], and admission hands the sender a handle to
//!  it. Callers block on the job - first until the
//!  package was sent, then until a response arrived. Responses are matched to their job by the
//!  correlation id of the request they answer.
//!
//! ```ascii
//! sender ──admit──> [ active queue: S1 -> S2 -> S3 ] ──peek/retire──> transport
//!    │                                                                    │
//!    └──wait_for_send / wait_for_response <── wake ── route_response <────┘
//! ```
//!
//! Slots and their jobs are reused across admissions. A slot is only reused when it is not in the
//!  queue any more and nobody holds a [`send_job::SendJobHandle`] to its job.

pub mod config;
pub mod correlation_id;
pub mod job_manager;
pub mod job_pool;
pub mod outcome;
pub mod package;
pub mod send_job;

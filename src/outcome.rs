use crate::correlation_id::SenderId;
use crate::package::Package;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum SendOutcome {
    Pending,
    /// out-of-band wakeup, never stored as the job's send outcome
    UrgentlyWoken,
    Success,
    Fail,
    Timeout,
    SendQueueIsFull,
}

impl SendOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SendOutcome::Pending | SendOutcome::UrgentlyWoken)
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ResponseOutcome {
    NoResponse,
    /// out-of-band wakeup, never stored as the job's response outcome
    UrgentlyWoken,
    Success,
    Fail,
    Timeout,
}

impl ResponseOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResponseOutcome::NoResponse | ResponseOutcome::UrgentlyWoken)
    }
}

/// Everything that arrived for a job since the response was last taken. Several response packages
///  can accumulate before a consumer gets to take them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub outcome: ResponseOutcome,
    pub sender: Option<SenderId>,
    pub packages: Vec<Package>,
}

impl Default for Response {
    fn default() -> Self {
        Response {
            outcome: ResponseOutcome::NoResponse,
            sender: None,
            packages: Vec::new(),
        }
    }
}

/// Result of a blocking wait on a job
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum WaitStatus {
    /// an outcome is available, or a regular wake call released the waiter
    Woken,
    /// released by an urgent wake; the urgent signal was consumed by this wait
    UrgentlyWoken,
    TimedOut,
}

impl WaitStatus {
    pub fn is_timed_out(&self) -> bool {
        *self == WaitStatus::TimedOut
    }
}

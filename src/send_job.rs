use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, trace};
use crate::correlation_id::{CorrelationId, SenderId};
use crate::outcome::{Response, ResponseOutcome, SendOutcome, WaitStatus};
use crate::package::Package;

struct SendJobState {
    send_outcome: SendOutcome,
    response: Response,
    correlation_id: CorrelationId,

    is_send_urgently_woken: bool,
    is_response_urgently_woken: bool,

    send_waiters: u32,
    response_waiters: u32,

    /// incremented by every wake call, so a waiter can tell a real wakeup from a spurious one
    send_epoch: u64,
    response_epoch: u64,
}

impl Default for SendJobState {
    fn default() -> Self {
        SendJobState {
            send_outcome: SendOutcome::Pending,
            response: Response::default(),
            correlation_id: CorrelationId::NULL,
            is_send_urgently_woken: false,
            is_response_urgently_woken: false,
            send_waiters: 0,
            response_waiters: 0,
            send_epoch: 0,
            response_epoch: 0,
        }
    }
}

/// The lifecycle of a single outbound request as seen by the threads that wait for it: first
///  until it was sent, then until a response arrived for it.
///
/// Send side and response side are independent of each other. Each side is either still pending,
///  resolved with a terminal outcome, or was 'urgently woken'. An urgent wake is an out-of-band
///  signal that releases waiters without producing an outcome. It is remembered if nobody is
///  waiting, and it is consumed by the first wait call that observes it.
///
/// A `SendJob` is owned by its pool slot and reused across admissions (see [`SendJob::reinit`]).
///  Callers get access through a [`SendJobHandle`].
pub struct SendJob {
    state: Mutex<SendJobState>,
    send_cond: Condvar,
    response_cond: Condvar,
}

impl Default for SendJob {
    fn default() -> Self {
        Self::new()
    }
}

impl SendJob {
    pub fn new() -> SendJob {
        SendJob {
            state: Mutex::new(SendJobState::default()),
            send_cond: Condvar::new(),
            response_cond: Condvar::new(),
        }
    }

    /// Prepares the job for its next admission: outcomes are reset, the response is discarded
    ///  and the correlation id is cleared.
    ///
    /// Panics if there are threads waiting on the job - a job can only be reused when nobody
    ///  holds a handle to it.
    pub fn reinit(&self) {
        let mut state = self.state.lock().unwrap();

        if state.send_waiters != 0 || state.response_waiters != 0 {
            error!("reinitializing send job {:?} with {} send waiters and {} response waiters", state.correlation_id, state.send_waiters, state.response_waiters);
            panic!("send job must not be reinitialized while there are waiters");
        }

        state.send_outcome = SendOutcome::Pending;
        state.response = Response::default();
        state.correlation_id = CorrelationId::NULL;
    }

    pub fn register_correlation_id(&self, correlation_id: CorrelationId) {
        self.state.lock().unwrap().correlation_id = correlation_id;
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.state.lock().unwrap().correlation_id
    }

    /// A null id is never matched, so a job that did not register an id can not pick up
    ///  someone else's response by accident
    pub fn is_responsible_for(&self, correlation_id: CorrelationId) -> bool {
        let own = self.state.lock().unwrap().correlation_id;
        !own.is_null() && !correlation_id.is_null() && own == correlation_id
    }

    /// Blocks until the send side of this job is resolved or woken, or until the timeout elapses.
    ///  `None` waits indefinitely.
    pub fn wait_for_send(&self, timeout: Option<Duration>) -> WaitStatus {
        let mut state = self.state.lock().unwrap();

        if state.is_send_urgently_woken {
            state.is_send_urgently_woken = false;
            return WaitStatus::UrgentlyWoken;
        }
        if state.send_outcome != SendOutcome::Pending {
            return WaitStatus::Woken;
        }

        state.send_waiters += 1;
        let epoch = state.send_epoch;
        let (mut state, timed_out) = Self::wait_while(&self.send_cond, state, timeout, |s| s.send_epoch == epoch);
        state.send_waiters -= 1;

        if state.is_send_urgently_woken {
            state.is_send_urgently_woken = false;
            return WaitStatus::UrgentlyWoken;
        }
        if timed_out {
            WaitStatus::TimedOut
        }
        else {
            WaitStatus::Woken
        }
    }

    /// Same as [`SendJob::wait_for_send`] for the response side
    pub fn wait_for_response(&self, timeout: Option<Duration>) -> WaitStatus {
        let mut state = self.state.lock().unwrap();

        if state.is_response_urgently_woken {
            state.is_response_urgently_woken = false;
            return WaitStatus::UrgentlyWoken;
        }
        if state.response.outcome != ResponseOutcome::NoResponse {
            return WaitStatus::Woken;
        }

        state.response_waiters += 1;
        let epoch = state.response_epoch;
        let (mut state, timed_out) = Self::wait_while(&self.response_cond, state, timeout, |s| s.response_epoch == epoch);
        state.response_waiters -= 1;

        if state.is_response_urgently_woken {
            state.is_response_urgently_woken = false;
            return WaitStatus::UrgentlyWoken;
        }
        if timed_out {
            WaitStatus::TimedOut
        }
        else {
            WaitStatus::Woken
        }
    }

    fn wait_while<'a>(
        cond: &Condvar,
        guard: MutexGuard<'a, SendJobState>,
        timeout: Option<Duration>,
        still_waiting: impl FnMut(&mut SendJobState) -> bool,
    ) -> (MutexGuard<'a, SendJobState>, bool) {
        match timeout {
            None => (cond.wait_while(guard, still_waiting).unwrap(), false),
            Some(timeout) => {
                let (guard, result) = cond.wait_timeout_while(guard, timeout, still_waiting).unwrap();
                (guard, result.timed_out())
            }
        }
    }

    /// Releases all threads blocked in [`SendJob::wait_for_send`]. `UrgentlyWoken` only sets the
    ///  urgent flag, any other outcome becomes the job's send outcome.
    pub fn wake_send_waitings(&self, outcome: SendOutcome) {
        if outcome == SendOutcome::Pending {
            error!("attempting to wake send waiters with outcome {:?}", outcome);
            panic!("send waiters can not be woken with a pending outcome");
        }

        let mut state = self.state.lock().unwrap();
        trace!("waking {} send waiters of job {:?} with {:?}", state.send_waiters, state.correlation_id, outcome);

        if outcome == SendOutcome::UrgentlyWoken {
            state.is_send_urgently_woken = true;
        }
        else {
            state.send_outcome = outcome;
        }
        state.send_epoch = state.send_epoch.wrapping_add(1);
        self.send_cond.notify_all();
    }

    /// Wakes the send waiters with `Fail` unless an outcome was stored already. Returns whether
    ///  the job was failed.
    pub fn fail_send_if_pending(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.send_outcome != SendOutcome::Pending {
            return false;
        }

        trace!("failing {} send waiters of job {:?}", state.send_waiters, state.correlation_id);
        state.send_outcome = SendOutcome::Fail;
        state.send_epoch = state.send_epoch.wrapping_add(1);
        self.send_cond.notify_all();
        true
    }

    /// Releases all threads blocked in [`SendJob::wait_for_response`]. A terminal outcome is
    ///  stored together with the sender, and the package (if any) is appended to the packages
    ///  received so far.
    pub fn wake_response_waitings(&self, outcome: ResponseOutcome, sender: Option<SenderId>, package: Option<Package>) {
        if outcome == ResponseOutcome::NoResponse {
            error!("attempting to wake response waiters with outcome {:?}", outcome);
            panic!("response waiters can not be woken without a response outcome");
        }

        let mut state = self.state.lock().unwrap();
        trace!("waking {} response waiters of job {:?} with {:?}", state.response_waiters, state.correlation_id, outcome);

        if outcome == ResponseOutcome::UrgentlyWoken {
            state.is_response_urgently_woken = true;
        }
        else {
            state.response.outcome = outcome;
            state.response.sender = sender;
            if let Some(package) = package {
                state.response.packages.push(package);
            }
        }
        state.response_epoch = state.response_epoch.wrapping_add(1);
        self.response_cond.notify_all();
    }

    pub fn send_outcome(&self) -> SendOutcome {
        self.state.lock().unwrap().send_outcome
    }

    /// Returns everything received so far and starts over with 'no response'. Waiter counts and
    ///  the urgent flag are left alone, so a polling consumer can drain a job repeatedly.
    pub fn take_response(&self) -> Response {
        let mut state = self.state.lock().unwrap();
        let outcome = state.response.outcome;
        state.response.outcome = ResponseOutcome::NoResponse;

        Response {
            outcome,
            sender: state.response.sender,
            packages: std::mem::take(&mut state.response.packages),
        }
    }

    pub fn clear_response(&self) {
        let mut state = self.state.lock().unwrap();
        state.response.packages.clear();
        state.response.outcome = ResponseOutcome::NoResponse;
    }

    pub fn send_waiters_woken(&self) -> bool {
        self.state.lock().unwrap().send_outcome != SendOutcome::Pending
    }

    pub fn response_waiters_woken(&self) -> bool {
        self.state.lock().unwrap().response.outcome != ResponseOutcome::NoResponse
    }

    pub fn send_waiter_count(&self) -> u32 {
        self.state.lock().unwrap().send_waiters
    }

    pub fn response_waiter_count(&self) -> u32 {
        self.state.lock().unwrap().response_waiters
    }
}

/// A caller's share of a [`SendJob`]. The job's slot is not reused while any handle exists.
#[derive(Clone)]
pub struct SendJobHandle(Arc<SendJob>);

impl SendJobHandle {
    pub(crate) fn new(job: &Arc<SendJob>) -> SendJobHandle {
        SendJobHandle(job.clone())
    }

    pub fn ptr_eq(&self, other: &SendJobHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for SendJobHandle {
    type Target = SendJob;

    fn deref(&self) -> &SendJob {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;
    use bytes::Bytes;
    use rstest::rstest;
    use crate::package::PackageHeader;
    use super::*;

    fn spin_until(f: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !f() {
            assert!(Instant::now() < deadline, "condition was not reached in time");
            thread::yield_now();
        }
    }

    fn response_package(payload: &'static [u8]) -> Package {
        Package::new(PackageHeader::response_to(&PackageHeader::request()), Bytes::from_static(payload))
    }

    #[test]
    fn test_initial_state() {
        let job = SendJob::new();
        assert_eq!(job.send_outcome(), SendOutcome::Pending);
        assert_eq!(job.take_response(), Response::default());
        assert!(job.correlation_id().is_null());
        assert!(!job.send_waiters_woken());
        assert!(!job.response_waiters_woken());
        assert_eq!(job.send_waiter_count(), 0);
        assert_eq!(job.response_waiter_count(), 0);
    }

    #[rstest]
    #[case::both_null(None, None, false)]
    #[case::own_null(None, Some(1), false)]
    #[case::other_null(Some(1), None, false)]
    #[case::different(Some(1), Some(2), false)]
    #[case::equal(Some(1), Some(1), true)]
    fn test_is_responsible_for(#[case] own: Option<u128>, #[case] other: Option<u128>, #[case] expected: bool) {
        let to_id = |raw: Option<u128>| raw
            .map(|r| CorrelationId::from_uuid(uuid::Uuid::from_u128(r)))
            .unwrap_or(CorrelationId::NULL);

        let job = SendJob::new();
        job.register_correlation_id(to_id(own));
        assert_eq!(job.is_responsible_for(to_id(other)), expected);
    }

    #[test]
    fn test_wait_for_send_returns_immediately_when_resolved() {
        let job = SendJob::new();
        job.wake_send_waitings(SendOutcome::Success);

        assert_eq!(job.wait_for_send(Some(Duration::ZERO)), WaitStatus::Woken);
        assert_eq!(job.wait_for_send(None), WaitStatus::Woken);
        assert_eq!(job.send_outcome(), SendOutcome::Success);
    }

    #[test]
    fn test_wait_for_send_timeout() {
        let job = SendJob::new();
        assert_eq!(job.wait_for_send(Some(Duration::from_millis(10))), WaitStatus::TimedOut);
        assert_eq!(job.send_outcome(), SendOutcome::Pending);
        assert_eq!(job.send_waiter_count(), 0);
    }

    #[test]
    fn test_wait_for_send_woken() {
        let job = Arc::new(SendJob::new());

        let waiter = {
            let job = job.clone();
            thread::spawn(move || job.wait_for_send(None))
        };
        spin_until(|| job.send_waiter_count() == 1);

        job.wake_send_waitings(SendOutcome::Fail);

        assert_eq!(waiter.join().unwrap(), WaitStatus::Woken);
        assert_eq!(job.send_outcome(), SendOutcome::Fail);
        assert_eq!(job.send_waiter_count(), 0);
    }

    #[test]
    fn test_wake_releases_all_send_waiters() {
        let job = Arc::new(SendJob::new());

        let waiters = (0..4)
            .map(|_| {
                let job = job.clone();
                thread::spawn(move || job.wait_for_send(Some(Duration::from_secs(10))))
            })
            .collect::<Vec<_>>();
        spin_until(|| job.send_waiter_count() == 4);

        job.wake_send_waitings(SendOutcome::Success);

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), WaitStatus::Woken);
        }
    }

    #[test]
    fn test_urgent_send_wake_without_waiters_is_remembered_once() {
        let job = SendJob::new();
        job.wake_send_waitings(SendOutcome::UrgentlyWoken);

        assert_eq!(job.send_outcome(), SendOutcome::Pending);
        assert_eq!(job.wait_for_send(None), WaitStatus::UrgentlyWoken);
        assert_eq!(job.wait_for_send(Some(Duration::from_millis(10))), WaitStatus::TimedOut);
    }

    #[test]
    fn test_urgent_send_wake_releases_waiter() {
        let job = Arc::new(SendJob::new());

        let waiter = {
            let job = job.clone();
            thread::spawn(move || job.wait_for_send(None))
        };
        spin_until(|| job.send_waiter_count() == 1);

        job.wake_send_waitings(SendOutcome::UrgentlyWoken);

        assert_eq!(waiter.join().unwrap(), WaitStatus::UrgentlyWoken);
        assert_eq!(job.send_outcome(), SendOutcome::Pending);
        assert!(!job.send_waiters_woken());

        // the flag was consumed by the waiter
        assert_eq!(job.wait_for_send(Some(Duration::from_millis(10))), WaitStatus::TimedOut);
    }

    #[test]
    fn test_urgent_response_wake_without_waiters_is_remembered_once() {
        let job = SendJob::new();
        job.wake_response_waitings(ResponseOutcome::UrgentlyWoken, None, None);

        assert!(!job.response_waiters_woken());
        assert_eq!(job.wait_for_response(None), WaitStatus::UrgentlyWoken);
        assert_eq!(job.wait_for_response(Some(Duration::from_millis(10))), WaitStatus::TimedOut);
    }

    #[test]
    fn test_wait_for_response_woken() {
        let job = Arc::new(SendJob::new());
        let sender = SenderId::random();

        let waiter = {
            let job = job.clone();
            thread::spawn(move || {
                let status = job.wait_for_response(None);
                (status, job.take_response())
            })
        };
        spin_until(|| job.response_waiter_count() == 1);

        job.wake_response_waitings(ResponseOutcome::Success, Some(sender), Some(response_package(b"pong")));

        let (status, response) = waiter.join().unwrap();
        assert_eq!(status, WaitStatus::Woken);
        assert_eq!(response.outcome, ResponseOutcome::Success);
        assert_eq!(response.sender, Some(sender));
        assert_eq!(response.packages.len(), 1);
        assert_eq!(response.packages[0].payload, Bytes::from_static(b"pong"));
    }

    #[test]
    fn test_responses_accumulate_until_taken() {
        let job = SendJob::new();
        job.wake_response_waitings(ResponseOutcome::Success, None, Some(response_package(b"a")));
        job.wake_response_waitings(ResponseOutcome::Success, None, Some(response_package(b"b")));

        let response = job.take_response();
        assert_eq!(response.outcome, ResponseOutcome::Success);
        assert_eq!(response.packages.iter().map(|p| p.payload.clone()).collect::<Vec<_>>(), vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);

        assert!(!job.response_waiters_woken());
        assert!(job.take_response().packages.is_empty());

        job.wake_response_waitings(ResponseOutcome::Success, None, Some(response_package(b"c")));
        assert_eq!(job.take_response().packages.len(), 1);
    }

    #[test]
    fn test_clear_response() {
        let job = SendJob::new();
        job.wake_response_waitings(ResponseOutcome::Fail, None, Some(response_package(b"a")));
        assert!(job.response_waiters_woken());

        job.clear_response();
        assert!(!job.response_waiters_woken());
        assert!(job.take_response().packages.is_empty());
    }

    #[test]
    fn test_take_response_keeps_urgent_flag() {
        let job = SendJob::new();
        job.wake_response_waitings(ResponseOutcome::UrgentlyWoken, None, None);
        let _ = job.take_response();

        assert_eq!(job.wait_for_response(Some(Duration::ZERO)), WaitStatus::UrgentlyWoken);
    }

    #[test]
    fn test_reinit() {
        let job = SendJob::new();
        job.register_correlation_id(CorrelationId::random());
        job.wake_send_waitings(SendOutcome::Success);
        job.wake_response_waitings(ResponseOutcome::Success, Some(SenderId::random()), Some(response_package(b"x")));

        job.reinit();

        assert_eq!(job.send_outcome(), SendOutcome::Pending);
        assert!(job.correlation_id().is_null());
        assert_eq!(job.take_response(), Response::default());
    }

    #[test]
    #[should_panic]
    fn test_reinit_with_waiters_panics() {
        let job = Arc::new(SendJob::new());
        {
            let job = job.clone();
            thread::spawn(move || job.wait_for_send(Some(Duration::from_secs(1))));
        }
        spin_until(|| job.send_waiter_count() == 1);

        job.reinit();
    }

    #[test]
    fn test_fail_send_if_pending() {
        let job = Arc::new(SendJob::new());
        let waiter = {
            let job = job.clone();
            thread::spawn(move || (job.wait_for_send(None), job.send_outcome()))
        };
        spin_until(|| job.send_waiter_count() == 1);

        assert!(job.fail_send_if_pending());
        assert_eq!(waiter.join().unwrap(), (WaitStatus::Woken, SendOutcome::Fail));
        assert!(!job.fail_send_if_pending());
    }

    #[test]
    fn test_fail_send_keeps_stored_outcome() {
        let job = SendJob::new();
        job.wake_send_waitings(SendOutcome::Success);

        assert!(!job.fail_send_if_pending());
        assert_eq!(job.send_outcome(), SendOutcome::Success);
    }

    #[test]
    fn test_fail_send_ignores_urgent_flag() {
        let job = SendJob::new();
        job.wake_send_waitings(SendOutcome::UrgentlyWoken);

        assert!(job.fail_send_if_pending());
        assert_eq!(job.send_outcome(), SendOutcome::Fail);
    }

    #[test]
    #[should_panic]
    fn test_wake_send_with_pending_panics() {
        SendJob::new().wake_send_waitings(SendOutcome::Pending);
    }

    #[test]
    #[should_panic]
    fn test_wake_response_with_no_response_panics() {
        SendJob::new().wake_response_waitings(ResponseOutcome::NoResponse, None, None);
    }

    #[test]
    fn test_handle_ptr_eq() {
        let job = Arc::new(SendJob::new());
        let a = SendJobHandle::new(&job);
        let b = a.clone();
        let other = SendJobHandle::new(&Arc::new(SendJob::new()));

        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&other));
        assert_eq!(Arc::strong_count(&job), 3);
    }
}

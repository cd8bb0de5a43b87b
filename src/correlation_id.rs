use std::fmt::{Debug, Formatter};
use uuid::Uuid;

/// Identifies a request so that a response can be routed back to the job that sent it. A
///  response package carries its request's id as `parent_correlation_id`.
///
/// NB: The null id never matches anything, not even itself - see
///      [`crate::send_job::SendJob::is_responsible_for`]
#[derive(Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct CorrelationId(Uuid);

impl Debug for CorrelationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "[null]")
        }
        else {
            write!(f, "[{}]", self.0)
        }
    }
}

impl CorrelationId {
    pub const NULL: CorrelationId = CorrelationId(Uuid::nil());

    pub fn random() -> CorrelationId {
        CorrelationId(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> CorrelationId {
        CorrelationId(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0.is_nil()
    }
}

/// The connection a response package was received on
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Default)]
pub struct SenderId(Uuid);

impl SenderId {
    pub fn random() -> SenderId {
        SenderId(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> SenderId {
        SenderId(uuid)
    }

    pub fn is_null(&self) -> bool {
        self.0.is_nil()
    }
}

use bytes::Bytes;
use crate::correlation_id::CorrelationId;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum PackageKind {
    Request,
    Response,
    HeartBeat,
}

/// The part of a package that a job keeps around for routing. This is a plain value, copied into
///  the job's slot on admission.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct PackageHeader {
    pub kind: PackageKind,
    pub correlation_id: CorrelationId,
    /// For a response: the correlation id of the request it answers. Null otherwise.
    pub parent_correlation_id: CorrelationId,
}

impl PackageHeader {
    pub fn request() -> PackageHeader {
        PackageHeader {
            kind: PackageKind::Request,
            correlation_id: CorrelationId::random(),
            parent_correlation_id: CorrelationId::NULL,
        }
    }

    pub fn response_to(request: &PackageHeader) -> PackageHeader {
        PackageHeader {
            kind: PackageKind::Response,
            correlation_id: CorrelationId::random(),
            parent_correlation_id: request.correlation_id,
        }
    }
}

/// A package as handed to the job manager. The payload is opaque, and cloning is cheap.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Package {
    pub header: PackageHeader,
    pub payload: Bytes,
}

impl Package {
    pub fn new(header: PackageHeader, payload: impl Into<Bytes>) -> Package {
        Package {
            header,
            payload: payload.into(),
        }
    }

    /// The fixed keepalive package that is sent outside of regular admission
    pub fn heartbeat() -> Package {
        Package {
            header: PackageHeader {
                kind: PackageKind::HeartBeat,
                correlation_id: CorrelationId::random(),
                parent_correlation_id: CorrelationId::NULL,
            },
            payload: Bytes::new(),
        }
    }
}

//! Messages delivered to the engine event loop
//!
//! Every input stream reports through this one inbox; the event loop is the
//! single point where tracking state is mutated.

use homeward_common::model::{Position, ReferenceLocation, RouteSolution};

use crate::error::{FetchError, RouteError};

/// Bounded inbox size; producers wait when it is full
pub const INBOX_CAPACITY: usize = 64;

#[derive(Debug)]
pub enum EngineMessage {
    PositionReceived(Position),
    PositionFailed(FetchError),
    /// `None` means no reference configured
    ReferenceResolved(Option<ReferenceLocation>),
    ReferenceFailed(FetchError),
    RouteCompleted {
        request_id: u64,
        result: Result<RouteSolution, RouteError>,
    },
    RetryRouteNow,
}

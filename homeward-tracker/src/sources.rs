//! Capabilities the engine consumes
//!
//! Each data source is a trait so the engine never depends on a concrete
//! protocol. HTTP implementations live in [`crate::clients`]; tests use
//! scripted fakes.

use async_trait::async_trait;
use homeward_common::model::{
    Position, PositionFix, ReferenceFix, ReferenceLocation, RouteSolution, SubjectId,
};
use std::sync::Arc;

use crate::error::{FetchError, RouteError};

/// Live position of the subject
#[async_trait]
pub trait PositionSource: Send + Sync {
    async fn fetch_position(&self, subject: &SubjectId) -> Result<PositionFix, FetchError>;
}

/// Fixed reference location of the subject
#[async_trait]
pub trait ReferenceSource: Send + Sync {
    /// `Ok(None)` means no reference is configured for the subject
    async fn fetch_reference(&self, subject: &SubjectId)
        -> Result<Option<ReferenceFix>, FetchError>;
}

/// Route computation between the subject and the reference
#[async_trait]
pub trait RouteProvider: Send + Sync {
    async fn compute_route(
        &self,
        from: &Position,
        to: &ReferenceLocation,
    ) -> Result<RouteSolution, RouteError>;
}

/// The three capabilities an engine is wired to
#[derive(Clone)]
pub struct Sources {
    pub position: Arc<dyn PositionSource>,
    pub reference: Arc<dyn ReferenceSource>,
    pub routes: Arc<dyn RouteProvider>,
}

impl Sources {
    pub fn new(
        position: Arc<dyn PositionSource>,
        reference: Arc<dyn ReferenceSource>,
        routes: Arc<dyn RouteProvider>,
    ) -> Self {
        Self {
            position,
            reference,
            routes,
        }
    }
}

//! Request pipelines.
//!
//! [`RequestWrapper`] protects outbound calls; [`BoundaryWrapper`] protects
//! inbound handlers.

mod boundary;
mod outbound;

pub use boundary::{
    BoundaryOptions, BoundaryRequest, BoundaryResponse, BoundaryWrapper, FEATURE_DISABLED_MESSAGE,
    MAINTENANCE_MESSAGE, TEMPORARY_ISSUE_MESSAGE,
};
pub use outbound::{RequestOptions, RequestWrapper, TokenProvider};

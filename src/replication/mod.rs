// ABOUTME: Replication utilities module
// ABOUTME: Plans the publication changes that mirror realtime setup onto a target project

pub mod publication;

pub use publication::{plan_publications, PublicationChange};

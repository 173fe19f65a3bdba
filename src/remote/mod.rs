// ABOUTME: Collaborator seams the orchestrator calls into, with concrete implementations
// ABOUTME: Project management API over HTTP, schema inspection and row transfer over PostgreSQL

pub mod client;
pub mod inspector;
pub mod models;
mod postgres;
pub mod transfer;

pub use client::{HttpProjectClient, ProjectManagementClient};
pub use inspector::{PostgresInspector, SchemaInspector};
pub use models::{
    Bucket, ConnectionInfo, CreateProjectRequest, EdgeFunction, EdgeFunctionSummary,
    ProjectConfig, ProjectHandle, ProjectInfo, ProjectStatus, StorageObject,
};
pub use transfer::{BatchRequest, DataTransfer, PostgresTransfer};

//! gymflow - automation core for multi-tenant gym & fitness CRM platforms
//!
//! gymflow is the service slice that sits between a CRM's web tier and its
//! tenant database: it receives signed webhooks, rate-limits and caches API
//! traffic, and executes declarative workflow actions against tenant data.
//!
//! ## Components
//!
//! - **Actions**: declarative side-effecting operations (`update_lead`,
//!   `create_task`, `update_opportunity`) with `{{path}}` template
//!   interpolation, executed behind a never-throws result boundary
//! - **Cache**: read-through decorator over Redis or an in-memory backend;
//!   a broken cache degrades to direct fetches, never to failures
//! - **Rate limiting**: tenant/tier-aware admission with `X-RateLimit-*`
//!   response shaping, failing open when accounting breaks
//! - **Webhooks**: constant-time HMAC signature verification plus in-memory
//!   replay and flood guards
//!
//! ## Example
//!
//! ```no_run
//! use gymflow::actions::{ActionConfig, ActionRegistry, ExecutionContext};
//! use gymflow::storage::SqliteStorage;
//! use serde_json::json;
//!
//! # async fn run() -> gymflow::Result<()> {
//! let storage = SqliteStorage::open_in_memory()?;
//! let registry = ActionRegistry::new(storage);
//!
//! let config = ActionConfig {
//!     action_type: "create_task".to_string(),
//!     parameters: json!({"title": "Call {{lead.name}}", "assignedTo": "user-42"}),
//! };
//! let ctx = ExecutionContext::new(
//!     "org-1",
//!     "wf-1",
//!     "exec-1",
//!     json!({"lead": {"name": "Ada"}}),
//! );
//!
//! let result = registry.execute(&config, &ctx).await;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

pub mod actions;
pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod ratelimit;
pub mod storage;
pub mod webhooks;

pub use error::{Error, Result};

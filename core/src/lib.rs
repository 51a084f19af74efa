//! LDAP gateway core
//!
//! Terminates LDAP bind and search operations and answers them from
//! pluggable identity providers:
//! - `engine`: listener, session loop, bind/search lifecycle
//! - `filter` / `classify`: filter AST and request intent classification
//! - `entry`: projection of backend records into protocol entries
//! - `stepup`: out-of-band approval raced against a deadline

pub mod classify;
pub mod engine;
pub mod entry;
pub mod error;
pub mod events;
pub mod filter;
pub mod metrics;
pub mod model;
pub mod provider;
pub mod stepup;
pub mod tls;

// Re-export commonly used types
pub use classify::{classify, classify_filter, RequestIntent};
pub use engine::{EngineConfig, GatewayEngine};
pub use entry::{project_group, project_user, stable_id, AttributeValue, ProtocolEntry};
pub use error::{GatewayError, ProviderError};
pub use events::GatewayEvent;
pub use filter::Filter;
pub use metrics::Metrics;
pub use model::{BindContext, Credential, GroupRecord, UserRecord};
pub use provider::{AuthProvider, DirectoryProvider};
pub use stepup::{ApprovalDecision, ApprovalTransport, StepUpError, StepUpNotifier, StepUpOutcome};
pub use tls::TlsMaterial;

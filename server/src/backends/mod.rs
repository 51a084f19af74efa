//! Built-in provider backends

pub mod database;
pub mod proxmox;
pub mod upstream;

pub use database::{DatabaseAuth, DatabaseDirectory};
pub use proxmox::{ProxmoxAuth, ProxmoxDirectory, ReloadSettings};
pub use upstream::{LdapAuthProvider, UpstreamLdapPool, UpstreamServer};

//! Optimistic in-memory state over the resource client.

mod permissions;
mod store;

pub use permissions::{Actor, Decision, Permissions, Role, RolePermissions};
pub use store::{ResourceStore, StoreStatus, PROVISIONAL_PREFIX};

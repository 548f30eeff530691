//! Conflict resolution for state PDUs.
mod branches;
mod key_lock;
mod resolver;

pub use resolver::StateAncestorFetcher;
pub use resolver::StateResolutionError;
pub use resolver::StateResolver;

pub(crate) use resolver::LocalAncestorsOnly;

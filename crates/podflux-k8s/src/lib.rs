//! Kubernetes client resolution and label selectors for podflux
//!
//! This crate resolves an authenticated cluster client (in-cluster first,
//! kubeconfig fallback) and evaluates label selectors client-side.

mod client;
mod selector;

pub use client::ClientProvider;
pub use selector::{Selector, SelectorParseError};

//! Integration tests for certward
//!
//! These tests require a Kubernetes cluster (kind) to run and tell the story
//! of how cluster operators secure a privileged TLS server with certward.
//!
//! # Test Organization
//!
//! - `pki_store`: Stories about generating a CA, issuing signed certificates
//!   and reading their provenance back from secrets
//!
//! - `access_grant`: Stories about granting, configuring and revoking client
//!   access for users, groups and service accounts
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored
//! ```

mod access_grant;
mod helpers;
mod pki_store;

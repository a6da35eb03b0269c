/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/error.rs
 *
 * The orchestrator's error taxonomy. Each variant corresponds to a distinct
 * failure condition with its own propagation policy: ConfigError and
 * NotReady are always fatal, NotFound is context-dependent (reconcile paths
 * downgrade it, verify paths don't), Mismatch is fatal, Timeout is fatal on
 * required steps only, PeerUnavailable and ExternalTool are never fatal on
 * their own (they have in-process fallbacks or non-fatal continuations).
 * IdempotentConflict is deliberately absent: it is swallowed at the call
 * site and never becomes an `Error`.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cluster not ready: {0}")]
    NotReady(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("mismatch: {0}")]
    Mismatch(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("external tool failed: {0}")]
    ExternalTool(String),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True for errors that a `required` step must propagate (and roll back
    /// for); false for errors a caller may downgrade to a warning and continue.
    pub fn is_fatal_for_required_step(&self) -> bool {
        !matches!(self, Error::PeerUnavailable(_) | Error::ExternalTool(_))
    }
}

/// Returns `Ok(())` if `err` represents a Kubernetes `AlreadyExists` conflict,
/// otherwise re-wraps it. Used at every idempotent-create call site so the
/// `IdempotentConflict` policy (swallow) never needs its own `Error` variant.
pub fn swallow_already_exists(err: kube::Error) -> Result<()> {
    if let kube::Error::Api(ref api_err) = err {
        if api_err.code == 409 || api_err.reason == "AlreadyExists" {
            return Ok(());
        }
    }
    Err(err.into())
}

/// Returns `true` if `err` represents a Kubernetes `NotFound` (404).
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_step_propagates_timeout() {
        let err = Error::Timeout("waiting for deployment".into());
        assert!(err.is_fatal_for_required_step());
    }

    #[test]
    fn required_step_does_not_propagate_peer_unavailable() {
        let err = Error::PeerUnavailable("homelab kubeconfig missing".into());
        assert!(!err.is_fatal_for_required_step());
    }
}

/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/cluster.rs
 *
 * The two well-known logical cluster identities and the pure peer function
 * between them. There is no dynamic cluster registry: `nas` and `homelab`
 * are the only values that ever exist, and each is the other's peer.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(ValueEnum, Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ClusterId {
    Nas,
    Homelab,
}

impl ClusterId {
    /// `nas` hosts the root secrets store and the unseal oracle; this is the
    /// only cluster for which `isStorage` is true.
    pub fn is_storage(self) -> bool {
        matches!(self, ClusterId::Nas)
    }

    pub fn peer(self) -> ClusterId {
        match self {
            ClusterId::Nas => ClusterId::Homelab,
            ClusterId::Homelab => ClusterId::Nas,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClusterId::Nas => "nas",
            ClusterId::Homelab => "homelab",
        }
    }

    /// Lowercase equality then substring match, per the cluster-discovery
    /// context-name mapping rule.
    pub fn from_context_name(name: &str) -> Option<ClusterId> {
        let lower = name.to_lowercase();
        if lower == "nas" {
            return Some(ClusterId::Nas);
        }
        if lower == "homelab" {
            return Some(ClusterId::Homelab);
        }
        if lower.contains("nas") {
            return Some(ClusterId::Nas);
        }
        if lower.contains("homelab") {
            return Some(ClusterId::Homelab);
        }
        None
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_is_involutive() {
        assert_eq!(ClusterId::Nas.peer(), ClusterId::Homelab);
        assert_eq!(ClusterId::Homelab.peer(), ClusterId::Nas);
        assert_eq!(ClusterId::Nas.peer().peer(), ClusterId::Nas);
    }

    #[test]
    fn only_nas_is_storage() {
        assert!(ClusterId::Nas.is_storage());
        assert!(!ClusterId::Homelab.is_storage());
    }

    #[test]
    fn context_name_mapping_is_case_insensitive_and_substring_based() {
        assert_eq!(ClusterId::from_context_name("NAS"), Some(ClusterId::Nas));
        assert_eq!(
            ClusterId::from_context_name("prod-homelab-admin"),
            Some(ClusterId::Homelab)
        );
        assert_eq!(ClusterId::from_context_name("unrelated"), None);
    }
}

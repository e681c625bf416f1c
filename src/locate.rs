// src/locate.rs
//
// Object-location lookup is an external collaborator and explicitly out of
// scope as a system to build (§1) — but the planner needs *some* trait to
// call in step 3, so this is a deliberately thin seam. Grounded loosely on
// `r4ntix-arrow-ballista`'s `cluster/mod.rs` treating host resolution as a
// pluggable concern of the scheduler (it imports a `ConsistentHash` for the
// same purpose); no source for that piece was retrieved, so the static
// table below is original within that precedent, not a port of anything.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::model::LocateResponse;

/// Resolves object keys to the hosts that hold them, in preference order.
/// An empty host list for a key means unlocatable (§3 edge case).
#[async_trait]
pub trait LocateService: Send + Sync {
    async fn locate(&self, keys: &[String]) -> LocateResponse;
}

/// Fixed key→hosts table, useful for local runs and tests where the real
/// object-placement service isn't available.
pub struct StaticLocate {
    table: HashMap<String, Vec<String>>,
}

impl StaticLocate {
    pub fn new(table: HashMap<String, Vec<String>>) -> Self {
        Self { table }
    }

    pub fn empty() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, hosts: Vec<String>) {
        self.table.insert(key.into(), hosts);
    }
}

#[async_trait]
impl LocateService for StaticLocate {
    async fn locate(&self, keys: &[String]) -> LocateResponse {
        let mut hosts_by_key = HashMap::with_capacity(keys.len());
        for key in keys {
            let hosts = self.table.get(key).cloned().unwrap_or_default();
            hosts_by_key.insert(key.clone(), hosts);
        }
        LocateResponse { hosts_by_key }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_key_resolves_to_empty_host_list() {
        let mut locate = StaticLocate::empty();
        locate.insert("k1", vec!["hostA".into(), "hostB".into()]);

        let resp = locate
            .locate(&["k1".to_string(), "k2".to_string()])
            .await;

        assert_eq!(resp.hosts_for("k1"), &["hostA".to_string(), "hostB".to_string()]);
        assert!(resp.hosts_for("k2").is_empty());
    }
}

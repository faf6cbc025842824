//! Topic cache: maps logical topic names from the `/password` response to
//! concrete MQTT topic strings.
//!
//! The cloud hands back an ordered list of `(name, topic)` pairs where the
//! topic template may embed the literal `#{claim_id}`. Each template is
//! resolved once at cache build time by splicing in the current claim id.
//! A fixed set of logical names is compulsory; bootstrap fails when any of
//! them is missing so the link never serves with a partial topic map.

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

const CLAIM_ID_REPLACE_TAG: &str = "#{claim_id}";

/// Logical topic ids used throughout the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicId {
    Chart,
    Alarms,
    Metadata,
    Command,
    AgentConnection,
    CommandNgV1,
    CreateNodeInstance,
    NodeInstanceConnection,
    ChartDimsUpdated,
    ChartConfigsUpdated,
    ChartReset,
    RetentionUpdated,
    NodeInstanceInfo,
    AlarmLog,
    AlarmHealth,
    AlarmConfig,
    AlarmSnapshot,
    NodeInstanceCollectors,
    ContextsSnapshot,
    ContextsUpdated,
}

/// Cloud-side names as they appear in the `/password` topic list.
const TOPIC_NAMES: &[(TopicId, &str)] = &[
    (TopicId::Chart, "chart"),
    (TopicId::Alarms, "alarms"),
    (TopicId::Metadata, "meta"),
    (TopicId::Command, "inbox-cmd"),
    (TopicId::AgentConnection, "agent-connection"),
    (TopicId::CommandNgV1, "inbox-cmd-v1"),
    (TopicId::CreateNodeInstance, "create-node-instance"),
    (TopicId::NodeInstanceConnection, "node-instance-connection"),
    (TopicId::ChartDimsUpdated, "chart-and-dims-updated"),
    (TopicId::ChartConfigsUpdated, "chart-configs-updated"),
    (TopicId::ChartReset, "reset-charts"),
    (TopicId::RetentionUpdated, "chart-retention-updated"),
    (TopicId::NodeInstanceInfo, "node-instance-info"),
    (TopicId::AlarmLog, "alarm-log"),
    (TopicId::AlarmHealth, "alarm-health"),
    (TopicId::AlarmConfig, "alarm-config"),
    (TopicId::AlarmSnapshot, "alarm-snapshot"),
    (TopicId::NodeInstanceCollectors, "node-instance-collectors"),
    (TopicId::ContextsSnapshot, "contexts-snapshot"),
    (TopicId::ContextsUpdated, "contexts-updated"),
];

/// Every one of these must be present in the `/password` topic list.
const COMPULSORY_TOPICS: &[TopicId] = &[
    TopicId::Chart,
    TopicId::Alarms,
    TopicId::Metadata,
    TopicId::Command,
    TopicId::AgentConnection,
    TopicId::CommandNgV1,
    TopicId::CreateNodeInstance,
    TopicId::NodeInstanceConnection,
    TopicId::ChartDimsUpdated,
    TopicId::ChartConfigsUpdated,
    TopicId::ChartReset,
    TopicId::RetentionUpdated,
    TopicId::NodeInstanceInfo,
    TopicId::AlarmLog,
    TopicId::AlarmHealth,
    TopicId::AlarmConfig,
    TopicId::AlarmSnapshot,
    TopicId::NodeInstanceCollectors,
    TopicId::ContextsSnapshot,
    TopicId::ContextsUpdated,
];

impl TopicId {
    fn from_cloud_name(name: &str) -> Option<Self> {
        TOPIC_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(id, _)| *id)
    }

    pub fn cloud_name(&self) -> &'static str {
        TOPIC_NAMES
            .iter()
            .find(|(id, _)| id == self)
            .map(|(_, n)| *n)
            .unwrap_or("unknown")
    }
}

/// One entry of the `/password` topic list.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TopicEntry {
    pub name: String,
    pub topic: String,
}

#[derive(Debug, Error)]
pub enum TopicError {
    #[error("Compulsory topic \"{0}\" missing from topic list")]
    MissingCompulsory(&'static str),
}

#[derive(Debug)]
struct CachedTopic {
    id: TopicId,
    resolved: String,
}

/// Resolved topic map, rebuilt on every successful bootstrap.
///
/// Lookups are a linear scan over a handful of entries; the cache is
/// read-only once built.
#[derive(Debug, Default)]
pub struct TopicCache {
    entries: Vec<CachedTopic>,
}

impl TopicCache {
    /// Builds the cache from the `/password` topic list, splicing the claim
    /// id into each template that carries the placeholder. Unknown logical
    /// names are logged and skipped.
    pub fn build(topics: &[TopicEntry], claim_id: &str) -> Result<Self, TopicError> {
        let mut entries = Vec::with_capacity(topics.len());
        for entry in topics {
            let Some(id) = TopicId::from_cloud_name(&entry.name) else {
                warn!("Ignoring unknown topic name \"{}\" from cloud", entry.name);
                continue;
            };
            entries.push(CachedTopic {
                id,
                resolved: entry.topic.replace(CLAIM_ID_REPLACE_TAG, claim_id),
            });
        }
        let cache = Self { entries };
        for id in COMPULSORY_TOPICS {
            if cache.topic_for(*id).is_none() {
                return Err(TopicError::MissingCompulsory(id.cloud_name()));
            }
        }
        Ok(cache)
    }

    pub fn topic_for(&self, id: TopicId) -> Option<&str> {
        self.entries
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.resolved.as_str())
    }

    /// All cached topics, for diagnostics output.
    pub fn iter(&self) -> impl Iterator<Item = (TopicId, &str)> {
        self.entries.iter().map(|t| (t.id, t.resolved.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_topic_list(claim_marker: &str) -> Vec<TopicEntry> {
        TOPIC_NAMES
            .iter()
            .map(|(_, name)| TopicEntry {
                name: name.to_string(),
                topic: format!("/agent/{claim_marker}/{name}"),
            })
            .collect()
    }

    #[test]
    fn splices_claim_id_into_templates() {
        let topics = full_topic_list("#{claim_id}");
        let cache = TopicCache::build(&topics, "claim-123").unwrap();
        assert_eq!(
            cache.topic_for(TopicId::AgentConnection),
            Some("/agent/claim-123/agent-connection")
        );
        // nothing else about the template changes
        assert_eq!(
            cache.topic_for(TopicId::CommandNgV1),
            Some("/agent/claim-123/inbox-cmd-v1")
        );
    }

    #[test]
    fn template_without_placeholder_kept_verbatim() {
        let topics = full_topic_list("static");
        let cache = TopicCache::build(&topics, "claim-123").unwrap();
        assert_eq!(
            cache.topic_for(TopicId::AlarmLog),
            Some("/agent/static/alarm-log")
        );
    }

    #[test]
    fn missing_compulsory_topic_fails_build() {
        let mut topics = full_topic_list("#{claim_id}");
        topics.retain(|t| t.name != "alarm-health");
        let err = TopicCache::build(&topics, "c").unwrap_err();
        assert!(matches!(err, TopicError::MissingCompulsory("alarm-health")));
    }

    #[test]
    fn unknown_names_are_ignored() {
        let mut topics = full_topic_list("#{claim_id}");
        topics.push(TopicEntry {
            name: "brand-new-topic".into(),
            topic: "/agent/x".into(),
        });
        let cache = TopicCache::build(&topics, "c").unwrap();
        assert_eq!(cache.iter().count(), TOPIC_NAMES.len());
    }
}

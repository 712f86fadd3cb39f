// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashSet;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use super::ConsumerHolder;

/// Topic to producer ids and topic to consumer groups indexes.
///
/// Updates on one topic only lock that topic's shard, and set semantics
/// absorb duplicate registrations.
pub struct TopicPSInfoManager {
    consumer_holder: Arc<dyn ConsumerHolder>,
    topic_pub_info: DashMap<String, HashSet<String>>,
    topic_sub_info: DashMap<String, HashSet<String>>,
}

impl Debug for TopicPSInfoManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicPSInfoManager")
            .field("topic_pub_info", &self.topic_pub_info)
            .field("topic_sub_info", &self.topic_sub_info)
            .finish()
    }
}

impl TopicPSInfoManager {
    pub fn new(consumer_holder: Arc<dyn ConsumerHolder>) -> Self {
        Self {
            consumer_holder,
            topic_pub_info: DashMap::new(),
            topic_sub_info: DashMap::new(),
        }
    }

    pub fn get_topic_sub_info(&self, topic: &str) -> Option<HashSet<String>> {
        self.topic_sub_info.get(topic).map(|groups| groups.clone())
    }

    /// Replaces the subscribed groups of `topic`.
    pub fn set_topic_sub_info(&self, topic: &str, groups: HashSet<String>) {
        self.topic_sub_info.insert(topic.to_string(), groups);
    }

    pub fn add_topic_sub_info(&self, topic: &str, group: &str) {
        self.topic_sub_info
            .entry(topic.to_string())
            .or_default()
            .insert(group.to_string());
    }

    /// Removes `group` from the subscribers of `topic`. Returns false only
    /// when the topic is known and the group was not subscribed to it.
    pub fn remove_topic_sub_info(&self, topic: &str, group: &str) -> bool {
        match self.topic_sub_info.get_mut(topic) {
            Some(mut groups) => groups.remove(group),
            None => true,
        }
    }

    pub fn get_topic_pub_info(&self, topic: &str) -> Option<HashSet<String>> {
        self.topic_pub_info.get(topic).map(|producers| producers.clone())
    }

    /// Installs `producers` for `topic` unless the topic already has a set,
    /// in which case the existing set is returned and nothing changes.
    pub fn set_topic_pub_info(
        &self,
        topic: &str,
        producers: HashSet<String>,
    ) -> Option<HashSet<String>> {
        match self.topic_pub_info.entry(topic.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => Some(existing.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(producers);
                None
            }
        }
    }

    pub fn add_producer_topic_pub_info<S: AsRef<str>>(&self, producer_id: &str, topics: &[S]) {
        for topic in topics {
            self.topic_pub_info
                .entry(topic.as_ref().to_string())
                .or_default()
                .insert(producer_id.to_string());
        }
        debug!(producer_id, topics = topics.len(), "producer topics registered");
    }

    pub fn rmv_producer_topic_pub_info<S: AsRef<str>>(&self, producer_id: &str, topics: &[S]) {
        for topic in topics {
            if let Some(mut producers) = self.topic_pub_info.get_mut(topic.as_ref()) {
                producers.remove(producer_id);
            }
        }
        debug!(producer_id, topics = topics.len(), "producer topics unregistered");
    }

    /// Groups affected by `sub_topics`, narrowed to `qry_groups` when that
    /// is not empty.
    ///
    /// With no topics given the answer is drawn from the online groups of
    /// the consumer holder; otherwise from the groups subscribed to any of
    /// the topics.
    pub fn get_group_set_with_sub_topic(
        &self,
        qry_groups: &HashSet<String>,
        sub_topics: &HashSet<String>,
    ) -> HashSet<String> {
        if sub_topics.is_empty() {
            let online = self.consumer_holder.all_groups();
            if qry_groups.is_empty() {
                return online;
            }
            return online.intersection(qry_groups).cloned().collect();
        }

        let mut result = HashSet::new();
        for topic in sub_topics {
            let Some(groups) = self.topic_sub_info.get(topic) else {
                continue;
            };
            if qry_groups.is_empty() {
                result.extend(groups.iter().cloned());
            } else {
                result.extend(groups.intersection(qry_groups).cloned());
                if result.len() == qry_groups.len() {
                    break;
                }
            }
        }
        result
    }

    pub fn clear(&self) {
        self.topic_pub_info.clear();
        self.topic_sub_info.clear();
        info!("topic publish and subscribe info cleared");
    }
}

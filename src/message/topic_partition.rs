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

use std::borrow::Cow;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use crate::{AppError, AppResult};

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl Display for TopicPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn id(&self) -> String {
        format!("{}-{}", self.topic, self.partition)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Parses the `<topic>-<partition>` form. Topics may contain dashes, the
    /// partition id is whatever follows the last one.
    pub fn from_string(str_name: Cow<str>) -> AppResult<Self> {
        let (topic, partition) = str_name.rsplit_once('-').ok_or_else(|| {
            AppError::InvalidValue(format!("topic partition name: {}", str_name))
        })?;
        if topic.is_empty() {
            return Err(AppError::InvalidValue(format!(
                "topic partition name: {}",
                str_name
            )));
        }

        let partition = partition.parse().map_err(|_| {
            AppError::InvalidValue(format!("topic partition id: {}", partition))
        })?;

        Ok(Self::new(topic, partition))
    }

    /// Directory holding this partition's segment files.
    pub fn partition_dir(&self, base_dir: impl AsRef<Path>) -> PathBuf {
        base_dir.as_ref().join(self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_topics_containing_dashes() -> AppResult<()> {
        let tp = TopicPartition::from_string(Cow::Borrowed("order-events-12"))?;
        assert_eq!(tp.topic(), "order-events");
        assert_eq!(tp.partition(), 12);
        assert_eq!(tp.id(), "order-events-12");
        Ok(())
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(TopicPartition::from_string(Cow::Borrowed("nodash")).is_err());
        assert!(TopicPartition::from_string(Cow::Borrowed("topic-x")).is_err());
        assert!(TopicPartition::from_string(Cow::Borrowed("-3")).is_err());
    }
}

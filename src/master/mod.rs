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

//! Coordinator-side bookkeeping of who publishes and who subscribes to
//! which topic.

mod topic_ps_info;

use std::collections::HashSet;

pub use topic_ps_info::TopicPSInfoManager;

/// Source of the consumer groups currently online.
pub trait ConsumerHolder: Send + Sync {
    fn all_groups(&self) -> HashSet<String>;
}

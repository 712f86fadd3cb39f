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
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{trace, warn};

use crate::message::TopicPartition;
use crate::{AppError, AppResult};

/// Text file mapping each partition to an offset: a version line followed
/// by one `<topic>-<partition> <offset>` line per partition.
///
/// Writes go to a sibling temp file that is synced and renamed over the
/// old one, so a crash leaves either the old or the new content.
#[derive(Debug)]
pub struct CheckPointFile {
    path: PathBuf,
    version: i8,
}

impl CheckPointFile {
    pub const CK_FILE_VERSION_1: i8 = 1;

    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            version: Self::CK_FILE_VERSION_1,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_checkpoints(&self, points: &HashMap<TopicPartition, i64>) -> AppResult<()> {
        let tmp_path = self.path.with_extension("tmp");
        let write_file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)
            .await?;
        let mut buf_writer = BufWriter::new(write_file);
        buf_writer
            .write_all(format!("{}\n", self.version).as_bytes())
            .await?;
        for (topic_partition, offset) in points {
            buf_writer
                .write_all(format!("{} {}\n", topic_partition.id(), offset).as_bytes())
                .await?;
        }
        buf_writer.flush().await?;
        buf_writer.get_ref().sync_all().await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        trace!(path = %self.path.display(), entries = points.len(), "checkpoints written");
        Ok(())
    }

    /// Reads the checkpoints back. A missing file reads as empty.
    pub async fn read_checkpoints(&self) -> AppResult<HashMap<TopicPartition, i64>> {
        let error = |what: &str| {
            AppError::InvalidValue(format!(
                "checkpoint file {}: {}",
                self.path.display(),
                what
            ))
        };
        let open_file = match OpenOptions::new().read(true).open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    path = %self.path.display(),
                    "checkpoint file not found, fine on first start"
                );
                return Ok(HashMap::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(open_file);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let version = line
            .trim()
            .parse::<i8>()
            .map_err(|_| error(&format!("bad version line {:?}", line.trim())))?;
        if version != self.version {
            return Err(error(&format!("unsupported version {}", version)));
        }

        let mut points = HashMap::new();
        line.clear();
        while reader.read_line(&mut line).await? > 0 {
            let parts: Vec<&str> = line.split_whitespace().collect();
            let [tp_str, offset_str] = parts[..] else {
                return Err(error(&format!("bad line {:?}", line.trim())));
            };
            let topic_partition = TopicPartition::from_string(Cow::Borrowed(tp_str))?;
            let offset = offset_str
                .parse::<i64>()
                .map_err(|_| error(&format!("bad offset {:?}", offset_str)))?;
            points.insert(topic_partition, offset);
            line.clear();
        }
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::fs;

    #[tokio::test]
    async fn test_write_and_read_checkpoints() -> AppResult<()> {
        let dir = TempDir::new()?;
        let checkpoint_file = CheckPointFile::new(dir.path().join(".recovery_checkpoints"));

        let mut points = HashMap::new();
        points.insert(TopicPartition::new("topic1", 0), 100);
        points.insert(TopicPartition::new("my-topic", 12), 200);

        checkpoint_file.write_checkpoints(&points).await?;
        let read_points = checkpoint_file.read_checkpoints().await?;
        assert_eq!(points, read_points);

        points.insert(TopicPartition::new("topic1", 0), 150);
        checkpoint_file.write_checkpoints(&points).await?;
        assert_eq!(checkpoint_file.read_checkpoints().await?, points);
        assert!(!dir.path().join(".recovery_checkpoints.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() -> AppResult<()> {
        let dir = TempDir::new()?;
        let checkpoint_file = CheckPointFile::new(dir.path().join("absent"));
        assert!(checkpoint_file.read_checkpoints().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_version() -> AppResult<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("ck");
        fs::write(&path, "2\n").await?;

        let result = CheckPointFile::new(&path).read_checkpoints().await;
        assert!(matches!(result, Err(AppError::InvalidValue(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_format() -> AppResult<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("ck");
        fs::write(&path, "1\ntopic1-0 invalid\n").await?;

        let result = CheckPointFile::new(&path).read_checkpoints().await;
        assert!(result.is_err());
        Ok(())
    }
}

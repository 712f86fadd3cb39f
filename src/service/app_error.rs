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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("offset storage error: {0}")]
    StorageError(#[from] rocksdb::Error),

    #[error("serialize error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// store errors
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("segment {start} is closed for append")]
    SegmentClosed { start: i64 },

    #[error("range out of segment bounds: {0}")]
    OutOfRange(String),

    #[error("offset {offset} out of range, earliest retained: {earliest}, latest: {latest}")]
    OffsetOutOfRange {
        offset: i64,
        earliest: i64,
        latest: i64,
    },

    /// offset service errors
    #[error("commit policy mismatch: {0}")]
    PolicyMismatch(String),
}

/// How a caller outside the store is expected to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// re-seek to the reported earliest offset and retry
    Reseek,
    /// the partition or service is unusable until repaired
    Fatal,
    /// the request itself was wrong
    Misuse,
    /// retrying later may succeed
    Transient,
}

impl AppError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AppError::OffsetOutOfRange { .. } => ErrorCategory::Reseek,
            AppError::StoreUnavailable(_)
            | AppError::CorruptRecord(_)
            | AppError::IllegalState(_) => ErrorCategory::Fatal,
            AppError::SegmentClosed { .. }
            | AppError::OutOfRange(_)
            | AppError::PolicyMismatch(_)
            | AppError::InvalidValue(_)
            | AppError::InvalidOperation(_) => ErrorCategory::Misuse,
            AppError::DetailedIoError(_)
            | AppError::IoError(_)
            | AppError::ConfigFileError(_)
            | AppError::StorageError(_)
            | AppError::SerdeError(_) => ErrorCategory::Transient,
        }
    }

    /// The offset a consumer must re-seek to, for errors that carry one.
    pub fn reseek_offset(&self) -> Option<i64> {
        match self {
            AppError::OffsetOutOfRange { earliest, .. } => Some(*earliest),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_separate_reseek_fatal_and_misuse() {
        let reseek = AppError::OffsetOutOfRange {
            offset: 5,
            earliest: 20,
            latest: 90,
        };
        assert_eq!(reseek.category(), ErrorCategory::Reseek);
        assert_eq!(reseek.reseek_offset(), Some(20));

        let fatal = AppError::StoreUnavailable("topic-0".into());
        assert_eq!(fatal.category(), ErrorCategory::Fatal);
        assert_eq!(fatal.reseek_offset(), None);

        let misuse = AppError::SegmentClosed { start: 100 };
        assert_eq!(misuse.category(), ErrorCategory::Misuse);
        assert_eq!(
            AppError::PolicyMismatch("g".into()).category(),
            ErrorCategory::Misuse
        );
    }
}

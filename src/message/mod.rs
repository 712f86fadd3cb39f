pub use record::{
    decode_records, encode_record, encoded_size, record_crc, RecordHeader, StoredRecord,
    RECORD_HEADER_SIZE,
};
pub use topic_partition::TopicPartition;
mod record;
mod topic_partition;

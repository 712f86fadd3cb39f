use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use bytes::Buf;
use chrono::TimeZone;
use clap::{Parser, Subcommand};
use tubestore::log::CheckPointFile;
use tubestore::message::{RecordHeader, RECORD_HEADER_SIZE};
use tubestore::{AppError, AppResult};

#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// dump the records of a segment data file
    Data {
        #[arg(short, long)]
        file: PathBuf,
        /// print payloads as lossy utf8
        #[arg(short, long)]
        payload: bool,
    },
    Index {
        #[arg(short, long)]
        file: PathBuf,
    },
    Checkpoint {
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Data { file, payload } => dump_data(file, *payload),
        Commands::Index { file } => dump_index(file),
        Commands::Checkpoint { file } => dump_checkpoint(file).await,
    }
}

/// Start offset encoded in a segment file name.
fn segment_start(file: &Path) -> AppResult<i64> {
    file.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.parse::<i64>().ok())
        .ok_or_else(|| {
            AppError::InvalidValue(format!("not a segment file name: {}", file.display()))
        })
}

fn format_timestamp(timestamp: i64) -> String {
    chrono::Local
        .timestamp_millis_opt(timestamp)
        .single()
        .map(|time| time.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

fn dump_data(file: &Path, print_payload: bool) -> AppResult<()> {
    let mut offset = segment_start(file)?;
    let mut reader = BufReader::new(File::open(file)?);
    let mut header_buf = [0u8; RECORD_HEADER_SIZE];
    let mut position: u64 = 0;
    let mut bad_frames = 0;

    loop {
        match reader.read_exact(&mut header_buf) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let header = RecordHeader::parse(&header_buf)?;
        let mut payload = vec![0u8; header.size as usize];
        if let Err(e) = reader.read_exact(&mut payload) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                println!("position {}: incomplete frame, {} bytes declared", position, header.size);
                break;
            }
            return Err(e.into());
        }
        let crc_ok = header.verify(&payload);
        if !crc_ok {
            bad_frames += 1;
        }
        print!(
            "offset: {} position: {} size: {} time: {} crc: {}",
            offset,
            position,
            header.size,
            format_timestamp(header.timestamp),
            if crc_ok { "ok" } else { "MISMATCH" }
        );
        if print_payload {
            print!(" payload: {}", String::from_utf8_lossy(&payload));
        }
        println!();
        offset += 1;
        position += header.frame_size();
    }

    println!("---");
    println!(
        "next offset: {} valid bytes: {} crc mismatches: {}",
        offset, position, bad_frames
    );
    Ok(())
}

fn dump_index(file: &Path) -> AppResult<()> {
    let start = segment_start(file)?;
    let mut content = Vec::new();
    File::open(file)?.read_to_end(&mut content)?;

    let mut buf = content.as_slice();
    let mut entry_no = 0;
    while buf.remaining() >= 8 {
        let relative_offset = buf.get_u32();
        let position = buf.get_u32();
        // active index files are pre-allocated with zeros
        if entry_no > 0 && relative_offset == 0 && position == 0 {
            break;
        }
        println!(
            "relative offset: {} absolute offset: {} position: {}",
            relative_offset,
            start + relative_offset as i64,
            position
        );
        entry_no += 1;
    }
    println!("---");
    println!("entries: {}", entry_no);
    Ok(())
}

async fn dump_checkpoint(file: &Path) -> AppResult<()> {
    let checkpoint = CheckPointFile::new(file);
    let mut points: Vec<_> = checkpoint.read_checkpoints().await?.into_iter().collect();
    points.sort();
    for (topic_partition, offset) in points {
        println!("{} {}", topic_partition, offset);
    }
    Ok(())
}

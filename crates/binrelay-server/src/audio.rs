//! Assistant audio: WAV recording of streamed deltas and optional local
//! playback.
//!
//! Chunks are handed to a single writer task so file I/O never runs on the
//! relay path, while chunks of one utterance still land in order. The WAV
//! size fields are patched after every append so a file is valid even if
//! the process dies mid-utterance.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::subprocess::{ManagedChild, SubprocessError};

pub const SAMPLE_RATE: u32 = 24_000;
pub const CHANNELS: u16 = 1;
pub const BITS_PER_SAMPLE: u16 = 16;
pub const BYTE_RATE: u32 = SAMPLE_RATE * CHANNELS as u32 * BITS_PER_SAMPLE as u32 / 8;
const BLOCK_ALIGN: u16 = CHANNELS * BITS_PER_SAMPLE / 8;
pub const WAV_HEADER_LEN: u64 = 44;

/// Longest item id kept in a file name.
const MAX_ITEM_ID_LEN: usize = 64;

/// Make an upstream item id safe for use in a file name.
pub fn sanitize_item_id(item_id: &str) -> String {
    let cleaned: String = item_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_ITEM_ID_LEN)
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

enum WriterCommand {
    Append { path: PathBuf, data: Vec<u8> },
    Flush(oneshot::Sender<()>),
}

/// Records assistant audio deltas into one WAV file per utterance.
pub struct AudioRecorder {
    dir: PathBuf,
    filenames: Mutex<HashMap<String, PathBuf>>,
    bytes: Mutex<HashMap<String, usize>>,
    writer: mpsc::UnboundedSender<WriterCommand>,
}

impl AudioRecorder {
    /// Create the recorder and start its writer task.
    pub fn new(dir: PathBuf) -> Self {
        let (writer, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(rx));
        Self {
            dir,
            filenames: Mutex::new(HashMap::new()),
            bytes: Mutex::new(HashMap::new()),
            writer,
        }
    }

    /// Queue `data` for the utterance `item_id`. Returns the running byte count.
    pub fn record_chunk(&self, item_id: &str, data: Vec<u8>) -> usize {
        let item = sanitize_item_id(item_id);
        let path = {
            let Ok(mut names) = self.filenames.lock() else {
                return 0;
            };
            names
                .entry(item.clone())
                .or_insert_with(|| {
                    self.dir.join(format!(
                        "{}_{item}.wav",
                        binrelay_core::db::unix_timestamp_millis()
                    ))
                })
                .clone()
        };

        let total = self.bytes.lock().map_or(0, |mut counts| {
            let count = counts.entry(item).or_insert(0);
            *count += data.len();
            *count
        });

        if self.writer.send(WriterCommand::Append { path, data }).is_err() {
            warn!("Audio writer stopped, chunk not saved");
        }
        total
    }

    /// Close out the utterance `item_id`, returning the bytes it received.
    pub fn finish(&self, item_id: &str) -> Option<usize> {
        let item = sanitize_item_id(item_id);
        let path = self.filenames.lock().ok().and_then(|mut n| n.remove(&item));
        let total = self.bytes.lock().ok().and_then(|mut c| c.remove(&item));
        if let Some(total) = total {
            info!(
                item_id = %item,
                bytes = total,
                file = ?path,
                "Audio utterance finished"
            );
        }
        total
    }

    /// Close out every open utterance.
    pub fn finish_all(&self) -> usize {
        let items: Vec<String> = self
            .bytes
            .lock()
            .map(|counts| counts.keys().cloned().collect())
            .unwrap_or_default();
        let count = items.len();
        for item in items {
            self.finish(&item);
        }
        count
    }

    pub fn bytes_for(&self, item_id: &str) -> Option<usize> {
        let item = sanitize_item_id(item_id);
        self.bytes.lock().ok().and_then(|c| c.get(&item).copied())
    }

    pub fn path_for(&self, item_id: &str) -> Option<PathBuf> {
        let item = sanitize_item_id(item_id);
        self.filenames.lock().ok().and_then(|n| n.get(&item).cloned())
    }

    /// Wait until every chunk queued so far is on disk.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.writer.send(WriterCommand::Flush(tx)).is_ok() {
            rx.await.ok();
        }
    }
}

async fn writer_loop(mut rx: mpsc::UnboundedReceiver<WriterCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Append { path, data } => {
                let target = path.clone();
                match tokio::task::spawn_blocking(move || append_chunk(&target, &data)).await {
                    Ok(Ok(true)) => info!(path = %path.display(), "Audio file created"),
                    Ok(Ok(false)) => {}
                    Ok(Err(e)) => warn!(path = %path.display(), error = %e, "Failed to save audio chunk"),
                    Err(e) => warn!(error = %e, "Audio writer task failed"),
                }
            }
            WriterCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Audio writer finished");
}

/// Append PCM data to a WAV file, creating it with a header if needed, and
/// patch both size fields. Returns whether the file was created.
fn append_chunk(path: &Path, data: &[u8]) -> std::io::Result<bool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let created = !path.exists();
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    if created {
        file.write_all(&wav_header())?;
    }
    file.seek(SeekFrom::End(0))?;
    file.write_all(data)?;

    let size = file.stream_position()?;
    let riff_size = u32::try_from(size.saturating_sub(8)).unwrap_or(u32::MAX);
    let data_size = u32::try_from(size.saturating_sub(WAV_HEADER_LEN)).unwrap_or(u32::MAX);
    file.seek(SeekFrom::Start(4))?;
    file.write_all(&riff_size.to_le_bytes())?;
    file.seek(SeekFrom::Start(40))?;
    file.write_all(&data_size.to_le_bytes())?;
    Ok(created)
}

fn wav_header() -> Vec<u8> {
    let mut header = Vec::with_capacity(44);
    header.extend_from_slice(b"RIFF");
    header.extend_from_slice(&0u32.to_le_bytes());
    header.extend_from_slice(b"WAVE");
    header.extend_from_slice(b"fmt ");
    header.extend_from_slice(&16u32.to_le_bytes());
    header.extend_from_slice(&1u16.to_le_bytes());
    header.extend_from_slice(&CHANNELS.to_le_bytes());
    header.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    header.extend_from_slice(&BYTE_RATE.to_le_bytes());
    header.extend_from_slice(&BLOCK_ALIGN.to_le_bytes());
    header.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
    header.extend_from_slice(b"data");
    header.extend_from_slice(&0u32.to_le_bytes());
    header
}

/// Destination for assistant audio played on the hub itself.
pub trait PlaybackSink: Send + Sync {
    /// Queue raw PCM for playback. Returns `false` if the chunk was dropped.
    fn play(&self, pcm: Vec<u8>) -> bool;
}

/// Chunks buffered for the player before new ones are dropped.
const PLAYER_QUEUE: usize = 256;

/// Plays PCM through a local player subprocess fed on stdin.
pub struct LocalPlayer {
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    child: ManagedChild,
}

impl LocalPlayer {
    pub fn spawn(command_line: &str) -> Result<Self, SubprocessError> {
        use tokio::io::AsyncWriteExt;

        let (child, mut stdin) =
            ManagedChild::spawn_command_line("player", command_line, Duration::from_secs(3))?;
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(PLAYER_QUEUE);
        tokio::spawn(async move {
            while let Some(pcm) = rx.recv().await {
                if let Err(e) = stdin.write_all(&pcm).await {
                    warn!(error = %e, "Failed to write to player");
                    break;
                }
            }
            debug!("Player writer finished");
        });
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            child,
        })
    }

    /// Close the player's stdin and wait for it to exit.
    pub async fn stop(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        self.child.terminate().await;
    }
}

impl PlaybackSink for LocalPlayer {
    fn play(&self, pcm: Vec<u8>) -> bool {
        let Ok(guard) = self.tx.lock() else {
            return false;
        };
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        match tx.try_send(pcm) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Player queue full, dropping audio chunk");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn read_u32(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn sanitize_replaces_and_truncates() {
        assert_eq!(sanitize_item_id("item_ABC-123"), "item_ABC-123");
        assert_eq!(sanitize_item_id("../etc/passwd"), "___etc_passwd");
        assert_eq!(sanitize_item_id(""), "unknown");
        assert_eq!(sanitize_item_id(&"x".repeat(100)).len(), 64);
    }

    #[test]
    fn header_describes_pcm16_mono_24k() {
        let header = wav_header();
        assert_eq!(header.len(), 44);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(&header[8..12], b"WAVE");
        assert_eq!(read_u32(&header, 24), 24_000);
        assert_eq!(read_u32(&header, 28), 48_000);
        assert_eq!(&header[36..40], b"data");
    }

    #[test]
    fn size_fields_track_every_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");

        assert!(append_chunk(&path, &[1u8; 100]).unwrap());
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 144);
        assert_eq!(read_u32(&bytes, 4), 136);
        assert_eq!(read_u32(&bytes, 40), 100);

        assert!(!append_chunk(&path, &[2u8; 50]).unwrap());
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 194);
        assert_eq!(read_u32(&bytes, 4), 186);
        assert_eq!(read_u32(&bytes, 40), 150);
        assert_eq!(bytes[144], 2);
    }

    #[tokio::test]
    async fn recorder_writes_one_file_per_item() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = AudioRecorder::new(dir.path().to_path_buf());

        assert_eq!(recorder.record_chunk("item/1", vec![0; 10]), 10);
        assert_eq!(recorder.record_chunk("item/1", vec![0; 6]), 16);
        recorder.record_chunk("item_2", vec![0; 4]);
        let path = recorder.path_for("item/1").unwrap();
        assert!(path.to_string_lossy().ends_with("_item_1.wav"));

        recorder.flush().await;
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 44 + 16);
        assert_eq!(read_u32(&bytes, 40), 16);

        assert_eq!(recorder.finish("item/1"), Some(16));
        assert_eq!(recorder.bytes_for("item/1"), None);
        assert_eq!(recorder.finish("item/1"), None);
        assert_eq!(recorder.finish_all(), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }
}

//! Write-ahead journal and snapshot persistence for the local store

use super::state::{StoreOp, StoreState};
use crate::core::{DeadLetter, OutboxEntry, Record, Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{Level, event};

const JOURNAL_FILE: &str = "mirrorsync.journal";
const SNAPSHOT_FILE: &str = "mirrorsync.snapshot";
const SNAPSHOT_FORMAT_VERSION: u16 = 1;

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ============================================================================
// Journal Frames
// ============================================================================

/// One atomic batch of store operations. A frame is either fully on disk or
/// ignored on recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalFrame {
    pub seq: u64,
    pub ts_unix_ms: u64,
    pub ops: Vec<StoreOp>,
}

// ============================================================================
// Store Snapshot
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub format_version: u16,
    pub created_at_unix_ms: u64,
    /// Last journal frame folded into this snapshot.
    pub last_frame_seq: u64,
    pub next_sequence: u64,
    pub records: Vec<Record>,
    pub outbox: Vec<OutboxEntry>,
    pub dead_letters: Vec<DeadLetter>,
}

impl StoreSnapshot {
    pub fn capture(state: &StoreState, last_frame_seq: u64) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            created_at_unix_ms: now_unix_ms(),
            last_frame_seq,
            next_sequence: state.next_sequence(),
            records: state.all_records(),
            outbox: state.entries().cloned().collect(),
            dead_letters: state.dead_letters().cloned().collect(),
        }
    }

    pub fn into_state(self) -> StoreState {
        StoreState::from_parts(self.records, self.outbox, self.dead_letters, self.next_sequence)
    }
}

// ============================================================================
// Durability Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DurabilityMode {
    /// fsync every frame before acknowledging.
    Sync,
    /// Flush to the OS, let it decide when to hit the disk.
    #[default]
    Async,
    /// No journal at all.
    None,
}

// ============================================================================
// Journal Manager
// ============================================================================

pub struct JournalManager {
    journal_path: PathBuf,
    journal_file: Option<BufWriter<File>>,
    durability_mode: DurabilityMode,
    frames_since_checkpoint: usize,
    checkpoint_threshold: usize,
}

/// Frames recovered from disk plus the byte length of the intact prefix.
pub struct JournalReplay {
    pub frames: Vec<JournalFrame>,
    pub valid_len: u64,
    pub torn_tail: bool,
}

impl JournalManager {
    pub fn new<P: AsRef<Path>>(journal_path: P, durability_mode: DurabilityMode) -> Result<Self> {
        let journal_path = journal_path.as_ref().to_path_buf();
        if let Some(parent) = journal_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                SyncError::Io(format!("Failed to create journal directory: {}", e))
            })?;
        }

        let journal_file = if durability_mode != DurabilityMode::None {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&journal_path)
                .map_err(|e| SyncError::Io(format!("Failed to open journal file: {}", e)))?;
            Some(BufWriter::new(file))
        } else {
            None
        };

        Ok(Self {
            journal_path,
            journal_file,
            durability_mode,
            frames_since_checkpoint: 0,
            checkpoint_threshold: 256,
        })
    }

    pub fn append(&mut self, frame: &JournalFrame) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        let file = self
            .journal_file
            .as_mut()
            .ok_or_else(|| SyncError::Io("Journal file not initialized".to_string()))?;
        let serialized = rmp_serde::to_vec(frame)
            .map_err(|e| SyncError::Serialization(format!("Failed to serialize journal frame: {}", e)))?;
        let len = serialized.len() as u32;
        // Length and body go out in one buffer so a crash can only tear the tail.
        let mut buffer = Vec::with_capacity(4 + serialized.len());
        buffer.extend_from_slice(&len.to_le_bytes());
        buffer.extend_from_slice(&serialized);
        file.write_all(&buffer)
            .map_err(|e| SyncError::Io(format!("Failed to write journal: {}", e)))?;
        file.flush()
            .map_err(|e| SyncError::Io(format!("Failed to flush journal: {}", e)))?;
        if self.durability_mode == DurabilityMode::Sync {
            file.get_mut()
                .sync_data()
                .map_err(|e| SyncError::Io(format!("Failed to sync journal: {}", e)))?;
        }
        self.frames_since_checkpoint += 1;
        Ok(())
    }

    pub fn read_all(&self) -> Result<JournalReplay> {
        let mut replay = JournalReplay {
            frames: Vec::new(),
            valid_len: 0,
            torn_tail: false,
        };
        if !self.journal_path.exists() {
            return Ok(replay);
        }
        let file = File::open(&self.journal_path)
            .map_err(|e| SyncError::Io(format!("Failed to open journal for reading: {}", e)))?;
        let file_len = file
            .metadata()
            .map_err(|e| SyncError::Io(format!("Failed to stat journal: {}", e)))?
            .len();
        let mut reader = BufReader::new(file);
        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    return Err(SyncError::Io(format!(
                        "Failed to read journal frame length: {}",
                        e
                    )));
                }
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            if replay.valid_len + 4 + len as u64 > file_len {
                break;
            }
            let mut data = vec![0u8; len];
            match reader.read_exact(&mut data) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    return Err(SyncError::Io(format!("Failed to read journal frame: {}", e)));
                }
            }
            let frame: JournalFrame = match rmp_serde::from_slice(&data) {
                Ok(frame) => frame,
                Err(e) => {
                    event!(Level::WARN, error = %e, "discarding undecodable journal tail");
                    break;
                }
            };
            replay.valid_len += 4 + len as u64;
            replay.frames.push(frame);
        }
        // Anything past the last decodable frame never committed.
        replay.torn_tail = file_len > replay.valid_len;
        Ok(replay)
    }

    /// Cuts the journal back to its last intact frame.
    pub fn truncate_to(&mut self, len: u64) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        self.journal_file = None;
        let file = OpenOptions::new()
            .write(true)
            .open(&self.journal_path)
            .map_err(|e| SyncError::Io(format!("Failed to open journal for repair: {}", e)))?;
        file.set_len(len)
            .map_err(|e| SyncError::Io(format!("Failed to truncate journal: {}", e)))?;
        file.sync_all()
            .map_err(|e| SyncError::Io(format!("Failed to sync journal: {}", e)))?;
        let file = OpenOptions::new()
            .append(true)
            .open(&self.journal_path)
            .map_err(|e| SyncError::Io(format!("Failed to reopen journal: {}", e)))?;
        self.journal_file = Some(BufWriter::new(file));
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        self.journal_file = None;
        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.journal_path)
            .map_err(|e| SyncError::Io(format!("Failed to truncate journal: {}", e)))?;
        file.sync_all()
            .map_err(|e| SyncError::Io(format!("Failed to sync journal: {}", e)))?;
        let file = OpenOptions::new()
            .append(true)
            .open(&self.journal_path)
            .map_err(|e| SyncError::Io(format!("Failed to reopen journal: {}", e)))?;
        self.journal_file = Some(BufWriter::new(file));
        self.frames_since_checkpoint = 0;
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.durability_mode != DurabilityMode::None
            && self.frames_since_checkpoint >= self.checkpoint_threshold
    }

    pub fn frames_since_checkpoint(&self) -> usize {
        self.frames_since_checkpoint
    }

    pub fn set_checkpoint_threshold(&mut self, threshold: usize) {
        self.checkpoint_threshold = threshold.max(1);
    }
}

// ============================================================================
// Snapshot Manager
// ============================================================================

pub struct SnapshotManager {
    snapshot_path: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    /// Writes through a temp file in the same directory and renames it into place.
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let parent = self
            .snapshot_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)
            .map_err(|e| SyncError::Io(format!("Failed to create snapshot directory: {}", e)))?;
        let temp_file = tempfile::NamedTempFile::new_in(&parent)
            .map_err(|e| SyncError::Io(format!("Failed to create temp file: {}", e)))?;
        let serialized = rmp_serde::to_vec(snapshot)
            .map_err(|e| SyncError::Serialization(format!("Failed to serialize snapshot: {}", e)))?;
        {
            let mut writer = BufWriter::new(temp_file.as_file());
            writer
                .write_all(&serialized)
                .map_err(|e| SyncError::Io(format!("Failed to write snapshot: {}", e)))?;
            writer
                .flush()
                .map_err(|e| SyncError::Io(format!("Failed to flush snapshot: {}", e)))?;
        }
        temp_file
            .as_file()
            .sync_all()
            .map_err(|e| SyncError::Io(format!("Failed to sync snapshot: {}", e)))?;
        temp_file
            .persist(&self.snapshot_path)
            .map_err(|e| SyncError::Io(format!("Failed to rename snapshot: {}", e)))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.snapshot_path)
            .map_err(|e| SyncError::Io(format!("Failed to open snapshot: {}", e)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| SyncError::Io(format!("Failed to read snapshot: {}", e)))?;
        let snapshot: StoreSnapshot = rmp_serde::from_slice(&data).map_err(|e| {
            SyncError::Serialization(format!("Failed to deserialize snapshot: {}", e))
        })?;
        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(SyncError::Serialization(format!(
                "Snapshot format {} is newer than supported {}",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        Ok(Some(snapshot))
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path.exists()
    }
}

// ============================================================================
// Persistence Manager
// ============================================================================

pub struct PersistenceManager {
    journal: JournalManager,
    snapshot: SnapshotManager,
    durability_mode: DurabilityMode,
    next_frame_seq: u64,
}

impl PersistenceManager {
    pub fn new<P: AsRef<Path>>(data_dir: P, durability_mode: DurabilityMode) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let journal = JournalManager::new(data_dir.join(JOURNAL_FILE), durability_mode)?;
        let snapshot = SnapshotManager::new(data_dir.join(SNAPSHOT_FILE));
        Ok(Self {
            journal,
            snapshot,
            durability_mode,
            next_frame_seq: 1,
        })
    }

    pub fn set_checkpoint_threshold(&mut self, threshold: usize) {
        self.journal.set_checkpoint_threshold(threshold);
    }

    /// Appends one atomic batch to the journal.
    pub fn log(&mut self, ops: &[StoreOp]) -> Result<()> {
        let frame = JournalFrame {
            seq: self.next_frame_seq,
            ts_unix_ms: now_unix_ms(),
            ops: ops.to_vec(),
        };
        self.journal.append(&frame)?;
        self.next_frame_seq = self.next_frame_seq.saturating_add(1);
        Ok(())
    }

    pub fn checkpoint(&mut self, state: &StoreState) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        let last_frame_seq = self.next_frame_seq.saturating_sub(1);
        let snapshot = StoreSnapshot::capture(state, last_frame_seq);
        self.snapshot.save(&snapshot)?;
        self.journal.clear()?;
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.journal.needs_checkpoint()
    }

    /// Rebuilds the store: snapshot first, then every journal frame newer than it.
    pub fn recover(&mut self) -> Result<StoreState> {
        let (mut state, snapshot_seq) = match self.snapshot.load()? {
            Some(snapshot) => {
                let seq = snapshot.last_frame_seq;
                (snapshot.into_state(), seq)
            }
            None => (StoreState::default(), 0),
        };

        let replay = self.journal.read_all()?;
        if replay.torn_tail {
            event!(
                Level::WARN,
                valid_len = replay.valid_len,
                "journal has a torn tail; truncating to last complete frame"
            );
            self.journal.truncate_to(replay.valid_len)?;
        }

        let mut last_seq = snapshot_seq;
        let mut replayed = 0usize;
        for frame in replay.frames {
            if frame.seq <= snapshot_seq {
                continue;
            }
            for op in frame.ops {
                state.apply(op);
            }
            last_seq = last_seq.max(frame.seq);
            replayed += 1;
        }
        self.next_frame_seq = last_seq.saturating_add(1);
        event!(
            Level::DEBUG,
            snapshot_seq,
            replayed,
            "local store recovered"
        );
        Ok(state)
    }

    pub fn journal(&self) -> &JournalManager {
        &self.journal
    }

    pub fn snapshot(&self) -> &SnapshotManager {
        &self.snapshot
    }

    pub fn durability_mode(&self) -> DurabilityMode {
        self.durability_mode
    }
}

//! Turn persistence.
//!
//! [`WavTurnStore`] lays turns out on disk as:
//! - `<root>/<device>/<role>/<timestamp>-<speaker>.wav`: 16 kHz mono 16-bit PCM,
//! - `<root>/index.jsonl`: one JSON line per turn (transcript plus the audio path).
//!
//! Both are append-only; nothing is rewritten once recorded.

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use parking_lot::Mutex;
use serde::Serialize;

use crate::Result;
use crate::codec::SAMPLE_RATE;
use crate::collaborators::{Speaker, TurnRecord, TurnStore};

const INDEX_FILE: &str = "index.jsonl";

/// Spec for every file this store writes.
pub fn device_wav_spec() -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

#[derive(Debug, Serialize)]
struct IndexEntry<'a> {
    device_id: &'a str,
    role_id: &'a str,
    session_id: &'a str,
    speaker: Speaker,
    text: &'a str,
    audio_path: Option<&'a Path>,
    at: DateTime<Utc>,
}

pub struct WavTurnStore {
    root: PathBuf,
    // Serializes index appends so lines never interleave.
    index_lock: Mutex<()>,
}

impl WavTurnStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create store root '{}'", root.display()))?;
        Ok(Self {
            root,
            index_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn audio_path(&self, record: &TurnRecord) -> PathBuf {
        let speaker = match record.speaker {
            Speaker::User => "user",
            Speaker::Assistant => "assistant",
        };
        self.root
            .join(path_component(&record.device_id))
            .join(path_component(&record.role_id))
            .join(format!(
                "{}-{speaker}.wav",
                record.at.format("%Y%m%dT%H%M%S%.3f")
            ))
    }

    fn write_audio(&self, path: &Path, pcm: &[i16]) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create '{}'", dir.display()))?;
        }

        let mut writer = WavWriter::create(path, device_wav_spec())?;
        for &s in pcm {
            writer.write_sample(s)?;
        }
        writer.finalize()?;
        Ok(())
    }

    fn append_index(&self, entry: &IndexEntry<'_>) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _guard = self.index_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.index_path())?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

impl TurnStore for WavTurnStore {
    fn record(&self, record: TurnRecord) -> Result<()> {
        let audio_path = if record.pcm.is_empty() {
            None
        } else {
            let path = self.audio_path(&record);
            self.write_audio(&path, &record.pcm)?;
            Some(path)
        };

        self.append_index(&IndexEntry {
            device_id: &record.device_id,
            role_id: &record.role_id,
            session_id: &record.session_id,
            speaker: record.speaker,
            text: &record.text,
            audio_path: audio_path.as_deref(),
            at: record.at,
        })?;

        tracing::debug!(
            device_id = %record.device_id,
            speaker = ?record.speaker,
            samples = record.pcm.len(),
            "turn recorded"
        );
        Ok(())
    }
}

/// Binds a store to one conversation identity and persists off the async runtime.
#[derive(Clone)]
pub struct TurnRecorder {
    store: Arc<dyn TurnStore>,
    device_id: String,
    role_id: String,
    session_id: String,
}

impl TurnRecorder {
    pub fn new(
        store: Arc<dyn TurnStore>,
        device_id: impl Into<String>,
        role_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            device_id: device_id.into(),
            role_id: role_id.into(),
            session_id: session_id.into(),
        }
    }

    /// Persist one turn. Failures are logged; a lost recording never fails the dialogue.
    pub async fn record(&self, speaker: Speaker, text: String, pcm: Vec<i16>) {
        let record = TurnRecord {
            device_id: self.device_id.clone(),
            role_id: self.role_id.clone(),
            session_id: self.session_id.clone(),
            speaker,
            text,
            pcm,
            at: Utc::now(),
        };

        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.record(record)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(session_id = %self.session_id, error = %err, "failed to persist turn")
            }
            Err(err) => {
                tracing::warn!(session_id = %self.session_id, error = %err, "turn persistence task failed")
            }
        }
    }
}

/// Keeps records in memory; handy for tests and for embedding without disk persistence.
#[derive(Default)]
pub struct MemoryTurnStore {
    records: Mutex<Vec<TurnRecord>>,
}

impl MemoryTurnStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TurnRecord> {
        self.records.lock().clone()
    }
}

impl TurnStore for MemoryTurnStore {
    fn record(&self, record: TurnRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

/// Read back a recorded turn as 16-bit PCM. Only files in device format are accepted.
pub fn read_turn_audio<R>(reader: R) -> Result<Vec<i16>>
where
    R: Read + Seek,
{
    let mut reader = WavReader::new(reader).context("failed to read WAV data from reader")?;
    let spec = reader.spec();

    if spec.channels != 1 || spec.sample_rate != SAMPLE_RATE || spec.bits_per_sample != 16 {
        return Err(anyhow::anyhow!(
            "expected 16-bit mono {SAMPLE_RATE} Hz WAV, got {} ch / {} Hz / {} bit",
            spec.channels,
            spec.sample_rate,
            spec.bits_per_sample
        )
        .into());
    }

    let samples = reader
        .samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(samples)
}

// Device and role ids come from the network; keep them to one safe path segment.
fn path_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_owned()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(speaker: Speaker, pcm: Vec<i16>) -> TurnRecord {
        TurnRecord {
            device_id: "aa:bb:cc".to_owned(),
            role_id: "1".to_owned(),
            session_id: "s1".to_owned(),
            speaker,
            text: "你好".to_owned(),
            pcm,
            at: Utc::now(),
        }
    }

    #[test]
    fn records_audio_and_index_line() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = WavTurnStore::new(dir.path())?;

        let pcm: Vec<i16> = (0..1600).map(|i| (i % 100) as i16 * 10).collect();
        store.record(record(Speaker::User, pcm.clone()))?;
        store.record(record(Speaker::Assistant, Vec::new()))?;

        let index = fs::read_to_string(store.index_path())?;
        let lines: Vec<serde_json::Value> = index
            .lines()
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["speaker"], "user");
        assert_eq!(lines[1]["audio_path"], serde_json::Value::Null);

        let path = lines[0]["audio_path"]
            .as_str()
            .context("user turn has no audio path")?;
        assert!(path.contains("aa_bb_cc"));
        let back = read_turn_audio(fs::File::open(path)?)?;
        assert_eq!(back, pcm);
        Ok(())
    }

    #[test]
    fn hostile_ids_stay_inside_root() {
        assert_eq!(path_component("../../etc"), "______etc");
        assert_eq!(path_component(""), "_");
    }
}

use crate::lifecycle::{Lifecycle, Transition, TransitionLog};
use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{BufRead, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Transition log stored as gzip-compressed JSONL, one file per entity.
///
/// Each append writes a new gzip member to the end of the entity's file, so
/// existing records are never rewritten.
pub struct JsonlTransitionLog<S> {
    base_path: PathBuf,
    // Serialises appends so members never interleave
    write_lock: Mutex<()>,
    _state: PhantomData<fn() -> S>,
}

impl<S: Lifecycle> JsonlTransitionLog<S> {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)
            .context("Failed to create transition log directory")?;
        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
            _state: PhantomData,
        })
    }

    /// Format: <base>/<entity_id>.jsonl.gz
    ///
    /// Ids made of ASCII alphanumerics and `-` are used as is. Any other id
    /// is hex-encoded behind a `_` prefix, so distinct ids never share a file.
    fn log_path(&self, entity_id: &str) -> PathBuf {
        let plain = !entity_id.is_empty()
            && entity_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        let file_name = if plain {
            entity_id.to_string()
        } else {
            format!("_{}", hex::encode(entity_id))
        };
        self.base_path.join(format!("{}.jsonl.gz", file_name))
    }

    fn read_jsonl_gz(path: &Path) -> Result<Vec<Transition<S>>> {
        let file = std::fs::File::open(path).context("Failed to open transition log")?;
        let reader = std::io::BufReader::new(MultiGzDecoder::new(file));

        let mut transitions = Vec::new();
        for line in reader.lines() {
            let line = line.context("Failed to read line from transition log")?;
            if line.is_empty() {
                continue;
            }
            let transition: Transition<S> =
                serde_json::from_str(&line).context("Failed to parse transition")?;
            transitions.push(transition);
        }

        Ok(transitions)
    }

    fn append_jsonl_gz(path: &Path, transition: &Transition<S>) -> Result<()> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        let json = serde_json::to_string(transition).context("Failed to serialize transition")?;
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write transition")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
        let member = encoder.finish().context("Failed to finish compression")?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .context("Failed to open transition log for append")?;
        file.write_all(&member)
            .context("Failed to append to transition log")?;
        file.sync_data().context("Failed to sync transition log")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: Lifecycle> TransitionLog<S> for JsonlTransitionLog<S> {
    async fn append(&self, transition: Transition<S>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.log_path(&transition.entity_id);
        tokio::task::spawn_blocking(move || Self::append_jsonl_gz(&path, &transition))
            .await
            .context("Transition log writer panicked")?
    }

    async fn history(&self, entity_id: &str) -> Result<Vec<Transition<S>>> {
        let path = self.log_path(entity_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let _guard = self.write_lock.lock().await;
        tokio::task::spawn_blocking(move || Self::read_jsonl_gz(&path))
            .await
            .context("Transition log reader panicked")?
    }
}

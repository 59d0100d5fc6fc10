use std::collections::HashSet;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use anyhow::Result;

/// Topics already read in previous runs or earlier scan cycles, persisted
/// as `id | timestamp | slug` lines. The set only ever grows; fine for the
/// run lengths this tool sees.
pub struct ReadHistory {
    path: PathBuf,
    seen: HashSet<u64>,
}

impl ReadHistory {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut seen = HashSet::new();

        if let Ok(file) = fs::File::open(&path) {
            let reader = BufReader::new(file);
            for line in reader.lines() {
                let line = line?;
                if let Some(id) = line.split('|').next() {
                    if let Ok(id) = id.trim().parse() {
                        seen.insert(id);
                    }
                }
            }
        }

        Ok(Self { path, seen })
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn contains(&self, topic_id: u64) -> bool {
        self.seen.contains(&topic_id)
    }

    pub fn record(&mut self, topic_id: u64, slug: &str) -> Result<()> {
        if !self.seen.insert(topic_id) {
            return Ok(());
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(file, "{} | {} | {}", topic_id, timestamp, slug)?;
        Ok(())
    }
}

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::error::GaleError;
use crate::output::{now_us, Channel, OutputEntry, ReadQuery};

/// On-disk record framing: one JSON object per line. Self-delimiting, keeps
/// microsecond timestamps, and a reader never observes a partial record
/// because every append is a single whole-line write.
#[derive(Debug, Serialize, Deserialize)]
struct Record {
    ts_us: i64,
    line: String,
}

struct ChannelState {
    file: Option<File>,
    last_ts_us: i64,
}

struct ProcState {
    dir: PathBuf,
    sealed: bool,
    channels: HashMap<Channel, ChannelState>,
}

/// File-backed Output Store. Layout: `<root>/<process_id>/{stdout,stderr}.log`.
///
/// One writer per `(id, channel)` (the corresponding reader task) and any
/// number of concurrent readers; readers open their own handles and see a
/// consistent, monotonically growing suffix.
pub struct FileOutputStore {
    root: PathBuf,
    state: Mutex<HashMap<String, ProcState>>,
}

impl FileOutputStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Register a process id and create its backing files. Called once at
    /// spawn, before any reader task runs.
    pub async fn create(&self, process_id: &str) -> Result<(), GaleError> {
        let dir = self.root.join(process_id);
        tokio::fs::create_dir_all(&dir).await?;

        let mut channels = HashMap::new();
        for channel in Channel::ALL {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(channel.file_name()))
                .await?;
            channels.insert(
                channel,
                ChannelState {
                    file: Some(file),
                    last_ts_us: 0,
                },
            );
        }

        let mut state = self.state.lock().await;
        state.insert(
            process_id.to_string(),
            ProcState {
                dir,
                sealed: false,
                channels,
            },
        );
        Ok(())
    }

    /// Append lines to one channel, stamping each with the current time.
    /// Timestamps are clamped non-decreasing within the channel.
    pub async fn append(
        &self,
        process_id: &str,
        channel: Channel,
        lines: &[String],
    ) -> Result<(), GaleError> {
        if lines.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        let proc = state
            .get_mut(process_id)
            .ok_or_else(|| GaleError::ProcessNotFound(process_id.to_string()))?;
        if proc.sealed {
            return Err(GaleError::Storage(std::io::Error::other(
                "append to sealed log",
            )));
        }
        let chan = proc.channels.get_mut(&channel).expect("all channels exist");

        let mut buf = String::new();
        for line in lines {
            let ts_us = now_us().max(chan.last_ts_us);
            chan.last_ts_us = ts_us;
            let record = Record {
                ts_us,
                line: line.clone(),
            };
            buf.push_str(&serde_json::to_string(&record).map_err(std::io::Error::other)?);
            buf.push('\n');
        }

        let file = chan.file.as_mut().expect("unsealed log has an open file");
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read entries present at the call instant, in append order. Streaming:
    /// `tail=N` holds at most `N` entries in memory regardless of file size.
    pub async fn read(
        &self,
        process_id: &str,
        channel: Channel,
        query: &ReadQuery,
    ) -> Result<Vec<OutputEntry>, GaleError> {
        let path = {
            let state = self.state.lock().await;
            let proc = state
                .get(process_id)
                .ok_or_else(|| GaleError::ProcessNotFound(process_id.to_string()))?;
            proc.dir.join(channel.file_name())
        };

        let file = match File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut lines = BufReader::new(file).lines();
        let mut out: VecDeque<OutputEntry> = VecDeque::new();
        while let Some(raw) = lines.next_line().await? {
            // A trailing line may be mid-append; skip anything unparseable.
            let Ok(record) = serde_json::from_str::<Record>(&raw) else {
                continue;
            };
            // Records are timestamp-ordered, so everything past `until` can
            // be cut without scanning further.
            if let Some(until) = query.until_us
                && record.ts_us >= until
            {
                break;
            }
            if !query.matches(record.ts_us) {
                continue;
            }
            if let Some(tail) = query.tail {
                if tail == 0 {
                    continue;
                }
                if out.len() == tail {
                    out.pop_front();
                }
            }
            out.push_back(OutputEntry {
                ts_us: record.ts_us,
                channel,
                line: record.line,
            });
        }
        Ok(out.into())
    }

    /// Seal a process's logs: flush and close the write handles. No appends
    /// are accepted afterwards; reads continue to work until `clear`.
    pub async fn seal(&self, process_id: &str) -> Result<(), GaleError> {
        let mut state = self.state.lock().await;
        let Some(proc) = state.get_mut(process_id) else {
            return Err(GaleError::ProcessNotFound(process_id.to_string()));
        };
        proc.sealed = true;
        for chan in proc.channels.values_mut() {
            if let Some(mut file) = chan.file.take() {
                let _ = file.flush().await;
            }
        }
        Ok(())
    }

    /// Delete all channels for this process. Fails on unknown id.
    pub async fn clear(&self, process_id: &str) -> Result<(), GaleError> {
        let proc = {
            let mut state = self.state.lock().await;
            state
                .remove(process_id)
                .ok_or_else(|| GaleError::ProcessNotFound(process_id.to_string()))?
        };
        tokio::fs::remove_dir_all(&proc.dir).await?;
        Ok(())
    }

    /// Flush and release every open handle.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        for proc in state.values_mut() {
            proc.sealed = true;
            for chan in proc.channels.values_mut() {
                if let Some(mut file) = chan.file.take() {
                    let _ = file.flush().await;
                }
            }
        }
    }
}

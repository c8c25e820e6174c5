//! External oracles consulted only in `Cow` mode.
//!
//! Both are modeled as traits so tests can substitute in-memory fakes; the
//! real implementations shell out to vendor-specific tooling this crate has
//! no control over.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;

use tracing::{debug, warn};

/// Tells whether two inodes, as of two different snapshot generations, are
/// the same underlying file or a recycled inode number.
pub trait GenerationOracle: Send + Sync {
    fn generation(&self, dataset_snapshot: &str, ino: u64) -> Option<u64>;
}

/// Tells whether two same-sized files share their top-level indirect block,
/// which is sufficient proof their contents are identical.
pub trait BlockIdentityOracle: Send + Sync {
    fn block_id(&self, dataset_snapshot: &str, ino: u64) -> Option<String>;
}

struct Channel {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// A long-lived coprocess per dataset, fed one request per line, read back
/// one `<ino> <gen>` response per line. At most two channels are kept alive;
/// a third eviction drops the least-recently-used one.
pub struct ZdbGenerationOracle {
    helper: String,
    channels: Mutex<HashMap<String, Channel>>,
    lru: Mutex<Vec<String>>,
}

const MAX_CHANNELS: usize = 2;

impl ZdbGenerationOracle {
    pub fn new(helper_path: impl Into<String>) -> Self {
        Self {
            helper: helper_path.into(),
            channels: Mutex::new(HashMap::new()),
            lru: Mutex::new(Vec::new()),
        }
    }

    fn touch(&self, key: &str) {
        let mut lru = self.lru.lock().unwrap();
        lru.retain(|k| k != key);
        lru.push(key.to_string());
    }

    fn spawn(&self, dataset_snapshot: &str) -> std::io::Result<Channel> {
        let mut child = Command::new(&self.helper)
            .arg(dataset_snapshot)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = BufReader::new(child.stdout.take().expect("piped stdout"));
        Ok(Channel { child, stdin, stdout })
    }
}

impl GenerationOracle for ZdbGenerationOracle {
    fn generation(&self, dataset_snapshot: &str, ino: u64) -> Option<u64> {
        let mut channels = self.channels.lock().unwrap();
        if !channels.contains_key(dataset_snapshot) {
            if channels.len() >= MAX_CHANNELS {
                let mut lru = self.lru.lock().unwrap();
                if let Some(evict) = lru.first().cloned() {
                    debug!("evicting generation-oracle channel for {evict}");
                    lru.remove(0);
                    if let Some(mut ch) = channels.remove(&evict) {
                        let _ = ch.child.kill();
                    }
                }
            }
            match self.spawn(dataset_snapshot) {
                Ok(ch) => {
                    channels.insert(dataset_snapshot.to_string(), ch);
                }
                Err(e) => {
                    warn!("couldn't spawn generation oracle for {dataset_snapshot}: {e}");
                    return None;
                }
            }
        }
        self.touch(dataset_snapshot);
        let channel = channels.get_mut(dataset_snapshot)?;

        if writeln!(channel.stdin, "{ino}").is_err() {
            warn!("generation oracle channel for {dataset_snapshot} is gone");
            channels.remove(dataset_snapshot);
            return None;
        }
        let mut line = String::new();
        if channel.stdout.read_line(&mut line).unwrap_or(0) == 0 {
            warn!("generation oracle for {dataset_snapshot} closed unexpectedly");
            channels.remove(dataset_snapshot);
            return None;
        }
        let mut fields = line.split_whitespace();
        let resp_ino: u64 = fields.next()?.parse().ok()?;
        let r#gen: u64 = fields.next()?.parse().ok()?;
        if resp_ino != ino {
            warn!("generation oracle returned ino {resp_ino}, expected {ino}");
            return None;
        }
        Some(r#gen)
    }
}

/// A one-shot subprocess per call, e.g. `zdb -ddddd <dataset> <ino>`.
pub struct SubprocessBlockIdentityOracle {
    helper: String,
}

impl SubprocessBlockIdentityOracle {
    pub fn new(helper_path: impl Into<String>) -> Self {
        Self { helper: helper_path.into() }
    }
}

impl BlockIdentityOracle for SubprocessBlockIdentityOracle {
    fn block_id(&self, dataset_snapshot: &str, ino: u64) -> Option<String> {
        let output = Command::new(&self.helper)
            .arg(dataset_snapshot)
            .arg(ino.to_string())
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let locator = text.lines().next()?.trim();
        if locator.is_empty() { None } else { Some(locator.to_string()) }
    }
}

//! Shell stand-in for `rasterd-worker` that speaks the line protocol without PDFium.
//!
//! Behaviour is keyed on the document bytes:
//! `corrupt` fails to open, `crash!` kills the worker, `hang` never answers.
//! Anything else opens with `FAKE_PAGES` pages (default 1) and renders to a
//! tiny JPEG header. `FAKE_RENDER_DELAY` (seconds) slows every render down,
//! `FAKE_STARTUP_FAIL` makes the worker refuse to start and every launch is
//! appended to `spawns.log` next to the script.

#![allow(dead_code)]

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::PathBuf,
    time::{Duration, Instant},
};

use rasterd::{pool::PoolConfig, worker::WorkerCommand};
use tempfile::TempDir;

const SCRIPT: &str = r#"#!/bin/sh
echo $$ >> "$(dirname "$0")/spawns.log"
if [ -n "$FAKE_STARTUP_FAIL" ]; then
  printf '{"event":"startup_failed","message":"%s"}\n' "$FAKE_STARTUP_FAIL"
  exit 1
fi
echo '{"event":"ready","pid":'$$'}'
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"type":"open_document"'*)
      case "$line" in
        *'"Y29ycnVwdA=="'*) printf '{"id":%s,"outcome":{"status":"failed","kind":"open","message":"invalid xref table"}}\n' "$id" ;;
        *'"Y3Jhc2gh"'*) exit 3 ;;
        *'"aGFuZw=="'*) exec sleep 30 ;;
        *) printf '{"id":%s,"outcome":{"status":"document_opened","document":1,"page_count":%s}}\n' "$id" "${FAKE_PAGES:-1}" ;;
      esac
      ;;
    *'"type":"render_page"'*)
      if [ -n "$FAKE_RENDER_DELAY" ]; then sleep "$FAKE_RENDER_DELAY"; fi
      printf '{"id":%s,"outcome":{"status":"page_rendered","image":"/9j/4A==","width":8,"height":11}}\n' "$id"
      ;;
    *'"type":"close_document"'*)
      printf '{"id":%s,"outcome":{"status":"document_closed"}}\n' "$id"
      ;;
  esac
done
"#;

pub struct FakeWorker {
    dir: TempDir,
    script: PathBuf,
    env: Vec<(String, String)>,
}

impl FakeWorker {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let script = dir.path().join("fake-worker");
        fs::write(&script, SCRIPT).expect("write fake worker");
        let mut perms = fs::metadata(&script).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script, perms).expect("make fake worker executable");
        Self {
            dir,
            script,
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn command(&self) -> WorkerCommand {
        self.env.iter().fold(
            WorkerCommand::new(self.script.clone()),
            |command, (key, value)| command.env(key, value),
        )
    }

    /// Pool configuration with short timings, sized `min_idle`/`max_idle`/`max_total`.
    pub fn pool_config(&self, min_idle: usize, max_idle: usize, max_total: usize) -> PoolConfig {
        let mut config = PoolConfig::new(self.command());
        config.min_idle = min_idle;
        config.max_idle = max_idle;
        config.max_total = max_total;
        config.startup_timeout = Duration::from_secs(5);
        config.lease_timeout = Duration::from_secs(30);
        config.maintenance_interval = Duration::from_millis(50);
        config.spawn_backoff_initial = Duration::from_millis(50);
        config.spawn_backoff_max = Duration::from_millis(200);
        config
    }

    /// Number of processes launched from this script so far.
    pub fn spawn_count(&self) -> usize {
        fs::read_to_string(self.dir.path().join("spawns.log"))
            .map(|log| log.lines().count())
            .unwrap_or(0)
    }
}

/// Poll `check` until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

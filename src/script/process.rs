//! Node.js process spawning, IPC, and process pooling
//!
//! Every plugin process runs [`HOST_RUNNER`], which loads the plugin file
//! once and answers [`ScriptCall`]s read from stdin.

use super::schema::{ScriptCall, ScriptReply};
use super::PluginError;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

/// Loader evaluated with `node -e`; the plugin path is its first argument.
pub const HOST_RUNNER: &str = r#"
const readline = require('readline');
const path = require('path');
const { pathToFileURL } = require('url');

const pluginPath = path.resolve(process.argv[1]);
console.log = console.error;

let loaded = null;
function load() {
  if (!loaded) {
    loaded = pluginPath.endsWith('.mjs')
      ? import(pathToFileURL(pluginPath).href)
      : Promise.resolve().then(() => require(pluginPath));
  }
  return loaded.then((m) => (m && m.default && !m.options ? m.default : m));
}

function reply(msg) {
  process.stdout.write(JSON.stringify(msg) + '\n');
}

async function dispatch(call) {
  const plugin = await load();
  switch (call.op) {
    case 'options':
      return { ok: true, options: plugin.options };
    case 'resolve': {
      const result = typeof plugin.resolve === 'function'
        ? await plugin.resolve(call.request, call.response)
        : true;
      return { ok: true, result: Boolean(result) };
    }
    case 'handle':
      await plugin.handle(call.request, call.response);
      return { ok: true, request: call.request, response: call.response };
    default:
      return { ok: false, error: 'unknown op ' + call.op };
  }
}

const rl = readline.createInterface({ input: process.stdin, terminal: false });
let queue = Promise.resolve();
rl.on('line', (line) => {
  queue = queue
    .then(() => dispatch(JSON.parse(line)))
    .then(reply)
    .catch((err) => reply({ ok: false, error: String((err && err.message) || err) }));
});
rl.on('close', () => process.exit(0));
"#;

/// Represents a running Node.js plugin process
pub struct PluginProcess {
    /// Process ID
    pub pid: u32,
    /// Child process handle
    child: Child,
    /// stdin handle for writing calls
    stdin: Option<ChildStdin>,
    /// stdout handle for reading replies
    stdout: Option<BufReader<ChildStdout>>,
}

impl PluginProcess {
    /// Spawn a new Node.js host process for `plugin_path`
    pub async fn spawn(node_executable: &Path, plugin_path: &Path) -> Result<Self, PluginError> {
        let mut cmd = Command::new(node_executable);
        cmd.arg("-e")
            .arg(HOST_RUNNER)
            .arg(plugin_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true); // Prevent zombie processes

        let mut child = cmd.spawn().map_err(|e| PluginError::SpawnFailed {
            reason: format!("Failed to spawn Node.js process: {}", e),
        })?;

        let pid = child.id().ok_or_else(|| PluginError::SpawnFailed {
            reason: "Failed to get process ID".to_string(),
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(BufReader::new);

        Ok(Self {
            pid,
            child,
            stdin,
            stdout,
        })
    }

    /// Check if the process is still healthy
    pub fn is_healthy(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Write a call to the plugin's stdin
    pub async fn write_call(&mut self, call: &ScriptCall) -> Result<(), PluginError> {
        let json = call.to_json()?;

        let Some(stdin) = &mut self.stdin else {
            return Err(PluginError::IoError {
                reason: "stdin is not available".to_string(),
            });
        };

        stdin
            .write_all(json.as_bytes())
            .await
            .map_err(|e| PluginError::IoError {
                reason: format!("Failed to write to stdin: {}", e),
            })?;

        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| PluginError::IoError {
                reason: format!("Failed to write newline to stdin: {}", e),
            })?;

        stdin.flush().await.map_err(|e| PluginError::IoError {
            reason: format!("Failed to flush stdin: {}", e),
        })
    }

    /// Read a reply from the plugin's stdout
    pub async fn read_reply(&mut self) -> Result<ScriptReply, PluginError> {
        let Some(stdout) = &mut self.stdout else {
            return Err(PluginError::IoError {
                reason: "stdout is not available".to_string(),
            });
        };

        let mut line = String::new();
        stdout
            .read_line(&mut line)
            .await
            .map_err(|e| PluginError::IoError {
                reason: format!("Failed to read from stdout: {}", e),
            })?;

        if line.is_empty() {
            return Err(PluginError::IoError {
                reason: "stdout closed unexpectedly".to_string(),
            });
        }

        ScriptReply::from_json(line.trim())
    }

    /// Send a call and wait for its reply
    pub async fn call(&mut self, call: &ScriptCall) -> Result<ScriptReply, PluginError> {
        self.write_call(call).await?;
        self.read_reply().await
    }

    /// Kill the process
    pub async fn kill(&mut self) -> Result<(), PluginError> {
        self.child.kill().await.map_err(|e| PluginError::IoError {
            reason: format!("Failed to kill process: {}", e),
        })
    }
}

/// Pool of warm Node.js processes for one plugin
pub struct ProcessPool {
    node_executable: PathBuf,
    plugin_path: PathBuf,
    max_size: usize,
    processes: Arc<Mutex<VecDeque<PluginProcess>>>,
}

impl ProcessPool {
    pub fn new(node_executable: PathBuf, plugin_path: PathBuf, max_size: usize) -> Self {
        Self {
            node_executable,
            plugin_path,
            max_size,
            processes: Arc::new(Mutex::new(VecDeque::with_capacity(max_size))),
        }
    }

    /// Acquire a process from the pool (or spawn new if none available)
    pub async fn acquire(&self) -> Result<PluginProcess, PluginError> {
        let mut processes = self.processes.lock().await;

        while let Some(mut process) = processes.pop_front() {
            if process.is_healthy() {
                return Ok(process);
            }
            let _ = process.kill().await;
        }
        drop(processes);

        PluginProcess::spawn(&self.node_executable, &self.plugin_path).await
    }

    /// Release a process back to the pool
    pub async fn release(&self, process: PluginProcess) {
        let mut processes = self.processes.lock().await;

        // Past capacity the process is dropped, which kills it
        if processes.len() < self.max_size {
            processes.push_back(process);
        }
    }

    /// Shutdown all processes in the pool
    pub async fn shutdown(&self) {
        let mut processes = self.processes.lock().await;

        while let Some(mut process) = processes.pop_front() {
            let _ = process.kill().await;
        }
    }

    /// Get current pool size
    pub async fn size(&self) -> usize {
        self.processes.lock().await.len()
    }

    pub fn plugin_path(&self) -> &Path {
        &self.plugin_path
    }
}

/// Whether a `node` binary can be started; script tests skip without one.
#[cfg(test)]
pub(crate) fn node_available() -> bool {
    std::process::Command::new("node")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

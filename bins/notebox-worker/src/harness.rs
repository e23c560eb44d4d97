/// Output Capture Protocol, host side
///
/// The harness (`sandbox/harness.py`) is a fixed program baked into the
/// sandbox image. It never sees templated source: user code and the injected
/// capability objects arrive as data through the environment, and results
/// come back as one JSON event per stdout line.
///
/// User code is base64-encoded and split across `NOTEBOX_CODE_0..n`, with the
/// count in `NOTEBOX_CODE_CHUNKS`. The kernel caps a single env string at
/// `MAX_ARG_STRLEN`, so one variable cannot carry a large cell.
///
/// This module owns both directions:
/// - [`HarnessInvocation`] encodes what the harness reads
/// - [`LogDecoder`] turns the container's raw byte chunks back into events

use crate::accel::PhysicsInjection;
use crate::runtime::{LogChunk, LogStream};
use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use notebox_common::types::ExecutionOutput;

/// Bumped whenever the env contract or the event format changes
pub const HARNESS_VERSION: u32 = 2;
pub const HARNESS_PATH: &str = "/opt/notebox/harness.py";

/// Prefix of the numbered code chunk variables
pub const ENV_CODE: &str = "NOTEBOX_CODE";
pub const ENV_CODE_CHUNKS: &str = "NOTEBOX_CODE_CHUNKS";
pub const ENV_VERSION: &str = "NOTEBOX_HARNESS_VERSION";
pub const ENV_PHYSICS: &str = "NOTEBOX_PHYSICS";

/// Base64 characters per code chunk
const CODE_CHUNK_CHARS: usize = 96 * 1024;
/// Linux MAX_ARG_STRLEN, counting the trailing NUL
pub const MAX_ENV_ENTRY_BYTES: usize = 128 * 1024;
/// Total env handed to the sandbox; well under the argv+envp limit
pub const MAX_ENV_BYTES: usize = 1024 * 1024;

/// Largest single stdout line kept as one event (figures are big base64 lines)
const MAX_LINE_BYTES: usize = 32 * 1024 * 1024;
/// Raw (non-protocol) stderr kept per execution
const MAX_RAW_STDERR_BYTES: usize = 1024 * 1024;

/// Everything the harness needs for one run
#[derive(Debug, Clone)]
pub struct HarnessInvocation {
    pub code: String,
    pub physics: Option<PhysicsInjection>,
}

impl HarnessInvocation {
    pub fn new(code: impl Into<String>, physics: Option<PhysicsInjection>) -> Self {
        Self {
            code: code.into(),
            physics,
        }
    }

    pub fn command(&self) -> Vec<String> {
        vec![
            "python3".to_string(),
            "-u".to_string(),
            HARNESS_PATH.to_string(),
        ]
    }

    pub fn env(&self) -> Result<Vec<String>> {
        let encoded = general_purpose::STANDARD.encode(&self.code);
        // base64 is ASCII, every index is a char boundary
        let chunks: Vec<&str> = (0..encoded.len())
            .step_by(CODE_CHUNK_CHARS)
            .map(|start| &encoded[start..(start + CODE_CHUNK_CHARS).min(encoded.len())])
            .collect();

        let mut env = vec![
            format!("{}={}", ENV_CODE_CHUNKS, chunks.len()),
            format!("{}={}", ENV_VERSION, HARNESS_VERSION),
            "PYTHONUNBUFFERED=1".to_string(),
            "MPLBACKEND=Agg".to_string(),
            "MPLCONFIGDIR=/tmp".to_string(),
        ];
        env.extend(
            chunks
                .iter()
                .enumerate()
                .map(|(index, chunk)| format!("{}_{}={}", ENV_CODE, index, chunk)),
        );
        if let Some(physics) = &self.physics {
            let payload =
                serde_json::to_string(physics).context("Failed to encode physics injection")?;
            env.push(format!("{}={}", ENV_PHYSICS, payload));
        }

        if let Some(entry) = env.iter().find(|entry| entry.len() + 1 > MAX_ENV_ENTRY_BYTES) {
            bail!(
                "Sandbox env entry is {} bytes, limit is {}",
                entry.len() + 1,
                MAX_ENV_ENTRY_BYTES
            );
        }
        let total: usize = env.iter().map(|entry| entry.len() + 1).sum();
        if total > MAX_ENV_BYTES {
            bail!(
                "Sandbox env is {} bytes, limit is {} (code is {} bytes)",
                total,
                MAX_ENV_BYTES,
                self.code.len()
            );
        }
        Ok(env)
    }

    pub fn needs_gpu(&self) -> bool {
        self.physics.as_ref().is_some_and(PhysicsInjection::needs_gpu)
    }
}

/// Incremental decoder for one sandbox's output
///
/// - stdout is split into lines; protocol lines become their event, anything
///   else (prints that bypassed the harness) becomes a raw `stdout` event
/// - stderr is not part of the protocol; whatever the interpreter writes there
///   is coalesced into one trailing `stderr` event
#[derive(Debug, Default)]
pub struct LogDecoder {
    partial: Vec<u8>,
    raw_stderr: Vec<u8>,
    stderr_truncated: bool,
    saw_error: bool,
    emitted: usize,
}

impl LogDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the events completed by it, in order
    pub fn push(&mut self, chunk: &LogChunk) -> Vec<ExecutionOutput> {
        match chunk.stream {
            LogStream::Stdout => self.push_stdout(&chunk.bytes),
            LogStream::Stderr => {
                self.push_stderr(&chunk.bytes);
                Vec::new()
            }
        }
    }

    /// Flush what is left once the sandbox is gone
    pub fn finish(&mut self) -> Vec<ExecutionOutput> {
        let mut outputs = Vec::new();
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            outputs.extend(self.decode_line(&line));
        }
        if !self.raw_stderr.is_empty() {
            let mut text = String::from_utf8_lossy(&self.raw_stderr).into_owned();
            if self.stderr_truncated {
                text.push_str("\n[stderr truncated]\n");
            }
            self.raw_stderr.clear();
            outputs.push(ExecutionOutput::stderr(text));
        }
        outputs
    }

    /// Whether any `error` event went past
    pub fn saw_error(&self) -> bool {
        self.saw_error
    }

    /// Events decoded from stdout so far
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    fn push_stdout(&mut self, bytes: &[u8]) -> Vec<ExecutionOutput> {
        let mut outputs = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.partial);
                outputs.extend(self.decode_line(&line));
            } else {
                self.partial.push(byte);
                if self.partial.len() >= MAX_LINE_BYTES {
                    let line = std::mem::take(&mut self.partial);
                    outputs.extend(self.decode_line(&line));
                }
            }
        }
        outputs
    }

    fn push_stderr(&mut self, bytes: &[u8]) {
        let room = MAX_RAW_STDERR_BYTES.saturating_sub(self.raw_stderr.len());
        if bytes.len() > room {
            self.stderr_truncated = true;
        }
        self.raw_stderr
            .extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    fn decode_line(&mut self, line: &[u8]) -> Option<ExecutionOutput> {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end_matches('\r');
        if text.trim().is_empty() {
            return None;
        }

        let output = match serde_json::from_str::<ExecutionOutput>(text) {
            Ok(event) => event,
            Err(_) => ExecutionOutput::stdout(format!("{}\n", text)),
        };
        if output.is_error() {
            self.saw_error = true;
        }
        self.emitted += 1;
        Some(output)
    }
}

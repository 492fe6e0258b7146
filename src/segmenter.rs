//! Segmentation backends: the opaque subject/background separation step.
//!
//! The pipeline only needs `bytes → bytes with an alpha channel`. Everything
//! model-related (weights, sessions, thread caps) lives behind the
//! [`Segmenter`] trait, and one instance is shared read-only by every
//! request. Concurrency safety is the admission controller's job
//! ([`crate::pipeline::admission`]), so implementations hold no locks.
//!
//! Two backends ship with the crate:
//!
//! * [`CommandSegmenter`]: spawns a rembg-compatible CLI per call, image on
//!   stdin, PNG on stdout.
//! * [`HttpSegmenter`]: posts the image to a long-lived segmentation server
//!   that keeps the model session warm between calls.

use crate::config::SegmentationParams;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Failure reported by a segmentation backend.
#[derive(Debug, Error)]
pub enum SegmenterError {
    /// The external program could not be started.
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Talking to the external program failed mid-call.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The external program exited unsuccessfully.
    #[error("exited with {status}: {stderr}")]
    ExitStatus { status: String, stderr: String },

    /// The HTTP request failed.
    #[error("request failed: {0}")]
    Http(String),

    /// The server answered with a non-success status.
    #[error("server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The call was aborted at its deadline.
    #[error("aborted after {after_ms}ms")]
    TimedOut { after_ms: u64 },
}

/// Subject/background separation, bytes in → PNG-with-alpha bytes out.
///
/// Always called from the blocking pool, never from an async worker.
pub trait Segmenter: Send + Sync {
    /// Short backend name used in logs and errors.
    fn name(&self) -> &str;

    /// Separate the subject from the background of `input`.
    fn segment(&self, input: &[u8], params: &SegmentationParams)
        -> Result<Vec<u8>, SegmenterError>;

    /// Like [`Segmenter::segment`], but give up once `deadline` passes.
    ///
    /// Backends that hold an external resource (a child process) override
    /// this to release it on time; the default ignores the deadline.
    fn segment_until(
        &self,
        input: &[u8],
        params: &SegmentationParams,
        deadline: Option<Instant>,
    ) -> Result<Vec<u8>, SegmenterError> {
        let _ = deadline;
        self.segment(input, params)
    }
}

// ── Command backend ──────────────────────────────────────────────────────

/// Runs a rembg-compatible command line once per call.
///
/// The configured arguments are followed by the alpha-matting flags (when
/// enabled) and `- -` so the program reads stdin and writes stdout.
#[derive(Debug, Clone)]
pub struct CommandSegmenter {
    program: String,
    args: Vec<String>,
}

impl CommandSegmenter {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `rembg i -m <model>`.
    pub fn rembg(model: &str) -> Self {
        Self::new("rembg", vec!["i".into(), "-m".into(), model.into()])
    }

    /// Parse a whitespace-separated command line such as `rembg i -m u2netp`.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    fn full_args(&self, params: &SegmentationParams) -> Vec<String> {
        let mut args = self.args.clone();
        if params.alpha_matting {
            args.extend([
                "-a".to_string(),
                "-af".to_string(),
                params.foreground_threshold.to_string(),
                "-ab".to_string(),
                params.background_threshold.to_string(),
                "-ae".to_string(),
                params.erode_size.to_string(),
            ]);
        }
        args.extend(["-".to_string(), "-".to_string()]);
        args
    }
}

impl Segmenter for CommandSegmenter {
    fn name(&self) -> &str {
        &self.program
    }

    fn segment(
        &self,
        input: &[u8],
        params: &SegmentationParams,
    ) -> Result<Vec<u8>, SegmenterError> {
        self.segment_until(input, params, None)
    }

    /// Spawns the program and polls it until it exits or `deadline` passes,
    /// in which case the child is killed and reaped before returning.
    fn segment_until(
        &self,
        input: &[u8],
        params: &SegmentationParams,
        deadline: Option<Instant>,
    ) -> Result<Vec<u8>, SegmenterError> {
        let args = self.full_args(params);
        debug!("Running {} {}", self.program, args.join(" "));
        let start = Instant::now();

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SegmenterError::Spawn {
                program: self.program.clone(),
                source: e,
            })?;

        let not_captured = || SegmenterError::Io(std::io::Error::other("stdio not captured"));
        let mut stdin = child.stdin.take().ok_or_else(not_captured)?;
        let stdout = child.stdout.take().ok_or_else(not_captured)?;
        let stderr = child.stderr.take().ok_or_else(not_captured)?;

        // Pipes are serviced on detached threads: after a kill, grandchildren
        // may keep them open, and nobody should wait for that.
        let input = input.to_vec();
        let writer = thread::spawn(move || stdin.write_all(&input));
        let out_reader = thread::spawn(move || drain(stdout));
        let err_reader = thread::spawn(move || drain(stderr));

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                let after_ms = start.elapsed().as_millis() as u64;
                warn!("Killing '{}' after {}ms", self.program, after_ms);
                // Already-exited races are fine; reaping is what matters.
                let _ = child.kill();
                child.wait()?;
                return Err(SegmenterError::TimedOut { after_ms });
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stdout = join_reader(out_reader)?;
        let stderr = join_reader(err_reader)?;
        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(SegmenterError::ExitStatus {
                status: status.to_string(),
                stderr: truncate(stderr.trim(), 300),
            });
        }
        // A broken pipe only matters if the program also failed.
        if let Ok(Err(e)) = writer.join() {
            debug!("stdin write ended early: {}", e);
        }
        Ok(stdout)
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn drain(mut pipe: impl Read) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf)?;
    Ok(buf)
}

fn join_reader(
    handle: thread::JoinHandle<std::io::Result<Vec<u8>>>,
) -> Result<Vec<u8>, SegmenterError> {
    handle
        .join()
        .unwrap_or_else(|_| Err(std::io::Error::other("pipe reader panicked")))
        .map_err(SegmenterError::Io)
}

// ── HTTP backend ─────────────────────────────────────────────────────────

/// Posts the image to a segmentation server (rembg `/api/remove` compatible).
///
/// The blocking client is built on first use, which always happens on a
/// blocking-pool thread, and is then reused for every call.
pub struct HttpSegmenter {
    endpoint: String,
    model: Option<String>,
    timeout: Option<Duration>,
    client: OnceLock<reqwest::blocking::Client>,
}

impl HttpSegmenter {
    pub fn new(endpoint: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: None,
            timeout,
            client: OnceLock::new(),
        }
    }

    /// Ask the server for a specific model, e.g. `u2netp`.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    fn client(&self) -> Result<&reqwest::blocking::Client, SegmenterError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| SegmenterError::Http(e.to_string()))?;
        // A concurrent first call may have won the race; either client works.
        Ok(self.client.get_or_init(|| client))
    }

    fn query(&self, params: &SegmentationParams) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(ref model) = self.model {
            query.push(("model", model.clone()));
        }
        if params.alpha_matting {
            query.push(("a", "true".to_string()));
            query.push(("af", params.foreground_threshold.to_string()));
            query.push(("ab", params.background_threshold.to_string()));
            query.push(("ae", params.erode_size.to_string()));
        }
        query
    }
}

impl std::fmt::Debug for HttpSegmenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSegmenter")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Segmenter for HttpSegmenter {
    fn name(&self) -> &str {
        &self.endpoint
    }

    fn segment(
        &self,
        input: &[u8],
        params: &SegmentationParams,
    ) -> Result<Vec<u8>, SegmenterError> {
        let part = reqwest::blocking::multipart::Part::bytes(input.to_vec())
            .file_name("image.jpg")
            .mime_str("image/jpeg")
            .map_err(|e| SegmenterError::Http(e.to_string()))?;
        let form = reqwest::blocking::multipart::Form::new().part("file", part);

        let response = self
            .client()?
            .post(&self.endpoint)
            .query(&self.query(params))
            .multipart(form)
            .send()
            .map_err(|e| SegmenterError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(SegmenterError::Status {
                status: status.as_u16(),
                body: truncate(body.trim(), 300),
            });
        }

        let bytes = response
            .bytes()
            .map_err(|e| SegmenterError::Http(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}\u{2026}")
    }
}

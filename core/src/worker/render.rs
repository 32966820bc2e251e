// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Renderer subprocess execution and supervision.
//!
//! The child is spawned with the project directory as its working
//! directory (substituting a safe local directory for UNC-style network
//! paths), its RSS is sampled once per second, and the wall clock is
//! bounded by `frames x timeout_per_frame x renderer multiplier`. On
//! overrun the child gets a terminate signal, five seconds of grace, then
//! a kill. The renderer's exit code decides success; no progress output
//! is ever parsed.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, Signal, System};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::dispatch::FrameSpan;
use crate::worker::assets::AssetCacheStats;
use crate::worker::output::{detect_outputs, OutputInfo};
use crate::worker::renderers::RendererKind;

/// RSS sampling period.
const SAMPLE_PERIOD: Duration = Duration::from_secs(1);

/// Grace between terminate and kill on timeout.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// How much stderr is carried in a failure reason.
const STDERR_CLIP: usize = 500;

/// Everything needed to run one batch.
#[derive(Debug, Clone)]
pub struct RenderParams {
    /// Batch id, used for logging and scratch file names
    pub sub_job_id: String,
    /// Renderer kind
    pub kind: RendererKind,
    /// Renderer executable
    pub executable: PathBuf,
    /// Project file
    pub project: PathBuf,
    /// Frames to render
    pub span: FrameSpan,
    /// Extra command-line arguments from the submission
    pub extra_args: String,
    /// Per-frame budget in seconds
    pub timeout_per_frame: u64,
    /// Renderer-specific budget multiplier
    pub timeout_multiplier: f64,
}

impl RenderParams {
    /// Wall-clock budget for the whole batch.
    pub fn budget(&self) -> Duration {
        let secs =
            self.span.len() as f64 * self.timeout_per_frame as f64 * self.timeout_multiplier;
        Duration::from_secs_f64(secs.max(1.0))
    }
}

/// Measured render metrics, serialised into the completion report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderMetrics {
    /// Wall time in seconds
    pub render_time: f64,
    /// Frames in the batch (on success)
    pub frames_rendered: i64,
    /// Peak child RSS in MB
    pub memory_peak_mb: f64,
    /// Detected output files, when any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_info: Option<OutputInfo>,
    /// Worker asset-cache statistics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_stats: Option<AssetCacheStats>,
}

/// Result of one batch execution.
#[derive(Debug)]
pub struct RenderOutcome {
    /// Whether the renderer exited cleanly
    pub success: bool,
    /// Failure reason when it did not
    pub error: Option<String>,
    /// Measured metrics in both cases
    pub metrics: RenderMetrics,
}

impl RenderOutcome {
    fn failure(reason: String, render_time: f64) -> Self {
        Self {
            success: false,
            error: Some(reason),
            metrics: RenderMetrics {
                render_time,
                ..RenderMetrics::default()
            },
        }
    }
}

/// Run one render to completion.
pub async fn run_render(params: &RenderParams) -> RenderOutcome {
    let started = Instant::now();

    if !params.executable.is_file() {
        return RenderOutcome::failure(
            format!(
                "RendererUnavailable: executable not found: {}",
                params.executable.display()
            ),
            0.0,
        );
    }
    if !params.project.is_file() {
        return RenderOutcome::failure(
            format!("project file not found: {}", params.project.display()),
            0.0,
        );
    }

    let command = params.kind.build_command(
        &params.executable,
        &params.project,
        params.span,
        &params.extra_args,
    );

    let work_dir = safe_working_dir(&params.project);
    let budget = params.budget();

    debug!(
        sub_job_id = %params.sub_job_id,
        program = %command.program.display(),
        args = ?command.args,
        work_dir = %work_dir.display(),
        budget_secs = budget.as_secs(),
        "starting renderer"
    );

    let mut child = match Command::new(&command.program)
        .args(&command.args)
        .current_dir(&work_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return RenderOutcome::failure(
                format!("failed to start renderer: {e}"),
                started.elapsed().as_secs_f64(),
            );
        }
    };

    let pid = child.id();
    let stdout_task = drain_pipe(child.stdout.take());
    let stderr_task = drain_pipe(child.stderr.take());

    let mut sampler = System::new();
    let mut peak_mb = 0.0f64;
    let mut timed_out = false;
    let deadline = started + budget;

    let exit_status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "lost track of renderer process");
                break None;
            }
        }

        if let Some(pid) = pid {
            peak_mb = peak_mb.max(sample_rss_mb(&mut sampler, pid));
        }

        if Instant::now() >= deadline {
            timed_out = true;
            terminate_then_kill(&mut child, pid).await;
            break child.try_wait().ok().flatten();
        }

        tokio::time::sleep(SAMPLE_PERIOD).await;
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    let render_time = started.elapsed().as_secs_f64();

    if timed_out {
        return RenderOutcome::failure(
            format!(
                "Timeout: render exceeded {}s budget for {} frames",
                budget.as_secs(),
                params.span.len()
            ),
            render_time,
        );
    }

    match exit_status {
        Some(status) if status.success() => {
            let output_info = detect_outputs(&params.project, params.span, params.kind);
            info!(
                sub_job_id = %params.sub_job_id,
                render_time_secs = render_time,
                frames = params.span.len(),
                output_files = output_info.total_files,
                "render finished"
            );

            RenderOutcome {
                success: true,
                error: None,
                metrics: RenderMetrics {
                    render_time,
                    frames_rendered: params.span.len(),
                    memory_peak_mb: peak_mb,
                    output_info: Some(output_info),
                    cache_stats: None,
                },
            }
        }
        Some(status) => {
            let code = status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            debug!(sub_job_id = %params.sub_job_id, stdout = %clip(&stdout, STDERR_CLIP), "renderer stdout");
            RenderOutcome::failure(
                format!("RendererFailed: exit {code}: {}", clip(&stderr, STDERR_CLIP)),
                render_time,
            )
        }
        None => RenderOutcome::failure("renderer process vanished".to_string(), render_time),
    }
}

/// The project directory, unless it is a UNC-style network path the
/// platform shell cannot use as a working directory. Absolute paths in
/// the argument vector make the substitution safe.
pub fn safe_working_dir(project: &Path) -> PathBuf {
    let parent = match project.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => return std::env::temp_dir(),
    };

    let text = parent.display().to_string();
    if text.starts_with("\\\\") || text.starts_with("//") {
        return std::env::temp_dir();
    }

    parent
}

fn clip(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.trim().to_string()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end].trim())
    }
}

fn drain_pipe<R>(pipe: Option<R>) -> tokio::task::JoinHandle<String>
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buffer).await;
        }
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn sample_rss_mb(sampler: &mut System, pid: u32) -> f64 {
    let pid = Pid::from_u32(pid);
    sampler.refresh_process_specifics(pid, ProcessRefreshKind::new().with_memory());
    sampler
        .process(pid)
        .map_or(0.0, |p| p.memory() as f64 / 1024.0 / 1024.0)
}

/// Terminate, give the child a grace period, then kill.
async fn terminate_then_kill(child: &mut tokio::process::Child, pid: Option<u32>) {
    warn!("render budget exceeded, terminating child");

    let terminated = pid.map_or(false, |pid| {
        let mut sys = System::new();
        let pid = Pid::from_u32(pid);
        sys.refresh_process(pid);
        sys.process(pid)
            .and_then(|p| p.kill_with(Signal::Term))
            .unwrap_or(false)
    });

    if terminated {
        let grace_deadline = Instant::now() + TERMINATE_GRACE;
        while Instant::now() < grace_deadline {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    let _ = child.kill().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn params(executable: &Path, project: &Path, span: FrameSpan) -> RenderParams {
        RenderParams {
            sub_job_id: "j1_batch_001".to_string(),
            kind: RendererKind::Silhouette,
            executable: executable.to_path_buf(),
            project: project.to_path_buf(),
            span,
            extra_args: String::new(),
            timeout_per_frame: 60,
            timeout_multiplier: 1.0,
        }
    }

    #[test]
    fn test_budget_scales_with_frames_and_multiplier() {
        let p = RenderParams {
            timeout_per_frame: 1800,
            timeout_multiplier: 2.0,
            span: FrameSpan { start: 1, end: 10 },
            ..params(Path::new("x"), Path::new("y"), FrameSpan { start: 1, end: 10 })
        };
        assert_eq!(p.budget(), Duration::from_secs(36_000));
    }

    #[test]
    fn test_safe_working_dir_substitutes_unc_paths() {
        assert_eq!(
            safe_working_dir(Path::new("//nas/projects/shot.nk")),
            std::env::temp_dir()
        );
        assert_eq!(
            safe_working_dir(Path::new("/mnt/projects/shot.nk")),
            PathBuf::from("/mnt/projects")
        );
        assert_eq!(safe_working_dir(Path::new("shot.nk")), std::env::temp_dir());
    }

    #[test]
    fn test_clip_truncates_long_text() {
        assert_eq!(clip("short", 10), "short");
        let long = "x".repeat(600);
        let clipped = clip(&long, 500);
        assert!(clipped.len() <= 504);
        assert!(clipped.ends_with("..."));
    }

    #[tokio::test]
    async fn test_missing_executable_fails_fast() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("roto.sfx");
        std::fs::write(&project, b"").unwrap();

        let outcome = run_render(&params(Path::new("/no/such/renderer"), &project, FrameSpan {
            start: 1,
            end: 1,
        }))
        .await;

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("RendererUnavailable"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_render_reports_metrics() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("roto.sfx");
        std::fs::write(&project, b"").unwrap();

        // `echo` tolerates the Silhouette argument shape and exits 0.
        let outcome = run_render(&params(
            Path::new("/bin/echo"),
            &project,
            FrameSpan { start: 1, end: 4 },
        ))
        .await;

        assert!(outcome.success, "error: {:?}", outcome.error);
        assert_eq!(outcome.metrics.frames_rendered, 4);
        assert!(outcome.metrics.render_time >= 0.0);
        assert!(outcome.metrics.output_info.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_reports_renderer_failure() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("roto.sfx");
        std::fs::write(&project, b"").unwrap();

        let outcome = run_render(&params(
            Path::new("/bin/false"),
            &project,
            FrameSpan { start: 1, end: 1 },
        ))
        .await;

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().starts_with("RendererFailed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_terminates_child() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let project = dir.path().join("roto.sfx");
        std::fs::write(&project, b"").unwrap();

        let script = dir.path().join("slow_renderer.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut p = params(&script, &project, FrameSpan { start: 1, end: 1 });
        p.timeout_per_frame = 1;

        let started = Instant::now();
        let outcome = run_render(&p).await;

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().starts_with("Timeout"));
        // Terminated well before the 30s the child wanted.
        assert!(started.elapsed() < Duration::from_secs(15));
    }
}

// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Rendered-output detection.
//!
//! Best-effort and non-authoritative: the renderer's exit code decides
//! success; this module only reports where the frames appear to have
//! landed. Nuke projects are parsed for Write-node file declarations;
//! the other kinds currently report nothing from the project itself and
//! rely on the fallback directory scan.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::dispatch::FrameSpan;
use crate::worker::renderers::RendererKind;

/// Directories beside the project file scanned when the declared outputs
/// yield nothing.
const FALLBACK_DIRS: [&str; 4] = [".", "renders", "output", "comp"];

/// Extensions considered render output.
const IMAGE_EXTENSIONS: [&str; 7] = ["exr", "png", "jpg", "jpeg", "tif", "tiff", "dpx"];

/// At most this many file paths are carried in a report.
const MAX_REPORTED_FILES: usize = 50;

/// Detected output summary, attached to completion metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputInfo {
    /// Found files (capped at 50)
    pub files: Vec<String>,
    /// Directories holding them
    pub directories: Vec<String>,
    /// Total files found
    pub total_files: usize,
    /// Total size in MB
    pub total_size_mb: f64,
    /// The batch's frame range
    pub frame_range: String,
}

fn write_node_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?s)Write\s*\{[^}]*?file\s+"([^"\n]+)""#).expect("valid regex"))
}

/// Detect rendered frames for a finished batch.
pub fn detect_outputs(project: &Path, span: FrameSpan, kind: RendererKind) -> OutputInfo {
    let declared = declared_output_patterns(project, kind);

    let mut found: BTreeSet<PathBuf> = BTreeSet::new();
    for pattern in &declared {
        for frame in span.frames() {
            if let Some(path) = find_frame_for_pattern(pattern, frame) {
                found.insert(path);
            }
        }
    }

    // Nothing declared or nothing on disk: scan the usual suspects.
    if found.is_empty() {
        if let Some(project_dir) = project.parent() {
            for dir_name in FALLBACK_DIRS {
                let dir = if dir_name == "." {
                    project_dir.to_path_buf()
                } else {
                    project_dir.join(dir_name)
                };
                found.extend(scan_dir_for_frames(&dir, span));
            }
        }
    }

    if found.is_empty() {
        warn!(project = %project.display(), frames = %span, "no output files detected");
        return OutputInfo {
            frame_range: span.to_string(),
            ..OutputInfo::default()
        };
    }

    let total_files = found.len();
    let total_size: u64 = found
        .iter()
        .filter_map(|f| std::fs::metadata(f).ok())
        .map(|m| m.len())
        .sum();

    let directories: BTreeSet<String> = found
        .iter()
        .filter_map(|f| f.parent())
        .map(|d| d.display().to_string())
        .collect();

    debug!(total_files, "render output detected");

    OutputInfo {
        files: found
            .iter()
            .take(MAX_REPORTED_FILES)
            .map(|f| f.display().to_string())
            .collect(),
        directories: directories.into_iter().collect(),
        total_files,
        total_size_mb: total_size as f64 / 1024.0 / 1024.0,
        frame_range: span.to_string(),
    }
}

/// Output path patterns declared by the project file.
fn declared_output_patterns(project: &Path, kind: RendererKind) -> Vec<String> {
    match kind {
        RendererKind::Nuke => match std::fs::read_to_string(project) {
            Ok(content) => parse_write_nodes(&content),
            Err(e) => {
                debug!(error = %e, "could not read project for output parsing");
                Vec::new()
            }
        },
        // No project parsing for these kinds yet; the fallback scan
        // still finds frames next to the project.
        RendererKind::Silhouette | RendererKind::Fusion => Vec::new(),
    }
}

/// Extract Write-node `file "..."` declarations from a Nuke script.
pub fn parse_write_nodes(content: &str) -> Vec<String> {
    write_node_pattern()
        .captures_iter(content)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Expand the frame-number tokens in a file-name pattern.
pub fn expand_frame_tokens(name: &str, frame: i64) -> Vec<String> {
    let padded = format!("{frame:04}");
    let mut expansions = vec![
        name.replace("%04d", &padded),
        name.replace("####", &padded),
        name.replace("%d", &frame.to_string()),
        name.replace('#', &frame.to_string()),
    ];
    // Common ".NNNN.ext" suffix forms for patterns with no tokens at all.
    for ext in ["exr", "png", "jpg"] {
        expansions.push(format!("{name}.{padded}.{ext}"));
    }
    expansions.dedup();
    expansions
}

/// Probe the filesystem for one frame of a declared pattern.
fn find_frame_for_pattern(pattern: &str, frame: i64) -> Option<PathBuf> {
    let pattern_path = Path::new(pattern);
    let dir = pattern_path.parent()?;
    let name = pattern_path.file_name()?.to_str()?;

    expand_frame_tokens(name, frame)
        .into_iter()
        .map(|candidate| dir.join(candidate))
        .find(|path| path.is_file())
}

/// Scan a directory for image files whose name carries one of the batch's
/// frame numbers.
fn scan_dir_for_frames(dir: &Path, span: FrameSpan) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let padded: Vec<String> = span.frames().map(|f| format!("{f:04}")).collect();
    let bare: Vec<String> = span.frames().map(|f| f.to_string()).collect();

    entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                return false;
            };
            if !IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
                return false;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                return false;
            };
            padded.iter().any(|p| stem.contains(p.as_str()))
                || bare.iter().any(|b| stem.ends_with(b.as_str()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn span(start: i64, end: i64) -> FrameSpan {
        FrameSpan { start, end }
    }

    #[test]
    fn test_parse_write_nodes() {
        let script = r#"
Read {
 file "plate.%04d.exr"
}
Write {
 channels rgba
 file "/renders/beauty.%04d.exr"
 file_type exr
}
Write {
 file "/renders/matte.####.png"
}
"#;
        let nodes = parse_write_nodes(script);
        assert_eq!(
            nodes,
            vec!["/renders/beauty.%04d.exr", "/renders/matte.####.png"]
        );
    }

    #[test]
    fn test_expand_frame_tokens() {
        assert!(expand_frame_tokens("out.%04d.exr", 7).contains(&"out.0007.exr".to_string()));
        assert!(expand_frame_tokens("out.####.exr", 12).contains(&"out.0012.exr".to_string()));
        assert!(expand_frame_tokens("out.%d.exr", 7).contains(&"out.7.exr".to_string()));
        assert!(expand_frame_tokens("out.#.exr", 7).contains(&"out.7.exr".to_string()));
    }

    #[test]
    fn test_detect_from_declared_write_node() {
        let dir = TempDir::new().unwrap();
        let renders = dir.path().join("renders");
        std::fs::create_dir(&renders).unwrap();

        let project = dir.path().join("shot.nk");
        let script = format!(
            "Write {{\n file \"{}/beauty.%04d.exr\"\n}}\n",
            renders.display()
        );
        std::fs::write(&project, script).unwrap();

        for frame in 1..=3 {
            std::fs::write(renders.join(format!("beauty.{frame:04}.exr")), vec![0u8; 1024])
                .unwrap();
        }

        let info = detect_outputs(&project, span(1, 3), RendererKind::Nuke);
        assert_eq!(info.total_files, 3);
        assert_eq!(info.directories, vec![renders.display().to_string()]);
        assert!(info.total_size_mb > 0.0);
        assert_eq!(info.frame_range, "1-3");
    }

    #[test]
    fn test_detect_falls_back_to_sibling_scan() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("output");
        std::fs::create_dir(&output).unwrap();

        // No Write nodes at all in the project.
        let project = dir.path().join("comp.comp");
        std::fs::write(&project, "Composition {}").unwrap();

        std::fs::write(output.join("comp_0005.exr"), b"x").unwrap();
        std::fs::write(output.join("comp_0006.exr"), b"x").unwrap();
        std::fs::write(output.join("notes.txt"), b"x").unwrap();

        let info = detect_outputs(&project, span(5, 6), RendererKind::Fusion);
        assert_eq!(info.total_files, 2);
    }

    #[test]
    fn test_detect_nothing_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("shot.nk");
        std::fs::write(&project, "Write {\n file \"/nope/out.%04d.exr\"\n}").unwrap();

        let info = detect_outputs(&project, span(1, 2), RendererKind::Nuke);
        assert_eq!(info.total_files, 0);
        assert!(info.files.is_empty());
        assert_eq!(info.frame_range, "1-2");
    }
}

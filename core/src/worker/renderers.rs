// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Supported renderer kinds.
//!
//! Each kind knows its project extension, where installations usually
//! live, and how its headless render command line is shaped. The command
//! shapes match what the tools document for batch rendering:
//!
//! - Nuke: `Nuke -i -f -x -m 3 -F <start>-<end> -m 14 -V -- <project>`
//! - Silhouette: `silhouette -range <frames> <project>`
//! - Fusion: `Fusion <project> /render /start <s> /end <e>`

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::dispatch::FrameSpan;

/// A renderer invocation: program plus argument vector. Never passed
/// through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderCommand {
    /// Executable
    pub program: PathBuf,
    /// Arguments in order
    pub args: Vec<String>,
}

/// A filesystem location where a renderer may be installed.
///
/// `dir_prefix` selects versioned install directories (`Nuke15.0`,
/// `Fusion 18`); `subdir` descends into app bundles; `file_prefix`
/// matches the executable name.
#[derive(Debug, Clone)]
pub struct ProbeSpec {
    /// Directory to scan
    pub root: PathBuf,
    /// Versioned subdirectory prefix, if installs are nested
    pub dir_prefix: Option<&'static str>,
    /// Fixed path inside the matched directory (app bundles)
    pub subdir: Option<&'static str>,
    /// Executable name prefix
    pub file_prefix: &'static str,
}

/// The renderer kinds the farm dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RendererKind {
    /// Node-graph compositor
    Nuke,
    /// Roto/paint tool
    Silhouette,
    /// Flow-graph compositor
    Fusion,
}

impl RendererKind {
    /// Every supported kind.
    pub const ALL: [Self; 3] = [Self::Nuke, Self::Silhouette, Self::Fusion];

    /// Canonical lowercase name, as used in job payloads and config keys.
    pub fn name(self) -> &'static str {
        match self {
            Self::Nuke => "nuke",
            Self::Silhouette => "silhouette",
            Self::Fusion => "fusion",
        }
    }

    /// Parse a renderer name, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "nuke" => Some(Self::Nuke),
            "silhouette" => Some(Self::Silhouette),
            "fusion" => Some(Self::Fusion),
            _ => None,
        }
    }

    /// Project file extension.
    pub fn project_extension(self) -> &'static str {
        match self {
            Self::Nuke => "nk",
            Self::Silhouette => "sfx",
            Self::Fusion => "comp",
        }
    }

    /// Whether the dispatcher can textually translate paths inside this
    /// kind's project files.
    pub fn supports_script_translation(self) -> bool {
        matches!(self, Self::Nuke)
    }

    /// Install locations to probe on the current platform.
    pub fn probe_specs(self) -> Vec<ProbeSpec> {
        let spec = |root: &str,
                    dir_prefix: Option<&'static str>,
                    subdir: Option<&'static str>,
                    file_prefix: &'static str| ProbeSpec {
            root: PathBuf::from(root),
            dir_prefix,
            subdir,
            file_prefix,
        };

        match (self, std::env::consts::OS) {
            (Self::Nuke, "windows") => {
                vec![spec("C:\\Program Files", Some("Nuke"), None, "Nuke")]
            }
            (Self::Nuke, "macos") => vec![spec(
                "/Applications",
                Some("Nuke"),
                Some("Contents/MacOS"),
                "Nuke",
            )],
            (Self::Nuke, _) => vec![spec("/usr/local", Some("Nuke"), None, "Nuke")],
            (Self::Silhouette, "windows") => vec![spec(
                "C:\\Program Files\\SilhouetteFX",
                Some("Silhouette"),
                None,
                "silhouette",
            )],
            (Self::Silhouette, "macos") => vec![spec(
                "/Applications",
                Some("Silhouette"),
                Some("Contents/MacOS"),
                "Silhouette",
            )],
            (Self::Silhouette, _) => vec![spec(
                "/opt/SilhouetteFX",
                Some("Silhouette"),
                None,
                "silhouette",
            )],
            (Self::Fusion, "windows") => vec![spec(
                "C:\\Program Files\\Blackmagic Design",
                Some("Fusion"),
                None,
                "Fusion",
            )],
            (Self::Fusion, "macos") => vec![spec(
                "/Applications",
                Some("Fusion"),
                Some("Contents/MacOS"),
                "Fusion",
            )],
            (Self::Fusion, _) => vec![spec("/opt/BlackmagicDesign", Some("Fusion"), None, "Fusion")],
        }
    }

    /// Build the headless render command for one batch.
    ///
    /// `extra_args` is whitespace-split and inserted where each tool
    /// accepts user flags.
    pub fn build_command(
        self,
        executable: &Path,
        project: &Path,
        span: FrameSpan,
        extra_args: &str,
    ) -> RenderCommand {
        let extra: Vec<String> = extra_args.split_whitespace().map(String::from).collect();
        let project = project.display().to_string();

        let args = match self {
            Self::Nuke => {
                let mut args = vec![
                    "-i".to_string(),
                    "-f".to_string(),
                    "-x".to_string(),
                    "-m".to_string(),
                    "3".to_string(),
                    "-F".to_string(),
                    format!("{}-{}", span.start, span.end),
                    "-m".to_string(),
                    "14".to_string(),
                    "-V".to_string(),
                ];
                args.extend(extra);
                args.push("--".to_string());
                args.push(project);
                args
            }
            Self::Silhouette => {
                let mut args = vec!["-range".to_string(), span.to_string(), project];
                args.extend(extra);
                args
            }
            Self::Fusion => {
                let mut args = vec![
                    project,
                    "/render".to_string(),
                    "/start".to_string(),
                    span.start.to_string(),
                    "/end".to_string(),
                    span.end.to_string(),
                ];
                args.extend(extra);
                args
            }
        };

        RenderCommand {
            program: executable.to_path_buf(),
            args,
        }
    }
}

impl fmt::Display for RendererKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(start: i64, end: i64) -> FrameSpan {
        FrameSpan { start, end }
    }

    #[test]
    fn test_from_name() {
        assert_eq!(RendererKind::from_name("Nuke"), Some(RendererKind::Nuke));
        assert_eq!(
            RendererKind::from_name("FUSION"),
            Some(RendererKind::Fusion)
        );
        assert_eq!(RendererKind::from_name("blender"), None);
    }

    #[test]
    fn test_nuke_command_shape() {
        let cmd = RendererKind::Nuke.build_command(
            Path::new("/usr/local/Nuke15.0/Nuke15.0"),
            Path::new("/mnt/projects/shot.nk"),
            span(101, 110),
            "",
        );

        assert_eq!(
            cmd.args,
            vec![
                "-i", "-f", "-x", "-m", "3", "-F", "101-110", "-m", "14", "-V", "--",
                "/mnt/projects/shot.nk"
            ]
        );
    }

    #[test]
    fn test_nuke_extra_args_go_before_project() {
        let cmd = RendererKind::Nuke.build_command(
            Path::new("Nuke"),
            Path::new("shot.nk"),
            span(1, 1),
            "--gpu --cont",
        );

        let dashdash = cmd.args.iter().position(|a| a == "--").unwrap();
        let gpu = cmd.args.iter().position(|a| a == "--gpu").unwrap();
        assert!(gpu < dashdash);
        assert_eq!(cmd.args.last().unwrap(), "shot.nk");
    }

    #[test]
    fn test_silhouette_command_shape() {
        let cmd = RendererKind::Silhouette.build_command(
            Path::new("/opt/SilhouetteFX/Silhouette7/silhouette"),
            Path::new("roto.sfx"),
            span(5, 9),
            "-threads 4",
        );

        assert_eq!(
            cmd.args,
            vec!["-range", "5-9", "roto.sfx", "-threads", "4"]
        );
    }

    #[test]
    fn test_fusion_command_shape() {
        let cmd = RendererKind::Fusion.build_command(
            Path::new("Fusion"),
            Path::new("comp.comp"),
            span(1, 20),
            "",
        );

        assert_eq!(
            cmd.args,
            vec!["comp.comp", "/render", "/start", "1", "/end", "20"]
        );
    }

    #[test]
    fn test_single_frame_spans() {
        let cmd = RendererKind::Nuke.build_command(
            Path::new("Nuke"),
            Path::new("shot.nk"),
            span(7, 7),
            "",
        );
        assert!(cmd.args.contains(&"7-7".to_string()));

        let cmd = RendererKind::Silhouette.build_command(
            Path::new("silhouette"),
            Path::new("roto.sfx"),
            span(7, 7),
            "",
        );
        assert!(cmd.args.contains(&"7".to_string()));
    }
}

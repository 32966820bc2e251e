// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Best-effort project path translation.
//!
//! When a job opts in, the dispatcher copies the project file into a
//! sibling `temp_scripts/` directory and rewrites local drive prefixes in
//! Read/Write file declarations to the job's network share, so render
//! machines resolve assets over the network instead of a drive letter that
//! only exists on the submitting machine. This is a purely textual
//! transform; on any failure the original file is used unchanged.

use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Directory created next to the project file for translated copies.
pub const TEMP_SCRIPTS_DIR: &str = "temp_scripts";

fn node_file_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)(?:Read|Write)\s*\{[^}]*?file\s+"([^"\n]+)""#).expect("valid regex")
    })
}

/// Copy `original` into `temp_scripts/processed_<name>` with drive-prefixed
/// asset paths rewritten to `network_share`. Returns the translated copy's
/// path, or `None` when translation was not possible.
pub fn prepare_project_copy(original: &Path, network_share: &str) -> Option<PathBuf> {
    if network_share.trim().is_empty() {
        return None;
    }

    let parent = original.parent()?;
    let file_name = original.file_name()?.to_str()?;

    let temp_dir = parent.join(TEMP_SCRIPTS_DIR);
    if let Err(e) = fs::create_dir_all(&temp_dir) {
        warn!(error = %e, "failed to create temp_scripts directory, using original project");
        return None;
    }

    let content = match fs::read_to_string(original) {
        Ok(content) => content,
        Err(e) => {
            warn!(error = %e, path = %original.display(), "failed to read project file");
            return None;
        }
    };

    let translated = translate_drive_paths(&content, network_share);

    let processed = temp_dir.join(format!("processed_{file_name}"));
    if let Err(e) = fs::write(&processed, translated) {
        warn!(error = %e, "failed to write translated project copy");
        return None;
    }

    debug!(path = %processed.display(), "translated project copy written");
    Some(processed)
}

/// Rewrite `C:/` and `D:/` prefixes inside Read/Write file declarations to
/// the network share, normalising backslashes to forward slashes.
pub fn translate_drive_paths(content: &str, network_share: &str) -> String {
    let share = network_share.trim_end_matches('/');
    let mut result = content.to_string();

    for caps in node_file_pattern().captures_iter(content) {
        let original_path = caps[1].trim();
        if !original_path.contains(":/") {
            continue;
        }

        let new_path = original_path
            .replace("C:/", &format!("{share}/"))
            .replace("D:/", &format!("{share}/"))
            .replace('\\', "/");

        if new_path != original_path {
            result = result.replace(original_path, &new_path);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SCRIPT: &str = r#"Read {
 inputs 0
 file "C:/footage/plate.%04d.exr"
 first 1
}
Write {
 file "D:/renders/shot_v01.####.exr"
 file_type exr
}
"#;

    #[test]
    fn test_translate_rewrites_both_drives() {
        let out = translate_drive_paths(SCRIPT, "//192.168.1.100/projects");
        assert!(out.contains(r#"file "//192.168.1.100/projects/footage/plate.%04d.exr""#));
        assert!(out.contains(r#"file "//192.168.1.100/projects/renders/shot_v01.####.exr""#));
        assert!(!out.contains("C:/"));
        assert!(!out.contains("D:/"));
    }

    #[test]
    fn test_translate_leaves_relative_paths_alone() {
        let script = "Read {\n file \"footage/plate.exr\"\n}\n";
        assert_eq!(translate_drive_paths(script, "//share/projects"), script);
    }

    #[test]
    fn test_prepare_project_copy() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("shot.nk");
        std::fs::write(&project, SCRIPT).unwrap();

        let processed = prepare_project_copy(&project, "//share/projects").unwrap();
        assert_eq!(
            processed,
            dir.path().join(TEMP_SCRIPTS_DIR).join("processed_shot.nk")
        );

        let content = std::fs::read_to_string(&processed).unwrap();
        assert!(content.contains("//share/projects/footage/plate.%04d.exr"));
    }

    #[test]
    fn test_prepare_missing_file_is_best_effort() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("missing.nk");
        assert!(prepare_project_copy(&project, "//share/projects").is_none());
        assert!(prepare_project_copy(Path::new("/tmp/x.nk"), "  ").is_none());
    }
}

//! Renderer executable discovery.
//!
//! The worker resolves the renderer itself; this lookup lets the supervisor
//! warn about a missing renderer before launching and report it in `doctor`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

const ENV_VARS: &[&str] = &["AERENDER_PATH", "AE_AERENDER_PATH"];
const EXE_NAMES: &[&str] = &["aerender", "aerender.exe"];

/// Plausible renderer paths in priority order, de-duplicated, existing only.
pub fn renderer_candidates(after_effects_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();

    for var in ENV_VARS {
        if let Some(v) = std::env::var_os(var).filter(|v| !v.is_empty()) {
            candidates.push(PathBuf::from(v));
        }
    }

    if let Some(path) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path) {
            for exe in EXE_NAMES {
                candidates.push(dir.join(exe));
            }
        }
    }

    if let Some(base) = after_effects_dir {
        candidates.push(base.join("Support Files").join("aerender.exe"));
        candidates.push(base.join("Support Files").join("aerender"));
        candidates.push(base.join("aerender"));
    }

    for pattern in default_patterns() {
        match glob::glob(&pattern) {
            Ok(paths) => candidates.extend(paths.flatten()),
            Err(e) => tracing::debug!(pattern = %pattern, error = %e, "bad discovery pattern"),
        }
    }

    dedupe_existing(candidates)
}

/// Pick the renderer: an explicit path if it exists, else the first candidate.
pub fn resolve_renderer(explicit: Option<&Path>, after_effects_dir: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        tracing::warn!(path = %path.display(), "renderer override does not exist");
    }
    renderer_candidates(after_effects_dir).into_iter().next()
}

fn default_patterns() -> Vec<String> {
    if cfg!(windows) {
        let mut roots: Vec<String> = ["ProgramW6432", "ProgramFiles", "ProgramFiles(x86)"]
            .iter()
            .filter_map(|k| std::env::var(k).ok())
            .collect();
        if roots.is_empty() {
            roots = vec![
                r"C:\Program Files".to_string(),
                r"C:\Program Files (x86)".to_string(),
            ];
        }
        roots
            .iter()
            .flat_map(|r| {
                [
                    format!(r"{r}\Adobe\Adobe After Effects *\Support Files\aerender.exe"),
                    format!(r"{r}\Adobe\After Effects *\Support Files\aerender.exe"),
                ]
            })
            .collect()
    } else if cfg!(target_os = "macos") {
        vec![
            "/Applications/Adobe After Effects */aerender".to_string(),
            "/Applications/After Effects */aerender".to_string(),
        ]
    } else {
        Vec::new()
    }
}

fn dedupe_existing(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for path in paths {
        let mut key = path.to_string_lossy().to_string();
        if cfg!(windows) {
            key = key.to_lowercase();
        }
        if path.is_file() && seen.insert(key) {
            out.push(path);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_root_layout_found() {
        let dir = tempfile::tempdir().unwrap();
        let support = dir.path().join("Support Files");
        std::fs::create_dir_all(&support).unwrap();
        let exe = support.join("aerender");
        std::fs::write(&exe, b"").unwrap();

        let found = renderer_candidates(Some(dir.path()));
        assert!(found.contains(&exe));
    }

    #[test]
    fn test_dedupe_keeps_order_and_drops_missing() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"").unwrap();
        std::fs::write(&b, b"").unwrap();
        let out = dedupe_existing(vec![
            b.clone(),
            dir.path().join("missing"),
            a.clone(),
            b.clone(),
        ]);
        assert_eq!(out, vec![b, a]);
    }

    #[test]
    fn test_explicit_renderer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("my-aerender");
        std::fs::write(&exe, b"").unwrap();
        assert_eq!(resolve_renderer(Some(&exe), None), Some(exe));
    }
}

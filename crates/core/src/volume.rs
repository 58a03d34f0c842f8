//! Network volume diagnostics.
//!
//! Read-only inspection of the mounted model volume so operators can
//! confirm ComfyUI will discover their model files. Never called on the
//! request path.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Serverless mount point of the network volume.
pub const DEFAULT_VOLUME_PATH: &str = "/runpod-volume";

/// ComfyUI config that maps the volume's `models/` tree into its search paths.
pub const DEFAULT_EXTRA_MODEL_PATHS: &str = "/comfyui/extra_model_paths.yaml";

/// Model categories expected under `<volume>/models/` and the file
/// extensions ComfyUI accepts for each.
pub const MODEL_TYPES: &[(&str, &[&str])] = &[
    ("checkpoints", &[".safetensors", ".ckpt", ".pt", ".pth", ".bin"]),
    ("clip", &[".safetensors", ".pt", ".bin"]),
    ("clip_vision", &[".safetensors", ".pt", ".bin"]),
    ("configs", &[".yaml", ".json"]),
    ("controlnet", &[".safetensors", ".pt", ".pth", ".bin"]),
    ("embeddings", &[".safetensors", ".pt", ".bin"]),
    ("loras", &[".safetensors", ".pt"]),
    ("upscale_models", &[".safetensors", ".pt", ".pth"]),
    ("vae", &[".safetensors", ".pt", ".bin"]),
    ("unet", &[".safetensors", ".pt", ".bin"]),
];

/// Environment variable name fragments that may reveal an alternate mount.
const ENV_HINT_MARKERS: &[&str] = &["RUNPOD", "VOLUME", "MOUNT"];

/// Variables reported verbatim when the mount is missing.
const ENV_HINT_VARS: &[&str] = &["WORKSPACE_DIR", "HOME"];

/// Where pods (as opposed to serverless workers) mount the volume.
pub const POD_WORKSPACE_PATH: &str = "/workspace";

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// Full result of one diagnostics pass.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeReport {
    pub mount_path: PathBuf,
    pub extra_model_paths: ConfigFileCheck,
    pub mounted: bool,
    /// Volume-related environment variables, captured only when the mount is missing.
    pub env_hints: Vec<(String, String)>,
    /// Whether the pod workspace exists; only checked when the mount is missing.
    pub pod_workspace_found: bool,
    /// Working directory of the worker; only captured when the mount is missing.
    pub working_dir: Option<PathBuf>,
    pub models_dir_found: bool,
    pub categories: Vec<CategoryReport>,
    pub found_any_models: bool,
}

/// Presence (and contents) of the extra model paths config.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigFileCheck {
    pub path: PathBuf,
    pub contents: Option<String>,
}

/// Scan result for one model category directory.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryReport {
    pub category: &'static str,
    pub status: CategoryStatus,
    pub files: Vec<ModelFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "detail")]
pub enum CategoryStatus {
    Missing,
    Unreadable(String),
    Scanned,
}

/// A regular file found in a category directory.
#[derive(Debug, Clone, Serialize)]
pub struct ModelFile {
    pub name: String,
    pub size_bytes: u64,
    /// Whether ComfyUI will pick the file up (extension accepted for the category).
    pub accepted: bool,
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

/// Inspect `mount` and the extra model paths config.
///
/// Scanning stops early (empty `categories`) when the mount or its
/// `models/` directory is missing.
pub fn diagnose_volume(mount: &Path, extra_model_paths: &Path) -> VolumeReport {
    let extra_model_paths = ConfigFileCheck {
        path: extra_model_paths.to_path_buf(),
        contents: fs::read_to_string(extra_model_paths).ok(),
    };

    let mut report = VolumeReport {
        mount_path: mount.to_path_buf(),
        extra_model_paths,
        mounted: mount.is_dir(),
        env_hints: Vec::new(),
        pod_workspace_found: false,
        working_dir: None,
        models_dir_found: false,
        categories: Vec::new(),
        found_any_models: false,
    };

    if !report.mounted {
        report.env_hints = volume_env_hints();
        report.pod_workspace_found = Path::new(POD_WORKSPACE_PATH).is_dir();
        report.working_dir = std::env::current_dir().ok();
        return report;
    }

    let models_dir = mount.join("models");
    report.models_dir_found = models_dir.is_dir();
    if !report.models_dir_found {
        return report;
    }

    report.categories = MODEL_TYPES
        .iter()
        .map(|(category, extensions)| scan_category(&models_dir, category, extensions))
        .collect();
    report.found_any_models = report
        .categories
        .iter()
        .flat_map(|c| &c.files)
        .any(|f| f.accepted);

    report
}

fn scan_category(
    models_dir: &Path,
    category: &'static str,
    extensions: &[&str],
) -> CategoryReport {
    let dir = models_dir.join(category);
    if !dir.is_dir() {
        return CategoryReport {
            category,
            status: CategoryStatus::Missing,
            files: Vec::new(),
        };
    }

    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) => {
            return CategoryReport {
                category,
                status: CategoryStatus::Unreadable(e.to_string()),
                files: Vec::new(),
            }
        }
    };

    let mut files: Vec<ModelFile> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let accepted = has_accepted_extension(&name, extensions);
            Some(ModelFile {
                name,
                size_bytes: meta.len(),
                accepted,
            })
        })
        .collect();
    files.sort_by(|a, b| a.name.cmp(&b.name));

    CategoryReport {
        category,
        status: CategoryStatus::Scanned,
        files,
    }
}

fn has_accepted_extension(name: &str, extensions: &[&str]) -> bool {
    match name.rfind('.') {
        Some(idx) => {
            let ext = name[idx..].to_ascii_lowercase();
            extensions.contains(&ext.as_str())
        }
        None => false,
    }
}

fn volume_env_hints() -> Vec<(String, String)> {
    let mut hints: Vec<(String, String)> = std::env::vars()
        .filter(|(key, value)| {
            ENV_HINT_MARKERS.iter().any(|m| key.contains(m))
                || (ENV_HINT_VARS.contains(&key.as_str()) && !value.is_empty())
        })
        .collect();
    hints.sort();
    hints
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Human-readable byte size with one decimal, e.g. `1.5 GB`.
pub fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} TB")
}

impl VolumeReport {
    /// Operator-facing multi-line summary.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mount = self.mount_path.display();

        let _ = writeln!(out, "Network volume diagnostics");
        match &self.extra_model_paths.contents {
            Some(contents) => {
                let _ = writeln!(out, "  [ok]   {}", self.extra_model_paths.path.display());
                for line in contents.lines() {
                    let _ = writeln!(out, "           {line}");
                }
            }
            None => {
                let _ = writeln!(
                    out,
                    "  [miss] {} (ComfyUI will not search the volume for models)",
                    self.extra_model_paths.path.display()
                );
            }
        }

        if !self.mounted {
            let _ = writeln!(out, "  [miss] volume not mounted at {mount}");
            let _ = writeln!(
                out,
                "         attach the volume to the endpoint; only newly started workers receive it"
            );
            if self.pod_workspace_found {
                let _ = writeln!(
                    out,
                    "         {} exists (pods mount there; serverless uses {})",
                    POD_WORKSPACE_PATH, DEFAULT_VOLUME_PATH
                );
            }
            for (key, value) in &self.env_hints {
                let _ = writeln!(out, "         {key}={value}");
            }
            if let Some(dir) = &self.working_dir {
                let _ = writeln!(out, "         working directory: {}", dir.display());
            }
            return out;
        }
        let _ = writeln!(out, "  [ok]   volume mounted at {mount}");

        if !self.models_dir_found {
            let _ = writeln!(out, "  [miss] {mount}/models does not exist");
            render_expected_layout(&mut out, &mount.to_string());
            return out;
        }

        for category in &self.categories {
            match &category.status {
                CategoryStatus::Missing => {
                    let _ = writeln!(out, "  {}/: directory not found", category.category);
                }
                CategoryStatus::Unreadable(e) => {
                    let _ = writeln!(out, "  {}/: unreadable ({e})", category.category);
                }
                CategoryStatus::Scanned if category.files.is_empty() => {
                    let _ = writeln!(out, "  {}/: empty", category.category);
                }
                CategoryStatus::Scanned => {
                    let _ = writeln!(out, "  {}/:", category.category);
                    for file in &category.files {
                        let note = if file.accepted {
                            format_size(file.size_bytes)
                        } else {
                            "ignored: unsupported extension".to_string()
                        };
                        let _ = writeln!(out, "    - {} ({note})", file.name);
                    }
                }
            }
        }

        if self.found_any_models {
            let _ = writeln!(out, "  models found; ComfyUI should be able to load them");
        } else {
            let _ = writeln!(out, "  no loadable model files found on the volume");
            render_expected_layout(&mut out, &mount.to_string());
        }
        out
    }
}

fn render_expected_layout(out: &mut String, mount: &str) {
    let _ = writeln!(out, "  expected layout:");
    let _ = writeln!(out, "    {mount}/models/");
    for (category, extensions) in MODEL_TYPES {
        let _ = writeln!(out, "      {category}/  ({})", extensions.join(", "));
    }
}

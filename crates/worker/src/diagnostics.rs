//! Startup volume diagnostics.

use comfyrun_core::volume::{diagnose_volume, VolumeReport};

use crate::config::WorkerConfig;

/// Scan the configured volume off the async runtime.
pub async fn scan(config: &WorkerConfig) -> Option<VolumeReport> {
    let mount = config.volume_path.clone();
    let extra_model_paths = config.extra_model_paths.clone();

    match tokio::task::spawn_blocking(move || diagnose_volume(&mount, &extra_model_paths)).await {
        Ok(report) => Some(report),
        Err(e) => {
            tracing::error!(error = %e, "Volume diagnostics task failed");
            None
        }
    }
}

/// Scan the volume and log the report, one line per event.
pub async fn log_volume_report(config: &WorkerConfig) {
    let Some(report) = scan(config).await else {
        return;
    };

    tracing::info!(
        mount = %report.mount_path.display(),
        mounted = report.mounted,
        models_dir_found = report.models_dir_found,
        found_any_models = report.found_any_models,
        "Network volume diagnostics",
    );
    for line in report.render().lines() {
        if report.found_any_models {
            tracing::info!("{line}");
        } else {
            tracing::warn!("{line}");
        }
    }
}

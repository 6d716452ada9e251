//! Persistence of the result collection.

use crate::{common::*, postprocess::ResultCollection};

/// `<experiments_dir>/<run_name>/<image_set>_proposal_result.json`
pub fn result_path(experiments_dir: &Path, run_name: &str, image_set: &str) -> PathBuf {
    experiments_dir
        .join(run_name)
        .join(format!("{}_proposal_result.json", image_set))
}

/// Write the results as pretty printed JSON.
///
/// The file is first written next to the destination and then renamed, so a
/// failed run never leaves a truncated result file behind.
pub fn save_results(path: &Path, results: &ResultCollection) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    let tmp_path = {
        let mut name = path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        path.with_file_name(name)
    };

    let text = serde_json::to_string_pretty(results)?;
    fs::write(&tmp_path, text)?;
    fs::rename(&tmp_path, path)?;

    info!(
        "saved {} detections to '{}'",
        results.len(),
        path.display()
    );
    Ok(())
}

/// Read back a result file.
pub fn load_results(path: &Path) -> Result<ResultCollection> {
    let text = fs::read_to_string(path)?;
    let results = serde_json::from_str(&text)?;
    Ok(results)
}

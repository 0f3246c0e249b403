use std::path::{Path, PathBuf};
use std::process::Command;

use tdt_common::labels::SegTask;
use tracing::info;

use crate::error::{PipelineError, Result};

/// Produces one multilabel segmentation NIfTI per task for a given CT.
pub trait OrganSegmenter {
    /// Runs the segmenter for `task`, writing a multilabel volume aligned
    /// to `ct_nii` at `output`. `roi_subset` restricts the task to the
    /// given external class names; empty means all classes of the task.
    fn segment(
        &self,
        ct_nii: &Path,
        output: &Path,
        task: SegTask,
        roi_subset: &[String],
    ) -> Result<()>;
}

/// The TotalSegmentator command line interface.
pub struct TotalSegmentatorCli {
    pub executable: PathBuf,
}

impl OrganSegmenter for TotalSegmentatorCli {
    fn segment(
        &self,
        ct_nii: &Path,
        output: &Path,
        task: SegTask,
        roi_subset: &[String],
    ) -> Result<()> {
        info!("Running segmenter for task '{task}' -> {}", output.display());
        let mut cmd = Command::new(&self.executable);
        cmd.arg("-i")
            .arg(ct_nii)
            .arg("-o")
            .arg(output)
            .arg("--ml")
            .arg("--task")
            .arg(task.as_str());
        if !roi_subset.is_empty() {
            cmd.arg("--roi_subset");
            for name in roi_subset {
                cmd.arg(name);
            }
        }
        let status = cmd.status()?;
        if !status.success() {
            return Err(PipelineError::ToolFailed {
                tool: self.executable.display().to_string(),
                detail: format!("task '{task}' exited with {status}"),
            });
        }
        Ok(())
    }
}

use std::path::{Path, PathBuf};

use crate::services::dataset::CaseFiles;

/// Canonical filenames the model container expects in its input folder.
pub const DWI_FILENAME: &str = "dwi.nii.gz";
pub const ADC_FILENAME: &str = "adc.nii.gz";
pub const FLAIR_FILENAME: &str = "flair.nii.gz";

/// Staged, validated inputs for one inference run. Owned exclusively by the
/// pipeline task for the duration of the job and deleted afterwards.
#[derive(Debug)]
pub struct StagedCase {
    pub input_dir: PathBuf,
    pub dwi_path: PathBuf,
    pub adc_path: PathBuf,
    pub flair_path: Option<PathBuf>,
}

/// Copy the case's source files into `stage_dir` under the canonical names.
/// DWI and ADC are required; FLAIR is staged when available.
pub async fn stage_case(files: &CaseFiles, stage_dir: &Path) -> Result<StagedCase, StagingError> {
    tokio::fs::create_dir_all(stage_dir).await?;

    let dwi_source = files
        .dwi
        .as_deref()
        .ok_or(StagingError::MissingModality { modality: "DWI" })?;
    let adc_source = files
        .adc
        .as_deref()
        .ok_or(StagingError::MissingModality { modality: "ADC" })?;

    let dwi_path = materialize(dwi_source, stage_dir.join(DWI_FILENAME), "DWI").await?;
    let adc_path = materialize(adc_source, stage_dir.join(ADC_FILENAME), "ADC").await?;

    let flair_path = match files.flair.as_deref() {
        Some(source) => Some(materialize(source, stage_dir.join(FLAIR_FILENAME), "FLAIR").await?),
        None => None,
    };

    Ok(StagedCase {
        input_dir: stage_dir.to_path_buf(),
        dwi_path,
        adc_path,
        flair_path,
    })
}

async fn materialize(
    source: &Path,
    dest: PathBuf,
    modality: &'static str,
) -> Result<PathBuf, StagingError> {
    match tokio::fs::copy(source, &dest).await {
        Ok(_) => Ok(dest),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(StagingError::MissingModality { modality })
        }
        Err(err) => Err(err.into()),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    /// User input problem: the case lacks a file inference cannot run without.
    #[error("required {modality} file is missing for this case")]
    MissingModality { modality: &'static str },

    #[error("staging io error: {0}")]
    Io(#[from] std::io::Error),
}

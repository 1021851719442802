use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

/// Source files discovered for one dataset case. Required modalities are
/// still `Option` here; staging enforces what inference actually needs.
#[derive(Debug, Clone, Default)]
pub struct CaseFiles {
    pub dwi: Option<PathBuf>,
    pub adc: Option<PathBuf>,
    pub flair: Option<PathBuf>,
    pub ground_truth: Option<PathBuf>,
}

/// Read-only view over the local dataset root, one directory per case with
/// BIDS-style suffixed NIfTI files (e.g. `sub-stroke0001_dwi.nii.gz`).
pub struct CaseCatalog {
    root: PathBuf,
}

impl CaseCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sorted case ids, one per subdirectory of the dataset root. A dataset
    /// root that does not exist yet reads as an empty catalog.
    pub async fn list_case_ids(&self) -> Result<Vec<String>, CatalogError> {
        let mut cases = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(cases),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    cases.push(name.to_string());
                }
            }
        }
        cases.sort();
        Ok(cases)
    }

    /// Resolve the modality files for one case by filename suffix.
    pub async fn case_files(&self, case_id: &str) -> Result<CaseFiles, CatalogError> {
        if !is_safe_component(case_id) {
            return Err(CatalogError::InvalidCaseId(case_id.to_string()));
        }
        let dir = self.root.join(case_id);
        let meta = tokio::fs::metadata(&dir)
            .await
            .map_err(|_| CatalogError::UnknownCase(case_id.to_string()))?;
        if !meta.is_dir() {
            return Err(CatalogError::UnknownCase(case_id.to_string()));
        }

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();

        let mut files = CaseFiles::default();
        for name in names {
            let path = dir.join(&name);
            match classify_modality(&name) {
                Some(Modality::Dwi) => files.dwi.get_or_insert(path),
                Some(Modality::Adc) => files.adc.get_or_insert(path),
                Some(Modality::Flair) => files.flair.get_or_insert(path),
                Some(Modality::GroundTruth) => files.ground_truth.get_or_insert(path),
                None => continue,
            };
        }
        Ok(files)
    }
}

enum Modality {
    Dwi,
    Adc,
    Flair,
    GroundTruth,
}

fn classify_modality(name: &str) -> Option<Modality> {
    if !name.ends_with(".nii.gz") {
        return None;
    }
    if name.ends_with("_dwi.nii.gz") || name == "dwi.nii.gz" {
        Some(Modality::Dwi)
    } else if name.ends_with("_adc.nii.gz") || name == "adc.nii.gz" {
        Some(Modality::Adc)
    } else if name.ends_with("_flair.nii.gz") || name == "flair.nii.gz" {
        Some(Modality::Flair)
    } else if name.ends_with("_lesion_mask.nii.gz")
        || name.ends_with("_lesion-msk.nii.gz")
        || name.ends_with("_msk.nii.gz")
        || name == "lesion_msk.nii.gz"
    {
        Some(Modality::GroundTruth)
    } else {
        None
    }
}

fn is_safe_component(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

const HUB_BASE_URL: &str = "https://huggingface.co";

/// Minimal Hugging Face Hub client used to pull missing case files into the
/// local dataset root at startup.
pub struct HubClient {
    http: reqwest::Client,
    base_url: String,
    dataset_id: String,
    revision: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    #[serde(rename = "type")]
    kind: String,
    path: String,
}

impl HubClient {
    pub fn new(
        dataset_id: impl Into<String>,
        revision: impl Into<String>,
        token: Option<String>,
    ) -> Result<Self, CatalogError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("stroke-seg-api/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: HUB_BASE_URL.to_string(),
            dataset_id: dataset_id.into(),
            revision: revision.into(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    /// Point the client at a different Hub endpoint, e.g. a mirror.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Paths of every file in the dataset repo at the pinned revision.
    pub async fn list_files(&self) -> Result<Vec<String>, CatalogError> {
        let url = format!(
            "{}/api/datasets/{}/tree/{}?recursive=true",
            self.base_url, self.dataset_id, self.revision
        );
        let mut request = self.http.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let entries: Vec<TreeEntry> = request.send().await?.error_for_status()?.json().await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.kind == "file")
            .map(|e| e.path)
            .collect())
    }

    /// Download one repo file to `dest`, creating parent directories.
    pub async fn download_to(&self, repo_path: &str, dest: &Path) -> Result<(), CatalogError> {
        let url = format!(
            "{}/datasets/{}/resolve/{}/{}",
            self.base_url, self.dataset_id, self.revision, repo_path
        );
        let mut request = self.http.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let bytes = request.send().await?.error_for_status()?.bytes().await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }
}

/// Mirror `{case_id}/{file}.nii.gz` entries from the Hub repo into the local
/// dataset root, skipping files already present. Returns how many files were
/// fetched. Remote paths are constrained to plain two-component relative
/// paths before they touch the filesystem.
pub async fn sync_from_hub(catalog: &CaseCatalog, hub: &HubClient) -> Result<usize, CatalogError> {
    let mut downloaded = 0;
    for repo_path in hub.list_files().await? {
        if !repo_path.ends_with(".nii.gz") {
            continue;
        }
        let rel = Path::new(&repo_path);
        let components: Vec<_> = rel.components().collect();
        if components.len() != 2
            || !components
                .iter()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(CatalogError::UnsafePath(repo_path));
        }
        let dest = catalog.root().join(rel);
        if tokio::fs::try_exists(&dest).await? {
            continue;
        }
        tracing::info!(path = %repo_path, "Fetching case file from hub");
        hub.download_to(&repo_path, &dest).await?;
        downloaded += 1;
    }
    Ok(downloaded)
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("unknown case: {0}")]
    UnknownCase(String),

    #[error("invalid case id: {0}")]
    InvalidCaseId(String),

    #[error("dataset directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error("hub request failed: {0}")]
    Hub(#[from] reqwest::Error),

    #[error("hub returned unsafe path: {0}")]
    UnsafePath(String),
}

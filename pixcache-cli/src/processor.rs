use std::collections::HashSet;
use std::path::Path;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use pixcache_engine::{CropTransform, FetchOptions, FetchedImage, ImageFetcher, Priority};
use tracing::{error, info};
use url::Url;

use crate::error::AppError;
use crate::utils::progress::ProgressManager;
use crate::utils::{create_dirs, format_bytes, output_file_name};

/// How every input is fetched
pub struct FetchPlan<'a> {
    pub priority: Priority,
    pub crop: Option<CropTransform>,
    pub output_dir: Option<&'a Path>,
}

/// Outcome counts of one run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub hits: usize,
    pub misses: usize,
    pub failed: usize,
}

impl Summary {
    pub fn total(&self) -> usize {
        self.hits + self.misses + self.failed
    }
}

/// Drop repeated inputs, keeping the first occurrence of each
pub fn dedup_inputs(inputs: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    inputs
        .iter()
        .map(|input| input.trim())
        .filter(|input| !input.is_empty() && seen.insert(*input))
        .map(str::to_owned)
        .collect()
}

/// Fetch every input concurrently through the cache and report each outcome
pub async fn process_inputs(
    fetcher: &ImageFetcher,
    inputs: &[String],
    plan: &FetchPlan<'_>,
    progress: &ProgressManager,
) -> Result<Summary, AppError> {
    let inputs = dedup_inputs(inputs);
    if inputs.is_empty() {
        return Ok(Summary::default());
    }

    let inputs_len = inputs.len();
    info!(
        inputs_count = inputs_len,
        "Fetching {} image{}",
        inputs_len,
        if inputs_len == 1 { "" } else { "s" }
    );

    if let Some(dir) = plan.output_dir {
        create_dirs(dir).await?;
    }

    let mut pending: FuturesUnordered<_> = inputs
        .iter()
        .enumerate()
        .map(|(index, input)| async move {
            let mut options = FetchOptions::new().priority(plan.priority);
            if let Some(crop) = plan.crop {
                options = options.transform(crop);
            }
            if !progress.is_disabled() {
                let progress = progress.clone();
                let input = input.clone();
                options = options.on_progress(move |received, expected, _url| {
                    progress.update(&input, received, expected);
                });
            }
            let result = fetcher.fetch_async(input, options).await;
            (index + 1, input, result)
        })
        .collect();

    let mut summary = Summary::default();
    while let Some((index, input, result)) = pending.next().await {
        match result {
            Ok(image) => {
                let status = if image.from_cache { "HIT" } else { "MISS" };
                progress.finish(input, format!("{status} {input}"));
                info!(
                    url = %input,
                    size = %format_bytes(image.bytes.len() as u64),
                    "{status}"
                );
                if image.from_cache {
                    summary.hits += 1;
                } else {
                    summary.misses += 1;
                }

                if let Some(dir) = plan.output_dir {
                    if let Err(e) = write_image(dir, index, input, &image, plan.crop.is_some()).await
                    {
                        error!(url = %input, error = %e, "Failed to write image");
                        summary.failed += 1;
                    }
                }
            }
            Err(e) => {
                progress.finish(input, format!("FAILED {input}"));
                error!(url = %input, error = %e, "Fetch failed");
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}

async fn write_image(
    dir: &Path,
    index: usize,
    input: &str,
    image: &FetchedImage,
    cropped: bool,
) -> Result<(), AppError> {
    let url = Url::parse(input).map_err(|e| AppError::InvalidInput(e.to_string()))?;
    let path = dir.join(output_file_name(index, &url, cropped));
    tokio::fs::write(&path, &image.bytes).await?;
    info!(path = %path.display(), "Wrote image");
    Ok(())
}

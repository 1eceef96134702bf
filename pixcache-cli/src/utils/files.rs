use std::path::Path;

use url::Url;

use crate::error::AppError;

/// Creates all directories in the given path, including parent directories if they don't exist.
#[inline]
pub async fn create_dirs(path: &Path) -> Result<(), AppError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(AppError::Io)?;
    Ok(())
}

/// File name for the image fetched from `url`.
///
/// Uses the last path segment (truncated to keep names short) prefixed with the
/// input's position so duplicate names from different hosts do not collide. Cropped
/// images are always PNG.
pub fn output_file_name(index: usize, url: &Url, cropped: bool) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut s| s.next_back())
        .filter(|s| !s.is_empty())
        .unwrap_or("image");

    let (stem, extension) = match segment.rfind('.') {
        Some(pos) if pos > 0 => (&segment[..pos], Some(&segment[pos + 1..])),
        _ => (segment, None),
    };

    // we dont want large filenames
    let stem: String = stem
        .chars()
        .take(40)
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();

    let extension = if cropped {
        "png"
    } else {
        extension.unwrap_or("img")
    };
    format!("{index:03}_{stem}.{extension}")
}

use url::Url;

/// Name to save a URL under: the last non-empty path segment, or a
/// generated `download_<uuid>` when the path has none.
pub fn filename_from_url(url_str: &str) -> Result<String, url::ParseError> {
    let url = Url::parse(url_str)?;

    if let Some(segments) = url.path_segments() {
        if let Some(filename) = segments.filter(|s| !s.is_empty()).last() {
            return Ok(filename.to_string());
        }
    }

    Ok(format!("download_{}", uuid::Uuid::new_v4()))
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(
        |c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_',
        "_",
    )
}

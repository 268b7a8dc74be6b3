use url::Url;

pub fn get_filename_from_url(url: &Url) -> Option<String> {
    url.path_segments()
        .and_then(|mut segments| segments.next_back().map(str::to_string))
        .filter(|name| !name.is_empty())
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}

/// Extension of the last path segment, sanitized, without the dot.
pub fn extension_from_url(url: &Url) -> Option<String> {
    let filename = get_filename_from_url(url)?;
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 8 {
        return None;
    }
    Some(sanitize_filename(&ext.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_extension() {
        let url = Url::parse("https://img.example.org/board/src/1234.webm?x=1").unwrap();
        assert_eq!(get_filename_from_url(&url).as_deref(), Some("1234.webm"));
        assert_eq!(extension_from_url(&url).as_deref(), Some("webm"));
    }

    #[test]
    fn no_extension_for_bare_paths() {
        let url = Url::parse("https://example.org/files/").unwrap();
        assert_eq!(extension_from_url(&url), None);
        let url = Url::parse("https://example.org/.hidden").unwrap();
        assert_eq!(extension_from_url(&url), None);
    }

    #[test]
    fn sanitizes_odd_characters() {
        assert_eq!(sanitize_filename("a b/c?.apk"), "a_b_c_.apk");
    }
}

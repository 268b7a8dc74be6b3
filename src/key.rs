use std::fmt;

use url::Url;

use crate::error::EnqueueError;

/// Identity of a download: the normalized URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DownloadKey(Url);

impl DownloadKey {
    /// Normalizes `raw` (scheme and host case, default port, fragment) into a key.
    pub fn parse(raw: &str) -> Result<Self, EnqueueError> {
        let mut url = Url::parse(raw.trim())
            .map_err(|e| EnqueueError::InvalidArgument(format!("invalid url {:?}: {}", raw, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(EnqueueError::InvalidArgument(format!(
                "unsupported scheme {:?}",
                url.scheme()
            )));
        }
        url.set_fragment(None);
        Ok(Self(url))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn url(&self) -> &Url {
        &self.0
    }
}

impl fmt::Display for DownloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl AsRef<str> for DownloadKey {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equivalent_urls_share_a_key() {
        let a = DownloadKey::parse("HTTPS://Example.org:443/media/a.jpg#frag").unwrap();
        let b = DownloadKey::parse("https://example.org/media/a.jpg").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "https://example.org/media/a.jpg");
    }

    #[test]
    fn query_is_part_of_identity() {
        let a = DownloadKey::parse("https://example.org/a.jpg?size=1").unwrap();
        let b = DownloadKey::parse("https://example.org/a.jpg?size=2").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_garbage_and_foreign_schemes() {
        assert!(matches!(
            DownloadKey::parse("not a url"),
            Err(EnqueueError::InvalidArgument(_))
        ));
        assert!(DownloadKey::parse("ftp://example.org/a.jpg").is_err());
    }
}

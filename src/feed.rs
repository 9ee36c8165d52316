// feed_ingestor/src/feed.rs
// Retrieval and decompression of the raw feed bytes.

use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use reqwest::{Client, StatusCode};
use tracing::{debug, info};
use url::Url;

use crate::error::{IngestorError, Result};
use crate::retry::{execute_with_retry, permanent_error, transient_error};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(600,);
const USER_AGENT: &str = concat!("feed-ingestor/", env!("CARGO_PKG_VERSION"));
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Where the raw feed bytes come from.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, location: &str,) -> Result<Bytes,>;
}

#[derive(Debug, Clone, PartialEq, Eq,)]
enum FeedLocation {
    Remote(Url,),
    Local(PathBuf,),
}

fn parse_location(location: &str,) -> Result<FeedLocation,> {
    match Url::parse(location,) {
        Ok(url,) if matches!(url.scheme(), "http" | "https") => Ok(FeedLocation::Remote(url,),),
        Ok(url,) if url.scheme() == "file" => url.to_file_path().map(FeedLocation::Local,).map_err(|_| {
            IngestorError::ConfigurationError(format!("Invalid file URL: {}", location),)
        },),
        Ok(url,) => Err(IngestorError::ConfigurationError(format!(
            "Unsupported feed URL scheme '{}'",
            url.scheme()
        ),),),
        Err(url::ParseError::RelativeUrlWithoutBase,) => {
            Ok(FeedLocation::Local(PathBuf::from(location,),),)
        },
        Err(e,) => Err(IngestorError::ConfigurationError(format!(
            "Invalid feed URL '{}': {}",
            location, e
        ),),),
    }
}

/// Fetches feeds over HTTP(S), or from disk for `file://` URLs and plain paths.
pub struct HttpFeedSource {
    client: Client,
}

impl HttpFeedSource {
    pub fn new(timeout: Duration,) -> Result<Self,> {
        let client = Client::builder()
            .timeout(timeout,)
            .user_agent(USER_AGENT,)
            .build()
            .map_err(|e| IngestorError::ConfigurationError(format!("Failed to build HTTP client: {}", e),),)?;
        Ok(Self { client, },)
    }

    async fn fetch_remote(&self, url: &Url,) -> Result<Bytes,> {
        execute_with_retry(|| {
            let client = self.client.clone();
            let url = url.clone();
            async move {
                let response = client.get(url.clone(),).send().await.map_err(|e| {
                    let err = IngestorError::FetchError(format!("Request to {} failed: {}", url, e),);
                    if e.is_timeout() || e.is_connect() || e.is_request() {
                        transient_error(err,)
                    } else {
                        permanent_error(err,)
                    }
                },)?;

                let status = response.status();
                if !status.is_success() {
                    let err =
                        IngestorError::FetchError(format!("GET {} returned HTTP {}", url, status),);
                    return Err(
                        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                            transient_error(err,)
                        } else {
                            permanent_error(err,)
                        },
                    );
                }

                response.bytes().await.map_err(|e| {
                    transient_error(IngestorError::FetchError(format!(
                        "Failed to read body from {}: {}",
                        url, e
                    ),),)
                },)
            }
        },)
        .await
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch(&self, location: &str,) -> Result<Bytes,> {
        let bytes = match parse_location(location,)? {
            FeedLocation::Remote(url,) => self.fetch_remote(&url,).await?,
            FeedLocation::Local(path,) => Bytes::from(tokio::fs::read(&path,).await?,),
        };
        info!("Fetched {} bytes from {}", bytes.len(), location);
        Ok(bytes,)
    }
}

/// A feed is treated as gzip when its location ends in `.gz` or its content starts with the
/// gzip magic number.
pub fn is_gzip(location: &str, content: &[u8],) -> bool {
    let path = location.split(['?', '#',],).next().unwrap_or(location,);
    path.ends_with(".gz",) || content.starts_with(&GZIP_MAGIC,)
}

pub fn decompress_gzip(data: &[u8],) -> Result<Vec<u8,>,> {
    let mut decoder = GzDecoder::new(data,);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed,).map_err(|e| {
        IngestorError::DecompressError(format!("The gzip stream was incomplete or corrupt: {}", e),)
    },)?;
    debug!("Decompressed {} -> {} bytes", data.len(), decompressed.len());
    Ok(decompressed,)
}

/// Fetches `location` and inflates it when it looks gzip-compressed.
pub async fn load_feed(source: &dyn FeedSource, location: &str,) -> Result<Bytes,> {
    let raw = source.fetch(location,).await?;
    if !is_gzip(location, &raw,) {
        return Ok(raw,);
    }

    let inflated = tokio::task::spawn_blocking(move || decompress_gzip(&raw,),)
        .await
        .map_err(|e| IngestorError::Other(format!("Decompression task failed: {}", e),),)??;
    Ok(Bytes::from(inflated,),)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    fn gzip(data: &[u8],) -> Vec<u8,> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default(),);
        encoder.write_all(data,).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn gzip_detection() {
        assert!(is_gzip("https://feeds.example.com/jobs.xml.gz", b"<jobs/>"));
        assert!(is_gzip("https://feeds.example.com/jobs.xml.gz?token=abc", b"<jobs/>"));
        assert!(is_gzip("https://feeds.example.com/export", &[0x1f, 0x8b, 0x08]));
        assert!(!is_gzip("https://feeds.example.com/jobs.xml", b"<jobs/>"));
    }

    #[test]
    fn decompresses_and_rejects_truncated_streams() {
        let xml = b"<jobs><job><id>1</id></job></jobs>";
        let compressed = gzip(xml,);
        assert_eq!(decompress_gzip(&compressed,).unwrap(), xml.to_vec());

        let truncated = &compressed[..compressed.len() / 2];
        assert!(matches!(
            decompress_gzip(truncated),
            Err(IngestorError::DecompressError(_))
        ));
    }

    #[test]
    fn location_parsing() {
        assert!(matches!(
            parse_location("https://feeds.example.com/jobs.xml"),
            Ok(FeedLocation::Remote(_))
        ));
        assert_eq!(
            parse_location("feeds/jobs.xml").unwrap(),
            FeedLocation::Local(PathBuf::from("feeds/jobs.xml"))
        );
        assert!(matches!(parse_location("ftp://example.com/jobs.xml"), Err(IngestorError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn loads_local_gzip_feed() {
        let xml = b"<jobs><job><id>1</id></job></jobs>";
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.xml.gz",);
        std::fs::write(&path, gzip(xml,),).unwrap();

        let source = HttpFeedSource::new(DEFAULT_FETCH_TIMEOUT,).unwrap();
        let content = load_feed(&source, path.to_str().unwrap(),).await.unwrap();
        assert_eq!(&content[..], &xml[..]);

        let plain = dir.path().join("feed.xml",);
        std::fs::write(&plain, xml,).unwrap();
        let url = Url::from_file_path(&plain,).unwrap();
        let content = load_feed(&source, url.as_str(),).await.unwrap();
        assert_eq!(&content[..], &xml[..]);
    }
}

//! Sources of experiment configuration documents.
use std::{
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

use reqwest::{
    header::{ETAG, IF_NONE_MATCH},
    StatusCode,
};
use url::Url;

use crate::{Error, Result};

/// Something that produces configuration documents for the [`Registry`](crate::Registry).
pub trait ConfigSource {
    /// Fetch the current configuration document.
    ///
    /// Returns `Ok(None)` if the document has not changed since the previous successful fetch.
    fn fetch(&mut self) -> Result<Option<Vec<u8>>>;
}

impl<T: ConfigSource + ?Sized> ConfigSource for Box<T> {
    fn fetch(&mut self) -> Result<Option<Vec<u8>>> {
        (**self).fetch()
    }
}

/// Reads configuration from a JSON file, re-reading it only when its modification time or size
/// changes.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    last_seen: Option<(SystemTime, u64)>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> FileSource {
        FileSource {
            path: path.into(),
            last_seen: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileSource {
    fn fetch(&mut self) -> Result<Option<Vec<u8>>> {
        let metadata = fs::metadata(&self.path)?;
        let seen = (metadata.modified()?, metadata.len());
        if self.last_seen == Some(seen) {
            return Ok(None);
        }

        log::debug!(target: "assignd", path:display = self.path.display(); "reading configuration file");
        let contents = fs::read(&self.path)?;
        self.last_seen = Some(seen);
        Ok(Some(contents))
    }
}

/// Fetches configuration from an HTTP endpoint.
///
/// Uses `ETag`/`If-None-Match` so unchanged documents are not transferred again.
pub struct HttpSource {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    url: Url,
    token: Option<String>,
    etag: Option<String>,
    /// If we receive a 401 Unauthorized error during a request, the token is not valid. We cache
    /// this error so we don't issue additional requests to the server.
    unauthorized: bool,
}

impl HttpSource {
    /// Create a source for `url`, optionally authenticating with a bearer `token`.
    ///
    /// Must not be called from within an async runtime.
    pub fn new(url: &str, token: Option<String>) -> Result<HttpSource> {
        let url = Url::parse(url).map_err(Error::InvalidUrl)?;
        Ok(HttpSource {
            client: reqwest::blocking::Client::new(),
            url,
            token,
            etag: None,
            unauthorized: false,
        })
    }
}

impl ConfigSource for HttpSource {
    fn fetch(&mut self) -> Result<Option<Vec<u8>>> {
        if self.unauthorized {
            return Err(Error::Unauthorized);
        }

        log::debug!(target: "assignd", url:display = self.url; "fetching configuration");
        let mut request = self.client.get(self.url.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(etag) = &self.etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        let response = request.send()?;

        if response.status() == StatusCode::NOT_MODIFIED {
            log::debug!(target: "assignd", "configuration not modified");
            return Ok(None);
        }

        let response = response.error_for_status().map_err(|err| {
            if err.status() == Some(StatusCode::UNAUTHORIZED) {
                log::warn!(target: "assignd", "config source is not authorized. Check your token");
                self.unauthorized = true;
                Error::Unauthorized
            } else {
                log::warn!(target: "assignd", "received non-200 response while fetching configuration: {err:?}");
                Error::from(err)
            }
        })?;

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes()?.to_vec();
        self.etag = etag;

        log::debug!(target: "assignd", "successfully fetched configuration");
        Ok(Some(body))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs::{self, File},
        net::SocketAddr,
        time::{Duration, SystemTime},
    };

    use axum::{
        http::{
            header::{AUTHORIZATION, ETAG, IF_NONE_MATCH},
            HeaderMap, StatusCode,
        },
        response::{IntoResponse, Response},
        routing::get,
        Router,
    };

    use crate::Error;

    use super::{ConfigSource, FileSource, HttpSource};

    const DOCUMENT: &str = r#"{"experiments": []}"#;

    #[test]
    fn file_source_reads_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiments.json");
        fs::write(&path, DOCUMENT).unwrap();

        let mut source = FileSource::new(&path);
        assert_eq!(source.fetch().unwrap().as_deref(), Some(DOCUMENT.as_bytes()));
        assert_eq!(source.fetch().unwrap(), None);

        fs::write(&path, "[]").unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(10))
            .unwrap();
        assert_eq!(source.fetch().unwrap().as_deref(), Some(&b"[]"[..]));
    }

    #[test]
    fn file_source_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = FileSource::new(dir.path().join("missing.json"));
        assert!(matches!(source.fetch(), Err(Error::Io(_))));
    }

    #[test]
    fn http_source_rejects_invalid_url() {
        assert!(matches!(
            HttpSource::new("not a url", None),
            Err(Error::InvalidUrl(_))
        ));
    }

    async fn config_endpoint(headers: HeaderMap) -> Response {
        if headers.get(AUTHORIZATION).map(|v| v.as_bytes()) != Some(b"Bearer secret") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        if headers.get(IF_NONE_MATCH).map(|v| v.as_bytes()) == Some(b"\"v1\"") {
            return StatusCode::NOT_MODIFIED.into_response();
        }
        ([(ETAG, "\"v1\"")], DOCUMENT).into_response()
    }

    fn serve() -> (SocketAddr, tokio::runtime::Runtime) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let listener = runtime
            .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Router::new().route("/config", get(config_endpoint));
        runtime.spawn(async move { axum::serve(listener, router).await });
        (addr, runtime)
    }

    #[test]
    fn http_source_uses_etag() {
        let (addr, _runtime) = serve();
        let mut source =
            HttpSource::new(&format!("http://{addr}/config"), Some("secret".into())).unwrap();

        assert_eq!(source.fetch().unwrap().as_deref(), Some(DOCUMENT.as_bytes()));
        assert_eq!(source.fetch().unwrap(), None);
    }

    #[test]
    fn http_source_caches_unauthorized() {
        let (addr, runtime) = serve();
        let mut source =
            HttpSource::new(&format!("http://{addr}/config"), Some("wrong".into())).unwrap();

        assert!(matches!(source.fetch(), Err(Error::Unauthorized)));
        // No further requests are made, even once the server is gone.
        drop(runtime);
        assert!(matches!(source.fetch(), Err(Error::Unauthorized)));
    }
}

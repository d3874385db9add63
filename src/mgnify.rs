use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, warn};

use crate::catalog::Page;
use crate::domain::Lineage;
use crate::error::HarvestError;

pub const MGNIFY_BASE_URL: &str = "https://www.ebi.ac.uk/metagenomics/api/v1";

#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub timeout: Duration,
    pub retries: u32,
    pub rate_limit_backoff: Duration,
    pub retry_backoff: Duration,
    pub pace: Duration,
    pub user_agent: String,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            retries: 5,
            rate_limit_backoff: Duration::from_secs(3),
            retry_backoff: Duration::from_secs(1),
            pace: Duration::from_millis(50),
            user_agent: format!("biom-harvester/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

pub struct TransportResponse {
    pub status: u16,
    pub body: Box<dyn Read>,
}

/// Raw GET seam under the retry policy. Implemented by the real
/// reqwest transport and by in-memory fakes in tests.
pub trait Transport: Send + Sync {
    fn get(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<TransportResponse, HarvestError>;
}

#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(options: &HttpOptions) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&options.user_agent)
                .map_err(|err| HarvestError::HttpClient(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(options.timeout)
            .build()
            .map_err(|err| HarvestError::HttpClient(err.to_string()))?;
        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    fn get(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<TransportResponse, HarvestError> {
        let response = self
            .client
            .get(url)
            .query(params)
            .send()
            .map_err(|err| HarvestError::ApiRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        Ok(TransportResponse {
            status: response.status().as_u16(),
            body: Box::new(response),
        })
    }
}

/// Catalog access as the orchestrator sees it: one page fetch, one file
/// download, both already wrapped in the retry policy.
pub trait MgnifyClient: Send + Sync {
    fn fetch_page(&self, url: &str, params: &[(&str, &str)]) -> Result<Page, HarvestError>;
    fn download(&self, url: &str, dest: &Utf8Path) -> Result<(), HarvestError>;
}

pub struct MgnifyHttpClient<T: Transport> {
    transport: T,
    options: HttpOptions,
}

impl MgnifyHttpClient<ReqwestTransport> {
    pub fn new(options: HttpOptions) -> Result<Self, HarvestError> {
        let transport = ReqwestTransport::new(&options)?;
        Ok(Self::with_transport(transport, options))
    }
}

impl<T: Transport> MgnifyHttpClient<T> {
    pub fn with_transport(transport: T, options: HttpOptions) -> Self {
        Self { transport, options }
    }

    fn rate_limit_delay(&self, attempt: u32) -> Duration {
        self.options.rate_limit_backoff + self.options.retry_backoff * attempt
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        self.options.retry_backoff * (attempt + 1)
    }
}

impl<T: Transport> MgnifyClient for MgnifyHttpClient<T> {
    /// GET with retries. A 429 sleeps the longer rate-limit backoff and
    /// retries on the same attempt counter; any other failure sleeps the
    /// plain backoff. Exhaustion is an error naming the URL.
    fn fetch_page(&self, url: &str, params: &[(&str, &str)]) -> Result<Page, HarvestError> {
        for attempt in 0..self.options.retries {
            let last = attempt + 1 == self.options.retries;
            let failure = match self.transport.get(url, params) {
                Ok(response) if response.status == 429 => {
                    if last {
                        return Err(HarvestError::ApiStatus {
                            url: url.to_string(),
                            status: 429,
                        });
                    }
                    thread::sleep(self.rate_limit_delay(attempt));
                    continue;
                }
                Ok(mut response) if is_success(response.status) => {
                    match read_page(&mut response.body) {
                        Ok(page) => {
                            thread::sleep(self.options.pace);
                            return Ok(page);
                        }
                        Err(message) => HarvestError::ApiRequest {
                            url: url.to_string(),
                            message,
                        },
                    }
                }
                Ok(response) => HarvestError::ApiStatus {
                    url: url.to_string(),
                    status: response.status,
                },
                Err(err) => err,
            };
            if last {
                return Err(failure);
            }
            debug!("fetch failed for {url} (attempt {attempt}): {failure}");
            thread::sleep(self.retry_delay(attempt));
        }
        Err(HarvestError::ApiRequest {
            url: url.to_string(),
            message: "retry budget exhausted".to_string(),
        })
    }

    /// Streams the body to `<dest>.part` and renames into place on
    /// success. A 404 moves straight to the next URL variant; exhausting
    /// every variant reports failure with no partial file left behind.
    fn download(&self, url: &str, dest: &Utf8Path) -> Result<(), HarvestError> {
        let tmp_path = Utf8PathBuf::from(format!("{dest}.part"));
        'variants: for candidate in url_variants(url) {
            for attempt in 0..self.options.retries {
                let last = attempt + 1 == self.options.retries;
                let failure = match self.transport.get(&candidate, &[]) {
                    Ok(response) if response.status == 429 => {
                        if last {
                            continue 'variants;
                        }
                        thread::sleep(self.rate_limit_delay(attempt));
                        continue;
                    }
                    Ok(response) if response.status == 404 => continue 'variants,
                    Ok(mut response) if is_success(response.status) => {
                        match stream_to_file(&mut response.body, &tmp_path) {
                            Ok(()) => {
                                fs::rename(tmp_path.as_std_path(), dest.as_std_path())
                                    .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
                                if candidate != url {
                                    debug!("download succeeded via variant {candidate}");
                                }
                                thread::sleep(self.options.pace);
                                return Ok(());
                            }
                            Err(err) => {
                                remove_partial(&tmp_path);
                                if matches!(err, HarvestError::Filesystem(_)) {
                                    return Err(err);
                                }
                                err
                            }
                        }
                    }
                    Ok(response) => HarvestError::ApiStatus {
                        url: candidate.clone(),
                        status: response.status,
                    },
                    Err(err) => err,
                };
                if last {
                    warn!("giving up on {candidate}: {failure}");
                    continue 'variants;
                }
                thread::sleep(self.retry_delay(attempt));
            }
        }
        Err(HarvestError::DownloadFailed(url.to_string()))
    }
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

fn read_page(body: &mut Box<dyn Read>) -> Result<Page, String> {
    let mut content = String::new();
    body.read_to_string(&mut content)
        .map_err(|err| err.to_string())?;
    serde_json::from_str(&content).map_err(|err| err.to_string())
}

fn stream_to_file(body: &mut Box<dyn Read>, dest: &Utf8Path) -> Result<(), HarvestError> {
    let mut file =
        File::create(dest.as_std_path()).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    io::copy(body, &mut file).map_err(|err| HarvestError::ApiRequest {
        url: dest.to_string(),
        message: err.to_string(),
    })?;
    Ok(())
}

fn remove_partial(path: &Utf8Path) {
    if path.as_std_path().exists() {
        let _ = fs::remove_file(path.as_std_path());
    }
}

/// Catalog download links are shaped inconsistently; these are the
/// rewrites worth trying before giving up, original URL first.
pub fn url_variants(url: &str) -> Vec<String> {
    let mut variants = vec![url.to_string()];
    if url.ends_with(".bio") {
        variants.push(format!("{url}m"));
    }
    if url.contains("/file/") {
        variants.push(url.replace("/file/", "/download/"));
    }
    if url.contains("/download/") {
        variants.push(url.replace("/download/", "/file/"));
    }
    let mut seen = HashSet::new();
    variants.retain(|variant| seen.insert(variant.clone()));
    variants
}

pub fn samples_url(base: &str, lineage: &Lineage) -> String {
    format!("{base}/biomes/{}/samples", urlencoding::encode(lineage.as_str()))
}

pub fn biome_url(base: &str, lineage: &Lineage) -> String {
    format!("{base}/biomes/{}", urlencoding::encode(lineage.as_str()))
}

pub struct PageIter<'a, C: MgnifyClient + ?Sized> {
    client: &'a C,
    next_url: Option<String>,
    remaining: usize,
    failed: bool,
}

/// Lazily follows `links.next` from `start_url`, yielding at most
/// `max_pages` pages. The first fetch error is yielded once and ends
/// the iteration. Not restartable.
pub fn pages<'a, C: MgnifyClient + ?Sized>(
    client: &'a C,
    start_url: &str,
    max_pages: usize,
) -> PageIter<'a, C> {
    PageIter {
        client,
        next_url: Some(start_url.to_string()),
        remaining: max_pages,
        failed: false,
    }
}

impl<C: MgnifyClient + ?Sized> Iterator for PageIter<'_, C> {
    type Item = Result<Page, HarvestError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining == 0 {
            return None;
        }
        let url = self.next_url.take()?;
        self.remaining -= 1;
        match self.client.fetch_page(&url, &[]) {
            Ok(page) => {
                self.next_url = page.next_link().map(str::to_string);
                Some(Ok(page))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

//! Pull Session
//!
//! One [`PullSession`] drives one image pull through five phases:
//!
//! ```text
//! searching    GET {index}/v1/repositories/<name>/images
//! resolving    GET {registry}/v1/repositories/<name>/tags/<tag>
//! metadata     GET {registry}/v1/images/<id>/{ancestry,json}  (concurrent)
//! downloading  GET {registry}/v1/images/<layer>/layer         (per layer)
//! copying      optional local alias
//! ```
//!
//! The index response headers name the registry endpoints and may issue
//! an auth token; both are folded into the session after every response
//! and attached to every request issued afterwards. The first endpoint
//! of the list is used for all registry requests; there is no failover
//! to later endpoints. Layer bodies are streamed straight into the
//! extractor and are not digest-verified, since the v1 wire format
//! identifies layers by opaque ids rather than content hashes.
//!
//! The first error observed anywhere latches as the session result: the
//! in-flight layer build (extractor child and temp snapshot) is torn
//! down, while layers that already reached their final rename are kept
//! for the next attempt.

use std::path::PathBuf;

use tracing::info;

use crate::image::{self, LayerBuild};
use crate::registry::progress::{ProgressFn, ProgressReporter, PullEvent, PullPhase, RequestKind};
use crate::registry::{headers, parse, request, PullError, Result};
use crate::utils::constants::{CONNECT_TIMEOUT, DEFAULT_TAG, MAX_METADATA_SIZE};
use crate::utils::validation;

/// A single-image pull session.
///
/// Sessions are single-shot: construction does no I/O, [`pull`] runs
/// the whole protocol, and a second `pull` on the same session fails
/// with [`PullError::Busy`].
///
/// ## Example
///
/// ```rust,ignore
/// let mut session = PullSession::new("https://index.docker.io", "/var/lib/strata")?;
/// let id = session.pull("library/busybox", None, Some("busybox"), false).await?;
/// println!("pulled {}", id);
/// ```
///
/// [`pull`]: PullSession::pull
pub struct PullSession {
    http: reqwest::Client,
    index_url: String,
    image_root: PathBuf,
    reporter: ProgressReporter,

    name: String,
    tag: String,
    id: String,

    response_token: Option<String>,
    response_registries: Vec<String>,

    ancestry: Vec<String>,
    current_ancestry: usize,

    local: Option<String>,
    force_local: bool,

    started: bool,
}

impl PullSession {
    /// Create an idle session against `index_url`, materializing under
    /// `image_root`. Validates the URL and allocates the HTTP client;
    /// issues no requests.
    pub fn new(index_url: &str, image_root: impl Into<PathBuf>) -> Result<Self> {
        if !validation::http_url_is_valid(index_url) {
            return Err(PullError::InvalidIndexUrl(index_url.to_string()));
        }

        let mut index_url = index_url.to_string();
        if index_url.ends_with('/') {
            index_url.pop();
        }

        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            index_url,
            image_root: image_root.into(),
            reporter: ProgressReporter::new(None),
            name: String::new(),
            tag: String::new(),
            id: String::new(),
            response_token: None,
            response_registries: Vec::new(),
            ancestry: Vec::new(),
            current_ancestry: 0,
            local: None,
            force_local: false,
            started: false,
        })
    }

    /// Attach an observer for [`PullEvent`]s.
    pub fn with_progress(mut self, callback: ProgressFn) -> Self {
        self.reporter = ProgressReporter::new(Some(callback));
        self
    }

    /// Pull `name` at `tag` (default `latest`), optionally producing a
    /// local alias named `local` afterwards. Returns the resolved tip
    /// layer id.
    pub async fn pull(
        &mut self,
        name: &str,
        tag: Option<&str>,
        local: Option<&str>,
        force_local: bool,
    ) -> Result<String> {
        if !validation::name_is_valid(name) {
            return Err(PullError::InvalidName(name.to_string()));
        }

        let tag = tag.unwrap_or(DEFAULT_TAG);
        if !validation::tag_is_valid(tag) {
            return Err(PullError::InvalidTag(tag.to_string()));
        }

        if let Some(local) = local {
            if !validation::machine_name_is_valid(local) {
                return Err(PullError::InvalidMachineName(local.to_string()));
            }
        }

        if self.started {
            return Err(PullError::Busy);
        }
        self.started = true;

        self.name = name.to_string();
        self.tag = tag.to_string();
        self.local = local.map(str::to_string);
        self.force_local = force_local;

        self.reporter.event(PullEvent::Started {
            name: self.name.clone(),
            tag: self.tag.clone(),
        });

        self.run().await
    }

    async fn run(&mut self) -> Result<String> {
        let mut phase = PullPhase::Searching;
        loop {
            match phase {
                PullPhase::Searching => {
                    self.search().await?;
                    phase = PullPhase::Resolving;
                }
                PullPhase::Resolving => {
                    self.resolve().await?;
                    phase = PullPhase::Metadata;
                }
                PullPhase::Metadata => {
                    self.metadata().await?;
                    phase = PullPhase::Downloading;
                }
                PullPhase::Downloading => {
                    self.download_layers().await?;
                    phase = PullPhase::Copying;
                }
                PullPhase::Copying => return self.copy(),
            }
        }
    }

    /// Index lookup: learns the token and the registry endpoints.
    async fn search(&mut self) -> Result<()> {
        self.reporter.enter_phase(PullPhase::Searching);

        let url = request::images_url(&self.index_url, &self.name);
        self.fetch_buffered(RequestKind::Images, &url).await?;

        if self.response_registries.is_empty() {
            return Err(PullError::Protocol(
                "didn't get registry information".to_string(),
            ));
        }

        info!(
            "Index lookup succeeded, directed to registry {}",
            self.response_registries[0]
        );
        self.reporter.event(PullEvent::RegistrySelected {
            registry: self.response_registries[0].clone(),
        });

        Ok(())
    }

    /// Tag lookup: resolves the tag to the tip layer id.
    async fn resolve(&mut self) -> Result<()> {
        self.reporter.enter_phase(PullPhase::Resolving);

        let url = request::tags_url(&self.response_registries[0], &self.name, &self.tag);
        let body = self.fetch_buffered(RequestKind::Tags, &url).await?;
        self.id = parse::parse_id(&body)?;

        info!("Tag lookup succeeded, resolved to layer {}", self.id);
        self.reporter.event(PullEvent::TagResolved {
            id: self.id.clone(),
        });

        Ok(())
    }

    /// Ancestry and json lookups, issued concurrently. Only the
    /// ancestry payload is consumed; the json body participates in
    /// completion and is otherwise discarded.
    async fn metadata(&mut self) -> Result<()> {
        self.reporter.enter_phase(PullPhase::Metadata);

        let registry = self.response_registries[0].clone();
        let token = self.response_token.clone();

        let ancestry_url = request::ancestry_url(&registry, &self.id);
        let json_url = request::json_url(&registry, &self.id);

        let ((ancestry_headers, ancestry_body), (json_headers, _json_body)) = tokio::try_join!(
            fetch(
                &self.http,
                &ancestry_url,
                token.as_deref(),
                RequestKind::Ancestry,
                &self.reporter,
            ),
            fetch(
                &self.http,
                &json_url,
                token.as_deref(),
                RequestKind::Json,
                &self.reporter,
            ),
        )?;

        headers::absorb(
            &ancestry_headers,
            &mut self.response_token,
            &mut self.response_registries,
        )?;
        headers::absorb(
            &json_headers,
            &mut self.response_token,
            &mut self.response_registries,
        )?;

        let ancestry = parse::parse_ancestry(&ancestry_body)?;
        if ancestry.last().map(String::as_str) != Some(self.id.as_str()) {
            return Err(PullError::Protocol(
                "ancestry doesn't end in main layer".to_string(),
            ));
        }

        info!("Ancestor lookup succeeded, requires {} layers", ancestry.len());
        self.reporter.set_layer_totals(ancestry.len());
        self.reporter.event(PullEvent::AncestryResolved {
            layers: ancestry.len(),
        });

        self.ancestry = ancestry;
        self.current_ancestry = 0;

        Ok(())
    }

    /// Materialize every layer of the ancestry in parent-first order,
    /// reusing layers whose directory already exists.
    async fn download_layers(&mut self) -> Result<()> {
        self.reporter.enter_phase(PullPhase::Downloading);

        while let Some(layer) = self.next_unmaterialized()? {
            self.pull_layer(&layer).await?;

            self.current_ancestry += 1;
            self.reporter.advance_layer(self.current_ancestry);
            self.reporter.event(PullEvent::LayerComplete { id: layer });
        }

        Ok(())
    }

    /// Skip forward over already-materialized layers; return the next
    /// layer that needs fetching, or `None` when the chain is complete.
    fn next_unmaterialized(&mut self) -> Result<Option<String>> {
        while self.current_ancestry < self.ancestry.len() {
            let layer = &self.ancestry[self.current_ancestry];
            let path = image::layer_dir(&self.image_root, layer);

            match path.symlink_metadata() {
                Ok(_) => {
                    info!("Layer {} already exists, skipping.", layer);
                    self.reporter.event(PullEvent::LayerSkipped {
                        id: layer.clone(),
                    });
                    self.current_ancestry += 1;
                    self.reporter.advance_layer(self.current_ancestry);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(Some(layer.clone()));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(None)
    }

    /// Fetch one layer body and stream it through a [`LayerBuild`].
    async fn pull_layer(&mut self, layer: &str) -> Result<()> {
        info!("Pulling layer {}...", layer);
        self.reporter.event(PullEvent::LayerPulling {
            id: layer.to_string(),
            index: self.current_ancestry,
            total: self.ancestry.len(),
        });

        let url = request::layer_url(&self.response_registries[0], layer);
        let response = request::get(&self.http, &url, self.response_token.as_deref())
            .send()
            .await?
            .error_for_status()?;

        headers::absorb(
            response.headers(),
            &mut self.response_token,
            &mut self.response_registries,
        )?;

        // The transport is ready to deliver body bytes: acquire the
        // snapshot and extractor now, stacked on the previous layer's
        // snapshot when there is one.
        let parent = if self.current_ancestry > 0 {
            Some(self.ancestry[self.current_ancestry - 1].as_str())
        } else {
            None
        };
        let mut build = LayerBuild::begin(&self.image_root, layer, parent)?;

        match stream_layer(response, &mut build, &self.reporter).await {
            Ok(()) => build.finish().await?,
            Err(e) => {
                build.abort().await;
                return Err(e);
            }
        }

        Ok(())
    }

    /// Final phase: optional local alias, then the resolved id.
    fn copy(&mut self) -> Result<String> {
        self.reporter.enter_phase(PullPhase::Copying);

        if let Some(local) = &self.local {
            let final_path = image::layer_dir(&self.image_root, &self.id);
            image::make_local_copy(&final_path, &self.image_root, local, self.force_local)?;
        }

        self.reporter.event(PullEvent::Complete {
            id: self.id.clone(),
        });

        Ok(self.id.clone())
    }

    /// Issue a buffered GET and fold its response headers into the
    /// session before returning the body.
    async fn fetch_buffered(&mut self, kind: RequestKind, url: &str) -> Result<Vec<u8>> {
        let (response_headers, body) = fetch(
            &self.http,
            url,
            self.response_token.as_deref(),
            kind,
            &self.reporter,
        )
        .await?;

        headers::absorb(
            &response_headers,
            &mut self.response_token,
            &mut self.response_registries,
        )?;

        Ok(body)
    }
}

/// GET `url` and buffer the body, reporting sub-progress for `kind`.
async fn fetch(
    client: &reqwest::Client,
    url: &str,
    token: Option<&str>,
    kind: RequestKind,
    reporter: &ProgressReporter,
) -> Result<(reqwest::header::HeaderMap, Vec<u8>)> {
    let mut response = request::get(client, url, token)
        .send()
        .await?
        .error_for_status()?;

    let response_headers = response.headers().clone();
    let total = response.content_length();
    let mut body = Vec::new();

    while let Some(chunk) = response.chunk().await? {
        body.extend_from_slice(&chunk);
        if body.len() > MAX_METADATA_SIZE {
            return Err(PullError::Protocol("metadata payload too large".to_string()));
        }
        if let Some(total) = total.filter(|t| *t > 0) {
            reporter.request_progress(kind, (body.len() as u64 * 100 / total) as u32);
        }
    }

    reporter.request_progress(kind, 100);
    Ok((response_headers, body))
}

/// Stream a layer body into its build, chunk by chunk.
async fn stream_layer(
    mut response: reqwest::Response,
    build: &mut LayerBuild,
    reporter: &ProgressReporter,
) -> Result<()> {
    let total = response.content_length();
    let mut received: u64 = 0;

    while let Some(chunk) = response.chunk().await? {
        received += chunk.len() as u64;
        build.write(&chunk).await?;
        if let Some(total) = total.filter(|t| *t > 0) {
            reporter.request_progress(RequestKind::Layer, (received * 100 / total) as u32);
        }
    }

    reporter.request_progress(RequestKind::Layer, 100);
    Ok(())
}

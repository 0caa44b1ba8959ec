//! Rasterize one page of an untrusted document on a leased worker.

use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    config::RenderSettings,
    domain::{
        error::DomainError,
        render::{RenderRequest, RenderedImage},
    },
    pool::{Lease, LeaseOutcome, PoolError, WorkerPool},
    worker::WorkerError,
};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    InvalidRequest(#[from] DomainError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

#[derive(Debug, Clone)]
pub struct RenderService {
    pool: WorkerPool,
    acquire_timeout: Duration,
    call_timeout: Duration,
    jpeg_quality: u8,
    max_dpi: u32,
}

impl RenderService {
    pub fn new(pool: WorkerPool, settings: &RenderSettings) -> Self {
        Self {
            pool,
            acquire_timeout: settings.acquire_timeout,
            call_timeout: settings.call_timeout,
            jpeg_quality: settings.jpeg_quality,
            max_dpi: settings.max_dpi,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Validate raw caller input against the configured limits.
    pub fn request(&self, document: Bytes, page: i64, dpi: i64) -> Result<RenderRequest, RenderError> {
        Ok(RenderRequest::new(document, page, dpi, self.max_dpi)?)
    }

    /// Render `request.page` to JPEG.
    ///
    /// The worker is recycled only when every step succeeded; any failure
    /// after acquisition destroys it.
    pub async fn render(&self, request: RenderRequest) -> Result<RenderedImage, RenderError> {
        let started = Instant::now();
        let mut lease = self.pool.acquire_within(self.acquire_timeout).await?;
        let generation = lease.generation();

        let outcome = self.rasterize(&mut lease, &request).await;
        let leased_ms = lease.acquired_at().elapsed().as_millis() as u64;
        match outcome {
            Ok(image) => {
                self.pool.release(lease, LeaseOutcome::Healthy);
                info!(
                    target = "rasterd::application::render",
                    op = "render",
                    result = "ok",
                    generation,
                    page = image.page.get(),
                    page_count = image.page_count,
                    dpi = request.dpi.get(),
                    width = image.width,
                    height = image.height,
                    bytes = image.jpeg.len(),
                    leased_ms,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Page rendered"
                );
                Ok(image)
            }
            Err(err) => {
                self.pool.release(lease, LeaseOutcome::Unhealthy);
                warn!(
                    target = "rasterd::application::render",
                    op = "render",
                    result = "error",
                    generation,
                    page = request.page.get(),
                    dpi = request.dpi.get(),
                    leased_ms,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %err,
                    "Render failed"
                );
                Err(err.into())
            }
        }
    }

    async fn rasterize(
        &self,
        lease: &mut Lease,
        request: &RenderRequest,
    ) -> Result<RenderedImage, WorkerError> {
        let document = lease
            .open_document(&request.document, self.call_timeout)
            .await?;
        let page = lease
            .render_page(
                &document,
                request.page.index(),
                request.dpi.get(),
                self.jpeg_quality,
                self.call_timeout,
            )
            .await?;
        lease.close_document(&document, self.call_timeout).await?;

        let image = RenderedImage {
            jpeg: page.jpeg,
            width: page.width,
            height: page.height,
            page: request.page,
            page_count: document.page_count,
        };
        if !image.has_jpeg_signature() {
            return Err(WorkerError::protocol(
                "render_page",
                "worker output is not a JPEG stream",
            ));
        }
        Ok(image)
    }
}

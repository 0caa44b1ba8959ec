//! Render request normalisation.
//!
//! Callers address pages with 1-based numbers and may send zero or negative
//! values; those mean "the first page". Workers address pages by 0-based
//! index. The conversion lives here and nowhere else.

use std::num::NonZeroU32;

use bytes::Bytes;

use super::error::DomainError;

/// Leading bytes of every JPEG stream (SOI marker plus the next marker prefix).
pub const JPEG_SIGNATURE: [u8; 3] = [0xFF, 0xD8, 0xFF];

/// A 1-based page number after the default-to-first-page policy was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageNumber(NonZeroU32);

impl PageNumber {
    pub const FIRST: PageNumber = PageNumber(NonZeroU32::MIN);

    /// Normalise a caller-supplied page number. Non-positive values select page 1.
    pub fn from_request(raw: i64) -> Self {
        if raw <= 0 {
            return Self::FIRST;
        }
        let clamped = u32::try_from(raw).unwrap_or(u32::MAX);
        NonZeroU32::new(clamped).map_or(Self::FIRST, Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    /// Zero-based index as understood by the worker.
    pub fn index(self) -> u32 {
        self.0.get() - 1
    }
}

/// Rendering resolution in dots per inch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dpi(NonZeroU32);

impl Dpi {
    pub fn new(raw: i64, max: u32) -> Result<Self, DomainError> {
        if raw <= 0 {
            return Err(DomainError::validation(format!(
                "dpi must be a positive integer, got {raw}"
            )));
        }
        let value = u32::try_from(raw)
            .ok()
            .filter(|value| *value <= max)
            .ok_or_else(|| {
                DomainError::validation(format!("dpi {raw} exceeds the maximum of {max}"))
            })?;
        NonZeroU32::new(value)
            .map(Self)
            .ok_or_else(|| DomainError::validation("dpi must be a positive integer"))
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

/// A validated request to rasterise one page of a document.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub document: Bytes,
    pub page: PageNumber,
    pub dpi: Dpi,
}

impl RenderRequest {
    pub fn new(document: Bytes, page: i64, dpi: i64, max_dpi: u32) -> Result<Self, DomainError> {
        if document.is_empty() {
            return Err(DomainError::validation("document is empty"));
        }
        Ok(Self {
            document,
            page: PageNumber::from_request(page),
            dpi: Dpi::new(dpi, max_dpi)?,
        })
    }
}

/// JPEG output of a successful render.
#[derive(Debug, Clone)]
pub struct RenderedImage {
    pub jpeg: Bytes,
    pub width: u32,
    pub height: u32,
    pub page: PageNumber,
    pub page_count: u32,
}

impl RenderedImage {
    pub fn has_jpeg_signature(&self) -> bool {
        self.jpeg.starts_with(&JPEG_SIGNATURE)
    }
}

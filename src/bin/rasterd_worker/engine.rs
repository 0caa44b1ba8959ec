//! PDFium-backed document engine. Holds at most one open document.

use std::{io::Cursor, path::Path};

use image::{DynamicImage, RgbaImage, codecs::jpeg::JpegEncoder};
use pdfium_render::prelude::*;
use rasterd::worker::protocol::{FailureKind, Operation, Outcome, decode_payload, encode_payload};
use tracing::debug;

/// PDF user-space units per inch.
const POINTS_PER_INCH: f32 = 72.0;

/// Bind PDFium from `library` (a shared object or the directory holding it),
/// falling back to the system search path when nothing was configured.
pub fn bind(library: Option<&Path>) -> Result<Pdfium, PdfiumError> {
    let bindings = match library {
        Some(path) if path.is_dir() => {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(path))?
        }
        Some(path) => Pdfium::bind_to_library(path)?,
        None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library())?,
    };
    Ok(Pdfium::new(bindings))
}

struct OpenDocument<'a> {
    handle: u32,
    document: PdfDocument<'a>,
}

pub struct Engine<'a> {
    pdfium: &'a Pdfium,
    current: Option<OpenDocument<'a>>,
    next_handle: u32,
}

impl<'a> Engine<'a> {
    pub fn new(pdfium: &'a Pdfium) -> Self {
        Self {
            pdfium,
            current: None,
            next_handle: 1,
        }
    }

    pub fn handle(&mut self, op: Operation) -> Outcome {
        match op {
            Operation::OpenDocument { document } => self.open(&document),
            Operation::RenderPage {
                document,
                page_index,
                dpi,
                quality,
            } => self.render(document, page_index, dpi, quality),
            Operation::CloseDocument { document } => self.close(document),
        }
    }

    fn open(&mut self, encoded: &str) -> Outcome {
        // Release the previous document before PDFium parses the next one.
        self.current = None;

        let bytes = match decode_payload(encoded) {
            Ok(bytes) => bytes,
            Err(err) => {
                return Outcome::failed(
                    FailureKind::InvalidRequest,
                    format!("document payload is not valid base64: {err}"),
                );
            }
        };

        let size = bytes.len();
        let document = match self.pdfium.load_pdf_from_byte_vec(bytes, None) {
            Ok(document) => document,
            Err(err) => return Outcome::failed(FailureKind::Open, err.to_string()),
        };

        let page_count = u32::try_from(document.pages().len()).unwrap_or_default();
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        self.current = Some(OpenDocument { handle, document });

        debug!(
            target = "rasterd_worker::engine",
            op = "open_document",
            handle,
            page_count,
            bytes = size,
            "Document opened"
        );
        Outcome::DocumentOpened {
            document: handle,
            page_count,
        }
    }

    fn render(&mut self, handle: u32, page_index: u32, dpi: u32, quality: u8) -> Outcome {
        let Some(open) = self.current.as_ref().filter(|open| open.handle == handle) else {
            return unknown_handle(handle);
        };
        if dpi == 0 {
            return Outcome::failed(FailureKind::InvalidRequest, "dpi must be positive");
        }

        let pages = open.document.pages();
        let page_count = u32::try_from(pages.len()).unwrap_or_default();
        let page = match PdfPageIndex::try_from(page_index)
            .ok()
            .filter(|_| page_index < page_count)
        {
            Some(index) => match pages.get(index) {
                Ok(page) => page,
                Err(err) => return Outcome::failed(FailureKind::Render, err.to_string()),
            },
            None => {
                return Outcome::failed(
                    FailureKind::Render,
                    format!(
                        "page {} does not exist, document has {page_count} page(s)",
                        u64::from(page_index) + 1
                    ),
                );
            }
        };

        let config = PdfRenderConfig::new().scale_page_by_factor(dpi as f32 / POINTS_PER_INCH);
        let bitmap = match page.render_with_config(&config) {
            Ok(bitmap) => bitmap,
            Err(err) => return Outcome::failed(FailureKind::Render, err.to_string()),
        };

        let (Ok(width), Ok(height)) = (u32::try_from(bitmap.width()), u32::try_from(bitmap.height()))
        else {
            return Outcome::failed(FailureKind::Render, "renderer produced a negative size");
        };

        match encode_jpeg(bitmap.as_rgba_bytes(), width, height, quality) {
            Ok(jpeg) => {
                debug!(
                    target = "rasterd_worker::engine",
                    op = "render_page",
                    handle,
                    page_index,
                    dpi,
                    width,
                    height,
                    bytes = jpeg.len(),
                    "Page rendered"
                );
                Outcome::PageRendered {
                    image: encode_payload(&jpeg),
                    width,
                    height,
                }
            }
            Err(message) => Outcome::failed(FailureKind::Render, message),
        }
    }

    fn close(&mut self, handle: u32) -> Outcome {
        if !self
            .current
            .as_ref()
            .is_some_and(|open| open.handle == handle)
        {
            return unknown_handle(handle);
        }

        self.current = None;
        debug!(
            target = "rasterd_worker::engine",
            op = "close_document",
            handle,
            "Document closed"
        );
        Outcome::DocumentClosed
    }
}

fn unknown_handle(handle: u32) -> Outcome {
    Outcome::failed(
        FailureKind::InvalidRequest,
        format!("document handle {handle} is not open"),
    )
}

/// Encode an RGBA buffer as a baseline JPEG, dropping the alpha channel.
pub fn encode_jpeg(rgba: Vec<u8>, width: u32, height: u32, quality: u8) -> Result<Vec<u8>, String> {
    let image = RgbaImage::from_raw(width, height, rgba)
        .ok_or_else(|| format!("bitmap buffer does not match {width}x{height}"))?;
    let rgb = DynamicImage::ImageRgba8(image).to_rgb8();

    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|err| format!("jpeg encoding failed: {err}"))?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use rasterd::domain::render::JPEG_SIGNATURE;

    use super::*;

    #[test]
    fn encodes_rgba_buffers_as_jpeg() {
        let rgba = [255u8, 255, 255, 255].repeat(16 * 8);
        let jpeg = encode_jpeg(rgba, 16, 8, 85).expect("encode");
        assert!(jpeg.starts_with(&JPEG_SIGNATURE));
    }

    #[test]
    fn rejects_short_buffers() {
        let err = encode_jpeg(vec![0; 12], 16, 8, 85).expect_err("buffer too small");
        assert!(err.contains("16x8"));
    }
}

use axum::{
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use axum_extra::extract::{Multipart, multipart::MultipartRejection};
use bytes::Bytes;

use crate::application::error::HttpError;

use super::HttpState;

const SOURCE: &str = "infra::http::render";

#[derive(Debug, Default)]
struct RenderForm {
    file: Option<Bytes>,
    page: Option<String>,
    dpi: Option<String>,
}

pub(super) async fn render_page(
    State(state): State<HttpState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let mut multipart = match multipart {
        Ok(multipart) => multipart,
        Err(rejection) => {
            return HttpError::from_error(
                SOURCE,
                StatusCode::BAD_REQUEST,
                format!("err: {}", rejection.body_text()),
                &rejection,
            )
            .into_response();
        }
    };

    let form = match read_form(&mut multipart, state.max_document_bytes).await {
        Ok(form) => form,
        Err(err) => return err.into_response(),
    };

    let (document, page, dpi) = match form.into_parts() {
        Ok(parts) => parts,
        Err(err) => return err.into_response(),
    };

    let request = match state.render.request(document, page, dpi) {
        Ok(request) => request,
        Err(err) => return HttpError::from(err).into_response(),
    };

    match state.render.render(request).await {
        Ok(image) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "image/jpeg")],
            image.jpeg,
        )
            .into_response(),
        Err(err) => HttpError::from(err).into_response(),
    }
}

async fn read_form(
    multipart: &mut Multipart,
    max_document_bytes: usize,
) -> Result<RenderForm, HttpError> {
    let mut form = RenderForm::default();

    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => match field.name() {
                Some("file") => {
                    let data = field.bytes().await.map_err(|err| multipart_error(&err))?;
                    if data.len() > max_document_bytes {
                        return Err(too_large(max_document_bytes));
                    }
                    form.file = Some(data);
                }
                Some("page") => {
                    let text = field.text().await.map_err(|err| multipart_error(&err))?;
                    form.page = Some(text);
                }
                Some("dpi") => {
                    let text = field.text().await.map_err(|err| multipart_error(&err))?;
                    form.dpi = Some(text);
                }
                _ => {}
            },
            Ok(None) => break,
            Err(err) => return Err(multipart_error(&err)),
        }
    }

    Ok(form)
}

impl RenderForm {
    fn into_parts(self) -> Result<(Bytes, i64, i64), HttpError> {
        let document = self.file.ok_or_else(|| missing_field("file"))?;
        let page = parse_integer("page", self.page)?;
        let dpi = parse_integer("dpi", self.dpi)?;
        Ok((document, page, dpi))
    }
}

fn parse_integer(name: &'static str, raw: Option<String>) -> Result<i64, HttpError> {
    let raw = raw.ok_or_else(|| missing_field(name))?;
    raw.trim().parse::<i64>().map_err(|err| {
        HttpError::from_error(
            SOURCE,
            StatusCode::BAD_REQUEST,
            format!("err: field `{name}` must be an integer, got {:?}", raw.trim()),
            &err,
        )
    })
}

fn missing_field(name: &'static str) -> HttpError {
    let message = format!("err: missing form field `{name}`");
    HttpError::new(SOURCE, StatusCode::BAD_REQUEST, message.clone(), message)
}

fn too_large(limit: usize) -> HttpError {
    let message = format!("err: document exceeds the {limit} byte limit");
    HttpError::new(SOURCE, StatusCode::PAYLOAD_TOO_LARGE, message.clone(), message)
}

fn multipart_error(err: &axum_extra::extract::multipart::MultipartError) -> HttpError {
    let status = err.status();
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        return HttpError::from_error(
            SOURCE,
            status,
            "err: document exceeds the configured size limit",
            err,
        );
    }
    HttpError::from_error(
        SOURCE,
        StatusCode::BAD_REQUEST,
        format!("err: malformed multipart body: {}", err.body_text()),
        err,
    )
}

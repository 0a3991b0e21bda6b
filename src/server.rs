//! HTTP front end.

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use futures_util::TryStreamExt;
use serde::Deserialize;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::directory::{validate_file_name, DirectoryListing, FsDirectories};
use crate::engine::{ChunkOutcome, ChunkRequest, UploadEngine};
use crate::error::{Error, Result};

const CURRENT_DIRECTORY: &str = "x-current-directory";
const FILE_NAME: &str = "x-file-name";
const CURRENT_CHUNK: &str = "x-current-chunk";
const CHUNKS_NEEDED: &str = "x-chunks-needed";
const CONTENT_HASH: &str = "x-content-hash";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<UploadEngine>,
    pub directories: Arc<FsDirectories>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_listing))
        .route("/upload", post(upload_chunk))
        .route("/cancelUpload", post(cancel_upload))
        .route("/deleteFile", post(delete_file))
        .route("/createDirectory", post(create_directory))
        .route("/deleteDirectory", post(delete_directory))
        .route("/getDirectoryInfo", post(directory_info))
        .route("/download/{*path}", get(download))
        .with_state(state)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NameConflict(_)
            | Error::ContentDuplicate { .. }
            | Error::InvalidChunk(_)
            | Error::InvalidPath(_)
            | Error::DirectoryNotEmpty(_) => StatusCode::BAD_REQUEST,
            Error::SessionUnavailable(_) | Error::OutOfSequence { .. } => {
                StatusCode::MISDIRECTED_REQUEST
            }
            Error::ChunkTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::Busy(_) => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Io(err) => {
                tracing::error!("request failed: {err}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}

/// Form fields shared by the directory and file operations.
///
/// Clients percent-encode both values before form-encoding them.
#[derive(Debug, Default, Deserialize)]
struct EntryForm {
    #[serde(default)]
    directory: String,
    #[serde(default)]
    name: String,
}

impl EntryForm {
    fn decoded(&self) -> Result<(String, String)> {
        Ok((decode(&self.directory)?, decode(&self.name)?))
    }
}

fn decode(value: &str) -> Result<String> {
    urlencoding::decode(value)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| Error::InvalidPath(format!("malformed percent-encoding: {value}")))
}

fn header_value(headers: &HeaderMap, name: &str) -> Result<String> {
    let raw = headers
        .get(name)
        .ok_or_else(|| Error::InvalidChunk(format!("missing {name} header")))?
        .to_str()
        .map_err(|_| Error::InvalidChunk(format!("{name} header is not ASCII")))?;
    urlencoding::decode(raw)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| Error::InvalidChunk(format!("{name} header is not valid UTF-8")))
}

fn header_number(headers: &HeaderMap, name: &str) -> Result<u64> {
    let value = header_value(headers, name)?;
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidChunk(format!("{name} header is not a number: {value}")))
}

fn chunk_request(headers: &HeaderMap) -> Result<ChunkRequest> {
    Ok(ChunkRequest {
        directory: header_value(headers, CURRENT_DIRECTORY)?,
        file_name: header_value(headers, FILE_NAME)?,
        chunk_index: header_number(headers, CURRENT_CHUNK)?,
        chunks_needed: header_number(headers, CHUNKS_NEEDED)?,
    })
}

async fn upload_chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response> {
    let request = chunk_request(&headers)?;
    let stream = body.into_data_stream().map_err(io::Error::other);
    let reader = StreamReader::new(stream);

    let response = match state.engine.submit_chunk(request, reader).await? {
        ChunkOutcome::Accepted => "chunk accepted".into_response(),
        ChunkOutcome::Committed { digest } => {
            let mut response = "upload complete".into_response();
            if let Ok(value) = HeaderValue::from_str(&digest) {
                response.headers_mut().insert(CONTENT_HASH, value);
            }
            response
        }
    };
    Ok(response)
}

async fn cancel_upload(State(state): State<AppState>, Form(form): Form<EntryForm>) -> Result<&'static str> {
    let (directory, name) = form.decoded()?;
    if state.engine.cancel(&directory, &name).await? {
        Ok("upload cancelled")
    } else {
        Ok("no upload in progress")
    }
}

async fn delete_file(State(state): State<AppState>, Form(form): Form<EntryForm>) -> Result<&'static str> {
    let (directory, name) = form.decoded()?;
    state.engine.delete_file(&directory, &name).await?;
    Ok("file deleted")
}

async fn create_directory(
    State(state): State<AppState>,
    Form(form): Form<EntryForm>,
) -> Result<&'static str> {
    let (directory, name) = form.decoded()?;
    state.directories.create_directory(&directory, &name).await?;
    Ok("directory created")
}

async fn delete_directory(
    State(state): State<AppState>,
    Form(form): Form<EntryForm>,
) -> Result<&'static str> {
    let (directory, name) = form.decoded()?;
    state.directories.delete_directory(&directory, &name).await?;
    Ok("directory deleted")
}

async fn directory_info(
    State(state): State<AppState>,
    Form(form): Form<EntryForm>,
) -> Result<Json<DirectoryListing>> {
    let (directory, name) = form.decoded()?;
    // `name` picks a subdirectory of `directory`; empty lists `directory` itself
    let relative = if name.is_empty() {
        directory
    } else {
        validate_file_name(&name)?;
        format!("{}/{name}", directory.trim_end_matches('/'))
    };
    Ok(Json(state.directories.directory_info(&relative).await?))
}

async fn root_listing(State(state): State<AppState>) -> Result<Json<DirectoryListing>> {
    Ok(Json(state.directories.directory_info("").await?))
}

async fn download(State(state): State<AppState>, Path(path): Path<String>) -> Result<Response> {
    let (name, file) = state.directories.open_file(&path).await?;
    let disposition = format!(
        "attachment; filename*=UTF-8''{}",
        urlencoding::encode(&name)
    );

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

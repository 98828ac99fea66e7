use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::conduit::ConduitError;

/// Payload representation an interceptor or service operates on.
///
/// Interceptors only run for services of the same kind; proxied requests
/// are always [`ContentKind::ByteArray`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentKind {
    #[default]
    ByteArray,
    String,
    Json,
    /// JSON documents (objects)
    Bson,
    Csv,
}

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("content is not valid UTF-8")]
    InvalidUtf8,

    #[error("content is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("content is not a JSON document")]
    NotADocument,

    #[error(transparent)]
    Conduit(#[from] ConduitError),
}

pub(crate) fn as_text(body: &[u8]) -> Result<&str, ContentError> {
    std::str::from_utf8(body).map_err(|_| ContentError::InvalidUtf8)
}

pub(crate) fn as_json(body: &[u8]) -> Result<Option<Value>, ContentError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(body)?))
}

pub(crate) fn as_document(body: &[u8]) -> Result<Option<serde_json::Map<String, Value>>, ContentError> {
    match as_json(body)? {
        None => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(ContentError::NotADocument),
    }
}

/// Split CSV content into rows of fields. Quoted fields may contain the
/// separator and doubled quotes; they may not span lines.
pub(crate) fn as_csv(body: &[u8]) -> Result<Vec<Vec<String>>, ContentError> {
    let text = as_text(body)?;
    Ok(text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(split_csv_line)
        .collect())
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.trim_end_matches('\r').chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }
    fields.push(field);
    fields
}

pub(crate) fn json_bytes(value: &Value) -> Result<Bytes, ContentError> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

//! Form bodies: `application/x-www-form-urlencoded` and `multipart/form-data`.

use bytes::{Bytes, BytesMut};
use mime::Mime;
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::codec::multipart::{MultipartEvent, MultipartScanner};
use crate::protocol::ParseError;

/// A file field of a `multipart/form-data` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormFile {
    /// Name of the form field
    pub name: String,
    pub file_name: String,
    /// Content type declared by the part, `None` if absent or unparsable
    pub content_type: Option<Mime>,
    pub data: Bytes,
}

impl FormFile {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Parsed fields of a form body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Form {
    pub fields: Vec<(String, String)>,
    pub files: Vec<FormFile>,
}

/// Parses a buffered body by its content type.
///
/// Returns `Ok(None)` when the content type isn't a form type.
pub fn parse_form(content_type: &str, body: &Bytes) -> Result<Option<Form>, ParseError> {
    let Ok(mime) = content_type.parse::<Mime>() else {
        return Ok(None);
    };

    if mime.type_() == mime::APPLICATION && mime.subtype() == mime::WWW_FORM_URLENCODED {
        let fields = serde_urlencoded::from_bytes::<Vec<(String, String)>>(body).map_err(ParseError::invalid_body)?;
        return Ok(Some(Form { fields, files: vec![] }));
    }

    if mime.type_() == mime::MULTIPART && mime.subtype() == mime::FORM_DATA {
        let boundary = mime
            .get_param(mime::BOUNDARY)
            .ok_or_else(|| ParseError::invalid_multipart("missing boundary parameter"))?;
        return parse_multipart(boundary.as_str(), body).map(Some);
    }

    Ok(None)
}

enum Field {
    Text { name: String, value: BytesMut },
    File { name: String, file_name: String, content_type: Option<Mime>, data: BytesMut },
}

fn parse_multipart(boundary: &str, body: &Bytes) -> Result<Form, ParseError> {
    let mut scanner = MultipartScanner::new(boundary);
    let mut buffer = BytesMut::from(&body[..]);
    let mut form = Form::default();
    let mut current: Option<Field> = None;

    while let Some(event) = scanner.decode(&mut buffer)? {
        match event {
            MultipartEvent::Preamble(_) => {}
            MultipartEvent::Part { headers, index } => {
                finish_field(&mut form, current.take());
                current = Some(new_field(&headers, index)?);
            }
            MultipartEvent::Data { data, .. } => match &mut current {
                Some(Field::Text { value, .. }) => value.extend_from_slice(&data),
                Some(Field::File { data: file, .. }) => file.extend_from_slice(&data),
                None => {}
            },
            MultipartEvent::Done => {
                finish_field(&mut form, current.take());
                break;
            }
        }
    }

    if !scanner.is_done() {
        return Err(ParseError::invalid_multipart("missing closing boundary"));
    }
    trace!(fields = form.fields.len(), files = form.files.len(), "parsed multipart form");
    Ok(form)
}

fn new_field(headers: &[(String, String)], index: usize) -> Result<Field, ParseError> {
    let header = |name: &str| headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str());

    let disposition = header("content-disposition")
        .ok_or_else(|| ParseError::invalid_multipart(format!("part {index} has no content-disposition")))?;
    let params = disposition_params(disposition)
        .ok_or_else(|| ParseError::invalid_multipart(format!("part {index} is not form-data")))?;
    let param = |key: &str| params.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| v.clone());

    let name = param("name").ok_or_else(|| ParseError::invalid_multipart(format!("part {index} has no field name")))?;
    Ok(match param("filename") {
        Some(file_name) => Field::File {
            name,
            file_name,
            content_type: header("content-type").and_then(|v| v.parse().ok()),
            data: BytesMut::new(),
        },
        None => Field::Text { name, value: BytesMut::new() },
    })
}

fn finish_field(form: &mut Form, field: Option<Field>) {
    match field {
        Some(Field::Text { name, value }) => {
            form.fields.push((name, String::from_utf8_lossy(&value).into_owned()));
        }
        Some(Field::File { name, file_name, content_type, data }) => {
            form.files.push(FormFile { name, file_name, content_type, data: data.freeze() });
        }
        None => {}
    }
}

/// Splits `form-data; name="a"; filename="b.txt"` into its parameters.
///
/// Returns `None` unless the disposition type is `form-data`.
fn disposition_params(value: &str) -> Option<Vec<(String, String)>> {
    let mut pieces = value.split(';').map(str::trim);
    if !pieces.next()?.eq_ignore_ascii_case("form-data") {
        return None;
    }

    let params = pieces
        .filter_map(|piece| {
            let (key, value) = piece.split_once('=')?;
            let value = value.trim();
            let value = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')).unwrap_or(value);
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect();
    Some(params)
}

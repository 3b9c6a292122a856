//! Response value objects and the redirect audit trail

use crate::{error::Error, header::Header, request::Request};

/// A parsed response: status line, header fields and the body received so far.
///
/// A [`Response`] handed to a completion handler always carries exactly `Content-Length` body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status_code: u16,
    status_message: String,
    header: Header,
    body: Vec<u8>,
}
impl Response {
    pub fn new(status_code: u16, status_message: String, header: Header) -> Self {
        Self {
            status_code,
            status_message,
            header,
            body: Vec::new(),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status_code)
    }

    /// Number of body bytes declared by the header, with statuses that never carry a body reported as `0`.
    pub fn expected_body_len(&self) -> Option<usize> {
        match self.status_code {
            100..=199 | 204 | 304 => Some(0),
            _ => self.header.content_length(),
        }
    }

    pub(crate) fn append_body(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }
}

impl TryFrom<Response> for http::Response<Vec<u8>> {
    type Error = Error;

    fn try_from(value: Response) -> Result<Self, Self::Error> {
        let mut builder = http::Response::builder().status(value.status_code);
        for entry in value.header.iter() {
            builder = builder.header(entry.name.as_str(), entry.value.as_str());
        }
        builder
            .body(value.body)
            .map_err(|_| Error::InvalidResponseHeader)
    }
}

/// One followed redirect: the request that was sent and the 3xx response it produced.
///
/// Entries are immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectEntry {
    request: Request,
    response: Response,
}
impl RedirectEntry {
    pub(crate) fn new(request: Request, response: Response) -> Self {
        Self { request, response }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn response(&self) -> &Response {
        &self.response
    }
}

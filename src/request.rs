//! Request value objects and the endpoint they resolve to

use std::fmt::{self, Display};

use url::Url;

use crate::{
    error::Error,
    header::{Form, Header, CONTENT_TYPE, HOST},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}
impl Scheme {
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    /// Whether connections for this scheme are wrapped in TLS
    pub fn is_tls(&self) -> bool {
        *self == Self::Https
    }

    fn from_url(url: &Url) -> Result<Self, Error> {
        match url.scheme() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            other => Err(Error::InvalidUrl(format!(
                "unsupported scheme '{other}' in {url}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}
impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}
impl Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `(scheme, host, port)` a connection is opened to.
///
/// Sessions and connections are compatible iff their endpoints are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}
impl Endpoint {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }
}
impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.host)?;
        if self.port != self.scheme.default_port() {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}

/// An HTTP request: URL, method, ordered header and an optional body.
///
/// The `Host` field is populated on construction. The endpoint, request path and host header value are derived from the URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    url: Url,
    method: Method,
    header: Header,
    body: Option<Vec<u8>>,
    endpoint: Endpoint,
}
impl Request {
    /// Create a request, failing for URLs without a host or with a scheme other than `http`/`https`.
    pub fn new(url: Url, method: Method) -> Result<Self, Error> {
        let scheme = Scheme::from_url(&url)?;
        let host = match url.host_str() {
            Some(x) if !x.is_empty() => x.to_owned(),
            _ => return Err(Error::InvalidUrl(format!("missing host in {url}"))),
        };
        let port = url.port().unwrap_or_else(|| scheme.default_port());
        let mut request = Self {
            url,
            method,
            header: Header::new(),
            body: None,
            endpoint: Endpoint::new(scheme, host, port),
        };
        let host_header = request.host_header();
        request.header.set(HOST, host_header);
        Ok(request)
    }

    pub fn get(url: &str) -> Result<Self, Error> {
        Self::new(Url::parse(url)?, Method::Get)
    }

    pub fn post(url: &str) -> Result<Self, Error> {
        Self::new(Url::parse(url)?, Method::Post)
    }

    /// Attach a POST body, setting `Content-Type` and `Content-Length` accordingly.
    pub fn set_post_body<B: IntoBody>(&mut self, content_type: &str, body: B) {
        let body = body.into_body();
        self.header.set(CONTENT_TYPE, content_type);
        self.header.set_content_length(Some(body.len()));
        self.body = Some(body);
    }

    /// Attach the url-encoded `form` as the POST body.
    pub fn set_form(&mut self, form: &Form) {
        self.set_post_body(Form::CONTENT_TYPE, form.encode());
    }

    /// Builder-style [`Request::set_post_body`]
    pub fn with_post_body<B: IntoBody>(mut self, content_type: &str, body: B) -> Self {
        self.set_post_body(content_type, body);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn scheme(&self) -> Scheme {
        self.endpoint.scheme
    }

    pub fn host(&self) -> &str {
        &self.endpoint.host
    }

    /// The port that will be connected to, which is the scheme default when the URL does not name one.
    pub fn port(&self) -> u16 {
        self.endpoint.port
    }

    /// The request target: URL path (`/` if empty) followed by `?query` when present.
    pub fn path(&self) -> String {
        let mut path = match self.url.path() {
            "" => "/".to_owned(),
            x => x.to_owned(),
        };
        if let Some(query) = self.url.query() {
            path.push('?');
            path.push_str(query);
        }
        path
    }

    /// The `Host` field value: the host, plus `:port` when the port is not the scheme default.
    pub fn host_header(&self) -> String {
        if self.endpoint.port == self.endpoint.scheme.default_port() {
            self.endpoint.host.clone()
        } else {
            format!("{}:{}", self.endpoint.host, self.endpoint.port)
        }
    }

    /// Build the request that follows a redirect to `url`.
    ///
    /// `307` and `308` repeat the method and body along with the caller's content fields.
    /// Every other status issues a bare GET with only the derived `Host` field.
    pub(crate) fn redirected(&self, url: Url, status_code: u16) -> Result<Self, Error> {
        match status_code {
            307 | 308 => {
                let mut request = Self::new(url, self.method)?;
                if let Some(body) = self.body.as_ref() {
                    let content_type = self
                        .header
                        .get(CONTENT_TYPE)
                        .unwrap_or("application/octet-stream")
                        .to_owned();
                    request.set_post_body(&content_type, body.clone());
                }
                Ok(request)
            }
            _ => Self::new(url, Method::Get),
        }
    }
}

impl<B: IntoBody> TryFrom<http::Request<B>> for Request {
    type Error = Error;

    fn try_from(value: http::Request<B>) -> Result<Self, Self::Error> {
        let (parts, body) = value.into_parts();
        let method = match parts.method {
            http::Method::GET => Method::Get,
            http::Method::POST => Method::Post,
            other => return Err(Error::UnsupportedMethod(other.to_string())),
        };
        let mut request = Self::new(Url::parse(&parts.uri.to_string())?, method)?;
        let mut content_type = None;
        for (name, value) in parts.headers.iter() {
            let value = value.to_str().map_err(|_| {
                Error::InvalidUrl(format!("header '{}' is not visible ascii", name.as_str()))
            })?;
            if name == http::header::CONTENT_TYPE {
                content_type = Some(value.to_owned());
            } else if name != http::header::HOST && name != http::header::CONTENT_LENGTH {
                request.header.append(name.as_str(), value);
            }
        }
        let body = body.into_body();
        if !body.is_empty() {
            let content_type = content_type.unwrap_or_else(|| "application/octet-stream".into());
            request.set_post_body(&content_type, body);
        } else if let Some(content_type) = content_type {
            request.header.set(CONTENT_TYPE, content_type);
        }
        Ok(request)
    }
}

/// Extensible public trait to support serializing a variety of body types.
pub trait IntoBody {
    fn into_body(self) -> Vec<u8>;
}
impl IntoBody for String {
    fn into_body(self) -> Vec<u8> {
        self.into_bytes()
    }
}
impl IntoBody for &str {
    fn into_body(self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}
impl IntoBody for Vec<u8> {
    fn into_body(self) -> Vec<u8> {
        self
    }
}
impl IntoBody for &[u8] {
    fn into_body(self) -> Vec<u8> {
        self.to_vec()
    }
}
impl IntoBody for () {
    fn into_body(self) -> Vec<u8> {
        Vec::new()
    }
}

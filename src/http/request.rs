use crate::http::parser::{Callbacks, Rejected};

/// A fully parsed HTTP/1.1 request.
///
/// Header names are lowercase (the parser normalizes them); values keep
/// their wire form. The body is assembled, chunked or not.
#[derive(Debug, Default, Clone)]
pub struct Request {
    /// Request method, e.g. `GET`.
    pub method: String,
    /// Percent-encoded path.
    pub path: String,
    /// Query string, without the `?`.
    pub query: Option<String>,
    /// The `HTTP/x.y` token.
    pub version: String,
    /// Headers in arrival order, names lowercase.
    pub headers: Vec<(String, String)>,
    /// Assembled request body.
    pub body: Vec<u8>,
}

impl Request {
    /// First value of `name` (lowercase), if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the client asked to keep the connection open. HTTP/1.1
    /// defaults to keep-alive; `Connection: close` opts out.
    pub fn keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(value) => !value.eq_ignore_ascii_case("close"),
            None => !self.version.ends_with("1.0"),
        }
    }
}

/// Collects parser callbacks into [`Request`] values, enforcing the
/// header-count and body-size limits.
#[derive(Debug)]
pub struct RequestBuilder {
    current: Request,
    ready: Vec<Request>,
    max_headers: usize,
    max_body: usize,
}

impl Default for RequestBuilder {
    fn default() -> RequestBuilder {
        RequestBuilder::new()
    }
}

impl RequestBuilder {
    pub fn new() -> RequestBuilder {
        RequestBuilder {
            current: Request::default(),
            ready: Vec::new(),
            max_headers: 64,
            max_body: 512 * 1024,
        }
    }

    /// Overrides the default header-count limit (64).
    pub fn max_headers(mut self, limit: usize) -> RequestBuilder {
        self.max_headers = limit;
        self
    }

    /// Overrides the default body-size limit (512 KiB).
    pub fn max_body(mut self, limit: usize) -> RequestBuilder {
        self.max_body = limit;
        self
    }

    /// Takes the next completed request, in arrival order.
    pub fn next_request(&mut self) -> Option<Request> {
        if self.ready.is_empty() {
            None
        } else {
            Some(self.ready.remove(0))
        }
    }
}

impl Callbacks for RequestBuilder {
    fn on_method(&mut self, method: &[u8]) -> Result<(), Rejected> {
        self.current.method = String::from_utf8_lossy(method).into_owned();
        Ok(())
    }

    fn on_path(&mut self, path: &[u8]) -> Result<(), Rejected> {
        self.current.path = String::from_utf8_lossy(path).into_owned();
        Ok(())
    }

    fn on_query(&mut self, query: &[u8]) -> Result<(), Rejected> {
        self.current.query = Some(String::from_utf8_lossy(query).into_owned());
        Ok(())
    }

    fn on_http_version(&mut self, version: &[u8]) -> Result<(), Rejected> {
        self.current.version = String::from_utf8_lossy(version).into_owned();
        Ok(())
    }

    fn on_header(&mut self, name: &[u8], value: &[u8]) -> Result<(), Rejected> {
        if self.current.headers.len() >= self.max_headers {
            return Err(Rejected);
        }
        self.current.headers.push((
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        ));
        Ok(())
    }

    fn on_body_chunk(&mut self, data: &[u8]) -> Result<(), Rejected> {
        if self.current.body.len() + data.len() > self.max_body {
            return Err(Rejected);
        }
        self.current.body.extend_from_slice(data);
        Ok(())
    }

    fn on_request(&mut self) -> Result<(), Rejected> {
        self.ready.push(std::mem::take(&mut self.current));
        Ok(())
    }

    fn on_error(&mut self) {
        self.current = Request::default();
    }
}

//! HTTP/1.1: a restartable request/response parser and a response writer.
//!
//! The parser ([`Parser`] + [`Callbacks`]) is push-based and
//! allocation-light; [`RequestBuilder`] sits on top of it when assembled
//! [`Request`] values are more convenient than streaming callbacks. The
//! writer ([`Response`]) renders status line, headers and cookies, and
//! routes bodies — including `sendfile`-backed file bodies and range
//! slices — through the socket layer.

mod parser;
mod request;
mod response;
mod status;

pub use self::parser::{Callbacks, Parser, Rejected};
pub use self::request::{Request, RequestBuilder};
pub use self::response::{
    format_date, parse_date, send_file_for, Cookie, Response,
};
pub use self::status::{ext_to_mime, status_str};

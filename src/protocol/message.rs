//! Request/response records and the envelope that carries them.
//!
//! Every application frame body is one [`Envelope`]: exactly one of
//! a [`Request`] or a [`Response`], encoded with `postcard`.  The
//! transport never looks inside the entities; it only needs the
//! request id (for correlation) and the command name (for dispatch).

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::EntityBag;

/// Outcome of a call.  Values are fixed and shared with peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ResultCode {
    Ok = 0,
    UnknownError = 1,
    Timeout = 2,
    QueueFull = 3,
    DuplicateReqId = 4,
    ClientException = 5,
    ClientInterrupt = 6,
    ServerException = 7,
    LinkBroken = 8,
    HandlerNotFound = 9,
    InvalidRequest = 10,
}

impl ResultCode {
    /// Numeric wire value.
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => ResultCode::Ok,
            1 => ResultCode::UnknownError,
            2 => ResultCode::Timeout,
            3 => ResultCode::QueueFull,
            4 => ResultCode::DuplicateReqId,
            5 => ResultCode::ClientException,
            6 => ResultCode::ClientInterrupt,
            7 => ResultCode::ServerException,
            8 => ResultCode::LinkBroken,
            9 => ResultCode::HandlerNotFound,
            10 => ResultCode::InvalidRequest,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            ResultCode::Ok => "OK",
            ResultCode::UnknownError => "UNKNOWN_ERROR",
            ResultCode::Timeout => "TIMEOUT",
            ResultCode::QueueFull => "QUEUE_FULL",
            ResultCode::DuplicateReqId => "DUPLICATE_REQID",
            ResultCode::ClientException => "CLIENT_EXCEPTION",
            ResultCode::ClientInterrupt => "CLIENT_INTERRUPT",
            ResultCode::ServerException => "SERVER_EXCEPTION",
            ResultCode::LinkBroken => "LINK_BROKEN",
            ResultCode::HandlerNotFound => "HANDLER_NOT_FOUND",
            ResultCode::InvalidRequest => "INVALID_REQUEST",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A call from one peer to the other.
///
/// The request id defaults to a random UUID; use
/// [`with_id`](Self::with_id) when the caller needs to pick its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    req_id: String,
    cmd: String,
    entities: EntityBag,
}

impl Request {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), cmd)
    }

    pub fn with_id(req_id: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            req_id: req_id.into(),
            cmd: cmd.into(),
            entities: EntityBag::new(),
        }
    }

    pub fn req_id(&self) -> &str {
        &self.req_id
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    pub fn entities(&self) -> &EntityBag {
        &self.entities
    }

    pub fn entities_mut(&mut self) -> &mut EntityBag {
        &mut self.entities
    }

    /// Build a response that echoes this request's id.
    pub fn reply(&self, result: ResultCode) -> Response {
        Response::new(self.req_id.clone(), result)
    }

    /// Encode as a request envelope.
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        Envelope::encode_request(self)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}] {:?}", self.cmd, self.req_id, self.entities)
    }
}

/// The answer to a [`Request`].
///
/// Responses are produced by handlers, or synthesized locally by the
/// transport (timeouts, broken links and so on).  Synthesized
/// responses never cross the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    req_id: String,
    result: ResultCode,
    errmsg: String,
    entities: EntityBag,
}

impl Response {
    pub fn new(req_id: impl Into<String>, result: ResultCode) -> Self {
        Self::with_errmsg(req_id, result, String::new())
    }

    pub fn with_errmsg(
        req_id: impl Into<String>,
        result: ResultCode,
        errmsg: impl Into<String>,
    ) -> Self {
        Self {
            req_id: req_id.into(),
            result,
            errmsg: errmsg.into(),
            entities: EntityBag::new(),
        }
    }

    pub fn req_id(&self) -> &str {
        &self.req_id
    }

    pub fn result(&self) -> ResultCode {
        self.result
    }

    pub fn is_ok(&self) -> bool {
        self.result == ResultCode::Ok
    }

    pub fn errmsg(&self) -> &str {
        &self.errmsg
    }

    pub fn set_errmsg(&mut self, errmsg: impl Into<String>) {
        self.errmsg = errmsg.into();
    }

    pub fn entities(&self) -> &EntityBag {
        &self.entities
    }

    pub fn entities_mut(&mut self) -> &mut EntityBag {
        &mut self.entities
    }

    /// Replace the entities wholesale, e.g. to echo a request's bag.
    pub fn with_entities(mut self, entities: EntityBag) -> Self {
        self.entities = entities;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        Envelope::encode_response(self)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            write!(f, "OK[{}] {:?}", self.req_id, self.entities)
        } else {
            write!(f, "{}:{}", self.result, self.errmsg)
        }
    }
}

/// Tagged union transmitted as one frame body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    Request(Request),
    Response(Response),
}

// Borrowing twin of `Envelope` so a request or response can be
// encoded without cloning it.  Variant order must match `Envelope`.
#[derive(Serialize)]
enum EnvelopeRef<'a> {
    Request(&'a Request),
    Response(&'a Response),
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_stdvec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }

    pub fn encode_request(request: &Request) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_stdvec(&EnvelopeRef::Request(request))
    }

    pub fn encode_response(response: &Response) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_stdvec(&EnvelopeRef::Response(response))
    }
}

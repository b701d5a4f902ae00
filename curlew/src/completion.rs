//! Finished-transfer records handed to the consumer.

use std::fmt;

use bytes::Bytes;
use crossbeam_channel::Sender;

use crate::chain;
use crate::channel::Release;
use crate::engine::{Timings, TransferId, TransferInfo, TransferSizes};
use crate::error::TransferError;
use crate::request::Token;
use crate::session::SessionKey;
use crate::transfer::Transfer;

/// Outcome of one submitted request.
///
/// Exactly one `Completion` is produced per accepted submission. Either
/// [`error`](Self::error) or [`response`](Self::response) is present, never
/// both. Dropping it releases the engine's remaining state for the transfer
/// on the reactor thread.
pub struct Completion {
    token: Token,
    error: Option<String>,
    response: Option<Response>,
    _ticket: Option<ReleaseTicket>,
}

impl Completion {
    pub(crate) fn finished(
        transfer: Transfer,
        result: Result<(), TransferError>,
        info: TransferInfo,
        ticket: ReleaseTicket,
    ) -> Self {
        match result {
            Ok(()) => Completion {
                token: transfer.token,
                error: None,
                response: Some(Response::new(transfer, info)),
                _ticket: Some(ticket),
            },
            Err(err) => Completion {
                token: transfer.token,
                error: Some(err.to_string()),
                response: None,
                _ticket: Some(ticket),
            },
        }
    }

    /// A transfer the engine refused. The engine holds no state for it.
    pub(crate) fn rejected(transfer: Transfer, err: TransferError) -> Self {
        Completion {
            token: transfer.token,
            error: Some(err.to_string()),
            response: None,
            _ticket: None,
        }
    }

    /// A dummy request: success with empty buffers.
    pub(crate) fn dummy(transfer: Transfer) -> Self {
        Completion {
            token: transfer.token,
            error: None,
            response: Some(Response::new(transfer, TransferInfo::default())),
            _ticket: None,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Transport-level failure description.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    /// Split into the response or the error string.
    pub fn into_result(self) -> Result<Response, String> {
        match (self.response, self.error) {
            (Some(response), None) => Ok(response),
            (_, Some(error)) => Err(error),
            (None, None) => Err(String::new()),
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("token", &self.token)
            .field("error", &self.error)
            .field("response", &self.response)
            .finish()
    }
}

/// A transfer's response: raw header lines, body chunks and metadata.
#[derive(Debug, Clone, Default)]
pub struct Response {
    response_code: u32,
    headers: Vec<Bytes>,
    header_len: usize,
    body: Vec<Bytes>,
    body_len: usize,
    effective_url: Option<String>,
    redirect_url: Option<String>,
    timings: Timings,
    sizes: TransferSizes,
    cookies: Vec<String>,
}

impl Response {
    fn new(transfer: Transfer, info: TransferInfo) -> Self {
        let header_len = transfer.headers.len();
        let body_len = transfer.body.len();
        Response {
            response_code: info.response_code,
            headers: transfer.headers.into_chunks(),
            header_len,
            body: transfer.body.into_chunks(),
            body_len,
            effective_url: info.effective_url,
            redirect_url: info.redirect_url,
            timings: info.timings,
            sizes: info.sizes,
            cookies: info.cookies,
        }
    }

    /// Status code of the final response head. Zero for dummy requests.
    pub fn response_code(&self) -> u32 {
        self.response_code
    }

    /// Raw header chunks, one per header callback, in arrival order.
    pub fn header_chunks(&self) -> &[Bytes] {
        &self.headers
    }

    /// Body chunks in arrival order.
    pub fn body_chunks(&self) -> &[Bytes] {
        &self.body
    }

    pub fn header_bytes(&self) -> Bytes {
        chain::concat(&self.headers, self.header_len)
    }

    pub fn body_bytes(&self) -> Bytes {
        chain::concat(&self.body, self.body_len)
    }

    pub fn body_len(&self) -> usize {
        self.body_len
    }

    /// Body decoded as UTF-8, with invalid sequences replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body_bytes()).into_owned()
    }

    /// First value of header `name` (case-insensitive) in the final response
    /// head. Interim 1xx heads are skipped.
    pub fn header(&self, name: &str) -> Option<String> {
        self.header_fields()
            .into_iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// `(name, value)` pairs of the final response head.
    pub fn header_fields(&self) -> Vec<(String, String)> {
        let raw = self.header_bytes();
        let text = String::from_utf8_lossy(&raw);
        let mut fields = Vec::new();
        for line in text.split("\r\n") {
            if line.starts_with("HTTP/") {
                fields.clear();
            } else if let Some((name, value)) = line.split_once(':') {
                fields.push((name.trim().to_string(), value.trim().to_string()));
            }
        }
        fields
    }

    pub fn effective_url(&self) -> Option<&str> {
        self.effective_url.as_deref()
    }

    pub fn redirect_url(&self) -> Option<&str> {
        self.redirect_url.as_deref()
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    pub fn sizes(&self) -> &TransferSizes {
        &self.sizes
    }

    /// Session cookies after the transfer, in Netscape format.
    pub fn cookies(&self) -> &[String] {
        &self.cookies
    }
}

/// Sends a transfer release to the reactor when dropped.
pub(crate) struct ReleaseTicket {
    session: SessionKey,
    id: TransferId,
    tx: Sender<Release>,
}

impl ReleaseTicket {
    pub(crate) fn new(session: SessionKey, id: TransferId, tx: Sender<Release>) -> Self {
        ReleaseTicket { session, id, tx }
    }
}

impl Drop for ReleaseTicket {
    fn drop(&mut self) {
        // The reactor may be gone, in which case the engine went with it.
        let _ = self.tx.send(Release::Transfer {
            session: self.session,
            id: self.id,
        });
    }
}

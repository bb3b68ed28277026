// Socket URL construction.
//
// The socket origin mirrors the page origin (`http` -> `ws`, `https` ->
// `wss`); the path comes from the draft flavor. Team drafts and hero drafts
// speak the same frame protocol and differ only in route.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use url::Url;

use crate::protocol::{decode_frame, DraftId, InboundFrame, ProtocolError};

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid origin `{origin}`: {source}")]
    InvalidOrigin {
        origin: String,
        source: url::ParseError,
    },

    #[error("unsupported origin scheme `{0}` (expected http, https, ws or wss)")]
    UnsupportedScheme(String),

    #[error("origin `{0}` has no host")]
    MissingHost(String),
}

/// Route and frame decoder for one kind of draft.
///
/// Both built-in flavors share the `initial_events`/`draft_event` frames and
/// the event payload set in `protocol`. A flavor whose server sends other
/// frames overrides `decode` and translates them into `InboundFrame`.
pub trait DraftFlavor: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Absolute socket path for a draft, e.g. `/ws/draft/42/`.
    fn path(&self, draft_id: DraftId) -> String;

    fn decode(&self, text: &str) -> Result<InboundFrame, ProtocolError> {
        decode_frame(text)
    }
}

/// Captains picking players onto teams.
#[derive(Debug, Clone, Copy, Default)]
pub struct TeamDraft;

impl DraftFlavor for TeamDraft {
    fn name(&self) -> &'static str {
        "team draft"
    }

    fn path(&self, draft_id: DraftId) -> String {
        format!("/ws/draft/{draft_id}/")
    }
}

/// Captains picking and banning heroes for a match. Uses the shared frame
/// decoder, so only the shared event types are understood and any other
/// event is dropped as a malformed frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeroDraft;

impl DraftFlavor for HeroDraft {
    fn name(&self) -> &'static str {
        "hero draft"
    }

    fn path(&self, draft_id: DraftId) -> String {
        format!("/ws/herodraft/{draft_id}/")
    }
}

/// Parse an origin and return it with the matching socket scheme.
pub fn socket_origin(origin: &str) -> Result<Url, EndpointError> {
    let mut url = parse_origin(origin)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(EndpointError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|()| EndpointError::UnsupportedScheme(url.scheme().to_string()))?;
    Ok(url)
}

/// Parse an origin and return it with the matching HTTP scheme.
pub fn http_origin(origin: &str) -> Result<Url, EndpointError> {
    let mut url = parse_origin(origin)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "http",
        "https" | "wss" => "https",
        other => return Err(EndpointError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|()| EndpointError::UnsupportedScheme(url.scheme().to_string()))?;
    Ok(url)
}

fn parse_origin(origin: &str) -> Result<Url, EndpointError> {
    let url = Url::parse(origin).map_err(|source| EndpointError::InvalidOrigin {
        origin: origin.to_string(),
        source,
    })?;
    if url.host_str().is_none() {
        return Err(EndpointError::MissingHost(origin.to_string()));
    }
    Ok(url)
}

/// A socket origin bound to a draft flavor.
#[derive(Clone)]
pub struct Endpoint {
    origin: Url,
    flavor: Arc<dyn DraftFlavor>,
}

impl Endpoint {
    pub fn new(origin: &str, flavor: Arc<dyn DraftFlavor>) -> Result<Self, EndpointError> {
        Ok(Self {
            origin: socket_origin(origin)?,
            flavor,
        })
    }

    pub fn team_draft(origin: &str) -> Result<Self, EndpointError> {
        Self::new(origin, Arc::new(TeamDraft))
    }

    pub fn hero_draft(origin: &str) -> Result<Self, EndpointError> {
        Self::new(origin, Arc::new(HeroDraft))
    }

    pub fn flavor(&self) -> &dyn DraftFlavor {
        self.flavor.as_ref()
    }

    pub fn url(&self, draft_id: DraftId) -> Result<Url, EndpointError> {
        let path = self.flavor.path(draft_id);
        self.origin
            .join(&path)
            .map_err(|source| EndpointError::InvalidOrigin {
                origin: format!("{}{path}", self.origin),
                source,
            })
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("origin", &self.origin.as_str())
            .field("flavor", &self.flavor.name())
            .finish()
    }
}

// Active-turn poller.
//
// Asks the server on a fixed interval whether the signed-in user has a pick
// pending in any draft. It runs independently of the draft socket, so a
// missed or dropped socket never hides a turn. Failures are quiet: they
// publish "no active turn" and log at debug level.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use url::Url;

use crate::connection::{http_origin, EndpointError};
use crate::protocol::DraftId;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// A poll that has not answered by now reads as "no active turn".
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const ACTIVE_TURN_PATH: &str = "/api/active-draft-for-user/";

#[derive(Debug, Error)]
pub enum PollError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server answered {0}")]
    Status(reqwest::StatusCode),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

/// Result of one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ActiveTurn {
    #[serde(default)]
    pub has_active_turn: bool,
    #[serde(default, alias = "draft_pk")]
    pub draft_id: Option<DraftId>,
    #[serde(default, alias = "tournament_pk")]
    pub tournament_id: Option<i64>,
}

impl ActiveTurn {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Who the poll is made for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    /// Value of the `sessionid` cookie, when authenticating by session.
    pub session_cookie: Option<String>,
}

#[async_trait]
pub trait ActiveTurnSource: Send + Sync + 'static {
    async fn fetch(&self, identity: &Identity) -> Result<ActiveTurn, PollError>;
}

/// Polls the site's REST endpoint.
pub struct HttpActiveTurnSource {
    http: reqwest::Client,
    url: Url,
}

impl HttpActiveTurnSource {
    pub fn new(origin: &str) -> Result<Self, PollError> {
        let url = http_origin(origin)?
            .join(ACTIVE_TURN_PATH)
            .map_err(|source| EndpointError::InvalidOrigin {
                origin: origin.to_string(),
                source,
            })?;
        Ok(Self {
            http: reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            url,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl ActiveTurnSource for HttpActiveTurnSource {
    async fn fetch(&self, identity: &Identity) -> Result<ActiveTurn, PollError> {
        let mut request = self
            .http
            .get(self.url.clone())
            .header("accept", "application/json");
        if let Some(session) = &identity.session_cookie {
            request = request.header("cookie", format!("sessionid={session}"));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PollError::Status(status));
        }
        Ok(response.json::<ActiveTurn>().await?)
    }
}

// ---------------------------------------------------------------------------
// Poll loop
// ---------------------------------------------------------------------------

/// Handle to a running poller. Dropping it stops the loop.
pub struct ActiveTurnPoller {
    turn: watch::Receiver<ActiveTurn>,
    task: JoinHandle<()>,
}

impl ActiveTurnPoller {
    pub fn current(&self) -> ActiveTurn {
        self.turn.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ActiveTurn> {
        self.turn.clone()
    }
}

impl Drop for ActiveTurnPoller {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start polling. `identity` can change at any time; a change cancels the
/// request in flight and clears the published turn until the next answer.
/// `None`, or dropping the sender, publishes "no active turn".
pub fn spawn_poller(
    source: Arc<dyn ActiveTurnSource>,
    interval: Duration,
    mut identity: watch::Receiver<Option<Identity>>,
) -> ActiveTurnPoller {
    let (turn_tx, turn) = watch::channel(ActiveTurn::none());

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(?interval, "Active-turn poller started");

        'poll: loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let current = identity.borrow_and_update().clone();
                    let Some(who) = current else {
                        publish(&turn_tx, ActiveTurn::none());
                        continue;
                    };

                    let request = tokio::time::timeout(REQUEST_TIMEOUT, source.fetch(&who));
                    let outcome = tokio::select! {
                        outcome = request => outcome,
                        changed = identity.changed() => {
                            debug!(user_id = who.user_id, "Identity changed, dropping poll in flight");
                            publish(&turn_tx, ActiveTurn::none());
                            if changed.is_err() {
                                debug!("Identity source dropped, stopping poller");
                                break 'poll;
                            }
                            ticker.reset_immediately();
                            continue;
                        }
                    };
                    let result = match outcome {
                        Ok(Ok(turn)) => turn,
                        Ok(Err(e)) => {
                            debug!(user_id = who.user_id, "Active-turn poll failed: {e}");
                            ActiveTurn::none()
                        }
                        Err(_) => {
                            debug!(
                                user_id = who.user_id,
                                "Active-turn poll timed out after {REQUEST_TIMEOUT:?}"
                            );
                            ActiveTurn::none()
                        }
                    };
                    publish(&turn_tx, result);
                }
                changed = identity.changed() => {
                    publish(&turn_tx, ActiveTurn::none());
                    if changed.is_err() {
                        debug!("Identity source dropped, stopping poller");
                        break;
                    }
                    // Poll right away for the new identity.
                    ticker.reset_immediately();
                }
            }
        }
    });

    ActiveTurnPoller { turn, task }
}

fn publish(turn_tx: &watch::Sender<ActiveTurn>, next: ActiveTurn) {
    turn_tx.send_if_modified(|turn| {
        if *turn == next {
            false
        } else {
            *turn = next;
            true
        }
    });
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

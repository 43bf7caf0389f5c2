//! Liveness handshake between the scheduler's view of a node's advertised
//! devices and the node agent that maintains the advertisement.
//!
//! The node agent keeps the handshake annotation at `Confirmed`. Whenever the
//! scheduler sees a value it has never negotiated (a fresh node, or an agent
//! that rolled its state), it stamps `Requesting_<now>`; the agent is
//! expected to flip it back to `Confirmed`. A node that stays in
//! `Requesting` past the timeout advertised devices and then disappeared;
//! the scheduler retires its advertisement with a `Deleted_<now>` stamp.

use chrono::DateTime;
use chrono::Duration;
use chrono::NaiveDateTime;
use chrono::Utc;

/// Timestamp layout used inside handshake annotation values.
pub const HANDSHAKE_TIME_LAYOUT: &str = "%Y.%m.%d %H:%M:%S";

const CONFIRMED_VALUE: &str = "Confirmed";
const REQUESTING_PREFIX: &str = "Requesting";
const DELETED_PREFIX: &str = "Deleted";

/// Parsed handshake annotation state.
///
/// `Requesting(None)` is a `Requesting` stamp whose timestamp did not parse;
/// it is treated as already expired so a garbled stamp cannot keep a stale
/// advertisement alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Unconfirmed,
    Requesting(Option<DateTime<Utc>>),
    Deleted,
    Confirmed,
}

impl HandshakeState {
    pub fn parse(value: &str) -> Self {
        if value == CONFIRMED_VALUE {
            return Self::Confirmed;
        }
        if value.contains(REQUESTING_PREFIX) {
            let ts = value
                .split_once('_')
                .and_then(|(_, stamp)| NaiveDateTime::parse_from_str(stamp, HANDSHAKE_TIME_LAYOUT).ok())
                .map(|naive| naive.and_utc());
            return Self::Requesting(ts);
        }
        if value.contains(DELETED_PREFIX) {
            return Self::Deleted;
        }
        Self::Unconfirmed
    }
}

/// What node registration should do with the pool it just decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Advertisement is live; keep the pool.
    KeepPool,
    /// First observation: keep the pool and stamp `Requesting_<now>`.
    KeepPoolAndPatch(String),
    /// Advertisement already retired; treat the node as having no devices.
    DropPool,
    /// Handshake expired: retire the advertisement with a `Deleted_<now>`
    /// stamp and treat the node as having no devices.
    DropPoolAndPatch(String),
}

/// Evaluate the handshake against `now`. `timeout` is how long a node may
/// stay in `Requesting` before its advertisement is considered stale.
pub fn evaluate(state: &HandshakeState, now: DateTime<Utc>, timeout: Duration) -> HandshakeAction {
    match state {
        HandshakeState::Confirmed => HandshakeAction::KeepPool,
        HandshakeState::Requesting(Some(since)) if now <= *since + timeout => {
            HandshakeAction::KeepPool
        }
        HandshakeState::Requesting(_) => HandshakeAction::DropPoolAndPatch(deleted_value(now)),
        HandshakeState::Deleted => HandshakeAction::DropPool,
        HandshakeState::Unconfirmed => HandshakeAction::KeepPoolAndPatch(requesting_value(now)),
    }
}

pub fn requesting_value(now: DateTime<Utc>) -> String {
    format!("{REQUESTING_PREFIX}_{}", now.format(HANDSHAKE_TIME_LAYOUT))
}

pub fn deleted_value(now: DateTime<Utc>) -> String {
    format!("{DELETED_PREFIX}_{}", now.format(HANDSHAKE_TIME_LAYOUT))
}

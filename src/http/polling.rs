//! Long-polling transport observation.
//!
//! Plain exchanges under the polling path carry engine packets in their
//! bodies. Once a body has been captured whole, [`PollingTap`] splits it
//! into packets, reports each one and feeds callback ids to the shared
//! [`PollingSessions`] table so acks pair up across exchanges.

use axum::http::{Method, Uri};

use crate::config::ProxyConfig;
use crate::net::ExchangeId;
use crate::observability::{Observation, Observer};
use crate::protocol::polling::{decode_payload, PollingSessions};
use crate::protocol::Direction;

/// Value of a query parameter, undecoded.
pub fn query_param<'a>(uri: &'a Uri, name: &str) -> Option<&'a str> {
    uri.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find_map(|(key, value)| (key == name).then_some(value))
}

/// True for requests of the polling transport.
pub fn is_polling_request(config: &ProxyConfig, uri: &Uri) -> bool {
    uri.path().starts_with(&config.capture.polling_path)
        && query_param(uri, "transport") == Some("polling")
}

/// Which bodies of a polling exchange carry packets: uploads travel in
/// `POST` requests, downloads in `GET` responses.
pub fn carries_packets(method: &Method, direction: Direction) -> bool {
    match direction {
        Direction::ClientToUpstream => *method == Method::POST,
        Direction::UpstreamToClient => *method == Method::GET,
    }
}

/// Decodes one captured polling body and reports what it carried.
pub struct PollingTap {
    exchange: ExchangeId,
    direction: Direction,
    sid: Option<String>,
    observer: Observer,
    sessions: PollingSessions,
}

impl PollingTap {
    pub fn new(
        exchange: ExchangeId,
        direction: Direction,
        uri: &Uri,
        observer: Observer,
        sessions: PollingSessions,
    ) -> Self {
        Self {
            exchange,
            direction,
            sid: query_param(uri, "sid").map(str::to_owned),
            observer,
            sessions,
        }
    }

    pub fn inspect(self, body: &[u8]) {
        let packets = match decode_payload(body) {
            Ok(packets) => packets,
            Err(e) => {
                tracing::debug!(
                    exchange = %self.exchange,
                    direction = %self.direction,
                    error = %e,
                    "Polling body not decoded"
                );
                return;
            }
        };

        let outcomes = self
            .sessions
            .track(self.sid.as_deref(), self.direction, &packets);

        for (index, (summary, outcomes)) in packets.into_iter().zip(outcomes).enumerate() {
            self.observer.emit(Observation::Polled {
                exchange: self.exchange,
                direction: self.direction,
                seq: index as u64 + 1,
                summary,
            });
            for outcome in outcomes {
                self.observer.emit(Observation::Ack {
                    exchange: self.exchange,
                    outcome,
                });
            }
        }
    }
}

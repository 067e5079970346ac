//! HTTP/1.1 wire contract on hyper.
//!
//! ```text
//! Master                                   Secondary
//!   POST /messages   {id?, payload, w?}      POST /replicate  {seq, id, payload}
//!   GET  /messages                           GET  /messages
//!   GET  /entries?from_seq=&limit=           GET  /status
//!   GET  /replicas
//! ```
//!
//! Bodies are JSON. The server side is [`server`]; [`client`] holds the
//! master's replicate transport and the secondary's catch-up source.

pub mod client;
pub mod server;

pub use client::{HttpClient, HttpMasterSource, HttpReplicaTransport};
pub use server::{master_router, secondary_router, serve_master, serve_secondary};

use crate::types::RangeQuery;

/// Parse `from_seq` and `limit` from a query string, with defaults.
pub fn parse_range_query(query: Option<&str>) -> Result<RangeQuery, String> {
    let mut range = RangeQuery::default();
    for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            "from_seq" => {
                range.from_seq = value
                    .parse()
                    .map_err(|_| format!("invalid from_seq {value:?}"))?;
            }
            "limit" => {
                range.limit = value
                    .parse()
                    .map_err(|_| format!("invalid limit {value:?}"))?;
            }
            _ => {}
        }
    }
    Ok(range)
}

/// Join a base URL and a path without doubling slashes.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

//! Typed parsing of sentinel replies
//!
//! Each sentinel command used by the watchers gets a fixed record type here.
//! Shape mismatches fail with `Error::UnexpectedReply` instead of being
//! indexed blindly.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::protocol::RespValue;

use super::state::{Endpoint, MasterStatus, ObservedMaster};

/// One `master<N>:` line of the sentinel INFO output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterRecord {
    pub name: String,
    pub status: MasterStatus,
    pub address: Endpoint,
}

/// Parse all `master<N>:name=..,status=..,address=host:port,...` lines.
///
/// Lines that are not master records are skipped; a master line with a
/// missing or invalid field is an error.
pub fn parse_info_masters(info: &str) -> Result<Vec<MasterRecord>> {
    let mut records = Vec::new();

    for line in info.lines() {
        let Some(rest) = line.trim().strip_prefix("master") else {
            continue;
        };
        let Some((index, fields)) = rest.split_once(':') else {
            continue;
        };
        if !index.bytes().all(|b| b.is_ascii_digit()) {
            // e.g. master_repl_offset:... on a data node
            continue;
        }

        records.push(parse_master_line(fields)?);
    }

    Ok(records)
}

/// Observation of the named master from an INFO reply.
///
/// `Ok(None)` when the sentinel has no record for that name.
pub fn find_master(info: &str, master_name: &str) -> Result<Option<ObservedMaster>> {
    Ok(parse_info_masters(info)?
        .into_iter()
        .find(|record| record.name == master_name)
        .map(|record| ObservedMaster {
            address: record.address,
            status: record.status,
        }))
}

fn parse_master_line(fields: &str) -> Result<MasterRecord> {
    let mut name = None;
    let mut status = None;
    let mut address = None;

    for part in fields.split(',') {
        if let Some(value) = part.strip_prefix("name=") {
            name = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("status=") {
            status = Some(value.parse::<MasterStatus>()?);
        } else if let Some(value) = part.strip_prefix("address=") {
            let (host, port) = value
                .rsplit_once(':')
                .ok_or_else(|| Error::unexpected("INFO", format!("bad address '{}'", value)))?;
            address = Some(
                Endpoint::from_parts(host, port)
                    .ok_or_else(|| Error::unexpected("INFO", format!("bad address '{}'", value)))?,
            );
        }
    }

    match (name, status, address) {
        (Some(name), Some(status), Some(address)) => Ok(MasterRecord {
            name,
            status,
            address,
        }),
        _ => Err(Error::unexpected(
            "INFO",
            format!("incomplete master record '{}'", fields),
        )),
    }
}

/// Parse the `SENTINEL sentinels <name>` reply into peer endpoints
pub fn parse_sentinels(reply: RespValue) -> Result<Vec<Endpoint>> {
    const COMMAND: &str = "SENTINEL sentinels";

    let entries = reply
        .into_array()
        .ok_or_else(|| Error::unexpected(COMMAND, "expected an array of peers"))?;

    entries
        .into_iter()
        .map(|entry| {
            let fields = field_pairs(entry).ok_or_else(|| {
                Error::unexpected(COMMAND, "peer entry is not a list of field pairs")
            })?;
            let ip = fields
                .get("ip")
                .ok_or_else(|| Error::unexpected(COMMAND, "peer entry without ip"))?;
            let port = fields
                .get("port")
                .ok_or_else(|| Error::unexpected(COMMAND, "peer entry without port"))?;
            Endpoint::from_parts(ip, port)
                .ok_or_else(|| Error::unexpected(COMMAND, format!("bad peer address {}:{}", ip, port)))
        })
        .collect()
}

/// Turn `[k1, v1, k2, v2, ...]` into a map
fn field_pairs(entry: RespValue) -> Option<HashMap<String, String>> {
    let items = entry.into_array()?;
    if items.len() % 2 != 0 {
        return None;
    }

    let mut map = HashMap::with_capacity(items.len() / 2);
    for pair in items.chunks(2) {
        map.insert(pair[0].to_text()?, pair[1].to_text()?);
    }
    Some(map)
}

/// Parse the `SENTINEL get-master-addr-by-name <name>` reply.
///
/// A null reply means the sentinel doesn't know the master.
pub fn parse_master_addr(reply: RespValue) -> Result<Option<Endpoint>> {
    const COMMAND: &str = "SENTINEL get-master-addr-by-name";

    if reply.is_null() {
        return Ok(None);
    }

    let items = reply
        .into_array()
        .ok_or_else(|| Error::unexpected(COMMAND, "expected [host, port]"))?;

    match items.as_slice() {
        [host, port] => {
            let host = host
                .to_text()
                .ok_or_else(|| Error::unexpected(COMMAND, "host is not a string"))?;
            let port = port
                .to_text()
                .ok_or_else(|| Error::unexpected(COMMAND, "port is not a string"))?;
            Endpoint::from_parts(&host, &port)
                .map(Some)
                .ok_or_else(|| Error::unexpected(COMMAND, format!("bad address {}:{}", host, port)))
        }
        _ => Err(Error::unexpected(
            COMMAND,
            format!("expected 2 elements, got {}", items.len()),
        )),
    }
}

/// Verdict from `SENTINEL is-master-down-by-addr`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownVerdict {
    pub down: bool,
    /// Leader run id, `None` for the `*` marker
    pub leader: Option<String>,
}

pub fn parse_is_down(reply: RespValue) -> Result<DownVerdict> {
    const COMMAND: &str = "SENTINEL is-master-down-by-addr";

    let items = reply
        .into_array()
        .ok_or_else(|| Error::unexpected(COMMAND, "expected an array"))?;

    if items.len() < 2 {
        return Err(Error::unexpected(
            COMMAND,
            format!("expected at least 2 elements, got {}", items.len()),
        ));
    }

    let down = match items[0].to_integer() {
        Some(0) => false,
        Some(1) => true,
        _ => return Err(Error::unexpected(COMMAND, "down flag is not 0 or 1")),
    };
    let leader = items[1]
        .to_text()
        .filter(|runid| runid != "*" && !runid.is_empty());

    Ok(DownVerdict { down, leader })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENTINEL_INFO: &str = "# Server\r\nredis_version:7.0.0\r\nredis_mode:sentinel\r\n\r\n\
        # Sentinel\r\nsentinel_masters:2\r\nsentinel_tilt:0\r\n\
        master0:name=cache,status=ok,address=10.0.0.9:6380,slaves=1,sentinels=3\r\n\
        master1:name=mymaster,status=odown,address=10.0.0.1:6379,slaves=2,sentinels=3\r\n";

    #[test]
    fn test_parse_info_masters() {
        let records = parse_info_masters(SENTINEL_INFO).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "cache");
        assert_eq!(records[1].status, MasterStatus::ODown);
        assert_eq!(records[1].address, Endpoint::new("10.0.0.1", 6379));
    }

    #[test]
    fn test_find_master_by_name() {
        let observed = find_master(SENTINEL_INFO, "mymaster").unwrap().unwrap();
        assert_eq!(observed.address, Endpoint::new("10.0.0.1", 6379));
        assert_eq!(observed.status, MasterStatus::ODown);

        assert_eq!(find_master(SENTINEL_INFO, "other").unwrap(), None);
    }

    #[test]
    fn test_info_skips_non_record_lines() {
        let info = "master_repl_offset:100\r\nmaster_link_status:up\r\n";
        assert!(parse_info_masters(info).unwrap().is_empty());
    }

    #[test]
    fn test_info_malformed_record_is_error() {
        let info = "master0:name=mymaster,status=ok\r\n";
        assert!(matches!(
            parse_info_masters(info),
            Err(Error::UnexpectedReply { command: "INFO", .. })
        ));
    }

    fn peer(ip: &str, port: &str) -> RespValue {
        RespValue::Array(vec![
            RespValue::bulk_string("name"),
            RespValue::bulk_string(&format!("{}:{}", ip, port)),
            RespValue::bulk_string("ip"),
            RespValue::bulk_string(ip),
            RespValue::bulk_string("port"),
            RespValue::bulk_string(port),
            RespValue::bulk_string("flags"),
            RespValue::bulk_string("sentinel"),
        ])
    }

    #[test]
    fn test_parse_sentinels() {
        let reply = RespValue::Array(vec![peer("10.0.0.2", "26379"), peer("10.0.0.3", "26380")]);
        let peers = parse_sentinels(reply).unwrap();
        assert_eq!(
            peers,
            vec![
                Endpoint::new("10.0.0.2", 26379),
                Endpoint::new("10.0.0.3", 26380)
            ]
        );
    }

    #[test]
    fn test_parse_sentinels_rejects_odd_pairs() {
        let reply = RespValue::Array(vec![RespValue::Array(vec![RespValue::bulk_string("ip")])]);
        assert!(parse_sentinels(reply).is_err());
        assert!(parse_sentinels(RespValue::Integer(3)).is_err());
    }

    #[test]
    fn test_parse_master_addr() {
        let reply = RespValue::Array(vec![
            RespValue::bulk_string("10.0.0.2"),
            RespValue::bulk_string("6379"),
        ]);
        assert_eq!(
            parse_master_addr(reply).unwrap(),
            Some(Endpoint::new("10.0.0.2", 6379))
        );
        assert_eq!(parse_master_addr(RespValue::Null).unwrap(), None);
        assert!(parse_master_addr(RespValue::Array(vec![])).is_err());
    }

    #[test]
    fn test_parse_is_down() {
        let reply = RespValue::Array(vec![
            RespValue::Integer(0),
            RespValue::bulk_string("*"),
            RespValue::Integer(0),
        ]);
        assert_eq!(
            parse_is_down(reply).unwrap(),
            DownVerdict {
                down: false,
                leader: None
            }
        );

        let reply = RespValue::Array(vec![
            RespValue::Integer(1),
            RespValue::bulk_string("abc123"),
            RespValue::Integer(4),
        ]);
        let verdict = parse_is_down(reply).unwrap();
        assert!(verdict.down);
        assert_eq!(verdict.leader.as_deref(), Some("abc123"));

        assert!(parse_is_down(RespValue::Array(vec![RespValue::Integer(7)])).is_err());
    }
}

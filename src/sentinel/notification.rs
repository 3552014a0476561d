//! Sentinel Pub/Sub Notifications
//!
//! Sentinels publish their state transitions on channels named after the
//! event (`+switch-master`, `+odown`, ...). Payloads are space separated:
//!
//! - `+switch-master`, `+redirect-to-master`:
//!   `<master-name> <old-ip> <old-port> <new-ip> <new-port>`
//! - instance events (`+odown`, `-odown`, `+try-failover`, `+reboot`, ...):
//!   `<type> <name> <ip> <port> [@ <master-name> <master-ip> <master-port>]`
//! - `+sentinel`: `sentinel <id> <ip> <port> @ <master-name> <master-ip> <master-port>`

use super::state::Endpoint;

/// Notification that changes the client's view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The master moved (or came back) at this address
    MasterAvailable(Endpoint),
    /// Master health flipped
    HealthyChange(bool),
    /// A sentinel announced itself
    SentinelAnnounced(Endpoint),
}

/// Outcome of classifying one published message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Act(Notification),
    /// Known channel, nothing to do (other master, failover sub-phase, ...)
    Ignore,
    /// Channel not part of the sentinel event set
    Unknown,
}

/// Channels sentinels publish whose events don't affect the client decision
const IGNORED_CHANNELS: &[&str] = &[
    "+reset-master",
    "+slave",
    "-dup-sentinel",
    "+sdown",
    "-sdown",
    "+new-epoch",
    "+elected-leader",
    "+failover-state-select-slave",
    "-no-good-slave",
    "+selected-slave",
    "+failover-state-send-slaveof-noone",
    "+failover-state-wait-promotion",
    "+failover-state-reconf-slaves",
    "+slave-reconf-sent",
    "+slave-reconf-inprog",
    "+slave-reconf-done",
    "+failover-end-for-timeout",
    "+failover-end",
    "-failover-abort-not-elected",
    "-failover-abort",
    "+failover-detected",
    "+promoted-slave",
    "+tilt",
    "-tilt",
    "+config-update-queued",
    "+convert-to-slave",
    "+fix-slave-config",
    "+monitor",
    "-monitor",
    "+set",
    "-role-change",
    "+role-change",
    "__sentinel__:hello",
];

/// Classify a message published by a sentinel for the given master name
pub fn classify(channel: &str, payload: &str, master_name: &str) -> Classified {
    let fields: Vec<&str> = payload.split_whitespace().collect();

    match channel {
        "+switch-master" | "+redirect-to-master" => {
            if fields.first() != Some(&master_name) {
                return Classified::Ignore;
            }
            address_at(&fields, 3).map_or(Classified::Ignore, |ep| {
                Classified::Act(Notification::MasterAvailable(ep))
            })
        }
        "+reboot" => {
            if !is_master_event(&fields, master_name) {
                return Classified::Ignore;
            }
            address_at(&fields, 2).map_or(Classified::Ignore, |ep| {
                Classified::Act(Notification::MasterAvailable(ep))
            })
        }
        "+odown" | "+try-failover" => {
            if is_master_event(&fields, master_name) {
                Classified::Act(Notification::HealthyChange(false))
            } else {
                Classified::Ignore
            }
        }
        "-odown" => {
            if is_master_event(&fields, master_name) {
                Classified::Act(Notification::HealthyChange(true))
            } else {
                Classified::Ignore
            }
        }
        "+sentinel" => {
            if fields.first() != Some(&"sentinel") {
                return Classified::Ignore;
            }
            // Only sentinels watching our master are of interest
            if let Some(at) = fields.iter().position(|f| *f == "@") {
                if fields.get(at + 1) != Some(&master_name) {
                    return Classified::Ignore;
                }
            }
            address_at(&fields, 2).map_or(Classified::Ignore, |ep| {
                Classified::Act(Notification::SentinelAnnounced(ep))
            })
        }
        other if IGNORED_CHANNELS.contains(&other) => Classified::Ignore,
        _ => Classified::Unknown,
    }
}

/// `master <name> ...` for our master name
fn is_master_event(fields: &[&str], master_name: &str) -> bool {
    fields.first() == Some(&"master") && fields.get(1) == Some(&master_name)
}

/// Host at `fields[offset]`, port at `fields[offset + 1]`
fn address_at(fields: &[&str], offset: usize) -> Option<Endpoint> {
    let host = fields.get(offset)?;
    let port = fields.get(offset + 1)?;
    Endpoint::from_parts(host, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_master() {
        assert_eq!(
            classify(
                "+switch-master",
                "mymaster 10.0.0.1 6379 10.0.0.2 6380",
                "mymaster"
            ),
            Classified::Act(Notification::MasterAvailable(Endpoint::new(
                "10.0.0.2", 6380
            )))
        );
    }

    #[test]
    fn test_switch_master_other_name_ignored() {
        assert_eq!(
            classify("+switch-master", "cache 10.0.0.1 6379 10.0.0.2 6380", "mymaster"),
            Classified::Ignore
        );
    }

    #[test]
    fn test_truncated_payload_ignored() {
        assert_eq!(
            classify("+switch-master", "mymaster 10.0.0.1 6379", "mymaster"),
            Classified::Ignore
        );
    }

    #[test]
    fn test_odown_transitions() {
        assert_eq!(
            classify("+odown", "master mymaster 10.0.0.1 6379 #quorum 2", "mymaster"),
            Classified::Act(Notification::HealthyChange(false))
        );
        assert_eq!(
            classify("-odown", "master mymaster 10.0.0.1 6379", "mymaster"),
            Classified::Act(Notification::HealthyChange(true))
        );
        assert_eq!(
            classify("+try-failover", "master mymaster 10.0.0.1 6379", "mymaster"),
            Classified::Act(Notification::HealthyChange(false))
        );
    }

    #[test]
    fn test_odown_on_non_master_ignored() {
        assert_eq!(
            classify(
                "+odown",
                "slave 10.0.0.3:6379 10.0.0.3 6379 @ mymaster 10.0.0.1 6379",
                "mymaster"
            ),
            Classified::Ignore
        );
    }

    #[test]
    fn test_reboot() {
        assert_eq!(
            classify("+reboot", "master mymaster 10.0.0.1 6379", "mymaster"),
            Classified::Act(Notification::MasterAvailable(Endpoint::new(
                "10.0.0.1", 6379
            )))
        );
    }

    #[test]
    fn test_sentinel_announcement() {
        assert_eq!(
            classify(
                "+sentinel",
                "sentinel 10.0.0.7:26379 10.0.0.7 26379 @ mymaster 10.0.0.1 6379",
                "mymaster"
            ),
            Classified::Act(Notification::SentinelAnnounced(Endpoint::new(
                "10.0.0.7", 26379
            )))
        );
        assert_eq!(
            classify(
                "+sentinel",
                "sentinel 10.0.0.7:26379 10.0.0.7 26379 @ cache 10.0.0.9 6380",
                "mymaster"
            ),
            Classified::Ignore
        );
    }

    #[test]
    fn test_failover_phases_ignored_and_unknown_reported() {
        assert_eq!(
            classify("+failover-state-select-slave", "master mymaster 10.0.0.1 6379", "mymaster"),
            Classified::Ignore
        );
        assert_eq!(classify("+mystery", "x", "mymaster"), Classified::Unknown);
    }
}

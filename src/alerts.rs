//! User alerts
//! The fleet decides when an alert fires; an [`AlertSink`] decides how it is
//! shown. Alerts carry a stable id derived from their key so a repeated alert
//! for the same device replaces the previous one instead of stacking.

use log::warn;

/// Key of the storage-exhaustion alert
pub const MEMORY_ALERT_KEY: &str = "memory_alert";

const ALERT_TITLE: &str = "Sensors check";

/// Non-negative 32-bit id: CRC-32 of the UTF-8 key with the sign bit masked.
pub fn notification_id(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes()) & 0x7FFF_FFFF
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub id: u32,
    pub key: String,
    pub title: String,
    pub text: String,
}

impl Alert {
    pub fn new(key: &str, text: impl Into<String>) -> Self {
        Self {
            id: notification_id(key),
            key: key.to_string(),
            title: ALERT_TITLE.to_string(),
            text: text.into(),
        }
    }
}

/// Fire-and-forget alert output
pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: Alert);
}

/// Writes alerts to the log
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, alert: Alert) {
        warn!("[{} #{}] {}", alert.title, alert.id, alert.text);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const MACS: [&str; 5] = [
        "C8:4B:2A:11:90:01",
        "C8:4B:2A:11:90:02",
        "E3:0F:6D:5A:12:7C",
        "D1:22:33:44:55:66",
        "F7:A9:00:BE:EF:42",
    ];

    #[test]
    fn id_is_deterministic() {
        for mac in MACS {
            assert_eq!(notification_id(mac), notification_id(mac));
            assert_eq!(Alert::new(mac, "a").id, Alert::new(mac, "b").id);
        }
    }

    #[test]
    fn id_matches_masked_crc32() {
        // CRC-32 of "123456789" is 0xCBF43926
        assert_eq!(notification_id("123456789"), 0xCBF4_3926 & 0x7FFF_FFFF);
    }

    #[test]
    fn distinct_addresses_get_distinct_non_negative_ids() {
        let ids: Vec<u32> = MACS.iter().map(|m| notification_id(m)).collect();
        for (i, id) in ids.iter().enumerate() {
            assert!(*id <= i32::MAX as u32);
            assert!(!ids[i + 1..].contains(id));
        }
        assert_ne!(notification_id(MEMORY_ALERT_KEY), ids[0]);
    }
}

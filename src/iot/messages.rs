//! Typed IoT payloads and their wire codecs.
//!
//! Everything travels as UTF-8 JSON: binary `data` fields are lowercase
//! hex, timestamps are ISO-8601 with millisecond precision, and unset
//! optional fields are omitted from the encoded document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form extension object carried alongside the payload.
pub type Extension = Map<String, Value>;

/// Lowercase-hex codec for binary `data` fields.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

/// ISO-8601 timestamp codec with millisecond precision.
pub(crate) mod ts_ms {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        time: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&text)
            .map(|time| time.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Uplink data as seen by an application: device payload plus the
/// routing facts resolved by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppUlData {
    pub data_id: String,
    /// Device-side time of the payload.
    #[serde(with = "ts_ms")]
    pub time: DateTime<Utc>,
    /// Broker-side publish time.
    #[serde(rename = "pub", with = "ts_ms")]
    pub publish: DateTime<Utc>,
    pub device_id: String,
    pub network_id: String,
    pub network_code: String,
    pub network_addr: String,
    pub is_public: bool,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<Extension>,
}

/// Downlink request from an application. Address either by `device_id`
/// or by the `network_code`/`network_addr` pair, never both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDlData {
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_addr: Option<String>,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<Extension>,
}

/// Immediate broker answer to a downlink request: either the assigned
/// data id or the rejection reason.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDlDataResp {
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Final delivery report for a downlink. Negative `status` means still
/// processing, zero success, positive an error class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDlDataResult {
    pub data_id: String,
    pub status: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Uplink report from a network adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetUlData {
    #[serde(with = "ts_ms")]
    pub time: DateTime<Utc>,
    pub network_addr: String,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<Extension>,
}

/// Downlink as seen by a network adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetDlData {
    pub data_id: String,
    /// Broker-side publish time.
    #[serde(rename = "pub", with = "ts_ms")]
    pub publish: DateTime<Utc>,
    /// Validity window in milliseconds.
    pub expires_in: i64,
    pub network_addr: String,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<Extension>,
}

/// Delivery report from a network adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetDlDataResult {
    pub data_id: String,
    pub status: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Single-device control payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CtrlDevice {
    pub network_addr: String,
}

/// Bulk control payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CtrlDeviceBulk {
    pub network_addrs: Vec<String>,
}

/// Address-range control payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CtrlDeviceRange {
    pub start_addr: String,
    pub end_addr: String,
}

/// Control message to a network adapter, tagged by `operation` with a
/// `new` payload matching the operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation")]
pub enum NetCtrlMsg {
    #[serde(rename = "add-device")]
    AddDevice {
        #[serde(with = "ts_ms")]
        time: DateTime<Utc>,
        new: CtrlDevice,
    },
    #[serde(rename = "add-device-bulk")]
    AddDeviceBulk {
        #[serde(with = "ts_ms")]
        time: DateTime<Utc>,
        new: CtrlDeviceBulk,
    },
    #[serde(rename = "add-device-range")]
    AddDeviceRange {
        #[serde(with = "ts_ms")]
        time: DateTime<Utc>,
        new: CtrlDeviceRange,
    },
    #[serde(rename = "del-device")]
    DelDevice {
        #[serde(with = "ts_ms")]
        time: DateTime<Utc>,
        new: CtrlDevice,
    },
    #[serde(rename = "del-device-bulk")]
    DelDeviceBulk {
        #[serde(with = "ts_ms")]
        time: DateTime<Utc>,
        new: CtrlDeviceBulk,
    },
    #[serde(rename = "del-device-range")]
    DelDeviceRange {
        #[serde(with = "ts_ms")]
        time: DateTime<Utc>,
        new: CtrlDeviceRange,
    },
}
